//! Token endpoint client built on the `oauth2` crate, plus transport error mapping.

pub use oauth2;

// std
use std::borrow::Cow;
// crates.io
use oauth2::{
	AsyncHttpClient, AuthType, AuthorizationCode, ClientId, ClientSecret, EndpointNotSet,
	EndpointSet, ExtraTokenFields, HttpClientError, PkceCodeVerifier, RedirectUrl, RefreshToken,
	RequestTokenError, ResourceOwnerPassword, ResourceOwnerUsername, Scope, StandardRevocableToken,
	StandardTokenResponse, TokenResponse as _, TokenUrl,
	basic::{
		BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
		BasicTokenType,
	},
};
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, TokenSecret},
	error::{ConfigError, TransientError, TransportError},
	http::{self, ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
	provider::{ClientAuthMethod, GrantType, ProviderDescriptor},
};
#[cfg(feature = "reqwest")]
use crate::http::ReqwestHttpClient;

type RawTokenResponse = StandardTokenResponse<RawExtraFields, BasicTokenType>;
type ConfiguredClient = oauth2::Client<
	BasicErrorResponse,
	RawTokenResponse,
	BasicTokenIntrospectionResponse,
	StandardRevocableToken,
	BasicRevocationErrorResponse,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointNotSet,
	EndpointSet,
>;

/// Boxed future returned by [`TokenEndpoint`].
pub type TokenFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Response members outside the RFC 6749 core set (e.g. `id_token`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawExtraFields(pub BTreeMap<String, serde_json::Value>);
impl ExtraTokenFields for RawExtraFields {}

/// Grant request sent to the token endpoint.
#[derive(Clone)]
pub enum TokenGrant {
	/// `authorization_code` grant.
	AuthorizationCode {
		/// Code returned on the redirect.
		code: String,
		/// PKCE verifier stored with the authorization state.
		code_verifier: Option<String>,
		/// Redirect URI used when the code was requested.
		redirect_uri: Option<Url>,
	},
	/// `refresh_token` grant.
	RefreshToken {
		/// Refresh token to redeem.
		refresh_token: TokenSecret,
		/// Optional narrowed scope.
		scope: Option<ScopeSet>,
	},
	/// `password` grant.
	Password {
		/// Resource owner username.
		username: String,
		/// Resource owner password.
		password: TokenSecret,
		/// Requested scope.
		scope: Option<ScopeSet>,
	},
	/// `client_credentials` grant.
	ClientCredentials {
		/// Requested scope.
		scope: Option<ScopeSet>,
	},
}
impl TokenGrant {
	/// Grant type identifier.
	pub fn grant_type(&self) -> GrantType {
		match self {
			Self::AuthorizationCode { .. } => GrantType::AuthorizationCode,
			Self::RefreshToken { .. } => GrantType::RefreshToken,
			Self::Password { .. } => GrantType::Password,
			Self::ClientCredentials { .. } => GrantType::ClientCredentials,
		}
	}
}
impl Debug for TokenGrant {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::AuthorizationCode { redirect_uri, code_verifier, .. } => f
				.debug_struct("AuthorizationCode")
				.field("code", &"<redacted>")
				.field("pkce", &code_verifier.is_some())
				.field("redirect_uri", redirect_uri)
				.finish(),
			Self::RefreshToken { scope, .. } =>
				f.debug_struct("RefreshToken").field("scope", scope).finish(),
			Self::Password { username, scope, .. } =>
				f.debug_struct("Password")
					.field("username", username)
					.field("scope", scope)
					.finish(),
			Self::ClientCredentials { scope } =>
				f.debug_struct("ClientCredentials").field("scope", scope).finish(),
		}
	}
}

/// Successful token endpoint response.
#[derive(Clone, Debug)]
pub struct TokenResponse {
	/// Issued access token.
	pub access_token: TokenSecret,
	/// Token type; `bearer` in any case is reported as `Bearer`.
	pub token_type: String,
	/// Reported lifetime.
	pub expires_in: Option<Duration>,
	/// Granted scope string.
	pub scope: Option<String>,
	/// Rotated or newly issued refresh token.
	pub refresh_token: Option<TokenSecret>,
	/// Full JSON body.
	pub raw: serde_json::Value,
}
impl TokenResponse {
	/// Returns the OIDC `id_token` member, if present.
	pub fn id_token(&self) -> Option<&str> {
		self.raw.get("id_token").and_then(|v| v.as_str())
	}

	fn from_oauth2(response: RawTokenResponse) -> Result<Self> {
		let raw = serde_json::to_value(&response).map_err(|e| TransientError::Endpoint {
			message: format!("Token response could not be re-encoded: {e}"),
			status: None,
			retry_after: None,
		})?;
		// The oauth2 crate folds `Bearer` to lowercase; restore the RFC 6750 spelling.
		let token_type = match response.token_type().as_ref() {
			kind if kind.eq_ignore_ascii_case("bearer") => "Bearer".to_owned(),
			kind => kind.to_owned(),
		};

		Ok(Self {
			access_token: TokenSecret::new(response.access_token().secret().to_owned()),
			token_type,
			expires_in: response.expires_in().and_then(|d| Duration::try_from(d).ok()),
			scope: response.scopes().map(|scopes| {
				scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
			}),
			refresh_token: response
				.refresh_token()
				.map(|token| TokenSecret::new(token.secret().to_owned())),
			raw,
		})
	}
}

/// Type-erased token endpoint used by the manager and flows.
pub trait TokenEndpoint
where
	Self: 'static + Send + Sync,
{
	/// Sends `grant` (plus `extra_params`) to the token endpoint.
	fn request_token<'a>(
		&'a self,
		grant: &'a TokenGrant,
		extra_params: &'a [(String, String)],
	) -> TokenFuture<'a, TokenResponse>;
}

/// Maps HTTP transport failures into broker [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(&self, metadata: Option<&ResponseMetadata>, error: HttpClientError<E>)
	-> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(meta, *inner),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => TransportError::Io(inner).into(),
			HttpClientError::Other(message) => map_generic_transport_error(meta, message),
			_ => map_unknown_transport_error(meta),
		}
	}
}

/// OAuth 2.0 client bound to one provider descriptor and one client registration.
pub struct Oauth2Client<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	descriptor: ProviderDescriptor,
	client_id: String,
	oauth_client: ConfiguredClient,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> Oauth2Client<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a client that reuses the caller-provided transport + mapper pair.
	///
	/// The secret is ignored when the descriptor prefers [`ClientAuthMethod::NoneWithPkce`].
	pub fn with_http_client(
		descriptor: ProviderDescriptor,
		client_id: impl Into<String>,
		client_secret: Option<String>,
		http_client: impl Into<Arc<C>>,
		error_mapper: impl Into<Arc<M>>,
	) -> Result<Self> {
		let client_id = client_id.into();
		let token_url = TokenUrl::new(descriptor.endpoints.token.to_string())
			.map_err(|source| ConfigError::InvalidDescriptor { source })?;
		let mut oauth_client = oauth2::Client::new(ClientId::new(client_id.clone()))
			.set_token_uri(token_url);

		match descriptor.preferred_client_auth_method {
			ClientAuthMethod::NoneWithPkce => {
				oauth_client = oauth_client.set_auth_type(AuthType::RequestBody);
			},
			method => {
				if let Some(secret) = client_secret {
					oauth_client = oauth_client.set_client_secret(ClientSecret::new(secret));
				}
				if method == ClientAuthMethod::ClientSecretPost {
					oauth_client = oauth_client.set_auth_type(AuthType::RequestBody);
				}
			},
		}

		Ok(Self {
			descriptor,
			client_id,
			oauth_client,
			http_client: http_client.into(),
			error_mapper: error_mapper.into(),
		})
	}

	/// Provider descriptor backing this client.
	pub fn descriptor(&self) -> &ProviderDescriptor {
		&self.descriptor
	}

	/// Registered client identifier.
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// Shared HTTP transport.
	pub fn http_client(&self) -> Arc<C> {
		self.http_client.clone()
	}

	/// Shared transport error mapper.
	pub fn error_mapper(&self) -> Arc<M> {
		self.error_mapper.clone()
	}

	async fn send(
		&self,
		grant: &TokenGrant,
		extra_params: &[(String, String)],
	) -> Result<TokenResponse> {
		let grant_type = grant.grant_type();

		if !self.descriptor.supports(grant_type) {
			return Err(ConfigError::UnsupportedGrant {
				descriptor: self.descriptor.id.to_string(),
				grant: grant_type.as_str(),
			}
			.into());
		}

		let meta = ResponseMetadataSlot::default();
		let handle = self.http_client.with_metadata(meta.clone());
		let outcome = match grant {
			TokenGrant::AuthorizationCode { code, code_verifier, redirect_uri } => {
				let mut request =
					self.oauth_client.exchange_code(AuthorizationCode::new(code.clone()));

				if let Some(verifier) = code_verifier {
					request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier.clone()));
				}
				if let Some(redirect) = redirect_uri {
					let redirect = RedirectUrl::new(redirect.to_string())
						.map_err(|source| ConfigError::InvalidRedirect { source })?;

					request = request.set_redirect_uri(Cow::Owned(redirect));
				}
				for (key, value) in extra_params {
					request = request.add_extra_param(key, value);
				}

				request.request_async(&handle).await
			},
			TokenGrant::RefreshToken { refresh_token, scope } => {
				let secret = RefreshToken::new(refresh_token.expose().to_owned());
				let mut request = self.oauth_client.exchange_refresh_token(&secret);

				for scope in scope.iter().flat_map(|set| set.iter()) {
					request = request.add_scope(Scope::new(scope.to_owned()));
				}
				for (key, value) in extra_params {
					request = request.add_extra_param(key, value);
				}

				request.request_async(&handle).await
			},
			TokenGrant::Password { username, password, scope } => {
				let username = ResourceOwnerUsername::new(username.clone());
				let password = ResourceOwnerPassword::new(password.expose().to_owned());
				let mut request = self.oauth_client.exchange_password(&username, &password);

				for scope in scope.iter().flat_map(|set| set.iter()) {
					request = request.add_scope(Scope::new(scope.to_owned()));
				}
				for (key, value) in extra_params {
					request = request.add_extra_param(key, value);
				}

				request.request_async(&handle).await
			},
			TokenGrant::ClientCredentials { scope } => {
				let mut request = self.oauth_client.exchange_client_credentials();

				for scope in scope.iter().flat_map(|set| set.iter()) {
					request = request.add_scope(Scope::new(scope.to_owned()));
				}
				for (key, value) in extra_params {
					request = request.add_extra_param(key, value);
				}

				request.request_async(&handle).await
			},
		};
		let response =
			outcome.map_err(|err| map_request_error(meta.take(), err, self.error_mapper.as_ref()))?;

		TokenResponse::from_oauth2(response)
	}

	/// Fetches and decodes a JSON document with a plain `GET` through the same transport.
	pub async fn get_json<T>(&self, url: &Url) -> Result<T>
	where
		T: DeserializeOwned,
	{
		get_json(self.http_client.as_ref(), self.error_mapper.as_ref(), url).await
	}
}
#[cfg(feature = "reqwest")]
impl Oauth2Client<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a client that provisions its own reqwest transport.
	pub fn new(
		descriptor: ProviderDescriptor,
		client_id: impl Into<String>,
		client_secret: Option<String>,
	) -> Result<Self> {
		Self::with_http_client(
			descriptor,
			client_id,
			client_secret,
			ReqwestHttpClient::default(),
			ReqwestTransportErrorMapper,
		)
	}
}
impl<C, M> TokenEndpoint for Oauth2Client<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn request_token<'a>(
		&'a self,
		grant: &'a TokenGrant,
		extra_params: &'a [(String, String)],
	) -> TokenFuture<'a, TokenResponse> {
		Box::pin(self.send(grant, extra_params))
	}
}
impl<C, M> Debug for Oauth2Client<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Oauth2Client")
			.field("descriptor", &self.descriptor.id)
			.field("client_id", &self.client_id)
			.finish()
	}
}

/// Sends a `GET` through `http_client` and decodes the JSON body.
pub async fn get_json<C, M, T>(http_client: &C, mapper: &M, url: &Url) -> Result<T>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
	T: DeserializeOwned,
{
	let meta = ResponseMetadataSlot::default();
	let handle = http_client.with_metadata(meta.clone());
	let request = http::json_get_request(url)?;
	let response = handle
		.call(request)
		.await
		.map_err(|err| mapper.map_transport_error(meta.take().as_ref(), err))?;
	let status = Some(response.status().as_u16());

	if !http::is_success(&response) {
		return Err(TransientError::Endpoint {
			message: format!("GET {url} answered {}", response.status()),
			status,
			retry_after: meta.take().and_then(|m| m.retry_after),
		}
		.into());
	}

	let mut deserializer = serde_json::Deserializer::from_slice(response.body());

	serde_path_to_error::deserialize(&mut deserializer)
		.map_err(|source| TransientError::ResponseParse { source, status }.into())
}

fn map_request_error<E, M>(
	meta: Option<ResponseMetadata>,
	err: RequestTokenError<HttpClientError<E>, BasicErrorResponse>,
	mapper: &M,
) -> Error
where
	E: 'static + Send + Sync + StdError,
	M: ?Sized + TransportErrorMapper<E>,
{
	let meta_ref = meta.as_ref();

	match err {
		RequestTokenError::ServerResponse(response) => TransportError::ErrorResponse {
			error: response.error().as_ref().to_owned(),
			description: response.error_description().cloned(),
			status: meta_status(meta_ref),
		}
		.into(),
		RequestTokenError::Request(error) => mapper.map_transport_error(meta_ref, error),
		RequestTokenError::Parse(error, _body) =>
			TransientError::ResponseParse { source: error, status: meta_status(meta_ref) }.into(),
		RequestTokenError::Other(message) => TransientError::Endpoint {
			message,
			status: meta_status(meta_ref),
			retry_after: meta_retry_after(meta_ref),
		}
		.into(),
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(meta: Option<&ResponseMetadata>, err: ReqwestError) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return TransientError::Endpoint {
			message: "Request timed out".into(),
			status: meta_status(meta).or_else(|| err.status().map(|code| code.as_u16())),
			retry_after: meta_retry_after(meta),
		}
		.into();
	}

	TransportError::from(err).into()
}

#[cfg(feature = "reqwest")]
fn map_generic_transport_error(meta: Option<&ResponseMetadata>, message: impl Display) -> Error {
	TransientError::Endpoint {
		message: format!("HTTP client error: {message}"),
		status: meta_status(meta),
		retry_after: meta_retry_after(meta),
	}
	.into()
}

#[cfg(feature = "reqwest")]
fn map_unknown_transport_error(meta: Option<&ResponseMetadata>) -> Error {
	TransientError::Endpoint {
		message: "Unknown HTTP client error".into(),
		status: meta_status(meta),
		retry_after: meta_retry_after(meta),
	}
	.into()
}

fn meta_status(meta: Option<&ResponseMetadata>) -> Option<u16> {
	meta.and_then(|value| value.status)
}

fn meta_retry_after(meta: Option<&ResponseMetadata>) -> Option<Duration> {
	meta.and_then(|value| value.retry_after)
}
