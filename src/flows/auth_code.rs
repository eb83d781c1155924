//! Authorization Code flow with optional PKCE and persisted state.

// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	auth::ScopeSet,
	error::ConfigError,
	flows::{
		pkce::{self, PkceMethod, PkcePair},
		state::{StateRecord, StateStore},
	},
	oauth::{TokenEndpoint, TokenGrant, TokenResponse},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	provider::{GrantType, ProviderDescriptor},
};

/// Settings for [`AuthorizationCodeFlow`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCodeConfig {
	/// Redirect URI registered with the provider.
	pub redirect_uri: Url,
	/// PKCE method; S256 unless overridden.
	#[serde(default)]
	pub pkce: PkceMethod,
	/// Lifetime of a state record.
	#[serde(default = "AuthorizationCodeConfig::default_state_ttl")]
	pub state_ttl: Duration,
}
impl AuthorizationCodeConfig {
	/// Default state lifetime (10 minutes).
	pub const DEFAULT_STATE_TTL: Duration = Duration::minutes(10);

	/// Creates a config with S256 PKCE and the default state TTL.
	pub fn new(redirect_uri: Url) -> Self {
		Self { redirect_uri, pkce: PkceMethod::default(), state_ttl: Self::DEFAULT_STATE_TTL }
	}

	/// Overrides the PKCE method.
	pub fn with_pkce(mut self, method: PkceMethod) -> Self {
		self.pkce = method;

		self
	}

	/// Overrides the state TTL.
	pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
		self.state_ttl = ttl;

		self
	}

	fn default_state_ttl() -> Duration {
		Self::DEFAULT_STATE_TTL
	}
}

/// Query parameters delivered to the redirect URI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackParams {
	/// State identifier echoed by the provider.
	pub state: String,
	/// Authorization code on success.
	pub code: Option<String>,
	/// OAuth error code on failure.
	pub error: Option<String>,
	/// Optional error description.
	pub error_description: Option<String>,
}
impl CallbackParams {
	/// Extracts callback parameters from the redirect URL's query string.
	///
	/// Returns `None` when no `state` parameter is present.
	pub fn from_url(url: &Url) -> Option<Self> {
		let mut params = Self::default();
		let mut has_state = false;

		for (key, value) in url.query_pairs() {
			match key.as_ref() {
				"state" => {
					params.state = value.into_owned();
					has_state = true;
				},
				"code" => params.code = Some(value.into_owned()),
				"error" => params.error = Some(value.into_owned()),
				"error_description" => params.error_description = Some(value.into_owned()),
				_ => {},
			}
		}

		has_state.then_some(params)
	}
}

/// Drives authorize-URL generation and code exchange for one client registration.
pub struct AuthorizationCodeFlow {
	authorization_endpoint: Url,
	client_id: String,
	endpoint: Arc<dyn TokenEndpoint>,
	states: StateStore,
	config: AuthorizationCodeConfig,
}
impl AuthorizationCodeFlow {
	/// Creates a flow; the descriptor must enable the `authorization_code` grant.
	pub fn new(
		descriptor: &ProviderDescriptor,
		client_id: impl Into<String>,
		endpoint: Arc<dyn TokenEndpoint>,
		states: StateStore,
		config: AuthorizationCodeConfig,
	) -> Result<Self> {
		let authorization_endpoint = descriptor
			.endpoints
			.authorization
			.clone()
			.filter(|_| descriptor.supports(GrantType::AuthorizationCode))
			.ok_or_else(|| ConfigError::UnsupportedGrant {
				descriptor: descriptor.id.to_string(),
				grant: GrantType::AuthorizationCode.as_str(),
			})?;

		Ok(Self { authorization_endpoint, client_id: client_id.into(), endpoint, states, config })
	}

	/// Flow configuration.
	pub fn config(&self) -> &AuthorizationCodeConfig {
		&self.config
	}

	/// Builds the authorize URL and stores a state record carrying `app_state`.
	///
	/// `scopes` must be non-empty and whitespace-free.
	pub async fn generate_url<I, S, T>(
		&self,
		scopes: I,
		app_state: T,
		additional_params: &[(String, String)],
	) -> Result<Url>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
		T: Serialize,
	{
		let scope = ScopeSet::required(scopes)?;
		let state = pkce::random_string(pkce::STATE_LEN);
		let pkce_pair = PkcePair::generate(self.config.pkce);
		let record = StateRecord {
			expires_at: self.states.now() + self.config.state_ttl,
			code_verifier: pkce_pair.as_ref().map(|pair| pair.verifier.clone()),
			data: app_state,
		};

		self.states.put(&state, &record).await?;

		let mut url = self.authorization_endpoint.clone();
		let mut pairs = url.query_pairs_mut();

		pairs.append_pair("response_type", "code");
		pairs.append_pair("client_id", &self.client_id);
		pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
		pairs.append_pair("scope", &scope.normalized());
		pairs.append_pair("state", &state);

		if let Some(pair) = pkce_pair.as_ref() {
			pairs.append_pair("code_challenge", &pair.challenge);

			if let Some(method) = pair.method.as_str() {
				pairs.append_pair("code_challenge_method", method);
			}
		}
		for (key, value) in additional_params {
			pairs.append_pair(key, value);
		}

		drop(pairs);

		Ok(url)
	}

	/// Consumes the state record and redeems `code` at the token endpoint.
	pub async fn exchange_code<T>(&self, state: &str, code: &str) -> Result<(TokenResponse, T)>
	where
		T: DeserializeOwned,
	{
		const KIND: FlowKind = FlowKind::AuthorizationCode;

		let span = FlowSpan::new(KIND, "exchange_code");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async move {
				let record = self.states.take::<T>(state).await?;
				let grant = TokenGrant::AuthorizationCode {
					code: code.to_owned(),
					code_verifier: record.code_verifier,
					redirect_uri: Some(self.config.redirect_uri.clone()),
				};
				let response = self.endpoint.request_token(&grant, &[]).await?;

				Ok((response, record.data))
			})
			.await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Deletes the record for `state` without exchanging, returning its application state.
	pub async fn clear_state<T>(&self, state: &str) -> Result<Option<T>>
	where
		T: DeserializeOwned,
	{
		match self.states.take::<T>(state).await {
			Ok(record) => Ok(Some(record.data)),
			Err(Error::State(_)) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Completes a redirect: exchanges the code, or clears the state and reports the denial.
	pub async fn handle_callback<T>(&self, params: CallbackParams) -> Result<(TokenResponse, T)>
	where
		T: DeserializeOwned,
	{
		if let Some(error) = params.error {
			self.clear_state::<serde_json::Value>(&params.state).await?;

			return Err(Error::AuthorizationDenied { error, description: params.error_description });
		}

		let Some(code) = params.code else {
			self.clear_state::<serde_json::Value>(&params.state).await?;

			return Err(Error::AuthorizationDenied {
				error: "invalid_request".into(),
				description: Some("Callback carried neither `code` nor `error`.".into()),
			});
		};

		self.exchange_code(&params.state, &code).await
	}
}
impl Debug for AuthorizationCodeFlow {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuthorizationCodeFlow")
			.field("authorization_endpoint", &self.authorization_endpoint)
			.field("client_id", &self.client_id)
			.field("config", &self.config)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	use time::macros;
	// self
	use super::*;
	use crate::{
		auth::{ProviderId, TokenSecret},
		clock::ManualClock,
		error::StateError,
		oauth::TokenFuture,
		store::MemoryStore,
	};

	#[derive(Default)]
	struct RecordingEndpoint(Mutex<Vec<String>>);
	impl TokenEndpoint for RecordingEndpoint {
		fn request_token<'a>(
			&'a self,
			grant: &'a TokenGrant,
			_extra_params: &'a [(String, String)],
		) -> TokenFuture<'a, TokenResponse> {
			Box::pin(async move {
				if let TokenGrant::AuthorizationCode { code_verifier, .. } = grant {
					self.0.lock().push(code_verifier.clone().unwrap_or_default());
				}

				Ok(TokenResponse {
					access_token: TokenSecret::new("access"),
					token_type: "Bearer".into(),
					expires_in: None,
					scope: None,
					refresh_token: None,
					raw: json!({ "access_token": "access", "token_type": "Bearer" }),
				})
			})
		}
	}

	async fn flow(
		pkce: PkceMethod,
	) -> (AuthorizationCodeFlow, Arc<RecordingEndpoint>, ManualClock) {
		let descriptor = ProviderDescriptor::builder(
			ProviderId::new("demo").expect("Provider id should be valid."),
		)
		.authorization_endpoint(
			Url::parse("https://idp.example/authorize").expect("URL fixture should parse."),
		)
		.token_endpoint(Url::parse("https://idp.example/token").expect("URL fixture should parse."))
		.support_grant(GrantType::AuthorizationCode)
		.build()
		.expect("Descriptor should build.");
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let states = StateStore::open(Arc::new(MemoryStore::default()), Arc::new(clock.clone()))
			.await
			.expect("State store should open.");
		let endpoint = Arc::new(RecordingEndpoint::default());
		let config = AuthorizationCodeConfig::new(
			Url::parse("https://app.example/callback").expect("URL fixture should parse."),
		)
		.with_pkce(pkce);
		let flow =
			AuthorizationCodeFlow::new(&descriptor, "client", endpoint.clone(), states, config)
				.expect("Flow should build.");

		(flow, endpoint, clock)
	}

	fn query(url: &Url) -> Vec<(String, String)> {
		url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
	}

	fn param(url: &Url, name: &str) -> String {
		query(url).into_iter().find(|(k, _)| k == name).map(|(_, v)| v).unwrap_or_default()
	}

	#[tokio::test]
	async fn authorize_url_lists_parameters_in_order() {
		let (flow, _, _) = flow(PkceMethod::S256).await;
		let url = flow
			.generate_url(["openid", "email"], json!({ "from": "/home" }), &[(
				"prompt".into(),
				"consent".into(),
			)])
			.await
			.expect("URL should build.");
		let pairs = query(&url);
		let names = pairs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();

		assert_eq!(names, vec![
			"response_type",
			"client_id",
			"redirect_uri",
			"scope",
			"state",
			"code_challenge",
			"code_challenge_method",
			"prompt",
		]);
		assert_eq!(pairs[3].1, "openid email");
		assert_eq!(pairs[4].1.len(), 32);
		assert_eq!(pairs[6].1, "S256");
	}

	#[tokio::test]
	async fn exchange_sends_stored_verifier_and_returns_app_state() {
		let (flow, endpoint, _) = flow(PkceMethod::S256).await;
		let url = flow
			.generate_url(["openid"], json!({ "from": "/home" }), &[])
			.await
			.expect("URL should build.");
		let state = param(&url, "state");
		let challenge = param(&url, "code_challenge");
		let (response, app_state) = flow
			.exchange_code::<serde_json::Value>(&state, "code")
			.await
			.expect("Exchange should succeed.");
		let verifier = endpoint.0.lock()[0].clone();

		assert_eq!(response.access_token.expose(), "access");
		assert_eq!(app_state, json!({ "from": "/home" }));
		assert_eq!(pkce::s256_challenge(&verifier), challenge);

		let err = flow
			.exchange_code::<serde_json::Value>(&state, "code")
			.await
			.expect_err("State must be single-use.");

		assert!(matches!(err, Error::State(StateError::NotFound)));
	}

	#[tokio::test]
	async fn pkce_none_omits_challenge_parameters() {
		let (flow, _, _) = flow(PkceMethod::None).await;
		let url = flow.generate_url(["openid"], (), &[]).await.expect("URL should build.");

		assert!(query(&url).iter().all(|(k, _)| !k.starts_with("code_challenge")));
	}

	#[tokio::test]
	async fn invalid_scopes_are_rejected() {
		let (flow, _, _) = flow(PkceMethod::S256).await;
		let empty = flow.generate_url(Vec::<String>::new(), (), &[]).await;
		let spaced = flow.generate_url(["open id"], (), &[]).await;

		assert!(matches!(empty, Err(Error::InvalidScope(_))));
		assert!(matches!(spaced, Err(Error::InvalidScope(_))));
	}

	#[tokio::test]
	async fn expired_state_is_reported() {
		let (flow, _, clock) = flow(PkceMethod::S256).await;
		let url = flow.generate_url(["openid"], (), &[]).await.expect("URL should build.");
		let params = CallbackParams::from_url(&url).expect("Authorize URL carries a state.");

		clock.advance(AuthorizationCodeConfig::DEFAULT_STATE_TTL + Duration::seconds(1));

		let err =
			flow.exchange_code::<()>(&params.state, "code").await.expect_err("State has expired.");

		assert!(matches!(err, Error::State(StateError::Expired)));
	}

	#[tokio::test]
	async fn callback_errors_clear_state() {
		let (flow, _, _) = flow(PkceMethod::S256).await;
		let url = flow.generate_url(["openid"], 7_u32, &[]).await.expect("URL should build.");
		let state = CallbackParams::from_url(&url).expect("Authorize URL carries a state.").state;
		let err = flow
			.handle_callback::<u32>(CallbackParams {
				state: state.clone(),
				error: Some("access_denied".into()),
				..Default::default()
			})
			.await
			.expect_err("Denied callbacks must fail.");

		assert!(matches!(
			err,
			Error::AuthorizationDenied { ref error, .. } if error == "access_denied"
		));
		assert_eq!(flow.clear_state::<u32>(&state).await.expect("Clear should succeed."), None);
	}
}
