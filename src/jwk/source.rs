//! Issuer → JWK Set resolution.

// crates.io
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	error::{ConfigError, TransientError, VerifyError},
	http::TokenHttpClient,
	jwk::JwkSet,
	oauth::{self, TransportErrorMapper},
	obs,
	provider::ProviderDescriptor,
};
#[cfg(feature = "reqwest")]
use crate::{http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

/// Boxed future returned by [`JwkSetSource`].
pub type JwkFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<JwkSet>>> + 'a + Send>>;

/// Supplies the JWK Set published by an issuer.
pub trait JwkSetSource
where
	Self: 'static + Send + Sync,
{
	/// Returns the key set for `issuer`.
	fn jwk_set<'a>(&'a self, issuer: &'a str) -> JwkFuture<'a>;
}

/// Fixed issuer → key set map, for pinned keys.
#[derive(Clone, Debug, Default)]
pub struct StaticJwkSetSource(HashMap<String, Arc<JwkSet>>);
impl StaticJwkSetSource {
	/// Adds or replaces the set for `issuer`.
	pub fn with_set(mut self, issuer: impl Into<String>, set: JwkSet) -> Self {
		self.0.insert(issuer.into(), Arc::new(set));

		self
	}
}
impl JwkSetSource for StaticJwkSetSource {
	fn jwk_set<'a>(&'a self, issuer: &'a str) -> JwkFuture<'a> {
		Box::pin(async move {
			self.0
				.get(issuer)
				.cloned()
				.ok_or_else(|| VerifyError::UntrustedIssuer { issuer: issuer.to_owned() }.into())
		})
	}
}

/// Fetches key sets over HTTP for registered issuers.
///
/// Issuers registered with [`HttpJwkSetSource::register`] use their JWKS URL directly. Issuers
/// registered with [`HttpJwkSetSource::register_discovery`] are resolved once through
/// `{issuer}/.well-known/openid-configuration`. Every other issuer is rejected with
/// [`VerifyError::UntrustedIssuer`] before any request is made.
pub struct HttpJwkSetSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	http_client: Arc<C>,
	error_mapper: Arc<M>,
	// `None` marks an issuer whose JWKS URL is not discovered yet.
	endpoints: RwLock<HashMap<String, Option<Url>>>,
}
impl<C, M> HttpJwkSetSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a source that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		http_client: impl Into<Arc<C>>,
		error_mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			http_client: http_client.into(),
			error_mapper: error_mapper.into(),
			endpoints: Default::default(),
		}
	}

	/// Pins the JWKS URL of `issuer`.
	pub fn register(&self, issuer: impl Into<String>, jwks_url: Url) {
		self.endpoints.write().insert(issuer.into(), Some(jwks_url));
	}

	/// Trusts `issuer` and finds its JWKS URL through OIDC discovery on first use.
	pub fn register_discovery(&self, issuer: impl Into<String>) {
		self.endpoints.write().entry(issuer.into()).or_insert(None);
	}

	/// Trusts the descriptor's issuer, pinning its JWKS endpoint when it declares one.
	pub fn register_descriptor(&self, descriptor: &ProviderDescriptor) {
		let Some(issuer) = &descriptor.issuer else {
			return;
		};

		match &descriptor.endpoints.jwks {
			Some(jwks) => self.register(issuer.clone(), jwks.clone()),
			None => self.register_discovery(issuer.clone()),
		}
	}

	async fn resolve(&self, issuer: &str) -> Result<Url> {
		let entry = self.endpoints.read().get(issuer).cloned();
		let Some(pinned) = entry else {
			return Err(VerifyError::UntrustedIssuer { issuer: issuer.to_owned() }.into());
		};

		if let Some(url) = pinned {
			return Ok(url);
		}

		let discovery = Url::parse(&format!(
			"{}/.well-known/openid-configuration",
			issuer.trim_end_matches('/')
		))
		.map_err(|source| ConfigError::InvalidDescriptor { source })?;
		let document = oauth::get_json::<_, _, Value>(
			self.http_client.as_ref(),
			self.error_mapper.as_ref(),
			&discovery,
		)
		.await?;

		if document.get("issuer").and_then(Value::as_str) != Some(issuer) {
			return Err(TransientError::Endpoint {
				message: format!("Discovery document of {issuer} advertises another issuer"),
				status: None,
				retry_after: None,
			}
			.into());
		}

		let jwks_uri = document.get("jwks_uri").and_then(Value::as_str).ok_or_else(|| {
			TransientError::Endpoint {
				message: format!("Discovery document of {issuer} has no jwks_uri"),
				status: None,
				retry_after: None,
			}
		})?;
		let url = Url::parse(jwks_uri).map_err(|source| ConfigError::InvalidDescriptor { source })?;

		obs::log_event("jwk.discovered", &url);
		self.register(issuer, url.clone());

		Ok(url)
	}
}
#[cfg(feature = "reqwest")]
impl HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a source with its own reqwest transport.
	pub fn new() -> Self {
		Self::with_http_client(ReqwestHttpClient::default(), ReqwestTransportErrorMapper)
	}
}
#[cfg(feature = "reqwest")]
impl Default for HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	fn default() -> Self {
		Self::new()
	}
}
impl<C, M> JwkSetSource for HttpJwkSetSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn jwk_set<'a>(&'a self, issuer: &'a str) -> JwkFuture<'a> {
		Box::pin(async move {
			let url = self.resolve(issuer).await?;
			let set = oauth::get_json::<_, _, JwkSet>(
				self.http_client.as_ref(),
				self.error_mapper.as_ref(),
				&url,
			)
			.await?;

			Ok(Arc::new(set))
		})
	}
}
impl<C, M> Debug for HttpJwkSetSource<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("HttpJwkSetSource").field("endpoints", &*self.endpoints.read()).finish()
	}
}

/// Read-through cache in front of another source.
pub struct CachedJwkSetSource<S> {
	inner: S,
	ttl: Duration,
	clock: Arc<dyn Clock>,
	entries: RwLock<HashMap<String, (OffsetDateTime, Arc<JwkSet>)>>,
}
impl<S> CachedJwkSetSource<S>
where
	S: JwkSetSource,
{
	/// Default entry lifetime (1 hour).
	pub const DEFAULT_TTL: Duration = Duration::hours(1);

	/// Wraps `inner` with the default TTL and the system clock.
	pub fn new(inner: S) -> Self {
		Self {
			inner,
			ttl: Self::DEFAULT_TTL,
			clock: Arc::new(SystemClock),
			entries: Default::default(),
		}
	}

	/// Overrides the entry lifetime.
	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = ttl;

		self
	}

	/// Overrides the clock.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;

		self
	}

	/// Drops the cached set for `issuer`, e.g. after a key rotation.
	pub fn invalidate(&self, issuer: &str) {
		self.entries.write().remove(issuer);
	}
}
impl<S> JwkSetSource for CachedJwkSetSource<S>
where
	S: JwkSetSource,
{
	fn jwk_set<'a>(&'a self, issuer: &'a str) -> JwkFuture<'a> {
		Box::pin(async move {
			let now = self.clock.now();
			let cached = self
				.entries
				.read()
				.get(issuer)
				.filter(|(expires_at, _)| *expires_at > now)
				.map(|(_, set)| set.clone());

			if let Some(set) = cached {
				return Ok(set);
			}

			let set = self.inner.jwk_set(issuer).await?;

			{
				let mut entries = self.entries.write();

				entries.retain(|_, (expires_at, _)| *expires_at > now);
				entries.insert(issuer.to_owned(), (now + self.ttl, set.clone()));
			}

			Ok(set)
		})
	}
}
impl<S> Debug for CachedJwkSetSource<S> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CachedJwkSetSource").field("ttl", &self.ttl).finish()
	}
}
