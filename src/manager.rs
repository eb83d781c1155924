//! Access-token lifecycle shared by every context of one client identity.
//!
//! [`AccessTokenManager::load_or_refresh`] walks a fixed ladder: a usable cached token, then a
//! refresh grant, then the host's [`ExternalRenewal`], then [`Error::AccessTokenNotFound`].
//! Network work happens under the [`CoordinationLock`] and every step re-reads the store after
//! acquiring it, so at most one context talks to the token endpoint at a time. Callers of one
//! context that arrive while a pass is running join it and receive its outcome.

mod metrics;
mod renewal;
mod subscription;

pub use metrics::ManagerMetrics;
pub use renewal::*;
pub use subscription::Subscription;

// crates.io
use serde_json::Value;
use tokio::{
	sync::watch,
	task::JoinHandle,
	time::{self, Duration as StdDuration},
};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	auth::{
		AccessTokenInfo, ContextId, StoredAccessToken, StoredRefreshToken, TokenIdentity,
		TokenPolicy,
	},
	bus::MessageBus,
	clock::{Clock, SystemClock},
	error::{ConfigError, TransportError, VerifyError},
	jwk::{JsonObject, JwkVerificationDispatcher, JwtInfo},
	lock::{CoordinationLock, DEFAULT_NAMESPACE},
	oauth::{TokenEndpoint, TokenGrant, TokenResponse},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::{self, KeyValueStore, StoreError, StoreKey},
};
use subscription::Listeners;

/// Time a cancelled renewal gets to return before it is abandoned.
pub const RENEWAL_GRACE: StdDuration = StdDuration::from_secs(1);

type LadderOutcome = std::result::Result<AccessTokenInfo, LadderFailure>;
type PassReceiver = watch::Receiver<Option<LadderOutcome>>;

/// Cloneable failure of one ladder pass; refresh and renewal errors are logged, not returned.
#[derive(Clone, Debug)]
enum LadderFailure {
	Exhausted,
	Storage(StoreError),
}
impl From<StoreError> for LadderFailure {
	fn from(e: StoreError) -> Self {
		Self::Storage(e)
	}
}
impl From<LadderFailure> for Error {
	fn from(failure: LadderFailure) -> Self {
		match failure {
			LadderFailure::Exhausted => Error::AccessTokenNotFound,
			LadderFailure::Storage(e) => e.into(),
		}
	}
}

enum PassRole<'a> {
	Lead(PassLeader<'a>),
	Join(PassReceiver),
}

/// Publishes the outcome of a pass; the in-flight slot is cleared on drop, finished or not.
struct PassLeader<'a> {
	slot: &'a Mutex<Option<PassReceiver>>,
	sender: watch::Sender<Option<LadderOutcome>>,
}
impl PassLeader<'_> {
	fn finish(self, outcome: LadderOutcome) {
		self.sender.send_replace(Some(outcome));
	}
}
impl Drop for PassLeader<'_> {
	fn drop(&mut self) {
		self.slot.lock().take();
	}
}

struct IdTokenVerification {
	dispatcher: JwkVerificationDispatcher,
	issuer: String,
	audience: String,
}
impl IdTokenVerification {
	fn check_claims(&self, info: &JwtInfo) -> Result<(), VerifyError> {
		let issuer = Some(self.issuer.as_str());
		let claimed_issuer = info.claims.get("iss").and_then(Value::as_str);

		if info.issuer() != issuer || claimed_issuer != issuer {
			return Err(VerifyError::ClaimMismatch { claim: "iss", expected: self.issuer.clone() });
		}

		let audience_matches = match info.claims.get("aud") {
			Some(Value::String(aud)) => aud == &self.audience,
			Some(Value::Array(auds)) =>
				auds.iter().any(|aud| aud.as_str() == Some(self.audience.as_str())),
			_ => false,
		};

		if !audience_matches {
			let expected = self.audience.clone();

			return Err(VerifyError::ClaimMismatch { claim: "aud", expected });
		}

		Ok(())
	}
}

/// Assembles an [`AccessTokenManager`].
pub struct ManagerBuilder {
	identity: TokenIdentity,
	store: Option<Arc<dyn KeyValueStore>>,
	endpoint: Option<Arc<dyn TokenEndpoint>>,
	bus: Option<Arc<dyn MessageBus>>,
	renewal: Option<Arc<dyn ExternalRenewal>>,
	id_token: Option<IdTokenVerification>,
	clock: Arc<dyn Clock>,
	namespace: String,
	policy: TokenPolicy,
	context_id: Option<ContextId>,
}
impl ManagerBuilder {
	/// Shared key-value store (required).
	pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
		self.store = Some(store);

		self
	}

	/// Token endpoint client (required).
	pub fn endpoint(mut self, endpoint: Arc<dyn TokenEndpoint>) -> Self {
		self.endpoint = Some(endpoint);

		self
	}

	/// Bus reaching the other contexts; without one the lock only serializes this process.
	pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
		self.bus = Some(bus);

		self
	}

	/// Fallback used when no refresh token can produce a token.
	pub fn renewal(mut self, renewal: Arc<dyn ExternalRenewal>) -> Self {
		self.renewal = Some(renewal);

		self
	}

	/// Enables [`AccessTokenManager::verified_id_token_claims`].
	///
	/// Stored ID tokens must name `issuer` as `iss`, list `audience` (the client id) in `aud`,
	/// and carry a signature `dispatcher` accepts. Register only `issuer` with the dispatcher's
	/// key set source.
	pub fn id_token_verification(
		mut self,
		dispatcher: JwkVerificationDispatcher,
		issuer: impl Into<String>,
		audience: impl Into<String>,
	) -> Self {
		self.id_token = Some(IdTokenVerification {
			dispatcher,
			issuer: issuer.into(),
			audience: audience.into(),
		});

		self
	}

	/// Clock used for token expiry.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;

		self
	}

	/// Channel namespace shared by cooperating contexts.
	pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
		self.namespace = namespace.into();

		self
	}

	/// Lifetime rules for persisted tokens.
	pub fn policy(mut self, policy: TokenPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Fixes this context's lock tie-break id instead of a random one.
	pub fn context_id(mut self, context_id: ContextId) -> Self {
		self.context_id = Some(context_id);

		self
	}

	/// Validates collaborators, joins the lock channel, and starts the store watch.
	pub fn build(self) -> Result<AccessTokenManager> {
		let store = self.store.ok_or(ConfigError::MissingCollaborator("key-value store"))?;
		let endpoint = self.endpoint.ok_or(ConfigError::MissingCollaborator("token endpoint"))?;
		let lock = match self.bus {
			Some(bus) => CoordinationLock::new(
				bus,
				&self.namespace,
				&self.identity,
				self.context_id.unwrap_or_else(ContextId::random),
			)?,
			None => CoordinationLock::single_context(&self.identity),
		};
		let access_key = StoreKey::AccessToken(&self.identity).to_string();
		let refresh_key = StoreKey::RefreshToken(&self.identity).to_string();
		let inner = Arc::new(Inner {
			identity: self.identity,
			store,
			endpoint,
			lock,
			renewal: self.renewal,
			id_token: self.id_token,
			clock: self.clock,
			policy: self.policy,
			access_key,
			refresh_key,
			inflight: Mutex::new(None),
			listeners: Default::default(),
			metrics: Default::default(),
			forwarder: Mutex::new(None),
		});

		Inner::start_forwarder(&inner);

		Ok(AccessTokenManager { inner })
	}
}
impl Debug for ManagerBuilder {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ManagerBuilder")
			.field("identity", &self.identity)
			.field("namespace", &self.namespace)
			.field("policy", &self.policy)
			.finish_non_exhaustive()
	}
}

/// Caches, refreshes, and renews the access token of one identity.
///
/// Clones share state; create one manager per context.
#[derive(Clone)]
pub struct AccessTokenManager {
	inner: Arc<Inner>,
}
impl AccessTokenManager {
	/// Starts a builder for `identity`.
	pub fn builder(identity: TokenIdentity) -> ManagerBuilder {
		ManagerBuilder {
			identity,
			store: None,
			endpoint: None,
			bus: None,
			renewal: None,
			id_token: None,
			clock: Arc::new(SystemClock),
			namespace: DEFAULT_NAMESPACE.to_owned(),
			policy: TokenPolicy::default(),
			context_id: None,
		}
	}

	/// Identity served by this manager.
	pub fn identity(&self) -> &TokenIdentity {
		&self.inner.identity
	}

	/// Lock shared with the other contexts.
	pub fn lock(&self) -> &CoordinationLock {
		&self.inner.lock
	}

	/// Lifecycle counters.
	pub fn metrics(&self) -> &ManagerMetrics {
		&self.inner.metrics
	}

	/// Returns a usable access token, refreshing or renewing it when needed.
	pub async fn load_or_refresh(&self) -> Result<AccessTokenInfo> {
		const KIND: FlowKind = FlowKind::LoadOrRefresh;

		let span = FlowSpan::new(KIND, "load_or_refresh");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.inner.load_or_refresh()).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Sends `grant` to the token endpoint and persists the response.
	pub async fn fetch(
		&self,
		grant: &TokenGrant,
		extra_params: &[(String, String)],
	) -> Result<AccessTokenInfo> {
		const KIND: FlowKind = FlowKind::Fetch;

		let span = FlowSpan::new(KIND, "fetch");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async move {
				let guard = self.inner.lock.acquire().await;

				self.inner.metrics.record_token_request();

				let response = self.inner.endpoint.request_token(grant, extra_params).await?;
				let info = self.inner.persist(&response).await?;

				guard.release();

				Ok(info)
			})
			.await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Persists a response obtained elsewhere, e.g. by an authorization code exchange.
	///
	/// Does not wait for a running [`AccessTokenManager::load_or_refresh`].
	pub async fn save(&self, response: &TokenResponse) -> Result<AccessTokenInfo> {
		self.inner.persist(response).await
	}

	/// Deletes both tokens of the identity.
	pub async fn clear(&self) -> Result<()> {
		self.inner.store.remove(&self.inner.access_key).await?;
		self.inner.store.remove(&self.inner.refresh_key).await?;
		self.inner.listeners.notify(None);

		Ok(())
	}

	/// Raw stored access token, usable or not.
	pub async fn access_token(&self) -> Result<Option<StoredAccessToken>> {
		Ok(self.inner.stored_access().await?)
	}

	/// Raw stored refresh token, usable or not.
	pub async fn refresh_token(&self) -> Result<Option<StoredRefreshToken>> {
		Ok(self.inner.stored_refresh().await?)
	}

	/// Registers `listener` and immediately delivers the current usable token (or `None`).
	///
	/// The listener also fires when another context changes the stored token.
	pub async fn subscribe<F>(&self, listener: F) -> Result<Subscription>
	where
		F: 'static + Send + Sync + Fn(Option<&AccessTokenInfo>),
	{
		let subscription = self.inner.listeners.add(Arc::new(listener));
		let now = self.inner.clock.now();
		let current = self
			.inner
			.stored_access()
			.await?
			.filter(|token| token.is_usable_at(now))
			.map(|token| token.info());

		self.inner.listeners.deliver_to(subscription.id(), current.as_ref());

		Ok(subscription)
	}

	/// Verifies the stored `id_token` and returns its claims.
	///
	/// `Ok(None)` when no token or no `id_token` is stored.
	pub async fn verified_id_token_claims(&self) -> Result<Option<JsonObject>> {
		let check = self
			.inner
			.id_token
			.as_ref()
			.ok_or(ConfigError::MissingCollaborator("ID token verification"))?;
		let Some(stored) = self.inner.stored_access().await? else {
			return Ok(None);
		};
		let Some(id_token) = stored.data.raw_response.get("id_token").and_then(|v| v.as_str())
		else {
			return Ok(None);
		};
		let info = JwtInfo::parse(id_token)?;

		check.check_claims(&info)?;

		if !check.dispatcher.verify(&info).await? {
			return Err(VerifyError::InvalidSignature.into());
		}

		Ok(Some(info.claims))
	}
}
impl Debug for AccessTokenManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessTokenManager")
			.field("identity", &self.inner.identity)
			.field("lock", &self.inner.lock)
			.field("policy", &self.inner.policy)
			.finish()
	}
}

struct Inner {
	identity: TokenIdentity,
	store: Arc<dyn KeyValueStore>,
	endpoint: Arc<dyn TokenEndpoint>,
	lock: CoordinationLock,
	renewal: Option<Arc<dyn ExternalRenewal>>,
	id_token: Option<IdTokenVerification>,
	clock: Arc<dyn Clock>,
	policy: TokenPolicy,
	access_key: String,
	refresh_key: String,
	inflight: Mutex<Option<PassReceiver>>,
	listeners: Arc<Listeners>,
	metrics: ManagerMetrics,
	forwarder: Mutex<Option<JoinHandle<()>>>,
}
impl Inner {
	/// Forwards store changes of the access token (including other contexts' writes) to
	/// listeners. Skipped outside a Tokio runtime.
	fn start_forwarder(this: &Arc<Self>) {
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			obs::log_event("manager.forwarder.skipped", &this.identity);

			return;
		};
		let mut watch = this.store.watch(&this.access_key);
		let store = this.store.clone();
		let key = this.access_key.clone();
		let listeners = Arc::downgrade(&this.listeners);
		let handle = runtime.spawn(async move {
			// Events may be stale by the time they arrive; re-read instead of trusting them.
			while watch.changed().await.is_some() {
				let Some(listeners) = listeners.upgrade() else {
					break;
				};

				match store::load_record::<StoredAccessToken>(store.as_ref(), &key).await {
					Ok(token) => listeners.notify(token.map(|t| t.info()).as_ref()),
					Err(e) => obs::log_suppressed("manager.forwarder", &e),
				}
			}
		});

		*this.forwarder.lock() = Some(handle);
	}

	async fn load_or_refresh(&self) -> Result<AccessTokenInfo> {
		loop {
			let mut pass = match self.join_or_lead() {
				PassRole::Lead(leader) => {
					let outcome = self.ladder().await;

					leader.finish(outcome.clone());

					return outcome.map_err(Into::into);
				},
				PassRole::Join(pass) => pass,
			};

			let outcome = match pass.wait_for(|outcome| outcome.is_some()).await {
				Ok(outcome) => (*outcome).clone(),
				Err(_) => None,
			};

			// A leader dropped mid-pass publishes nothing; start a new pass then.
			if let Some(outcome) = outcome {
				return outcome.map_err(Into::into);
			}
		}
	}

	fn join_or_lead(&self) -> PassRole<'_> {
		let mut inflight = self.inflight.lock();

		if let Some(pass) = inflight.as_ref() {
			return PassRole::Join(pass.clone());
		}

		let (sender, receiver) = watch::channel(None);

		*inflight = Some(receiver);

		PassRole::Lead(PassLeader { slot: &self.inflight, sender })
	}

	async fn ladder(&self) -> LadderOutcome {
		let mut refresh_attempted = false;
		let mut renewal_attempted = false;

		loop {
			let now = self.clock.now();

			if let Some(token) = self.stored_access().await?
				&& token.is_usable_at(now)
			{
				return Ok(token.info());
			}
			if !refresh_attempted
				&& self.stored_refresh().await?.is_some_and(|token| token.is_usable_at(now))
			{
				refresh_attempted = true;

				if let Err(e) = self.refresh().await {
					obs::log_suppressed("manager.refresh", &e);
				}

				continue;
			}
			if !renewal_attempted && let Some(renewal) = self.renewal.clone() {
				renewal_attempted = true;

				match self.renew(renewal.as_ref()).await {
					Ok(true) => continue,
					Ok(false) => {},
					Err(e) => obs::log_suppressed("manager.renewal", &e),
				}
			}

			return Err(LadderFailure::Exhausted);
		}
	}

	/// Redeems the stored refresh token under the lock.
	async fn refresh(&self) -> Result<()> {
		const KIND: FlowKind = FlowKind::Refresh;

		let guard = self.lock.acquire().await;
		let now = self.clock.now();

		if self.stored_access().await?.is_some_and(|token| token.is_usable_at(now)) {
			guard.release();

			return Ok(());
		}

		let refresh = self.stored_refresh().await?.ok_or(Error::RefreshTokenNotFound)?;

		if !refresh.is_usable_at(now) {
			return Err(Error::RefreshTokenExpired);
		}

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		self.metrics.record_refresh_attempt();

		let grant = TokenGrant::RefreshToken { refresh_token: refresh.token, scope: None };
		let result = match self.endpoint.request_token(&grant, &[]).await {
			Ok(response) => self.persist(&response).await.map(|_| ()),
			Err(e) => {
				if let Error::Transport(transport) = &e
					&& transport.oauth_error() == Some("invalid_grant")
				{
					self.drop_refresh_token(transport).await;
				}

				Err(e)
			},
		};

		match &result {
			Ok(_) => {
				self.metrics.record_refresh_success();
				obs::record_flow_outcome(KIND, FlowOutcome::Success);
			},
			Err(_) => {
				self.metrics.record_refresh_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
			},
		}

		guard.release();

		result
	}

	async fn drop_refresh_token(&self, reason: &TransportError) {
		obs::log_event("manager.refresh.invalid_grant", reason);

		if let Err(e) = self.store.remove(&self.refresh_key).await {
			obs::log_suppressed("manager.refresh.remove", &e);
		}
	}

	/// Runs the external renewal under the lock.
	///
	/// Returns `true` when the store may now hold a usable token.
	async fn renew(&self, renewal: &dyn ExternalRenewal) -> Result<bool> {
		const KIND: FlowKind = FlowKind::ExternalRenewal;

		let guard = self.lock.acquire().await;
		let now = self.clock.now();

		if self.stored_access().await?.is_some_and(|token| token.is_usable_at(now)) {
			guard.release();

			return Ok(true);
		}

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);
		self.metrics.record_renewal();

		let mut peer_stored = self.lock.external_storing();
		let cancel = CancellationToken::new();
		let mut renewing = renewal.renew(cancel.clone());
		let mut cancelled = false;
		let outcome = tokio::select! {
			outcome = &mut renewing => outcome,
			_ = peer_stored.recv() => {
				cancelled = true;
				cancel.cancel();
				self.metrics.record_cancelled_renewal();
				obs::record_flow_outcome(KIND, FlowOutcome::Cancelled);

				time::timeout(RENEWAL_GRACE, &mut renewing).await.unwrap_or(Ok(None))
			},
		};
		let result = match outcome {
			Ok(Some(response)) => self.persist(&response).await.map(|_| true),
			Ok(None) => Ok(cancelled),
			Err(e) => Err(e),
		};

		if !cancelled {
			let outcome = if result.is_ok() { FlowOutcome::Success } else { FlowOutcome::Failure };

			obs::record_flow_outcome(KIND, outcome);
		}

		guard.release();

		result
	}

	/// Writes both records, notifies listeners, and tells peers a token was stored.
	async fn persist(&self, response: &TokenResponse) -> Result<AccessTokenInfo> {
		let now = self.clock.now();
		let access = StoredAccessToken::from_response(response, now, &self.policy);

		store::store_record(self.store.as_ref(), &self.access_key, &access).await?;

		if let Some(token) = &response.refresh_token {
			let refresh = StoredRefreshToken {
				expires_at: self.policy.refresh_expiry(now),
				token: token.clone(),
			};

			store::store_record(self.store.as_ref(), &self.refresh_key, &refresh).await?;
		}

		let info = access.info();

		self.listeners.notify(Some(&info));
		self.lock.broadcast_external_storing();

		Ok(info)
	}

	async fn stored_access(&self) -> Result<Option<StoredAccessToken>, StoreError> {
		store::load_record(self.store.as_ref(), &self.access_key).await
	}

	async fn stored_refresh(&self) -> Result<Option<StoredRefreshToken>, StoreError> {
		store::load_record(self.store.as_ref(), &self.refresh_key).await
	}
}
impl Drop for Inner {
	fn drop(&mut self) {
		if let Some(handle) = self.forwarder.lock().take() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// crates.io
	use ::time::macros;
	use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
	use jsonwebtoken::{Algorithm, EncodingKey, Header};
	use serde_json::json;
	use tokio::sync::Notify;
	// self
	use super::*;
	use crate::{
		auth::TokenSecret,
		clock::ManualClock,
		jwk::{Jwk, JwkSet, StaticJwkSetSource},
		oauth::TokenFuture,
		store::MemoryStore,
	};

	const ID_ISSUER: &str = "https://idp.example";
	const ID_SECRET: &[u8] = b"id-token-secret-0123456789abcdef";

	#[derive(Default)]
	struct ScriptedEndpoint {
		calls: AtomicUsize,
		fail_with: Option<&'static str>,
	}
	impl TokenEndpoint for ScriptedEndpoint {
		fn request_token<'a>(
			&'a self,
			_grant: &'a TokenGrant,
			_extra_params: &'a [(String, String)],
		) -> TokenFuture<'a, TokenResponse> {
			Box::pin(async move {
				tokio::task::yield_now().await;

				let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

				if let Some(error) = self.fail_with {
					return Err(TransportError::ErrorResponse {
						error: error.into(),
						description: None,
						status: Some(400),
					}
					.into());
				}

				Ok(response(&format!("access-{n}"), Some(&format!("refresh-{n}"))))
			})
		}
	}

	fn response(access: &str, refresh: Option<&str>) -> TokenResponse {
		TokenResponse {
			access_token: TokenSecret::new(access),
			token_type: "Bearer".into(),
			expires_in: Some(Duration::seconds(3600)),
			scope: None,
			refresh_token: refresh.map(TokenSecret::new),
			raw: json!({ "access_token": access }),
		}
	}

	fn manager(
		endpoint: Arc<ScriptedEndpoint>,
		clock: &ManualClock,
		renewal: Option<Arc<dyn ExternalRenewal>>,
	) -> (AccessTokenManager, MemoryStore) {
		let store = MemoryStore::default();
		let identity = TokenIdentity::new("app").expect("Identity should be valid.");
		let mut builder = AccessTokenManager::builder(identity)
			.store(Arc::new(store.clone()))
			.endpoint(endpoint)
			.clock(Arc::new(clock.clone()));

		if let Some(renewal) = renewal {
			builder = builder.renewal(renewal);
		}

		(builder.build().expect("Manager should build."), store)
	}

	#[tokio::test]
	async fn empty_store_without_renewal_reports_not_found() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let endpoint = Arc::new(ScriptedEndpoint::default());
		let (manager, _) = manager(endpoint.clone(), &clock, None);
		let err = manager.load_or_refresh().await.expect_err("Nothing is stored.");

		assert!(matches!(err, Error::AccessTokenNotFound));
		assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn expired_access_token_is_refreshed_once() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let endpoint = Arc::new(ScriptedEndpoint::default());
		let (manager, _) = manager(endpoint.clone(), &clock, None);

		manager.save(&response("initial", Some("refresh-0"))).await.expect("Save should succeed.");
		clock.advance(Duration::seconds(3540));

		let info = manager.load_or_refresh().await.expect("Refresh should succeed.");

		assert_eq!(info.token.expose(), "access-1");
		assert_eq!(
			manager.refresh_token().await.expect("Load should succeed.").map(|t| t.token),
			Some(TokenSecret::new("refresh-1"))
		);

		let again = manager.load_or_refresh().await.expect("Cached token should be served.");

		assert_eq!(again.token.expose(), "access-1");
		assert_eq!(manager.metrics().refresh_attempts(), 1);
		assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn invalid_grant_removes_refresh_token() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let endpoint =
			Arc::new(ScriptedEndpoint { fail_with: Some("invalid_grant"), ..Default::default() });
		let (manager, _) = manager(endpoint, &clock, None);

		manager.save(&response("initial", Some("dead"))).await.expect("Save should succeed.");
		clock.advance(Duration::hours(2));

		let err = manager.load_or_refresh().await.expect_err("Refresh must fail.");

		assert!(matches!(err, Error::AccessTokenNotFound));
		assert!(manager.refresh_token().await.expect("Load should succeed.").is_none());
		assert_eq!(manager.metrics().refresh_failures(), 1);
	}

	#[tokio::test]
	async fn failed_refresh_falls_through_to_renewal() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let endpoint =
			Arc::new(ScriptedEndpoint { fail_with: Some("server_error"), ..Default::default() });
		let renewal: Arc<dyn ExternalRenewal> = Arc::new(FnRenewal::new(|_cancel| async {
			Ok(Some(response("renewed", None)))
		}));
		let (manager, _) = manager(endpoint, &clock, Some(renewal));

		manager.save(&response("initial", Some("refresh-0"))).await.expect("Save should succeed.");
		clock.advance(Duration::hours(2));

		let info = manager.load_or_refresh().await.expect("Renewal should succeed.");

		assert_eq!(info.token.expose(), "renewed");
		assert_eq!(
			manager.refresh_token().await.expect("Load should succeed.").map(|t| t.token),
			Some(TokenSecret::new("refresh-0"))
		);
		assert_eq!(manager.metrics().renewals(), 1);
	}

	#[tokio::test]
	async fn concurrent_callers_share_one_pass() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let endpoint =
			Arc::new(ScriptedEndpoint { fail_with: Some("server_error"), ..Default::default() });
		let renewal: Arc<dyn ExternalRenewal> = Arc::new(FnRenewal::new(|_cancel| async {
			time::sleep(StdDuration::from_millis(10)).await;

			Err(Error::from(TransportError::ErrorResponse {
				error: "login_required".into(),
				description: None,
				status: Some(400),
			}))
		}));
		let (manager, _) = manager(endpoint.clone(), &clock, Some(renewal));

		manager.save(&response("initial", Some("refresh-0"))).await.expect("Save should succeed.");
		clock.advance(Duration::hours(2));

		let (a, b, c) = tokio::join!(
			manager.load_or_refresh(),
			manager.load_or_refresh(),
			manager.load_or_refresh()
		);

		for result in [a, b, c] {
			assert!(matches!(result, Err(Error::AccessTokenNotFound)));
		}

		assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
		assert_eq!(manager.metrics().renewals(), 1);
	}

	#[tokio::test]
	async fn save_and_clear_do_not_wait_for_a_pending_renewal() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let started = Arc::new(Notify::new());
		let signal = started.clone();
		let renewal: Arc<dyn ExternalRenewal> =
			Arc::new(FnRenewal::new(move |cancel: CancellationToken| {
				let signal = signal.clone();

				async move {
					signal.notify_one();
					cancel.cancelled().await;

					Ok(None)
				}
			}));
		let (manager, _) = manager(Arc::new(ScriptedEndpoint::default()), &clock, Some(renewal));
		let pending = tokio::spawn({
			let manager = manager.clone();

			async move { manager.load_or_refresh().await }
		});

		started.notified().await;
		time::timeout(StdDuration::from_secs(2), manager.clear())
			.await
			.expect("Clear must not wait for the renewal.")
			.expect("Clear should succeed.");

		let info = time::timeout(StdDuration::from_secs(2), manager.save(&response("saved", None)))
			.await
			.expect("Save must not wait for the renewal.")
			.expect("Save should succeed.");

		assert_eq!(info.token.expose(), "saved");

		pending.abort();
	}

	fn id_token(issuer: &str, audience: &str) -> String {
		let mut header = Header::new(Algorithm::HS256);

		header.kid = Some("k1".into());

		jsonwebtoken::encode(
			&header,
			&json!({ "iss": issuer, "aud": audience, "sub": "user-1" }),
			&EncodingKey::from_secret(ID_SECRET),
		)
		.expect("ID token should encode.")
	}

	fn with_id_token(id_token: String) -> TokenResponse {
		let mut response = response("access", None);

		response.raw = json!({ "access_token": "access", "id_token": id_token });

		response
	}

	#[tokio::test]
	async fn id_token_claims_require_the_expected_issuer_and_audience() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let key = Jwk {
			kty: "oct".into(),
			kid: Some("k1".into()),
			alg: Some("HS256".into()),
			k: Some(URL_SAFE_NO_PAD.encode(ID_SECRET)),
			..Default::default()
		};
		// A second trusted issuer sharing the key must still not pass for ours.
		let source = StaticJwkSetSource::default()
			.with_set(ID_ISSUER, JwkSet { keys: vec![key.clone()] })
			.with_set("https://other.example", JwkSet { keys: vec![key] });
		let manager = AccessTokenManager::builder(
			TokenIdentity::new("app").expect("Identity should be valid."),
		)
		.store(Arc::new(MemoryStore::default()))
		.endpoint(Arc::new(ScriptedEndpoint::default()))
		.clock(Arc::new(clock))
		.id_token_verification(
			JwkVerificationDispatcher::new(Arc::new(source)),
			ID_ISSUER,
			"client-1",
		)
		.build()
		.expect("Manager should build.");

		manager
			.save(&with_id_token(id_token(ID_ISSUER, "client-1")))
			.await
			.expect("Save should succeed.");

		let claims = manager
			.verified_id_token_claims()
			.await
			.expect("Verification should succeed.")
			.expect("An ID token is stored.");

		assert_eq!(claims.get("sub"), Some(&json!("user-1")));

		manager
			.save(&with_id_token(id_token("https://other.example", "client-1")))
			.await
			.expect("Save should succeed.");

		let err = manager
			.verified_id_token_claims()
			.await
			.expect_err("Tokens of another issuer must be rejected.");

		assert!(matches!(err, Error::Verify(VerifyError::ClaimMismatch { claim: "iss", .. })));

		manager
			.save(&with_id_token(id_token(ID_ISSUER, "someone-else")))
			.await
			.expect("Save should succeed.");

		let err = manager
			.verified_id_token_claims()
			.await
			.expect_err("Tokens minted for another client must be rejected.");

		assert!(matches!(err, Error::Verify(VerifyError::ClaimMismatch { claim: "aud", .. })));
	}

	#[tokio::test]
	async fn clear_removes_tokens_and_notifies() {
		let clock = ManualClock::new(macros::datetime!(2025-01-01 00:00 UTC));
		let (manager, store) = manager(Arc::new(ScriptedEndpoint::default()), &clock, None);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		let _subscription = manager
			.subscribe(move |value| {
				sink.lock().push(value.map(|info| info.token.expose().to_owned()));
			})
			.await
			.expect("Subscribe should succeed.");

		manager.save(&response("a", Some("r"))).await.expect("Save should succeed.");
		manager.clear().await.expect("Clear should succeed.");

		assert!(store.keys().await.expect("Keys should list.").is_empty());
		assert!(matches!(manager.load_or_refresh().await, Err(Error::AccessTokenNotFound)));
		assert_eq!(*seen.lock(), vec![None, Some("a".to_owned()), None]);
	}

	#[tokio::test]
	async fn build_requires_store_and_endpoint() {
		let identity = TokenIdentity::new("app").expect("Identity should be valid.");
		let err =
			AccessTokenManager::builder(identity).build().expect_err("Store is required.");

		assert!(matches!(err, Error::Config(ConfigError::MissingCollaborator(_))));
	}
}
