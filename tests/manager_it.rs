#![cfg(feature = "reqwest")]

// crates.io
use httpmock::prelude::*;
use time::macros;
// self
use oauth2_token_broker::{
	_preludet::*,
	auth::{
		AccessTokenData, AccessTokenInfo, ContextId, ProviderId, ScopeSet, StoredAccessToken,
		StoredRefreshToken, TokenIdentity, TokenSecret,
	},
	bus::{LocalBus, MessageBus},
	clock::{Clock, ManualClock},
	error::TransportError,
	manager::{AccessTokenManager, FnRenewal},
	oauth::{TokenGrant, TokenResponse},
	provider::{ClientAuthMethod, GrantType, ProviderDescriptor},
	store::{KeyValueStore, MemoryStore, StoreKey},
};

const CLIENT_ID: &str = "client-manager";
const CLIENT_SECRET: &str = "secret-manager";

fn identity() -> TokenIdentity {
	TokenIdentity::new("shared-app").expect("Identity fixture should be valid.")
}

fn build_descriptor(server: &MockServer) -> ProviderDescriptor {
	ProviderDescriptor::builder(
		ProviderId::new("mock-manager").expect("Failed to build provider identifier."),
	)
	.token_endpoint(Url::parse(&server.url("/token")).expect("Failed to parse token URL."))
	.support_grants([GrantType::RefreshToken, GrantType::ClientCredentials])
	.preferred_client_auth_method(ClientAuthMethod::ClientSecretPost)
	.build()
	.expect("Failed to build provider descriptor.")
}

async fn seed(store: &MemoryStore, access_expires_at: OffsetDateTime, refresh: &str) {
	let identity = identity();
	let access = StoredAccessToken {
		expires_at: access_expires_at,
		data: AccessTokenData {
			access_token: TokenSecret::new("stale-access"),
			token_type: "Bearer".into(),
			scope: None,
			raw_response: serde_json::json!({ "access_token": "stale-access" }),
		},
	};
	let refresh = StoredRefreshToken {
		expires_at: access_expires_at + Duration::days(30),
		token: TokenSecret::new(refresh),
	};

	store
		.store(
			&StoreKey::AccessToken(&identity).to_string(),
			serde_json::to_value(&access).expect("Access record should serialize."),
		)
		.await
		.expect("Seeding the access token should succeed.");
	store
		.store(
			&StoreKey::RefreshToken(&identity).to_string(),
			serde_json::to_value(&refresh).expect("Refresh record should serialize."),
		)
		.await
		.expect("Seeding the refresh token should succeed.");
}

fn build_manager(
	server: &MockServer,
	store: &MemoryStore,
	bus: &Arc<dyn MessageBus>,
	clock: &ManualClock,
	context: &str,
) -> AccessTokenManager {
	let endpoint =
		build_reqwest_test_client(build_descriptor(server), CLIENT_ID, Some(CLIENT_SECRET));

	AccessTokenManager::builder(identity())
		.store(Arc::new(store.clone()))
		.endpoint(endpoint)
		.bus(bus.clone())
		.clock(Arc::new(clock.clone()))
		.context_id(ContextId::new(context).expect("Context fixture should be valid."))
		.build()
		.expect("Manager should build inside a runtime.")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_contexts_refresh_exactly_once() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/token")
				.body_includes("grant_type=refresh_token")
				.body_includes("refresh_token=seed-refresh");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"fresh-access\",\"token_type\":\"bearer\",\
				 \"expires_in\":3600,\"refresh_token\":\"rotated-refresh\"}",
			);
		})
		.await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());

	seed(&store, clock.now() - Duration::minutes(5), "seed-refresh").await;

	let first = build_manager(&server, &store, &bus, &clock, "ctx-a");
	let second = build_manager(&server, &store, &bus, &clock, "ctx-b");
	let (lhs, rhs) = tokio::join!(first.load_or_refresh(), second.load_or_refresh());
	let lhs = lhs.expect("First context should obtain a token.");
	let rhs = rhs.expect("Second context should obtain a token.");

	assert_eq!(lhs, rhs);
	assert_eq!(lhs.authorization_header(), "Bearer fresh-access");
	mock.assert_calls_async(1).await;

	let refresh = first
		.refresh_token()
		.await
		.expect("Refresh token load should succeed.")
		.expect("Rotated refresh token should be stored.");

	assert_eq!(refresh.token.expose(), "rotated-refresh");
	assert_eq!(first.metrics().refresh_attempts() + second.metrics().refresh_attempts(), 1);
}

#[tokio::test]
async fn safety_buffer_marks_token_expired_early() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token").body_includes("grant_type=refresh_token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"second\",\"token_type\":\"Bearer\",\"expires_in\":600}",
			);
		})
		.await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
	let manager = build_manager(&server, &store, &bus, &clock, "ctx-solo");

	manager
		.save(&TokenResponse {
			access_token: TokenSecret::new("first"),
			token_type: "Bearer".into(),
			expires_in: Some(Duration::seconds(600)),
			scope: None,
			refresh_token: Some(TokenSecret::new("refresh-1")),
			raw: serde_json::json!({ "access_token": "first" }),
		})
		.await
		.expect("Save should succeed.");

	// 600s lifetime minus the 60s default buffer.
	clock.advance(Duration::seconds(539));

	let cached = manager.load_or_refresh().await.expect("Cached token should be served.");

	assert_eq!(cached.token.expose(), "first");
	mock.assert_calls_async(0).await;

	clock.advance(Duration::seconds(1));

	let refreshed = manager.load_or_refresh().await.expect("Token should be refreshed.");

	assert_eq!(refreshed.token.expose(), "second");
	mock.assert_calls_async(1).await;

	// The endpoint did not rotate the refresh token, so the old one stays.
	let refresh = manager
		.refresh_token()
		.await
		.expect("Refresh token load should succeed.")
		.expect("Refresh token should survive.");

	assert_eq!(refresh.token.expose(), "refresh-1");
}

#[tokio::test]
async fn invalid_grant_clears_refresh_token_and_reports_not_found() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(400).header("content-type", "application/json").body(
				"{\"error\":\"invalid_grant\",\"error_description\":\"Refresh token revoked.\"}",
			);
		})
		.await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());

	seed(&store, clock.now() - Duration::seconds(1), "revoked-refresh").await;

	let manager = build_manager(&server, &store, &bus, &clock, "ctx-revoked");
	let err = manager.load_or_refresh().await.expect_err("Revoked refresh token must fail.");

	assert!(matches!(err, Error::AccessTokenNotFound));
	assert!(
		manager.refresh_token().await.expect("Refresh token load should succeed.").is_none(),
		"invalid_grant must remove the refresh token."
	);
	mock.assert_calls_async(1).await;

	// A second call has nothing left to redeem.
	let err = manager.load_or_refresh().await.expect_err("Nothing usable is stored.");

	assert!(matches!(err, Error::AccessTokenNotFound));
	mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn fetch_persists_client_credentials_tokens() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/token")
				.body_includes("grant_type=client_credentials")
				.body_includes("scope=api.read")
				.body_includes("audience=billing");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"machine\",\"token_type\":\"Bearer\",\"expires_in\":900,\
				 \"scope\":\"api.read\"}",
			);
		})
		.await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
	let manager = build_manager(&server, &store, &bus, &clock, "ctx-fetch");
	let scope = ScopeSet::new(["api.read"])
		.expect("Scope fixture should be valid.");
	let info = manager
		.fetch(
			&TokenGrant::ClientCredentials { scope: Some(scope) },
			&[("audience".into(), "billing".into())],
		)
		.await
		.expect("Client credentials fetch should succeed.");

	assert_eq!(info.token.expose(), "machine");
	mock.assert_async().await;

	let stored = manager
		.access_token()
		.await
		.expect("Access token load should succeed.")
		.expect("Access token should be stored.");

	assert_eq!(stored.data.scope.as_deref(), Some("api.read"));
	assert_eq!(stored.expires_at, clock.now() + Duration::seconds(840));
	assert!(manager.refresh_token().await.expect("Refresh token load should succeed.").is_none());
}

#[tokio::test]
async fn server_errors_keep_the_refresh_token() {
	let server = MockServer::start_async().await;
	let _mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(400)
				.header("content-type", "application/json")
				.body("{\"error\":\"temporarily_unavailable\"}");
		})
		.await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
	let manager = build_manager(&server, &store, &bus, &clock, "ctx-retry");
	let err = manager
		.fetch(&TokenGrant::ClientCredentials { scope: None }, &[])
		.await
		.expect_err("Endpoint rejection should surface from fetch.");

	match err {
		Error::Transport(TransportError::ErrorResponse { error, status, .. }) => {
			assert_eq!(error, "temporarily_unavailable");
			assert_eq!(status, Some(400));
		},
		other => panic!("Unexpected error variant: {other:?}."),
	}

	seed(&store, clock.now() - Duration::seconds(1), "kept-refresh").await;

	let err = manager.load_or_refresh().await.expect_err("Refresh should fail.");

	assert!(matches!(err, Error::AccessTokenNotFound));
	assert!(manager.refresh_token().await.expect("Refresh token load should succeed.").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_observe_tokens_stored_by_renewal() {
	let server = MockServer::start_async().await;
	let clock = ManualClock::new(macros::datetime!(2025-03-01 12:00 UTC));
	let store = MemoryStore::default();
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
	let renewing = AccessTokenManager::builder(identity())
		.store(Arc::new(store.clone()))
		.endpoint(build_reqwest_test_client(build_descriptor(&server), CLIENT_ID, None))
		.bus(bus.clone())
		.clock(Arc::new(clock.clone()))
		.renewal(Arc::new(FnRenewal::new(|_cancel| async {
			Ok(Some(TokenResponse {
				access_token: TokenSecret::new("renewed"),
				token_type: "Bearer".into(),
				expires_in: Some(Duration::hours(1)),
				scope: None,
				refresh_token: None,
				raw: serde_json::json!({ "access_token": "renewed" }),
			}))
		})))
		.build()
		.expect("Manager should build.");
	let observer = build_manager(&server, &store, &bus, &clock, "ctx-observer");
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let _subscription = observer
		.subscribe(move |value: Option<&AccessTokenInfo>| {
			let _ = tx.send(value.map(|info| info.token.expose().to_owned()));
		})
		.await
		.expect("Subscribe should succeed.");

	assert_eq!(rx.recv().await, Some(None), "Subscribers first see the current state.");

	let info = renewing.load_or_refresh().await.expect("Renewal should produce a token.");

	assert_eq!(info.token.expose(), "renewed");

	let seen = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
		.await
		.expect("Observer should be notified of the peer's write.");

	assert_eq!(seen, Some(Some("renewed".to_owned())));
	assert_eq!(
		observer.load_or_refresh().await.expect("Peer token should be served.").token.expose(),
		"renewed"
	);
	assert_eq!(renewing.metrics().renewals(), 1);
}
