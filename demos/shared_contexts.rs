//! Runs two contexts over one store and one bus: both ask for a token at once, only one of
//! them refreshes, and a listener on the other sees the new token arrive.

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use time::Duration;
use url::Url;
// self
use oauth2_token_broker::{
	auth::{ContextId, ProviderId, TokenIdentity, TokenSecret},
	bus::{LocalBus, MessageBus},
	http::ReqwestHttpClient,
	manager::AccessTokenManager,
	oauth::{Oauth2Client, ReqwestTransportErrorMapper, TokenEndpoint, TokenResponse},
	provider::{ClientAuthMethod, GrantType, ProviderDescriptor},
	reqwest::Client,
	store::{KeyValueStore, MemoryStore},
};

type DemoClient = Oauth2Client<ReqwestHttpClient, ReqwestTransportErrorMapper>;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let refresh_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"refreshed-access\",\"token_type\":\"Bearer\",\
				 \"expires_in\":3600,\"refresh_token\":\"rotated-refresh\"}",
			);
		})
		.await;
	let descriptor = ProviderDescriptor::builder(ProviderId::new("demo-provider")?)
		.token_endpoint(Url::parse(&server.url("/token"))?)
		.support_grant(GrantType::RefreshToken)
		.preferred_client_auth_method(ClientAuthMethod::ClientSecretBasic)
		.build()?;
	let http_client = ReqwestHttpClient::with_client(
		Client::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()?,
	);
	let endpoint: Arc<dyn TokenEndpoint> = Arc::new(DemoClient::with_http_client(
		descriptor,
		"demo-client",
		Some("demo-secret".into()),
		http_client,
		ReqwestTransportErrorMapper,
	)?);
	let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
	let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
	let identity = TokenIdentity::new("demo-app")?;
	let mut contexts = Vec::new();

	for name in ["tab-1", "tab-2"] {
		contexts.push(
			AccessTokenManager::builder(identity.clone())
				.store(store.clone())
				.endpoint(endpoint.clone())
				.bus(bus.clone())
				.context_id(ContextId::new(name)?)
				.build()?,
		);
	}

	// Seed an already-expired access token next to a live refresh token.
	contexts[0]
		.save(&TokenResponse {
			access_token: TokenSecret::new("expired-access"),
			token_type: "Bearer".into(),
			expires_in: Some(Duration::ZERO),
			scope: None,
			refresh_token: Some(TokenSecret::new("demo-refresh")),
			raw: serde_json::json!({ "access_token": "expired-access" }),
		})
		.await?;

	let _subscription = contexts[1]
		.subscribe(|token| match token {
			Some(token) => println!("tab-2 listener: token of type {} is live.", token.token_type),
			None => println!("tab-2 listener: no usable token yet."),
		})
		.await?;
	let (lhs, rhs) = tokio::join!(contexts[0].load_or_refresh(), contexts[1].load_or_refresh());
	let (lhs, rhs) = (lhs?, rhs?);

	println!("Both tabs hold the same token: {}.", lhs == rhs);

	// Only one tab redeemed the refresh token.
	refresh_mock.assert_calls_async(1).await;

	Ok(())
}
