//! Walks through an authorization-code + PKCE round trip against a mock provider: build the
//! authorize URL, answer the redirect, exchange the code, and hand the tokens to a manager.

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use serde::{Deserialize, Serialize};
use url::Url;
// self
use oauth2_token_broker::{
	auth::{ProviderId, TokenIdentity},
	clock::SystemClock,
	flows::{AuthorizationCodeConfig, AuthorizationCodeFlow, CallbackParams, StateStore},
	http::ReqwestHttpClient,
	manager::AccessTokenManager,
	oauth::{Oauth2Client, ReqwestTransportErrorMapper},
	provider::{ClientAuthMethod, GrantType, ProviderDescriptor},
	reqwest::Client,
	store::{KeyValueStore, MemoryStore},
};

type DemoClient = Oauth2Client<ReqwestHttpClient, ReqwestTransportErrorMapper>;

const REDIRECT_URI: &str = "https://app.example.com/oauth/callback";

#[derive(Debug, Serialize, Deserialize)]
struct ReturnTo {
	path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"demo-access\",\"token_type\":\"bearer\",\"expires_in\":900,\
				 \"refresh_token\":\"demo-refresh\"}",
			);
		})
		.await;
	let descriptor = ProviderDescriptor::builder(ProviderId::new("demo-provider")?)
		.authorization_endpoint(Url::parse(&server.url("/authorize"))?)
		.token_endpoint(Url::parse(&server.url("/token"))?)
		.support_grants([GrantType::AuthorizationCode, GrantType::RefreshToken])
		.preferred_client_auth_method(ClientAuthMethod::NoneWithPkce)
		.build()?;
	let http_client = ReqwestHttpClient::with_client(
		Client::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()?,
	);
	let client = Arc::new(DemoClient::with_http_client(
		descriptor.clone(),
		"demo-client",
		None,
		http_client,
		ReqwestTransportErrorMapper,
	)?);
	let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
	let states = StateStore::open(store.clone(), Arc::new(SystemClock)).await?;
	let flow = AuthorizationCodeFlow::new(
		&descriptor,
		"demo-client",
		client.clone(),
		states,
		AuthorizationCodeConfig::new(Url::parse(REDIRECT_URI)?),
	)?;
	let authorize_url = flow
		.generate_url(["openid", "profile"], ReturnTo { path: "/dashboard".into() }, &[])
		.await?;

	println!("Send your user to {authorize_url}.");

	// Simulate the provider redirecting back with a code for the same state.
	let state = authorize_url
		.query_pairs()
		.find(|(key, _)| key == "state")
		.map(|(_, value)| value.into_owned())
		.unwrap_or_default();
	let redirect = Url::parse(&format!("{REDIRECT_URI}?code=demo-code&state={state}"))?;
	let Some(params) = CallbackParams::from_url(&redirect) else {
		eprintln!("Redirect `{redirect}` carried no state.");

		return Ok(());
	};
	let (response, return_to) = flow.handle_callback::<ReturnTo>(params).await?;
	let manager = AccessTokenManager::builder(TokenIdentity::new("demo-app")?)
		.store(store)
		.endpoint(client)
		.build()?;
	let info = manager.save(&response).await?;

	println!("Stored a {} token; resume at {}.", info.token_type, return_to.path);
	println!("Authorization header: {}.", info.authorization_header());

	token_mock.assert_async().await;

	Ok(())
}
