//! Client-side OAuth 2.0 token broker for applications running as several cooperating
//! contexts over one shared store: cached + refreshed access tokens under a cross-context
//! lock, Authorization Code + PKCE with persisted state, and JWK-based JWT verification.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod bus;
pub mod clock;
pub mod error;
pub mod flows;
pub mod http;
pub mod jwk;
pub mod lock;
pub mod manager;
pub mod oauth;
pub mod obs;
pub mod provider;
pub mod store;
#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		http::ReqwestHttpClient,
		oauth::{Oauth2Client, ReqwestTransportErrorMapper},
		provider::ProviderDescriptor,
	};

	/// Client type alias used by reqwest-backed integration tests.
	pub type ReqwestTestClient = Oauth2Client<ReqwestHttpClient, ReqwestTransportErrorMapper>;

	/// Builds a reqwest HTTP client that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	pub fn test_reqwest_http_client() -> ReqwestHttpClient {
		let client = ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestHttpClient::with_client(client)
	}

	/// Constructs an [`Oauth2Client`] over the insecure test transport.
	pub fn build_reqwest_test_client(
		descriptor: ProviderDescriptor,
		client_id: &str,
		client_secret: Option<&str>,
	) -> Arc<ReqwestTestClient> {
		let client = Oauth2Client::with_http_client(
			descriptor,
			client_id,
			client_secret.map(ToOwned::to_owned),
			test_reqwest_http_client(),
			ReqwestTransportErrorMapper,
		)
		.expect("Failed to build OAuth2 client for tests.");

		Arc::new(client)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use {color_eyre as _, httpmock as _};
