//! Broker-level error types shared across the manager, flows, lock, and verifiers.

// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem or missing capability.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary upstream failure; retry policy belongs to the caller.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure or OAuth error response.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Requested scopes are empty or malformed.
	#[error("Requested scopes are invalid: {0}")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// Authorization state lookup failed.
	#[error(transparent)]
	State(#[from] StateError),
	/// JWT signature verification could not produce an answer.
	#[error(transparent)]
	Verify(#[from] VerifyError),

	/// Every lifecycle fallback was exhausted without producing a usable access token.
	#[error("No usable access token is available.")]
	AccessTokenNotFound,
	/// No refresh token is stored for the identity.
	#[error("No refresh token is stored.")]
	RefreshTokenNotFound,
	/// The stored refresh token is past its expiry.
	#[error("The stored refresh token has expired.")]
	RefreshTokenExpired,
	/// The authorization server redirected back with an `error` parameter.
	#[error("Authorization was denied: {error}.")]
	AuthorizationDenied {
		/// OAuth error code from the callback.
		error: String,
		/// Optional human-readable description from the callback.
		description: Option<String>,
	},
}

/// Configuration and capability failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Provider descriptor contains an invalid URL.
	#[error("Descriptor contains an invalid URL.")]
	InvalidDescriptor {
		/// Underlying parsing failure.
		#[source]
		source: oauth2::url::ParseError,
	},
	/// Redirect URI cannot be parsed.
	#[error("Redirect URI is invalid.")]
	InvalidRedirect {
		/// Underlying parsing failure.
		#[source]
		source: oauth2::url::ParseError,
	},
	/// Descriptor does not enable the requested grant.
	#[error("Descriptor `{descriptor}` does not enable the {grant} grant.")]
	UnsupportedGrant {
		/// Provider identifier string.
		descriptor: String,
		/// Disabled grant label.
		grant: &'static str,
	},
	/// The coordination bus refused a subscription.
	#[error("Coordination bus is unavailable: {message}.")]
	BusUnavailable {
		/// Bus-supplied reason.
		message: String,
	},
	/// Background tasks need a Tokio runtime and none is running.
	#[error("A Tokio runtime is required to run broker background tasks.")]
	RuntimeUnavailable,
	/// A required collaborator was not supplied to a builder.
	#[error("Missing required collaborator: {0}.")]
	MissingCollaborator(&'static str),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary failure variants (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Endpoint returned an unexpected but non-fatal response.
	#[error("Endpoint returned an unexpected response: {message}.")]
	Endpoint {
		/// Broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Endpoint responded with malformed JSON that could not be parsed.
	#[error("Endpoint returned malformed JSON.")]
	ResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures and OAuth error responses.
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// The token endpoint answered with a non-2xx OAuth error body.
	#[error("Token endpoint returned `{error}`{}.", describe(.description))]
	ErrorResponse {
		/// OAuth `error` code.
		error: String,
		/// Optional `error_description`.
		description: Option<String>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling an OAuth endpoint.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling an OAuth endpoint.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Returns the OAuth error code when this wraps an error response.
	pub fn oauth_error(&self) -> Option<&str> {
		match self {
			Self::ErrorResponse { error, .. } => Some(error),
			_ => None,
		}
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

fn describe(description: &Option<String>) -> String {
	description.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

/// Authorization state lookup failures.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum StateError {
	/// No record exists for the state identifier.
	#[error("Authorization state was not found.")]
	NotFound,
	/// The record existed but its TTL had elapsed.
	#[error("Authorization state has expired.")]
	Expired,
}

/// JWT/JWK verification failures.
#[derive(Debug, ThisError)]
pub enum VerifyError {
	/// The token has no signature segment.
	#[error("Token does not carry a signature.")]
	SignatureNotFound,
	/// The token could not be split or decoded.
	#[error("Token is malformed: {reason}.")]
	MalformedToken {
		/// What failed to decode.
		reason: String,
	},
	/// Neither the header nor the claims name an issuer.
	#[error("Token does not name an issuer.")]
	IssuerNotFound,
	/// No key in the issuer's set survived `kid`/`alg` filtering.
	#[error("No key matched the token for issuer {issuer}.")]
	MatchedKeyNotFound {
		/// Issuer whose key set was searched.
		issuer: String,
	},
	/// A verifier checked the signature and it did not match.
	#[error("Token signature is invalid.")]
	InvalidSignature,
	/// Every verifier declined every candidate key.
	#[error("No verifier supports the matched keys.")]
	SupportedAlgorithmNotFound,
	/// The issuer was never registered with the key set source.
	#[error("Issuer {issuer} is not trusted.")]
	UntrustedIssuer {
		/// Issuer named by the token.
		issuer: String,
	},
	/// A verified token carries a claim other than the expected one.
	#[error("Token claim `{claim}` does not match `{expected}`.")]
	ClaimMismatch {
		/// Claim name (`iss`, `aud`).
		claim: &'static str,
		/// Value this client expects.
		expected: String,
	},
	/// The issuer's key set could not be located or fetched.
	#[error("Key set for issuer {issuer} is unavailable.")]
	KeySetUnavailable {
		/// Issuer whose key set was requested.
		issuer: String,
		/// Underlying failure.
		#[source]
		source: Box<Error>,
	},
}
