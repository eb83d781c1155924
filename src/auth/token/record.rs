//! Stored token records, lifetime policy, and the caller-facing token view.

// self
use crate::{_prelude::*, auth::token::secret::TokenSecret, oauth::TokenResponse};

/// Lifetime rules applied whenever a token response is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
	/// Subtracted from every computed expiry so tokens are never used right at expiry.
	pub safety_buffer: Duration,
	/// Lifetime assumed when the token endpoint omits `expires_in`.
	pub default_lifetime: Duration,
	/// Lifetime recorded for refresh tokens; token endpoints do not report one.
	pub refresh_token_lifetime: Duration,
}
impl TokenPolicy {
	/// Default safety buffer (60 seconds).
	pub const DEFAULT_SAFETY_BUFFER: Duration = Duration::seconds(60);
	/// Default access-token lifetime (1 hour).
	pub const DEFAULT_LIFETIME: Duration = Duration::hours(1);
	/// Default refresh-token lifetime (30 days).
	pub const DEFAULT_REFRESH_LIFETIME: Duration = Duration::days(30);
	/// Longest lifetime ever recorded; larger `expires_in` values are clamped to it.
	pub const MAX_LIFETIME: Duration = Duration::days(3650);

	/// Overrides the safety buffer; negative values clamp to zero.
	pub fn with_safety_buffer(mut self, buffer: Duration) -> Self {
		self.safety_buffer = if buffer.is_negative() { Duration::ZERO } else { buffer };

		self
	}

	/// Overrides the fallback access-token lifetime.
	pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
		self.default_lifetime = lifetime;

		self
	}

	/// Overrides the refresh-token lifetime.
	pub fn with_refresh_token_lifetime(mut self, lifetime: Duration) -> Self {
		self.refresh_token_lifetime = lifetime;

		self
	}

	/// Computes `now + (expires_in or default) - safety_buffer`.
	///
	/// The lifetime is clamped to `0..=MAX_LIFETIME` and the result saturates instead of
	/// overflowing.
	pub fn access_expiry(
		&self,
		now: OffsetDateTime,
		expires_in: Option<Duration>,
	) -> OffsetDateTime {
		self.expiry(now, expires_in.unwrap_or(self.default_lifetime))
	}

	/// Computes the refresh-token expiry for a token written at `now`.
	pub fn refresh_expiry(&self, now: OffsetDateTime) -> OffsetDateTime {
		self.expiry(now, self.refresh_token_lifetime)
	}

	fn expiry(&self, now: OffsetDateTime, lifetime: Duration) -> OffsetDateTime {
		let lifetime = lifetime.clamp(Duration::ZERO, Self::MAX_LIFETIME);

		now.saturating_add(lifetime.saturating_sub(self.safety_buffer))
	}
}
impl Default for TokenPolicy {
	fn default() -> Self {
		Self {
			safety_buffer: Self::DEFAULT_SAFETY_BUFFER,
			default_lifetime: Self::DEFAULT_LIFETIME,
			refresh_token_lifetime: Self::DEFAULT_REFRESH_LIFETIME,
		}
	}
}

/// Payload of a cached access token.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenData {
	/// Access token secret; callers must avoid logging it.
	pub access_token: TokenSecret,
	/// Token type reported by the endpoint (usually `Bearer`).
	pub token_type: String,
	/// Space-delimited scope string, when the endpoint reported one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
	/// Full JSON body returned by the token endpoint.
	pub raw_response: serde_json::Value,
}
impl Debug for AccessTokenData {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessTokenData")
			.field("access_token", &"<redacted>")
			.field("token_type", &self.token_type)
			.field("scope", &self.scope)
			.finish()
	}
}

/// Access token record persisted under the identity's access-token key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAccessToken {
	/// Instant after which the token must not be handed out.
	pub expires_at: OffsetDateTime,
	/// Token payload.
	pub data: AccessTokenData,
}
impl StoredAccessToken {
	/// Builds a record from a token endpoint response received at `now`.
	pub fn from_response(
		response: &TokenResponse,
		now: OffsetDateTime,
		policy: &TokenPolicy,
	) -> Self {
		Self {
			expires_at: policy.access_expiry(now, response.expires_in),
			data: AccessTokenData {
				access_token: response.access_token.clone(),
				token_type: response.token_type.clone(),
				scope: response.scope.clone(),
				raw_response: response.raw.clone(),
			},
		}
	}

	/// Returns `true` while `expires_at` is strictly in the future of `instant`.
	pub fn is_usable_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at > instant
	}

	/// Projects the minimal caller-facing view.
	pub fn info(&self) -> AccessTokenInfo {
		AccessTokenInfo {
			token_type: self.data.token_type.clone(),
			token: self.data.access_token.clone(),
		}
	}
}

/// Refresh token record persisted under the identity's refresh-token key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRefreshToken {
	/// Instant after which the refresh token is treated as dead.
	pub expires_at: OffsetDateTime,
	/// Refresh token secret.
	pub token: TokenSecret,
}
impl StoredRefreshToken {
	/// Returns `true` while `expires_at` is strictly in the future of `instant`.
	pub fn is_usable_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at > instant
	}
}

/// Minimal access token view exposed to callers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenInfo {
	/// Token type, e.g. `Bearer`.
	#[serde(rename = "type")]
	pub token_type: String,
	/// Access token secret.
	pub token: TokenSecret,
}
impl AccessTokenInfo {
	/// Formats the value for an HTTP `Authorization` header.
	pub fn authorization_header(&self) -> String {
		format!("{} {}", self.token_type, self.token.expose())
	}
}
impl Debug for AccessTokenInfo {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessTokenInfo")
			.field("type", &self.token_type)
			.field("token", &"<redacted>")
			.finish()
	}
}
