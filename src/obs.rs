//! Optional observability helpers for broker operations.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `oauth2_token_broker.flow` with the `flow`
//!   and `stage` (call site) fields, plus warn/debug events for suppressed failures.
//! - Enable `metrics` to increment the `oauth2_token_broker_flow_total` counter for every
//!   attempt/success/failure, labeled by `flow` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Broker operations observed by spans and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Cached read with refresh/renewal fallback.
	LoadOrRefresh,
	/// Refresh token grant.
	Refresh,
	/// Host-supplied external renewal.
	ExternalRenewal,
	/// Authorization Code + PKCE flow.
	AuthorizationCode,
	/// Forced token endpoint round trip.
	Fetch,
	/// JWT signature verification.
	JwkVerify,
	/// Cross-context lock acquisition.
	Lock,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::LoadOrRefresh => "load_or_refresh",
			FlowKind::Refresh => "refresh",
			FlowKind::ExternalRenewal => "external_renewal",
			FlowKind::AuthorizationCode => "authorization_code",
			FlowKind::Fetch => "fetch",
			FlowKind::JwkVerify => "jwk_verify",
			FlowKind::Lock => "lock",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a broker helper.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller or logged and suppressed.
	Failure,
	/// Operation abandoned because a peer context finished first.
	Cancelled,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
			FlowOutcome::Cancelled => "cancelled",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
