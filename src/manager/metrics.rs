// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for one manager's token lifecycle.
#[derive(Debug, Default)]
pub struct ManagerMetrics {
	refresh_attempts: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_failures: AtomicU64,
	renewals: AtomicU64,
	cancelled_renewals: AtomicU64,
	token_requests: AtomicU64,
}
impl ManagerMetrics {
	/// Refresh grants sent to the token endpoint.
	pub fn refresh_attempts(&self) -> u64 {
		self.refresh_attempts.load(Ordering::Relaxed)
	}

	/// Refresh grants that produced a persisted token.
	pub fn refresh_successes(&self) -> u64 {
		self.refresh_successes.load(Ordering::Relaxed)
	}

	/// Refresh grants that failed.
	pub fn refresh_failures(&self) -> u64 {
		self.refresh_failures.load(Ordering::Relaxed)
	}

	/// External renewals started.
	pub fn renewals(&self) -> u64 {
		self.renewals.load(Ordering::Relaxed)
	}

	/// External renewals cancelled because a peer stored a token first.
	pub fn cancelled_renewals(&self) -> u64 {
		self.cancelled_renewals.load(Ordering::Relaxed)
	}

	/// Token endpoint calls of any grant, refreshes included.
	pub fn token_requests(&self) -> u64 {
		self.token_requests.load(Ordering::Relaxed)
	}

	pub(crate) fn record_refresh_attempt(&self) {
		self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
		self.token_requests.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_refresh_success(&self) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_refresh_failure(&self) {
		self.refresh_failures.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_renewal(&self) {
		self.renewals.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_cancelled_renewal(&self) {
		self.cancelled_renewals.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_token_request(&self) {
		self.token_requests.fetch_add(1, Ordering::Relaxed);
	}
}
