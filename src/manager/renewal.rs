// crates.io
use tokio_util::sync::CancellationToken;
// self
use crate::{_prelude::*, oauth::TokenResponse};

/// Boxed future returned by [`ExternalRenewal::renew`].
pub type RenewalFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Option<TokenResponse>>> + 'a + Send>>;

/// Host-supplied way to obtain a token without a refresh token (silent re-login, device
/// prompt, ...).
///
/// Renewals run while the manager holds the coordination lock. When a peer context announces a
/// stored token first, `cancel` is triggered and the renewal gets a short grace period to
/// wind down; returning `Ok(None)` means nothing was obtained.
pub trait ExternalRenewal
where
	Self: 'static + Send + Sync,
{
	/// Attempts a renewal.
	fn renew(&self, cancel: CancellationToken) -> RenewalFuture<'_>;
}

/// Adapts an async closure into an [`ExternalRenewal`].
pub struct FnRenewal<F>(F);
impl<F, Fut> FnRenewal<F>
where
	F: 'static + Send + Sync + Fn(CancellationToken) -> Fut,
	Fut: 'static + Send + Future<Output = Result<Option<TokenResponse>>>,
{
	/// Wraps `f`.
	pub fn new(f: F) -> Self {
		Self(f)
	}
}
impl<F, Fut> ExternalRenewal for FnRenewal<F>
where
	F: 'static + Send + Sync + Fn(CancellationToken) -> Fut,
	Fut: 'static + Send + Future<Output = Result<Option<TokenResponse>>>,
{
	fn renew(&self, cancel: CancellationToken) -> RenewalFuture<'_> {
		Box::pin((self.0)(cancel))
	}
}
impl<F> Debug for FnRenewal<F> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("FnRenewal(..)")
	}
}
