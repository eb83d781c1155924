//! PKCE verifier/challenge generation and the random state identifier.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

pub(crate) const STATE_LEN: usize = 32;
pub(crate) const PKCE_VERIFIER_LEN: usize = 64;

/// PKCE challenge methods (RFC 7636).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
	/// PKCE disabled; no verifier is generated.
	None,
	/// Challenge equals the verifier.
	Plain,
	/// Challenge is `BASE64URL(SHA256(verifier))`.
	#[default]
	S256,
}
impl PkceMethod {
	/// Wire value for `code_challenge_method`, or `None` when disabled.
	pub fn as_str(self) -> Option<&'static str> {
		match self {
			Self::None => None,
			Self::Plain => Some("plain"),
			Self::S256 => Some("S256"),
		}
	}
}

/// Verifier plus the challenge sent on the authorize URL.
#[derive(Clone)]
pub struct PkcePair {
	/// Secret verifier kept in the state record.
	pub verifier: String,
	/// Challenge derived from the verifier.
	pub challenge: String,
	/// Method used to derive the challenge.
	pub method: PkceMethod,
}
impl PkcePair {
	/// Generates a pair for `method`; `None` yields no pair.
	pub fn generate(method: PkceMethod) -> Option<Self> {
		let verifier = random_string(PKCE_VERIFIER_LEN);
		let challenge = match method {
			PkceMethod::None => return None,
			PkceMethod::Plain => verifier.clone(),
			PkceMethod::S256 => s256_challenge(&verifier),
		};

		Some(Self { verifier, challenge, method })
	}
}
impl Debug for PkcePair {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("PkcePair")
			.field("challenge", &self.challenge)
			.field("method", &self.method)
			.finish_non_exhaustive()
	}
}

/// Computes the S256 challenge for `verifier`.
pub fn s256_challenge(verifier: &str) -> String {
	let digest = Sha256::digest(verifier.as_bytes());

	URL_SAFE_NO_PAD.encode(digest)
}

pub(crate) fn random_string(len: usize) -> String {
	rand::rng().sample_iter(Alphanumeric).take(len).map(char::from).collect()
}
