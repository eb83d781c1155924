//! Per-family signature verifiers built on `jsonwebtoken` primitives.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, crypto, errors::Error as JwtError};
// self
use crate::{
	_prelude::*,
	jwk::{Jwk, JwtInfo},
	obs,
};

/// Checks a token signature against one key.
pub trait SignatureVerifier
where
	Self: 'static + Send + Sync,
{
	/// Short label used in logs.
	fn name(&self) -> &'static str;

	/// `Some(valid)` when this verifier understands `key`; `None` otherwise.
	///
	/// Key import and verification failures are logged and reported as `None`.
	fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool>;
}

/// Ordered verifier list; the first `Some` answer wins.
#[derive(Clone)]
pub struct SignatureVerifierRegistry(Vec<Arc<dyn SignatureVerifier>>);
impl SignatureVerifierRegistry {
	/// Registry without verifiers.
	pub fn empty() -> Self {
		Self(Vec::new())
	}

	/// Appends `verifier` after the existing ones.
	pub fn with_verifier(mut self, verifier: impl SignatureVerifier) -> Self {
		self.0.push(Arc::new(verifier));

		self
	}

	/// Asks each verifier in order.
	pub fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool> {
		self.0.iter().find_map(|verifier| verifier.verify(key, token))
	}
}
impl Default for SignatureVerifierRegistry {
	fn default() -> Self {
		Self::empty()
			.with_verifier(HmacVerifier)
			.with_verifier(RsaVerifier)
			.with_verifier(EcdsaVerifier)
			.with_verifier(EdDsaVerifier)
	}
}
impl Debug for SignatureVerifierRegistry {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_list().entries(self.0.iter().map(|verifier| verifier.name())).finish()
	}
}

/// `oct` keys with HS256/HS384/HS512.
#[derive(Clone, Copy, Debug, Default)]
pub struct HmacVerifier;
impl SignatureVerifier for HmacVerifier {
	fn name(&self) -> &'static str {
		"hmac"
	}

	fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool> {
		if key.kty != "oct" {
			return None;
		}

		let alg = negotiate(key, token, &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512])?;
		let secret = key.k.as_deref()?;
		let secret = match URL_SAFE_NO_PAD.decode(secret.trim_end_matches('=')) {
			Ok(bytes) => bytes,
			Err(e) => {
				obs::log_suppressed("jwk.hmac.import", &e);

				return None;
			},
		};

		check(self.name(), token, &DecodingKey::from_secret(&secret), alg)
	}
}

/// `RSA` keys with RS256/384/512 and PS256/384/512.
#[derive(Clone, Copy, Debug, Default)]
pub struct RsaVerifier;
impl SignatureVerifier for RsaVerifier {
	fn name(&self) -> &'static str {
		"rsassa"
	}

	fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool> {
		if key.kty != "RSA" {
			return None;
		}

		let alg = negotiate(key, token, &[
			Algorithm::RS256,
			Algorithm::RS384,
			Algorithm::RS512,
			Algorithm::PS256,
			Algorithm::PS384,
			Algorithm::PS512,
		])?;
		let decoding_key = import(
			self.name(),
			DecodingKey::from_rsa_components(key.n.as_deref()?, key.e.as_deref()?),
		)?;

		check(self.name(), token, &decoding_key, alg)
	}
}

/// `EC` keys on P-256 (ES256) and P-384 (ES384).
#[derive(Clone, Copy, Debug, Default)]
pub struct EcdsaVerifier;
impl SignatureVerifier for EcdsaVerifier {
	fn name(&self) -> &'static str {
		"ecdsa"
	}

	fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool> {
		if key.kty != "EC" {
			return None;
		}

		let curve_alg = match key.crv.as_deref()? {
			"P-256" => Algorithm::ES256,
			"P-384" => Algorithm::ES384,
			_ => return None,
		};
		let alg = negotiate(key, token, &[curve_alg])?;
		let decoding_key = import(
			self.name(),
			DecodingKey::from_ec_components(key.x.as_deref()?, key.y.as_deref()?),
		)?;

		check(self.name(), token, &decoding_key, alg)
	}
}

/// `OKP` keys on Ed25519.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdDsaVerifier;
impl SignatureVerifier for EdDsaVerifier {
	fn name(&self) -> &'static str {
		"eddsa"
	}

	fn verify(&self, key: &Jwk, token: &JwtInfo) -> Option<bool> {
		if key.kty != "OKP" || key.crv.as_deref() != Some("Ed25519") {
			return None;
		}

		let alg = negotiate(key, token, &[Algorithm::EdDSA])?;
		let decoding_key =
			import(self.name(), DecodingKey::from_ed_components(key.x.as_deref()?))?;

		check(self.name(), token, &decoding_key, alg)
	}
}

/// Picks the algorithm from the key's `alg`, else the token's, within `family`.
///
/// When both name an algorithm they must agree.
fn negotiate(key: &Jwk, token: &JwtInfo, family: &[Algorithm]) -> Option<Algorithm> {
	let parse = |raw: &str| Algorithm::from_str(raw).ok().filter(|alg| family.contains(alg));

	match (key.alg.as_deref(), token.alg()) {
		(Some(key_alg), Some(token_alg)) if key_alg != token_alg => None,
		(Some(alg), _) | (None, Some(alg)) => parse(alg),
		(None, None) => None,
	}
}

fn import(verifier: &'static str, key: Result<DecodingKey, JwtError>) -> Option<DecodingKey> {
	key.inspect_err(|e| obs::log_suppressed(verifier, e)).ok()
}

fn check(
	verifier: &'static str,
	token: &JwtInfo,
	key: &DecodingKey,
	alg: Algorithm,
) -> Option<bool> {
	let signature = token.signature()?;

	crypto::verify(signature, token.signing_input().as_bytes(), key, alg)
		.inspect_err(|e| obs::log_suppressed(verifier, e))
		.ok()
}

#[cfg(test)]
mod tests {
	// crates.io
	use jsonwebtoken::{EncodingKey, Header};
	use serde_json::json;
	// self
	use super::*;

	const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
	const OTHER_SECRET: &[u8] = b"another-secret-another-secret!!";

	fn hs256_token(secret: &[u8]) -> JwtInfo {
		let mut header = Header::new(Algorithm::HS256);

		header.kid = Some("k1".into());

		let token = jsonwebtoken::encode(
			&header,
			&json!({ "iss": "https://issuer.example" }),
			&EncodingKey::from_secret(secret),
		)
		.expect("Token should encode.");

		JwtInfo::parse(&token).expect("Token should parse.")
	}

	fn oct_key(alg: Option<&str>) -> Jwk {
		Jwk {
			kty: "oct".into(),
			kid: Some("k1".into()),
			alg: alg.map(Into::into),
			k: Some(URL_SAFE_NO_PAD.encode(SECRET)),
			..Default::default()
		}
	}

	#[test]
	fn hmac_accepts_matching_secret_and_rejects_others() {
		let registry = SignatureVerifierRegistry::default();

		assert_eq!(registry.verify(&oct_key(Some("HS256")), &hs256_token(SECRET)), Some(true));
		assert_eq!(registry.verify(&oct_key(None), &hs256_token(SECRET)), Some(true));
		assert_eq!(
			registry.verify(&oct_key(Some("HS256")), &hs256_token(OTHER_SECRET)),
			Some(false)
		);
	}

	#[test]
	fn mismatched_algorithms_are_not_understood() {
		let registry = SignatureVerifierRegistry::default();

		assert_eq!(registry.verify(&oct_key(Some("HS512")), &hs256_token(SECRET)), None);

		let rsa = Jwk {
			kty: "RSA".into(),
			kid: Some("k1".into()),
			n: Some("AQAB".into()),
			e: Some("AQAB".into()),
			..Default::default()
		};

		assert_eq!(registry.verify(&rsa, &hs256_token(SECRET)), None);
	}

	#[test]
	fn unknown_curves_are_skipped() {
		let key = Jwk {
			kty: "EC".into(),
			crv: Some("secp256k1".into()),
			x: Some("AA".into()),
			y: Some("AA".into()),
			..Default::default()
		};

		assert_eq!(EcdsaVerifier.verify(&key, &hs256_token(SECRET)), None);
	}

	#[test]
	fn registry_debug_lists_verifier_order() {
		assert_eq!(
			format!("{:?}", SignatureVerifierRegistry::default()),
			r#"["hmac", "rsassa", "ecdsa", "eddsa"]"#
		);
	}
}
