//! JWT parsing and JWK-based signature verification.
//!
//! [`JwkVerificationDispatcher`] resolves the issuer's key set through a [`JwkSetSource`],
//! narrows candidate keys by `kid` then `alg`, and asks each [`SignatureVerifier`] in turn.
//! A verifier answers `Some(valid)` when it understands the key, `None` otherwise.

pub mod source;
pub mod verifier;

pub use source::*;
pub use verifier::*;

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
// self
use crate::{
	_prelude::*,
	error::VerifyError,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// JSON object decoded from a JWT segment.
pub type JsonObject = Map<String, Value>;

/// Decoded compact JWS.
#[derive(Clone, Debug, PartialEq)]
pub struct JwtInfo {
	/// Decoded protected header.
	pub header: JsonObject,
	/// Decoded claims.
	pub claims: JsonObject,
	signing_input: String,
	signature: Option<String>,
}
impl JwtInfo {
	/// Splits `token` into `header.payload[.signature]` and decodes both JSON segments.
	pub fn parse(token: &str) -> Result<Self, VerifyError> {
		let mut segments = token.trim().split('.');
		let (Some(header), Some(payload)) = (segments.next(), segments.next()) else {
			return Err(malformed("expected at least two segments"));
		};
		let signature = segments.next().filter(|s| !s.is_empty()).map(ToOwned::to_owned);

		if segments.next().is_some() {
			return Err(malformed("expected at most three segments"));
		}

		Ok(Self {
			header: decode_segment("header", header)?,
			claims: decode_segment("payload", payload)?,
			signing_input: format!("{header}.{payload}"),
			signature,
		})
	}

	/// Bytes covered by the signature (`header.payload`).
	pub fn signing_input(&self) -> &str {
		&self.signing_input
	}

	/// Base64url signature segment, if present.
	pub fn signature(&self) -> Option<&str> {
		self.signature.as_deref()
	}

	/// Header `alg`.
	pub fn alg(&self) -> Option<&str> {
		self.header.get("alg").and_then(Value::as_str)
	}

	/// Header `kid`.
	pub fn kid(&self) -> Option<&str> {
		self.header.get("kid").and_then(Value::as_str)
	}

	/// Issuer from the header `iss`, falling back to the `iss` claim.
	pub fn issuer(&self) -> Option<&str> {
		self.header
			.get("iss")
			.and_then(Value::as_str)
			.or_else(|| self.claims.get("iss").and_then(Value::as_str))
	}
}

/// Single JSON Web Key (RFC 7517).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
	/// Key type (`oct`, `RSA`, `EC`, `OKP`).
	pub kty: String,
	/// Key identifier.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kid: Option<String>,
	/// Intended algorithm.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub alg: Option<String>,
	/// Public key use (`sig`, `enc`).
	#[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
	pub key_use: Option<String>,
	/// Curve for `EC` and `OKP` keys.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub crv: Option<String>,
	/// Symmetric key value.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub k: Option<String>,
	/// RSA modulus.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub n: Option<String>,
	/// RSA exponent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub e: Option<String>,
	/// Curve x coordinate.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub x: Option<String>,
	/// Curve y coordinate.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub y: Option<String>,
	/// Members not modeled above.
	#[serde(flatten)]
	pub other: BTreeMap<String, Value>,
}

/// JWK Set document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JwkSet {
	/// Published keys.
	pub keys: Vec<Jwk>,
}

/// Verifies JWT signatures against the issuer's published keys.
#[derive(Clone)]
pub struct JwkVerificationDispatcher {
	source: Arc<dyn JwkSetSource>,
	registry: SignatureVerifierRegistry,
}
impl JwkVerificationDispatcher {
	/// Creates a dispatcher with the default verifier registry.
	pub fn new(source: Arc<dyn JwkSetSource>) -> Self {
		Self { source, registry: SignatureVerifierRegistry::default() }
	}

	/// Replaces the verifier registry.
	pub fn with_registry(mut self, registry: SignatureVerifierRegistry) -> Self {
		self.registry = registry;

		self
	}

	/// Parses `token` and verifies it.
	pub async fn verify_token(&self, token: &str) -> Result<bool> {
		let info = JwtInfo::parse(token)?;

		self.verify(&info).await
	}

	/// Returns `Ok(valid)` once some verifier understood a candidate key.
	pub async fn verify(&self, token: &JwtInfo) -> Result<bool> {
		const KIND: FlowKind = FlowKind::JwkVerify;

		let span = FlowSpan::new(KIND, "verify");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.verify_inner(token)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	async fn verify_inner(&self, token: &JwtInfo) -> Result<bool> {
		if token.signature().is_none() {
			return Err(VerifyError::SignatureNotFound.into());
		}

		let issuer = token.issuer().ok_or(VerifyError::IssuerNotFound)?;
		let set = self.source.jwk_set(issuer).await.map_err(|e| {
			VerifyError::KeySetUnavailable { issuer: issuer.to_owned(), source: Box::new(e) }
		})?;
		let candidates = select_keys(&set.keys, token);

		if candidates.is_empty() {
			return Err(VerifyError::MatchedKeyNotFound { issuer: issuer.to_owned() }.into());
		}

		for key in candidates {
			if let Some(valid) = self.registry.verify(key, token) {
				return Ok(valid);
			}
		}

		Err(VerifyError::SupportedAlgorithmNotFound.into())
	}
}
impl Debug for JwkVerificationDispatcher {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("JwkVerificationDispatcher").field("registry", &self.registry).finish()
	}
}

/// Narrows `keys` by the token's `kid`, then by its `alg`.
///
/// A step that would leave nothing keeps the previous list.
fn select_keys<'k>(keys: &'k [Jwk], token: &JwtInfo) -> Vec<&'k Jwk> {
	let all = keys.iter().collect::<Vec<_>>();
	let by_kid = narrow(all, |key| token.kid().is_some_and(|kid| key.kid.as_deref() == Some(kid)));

	narrow(by_kid, |key| token.alg().is_some_and(|alg| key.alg.as_deref() == Some(alg)))
}

fn narrow<'k>(keys: Vec<&'k Jwk>, keep: impl Fn(&Jwk) -> bool) -> Vec<&'k Jwk> {
	let filtered = keys.iter().copied().filter(|key| keep(key)).collect::<Vec<_>>();

	if filtered.is_empty() { keys } else { filtered }
}

fn decode_segment(name: &str, segment: &str) -> Result<JsonObject, VerifyError> {
	let bytes = URL_SAFE_NO_PAD
		.decode(segment.trim_end_matches('='))
		.map_err(|e| malformed(format!("{name} is not base64url: {e}")))?;

	serde_json::from_slice(&bytes)
		.map_err(|e| malformed(format!("{name} is not a JSON object: {e}")))
}

fn malformed(reason: impl Into<String>) -> VerifyError {
	VerifyError::MalformedToken { reason: reason.into() }
}
