#![cfg(feature = "reqwest")]

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use httpmock::prelude::*;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;
// self
use oauth2_token_broker::{
	_preludet::*,
	error::{TransientError, VerifyError},
	http::ReqwestHttpClient,
	jwk::{
		CachedJwkSetSource, HttpJwkSetSource, Jwk, JwkSet, JwkVerificationDispatcher,
		StaticJwkSetSource,
	},
	oauth::ReqwestTransportErrorMapper,
};

const ISSUER: &str = "https://issuer.example.com";
const SECRET: &[u8] = b"jwk-integration-secret-0123456789";

fn sign(issuer: &str, kid: Option<&str>, secret: &[u8]) -> String {
	let mut header = Header::new(Algorithm::HS256);

	header.kid = kid.map(Into::into);

	jsonwebtoken::encode(
		&header,
		&json!({ "iss": issuer, "sub": "user-1", "aud": "client" }),
		&EncodingKey::from_secret(secret),
	)
	.expect("Token should encode.")
}

fn oct_key(kid: &str, secret: &[u8]) -> Jwk {
	Jwk {
		kty: "oct".into(),
		kid: Some(kid.into()),
		alg: Some("HS256".into()),
		k: Some(URL_SAFE_NO_PAD.encode(secret)),
		..Default::default()
	}
}

fn rsa_key(kid: &str) -> Jwk {
	Jwk {
		kty: "RSA".into(),
		kid: Some(kid.into()),
		n: Some("sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1Wl".into()),
		e: Some("AQAB".into()),
		..Default::default()
	}
}

fn dispatcher(keys: Vec<Jwk>) -> JwkVerificationDispatcher {
	let source = StaticJwkSetSource::default().with_set(ISSUER, JwkSet { keys });

	JwkVerificationDispatcher::new(Arc::new(source))
}

#[tokio::test]
async fn matching_kid_verifies_and_foreign_secret_fails() {
	let dispatcher = dispatcher(vec![rsa_key("other"), oct_key("k1", SECRET)]);

	assert!(
		dispatcher
			.verify_token(&sign(ISSUER, Some("k1"), SECRET))
			.await
			.expect("Verification should complete.")
	);
	assert!(
		!dispatcher
			.verify_token(&sign(ISSUER, Some("k1"), b"a-completely-different-secret!!"))
			.await
			.expect("Verification should complete.")
	);
}

#[tokio::test]
async fn tokens_without_kid_fall_back_to_alg() {
	let dispatcher = dispatcher(vec![rsa_key("rsa"), oct_key("hmac", SECRET)]);

	assert!(
		dispatcher
			.verify_token(&sign(ISSUER, None, SECRET))
			.await
			.expect("Verification should complete.")
	);
}

#[tokio::test]
async fn unsupported_key_types_are_reported() {
	let dispatcher = dispatcher(vec![rsa_key("k1")]);
	let err = dispatcher
		.verify_token(&sign(ISSUER, Some("k1"), SECRET))
		.await
		.expect_err("An RSA key cannot check an HS256 token.");

	assert!(matches!(err, Error::Verify(VerifyError::SupportedAlgorithmNotFound)));
}

#[tokio::test]
async fn unsigned_and_issuerless_tokens_are_rejected() {
	let dispatcher = dispatcher(vec![oct_key("k1", SECRET)]);
	let signed = sign(ISSUER, Some("k1"), SECRET);
	let unsigned = signed.rsplit_once('.').map(|(input, _)| input).expect("JWS has three parts.");
	let err = dispatcher.verify_token(unsigned).await.expect_err("Unsigned tokens must fail.");

	assert!(matches!(err, Error::Verify(VerifyError::SignatureNotFound)));

	let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","kid":"k1"}"#);
	let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user-1"}"#);
	let err = dispatcher
		.verify_token(&format!("{header}.{payload}.c2ln"))
		.await
		.expect_err("Tokens without an issuer must fail.");

	assert!(matches!(err, Error::Verify(VerifyError::IssuerNotFound)));

	let err = dispatcher
		.verify_token(&sign("https://unknown.example.com", Some("k1"), SECRET))
		.await
		.expect_err("Unknown issuers must fail.");

	assert!(matches!(err, Error::Verify(VerifyError::KeySetUnavailable { .. })));
}

#[tokio::test]
async fn empty_key_sets_report_no_match() {
	let dispatcher = dispatcher(Vec::new());
	let err = dispatcher
		.verify_token(&sign(ISSUER, Some("k1"), SECRET))
		.await
		.expect_err("Empty sets cannot match.");

	assert!(matches!(err, Error::Verify(VerifyError::MatchedKeyNotFound { .. })));
}

#[tokio::test]
async fn http_source_discovers_and_caches_the_key_set() {
	let server = MockServer::start_async().await;
	let issuer = server.base_url();
	let jwks_url = server.url("/keys");
	let discovery = server
		.mock_async(|when, then| {
			when.method(GET).path("/.well-known/openid-configuration");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "issuer": issuer, "jwks_uri": jwks_url }));
		})
		.await;
	let keys = server
		.mock_async(|when, then| {
			when.method(GET).path("/keys");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "keys": [oct_key("k1", SECRET)] }));
		})
		.await;
	let source: HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> =
		HttpJwkSetSource::with_http_client(test_reqwest_http_client(), ReqwestTransportErrorMapper);

	source.register_discovery(&issuer);

	let dispatcher = JwkVerificationDispatcher::new(Arc::new(CachedJwkSetSource::new(source)));
	let token = sign(&issuer, Some("k1"), SECRET);

	for _ in 0..2 {
		assert!(dispatcher.verify_token(&token).await.expect("Verification should complete."));
	}

	discovery.assert_calls_async(1).await;
	keys.assert_calls_async(1).await;
}

#[tokio::test]
async fn http_source_failures_surface_as_unavailable_key_sets() {
	let server = MockServer::start_async().await;
	let _discovery = server
		.mock_async(|when, then| {
			when.method(GET).path("/.well-known/openid-configuration");
			then.status(503).header("retry-after", "10");
		})
		.await;
	let source: HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> =
		HttpJwkSetSource::with_http_client(test_reqwest_http_client(), ReqwestTransportErrorMapper);

	source.register_discovery(server.base_url());

	let dispatcher = JwkVerificationDispatcher::new(Arc::new(source));
	let err = dispatcher
		.verify_token(&sign(&server.base_url(), Some("k1"), SECRET))
		.await
		.expect_err("Discovery failure must fail verification.");

	match err {
		Error::Verify(VerifyError::KeySetUnavailable { source, .. }) => match *source {
			Error::Transient(TransientError::Endpoint { status, retry_after, .. }) => {
				assert_eq!(status, Some(503));
				assert_eq!(retry_after, Some(Duration::seconds(10)));
			},
			other => panic!("Unexpected source error: {other:?}."),
		},
		other => panic!("Unexpected error variant: {other:?}."),
	}
}

#[tokio::test]
async fn http_source_never_contacts_unregistered_issuers() {
	let server = MockServer::start_async().await;
	let issuer = server.base_url();
	let jwks_url = server.url("/keys");
	let discovery = server
		.mock_async(|when, then| {
			when.method(GET).path("/.well-known/openid-configuration");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "issuer": issuer, "jwks_uri": jwks_url }));
		})
		.await;
	let keys = server
		.mock_async(|when, then| {
			when.method(GET).path("/keys");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "keys": [oct_key("k1", SECRET)] }));
		})
		.await;
	let source: HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> =
		HttpJwkSetSource::with_http_client(test_reqwest_http_client(), ReqwestTransportErrorMapper);

	source.register_discovery("https://real-idp.example");

	let dispatcher = JwkVerificationDispatcher::new(Arc::new(CachedJwkSetSource::new(source)));
	let err = dispatcher
		.verify_token(&sign(&server.base_url(), Some("k1"), SECRET))
		.await
		.expect_err("Self-hosted key sets must not be trusted.");

	match err {
		Error::Verify(VerifyError::KeySetUnavailable { source, .. }) => {
			assert!(matches!(*source, Error::Verify(VerifyError::UntrustedIssuer { .. })));
		},
		other => panic!("Unexpected error variant: {other:?}."),
	}

	discovery.assert_calls_async(0).await;
	keys.assert_calls_async(0).await;
}

#[tokio::test]
async fn discovery_must_advertise_the_requested_issuer() {
	let server = MockServer::start_async().await;
	let jwks_url = server.url("/keys");
	let _discovery = server
		.mock_async(|when, then| {
			when.method(GET).path("/.well-known/openid-configuration");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "issuer": "https://elsewhere.example", "jwks_uri": jwks_url }));
		})
		.await;
	let keys = server
		.mock_async(|when, then| {
			when.method(GET).path("/keys");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "keys": [oct_key("k1", SECRET)] }));
		})
		.await;
	let source: HttpJwkSetSource<ReqwestHttpClient, ReqwestTransportErrorMapper> =
		HttpJwkSetSource::with_http_client(test_reqwest_http_client(), ReqwestTransportErrorMapper);

	source.register_discovery(server.base_url());

	let dispatcher = JwkVerificationDispatcher::new(Arc::new(source));
	let err = dispatcher
		.verify_token(&sign(&server.base_url(), Some("k1"), SECRET))
		.await
		.expect_err("Mismatched discovery documents must fail.");

	assert!(matches!(err, Error::Verify(VerifyError::KeySetUnavailable { .. })));
	keys.assert_calls_async(0).await;
}
