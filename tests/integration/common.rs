//! Shared fixtures for the integration tests.

// std
use std::time::{SystemTime, UNIX_EPOCH};
// crates.io
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use s2s_auth::{Result, S2sConfig};
use serde_json::{Value, json};
use wiremock::MockServer;

pub const RSA_PRIVATE: &str = include_str!("../fixtures/rsa_private.pem");
pub const RSA_PUBLIC: &str = include_str!("../fixtures/rsa_public.pem");
pub const ROTATED_PRIVATE: &str = include_str!("../fixtures/rsa_rotated_private.pem");
pub const ROTATED_PUBLIC: &str = include_str!("../fixtures/rsa_rotated_public.pem");

pub fn pem_body(pem: &str) -> String {
	pem.lines().filter(|line| !line.starts_with("-----")).collect()
}

/// Issuer key-set body for `(kid, public pem)` pairs, all RS256.
pub fn key_set(keys: &[(&str, &str)]) -> Value {
	let entries = keys
		.iter()
		.map(|(kid, pem)| ((*kid).to_owned(), json!({ "type": "RS256", "publicKey": pem_body(pem) })))
		.collect::<serde_json::Map<_, _>>();

	Value::Object(entries)
}

pub fn now() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs() as i64).unwrap_or(0)
}

/// Sign an RS256 token for `service`.
pub fn sign(private: &str, kid: &str, service: &str, iat: i64, ttl_secs: i64) -> String {
	let mut header = Header::new(Algorithm::RS256);

	header.kid = Some(kid.to_owned());

	let key = EncodingKey::from_rsa_pem(private.as_bytes()).expect("fixture key");
	let claims = json!({ "serviceName": service, "iat": iat, "exp": iat + ttl_secs });

	jsonwebtoken::encode(&header, &claims, &key).expect("sign")
}

/// Configuration for `billing` talking to the mock issuer over plain HTTP.
pub fn config(server: &MockServer) -> Result<S2sConfig> {
	Ok(S2sConfig::new("billing", "http://billing.test", server.uri())?.with_require_https(false))
}
