//! Bearer token validation against the issuer key ring.
//!
//! Each call walks `Decoded → KeyResolved → SignatureVerified → AllowListChecked → Accepted` and
//! short-circuits into a malformed, unauthorized, or forbidden failure. No state survives between
//! calls; everything persistent lives in [`KeyRing`].

// std
use std::collections::{BTreeSet, HashSet};
// crates.io
use base64::prelude::*;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	config::DEFAULT_VALIDATION_LEEWAY,
	keys::KeyRing,
	metrics::{self, AuthMetrics, ValidationOutcome},
};

/// Service names permitted to call an operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList(HashSet<String>);
impl AllowList {
	/// Whether `service` may call.
	pub fn contains(&self, service: &str) -> bool {
		self.0.contains(service)
	}

	/// Union of two optional allow-lists; `None` only when both are absent.
	pub fn merge(outer: Option<&Self>, inner: Option<&Self>) -> Option<Self> {
		match (outer, inner) {
			(Some(outer), Some(inner)) => Some(Self(outer.0.union(&inner.0).cloned().collect())),
			(Some(only), None) | (None, Some(only)) => Some(only.clone()),
			(None, None) => None,
		}
	}

	/// Number of permitted services.
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Whether nobody is permitted.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Permitted services in sorted order.
	pub fn services(&self) -> BTreeSet<&str> {
		self.0.iter().map(String::as_str).collect()
	}
}
impl<S> FromIterator<S> for AllowList
where
	S: Into<String>,
{
	fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
		Self(iter.into_iter().map(Into::into).collect())
	}
}

/// Verified claims of an S2S token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
	/// Calling service.
	#[serde(rename = "serviceName", default)]
	pub service_name: Option<String>,
	/// Expiry, epoch seconds.
	pub exp: i64,
	/// Issued-at, epoch seconds.
	pub iat: i64,
	/// Key id taken from the token header.
	#[serde(skip_deserializing, default)]
	pub kid: String,
	/// Any further claims.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}
impl Claims {
	/// Expiry as a timestamp.
	pub fn expires_at(&self) -> Result<DateTime<Utc>> {
		DateTime::from_timestamp(self.exp, 0)
			.ok_or_else(|| Error::MalformedToken(format!("exp {} is out of range.", self.exp)))
	}
}

/// Header and payload fields read before any verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnverifiedToken {
	/// Signing key id.
	pub kid: String,
	/// Declared signature algorithm.
	pub algorithm: Algorithm,
	/// Issued-at, epoch seconds.
	pub issued_at: i64,
}

/// Read `kid`, `alg` and `iat` without verifying the signature.
pub fn decode_unverified(token: &str) -> Result<UnverifiedToken> {
	let segments: Vec<&str> = token.split('.').collect();
	let [_, payload, _] = segments[..] else {
		return Err(Error::MalformedToken(format!(
			"Expected 3 segments, found {}.",
			segments.len()
		)));
	};
	let header = jsonwebtoken::decode_header(token)
		.map_err(|err| Error::MalformedToken(format!("Undecodable header: {err}.")))?;
	let kid = header
		.kid
		.filter(|kid| !kid.is_empty())
		.ok_or_else(|| Error::MalformedToken("Header carries no kid.".into()))?;
	let payload = BASE64_URL_SAFE_NO_PAD
		.decode(payload.trim_end_matches('='))
		.map_err(|err| Error::MalformedToken(format!("Undecodable payload: {err}.")))?;
	let IssuedAt { iat } = serde_json::from_slice(&payload)
		.map_err(|err| Error::MalformedToken(format!("Undecodable payload: {err}.")))?;
	let issued_at = iat.ok_or_else(|| Error::MalformedToken("Payload carries no iat.".into()))?;

	Ok(UnverifiedToken { kid, algorithm: header.alg, issued_at })
}

/// Validates bearer tokens presented by peers.
#[derive(Clone, Debug)]
pub struct TokenValidator {
	keys: Arc<KeyRing>,
	leeway: Duration,
	service: Arc<str>,
	metrics: Arc<AuthMetrics>,
}
impl TokenValidator {
	/// Create a validator using the default expiry leeway.
	pub fn new(keys: Arc<KeyRing>, service: impl Into<Arc<str>>) -> Self {
		Self::with_metrics(keys, service, AuthMetrics::new())
	}

	pub(crate) fn with_metrics(
		keys: Arc<KeyRing>,
		service: impl Into<Arc<str>>,
		metrics: Arc<AuthMetrics>,
	) -> Self {
		Self { keys, leeway: DEFAULT_VALIDATION_LEEWAY, service: service.into(), metrics }
	}

	/// Override the expiry leeway.
	pub fn with_leeway(mut self, leeway: Duration) -> Self {
		self.leeway = leeway;

		self
	}

	/// Key ring backing this validator.
	pub fn key_ring(&self) -> &Arc<KeyRing> {
		&self.keys
	}

	/// Verify `token` and, when `allow_list` is present, require its caller to be listed.
	#[tracing::instrument(skip_all, fields(service = %self.service))]
	pub async fn validate(&self, token: &str, allow_list: Option<&AllowList>) -> Result<Claims> {
		let result = self.verify(token, allow_list).await;
		let outcome = match &result {
			Ok(_) => ValidationOutcome::Accepted,
			Err(err) => match err.kind() {
				ErrorKind::MalformedToken => ValidationOutcome::Malformed,
				ErrorKind::Forbidden => ValidationOutcome::Forbidden,
				_ => ValidationOutcome::Unauthorized,
			},
		};

		metrics::record_validation(&self.service, outcome);
		self.metrics.record_validation(outcome);

		match &result {
			Ok(claims) => tracing::debug!(caller = ?claims.service_name, kid = %claims.kid, "token accepted"),
			Err(err) => tracing::debug!(error = %err, ?outcome, "token rejected"),
		}

		result
	}

	async fn verify(&self, token: &str, allow_list: Option<&AllowList>) -> Result<Claims> {
		let UnverifiedToken { kid, algorithm, issued_at } = decode_unverified(token)?;

		self.keys.ensure_fresh(&kid, issued_at).await?;

		let Some(entry) = self.keys.get(&kid).await else {
			return Err(Error::UnauthorizedSigner(format!("Unknown key id '{kid}'.")));
		};
		let mut validation = Validation::new(algorithm);

		validation.leeway = self.leeway.as_secs();
		validation.validate_aud = false;

		let data = jsonwebtoken::decode::<Claims>(token, entry.decoding_key(), &validation)
			.map_err(|err| Error::UnauthorizedSigner(err.to_string()))?;
		let mut claims = data.claims;

		claims.kid = kid;

		if let Some(allow_list) = allow_list {
			let caller = claims.service_name.as_deref().unwrap_or_default();

			if !allow_list.contains(caller) {
				return Err(Error::ForbiddenCaller { service: caller.to_owned() });
			}
		}

		Ok(claims)
	}
}

#[derive(Deserialize)]
struct IssuedAt {
	#[serde(default)]
	iat: Option<i64>,
}
