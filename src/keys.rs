//! Issuer public key ring with single-flight refresh.

// std
use std::{
	collections::HashMap,
	fmt::{Debug, Formatter, Result as FmtResult},
	str::FromStr,
};
// crates.io
use base64::prelude::*;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
// self
use crate::{
	_prelude::*,
	gate::{Admission, Completion, Gate, Waiter},
	issuer::{IssuerClient, WirePublicKey},
	metrics::{self, AuthMetrics},
};

/// Algorithm labels the issuer may publish keys under.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
	RS256,
	RS384,
	RS512,
	PS256,
	PS384,
	PS512,
	ES256,
	ES384,
	ES512,
	EdDSA,
}
impl KeyAlgorithm {
	/// Key family the label decodes as.
	pub fn family(self) -> AlgorithmFamily {
		match self {
			Self::RS256 | Self::RS384 | Self::RS512 => AlgorithmFamily::Rsa,
			Self::PS256 | Self::PS384 | Self::PS512 => AlgorithmFamily::RsaPss,
			Self::ES256 | Self::ES384 | Self::ES512 => AlgorithmFamily::Ec,
			Self::EdDSA => AlgorithmFamily::EdDsa,
		}
	}

	/// Label as published by the issuer.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::RS256 => "RS256",
			Self::RS384 => "RS384",
			Self::RS512 => "RS512",
			Self::PS256 => "PS256",
			Self::PS384 => "PS384",
			Self::PS512 => "PS512",
			Self::ES256 => "ES256",
			Self::ES384 => "ES384",
			Self::ES512 => "ES512",
			Self::EdDSA => "EdDSA",
		}
	}
}
impl FromStr for KeyAlgorithm {
	type Err = Error;

	fn from_str(label: &str) -> Result<Self> {
		Ok(match label {
			"RS256" => Self::RS256,
			"RS384" => Self::RS384,
			"RS512" => Self::RS512,
			"PS256" => Self::PS256,
			"PS384" => Self::PS384,
			"PS512" => Self::PS512,
			"ES256" => Self::ES256,
			"ES384" => Self::ES384,
			"ES512" => Self::ES512,
			"EdDSA" => Self::EdDSA,
			other => return Err(Error::UnsupportedAlgorithm(other.to_owned())),
		})
	}
}

/// Public key families; each has exactly one decoding routine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmFamily {
	/// PKCS#1 v1.5 RSA.
	Rsa,
	/// RSASSA-PSS.
	RsaPss,
	/// ECDSA.
	Ec,
	/// Edwards-curve signatures.
	EdDsa,
}
impl AlgorithmFamily {
	/// Decode DER SubjectPublicKeyInfo bytes into a verification key.
	pub fn decode(self, spki_der: &[u8]) -> Result<DecodingKey> {
		let pem = spki_pem(spki_der);
		let key = match self {
			Self::Rsa | Self::RsaPss => DecodingKey::from_rsa_pem(pem.as_bytes())?,
			Self::Ec => DecodingKey::from_ec_pem(pem.as_bytes())?,
			Self::EdDsa => DecodingKey::from_ed_pem(pem.as_bytes())?,
		};

		Ok(key)
	}
}

/// Verification key resolved from the issuer's key set.
#[derive(Clone)]
pub struct KeyEntry {
	key_id: String,
	algorithm: KeyAlgorithm,
	key: DecodingKey,
}
impl KeyEntry {
	/// Reconstruct an entry from the issuer's wire representation.
	pub fn from_wire(key_id: impl Into<String>, wire: &WirePublicKey) -> Result<Self> {
		let algorithm = wire.algorithm.parse::<KeyAlgorithm>()?;
		let der = decode_key_bytes(&wire.public_key)?;
		let key = algorithm.family().decode(&der)?;

		Ok(Self { key_id: key_id.into(), algorithm, key })
	}

	/// Key identifier.
	pub fn key_id(&self) -> &str {
		&self.key_id
	}

	/// Label the key was published under.
	pub fn algorithm(&self) -> KeyAlgorithm {
		self.algorithm
	}

	/// Key family.
	pub fn family(&self) -> AlgorithmFamily {
		self.algorithm.family()
	}

	/// Verification key.
	pub fn decoding_key(&self) -> &DecodingKey {
		&self.key
	}
}
impl Debug for KeyEntry {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("KeyEntry")
			.field("key_id", &self.key_id)
			.field("algorithm", &self.algorithm)
			.finish_non_exhaustive()
	}
}

/// Immutable view of the key ring, replaced wholesale on refresh.
#[derive(Clone, Debug, Default)]
pub struct KeyRingSnapshot {
	keys: HashMap<String, Arc<KeyEntry>>,
	last_refreshed_at: Option<DateTime<Utc>>,
}
impl KeyRingSnapshot {
	/// Build a snapshot stamped with `refreshed_at`.
	pub fn new(keys: HashMap<String, Arc<KeyEntry>>, refreshed_at: DateTime<Utc>) -> Self {
		Self { keys, last_refreshed_at: Some(refreshed_at) }
	}

	/// Look a key up by id.
	pub fn get(&self, key_id: &str) -> Option<Arc<KeyEntry>> {
		self.keys.get(key_id).cloned()
	}

	/// When the snapshot was fetched; `None` until the first successful refresh.
	pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
		self.last_refreshed_at
	}

	/// Number of keys.
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	/// Whether the snapshot holds no keys.
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Sorted key ids.
	pub fn key_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.keys.keys().cloned().collect();

		ids.sort_unstable();

		ids
	}

	/// Whether a token signed by `key_id` at `issued_at` (epoch seconds) warrants a refresh.
	///
	/// An unknown key only justifies a refresh when the snapshot predates the token; a key that was
	/// missing from a newer snapshot will not appear by refetching.
	pub fn needs_refresh_for(&self, key_id: &str, issued_at: i64) -> bool {
		match self.last_refreshed_at {
			None => true,
			Some(refreshed_at) =>
				!self.keys.contains_key(key_id) && refreshed_at.timestamp() < issued_at,
		}
	}
}

/// Cache of issuer public keys keyed by key id.
pub struct KeyRing {
	issuer: Arc<dyn IssuerClient>,
	snapshot: RwLock<Arc<KeyRingSnapshot>>,
	gate: Gate,
	metrics: Arc<AuthMetrics>,
	service: Arc<str>,
}
impl KeyRing {
	/// Create an empty key ring backed by `issuer`.
	pub fn new(issuer: Arc<dyn IssuerClient>, service: impl Into<Arc<str>>) -> Self {
		Self::with_metrics(issuer, service, AuthMetrics::new())
	}

	pub(crate) fn with_metrics(
		issuer: Arc<dyn IssuerClient>,
		service: impl Into<Arc<str>>,
		metrics: Arc<AuthMetrics>,
	) -> Self {
		Self {
			issuer,
			snapshot: RwLock::new(Arc::new(KeyRingSnapshot::default())),
			gate: Gate::new("key-refresh"),
			metrics,
			service: service.into(),
		}
	}

	/// Look a key up in the current snapshot. Never touches the network.
	pub async fn get(&self, key_id: &str) -> Option<Arc<KeyEntry>> {
		self.snapshot.read().await.get(key_id)
	}

	/// Current snapshot.
	pub async fn snapshot(&self) -> Arc<KeyRingSnapshot> {
		self.snapshot.read().await.clone()
	}

	/// Refresh when the snapshot cannot vouch for `key_id`, or join a refresh already running.
	///
	/// Joining callers take the outcome of the running refresh as-is and do not re-check
	/// freshness afterwards.
	#[tracing::instrument(skip(self), fields(service = %self.service))]
	pub async fn ensure_fresh(&self, key_id: &str, issued_at: i64) -> Result<()> {
		if let Some(waiter) = self.gate.in_flight() {
			tracing::debug!("waiting for in-flight key refresh");

			return self.follow(waiter).await;
		}

		let needs_refresh = self.snapshot.read().await.needs_refresh_for(key_id, issued_at);

		if needs_refresh { self.refresh().await } else { Ok(()) }
	}

	/// Fetch the issuer's keys and replace the snapshot; concurrent callers share one fetch.
	#[tracing::instrument(skip(self), fields(service = %self.service))]
	pub async fn refresh(&self) -> Result<()> {
		match self.gate.enter() {
			Admission::Follower(waiter) => {
				tracing::debug!("waiting for in-flight key refresh");

				self.follow(waiter).await
			},
			Admission::Leader(ticket) => {
				let started = Instant::now();
				let outcome = self.fetch_and_swap().await;

				match &outcome {
					Ok(count) => {
						metrics::record_key_refresh_success(&self.service, started.elapsed());
						self.metrics.record_key_refresh_success();

						tracing::info!(count, "public keys refreshed");

						ticket.complete(Completion::Succeeded);
					},
					Err(err) => {
						metrics::record_key_refresh_error(&self.service);
						self.metrics.record_key_refresh_error();

						tracing::warn!(error = %err, "public key refresh failed");

						ticket.complete(Completion::Failed);
					},
				}

				outcome.map(|_| ())
			},
		}
	}

	async fn follow(&self, waiter: Waiter) -> Result<()> {
		match waiter.wait().await {
			Completion::Succeeded => Ok(()),
			completion => Err(Error::Bootstrap(format!(
				"Concurrent public key refresh did not succeed ({completion:?})."
			))),
		}
	}

	async fn fetch_and_swap(&self) -> Result<usize> {
		tracing::info!("refreshing public keys");

		let wire = self.issuer.get_public_keys().await?;
		let mut keys = HashMap::with_capacity(wire.len());

		for (key_id, wire_key) in &wire {
			let entry = KeyEntry::from_wire(key_id.as_str(), wire_key)?;

			keys.insert(key_id.clone(), Arc::new(entry));
		}

		let count = keys.len();
		let snapshot = Arc::new(KeyRingSnapshot::new(keys, Utc::now()));

		*self.snapshot.write().await = snapshot;

		Ok(count)
	}
}
impl Debug for KeyRing {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("KeyRing")
			.field("service", &self.service)
			.field("gate", &self.gate)
			.finish_non_exhaustive()
	}
}

/// Decode issuer key bytes, accepting both base64 alphabets.
pub fn decode_key_bytes(value: &str) -> Result<Vec<u8>> {
	let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();

	BASE64_STANDARD
		.decode(&cleaned)
		.or_else(|_| BASE64_URL_SAFE_NO_PAD.decode(cleaned.trim_end_matches('=')))
		.map_err(Error::from)
}

fn spki_pem(der: &[u8]) -> String {
	let encoded = BASE64_STANDARD.encode(der);
	let mut pem = String::with_capacity(encoded.len() + 64);

	pem.push_str("-----BEGIN PUBLIC KEY-----\n");

	for line in encoded.as_bytes().chunks(64) {
		pem.push_str(&String::from_utf8_lossy(line));
		pem.push('\n');
	}

	pem.push_str("-----END PUBLIC KEY-----\n");

	pem
}
