//! Metrics helpers and per-instance telemetry bookkeeping.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 3]>;

const METRIC_KEY_REFRESH_TOTAL: &str = "s2s_auth_key_refresh_total";
const METRIC_KEY_REFRESH_DURATION: &str = "s2s_auth_key_refresh_duration_seconds";
const METRIC_TOKEN_REQUESTS_TOTAL: &str = "s2s_auth_token_requests_total";
const METRIC_TOKEN_DELIVERIES_TOTAL: &str = "s2s_auth_token_deliveries_total";
const METRIC_VALIDATIONS_TOTAL: &str = "s2s_auth_validations_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Outcome label of a validation call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
	/// Token verified and caller permitted.
	Accepted,
	/// Token could not be decoded.
	Malformed,
	/// Unknown signer, bad signature, or expiry failure.
	Unauthorized,
	/// Verified caller outside the allow-list.
	Forbidden,
}
impl ValidationOutcome {
	fn as_str(self) -> &'static str {
		match self {
			Self::Accepted => "accepted",
			Self::Malformed => "malformed",
			Self::Unauthorized => "unauthorized",
			Self::Forbidden => "forbidden",
		}
	}
}

/// Thread-safe counters for one [`crate::S2sAuth`] instance.
#[derive(Debug, Default)]
pub struct AuthMetrics {
	key_refresh_successes: AtomicU64,
	key_refresh_errors: AtomicU64,
	token_requests_accepted: AtomicU64,
	token_requests_failed: AtomicU64,
	token_deliveries: AtomicU64,
	validations_accepted: AtomicU64,
	validations_rejected: AtomicU64,
}
impl AuthMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a successful key refresh.
	pub fn record_key_refresh_success(&self) {
		self.key_refresh_successes.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a failed key refresh.
	pub fn record_key_refresh_error(&self) {
		self.key_refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Record the outcome of a token request call.
	pub fn record_token_request(&self, accepted: bool) {
		if accepted {
			self.token_requests_accepted.fetch_add(1, Ordering::Relaxed);
		} else {
			self.token_requests_failed.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a stored token delivery.
	pub fn record_delivery(&self) {
		self.token_deliveries.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a validation outcome.
	pub fn record_validation(&self, outcome: ValidationOutcome) {
		match outcome {
			ValidationOutcome::Accepted => self.validations_accepted.fetch_add(1, Ordering::Relaxed),
			_ => self.validations_rejected.fetch_add(1, Ordering::Relaxed),
		};
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> AuthMetricsSnapshot {
		AuthMetricsSnapshot {
			key_refresh_successes: self.key_refresh_successes.load(Ordering::Relaxed),
			key_refresh_errors: self.key_refresh_errors.load(Ordering::Relaxed),
			token_requests_accepted: self.token_requests_accepted.load(Ordering::Relaxed),
			token_requests_failed: self.token_requests_failed.load(Ordering::Relaxed),
			token_deliveries: self.token_deliveries.load(Ordering::Relaxed),
			validations_accepted: self.validations_accepted.load(Ordering::Relaxed),
			validations_rejected: self.validations_rejected.load(Ordering::Relaxed),
		}
	}
}

/// Read-only snapshot of the per-instance counters.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMetricsSnapshot {
	pub key_refresh_successes: u64,
	pub key_refresh_errors: u64,
	pub token_requests_accepted: u64,
	pub token_requests_failed: u64,
	pub token_deliveries: u64,
	pub validations_accepted: u64,
	pub validations_rejected: u64,
}
impl AuthMetricsSnapshot {
	/// Share of validations that were rejected.
	pub fn rejection_rate(&self) -> f64 {
		let total = self.validations_accepted + self.validations_rejected;

		if total == 0 { 0.0 } else { self.validations_rejected as f64 / total as f64 }
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a successful key refresh along with its latency.
pub fn record_key_refresh_success(service: &str, duration: Duration) {
	metrics::counter!(METRIC_KEY_REFRESH_TOTAL, status_labels(service, "success").iter())
		.increment(1);
	metrics::histogram!(METRIC_KEY_REFRESH_DURATION, base_labels(service).iter())
		.record(duration.as_secs_f64());
}

/// Record a failed key refresh.
pub fn record_key_refresh_error(service: &str) {
	metrics::counter!(METRIC_KEY_REFRESH_TOTAL, status_labels(service, "error").iter())
		.increment(1);
}

/// Record a token request and whether the issuer accepted it.
pub fn record_token_request(service: &str, accepted: bool) {
	let status = if accepted { "accepted" } else { "error" };

	metrics::counter!(METRIC_TOKEN_REQUESTS_TOTAL, status_labels(service, status).iter())
		.increment(1);
}

/// Record a stored token delivery.
pub fn record_token_delivery(service: &str) {
	metrics::counter!(METRIC_TOKEN_DELIVERIES_TOTAL, base_labels(service).iter()).increment(1);
}

/// Record the outcome of a validation call.
pub fn record_validation(service: &str, outcome: ValidationOutcome) {
	let mut labels = base_labels(service);

	labels.push(Label::new("outcome", outcome.as_str()));

	metrics::counter!(METRIC_VALIDATIONS_TOTAL, labels.iter()).increment(1);
}

fn base_labels(service: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("service", service.to_owned()));

	labels
}

fn status_labels(service: &str, status: &'static str) -> LabelSet {
	let mut labels = base_labels(service);

	labels.push(Label::new("status", status));

	labels
}
