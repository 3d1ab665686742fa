//! The owning component: one instance per process wires the key ring, validator, token manager and
//! scheduler together and hands out references to the HTTP layer.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	config::S2sConfig,
	endpoint::DeliveryEndpoint,
	issuer::{HttpIssuerClient, IssuerClient},
	keys::KeyRing,
	metrics::{AuthMetrics, AuthMetricsSnapshot},
	scheduler::Scheduler,
	token::{Acquisition, TokenLifecycleManager},
	validator::TokenValidator,
};

/// Lifecycle state reported for the outbound token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
	/// Nothing delivered yet.
	Missing,
	/// Delivered and not yet expired.
	Valid,
	/// Delivered but past its expiry.
	Expired,
	/// The refresh chain stopped on a fatal error.
	Failed,
}

/// Status projection for one [`S2sAuth`] instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S2sStatus {
	/// Service the instance authenticates as.
	pub service_name: String,
	/// Outbound token state.
	pub token: TokenState,
	/// Expiry of the outbound token.
	pub token_valid_until: Option<DateTime<Utc>>,
	/// When the next token refresh fires.
	pub next_token_refresh: Option<DateTime<Utc>>,
	/// Fatal error that stopped the refresh chain.
	pub last_failure: Option<String>,
	/// Number of cached issuer keys.
	pub key_count: usize,
	/// Cached key ids in sorted order.
	pub key_ids: Vec<String>,
	/// Last successful key refresh.
	pub keys_refreshed_at: Option<DateTime<Utc>>,
	/// Share of rejected validations.
	pub rejection_rate: f64,
	/// Per-instance counters.
	pub metrics: AuthMetricsSnapshot,
}

/// S2S authentication for one service.
#[derive(Clone, Debug)]
pub struct S2sAuth {
	config: Arc<S2sConfig>,
	key_ring: Arc<KeyRing>,
	validator: TokenValidator,
	tokens: TokenLifecycleManager,
	delivery: DeliveryEndpoint,
	scheduler: Scheduler,
	metrics: Arc<AuthMetrics>,
}
impl S2sAuth {
	/// Build an instance talking to the configured issuer over HTTPS.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new(config: S2sConfig) -> Result<Self> {
		config.validate()?;

		let issuer = HttpIssuerClient::new(&config)?;

		Self::with_issuer(config, Arc::new(issuer))
	}

	/// Build an instance around a custom issuer client.
	pub fn with_issuer(config: S2sConfig, issuer: Arc<dyn IssuerClient>) -> Result<Self> {
		config.validate()?;

		let metrics = AuthMetrics::new();
		let service = config.service_name.as_str();
		let key_ring = Arc::new(KeyRing::with_metrics(issuer.clone(), service, metrics.clone()));
		let validator = TokenValidator::with_metrics(key_ring.clone(), service, metrics.clone())
			.with_leeway(config.validation_leeway);
		let scheduler = Scheduler::spawn();
		let tokens = TokenLifecycleManager::with_metrics(
			&config,
			issuer,
			validator.clone(),
			scheduler.clone(),
			metrics.clone(),
		)?;
		let delivery = DeliveryEndpoint::new(
			tokens.clone(),
			validator.clone(),
			config.issuer_service_name.as_deref(),
		);

		Ok(Self { config: Arc::new(config), key_ring, validator, tokens, delivery, scheduler, metrics })
	}

	/// Arm the periodic key refresh, first run immediate, and acquire the first token.
	///
	/// Fails when the first token cannot be acquired.
	#[tracing::instrument(skip(self), fields(service = %self.config.service_name))]
	pub async fn start(&self) -> Result<Acquisition> {
		let key_ring = self.key_ring.clone();

		self.scheduler.schedule_fixed_rate(
			Duration::ZERO,
			self.config.key_refresh_interval,
			"key-refresh",
			move || {
				let key_ring = key_ring.clone();

				async move {
					if let Err(err) = key_ring.refresh().await {
						tracing::warn!(error = %err, "scheduled key refresh failed");
					}
				}
			},
		);

		tracing::info!(interval = ?self.config.key_refresh_interval, "s2s authentication starting");

		self.tokens.request_token().await
	}

	/// Configuration in use.
	pub fn config(&self) -> &S2sConfig {
		&self.config
	}

	/// Validator for inbound requests.
	pub fn validator(&self) -> &TokenValidator {
		&self.validator
	}

	/// Manager of this service's outbound token.
	pub fn tokens(&self) -> &TokenLifecycleManager {
		&self.tokens
	}

	/// Cached issuer keys.
	pub fn key_ring(&self) -> &Arc<KeyRing> {
		&self.key_ring
	}

	/// Handler for the receive-token path.
	pub fn delivery_endpoint(&self) -> &DeliveryEndpoint {
		&self.delivery
	}

	/// Point-in-time status.
	pub async fn status(&self) -> S2sStatus {
		let now = Utc::now();
		let token = self.tokens.current().await;
		let last_failure = self.tokens.last_failure();
		let keys = self.key_ring.snapshot().await;
		let state = match (&token, &last_failure) {
			(_, Some(_)) => TokenState::Failed,
			(None, None) => TokenState::Missing,
			(Some(token), None) if token.is_expired_at(now) => TokenState::Expired,
			(Some(_), None) => TokenState::Valid,
		};
		let metrics = self.metrics.snapshot();

		S2sStatus {
			service_name: self.config.service_name.clone(),
			token: state,
			token_valid_until: token.map(|token| token.valid_until()),
			next_token_refresh: self.tokens.next_refresh_at(),
			last_failure,
			key_count: keys.len(),
			key_ids: keys.key_ids(),
			keys_refreshed_at: keys.last_refreshed_at(),
			rejection_rate: metrics.rejection_rate(),
			metrics,
		}
	}

	/// Stop all background work. Tokens and keys already cached stay readable.
	pub fn shutdown(&self) {
		tracing::info!(service = %self.config.service_name, "s2s authentication shutting down");

		self.scheduler.shutdown();
	}
}
