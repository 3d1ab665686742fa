//! Outbound token lifecycle: request, asynchronous delivery, and proactive renewal.
//!
//! The issuer answers a token request with a bare acknowledgement and later pushes the token to
//! our receive endpoint. [`TokenLifecycleManager::request_token`] bridges the two calls with the
//! pending-delivery [`Gate`] and then re-arms the refresh chain on the shared [`Scheduler`].

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	sync::{Mutex, PoisonError},
};
// crates.io
use tokio::sync::RwLock;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::S2sConfig,
	gate::{Completion, Gate},
	issuer::IssuerClient,
	metrics::{self, AuthMetrics},
	scheduler::Scheduler,
	validator::TokenValidator,
};

/// Divisor applied to the remaining lifetime of a fresh token.
pub const TOKEN_REFRESH_THRESHOLD: i32 = 2;
/// Remaining lifetime below which a failed refresh is retried urgently.
pub const URGENT_REMAINING: Duration = Duration::from_secs(2 * 60);
/// Retry delay while the current token is close to expiry.
pub const URGENT_RETRY: Duration = Duration::from_secs(5);
/// Retry delay while the current token is still safely valid.
pub const RELAXED_RETRY: Duration = Duration::from_secs(60);

/// This service's own bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundToken {
	value: String,
	valid_until: DateTime<Utc>,
	delivered_at: DateTime<Utc>,
}
impl OutboundToken {
	/// Wrap a delivered token.
	pub fn new(value: impl Into<String>, valid_until: DateTime<Utc>) -> Self {
		Self { value: value.into(), valid_until, delivered_at: Utc::now() }
	}

	/// Raw token for the `Authorization` header.
	pub fn as_str(&self) -> &str {
		&self.value
	}

	/// Expiry taken from the token's `exp` claim.
	pub fn valid_until(&self) -> DateTime<Utc> {
		self.valid_until
	}

	/// When the token was stored.
	pub fn delivered_at(&self) -> DateTime<Utc> {
		self.delivered_at
	}

	/// Whether the token has expired at `now`.
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		self.valid_until <= now
	}

	/// `Authorization` header value.
	pub fn bearer(&self) -> String {
		format!("Bearer {}", self.value)
	}

	fn same_as(&self, value: &str, valid_until: DateTime<Utc>) -> bool {
		self.value == value && self.valid_until == valid_until
	}
}
impl Debug for OutboundToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("OutboundToken")
			.field("value", &"<redacted>")
			.field("valid_until", &self.valid_until)
			.field("delivered_at", &self.delivered_at)
			.finish()
	}
}

/// Why a refresh was scheduled with a given delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshReason {
	/// Fresh token, refreshed at half its remaining lifetime.
	HalfLife,
	/// Delivered token was already expired.
	ExpiredOnArrival,
	/// Delivery failed and the current token expires within [`URGENT_REMAINING`].
	UrgentRetry,
	/// Delivery failed while the current token is still safely valid.
	RelaxedRetry,
}

/// Delay until the next token refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPlan {
	/// Time until the refresh fires.
	pub delay: Duration,
	/// What produced this delay.
	pub reason: RefreshReason,
}
impl RefreshPlan {
	/// Plan after a successful delivery of a token valid until `valid_until`.
	pub fn after_delivery(valid_until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
		let remaining = valid_until - now;

		if remaining <= TimeDelta::zero() {
			return Self { delay: URGENT_RETRY, reason: RefreshReason::ExpiredOnArrival };
		}

		let delay = (remaining / TOKEN_REFRESH_THRESHOLD).to_std().unwrap_or(URGENT_RETRY);

		Self { delay, reason: RefreshReason::HalfLife }
	}

	/// Plan after a failed acquisition, given the expiry of the token still held.
	///
	/// Fails with [`Error::Bootstrap`] when there is no token to fall back on.
	pub fn after_failure(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Self> {
		let Some(valid_until) = previous else {
			return Err(Error::Bootstrap(
				"Token acquisition failed and no token was ever delivered.".into(),
			));
		};
		let remaining = (valid_until - now).to_std().map_err(|_| {
			Error::Bootstrap(format!(
				"Token acquisition failed and the current token expired at {valid_until}."
			))
		})?;

		if remaining.is_zero() {
			return Err(Error::Bootstrap(format!(
				"Token acquisition failed and the current token expired at {valid_until}."
			)));
		}

		Ok(if remaining < URGENT_REMAINING {
			Self { delay: URGENT_RETRY, reason: RefreshReason::UrgentRetry }
		} else {
			Self { delay: RELAXED_RETRY, reason: RefreshReason::RelaxedRetry }
		})
	}
}

/// Outcome of [`TokenLifecycleManager::request_token`].
#[derive(Clone, Debug)]
pub enum Acquisition {
	/// A token arrived within the delivery timeout.
	Delivered {
		/// The stored token.
		token: Arc<OutboundToken>,
		/// Delay until the scheduled refresh.
		next_refresh_in: Duration,
	},
	/// No token arrived; a retry is scheduled and the previous token stays in use.
	Deferred {
		/// Delay until the scheduled retry.
		retry_in: Duration,
	},
}

/// Owns this service's outbound token and its refresh chain.
#[derive(Clone)]
pub struct TokenLifecycleManager {
	inner: Arc<Inner>,
}
impl TokenLifecycleManager {
	/// Create a manager for the service described by `config`.
	pub fn new(
		config: &S2sConfig,
		issuer: Arc<dyn IssuerClient>,
		validator: TokenValidator,
		scheduler: Scheduler,
	) -> Result<Self> {
		Self::with_metrics(config, issuer, validator, scheduler, AuthMetrics::new())
	}

	pub(crate) fn with_metrics(
		config: &S2sConfig,
		issuer: Arc<dyn IssuerClient>,
		validator: TokenValidator,
		scheduler: Scheduler,
		metrics: Arc<AuthMetrics>,
	) -> Result<Self> {
		let inner = Inner {
			service_name: config.service_name.clone(),
			receive_url: config.receive_token_url()?,
			delivery_timeout: config.delivery_timeout,
			issuer,
			validator,
			scheduler,
			metrics,
			token: RwLock::new(None),
			pending: Gate::new("token-delivery"),
			next_refresh: Mutex::new(None),
			last_failure: Mutex::new(None),
		};

		Ok(Self { inner: Arc::new(inner) })
	}

	/// Service this manager acquires tokens for.
	pub fn service_name(&self) -> &str {
		&self.inner.service_name
	}

	/// Current token, if one has been delivered.
	pub async fn current(&self) -> Option<Arc<OutboundToken>> {
		self.inner.token.read().await.clone()
	}

	/// When the next refresh is due, if one is scheduled.
	pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
		*self.inner.next_refresh.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Last fatal failure of the refresh chain, cleared by the next delivery.
	pub fn last_failure(&self) -> Option<String> {
		self.inner.last_failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Whether a token request is waiting for its delivery.
	pub fn delivery_pending(&self) -> bool {
		self.inner.pending.in_flight().is_some()
	}

	/// Ask the issuer for a token and wait for its delivery, then schedule the next refresh.
	///
	/// A failed send is returned immediately without scheduling anything. A missing delivery falls
	/// back to the current token and schedules a retry, or fails with [`Error::Bootstrap`] when there
	/// is no usable token.
	#[tracing::instrument(skip(self), fields(service = %self.inner.service_name))]
	pub async fn request_token(&self) -> Result<Acquisition> {
		let inner = &self.inner;
		let mut ticket = inner.pending.open();
		let waiter = ticket.waiter();

		if let Err(err) = inner.issuer.request_token(&inner.service_name, &inner.receive_url).await {
			metrics::record_token_request(&inner.service_name, false);
			inner.metrics.record_token_request(false);

			tracing::warn!(error = %err, "token request was not accepted");

			return Err(err);
		}

		metrics::record_token_request(&inner.service_name, true);
		inner.metrics.record_token_request(true);

		tracing::debug!(timeout = ?inner.delivery_timeout, "token request accepted; awaiting delivery");

		let completion = waiter.wait_timeout(inner.delivery_timeout).await;

		drop(ticket);

		let delivered = match completion {
			Some(Completion::Succeeded) => self.current().await,
			_ => None,
		};
		let now = Utc::now();

		match delivered {
			Some(token) => {
				let plan = RefreshPlan::after_delivery(token.valid_until(), now);

				tracing::info!(valid_until = %token.valid_until(), delay = ?plan.delay, "token acquired");

				self.schedule_refresh(plan.delay);

				Ok(Acquisition::Delivered { token, next_refresh_in: plan.delay })
			},
			None => {
				let previous = self.current().await.map(|token| token.valid_until());
				let plan = RefreshPlan::after_failure(previous, now)?;

				tracing::warn!(
					?completion,
					delay = ?plan.delay,
					reason = ?plan.reason,
					"token delivery did not arrive; retry scheduled"
				);

				self.schedule_refresh(plan.delay);

				Ok(Acquisition::Deferred { retry_in: plan.delay })
			},
		}
	}

	/// Verify a pushed token and store it.
	///
	/// The token must carry a valid issuer signature and name this service in `serviceName`; its
	/// `exp` claim becomes the stored expiry.
	#[tracing::instrument(skip_all, fields(service = %self.inner.service_name))]
	pub async fn receive_token(&self, raw: &str) -> Result<Arc<OutboundToken>> {
		let claims = self.inner.validator.validate(raw, None).await?;

		if claims.service_name.as_deref() != Some(self.inner.service_name.as_str()) {
			return Err(Error::ForbiddenCaller {
				service: claims.service_name.unwrap_or_default(),
			});
		}

		let valid_until = claims.expires_at()?;

		Ok(self.on_token_delivered(raw, valid_until).await)
	}

	/// Store a delivered token and release the pending request, if any.
	///
	/// Re-delivering the token already held leaves it untouched.
	pub async fn on_token_delivered(
		&self,
		value: &str,
		valid_until: DateTime<Utc>,
	) -> Arc<OutboundToken> {
		let inner = &self.inner;
		let token = {
			let mut slot = inner.token.write().await;

			match slot.as_ref() {
				Some(current) if current.same_as(value, valid_until) => current.clone(),
				_ => {
					let token = Arc::new(OutboundToken::new(value, valid_until));

					*slot = Some(token.clone());

					token
				},
			}
		};

		*inner.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = None;

		metrics::record_token_delivery(&inner.service_name);
		inner.metrics.record_delivery();

		let released = inner.pending.release(Completion::Succeeded);

		tracing::debug!(%valid_until, released, "token delivered");

		token
	}

	pub(crate) fn schedule_refresh(&self, delay: Duration) {
		let manager = self.clone();

		*self.inner.next_refresh.lock().unwrap_or_else(PoisonError::into_inner) =
			TimeDelta::from_std(delay).ok().map(|delay| Utc::now() + delay);

		self.inner.scheduler.schedule_in(delay, "token-refresh", async move {
			manager.run_scheduled_refresh().await;
		});
	}

	async fn run_scheduled_refresh(&self) {
		match self.request_token().await {
			Ok(_) => {},
			Err(err) if err.is_transport() => {
				let previous = self.current().await.map(|token| token.valid_until());

				match RefreshPlan::after_failure(previous, Utc::now()) {
					Ok(plan) => {
						tracing::warn!(error = %err, delay = ?plan.delay, "scheduled token refresh failed; retry scheduled");

						self.schedule_refresh(plan.delay);
					},
					Err(fatal) => self.record_fatal(fatal),
				}
			},
			Err(err) => self.record_fatal(err),
		}
	}

	fn record_fatal(&self, err: Error) {
		tracing::error!(service = %self.inner.service_name, error = %err, "token refresh chain stopped");

		*self.inner.next_refresh.lock().unwrap_or_else(PoisonError::into_inner) = None;
		*self.inner.last_failure.lock().unwrap_or_else(PoisonError::into_inner) =
			Some(err.to_string());
	}
}
impl Debug for TokenLifecycleManager {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenLifecycleManager")
			.field("service_name", &self.inner.service_name)
			.field("receive_url", &self.inner.receive_url.as_str())
			.field("pending", &self.inner.pending)
			.finish_non_exhaustive()
	}
}

struct Inner {
	service_name: String,
	receive_url: Url,
	delivery_timeout: Duration,
	issuer: Arc<dyn IssuerClient>,
	validator: TokenValidator,
	scheduler: Scheduler,
	metrics: Arc<AuthMetrics>,
	token: RwLock<Option<Arc<OutboundToken>>>,
	pending: Gate,
	next_refresh: Mutex<Option<DateTime<Utc>>>,
	last_failure: Mutex<Option<String>>,
}
