//! Service identity, issuer location, and timing configuration.

// std
use std::{collections::HashMap, env};
// crates.io
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::_prelude::*;

/// Path on this service that receives pushed tokens.
pub const RECEIVE_TOKEN_PATH: &str = "/receive-token";
/// Issuer path publishing the current signing keys.
pub const PUBLIC_KEYS_PATH: &str = "/api/v1/public-keys";
/// Issuer path accepting token issuance requests.
pub const REQUEST_TOKEN_PATH: &str = "/api/v1/request-token";
/// How long `request_token` waits for the pushed token.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Fixed interval of the background key refresh.
pub const DEFAULT_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Per-request timeout for issuer calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Clock skew tolerated when checking `exp`.
pub const DEFAULT_VALIDATION_LEEWAY: Duration = Duration::from_secs(60);
/// Maximum accepted length of a service name.
pub const MAX_SERVICE_NAME_LEN: usize = 128;

/// Configuration for one S2S participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S2sConfig {
	/// Name this service is known by; sent to the issuer and expected in our own tokens.
	pub service_name: String,
	/// Externally reachable base URL of this service.
	pub service_url: Url,
	/// Base URL of the token issuer.
	pub issuer_url: Url,
	/// Service name the issuer signs its own delivery requests with.
	#[serde(default)]
	pub issuer_service_name: Option<String>,
	/// Bounded wait for the asynchronous token push.
	#[serde(default = "default_delivery_timeout")]
	pub delivery_timeout: Duration,
	/// Fixed rate of the background key refresh.
	#[serde(default = "default_key_refresh_interval")]
	pub key_refresh_interval: Duration,
	/// Timeout applied to each issuer HTTP call.
	#[serde(default = "default_request_timeout")]
	pub request_timeout: Duration,
	/// Leeway applied to expiry checks.
	#[serde(default = "default_validation_leeway")]
	pub validation_leeway: Duration,
	/// Whether both URLs must use HTTPS.
	#[serde(default = "default_true")]
	pub require_https: bool,
}
impl S2sConfig {
	/// Construct a configuration with default timings.
	pub fn new(
		service_name: impl Into<String>,
		service_url: impl AsRef<str>,
		issuer_url: impl AsRef<str>,
	) -> Result<Self> {
		Ok(Self {
			service_name: service_name.into(),
			service_url: Url::parse(service_url.as_ref())?,
			issuer_url: Url::parse(issuer_url.as_ref())?,
			issuer_service_name: None,
			delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
			key_refresh_interval: DEFAULT_KEY_REFRESH_INTERVAL,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			validation_leeway: DEFAULT_VALIDATION_LEEWAY,
			require_https: true,
		})
	}

	/// Load configuration from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_vars(&env::vars().collect())
	}

	/// Load configuration from a variable map.
	///
	/// `S2S_SERVICE_NAME`, `S2S_SERVICE_URL` and `S2S_SERVER_URL` are required.
	pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
		let service_name = required_var(vars, "S2S_SERVICE_NAME", "service_name")?;
		let service_url = required_var(vars, "S2S_SERVICE_URL", "service_url")?;
		let issuer_url = required_var(vars, "S2S_SERVER_URL", "issuer_url")?;
		let mut config = Self::new(service_name, service_url, issuer_url)?;

		config.issuer_service_name = vars.get("S2S_ISSUER_SERVICE_NAME").cloned();

		if let Some(secs) = seconds_var(vars, "S2S_DELIVERY_TIMEOUT_SECS", "delivery_timeout")? {
			config.delivery_timeout = secs;
		}
		if let Some(secs) =
			seconds_var(vars, "S2S_KEY_REFRESH_INTERVAL_SECS", "key_refresh_interval")?
		{
			config.key_refresh_interval = secs;
		}
		if let Some(raw) = vars.get("S2S_REQUIRE_HTTPS") {
			config.require_https = raw.parse().map_err(|_| Error::Validation {
				field: "require_https",
				reason: format!("Expected 'true' or 'false', got '{raw}'."),
			})?;
		}

		config.validate()?;

		Ok(config)
	}

	/// Set HTTPS requirement to the desired value.
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Override the delivery wait.
	pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
		self.delivery_timeout = timeout;

		self
	}

	/// Override the background key refresh interval.
	pub fn with_key_refresh_interval(mut self, interval: Duration) -> Self {
		self.key_refresh_interval = interval;

		self
	}

	/// Require deliveries to be authenticated as the given issuer service.
	pub fn with_issuer_service_name(mut self, name: impl Into<String>) -> Self {
		self.issuer_service_name = Some(name.into());

		self
	}

	/// URL the issuer pushes our tokens to.
	pub fn receive_token_url(&self) -> Result<Url> {
		join_path(&self.service_url, RECEIVE_TOKEN_PATH)
	}

	/// Issuer endpoint returning the public key set.
	pub fn public_keys_url(&self) -> Result<Url> {
		join_path(&self.issuer_url, PUBLIC_KEYS_PATH)
	}

	/// Issuer endpoint accepting token requests.
	pub fn request_token_url(&self) -> Result<Url> {
		join_path(&self.issuer_url, REQUEST_TOKEN_PATH)
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		validate_service_name("service_name", &self.service_name)?;

		if let Some(issuer) = &self.issuer_service_name {
			validate_service_name("issuer_service_name", issuer)?;
		}
		if self.require_https {
			for (field, url) in [("service_url", &self.service_url), ("issuer_url", &self.issuer_url)]
			{
				if url.scheme() != "https" {
					return Err(Error::Validation {
						field,
						reason: format!("{url} must use HTTPS."),
					});
				}
			}
		}
		for (field, url) in [("service_url", &self.service_url), ("issuer_url", &self.issuer_url)] {
			if url.host_str().is_none() {
				return Err(Error::Validation {
					field,
					reason: "Must include a host component.".into(),
				});
			}
		}
		for (field, value) in [
			("delivery_timeout", self.delivery_timeout),
			("key_refresh_interval", self.key_refresh_interval),
			("request_timeout", self.request_timeout),
		] {
			if value.is_zero() {
				return Err(Error::Validation {
					field,
					reason: "Must be greater than zero.".into(),
				});
			}
		}

		Ok(())
	}
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
	let joined = format!("{}{path}", base.as_str().trim_end_matches('/'));

	Ok(Url::parse(&joined)?)
}

fn required_var(
	vars: &HashMap<String, String>,
	name: &str,
	field: &'static str,
) -> Result<String> {
	vars.get(name)
		.cloned()
		.ok_or_else(|| Error::Validation { field, reason: format!("{name} is not set.") })
}

fn seconds_var(
	vars: &HashMap<String, String>,
	name: &str,
	field: &'static str,
) -> Result<Option<Duration>> {
	vars.get(name)
		.map(|raw| {
			raw.parse::<u64>().map(Duration::from_secs).map_err(|_| Error::Validation {
				field,
				reason: format!("{name} must be a whole number of seconds, got '{raw}'."),
			})
		})
		.transpose()
}

fn validate_service_name(field: &'static str, value: &str) -> Result<()> {
	if value.trim().is_empty() {
		return Err(Error::Validation { field, reason: "Must not be empty.".into() });
	}
	if value.len() > MAX_SERVICE_NAME_LEN {
		return Err(Error::Validation {
			field,
			reason: format!("Must be {MAX_SERVICE_NAME_LEN} characters or fewer."),
		});
	}

	Ok(())
}

fn default_true() -> bool {
	true
}

fn default_delivery_timeout() -> Duration {
	DEFAULT_DELIVERY_TIMEOUT
}

fn default_key_refresh_interval() -> Duration {
	DEFAULT_KEY_REFRESH_INTERVAL
}

fn default_request_timeout() -> Duration {
	DEFAULT_REQUEST_TIMEOUT
}

fn default_validation_leeway() -> Duration {
	DEFAULT_VALIDATION_LEEWAY
}

#[cfg(test)]
mod tests {
	use super::*;

	fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	#[test]
	fn derives_issuer_and_receiver_urls() {
		let config =
			S2sConfig::new("billing", "https://billing.internal/", "https://issuer.internal")
				.expect("config");

		assert_eq!(
			config.receive_token_url().unwrap().as_str(),
			"https://billing.internal/receive-token"
		);
		assert_eq!(
			config.public_keys_url().unwrap().as_str(),
			"https://issuer.internal/api/v1/public-keys"
		);
		assert_eq!(
			config.request_token_url().unwrap().as_str(),
			"https://issuer.internal/api/v1/request-token"
		);
	}

	#[test]
	fn loads_from_vars_with_overrides() {
		let config = S2sConfig::from_vars(&vars(&[
			("S2S_SERVICE_NAME", "orders"),
			("S2S_SERVICE_URL", "http://orders:8080"),
			("S2S_SERVER_URL", "http://issuer:8080"),
			("S2S_REQUIRE_HTTPS", "false"),
			("S2S_DELIVERY_TIMEOUT_SECS", "5"),
		]))
		.expect("config");

		assert_eq!(config.service_name, "orders");
		assert_eq!(config.delivery_timeout, Duration::from_secs(5));
		assert_eq!(config.key_refresh_interval, DEFAULT_KEY_REFRESH_INTERVAL);
		assert!(!config.require_https);
	}

	#[test]
	fn missing_required_var_is_reported() {
		let err = S2sConfig::from_vars(&vars(&[("S2S_SERVICE_NAME", "orders")]))
			.expect_err("missing urls");

		assert!(matches!(err, Error::Validation { field: "service_url", .. }));
	}

	#[test]
	fn plain_http_rejected_when_https_required() {
		let config = S2sConfig::new("orders", "http://orders:8080", "https://issuer.internal")
			.expect("config");

		assert!(matches!(config.validate(), Err(Error::Validation { field: "service_url", .. })));
		assert!(config.with_require_https(false).validate().is_ok());
	}

	#[test]
	fn zero_delivery_timeout_is_rejected() {
		let config = S2sConfig::new("orders", "https://orders", "https://issuer")
			.expect("config")
			.with_delivery_timeout(Duration::ZERO);

		assert!(matches!(
			config.validate(),
			Err(Error::Validation { field: "delivery_timeout", .. })
		));
	}
}
