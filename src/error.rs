//! Crate-wide error types and `Result` alias.

// crates.io
use http::StatusCode;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the S2S authentication crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Base64(#[from] base64::DecodeError),
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Bootstrap failure: {0}")]
	Bootstrap(String),
	#[error("Caller '{service}' is not permitted by the allow-list.")]
	ForbiddenCaller { service: String },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: StatusCode, url: url::Url, body: Option<String> },
	#[error("Malformed token: {0}")]
	MalformedToken(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Unauthorized signer: {0}")]
	UnauthorizedSigner(String),
	#[error("Unsupported key algorithm '{0}'.")]
	UnsupportedAlgorithm(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Classify the error into the failure taxonomy used by callers.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Reqwest(_) | Self::HttpStatus { .. } => ErrorKind::Transport,
			Self::MalformedToken(_) => ErrorKind::MalformedToken,
			Self::UnauthorizedSigner(_) => ErrorKind::Unauthorized,
			Self::ForbiddenCaller { .. } => ErrorKind::Forbidden,
			Self::Bootstrap(_) => ErrorKind::Bootstrap,
			Self::Validation { .. } | Self::Url(_) => ErrorKind::Configuration,
			Self::Base64(_)
			| Self::Http(_)
			| Self::Jsonwebtoken(_)
			| Self::Serde(_)
			| Self::Metrics(_)
			| Self::UnsupportedAlgorithm(_) => ErrorKind::Internal,
		}
	}

	/// HTTP status an inbound request should be rejected with when validation fails.
	///
	/// Only a forbidden caller maps to 403; every other failure is a 401.
	pub fn status_code(&self) -> StatusCode {
		match self.kind() {
			ErrorKind::Forbidden => StatusCode::FORBIDDEN,
			_ => StatusCode::UNAUTHORIZED,
		}
	}

	/// Whether the failure came from talking to the issuer.
	pub fn is_transport(&self) -> bool {
		self.kind() == ErrorKind::Transport
	}
}

/// Coarse failure classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	/// Network or non-2xx failure talking to the issuer.
	Transport,
	/// Structurally invalid bearer token.
	MalformedToken,
	/// Unknown key id, bad signature, or expired token.
	Unauthorized,
	/// Verified caller outside the allow-list.
	Forbidden,
	/// No usable state to fall back on.
	Bootstrap,
	/// Invalid configuration.
	Configuration,
	/// Anything else, such as undecodable issuer payloads.
	Internal,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_forbidden_maps_to_403() {
		let forbidden = Error::ForbiddenCaller { service: "billing".into() };

		assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);

		for err in [
			Error::MalformedToken("two segments".into()),
			Error::UnauthorizedSigner("unknown kid".into()),
			Error::Bootstrap("no keys".into()),
		] {
			assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{err}");
		}
	}

	#[test]
	fn upstream_status_is_a_transport_failure() {
		let err = Error::HttpStatus {
			status: StatusCode::BAD_GATEWAY,
			url: url::Url::parse("https://issuer.internal/api/v1/public-keys").unwrap(),
			body: None,
		};

		assert!(err.is_transport());
		assert_eq!(err.kind(), ErrorKind::Transport);
	}
}
