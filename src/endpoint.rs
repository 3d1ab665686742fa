//! HTTP-layer call contracts: bearer extraction, per-endpoint allow-lists, request authentication,
//! and the inbound token delivery handler.
//!
//! Nothing here binds to a server framework; handlers pass `http` types in and get status codes
//! back.

// crates.io
use http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	config::RECEIVE_TOKEN_PATH,
	token::{OutboundToken, TokenLifecycleManager},
	validator::{AllowList, Claims, TokenValidator},
};

const BEARER_PREFIX: &str = "Bearer ";

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// Returns `None` when the header is missing, not valid ASCII, or uses another scheme.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers.get(AUTHORIZATION)?.to_str().ok()?.strip_prefix(BEARER_PREFIX).map(str::trim)
}

/// Allow-lists declared on a resource and on one of its operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessPolicy {
	/// Resource-wide allow-list.
	pub resource: Option<AllowList>,
	/// Operation-specific allow-list.
	pub operation: Option<AllowList>,
}
impl AccessPolicy {
	/// Policy that admits any verified caller.
	pub fn open() -> Self {
		Self::default()
	}

	/// Policy with only an operation-level allow-list.
	pub fn operation<I, S>(services: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self { resource: None, operation: Some(services.into_iter().collect()) }
	}

	/// Add a resource-level allow-list.
	pub fn with_resource<I, S>(mut self, services: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.resource = Some(services.into_iter().collect());

		self
	}

	/// Effective allow-list: the union of both levels, whichever exists, or none.
	pub fn merge(&self) -> Option<AllowList> {
		AllowList::merge(self.resource.as_ref(), self.operation.as_ref())
	}
}

/// Result of authenticating one request.
#[derive(Clone, Debug, PartialEq)]
pub enum Authentication {
	/// No bearer token; the endpoint decides whether anonymous access is acceptable.
	Anonymous,
	/// Verified caller.
	Authenticated(Claims),
	/// Token presented but rejected.
	Rejected(StatusCode),
}
impl Authentication {
	/// Verified claims, if any.
	pub fn claims(&self) -> Option<&Claims> {
		match self {
			Self::Authenticated(claims) => Some(claims),
			_ => None,
		}
	}

	/// Status to answer with, if the request must be refused.
	pub fn rejection(&self) -> Option<StatusCode> {
		match self {
			Self::Rejected(status) => Some(*status),
			_ => None,
		}
	}
}

/// Authenticate a request by its headers.
pub async fn authenticate(
	validator: &TokenValidator,
	headers: &HeaderMap,
	allow_list: Option<&AllowList>,
) -> Authentication {
	let Some(token) = bearer_token(headers) else {
		return Authentication::Anonymous;
	};

	match validator.validate(token, allow_list).await {
		Ok(claims) => Authentication::Authenticated(claims),
		Err(err) => Authentication::Rejected(err.status_code()),
	}
}

/// Authenticate a request and attach the verified [`Claims`] to its extensions.
///
/// Requests that already carry claims are not validated again.
pub async fn authenticate_request<B>(
	validator: &TokenValidator,
	request: &mut Request<B>,
	policy: &AccessPolicy,
) -> Authentication {
	if let Some(claims) = request.extensions().get::<Claims>() {
		return Authentication::Authenticated(claims.clone());
	}

	let allow_list = policy.merge();
	let outcome = authenticate(validator, request.headers(), allow_list.as_ref()).await;

	if let Authentication::Authenticated(claims) = &outcome {
		request.extensions_mut().insert(claims.clone());
	}

	outcome
}

/// Body pushed by the issuer to the receive endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenDelivery {
	/// Newly minted token.
	pub token: String,
}

/// Handler behind this service's receive-token path.
#[derive(Clone, Debug)]
pub struct DeliveryEndpoint {
	tokens: TokenLifecycleManager,
	validator: TokenValidator,
	issuer: Option<AllowList>,
}
impl DeliveryEndpoint {
	/// Create the handler; when `issuer_service_name` is set, the delivery request itself must carry
	/// a bearer token from that service.
	pub fn new(
		tokens: TokenLifecycleManager,
		validator: TokenValidator,
		issuer_service_name: Option<&str>,
	) -> Self {
		let issuer = issuer_service_name.map(|name| [name].into_iter().collect());

		Self { tokens, validator, issuer }
	}

	/// Path the handler should be mounted on.
	pub fn path(&self) -> &'static str {
		RECEIVE_TOKEN_PATH
	}

	/// Handle one delivery and return the stored token, or the status to answer with.
	#[tracing::instrument(skip_all, fields(service = %self.tokens.service_name()))]
	pub async fn receive_delivery(
		&self,
		headers: &HeaderMap,
		body: &[u8],
	) -> std::result::Result<Arc<OutboundToken>, StatusCode> {
		if let Some(issuer) = &self.issuer {
			let Some(token) = bearer_token(headers) else {
				tracing::warn!("delivery without issuer credentials rejected");

				return Err(StatusCode::UNAUTHORIZED);
			};

			if let Err(err) = self.validator.validate(token, Some(issuer)).await {
				tracing::warn!(error = %err, "delivery from unverified sender rejected");

				return Err(err.status_code());
			}
		}

		let delivery: TokenDelivery = serde_json::from_slice(body).map_err(|err| {
			tracing::warn!(error = %err, "undecodable delivery body");

			StatusCode::BAD_REQUEST
		})?;

		self.tokens.receive_token(&delivery.token).await.map_err(|err| {
			tracing::warn!(error = %err, "delivered token rejected");

			err.status_code()
		})
	}
}
