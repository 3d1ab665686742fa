//! Token acquisition through the issuer's asynchronous push.

// std
use std::time::Duration;
// crates.io
use http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION};
use s2s_auth::{Acquisition, ErrorKind, Result, S2sAuth, TokenState};
use serde_json::{Value, json};
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{method, path},
};
// self
use crate::common::*;

const REQUEST_PATH: &str = "/api/v1/request-token";

async fn mount_keys(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/api/v1/public-keys"))
		.respond_with(ResponseTemplate::new(200).set_body_json(key_set(&[("k1", RSA_PUBLIC)])))
		.mount(server)
		.await;
}

async fn token_request(server: &MockServer) -> Request {
	let poll = async {
		loop {
			let received = server.received_requests().await.unwrap_or_default();

			if let Some(request) = received.into_iter().find(|request| request.url.path() == REQUEST_PATH)
			{
				return request;
			}

			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	};

	tokio::time::timeout(Duration::from_secs(5), poll).await.expect("token request sent")
}

#[tokio::test]
async fn start_waits_for_the_pushed_token() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_keys(&server).await;
	Mock::given(method("POST"))
		.and(path(REQUEST_PATH))
		.respond_with(ResponseTemplate::new(202))
		.expect(1)
		.mount(&server)
		.await;

	let auth = S2sAuth::new(config(&server)?)?;
	let starter = {
		let auth = auth.clone();

		tokio::spawn(async move { auth.start().await })
	};
	let request = token_request(&server).await;
	let body: Value = serde_json::from_slice(&request.body)?;

	assert_eq!(body["serviceName"], "billing");
	assert_eq!(body["tokenReceiverUrl"], "http://billing.test/receive-token");

	let token = sign(RSA_PRIVATE, "k1", "billing", now(), 600);
	let delivery = serde_json::to_vec(&json!({ "token": token }))?;

	auth.delivery_endpoint()
		.receive_delivery(&HeaderMap::new(), &delivery)
		.await
		.expect("delivery accepted");

	let Acquisition::Delivered { token: stored, next_refresh_in } =
		starter.await.expect("start task")?
	else {
		panic!("token was pushed before the delivery timeout");
	};

	assert_eq!(stored.as_str(), token);
	assert!(next_refresh_in <= Duration::from_secs(300));
	assert!(next_refresh_in > Duration::from_secs(290));

	let status = auth.status().await;

	assert_eq!(status.token, TokenState::Valid);
	assert_eq!(status.token_valid_until, Some(stored.valid_until()));
	assert!(status.next_token_refresh.is_some());

	server.verify().await;
	auth.shutdown();

	Ok(())
}

#[tokio::test]
async fn rejected_token_request_fails_start() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_keys(&server).await;
	Mock::given(method("POST"))
		.and(path(REQUEST_PATH))
		.respond_with(ResponseTemplate::new(503).set_body_string("issuer unavailable"))
		.expect(1)
		.mount(&server)
		.await;

	let auth = S2sAuth::new(config(&server)?)?;
	let err = auth.start().await.expect_err("request rejected");

	assert_eq!(err.kind(), ErrorKind::Transport);
	assert_eq!(auth.status().await.token, TokenState::Missing);
	assert_eq!(auth.status().await.metrics.token_requests_failed, 1);

	server.verify().await;
	auth.shutdown();

	Ok(())
}

#[tokio::test]
async fn delivery_must_come_from_the_configured_issuer() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_keys(&server).await;

	let auth = S2sAuth::new(config(&server)?.with_issuer_service_name("issuer"))?;
	let endpoint = auth.delivery_endpoint();
	let delivery =
		serde_json::to_vec(&json!({ "token": sign(RSA_PRIVATE, "k1", "billing", now(), 600) }))?;
	let mut headers = HeaderMap::new();

	assert_eq!(
		endpoint.receive_delivery(&headers, &delivery).await.unwrap_err(),
		StatusCode::UNAUTHORIZED
	);

	let issuer_token = sign(RSA_PRIVATE, "k1", "issuer", now(), 600);

	headers.insert(
		AUTHORIZATION,
		HeaderValue::from_str(&format!("Bearer {issuer_token}")).expect("header value"),
	);

	let stored = endpoint.receive_delivery(&headers, &delivery).await.expect("issuer delivery");

	assert_eq!(auth.tokens().current().await, Some(stored));
	assert!(!auth.tokens().delivery_pending());

	auth.shutdown();

	Ok(())
}
