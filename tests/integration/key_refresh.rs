//! Key ring refresh behaviour against a mock issuer.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use s2s_auth::{AllowList, ErrorKind, Result, S2sAuth};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};
// self
use crate::common::*;

const KEYS_PATH: &str = "/api/v1/public-keys";

#[tokio::test]
async fn concurrent_validations_share_one_key_fetch() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(KEYS_PATH))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(key_set(&[("k1", RSA_PUBLIC)]))
				.set_delay(Duration::from_millis(100)),
		)
		.expect(1)
		.mount(&server)
		.await;

	let auth = S2sAuth::new(config(&server)?)?;
	let token = sign(RSA_PRIVATE, "k1", "orders", now(), 600);
	let allow: AllowList = ["billing", "orders"].into_iter().collect();
	let validations = (0..16)
		.map(|_| {
			let validator = auth.validator().clone();
			let token = token.clone();
			let allow = allow.clone();

			tokio::spawn(async move { validator.validate(&token, Some(&allow)).await })
		})
		.collect::<Vec<_>>();

	for validation in validations {
		let claims = validation.await.expect("validation task")?;

		assert_eq!(claims.service_name.as_deref(), Some("orders"));
		assert_eq!(claims.kid, "k1");
	}

	assert_eq!(auth.key_ring().snapshot().await.key_ids(), vec!["k1".to_owned()]);

	server.verify().await;
	auth.shutdown();

	Ok(())
}

#[tokio::test]
async fn rotated_key_is_fetched_once_and_stale_unknown_keys_are_not() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let before_rotation = key_set(&[("k1", RSA_PUBLIC)]);
	let after_rotation = key_set(&[("k1", RSA_PUBLIC), ("k2", ROTATED_PUBLIC)]);
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();

	Mock::given(method("GET"))
		.and(path(KEYS_PATH))
		.respond_with(move |_: &wiremock::Request| {
			let body = match counter.fetch_add(1, Ordering::SeqCst) {
				0 => before_rotation.clone(),
				_ => after_rotation.clone(),
			};

			ResponseTemplate::new(200).set_body_json(body)
		})
		.expect(2)
		.mount(&server)
		.await;

	let auth = S2sAuth::new(config(&server)?)?;
	let validator = auth.validator();

	validator.validate(&sign(RSA_PRIVATE, "k1", "orders", now() - 5, 600), None).await?;

	// Issued after the last refresh, so the missing key may be new.
	let rotated = sign(ROTATED_PRIVATE, "k2", "orders", now() + 2, 600);
	let claims = validator.validate(&rotated, None).await?;

	assert_eq!(claims.kid, "k2");

	// Issued before the last refresh; refetching cannot produce it.
	let unknown = sign(ROTATED_PRIVATE, "k3", "orders", now() - 60, 600);
	let err = validator.validate(&unknown, None).await.expect_err("unknown key");

	assert_eq!(err.kind(), ErrorKind::Unauthorized);
	assert_eq!(calls.load(Ordering::SeqCst), 2);

	server.verify().await;
	auth.shutdown();

	Ok(())
}

#[tokio::test]
async fn failed_key_fetch_rejects_and_is_retried_on_next_validation() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(KEYS_PATH))
		.respond_with(ResponseTemplate::new(500))
		.expect(2)
		.mount(&server)
		.await;

	let auth = S2sAuth::new(config(&server)?)?;
	let token = sign(RSA_PRIVATE, "k1", "orders", now(), 600);

	for _ in 0..2 {
		let err = auth.validator().validate(&token, None).await.expect_err("no keys");

		assert_eq!(err.kind(), ErrorKind::Transport);
		assert_eq!(err.status_code(), http::StatusCode::UNAUTHORIZED);
	}

	assert!(auth.key_ring().snapshot().await.is_empty());

	let status = auth.status().await;

	assert_eq!(status.metrics.key_refresh_errors, 2);
	assert_eq!(status.metrics.validations_rejected, 2);

	server.verify().await;
	auth.shutdown();

	Ok(())
}
