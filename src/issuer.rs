//! Outbound calls to the token issuer.

// std
use std::{collections::HashMap, future::Future, pin::Pin};
// crates.io
use reqwest::{Client, redirect::Policy};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, config::S2sConfig};

/// Boxed future returned by [`IssuerClient`] operations.
pub type IssuerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Issuer-published key set keyed by key id.
pub type WireKeySet = HashMap<String, WirePublicKey>;

/// Public key as published by the issuer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePublicKey {
	/// Algorithm label such as `RS256` or `EdDSA`.
	#[serde(rename = "type")]
	pub algorithm: String,
	/// Base64 DER SubjectPublicKeyInfo.
	#[serde(rename = "publicKey")]
	pub public_key: String,
}

/// Body of a token issuance request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
	/// Service the token is minted for.
	pub service_name: String,
	/// Where the issuer pushes the minted token.
	pub token_receiver_url: Url,
}

/// The two outbound operations this crate needs from the issuer.
///
/// Implementations perform a single attempt; retry policy lives with the callers.
pub trait IssuerClient: Send + Sync {
	/// Fetch the issuer's current public keys.
	fn get_public_keys(&self) -> IssuerFuture<'_, WireKeySet>;

	/// Ask the issuer to mint a token and push it to `receive_url`.
	///
	/// Success only means the request was accepted; the token arrives separately.
	fn request_token<'a>(
		&'a self,
		service_name: &'a str,
		receive_url: &'a Url,
	) -> IssuerFuture<'a, ()>;
}

/// `reqwest`-backed issuer client.
#[derive(Clone, Debug)]
pub struct HttpIssuerClient {
	client: Client,
	public_keys_url: Url,
	request_token_url: Url,
	request_timeout: Duration,
}
impl HttpIssuerClient {
	/// Build a client with the default reqwest configuration.
	pub fn new(config: &S2sConfig) -> Result<Self> {
		let client = Client::builder()
			.redirect(Policy::none())
			.user_agent(format!("s2s-auth/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Self::with_client(config, client)
	}

	/// Build a client around the supplied reqwest client (primarily for tests).
	pub fn with_client(config: &S2sConfig, client: Client) -> Result<Self> {
		Ok(Self {
			client,
			public_keys_url: config.public_keys_url()?,
			request_token_url: config.request_token_url()?,
			request_timeout: config.request_timeout,
		})
	}

	async fn fetch_public_keys(&self) -> Result<WireKeySet> {
		let start = Instant::now();
		let response = self
			.client
			.get(self.public_keys_url.clone())
			.timeout(self.request_timeout)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			tracing::warn!(%status, body = ?body, "unable to get public keys");

			return Err(Error::HttpStatus { status, url: self.public_keys_url.clone(), body });
		}

		let bytes = response.bytes().await?;
		let keys: WireKeySet = serde_json::from_slice(&bytes)?;

		tracing::info!(count = keys.len(), elapsed = ?start.elapsed(), "received public keys");

		Ok(keys)
	}

	async fn send_token_request(&self, service_name: &str, receive_url: &Url) -> Result<()> {
		let body = TokenRequest {
			service_name: service_name.to_owned(),
			token_receiver_url: receive_url.clone(),
		};
		let response = self
			.client
			.post(self.request_token_url.clone())
			.timeout(self.request_timeout)
			.json(&body)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			tracing::warn!(%status, body = ?body, "unable to request token");

			return Err(Error::HttpStatus { status, url: self.request_token_url.clone(), body });
		}

		tracing::info!(service = service_name, "token request accepted");

		Ok(())
	}
}
impl IssuerClient for HttpIssuerClient {
	fn get_public_keys(&self) -> IssuerFuture<'_, WireKeySet> {
		Box::pin(self.fetch_public_keys())
	}

	fn request_token<'a>(
		&'a self,
		service_name: &'a str,
		receive_url: &'a Url,
	) -> IssuerFuture<'a, ()> {
		Box::pin(self.send_token_request(service_name, receive_url))
	}
}
