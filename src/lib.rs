//! Service-to-service authentication: acquires, caches, and proactively refreshes this service's
//! own bearer token, and validates bearer tokens presented by peers against an issuer-published
//! public key ring.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod config;
pub mod endpoint;
pub mod gate;
pub mod issuer;
pub mod keys;
pub mod metrics;
pub mod scheduler;
pub mod token;
pub mod validator;

mod error;
mod service;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, ErrorKind, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	config::S2sConfig,
	error::{Error, ErrorKind, Result},
	issuer::{HttpIssuerClient, IssuerClient},
	keys::{AlgorithmFamily, KeyAlgorithm, KeyEntry, KeyRing, KeyRingSnapshot},
	service::{S2sAuth, S2sStatus, TokenState},
	token::{Acquisition, OutboundToken, RefreshPlan, TokenLifecycleManager},
	validator::{AllowList, Claims, TokenValidator},
};
