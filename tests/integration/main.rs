//! Integration tests driving `s2s-auth` against a mock issuer.

mod common;
mod key_refresh;
mod token_delivery;
