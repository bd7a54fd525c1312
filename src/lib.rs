//! Keeps TLS certificates for a set of domains current by renewing them through an ACME CA.
//!
//! The entry point is [`manager::Manager`], which tracks domains, renews their certificates in batches using
//! `http-01` challenges and stores one key and certificate chain per domain in a storage directory.

pub mod acme;
pub mod cert;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod issuer;
pub mod keystore;
pub mod manager;
pub mod storage;
pub mod time;
pub mod util;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
