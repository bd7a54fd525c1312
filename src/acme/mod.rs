//! ACME (RFC 8555) protocol plumbing.
//!
//! The `client` submodule maps the protocol's requests onto async functions. `transport` narrows these down to the
//! handful of operations the renewal engine drives, so the engine can run against an in-process fake CA as well.

pub mod client;
pub mod error;
pub mod http;
pub mod object;
pub mod transport;
