use crate::acme::http::HttpClient;
use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;
use thiserror::Error;

pub type ProtocolResult<T> = Result<T, Error>;

/// Failure while talking to an ACME server
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CA returned an error: {0}")]
    AcmeProblem(#[from] Problem),
    #[error("CA violated the ACME protocol: {0}")]
    ProtocolViolation(&'static str),
    #[error("signing the request failed: {0}")]
    CryptoFailure(#[from] SignatureError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("gave up waiting: {0}")]
    TimedOut(&'static str),
}

impl Error {
    /// Turns an unsuccessful response into an error, preferring the problem document (RFC 7807) in its body.
    pub async fn get_error_from_http(err_response: reqwest::Response) -> Error {
        let retry_after = HttpClient::extract_backoff(&err_response);
        let status = err_response.status();
        let Ok(problem) = err_response.json::<Problem>().await else {
            return Error::AcmeProblem(Problem {
                typ: PROBLEM_TYPE_UNKNOWN.to_string(),
                detail: Some(format!("Server answered with status {status}")),
                subproblems: vec![],
            });
        };
        if problem.is_rate_limit() {
            Error::RateLimited(RateLimitError { problem, retry_after })
        } else {
            Error::AcmeProblem(problem)
        }
    }
}

pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
pub const ACME_UNAUTHORIZED: &str = "urn:ietf:params:acme:error:unauthorized";
pub const ACME_SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";
const PROBLEM_TYPE_UNKNOWN: &str = "about:blank";

/// An ACME problem document (RFC 8555 Section 6.7)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    #[serde(default)]
    pub subproblems: Vec<Subproblem>,
}

impl Problem {
    pub fn new(typ: &str, detail: &str) -> Self {
        Self {
            typ: typ.to_string(),
            detail: Some(detail.to_string()),
            subproblems: vec![],
        }
    }

    /// Whether the problem or any of its subproblems has the given type
    fn concerns(&self, typ: &str) -> bool {
        self.typ == typ || self.subproblems.iter().any(|sub| sub.typ == typ)
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.concerns(ACME_BAD_NONCE)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.concerns(ACME_RATE_LIMITED)
    }
}

impl std::error::Error for Problem {}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.detail.as_deref().unwrap_or(&self.typ))?;
        for subproblem in &self.subproblems {
            write!(f, "; {subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(identifier) = &self.identifier {
            write!(f, "{identifier}: ")?;
        }
        f.write_str(self.detail.as_deref().unwrap_or(&self.typ))
    }
}

#[derive(Debug)]
pub struct RateLimitError {
    pub problem: Problem,
    pub retry_after: Option<SystemTime>,
}

impl std::error::Error for RateLimitError {}

impl Display for RateLimitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CA rate limit hit: {}", self.problem)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, " (retry after {})", time::OffsetDateTime::from(retry_after))?;
        }
        Ok(())
    }
}
