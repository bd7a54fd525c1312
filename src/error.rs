use crate::acme;
use crate::acme::error::Error as AcmeError;
use std::fmt::{Debug, Formatter};

pub type IssueResult<T> = Result<T, IssueError>;

/// Why an issuance attempt failed.
pub enum IssueError {
    /// The engine shut down while the attempt was in flight
    Cancelled,
    /// Nothing to issue for: the batch was empty
    NoDomains,
    /// The CA offered no challenge we can solve for this domain
    NoChallengeFound(String),
    ClientFailure(anyhow::Error),
    RateLimited(anyhow::Error),
    CAFailure(anyhow::Error),
    AuthFailure(anyhow::Error),
}

impl IssueError {
    /// Whether the engine should schedule another attempt after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IssueError::Cancelled | IssueError::NoDomains)
    }
}

impl std::error::Error for IssueError {}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            IssueError::Cancelled => write!(f, "issuance was cancelled"),
            IssueError::NoDomains => write!(f, "no domains to issue a certificate for"),
            IssueError::NoChallengeFound(domain) => {
                write!(f, "the CA offered no supported challenge for {domain}")
            }
            IssueError::ClientFailure(err)
            | IssueError::RateLimited(err)
            | IssueError::CAFailure(err)
            | IssueError::AuthFailure(err) => Debug::fmt(err, f),
        }
    }
}

impl Debug for IssueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl From<anyhow::Error> for IssueError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AcmeError>() {
            Some(inner) => match inner {
                AcmeError::ProtocolViolation(_) | AcmeError::AcmeProblem(_) => IssueError::CAFailure(err),
                AcmeError::CryptoFailure(_) | AcmeError::Http(_) | AcmeError::TimedOut(_) => {
                    IssueError::ClientFailure(err)
                }
                AcmeError::RateLimited(_) => IssueError::RateLimited(err),
            },
            None => IssueError::ClientFailure(err),
        }
    }
}

impl From<AcmeError> for IssueError {
    fn from(err: AcmeError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<acme::error::Problem> for IssueError {
    fn from(err: acme::error::Problem) -> Self {
        if err.is_rate_limit() {
            IssueError::RateLimited(AcmeError::from(err).into())
        } else {
            IssueError::CAFailure(AcmeError::from(err).into())
        }
    }
}

pub trait IssueContext<T> {
    fn client_failure(self) -> IssueResult<T>;
}

impl<T> IssueContext<T> for anyhow::Error {
    fn client_failure(self) -> IssueResult<T> {
        Err(IssueError::ClientFailure(self))
    }
}

impl<T> IssueContext<T> for Result<T, anyhow::Error> {
    fn client_failure(self) -> IssueResult<T> {
        match self {
            Ok(ok) => Ok(ok),
            Err(err) => err.client_failure(),
        }
    }
}
