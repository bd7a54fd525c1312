use crate::acme::error::{Error, Problem};
use crate::util::serde_helper::optional_offset_date_time;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Directory {
    pub new_nonce: Url,
    pub new_account: Url,
    pub new_order: Url,
    pub new_authz: Option<Url>,
    pub meta: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Metadata {
    pub terms_of_service: Option<Url>,
    pub website: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Nonce(String);

impl Nonce {
    pub fn new_empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Both nonces and challenge tokens are restricted to the base64url alphabet
fn is_base64url(value: &str) -> bool {
    value
        .chars()
        .all(|char| char.is_ascii_alphanumeric() || char == '_' || char == '-')
}

impl TryFrom<String> for Nonce {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_base64url(&value) {
            Ok(Self(value))
        } else {
            Err(Error::ProtocolViolation("Invalid nonce value"))
        }
    }
}

impl FromStr for Nonce {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Nonce::try_from(s.to_string())
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Token(String);

impl TryFrom<String> for Token {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !value.is_empty() && is_base64url(&value) {
            Ok(Self(value))
        } else {
            Err(Error::ProtocolViolation("Invalid token value"))
        }
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::try_from(s.to_string())
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Account {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<Url>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
    #[serde(other)]
    Unknown,
}

impl Display for AccountStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AccountStatus::Valid => "valid",
                AccountStatus::Deactivated => "deactivated",
                AccountStatus::Revoked => "revoked",
                AccountStatus::Unknown => "unknown",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum Identifier {
    Dns {
        value: String,
    },
    #[serde(other)]
    Unknown,
}

impl Identifier {
    pub fn dns(domain: &str) -> Self {
        Identifier::Dns {
            value: domain.to_string(),
        }
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Identifier::Dns { value } => write!(f, "{value}"),
            Identifier::Unknown => write!(f, "unknown"),
        }
    }
}

/// Pre-authorization request (RFC8555 Section 7.4.1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAuthorizationRequest {
    pub identifier: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_offset_date_time"
    )]
    pub not_after: Option<time::OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub identifiers: Vec<Identifier>,
    #[serde(default, with = "optional_offset_date_time")]
    pub not_after: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    pub authorizations: Vec<Url>,
    pub finalize: Url,
    pub certificate: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// Collects the problems the CA attached to the challenges of this authorization
    pub fn problems(&self) -> Vec<&Problem> {
        self.challenges
            .iter()
            .filter_map(|challenge| challenge.error.as_ref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Deactivated,
    Expired,
    Revoked,
    #[serde(other)]
    Invalid,
}

impl Display for AuthorizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AuthorizationStatus::Pending => "pending",
                AuthorizationStatus::Valid => "valid",
                AuthorizationStatus::Deactivated => "deactivated",
                AuthorizationStatus::Expired => "expired",
                AuthorizationStatus::Revoked => "revoked",
                AuthorizationStatus::Invalid => "invalid",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Challenge {
    pub url: Url,
    pub status: ChallengeStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub validated: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    #[serde(flatten)]
    pub inner_challenge: InnerChallenge,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
#[cfg_attr(test, derive(Serialize))]
pub enum InnerChallenge {
    #[serde(rename = "http-01")]
    Http(HttpChallenge),
    #[serde(rename = "dns-01")]
    Dns(DnsChallenge),
    #[serde(other)]
    Unknown,
}

impl InnerChallenge {
    pub fn get_type(&self) -> &str {
        match &self {
            InnerChallenge::Http(_) => "http-01",
            InnerChallenge::Dns(_) => "dns-01",
            InnerChallenge::Unknown => "unknown challenge type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct HttpChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct DnsChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub csr: String,
}
