#![allow(dead_code)]

use async_trait::async_trait;
use certkeeper::acme::error::{ACME_SERVER_INTERNAL, ACME_UNAUTHORIZED, Error, ProtocolResult, Problem};
use certkeeper::acme::object::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, DnsChallenge, HttpChallenge, Identifier,
    InnerChallenge, Token,
};
use certkeeper::acme::transport::AcmeTransport;
use certkeeper::challenge::{CHALLENGE_PATH_PREFIX, key_authorization};
use certkeeper::crypto::jws::JsonWebKey;
use certkeeper::manager::ManagerSettings;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

pub const DEBOUNCE: Duration = Duration::from_millis(100);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// Upper bound for anything a test waits for
pub const PATIENCE: Duration = Duration::from_secs(20);

pub fn init_logging() {
    tracing_subscriber::fmt::try_init().ok();
}

pub fn test_settings(directory: &Path) -> ManagerSettings {
    let mut settings = ManagerSettings::new(directory.to_path_buf());
    settings.challenge_address = "127.0.0.1:0".parse().unwrap();
    settings.debounce = DEBOUNCE;
    settings.retry_backoff = RETRY_BACKOFF;
    settings
}

/// An address on the loopback interface that was free a moment ago
pub fn free_local_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

/// Callback forwarding every renewal announcement into a channel
pub fn renewal_channel() -> (impl FnMut(Vec<String>) + Send + 'static, mpsc::UnboundedReceiver<Vec<String>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback = move |domains: Vec<String>| {
        let _ = sender.send(domains);
    };
    (callback, receiver)
}

pub async fn next_renewal(receiver: &mut mpsc::UnboundedReceiver<Vec<String>>) -> Vec<String> {
    tokio::time::timeout(PATIENCE, receiver.recv())
        .await
        .expect("no renewal announced in time")
        .expect("renewal channel closed")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Normal,
    /// Never answers authorization requests, like a CA that stopped responding
    Hang,
    /// Offers only `dns-01` challenges
    DnsOnly,
    /// Takes this long to answer each authorization request
    Slow(Duration),
}

#[derive(Debug)]
struct PendingAuthorization {
    domain: String,
    token: Token,
    validated: bool,
}

struct FakeCaState {
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
    behavior: Behavior,
    /// Fetch the key authorization from the responder before accepting a challenge
    verify_address: Option<SocketAddr>,
    fail_registration: bool,
    failures_remaining: Mutex<usize>,
    registrations: Mutex<usize>,
    submissions: Mutex<Vec<Vec<String>>>,
    authorizations: Mutex<HashMap<Url, PendingAuthorization>>,
    counter: Mutex<u64>,
}

/// An in-process ACME CA issuing certificates signed by a throwaway root.
///
/// Clones share state, so a test can keep one handle while the engine owns another.
#[derive(Clone)]
pub struct FakeCa {
    state: Arc<FakeCaState>,
}

impl FakeCa {
    pub fn new() -> Self {
        Self::with(Behavior::Normal, None, 0, false)
    }

    /// Fails the first `count` certificate submissions with a server error
    pub fn failing(count: usize) -> Self {
        Self::with(Behavior::Normal, None, count, false)
    }

    pub fn hanging() -> Self {
        Self::with(Behavior::Hang, None, 0, false)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with(Behavior::Slow(delay), None, 0, false)
    }

    pub fn dns_only() -> Self {
        Self::with(Behavior::DnsOnly, None, 0, false)
    }

    /// Validates challenges over HTTP against a responder expected at `address`
    pub fn verifying(address: SocketAddr) -> Self {
        Self::with(Behavior::Normal, Some(address), 0, false)
    }

    pub fn rejecting_registration() -> Self {
        Self::with(Behavior::Normal, None, 0, true)
    }

    fn with(behavior: Behavior, verify_address: Option<SocketAddr>, failures: usize, fail_registration: bool) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Fake CA Root");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            state: Arc::new(FakeCaState {
                ca_key,
                ca_cert,
                behavior,
                verify_address,
                fail_registration,
                failures_remaining: Mutex::new(failures),
                registrations: Mutex::new(0),
                submissions: Mutex::new(Vec::new()),
                authorizations: Mutex::new(HashMap::new()),
                counter: Mutex::new(0),
            }),
        }
    }

    /// Domains of every CSR received, in order
    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.state.submissions.lock().clone()
    }

    pub fn registrations(&self) -> usize {
        *self.state.registrations.lock()
    }

    fn next_id(&self) -> u64 {
        let mut counter = self.state.counter.lock();
        *counter += 1;
        *counter
    }

    fn url(&self, path: &str) -> Url {
        Url::parse(&format!("https://fake-ca.test/{path}")).unwrap()
    }

    fn challenge(&self, id: u64, inner: InnerChallenge) -> Challenge {
        Challenge {
            url: self.url(&format!("chall/{id}/{}", inner.get_type())),
            status: ChallengeStatus::Pending,
            validated: None,
            error: None,
            inner_challenge: inner,
        }
    }

    async fn verify(&self, address: SocketAddr, token: &Token, key: &JsonWebKey) -> bool {
        let url = format!("http://{address}{CHALLENGE_PATH_PREFIX}{token}");
        let response = match reqwest::get(&url).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Fake CA could not reach {url}: {e}");
                return false;
            }
        };
        response.status() == reqwest::StatusCode::OK
            && response.text().await.is_ok_and(|body| body == key_authorization(token, key))
    }
}

#[async_trait]
impl AcmeTransport for FakeCa {
    async fn register(&self, _key: &JsonWebKey) -> ProtocolResult<Url> {
        *self.state.registrations.lock() += 1;
        if self.state.fail_registration {
            return Err(Error::AcmeProblem(Problem::new(ACME_UNAUTHORIZED, "Registrations are closed")));
        }
        Ok(self.url("account/1"))
    }

    async fn lookup_account(&self, _key: &JsonWebKey) -> ProtocolResult<Url> {
        Ok(self.url("account/1"))
    }

    async fn authorize(&self, _key: &JsonWebKey, domain: &str) -> ProtocolResult<(Url, Authorization)> {
        if self.state.behavior == Behavior::Hang {
            std::future::pending::<()>().await;
        }
        if let Behavior::Slow(delay) = self.state.behavior {
            tokio::time::sleep(delay).await;
        }
        let id = self.next_id();
        let token = Token::from_str(&format!("token{id}"))?;
        let mut challenges = vec![self.challenge(id, InnerChallenge::Dns(DnsChallenge { token: token.clone() }))];
        if self.state.behavior != Behavior::DnsOnly {
            challenges.push(self.challenge(id, InnerChallenge::Http(HttpChallenge { token: token.clone() })));
        }
        let authz_url = self.url(&format!("authz/{id}"));
        self.state.authorizations.lock().insert(
            authz_url.clone(),
            PendingAuthorization {
                domain: domain.to_string(),
                token,
                validated: false,
            },
        );
        let authz = Authorization {
            identifier: Identifier::dns(domain),
            status: AuthorizationStatus::Pending,
            expires: None,
            challenges,
            wildcard: false,
        };
        Ok((authz_url, authz))
    }

    async fn accept_challenge(&self, key: &JsonWebKey, challenge: &Challenge) -> ProtocolResult<Challenge> {
        let id = challenge
            .url
            .path_segments()
            .and_then(|mut segments| segments.nth(1))
            .ok_or(Error::ProtocolViolation("Unknown challenge"))?;
        let authz_url = self.url(&format!("authz/{id}"));
        let token = self
            .state
            .authorizations
            .lock()
            .get(&authz_url)
            .map(|authz| authz.token.clone())
            .ok_or(Error::ProtocolViolation("Unknown authorization"))?;
        let validated = match self.state.verify_address {
            Some(address) => self.verify(address, &token, key).await,
            None => true,
        };
        if let Some(authz) = self.state.authorizations.lock().get_mut(&authz_url) {
            authz.validated = validated;
        }
        let mut accepted = challenge.clone();
        accepted.status = ChallengeStatus::Processing;
        Ok(accepted)
    }

    async fn wait_authorization(&self, _key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let authorizations = self.state.authorizations.lock();
        let authz = authorizations
            .get(authz_url)
            .ok_or(Error::ProtocolViolation("Unknown authorization"))?;
        let (status, error) = if authz.validated {
            (AuthorizationStatus::Valid, None)
        } else {
            (
                AuthorizationStatus::Invalid,
                Some(Problem::new(ACME_UNAUTHORIZED, "Key authorization mismatch")),
            )
        };
        let mut challenge = self.challenge(0, InnerChallenge::Http(HttpChallenge { token: authz.token.clone() }));
        challenge.error = error;
        Ok(Authorization {
            identifier: Identifier::dns(&authz.domain),
            status,
            expires: None,
            challenges: vec![challenge],
            wildcard: false,
        })
    }

    async fn submit_csr(
        &self,
        _key: &JsonWebKey,
        csr_der: &[u8],
        validity: Duration,
        bundle: bool,
    ) -> ProtocolResult<Vec<Vec<u8>>> {
        let domains = certkeeper::cert::csr_domains(csr_der)
            .map_err(|_| Error::ProtocolViolation("Unparsable certificate signing request"))?;
        self.state.submissions.lock().push(domains.clone());
        {
            let mut failures = self.state.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::AcmeProblem(Problem::new(ACME_SERVER_INTERNAL, "Fake CA is down")));
            }
        }

        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let mut params = CertificateParams::new(domains.clone()).unwrap();
        params.distinguished_name.push(DnType::CommonName, domains[0].clone());
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::try_from(validity).unwrap();
        // The leaf key doesn't matter to the engine, only the names and lifetime do
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = params
            .signed_by(&leaf_key, &self.state.ca_cert, &self.state.ca_key)
            .unwrap();
        let mut chain = vec![leaf.der().to_vec()];
        if bundle {
            chain.push(self.state.ca_cert.der().to_vec());
        }
        Ok(chain)
    }
}
