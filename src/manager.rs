//! The renewal engine: a single task owning the set of tracked domains, renewing certificates in batches.
//!
//! Callers talk to the task through [`Manager`], whose commands travel over a bounded channel and take effect in the
//! order they were queued. Renewals are triggered by three timers: a short debounce after domains were added
//! (so that consecutive additions end up in one certificate), the earliest `expiry - lead_time` of all known
//! certificates, and a fixed backoff after a failed attempt.

use crate::acme::transport::AcmeTransport;
use crate::cert;
use crate::crypto::jws::JsonWebKey;
use crate::error::{IssueContext, IssueError, IssueResult};
use crate::issuer::Issuer;
use crate::keystore;
use crate::storage::Storage;
use crate::time::{humanize_duration, saturating_std_duration};
use anyhow::{Context, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

pub const ACCOUNT_KEY_FILE: &str = "account.key";
pub const DEFAULT_LEAD_TIME: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);
pub const DEFAULT_CHALLENGE_PORT: u16 = 80;

const COMMAND_QUEUE_SIZE: usize = 16;
const DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Where the `http-01` challenge responder listens
    pub challenge_address: SocketAddr,
    /// Storage directory for the account key, domain keys and certificates
    pub directory: PathBuf,
    /// How long before expiry a certificate is renewed
    pub lead_time: Duration,
    /// Quiet period after `add` before a renewal starts
    pub debounce: Duration,
    /// Wait time after a failed renewal
    pub retry_backoff: Duration,
    /// Certificate lifetime requested from the CA
    pub validity: Duration,
}

impl ManagerSettings {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            challenge_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_CHALLENGE_PORT)),
            directory,
            lead_time: DEFAULT_LEAD_TIME,
            debounce: DEFAULT_DEBOUNCE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            validity: DEFAULT_VALIDITY,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("invalid domain name {0:?}")]
    InvalidDomain(String),
    #[error("the renewal engine has stopped")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    Add(Vec<String>),
    Remove(Vec<String>),
}

/// Handle to a running renewal engine. Dropping it stops the engine without waiting, prefer [`Manager::close`].
#[derive(Debug)]
pub struct Manager {
    commands: mpsc::Sender<Command>,
    storage: Storage,
    cancellation: DropGuard,
    task: JoinHandle<()>,
}

impl Manager {
    /// Sets up the storage directory and ACME account, then starts the engine.
    ///
    /// A missing account key is generated and registered with the CA. If that registration fails, the new key is
    /// deleted again so that the next start registers afresh.
    pub async fn start<T, F>(settings: ManagerSettings, transport: T, on_renewed: F) -> anyhow::Result<Self>
    where
        T: AcmeTransport + 'static,
        F: FnMut(Vec<String>) + Send + 'static,
    {
        if settings.retry_backoff >= settings.lead_time {
            bail!("The retry backoff must be shorter than the renewal lead time");
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIRECTORY_MODE)
            .create(&settings.directory)
            .context(format!("Creating storage directory {}", settings.directory.display()))?;

        let account_key_path = settings.directory.join(ACCOUNT_KEY_FILE);
        let (account_key, created) = keystore::load_or_generate(&account_key_path).context("Loading account key")?;
        let account = JsonWebKey::new(account_key);
        let account_url = if created {
            match transport.register(&account).await {
                Ok(url) => {
                    info!("Registered new ACME account {url}");
                    url
                }
                Err(e) => {
                    if let Err(remove_err) = std::fs::remove_file(&account_key_path) {
                        warn!(
                            "Could not remove unregistered account key {}: {remove_err}",
                            account_key_path.display()
                        );
                    }
                    return Err(anyhow::Error::from(e).context("Registering ACME account"));
                }
            }
        } else {
            let url = transport
                .lookup_account(&account)
                .await
                .context("Looking up ACME account")?;
            debug!("Using existing ACME account {url}");
            url
        };
        let account = account.into_existing(account_url);

        let storage = Storage::new(settings.directory.clone());
        let issuer = Issuer::new(transport, account, settings.challenge_address, settings.validity);
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let cancellation_token = CancellationToken::new();
        let control_loop = ControlLoop {
            settings,
            issuer,
            storage: storage.clone(),
            on_renewed,
            commands: receiver,
            cancellation: cancellation_token.clone(),
            certs: BTreeMap::new(),
            pending: BTreeSet::new(),
            debounce: None,
            retry: None,
            state: EngineState::Idle,
        };
        let task = tokio::spawn(control_loop.run());
        Ok(Self {
            commands: sender,
            storage,
            cancellation: cancellation_token.drop_guard(),
            task,
        })
    }

    /// Starts tracking `domains`. A renewal for the ones without a valid certificate follows after the debounce window.
    ///
    /// Returns once the command is queued. A queued command is always applied, even while a renewal is in progress;
    /// dropping the future before that point leaves the engine unchanged.
    pub async fn add(&self, domains: Vec<String>) -> Result<(), ManagerError> {
        validate_domains(&domains)?;
        self.send(Command::Add(domains)).await
    }

    /// Stops tracking `domains`. Their files are left on disk. Queued like [`Manager::add`].
    pub async fn remove(&self, domains: Vec<String>) -> Result<(), ManagerError> {
        validate_domains(&domains)?;
        self.send(Command::Remove(domains)).await
    }

    async fn send(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).await.map_err(|_| ManagerError::Stopped)
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.storage.key_path(domain)
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.storage.cert_path(domain)
    }

    pub fn directory(&self) -> &Path {
        self.storage.directory()
    }

    /// Stops the engine, aborting any renewal in progress, and waits until it has exited.
    pub async fn close(self) {
        let cancellation = self.cancellation.disarm();
        cancellation.cancel();
        if let Err(e) = self.task.await {
            error!("Renewal engine terminated abnormally: {e}");
        }
    }
}

fn validate_domains(domains: &[String]) -> Result<(), ManagerError> {
    for domain in domains {
        // Domains end up in file names
        if domain.is_empty() || domain.starts_with('.') || domain.contains(['/', '\\', '\0']) {
            return Err(ManagerError::InvalidDomain(domain.clone()));
        }
    }
    Ok(())
}

/// Whether a certificate expiring at `expiry` is due for renewal at `now`
pub fn is_expiring(now: OffsetDateTime, expiry: OffsetDateTime, lead_time: time::Duration) -> bool {
    now.checked_add(lead_time).is_none_or(|renew_after| renew_after >= expiry)
}

/// Monotonic deadline for a renewal due at wall-clock time `renew_at`.
///
/// A renewal that is already due is pushed out by `backoff`, so that a certificate living shorter than the lead time
/// doesn't cause back-to-back issuance.
fn renewal_deadline(renew_at: OffsetDateTime, wall_now: OffsetDateTime, now: Instant, backoff: Duration) -> Option<Instant> {
    if renew_at <= wall_now {
        now.checked_add(backoff)
    } else {
        now.checked_add(saturating_std_duration(renew_at - wall_now))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Renewing,
    Stopped,
}

struct ControlLoop<T, F> {
    settings: ManagerSettings,
    issuer: Issuer<T>,
    storage: Storage,
    on_renewed: F,
    commands: mpsc::Receiver<Command>,
    cancellation: CancellationToken,
    /// Tracked domains with the expiry of their certificate, if known
    certs: BTreeMap<String, Option<OffsetDateTime>>,
    /// Domains added since the last successful renewal
    pending: BTreeSet<String>,
    debounce: Option<Instant>,
    retry: Option<Instant>,
    state: EngineState,
}

impl<T: AcmeTransport, F: FnMut(Vec<String>) + Send> ControlLoop<T, F> {
    async fn run(mut self) {
        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = sleep_until_opt(wakeup) => {
                    if self.renew().await.is_break() {
                        break;
                    }
                }
            }
        }
        self.transition(EngineState::Stopped);
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            debug!("Renewal engine: {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Add(domains) => {
                for domain in domains {
                    debug!("Tracking {domain}");
                    self.certs.insert(domain.clone(), None);
                    self.pending.insert(domain);
                }
                self.debounce = Instant::now().checked_add(self.settings.debounce);
            }
            Command::Remove(domains) => {
                for domain in &domains {
                    debug!("No longer tracking {domain}");
                    self.certs.remove(domain);
                    self.pending.remove(domain);
                }
                if self.pending.is_empty() {
                    self.debounce = None;
                }
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let lead_time = time::Duration::try_from(self.settings.lead_time).unwrap_or(time::Duration::MAX);
        let expiry_wakeup = self
            .certs
            .values()
            .flatten()
            .min()
            .and_then(|earliest| {
                let renew_at = earliest.checked_sub(lead_time).unwrap_or(OffsetDateTime::UNIX_EPOCH);
                renewal_deadline(renew_at, OffsetDateTime::now_utc(), Instant::now(), self.settings.retry_backoff)
            });
        [self.debounce, self.retry, expiry_wakeup].into_iter().flatten().min()
    }

    async fn renew(&mut self) -> ControlFlow<()> {
        self.debounce = None;
        self.retry = None;
        self.transition(EngineState::Renewing);

        let expiring = self.find_expiring(OffsetDateTime::now_utc());
        let result = if expiring.is_empty() {
            Ok(None)
        } else {
            info!("Renewing certificate for {}", expiring.join(", "));
            let cancellation = self.cancellation.clone();
            tokio::select! {
                biased;
                () = cancellation.cancelled() => Err(IssueError::Cancelled),
                result = issue_batch(&self.issuer, &self.storage, &expiring) => result.map(Some),
            }
        };

        match result {
            Ok(expiry) => {
                if let Some(expiry) = expiry {
                    for domain in &expiring {
                        self.certs.insert(domain.clone(), Some(expiry));
                    }
                }
                // Every pending domain either was part of the batch or has a valid certificate on disk
                let available: BTreeSet<String> = expiring.into_iter().chain(std::mem::take(&mut self.pending)).collect();
                if !available.is_empty() {
                    (self.on_renewed)(available.into_iter().collect());
                }
            }
            Err(e) => {
                self.storage.discard(&expiring);
                if matches!(e, IssueError::Cancelled) {
                    debug!("Renewal of {} cancelled", expiring.join(", "));
                    return ControlFlow::Break(());
                }
                if e.is_retryable() {
                    error!("Renewing certificate for {} failed: {e}", expiring.join(", "));
                    self.retry = Instant::now().checked_add(self.settings.retry_backoff);
                } else {
                    warn!("Renewing certificate for {} failed: {e}", expiring.join(", "));
                }
            }
        }

        if let Some(wakeup) = self.next_wakeup() {
            let wait = wakeup.saturating_duration_since(Instant::now());
            let wait = time::Duration::try_from(wait).unwrap_or(time::Duration::MAX);
            debug!("Next renewal check in {}", humanize_duration(wait));
        }
        self.transition(EngineState::Idle);
        ControlFlow::Continue(())
    }

    /// Collects the domains due for renewal. Domains with unknown expiry are looked up on disk first.
    fn find_expiring(&mut self, now: OffsetDateTime) -> Vec<String> {
        let lead_time = time::Duration::try_from(self.settings.lead_time).unwrap_or(time::Duration::MAX);
        let mut expiring = Vec::new();
        for (domain, expiry) in &mut self.certs {
            if expiry.is_none() {
                *expiry = load_expiry(&self.storage, domain);
            }
            match expiry {
                Some(expiry) if !is_expiring(now, *expiry, lead_time) => {}
                _ => expiring.push(domain.clone()),
            }
        }
        expiring
    }
}

/// Issues one certificate for the whole batch and installs it for every domain, returning its expiry
async fn issue_batch<T: AcmeTransport>(
    issuer: &Issuer<T>,
    storage: &Storage,
    batch: &[String],
) -> IssueResult<OffsetDateTime> {
    let Some(primary) = batch.first() else {
        return Err(IssueError::NoDomains);
    };
    let staged_cert = storage.staged_cert_path(primary);
    issuer
        .issue(batch, &storage.staged_key_path(primary), &staged_cert)
        .await?;
    storage.replicate(batch).client_failure()?;
    let expiry = cert::read_expiry(&staged_cert)
        .context("Reading expiry of issued certificate")
        .client_failure()?;
    storage.commit(batch).client_failure()?;
    Ok(expiry)
}

fn load_expiry(storage: &Storage, domain: &str) -> Option<OffsetDateTime> {
    let key_path = storage.key_path(domain);
    if !key_path.exists() {
        debug!("No key for {domain} at {}", key_path.display());
        return None;
    }
    match cert::read_expiry(&storage.cert_path(domain)) {
        Ok(expiry) => {
            debug!("Found certificate for {domain} expiring at {expiry}");
            Some(expiry)
        }
        Err(e) => {
            debug!("No usable certificate for {domain}: {e}");
            None
        }
    }
}
