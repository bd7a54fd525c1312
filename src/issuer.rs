use crate::acme::object::{Authorization, AuthorizationStatus, Challenge, InnerChallenge};
use crate::acme::transport::AcmeTransport;
use crate::cert;
use crate::challenge::{ChallengeResponder, key_authorization};
use crate::crypto::jws::JsonWebKey;
use crate::error::{IssueContext, IssueError, IssueResult};
use crate::keystore;
use anyhow::{Context, anyhow};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Obtains certificates for batches of domains, answering `http-01` challenges on `challenge_address`.
#[derive(Debug)]
pub struct Issuer<T> {
    transport: T,
    account: JsonWebKey,
    challenge_address: SocketAddr,
    validity: Duration,
}

impl<T: AcmeTransport> Issuer<T> {
    pub fn new(transport: T, account: JsonWebKey, challenge_address: SocketAddr, validity: Duration) -> Self {
        Self {
            transport,
            account,
            challenge_address,
            validity,
        }
    }

    pub fn account(&self) -> &JsonWebKey {
        &self.account
    }

    /// Authorizes every domain of the batch, then writes a fresh key to `key_path` and the issued chain
    /// (leaf first) to `cert_path`.
    ///
    /// The first domain is the certificate's common name. Nothing is written unless every authorization succeeded.
    pub async fn issue(&self, domains: &[String], key_path: &Path, cert_path: &Path) -> IssueResult<()> {
        if domains.is_empty() {
            return Err(IssueError::NoDomains);
        }
        for domain in domains {
            self.authorize(domain).await?;
        }

        let cert_key = keystore::generate(key_path)
            .context("Generating certificate key")
            .client_failure()?;
        let csr = cert::create_csr(&cert_key, domains)?;
        let chain = self
            .transport
            .submit_csr(&self.account, csr.der(), self.validity, true)
            .await
            .context("Submitting certificate signing request")?;
        cert::write_chain(cert_path, &chain)
            .context(format!("Writing certificate chain to {}", cert_path.display()))
            .client_failure()?;
        info!("Issued certificate for {}", domains.join(", "));
        Ok(())
    }

    async fn authorize(&self, domain: &str) -> IssueResult<()> {
        let (authz_url, authz) = self
            .transport
            .authorize(&self.account, domain)
            .await
            .context(format!("Requesting authorization for {domain}"))?;
        match authz.status {
            AuthorizationStatus::Valid => {
                debug!("Authorization for {domain} already valid");
                return Ok(());
            }
            AuthorizationStatus::Pending => {
                info!("Found pending authorization for {domain}, trying to authorize");
            }
            _ => return Err(authorization_failure(domain, &authz)),
        }

        let challenge = find_challenge(&authz, domain)?;
        let InnerChallenge::Http(http_challenge) = &challenge.inner_challenge else {
            return Err(IssueError::NoChallengeFound(domain.to_string()));
        };
        let body = key_authorization(&http_challenge.token, &self.account);
        let responder = ChallengeResponder::serve(self.challenge_address, &http_challenge.token, body)
            .await
            .client_failure()?;
        debug!("Challenge responder for {domain} is up, asking the CA to validate {}", challenge.url);

        let validation = self.validate(challenge, &authz_url).await;
        if let Err(e) = responder.close().await {
            warn!("Challenge responder for {domain} encountered an error during cleanup: {e:#}");
        }
        let authz = validation.context(format!("Validating challenge for {domain}"))?;

        if authz.status != AuthorizationStatus::Valid {
            return Err(authorization_failure(domain, &authz));
        }
        info!("Successfully validated challenge for {domain}");
        Ok(())
    }

    async fn validate(&self, challenge: &Challenge, authz_url: &url::Url) -> anyhow::Result<Authorization> {
        self.transport.accept_challenge(&self.account, challenge).await?;
        Ok(self.transport.wait_authorization(&self.account, authz_url).await?)
    }
}

/// Picks the `http-01` challenge of an authorization
pub fn find_challenge<'a>(authz: &'a Authorization, domain: &str) -> IssueResult<&'a Challenge> {
    authz
        .challenges
        .iter()
        .find(|challenge| matches!(challenge.inner_challenge, InnerChallenge::Http(_)))
        .ok_or_else(|| IssueError::NoChallengeFound(domain.to_string()))
}

fn authorization_failure(domain: &str, authz: &Authorization) -> IssueError {
    let mut problem_string = String::new();
    for problem in authz.problems() {
        problem_string.push('\n');
        problem_string.push_str(&problem.to_string());
    }
    let status = &authz.status;
    IssueError::AuthFailure(anyhow!(
        "Failed to authorize {domain} (status {status}). The CA reported these problems: {problem_string}"
    ))
}
