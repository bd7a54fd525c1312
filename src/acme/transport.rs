//! The set of ACME operations the renewal engine needs, abstracted so that the engine can be driven
//! against a real CA or an in-process fake.

use crate::acme::client::AcmeClient;
use crate::acme::error::{Error, ProtocolResult};
use crate::acme::object::{Authorization, Challenge, Identifier, NewOrderRequest, OrderStatus};
use crate::cert;
use crate::crypto::jws::JsonWebKey;
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Registers `key` as a new account, returning the account URL
    async fn register(&self, key: &JsonWebKey) -> ProtocolResult<Url>;

    /// Looks up the account URL of an already registered `key`
    async fn lookup_account(&self, key: &JsonWebKey) -> ProtocolResult<Url>;

    /// Asks the CA to authorize `domain` for the account
    async fn authorize(&self, key: &JsonWebKey, domain: &str) -> ProtocolResult<(Url, Authorization)>;

    /// Signals the CA that `challenge` may now be validated
    async fn accept_challenge(&self, key: &JsonWebKey, challenge: &Challenge) -> ProtocolResult<Challenge>;

    /// Waits until the CA has finished validating the authorization
    async fn wait_authorization(&self, key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization>;

    /// Submits a DER-encoded CSR and returns the issued certificate chain as DER certificates, leaf first.
    ///
    /// Unless `bundle` is set, only the leaf is returned.
    async fn submit_csr(
        &self,
        key: &JsonWebKey,
        csr_der: &[u8],
        validity: Duration,
        bundle: bool,
    ) -> ProtocolResult<Vec<Vec<u8>>>;
}

#[async_trait]
impl AcmeTransport for AcmeClient {
    async fn register(&self, key: &JsonWebKey) -> ProtocolResult<Url> {
        let (url, account) = self.register_account(key).await?;
        debug!("Registered account {url} with status {}", account.status);
        Ok(url)
    }

    async fn lookup_account(&self, key: &JsonWebKey) -> ProtocolResult<Url> {
        let (url, _) = self.find_account(key).await?;
        Ok(url)
    }

    async fn authorize(&self, key: &JsonWebKey, domain: &str) -> ProtocolResult<(Url, Authorization)> {
        if let Some(authz) = self.new_authorization(key, Identifier::dns(domain)).await? {
            return Ok(authz);
        }
        // Without pre-authorization support, an order for just this domain yields its authorization
        debug!("CA does not support pre-authorization, creating an order for {domain}");
        let request = NewOrderRequest {
            identifiers: vec![Identifier::dns(domain)],
            not_after: None,
        };
        let (_, order) = self.new_order(key, &request).await?;
        let authz_url = order
            .authorizations
            .into_iter()
            .next()
            .ok_or(Error::ProtocolViolation("Order does not contain any authorization"))?;
        let authz = self.get_authorization(key, &authz_url).await?;
        Ok((authz_url, authz))
    }

    async fn accept_challenge(&self, key: &JsonWebKey, challenge: &Challenge) -> ProtocolResult<Challenge> {
        self.respond_to_challenge(key, &challenge.url).await
    }

    async fn wait_authorization(&self, key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        self.poll_authorization(key, authz_url).await
    }

    async fn submit_csr(
        &self,
        key: &JsonWebKey,
        csr_der: &[u8],
        validity: Duration,
        bundle: bool,
    ) -> ProtocolResult<Vec<Vec<u8>>> {
        let domains = cert::csr_domains(csr_der)
            .map_err(|_| Error::ProtocolViolation("Certificate signing request could not be parsed"))?;
        let identifiers: Vec<Identifier> = domains.iter().map(|domain| Identifier::dns(domain)).collect();
        let not_after = time::Duration::try_from(validity)
            .ok()
            .and_then(|validity| OffsetDateTime::now_utc().checked_add(validity));
        let request = NewOrderRequest {
            identifiers: identifiers.clone(),
            not_after,
        };
        let (order_url, order) = match self.new_order(key, &request).await {
            Ok(order) => order,
            Err(Error::AcmeProblem(problem)) if not_after.is_some() => {
                // Many CAs don't support custom validity periods
                warn!("CA rejected the requested certificate lifetime ({problem}), retrying without it");
                let request = NewOrderRequest {
                    identifiers,
                    not_after: None,
                };
                self.new_order(key, &request).await?
            }
            Err(e) => return Err(e),
        };

        let order = self.poll_order(key, order, &order_url).await?;
        let order = if order.status == OrderStatus::Ready {
            let order = self.finalize_order(key, &order, csr_der).await?;
            self.poll_order(key, order, &order_url).await?
        } else {
            order
        };
        if order.status != OrderStatus::Valid {
            return Err(Error::ProtocolViolation("Order is not valid after finalization"));
        }
        let certificate_url = order.certificate.ok_or(Error::ProtocolViolation(
            "CA did not provide a certificate URL for a valid order",
        ))?;

        let pem = self.download_certificate(key, &certificate_url).await?;
        let mut chain = cert::parse_chain(&pem)
            .map_err(|_| Error::ProtocolViolation("CA returned an unparsable certificate chain"))?;
        if chain.is_empty() {
            return Err(Error::ProtocolViolation("CA returned an empty certificate chain"));
        }
        if !bundle {
            chain.truncate(1);
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::tests::{build_acme_client, create_acme_server, test_jwk};
    use crate::crypto::asymmetric::RsaKeyPair;
    use serde_json::json;

    fn authorization_json(base: &str, status: &str) -> String {
        json!({
            "status": status,
            "identifier": {"type": "dns", "value": "example.com"},
            "challenges": [{
                "type": "http-01",
                "url": format!("{base}/chall/1"),
                "status": "pending",
                "token": "DGyRejmCefe7v4NfDGDKfA"
            }]
        })
        .to_string()
    }

    fn order_json(base: &str, status: &str) -> String {
        let mut order = json!({
            "status": status,
            "identifiers": [{"type": "dns", "value": "example.com"}],
            "authorizations": [format!("{base}/authz/1")],
            "finalize": format!("{base}/order/1/finalize"),
        });
        if status == "valid" {
            order["certificate"] = json!(format!("{base}/cert/1"));
        }
        order.to_string()
    }

    fn issued_chain() -> (String, usize) {
        let ca = rcgen::CertificateParams::new(vec!["Test CA".to_string()]).unwrap();
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca = ca.self_signed(&ca_key).unwrap();
        let leaf = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = leaf.signed_by(&leaf_key, &ca, &ca_key).unwrap();
        (format!("{}{}", leaf.pem(), ca.pem()), 2)
    }

    #[tokio::test]
    async fn test_authorize_without_new_authz_uses_order() {
        let mut server = create_acme_server(false).await;
        let base = server.url();
        let new_order = server
            .mock("POST", "/new-order")
            .with_status(201)
            .with_header("Location", "/order/1")
            .with_body(order_json(&base, "pending"))
            .create_async()
            .await;
        server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(authorization_json(&base, "pending"))
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let jwk = test_jwk(&server);

        let (url, authz) = client.authorize(&jwk, "example.com").await.unwrap();

        assert_eq!(url.path(), "/authz/1");
        assert_eq!(authz.challenges.len(), 1);
        new_order.assert_async().await;
    }

    #[tokio::test]
    async fn test_wait_authorization_returns_final_state() {
        let mut server = create_acme_server(false).await;
        let base = server.url();
        server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(authorization_json(&base, "valid"))
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let jwk = test_jwk(&server);
        let url = Url::parse(&format!("{base}/authz/1")).unwrap();

        let authz = client.wait_authorization(&jwk, &url).await.unwrap();

        assert_eq!(authz.status, crate::acme::object::AuthorizationStatus::Valid);
    }

    #[tokio::test]
    async fn test_submit_csr() {
        let mut server = create_acme_server(false).await;
        let base = server.url();
        server
            .mock("POST", "/new-order")
            .with_status(201)
            .with_header("Location", "/order/1")
            .with_body(order_json(&base, "ready"))
            .create_async()
            .await;
        let finalize = server
            .mock("POST", "/order/1/finalize")
            .with_status(200)
            .with_body(order_json(&base, "valid"))
            .create_async()
            .await;
        let (chain_pem, chain_len) = issued_chain();
        server
            .mock("POST", "/cert/1")
            .with_status(200)
            .with_body(chain_pem)
            .expect(2)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let jwk = test_jwk(&server);
        let keypair = RsaKeyPair::generate().unwrap();
        let csr = cert::create_csr(&keypair, &["example.com".to_string()]).unwrap();
        let validity = Duration::from_secs(90 * 24 * 60 * 60);

        let bundle = client.submit_csr(&jwk, csr.der(), validity, true).await.unwrap();
        let leaf_only = client.submit_csr(&jwk, csr.der(), validity, false).await.unwrap();

        assert_eq!(bundle.len(), chain_len);
        assert_eq!(leaf_only.len(), 1);
        assert_eq!(leaf_only[0], bundle[0]);
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_csr_retries_without_validity() {
        let mut server = create_acme_server(false).await;
        let base = server.url();
        let rejected = server
            .mock("POST", "/new-order")
            .with_status(400)
            .with_header("content-type", "application/problem+json")
            .with_body(r#"{"type": "urn:ietf:params:acme:error:malformed", "detail": "NotAfter is not supported"}"#)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/new-order")
            .with_status(201)
            .with_header("Location", "/order/1")
            .with_body(order_json(&base, "valid"))
            .expect(1)
            .create_async()
            .await;
        let (chain_pem, _) = issued_chain();
        server
            .mock("POST", "/cert/1")
            .with_status(200)
            .with_body(chain_pem)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let jwk = test_jwk(&server);
        let keypair = RsaKeyPair::generate().unwrap();
        let csr = cert::create_csr(&keypair, &["example.com".to_string()]).unwrap();

        let chain = client
            .submit_csr(&jwk, csr.der(), Duration::from_secs(3600), true)
            .await
            .unwrap();

        assert!(!chain.is_empty());
        rejected.assert_async().await;
        accepted.assert_async().await;
    }
}
