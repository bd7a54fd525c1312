use crate::acme::error::ProtocolResult;
use crate::acme::error::{Error, RateLimitError};
use crate::acme::http::HttpClient;
use crate::acme::object::{
    Account, AccountRequest, Authorization, AuthorizationStatus, Challenge, Directory, EmptyObject, FinalizeRequest,
    Identifier, NewAuthorizationRequest, NewOrderRequest, Nonce, Order, OrderStatus,
};
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use crate::util::serde_helper::PassthroughBytes;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::value::BytesDeserializer;
use std::any::TypeId;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// The maximum number of retries we do, per request
const MAX_RETRIES: usize = 3;
/// The default time we wait between retries, if a retry is needed
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
/// The maximum amount of time we're willing to wait in between retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2 * 60);
/// Maximum time we wait for the server to progress in the state machine
const MAX_POLL_DURATION: Duration = Duration::from_secs(5 * 60);

pub struct AcmeClientBuilder {
    server_url: Url,
    http_client: Option<HttpClient>,
    contact: Vec<Url>,
}

impl AcmeClientBuilder {
    pub fn new(acme_server_url: Url) -> AcmeClientBuilder {
        Self {
            server_url: acme_server_url,
            http_client: None,
            contact: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Contact URLs (usually `mailto:`) sent along when registering a new account
    #[must_use]
    pub fn with_contact(mut self, contact: Vec<Url>) -> Self {
        self.contact = contact;
        self
    }

    pub async fn try_build(self) -> ProtocolResult<AcmeClient> {
        AcmeClient::try_new(self).await
    }
}

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
    contact: Vec<Url>,
    nonce_pool: Mutex<VecDeque<Nonce>>,
}

impl AcmeClient {
    async fn try_new(builder: AcmeClientBuilder) -> ProtocolResult<Self> {
        let http_client = match builder.http_client {
            Some(client) => client,
            None => HttpClient::try_new()?,
        };
        let directory_response = http_client.get(builder.server_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => directory_response.json().await?,
            _ => return Err(Error::get_error_from_http(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
            contact: builder.contact,
            nonce_pool: Mutex::new(VecDeque::default()),
        })
    }

    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let mut last_error;
        let mut retry = 0;
        loop {
            let pooled_nonce = self.nonce_pool.lock().pop_front();
            if let Some(pooled_nonce) = pooled_nonce {
                return Ok(pooled_nonce);
            }

            let response = self.http_client.head(self.directory.new_nonce.clone()).await?;
            if let Some(nonce) = HttpClient::extract_nonce(&response) {
                return Ok(nonce);
            }

            let retry_after = HttpClient::extract_backoff(&response);
            last_error = Error::get_error_from_http(response).await;
            retry += 1;
            if retry > MAX_RETRIES {
                break;
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
        }
        Err(last_error)
    }

    fn try_store_nonce(&self, maybe_nonce: Option<Nonce>) {
        if let Some(nonce) = maybe_nonce {
            self.nonce_pool.lock().push_back(nonce);
        }
    }

    async fn post_with_retry<T: Serialize, R: DeserializeOwned + 'static>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let mut last_error;
        let mut retry = 0;
        let mut header = ProtectedHeader::new(
            key.get_algorithm(),
            self.get_nonce().await?,
            target_url.clone(),
            key.get_parameters().clone(),
        );
        loop {
            let signed = key.sign(&header, payload)?;
            let response = self.http_client.post(target_url.clone(), &signed).await?;
            let retry_after = HttpClient::extract_backoff(&response);
            let new_nonce = HttpClient::extract_nonce(&response);
            let location = HttpClient::extract_location(&response);
            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    self.try_store_nonce(new_nonce);
                    // Every ACME response is JSON, except for the certificate download. Callers asking for
                    // PassthroughBytes get the raw body instead. Resolved at compile-time, depending on `R`.
                    let body: R = if TypeId::of::<R>() == TypeId::of::<PassthroughBytes>() {
                        let bytes = response.bytes().await?;
                        let deserializer = BytesDeserializer::<'_, serde::de::value::Error>::new(&bytes);
                        R::deserialize(deserializer)
                            .map_err(|_| Error::ProtocolViolation("Response body could not be read"))?
                    } else {
                        response.json().await?
                    };
                    return Ok(AcmeResponse {
                        status,
                        location,
                        retry_after,
                        body,
                    });
                }
                _ => {
                    last_error = Error::get_error_from_http(response).await;
                    match &last_error {
                        Error::AcmeProblem(problem) if problem.is_bad_nonce() => {
                            header.nonce = new_nonce.ok_or(Error::ProtocolViolation(
                                "Server did not provide a (valid) Replay-Nonce on a badNonce error",
                            ))?;
                            retry += 1;
                            if retry > MAX_RETRIES {
                                break;
                            }
                            // Immediate retry with new nonce
                            continue;
                        }
                        Error::RateLimited(RateLimitError { .. }) => {
                            self.try_store_nonce(new_nonce);
                            return Err(last_error);
                        }
                        _ => self.try_store_nonce(new_nonce),
                    }
                }
            }
            retry += 1;
            // Give up if the request doesn't seem salvageable
            if status.is_client_error() || retry > MAX_RETRIES {
                break;
            }
            tokio::time::sleep(backoff_from_retry_after(retry_after)).await;
            header.nonce = self.get_nonce().await?;
        }
        Err(last_error)
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    /// Creates a new account for `key`, agreeing to the CA's terms of service
    pub async fn register_account(&self, key: &JsonWebKey) -> ProtocolResult<(Url, Account)> {
        let payload = AccountRequest {
            contact: self.contact.clone(),
            terms_of_service_agreed: Some(true),
            only_return_existing: None,
        };
        self.post_account_request(key, &payload).await
    }

    /// Finds the account URL for an already registered `key` (RFC8555 Section 7.3.1)
    pub async fn find_account(&self, key: &JsonWebKey) -> ProtocolResult<(Url, Account)> {
        let payload = AccountRequest {
            contact: Vec::new(),
            terms_of_service_agreed: None,
            only_return_existing: Some(true),
        };
        self.post_account_request(key, &payload).await
    }

    async fn post_account_request(&self, key: &JsonWebKey, payload: &AccountRequest) -> ProtocolResult<(Url, Account)> {
        let target_url = &self.get_directory().new_account;
        let response = self.post_with_retry(target_url, key, Some(payload)).await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL",
        ))?;
        Ok((account_url, response.body))
    }

    /// Pre-authorizes an identifier (RFC8555 Section 7.4.1). Only available if the CA advertises `newAuthz`.
    pub async fn new_authorization(
        &self,
        account_key: &JsonWebKey,
        identifier: Identifier,
    ) -> ProtocolResult<Option<(Url, Authorization)>> {
        let Some(target_url) = &self.get_directory().new_authz else {
            return Ok(None);
        };
        let request = NewAuthorizationRequest { identifier };
        let response = self.post_with_retry(target_url, account_key, Some(&request)).await?;
        let authz_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an authorization URL for created authorization",
        ))?;
        Ok(Some((authz_url, response.body)))
    }

    pub async fn new_order(&self, account_key: &JsonWebKey, request: &NewOrderRequest) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.get_directory().new_order;
        let response = self.post_with_retry(target_url, account_key, Some(request)).await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(&self, account_key: &JsonWebKey, order_url: &Url) -> ProtocolResult<Order> {
        let response = self.post_with_retry(order_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    pub async fn get_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let response = self.post_with_retry(authz_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    /// Tells the CA that the challenge is ready for validation
    pub async fn respond_to_challenge(&self, account_key: &JsonWebKey, challenge_url: &Url) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    /// Polls the authorization until the CA is done with it, i.e. it is no longer pending
    pub async fn poll_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        while Instant::now() < deadline {
            let response = self
                .post_with_retry::<_, Authorization>(authz_url, account_key, EMPTY_PAYLOAD)
                .await?;
            if response.body.status != AuthorizationStatus::Pending {
                return Ok(response.body);
            }
            tokio::time::sleep(backoff_from_retry_after(response.retry_after)).await;
        }
        Err(Error::TimedOut("Timed out waiting for challenge validation"))
    }

    pub async fn finalize_order(&self, account_key: &JsonWebKey, order: &Order, csr_der: &[u8]) -> ProtocolResult<Order> {
        let request = FinalizeRequest {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };
        let response = self
            .post_with_retry(&order.finalize, account_key, Some(&request))
            .await?;
        Ok(response.body)
    }

    /// Polls the order until it is no longer pending or processing
    pub async fn poll_order(&self, account_key: &JsonWebKey, mut order: Order, order_url: &Url) -> ProtocolResult<Order> {
        let deadline = Instant::now() + MAX_POLL_DURATION;
        while Instant::now() < deadline {
            match order.status {
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(DEFAULT_RETRY_BACKOFF).await;
                    order = self.get_order(account_key, order_url).await?;
                }
                OrderStatus::Ready | OrderStatus::Valid => {
                    return Ok(order);
                }
                OrderStatus::Invalid => {
                    return match order.error {
                        Some(err) => Err(err.into()),
                        None => Err(Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        )),
                    };
                }
            }
        }
        Err(Error::TimedOut("Timed out waiting for order to progress"))
    }

    pub async fn download_certificate(&self, account_key: &JsonWebKey, certificate_url: &Url) -> ProtocolResult<Vec<u8>> {
        debug!("Downloading certificate from {certificate_url}");
        let response: AcmeResponse<PassthroughBytes> = self
            .post_with_retry(certificate_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body.into_inner())
    }
}

#[derive(Debug)]
pub struct AcmeResponse<T: DeserializeOwned> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub retry_after: Option<SystemTime>,
    pub body: T,
}

fn backoff_from_retry_after(retry_after: Option<SystemTime>) -> Duration {
    retry_after
        .and_then(|date| date.duration_since(SystemTime::now()).ok())
        .map_or(DEFAULT_RETRY_BACKOFF, |backoff| backoff.min(MAX_RETRY_BACKOFF))
}
