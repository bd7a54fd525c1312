use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::header::{ACCEPT_LANGUAGE, AsHeaderName, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION, RETRY_AFTER};
use reqwest::{Certificate, ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use url::Url;

// RFC 8555 Section 6.1 asks for the client and HTTP library name and version
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const JOSE_JSON: &str = "application/jose+json";
const REPLAY_NONCE: &str = "replay-nonce";

/// HTTP transport towards the CA. Plain HTTP is only accepted in unit tests.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        Self::build(None)
    }

    /// Client that additionally trusts `root`, e.g. the root of a test CA
    pub fn try_new_with_custom_root(root: Certificate) -> ProtocolResult<Self> {
        Self::build(Some(root))
    }

    fn build(extra_root: Option<Certificate>) -> ProtocolResult<Self> {
        let mut defaults = HeaderMap::new();
        defaults.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let mut builder = ClientBuilder::new()
            .https_only(!cfg!(test))
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .default_headers(defaults)
            .connection_verbose(cfg!(any(test, debug_assertions)));
        if let Some(root) = extra_root {
            builder = builder.add_root_certificate(root);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        header_str(res, REPLAY_NONCE).and_then(|nonce| Nonce::try_from(nonce.to_string()).ok())
    }

    /// Point in time named by a `Retry-After` header, if any
    pub fn extract_backoff(res: &Response) -> Option<SystemTime> {
        header_str(res, RETRY_AFTER).and_then(parse_retry_after)
    }

    /// `Location` header, resolved against the request URL
    pub fn extract_location(res: &Response) -> Option<Url> {
        header_str(res, LOCATION).and_then(|location| res.url().join(location).ok())
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        Ok(self.client.execute(Request::new(Method::GET, url)).await?)
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        Ok(self.client.execute(Request::new(Method::HEAD, url)).await?)
    }

    pub async fn post<T: Serialize + 'static>(&self, url: Url, body: &T) -> ProtocolResult<Response> {
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static(JOSE_JSON))
            .json(body)
            .build()?;
        Ok(self.client.execute(request).await?)
    }
}

fn header_str(res: &Response, name: impl AsHeaderName) -> Option<&str> {
    res.headers().get(name).and_then(|value| value.to_str().ok())
}

/// Parses either form allowed by RFC 9110: delay-seconds or an HTTP-date
fn parse_retry_after(retry_after: &str) -> Option<SystemTime> {
    match retry_after.parse::<u64>() {
        Ok(seconds) => SystemTime::now().checked_add(Duration::from_secs(seconds)),
        Err(_) => httpdate::parse_http_date(retry_after).ok(),
    }
}
