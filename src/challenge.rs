//! A short-lived HTTP server answering a single `http-01` challenge.

use crate::CRATE_NAME;
use crate::acme::object::Token;
use crate::crypto::jws::JsonWebKey;
use anyhow::Context;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";
/// Pause after a failed `accept()`, which usually means the process ran out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The key authorization for a challenge token (RFC8555 Section 8.1)
pub fn key_authorization(token: &Token, account_key: &JsonWebKey) -> String {
    let thumbprint = account_key.get_acme_thumbprint();
    format!("{token}.{thumbprint}")
}

#[derive(Debug)]
struct ChallengeResponse {
    path: String,
    body: Bytes,
}

/// Serves the key authorization for one token until closed or dropped.
///
/// Dropping the responder stops the accept loop, `close` additionally waits until the listener is gone.
#[derive(Debug)]
pub struct ChallengeResponder {
    local_addr: SocketAddr,
    task: JoinHandle<anyhow::Result<()>>,
    cancellation: DropGuard,
}

impl ChallengeResponder {
    pub async fn serve(address: SocketAddr, token: &Token, key_authorization: String) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .context(format!("Binding challenge responder to {address} failed"))?;
        let local_addr = listener.local_addr()?;
        let response = Arc::new(ChallengeResponse {
            path: format!("{CHALLENGE_PATH_PREFIX}{token}"),
            body: Bytes::from(key_authorization),
        });
        debug!("Serving challenge {token} on {local_addr}");
        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, response, cancellation_token.clone()));
        Ok(Self {
            local_addr,
            task,
            cancellation: cancellation_token.drop_guard(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(self) -> anyhow::Result<()> {
        let cancellation = self.cancellation.disarm();
        cancellation.cancel();
        self.task.await.context("Challenge responder task failed")?
    }
}

async fn accept_loop(
    listener: TcpListener,
    response: Arc<ChallengeResponse>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let mut connections = JoinSet::new();
    loop {
        let (client, client_addr) = tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection for challenge responder: {e}");
                        match pause_after_accept_error(&cancellation_token).await {
                            ControlFlow::Continue(()) => continue,
                            ControlFlow::Break(()) => break,
                        }
                    }
                }
            }
            Some(_) = connections.join_next() => continue,
            () = cancellation_token.cancelled() => break,
        };
        debug!("Challenge request from {client_addr}");
        let io = TokioIo::new(client);
        let response = response.clone();
        connections.spawn(async move {
            if let Err(err) = http1::Builder::new()
                .keep_alive(false)
                .serve_connection(
                    io,
                    service_fn(|request| {
                        let result = respond(&response, &request);
                        async move { result }
                    }),
                )
                .await
            {
                error!("Error serving challenge connection: {err}");
            }
        });
    }
    connections.shutdown().await;
    Ok(())
}

async fn pause_after_accept_error(cancellation_token: &CancellationToken) -> ControlFlow<()> {
    tokio::select! {
        () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => ControlFlow::Continue(()),
        () = cancellation_token.cancelled() => ControlFlow::Break(()),
    }
}

fn respond<B>(response: &ChallengeResponse, request: &Request<B>) -> http::Result<Response<Full<Bytes>>> {
    if request.uri().path() == response.path {
        Response::builder()
            .status(StatusCode::OK)
            .header(http::header::SERVER, CRATE_NAME)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .header(http::header::CONTENT_LENGTH, response.body.len())
            .body(Full::new(response.body.clone()))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(http::header::SERVER, CRATE_NAME)
            .body(Full::new(Bytes::new()))
    }
}
