//! HTTP-01 validation endpoint
//!
//! Serves `/.well-known/acme-challenge/<token>` from the shared
//! `ChallengeResponseStore`, plus `/metrics` when metrics are enabled. Every
//! node runs one, master or follower, so a validation request routed to any
//! node of the pool is answered.

use crate::metrics::Metrics;
use crate::tls::ChallengeResponseStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Request handler shared by the plain HTTP listener and the TLS listener.
#[derive(Clone)]
pub struct HttpEndpoint {
    challenges: ChallengeResponseStore,
    metrics: Option<Arc<Metrics>>,
}

impl HttpEndpoint {
    pub fn new(challenges: ChallengeResponseStore, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            challenges,
            metrics,
        }
    }

    pub fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if method != Method::GET && method != Method::HEAD {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        if let Some(token) = ChallengeResponseStore::extract_token(path) {
            let response = self.challenges.get(token);
            if let Some(metrics) = &self.metrics {
                metrics.record_challenge_request(response.is_some());
            }
            return match response {
                Some(key_authorization) => {
                    tracing::info!(token = %token, "Serving HTTP-01 challenge response");
                    let mut response = Response::new(Full::new(Bytes::from(key_authorization)));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    );
                    response
                }
                None => {
                    tracing::debug!(token = %token, "Unknown HTTP-01 challenge token");
                    text(StatusCode::NOT_FOUND, "Not found")
                }
            };
        }

        match (path, &self.metrics) {
            ("/metrics", Some(metrics)) => match metrics.encode() {
                Ok((content_type, body)) => {
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode metrics");
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                }
            },
            _ => text(StatusCode::NOT_FOUND, "Not found"),
        }
    }

    /// Serve HTTP/1.1 on one accepted connection until the peer closes it or
    /// `cancel` fires.
    pub async fn serve_connection<I>(self, io: I, cancel: CancellationToken)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let endpoint = self.clone();
            async move { Ok::<_, Infallible>(endpoint.respond(req.method(), req.uri().path())) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);
        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "HTTP connection error");
        }
    }

    /// Accept loop for the plain HTTP listener.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "HTTP validation endpoint listening");
        }
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept HTTP connection");
                        continue;
                    }
                },
            };
            tracing::trace!(remote = %remote, "Accepted HTTP connection");
            tokio::spawn(self.clone().serve_connection(stream, cancel.clone()));
        }
        tracing::info!("HTTP validation endpoint stopped");
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
