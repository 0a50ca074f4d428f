//! Upstream HTTP transport.
//!
//! A [`Transport`] performs one attempt: send the request, wait for response headers
//! and hand back a body stream. Every response holds a [`Lease`] on the
//! [`ConnectionPool`]; the slot is returned when the response is dropped, whichever
//! way the call ends.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use reqwest::header::HeaderMap;
use tokio_stream::StreamExt;

use crate::error::{FaultKind, Result, RouterError};

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bounds everything up to the response headers
    pub connect: Duration,
    /// Bounds each body read; resets on every chunk
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Counts connections currently leased to in-flight calls.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    in_use: Arc<AtomicUsize>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self) -> Lease {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Lease {
            in_use: self.in_use.clone(),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Lease {
    in_use: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: BodyStream,
    _lease: Lease,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream, lease: Lease) -> Self {
        Self {
            status,
            headers,
            body,
            _lease: lease,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Next body read, `None` once the upstream closed the body.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.body.next().await
    }

    /// Read the whole body. Used for unary calls and error bodies.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: UpstreamRequest, timeouts: Timeouts) -> Result<UpstreamResponse>;

    fn pool(&self) -> &ConnectionPool;
}

/// [`Transport`] over one shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    pool: ConnectionPool,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RouterError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            pool: ConnectionPool::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UpstreamRequest, timeouts: Timeouts) -> Result<UpstreamResponse> {
        let lease = self.pool.lease();
        let pending = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send();

        let response = tokio::time::timeout(timeouts.connect, pending)
            .await
            .map_err(|_| {
                RouterError::transport(
                    FaultKind::Timeout,
                    format!("No response from {} within {:?}", request.url, timeouts.connect),
                )
            })?
            .map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let read_timeout = timeouts.read;
        let body = response
            .bytes_stream()
            .timeout(read_timeout)
            .map(move |read| match read {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(e)) => Err(classify(e)),
                Err(_) => Err(RouterError::transport(
                    FaultKind::Timeout,
                    format!("No data from upstream for {:?}", read_timeout),
                )),
            });

        Ok(UpstreamResponse::new(status, headers, Box::pin(body), lease))
    }

    fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Map a reqwest failure onto the retryable fault classes.
fn classify(err: reqwest::Error) -> RouterError {
    let kind = if err.is_timeout() {
        FaultKind::Timeout
    } else if err.is_connect() {
        FaultKind::Connect
    } else if err.is_decode() {
        FaultKind::Decode
    } else {
        FaultKind::Connection
    };
    RouterError::transport(kind, err.to_string())
}
