use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::error::{Result, RouterError};
use crate::logging::SharedLogger;
use crate::providers::{AuthStyle, Framing, Protocol, ANTHROPIC_VERSION};
use crate::registry::{ModelRoute, Registry, RegistryHandle};
use crate::retry;
use crate::transport::{Transport, UpstreamRequest, UpstreamResponse};
use crate::translate::framing::Frame;
use crate::translate::streaming::Decoded;

/// Caller headers forwarded to anthropic backends when present.
const ANTHROPIC_PASSTHROUGH: &[&str] = &["anthropic-version", "anthropic-beta"];

/// A caller request, already split off the listener.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub protocol: Protocol,
    pub headers: HeaderMap,
    pub body: Value,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

pub enum RelayReply {
    Unary { status: u16, body: Value },
    Stream { framing: Framing, frames: FrameStream },
}

impl std::fmt::Debug for RelayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayReply::Unary { status, body } => f
                .debug_struct("Unary")
                .field("status", status)
                .field("body", body)
                .finish(),
            RelayReply::Stream { framing, .. } => f
                .debug_struct("Stream")
                .field("framing", framing)
                .finish_non_exhaustive(),
        }
    }
}

impl RelayReply {
    /// An error rendered in `caller`'s error shape.
    pub fn error(caller: Protocol, err: &RouterError) -> Self {
        RelayReply::Unary {
            status: err.http_status(),
            body: caller.encode_error(err),
        }
    }
}

/// Decodes the caller's body, resolves the route on a pinned registry snapshot,
/// mutates and encodes for the backend, then sends under the route's retry
/// policy. Streams are never retried once the upstream has answered.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<RegistryHandle>,
    transport: Arc<dyn Transport>,
    audit: Option<SharedLogger>,
}

impl Relay {
    pub fn new(registry: Arc<RegistryHandle>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            audit: None,
        }
    }

    pub fn with_audit(mut self, logger: SharedLogger) -> Self {
        self.audit = Some(logger);
        self
    }

    pub fn registry(&self) -> &Arc<RegistryHandle> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Logical model names of the live snapshot.
    pub fn model_names(&self) -> Vec<String> {
        self.registry.current().model_names()
    }

    /// Serve one call. Errors raised before the first frame come back as a unary
    /// error in the caller's protocol, with the upstream status preserved.
    pub async fn handle(&self, call: InboundCall) -> RelayReply {
        let caller = call.protocol;
        match self.dispatch(call).await {
            Ok(reply) => reply,
            Err(err) => {
                match err {
                    RouterError::Configuration { .. } | RouterError::InvalidRequest { .. } => {
                        tracing::info!(protocol = %caller, error = %err, "Rejected request")
                    }
                    _ => tracing::error!(protocol = %caller, error = %err, "Relay failed"),
                }
                RelayReply::error(caller, &err)
            }
        }
    }

    async fn dispatch(&self, call: InboundCall) -> Result<RelayReply> {
        let snapshot = self.registry.current();
        let caller = call.protocol;

        let req = caller.decode_request(call.body)?;
        let route = snapshot.resolve(&req.model)?;
        let req = snapshot.content.apply_request(req)?;
        let body = route.protocol.encode_request(&req, route.upstream_model())?;

        let upstream = UpstreamRequest {
            url: route.url.clone(),
            headers: build_headers(&snapshot, &route, &call.headers)?,
            body: Bytes::from(serde_json::to_vec(&body)?),
        };

        tracing::info!(
            model = %req.model,
            route = %route.name,
            backend = %route.protocol,
            caller = %caller,
            stream = req.stream,
            messages = req.messages.len(),
            "Relaying request"
        );

        if req.stream {
            self.relay_stream(snapshot, route, caller, req.model, upstream)
                .await
        } else {
            self.relay_unary(snapshot, route, caller, req.model, upstream)
                .await
        }
    }

    async fn relay_unary(
        &self,
        snapshot: Arc<Registry>,
        route: Arc<ModelRoute>,
        caller: Protocol,
        model: String,
        upstream: UpstreamRequest,
    ) -> Result<RelayReply> {
        let (snapshot_ref, route_ref, upstream_ref) = (&snapshot, &route, &upstream);
        let (result, attempts) = retry::execute(&route.retry, &route.name, move |_| async move {
            let response = self.send_checked(snapshot_ref, route_ref, upstream_ref.clone()).await?;
            let body = response.bytes().await?;
            if snapshot_ref.audit.log_responses {
                self.audit(|log| {
                    log.log_response(&route_ref.name, 200, Some(&body[..]), snapshot_ref.audit.mask_api_keys)
                });
            }
            route_ref.protocol.decode_response(&body)
        })
        .await;
        tracing::debug!(route = %route.name, attempts = attempts.len(), "Unary call finished");

        let mut resp = result?;
        resp.model = model;
        let resp = snapshot.content.apply_response(resp)?;
        Ok(RelayReply::Unary {
            status: 200,
            body: caller.encode_response(&resp)?,
        })
    }

    async fn relay_stream(
        &self,
        snapshot: Arc<Registry>,
        route: Arc<ModelRoute>,
        caller: Protocol,
        model: String,
        upstream: UpstreamRequest,
    ) -> Result<RelayReply> {
        let (snapshot_ref, route_ref, upstream_ref) = (&snapshot, &route, &upstream);
        let (result, attempts) = retry::execute(&route.retry, &route.name, move |_| {
            self.send_checked(snapshot_ref, route_ref, upstream_ref.clone())
        })
        .await;
        tracing::debug!(route = %route.name, attempts = attempts.len(), "Stream opened");

        let response = result?;
        Ok(RelayReply::Stream {
            framing: caller.framing(),
            frames: Box::pin(relay_frames(response, snapshot, route, caller, model)),
        })
    }

    /// One attempt: send, and turn a non-success status into an upstream error.
    async fn send_checked(
        &self,
        snapshot: &Registry,
        route: &ModelRoute,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse> {
        let mask = snapshot.audit.mask_api_keys;
        if snapshot.audit.log_requests {
            self.audit(|log| {
                log.log_request(&route.name, &request.url, &request.headers, &request.body, mask)
            });
        }

        let response = self.transport.send(request, route.timeouts).await?;
        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let body = response.bytes().await.unwrap_or_default();
        if snapshot.audit.log_responses {
            self.audit(|log| log.log_response(&route.name, status, Some(&body[..]), mask));
        }
        let text = String::from_utf8_lossy(&body).into_owned();
        let message = route
            .protocol
            .upstream_error_message(&text)
            .unwrap_or_else(|| format!("Upstream returned status {}", status));
        Err(RouterError::upstream(status, message, text))
    }

    fn audit(&self, f: impl FnOnce(&SharedLogger)) {
        if let Some(ref logger) = self.audit {
            f(logger);
        }
    }
}

/// Headers for the upstream call: content type, credentials and protocol
/// headers first, then the snapshot's header rules over the result.
pub fn build_headers(snapshot: &Registry, route: &ModelRoute, inbound: &HeaderMap) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(ref key) = route.api_key {
        let invalid = |_| RouterError::config(format!("Route '{}': API key is not a valid header value", route.name));
        match route.protocol.preset().auth {
            AuthStyle::Bearer => {
                let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?;
                headers.insert(AUTHORIZATION, value);
            }
            AuthStyle::ApiKeyHeader => {
                let value = HeaderValue::from_str(key).map_err(invalid)?;
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
        }
    }

    if route.protocol == Protocol::Anthropic {
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        for name in ANTHROPIC_PASSTHROUGH.iter().copied() {
            if let Some(value) = inbound.get(name) {
                headers.insert(HeaderName::from_static(name), value.clone());
            }
        }
    }

    Ok(snapshot.headers.apply(headers))
}

/// Logs a caller disconnect when the relay stream is dropped before it ended.
struct StreamGuard {
    route: String,
    finished: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(route = %self.route, "Caller went away, upstream stream released");
        }
    }
}

/// Relay an open upstream stream as caller frames. Always ends with the caller
/// protocol's terminal frames or its error frame.
fn relay_frames(
    mut response: UpstreamResponse,
    snapshot: Arc<Registry>,
    route: Arc<ModelRoute>,
    caller: Protocol,
    model: String,
) -> impl Stream<Item = Frame> + Send + 'static {
    async_stream::stream! {
        let mut guard = StreamGuard { route: route.name.clone(), finished: false };
        let mut decoder = route.protocol.stream_decoder();
        let mut encoder = caller.stream_encoder(&model);
        let mut forwarded = 0usize;

        loop {
            let (decoded, ended) = match response.next_chunk().await {
                Some(Ok(bytes)) => (decoder.feed(&bytes), false),
                Some(Err(err)) => (Decoded::failed(err), true),
                None => (decoder.finish(), true),
            };

            for mut chunk in decoded.chunks {
                snapshot.content.apply_chunk(&mut chunk);
                for frame in encoder.encode(&chunk) {
                    forwarded += 1;
                    yield frame;
                }
            }

            if let Some(err) = decoded.error {
                tracing::warn!(route = %route.name, forwarded, error = %err, "Upstream stream failed");
                for frame in encoder.error(&err) {
                    yield frame;
                }
                break;
            }

            if ended || decoder.is_complete() {
                if !decoder.is_complete() {
                    tracing::warn!(route = %route.name, "Upstream closed the stream without a terminal event");
                }
                for frame in encoder.finish() {
                    yield frame;
                }
                break;
            }
        }

        guard.finished = true;
        tracing::debug!(route = %route.name, forwarded, "Stream finished");
    }
}
