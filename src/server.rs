use crate::error::RouterError;
use crate::providers::{Framing, Protocol};
use crate::proxy::{InboundCall, Relay, RelayReply};
use crate::translate::completions;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/completions", post(handle_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/api/chat", post(handle_native_chat))
        .route("/v1/models", get(handle_models))
        .route("/api/tags", get(handle_tags))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, Protocol::OpenAi, headers, body).await
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, Protocol::Anthropic, headers, body).await
}

async fn handle_native_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(state, Protocol::Ollama, headers, body).await
}

/// Legacy text completions ride the flat-delta chat path.
async fn handle_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body).and_then(completions::chat_request) {
        Ok(v) => v,
        Err(err) => return into_response(RelayReply::error(Protocol::OpenAi, &err)),
    };

    let reply = state
        .relay
        .handle(InboundCall {
            protocol: Protocol::OpenAi,
            headers,
            body,
        })
        .await;

    let reply = match reply {
        RelayReply::Unary { status: 200, body } => match completions::completion_response(body) {
            Ok(body) => RelayReply::Unary { status: 200, body },
            Err(err) => RelayReply::error(Protocol::OpenAi, &err),
        },
        RelayReply::Stream { framing, frames } => RelayReply::Stream {
            framing,
            frames: Box::pin(frames.map(completions::completion_frame)),
        },
        other => other,
    };
    into_response(reply)
}

fn parse_body(body: &[u8]) -> Result<Value, RouterError> {
    serde_json::from_slice(body)
        .map_err(|e| RouterError::invalid_request(format!("Invalid request body: {}", e)))
}

async fn relay(state: Arc<AppState>, protocol: Protocol, headers: HeaderMap, body: Bytes) -> Response {
    let body = match parse_body(&body) {
        Ok(v) => v,
        Err(err) => return into_response(RelayReply::error(protocol, &err)),
    };

    let reply = state
        .relay
        .handle(InboundCall {
            protocol,
            headers,
            body,
        })
        .await;
    into_response(reply)
}

fn into_response(reply: RelayReply) -> Response {
    match reply {
        RelayReply::Unary { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(body)).into_response()
        }
        RelayReply::Stream {
            framing: Framing::Sse,
            frames,
        } => {
            let events = frames.map(|frame| -> Result<Event, Infallible> {
                let event = Event::default().data(frame.data);
                Ok(match frame.event {
                    Some(name) => event.event(name),
                    None => event,
                })
            });
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        RelayReply::Stream {
            framing: Framing::Ndjson,
            frames,
        } => {
            let lines = frames.map(|frame| Ok::<_, Infallible>(frame.to_bytes(Framing::Ndjson)));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-ndjson")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(lines))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.relay.model_names(),
        "connections_in_use": state.relay.transport().pool().in_use(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.relay.registry().current();
    let models: Vec<Value> = snapshot
        .routes()
        .iter()
        .map(|route| {
            json!({
                "id": route.name,
                "object": "model",
                "owned_by": route.protocol.to_string(),
            })
        })
        .collect();

    Json(json!({ "data": models, "object": "list" }))
}

async fn handle_tags(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .relay
        .model_names()
        .into_iter()
        .map(|name| json!({ "name": name, "model": name }))
        .collect();
    Json(json!({ "models": models }))
}
