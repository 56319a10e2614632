//! Local HTTP transport: the node's `POST /` endpoint and its client side.
//!
//! Every body, request and response alike, is a codec token. The server
//! decodes the request envelope, runs the command through the registry and
//! always answers with an encoded `{timestamp, response}` envelope followed
//! by a newline, whatever the outcome.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::post;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::codec::DecodeError;
use crate::commands::{CommandContext, Origin};
use crate::error::NetworkError;
use crate::message::{CommandRequest, LocalResponse};
use crate::node::Node;

/// Build the node's HTTP router.
pub fn router(node: Node) -> Router {
    Router::new().route("/", post(handle_command)).with_state(node)
}

/// Serve the node's endpoint on `listener` until shutdown.
pub async fn serve(
    listener: TcpListener,
    node: Node,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), NetworkError> {
    let addr = listener.local_addr()?;
    info!("Command endpoint listening on {addr}");

    axum::serve(
        listener,
        router(node).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        info!("Command endpoint on {addr} shutting down");
    })
    .await?;
    Ok(())
}

async fn handle_command(
    State(node): State<Node>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> (StatusCode, String) {
    let decoded = std::str::from_utf8(&body)
        .map_err(|_| DecodeError::Utf8)
        .and_then(|token| node.codec().decode_json::<CommandRequest>(token));
    let (status, response) = match decoded {
        Ok(request) => {
            debug!(
                "Command {} from {} ({remote})",
                request.command_path, request.initiator
            );
            let (status, result) = dispatch_command(&node, Origin::Local(remote), request).await;
            (
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                result,
            )
        }
        Err(e) => {
            warn!("Undecodable request from {remote}: {e}");
            (
                StatusCode::BAD_REQUEST,
                Value::String("could not decode request".to_string()),
            )
        }
    };

    match node.codec().encode_json(&LocalResponse::new(response)) {
        Ok(body) => (status, format!("{body}\n")),
        Err(e) => {
            error!("Could not encode reply to {remote}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Resolve and run a command, mapping every outcome to `(status, result)`.
///
/// The handler runs in its own task so that a panic inside it surfaces as a
/// 500 instead of tearing down the caller.
pub(crate) async fn dispatch_command(
    node: &Node,
    origin: Origin,
    request: CommandRequest,
) -> (u16, Value) {
    let handler = match node.resolve_command(&request.command_path) {
        Ok(handler) => handler,
        Err(e) => return (404, Value::String(e.to_string())),
    };

    let ctx = CommandContext::new(request.initiator, origin, node.clone());
    match tokio::spawn(handler(ctx, request.args, request.kwargs)).await {
        Ok(Ok(result)) => (200, result),
        Ok(Err(e)) => {
            warn!("Command {} failed: {e:#}", request.command_path);
            (500, Value::String(format!("{e:?}")))
        }
        Err(e) => {
            warn!("Command {} panicked: {e}", request.command_path);
            (500, Value::String(format!("Command handler panicked: {e}")))
        }
    }
}

/// POST an encoded request to a peer's endpoint. Returns the HTTP status
/// and the raw response body.
pub(crate) async fn post_command(
    http: &reqwest::Client,
    addr: SocketAddr,
    token: String,
    timeout: Option<Duration>,
) -> Result<(u16, String), reqwest::Error> {
    let mut request = http.post(format!("http://{addr}/")).body(token);
    if let Some(limit) = timeout {
        request = request.timeout(limit);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
