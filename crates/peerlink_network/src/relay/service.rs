//! The relay HTTP service: `GET /`, `POST /ping`, `POST /send` and the
//! background sweeps.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::registry::{RelayRegistry, SendRejection};
use super::state::{RelayError, RelayState};
use crate::message::{PingRequest, PingResponse, SendRequest, SendResponse};

/// Interval between alternate-relay health checks.
const ALTSERVER_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Interval between state snapshots.
const SAVE_INTERVAL: Duration = Duration::from_secs(5);
const ALTSERVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Eviction never runs more often than this, whatever `clear_time` says.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Current time as UNIX epoch seconds.
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

struct RelayInner {
    registry: RelayRegistry,
    altservers: BTreeSet<String>,
}

/// A relay server instance, shared with the axum handlers as state.
pub struct RelayService {
    port: u16,
    save_location: Option<std::path::PathBuf>,
    clear_time: f64,
    inner: Mutex<RelayInner>,
    http: reqwest::Client,
}

impl RelayService {
    pub fn new(state: RelayState) -> Self {
        info!("Instantiating relay on port {}", state.port);
        Self {
            port: state.port,
            save_location: state.save_location,
            clear_time: state.clear_time,
            inner: Mutex::new(RelayInner {
                registry: state.peers,
                altservers: state.altservers.into_iter().collect(),
            }),
            http: reqwest::Client::builder()
                .timeout(ALTSERVER_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn clear_time(&self) -> f64 {
        self.clear_time
    }

    /// Register the caller, learn its relays and hand over its buffer.
    pub fn ping(&self, request: PingRequest) -> PingResponse {
        let mut inner = self.inner.lock();
        let (peers, buffer) =
            inner
                .registry
                .ping(&request.node_network, &request.node_name, epoch_now());
        inner.altservers.extend(request.known_servers);
        if !buffer.is_empty() {
            debug!(
                "Drained {} packet(s) for {}.{}",
                buffer.len(),
                request.node_network,
                request.node_name
            );
        }
        PingResponse {
            peers,
            servers: inner.altservers.iter().cloned().collect(),
            buffer,
        }
    }

    /// Buffer a packet for its target.
    pub fn send(&self, request: SendRequest) -> Result<SendResponse, SendRejection> {
        self.inner.lock().registry.deliver(&request)?;
        debug!(
            "Buffered {:?} {} from {} for {}",
            request.r_type, request.packet_id, request.originator, request.target
        );
        Ok(SendResponse {
            pid: request.packet_id,
        })
    }

    /// Forget nodes that have not pinged within `clear_time` of `now`.
    pub fn evict_stale(&self, now: f64) -> usize {
        let evicted = self.inner.lock().registry.evict_stale(now, self.clear_time);
        if evicted > 0 {
            debug!("Evicted {evicted} silent node(s)");
        }
        evicted
    }

    pub fn altservers(&self) -> Vec<String> {
        self.inner.lock().altservers.iter().cloned().collect()
    }

    /// GET every alternate relay and forget the ones that cannot be reached.
    pub async fn check_altservers(&self) {
        for server in self.altservers() {
            if let Err(e) = self.http.get(&server).send().await {
                warn!("Alternate relay {server} unreachable, removing: {e}");
                self.inner.lock().altservers.remove(&server);
            }
        }
    }

    /// Snapshot of everything the relay persists.
    pub fn snapshot(&self) -> RelayState {
        let inner = self.inner.lock();
        RelayState {
            port: self.port,
            save_location: self.save_location.clone(),
            peers: inner.registry.clone(),
            altservers: inner.altservers.iter().cloned().collect(),
            clear_time: self.clear_time,
        }
    }

    pub async fn save_state(&self) -> Result<(), RelayError> {
        if self.save_location.is_none() {
            return Ok(());
        }
        self.snapshot().save().await
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/ping", post(ping))
            .route("/send", post(send))
            .with_state(self)
    }

    /// Start the eviction, alternate-relay and persistence sweeps.
    pub fn spawn_sweeps(self: &Arc<Self>, shutdown: &broadcast::Receiver<()>) {
        let sweep_interval = Duration::try_from_secs_f64(self.clear_time)
            .unwrap_or(MIN_SWEEP_INTERVAL)
            .max(MIN_SWEEP_INTERVAL);

        let relay = Arc::clone(self);
        spawn_periodic("eviction", sweep_interval, shutdown.resubscribe(), move || {
            let relay = Arc::clone(&relay);
            async move {
                relay.evict_stale(epoch_now());
            }
        });

        let relay = Arc::clone(self);
        spawn_periodic(
            "altserver check",
            ALTSERVER_CHECK_INTERVAL,
            shutdown.resubscribe(),
            move || {
                let relay = Arc::clone(&relay);
                async move { relay.check_altservers().await }
            },
        );

        let relay = Arc::clone(self);
        spawn_periodic("persistence", SAVE_INTERVAL, shutdown.resubscribe(), move || {
            let relay = Arc::clone(&relay);
            async move {
                if let Err(e) = relay.save_state().await {
                    error!("Failed to save relay state: {e}");
                }
            }
        });
    }

    /// Run the sweeps and serve HTTP on `listener` until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let addr = listener.local_addr()?;
        self.spawn_sweeps(&shutdown);
        info!("Relay server listening on http://{addr}");

        let relay = Arc::clone(&self);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("Relay server shutting down");
            })
            .await?;

        if let Err(e) = relay.save_state().await {
            error!("Failed to save relay state on shutdown: {e}");
        }
        Ok(())
    }
}

/// Run `tick` now and then every `every` until shutdown.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
    tick: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tick().await;
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = shutdown.recv() => {
                    debug!("Relay {name} sweep shutting down");
                    break;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root() -> Json<Value> {
    Json(json!({
        "time": chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
    }))
}

async fn ping(
    State(relay): State<Arc<RelayService>>,
    Json(request): Json<PingRequest>,
) -> Json<PingResponse> {
    Json(relay.ping(request))
}

async fn send(
    State(relay): State<Arc<RelayService>>,
    Json(request): Json<SendRequest>,
) -> Response {
    match relay.send(request) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(rejection) => {
            debug!("Send rejected: {rejection}");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": rejection.to_string() })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
