//! Registry client.
//!
//! Registers a local instance, keeps it alive with periodic heartbeats,
//! caches lookups, and runs a small push listener the registry POSTs
//! fresh address lists to. Pushed updates land on a channel drained by a
//! background task, so the HTTP handler never touches the cache directly.

use crate::RegistryError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One pushed change: the full address list now current for `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Update {
    name: String,
    addrs: Vec<String>,
}

#[derive(Clone)]
struct UpdateGate {
    tx: mpsc::Sender<Update>,
}

struct ClientState {
    services: HashMap<String, Vec<String>>,
    closed: bool,
    updates: Option<mpsc::Sender<Update>>,
}

struct ClientInner {
    server_addr: String,
    name: String,
    addr: String,
    tick: Duration,
    id: u64,
    listen_addr: String,
    http: reqwest::Client,
    state: Mutex<ClientState>,
    listener_shutdown: watch::Sender<bool>,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on a registered instance. Cheap to clone; all clones share the
/// registration.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<ClientInner>,
}

impl RegistryClient {
    /// Register `name` at `addr` with the registry at `server_addr`,
    /// subscribe to push updates, and start the heartbeat task.
    ///
    /// `addr` may be empty for a consumer-only registration.
    pub async fn register(
        name: &str,
        addr: &str,
        server_addr: &str,
        tick: Duration,
    ) -> Result<RegistryClient, RegistryError> {
        if tick.as_secs() < 1 {
            return Err(RegistryError::TickTooSmall);
        }

        // Push listener first, so its address can travel with the
        // registration.
        let (updates_tx, updates_rx) = mpsc::channel::<Update>(16);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listen_addr = listener.local_addr()?;
        let (listener_shutdown, mut shutdown_rx) = watch::channel(false);
        let app = Router::new()
            .route("/update", post(handle_update))
            .with_state(UpdateGate {
                tx: updates_tx.clone(),
            });
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "push listener failed");
            }
        });

        let http = reqwest::Client::new();
        let id = match register_http(&http, server_addr, name, addr, tick, &listen_addr.to_string())
            .await
        {
            Ok(id) => id,
            Err(err) => {
                // Undo the half-built listener before surfacing the error.
                let _ = listener_shutdown.send(true);
                return Err(err);
            }
        };

        let inner = Arc::new(ClientInner {
            server_addr: server_addr.to_owned(),
            name: name.to_owned(),
            addr: addr.to_owned(),
            tick,
            id,
            listen_addr: listen_addr.to_string(),
            http,
            state: Mutex::new(ClientState {
                services: HashMap::new(),
                closed: false,
                updates: Some(updates_tx),
            }),
            listener_shutdown,
        });
        tokio::spawn(drain_updates(inner.clone(), updates_rx));
        tokio::spawn(heartbeat_loop(inner.clone()));
        info!(id, name, listen_addr = %inner.listen_addr, "registered");
        Ok(RegistryClient { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn listen_addr(&self) -> &str {
        &self.inner.listen_addr
    }

    pub fn server_addr(&self) -> &str {
        &self.inner.server_addr
    }

    /// Addresses for `name`: a cached copy when present, otherwise a
    /// lookup (which also subscribes this client to pushes for `name`).
    pub async fn get_service_addresses(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        if name.is_empty() {
            return Ok(Vec::new());
        }
        {
            let state = self.inner.lock_state();
            if state.closed {
                return Err(RegistryError::AlreadyClosed);
            }
            if let Some(addrs) = state.services.get(name) {
                return Ok(addrs.clone());
            }
        }
        self.force_lookup(name).await
    }

    /// Lookup bypassing the cache, refreshing it on success.
    pub async fn force_lookup(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        let response = self
            .inner
            .http
            .get(format!("http://{}/services", self.inner.server_addr))
            .header("name", name)
            .header("id", self.inner.id.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        let addrs: Vec<String> = response.json().await?;
        let mut state = self.inner.lock_state();
        if !state.closed {
            state.services.insert(name.to_owned(), addrs.clone());
        }
        Ok(addrs)
    }

    /// Idempotent. Stops the drain task, resigns from the registry, and
    /// shuts the push listener down.
    pub async fn close(&self) {
        let updates = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.services.clear();
            state.updates.take()
        };
        drop(updates);
        if let Err(err) = resign_http(&self.inner).await {
            warn!(id = self.inner.id, error = %err, "resign failed");
        }
        let _ = self.inner.listener_shutdown.send(true);
        info!(id = self.inner.id, name = %self.inner.name, "registry client closed");
    }

    #[cfg(test)]
    fn cached(&self, name: &str) -> Option<Vec<String>> {
        self.inner.lock_state().services.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Apply pushed address lists to the cache. An empty list means "no
/// instances" and removes the entry.
async fn drain_updates(inner: Arc<ClientInner>, mut updates_rx: mpsc::Receiver<Update>) {
    while let Some(update) = updates_rx.recv().await {
        let mut state = inner.lock_state();
        if state.closed {
            return;
        }
        if update.addrs.is_empty() {
            state.services.remove(&update.name);
        } else {
            state.services.insert(update.name, update.addrs);
        }
    }
}

/// Beat every tick. Failures are non-fatal: the registry evicts on its
/// own schedule and the next successful beat recovers.
async fn heartbeat_loop(inner: Arc<ClientInner>) {
    loop {
        sleep(inner.tick).await;
        if inner.lock_state().closed {
            return;
        }
        let result = inner
            .http
            .get(format!("http://{}/heartbeat", inner.server_addr))
            .header("id", inner.id.to_string())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(id = inner.id, status = %response.status(), "heartbeat rejected");
            }
            Err(err) => warn!(id = inner.id, error = %err, "heartbeat failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

async fn register_http(
    http: &reqwest::Client,
    server_addr: &str,
    name: &str,
    addr: &str,
    tick: Duration,
    listen_addr: &str,
) -> Result<u64, RegistryError> {
    let response = http
        .get(format!("http://{server_addr}/register"))
        .header("name", name)
        .header("addr", addr)
        .header("tick", tick.as_secs().to_string())
        .header("lAddr", listen_addr)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(RegistryError::Status(response.status().as_u16()));
    }
    let id: u64 = response
        .headers()
        .get("id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or(RegistryError::BadId)?;
    if id == 0 {
        return Err(RegistryError::BadId);
    }
    Ok(id)
}

async fn resign_http(inner: &ClientInner) -> Result<(), RegistryError> {
    let response = inner
        .http
        .get(format!("http://{}/resign", inner.server_addr))
        .header("id", inner.id.to_string())
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(RegistryError::Status(response.status().as_u16()));
    }
    Ok(())
}

/// Push endpoint. Always 200: delivery is best-effort and the registry
/// must never stall on a slow or confused subscriber. An empty body is a
/// valid empty list.
async fn handle_update(
    State(gate): State<UpdateGate>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(name) = headers.get("name").and_then(|value| value.to_str().ok()) else {
        return StatusCode::OK;
    };
    let addrs: Vec<String> = if body.is_empty() {
        Vec::new()
    } else {
        match serde_json::from_slice(&body) {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!(error = %err, "dropping malformed update payload");
                return StatusCode::OK;
            }
        }
    };
    let _ = gate.tx.try_send(Update {
        name: name.to_owned(),
        addrs,
    });
    StatusCode::OK
}
