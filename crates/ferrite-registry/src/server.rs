//! Registry server.
//!
//! HTTP surface (scalar inputs in headers, JSON bodies for address lists):
//!
//! | Endpoint     | Method | Inputs                      | Outputs            |
//! |--------------|--------|-----------------------------|--------------------|
//! | `/register`  | GET    | name, addr, tick, lAddr     | 200 + `id` header  |
//! | `/resign`    | GET    | id                          | 200                |
//! | `/heartbeat` | GET    | id                          | 200, 400 untracked |
//! | `/services`  | GET    | name, id                    | 200 + JSON addrs   |
//!
//! Membership changes fan out as `POST /update` to every subscriber whose
//! interest covers the changed name, one task per subscriber, best-effort.
//!
//! # Lock order
//! The services lock (name and id maps together, so the "in one ⇔ in the
//! other" invariant holds at every observable moment) is outermost; the
//! subscribers lock is independent; record locks are always innermost.

use crate::record::ServiceRecord;
use crate::RegistryError;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One tracked service, as reported by [`RegistryServer::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub id: u64,
    pub addr: String,
    pub interest: Vec<String>,
}

struct ServiceTable {
    by_name: HashMap<String, Vec<Arc<ServiceRecord>>>,
    by_id: HashMap<u64, Arc<ServiceRecord>>,
    next_id: u64,
}

struct RegistryInner {
    services: Mutex<ServiceTable>,
    subscribers: Mutex<HashMap<u64, Arc<ServiceRecord>>>,
    http: reqwest::Client,
}

/// Registry server handle. Binds an HTTP listener at construction; `close`
/// is idempotent and evicts every tracked record.
pub struct RegistryServer {
    inner: Arc<RegistryInner>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    closed: Mutex<bool>,
}

impl RegistryServer {
    /// Bind on an ephemeral local port.
    pub async fn start() -> Result<RegistryServer, RegistryError> {
        RegistryServer::bind("127.0.0.1:0").await
    }

    /// Bind on an explicit address and start serving.
    pub async fn bind(bind_addr: &str) -> Result<RegistryServer, RegistryError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(RegistryInner {
            services: Mutex::new(ServiceTable {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                next_id: 0,
            }),
            subscribers: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        });

        let app = Router::new()
            .route("/register", get(handle_register))
            .route("/resign", get(handle_resign))
            .route("/heartbeat", get(handle_heartbeat))
            .route("/services", get(handle_services))
            .with_state(inner.clone());

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "registry serve failed");
            }
        });

        info!(addr = %local_addr, "registry listening");
        Ok(RegistryServer {
            inner,
            local_addr,
            shutdown,
            closed: Mutex::new(false),
        })
    }

    /// Address the registry is reachable on.
    pub fn addr(&self) -> String {
        self.local_addr.to_string()
    }

    /// Idempotent. Evicts every record and stops the listener.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }
        let records: Vec<Arc<ServiceRecord>> = {
            let mut table = self.inner.lock_services();
            table.by_name.clear();
            table.by_id.drain().map(|(_, record)| record).collect()
        };
        self.inner.lock_subscribers().clear();
        for record in records {
            record.close();
        }
        let _ = self.shutdown.send(true);
    }

    /// Debug listing of every tracked record.
    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        let table = self.inner.lock_services();
        let mut services: Vec<ServiceInfo> = table
            .by_id
            .values()
            .map(|record| ServiceInfo {
                name: record.name.clone(),
                id: record.id,
                addr: record.addr.clone(),
                interest: record.interest(),
            })
            .collect();
        services.sort_by_key(|info| info.id);
        services
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

// ---------------------------------------------------------------------------
// Core operations
// ---------------------------------------------------------------------------

impl RegistryInner {
    fn lock_services(&self) -> MutexGuard<'_, ServiceTable> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<u64, Arc<ServiceRecord>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new service instance and start its liveness supervisor.
    fn register(
        self: &Arc<Self>,
        name: &str,
        addr: &str,
        listen_addr: &str,
        tick: Duration,
    ) -> Result<u64, RegistryError> {
        if tick.as_secs() < 1 {
            return Err(RegistryError::TickTooSmall);
        }
        let (record, alive_rx) = {
            let mut table = self.lock_services();
            table.next_id += 1;
            let id = table.next_id;
            let (record, alive_rx) = ServiceRecord::new(
                name.to_owned(),
                addr.to_owned(),
                id,
                tick,
                listen_addr.to_owned(),
            );
            let record = Arc::new(record);
            table
                .by_name
                .entry(name.to_owned())
                .or_default()
                .push(record.clone());
            table.by_id.insert(id, record.clone());
            (record, alive_rx)
        };
        if !record.listen_addr.is_empty() {
            self.lock_subscribers().insert(record.id, record.clone());
        }
        tokio::spawn(supervise(self.clone(), record.clone(), alive_rx));
        info!(id = record.id, name, addr, "service registered");
        self.push_updates(name);
        Ok(record.id)
    }

    /// Drop a record from every map, close it, and notify interested
    /// subscribers. Unknown ids are ignored.
    fn resign(&self, id: u64) {
        let record = {
            let mut table = self.lock_services();
            let Some(record) = table.by_id.remove(&id) else {
                return;
            };
            if let Some(list) = table.by_name.get_mut(&record.name) {
                list.retain(|entry| entry.id != id);
                if list.is_empty() {
                    table.by_name.remove(&record.name);
                }
            }
            record
        };
        self.lock_subscribers().remove(&id);
        record.close();
        info!(id, name = %record.name, "service resigned");
        self.push_updates(&record.name);
    }

    /// Deposit a heartbeat token. False when the id is untracked or the
    /// record already closed.
    fn heartbeat(&self, id: u64) -> bool {
        let record = self.lock_services().by_id.get(&id).cloned();
        match record {
            Some(record) => record.beat(),
            None => false,
        }
    }

    /// Current addresses for `name`, recording the caller's interest so
    /// future changes are pushed. `None` when the caller id is untracked.
    fn lookup(&self, id: u64, name: &str) -> Option<Vec<String>> {
        let table = self.lock_services();
        let caller = table.by_id.get(&id)?;
        caller.add_interest(name);
        let addrs = table
            .by_name
            .get(name)
            .map(|list| list.iter().map(|record| record.addr.clone()).collect())
            .unwrap_or_default();
        Some(addrs)
    }

    /// Fan the current address list for `name` out to every interested
    /// subscriber. Best-effort: a failed push is logged and dropped; the
    /// subscriber recovers by explicit lookup.
    fn push_updates(&self, name: &str) {
        let addrs: Vec<String> = {
            let table = self.lock_services();
            table
                .by_name
                .get(name)
                .map(|list| list.iter().map(|record| record.addr.clone()).collect())
                .unwrap_or_default()
        };
        let targets: Vec<Arc<ServiceRecord>> = {
            let subscribers = self.lock_subscribers();
            subscribers
                .values()
                .filter(|record| record.is_interested(name))
                .cloned()
                .collect()
        };
        for target in targets {
            let http = self.http.clone();
            let name = name.to_owned();
            let addrs = addrs.clone();
            let url = format!("http://{}/update", target.listen_addr);
            let subscriber = target.id;
            tokio::spawn(async move {
                match http.post(&url).header("name", &name).json(&addrs).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(subscriber, name, "update pushed");
                    }
                    Ok(response) => {
                        warn!(subscriber, name, status = %response.status(), "update push rejected");
                    }
                    Err(err) => {
                        warn!(subscriber, name, error = %err, "update push failed");
                    }
                }
            });
        }
    }
}

/// Liveness supervisor for one record: each window waits for the next
/// heartbeat token; a closed record ends the watch, a silent window evicts
/// the service.
async fn supervise(
    inner: Arc<RegistryInner>,
    record: Arc<ServiceRecord>,
    mut alive_rx: mpsc::Receiver<()>,
) {
    let window = record.tick * 3;
    loop {
        match timeout(window, alive_rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(_) => {
                warn!(id = record.id, name = %record.name, "heartbeat window missed, evicting");
                inner.resign(record.id);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).parse().ok()
}

async fn handle_register(
    State(inner): State<Arc<RegistryInner>>,
    headers: HeaderMap,
) -> Response {
    let name = header_str(&headers, "name");
    let addr = header_str(&headers, "addr");
    let listen_addr = header_str(&headers, "lAddr");
    let Some(tick) = header_u64(&headers, "tick") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if name.is_empty() || tick == 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match inner.register(name, addr, listen_addr, Duration::from_secs(tick)) {
        Ok(id) => (
            StatusCode::OK,
            AppendHeaders([("id", id.to_string())]),
        )
            .into_response(),
        Err(err) => {
            warn!(name, error = %err, "register failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_resign(State(inner): State<Arc<RegistryInner>>, headers: HeaderMap) -> StatusCode {
    match header_u64(&headers, "id") {
        Some(id) => {
            inner.resign(id);
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn handle_heartbeat(
    State(inner): State<Arc<RegistryInner>>,
    headers: HeaderMap,
) -> StatusCode {
    match header_u64(&headers, "id") {
        Some(id) if inner.heartbeat(id) => StatusCode::OK,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn handle_services(State(inner): State<Arc<RegistryInner>>, headers: HeaderMap) -> Response {
    let name = header_str(&headers, "name");
    let Some(id) = header_u64(&headers, "id") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if name.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match inner.lookup(id, name) {
        Some(addrs) => (StatusCode::OK, Json(addrs)).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}
