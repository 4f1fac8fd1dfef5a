//! Load-balanced client.
//!
//! Resolves `"<Service>:<Method>"` targets through the registry, picks an
//! address uniformly at random, and dispatches through a cached underlying
//! client per address. First use of an address installs a sentinel slot
//! and dials on a fresh task; every concurrent caller for that address
//! parks on the slot's ready signal, so one connection is opened however
//! many calls race. A dial failure is published on the slot (each waiting
//! call fails with that dial error) and the sentinel is removed so the
//! next call retries.

use crate::client::{Call, Client, ClientConfig};
use crate::error::RpcError;
use ferrite_registry::RegistryClient;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Heartbeat period used for the registry registration.
pub const DEFAULT_REGISTRY_TICK: Duration = Duration::from_secs(10);

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sentinel cache entry: concurrent first-use of one address coalesces on
/// `ready`, then reads the published outcome.
struct Slot {
    ready: watch::Sender<bool>,
    outcome: Mutex<Option<Result<Client, RpcError>>>,
}

impl Slot {
    fn new() -> Arc<Slot> {
        Arc::new(Slot {
            ready: watch::channel(false).0,
            outcome: Mutex::new(None),
        })
    }

    fn publish(&self, outcome: Result<Client, RpcError>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.ready.send_replace(true);
    }

    async fn outcome(&self) -> Result<Client, RpcError> {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(Err(RpcError::Shutdown))
    }
}

struct BalancedState {
    clients: HashMap<String, Arc<Slot>>,
    closed: bool,
}

struct BalancedInner {
    registry: RegistryClient,
    config: ClientConfig,
    state: Mutex<BalancedState>,
}

impl BalancedInner {
    fn lock_state(&self) -> MutexGuard<'_, BalancedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// RPC client that fans calls out over every live instance of a service.
#[derive(Clone)]
pub struct BalancedClient {
    inner: Arc<BalancedInner>,
}

impl BalancedClient {
    /// Register with the registry at `registry_addr` and return a ready
    /// client. `name` identifies this consumer to the registry; when
    /// `None`, a `client-N` name is generated.
    pub async fn connect(
        name: Option<&str>,
        registry_addr: &str,
        config: ClientConfig,
    ) -> Result<BalancedClient, RpcError> {
        let generated;
        let name = match name {
            Some(name) => name,
            None => {
                generated = format!("client-{}", NAME_SEQ.fetch_add(1, Ordering::Relaxed));
                &generated
            }
        };
        let registry = RegistryClient::register(name, "", registry_addr, DEFAULT_REGISTRY_TICK)
            .await
            .map_err(|err| RpcError::Registry(err.to_string()))?;
        Ok(BalancedClient {
            inner: Arc::new(BalancedInner {
                registry,
                config,
                state: Mutex::new(BalancedState {
                    clients: HashMap::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// Issue a call against a randomly chosen live instance. The returned
    /// handle is already finished on resolution or dial failure.
    pub async fn go(&self, target_method: &str, args: Vec<Value>) -> Arc<Call> {
        let Some((service_name, _method)) = split_target(target_method) else {
            return Call::failed(
                target_method,
                RpcError::IllegalTargetMethod(target_method.to_owned()),
            );
        };
        if self.inner.lock_state().closed {
            return Call::failed(target_method, RpcError::Shutdown);
        }

        let addrs = match self.inner.registry.get_service_addresses(service_name).await {
            Ok(addrs) => addrs,
            Err(err) => {
                return Call::failed(target_method, RpcError::Registry(err.to_string()));
            }
        };
        if addrs.is_empty() {
            return Call::failed(target_method, RpcError::NoAvailableInstance);
        }
        let addr = &addrs[rand::thread_rng().gen_range(0..addrs.len())];

        match self.client_for(addr).await {
            Ok(client) => client.go(target_method, args).await,
            Err(err) => Call::failed(target_method, err),
        }
    }

    /// Issue a call and block until it completes.
    pub async fn call(
        &self,
        target_method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, RpcError> {
        let call = self.go(target_method, args).await;
        call.wait().await;
        match call.error() {
            Some(err) => Err(err),
            None => Ok(call.reply()),
        }
    }

    /// Like [`BalancedClient::call`] but cancel locally when `wait`
    /// elapses.
    pub async fn call_until(
        &self,
        wait: Duration,
        target_method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, RpcError> {
        let call = self.go(target_method, args).await;
        if tokio::time::timeout(wait, call.wait()).await.is_err() {
            call.cancel();
        }
        match call.error() {
            Some(err) => Err(err),
            None => Ok(call.reply()),
        }
    }

    /// Idempotent. Resigns from the registry and closes every cached
    /// client.
    pub async fn close(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.clients.drain().map(|(_, slot)| slot).collect()
        };
        self.inner.registry.close().await;
        for slot in slots {
            if let Ok(client) = slot.outcome().await {
                client.close().await;
            }
        }
    }

    /// Cached client for `addr`, dialing on first use. Concurrent callers
    /// coalesce on the sentinel slot.
    async fn client_for(&self, addr: &str) -> Result<Client, RpcError> {
        let (slot, dial) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(RpcError::Shutdown);
            }
            match state.clients.get(addr) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Slot::new();
                    state.clients.insert(addr.to_owned(), slot.clone());
                    (slot, true)
                }
            }
        };
        if dial {
            let inner = self.inner.clone();
            let slot_for_dial = slot.clone();
            let addr = addr.to_owned();
            tokio::spawn(async move {
                dial_slot(inner, slot_for_dial, addr).await;
            });
        }
        slot.outcome().await
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.inner.lock_state().clients.len()
    }
}

async fn dial_slot(inner: Arc<BalancedInner>, slot: Arc<Slot>, addr: String) {
    match Client::connect_config(&addr, inner.config.clone()).await {
        Ok(client) => {
            slot.publish(Ok(client.clone()));
            // Closed while the dial was in flight: don't leak the
            // connection.
            if inner.lock_state().closed {
                client.close().await;
            }
        }
        Err(err) => {
            debug!(addr, error = %err, "dial failed");
            let mut state = inner.lock_state();
            if !state.closed {
                state.clients.remove(&addr);
            }
            drop(state);
            // Waiters get the dial error itself; the removed sentinel
            // lets the next call retry.
            slot.publish(Err(err));
        }
    }
}

fn split_target(target_method: &str) -> Option<(&str, &str)> {
    let (service, method) = target_method.split_once(':')?;
    if service.is_empty() || method.is_empty() || method.contains(':') {
        return None;
    }
    Some((service, method))
}
