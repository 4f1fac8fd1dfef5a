//! Tracked service records.
//!
//! A record's liveness is a single-slot channel: heartbeats deposit a
//! token (dropped when the slot is full), the supervisor consumes them.
//! The deposit happens under the record lock so a concurrent close cannot
//! race the sender away mid-beat; close drops the sender, which the
//! supervisor observes as orderly shutdown.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct ServiceRecord {
    pub name: String,
    /// Service endpoint; empty for consumer-only registrations.
    pub addr: String,
    pub id: u64,
    pub tick: Duration,
    /// Push endpoint; empty when the peer did not subscribe.
    pub listen_addr: String,
    inner: Mutex<RecordInner>,
}

struct RecordInner {
    closed: bool,
    alive: Option<mpsc::Sender<()>>,
    /// Names this record has looked up; push targets are chosen by
    /// intersecting a change with this set.
    interest: HashSet<String>,
}

impl ServiceRecord {
    pub fn new(
        name: String,
        addr: String,
        id: u64,
        tick: Duration,
        listen_addr: String,
    ) -> (ServiceRecord, mpsc::Receiver<()>) {
        let (alive_tx, alive_rx) = mpsc::channel(1);
        let record = ServiceRecord {
            name,
            addr,
            id,
            tick,
            listen_addr,
            inner: Mutex::new(RecordInner {
                closed: false,
                alive: Some(alive_tx),
                interest: HashSet::new(),
            }),
        };
        (record, alive_rx)
    }

    /// Deposit a liveness token. Returns false when the record is closed;
    /// a full slot counts as delivered.
    pub fn beat(&self) -> bool {
        let inner = self.lock();
        if inner.closed {
            return false;
        }
        if let Some(alive) = &inner.alive {
            let _ = alive.try_send(());
        }
        true
    }

    /// Idempotent. Drops the alive sender so the supervisor exits.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.alive = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn add_interest(&self, name: &str) {
        self.lock().interest.insert(name.to_owned());
    }

    pub fn is_interested(&self, name: &str) -> bool {
        self.lock().interest.contains(name)
    }

    pub fn interest(&self) -> Vec<String> {
        self.lock().interest.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
