// ferrite-test-utils: shared fixtures for the integration suites.
//
// Canned services with observable side effects, plus an in-process RPC
// server harness that counts accepted connections.

use ferrite_core::{Server, ServerConfig, Service, ServiceBuilder};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A `Student` service holding one name: `SetName(String)`,
/// `GetName() -> String`.
pub fn student_service() -> (Service, Arc<Mutex<String>>) {
    let state = Arc::new(Mutex::new(String::new()));
    let set_state = state.clone();
    let get_state = state.clone();
    let service = ServiceBuilder::new("Student")
        .expect("exported name")
        .method1("SetName", move |name: String| {
            *set_state.lock().expect("state lock") = name;
        })
        .method0("GetName", move || get_state.lock().expect("state lock").clone())
        .build();
    (service, state)
}

/// A `Slow` name store whose `SetName` sleeps for `delay` before applying
/// the write, so budgets and cancellation races can be exercised.
pub fn slow_service(delay: Duration) -> (Service, Arc<Mutex<String>>) {
    let state = Arc::new(Mutex::new(String::new()));
    let set_state = state.clone();
    let get_state = state.clone();
    let service = ServiceBuilder::new("Slow")
        .expect("exported name")
        .method1("SetName", move |name: String| {
            std::thread::sleep(delay);
            *set_state.lock().expect("state lock") = name;
        })
        .method0("GetName", move || get_state.lock().expect("state lock").clone())
        .build();
    (service, state)
}

/// A `Depot` service with a shared invocation counter: `Inc()`.
pub fn counter_service(counter: Arc<AtomicU64>) -> Service {
    ServiceBuilder::new("Depot")
        .expect("exported name")
        .method0("Inc", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
}

/// An RPC server bound on an ephemeral port, serving on a background
/// task and counting accepted connections.
pub struct TestServer {
    addr: String,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(config: ServerConfig, services: Vec<Service>) -> TestServer {
        let server = Server::with_config(config);
        for service in services {
            server.register(service).expect("register service");
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr").to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    return;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let server = server.clone();
                tokio::spawn(async move { server.serve_conn(stream).await });
            }
        });
        TestServer { addr, connections }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}
