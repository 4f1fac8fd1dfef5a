//! RPC client: dial, in-flight call tracking, cancellation, keep-alive.
//!
//! A [`Client`] owns one connection. Calls are registered in a pending map
//! keyed by a per-client sequence number before they are written; a
//! background receive loop pairs responses to pending calls by sequence
//! and completes them. Completion is at-most-once: a call transitions to
//! `Finished` exactly once and its done signal fires exactly once, after
//! the terminal write.
//!
//! # Lock order
//! The state lock (pending map, seq, closed) is never acquired while a
//! call's internal lock is held, and the send lock (codec writer) is never
//! acquired while the state lock is held.

use crate::error::RpcError;
use ferrite_protocol::codec::{self, CodecReader, CodecWriter, FailedFlag};
use ferrite_protocol::{ConnectOption, Request, ServerReply, ACK_OK};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// Lifecycle of a call. Transitions are monotonic:
/// `New → Receiving → Finished` or `New → Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    New,
    Receiving,
    Finished,
}

#[derive(Debug)]
struct CallState {
    status: CallStatus,
    error: Option<RpcError>,
    reply: Option<Value>,
}

/// Handle for one outstanding request.
#[derive(Debug)]
pub struct Call {
    seq: u64,
    target_method: String,
    args: Vec<Value>,
    state: Mutex<CallState>,
    done: watch::Sender<bool>,
    owner: Mutex<Option<Weak<ClientInner>>>,
}

impl Call {
    fn new(seq: u64, target_method: &str, args: Vec<Value>) -> Arc<Call> {
        Arc::new(Call {
            seq,
            target_method: target_method.to_owned(),
            args,
            state: Mutex::new(CallState {
                status: CallStatus::New,
                error: None,
                reply: None,
            }),
            done: watch::channel(false).0,
            owner: Mutex::new(None),
        })
    }

    /// A call that failed before it could be sent; already finished and
    /// signaled.
    pub fn failed(target_method: &str, error: RpcError) -> Arc<Call> {
        let call = Call::new(0, target_method, Vec::new());
        call.finish(Some(error), None);
        call
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn target_method(&self) -> &str {
        &self.target_method
    }

    pub fn status(&self) -> CallStatus {
        self.lock_state().status
    }

    pub fn is_finished(&self) -> bool {
        self.status() == CallStatus::Finished
    }

    /// Terminal error, if any. Meaningful once the call is finished.
    pub fn error(&self) -> Option<RpcError> {
        self.lock_state().error.clone()
    }

    /// Raw reply value, if the response carried one.
    pub fn reply(&self) -> Option<Value> {
        self.lock_state().reply.clone()
    }

    /// Decode the reply into `R`. A reply that does not fit the requested
    /// type is a caller bug surfaced as [`RpcError::ReplyDecode`].
    pub fn reply_as<R: DeserializeOwned>(&self) -> Result<Option<R>, RpcError> {
        match self.reply() {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| RpcError::ReplyDecode(err.to_string())),
        }
    }

    /// Resolve once the call is finished.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel locally: remove the call from its owner's pending map and
    /// finish it with [`RpcError::WaitingForReceiving`]. The server is not
    /// told; a late response for this sequence is discarded. No-op when
    /// the call already finished.
    pub fn cancel(&self) {
        let owner = self.lock_owner().as_ref().and_then(Weak::upgrade);
        if let Some(inner) = owner {
            inner.lock_state().remove(self.seq);
        }
        self.finish(Some(RpcError::WaitingForReceiving), None);
    }

    /// Move to `Finished` and fire the done signal, exactly once. Returns
    /// false when the call had already finished.
    fn finish(&self, error: Option<RpcError>, reply: Option<Value>) -> bool {
        {
            let mut state = self.lock_state();
            if state.status == CallStatus::Finished {
                return false;
            }
            state.status = CallStatus::Finished;
            state.error = error;
            state.reply = reply;
        }
        // Signaled after the terminal write, with the lock released.
        self.done.send_replace(true);
        true
    }

    /// Move `New → Receiving` ahead of the wire write. Returns false when
    /// the call finished first (cancelled before send).
    fn begin_receiving(&self) -> bool {
        let mut state = self.lock_state();
        if state.status == CallStatus::Finished {
            return false;
        }
        state.status = CallStatus::Receiving;
        true
    }

    fn attach_owner(&self, owner: &Arc<ClientInner>) {
        *self.lock_owner() = Some(Arc::downgrade(owner));
    }

    fn lock_state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_owner(&self) -> MutexGuard<'_, Option<Weak<ClientInner>>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Dial-time knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub option: ConnectOption,
    /// Send heartbeats at the tick the server advertises. Disable only to
    /// exercise liveness supervision.
    pub keep_alive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            option: ConnectOption::default(),
            keep_alive: true,
        }
    }
}

#[derive(Debug)]
struct ClientState {
    pending: HashMap<u64, Arc<Call>>,
    seq: u64,
    closed: bool,
}

impl ClientState {
    fn remove(&mut self, seq: u64) -> Option<Arc<Call>> {
        self.pending.remove(&seq)
    }
}

#[derive(Debug)]
struct ClientInner {
    state: Mutex<ClientState>,
    writer: tokio::sync::Mutex<CodecWriter<OwnedWriteHalf>>,
    failed: FailedFlag,
    peer: SocketAddr,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Asynchronous RPC client over one connection. Cheap to clone; all
/// clones share the connection and pending map.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Dial with the default option and no deadline.
    pub async fn connect(addr: &str) -> Result<Client, RpcError> {
        Client::connect_config(addr, ClientConfig::default()).await
    }

    /// Dial with explicit configuration and no deadline.
    pub async fn connect_config(addr: &str, config: ClientConfig) -> Result<Client, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut write_half = write_half;

        let reply = negotiate(&mut reader, &mut write_half, config.option).await?;
        let (codec_reader, codec_writer) =
            codec::split(config.option.codec_type, reader, write_half, peer);
        let failed = codec_writer.failed_flag();

        let inner = Arc::new(ClientInner {
            state: Mutex::new(ClientState {
                pending: HashMap::new(),
                seq: 0,
                closed: false,
            }),
            writer: tokio::sync::Mutex::new(codec_writer),
            failed,
            peer,
        });
        tokio::spawn(receive_loop(inner.clone(), codec_reader));
        if config.keep_alive && reply.tick > 0 {
            tokio::spawn(heartbeat_loop(
                inner.clone(),
                Duration::from_secs(reply.tick),
            ));
        }
        Ok(Client { inner })
    }

    /// Dial bounded by `deadline`. Losing the race drops any partially
    /// established connection and returns [`RpcError::DialTimeout`].
    pub async fn connect_timeout(
        addr: &str,
        deadline: Duration,
        config: ClientConfig,
    ) -> Result<Client, RpcError> {
        match timeout(deadline, Client::connect_config(addr, config)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::DialTimeout),
        }
    }

    /// False once the client has been closed or torn down.
    pub fn is_available(&self) -> bool {
        !self.inner.lock_state().closed
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Issue a call without waiting for its completion. The returned
    /// handle is already finished when the client is closed or the write
    /// fails.
    pub async fn go(&self, target_method: &str, args: Vec<Value>) -> Arc<Call> {
        // Register under the state lock: reject when closed, assign the
        // next sequence number, park in pending.
        let call = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Call::failed(target_method, RpcError::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            let call = Call::new(seq, target_method, args);
            call.attach_owner(&self.inner);
            state.pending.insert(seq, call.clone());
            call
        };

        let mut writer = self.inner.writer.lock().await;
        // Cancelled between registration and the send lock: nothing to
        // write.
        if !call.begin_receiving() {
            self.inner.lock_state().remove(call.seq());
            return call;
        }
        let request = Request {
            target_method: call.target_method().to_owned(),
            seq: call.seq(),
            argv: call.args.clone(),
        };
        if let Err(err) = writer.write_request(&request).await {
            drop(writer);
            debug!(seq = call.seq(), error = %err, "request write failed");
            if let Some(call) = self.inner.lock_state().remove(call.seq()) {
                call.finish(Some(RpcError::Shutdown), None);
            }
            teardown(&self.inner, RpcError::Shutdown).await;
        }
        call
    }

    /// Issue a call and block until it completes.
    pub async fn call(&self, target_method: &str, args: Vec<Value>) -> Result<Option<Value>, RpcError> {
        let call = self.go(target_method, args).await;
        call.wait().await;
        finished(&call)
    }

    /// Like [`Client::call`] but cancel locally when `wait` elapses. The
    /// server still completes the work; only the response is abandoned.
    pub async fn call_until(
        &self,
        wait: Duration,
        target_method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, RpcError> {
        let call = self.go(target_method, args).await;
        if timeout(wait, call.wait()).await.is_err() {
            call.cancel();
        }
        finished(&call)
    }

    /// Idempotent. Terminates every pending call with
    /// [`RpcError::WaitingForReceiving`] and closes the codec.
    pub async fn close(&self) {
        teardown(&self.inner, RpcError::WaitingForReceiving).await;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

fn finished(call: &Call) -> Result<Option<Value>, RpcError> {
    match call.error() {
        Some(err) => Err(err),
        None => Ok(call.reply()),
    }
}

// ---------------------------------------------------------------------------
// Connection routines
// ---------------------------------------------------------------------------

async fn negotiate(
    reader: &mut BufReader<OwnedReadHalf>,
    write_half: &mut OwnedWriteHalf,
    option: ConnectOption,
) -> Result<ServerReply, RpcError> {
    let mut line =
        serde_json::to_vec(&option).map_err(|err| RpcError::Transport(err.to_string()))?;
    line.push(b'\n');
    write_half
        .write_all(&line)
        .await
        .map_err(|err| RpcError::Transport(err.to_string()))?;
    write_half
        .flush()
        .await
        .map_err(|err| RpcError::Transport(err.to_string()))?;

    let mut reply_line = String::new();
    let n = reader
        .read_line(&mut reply_line)
        .await
        .map_err(|err| RpcError::Transport(err.to_string()))?;
    if n == 0 {
        return Err(RpcError::Transport("server closed during negotiation".to_owned()));
    }
    let reply: ServerReply = serde_json::from_str(reply_line.trim_end())
        .map_err(|err| RpcError::Transport(err.to_string()))?;
    if reply.code != ACK_OK {
        return Err(RpcError::Transport(format!("server refused: {}", reply.code)));
    }
    Ok(reply)
}

/// Fan a terminal error out to every pending call and close the codec.
/// First caller wins; the closed flag and pending drain move together.
async fn teardown(inner: &Arc<ClientInner>, error: RpcError) {
    let drained: Vec<Arc<Call>> = {
        let mut state = inner.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.pending.drain().map(|(_, call)| call).collect()
    };
    for call in drained {
        call.finish(Some(error.clone()), None);
    }
    let mut writer = inner.writer.lock().await;
    let _ = writer.close().await;
}

async fn receive_loop(inner: Arc<ClientInner>, mut reader: CodecReader<BufReader<OwnedReadHalf>>) {
    let peer = reader.peer_addr();
    loop {
        tokio::select! {
            () = inner.failed.wait() => break,
            read = reader.read_response() => match read {
                Ok(response) => {
                    let call = inner.lock_state().remove(response.seq);
                    // Absent means locally cancelled: discard the response.
                    if let Some(call) = call {
                        let error = (!response.err.is_empty())
                            .then(|| RpcError::Remote(response.err));
                        let reply = (!response.replyv.is_null()).then_some(response.replyv);
                        call.finish(error, reply);
                    }
                }
                Err(err) => {
                    debug!(%peer, error = %err, "receive failed");
                    break;
                }
            },
        }
    }
    teardown(&inner, RpcError::Shutdown).await;
}

async fn heartbeat_loop(inner: Arc<ClientInner>, tick: Duration) {
    let heartbeat = Request::heartbeat();
    loop {
        sleep(tick).await;
        if inner.lock_state().closed {
            return;
        }
        let mut writer = inner.writer.lock().await;
        if let Err(err) = writer.write_request(&heartbeat).await {
            drop(writer);
            warn!(error = %err, "heartbeat write failed, closing client");
            teardown(&inner, RpcError::Shutdown).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerConfig};
    use crate::service::ServiceBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpListener;

    async fn spawn_name_server(config: ServerConfig) -> String {
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
        let server = Server::with_config(config);
        server.register(service).expect("register");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move {
            server.accept(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_increasing() {
        let addr = spawn_name_server(ServerConfig { tick: 0, ..ServerConfig::default() }).await;
        let client = Client::connect(&addr).await.expect("connect");

        let counter = AtomicU64::new(0);
        for _ in 0..5 {
            let call = client.go("Student:GetName", vec![]).await;
            assert_eq!(call.seq(), counter.fetch_add(1, Ordering::SeqCst));
            call.wait().await;
        }
        client.close().await;
    }

    #[tokio::test]
    async fn call_round_trips_reply_values() {
        let addr = spawn_name_server(ServerConfig { tick: 0, ..ServerConfig::default() }).await;
        let client = Client::connect(&addr).await.expect("connect");

        let reply = client
            .call("Student:SetName", vec![json!("weiwei")])
            .await
            .expect("SetName");
        assert_eq!(reply, None, "no-output method replies null");

        let call = client.go("Student:GetName", vec![]).await;
        call.wait().await;
        assert_eq!(call.error(), None);
        assert_eq!(
            call.reply_as::<String>().expect("decode"),
            Some("weiwei".to_owned())
        );
        client.close().await;
    }

    #[tokio::test]
    async fn unknown_target_is_a_remote_error_and_keeps_the_connection() {
        let addr = spawn_name_server(ServerConfig { tick: 0, ..ServerConfig::default() }).await;
        let client = Client::connect(&addr).await.expect("connect");

        let err = client
            .call("Nope:Missing", vec![])
            .await
            .expect_err("unknown service must fail");
        assert_eq!(err, RpcError::Remote(crate::server::SERVICE_NOT_FOUND.to_owned()));

        // The connection survives invocation errors.
        client
            .call("Student:SetName", vec![json!("still alive")])
            .await
            .expect("connection must remain usable");
        client.close().await;
    }

    #[tokio::test]
    async fn go_after_close_fails_fast_with_shutdown() {
        let addr = spawn_name_server(ServerConfig { tick: 0, ..ServerConfig::default() }).await;
        let client = Client::connect(&addr).await.expect("connect");
        client.close().await;
        assert!(!client.is_available());

        let call = client.go("Student:GetName", vec![]).await;
        assert!(call.is_finished());
        assert_eq!(call.error(), Some(RpcError::Shutdown));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminates_pending_calls() {
        let slow = ServiceBuilder::new("Slow")
            .expect("exported name")
            .method0("Nap", || std::thread::sleep(Duration::from_millis(300)))
            .build();
        let server = Server::with_config(ServerConfig {
            tick: 0,
            call_budget: Duration::from_secs(2),
        });
        server.register(slow).expect("register");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move { server.accept(listener).await });

        let client = Client::connect(&addr).await.expect("connect");
        let call = client.go("Slow:Nap", vec![]).await;
        assert_eq!(client.pending_len(), 1);

        client.close().await;
        client.close().await;
        call.wait().await;
        assert_eq!(call.error(), Some(RpcError::WaitingForReceiving));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_call_leaves_pending_and_other_calls_intact() {
        let slow = ServiceBuilder::new("Slow")
            .expect("exported name")
            .method1("SetName", |_name: String| {
                std::thread::sleep(Duration::from_millis(200));
            })
            .method0("Ping", || "pong".to_owned())
            .build();
        let server = Server::with_config(ServerConfig {
            tick: 0,
            call_budget: Duration::from_secs(2),
        });
        server.register(slow).expect("register");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move { server.accept(listener).await });

        let client = Client::connect(&addr).await.expect("connect");
        let err = client
            .call_until(
                Duration::from_millis(50),
                "Slow:SetName",
                vec![json!("feifei")],
            )
            .await
            .expect_err("must cancel locally");
        assert_eq!(err, RpcError::WaitingForReceiving);
        assert_eq!(client.pending_len(), 0, "cancelled call must leave pending");

        // The late response for the cancelled seq is discarded and does
        // not disturb the next call.
        let reply = client.call("Slow:Ping", vec![]).await.expect("Ping");
        assert_eq!(reply, Some(json!("pong")));
        client.close().await;
    }

    #[tokio::test]
    async fn dial_timeout_wins_against_a_stalled_dial() {
        // A listener that never accepts: the backlog connect may succeed,
        // but negotiation cannot complete.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();

        let err = Client::connect_timeout(&addr, Duration::from_micros(1), ClientConfig::default())
            .await
            .expect_err("deadline must win");
        assert_eq!(err, RpcError::DialTimeout);
        drop(listener);
    }

    #[tokio::test]
    async fn done_fires_exactly_once_with_terminal_state() {
        let call = Call::failed("Student:GetName", RpcError::Shutdown);
        call.wait().await;
        call.wait().await; // resolved forever after
        assert!(call.is_finished());
        assert_eq!(call.error(), Some(RpcError::Shutdown));
        assert!(
            !call.finish(Some(RpcError::WaitingForReceiving), None),
            "second finish must be a no-op"
        );
        assert_eq!(call.error(), Some(RpcError::Shutdown));
    }
}
