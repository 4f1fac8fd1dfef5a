//! RPC server: accept loop, per-connection negotiation, and the
//! read/dispatch/write pipeline.
//!
//! # Per-connection pipeline
//! One reader loop decodes requests; each request is dispatched on its own
//! task with a bounded time budget; a single writer task serializes
//! responses back onto the codec. The writer owns the response channel:
//! when the reader exits and the last in-flight worker drops its sender,
//! the channel closes, the writer drains, and the codec is closed.
//!
//! # Heartbeats
//! An empty target method is a keep-alive: it feeds the connection's
//! heartbeat supervisor and produces no response. When the server
//! advertises a non-zero tick, missing heartbeats for twice the tick
//! closes the codec and tears the connection down.

use crate::service::{DefineError, DispatchError, Service};
use ferrite_protocol::codec::{self, CodecReader, CodecWriter};
use ferrite_protocol::{ConnectOption, Request, Response, ServerReply, ACK_OK, MAGIC_NUMBER};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Response error text for a dispatch that outlived its time budget.
pub const SERVICE_TIMEOUT: &str = "service timeout";
/// Response error text for a malformed, unknown, or unreachable target.
pub const SERVICE_NOT_FOUND: &str = "service/method not found";
/// Response error text for a handler that panicked.
pub const SERVICE_CALL_FAILED: &str = "service call failed";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Heartbeat period in seconds advertised to clients. `0` disables
    /// heartbeat supervision for the connection.
    pub tick: u64,
    /// Wall-clock budget for a single dispatch. A late result is
    /// discarded; the invocation itself is not interrupted.
    pub call_budget: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            tick: 10,
            call_budget: Duration::from_millis(700),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Hosts registered services over TCP. Cheap to clone; all clones share
/// the same service table.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    services: RwLock<HashMap<String, Arc<Service>>>,
    config: ServerConfig,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                services: RwLock::new(HashMap::new()),
                config,
                shutdown: tokio::sync::watch::channel(false).0,
            }),
        }
    }

    /// Idempotent. Stops every accept loop; established connections run
    /// until their own teardown.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Insert a dispatch table. A duplicate service name is a
    /// configuration error.
    pub fn register(&self, service: Service) -> Result<(), DefineError> {
        let mut services = self
            .inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let name = service.name().to_owned();
        if services.contains_key(&name) {
            return Err(DefineError::AlreadyDefined(name));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Accept connections until the listener fails or the server is
    /// closed, serving each on its own task.
    pub async fn accept(&self, listener: TcpListener) {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    debug!("server closed, stopping accept");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_conn(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed, stopping");
                        return;
                    }
                },
            }
        }
    }

    /// Negotiate and run the pipeline for one connection. Returns when the
    /// connection is torn down.
    pub async fn serve_conn(&self, stream: TcpStream) {
        let Ok(peer) = stream.peer_addr() else {
            return;
        };
        let local = stream.local_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut write_half = write_half;

        let Some(option) = negotiate(&mut reader, peer).await else {
            return;
        };
        let reply = ServerReply {
            code: ACK_OK.to_owned(),
            tick: self.inner.config.tick,
        };
        if write_ack(&mut write_half, &reply).await.is_err() {
            debug!(%peer, "ack write failed");
            return;
        }

        let (codec_reader, codec_writer) = codec::split(option.codec_type, reader, write_half, peer);
        self.run_pipeline(codec_reader, codec_writer).await;
        info!(%peer, local = ?local, "connection closed");
    }

    async fn run_pipeline(
        &self,
        mut reader: CodecReader<BufReader<OwnedReadHalf>>,
        writer: CodecWriter<OwnedWriteHalf>,
    ) {
        let failed = reader.failed_flag();
        let peer = reader.peer_addr();
        let (resp_tx, resp_rx) = mpsc::channel::<Response>(32);
        let writer_task = tokio::spawn(write_loop(writer, resp_rx, failed.clone()));

        let (beat_tx, beat_rx) = mpsc::channel::<()>(1);
        if self.inner.config.tick > 0 {
            let window = Duration::from_secs(self.inner.config.tick * 2);
            tokio::spawn(heartbeat_supervisor(beat_rx, window, failed.clone()));
        } else {
            drop(beat_rx);
        }

        loop {
            tokio::select! {
                () = failed.wait() => break,
                read = reader.read_request() => match read {
                    Ok(request) if request.is_heartbeat() => {
                        let _ = beat_tx.try_send(());
                    }
                    Ok(request) => {
                        let inner = self.inner.clone();
                        let tx = resp_tx.clone();
                        tokio::spawn(async move {
                            handle_request(inner, request, tx).await;
                        });
                    }
                    Err(err) => {
                        debug!(%peer, error = %err, "request read failed");
                        break;
                    }
                },
            }
        }

        // Dropping the reader closes the read half at once; the writer
        // closes the write half. Workers hold sender clones: the channel
        // closes once the last in-flight dispatch completes, and the
        // writer drains whatever they still produce.
        drop(reader);
        drop(resp_tx);
        drop(beat_tx);
        let _ = writer_task.await;
    }
}

// ---------------------------------------------------------------------------
// Connection stages
// ---------------------------------------------------------------------------

async fn negotiate(
    reader: &mut BufReader<OwnedReadHalf>,
    peer: SocketAddr,
) -> Option<ConnectOption> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => return None,
        Ok(_) => {}
    }
    let option: ConnectOption = match serde_json::from_str(line.trim_end()) {
        Ok(option) => option,
        Err(err) => {
            warn!(%peer, error = %err, "bad option frame");
            return None;
        }
    };
    if option.magic_number != MAGIC_NUMBER {
        warn!(%peer, magic = option.magic_number, "invalid magic number");
        return None;
    }
    Some(option)
}

async fn write_ack(
    write_half: &mut OwnedWriteHalf,
    reply: &ServerReply,
) -> Result<(), std::io::Error> {
    let mut line = serde_json::to_vec(reply).unwrap_or_default();
    line.push(b'\n');
    write_half.write_all(&line).await?;
    write_half.flush().await
}

async fn write_loop(
    mut writer: CodecWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Response>,
    failed: ferrite_protocol::FailedFlag,
) {
    loop {
        tokio::select! {
            () = failed.wait() => break,
            recv = rx.recv() => match recv {
                Some(response) => {
                    if let Err(err) = writer.write_response(&response).await {
                        debug!(seq = response.seq, error = %err, "response write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.close().await;
    // Late worker results are discarded, never blocked: keep the channel
    // draining until the last sender drops.
    while rx.recv().await.is_some() {}
}

async fn heartbeat_supervisor(
    mut beat_rx: mpsc::Receiver<()>,
    window: Duration,
    failed: ferrite_protocol::FailedFlag,
) {
    loop {
        match timeout(window, beat_rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(_) => {
                warn!("client heartbeat missed, closing connection");
                failed.set();
                return;
            }
        }
    }
}

/// Dispatch one request and emit its response. The invocation runs on a
/// blocking thread so a stalled handler cannot wedge the reader; when the
/// budget elapses the handler keeps running in the background and its
/// result is discarded.
async fn handle_request(inner: Arc<ServerInner>, request: Request, tx: mpsc::Sender<Response>) {
    let seq = request.seq;
    let response = match resolve(&inner, &request.target_method) {
        None => Response::error(seq, SERVICE_NOT_FOUND),
        Some((service, method)) => {
            let args = request.argv;
            let invocation =
                tokio::task::spawn_blocking(move || service.invoke(&method, args));
            match timeout(inner.config.call_budget, invocation).await {
                Err(_) => {
                    debug!(seq, target = %request.target_method, "dispatch budget exceeded");
                    Response::error(seq, SERVICE_TIMEOUT)
                }
                Ok(Err(join_err)) => {
                    warn!(seq, error = %join_err, "handler aborted");
                    Response::error(seq, SERVICE_CALL_FAILED)
                }
                Ok(Ok(Err(DispatchError::UnknownMethod(_)))) => {
                    Response::error(seq, SERVICE_NOT_FOUND)
                }
                Ok(Ok(Err(dispatch_err))) => Response::error(seq, dispatch_err.to_string()),
                Ok(Ok(Ok(reply))) => Response::reply(seq, reply.unwrap_or_default()),
            }
        }
    };
    let _ = tx.send(response).await;
}

fn resolve(inner: &ServerInner, target_method: &str) -> Option<(Arc<Service>, String)> {
    let (service_name, method) = target_method.split_once(':')?;
    if service_name.is_empty() || method.is_empty() {
        return None;
    }
    let services = inner
        .services
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    let service = services.get(service_name)?.clone();
    Some((service, method.to_owned()))
}
