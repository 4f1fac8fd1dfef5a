//! Codec halves over a bidirectional byte stream.
//!
//! A codec is split at construction into a [`CodecReader`] and a
//! [`CodecWriter`] so a receive loop and a send path can run concurrently;
//! the two halves share a [`FailedFlag`] that commits the connection to
//! "failed" on the first irrecoverable I/O error or explicit close.
//!
//! # Framing
//! - `CodecKind::Json`: one envelope per line, self-describing JSON.
//! - `CodecKind::Binary`: `[kind: u8][len: u32 BE][payload]` frames. The
//!   payload carries no type information for polymorphic fields, so the
//!   writer keeps a registry of dynamic value types it has seen: the first
//!   appearance of a type is announced in a metadata frame (kind 0)
//!   preceding the envelope frame (kind 1), and the value itself is
//!   replaced by a `{tag, value}` wrapper. Primitives are never tagged.
//!   The reader maintains the mirror registry and rejects unknown tags.
//!
//! Writes are serialized by the caller; every successful write has been
//! flushed to the stream.

use crate::{CodecKind, Request, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Upper bound on a single binary frame. Oversize frames are an error, not
/// an allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const FRAME_TYPES: u8 = 0;
const FRAME_BODY: u8 = 1;

const TAG_KEY: &str = "$tag";
const VALUE_KEY: &str = "$value";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode/decode error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unexpected frame kind {0}")]
    BadFrame(u8),
    #[error("unknown type tag {0}")]
    UnknownTypeTag(u64),
}

impl WireError {
    fn from_read(err: std::io::Error) -> WireError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Failed flag
// ---------------------------------------------------------------------------

/// One-shot "this connection is broken" signal shared by both codec halves
/// and any supervisor that needs to tear the connection down.
#[derive(Debug, Clone)]
pub struct FailedFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl FailedFlag {
    pub fn new() -> Self {
        FailedFlag {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Commit the connection to failed. Monotonic; later calls are no-ops.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_failed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for FailedFlag {
    fn default() -> Self {
        FailedFlag::new()
    }
}

/// Build a reader/writer pair over split stream halves sharing a fresh
/// failed flag.
pub fn split<R, W>(
    kind: CodecKind,
    reader: R,
    writer: W,
    peer: SocketAddr,
) -> (CodecReader<R>, CodecWriter<W>)
where
    R: AsyncRead + AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let failed = FailedFlag::new();
    (
        CodecReader {
            kind,
            reader,
            failed: failed.clone(),
            peer,
            types: HashMap::new(),
        },
        CodecWriter {
            kind,
            writer,
            failed,
            peer,
            types: TypeTable::default(),
            closed: false,
        },
    )
}

// ---------------------------------------------------------------------------
// Dynamic type registry (binary codec)
// ---------------------------------------------------------------------------

/// One newly-announced dynamic type, sent in a kind-0 frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TypeDef {
    #[serde(rename = "Tag")]
    tag: u64,
    #[serde(rename = "Name")]
    name: String,
}

/// Writer-side registry of dynamic value types, keyed by structural name.
#[derive(Debug, Default)]
struct TypeTable {
    tags: HashMap<String, u64>,
    next: u64,
}

impl TypeTable {
    /// Tag a polymorphic value, announcing its type on first appearance.
    /// Untagged (primitive) values pass through unchanged.
    fn tag(&mut self, value: &Value, fresh: &mut Vec<TypeDef>) -> Value {
        let Some(name) = type_name(value) else {
            return value.clone();
        };
        let tag = match self.tags.get(&name) {
            Some(tag) => *tag,
            None => {
                let tag = self.next;
                self.next += 1;
                self.tags.insert(name.clone(), tag);
                fresh.push(TypeDef { tag, name });
                tag
            }
        };
        let mut wrapper = Map::new();
        wrapper.insert(TAG_KEY.to_owned(), Value::from(tag));
        wrapper.insert(VALUE_KEY.to_owned(), value.clone());
        Value::Object(wrapper)
    }
}

/// Structural name of a dynamic value. Only named (object-shaped) values
/// carry type identity; primitives and arrays return `None` and are sent
/// bare, mirroring the "no package, no registration" rule.
fn type_name(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            Some(format!("{{{}}}", keys.join(",")))
        }
        _ => None,
    }
}

/// Unwrap `{tag, value}` wrappers in place, resolving each tag against the
/// reader-side registry. A tag the reader has never been told about is a
/// decode error.
fn restore_tags(value: &mut Value, types: &HashMap<u64, String>) -> Result<(), WireError> {
    match value {
        Value::Object(map) if is_tagged(map) => {
            let tag = map[TAG_KEY].as_u64().unwrap_or(u64::MAX);
            if !types.contains_key(&tag) {
                return Err(WireError::UnknownTypeTag(tag));
            }
            let inner = map.remove(VALUE_KEY).unwrap_or(Value::Null);
            *value = inner;
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                restore_tags(v, types)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for v in items {
                restore_tags(v, types)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_tagged(map: &Map<String, Value>) -> bool {
    map.len() == 2 && map.get(TAG_KEY).is_some_and(Value::is_u64) && map.contains_key(VALUE_KEY)
}

// ---------------------------------------------------------------------------
// Reader half
// ---------------------------------------------------------------------------

/// Decoding half of a codec. Owned by the single receive loop of its
/// connection.
pub struct CodecReader<R> {
    kind: CodecKind,
    reader: R,
    failed: FailedFlag,
    peer: SocketAddr,
    types: HashMap<u64, String>,
}

impl<R> CodecReader<R>
where
    R: AsyncRead + AsyncBufRead + Unpin + Send,
{
    pub async fn read_request(&mut self) -> Result<Request, WireError> {
        self.read_envelope().await
    }

    pub async fn read_response(&mut self) -> Result<Response, WireError> {
        self.read_envelope().await
    }

    /// Peer address, for diagnostics.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn failed_flag(&self) -> FailedFlag {
        self.failed.clone()
    }

    async fn read_envelope<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        let result = self.read_envelope_inner().await;
        if result.is_err() {
            self.failed.set();
        }
        result
    }

    async fn read_envelope_inner<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        match self.kind {
            CodecKind::Json => {
                let mut line = String::new();
                let n = self
                    .reader
                    .read_line(&mut line)
                    .await
                    .map_err(WireError::from_read)?;
                if n == 0 {
                    return Err(WireError::Closed);
                }
                Ok(serde_json::from_str(line.trim_end())?)
            }
            CodecKind::Binary => {
                let payload = self.read_body_frame().await?;
                let mut value: Value = serde_json::from_slice(&payload)?;
                restore_tags(&mut value, &self.types)?;
                Ok(serde_json::from_value(value)?)
            }
        }
    }

    /// Consume frames until a body frame arrives, folding any type
    /// announcements into the registry on the way.
    async fn read_body_frame(&mut self) -> Result<Vec<u8>, WireError> {
        loop {
            let kind = self.reader.read_u8().await.map_err(WireError::from_read)?;
            let len = self.reader.read_u32().await.map_err(WireError::from_read)? as usize;
            if len > MAX_FRAME_LEN {
                return Err(WireError::FrameTooLarge(len));
            }
            let mut payload = vec![0u8; len];
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(WireError::from_read)?;
            match kind {
                FRAME_TYPES => {
                    let defs: Vec<TypeDef> = serde_json::from_slice(&payload)?;
                    for def in defs {
                        self.types.insert(def.tag, def.name);
                    }
                }
                FRAME_BODY => return Ok(payload),
                other => return Err(WireError::BadFrame(other)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer half
// ---------------------------------------------------------------------------

/// Encoding half of a codec. Callers serialize access (one writer at a
/// time); every successful write has been flushed.
#[derive(Debug)]
pub struct CodecWriter<W> {
    kind: CodecKind,
    writer: W,
    failed: FailedFlag,
    peer: SocketAddr,
    types: TypeTable,
    closed: bool,
}

impl<W> CodecWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub async fn write_request(&mut self, request: &Request) -> Result<(), WireError> {
        let result = self.write_request_inner(request).await;
        if result.is_err() {
            self.failed.set();
        }
        result
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<(), WireError> {
        let result = self.write_response_inner(response).await;
        if result.is_err() {
            self.failed.set();
        }
        result
    }

    /// Idempotent: the first call signals the failed flag and shuts the
    /// stream down, later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), WireError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.failed.set();
        let _ = self.writer.shutdown().await;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn failed_flag(&self) -> FailedFlag {
        self.failed.clone()
    }

    async fn write_request_inner(&mut self, request: &Request) -> Result<(), WireError> {
        match self.kind {
            CodecKind::Json => self.write_line(request).await?,
            CodecKind::Binary => {
                let mut fresh = Vec::new();
                let argv: Vec<Value> = request
                    .argv
                    .iter()
                    .map(|v| self.types.tag(v, &mut fresh))
                    .collect();
                let tagged = Request {
                    target_method: request.target_method.clone(),
                    seq: request.seq,
                    argv,
                };
                self.write_frames(&fresh, &tagged).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_response_inner(&mut self, response: &Response) -> Result<(), WireError> {
        match self.kind {
            CodecKind::Json => self.write_line(response).await?,
            CodecKind::Binary => {
                let mut fresh = Vec::new();
                let tagged = Response {
                    replyv: self.types.tag(&response.replyv, &mut fresh),
                    seq: response.seq,
                    err: response.err.clone(),
                };
                self.write_frames(&fresh, &tagged).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_line<T: Serialize>(&mut self, envelope: &T) -> Result<(), WireError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn write_frames<T: Serialize>(
        &mut self,
        fresh: &[TypeDef],
        envelope: &T,
    ) -> Result<(), WireError> {
        if !fresh.is_empty() {
            let payload = serde_json::to_vec(fresh)?;
            self.write_frame(FRAME_TYPES, &payload).await?;
        }
        let payload = serde_json::to_vec(envelope)?;
        self.write_frame(FRAME_BODY, &payload).await?;
        Ok(())
    }

    async fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(payload.len()));
        }
        self.writer.write_u8(kind).await?;
        self.writer.write_u32(payload.len() as u32).await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }
}
