// ferrite-protocol: RPC wire envelopes and codecs.
//
// Field names are a frozen wire contract: envelopes serialize with
// PascalCase keys so any peer speaking the protocol interoperates,
// whatever its implementation language.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;

pub use codec::{CodecReader, CodecWriter, FailedFlag, WireError};

/// Connection preamble magic. A mismatch aborts negotiation.
pub const MAGIC_NUMBER: u32 = 0x3bef5;

/// Ack code sent by the server when negotiation succeeds.
pub const ACK_OK: &str = "ok";

// ---------------------------------------------------------------------------
// Codec identifiers
// ---------------------------------------------------------------------------

/// Wire codec negotiated in the option frame.
///
/// Serializes as a bare integer (`0` binary, `1` JSON); an unknown id fails
/// deserialization, which the server treats as a refused connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CodecKind {
    /// Length-prefixed binary frames with a dynamic-type tag registry.
    Binary,
    /// Newline-delimited self-describing JSON.
    Json,
}

impl From<CodecKind> for u8 {
    fn from(kind: CodecKind) -> u8 {
        match kind {
            CodecKind::Binary => 0,
            CodecKind::Json => 1,
        }
    }
}

impl TryFrom<u8> for CodecKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CodecKind::Binary),
            1 => Ok(CodecKind::Json),
            other => Err(format!("unknown codec type {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Negotiation frames
// ---------------------------------------------------------------------------

/// First frame on a fresh connection, always JSON regardless of the codec
/// being negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOption {
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,
    #[serde(rename = "CodecType")]
    pub codec_type: CodecKind,
}

impl Default for ConnectOption {
    fn default() -> Self {
        ConnectOption {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecKind::Binary,
        }
    }
}

/// Server ack to the option frame. `tick` is the heartbeat period in
/// seconds the server expects from this client; `0` disables keep-alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReply {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Tick")]
    pub tick: u64,
}

// ---------------------------------------------------------------------------
// Call envelopes
// ---------------------------------------------------------------------------

/// One outbound call. An empty `target_method` is a heartbeat and produces
/// no response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "TargetMethod")]
    pub target_method: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Argv", default)]
    pub argv: Vec<Value>,
}

impl Request {
    /// Keep-alive frame: empty target, no arguments.
    pub fn heartbeat() -> Self {
        Request {
            target_method: String::new(),
            seq: 0,
            argv: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.target_method.is_empty()
    }
}

/// One inbound completion, paired to its request by `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "Replyv", default)]
    pub replyv: Value,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Err", default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl Response {
    pub fn reply(seq: u64, replyv: Value) -> Self {
        Response {
            replyv,
            seq,
            err: String::new(),
        }
    }

    pub fn error(seq: u64, err: impl Into<String>) -> Self {
        Response {
            replyv: Value::Null,
            seq,
            err: err.into(),
        }
    }
}
