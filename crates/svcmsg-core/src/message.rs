//! Message envelope shared by clients and servers.
//!
//! Every frame on the wire carries one `FrameHeader` and a raw payload.
//! Client-to-server traffic is always a `Request`; the server answers with
//! `Reply` frames correlated by message id and may push `Pulse` frames at
//! any time.

use crate::config::OpenFlags;
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message identifier, unique per connection while awaiting a reply.
pub type MsgId = u64;

/// Request shapes a client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Open,
    Close,
    Notify,
    Put,
    Get,
    PutGet,
    Noop,
}

impl MsgType {
    /// Whether the server tracks this message as awaiting a reply.
    ///
    /// PUT only does so when the client asked for an acknowledgment.
    pub fn expects_reply(&self, flags: MsgFlags) -> bool {
        match self {
            MsgType::Open | MsgType::Close | MsgType::Notify | MsgType::Get | MsgType::PutGet => {
                true
            }
            MsgType::Put => flags.contains(MsgFlags::ACK),
            MsgType::Noop => false,
        }
    }

    /// Whether the message reaches the service's worker callback.
    pub fn is_io(&self) -> bool {
        matches!(self, MsgType::Put | MsgType::Get | MsgType::PutGet)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MsgType::Open => "OPEN",
            MsgType::Close => "CLOSE",
            MsgType::Notify => "NOTIFY",
            MsgType::Put => "PUT",
            MsgType::Get => "GET",
            MsgType::PutGet => "PUTGET",
            MsgType::Noop => "NOOP",
        };
        write!(f, "{}", s)
    }
}

bitflags! {
    /// Per-message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MsgFlags: u32 {
        /// PUT wants an acknowledgment reply.
        const ACK = 1 << 0;
        /// CLOSE injected by the server after the peer went away.
        const SYNTHETIC = 1 << 1;
    }
}

/// Generation-checked reference to an OSB slot.
///
/// A slot index alone is reused after release; the generation tells a
/// stale reference apart from the slot's current occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub slot: u32,
    pub generation: u32,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "osb#{}.{}", self.slot, self.generation)
    }
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub kind: MsgType,
    #[serde(default)]
    pub flags: MsgFlags,
    pub service_slot: u32,
    /// OSB this message targets; `None` only for OPEN.
    pub object: Option<ObjectRef>,
    /// Opaque handle reference passed through to the worker (GET uses it).
    #[serde(default)]
    pub handle_ref: u64,
    pub send_len: u32,
    pub reply_cap: u32,
    pub msg_id: MsgId,
}

impl MessageHeader {
    pub fn new(kind: MsgType, service_slot: u32, msg_id: MsgId) -> Self {
        Self {
            kind,
            flags: MsgFlags::empty(),
            service_slot,
            object: None,
            handle_ref: 0,
            send_len: 0,
            reply_cap: 0,
            msg_id,
        }
    }
}

/// Reply envelope, correlated with a request by `msg_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub msg_id: MsgId,
    pub status: i32,
    /// Set on a successful OPEN reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    /// Payload was cut to the request's reply capacity.
    #[serde(default)]
    pub truncated: bool,
}

/// Asynchronous notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseHeader {
    pub code: i32,
    pub value: u64,
    /// Request this pulse answers, for deferred-with-context PUT replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
}

/// Header part of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameHeader {
    Request(MessageHeader),
    Reply(ReplyHeader),
    Pulse(PulseHeader),
}

/// Pulse as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    pub code: i32,
    pub value: u64,
    pub msg_id: Option<MsgId>,
    pub payload: Bytes,
}

/// Identity a client presents on OPEN.
///
/// Self-reported over loopback; the permission layer treats it as a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: Option<u32>,
}

impl PeerCredentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        #[cfg(unix)]
        let uid = Some(nix::unistd::getuid().as_raw());
        #[cfg(not(unix))]
        let uid = None;

        Self {
            pid: std::process::id(),
            uid,
        }
    }
}

/// Payload of an OPEN message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub service: String,
    pub instance: String,
    #[serde(default)]
    pub flags: OpenFlags,
    pub credentials: PeerCredentials,
    /// Application bytes handed to the `open` callback.
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Readiness condition a client can ask to be pulsed about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    /// Data is available for a GET.
    Input,
    /// Room is available for a PUT.
    Output,
}

/// Payload of a NOTIFY message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub kind: NotifyKind,
    /// Pulse code the service should use when the condition becomes true.
    pub code: i32,
}

/// Answer to a NOTIFY message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// Condition already holds; no pulse will follow.
    Ready,
    /// A pulse will be sent when the condition becomes true.
    Armed,
}
