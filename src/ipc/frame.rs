//! # Wire Frame
//!
//! The single self-describing message type carried by the IPC fabric (§6).
//! Every frame carries a `request_id`; replies echo it back so a client can
//! correlate a reply with the request that produced it without the wire
//! protocol needing its own sequencing.
//!
//! Grounded on the teacher's `ipc::Message`, generalized from a flat
//! `{id, timestamp, payload, message_type}` benchmark record into the
//! request/reply/stream oneof the tracing protocol actually needs.

use crate::ids::{MethodId, RequestId, ServiceId};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One method exposed by a bound service, as advertised in a
/// `BindServiceReply`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub id: MethodId,
}

/// The payload carried by a `Frame`. Unknown fields within a known variant
/// are tolerated by serde's default struct handling; an entirely unknown
/// variant fails to deserialize, which the codec treats as a decode error
/// (§7, *Transport errors*) rather than something to skip silently — only
/// field-level forward compatibility is promised by §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameKind {
    /// Client → host: "bind me to the service named `service_name`."
    BindService { service_name: String },

    /// Host → client: outcome of a `BindService` request.
    BindServiceReply {
        success: bool,
        service_id: ServiceId,
        methods: Vec<MethodDescriptor>,
    },

    /// Client → host: invoke `method_id` on `service_id` with encoded args.
    InvokeMethod {
        service_id: ServiceId,
        method_id: MethodId,
        args: Vec<u8>,
    },

    /// Host → client: one reply to an in-flight `InvokeMethod`.
    /// `has_more = true` means further replies for this `request_id` are
    /// still to come; exactly one reply per request has `has_more = false`.
    InvokeMethodReply {
        success: bool,
        has_more: bool,
        reply: Vec<u8>,
    },
}

/// A complete wire message: a correlation id plus one of the four frame
/// kinds in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub request_id: RequestId,
    pub kind: FrameKind,
}

impl Frame {
    pub fn new(request_id: RequestId, kind: FrameKind) -> Self {
        Self { request_id, kind }
    }

    /// Serializes this frame to its wire payload bytes (without the
    /// length prefix; see `ipc::codec` for the framing around this).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Reconstructs a frame from its wire payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
