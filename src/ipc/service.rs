//! # Service Trait and Reply Plumbing
//!
//! Generalizes the "capability sets as named trait bundles" guidance from
//! §9: `ProducerPort` and `ConsumerPort` (§6) are each a `Service` exposing
//! a small method table, dispatched by method name rather than by a
//! hand-rolled enum per host.
//!
//! Grounded on the teacher's `IpcTransport` trait for the async-first,
//! `Send + Sync` shape, adapted from "one transport, one connection" to
//! "one host, many named services, many methods."

use crate::ids::{ConnectionId, MethodId, RequestId, ServiceId};
use crate::ipc::frame::{Frame, FrameKind, MethodDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One reply handed back from a method handler to its caller (§4.A).
pub struct MethodReply {
    pub success: bool,
    pub has_more: bool,
    pub payload: Vec<u8>,
}

impl MethodReply {
    /// A single, final, successful reply.
    pub fn once(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            has_more: false,
            payload,
        }
    }

    /// One item in an ongoing stream; more replies for this request follow.
    pub fn stream_item(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            has_more: true,
            payload,
        }
    }

    /// A terminal failure reply.
    pub fn failure() -> Self {
        Self {
            success: false,
            has_more: false,
            payload: Vec::new(),
        }
    }
}

/// A sink bound to `(client_id, request_id)` that a method handler uses to
/// push zero-or-more `MethodReply`s back to the host's per-connection writer
/// task, per §4.A's "reply-sink bound to (client_id, request_id)" contract.
#[derive(Clone)]
pub struct ReplySink {
    client_id: ConnectionId,
    request_id: RequestId,
    outbox: mpsc::Sender<(ConnectionId, Frame)>,
}

impl ReplySink {
    pub fn new(
        client_id: ConnectionId,
        request_id: RequestId,
        outbox: mpsc::Sender<(ConnectionId, Frame)>,
    ) -> Self {
        Self {
            client_id,
            request_id,
            outbox,
        }
    }

    /// The connection this sink replies to, so a method handler that needs
    /// to correlate IPC state back to its caller (e.g. looking up which
    /// producer a connection belongs to) doesn't need it threaded through
    /// `dispatch`'s own arguments.
    pub fn connection_id(&self) -> ConnectionId {
        self.client_id
    }

    /// Sends one reply. Returns an error if the connection's writer task
    /// has already gone away (the peer disconnected); callers should treat
    /// that as "nobody is listening anymore" rather than a protocol error.
    pub async fn send(&self, reply: MethodReply) -> Result<()> {
        let frame = Frame::new(
            self.request_id,
            FrameKind::InvokeMethodReply {
                success: reply.success,
                has_more: reply.has_more,
                reply: reply.payload,
            },
        );
        self.outbox
            .send((self.client_id, frame))
            .await
            .map_err(|_| anyhow::anyhow!("reply sink's connection has gone away"))
    }
}

/// A service bound on an IPC host: a name plus a dispatch table, matching
/// §6's `ProducerPort`/`ConsumerPort` method surfaces.
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique name this service binds under (`BindService{service_name}`).
    fn name(&self) -> &str;

    /// The method table advertised in `BindServiceReply`.
    fn methods(&self) -> Vec<MethodDescriptor>;

    /// Dispatches one decoded `InvokeMethod` call. Implementations reply
    /// through `reply` rather than returning a value directly, since a
    /// single call may produce a stream of replies (§4.A).
    async fn dispatch(&self, method_id: MethodId, args: Vec<u8>, reply: ReplySink) -> Result<()>;
}

/// Looks up services exposed on a host by name, assigning each a
/// process-unique `ServiceId` at `expose` time (§4.A: "assigns a service_id").
#[derive(Default)]
pub struct ServiceRegistry {
    by_name: std::collections::HashMap<String, (ServiceId, std::sync::Arc<dyn Service>)>,
    by_id: std::collections::HashMap<ServiceId, std::sync::Arc<dyn Service>>,
    next_id: crate::ids::IdSequence,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under its own name. Returns `false` if the name
    /// is already taken (§4.A: "Names are unique per host").
    pub fn expose(&mut self, service: std::sync::Arc<dyn Service>) -> bool {
        let name = service.name().to_string();
        if self.by_name.contains_key(&name) {
            return false;
        }
        let id = ServiceId(self.next_id.next());
        self.by_id.insert(id, service.clone());
        self.by_name.insert(name, (id, service));
        true
    }

    pub fn find_by_name(&self, name: &str) -> Option<(ServiceId, std::sync::Arc<dyn Service>)> {
        self.by_name.get(name).cloned()
    }

    pub fn find_by_id(&self, id: ServiceId) -> Option<std::sync::Arc<dyn Service>> {
        self.by_id.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        fn name(&self) -> &str {
            "Echo"
        }

        fn methods(&self) -> Vec<MethodDescriptor> {
            vec![MethodDescriptor {
                name: "Ping".to_string(),
                id: MethodId(1),
            }]
        }

        async fn dispatch(
            &self,
            _method_id: MethodId,
            args: Vec<u8>,
            reply: ReplySink,
        ) -> Result<()> {
            reply.send(MethodReply::once(args)).await
        }
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.expose(std::sync::Arc::new(EchoService)));
        assert!(!registry.expose(std::sync::Arc::new(EchoService)));
    }

    #[test]
    fn lookup_by_name_and_id_agree() {
        let mut registry = ServiceRegistry::new();
        registry.expose(std::sync::Arc::new(EchoService));
        let (id, svc) = registry.find_by_name("Echo").unwrap();
        assert_eq!(svc.name(), registry.find_by_id(id).unwrap().name());
    }
}
