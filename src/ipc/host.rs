//! # IPC Host
//!
//! The accept-and-dispatch half of the fabric (§4.A, host side). Binds a
//! Unix domain socket, accepts connections, and for each one decodes
//! frames and routes `BindService`/`InvokeMethod` requests to registered
//! `Service`s, writing replies back through a per-connection writer task.
//!
//! Grounded on the teacher's `UnixDomainSocketTransport::start_multi_server`
//! accept loop and `handle_connection`, generalized from forwarding raw
//! `Message`s to a channel into dispatching `Frame`s against a
//! `ServiceRegistry` in-place.

use crate::ids::ConnectionId;
use crate::ipc::codec::{read_frame, write_frame};
use crate::ipc::frame::{Frame, FrameKind};
use crate::ipc::service::{ReplySink, ServiceRegistry};
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A name for a host's listening socket. A leading `@` means Linux's
/// abstract namespace (§6); anything else is a filesystem path that must be
/// `unlink`ed before binding.
#[derive(Debug, Clone)]
pub struct SocketName(pub String);

impl SocketName {
    fn is_abstract(&self) -> bool {
        self.0.starts_with('@')
    }
}

/// Binds one well-known socket and dispatches incoming frames to a
/// `ServiceRegistry`. One `Host` serves exactly one of the two well-known
/// endpoints named in §6 (producers or consumers); the tracing service runs
/// two.
pub struct Host {
    registry: Arc<Mutex<ServiceRegistry>>,
    socket_name: SocketName,
    next_connection_id: Arc<AtomicU64>,
}

/// Fired once per accepted connection that later disconnects, so the owning
/// `TracingService` can cascade producer/consumer cleanup (§4.C).
pub type DisconnectHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;

impl Host {
    pub fn new(socket_name: SocketName) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ServiceRegistry::new())),
            socket_name,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a service for dispatch. Returns `false` on a name
    /// collision (§4.A: names are unique per host).
    pub async fn expose_service(&self, service: Arc<dyn crate::ipc::service::Service>) -> bool {
        self.registry.lock().await.expose(service)
    }

    /// Binds the listening socket and runs the accept loop forever,
    /// spawning one connection-handler task per accepted peer. `on_disconnect`
    /// is invoked (from the handler task) once a connection's read loop ends.
    pub async fn serve(self: Arc<Self>, on_disconnect: DisconnectHandler) -> Result<()> {
        let listener = self.bind().await?;
        debug!(socket = %self.socket_name.0, "IPC host listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id, "accepted IPC connection");

            let registry = self.registry.clone();
            let on_disconnect = on_disconnect.clone();
            tokio::spawn(handle_connection(connection_id, stream, registry, on_disconnect));
        }
    }

    async fn bind(&self) -> Result<UnixListener> {
        if self.socket_name.is_abstract() {
            #[cfg(target_os = "linux")]
            {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;
                let addr = SocketAddr::from_abstract_name(self.socket_name.0[1..].as_bytes())?;
                let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
                std_listener.set_nonblocking(true)?;
                return Ok(UnixListener::from_std(std_listener)?);
            }
            #[cfg(not(target_os = "linux"))]
            {
                anyhow::bail!("abstract-namespace sockets require Linux");
            }
        }

        let _ = std::fs::remove_file(&self.socket_name.0);
        let listener = UnixListener::bind(&self.socket_name.0)?;
        #[cfg(unix)]
        {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.socket_name.0, fs::Permissions::from_mode(0o666));
        }
        Ok(listener)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // A Host always creates (never attaches to) its socket, so it's always
        // responsible for cleaning up the filesystem entry on teardown.
        if !self.socket_name.is_abstract() {
            let _ = std::fs::remove_file(&self.socket_name.0);
        }
    }
}

async fn handle_connection(
    connection_id: ConnectionId,
    stream: UnixStream,
    registry: Arc<Mutex<ServiceRegistry>>,
    on_disconnect: DisconnectHandler,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<(ConnectionId, Frame)>(256);

    let writer_task = tokio::spawn(async move {
        while let Some((_client_id, frame)) = outbox_rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &frame).await {
                debug!(connection_id, %err, "write failed, closing connection");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection_id, %err, "connection closed or frame decode failed");
                break;
            }
        };

        match frame.kind {
            FrameKind::BindService { service_name } => {
                let (success, service_id, methods) = {
                    let registry = registry.lock().await;
                    match registry.find_by_name(&service_name) {
                        Some((id, svc)) => (true, id, svc.methods()),
                        None => (false, crate::ids::ServiceId::NONE, Vec::new()),
                    }
                };
                let reply = Frame::new(
                    frame.request_id,
                    FrameKind::BindServiceReply {
                        success,
                        service_id,
                        methods,
                    },
                );
                if outbox_tx.send((connection_id, reply)).await.is_err() {
                    break;
                }
            }
            FrameKind::InvokeMethod {
                service_id,
                method_id,
                args,
            } => {
                let service = registry.lock().await.find_by_id(service_id);
                match service {
                    Some(service) => {
                        // Spawned rather than awaited in place: a long-lived call
                        // like GetAsyncCommand never returns, and awaiting it here
                        // would stop this connection's read loop from ever seeing
                        // another frame (§6).
                        let sink = ReplySink::new(connection_id, frame.request_id, outbox_tx.clone());
                        tokio::spawn(async move {
                            if let Err(err) = service.dispatch(method_id, args, sink).await {
                                warn!(connection_id, %err, "service dispatch failed");
                            }
                        });
                    }
                    None => {
                        let failure = Frame::new(
                            frame.request_id,
                            FrameKind::InvokeMethodReply {
                                success: false,
                                has_more: false,
                                reply: Vec::new(),
                            },
                        );
                        let _ = outbox_tx.send((connection_id, failure)).await;
                    }
                }
            }
            FrameKind::BindServiceReply { .. } | FrameKind::InvokeMethodReply { .. } => {
                warn!(connection_id, "host received a reply-only frame kind, ignoring");
            }
        }
    }

    drop(outbox_tx);
    let _ = writer_task.await;
    on_disconnect(connection_id);
}
