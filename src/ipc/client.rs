//! # IPC Client
//!
//! The connecting half of the fabric (§4.A, client side). Used by the
//! producer-side and consumer-side harnesses (and the integration tests) to
//! bind a named service and issue `BeginInvoke` calls, tracking in-flight
//! requests in a `pending_requests` map exactly as §9 describes: "reply
//! delivery is a map lookup + callback, not an `await`."
//!
//! Grounded on the teacher's `UnixDomainSocketTransport` client half
//! (`start_client`/`send`/`receive`), restructured around a background
//! reader task plus a pending-request table since this client must support
//! streamed (`has_more`) replies rather than one send/receive pair at a
//! time.

use crate::ids::{IdSequence, MethodId, RequestId, ServiceId};
use crate::ipc::codec::{read_frame, write_frame};
use crate::ipc::frame::{Frame, FrameKind};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A bound service on the remote host: the name→id method table installed
/// by `BindServiceReply` (§4.A).
#[derive(Debug, Clone)]
pub struct BoundService {
    pub service_id: ServiceId,
    pub methods: HashMap<String, MethodId>,
}

/// One reply delivered to a pending `InvokeMethod` call.
#[derive(Debug, Clone)]
pub struct InvokeReply {
    pub success: bool,
    pub has_more: bool,
    pub payload: Vec<u8>,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, mpsc::Sender<Frame>>>>;

/// A connected client. Owns the write half directly; a background task owns
/// the read half and routes each incoming reply frame to whichever pending
/// request registered that `request_id`, discarding replies nobody is
/// waiting on anymore (§9: "a reply that finds no live proxy is discarded").
pub struct Client {
    write_half: Mutex<tokio::net::unix::OwnedWriteHalf>,
    request_ids: IdSequence,
    pending: PendingTable,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connects to a named Unix domain socket and starts the background
    /// reader task. Matches the teacher's `start_client`, generalized from a
    /// single pending exchange to a `pending_requests` table.
    pub async fn connect(socket_path: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (mut read_half, write_half) = stream.into_split();

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(%err, "client connection closed");
                        break;
                    }
                };

                let request_id = frame.request_id;
                let sender = {
                    let mut pending = reader_pending.lock().await;
                    let keep_open = matches!(
                        frame.kind,
                        FrameKind::InvokeMethodReply { has_more: true, .. }
                    );
                    if keep_open {
                        pending.get(&request_id).cloned()
                    } else {
                        pending.remove(&request_id)
                    }
                };
                if let Some(sender) = sender {
                    let _ = sender.send(frame).await;
                }
            }
            // OnDisconnect (client side): every still-pending request's sender
            // is dropped, which fails the corresponding awaiting caller.
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            write_half: Mutex::new(write_half),
            request_ids: IdSequence::new(),
            pending,
            reader_task,
        })
    }

    async fn register(&self) -> (RequestId, mpsc::Receiver<Frame>) {
        let request_id = RequestId(self.request_ids.next());
        let (tx, rx) = mpsc::channel(8);
        self.pending.lock().await.insert(request_id, tx);
        (request_id, rx)
    }

    /// Sends `BindService{service_name}` and waits for the matching
    /// `BindServiceReply`. Fails with `OnConnectionFailed`-equivalent error
    /// text if the host doesn't know the name or the connection drops
    /// before a reply arrives.
    pub async fn bind_service(&self, service_name: &str) -> Result<BoundService> {
        let (request_id, mut rx) = self.register().await;
        let frame = Frame::new(
            request_id,
            FrameKind::BindService {
                service_name: service_name.to_string(),
            },
        );
        write_frame(&mut *self.write_half.lock().await, &frame).await?;

        let reply = rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("connection closed before BindServiceReply for {service_name:?}"))?;

        match reply.kind {
            FrameKind::BindServiceReply {
                success: true,
                service_id,
                methods,
            } => Ok(BoundService {
                service_id,
                methods: methods.into_iter().map(|m| (m.name, m.id)).collect(),
            }),
            FrameKind::BindServiceReply { success: false, .. } => {
                Err(anyhow!("host has no service named {service_name:?}"))
            }
            _ => Err(anyhow!("expected BindServiceReply, got a different frame kind")),
        }
    }

    /// Sends `InvokeMethod{service_id, method_id, args}` and returns a
    /// channel over which every `InvokeMethodReply` for this request is
    /// delivered, last one carrying `has_more = false`.
    pub async fn begin_invoke(
        &self,
        service_id: ServiceId,
        method_id: MethodId,
        args: Vec<u8>,
    ) -> Result<mpsc::Receiver<InvokeReply>> {
        let (request_id, mut frame_rx) = self.register().await;
        let frame = Frame::new(
            request_id,
            FrameKind::InvokeMethod {
                service_id,
                method_id,
                args,
            },
        );
        write_frame(&mut *self.write_half.lock().await, &frame).await?;

        let (reply_tx, reply_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let FrameKind::InvokeMethodReply {
                    success,
                    has_more,
                    reply,
                } = frame.kind
                {
                    if reply_tx
                        .send(InvokeReply {
                            success,
                            has_more,
                            payload: reply,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        Ok(reply_rx)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::frame::MethodDescriptor;
    use crate::ipc::host::{Host, SocketName};
    use crate::ipc::service::{MethodReply, ReplySink, Service};
    use async_trait::async_trait;

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

    #[tokio::test]
    async fn bind_and_invoke_round_trip_over_a_real_socket() {
        let socket_path = format!("/tmp/tracing-service-client-test-{}.sock", std::process::id());
        let _ = std::fs::remove_file(&socket_path);

        let host = Arc::new(Host::new(SocketName(socket_path.clone())));
        host.expose_service(Arc::new(EchoService)).await;

        let host_for_task = host.clone();
        tokio::spawn(async move {
            let _ = host_for_task.serve(Arc::new(|_id| {})).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = Client::connect(&socket_path).await.unwrap();
        let bound = client.bind_service("Echo").await.unwrap();
        let method_id = *bound.methods.get("Ping").unwrap();

        let mut replies = client
            .begin_invoke(bound.service_id, method_id, vec![9, 9, 9])
            .await
            .unwrap();
        let reply = replies.recv().await.unwrap();
        assert!(reply.success);
        assert!(!reply.has_more);
        assert_eq!(reply.payload, vec![9, 9, 9]);

        let _ = std::fs::remove_file(&socket_path);
    }

    #[tokio::test]
    async fn binding_an_unknown_service_fails() {
        let socket_path = format!("/tmp/tracing-service-client-test-unknown-{}.sock", std::process::id());
        let _ = std::fs::remove_file(&socket_path);

        let host = Arc::new(Host::new(SocketName(socket_path.clone())));
        let host_for_task = host.clone();
        tokio::spawn(async move {
            let _ = host_for_task.serve(Arc::new(|_id| {})).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = Client::connect(&socket_path).await.unwrap();
        let result = client.bind_service("NoSuchService").await;
        assert!(result.is_err());

        let _ = std::fs::remove_file(&socket_path);
    }
}
