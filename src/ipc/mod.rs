//! # IPC Fabric
//!
//! The stream-socket transport binding producers and consumers to the
//! tracing service (§4.A): length-prefixed framing (`codec`) carrying a
//! self-describing `Frame` (`frame`), a connecting `Client` and an
//! accepting `Host`, and a `Service` trait services bind under.

pub mod client;
pub mod codec;
pub mod frame;
pub mod host;
pub mod service;

pub use client::{BoundService, Client, InvokeReply};
pub use codec::{read_frame, write_frame, MAX_FRAME_PAYLOAD_LEN};
pub use frame::{Frame, FrameKind, MethodDescriptor};
pub use host::{DisconnectHandler, Host, SocketName};
pub use service::{MethodReply, ReplySink, Service, ServiceRegistry};
