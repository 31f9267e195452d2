//! # rpc
//!
//! A small request/response messenger over TCP.
//!
//! ## Server Side
//!
//! A [`Service`] is wrapped in a [`ServicePool`] of worker tasks and registered with a
//! [`Messenger`] under its name. Each handler receives an [`InboundCall`] (or, for typed
//! services, a decoded request and an [`RpcContext`]) and must answer it exactly once.
//!
//! ```ignore
//! let messenger = Messenger::new("server", MessengerConfig::default());
//! let pool = ServicePool::new(DEFAULT_QUEUE_LENGTH, 4, Arc::new(MyService::new()));
//!
//! messenger.listen_address("127.0.0.1:0".parse()?).await?;
//! messenger.register_service("pkg.MyService", pool)?;
//! messenger.start_acceptor()?;
//! ```
//!
//! ## Client Side
//!
//! A [`Proxy`] calls one service at one address. The [`RpcController`] carries the
//! per-call timeout and, after the call, the response's sidecars.
//!
//! ```ignore
//! let proxy = Proxy::new(messenger, server_addr, "pkg.MyService");
//! let mut controller = RpcController::with_timeout(Duration::from_secs(10));
//!
//! let response: MyResponse = proxy.sync_request("Method", &request, &mut controller).await?;
//! let first = controller.sidecar(0)?;
//! ```
//!
//! ## Wire Format
//!
//! Every frame is a big-endian `u32` length followed by a protobuf message. A client
//! opens with a `ConnectionHeader` carrying its credentials, then sends `RequestFrame`s
//! and reads `ResponseFrame`s matched by call id.

pub(crate) mod connection;
pub(crate) mod context;
mod error;
mod proxy;
mod service;
pub(crate) mod wire;

pub mod messenger;

pub use connection::{ConnectionHandle, ConnectionId};
pub use context::{InboundCall, Responder, RpcContext, UserCredentials};
pub use error::{ApplicationError, ErrorKind, RpcError};
pub use messenger::{Messenger, MessengerConfig, MessengerRef, SIDECAR_HEADROOM};
pub use proxy::{Proxy, RpcController};
pub use service::{DEFAULT_QUEUE_LENGTH, MethodHandler, MethodTable, Service, ServicePool};
pub use wire::{ErrorCode, UserCredentialsPb};
