//! Typed request/response calls and sequenced, resumable subscription
//! streams over pluggable carriers.
//!
//! A client sends procedure calls and opens subscriptions through a
//! [`Transport`]; the server side dispatches them to a [`Router`] through a
//! per-connection [`ServerEndpoint`]. Subscription updates carry server
//! sequence numbers, so a consumer can detect delivery gaps and ask for a
//! replay from the server's [`UpdateHistory`]. Three carriers ship in
//! [`transport`]: an in-process channel, WebSocket, and Unix-socket IPC.

pub mod connection;
pub mod history;
pub mod registry;
pub mod server;
pub mod subscription;
pub mod transport;

pub use wavelink_proto as proto;

pub use connection::{ChangeHandler, ConnectionState, DisconnectHandler, HandlerGuard};
pub use history::{UpdateHistory, DEFAULT_HISTORY_LIMIT};
pub use registry::{Cleanup, SubscriptionRegistry};
pub use server::{Publisher, Router, ServerEndpoint, ServerWire};
pub use subscription::{Subscription, SubscriptionCanceller, SubscriptionItem, SubscriptionUpdate};
pub use transport::{
    AckHandler, AckReceipt, ClientTransport, LinkStats, ProcedureCall, SubscribeRequest,
    Transport, TransportError, TransportKind,
};
