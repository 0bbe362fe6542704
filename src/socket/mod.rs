//! Client connection handles and the state they share.
//!
//! - [`context`]: Per-connection state (receive buffer, acknowledgement wait)
//! - [`client`]: Copyable [`ClientHandle`](client::ClientHandle) and the connect protocol
//! - [`registry`]: Membership set used for bulk teardown

mod bridge;
pub mod client;
pub mod context;
pub mod registry;

pub use client::{ClientHandle, ConnectMode, ConnectOutcome, ConnectState};
pub use context::{ConnectionContext, ContextRef};
pub use registry::{HandleId, HandleRegistry};
