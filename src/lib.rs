//! # coopnet
//!
//! Reference-counted TCP client handles over a callback-driven network stack.
//!
//! The stack (an embedded stack such as lwIP, the in-memory [`stack::sim`]
//! stack, or real sockets through [`stack::native`]) reports progress through
//! callbacks on a single event loop thread. `coopnet` turns that into a small
//! Arduino-flavored client API:
//!
//! - **Shared connections**: copies of a [`ClientHandle`] share one
//!   connection context, released when the last copy lets go
//! - **Blocking or non-blocking connect**: a blocking connect suspends only
//!   the calling task until the stack answers
//! - **Bulk teardown**: every live handle is registered, so one call aborts
//!   every connection after the network changes under them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coopnet::Network;
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let net = Network::builder().build();
//!     let client = net.client();
//!     client.connect("192.168.4.1", 80).await?;
//!     client.write(b"ping\n");
//!     client.flush().await;
//!     Ok::<_, coopnet::NetError>(())
//! }).await?;
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes and TCP states
//! - [`config`] - JSON configuration
//! - [`dns`] - Host name resolution
//! - [`network`] - Entry point owning stack, resolver and registry
//! - [`socket`] - Connection contexts, client handles and the registry
//! - [`stack`] - The network stack seam and its implementations

pub mod base;
pub mod config;
pub mod dns;
pub mod network;
pub mod socket;
pub mod stack;

pub use base::neterror::NetError;
pub use base::tcpstate::TcpState;
pub use config::{ConfigError, NetworkConfig, ResolverKind};
pub use network::{Network, NetworkBuilder};
pub use socket::{ClientHandle, ConnectMode, ConnectOutcome, ConnectState, ContextRef};
