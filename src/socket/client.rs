//! User-facing TCP client handle.
//!
//! A [`ClientHandle`] is a cheap, copyable reference to at most one
//! [`ConnectionContext`]. Cloning a handle shares the context and bumps its
//! reference count; the connection is released when the last handle (or other
//! [`ContextRef`]) lets go of it.
//!
//! # Connect protocol
//!
//! ```text
//! Idle --connect--> Connecting --connected cb--> Connected
//!                        |                           |
//!                        +--error cb / stop--> Idle <+-- stop / stop_all
//! ```
//!
//! A blocking connect suspends the calling task until the stack reports the
//! outcome. A non-blocking connect returns [`ConnectOutcome::Pending`] at once;
//! poll [`ClientHandle::connected`] afterwards.

use crate::base::neterror::NetError;
use crate::base::tcpstate::TcpState;
use crate::network::Network;
use crate::socket::bridge;
use crate::socket::context::{ConnectionContext, ContextRef};
use crate::socket::registry::HandleId;
use crate::stack::{ConnectedFn, RawConn, StackStatus};
use std::cell::RefCell;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use tokio::sync::oneshot;

/// Whether `connect` waits for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// Successful result of a connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The handshake completed and the handle holds a context.
    Connected,
    /// Non-blocking connect issued; the outcome arrives later.
    Pending,
}

impl ConnectOutcome {
    /// Arduino-style integer result: 1 connected, -1 pending.
    pub fn code(self) -> i32 {
        match self {
            ConnectOutcome::Connected => 1,
            ConnectOutcome::Pending => -1,
        }
    }

    /// Integer result of a whole connect call; failures map to 0.
    pub fn code_for(result: &Result<ConnectOutcome, NetError>) -> i32 {
        match result {
            Ok(outcome) => outcome.code(),
            Err(_) => 0,
        }
    }
}

/// Where a handle is in the connect protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// An issued connect the stack has not answered yet.
pub(crate) struct PendingConnect {
    pcb: RawConn,
    resume: Option<oneshot::Sender<()>>,
}

impl PendingConnect {
    /// Wake the task suspended in a blocking connect, if there is one.
    pub(crate) fn resume(self) {
        if let Some(resume) = self.resume {
            let _ = resume.send(());
        }
    }
}

/// Per-handle state shared with the registry and the callback bridge.
pub(crate) struct HandleCore {
    id: HandleId,
    default_nodelay: bool,
    context: RefCell<Option<ContextRef>>,
    pending: RefCell<Option<PendingConnect>>,
    last_error: RefCell<Option<NetError>>,
}

impl HandleCore {
    fn new(id: HandleId, context: Option<ContextRef>, default_nodelay: bool) -> Self {
        Self {
            id,
            default_nodelay,
            context: RefCell::new(context),
            pending: RefCell::new(None),
            last_error: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    fn record(&self, err: NetError) -> NetError {
        *self.last_error.borrow_mut() = Some(err.clone());
        err
    }

    /// Wrap a freshly connected raw connection in a context and keep it.
    pub(crate) fn attach(
        &self,
        pcb: RawConn,
        status: StackStatus,
    ) -> Result<PendingConnect, StackStatus> {
        let pending = self.pending.borrow_mut().take();
        let Some(pending) = pending else {
            tracing::debug!(handle = %self.id, conn = %pcb.id(), "stale connect completion");
            pcb.clear_callbacks();
            pcb.abort();
            return Err(StackStatus::Abrt);
        };

        if !status.is_ok() {
            tracing::debug!(handle = %self.id, %status, "connect completed with error");
            pcb.clear_callbacks();
            pcb.abort();
            self.record(NetError::from(status));
            pending.resume();
            return Err(StackStatus::Abrt);
        }

        let ctx = ConnectionContext::new(pcb);
        if self.default_nodelay {
            ctx.set_nodelay(true);
        }
        tracing::debug!(handle = %self.id, remote = ?ctx.remote_addr(), "connected");
        let previous = self.context.replace(Some(ctx));
        drop(previous);
        Ok(pending)
    }

    /// The stack gave up on the pending connect and freed its connection.
    pub(crate) fn fail(&self, status: StackStatus) -> Option<PendingConnect> {
        let pending = self.pending.borrow_mut().take()?;
        tracing::debug!(handle = %self.id, conn = %pending.pcb.id(), %status, "connect failed");
        self.record(NetError::from(status));
        Some(pending)
    }

    /// Cancel a pending connect. A task blocked on it resumes with failure.
    fn abort_pending(&self) -> bool {
        let pending = self.pending.borrow_mut().take();
        let Some(pending) = pending else { return false };
        tracing::debug!(handle = %self.id, conn = %pending.pcb.id(), "cancelling connect");
        pending.pcb.clear_callbacks();
        pending.pcb.abort();
        self.record(NetError::ConnectionAborted);
        true
    }

    /// Drop this handle's reference and any pending connect.
    fn release(&self) {
        let previous = self.context.replace(None);
        drop(previous);
        self.abort_pending();
    }

    /// Abort the shared connection outright, whoever else references it.
    pub(crate) fn force_abort(&self) -> bool {
        let context = self.context.replace(None);
        let had_context = context.is_some();
        if let Some(ctx) = context {
            ctx.abort();
        }
        let had_pending = self.abort_pending();
        had_context || had_pending
    }
}

/// Copyable handle to an outbound (or accepted) TCP connection.
///
/// Handles are created through [`Network::client`] or [`Network::wrap`] and
/// stay registered with their network until dropped.
pub struct ClientHandle {
    core: Rc<HandleCore>,
    network: Network,
}

impl ClientHandle {
    pub(crate) fn new(network: &Network, context: Option<ContextRef>) -> Self {
        let registry = network.registry();
        let core = Rc::new(HandleCore::new(
            registry.next_id(),
            context,
            network.default_nodelay(),
        ));
        registry.register(&core);
        Self { core, network: network.clone() }
    }

    pub fn id(&self) -> HandleId {
        self.core.id
    }

    /// Resolve `host` and connect, suspending until the outcome is known.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        self.connect_ex(host, port, ConnectMode::Blocking).await.map(|_| ())
    }

    /// Connect to a literal address, suspending until the outcome is known.
    pub async fn connect_addr(&self, ip: IpAddr, port: u16) -> Result<(), NetError> {
        let rx = self.begin(ip, port, ConnectMode::Blocking)?;
        self.wait(rx).await.map(|_| ())
    }

    /// Resolve `host` and connect in the given mode.
    pub async fn connect_ex(
        &self,
        host: &str,
        port: u16,
        mode: ConnectMode,
    ) -> Result<ConnectOutcome, NetError> {
        let ip = match self.network.resolve(host).await {
            Ok(ip) => ip,
            Err(err) => {
                // Resolution failure leaves the handle exactly as it was.
                return Err(self.core.record(err));
            }
        };
        match mode {
            ConnectMode::Blocking => {
                let rx = self.begin(ip, port, mode)?;
                self.wait(rx).await
            }
            ConnectMode::NonBlocking => self.start_connect(ip, port),
        }
    }

    /// Issue a non-blocking connect to a literal address.
    pub fn start_connect(&self, ip: IpAddr, port: u16) -> Result<ConnectOutcome, NetError> {
        self.begin(ip, port, ConnectMode::NonBlocking)?;
        Ok(ConnectOutcome::Pending)
    }

    fn begin(
        &self,
        ip: IpAddr,
        port: u16,
        mode: ConnectMode,
    ) -> Result<Option<oneshot::Receiver<()>>, NetError> {
        self.stop();
        *self.core.last_error.borrow_mut() = None;

        let remote = SocketAddr::new(ip, port);
        let stack = self.network.stack();

        // Some stacks return from connect without ever calling the error
        // callback when no interface can reach the destination.
        if stack.route(ip).is_none() {
            tracing::debug!(handle = %self.core.id, %remote, "no route to host");
            return Err(self.core.record(NetError::AddressUnreachable));
        }

        let Some(pcb) = stack.new_connection() else {
            tracing::debug!(handle = %self.core.id, %remote, "out of connection objects");
            return Err(self.core.record(NetError::NoBufferSpace));
        };

        if let Some(local_port) = self.network.next_local_port() {
            pcb.bind_local_port(local_port);
        }

        let arg = Rc::downgrade(&self.core);
        let err_arg = arg.clone();
        pcb.on_error(Box::new(move |status: StackStatus| bridge::error(&err_arg, status)));

        let (resume, rx) = match mode {
            ConnectMode::Blocking => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            ConnectMode::NonBlocking => (None, None),
        };
        let on_connected: ConnectedFn = match mode {
            ConnectMode::Blocking => Box::new(move |pcb: RawConn, status: StackStatus| {
                bridge::connected(&arg, pcb, status)
            }),
            ConnectMode::NonBlocking => Box::new(move |pcb: RawConn, status: StackStatus| {
                bridge::connected_nonblocking(&arg, pcb, status)
            }),
        };

        *self.core.pending.borrow_mut() = Some(PendingConnect { pcb: pcb.clone(), resume });
        if let Err(status) = pcb.connect(remote, on_connected) {
            tracing::debug!(handle = %self.core.id, %remote, %status, "connect rejected");
            self.core.pending.borrow_mut().take();
            pcb.clear_callbacks();
            pcb.abort();
            return Err(self.core.record(NetError::from(status)));
        }

        tracing::debug!(
            handle = %self.core.id,
            conn = %pcb.id(),
            %remote,
            local_port = pcb.local_port(),
            ?mode,
            "connecting"
        );
        Ok(rx)
    }

    async fn wait(&self, rx: Option<oneshot::Receiver<()>>) -> Result<ConnectOutcome, NetError> {
        if let Some(rx) = rx {
            match self.network.connect_timeout() {
                Some(limit) => {
                    if tokio::time::timeout(limit, rx).await.is_err() {
                        tracing::debug!(handle = %self.core.id, ?limit, "connect timed out");
                        self.core.abort_pending();
                        return Err(self.core.record(NetError::ConnectionTimedOut));
                    }
                }
                None => {
                    // A dropped sender means the attempt was cancelled.
                    let _ = rx.await;
                }
            }
        }

        if self.core.context.borrow().is_some() {
            Ok(ConnectOutcome::Connected)
        } else {
            Err(self.last_error().unwrap_or(NetError::ConnectionFailed))
        }
    }

    /// Release this handle's connection reference and cancel any pending
    /// connect. Never blocks.
    pub fn stop(&self) {
        self.core.release();
    }

    /// True while established, and also while unread data remains after the
    /// peer closed, so callers can drain before observing closure.
    pub fn connected(&self) -> bool {
        self.with_context(|ctx| ctx.state() == TcpState::Established || ctx.available() > 0)
            .unwrap_or(false)
    }

    /// TCP state of the connection, `Closed` without one.
    pub fn status(&self) -> TcpState {
        self.with_context(|ctx| ctx.state()).unwrap_or(TcpState::Closed)
    }

    pub fn connect_state(&self) -> ConnectState {
        if self.core.context.borrow().is_some() {
            ConnectState::Connected
        } else if self.core.pending.borrow().is_some() {
            ConnectState::Connecting
        } else {
            ConnectState::Idle
        }
    }

    /// Whether the handle holds a context at all.
    pub fn is_open(&self) -> bool {
        self.core.context.borrow().is_some()
    }

    /// Failure reason of the most recent connect attempt.
    pub fn last_error(&self) -> Option<NetError> {
        self.core.last_error.borrow().clone()
    }

    /// A new counted reference to the shared context.
    pub fn context(&self) -> Option<ContextRef> {
        self.core.context.borrow().clone()
    }

    /// Reference count of the shared context, 0 without one.
    pub fn context_ref_count(&self) -> usize {
        self.with_context(|ctx| ctx.ref_count()).unwrap_or(0)
    }

    pub fn shares_context_with(&self, other: &ClientHandle) -> bool {
        match (&*self.core.context.borrow(), &*other.core.context.borrow()) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    fn with_context<R>(&self, f: impl FnOnce(&ContextRef) -> R) -> Option<R> {
        self.core.context.borrow().as_ref().map(f)
    }

    /// Remote address, unspecified without a connection.
    pub fn remote_ip(&self) -> IpAddr {
        self.with_context(|ctx| ctx.remote_ip())
            .flatten()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn remote_port(&self) -> u16 {
        self.with_context(|ctx| ctx.remote_port()).unwrap_or(0)
    }

    pub fn local_port(&self) -> u16 {
        self.with_context(|ctx| ctx.local_port()).unwrap_or(0)
    }

    pub fn set_nodelay(&self, nodelay: bool) {
        self.with_context(|ctx| ctx.set_nodelay(nodelay));
    }

    pub fn nodelay(&self) -> bool {
        self.with_context(|ctx| ctx.nodelay()).unwrap_or(false)
    }

    /// Stage bytes for sending; 0 without a connection or for empty input.
    pub fn write(&self, data: &[u8]) -> usize {
        self.with_context(|ctx| ctx.write(data)).unwrap_or(0)
    }

    pub fn write_byte(&self, byte: u8) -> usize {
        self.write(&[byte])
    }

    pub fn available(&self) -> usize {
        self.with_context(|ctx| ctx.available()).unwrap_or(0)
    }

    /// Next byte, or `None` when nothing is buffered.
    pub fn read_byte(&self) -> Option<u8> {
        self.with_context(|ctx| ctx.read_byte()).flatten()
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.with_context(|ctx| ctx.read(buf)).unwrap_or(0)
    }

    pub fn peek(&self) -> Option<u8> {
        self.with_context(|ctx| ctx.peek()).flatten()
    }

    /// Wait until everything written has been acknowledged.
    pub async fn flush(&self) {
        if let Some(ctx) = self.context() {
            ctx.flush().await;
        }
    }
}

impl Clone for ClientHandle {
    /// Copy construction: a new registered handle sharing the same context.
    /// A pending connect is not shared.
    fn clone(&self) -> Self {
        Self::new(&self.network, self.context())
    }

    /// Assignment: release our context and share `source`'s instead.
    fn clone_from(&mut self, source: &Self) {
        let previous = self.core.context.replace(source.context());
        drop(previous);
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.network.registry().deregister(self.core.id);
        self.core.release();
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.core.id)
            .field("state", &self.connect_state())
            .field("context", &*self.core.context.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::sim::SimStack;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(ConnectOutcome::Connected.code(), 1);
        assert_eq!(ConnectOutcome::Pending.code(), -1);
        assert_eq!(ConnectOutcome::code_for(&Err(NetError::AddressUnreachable)), 0);
        assert_eq!(ConnectOutcome::code_for(&Ok(ConnectOutcome::Pending)), -1);
    }

    #[test]
    fn test_connect_state_display() {
        assert_eq!(ConnectState::Idle.to_string(), "idle");
        assert_eq!(ConnectState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_empty_handle_is_neutral() {
        let net = Network::new(SimStack::new());
        let client = net.client();
        let mut buf = [0u8; 4];

        assert!(!client.connected());
        assert!(!client.is_open());
        assert_eq!(client.status(), TcpState::Closed);
        assert_eq!(client.connect_state(), ConnectState::Idle);
        assert_eq!(client.write(b"data"), 0);
        assert_eq!(client.write_byte(1), 0);
        assert_eq!(client.available(), 0);
        assert_eq!(client.read_byte(), None);
        assert_eq!(client.read(&mut buf), 0);
        assert_eq!(client.peek(), None);
        assert_eq!(client.remote_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(client.remote_port(), 0);
        assert!(!client.nodelay());
        assert_eq!(client.context_ref_count(), 0);
        client.set_nodelay(true);
        client.stop();
    }

    #[test]
    fn test_handles_register_and_deregister() {
        let net = Network::new(SimStack::new());
        let a = net.client();
        let b = a.clone();
        assert_ne!(a.id(), b.id());
        assert_eq!(net.live_handles(), 2);
        drop(a);
        assert_eq!(net.live_handles(), 1);
        drop(b);
        assert_eq!(net.live_handles(), 0);
    }

    #[test]
    fn test_nonblocking_connect_then_drop_aborts_attempt() {
        let sim = SimStack::new();
        sim.listen("10.0.0.2:80".parse().unwrap());
        let net = Network::new(sim.clone());

        let client = net.client();
        let outcome = client.start_connect("10.0.0.2".parse().unwrap(), 80);
        assert_eq!(outcome, Ok(ConnectOutcome::Pending));
        assert_eq!(client.connect_state(), ConnectState::Connecting);

        drop(client);
        assert_eq!(sim.live_connections(), 0);
        sim.pump();
        assert_eq!(sim.live_connections(), 0);
    }
}
