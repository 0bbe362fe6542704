//! Reference-counted owner of one raw connection.
//!
//! A [`ConnectionContext`] is the only thing that ever closes or aborts its
//! [`RawConn`]. Handles share it through [`ContextRef`]; the connection is
//! released exactly once, when the last `ContextRef` is dropped.

use crate::base::neterror::NetError;
use crate::base::tcpstate::TcpState;
use crate::stack::{ConnId, RawConn, StackStatus};
use bytes::{Buf, Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::rc::{Rc, Weak};
use tokio::sync::Notify;

pub struct ConnectionContext {
    pcb: RefCell<Option<RawConn>>,
    rx: RefCell<BytesMut>,
    peer_closed: Cell<bool>,
    last_error: RefCell<Option<NetError>>,
    acked: Notify,
}

impl ConnectionContext {
    /// Take ownership of an established raw connection.
    ///
    /// Registers the receive, sent and error callbacks on `pcb`, replacing
    /// whatever the connect path had installed.
    pub fn new(pcb: RawConn) -> ContextRef {
        let ctx = Rc::new_cyclic(|weak: &Weak<ConnectionContext>| {
            let on_recv = weak.clone();
            pcb.on_recv(Box::new(move |data: Option<Bytes>| match on_recv.upgrade() {
                Some(ctx) => ctx.recv(data),
                None => StackStatus::Ok,
            }));

            let on_sent = weak.clone();
            pcb.on_sent(Box::new(move |len: usize| {
                if let Some(ctx) = on_sent.upgrade() {
                    ctx.sent(len);
                }
                StackStatus::Ok
            }));

            let on_error = weak.clone();
            pcb.on_error(Box::new(move |status: StackStatus| {
                if let Some(ctx) = on_error.upgrade() {
                    ctx.error(status);
                }
            }));

            ConnectionContext {
                pcb: RefCell::new(Some(pcb)),
                rx: RefCell::new(BytesMut::new()),
                peer_closed: Cell::new(false),
                last_error: RefCell::new(None),
                acked: Notify::new(),
            }
        });
        tracing::trace!(conn = ?ctx.id(), "connection context created");
        ContextRef(ctx)
    }

    fn pcb(&self) -> Option<RawConn> {
        self.pcb.borrow().clone()
    }

    fn recv(&self, data: Option<Bytes>) -> StackStatus {
        match data {
            Some(bytes) => {
                tracing::trace!(conn = ?self.id(), len = bytes.len(), "received");
                self.rx.borrow_mut().extend_from_slice(&bytes);
            }
            None => {
                tracing::debug!(conn = ?self.id(), "peer closed");
                self.peer_closed.set(true);
                self.acked.notify_waiters();
            }
        }
        StackStatus::Ok
    }

    fn sent(&self, len: usize) {
        tracing::trace!(conn = ?self.id(), len, "acknowledged");
        self.acked.notify_waiters();
    }

    fn error(&self, status: StackStatus) {
        tracing::debug!(conn = ?self.id(), %status, "connection error");
        // The stack has already freed the connection; nothing left to release.
        self.pcb.borrow_mut().take();
        *self.last_error.borrow_mut() = Some(NetError::from(status));
        self.acked.notify_waiters();
    }

    pub fn id(&self) -> Option<ConnId> {
        self.pcb.borrow().as_ref().map(|pcb| pcb.id())
    }

    /// Whether the raw connection is still held (not aborted, not errored).
    pub fn has_connection(&self) -> bool {
        self.pcb.borrow().is_some()
    }

    /// Whether [`abort`](Self::abort) tore the connection down.
    pub fn is_aborted(&self) -> bool {
        matches!(*self.last_error.borrow(), Some(NetError::ConnectionAborted))
    }

    /// Stage bytes for sending. Returns how many the stack accepted, which
    /// is less than `data.len()` when the send window is full.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let Some(pcb) = self.pcb() else { return 0 };
        let accepted = pcb.send(data);
        tracing::trace!(conn = %pcb.id(), requested = data.len(), accepted, "write");
        accepted
    }

    /// Bytes readable without waiting.
    pub fn available(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn read_byte(&self) -> Option<u8> {
        let byte = {
            let mut rx = self.rx.borrow_mut();
            if rx.is_empty() {
                return None;
            }
            rx.get_u8()
        };
        self.consumed(1);
        Some(byte)
    }

    /// Move up to `buf.len()` buffered bytes into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let len = {
            let mut rx = self.rx.borrow_mut();
            let len = buf.len().min(rx.len());
            rx.copy_to_slice(&mut buf[..len]);
            len
        };
        self.consumed(len);
        len
    }

    pub fn peek(&self) -> Option<u8> {
        self.rx.borrow().first().copied()
    }

    /// Copy up to `buf.len()` buffered bytes without consuming them.
    pub fn peek_bytes(&self, buf: &mut [u8]) -> usize {
        let rx = self.rx.borrow();
        let len = buf.len().min(rx.len());
        buf[..len].copy_from_slice(&rx[..len]);
        len
    }

    fn consumed(&self, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(pcb) = self.pcb() {
            pcb.recved(len);
        }
    }

    /// Wait until the peer has acknowledged everything written so far, or
    /// the connection stops being established.
    pub async fn flush(&self) {
        loop {
            let notified = self.acked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pcb() {
                Some(pcb) if pcb.state() == TcpState::Established && pcb.unacked() > 0 => {}
                _ => return,
            }
            notified.await;
        }
    }

    pub fn state(&self) -> TcpState {
        self.pcb().map(|pcb| pcb.state()).unwrap_or(TcpState::Closed)
    }

    /// True once the peer has sent FIN.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed.get()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.pcb().and_then(|pcb| pcb.remote_addr())
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr().map(|addr| addr.ip())
    }

    /// Remote port, or 0 without a connection.
    pub fn remote_port(&self) -> u16 {
        self.remote_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    pub fn local_port(&self) -> u16 {
        self.pcb().map(|pcb| pcb.local_port()).unwrap_or(0)
    }

    /// Disable (true) or enable (false) coalescing of small writes.
    pub fn set_nodelay(&self, nodelay: bool) {
        if let Some(pcb) = self.pcb() {
            pcb.set_nodelay(nodelay);
        }
    }

    pub fn nodelay(&self) -> bool {
        self.pcb().map(|pcb| pcb.nodelay()).unwrap_or(false)
    }

    /// The transport error that destroyed the connection, if any.
    pub fn last_error(&self) -> Option<NetError> {
        self.last_error.borrow().clone()
    }

    /// Forcibly terminate the connection without a graceful shutdown.
    pub fn abort(&self) {
        let Some(pcb) = self.pcb.borrow_mut().take() else { return };
        tracing::debug!(conn = %pcb.id(), "aborting connection");
        pcb.clear_callbacks();
        pcb.abort();
        *self.last_error.borrow_mut() = Some(NetError::ConnectionAborted);
        self.acked.notify_waiters();
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        let Some(pcb) = self.pcb.get_mut().take() else { return };
        pcb.clear_callbacks();
        let state = pcb.state();
        if state.is_synchronized() {
            tracing::debug!(conn = %pcb.id(), %state, "closing connection");
            if let Err(status) = pcb.close() {
                tracing::debug!(conn = %pcb.id(), %status, "close failed, aborting");
                pcb.abort();
            }
        } else {
            tracing::debug!(conn = %pcb.id(), %state, "releasing unestablished connection");
            pcb.abort();
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("conn", &self.id())
            .field("state", &self.state())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// One counted reference to a [`ConnectionContext`].
///
/// Cloning is `ref()`, dropping is `unref()`. The count is not atomic: a
/// context lives on a single event loop.
#[derive(Clone)]
pub struct ContextRef(Rc<ConnectionContext>);

impl ContextRef {
    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &ContextRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ContextRef {
    type Target = ConnectionContext;

    fn deref(&self) -> &ConnectionContext {
        &self.0
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("refs", &self.ref_count())
            .field("context", &*self.0)
            .finish()
    }
}
