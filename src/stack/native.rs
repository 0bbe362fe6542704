//! Stack backed by operating system sockets.
//!
//! Each connection is driven by one task spawned with
//! [`tokio::task::spawn_local`], so connects must be issued from inside a
//! [`tokio::task::LocalSet`]. The task owns the socket and turns readiness
//! into the same callbacks an embedded stack would fire.
//!
//! Bytes count as acknowledged once the kernel accepted them.

use super::{
    ConnId, ConnectedFn, ErrorFn, InterfaceId, RawConn, RawConnection, RecvFn, SentFn,
    StackStatus, TcpStack,
};
use crate::base::tcpstate::TcpState;
use bytes::{Buf, Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;

/// Bytes the send path buffers ahead of the kernel.
pub const SEND_BUFFER: usize = 8 * 1460;

/// Received bytes the application may leave unconsumed before reading pauses.
pub const RECV_WINDOW: usize = 4 * 1460;

const READ_CHUNK: usize = 2048;

/// Factory for [`NativeConnection`]s.
#[derive(Debug, Default, Clone)]
pub struct NativeStack {
    next_id: Rc<Cell<u64>>,
}

impl NativeStack {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TcpStack for NativeStack {
    /// A connected UDP socket asks the kernel for a route without sending
    /// anything.
    fn route(&self, dest: IpAddr) -> Option<InterfaceId> {
        if dest.is_unspecified() {
            return None;
        }
        let bind: IpAddr = match dest {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let probe = UdpSocket::bind(SocketAddr::new(bind, 0)).ok()?;
        match probe.connect(SocketAddr::new(dest, 9)) {
            Ok(()) => Some(InterfaceId(0)),
            Err(e) => {
                tracing::trace!(%dest, error = %e, "route probe failed");
                None
            }
        }
    }

    fn new_connection(&self) -> Option<RawConn> {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        Some(NativeConnection::new(ConnId(id)))
    }
}

struct NativeState {
    state: TcpState,
    remote: Option<SocketAddr>,
    local_port: u16,
    nodelay: bool,
    tx: BytesMut,
    rx_outstanding: usize,
    released: bool,
    aborted: bool,
    epoch: u64,
    connected: Option<ConnectedFn>,
    error: Option<ErrorFn>,
    recv: Option<RecvFn>,
    sent: Option<SentFn>,
}

impl NativeState {
    fn drop_callbacks(&mut self) {
        self.epoch += 1;
        self.connected = None;
        self.error = None;
        self.recv = None;
        self.sent = None;
    }
}

/// A connection object of [`NativeStack`].
pub struct NativeConnection {
    id: ConnId,
    me: Weak<NativeConnection>,
    st: RefCell<NativeState>,
    wake: Notify,
}

impl NativeConnection {
    fn new(id: ConnId) -> Rc<Self> {
        Rc::new_cyclic(|me| NativeConnection {
            id,
            me: me.clone(),
            st: RefCell::new(NativeState {
                state: TcpState::Closed,
                remote: None,
                local_port: 0,
                nodelay: false,
                tx: BytesMut::new(),
                rx_outstanding: 0,
                released: false,
                aborted: false,
                epoch: 0,
                connected: None,
                error: None,
                recv: None,
                sent: None,
            }),
            wake: Notify::new(),
        })
    }

    fn socket_for(remote: SocketAddr, local_port: u16) -> io::Result<TcpSocket> {
        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if local_port != 0 {
            let bind: IpAddr = match remote {
                SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(bind, local_port))?;
        }
        Ok(socket)
    }

    fn released(&self) -> bool {
        self.st.borrow().released
    }

    fn can_send(state: TcpState) -> bool {
        matches!(state, TcpState::Established | TcpState::CloseWait)
    }

    /// The stack destroys the connection; only the error callback fires.
    fn fail(&self, status: StackStatus) {
        let callback = {
            let mut st = self.st.borrow_mut();
            if st.released {
                return;
            }
            st.state = TcpState::Closed;
            st.released = true;
            let callback = st.error.take();
            st.drop_callbacks();
            callback
        };
        tracing::debug!(conn = %self.id, %status, "connection failed");
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn fire_connected(&self) -> StackStatus {
        let callback = self.st.borrow_mut().connected.take();
        let Some(callback) = callback else { return StackStatus::Ok };
        let Some(me) = self.me.upgrade() else { return StackStatus::Abrt };
        let raw: RawConn = me;
        callback(raw, StackStatus::Ok)
    }

    fn fire_recv(&self, data: Option<Bytes>) -> StackStatus {
        let (callback, epoch) = {
            let mut st = self.st.borrow_mut();
            if let Some(bytes) = &data {
                st.rx_outstanding += bytes.len();
            }
            (st.recv.take(), st.epoch)
        };
        let Some(mut callback) = callback else {
            tracing::trace!(conn = %self.id, "no receiver, dropping data");
            return StackStatus::Ok;
        };
        let status = callback(data);
        let mut st = self.st.borrow_mut();
        if st.epoch == epoch && st.recv.is_none() {
            st.recv = Some(callback);
        }
        status
    }

    fn fire_sent(&self, len: usize) -> StackStatus {
        let (callback, epoch) = {
            let mut st = self.st.borrow_mut();
            (st.sent.take(), st.epoch)
        };
        let Some(mut callback) = callback else { return StackStatus::Ok };
        let status = callback(len);
        let mut st = self.st.borrow_mut();
        if st.epoch == epoch && st.sent.is_none() {
            st.sent = Some(callback);
        }
        status
    }

    /// Connect, then pump data between the socket and the callbacks until the
    /// connection is released.
    async fn drive(self: Rc<Self>, socket: TcpSocket, remote: SocketAddr) {
        let connecting = socket.connect(remote);
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                _ = self.wake.notified() => {
                    if self.released() {
                        tracing::trace!(conn = %self.id, "connect cancelled");
                        return;
                    }
                }
            }
        };

        let mut stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(StackStatus::from_io(&e));
                return;
            }
        };
        if self.released() {
            return;
        }

        {
            let mut st = self.st.borrow_mut();
            st.state = TcpState::Established;
            if let Ok(local) = stream.local_addr() {
                st.local_port = local.port();
            }
            if st.nodelay {
                let _ = stream.set_nodelay(true);
            }
        }
        if !self.fire_connected().is_ok() {
            return;
        }

        let mut eof = false;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            let (released, aborted, nodelay, want_write, can_read) = {
                let st = self.st.borrow();
                (
                    st.released,
                    st.aborted,
                    st.nodelay,
                    !st.tx.is_empty(),
                    !eof && st.rx_outstanding < RECV_WINDOW,
                )
            };
            if released {
                if aborted {
                    let _ = stream.set_linger(Some(Duration::ZERO));
                } else {
                    self.finish(&mut stream).await;
                }
                return;
            }
            if stream.nodelay().map(|on| on != nodelay).unwrap_or(false) {
                let _ = stream.set_nodelay(nodelay);
            }

            tokio::select! {
                ready = stream.readable(), if can_read => {
                    if let Err(e) = ready {
                        self.fail(StackStatus::from_io(&e));
                        return;
                    }
                    buf.reserve(READ_CHUNK);
                    match stream.try_read_buf(&mut buf) {
                        Ok(0) => {
                            eof = true;
                            {
                                let mut st = self.st.borrow_mut();
                                if st.state == TcpState::Established {
                                    st.state = TcpState::CloseWait;
                                }
                            }
                            tracing::debug!(conn = %self.id, "peer closed");
                            self.fire_recv(None);
                        }
                        Ok(_) => {
                            let data = buf.split().freeze();
                            self.fire_recv(Some(data));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            self.fail(StackStatus::from_io(&e));
                            return;
                        }
                    }
                }
                ready = stream.writable(), if want_write => {
                    if let Err(e) = ready {
                        self.fail(StackStatus::from_io(&e));
                        return;
                    }
                    let written = {
                        let st = self.st.borrow();
                        stream.try_write(&st.tx)
                    };
                    match written {
                        Ok(n) => {
                            self.st.borrow_mut().tx.advance(n);
                            self.fire_sent(n);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            self.fail(StackStatus::from_io(&e));
                            return;
                        }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Graceful close: flush what is still buffered, then send FIN.
    async fn finish(&self, stream: &mut TcpStream) {
        let pending = self.st.borrow_mut().tx.split().freeze();
        if !pending.is_empty() {
            if let Err(e) = stream.write_all(&pending).await {
                tracing::debug!(conn = %self.id, error = %e, "flush on close failed");
                return;
            }
        }
        if let Err(e) = stream.shutdown().await {
            tracing::trace!(conn = %self.id, error = %e, "shutdown failed");
        }
    }
}

impl RawConnection for NativeConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn state(&self) -> TcpState {
        self.st.borrow().state
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.st.borrow().remote
    }

    fn local_port(&self) -> u16 {
        self.st.borrow().local_port
    }

    fn bind_local_port(&self, port: u16) {
        let mut st = self.st.borrow_mut();
        if st.state == TcpState::Closed && st.remote.is_none() {
            st.local_port = port;
        }
    }

    fn set_nodelay(&self, nodelay: bool) {
        self.st.borrow_mut().nodelay = nodelay;
        self.wake.notify_one();
    }

    fn nodelay(&self) -> bool {
        self.st.borrow().nodelay
    }

    fn send_capacity(&self) -> usize {
        let st = self.st.borrow();
        if !Self::can_send(st.state) {
            return 0;
        }
        SEND_BUFFER.saturating_sub(st.tx.len())
    }

    fn send(&self, data: &[u8]) -> usize {
        let accepted = {
            let mut st = self.st.borrow_mut();
            if !Self::can_send(st.state) {
                return 0;
            }
            let accepted = data.len().min(SEND_BUFFER.saturating_sub(st.tx.len()));
            st.tx.extend_from_slice(&data[..accepted]);
            accepted
        };
        if accepted > 0 {
            self.wake.notify_one();
        }
        accepted
    }

    fn unacked(&self) -> usize {
        self.st.borrow().tx.len()
    }

    fn recved(&self, len: usize) {
        let mut st = self.st.borrow_mut();
        let was_full = st.rx_outstanding >= RECV_WINDOW;
        st.rx_outstanding = st.rx_outstanding.saturating_sub(len);
        if was_full && st.rx_outstanding < RECV_WINDOW {
            self.wake.notify_one();
        }
    }

    fn on_error(&self, callback: ErrorFn) {
        self.st.borrow_mut().error = Some(callback);
    }

    fn on_recv(&self, callback: RecvFn) {
        self.st.borrow_mut().recv = Some(callback);
    }

    fn on_sent(&self, callback: SentFn) {
        self.st.borrow_mut().sent = Some(callback);
    }

    fn clear_callbacks(&self) {
        self.st.borrow_mut().drop_callbacks();
    }

    /// Must be called from within a [`tokio::task::LocalSet`].
    fn connect(&self, remote: SocketAddr, connected: ConnectedFn) -> Result<(), StackStatus> {
        let me = self.me.upgrade().ok_or(StackStatus::Clsd)?;
        let local_port = {
            let st = self.st.borrow();
            if st.released {
                return Err(StackStatus::Clsd);
            }
            if st.state != TcpState::Closed || st.remote.is_some() {
                return Err(StackStatus::IsConn);
            }
            st.local_port
        };

        let socket = Self::socket_for(remote, local_port).map_err(|e| {
            tracing::debug!(conn = %self.id, %remote, local_port, error = %e, "socket setup failed");
            StackStatus::from_io(&e)
        })?;

        {
            let mut st = self.st.borrow_mut();
            st.remote = Some(remote);
            st.state = TcpState::SynSent;
            st.connected = Some(connected);
        }
        tokio::task::spawn_local(me.drive(socket, remote));
        Ok(())
    }

    fn close(&self) -> Result<(), StackStatus> {
        {
            let mut st = self.st.borrow_mut();
            if st.released {
                return Err(StackStatus::Clsd);
            }
            st.state = match st.state {
                TcpState::CloseWait => TcpState::LastAck,
                TcpState::Established => TcpState::FinWait1,
                _ => TcpState::Closed,
            };
            st.released = true;
            st.drop_callbacks();
        }
        self.wake.notify_one();
        Ok(())
    }

    fn abort(&self) {
        {
            let mut st = self.st.borrow_mut();
            if st.released {
                return;
            }
            st.state = TcpState::Closed;
            st.released = true;
            st.aborted = true;
            st.tx.clear();
            st.drop_callbacks();
        }
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_loopback() {
        let stack = NativeStack::new();
        assert!(stack.route(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_some());
        assert!(stack.route(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let stack = NativeStack::new();
        let a = stack.new_connection().unwrap();
        let b = stack.new_connection().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), TcpState::Closed);
    }

    #[test]
    fn test_send_refused_before_connect() {
        let stack = NativeStack::new();
        let conn = stack.new_connection().unwrap();
        assert_eq!(conn.send(b"early"), 0);
        assert_eq!(conn.send_capacity(), 0);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let stack = NativeStack::new();
        let conn = stack.new_connection().unwrap();
        conn.abort();
        conn.abort();
        assert_eq!(conn.close(), Err(StackStatus::Clsd));
    }
}
