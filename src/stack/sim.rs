//! Deterministic in-memory TCP stack.
//!
//! `SimStack` behaves like a small callback-driven stack without touching the
//! operating system. Nothing happens on its own: connect attempts queue an
//! event that is resolved by the next [`SimStack::pump`], which is what lets
//! tests observe the `Connecting` state and drive the event loop by hand.
//!
//! The remote side of every connection is controlled through a [`SimPeer`].
//!
//! ```rust,ignore
//! let sim = SimStack::new();
//! sim.listen("10.0.0.2:80".parse()?);
//! let net = Network::new(sim.clone());
//! let client = net.client();
//! let (res, _) = tokio::join!(client.connect("10.0.0.2", 80), async {
//!     tokio::task::yield_now().await;
//!     sim.pump();
//! });
//! ```

use super::{
    ConnId, ConnectedFn, ErrorFn, InterfaceId, RawConn, RawConnection, RecvFn, SentFn,
    StackStatus, TcpStack,
};
use crate::base::tcpstate::TcpState;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

/// lwIP's default `TCP_SND_BUF` (two full-size segments).
pub const DEFAULT_SEND_WINDOW: usize = 2 * 1460;

const EPHEMERAL_PORT_START: u16 = 0xc000;

/// Torn-down connections kept around for inspection through [`SimPeer`].
const RETIRED_HISTORY: usize = 64;

/// How a remote endpoint answers a SYN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Completes the handshake.
    Listening,
    /// Answers with RST.
    Refusing,
    /// Never answers; the attempt stays in `SYN_SENT`.
    Silent,
}

/// Why a simulated connection stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Released through `close()`.
    Closed,
    /// Released through `abort()`.
    Aborted,
    /// Destroyed by the stack after signalling an error.
    Errored(StackStatus),
}

enum SimEvent {
    Handshake(ConnId),
}

struct SimState {
    next_id: u64,
    next_ephemeral: u16,
    link_up: bool,
    unreachable: HashSet<IpAddr>,
    endpoints: HashMap<SocketAddr, Endpoint>,
    default_endpoint: Endpoint,
    live: BTreeMap<ConnId, Rc<SimConnection>>,
    retired: VecDeque<Rc<SimConnection>>,
    last: Option<Rc<SimConnection>>,
    created: usize,
    queue: VecDeque<SimEvent>,
    send_window: usize,
    auto_ack: bool,
    max_connections: Option<usize>,
}

struct SimInner {
    state: RefCell<SimState>,
}

/// Cheaply cloneable handle to one simulated stack.
#[derive(Clone)]
pub struct SimStack {
    inner: Rc<SimInner>,
}

impl Default for SimStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("SimStack")
            .field("link_up", &st.link_up)
            .field("live", &st.live.len())
            .field("queued", &st.queue.len())
            .finish_non_exhaustive()
    }
}

impl SimStack {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SimInner {
                state: RefCell::new(SimState {
                    next_id: 1,
                    next_ephemeral: EPHEMERAL_PORT_START,
                    link_up: true,
                    unreachable: HashSet::new(),
                    endpoints: HashMap::new(),
                    default_endpoint: Endpoint::Refusing,
                    live: BTreeMap::new(),
                    retired: VecDeque::new(),
                    last: None,
                    created: 0,
                    queue: VecDeque::new(),
                    send_window: DEFAULT_SEND_WINDOW,
                    auto_ack: false,
                    max_connections: None,
                }),
            }),
        }
    }

    /// Bring the only interface up or down. With the link down nothing routes.
    pub fn set_link_up(&self, up: bool) {
        self.inner.state.borrow_mut().link_up = up;
    }

    /// Make a single destination unroutable.
    pub fn set_unreachable(&self, ip: IpAddr) {
        self.inner.state.borrow_mut().unreachable.insert(ip);
    }

    pub fn listen(&self, addr: SocketAddr) {
        self.set_endpoint(addr, Endpoint::Listening);
    }

    pub fn refuse(&self, addr: SocketAddr) {
        self.set_endpoint(addr, Endpoint::Refusing);
    }

    pub fn blackhole(&self, addr: SocketAddr) {
        self.set_endpoint(addr, Endpoint::Silent);
    }

    pub fn set_endpoint(&self, addr: SocketAddr, endpoint: Endpoint) {
        self.inner.state.borrow_mut().endpoints.insert(addr, endpoint);
    }

    /// Behavior of destinations without an explicit endpoint. Defaults to
    /// [`Endpoint::Refusing`].
    pub fn set_default_endpoint(&self, endpoint: Endpoint) {
        self.inner.state.borrow_mut().default_endpoint = endpoint;
    }

    /// Send window for connections allocated from now on.
    pub fn set_send_window(&self, bytes: usize) {
        self.inner.state.borrow_mut().send_window = bytes;
    }

    /// Acknowledge all outstanding data on every `pump()`.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.state.borrow_mut().auto_ack = enabled;
    }

    /// Cap on simultaneously live connections; allocation fails beyond it.
    pub fn set_max_connections(&self, max: Option<usize>) {
        self.inner.state.borrow_mut().max_connections = max;
    }

    /// Run every queued event, firing callbacks. Returns how many events ran.
    pub fn pump(&self) -> usize {
        let mut processed = 0;
        loop {
            let event = self.inner.state.borrow_mut().queue.pop_front();
            let Some(event) = event else { break };
            processed += 1;
            match event {
                SimEvent::Handshake(id) => self.handshake(id),
            }
        }

        let auto_ack = self.inner.state.borrow().auto_ack;
        if auto_ack {
            let live: Vec<_> = self.inner.state.borrow().live.values().cloned().collect();
            for conn in live {
                SimPeer { conn }.ack_all();
            }
        }
        processed
    }

    fn handshake(&self, id: ConnId) {
        let conn = self.inner.state.borrow().live.get(&id).cloned();
        let Some(conn) = conn else {
            // Aborted before the SYN was answered.
            return;
        };
        let Some(remote) = conn.remote_addr() else { return };
        let endpoint = {
            let st = self.inner.state.borrow();
            st.endpoints.get(&remote).copied().unwrap_or(st.default_endpoint)
        };

        match endpoint {
            Endpoint::Listening => {
                let callback = {
                    let mut st = conn.st.borrow_mut();
                    st.state = TcpState::Established;
                    st.connected.take()
                };
                if let Some(callback) = callback {
                    let raw: RawConn = conn.clone();
                    let status = callback(raw, StackStatus::Ok);
                    if !status.is_ok() && conn.teardown().is_none() {
                        conn.abort();
                    }
                }
            }
            Endpoint::Refusing => conn.fail(StackStatus::Rst),
            Endpoint::Silent => {}
        }
    }

    /// Create an already-established connection, as a listener would after
    /// accepting `remote`.
    pub fn inbound(&self, remote: SocketAddr, local_port: u16) -> RawConn {
        let conn = self.allocate();
        {
            let mut st = conn.st.borrow_mut();
            st.state = TcpState::Established;
            st.remote = Some(remote);
            st.local_port = local_port;
        }
        conn
    }

    fn allocate(&self) -> Rc<SimConnection> {
        let mut st = self.inner.state.borrow_mut();
        let id = ConnId(st.next_id);
        st.next_id += 1;
        let conn = Rc::new(SimConnection {
            id,
            stack: Rc::downgrade(&self.inner),
            st: RefCell::new(ConnState::new(st.send_window)),
        });
        st.live.insert(id, conn.clone());
        st.last = Some(conn.clone());
        st.created += 1;
        conn
    }

    /// Connections allocated and not yet closed, aborted or errored.
    pub fn live_connections(&self) -> usize {
        self.inner.state.borrow().live.len()
    }

    /// Every connection ever allocated.
    pub fn created_connections(&self) -> usize {
        self.inner.state.borrow().created
    }

    pub fn pending_events(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Remote-side controls for a live or recently torn-down connection.
    pub fn peer(&self, id: ConnId) -> Option<SimPeer> {
        let st = self.inner.state.borrow();
        let conn = match st.live.get(&id) {
            Some(conn) => Some(conn),
            None => st.retired.iter().find(|c| c.id == id),
        };
        conn.map(|conn| SimPeer { conn: conn.clone() })
    }

    /// The most recently allocated connection.
    pub fn last_peer(&self) -> Option<SimPeer> {
        self.inner.state.borrow().last.as_ref().map(|conn| SimPeer { conn: conn.clone() })
    }
}

impl TcpStack for SimStack {
    fn route(&self, dest: IpAddr) -> Option<InterfaceId> {
        let st = self.inner.state.borrow();
        if !st.link_up || st.unreachable.contains(&dest) || dest.is_unspecified() {
            return None;
        }
        Some(InterfaceId(0))
    }

    fn new_connection(&self) -> Option<RawConn> {
        {
            let st = self.inner.state.borrow();
            if let Some(max) = st.max_connections {
                if st.live.len() >= max {
                    tracing::debug!(max, "sim stack out of connection objects");
                    return None;
                }
            }
        }
        Some(self.allocate())
    }
}

struct ConnState {
    state: TcpState,
    remote: Option<SocketAddr>,
    local_port: u16,
    nodelay: bool,
    window: usize,
    unacked: usize,
    delivered: BytesMut,
    recved_total: usize,
    releases: usize,
    teardown: Option<Teardown>,
    epoch: u64,
    connected: Option<ConnectedFn>,
    error: Option<ErrorFn>,
    recv: Option<RecvFn>,
    sent: Option<SentFn>,
}

impl ConnState {
    fn new(window: usize) -> Self {
        Self {
            state: TcpState::Closed,
            remote: None,
            local_port: 0,
            nodelay: false,
            window,
            unacked: 0,
            delivered: BytesMut::new(),
            recved_total: 0,
            releases: 0,
            teardown: None,
            epoch: 0,
            connected: None,
            error: None,
            recv: None,
            sent: None,
        }
    }

    fn drop_callbacks(&mut self) {
        self.epoch += 1;
        self.connected = None;
        self.error = None;
        self.recv = None;
        self.sent = None;
    }
}

/// A connection object of [`SimStack`].
pub struct SimConnection {
    id: ConnId,
    stack: Weak<SimInner>,
    st: RefCell<ConnState>,
}

impl SimConnection {
    fn teardown(&self) -> Option<Teardown> {
        self.st.borrow().teardown
    }

    fn unlink(&self) {
        let Some(stack) = self.stack.upgrade() else { return };
        let mut st = stack.state.borrow_mut();
        if let Some(conn) = st.live.remove(&self.id) {
            if st.retired.len() == RETIRED_HISTORY {
                st.retired.pop_front();
            }
            st.retired.push_back(conn);
        }
    }

    /// Stack-side destruction after an error: the error callback is the only
    /// one that fires, and it fires last.
    fn fail(&self, status: StackStatus) {
        let callback = {
            let mut st = self.st.borrow_mut();
            if st.teardown.is_some() {
                return;
            }
            st.state = TcpState::Closed;
            st.teardown = Some(Teardown::Errored(status));
            let callback = st.error.take();
            st.drop_callbacks();
            callback
        };
        self.unlink();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn fire_recv(&self, data: Option<Bytes>) -> StackStatus {
        let (callback, epoch) = {
            let mut st = self.st.borrow_mut();
            (st.recv.take(), st.epoch)
        };
        let Some(mut callback) = callback else { return StackStatus::Ok };
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

    fn can_send(state: TcpState) -> bool {
        matches!(state, TcpState::Established | TcpState::CloseWait)
    }
}

impl RawConnection for SimConnection {
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
    }

    fn nodelay(&self) -> bool {
        self.st.borrow().nodelay
    }

    fn send_capacity(&self) -> usize {
        let st = self.st.borrow();
        if !Self::can_send(st.state) {
            return 0;
        }
        st.window.saturating_sub(st.unacked)
    }

    fn send(&self, data: &[u8]) -> usize {
        let mut st = self.st.borrow_mut();
        if !Self::can_send(st.state) {
            return 0;
        }
        let accepted = data.len().min(st.window.saturating_sub(st.unacked));
        st.unacked += accepted;
        st.delivered.extend_from_slice(&data[..accepted]);
        accepted
    }

    fn unacked(&self) -> usize {
        self.st.borrow().unacked
    }

    fn recved(&self, len: usize) {
        self.st.borrow_mut().recved_total += len;
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

    fn connect(&self, remote: SocketAddr, connected: ConnectedFn) -> Result<(), StackStatus> {
        let stack = self.stack.upgrade().ok_or(StackStatus::Clsd)?;
        {
            let mut st = self.st.borrow_mut();
            if st.teardown.is_some() {
                return Err(StackStatus::Clsd);
            }
            if st.state != TcpState::Closed || st.remote.is_some() {
                return Err(StackStatus::IsConn);
            }
            if st.local_port == 0 {
                let mut stack_st = stack.state.borrow_mut();
                st.local_port = stack_st.next_ephemeral;
                stack_st.next_ephemeral =
                    stack_st.next_ephemeral.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            }
            st.remote = Some(remote);
            st.state = TcpState::SynSent;
            st.connected = Some(connected);
        }
        stack.state.borrow_mut().queue.push_back(SimEvent::Handshake(self.id));
        Ok(())
    }

    fn close(&self) -> Result<(), StackStatus> {
        {
            let mut st = self.st.borrow_mut();
            if st.teardown.is_some() {
                return Err(StackStatus::Clsd);
            }
            st.state = match st.state {
                TcpState::CloseWait => TcpState::LastAck,
                TcpState::Established => TcpState::FinWait1,
                _ => TcpState::Closed,
            };
            st.teardown = Some(Teardown::Closed);
            st.releases += 1;
            st.drop_callbacks();
        }
        self.unlink();
        Ok(())
    }

    fn abort(&self) {
        {
            let mut st = self.st.borrow_mut();
            if st.teardown.is_some() {
                return;
            }
            st.state = TcpState::Closed;
            st.teardown = Some(Teardown::Aborted);
            st.releases += 1;
            st.drop_callbacks();
        }
        self.unlink();
    }
}

/// Remote-side controls and inspection for one simulated connection.
#[derive(Clone)]
pub struct SimPeer {
    conn: Rc<SimConnection>,
}

impl SimPeer {
    pub fn id(&self) -> ConnId {
        self.conn.id
    }

    pub fn state(&self) -> TcpState {
        self.conn.state()
    }

    pub fn local_port(&self) -> u16 {
        self.conn.local_port()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    /// Deliver bytes to the local side. Ignored unless the connection can
    /// still receive.
    pub fn send(&self, data: &[u8]) -> StackStatus {
        let state = self.conn.state();
        if !matches!(state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2) {
            return StackStatus::Conn;
        }
        self.conn.fire_recv(Some(Bytes::copy_from_slice(data)))
    }

    /// Peer sends FIN.
    pub fn close(&self) {
        {
            let mut st = self.conn.st.borrow_mut();
            if st.state != TcpState::Established {
                return;
            }
            st.state = TcpState::CloseWait;
        }
        self.conn.fire_recv(None);
    }

    /// Peer sends RST; the stack destroys the connection.
    pub fn reset(&self) {
        self.conn.fail(StackStatus::Rst);
    }

    /// Acknowledge up to `len` outstanding bytes.
    pub fn ack(&self, len: usize) {
        let acked = {
            let mut st = self.conn.st.borrow_mut();
            let acked = len.min(st.unacked);
            st.unacked -= acked;
            acked
        };
        if acked > 0 {
            self.conn.fire_sent(acked);
        }
    }

    pub fn ack_all(&self) {
        let outstanding = self.conn.unacked();
        self.ack(outstanding);
    }

    /// Everything the local side has sent so far.
    pub fn received(&self) -> Vec<u8> {
        self.conn.st.borrow().delivered.to_vec()
    }

    pub fn unacked(&self) -> usize {
        self.conn.unacked()
    }

    /// Total bytes the local side reported as consumed via `recved`.
    pub fn recved_total(&self) -> usize {
        self.conn.st.borrow().recved_total
    }

    pub fn nodelay(&self) -> bool {
        self.conn.nodelay()
    }

    pub fn teardown(&self) -> Option<Teardown> {
        self.conn.teardown()
    }

    /// How many times the local side closed or aborted this connection.
    pub fn releases(&self) -> usize {
        self.conn.st.borrow().releases
    }

    pub fn has_callbacks(&self) -> bool {
        let st = self.conn.st.borrow();
        st.connected.is_some() || st.error.is_some() || st.recv.is_some() || st.sent.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn never_connects(_: RawConn, _: StackStatus) -> StackStatus {
        panic!("must not connect")
    }

    #[test]
    fn test_route_follows_link_and_unreachable() {
        let sim = SimStack::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(sim.route(ip).is_some());

        sim.set_unreachable(ip);
        assert!(sim.route(ip).is_none());
        assert!(sim.route("10.0.0.3".parse().unwrap()).is_some());

        sim.set_link_up(false);
        assert!(sim.route("10.0.0.3".parse().unwrap()).is_none());
    }

    #[test]
    fn test_connect_is_deferred_until_pump() {
        let sim = SimStack::new();
        sim.listen(addr("10.0.0.2:80"));
        let conn = sim.new_connection().unwrap();

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        conn.connect(
            addr("10.0.0.2:80"),
            Box::new(move |_: RawConn, status: StackStatus| {
                assert_eq!(status, StackStatus::Ok);
                flag.set(true);
                StackStatus::Ok
            }),
        )
        .unwrap();

        assert_eq!(conn.state(), TcpState::SynSent);
        assert!(!fired.get());
        assert_eq!(sim.pump(), 1);
        assert!(fired.get());
        assert_eq!(conn.state(), TcpState::Established);
        assert!(conn.local_port() >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn test_refused_fires_error_only() {
        let sim = SimStack::new();
        let conn = sim.new_connection().unwrap();
        let errored = Rc::new(Cell::new(None));
        let slot = errored.clone();
        conn.on_error(Box::new(move |status: StackStatus| slot.set(Some(status))));
        conn.connect(addr("10.0.0.9:80"), Box::new(never_connects)).unwrap();

        sim.pump();
        assert_eq!(errored.get(), Some(StackStatus::Rst));
        assert_eq!(sim.live_connections(), 0);
        assert_eq!(sim.last_peer().unwrap().teardown(), Some(Teardown::Errored(StackStatus::Rst)));
    }

    #[test]
    fn test_abort_discards_callbacks() {
        let sim = SimStack::new();
        sim.blackhole(addr("10.0.0.2:80"));
        let conn = sim.new_connection().unwrap();
        conn.on_error(Box::new(|_: StackStatus| panic!("abort must not invoke callbacks")));
        conn.connect(addr("10.0.0.2:80"), Box::new(never_connects)).unwrap();

        conn.abort();
        conn.abort();
        sim.pump();
        let peer = sim.last_peer().unwrap();
        assert_eq!(peer.teardown(), Some(Teardown::Aborted));
        assert_eq!(peer.releases(), 1);
        assert!(!peer.has_callbacks());
    }

    #[test]
    fn test_send_respects_window() {
        let sim = SimStack::new();
        sim.set_send_window(4);
        let conn = sim.inbound(addr("10.0.0.5:5000"), 80);

        assert_eq!(conn.send(b"abcdef"), 4);
        assert_eq!(conn.send_capacity(), 0);
        let peer = sim.last_peer().unwrap();
        peer.ack(2);
        assert_eq!(conn.send_capacity(), 2);
        assert_eq!(peer.received(), b"abcd");
    }

    #[test]
    fn test_max_connections() {
        let sim = SimStack::new();
        sim.set_max_connections(Some(1));
        let first = sim.new_connection();
        assert!(first.is_some());
        assert!(sim.new_connection().is_none());
        first.unwrap().abort();
        assert!(sim.new_connection().is_some());
    }

    #[test]
    fn test_torn_down_connections_are_not_kept_forever() {
        let sim = SimStack::new();
        let first = sim.new_connection().unwrap().id();
        for _ in 0..(RETIRED_HISTORY * 4) {
            sim.new_connection().unwrap().abort();
        }

        assert_eq!(sim.created_connections(), RETIRED_HISTORY * 4 + 1);
        assert_eq!(sim.inner.state.borrow().retired.len(), RETIRED_HISTORY);
        assert_eq!(sim.last_peer().unwrap().teardown(), Some(Teardown::Aborted));
        // Never torn down, so still reachable.
        assert!(sim.peer(first).is_some());

        let old = ConnId(2);
        assert!(sim.peer(old).is_none());
    }
}
