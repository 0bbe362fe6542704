//! Network stack collaborator.
//!
//! The TCP/IP stack itself (routing, the TCP state machine, retransmission) is
//! external to this crate. It is reached only through the [`TcpStack`] and
//! [`RawConnection`] traits, which mirror the raw-PCB API of small embedded
//! stacks such as lwIP: create a connection object, register callbacks, issue
//! a connect, and get called back from the event loop.
//!
//! Two implementations ship with the crate:
//! - [`sim::SimStack`]: deterministic in-memory stack driven by `pump()`
//! - [`native::NativeStack`]: real sockets on the tokio current-thread runtime

pub mod native;
pub mod sim;

use crate::base::neterror::NetError;
use crate::base::tcpstate::TcpState;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

/// Status code exchanged with the stack, numbered like lwIP's `err_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StackStatus {
    Ok = 0,
    /// Out of memory.
    Mem = -1,
    Buf = -2,
    Timeout = -3,
    /// Routing problem.
    Rte = -4,
    InProgress = -5,
    Val = -6,
    WouldBlock = -7,
    Use = -8,
    Already = -9,
    IsConn = -10,
    Conn = -11,
    If = -12,
    /// Connection aborted. Returned from a callback, it tells the stack the
    /// callback has already aborted the connection.
    Abrt = -13,
    Rst = -14,
    Clsd = -15,
    Arg = -16,
}

impl StackStatus {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn is_ok(self) -> bool {
        self == StackStatus::Ok
    }

    /// Map an operating system error onto the closest stack status.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => StackStatus::Rst,
            ErrorKind::ConnectionAborted => StackStatus::Abrt,
            ErrorKind::TimedOut => StackStatus::Timeout,
            ErrorKind::AddrInUse => StackStatus::Use,
            ErrorKind::AddrNotAvailable => StackStatus::Rte,
            ErrorKind::NotConnected => StackStatus::Conn,
            ErrorKind::OutOfMemory => StackStatus::Mem,
            ErrorKind::InvalidInput => StackStatus::Arg,
            _ => StackStatus::If,
        }
    }
}

impl From<i8> for StackStatus {
    fn from(code: i8) -> Self {
        match code {
            0 => StackStatus::Ok,
            -1 => StackStatus::Mem,
            -2 => StackStatus::Buf,
            -3 => StackStatus::Timeout,
            -4 => StackStatus::Rte,
            -5 => StackStatus::InProgress,
            -6 => StackStatus::Val,
            -7 => StackStatus::WouldBlock,
            -8 => StackStatus::Use,
            -9 => StackStatus::Already,
            -10 => StackStatus::IsConn,
            -11 => StackStatus::Conn,
            -12 => StackStatus::If,
            -13 => StackStatus::Abrt,
            -14 => StackStatus::Rst,
            -15 => StackStatus::Clsd,
            _ => StackStatus::Arg,
        }
    }
}

impl From<StackStatus> for NetError {
    fn from(status: StackStatus) -> Self {
        match status {
            StackStatus::Ok => NetError::Unknown(0),
            StackStatus::Mem | StackStatus::Buf => NetError::NoBufferSpace,
            StackStatus::Timeout => NetError::ConnectionTimedOut,
            StackStatus::Rte => NetError::AddressUnreachable,
            StackStatus::Use => NetError::AddressInUse,
            StackStatus::Val | StackStatus::Arg => NetError::AddressInvalid,
            StackStatus::Conn => NetError::SocketNotConnected,
            StackStatus::If => NetError::InternetDisconnected,
            StackStatus::Abrt => NetError::ConnectionAborted,
            StackStatus::Rst => NetError::ConnectionReset,
            StackStatus::Clsd => NetError::ConnectionClosed,
            StackStatus::InProgress
            | StackStatus::WouldBlock
            | StackStatus::Already
            | StackStatus::IsConn => NetError::ConnectionFailed,
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i8())
    }
}

/// Identity of a raw connection within its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identity of the interface a route resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

/// Shared handle to a stack-level connection object.
pub type RawConn = Rc<dyn RawConnection>;

/// Fired once when the handshake completes. Receives the connection and the
/// stack's status; returning anything but `Ok` means the callback aborted it.
pub type ConnectedFn = Box<dyn FnOnce(RawConn, StackStatus) -> StackStatus>;

/// Fired at most once. The stack has already freed the connection.
pub type ErrorFn = Box<dyn FnOnce(StackStatus)>;

/// Inbound data; `None` signals the peer closed its side.
pub type RecvFn = Box<dyn FnMut(Option<Bytes>) -> StackStatus>;

/// Number of previously sent bytes the peer acknowledged.
pub type SentFn = Box<dyn FnMut(usize) -> StackStatus>;

/// One TCP connection object owned by the stack.
///
/// All methods take `&self`: implementations keep their state behind interior
/// mutability, since the stack and the connection's owner both hold it on the
/// same event loop. Implementations must never invoke a callback while one of
/// their own borrows is live, so callbacks may call straight back in.
pub trait RawConnection {
    fn id(&self) -> ConnId;

    fn state(&self) -> TcpState;

    /// Remote endpoint, once a connect has been issued or accepted.
    fn remote_addr(&self) -> Option<SocketAddr>;

    fn local_port(&self) -> u16;

    /// Request a specific local port. Only honored before `connect`.
    fn bind_local_port(&self, port: u16);

    fn set_nodelay(&self, nodelay: bool);

    fn nodelay(&self) -> bool;

    /// Bytes the send path can accept right now.
    fn send_capacity(&self) -> usize;

    /// Stage bytes for transmission, returning how many were accepted.
    fn send(&self, data: &[u8]) -> usize;

    /// Bytes sent but not yet acknowledged by the peer.
    fn unacked(&self) -> usize;

    /// Tell the stack the application consumed `len` received bytes.
    fn recved(&self, len: usize);

    fn on_error(&self, callback: ErrorFn);

    fn on_recv(&self, callback: RecvFn);

    fn on_sent(&self, callback: SentFn);

    /// Drop every registered callback without invoking it.
    fn clear_callbacks(&self);

    /// Begin the handshake. Completion is reported through `connected` or the
    /// error callback, never both, and never synchronously from this call.
    fn connect(&self, remote: SocketAddr, connected: ConnectedFn) -> Result<(), StackStatus>;

    /// Graceful shutdown. On error the caller should fall back to `abort`.
    fn close(&self) -> Result<(), StackStatus>;

    /// Immediate teardown (RST). Callbacks are discarded, not invoked.
    fn abort(&self);
}

/// The stack-wide operations a client needs.
pub trait TcpStack {
    /// Find the interface that would carry traffic to `dest`.
    fn route(&self, dest: IpAddr) -> Option<InterfaceId>;

    /// Allocate a fresh connection object, or `None` when out of resources.
    fn new_connection(&self) -> Option<RawConn>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for code in -16i8..=0 {
            assert_eq!(StackStatus::from(code).as_i8(), code);
        }
        assert_eq!(StackStatus::from(-99), StackStatus::Arg);
    }

    #[test]
    fn test_status_to_net_error() {
        assert_eq!(NetError::from(StackStatus::Rst), NetError::ConnectionReset);
        assert_eq!(NetError::from(StackStatus::Abrt), NetError::ConnectionAborted);
        assert_eq!(NetError::from(StackStatus::Rte), NetError::AddressUnreachable);
        assert_eq!(NetError::from(StackStatus::Mem), NetError::NoBufferSpace);
    }

    #[test]
    fn test_status_from_io() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(StackStatus::from_io(&refused), StackStatus::Rst);
        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(StackStatus::from_io(&timed_out), StackStatus::Timeout);
    }
}
