use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Network error codes.
///
/// Numbering follows Chromium's `net_error_list.h` so codes stay stable across
/// the crate and can be round-tripped through plain integers.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Address in use")]
    AddressInUse,
    #[error("No buffer space")]
    NoBufferSpace,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::NameNotResolvedFor { .. } => -105,
            NetError::InternetDisconnected => -106,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AddressInUse => -147,
            NetError::NoBufferSpace => -176,
            NetError::Unknown(code) => *code,
        }
    }

    /// Build a resolution failure carrying the domain and the io cause.
    pub fn dns_failed(domain: impl Into<String>, source: io::Error) -> Self {
        NetError::NameNotResolvedFor { domain: domain.into(), source: Arc::new(source) }
    }

    /// True for failures that happen before any raw connection exists.
    pub fn is_pre_connect(&self) -> bool {
        matches!(
            self,
            NetError::NameNotResolved
                | NetError::NameNotResolvedFor { .. }
                | NetError::AddressUnreachable
                | NetError::AddressInvalid
                | NetError::NoBufferSpace
        )
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                NetError::NameNotResolvedFor { domain: a, .. },
                NetError::NameNotResolvedFor { domain: b, .. },
            ) => a == b,
            _ => {
                std::mem::discriminant(self) == std::mem::discriminant(other)
                    && self.as_i32() == other.as_i32()
            }
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -147 => NetError::AddressInUse,
            -176 => NetError::NoBufferSpace,
            _ => NetError::Unknown(code),
        }
    }
}
