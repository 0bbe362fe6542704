use std::fmt;

/// State of the underlying TCP connection.
/// Numbering matches lwIP's `enum tcp_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TcpState {
    /// No connection.
    #[default]
    Closed = 0,

    /// Passive open, waiting for a SYN.
    Listen = 1,

    /// SYN sent, waiting for SYN-ACK.
    SynSent = 2,

    /// SYN received, waiting for the final ACK.
    SynRcvd = 3,

    /// Data can flow in both directions.
    Established = 4,

    FinWait1 = 5,
    FinWait2 = 6,

    /// Peer sent FIN; local side may still send.
    CloseWait = 7,

    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

impl TcpState {
    /// Map a raw lwIP state number. Out-of-range values read as `Closed`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TcpState::Listen,
            2 => TcpState::SynSent,
            3 => TcpState::SynRcvd,
            4 => TcpState::Established,
            5 => TcpState::FinWait1,
            6 => TcpState::FinWait2,
            7 => TcpState::CloseWait,
            8 => TcpState::Closing,
            9 => TcpState::LastAck,
            10 => TcpState::TimeWait,
            _ => TcpState::Closed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True once the three-way handshake has completed and before the
    /// connection is fully torn down.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
