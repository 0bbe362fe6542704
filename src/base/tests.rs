use crate::base::neterror::NetError;
use crate::base::tcpstate::TcpState;

#[test]
fn test_net_error_roundtrip() {
    let original = NetError::ConnectionReset;
    let code = original.as_i32();
    assert_eq!(code, -101);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionReset));

    let unreachable = NetError::AddressUnreachable;
    assert_eq!(NetError::from(unreachable.as_i32()), unreachable);
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));

    // Refusal surfaces as a reset, so its code has no variant of its own.
    assert_eq!(NetError::from(-102), NetError::Unknown(-102));
}

#[test]
fn test_contextual_errors_share_plain_codes() {
    let err = NetError::dns_failed("printer.lan", std::io::Error::other("nxdomain"));
    assert_eq!(err.as_i32(), NetError::NameNotResolved.as_i32());
    assert_ne!(err, NetError::NameNotResolved);
    assert!(err.is_pre_connect());
    assert!(!NetError::ConnectionReset.is_pre_connect());
}

#[test]
fn test_tcp_state_numbering() {
    for n in 0..=10u8 {
        assert_eq!(TcpState::from_u8(n).as_u8(), n);
    }
    assert_eq!(TcpState::from_u8(42), TcpState::Closed);
    assert_eq!(TcpState::Established.to_string(), "ESTABLISHED");
    assert!(TcpState::CloseWait.is_synchronized());
    assert!(!TcpState::SynSent.is_synchronized());
}
