use crate::base::loadstate::LoadState;
use crate::base::neterror::{FailureClass, NetError, ParseSection, RequestFailure};

#[test]
fn test_net_error_roundtrip() {
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    assert!(matches!(NetError::from(code), NetError::ConnectionRefused));

    let engine = NetError::PipelineFailure;
    assert_eq!(NetError::from(engine.as_i32()), NetError::PipelineFailure);
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
}

#[test]
fn test_protocol_violation_names_section() {
    let err = NetError::protocol(ParseSection::StatusLine, "missing HTTP/ prefix");
    let msg = err.to_string();
    assert!(msg.contains("status line"));
    assert!(msg.contains("missing HTTP/ prefix"));
}

#[test]
fn test_recoverable_is_retried_once() {
    let failure = RequestFailure::recoverable(NetError::KeepAliveFailure);
    assert!(failure.may_resubmit(false));
    assert!(!failure.may_resubmit(true));
}

#[test]
fn test_fatal_classes() {
    let fatal = RequestFailure::fatal(NetError::InvalidHeader);
    assert!(fatal.is_fatal());
    assert!(!fatal.may_resubmit(false));

    let sp = RequestFailure::new(NetError::ProxyConnectionFailed, FailureClass::ServicePointFatal);
    assert!(sp.is_fatal());
    assert!(sp.may_resubmit(true));

    let isolated = RequestFailure::isolated(NetError::ConnectionClosed);
    assert!(!isolated.is_fatal());
    assert!(isolated.may_resubmit(true));
}

#[test]
fn test_load_state_roundtrip() {
    for state in [
        LoadState::Created,
        LoadState::Submitting,
        LoadState::AwaitingContinue,
        LoadState::Complete,
        LoadState::Faulted,
    ] {
        assert_eq!(LoadState::from_u8(state as u8), state);
    }
    assert!(LoadState::Faulted.is_terminal());
    assert!(!LoadState::Writing.is_terminal());
}
