//! Flash strategy FSM unit tests

use kflash::flash::strategy::{FlashEvent, FlashFsm, FlashState};
use kflash::models::FlashMethod;

#[test]
fn test_fsm_initial_state() {
    let fsm = FlashFsm::new();
    assert_eq!(fsm.state(), &FlashState::Idle);
}

#[test]
fn test_fsm_preferred_success_flow() {
    let mut fsm = FlashFsm::new();

    // Idle -> TryPreferred
    fsm.process(FlashEvent::Begin).unwrap();
    assert_eq!(fsm.state(), &FlashState::TryPreferred);

    // TryPreferred -> Success(Katapult)
    fsm.process(FlashEvent::PreferredSucceeded).unwrap();
    assert_eq!(fsm.state(), &FlashState::Success(FlashMethod::Katapult));
}

#[test]
fn test_fsm_fallback_flow() {
    let mut fsm = FlashFsm::new();

    fsm.process(FlashEvent::Begin).unwrap();
    fsm.process(FlashEvent::PreferredFailed {
        fallback_available: true,
    })
    .unwrap();
    assert_eq!(fsm.state(), &FlashState::TryFallback);

    fsm.process(FlashEvent::FallbackFailed).unwrap();
    assert_eq!(fsm.state(), &FlashState::Failed);
}

#[test]
fn test_fsm_no_fallback_is_terminal() {
    let mut fsm = FlashFsm::new();

    fsm.process(FlashEvent::Begin).unwrap();
    fsm.process(FlashEvent::PreferredFailed {
        fallback_available: false,
    })
    .unwrap();
    assert_eq!(fsm.state(), &FlashState::Failed);

    // Failed accepts no further events
    assert!(fsm.process(FlashEvent::FallbackSucceeded).is_err());
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = FlashFsm::new();

    // Cannot succeed without beginning
    let result = fsm.process(FlashEvent::PreferredSucceeded);
    assert!(result.is_err());
}
