//! FSM unit tests

use hostscale::deploy::fsm::{LifecycleEvent, LifecycleFsm, LifecycleState};

#[test]
fn test_fsm_initial_state() {
    let fsm = LifecycleFsm::new();
    assert_eq!(fsm.state(), &LifecycleState::Absent);
    assert!(fsm.error().is_none());
    assert!(!fsm.is_running());
}

#[test]
fn test_fsm_observed_state() {
    assert_eq!(LifecycleFsm::observed(true).state(), &LifecycleState::Running);
    assert_eq!(LifecycleFsm::observed(false).state(), &LifecycleState::Absent);
}

#[test]
fn test_fsm_scale_failure_keeps_running() {
    let mut fsm = LifecycleFsm::observed(true);

    fsm.process(LifecycleEvent::Scale).unwrap();
    fsm.process(LifecycleEvent::ScaleFailed("unhealthy".to_string())).unwrap();

    assert_eq!(fsm.state(), &LifecycleState::Running);
    assert_eq!(fsm.error(), Some("unhealthy"));

    // A later attempt clears the error
    fsm.process(LifecycleEvent::Scale).unwrap();
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_stop_failure_retains_deployment() {
    let mut fsm = LifecycleFsm::observed(true);

    fsm.process(LifecycleEvent::Stop).unwrap();
    fsm.process(LifecycleEvent::StopFailed("daemon down".to_string())).unwrap();

    assert!(fsm.is_running());
}

#[test]
fn test_fsm_reconciled_drops_to_absent() {
    let mut fsm = LifecycleFsm::observed(true);
    fsm.process(LifecycleEvent::Reconciled).unwrap();
    assert_eq!(fsm.state(), &LifecycleState::Absent);

    // Fresh start is allowed again
    fsm.process(LifecycleEvent::Start).unwrap();
    assert_eq!(fsm.state(), &LifecycleState::Starting);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = LifecycleFsm::new();

    // Cannot scale or stop what was never started
    assert!(fsm.process(LifecycleEvent::Scale).is_err());
    assert!(fsm.process(LifecycleEvent::Stop).is_err());

    // Cannot start twice
    let mut running = LifecycleFsm::observed(true);
    assert!(running.process(LifecycleEvent::Start).is_err());
    assert_eq!(running.state(), &LifecycleState::Running);
}
