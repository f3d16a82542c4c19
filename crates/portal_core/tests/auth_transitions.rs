use portal_core::{AuthEvent, AuthState};

#[test]
fn login_cycle_follows_the_state_machine() {
    let state = AuthState::default();
    assert_eq!(state, AuthState::LoggedOut);

    let state = state.on(AuthEvent::LoginStarted).unwrap();
    assert!(state.is_busy());
    let state = state.on(AuthEvent::LoginSucceeded).unwrap();
    assert_eq!(state, AuthState::Authenticated);

    let state = state.on(AuthEvent::SessionInvalidated).unwrap();
    assert_eq!(state, AuthState::Invalidated);
    let state = state.on(AuthEvent::Reset).unwrap();
    assert_eq!(state, AuthState::LoggedOut);
}

#[test]
fn failed_login_returns_to_logged_out() {
    let state = AuthState::Authenticating.on(AuthEvent::LoginFailed);
    assert_eq!(state, Some(AuthState::LoggedOut));
}

#[test]
fn expired_session_can_log_in_again() {
    let state = AuthState::Authenticated
        .on(AuthEvent::SessionExpired)
        .and_then(|state| state.on(AuthEvent::LoginStarted));
    assert_eq!(state, Some(AuthState::Authenticating));
}

#[test]
fn illegal_transitions_are_rejected() {
    assert_eq!(AuthState::Authenticating.on(AuthEvent::LoginStarted), None);
    assert_eq!(AuthState::LoggedOut.on(AuthEvent::LoginSucceeded), None);
    assert_eq!(AuthState::LoggedOut.on(AuthEvent::SessionInvalidated), None);
}
