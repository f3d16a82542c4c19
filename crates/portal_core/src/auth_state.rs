/// Authentication lifecycle of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    LoggedOut,
    Authenticating,
    Authenticated,
    Expired,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    LoginStarted,
    LoginSucceeded,
    LoginFailed,
    SessionExpired,
    SessionInvalidated,
    /// Clears an expired or invalidated session back to logged out.
    Reset,
}

impl AuthState {
    /// Next state for `event`, or `None` when the transition is not allowed.
    pub fn on(self, event: AuthEvent) -> Option<AuthState> {
        use AuthEvent::*;
        use AuthState::*;
        match (self, event) {
            (LoggedOut | Expired | Invalidated, LoginStarted) => Some(Authenticating),
            (Authenticating, LoginSucceeded) => Some(Authenticated),
            (Authenticating, LoginFailed) => Some(LoggedOut),
            (Authenticated, SessionExpired) => Some(Expired),
            (Authenticated, SessionInvalidated) => Some(Invalidated),
            (Expired | Invalidated, Reset) => Some(LoggedOut),
            _ => None,
        }
    }

    pub fn is_busy(self) -> bool {
        self == AuthState::Authenticating
    }
}
