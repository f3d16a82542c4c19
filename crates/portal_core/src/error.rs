use std::fmt;

/// Orchestration phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validation,
    Authentication,
    RateLimit,
    Query,
    Storage,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Validation => write!(f, "validation"),
            Phase::Authentication => write!(f, "authentication"),
            Phase::RateLimit => write!(f, "rate limit"),
            Phase::Query => write!(f, "query"),
            Phase::Storage => write!(f, "storage"),
        }
    }
}

/// Caller-facing failure taxonomy. Every variant names the plugin it concerns.
///
/// The type is `Clone` so one login outcome can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortalError {
    #[error("unknown plugin '{plugin_id}'")]
    UnknownPlugin { plugin_id: String },
    #[error("plugin '{plugin_id}' is disabled")]
    PluginDisabled { plugin_id: String },
    #[error("invalid query for plugin '{plugin_id}': {reason}")]
    InvalidQuery { plugin_id: String, reason: String },
    #[error("credentials missing for plugin '{plugin_id}': {missing:?}")]
    CredentialsMissing {
        plugin_id: String,
        missing: Vec<String>,
    },
    #[error("authentication failed for plugin '{plugin_id}': {reason}")]
    AuthenticationFailed { plugin_id: String, reason: String },
    #[error("rate limit wait for plugin '{plugin_id}' timed out after {waited_ms}ms")]
    RateLimitTimeout { plugin_id: String, waited_ms: u64 },
    #[error("session for plugin '{plugin_id}' expired during query")]
    SessionExpiredDuringQuery { plugin_id: String },
    #[error("network unavailable for plugin '{plugin_id}' during {phase}: {message}")]
    NetworkUnavailable {
        plugin_id: String,
        phase: Phase,
        message: String,
    },
    #[error("session storage failed for plugin '{plugin_id}': {message}")]
    Storage { plugin_id: String, message: String },
    #[error("request for plugin '{plugin_id}' cancelled during {phase}")]
    Cancelled { plugin_id: String, phase: Phase },
}

impl PortalError {
    pub fn plugin_id(&self) -> &str {
        match self {
            PortalError::UnknownPlugin { plugin_id }
            | PortalError::PluginDisabled { plugin_id }
            | PortalError::InvalidQuery { plugin_id, .. }
            | PortalError::CredentialsMissing { plugin_id, .. }
            | PortalError::AuthenticationFailed { plugin_id, .. }
            | PortalError::RateLimitTimeout { plugin_id, .. }
            | PortalError::SessionExpiredDuringQuery { plugin_id }
            | PortalError::NetworkUnavailable { plugin_id, .. }
            | PortalError::Storage { plugin_id, .. }
            | PortalError::Cancelled { plugin_id, .. } => plugin_id,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            PortalError::UnknownPlugin { .. }
            | PortalError::PluginDisabled { .. }
            | PortalError::InvalidQuery { .. } => Phase::Validation,
            PortalError::CredentialsMissing { .. } | PortalError::AuthenticationFailed { .. } => {
                Phase::Authentication
            }
            PortalError::RateLimitTimeout { .. } => Phase::RateLimit,
            PortalError::SessionExpiredDuringQuery { .. } => Phase::Query,
            PortalError::Storage { .. } => Phase::Storage,
            PortalError::NetworkUnavailable { phase, .. } | PortalError::Cancelled { phase, .. } => {
                *phase
            }
        }
    }
}
