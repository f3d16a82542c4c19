use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Opaque authenticated state exported by a page session (cookies, storage).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBlob(pub serde_json::Value);

impl StateBlob {
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Expired,
    Invalid,
}

/// One authenticated session for a plugin. `expires_at` is derived from
/// `created_at` and `ttl_secs` and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub plugin_id: String,
    pub state: StateBlob,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub invalidated: bool,
}

impl Session {
    pub fn new(
        plugin_id: impl Into<String>,
        state: StateBlob,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            state,
            created_at,
            ttl_secs: ttl.as_secs(),
            invalidated: false,
        }
    }

    /// Whether `other` came from the same login: same plugin, creation time and state.
    pub fn same_login(&self, other: &Session) -> bool {
        self.plugin_id == other.plugin_id
            && self.created_at == other.created_at
            && self.state == other.state
    }

    /// Session for a portal that needs no login. Never expires in practice.
    pub fn anonymous(plugin_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(plugin_id, StateBlob::empty(), now, Duration::from_secs(u64::MAX))
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.invalidated {
            SessionStatus::Invalid
        } else if now < self.expires_at() {
            SessionStatus::Valid
        } else {
            SessionStatus::Expired
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == SessionStatus::Valid
    }
}

/// Source of wall-clock time for session expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
