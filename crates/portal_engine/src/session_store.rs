use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use portal_core::{Clock, Session, SystemClock};
use portal_logging::{portal_debug, portal_warn};

use crate::persist::{AtomicFileWriter, PersistError};

/// Keyed store of authenticated sessions, one per plugin.
///
/// `get` only ever returns sessions that are valid at the time of the call;
/// stale records are treated as absent.
pub trait SessionStore: Send + Sync {
    fn get(&self, plugin_id: &str) -> Result<Option<Session>, PersistError>;

    fn put(&self, session: &Session) -> Result<(), PersistError>;

    /// Drops the record and returns it marked invalid, if there was one.
    fn invalidate(&self, plugin_id: &str) -> Result<Option<Session>, PersistError>;

    /// Drops the record only if it is still the login `used` came from.
    ///
    /// A record written by a later login is left in place and returned.
    fn invalidate_if(
        &self,
        plugin_id: &str,
        used: &Session,
    ) -> Result<InvalidateOutcome, PersistError>;
}

/// What `SessionStore::invalidate_if` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateOutcome {
    /// The stored session was the one in use; it is gone now.
    Removed,
    /// A newer valid session replaced the one in use and was kept.
    Superseded(Session),
    /// Nothing valid was stored.
    Absent,
}

/// Sessions as JSON files, one per plugin, in a single directory.
pub struct FileSessionStore {
    writer: AtomicFileWriter,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: AtomicFileWriter::new(dir.into()),
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, plugin_id: &str) -> PathBuf {
        self.writer.dir().join(session_file_name(plugin_id))
    }

    fn read(&self, plugin_id: &str) -> Result<Option<Session>, PersistError> {
        let path = self.path_for(plugin_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Session>(&text) {
            Ok(session) if session.plugin_id == plugin_id => Ok(Some(session)),
            Ok(session) => {
                portal_warn!(
                    "session file {} belongs to '{}', not '{}'; discarding",
                    path.display(),
                    session.plugin_id,
                    plugin_id
                );
                self.writer.remove(&session_file_name(plugin_id))?;
                Ok(None)
            }
            Err(err) => {
                portal_warn!(
                    "corrupt session file {}: {}; discarding",
                    path.display(),
                    err
                );
                self.writer.remove(&session_file_name(plugin_id))?;
                Ok(None)
            }
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, plugin_id: &str) -> Result<Option<Session>, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = self.read(plugin_id)? else {
            return Ok(None);
        };
        if session.is_valid(self.clock.now()) {
            return Ok(Some(session));
        }
        portal_debug!("session for {} expired at {}", plugin_id, session.expires_at());
        self.writer.remove(&session_file_name(plugin_id))?;
        Ok(None)
    }

    fn put(&self, session: &Session) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = serde_json::to_vec_pretty(session)?;
        let path = self
            .writer
            .write(&session_file_name(&session.plugin_id), &bytes)?;
        portal_debug!("stored session for {} at {}", session.plugin_id, path.display());
        Ok(())
    }

    fn invalidate(&self, plugin_id: &str) -> Result<Option<Session>, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = self.read(plugin_id)?;
        self.writer.remove(&session_file_name(plugin_id))?;
        Ok(existing.map(|mut session| {
            session.invalidated = true;
            session
        }))
    }

    fn invalidate_if(
        &self,
        plugin_id: &str,
        used: &Session,
    ) -> Result<InvalidateOutcome, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = self.read(plugin_id)? else {
            return Ok(InvalidateOutcome::Absent);
        };
        if !stored.same_login(used) && stored.is_valid(self.clock.now()) {
            portal_debug!("session for {} was replaced by a newer login; keeping it", plugin_id);
            return Ok(InvalidateOutcome::Superseded(stored));
        }
        self.writer.remove(&session_file_name(plugin_id))?;
        Ok(if stored.same_login(used) {
            InvalidateOutcome::Removed
        } else {
            InvalidateOutcome::Absent
        })
    }
}

/// In-process session map.
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, plugin_id: &str) -> Result<Option<Session>, PersistError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        match sessions.get(plugin_id) {
            Some(session) if session.is_valid(now) => Ok(Some(session.clone())),
            Some(_) => {
                sessions.remove(plugin_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, session: &Session) -> Result<(), PersistError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.plugin_id.clone(), session.clone());
        Ok(())
    }

    fn invalidate(&self, plugin_id: &str) -> Result<Option<Session>, PersistError> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);
        Ok(removed.map(|mut session| {
            session.invalidated = true;
            session
        }))
    }

    fn invalidate_if(
        &self,
        plugin_id: &str,
        used: &Session,
    ) -> Result<InvalidateOutcome, PersistError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = sessions.get(plugin_id) else {
            return Ok(InvalidateOutcome::Absent);
        };
        if stored.same_login(used) {
            sessions.remove(plugin_id);
            Ok(InvalidateOutcome::Removed)
        } else if stored.is_valid(self.clock.now()) {
            Ok(InvalidateOutcome::Superseded(stored.clone()))
        } else {
            sessions.remove(plugin_id);
            Ok(InvalidateOutcome::Absent)
        }
    }
}

/// Portable, deterministic file name: `{sanitized_id}--{short_hash(id)}.json`.
///
/// The hash keeps ids that sanitize to the same text apart.
pub fn session_file_name(plugin_id: &str) -> String {
    format!("{}--{}.json", sanitize_id(plugin_id), short_hash(plugin_id))
}

fn sanitize_id(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut prev_underscore = false;
    for c in input.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            c
        } else {
            '_'
        };
        if c == '_' && prev_underscore {
            continue;
        }
        prev_underscore = c == '_';
        cleaned.push(c);
    }
    let mut cleaned = cleaned.trim_matches(&['_', '.'][..]).to_string();
    if cleaned.is_empty() {
        cleaned = "plugin".to_string();
    }
    cleaned.truncate(64);
    cleaned
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
