use std::path::PathBuf;
use std::time::Duration;

use crate::http_session::HttpSessionSettings;

pub const PLUGINS_DIR_ENV: &str = "PORTAL_PLUGINS_DIR";
pub const SESSION_DIR_ENV: &str = "PORTAL_SESSION_DIR";
pub const RATE_LIMIT_TIMEOUT_ENV: &str = "PORTAL_RATE_LIMIT_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub plugins_dir: PathBuf,
    pub session_dir: PathBuf,
    /// Longest a query waits for a rate-limit token.
    pub rate_limit_timeout: Duration,
    pub http: HttpSessionSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            session_dir: PathBuf::from("data").join("sessions"),
            rate_limit_timeout: Duration::from_secs(30),
            http: HttpSessionSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `PORTAL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(PLUGINS_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.plugins_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(SESSION_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.session_dir = PathBuf::from(dir);
        }
        match lookup(RATE_LIMIT_TIMEOUT_ENV).map(|v| v.trim().parse::<u64>()) {
            Some(Ok(secs)) => config.rate_limit_timeout = Duration::from_secs(secs),
            Some(Err(err)) => portal_logging::portal_warn!(
                "ignoring {}: {}; using {:?}",
                RATE_LIMIT_TIMEOUT_ENV,
                err,
                config.rate_limit_timeout
            ),
            None => {}
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(|key| match key {
            SESSION_DIR_ENV => Some("/tmp/sessions".into()),
            RATE_LIMIT_TIMEOUT_ENV => Some("5".into()),
            _ => None,
        });
        assert_eq!(config.session_dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.plugins_dir, PathBuf::from("plugins"));
        assert_eq!(config.rate_limit_timeout, Duration::from_secs(5));
    }

    #[test]
    fn bad_timeout_keeps_default() {
        let config = OrchestratorConfig::from_lookup(|key| {
            (key == RATE_LIMIT_TIMEOUT_ENV).then(|| "soon".to_string())
        });
        assert_eq!(config.rate_limit_timeout, Duration::from_secs(30));
    }
}
