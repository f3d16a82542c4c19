use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use portal_core::PluginDescriptor;

/// Credential values keyed by field name (`username`, `password`, ...).
pub type Credentials = BTreeMap<String, String>;

/// Resolves credentials for a plugin. The orchestrator never persists them.
pub trait CredentialProvider: Send + Sync {
    fn get(&self, plugin_id: &str) -> Option<Credentials>;
}

/// Credential fields the plugin's auth scenario requires that `credentials` lacks.
///
/// An `email` value satisfies a `username` requirement.
pub fn missing_fields(descriptor: &PluginDescriptor, credentials: &Credentials) -> Vec<String> {
    descriptor
        .required_credentials()
        .into_iter()
        .filter(|field| lookup(credentials, field).is_none())
        .collect()
}

/// Non-empty value for `field`, with the username/email fallback applied.
pub fn lookup<'a>(credentials: &'a Credentials, field: &str) -> Option<&'a str> {
    let direct = credentials
        .get(field)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty());
    if direct.is_some() || field != "username" {
        return direct;
    }
    credentials
        .get("email")
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

const ENV_FIELDS: &[(&str, &str)] = &[
    ("username", "USERNAME"),
    ("email", "EMAIL"),
    ("password", "PASSWORD"),
    ("api_key", "API_KEY"),
];

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `{PLUGIN}_USERNAME`, `{PLUGIN}_EMAIL`, `{PLUGIN}_PASSWORD` and
/// `{PLUGIN}_API_KEY`, where `PLUGIN` is the id upper-cased with `-` as `_`.
pub struct EnvCredentialProvider {
    lookup: EnvLookup,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Uses `lookup` instead of the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    pub fn env_prefix(plugin_id: &str) -> String {
        plugin_id
            .chars()
            .map(|c| match c {
                '-' | '.' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn get(&self, plugin_id: &str) -> Option<Credentials> {
        let prefix = Self::env_prefix(plugin_id);
        let found: Credentials = ENV_FIELDS
            .iter()
            .filter_map(|(field, suffix)| {
                (self.lookup)(&format!("{prefix}_{suffix}"))
                    .filter(|value| !value.is_empty())
                    .map(|value| (field.to_string(), value))
            })
            .collect();
        if found.is_empty() {
            None
        } else {
            Some(found)
        }
    }
}

/// Fixed in-memory credentials.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    entries: Mutex<HashMap<String, Credentials>>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K, V>(&self, plugin_id: &str, values: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let credentials = values
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), credentials);
    }

    pub fn remove(&self, plugin_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get(&self, plugin_id: &str) -> Option<Credentials> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
    }
}
