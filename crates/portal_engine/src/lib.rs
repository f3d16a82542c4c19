//! Portal engine: page sessions, credentials, session storage, rate limiting,
//! authentication and the query orchestrator.
mod auth;
mod config;
mod credentials;
mod decode;
mod dom;
mod engine;
mod executor;
mod http_session;
mod loader;
mod orchestrator;
mod page;
mod persist;
mod rate_limit;
mod session_store;

pub use auth::AuthenticationEngine;
pub use config::{
    OrchestratorConfig, PLUGINS_DIR_ENV, RATE_LIMIT_TIMEOUT_ENV, SESSION_DIR_ENV,
};
pub use credentials::{
    lookup as credential_value, missing_fields, CredentialProvider, Credentials,
    EnvCredentialProvider, StaticCredentialProvider,
};
pub use decode::decode_body;
pub use engine::{EngineEvent, EngineHandle, JobId};
pub use executor::QueryExecutor;
pub use http_session::{HttpPageSession, HttpSessionFactory, HttpSessionSettings};
pub use loader::{DescriptorLoader, LoadError, LoadReport};
pub use orchestrator::{Collaborators, Orchestrator};
pub use page::{
    first_match, indicator_matches, url_markers, FormField, PageError, PageSession,
    PageSessionFactory,
};
pub use persist::{ensure_dir, AtomicFileWriter, PersistError};
pub use rate_limit::RateLimiter;
pub use session_store::{
    session_file_name, FileSessionStore, InvalidateOutcome, MemorySessionStore, SessionStore,
};
