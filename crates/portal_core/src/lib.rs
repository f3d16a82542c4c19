//! Portal core: plugin descriptors, sessions, rate-budget math, the
//! authentication state machine and result normalization. No IO.
mod auth_state;
mod bucket;
mod descriptor;
mod error;
mod normalize;
mod query;
mod raw;
mod registry;
mod result;
mod session;

pub use auth_state::{AuthEvent, AuthState};
pub use bucket::{RateBudget, TokenBucket};
pub use descriptor::{
    ApiKeyMethod, AuthScenario, DescriptorError, ExtractionRules, FixedField, Indicator, LoginFlow,
    PluginDescriptor, QueryAction, RateLimit, QUERY_PLACEHOLDER,
};
pub use error::{Phase, PortalError};
pub use normalize::{normalize, truncate_chars};
pub use query::{FormatHint, QueryRequest, MAX_QUERY_CHARS};
pub use raw::{RawNode, RawPage};
pub use registry::{PluginInfo, PluginRegistry};
pub use result::{QueryResult, Record, ResultKind};
pub use session::{Clock, ManualClock, Session, SessionStatus, StateBlob, SystemClock};
