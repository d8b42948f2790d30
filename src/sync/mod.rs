pub mod auth;
pub mod caldav;
pub mod engine;
pub mod provider;
pub mod rest;

pub use auth::{AuthError, BearerTokenSource, CalDavCredentialSource, OAuthTokenSource};
pub use caldav::{CalDavClientRegistry, CalDavProvider, SyncWindow};
pub use engine::{ChangeSet, PassSummary, SyncAccount, SyncError, SyncOrchestrator};
pub use provider::{
    ApiError, DisplayNameResolver, FullFetch, IncrementalFetch, ProviderClient, TimeRange,
    UpdateScope,
};
pub use rest::RestCalendarProvider;
