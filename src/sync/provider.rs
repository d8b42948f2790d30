use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::calendar::{Calendar, CalendarEvent};
use crate::freebusy::BusyPeriod;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Request error: {0}")]
    RequestError(String),
    #[error("Server error: {0}")]
    ServerError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid event: {0}")]
    Validation(String),
}

impl ApiError {
    /// Timeouts, connection drops, and 5xx responses are retried on the next
    /// pass; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::HttpError(e) => e.is_timeout() || e.is_connect(),
            ApiError::ServerError(_) | ApiError::RateLimited => true,
            _ => false,
        }
    }
}

/// Half-open time range for event queries.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Result of a full listing: every current event plus the continuation token
/// to hand to the next incremental call.
#[derive(Debug)]
pub struct FullFetch {
    pub events: Vec<CalendarEvent>,
    pub continuation_token: Option<String>,
}

/// Result of an incremental listing. Escalation and provider-internal
/// refetch are expressed as data, never as errors.
#[derive(Debug)]
pub enum IncrementalFetch {
    /// Nothing changed server-side; the token stays valid.
    Unchanged { token: String },
    /// Changed and deleted objects since the token, plus its replacement.
    Changed {
        changed: Vec<CalendarEvent>,
        deleted_ids: Vec<String>,
        next_token: Option<String>,
    },
    /// The token is no longer valid server-side and the caller must run a
    /// full sync for this calendar.
    FullSyncRequired,
}

/// Which instances of a recurring series a mutation applies to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateScope {
    ThisInstance,
    ThisAndFollowing,
    AllInSeries,
}

/// Capability set shared by every calendar backend.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn list_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, ApiError>;

    async fn fetch_all(&self, calendar_id: &str, range: TimeRange) -> Result<FullFetch, ApiError>;

    async fn fetch_incremental(
        &self,
        calendar_id: &str,
        token: &str,
    ) -> Result<IncrementalFetch, ApiError>;

    async fn create(
        &self,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ApiError>;

    async fn update(
        &self,
        event_id: &str,
        event: &CalendarEvent,
        scope: UpdateScope,
    ) -> Result<CalendarEvent, ApiError>;

    async fn delete(&self, event_id: &str, scope: UpdateScope) -> Result<(), ApiError>;

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        range: TimeRange,
    ) -> Result<Vec<BusyPeriod>, ApiError>;
}

/// Best-effort display-name lookup used to enrich attendees after a pass.
pub trait DisplayNameResolver: Send + Sync {
    fn resolve(&self, email: &str) -> Option<String>;
}
