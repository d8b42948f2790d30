//! Sync orchestrator.
//!
//! Runs one pass over every configured (account, calendar) pair, fans the
//! fetches out with bounded concurrency, then applies the aggregated
//! change-set to the local store and persists continuation tokens at a
//! single point. A calendar that fails is recorded in the pass summary and
//! its token left untouched, so the next pass retries from the same
//! position; one bad calendar never aborts the pass.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::calendar::{ident, CalendarEvent};
use crate::storage::cursor::{SyncCursor, SyncCursorStore};
use crate::storage::store::{LocalEventStore, StoreError};
use crate::sync::provider::{
    ApiError, DisplayNameResolver, IncrementalFetch, ProviderClient, TimeRange,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StoreError),
    #[error("Task error: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

/// One provider account wired into the orchestrator.
pub struct SyncAccount {
    pub account_id: String,
    pub provider: Arc<dyn ProviderClient>,
}

/// Everything one pass changed, aggregated across accounts before any of it
/// touches the store.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub changed: Vec<CalendarEvent>,
    pub deleted_ids: Vec<String>,
    pub updated_cursors: HashMap<String, SyncCursor>,
}

#[derive(Debug, Clone)]
pub struct CalendarFailure {
    pub cursor_key: String,
    pub error: String,
    pub transient: bool,
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub synced: usize,
    pub failed: usize,
    pub changed_events: usize,
    pub deleted_events: usize,
    pub full_syncs: usize,
    pub failures: Vec<CalendarFailure>,
}

enum Outcome {
    Unchanged,
    Delta {
        changed: Vec<CalendarEvent>,
        deleted_ids: Vec<String>,
        next_token: Option<String>,
        was_full: bool,
    },
    Failed(ApiError),
}

pub struct SyncOrchestrator {
    accounts: Vec<SyncAccount>,
    events: Arc<dyn LocalEventStore>,
    cursors: Arc<dyn SyncCursorStore>,
    resolver: Option<Arc<dyn DisplayNameResolver>>,
    max_concurrent: usize,
    past_days: i64,
    future_days: i64,
}

impl SyncOrchestrator {
    pub fn new(
        accounts: Vec<SyncAccount>,
        events: Arc<dyn LocalEventStore>,
        cursors: Arc<dyn SyncCursorStore>,
    ) -> Self {
        Self {
            accounts,
            events,
            cursors,
            resolver: None,
            max_concurrent: 4,
            past_days: 90,
            future_days: 365,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DisplayNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_window(mut self, past_days: i64, future_days: i64) -> Self {
        self.past_days = past_days;
        self.future_days = future_days;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Drop every cursor so the next pass does a full sync of everything.
    pub fn clear_cursors(&self) -> Result<(), SyncError> {
        self.cursors.clear_all()?;
        Ok(())
    }

    fn window(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange::new(
            now - chrono::Duration::days(self.past_days),
            now + chrono::Duration::days(self.future_days),
        )
    }

    pub async fn sync_pass(&self) -> Result<PassSummary, SyncError> {
        let now = Utc::now();
        let window = self.window(now);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<(String, Outcome)> = JoinSet::new();

        for account in &self.accounts {
            let calendars = match account.provider.list_calendars(&account.account_id).await {
                Ok(calendars) => calendars,
                Err(e) => {
                    tracing::error!(
                        "Listing calendars for {} failed: {}",
                        account.account_id,
                        e
                    );
                    tasks.spawn({
                        let key = ident::make(Some(&account.account_id), "*", None);
                        async move { (key, Outcome::Failed(e)) }
                    });
                    continue;
                }
            };

            for calendar in calendars {
                let cursor_key = ident::make(Some(&account.account_id), &calendar.id, None);
                let provider = Arc::clone(&account.provider);
                let cursors = Arc::clone(&self.cursors);
                let semaphore = Arc::clone(&semaphore);
                let calendar_id = calendar.id;

                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let outcome =
                        sync_calendar(provider.as_ref(), cursors.as_ref(), &cursor_key, &calendar_id, window)
                            .await;
                    (cursor_key, outcome)
                });
            }
        }

        // Single aggregation point: cursor and store writes happen only here.
        let mut summary = PassSummary::default();
        let mut change_set = ChangeSet::default();
        let mut full_synced_keys = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let (cursor_key, outcome) = joined?;
            match outcome {
                Outcome::Unchanged => {
                    summary.synced += 1;
                }
                Outcome::Delta {
                    changed,
                    deleted_ids,
                    next_token,
                    was_full,
                } => {
                    summary.synced += 1;
                    if was_full {
                        summary.full_syncs += 1;
                        full_synced_keys.push(cursor_key.clone());
                    }
                    change_set.changed.extend(changed);
                    change_set.deleted_ids.extend(deleted_ids);
                    change_set.updated_cursors.insert(
                        cursor_key,
                        SyncCursor {
                            token: next_token,
                            last_full_sync_at: was_full.then_some(now),
                        },
                    );
                }
                Outcome::Failed(error) => {
                    summary.failed += 1;
                    tracing::warn!("Calendar {} failed: {}", cursor_key, error);
                    summary.failures.push(CalendarFailure {
                        cursor_key,
                        error: error.to_string(),
                        transient: error.is_transient(),
                    });
                }
            }
        }

        if let Some(ref resolver) = self.resolver {
            enrich_display_names(&mut change_set.changed, resolver.as_ref());
        }

        // A full sync replaces the calendar wholesale, so anything stored for
        // it that the fetch did not return is stale.
        if !full_synced_keys.is_empty() {
            let fetched: std::collections::HashSet<&str> =
                change_set.changed.iter().map(|e| e.id.as_str()).collect();
            for stored in self.events.get_all()? {
                let key = ident::make(
                    stored.account_id.as_deref(),
                    &stored.calendar_id,
                    None,
                );
                if full_synced_keys.contains(&key) && !fetched.contains(stored.id.as_str()) {
                    change_set.deleted_ids.push(stored.id);
                }
            }
        }

        summary.changed_events = change_set.changed.len();
        summary.deleted_events = change_set.deleted_ids.len();

        self.events.upsert(&change_set.changed)?;
        self.events.delete(&change_set.deleted_ids)?;
        for (key, cursor) in &change_set.updated_cursors {
            // Keep an earlier full-sync stamp when this pass was incremental.
            let stamped = if cursor.last_full_sync_at.is_none() {
                SyncCursor {
                    token: cursor.token.clone(),
                    last_full_sync_at: self.cursors.get(key)?.last_full_sync_at,
                }
            } else {
                cursor.clone()
            };
            self.cursors.set(key, &stamped)?;
        }

        tracing::info!(
            "Sync pass: {} synced, {} failed, {} changed, {} deleted, {} full",
            summary.synced,
            summary.failed,
            summary.changed_events,
            summary.deleted_events,
            summary.full_syncs,
        );
        Ok(summary)
    }
}

/// One calendar's fetch. No token means first sync; a REST sentinel
/// escalates to a full sync within the same pass; CalDAV handles its own
/// ctag refetch and surfaces it as an ordinary delta.
async fn sync_calendar(
    provider: &dyn ProviderClient,
    cursors: &dyn SyncCursorStore,
    cursor_key: &str,
    calendar_id: &str,
    window: TimeRange,
) -> Outcome {
    let cursor = match cursors.get(cursor_key) {
        Ok(cursor) => cursor,
        Err(e) => {
            return Outcome::Failed(ApiError::RequestError(format!("cursor read failed: {e}")))
        }
    };

    let Some(token) = cursor.token else {
        return full_sync(provider, calendar_id, window).await;
    };

    match provider.fetch_incremental(calendar_id, &token).await {
        Ok(IncrementalFetch::Unchanged { .. }) => Outcome::Unchanged,
        Ok(IncrementalFetch::Changed {
            changed,
            deleted_ids,
            next_token,
        }) => Outcome::Delta {
            changed,
            deleted_ids,
            next_token,
            was_full: false,
        },
        Ok(IncrementalFetch::FullSyncRequired) => {
            tracing::info!("Continuation token for {} expired, running full sync", cursor_key);
            full_sync(provider, calendar_id, window).await
        }
        Err(e) => Outcome::Failed(e),
    }
}

async fn full_sync(
    provider: &dyn ProviderClient,
    calendar_id: &str,
    window: TimeRange,
) -> Outcome {
    match provider.fetch_all(calendar_id, window).await {
        Ok(fetch) => Outcome::Delta {
            changed: fetch.events,
            deleted_ids: Vec::new(),
            next_token: fetch.continuation_token,
            was_full: true,
        },
        Err(e) => Outcome::Failed(e),
    }
}

fn enrich_display_names(events: &mut [CalendarEvent], resolver: &dyn DisplayNameResolver) {
    for event in events {
        for attendee in &mut event.attendees {
            if attendee.display_name.is_none() {
                attendee.display_name = resolver.resolve(&attendee.email);
            }
        }
        if let Some(ref mut organizer) = event.organizer {
            if organizer.display_name.is_none() {
                organizer.display_name = resolver.resolve(&organizer.email);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{
        AccessRole, Attendee, Calendar, CalendarEvent, EventStatus, EventTime,
    };
    use crate::freebusy::BusyPeriod;
    use crate::storage::cursor::SqliteCursorStore;
    use crate::storage::store::SqliteEventStore;
    use crate::sync::provider::{FullFetch, UpdateScope};
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use rusqlite::Connection;

    mock! {
        pub Provider {}

        #[async_trait]
        impl ProviderClient for Provider {
            async fn list_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, ApiError>;
            async fn fetch_all(&self, calendar_id: &str, range: TimeRange) -> Result<FullFetch, ApiError>;
            async fn fetch_incremental(&self, calendar_id: &str, token: &str) -> Result<IncrementalFetch, ApiError>;
            async fn create(&self, calendar_id: &str, event: &CalendarEvent) -> Result<CalendarEvent, ApiError>;
            async fn update(&self, event_id: &str, event: &CalendarEvent, scope: UpdateScope) -> Result<CalendarEvent, ApiError>;
            async fn delete(&self, event_id: &str, scope: UpdateScope) -> Result<(), ApiError>;
            async fn free_busy(&self, calendar_ids: &[String], range: TimeRange) -> Result<Vec<BusyPeriod>, ApiError>;
        }
    }

    const ACCOUNT: &str = "a@example.com";

    fn test_calendar(id: &str) -> Calendar {
        Calendar {
            id: id.to_string(),
            name: id.to_string(),
            color: None,
            is_primary: false,
            access_role: AccessRole::Owner,
        }
    }

    fn test_event(native: &str, calendar: &str) -> CalendarEvent {
        let start = Utc::now();
        CalendarEvent {
            id: ident::make(Some(ACCOUNT), native, Some(calendar)),
            account_id: Some(ACCOUNT.to_string()),
            calendar_id: calendar.to_string(),
            summary: format!("Event {native}"),
            description: None,
            location: None,
            status: EventStatus::Confirmed,
            start: EventTime::Utc(start),
            end: EventTime::Utc(start + chrono::Duration::hours(1)),
            recurrence_rules: None,
            recurring_event_id: None,
            attendees: vec![],
            organizer: None,
            conference_link: None,
            created_at: None,
            updated_at: None,
        }
    }

    struct Fixture {
        events: Arc<SqliteEventStore>,
        cursors: Arc<SqliteCursorStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let events = SqliteEventStore::new(Connection::open_in_memory().unwrap());
            events.initialize().unwrap();
            let cursors = SqliteCursorStore::new(Connection::open_in_memory().unwrap());
            cursors.initialize().unwrap();
            Self {
                events: Arc::new(events),
                cursors: Arc::new(cursors),
            }
        }

        fn orchestrator(&self, provider: MockProvider) -> SyncOrchestrator {
            SyncOrchestrator::new(
                vec![SyncAccount {
                    account_id: ACCOUNT.to_string(),
                    provider: Arc::new(provider),
                }],
                Arc::clone(&self.events) as Arc<dyn LocalEventStore>,
                Arc::clone(&self.cursors) as Arc<dyn SyncCursorStore>,
            )
        }

        fn cursor_key(&self, calendar: &str) -> String {
            ident::make(Some(ACCOUNT), calendar, None)
        }
    }

    #[tokio::test]
    async fn first_sync_is_full_and_stores_token() {
        let fixture = Fixture::new();
        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        provider.expect_fetch_all().times(1).returning(|_, _| {
            Ok(FullFetch {
                events: vec![test_event("ev1", "work")],
                continuation_token: Some("tok-1".to_string()),
            })
        });

        let summary = fixture.orchestrator(provider).sync_pass().await.unwrap();

        assert_eq!(summary.synced, 1);
        assert_eq!(summary.full_syncs, 1);
        assert_eq!(summary.changed_events, 1);
        let cursor = fixture.cursors.get(&fixture.cursor_key("work")).unwrap();
        assert_eq!(cursor.token.as_deref(), Some("tok-1"));
        assert!(cursor.last_full_sync_at.is_some());
        assert_eq!(fixture.events.get_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_token_escalates_to_exactly_one_full_sync() {
        let fixture = Fixture::new();
        fixture
            .cursors
            .set(
                &fixture.cursor_key("work"),
                &SyncCursor {
                    token: Some("stale".to_string()),
                    last_full_sync_at: None,
                },
            )
            .unwrap();

        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        provider
            .expect_fetch_incremental()
            .with(eq("work"), eq("stale"))
            .times(1)
            .returning(|_, _| Ok(IncrementalFetch::FullSyncRequired));
        provider.expect_fetch_all().times(1).returning(|_, _| {
            Ok(FullFetch {
                events: vec![test_event("ev1", "work")],
                continuation_token: Some("fresh".to_string()),
            })
        });

        let summary = fixture.orchestrator(provider).sync_pass().await.unwrap();

        assert_eq!(summary.full_syncs, 1);
        let cursor = fixture.cursors.get(&fixture.cursor_key("work")).unwrap();
        assert_eq!(cursor.token.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn unchanged_calendar_touches_nothing() {
        let fixture = Fixture::new();
        let key = fixture.cursor_key("work");
        fixture
            .cursors
            .set(
                &key,
                &SyncCursor {
                    token: Some("tok-1".to_string()),
                    last_full_sync_at: None,
                },
            )
            .unwrap();

        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        provider
            .expect_fetch_incremental()
            .times(2)
            .returning(|_, token| {
                Ok(IncrementalFetch::Unchanged {
                    token: token.to_string(),
                })
            });

        let orchestrator = fixture.orchestrator(provider);
        for _ in 0..2 {
            let summary = orchestrator.sync_pass().await.unwrap();
            assert_eq!(summary.synced, 1);
            assert_eq!(summary.changed_events, 0);
        }

        assert_eq!(
            fixture.cursors.get(&key).unwrap().token.as_deref(),
            Some("tok-1")
        );
        assert!(fixture.events.is_empty().unwrap());
    }

    #[tokio::test]
    async fn failed_calendar_keeps_token_and_pass_continues() {
        let fixture = Fixture::new();
        let bad_key = fixture.cursor_key("bad");
        fixture
            .cursors
            .set(
                &bad_key,
                &SyncCursor {
                    token: Some("tok-bad".to_string()),
                    last_full_sync_at: None,
                },
            )
            .unwrap();

        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("bad"), test_calendar("good")]));
        provider
            .expect_fetch_incremental()
            .with(eq("bad"), eq("tok-bad"))
            .returning(|_, _| Err(ApiError::ServerError("boom".to_string())));
        provider
            .expect_fetch_all()
            .with(eq("good"), mockall::predicate::always())
            .returning(|_, _| {
                Ok(FullFetch {
                    events: vec![test_event("ev1", "good")],
                    continuation_token: Some("tok-good".to_string()),
                })
            });

        let summary = fixture.orchestrator(provider).sync_pass().await.unwrap();

        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].transient);
        assert_eq!(
            fixture.cursors.get(&bad_key).unwrap().token.as_deref(),
            Some("tok-bad")
        );
        assert_eq!(fixture.events.get_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incremental_deletions_are_applied() {
        let fixture = Fixture::new();
        let gone = test_event("gone", "work");
        fixture.events.upsert(&[gone.clone()]).unwrap();
        fixture
            .cursors
            .set(
                &fixture.cursor_key("work"),
                &SyncCursor {
                    token: Some("tok-1".to_string()),
                    last_full_sync_at: None,
                },
            )
            .unwrap();

        let gone_id = gone.id.clone();
        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        provider
            .expect_fetch_incremental()
            .returning(move |_, _| {
                Ok(IncrementalFetch::Changed {
                    changed: vec![],
                    deleted_ids: vec![gone_id.clone()],
                    next_token: Some("tok-2".to_string()),
                })
            });

        let summary = fixture.orchestrator(provider).sync_pass().await.unwrap();

        assert_eq!(summary.deleted_events, 1);
        assert!(fixture.events.is_empty().unwrap());
    }

    #[tokio::test]
    async fn full_sync_drops_stale_events_for_that_calendar() {
        let fixture = Fixture::new();
        let stale = test_event("stale", "work");
        let elsewhere = test_event("kept", "home");
        fixture
            .events
            .upsert(&[stale.clone(), elsewhere.clone()])
            .unwrap();

        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        provider.expect_fetch_all().returning(|_, _| {
            Ok(FullFetch {
                events: vec![test_event("fresh", "work")],
                continuation_token: Some("tok-1".to_string()),
            })
        });

        fixture.orchestrator(provider).sync_pass().await.unwrap();

        let remaining: Vec<String> = fixture
            .events
            .get_all()
            .unwrap()
            .into_iter()
            .map(|e| e.native_id().to_string())
            .collect();
        assert!(remaining.contains(&"fresh".to_string()));
        assert!(remaining.contains(&"kept".to_string()));
        assert!(!remaining.contains(&"stale".to_string()));
    }

    struct UpcaseResolver;

    impl DisplayNameResolver for UpcaseResolver {
        fn resolve(&self, email: &str) -> Option<String> {
            email.split('@').next().map(str::to_uppercase)
        }
    }

    #[tokio::test]
    async fn attendee_names_are_enriched_best_effort() {
        let fixture = Fixture::new();
        let mut event = test_event("ev1", "work");
        event.attendees = vec![
            Attendee::new("bob@example.com"),
            Attendee {
                email: "carol@example.com".to_string(),
                display_name: Some("Carol".to_string()),
                ..Attendee::new("carol@example.com")
            },
        ];

        let mut provider = MockProvider::new();
        provider
            .expect_list_calendars()
            .returning(|_| Ok(vec![test_calendar("work")]));
        let fetched = event.clone();
        provider.expect_fetch_all().returning(move |_, _| {
            Ok(FullFetch {
                events: vec![fetched.clone()],
                continuation_token: None,
            })
        });

        let orchestrator = fixture
            .orchestrator(provider)
            .with_resolver(Arc::new(UpcaseResolver));
        orchestrator.sync_pass().await.unwrap();

        let stored = fixture.events.get_all().unwrap();
        assert_eq!(stored[0].attendees[0].display_name.as_deref(), Some("BOB"));
        // Names the provider already supplied are left alone.
        assert_eq!(stored[0].attendees[1].display_name.as_deref(), Some("Carol"));
    }
}
