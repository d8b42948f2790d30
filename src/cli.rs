use std::{env, io, path::PathBuf, sync::Arc};

use chrono::{Local, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::Connection;

use calsync::calendar::CalendarEvent;
use calsync::freebusy::{find_free_slots, BusyPeriod, FreeSlotOptions};
use calsync::storage::config::{AccountConfig, AccountKind, Config};
use calsync::storage::cursor::{SqliteCursorStore, SyncCursorStore};
use calsync::storage::store::{LocalEventStore, SqliteEventStore};
use calsync::sync::auth::{AuthError, CalDavCredentialSource, CalDavCredentials, OAuthConfig, OAuthTokenSource};
use calsync::sync::caldav::{CalDavClientRegistry, CalDavProvider, SyncWindow};
use calsync::sync::engine::{SyncAccount, SyncOrchestrator};
use calsync::sync::provider::ProviderClient;
use calsync::sync::rest::RestCalendarProvider;

const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

#[derive(Clone, Copy)]
pub enum CliMode {
    Sync { full_refresh: bool },
    FreeSlots(NaiveDate),
}

pub fn parse_cli_mode() -> Result<CliMode, String> {
    let mut full_refresh = false;
    let mut free_slots_date = None;
    let mut args = env::args().skip(1).peekable();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync" => {}
            "--full-refresh" => {
                full_refresh = true;
            }
            "--free-slots" => {
                let target_date = if let Some(next) = args.peek() {
                    if !next.starts_with("--") {
                        let date_str = args.next().expect("peeked value must exist");
                        NaiveDate::parse_from_str(&date_str, "%Y/%m/%d")
                            .map_err(|_| format!("Invalid date '{}'. Use YYYY/MM/DD.", date_str))?
                    } else {
                        Local::now().date_naive()
                    }
                } else {
                    Local::now().date_naive()
                };
                free_slots_date = Some(target_date);
            }
            "--help" => {
                println!("Usage: calsync [--sync] [--full-refresh] [--free-slots [YYYY/MM/DD]]");
                std::process::exit(0);
            }
            _ => return Err(format!("Unknown argument: {}", arg)),
        }
    }

    if let Some(date) = free_slots_date {
        Ok(CliMode::FreeSlots(date))
    } else {
        Ok(CliMode::Sync { full_refresh })
    }
}

/// CalDAV credentials looked up from the accounts list in config.
struct ConfigCredentials {
    accounts: Vec<AccountConfig>,
}

impl CalDavCredentialSource for ConfigCredentials {
    fn credentials(&self, account_id: &str) -> Result<CalDavCredentials, AuthError> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.id == account_id && a.kind == AccountKind::Caldav)
            .ok_or_else(|| AuthError::NoCredentials(account_id.to_string()))?;

        match (&account.server_url, &account.username, &account.password) {
            (Some(server_url), Some(username), Some(password)) => Ok(CalDavCredentials {
                server_url: server_url.clone(),
                username: username.clone(),
                secret: password.clone(),
            }),
            _ => Err(AuthError::NoCredentials(account_id.to_string())),
        }
    }
}

fn default_token_cache(account_id: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calsync")
        .join(format!("{account_id}.token.json"))
}

fn build_provider(
    account: &AccountConfig,
    config: &Config,
    registry: &Arc<CalDavClientRegistry>,
) -> Arc<dyn ProviderClient> {
    match account.kind {
        AccountKind::Rest => {
            let oauth = OAuthConfig {
                client_id: account.client_id.clone().unwrap_or_default(),
                client_secret: account.client_secret.clone().unwrap_or_default(),
                token_endpoint: GOOGLE_TOKEN_ENDPOINT.to_string(),
                token_cache: account
                    .token_cache
                    .clone()
                    .unwrap_or_else(|| default_token_cache(&account.id)),
            };
            let tokens = Arc::new(OAuthTokenSource::new(account.id.clone(), oauth));
            let mut provider = RestCalendarProvider::new(account.id.clone(), tokens)
                .with_conference_links(account.request_conference_links);
            if let Some(ref base_url) = account.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(provider)
        }
        AccountKind::Caldav => Arc::new(CalDavProvider::new(
            account.id.clone(),
            Arc::clone(registry),
            SyncWindow {
                past_days: config.sync.sync_past_days as i64,
                future_days: config.sync.sync_future_days as i64,
            },
        )),
    }
}

fn open_stores() -> Result<(Arc<SqliteEventStore>, Arc<SqliteCursorStore>), io::Error> {
    let db_path = Config::database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let events = SqliteEventStore::new(
        Connection::open(&db_path).map_err(|e| io::Error::other(e.to_string()))?,
    );
    events
        .initialize()
        .map_err(|e| io::Error::other(e.to_string()))?;

    let cursors = SqliteCursorStore::new(
        Connection::open(&db_path).map_err(|e| io::Error::other(e.to_string()))?,
    );
    cursors
        .initialize()
        .map_err(|e| io::Error::other(e.to_string()))?;

    Ok((Arc::new(events), Arc::new(cursors)))
}

pub async fn run_sync_mode(full_refresh: bool) -> Result<(), io::Error> {
    let config = Config::load_or_create().map_err(|e| io::Error::other(e.to_string()))?;
    if config.accounts.is_empty() {
        println!(
            "No accounts configured. Add [[accounts]] entries to {}",
            Config::config_path().display()
        );
        return Ok(());
    }

    let (events, cursors) = open_stores()?;
    let registry = Arc::new(CalDavClientRegistry::new(Arc::new(ConfigCredentials {
        accounts: config.accounts.clone(),
    })));

    let accounts = config
        .accounts
        .iter()
        .map(|account| SyncAccount {
            account_id: account.id.clone(),
            provider: build_provider(account, &config, &registry),
        })
        .collect();

    let orchestrator = SyncOrchestrator::new(
        accounts,
        Arc::clone(&events) as Arc<dyn LocalEventStore>,
        Arc::clone(&cursors) as Arc<dyn SyncCursorStore>,
    )
    .with_window(
        config.sync.sync_past_days as i64,
        config.sync.sync_future_days as i64,
    )
    .with_max_concurrent(config.sync.max_concurrent_calendars);

    if full_refresh {
        orchestrator
            .clear_cursors()
            .map_err(|e| io::Error::other(e.to_string()))?;
        println!("Cleared sync state, running full refresh.");
    }

    match orchestrator.sync_pass().await {
        Ok(summary) => {
            println!(
                "Synced {} calendars ({} failed): {} changed, {} deleted, {} full syncs.",
                summary.synced,
                summary.failed,
                summary.changed_events,
                summary.deleted_events,
                summary.full_syncs,
            );
            for failure in &summary.failures {
                let retry = if failure.transient {
                    "will retry next pass"
                } else {
                    "needs attention"
                };
                eprintln!("  {} failed ({}): {}", failure.cursor_key, retry, failure.error);
            }
        }
        Err(e) => {
            eprintln!("Sync pass failed: {}", e);
            tracing::error!("Sync pass failed: {}", e);
        }
    }

    // Cached events are still useful after a failed pass.
    print_upcoming(events.as_ref())?;
    Ok(())
}

fn print_upcoming(store: &dyn LocalEventStore) -> Result<(), io::Error> {
    let now = Utc::now();
    let horizon = now + chrono::Duration::days(7);

    let mut upcoming: Vec<CalendarEvent> = store
        .get_all()
        .map_err(|e| io::Error::other(e.to_string()))?
        .into_iter()
        .filter(|e| e.end.to_utc() > now && e.start.to_utc() < horizon)
        .collect();
    upcoming.sort_by_key(|e| e.start.to_utc());

    println!();
    if upcoming.is_empty() {
        println!("No events in the next 7 days.");
        return Ok(());
    }

    println!("Next 7 days:");
    for event in upcoming {
        let line = if event.is_all_day() {
            format!(
                "  {}  All day       {}",
                event.start.to_utc().date_naive(),
                event.summary
            )
        } else {
            let start = event.start.to_utc().with_timezone(&Local);
            let end = event.end.to_utc().with_timezone(&Local);
            format!(
                "  {}  {}-{}  {}",
                start.format("%Y-%m-%d"),
                start.format("%H:%M"),
                end.format("%H:%M"),
                event.summary
            )
        };
        println!("{}", line);
    }
    Ok(())
}

pub async fn run_free_slots_mode(date: NaiveDate) -> Result<(), io::Error> {
    let config = Config::load_or_create().map_err(|e| io::Error::other(e.to_string()))?;
    let (events, _cursors) = open_stores()?;

    let day_start = local_to_utc(date, NaiveTime::from_hms_opt(0, 0, 0).expect("valid time"));
    let day_end = day_start + chrono::Duration::days(1);

    let busy: Vec<BusyPeriod> = events
        .get_all()
        .map_err(|e| io::Error::other(e.to_string()))?
        .iter()
        .filter(|e| !e.is_all_day() && e.status != calsync::calendar::EventStatus::Cancelled)
        .map(|e| BusyPeriod::new(e.start.to_utc(), e.end.to_utc()))
        .filter(|p| p.start < day_end && p.end > day_start)
        .collect();

    let opts = FreeSlotOptions {
        min_duration: chrono::Duration::minutes(config.scheduling.min_slot_minutes as i64),
        working_hours_start: NaiveTime::from_hms_opt(config.scheduling.work_start_hour, 0, 0)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(9, 0, 0).expect("valid time")),
        working_hours_end: NaiveTime::from_hms_opt(config.scheduling.work_end_hour, 0, 0)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(17, 0, 0).expect("valid time")),
        include_weekends: config.scheduling.include_weekends,
    };

    let slots = find_free_slots(&busy, day_start, day_end, Utc::now(), &opts);

    println!("Free slots on {}:", date.format("%A, %B %d, %Y"));
    if slots.is_empty() {
        println!("  None within working hours.");
        return Ok(());
    }
    for slot in slots {
        let start = slot.start.with_timezone(&Local);
        let end = slot.end.with_timezone(&Local);
        println!("  {}-{}", start.format("%H:%M"), end.format("%H:%M"));
    }
    Ok(())
}

fn local_to_utc(date: NaiveDate, time: NaiveTime) -> chrono::DateTime<Utc> {
    match Local.from_local_datetime(&date.and_time(time)) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => Utc.from_utc_datetime(&date.and_time(time)),
    }
}
