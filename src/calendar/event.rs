use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::calendar::ident;

/// Start or end of an event: a civil date for all-day events, an instant for
/// UTC-timed events, or a civil time pinned to an IANA zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    Date(NaiveDate),
    Utc(DateTime<Utc>),
    Zoned { local: NaiveDateTime, tzid: String },
}

impl EventTime {
    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// Resolve to an instant. All-day dates resolve to midnight UTC; an
    /// unrecognized TZID falls back to reading the civil time as UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            EventTime::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .map(|ndt| ndt.and_utc())
                .unwrap_or_else(Utc::now),
            EventTime::Utc(dt) => *dt,
            EventTime::Zoned { local, tzid } => match tzid.parse::<Tz>() {
                Ok(tz) => tz
                    .from_local_datetime(local)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| local.and_utc()),
                Err(_) => {
                    tracing::warn!("Unknown TZID '{}', treating as UTC", tzid);
                    local.and_utc()
                }
            },
        }
    }

    /// Shift forward, preserving the encoding: all-day stays all-day (whole
    /// days only), UTC stays UTC, zoned stays in the same zone.
    pub fn plus(&self, duration: Duration) -> EventTime {
        match self {
            EventTime::Date(d) => EventTime::Date(
                d.checked_add_days(chrono::Days::new(duration.num_days().max(0) as u64))
                    .unwrap_or(*d),
            ),
            EventTime::Utc(dt) => EventTime::Utc(*dt + duration),
            EventTime::Zoned { local, tzid } => EventTime::Zoned {
                local: *local + duration,
                tzid: tzid.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Accepted,
    Declined,
    Tentative,
    NeedsAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub display_name: Option<String>,
    pub response_status: Option<ResponseStatus>,
    pub is_self: bool,
    pub is_organizer: bool,
}

impl Attendee {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            display_name: None,
            response_status: None,
            is_self: false,
            is_organizer: false,
        }
    }
}

/// Canonical event shape shared by every provider. `id` is the composite
/// identity and is unique across all connected accounts and calendars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub account_id: Option<String>,
    pub calendar_id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub status: EventStatus,
    pub start: EventTime,
    pub end: EventTime,
    pub recurrence_rules: Option<Vec<String>>,
    pub recurring_event_id: Option<String>,
    pub attendees: Vec<Attendee>,
    pub organizer: Option<Attendee>,
    pub conference_link: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// The provider-native id, recovered from the composite id.
    pub fn native_id(&self) -> &str {
        ident::native_id(&self.id)
    }

    pub fn is_all_day(&self) -> bool {
        self.start.is_all_day()
    }

    pub fn overlaps(&self, other: &CalendarEvent) -> bool {
        self.start.to_utc() < other.end.to_utc() && other.start.to_utc() < self.end.to_utc()
    }
}
