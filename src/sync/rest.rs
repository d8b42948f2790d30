//! Token-based REST calendar provider.
//!
//! Full listings paginate until exhausted (the server expands recurring
//! events into instances) and the sync token is captured only from the final
//! page. Incremental listings replay changes since a sync token; a 410 from
//! the server means the token aged out and is reported as
//! `IncrementalFetch::FullSyncRequired`, never as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::calendar::ident;
use crate::calendar::{
    AccessRole, Attendee, Calendar, CalendarEvent, EventStatus, EventTime, ResponseStatus,
};
use crate::freebusy::BusyPeriod;
use crate::sync::auth::BearerTokenSource;
use crate::sync::provider::{
    ApiError, FullFetch, IncrementalFetch, ProviderClient, TimeRange, UpdateScope,
};

pub struct RestCalendarProvider {
    base_url: String,
    account_id: String,
    tokens: Arc<dyn BearerTokenSource>,
    client: reqwest::Client,
    request_conference_links: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RestEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<RestEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<RestEventTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recurrence: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recurring_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attendees: Option<Vec<RestAttendee>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organizer: Option<RestAttendee>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hangout_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conference_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RestEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RestAttendee {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_status: Option<String>,
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    is_self: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organizer: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    items: Option<Vec<RestEvent>>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    items: Option<Vec<RestCalendarEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestCalendarEntry {
    id: String,
    summary: Option<String>,
    background_color: Option<String>,
    primary: Option<bool>,
    access_role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyResponse {
    calendars: Option<std::collections::HashMap<String, FreeBusyCalendar>>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyCalendar {
    busy: Option<Vec<FreeBusyInterval>>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyInterval {
    start: String,
    end: String,
}

impl RestCalendarProvider {
    pub fn new(account_id: impl Into<String>, tokens: Arc<dyn BearerTokenSource>) -> Self {
        Self {
            base_url: "https://www.googleapis.com/calendar/v3".to_string(),
            account_id: account_id.into(),
            tokens,
            client: reqwest::Client::new(),
            request_conference_links: false,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_conference_links(mut self, enabled: bool) -> Self {
        self.request_conference_links = enabled;
        self
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        self.tokens
            .bearer_token(&self.account_id)
            .await
            .map_err(|e| {
                tracing::error!("No bearer credential for {}: {}", self.account_id, e);
                ApiError::AuthenticationFailed
            })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, native_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(native_id)
        )
    }

    fn from_rest_event(&self, re: RestEvent, calendar_id: &str) -> Option<CalendarEvent> {
        let native_id = re.id?;
        let start = re.start.as_ref().and_then(convert_event_time)?;
        let end = re
            .end
            .as_ref()
            .and_then(convert_event_time)
            .unwrap_or_else(|| start.clone());

        let status = match re.status.as_deref() {
            Some("tentative") => EventStatus::Tentative,
            Some("cancelled") => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        };

        let attendees = re
            .attendees
            .unwrap_or_default()
            .into_iter()
            .filter_map(convert_attendee)
            .collect();

        let conference_link = re.hangout_link.or_else(|| {
            re.conference_data
                .as_ref()?
                .pointer("/entryPoints/0/uri")?
                .as_str()
                .map(str::to_string)
        });

        Some(CalendarEvent {
            id: ident::make(Some(&self.account_id), &native_id, Some(calendar_id)),
            account_id: Some(self.account_id.clone()),
            calendar_id: calendar_id.to_string(),
            summary: re.summary.unwrap_or_default(),
            description: re.description,
            location: re.location,
            status,
            start,
            end,
            recurrence_rules: re.recurrence.filter(|r| !r.is_empty()),
            recurring_event_id: re.recurring_event_id.map(|parent| {
                ident::make(Some(&self.account_id), &parent, Some(calendar_id))
            }),
            attendees,
            organizer: re.organizer.and_then(convert_attendee).map(|mut a| {
                a.is_organizer = true;
                a
            }),
            conference_link,
            created_at: re.created.as_deref().and_then(parse_rfc3339),
            updated_at: re.updated.as_deref().and_then(parse_rfc3339),
        })
    }

    fn to_rest_event(&self, event: &CalendarEvent) -> Result<RestEvent, ApiError> {
        if event.summary.is_empty() {
            return Err(ApiError::Validation("event summary is required".to_string()));
        }

        Ok(RestEvent {
            id: None,
            summary: Some(event.summary.clone()),
            description: event.description.clone(),
            location: event.location.clone(),
            status: Some(
                match event.status {
                    EventStatus::Confirmed => "confirmed",
                    EventStatus::Tentative => "tentative",
                    EventStatus::Cancelled => "cancelled",
                }
                .to_string(),
            ),
            start: Some(encode_event_time(&event.start)),
            end: Some(encode_event_time(&event.end)),
            recurrence: event.recurrence_rules.clone(),
            recurring_event_id: None,
            attendees: if event.attendees.is_empty() {
                None
            } else {
                Some(event.attendees.iter().map(encode_attendee).collect())
            },
            organizer: None,
            hangout_link: None,
            conference_data: if self.request_conference_links {
                Some(serde_json::json!({
                    "createRequest": { "requestId": uuid::Uuid::new_v4().to_string() }
                }))
            } else {
                None
            },
            created: None,
            updated: None,
        })
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status == 401 || status == 403 {
            tracing::error!("Authentication failed during {}", context);
            return Err(ApiError::AuthenticationFailed);
        }
        if status == 404 {
            return Err(ApiError::NotFound(context.to_string()));
        }
        if status == 429 {
            tracing::warn!("Rate limit exceeded during {}", context);
            return Err(ApiError::RateLimited);
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Server error during {}: {} {}", context, status, body);
            return Err(ApiError::ServerError(format!("Status {}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Request failed during {}: {} {}", context, status, body);
            return Err(ApiError::RequestError(format!("Status {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn fetch_page(
        &self,
        calendar_id: &str,
        query: &[(&str, String)],
    ) -> Result<(reqwest::StatusCode, Option<EventListResponse>), ApiError> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(self.events_url(calendar_id))
            .bearer_auth(&token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == 410 {
            return Ok((status, None));
        }
        let response = self.check_status(response, "event listing").await?;
        let page: EventListResponse = response.json().await?;
        Ok((status, Some(page)))
    }
}

#[async_trait]
impl ProviderClient for RestCalendarProvider {
    async fn list_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, ApiError> {
        if account_id != self.account_id {
            return Err(ApiError::AuthenticationFailed);
        }
        let token = self.bearer().await?;
        let url = format!("{}/users/me/calendarList", self.base_url);

        let response = self.client.get(&url).bearer_auth(&token).send().await?;
        let response = self.check_status(response, "calendar listing").await?;
        let list: CalendarListResponse = response.json().await?;

        Ok(list
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|entry| Calendar {
                name: entry.summary.unwrap_or_else(|| entry.id.clone()),
                color: entry.background_color,
                is_primary: entry.primary.unwrap_or(false),
                access_role: match entry.access_role.as_deref() {
                    Some("owner") => AccessRole::Owner,
                    Some("writer") => AccessRole::Writer,
                    _ => AccessRole::Reader,
                },
                id: entry.id,
            })
            .collect())
    }

    async fn fetch_all(&self, calendar_id: &str, range: TimeRange) -> Result<FullFetch, ApiError> {
        let time_min = range.start.to_rfc3339();
        let time_max = range.end.to_rfc3339();

        tracing::info!(
            "Full fetch of {} from {} to {}",
            calendar_id,
            time_min,
            time_max
        );

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut sync_token = None;

        loop {
            let mut query = vec![
                ("timeMin", time_min.clone()),
                ("timeMax", time_max.clone()),
                ("singleEvents", "true".to_string()),
            ];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let (_, page) = self.fetch_page(calendar_id, &query).await?;
            let page = page.ok_or_else(|| {
                ApiError::RequestError("unexpected 410 during full listing".to_string())
            })?;

            for item in page.items.unwrap_or_default() {
                if let Some(event) = self.from_rest_event(item, calendar_id) {
                    events.push(event);
                }
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    // The sync token only appears on the final page.
                    sync_token = page.next_sync_token;
                    break;
                }
            }
        }

        tracing::info!("Fetched {} events from {}", events.len(), calendar_id);
        Ok(FullFetch {
            events,
            continuation_token: sync_token,
        })
    }

    async fn fetch_incremental(
        &self,
        calendar_id: &str,
        token: &str,
    ) -> Result<IncrementalFetch, ApiError> {
        let mut changed = Vec::new();
        let mut deleted_ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut next_token = None;

        loop {
            let mut query = vec![("syncToken", token.to_string())];
            if let Some(ref page) = page_token {
                query.push(("pageToken", page.clone()));
            }

            let (status, page) = self.fetch_page(calendar_id, &query).await?;
            let Some(page) = page else {
                // 410 Gone: the stored token aged out server-side.
                tracing::info!("Sync token for {} expired (status {})", calendar_id, status);
                return Ok(IncrementalFetch::FullSyncRequired);
            };

            for item in page.items.unwrap_or_default() {
                // Cancelled items in an incremental feed are deletions.
                if item.status.as_deref() == Some("cancelled") {
                    if let Some(native) = item.id {
                        deleted_ids.push(ident::make(
                            Some(&self.account_id),
                            &native,
                            Some(calendar_id),
                        ));
                    }
                    continue;
                }
                if let Some(event) = self.from_rest_event(item, calendar_id) {
                    changed.push(event);
                }
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    next_token = page.next_sync_token;
                    break;
                }
            }
        }

        if changed.is_empty() && deleted_ids.is_empty() {
            return Ok(IncrementalFetch::Unchanged {
                token: next_token.unwrap_or_else(|| token.to_string()),
            });
        }

        tracing::info!(
            "Incremental fetch of {}: {} changed, {} deleted",
            calendar_id,
            changed.len(),
            deleted_ids.len()
        );
        Ok(IncrementalFetch::Changed {
            changed,
            deleted_ids,
            next_token,
        })
    }

    async fn create(
        &self,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ApiError> {
        let token = self.bearer().await?;
        let body = self.to_rest_event(event)?;

        let mut request = self
            .client
            .post(self.events_url(calendar_id))
            .bearer_auth(&token)
            .json(&body);
        if self.request_conference_links {
            request = request.query(&[("conferenceDataVersion", "1")]);
        }

        let response = request.send().await?;
        let response = self.check_status(response, "event creation").await?;
        let created: RestEvent = response.json().await?;

        self.from_rest_event(created, calendar_id)
            .ok_or_else(|| ApiError::ParseError("create response missing event id".to_string()))
    }

    async fn update(
        &self,
        event_id: &str,
        event: &CalendarEvent,
        scope: UpdateScope,
    ) -> Result<CalendarEvent, ApiError> {
        let token = self.bearer().await?;
        let calendar_id = ident::calendar_id(event_id)
            .ok_or_else(|| ApiError::Validation("event id lacks a calendar".to_string()))?
            .to_string();
        let native = scoped_native_id(ident::native_id(event_id), scope);
        let body = self.to_rest_event(event)?;

        tracing::info!("Updating event {} in {}", native, calendar_id);

        let mut request = self
            .client
            .patch(self.event_url(&calendar_id, native))
            .bearer_auth(&token)
            .json(&body);
        if self.request_conference_links {
            request = request.query(&[("conferenceDataVersion", "1")]);
        }

        let response = request.send().await?;
        let response = self.check_status(response, "event update").await?;
        let updated: RestEvent = response.json().await?;

        self.from_rest_event(updated, &calendar_id)
            .ok_or_else(|| ApiError::ParseError("update response missing event id".to_string()))
    }

    async fn delete(&self, event_id: &str, scope: UpdateScope) -> Result<(), ApiError> {
        let token = self.bearer().await?;
        let calendar_id = ident::calendar_id(event_id)
            .ok_or_else(|| ApiError::Validation("event id lacks a calendar".to_string()))?
            .to_string();
        let native = scoped_native_id(ident::native_id(event_id), scope);

        tracing::info!("Deleting event {} in {}", native, calendar_id);

        let response = self
            .client
            .delete(self.event_url(&calendar_id, native))
            .bearer_auth(&token)
            .send()
            .await?;
        self.check_status(response, "event deletion").await?;
        Ok(())
    }

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        range: TimeRange,
    ) -> Result<Vec<BusyPeriod>, ApiError> {
        let token = self.bearer().await?;
        let url = format!("{}/freeBusy", self.base_url);
        let body = serde_json::json!({
            "timeMin": range.start.to_rfc3339(),
            "timeMax": range.end.to_rfc3339(),
            "items": calendar_ids.iter().map(|id| serde_json::json!({ "id": id })).collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let response = self.check_status(response, "free/busy query").await?;
        let parsed: FreeBusyResponse = response.json().await?;

        let mut periods = Vec::new();
        for calendar in parsed.calendars.unwrap_or_default().into_values() {
            for interval in calendar.busy.unwrap_or_default() {
                if let (Some(start), Some(end)) =
                    (parse_rfc3339(&interval.start), parse_rfc3339(&interval.end))
                {
                    periods.push(BusyPeriod::new(start, end));
                }
            }
        }
        Ok(periods)
    }
}

/// `AllInSeries` operates on the recurrence master: instance ids carry a
/// `_<timestamp>` suffix appended to the master id.
fn scoped_native_id(native: &str, scope: UpdateScope) -> &str {
    if scope != UpdateScope::AllInSeries {
        return native;
    }
    match native.rsplit_once('_') {
        Some((master, suffix))
            if suffix.len() >= 8 && suffix.bytes().all(|b| b.is_ascii_digit() || b == b'T' || b == b'Z') =>
        {
            master
        }
        _ => native,
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn convert_event_time(rt: &RestEventTime) -> Option<EventTime> {
    if let Some(ref date) = rt.date {
        let parsed = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        return Some(EventTime::Date(parsed));
    }

    let instant = parse_rfc3339(rt.date_time.as_deref()?)?;
    match rt.time_zone.as_deref().and_then(|tz| tz.parse::<Tz>().ok()) {
        Some(tz) => Some(EventTime::Zoned {
            local: instant.with_timezone(&tz).naive_local(),
            tzid: tz.name().to_string(),
        }),
        None => Some(EventTime::Utc(instant)),
    }
}

fn encode_event_time(time: &EventTime) -> RestEventTime {
    match time {
        EventTime::Date(d) => RestEventTime {
            date: Some(d.format("%Y-%m-%d").to_string()),
            ..Default::default()
        },
        EventTime::Utc(dt) => RestEventTime {
            date_time: Some(dt.to_rfc3339()),
            ..Default::default()
        },
        EventTime::Zoned { .. } => RestEventTime {
            date_time: Some(time.to_utc().to_rfc3339()),
            time_zone: match time {
                EventTime::Zoned { tzid, .. } => Some(tzid.clone()),
                _ => None,
            },
            ..Default::default()
        },
    }
}

fn convert_attendee(ra: RestAttendee) -> Option<Attendee> {
    Some(Attendee {
        email: ra.email?,
        display_name: ra.display_name,
        response_status: match ra.response_status.as_deref() {
            Some("accepted") => Some(ResponseStatus::Accepted),
            Some("declined") => Some(ResponseStatus::Declined),
            Some("tentative") => Some(ResponseStatus::Tentative),
            Some("needsAction") => Some(ResponseStatus::NeedsAction),
            _ => None,
        },
        is_self: ra.is_self.unwrap_or(false),
        is_organizer: ra.organizer.unwrap_or(false),
    })
}

fn encode_attendee(attendee: &Attendee) -> RestAttendee {
    RestAttendee {
        email: Some(attendee.email.clone()),
        display_name: attendee.display_name.clone(),
        response_status: attendee.response_status.map(|rs| {
            match rs {
                ResponseStatus::Accepted => "accepted",
                ResponseStatus::Declined => "declined",
                ResponseStatus::Tentative => "tentative",
                ResponseStatus::NeedsAction => "needsAction",
            }
            .to_string()
        }),
        is_self: None,
        organizer: None,
    }
}
