//! WebDAV/CalDAV calendar provider.
//!
//! CalDAV has no incremental-listing primitive; each collection instead
//! exposes a ctag that changes whenever any object in it changes. An
//! unchanged ctag means an empty delta; a changed one triggers a full
//! refetch of the sync window, reported back as an ordinary changed set
//! rather than `FullSyncRequired`, so one busy CalDAV calendar cannot push
//! unrelated calendars into a full resync.
//!
//! Mutations are keyed by a server-assigned URL plus ETag. Servers may
//! rename objects, so update/delete resolve the current URL by re-listing
//! the collection and matching on UID; a per-id cache fronts that lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::calendar::ident;
use crate::calendar::{AccessRole, Calendar, CalendarEvent};
use crate::freebusy::BusyPeriod;
use crate::ics;
use crate::sync::auth::{CalDavCredentialSource, CalDavCredentials};
use crate::sync::provider::{
    ApiError, FullFetch, IncrementalFetch, ProviderClient, TimeRange, UpdateScope,
};

/// One authenticated connection per account, created on first use and reused
/// until the account is removed.
pub struct CalDavClientRegistry {
    credentials: Arc<dyn CalDavCredentialSource>,
    connections: Mutex<HashMap<String, CalDavConnection>>,
}

#[derive(Clone)]
pub struct CalDavConnection {
    pub http: reqwest::Client,
    pub credentials: CalDavCredentials,
}

impl CalDavClientRegistry {
    pub fn new(credentials: Arc<dyn CalDavCredentialSource>) -> Self {
        Self {
            credentials,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self, account_id: &str) -> Result<CalDavConnection, ApiError> {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(existing) = connections.get(account_id) {
            return Ok(existing.clone());
        }

        let credentials = self.credentials.credentials(account_id).map_err(|e| {
            tracing::error!("No CalDAV credentials for {}: {}", account_id, e);
            ApiError::AuthenticationFailed
        })?;
        let connection = CalDavConnection {
            http: reqwest::Client::new(),
            credentials,
        };
        connections.insert(account_id.to_string(), connection.clone());
        Ok(connection)
    }

    /// Drop the cached connection, e.g. on account removal.
    pub fn invalidate(&self, account_id: &str) {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .remove(account_id);
    }

    #[cfg(test)]
    pub fn is_cached(&self, account_id: &str) -> bool {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .contains_key(account_id)
    }
}

/// Number of days around now covered by a ctag-triggered refetch.
#[derive(Debug, Clone, Copy)]
pub struct SyncWindow {
    pub past_days: i64,
    pub future_days: i64,
}

impl Default for SyncWindow {
    fn default() -> Self {
        Self {
            past_days: 90,
            future_days: 365,
        }
    }
}

impl SyncWindow {
    pub fn range(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange::new(
            now - chrono::Duration::days(self.past_days),
            now + chrono::Duration::days(self.future_days),
        )
    }
}

pub struct CalDavProvider {
    account_id: String,
    registry: Arc<CalDavClientRegistry>,
    window: SyncWindow,
    // href/etag by composite id, fronting the UID re-list.
    object_cache: Mutex<HashMap<String, CachedObject>>,
}

#[derive(Clone)]
struct CachedObject {
    href: String,
    etag: Option<String>,
}

struct DavObject {
    href: String,
    etag: Option<String>,
    calendar_data: Option<String>,
}

impl CalDavProvider {
    pub fn new(
        account_id: impl Into<String>,
        registry: Arc<CalDavClientRegistry>,
        window: SyncWindow,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            registry,
            window,
            object_cache: Mutex::new(HashMap::new()),
        }
    }

    fn absolute_url(&self, connection: &CalDavConnection, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            return href.to_string();
        }
        let base = connection.credentials.server_url.trim_end_matches('/');
        // Hrefs from multistatus responses are server-absolute paths.
        match base.find("://").and_then(|scheme| {
            base[scheme + 3..].find('/').map(|slash| scheme + 3 + slash)
        }) {
            Some(root) => format!("{}{}", &base[..root], href),
            None => format!("{}/{}", base, href.trim_start_matches('/')),
        }
    }

    async fn dav_request(
        &self,
        connection: &CalDavConnection,
        method: &str,
        url: &str,
        depth: Option<&str>,
        body: String,
    ) -> Result<String, ApiError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ApiError::RequestError(format!("invalid method {method}")))?;

        let mut request = connection
            .http
            .request(method.clone(), url)
            .basic_auth(
                &connection.credentials.username,
                Some(&connection.credentials.secret),
            )
            .header("Content-Type", "application/xml; charset=utf-8");
        if let Some(depth) = depth {
            request = request.header("Depth", depth);
        }

        let response = request.body(body).send().await?;
        let status = response.status();

        if status == 401 || status == 403 {
            tracing::error!("CalDAV auth failure on {} {}", method, url);
            return Err(ApiError::AuthenticationFailed);
        }
        if status == 404 {
            return Err(ApiError::NotFound(url.to_string()));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::ServerError(format!("Status {}: {}", status, text)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::RequestError(format!("Status {}: {}", status, text)));
        }

        Ok(response.text().await?)
    }

    async fn fetch_ctag(
        &self,
        connection: &CalDavConnection,
        calendar_url: &str,
    ) -> Result<Option<String>, ApiError> {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:prop>
    <CS:getctag/>
  </D:prop>
</D:propfind>"#
            .to_string();

        let xml = self
            .dav_request(connection, "PROPFIND", calendar_url, Some("0"), body)
            .await?;

        Ok(first_text_of(&xml, "getctag"))
    }

    /// REPORT the collection, optionally restricted to a time range.
    async fn query_objects(
        &self,
        connection: &CalDavConnection,
        calendar_url: &str,
        range: Option<TimeRange>,
    ) -> Result<Vec<DavObject>, ApiError> {
        let filter = match range {
            Some(range) => format!(
                r#"<C:comp-filter name="VEVENT"><C:time-range start="{}" end="{}"/></C:comp-filter>"#,
                range.start.format("%Y%m%dT%H%M%SZ"),
                range.end.format("%Y%m%dT%H%M%SZ"),
            ),
            None => r#"<C:comp-filter name="VEVENT"/>"#.to_string(),
        };
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop>
    <D:getetag/>
    <C:calendar-data/>
  </D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">{filter}</C:comp-filter>
  </C:filter>
</C:calendar-query>"#
        );

        let xml = self
            .dav_request(connection, "REPORT", calendar_url, Some("1"), body)
            .await?;

        parse_objects(&xml)
    }

    fn parse_objects_to_events(
        &self,
        objects: &[DavObject],
        calendar_id: &str,
    ) -> Vec<CalendarEvent> {
        let mut cache = self.object_cache.lock().expect("object cache poisoned");
        let mut events = Vec::new();

        for object in objects {
            let Some(ref data) = object.calendar_data else {
                continue;
            };
            for event in ics::parse_events(data, Some(&self.account_id), Some(calendar_id)) {
                cache.insert(
                    event.id.clone(),
                    CachedObject {
                        href: object.href.clone(),
                        etag: object.etag.clone(),
                    },
                );
                events.push(event);
            }
        }

        events
    }

    /// Find the current server URL and ETag for an event, by cache or by
    /// re-listing the calendar and matching on UID.
    async fn resolve_object(
        &self,
        connection: &CalDavConnection,
        event_id: &str,
    ) -> Result<Option<CachedObject>, ApiError> {
        if let Some(cached) = self
            .object_cache
            .lock()
            .expect("object cache poisoned")
            .get(event_id)
            .cloned()
        {
            return Ok(Some(cached));
        }

        let calendar_id = ident::calendar_id(event_id)
            .ok_or_else(|| ApiError::Validation("event id lacks a calendar".to_string()))?
            .to_string();
        let native = ident::native_id(event_id).to_string();
        let calendar_url = self.absolute_url(connection, &calendar_id);

        tracing::info!("Resolving object for UID {} by re-listing {}", native, calendar_id);
        let objects = self.query_objects(connection, &calendar_url, None).await?;

        for object in objects {
            let Some(ref data) = object.calendar_data else {
                continue;
            };
            if ics::extract_uid(data).as_deref() == Some(native.as_str()) {
                let found = CachedObject {
                    href: object.href,
                    etag: object.etag,
                };
                self.object_cache
                    .lock()
                    .expect("object cache poisoned")
                    .insert(event_id.to_string(), found.clone());
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    fn forget_object(&self, event_id: &str) {
        self.object_cache
            .lock()
            .expect("object cache poisoned")
            .remove(event_id);
    }
}

#[async_trait]
impl ProviderClient for CalDavProvider {
    async fn list_calendars(&self, account_id: &str) -> Result<Vec<Calendar>, ApiError> {
        if account_id != self.account_id {
            return Err(ApiError::AuthenticationFailed);
        }
        let connection = self.registry.connection(&self.account_id)?;
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:A="http://apple.com/ns/ical/">
  <D:prop>
    <D:displayname/>
    <D:resourcetype/>
    <C:supported-calendar-component-set/>
    <A:calendar-color/>
  </D:prop>
</D:propfind>"#
            .to_string();

        let xml = self
            .dav_request(
                &connection,
                "PROPFIND",
                &connection.credentials.server_url,
                Some("1"),
                body,
            )
            .await?;

        parse_calendars(&xml)
    }

    async fn fetch_all(&self, calendar_id: &str, range: TimeRange) -> Result<FullFetch, ApiError> {
        let connection = self.registry.connection(&self.account_id)?;
        let calendar_url = self.absolute_url(&connection, calendar_id);

        let ctag = self.fetch_ctag(&connection, &calendar_url).await?;
        let objects = self.query_objects(&connection, &calendar_url, Some(range)).await?;
        let events = self.parse_objects_to_events(&objects, calendar_id);

        tracing::info!("Fetched {} events from CalDAV calendar {}", events.len(), calendar_id);
        Ok(FullFetch {
            events,
            continuation_token: ctag,
        })
    }

    async fn fetch_incremental(
        &self,
        calendar_id: &str,
        token: &str,
    ) -> Result<IncrementalFetch, ApiError> {
        let connection = self.registry.connection(&self.account_id)?;
        let calendar_url = self.absolute_url(&connection, calendar_id);

        let current = self.fetch_ctag(&connection, &calendar_url).await?;
        if current.as_deref() == Some(token) {
            tracing::debug!("Ctag unchanged for {}", calendar_id);
            return Ok(IncrementalFetch::Unchanged {
                token: token.to_string(),
            });
        }

        // Changed or unknown ctag: refetch the window locally instead of
        // escalating to the orchestrator's full-sync path.
        tracing::info!("Ctag changed for {}, refetching window", calendar_id);
        let range = self.window.range(Utc::now());
        let objects = self.query_objects(&connection, &calendar_url, Some(range)).await?;
        let changed = self.parse_objects_to_events(&objects, calendar_id);

        Ok(IncrementalFetch::Changed {
            changed,
            deleted_ids: Vec::new(),
            next_token: current,
        })
    }

    async fn create(
        &self,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent, ApiError> {
        if event.summary.is_empty() {
            return Err(ApiError::Validation("event summary is required".to_string()));
        }
        let connection = self.registry.connection(&self.account_id)?;
        let calendar_url = self.absolute_url(&connection, calendar_id);

        let uid = uuid::Uuid::new_v4().to_string();
        let payload = ics::generate_event(event, Some(&uid));
        let object_url = format!("{}/{}.ics", calendar_url.trim_end_matches('/'), uid);

        tracing::info!("Creating CalDAV object {}", object_url);

        let response = connection
            .http
            .put(&object_url)
            .basic_auth(
                &connection.credentials.username,
                Some(&connection.credentials.secret),
            )
            .header("Content-Type", "text/calendar; charset=utf-8")
            .header("If-None-Match", "*")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status == 401 || status == 403 {
            return Err(ApiError::AuthenticationFailed);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::RequestError(format!("Status {}: {}", status, text)));
        }

        let mut created = event.clone();
        created.id = ident::make(Some(&self.account_id), &uid, Some(calendar_id));
        created.account_id = Some(self.account_id.clone());
        created.calendar_id = calendar_id.to_string();

        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.object_cache
            .lock()
            .expect("object cache poisoned")
            .insert(
                created.id.clone(),
                CachedObject {
                    href: object_url,
                    etag,
                },
            );

        Ok(created)
    }

    async fn update(
        &self,
        event_id: &str,
        event: &CalendarEvent,
        scope: UpdateScope,
    ) -> Result<CalendarEvent, ApiError> {
        // No native this-and-following on CalDAV; it degrades to a single
        // instance, and series-wide edits rewrite the master object anyway.
        let _ = scope;
        let connection = self.registry.connection(&self.account_id)?;

        let object = self
            .resolve_object(&connection, event_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(event_id.to_string()))?;

        let native = ident::native_id(event_id).to_string();
        let payload = ics::generate_event(event, Some(&native));
        let object_url = self.absolute_url(&connection, &object.href);

        tracing::info!("Updating CalDAV object {}", object_url);

        let mut request = connection
            .http
            .put(&object_url)
            .basic_auth(
                &connection.credentials.username,
                Some(&connection.credentials.secret),
            )
            .header("Content-Type", "text/calendar; charset=utf-8")
            .body(payload);
        if let Some(ref etag) = object.etag {
            request = request.header("If-Match", etag);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == 401 || status == 403 {
            return Err(ApiError::AuthenticationFailed);
        }
        if status == 412 {
            // ETag drift since the cache entry was taken; drop it so the
            // next attempt goes through the UID re-list.
            self.forget_object(event_id);
            return Err(ApiError::RequestError(
                "precondition failed, object changed on server".to_string(),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::RequestError(format!("Status {}: {}", status, text)));
        }

        self.forget_object(event_id);
        let mut updated = event.clone();
        updated.id = event_id.to_string();
        Ok(updated)
    }

    async fn delete(&self, event_id: &str, _scope: UpdateScope) -> Result<(), ApiError> {
        let connection = self.registry.connection(&self.account_id)?;

        let Some(object) = self.resolve_object(&connection, event_id).await? else {
            // Nothing on the server with this UID: already deleted.
            tracing::info!("CalDAV object for {} already absent", ident::native_id(event_id));
            return Ok(());
        };

        let object_url = self.absolute_url(&connection, &object.href);
        tracing::info!("Deleting CalDAV object {}", object_url);

        let mut request = connection.http.delete(&object_url).basic_auth(
            &connection.credentials.username,
            Some(&connection.credentials.secret),
        );
        if let Some(ref etag) = object.etag {
            request = request.header("If-Match", etag);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == 401 || status == 403 {
            return Err(ApiError::AuthenticationFailed);
        }
        if status == 404 {
            self.forget_object(event_id);
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::RequestError(format!("Status {}: {}", status, text)));
        }

        self.forget_object(event_id);
        Ok(())
    }

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        range: TimeRange,
    ) -> Result<Vec<BusyPeriod>, ApiError> {
        // No free-busy REPORT support is assumed; busy intervals come from
        // the events themselves.
        let mut periods = Vec::new();
        for calendar_id in calendar_ids {
            let fetch = self.fetch_all(calendar_id, range).await?;
            for event in fetch.events {
                if !event.is_all_day() {
                    periods.push(BusyPeriod::new(event.start.to_utc(), event.end.to_utc()));
                }
            }
        }
        Ok(periods)
    }
}

fn parse_document(xml: &str) -> Result<roxmltree::Document<'_>, ApiError> {
    roxmltree::Document::parse(xml)
        .map_err(|e| ApiError::ParseError(format!("invalid multistatus XML: {e}")))
}

fn first_text_of(xml: &str, local_name: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    doc.descendants()
        .find(|n| n.tag_name().name() == local_name)
        .and_then(|n| n.text())
        .map(str::to_string)
}

fn parse_objects(xml: &str) -> Result<Vec<DavObject>, ApiError> {
    let doc = parse_document(xml)?;
    let mut objects = Vec::new();

    for response in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let Some(href) = response
            .descendants()
            .find(|n| n.tag_name().name() == "href")
            .and_then(|n| n.text())
        else {
            continue;
        };

        let etag = response
            .descendants()
            .find(|n| n.tag_name().name() == "getetag")
            .and_then(|n| n.text())
            .map(str::to_string);
        let calendar_data = response
            .descendants()
            .find(|n| n.tag_name().name() == "calendar-data")
            .and_then(|n| n.text())
            .map(str::to_string);

        objects.push(DavObject {
            href: href.to_string(),
            etag,
            calendar_data,
        });
    }

    Ok(objects)
}

fn parse_calendars(xml: &str) -> Result<Vec<Calendar>, ApiError> {
    let doc = parse_document(xml)?;
    let mut calendars = Vec::new();

    for response in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "response")
    {
        let Some(href) = response
            .descendants()
            .find(|n| n.tag_name().name() == "href")
            .and_then(|n| n.text())
        else {
            continue;
        };

        let is_calendar = response
            .descendants()
            .filter(|n| n.tag_name().name() == "resourcetype")
            .any(|rt| rt.children().any(|c| c.tag_name().name() == "calendar"));
        if !is_calendar {
            continue;
        }

        // When the server advertises supported components, require VEVENT.
        let comp_set: Vec<_> = response
            .descendants()
            .filter(|n| n.tag_name().name() == "comp")
            .filter_map(|n| n.attribute("name").map(str::to_string))
            .collect();
        if !comp_set.is_empty() && !comp_set.iter().any(|c| c == "VEVENT") {
            continue;
        }

        let name = response
            .descendants()
            .find(|n| n.tag_name().name() == "displayname")
            .and_then(|n| n.text())
            .unwrap_or(href)
            .to_string();
        let color = response
            .descendants()
            .find(|n| n.tag_name().name() == "calendar-color")
            .and_then(|n| n.text())
            .map(str::to_string);

        calendars.push(Calendar {
            id: href.to_string(),
            name,
            color,
            is_primary: false,
            access_role: AccessRole::Owner,
        });
    }

    Ok(calendars)
}
