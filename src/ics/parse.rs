//! RFC 5545 VEVENT parsing.
//!
//! Only the VEVENT subset the providers exchange is understood. Anything
//! outside BEGIN:VEVENT/END:VEVENT is ignored, VALARM sub-blocks are skipped,
//! and a VEVENT without a UID is dropped rather than failing the batch.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::calendar::ident;
use crate::calendar::{Attendee, CalendarEvent, EventStatus, EventTime, ResponseStatus};

/// Parse every VEVENT in `text` into canonical events, tagging each with the
/// composite identity built from `account_id`/`calendar_id`.
pub fn parse_events(
    text: &str,
    account_id: Option<&str>,
    calendar_id: Option<&str>,
) -> Vec<CalendarEvent> {
    let lines = unfold_lines(text);

    let mut events = Vec::new();
    let mut block: Option<Vec<String>> = None;
    let mut valarm_depth = 0usize;

    for line in lines {
        match line.as_str() {
            "BEGIN:VEVENT" => {
                block = Some(Vec::new());
                valarm_depth = 0;
            }
            "END:VEVENT" => {
                if let Some(lines) = block.take()
                    && let Some(event) = parse_vevent(&lines, account_id, calendar_id)
                {
                    events.push(event);
                }
            }
            "BEGIN:VALARM" => valarm_depth += 1,
            "END:VALARM" => valarm_depth = valarm_depth.saturating_sub(1),
            _ => {
                if valarm_depth == 0
                    && let Some(ref mut lines) = block
                {
                    lines.push(line);
                }
            }
        }
    }

    events
}

/// Locate the UID in raw iCalendar text, used to match a created object when
/// the server has assigned an unpredictable filename.
pub fn extract_uid(text: &str) -> Option<String> {
    unfold_lines(text).into_iter().find_map(|line| {
        line.strip_prefix("UID:")
            .map(|rest| rest.trim().to_string())
    })
}

/// Normalize line endings and join RFC 5545 §3.1 continuation lines (lines
/// beginning with one space or tab) onto their predecessor.
fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    for raw in text.replace("\r\n", "\n").split('\n') {
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
            }
        } else if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }

    lines
}

struct Property {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl Property {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Split a logical line into NAME, parameters, and VALUE. The value starts at
/// the first colon outside double quotes; parameter values may be quoted.
fn split_property(line: &str) -> Option<Property> {
    let mut in_quotes = false;
    let mut colon = None;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                colon = Some(i);
                break;
            }
            _ => {}
        }
    }
    let colon = colon?;

    let head = &line[..colon];
    let value = line[colon + 1..].to_string();

    let mut segments = split_outside_quotes(head, ';');
    let name = segments.remove(0).to_ascii_uppercase();
    if name.is_empty() {
        return None;
    }

    let params = segments
        .into_iter()
        .filter_map(|seg| {
            let (k, v) = seg.split_once('=')?;
            Some((k.to_ascii_uppercase(), v.trim_matches('"').to_string()))
        })
        .collect();

    Some(Property { name, params, value })
}

fn split_outside_quotes(text: &str, sep: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                parts.last_mut().unwrap().push(c);
            }
            c if c == sep && !in_quotes => parts.push(String::new()),
            c => parts.last_mut().unwrap().push(c),
        }
    }
    parts
}

fn parse_vevent(
    lines: &[String],
    account_id: Option<&str>,
    calendar_id: Option<&str>,
) -> Option<CalendarEvent> {
    let mut uid = None;
    let mut summary = None;
    let mut description = None;
    let mut location = None;
    let mut status = EventStatus::Confirmed;
    let mut dtstart = None;
    let mut dtend = None;
    let mut duration = None;
    let mut rrules: Vec<String> = Vec::new();
    let mut recurring_event_id = None;
    let mut attendees: Vec<Attendee> = Vec::new();
    let mut organizer = None;
    let mut conference_link = None;
    let mut created_at = None;
    let mut updated_at = None;

    for line in lines {
        let Some(prop) = split_property(line) else {
            continue;
        };
        match prop.name.as_str() {
            "UID" => uid = Some(prop.value.clone()),
            "SUMMARY" => summary = Some(unescape_text(&prop.value)),
            "DESCRIPTION" => description = Some(unescape_text(&prop.value)),
            "LOCATION" => location = Some(unescape_text(&prop.value)),
            "DTSTART" => dtstart = parse_event_time(&prop),
            "DTEND" => dtend = parse_event_time(&prop),
            "DURATION" => duration = parse_duration(&prop.value),
            "STATUS" => {
                status = match prop.value.to_ascii_uppercase().as_str() {
                    "TENTATIVE" => EventStatus::Tentative,
                    "CANCELLED" => EventStatus::Cancelled,
                    _ => EventStatus::Confirmed,
                };
            }
            "RRULE" => rrules.push(format!("RRULE:{}", prop.value)),
            "RECURRENCE-ID" => recurring_event_id = Some(prop.value.clone()),
            "ATTENDEE" => attendees.push(parse_participant(&prop)),
            "ORGANIZER" => {
                let mut att = parse_participant(&prop);
                att.is_organizer = true;
                organizer = Some(att);
            }
            "URL" => conference_link = Some(prop.value.clone()),
            "CREATED" => created_at = parse_utc_stamp(&prop.value),
            "LAST-MODIFIED" => updated_at = parse_utc_stamp(&prop.value),
            _ => {}
        }
    }

    // A VEVENT without UID is invalid and must not enter the result set.
    let uid = uid?;
    let start = dtstart?;

    let end = match (dtend, duration) {
        (Some(end), _) => end,
        (None, Some(duration)) => start.plus(duration),
        // RFC 5545 defaults: one day for all-day events, zero otherwise.
        (None, None) if start.is_all_day() => start.plus(Duration::days(1)),
        (None, None) => start.clone(),
    };

    Some(CalendarEvent {
        id: ident::make(account_id, &uid, calendar_id),
        account_id: account_id.map(str::to_string),
        calendar_id: calendar_id.unwrap_or_default().to_string(),
        summary: summary.unwrap_or_default(),
        description,
        location,
        status,
        start,
        end,
        recurrence_rules: if rrules.is_empty() { None } else { Some(rrules) },
        recurring_event_id,
        attendees,
        organizer,
        conference_link,
        created_at,
        updated_at,
    })
}

/// The three DTSTART/DTEND encodings: `YYYYMMDD` (all-day),
/// `YYYYMMDDTHHMMSSZ` (UTC instant), `YYYYMMDDTHHMMSS` + TZID (civil time in
/// a zone). Floating times without TZID are read as UTC.
fn parse_event_time(prop: &Property) -> Option<EventTime> {
    let value = prop.value.trim();
    let is_date = prop.param("VALUE") == Some("DATE")
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));

    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(EventTime::Date(date));
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let ndt = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(EventTime::Utc(ndt.and_utc()));
    }

    let local = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    match prop.param("TZID") {
        Some(tzid) => Some(EventTime::Zoned {
            local,
            tzid: tzid.to_string(),
        }),
        None => Some(EventTime::Utc(local.and_utc())),
    }
}

fn parse_utc_stamp(value: &str) -> Option<DateTime<Utc>> {
    let stripped = value.strip_suffix('Z').unwrap_or(value);
    NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}

/// Duration subset: `P[nW]` or `P[nD][T[nH][nM][nS]]`. The sign is ignored.
fn parse_duration(value: &str) -> Option<Duration> {
    let body = value
        .trim()
        .trim_start_matches(['+', '-'])
        .strip_prefix('P')?;

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };

    let mut total = Duration::zero();
    let mut number = String::new();

    for c in date_part.chars() {
        match c {
            '0'..='9' => number.push(c),
            'W' | 'w' => total += Duration::weeks(number.parse().ok()?),
            'D' | 'd' => total += Duration::days(take_number(&mut number)?),
            _ => return None,
        }
        if c.is_ascii_alphabetic() {
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }

    for c in time_part.chars() {
        match c {
            '0'..='9' => number.push(c),
            'H' | 'h' => total += Duration::hours(take_number(&mut number)?),
            'M' | 'm' => total += Duration::minutes(take_number(&mut number)?),
            'S' | 's' => total += Duration::seconds(take_number(&mut number)?),
            _ => return None,
        }
        if c.is_ascii_alphabetic() {
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }

    Some(total)
}

fn take_number(number: &mut String) -> Option<i64> {
    let parsed = number.parse().ok()?;
    number.clear();
    Some(parsed)
}

fn parse_participant(prop: &Property) -> Attendee {
    let email = prop
        .value
        .strip_prefix("mailto:")
        .or_else(|| prop.value.strip_prefix("MAILTO:"))
        .unwrap_or(&prop.value)
        .to_string();

    let response_status = prop.param("PARTSTAT").and_then(|ps| match ps {
        "ACCEPTED" => Some(ResponseStatus::Accepted),
        "DECLINED" => Some(ResponseStatus::Declined),
        "TENTATIVE" => Some(ResponseStatus::Tentative),
        "NEEDS-ACTION" => Some(ResponseStatus::NeedsAction),
        _ => None,
    });

    Attendee {
        email,
        display_name: prop.param("CN").map(str::to_string),
        response_status,
        is_self: false,
        is_organizer: false,
    }
}

/// Undo RFC 5545 text escaping in a single pass so already-unescaped
/// sequences are never unescaped twice.
fn unescape_text(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some(',') => result.push(','),
            Some(';') => result.push(';'),
            Some('\\') => result.push('\\'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn wrap_vevent(body: &str) -> String {
        format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\n{}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
            body.trim()
        )
    }

    #[test]
    fn parses_utc_timed_event() {
        let ics = wrap_vevent(
            "UID:ev1\r\nSUMMARY:Standup\r\nDTSTART:20240101T090000Z\r\nDTEND:20240101T093000Z",
        );

        let events = parse_events(&ics, Some("me@example.com"), Some("work"));

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.summary, "Standup");
        assert_eq!(event.native_id(), "ev1");
        assert_eq!(
            event.start,
            EventTime::Utc(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn parses_all_day_event() {
        let ics = wrap_vevent(
            "UID:ev2\r\nSUMMARY:Holiday\r\nDTSTART;VALUE=DATE:20240704\r\nDTEND;VALUE=DATE:20240705",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(
            events[0].start,
            EventTime::Date(NaiveDate::from_ymd_opt(2024, 7, 4).unwrap())
        );
        assert!(events[0].is_all_day());
    }

    #[test]
    fn parses_zoned_event_with_tzid_param() {
        let ics =
            wrap_vevent("UID:ev3\r\nDTSTART;TZID=America/New_York:20240115T090000\r\nDTEND;TZID=America/New_York:20240115T100000");

        let events = parse_events(&ics, None, None);

        match &events[0].start {
            EventTime::Zoned { local, tzid } => {
                assert_eq!(tzid, "America/New_York");
                assert_eq!(local.format("%H%M").to_string(), "0900");
            }
            other => panic!("expected zoned time, got {:?}", other),
        }
    }

    #[test]
    fn vevent_without_uid_is_dropped() {
        let ics = wrap_vevent("SUMMARY:No identity\r\nDTSTART:20240101T090000Z");

        let events = parse_events(&ics, None, None);

        assert!(events.is_empty());
    }

    #[test]
    fn duration_supplies_missing_dtend() {
        let ics = wrap_vevent("UID:ev4\r\nDTSTART:20240101T090000Z\r\nDURATION:PT1H30M");

        let events = parse_events(&ics, None, None);

        assert_eq!(
            events[0].end,
            EventTime::Utc(Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn duration_on_all_day_event_stays_all_day() {
        let ics = wrap_vevent("UID:ev5\r\nDTSTART;VALUE=DATE:20240101\r\nDURATION:P2D");

        let events = parse_events(&ics, None, None);

        assert_eq!(
            events[0].end,
            EventTime::Date(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap())
        );
    }

    #[test]
    fn week_duration_is_understood() {
        assert_eq!(parse_duration("P2W"), Some(Duration::weeks(2)));
        assert_eq!(
            parse_duration("-P1DT2H30M5S"),
            Some(Duration::days(1) + Duration::hours(2) + Duration::minutes(30) + Duration::seconds(5))
        );
        assert_eq!(parse_duration("P"), Some(Duration::zero()));
        assert_eq!(parse_duration("PT"), Some(Duration::zero()));
        assert_eq!(parse_duration("banana"), None);
    }

    #[test]
    fn folded_lines_are_joined_before_parsing() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:ev6\r\nSUMMARY:A meeting with a very lo\r\n ng title that was folded\r\nDTSTART:20240101T090000Z\r\nEND:VEVENT\r\nEND:VCALENDAR";

        let events = parse_events(ics, None, None);

        assert_eq!(
            events[0].summary,
            "A meeting with a very long title that was folded"
        );
    }

    #[test]
    fn text_escapes_are_undone_once() {
        let ics = wrap_vevent(
            "UID:ev7\r\nSUMMARY:Lunch\\, then planning\\; maybe\r\nDESCRIPTION:line one\\nline two\\\\n not a newline\r\nDTSTART:20240101T120000Z",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(events[0].summary, "Lunch, then planning; maybe");
        assert_eq!(
            events[0].description.as_deref(),
            Some("line one\nline two\\n not a newline")
        );
    }

    #[test]
    fn attendees_and_organizer_are_parsed_with_params() {
        let ics = wrap_vevent(
            "UID:ev8\r\nDTSTART:20240101T090000Z\r\nORGANIZER;CN=Boss:mailto:boss@example.com\r\nATTENDEE;CN=\"Doe, Jane\";PARTSTAT=ACCEPTED:mailto:jane@example.com\r\nATTENDEE;PARTSTAT=NEEDS-ACTION:mailto:sam@example.com",
        );

        let events = parse_events(&ics, None, None);
        let event = &events[0];

        assert_eq!(event.attendees.len(), 2);
        assert_eq!(event.attendees[0].email, "jane@example.com");
        assert_eq!(event.attendees[0].display_name.as_deref(), Some("Doe, Jane"));
        assert_eq!(
            event.attendees[0].response_status,
            Some(ResponseStatus::Accepted)
        );
        assert_eq!(
            event.attendees[1].response_status,
            Some(ResponseStatus::NeedsAction)
        );
        let organizer = event.organizer.as_ref().unwrap();
        assert_eq!(organizer.email, "boss@example.com");
        assert!(organizer.is_organizer);
    }

    #[test]
    fn quoted_param_value_may_contain_colon_before_value() {
        let ics = wrap_vevent(
            "UID:ev9\r\nDTSTART:20240101T090000Z\r\nATTENDEE;CN=\"Dr: Strange\":mailto:s@example.com",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(events[0].attendees[0].email, "s@example.com");
        assert_eq!(
            events[0].attendees[0].display_name.as_deref(),
            Some("Dr: Strange")
        );
    }

    #[test]
    fn rrule_lines_are_collected_with_prefix() {
        let ics = wrap_vevent(
            "UID:ev10\r\nDTSTART:20240101T090000Z\r\nRRULE:FREQ=WEEKLY;BYDAY=MO,WE\r\nRRULE:FREQ=YEARLY",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(
            events[0].recurrence_rules,
            Some(vec![
                "RRULE:FREQ=WEEKLY;BYDAY=MO,WE".to_string(),
                "RRULE:FREQ=YEARLY".to_string(),
            ])
        );
    }

    #[test]
    fn valarm_triggers_do_not_leak_into_the_event() {
        let ics = wrap_vevent(
            "UID:ev11\r\nSUMMARY:With alarm\r\nDTSTART:20240101T090000Z\r\nBEGIN:VALARM\r\nTRIGGER:-PT10M\r\nDESCRIPTION:ignore me\r\nEND:VALARM",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(events[0].summary, "With alarm");
        assert!(events[0].description.is_none());
    }

    #[test]
    fn status_defaults_to_confirmed_for_unknown_values() {
        let ics = wrap_vevent("UID:ev12\r\nDTSTART:20240101T090000Z\r\nSTATUS:WHATEVER");

        let events = parse_events(&ics, None, None);

        assert_eq!(events[0].status, EventStatus::Confirmed);
    }

    #[test]
    fn recurrence_id_maps_to_recurring_event_id() {
        let ics = wrap_vevent(
            "UID:ev13\r\nDTSTART:20240108T090000Z\r\nRECURRENCE-ID:20240108T090000Z",
        );

        let events = parse_events(&ics, None, None);

        assert_eq!(
            events[0].recurring_event_id.as_deref(),
            Some("20240108T090000Z")
        );
    }

    #[test]
    fn extract_uid_finds_folded_uid() {
        let ics = "BEGIN:VEVENT\r\nUID:abcdefgh-1234-5678\r\n -tail\r\nEND:VEVENT";

        assert_eq!(extract_uid(ics), Some("abcdefgh-1234-5678-tail".to_string()));
    }

    #[test]
    fn extract_uid_returns_none_without_uid() {
        assert_eq!(extract_uid("BEGIN:VEVENT\r\nSUMMARY:x\r\nEND:VEVENT"), None);
    }

    #[test]
    fn multiple_vevents_parse_independently() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240101T090000Z\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nSUMMARY:no uid\r\nDTSTART:20240101T090000Z\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:b\r\nDTSTART:20240102T090000Z\r\nEND:VEVENT\r\nEND:VCALENDAR";

        let events = parse_events(ics, Some("me@example.com"), Some("cal"));

        let ids: Vec<&str> = events.iter().map(|e| e.native_id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
