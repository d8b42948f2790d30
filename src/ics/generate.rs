//! RFC 5545 VEVENT generation.
//!
//! Output is wire-compatible with strict CalDAV servers: every physical line
//! is at most 75 octets before its CRLF, with continuations folded per
//! RFC 5545 §3.1.

use chrono::Utc;

use crate::calendar::{Attendee, CalendarEvent, EventStatus, EventTime, ResponseStatus};

const PRODID: &str = "-//calsync//calsync 0.1//EN";
const MAX_LINE_OCTETS: usize = 75;

/// Render one event as a complete VCALENDAR document. `uid` overrides the
/// event's own id (used when the server dictates the object UID).
pub fn generate_event(event: &CalendarEvent, uid: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push("BEGIN:VCALENDAR".to_string());
    lines.push("VERSION:2.0".to_string());
    lines.push(format!("PRODID:{PRODID}"));
    lines.push("BEGIN:VEVENT".to_string());
    lines.push(format!("UID:{}", uid.unwrap_or(&event.id)));
    lines.push(format!(
        "DTSTAMP:{}",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    ));
    lines.push(format_event_time("DTSTART", &event.start));
    lines.push(format_event_time("DTEND", &event.end));
    lines.push(format!("SUMMARY:{}", escape_text(&event.summary)));

    if let Some(ref description) = event.description {
        lines.push(format!("DESCRIPTION:{}", escape_text(description)));
    }
    if let Some(ref location) = event.location {
        lines.push(format!("LOCATION:{}", escape_text(location)));
    }

    lines.push(format!(
        "STATUS:{}",
        match event.status {
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Tentative => "TENTATIVE",
            EventStatus::Cancelled => "CANCELLED",
        }
    ));

    if let Some(ref organizer) = event.organizer {
        lines.push(format_participant("ORGANIZER", organizer));
    }
    for attendee in &event.attendees {
        lines.push(format_participant("ATTENDEE", attendee));
    }

    if let Some(ref rules) = event.recurrence_rules {
        // Rules already carry their RRULE: prefix and pass through verbatim.
        lines.extend(rules.iter().cloned());
    }
    if let Some(ref recurrence_id) = event.recurring_event_id {
        lines.push(format!("RECURRENCE-ID:{recurrence_id}"));
    }
    if let Some(ref url) = event.conference_link {
        lines.push(format!("URL:{url}"));
    }

    lines.push("END:VEVENT".to_string());
    lines.push("END:VCALENDAR".to_string());

    let mut out = String::new();
    for line in &lines {
        fold_line(line, &mut out);
    }
    out
}

fn format_event_time(name: &str, time: &EventTime) -> String {
    match time {
        EventTime::Date(d) => format!("{name};VALUE=DATE:{}", d.format("%Y%m%d")),
        EventTime::Utc(dt) => format!("{name}:{}", dt.format("%Y%m%dT%H%M%SZ")),
        EventTime::Zoned { local, tzid } => {
            format!("{name};TZID={tzid}:{}", local.format("%Y%m%dT%H%M%S"))
        }
    }
}

fn format_participant(name: &str, attendee: &Attendee) -> String {
    let mut line = name.to_string();
    if let Some(ref cn) = attendee.display_name {
        line.push_str(";CN=");
        if cn.contains([';', ',', ':']) {
            line.push('"');
            line.push_str(cn);
            line.push('"');
        } else {
            line.push_str(cn);
        }
    }
    if let Some(partstat) = attendee.response_status {
        line.push_str(";PARTSTAT=");
        line.push_str(match partstat {
            ResponseStatus::Accepted => "ACCEPTED",
            ResponseStatus::Declined => "DECLINED",
            ResponseStatus::Tentative => "TENTATIVE",
            ResponseStatus::NeedsAction => "NEEDS-ACTION",
        });
    }
    line.push_str(":mailto:");
    line.push_str(&attendee.email);
    line
}

/// RFC 5545 text escaping: backslash first so later escapes are not doubled.
fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(';', "\\;")
        .replace('\n', "\\n")
}

/// Fold one logical line into `out`: first segment up to 75 octets, each
/// continuation a single space plus up to 74 octets, CRLF separated. Splits
/// land on UTF-8 character boundaries.
fn fold_line(line: &str, out: &mut String) {
    let mut remaining = line;
    let mut first = true;

    loop {
        let budget = if first {
            MAX_LINE_OCTETS
        } else {
            MAX_LINE_OCTETS - 1
        };

        if remaining.len() <= budget {
            if !first {
                out.push(' ');
            }
            out.push_str(remaining);
            out.push_str("\r\n");
            return;
        }

        let mut split = budget;
        while !remaining.is_char_boundary(split) {
            split -= 1;
        }

        if !first {
            out.push(' ');
        }
        out.push_str(&remaining[..split]);
        out.push_str("\r\n");
        remaining = &remaining[split..];
        first = false;
    }
}
