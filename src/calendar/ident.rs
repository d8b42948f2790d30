//! Composite event identity.
//!
//! Events from every connected account live in one local set, so the local
//! key combines (account, calendar, provider-native id). Account emails and
//! CalDAV calendar ids (which are URLs) can both contain `:`, so the segments
//! are joined with the ASCII unit separator, which cannot appear in either.

/// Separator between identity segments. Non-printable, never present in
/// email addresses or URLs.
pub const SEP: char = '\u{1F}';

/// Build a composite id. With no account the event is local-only and the
/// native id is used as-is. With no calendar the middle segment is empty.
pub fn make(account_id: Option<&str>, native_id: &str, calendar_id: Option<&str>) -> String {
    match (account_id, calendar_id) {
        (None, _) => native_id.to_string(),
        (Some(account), None) => format!("{account}{SEP}{SEP}{native_id}"),
        (Some(account), Some(calendar)) => {
            format!("{account}{SEP}{calendar}{SEP}{native_id}")
        }
    }
}

/// The provider-native id: everything after the last separator, or the whole
/// string when no separator is present. Total over arbitrary input.
pub fn native_id(id: &str) -> &str {
    match id.rfind(SEP) {
        Some(pos) => &id[pos + SEP.len_utf8()..],
        None => id,
    }
}

/// The account segment: everything before the first separator, if any.
pub fn account_id(id: &str) -> Option<&str> {
    id.find(SEP).map(|pos| &id[..pos])
}

/// The calendar segment, when the id carries all three parts and the middle
/// segment is non-empty.
pub fn calendar_id(id: &str) -> Option<&str> {
    let first = id.find(SEP)?;
    let last = id.rfind(SEP)?;
    if last <= first {
        return None;
    }
    let middle = &id[first + SEP.len_utf8()..last];
    if middle.is_empty() { None } else { Some(middle) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn local_only_event_keeps_native_id() {
        assert_eq!(make(None, "native-1", None), "native-1");
        assert_eq!(make(None, "native-1", Some("ignored")), "native-1");
    }

    #[test]
    fn missing_calendar_leaves_empty_middle_segment() {
        let id = make(Some("me@example.com"), "ev1", None);

        assert_eq!(native_id(&id), "ev1");
        assert_eq!(account_id(&id), Some("me@example.com"));
        assert_eq!(calendar_id(&id), None);
    }

    #[test]
    fn full_identity_round_trips() {
        let id = make(Some("me@example.com"), "ev1", Some("work"));

        assert_eq!(native_id(&id), "ev1");
        assert_eq!(account_id(&id), Some("me@example.com"));
        assert_eq!(calendar_id(&id), Some("work"));
    }

    #[test]
    fn url_calendar_id_with_colons_does_not_confuse_extraction() {
        let calendar = "https://caldav.example.com:8443/cal/home/";
        let id = make(Some("me@example.com"), "ev1", Some(calendar));

        assert_eq!(native_id(&id), "ev1");
        assert_eq!(account_id(&id), Some("me@example.com"));
        assert_eq!(calendar_id(&id), Some(calendar));
    }

    #[test]
    fn plain_string_degrades_to_native_id() {
        assert_eq!(native_id("no-separators-here"), "no-separators-here");
        assert_eq!(account_id("no-separators-here"), None);
        assert_eq!(calendar_id("no-separators-here"), None);
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_printable_segments(
            account in "[ -~]{1,40}",
            native in "[ -~]{1,40}",
            calendar in "[ -~]{0,60}",
        ) {
            let calendar_opt = if calendar.is_empty() { None } else { Some(calendar.as_str()) };
            let id = make(Some(&account), &native, calendar_opt);

            prop_assert_eq!(native_id(&id), native.as_str());
            prop_assert_eq!(account_id(&id), Some(account.as_str()));
        }
    }
}
