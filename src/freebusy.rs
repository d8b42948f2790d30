//! Busy-interval merging and free-slot search for scheduling queries.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// One busy interval, always normalized so `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusyPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusyPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }
}

/// A free interval between busy periods.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FreeSlotOptions {
    pub min_duration: Duration,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    pub include_weekends: bool,
}

impl Default for FreeSlotOptions {
    fn default() -> Self {
        Self {
            min_duration: Duration::minutes(30),
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            working_hours_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            include_weekends: false,
        }
    }
}

/// Collapse overlapping or touching intervals into a minimal sorted set.
pub fn merge_busy_periods(mut periods: Vec<BusyPeriod>) -> Vec<BusyPeriod> {
    periods.sort_by_key(|p| p.start);

    let mut merged: Vec<BusyPeriod> = Vec::with_capacity(periods.len());
    for period in periods {
        match merged.last_mut() {
            Some(last) if period.start <= last.end => {
                if period.end > last.end {
                    last.end = period.end;
                }
            }
            _ => merged.push(period),
        }
    }
    merged
}

/// Find free slots of at least `min_duration` within working hours between
/// `range_start` and `range_end`. Time before `now` is never offered.
pub fn find_free_slots(
    busy: &[BusyPeriod],
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    now: DateTime<Utc>,
    opts: &FreeSlotOptions,
) -> Vec<FreeSlot> {
    let busy = merge_busy_periods(busy.to_vec());
    let floor = range_start.max(now);

    let mut slots = Vec::new();
    let mut day = range_start.date_naive();
    let last_day = range_end.date_naive();

    while day <= last_day {
        let is_weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);

        if opts.include_weekends || !is_weekend {
            let window_start = day
                .and_time(opts.working_hours_start)
                .and_utc()
                .max(floor);
            let window_end = day.and_time(opts.working_hours_end).and_utc().min(range_end);

            if window_start < window_end {
                subtract_busy(window_start, window_end, &busy, opts.min_duration, &mut slots);
            }
        }

        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    slots
}

fn subtract_busy(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    busy: &[BusyPeriod],
    min_duration: Duration,
    slots: &mut Vec<FreeSlot>,
) {
    let mut cursor = window_start;

    for period in busy {
        if period.end <= cursor || period.start >= window_end {
            continue;
        }
        if period.start > cursor && period.start - cursor >= min_duration {
            slots.push(FreeSlot {
                start: cursor,
                end: period.start,
            });
        }
        cursor = cursor.max(period.end);
        if cursor >= window_end {
            return;
        }
    }

    if window_end > cursor && window_end - cursor >= min_duration {
        slots.push(FreeSlot {
            start: cursor,
            end: window_end,
        });
    }
}

/// Tile each free slot into fixed-length meeting windows, advancing by `gap`
/// (defaults to `duration`) until a window would overrun the slot.
pub fn split_into_meeting_slots(
    free_slots: &[FreeSlot],
    duration: Duration,
    gap: Option<Duration>,
) -> Vec<FreeSlot> {
    let stride = gap.unwrap_or(duration);
    if stride <= Duration::zero() || duration <= Duration::zero() {
        return Vec::new();
    }

    let mut meetings = Vec::new();
    for slot in free_slots {
        let mut start = slot.start;
        while start + duration <= slot.end {
            meetings.push(FreeSlot {
                start,
                end: start + duration,
            });
            start += stride;
        }
    }
    meetings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2024-01-03 is a Wednesday.
        Utc.with_ymd_and_hms(2024, 1, 3, h, m, 0).unwrap()
    }

    fn busy(start: DateTime<Utc>, end: DateTime<Utc>) -> BusyPeriod {
        BusyPeriod::new(start, end)
    }

    #[test]
    fn new_normalizes_reversed_bounds() {
        let period = BusyPeriod::new(at(11, 0), at(10, 0));

        assert_eq!(period.start, at(10, 0));
        assert_eq!(period.end, at(11, 0));
    }

    #[test]
    fn merge_combines_overlapping_and_keeps_disjoint() {
        let merged = merge_busy_periods(vec![
            busy(at(9, 0), at(10, 0)),
            busy(at(9, 30), at(11, 0)),
            busy(at(13, 0), at(14, 0)),
        ]);

        assert_eq!(
            merged,
            vec![busy(at(9, 0), at(11, 0)), busy(at(13, 0), at(14, 0))]
        );
    }

    #[test]
    fn merge_joins_touching_intervals() {
        let merged = merge_busy_periods(vec![
            busy(at(9, 0), at(10, 0)),
            busy(at(10, 0), at(11, 0)),
        ]);

        assert_eq!(merged, vec![busy(at(9, 0), at(11, 0))]);
    }

    #[test]
    fn merge_sorts_unordered_input() {
        let merged = merge_busy_periods(vec![
            busy(at(13, 0), at(14, 0)),
            busy(at(9, 0), at(10, 0)),
        ]);

        assert_eq!(merged[0].start, at(9, 0));
    }

    #[test]
    fn free_slots_surround_single_busy_block() {
        let slots = find_free_slots(
            &[busy(at(10, 0), at(11, 0))],
            at(0, 0),
            at(23, 59),
            at(0, 0),
            &FreeSlotOptions::default(),
        );

        assert_eq!(
            slots,
            vec![
                FreeSlot { start: at(9, 0), end: at(10, 0) },
                FreeSlot { start: at(11, 0), end: at(17, 0) },
            ]
        );
    }

    #[test]
    fn gaps_shorter_than_min_duration_are_dropped() {
        let opts = FreeSlotOptions {
            min_duration: Duration::minutes(30),
            ..Default::default()
        };

        let slots = find_free_slots(
            &[busy(at(9, 0), at(12, 40)), busy(at(13, 0), at(17, 0))],
            at(0, 0),
            at(23, 59),
            at(0, 0),
            &opts,
        );

        // The 20-minute gap at 12:40 is below the minimum.
        assert!(slots.is_empty());
    }

    #[test]
    fn past_time_is_clipped_to_now() {
        let slots = find_free_slots(
            &[],
            at(0, 0),
            at(23, 59),
            at(14, 30),
            &FreeSlotOptions::default(),
        );

        assert_eq!(slots, vec![FreeSlot { start: at(14, 30), end: at(17, 0) }]);
    }

    #[test]
    fn weekends_are_skipped_unless_included() {
        // 2024-01-06/07 is a weekend.
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();
        let sunday_end = Utc.with_ymd_and_hms(2024, 1, 7, 23, 0, 0).unwrap();

        let without = find_free_slots(&[], saturday, sunday_end, saturday, &FreeSlotOptions::default());
        assert!(without.is_empty());

        let opts = FreeSlotOptions {
            include_weekends: true,
            ..Default::default()
        };
        let with = find_free_slots(&[], saturday, sunday_end, saturday, &opts);
        assert_eq!(with.len(), 2);
    }

    #[test]
    fn multi_day_range_produces_one_window_per_workday() {
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let friday_end = Utc.with_ymd_and_hms(2024, 1, 5, 23, 0, 0).unwrap();

        let slots = find_free_slots(&[], monday, friday_end, monday, &FreeSlotOptions::default());

        assert_eq!(slots.len(), 5);
        assert!(slots.iter().all(|s| s.end - s.start == Duration::hours(8)));
    }

    #[test]
    fn split_tiles_slot_with_default_gap() {
        let meetings = split_into_meeting_slots(
            &[FreeSlot { start: at(11, 0), end: at(17, 0) }],
            Duration::minutes(30),
            None,
        );

        assert_eq!(meetings.len(), 12);
        assert_eq!(meetings[0], FreeSlot { start: at(11, 0), end: at(11, 30) });
        assert_eq!(meetings[11], FreeSlot { start: at(16, 30), end: at(17, 0) });
    }

    #[test]
    fn split_with_explicit_gap_advances_by_gap() {
        let meetings = split_into_meeting_slots(
            &[FreeSlot { start: at(9, 0), end: at(10, 30) }],
            Duration::minutes(30),
            Some(Duration::minutes(60)),
        );

        assert_eq!(
            meetings,
            vec![
                FreeSlot { start: at(9, 0), end: at(9, 30) },
                FreeSlot { start: at(10, 0), end: at(10, 30) },
            ]
        );
    }

    #[test]
    fn split_never_overruns_the_slot() {
        let meetings = split_into_meeting_slots(
            &[FreeSlot { start: at(9, 0), end: at(9, 50) }],
            Duration::minutes(30),
            None,
        );

        assert_eq!(meetings.len(), 1);
    }
}
