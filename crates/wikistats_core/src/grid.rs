use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::ConfigError;

/// Boundaries of one timeslice window, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Revision timestamps are matched on `(start, end]`, the same bounds the fetcher queries.
    pub fn contains_revision_time(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp > self.start && timestamp <= self.end
    }
}

pub fn validate(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration_secs: i64,
) -> Result<(), ConfigError> {
    if duration_secs <= 0 {
        return Err(ConfigError::NonPositiveDuration(duration_secs));
    }
    if end < start {
        return Err(ConfigError::InvertedDateRange { start, end });
    }
    Ok(())
}

/// Tiles `[start, end)` with windows of `duration_secs`.
///
/// The final window may extend past `end`; an empty range yields no windows.
pub fn build_grid(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration_secs: i64,
) -> Result<Vec<Span>, ConfigError> {
    validate(start, end, duration_secs)?;
    let step = Duration::seconds(duration_secs);
    let mut spans = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor + step;
        spans.push(Span {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    Ok(spans)
}

/// Like [`build_grid`], but the last window is clipped to `boundary` so the result
/// butts exactly against an existing window starting there.
pub fn build_between(
    start: DateTime<Utc>,
    boundary: DateTime<Utc>,
    duration_secs: i64,
) -> Result<Vec<Span>, ConfigError> {
    let mut spans = build_grid(start, boundary, duration_secs)?;
    if let Some(last) = spans.last_mut()
        && last.end > boundary
    {
        last.end = boundary;
    }
    Ok(spans)
}

/// Checks that `spans` are sorted, gapless and cover `[start, end)`.
pub fn tiles(spans: &[Span], start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    if start >= end {
        return spans.is_empty();
    }
    let Some(first) = spans.first() else {
        return false;
    };
    if first.start != start {
        return false;
    }
    let contiguous = spans
        .windows(2)
        .all(|pair| pair[0].end == pair[1].start && pair[0].start < pair[0].end);
    let Some(last) = spans.last() else {
        return false;
    };
    contiguous && last.start < last.end && last.start < end && last.end >= end
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn day(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 11, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn week_course_has_seven_daily_windows() {
        let spans = build_grid(day(24), Utc.with_ymd_and_hms(2018, 12, 1, 0, 0, 0).unwrap(), 86_400)
            .expect("grid");
        assert_eq!(spans.len(), 7);
        assert_eq!(spans[0].start, day(24));
        assert_eq!(spans[6].start, day(30));
        assert!(spans.iter().all(|span| span.duration_secs() == 86_400));
    }

    #[test]
    fn last_window_may_overhang_end() {
        let end = Utc.with_ymd_and_hms(2018, 11, 25, 6, 0, 0).unwrap();
        let spans = build_grid(day(24), end, 86_400).expect("grid");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].end, day(26));
        assert!(tiles(&spans, day(24), end));
    }

    #[test]
    fn empty_range_has_no_windows() {
        let spans = build_grid(day(24), day(24), 86_400).expect("grid");
        assert!(spans.is_empty());
        assert!(tiles(&spans, day(24), day(24)));
    }

    #[test]
    fn rejects_bad_configuration() {
        assert_eq!(
            build_grid(day(24), day(30), 0),
            Err(ConfigError::NonPositiveDuration(0))
        );
        assert_eq!(
            build_grid(day(30), day(24), 86_400),
            Err(ConfigError::InvertedDateRange {
                start: day(30),
                end: day(24)
            })
        );
    }

    #[test]
    fn build_between_clips_to_boundary() {
        let boundary = Utc.with_ymd_and_hms(2018, 11, 26, 12, 0, 0).unwrap();
        let spans = build_between(day(24), boundary, 86_400).expect("grid");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[2].end, boundary);
        assert_eq!(spans[2].duration_secs(), 43_200);
    }

    #[test]
    fn revision_time_bounds_are_half_open_on_the_left() {
        let span = Span {
            start: day(24),
            end: day(25),
        };
        assert!(span.contains_revision_time(day(25)));
        assert!(span.contains_revision_time(day(24) + Duration::seconds(1)));
        assert!(!span.contains_revision_time(day(24)));
        assert!(!span.contains_revision_time(day(25) + Duration::seconds(1)));
    }

    proptest! {
        #[test]
        fn grid_always_tiles(start in 0i64..2_000_000_000, length in 0i64..10_000_000, duration in 3_600i64..3_000_000) {
            let start = DateTime::from_timestamp(start, 0).unwrap();
            let end = start + Duration::seconds(length);
            let spans = build_grid(start, end, duration).unwrap();
            prop_assert!(tiles(&spans, start, end));
        }

        #[test]
        fn build_between_ends_on_boundary(length in 1i64..10_000_000, duration in 3_600i64..3_000_000) {
            let start = DateTime::from_timestamp(1_500_000_000, 0).unwrap();
            let boundary = start + Duration::seconds(length);
            let spans = build_between(start, boundary, duration).unwrap();
            prop_assert_eq!(spans.last().map(|span| span.end), Some(boundary));
            prop_assert!(tiles(&spans, start, boundary));
        }
    }
}
