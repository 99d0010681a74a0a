//! Weekly recurrence math: given a set of weekdays and a time of day,
//! compute the next wall-clock occurrence.  Pure functions only — callers
//! pass `now` in, so everything here is deterministic and testable.

use thiserror::Error;
use time::{Duration, OffsetDateTime, Time, Weekday};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    /// Empty weekday set where a fire time is required.  Callers gate on
    /// this before asking for a next run; hitting it is a programming error.
    #[error("recurrence has no weekdays selected")]
    InvalidRecurrence,
    #[error("malformed time of day '{0}', expected HH:MM")]
    MalformedTime(String),
}

/// Weekday abbreviations as stored in config files and the database.
const WEEKDAY_ABBREVS: [(&str, Weekday); 7] = [
    ("Mon", Weekday::Monday),
    ("Tue", Weekday::Tuesday),
    ("Wed", Weekday::Wednesday),
    ("Thu", Weekday::Thursday),
    ("Fri", Weekday::Friday),
    ("Sat", Weekday::Saturday),
    ("Sun", Weekday::Sunday),
];

pub fn weekday_from_abbrev(s: &str) -> Option<Weekday> {
    WEEKDAY_ABBREVS
        .iter()
        .find(|(abbrev, _)| *abbrev == s)
        .map(|(_, wd)| *wd)
}

pub fn weekday_abbrev(wd: Weekday) -> &'static str {
    WEEKDAY_ABBREVS
        .iter()
        .find(|(_, w)| *w == wd)
        .map(|(abbrev, _)| *abbrev)
        .unwrap_or("?")
}

/// Parse a "HH:MM" 24-hour time of day.  The minute part must be two
/// digits; the hour accepts one or two.
pub fn parse_time_of_day(text: &str) -> Result<(u8, u8), TimeError> {
    let malformed = || TimeError::MalformedTime(text.to_string());

    let (hh, mm) = text.split_once(':').ok_or_else(malformed)?;
    if hh.is_empty() || hh.len() > 2 || mm.len() != 2 {
        return Err(malformed());
    }
    if !hh.bytes().all(|b| b.is_ascii_digit()) || !mm.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let hour: u8 = hh.parse().map_err(|_| malformed())?;
    let minute: u8 = mm.parse().map_err(|_| malformed())?;
    if hour > 23 || minute > 59 {
        return Err(malformed());
    }
    Ok((hour, minute))
}

/// Smallest timestamp at or after `now` (to the minute) whose weekday is in
/// `weekdays` and whose time of day is `hour:minute`.
///
/// Today counts when today's slot has not yet passed; otherwise the search
/// wraps forward through the week, landing on the same weekday seven days
/// later when today's slot is already behind us.
pub fn next_run_time(
    weekdays: &[Weekday],
    (hour, minute): (u8, u8),
    now: OffsetDateTime,
) -> Result<OffsetDateTime, TimeError> {
    if weekdays.is_empty() {
        return Err(TimeError::InvalidRecurrence);
    }
    let target = Time::from_hms(hour, minute, 0)
        .map_err(|_| TimeError::MalformedTime(format!("{hour:02}:{minute:02}")))?;

    // Schedules are minute-granular; seconds on `now` must not push an
    // exact-minute match into next week.
    let now_minute =
        now - Duration::seconds(now.second() as i64) - Duration::nanoseconds(now.nanosecond() as i64);

    for days_ahead in 0..=7 {
        let date = now.date() + Duration::days(days_ahead);
        if !weekdays.contains(&date.weekday()) {
            continue;
        }
        let candidate = date.with_time(target).assume_offset(now.offset());
        if candidate >= now_minute {
            return Ok(candidate);
        }
    }

    // Unreachable with a non-empty set: offsets 0..=7 cover every weekday
    // plus today-next-week.
    Err(TimeError::InvalidRecurrence)
}

// ===========================================================================
// Tests
// ===========================================================================
