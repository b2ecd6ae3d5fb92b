//! Five-field cron expressions: parsing, matching and next-fire computation.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week. Each field
//! accepts `*`, `*/N`, `a-b`, `a-b/N`, `a/N`, a plain integer, or a comma
//! separated list of those. Day-of-week runs 0-6 with 0 = Sunday (7 is also
//! Sunday). A time matches when every field contains the corresponding
//! component.
//!
//! Human-readable schedules ("@daily", "every 5 minutes", ...) are
//! normalized to this form by `normalize_schedule`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, TimeZone, Timelike, Utc};

/// How far ahead `next_run` searches before giving up.
pub const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{token}': {reason}")]
    InvalidField {
        field: &'static str,
        token: String,
        reason: String,
    },

    #[error("unrecognized schedule format: '{0}'")]
    UnrecognizedSchedule(String),

    #[error("invalid timezone '{0}': expected UTC, local, or an offset like +05:30")]
    InvalidTimezone(String),
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 5-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - `@hourly`, `hourly`, `every hour`       -> `0 * * * *`
/// - `@daily`, `@midnight`, `daily`, `every day` -> `0 0 * * *`
/// - `@weekly`                               -> `0 0 * * 0`
/// - `@monthly`                              -> `0 0 1 * *`
/// - `@yearly`, `@annually`                  -> `0 0 1 1 *`
/// - `every minute`                          -> `* * * * *`
/// - `every N minutes` / `every N hours`
/// - `every day at HH:MM`                    -> `MM HH * * *`
///
/// Five-field expressions are returned unchanged (whitespace collapsed).
pub fn normalize_schedule(input: &str) -> Result<String, CronError> {
    let trimmed = input.trim();
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(parts.join(" "));
    }

    let lower = trimmed.to_lowercase();
    let fixed = match lower.as_str() {
        "@hourly" | "hourly" | "every hour" => Some("0 * * * *"),
        "@daily" | "@midnight" | "daily" | "every day" => Some("0 0 * * *"),
        "@weekly" | "weekly" => Some("0 0 * * 0"),
        "@monthly" | "monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" | "yearly" => Some("0 0 1 1 *"),
        "every minute" | "minutely" => Some("* * * * *"),
        _ => None,
    };
    if let Some(expr) = fixed {
        return Ok(expr.to_string());
    }

    let unrecognized = || CronError::UnrecognizedSchedule(trimmed.to_string());

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at) = rest.strip_prefix("day at ") {
            let (h, m) = at.trim().split_once(':').ok_or_else(unrecognized)?;
            let hour: u32 = h.trim().parse().map_err(|_| unrecognized())?;
            let minute: u32 = m.trim().parse().map_err(|_| unrecognized())?;
            if hour < 24 && minute < 60 {
                return Ok(format!("{minute} {hour} * * *"));
            }
            return Err(unrecognized());
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if let [n, unit] = words.as_slice() {
            let n: u32 = n.parse().map_err(|_| unrecognized())?;
            if n == 0 {
                return Err(unrecognized());
            }
            return match unit.trim_end_matches('s') {
                "minute" if n < 60 => Ok(format!("*/{n} * * * *")),
                "hour" if n < 24 => Ok(format!("0 */{n} * * *")),
                _ => Err(unrecognized()),
            };
        }
    }

    Err(unrecognized())
}

// ---------------------------------------------------------------------------
// Timezone
// ---------------------------------------------------------------------------

/// Timezone a schedule is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleTz {
    #[default]
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl ScheduleTz {
    /// Parse `UTC`, `local`, or a `+HH:MM` / `-HH:MM` offset. `None` is UTC.
    pub fn parse(tz: Option<&str>) -> Result<Self, CronError> {
        let Some(raw) = tz.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(ScheduleTz::Utc);
        };
        match raw.to_ascii_lowercase().as_str() {
            "utc" | "z" | "gmt" | "etc/utc" => return Ok(ScheduleTz::Utc),
            "local" => return Ok(ScheduleTz::Local),
            _ => {}
        }

        let invalid = || CronError::InvalidTimezone(raw.to_string());
        let (sign, rest) = match raw.as_bytes().first() {
            Some(b'+') => (1, &raw[1..]),
            Some(b'-') => (-1, &raw[1..]),
            _ => return Err(invalid()),
        };
        let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
        let hours: i32 = h.parse().map_err(|_| invalid())?;
        let minutes: i32 = m.parse().map_err(|_| invalid())?;
        if hours > 14 || minutes >= 60 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ScheduleTz::Fixed)
            .ok_or_else(invalid)
    }

    /// Calendar components `(minute, hour, day, month, weekday-from-sunday)` of `t`.
    fn components(&self, t: DateTime<Utc>) -> (u32, u32, u32, u32, u32) {
        fn parts<Tz: TimeZone>(t: DateTime<Tz>) -> (u32, u32, u32, u32, u32) {
            (
                t.minute(),
                t.hour(),
                t.day(),
                t.month(),
                t.weekday().num_days_from_sunday(),
            )
        }
        match self {
            ScheduleTz::Utc => parts(t),
            ScheduleTz::Local => parts(t.with_timezone(&Local)),
            ScheduleTz::Fixed(offset) => parts(t.with_timezone(offset)),
        }
    }
}

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

/// A parsed 5-field cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    // 7 is folded onto 0 after parsing.
    FieldSpec { name: "weekday", min: 0, max: 7 },
];

impl CronExpr {
    /// Parse a schedule, accepting the aliases `normalize_schedule` understands.
    pub fn parse(schedule: &str) -> Result<Self, CronError> {
        normalize_schedule(schedule)?.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (evaluated in `tz`) satisfies every field.
    pub fn matches(&self, t: DateTime<Utc>, tz: ScheduleTz) -> bool {
        let (minute, hour, day, month, weekday) = tz.components(t);
        bit(self.minutes, minute)
            && bit(self.hours, hour)
            && bit(self.days, day)
            && bit(self.months, month)
            && bit(self.weekdays, weekday)
    }

    /// Smallest minute-aligned time strictly after `after` that matches.
    ///
    /// Walks forward one candidate minute at a time (a whole hour at a time
    /// while the hour or date cannot match) up to `SEARCH_HORIZON_DAYS`.
    pub fn next_run(&self, after: DateTime<Utc>, tz: ScheduleTz) -> Option<DateTime<Utc>> {
        let start_minute = after.timestamp().div_euclid(60) + 1;
        let mut candidate = DateTime::<Utc>::from_timestamp(start_minute * 60, 0)?;
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate <= limit {
            let (minute, hour, day, month, weekday) = tz.components(candidate);
            let date_ok = bit(self.days, day) && bit(self.months, month) && bit(self.weekdays, weekday);
            if !date_ok || !bit(self.hours, hour) {
                candidate += Duration::minutes(i64::from(60 - minute));
                continue;
            }
            if bit(self.minutes, minute) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    /// Occurrences in the open interval `(last_fired, now)`.
    pub fn missed_runs(
        &self,
        last_fired: DateTime<Utc>,
        now: DateTime<Utc>,
        tz: ScheduleTz,
    ) -> Vec<DateTime<Utc>> {
        let mut missed = Vec::new();
        let mut cursor = last_fired;
        while let Some(next) = self.next_run(cursor, tz) {
            if next >= now {
                break;
            }
            missed.push(next);
            cursor = next;
        }
        missed
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() != 5 {
            return Err(CronError::FieldCount(tokens.len()));
        }

        let mut sets = [0u64; 5];
        for (i, (token, spec)) in tokens.iter().zip(FIELDS.iter()).enumerate() {
            sets[i] = parse_field(token, spec)?;
        }
        // Sunday may be written as 7.
        if sets[4] & (1 << 7) != 0 {
            sets[4] = (sets[4] & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: tokens.join(" "),
            minutes: sets[0],
            hours: sets[1],
            days: sets[2],
            months: sets[3],
            weekdays: sets[4],
        })
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn parse_field(token: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: &str| CronError::InvalidField {
        field: spec.name,
        token: token.to_string(),
        reason: reason.to_string(),
    };
    let number = |s: &str| -> Result<u32, CronError> {
        let n: u32 = s.parse().map_err(|_| invalid("not a number"))?;
        if n < spec.min || n > spec.max {
            return Err(invalid(&format!("{n} outside {}-{}", spec.min, spec.max)));
        }
        Ok(n)
    };

    let mut set = 0u64;
    for item in token.split(',') {
        if item.is_empty() {
            return Err(invalid("empty list item"));
        }
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be > 0"));
                }
                (base, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if base == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = base.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(invalid("reversed range"));
            }
            (a, b)
        } else {
            let a = number(base)?;
            // `a/N` runs from a to the field maximum.
            if item.contains('/') { (a, spec.max) } else { (a, a) }
        };

        let mut v = lo;
        while v <= hi {
            set |= 1u64 << v;
            v += step;
        }
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_normalize_passthrough() {
        assert_eq!(normalize_schedule("*/5  *  * * *").unwrap(), "*/5 * * * *");
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_schedule("@hourly").unwrap(), "0 * * * *");
        assert_eq!(normalize_schedule("@DAILY").unwrap(), "0 0 * * *");
        assert_eq!(normalize_schedule("@weekly").unwrap(), "0 0 * * 0");
        assert_eq!(normalize_schedule("@monthly").unwrap(), "0 0 1 * *");
        assert_eq!(normalize_schedule("@annually").unwrap(), "0 0 1 1 *");
        assert_eq!(normalize_schedule("every minute").unwrap(), "* * * * *");
    }

    #[test]
    fn test_normalize_intervals() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "*/5 * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 */2 * * *");
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "30 9 * * *");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_schedule("whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    // -------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------

    #[test]
    fn test_parse_field_count() {
        assert_eq!("* * * *".parse::<CronExpr>().unwrap_err(), CronError::FieldCount(4));
        assert!(matches!(
            "* * * * * *".parse::<CronExpr>(),
            Err(CronError::FieldCount(6))
        ));
    }

    #[test]
    fn test_parse_malformed_tokens() {
        for bad in ["60 * * * *", "* 24 * * *", "* * 0 * *", "* * * 13 *", "* * * * 8",
            "*/0 * * * *", "5-1 * * * *", "a * * * *", "1,,2 * * * *"]
        {
            assert!(bad.parse::<CronExpr>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_parse_lists_ranges_steps() {
        let expr: CronExpr = "0,30 9-17/4 1-10/3 * 1-5".parse().unwrap();
        assert!(expr.matches(utc("2025-03-04T13:30:00Z"), ScheduleTz::Utc)); // Tue
        assert!(!expr.matches(utc("2025-03-04T11:30:00Z"), ScheduleTz::Utc)); // hour 11 not in 9,13,17
        assert!(!expr.matches(utc("2025-03-05T13:30:00Z"), ScheduleTz::Utc)); // day 5 not in 1,4,7,10
    }

    #[test]
    fn test_sunday_as_seven() {
        let expr: CronExpr = "0 0 * * 7".parse().unwrap();
        // 2025-03-02 is a Sunday.
        assert!(expr.matches(utc("2025-03-02T00:00:00Z"), ScheduleTz::Utc));
        assert!(!expr.matches(utc("2025-03-03T00:00:00Z"), ScheduleTz::Utc));
    }

    // -------------------------------------------------------------------
    // next_run
    // -------------------------------------------------------------------

    #[test]
    fn test_next_run_strictly_after() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let next = expr.next_run(utc("2025-01-01T10:15:00Z"), ScheduleTz::Utc).unwrap();
        assert_eq!(next, utc("2025-01-01T10:30:00Z"));

        let next = expr.next_run(utc("2025-01-01T10:15:30Z"), ScheduleTz::Utc).unwrap();
        assert_eq!(next, utc("2025-01-01T10:30:00Z"));
    }

    #[test]
    fn test_next_run_crosses_year() {
        let expr = CronExpr::parse("@yearly").unwrap();
        let next = expr.next_run(utc("2025-06-15T12:00:00Z"), ScheduleTz::Utc).unwrap();
        assert_eq!(next, utc("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_next_run_leap_day() {
        let expr: CronExpr = "0 12 29 2 *".parse().unwrap();
        let next = expr.next_run(utc("2025-01-01T00:00:00Z"), ScheduleTz::Utc).unwrap();
        assert_eq!(next, utc("2028-02-29T12:00:00Z"));
    }

    #[test]
    fn test_next_run_impossible_date_is_none() {
        let expr: CronExpr = "0 0 31 2 *".parse().unwrap();
        assert!(expr.next_run(utc("2025-01-01T00:00:00Z"), ScheduleTz::Utc).is_none());
    }

    #[test]
    fn test_next_run_matches_and_nothing_in_between() {
        let start = utc("2025-02-27T23:58:00Z");
        for raw in ["*/7 * * * *", "5 */3 * * *", "0 9 * * 1-5", "30 2 1 * *", "15 10 * 3 0"] {
            let expr = CronExpr::parse(raw).unwrap();
            let next = expr.next_run(start, ScheduleTz::Utc).unwrap();
            assert!(expr.matches(next, ScheduleTz::Utc), "{raw}");
            let mut t = start + Duration::minutes(1);
            while t < next {
                assert!(!expr.matches(t, ScheduleTz::Utc), "{raw} matched early at {t}");
                t += Duration::minutes(1);
            }
        }
    }

    #[test]
    fn test_next_run_in_fixed_offset() {
        let tz = ScheduleTz::parse(Some("+05:30")).unwrap();
        let expr = CronExpr::parse("every day at 09:00").unwrap();
        let next = expr.next_run(utc("2025-01-01T00:00:00Z"), tz).unwrap();
        assert_eq!(next, utc("2025-01-01T03:30:00Z"));
    }

    // -------------------------------------------------------------------
    // Timezones and missed runs
    // -------------------------------------------------------------------

    #[test]
    fn test_timezone_parsing() {
        assert_eq!(ScheduleTz::parse(None).unwrap(), ScheduleTz::Utc);
        assert_eq!(ScheduleTz::parse(Some("UTC")).unwrap(), ScheduleTz::Utc);
        assert_eq!(ScheduleTz::parse(Some("local")).unwrap(), ScheduleTz::Local);
        assert_eq!(
            ScheduleTz::parse(Some("-08:00")).unwrap(),
            ScheduleTz::Fixed(FixedOffset::west_opt(8 * 3600).unwrap())
        );
        assert!(ScheduleTz::parse(Some("Mars/Olympus")).is_err());
        assert!(ScheduleTz::parse(Some("+25:00")).is_err());
    }

    #[test]
    fn test_missed_runs() {
        let expr = CronExpr::parse("@hourly").unwrap();
        let missed = expr.missed_runs(
            utc("2025-01-01T10:00:00Z"),
            utc("2025-01-01T13:00:00Z"),
            ScheduleTz::Utc,
        );
        assert_eq!(
            missed,
            vec![utc("2025-01-01T11:00:00Z"), utc("2025-01-01T12:00:00Z")]
        );
    }
}
