//! Five-field cron expression parser (C9). Each field compiles to a fixed
//! bitmap; `matches` is an `AND` across all five — there is no BSD-style
//! dom/dow "OR when both restricted" special case.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron expression must have exactly 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid value '{0}' in field '{1}' (valid range {2}-{3})")]
    OutOfRange(String, &'static str, u32, u32),
    #[error("malformed field '{0}': {1}")]
    Malformed(String, &'static str),
    #[error("step value must be >= 1, got {0}")]
    InvalidStep(String),
}

/// A parsed cron expression: each field is a bitmap keyed by the field's
/// natural integer value (minute 0-59, hour 0-23, dom 1-31, month 1-12,
/// dow 0-6 with 0=Sunday).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: u64,
    hour: u32,
    dom: u32,
    month: u16,
    dow: u8,
    source: String,
}

const MINUTE_RANGE: (u32, u32) = (0, 59);
const HOUR_RANGE: (u32, u32) = (0, 23);
const DOM_RANGE: (u32, u32) = (1, 31);
const MONTH_RANGE: (u32, u32) = (1, 12);
const DOW_RANGE: (u32, u32) = (0, 6);

impl CronExpr {
    /// Parse a standard 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        Ok(CronExpr {
            minute: parse_field(fields[0], "minute", MINUTE_RANGE)?,
            hour: parse_field(fields[1], "hour", HOUR_RANGE)? as u32,
            dom: parse_field(fields[2], "day-of-month", DOM_RANGE)? as u32,
            month: parse_field(fields[3], "month", MONTH_RANGE)? as u16,
            dow: parse_field(fields[4], "day-of-week", DOW_RANGE)? as u8,
            source: expr.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn minute_matches(&self, v: u32) -> bool {
        self.minute & (1u64 << v) != 0
    }
    fn hour_matches(&self, v: u32) -> bool {
        self.hour & (1u32 << v) != 0
    }
    fn dom_matches(&self, v: u32) -> bool {
        self.dom & (1u32 << v) != 0
    }
    fn month_matches(&self, v: u32) -> bool {
        self.month & (1u16 << v) != 0
    }
    fn dow_matches(&self, v: u32) -> bool {
        self.dow & (1u8 << v) != 0
    }

    /// True iff every field's bitmap contains `t`'s corresponding component.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.minute_matches(t.minute())
            && self.hour_matches(t.hour())
            && self.dom_matches(t.day())
            && self.month_matches(t.month())
            && self.dow_matches(t.weekday().num_days_from_sunday())
    }

    /// Skip-ahead next-run search starting just after `after`. Returns `None`
    /// if nothing matches within 366 days.
    pub fn next_run_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>>
    where
        Tz::Offset: Copy,
    {
        let tz = after.timezone();
        let mut t = truncate_to_minute(after.clone()) + Duration::minutes(1);
        let deadline = after.clone() + Duration::days(366);

        loop {
            if t > deadline {
                return None;
            }
            if !self.month_matches(t.month()) {
                t = first_of_next_month(&t, &tz);
                continue;
            }
            if !self.dom_matches(t.day()) || !self.dow_matches(t.weekday().num_days_from_sunday()) {
                t = next_day_midnight(&t);
                continue;
            }
            if !self.hour_matches(t.hour()) {
                t = next_hour(&t);
                continue;
            }
            if !self.minute_matches(t.minute()) {
                t = t + Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
    }
}

fn truncate_to_minute<Tz: TimeZone>(t: DateTime<Tz>) -> DateTime<Tz> {
    t.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn first_of_next_month<Tz: TimeZone>(t: &DateTime<Tz>, tz: &Tz) -> DateTime<Tz> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    tz.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap()
}

fn next_day_midnight<Tz: TimeZone>(t: &DateTime<Tz>) -> DateTime<Tz> {
    let next = truncate_to_minute(t.clone()).with_hour(0).unwrap().with_minute(0).unwrap() + Duration::days(1);
    next
}

fn next_hour<Tz: TimeZone>(t: &DateTime<Tz>) -> DateTime<Tz> {
    truncate_to_minute(t.clone()).with_minute(0).unwrap() + Duration::hours(1)
}

fn parse_uint(s: &str, field_name: &'static str, range: (u32, u32)) -> Result<u32, CronError> {
    let v: u32 = s
        .parse()
        .map_err(|_| CronError::Malformed(s.to_string(), "expected an unsigned integer"))?;
    if v < range.0 || v > range.1 {
        return Err(CronError::OutOfRange(s.to_string(), field_name, range.0, range.1));
    }
    Ok(v)
}

fn set_bits(bitmap: &mut u64, lo: u32, hi: u32, step: u32) {
    let mut v = lo;
    while v <= hi {
        *bitmap |= 1u64 << v;
        v += step;
    }
}

/// Parse one comma-separated field into a bitmap. `range` bounds valid values.
fn parse_field(field: &str, field_name: &'static str, range: (u32, u32)) -> Result<u64, CronError> {
    let mut bitmap: u64 = 0;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(CronError::Malformed(field.to_string(), "empty list item"));
        }
        let (base, step) = match part.split_once('/') {
            Some((base, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| CronError::InvalidStep(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronError::InvalidStep(step_str.to_string()));
                }
                (base, step)
            }
            None => (part, 1),
        };

        if base == "*" {
            set_bits(&mut bitmap, range.0, range.1, step);
        } else if let Some((lo_s, hi_s)) = base.split_once('-') {
            let lo = parse_uint(lo_s, field_name, range)?;
            let hi = parse_uint(hi_s, field_name, range)?;
            if lo > hi {
                return Err(CronError::Malformed(part.to_string(), "range start exceeds end"));
            }
            set_bits(&mut bitmap, lo, hi, step);
        } else {
            let v = parse_uint(base, field_name, range)?;
            // "N/S" with no explicit range: [v .. max] stepped by S.
            let hi = if step == 1 { v } else { range.1 };
            set_bits(&mut bitmap, v, hi, step);
        }
    }
    Ok(bitmap)
}
