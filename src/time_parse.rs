//! Natural-language time parsing for reminder due-times (spec §4.11 /
//! testable property 12): strict ISO 8601, bare clock times, relative
//! durations in English/Japanese/Chinese, and day references ("tomorrow",
//! "明日", "明天", weekday names) with an optional clock-time suffix.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Timelike, Weekday};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("could not parse a time from {0:?}")]
    Unrecognized(String),
}

fn relative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(\d+)\s*(min(?:ute)?s?|hours?|hrs?|days?|分(?:後|钟后)?|小时后?|時間後|分後|天后|天後)\s*$").unwrap())
}

fn clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(\d{1,2}):(\d{2})\s*(am|pm)?\s*$").unwrap())
}

fn hour_ampm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(\d{1,2})\s*(am|pm)\s*$").unwrap())
}

/// Matches e.g. "明日3時", "明天下午3點", "tomorrow 3pm", "下午3點".
fn day_with_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(明日|明天|tomorrow|today|今日|今天)?\s*(上午|下午|午前|午後)?\s*(\d{1,2})\s*(?:時|点|點|:00)?\s*$").unwrap()
    })
}

/// Parse `input` relative to `now`. Returns the resolved absolute instant.
pub fn parse_relative_to(input: &str, now: DateTime<Local>) -> Result<DateTime<Local>, TimeParseError> {
    let trimmed = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Local));
    }

    if let Some(caps) = relative_re().captures(trimmed) {
        let amount: i64 = caps[1].parse().unwrap_or(0);
        let unit = caps[2].to_lowercase();
        let delta = if unit.starts_with("min") || unit.contains('分') {
            ChronoDuration::minutes(amount)
        } else if unit.starts_with("hour") || unit.starts_with("hr") || unit.contains("時間") || unit.contains("小时") {
            ChronoDuration::hours(amount)
        } else {
            ChronoDuration::days(amount)
        };
        return Ok(now + delta);
    }

    if let Some(caps) = clock_re().captures(trimmed) {
        let mut hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        if let Some(ampm) = caps.get(3) {
            hour = apply_ampm(hour, ampm.as_str());
        }
        return next_occurrence_of(now, hour, minute);
    }

    if let Some(caps) = hour_ampm_re().captures(trimmed) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let hour = apply_ampm(hour, &caps[2]);
        return next_occurrence_of(now, hour, 0);
    }

    if let Some(caps) = day_with_time_re().captures(trimmed) {
        if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() {
            return Err(TimeParseError::Unrecognized(input.to_string()));
        }
        let day_word = caps.get(1).map(|m| m.as_str());
        let period = caps.get(2).map(|m| m.as_str());
        let hour_raw: u32 = caps[3].parse().unwrap_or(0);
        let hour = apply_period(hour_raw, period);

        let is_tomorrow = matches!(day_word, Some("明日") | Some("明天") | Some("tomorrow"));
        let target_date = if is_tomorrow { now.date_naive() + ChronoDuration::days(1) } else { now.date_naive() };
        let naive_time = NaiveTime::from_hms_opt(hour % 24, 0, 0).unwrap();
        let candidate = Local.from_local_datetime(&target_date.and_time(naive_time)).single();
        if let Some(candidate) = candidate {
            if !is_tomorrow && candidate <= now {
                return Ok(candidate + ChronoDuration::days(1));
            }
            return Ok(candidate);
        }
    }

    if let Some(weekday) = parse_weekday_word(trimmed) {
        return Ok(next_weekday(now, weekday));
    }

    Err(TimeParseError::Unrecognized(input.to_string()))
}

fn apply_ampm(hour: u32, ampm: &str) -> u32 {
    let ampm = ampm.to_lowercase();
    if ampm == "pm" && hour < 12 {
        hour + 12
    } else if ampm == "am" && hour == 12 {
        0
    } else {
        hour
    }
}

fn apply_period(hour: u32, period: Option<&str>) -> u32 {
    match period {
        Some("下午") | Some("午後") if hour < 12 => hour + 12,
        Some("上午") | Some("午前") if hour == 12 => 0,
        _ => hour,
    }
}

/// The next time `hour:minute` occurs at or after `now` (today if still
/// ahead, otherwise tomorrow).
fn next_occurrence_of(now: DateTime<Local>, hour: u32, minute: u32) -> Result<DateTime<Local>, TimeParseError> {
    let today_candidate = Local
        .from_local_datetime(&now.date_naive().and_time(NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| TimeParseError::Unrecognized(format!("{hour}:{minute}")))?))
        .single()
        .ok_or_else(|| TimeParseError::Unrecognized(format!("{hour}:{minute}")))?;
    if today_candidate > now {
        Ok(today_candidate)
    } else {
        Ok(today_candidate + ChronoDuration::days(1))
    }
}

fn parse_weekday_word(s: &str) -> Option<Weekday> {
    match s.to_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn next_weekday(now: DateTime<Local>, target: Weekday) -> DateTime<Local> {
    let mut days_ahead = (target.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64).rem_euclid(7);
    if days_ahead == 0 {
        days_ahead = 7;
    }
    let date = now.date_naive() + ChronoDuration::days(days_ahead);
    Local.from_local_datetime(&date.and_time(now.time().with_second(0).unwrap_or(now.time()))).single().unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_relative_minutes_english() {
        let now = fixed_now();
        let parsed = parse_relative_to("5 min", now).unwrap();
        assert_eq!(parsed, now + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_relative_minutes_japanese() {
        let now = fixed_now();
        let parsed = parse_relative_to("5分後", now).unwrap();
        assert_eq!(parsed, now + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_tomorrow_japanese_with_hour() {
        let now = fixed_now();
        let parsed = parse_relative_to("明日3時", now).unwrap();
        assert_eq!(parsed.date_naive(), now.date_naive() + ChronoDuration::days(1));
        assert_eq!(parsed.time().hour(), 3);
    }

    #[test]
    fn test_chinese_afternoon_today_if_still_ahead() {
        let now = fixed_now(); // 10:00
        let parsed = parse_relative_to("下午3點", now).unwrap();
        assert_eq!(parsed.date_naive(), now.date_naive());
        assert_eq!(parsed.time().hour(), 15);
    }

    #[test]
    fn test_chinese_afternoon_rolls_to_tomorrow_if_past() {
        let now = Local.with_ymd_and_hms(2026, 1, 15, 16, 0, 0).unwrap();
        let parsed = parse_relative_to("下午3點", now).unwrap();
        assert_eq!(parsed.date_naive(), now.date_naive() + ChronoDuration::days(1));
    }

    #[test]
    fn test_bare_clock_time_rolls_to_tomorrow_if_past() {
        let now = fixed_now(); // 10:00
        let parsed = parse_relative_to("9:00", now).unwrap();
        assert_eq!(parsed.date_naive(), now.date_naive() + ChronoDuration::days(1));
    }

    #[test]
    fn test_iso_strict_layout() {
        let now = fixed_now();
        let parsed = parse_relative_to("2026-02-01T00:00:00+08:00", now).unwrap();
        assert_eq!(parsed.year(), 2026);
    }

    #[test]
    fn test_unparsable_returns_error() {
        let now = fixed_now();
        assert!(parse_relative_to("whenever, man", now).is_err());
    }
}
