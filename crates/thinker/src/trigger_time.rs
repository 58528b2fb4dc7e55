//! Parses the time phrase attached to a proactive trigger extracted from a
//! message ("remind me in 20 minutes", "tomorrow at 6pm", "every weekday at
//! 9am") into either an absolute `trigger_at` or a `RecurringSpec`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

use vesper_memory::schema::{RecurringSpec, RecurringType};
use vesper_memory::time::next_occurrence;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedTrigger {
    Absolute(DateTime<Utc>),
    Recurring(RecurringSpec),
}

static INTERVAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)in\s+(\d+)\s*(minute|min|hour|hr|day)s?").unwrap()
});
static AT_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap()
});
static RECURRING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)every\s+(day|weekday|weekend|monday|tuesday|wednesday|thursday|friday|saturday|sunday)").unwrap()
});

/// Parses `phrase` relative to `now`, interpreting bare times-of-day in `tz`.
/// Falls back to `now + 1 hour` when nothing recognisable is found, so a
/// caller always gets a usable `trigger_at`.
pub fn parse_trigger_phrase(phrase: &str, now: DateTime<Utc>, tz: Tz) -> ParsedTrigger {
    if let Some(spec) = parse_recurring(phrase) {
        return ParsedTrigger::Recurring(spec);
    }
    if let Some(interval) = parse_interval(phrase) {
        return ParsedTrigger::Absolute(now + interval);
    }
    if let Some(at) = parse_at_time(phrase, now, tz) {
        return ParsedTrigger::Absolute(at);
    }
    ParsedTrigger::Absolute(now + Duration::hours(1))
}

fn parse_interval(phrase: &str) -> Option<Duration> {
    let caps = INTERVAL_RE.captures(phrase)?;
    let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    Some(match unit.as_str() {
        "minute" | "min" => Duration::minutes(amount),
        "hour" | "hr" => Duration::hours(amount),
        "day" => Duration::days(amount),
        _ => return None,
    })
}

fn parse_at_time(phrase: &str, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let caps = AT_TIME_RE.captures(phrase)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    if let Some(ampm) = caps.get(3) {
        let is_pm = ampm.as_str().eq_ignore_ascii_case("pm");
        hour %= 12;
        if is_pm {
            hour += 12;
        }
    }
    if hour > 23 || minute > 59 {
        return None;
    }

    let local_now = now.with_timezone(&tz);
    let candidate_date = if phrase.to_ascii_lowercase().contains("tomorrow") {
        local_now.date_naive() + Duration::days(1)
    } else {
        local_now.date_naive()
    };
    let naive = candidate_date.and_hms_opt(hour, minute, 0)?;
    let mut local = tz.from_local_datetime(&naive).single()?;
    if local <= local_now {
        local += Duration::days(1);
    }
    Some(local.with_timezone(&Utc))
}

fn parse_recurring(phrase: &str) -> Option<RecurringSpec> {
    let caps = RECURRING_RE.captures(phrase)?;
    let unit = caps.get(1)?.as_str().to_ascii_lowercase();

    let (hour, minute) = AT_TIME_RE
        .captures(phrase)
        .and_then(|c| {
            let mut h: u32 = c.get(1)?.as_str().parse().ok()?;
            let m: u32 = c.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            if let Some(ampm) = c.get(3) {
                let is_pm = ampm.as_str().eq_ignore_ascii_case("pm");
                h %= 12;
                if is_pm {
                    h += 12;
                }
            }
            if h > 23 || m > 59 {
                return None;
            }
            Some((h, m))
        })
        .unwrap_or((9, 0));

    let (recurring_type, day_of_week) = match unit.as_str() {
        "day" => (RecurringType::Daily, None),
        "weekday" => (RecurringType::Weekdays, None),
        "weekend" => (RecurringType::Weekends, None),
        "monday" => (RecurringType::Weekly, Some(1)),
        "tuesday" => (RecurringType::Weekly, Some(2)),
        "wednesday" => (RecurringType::Weekly, Some(3)),
        "thursday" => (RecurringType::Weekly, Some(4)),
        "friday" => (RecurringType::Weekly, Some(5)),
        "saturday" => (RecurringType::Weekly, Some(6)),
        "sunday" => (RecurringType::Weekly, Some(0)),
        _ => return None,
    };

    Some(RecurringSpec { recurring_type, hour, minute, day_of_week })
}

/// Resolves a [`ParsedTrigger`] into a concrete `(trigger_at, recurring)`
/// pair ready for `ScheduledItem`.
pub fn resolve(parsed: &ParsedTrigger, now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, Option<RecurringSpec>) {
    match parsed {
        ParsedTrigger::Absolute(at) => (*at, None),
        ParsedTrigger::Recurring(spec) => (next_occurrence(spec, now, tz), Some(*spec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> Tz {
        "UTC".parse().unwrap()
    }

    #[test]
    fn interval_in_minutes() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let parsed = parse_trigger_phrase("remind me in 20 minutes", now, utc());
        assert_eq!(parsed, ParsedTrigger::Absolute(now + Duration::minutes(20)));
    }

    #[test]
    fn absolute_at_time_today_rolls_to_tomorrow_if_past() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 20, 0, 0).unwrap();
        let parsed = parse_trigger_phrase("check in at 6pm", now, utc());
        match parsed {
            ParsedTrigger::Absolute(at) => {
                assert!(at > now);
                assert_eq!(at.format("%H:%M").to_string(), "18:00");
            }
            _ => panic!("expected absolute"),
        }
    }

    #[test]
    fn recurring_every_weekday_at_nine() {
        let parsed = parse_trigger_phrase("every weekday at 9am check my calendar", Utc::now(), utc());
        assert_eq!(
            parsed,
            ParsedTrigger::Recurring(RecurringSpec { recurring_type: RecurringType::Weekdays, hour: 9, minute: 0, day_of_week: None })
        );
    }

    #[test]
    fn recurring_every_monday() {
        let parsed = parse_trigger_phrase("every monday send the report", Utc::now(), utc());
        assert_eq!(
            parsed,
            ParsedTrigger::Recurring(RecurringSpec { recurring_type: RecurringType::Weekly, hour: 9, minute: 0, day_of_week: Some(1) })
        );
    }

    #[test]
    fn unrecognised_phrase_falls_back_to_one_hour() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let parsed = parse_trigger_phrase("just ping me later", now, utc());
        assert_eq!(parsed, ParsedTrigger::Absolute(now + Duration::hours(1)));
    }
}
