//! Recurring-schedule and quiet-hours time math shared by the fact/trigger
//! extractor (C6) and the scheduler/gardener (C10/C11).

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::schema::{RecurringSpec, RecurringType};

/// Compute the next `trigger_at` (UTC) for `spec`, strictly after `after`,
/// evaluated in `tz`.
///
/// - `daily` advances by 24h.
/// - `weekdays` skips Saturday/Sunday.
/// - `weekends` fires only Saturday/Sunday.
/// - `weekly` advances by 7 days, anchored on `day_of_week`.
pub fn next_occurrence(spec: &RecurringSpec, after: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_after = after.with_timezone(&tz);
    let mut candidate = local_after
        .date_naive()
        .and_hms_opt(spec.hour, spec.minute, 0)
        .expect("hour/minute validated by caller");
    let mut candidate = tz.from_local_datetime(&candidate).single().unwrap_or_else(|| {
        // Ambiguous/nonexistent local time (DST transition) — fall back to
        // the next day at the same wall-clock time.
        candidate += chrono::Duration::days(1);
        tz.from_local_datetime(&candidate).earliest().expect("resolves after shifting a day")
    });

    if candidate <= local_after {
        candidate += Duration::days(1);
    }

    loop {
        let weekday = candidate.weekday().num_days_from_sunday();
        let satisfies = match spec.recurring_type {
            RecurringType::Daily => true,
            RecurringType::Weekdays => (1..=5).contains(&weekday),
            RecurringType::Weekends => weekday == 0 || weekday == 6,
            RecurringType::Weekly => spec.day_of_week.is_none_or(|dow| dow == weekday),
        };
        if satisfies {
            break;
        }
        candidate += Duration::days(1);
    }

    candidate.with_timezone(&Utc)
}

/// Quiet-hours window check with midnight wrap-around, e.g. `[23, 5)`
/// covers 23, 0, 1, 2, 3, 4.
pub fn is_in_window(hour: u32, start_hour: u32, end_hour: u32) -> bool {
    if start_hour == end_hour {
        return true; // a zero-width window is interpreted as "always on"
    }
    if start_hour < end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_recurrence_advances_24h() {
        let tz: Tz = "Europe/Dublin".parse().unwrap();
        let spec = RecurringSpec { recurring_type: RecurringType::Daily, hour: 9, minute: 0, day_of_week: None };
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 1).unwrap();
        let next = next_occurrence(&spec, now, tz);
        let local = next.with_timezone(&tz);
        assert_eq!(local.hour(), 9);
        assert_eq!(local.minute(), 0);
        assert!(next > now);
    }

    #[test]
    fn weekdays_skip_weekend() {
        let tz: Tz = "UTC".parse().unwrap();
        let spec = RecurringSpec { recurring_type: RecurringType::Weekdays, hour: 9, minute: 0, day_of_week: None };
        // 2026-07-31 is a Friday; next weekday occurrence should be Monday 2026-08-03.
        let friday = Utc.with_ymd_and_hms(2026, 7, 31, 10, 0, 0).unwrap();
        let next = next_occurrence(&spec, friday, tz);
        assert_eq!(next.weekday().num_days_from_sunday(), 1); // Monday
    }

    #[test]
    fn weekends_only_fire_saturday_sunday() {
        let tz: Tz = "UTC".parse().unwrap();
        let spec = RecurringSpec { recurring_type: RecurringType::Weekends, hour: 9, minute: 0, day_of_week: None };
        let wednesday = Utc.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
        let next = next_occurrence(&spec, wednesday, tz);
        let w = next.weekday().num_days_from_sunday();
        assert!(w == 0 || w == 6);
    }

    #[test]
    fn quiet_hours_window_wraps_midnight() {
        assert!(is_in_window(23, 23, 5));
        assert!(is_in_window(0, 23, 5));
        assert!(is_in_window(4, 23, 5));
        assert!(!is_in_window(5, 23, 5));
        assert!(!is_in_window(22, 23, 5));
    }

    #[test]
    fn quiet_hours_window_without_wrap() {
        assert!(is_in_window(10, 9, 17));
        assert!(!is_in_window(8, 9, 17));
        assert!(!is_in_window(17, 9, 17));
    }
}
