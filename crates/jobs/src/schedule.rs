//! Cron normalization and due-check helpers.

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for
/// seconds; the `cron` crate wants `sec min hour dom month dow`.
pub fn normalize_cron(cron_5field: &str) -> String {
    let trimmed = cron_5field.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Check if a cron schedule is due at `now`.
///
/// A job is due if a scheduled tick falls after `last_run` and at or before
/// `now`. With no previous run, any tick within the past day counts.
pub fn is_cron_due(schedule: &Schedule, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
    let check_from = last_run.unwrap_or(now - chrono::Duration::days(1));
    match schedule.after(&check_from).next() {
        Some(next) => next <= now,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn schedule(expr: &str) -> Schedule {
        Schedule::from_str(&normalize_cron(expr)).unwrap()
    }

    #[test]
    fn test_normalize_adds_seconds_field() {
        assert_eq!(normalize_cron("*/10 * * * *"), "0 */10 * * * *");
        assert_eq!(normalize_cron("0 */3 * * *"), "0 0 */3 * * *");
        // Already six fields passes through.
        assert_eq!(normalize_cron("0 0 */6 * * *"), "0 0 */6 * * *");
    }

    #[test]
    fn test_due_without_last_run() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();
        assert!(is_cron_due(&schedule("* * * * *"), now, None));
    }

    #[test]
    fn test_not_due_again_within_same_window() {
        let every_ten = schedule("*/10 * * * *");
        let ran_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 10, 1).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 15, 0).unwrap();
        assert!(!is_cron_due(&every_ten, now, Some(ran_at)));
    }

    #[test]
    fn test_due_at_next_boundary() {
        let every_ten = schedule("*/10 * * * *");
        let ran_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 10, 1).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 20, 5).unwrap();
        assert!(is_cron_due(&every_ten, now, Some(ran_at)));
    }

    #[test]
    fn test_three_hour_schedule() {
        let every_three_hours = schedule("0 */3 * * *");
        let ran_at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 2).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 11, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 40).unwrap();
        assert!(!is_cron_due(&every_three_hours, before, Some(ran_at)));
        assert!(is_cron_due(&every_three_hours, after, Some(ran_at)));
    }
}
