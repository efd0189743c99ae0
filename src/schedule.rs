//! Business-hours evaluation for queue weekly schedules.
//!
//! Windows are evaluated in UTC; tenant-local time is the concern of
//! whatever writes the schedule.

use chrono::{DateTime, Datelike, Utc};

use crate::model::DaySchedule;

/// Whether `now` falls inside business hours.
///
/// An empty schedule means always open. A non-empty schedule with no
/// entry for today's weekday means closed today. An entry with
/// `start > end` wraps past midnight.
pub fn is_within_hours(schedule: &[DaySchedule], now: DateTime<Utc>) -> bool {
    if schedule.is_empty() {
        return true;
    }

    let weekday = now.weekday();
    let time = now.time();

    schedule
        .iter()
        .filter(|day| day.weekday == weekday)
        .any(|day| {
            if day.start <= day.end {
                day.start <= time && time <= day.end
            } else {
                time >= day.start || time <= day.end
            }
        })
}
