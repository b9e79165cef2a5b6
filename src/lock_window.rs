//! Recurring lock-window evaluation for bus-stock sheets.
//!
//! A sheet can be locked manually, or on a recurring schedule: a lock time,
//! an optional unlock time, and an optional set of active weekdays. The
//! evaluation is a pure function of the schedule and "now"; callers must
//! re-evaluate on every permission check rather than cache the answer,
//! since "now" is the only changing input.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde_json::Value;

/// A recurring lock window. Embedded in sheet records as a JSON field,
/// never persisted in evaluated form.
#[derive(Debug, Clone, PartialEq)]
pub struct LockSchedule {
    pub lock_time: NaiveTime,
    /// Absent means "locked from `lock_time` to end of day".
    pub unlock_time: Option<NaiveTime>,
    /// Empty means "every day".
    pub days_active: HashSet<Weekday>,
}

impl LockSchedule {
    pub fn new(
        lock_time: NaiveTime,
        unlock_time: Option<NaiveTime>,
        days_active: impl IntoIterator<Item = Weekday>,
    ) -> Self {
        Self { lock_time, unlock_time, days_active: days_active.into_iter().collect() }
    }

    /// Parse the embedded JSON form:
    /// `{"lockTime":"22:00","unlockTime":"06:00","daysToLock":[0,5]}`
    /// where day numbers count from Sunday.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let lock_time = parse_hhmm(value.get("lockTime")?.as_str()?)?;
        let unlock_time = value
            .get("unlockTime")
            .and_then(Value::as_str)
            .and_then(parse_hhmm);
        let days_active = value
            .get("daysToLock")
            .and_then(Value::as_array)
            .map(|days| {
                days.iter()
                    .filter_map(Value::as_u64)
                    .filter_map(weekday_from_sunday_index)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { lock_time, unlock_time, days_active })
    }

    /// Is the window locked at `now`?
    ///
    /// Three window shapes:
    /// - no unlock time: locked from lock time to end of day
    /// - lock before unlock: locked inside `[lock, unlock)` the same day
    /// - lock at/after unlock: the window wraps past midnight
    pub fn is_locked(&self, now: NaiveDateTime) -> bool {
        if !self.days_active.is_empty() && !self.days_active.contains(&now.weekday()) {
            return false;
        }

        let now_minutes = minutes_since_midnight(now.time());
        let lock_minutes = minutes_since_midnight(self.lock_time);

        match self.unlock_time {
            None => now_minutes >= lock_minutes,
            Some(unlock) => {
                let unlock_minutes = minutes_since_midnight(unlock);
                if lock_minutes < unlock_minutes {
                    now_minutes >= lock_minutes && now_minutes < unlock_minutes
                } else {
                    now_minutes >= lock_minutes || now_minutes < unlock_minutes
                }
            }
        }
    }
}

/// Combined lock state of a sheet: a manual flag wins outright, otherwise
/// the schedule decides.
pub fn sheet_locked(manually_locked: bool, schedule: Option<&LockSchedule>, now: NaiveDateTime) -> bool {
    if manually_locked {
        return true;
    }
    schedule.map(|s| s.is_locked(now)).unwrap_or(false)
}

fn minutes_since_midnight(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

fn weekday_from_sunday_index(day: u64) -> Option<Weekday> {
    match day {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}
