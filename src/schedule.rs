//! Schedule calculation for recurring tasks.
//!
//! All arithmetic is done in UTC. Every computed run is strictly after the
//! reference instant, so feeding a result back in as the next reference
//! always advances.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest day-of-month accepted; every month has at least this many days.
pub const MAX_DAY_OF_MONTH: u32 = 28;

/// Errors from malformed schedule inputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("weekly schedule requires a day of week")]
    MissingDayOfWeek,

    #[error("day of week {0} out of range 0..=6 (0 = Sunday)")]
    InvalidDayOfWeek(u32),

    #[error("monthly schedule requires a day of month")]
    MissingDayOfMonth,

    #[error("day of month {0} out of range 1..=28")]
    InvalidDayOfMonth(u32),

    #[error("unknown frequency '{0}'")]
    UnknownFrequency(String),
}

/// How often a recurring task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(ScheduleError::UnknownFrequency(other.to_string())),
        }
    }
}

/// Parses `HH:MM` (or `HH:MM:SS`, seconds dropped) into a time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ScheduleError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
        .and_then(|t| t.with_second(0))
        .ok_or_else(|| ScheduleError::InvalidTime(value.to_string()))
}

/// A validated recurrence rule.
///
/// Day fields that do not apply to the frequency are discarded, so a
/// `Schedule` only ever carries the fields its frequency reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleRecord", into = "ScheduleRecord")]
pub struct Schedule {
    frequency: Frequency,
    time: NaiveTime,
    day_of_week: Option<u32>,
    day_of_month: Option<u32>,
}

impl Schedule {
    /// Validates and builds a schedule.
    pub fn new(
        frequency: Frequency,
        time: NaiveTime,
        day_of_week: Option<u32>,
        day_of_month: Option<u32>,
    ) -> Result<Self, ScheduleError> {
        let time = time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| ScheduleError::InvalidTime(time.to_string()))?;

        let (day_of_week, day_of_month) = match frequency {
            Frequency::Hourly | Frequency::Daily => (None, None),
            Frequency::Weekly => {
                let dow = day_of_week.ok_or(ScheduleError::MissingDayOfWeek)?;
                if dow > 6 {
                    return Err(ScheduleError::InvalidDayOfWeek(dow));
                }
                (Some(dow), None)
            }
            Frequency::Monthly => {
                let dom = day_of_month.ok_or(ScheduleError::MissingDayOfMonth)?;
                if !(1..=MAX_DAY_OF_MONTH).contains(&dom) {
                    return Err(ScheduleError::InvalidDayOfMonth(dom));
                }
                (None, Some(dom))
            }
        };

        Ok(Self {
            frequency,
            time,
            day_of_week,
            day_of_month,
        })
    }

    /// Builds a schedule from its stored textual form.
    pub fn parse(
        frequency: &str,
        time_of_day: &str,
        day_of_week: Option<u32>,
        day_of_month: Option<u32>,
    ) -> Result<Self, ScheduleError> {
        Self::new(
            frequency.parse()?,
            parse_time_of_day(time_of_day)?,
            day_of_week,
            day_of_month,
        )
    }

    pub fn hourly(minute: u32) -> Result<Self, ScheduleError> {
        let time = NaiveTime::from_hms_opt(0, minute, 0)
            .ok_or_else(|| ScheduleError::InvalidTime(format!("00:{minute:02}")))?;
        Self::new(Frequency::Hourly, time, None, None)
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// Time of day rendered as `HH:MM`.
    pub fn time_of_day(&self) -> String {
        self.time.format("%H:%M").to_string()
    }

    /// Configured weekday, 0 = Sunday.
    pub fn day_of_week(&self) -> Option<u32> {
        self.day_of_week
    }

    pub fn day_of_month(&self) -> Option<u32> {
        self.day_of_month
    }

    /// Next run strictly after `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let today = reference.date_naive();
        match self.frequency {
            Frequency::Hourly => {
                let candidate = today
                    .and_hms_opt(reference.hour(), self.time.minute(), 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(reference);
                if candidate > reference {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Frequency::Daily => {
                let candidate = at(today, self.time);
                if candidate > reference {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Frequency::Weekly => {
                let target = self.day_of_week.unwrap_or(0) as i64;
                let current = reference.weekday().num_days_from_sunday() as i64;
                let ahead = (target - current).rem_euclid(7);
                let candidate = at(today + Duration::days(ahead), self.time);
                if candidate > reference {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
            Frequency::Monthly => {
                let day = self.day_of_month.unwrap_or(1) as i64;
                let first = first_of_month(today);
                let candidate = at(first + Duration::days(day - 1), self.time);
                if candidate > reference {
                    candidate
                } else {
                    let next_first = first_of_month(first + Duration::days(32));
                    at(next_first + Duration::days(day - 1), self.time)
                }
            }
        }
    }
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

/// Serialized form of a [`Schedule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub frequency: Frequency,
    pub time_of_day: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
}

impl TryFrom<ScheduleRecord> for Schedule {
    type Error = ScheduleError;

    fn try_from(record: ScheduleRecord) -> Result<Self, Self::Error> {
        Schedule::new(
            record.frequency,
            parse_time_of_day(&record.time_of_day)?,
            record.day_of_week,
            record.day_of_month,
        )
    }
}

impl From<Schedule> for ScheduleRecord {
    fn from(schedule: Schedule) -> Self {
        Self {
            frequency: schedule.frequency,
            time_of_day: schedule.time_of_day(),
            day_of_week: schedule.day_of_week,
            day_of_month: schedule.day_of_month,
        }
    }
}

/// Computes the next run strictly after `reference`.
///
/// `day_of_week` (0 = Sunday) is read only for weekly schedules and
/// `day_of_month` (1..=28) only for monthly ones.
pub fn next_run(
    frequency: Frequency,
    time_of_day: &str,
    day_of_week: Option<u32>,
    day_of_month: Option<u32>,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = Schedule::new(
        frequency,
        parse_time_of_day(time_of_day)?,
        day_of_week,
        day_of_month,
    )?;
    Ok(schedule.next_after(reference))
}
