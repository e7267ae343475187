//! Schedules and partition arithmetic.
//!
//! A schedule defines the set of valid partition instants of a workflow. An
//! instant is *aligned* iff it equals the start of some partition. The closed
//! unit schedules partition UTC time into hours, days, ISO weeks, calendar
//! months and years; arbitrary partitionings are expressed as cron
//! expressions (5- or 6-field, seconds optional).
//!
//! Partition parameters are the canonical textual renderings of aligned
//! instants:
//!
//! | Schedule | Parameter |
//! |----------|-----------|
//! | hours    | `2017-01-02T03` |
//! | days     | `2017-01-02` |
//! | weeks    | `2017-01-02` (the Monday of the ISO week) |
//! | months   | `2017-01` |
//! | years    | `2017` |
//! | cron     | `2017-01-02T03:04:05Z` |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Search windows used to locate the previous fire time of a cron schedule,
/// widened until a fire time is found.
const CRON_LOOKBACK_DAYS: [i64; 4] = [1, 40, 400, 1600];

/// The partitioning of a workflow's executions over time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Schedule {
    /// One partition per hour.
    Hours,
    /// One partition per day.
    Days,
    /// One partition per ISO week, starting Monday.
    Weeks,
    /// One partition per calendar month.
    Months,
    /// One partition per calendar year.
    Years,
    /// Partitions at the fire times of a cron expression.
    Cron(String),
}

impl Schedule {
    /// Returns true iff `instant` is the start of a partition.
    #[must_use]
    pub fn is_aligned(&self, instant: DateTime<Utc>) -> bool {
        match self {
            Self::Cron(expression) => cron_schedule(expression).is_ok_and(|schedule| {
                schedule
                    .after(&(instant - Duration::seconds(1)))
                    .next()
                    .is_some_and(|next| next == instant)
            }),
            _ => self
                .truncate_instant(instant)
                .is_ok_and(|truncated| truncated == instant),
        }
    }

    /// Truncates `instant` down to the start of the partition containing it.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid cron expression or when no fire time
    /// precedes `instant` within the search horizon.
    pub fn truncate_instant(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let date = instant.date_naive();
        let truncated = match self {
            Self::Hours => date.and_hms_opt(instant.hour(), 0, 0),
            Self::Days => date.and_hms_opt(0, 0, 0),
            Self::Weeks => date.week(Weekday::Mon).first_day().and_hms_opt(0, 0, 0),
            Self::Months => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            Self::Years => {
                NaiveDate::from_ymd_opt(date.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
            Self::Cron(_) => {
                return if self.is_aligned(instant) {
                    Ok(instant)
                } else {
                    self.previous_instant(instant)
                };
            }
        };
        truncated.map(|t| t.and_utc()).ok_or_else(|| Error::OutOfRange {
            message: format!("cannot truncate {instant} to {self}"),
        })
    }

    /// Returns the first aligned instant strictly after `instant`.
    ///
    /// # Errors
    ///
    /// Returns an error on instant overflow or an invalid cron expression.
    pub fn next_instant(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Hours => Ok(self.truncate_instant(instant)? + Duration::hours(1)),
            Self::Days => Ok(self.truncate_instant(instant)? + Duration::days(1)),
            Self::Weeks => Ok(self.truncate_instant(instant)? + Duration::days(7)),
            Self::Months => self
                .truncate_instant(instant)?
                .checked_add_months(Months::new(1))
                .ok_or_else(|| out_of_range("month increment", instant)),
            Self::Years => self
                .truncate_instant(instant)?
                .checked_add_months(Months::new(12))
                .ok_or_else(|| out_of_range("year increment", instant)),
            Self::Cron(expression) => cron_schedule(expression)?
                .after(&instant)
                .next()
                .ok_or_else(|| out_of_range("cron has no further fire times", instant)),
        }
    }

    /// Returns the last aligned instant strictly before `instant`.
    ///
    /// # Errors
    ///
    /// Returns an error on instant underflow, an invalid cron expression, or
    /// when no cron fire time exists within the search horizon.
    pub fn previous_instant(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Self::Cron(expression) = self {
            let schedule = cron_schedule(expression)?;
            for days in CRON_LOOKBACK_DAYS {
                let fire = schedule
                    .after(&(instant - Duration::days(days)))
                    .take_while(|t| *t < instant)
                    .last();
                if let Some(fire) = fire {
                    return Ok(fire);
                }
            }
            return Err(out_of_range("no cron fire time within lookback", instant));
        }

        let truncated = self.truncate_instant(instant)?;
        if truncated < instant {
            return Ok(truncated);
        }
        match self {
            Self::Hours => Ok(truncated - Duration::hours(1)),
            Self::Days => Ok(truncated - Duration::days(1)),
            Self::Weeks => Ok(truncated - Duration::days(7)),
            Self::Months => truncated
                .checked_sub_months(Months::new(1))
                .ok_or_else(|| out_of_range("month decrement", instant)),
            Self::Years => truncated
                .checked_sub_months(Months::new(12))
                .ok_or_else(|| out_of_range("year decrement", instant)),
            // Handled by the early return above.
            Self::Cron(_) => Err(out_of_range("no cron fire time within lookback", instant)),
        }
    }

    /// Returns the first aligned instant at or after `instant`.
    ///
    /// # Errors
    ///
    /// Returns an error on instant overflow or an invalid cron expression.
    pub fn first_instant_at_or_after(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.is_aligned(instant) {
            Ok(instant)
        } else {
            self.next_instant(instant)
        }
    }

    /// Enumerates the aligned instants in `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start` is not aligned or instant arithmetic
    /// fails.
    pub fn instants_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if !self.is_aligned(start) {
            return Err(Error::UnalignedInstant {
                instant: start,
                schedule: self.to_string(),
            });
        }

        let mut instants = Vec::new();
        let mut cursor = start;
        while cursor < end {
            instants.push(cursor);
            cursor = self.next_instant(cursor)?;
        }
        Ok(instants)
    }

    /// Renders an aligned instant as its canonical partition parameter.
    #[must_use]
    pub fn to_parameter(&self, instant: DateTime<Utc>) -> String {
        match self {
            Self::Hours => instant.format("%Y-%m-%dT%H").to_string(),
            Self::Days | Self::Weeks => instant.format("%Y-%m-%d").to_string(),
            Self::Months => instant.format("%Y-%m").to_string(),
            Self::Years => instant.format("%Y").to_string(),
            Self::Cron(_) => instant.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    /// Parses a partition parameter back to its instant.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter does not match the schedule's
    /// canonical rendering.
    pub fn parse_parameter(&self, parameter: &str) -> Result<DateTime<Utc>> {
        let invalid = || Error::InvalidParameter {
            parameter: parameter.to_string(),
            schedule: self.to_string(),
        };

        let parsed = match self {
            Self::Hours => {
                NaiveDateTime::parse_from_str(&format!("{parameter}:00"), "%Y-%m-%dT%H:%M")
                    .ok()
                    .map(|t| t.and_utc())
            }
            Self::Days | Self::Weeks => NaiveDate::parse_from_str(parameter, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc()),
            Self::Months => NaiveDate::parse_from_str(&format!("{parameter}-01"), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc()),
            Self::Years => NaiveDate::parse_from_str(&format!("{parameter}-01-01"), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc()),
            Self::Cron(_) => DateTime::parse_from_rfc3339(parameter)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        };
        parsed.ok_or_else(invalid)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hours => write!(f, "hours"),
            Self::Days => write!(f, "days"),
            Self::Weeks => write!(f, "weeks"),
            Self::Months => write!(f, "months"),
            Self::Years => write!(f, "years"),
            Self::Cron(expression) => write!(f, "{expression}"),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hours" | "hourly" | "@hourly" => Ok(Self::Hours),
            "days" | "daily" | "@daily" => Ok(Self::Days),
            "weeks" | "weekly" | "@weekly" => Ok(Self::Weeks),
            "months" | "monthly" | "@monthly" => Ok(Self::Months),
            "years" | "yearly" | "annually" | "@annually" | "@yearly" => Ok(Self::Years),
            _ => {
                // Anything else must be a valid cron expression.
                cron_schedule(s)?;
                Ok(Self::Cron(s.trim().to_string()))
            }
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a cron expression, normalizing 5-field syntax to 6-field with
/// seconds.
fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();
    let normalized = match field_count {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(Error::InvalidSchedule {
                expression: expression.to_string(),
                message: format!("expected 5 or 6 fields, found {field_count}"),
            });
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| Error::InvalidSchedule {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn out_of_range(message: &str, instant: DateTime<Utc>) -> Error {
    Error::OutOfRange {
        message: format!("{message} at {instant}"),
    }
}
