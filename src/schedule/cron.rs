//! Five-field cron expressions with a local time-of-day window.

use crate::config::ScheduleDefinition;
use crate::error::{ReplicationError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Years searched by [`CronSchedule::next_after`] before giving up.
const SEARCH_HORIZON_YEARS: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            // 7 is accepted as an alias for Sunday and folded into 0.
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            FieldKind::Month => &MONTH_NAMES,
            FieldKind::DayOfWeek => &WEEKDAY_NAMES,
            _ => &[],
        }
    }

    fn first_name_value(self) -> u32 {
        match self {
            FieldKind::Month => 1,
            _ => 0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }
}

/// One parsed cron field as a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    mask: u64,
    /// `false` when the expression starts with `*`.
    restricted: bool,
}

impl CronField {
    fn parse(expr: &str, kind: FieldKind) -> Result<Self> {
        let invalid = |reason: &str| {
            ReplicationError::Config(format!("invalid {} field '{expr}': {reason}", kind.label()))
        };
        let (min, max) = kind.bounds();
        let expr_lc = expr.trim().to_ascii_lowercase();
        if expr_lc.is_empty() {
            return Err(invalid("empty"));
        }

        let mut mask = 0u64;
        for part in expr_lc.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                    if step == 0 {
                        return Err(invalid("step must be positive"));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (value(a, kind).ok_or_else(|| invalid("bad value"))?, value(b, kind).ok_or_else(|| invalid("bad value"))?)
            } else {
                let a = value(range, kind).ok_or_else(|| invalid("bad value"))?;
                // `5/15` means "from 5 every 15".
                if step > 1 {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            if start < min || end > max || start > end {
                return Err(invalid("value out of range"));
            }

            let mut v = start;
            while v <= end {
                mask |= 1 << v;
                v += step;
            }
        }

        if kind == FieldKind::DayOfWeek && mask & (1 << 7) != 0 {
            mask = (mask & !(1 << 7)) | 1;
        }

        Ok(Self {
            mask,
            restricted: !expr_lc.starts_with('*'),
        })
    }

    fn contains(&self, v: u32) -> bool {
        v < 64 && self.mask & (1 << v) != 0
    }
}

fn value(text: &str, kind: FieldKind) -> Option<u32> {
    if let Ok(v) = text.parse::<u32>() {
        return Some(v);
    }
    kind.names()
        .iter()
        .position(|name| *name == text)
        .map(|idx| idx as u32 + kind.first_name_value())
}

/// A cron expression restricted to a local time-of-day window.
///
/// The window is inclusive at both ends. When `begin > end` it spans
/// midnight (`22:00`..`02:00`).
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    begin: NaiveTime,
    end: NaiveTime,
}

impl CronSchedule {
    /// Parse a space-separated five-field expression with a full-day window.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ReplicationError::Config(format!(
                "cron expression '{expression}' must have 5 fields, got {}",
                fields.len()
            )));
        }
        Self::from_fields(
            [fields[0], fields[1], fields[2], fields[3], fields[4]],
            NaiveTime::MIN,
            end_of_day(),
        )
    }

    /// Build from a configuration block.
    pub fn from_definition(def: &ScheduleDefinition) -> Result<Self> {
        let begin = parse_time_of_day(&def.begin)?;
        let end = parse_time_of_day(&def.end)?;
        Self::from_fields(
            [&def.minute, &def.hour, &def.day_of_month, &def.month, &def.day_of_week],
            begin,
            end,
        )
    }

    fn from_fields(fields: [&str; 5], begin: NaiveTime, end: NaiveTime) -> Result<Self> {
        Ok(Self {
            expression: fields.join(" "),
            minute: CronField::parse(fields[0], FieldKind::Minute)?,
            hour: CronField::parse(fields[1], FieldKind::Hour)?,
            day_of_month: CronField::parse(fields[2], FieldKind::DayOfMonth)?,
            month: CronField::parse(fields[3], FieldKind::Month)?,
            day_of_week: CronField::parse(fields[4], FieldKind::DayOfWeek)?,
            begin,
            end,
        })
    }

    /// Replace the time-of-day window.
    pub fn with_window(mut self, begin: NaiveTime, end: NaiveTime) -> Self {
        self.begin = begin;
        self.end = end;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// `true` if `time` lies in the window.
    pub fn in_window(&self, time: NaiveTime) -> bool {
        if self.begin <= self.end {
            self.begin <= time && time <= self.end
        } else {
            time >= self.begin || time <= self.end
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self.day_of_week.contains(date.weekday().num_days_from_sunday());
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// `true` if the five fields match the minute containing `dt`.
    pub fn matches(&self, dt: NaiveDateTime) -> bool {
        self.minute.contains(dt.minute())
            && self.hour.contains(dt.hour())
            && self.month.contains(dt.month())
            && self.day_matches(dt.date())
    }

    /// First matching minute strictly after `dt`. Ignores the window.
    pub fn next_after(&self, dt: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut candidate = truncate_to_minute(dt);
        if candidate <= dt {
            candidate += Duration::minutes(1);
        }
        let horizon = dt.year() + SEARCH_HORIZON_YEARS;

        while candidate.year() <= horizon {
            if !self.month.contains(candidate.month()) {
                let (y, m) = if candidate.month() == 12 {
                    (candidate.year() + 1, 1)
                } else {
                    (candidate.year(), candidate.month() + 1)
                };
                candidate = NaiveDate::from_ymd_opt(y, m, 1)?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.hour.contains(candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// `true` if a tick at `dt` is due.
    ///
    /// The next occurrence after `dt - 1s` must be exactly `dt`, so ticks
    /// carrying seconds never fire.
    pub fn should_run(&self, dt: NaiveDateTime) -> bool {
        self.in_window(dt.time()) && self.next_after(dt - Duration::seconds(1)) == Some(dt)
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-{})", self.expression, self.begin.format("%H:%M"), self.end.format("%H:%M"))
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

/// Parse `HH:MM`.
pub fn parse_time_of_day(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .map_err(|e| ReplicationError::Config(format!("invalid time of day '{text}': {e}")))
}

pub(crate) fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(dt)
}
