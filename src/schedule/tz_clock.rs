//! Projection of UTC ticks into a configured local timezone.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// A tick in local time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TzClockDateTime {
    /// Local wall time, used for schedule matching.
    pub datetime: NaiveDateTime,
    /// Local time with its offset, used for naming.
    pub offset_aware: DateTime<FixedOffset>,
    pub utc: DateTime<Utc>,
    /// Set when local time went backwards but UTC did not (DST fall-back).
    /// Carries the local rewind plus the UTC advance since the previous tick.
    pub legit_step_back: Option<Duration>,
}

pub struct TzClock {
    tz: Tz,
    previous: Option<(NaiveDateTime, DateTime<Utc>)>,
}

impl TzClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz, previous: None }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn tick(&mut self, utc: DateTime<Utc>) -> TzClockDateTime {
        let local = utc.with_timezone(&self.tz);
        let naive = local.naive_local();

        let legit_step_back = match self.previous {
            Some((prev_naive, prev_utc)) if naive < prev_naive && utc >= prev_utc => {
                Some((prev_naive - naive) + (utc - prev_utc))
            }
            _ => None,
        };
        self.previous = Some((naive, utc));

        TzClockDateTime {
            datetime: naive,
            offset_aware: local.fixed_offset(),
            utc,
            legit_step_back,
        }
    }
}
