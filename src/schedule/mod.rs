//! Time: cron matching, the minute clock, timezone projection and the
//! scheduler loop built on them.

pub mod clock;
pub mod cron;
pub mod scheduler;
pub mod tz_clock;

pub use clock::{Clock, ClockTick, SystemTimeSource, TimeSource};
pub use cron::CronSchedule;
pub use scheduler::{InterruptHandle, ScheduledTask, Scheduler, SchedulerTick};
pub use tz_clock::{TzClock, TzClockDateTime};
