//! Minute-granular wall clock.
//!
//! [`Clock::tick`] resolves once per minute boundary. Sleeps are capped at
//! [`MAX_SLEEP`] so an interrupt is never more than a few seconds late even if
//! the notification is missed, and a time source stepping backwards is
//! treated as "not yet".

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Upper bound for a single sleep between time checks.
pub const MAX_SLEEP: Duration = Duration::from_secs(10);

/// Source of the current UTC instant.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    /// Current instant truncated to the minute.
    pub datetime: DateTime<Utc>,
    /// `true` if the tick was produced by an interrupt rather than a new minute.
    pub interrupted: bool,
}

pub struct Clock {
    source: Arc<dyn TimeSource>,
    once: bool,
    exhausted: bool,
    last: Option<DateTime<Utc>>,
    interrupt: Arc<Notify>,
}

impl Clock {
    pub fn new(source: Arc<dyn TimeSource>, once: bool) -> Self {
        Self {
            source,
            once,
            exhausted: false,
            last: None,
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Notifier that wakes a pending [`tick`](Self::tick) early.
    pub fn interrupt_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.interrupt)
    }

    /// Wait for the next tick. `None` once a run-once clock is exhausted.
    pub async fn tick(&mut self) -> Option<ClockTick> {
        if self.once {
            if self.exhausted {
                return None;
            }
            self.exhausted = true;
            return Some(ClockTick {
                datetime: truncate_to_minute(self.source.now()),
                interrupted: false,
            });
        }

        loop {
            let now = self.source.now();
            let minute = truncate_to_minute(now);

            match self.last {
                None => {
                    self.last = Some(minute);
                    return Some(ClockTick {
                        datetime: minute,
                        interrupted: false,
                    });
                }
                Some(last) if minute > last => {
                    if minute - last > ChronoDuration::minutes(1) {
                        debug!(from = %last, to = %minute, "Clock jumped forward");
                    }
                    self.last = Some(minute);
                    return Some(ClockTick {
                        datetime: minute,
                        interrupted: false,
                    });
                }
                Some(last) if minute < last => {
                    debug!(last = %last, now = %now, "Time source stepped backwards, waiting");
                }
                Some(_) => {}
            }

            let next_minute = minute + ChronoDuration::minutes(1);
            let sleep = (next_minute - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP)
                .max(Duration::from_millis(10));

            tokio::select! {
                biased;
                _ = self.interrupt.notified() => {
                    return Some(ClockTick {
                        datetime: self.last.map_or(minute, |last| last.max(minute)),
                        interrupted: true,
                    });
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

fn truncate_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(dt)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Time source that follows tokio's (pausable) clock from a fixed origin.
    pub(crate) struct TokioTimeSource {
        origin: DateTime<Utc>,
        started: tokio::time::Instant,
        skew: Mutex<ChronoDuration>,
    }

    impl TokioTimeSource {
        pub(crate) fn new(origin: DateTime<Utc>) -> Self {
            Self {
                origin,
                started: tokio::time::Instant::now(),
                skew: Mutex::new(ChronoDuration::zero()),
            }
        }

        pub(crate) fn step(&self, delta: ChronoDuration) {
            *self.skew.lock().unwrap() += delta;
        }
    }

    impl TimeSource for TokioTimeSource {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = ChronoDuration::from_std(self.started.elapsed()).unwrap();
            self.origin + elapsed + *self.skew.lock().unwrap()
        }
    }

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 21, 13, 0, 30).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_mode_single_tick() {
        let mut clock = Clock::new(Arc::new(TokioTimeSource::new(origin())), true);
        let tick = clock.tick().await.unwrap();
        assert_eq!(tick.datetime, Utc.with_ymd_and_hms(2021, 4, 21, 13, 0, 0).unwrap());
        assert!(!tick.interrupted);
        assert!(clock.tick().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_ticks_each_minute() {
        let mut clock = Clock::new(Arc::new(TokioTimeSource::new(origin())), false);
        let first = clock.tick().await.unwrap();
        let second = clock.tick().await.unwrap();
        let third = clock.tick().await.unwrap();
        assert_eq!(second.datetime - first.datetime, ChronoDuration::minutes(1));
        assert_eq!(third.datetime - second.datetime, ChronoDuration::minutes(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_jump_is_single_tick() {
        let source = Arc::new(TokioTimeSource::new(origin()));
        let mut clock = Clock::new(source.clone(), false);
        clock.tick().await.unwrap();
        source.step(ChronoDuration::hours(3));
        let tick = clock.tick().await.unwrap();
        assert_eq!(tick.datetime, Utc.with_ymd_and_hms(2021, 4, 21, 16, 0, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backward_step_waits() {
        let source = Arc::new(TokioTimeSource::new(origin()));
        let mut clock = Clock::new(source.clone(), false);
        clock.tick().await.unwrap();
        source.step(ChronoDuration::minutes(-2));
        let tick = clock.tick().await.unwrap();
        // No tick until the wall clock passes 13:00 again.
        assert_eq!(tick.datetime, Utc.with_ymd_and_hms(2021, 4, 21, 13, 1, 0).unwrap());
        assert!(tokio::time::Instant::now() - source.started >= Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_wakes_early() {
        let mut clock = Clock::new(Arc::new(TokioTimeSource::new(origin())), false);
        clock.tick().await.unwrap();
        clock.interrupt_handle().notify_one();
        let tick = clock.tick().await.unwrap();
        assert!(tick.interrupted);
        assert_eq!(tick.datetime, Utc.with_ymd_and_hms(2021, 4, 21, 13, 0, 0).unwrap());
    }
}
