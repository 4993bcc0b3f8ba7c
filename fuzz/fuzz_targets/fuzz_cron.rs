//! Fuzz target for cron expression parsing.
//!
//! Arbitrary expressions must parse or fail cleanly, and any schedule that
//! parses must agree with itself about its next occurrence.

#![no_main]

use chrono::NaiveDate;
use libfuzzer_sys::fuzz_target;
use snapshot_replication::CronSchedule;

fuzz_target!(|data: (&str, u32)| {
    let (expression, minutes) = data;

    let Ok(schedule) = CronSchedule::parse(expression) else {
        return;
    };

    let base = NaiveDate::from_ymd_opt(2021, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid base");
    let from = base + chrono::Duration::minutes(i64::from(minutes % (60 * 24 * 366 * 4)));
    if let Some(next) = schedule.next_after(from) {
        assert!(next > from);
        assert!(schedule.matches(next));
    }
});
