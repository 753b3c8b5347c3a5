//! Time model for write jobs
//!
//! All internal timestamps and durations are signed 64-bit nanoseconds.
//! Commands carry milliseconds since the Unix epoch; conversion happens at
//! the command boundary (`ms_to_ns`) and at status egress (`ns_to_ms`),
//! nowhere else.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const NS_PER_MS: i64 = 1_000_000;

/// Convert milliseconds since epoch (command boundary) to nanoseconds.
pub fn ms_to_ns(ms: i64) -> i64 {
    ms.saturating_mul(NS_PER_MS)
}

/// Convert nanoseconds to milliseconds since epoch (status boundary).
pub fn ns_to_ms(ns: i64) -> i64 {
    ns / NS_PER_MS
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall clock in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    ms_to_ns(now_ms())
}

/// Mutable stop time shared between the job controller, the demultiplexers
/// and the partition workers. `i64::MAX` means "no stop time set"; the job
/// then runs until a stop command arrives.
#[derive(Debug)]
pub struct StopTime(AtomicI64);

pub const STOP_TIME_NOT_SET: i64 = i64::MAX;

impl StopTime {
    pub fn unset() -> Self {
        StopTime(AtomicI64::new(STOP_TIME_NOT_SET))
    }

    pub fn at_ns(ns: i64) -> Self {
        StopTime(AtomicI64::new(ns))
    }

    pub fn set_ns(&self, ns: i64) {
        self.0.store(ns, Ordering::SeqCst);
    }

    pub fn get_ns(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.get_ns() != STOP_TIME_NOT_SET
    }
}

/// Where a message timestamp falls relative to the job window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    /// Before `start - start_leeway`: dropped silently.
    BeforeWindow,
    /// Within `[start - start_leeway, stop + stop_leeway]`: accepted.
    InsideWindow,
    /// After `stop + stop_leeway`: the source is finished.
    AfterWindow,
}

/// The `[start, stop]` window of one job with symmetric leeways that absorb
/// clock skew and broker lag. The stop time is shared and mutable because a
/// `FileWriter_stop` command may move it while partitions are consuming.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    start_ns: i64,
    start_leeway_ns: i64,
    stop: std::sync::Arc<StopTime>,
    stop_leeway_ns: i64,
}

impl TimeWindow {
    pub fn new(
        start_ns: i64,
        start_leeway_ns: i64,
        stop: std::sync::Arc<StopTime>,
        stop_leeway_ns: i64,
    ) -> Self {
        TimeWindow {
            start_ns,
            start_leeway_ns,
            stop,
            stop_leeway_ns,
        }
    }

    pub fn start_ns(&self) -> i64 {
        self.start_ns
    }

    /// The earliest timestamp this window accepts.
    pub fn earliest_ns(&self) -> i64 {
        self.start_ns.saturating_sub(self.start_leeway_ns)
    }

    /// The latest timestamp this window accepts, or `None` when no stop time
    /// is set yet.
    pub fn latest_ns(&self) -> Option<i64> {
        let stop = self.stop.get_ns();
        if stop == STOP_TIME_NOT_SET {
            None
        } else {
            Some(stop.saturating_add(self.stop_leeway_ns))
        }
    }

    pub fn stop(&self) -> &std::sync::Arc<StopTime> {
        &self.stop
    }

    pub fn check(&self, timestamp_ns: i64) -> WindowCheck {
        if timestamp_ns < self.earliest_ns() {
            return WindowCheck::BeforeWindow;
        }
        if let Some(latest) = self.latest_ns() {
            if timestamp_ns > latest {
                return WindowCheck::AfterWindow;
            }
        }
        WindowCheck::InsideWindow
    }

    /// True once the wall clock has passed `stop + grace`. Used by partition
    /// workers to retire even when the topic has gone quiet.
    pub fn stop_elapsed(&self, wall_clock_ns: i64, after_stop_grace_ns: i64) -> bool {
        let stop = self.stop.get_ns();
        stop != STOP_TIME_NOT_SET && wall_clock_ns > stop.saturating_add(after_stop_grace_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn window(start: i64, start_leeway: i64, stop: i64, stop_leeway: i64) -> TimeWindow {
        TimeWindow::new(start, start_leeway, Arc::new(StopTime::at_ns(stop)), stop_leeway)
    }

    #[test]
    fn boundaries_are_inclusive() {
        let w = window(1000, 100, 2000, 100);
        assert_eq!(w.check(900), WindowCheck::InsideWindow);
        assert_eq!(w.check(899), WindowCheck::BeforeWindow);
        assert_eq!(w.check(2100), WindowCheck::InsideWindow);
        assert_eq!(w.check(2101), WindowCheck::AfterWindow);
    }

    #[test]
    fn unset_stop_accepts_everything_after_start() {
        let w = TimeWindow::new(0, 0, Arc::new(StopTime::unset()), 0);
        assert_eq!(w.check(i64::MAX - 1), WindowCheck::InsideWindow);
        assert_eq!(w.check(-1), WindowCheck::BeforeWindow);
    }

    #[test]
    fn stop_time_can_move_while_running() {
        let stop = Arc::new(StopTime::unset());
        let w = TimeWindow::new(0, 0, stop.clone(), 0);
        assert_eq!(w.check(5000), WindowCheck::InsideWindow);
        stop.set_ns(4000);
        assert_eq!(w.check(5000), WindowCheck::AfterWindow);
        assert!(w.stop_elapsed(4001, 0));
        assert!(!w.stop_elapsed(3999, 0));
    }

    #[test]
    fn ms_ns_conversions() {
        assert_eq!(ms_to_ns(1500), 1_500_000_000);
        assert_eq!(ns_to_ms(1_500_000_000), 1500);
    }
}
