//! Scan cycle timing statistics.
//!
//! One [`ScanCycle`] lives on the executive thread and is touched from
//! nowhere else. `start()` runs at the top of each tick and measures the
//! cycle time (interval between consecutive tick starts) and the cycle
//! latency (signed offset from the scheduled absolute start, which advances
//! by one period per tick regardless of drift). `end()` runs after the
//! image mutex is released and measures the scan time; a scan that finishes
//! past the next scheduled start counts as an overrun.
//!
//! All values are signed 64-bit microseconds. The running mean is the
//! incremental form `avg += (x - avg) / n` with `n = scan_count`; the count
//! is shared by all three averages and is already 1 during the first
//! measured cycle, a one-tick bias this implementation deliberately keeps.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Snapshot of the running statistics, publishable to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingStats {
    pub scan_time_min: i64,
    pub scan_time_max: i64,
    pub scan_time_avg: i64,
    pub cycle_time_min: i64,
    pub cycle_time_max: i64,
    pub cycle_time_avg: i64,
    pub cycle_latency_min: i64,
    pub cycle_latency_max: i64,
    pub cycle_latency_avg: i64,
    pub scan_count: u64,
    pub overruns: u64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            scan_time_min: i64::MAX,
            scan_time_max: 0,
            scan_time_avg: 0,
            cycle_time_min: i64::MAX,
            cycle_time_max: 0,
            cycle_time_avg: 0,
            cycle_latency_min: i64::MAX,
            cycle_latency_max: 0,
            cycle_latency_avg: 0,
            scan_count: 0,
            overruns: 0,
        }
    }
}

/// Per-tick timing bookkeeping for the cyclic executive.
pub struct ScanCycle {
    period_us: i64,
    epoch: Instant,
    expected_start_us: i64,
    last_start_us: i64,
    stats: TimingStats,
}

impl ScanCycle {
    pub fn new(period: Duration) -> Self {
        Self {
            period_us: period.as_micros() as i64,
            epoch: Instant::now(),
            expected_start_us: 0,
            last_start_us: 0,
            stats: TimingStats::default(),
        }
    }

    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Record a tick start at the current monotonic time.
    pub fn start(&mut self) {
        self.start_at(self.now_us());
    }

    /// Record a tick end at the current monotonic time.
    pub fn end(&mut self) {
        self.end_at(self.now_us());
    }

    /// `start()` with an explicit timestamp, for simulation.
    pub fn start_at(&mut self, now_us: i64) {
        if self.stats.scan_count == 0 {
            // First cycle only establishes the baselines.
            self.expected_start_us = now_us + self.period_us;
            self.last_start_us = now_us;
            self.stats.scan_count = 1;
            return;
        }

        let n = self.stats.scan_count as i64;

        let cycle_time = now_us - self.last_start_us;
        self.stats.cycle_time_min = self.stats.cycle_time_min.min(cycle_time);
        self.stats.cycle_time_max = self.stats.cycle_time_max.max(cycle_time);
        self.stats.cycle_time_avg += (cycle_time - self.stats.cycle_time_avg) / n;

        let latency = now_us - self.expected_start_us;
        self.stats.cycle_latency_min = self.stats.cycle_latency_min.min(latency);
        self.stats.cycle_latency_max = self.stats.cycle_latency_max.max(latency);
        self.stats.cycle_latency_avg += (latency - self.stats.cycle_latency_avg) / n;

        self.last_start_us = now_us;
        // The schedule advances by exactly one period per tick; drift shows
        // up as latency rather than moving the schedule.
        self.expected_start_us += self.period_us;
        self.stats.scan_count += 1;
    }

    /// `end()` with an explicit timestamp, for simulation.
    pub fn end_at(&mut self, now_us: i64) {
        let n = self.stats.scan_count.max(1) as i64;

        let scan_time = now_us - self.last_start_us;
        self.stats.scan_time_min = self.stats.scan_time_min.min(scan_time);
        self.stats.scan_time_max = self.stats.scan_time_max.max(scan_time);
        self.stats.scan_time_avg += (scan_time - self.stats.scan_time_avg) / n;

        if now_us > self.expected_start_us {
            self.stats.overruns += 1;
        }
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000;

    fn drive(cycle: &mut ScanCycle, ticks: u64, period_us: i64, scan_us: i64) {
        for t in 0..ticks {
            let start = t as i64 * period_us;
            cycle.start_at(start);
            cycle.end_at(start + scan_us);
        }
    }

    #[test]
    fn steady_ticks_converge_to_the_period() {
        // Period 20 ms, 100 ticks, 5 ms injected scan.
        let mut cycle = ScanCycle::new(Duration::from_millis(20));
        drive(&mut cycle, 100, 20 * MS, 5 * MS);

        let stats = cycle.stats();
        assert_eq!(stats.scan_count, 100);
        assert_eq!(stats.overruns, 0);
        assert!(
            (19_500..=20_500).contains(&stats.cycle_time_avg),
            "cycle_time_avg = {}",
            stats.cycle_time_avg
        );
        assert!(stats.scan_time_max <= 6 * MS);
        assert_eq!(stats.cycle_time_min, 20 * MS);
        assert_eq!(stats.cycle_time_max, 20 * MS);
    }

    #[test]
    fn single_long_scan_counts_one_overrun() {
        // Period 10 ms; tick 50 takes 15 ms.
        let mut cycle = ScanCycle::new(Duration::from_millis(10));
        for t in 0..100i64 {
            let start = t * 10 * MS;
            cycle.start_at(start);
            let scan = if t == 50 { 15 * MS } else { 2 * MS };
            cycle.end_at(start + scan);
        }
        assert_eq!(cycle.stats().overruns, 1);
    }

    #[test]
    fn overrun_is_exactly_the_deadline_comparison() {
        let mut cycle = ScanCycle::new(Duration::from_millis(10));
        cycle.start_at(0);
        // Ends exactly at the next scheduled start: not an overrun.
        cycle.end_at(10 * MS);
        assert_eq!(cycle.stats().overruns, 0);
        cycle.start_at(10 * MS);
        cycle.end_at(20 * MS + 1);
        assert_eq!(cycle.stats().overruns, 1);
    }

    #[test]
    fn latency_may_be_negative_for_early_starts() {
        let mut cycle = ScanCycle::new(Duration::from_millis(10));
        cycle.start_at(0);
        cycle.end_at(MS);
        // Second tick starts 2 ms early.
        cycle.start_at(8 * MS);
        let stats = cycle.stats();
        assert_eq!(stats.cycle_latency_min, -2 * MS);
        assert_eq!(stats.cycle_time_min, 8 * MS);
    }

    #[test]
    fn first_start_only_records_the_baseline() {
        let mut cycle = ScanCycle::new(Duration::from_millis(10));
        cycle.start_at(5 * MS);
        let stats = cycle.stats();
        assert_eq!(stats.scan_count, 1);
        assert_eq!(stats.cycle_time_min, i64::MAX);
        assert_eq!(stats.cycle_time_max, 0);
    }

    #[test]
    fn mean_converges_with_constant_input() {
        let mut cycle = ScanCycle::new(Duration::from_millis(20));
        drive(&mut cycle, 1000, 20 * MS, 3 * MS);
        let stats = cycle.stats();
        // Integer incremental mean over a constant stream settles within
        // one unit of the true value.
        assert!((stats.cycle_time_avg - 20 * MS).abs() <= 1);
        assert!((stats.scan_time_avg - 3 * MS).abs() <= 1);
    }

    #[test]
    fn stats_snapshot_serializes_for_the_control_plane() {
        let mut cycle = ScanCycle::new(Duration::from_millis(10));
        drive(&mut cycle, 3, 10 * MS, MS);
        let json = serde_json::to_string(&cycle.stats()).unwrap();
        assert!(json.contains("\"scan_count\":3"));
        assert!(json.contains("\"overruns\":0"));
    }
}
