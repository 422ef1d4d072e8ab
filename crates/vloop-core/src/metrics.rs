//! Loop metrics: tick-latency quantiles, task throughput, queue depths.
//!
//! Latency quantiles use the P² streaming estimator so no sample buffer is
//! kept. Throughput is a rolling one-second-bucket window; queue depths are
//! exponential moving averages sampled once per tick. All updates come from
//! the loop thread; snapshots may come from anywhere.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

const TPS_WINDOW_SECS: u64 = 10;
const DEPTH_EMA_ALPHA: f64 = 0.2;

/// P² single-quantile estimator (Jain & Chlamtac).
struct P2Quantile {
    q: f64,
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
    seen: usize,
    warmup: [f64; 5],
}

impl P2Quantile {
    fn new(q: f64) -> Self {
        Self {
            q,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * q, 1.0 + 4.0 * q, 3.0 + 2.0 * q, 5.0],
            increments: [0.0, q / 2.0, q, (1.0 + q) / 2.0, 1.0],
            seen: 0,
            warmup: [0.0; 5],
        }
    }

    fn observe(&mut self, x: f64) {
        if self.seen < 5 {
            self.warmup[self.seen] = x;
            self.seen += 1;
            if self.seen == 5 {
                self.warmup.sort_by(|a, b| a.total_cmp(b));
                self.heights = self.warmup;
            }
            return;
        }
        self.seen += 1;

        // Locate the cell and stretch the extremes.
        let k = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            let mut k = 0;
            for i in 0..4 {
                if self.heights[i] <= x && x < self.heights[i + 1] {
                    k = i;
                    break;
                }
            }
            k
        };

        for i in (k + 1)..5 {
            self.positions[i] += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        // Adjust interior markers toward their desired positions.
        for i in 1..4 {
            let d = self.desired[i] - self.positions[i];
            let right_gap = self.positions[i + 1] - self.positions[i];
            let left_gap = self.positions[i - 1] - self.positions[i];
            if (d >= 1.0 && right_gap > 1.0) || (d <= -1.0 && left_gap < -1.0) {
                let d = d.signum();
                let parabolic = self.parabolic(i, d);
                let new_height = if self.heights[i - 1] < parabolic
                    && parabolic < self.heights[i + 1]
                {
                    parabolic
                } else {
                    self.linear(i, d)
                };
                self.heights[i] = new_height;
                self.positions[i] += d;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let n = &self.positions;
        let q = &self.heights;
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        self.heights[i]
            + d * (self.heights[j] - self.heights[i]) / (self.positions[j] - self.positions[i])
    }

    fn value(&self) -> f64 {
        if self.seen == 0 {
            return 0.0;
        }
        if self.seen < 5 {
            // Not enough samples for markers; interpolate the warmup set.
            let mut sorted = self.warmup;
            let filled = &mut sorted[..self.seen];
            filled.sort_by(|a, b| a.total_cmp(b));
            let rank = self.q * (self.seen.saturating_sub(1)) as f64;
            return filled[rank.round() as usize];
        }
        self.heights[2]
    }
}

/// Rolling tasks-per-second window of one-second buckets.
struct TpsWindow {
    buckets: VecDeque<(u64, u64)>,
}

impl TpsWindow {
    fn new() -> Self {
        Self {
            buckets: VecDeque::new(),
        }
    }

    fn record(&mut self, now_secs: u64, count: u64) {
        match self.buckets.back_mut() {
            Some((sec, total)) if *sec == now_secs => *total += count,
            _ => self.buckets.push_back((now_secs, count)),
        }
        let horizon = now_secs.saturating_sub(TPS_WINDOW_SECS);
        while matches!(self.buckets.front(), Some((sec, _)) if *sec < horizon) {
            self.buckets.pop_front();
        }
    }

    fn rate(&self, now_secs: u64) -> f64 {
        let horizon = now_secs.saturating_sub(TPS_WINDOW_SECS);
        let total: u64 = self
            .buckets
            .iter()
            .filter(|(sec, _)| *sec >= horizon)
            .map(|(_, count)| count)
            .sum();
        total as f64 / TPS_WINDOW_SECS as f64
    }
}

struct Ema {
    value: Option<f64>,
}

impl Ema {
    fn new() -> Self {
        Self { value: None }
    }

    fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(prev) => DEPTH_EMA_ALPHA * sample + (1.0 - DEPTH_EMA_ALPHA) * prev,
            None => sample,
        });
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

struct MetricsInner {
    latency_p50: P2Quantile,
    latency_p90: P2Quantile,
    latency_p99: P2Quantile,
    tps: TpsWindow,
    external_depth: Ema,
    internal_depth: Ema,
    microtask_depth: Ema,
    ticks: u64,
    tasks: u64,
}

pub(crate) struct MetricsState {
    inner: Mutex<MetricsInner>,
}

impl MetricsState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                latency_p50: P2Quantile::new(0.50),
                latency_p90: P2Quantile::new(0.90),
                latency_p99: P2Quantile::new(0.99),
                tps: TpsWindow::new(),
                external_depth: Ema::new(),
                internal_depth: Ema::new(),
                microtask_depth: Ema::new(),
                ticks: 0,
                tasks: 0,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_tick(
        &self,
        busy: Duration,
        executed: u64,
        now_secs: u64,
        external_depth: usize,
        internal_depth: usize,
        microtask_depth: usize,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let nanos = busy.as_nanos() as f64;
        inner.latency_p50.observe(nanos);
        inner.latency_p90.observe(nanos);
        inner.latency_p99.observe(nanos);
        inner.tps.record(now_secs, executed);
        inner.external_depth.update(external_depth as f64);
        inner.internal_depth.update(internal_depth as f64);
        inner.microtask_depth.update(microtask_depth as f64);
        inner.ticks += 1;
        inner.tasks += executed;
    }

    pub fn snapshot(&self, now_secs: u64) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            ticks: inner.ticks,
            tasks_executed: inner.tasks,
            tick_latency_p50: Duration::from_nanos(inner.latency_p50.value() as u64),
            tick_latency_p90: Duration::from_nanos(inner.latency_p90.value() as u64),
            tick_latency_p99: Duration::from_nanos(inner.latency_p99.value() as u64),
            tasks_per_second: inner.tps.rate(now_secs),
            external_depth_ema: inner.external_depth.get(),
            internal_depth_ema: inner.internal_depth.get(),
            microtask_depth_ema: inner.microtask_depth.get(),
        }
    }
}

/// Point-in-time view of loop metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub tasks_executed: u64,
    pub tick_latency_p50: Duration,
    pub tick_latency_p90: Duration,
    pub tick_latency_p99: Duration,
    pub tasks_per_second: f64,
    pub external_depth_ema: f64,
    pub internal_depth_ema: f64,
    pub microtask_depth_ema: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2_median_converges() {
        let mut p2 = P2Quantile::new(0.5);
        // 1..=1001 has median 501.
        for i in 1..=1001 {
            p2.observe(f64::from(i));
        }
        let median = p2.value();
        assert!((median - 501.0).abs() < 25.0, "median estimate {median}");
    }

    #[test]
    fn test_p2_p99_tracks_tail() {
        let mut p2 = P2Quantile::new(0.99);
        for i in 1..=10_000 {
            p2.observe(f64::from(i));
        }
        let p99 = p2.value();
        assert!((9_500.0..=10_000.0).contains(&p99), "p99 estimate {p99}");
    }

    #[test]
    fn test_tps_window_prunes_old_buckets() {
        let mut tps = TpsWindow::new();
        tps.record(0, 1_000);
        tps.record(5, 500);
        assert!(tps.rate(5) > 0.0);
        // A hundred seconds later the old buckets no longer count.
        tps.record(100, 10);
        assert_eq!(tps.rate(100), 1.0);
    }

    #[test]
    fn test_snapshot_counts() {
        let m = MetricsState::new();
        for _ in 0..10 {
            m.record_tick(Duration::from_micros(100), 3, 1, 4, 0, 2);
        }
        let snap = m.snapshot(1);
        assert_eq!(snap.ticks, 10);
        assert_eq!(snap.tasks_executed, 30);
        assert!(snap.external_depth_ema > 0.0);
    }
}
