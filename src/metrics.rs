use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A simple percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Median in microseconds
    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    /// 99th percentile in microseconds
    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Get the count of recorded measurements
    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    fetch_calls: AtomicU64,
    main_calls: AtomicU64,
    throw_calls: AtomicU64,
    events_fetched: AtomicU64,
    events_dealt: AtomicU64,
    events_thrown: AtomicU64,
    hook_failures: AtomicU64,
}

/// Per-stage hook-call and event counters.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    counters: Arc<Counters>,
    main_latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            main_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_fetch(&self, events: usize) {
        self.counters.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_fetched
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_main(&self, dealt: usize, elapsed: Duration) {
        self.counters.main_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_dealt
            .fetch_add(dealt as u64, Ordering::Relaxed);
        self.main_latency.record(elapsed.as_nanos() as u64);
    }

    pub(crate) fn record_throw(&self, thrown: usize) {
        self.counters.throw_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_thrown
            .fetch_add(thrown as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_hook_failure(&self) {
        self.counters.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of fetch hook calls
    pub fn fetch_calls(&self) -> u64 {
        self.counters.fetch_calls.load(Ordering::Relaxed)
    }

    /// Number of main hook calls
    pub fn main_calls(&self) -> u64 {
        self.counters.main_calls.load(Ordering::Relaxed)
    }

    /// Number of throw hook calls
    pub fn throw_calls(&self) -> u64 {
        self.counters.throw_calls.load(Ordering::Relaxed)
    }

    /// Events dealt by the main hook
    pub fn events_dealt(&self) -> u64 {
        self.counters.events_dealt.load(Ordering::Relaxed)
    }

    /// Dealt events per second since the stage was created
    pub fn throughput_eps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.events_dealt() as f64 / elapsed
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            fetch_calls: c.fetch_calls.load(Ordering::Relaxed),
            main_calls: c.main_calls.load(Ordering::Relaxed),
            throw_calls: c.throw_calls.load(Ordering::Relaxed),
            events_fetched: c.events_fetched.load(Ordering::Relaxed),
            events_dealt: c.events_dealt.load(Ordering::Relaxed),
            events_thrown: c.events_thrown.load(Ordering::Relaxed),
            hook_failures: c.hook_failures.load(Ordering::Relaxed),
            throughput_eps: self.throughput_eps(),
            main_p50_us: self.main_latency.p50_us(),
            main_p99_us: self.main_latency.p99_us(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub fetch_calls: u64,
    pub main_calls: u64,
    pub throw_calls: u64,
    pub events_fetched: u64,
    pub events_dealt: u64,
    pub events_thrown: u64,
    pub hook_failures: u64,
    pub throughput_eps: f64,
    pub main_p50_us: f64,
    pub main_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Calls fetch/main/throw: {}/{}/{}, Events fetched/dealt/thrown: {}/{}/{}, \
             Failures: {}, Throughput: {:.2} ev/s, Main P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.fetch_calls,
            self.main_calls,
            self.throw_calls,
            self.events_fetched,
            self.events_dealt,
            self.events_thrown,
            self.hook_failures,
            self.throughput_eps,
            self.main_p50_us,
            self.main_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
