//! Engine instrumentation.
//!
//! Lock-free counters, gauges and latency histograms for the scoring
//! pipeline, plus two export surfaces:
//!
//! - **JSON**: structured snapshot for the CLI and logs
//! - **Prometheus text**: `render_prometheus` emits the standard
//!   HELP/TYPE/bucket format for scrape-style collection
//!
//! Everything is `Relaxed` atomics; metrics are advisory and never
//! participate in scoring decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// =============================================================================
// Metric primitives
// =============================================================================

/// A counter that can only increase.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram for tracking distributions.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    /// Sum stored in thousandths of the observed unit.
    sum_millis: AtomicU64,
    count: AtomicU64,
}

/// Point-in-time copy of a histogram's state.
pub struct HistogramSnapshot {
    pub bucket_bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    /// Buckets suited to miner round-trip latencies in seconds.
    pub fn new_response_seconds() -> Self {
        Self::new(vec![0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 7.5, 10.0, 30.0])
    }

    /// Buckets suited to scoring-pass durations in milliseconds.
    pub fn new_scoring_millis() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ])
    }

    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let mut bucket_idx = self.bucket_bounds.len();
        for (i, bound) in self.bucket_bounds.iter().enumerate() {
            if value <= *bound {
                bucket_idx = i;
                break;
            }
        }
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum_millis
            .fetch_add((value * 1000.0).round().max(0.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bucket_bounds: self.bucket_bounds.clone(),
            bucket_counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            sum: self.sum(),
            count: self.count(),
        }
    }
}

// =============================================================================
// Engine metrics collection
// =============================================================================

/// Central metrics for the allocation-scoring engine.
pub struct EngineMetrics {
    // Counters
    pub requests_created: Counter,
    pub requests_scored: Counter,
    pub requests_unscoreable: Counter,
    pub submissions_received: Counter,
    pub submissions_flagged: Counter,
    pub non_responders: Counter,
    pub claims_taken: Counter,
    pub claims_lost: Counter,
    pub sweep_passes: Counter,
    pub sweep_errors: Counter,

    // Gauges
    pub active_requests: Gauge,
    pub scoring_in_flight: Gauge,

    // Histograms
    pub miner_latency_seconds: Histogram,
    pub scoring_pass_millis: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            requests_created: Counter::new(),
            requests_scored: Counter::new(),
            requests_unscoreable: Counter::new(),
            submissions_received: Counter::new(),
            submissions_flagged: Counter::new(),
            non_responders: Counter::new(),
            claims_taken: Counter::new(),
            claims_lost: Counter::new(),
            sweep_passes: Counter::new(),
            sweep_errors: Counter::new(),

            active_requests: Gauge::new(),
            scoring_in_flight: Gauge::new(),

            miner_latency_seconds: Histogram::new_response_seconds(),
            scoring_pass_millis: Histogram::new_scoring_millis(),
        }
    }

    /// Export a structured snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "counters": {
                "requests_created": self.requests_created.get(),
                "requests_scored": self.requests_scored.get(),
                "requests_unscoreable": self.requests_unscoreable.get(),
                "submissions_received": self.submissions_received.get(),
                "submissions_flagged": self.submissions_flagged.get(),
                "non_responders": self.non_responders.get(),
                "claims_taken": self.claims_taken.get(),
                "claims_lost": self.claims_lost.get(),
                "sweep_passes": self.sweep_passes.get(),
                "sweep_errors": self.sweep_errors.get(),
            },
            "gauges": {
                "active_requests": self.active_requests.get(),
                "scoring_in_flight": self.scoring_in_flight.get(),
            },
            "latencies": {
                "miner_response_mean_seconds": self.miner_latency_seconds.mean(),
                "scoring_pass_mean_millis": self.scoring_pass_millis.mean(),
            },
        })
    }

    /// Render in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("requests_created_total", "Requests persisted.", &self.requests_created),
            ("requests_scored_total", "Requests with committed scores.", &self.requests_scored),
            (
                "requests_unscoreable_total",
                "Requests declared unscoreable.",
                &self.requests_unscoreable,
            ),
            (
                "submissions_received_total",
                "Miner submissions recorded.",
                &self.submissions_received,
            ),
            (
                "submissions_flagged_total",
                "Submissions flagged at validation.",
                &self.submissions_flagged,
            ),
            ("non_responders_total", "Dispatches with no response.", &self.non_responders),
            ("claims_taken_total", "Scoring claims taken.", &self.claims_taken),
            ("claims_lost_total", "Scoring claims fenced out.", &self.claims_lost),
            ("sweep_passes_total", "Completed sweep passes.", &self.sweep_passes),
            ("sweep_errors_total", "Sweep passes hitting errors.", &self.sweep_errors),
        ];
        for (name, help, counter) in counters {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.get()));
        }

        let gauges: [(&str, &str, &Gauge); 2] = [
            ("active_requests", "Non-terminal requests in the store.", &self.active_requests),
            ("scoring_in_flight", "Requests being scored right now.", &self.scoring_in_flight),
        ];
        for (name, help, gauge) in gauges {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {}\n", gauge.get()));
        }

        render_histogram(
            &mut out,
            "miner_latency_seconds",
            "Miner round-trip latency in seconds.",
            &self.miner_latency_seconds.snapshot(),
        );
        render_histogram(
            &mut out,
            "scoring_pass_millis",
            "Scoring pass duration in milliseconds.",
            &self.scoring_pass_millis.snapshot(),
        );

        out
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, snapshot: &HistogramSnapshot) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} histogram\n"));
    let mut cumulative = 0u64;
    for (idx, bound) in snapshot.bucket_bounds.iter().enumerate() {
        cumulative = cumulative.saturating_add(snapshot.bucket_counts[idx]);
        out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
    }
    cumulative =
        cumulative.saturating_add(snapshot.bucket_counts.last().copied().unwrap_or_default());
    out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {cumulative}\n"));
    out.push_str(&format!("{name}_sum {}\n", snapshot.sum));
    out.push_str(&format!("{name}_count {}\n", snapshot.count));
}

// =============================================================================
// Stage timer
// =============================================================================

/// Records elapsed milliseconds into a histogram on drop.
pub struct StageTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> StageTimer<'a> {
    pub fn start(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for StageTimer<'a> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.histogram.observe(elapsed.as_secs_f64() * 1000.0);
    }
}
