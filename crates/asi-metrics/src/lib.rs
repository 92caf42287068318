//! Metrics infrastructure for the ASI telemetry protocol.
//!
//! This crate declares every metric the protocol core records as a structured
//! [`Metric`] constant and re-exports the `metrics` crate so callers record
//! through the same facade. No recorder is installed here; an embedding
//! application that wants the numbers installs one and calls
//! [`describe_metrics`] once at startup.
//!
//! # Example
//!
//! ```rust,ignore
//! use asi_metrics::{metric_defs, describe_metrics};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::TELEGRAM_SENT.name, "kind" => "data").increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, Unit};

/// The kind of metric (counter or gauge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use asi_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const FRAMES: Metric = Metric::counter("asi.command.frames")
///     .with_description("Command frames completed")
///     .with_unit(Unit::Count)
///     .with_labels(&["outcome"]);
///
/// assert_eq!(FRAMES.name, "asi.command.frames");
/// assert_eq!(FRAMES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "asi.telegram.sent").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description of the metric.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys for this metric.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions recorded by the protocol core.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Command Channel
    // ========================================================================

    /// Command frames completed on the serial channel.
    ///
    /// Labels: outcome (`ok` or `malformed`)
    pub const COMMAND_FRAMES: Metric = Metric::counter("asi.command.frames")
        .with_description("Command frames completed on the serial channel")
        .with_unit(Unit::Count)
        .with_labels(&["outcome"]);

    /// Commands dispatched after a successful parse.
    ///
    /// Labels: command
    pub const COMMAND_DISPATCHED: Metric = Metric::counter("asi.command.dispatched")
        .with_description("Commands dispatched after a successful parse")
        .with_unit(Unit::Count)
        .with_labels(&["command"]);

    // ========================================================================
    // Telegrams
    // ========================================================================

    /// Telegrams written to the output channel.
    ///
    /// Labels: kind (`symbols` or `data`), terminal
    pub const TELEGRAM_SENT: Metric = Metric::counter("asi.telegram.sent")
        .with_description("Telegrams written to the output channel")
        .with_unit(Unit::Count)
        .with_labels(&["kind", "terminal"]);

    /// Telegram bytes written to the output channel.
    ///
    /// Labels: kind
    pub const TELEGRAM_BYTES: Metric = Metric::counter("asi.telegram.bytes")
        .with_description("Telegram bytes written to the output channel")
        .with_unit(Unit::Bytes)
        .with_labels(&["kind"]);

    // ========================================================================
    // Bus Aggregation
    // ========================================================================

    /// Roster members that did not acknowledge a data probe after all retries.
    ///
    /// Labels: address
    pub const BUS_PROBE_FAILURES: Metric = Metric::counter("asi.bus.probe_failures")
        .with_description("Roster members that did not acknowledge a data probe")
        .with_unit(Unit::Count)
        .with_labels(&["address"]);

    /// Subordinates that hit the burst cap before sending their end sentinel.
    ///
    /// Labels: address
    pub const BUS_POLL_EXHAUSTED: Metric = Metric::counter("asi.bus.poll_exhausted")
        .with_description("Subordinates polled up to the burst cap without an end sentinel")
        .with_unit(Unit::Count)
        .with_labels(&["address"]);

    /// Subordinates found by the most recent symbol pass.
    pub const BUS_ROSTER_SIZE: Metric = Metric::gauge("asi.bus.roster_size")
        .with_description("Subordinates found by the most recent symbol pass")
        .with_unit(Unit::Count);

    /// Signals relayed from subordinates into the controller's telegram.
    ///
    /// Labels: kind
    pub const BUS_RELAYED_SIGNALS: Metric = Metric::counter("asi.bus.relayed_signals")
        .with_description("Signals relayed from subordinates")
        .with_unit(Unit::Count)
        .with_labels(&["kind"]);

    // ========================================================================
    // Logging Scheduler
    // ========================================================================

    /// Data telegrams triggered by the logging scheduler.
    pub const LOGGING_FIRED: Metric = Metric::counter("asi.logging.fired")
        .with_description("Data telegrams triggered by the logging scheduler")
        .with_unit(Unit::Count);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &COMMAND_FRAMES,
        &COMMAND_DISPATCHED,
        &TELEGRAM_SENT,
        &TELEGRAM_BYTES,
        &BUS_PROBE_FAILURES,
        &BUS_POLL_EXHAUSTED,
        &BUS_ROSTER_SIZE,
        &BUS_RELAYED_SIGNALS,
        &LOGGING_FIRED,
    ];
}

/// Describes all metrics used by the protocol core.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
