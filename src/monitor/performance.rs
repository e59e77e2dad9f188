use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter, Write};
use std::ops::{Add, AddAssign};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::graph::{Graph, PlugId};
use crate::monitor::{Monitor, Process};
use crate::process::ProcessKind;

/// Counts hash and compute processes per plug and measures their duration.
#[derive(Default)]
pub struct PerformanceMonitor {
    statistics: Mutex<FxHashMap<PlugId, Statistics>>,
}

/// Process counts and durations of one plug, or of several combined.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Statistics {
    pub hash_count: u64,
    pub compute_count: u64,
    pub hash_duration: Duration,
    pub compute_duration: Duration,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics of every plug that was processed, ordered by plug.
    pub fn all_statistics(&self) -> Vec<(PlugId, Statistics)> {
        let mut all: Vec<_> = self.statistics.lock().iter().map(|(&p, &s)| (p, s)).collect();
        all.sort_by_key(|&(plug, _)| plug);
        all
    }

    pub fn plug_statistics(&self, plug: PlugId) -> Statistics {
        self.statistics.lock().get(&plug).copied().unwrap_or_default()
    }

    /// The sum over all plugs.
    pub fn combined_statistics(&self) -> Statistics {
        self.statistics.lock().values().fold(Statistics::default(), |acc, &s| acc + s)
    }

    pub fn clear(&self) {
        self.statistics.lock().clear();
    }
}

impl Monitor for PerformanceMonitor {
    fn process_finished(&self, process: &Process, duration: Duration) {
        let mut statistics = self.statistics.lock();
        let entry = statistics.entry(process.plug).or_default();
        match process.kind {
            ProcessKind::Hash => {
                entry.hash_count += 1;
                entry.hash_duration += duration;
            }
            ProcessKind::Compute => {
                entry.compute_count += 1;
                entry.compute_duration += duration;
            }
        }
    }
}

impl Add for Statistics {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, rhs: Self) {
        self.hash_count += rhs.hash_count;
        self.compute_count += rhs.compute_count;
        self.hash_duration += rhs.hash_duration;
        self.compute_duration += rhs.compute_duration;
    }
}

/// A quantity derived from [`Statistics`], used to rank plugs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PerformanceMetric {
    HashCount,
    ComputeCount,
    HashDuration,
    ComputeDuration,
    TotalDuration,
    PerHashDuration,
    PerComputeDuration,
    HashesPerCompute,
}

impl PerformanceMetric {
    pub const ALL: [Self; 8] = [
        Self::HashCount,
        Self::ComputeCount,
        Self::HashDuration,
        Self::ComputeDuration,
        Self::TotalDuration,
        Self::PerHashDuration,
        Self::PerComputeDuration,
        Self::HashesPerCompute,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Self::HashCount => "number of hash processes",
            Self::ComputeCount => "number of compute processes",
            Self::HashDuration => "time spent in hash processes",
            Self::ComputeDuration => "time spent in compute processes",
            Self::TotalDuration => "sum of time spent in hash and compute processes",
            Self::PerHashDuration => "time spent per hash process",
            Self::PerComputeDuration => "time spent per compute process",
            Self::HashesPerCompute => "number of hash processes per compute process",
        }
    }

    pub fn evaluate(self, s: &Statistics) -> MetricValue {
        let per = |duration: Duration, count: u64| {
            duration / u32::try_from(count.max(1)).unwrap_or(u32::MAX)
        };
        match self {
            Self::HashCount => MetricValue::Count(s.hash_count),
            Self::ComputeCount => MetricValue::Count(s.compute_count),
            Self::HashDuration => MetricValue::Duration(s.hash_duration),
            Self::ComputeDuration => MetricValue::Duration(s.compute_duration),
            Self::TotalDuration => MetricValue::Duration(s.hash_duration + s.compute_duration),
            Self::PerHashDuration => MetricValue::Duration(per(s.hash_duration, s.hash_count)),
            Self::PerComputeDuration => {
                MetricValue::Duration(per(s.compute_duration, s.compute_count))
            }
            Self::HashesPerCompute => {
                MetricValue::Ratio(s.hash_count as f64 / s.compute_count.max(1) as f64)
            }
        }
    }
}

/// The value of a [`PerformanceMetric`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MetricValue {
    Count(u64),
    Duration(Duration),
    Ratio(f64),
}

impl MetricValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Count(n) => n as f64,
            Self::Duration(d) => d.as_secs_f64(),
            Self::Ratio(r) => r,
        }
    }

    fn is_zero(self) -> bool {
        self.as_f64() == 0.0
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Duration(d) => write!(f, "{:.6}s", d.as_secs_f64()),
            Self::Ratio(r) => write!(f, "{r:.6}"),
        }
    }
}

/// A text report: totals for every metric, then the plugs ranking highest
/// in each.
pub fn format_statistics(
    monitor: &PerformanceMonitor,
    graph: &Graph,
    max_lines_per_metric: usize,
) -> String {
    let combined = monitor.combined_statistics();
    let (names, values): (Vec<String>, Vec<String>) = PerformanceMetric::ALL
        .iter()
        .map(|m| (format!("Total {}", m.description()), format!(": {}", m.evaluate(&combined))))
        .unzip();

    let mut out = String::from("PerformanceMonitor Summary :\n\n");
    write_items(&mut out, &names, &values);
    out.push('\n');

    for (i, metric) in PerformanceMetric::ALL.into_iter().enumerate() {
        out += &format_metric(monitor, graph, metric, max_lines_per_metric);
        if i + 1 < PerformanceMetric::ALL.len() {
            out.push('\n');
        }
    }
    out
}

/// The plugs ranking highest in one metric. Empty if no plug scores above
/// zero.
pub fn format_metric(
    monitor: &PerformanceMonitor,
    graph: &Graph,
    metric: PerformanceMetric,
    max_lines: usize,
) -> String {
    let mut ranked: Vec<(PlugId, MetricValue)> = monitor
        .all_statistics()
        .into_iter()
        .map(|(plug, s)| (plug, metric.evaluate(&s)))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.as_f64().partial_cmp(&a.1.as_f64()).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0))
    });

    let (names, values): (Vec<String>, Vec<String>) = ranked
        .into_iter()
        .take(max_lines)
        .take_while(|(_, value)| !value.is_zero())
        .map(|(plug, value)| (graph.full_name(plug), value.to_string()))
        .unzip();
    if names.is_empty() {
        return String::new();
    }

    let mut out = format!("Top {} plugs by {} :\n\n", names.len(), metric.description());
    write_items(&mut out, &names, &values);
    out
}

fn write_items(out: &mut String, names: &[String], values: &[String]) {
    let width = names.iter().map(String::len).max().unwrap_or(0) + 4;
    for (name, value) in names.iter().zip(values) {
        let _ = writeln!(out, "  {name:<width$}{value}");
    }
}
