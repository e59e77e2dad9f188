//! Passive observers of hash and compute processes.

mod context;
mod performance;
mod thread;

use std::thread::ThreadId;
use std::time::Duration;

pub use self::context::{ContextMonitor, ContextStatistics};
pub use self::performance::{
    MetricValue, PerformanceMetric, PerformanceMonitor, Statistics, format_metric,
    format_statistics,
};
pub use self::thread::ThreadMonitor;
use crate::context::Context;
use crate::graph::{NodeId, PlugId};
use crate::process::ProcessKind;

/// Observes the processes of an [`Engine`](crate::Engine) it is attached to.
///
/// Monitors must not influence evaluation. They are called on whichever
/// thread runs the process, possibly many at once.
pub trait Monitor: Send + Sync + 'static {
    fn process_started(&self, _process: &Process) {}

    /// `duration` includes the time spent in nested processes.
    fn process_finished(&self, _process: &Process, _duration: Duration) {}
}

/// A hash or compute process as seen by a [`Monitor`].
#[derive(Debug)]
pub struct Process<'a> {
    pub kind: ProcessKind,
    pub plug: PlugId,
    pub node: NodeId,
    pub node_type: &'a str,
    pub context: &'a Context,
    pub thread: ThreadId,
}
