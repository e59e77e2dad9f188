use std::thread::ThreadId;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::graph::PlugId;
use crate::monitor::{Monitor, Process};
use crate::process::ProcessKind;

/// Counts on which threads plugs are processed.
pub struct ThreadMonitor {
    kinds: Vec<ProcessKind>,
    statistics: Mutex<FxHashMap<PlugId, FxHashMap<ThreadId, u64>>>,
}

impl ThreadMonitor {
    /// Monitor compute processes.
    pub fn new() -> Self {
        Self::with_kinds([ProcessKind::Compute])
    }

    /// Monitor the given kinds of process.
    pub fn with_kinds(kinds: impl IntoIterator<Item = ProcessKind>) -> Self {
        Self { kinds: kinds.into_iter().collect(), statistics: Mutex::default() }
    }

    /// Per plug, how many processes ran on each thread.
    pub fn all_statistics(&self) -> Vec<(PlugId, FxHashMap<ThreadId, u64>)> {
        let mut all: Vec<_> =
            self.statistics.lock().iter().map(|(&p, s)| (p, s.clone())).collect();
        all.sort_by_key(|(plug, _)| *plug);
        all
    }

    pub fn plug_statistics(&self, plug: PlugId) -> FxHashMap<ThreadId, u64> {
        self.statistics.lock().get(&plug).cloned().unwrap_or_default()
    }

    /// How many processes ran on each thread, over all plugs.
    pub fn combined_statistics(&self) -> FxHashMap<ThreadId, u64> {
        let mut combined = FxHashMap::default();
        for per_thread in self.statistics.lock().values() {
            for (&thread, &count) in per_thread {
                *combined.entry(thread).or_default() += count;
            }
        }
        combined
    }
}

impl Default for ThreadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for ThreadMonitor {
    fn process_started(&self, process: &Process) {
        if !self.kinds.contains(&process.kind) {
            return;
        }
        *self
            .statistics
            .lock()
            .entry(process.plug)
            .or_default()
            .entry(process.thread)
            .or_default() += 1;
    }
}
