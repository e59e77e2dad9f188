use std::ops::AddAssign;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{NodeId, PlugId};
use crate::hash::{Fingerprint, hash};
use crate::monitor::{Monitor, Process};

/// Records the contexts plugs are processed in.
///
/// Useful to find plugs evaluated in many more contexts than expected, e.g.
/// because a variable that doesn't matter to them was left in the context.
#[derive(Default)]
pub struct ContextMonitor {
    nodes: Option<FxHashSet<NodeId>>,
    statistics: Mutex<FxHashMap<PlugId, ContextStatistics>>,
}

/// Unique contexts and variable values seen by one plug, or several
/// combined.
#[derive(Debug, Default, Clone)]
pub struct ContextStatistics {
    contexts: FxHashSet<Fingerprint>,
    variables: FxHashMap<Arc<str>, FxHashSet<Fingerprint>>,
}

impl ContextMonitor {
    /// Monitor every plug.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only monitor the plugs of the given nodes.
    pub fn for_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self { nodes: Some(nodes.into_iter().collect()), ..Self::default() }
    }

    pub fn all_statistics(&self) -> Vec<(PlugId, ContextStatistics)> {
        let mut all: Vec<_> =
            self.statistics.lock().iter().map(|(&p, s)| (p, s.clone())).collect();
        all.sort_by_key(|(plug, _)| *plug);
        all
    }

    pub fn plug_statistics(&self, plug: PlugId) -> ContextStatistics {
        self.statistics.lock().get(&plug).cloned().unwrap_or_default()
    }

    pub fn combined_statistics(&self) -> ContextStatistics {
        let mut combined = ContextStatistics::default();
        for statistics in self.statistics.lock().values() {
            combined += statistics;
        }
        combined
    }
}

impl Monitor for ContextMonitor {
    fn process_started(&self, process: &Process) {
        if self.nodes.as_ref().is_some_and(|nodes| !nodes.contains(&process.node)) {
            return;
        }
        let variables: Vec<_> =
            process.context.iter().map(|(name, value)| (name, hash(&value))).collect();
        let mut statistics = self.statistics.lock();
        let entry = statistics.entry(process.plug).or_default();
        entry.contexts.insert(process.context.fingerprint());
        for (name, value) in variables {
            entry.variables.entry(name).or_default().insert(value);
        }
    }
}

impl ContextStatistics {
    /// Number of distinct contexts.
    pub fn num_unique_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Names of all variables seen, sorted.
    pub fn variable_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.variables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of distinct values a variable had.
    pub fn num_unique_values(&self, name: &str) -> usize {
        self.variables.get(name).map_or(0, FxHashSet::len)
    }
}

impl AddAssign<&ContextStatistics> for ContextStatistics {
    fn add_assign(&mut self, rhs: &ContextStatistics) {
        self.contexts.extend(rhs.contexts.iter().copied());
        for (name, values) in &rhs.variables {
            self.variables.entry(name.clone()).or_default().extend(values.iter().copied());
        }
    }
}
