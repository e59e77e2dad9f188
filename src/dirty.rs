use std::collections::VecDeque;
use std::thread::ThreadId;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Graph, PlugId};
use crate::graph::store::Store;

/// Dirtied plugs awaiting notification, and the dependencies among them.
#[derive(Default)]
pub(crate) struct DirtyState {
    /// Number of open [`DirtyScope`]s.
    scopes: usize,
    /// Dirtied plugs in discovery order, each once.
    order: Vec<PlugId>,
    seen: FxHashSet<PlugId>,
    /// `(upstream, downstream)` pairs among dirtied plugs.
    edges: Vec<(PlugId, PlugId)>,
    /// Threads currently running notification callbacks.
    pub emitting: FxHashSet<ThreadId>,
}

impl DirtyState {
    /// Add the result of one propagation to the pending batch.
    fn merge(&mut self, batch: Batch) {
        for plug in batch.order {
            if self.seen.insert(plug) {
                self.order.push(plug);
            }
        }
        self.edges.extend(batch.edges);
    }

    /// Take the pending batch, unless a scope is still open.
    fn take(&mut self) -> Option<Batch> {
        if self.scopes > 0 || self.order.is_empty() {
            return None;
        }
        self.seen.clear();
        Some(Batch {
            order: std::mem::take(&mut self.order),
            edges: std::mem::take(&mut self.edges),
        })
    }
}

/// The plugs dirtied by one or more edits.
#[derive(Default)]
struct Batch {
    order: Vec<PlugId>,
    edges: Vec<(PlugId, PlugId)>,
}

impl Batch {
    /// The dirtied plugs, each after everything upstream of it.
    fn sorted(self) -> Vec<PlugId> {
        let index: FxHashMap<PlugId, usize> =
            self.order.iter().enumerate().map(|(i, &p)| (p, i)).collect();
        let mut incoming = vec![0usize; self.order.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.order.len()];
        for (from, to) in &self.edges {
            if let (Some(&from), Some(&to)) = (index.get(from), index.get(to)) {
                if from != to {
                    downstream[from].push(to);
                    incoming[to] += 1;
                }
            }
        }

        let mut ready: VecDeque<usize> =
            (0..self.order.len()).filter(|&i| incoming[i] == 0).collect();
        let mut emitted = vec![false; self.order.len()];
        let mut result = Vec::with_capacity(self.order.len());
        while let Some(i) = ready.pop_front() {
            emitted[i] = true;
            result.push(self.order[i]);
            for &j in &downstream[i] {
                incoming[j] -= 1;
                if incoming[j] == 0 {
                    ready.push_back(j);
                }
            }
        }

        // Plugs removed and re-added within one batch can leave leftovers.
        result.extend((0..self.order.len()).filter(|&i| !emitted[i]).map(|i| self.order[i]));
        result
    }
}

/// Dirty everything downstream of `roots`, breadth-first.
///
/// Each reached plug has its dirty counter bumped exactly once, no matter how
/// many paths lead to it.
fn propagate(store: &mut Store, roots: &[PlugId]) -> Batch {
    let mut batch = Batch::default();
    let mut visited: FxHashSet<PlugId> = roots.iter().copied().collect();
    let mut queue: VecDeque<PlugId> = roots.iter().copied().collect();
    let mut next = Vec::new();

    while let Some(id) = queue.pop_front() {
        let Ok(plug) = store.plug_mut(id) else { continue };
        plug.dirty += 1;
        batch.order.push(id);

        next.clear();
        store.successors(id, &mut next);
        for &successor in &next {
            batch.edges.push((id, successor));
            if visited.insert(successor) {
                queue.push_back(successor);
            }
        }
    }

    batch
}

impl Graph {
    /// Dirty everything downstream of `roots` and queue the notifications.
    pub(crate) fn dirty(&self, store: &mut Store, roots: &[PlugId]) {
        if roots.is_empty() {
            return;
        }
        let batch = propagate(store, roots);
        tracing::trace!(roots = roots.len(), dirtied = batch.order.len(), "propagated dirtiness");
        self.dirty.lock().merge(batch);
    }

    /// Emit `plug_dirtied` for the pending batch, unless a scope is open.
    pub(crate) fn flush_dirty(&self) {
        loop {
            let Some(batch) = self.dirty.lock().take() else { return };
            let plugs: Vec<PlugId> = {
                let store = self.store.read();
                batch.sorted().into_iter().filter(|&p| store.contains_plug(p)).collect()
            };
            tracing::debug!(plugs = plugs.len(), "emitting dirtied plugs");
            self.emit_dirtied(&plugs);
        }
    }

    /// Defer dirty notifications until the returned scope (and every other
    /// scope opened meanwhile) is dropped.
    ///
    /// Edits inside the scope still invalidate fingerprints immediately;
    /// only the notifications are batched, so that each dirtied plug is
    /// announced once for the whole batch.
    pub fn dirty_scope(&self) -> DirtyScope<'_> {
        self.dirty.lock().scopes += 1;
        DirtyScope { graph: self }
    }
}

/// Batches dirty notifications. See [`Graph::dirty_scope`].
#[must_use = "notifications are only batched while the scope is alive"]
pub struct DirtyScope<'a> {
    graph: &'a Graph,
}

impl Drop for DirtyScope<'_> {
    fn drop(&mut self) {
        let outermost = {
            let mut state = self.graph.dirty.lock();
            state.scopes -= 1;
            state.scopes == 0
        };
        if outermost {
            self.graph.flush_dirty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(serial: u64) -> PlugId {
        PlugId { key: serial as usize, serial }
    }

    #[test]
    fn test_sorted_respects_dependencies() {
        let batch = Batch {
            order: vec![id(3), id(1), id(2)],
            edges: vec![(id(1), id(2)), (id(2), id(3)), (id(1), id(3))],
        };
        assert_eq!(batch.sorted(), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_sorted_keeps_discovery_order_for_independent_plugs() {
        let batch = Batch { order: vec![id(5), id(4), id(6)], edges: vec![] };
        assert_eq!(batch.sorted(), vec![id(5), id(4), id(6)]);
    }

    #[test]
    fn test_merge_deduplicates() {
        let mut state = DirtyState::default();
        state.merge(Batch { order: vec![id(1), id(2)], edges: vec![(id(1), id(2))] });
        state.merge(Batch { order: vec![id(2), id(3)], edges: vec![(id(2), id(3))] });
        let batch = state.take().unwrap();
        assert_eq!(batch.sorted(), vec![id(1), id(2), id(3)]);
        assert!(state.take().is_none());
    }

    #[test]
    fn test_open_scope_defers() {
        let mut state = DirtyState::default();
        state.scopes = 1;
        state.merge(Batch { order: vec![id(1)], edges: vec![] });
        assert!(state.take().is_none());
        state.scopes = 0;
        assert!(state.take().is_some());
    }
}
