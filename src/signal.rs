use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::RwLock;
use slab::Slab;

use crate::error::{Error, Result};
use crate::graph::{Graph, PlugId};

/// A notification callback. Receives the graph and the plug concerned.
pub type Callback = Arc<dyn Fn(&Graph, PlugId) + Send + Sync>;

/// The notifications a graph emits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Signal {
    /// A plug's value may have changed.
    PlugDirtied,
    /// A plug was connected or disconnected.
    PlugInputChanged,
    /// A plug's value was set, directly or on the source it is connected to.
    PlugSet,
}

impl Signal {
    fn index(self) -> usize {
        match self {
            Self::PlugDirtied => 0,
            Self::PlugInputChanged => 1,
            Self::PlugSet => 2,
        }
    }
}

/// Handle of a registered callback, for [`Graph::unsubscribe`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Subscription {
    signal: Signal,
    key: usize,
    serial: u64,
}

#[derive(Default)]
pub(crate) struct Signals {
    slots: RwLock<[Slab<Slot>; 3]>,
    next: AtomicU64,
}

struct Slot {
    serial: u64,
    callback: Callback,
}

impl Signals {
    fn connect(&self, signal: Signal, callback: Callback) -> Subscription {
        let serial = self.next.fetch_add(1, Ordering::Relaxed);
        let key = self.slots.write()[signal.index()].insert(Slot { serial, callback });
        Subscription { signal, key, serial }
    }

    fn disconnect(&self, subscription: Subscription) -> bool {
        let mut slots = self.slots.write();
        let slab = &mut slots[subscription.signal.index()];
        match slab.get(subscription.key) {
            Some(slot) if slot.serial == subscription.serial => {
                slab.remove(subscription.key);
                true
            }
            _ => false,
        }
    }

    fn callbacks(&self, signal: Signal) -> Vec<Callback> {
        self.slots.read()[signal.index()]
            .iter()
            .map(|(_, slot)| slot.callback.clone())
            .collect()
    }
}

impl Graph {
    /// Call `f` whenever a plug is dirtied.
    pub fn on_plug_dirtied<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Graph, PlugId) + Send + Sync + 'static,
    {
        self.signals.connect(Signal::PlugDirtied, Arc::new(f))
    }

    /// Call `f` whenever a plug's input connection changes.
    pub fn on_plug_input_changed<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Graph, PlugId) + Send + Sync + 'static,
    {
        self.signals.connect(Signal::PlugInputChanged, Arc::new(f))
    }

    /// Call `f` whenever a plug's value is set.
    pub fn on_plug_set<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Graph, PlugId) + Send + Sync + 'static,
    {
        self.signals.connect(Signal::PlugSet, Arc::new(f))
    }

    /// Remove a callback. Returns whether it was still registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.signals.disconnect(subscription)
    }

    /// Fails if called from within a notification callback of this graph.
    pub(crate) fn check_reentrancy(&self) -> Result<()> {
        if self.dirty.lock().emitting.contains(&thread::current().id()) {
            tracing::warn!("rejected graph edit from a notification callback");
            return Err(Error::ReentrancyViolation { during: "notifications are being emitted" });
        }
        Ok(())
    }

    pub(crate) fn emit(&self, events: &[(Signal, PlugId)]) {
        if events.is_empty() {
            return;
        }
        let _emitting = Emitting::enter(self);
        let mut cache: [Option<Vec<Callback>>; 3] = Default::default();
        for &(signal, plug) in events {
            let callbacks =
                cache[signal.index()].get_or_insert_with(|| self.signals.callbacks(signal));
            for callback in callbacks.iter() {
                callback(self, plug);
            }
        }
    }

    pub(crate) fn emit_dirtied(&self, plugs: &[PlugId]) {
        let events: Vec<_> = plugs.iter().map(|&p| (Signal::PlugDirtied, p)).collect();
        self.emit(&events);
    }
}

/// Marks the current thread as emitting until dropped.
struct Emitting<'a> {
    graph: &'a Graph,
    nested: bool,
}

impl<'a> Emitting<'a> {
    fn enter(graph: &'a Graph) -> Self {
        let nested = !graph.dirty.lock().emitting.insert(thread::current().id());
        Self { graph, nested }
    }
}

impl Drop for Emitting<'_> {
    fn drop(&mut self) {
        if !self.nested {
            self.graph.dirty.lock().emitting.remove(&thread::current().id());
        }
    }
}
