//! Nodes, plugs and the connections between them.

mod node;
mod plug;
pub(crate) mod store;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::instrument;

pub use self::node::{CachePolicy, Compute, NodeId, PlugInfo};
pub use self::plug::{Direction, PlugFlags, PlugId, PlugSpec};
use self::store::Store;
use crate::context::Context;
use crate::dirty::DirtyState;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::hash::Fingerprint;
use crate::signal::{Signal, Signals};
use crate::value::{Value, ValueType};

/// A graph of nodes whose plugs are connected to each other.
///
/// All methods take `&self`: the graph synchronizes internally and may be
/// shared between threads. Evaluation never holds the graph's lock while a
/// node's `hash` or `compute` runs, so computes may read other plugs freely.
///
/// Edits are validated before anything changes; a failed edit leaves the
/// graph untouched.
pub struct Graph {
    engine: Arc<Engine>,
    pub(crate) store: RwLock<Store>,
    pub(crate) dirty: Mutex<DirtyState>,
    pub(crate) signals: Signals,
}

impl Graph {
    /// Create an empty graph evaluated by the process-wide [`Engine`].
    pub fn new() -> Self {
        Self::with_engine(Engine::shared())
    }

    /// Create an empty graph evaluated by the given engine.
    pub fn with_engine(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            store: RwLock::new(Store::default()),
            dirty: Mutex::new(DirtyState::default()),
            signals: Signals::default(),
        }
    }

    /// The engine evaluating this graph.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Add a node that computes its outputs with `compute`. The node starts
    /// out with the plugs `compute` declares.
    pub fn add_node(&self, name: &str, compute: impl Compute) -> Result<NodeId> {
        self.check_reentrancy()?;
        let compute: Arc<dyn Compute> = Arc::new(compute);
        let specs = compute.plugs();
        let mut store = self.store.write();
        let node = store.add_node(name, Some(compute))?;
        for spec in specs {
            if let Err(error) = store.add_plug(node, None, spec) {
                Self::discard_node(&mut store, node);
                return Err(error);
            }
        }
        Ok(node)
    }

    /// Add a node without a compute. Its plugs, added with
    /// [`add_plug`](Self::add_plug), hold values and pass them on.
    pub fn add_container(&self, name: &str) -> Result<NodeId> {
        self.check_reentrancy()?;
        self.store.write().add_node(name, None)
    }

    fn discard_node(store: &mut Store, node: NodeId) {
        let plugs = store.node(node).map(|n| n.plugs.clone()).unwrap_or_default();
        for plug in plugs {
            let _ = store.remove_plug(plug);
        }
        let _ = store.remove_node(node);
    }

    /// Add a plug to a node after its creation. The plug is flagged
    /// [`PlugFlags::DYNAMIC`].
    pub fn add_plug(&self, node: NodeId, spec: PlugSpec) -> Result<PlugId> {
        self.check_reentrancy()?;
        let spec = spec.mark_dynamic();
        self.store.write().add_plug(node, None, spec)
    }

    /// Add a child to a compound plug.
    pub fn add_child_plug(&self, parent: PlugId, spec: PlugSpec) -> Result<PlugId> {
        self.check_reentrancy()?;
        let mut store = self.store.write();
        let data = store.plug(parent)?;
        let node = data.node;
        let spec = spec.mark_dynamic().into_direction(data.direction);
        store.add_plug(node, Some(parent), spec)
    }

    /// Remove a plug and its children, disconnecting them first.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_plug(&self, plug: PlugId) -> Result<()> {
        self.check_reentrancy()?;
        let changed = {
            let mut store = self.store.write();
            let subtree = store.subtree(plug);
            store.plug(plug)?;
            self.dirty(&mut store, &subtree);
            store.remove_plug(plug)?
        };
        self.emit_input_changed(&changed);
        self.flush_dirty();
        Ok(())
    }

    /// Remove a node and all its plugs, disconnecting them first.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_node(&self, node: NodeId) -> Result<()> {
        self.check_reentrancy()?;
        let changed = {
            let mut store = self.store.write();
            let plugs = store.node(node)?.plugs.clone();
            let roots: Vec<PlugId> = plugs.iter().flat_map(|&p| store.subtree(p)).collect();
            self.dirty(&mut store, &roots);
            let mut changed = Vec::new();
            for plug in plugs {
                changed.extend(store.remove_plug(plug)?);
            }
            store.remove_node(node)?;
            changed
        };
        self.emit_input_changed(&changed);
        self.flush_dirty();
        Ok(())
    }

    /// Connect `plug` to take its value from `input`, or disconnect it with
    /// `None`.
    ///
    /// Compound plugs are connected child by child. Fails without changing
    /// anything if the types are incompatible, the connection would create a
    /// cycle, or the plug refuses inputs.
    #[instrument(level = "debug", skip(self))]
    pub fn set_input(&self, plug: PlugId, input: Option<PlugId>) -> Result<()> {
        self.check_reentrancy()?;
        let changed = {
            let mut store = self.store.write();
            let data = store.plug(plug)?;
            if data.input == input {
                return Ok(());
            }
            match input {
                Some(input) => store.check_connection(plug, input)?,
                None if data.flags.contains(PlugFlags::READ_ONLY) => {
                    return Err(Error::Immutable {
                        plug: store.full_name(plug),
                        reason: "plug is read-only",
                    });
                }
                None => {}
            }
            let mut changed = Vec::new();
            store.connect(plug, input, &mut changed)?;
            self.dirty(&mut store, &changed);
            changed
        };
        self.emit_input_changed(&changed);
        self.flush_dirty();
        Ok(())
    }

    /// Whether [`set_input`](Self::set_input) would accept the connection.
    pub fn accepts_input(&self, plug: PlugId, input: PlugId) -> bool {
        self.store.read().check_connection(plug, input).is_ok()
    }

    /// Set the value of an unconnected plug.
    ///
    /// Numeric values are converted to the plug's type. Setting the value
    /// the plug already holds does nothing.
    #[instrument(level = "debug", skip(self))]
    pub fn set_value(&self, plug: PlugId, value: Value) -> Result<()> {
        self.check_reentrancy()?;
        let set = {
            let mut store = self.store.write();
            let data = store.plug(plug)?;
            let immutable = |reason| Error::Immutable { plug: store.full_name(plug), reason };
            if data.flags.contains(PlugFlags::READ_ONLY) {
                return Err(immutable("plug is read-only"));
            }
            if data.value_type == ValueType::Compound {
                return Err(immutable("compound plugs are set through their children"));
            }
            if data.input.is_some() {
                return Err(immutable("plug has an input connection"));
            }
            if data.direction == Direction::Out && store.compute_of(data).is_some() {
                return Err(immutable("plug is computed"));
            }
            let Some(value) = value.convert(data.value_type) else {
                return Err(Error::TypeMismatch {
                    plug: store.full_name(plug),
                    input: "value".into(),
                    expected: data.value_type,
                    found: value.value_type(),
                });
            };
            if data.value == value {
                return Ok(());
            }

            store.plug_mut(plug)?.value = value;
            let set = downstream(&store, plug);
            self.dirty(&mut store, &[plug]);
            set
        };
        let events: Vec<_> = set.into_iter().map(|p| (Signal::PlugSet, p)).collect();
        self.emit(&events);
        self.flush_dirty();
        Ok(())
    }

    /// Reset a plug (and its children) to the default value.
    pub fn set_to_default(&self, plug: PlugId) -> Result<()> {
        let _batch = self.dirty_scope();
        let leaves: Vec<(PlugId, Value)> = {
            let store = self.store.read();
            store
                .subtree(plug)
                .into_iter()
                .filter_map(|p| store.plug(p).ok().map(|d| (p, d)))
                .filter(|(_, d)| d.value_type != ValueType::Compound)
                .map(|(p, d)| (p, d.default.clone()))
                .collect()
        };
        for (leaf, default) in leaves {
            self.set_value(leaf, default)?;
        }
        Ok(())
    }

    /// Whether a plug (and all its children) holds its default value.
    /// Connected and computed plugs never do.
    pub fn is_set_to_default(&self, plug: PlugId) -> Result<bool> {
        let store = self.store.read();
        store.plug(plug)?;
        Ok(store.subtree(plug).into_iter().all(|p| {
            let Ok(data) = store.plug(p) else { return false };
            if data.value_type == ValueType::Compound {
                return true;
            }
            let computed = data.direction == Direction::Out && store.compute_of(data).is_some();
            data.input.is_none() && !computed && data.value == data.default
        }))
    }

    /// Evaluate a plug in a context.
    pub fn value(&self, plug: PlugId, context: &Context) -> Result<Value> {
        self.engine.value(self, plug, context)
    }

    /// The fingerprint of a plug's value in a context.
    pub fn hash(&self, plug: PlugId, context: &Context) -> Result<Fingerprint> {
        self.engine.hash(self, plug, context)
    }

    fn emit_input_changed(&self, plugs: &[PlugId]) {
        let events: Vec<_> = plugs.iter().map(|&p| (Signal::PlugInputChanged, p)).collect();
        self.emit(&events);
    }
}

impl Graph {
    /// Find a node by name.
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.store.read().node_named(name)
    }

    /// All nodes, in creation order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.store.read().nodes()
    }

    /// Find a plug by its path relative to a node, e.g. `"color.r"`.
    pub fn plug(&self, node: NodeId, path: &str) -> Result<PlugId> {
        let store = self.store.read();
        let data = store.node(node)?;
        data.paths
            .get(path)
            .copied()
            .ok_or_else(|| Error::InvalidPlug(format!("{}.{path}", data.name)))
    }

    /// Find a plug by its full name, e.g. `"grade.color.r"`.
    pub fn find_plug(&self, full_name: &str) -> Result<PlugId> {
        let (node, path) = full_name
            .split_once('.')
            .ok_or_else(|| Error::InvalidPlug(full_name.into()))?;
        let node = self.node(node).ok_or_else(|| Error::InvalidNode(node.into()))?;
        self.plug(node, path)
    }

    /// Whether the plug still exists.
    pub fn contains(&self, plug: PlugId) -> bool {
        self.store.read().contains_plug(plug)
    }

    pub fn node_name(&self, node: NodeId) -> Result<String> {
        Ok(self.store.read().node(node)?.name.to_string())
    }

    /// The type name of a node's compute, or `"Container"`.
    pub fn node_type(&self, node: NodeId) -> Result<String> {
        Ok(self.store.read().node(node)?.type_name().to_string())
    }

    /// The top-level plugs of a node, in creation order.
    pub fn plugs(&self, node: NodeId) -> Result<Vec<PlugId>> {
        Ok(self.store.read().node(node)?.plugs.clone())
    }

    /// `node.path` of a plug.
    pub fn full_name(&self, plug: PlugId) -> String {
        self.store.read().full_name(plug)
    }

    pub fn name(&self, plug: PlugId) -> Result<String> {
        Ok(self.store.read().plug(plug)?.name.to_string())
    }

    pub fn direction(&self, plug: PlugId) -> Result<Direction> {
        Ok(self.store.read().plug(plug)?.direction)
    }

    pub fn value_type(&self, plug: PlugId) -> Result<ValueType> {
        Ok(self.store.read().plug(plug)?.value_type)
    }

    pub fn node_of(&self, plug: PlugId) -> Result<NodeId> {
        Ok(self.store.read().plug(plug)?.node)
    }

    pub fn parent(&self, plug: PlugId) -> Result<Option<PlugId>> {
        Ok(self.store.read().plug(plug)?.parent)
    }

    pub fn children(&self, plug: PlugId) -> Result<Vec<PlugId>> {
        Ok(self.store.read().plug(plug)?.children.clone())
    }

    /// The plug this plug takes its value from.
    pub fn input(&self, plug: PlugId) -> Result<Option<PlugId>> {
        Ok(self.store.read().plug(plug)?.input)
    }

    /// The plugs taking their value from this plug.
    pub fn outputs(&self, plug: PlugId) -> Result<Vec<PlugId>> {
        Ok(self.store.read().plug(plug)?.outputs.clone())
    }

    /// The plug at the start of the chain of connections leading to `plug`.
    pub fn source(&self, plug: PlugId) -> Result<PlugId> {
        let store = self.store.read();
        let mut current = plug;
        while let Some(input) = store.plug(current)?.input {
            current = input;
        }
        Ok(current)
    }

    pub fn flags(&self, plug: PlugId) -> Result<PlugFlags> {
        Ok(self.store.read().plug(plug)?.flags)
    }

    pub fn set_flags(&self, plug: PlugId, flags: PlugFlags) -> Result<()> {
        self.check_reentrancy()?;
        self.store.write().plug_mut(plug)?.flags = flags;
        Ok(())
    }

    pub fn default_value(&self, plug: PlugId) -> Result<Value> {
        Ok(self.store.read().plug(plug)?.default.clone())
    }

    /// How often the plug has been dirtied.
    pub fn dirty_count(&self, plug: PlugId) -> Result<u64> {
        Ok(self.store.read().plug(plug)?.dirty)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Graph {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let store = self.store.read();
        let mut list = f.debug_list();
        for node in store.nodes() {
            if let Ok(data) = store.node(node) {
                list.entry(&format_args!("{} ({})", data.name, data.type_name()));
            }
        }
        list.finish()
    }
}

/// `plug` and every plug connected downstream of it.
fn downstream(store: &Store, plug: PlugId) -> Vec<PlugId> {
    let mut result = vec![plug];
    let mut i = 0;
    while i < result.len() {
        if let Ok(data) = store.plug(result[i]) {
            result.extend(data.outputs.iter().copied());
        }
        i += 1;
    }
    result
}
