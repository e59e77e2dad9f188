use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use slab::Slab;

use crate::error::{Error, Result};
use crate::graph::node::{Compute, NodeData, NodeId, PlugInfo};
use crate::graph::plug::{Direction, PlugData, PlugFlags, PlugId, PlugSpec};
use crate::hash::{Accumulator, Fingerprint};
use crate::value::{Value, ValueType};

/// Source of plug and node serial numbers. Shared by all graphs, so that
/// graphs sharing an engine never alias each other's cache entries.
static SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Arena of nodes and plugs.
#[derive(Default)]
pub(crate) struct Store {
    nodes: Slab<NodeData>,
    plugs: Slab<PlugData>,
    names: FxHashMap<Arc<str>, NodeId>,
}

impl Store {
    pub fn plug(&self, id: PlugId) -> Result<&PlugData> {
        self.plugs
            .get(id.key)
            .filter(|plug| plug.serial == id.serial)
            .ok_or_else(|| Error::InvalidPlug(format!("{id:?}")))
    }

    pub fn plug_mut(&mut self, id: PlugId) -> Result<&mut PlugData> {
        self.plugs
            .get_mut(id.key)
            .filter(|plug| plug.serial == id.serial)
            .ok_or_else(|| Error::InvalidPlug(format!("{id:?}")))
    }

    pub fn contains_plug(&self, id: PlugId) -> bool {
        self.plug(id).is_ok()
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeData> {
        self.nodes
            .get(id.key)
            .filter(|node| node.serial == id.serial)
            .ok_or_else(|| Error::InvalidNode(format!("{id:?}")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeData> {
        self.nodes
            .get_mut(id.key)
            .filter(|node| node.serial == id.serial)
            .ok_or_else(|| Error::InvalidNode(format!("{id:?}")))
    }

    pub fn node_named(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|(key, node)| NodeId { key, serial: node.serial })
            .collect();
        nodes.sort_by_key(|id| id.serial);
        nodes
    }

    /// The compute of the node owning `plug`, if that node computes.
    pub fn compute_of(&self, plug: &PlugData) -> Option<&Arc<dyn Compute>> {
        self.node(plug.node).ok()?.compute.as_ref()
    }

    pub fn full_name(&self, id: PlugId) -> String {
        match self.plug(id) {
            Ok(plug) => match self.node(plug.node) {
                Ok(node) => format!("{}.{}", node.name, plug.path),
                Err(_) => plug.path.to_string(),
            },
            Err(_) => format!("<removed {id:?}>"),
        }
    }

    pub fn info(&self, id: PlugId) -> Result<PlugInfo> {
        let plug = self.plug(id)?;
        Ok(PlugInfo {
            id,
            full_name: self.full_name(id),
            direction: plug.direction,
            value_type: plug.value_type,
        })
    }

    pub fn add_node(&mut self, name: &str, compute: Option<Arc<dyn Compute>>) -> Result<NodeId> {
        if name.is_empty() || name.contains('.') {
            return Err(Error::InvalidNode(format!("invalid node name {name:?}")));
        }
        if self.names.contains_key(name) {
            return Err(Error::DuplicateName { parent: "graph".into(), name: name.into() });
        }
        let name: Arc<str> = name.into();
        let serial = next_serial();
        let key = self.nodes.insert(NodeData {
            serial,
            name: name.clone(),
            compute,
            plugs: Vec::new(),
            paths: FxHashMap::default(),
        });
        let id = NodeId { key, serial };
        self.names.insert(name, id);
        Ok(id)
    }

    /// Add a plug (and its children) to a node, or as a child of `parent`.
    pub fn add_plug(
        &mut self,
        node: NodeId,
        parent: Option<PlugId>,
        spec: PlugSpec,
    ) -> Result<PlugId> {
        if spec.name.is_empty() || spec.name.contains('.') {
            return Err(Error::InvalidPlug(format!("invalid plug name {:?}", spec.name)));
        }
        if spec.value_type != ValueType::Compound && spec.default.value_type() != spec.value_type {
            return Err(Error::TypeMismatch {
                plug: spec.name.clone(),
                input: "default value".into(),
                expected: spec.value_type,
                found: spec.default.value_type(),
            });
        }

        let path: Arc<str> = match parent {
            Some(parent) => {
                let parent = self.plug(parent)?;
                if parent.value_type != ValueType::Compound {
                    return Err(Error::InvalidPlug(format!(
                        "{} cannot have children",
                        parent.path
                    )));
                }
                format!("{}.{}", parent.path, spec.name).into()
            }
            None => spec.name.as_str().into(),
        };

        let data = self.node(node)?;
        if data.paths.contains_key(&path) {
            return Err(Error::DuplicateName {
                parent: match parent {
                    Some(parent) => self.full_name(parent),
                    None => data.name.to_string(),
                },
                name: spec.name,
            });
        }

        let serial = next_serial();
        let key = self.plugs.insert(PlugData {
            serial,
            name: spec.name.as_str().into(),
            path: path.clone(),
            direction: spec.direction,
            node,
            parent,
            children: Vec::new(),
            value_type: spec.value_type,
            value: spec.default.clone(),
            default: spec.default,
            flags: spec.flags,
            input: None,
            outputs: Vec::new(),
            dirty: 0,
        });
        let id = PlugId { key, serial };

        let data = self.node_mut(node)?;
        data.paths.insert(path, id);
        match parent {
            Some(parent) => self.plug_mut(parent)?.children.push(id),
            None => self.node_mut(node)?.plugs.push(id),
        }

        for child in spec.children {
            self.add_plug(node, Some(id), child)?;
        }

        Ok(id)
    }

    /// The plug and all its descendants, parents before children.
    pub fn subtree(&self, id: PlugId) -> Vec<PlugId> {
        let mut result = vec![id];
        let mut i = 0;
        while i < result.len() {
            if let Ok(plug) = self.plug(result[i]) {
                result.extend(plug.children.iter().copied());
            }
            i += 1;
        }
        result
    }

    /// Disconnect and destroy a plug and its descendants. Returns the plugs
    /// whose input was removed as a consequence.
    pub fn remove_plug(&mut self, id: PlugId) -> Result<Vec<PlugId>> {
        let plug = self.plug(id)?;
        let (node, parent) = (plug.node, plug.parent);
        let subtree = self.subtree(id);

        let mut disconnected = Vec::new();
        for &member in &subtree {
            let plug = self.plug_mut(member)?;
            let input = plug.input.take();
            let outputs = std::mem::take(&mut plug.outputs);
            if let Some(input) = input {
                if let Ok(source) = self.plug_mut(input) {
                    source.outputs.retain(|&o| o != member);
                }
            }
            for output in outputs {
                if subtree.contains(&output) {
                    continue;
                }
                if let Ok(destination) = self.plug_mut(output) {
                    destination.input = None;
                    disconnected.push(output);
                }
            }
        }

        for &member in subtree.iter().rev() {
            let removed = self.plugs.remove(member.key);
            self.node_mut(node)?.paths.remove(&removed.path);
        }
        match parent {
            Some(parent) => self.plug_mut(parent)?.children.retain(|&c| c != id),
            None => self.node_mut(node)?.plugs.retain(|&p| p != id),
        }

        Ok(disconnected)
    }

    /// Destroy a node whose plugs were already removed.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        debug_assert!(node.plugs.is_empty());
        let name = node.name.clone();
        self.nodes.remove(id.key);
        self.names.remove(&name);
        Ok(())
    }

    /// Validate connecting `plug` to `source`, including all child pairs of
    /// compound plugs.
    pub fn check_connection(&self, plug: PlugId, source: PlugId) -> Result<()> {
        let data = self.plug(plug)?;
        let input = self.plug(source)?;

        if plug == source {
            return Err(self.cycle(plug, source));
        }
        if data.flags.contains(PlugFlags::READ_ONLY) {
            return Err(Error::Immutable {
                plug: self.full_name(plug),
                reason: "plug is read-only",
            });
        }
        let rejected = || Error::InputRejected {
            plug: self.full_name(plug),
            input: self.full_name(source),
        };
        if !data.flags.contains(PlugFlags::ACCEPTS_INPUTS) {
            return Err(rejected());
        }
        if let Some(compute) = self.compute_of(data) {
            if data.direction == Direction::Out {
                return Err(rejected());
            }
            if !compute.accepts_input(&data.path, &self.info(source)?) {
                return Err(rejected());
            }
        }

        let mismatch = || Error::TypeMismatch {
            plug: self.full_name(plug),
            input: self.full_name(source),
            expected: data.value_type,
            found: input.value_type,
        };
        if data.value_type == ValueType::Compound {
            if input.value_type != ValueType::Compound
                || data.children.len() > input.children.len()
            {
                return Err(mismatch());
            }
            for (&child, &source_child) in data.children.iter().zip(&input.children) {
                self.check_connection(child, source_child)?;
            }
        } else if !data.value_type.accepts(input.value_type) {
            return Err(mismatch());
        }

        if self.reaches(plug, source) {
            return Err(self.cycle(plug, source));
        }

        Ok(())
    }

    fn cycle(&self, plug: PlugId, source: PlugId) -> Error {
        Error::CycleDetected { plug: self.full_name(plug), input: self.full_name(source) }
    }

    /// Connect `plug` to `source` (or disconnect it), children first.
    /// Records every plug whose input changed.
    pub fn connect(
        &mut self,
        plug: PlugId,
        source: Option<PlugId>,
        changed: &mut Vec<PlugId>,
    ) -> Result<()> {
        let data = self.plug(plug)?;
        let old = data.input;
        let children = data.children.clone();
        let source_children = match source {
            Some(source) => self.plug(source)?.children.clone(),
            None => Vec::new(),
        };

        for (i, child) in children.into_iter().enumerate() {
            self.connect(child, source_children.get(i).copied(), changed)?;
        }

        if old == source {
            return Ok(());
        }
        if let Some(old) = old {
            if let Ok(old) = self.plug_mut(old) {
                old.outputs.retain(|&o| o != plug);
            }
        }
        if let Some(source) = source {
            self.plug_mut(source)?.outputs.push(plug);
        }
        self.plug_mut(plug)?.input = source;
        changed.push(plug);
        Ok(())
    }

    /// The plugs directly dirtied when `id` is dirtied: connected
    /// destinations, outputs affected through the owning node's compute, and
    /// the parent plug.
    pub fn successors(&self, id: PlugId, out: &mut Vec<PlugId>) {
        let Ok(plug) = self.plug(id) else { return };
        out.extend(plug.outputs.iter().copied());

        if plug.direction == Direction::In {
            if let Ok(node) = self.node(plug.node) {
                if let Some(compute) = &node.compute {
                    for name in compute.affects(&plug.path) {
                        if let Some(&affected) = node.paths.get(name) {
                            out.extend(self.subtree(affected));
                        }
                    }
                }
            }
        }

        if let Some(parent) = plug.parent {
            out.push(parent);
        }
    }

    /// Whether `target` is reachable downstream of `from`.
    fn reaches(&self, from: PlugId, target: PlugId) -> bool {
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from([from]);
        let mut next = Vec::new();
        while let Some(id) = queue.pop_front() {
            if id == target {
                return true;
            }
            next.clear();
            self.successors(id, &mut next);
            for &n in &next {
                if visited.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        false
    }

    /// Find where the value of `id` comes from.
    pub fn resolve(&self, mut id: PlugId) -> Result<Resolved> {
        let mut conversions = Vec::new();
        loop {
            let plug = self.plug(id)?;
            if plug.value_type == ValueType::Compound && !plug.children.is_empty() {
                let origin = Origin::Compound(plug.children.clone());
                return Ok(Resolved { origin, conversions });
            }
            if let Some(input) = plug.input {
                let source = self.plug(input)?;
                if source.value_type != plug.value_type {
                    conversions.push((source.value_type, plug.value_type));
                }
                id = input;
                continue;
            }
            let origin = match (self.compute_of(plug), plug.direction) {
                (Some(compute), Direction::Out) => Origin::Computed(Target {
                    plug: id,
                    node: plug.node,
                    path: plug.path.clone(),
                    value_type: plug.value_type,
                    compute: compute.clone(),
                    dirty: plug.dirty,
                }),
                _ => Origin::Static(plug.value.clone()),
            };
            return Ok(Resolved { origin, conversions });
        }
    }
}

/// Where a requested plug's value comes from, and how it must be converted
/// on the way.
pub(crate) struct Resolved {
    pub origin: Origin,
    /// `(from, to)` type conversions, nearest to the requested plug first.
    conversions: Vec<(ValueType, ValueType)>,
}

pub(crate) enum Origin {
    /// An unconnected input, or an output of a container.
    Static(Value),
    /// A compound plug, made of its children.
    Compound(Vec<PlugId>),
    /// An output computed by its node.
    Computed(Target),
}

/// An output plug whose value comes from its node's compute.
#[derive(Clone)]
pub(crate) struct Target {
    pub plug: PlugId,
    pub node: NodeId,
    pub path: Arc<str>,
    pub value_type: ValueType,
    pub compute: Arc<dyn Compute>,
    pub dirty: u64,
}

impl Resolved {
    pub fn convert(&self, mut value: Value) -> Result<Value> {
        for &(from, to) in self.conversions.iter().rev() {
            value = value
                .convert(to)
                .ok_or_else(|| Error::msg(format!("cannot convert {from} to {to}")))?;
        }
        Ok(value)
    }

    pub fn convert_hash(&self, mut fingerprint: Fingerprint) -> Fingerprint {
        for &(from, to) in self.conversions.iter().rev() {
            let mut h = Accumulator::new();
            h.append_fingerprint(fingerprint).append(&from).append(&to);
            fingerprint = h.fingerprint();
        }
        fingerprint
    }
}
