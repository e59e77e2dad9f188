use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::engine::{ComputeContext, HashContext};
use crate::error::Result;
use crate::graph::{PlugId, PlugSpec};
use crate::hash::Accumulator;
use crate::value::{Value, ValueType};

/// Identifies a node in a [`Graph`](crate::Graph). Never reused.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId {
    pub(crate) key: usize,
    pub(crate) serial: u64,
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "NodeId({}#{})", self.key, self.serial)
    }
}

/// Whether the results of a compute are cached.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CachePolicy {
    /// Neither the fingerprint nor the value is cached, and concurrent
    /// requests are not deduplicated. For computes cheaper than a cache
    /// lookup.
    Uncached,
    /// Fingerprints and values are cached, and concurrent requests for the
    /// same value wait for a single compute.
    #[default]
    Standard,
}

/// What a node needs to know about a plug offered as an input.
#[derive(Debug, Clone)]
pub struct PlugInfo {
    pub id: PlugId,
    pub full_name: String,
    pub direction: crate::graph::Direction,
    pub value_type: ValueType,
}

/// The behaviour of a node whose output plugs are computed.
///
/// Plugs are named by their path relative to the node, e.g. `"in"` or
/// `"color.r"` for the child of a compound plug.
///
/// Implementations must be deterministic: everything `compute` reads must be
/// appended to the accumulator by `hash`, and every output an input
/// influences must be listed by `affects`. Neither is verified at runtime
/// unless [`HashValidation`](crate::HashValidation) is enabled.
pub trait Compute: Send + Sync + 'static {
    /// Name used in diagnostics and monitors.
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// The plugs every node of this kind starts out with.
    fn plugs(&self) -> Vec<PlugSpec>;

    /// The outputs whose value may change when `input` changes.
    fn affects(&self, input: &str) -> Vec<&str>;

    /// Append everything `compute` will read for `output` to `h`.
    fn hash(&self, output: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()>;

    /// Compute the value of `output`.
    fn compute(&self, output: &str, cx: &ComputeContext) -> Result<Value>;

    fn cache_policy(&self, _output: &str) -> CachePolicy {
        CachePolicy::Standard
    }

    /// Whether `plug` may be connected to `source`. Called in addition to the
    /// graph's own type and cycle checks.
    fn accepts_input(&self, _plug: &str, _source: &PlugInfo) -> bool {
        true
    }
}

/// Stored state of a node.
pub(crate) struct NodeData {
    pub serial: u64,
    pub name: Arc<str>,
    /// `None` for containers that only hold and pass on values.
    pub compute: Option<Arc<dyn Compute>>,
    /// Top-level plugs in creation order.
    pub plugs: Vec<PlugId>,
    /// All plugs, including children, by relative path.
    pub paths: FxHashMap<Arc<str>, PlugId>,
}

impl NodeData {
    pub fn type_name(&self) -> &str {
        match &self.compute {
            Some(compute) => compute.type_name(),
            None => "Container",
        }
    }
}
