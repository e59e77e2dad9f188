//! Memoized, context-parameterised evaluation of node graphs.
//!
//! A [`Graph`] holds nodes whose typed plugs are connected to each other.
//! Output plugs of nodes implementing [`Compute`] are evaluated on demand in
//! a [`Context`]: the node first hashes everything its compute will read,
//! and the compute only runs if the [`Engine`] has no value cached for that
//! fingerprint. Edits propagate dirtiness downstream so that fingerprints
//! are rederived lazily.
//!
//! ```
//! use plexus::nodes::Add;
//! use plexus::{Context, Graph};
//!
//! # fn main() -> plexus::Result<()> {
//! let graph = Graph::new();
//! let add = graph.add_node("add", Add::new(2.0))?;
//! graph.set_value(graph.plug(add, "in1")?, 3.0.into())?;
//!
//! let sum = graph.value(graph.plug(add, "sum")?, &Context::new())?;
//! assert_eq!(sum.as_float(), Some(5.0));
//! # Ok(())
//! # }
//! ```

mod cache;
mod cancel;
mod config;
mod context;
mod dirty;
mod engine;
mod error;
mod graph;
mod hash;
pub mod monitor;
pub mod nodes;
mod passthroughhasher;
mod process;
mod signal;
mod value;

#[cfg(feature = "testing")]
pub mod testing;

pub use crate::cache::{Cache, CacheStatistics};
pub use crate::cancel::Canceller;
pub use crate::config::{EngineConfig, HashValidation};
pub use crate::context::{Context, ContextScope, FRAME, FRAMES_PER_SECOND, Substitutions};
pub use crate::dirty::DirtyScope;
pub use crate::engine::{ComputeContext, Engine, HashContext, MonitorScope, ProcessContext};
pub use crate::error::{Error, Frame, ProcessError, Result};
pub use crate::graph::{
    CachePolicy, Compute, Direction, Graph, NodeId, PlugFlags, PlugId, PlugInfo, PlugSpec,
};
pub use crate::hash::{Accumulator, Fingerprint, hash};
pub use crate::monitor::{Monitor, Process};
pub use crate::process::ProcessKind;
pub use crate::signal::{Callback, Signal, Subscription};
pub use crate::value::{Value, ValueType};
