use std::fmt::{self, Debug, Formatter};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Instant;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, error, trace, warn};

use crate::cache::{Cache, CacheStatistics};
use crate::config::{EngineConfig, HashValidation};
use crate::context::Context;
use crate::error::{Error, Frame, ProcessError, Result};
use crate::graph::store::{Origin, Target};
use crate::graph::{CachePolicy, Graph, NodeId, PlugId};
use crate::hash::{Accumulator, Fingerprint, hash};
use crate::monitor::{Monitor, Process};
use crate::process::{self, Claim, HashKey, InFlight, Nested, ProcessKind, ValueKey};
use crate::value::{Value, ValueType};

/// Fixed cost charged per cached value on top of its memory usage.
const ENTRY_OVERHEAD: usize = 64;

/// The process-wide engine used by [`Graph::new`].
static SHARED: LazyLock<Arc<Engine>> =
    LazyLock::new(|| Arc::new(Engine::new(EngineConfig::default())));

/// Evaluates graphs: runs the hash/compute protocol and owns the caches.
///
/// An engine can serve any number of graphs. Graphs created with
/// [`Graph::new`] share [`Engine::shared`]; pass another engine to
/// [`Graph::with_engine`] to isolate caches and monitors.
pub struct Engine {
    config: EngineConfig,
    values: Cache<ValueKey, Value>,
    hashes: Cache<HashKey, Fingerprint>,
    in_flight: InFlight,
    monitors: RwLock<Arc<[Arc<dyn Monitor>]>>,
    validations: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            values: Cache::new(config.value_cache_capacity, config.shards),
            hashes: Cache::new(config.hash_cache_capacity, config.shards),
            in_flight: InFlight::default(),
            monitors: RwLock::new(Arc::from([])),
            validations: AtomicU64::new(0),
            config,
        }
    }

    /// The process-wide default engine.
    pub fn shared() -> Arc<Engine> {
        SHARED.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Remove all cached values and fingerprints.
    pub fn clear_cache(&self) {
        self.values.clear();
        self.hashes.clear();
        debug!("cleared caches");
    }

    /// Limit the memory used by cached values, in bytes.
    pub fn set_cache_capacity(&self, bytes: usize) {
        self.values.set_capacity(bytes);
        debug!(bytes, "set value cache capacity");
    }

    pub fn cache_capacity(&self) -> usize {
        self.values.capacity()
    }

    /// Limit the number of cached fingerprints.
    pub fn set_hash_cache_capacity(&self, entries: usize) {
        self.hashes.set_capacity(entries);
        debug!(entries, "set hash cache capacity");
    }

    /// Counters of the value cache.
    pub fn cache_statistics(&self) -> CacheStatistics {
        self.values.statistics()
    }

    /// Counters of the fingerprint cache.
    pub fn hash_cache_statistics(&self) -> CacheStatistics {
        self.hashes.statistics()
    }

    /// Reset the hit, miss and eviction counters of both caches.
    pub fn reset_cache_statistics(&self) {
        self.values.reset_statistics();
        self.hashes.reset_statistics();
    }

    /// Start observing all processes run by this engine. Observation stops
    /// when the returned scope is dropped.
    pub fn attach<M: Monitor>(self: &Arc<Self>, monitor: Arc<M>) -> MonitorScope {
        let monitor: Arc<dyn Monitor> = monitor;
        let mut monitors = self.monitors.write();
        let mut list = monitors.to_vec();
        list.push(monitor.clone());
        *monitors = list.into();
        MonitorScope { engine: self.clone(), monitor }
    }

    /// Stop observing with `monitor`. Returns whether it was attached.
    pub fn detach(&self, monitor: &dyn Monitor) -> bool {
        let mut monitors = self.monitors.write();
        let before = monitors.len();
        let list: Vec<_> = monitors
            .iter()
            .filter(|m| !ptr::addr_eq(Arc::as_ptr(m), monitor as *const dyn Monitor))
            .cloned()
            .collect();
        let detached = list.len() < before;
        *monitors = list.into();
        detached
    }

    fn monitors(&self) -> Arc<[Arc<dyn Monitor>]> {
        self.monitors.read().clone()
    }
}

impl Engine {
    pub(crate) fn value(&self, graph: &Graph, plug: PlugId, context: &Context) -> Result<Value> {
        let resolved = graph.store.read().resolve(plug)?;
        let value = match &resolved.origin {
            Origin::Static(value) => value.clone(),
            Origin::Compound(children) => Value::Compound(
                children
                    .iter()
                    .map(|&child| self.value(graph, child, context))
                    .collect::<Result<Vec<_>>>()?
                    .into(),
            ),
            Origin::Computed(target) => self.compute(graph, target, context)?,
        };
        resolved.convert(value)
    }

    pub(crate) fn hash(
        &self,
        graph: &Graph,
        plug: PlugId,
        context: &Context,
    ) -> Result<Fingerprint> {
        let resolved = graph.store.read().resolve(plug)?;
        let fingerprint = match &resolved.origin {
            Origin::Static(value) => hash(value),
            Origin::Compound(children) => {
                let mut h = Accumulator::new();
                h.append(&ValueType::Compound);
                for &child in children {
                    h.append_fingerprint(self.hash(graph, child, context)?);
                }
                h.fingerprint()
            }
            Origin::Computed(target) => {
                let policy = target.compute.cache_policy(&target.path);
                self.hash_process(graph, target, context, policy)?
            }
        };
        Ok(resolved.convert_hash(fingerprint))
    }

    /// Run the hash process of a computed plug, consulting the fingerprint
    /// cache first.
    fn hash_process(
        &self,
        graph: &Graph,
        target: &Target,
        context: &Context,
        policy: CachePolicy,
    ) -> Result<Fingerprint> {
        let key = HashKey {
            serial: target.plug.serial,
            dirty: target.dirty,
            context: context.fingerprint(),
        };
        if policy == CachePolicy::Standard {
            if let Some(fingerprint) = self.hashes.get(&key) {
                return Ok(fingerprint);
            }
        }

        context.check_cancelled()?;
        let cx = ProcessContext::new(graph, target.plug, context);
        let node_type = target.compute.type_name();
        let result = self.observe(ProcessKind::Hash, target, context, || {
            let mut h = Accumulator::new();
            h.append(node_type).append(&*target.path);
            let prefix = h.writes();
            target.compute.hash(&target.path, &cx, &mut h)?;
            if h.writes() == prefix {
                return Err(Error::msg(format!(
                    "{node_type} does not implement hash for \"{}\"",
                    target.path
                )));
            }
            Ok(h.fingerprint())
        });

        let fingerprint =
            result.map_err(|e| self.wrap(graph, ProcessKind::Hash, target, context, e))?;
        if policy == CachePolicy::Standard {
            self.hashes.insert(key, fingerprint, 1);
        }
        Ok(fingerprint)
    }

    /// Produce the value of a computed plug: hash it, look it up, and compute
    /// it only if no other thread is already doing so.
    fn compute(&self, graph: &Graph, target: &Target, context: &Context) -> Result<Value> {
        context.check_cancelled()?;
        let policy = target.compute.cache_policy(&target.path);
        let fingerprint = self.hash_process(graph, target, context, policy)?;
        if policy == CachePolicy::Uncached {
            return self.compute_process(graph, target, context, None);
        }

        let key = ValueKey { serial: target.plug.serial, fingerprint };
        loop {
            if let Some(value) = self.values.get(&key) {
                trace!(plug = ?target.plug, "value cache hit");
                #[cfg(feature = "testing")]
                crate::testing::register_hit();
                self.validate(graph, target, context, &value)?;
                return Ok(value);
            }

            let cancelled = || context.canceller().is_some_and(|c| c.is_cancelled());
            match self.in_flight.claim(key, cancelled) {
                Claim::Owner(ownership) => {
                    let result = match self.values.peek(&key) {
                        Some(value) => Ok(value),
                        None => self.compute_process(graph, target, context, Some(key)),
                    };
                    ownership.complete(result.clone());
                    #[cfg(feature = "testing")]
                    crate::testing::register_miss();
                    return result;
                }
                Claim::Shared(Err(Error::Cancelled)) => {
                    // The owner was cancelled. Unless we are too, compute it
                    // ourselves.
                    context.check_cancelled()?;
                }
                Claim::Shared(result) => {
                    #[cfg(feature = "testing")]
                    crate::testing::register_hit();
                    return result;
                }
                Claim::Redundant => {
                    warn!(
                        plug = %graph.full_name(target.plug),
                        "waiting for an in-flight compute would deadlock, computing redundantly"
                    );
                    return self.compute_process(graph, target, context, Some(key));
                }
            }
        }
    }

    /// Run a node's compute and cache the result under `key`.
    fn compute_process(
        &self,
        graph: &Graph,
        target: &Target,
        context: &Context,
        key: Option<ValueKey>,
    ) -> Result<Value> {
        context.check_cancelled()?;
        let _nested = key.map(Nested::enter);
        let cx = ProcessContext::new(graph, target.plug, context);
        let result = self.observe(ProcessKind::Compute, target, context, || {
            let value = target.compute.compute(&target.path, &cx)?;
            value.convert(target.value_type).ok_or_else(|| Error::TypeMismatch {
                plug: graph.full_name(target.plug),
                input: "computed value".into(),
                expected: target.value_type,
                found: value.value_type(),
            })
        });

        let value = result.map_err(|e| self.wrap(graph, ProcessKind::Compute, target, context, e))?;
        if let Some(key) = key {
            let cost = value.memory_usage() + ENTRY_OVERHEAD;
            self.values.insert(key, value.clone(), cost);
        }
        Ok(value)
    }

    /// Run `f` with `context` current, reporting it to the attached monitors.
    fn observe<T>(
        &self,
        kind: ProcessKind,
        target: &Target,
        context: &Context,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _scope = context.scope();
        let monitors = self.monitors();
        if monitors.is_empty() {
            return f();
        }

        let process = Process {
            kind,
            plug: target.plug,
            node: target.node,
            node_type: target.compute.type_name(),
            context,
            thread: thread::current().id(),
        };
        for monitor in monitors.iter() {
            monitor.process_started(&process);
        }
        let start = Instant::now();
        let result = f();
        let duration = start.elapsed();
        for monitor in monitors.iter() {
            monitor.process_finished(&process, duration);
        }
        result
    }

    /// Attach the failing process to an error on its way out.
    fn wrap(
        &self,
        graph: &Graph,
        kind: ProcessKind,
        target: &Target,
        context: &Context,
        error: Error,
    ) -> Error {
        let frame = || Frame {
            kind,
            plug: graph.full_name(target.plug),
            node: target.compute.type_name().to_string(),
            context: context.to_string(),
        };
        match error {
            Error::Cancelled => Error::Cancelled,
            Error::ComputeFailure(inner) => Error::ComputeFailure(inner.push(frame())),
            error => Error::ComputeFailure(ProcessError::new(frame(), error)),
        }
    }

    /// Occasionally recompute a cached value and compare.
    fn validate(
        &self,
        graph: &Graph,
        target: &Target,
        context: &Context,
        cached: &Value,
    ) -> Result<()> {
        let HashValidation::Sample(n) = self.config.hash_validation else {
            return Ok(());
        };
        if n == 0 || self.validations.fetch_add(1, Ordering::Relaxed) % n != 0 {
            return Ok(());
        }

        let fresh = self.compute_process(graph, target, context, None)?;
        if fresh == *cached {
            return Ok(());
        }

        let plug = graph.full_name(target.plug);
        error!(%plug, %cached, %fresh, "cached value differs from a fresh compute");
        let cause = Error::msg(format!(
            "hash of \"{plug}\" does not cover everything its compute reads \
             (cached {cached}, computed {fresh})"
        ));
        Err(self.wrap(graph, ProcessKind::Compute, target, context, cause))
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("values", &self.values.statistics())
            .field("hashes", &self.hashes.statistics())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Detaches a monitor when dropped. Created by [`Engine::attach`].
#[must_use = "the monitor is detached when the scope is dropped"]
pub struct MonitorScope {
    engine: Arc<Engine>,
    monitor: Arc<dyn Monitor>,
}

impl Drop for MonitorScope {
    fn drop(&mut self) {
        self.engine.detach(&*self.monitor);
    }
}

/// What a node's `hash` or `compute` can see: the plug being processed, the
/// context, and the rest of the graph.
///
/// Reading an input from here goes through the same caches and
/// deduplication as a top-level request.
pub struct ProcessContext<'a> {
    graph: &'a Graph,
    plug: PlugId,
    context: &'a Context,
}

/// The view handed to [`Compute::hash`](crate::Compute::hash).
pub type HashContext<'a> = ProcessContext<'a>;

/// The view handed to [`Compute::compute`](crate::Compute::compute).
pub type ComputeContext<'a> = ProcessContext<'a>;

impl<'a> ProcessContext<'a> {
    fn new(graph: &'a Graph, plug: PlugId, context: &'a Context) -> Self {
        Self { graph, plug, context }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    /// The context the plug is processed in.
    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// The plug being processed.
    pub fn plug(&self) -> PlugId {
        self.plug
    }

    /// The node owning the plug being processed.
    pub fn node(&self) -> Result<NodeId> {
        self.graph.node_of(self.plug)
    }

    /// A plug of the same node, by relative path.
    pub fn input(&self, path: &str) -> Result<PlugId> {
        self.graph.plug(self.node()?, path)
    }

    /// The value of a plug of the same node, in the current context.
    pub fn value(&self, path: &str) -> Result<Value> {
        self.graph.value(self.input(path)?, self.context)
    }

    /// The value of a plug of the same node, in another context.
    pub fn value_in(&self, path: &str, context: &Context) -> Result<Value> {
        self.graph.value(self.input(path)?, context)
    }

    /// The fingerprint of a plug of the same node, in the current context.
    pub fn hash(&self, path: &str) -> Result<Fingerprint> {
        self.graph.hash(self.input(path)?, self.context)
    }

    /// The fingerprint of a plug of the same node, in another context.
    pub fn hash_in(&self, path: &str, context: &Context) -> Result<Fingerprint> {
        self.graph.hash(self.input(path)?, context)
    }

    /// Fails with [`Error::Cancelled`] if evaluation was cancelled. Long
    /// computes should call this periodically.
    pub fn check_cancelled(&self) -> Result<()> {
        self.context.check_cancelled()
    }

    /// Evaluate several plugs in parallel, each in its own context.
    pub fn parallel_values(&self, requests: &[(PlugId, Context)]) -> Result<Vec<Value>> {
        self.parallel_map(requests, |(plug, context)| self.graph.value(*plug, context))
    }

    /// Hash several plugs in parallel, each in its own context.
    pub fn parallel_hashes(&self, requests: &[(PlugId, Context)]) -> Result<Vec<Fingerprint>> {
        self.parallel_map(requests, |(plug, context)| self.graph.hash(*plug, context))
    }

    /// Map `f` over `items` on the thread pool.
    ///
    /// Tasks inherit the current context and the chain of computations they
    /// are nested in, so that waiting on an in-flight computation from a
    /// task never deadlocks against the task's own parent. The first error
    /// is returned.
    pub fn parallel_map<T, R, F>(&self, items: &[T], f: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
    {
        self.check_cancelled()?;
        let ancestors = process::ancestors();
        items
            .par_iter()
            .map(|item| {
                process::with_ancestors(&ancestors, || {
                    let _scope = self.context.scope();
                    self.check_cancelled()?;
                    f(item)
                })
            })
            .collect()
    }
}

impl Debug for ProcessContext<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("plug", &self.plug)
            .field("context", self.context)
            .finish()
    }
}
