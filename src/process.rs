use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::hash::{Fingerprint, mix};
use crate::passthroughhasher::PassthroughHashMap;
use crate::value::Value;

/// How often a blocked waiter wakes up to check its own cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The two phases of evaluating a computed plug.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ProcessKind {
    Hash,
    Compute,
}

impl Display for ProcessKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Hash => "hash",
            Self::Compute => "compute",
        })
    }
}

/// Identifies one cached value: a plug and the fingerprint of its inputs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ValueKey {
    pub serial: u64,
    pub fingerprint: Fingerprint,
}

impl Hash for ValueKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u128(self.fingerprint.as_u128() ^ mix(u128::from(self.serial)));
    }
}

/// Identifies one cached fingerprint: a plug, how often it was dirtied and
/// the context it was hashed in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct HashKey {
    pub serial: u64,
    pub dirty: u64,
    pub context: Fingerprint,
}

impl Hash for HashKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let plug = (u128::from(self.serial) << 64) | u128::from(self.dirty);
        state.write_u128(self.context.as_u128() ^ mix(plug));
    }
}

thread_local! {
    /// Keys of the computations the current task is nested in, including
    /// those of the task that spawned it onto this thread.
    static ANCESTORS: RefCell<Vec<ValueKey>> = const { RefCell::new(Vec::new()) };
}

/// A snapshot of the current task's ancestry, to hand to spawned tasks.
pub(crate) fn ancestors() -> Vec<ValueKey> {
    ANCESTORS.with(|a| a.borrow().clone())
}

/// Run `f` as part of a task spawned from a process with the given ancestry.
pub(crate) fn with_ancestors<R>(ancestors: &[ValueKey], f: impl FnOnce() -> R) -> R {
    let saved = ANCESTORS.with(|a| a.replace(ancestors.to_vec()));
    let _restore = Restore(Some(saved));
    f()
}

struct Restore(Option<Vec<ValueKey>>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(saved) = self.0.take() {
            ANCESTORS.with(|a| *a.borrow_mut() = saved);
        }
    }
}

fn is_ancestor(key: &ValueKey) -> bool {
    ANCESTORS.with(|a| a.borrow().contains(key))
}

/// Marks the current task as nested in the computation of `key` until
/// dropped.
pub(crate) struct Nested(());

impl Nested {
    pub fn enter(key: ValueKey) -> Self {
        ANCESTORS.with(|a| a.borrow_mut().push(key));
        Self(())
    }
}

impl Drop for Nested {
    fn drop(&mut self) {
        ANCESTORS.with(|a| a.borrow_mut().pop());
    }
}

/// Table of computations currently running, so that concurrent requests for
/// the same key wait for one result instead of computing it again.
#[derive(Default)]
pub(crate) struct InFlight {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pending: PassthroughHashMap<ValueKey, Arc<Pending>>,
    /// Which key each blocked thread waits for.
    waiting: FxHashMap<ThreadId, ValueKey>,
}

struct Pending {
    owner: ThreadId,
    outcome: Mutex<Option<Result<Value>>>,
    done: Condvar,
}

/// The result of asking to compute a key.
pub(crate) enum Claim<'a> {
    /// Nobody else is computing the key; the caller must do it and publish
    /// the outcome.
    Owner(Ownership<'a>),
    /// Another thread computed the key while the caller waited.
    Shared(Result<Value>),
    /// Waiting would deadlock; the caller computes the key on its own.
    Redundant,
}

impl InFlight {
    /// Claim the computation of `key`, or wait for the thread that already
    /// claimed it.
    ///
    /// `cancelled` is polled while waiting; once it returns true the wait is
    /// abandoned with [`Error::Cancelled`].
    pub fn claim(&self, key: ValueKey, cancelled: impl Fn() -> bool) -> Claim<'_> {
        let me = thread::current().id();
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.get(&key).cloned() else {
                let pending = Arc::new(Pending {
                    owner: me,
                    outcome: Mutex::new(None),
                    done: Condvar::new(),
                });
                state.pending.insert(key, pending.clone());
                return Claim::Owner(Ownership { table: self, key, pending, finished: false });
            };
            if is_ancestor(&key) || state.waits_for(pending.owner, me) {
                return Claim::Redundant;
            }
            state.waiting.insert(me, key);
            pending
        };

        let outcome = pending.wait(cancelled);
        self.state.lock().waiting.remove(&me);
        Claim::Shared(outcome)
    }

    /// Number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl State {
    /// Whether `owner` is, directly or through a chain of other waiting
    /// threads, waiting for `thread`.
    fn waits_for(&self, mut owner: ThreadId, thread: ThreadId) -> bool {
        for _ in 0..=self.waiting.len() {
            if owner == thread {
                return true;
            }
            match self.waiting.get(&owner).and_then(|key| self.pending.get(key)) {
                Some(next) => owner = next.owner,
                None => return false,
            }
        }
        false
    }
}

impl Pending {
    fn wait(&self, cancelled: impl Fn() -> bool) -> Result<Value> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = &*outcome {
                return outcome.clone();
            }
            if cancelled() {
                return Err(Error::Cancelled);
            }
            self.done.wait_for(&mut outcome, POLL_INTERVAL);
        }
    }
}

/// The exclusive right to compute a key.
///
/// Dropping it without calling [`complete`](Self::complete), e.g. while
/// unwinding, releases waiters with [`Error::Cancelled`] so that they retry.
pub(crate) struct Ownership<'a> {
    table: &'a InFlight,
    key: ValueKey,
    pending: Arc<Pending>,
    finished: bool,
}

impl Ownership<'_> {
    #[cfg(test)]
    pub fn key(&self) -> ValueKey {
        self.key
    }

    /// Publish the outcome to all waiting threads.
    pub fn complete(mut self, outcome: Result<Value>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<Value>) {
        self.finished = true;
        {
            let mut state = self.table.state.lock();
            if state.pending.get(&self.key).is_some_and(|p| Arc::ptr_eq(p, &self.pending)) {
                state.pending.remove(&self.key);
            }
        }
        *self.pending.outcome.lock() = Some(outcome);
        self.pending.done.notify_all();
    }
}

impl Drop for Ownership<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Err(Error::Cancelled));
        }
    }
}
