use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// A cooperative cancellation token.
///
/// Attach one to a [`Context`](crate::Context) with
/// [`with_canceller`](crate::Context::with_canceller). The runtime checks it
/// before every process, and long-running computes should poll
/// [`check`](Self::check) themselves.
#[derive(Clone, Default)]
pub struct Canceller(Arc<AtomicBool>);

impl Canceller {
    /// Create a token that is not cancelled yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Cannot be undone.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with [`Error::Cancelled`] if cancellation has been requested.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }

    /// Whether two handles refer to the same token.
    pub fn same(&self, other: &Canceller) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Canceller {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("Canceller").field(&self.is_cancelled()).finish()
    }
}
