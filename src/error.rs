use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::process::ProcessKind;
use crate::value::ValueType;

/// A specialized result type for graph edits and evaluation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while editing or evaluating a graph.
///
/// Connection and value errors are returned synchronously by the mutating
/// call and leave the graph unmodified. Failures inside a node's computation
/// surface as [`Error::ComputeFailure`] with the chain of processes that led
/// to them. Cancellation is reported separately as [`Error::Cancelled`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("plug \"{plug}\" ({expected}) cannot take its input from \"{input}\" ({found})")]
    TypeMismatch { plug: String, input: String, expected: ValueType, found: ValueType },

    #[error("connecting \"{input}\" to \"{plug}\" would create a cycle")]
    CycleDetected { plug: String, input: String },

    #[error("plug \"{plug}\" is not settable: {reason}")]
    Immutable { plug: String, reason: &'static str },

    #[error("plug \"{plug}\" rejects input \"{input}\"")]
    InputRejected { plug: String, input: String },

    #[error(transparent)]
    ComputeFailure(#[from] ProcessError),

    #[error("evaluation was cancelled")]
    Cancelled,

    #[error("the graph cannot be modified while {during}")]
    ReentrancyViolation { during: &'static str },

    #[error("plug does not exist: {0}")]
    InvalidPlug(String),

    #[error("node does not exist: {0}")]
    InvalidNode(String),

    #[error("\"{parent}\" already has a child named \"{name}\"")]
    DuplicateName { parent: String, name: String },

    #[error("substitution of {text:?} exceeded the maximum recursion depth")]
    Substitution { text: String },

    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error raised by a node implementation.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::other(Message(message.into()))
    }

    /// Whether this is [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug)]
struct Message(String);

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// One step in the chain of processes that led to a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether the failing step was hashing or computing.
    pub kind: ProcessKind,
    /// Full name of the plug being processed.
    pub plug: String,
    /// Type name of the node that owns the plug.
    pub node: String,
    /// Summary of the context the plug was processed in.
    pub context: String,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} of \"{}\" ({}) in context {}", self.kind, self.plug, self.node, self.context)
    }
}

/// A failure inside a node's `hash` or `compute`, with the full process
/// chain from the failing plug out to the originally requested one.
#[derive(Debug, Clone)]
pub struct ProcessError {
    frames: Vec<Frame>,
    cause: Arc<Error>,
}

impl ProcessError {
    pub(crate) fn new(frame: Frame, cause: Error) -> Self {
        Self { frames: vec![frame], cause: Arc::new(cause) }
    }

    /// Add an outer process to the chain.
    pub(crate) fn push(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    /// The processes involved, innermost (where the failure happened) first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The plug whose process failed first.
    pub fn plug(&self) -> &str {
        &self.frames[0].plug
    }

    /// The underlying error raised by the node.
    pub fn cause(&self) -> &Error {
        &self.cause
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        for frame in &self.frames {
            write!(f, "\n  during {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}
