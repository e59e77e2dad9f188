use std::fmt::{self, Debug, Formatter};
use std::ops::{BitOr, Sub};
use std::sync::Arc;

use crate::graph::NodeId;
use crate::value::{Value, ValueType};

/// Identifies a plug in a [`Graph`](crate::Graph).
///
/// Ids are never reused: once a plug is removed, its id stays invalid even
/// if a new plug takes its slot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PlugId {
    pub(crate) key: usize,
    pub(crate) serial: u64,
}

impl PlugId {
    /// The globally unique serial number of this plug.
    pub fn serial(self) -> u64 {
        self.serial
    }
}

impl Debug for PlugId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "PlugId({}#{})", self.key, self.serial)
    }
}

/// Whether a plug receives or provides values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// Behavioural flags of a plug.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PlugFlags(u32);

impl PlugFlags {
    pub const NONE: Self = Self(0);
    /// The plug may be connected to a source.
    pub const ACCEPTS_INPUTS: Self = Self(1);
    /// The plug's value is part of the saved graph.
    pub const SERIALISABLE: Self = Self(2);
    /// Neither the value nor the connection may change.
    pub const READ_ONLY: Self = Self(4);
    /// The plug was added by the user rather than by the node itself.
    pub const DYNAMIC: Self = Self(8);
    pub const DEFAULT: Self = Self(1 | 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for PlugFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for PlugFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Sub for PlugFlags {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl Debug for PlugFlags {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let names = [
            (Self::ACCEPTS_INPUTS, "ACCEPTS_INPUTS"),
            (Self::SERIALISABLE, "SERIALISABLE"),
            (Self::READ_ONLY, "READ_ONLY"),
            (Self::DYNAMIC, "DYNAMIC"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Describes a plug to create.
///
/// ```
/// # use plexus::{PlugSpec, ValueType};
/// let spec = PlugSpec::input("speed", ValueType::Float).default(1.0);
/// ```
#[derive(Debug, Clone)]
pub struct PlugSpec {
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) value_type: ValueType,
    pub(crate) default: Value,
    pub(crate) flags: PlugFlags,
    pub(crate) children: Vec<PlugSpec>,
}

impl PlugSpec {
    pub fn new(name: impl Into<String>, direction: Direction, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            direction,
            value_type,
            default: value_type.default_value(),
            flags: PlugFlags::DEFAULT,
            children: Vec::new(),
        }
    }

    pub fn input(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, Direction::In, value_type)
    }

    pub fn output(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, Direction::Out, value_type)
    }

    /// A compound plug with the given children. The children take the
    /// compound's direction.
    pub fn compound(
        name: impl Into<String>,
        direction: Direction,
        children: impl IntoIterator<Item = PlugSpec>,
    ) -> Self {
        let mut spec = Self::new(name, direction, ValueType::Compound);
        spec.children = children
            .into_iter()
            .map(|child| child.into_direction(direction))
            .collect();
        spec
    }

    /// Set the default value, which is also the initial value.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn flags(mut self, flags: PlugFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn mark_dynamic(mut self) -> Self {
        self.flags = self.flags | PlugFlags::DYNAMIC;
        self
    }

    pub(crate) fn into_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self.children = self
            .children
            .into_iter()
            .map(|child| child.into_direction(direction))
            .collect();
        self
    }
}

/// Stored state of a plug.
pub(crate) struct PlugData {
    pub serial: u64,
    pub name: Arc<str>,
    /// Dot-separated path relative to the owning node.
    pub path: Arc<str>,
    pub direction: Direction,
    pub node: NodeId,
    pub parent: Option<PlugId>,
    pub children: Vec<PlugId>,
    pub value_type: ValueType,
    pub default: Value,
    pub value: Value,
    pub flags: PlugFlags,
    pub input: Option<PlugId>,
    pub outputs: Vec<PlugId>,
    /// Bumped whenever the plug is dirtied. Part of the fingerprint cache
    /// key.
    pub dirty: u64,
}
