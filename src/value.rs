use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::sync::Arc;

/// The declared type of a plug.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    IntVector,
    FloatVector,
    StringVector,
    /// A plug that holds no value itself, only child plugs.
    Compound,
}

impl ValueType {
    /// Whether values of this type are numbers.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Bool | Self::Int | Self::Float)
    }

    /// Whether a plug of this type may take its value from a plug of type
    /// `source`.
    ///
    /// Numeric types convert into each other. Compound compatibility also
    /// depends on the children and is checked by the graph.
    pub fn accepts(self, source: ValueType) -> bool {
        self == source || (self.is_numeric() && source.is_numeric())
    }

    /// The value a freshly created plug of this type holds.
    pub fn default_value(self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int => Value::Int(0),
            Self::Float => Value::Float(0.0),
            Self::String => Value::String("".into()),
            Self::IntVector => Value::IntVector(Arc::from([])),
            Self::FloatVector => Value::FloatVector(Arc::from([])),
            Self::StringVector => Value::StringVector(Arc::from([])),
            Self::Compound => Value::Compound(Arc::from([])),
        }
    }

    /// A short, stable name used in fingerprints and messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::IntVector => "int[]",
            Self::FloatVector => "float[]",
            Self::StringVector => "string[]",
            Self::Compound => "compound",
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(self.name())
    }
}

/// An immutable plug or context value.
///
/// Cloning is cheap: strings and vectors are reference counted, so cached
/// values are shared between readers without copying.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    IntVector(Arc<[i64]>),
    FloatVector(Arc<[f64]>),
    StringVector(Arc<[Arc<str>]>),
    Compound(Arc<[Value]>),
}

impl Value {
    /// The type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
            Self::IntVector(_) => ValueType::IntVector,
            Self::FloatVector(_) => ValueType::FloatVector,
            Self::StringVector(_) => ValueType::StringVector,
            Self::Compound(_) => ValueType::Compound,
        }
    }

    /// Convert into another type, if the types are compatible.
    pub fn convert(&self, to: ValueType) -> Option<Value> {
        if self.value_type() == to {
            return Some(self.clone());
        }
        match (self, to) {
            (Self::Bool(v), ValueType::Int) => Some(Self::Int(i64::from(*v))),
            (Self::Bool(v), ValueType::Float) => Some(Self::Float(f64::from(u8::from(*v)))),
            (Self::Int(v), ValueType::Bool) => Some(Self::Bool(*v != 0)),
            (Self::Int(v), ValueType::Float) => Some(Self::Float(*v as f64)),
            (Self::Float(v), ValueType::Bool) => Some(Self::Bool(*v != 0.0)),
            (Self::Float(v), ValueType::Int) => Some(Self::Int(*v as i64)),
            _ => None,
        }
    }

    /// Approximate heap and inline size in bytes, used as the cache cost.
    pub fn memory_usage(&self) -> usize {
        size_of::<Self>()
            + match self {
                Self::Bool(_) | Self::Int(_) | Self::Float(_) => 0,
                Self::String(s) => s.len(),
                Self::IntVector(v) => v.len() * size_of::<i64>(),
                Self::FloatVector(v) => v.len() * size_of::<f64>(),
                Self::StringVector(v) => v
                    .iter()
                    .map(|s| s.len() + size_of::<Arc<str>>())
                    .sum(),
                Self::Compound(v) => v.iter().map(Value::memory_usage).sum(),
            }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.convert(ValueType::Bool)? {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.convert(ValueType::Int)? {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.convert(ValueType::Float)? {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_vector(&self) -> Option<&[Arc<str>]> {
        match self {
            Self::StringVector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_compound(&self) -> Option<&[Value]> {
        match self {
            Self::Compound(v) => Some(v),
            _ => None,
        }
    }
}

// Floats compare and hash by bit pattern so that `Eq` and `Hash` agree.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::IntVector(a), Self::IntVector(b)) => a == b,
            (Self::FloatVector(a), Self::FloatVector(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::StringVector(a), Self::StringVector(b)) => a == b,
            (Self::Compound(a), Self::Compound(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value_type().hash(state);
        match self {
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::String(v) => v.hash(state),
            Self::IntVector(v) => v.hash(state),
            Self::FloatVector(v) => {
                v.len().hash(state);
                v.iter().for_each(|x| x.to_bits().hash(state));
            }
            Self::StringVector(v) => v.hash(state),
            Self::Compound(v) => v.hash(state),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "Bool({v})"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Float(v) => write!(f, "Float({v})"),
            Self::String(v) => write!(f, "String({v:?})"),
            Self::IntVector(v) => f.debug_tuple("IntVector").field(v).finish(),
            Self::FloatVector(v) => f.debug_tuple("FloatVector").field(v).finish(),
            Self::StringVector(v) => f.debug_tuple("StringVector").field(v).finish(),
            Self::Compound(v) => f.debug_tuple("Compound").field(v).finish(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        fn list<T: Display>(f: &mut Formatter, items: &[T]) -> fmt::Result {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            f.write_str("]")
        }

        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::IntVector(v) => list(f, v),
            Self::FloatVector(v) => list(f, v),
            Self::StringVector(v) => list(f, v),
            Self::Compound(v) => list(f, v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v.into())
    }
}

impl From<Arc<str>> for Value {
    fn from(v: Arc<str>) -> Self {
        Self::String(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntVector(v.into())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatVector(v.into())
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Self::StringVector(v.into_iter().map(Arc::from).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Compound(v.into())
    }
}
