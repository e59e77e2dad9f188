use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::{Arc, LazyLock};

use rustc_hash::FxHashMap;

use crate::cancel::Canceller;
use crate::error::{Error, Result};
use crate::hash::{Fingerprint, hash, mix};
use crate::value::Value;

/// The name of the frame variable.
pub const FRAME: &str = "frame";

/// The name of the frame rate variable.
pub const FRAMES_PER_SECOND: &str = "framesPerSecond";

/// Variables with this prefix never influence computation and are left out
/// of the context's fingerprint.
const UI_PREFIX: &str = "ui:";

/// Overlays deeper than this are flattened into a new base layer.
const MAX_DEPTH: usize = 8;

/// Maximum nesting of string variables referring to other variables.
const MAX_SUBSTITUTION_DEPTH: usize = 8;

thread_local! {
    /// The context scoped on this thread by [`Context::scope`].
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// A snapshot of the process environment, taken once so that substitutions
/// stay deterministic for the lifetime of the process.
static ENVIRONMENT: LazyLock<FxHashMap<String, String>> =
    LazyLock::new(|| std::env::vars().collect());

/// A set of named values that parameterizes an evaluation.
///
/// Contexts are copy-on-write: [`set`](Self::set) pushes a small overlay on
/// top of structurally shared layers, so deriving a child context never
/// mutates or copies its parent. Two contexts compare equal when their
/// effective variables are equal, regardless of how they were derived.
#[derive(Clone)]
pub struct Context {
    head: Arc<Layer>,
    /// Number of overlays above the base layer.
    depth: usize,
    /// Number of effective variables.
    len: usize,
    /// Commutative sum of the mixed hashes of all computational variables.
    sum: u128,
    /// Number of computational variables.
    computational: usize,
    canceller: Option<Canceller>,
}

enum Layer {
    /// Sorted by name.
    Base(Arc<[(Arc<str>, Value)]>),
    /// A single assignment (or removal, if `value` is `None`).
    Overlay { parent: Arc<Layer>, name: Arc<str>, value: Option<Value> },
}

impl Context {
    /// Create a context holding the default frame (1) and frame rate (24).
    pub fn new() -> Self {
        let mut context = Self::empty();
        context.set(FRAME, 1.0);
        context.set(FRAMES_PER_SECOND, 24.0);
        context
    }

    /// Create a context without any variables.
    pub fn empty() -> Self {
        Self {
            head: Arc::new(Layer::Base(Arc::from([]))),
            depth: 0,
            len: 0,
            sum: 0,
            computational: 0,
            canceller: None,
        }
    }

    /// The value of a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let mut layer = &*self.head;
        loop {
            match layer {
                Layer::Overlay { parent, name: n, value } => {
                    if &**n == name {
                        return value.as_ref();
                    }
                    layer = parent;
                }
                Layer::Base(entries) => {
                    return entries
                        .binary_search_by(|(n, _)| (**n).cmp(name))
                        .ok()
                        .map(|i| &entries[i].1);
                }
            }
        }
    }

    /// The value of a variable, or `default` if it isn't set.
    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.get(name).cloned().unwrap_or(default)
    }

    /// Whether a variable is set.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a variable, overriding any previous value.
    pub fn set(&mut self, name: impl Into<Arc<str>>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.get(&name) {
            Some(old) if *old == value => return,
            Some(old) => {
                let old = entry_hash(&name, old);
                if is_computational(&name) {
                    self.sum = self.sum.wrapping_sub(old);
                }
            }
            None => {
                self.len += 1;
                if is_computational(&name) {
                    self.computational += 1;
                }
            }
        }
        if is_computational(&name) {
            self.sum = self.sum.wrapping_add(entry_hash(&name, &value));
        }
        self.push(name, Some(value));
    }

    /// Derive a new context with one variable set.
    pub fn with(&self, name: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        let mut context = self.clone();
        context.set(name, value);
        context
    }

    /// Remove a variable, if it is set.
    pub fn remove(&mut self, name: &str) {
        let Some(old) = self.get(name) else { return };
        if is_computational(name) {
            self.sum = self.sum.wrapping_sub(entry_hash(name, old));
            self.computational -= 1;
        }
        self.len -= 1;
        self.push(name.into(), None);
    }

    /// Remove all variables matching any of the space-separated glob patterns.
    pub fn remove_matching(&mut self, patterns: &str) {
        if patterns.trim().is_empty() {
            return;
        }
        let names: Vec<Arc<str>> = self
            .names()
            .into_iter()
            .filter(|name| patterns.split_whitespace().any(|p| glob(p, name)))
            .collect();
        for name in names {
            self.remove(&name);
        }
    }

    /// The names of all variables, sorted.
    pub fn names(&self) -> Vec<Arc<str>> {
        self.entries().into_keys().collect()
    }

    /// All variables, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (Arc<str>, Value)> {
        self.entries().into_iter()
    }

    /// The number of variables.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no variables are set.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A fingerprint of all computationally relevant variables.
    ///
    /// Variables prefixed with `ui:` are ignored.
    pub fn fingerprint(&self) -> Fingerprint {
        hash(&(self.sum, self.computational))
    }

    pub fn frame(&self) -> f64 {
        self.get(FRAME).and_then(Value::as_float).unwrap_or(0.0)
    }

    pub fn set_frame(&mut self, frame: f64) {
        self.set(FRAME, frame);
    }

    pub fn frames_per_second(&self) -> f64 {
        self.get(FRAMES_PER_SECOND).and_then(Value::as_float).unwrap_or(24.0)
    }

    pub fn set_frames_per_second(&mut self, fps: f64) {
        self.set(FRAMES_PER_SECOND, fps);
    }

    /// The current time in seconds.
    pub fn time(&self) -> f64 {
        self.frame() / self.frames_per_second()
    }

    /// Set the frame from a time in seconds.
    pub fn set_time(&mut self, seconds: f64) {
        let frame = seconds * self.frames_per_second();
        self.set_frame(frame);
    }

    /// The cancellation token attached to this context.
    pub fn canceller(&self) -> Option<&Canceller> {
        self.canceller.as_ref()
    }

    /// Derive a context that carries a cancellation token.
    ///
    /// A context can only ever carry one token; replacing an existing one is
    /// refused.
    pub fn with_canceller(&self, canceller: Canceller) -> Result<Self> {
        match &self.canceller {
            Some(existing) if !existing.same(&canceller) => Err(Error::Immutable {
                plug: "context".into(),
                reason: "an existing canceller cannot be replaced",
            }),
            _ => Ok(Self { canceller: Some(canceller), ..self.clone() }),
        }
    }

    /// Fails with [`Error::Cancelled`] if the attached token was cancelled.
    #[inline]
    pub fn check_cancelled(&self) -> Result<()> {
        match &self.canceller {
            Some(canceller) => canceller.check(),
            None => Ok(()),
        }
    }

    /// Make this context the thread's current context until the returned
    /// guard is dropped.
    pub fn scope(&self) -> ContextScope {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        ContextScope { previous, _marker: PhantomData }
    }

    /// The context scoped on this thread, or a default context if none is.
    pub fn current() -> Context {
        CURRENT.with(|current| current.borrow().clone()).unwrap_or_default()
    }

    /// Whether a context is currently scoped on this thread.
    pub fn has_current() -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }

    fn push(&mut self, name: Arc<str>, value: Option<Value>) {
        self.head = Arc::new(Layer::Overlay { parent: self.head.clone(), name, value });
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.flatten();
        }
    }

    fn flatten(&mut self) {
        let entries: Vec<(Arc<str>, Value)> = self.entries().into_iter().collect();
        self.head = Arc::new(Layer::Base(entries.into()));
        self.depth = 0;
    }

    fn entries(&self) -> BTreeMap<Arc<str>, Value> {
        let mut overrides: BTreeMap<Arc<str>, Option<Value>> = BTreeMap::new();
        let mut layer = &*self.head;
        loop {
            match layer {
                Layer::Overlay { parent, name, value } => {
                    overrides.entry(name.clone()).or_insert_with(|| value.clone());
                    layer = parent;
                }
                Layer::Base(entries) => {
                    for (name, value) in entries.iter() {
                        overrides.entry(name.clone()).or_insert_with(|| Some(value.clone()));
                    }
                    break;
                }
            }
        }
        overrides.into_iter().filter_map(|(k, v)| Some((k, v?))).collect()
    }
}

impl Context {
    /// Replace variable references, frame markers, a leading tilde and
    /// escapes in `text`.
    ///
    /// - `$name` or `${name}` is replaced with the variable's value, or with
    ///   the environment variable of that name. String values are
    ///   substituted recursively.
    /// - A run of `#` is replaced with the frame, zero-padded to the run's
    ///   length.
    /// - A leading `~` is replaced with the home directory.
    /// - `\` escapes the following character.
    pub fn substitute(&self, text: &str, substitutions: Substitutions) -> Result<String> {
        let mut result = String::with_capacity(text.len());
        self.substitute_into(text, &mut result, 0, substitutions)?;
        Ok(result)
    }

    /// Whether `text` contains any character that [`substitute`](Self::substitute)
    /// would act on.
    pub fn has_substitutions(text: &str) -> bool {
        text.contains(['$', '#', '~', '\\'])
    }

    fn substitute_into(
        &self,
        text: &str,
        result: &mut String,
        depth: usize,
        substitutions: Substitutions,
    ) -> Result<()> {
        if depth > MAX_SUBSTITUTION_DEPTH {
            return Err(Error::Substitution { text: text.into() });
        }

        let mut chars = text.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' if substitutions.contains(Substitutions::ESCAPES) => {
                    if let Some((_, next)) = chars.next() {
                        result.push(next);
                    }
                }
                '$' if substitutions.contains(Substitutions::VARIABLES) => {
                    let start = i + 1;
                    let (name, end) = if text[start..].starts_with('{') {
                        let inner = start + 1;
                        let close = text[inner..].find('}').map_or(text.len(), |n| inner + n);
                        (&text[inner..close], (close + 1).min(text.len()))
                    } else {
                        let len = text[start..]
                            .find(|c: char| !c.is_ascii_alphanumeric())
                            .unwrap_or(text.len() - start);
                        (&text[start..start + len], start + len)
                    };
                    while chars.peek().is_some_and(|&(j, _)| j < end) {
                        chars.next();
                    }
                    self.substitute_variable(name, result, depth, substitutions)?;
                }
                '#' if substitutions.contains(Substitutions::FRAME) => {
                    let mut padding = 1;
                    while chars.next_if(|&(_, c)| c == '#').is_some() {
                        padding += 1;
                    }
                    let frame = self.frame().round() as i64;
                    result.push_str(&format!("{frame:0padding$}"));
                }
                '~' if substitutions.contains(Substitutions::TILDE) && result.is_empty() => {
                    if let Some(home) = ENVIRONMENT.get("HOME") {
                        result.push_str(home);
                    }
                }
                c => result.push(c),
            }
        }

        Ok(())
    }

    fn substitute_variable(
        &self,
        name: &str,
        result: &mut String,
        depth: usize,
        substitutions: Substitutions,
    ) -> Result<()> {
        match self.get(name) {
            Some(Value::String(s)) => {
                self.substitute_into(s, result, depth + 1, substitutions)?;
            }
            Some(Value::StringVector(path)) => {
                if path.is_empty() {
                    result.push('/');
                }
                for part in path.iter() {
                    result.push('/');
                    result.push_str(part);
                }
            }
            Some(v @ (Value::Bool(_) | Value::Int(_) | Value::Float(_))) => {
                result.push_str(&v.to_string());
            }
            Some(_) => {}
            None => {
                if let Some(v) = ENVIRONMENT.get(name) {
                    result.push_str(v);
                }
            }
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len
            && self.sum == other.sum
            && self.computational == other.computational
            && self.entries() == other.entries()
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u128(self.fingerprint().as_u128());
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Restores the previously current context when dropped.
///
/// Created by [`Context::scope`]. Not `Send`: a scope belongs to the thread
/// that created it.
#[must_use = "the context is only current while the scope is alive"]
pub struct ContextScope {
    previous: Option<Context>,
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Selects which kinds of substitution [`Context::substitute`] performs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Substitutions(u8);

impl Substitutions {
    pub const NONE: Self = Self(0);
    pub const VARIABLES: Self = Self(1);
    pub const FRAME: Self = Self(2);
    pub const TILDE: Self = Self(4);
    pub const ESCAPES: Self = Self(8);
    pub const ALL: Self = Self(15);

    /// Whether all kinds in `other` are enabled.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The substitutions that would act on `text`.
    pub fn of(text: &str) -> Self {
        let mut result = Self::NONE;
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            result = result
                | match c {
                    '$' => Self::VARIABLES,
                    '#' => Self::FRAME,
                    '~' => Self::TILDE,
                    '\\' => {
                        chars.next();
                        Self::ESCAPES
                    }
                    _ => Self::NONE,
                };
            if result == Self::ALL {
                break;
            }
        }
        result
    }
}

impl BitOr for Substitutions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for Substitutions {
    fn default() -> Self {
        Self::ALL
    }
}

fn is_computational(name: &str) -> bool {
    !name.starts_with(UI_PREFIX)
}

fn entry_hash(name: &str, value: &Value) -> u128 {
    mix(hash(&(name, value)).as_u128())
}

/// Matches `*` (any run) and `?` (any single character).
fn glob(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack = None;
    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((bp, bn)) => {
                    p = bp + 1;
                    n = bn + 1;
                    backtrack = Some((bp, bn + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn test_defaults() {
        let context = Context::new();
        assert_eq!(context.frame(), 1.0);
        assert_eq!(context.frames_per_second(), 24.0);
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn test_time() {
        let mut context = Context::new();
        context.set_time(2.0);
        assert_eq!(context.frame(), 48.0);
        context.set_frames_per_second(25.0);
        assert_eq!(context.time(), 48.0 / 25.0);
        context.set_time(1.0);
        assert_eq!(context.frame(), 25.0);
    }

    #[test]
    fn test_overlay_does_not_mutate_parent() {
        let parent = Context::new();
        let child = parent.with("scene:path", "/a/b");
        assert!(parent.get("scene:path").is_none());
        assert_eq!(child.get("scene:path").and_then(Value::as_str), Some("/a/b"));
        assert_ne!(parent, child);
    }

    #[test]
    fn test_equal_regardless_of_derivation() {
        let mut a = Context::empty();
        a.set("x", 1);
        a.set("y", 2);
        let mut b = Context::empty();
        b.set("y", 5);
        b.set("x", 1);
        b.set("y", 2);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[quickcheck]
    fn prop_equal_regardless_of_order(assignments: Vec<(u8, i64)>) -> bool {
        let mut forward = Context::empty();
        let mut last = BTreeMap::new();
        for &(name, value) in &assignments {
            forward.set(format!("v{}", name % 8), value);
            last.insert(name % 8, value);
        }
        let mut backward = Context::empty();
        for (name, value) in last.into_iter().rev() {
            backward.set(format!("v{name}"), value);
        }
        forward == backward && forward.fingerprint() == backward.fingerprint()
    }

    #[test]
    fn test_remove() {
        let mut context = Context::new();
        let before = context.fingerprint();
        context.set("a", 1);
        context.remove("a");
        assert_eq!(context.fingerprint(), before);
        assert_eq!(context, Context::new());
    }

    #[test]
    fn test_deep_overlays_flatten() {
        let mut context = Context::empty();
        for i in 0..50 {
            context.set(format!("v{}", i % 7), i);
        }
        assert_eq!(context.len(), 7);
        assert_eq!(context.get("v0").and_then(Value::as_int), Some(49));
        assert!(context.depth <= MAX_DEPTH);
    }

    #[test]
    fn test_ui_variables_not_hashed() {
        let a = Context::new();
        let b = a.with("ui:selection", "x");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, b);
    }

    #[test]
    fn test_remove_matching() {
        let mut context = Context::empty();
        context.set("scene:path", "/");
        context.set("scene:filter", "x");
        context.set("image:channel", "R");
        context.remove_matching("scene:* other");
        assert_eq!(context.names(), vec![Arc::<str>::from("image:channel")]);
    }

    #[test]
    fn test_substitute() {
        let mut context = Context::new();
        context.set_frame(20.0);
        context.set("name", "shot");
        context.set("nested", "${name}_v1");
        context.set("path", Value::from(vec!["a", "b"]));
        let s = |t: &str| context.substitute(t, Substitutions::ALL).unwrap();
        assert_eq!(s("$name.####.exr"), "shot.0020.exr");
        assert_eq!(s("${nested}/#"), "shot_v1/20");
        assert_eq!(s("$path"), "/a/b");
        assert_eq!(s("\\$name"), "$name");
        assert_eq!(
            context.substitute("$name.#", Substitutions::VARIABLES).unwrap(),
            "shot.#"
        );
    }

    #[test]
    fn test_substitute_recursion_limit() {
        let context = Context::new().with("loop", "$loop");
        assert!(matches!(
            context.substitute("$loop", Substitutions::ALL),
            Err(Error::Substitution { .. })
        ));
    }

    #[test]
    fn test_substitutions_of() {
        assert_eq!(Substitutions::of("plain"), Substitutions::NONE);
        assert_eq!(
            Substitutions::of("$a.#"),
            Substitutions::VARIABLES | Substitutions::FRAME
        );
        assert!(Context::has_substitutions("~/x"));
    }

    #[test]
    fn test_scope_restores_on_panic() {
        let outer = Context::new().with("level", "outer");
        let _outer = outer.scope();
        let result = std::panic::catch_unwind(|| {
            let inner = Context::new().with("level", "inner");
            let _inner = inner.scope();
            assert_eq!(Context::current(), inner);
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(Context::current(), outer);
    }

    #[test]
    fn test_glob() {
        assert!(glob("a*", "abc"));
        assert!(glob("*c", "abc"));
        assert!(glob("a?c", "abc"));
        assert!(!glob("a?d", "abc"));
        assert!(glob("*", ""));
    }
}
