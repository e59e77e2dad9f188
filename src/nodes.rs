//! A few general-purpose computing nodes.
//!
//! These cover arithmetic and the common ways a node rescopes the context
//! its inputs are evaluated in.

use std::sync::Arc;

use crate::context::Context;
use crate::engine::{ComputeContext, HashContext};
use crate::error::{Error, Result};
use crate::graph::{Compute, PlugSpec};
use crate::hash::Accumulator;
use crate::value::{Value, ValueType};

/// Outputs `in1 + in2 + constant` as `sum`.
#[derive(Debug, Default, Copy, Clone)]
pub struct Add {
    constant: f64,
}

impl Add {
    pub fn new(constant: f64) -> Self {
        Self { constant }
    }
}

impl Compute for Add {
    fn type_name(&self) -> &str {
        "Add"
    }

    fn plugs(&self) -> Vec<PlugSpec> {
        vec![
            PlugSpec::input("in1", ValueType::Float),
            PlugSpec::input("in2", ValueType::Float),
            PlugSpec::output("sum", ValueType::Float),
        ]
    }

    fn affects(&self, input: &str) -> Vec<&str> {
        match input {
            "in1" | "in2" => vec!["sum"],
            _ => vec![],
        }
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        h.append_fingerprint(cx.hash("in1")?)
            .append_fingerprint(cx.hash("in2")?)
            .append(&self.constant.to_bits());
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        let operand = |path: &str| {
            cx.value(path)?
                .as_float()
                .ok_or_else(|| Error::msg(format!("\"{path}\" is not numeric")))
        };
        Ok(Value::Float(operand("in1")? + operand("in2")? + self.constant))
    }
}

/// Outputs the frame of the context as `out`.
#[derive(Debug, Default, Copy, Clone)]
pub struct Frame;

impl Compute for Frame {
    fn type_name(&self) -> &str {
        "Frame"
    }

    fn plugs(&self) -> Vec<PlugSpec> {
        vec![PlugSpec::output("out", ValueType::Float)]
    }

    fn affects(&self, _: &str) -> Vec<&str> {
        vec![]
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        h.append(&cx.context().frame().to_bits());
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        Ok(Value::Float(cx.context().frame()))
    }
}

/// Passes `in` through to `out`, evaluated in a context with extra
/// variables set. The variables are skipped while `enabled` is off.
#[derive(Debug, Clone)]
pub struct ContextVariables {
    value_type: ValueType,
    variables: Vec<(Arc<str>, Value)>,
}

impl ContextVariables {
    pub fn new(value_type: ValueType) -> Self {
        Self { value_type, variables: Vec::new() }
    }

    /// Add a variable to set.
    pub fn with(mut self, name: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.variables.push((name.into(), value.into()));
        self
    }

    fn upstream_context(&self, cx: &ComputeContext) -> Result<Context> {
        let mut context = cx.context().clone();
        if cx.value("enabled")?.as_bool().unwrap_or(true) {
            for (name, value) in &self.variables {
                context.set(name.clone(), value.clone());
            }
        }
        Ok(context)
    }
}

impl Compute for ContextVariables {
    fn type_name(&self) -> &str {
        "ContextVariables"
    }

    fn plugs(&self) -> Vec<PlugSpec> {
        vec![
            PlugSpec::input("in", self.value_type),
            PlugSpec::input("enabled", ValueType::Bool).default(true),
            PlugSpec::output("out", self.value_type),
        ]
    }

    fn affects(&self, input: &str) -> Vec<&str> {
        match input {
            "in" | "enabled" => vec!["out"],
            _ => vec![],
        }
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        let context = self.upstream_context(cx)?;
        h.append_fingerprint(cx.hash_in("in", &context)?);
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        let context = self.upstream_context(cx)?;
        cx.value_in("in", &context)
    }
}

/// Passes `in` through to `out`, evaluated at frame
/// `frame * speed + offset`.
#[derive(Debug, Copy, Clone)]
pub struct TimeWarp {
    value_type: ValueType,
}

impl TimeWarp {
    pub fn new(value_type: ValueType) -> Self {
        Self { value_type }
    }

    fn upstream_context(&self, cx: &ComputeContext) -> Result<Context> {
        let speed = cx.value("speed")?.as_float().unwrap_or(1.0);
        let offset = cx.value("offset")?.as_float().unwrap_or(0.0);
        let mut context = cx.context().clone();
        context.set_frame(context.frame() * speed + offset);
        Ok(context)
    }
}

impl Compute for TimeWarp {
    fn type_name(&self) -> &str {
        "TimeWarp"
    }

    fn plugs(&self) -> Vec<PlugSpec> {
        vec![
            PlugSpec::input("in", self.value_type),
            PlugSpec::input("speed", ValueType::Float).default(1.0),
            PlugSpec::input("offset", ValueType::Float),
            PlugSpec::output("out", self.value_type),
        ]
    }

    fn affects(&self, input: &str) -> Vec<&str> {
        match input {
            "in" | "speed" | "offset" => vec!["out"],
            _ => vec![],
        }
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        let context = self.upstream_context(cx)?;
        h.append_fingerprint(cx.hash_in("in", &context)?);
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        let context = self.upstream_context(cx)?;
        cx.value_in("in", &context)
    }
}

/// Evaluates `in` once per string in `values`, with the variable named by
/// `variable` set to that string, and outputs the results as a vector.
///
/// The evaluations run in parallel. Integer, float and string inputs are
/// collected into the matching vector type, anything else into a compound.
#[derive(Debug, Copy, Clone)]
pub struct Collect {
    value_type: ValueType,
}

impl Collect {
    pub fn new(value_type: ValueType) -> Self {
        Self { value_type }
    }

    fn output_type(&self) -> ValueType {
        match self.value_type {
            ValueType::Int => ValueType::IntVector,
            ValueType::Float => ValueType::FloatVector,
            ValueType::String => ValueType::StringVector,
            _ => ValueType::Compound,
        }
    }

    fn contexts(&self, cx: &ComputeContext) -> Result<Vec<Context>> {
        let variable = cx.value("variable")?;
        let variable = variable.as_str().unwrap_or_default();
        if variable.is_empty() {
            return Err(Error::msg("no variable name given"));
        }
        let values = cx.value("values")?;
        Ok(values
            .as_string_vector()
            .unwrap_or_default()
            .iter()
            .map(|value| cx.context().with(variable, value.clone()))
            .collect())
    }
}

impl Compute for Collect {
    fn type_name(&self) -> &str {
        "Collect"
    }

    fn plugs(&self) -> Vec<PlugSpec> {
        vec![
            PlugSpec::input("in", self.value_type),
            PlugSpec::input("values", ValueType::StringVector),
            PlugSpec::input("variable", ValueType::String).default("collect:value"),
            PlugSpec::output("out", self.output_type()),
        ]
    }

    fn affects(&self, input: &str) -> Vec<&str> {
        match input {
            "in" | "values" | "variable" => vec!["out"],
            _ => vec![],
        }
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        let input = cx.input("in")?;
        let requests: Vec<_> =
            self.contexts(cx)?.into_iter().map(|context| (input, context)).collect();
        h.append(&requests.len());
        for fingerprint in cx.parallel_hashes(&requests)? {
            h.append_fingerprint(fingerprint);
        }
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        let input = cx.input("in")?;
        let requests: Vec<_> =
            self.contexts(cx)?.into_iter().map(|context| (input, context)).collect();
        let values = cx.parallel_values(&requests)?;
        let mismatch = |value: &Value| Error::TypeMismatch {
            plug: cx.graph().full_name(input),
            input: "collected value".into(),
            expected: self.value_type,
            found: value.value_type(),
        };

        Ok(match self.output_type() {
            ValueType::IntVector => Value::IntVector(
                values
                    .iter()
                    .map(|v| v.as_int().ok_or_else(|| mismatch(v)))
                    .collect::<Result<_>>()?,
            ),
            ValueType::FloatVector => Value::FloatVector(
                values
                    .iter()
                    .map(|v| v.as_float().ok_or_else(|| mismatch(v)))
                    .collect::<Result<_>>()?,
            ),
            ValueType::StringVector => Value::StringVector(
                values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        v => Err(mismatch(v)),
                    })
                    .collect::<Result<_>>()?,
            ),
            _ => Value::Compound(values.into()),
        })
    }
}
