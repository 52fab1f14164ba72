//! Sandboxed expression language for entity logic and automations
//!
//! Entity `state_*` / `command_*` fields and automation guards may be
//! expression strings instead of structured schemas. The dialect is a small
//! CEL-like subset: literals, arithmetic, comparison, logical operators,
//! indexing, ternary, `has()` and a fixed function set. There are no loops
//! and no assignment; evaluation cannot touch host state beyond the
//! bindings handed to it.
//!
//! Dialect decisions: integers are signed 64-bit, `/` is always floating
//! division, `%` is integer modulo, regexes are JS-style (backreferences
//! and lookaround supported).
//!
//! Expressions are compiled once and cached by source text; evaluation
//! reuses the parsed tree.

mod eval;
mod parser;

pub use eval::{EvalContext, StatesView};
pub use parser::Expr;

use crate::domain::types::CommandIntent;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("expression too deeply nested")]
    DepthExceeded,
    #[error("eval error: {0}")]
    Eval(String),
}

/// Runtime value produced by the evaluator. JSON-like, plus the two opaque
/// kinds the automation layer understands: an entity handle from `id()` and
/// a command intent from `id().command_*()`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ExprValue>),
    Map(BTreeMap<String, ExprValue>),
    Handle(String),
    Command(CommandIntent),
}

impl ExprValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ExprValue::Null,
            serde_json::Value::Bool(b) => ExprValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ExprValue::Int(i)
                } else {
                    ExprValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => ExprValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                ExprValue::List(items.iter().map(ExprValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ExprValue::Map(
                map.iter().map(|(k, v)| (k.clone(), ExprValue::from_json(v))).collect(),
            ),
        }
    }

    /// Convert back to JSON. Handles and command intents have no JSON form
    /// and collapse to null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ExprValue::Null => serde_json::Value::Null,
            ExprValue::Bool(b) => serde_json::Value::Bool(*b),
            ExprValue::Int(i) => serde_json::Value::Number((*i).into()),
            ExprValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ExprValue::Str(s) => serde_json::Value::String(s.clone()),
            ExprValue::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            ExprValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            ExprValue::Handle(_) | ExprValue::Command(_) => serde_json::Value::Null,
        }
    }

    /// Interpret a list of small integers as packet bytes.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            ExprValue::List(items) => items
                .iter()
                .map(|v| match v {
                    ExprValue::Int(i) if (0..=255).contains(i) => Some(*i as u8),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ExprValue::Null => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Int(i) => *i != 0,
            ExprValue::Float(f) => *f != 0.0,
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::List(items) => !items.is_empty(),
            ExprValue::Map(map) => !map.is_empty(),
            ExprValue::Handle(_) | ExprValue::Command(_) => true,
        }
    }

    pub fn coerce_string(&self) -> String {
        match self {
            ExprValue::Str(s) => s.clone(),
            ExprValue::Null => String::new(),
            other => other.to_json().to_string(),
        }
    }
}

/// Parse-once / evaluate-many expression engine with a cache keyed by
/// source text. Shared per port engine.
#[derive(Default)]
pub struct ExprEngine {
    cache: Mutex<FxHashMap<String, Arc<Expr>>>,
}

impl ExprEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, source: &str) -> Result<Arc<Expr>, ExprError> {
        if let Some(found) = self.cache.lock().get(source) {
            return Ok(found.clone());
        }
        let parsed = Arc::new(parser::parse(source)?);
        self.cache.lock().insert(source.to_string(), parsed.clone());
        Ok(parsed)
    }

    pub fn eval(&self, source: &str, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
        let expr = self.compile(source)?;
        eval::eval(&expr, ctx)
    }

    /// Guard evaluation: errors are logged by the caller and count as false.
    pub fn eval_guard(&self, source: &str, ctx: &EvalContext<'_>) -> Result<bool, ExprError> {
        Ok(self.eval(source, ctx)?.is_truthy())
    }
}
