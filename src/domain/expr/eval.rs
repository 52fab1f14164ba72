//! Tree-walking evaluator for the expression dialect

use super::parser::{BinOp, Expr, UnaryOp};
use super::{ExprError, ExprValue};
use crate::domain::types::{CommandIntent, StateBag};
use std::collections::BTreeMap;

/// Snapshot of every entity's state bag, keyed by entity id.
pub type StatesView = rustc_hash::FxHashMap<String, StateBag>;

/// Bindings available to one evaluation.
pub struct EvalContext<'a> {
    /// Current packet body.
    pub data: &'a [u8],
    /// This entity's previous state.
    pub state: Option<&'a StateBag>,
    /// All entities' states (automation context).
    pub states: Option<&'a StatesView>,
    /// Command value.
    pub x: ExprValue,
    /// Trigger payload (automation context).
    pub trigger: ExprValue,
    /// Epoch milliseconds at evaluation time.
    pub timestamp: i64,
}

impl Default for EvalContext<'_> {
    fn default() -> Self {
        Self {
            data: &[],
            state: None,
            states: None,
            x: ExprValue::Null,
            trigger: ExprValue::Null,
            timestamp: 0,
        }
    }
}

pub fn eval(expr: &Expr, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    match expr {
        Expr::Null => Ok(ExprValue::Null),
        Expr::Bool(b) => Ok(ExprValue::Bool(*b)),
        Expr::Int(i) => Ok(ExprValue::Int(*i)),
        Expr::Float(f) => Ok(ExprValue::Float(*f)),
        Expr::Str(s) => Ok(ExprValue::Str(s.clone())),
        Expr::List(items) => {
            let values = items.iter().map(|e| eval(e, ctx)).collect::<Result<Vec<_>, _>>()?;
            Ok(ExprValue::List(values))
        }
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, ctx)?);
            }
            Ok(ExprValue::Map(map))
        }
        Expr::Ident(name) => binding(name, ctx),
        Expr::Member(..) | Expr::Index(..) => {
            Ok(resolve_maybe(expr, ctx)?.unwrap_or(ExprValue::Null))
        }
        Expr::Unary(op, inner) => {
            let value = eval(inner, ctx)?;
            match op {
                UnaryOp::Not => Ok(ExprValue::Bool(!value.is_truthy())),
                UnaryOp::Neg => match value {
                    ExprValue::Int(i) => Ok(ExprValue::Int(-i)),
                    ExprValue::Float(f) => Ok(ExprValue::Float(-f)),
                    other => Err(ExprError::Eval(format!("cannot negate {other:?}"))),
                },
            }
        }
        Expr::Binary(op, left, right) => binary(*op, left, right, ctx),
        Expr::Ternary(condition, then, otherwise) => {
            if eval(condition, ctx)?.is_truthy() {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Call(target, name, args) => call(target.as_deref(), name, args, ctx),
    }
}

fn binding(name: &str, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    match name {
        "data" => Ok(ExprValue::List(ctx.data.iter().map(|&b| ExprValue::Int(b as i64)).collect())),
        "state" => Ok(bag_to_value(ctx.state)),
        "states" => {
            let mut map = BTreeMap::new();
            if let Some(states) = ctx.states {
                for (id, bag) in states {
                    map.insert(id.clone(), bag_to_value(Some(bag)));
                }
            }
            Ok(ExprValue::Map(map))
        }
        "x" => Ok(ctx.x.clone()),
        "xstr" => Ok(ExprValue::Str(ctx.x.coerce_string())),
        "trigger" => Ok(ctx.trigger.clone()),
        "timestamp" => Ok(ExprValue::Int(ctx.timestamp)),
        other => Err(ExprError::Eval(format!("unknown binding {other:?}"))),
    }
}

fn bag_to_value(bag: Option<&StateBag>) -> ExprValue {
    let mut map = BTreeMap::new();
    if let Some(bag) = bag {
        for (key, value) in bag {
            map.insert(key.clone(), ExprValue::from_json(value));
        }
    }
    ExprValue::Map(map)
}

/// Resolve a member/index path, distinguishing "missing" from an explicit
/// null so `has()` can answer honestly. Missing keys and out-of-range
/// indexes resolve to `None`; plain evaluation maps that to null.
fn resolve_maybe(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Option<ExprValue>, ExprError> {
    match expr {
        Expr::Member(object, name) => {
            let Some(object) = resolve_maybe(object, ctx)? else {
                return Ok(None);
            };
            Ok(member_of(&object, name))
        }
        Expr::Index(object, index) => {
            let Some(object) = resolve_maybe(object, ctx)? else {
                return Ok(None);
            };
            let index = eval(index, ctx)?;
            Ok(index_of(&object, &index))
        }
        other => eval(other, ctx).map(Some),
    }
}

fn member_of(object: &ExprValue, name: &str) -> Option<ExprValue> {
    match object {
        ExprValue::Map(map) => map.get(name).cloned(),
        _ => None,
    }
}

fn index_of(object: &ExprValue, index: &ExprValue) -> Option<ExprValue> {
    match (object, index) {
        (ExprValue::List(items), ExprValue::Int(i)) => {
            if *i < 0 {
                return None;
            }
            items.get(*i as usize).cloned()
        }
        (ExprValue::Map(map), ExprValue::Str(key)) => map.get(key).cloned(),
        _ => None,
    }
}

fn binary(op: BinOp, left: &Expr, right: &Expr, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    // Short-circuit forms first.
    match op {
        BinOp::And => {
            let lhs = eval(left, ctx)?;
            if !lhs.is_truthy() {
                return Ok(ExprValue::Bool(false));
            }
            return Ok(ExprValue::Bool(eval(right, ctx)?.is_truthy()));
        }
        BinOp::Or => {
            let lhs = eval(left, ctx)?;
            if lhs.is_truthy() {
                return Ok(ExprValue::Bool(true));
            }
            return Ok(ExprValue::Bool(eval(right, ctx)?.is_truthy()));
        }
        _ => {}
    }

    let lhs = eval(left, ctx)?;
    let rhs = eval(right, ctx)?;

    match op {
        BinOp::Add => match (&lhs, &rhs) {
            (ExprValue::Int(a), ExprValue::Int(b)) => Ok(ExprValue::Int(a.wrapping_add(*b))),
            (ExprValue::Str(a), ExprValue::Str(b)) => Ok(ExprValue::Str(format!("{a}{b}"))),
            (ExprValue::List(a), ExprValue::List(b)) => {
                let mut merged = a.clone();
                merged.extend(b.iter().cloned());
                Ok(ExprValue::List(merged))
            }
            _ => {
                let (a, b) = numeric_pair(&lhs, &rhs)?;
                Ok(ExprValue::Float(a + b))
            }
        },
        BinOp::Sub => int_preserving(&lhs, &rhs, |a, b| a.wrapping_sub(b), |a, b| a - b),
        BinOp::Mul => int_preserving(&lhs, &rhs, |a, b| a.wrapping_mul(b), |a, b| a * b),
        BinOp::Div => {
            let (a, b) = numeric_pair(&lhs, &rhs)?;
            if b == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            Ok(ExprValue::Float(a / b))
        }
        BinOp::Mod => match (&lhs, &rhs) {
            (ExprValue::Int(a), ExprValue::Int(b)) => {
                if *b == 0 {
                    Err(ExprError::Eval("modulo by zero".to_string()))
                } else {
                    Ok(ExprValue::Int(a % b))
                }
            }
            _ => Err(ExprError::Eval("modulo requires integers".to_string())),
        },
        BinOp::Eq => Ok(ExprValue::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(ExprValue::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&lhs, &rhs) {
                (ExprValue::Str(a), ExprValue::Str(b)) => a.cmp(b),
                _ => {
                    let (a, b) = numeric_pair(&lhs, &rhs)?;
                    a.partial_cmp(&b).ok_or_else(|| {
                        ExprError::Eval("incomparable values".to_string())
                    })?
                }
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(ExprValue::Bool(result))
        }
        BinOp::In => match (&lhs, &rhs) {
            (needle, ExprValue::List(items)) => {
                Ok(ExprValue::Bool(items.iter().any(|item| values_equal(item, needle))))
            }
            (ExprValue::Str(key), ExprValue::Map(map)) => {
                Ok(ExprValue::Bool(map.contains_key(key)))
            }
            (ExprValue::Str(needle), ExprValue::Str(haystack)) => {
                Ok(ExprValue::Bool(haystack.contains(needle.as_str())))
            }
            _ => Err(ExprError::Eval("unsupported 'in' operands".to_string())),
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn int_preserving(
    lhs: &ExprValue,
    rhs: &ExprValue,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<ExprValue, ExprError> {
    match (lhs, rhs) {
        (ExprValue::Int(a), ExprValue::Int(b)) => Ok(ExprValue::Int(int_op(*a, *b))),
        _ => {
            let (a, b) = numeric_pair(lhs, rhs)?;
            Ok(ExprValue::Float(float_op(a, b)))
        }
    }
}

fn numeric_pair(lhs: &ExprValue, rhs: &ExprValue) -> Result<(f64, f64), ExprError> {
    Ok((numeric(lhs)?, numeric(rhs)?))
}

fn numeric(value: &ExprValue) -> Result<f64, ExprError> {
    match value {
        ExprValue::Int(i) => Ok(*i as f64),
        ExprValue::Float(f) => Ok(*f),
        ExprValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(ExprError::Eval(format!("expected a number, got {other:?}"))),
    }
}

fn values_equal(lhs: &ExprValue, rhs: &ExprValue) -> bool {
    match (lhs, rhs) {
        (ExprValue::Int(a), ExprValue::Float(b)) => *a as f64 == *b,
        (ExprValue::Float(a), ExprValue::Int(b)) => *a == *b as f64,
        _ => lhs == rhs,
    }
}

fn call(
    target: Option<&Expr>,
    name: &str,
    args: &[Expr],
    ctx: &EvalContext<'_>,
) -> Result<ExprValue, ExprError> {
    // Method calls: the only methods are command_* on an id() handle, plus
    // the string matches() convenience.
    if let Some(target) = target {
        if let Some(command) = name.strip_prefix("command_") {
            let handle = eval(target, ctx)?;
            let ExprValue::Handle(entity_id) = handle else {
                return Err(ExprError::Eval(format!(
                    "command_{command} is only valid on an id() handle"
                )));
            };
            let argument = match args {
                [] => None,
                [arg] => Some(eval(arg, ctx)?.to_json()),
                _ => {
                    return Err(ExprError::Eval(
                        "command calls take at most one argument".to_string(),
                    ));
                }
            };
            return Ok(ExprValue::Command(CommandIntent {
                entity_id,
                command: command.to_string(),
                argument,
            }));
        }
        if name == "matches" {
            let subject = eval(target, ctx)?;
            let pattern = args
                .first()
                .map(|a| eval(a, ctx))
                .transpose()?
                .ok_or_else(|| ExprError::Eval("matches() needs a pattern".to_string()))?;
            return regex_match(&subject, &pattern);
        }
        return Err(ExprError::Eval(format!("unknown method {name:?}")));
    }

    // `has` is a special form: its argument is a path, not a value.
    if name == "has" {
        let [arg] = args else {
            return Err(ExprError::Eval("has() takes exactly one argument".to_string()));
        };
        let resolved = resolve_maybe(arg, ctx)?;
        return Ok(ExprValue::Bool(resolved.is_some()));
    }

    let values = args.iter().map(|a| eval(a, ctx)).collect::<Result<Vec<_>, _>>()?;
    match (name, values.as_slice()) {
        ("id", [ExprValue::Str(entity_id)]) => Ok(ExprValue::Handle(entity_id.clone())),
        ("id", _) => Err(ExprError::Eval("id() takes one entity id string".to_string())),
        ("string", [value]) => Ok(ExprValue::Str(value.coerce_string())),
        ("int", [value]) => match value {
            ExprValue::Int(i) => Ok(ExprValue::Int(*i)),
            ExprValue::Float(f) => Ok(ExprValue::Int(*f as i64)),
            ExprValue::Bool(b) => Ok(ExprValue::Int(*b as i64)),
            ExprValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(ExprValue::Int)
                .map_err(|e| ExprError::Eval(format!("int({s:?}): {e}"))),
            other => Err(ExprError::Eval(format!("int() cannot convert {other:?}"))),
        },
        ("double", [value]) => match value {
            ExprValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(ExprValue::Float)
                .map_err(|e| ExprError::Eval(format!("double({s:?}): {e}"))),
            other => numeric(other).map(ExprValue::Float),
        },
        ("size", [value]) => match value {
            ExprValue::Str(s) => Ok(ExprValue::Int(s.len() as i64)),
            ExprValue::List(items) => Ok(ExprValue::Int(items.len() as i64)),
            ExprValue::Map(map) => Ok(ExprValue::Int(map.len() as i64)),
            other => Err(ExprError::Eval(format!("size() cannot measure {other:?}"))),
        },
        ("matches", [subject, pattern]) => regex_match(subject, pattern),
        ("min", rest) if !rest.is_empty() => fold_numeric(rest, true),
        ("max", rest) if !rest.is_empty() => fold_numeric(rest, false),
        ("round", [value]) => {
            let n = numeric(value)?;
            Ok(ExprValue::Int(n.round() as i64))
        }
        ("abs", [value]) => match value {
            ExprValue::Int(i) => Ok(ExprValue::Int(i.abs())),
            other => numeric(other).map(|f| ExprValue::Float(f.abs())),
        },
        (other, _) => Err(ExprError::Eval(format!("unknown function {other:?}"))),
    }
}

fn fold_numeric(values: &[ExprValue], take_min: bool) -> Result<ExprValue, ExprError> {
    let all_int = values.iter().all(|v| matches!(v, ExprValue::Int(_)));
    let mut best = numeric(&values[0])?;
    for value in &values[1..] {
        let n = numeric(value)?;
        if (take_min && n < best) || (!take_min && n > best) {
            best = n;
        }
    }
    if all_int {
        Ok(ExprValue::Int(best as i64))
    } else {
        Ok(ExprValue::Float(best))
    }
}

fn regex_match(subject: &ExprValue, pattern: &ExprValue) -> Result<ExprValue, ExprError> {
    let (ExprValue::Str(subject), ExprValue::Str(pattern)) = (subject, pattern) else {
        return Err(ExprError::Eval("matches() takes two strings".to_string()));
    };
    let compiled = fancy_regex::Regex::new(pattern)
        .map_err(|e| ExprError::Eval(format!("bad regex {pattern:?}: {e}")))?;
    let matched = compiled
        .is_match(subject)
        .map_err(|e| ExprError::Eval(format!("regex {pattern:?} failed: {e}")))?;
    Ok(ExprValue::Bool(matched))
}
