//! Routing predicate evaluation.
//!
//! Filters and outputs carry an optional `when` expression that decides
//! whether they apply to an item. Expressions are compiled against a fixed
//! variable schema built from the [`RoutingContext`]:
//!
//! | Variable | Type |
//! |----------|------|
//! | `filename` | string |
//! | `extension` | string |
//! | `path` | string |
//! | `size` | integer |
//! | `sourceId` | string |
//! | `mimeType` | string or null |
//! | `targetIndex` | string |
//! | `tags` | list of strings |
//! | `metadata` | map |
//!
//! ```rust
//! use fscrawl::condition::ConditionEvaluator;
//! use fscrawl::models::RoutingContext;
//!
//! let evaluator = ConditionEvaluator::new();
//! let mut ctx = RoutingContext::default();
//! ctx.extension = "pdf".to_string();
//! assert!(evaluator.evaluate(Some("extension == 'pdf'"), &ctx).unwrap());
//! assert!(evaluator.evaluate(None, &ctx).unwrap());
//! ```
//!
//! Compiled expressions are cached by their raw text. Plugin predicates are
//! static per configured instance, so the cache stays bounded by the
//! configuration size.

mod parser;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::ConditionError;
use crate::models::RoutingContext;

pub use parser::{CompareOp, Expr, Literal};

/// Names every expression may reference.
pub const VARIABLES: &[&str] = &[
    "filename",
    "extension",
    "path",
    "size",
    "sourceId",
    "mimeType",
    "targetIndex",
    "tags",
    "metadata",
];

const METHODS: &[(&str, usize)] = &[
    ("contains", 1),
    ("startsWith", 1),
    ("endsWith", 1),
    ("toLowerCase", 0),
    ("toUpperCase", 0),
    ("isEmpty", 0),
    ("size", 0),
    ("length", 0),
];

/// Runtime value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Compile an expression without caching it.
pub fn compile(expression: &str) -> Result<Expr, ConditionError> {
    let to_err = |message: String| ConditionError::Parse {
        expression: expression.to_string(),
        message,
    };
    let expr = parser::parse(expression).map_err(to_err)?;
    check_methods(&expr).map_err(to_err)?;
    Ok(expr)
}

fn check_methods(expr: &Expr) -> Result<(), String> {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => Ok(()),
        Expr::List(items) => items.iter().try_for_each(check_methods),
        Expr::Not(inner) | Expr::Field(inner, _) => check_methods(inner),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) | Expr::Index(a, b) => {
            check_methods(a)?;
            check_methods(b)
        }
        Expr::Call(target, name, args) => {
            match METHODS.iter().find(|(m, _)| *m == name.as_str()) {
                Some((_, arity)) if *arity == args.len() => {}
                Some((_, arity)) => {
                    return Err(format!(
                        "method '{}' takes {} argument(s), got {}",
                        name,
                        arity,
                        args.len()
                    ))
                }
                None => return Err(format!("unknown method '{}'", name)),
            }
            check_methods(target)?;
            args.iter().try_for_each(check_methods)
        }
    }
}

/// Compiles, caches, and evaluates routing predicates.
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `expression` against `ctx`.
    ///
    /// An absent or blank expression always matches. `"true"`/`"false"`
    /// (any case) short-circuit. A non-boolean result is coerced
    /// (null is false, anything else true) with a warning.
    pub fn evaluate(
        &self,
        expression: Option<&str>,
        ctx: &RoutingContext,
    ) -> Result<bool, ConditionError> {
        let raw = match expression.map(str::trim) {
            None | Some("") => return Ok(true),
            Some(raw) => raw,
        };
        if raw.eq_ignore_ascii_case("true") {
            return Ok(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return Ok(false);
        }

        let compiled = self.compiled(raw)?;
        let value = eval(&compiled, ctx).map_err(|message| ConditionError::Evaluation {
            expression: raw.to_string(),
            message,
        })?;

        match value {
            Value::Bool(b) => Ok(b),
            Value::Null => {
                warn!(expression = raw, "condition evaluated to null, treating as false");
                Ok(false)
            }
            other => {
                warn!(
                    expression = raw,
                    result_type = other.type_name(),
                    "condition did not evaluate to a boolean, treating as true"
                );
                Ok(true)
            }
        }
    }

    /// Whether `expression` compiles against the variable schema.
    pub fn is_valid(&self, expression: Option<&str>) -> bool {
        match expression.map(str::trim) {
            None | Some("") => true,
            Some(raw) if raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false") => {
                true
            }
            Some(raw) => self.compiled(raw).is_ok(),
        }
    }

    /// Number of cached compiled expressions.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn compiled(&self, raw: &str) -> Result<Arc<Expr>, ConditionError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(expr) = cache.get(raw) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(compile(raw)?);
        cache.insert(raw.to_string(), expr.clone());
        Ok(expr)
    }
}

fn variable(name: &str, ctx: &RoutingContext) -> Value {
    match name {
        "filename" => Value::Str(ctx.filename.clone()),
        "extension" => Value::Str(ctx.extension.clone()),
        "path" => Value::Str(ctx.path.clone()),
        "size" => Value::Int(ctx.size),
        "sourceId" => Value::Str(ctx.source_id.clone()),
        "mimeType" => ctx
            .mime_type
            .as_ref()
            .map(|m| Value::Str(m.clone()))
            .unwrap_or(Value::Null),
        "targetIndex" => Value::Str(ctx.target_index.clone()),
        "tags" => Value::List(ctx.tags.iter().map(|t| Value::Str(t.clone())).collect()),
        "metadata" => Value::Map(
            ctx.metadata
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn eval(expr: &Expr, ctx: &RoutingContext) -> Result<Value, String> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::Int(*n),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
        }),
        Expr::Var(name) => Ok(variable(name, ctx)),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|e| eval(e, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, ctx)?.truthy())),
        Expr::And(a, b) => {
            if !eval(a, ctx)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Or(a, b) => {
            if eval(a, ctx)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Compare(op, a, b) => {
            let left = eval(a, ctx)?;
            let right = eval(b, ctx)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Expr::Field(target, name) => match eval(target, ctx)? {
            Value::Map(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(format!("{} has no field '{}'", other.type_name(), name)),
        },
        Expr::Index(target, key) => {
            let target = eval(target, ctx)?;
            let key = eval(key, ctx)?;
            match (&target, &key) {
                (Value::Null, _) => Ok(Value::Null),
                (Value::Map(map), Value::Str(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
                (Value::List(items), Value::Int(i)) => Ok(usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null)),
                _ => Err(format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    key.type_name()
                )),
            }
        }
        Expr::Call(target, name, args) => {
            let target = eval(target, ctx)?;
            let args = args
                .iter()
                .map(|e| eval(e, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call(&target, name, &args)
        }
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, String> {
    let ordering = |l: &Value, r: &Value| -> Result<Ordering, String> {
        match (l, r) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(x), Some(y)) => x
                    .partial_cmp(&y)
                    .ok_or_else(|| "cannot order NaN".to_string()),
                _ => Err(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )),
            },
        }
    };

    match op {
        CompareOp::Eq => Ok(equal(left, right)),
        CompareOp::Ne => Ok(!equal(left, right)),
        CompareOp::Lt => Ok(ordering(left, right)? == Ordering::Less),
        CompareOp::Le => Ok(ordering(left, right)? != Ordering::Greater),
        CompareOp::Gt => Ok(ordering(left, right)? == Ordering::Greater),
        CompareOp::Ge => Ok(ordering(left, right)? != Ordering::Less),
        CompareOp::In => contains(right, left),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
    match (haystack, needle) {
        (Value::Null, _) => Ok(false),
        (Value::List(items), _) => Ok(items.iter().any(|item| equal(item, needle))),
        (Value::Map(map), Value::Str(key)) => Ok(map.contains_key(key)),
        (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
        _ => Err(format!(
            "cannot test whether {} contains {}",
            haystack.type_name(),
            needle.type_name()
        )),
    }
}

fn call(target: &Value, name: &str, args: &[Value]) -> Result<Value, String> {
    match (name, target, args) {
        ("contains", _, [needle]) => contains(target, needle).map(Value::Bool),
        ("startsWith", Value::Str(s), [Value::Str(p)]) => Ok(Value::Bool(s.starts_with(p.as_str()))),
        ("endsWith", Value::Str(s), [Value::Str(p)]) => Ok(Value::Bool(s.ends_with(p.as_str()))),
        ("startsWith" | "endsWith", Value::Null, _) => Ok(Value::Bool(false)),
        ("toLowerCase", Value::Str(s), []) => Ok(Value::Str(s.to_lowercase())),
        ("toUpperCase", Value::Str(s), []) => Ok(Value::Str(s.to_uppercase())),
        ("toLowerCase" | "toUpperCase", Value::Null, []) => Ok(Value::Null),
        ("isEmpty", Value::Null, []) => Ok(Value::Bool(true)),
        ("isEmpty", Value::Str(s), []) => Ok(Value::Bool(s.is_empty())),
        ("isEmpty", Value::List(l), []) => Ok(Value::Bool(l.is_empty())),
        ("isEmpty", Value::Map(m), []) => Ok(Value::Bool(m.is_empty())),
        ("size" | "length", Value::Str(s), []) => Ok(Value::Int(s.chars().count() as i64)),
        ("size" | "length", Value::List(l), []) => Ok(Value::Int(l.len() as i64)),
        ("size" | "length", Value::Map(m), []) => Ok(Value::Int(m.len() as i64)),
        _ => Err(format!(
            "method '{}' is not defined for {}",
            name,
            target.type_name()
        )),
    }
}
