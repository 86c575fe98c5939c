//! Template expression language for composite steps
//!
//! Step payloads can be transformed before dispatch through a tiny
//! substitution language, a tagged set of `$`-prefixed expressions:
//!
//! - `$guid` — a fresh UUID v4 string
//! - `$requestid` — the composite invocation's request id
//! - `$context.<var>` — a variable bound in the execution context
//! - `$prev.<step>.<propPath>` — a value from an earlier step's result,
//!   where path segments navigate object keys and purely numeric segments
//!   index arrays
//!
//! Anything else is a literal and is written into the target field as-is.
//! Unresolvable `$context`/`$prev` references leave the raw expression
//! string in place so the failure stays visible in the upstream payload.

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::ExecutionContext;

/// A parsed template expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateExpr<'a> {
    Guid,
    RequestId,
    Context(&'a str),
    Prev { step: &'a str, path: Vec<&'a str> },
    Literal(&'a str),
}

/// Parse one expression string into its tagged form
pub fn parse(expr: &str) -> TemplateExpr<'_> {
    if expr == "$guid" {
        return TemplateExpr::Guid;
    }
    if expr == "$requestid" {
        return TemplateExpr::RequestId;
    }
    if let Some(var) = expr.strip_prefix("$context.") {
        if !var.is_empty() {
            return TemplateExpr::Context(var);
        }
    }
    if let Some(rest) = expr.strip_prefix("$prev.") {
        let mut segments = rest.split('.');
        if let Some(step) = segments.next() {
            if !step.is_empty() {
                return TemplateExpr::Prev {
                    step,
                    path: segments.collect(),
                };
            }
        }
    }
    TemplateExpr::Literal(expr)
}

/// Resolve an expression against the execution context and the results of
/// the steps completed so far.
pub fn resolve(
    expr: &str,
    context: &ExecutionContext,
    step_results: &BTreeMap<String, Value>,
) -> Value {
    match parse(expr) {
        TemplateExpr::Guid => Value::String(Uuid::new_v4().to_string()),
        TemplateExpr::RequestId => Value::String(context.request_id.to_string()),
        TemplateExpr::Context(var) => match context.variables.get(var) {
            Some(value) => value.clone(),
            None => Value::String(expr.to_string()),
        },
        TemplateExpr::Prev { step, path } => {
            match step_results.get(step).and_then(|root| navigate(root, &path)) {
                // Scalars are written unboxed; containers are detached by
                // cloning so later mutation cannot alias the source step
                Some(value) => value.clone(),
                None => Value::String(expr.to_string()),
            }
        }
        TemplateExpr::Literal(text) => Value::String(text.to_string()),
    }
}

/// Walk a dotted property path through a JSON value
fn navigate<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            Value::Object(map) => map.get(*segment)?,
            _ => return None,
        };
    }
    Some(current)
}
