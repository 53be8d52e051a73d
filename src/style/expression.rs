//! Filter and paint expression evaluation
//!
//! Expressions are JSON arrays whose first element names the operator; a
//! leading `!` negates a boolean result (the literal operator `!=` is not a
//! negation). Operands are literals or nested expressions.

use std::collections::HashMap;

use serde_json::Value as Json;
use thiserror::Error;

use crate::map::mvt::{GeomType, MetaValue};

use super::color::Color;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Color(Color),
    Vec2([f64; 2]),
    Null,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(i) => Some(*i as f64),
            Value::U64(u) => Some(*u as f64),
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    fn from_meta(meta: &MetaValue) -> Value {
        match meta {
            MetaValue::Bool(b) => Value::Bool(*b),
            MetaValue::I64(i) => Value::I64(*i),
            MetaValue::U64(u) => Value::U64(*u),
            MetaValue::F64(f) => Value::F64(*f),
            MetaValue::F32(f) => Value::F64(*f as f64),
            MetaValue::String(s) => Value::Str(s.clone()),
        }
    }
}

/// Shape mismatch while evaluating. Filters treat this as "feature hidden";
/// paint lookups fall back to their documented defaults.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("expression is not a non-empty array with a string operator")]
    NotAnExpression,
    #[error("unknown operator {0:?}")]
    UnknownOperator(String),
    #[error("operator {0:?} applied to the wrong number or kind of operands")]
    Shape(&'static str),
}

/// Evaluate `expr` against one feature.
pub fn evaluate(
    expr: &Json,
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    let items = expr.as_array().ok_or(EvalError::NotAnExpression)?;
    let operator = items
        .first()
        .and_then(Json::as_str)
        .ok_or(EvalError::NotAnExpression)?;

    // Any operator except the literal `!=` may carry a leading negation.
    let (negated, operator) = match operator.strip_prefix('!') {
        Some(stripped) if operator != "!=" => (true, stripped),
        _ => (false, operator),
    };

    let result = match operator {
        "==" | "!=" => compare(items, operator, geom_type, metadata, map_zoom, vp_zoom),
        "in" => contains(items, metadata),
        "all" => all(items, geom_type, metadata, map_zoom, vp_zoom),
        "get" => get(items, metadata),
        "has" => has(items, metadata),
        "match" => match_op(items, geom_type, metadata, map_zoom, vp_zoom),
        "case" => case(items, geom_type, metadata, map_zoom, vp_zoom),
        "coalesce" => coalesce(items, geom_type, metadata, map_zoom, vp_zoom),
        ">" => greater(items, geom_type, metadata, map_zoom, vp_zoom),
        "interpolate" => interpolate(items, geom_type, metadata, map_zoom, vp_zoom),
        other => Err(EvalError::UnknownOperator(other.to_string())),
    }?;

    if negated {
        match result {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => Err(EvalError::Shape("!")),
        }
    } else {
        Ok(result)
    }
}

/// Convert a JSON literal operand into a value.
fn literal(json: &Json) -> Result<Value, EvalError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::I64(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::U64(u))
            } else {
                Ok(Value::F64(n.as_f64().ok_or(EvalError::Shape("literal"))?))
            }
        }
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Array(items) if items.len() == 2 => {
            let x = items[0].as_f64().ok_or(EvalError::Shape("literal"))?;
            let y = items[1].as_f64().ok_or(EvalError::Shape("literal"))?;
            Ok(Value::Vec2([x, y]))
        }
        _ => Err(EvalError::Shape("literal")),
    }
}

/// Evaluate an operand that may be a nested expression or a literal.
fn expression_or_literal(
    json: &Json,
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    if json.is_array() {
        evaluate(json, geom_type, metadata, map_zoom, vp_zoom)
    } else {
        literal(json)
    }
}

/// Resolve a property name. `$type` is the geometry-type pseudo-property;
/// names missing from the metadata compare as the empty string.
fn lookup_property(
    name: &str,
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
) -> Value {
    if name == "$type" {
        Value::Str(geom_type.type_name().to_string())
    } else {
        metadata
            .get(name)
            .map(Value::from_meta)
            .unwrap_or(Value::Str(String::new()))
    }
}

/// Equality used by `==`, `!=`, `in` and `match`: numeric kinds compare by
/// value, otherwise kinds must agree.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn compare(
    items: &[Json],
    operator: &str,
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    if items.len() != 3 {
        return Err(EvalError::Shape("=="));
    }

    let left = match &items[1] {
        Json::String(name) => lookup_property(name, geom_type, metadata),
        Json::Array(inner) if inner.len() == 1 && inner[0] == "$type" => {
            Value::Str(geom_type.type_name().to_string())
        }
        nested @ Json::Array(_) => evaluate(nested, geom_type, metadata, map_zoom, vp_zoom)?,
        _ => return Err(EvalError::Shape("==")),
    };
    let right = literal(&items[2])?;

    let equal = loosely_equal(&left, &right);
    Ok(Value::Bool(if operator == "!=" { !equal } else { equal }))
}

fn contains(items: &[Json], metadata: &HashMap<String, MetaValue>) -> Result<Value, EvalError> {
    if items.len() < 2 {
        return Err(EvalError::Shape("in"));
    }
    let name = items[1].as_str().ok_or(EvalError::Shape("in"))?;
    let Some(value) = metadata.get(name).map(Value::from_meta) else {
        return Ok(Value::Bool(false));
    };
    for candidate in &items[2..] {
        if loosely_equal(&value, &literal(candidate)?) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    for inner in &items[1..] {
        let result = evaluate(inner, geom_type, metadata, map_zoom, vp_zoom)?;
        match result.as_bool() {
            Some(true) => {}
            Some(false) => return Ok(Value::Bool(false)),
            None => return Err(EvalError::Shape("all")),
        }
    }
    Ok(Value::Bool(true))
}

fn get(items: &[Json], metadata: &HashMap<String, MetaValue>) -> Result<Value, EvalError> {
    if items.len() != 2 {
        return Err(EvalError::Shape("get"));
    }
    let name = items[1].as_str().ok_or(EvalError::Shape("get"))?;
    Ok(metadata
        .get(name)
        .map(Value::from_meta)
        .unwrap_or(Value::Null))
}

fn has(items: &[Json], metadata: &HashMap<String, MetaValue>) -> Result<Value, EvalError> {
    if items.len() != 2 {
        return Err(EvalError::Shape("has"));
    }
    let name = items[1].as_str().ok_or(EvalError::Shape("has"))?;
    Ok(Value::Bool(metadata.contains_key(name)))
}

fn match_op(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    // ["match", input, label, output, ..., fallback]: always an odd length.
    if items.len() < 3 || items.len() % 2 == 0 {
        return Err(EvalError::Shape("match"));
    }
    let input = expression_or_literal(&items[1], geom_type, metadata, map_zoom, vp_zoom)?;

    let mut i = 2;
    while i + 1 < items.len() - 1 {
        let matched = match &items[i] {
            Json::Array(labels) => labels
                .iter()
                .map(literal)
                .collect::<Result<Vec<_>, _>>()?
                .iter()
                .any(|label| loosely_equal(&input, label)),
            label => loosely_equal(&input, &literal(label)?),
        };
        if matched {
            return expression_or_literal(&items[i + 1], geom_type, metadata, map_zoom, vp_zoom);
        }
        i += 2;
    }

    expression_or_literal(items.last().unwrap(), geom_type, metadata, map_zoom, vp_zoom)
}

fn case(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    // ["case", condition, output, ..., fallback]
    if items.len() < 2 || items.len() % 2 != 0 {
        return Err(EvalError::Shape("case"));
    }
    let mut i = 1;
    while i + 1 < items.len() - 1 {
        let condition = evaluate(&items[i], geom_type, metadata, map_zoom, vp_zoom)?;
        match condition.as_bool() {
            Some(true) => {
                return expression_or_literal(
                    &items[i + 1],
                    geom_type,
                    metadata,
                    map_zoom,
                    vp_zoom,
                );
            }
            Some(false) => {}
            None => return Err(EvalError::Shape("case")),
        }
        i += 2;
    }
    expression_or_literal(items.last().unwrap(), geom_type, metadata, map_zoom, vp_zoom)
}

fn coalesce(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    for inner in &items[1..] {
        let value = expression_or_literal(inner, geom_type, metadata, map_zoom, vp_zoom)?;
        if value != Value::Null {
            return Ok(value);
        }
    }
    Ok(Value::Null)
}

fn greater(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    if items.len() != 3 {
        return Err(EvalError::Shape(">"));
    }
    let left = expression_or_literal(&items[1], geom_type, metadata, map_zoom, vp_zoom)?;
    let right = expression_or_literal(&items[2], geom_type, metadata, map_zoom, vp_zoom)?;

    if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
        return Ok(Value::Bool(a > b));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Bool(a > b)),
        _ => Err(EvalError::Shape(">")),
    }
}

fn interpolate(
    items: &[Json],
    geom_type: GeomType,
    metadata: &HashMap<String, MetaValue>,
    map_zoom: i32,
    vp_zoom: f64,
) -> Result<Value, EvalError> {
    // ["interpolate", ["linear"], input, stop_in, stop_out, ...]
    // The stop list starts at index 3; the current map zoom is the input.
    if items.len() < 5 || (items.len() - 3) % 2 != 0 {
        return Err(EvalError::Shape("interpolate"));
    }

    let mut stops = Vec::new();
    let mut i = 3;
    while i + 1 < items.len() {
        let stop_zoom = items[i].as_f64().ok_or(EvalError::Shape("interpolate"))?;
        let output = expression_or_literal(&items[i + 1], geom_type, metadata, map_zoom, vp_zoom)?
            .as_f64()
            .ok_or(EvalError::Shape("interpolate"))?;
        stops.push((stop_zoom, output));
        i += 2;
    }

    let zoom = map_zoom as f64;
    let (first, last) = (stops[0], stops[stops.len() - 1]);
    if zoom <= first.0 {
        return Ok(Value::F64(first.1));
    }
    if zoom >= last.0 {
        return Ok(Value::F64(last.1));
    }
    for pair in stops.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        if zoom <= upper.0 {
            let t = (zoom - lower.0) / (upper.0 - lower.0);
            return Ok(Value::F64(lower.1 + t * (upper.1 - lower.1)));
        }
    }
    Ok(Value::F64(last.1))
}
