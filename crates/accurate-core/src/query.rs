//! Structured query language used by aliases, user profiles, action filters,
//! derived chargers and stats queues
//!
//! A query is a JSON document in the spirit of MongoDB filters:
//!
//! ```text
//! {"Weight": {"$gt": 50}}
//! {"$or": [{"Value": {"$eq": 0}}, {"Value": {"$gte": 100}}]}
//! {"Subject": {"$rpl": ["dan", "rif1"]}, "Cli": {"$set": "0724"}}
//! ```
//!
//! Plain `"Field": value` pairs are equality tests and sibling keys are
//! joined with an implicit `$and`. Queries run against the serde JSON form
//! of a value (PascalCase field names); keys absent from the object are
//! looked up in its `ExtraFields` map.
//!
//! Two modes exist: read mode only tests, apply mode also writes the values
//! produced by the rewriting operators (`$set`, `$rpl`, `$repl`, `$crepl`,
//! `$usr`, `$usrpl`) back into the object.

use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::AppError;
use crate::utils::consts::{ANY, USERS};
use crate::utils::time::{parse_duration, parse_time};
use crate::AppResult;

const EXTRA_FIELDS: &str = "ExtraFields";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Empty,
    Gt,
    Gte,
    Lt,
    Lte,
    Btw,
    Exp,
    Has,
    In,
    Re,
    Sw,
    Ew,
    Set,
    Rpl,
    Repl,
    Crepl,
    Usr,
    Usrpl,
}

impl Op {
    fn parse(s: &str) -> Option<Op> {
        Some(match s {
            "$eq" => Op::Eq,
            "$empty" => Op::Empty,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            "$btw" => Op::Btw,
            "$exp" => Op::Exp,
            "$has" => Op::Has,
            "$in" => Op::In,
            "$re" => Op::Re,
            "$sw" => Op::Sw,
            "$ew" => Op::Ew,
            "$set" => Op::Set,
            "$rpl" => Op::Rpl,
            "$repl" => Op::Repl,
            "$crepl" => Op::Crepl,
            "$usr" => Op::Usr,
            "$usrpl" => Op::Usrpl,
            _ => return None,
        })
    }

    /// Operators that only write and never test
    fn is_setter(self) -> bool {
        matches!(self, Op::Set | Op::Repl)
    }

    fn takes_list(self) -> bool {
        matches!(
            self,
            Op::Has | Op::In | Op::Btw | Op::Repl | Op::Crepl | Op::Usrpl | Op::Rpl
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone)]
enum Node {
    True,
    Group(Combinator, Vec<Node>),
    /// Descend into a field and evaluate the child against it
    Field(String, Box<Node>),
    /// `"Field": literal`
    Equals(String, Value),
    Operator {
        op: Op,
        value: Value,
        regex: Option<Regex>,
    },
}

/// Result of evaluating a node: a verdict or a value to write
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Bool(bool),
    Write(Value),
}

fn invalid(what: impl std::fmt::Display) -> AppError {
    AppError::InvalidArgument(what.to_string())
}

/// A compiled structured query
#[derive(Debug, Clone)]
pub struct Query {
    root: Node,
    complexity: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            root: Node::True,
            complexity: 0,
        }
    }
}

impl Query {
    /// Compiles a query; the empty string matches everything
    pub fn parse(q: &str) -> AppResult<Self> {
        let q = q.trim();
        if q.is_empty() {
            return Ok(Self::default());
        }
        let doc: Map<String, Value> =
            serde_json::from_str(q).map_err(|e| AppError::ParserError(e.to_string()))?;
        let root = Self::load_map(&doc)?;
        let complexity = Self::complexity_of(&root);
        Ok(Self { root, complexity })
    }

    /// Number of testing leaves, used to rank competing profiles
    pub fn complexity(&self) -> usize {
        self.complexity
    }

    fn load_map(doc: &Map<String, Value>) -> AppResult<Node> {
        let mut children = Vec::with_capacity(doc.len());
        for (key, value) in doc {
            children.push(Self::load_entry(key, value)?);
        }
        match children.len() {
            0 => Ok(Node::True),
            1 => Ok(children.remove(0)),
            _ => Ok(Node::Group(Combinator::And, children)),
        }
    }

    fn load_entry(key: &str, value: &Value) -> AppResult<Node> {
        let combinator = match key {
            "$and" => Some(Combinator::And),
            "$or" => Some(Combinator::Or),
            "$not" => Some(Combinator::Not),
            _ => None,
        };
        if let Some(c) = combinator {
            let items = match value {
                Value::Array(items) => items.clone(),
                Value::Object(_) => vec![value.clone()],
                _ => return Err(AppError::ParserError(format!("{} expects a list", key))),
            };
            let mut children = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Object(m) => children.push(Self::load_map(m)?),
                    _ => return Err(AppError::ParserError(format!("{} expects objects", key))),
                }
            }
            return Ok(Node::Group(c, children));
        }

        if key.starts_with('$') {
            let op = Op::parse(key)
                .ok_or_else(|| AppError::ParserError(format!("unknown operator {}", key)))?;
            if value.is_array() != op.takes_list() {
                return Err(AppError::ParserError(format!("bad argument for {}", key)));
            }
            let regex = Self::compile_regex(op, value)?;
            return Ok(Node::Operator {
                op,
                value: value.clone(),
                regex,
            });
        }

        match value {
            Value::Object(m) => Ok(Node::Field(key.to_string(), Box::new(Self::load_map(m)?))),
            other => Ok(Node::Equals(key.to_string(), other.clone())),
        }
    }

    fn compile_regex(op: Op, value: &Value) -> AppResult<Option<Regex>> {
        let pattern = match (op, value) {
            (Op::Re, Value::String(p)) => p.clone(),
            (Op::Re, _) => return Err(AppError::ParserError("$re expects a string".into())),
            (Op::Repl | Op::Crepl | Op::Usrpl, Value::Array(items)) => {
                let search = items
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::ParserError("expected [pattern, template]".into()))?;
                if op == Op::Usrpl {
                    if search.is_empty() {
                        r"\*users|^$".to_string()
                    } else {
                        format!(r"\*users|^$|{}", search)
                    }
                } else {
                    search.to_string()
                }
            }
            _ => return Ok(None),
        };
        Regex::new(&pattern)
            .map(Some)
            .map_err(|e| AppError::ParserError(e.to_string()))
    }

    fn complexity_of(node: &Node) -> usize {
        match node {
            Node::True => 0,
            Node::Group(_, children) => children.iter().map(Self::complexity_of).sum(),
            Node::Field(_, child) => Self::complexity_of(child),
            Node::Equals(..) => 1,
            Node::Operator { op, .. } => usize::from(!op.is_setter()),
        }
    }

    /// Tests a JSON document without changing it
    pub fn matches_value(&self, target: &Value) -> AppResult<bool> {
        let mut scratch = target.clone();
        Self::verdict(eval(&self.root, &mut scratch, false)?)
    }

    /// Tests a JSON document and applies the rewriting operators to it
    pub fn apply_value(&self, target: &mut Value) -> AppResult<bool> {
        Self::verdict(eval(&self.root, target, true)?)
    }

    /// Tests any serializable value
    pub fn matches<T: Serialize>(&self, target: &T) -> AppResult<bool> {
        if matches!(self.root, Node::True) {
            return Ok(true);
        }
        let mut value = serde_json::to_value(target)?;
        Self::verdict(eval(&self.root, &mut value, false)?)
    }

    /// Tests and rewrites `target`; it is only replaced when the query matched
    pub fn apply<T: Serialize + DeserializeOwned>(&self, target: &mut T) -> AppResult<bool> {
        if matches!(self.root, Node::True) {
            return Ok(true);
        }
        let mut value = serde_json::to_value(&*target)?;
        let matched = Self::verdict(eval(&self.root, &mut value, true)?)?;
        if matched {
            *target = serde_json::from_value(value)?;
        }
        Ok(matched)
    }

    fn verdict(outcome: Outcome) -> AppResult<bool> {
        match outcome {
            Outcome::Bool(b) => Ok(b),
            Outcome::Write(v) => Err(invalid(v)),
        }
    }
}

impl FromStr for Query {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::parse(s)
    }
}

fn eval(node: &Node, target: &mut Value, change: bool) -> AppResult<Outcome> {
    match node {
        Node::True => Ok(Outcome::Bool(true)),
        Node::Group(Combinator::Or, children) => {
            for child in children {
                if eval(child, target, change)? == Outcome::Bool(true) {
                    return Ok(Outcome::Bool(true));
                }
            }
            Ok(Outcome::Bool(false))
        }
        Node::Group(combinator, children) => {
            let mut acc = true;
            for child in children {
                if let Outcome::Bool(b) = eval(child, target, change)? {
                    if *combinator == Combinator::And && !b {
                        return Ok(Outcome::Bool(false));
                    }
                    acc = acc && b;
                }
            }
            Ok(Outcome::Bool(if *combinator == Combinator::Not { !acc } else { acc }))
        }
        Node::Field(key, child) => eval_field(key, child, target, change),
        Node::Equals(key, literal) => eval_equals(key, literal, target, change),
        Node::Operator { op, value, regex } => {
            if !change && op.is_setter() {
                return Ok(Outcome::Bool(true));
            }
            apply_operator(*op, target, value, regex.as_ref())
        }
    }
}

fn eval_field(key: &str, child: &Node, target: &mut Value, change: bool) -> AppResult<Outcome> {
    let Some(obj) = target.as_object_mut() else {
        return Ok(Outcome::Bool(false));
    };

    if let Some(field) = obj.get_mut(key) {
        let outcome = eval(child, field, change)?;
        return match outcome {
            Outcome::Bool(b) => Ok(Outcome::Bool(b)),
            Outcome::Write(_) if !change => Ok(Outcome::Bool(true)),
            Outcome::Write(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
                *field = v;
                Ok(Outcome::Bool(true))
            }
            Outcome::Write(v) => Err(invalid(format!("cannot set {} to {}", key, v))),
        };
    }

    let setter = matches!(child, Node::Operator { op: Op::Set, .. });
    if change && setter && !has_extra(obj, key) {
        return match eval(child, &mut Value::String(String::new()), true)? {
            Outcome::Write(v @ Value::String(_)) => {
                insert_extra(obj, key, v);
                Ok(Outcome::Bool(true))
            }
            Outcome::Write(v) => Err(invalid(format!("cannot set {} to {}", key, v))),
            Outcome::Bool(_) => Ok(Outcome::Bool(false)),
        };
    }
    let Some(Value::Object(extra)) = obj.get_mut(EXTRA_FIELDS) else {
        return Ok(Outcome::Bool(false));
    };
    if extra.is_empty() {
        return Ok(Outcome::Bool(false));
    }
    let field = extra.get_mut(key).ok_or_else(|| invalid(key))?;
    match eval(child, field, change)? {
        Outcome::Bool(b) => Ok(Outcome::Bool(b)),
        Outcome::Write(_) if !change => Ok(Outcome::Bool(true)),
        Outcome::Write(v @ Value::String(_)) => {
            *field = v;
            Ok(Outcome::Bool(true))
        }
        Outcome::Write(v) => Err(invalid(format!("cannot set {} to {}", key, v))),
    }
}

fn eval_equals(key: &str, literal: &Value, target: &mut Value, change: bool) -> AppResult<Outcome> {
    let Some(obj) = target.as_object_mut() else {
        return Ok(Outcome::Bool(false));
    };

    if let Some(field) = obj.get_mut(key) {
        if !change {
            return Ok(Outcome::Bool(values_equal(field, literal)));
        }
        return match literal {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                *field = literal.clone();
                Ok(Outcome::Bool(true))
            }
            other => Err(invalid(format!("cannot set {} to {}", key, other))),
        };
    }

    if change && !has_extra(obj, key) {
        return match literal {
            Value::String(_) => {
                insert_extra(obj, key, literal.clone());
                Ok(Outcome::Bool(true))
            }
            other => Err(invalid(format!("cannot set {} to {}", key, other))),
        };
    }
    let Some(Value::Object(extra)) = obj.get_mut(EXTRA_FIELDS) else {
        return Ok(Outcome::Bool(false));
    };
    let Some(field) = extra.get_mut(key) else {
        return Ok(Outcome::Bool(false));
    };
    if !change {
        return Ok(Outcome::Bool(field == literal));
    }
    match literal {
        Value::String(_) => {
            *field = literal.clone();
            Ok(Outcome::Bool(true))
        }
        other => Err(invalid(format!("cannot set {} to {}", key, other))),
    }
}

fn has_extra(obj: &Map<String, Value>, key: &str) -> bool {
    matches!(obj.get(EXTRA_FIELDS), Some(Value::Object(extra)) if extra.contains_key(key))
}

/// Sets `key` in the `ExtraFields` map of `obj`, creating the map when missing
fn insert_extra(obj: &mut Map<String, Value>, key: &str, value: Value) {
    match obj.get_mut(EXTRA_FIELDS) {
        Some(Value::Object(extra)) => {
            extra.insert(key.to_string(), value);
        }
        _ => {
            let mut extra = Map::new();
            extra.insert(key.to_string(), value);
            obj.insert(EXTRA_FIELDS.to_string(), Value::Object(extra));
        }
    }
}

fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s.trim())
            .ok()
            .or_else(|| Decimal::from_scientific(s.trim()).ok()),
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s)
                .ok()
                .or_else(|| Decimal::from_scientific(&s).ok())
        }
        _ => None,
    }
}

fn as_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn values_equal(field: &Value, literal: &Value) -> bool {
    if field == literal {
        return true;
    }
    match (field, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(_), Value::Number(_)) => {
            matches!((as_decimal(field), as_decimal(literal)), (Some(a), Some(b)) if a == b)
        }
        _ => false,
    }
}

/// Orders a field against an operand following the field's type:
/// numbers against numbers, durations (integer nanoseconds) against duration
/// strings, decimals against decimals and timestamps against time strings.
fn compare(field: &Value, operand: &Value) -> AppResult<Ordering> {
    match (field, operand) {
        (Value::Number(f), Value::Number(o)) => {
            let (f, o) = (f.as_f64().unwrap_or(0.0), o.as_f64().unwrap_or(0.0));
            f.partial_cmp(&o).ok_or_else(|| invalid(operand))
        }
        (Value::Number(f), Value::String(o)) => {
            let d = parse_duration(o)?;
            let f = f.as_i64().ok_or_else(|| invalid(operand))?;
            Ok(f.cmp(&crate::utils::time::nanos(d)))
        }
        (Value::String(_), _) => {
            if let (Some(f), Some(o)) = (as_decimal(field), as_decimal(operand)) {
                return Ok(f.cmp(&o));
            }
            if let (Some(f), Value::String(o)) = (as_time(field), operand) {
                let o = parse_time(o)?;
                return Ok(f.cmp(&o));
            }
            Err(invalid(operand))
        }
        _ => Err(invalid(operand)),
    }
}

fn pair(value: &Value) -> AppResult<(&str, &str)> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(a), Value::String(b)]) => Ok((a, b)),
        _ => Err(invalid(value)),
    }
}

fn expand(re: &Regex, template: &str, field: &str) -> Option<String> {
    let caps = re.captures(field)?;
    let mut out = String::new();
    caps.expand(template, &mut out);
    Some(out)
}

fn apply_operator(
    op: Op,
    field: &Value,
    value: &Value,
    regex: Option<&Regex>,
) -> AppResult<Outcome> {
    let verdict = |b: bool| Ok(Outcome::Bool(b));
    match op {
        Op::Eq => verdict(values_equal(field, value)),
        Op::Set => Ok(Outcome::Write(value.clone())),
        Op::Usr => {
            let current = field.as_str();
            let gate = matches!(current, Some(USERS) | Some("")) || field == value;
            if gate {
                Ok(Outcome::Write(value.clone()))
            } else {
                verdict(false)
            }
        }
        Op::Empty => {
            let want = value.as_bool().ok_or_else(|| invalid(value))?;
            let empty = match field {
                Value::Null => true,
                Value::String(s) => {
                    s.trim().is_empty() || as_decimal(field).is_some_and(|d| d.is_zero())
                }
                Value::Object(m) => m.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Number(n) => n.as_f64() == Some(0.0),
                Value::Bool(_) => return verdict(false),
            };
            verdict(empty == want)
        }
        Op::Rpl => {
            let s = field.as_str().ok_or_else(|| invalid(field))?;
            let (search, replace) = pair(value)?;
            if search != ANY && !search.is_empty() && s != search {
                return verdict(false);
            }
            Ok(Outcome::Write(Value::String(replace.to_string())))
        }
        Op::Gt => verdict(compare(field, value)? == Ordering::Greater),
        Op::Gte => verdict(compare(field, value)? != Ordering::Less),
        Op::Lt => verdict(compare(field, value)? == Ordering::Less),
        Op::Lte => verdict(compare(field, value)? != Ordering::Greater),
        Op::Btw => match value.as_array().map(Vec::as_slice) {
            Some([low, high]) => verdict(
                compare(field, low)? != Ordering::Less && compare(field, high)? == Ordering::Less,
            ),
            _ => Err(invalid(value)),
        },
        Op::Exp => {
            let expired = value.as_bool().ok_or_else(|| invalid(value))?;
            let at = match field {
                Value::Null => None,
                other => Some(as_time(other).ok_or_else(|| invalid(other))?),
            };
            let at = at.filter(|t| !crate::utils::time::is_zero_time(t));
            let now = Utc::now();
            if expired {
                verdict(at.is_some_and(|t| t < now))
            } else {
                verdict(at.map_or(true, |t| t > now))
            }
        }
        Op::Sw | Op::Ew => {
            let s = field.as_str().ok_or_else(|| invalid(field))?;
            let v = value.as_str().ok_or_else(|| invalid(value))?;
            verdict(if op == Op::Sw {
                s.starts_with(v)
            } else {
                s.ends_with(v)
            })
        }
        Op::Re => {
            let s = field.as_str().ok_or_else(|| invalid(field))?;
            verdict(regex.is_some_and(|re| re.is_match(s)))
        }
        Op::Has => {
            let wanted = value.as_array().ok_or_else(|| invalid(value))?;
            let ok = wanted.iter().all(|w| {
                let Some(w) = w.as_str() else { return false };
                match field {
                    Value::Object(m) => m.get(w).and_then(Value::as_bool).unwrap_or(false),
                    Value::Array(items) => items.iter().any(|i| i.as_str() == Some(w)),
                    _ => true,
                }
            });
            verdict(ok)
        }
        Op::In => {
            let allowed = value.as_array().ok_or_else(|| invalid(value))?;
            let ok = match field {
                Value::Array(items) => items.iter().all(|i| allowed.contains(i)),
                Value::Object(m) => m
                    .keys()
                    .all(|k| allowed.iter().any(|a| a.as_str() == Some(k.as_str()))),
                scalar => allowed.iter().any(|a| values_equal(scalar, a)),
            };
            verdict(ok)
        }
        Op::Crepl | Op::Repl | Op::Usrpl => {
            let s = field.as_str().ok_or_else(|| invalid(field))?;
            let (_, template) = pair(value)?;
            let Some(re) = regex else {
                return Err(invalid(value));
            };
            match expand(re, template, s) {
                Some(out) => Ok(Outcome::Write(Value::String(out))),
                None if op == Op::Repl => Ok(Outcome::Write(Value::String(s.to_string()))),
                None => verdict(false),
            }
        }
    }
}
