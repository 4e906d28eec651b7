use crate::expr::{BinOp, Expr, Program, UnOp};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Evaluation errors. Header/query directives treat these as soft
/// (log-and-skip); body expressions treat them as hard failures.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{0} takes {1} argument(s)")]
    BadArity(&'static str, usize),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivByZero,

    #[error("evaluation budget exhausted")]
    BudgetExhausted,

    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
}

/// Hard caps applied to every evaluation. Expressions are pure and
/// non-recursive, so these only trip on pathological inputs.
#[derive(Debug, Clone, Copy)]
pub struct EvalLimits {
    pub max_ops: u64,
    pub deadline: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_ops: 100_000,
            deadline: Duration::from_millis(10),
        }
    }
}

/// Variable bindings for one evaluation: `req`, `resp`, `user`, `key`,
/// `plan`, `captures`, `env`, plus `reqBody`/`respBody` for body
/// expressions. The wall clock is captured once at scope construction so
/// `now()` is stable across all expressions of a single request.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
    now_unix: f64,
}

impl Scope {
    pub fn new(now_unix: f64) -> Self {
        Self {
            vars: BTreeMap::new(),
            now_unix,
        }
    }

    pub fn bind(&mut self, name: &str, value: Value) -> &mut Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn now_unix(&self) -> f64 {
        self.now_unix
    }
}

/// Evaluate a program against a scope.
pub fn eval(program: &Program, scope: &Scope, limits: EvalLimits) -> Result<Value, EvalError> {
    let mut interp = Interp {
        scope,
        ops_left: limits.max_ops,
        started: Instant::now(),
        deadline: limits.deadline,
    };
    interp.eval_expr(program.expr())
}

struct Interp<'a> {
    scope: &'a Scope,
    ops_left: u64,
    started: Instant,
    deadline: Duration,
}

impl Interp<'_> {
    fn tick(&mut self) -> Result<(), EvalError> {
        if self.ops_left == 0 {
            return Err(EvalError::BudgetExhausted);
        }
        self.ops_left -= 1;
        // Clock checks are amortized: one Instant read per 256 ops.
        if self.ops_left % 256 == 0 && self.started.elapsed() > self.deadline {
            return Err(EvalError::DeadlineExceeded);
        }
        Ok(())
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.tick()?;
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => num(*n),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (k, v) in fields {
                    map.insert(k.clone(), self.eval_expr(v)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Var(name) => self
                .scope
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
            Expr::Field(base, name) => {
                let base = self.eval_expr(base)?;
                match base {
                    Value::Object(map) => map
                        .get(name)
                        .cloned()
                        .ok_or_else(|| EvalError::UnknownField(name.clone())),
                    other => Err(EvalError::Type(format!(
                        "cannot access field '{}' on {}",
                        name,
                        type_name(&other)
                    ))),
                }
            }
            Expr::Index(base, idx) => {
                let base = self.eval_expr(base)?;
                let idx = self.eval_expr(idx)?;
                match (&base, &idx) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n.as_f64().unwrap_or(-1.0);
                        if i < 0.0 || i.fract() != 0.0 || i as usize >= items.len() {
                            return Err(EvalError::Type(format!(
                                "index {} out of bounds for array of {}",
                                i,
                                items.len()
                            )));
                        }
                        Ok(items[i as usize].clone())
                    }
                    (Value::Object(map), Value::String(k)) => map
                        .get(k)
                        .cloned()
                        .ok_or_else(|| EvalError::UnknownField(k.clone())),
                    _ => Err(EvalError::Type(format!(
                        "cannot index {} with {}",
                        type_name(&base),
                        type_name(&idx)
                    ))),
                }
            }
            Expr::Unary(op, inner) => {
                let v = self.eval_expr(inner)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnOp::Neg => num(-as_number(&v)?),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs),
            Expr::Ternary(cond, then, other) => {
                let c = self.eval_expr(cond)?;
                if truthy(&c) {
                    self.eval_expr(then)
                } else {
                    self.eval_expr(other)
                }
            }
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalError> {
        // Short-circuit forms first
        match op {
            BinOp::And => {
                let l = self.eval_expr(lhs)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval_expr(rhs)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            BinOp::Or => {
                let l = self.eval_expr(lhs)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval_expr(rhs)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            _ => {}
        }

        let l = self.eval_expr(lhs)?;
        let r = self.eval_expr(rhs)?;
        match op {
            BinOp::Add => {
                if l.is_string() || r.is_string() {
                    Ok(Value::String(format!("{}{}", to_display(&l), to_display(&r))))
                } else {
                    num(as_number(&l)? + as_number(&r)?)
                }
            }
            BinOp::Sub => num(as_number(&l)? - as_number(&r)?),
            BinOp::Mul => num(as_number(&l)? * as_number(&r)?),
            BinOp::Div => {
                let d = as_number(&r)?;
                if d == 0.0 {
                    return Err(EvalError::DivByZero);
                }
                num(as_number(&l)? / d)
            }
            BinOp::Mod => {
                let d = as_number(&r)?;
                if d == 0.0 {
                    return Err(EvalError::DivByZero);
                }
                num(as_number(&l)? % d)
            }
            BinOp::Eq => Ok(Value::Bool(value_eq(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!value_eq(&l, &r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = compare(&l, &r)?;
                let pass = match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(pass))
            }
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let mut vals = Vec::with_capacity(args.len());
        for arg in args {
            vals.push(self.eval_expr(arg)?);
        }

        match name {
            "upper" => Ok(Value::String(str_arg("upper", &vals, 0, 1)?.to_uppercase())),
            "lower" => Ok(Value::String(str_arg("lower", &vals, 0, 1)?.to_lowercase())),
            "trim" => Ok(Value::String(str_arg("trim", &vals, 0, 1)?.trim().to_string())),
            "len" => {
                arity("len", &vals, 1)?;
                let n = match &vals[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    other => {
                        return Err(EvalError::Type(format!(
                            "len expects string, array or object, got {}",
                            type_name(other)
                        )));
                    }
                };
                num(n as f64)
            }
            "substr" => {
                arity("substr", &vals, 3)?;
                let s = str_arg("substr", &vals, 0, 3)?;
                let start = as_number(&vals[1])?.max(0.0) as usize;
                let count = as_number(&vals[2])?.max(0.0) as usize;
                Ok(Value::String(s.chars().skip(start).take(count).collect()))
            }
            "replace" => {
                arity("replace", &vals, 3)?;
                let s = str_arg("replace", &vals, 0, 3)?;
                let from = str_arg("replace", &vals, 1, 3)?;
                let to = str_arg("replace", &vals, 2, 3)?;
                Ok(Value::String(s.replace(&from, &to)))
            }
            "contains" => {
                arity("contains", &vals, 2)?;
                match &vals[0] {
                    Value::String(s) => {
                        let needle = str_arg("contains", &vals, 1, 2)?;
                        Ok(Value::Bool(s.contains(&needle)))
                    }
                    Value::Array(items) => Ok(Value::Bool(
                        items.iter().any(|item| value_eq(item, &vals[1])),
                    )),
                    other => Err(EvalError::Type(format!(
                        "contains expects string or array, got {}",
                        type_name(other)
                    ))),
                }
            }
            "split" => {
                arity("split", &vals, 2)?;
                let s = str_arg("split", &vals, 0, 2)?;
                let sep = str_arg("split", &vals, 1, 2)?;
                Ok(Value::Array(
                    s.split(sep.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                ))
            }
            "join" => {
                arity("join", &vals, 2)?;
                let items = match &vals[0] {
                    Value::Array(a) => a,
                    other => {
                        return Err(EvalError::Type(format!(
                            "join expects an array, got {}",
                            type_name(other)
                        )));
                    }
                };
                let sep = str_arg("join", &vals, 1, 2)?;
                let parts: Vec<String> = items.iter().map(to_display).collect();
                Ok(Value::String(parts.join(&sep)))
            }
            "base64_encode" => {
                let s = str_arg("base64_encode", &vals, 0, 1)?;
                Ok(Value::String(BASE64.encode(s.as_bytes())))
            }
            "base64_decode" => {
                let s = str_arg("base64_decode", &vals, 0, 1)?;
                let bytes = BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| EvalError::Type(format!("invalid base64: {}", e)))?;
                let decoded = String::from_utf8(bytes)
                    .map_err(|_| EvalError::Type("decoded base64 is not UTF-8".into()))?;
                Ok(Value::String(decoded))
            }
            "json_encode" => {
                arity("json_encode", &vals, 1)?;
                serde_json::to_string(&vals[0])
                    .map(Value::String)
                    .map_err(|e| EvalError::Type(e.to_string()))
            }
            "to_string" => {
                arity("to_string", &vals, 1)?;
                Ok(Value::String(to_display(&vals[0])))
            }
            "to_number" => {
                arity("to_number", &vals, 1)?;
                let n = match &vals[0] {
                    Value::Number(n) => n.as_f64().unwrap_or(0.0),
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| EvalError::Type(format!("'{}' is not a number", s)))?,
                    Value::Bool(b) => {
                        if *b {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    other => {
                        return Err(EvalError::Type(format!(
                            "cannot convert {} to a number",
                            type_name(other)
                        )));
                    }
                };
                num(n)
            }
            "now" => {
                arity("now", &vals, 0)?;
                num(self.scope.now_unix())
            }
            other => Err(EvalError::UnknownFunction(other.to_string())),
        }
    }
}

// ── Value helpers ────────────────────────────────────────────

fn num(n: f64) -> Result<Value, EvalError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type("non-finite number".into()))
}

fn as_number(v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        other => Err(EvalError::Type(format!(
            "expected a number, got {}",
            type_name(other)
        ))),
    }
}

fn str_arg(name: &'static str, vals: &[Value], idx: usize, want: usize) -> Result<String, EvalError> {
    if vals.len() != want {
        return Err(EvalError::BadArity(name, want));
    }
    match &vals[idx] {
        Value::String(s) => Ok(s.clone()),
        other => Err(EvalError::Type(format!(
            "{} expects a string, got {}",
            name,
            type_name(other)
        ))),
    }
}

fn arity(name: &'static str, vals: &[Value], want: usize) -> Result<(), EvalError> {
    if vals.len() != want {
        return Err(EvalError::BadArity(name, want));
    }
    Ok(())
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn value_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("numbers are not comparable".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::Type(format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a value the way header/query directives expect: strings verbatim,
/// whole numbers without a trailing `.0`, null as the empty string,
/// composites as JSON.
pub fn to_display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                format!("{}", f as i64)
            } else {
                f.to_string()
            }
        }
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(v).unwrap_or_default(),
    }
}
