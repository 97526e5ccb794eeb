// Default Value Evaluation
//
// The DDL engine only needs one thing from the expression layer: turning a
// column's default expression into a typed value when a row has to be
// filled in, either by a foreground write or by the backfill worker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{DataType, DataValue};

/// Errors raised while evaluating or coercing a default value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Numeric overflow")]
    NumericOverflow,
    #[error("Type mismatch: cannot apply {op} to {left} and {right}")]
    TypeMismatch { op: String, left: String, right: String },
    #[error("Cannot convert {value} to {target}")]
    Conversion { value: String, target: DataType },
}

/// Result type for evaluation
pub type Result<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// A default-value expression as handed over by the parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(DataValue),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<DataValue>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }
}

/// Evaluates default expressions. Implementations must be stateless or
/// internally synchronized; the backfill worker may call them from several
/// threads.
pub trait Evaluator: Send + Sync {
    fn eval(&self, expr: &Expr) -> Result<DataValue>;
}

/// Evaluator for constant expressions: literals, negation and arithmetic
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstEvaluator;

impl Evaluator for ConstEvaluator {
    fn eval(&self, expr: &Expr) -> Result<DataValue> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Negate(inner) => match self.eval(inner)? {
                DataValue::Null => Ok(DataValue::Null),
                DataValue::Integer(i) => i.checked_neg().map(DataValue::Integer).ok_or(EvalError::NumericOverflow),
                DataValue::Float(f) => Ok(DataValue::Float(-f)),
                other => Err(EvalError::TypeMismatch {
                    op: "-".to_string(),
                    left: other.to_string(),
                    right: String::new(),
                }),
            },
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                eval_binary(*op, l, r)
            }
        }
    }
}

fn eval_binary(op: BinaryOp, l: DataValue, r: DataValue) -> Result<DataValue> {
    match (l, r) {
        (DataValue::Null, _) | (_, DataValue::Null) => Ok(DataValue::Null),
        (DataValue::Integer(a), DataValue::Integer(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide => {
                    if b == 0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
            };
            result.map(DataValue::Integer).ok_or(EvalError::NumericOverflow)
        }
        (DataValue::Integer(a), DataValue::Float(b)) => eval_float(op, a as f64, b),
        (DataValue::Float(a), DataValue::Integer(b)) => eval_float(op, a, b as f64),
        (DataValue::Float(a), DataValue::Float(b)) => eval_float(op, a, b),
        (DataValue::Text(a), DataValue::Text(b)) if op == BinaryOp::Add => Ok(DataValue::Text(a + &b)),
        (l, r) => Err(EvalError::TypeMismatch {
            op: op.symbol().to_string(),
            left: l.to_string(),
            right: r.to_string(),
        }),
    }
}

fn eval_float(op: BinaryOp, a: f64, b: f64) -> Result<DataValue> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
    };
    Ok(DataValue::Float(result))
}

/// Convert `value` to the column type `target`
pub fn coerce(value: DataValue, target: DataType) -> Result<DataValue> {
    let conversion_error = |v: &DataValue| EvalError::Conversion { value: v.to_string(), target };
    match (&value, target) {
        (DataValue::Null, _) => Ok(value),
        (DataValue::Integer(_), DataType::Integer)
        | (DataValue::Float(_), DataType::Float)
        | (DataValue::Text(_), DataType::Text)
        | (DataValue::Boolean(_), DataType::Boolean) => Ok(value),
        (DataValue::Integer(i), DataType::Float) => Ok(DataValue::Float(*i as f64)),
        (DataValue::Float(f), DataType::Integer) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                Ok(DataValue::Integer(*f as i64))
            } else {
                Err(conversion_error(&value))
            }
        }
        (DataValue::Integer(i), DataType::Boolean) if *i == 0 || *i == 1 => Ok(DataValue::Boolean(*i == 1)),
        (DataValue::Boolean(b), DataType::Integer) => Ok(DataValue::Integer(*b as i64)),
        (DataValue::Integer(i), DataType::Text) => Ok(DataValue::Text(i.to_string())),
        (DataValue::Float(f), DataType::Text) => Ok(DataValue::Text(f.to_string())),
        (DataValue::Boolean(b), DataType::Text) => Ok(DataValue::Text(b.to_string())),
        (DataValue::Text(s), DataType::Integer) => s.trim().parse::<i64>().map(DataValue::Integer).map_err(|_| conversion_error(&value)),
        (DataValue::Text(s), DataType::Float) => s.trim().parse::<f64>().map(DataValue::Float).map_err(|_| conversion_error(&value)),
        _ => Err(conversion_error(&value)),
    }
}
