//! Cell payloads and their numeric semantics.
//!
//! Integers and decimals are distinct: arithmetic and aggregation never widen
//! one into the other. Comparison is the only place the two meet.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};

/// Declared type of a physical field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Integer,
    Decimal,
    Text,
    Boolean,
}

/// A single cell payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

impl Scalar {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DataType::Boolean),
            Self::Int(_) => Some(DataType::Integer),
            Self::Decimal(_) => Some(DataType::Decimal),
            Self::Text(_) => Some(DataType::Text),
        }
    }

    /// Whether this payload may be stored in a field of `ty`.
    pub fn conforms_to(&self, ty: DataType) -> bool {
        self.data_type().map_or(true, |t| t == ty)
    }

    /// Predicate truthiness: only `Bool(true)` keeps a row, null drops it.
    pub fn truthy(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Null => Ok(false),
            other => Err(LineageError::TypeMismatch(format!(
                "predicate produced {other}, expected boolean"
            ))),
        }
    }

    /// Coerce a raw source value into the declared field type.
    pub fn coerce_json(raw: &serde_json::Value, ty: DataType) -> Result<Self> {
        use serde_json::Value as J;

        let mismatch = || {
            LineageError::TypeMismatch(format!("cannot read {raw} as {ty}"))
        };
        match (raw, ty) {
            (J::Null, _) => Ok(Self::Null),
            (J::Bool(b), DataType::Boolean) => Ok(Self::Bool(*b)),
            (J::Number(n), DataType::Integer) => n.as_i64().map(Self::Int).ok_or_else(mismatch),
            (J::String(s), DataType::Integer) => {
                s.trim().parse().map(Self::Int).map_err(|_| mismatch())
            }
            (J::Number(n), DataType::Decimal) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(Self::Decimal)
                .map_err(|_| mismatch()),
            (J::String(s), DataType::Decimal) => Decimal::from_str(s.trim())
                .map(Self::Decimal)
                .map_err(|_| mismatch()),
            (J::String(s), DataType::Text) => Ok(Self::Text(s.clone())),
            (J::Number(n), DataType::Text) => Ok(Self::Text(n.to_string())),
            _ => Err(mismatch()),
        }
    }

    /// Plain JSON rendering for result sets.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Decimal(d) => serde_json::Value::String(d.normalize().to_string()),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Three-valued comparison. `None` when either side is null.
    ///
    /// Integer and decimal operands compare numerically; any other mix is an error.
    pub fn compare(&self, other: &Scalar) -> Result<Option<Ordering>> {
        let ord = match (self, other) {
            (Self::Null, _) | (_, Self::Null) => return Ok(None),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => a.cmp(b),
            (Self::Int(a), Self::Decimal(b)) => Decimal::from(*a).cmp(b),
            (Self::Decimal(a), Self::Int(b)) => a.cmp(&Decimal::from(*b)),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (a, b) => {
                return Err(LineageError::TypeMismatch(format!(
                    "cannot compare {a} with {b}"
                )))
            }
        };
        Ok(Some(ord))
    }

    /// Same-type arithmetic. Null propagates; int/decimal mixing is rejected.
    pub fn arith(&self, op: ArithOp, other: &Scalar) -> Result<Scalar> {
        let overflow = || LineageError::NumericOverflow(format!("{self} {} {other}", op.symbol()));
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => Ok(Self::Null),
            (Self::Int(a), Self::Int(b)) => {
                let out = match op {
                    ArithOp::Add => a.checked_add(*b),
                    ArithOp::Sub => a.checked_sub(*b),
                    ArithOp::Mul => a.checked_mul(*b),
                    ArithOp::Div => {
                        if *b == 0 {
                            return Err(LineageError::DivisionByZero);
                        }
                        a.checked_div(*b)
                    }
                };
                out.map(Self::Int).ok_or_else(overflow)
            }
            (Self::Decimal(a), Self::Decimal(b)) => {
                let out = match op {
                    ArithOp::Add => a.checked_add(*b),
                    ArithOp::Sub => a.checked_sub(*b),
                    ArithOp::Mul => a.checked_mul(*b),
                    ArithOp::Div => {
                        if b.is_zero() {
                            return Err(LineageError::DivisionByZero);
                        }
                        a.checked_div(*b)
                    }
                };
                out.map(Self::Decimal).ok_or_else(overflow)
            }
            (a, b) => Err(LineageError::TypeMismatch(format!(
                "cannot apply {} to {a} and {b}",
                op.symbol()
            ))),
        }
    }

    pub fn negate(&self) -> Result<Scalar> {
        match self {
            Self::Null => Ok(Self::Null),
            Self::Int(i) => i
                .checked_neg()
                .map(Self::Int)
                .ok_or_else(|| LineageError::NumericOverflow(format!("-{i}"))),
            Self::Decimal(d) => Ok(Self::Decimal(-*d)),
            other => Err(LineageError::TypeMismatch(format!("cannot negate {other}"))),
        }
    }

    /// Decimal view of a numeric payload, used by averaging.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(i) => Some(Decimal::from(*i)),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Decimal> for Scalar {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_by_declared_type() {
        assert_eq!(
            Scalar::coerce_json(&json!(10), DataType::Integer).unwrap(),
            Scalar::Int(10)
        );
        assert_eq!(
            Scalar::coerce_json(&json!("10.50"), DataType::Decimal).unwrap(),
            Scalar::Decimal(Decimal::new(1050, 2))
        );
        assert_eq!(
            Scalar::coerce_json(&json!(7.25), DataType::Decimal).unwrap(),
            Scalar::Decimal(Decimal::new(725, 2))
        );
        assert_eq!(
            Scalar::coerce_json(&json!(null), DataType::Text).unwrap(),
            Scalar::Null
        );
        assert!(Scalar::coerce_json(&json!("abc"), DataType::Integer).is_err());
        assert!(Scalar::coerce_json(&json!(true), DataType::Decimal).is_err());
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let out = Scalar::Int(10).arith(ArithOp::Add, &Scalar::Int(5)).unwrap();
        assert_eq!(out, Scalar::Int(15));
    }

    #[test]
    fn mixing_int_and_decimal_is_rejected() {
        let err = Scalar::Int(1)
            .arith(ArithOp::Add, &Scalar::Decimal(Decimal::ONE))
            .unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
    }

    #[test]
    fn overflow_is_reported() {
        let err = Scalar::Int(i64::MAX)
            .arith(ArithOp::Add, &Scalar::Int(1))
            .unwrap_err();
        assert_eq!(err.code(), "numeric_overflow");
    }

    #[test]
    fn division_by_zero() {
        assert!(matches!(
            Scalar::Int(1).arith(ArithOp::Div, &Scalar::Int(0)),
            Err(LineageError::DivisionByZero)
        ));
    }

    #[test]
    fn null_propagates_and_compares_unknown() {
        assert_eq!(
            Scalar::Null.arith(ArithOp::Mul, &Scalar::Int(3)).unwrap(),
            Scalar::Null
        );
        assert_eq!(Scalar::Null.compare(&Scalar::Int(3)).unwrap(), None);
    }

    #[test]
    fn numeric_comparison_across_int_and_decimal() {
        let ord = Scalar::Int(2)
            .compare(&Scalar::Decimal(Decimal::new(15, 1)))
            .unwrap();
        assert_eq!(ord, Some(Ordering::Greater));
        assert!(Scalar::Int(1).compare(&Scalar::text("1")).is_err());
    }

    #[test]
    fn decimal_equality_ignores_scale() {
        assert_eq!(
            Scalar::Decimal(Decimal::new(10, 1)),
            Scalar::Decimal(Decimal::new(100, 2))
        );
    }

    #[test]
    fn truthiness() {
        assert!(Scalar::Bool(true).truthy().unwrap());
        assert!(!Scalar::Null.truthy().unwrap());
        assert!(Scalar::Int(1).truthy().is_err());
    }

    #[test]
    fn externally_tagged_serde() {
        let json = serde_json::to_value(Scalar::Int(3)).unwrap();
        assert_eq!(json, json!({"int": 3}));
        let back: Scalar = serde_json::from_value(json!({"text": "USD"})).unwrap();
        assert_eq!(back, Scalar::text("USD"));
        let null: Scalar = serde_json::from_value(json!("null")).unwrap();
        assert_eq!(null, Scalar::Null);
    }
}
