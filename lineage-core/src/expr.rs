//! Function expression trees, supplied as data.

use serde::{Deserialize, Serialize};

use crate::value::Scalar;

/// `(table, column)` parameter resolved against the current row scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnParam {
    pub table: String,
    pub column: String,
}

impl ColumnParam {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl std::fmt::Display for ColumnParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// `(cube, column)` parameter that may not exist in the schema snapshot yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeculativeParam {
    pub cube: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Scalar),
    Column(ColumnParam),
    Speculative(SpeculativeParam),
    /// Hierarchy membership: is `of` equal to or below `member` in `hierarchy`.
    Member {
        hierarchy: String,
        member: String,
        of: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Aggregate over the current group-by partition. `count` without an
    /// argument counts rows.
    Aggregate {
        func: AggregateFn,
        #[serde(default)]
        arg: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn lit(v: Scalar) -> Self {
        Self::Literal(v)
    }

    pub fn int(v: i64) -> Self {
        Self::Literal(Scalar::Int(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        Self::Literal(Scalar::Text(v.into()))
    }

    pub fn col(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Column(ColumnParam::new(table, column))
    }

    pub fn speculative(cube: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Speculative(SpeculativeParam {
            cube: cube.into(),
            column: column.into(),
        })
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn aggregate(func: AggregateFn, arg: Expr) -> Self {
        Self::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        }
    }

    pub fn count_rows() -> Self {
        Self::Aggregate {
            func: AggregateFn::Count,
            arg: None,
        }
    }

    pub fn member(hierarchy: impl Into<String>, member: impl Into<String>, of: Expr) -> Self {
        Self::Member {
            hierarchy: hierarchy.into(),
            member: member.into(),
            of: Box::new(of),
        }
    }

    /// Number of column and speculative parameter leaves.
    pub fn parameter_count(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |e| {
            if matches!(e, Expr::Column(_) | Expr::Speculative(_)) {
                n += 1;
            }
        });
        n
    }

    /// Plain column parameters, in tree order, without duplicates.
    pub fn column_params(&self) -> Vec<&ColumnParam> {
        let mut out: Vec<&ColumnParam> = Vec::new();
        self.visit_ref(&mut |e| {
            if let Expr::Column(p) = e {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        });
        out
    }

    pub fn speculative_params(&self) -> Vec<&SpeculativeParam> {
        let mut out: Vec<&SpeculativeParam> = Vec::new();
        self.visit_ref(&mut |e| {
            if let Expr::Speculative(p) = e {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        });
        out
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Aggregate { .. }));
        found
    }

    fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        self.visit_ref(&mut |e| f(e));
    }

    fn visit_ref<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Column(_) | Expr::Speculative(_) => {}
            Expr::Member { of, .. } => of.visit_ref(f),
            Expr::Unary { arg, .. } => arg.visit_ref(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_ref(f);
                rhs.visit_ref(f);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.visit_ref(f);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.visit_ref(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_and_column_collection() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::col("loans", "amt"),
            Expr::binary(BinaryOp::Mul, Expr::col("loans", "amt"), Expr::int(2)),
        );
        assert_eq!(e.parameter_count(), 2);
        assert_eq!(e.column_params(), vec![&ColumnParam::new("loans", "amt")]);
        assert!(!e.contains_aggregate());
    }

    #[test]
    fn constants_have_no_parameters() {
        assert_eq!(Expr::int(1).parameter_count(), 0);
        assert_eq!(Expr::count_rows().parameter_count(), 0);
        assert!(Expr::count_rows().contains_aggregate());
    }

    #[test]
    fn yaml_shape() {
        let yaml = r#"
binary:
  op: gt
  lhs:
    column: { table: src, column: a }
  rhs:
    literal: { int: 1 }
"#;
        let e: Expr = crate::definition::from_yaml(yaml).unwrap();
        assert_eq!(
            e,
            Expr::binary(BinaryOp::Gt, Expr::col("src", "a"), Expr::int(1))
        );
    }

    #[test]
    fn speculative_params_are_separate() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::speculative("F_01", "NEW_COL"),
            Expr::col("t", "c"),
        );
        assert_eq!(e.speculative_params().len(), 1);
        assert_eq!(e.column_params().len(), 1);
        assert_eq!(e.parameter_count(), 2);
    }
}
