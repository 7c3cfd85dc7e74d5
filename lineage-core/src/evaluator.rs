//! Expression evaluation with per-value lineage capture.
//!
//! Every column the expression reads contributes its value entity to the
//! result's `sources`, once, in first-consulted order. Both operands of a
//! boolean operator are always evaluated so that lineage does not depend on
//! short-circuiting.

use std::collections::HashSet;

use crate::builtins::BuiltinRegistry;
use crate::error::{LineageError, Result};
use crate::expr::{AggregateFn, BinaryOp, ColumnParam, Expr, UnaryOp};
use crate::ids::EntityId;
use crate::reference::EntityRef;
use crate::row_creation::{Lookup, Scope};
use crate::schema::MetaDataTrail;
use crate::value::{ArithOp, DataType, Scalar};

/// Outcome of evaluating one expression in one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub value: Scalar,
    /// Consulted value entities, deduplicated, in first-consulted order.
    pub sources: Vec<EntityRef>,
    /// At least one lookup landed in a null-extended join slot.
    pub null_extended: bool,
}

#[derive(Default)]
struct Consulted {
    sources: Vec<EntityRef>,
    seen: HashSet<EntityId>,
    null_extended: bool,
}

impl Consulted {
    fn record(&mut self, lookup: Lookup<'_>) -> Scalar {
        match lookup {
            Lookup::Cell(cell) => {
                if self.seen.insert(cell.value.id) {
                    self.sources.push(cell.value);
                }
                cell.payload.clone()
            }
            Lookup::NullExtended => {
                self.null_extended = true;
                Scalar::Null
            }
        }
    }
}

pub struct FunctionEvaluator<'a> {
    schema: &'a MetaDataTrail,
    builtins: &'a BuiltinRegistry,
}

impl<'a> FunctionEvaluator<'a> {
    pub fn new(schema: &'a MetaDataTrail, builtins: &'a BuiltinRegistry) -> Self {
        Self { schema, builtins }
    }

    pub fn evaluate(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Evaluated> {
        let mut consulted = Consulted::default();
        let value = self.eval(expr, scope, &mut consulted)?;
        Ok(Evaluated {
            value,
            sources: consulted.sources,
            null_extended: consulted.null_extended,
        })
    }

    fn eval(&self, expr: &Expr, scope: &Scope<'_>, acc: &mut Consulted) -> Result<Scalar> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Column(param) => self.column(param, scope, acc),
            Expr::Speculative(p) => {
                if !self.schema.has_column(&p.cube, &p.column) {
                    return Err(LineageError::UnresolvedSpeculativeReference {
                        cube: p.cube.clone(),
                        column: p.column.clone(),
                    });
                }
                self.column(&ColumnParam::new(p.cube.clone(), p.column.clone()), scope, acc)
            }
            Expr::Member {
                hierarchy,
                member,
                of,
            } => {
                let h = self.schema.hierarchy(hierarchy)?;
                match self.eval(of, scope, acc)? {
                    Scalar::Null => Ok(Scalar::Null),
                    Scalar::Text(s) => Ok(Scalar::Bool(h.is_member(&s, member))),
                    other => Err(LineageError::TypeMismatch(format!(
                        "MEMBER test on {other}, expected text"
                    ))),
                }
            }
            Expr::Unary { op, arg } => {
                let v = self.eval(arg, scope, acc)?;
                match op {
                    UnaryOp::IsNull => Ok(Scalar::Bool(v.is_null())),
                    UnaryOp::Neg => v.negate(),
                    UnaryOp::Not => Ok(match logic(&v)? {
                        Some(b) => Scalar::Bool(!b),
                        None => Scalar::Null,
                    }),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, scope, acc)?;
                let r = self.eval(rhs, scope, acc)?;
                binary(*op, &l, &r)
            }
            Expr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, scope, acc))
                    .collect::<Result<Vec<_>>>()?;
                self.builtins.call(function, &args)
            }
            Expr::Aggregate { func, arg } => {
                let partition = scope.partition();
                let Some(arg) = arg else {
                    return match func {
                        AggregateFn::Count => Ok(Scalar::Int(partition.len() as i64)),
                        other => Err(LineageError::InvalidDefinition(format!(
                            "{other} requires an argument"
                        ))),
                    };
                };
                let mut values = Vec::with_capacity(partition.len());
                for binding in partition {
                    let row_scope = Scope::Row(binding.clone());
                    values.push(self.eval(arg, &row_scope, acc)?);
                }
                aggregate(*func, &values)
            }
        }
    }

    fn column(&self, param: &ColumnParam, scope: &Scope<'_>, acc: &mut Consulted) -> Result<Scalar> {
        match scope {
            Scope::Row(binding) => Ok(acc.record(binding.lookup(&param.table, &param.column)?)),
            Scope::Group {
                key,
                group_by,
                members,
            } => {
                let Some(pos) = group_by.iter().position(|g| g == param) else {
                    return Err(LineageError::InvalidDefinition(format!(
                        "column {param} must be grouped or aggregated"
                    )));
                };
                // A group key stands for the same cell of every member row.
                for member in members {
                    acc.record(member.lookup(&param.table, &param.column)?);
                }
                Ok(key[pos].clone())
            }
        }
    }
}

/// Three-valued boolean view: `None` is unknown.
fn logic(v: &Scalar) -> Result<Option<bool>> {
    match v {
        Scalar::Null => Ok(None),
        Scalar::Bool(b) => Ok(Some(*b)),
        other => Err(LineageError::TypeMismatch(format!(
            "{other} used as a boolean"
        ))),
    }
}

fn binary(op: BinaryOp, l: &Scalar, r: &Scalar) -> Result<Scalar> {
    use std::cmp::Ordering::*;

    let cmp = |test: fn(std::cmp::Ordering) -> bool| -> Result<Scalar> {
        Ok(match l.compare(r)? {
            Some(ord) => Scalar::Bool(test(ord)),
            None => Scalar::Null,
        })
    };
    match op {
        BinaryOp::Add => l.arith(ArithOp::Add, r),
        BinaryOp::Sub => l.arith(ArithOp::Sub, r),
        BinaryOp::Mul => l.arith(ArithOp::Mul, r),
        BinaryOp::Div => l.arith(ArithOp::Div, r),
        BinaryOp::Eq => cmp(|o| o == Equal),
        BinaryOp::Ne => cmp(|o| o != Equal),
        BinaryOp::Lt => cmp(|o| o == Less),
        BinaryOp::Le => cmp(|o| o != Greater),
        BinaryOp::Gt => cmp(|o| o == Greater),
        BinaryOp::Ge => cmp(|o| o != Less),
        BinaryOp::And => Ok(match (logic(l)?, logic(r)?) {
            (Some(false), _) | (_, Some(false)) => Scalar::Bool(false),
            (Some(true), Some(true)) => Scalar::Bool(true),
            _ => Scalar::Null,
        }),
        BinaryOp::Or => Ok(match (logic(l)?, logic(r)?) {
            (Some(true), _) | (_, Some(true)) => Scalar::Bool(true),
            (Some(false), Some(false)) => Scalar::Bool(false),
            _ => Scalar::Null,
        }),
    }
}

// ── Aggregates ────────────────────────────────────────────────

/// Fold a partition in input order. Nulls are ignored; an all-null or empty
/// partition yields null (count yields zero).
pub fn aggregate(func: AggregateFn, values: &[Scalar]) -> Result<Scalar> {
    let present: Vec<&Scalar> = values.iter().filter(|v| !v.is_null()).collect();
    if func == AggregateFn::Count {
        return Ok(Scalar::Int(present.len() as i64));
    }
    let Some(first) = present.first() else {
        return Ok(Scalar::Null);
    };

    // One numeric type per partition; min/max also accept text.
    let ty = first.data_type();
    for v in &present {
        if v.data_type() != ty {
            return Err(LineageError::TypeMismatch(format!(
                "{func} over mixed {} and {}",
                type_name(ty),
                type_name(v.data_type())
            )));
        }
    }
    let numeric = matches!(ty, Some(DataType::Integer | DataType::Decimal));

    match func {
        AggregateFn::Count => Ok(Scalar::Int(present.len() as i64)),
        AggregateFn::Sum => {
            require_numeric(func, numeric, first)?;
            present.iter().skip(1).try_fold((*first).clone(), |acc, v| {
                acc.arith(ArithOp::Add, v)
            })
        }
        AggregateFn::Min | AggregateFn::Max => {
            let mut best = *first;
            for v in present.iter().skip(1) {
                let ord = v.compare(best)?;
                let better = match func {
                    AggregateFn::Min => ord == Some(std::cmp::Ordering::Less),
                    _ => ord == Some(std::cmp::Ordering::Greater),
                };
                if better {
                    best = *v;
                }
            }
            Ok(best.clone())
        }
        AggregateFn::Avg => {
            require_numeric(func, numeric, first)?;
            let mut total = rust_decimal::Decimal::ZERO;
            for v in &present {
                let d = v.to_decimal().unwrap_or_default();
                total = total
                    .checked_add(d)
                    .ok_or_else(|| LineageError::NumericOverflow(format!("avg of {} values", present.len())))?;
            }
            let n = rust_decimal::Decimal::from(present.len() as i64);
            total
                .checked_div(n)
                .map(|d| Scalar::Decimal(d.normalize()))
                .ok_or_else(|| LineageError::NumericOverflow("avg".into()))
        }
    }
}

fn require_numeric(func: AggregateFn, numeric: bool, sample: &Scalar) -> Result<()> {
    if numeric {
        Ok(())
    } else {
        Err(LineageError::TypeMismatch(format!(
            "{func} over non-numeric {sample}"
        )))
    }
}

fn type_name(ty: Option<DataType>) -> String {
    ty.map_or_else(|| "null".to_string(), |t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row_creation::tests::source;
    use crate::row_creation::{RowBinding, SourceTable};
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;

    const SCHEMA: &str = r#"
name: t
tables:
  - name: loans
    fields:
      - { name: ccy, type: text }
      - { name: amt, type: integer }
      - { name: region, type: text }
hierarchies:
  - name: geo
    edges:
      - { parent: EU, child: IE }
      - { parent: EU, child: FR }
"#;

    fn loans() -> SourceTable {
        source(
            "loans",
            &["ccy", "amt", "region"],
            vec![
                vec![Scalar::text("USD"), Scalar::Int(10), Scalar::text("IE")],
                vec![Scalar::text("USD"), Scalar::Int(5), Scalar::text("US")],
            ],
        )
    }

    fn row_scope(table: &SourceTable, i: usize) -> Scope<'_> {
        Scope::Row(RowBinding::single(table, &table.rows[i]))
    }

    #[test]
    fn arithmetic_records_each_value_once() {
        let schema = MetaDataTrail::from_yaml_str(SCHEMA).unwrap();
        let builtins = BuiltinRegistry::standard();
        let ev = FunctionEvaluator::new(&schema, &builtins);
        let t = loans();
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::col("loans", "amt"),
            Expr::binary(BinaryOp::Mul, Expr::col("loans", "amt"), Expr::int(2)),
        );
        let out = ev.evaluate(&expr, &row_scope(&t, 0)).unwrap();
        assert_eq!(out.value, Scalar::Int(30));
        assert_eq!(
            out.sources,
            vec![t.rows[0].cell("amt").unwrap().value]
        );
    }

    #[test]
    fn boolean_operators_evaluate_both_sides() {
        let schema = MetaDataTrail::from_yaml_str(SCHEMA).unwrap();
        let builtins = BuiltinRegistry::standard();
        let ev = FunctionEvaluator::new(&schema, &builtins);
        let t = loans();
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Eq, Expr::col("loans", "ccy"), Expr::text("EUR")),
            Expr::binary(BinaryOp::Gt, Expr::col("loans", "amt"), Expr::int(0)),
        );
        let out = ev.evaluate(&expr, &row_scope(&t, 0)).unwrap();
        assert_eq!(out.value, Scalar::Bool(false));
        assert_eq!(out.sources.len(), 2);
    }

    #[test]
    fn three_valued_logic() {
        assert_eq!(
            binary(BinaryOp::And, &Scalar::Null, &Scalar::Bool(false)).unwrap(),
            Scalar::Bool(false)
        );
        assert_eq!(
            binary(BinaryOp::Or, &Scalar::Null, &Scalar::Bool(false)).unwrap(),
            Scalar::Null
        );
        assert_eq!(
            binary(BinaryOp::Lt, &Scalar::Null, &Scalar::Int(1)).unwrap(),
            Scalar::Null
        );
    }

    #[test]
    fn member_test_walks_hierarchy() {
        let schema = MetaDataTrail::from_yaml_str(SCHEMA).unwrap();
        let builtins = BuiltinRegistry::standard();
        let ev = FunctionEvaluator::new(&schema, &builtins);
        let t = loans();
        let expr = Expr::member("geo", "EU", Expr::col("loans", "region"));
        assert_eq!(
            ev.evaluate(&expr, &row_scope(&t, 0)).unwrap().value,
            Scalar::Bool(true)
        );
        assert_eq!(
            ev.evaluate(&expr, &row_scope(&t, 1)).unwrap().value,
            Scalar::Bool(false)
        );
        let unknown = Expr::member("nope", "EU", Expr::col("loans", "region"));
        assert_eq!(
            ev.evaluate(&unknown, &row_scope(&t, 0)).unwrap_err().code(),
            "unknown_hierarchy"
        );
    }

    #[test]
    fn speculative_reference_missing_from_snapshot() {
        let schema = MetaDataTrail::from_yaml_str(SCHEMA).unwrap();
        let builtins = BuiltinRegistry::standard();
        let ev = FunctionEvaluator::new(&schema, &builtins);
        let t = loans();
        let err = ev
            .evaluate(&Expr::speculative("loans", "fee"), &row_scope(&t, 0))
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            LineageError::UnresolvedSpeculativeReference { .. }
        ));

        let present = ev
            .evaluate(&Expr::speculative("loans", "amt"), &row_scope(&t, 0))
            .unwrap();
        assert_eq!(present.value, Scalar::Int(10));
        assert_eq!(present.sources.len(), 1);
    }

    #[test]
    fn group_scope_sums_and_references_members() {
        let schema = MetaDataTrail::from_yaml_str(SCHEMA).unwrap();
        let builtins = BuiltinRegistry::standard();
        let ev = FunctionEvaluator::new(&schema, &builtins);
        let t = loans();
        let group_by = vec![ColumnParam::new("loans", "ccy")];
        let scope = Scope::Group {
            key: vec![Scalar::text("USD")],
            group_by: &group_by,
            members: t.rows.iter().map(|r| RowBinding::single(&t, r)).collect(),
        };

        let sum = ev
            .evaluate(&Expr::aggregate(AggregateFn::Sum, Expr::col("loans", "amt")), &scope)
            .unwrap();
        assert_eq!(sum.value, Scalar::Int(15));
        assert_eq!(sum.sources.len(), 2);

        let key = ev.evaluate(&Expr::col("loans", "ccy"), &scope).unwrap();
        assert_eq!(key.value, Scalar::text("USD"));
        assert_eq!(key.sources.len(), 2);

        let err = ev.evaluate(&Expr::col("loans", "amt"), &scope).unwrap_err();
        assert_eq!(err.code(), "invalid_definition");

        let count = ev.evaluate(&Expr::count_rows(), &scope).unwrap();
        assert_eq!(count.value, Scalar::Int(2));
        assert!(count.sources.is_empty());
    }

    #[test]
    fn aggregate_semantics() {
        let ints = [Scalar::Int(3), Scalar::Null, Scalar::Int(1)];
        assert_eq!(aggregate(AggregateFn::Sum, &ints).unwrap(), Scalar::Int(4));
        assert_eq!(aggregate(AggregateFn::Count, &ints).unwrap(), Scalar::Int(2));
        assert_eq!(aggregate(AggregateFn::Min, &ints).unwrap(), Scalar::Int(1));
        assert_eq!(aggregate(AggregateFn::Max, &ints).unwrap(), Scalar::Int(3));
        assert_eq!(
            aggregate(AggregateFn::Avg, &ints).unwrap(),
            Scalar::Decimal(Decimal::from(2))
        );
        assert_eq!(aggregate(AggregateFn::Sum, &[]).unwrap(), Scalar::Null);
        assert_eq!(aggregate(AggregateFn::Count, &[]).unwrap(), Scalar::Int(0));
    }

    #[test]
    fn aggregate_type_rules() {
        let mixed = [Scalar::Int(1), Scalar::Decimal(Decimal::ONE)];
        assert_eq!(
            aggregate(AggregateFn::Sum, &mixed).unwrap_err().code(),
            "type_mismatch"
        );
        let big = [Scalar::Int(i64::MAX), Scalar::Int(1)];
        assert_eq!(
            aggregate(AggregateFn::Sum, &big).unwrap_err().code(),
            "numeric_overflow"
        );
        let text = [Scalar::text("b"), Scalar::text("a")];
        assert_eq!(aggregate(AggregateFn::Min, &text).unwrap(), Scalar::text("a"));
        assert!(aggregate(AggregateFn::Sum, &text).is_err());
    }
}
