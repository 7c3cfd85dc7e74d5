//! Builtin scalar functions callable from expressions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LineageError, Result};
use crate::value::Scalar;

// ── Scalar function trait ─────────────────────────────────────

/// A pure function over already-evaluated arguments.
pub trait ScalarFn: Send + Sync {
    fn call(&self, args: &[Scalar]) -> Result<Scalar>;
}

impl<F> ScalarFn for F
where
    F: Fn(&[Scalar]) -> Result<Scalar> + Send + Sync,
{
    fn call(&self, args: &[Scalar]) -> Result<Scalar> {
        (self)(args)
    }
}

// ── Registry ──────────────────────────────────────────────────

/// Registry mapping function names to implementations.
pub struct BuiltinRegistry {
    functions: HashMap<String, Arc<dyn ScalarFn>>,
}

impl BuiltinRegistry {
    /// Empty registry. See [`BuiltinRegistry::standard`] for the default set.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// `abs`, `coalesce`, `concat`, `upper`, `lower`.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("abs", Arc::new(abs));
        registry.register("coalesce", Arc::new(coalesce));
        registry.register("concat", Arc::new(concat));
        registry.register("upper", Arc::new(|args: &[Scalar]| map_text("upper", args, str::to_uppercase)));
        registry.register("lower", Arc::new(|args: &[Scalar]| map_text("lower", args, str::to_lowercase)));
        registry
    }

    pub fn register(&mut self, name: &str, func: Arc<dyn ScalarFn>) {
        self.functions.insert(name.to_string(), func);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScalarFn>> {
        self.functions.get(name)
    }

    pub fn call(&self, name: &str, args: &[Scalar]) -> Result<Scalar> {
        let func = self
            .get(name)
            .ok_or_else(|| LineageError::UnknownFunction(name.to_string()))?;
        func.call(args)
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("BuiltinRegistry")
            .field("functions", &names)
            .finish()
    }
}

// ── Standard functions ────────────────────────────────────────

fn arity(name: &str, args: &[Scalar], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(LineageError::TypeMismatch(format!(
            "{name} takes {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn abs(args: &[Scalar]) -> Result<Scalar> {
    arity("abs", args, 1)?;
    match &args[0] {
        Scalar::Null => Ok(Scalar::Null),
        Scalar::Int(i) => i
            .checked_abs()
            .map(Scalar::Int)
            .ok_or_else(|| LineageError::NumericOverflow(format!("abs({i})"))),
        Scalar::Decimal(d) => Ok(Scalar::Decimal(d.abs())),
        other => Err(LineageError::TypeMismatch(format!("abs of {other}"))),
    }
}

/// First non-null argument.
fn coalesce(args: &[Scalar]) -> Result<Scalar> {
    Ok(args
        .iter()
        .find(|a| !a.is_null())
        .cloned()
        .unwrap_or(Scalar::Null))
}

/// Text concatenation; null if any argument is null.
fn concat(args: &[Scalar]) -> Result<Scalar> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Scalar::Null => return Ok(Scalar::Null),
            Scalar::Text(s) => out.push_str(s),
            Scalar::Int(i) => out.push_str(&i.to_string()),
            Scalar::Decimal(d) => out.push_str(&d.normalize().to_string()),
            Scalar::Bool(b) => out.push_str(&b.to_string()),
        }
    }
    Ok(Scalar::Text(out))
}

fn map_text(name: &str, args: &[Scalar], f: fn(&str) -> String) -> Result<Scalar> {
    arity(name, args, 1)?;
    match &args[0] {
        Scalar::Null => Ok(Scalar::Null),
        Scalar::Text(s) => Ok(Scalar::Text(f(s))),
        other => Err(LineageError::TypeMismatch(format!("{name} of {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn standard_functions() {
        let r = BuiltinRegistry::standard();
        assert_eq!(r.call("abs", &[Scalar::Int(-3)]).unwrap(), Scalar::Int(3));
        assert_eq!(
            r.call("coalesce", &[Scalar::Null, Scalar::text("x")]).unwrap(),
            Scalar::text("x")
        );
        assert_eq!(
            r.call("concat", &[Scalar::text("EUR-"), Scalar::Decimal(Decimal::new(150, 2))])
                .unwrap(),
            Scalar::text("EUR-1.5")
        );
        assert_eq!(r.call("upper", &[Scalar::text("usd")]).unwrap(), Scalar::text("USD"));
        assert_eq!(r.call("lower", &[Scalar::Null]).unwrap(), Scalar::Null);
    }

    #[test]
    fn unknown_function() {
        let err = BuiltinRegistry::standard().call("nope", &[]).unwrap_err();
        assert_eq!(err.code(), "unknown_function");
    }

    #[test]
    fn closures_register() {
        let mut r = BuiltinRegistry::new();
        r.register(
            "answer",
            Arc::new(|_: &[Scalar]| -> Result<Scalar> { Ok(Scalar::Int(42)) }),
        );
        assert_eq!(r.call("answer", &[]).unwrap(), Scalar::Int(42));
    }

    #[test]
    fn arity_is_checked() {
        let r = BuiltinRegistry::standard();
        assert!(r.call("abs", &[]).is_err());
    }
}
