//! Eager-loading markers.
//!
//! `Include(q, x => x.A)` followed by `ThenInclude(.., a => a.B)` is first
//! collapsed into a single backend-neutral `IncludePath(q, "A.B")` call on
//! the portable tree. Each backend then decides what to do with the path
//! through a [`NativeRewrite`]; the in-memory backend drops it.

use std::sync::Arc;

use crate::dynamic::DynamicValue;
use crate::error::{QueryError, QueryResult};
use crate::expression::{ConstantValue, Expression, LambdaExpression, MethodCallExpression};
use crate::native::methods::INCLUDE_DECLARING;
use crate::native::{IncludeFn, NativeExpr};
use crate::types::{MethodInfo, TypeInfo};

fn member_path(lambda: &LambdaExpression) -> QueryResult<String> {
    let mut names = Vec::new();
    let mut current = lambda.body.as_ref();
    loop {
        match current {
            Expression::Member(m) => {
                names.push(m.member.name.clone());
                match m.target.as_deref() {
                    Some(target) => current = target,
                    None => break,
                }
            }
            Expression::Parameter(_) => break,
            other => {
                return Err(QueryError::translation(
                    "Include",
                    format!("path must be a member chain, found {}", other.node_name()),
                ))
            }
        }
    }
    if names.is_empty() {
        return Err(QueryError::translation("Include", "path selects no member"));
    }
    names.reverse();
    Ok(names.join("."))
}

fn include_path_call(source: Expression, element_type: TypeInfo, path: String) -> Expression {
    let queryable = TypeInfo::generic("Queryable", vec![element_type.clone()]);
    let method = MethodInfo {
        declaring_type: TypeInfo::named(INCLUDE_DECLARING),
        name: IncludeFn::IncludePath.name().to_string(),
        generic_arguments: vec![element_type],
        parameter_types: vec![queryable.clone(), TypeInfo::named("string")],
        return_type: queryable,
    };
    Expression::call(
        method,
        vec![source, Expression::literal(TypeInfo::named("string"), DynamicValue::String(path))],
    )
}

/// The `(source, path)` of an `IncludePath` call.
fn as_include_path(expr: &Expression) -> Option<(&Expression, &str)> {
    let Expression::MethodCall(call) = expr else {
        return None;
    };
    if call.method.declaring_type.name != INCLUDE_DECLARING || call.method.name != IncludeFn::IncludePath.name() {
        return None;
    }
    match call.arguments.as_slice() {
        [source, Expression::Constant(c)] => match &c.value {
            ConstantValue::Literal(DynamicValue::String(path)) => Some((source, path)),
            _ => None,
        },
        _ => None,
    }
}

/// Collapses include chains into `IncludePath` calls.
pub fn normalize_includes(expr: Expression) -> QueryResult<Expression> {
    expr.transform(&mut |node| {
        let Expression::MethodCall(call) = node else {
            return Ok(node);
        };
        if call.method.declaring_type.name != INCLUDE_DECLARING {
            return Ok(Expression::MethodCall(call));
        }
        match IncludeFn::from_name(&call.method.name) {
            Some(IncludeFn::Include) => {
                let MethodCallExpression { method, arguments, .. } = call;
                let [source, Expression::Lambda(lambda)] = <[Expression; 2]>::try_from(arguments)
                    .map_err(|_| QueryError::translation("Include", "expected a source and a lambda"))?
                else {
                    return Err(QueryError::translation("Include", "expected a lambda path"));
                };
                let element_type = method
                    .generic_arguments
                    .first()
                    .cloned()
                    .ok_or_else(|| QueryError::translation("Include", "missing element type"))?;
                let path = member_path(&lambda)?;
                tracing::debug!("Normalized Include path {}", path);
                Ok(include_path_call(source, element_type, path))
            }
            Some(IncludeFn::ThenInclude) => {
                let MethodCallExpression { method, arguments, .. } = call;
                let [previous, Expression::Lambda(lambda)] = <[Expression; 2]>::try_from(arguments)
                    .map_err(|_| QueryError::translation("ThenInclude", "expected a source and a lambda"))?
                else {
                    return Err(QueryError::translation("ThenInclude", "expected a lambda path"));
                };
                let (source, prefix) = as_include_path(&previous).ok_or_else(|| {
                    QueryError::translation("ThenInclude", "must follow Include or ThenInclude")
                })?;
                let element_type = method
                    .generic_arguments
                    .first()
                    .cloned()
                    .ok_or_else(|| QueryError::translation("ThenInclude", "missing element type"))?;
                let path = format!("{prefix}.{}", member_path(&lambda)?);
                Ok(include_path_call(source.clone(), element_type, path))
            }
            _ => Ok(Expression::MethodCall(call)),
        }
    })
}

/// Include paths present in a portable tree, outermost last.
pub fn include_paths(expr: &Expression) -> Vec<String> {
    let mut paths = Vec::new();
    let mut current = expr;
    while let Expression::MethodCall(call) = current {
        if let Some((_, path)) = as_include_path(current) {
            paths.push(path.to_string());
        }
        match call.arguments.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    paths.reverse();
    paths
}

/// A backend-specific rewrite of a native tree before execution.
pub trait NativeRewrite: Send + Sync {
    fn name(&self) -> &str;

    fn rewrite(&self, expr: NativeExpr) -> QueryResult<NativeExpr>;
}

/// Rewrites applied in registration order.
#[derive(Clone, Default)]
pub struct RewriteChain {
    rewrites: Vec<Arc<dyn NativeRewrite>>,
}

impl RewriteChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rewrite: impl NativeRewrite + 'static) -> Self {
        self.rewrites.push(Arc::new(rewrite));
        self
    }

    pub fn push(&mut self, rewrite: Arc<dyn NativeRewrite>) {
        self.rewrites.push(rewrite);
    }

    pub fn len(&self) -> usize {
        self.rewrites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    pub fn apply(&self, expr: NativeExpr) -> QueryResult<NativeExpr> {
        self.rewrites.iter().try_fold(expr, |expr, rewrite| {
            tracing::debug!("Applying rewrite {}", rewrite.name());
            rewrite.rewrite(expr)
        })
    }
}

/// Removes include markers of any form; for backends where related members
/// are always loaded.
pub struct StripIncludes;

impl NativeRewrite for StripIncludes {
    fn name(&self) -> &str {
        "strip-includes"
    }

    fn rewrite(&self, expr: NativeExpr) -> QueryResult<NativeExpr> {
        expr.transform(&mut |node| match node {
            NativeExpr::Call { method, mut args, .. } if method.include_fn().is_some() && !args.is_empty() => {
                Ok(args.swap_remove(0))
            }
            other => Ok(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::Query;
    use crate::translate::{to_native, to_portable};
    use crate::types::{FieldDef, NativeType, TypeRegistry, TypeResolver};

    fn types() -> (NativeType, NativeType, NativeType) {
        let city = NativeType::record("City", vec![FieldDef::new("Name", NativeType::string())]);
        let address = NativeType::record(
            "Address",
            vec![
                FieldDef::new("Street", NativeType::string()),
                FieldDef::new("City", city.clone()),
            ],
        );
        let customer = NativeType::record(
            "Customer",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Addresses", NativeType::list(address.clone())),
            ],
        );
        (customer, address, city)
    }

    #[test]
    fn test_include_chain_collapses_to_one_path() {
        let (customer, address, city) = types();
        let q = Query::resource(customer.clone())
            .include(|c| c.member("Addresses"))
            .unwrap()
            .then_include(|a| a.member("City"))
            .unwrap();
        let portable = to_portable(q.expr()).unwrap();
        assert_eq!(include_paths(&portable), vec!["Addresses.City"]);
        assert_eq!(portable.to_string(), "resource<Customer>.IncludePath(\"Addresses.City\")");

        let registry = TypeRegistry::new();
        for ty in [customer, address, city] {
            registry.register(ty).unwrap();
        }
        let resolver: Arc<dyn TypeResolver> = Arc::new(registry);
        let native = to_native(&portable, &resolver).unwrap();
        let stripped = RewriteChain::new().with(StripIncludes).apply(native).unwrap();
        assert!(matches!(stripped, NativeExpr::Resource { .. }));
    }

    #[test]
    fn test_then_include_without_include_fails() {
        let lambda = LambdaExpression::new(
            vec![crate::expression::ParameterExpression {
                name: "a".into(),
                ty: TypeInfo::named("Address"),
            }],
            Expression::parameter("a", TypeInfo::named("Address")),
        );
        let orphan = Expression::call(
            MethodInfo {
                declaring_type: TypeInfo::named(INCLUDE_DECLARING),
                name: "ThenInclude".into(),
                generic_arguments: vec![TypeInfo::named("Customer")],
                parameter_types: Vec::new(),
                return_type: TypeInfo::generic("Queryable", vec![TypeInfo::named("Customer")]),
            },
            vec![
                Expression::resource(TypeInfo::named("Customer")),
                Expression::Lambda(lambda),
            ],
        );
        assert!(matches!(
            normalize_includes(orphan),
            Err(QueryError::Translation { .. })
        ));
    }
}
