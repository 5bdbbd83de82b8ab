//! Portable → native translation.

use std::sync::Arc;

use crate::dynamic::{DynamicObjectMapper, MapperConfig};
use crate::error::{QueryError, QueryResult};
use crate::expression::{ConstantValue, Expression, NewObjectExpression};
use crate::native::{Constructor, NativeExpr, ParamRef};
use crate::source::DataSourceProvider;
use crate::types::{NativeType, TypeInfo, TypeResolver};
use crate::value::Value;

/// Rebuilds a native tree. Resource placeholders stay unbound; see
/// [`bind_resources`].
pub fn to_native(expr: &Expression, resolver: &Arc<dyn TypeResolver>) -> QueryResult<NativeExpr> {
    ToNative::new(resolver, None).visit(expr)
}

/// Rebuilds a native tree, resolving each resource descriptor to a live
/// data source through `provider`.
pub fn to_native_with_provider(
    expr: &Expression,
    resolver: &Arc<dyn TypeResolver>,
    provider: &dyn DataSourceProvider,
) -> QueryResult<NativeExpr> {
    ToNative::new(resolver, Some(provider)).visit(expr)
}

/// Replaces every unbound resource placeholder with the provider's source.
pub fn bind_resources(expr: NativeExpr, provider: &dyn DataSourceProvider) -> QueryResult<NativeExpr> {
    expr.transform(&mut |node| match node {
        NativeExpr::Resource { element_type } => {
            tracing::debug!("Binding resource {}", element_type);
            Ok(NativeExpr::Source(provider.provide(&element_type)?))
        }
        other => Ok(other),
    })
}

struct ToNative<'a> {
    resolver: &'a Arc<dyn TypeResolver>,
    provider: Option<&'a dyn DataSourceProvider>,
    mapper: DynamicObjectMapper,
    scope: Vec<ParamRef>,
}

impl<'a> ToNative<'a> {
    fn new(resolver: &'a Arc<dyn TypeResolver>, provider: Option<&'a dyn DataSourceProvider>) -> Self {
        Self {
            resolver,
            provider,
            mapper: DynamicObjectMapper::new(MapperConfig::default()).with_resolver(resolver.clone()),
            scope: Vec::new(),
        }
    }

    fn ty(&self, info: &TypeInfo) -> QueryResult<NativeType> {
        self.resolver.resolve_type(info)
    }

    fn visit(&mut self, expr: &Expression) -> QueryResult<NativeExpr> {
        match expr {
            Expression::Constant(c) => match &c.value {
                ConstantValue::Resource(r) => {
                    let element_type = self.ty(&r.element_type)?;
                    match self.provider {
                        Some(provider) => Ok(NativeExpr::Source(provider.provide(&element_type)?)),
                        None => Ok(NativeExpr::Resource { element_type }),
                    }
                }
                ConstantValue::Literal(value) => {
                    let ty = self.ty(&c.ty)?;
                    let value = self.mapper.from_dynamic(value, &ty)?;
                    Ok(NativeExpr::Constant { value, ty })
                }
            },
            Expression::VariableArgument(v) => {
                let element_type = self.ty(&v.element_type)?;
                match (&v.value, &v.values) {
                    (_, Some(values)) => {
                        let items = values
                            .iter()
                            .map(|item| self.mapper.from_dynamic(item, &element_type))
                            .collect::<QueryResult<Vec<_>>>()?;
                        Ok(NativeExpr::captured(Value::List(items), NativeType::list(element_type)))
                    }
                    (Some(value), None) => {
                        let value = self.mapper.from_dynamic(value, &element_type)?;
                        Ok(NativeExpr::captured(value, element_type))
                    }
                    (None, None) => Ok(NativeExpr::captured(Value::Null, element_type)),
                }
            }
            Expression::Parameter(p) => {
                let bound = self
                    .scope
                    .iter()
                    .rev()
                    .find(|param| param.name == p.name)
                    .ok_or_else(|| {
                        QueryError::translation("Parameter", format!("'{}' is not in scope", p.name))
                    })?;
                let declared = self.ty(&p.ty)?;
                if bound.ty != declared {
                    return Err(QueryError::translation(
                        "Parameter",
                        format!("'{}' is '{}', used as '{}'", p.name, bound.ty, declared),
                    ));
                }
                Ok(bound.expr())
            }
            Expression::Member(m) => {
                let target = m.target.as_deref().ok_or_else(|| {
                    QueryError::translation(
                        format!("Member {}", m.member.name),
                        "static members are not supported",
                    )
                })?;
                let target = self.visit(target)?;
                let member = self.resolver.resolve_member(&m.member)?;
                NativeExpr::member_access(target, member)
            }
            Expression::MethodCall(c) => {
                let method = self.resolver.resolve_method(&c.method)?;
                let target = c.target.as_deref().map(|t| self.visit(t)).transpose()?;
                let args = self.visit_all(&c.arguments)?;
                NativeExpr::call(target, method, args)
            }
            Expression::Binary(b) => {
                let left = self.visit(&b.left)?;
                let right = self.visit(&b.right)?;
                NativeExpr::make_binary(b.op, left, right)
            }
            Expression::Unary(u) => {
                let operand = self.visit(&u.operand)?;
                NativeExpr::unary(u.op, operand)
            }
            Expression::Conversion(c) => {
                let operand = self.visit(&c.operand)?;
                NativeExpr::convert(operand, self.ty(&c.target_type)?)
            }
            Expression::Conditional(c) => {
                let test = self.visit(&c.test)?;
                let if_true = self.visit(&c.if_true)?;
                let if_false = self.visit(&c.if_false)?;
                NativeExpr::conditional(test, if_true, if_false)
            }
            Expression::NewObject(n) => {
                let (ctor, args) = self.new_object(n)?;
                NativeExpr::new_object(ctor, args)
            }
            Expression::MemberInit(m) => {
                let (ctor, args) = self.new_object(&m.new_object)?;
                let bindings = m
                    .bindings
                    .iter()
                    .map(|b| Ok((self.resolver.resolve_member(&b.member)?, self.visit(&b.expression)?)))
                    .collect::<QueryResult<Vec<_>>>()?;
                NativeExpr::member_init(ctor, args, bindings)
            }
            Expression::NewArray(a) => {
                let element_type = self.ty(&a.element_type)?;
                NativeExpr::new_array(element_type, self.visit_all(&a.items)?)
            }
            Expression::Collection(c) => {
                let element_type = self.ty(&c.element_type)?;
                NativeExpr::list_init(element_type, self.visit_all(&c.items)?)
            }
            Expression::Lambda(l) => {
                let params = l
                    .parameters
                    .iter()
                    .map(|p| Ok(ParamRef::new(p.name.clone(), self.ty(&p.ty)?)))
                    .collect::<QueryResult<Vec<_>>>()?;
                let depth = self.scope.len();
                self.scope.extend(params.iter().cloned());
                let body = self.visit(&l.body);
                self.scope.truncate(depth);
                Ok(NativeExpr::lambda(params, body?))
            }
            Expression::Sort(_) => Err(QueryError::translation(
                "Sort",
                "sort expressions are only valid inside a query descriptor",
            )),
        }
    }

    fn visit_all(&mut self, exprs: &[Expression]) -> QueryResult<Vec<NativeExpr>> {
        exprs.iter().map(|e| self.visit(e)).collect()
    }

    fn new_object(&mut self, n: &NewObjectExpression) -> QueryResult<(Constructor, Vec<NativeExpr>)> {
        let ctor = self.resolver.resolve_constructor(&n.constructor)?;
        if let Some(names) = &n.member_names {
            let fields: Vec<&str> = ctor.ty().fields().iter().map(|f| f.name.as_str()).collect();
            if names.iter().map(String::as_str).ne(fields.iter().copied()) {
                return Err(QueryError::translation(
                    "NewObject",
                    format!("member names {names:?} do not match '{}'", ctor.ty()),
                ));
            }
        }
        let args = self.visit_all(&n.arguments)?;
        Ok((ctor, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{LambdaExpression, ParameterExpression, SortDirection, SortExpression};
    use crate::native::Query;
    use crate::source::{InMemorySource, SourceCatalog};
    use crate::translate::to_portable;
    use crate::types::{FieldDef, TypeRegistry};

    fn product() -> NativeType {
        NativeType::record(
            "Product",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Stock", NativeType::i32()),
            ],
        )
    }

    fn resolver() -> Arc<dyn TypeResolver> {
        let registry = TypeRegistry::new();
        registry.register(product()).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_round_trip_keeps_shape() {
        let q = Query::resource(product())
            .filter(|x| x.member("Stock")?.ge(NativeExpr::constant(3, NativeType::i32())))
            .unwrap()
            .select(|x| x.member("Name"))
            .unwrap();
        let portable = to_portable(q.expr()).unwrap();
        let native = to_native(&portable, &resolver()).unwrap();
        assert_eq!(native.to_string(), q.expr().to_string());
        assert!(matches!(
            native,
            NativeExpr::Call { ref args, .. } if matches!(args[0], NativeExpr::Call { .. })
        ));
    }

    #[test]
    fn test_resource_binds_through_provider() {
        let catalog = SourceCatalog::new();
        catalog.add(InMemorySource::shared(product(), Vec::new()));
        let portable = Expression::resource(TypeInfo::named("Product"));
        let bound = to_native_with_provider(&portable, &resolver(), &catalog).unwrap();
        assert!(matches!(bound, NativeExpr::Source(_)));

        let unbound = to_native(&portable, &resolver()).unwrap();
        assert!(matches!(unbound, NativeExpr::Resource { .. }));
        assert!(matches!(bind_resources(unbound, &catalog).unwrap(), NativeExpr::Source(_)));
    }

    #[test]
    fn test_unknown_type_fails() {
        let portable = Expression::resource(TypeInfo::named("Ghost"));
        assert!(matches!(
            to_native(&portable, &resolver()),
            Err(QueryError::TypeResolution(_))
        ));
    }

    #[test]
    fn test_sort_outside_descriptor_is_rejected() {
        let sort = Expression::Sort(SortExpression {
            operand: LambdaExpression::new(
                vec![ParameterExpression {
                    name: "x".into(),
                    ty: TypeInfo::named("Product"),
                }],
                Expression::parameter("x", TypeInfo::named("Product")),
            ),
            direction: SortDirection::Descending,
        });
        assert!(matches!(
            to_native(&sort, &resolver()),
            Err(QueryError::Translation { .. })
        ));
    }

    #[test]
    fn test_free_parameter_is_rejected() {
        let stray = Expression::parameter("y", TypeInfo::named("i32"));
        assert!(to_native(&stray, &resolver()).is_err());
    }
}
