//! Native → portable translation.

use crate::dynamic::DynamicObjectMapper;
use crate::error::{QueryError, QueryResult};
use crate::expression::{
    BinaryExpression, CollectionExpression, ConditionalExpression, ConversionExpression, Expression,
    LambdaExpression, MemberBinding, MemberExpression, MemberInitExpression, MethodCallExpression,
    NewArrayExpression, NewObjectExpression, ParameterExpression, UnaryExpression,
    VariableArgumentExpression,
};
use crate::native::{Constructor, NativeExpr};
use crate::types::{NativeType, TypeKind};
use crate::value::Value;

use super::include::normalize_includes;
use super::partial_eval::evaluate_locally;

/// Knobs for outbound translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationOptions {
    /// Fold parameter-free sub-trees into captured values first.
    pub evaluate_locally: bool,
    /// Collapse `Include`/`ThenInclude` chains into `IncludePath` calls.
    pub normalize_includes: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            evaluate_locally: true,
            normalize_includes: true,
        }
    }
}

/// Translates with the default options and mapper.
pub fn to_portable(expr: &NativeExpr) -> QueryResult<Expression> {
    to_portable_with(expr, &TranslationOptions::default(), &DynamicObjectMapper::default())
}

pub fn to_portable_with(
    expr: &NativeExpr,
    options: &TranslationOptions,
    mapper: &DynamicObjectMapper,
) -> QueryResult<Expression> {
    let folded;
    let source = if options.evaluate_locally {
        folded = evaluate_locally(expr.clone())?;
        &folded
    } else {
        expr
    };
    let portable = ToPortable { mapper }.visit(source)?;
    let portable = if options.normalize_includes {
        normalize_includes(portable)?
    } else {
        portable
    };
    tracing::debug!("Translated to portable: {}", portable);
    Ok(portable)
}

struct ToPortable<'a> {
    mapper: &'a DynamicObjectMapper,
}

impl ToPortable<'_> {
    fn visit(&self, expr: &NativeExpr) -> QueryResult<Expression> {
        Ok(match expr {
            NativeExpr::Constant { value, ty } => Expression::literal(ty.descriptor(), self.mapper.to_dynamic(value)?),
            NativeExpr::Captured { value, ty } => Expression::VariableArgument(self.captured(value, ty)?),
            NativeExpr::Source(source) => Expression::resource(source.element_type().descriptor()),
            NativeExpr::Resource { element_type } => Expression::resource(element_type.descriptor()),
            NativeExpr::Parameter(p) => Expression::parameter(p.name.clone(), p.ty.descriptor()),
            NativeExpr::Member { target, member } => Expression::Member(MemberExpression {
                target: self.visit_opt(target.as_deref())?,
                member: member.descriptor(),
            }),
            NativeExpr::Call { target, method, args } => {
                if method.is_local() {
                    return Err(QueryError::translation(
                        format!("Call {method}"),
                        "process-local functions cannot be sent to the executing side",
                    ));
                }
                Expression::MethodCall(MethodCallExpression {
                    target: self.visit_opt(target.as_deref())?,
                    method: method.descriptor(),
                    arguments: self.visit_all(args)?,
                })
            }
            NativeExpr::Binary { op, left, right, .. } => Expression::Binary(BinaryExpression {
                op: *op,
                left: Box::new(self.visit(left)?),
                right: Box::new(self.visit(right)?),
            }),
            NativeExpr::Unary { op, operand, .. } => Expression::Unary(UnaryExpression {
                op: *op,
                operand: Box::new(self.visit(operand)?),
            }),
            NativeExpr::Convert { operand, ty } => Expression::Conversion(ConversionExpression {
                operand: Box::new(self.visit(operand)?),
                target_type: ty.descriptor(),
            }),
            NativeExpr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => Expression::Conditional(ConditionalExpression {
                test: Box::new(self.visit(test)?),
                if_true: Box::new(self.visit(if_true)?),
                if_false: Box::new(self.visit(if_false)?),
            }),
            NativeExpr::New { ctor, args } => Expression::NewObject(self.new_object(ctor, args)?),
            NativeExpr::MemberInit { ctor, args, bindings } => Expression::MemberInit(MemberInitExpression {
                new_object: self.new_object(ctor, args)?,
                bindings: bindings
                    .iter()
                    .map(|(member, value)| {
                        Ok(MemberBinding {
                            member: member.descriptor(),
                            expression: self.visit(value)?,
                        })
                    })
                    .collect::<QueryResult<Vec<_>>>()?,
            }),
            NativeExpr::NewArray { element_type, items } => Expression::NewArray(NewArrayExpression {
                element_type: element_type.descriptor(),
                items: self.visit_all(items)?,
            }),
            NativeExpr::ListInit { element_type, items } => Expression::Collection(CollectionExpression {
                element_type: element_type.descriptor(),
                items: self.visit_all(items)?,
            }),
            NativeExpr::Lambda(lambda) => Expression::Lambda(LambdaExpression::new(
                lambda
                    .params
                    .iter()
                    .map(|p| ParameterExpression {
                        name: p.name.clone(),
                        ty: p.ty.descriptor(),
                    })
                    .collect(),
                self.visit(&lambda.body)?,
            )),
        })
    }

    fn visit_opt(&self, expr: Option<&NativeExpr>) -> QueryResult<Option<Box<Expression>>> {
        expr.map(|e| self.visit(e).map(Box::new)).transpose()
    }

    fn visit_all(&self, exprs: &[NativeExpr]) -> QueryResult<Vec<Expression>> {
        exprs.iter().map(|e| self.visit(e)).collect()
    }

    fn new_object(&self, ctor: &Constructor, args: &[NativeExpr]) -> QueryResult<NewObjectExpression> {
        let member_names = ctor
            .ty()
            .is_anonymous()
            .then(|| ctor.ty().fields().iter().map(|f| f.name.clone()).collect());
        Ok(NewObjectExpression {
            constructor: ctor.descriptor(),
            arguments: self.visit_all(args)?,
            member_names,
        })
    }

    /// Captured values keep their exact declared type; a captured list
    /// travels element-wise with its element type.
    fn captured(&self, value: &Value, ty: &NativeType) -> QueryResult<VariableArgumentExpression> {
        if let (TypeKind::List(element), Value::List(items)) = (ty.kind(), value) {
            let values = items
                .iter()
                .map(|i| self.mapper.to_dynamic(i))
                .collect::<QueryResult<Vec<_>>>()?;
            return Ok(VariableArgumentExpression::many(element.descriptor(), values));
        }
        Ok(VariableArgumentExpression::single(
            ty.descriptor(),
            self.mapper.to_dynamic(value)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{Method, ParamRef, Query};
    use crate::types::{FieldDef, NativeType, PrimitiveKind};

    fn product() -> NativeType {
        NativeType::record(
            "Product",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Stock", NativeType::i32()),
            ],
        )
    }

    #[test]
    fn test_captured_narrow_integer_keeps_its_type() {
        let threshold = NativeExpr::captured(5i16, NativeType::primitive(PrimitiveKind::I16));
        let q = Query::resource(product())
            .filter(|x| x.member("Stock")?.gt(threshold))
            .unwrap();
        let portable = to_portable(q.expr()).unwrap();
        let text = portable.to_string();
        assert_eq!(text, "resource<Product>.Where(x => (x.Stock > (i32)$(5)))");
    }

    #[test]
    fn test_captured_list_travels_as_values() {
        let ids = NativeExpr::captured(vec![1, 2, 3], NativeType::list(NativeType::i32()));
        let portable = to_portable_with(
            &ids,
            &TranslationOptions::default(),
            &DynamicObjectMapper::default(),
        )
        .unwrap();
        match portable {
            Expression::VariableArgument(v) => {
                assert!(v.is_collection());
                assert_eq!(v.element_type.to_string(), "i32");
                assert_eq!(v.values.unwrap().len(), 3);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_local_function_is_rejected_when_not_folded() {
        let twice = Method::local("twice", vec![NativeType::i32()], NativeType::i32(), |args| {
            Ok(Value::I32(args[0].as_i128().unwrap_or(0) as i32 * 2))
        });
        let x = ParamRef::new("x", NativeType::i32());
        let call = NativeExpr::call(None, twice, vec![x.expr()]).unwrap();
        let lambda = NativeExpr::lambda(vec![x], call);
        let err = to_portable(&lambda).unwrap_err();
        assert!(matches!(err, QueryError::Translation { .. }));
    }
}
