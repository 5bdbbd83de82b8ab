//! Flat query descriptors.
//!
//! A descriptor is the restricted query shape many backends take directly:
//! filter, sort, page. It converts to and from the portable chain
//! `Resource -> Where* -> OrderBy/ThenBy* -> Skip? -> Take?`.

use serde::{Deserialize, Serialize};

use crate::dynamic::DynamicValue;
use crate::error::{QueryError, QueryResult};
use crate::expression::{
    ConstantValue, Expression, LambdaExpression, MethodCallExpression, SortDirection, SortExpression,
};
use crate::native::QueryOperator;
use crate::types::{MethodInfo, TypeInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub element_type: TypeInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<LambdaExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<SortExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take: Option<i32>,
}

impl QueryDescriptor {
    pub fn new(element_type: TypeInfo) -> Self {
        Self {
            element_type,
            filters: Vec::new(),
            sort_keys: Vec::new(),
            skip: None,
            take: None,
        }
    }

    pub fn filter(mut self, predicate: LambdaExpression) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn sort(mut self, key: LambdaExpression, direction: SortDirection) -> Self {
        self.sort_keys.push(SortExpression {
            operand: key,
            direction,
        });
        self
    }

    pub fn skip(mut self, count: i32) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn take(mut self, count: i32) -> Self {
        self.take = Some(count);
        self
    }

    fn queryable(&self) -> TypeInfo {
        TypeInfo::generic("Queryable", vec![self.element_type.clone()])
    }

    fn operator_call(&self, op: QueryOperator, source: Expression, arg: Expression, key: Option<TypeInfo>) -> Expression {
        let mut generic_arguments = vec![self.element_type.clone()];
        generic_arguments.extend(key);
        let method = MethodInfo {
            declaring_type: TypeInfo::named("Queryable"),
            name: op.name().to_string(),
            generic_arguments,
            parameter_types: vec![self.queryable(), arg.result_type()],
            return_type: self.queryable(),
        };
        Expression::call(method, vec![source, arg])
    }

    /// Builds the portable chain for this descriptor.
    pub fn to_expression(&self) -> Expression {
        let mut expr = Expression::resource(self.element_type.clone());
        for filter in &self.filters {
            expr = self.operator_call(QueryOperator::Where, expr, Expression::Lambda(filter.clone()), None);
        }
        for (i, key) in self.sort_keys.iter().enumerate() {
            let op = match (i, key.direction) {
                (0, SortDirection::Ascending) => QueryOperator::OrderBy,
                (0, SortDirection::Descending) => QueryOperator::OrderByDescending,
                (_, SortDirection::Ascending) => QueryOperator::ThenBy,
                (_, SortDirection::Descending) => QueryOperator::ThenByDescending,
            };
            let key_type = key.operand.body.result_type();
            expr = self.operator_call(op, expr, Expression::Lambda(key.operand.clone()), Some(key_type));
        }
        let int = |n: i32| Expression::literal(TypeInfo::named("i32"), DynamicValue::I32(n));
        if let Some(n) = self.skip {
            expr = self.operator_call(QueryOperator::Skip, expr, int(n), None);
        }
        if let Some(n) = self.take {
            expr = self.operator_call(QueryOperator::Take, expr, int(n), None);
        }
        expr
    }

    /// Reads a descriptor back out of a portable chain.
    pub fn from_expression(expr: &Expression) -> QueryResult<Self> {
        let mut calls = Vec::new();
        let mut current = expr;
        let element_type = loop {
            match current {
                Expression::Constant(c) => match &c.value {
                    ConstantValue::Resource(r) => break r.element_type.clone(),
                    ConstantValue::Literal(_) => return Err(shape_error("a literal is not a query root")),
                },
                Expression::MethodCall(call) => {
                    let op = queryable_operator(call)?;
                    let source = call
                        .arguments
                        .first()
                        .ok_or_else(|| shape_error(format!("{} has no source", op.name())))?;
                    calls.push((op, call));
                    current = source;
                }
                other => return Err(shape_error(format!("unexpected {} in chain", other.node_name()))),
            }
        };
        calls.reverse();

        let mut descriptor = QueryDescriptor::new(element_type);
        // 0 = filters, 1 = sorts, 2 = skip, 3 = take
        let mut stage = 0;
        for (op, call) in calls {
            let next = match op {
                QueryOperator::Where => 0,
                QueryOperator::OrderBy | QueryOperator::OrderByDescending => 1,
                QueryOperator::ThenBy | QueryOperator::ThenByDescending => 1,
                QueryOperator::Skip => 2,
                QueryOperator::Take => 3,
                other => return Err(shape_error(format!("{} cannot appear in a descriptor", other.name()))),
            };
            let ordering_restart = matches!(op, QueryOperator::OrderBy | QueryOperator::OrderByDescending)
                && !descriptor.sort_keys.is_empty();
            let then_without_order = matches!(op, QueryOperator::ThenBy | QueryOperator::ThenByDescending)
                && descriptor.sort_keys.is_empty();
            let repeated_page = next >= 2 && next == stage && stage_taken(&descriptor, next);
            if next < stage || ordering_restart || then_without_order || repeated_page {
                return Err(shape_error(format!("{} is out of order", op.name())));
            }
            stage = next;
            match op {
                QueryOperator::Where => descriptor.filters.push(lambda_arg(call)?),
                QueryOperator::Skip => descriptor.skip = Some(int_arg(call)?),
                QueryOperator::Take => descriptor.take = Some(int_arg(call)?),
                _ => {
                    let direction = if op.is_descending() {
                        SortDirection::Descending
                    } else {
                        SortDirection::Ascending
                    };
                    descriptor.sort_keys.push(SortExpression {
                        operand: lambda_arg(call)?,
                        direction,
                    });
                }
            }
        }
        Ok(descriptor)
    }
}

fn shape_error(message: impl Into<String>) -> QueryError {
    QueryError::translation("QueryDescriptor", message)
}

fn stage_taken(descriptor: &QueryDescriptor, stage: u8) -> bool {
    match stage {
        2 => descriptor.skip.is_some(),
        _ => descriptor.take.is_some(),
    }
}

fn queryable_operator(call: &MethodCallExpression) -> QueryResult<QueryOperator> {
    if call.method.declaring_type.name != "Queryable" {
        return Err(shape_error(format!("{} is not a query operator", call.method)));
    }
    QueryOperator::from_name(&call.method.name)
        .ok_or_else(|| shape_error(format!("unknown operator {}", call.method.name)))
}

fn lambda_arg(call: &MethodCallExpression) -> QueryResult<LambdaExpression> {
    match call.arguments.get(1) {
        Some(Expression::Lambda(lambda)) if lambda.parameters.len() == 1 => Ok(lambda.clone()),
        _ => Err(shape_error(format!("{} expects a single-parameter lambda", call.method.name))),
    }
}

fn int_arg(call: &MethodCallExpression) -> QueryResult<i32> {
    let value = match call.arguments.get(1) {
        Some(Expression::Constant(c)) => match &c.value {
            ConstantValue::Literal(v) => v.as_i128(),
            ConstantValue::Resource(_) => None,
        },
        Some(Expression::VariableArgument(v)) => v.value.as_ref().and_then(DynamicValue::as_i128),
        _ => None,
    };
    value
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| shape_error(format!("{} expects an i32 count", call.method.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{BinaryOp, MemberExpression, ParameterExpression};
    use crate::types::MemberInfo;

    fn order() -> TypeInfo {
        TypeInfo::named("Order")
    }

    fn member_lambda(name: &str, ty: &str) -> LambdaExpression {
        LambdaExpression::new(
            vec![ParameterExpression {
                name: "x".into(),
                ty: order(),
            }],
            Expression::Member(MemberExpression {
                target: Some(Box::new(Expression::parameter("x", order()))),
                member: MemberInfo {
                    declaring_type: order(),
                    name: name.into(),
                    member_type: TypeInfo::named(ty),
                },
            }),
        )
    }

    fn descriptor() -> QueryDescriptor {
        let total = member_lambda("Total", "f64");
        let predicate = LambdaExpression::new(
            total.parameters.clone(),
            Expression::binary(
                BinaryOp::GreaterThan,
                *total.body,
                Expression::literal(TypeInfo::named("f64"), DynamicValue::F64(10.0)),
            ),
        );
        QueryDescriptor::new(order())
            .filter(predicate)
            .sort(member_lambda("Customer", "string"), SortDirection::Ascending)
            .sort(member_lambda("Id", "i32"), SortDirection::Descending)
            .skip(5)
            .take(10)
    }

    #[test]
    fn test_descriptor_builds_chain() {
        let expr = descriptor().to_expression();
        assert_eq!(
            expr.to_string(),
            "resource<Order>.Where(x => (x.Total > 10)).OrderBy(x => x.Customer)\
             .ThenByDescending(x => x.Id).Skip(5).Take(10)"
        );
    }

    #[test]
    fn test_descriptor_reads_back_from_chain() {
        let original = descriptor();
        let parsed = QueryDescriptor::from_expression(&original.to_expression()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_filter_after_sort_is_rejected() {
        let mut bad = QueryDescriptor::new(order())
            .sort(member_lambda("Id", "i32"), SortDirection::Ascending)
            .to_expression();
        let predicate = LambdaExpression::new(
            vec![ParameterExpression {
                name: "x".into(),
                ty: order(),
            }],
            Expression::literal(TypeInfo::named("bool"), DynamicValue::Bool(true)),
        );
        bad = QueryDescriptor::new(order()).operator_call(
            QueryOperator::Where,
            bad,
            Expression::Lambda(predicate),
            None,
        );
        assert!(matches!(
            QueryDescriptor::from_expression(&bad),
            Err(QueryError::Translation { .. })
        ));
    }

    #[test]
    fn test_non_chain_operator_is_rejected() {
        let distinct = Expression::call(
            MethodInfo {
                declaring_type: TypeInfo::named("Queryable"),
                name: "Distinct".into(),
                generic_arguments: vec![order()],
                parameter_types: vec![TypeInfo::generic("Queryable", vec![order()])],
                return_type: TypeInfo::generic("Queryable", vec![order()]),
            },
            vec![Expression::resource(order())],
        );
        assert!(QueryDescriptor::from_expression(&distinct).is_err());
    }

    #[test]
    fn test_descriptor_serializes_without_empty_parts() {
        let json = serde_json::to_value(QueryDescriptor::new(order()).take(3)).unwrap();
        assert!(json.get("filters").is_none());
        assert_eq!(json["take"], 3);
    }
}
