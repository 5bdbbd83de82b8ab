//! Portable expression model.
//!
//! A portable expression is plain data: every node carries structural type
//! descriptors instead of live types, data sources travel as resource
//! descriptors, and captured closure values travel as typed variable
//! arguments. The tree serializes with serde as an internally tagged enum.

mod display;

use serde::{Deserialize, Serialize};

use crate::dynamic::DynamicValue;
use crate::error::QueryResult;
use crate::types::{ConstructorInfo, MemberInfo, MethodInfo, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    Coalesce,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Coalesce => "??",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Subtract,
            "*" => BinaryOp::Multiply,
            "/" => BinaryOp::Divide,
            "%" => BinaryOp::Modulo,
            "==" | "=" => BinaryOp::Equal,
            "!=" | "<>" => BinaryOp::NotEqual,
            "<" => BinaryOp::LessThan,
            "<=" => BinaryOp::LessThanOrEqual,
            ">" => BinaryOp::GreaterThan,
            ">=" => BinaryOp::GreaterThanOrEqual,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            "??" => BinaryOp::Coalesce,
            _ => return None,
        })
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo
        )
    }

    /// Equality and ordering comparisons; always produce `bool`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// A portable expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expression {
    Constant(ConstantExpression),
    Parameter(ParameterExpression),
    Member(MemberExpression),
    MethodCall(MethodCallExpression),
    Binary(BinaryExpression),
    Unary(UnaryExpression),
    Conversion(ConversionExpression),
    Conditional(ConditionalExpression),
    NewObject(NewObjectExpression),
    NewArray(NewArrayExpression),
    MemberInit(MemberInitExpression),
    Collection(CollectionExpression),
    Lambda(LambdaExpression),
    Sort(SortExpression),
    VariableArgument(VariableArgumentExpression),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantExpression {
    #[serde(rename = "type")]
    pub ty: TypeInfo,
    pub value: ConstantValue,
}

/// Payload of a constant: a literal record/primitive, or the placeholder
/// for the query's data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantValue {
    Literal(DynamicValue),
    Resource(ResourceDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub element_type: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterExpression {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberExpression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Box<Expression>>,
    pub member: MemberInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCallExpression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Box<Expression>>,
    pub method: MethodInfo,
    pub arguments: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryExpression {
    pub op: BinaryOp,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryExpression {
    pub op: UnaryOp,
    pub operand: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionExpression {
    pub operand: Box<Expression>,
    pub target_type: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalExpression {
    pub test: Box<Expression>,
    pub if_true: Box<Expression>,
    pub if_false: Box<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObjectExpression {
    pub constructor: ConstructorInfo,
    pub arguments: Vec<Expression>,
    /// Member each argument initializes; present for anonymous types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArrayExpression {
    pub element_type: TypeInfo,
    pub items: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInitExpression {
    pub new_object: NewObjectExpression,
    pub bindings: Vec<MemberBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberBinding {
    pub member: MemberInfo,
    pub expression: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionExpression {
    pub element_type: TypeInfo,
    pub items: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaExpression {
    pub parameters: Vec<ParameterExpression>,
    pub body: Box<Expression>,
}

/// A sort key with direction. Only meaningful inside a query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpression {
    pub operand: LambdaExpression,
    pub direction: SortDirection,
}

/// A captured closure value, tagged with its exact declared type. A captured
/// collection travels as `values` with the element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableArgumentExpression {
    pub element_type: TypeInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DynamicValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<DynamicValue>>,
}

impl VariableArgumentExpression {
    pub fn single(element_type: TypeInfo, value: DynamicValue) -> Self {
        Self {
            element_type,
            value: Some(value),
            values: None,
        }
    }

    pub fn many(element_type: TypeInfo, values: Vec<DynamicValue>) -> Self {
        Self {
            element_type,
            value: None,
            values: Some(values),
        }
    }

    pub fn is_collection(&self) -> bool {
        self.values.is_some()
    }
}

impl LambdaExpression {
    pub fn new(parameters: Vec<ParameterExpression>, body: Expression) -> Self {
        Self {
            parameters,
            body: Box::new(body),
        }
    }

    /// `Func<P1, .., R>` descriptor of this lambda.
    pub fn function_type(&self) -> TypeInfo {
        let mut args: Vec<TypeInfo> = self.parameters.iter().map(|p| p.ty.clone()).collect();
        args.push(self.body.result_type());
        TypeInfo::generic("Func", args)
    }
}

impl Expression {
    /// The data-source placeholder for a sequence of `element_type`.
    pub fn resource(element_type: TypeInfo) -> Self {
        Expression::Constant(ConstantExpression {
            ty: TypeInfo::generic("Queryable", vec![element_type.clone()]),
            value: ConstantValue::Resource(ResourceDescriptor { element_type }),
        })
    }

    pub fn literal(ty: TypeInfo, value: DynamicValue) -> Self {
        Expression::Constant(ConstantExpression {
            ty,
            value: ConstantValue::Literal(value),
        })
    }

    pub fn parameter(name: impl Into<String>, ty: TypeInfo) -> Self {
        Expression::Parameter(ParameterExpression {
            name: name.into(),
            ty,
        })
    }

    pub fn member(target: Expression, member: MemberInfo) -> Self {
        Expression::Member(MemberExpression {
            target: Some(Box::new(target)),
            member,
        })
    }

    pub fn call(method: MethodInfo, arguments: Vec<Expression>) -> Self {
        Expression::MethodCall(MethodCallExpression {
            target: None,
            method,
            arguments,
        })
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary(BinaryExpression {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// Name of the node kind, used in error messages.
    pub fn node_name(&self) -> &'static str {
        match self {
            Expression::Constant(_) => "Constant",
            Expression::Parameter(_) => "Parameter",
            Expression::Member(_) => "Member",
            Expression::MethodCall(_) => "MethodCall",
            Expression::Binary(_) => "Binary",
            Expression::Unary(_) => "Unary",
            Expression::Conversion(_) => "Conversion",
            Expression::Conditional(_) => "Conditional",
            Expression::NewObject(_) => "NewObject",
            Expression::NewArray(_) => "NewArray",
            Expression::MemberInit(_) => "MemberInit",
            Expression::Collection(_) => "Collection",
            Expression::Lambda(_) => "Lambda",
            Expression::Sort(_) => "Sort",
            Expression::VariableArgument(_) => "VariableArgument",
        }
    }

    /// Static result type, derived from the descriptors in the tree.
    pub fn result_type(&self) -> TypeInfo {
        match self {
            Expression::Constant(c) => c.ty.clone(),
            Expression::Parameter(p) => p.ty.clone(),
            Expression::Member(m) => m.member.member_type.clone(),
            Expression::MethodCall(c) => c.method.return_type.clone(),
            Expression::Binary(b) => {
                if b.op.is_comparison() || b.op.is_logical() {
                    TypeInfo::named("bool")
                } else if b.op == BinaryOp::Coalesce {
                    b.right.result_type()
                } else {
                    b.left.result_type()
                }
            }
            Expression::Unary(u) => match u.op {
                UnaryOp::Not => TypeInfo::named("bool"),
                UnaryOp::Negate => u.operand.result_type(),
            },
            Expression::Conversion(c) => c.target_type.clone(),
            Expression::Conditional(c) => c.if_true.result_type(),
            Expression::NewObject(n) => n.constructor.declaring_type.clone(),
            Expression::MemberInit(m) => m.new_object.constructor.declaring_type.clone(),
            Expression::NewArray(a) => TypeInfo::generic("Array", vec![a.element_type.clone()]),
            Expression::Collection(c) => TypeInfo::generic("List", vec![c.element_type.clone()]),
            Expression::Lambda(l) => l.function_type(),
            Expression::Sort(s) => s.operand.function_type(),
            Expression::VariableArgument(v) => {
                if v.is_collection() {
                    TypeInfo::generic("List", vec![v.element_type.clone()])
                } else {
                    v.element_type.clone()
                }
            }
        }
    }

    /// Rebuilds the tree bottom-up, applying `f` to every node after its
    /// children have been rewritten.
    pub fn transform<F>(self, f: &mut F) -> QueryResult<Expression>
    where
        F: FnMut(Expression) -> QueryResult<Expression>,
    {
        let mut go = |e: Box<Expression>| -> QueryResult<Box<Expression>> {
            Ok(Box::new((*e).transform(&mut *f)?))
        };
        let rebuilt = match self {
            Expression::Member(m) => Expression::Member(MemberExpression {
                target: m.target.map(&mut go).transpose()?,
                member: m.member,
            }),
            Expression::MethodCall(c) => {
                let target = c.target.map(&mut go).transpose()?;
                let arguments = c
                    .arguments
                    .into_iter()
                    .map(|a| Ok(*go(Box::new(a))?))
                    .collect::<QueryResult<Vec<_>>>()?;
                Expression::MethodCall(MethodCallExpression {
                    target,
                    method: c.method,
                    arguments,
                })
            }
            Expression::Binary(b) => Expression::Binary(BinaryExpression {
                op: b.op,
                left: go(b.left)?,
                right: go(b.right)?,
            }),
            Expression::Unary(u) => Expression::Unary(UnaryExpression {
                op: u.op,
                operand: go(u.operand)?,
            }),
            Expression::Conversion(c) => Expression::Conversion(ConversionExpression {
                operand: go(c.operand)?,
                target_type: c.target_type,
            }),
            Expression::Conditional(c) => Expression::Conditional(ConditionalExpression {
                test: go(c.test)?,
                if_true: go(c.if_true)?,
                if_false: go(c.if_false)?,
            }),
            Expression::NewObject(n) => Expression::NewObject(transform_new(n, &mut go)?),
            Expression::NewArray(a) => Expression::NewArray(NewArrayExpression {
                element_type: a.element_type,
                items: transform_all(a.items, &mut go)?,
            }),
            Expression::MemberInit(m) => {
                let new_object = transform_new(m.new_object, &mut go)?;
                let bindings = m
                    .bindings
                    .into_iter()
                    .map(|b| {
                        Ok(MemberBinding {
                            member: b.member,
                            expression: *go(Box::new(b.expression))?,
                        })
                    })
                    .collect::<QueryResult<Vec<_>>>()?;
                Expression::MemberInit(MemberInitExpression { new_object, bindings })
            }
            Expression::Collection(c) => Expression::Collection(CollectionExpression {
                element_type: c.element_type,
                items: transform_all(c.items, &mut go)?,
            }),
            Expression::Lambda(l) => Expression::Lambda(LambdaExpression {
                parameters: l.parameters,
                body: go(l.body)?,
            }),
            Expression::Sort(s) => Expression::Sort(SortExpression {
                operand: LambdaExpression {
                    parameters: s.operand.parameters,
                    body: go(s.operand.body)?,
                },
                direction: s.direction,
            }),
            leaf @ (Expression::Constant(_)
            | Expression::Parameter(_)
            | Expression::VariableArgument(_)) => leaf,
        };
        f(rebuilt)
    }
}

type BoxTransform<'a> = dyn FnMut(Box<Expression>) -> QueryResult<Box<Expression>> + 'a;

fn transform_all(items: Vec<Expression>, go: &mut BoxTransform<'_>) -> QueryResult<Vec<Expression>> {
    items
        .into_iter()
        .map(|e| Ok(*go(Box::new(e))?))
        .collect()
}

fn transform_new(
    n: NewObjectExpression,
    go: &mut BoxTransform<'_>,
) -> QueryResult<NewObjectExpression> {
    Ok(NewObjectExpression {
        constructor: n.constructor,
        arguments: transform_all(n.arguments, go)?,
        member_names: n.member_names,
    })
}
