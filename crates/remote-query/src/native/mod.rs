//! Native expression trees.
//!
//! This is the calling side's (and, after translation, the executing
//! side's) representation of a query: nodes hold live types, live data
//! sources, captured values and method handles with their implementation.

pub mod methods;
pub mod query;

use std::fmt;
use std::sync::Arc;

use crate::error::{QueryError, QueryResult};
use crate::expression::{BinaryOp, UnaryOp};
use crate::source::DataSource;
use crate::types::{ConstructorInfo, FieldDef, MemberInfo, NativeType, PrimitiveKind, TypeKind};
use crate::value::Value;

pub use methods::{IncludeFn, LocalFn, Method, MethodOp, QueryOperator, SequenceKind, StringFn};
pub use query::Query;

/// A lambda parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRef {
    pub name: String,
    pub ty: NativeType,
}

impl ParamRef {
    pub fn new(name: impl Into<String>, ty: NativeType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn expr(&self) -> NativeExpr {
        NativeExpr::Parameter(self.clone())
    }
}

#[derive(Clone)]
pub struct Lambda {
    pub params: Vec<ParamRef>,
    pub body: Box<NativeExpr>,
}

impl Lambda {
    pub fn new(params: Vec<ParamRef>, body: NativeExpr) -> Self {
        Self {
            params,
            body: Box::new(body),
        }
    }

    pub fn ty(&self) -> NativeType {
        NativeType::function(
            self.params.iter().map(|p| p.ty.clone()).collect(),
            self.body.ty(),
        )
    }
}

/// Members that exist on built-in types rather than as record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMember {
    Length,
    Count,
    HasValue,
    Value,
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAccess {
    Field(usize),
    Builtin(BuiltinMember),
}

/// A resolved member of a type.
#[derive(Debug, Clone)]
pub struct Member {
    declaring_type: NativeType,
    name: String,
    ty: NativeType,
    access: MemberAccess,
}

impl Member {
    pub fn resolve(declaring: &NativeType, name: &str) -> QueryResult<Member> {
        let make = |ty: NativeType, access| Member {
            declaring_type: declaring.clone(),
            name: name.to_string(),
            ty,
            access,
        };
        if let Some((index, field)) = declaring.field(name) {
            return Ok(make(field.ty.clone(), MemberAccess::Field(index)));
        }
        let builtin = match (declaring.kind(), name) {
            (TypeKind::Primitive(PrimitiveKind::String), "Length") => {
                Some((NativeType::i32(), BuiltinMember::Length))
            }
            (TypeKind::List(_), "Count") | (TypeKind::Array(_), "Length") => {
                Some((NativeType::i32(), BuiltinMember::Count))
            }
            (TypeKind::Nullable(_), "HasValue") => Some((NativeType::bool(), BuiltinMember::HasValue)),
            (TypeKind::Nullable(inner), "Value") => Some((inner.clone(), BuiltinMember::Value)),
            (TypeKind::Primitive(PrimitiveKind::DateTime | PrimitiveKind::Date), "Year") => {
                Some((NativeType::i32(), BuiltinMember::Year))
            }
            (TypeKind::Primitive(PrimitiveKind::DateTime | PrimitiveKind::Date), "Month") => {
                Some((NativeType::i32(), BuiltinMember::Month))
            }
            (TypeKind::Primitive(PrimitiveKind::DateTime | PrimitiveKind::Date), "Day") => {
                Some((NativeType::i32(), BuiltinMember::Day))
            }
            _ => None,
        };
        builtin
            .map(|(ty, b)| make(ty, MemberAccess::Builtin(b)))
            .ok_or_else(|| {
                QueryError::TypeResolution(format!("Type '{declaring}' has no member '{name}'"))
            })
    }

    pub fn declaring_type(&self) -> &NativeType {
        &self.declaring_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &NativeType {
        &self.ty
    }

    pub fn access(&self) -> MemberAccess {
        self.access
    }

    pub fn descriptor(&self) -> MemberInfo {
        MemberInfo {
            declaring_type: self.declaring_type.descriptor(),
            name: self.name.clone(),
            member_type: self.ty.descriptor(),
        }
    }
}

/// A record constructor: either parameterless (all defaults) or positional
/// over every field in declaration order.
#[derive(Debug, Clone)]
pub struct Constructor {
    ty: NativeType,
    param_types: Vec<NativeType>,
}

impl Constructor {
    pub fn resolve(ty: &NativeType, param_types: Vec<NativeType>) -> QueryResult<Constructor> {
        if !ty.is_record() {
            return Err(QueryError::TypeResolution(format!(
                "'{ty}' is not a constructible record type"
            )));
        }
        let field_types: Vec<&NativeType> = ty.fields().iter().map(|f| &f.ty).collect();
        let positional = param_types.len() == field_types.len()
            && param_types.iter().zip(&field_types).all(|(a, b)| a == *b);
        if !param_types.is_empty() && !positional {
            return Err(QueryError::TypeResolution(format!(
                "'{ty}' has no constructor with that parameter list"
            )));
        }
        Ok(Constructor {
            ty: ty.clone(),
            param_types,
        })
    }

    pub fn parameterless(ty: &NativeType) -> QueryResult<Constructor> {
        Self::resolve(ty, Vec::new())
    }

    pub fn positional(ty: &NativeType) -> QueryResult<Constructor> {
        Self::resolve(ty, ty.fields().iter().map(|f| f.ty.clone()).collect())
    }

    pub fn ty(&self) -> &NativeType {
        &self.ty
    }

    pub fn param_types(&self) -> &[NativeType] {
        &self.param_types
    }

    pub fn descriptor(&self) -> ConstructorInfo {
        ConstructorInfo {
            declaring_type: self.ty.descriptor(),
            parameter_types: self.param_types.iter().map(NativeType::descriptor).collect(),
        }
    }
}

/// A native expression node.
#[derive(Clone)]
pub enum NativeExpr {
    Constant {
        value: Value,
        ty: NativeType,
    },
    /// A value captured from the enclosing scope, with its declared type.
    Captured {
        value: Value,
        ty: NativeType,
    },
    Source(Arc<dyn DataSource>),
    /// A data-source placeholder not yet bound to a live source.
    Resource {
        element_type: NativeType,
    },
    Parameter(ParamRef),
    Member {
        target: Option<Box<NativeExpr>>,
        member: Member,
    },
    Call {
        target: Option<Box<NativeExpr>>,
        method: Method,
        args: Vec<NativeExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<NativeExpr>,
        right: Box<NativeExpr>,
        ty: NativeType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<NativeExpr>,
        ty: NativeType,
    },
    Convert {
        operand: Box<NativeExpr>,
        ty: NativeType,
    },
    Conditional {
        test: Box<NativeExpr>,
        if_true: Box<NativeExpr>,
        if_false: Box<NativeExpr>,
        ty: NativeType,
    },
    New {
        ctor: Constructor,
        args: Vec<NativeExpr>,
    },
    NewArray {
        element_type: NativeType,
        items: Vec<NativeExpr>,
    },
    MemberInit {
        ctor: Constructor,
        args: Vec<NativeExpr>,
        bindings: Vec<(Member, NativeExpr)>,
    },
    ListInit {
        element_type: NativeType,
        items: Vec<NativeExpr>,
    },
    Lambda(Lambda),
}

fn type_mismatch(node: &str, expected: &NativeType, actual: &NativeType) -> QueryError {
    QueryError::translation(node, format!("expected '{expected}', found '{actual}'"))
}

impl NativeExpr {
    pub fn ty(&self) -> NativeType {
        match self {
            NativeExpr::Constant { ty, .. } | NativeExpr::Captured { ty, .. } => ty.clone(),
            NativeExpr::Source(source) => NativeType::queryable(source.element_type().clone()),
            NativeExpr::Resource { element_type } => NativeType::queryable(element_type.clone()),
            NativeExpr::Parameter(p) => p.ty.clone(),
            NativeExpr::Member { member, .. } => member.ty.clone(),
            NativeExpr::Call { method, .. } => method.return_type().clone(),
            NativeExpr::Binary { ty, .. }
            | NativeExpr::Unary { ty, .. }
            | NativeExpr::Convert { ty, .. }
            | NativeExpr::Conditional { ty, .. } => ty.clone(),
            NativeExpr::New { ctor, .. } | NativeExpr::MemberInit { ctor, .. } => ctor.ty.clone(),
            NativeExpr::NewArray { element_type, .. } => NativeType::array(element_type.clone()),
            NativeExpr::ListInit { element_type, .. } => NativeType::list(element_type.clone()),
            NativeExpr::Lambda(lambda) => lambda.ty(),
        }
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            NativeExpr::Constant { .. } => "Constant",
            NativeExpr::Captured { .. } => "Captured",
            NativeExpr::Source(_) => "Source",
            NativeExpr::Resource { .. } => "Resource",
            NativeExpr::Parameter(_) => "Parameter",
            NativeExpr::Member { .. } => "Member",
            NativeExpr::Call { .. } => "Call",
            NativeExpr::Binary { .. } => "Binary",
            NativeExpr::Unary { .. } => "Unary",
            NativeExpr::Convert { .. } => "Convert",
            NativeExpr::Conditional { .. } => "Conditional",
            NativeExpr::New { .. } => "New",
            NativeExpr::NewArray { .. } => "NewArray",
            NativeExpr::MemberInit { .. } => "MemberInit",
            NativeExpr::ListInit { .. } => "ListInit",
            NativeExpr::Lambda(_) => "Lambda",
        }
    }

    pub fn constant(value: impl Into<Value>, ty: NativeType) -> NativeExpr {
        NativeExpr::Constant {
            value: value.into(),
            ty,
        }
    }

    /// A captured closure value with an explicit declared type.
    pub fn captured(value: impl Into<Value>, ty: NativeType) -> NativeExpr {
        NativeExpr::Captured {
            value: value.into(),
            ty,
        }
    }

    /// A captured value whose declared type is its runtime type.
    pub fn capture(value: impl Into<Value>) -> QueryResult<NativeExpr> {
        let value = value.into();
        let ty = value.native_type().ok_or_else(|| {
            QueryError::translation("Captured", "cannot infer the type of a null or empty value")
        })?;
        Ok(NativeExpr::Captured { value, ty })
    }

    pub fn null(ty: NativeType) -> NativeExpr {
        NativeExpr::Constant {
            value: Value::Null,
            ty,
        }
    }

    pub fn lambda(params: Vec<ParamRef>, body: NativeExpr) -> NativeExpr {
        NativeExpr::Lambda(Lambda::new(params, body))
    }

    pub fn as_lambda(&self) -> Option<&Lambda> {
        match self {
            NativeExpr::Lambda(l) => Some(l),
            _ => None,
        }
    }

    /// Member access on this expression.
    pub fn member(self, name: &str) -> QueryResult<NativeExpr> {
        let member = Member::resolve(&self.ty(), name)?;
        Ok(NativeExpr::Member {
            target: Some(Box::new(self)),
            member,
        })
    }

    pub fn member_access(target: NativeExpr, member: Member) -> QueryResult<NativeExpr> {
        let target_ty = target.ty();
        if target_ty != member.declaring_type {
            return Err(type_mismatch(
                &format!("Member {}", member.name),
                &member.declaring_type,
                &target_ty,
            ));
        }
        Ok(NativeExpr::Member {
            target: Some(Box::new(target)),
            member,
        })
    }

    /// A method call, checked against the method's signature.
    pub fn call(target: Option<NativeExpr>, method: Method, args: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        let node = format!("Call {method}");
        match (&target, method.is_instance()) {
            (Some(t), true) => {
                let declaring = method.declaring();
                if t.ty().underlying().name() != declaring {
                    return Err(QueryError::translation(
                        &node,
                        format!("receiver of type '{}' is not a {declaring}", t.ty()),
                    ));
                }
            }
            (None, true) => return Err(QueryError::translation(&node, "missing receiver")),
            (Some(_), false) => {
                return Err(QueryError::translation(&node, "static method called with a receiver"))
            }
            (None, false) => {}
        }
        if args.len() != method.param_types().len() {
            return Err(QueryError::translation(
                &node,
                format!("expected {} arguments, got {}", method.param_types().len(), args.len()),
            ));
        }
        for (arg, expected) in args.iter().zip(method.param_types()) {
            let actual = arg.ty();
            if &actual != expected {
                return Err(type_mismatch(&node, expected, &actual));
            }
        }
        Ok(NativeExpr::Call {
            target: target.map(Box::new),
            method,
            args,
        })
    }

    /// Calls an instance method on `string`.
    pub fn string_call(self, f: StringFn, args: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        NativeExpr::call(Some(self), Method::string(f), args)
    }

    /// Calls a sequence operator with this list-typed expression as source.
    pub fn sequence_call(
        self,
        op: QueryOperator,
        mut generic_args: Vec<NativeType>,
        mut args: Vec<NativeExpr>,
    ) -> QueryResult<NativeExpr> {
        let ty = self.ty();
        let (kind, element) = match ty.kind() {
            TypeKind::Queryable(e) => (SequenceKind::Queryable, e.clone()),
            TypeKind::List(e) => (SequenceKind::Enumerable, e.clone()),
            _ => {
                return Err(QueryError::translation(
                    format!("Call {}", op.name()),
                    format!("'{ty}' is not a sequence"),
                ))
            }
        };
        generic_args.insert(0, element);
        args.insert(0, self);
        let method = Method::query(kind, op, generic_args, args.len())?;
        NativeExpr::call(None, method, args)
    }

    /// Wraps in a `Convert` unless already of the target type.
    pub fn convert_to(self, ty: &NativeType) -> NativeExpr {
        if &self.ty() == ty {
            return self;
        }
        NativeExpr::Convert {
            operand: Box::new(self),
            ty: ty.clone(),
        }
    }

    /// An explicit conversion, checked for plausibility.
    pub fn convert(operand: NativeExpr, ty: NativeType) -> QueryResult<NativeExpr> {
        let from = operand.ty();
        let (fu, tu) = (from.underlying(), ty.underlying());
        let numeric = |t: &NativeType| t.as_primitive().is_some_and(PrimitiveKind::is_numeric);
        let allowed = fu == tu
            || (numeric(fu) && numeric(tu))
            || (fu.enum_variants().is_some() && numeric(tu))
            || (numeric(fu) && tu.enum_variants().is_some());
        if !allowed {
            return Err(type_mismatch("Convert", &ty, &from));
        }
        Ok(NativeExpr::Convert {
            operand: Box::new(operand),
            ty,
        })
    }

    /// Builds a binary node from operands that already have compatible
    /// types. No conversions are inserted.
    pub fn make_binary(op: BinaryOp, left: NativeExpr, right: NativeExpr) -> QueryResult<NativeExpr> {
        let (lt, rt) = (left.ty(), right.ty());
        let node = format!("Binary {}", op.symbol());
        let ty = match op {
            BinaryOp::And | BinaryOp::Or => {
                if lt != NativeType::bool() || rt != NativeType::bool() {
                    return Err(QueryError::translation(&node, "operands must be bool"));
                }
                NativeType::bool()
            }
            BinaryOp::Coalesce => {
                if !lt.accepts_null() {
                    return Err(QueryError::translation(&node, format!("'{lt}' is never null")));
                }
                if lt.underlying() != &rt && lt != rt {
                    return Err(type_mismatch(&node, lt.underlying(), &rt));
                }
                rt
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                if lt != rt {
                    return Err(type_mismatch(&node, &lt, &rt));
                }
                NativeType::bool()
            }
            BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual => {
                if lt != rt {
                    return Err(type_mismatch(&node, &lt, &rt));
                }
                let orderable = lt.underlying().is_primitive() || lt.underlying().enum_variants().is_some();
                if !orderable {
                    return Err(QueryError::translation(&node, format!("'{lt}' is not ordered")));
                }
                NativeType::bool()
            }
            _ => {
                if lt != rt {
                    return Err(type_mismatch(&node, &lt, &rt));
                }
                let kind = lt.underlying().as_primitive();
                let ok = match kind {
                    Some(PrimitiveKind::String) => op == BinaryOp::Add,
                    Some(k) => k.is_numeric(),
                    None => false,
                };
                if !ok {
                    return Err(QueryError::translation(
                        &node,
                        format!("operator not defined for '{lt}'"),
                    ));
                }
                lt
            }
        };
        Ok(NativeExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
        })
    }

    /// Builds a binary node, first promoting the operands to a common type
    /// the way a compiler inserts implicit conversions. The operands keep
    /// their own types; the promotion shows up as `Convert` nodes.
    pub fn binary(op: BinaryOp, left: NativeExpr, right: NativeExpr) -> QueryResult<NativeExpr> {
        if op.is_logical() || op == BinaryOp::Coalesce {
            return Self::make_binary(op, left, right);
        }
        let (lt, rt) = (left.ty(), right.ty());
        if lt == rt {
            return Self::make_binary(op, left, right);
        }
        let (lu, ru) = (lt.underlying(), rt.underlying());
        let base = match (lu.as_primitive(), ru.as_primitive()) {
            (Some(a), Some(b)) => PrimitiveKind::promote(a, b).map(NativeType::primitive),
            _ if lu == ru => Some(lu.clone()),
            _ => None,
        };
        let Some(base) = base else {
            return Self::make_binary(op, left, right);
        };
        let lifted = lt.is_nullable() || rt.is_nullable();
        let target = if lifted {
            NativeType::nullable(base)
        } else {
            base
        };
        Self::make_binary(op, left.convert_to(&target), right.convert_to(&target))
    }

    pub fn eq(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Equal, self, other)
    }

    pub fn ne(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::NotEqual, self, other)
    }

    pub fn lt(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::LessThan, self, other)
    }

    pub fn le(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::LessThanOrEqual, self, other)
    }

    pub fn gt(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::GreaterThan, self, other)
    }

    pub fn ge(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::GreaterThanOrEqual, self, other)
    }

    pub fn add(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Add, self, other)
    }

    pub fn sub(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Subtract, self, other)
    }

    pub fn mul(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Multiply, self, other)
    }

    pub fn div(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Divide, self, other)
    }

    pub fn and(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Or, self, other)
    }

    pub fn coalesce(self, other: NativeExpr) -> QueryResult<NativeExpr> {
        Self::binary(BinaryOp::Coalesce, self, other)
    }

    pub fn unary(op: UnaryOp, operand: NativeExpr) -> QueryResult<NativeExpr> {
        let ty = operand.ty();
        let ok = match op {
            UnaryOp::Not => ty == NativeType::bool(),
            UnaryOp::Negate => ty.underlying().as_primitive().is_some_and(PrimitiveKind::is_numeric),
        };
        if !ok {
            return Err(QueryError::translation(
                format!("Unary {op:?}"),
                format!("operator not defined for '{ty}'"),
            ));
        }
        Ok(NativeExpr::Unary {
            op,
            operand: Box::new(operand),
            ty,
        })
    }

    pub fn not(self) -> QueryResult<NativeExpr> {
        Self::unary(UnaryOp::Not, self)
    }

    pub fn conditional(test: NativeExpr, if_true: NativeExpr, if_false: NativeExpr) -> QueryResult<NativeExpr> {
        if test.ty() != NativeType::bool() {
            return Err(type_mismatch("Conditional", &NativeType::bool(), &test.ty()));
        }
        let ty = if_true.ty();
        if if_false.ty() != ty {
            return Err(type_mismatch("Conditional", &ty, &if_false.ty()));
        }
        Ok(NativeExpr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
            ty,
        })
    }

    pub fn new_object(ctor: Constructor, args: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        check_items("New", ctor.param_types(), &args)?;
        Ok(NativeExpr::New { ctor, args })
    }

    /// Projection into a structurally generated type, e.g.
    /// `new { Name = x.Name, Total = x.Price * x.Qty }`.
    pub fn new_anonymous(members: Vec<(&str, NativeExpr)>) -> QueryResult<NativeExpr> {
        let fields = members
            .iter()
            .map(|(name, e)| FieldDef::new(*name, e.ty()))
            .collect();
        let ty = NativeType::anonymous(fields);
        let ctor = Constructor::positional(&ty)?;
        Self::new_object(ctor, members.into_iter().map(|(_, e)| e).collect())
    }

    pub fn member_init(
        ctor: Constructor,
        args: Vec<NativeExpr>,
        bindings: Vec<(Member, NativeExpr)>,
    ) -> QueryResult<NativeExpr> {
        check_items("MemberInit", ctor.param_types(), &args)?;
        for (member, value) in &bindings {
            if member.declaring_type != ctor.ty {
                return Err(type_mismatch("MemberInit", &ctor.ty, &member.declaring_type));
            }
            if value.ty() != member.ty {
                return Err(type_mismatch(&format!("MemberInit {}", member.name), &member.ty, &value.ty()));
            }
        }
        Ok(NativeExpr::MemberInit { ctor, args, bindings })
    }

    pub fn new_array(element_type: NativeType, items: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        check_uniform("NewArray", &element_type, &items)?;
        Ok(NativeExpr::NewArray { element_type, items })
    }

    pub fn list_init(element_type: NativeType, items: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        check_uniform("ListInit", &element_type, &items)?;
        Ok(NativeExpr::ListInit { element_type, items })
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&NativeExpr> {
        match self {
            NativeExpr::Constant { .. }
            | NativeExpr::Captured { .. }
            | NativeExpr::Source(_)
            | NativeExpr::Resource { .. }
            | NativeExpr::Parameter(_) => Vec::new(),
            NativeExpr::Member { target, .. } => target.iter().map(|t| t.as_ref()).collect(),
            NativeExpr::Call { target, args, .. } => {
                target.iter().map(|t| t.as_ref()).chain(args.iter()).collect()
            }
            NativeExpr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            NativeExpr::Unary { operand, .. } | NativeExpr::Convert { operand, .. } => vec![operand.as_ref()],
            NativeExpr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => vec![test.as_ref(), if_true.as_ref(), if_false.as_ref()],
            NativeExpr::New { args, .. } => args.iter().collect(),
            NativeExpr::MemberInit { args, bindings, .. } => {
                args.iter().chain(bindings.iter().map(|(_, e)| e)).collect()
            }
            NativeExpr::NewArray { items, .. } | NativeExpr::ListInit { items, .. } => items.iter().collect(),
            NativeExpr::Lambda(lambda) => vec![lambda.body.as_ref()],
        }
    }

    /// Whether any node in the tree satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&NativeExpr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|c| c.any(pred))
    }

    /// Rebuilds this node with each direct child replaced by `f(child)`.
    pub fn map_children<F>(self, mut f: F) -> QueryResult<NativeExpr>
    where
        F: FnMut(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let mut boxed = |e: Box<NativeExpr>| -> QueryResult<Box<NativeExpr>> { Ok(Box::new(f(*e)?)) };
        Ok(match self {
            leaf @ (NativeExpr::Constant { .. }
            | NativeExpr::Captured { .. }
            | NativeExpr::Source(_)
            | NativeExpr::Resource { .. }
            | NativeExpr::Parameter(_)) => leaf,
            NativeExpr::Member { target, member } => NativeExpr::Member {
                target: target.map(&mut boxed).transpose()?,
                member,
            },
            NativeExpr::Call { target, method, args } => NativeExpr::Call {
                target: target.map(&mut boxed).transpose()?,
                method,
                args: args
                    .into_iter()
                    .map(|a| Ok(*boxed(Box::new(a))?))
                    .collect::<QueryResult<_>>()?,
            },
            NativeExpr::Binary { op, left, right, ty } => NativeExpr::Binary {
                op,
                left: boxed(left)?,
                right: boxed(right)?,
                ty,
            },
            NativeExpr::Unary { op, operand, ty } => NativeExpr::Unary {
                op,
                operand: boxed(operand)?,
                ty,
            },
            NativeExpr::Convert { operand, ty } => NativeExpr::Convert {
                operand: boxed(operand)?,
                ty,
            },
            NativeExpr::Conditional {
                test,
                if_true,
                if_false,
                ty,
            } => NativeExpr::Conditional {
                test: boxed(test)?,
                if_true: boxed(if_true)?,
                if_false: boxed(if_false)?,
                ty,
            },
            NativeExpr::New { ctor, args } => NativeExpr::New {
                ctor,
                args: args
                    .into_iter()
                    .map(|a| Ok(*boxed(Box::new(a))?))
                    .collect::<QueryResult<_>>()?,
            },
            NativeExpr::MemberInit { ctor, args, bindings } => NativeExpr::MemberInit {
                ctor,
                args: args
                    .into_iter()
                    .map(|a| Ok(*boxed(Box::new(a))?))
                    .collect::<QueryResult<_>>()?,
                bindings: bindings
                    .into_iter()
                    .map(|(m, e)| Ok((m, *boxed(Box::new(e))?)))
                    .collect::<QueryResult<_>>()?,
            },
            NativeExpr::NewArray { element_type, items } => NativeExpr::NewArray {
                element_type,
                items: items
                    .into_iter()
                    .map(|a| Ok(*boxed(Box::new(a))?))
                    .collect::<QueryResult<_>>()?,
            },
            NativeExpr::ListInit { element_type, items } => NativeExpr::ListInit {
                element_type,
                items: items
                    .into_iter()
                    .map(|a| Ok(*boxed(Box::new(a))?))
                    .collect::<QueryResult<_>>()?,
            },
            NativeExpr::Lambda(lambda) => NativeExpr::Lambda(Lambda {
                params: lambda.params,
                body: boxed(lambda.body)?,
            }),
        })
    }

    /// Bottom-up rewrite: children first, then `f` on the rebuilt node.
    pub fn transform<F>(self, f: &mut F) -> QueryResult<NativeExpr>
    where
        F: FnMut(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let rebuilt = self.map_children(|child| child.transform(&mut *f))?;
        f(rebuilt)
    }
}

fn check_items(node: &str, expected: &[NativeType], args: &[NativeExpr]) -> QueryResult<()> {
    if expected.len() != args.len() {
        return Err(QueryError::translation(
            node,
            format!("expected {} arguments, got {}", expected.len(), args.len()),
        ));
    }
    for (arg, ty) in args.iter().zip(expected) {
        let actual = arg.ty();
        if &actual != ty {
            return Err(type_mismatch(node, ty, &actual));
        }
    }
    Ok(())
}

fn check_uniform(node: &str, element_type: &NativeType, items: &[NativeExpr]) -> QueryResult<()> {
    for item in items {
        let actual = item.ty();
        if &actual != element_type {
            return Err(type_mismatch(node, element_type, &actual));
        }
    }
    Ok(())
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(v) => write!(f, "{v}"),
        Value::String(s) => write!(f, "{s:?}"),
        Value::Char(c) => write!(f, "{c:?}"),
        Value::Enum { ty, variant } => write!(f, "{ty}.{variant}"),
        Value::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
        Value::Date(d) => write!(f, "{d}"),
        Value::Uuid(u) => write!(f, "{u}"),
        Value::List(items) => {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                fmt_value(item, f)?;
            }
            f.write_str("]")
        }
        other => match (other.as_i128(), other.as_f64()) {
            (Some(i), _) => write!(f, "{i}"),
            (None, Some(v)) => write!(f, "{v}"),
            _ => write!(f, "{other:?}"),
        },
    }
}

fn fmt_list(items: &[NativeExpr], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for NativeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeExpr::Constant { value, .. } => fmt_value(value, f),
            NativeExpr::Captured { value, .. } => {
                f.write_str("$(")?;
                fmt_value(value, f)?;
                f.write_str(")")
            }
            NativeExpr::Source(source) => write!(f, "source<{}>", source.name()),
            NativeExpr::Resource { element_type } => write!(f, "resource<{element_type}>"),
            NativeExpr::Parameter(p) => f.write_str(&p.name),
            NativeExpr::Member { target, member } => match target {
                Some(t) => write!(f, "{t}.{}", member.name),
                None => write!(f, "{}.{}", member.declaring_type, member.name),
            },
            NativeExpr::Call { target, method, args } => match (target, args.split_first()) {
                (Some(t), _) => {
                    write!(f, "{t}.{}(", method.name())?;
                    fmt_list(args, f)?;
                    f.write_str(")")
                }
                (None, Some((source, rest))) if !method.is_local() => {
                    write!(f, "{source}.{}(", method.name())?;
                    fmt_list(rest, f)?;
                    f.write_str(")")
                }
                _ => {
                    write!(f, "{}(", method.name())?;
                    fmt_list(args, f)?;
                    f.write_str(")")
                }
            },
            NativeExpr::Binary { op, left, right, .. } => write!(f, "({left} {} {right})", op.symbol()),
            NativeExpr::Unary { op, operand, .. } => match op {
                UnaryOp::Not => write!(f, "!{operand}"),
                UnaryOp::Negate => write!(f, "-{operand}"),
            },
            NativeExpr::Convert { operand, ty } => write!(f, "({ty}){operand}"),
            NativeExpr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => write!(f, "({test} ? {if_true} : {if_false})"),
            NativeExpr::New { ctor, args } if ctor.ty.is_anonymous() => {
                f.write_str("new { ")?;
                for (i, (field, arg)) in ctor.ty.fields().iter().zip(args).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {arg}", field.name)?;
                }
                f.write_str(" }")
            }
            NativeExpr::New { ctor, args } => {
                write!(f, "new {}(", ctor.ty)?;
                fmt_list(args, f)?;
                f.write_str(")")
            }
            NativeExpr::MemberInit { ctor, args, bindings } => {
                write!(f, "new {}(", ctor.ty)?;
                fmt_list(args, f)?;
                f.write_str(") { ")?;
                for (i, (member, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {value}", member.name)?;
                }
                f.write_str(" }")
            }
            NativeExpr::NewArray { element_type, items } => {
                write!(f, "new {element_type}[] {{ ")?;
                fmt_list(items, f)?;
                f.write_str(" }")
            }
            NativeExpr::ListInit { items, .. } => {
                f.write_str("[")?;
                fmt_list(items, f)?;
                f.write_str("]")
            }
            NativeExpr::Lambda(lambda) => {
                match lambda.params.as_slice() {
                    [single] => write!(f, "{}", single.name)?,
                    params => {
                        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
                        write!(f, "({})", names.join(", "))?;
                    }
                }
                write!(f, " => {}", lambda.body)
            }
        }
    }
}

impl fmt::Debug for NativeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&NativeExpr::Lambda(self.clone()), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> NativeType {
        NativeType::record(
            "Product",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Stock", NativeType::i32()),
                FieldDef::new("Discount", NativeType::nullable(NativeType::f64())),
            ],
        )
    }

    #[test]
    fn test_promotion_keeps_captured_type() {
        let x = ParamRef::new("x", product());
        let stock = x.expr().member("Stock").unwrap();
        let threshold = NativeExpr::captured(Value::I16(5), NativeType::primitive(PrimitiveKind::I16));
        let cmp = stock.gt(threshold).unwrap();
        match &cmp {
            NativeExpr::Binary { right, .. } => match right.as_ref() {
                NativeExpr::Convert { operand, ty } => {
                    assert_eq!(ty, &NativeType::i32());
                    assert_eq!(operand.ty().name(), "i16");
                }
                other => panic!("expected a conversion, got {other}"),
            },
            other => panic!("unexpected {other}"),
        }
        assert_eq!(cmp.to_string(), "(x.Stock > (i32)$(5))");
    }

    #[test]
    fn test_nullable_lifting() {
        let x = ParamRef::new("x", product());
        let discount = x.expr().member("Discount").unwrap();
        let cmp = discount.gt(NativeExpr::constant(0.1, NativeType::f64())).unwrap();
        match cmp {
            NativeExpr::Binary { right, ty, .. } => {
                assert_eq!(ty, NativeType::bool());
                assert_eq!(right.ty().name(), "Nullable<f64>");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_make_binary_rejects_mismatch() {
        let l = NativeExpr::constant(1, NativeType::i32());
        let r = NativeExpr::constant(1i64, NativeType::i64());
        assert!(NativeExpr::make_binary(BinaryOp::Equal, l, r).is_err());
    }

    #[test]
    fn test_builtin_members() {
        let s = NativeExpr::constant("abc", NativeType::string());
        assert_eq!(s.member("Length").unwrap().ty(), NativeType::i32());
        let n = NativeExpr::null(NativeType::nullable(NativeType::i32()));
        assert_eq!(n.clone().member("HasValue").unwrap().ty(), NativeType::bool());
        assert_eq!(n.member("Value").unwrap().ty(), NativeType::i32());
        assert!(NativeExpr::constant(1, NativeType::i32()).member("Length").is_err());
    }

    #[test]
    fn test_anonymous_projection() {
        let x = ParamRef::new("x", product());
        let body = NativeExpr::new_anonymous(vec![
            ("Name", x.expr().member("Name").unwrap()),
            ("Doubled", x.expr().member("Stock").unwrap().mul(NativeExpr::constant(2, NativeType::i32())).unwrap()),
        ])
        .unwrap();
        assert!(body.ty().is_anonymous());
        assert_eq!(body.to_string(), "new { Name = x.Name, Doubled = (x.Stock * 2) }");
    }

    #[test]
    fn test_constructor_must_be_positional() {
        let ty = product();
        assert!(Constructor::resolve(&ty, vec![NativeType::string()]).is_err());
        assert!(Constructor::parameterless(&ty).is_ok());
        assert_eq!(Constructor::positional(&ty).unwrap().param_types().len(), 3);
    }
}
