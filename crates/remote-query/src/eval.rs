//! Interpreter for native expression trees over in-memory sequences.
//!
//! This is the execution engine of the in-memory backend and of local
//! partial evaluation. Queryable results evaluate to `Value::List`.

use std::cmp::Ordering;

use chrono::Datelike;

use crate::error::{QueryError, QueryResult};
use crate::expression::{BinaryOp, UnaryOp};
use crate::native::{BuiltinMember, Lambda, MemberAccess, MethodOp, NativeExpr, QueryOperator, StringFn};
use crate::types::{NativeType, PrimitiveKind};
use crate::value::{default_value, ObjectRef, Value};

/// Evaluates a closed tree (no free parameters).
pub fn evaluate(expr: &NativeExpr) -> QueryResult<Value> {
    Evaluator::new().eval(expr)
}

fn fail(message: impl Into<String>) -> QueryError {
    QueryError::Evaluation(message.into())
}

/// Tree-walking evaluator with a stack of lambda parameter bindings.
#[derive(Default)]
pub struct Evaluator {
    scope: Vec<(String, Value)>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a free parameter for subsequent evaluations.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.scope.push((name.into(), value));
    }

    pub fn eval(&mut self, expr: &NativeExpr) -> QueryResult<Value> {
        match expr {
            NativeExpr::Constant { value, .. } | NativeExpr::Captured { value, .. } => Ok(value.clone()),
            NativeExpr::Source(source) => {
                tracing::debug!("Scanning data source {}", source.name());
                Ok(Value::List(source.scan()?))
            }
            NativeExpr::Resource { element_type } => Err(fail(format!(
                "Resource<{element_type}> is not bound to a data source"
            ))),
            NativeExpr::Parameter(p) => self
                .scope
                .iter()
                .rev()
                .find(|(name, _)| name == &p.name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| fail(format!("Unbound parameter '{}'", p.name))),
            NativeExpr::Member { target, member } => {
                let target = target
                    .as_deref()
                    .ok_or_else(|| fail(format!("Member '{}' has no target", member.name())))?;
                let value = self.eval(target)?;
                read_member(&value, member.access(), member.name())
            }
            NativeExpr::Call { target, method, args } => match method.op() {
                MethodOp::Query(_, op) => self.eval_query(*op, expr, args, method.return_type()),
                MethodOp::String(f) => {
                    let target = target
                        .as_deref()
                        .ok_or_else(|| fail(format!("{} needs a receiver", f.name())))?;
                    let receiver = self.eval(target)?;
                    let args = self.eval_all(args)?;
                    string_call(*f, &receiver, &args)
                }
                // Include markers do not change the result of an in-memory query.
                MethodOp::Include(_) => match args.first() {
                    Some(source) => self.eval(source),
                    None => Err(fail("Include without a source")),
                },
                MethodOp::Local(f) => {
                    let args = self.eval_all(args)?;
                    f(&args)
                }
            },
            NativeExpr::Binary { op, left, right, ty } => self.eval_binary(*op, left, right, ty),
            NativeExpr::Unary { op, operand, ty } => {
                let value = self.eval(operand)?;
                match (op, &value) {
                    (_, Value::Null) => Ok(Value::Null),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Negate, v) => negate(v, ty),
                    _ => Err(fail(format!("Cannot apply {op:?} to {value:?}"))),
                }
            }
            NativeExpr::Convert { operand, ty } => self.eval(operand)?.cast(ty),
            NativeExpr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => match self.eval(test)? {
                Value::Bool(true) => self.eval(if_true),
                Value::Bool(false) => self.eval(if_false),
                other => Err(fail(format!("Condition evaluated to {other:?}"))),
            },
            NativeExpr::New { ctor, args } => {
                let values = self.eval_all(args)?;
                construct(ctor.ty(), values)
            }
            NativeExpr::MemberInit { ctor, args, bindings } => {
                let values = self.eval_all(args)?;
                let obj = construct(ctor.ty(), values)?;
                if let Value::Object(target) = &obj {
                    for (member, value) in bindings {
                        let value = self.eval(value)?;
                        target.set(member.name(), value)?;
                    }
                }
                Ok(obj)
            }
            NativeExpr::NewArray { items, .. } | NativeExpr::ListInit { items, .. } => {
                Ok(Value::List(self.eval_all(items)?))
            }
            NativeExpr::Lambda(_) => Err(fail("A lambda cannot be evaluated as a value")),
        }
    }

    fn eval_all(&mut self, exprs: &[NativeExpr]) -> QueryResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn apply(&mut self, lambda: &Lambda, args: Vec<Value>) -> QueryResult<Value> {
        if lambda.params.len() != args.len() {
            return Err(fail(format!(
                "Lambda takes {} arguments, got {}",
                lambda.params.len(),
                args.len()
            )));
        }
        let depth = self.scope.len();
        for (param, arg) in lambda.params.iter().zip(args) {
            self.scope.push((param.name.clone(), arg));
        }
        let result = self.eval(&lambda.body);
        self.scope.truncate(depth);
        result
    }

    fn test(&mut self, lambda: &Lambda, item: &Value) -> QueryResult<bool> {
        match self.apply(lambda, vec![item.clone()])? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(fail(format!("Predicate returned {other:?}"))),
        }
    }

    fn sequence(&mut self, expr: &NativeExpr) -> QueryResult<Vec<Value>> {
        match self.eval(expr)? {
            Value::List(items) => Ok(items),
            Value::Null => Err(fail("Sequence is null")),
            other => Err(fail(format!("Expected a sequence, got {other:?}"))),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &NativeExpr, right: &NativeExpr, ty: &NativeType) -> QueryResult<Value> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let l = self.eval(left)?.as_bool().ok_or_else(|| fail("Logical operand is not bool"))?;
                if (op == BinaryOp::And && !l) || (op == BinaryOp::Or && l) {
                    return Ok(Value::Bool(l));
                }
                let r = self.eval(right)?.as_bool().ok_or_else(|| fail("Logical operand is not bool"))?;
                return Ok(Value::Bool(r));
            }
            BinaryOp::Coalesce => {
                let l = self.eval(left)?;
                return if l.is_null() { self.eval(right) } else { Ok(l) };
            }
            _ => {}
        }
        let l = self.eval(left)?;
        let r = self.eval(right)?;
        if op.is_comparison() {
            return Ok(Value::Bool(compare_op(op, &l, &r)));
        }
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        arithmetic(op, &l, &r, ty)
    }

    fn eval_query(
        &mut self,
        op: QueryOperator,
        call: &NativeExpr,
        args: &[NativeExpr],
        return_type: &NativeType,
    ) -> QueryResult<Value> {
        use QueryOperator as Q;
        if op.is_ordering() {
            return self.eval_ordering(call);
        }
        let source = args.first().ok_or_else(|| fail(format!("{} without a source", op.name())))?;
        let items = self.sequence(source)?;
        let lambda = |i: usize| {
            args.get(i)
                .and_then(NativeExpr::as_lambda)
                .ok_or_else(|| fail(format!("{} expects a lambda argument", op.name())))
        };

        match op {
            Q::Where => {
                let predicate = lambda(1)?;
                let mut kept = Vec::new();
                for item in items {
                    if self.test(predicate, &item)? {
                        kept.push(item);
                    }
                }
                Ok(Value::List(kept))
            }
            Q::Select => {
                let selector = lambda(1)?;
                let mapped = items
                    .into_iter()
                    .map(|item| self.apply(selector, vec![item]))
                    .collect::<QueryResult<Vec<_>>>()?;
                Ok(Value::List(mapped))
            }
            Q::Skip | Q::Take => {
                let n = self
                    .eval(&args[1])?
                    .as_i128()
                    .ok_or_else(|| fail(format!("{} count is not an integer", op.name())))?;
                let n = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
                let items: Vec<Value> = if op == Q::Skip {
                    items.into_iter().skip(n).collect()
                } else {
                    items.into_iter().take(n).collect()
                };
                Ok(Value::List(items))
            }
            Q::Join => {
                let inner = self.sequence(&args[1])?;
                let (outer_key, inner_key, result) = (lambda(2)?, lambda(3)?, lambda(4)?);
                let inner_keys = inner
                    .iter()
                    .map(|i| self.apply(inner_key, vec![i.clone()]))
                    .collect::<QueryResult<Vec<_>>>()?;
                let mut joined = Vec::new();
                for o in items {
                    let key = self.apply(outer_key, vec![o.clone()])?;
                    if key.is_null() {
                        continue;
                    }
                    for (i, ikey) in inner.iter().zip(&inner_keys) {
                        if key.loose_eq(ikey) {
                            joined.push(self.apply(result, vec![o.clone(), i.clone()])?);
                        }
                    }
                }
                Ok(Value::List(joined))
            }
            Q::GroupBy => {
                let key_selector = lambda(1)?;
                let grouping = return_type
                    .element_type()
                    .ok_or_else(|| fail("GroupBy result is not a sequence"))?;
                let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
                for item in items {
                    let key = self.apply(key_selector, vec![item.clone()])?;
                    match groups.iter_mut().find(|(k, _)| k.loose_eq(&key)) {
                        Some((_, members)) => members.push(item),
                        None => groups.push((key, vec![item])),
                    }
                }
                let groups = groups
                    .into_iter()
                    .map(|(key, members)| {
                        ObjectRef::new(&grouping, vec![key, Value::List(members)]).map(Value::Object)
                    })
                    .collect::<QueryResult<Vec<_>>>()?;
                Ok(Value::List(groups))
            }
            Q::Distinct => {
                let mut unique: Vec<Value> = Vec::new();
                for item in items {
                    if !unique.iter().any(|u| u.loose_eq(&item)) {
                        unique.push(item);
                    }
                }
                Ok(Value::List(unique))
            }
            Q::Count | Q::Any => {
                let matching = match args.get(1) {
                    Some(_) => {
                        let predicate = lambda(1)?;
                        let mut n = 0usize;
                        for item in &items {
                            if self.test(predicate, item)? {
                                n += 1;
                                if op == Q::Any {
                                    break;
                                }
                            }
                        }
                        n
                    }
                    None => items.len(),
                };
                if op == Q::Any {
                    return Ok(Value::Bool(matching > 0));
                }
                i32::try_from(matching)
                    .map(Value::I32)
                    .map_err(|_| fail("Count overflowed i32"))
            }
            Q::All => {
                let predicate = lambda(1)?;
                for item in &items {
                    if !self.test(predicate, item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Q::First | Q::FirstOrDefault | Q::Single | Q::SingleOrDefault => {
                let candidates = match args.get(1) {
                    Some(_) => {
                        let predicate = lambda(1)?;
                        let mut kept = Vec::new();
                        for item in items {
                            if self.test(predicate, &item)? {
                                kept.push(item);
                                if matches!(op, Q::First | Q::FirstOrDefault) {
                                    break;
                                }
                            }
                        }
                        kept
                    }
                    None => items,
                };
                let single = matches!(op, Q::Single | Q::SingleOrDefault);
                if single && candidates.len() > 1 {
                    return Err(fail("Sequence contains more than one element"));
                }
                match candidates.into_iter().next() {
                    Some(first) => Ok(first),
                    None if matches!(op, Q::FirstOrDefault | Q::SingleOrDefault) => {
                        Ok(default_value(return_type))
                    }
                    None => Err(fail("Sequence contains no elements")),
                }
            }
            Q::Sum | Q::Min | Q::Max | Q::Average => {
                let selector = lambda(1)?;
                let mut selected = Vec::with_capacity(items.len());
                for item in items {
                    let v = self.apply(selector, vec![item])?;
                    if !v.is_null() {
                        selected.push(v);
                    }
                }
                aggregate(op, selected, return_type)
            }
            Q::Contains => {
                let needle = self.eval(&args[1])?;
                Ok(Value::Bool(items.iter().any(|i| i.loose_eq(&needle))))
            }
            Q::OrderBy | Q::OrderByDescending | Q::ThenBy | Q::ThenByDescending => {
                self.eval_ordering(call)
            }
        }
    }

    /// Evaluates an `OrderBy(..).ThenBy(..)...` chain ending at `call` as one
    /// stable multi-key sort.
    fn eval_ordering(&mut self, call: &NativeExpr) -> QueryResult<Value> {
        let mut keys: Vec<(&Lambda, bool)> = Vec::new();
        let mut current = call;
        let source = loop {
            let (op, args) = match current {
                NativeExpr::Call { method, args, .. } => match method.query_operator() {
                    Some(op) if op.is_ordering() => (op, args),
                    _ => return Err(fail("Malformed ordering chain")),
                },
                _ => return Err(fail("Malformed ordering chain")),
            };
            let key = args
                .get(1)
                .and_then(NativeExpr::as_lambda)
                .ok_or_else(|| fail(format!("{} expects a key selector", op.name())))?;
            keys.push((key, op.is_descending()));
            let inner = args.first().ok_or_else(|| fail("Ordering without a source"))?;
            if matches!(op, QueryOperator::OrderBy | QueryOperator::OrderByDescending) {
                break inner;
            }
            current = inner;
        };
        keys.reverse();

        let items = self.sequence(source)?;
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let mut row = Vec::with_capacity(keys.len());
            for (key, _) in &keys {
                row.push(self.apply(key, vec![item.clone()])?);
            }
            keyed.push((row, item));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (_, descending)) in keys.iter().enumerate() {
                let ord = a[i].compare(&b[i]).unwrap_or(Ordering::Equal);
                let ord = if *descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
    }
}

fn read_member(value: &Value, access: MemberAccess, name: &str) -> QueryResult<Value> {
    match (access, value) {
        (MemberAccess::Builtin(BuiltinMember::HasValue), v) => Ok(Value::Bool(!v.is_null())),
        (_, Value::Null) => Err(fail(format!("Null reference reading member '{name}'"))),
        (MemberAccess::Field(index), Value::Object(obj)) => obj
            .get_index(index)
            .ok_or_else(|| fail(format!("Object has no field at {index} ('{name}')"))),
        (MemberAccess::Builtin(BuiltinMember::Value), v) => Ok(v.clone()),
        (MemberAccess::Builtin(BuiltinMember::Length), Value::String(s)) => {
            Ok(Value::I32(s.chars().count() as i32))
        }
        (MemberAccess::Builtin(BuiltinMember::Count | BuiltinMember::Length), Value::List(items)) => {
            Ok(Value::I32(items.len() as i32))
        }
        (MemberAccess::Builtin(b @ (BuiltinMember::Year | BuiltinMember::Month | BuiltinMember::Day)), v) => {
            let date = match v {
                Value::DateTime(d) => d.date_naive(),
                Value::Date(d) => *d,
                other => return Err(fail(format!("{other:?} is not a date"))),
            };
            Ok(Value::I32(match b {
                BuiltinMember::Year => date.year(),
                BuiltinMember::Month => date.month() as i32,
                _ => date.day() as i32,
            }))
        }
        (_, other) => Err(fail(format!("Cannot read member '{name}' of {other:?}"))),
    }
}

fn string_call(f: StringFn, receiver: &Value, args: &[Value]) -> QueryResult<Value> {
    let s = receiver
        .as_str()
        .ok_or_else(|| fail(format!("{} called on {receiver:?}", f.name())))?;
    let arg = || {
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| fail(format!("{} needs a string argument", f.name())))
    };
    Ok(match f {
        StringFn::Contains => Value::Bool(s.contains(arg()?)),
        StringFn::StartsWith => Value::Bool(s.starts_with(arg()?)),
        StringFn::EndsWith => Value::Bool(s.ends_with(arg()?)),
        StringFn::ToUpper => Value::String(s.to_uppercase()),
        StringFn::ToLower => Value::String(s.to_lowercase()),
        StringFn::Trim => Value::String(s.trim().to_string()),
    })
}

fn compare_op(op: BinaryOp, l: &Value, r: &Value) -> bool {
    match op {
        BinaryOp::Equal => l.loose_eq(r),
        BinaryOp::NotEqual => !l.loose_eq(r),
        _ if l.is_null() || r.is_null() => false,
        _ => match l.compare(r) {
            Some(ord) => match op {
                BinaryOp::LessThan => ord == Ordering::Less,
                BinaryOp::LessThanOrEqual => ord != Ordering::Greater,
                BinaryOp::GreaterThan => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            },
            None => false,
        },
    }
}

/// Truncates an integer result to the width of `kind`, like unchecked
/// arithmetic does.
fn wrap_int(kind: PrimitiveKind, v: i128) -> Value {
    match kind {
        PrimitiveKind::I8 => Value::I8(v as i8),
        PrimitiveKind::I16 => Value::I16(v as i16),
        PrimitiveKind::I32 => Value::I32(v as i32),
        PrimitiveKind::U8 => Value::U8(v as u8),
        PrimitiveKind::U16 => Value::U16(v as u16),
        PrimitiveKind::U32 => Value::U32(v as u32),
        PrimitiveKind::U64 => Value::U64(v as u64),
        _ => Value::I64(v as i64),
    }
}

fn float_value(kind: PrimitiveKind, v: f64) -> Value {
    if kind == PrimitiveKind::F32 {
        Value::F32(v as f32)
    } else {
        Value::F64(v)
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value, ty: &NativeType) -> QueryResult<Value> {
    let kind = ty
        .underlying()
        .as_primitive()
        .ok_or_else(|| fail(format!("Operator {} not defined for '{ty}'", op.symbol())))?;
    if kind == PrimitiveKind::String {
        let (Some(a), Some(b)) = (l.as_str(), r.as_str()) else {
            return Err(fail("String concatenation of non-strings"));
        };
        return Ok(Value::String(format!("{a}{b}")));
    }
    if kind.is_integer() {
        let (a, b) = l
            .as_i128()
            .zip(r.as_i128())
            .ok_or_else(|| fail(format!("Integer operands expected for {}", op.symbol())))?;
        let v = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a.wrapping_mul(b),
            BinaryOp::Divide | BinaryOp::Modulo if b == 0 => {
                return Err(fail("Attempted to divide by zero"))
            }
            BinaryOp::Divide => a / b,
            BinaryOp::Modulo => a % b,
            _ => return Err(fail(format!("Operator {} is not arithmetic", op.symbol()))),
        };
        return Ok(wrap_int(kind, v));
    }
    let (a, b) = l
        .as_f64()
        .zip(r.as_f64())
        .ok_or_else(|| fail(format!("Numeric operands expected for {}", op.symbol())))?;
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        _ => return Err(fail(format!("Operator {} is not arithmetic", op.symbol()))),
    };
    Ok(float_value(kind, v))
}

fn negate(v: &Value, ty: &NativeType) -> QueryResult<Value> {
    let kind = ty
        .underlying()
        .as_primitive()
        .ok_or_else(|| fail(format!("Cannot negate '{ty}'")))?;
    if let Some(i) = v.as_i128() {
        return Ok(wrap_int(kind, -i));
    }
    v.as_f64()
        .map(|f| float_value(kind, -f))
        .ok_or_else(|| fail(format!("Cannot negate {v:?}")))
}

fn construct(ty: &NativeType, values: Vec<Value>) -> QueryResult<Value> {
    let obj = if values.is_empty() {
        ObjectRef::allocate(ty)?
    } else {
        ObjectRef::new(ty, values)?
    };
    Ok(Value::Object(obj))
}

fn aggregate(op: QueryOperator, values: Vec<Value>, return_type: &NativeType) -> QueryResult<Value> {
    let kind = return_type.underlying().as_primitive();
    match op {
        QueryOperator::Sum => {
            let kind = kind.ok_or_else(|| fail("Sum over a non-numeric type"))?;
            if kind.is_integer() {
                let total: i128 = values.iter().filter_map(Value::as_i128).sum();
                Ok(wrap_int(kind, total))
            } else {
                let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                Ok(float_value(kind, total))
            }
        }
        QueryOperator::Average => {
            if values.is_empty() {
                return if return_type.is_nullable() {
                    Ok(Value::Null)
                } else {
                    Err(fail("Sequence contains no elements"))
                };
            }
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            Ok(Value::F64(total / values.len() as f64))
        }
        _ => {
            let wanted = if op == QueryOperator::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let best = values.into_iter().reduce(|best, v| {
                if v.compare(&best) == Some(wanted) {
                    v
                } else {
                    best
                }
            });
            match best {
                Some(v) => Ok(v),
                None if return_type.accepts_null() => Ok(Value::Null),
                None => Err(fail("Sequence contains no elements")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ParamRef, Query};
    use crate::source::{InMemorySource, OnceSource};
    use crate::types::FieldDef;
    use std::sync::Arc;

    fn product_type() -> NativeType {
        NativeType::record(
            "Product",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Category", NativeType::string()),
                FieldDef::new("Price", NativeType::f64()),
                FieldDef::new("Stock", NativeType::i32()),
            ],
        )
    }

    fn products() -> Arc<dyn crate::source::DataSource> {
        let ty = product_type();
        let row = |name: &str, category: &str, price: f64, stock: i32| {
            Value::Object(
                ObjectRef::new(
                    &ty,
                    vec![name.into(), category.into(), Value::F64(price), Value::I32(stock)],
                )
                .unwrap(),
            )
        };
        InMemorySource::shared(
            ty.clone(),
            vec![
                row("Pen", "Office", 1.5, 100),
                row("Desk", "Furniture", 250.0, 3),
                row("Chair", "Furniture", 80.0, 12),
                row("Stapler", "Office", 9.0, 0),
            ],
        )
    }

    fn names(value: Value) -> Vec<String> {
        match value {
            Value::List(items) => items
                .iter()
                .map(|i| i.as_object().unwrap().get("Name").unwrap().as_str().unwrap().to_string())
                .collect(),
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_and_multi_key_sort() {
        let q = Query::from_source(products())
            .filter(|x| x.member("Price")?.lt(NativeExpr::constant(100.0, NativeType::f64())))
            .unwrap()
            .order_by(|x| x.member("Category"))
            .unwrap()
            .then_by_descending(|x| x.member("Stock"))
            .unwrap();
        let result = evaluate(q.expr()).unwrap();
        assert_eq!(names(result), vec!["Chair", "Pen", "Stapler"]);
    }

    #[test]
    fn test_group_by_counts() {
        let q = Query::from_source(products())
            .group_by(|x| x.member("Category"))
            .unwrap()
            .select(|g| {
                let count = g
                    .clone()
                    .member("Elements")?
                    .sequence_call(QueryOperator::Count, Vec::new(), Vec::new())?;
                NativeExpr::new_anonymous(vec![("Category", g.member("Key")?), ("Count", count)])
            })
            .unwrap();
        let Value::List(groups) = evaluate(q.expr()).unwrap() else {
            panic!("expected a list");
        };
        let first = groups[0].as_object().unwrap();
        assert_eq!(first.get("Category").unwrap().as_str(), Some("Office"));
        assert_eq!(first.get("Count"), Some(Value::I32(2)));
    }

    #[test]
    fn test_aggregates() {
        let sum = Query::from_source(products()).sum(|x| x.member("Stock")).unwrap();
        assert_eq!(evaluate(&sum).unwrap(), Value::I32(115));
        let max = Query::from_source(products()).max(|x| x.member("Price")).unwrap();
        assert_eq!(evaluate(&max).unwrap(), Value::F64(250.0));
        let avg = Query::from_source(products()).average(|x| x.member("Stock")).unwrap();
        assert_eq!(evaluate(&avg).unwrap(), Value::F64(28.75));
    }

    #[test]
    fn test_first_on_empty_fails_but_default_does_not() {
        let empty = || {
            Query::from_source(products())
                .filter(|x| x.member("Stock")?.gt(NativeExpr::constant(1000, NativeType::i32())))
                .unwrap()
        };
        assert!(matches!(evaluate(&empty().first().unwrap()), Err(QueryError::Evaluation(_))));
        assert_eq!(evaluate(&empty().first_or_default().unwrap()).unwrap(), Value::Null);
    }

    #[test]
    fn test_integer_division_by_zero() {
        let expr = NativeExpr::constant(1, NativeType::i32())
            .div(NativeExpr::constant(0, NativeType::i32()))
            .unwrap();
        assert!(matches!(evaluate(&expr), Err(QueryError::Evaluation(_))));
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let x = ParamRef::new("x", NativeType::nullable(NativeType::i32()));
        let cmp = x.expr().gt(NativeExpr::constant(1, NativeType::i32())).unwrap();
        let mut evaluator = Evaluator::new();
        evaluator.bind("x", Value::Null);
        assert_eq!(evaluator.eval(&cmp).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_once_source_second_run_fails() {
        let source: Arc<dyn crate::source::DataSource> =
            Arc::new(OnceSource::new(NativeType::i32(), vec![Value::I32(1), Value::I32(2)]));
        let count = Query::from_source(source).count().unwrap();
        assert_eq!(evaluate(&count).unwrap(), Value::I32(2));
        assert!(matches!(evaluate(&count), Err(QueryError::AlreadyEnumerated)));
    }
}
