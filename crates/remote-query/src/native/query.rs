//! Fluent builder for native query trees.

use std::sync::Arc;

use super::{IncludeFn, Method, NativeExpr, ParamRef, QueryOperator, SequenceKind};
use crate::error::{QueryError, QueryResult};
use crate::source::DataSource;
use crate::types::{NativeType, TypeKind};

/// A queryable sequence under construction.
///
/// Each operator appends a call node; terminal operators return the final
/// scalar-typed expression.
#[derive(Clone, Debug)]
pub struct Query {
    expr: NativeExpr,
    element_type: NativeType,
}

fn lambda1<F>(name: &str, ty: &NativeType, f: F) -> QueryResult<NativeExpr>
where
    F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
{
    let param = ParamRef::new(name, ty.clone());
    let body = f(param.expr())?;
    Ok(NativeExpr::lambda(vec![param], body))
}

impl Query {
    pub fn from_source(source: Arc<dyn DataSource>) -> Self {
        let element_type = source.element_type().clone();
        Self {
            expr: NativeExpr::Source(source),
            element_type,
        }
    }

    /// A query over a placeholder, to be bound to a live source later.
    pub fn resource(element_type: NativeType) -> Self {
        Self {
            expr: NativeExpr::Resource {
                element_type: element_type.clone(),
            },
            element_type,
        }
    }

    pub fn from_expr(expr: NativeExpr) -> QueryResult<Self> {
        match expr.ty().kind() {
            TypeKind::Queryable(element_type) => Ok(Self {
                element_type: element_type.clone(),
                expr,
            }),
            _ => Err(QueryError::translation(
                expr.node_name(),
                format!("'{}' is not a queryable sequence", expr.ty()),
            )),
        }
    }

    pub fn expr(&self) -> &NativeExpr {
        &self.expr
    }

    pub fn into_expr(self) -> NativeExpr {
        self.expr
    }

    pub fn element_type(&self) -> &NativeType {
        &self.element_type
    }

    fn apply(self, op: QueryOperator, mut generic: Vec<NativeType>, mut args: Vec<NativeExpr>) -> QueryResult<NativeExpr> {
        generic.insert(0, self.element_type);
        args.insert(0, self.expr);
        let method = Method::query(SequenceKind::Queryable, op, generic, args.len())?;
        NativeExpr::call(None, method, args)
    }

    fn chain(self, op: QueryOperator, generic: Vec<NativeType>, args: Vec<NativeExpr>) -> QueryResult<Self> {
        Self::from_expr(self.apply(op, generic, args)?)
    }

    fn keyed<F>(self, op: QueryOperator, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, key)?;
        let key_type = lambda_return(&lambda);
        self.chain(op, vec![key_type], vec![lambda])
    }

    fn is_ordered(&self) -> bool {
        matches!(&self.expr, NativeExpr::Call { method, .. }
            if method.query_operator().is_some_and(QueryOperator::is_ordering))
    }

    pub fn filter<F>(self, predicate: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, predicate)?;
        self.chain(QueryOperator::Where, Vec::new(), vec![lambda])
    }

    pub fn order_by<F>(self, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.keyed(QueryOperator::OrderBy, key)
    }

    pub fn order_by_descending<F>(self, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.keyed(QueryOperator::OrderByDescending, key)
    }

    pub fn then_by<F>(self, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        if !self.is_ordered() {
            return Err(QueryError::translation("ThenBy", "must follow an ordering"));
        }
        self.keyed(QueryOperator::ThenBy, key)
    }

    pub fn then_by_descending<F>(self, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        if !self.is_ordered() {
            return Err(QueryError::translation("ThenByDescending", "must follow an ordering"));
        }
        self.keyed(QueryOperator::ThenByDescending, key)
    }

    pub fn skip(self, count: i32) -> QueryResult<Self> {
        self.chain(
            QueryOperator::Skip,
            Vec::new(),
            vec![NativeExpr::constant(count, NativeType::i32())],
        )
    }

    pub fn take(self, count: i32) -> QueryResult<Self> {
        self.chain(
            QueryOperator::Take,
            Vec::new(),
            vec![NativeExpr::constant(count, NativeType::i32())],
        )
    }

    pub fn select<F>(self, projection: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.keyed(QueryOperator::Select, projection)
    }

    /// Inner join on equal keys. `result` receives the outer and inner
    /// element.
    pub fn join<KO, KI, R>(self, inner: Query, outer_key: KO, inner_key: KI, result: R) -> QueryResult<Self>
    where
        KO: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
        KI: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
        R: FnOnce(NativeExpr, NativeExpr) -> QueryResult<NativeExpr>,
    {
        let outer_lambda = lambda1("o", &self.element_type, outer_key)?;
        let inner_lambda = lambda1("i", &inner.element_type, inner_key)?;
        let key_type = lambda_return(&outer_lambda);
        if lambda_return(&inner_lambda) != key_type {
            return Err(QueryError::translation(
                "Join",
                format!(
                    "key types differ: '{}' and '{}'",
                    key_type,
                    lambda_return(&inner_lambda)
                ),
            ));
        }
        let o = ParamRef::new("o", self.element_type.clone());
        let i = ParamRef::new("i", inner.element_type.clone());
        let body = result(o.expr(), i.expr())?;
        let result_type = body.ty();
        let result_lambda = NativeExpr::lambda(vec![o, i], body);
        let inner_type = inner.element_type.clone();
        self.chain(
            QueryOperator::Join,
            vec![inner_type, key_type, result_type],
            vec![inner.expr, outer_lambda, inner_lambda, result_lambda],
        )
    }

    /// Groups by key; elements become `Grouping<K, T>` with members `Key`
    /// and `Elements`.
    pub fn group_by<F>(self, key: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.keyed(QueryOperator::GroupBy, key)
    }

    pub fn distinct(self) -> QueryResult<Self> {
        self.chain(QueryOperator::Distinct, Vec::new(), Vec::new())
    }

    /// Marks a related member for eager loading.
    pub fn include<F>(self, path: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, path)?;
        let property = lambda_return(&lambda);
        let method = Method::include(IncludeFn::Include, vec![self.element_type.clone(), property])?;
        Self::from_expr(NativeExpr::call(None, method, vec![self.expr, lambda])?)
    }

    /// Continues the previous include one level deeper. The lambda receives
    /// the previously included member (its element, for collections).
    pub fn then_include<F>(self, path: F) -> QueryResult<Self>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let previous = match &self.expr {
            NativeExpr::Call { method, args, .. }
                if matches!(method.include_fn(), Some(IncludeFn::Include | IncludeFn::ThenInclude)) =>
            {
                args.get(1)
                    .and_then(NativeExpr::as_lambda)
                    .map(|l| l.body.ty())
            }
            _ => None,
        }
        .ok_or_else(|| QueryError::translation("ThenInclude", "must follow Include or ThenInclude"))?;
        let from = previous.element_type().unwrap_or(previous);
        let lambda = lambda1("p", &from, path)?;
        let property = lambda_return(&lambda);
        let method = Method::include(
            IncludeFn::ThenInclude,
            vec![self.element_type.clone(), from, property],
        )?;
        Self::from_expr(NativeExpr::call(None, method, vec![self.expr, lambda])?)
    }

    pub fn count(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::Count, Vec::new(), Vec::new())
    }

    pub fn count_where<F>(self, predicate: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, predicate)?;
        self.apply(QueryOperator::Count, Vec::new(), vec![lambda])
    }

    pub fn any(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::Any, Vec::new(), Vec::new())
    }

    pub fn any_where<F>(self, predicate: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, predicate)?;
        self.apply(QueryOperator::Any, Vec::new(), vec![lambda])
    }

    pub fn all<F>(self, predicate: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, predicate)?;
        self.apply(QueryOperator::All, Vec::new(), vec![lambda])
    }

    pub fn first(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::First, Vec::new(), Vec::new())
    }

    pub fn first_where<F>(self, predicate: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, predicate)?;
        self.apply(QueryOperator::First, Vec::new(), vec![lambda])
    }

    pub fn first_or_default(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::FirstOrDefault, Vec::new(), Vec::new())
    }

    pub fn single(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::Single, Vec::new(), Vec::new())
    }

    pub fn single_or_default(self) -> QueryResult<NativeExpr> {
        self.apply(QueryOperator::SingleOrDefault, Vec::new(), Vec::new())
    }

    fn aggregate<F>(self, op: QueryOperator, selector: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        let lambda = lambda1("x", &self.element_type, selector)?;
        let selected = lambda_return(&lambda);
        self.apply(op, vec![selected], vec![lambda])
    }

    pub fn sum<F>(self, selector: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.aggregate(QueryOperator::Sum, selector)
    }

    pub fn min<F>(self, selector: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.aggregate(QueryOperator::Min, selector)
    }

    pub fn max<F>(self, selector: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.aggregate(QueryOperator::Max, selector)
    }

    pub fn average<F>(self, selector: F) -> QueryResult<NativeExpr>
    where
        F: FnOnce(NativeExpr) -> QueryResult<NativeExpr>,
    {
        self.aggregate(QueryOperator::Average, selector)
    }

    pub fn contains(self, item: NativeExpr) -> QueryResult<NativeExpr> {
        let item = item.convert_to(&self.element_type);
        self.apply(QueryOperator::Contains, Vec::new(), vec![item])
    }
}

fn lambda_return(lambda: &NativeExpr) -> NativeType {
    match lambda {
        NativeExpr::Lambda(l) => l.body.ty(),
        other => other.ty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldDef;

    fn order_type() -> NativeType {
        NativeType::record(
            "Order",
            vec![
                FieldDef::new("Id", NativeType::i32()),
                FieldDef::new("Customer", NativeType::string()),
                FieldDef::new("Total", NativeType::f64()),
            ],
        )
    }

    #[test]
    fn test_chain_display() {
        let q = Query::resource(order_type())
            .filter(|x| x.member("Total")?.gt(NativeExpr::constant(10.0, NativeType::f64())))
            .unwrap()
            .order_by(|x| x.member("Customer"))
            .unwrap()
            .then_by_descending(|x| x.member("Id"))
            .unwrap()
            .take(5)
            .unwrap();
        assert_eq!(
            q.expr().to_string(),
            "resource<Order>.Where(x => (x.Total > 10)).OrderBy(x => x.Customer).ThenByDescending(x => x.Id).Take(5)"
        );
        assert_eq!(q.element_type(), &order_type());
    }

    #[test]
    fn test_then_by_needs_ordering() {
        let err = Query::resource(order_type()).then_by(|x| x.member("Id")).unwrap_err();
        assert!(matches!(err, QueryError::Translation { .. }));
    }

    #[test]
    fn test_group_by_element_type() {
        let q = Query::resource(order_type())
            .group_by(|x| x.member("Customer"))
            .unwrap();
        assert_eq!(q.element_type().name(), "Grouping<string,Order>");
        let projected = q
            .select(|g| {
                let count = g.clone().member("Elements")?.sequence_call(
                    QueryOperator::Count,
                    Vec::new(),
                    Vec::new(),
                )?;
                NativeExpr::new_anonymous(vec![("Customer", g.member("Key")?), ("Orders", count)])
            })
            .unwrap();
        assert!(projected.element_type().is_anonymous());
    }

    #[test]
    fn test_terminal_types() {
        let sum = Query::resource(order_type()).sum(|x| x.member("Total")).unwrap();
        assert_eq!(sum.ty(), NativeType::f64());
        let count = Query::resource(order_type()).count().unwrap();
        assert_eq!(count.ty(), NativeType::i32());
        let first = Query::resource(order_type()).first().unwrap();
        assert_eq!(first.ty(), order_type());
    }
}
