//! Method handles and the catalog of operators the engine understands.
//!
//! A [`Method`] is closed over its generic arguments: its parameter and
//! return types are computed from the operator's signature template when it
//! is created, either by the query builder or by resolving a
//! [`MethodInfo`] descriptor.

use std::fmt;
use std::sync::Arc;

use crate::error::{QueryError, QueryResult};
use crate::types::{MethodInfo, NativeType, PrimitiveKind, TypeInfo, TypeResolver};
use crate::value::Value;

/// A process-local function. It runs on the calling side only.
pub type LocalFn = Arc<dyn Fn(&[Value]) -> QueryResult<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperator {
    Where,
    Select,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Skip,
    Take,
    Join,
    GroupBy,
    Distinct,
    Count,
    Any,
    All,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Sum,
    Min,
    Max,
    Average,
    Contains,
}

impl QueryOperator {
    pub const ALL: [QueryOperator; 23] = [
        QueryOperator::Where,
        QueryOperator::Select,
        QueryOperator::OrderBy,
        QueryOperator::OrderByDescending,
        QueryOperator::ThenBy,
        QueryOperator::ThenByDescending,
        QueryOperator::Skip,
        QueryOperator::Take,
        QueryOperator::Join,
        QueryOperator::GroupBy,
        QueryOperator::Distinct,
        QueryOperator::Count,
        QueryOperator::Any,
        QueryOperator::All,
        QueryOperator::First,
        QueryOperator::FirstOrDefault,
        QueryOperator::Single,
        QueryOperator::SingleOrDefault,
        QueryOperator::Sum,
        QueryOperator::Min,
        QueryOperator::Max,
        QueryOperator::Average,
        QueryOperator::Contains,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueryOperator::Where => "Where",
            QueryOperator::Select => "Select",
            QueryOperator::OrderBy => "OrderBy",
            QueryOperator::OrderByDescending => "OrderByDescending",
            QueryOperator::ThenBy => "ThenBy",
            QueryOperator::ThenByDescending => "ThenByDescending",
            QueryOperator::Skip => "Skip",
            QueryOperator::Take => "Take",
            QueryOperator::Join => "Join",
            QueryOperator::GroupBy => "GroupBy",
            QueryOperator::Distinct => "Distinct",
            QueryOperator::Count => "Count",
            QueryOperator::Any => "Any",
            QueryOperator::All => "All",
            QueryOperator::First => "First",
            QueryOperator::FirstOrDefault => "FirstOrDefault",
            QueryOperator::Single => "Single",
            QueryOperator::SingleOrDefault => "SingleOrDefault",
            QueryOperator::Sum => "Sum",
            QueryOperator::Min => "Min",
            QueryOperator::Max => "Max",
            QueryOperator::Average => "Average",
            QueryOperator::Contains => "Contains",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            QueryOperator::OrderBy
                | QueryOperator::OrderByDescending
                | QueryOperator::ThenBy
                | QueryOperator::ThenByDescending
        )
    }

    pub fn is_descending(self) -> bool {
        matches!(
            self,
            QueryOperator::OrderByDescending | QueryOperator::ThenByDescending
        )
    }

    fn generic_arity(self) -> usize {
        match self {
            QueryOperator::Join => 4,
            QueryOperator::Select
            | QueryOperator::OrderBy
            | QueryOperator::OrderByDescending
            | QueryOperator::ThenBy
            | QueryOperator::ThenByDescending
            | QueryOperator::GroupBy
            | QueryOperator::Sum
            | QueryOperator::Min
            | QueryOperator::Max
            | QueryOperator::Average => 2,
            _ => 1,
        }
    }
}

/// Whether an operator works on a remote queryable or on an in-memory list
/// (for example `g.Elements.Count()` inside a projection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Queryable,
    Enumerable,
}

impl SequenceKind {
    pub fn declaring_name(self) -> &'static str {
        match self {
            SequenceKind::Queryable => "Queryable",
            SequenceKind::Enumerable => "Enumerable",
        }
    }

    pub fn wrap(self, element: NativeType) -> NativeType {
        match self {
            SequenceKind::Queryable => NativeType::queryable(element),
            SequenceKind::Enumerable => NativeType::list(element),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringFn {
    Contains,
    StartsWith,
    EndsWith,
    ToUpper,
    ToLower,
    Trim,
}

impl StringFn {
    const ALL: [StringFn; 6] = [
        StringFn::Contains,
        StringFn::StartsWith,
        StringFn::EndsWith,
        StringFn::ToUpper,
        StringFn::ToLower,
        StringFn::Trim,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StringFn::Contains => "Contains",
            StringFn::StartsWith => "StartsWith",
            StringFn::EndsWith => "EndsWith",
            StringFn::ToUpper => "ToUpper",
            StringFn::ToLower => "ToLower",
            StringFn::Trim => "Trim",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Marker functions that request eager loading of related members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncludeFn {
    Include,
    ThenInclude,
    /// Normalized form: `IncludePath(q, "A.B")`.
    IncludePath,
}

impl IncludeFn {
    pub fn name(self) -> &'static str {
        match self {
            IncludeFn::Include => "Include",
            IncludeFn::ThenInclude => "ThenInclude",
            IncludeFn::IncludePath => "IncludePath",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [IncludeFn::Include, IncludeFn::ThenInclude, IncludeFn::IncludePath]
            .into_iter()
            .find(|f| f.name() == name)
    }
}

pub const INCLUDE_DECLARING: &str = "Include";
pub const STRING_DECLARING: &str = "string";
pub const LOCAL_DECLARING: &str = "local";

#[derive(Clone)]
pub enum MethodOp {
    Query(SequenceKind, QueryOperator),
    String(StringFn),
    Include(IncludeFn),
    Local(LocalFn),
}

struct MethodDef {
    declaring: &'static str,
    name: String,
    generic_args: Vec<NativeType>,
    param_types: Vec<NativeType>,
    return_type: NativeType,
    instance: bool,
    op: MethodOp,
}

/// A live method handle: signature plus implementation.
#[derive(Clone)]
pub struct Method(Arc<MethodDef>);

impl Method {
    /// A sequence operator closed over `generic_args`. `arity` picks the
    /// overload (for example `Count(q)` versus `Count(q, predicate)`).
    pub fn query(
        kind: SequenceKind,
        op: QueryOperator,
        generic_args: Vec<NativeType>,
        arity: usize,
    ) -> QueryResult<Method> {
        if generic_args.len() != op.generic_arity() {
            return Err(QueryError::TypeResolution(format!(
                "{} takes {} generic arguments, got {}",
                op.name(),
                op.generic_arity(),
                generic_args.len()
            )));
        }
        let (params, ret) = query_signature(kind, op, &generic_args, arity)?;
        Ok(Method(Arc::new(MethodDef {
            declaring: kind.declaring_name(),
            name: op.name().to_string(),
            generic_args,
            param_types: params,
            return_type: ret,
            instance: false,
            op: MethodOp::Query(kind, op),
        })))
    }

    /// An instance method on `string`.
    pub fn string(f: StringFn) -> Method {
        let (params, ret) = match f {
            StringFn::Contains | StringFn::StartsWith | StringFn::EndsWith => {
                (vec![NativeType::string()], NativeType::bool())
            }
            StringFn::ToUpper | StringFn::ToLower | StringFn::Trim => (Vec::new(), NativeType::string()),
        };
        Method(Arc::new(MethodDef {
            declaring: STRING_DECLARING,
            name: f.name().to_string(),
            generic_args: Vec::new(),
            param_types: params,
            return_type: ret,
            instance: true,
            op: MethodOp::String(f),
        }))
    }

    pub fn include(f: IncludeFn, generic_args: Vec<NativeType>) -> QueryResult<Method> {
        let arity_error = || {
            QueryError::TypeResolution(format!(
                "{} has the wrong number of generic arguments",
                f.name()
            ))
        };
        let (params, ret) = match (f, generic_args.as_slice()) {
            (IncludeFn::Include, [t, p]) => (
                vec![
                    NativeType::queryable(t.clone()),
                    NativeType::function(vec![t.clone()], p.clone()),
                ],
                NativeType::queryable(t.clone()),
            ),
            (IncludeFn::ThenInclude, [t, p, q]) => (
                vec![
                    NativeType::queryable(t.clone()),
                    NativeType::function(vec![p.clone()], q.clone()),
                ],
                NativeType::queryable(t.clone()),
            ),
            (IncludeFn::IncludePath, [t]) => (
                vec![NativeType::queryable(t.clone()), NativeType::string()],
                NativeType::queryable(t.clone()),
            ),
            _ => return Err(arity_error()),
        };
        Ok(Method(Arc::new(MethodDef {
            declaring: INCLUDE_DECLARING,
            name: f.name().to_string(),
            generic_args,
            param_types: params,
            return_type: ret,
            instance: false,
            op: MethodOp::Include(f),
        })))
    }

    /// Wraps a process-local function. Calls to it can be evaluated before
    /// a query leaves the process, but never translated.
    pub fn local(
        name: impl Into<String>,
        param_types: Vec<NativeType>,
        return_type: NativeType,
        f: impl Fn(&[Value]) -> QueryResult<Value> + Send + Sync + 'static,
    ) -> Method {
        Method(Arc::new(MethodDef {
            declaring: LOCAL_DECLARING,
            name: name.into(),
            generic_args: Vec::new(),
            param_types,
            return_type,
            instance: false,
            op: MethodOp::Local(Arc::new(f)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn declaring(&self) -> &str {
        self.0.declaring
    }

    pub fn generic_args(&self) -> &[NativeType] {
        &self.0.generic_args
    }

    pub fn param_types(&self) -> &[NativeType] {
        &self.0.param_types
    }

    pub fn return_type(&self) -> &NativeType {
        &self.0.return_type
    }

    /// Instance methods take their receiver as the call target.
    pub fn is_instance(&self) -> bool {
        self.0.instance
    }

    pub fn op(&self) -> &MethodOp {
        &self.0.op
    }

    pub fn is_local(&self) -> bool {
        matches!(self.0.op, MethodOp::Local(_))
    }

    pub fn query_operator(&self) -> Option<QueryOperator> {
        match self.0.op {
            MethodOp::Query(_, op) => Some(op),
            _ => None,
        }
    }

    pub fn include_fn(&self) -> Option<IncludeFn> {
        match self.0.op {
            MethodOp::Include(f) => Some(f),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> MethodInfo {
        MethodInfo {
            declaring_type: TypeInfo::named(self.0.declaring),
            name: self.0.name.clone(),
            generic_arguments: self.0.generic_args.iter().map(NativeType::descriptor).collect(),
            parameter_types: self.0.param_types.iter().map(NativeType::descriptor).collect(),
            return_type: self.0.return_type.descriptor(),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({}.{})", self.0.declaring, self.0.name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.declaring, self.0.name)
    }
}

fn func(params: Vec<NativeType>, ret: NativeType) -> NativeType {
    NativeType::function(params, ret)
}

fn query_signature(
    kind: SequenceKind,
    op: QueryOperator,
    g: &[NativeType],
    arity: usize,
) -> QueryResult<(Vec<NativeType>, NativeType)> {
    use QueryOperator as Q;
    let seq = |t: &NativeType| kind.wrap(t.clone());
    let t = &g[0];
    let predicate = || func(vec![t.clone()], NativeType::bool());
    let overload_error = || {
        QueryError::TypeResolution(format!("{} has no overload taking {arity} arguments", op.name()))
    };

    let signature = match op {
        Q::Where => (vec![seq(t), predicate()], seq(t)),
        Q::Select => (vec![seq(t), func(vec![t.clone()], g[1].clone())], seq(&g[1])),
        Q::OrderBy | Q::OrderByDescending | Q::ThenBy | Q::ThenByDescending => {
            (vec![seq(t), func(vec![t.clone()], g[1].clone())], seq(t))
        }
        Q::Skip | Q::Take => (vec![seq(t), NativeType::i32()], seq(t)),
        Q::Join => {
            let (outer, inner, key, result) = (&g[0], &g[1], &g[2], &g[3]);
            (
                vec![
                    seq(outer),
                    seq(inner),
                    func(vec![outer.clone()], key.clone()),
                    func(vec![inner.clone()], key.clone()),
                    func(vec![outer.clone(), inner.clone()], result.clone()),
                ],
                seq(result),
            )
        }
        Q::GroupBy => (
            vec![seq(t), func(vec![t.clone()], g[1].clone())],
            seq(&NativeType::grouping(g[1].clone(), t.clone())),
        ),
        Q::Distinct => (vec![seq(t)], seq(t)),
        Q::Count | Q::Any => {
            let ret = if op == Q::Count {
                NativeType::i32()
            } else {
                NativeType::bool()
            };
            match arity {
                1 => (vec![seq(t)], ret),
                2 => (vec![seq(t), predicate()], ret),
                _ => return Err(overload_error()),
            }
        }
        Q::All => (vec![seq(t), predicate()], NativeType::bool()),
        Q::First | Q::FirstOrDefault | Q::Single | Q::SingleOrDefault => match arity {
            1 => (vec![seq(t)], t.clone()),
            2 => (vec![seq(t), predicate()], t.clone()),
            _ => return Err(overload_error()),
        },
        Q::Sum | Q::Min | Q::Max | Q::Average => {
            let selected = &g[1];
            let ret = match op {
                Q::Average => {
                    require_numeric(op, selected)?;
                    if selected.is_nullable() {
                        NativeType::nullable(NativeType::f64())
                    } else {
                        NativeType::f64()
                    }
                }
                Q::Sum => {
                    require_numeric(op, selected)?;
                    selected.clone()
                }
                _ => selected.clone(),
            };
            (vec![seq(t), func(vec![t.clone()], selected.clone())], ret)
        }
        Q::Contains => (vec![seq(t), t.clone()], NativeType::bool()),
    };
    if signature.0.len() != arity {
        return Err(overload_error());
    }
    Ok(signature)
}

fn require_numeric(op: QueryOperator, ty: &NativeType) -> QueryResult<()> {
    match ty.underlying().as_primitive() {
        Some(kind) if PrimitiveKind::is_numeric(kind) => Ok(()),
        _ => Err(QueryError::TypeResolution(format!(
            "{} needs a numeric selector, got '{ty}'",
            op.name()
        ))),
    }
}

/// Resolves a method descriptor against the catalog and checks that the
/// instantiated signature matches the descriptor.
pub fn resolve_method<R: TypeResolver + ?Sized>(resolver: &R, info: &MethodInfo) -> QueryResult<Method> {
    let generic_args = info
        .generic_arguments
        .iter()
        .map(|g| resolver.resolve_type(g))
        .collect::<QueryResult<Vec<_>>>()?;
    let unknown = || QueryError::TypeResolution(format!("Unknown method '{info}'"));

    let method = match info.declaring_type.name.as_str() {
        "Queryable" | "Enumerable" => {
            let kind = if info.declaring_type.name == "Queryable" {
                SequenceKind::Queryable
            } else {
                SequenceKind::Enumerable
            };
            let op = QueryOperator::from_name(&info.name).ok_or_else(unknown)?;
            Method::query(kind, op, generic_args, info.parameter_types.len())?
        }
        STRING_DECLARING => Method::string(StringFn::from_name(&info.name).ok_or_else(unknown)?),
        INCLUDE_DECLARING => {
            Method::include(IncludeFn::from_name(&info.name).ok_or_else(unknown)?, generic_args)?
        }
        _ => return Err(unknown()),
    };

    let resolved = method.descriptor();
    if resolved.parameter_types != info.parameter_types || resolved.return_type != info.return_type {
        return Err(QueryError::TypeResolution(format!(
            "Signature of '{info}' does not match the resolved method"
        )));
    }
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    #[test]
    fn test_where_signature() {
        let m = Method::query(
            SequenceKind::Queryable,
            QueryOperator::Where,
            vec![NativeType::i32()],
            2,
        )
        .unwrap();
        let names: Vec<&str> = m.param_types().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["Queryable<i32>", "Func<i32,bool>"]);
        assert_eq!(m.return_type().name(), "Queryable<i32>");
    }

    #[test]
    fn test_overloads_by_arity() {
        let count = |arity| {
            Method::query(
                SequenceKind::Enumerable,
                QueryOperator::Count,
                vec![NativeType::string()],
                arity,
            )
        };
        assert_eq!(count(1).unwrap().param_types().len(), 1);
        assert_eq!(count(2).unwrap().param_types().len(), 2);
        assert!(count(3).is_err());
    }

    #[test]
    fn test_sum_requires_numeric_selector() {
        let sum = Method::query(
            SequenceKind::Queryable,
            QueryOperator::Sum,
            vec![NativeType::i32(), NativeType::string()],
            2,
        );
        assert!(sum.is_err());
    }

    #[test]
    fn test_descriptor_resolves_back() {
        let registry = TypeRegistry::new();
        let m = Method::query(
            SequenceKind::Queryable,
            QueryOperator::GroupBy,
            vec![NativeType::i64(), NativeType::string()],
            2,
        )
        .unwrap();
        let info = m.descriptor();
        assert_eq!(info.return_type.to_string(), "Queryable<Grouping<string,i64>>");
        let back = resolve_method(&registry, &info).unwrap();
        assert_eq!(back.query_operator(), Some(QueryOperator::GroupBy));
    }

    #[test]
    fn test_local_methods_do_not_resolve() {
        let registry = TypeRegistry::new();
        let local = Method::local("twice", vec![NativeType::i32()], NativeType::i32(), |args| {
            Ok(args[0].clone())
        });
        assert!(local.is_local());
        assert!(resolve_method(&registry, &local.descriptor()).is_err());
    }
}
