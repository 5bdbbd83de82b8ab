//! The active type universe: resolves structural descriptors to live types.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::descriptor::{ConstructorInfo, MemberInfo, MethodInfo, TypeInfo};
use super::native::{FieldDef, NativeType, PrimitiveKind};
use crate::error::{QueryError, QueryResult};
use crate::native::{methods, Constructor, Member, Method};

/// Maps structural descriptors back to live handles on the executing side.
///
/// Only `resolve_type` has to be provided; members, methods and
/// constructors are resolved against the types it returns.
pub trait TypeResolver: Send + Sync {
    fn resolve_type(&self, info: &TypeInfo) -> QueryResult<NativeType>;

    fn resolve_member(&self, info: &MemberInfo) -> QueryResult<Member> {
        let declaring = self.resolve_type(&info.declaring_type)?;
        let member = Member::resolve(&declaring, &info.name)?;
        let expected = self.resolve_type(&info.member_type)?;
        if member.ty() != &expected {
            return Err(QueryError::TypeResolution(format!(
                "Member '{}.{}' has type '{}', descriptor says '{}'",
                declaring,
                info.name,
                member.ty(),
                expected
            )));
        }
        Ok(member)
    }

    fn resolve_method(&self, info: &MethodInfo) -> QueryResult<Method> {
        methods::resolve_method(self, info)
    }

    fn resolve_constructor(&self, info: &ConstructorInfo) -> QueryResult<Constructor> {
        let ty = self.resolve_type(&info.declaring_type)?;
        let params = info
            .parameter_types
            .iter()
            .map(|p| self.resolve_type(p))
            .collect::<QueryResult<Vec<_>>>()?;
        Constructor::resolve(&ty, params)
    }
}

impl<T: TypeResolver + ?Sized> TypeResolver for Arc<T> {
    fn resolve_type(&self, info: &TypeInfo) -> QueryResult<NativeType> {
        (**self).resolve_type(info)
    }

    fn resolve_member(&self, info: &MemberInfo) -> QueryResult<Member> {
        (**self).resolve_member(info)
    }

    fn resolve_method(&self, info: &MethodInfo) -> QueryResult<Method> {
        (**self).resolve_method(info)
    }

    fn resolve_constructor(&self, info: &ConstructorInfo) -> QueryResult<Constructor> {
        (**self).resolve_constructor(info)
    }
}

/// Registry of known types, keyed by structural signature.
///
/// Primitives are present from the start. Named records and enums must be
/// registered; generic instantiations and anonymous types are built on first
/// use and cached, so two equal descriptors always yield the same handle.
pub struct TypeRegistry {
    types: RwLock<HashMap<String, NativeType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let types = PrimitiveKind::ALL
            .into_iter()
            .map(|k| (k.name().to_string(), NativeType::primitive(k)))
            .collect();
        Self {
            types: RwLock::new(types),
        }
    }

    /// Register a named record or enum type.
    pub fn register(&self, ty: NativeType) -> QueryResult<()> {
        if ty.is_primitive() || ty.is_anonymous() || ty.is_grouping() {
            return Err(QueryError::TypeResolution(format!(
                "'{ty}' is built in and cannot be registered"
            )));
        }
        tracing::debug!("Registering type {}", ty.name());
        self.types.write().insert(ty.name().to_string(), ty);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<NativeType> {
        self.types.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    /// Registered named types (records and enums), sorted by name.
    pub fn named_types(&self) -> Vec<NativeType> {
        let mut named: Vec<NativeType> = self
            .types
            .read()
            .values()
            .filter(|t| (t.is_record() && !t.is_anonymous() && !t.is_grouping()) || t.enum_variants().is_some())
            .cloned()
            .collect();
        named.sort_by(|a, b| a.name().cmp(b.name()));
        named
    }

    /// Number of cached types, primitives included.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    fn construct(&self, info: &TypeInfo) -> QueryResult<NativeType> {
        if info.is_anonymous {
            let fields = info
                .properties
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .map(|p| Ok(FieldDef::new(p.name.clone(), self.resolve_type(&p.property_type)?)))
                .collect::<QueryResult<Vec<_>>>()?;
            return Ok(NativeType::anonymous(fields));
        }

        let args = info
            .generic_arguments
            .iter()
            .map(|a| self.resolve_type(a))
            .collect::<QueryResult<Vec<_>>>()?;
        let arity_error = || {
            QueryError::TypeResolution(format!(
                "Wrong number of generic arguments for '{info}'"
            ))
        };
        let one = |args: &[NativeType]| match args {
            [a] => Ok(a.clone()),
            _ => Err(arity_error()),
        };
        match info.name.as_str() {
            "Nullable" => Ok(NativeType::nullable(one(&args)?)),
            "List" => Ok(NativeType::list(one(&args)?)),
            "Array" => Ok(NativeType::array(one(&args)?)),
            "Queryable" => Ok(NativeType::queryable(one(&args)?)),
            "Map" => match args.as_slice() {
                [k, v] => Ok(NativeType::map(k.clone(), v.clone())),
                _ => Err(arity_error()),
            },
            "Grouping" => match args.as_slice() {
                [k, t] => Ok(NativeType::grouping(k.clone(), t.clone())),
                _ => Err(arity_error()),
            },
            "Func" => match args.split_last() {
                Some((ret, params)) => Ok(NativeType::function(params.to_vec(), ret.clone())),
                None => Err(arity_error()),
            },
            _ => Err(QueryError::TypeResolution(format!("Unknown type '{info}'"))),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for TypeRegistry {
    fn resolve_type(&self, info: &TypeInfo) -> QueryResult<NativeType> {
        let key = info.signature();
        if let Some(ty) = self.types.read().get(&key) {
            return Ok(ty.clone());
        }
        if !info.is_anonymous && info.generic_arguments.is_empty() {
            return Err(QueryError::TypeResolution(format!("Unknown type '{key}'")));
        }
        // Built without the lock held: construction resolves nested types.
        let ty = self.construct(info)?;
        let mut types = self.types.write();
        Ok(types.entry(key).or_insert(ty).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropertyInfo;

    fn registry_with_product() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .register(NativeType::record(
                "Product",
                vec![
                    FieldDef::new("Name", NativeType::string()),
                    FieldDef::new("Price", NativeType::f64()),
                ],
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_resolves_primitives_and_generics() {
        let registry = registry_with_product();
        let ty = registry
            .resolve_type(&"Queryable<Product>".parse().unwrap())
            .unwrap();
        assert_eq!(ty.element_type().unwrap().name(), "Product");
        let nullable = registry
            .resolve_type(&"List<Nullable<i16>>".parse().unwrap())
            .unwrap();
        assert_eq!(nullable.name(), "List<Nullable<i16>>");
    }

    #[test]
    fn test_unknown_named_type_fails() {
        let registry = TypeRegistry::new();
        let err = registry.resolve_type(&TypeInfo::named("Ghost")).unwrap_err();
        assert!(matches!(err, QueryError::TypeResolution(_)));
        assert!(registry
            .resolve_type(&"Map<string>".parse().unwrap())
            .is_err());
    }

    #[test]
    fn test_anonymous_types_are_cached_by_signature() {
        let registry = TypeRegistry::new();
        let info = TypeInfo::anonymous(vec![PropertyInfo {
            name: "Total".into(),
            property_type: TypeInfo::named("f64"),
        }]);
        let before = registry.len();
        let a = registry.resolve_type(&info).unwrap();
        let b = registry.resolve_type(&info).unwrap();
        assert!(a.is_anonymous());
        assert_eq!(a, b);
        assert_eq!(registry.len(), before + 1);
    }

    #[test]
    fn test_member_type_must_match_descriptor() {
        let registry = registry_with_product();
        let good = MemberInfo {
            declaring_type: TypeInfo::named("Product"),
            name: "Price".into(),
            member_type: TypeInfo::named("f64"),
        };
        assert!(registry.resolve_member(&good).is_ok());
        let bad = MemberInfo {
            member_type: TypeInfo::named("i32"),
            ..good
        };
        assert!(registry.resolve_member(&bad).is_err());
    }

    #[test]
    fn test_named_types_lists_registered_only() {
        let registry = registry_with_product();
        registry
            .register(NativeType::enumeration("Color", vec!["Red".into(), "Blue".into()]))
            .unwrap();
        let names: Vec<String> = registry
            .named_types()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["Color", "Product"]);
        assert!(registry.register(NativeType::i32()).is_err());
    }
}
