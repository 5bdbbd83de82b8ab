//! Structural object mapper: native values ⇄ dynamic records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::record::{DynamicValue, RecordRef};
use crate::error::{QueryError, QueryResult};
use crate::types::{NativeType, PrimitiveKind, TypeKind, TypeResolver};
use crate::value::{ObjectRef, Value};

/// Whether records carry a type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeInfoPolicy {
    Always,
    /// Tag named types only; anonymous projections stay untagged.
    #[default]
    ExcludeAnonymous,
    Never,
}

/// Decides whether a member of a type takes part in mapping.
pub type MemberFilter = Arc<dyn Fn(&NativeType, &str) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MapperConfig {
    pub type_info: TypeInfoPolicy,
    /// Skip members whose value cannot be assigned instead of failing.
    pub skip_unassignable: bool,
    pub member_filter: Option<MemberFilter>,
}

impl fmt::Debug for MapperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperConfig")
            .field("type_info", &self.type_info)
            .field("skip_unassignable", &self.skip_unassignable)
            .field("member_filter", &self.member_filter.is_some())
            .finish()
    }
}

/// Strips decorations a member name may carry on the native side:
/// raw identifiers (`r#type`) and backing-field names (`<Name>k__BackingField`).
pub fn normalize_member_name(name: &str) -> &str {
    if let Some(raw) = name.strip_prefix("r#") {
        return raw;
    }
    if let Some(inner) = name
        .strip_prefix('<')
        .and_then(|n| n.strip_suffix(">k__BackingField"))
    {
        return inner;
    }
    name
}

/// Maps native values to dynamic records and back.
///
/// Mapping is memoized per call on reference identity, so shared objects
/// stay shared and cycles terminate in both directions.
#[derive(Clone, Default)]
pub struct DynamicObjectMapper {
    config: MapperConfig,
    resolver: Option<Arc<dyn TypeResolver>>,
}

impl fmt::Debug for DynamicObjectMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicObjectMapper")
            .field("config", &self.config)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl DynamicObjectMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Resolver used for records that carry a type tag.
    pub fn with_resolver(mut self, resolver: Arc<dyn TypeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn to_dynamic(&self, value: &Value) -> QueryResult<DynamicValue> {
        self.to_dynamic_with(value, self.config.type_info)
    }

    pub fn to_dynamic_with(&self, value: &Value, policy: TypeInfoPolicy) -> QueryResult<DynamicValue> {
        ToDynamic {
            mapper: self,
            policy,
            memo: HashMap::new(),
        }
        .map(value)
    }

    /// Maps a sequence element-wise. Nulls stay null, scalars are wrapped in
    /// single-member records keyed by the empty name.
    pub fn to_dynamic_sequence(&self, values: &[Value]) -> QueryResult<Vec<DynamicValue>> {
        let mut state = ToDynamic {
            mapper: self,
            policy: self.config.type_info,
            memo: HashMap::new(),
        };
        values
            .iter()
            .map(|v| match v {
                Value::Null => Ok(DynamicValue::Null),
                Value::Object(_) => state.map(v),
                scalar => {
                    let inner = state.map(scalar)?;
                    Ok(DynamicValue::Record(RecordRef::from_properties(None, [("", inner)])))
                }
            })
            .collect()
    }

    pub fn from_dynamic(&self, value: &DynamicValue, target: &NativeType) -> QueryResult<Value> {
        FromDynamic {
            mapper: self,
            memo: HashMap::new(),
        }
        .map(value, target)
    }

    /// Rebuilds a value using the type tags the records carry.
    pub fn from_dynamic_inferred(&self, value: &DynamicValue) -> QueryResult<Value> {
        FromDynamic {
            mapper: self,
            memo: HashMap::new(),
        }
        .infer(value)
    }

    /// Inverse of [`to_dynamic_sequence`](Self::to_dynamic_sequence).
    pub fn from_dynamic_sequence(
        &self,
        items: &[DynamicValue],
        element_type: &NativeType,
    ) -> QueryResult<Vec<Value>> {
        let mut state = FromDynamic {
            mapper: self,
            memo: HashMap::new(),
        };
        items
            .iter()
            .map(|item| match item {
                DynamicValue::Null => Ok(Value::Null),
                DynamicValue::Record(r) if !element_type.underlying().is_record() => {
                    match r.get("") {
                        Some(inner) if r.len() == 1 => state.map(&inner, element_type),
                        _ => state.map(item, element_type),
                    }
                }
                other => state.map(other, element_type),
            })
            .collect()
    }

    fn includes(&self, ty: &NativeType, member: &str) -> bool {
        self.config
            .member_filter
            .as_ref()
            .map_or(true, |filter| filter(ty, member))
    }

    fn resolve(&self, record: &RecordRef) -> QueryResult<Option<NativeType>> {
        let Some(info) = record.type_info() else {
            return Ok(None);
        };
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            QueryError::TypeResolution(format!("No type resolver available for '{info}'"))
        })?;
        resolver.resolve_type(&info).map(Some)
    }

    /// The record type to build for `record` when `target` was requested.
    /// A tag only overrides the target when it names a different type that
    /// the resolver knows and that carries every member of the target.
    fn record_type(&self, record: &RecordRef, target: &NativeType) -> QueryResult<NativeType> {
        let target = target.underlying();
        let Some(info) = record.type_info() else {
            return Ok(target.clone());
        };
        if info.name == target.name() || info == target.descriptor() {
            return Ok(target.clone());
        }
        let Some(resolver) = self.resolver.as_ref() else {
            return Ok(target.clone());
        };
        let tagged = resolver.resolve_type(&info)?;
        if !tagged.is_record() || !is_compatible(&tagged, target) {
            return Err(QueryError::Mapping(format!(
                "Record tagged '{info}' cannot be assigned to '{target}'"
            )));
        }
        Ok(tagged)
    }
}

fn is_compatible(tagged: &NativeType, target: &NativeType) -> bool {
    tagged == target
        || target.fields().iter().all(|wanted| {
            tagged
                .fields()
                .iter()
                .any(|f| {
                    normalize_member_name(&f.name) == normalize_member_name(&wanted.name)
                        && f.ty == wanted.ty
                })
        })
}

struct ToDynamic<'a> {
    mapper: &'a DynamicObjectMapper,
    policy: TypeInfoPolicy,
    memo: HashMap<usize, RecordRef>,
}

impl ToDynamic<'_> {
    fn map(&mut self, value: &Value) -> QueryResult<DynamicValue> {
        Ok(match value {
            Value::Null => DynamicValue::Null,
            Value::Bool(v) => DynamicValue::Bool(*v),
            Value::I8(v) => DynamicValue::I8(*v),
            Value::I16(v) => DynamicValue::I16(*v),
            Value::I32(v) => DynamicValue::I32(*v),
            Value::I64(v) => DynamicValue::I64(*v),
            Value::U8(v) => DynamicValue::U8(*v),
            Value::U16(v) => DynamicValue::U16(*v),
            Value::U32(v) => DynamicValue::U32(*v),
            Value::U64(v) => DynamicValue::U64(*v),
            Value::F32(v) => DynamicValue::F32(*v),
            Value::F64(v) => DynamicValue::F64(*v),
            Value::Char(v) => DynamicValue::Char(*v),
            Value::String(v) => DynamicValue::String(v.clone()),
            Value::DateTime(v) => DynamicValue::DateTime(*v),
            Value::Date(v) => DynamicValue::Date(*v),
            Value::Uuid(v) => DynamicValue::Uuid(*v),
            Value::Enum { variant, .. } => DynamicValue::String(variant.clone()),
            Value::List(items) => DynamicValue::List(
                items
                    .iter()
                    .map(|i| self.map(i))
                    .collect::<QueryResult<Vec<_>>>()?,
            ),
            Value::Map(entries) => {
                let mut records = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = self.map(k)?;
                    let value = self.map(v)?;
                    records.push(DynamicValue::Record(RecordRef::from_properties(
                        None,
                        [("Key", key), ("Value", value)],
                    )));
                }
                DynamicValue::List(records)
            }
            Value::Object(obj) => DynamicValue::Record(self.map_object(obj)?),
        })
    }

    fn map_object(&mut self, obj: &ObjectRef) -> QueryResult<RecordRef> {
        if let Some(record) = self.memo.get(&obj.addr()) {
            return Ok(record.clone());
        }
        let ty = obj.ty();
        let tagged = match self.policy {
            TypeInfoPolicy::Always => true,
            TypeInfoPolicy::ExcludeAnonymous => !ty.is_anonymous(),
            TypeInfoPolicy::Never => false,
        };
        let record = RecordRef::new(tagged.then(|| ty.descriptor()));
        // Registered before the members so back-references find it.
        self.memo.insert(obj.addr(), record.clone());

        for (name, value) in obj.members() {
            if !self.mapper.includes(&ty, &name) {
                continue;
            }
            let normalized = normalize_member_name(&name);
            if record.contains(normalized) {
                return Err(QueryError::Mapping(format!(
                    "Members of '{ty}' collide on name '{normalized}'"
                )));
            }
            let mapped = self.map(&value)?;
            record.push(normalized, mapped);
        }
        Ok(record)
    }
}

struct FromDynamic<'a> {
    mapper: &'a DynamicObjectMapper,
    memo: HashMap<usize, Value>,
}

impl FromDynamic<'_> {
    fn map(&mut self, value: &DynamicValue, target: &NativeType) -> QueryResult<Value> {
        if value.is_null() {
            if target.accepts_null() {
                return Ok(Value::Null);
            }
            return Err(unassignable(value, target));
        }
        match target.kind() {
            TypeKind::Nullable(inner) => self.map(value, inner),
            TypeKind::Primitive(kind) => {
                convert_primitive(value, *kind).ok_or_else(|| unassignable(value, target))
            }
            TypeKind::Enum(variants) => {
                let variant = match value {
                    DynamicValue::String(s) => variants.iter().find(|v| *v == s).cloned(),
                    other => other
                        .as_i128()
                        .and_then(|i| usize::try_from(i).ok())
                        .and_then(|i| variants.get(i).cloned()),
                };
                variant
                    .map(|variant| Value::Enum {
                        ty: target.clone(),
                        variant,
                    })
                    .ok_or_else(|| unassignable(value, target))
            }
            TypeKind::List(element) | TypeKind::Array(element) | TypeKind::Queryable(element) => {
                let items = value.as_list().ok_or_else(|| unassignable(value, target))?;
                Ok(Value::List(
                    items
                        .iter()
                        .map(|i| self.map(i, element))
                        .collect::<QueryResult<Vec<_>>>()?,
                ))
            }
            TypeKind::Map(key_ty, value_ty) => {
                let items = value.as_list().ok_or_else(|| unassignable(value, target))?;
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let record = item.as_record().ok_or_else(|| unassignable(item, target))?;
                    let key = record.get("Key").unwrap_or(DynamicValue::Null);
                    let val = record.get("Value").unwrap_or(DynamicValue::Null);
                    entries.push((self.map(&key, key_ty)?, self.map(&val, value_ty)?));
                }
                Ok(Value::Map(entries))
            }
            TypeKind::Record(_) => {
                let record = value.as_record().ok_or_else(|| unassignable(value, target))?;
                self.map_record(record, target)
            }
            TypeKind::Function(..) => Err(QueryError::Mapping(format!(
                "Values of function type '{target}' cannot be mapped"
            ))),
        }
    }

    fn map_record(&mut self, record: &RecordRef, target: &NativeType) -> QueryResult<Value> {
        if let Some(existing) = self.memo.get(&record.addr()) {
            return Ok(existing.clone());
        }
        let ty = self.mapper.record_type(record, target)?;
        let obj = ObjectRef::allocate(&ty)?;
        self.memo.insert(record.addr(), Value::Object(obj.clone()));

        let skip = self.mapper.config.skip_unassignable;
        for property in record.properties() {
            let Some(field) = ty
                .fields()
                .iter()
                .find(|f| normalize_member_name(&f.name) == property.name)
            else {
                if skip {
                    tracing::warn!("Skipping unknown member '{}' of '{}'", property.name, ty);
                    continue;
                }
                return Err(QueryError::Mapping(format!(
                    "Type '{ty}' has no member '{}'",
                    property.name
                )));
            };
            if !self.mapper.includes(&ty, &field.name) {
                continue;
            }
            match self.map(&property.value, &field.ty) {
                Ok(v) => obj.set(&field.name, v)?,
                Err(QueryError::Mapping(message)) if skip => {
                    tracing::warn!("Skipping member '{}' of '{}': {}", field.name, ty, message);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Value::Object(obj))
    }

    fn infer(&mut self, value: &DynamicValue) -> QueryResult<Value> {
        Ok(match value {
            DynamicValue::Null => Value::Null,
            DynamicValue::Bool(v) => Value::Bool(*v),
            DynamicValue::I8(v) => Value::I8(*v),
            DynamicValue::I16(v) => Value::I16(*v),
            DynamicValue::I32(v) => Value::I32(*v),
            DynamicValue::I64(v) => Value::I64(*v),
            DynamicValue::U8(v) => Value::U8(*v),
            DynamicValue::U16(v) => Value::U16(*v),
            DynamicValue::U32(v) => Value::U32(*v),
            DynamicValue::U64(v) => Value::U64(*v),
            DynamicValue::F32(v) => Value::F32(*v),
            DynamicValue::F64(v) => Value::F64(*v),
            DynamicValue::Char(v) => Value::Char(*v),
            DynamicValue::String(v) => Value::String(v.clone()),
            DynamicValue::DateTime(v) => Value::DateTime(*v),
            DynamicValue::Date(v) => Value::Date(*v),
            DynamicValue::Uuid(v) => Value::Uuid(*v),
            DynamicValue::List(items) => Value::List(
                items
                    .iter()
                    .map(|i| self.infer(i))
                    .collect::<QueryResult<Vec<_>>>()?,
            ),
            DynamicValue::Record(record) => {
                let ty = self.mapper.resolve(record)?.ok_or_else(|| {
                    QueryError::Mapping("Record carries no type information".to_string())
                })?;
                self.map(value, &ty)?
            }
        })
    }
}

fn unassignable(value: &DynamicValue, target: &NativeType) -> QueryError {
    QueryError::Mapping(format!(
        "Cannot assign {} value {:?} to '{}'",
        value.kind_name(),
        value,
        target
    ))
}

const F32_EXACT: i128 = 1 << 24;
const F64_EXACT: i128 = 1 << 53;

/// Lossless conversion into a primitive kind. Strings parse into the
/// temporal, UUID and char kinds.
fn convert_primitive(value: &DynamicValue, kind: PrimitiveKind) -> Option<Value> {
    use DynamicValue as D;
    if kind.is_integer() {
        let i = match value {
            D::F32(_) | D::F64(_) => {
                let f = value.as_f64()?;
                if !f.is_finite() || f.fract() != 0.0 {
                    return None;
                }
                f as i128
            }
            other => other.as_i128()?,
        };
        return Value::from_i128(kind, i);
    }
    match kind {
        PrimitiveKind::F32 => match value {
            D::F32(v) => Some(Value::F32(*v)),
            D::F64(v) => {
                // Text formats carry the shortest f32 spelling, which widens
                // to a nearby but different f64.
                let narrowed = *v as f32;
                let exact = narrowed as f64 == *v || v.is_nan();
                let shortest = narrowed.is_finite()
                    && narrowed.to_string().parse::<f64>().ok() == Some(*v);
                (exact || shortest).then_some(Value::F32(narrowed))
            }
            other => {
                let i = other.as_i128()?;
                (i.abs() <= F32_EXACT).then_some(Value::F32(i as f32))
            }
        },
        PrimitiveKind::F64 => match value {
            D::F32(v) => Some(Value::F64(*v as f64)),
            D::F64(v) => Some(Value::F64(*v)),
            other => {
                let i = other.as_i128()?;
                (i.abs() <= F64_EXACT).then_some(Value::F64(i as f64))
            }
        },
        PrimitiveKind::Bool => match value {
            D::Bool(v) => Some(Value::Bool(*v)),
            _ => None,
        },
        PrimitiveKind::Char => match value {
            D::Char(c) => Some(Value::Char(*c)),
            D::String(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(Value::Char(c)),
                    _ => None,
                }
            }
            _ => None,
        },
        PrimitiveKind::String => match value {
            D::String(s) => Some(Value::String(s.clone())),
            D::Char(c) => Some(Value::String(c.to_string())),
            _ => None,
        },
        PrimitiveKind::DateTime => match value {
            D::DateTime(v) => Some(Value::DateTime(*v)),
            D::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| Value::DateTime(d.with_timezone(&Utc))),
            _ => None,
        },
        PrimitiveKind::Date => match value {
            D::Date(v) => Some(Value::Date(*v)),
            D::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date),
            _ => None,
        },
        PrimitiveKind::Uuid => match value {
            D::Uuid(v) => Some(Value::Uuid(*v)),
            D::String(s) => Uuid::parse_str(s).ok().map(Value::Uuid),
            _ => None,
        },
        _ => None,
    }
}
