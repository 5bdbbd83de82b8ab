//! Native runtime values and object instances.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{QueryError, QueryResult};
use crate::types::{NativeType, PrimitiveKind, TypeKind};

/// A native value as seen by the executing side and by callers re-hydrating
/// results.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    String(String),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Enum { ty: NativeType, variant: String },
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Object(ObjectRef),
}

/// A record instance: one value per field of its (record) type.
pub struct NativeObject {
    ty: NativeType,
    fields: Vec<Value>,
}

/// Shared handle to a [`NativeObject`]. Identity is pointer identity, which
/// is what the mapper memoizes on to preserve shared references and cycles.
#[derive(Clone)]
pub struct ObjectRef(Arc<RwLock<NativeObject>>);

impl ObjectRef {
    /// Allocates an instance with every field set to its type's default,
    /// without running any constructor logic.
    pub fn allocate(ty: &NativeType) -> QueryResult<Self> {
        if !ty.is_record() {
            return Err(QueryError::Mapping(format!(
                "Cannot allocate an instance of non-record type '{ty}'"
            )));
        }
        let fields = ty.fields().iter().map(|f| default_value(&f.ty)).collect();
        Ok(ObjectRef(Arc::new(RwLock::new(NativeObject {
            ty: ty.clone(),
            fields,
        }))))
    }

    /// Creates an instance from positional field values.
    pub fn new(ty: &NativeType, values: Vec<Value>) -> QueryResult<Self> {
        let expected = ty.fields().len();
        if values.len() != expected {
            return Err(QueryError::Evaluation(format!(
                "Type '{ty}' has {expected} fields, got {} values",
                values.len()
            )));
        }
        Ok(ObjectRef(Arc::new(RwLock::new(NativeObject {
            ty: ty.clone(),
            fields: values,
        }))))
    }

    /// Creates an instance from named field values; unnamed fields keep
    /// their defaults.
    pub fn with_fields<I, S>(ty: &NativeType, values: I) -> QueryResult<Self>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let obj = Self::allocate(ty)?;
        for (name, value) in values {
            obj.set(name.as_ref(), value)?;
        }
        Ok(obj)
    }

    pub fn ty(&self) -> NativeType {
        self.0.read().ty.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let obj = self.0.read();
        let (index, _) = obj.ty.field(name)?;
        obj.fields.get(index).cloned()
    }

    pub fn get_index(&self, index: usize) -> Option<Value> {
        self.0.read().fields.get(index).cloned()
    }

    /// Assigns a field by name. The value is not converted; callers are
    /// expected to hand in a value of the member's type.
    pub fn set(&self, name: &str, value: Value) -> QueryResult<()> {
        let mut obj = self.0.write();
        let index = obj.ty.field(name).map(|(i, _)| i).ok_or_else(|| {
            QueryError::Mapping(format!("Type '{}' has no member '{name}'", obj.ty))
        })?;
        obj.fields[index] = value;
        Ok(())
    }

    /// Snapshot of `(name, value)` pairs in declaration order.
    pub fn members(&self) -> Vec<(String, Value)> {
        let obj = self.0.read();
        obj.ty
            .fields()
            .iter()
            .zip(obj.fields.iter())
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// Default ("zero") value of a type: what an uninitialized member holds.
pub fn default_value(ty: &NativeType) -> Value {
    match ty.kind() {
        TypeKind::Primitive(kind) => match kind {
            PrimitiveKind::Bool => Value::Bool(false),
            PrimitiveKind::I8 => Value::I8(0),
            PrimitiveKind::I16 => Value::I16(0),
            PrimitiveKind::I32 => Value::I32(0),
            PrimitiveKind::I64 => Value::I64(0),
            PrimitiveKind::U8 => Value::U8(0),
            PrimitiveKind::U16 => Value::U16(0),
            PrimitiveKind::U32 => Value::U32(0),
            PrimitiveKind::U64 => Value::U64(0),
            PrimitiveKind::F32 => Value::F32(0.0),
            PrimitiveKind::F64 => Value::F64(0.0),
            PrimitiveKind::Char => Value::Char('\0'),
            PrimitiveKind::String => Value::Null,
            PrimitiveKind::DateTime => Value::DateTime(DateTime::<Utc>::UNIX_EPOCH),
            PrimitiveKind::Date => Value::Date(NaiveDate::default()),
            PrimitiveKind::Uuid => Value::Uuid(Uuid::nil()),
        },
        TypeKind::Enum(variants) => match variants.first() {
            Some(first) => Value::Enum {
                ty: ty.clone(),
                variant: first.clone(),
            },
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Runtime type of the value. `None` for `Null`, and for lists/maps whose
    /// element type cannot be inferred from their contents.
    pub fn native_type(&self) -> Option<NativeType> {
        let prim = |k| Some(NativeType::primitive(k));
        match self {
            Value::Null => None,
            Value::Bool(_) => prim(PrimitiveKind::Bool),
            Value::I8(_) => prim(PrimitiveKind::I8),
            Value::I16(_) => prim(PrimitiveKind::I16),
            Value::I32(_) => prim(PrimitiveKind::I32),
            Value::I64(_) => prim(PrimitiveKind::I64),
            Value::U8(_) => prim(PrimitiveKind::U8),
            Value::U16(_) => prim(PrimitiveKind::U16),
            Value::U32(_) => prim(PrimitiveKind::U32),
            Value::U64(_) => prim(PrimitiveKind::U64),
            Value::F32(_) => prim(PrimitiveKind::F32),
            Value::F64(_) => prim(PrimitiveKind::F64),
            Value::Char(_) => prim(PrimitiveKind::Char),
            Value::String(_) => prim(PrimitiveKind::String),
            Value::DateTime(_) => prim(PrimitiveKind::DateTime),
            Value::Date(_) => prim(PrimitiveKind::Date),
            Value::Uuid(_) => prim(PrimitiveKind::Uuid),
            Value::Enum { ty, .. } => Some(ty.clone()),
            Value::List(items) => items
                .iter()
                .find_map(Value::native_type)
                .map(NativeType::list),
            Value::Map(entries) => {
                let (k, v) = entries.first()?;
                Some(NativeType::map(k.native_type()?, v.native_type()?))
            }
            Value::Object(obj) => Some(obj.ty()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Integer payload widened to `i128`, for any integer variant.
    pub fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::I8(v) => *v as i128,
            Value::I16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::U8(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::U64(v) => *v as i128,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Builds a value of the given numeric kind from an `i128`, failing if it
    /// does not fit.
    pub fn from_i128(kind: PrimitiveKind, v: i128) -> Option<Value> {
        Some(match kind {
            PrimitiveKind::I8 => Value::I8(i8::try_from(v).ok()?),
            PrimitiveKind::I16 => Value::I16(i16::try_from(v).ok()?),
            PrimitiveKind::I32 => Value::I32(i32::try_from(v).ok()?),
            PrimitiveKind::I64 => Value::I64(i64::try_from(v).ok()?),
            PrimitiveKind::U8 => Value::U8(u8::try_from(v).ok()?),
            PrimitiveKind::U16 => Value::U16(u16::try_from(v).ok()?),
            PrimitiveKind::U32 => Value::U32(u32::try_from(v).ok()?),
            PrimitiveKind::U64 => Value::U64(u64::try_from(v).ok()?),
            PrimitiveKind::F32 => Value::F32(v as f32),
            PrimitiveKind::F64 => Value::F64(v as f64),
            _ => return None,
        })
    }

    /// Explicit conversion, as performed by a `Convert` node. Numeric
    /// conversions truncate/wrap like an `as` cast; `null` converts to any
    /// nullable or reference type.
    pub fn cast(&self, ty: &NativeType) -> QueryResult<Value> {
        if self.is_null() {
            if ty.accepts_null() {
                return Ok(Value::Null);
            }
            return Err(QueryError::Evaluation(format!("Cannot convert null to '{ty}'")));
        }
        let target = ty.underlying();
        if let Some(kind) = target.as_primitive() {
            if let Some(v) = self.cast_numeric(kind) {
                return Ok(v);
            }
            if self.native_type().as_ref() == Some(target) {
                return Ok(self.clone());
            }
            return Err(QueryError::Evaluation(format!(
                "Cannot convert {self:?} to '{ty}'"
            )));
        }
        if let (Value::Enum { ty: from, .. }, TypeKind::Enum(_)) = (self, target.kind()) {
            if from == target {
                return Ok(self.clone());
            }
        }
        // Reference conversions are identity at runtime.
        Ok(self.clone())
    }

    fn cast_numeric(&self, kind: PrimitiveKind) -> Option<Value> {
        if !kind.is_numeric() {
            return None;
        }
        if let Some(i) = self.as_i128() {
            return Some(match kind {
                PrimitiveKind::I8 => Value::I8(i as i8),
                PrimitiveKind::I16 => Value::I16(i as i16),
                PrimitiveKind::I32 => Value::I32(i as i32),
                PrimitiveKind::I64 => Value::I64(i as i64),
                PrimitiveKind::U8 => Value::U8(i as u8),
                PrimitiveKind::U16 => Value::U16(i as u16),
                PrimitiveKind::U32 => Value::U32(i as u32),
                PrimitiveKind::U64 => Value::U64(i as u64),
                PrimitiveKind::F32 => Value::F32(i as f32),
                _ => Value::F64(i as f64),
            });
        }
        let f = match self {
            Value::F32(v) => *v as f64,
            Value::F64(v) => *v,
            _ => return None,
        };
        Some(match kind {
            PrimitiveKind::I8 => Value::I8(f as i8),
            PrimitiveKind::I16 => Value::I16(f as i16),
            PrimitiveKind::I32 => Value::I32(f as i32),
            PrimitiveKind::I64 => Value::I64(f as i64),
            PrimitiveKind::U8 => Value::U8(f as u8),
            PrimitiveKind::U16 => Value::U16(f as u16),
            PrimitiveKind::U32 => Value::U32(f as u32),
            PrimitiveKind::U64 => Value::U64(f as u64),
            PrimitiveKind::F32 => Value::F32(f as f32),
            _ => Value::F64(f),
        })
    }

    /// Ordering used by sorts and comparison operators. Numbers compare
    /// across widths; `null` sorts first; incomparable values yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Char(a), Value::Char(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Enum { ty, variant: a }, Value::Enum { variant: b, .. }) => {
                let variants = ty.enum_variants()?;
                let ia = variants.iter().position(|v| v == a)?;
                let ib = variants.iter().position(|v| v == b)?;
                Some(ia.cmp(&ib))
            }
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }

    /// Equality with numeric widening, as used by `==` in query predicates
    /// and join/group keys.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b) || self == other,
            (Value::List(_), _) | (Value::Map(_), _) => self == other,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let mut visited = HashSet::new();
        structural_eq(self, other, &mut visited)
    }
}

fn structural_eq(a: &Value, b: &Value, visited: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::I8(x), Value::I8(y)) => x == y,
        (Value::I16(x), Value::I16(y)) => x == y,
        (Value::I32(x), Value::I32(y)) => x == y,
        (Value::I64(x), Value::I64(y)) => x == y,
        (Value::U8(x), Value::U8(y)) => x == y,
        (Value::U16(x), Value::U16(y)) => x == y,
        (Value::U32(x), Value::U32(y)) => x == y,
        (Value::U64(x), Value::U64(y)) => x == y,
        (Value::F32(x), Value::F32(y)) => x.to_bits() == y.to_bits() || x == y,
        (Value::F64(x), Value::F64(y)) => x.to_bits() == y.to_bits() || x == y,
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Uuid(x), Value::Uuid(y)) => x == y,
        (Value::Enum { ty: t1, variant: v1 }, Value::Enum { ty: t2, variant: v2 }) => {
            t1 == t2 && v1 == v2
        }
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| structural_eq(p, q, visited))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().zip(y).all(|((k1, v1), (k2, v2))| {
                    structural_eq(k1, k2, visited) && structural_eq(v1, v2, visited)
                })
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.ptr_eq(y) || !visited.insert((x.addr(), y.addr())) {
                return true;
            }
            if x.ty() != y.ty() {
                return false;
            }
            let (mx, my) = (x.members(), y.members());
            mx.iter()
                .zip(my.iter())
                .all(|((_, p), (_, q))| structural_eq(p, q, visited))
        }
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::I8(v) => write!(f, "I8({v})"),
            Value::I16(v) => write!(f, "I16({v})"),
            Value::I32(v) => write!(f, "I32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::U8(v) => write!(f, "U8({v})"),
            Value::U16(v) => write!(f, "U16({v})"),
            Value::U32(v) => write!(f, "U32({v})"),
            Value::U64(v) => write!(f, "U64({v})"),
            Value::F32(v) => write!(f, "F32({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Char(v) => write!(f, "Char({v:?})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::DateTime(v) => write!(f, "DateTime({})", v.to_rfc3339()),
            Value::Date(v) => write!(f, "Date({v})"),
            Value::Uuid(v) => write!(f, "Uuid({v})"),
            Value::Enum { ty, variant } => write!(f, "{ty}::{variant}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Value::Object(obj) => write!(f, "{obj:?}"),
        }
    }
}

// Nested objects print as `<Type>` so cyclic graphs terminate.
impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let obj = self.0.read_recursive();
        let mut s = f.debug_struct(obj.ty.name());
        for (field, value) in obj.ty.fields().iter().zip(obj.fields.iter()) {
            match value {
                Value::Object(nested) => {
                    s.field(&field.name, &format_args!("<{}>", nested.ty()));
                }
                other => {
                    s.field(&field.name, other);
                }
            }
        }
        s.finish()
    }
}

macro_rules! impl_from_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    char => Char,
    String => String,
    DateTime<Utc> => DateTime,
    NaiveDate => Date,
    Uuid => Uuid,
    ObjectRef => Object,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldDef;

    fn address_type() -> NativeType {
        NativeType::record(
            "Address",
            vec![
                FieldDef::new("Street", NativeType::string()),
                FieldDef::new("Number", NativeType::i32()),
            ],
        )
    }

    #[test]
    fn test_allocate_uses_defaults() {
        let obj = ObjectRef::allocate(&address_type()).unwrap();
        assert_eq!(obj.get("Street"), Some(Value::Null));
        assert_eq!(obj.get("Number"), Some(Value::I32(0)));
        assert!(obj.get("Missing").is_none());
    }

    #[test]
    fn test_set_unknown_member_fails() {
        let obj = ObjectRef::allocate(&address_type()).unwrap();
        assert!(obj.set("Nope", Value::I32(1)).is_err());
        obj.set("Number", Value::I32(12)).unwrap();
        assert_eq!(obj.get("Number"), Some(Value::I32(12)));
    }

    #[test]
    fn test_compare_across_widths() {
        assert_eq!(Value::I16(5).compare(&Value::I64(5)), Some(Ordering::Equal));
        assert_eq!(Value::U8(1).compare(&Value::F64(1.5)), Some(Ordering::Less));
        assert!(Value::I16(5).loose_eq(&Value::I32(5)));
        assert_ne!(Value::I16(5), Value::I32(5));
    }

    #[test]
    fn test_cast_wraps_like_as() {
        assert_eq!(Value::I32(300).cast(&NativeType::primitive(PrimitiveKind::U8)).unwrap(), Value::U8(44));
        assert_eq!(Value::I16(7).cast(&NativeType::i32()).unwrap(), Value::I32(7));
        assert!(Value::Null.cast(&NativeType::i32()).is_err());
        assert_eq!(
            Value::Null.cast(&NativeType::nullable(NativeType::i32())).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_cyclic_equality_terminates() {
        let node = NativeType::declare_record("Node");
        node.define_fields(vec![FieldDef::new("Next", node.clone())]).unwrap();
        let a = ObjectRef::allocate(&node).unwrap();
        a.set("Next", Value::Object(a.clone())).unwrap();
        let b = ObjectRef::allocate(&node).unwrap();
        b.set("Next", Value::Object(b.clone())).unwrap();
        assert_eq!(Value::Object(a.clone()), Value::Object(b));
        assert!(format!("{a:?}").contains("<Node>"));
    }
}
