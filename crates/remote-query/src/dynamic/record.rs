//! Schema-less records: ordered `(name, value)` lists with an optional type tag.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::TypeInfo;

/// A value inside a dynamic record graph.
#[derive(Clone)]
pub enum DynamicValue {
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
    Record(RecordRef),
    List(Vec<DynamicValue>),
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: DynamicValue,
}

/// Record payload. Properties keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct DynamicRecord {
    pub type_info: Option<TypeInfo>,
    pub properties: Vec<Property>,
}

/// Shared handle to a [`DynamicRecord`], so graphs can share nodes and cycle.
#[derive(Clone)]
pub struct RecordRef(Arc<RwLock<DynamicRecord>>);

impl RecordRef {
    pub fn new(type_info: Option<TypeInfo>) -> Self {
        RecordRef(Arc::new(RwLock::new(DynamicRecord {
            type_info,
            properties: Vec::new(),
        })))
    }

    pub fn from_properties<I, S>(type_info: Option<TypeInfo>, properties: I) -> Self
    where
        I: IntoIterator<Item = (S, DynamicValue)>,
        S: Into<String>,
    {
        let record = Self::new(type_info);
        for (name, value) in properties {
            record.push(name, value);
        }
        record
    }

    pub fn type_info(&self) -> Option<TypeInfo> {
        self.0.read().type_info.clone()
    }

    pub fn set_type_info(&self, type_info: Option<TypeInfo>) {
        self.0.write().type_info = type_info;
    }

    pub fn get(&self, name: &str) -> Option<DynamicValue> {
        self.0
            .read()
            .properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.read().properties.iter().any(|p| p.name == name)
    }

    /// Appends a property. Does not check for duplicate names.
    pub fn push(&self, name: impl Into<String>, value: DynamicValue) {
        self.0.write().properties.push(Property {
            name: name.into(),
            value,
        });
    }

    /// Replaces the value of an existing property, or appends it.
    pub fn set(&self, name: &str, value: DynamicValue) {
        let mut record = self.0.write();
        match record.properties.iter_mut().find(|p| p.name == name) {
            Some(p) => p.value = value,
            None => record.properties.push(Property {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn properties(&self) -> Vec<Property> {
        self.0.read_recursive().properties.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.read().properties.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().properties.is_empty()
    }

    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, DynamicRecord> {
        self.0.read_recursive()
    }
}

impl DynamicValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn as_record(&self) -> Option<&RecordRef> {
        match self {
            DynamicValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        Some(match self {
            DynamicValue::I8(v) => *v as i128,
            DynamicValue::I16(v) => *v as i128,
            DynamicValue::I32(v) => *v as i128,
            DynamicValue::I64(v) => *v as i128,
            DynamicValue::U8(v) => *v as i128,
            DynamicValue::U16(v) => *v as i128,
            DynamicValue::U32(v) => *v as i128,
            DynamicValue::U64(v) => *v as i128,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::F32(v) => Some(*v as f64),
            DynamicValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            DynamicValue::Null => "null",
            DynamicValue::Bool(_) => "bool",
            DynamicValue::I8(_)
            | DynamicValue::I16(_)
            | DynamicValue::I32(_)
            | DynamicValue::I64(_)
            | DynamicValue::U8(_)
            | DynamicValue::U16(_)
            | DynamicValue::U32(_)
            | DynamicValue::U64(_) => "integer",
            DynamicValue::F32(_) | DynamicValue::F64(_) => "float",
            DynamicValue::Char(_) => "char",
            DynamicValue::String(_) => "string",
            DynamicValue::DateTime(_) => "datetime",
            DynamicValue::Date(_) => "date",
            DynamicValue::Uuid(_) => "uuid",
            DynamicValue::Record(_) => "record",
            DynamicValue::List(_) => "list",
        }
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        structural_eq(self, other, &mut HashSet::new())
    }
}

impl PartialEq for RecordRef {
    fn eq(&self, other: &Self) -> bool {
        structural_eq(
            &DynamicValue::Record(self.clone()),
            &DynamicValue::Record(other.clone()),
            &mut HashSet::new(),
        )
    }
}

// Numbers compare by value regardless of width: the wire does not preserve
// the width, the type descriptors do.
fn structural_eq(a: &DynamicValue, b: &DynamicValue, visited: &mut HashSet<(usize, usize)>) -> bool {
    use DynamicValue as D;
    match (a, b) {
        (D::Null, D::Null) => true,
        (D::Bool(x), D::Bool(y)) => x == y,
        (D::Char(x), D::Char(y)) => x == y,
        (D::String(x), D::String(y)) => x == y,
        (D::DateTime(x), D::DateTime(y)) => x == y,
        (D::Date(x), D::Date(y)) => x == y,
        (D::Uuid(x), D::Uuid(y)) => x == y,
        (D::List(x), D::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| structural_eq(p, q, visited))
        }
        (D::Record(x), D::Record(y)) => {
            if x.ptr_eq(y) || !visited.insert((x.addr(), y.addr())) {
                return true;
            }
            let (rx, ry) = (x.read(), y.read());
            rx.type_info == ry.type_info
                && rx.properties.len() == ry.properties.len()
                && rx
                    .properties
                    .iter()
                    .zip(ry.properties.iter())
                    .all(|(p, q)| p.name == q.name && structural_eq(&p.value, &q.value, visited))
        }
        (x, y) => match (x.as_i128(), y.as_i128()) {
            (Some(i), Some(j)) => i == j,
            _ => match (x.as_f64(), y.as_f64()) {
                (Some(f), Some(g)) => f == g || (f.is_nan() && g.is_nan()),
                _ => false,
            },
        },
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Null => f.write_str("null"),
            DynamicValue::Bool(v) => write!(f, "{v}"),
            DynamicValue::I8(v) => write!(f, "{v}i8"),
            DynamicValue::I16(v) => write!(f, "{v}i16"),
            DynamicValue::I32(v) => write!(f, "{v}i32"),
            DynamicValue::I64(v) => write!(f, "{v}i64"),
            DynamicValue::U8(v) => write!(f, "{v}u8"),
            DynamicValue::U16(v) => write!(f, "{v}u16"),
            DynamicValue::U32(v) => write!(f, "{v}u32"),
            DynamicValue::U64(v) => write!(f, "{v}u64"),
            DynamicValue::F32(v) => write!(f, "{v}f32"),
            DynamicValue::F64(v) => write!(f, "{v}f64"),
            DynamicValue::Char(v) => write!(f, "{v:?}"),
            DynamicValue::String(v) => write!(f, "{v:?}"),
            DynamicValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            DynamicValue::Date(v) => write!(f, "{v}"),
            DynamicValue::Uuid(v) => write!(f, "{v}"),
            DynamicValue::Record(r) => write!(f, "{r:?}"),
            DynamicValue::List(items) => f.debug_list().entries(items).finish(),
        }
    }
}

// Nested records print as `{..}` so cycles terminate.
impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.read();
        let name = record
            .type_info
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();
        let mut s = f.debug_struct(&name);
        for p in &record.properties {
            match &p.value {
                DynamicValue::Record(_) => s.field(&p.name, &format_args!("{{..}}")),
                other => s.field(&p.name, other),
            };
        }
        s.finish()
    }
}

macro_rules! impl_from_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for DynamicValue {
                fn from(v: $t) -> Self {
                    DynamicValue::$variant(v)
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
    RecordRef => Record,
}

impl From<&str> for DynamicValue {
    fn from(v: &str) -> Self {
        DynamicValue::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality_ignores_identity() {
        let a = RecordRef::from_properties(None, [("Name", DynamicValue::from("x"))]);
        let b = RecordRef::from_properties(None, [("Name", DynamicValue::from("x"))]);
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
        b.set("Name", "y".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert_eq!(DynamicValue::I16(4), DynamicValue::I64(4));
        assert_eq!(DynamicValue::F32(0.5), DynamicValue::F64(0.5));
        assert_ne!(DynamicValue::I32(1), DynamicValue::String("1".into()));
    }

    #[test]
    fn test_cycles_terminate() {
        let a = RecordRef::new(Some(TypeInfo::named("Node")));
        a.push("Next", DynamicValue::Record(a.clone()));
        let b = RecordRef::new(Some(TypeInfo::named("Node")));
        b.push("Next", DynamicValue::Record(b.clone()));
        assert_eq!(a, b);
        assert_eq!(format!("{a:?}"), "Node { Next: {..} }");
    }
}
