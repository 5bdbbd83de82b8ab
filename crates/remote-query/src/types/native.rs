//! Live native type handles.
//!
//! A [`NativeType`] is the executing side's view of a type: it knows its
//! fields, element types and defaults. Portable code never holds one; it
//! carries a [`TypeInfo`] descriptor that is resolved back into a
//! `NativeType` by a [`TypeResolver`](super::TypeResolver).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use super::descriptor::{PropertyInfo, TypeInfo};
use crate::error::{QueryError, QueryResult};

/// Scalar kinds stored directly (not as nested records) by the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Char,
    String,
    DateTime,
    Date,
    Uuid,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 16] = [
        PrimitiveKind::Bool,
        PrimitiveKind::I8,
        PrimitiveKind::I16,
        PrimitiveKind::I32,
        PrimitiveKind::I64,
        PrimitiveKind::U8,
        PrimitiveKind::U16,
        PrimitiveKind::U32,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
        PrimitiveKind::Char,
        PrimitiveKind::String,
        PrimitiveKind::DateTime,
        PrimitiveKind::Date,
        PrimitiveKind::Uuid,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::I8 => "i8",
            PrimitiveKind::I16 => "i16",
            PrimitiveKind::I32 => "i32",
            PrimitiveKind::I64 => "i64",
            PrimitiveKind::U8 => "u8",
            PrimitiveKind::U16 => "u16",
            PrimitiveKind::U32 => "u32",
            PrimitiveKind::U64 => "u64",
            PrimitiveKind::F32 => "f32",
            PrimitiveKind::F64 => "f64",
            PrimitiveKind::Char => "char",
            PrimitiveKind::String => "string",
            PrimitiveKind::DateTime => "datetime",
            PrimitiveKind::Date => "date",
            PrimitiveKind::Uuid => "uuid",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8
                | PrimitiveKind::I16
                | PrimitiveKind::I32
                | PrimitiveKind::I64
                | PrimitiveKind::U8
                | PrimitiveKind::U16
                | PrimitiveKind::U32
                | PrimitiveKind::U64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::F32 | PrimitiveKind::F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8 | PrimitiveKind::I16 | PrimitiveKind::I32 | PrimitiveKind::I64
        )
    }

    fn bits(self) -> u32 {
        match self {
            PrimitiveKind::I8 | PrimitiveKind::U8 => 8,
            PrimitiveKind::I16 | PrimitiveKind::U16 => 16,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 32,
            _ => 64,
        }
    }

    /// The common kind two numeric operands are promoted to before a binary
    /// operation. Mirrors the usual implicit conversions: narrower integers
    /// widen, mixed signedness goes to the next signed width, any float wins.
    pub fn promote(a: PrimitiveKind, b: PrimitiveKind) -> Option<PrimitiveKind> {
        if a == b {
            return Some(a);
        }
        if !a.is_numeric() || !b.is_numeric() {
            return None;
        }
        if a.is_float() || b.is_float() {
            return Some(if a == PrimitiveKind::F64 || b == PrimitiveKind::F64 {
                PrimitiveKind::F64
            } else if a.bits() == 64 || b.bits() == 64 {
                PrimitiveKind::F64
            } else {
                PrimitiveKind::F32
            });
        }
        let bits = a.bits().max(b.bits());
        if a.is_signed() == b.is_signed() {
            return Some(if a.bits() >= b.bits() { a } else { b });
        }
        // Mixed signedness: the signed side must be strictly wider to hold both.
        let (signed, unsigned) = if a.is_signed() { (a, b) } else { (b, a) };
        if signed.bits() > unsigned.bits() {
            return Some(signed);
        }
        Some(match bits {
            8 => PrimitiveKind::I16,
            16 => PrimitiveKind::I32,
            _ => PrimitiveKind::I64,
        })
    }
}

/// Shape of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Named,
    /// A structurally generated type (projection result). It is identified by
    /// its member list, never by name.
    Anonymous,
    /// `Grouping<K, T>`: members `Key` and `Elements`.
    Grouping,
}

/// A field of a record type.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: NativeType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: NativeType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

pub struct RecordDef {
    shape: RecordShape,
    fields: OnceLock<Vec<FieldDef>>,
}

pub enum TypeKind {
    Primitive(PrimitiveKind),
    Nullable(NativeType),
    List(NativeType),
    Array(NativeType),
    Map(NativeType, NativeType),
    Queryable(NativeType),
    Function(Vec<NativeType>, NativeType),
    Enum(Vec<String>),
    Record(RecordDef),
}

pub struct TypeDef {
    name: String,
    kind: TypeKind,
}

/// A live type handle. Cheap to clone; equality is by qualified name.
#[derive(Clone)]
pub struct NativeType(Arc<TypeDef>);

impl NativeType {
    fn from_def(name: String, kind: TypeKind) -> Self {
        NativeType(Arc::new(TypeDef { name, kind }))
    }

    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self::from_def(kind.name().to_string(), TypeKind::Primitive(kind))
    }

    pub fn bool() -> Self {
        Self::primitive(PrimitiveKind::Bool)
    }

    pub fn i32() -> Self {
        Self::primitive(PrimitiveKind::I32)
    }

    pub fn i64() -> Self {
        Self::primitive(PrimitiveKind::I64)
    }

    pub fn f64() -> Self {
        Self::primitive(PrimitiveKind::F64)
    }

    pub fn string() -> Self {
        Self::primitive(PrimitiveKind::String)
    }

    pub fn nullable(inner: NativeType) -> Self {
        if inner.is_nullable() {
            return inner;
        }
        Self::from_def(format!("Nullable<{}>", inner.name()), TypeKind::Nullable(inner))
    }

    pub fn list(element: NativeType) -> Self {
        Self::from_def(format!("List<{}>", element.name()), TypeKind::List(element))
    }

    pub fn array(element: NativeType) -> Self {
        Self::from_def(format!("Array<{}>", element.name()), TypeKind::Array(element))
    }

    pub fn map(key: NativeType, value: NativeType) -> Self {
        Self::from_def(
            format!("Map<{},{}>", key.name(), value.name()),
            TypeKind::Map(key, value),
        )
    }

    pub fn queryable(element: NativeType) -> Self {
        Self::from_def(
            format!("Queryable<{}>", element.name()),
            TypeKind::Queryable(element),
        )
    }

    pub fn function(params: Vec<NativeType>, ret: NativeType) -> Self {
        let mut args: Vec<&str> = params.iter().map(|p| p.name()).collect();
        args.push(ret.name());
        let name = format!("Func<{}>", args.join(","));
        Self::from_def(name, TypeKind::Function(params, ret))
    }

    pub fn enumeration(name: impl Into<String>, variants: Vec<String>) -> Self {
        Self::from_def(name.into(), TypeKind::Enum(variants))
    }

    /// A named record type with its fields known up front.
    pub fn record(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        let ty = Self::declare_record(name);
        // A freshly declared record has no fields yet.
        let _ = ty.define_fields(fields);
        ty
    }

    /// Declares a named record whose fields are supplied later through
    /// [`define_fields`](Self::define_fields). Needed for self-referencing
    /// and mutually-referencing types.
    pub fn declare_record(name: impl Into<String>) -> Self {
        Self::from_def(
            name.into(),
            TypeKind::Record(RecordDef {
                shape: RecordShape::Named,
                fields: OnceLock::new(),
            }),
        )
    }

    /// An anonymous record type, identified by its ordered member list.
    pub fn anonymous(fields: Vec<FieldDef>) -> Self {
        let name = anonymous_signature(&fields);
        let fields_cell = OnceLock::new();
        let _ = fields_cell.set(fields);
        Self::from_def(
            name,
            TypeKind::Record(RecordDef {
                shape: RecordShape::Anonymous,
                fields: fields_cell,
            }),
        )
    }

    /// `Grouping<K, T>` with members `Key: K` and `Elements: List<T>`.
    pub fn grouping(key: NativeType, element: NativeType) -> Self {
        let name = format!("Grouping<{},{}>", key.name(), element.name());
        let fields_cell = OnceLock::new();
        let _ = fields_cell.set(vec![
            FieldDef::new("Key", key),
            FieldDef::new("Elements", NativeType::list(element)),
        ]);
        Self::from_def(
            name,
            TypeKind::Record(RecordDef {
                shape: RecordShape::Grouping,
                fields: fields_cell,
            }),
        )
    }

    pub fn define_fields(&self, fields: Vec<FieldDef>) -> QueryResult<()> {
        match &self.0.kind {
            TypeKind::Record(record) => record.fields.set(fields).map_err(|_| {
                QueryError::TypeResolution(format!("Fields of '{}' are already defined", self.name()))
            }),
            _ => Err(QueryError::TypeResolution(format!(
                "'{}' is not a record type",
                self.name()
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    pub fn as_primitive(&self) -> Option<PrimitiveKind> {
        match &self.0.kind {
            TypeKind::Primitive(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        self.as_primitive().is_some()
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self.0.kind, TypeKind::Nullable(_))
    }

    /// Strips one `Nullable<...>` layer.
    pub fn underlying(&self) -> &NativeType {
        match &self.0.kind {
            TypeKind::Nullable(inner) => inner,
            _ => self,
        }
    }

    /// Whether `null` is a valid value of this type.
    pub fn accepts_null(&self) -> bool {
        match &self.0.kind {
            TypeKind::Primitive(kind) => *kind == PrimitiveKind::String,
            TypeKind::Enum(_) => false,
            _ => true,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.0.kind, TypeKind::Record(_))
    }

    pub fn record_shape(&self) -> Option<RecordShape> {
        match &self.0.kind {
            TypeKind::Record(record) => Some(record.shape),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.record_shape() == Some(RecordShape::Anonymous)
    }

    pub fn is_grouping(&self) -> bool {
        self.record_shape() == Some(RecordShape::Grouping)
    }

    /// Element type of a sequence-like type (list, array, queryable, grouping).
    pub fn element_type(&self) -> Option<NativeType> {
        match &self.0.kind {
            TypeKind::List(e) | TypeKind::Array(e) | TypeKind::Queryable(e) => Some(e.clone()),
            TypeKind::Record(_) if self.is_grouping() => self
                .fields()
                .get(1)
                .and_then(|f| f.ty.element_type()),
            _ => None,
        }
    }

    pub fn is_sequence(&self) -> bool {
        self.element_type().is_some()
    }

    pub fn enum_variants(&self) -> Option<&[String]> {
        match &self.0.kind {
            TypeKind::Enum(variants) => Some(variants),
            _ => None,
        }
    }

    /// Fields of a record type in declaration order. Empty for non-records
    /// and for declared records whose fields are not defined yet.
    pub fn fields(&self) -> &[FieldDef] {
        match &self.0.kind {
            TypeKind::Record(record) => record.fields.get().map(Vec::as_slice).unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.fields().iter().enumerate().find(|(_, f)| f.name == name)
    }

    pub fn member_type(&self, name: &str) -> Option<NativeType> {
        self.field(name).map(|(_, f)| f.ty.clone())
    }

    /// Structural descriptor for this type. Anonymous types carry their
    /// property list so the receiving side can rebuild them.
    pub fn descriptor(&self) -> TypeInfo {
        match &self.0.kind {
            TypeKind::Primitive(kind) => TypeInfo::named(kind.name()),
            TypeKind::Nullable(inner) => TypeInfo::generic("Nullable", vec![inner.descriptor()]),
            TypeKind::List(e) => TypeInfo::generic("List", vec![e.descriptor()]),
            TypeKind::Array(e) => TypeInfo::generic("Array", vec![e.descriptor()]),
            TypeKind::Map(k, v) => TypeInfo::generic("Map", vec![k.descriptor(), v.descriptor()]),
            TypeKind::Queryable(e) => TypeInfo::generic("Queryable", vec![e.descriptor()]),
            TypeKind::Function(params, ret) => {
                let mut args: Vec<TypeInfo> = params.iter().map(NativeType::descriptor).collect();
                args.push(ret.descriptor());
                TypeInfo::generic("Func", args)
            }
            TypeKind::Enum(_) => TypeInfo::named(self.name()),
            TypeKind::Record(record) => match record.shape {
                RecordShape::Named => TypeInfo::named(self.name()),
                RecordShape::Grouping => {
                    let fields = self.fields();
                    let key = fields.first().map(|f| f.ty.descriptor());
                    let elem = self.element_type().map(|t| t.descriptor());
                    TypeInfo::generic("Grouping", key.into_iter().chain(elem).collect())
                }
                RecordShape::Anonymous => TypeInfo::anonymous(
                    self.fields()
                        .iter()
                        .map(|f| PropertyInfo {
                            name: f.name.clone(),
                            property_type: f.ty.descriptor(),
                        })
                        .collect(),
                ),
            },
        }
    }
}

pub(crate) fn anonymous_signature(fields: &[FieldDef]) -> String {
    let members: Vec<String> = fields
        .iter()
        .map(|f| format!("{}: {}", f.name, f.ty.name()))
        .collect();
    format!("{{ {} }}", members.join(", "))
}

impl PartialEq for NativeType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.name == other.0.name
    }
}

impl Eq for NativeType {}

impl Hash for NativeType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

// Records can reference themselves, so only the name is printed.
impl fmt::Debug for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeType({})", self.0.name)
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl From<PrimitiveKind> for NativeType {
    fn from(kind: PrimitiveKind) -> Self {
        NativeType::primitive(kind)
    }
}
