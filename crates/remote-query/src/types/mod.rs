//! Type model: live native types, structural descriptors and the registry
//! that resolves one into the other.

pub mod descriptor;
pub mod native;
pub mod registry;

pub use descriptor::{ConstructorInfo, MemberInfo, MethodInfo, PropertyInfo, TypeInfo};
pub use native::{FieldDef, NativeType, PrimitiveKind, RecordShape, TypeKind};
pub use registry::{TypeRegistry, TypeResolver};
