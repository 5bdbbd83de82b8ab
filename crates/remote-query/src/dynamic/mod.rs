//! Dynamic (schema-less) records and the mapper that produces them.

pub mod codec;
pub mod mapper;
pub mod record;

pub use codec::with_scope;
pub use mapper::{normalize_member_name, DynamicObjectMapper, MapperConfig, MemberFilter, TypeInfoPolicy};
pub use record::{DynamicRecord, DynamicValue, Property, RecordRef};
