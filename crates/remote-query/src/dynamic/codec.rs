//! serde support for dynamic record graphs.
//!
//! Records are written as maps:
//!
//! ```json
//! {"$id": 1, "$type": {"name": "Order"}, "properties": {"Id": 7, "Customer": {"$ref": 2}}}
//! ```
//!
//! Within one reference scope every record is written once; later
//! occurrences become `{"$ref": n}`. A record is registered before its
//! properties are read, so cycles resolve on the way back in. A scope opens
//! implicitly around the outermost dynamic value being (de)serialized, or
//! explicitly with [`with_scope`] to cover a whole message.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use chrono::SecondsFormat;
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use super::record::{DynamicValue, Property, RecordRef};
use crate::types::TypeInfo;

const ID_KEY: &str = "$id";
const REF_KEY: &str = "$ref";
const TYPE_KEY: &str = "$type";
const PROPERTIES_KEY: &str = "properties";

#[derive(Default)]
struct RefScope {
    written: HashMap<usize, u64>,
    next_id: u64,
    read: HashMap<u64, RecordRef>,
}

thread_local! {
    static SCOPE: RefCell<Option<RefScope>> = const { RefCell::new(None) };
}

struct ScopeGuard {
    owner: bool,
}

impl ScopeGuard {
    fn enter() -> Self {
        let owner = SCOPE.with(|scope| {
            let mut scope = scope.borrow_mut();
            if scope.is_none() {
                *scope = Some(RefScope::default());
                true
            } else {
                false
            }
        });
        ScopeGuard { owner }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.owner {
            SCOPE.with(|scope| *scope.borrow_mut() = None);
        }
    }
}

/// Runs `f` inside one reference scope, so records shared between several
/// values of the same message are written once and read back as one.
pub fn with_scope<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ScopeGuard::enter();
    f()
}

enum Written {
    First(u64),
    Seen(u64),
}

fn assign_id(record: &RecordRef) -> Written {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        let scope = scope.get_or_insert_with(RefScope::default);
        if let Some(id) = scope.written.get(&record.addr()) {
            return Written::Seen(*id);
        }
        scope.next_id += 1;
        let id = scope.next_id;
        scope.written.insert(record.addr(), id);
        Written::First(id)
    })
}

fn register_read(id: u64, record: &RecordRef) {
    SCOPE.with(|scope| {
        if let Some(scope) = scope.borrow_mut().as_mut() {
            scope.read.insert(id, record.clone());
        }
    });
}

fn lookup_read(id: u64) -> Option<RecordRef> {
    SCOPE.with(|scope| scope.borrow().as_ref().and_then(|s| s.read.get(&id).cloned()))
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let _guard = ScopeGuard::enter();
        match self {
            DynamicValue::Null => serializer.serialize_unit(),
            DynamicValue::Bool(v) => serializer.serialize_bool(*v),
            DynamicValue::I8(v) => serializer.serialize_i8(*v),
            DynamicValue::I16(v) => serializer.serialize_i16(*v),
            DynamicValue::I32(v) => serializer.serialize_i32(*v),
            DynamicValue::I64(v) => serializer.serialize_i64(*v),
            DynamicValue::U8(v) => serializer.serialize_u8(*v),
            DynamicValue::U16(v) => serializer.serialize_u16(*v),
            DynamicValue::U32(v) => serializer.serialize_u32(*v),
            DynamicValue::U64(v) => serializer.serialize_u64(*v),
            DynamicValue::F32(v) => serializer.serialize_f32(*v),
            DynamicValue::F64(v) => serializer.serialize_f64(*v),
            DynamicValue::Char(v) => serializer.serialize_char(*v),
            DynamicValue::String(v) => serializer.serialize_str(v),
            DynamicValue::DateTime(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            DynamicValue::Date(v) => serializer.serialize_str(&v.format("%Y-%m-%d").to_string()),
            DynamicValue::Uuid(v) => serializer.serialize_str(&v.hyphenated().to_string()),
            DynamicValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DynamicValue::Record(record) => record.serialize(serializer),
        }
    }
}

impl Serialize for RecordRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let _guard = ScopeGuard::enter();
        let id = match assign_id(self) {
            Written::Seen(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REF_KEY, &id)?;
                return map.end();
            }
            Written::First(id) => id,
        };
        let record = self.read();
        let len = if record.type_info.is_some() { 3 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(ID_KEY, &id)?;
        if let Some(type_info) = &record.type_info {
            map.serialize_entry(TYPE_KEY, type_info)?;
        }
        map.serialize_entry(PROPERTIES_KEY, &PropertiesRef(&record.properties))?;
        map.end()
    }
}

struct PropertiesRef<'a>(&'a [Property]);

impl Serialize for PropertiesRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for p in self.0 {
            map.serialize_entry(&p.name, &p.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DynamicValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _guard = ScopeGuard::enter();
        deserializer.deserialize_any(DynamicVisitor)
    }
}

impl<'de> Deserialize<'de> for RecordRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match DynamicValue::deserialize(deserializer)? {
            DynamicValue::Record(record) => Ok(record),
            other => Err(de::Error::custom(format!(
                "expected a record, found {}",
                other.kind_name()
            ))),
        }
    }
}

struct DynamicVisitor;

impl<'de> Visitor<'de> for DynamicVisitor {
    type Value = DynamicValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a dynamic value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<DynamicValue, E> {
        Ok(DynamicValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<DynamicValue, E> {
        Ok(DynamicValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<DynamicValue, D::Error> {
        DynamicValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<DynamicValue, E> {
        Ok(DynamicValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<DynamicValue, E> {
        Ok(DynamicValue::I64(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<DynamicValue, E> {
        Ok(match i64::try_from(v) {
            Ok(v) => DynamicValue::I64(v),
            Err(_) => DynamicValue::U64(v),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<DynamicValue, E> {
        Ok(DynamicValue::F64(v))
    }

    fn visit_char<E: de::Error>(self, v: char) -> Result<DynamicValue, E> {
        Ok(DynamicValue::Char(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<DynamicValue, E> {
        Ok(DynamicValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<DynamicValue, E> {
        Ok(DynamicValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DynamicValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<DynamicValue>()? {
            items.push(item);
        }
        Ok(DynamicValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<DynamicValue, A::Error> {
        let mut record: Option<RecordRef> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                REF_KEY => {
                    let id: u64 = map.next_value()?;
                    let target = lookup_read(id).ok_or_else(|| {
                        de::Error::custom(format!("unresolved record reference {id}"))
                    })?;
                    while map.next_entry::<de::IgnoredAny, de::IgnoredAny>()?.is_some() {}
                    return Ok(DynamicValue::Record(target));
                }
                ID_KEY => {
                    let id: u64 = map.next_value()?;
                    let created = record.get_or_insert_with(|| RecordRef::new(None));
                    register_read(id, created);
                }
                TYPE_KEY => {
                    let type_info: TypeInfo = map.next_value()?;
                    record
                        .get_or_insert_with(|| RecordRef::new(None))
                        .set_type_info(Some(type_info));
                }
                PROPERTIES_KEY => {
                    let target = record.get_or_insert_with(|| RecordRef::new(None)).clone();
                    map.next_value_seed(PropertiesSeed(&target))?;
                }
                other => {
                    return Err(de::Error::unknown_field(
                        other,
                        &[ID_KEY, REF_KEY, TYPE_KEY, PROPERTIES_KEY],
                    ))
                }
            }
        }
        Ok(DynamicValue::Record(
            record.unwrap_or_else(|| RecordRef::new(None)),
        ))
    }
}

struct PropertiesSeed<'a>(&'a RecordRef);

impl<'de> DeserializeSeed<'de> for PropertiesSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for PropertiesSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of record properties")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(name) = map.next_key::<String>()? {
            let value: DynamicValue = map.next_value()?;
            self.0.push(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = RecordRef::from_properties(
            Some(TypeInfo::named("Product")),
            [("Name", DynamicValue::from("Widget")), ("Price", DynamicValue::F64(2.5))],
        );
        let json = serde_json::to_string(&DynamicValue::Record(record)).unwrap();
        assert_eq!(
            json,
            r#"{"$id":1,"$type":{"name":"Product"},"properties":{"Name":"Widget","Price":2.5}}"#
        );
    }

    #[test]
    fn test_shared_record_written_once() {
        let shared = RecordRef::from_properties(None, [("Id", DynamicValue::I32(1))]);
        let list = DynamicValue::List(vec![
            DynamicValue::Record(shared.clone()),
            DynamicValue::Record(shared),
        ]);
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains(r#"{"$ref":1}"#));

        let back: DynamicValue = serde_json::from_str(&json).unwrap();
        let items = back.as_list().unwrap();
        let (a, b) = (items[0].as_record().unwrap(), items[1].as_record().unwrap());
        assert!(a.ptr_eq(b));
    }

    #[test]
    fn test_cycle_round_trip() {
        let node = RecordRef::new(Some(TypeInfo::named("Node")));
        node.push("Value", DynamicValue::I32(3));
        node.push("Next", DynamicValue::Record(node.clone()));
        let json = serde_json::to_string(&DynamicValue::Record(node.clone())).unwrap();

        let back: RecordRef = serde_json::from_str(&json).unwrap();
        match back.get("Next") {
            Some(DynamicValue::Record(next)) => assert!(next.ptr_eq(&back)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(back, node);
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let err = serde_json::from_str::<DynamicValue>(r#"{"$ref": 9}"#).unwrap_err();
        assert!(err.to_string().contains("unresolved record reference 9"));
    }

    #[test]
    fn test_scope_spans_separate_values() {
        let shared = RecordRef::from_properties(None, [("Id", DynamicValue::I32(1))]);
        let (first, second) = with_scope(|| {
            let a = serde_json::to_string(&DynamicValue::Record(shared.clone())).unwrap();
            let b = serde_json::to_string(&DynamicValue::Record(shared.clone())).unwrap();
            (a, b)
        });
        assert!(first.contains("$id"));
        assert_eq!(second, r#"{"$ref":1}"#);
    }
}
