//! End-to-end checks: build a native query, send its portable form through
//! JSON, execute it on the in-memory backend and compare against running
//! the same tree locally.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use remote_query::dynamic::with_scope;
use remote_query::expression::ConstantValue;
use remote_query::native::QueryOperator;
use remote_query::pipeline::execute;
use remote_query::translate::bind_resources;
use remote_query::types::PrimitiveKind;
use remote_query::{
    DataSource, DynamicObjectMapper, DynamicValue, Expression, FieldDef, InMemoryExecutor, InMemorySource,
    MapperConfig, NativeExpr, NativeType, ObjectRef, Query, QueryDescriptor, QueryResult, SourceCatalog,
    TypeRegistry, TypeResolver, Value,
};
use uuid::Uuid;

struct Shop {
    customer: NativeType,
    order: NativeType,
    registry: Arc<TypeRegistry>,
    catalog: Arc<SourceCatalog>,
}

fn shop() -> Shop {
    let customer = NativeType::record(
        "Customer",
        vec![
            FieldDef::new("Id", NativeType::i32()),
            FieldDef::new("Name", NativeType::string()),
        ],
    );
    let order = NativeType::record(
        "Order",
        vec![
            FieldDef::new("Id", NativeType::i32()),
            FieldDef::new("CustomerId", NativeType::i32()),
            FieldDef::new("Total", NativeType::f64()),
        ],
    );
    let registry = Arc::new(TypeRegistry::new());
    registry.register(customer.clone()).unwrap();
    registry.register(order.clone()).unwrap();

    let c = |id: i32, name: &str| Value::Object(ObjectRef::new(&customer, vec![Value::I32(id), name.into()]).unwrap());
    let o = |id: i32, cid: i32, total: f64| {
        Value::Object(ObjectRef::new(&order, vec![Value::I32(id), Value::I32(cid), Value::F64(total)]).unwrap())
    };
    let catalog = Arc::new(SourceCatalog::new());
    catalog.add(InMemorySource::shared(
        customer.clone(),
        vec![c(1, "Ada"), c(2, "Grace"), c(3, "Linus")],
    ));
    catalog.add(InMemorySource::shared(
        order.clone(),
        vec![
            o(10, 1, 25.0),
            o(11, 2, 5.5),
            o(12, 1, 99.0),
            o(13, 3, 42.0),
            o(14, 2, 18.25),
            o(15, 1, 7.0),
        ],
    ));
    Shop {
        customer,
        order,
        registry,
        catalog,
    }
}

impl Shop {
    fn executor(&self) -> InMemoryExecutor {
        InMemoryExecutor::new(self.registry.clone(), self.catalog.clone())
    }

    fn mapper(&self) -> DynamicObjectMapper {
        DynamicObjectMapper::new(MapperConfig::default()).with_resolver(self.registry.clone())
    }

    /// Runs the tree remotely (through JSON) and locally; both must agree.
    fn check_round_trip(&self, native: &NativeExpr) -> DynamicValue {
        let portable = remote_query::to_portable(native).unwrap();
        let json = serde_json::to_string(&portable).unwrap();
        let received: Expression = serde_json::from_str(&json).unwrap();
        assert_eq!(received.to_string(), portable.to_string());

        let remote = execute(&self.executor(), received).unwrap();
        let local_tree = bind_resources(native.clone(), self.catalog.as_ref()).unwrap();
        let local = remote_query::eval::evaluate(&local_tree).unwrap();
        assert_eq!(remote, self.mapper().to_dynamic(&local).unwrap());
        remote
    }
}

fn ints(value: &DynamicValue) -> Vec<i128> {
    value.as_list().unwrap().iter().map(|v| v.as_i128().unwrap()).collect()
}

#[test]
fn test_filter_sort_page_round_trip() {
    let s = shop();
    let q = Query::resource(s.order.clone())
        .filter(|x| x.member("Total")?.gt(NativeExpr::constant(6.0, NativeType::f64())))
        .unwrap()
        .order_by(|x| x.member("CustomerId"))
        .unwrap()
        .then_by_descending(|x| x.member("Total"))
        .unwrap()
        .skip(1)
        .unwrap()
        .take(3)
        .unwrap()
        .select(|x| x.member("Id"))
        .unwrap();
    let result = s.check_round_trip(q.expr());
    assert_eq!(ints(&result), vec![10, 15, 14]);
}

#[test]
fn test_join_round_trip() {
    let s = shop();
    let customers = Query::resource(s.customer.clone());
    let q = Query::resource(s.order.clone())
        .join(
            customers,
            |o| o.member("CustomerId"),
            |c| c.member("Id"),
            |o, c| NativeExpr::new_anonymous(vec![("Order", o.member("Id")?), ("Name", c.member("Name")?)]),
        )
        .unwrap();
    let result = s.check_round_trip(q.expr());
    let rows = result.as_list().unwrap();
    assert_eq!(rows.len(), 6);
    let first = rows[0].as_record().unwrap();
    assert_eq!(first.get("Name").unwrap().as_str(), Some("Ada"));
    assert!(first.type_info().is_none());
}

#[test]
fn test_grouping_round_trip() {
    let s = shop();
    let q = Query::resource(s.order.clone())
        .group_by(|x| x.member("CustomerId"))
        .unwrap()
        .select(|g| {
            let count = g
                .clone()
                .member("Elements")?
                .sequence_call(QueryOperator::Count, Vec::new(), Vec::new())?;
            NativeExpr::new_anonymous(vec![("Customer", g.member("Key")?), ("Orders", count)])
        })
        .unwrap();
    let result = s.check_round_trip(q.expr());
    let counts: Vec<(i128, i128)> = result
        .as_list()
        .unwrap()
        .iter()
        .map(|r| {
            let r = r.as_record().unwrap();
            (
                r.get("Customer").unwrap().as_i128().unwrap(),
                r.get("Orders").unwrap().as_i128().unwrap(),
            )
        })
        .collect();
    assert_eq!(counts, vec![(1, 3), (2, 2), (3, 1)]);
}

#[test]
fn test_scalar_terminal_round_trip() {
    let s = shop();
    let total = Query::resource(s.order.clone()).sum(|x| x.member("Total")).unwrap();
    assert_eq!(s.check_round_trip(&total), DynamicValue::F64(196.75));
    let any_big = Query::resource(s.order.clone())
        .any_where(|x| x.member("Total")?.gt(NativeExpr::constant(90.0, NativeType::f64())))
        .unwrap();
    assert_eq!(s.check_round_trip(&any_big), DynamicValue::Bool(true));
}

#[test]
fn test_literal_and_variable_fidelity() {
    let s = shop();
    let min_id = NativeExpr::captured(12i16, NativeType::primitive(PrimitiveKind::I16));
    let q = Query::resource(s.order.clone())
        .filter(|x| {
            x.clone()
                .member("Id")?
                .ge(min_id)?
                .and(x.member("Total")?.lt(NativeExpr::constant(50.0, NativeType::f64()))?)
        })
        .unwrap()
        .select(|x| x.member("Id"))
        .unwrap();
    let portable = remote_query::to_portable(q.expr()).unwrap();
    let json = serde_json::to_value(&portable).unwrap();
    let text = json.to_string();
    assert!(text.contains("\"node\":\"variable_argument\""));
    assert!(text.contains("\"name\":\"i16\""));

    let mut literals = Vec::new();
    portable
        .clone()
        .transform(&mut |node| {
            if let Expression::Constant(c) = &node {
                if let ConstantValue::Literal(v) = &c.value {
                    literals.push(v.clone());
                }
            }
            Ok(node)
        })
        .unwrap();
    assert_eq!(literals, vec![DynamicValue::F64(50.0)]);

    let result = s.check_round_trip(q.expr());
    assert_eq!(ints(&result), vec![13, 14, 15]);
}

#[test]
fn test_resource_substitution_uses_provider() {
    let s = shop();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let catalog = s.catalog.clone();
    let provider = move |ty: &NativeType| -> QueryResult<Arc<dyn DataSource>> {
        counter.fetch_add(1, Ordering::SeqCst);
        remote_query::DataSourceProvider::provide(catalog.as_ref(), ty)
    };
    let executor = InMemoryExecutor::new(s.registry.clone(), Arc::new(provider));
    let count = Query::resource(s.customer.clone()).count().unwrap();
    let result = execute(&executor, remote_query::to_portable(&count).unwrap()).unwrap();
    assert_eq!(result, DynamicValue::I32(3));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_descriptor_executes_like_chain() {
    let s = shop();
    let q = Query::resource(s.order.clone())
        .filter(|x| x.member("CustomerId")?.eq(NativeExpr::constant(1, NativeType::i32())))
        .unwrap()
        .order_by_descending(|x| x.member("Total"))
        .unwrap()
        .take(2)
        .unwrap();
    let portable = remote_query::to_portable(q.expr()).unwrap();
    let descriptor = QueryDescriptor::from_expression(&portable).unwrap();
    assert_eq!(descriptor.filters.len(), 1);
    assert_eq!(descriptor.take, Some(2));
    let rebuilt = descriptor.to_expression();
    assert_eq!(rebuilt.to_string(), portable.to_string());

    let result = execute(&s.executor(), rebuilt).unwrap();
    let ids: Vec<i128> = result
        .as_list()
        .unwrap()
        .iter()
        .map(|r| r.as_record().unwrap().get("Id").unwrap().as_i128().unwrap())
        .collect();
    assert_eq!(ids, vec![12, 10]);
}

fn boundary_sample() -> NativeType {
    let mut fields: Vec<FieldDef> = PrimitiveKind::ALL
        .iter()
        .map(|kind| FieldDef::new(format!("{kind:?}"), NativeType::primitive(*kind)))
        .collect();
    fields.push(FieldDef::new(
        "Level",
        NativeType::enumeration("Level", vec!["Low".into(), "Mid".into(), "High".into()]),
    ));
    fields.push(FieldDef::new("Note", NativeType::nullable(NativeType::string())));
    fields.push(FieldDef::new("Score", NativeType::nullable(NativeType::i32())));
    NativeType::record("Sample", fields)
}

fn boundary_values(sample: &NativeType, high: bool) -> Value {
    let level = sample.member_type("Level").unwrap();
    let values = if high {
        vec![
            Value::Bool(true),
            Value::I8(i8::MAX),
            Value::I16(i16::MAX),
            Value::I32(i32::MAX),
            Value::I64(i64::MAX),
            Value::U8(u8::MAX),
            Value::U16(u16::MAX),
            Value::U32(u32::MAX),
            Value::U64(u64::MAX),
            Value::F32(f32::MAX),
            Value::F64(f64::MAX),
            Value::Char(char::MAX),
            Value::from("naïve λ"),
            Value::DateTime(
                Utc.from_utc_datetime(
                    &NaiveDate::from_ymd_opt(9999, 12, 31)
                        .unwrap()
                        .and_hms_nano_opt(23, 59, 59, 999_999_999)
                        .unwrap(),
                ),
            ),
            Value::Date(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()),
            Value::Uuid(Uuid::new_v4()),
            Value::Enum { ty: level, variant: "High".into() },
            Value::from("set"),
            Value::I32(42),
        ]
    } else {
        vec![
            Value::Bool(false),
            Value::I8(i8::MIN),
            Value::I16(i16::MIN),
            Value::I32(i32::MIN),
            Value::I64(i64::MIN),
            Value::U8(u8::MIN),
            Value::U16(u16::MIN),
            Value::U32(u32::MIN),
            Value::U64(u64::MIN),
            Value::F32(f32::MIN),
            Value::F64(f64::MIN),
            Value::Char('\0'),
            Value::from(""),
            Value::DateTime(DateTime::<Utc>::UNIX_EPOCH),
            Value::Date(NaiveDate::default()),
            Value::Uuid(Uuid::nil()),
            Value::Enum { ty: level, variant: "Low".into() },
            Value::Null,
            Value::Null,
        ]
    };
    Value::Object(ObjectRef::new(sample, values).unwrap())
}

#[test]
fn test_mapper_primitive_boundaries_survive_json() {
    let sample = boundary_sample();
    let registry = TypeRegistry::new();
    registry.register(sample.clone()).unwrap();
    let resolver: Arc<dyn TypeResolver> = Arc::new(registry);

    let mappers = [
        DynamicObjectMapper::default(),
        DynamicObjectMapper::default().with_resolver(resolver),
    ];
    for mapper in &mappers {
        for high in [false, true] {
            let original = boundary_values(&sample, high);
            let json = serde_json::to_string(&mapper.to_dynamic(&original).unwrap()).unwrap();
            let back: DynamicValue = serde_json::from_str(&json).unwrap();
            let restored = mapper.from_dynamic(&back, &sample).unwrap();
            assert_eq!(restored, original, "{json}");
        }
    }
}

#[test]
fn test_shared_references_survive_json() {
    let s = shop();
    let holder = NativeType::record(
        "Holder",
        vec![
            FieldDef::new("Left", s.customer.clone()),
            FieldDef::new("Right", s.customer.clone()),
        ],
    );
    s.registry.register(holder.clone()).unwrap();
    let ada = ObjectRef::new(&s.customer, vec![Value::I32(1), "Ada".into()]).unwrap();
    let pair = Value::Object(
        ObjectRef::new(&holder, vec![Value::Object(ada.clone()), Value::Object(ada)]).unwrap(),
    );

    let mapper = s.mapper();
    let json = with_scope(|| serde_json::to_string(&mapper.to_dynamic(&pair).unwrap())).unwrap();
    assert!(json.contains("$ref"));
    let back: DynamicValue = serde_json::from_str(&json).unwrap();
    let restored = mapper.from_dynamic_inferred(&back).unwrap();
    let restored = restored.as_object().unwrap();
    let (left, right) = (restored.get("Left").unwrap(), restored.get("Right").unwrap());
    assert!(left.as_object().unwrap().ptr_eq(right.as_object().unwrap()));
}
