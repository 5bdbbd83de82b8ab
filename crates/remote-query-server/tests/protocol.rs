//! End-to-end tests of the streaming protocol: client cursor and handler
//! talking over in-memory pipes and over TCP.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

use remote_query::types::TypeInfo;
use remote_query::{
    to_portable, DynamicValue, Expression, NativeExpr, NativeType, Query, QueryError, Value,
};
use remote_query_server::dsl::parse_query;
use remote_query_server::protocol::*;
use remote_query_server::session::DataSession;
use remote_query_server::transport::framing::Framed;
use remote_query_server::transport::SocketTransport;
use remote_query_server::types::*;

// ─────────────────────── helpers ───────────────────────

fn shop_session(dir: &tempfile::TempDir) -> DataSession {
    let path = dir.path().join("shop.json");
    let data = json!({
        "types": [
            {"name": "Status", "variants": ["Open", "Shipped"]},
            {"name": "Order", "fields": [
                {"name": "Id", "type": "i32"},
                {"name": "Customer", "type": "string"},
                {"name": "Total", "type": "f64"},
                {"name": "Status", "type": "Status"}
            ]}
        ],
        "sources": {
            "Order": [
                {"Id": 1, "Customer": "Ada", "Total": 12.5, "Status": "Open"},
                {"Id": 2, "Customer": "Grace", "Total": 40.0, "Status": "Shipped"},
                {"Id": 3, "Customer": "Ada", "Total": 27.25, "Status": "Shipped"}
            ]
        }
    });
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(data.to_string().as_bytes()).unwrap();
    DataSession::open(&path).unwrap()
}

/// Serves each connection from a fresh in-memory pipe and counts
/// connects and releases.
struct DuplexConnector {
    handler: ProtocolHandler,
    connects: AtomicUsize,
    releases: AtomicUsize,
}

impl DuplexConnector {
    fn new(session: &DataSession) -> Arc<Self> {
        Arc::new(Self {
            handler: ProtocolHandler::new(session.executor()),
            connects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> ServerResult<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server);
            let _ = handler.serve_connection(reader, writer).await;
        });
        let (reader, writer) = tokio::io::split(client);
        Ok(Box::new(Framed::new(reader, writer)))
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn orders_by_id(session: &DataSession) -> Expression {
    parse_query("FROM Order ORDER BY Id", session.registry())
        .unwrap()
        .to_expression()
}

fn ids(items: &[DynamicValue]) -> Vec<i128> {
    items
        .iter()
        .map(|item| item.as_record().unwrap().get("Id").unwrap().as_i128().unwrap())
        .collect()
}

// ─────────────────────── streaming ───────────────────────

#[tokio::test]
async fn test_cursor_pulls_every_element_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);

    let mut cursor = StreamCursor::new(connector.clone(), orders_by_id(&session));
    assert_eq!(cursor.state(), CursorState::Unstarted);
    assert_eq!(connector.connects(), 0);

    let mut items = Vec::new();
    while let Some(item) = cursor.next().await.unwrap() {
        assert_eq!(cursor.sequence_number(), items.len() as u64 + 1);
        items.push(item);
    }

    assert_eq!(ids(&items), vec![1, 2, 3]);
    // Three items plus the end marker.
    assert_eq!(cursor.sequence_number(), 4);
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn test_pull_after_end_is_a_desync() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);

    let expression = parse_query("FROM Order WHERE Id = 2", session.registry())
        .unwrap()
        .to_expression();
    let mut cursor = StreamCursor::new(connector.clone(), expression);
    assert!(cursor.next().await.unwrap().is_some());
    assert!(cursor.next().await.unwrap().is_none());

    let err = cursor.next().await.unwrap_err();
    assert!(matches!(err, QueryError::ProtocolDesync(_)));
    cursor.dispose().await;
    drop(cursor);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn test_into_stream_collects() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);
    let client = RemoteQueryClient::new(connector.clone());

    let expression = parse_query("FROM Order WHERE Customer = 'Ada' ORDER BY Total DESC", session.registry())
        .unwrap()
        .to_expression();
    let items: Vec<DynamicValue> = client
        .stream(expression)
        .into_stream()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(ids(&items), vec![3, 1]);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn test_stream_native_rebuilds_records() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);
    let client = RemoteQueryClient::new(connector);
    let order = session.registry().get("Order").unwrap();

    let query = Query::resource(order)
        .filter(|x| x.member("Total")?.gt(NativeExpr::constant(Value::F64(20.0), NativeType::f64())))
        .unwrap()
        .into_expr();
    let values: Vec<Value> = client
        .stream_native(&query)
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(values.len(), 2);
    let first = values[0].as_object().unwrap();
    assert_eq!(first.get("Id"), Some(Value::I32(2)));
    assert!(matches!(first.get("Status"), Some(Value::Enum { variant, .. }) if variant == "Shipped"));
}

// ─────────────────────── single results ───────────────────────

#[tokio::test]
async fn test_execute_native_scalar() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);
    let client = RemoteQueryClient::new(connector.clone());
    let order = session.registry().get("Order").unwrap();

    let count = Query::resource(order).count().unwrap();
    assert_eq!(client.execute_native(&count).await.unwrap(), Value::I32(3));
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn test_execute_native_rebuilds_a_tagged_record() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let client = RemoteQueryClient::new(DuplexConnector::new(&session));
    let order = session.registry().get("Order").unwrap();

    let first = Query::resource(order.clone())
        .first_where(|x| x.member("Customer")?.eq(NativeExpr::constant(Value::from("Grace"), NativeType::string())))
        .unwrap();
    let value = client.execute_native(&first).await.unwrap();
    let obj = value.as_object().unwrap();
    assert_eq!(obj.ty(), order);
    assert_eq!(obj.get("Id"), Some(Value::I32(2)));
    assert_eq!(obj.get("Total"), Some(Value::F64(40.0)));
}

#[tokio::test]
async fn test_execution_failure_reaches_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let client = RemoteQueryClient::new(DuplexConnector::new(&session));

    let err = client
        .execute(Expression::resource(TypeInfo::named("Invoice")))
        .await
        .unwrap_err();
    match err {
        QueryError::RemoteExecution { data, .. } => {
            assert_eq!(data.unwrap()["code"], query_error_codes::TYPE_RESOLUTION);
        }
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn test_stream_failure_surfaces_on_first_pull() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);

    let mut cursor = StreamCursor::new(
        connector.clone(),
        Expression::resource(TypeInfo::named("Invoice")),
    );
    let err = cursor.next().await.unwrap_err();
    assert!(matches!(err, QueryError::RemoteExecution { .. }));
    assert_eq!(cursor.state(), CursorState::Errored);
    assert_eq!(connector.releases(), 1);
}

// ─────────────────────── raw frames ───────────────────────

#[tokio::test]
async fn test_out_of_order_next_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);
    let mut conn = connector.connect().await.unwrap();

    conn.send(&ClientMessage::StreamQuery {
        expression: orders_by_id(&session),
    })
    .await
    .unwrap();
    conn.send(&ClientMessage::Next { sequence_number: 2 }).await.unwrap();
    match conn.recv().await.unwrap() {
        Some(ServerMessage::Error(e)) => assert_eq!(e.code, query_error_codes::OUT_OF_ORDER),
        other => panic!("unexpected {other:?}"),
    }

    // The stream is gone after the violation.
    conn.send(&ClientMessage::Next { sequence_number: 1 }).await.unwrap();
    match conn.recv().await.unwrap() {
        Some(ServerMessage::Error(e)) => assert_eq!(e.code, query_error_codes::NO_ACTIVE_STREAM),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_query_message_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let connector = DuplexConnector::new(&session);
    let mut conn = connector.connect().await.unwrap();

    let order = session.registry().get("Order").unwrap();
    let any = Query::resource(order).any().unwrap();
    conn.send(&ClientMessage::Query {
        expression: to_portable(&any).unwrap(),
    })
    .await
    .unwrap();

    match conn.recv().await.unwrap() {
        Some(ServerMessage::QueryResult { result }) => {
            assert!(matches!(result, DynamicValue::Bool(true)));
        }
        other => panic!("unexpected {other:?}"),
    }
    conn.close().await.unwrap();
}

// ─────────────────────── tcp ───────────────────────

#[tokio::test]
async fn test_tcp_server_and_client() {
    let dir = tempfile::tempdir().unwrap();
    let session = shop_session(&dir);
    let handler = ProtocolHandler::new(session.executor());
    let shutdown = handler.shutdown_token();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { SocketTransport::new(handler).serve(listener, shutdown).await }
    });

    let client = RemoteQueryClient::new(Arc::new(TcpConnector::new(addr)));
    let expression = parse_query("FROM Order ORDER BY Total TAKE 2", session.registry())
        .unwrap()
        .to_expression();

    let result = client.execute(expression.clone()).await.unwrap();
    assert_eq!(ids(result.as_list().unwrap()), vec![1, 3]);

    let streamed: Vec<DynamicValue> = client
        .stream(expression)
        .into_stream()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(ids(&streamed), vec![1, 3]);

    shutdown.cancel();
    server.await.unwrap().unwrap();
}
