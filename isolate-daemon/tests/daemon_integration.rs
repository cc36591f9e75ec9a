//! End-to-end coverage over a real TCP socket: handshake, `createRuntime`,
//! `eval`, `dispose`, and namespace reuse across two separate connections
//! (spec.md §8's literal acceptance scenarios for C3/C5/C10).

use std::sync::Arc;
use std::time::Duration;

use isolate_daemon::config::Config;
use isolate_daemon::daemon::Daemon;
use isolate_daemon::error::{DaemonError, DaemonResult};
use isolate_daemon::isolate::{LoadedSource, ModuleLoaderClient};
use isolate_daemon::proto::message::{Hello, Req};
use isolate_daemon::proto::value::Value;
use isolate_daemon::proto::{FrameCodec, WireMessage, PROTOCOL_VERSION};
use isolate_daemon::registry::IsolateRegistry;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct NoopLoader;
impl ModuleLoaderClient for NoopLoader {
    fn load(&self, specifier: &str, _importer_resolve_dir: &str) -> DaemonResult<LoadedSource> {
        Err(DaemonError::ProtocolError(format!("no loader for '{specifier}'")))
    }
}

async fn spawn_daemon() -> (std::net::SocketAddr, tokio::sync::broadcast::Sender<()>) {
    let config = Config::parse_from(["isolate-daemon", "--max-isolates", "4"]);
    let registry = Arc::new(IsolateRegistry::new(config.clone(), Arc::new(NoopLoader)));
    let daemon = Daemon::new(config, registry);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    tokio::spawn(async move {
        let _ = daemon.serve_tcp(listener, shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

/// Minimal client: reads/writes `WireMessage` frames over a plain
/// `TcpStream`, enough to drive the handshake and one request/response.
struct TestClient {
    stream: TcpStream,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            codec: FrameCodec::new(8 * 1024 * 1024),
            buf: vec![0u8; 64 * 1024],
        }
    }

    async fn recv(&mut self) -> WireMessage {
        loop {
            if let Some(raw) = self.codec.next_frame().unwrap() {
                return WireMessage::decode(raw).unwrap();
            }
            let n = self.stream.read(&mut self.buf).await.unwrap();
            assert!(n > 0, "connection closed before a full frame arrived");
            self.codec.feed(&self.buf[..n]);
        }
    }

    async fn send(&mut self, msg: WireMessage) {
        let encoded = msg.encode().unwrap();
        self.stream.write_all(&encoded).await.unwrap();
    }

    async fn handshake(&mut self) {
        match self.recv().await {
            WireMessage::Hello(Hello { protocol_version }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
    }

    async fn request(&mut self, id: u32, op: &str, payload: Value) -> Result<Value, String> {
        self.send(WireMessage::Req(Req {
            id,
            op: op.to_string(),
            payload,
        }))
        .await;
        match self.recv().await {
            WireMessage::RespOk(resp) => {
                assert_eq!(resp.id, id);
                Ok(resp.payload)
            }
            WireMessage::RespErr(err) => {
                assert_eq!(err.id, id);
                Err(err.error.details)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

fn map_u64(v: &Value, key: &str) -> u64 {
    match v {
        Value::Map(m) => match m.get(key).expect("missing field") {
            Value::I64(n) => *n as u64,
            other => panic!("unexpected value for '{key}': {other:?}"),
        },
        other => panic!("expected map, got {other:?}"),
    }
}

#[tokio::test]
async fn create_eval_dispose_round_trip_over_the_wire() {
    let (addr, shutdown_tx) = spawn_daemon().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    let mut payload = std::collections::BTreeMap::new();
    payload.insert("memoryLimitMb".to_string(), Value::I64(32));
    let created = client.request(1, "createRuntime", Value::Map(payload)).await.unwrap();
    let isolate_id = map_u64(&created, "isolateId");

    let mut eval_payload = std::collections::BTreeMap::new();
    eval_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
    eval_payload.insert("code".to_string(), Value::String("1 + 1".to_string()));
    // `eval` (§4.5) reports no value back over the wire on success; the
    // point of running it is the side effect (the isolate thread executes
    // the source without a TryCatch exception), not a returned number.
    let result = client.request(2, "eval", eval_payload).await.unwrap();
    assert_eq!(result, Value::Null);

    let mut dispose_payload = std::collections::BTreeMap::new();
    dispose_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
    client.request(3, "dispose", Value::Map(dispose_payload)).await.unwrap();

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unknown_op_round_trips_as_resp_err() {
    let (addr, shutdown_tx) = spawn_daemon().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    let err = client.request(1, "doesNotExist", Value::Null).await.unwrap_err();
    assert!(err.contains("unknown op"));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn namespace_is_reused_across_separate_connections() {
    let (addr, shutdown_tx) = spawn_daemon().await;

    let mut first = TestClient::connect(addr).await;
    first.handshake().await;
    let mut payload = std::collections::BTreeMap::new();
    payload.insert("namespaceId".to_string(), Value::String("shared-ns".to_string()));
    let created = first.request(1, "createRuntime", payload).await.unwrap();
    let isolate_id = map_u64(&created, "isolateId");
    assert_eq!(created, {
        let mut m = std::collections::BTreeMap::new();
        m.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
        m.insert("reused".to_string(), Value::Bool(false));
        Value::Map(m)
    });

    let mut dispose_payload = std::collections::BTreeMap::new();
    dispose_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
    first.request(2, "dispose", Value::Map(dispose_payload)).await.unwrap();
    drop(first);

    let mut second = TestClient::connect(addr).await;
    second.handshake().await;
    let mut payload = std::collections::BTreeMap::new();
    payload.insert("namespaceId".to_string(), Value::String("shared-ns".to_string()));
    let recreated = second.request(1, "createRuntime", payload).await.unwrap();
    assert_eq!(map_u64(&recreated, "isolateId"), isolate_id);
    match recreated {
        Value::Map(m) => assert_eq!(m.get("reused"), Some(&Value::Bool(true))),
        _ => panic!("expected map"),
    }

    let _ = shutdown_tx.send(());
}

/// spec.md §8 scenario 1 ("Echo"): a guest `serve({fetch})` handler that
/// mirrors the request body back verbatim, driven end to end over the
/// wire via `createRuntime` → `eval` (registers the handler) →
/// `dispatchRequest` → asserting the echoed body and status.
#[tokio::test]
async fn echo_scenario_round_trips_the_request_body() {
    let (addr, shutdown_tx) = spawn_daemon().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    let created = client.request(1, "createRuntime", Value::Null).await.unwrap();
    let isolate_id = map_u64(&created, "isolateId");

    let mut eval_payload = std::collections::BTreeMap::new();
    eval_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
    eval_payload.insert(
        "code".to_string(),
        Value::String("serve({ fetch: (req) => new Response(req.body, { status: 200 }) });".to_string()),
    );
    client.request(2, "eval", eval_payload).await.unwrap();

    let mut req_payload = std::collections::BTreeMap::new();
    req_payload.insert("isolateId".to_string(), Value::I64(isolate_id as i64));
    req_payload.insert("method".to_string(), Value::String("POST".to_string()));
    req_payload.insert("url".to_string(), Value::String("/echo".to_string()));
    req_payload.insert("body".to_string(), Value::Bytes(b"hello".to_vec()));
    let resp = client.request(3, "dispatchRequest", Value::Map(req_payload)).await.unwrap();

    match resp {
        Value::Map(m) => {
            assert_eq!(m.get("status"), Some(&Value::I64(200)));
            assert_eq!(m.get("body"), Some(&Value::Bytes(b"hello".to_vec())));
        }
        other => panic!("expected map response, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn stats_reflect_live_isolate_count() {
    let (addr, shutdown_tx) = spawn_daemon().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.request(1, "createRuntime", Value::Null).await.unwrap();
    let stats = client.request(2, "stats", Value::Null).await.unwrap();
    assert_eq!(map_u64(&stats, "isolateCount"), 1);

    let _ = shutdown_tx.send(());
    // give the reader loop time to notice the socket close on drop
    tokio::time::sleep(Duration::from_millis(10)).await;
}
