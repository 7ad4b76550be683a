/// End-to-end tests: real server, real sockets, real artifacts.
///
/// Each test binds a server on an ephemeral port (or a UNIX socket), drives
/// it with the protocol client (or a raw socket for the failure paths),
/// triggers a clean shutdown and asserts on the exported files.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use rec_client::RecorderClient;
use rec_protocol::codec::{encode, MessageUnpacker};
use rec_protocol::messages::{Message, Sample, StatusDetail};
use rec_protocol::value::{datetime_from_epoch_secs, WireValue};
use recorder::config::{
    DatabaseConfig, DatabaseEngine, Endpoint, ExperimentConfig, OutputConfig, RecorderConfig,
    ServerConfig,
};
use recorder::server::{RecorderServer, ShutdownHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config(
    dir: &Path,
    endpoint: Endpoint,
    default_metadata: BTreeMap<String, String>,
) -> RecorderConfig {
    RecorderConfig {
        experiment: ExperimentConfig {
            name: "e2e".to_owned(),
            description: String::new(),
            default_metadata,
        },
        output: OutputConfig {
            directory: dir.to_path_buf(),
            record_file: "records.csv".to_owned(),
            metadata_file: "metadata.json".to_owned(),
            times_file: "times.json".to_owned(),
        },
        database: DatabaseConfig {
            engine: DatabaseEngine::Memory,
            record_chunksize: 1000,
            persist: false,
        },
        server: ServerConfig { endpoint, backlog: 50 },
    }
}

fn tcp_endpoint() -> Endpoint {
    Endpoint::Tcp4 {
        port: 0,
        interface: std::net::Ipv4Addr::LOCALHOST,
    }
}

type RunHandle = JoinHandle<Result<(), recorder::server::ServerError>>;

async fn start_tcp_server(cfg: RecorderConfig) -> (SocketAddr, ShutdownHandle, RunHandle) {
    let server = RecorderServer::bind(cfg).await.expect("bind server");
    let addr = server.local_addr().expect("tcp address");
    let shutdown = server.shutdown_handle();
    let run = tokio::spawn(server.run());
    (addr, shutdown, run)
}

async fn stop_server(shutdown: ShutdownHandle, run: RunHandle) {
    shutdown.trigger();
    run.await.expect("server task").expect("clean shutdown");
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).expect("read json")).expect("valid json")
}

fn ts(secs: f64) -> chrono::DateTime<chrono::Utc> {
    datetime_from_epoch_secs(secs).expect("in range")
}

// Raw socket helpers for the failure paths the client refuses to produce.

async fn raw_send(stream: &mut TcpStream, value: &WireValue) {
    let bytes = encode(value).expect("encode");
    stream.write_all(&bytes).await.expect("write");
}

async fn raw_recv(stream: &mut TcpStream, unpacker: &mut MessageUnpacker) -> Option<Message> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(value) = unpacker.next_value().expect("decode") {
            return Some(Message::from_wire(&value).expect("valid message"));
        }
        let n = stream.read(&mut buf).await.expect("read");
        if n == 0 {
            return None;
        }
        unpacker.feed(&buf[..n]);
    }
}

async fn read_until_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: single client, three samples
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_client_three_samples() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut client = RecorderClient::connect_tcp(addr).await.expect("connect");
    let exp = client.experiment_id();
    let recorded = client
        .record_variables_at(
            ts(1.0),
            BTreeMap::from([("a".to_owned(), Sample::Int(1)), ("b".to_owned(), Sample::Int(2))]),
        )
        .await
        .expect("first record");
    assert_eq!(recorded, 2);
    client
        .record_variables_at(ts(2.0), BTreeMap::from([("a".to_owned(), Sample::Int(3))]))
        .await
        .expect("second record");
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;

    let csv = std::fs::read_to_string(dir.path().join("records.csv")).expect("read csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "experiment,timestamp,a,b");
    assert_eq!(lines.len(), 3);
    let row1: Vec<&str> = lines[1].split(',').collect();
    let row2: Vec<&str> = lines[2].split(',').collect();
    assert_eq!(row1[0], exp.to_string());
    assert_eq!(&row1[2..], ["1", "2"]);
    assert_eq!(&row2[2..], ["3", ""]);

    let times = read_json(&dir.path().join("times.json"));
    let entry = &times[exp.to_string()];
    assert!(entry["start"].is_string());
    assert!(entry["end"].is_string());
}

// ---------------------------------------------------------------------------
// Scenario 2: two concurrent clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_concurrent_clients_record_independently() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let drive = |addr: SocketAddr| async move {
        let mut client = RecorderClient::connect_tcp(addr).await.expect("connect");
        let exp = client.experiment_id();
        for i in 0..100 {
            client
                .record_variables_at(
                    ts(f64::from(i)),
                    BTreeMap::from([("x".to_owned(), Sample::Int(i64::from(i)))]),
                )
                .await
                .expect("record");
        }
        client.finish().await.expect("finish");
        exp
    };
    let (e1, e2) = tokio::join!(drive(addr), drive(addr));
    assert_ne!(e1, e2, "each connection gets a fresh experiment instance");

    stop_server(shutdown, run).await;

    let csv = std::fs::read_to_string(dir.path().join("records.csv")).expect("read csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 201, "200 data rows plus the header");

    // Rows are grouped per experiment and in timestamp order inside a group.
    let experiments: Vec<&str> = lines[1..]
        .iter()
        .map(|l| l.split(',').next().expect("experiment cell"))
        .collect();
    let mut deduped = experiments.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), 2, "experiment rows must be contiguous");
    for chunk in [&lines[1..101], &lines[101..201]] {
        let stamps: Vec<&str> = chunk
            .iter()
            .map(|l| l.split(',').nth(1).expect("timestamp cell"))
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted);
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: metadata upsert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metadata_upsert_is_last_write_wins() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut client = RecorderClient::connect_tcp(addr).await.expect("connect");
    let exp = client.experiment_id();
    client
        .send_metadata(BTreeMap::from([("k".to_owned(), "v1".to_owned())]))
        .await
        .expect("first metadata");
    client
        .send_metadata(BTreeMap::from([("k".to_owned(), "v2".to_owned())]))
        .await
        .expect("second metadata");
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;

    let meta = read_json(&dir.path().join("metadata.json"));
    assert_eq!(meta[exp.to_string()]["k"], "v2");
}

// ---------------------------------------------------------------------------
// Scenario 4: invalid frame mid-stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_frame_mid_stream_closes_but_keeps_prior_records() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut unpacker = MessageUnpacker::new();
    raw_send(
        &mut stream,
        &Message::Version { major: 1, minor: 0 }.to_wire(),
    )
    .await;
    let exp = match raw_recv(&mut stream, &mut unpacker).await {
        Some(Message::Welcome { instance_id }) => instance_id,
        other => panic!("expected welcome, got {other:?}"),
    };

    raw_send(
        &mut stream,
        &Message::Record {
            timestamp: ts(1.0),
            variables: BTreeMap::from([("a".to_owned(), Sample::Int(7))]),
        }
        .to_wire(),
    )
    .await;
    match raw_recv(&mut stream, &mut unpacker).await {
        Some(Message::Status { success: true, .. }) => {}
        other => panic!("expected success status, got {other:?}"),
    }

    // 0xc1 is the reserved msgpack marker; the frame cannot parse.
    stream.write_all(&[0xc1]).await.expect("write garbage");
    match raw_recv(&mut stream, &mut unpacker).await {
        Some(Message::Status {
            success: false,
            detail: StatusDetail::Error(WireValue::Str(text)),
        }) => assert_eq!(text, "Invalid message."),
        other => panic!("expected error status, got {other:?}"),
    }
    read_until_eof(&mut stream).await;

    stop_server(shutdown, run).await;

    // The experiment was ended and the prior record is durable.
    let times = read_json(&dir.path().join("times.json"));
    assert!(times[exp.to_string()]["end"].is_string());
    let csv = std::fs::read_to_string(dir.path().join("records.csv")).expect("read csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "experiment,timestamp,a");
    assert_eq!(lines.len(), 2);
    assert!(lines[1].ends_with(",7"));
}

// ---------------------------------------------------------------------------
// Scenario 5: version mismatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn version_mismatch_gets_no_welcome_and_no_experiment() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut unpacker = MessageUnpacker::new();
    raw_send(
        &mut stream,
        &Message::Version { major: 2, minor: 0 }.to_wire(),
    )
    .await;
    assert!(
        raw_recv(&mut stream, &mut unpacker).await.is_none(),
        "connection must close without a welcome"
    );

    stop_server(shutdown, run).await;

    let times = read_json(&dir.path().join("times.json"));
    assert_eq!(times, serde_json::json!({}), "no experiment row is created");
}

// ---------------------------------------------------------------------------
// Scenario 6: default metadata applied
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_metadata_and_address_are_applied() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(
        dir.path(),
        tcp_endpoint(),
        BTreeMap::from([("run".to_owned(), "r1".to_owned())]),
    );
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let client = RecorderClient::connect_tcp(addr).await.expect("connect");
    let exp = client.experiment_id();
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;

    let meta = read_json(&dir.path().join("metadata.json"));
    let entry = &meta[exp.to_string()];
    assert_eq!(entry["run"], "r1");
    let address = entry["address"].as_str().expect("address is recorded");
    assert!(address.starts_with("127.0.0.1:"), "got '{address}'");
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn record_with_zero_variables_is_acknowledged() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut client = RecorderClient::connect_tcp(addr).await.expect("connect");
    let recorded = client
        .record_variables_at(ts(1.0), BTreeMap::new())
        .await
        .expect("empty record is valid");
    assert_eq!(recorded, 0);
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;
}

#[tokio::test]
async fn finish_with_payload_is_invalid() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut unpacker = MessageUnpacker::new();
    raw_send(
        &mut stream,
        &Message::Version { major: 1, minor: 0 }.to_wire(),
    )
    .await;
    let exp = match raw_recv(&mut stream, &mut unpacker).await {
        Some(Message::Welcome { instance_id }) => instance_id,
        other => panic!("expected welcome, got {other:?}"),
    };

    // finish must carry a nil payload; a map is an invalid message.
    raw_send(
        &mut stream,
        &WireValue::map([
            ("type".to_owned(), WireValue::from("finish")),
            (
                "payload".to_owned(),
                WireValue::Map(std::collections::BTreeMap::new()),
            ),
        ]),
    )
    .await;
    match raw_recv(&mut stream, &mut unpacker).await {
        Some(Message::Status { success: false, .. }) => {}
        other => panic!("expected error status, got {other:?}"),
    }
    read_until_eof(&mut stream).await;

    stop_server(shutdown, run).await;
    let times = read_json(&dir.path().join("times.json"));
    assert!(times[exp.to_string()]["end"].is_string());
}

#[tokio::test]
async fn per_connection_errors_leave_other_clients_running() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut healthy = RecorderClient::connect_tcp(addr).await.expect("connect");

    // A second connection dies on garbage bytes...
    let mut broken = TcpStream::connect(addr).await.expect("connect");
    broken.write_all(&[0xc1]).await.expect("write garbage");
    read_until_eof(&mut broken).await;

    // ...while the healthy one keeps recording.
    let recorded = healthy
        .record_variables_at(ts(1.0), BTreeMap::from([("x".to_owned(), Sample::Int(1))]))
        .await
        .expect("record still works");
    assert_eq!(recorded, 1);
    healthy.finish().await.expect("finish");

    stop_server(shutdown, run).await;
}

// ---------------------------------------------------------------------------
// Store file lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_persistent_store_files_are_deleted_on_shutdown() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("run.db");
    let mut cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    cfg.database.engine = DatabaseEngine::File(db_path.clone());
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let mut client = RecorderClient::connect_tcp(addr).await.expect("connect");
    client
        .record_variables_at(ts(1.0), BTreeMap::from([("x".to_owned(), Sample::Int(1))]))
        .await
        .expect("record");
    client.finish().await.expect("finish");
    assert!(db_path.exists(), "the store file exists while running");

    stop_server(shutdown, run).await;

    // Export ran, then the database and its WAL sidecars were removed.
    assert!(dir.path().join("records.csv").is_file());
    assert!(!db_path.exists(), "store file must be deleted");
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(suffix);
        let sidecar = std::path::PathBuf::from(name);
        assert!(!sidecar.exists(), "sidecar {} must be deleted", sidecar.display());
    }
}

#[tokio::test]
async fn persistent_store_file_survives_shutdown() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("run.db");
    let mut cfg = test_config(dir.path(), tcp_endpoint(), BTreeMap::new());
    cfg.database.engine = DatabaseEngine::File(db_path.clone());
    cfg.database.persist = true;
    let (addr, shutdown, run) = start_tcp_server(cfg).await;

    let client = RecorderClient::connect_tcp(addr).await.expect("connect");
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;
    assert!(db_path.exists(), "persist=true must keep the store file");
}

// ---------------------------------------------------------------------------
// UNIX socket transport
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_round_trip_records_and_cleans_up() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let sock = dir.path().join("rec.sock");
    let cfg = test_config(
        dir.path(),
        Endpoint::Unix { path: sock.clone() },
        BTreeMap::new(),
    );
    let server = RecorderServer::bind(cfg).await.expect("bind server");
    let shutdown = server.shutdown_handle();
    let run = tokio::spawn(server.run());

    let mut client = RecorderClient::connect_unix(&sock).await.expect("connect");
    let exp = client.experiment_id();
    client
        .record_variables_at(ts(1.0), BTreeMap::from([("x".to_owned(), Sample::Float(0.5))]))
        .await
        .expect("record");
    client.finish().await.expect("finish");

    stop_server(shutdown, run).await;

    let meta = read_json(&dir.path().join("metadata.json"));
    assert_eq!(
        meta[exp.to_string()]["address"],
        sock.display().to_string(),
        "unix peers record the socket path"
    );
    assert!(!sock.exists(), "socket file is removed on shutdown");
}
