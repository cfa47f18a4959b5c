//! End-to-end client scenarios against scripted connectors: no network, the
//! server side of the stream is driven by the test through channels.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use replane::{
    ByteStream, Client, ClientOptions, Condition, Config, Connector, Context, Error, Override,
    RestoreOptions, StreamRequest,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Yields scripted streams in order; opens beyond the script connect to a
/// stream that never produces anything.
struct ChannelConnector {
    requests: Mutex<Vec<StreamRequest>>,
    streams: Mutex<VecDeque<ByteStream>>,
    opened_tx: mpsc::UnboundedSender<()>,
}

impl ChannelConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (opened_tx, opened_rx) = mpsc::unbounded();
        let connector = Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            opened_tx,
        });
        (connector, opened_rx)
    }

    /// Queue one stream; the returned sender is the server's end of it.
    fn push_stream(&self) -> mpsc::UnboundedSender<replane::Result<Bytes>> {
        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().unwrap().push_back(rx.boxed());
        tx
    }

    fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Connector for ChannelConnector {
    async fn open(&self, request: StreamRequest) -> replane::Result<ByteStream> {
        self.requests.lock().unwrap().push(request);
        let _ = self.opened_tx.unbounded_send(());
        match self.streams.lock().unwrap().pop_front() {
            Some(stream) => Ok(stream),
            None => Ok(futures::stream::pending::<replane::Result<Bytes>>().boxed()),
        }
    }
}

/// A server that never answers the HTTP request at all.
struct HangingConnector;

#[async_trait::async_trait]
impl Connector for HangingConnector {
    async fn open(&self, _request: StreamRequest) -> replane::Result<ByteStream> {
        std::future::pending().await
    }
}

/// A server that rejects every connection with the given error.
struct RejectingConnector(fn() -> Error);

#[async_trait::async_trait]
impl Connector for RejectingConnector {
    async fn open(&self, _request: StreamRequest) -> replane::Result<ByteStream> {
        Err((self.0)())
    }
}

fn base_options() -> ClientOptions {
    ClientOptions {
        sdk_key: "sk_test".to_string(),
        base_url: "https://config.example.com".to_string(),
        ..ClientOptions::default()
    }
}

fn options(connector: &Arc<ChannelConnector>) -> ClientOptions {
    ClientOptions {
        connector: Some(connector.clone() as Arc<dyn Connector>),
        ..base_options()
    }
}

fn frame(event: Value) -> Bytes {
    Bytes::from(format!("data: {event}\n\n"))
}

fn init_frame(configs: Value) -> Bytes {
    frame(json!({"type": "init", "configs": configs}))
}

fn change_frame(config: Value) -> Bytes {
    frame(json!({"type": "config_change", "config": config}))
}

fn record(name: &str, value: Value) -> Config {
    Config {
        name: name.to_string(),
        value,
        overrides: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn fallbacks_satisfy_required_keys_when_the_server_is_silent() {
    let client = Client::connect(ClientOptions {
        connector: Some(Arc::new(HangingConnector)),
        initialization_timeout: Duration::from_millis(50),
        fallbacks: BTreeMap::from([("feature".to_string(), json!("off"))]),
        required: vec!["feature".to_string()],
        ..base_options()
    })
    .await
    .unwrap();

    assert_eq!(client.get("feature").unwrap(), json!("off"));
    client.close();
}

#[tokio::test(start_paused = true)]
async fn initialization_times_out_without_fallbacks() {
    let err = Client::connect(ClientOptions {
        connector: Some(Arc::new(HangingConnector)),
        initialization_timeout: Duration::from_millis(50),
        ..base_options()
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Timeout), "{err}");
    assert_eq!(err.code(), "timeout");
}

#[tokio::test(start_paused = true)]
async fn initialization_fails_naming_missing_required_keys() {
    let err = Client::connect(ClientOptions {
        connector: Some(Arc::new(HangingConnector)),
        initialization_timeout: Duration::from_millis(50),
        fallbacks: BTreeMap::from([("other".to_string(), json!(1))]),
        required: vec!["feature".to_string(), "other".to_string()],
        ..base_options()
    })
    .await
    .unwrap_err();

    match err {
        Error::MissingRequired(names) => assert_eq!(names, vec!["feature".to_string()]),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn definitive_rejections_fail_initialization_immediately() {
    for (make, code) in [
        ((|| Error::Auth) as fn() -> Error, "auth_error"),
        (|| Error::Forbidden, "forbidden"),
        (|| Error::Server(503), "server_error"),
        (|| Error::Client(422), "client_error"),
    ] {
        let err = Client::connect(ClientOptions {
            connector: Some(Arc::new(RejectingConnector(make))),
            ..base_options()
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), code);
    }
}

#[tokio::test(start_paused = true)]
async fn empty_sdk_key_is_an_argument_error() {
    let err = Client::connect(ClientOptions {
        sdk_key: String::new(),
        ..base_options()
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[tokio::test(start_paused = true)]
async fn request_url_and_agent_are_derived_from_options() {
    let (connector, _opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(json!([]))))
        .unwrap();

    let client = Client::connect(ClientOptions {
        base_url: "https://config.example.com///".to_string(),
        ..options(&connector)
    })
    .await
    .unwrap();

    let request = &connector.requests()[0];
    assert_eq!(
        request.url.as_str(),
        "https://config.example.com/api/sdk/v1/replication/stream"
    );
    assert_eq!(request.sdk_key, "sk_test");
    assert!(request.agent.as_deref().unwrap().starts_with("replane-rust/"));
    client.close();
}

#[test]
fn segmentation_override_is_deterministic() {
    let gated = |to_percentage| Config {
        name: "feature".to_string(),
        value: json!("off"),
        overrides: vec![Override {
            name: "rollout".to_string(),
            conditions: vec![Condition::Segmentation {
                property: "userId".to_string(),
                from_percentage: 0.0,
                to_percentage,
                seed: "s".to_string(),
            }],
            value: json!("on"),
        }],
    };
    let context = Context::from([("userId".to_string(), json!("user-abc"))]);

    let client = Client::in_memory([gated(100.0)], context.clone());
    for _ in 0..10 {
        assert_eq!(client.get("feature").unwrap(), json!("on"));
    }

    let client = Client::in_memory([gated(0.0)], context);
    assert_eq!(client.get("feature").unwrap(), json!("off"));
}

#[test]
fn first_matching_override_wins_in_declaration_order() {
    let production = Override {
        name: "production".to_string(),
        conditions: vec![Condition::Equals {
            property: "env".to_string(),
            value: json!("production"),
        }],
        value: json!("p"),
    };
    let staging = Override {
        name: "staging".to_string(),
        conditions: vec![Condition::Equals {
            property: "env".to_string(),
            value: json!("staging"),
        }],
        value: json!("s"),
    };
    let context = Context::from([("env".to_string(), json!("staging"))]);

    for overrides in [
        vec![production.clone(), staging.clone()],
        vec![staging, production],
    ] {
        let client = Client::in_memory(
            [Config {
                name: "feature".to_string(),
                value: json!("base"),
                overrides,
            }],
            context.clone(),
        );
        assert_eq!(client.get("feature").unwrap(), json!("s"));
    }
}

#[tokio::test(start_paused = true)]
async fn applies_live_changes_and_notifies_exactly_once() {
    let (connector, _opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(
            json!([{"name": "config1", "value": "initial", "overrides": []}]),
        )))
        .unwrap();

    let client = Client::connect(options(&connector)).await.unwrap();
    assert_eq!(client.get("config1").unwrap(), json!("initial"));

    let (seen_tx, mut seen_rx) = mpsc::unbounded();
    let _subscription = client.subscribe(move |update| {
        let _ = seen_tx.unbounded_send((update.name.clone(), update.value.clone()));
    });

    stream
        .unbounded_send(Ok(change_frame(
            json!({"name": "config1", "value": "updated", "overrides": []}),
        )))
        .unwrap();

    let (name, value) = seen_rx.next().await.unwrap();
    assert_eq!(name, "config1");
    assert_eq!(value, json!("updated"));
    assert_eq!(client.get("config1").unwrap(), json!("updated"));
    assert!(seen_rx.try_next().is_err(), "expected exactly one notification");
    client.close();
}

#[tokio::test(start_paused = true)]
async fn comment_frames_keep_the_stream_alive_without_side_effects() {
    let (connector, mut opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(
            json!([{"name": "flag", "value": 1, "overrides": []}]),
        )))
        .unwrap();

    let client = Client::connect(ClientOptions {
        inactivity_timeout: Duration::from_secs(5),
        ..options(&connector)
    })
    .await
    .unwrap();
    opened.next().await;

    // Pings arriving inside the inactivity window hold the connection open
    // far beyond the window itself.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        stream.unbounded_send(Ok(Bytes::from(": ping\n\n"))).unwrap();
    }
    assert_eq!(connector.requests().len(), 1, "no reconnect while pinged");
    assert_eq!(client.get("flag").unwrap(), json!(1));
    client.close();
}

#[tokio::test(start_paused = true)]
async fn a_silent_connection_is_dropped_and_reopened() {
    let (connector, mut opened) = ChannelConnector::new();
    // First stream delivers init, then goes silent without closing.
    let silent = connector.push_stream();
    silent
        .unbounded_send(Ok(init_frame(
            json!([{"name": "flag", "value": 1, "overrides": []}]),
        )))
        .unwrap();

    let client = Client::connect(ClientOptions {
        inactivity_timeout: Duration::from_secs(5),
        ..options(&connector)
    })
    .await
    .unwrap();
    opened.next().await;

    // The watchdog gives up on the half-open stream and reconnects.
    opened.next().await;
    assert_eq!(connector.requests().len(), 2);
    assert_eq!(client.get("flag").unwrap(), json!(1));
    client.close();
}

#[tokio::test(start_paused = true)]
async fn reconnects_with_the_replay_body_after_a_drop() {
    let (connector, mut opened) = ChannelConnector::new();
    let first = connector.push_stream();
    first
        .unbounded_send(Ok(init_frame(
            json!([{"name": "config1", "value": "initial", "overrides": []}]),
        )))
        .unwrap();
    let _second = connector.push_stream();

    let client = Client::connect(ClientOptions {
        required: vec!["config1".to_string()],
        ..options(&connector)
    })
    .await
    .unwrap();
    opened.next().await;

    let dropped_at = tokio::time::Instant::now();
    drop(first);
    opened.next().await;

    let elapsed = tokio::time::Instant::now() - dropped_at;
    assert!(
        elapsed >= Duration::from_millis(180) && elapsed <= Duration::from_millis(220),
        "reconnected after {elapsed:?}, outside retry_delay ±10%"
    );

    let requests = connector.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].body.current_configs.is_empty());
    assert_eq!(
        requests[1].body.current_configs,
        vec![record("config1", json!("initial"))]
    );
    assert_eq!(requests[1].body.required_configs, vec!["config1".to_string()]);
    client.close();
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_force_a_reconnect_and_recovery() {
    let (connector, mut opened) = ChannelConnector::new();
    let first = connector.push_stream();
    first
        .unbounded_send(Ok(init_frame(
            json!([{"name": "flag", "value": 1, "overrides": []}]),
        )))
        .unwrap();
    let second = connector.push_stream();

    let client = Client::connect(options(&connector)).await.unwrap();
    opened.next().await;

    first
        .unbounded_send(Ok(Bytes::from("data: {not json\n\n")))
        .unwrap();
    opened.next().await;
    assert_eq!(connector.requests().len(), 2);

    // The replacement stream resumes updates.
    let (seen_tx, mut seen_rx) = mpsc::unbounded();
    let _subscription = client.subscribe(move |update| {
        let _ = seen_tx.unbounded_send(update.value.clone());
    });
    second
        .unbounded_send(Ok(change_frame(
            json!({"name": "flag", "value": 2, "overrides": []}),
        )))
        .unwrap();
    assert_eq!(seen_rx.next().await.unwrap(), json!(2));
    assert_eq!(client.get("flag").unwrap(), json!(2));
    client.close();
}

#[tokio::test(start_paused = true)]
async fn unknown_event_types_are_ignored() {
    let (connector, _opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(
            json!([{"name": "flag", "value": 1, "overrides": []}]),
        )))
        .unwrap();
    let client = Client::connect(options(&connector)).await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded();
    let _subscription = client.subscribe_key("flag", move |update| {
        let _ = seen_tx.unbounded_send(update.value.clone());
    });

    stream
        .unbounded_send(Ok(frame(json!({"type": "project_renamed", "project": "p"}))))
        .unwrap();
    stream
        .unbounded_send(Ok(change_frame(
            json!({"name": "flag", "value": 2, "overrides": []}),
        )))
        .unwrap();
    assert_eq!(seen_rx.next().await.unwrap(), json!(2));
    assert_eq!(connector.requests().len(), 1, "unknown events must not reconnect");
    client.close();
}

#[tokio::test(start_paused = true)]
async fn snapshot_hydration_with_live_continuation() {
    let (connector, _opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(json!([
            {"name": "config1", "value": "v1", "overrides": []},
            {"name": "config2", "value": "same", "overrides": []},
        ]))))
        .unwrap();
    let producer = Client::connect(options(&connector)).await.unwrap();
    let snapshot = producer.snapshot();
    producer.close();

    // Offline restore serves every snapshotted name synchronously.
    let offline = Client::restore(RestoreOptions {
        snapshot: snapshot.clone(),
        connection: None,
        context: None,
    })
    .unwrap();
    assert_eq!(offline.get("config1").unwrap(), json!("v1"));
    assert_eq!(offline.get("config2").unwrap(), json!("same"));

    // Live restore is usable immediately and then converges on the stream.
    let (live_connector, mut live_opened) = ChannelConnector::new();
    let live_stream = live_connector.push_stream();
    let live = Client::restore(RestoreOptions {
        snapshot,
        connection: Some(options(&live_connector)),
        context: None,
    })
    .unwrap();
    assert_eq!(live.get("config1").unwrap(), json!("v1"));

    let (seen_tx, mut seen_rx) = mpsc::unbounded();
    let _subscription = live.subscribe(move |update| {
        let _ = seen_tx.unbounded_send((update.name.clone(), update.value.clone()));
    });

    live_stream
        .unbounded_send(Ok(init_frame(json!([
            {"name": "config1", "value": "v2", "overrides": []},
            {"name": "config2", "value": "same", "overrides": []},
        ]))))
        .unwrap();

    let (name, value) = seen_rx.next().await.unwrap();
    assert_eq!(name, "config1");
    assert_eq!(value, json!("v2"));
    assert_eq!(live.get("config1").unwrap(), json!("v2"));
    assert_eq!(live.get("config2").unwrap(), json!("same"));
    assert!(
        seen_rx.try_next().is_err(),
        "unchanged records must not notify on re-init"
    );

    // The background connection replayed the snapshot state.
    live_opened.next().await;
    assert_eq!(live_connector.requests()[0].body.current_configs.len(), 2);
    live.close();
}

#[tokio::test(start_paused = true)]
async fn close_stops_updates_but_keeps_cached_reads() {
    let (connector, _opened) = ChannelConnector::new();
    let stream = connector.push_stream();
    stream
        .unbounded_send(Ok(init_frame(
            json!([{"name": "flag", "value": 1, "overrides": []}]),
        )))
        .unwrap();
    let client = Client::connect(options(&connector)).await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded();
    let _subscription = client.subscribe(move |update| {
        let _ = seen_tx.unbounded_send(update.name.clone());
    });

    client.close();
    client.close();
    assert!(client.is_closed());

    // Give the aborted driver task time to unwind and drop its stream.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    let send = stream.unbounded_send(Ok(change_frame(
        json!({"name": "flag", "value": 2, "overrides": []}),
    )));
    assert!(send.is_err(), "closed client still held its stream");

    assert_eq!(client.get("flag").unwrap(), json!(1));
    if let Ok(Some(name)) = seen_rx.try_next() {
        panic!("notification after close: {name}");
    }
}

fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, EnvFilter};

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Serve exactly one HTTP exchange: read the request head, write `response`
/// verbatim, and optionally keep the socket open afterwards.
async fn serve_once(response: String, hold_open: bool) -> std::net::SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _peer) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut head = Vec::new();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            head.extend_from_slice(&buf[..n]);
            if n == 0 || head.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        if hold_open {
            let mut sink = [0u8; 64];
            while socket.read(&mut sink).await.map(|n| n > 0).unwrap_or(false) {}
        }
    });
    addr
}

fn http_options(addr: std::net::SocketAddr) -> ClientOptions {
    ClientOptions {
        sdk_key: "sk_test".to_string(),
        base_url: format!("http://{addr}"),
        initialization_timeout: Duration::from_secs(10),
        ..ClientOptions::default()
    }
}

#[tokio::test]
async fn http_connector_reads_a_real_event_stream() -> anyhow::Result<()> {
    init_tracing();
    let event = json!({
        "type": "init",
        "configs": [{"name": "flag", "value": "on", "overrides": []}],
    })
    .to_string();
    let payload = format!("data: {event}\n\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{payload}\r\n",
        payload.len(),
    );
    let addr = serve_once(response, true).await;

    let client = Client::connect(http_options(addr)).await?;
    assert_eq!(client.get("flag")?, json!("on"));
    client.close();
    Ok(())
}

#[tokio::test]
async fn http_connector_maps_auth_rejections() {
    init_tracing();
    let addr = serve_once(
        "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n".to_string(),
        false,
    )
    .await;

    let err = Client::connect(http_options(addr)).await.unwrap_err();
    assert!(matches!(err, Error::Auth), "{err}");
    assert_eq!(err.code(), "auth_error");
}

#[tokio::test]
async fn http_connector_rejects_non_event_stream_responses() {
    let addr = serve_once(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 2\r\n\r\nhi".to_string(),
        false,
    )
    .await;

    let err = Client::connect(http_options(addr)).await.unwrap_err();
    assert_eq!(err.code(), "server_error");
}
