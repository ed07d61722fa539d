//! End-to-end tests for livedebug using mock seams
//!
//! These drive the orchestrator through the same entry points the control
//! channel uses, with a mock launcher, attacher and controller in place of
//! real processes and network peers.

mod mock_backend;

use livedebug::channel::RpcHandler;
use livedebug::config::Config;
use livedebug::orchestrator::Orchestrator;
use livedebug::protocol::{procedures, CRITERIA_TOPIC};
use livedebug::registry::SessionState;
use mock_backend::{MockAttacher, MockController, MockLauncher};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    launcher: Arc<MockLauncher>,
    attacher: Arc<MockAttacher>,
    controller: Arc<MockController>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.debugger.enabled = true;
    config.fork.listen_ports = vec![8080, 9090];
    config.orphan.check_interval_secs = 1;
    config.replay.timeout_secs = 10;
    config
}

fn harness(config: Config) -> Harness {
    let launcher = Arc::new(MockLauncher::default());
    let attacher = Arc::new(MockAttacher::default());
    let controller = Arc::new(MockController::new());
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        launcher.clone(),
        attacher.clone(),
        controller.clone(),
    ));
    Harness {
        orchestrator,
        launcher,
        attacher,
        controller,
    }
}

async fn start(h: &Harness, session_id: &str) -> Result<Value, livedebug::RpcError> {
    h.orchestrator
        .handle_call(procedures::START, json!({ "session_id": session_id }))
        .await
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Accept one HTTP request on `port`, hand back its raw text, then answer
/// after `delay`.
async fn http_target(
    port: u16,
    delay: Duration,
) -> tokio::sync::oneshot::Receiver<String> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(idx) = text.find("\r\n\r\n") {
                let content_length = text[..idx]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= idx + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        tokio::time::sleep(delay).await;
        let body = r#"{"ok":true}"#;
        let response = format!(
            "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
    });
    rx
}

/// Start, refuse evaluation without touching the debuggee, stop.
#[tokio::test]
async fn test_start_refused_evaluate_stop() {
    let h = harness(test_config());

    let ack = start(&h, "s1").await.unwrap();
    assert_eq!(ack["state"], "attached");
    assert_eq!(ack["session_id"], "s1");
    assert!(ack["ports"]["8080"].is_u64());
    assert!(ack["ports"]["9090"].is_u64());
    assert_eq!(h.orchestrator.registry().len(), 1);

    let err = h
        .orchestrator
        .handle_call(
            procedures::EVALUATE,
            json!({ "session_id": "s1", "expression": "1+1" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "eval_expression_disabled");
    assert!(h.attacher.connection(0).methods().is_empty());

    let stopped = h
        .orchestrator
        .handle_call(procedures::STOP, json!({ "session_id": "s1" }))
        .await
        .unwrap();
    assert_eq!(stopped["state"], "ended");
    assert_eq!(h.orchestrator.registry().state("s1"), SessionState::Absent);
    assert_eq!(h.orchestrator.ports().claimed_count(), 0);

    // Stopping again is a no-op
    let again = h
        .orchestrator
        .handle_call(procedures::STOP, json!({ "session_id": "s1" }))
        .await
        .unwrap();
    assert_eq!(again["state"], "ended");
    assert_eq!(h.launcher.child(0).kill_count(), 1);
}

#[tokio::test]
async fn test_duplicate_start_rejected() {
    let h = harness(test_config());
    start(&h, "dup").await.unwrap();

    let err = start(&h, "dup").await.unwrap_err();
    assert_eq!(err.code(), "debugger_session_id_duplicate");
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.orchestrator.registry().len(), 1);
}

#[tokio::test]
async fn test_concurrent_starts_get_disjoint_ports() {
    let h = harness(test_config());

    let (a, b) = tokio::join!(start(&h, "a"), start(&h, "b"));
    a.unwrap();
    b.unwrap();

    let mut seen = HashSet::new();
    for spec in h.launcher.specs() {
        for port in spec.ports() {
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(h.orchestrator.registry().len(), 2);
}

#[tokio::test]
async fn test_child_exit_ends_session() {
    let h = harness(test_config());
    let mut events = h.orchestrator.bus().subscribe();
    start(&h, "exits").await.unwrap();

    h.launcher.child(0).simulate_exit(Some(3));
    let registry = Arc::clone(h.orchestrator.registry());
    eventually("session removal", || registry.is_empty()).await;
    assert_eq!(h.orchestrator.ports().claimed_count(), 0);
    // Exited on its own, so no kill was sent
    assert_eq!(h.launcher.child(0).kill_count(), 0);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind.as_str());
    }
    assert_eq!(kinds, vec!["session_started", "session_ended"]);
}

#[tokio::test]
async fn test_orphan_check_ends_unwanted_session() {
    let h = harness(test_config());
    start(&h, "orphan").await.unwrap();
    h.controller.alive.store(false, Ordering::SeqCst);

    h.orchestrator.check_orphans().await;

    assert!(h.orchestrator.registry().is_empty());
    assert_eq!(h.launcher.child(0).kill_count(), 1);
    assert_eq!(h.controller.alive_calls(), 1);
}

#[tokio::test]
async fn test_orphan_check_keeps_wanted_session() {
    let h = harness(test_config());
    start(&h, "kept").await.unwrap();

    h.orchestrator.check_orphans().await;

    assert!(h.orchestrator.registry().get("kept").is_some());
    assert_eq!(h.launcher.child(0).kill_count(), 0);
}

#[tokio::test]
async fn test_orphan_check_skipped_while_disconnected() {
    let h = harness(test_config());
    start(&h, "offline").await.unwrap();
    h.controller.connected.store(false, Ordering::SeqCst);
    h.controller.alive.store(false, Ordering::SeqCst);

    h.orchestrator.check_orphans().await;

    assert!(h.orchestrator.registry().get("offline").is_some());
    assert_eq!(h.controller.alive_calls(), 0);
}

#[tokio::test]
async fn test_orphan_loop_removes_exited_session() {
    let h = harness(test_config());
    let tasks = h.orchestrator.spawn_background();
    start(&h, "loop").await.unwrap();

    h.launcher.child(0).simulate_exit(None);
    let registry = Arc::clone(h.orchestrator.registry());
    eventually("orphan loop cleanup", || registry.is_empty()).await;

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_disabled_debugger_refuses_start() {
    let mut config = test_config();
    config.debugger.enabled = false;
    let h = harness(config);

    let err = start(&h, "s1").await.unwrap_err();
    assert_eq!(err.code(), "debugger_disabled");
    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn test_invalid_session_id_refused() {
    let h = harness(test_config());

    let too_long = "x".repeat(200);
    for bad in ["", "has space", too_long.as_str()] {
        let err = start(&h, bad).await.unwrap_err();
        assert_eq!(err.code(), "debugger_session_id");
    }
    let err = h
        .orchestrator
        .handle_call(procedures::START, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "debugger_session_id");
    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn test_failed_attach_rolls_back() {
    let h = harness(test_config());
    h.attacher.fail.store(true, Ordering::SeqCst);

    let err = start(&h, "s1").await.unwrap_err();
    assert_eq!(err.code(), "child_process_failed");
    assert_eq!(h.launcher.child(0).kill_count(), 1);
    assert_eq!(h.orchestrator.registry().state("s1"), SessionState::Absent);
    assert_eq!(h.orchestrator.ports().claimed_count(), 0);

    // The id is free again
    h.attacher.fail.store(false, Ordering::SeqCst);
    start(&h, "s1").await.unwrap();
}

#[tokio::test]
async fn test_failed_launch_rolls_back() {
    let h = harness(test_config());
    h.launcher.fail.store(true, Ordering::SeqCst);

    let err = start(&h, "s1").await.unwrap_err();
    assert_eq!(err.code(), "child_process_failed");
    assert!(h.orchestrator.registry().is_empty());
    assert_eq!(h.orchestrator.ports().claimed_count(), 0);
}

#[tokio::test]
async fn test_unknown_session_id() {
    let h = harness(test_config());
    let err = h
        .orchestrator
        .handle_call(procedures::RESUME, json!({ "session_id": "ghost" }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "session_not_found");
}

#[tokio::test]
async fn test_bridge_operations_reach_debuggee() {
    let mut config = test_config();
    config.debugger.eval_expression = true;
    let h = harness(config);
    start(&h, "ops").await.unwrap();

    let value = h
        .orchestrator
        .handle_call(
            procedures::EVALUATE,
            json!({ "session_id": "ops", "expression": "1+1" }),
        )
        .await
        .unwrap();
    assert_eq!(value["result"]["value"], 2);

    let bp = h
        .orchestrator
        .handle_call(
            procedures::SET_BREAKPOINT,
            json!({
                "session_id": "ops",
                "location": { "url": "file:///app/server.js", "line_number": 12 }
            }),
        )
        .await
        .unwrap();
    assert_eq!(bp["breakpoint_id"], "bp-1");

    h.orchestrator
        .handle_call(procedures::STEP_OVER, json!({ "session_id": "ops" }))
        .await
        .unwrap();
    h.orchestrator
        .handle_call(procedures::PAUSE, json!({ "session_id": "ops" }))
        .await
        .unwrap();

    let methods = h.attacher.connection(0).methods();
    assert_eq!(
        methods,
        vec![
            "Runtime.evaluate",
            "Debugger.setBreakpointByUrl",
            "Debugger.stepOver",
            "Debugger.pause"
        ]
    );
}

#[tokio::test]
async fn test_list_scripts_after_parse_events() {
    let h = harness(test_config());
    start(&h, "scripts").await.unwrap();

    let conn = h.attacher.connection(0);
    conn.emit(
        "Debugger.scriptParsed",
        json!({ "scriptId": "1", "url": "file:///app/a.js" }),
    );
    conn.emit(
        "Debugger.scriptParsed",
        json!({ "scriptId": "2", "url": "file:///app/b.js" }),
    );

    let mut listed = Value::Null;
    for _ in 0..100 {
        listed = h
            .orchestrator
            .handle_call(
                procedures::LIST_SCRIPTS,
                json!({ "session_id": "scripts", "since": 1 }),
            )
            .await
            .unwrap();
        if listed["total"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(listed["total"], 2);
    assert_eq!(listed["scripts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_directory_stays_in_working_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("package.json"), "{}").unwrap();

    let mut config = test_config();
    config.debugger.working_dir = Some(dir.path().to_path_buf());
    let h = harness(config);
    start(&h, "fs").await.unwrap();

    let listing = h
        .orchestrator
        .handle_call(
            procedures::LIST_DIRECTORY,
            json!({ "session_id": "fs", "path": "" }),
        )
        .await
        .unwrap();
    let names: Vec<&str> = listing["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["src", "package.json"]);

    let err = h
        .orchestrator
        .handle_call(
            procedures::LIST_DIRECTORY,
            json!({ "session_id": "fs", "path": "../" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "path_outside_root");
}

#[tokio::test]
async fn test_replay_multipart_without_file_sends_json() {
    let h = harness(test_config());
    start(&h, "replay").await.unwrap();
    let session = h.orchestrator.registry().get("replay").unwrap();
    let target = session.remap.get(8080).unwrap();
    let received = http_target(target, Duration::ZERO).await;

    let outcome = h
        .orchestrator
        .handle_call(
            procedures::REPLAY,
            json!({
                "session_id": "replay",
                "request_id": "r1",
                "request": {
                    "method": "POST",
                    "path": "/orders?x=1",
                    "headers": {
                        "Content-Type": "multipart/form-data; boundary=abc",
                        "Host": "prod.example.com",
                        "X-Trace": "t-1"
                    },
                    "body": { "item": "widget" },
                    "multipart": true,
                    "port": 8080,
                    "session_data": { "user": 7 }
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(outcome["status"], "response");
    assert_eq!(outcome["status_code"], 201);

    let raw = received.await.unwrap().to_ascii_lowercase();
    assert!(raw.starts_with("post /orders?x=1 "));
    assert!(raw.contains("content-type: application/json"));
    assert!(!raw.contains("multipart/form-data"));
    assert!(!raw.contains("prod.example.com"));
    assert!(raw.contains("x-trace: t-1"));
    assert!(raw.contains(r#"{"item":"widget"}"#));

    assert_eq!(h.launcher.child(0).pushes(), vec![json!({ "user": 7 })]);
    assert_eq!(session.replays.in_flight(), 0);
}

#[tokio::test]
async fn test_replay_without_captured_port_is_ambiguous() {
    let h = harness(test_config());
    start(&h, "ambiguous").await.unwrap();

    let err = h
        .orchestrator
        .handle_call(
            procedures::REPLAY,
            json!({
                "session_id": "ambiguous",
                "request_id": "r1",
                "request": { "method": "GET", "path": "/" }
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "port_not_mapped");
}

fn skip_flags(h: &Harness, connection: usize) -> Vec<Value> {
    h.attacher
        .connection(connection)
        .calls()
        .into_iter()
        .filter(|(m, _)| m == "Debugger.setSkipAllPauses")
        .map(|(_, p)| p["skip"].clone())
        .collect()
}

#[tokio::test]
async fn test_cancel_in_flight_replay() {
    let h = harness(test_config());
    start(&h, "cancel").await.unwrap();
    let session = h.orchestrator.registry().get("cancel").unwrap();
    let target = session.remap.get(9090).unwrap();
    let received = http_target(target, Duration::from_millis(800)).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let replay = tokio::spawn(async move {
        orchestrator
            .handle_call(
                procedures::REPLAY,
                json!({
                    "session_id": "cancel",
                    "request_id": "slow",
                    "request": { "method": "GET", "path": "/slow", "port": 9090 }
                }),
            )
            .await
    });
    received.await.unwrap();

    let cancelled = h
        .orchestrator
        .handle_call(
            procedures::CANCEL_REPLAY,
            json!({ "session_id": "cancel", "request_id": "slow" }),
        )
        .await
        .unwrap();
    assert_eq!(cancelled["cancelled"], true);

    // The caller hears about the cancellation right away
    let outcome = tokio::time::timeout(Duration::from_millis(500), replay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome["status"], "cancelled");

    // The target is still holding the request, so pauses stay skipped
    assert_eq!(skip_flags(&h, 0), vec![json!(true)]);
    assert_eq!(session.replays.in_flight(), 1);

    // Restored once the target answers
    eventually("skip cleared", || skip_flags(&h, 0).len() == 2).await;
    assert_eq!(skip_flags(&h, 0), vec![json!(true), json!(false)]);
    eventually("replay unregistered", || session.replays.in_flight() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_paused_resumes() {
    let h = harness(test_config());

    for round in 0..10 {
        let id = format!("paused-{}", round);
        start(&h, &id).await.unwrap();
        let session = h.orchestrator.registry().get(&id).unwrap();
        let target = session.remap.get(8080).unwrap();
        let received = http_target(target, Duration::from_secs(2)).await;

        let conn = h.attacher.connection(round);
        conn.emit("Debugger.paused", json!({ "reason": "breakpoint" }));
        let bridge = Arc::clone(&session.bridge);
        eventually("paused state", || bridge.is_paused()).await;

        let orchestrator = Arc::clone(&h.orchestrator);
        let replay_session = id.clone();
        let replay = tokio::spawn(async move {
            orchestrator
                .handle_call(
                    procedures::REPLAY,
                    json!({
                        "session_id": replay_session,
                        "request_id": "held",
                        "request": { "method": "GET", "path": "/held", "port": 8080 }
                    }),
                )
                .await
        });
        received.await.unwrap();

        let cancelled = h
            .orchestrator
            .handle_call(
                procedures::CANCEL_REPLAY,
                json!({ "session_id": id, "request_id": "held" }),
            )
            .await
            .unwrap();
        assert_eq!(cancelled["cancelled"], true);

        let outcome = replay.await.unwrap().unwrap();
        assert_eq!(outcome["status"], "cancelled");
        assert_eq!(
            conn.methods(),
            vec!["Debugger.setSkipAllPauses", "Debugger.resume"],
            "round {}",
            round
        );
        assert_eq!(skip_flags(&h, round), vec![json!(false)]);
    }
}

#[tokio::test]
async fn test_cancel_unknown_request() {
    let h = harness(test_config());
    start(&h, "s1").await.unwrap();

    let result = h
        .orchestrator
        .handle_call(
            procedures::CANCEL_REPLAY,
            json!({ "session_id": "s1", "request_id": "nope" }),
        )
        .await
        .unwrap();
    assert_eq!(result["cancelled"], false);
}

#[tokio::test]
async fn test_session_events_published_to_controller() {
    let h = harness(test_config());
    let tasks = h.orchestrator.spawn_background();
    start(&h, "events").await.unwrap();

    h.attacher
        .connection(0)
        .emit("Debugger.paused", json!({ "reason": "other" }));

    let controller = Arc::clone(&h.controller);
    eventually("paused event", || {
        controller
            .published()
            .iter()
            .any(|(topic, payload)| {
                topic == "debugger.session.events" && payload["event"] == "paused"
            })
    })
    .await;

    let published = h.controller.published();
    assert_eq!(published[0].0, "debugger.session.events");
    assert_eq!(published[0].1["event"], "session_started");
    assert_eq!(published[0].1["session_id"], "events");

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn test_list_sessions_and_ping() {
    let h = harness(test_config());
    start(&h, "b").await.unwrap();
    start(&h, "a").await.unwrap();

    let listed = h
        .orchestrator
        .handle_call(procedures::LIST_SESSIONS, Value::Null)
        .await
        .unwrap();
    let ids: Vec<&str> = listed["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let pong = h
        .orchestrator
        .handle_call(procedures::PING, Value::Null)
        .await
        .unwrap();
    assert_eq!(pong["pong"], true);
}

#[tokio::test]
async fn test_unknown_procedure() {
    let h = harness(test_config());
    let err = h
        .orchestrator
        .handle_call("debugger.teleport", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_procedure");
}

#[tokio::test]
async fn test_capture_criteria_push_and_fetch() {
    let h = harness(test_config());

    h.orchestrator.on_connected().await;
    assert!(h.orchestrator.criteria().should_capture(500, "/"));

    h.orchestrator
        .handle_event(CRITERIA_TOPIC, json!({ "routes": ["^/checkout"] }))
        .await;
    assert!(h.orchestrator.criteria().should_capture(200, "/checkout/1"));
    assert!(!h.orchestrator.criteria().should_capture(500, "/"));
}

#[test]
fn test_lanes_follow_session() {
    let h = harness(test_config());
    let args = json!({ "session_id": "s1" });
    assert_eq!(
        h.orchestrator.lane(procedures::STEP_INTO, &args),
        Some("s1".to_string())
    );
    assert_eq!(h.orchestrator.lane(procedures::START, &args), None);
    assert_eq!(h.orchestrator.lane(procedures::STOP, &args), None);
    assert_eq!(h.orchestrator.lane(procedures::REPLAY, &args), None);
    assert_eq!(h.orchestrator.lane(procedures::CANCEL_REPLAY, &args), None);
}
