//! End-to-end dispatch tests against a scripted in-process session.
//!
//! A stub transport serves canned protocol bodies and records every request,
//! while tests inject stopped events directly into the dispatcher's channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use shaderdbg::protocol::Event;
use shaderdbg::{
    DapTransport, Debugger, DebuggerConfig, DebuggerError, DispatcherState, LaneController,
    Result, ThreadScript,
};

/// Serves canned response bodies and logs every request. Variables bodies
/// are keyed by the requested reference so nested trees expand naturally.
struct StubTransport {
    log: Mutex<Vec<String>>,
    stack_trace: Value,
    scopes: Value,
    variables: HashMap<i64, Value>,
    source: Value,
}

impl StubTransport {
    /// A session with one halted thread whose locals hold the given lanes.
    /// Lane `i` gets reference `110 + i`; nested bodies extend the map.
    fn with_lanes(lanes: Vec<Value>, mut nested: HashMap<i64, Value>) -> Arc<Self> {
        let lane_list: Vec<Value> = lanes
            .iter()
            .enumerate()
            .map(|(i, _)| {
                json!({"name": format!("Lane {i}"), "value": "", "variablesReference": 110 + i as i64})
            })
            .collect();
        nested.insert(100, json!({ "variables": lane_list }));
        for (i, children) in lanes.into_iter().enumerate() {
            nested.insert(110 + i as i64, json!({ "variables": children }));
        }
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            stack_trace: json!({"stackFrames": [{
                "id": 1, "name": "VertexShader", "line": 1, "column": 1,
                "source": {"name": "shader.hlsl", "sourceReference": 7}
            }]}),
            scopes: json!({"scopes": [{
                "name": "Locals", "presentationHint": "locals",
                "variablesReference": 100, "expensive": false
            }]}),
            variables: nested,
            source: json!({"content": "first line\nsecond line"}),
        })
    }

    fn count(&self, command: &str) -> usize {
        self.log.lock().iter().filter(|c| *c == command).count()
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl DapTransport for StubTransport {
    async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.log.lock().push(command.to_string());
        match command {
            "initialize" | "setFunctionBreakpoints" | "configurationDone" | "continue"
            | "next" | "stepIn" | "stepOut" => Ok(json!({})),
            "stackTrace" => Ok(self.stack_trace.clone()),
            "scopes" => Ok(self.scopes.clone()),
            "source" => Ok(self.source.clone()),
            "variables" => {
                let reference = arguments
                    .as_ref()
                    .and_then(|a| a["variablesReference"].as_i64())
                    .unwrap_or(0);
                self.variables
                    .get(&reference)
                    .cloned()
                    .ok_or_else(|| {
                        DebuggerError::Protocol(format!("no variables for reference {reference}"))
                    })
            }
            other => Err(DebuggerError::Protocol(format!("unhandled command {other}"))),
        }
    }
}

fn leaf(name: &str, value: &str) -> Value {
    json!({"name": name, "value": value, "variablesReference": 0})
}

fn stopped(thread_id: i64) -> Event {
    Event {
        seq: 0,
        event: "stopped".to_string(),
        body: Some(json!({"reason": "function breakpoint", "threadId": thread_id})),
    }
}

async fn attach(
    transport: Arc<StubTransport>,
) -> (Debugger, mpsc::UnboundedSender<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let debugger = Debugger::attach(transport, rx, DebuggerConfig::default())
        .await
        .unwrap();
    (debugger, tx)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Flag-setting script so tests can observe whether a runner fired.
struct MarkerScript {
    ran: Arc<AtomicBool>,
    resume: bool,
}

impl MarkerScript {
    fn new(resume: bool) -> (Arc<Self>, Arc<AtomicBool>) {
        let ran = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                ran: ran.clone(),
                resume,
            }),
            ran,
        )
    }
}

#[async_trait]
impl ThreadScript for MarkerScript {
    async fn run(&self, thread: &mut LaneController) {
        self.ran.store(true, Ordering::SeqCst);
        if self.resume {
            thread.continue_thread().await;
        }
    }
}

#[tokio::test]
async fn attach_arms_entry_breakpoints_in_order() {
    let transport = StubTransport::with_lanes(vec![], HashMap::new());
    let (_debugger, _tx) = attach(transport.clone()).await;
    assert_eq!(
        transport.commands(),
        vec!["initialize", "setFunctionBreakpoints", "configurationDone"]
    );
}

#[tokio::test]
async fn unmatched_thread_is_resumed_exactly_once() {
    let transport =
        StubTransport::with_lanes(vec![vec![leaf("vertexIndex", "0")].into()], HashMap::new());
    let (debugger, tx) = attach(transport.clone()).await;

    let (script, ran) = MarkerScript::new(true);
    debugger.break_on_vertex_index(9, script).unwrap();

    tx.send(stopped(1)).unwrap();
    eventually("resume of unmatched thread", || transport.count("continue") == 1).await;

    // Locals were probed before giving up.
    assert!(transport.count("variables") > 0);
    assert!(!ran.load(Ordering::SeqCst));

    let report = debugger.flush().await;
    assert_eq!(report, "Thread did not run: VertexIndex(9)");
    assert_eq!(transport.count("continue"), 1);
}

#[tokio::test]
async fn first_registered_key_claims_the_stop() {
    // Lanes 0 and 1 carry vertex indices 4 and 5; both registered keys could
    // match this thread, but one stop event satisfies only one of them.
    let transport = StubTransport::with_lanes(
        vec![
            vec![leaf("vertexIndex", "4")].into(),
            vec![leaf("vertexIndex", "5")].into(),
        ],
        HashMap::new(),
    );
    let (debugger, tx) = attach(transport.clone()).await;

    let (first, first_ran) = MarkerScript::new(true);
    let (second, second_ran) = MarkerScript::new(true);
    debugger.break_on_vertex_index(5, first).unwrap();
    debugger.break_on_vertex_index(4, second).unwrap();

    tx.send(stopped(1)).unwrap();
    eventually("first script", || first_ran.load(Ordering::SeqCst)).await;

    let report = debugger.flush().await;
    assert_eq!(report, "Thread did not run: VertexIndex(4)");
    assert!(!second_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn duplicate_key_registration_is_rejected() {
    let transport = StubTransport::with_lanes(vec![], HashMap::new());
    let (debugger, _tx) = attach(transport).await;

    let (first, _) = MarkerScript::new(false);
    let (second, _) = MarkerScript::new(false);
    debugger.break_on_vertex_index(3, first).unwrap();
    let err = debugger.break_on_vertex_index(3, second).unwrap_err();
    assert!(matches!(err, DebuggerError::DuplicateKey(_)));
}

struct DottedPathScript;

#[async_trait]
impl ThreadScript for DottedPathScript {
    async fn run(&self, thread: &mut LaneController) {
        thread.expect_local_i64("pos.x", 4).await;
        thread.expect_local_i64("pos.y", 9).await;
        thread.continue_thread().await;
    }
}

#[tokio::test]
async fn dotted_path_locals_resolve_through_children() {
    let mut nested = HashMap::new();
    nested.insert(
        120,
        json!({"variables": [leaf("x", "4"), leaf("y", "2")]}),
    );
    let transport = StubTransport::with_lanes(
        vec![vec![
            leaf("vertexIndex", "0"),
            json!({"name": "pos", "value": "", "variablesReference": 120}),
        ]
        .into()],
        nested,
    );
    let (debugger, tx) = attach(transport.clone()).await;

    debugger
        .break_on_vertex_index(0, Arc::new(DottedPathScript))
        .unwrap();
    tx.send(stopped(1)).unwrap();
    eventually("script resume", || transport.count("continue") == 1).await;

    let report = debugger.flush().await;
    // pos.x matched silently; pos.y parsed but diverged.
    assert!(!report.contains("pos.x"));
    assert_eq!(
        report,
        "Local 'pos.y' did not have expected value. Value is '2', expected '9'"
    );
}

#[tokio::test]
async fn flush_lists_unmatched_keys_and_stays_silent_for_passing_scripts() {
    let transport =
        StubTransport::with_lanes(vec![vec![leaf("vertexIndex", "2")].into()], HashMap::new());
    let (debugger, tx) = attach(transport.clone()).await;

    let (passing, passing_ran) = MarkerScript::new(true);
    let (never, _) = MarkerScript::new(false);
    debugger.break_on_vertex_index(2, passing).unwrap();
    debugger.break_on_vertex_index(7, never).unwrap();

    tx.send(stopped(1)).unwrap();
    eventually("passing script", || passing_ran.load(Ordering::SeqCst)).await;

    let report = debugger.flush().await;
    assert_eq!(report, "Thread did not run: VertexIndex(7)");

    // A second flush is a no-op.
    assert_eq!(debugger.flush().await, "");
}

struct LocationScript;

#[async_trait]
impl ThreadScript for LocationScript {
    async fn run(&self, thread: &mut LaneController) {
        thread.expect_location("other.hlsl", 1, None).await;
        thread
            .expect_location("shader.hlsl", 2, Some("let x = 2;"))
            .await;
        thread
            .expect_location("shader.hlsl", 1, Some("wrong text"))
            .await;
        thread.continue_thread().await;
    }
}

#[tokio::test]
async fn expect_location_reports_file_line_and_text_mismatches() {
    // The stub's only frame sits at shader.hlsl line 1, whose text is
    // "first line".
    let transport =
        StubTransport::with_lanes(vec![vec![leaf("vertexIndex", "0")].into()], HashMap::new());
    let (debugger, tx) = attach(transport.clone()).await;

    debugger
        .break_on_vertex_index(0, Arc::new(LocationScript))
        .unwrap();
    tx.send(stopped(1)).unwrap();
    eventually("script resume", || transport.count("continue") == 1).await;

    let report = debugger.flush().await;
    assert_eq!(
        report,
        "Expected file to be 'other.hlsl' but file was shader.hlsl\n\
         Expected line 2 `let x = 2;` but line was 1 `first line`\n\
         Expected source line to be:\n  wrong text\nbut line was:\n  first line"
    );
}

struct StallScript {
    ran: Arc<AtomicBool>,
}

#[async_trait]
impl ThreadScript for StallScript {
    async fn run(&self, _thread: &mut LaneController) {
        self.ran.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn flush_reports_timed_out_script_and_leaves_it_running() {
    let transport =
        StubTransport::with_lanes(vec![vec![leaf("vertexIndex", "0")].into()], HashMap::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let config = DebuggerConfig {
        flush_timeout_secs: 0,
        ..DebuggerConfig::default()
    };
    let debugger = Debugger::attach(transport.clone(), rx, config).await.unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    debugger
        .break_on_vertex_index(0, Arc::new(StallScript { ran: ran.clone() }))
        .unwrap();
    tx.send(stopped(1)).unwrap();
    eventually("stalled script start", || ran.load(Ordering::SeqCst)).await;

    let report = debugger.flush().await;
    assert_eq!(report, "Timed out performing actions");
}

#[tokio::test]
async fn state_moves_from_listening_to_closed() {
    let transport = StubTransport::with_lanes(vec![], HashMap::new());
    let (debugger, _tx) = attach(transport).await;
    assert_eq!(debugger.state(), DispatcherState::Listening);

    debugger.flush().await;
    assert_eq!(debugger.state(), DispatcherState::Closed);
}
