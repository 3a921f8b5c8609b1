//! Per-invocation script execution.
//!
//! A `ThreadRunner` binds one caller-supplied script to one resolved
//! `(thread, lane)` pair and runs it on a background task, concurrently with
//! the dispatcher's event handling and with other runners. Assertion
//! failures accumulate as diagnostics; they never abort the script.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::SessionClient;
use crate::diagnostics::{Component, Diagnostic, ErrorSink};
use crate::protocol::StackFrame;
use crate::source::SourceCache;
use crate::transport::DapTransport;
use crate::variables::{self, LocalValue};

/// A caller-supplied sequence of stepping and assertion operations, executed
/// against a single resolved lane through the controller interface.
#[async_trait]
pub trait ThreadScript: Send + Sync {
    async fn run(&self, thread: &mut LaneController);
}

/// One expected frame in a callstack assertion. `file` and `line` are only
/// compared when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFrame {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<i64>,
}

impl ExpectedFrame {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(name: impl Into<String>, file: impl Into<String>, line: i64) -> Self {
        Self {
            name: name.into(),
            file: Some(file.into()),
            line: Some(line),
        }
    }
}

/// Controller for a single debugger thread of execution, bound to one SIMD
/// lane. All operations report failures into the runner's diagnostics and
/// return normally so the script keeps running.
pub struct LaneController {
    thread_id: i64,
    lane: usize,
    client: SessionClient,
}

impl LaneController {
    pub(crate) fn new(thread_id: i64, lane: usize, client: SessionClient) -> Self {
        Self {
            thread_id,
            lane,
            client,
        }
    }

    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub async fn step_over(&mut self) {
        self.client.next(self.thread_id).await;
    }

    pub async fn step_in(&mut self) {
        self.client.step_in(self.thread_id).await;
    }

    pub async fn step_out(&mut self) {
        self.client.step_out(self.thread_id).await;
    }

    pub async fn continue_thread(&mut self) {
        self.client.continue_thread(self.thread_id).await;
    }

    /// Asserts the top frame's resolved file and line, and optionally the
    /// literal source line text.
    pub async fn expect_location(&mut self, file: &str, line: i64, source_text: Option<&str>) {
        debug!(file, line, "expect_location");
        let Some(frame) = self.client.top_stack_frame(self.thread_id).await else {
            return;
        };
        let Some((got, got_text)) = self.client.frame_location(&frame, true).await else {
            return;
        };
        let got_text = got_text.unwrap_or_default();

        if got.file != file {
            self.on_error(format!(
                "Expected file to be '{}' but file was {}",
                file, got.file
            ));
        } else if got.line != line {
            let mut msg = format!("Expected line {line}");
            if let Some(text) = source_text.filter(|t| !t.is_empty()) {
                msg.push_str(&format!(" `{text}`"));
            }
            msg.push_str(&format!(" but line was {} `{}`", got.line, got_text));
            self.on_error(msg);
        } else if let Some(text) = source_text.filter(|t| !t.is_empty()) {
            if got_text != text {
                self.on_error(format!(
                    "Expected source line to be:\n  {text}\nbut line was:\n  {got_text}"
                ));
            }
        }
    }

    /// Asserts the full call stack frame-by-frame, reporting every divergent
    /// frame plus any surplus or missing frame count, and printing the whole
    /// observed stack on any mismatch.
    pub async fn expect_callstack(&mut self, expected: &[ExpectedFrame]) {
        debug!("expect_callstack");
        let Some(got) = self.client.callstack(self.thread_id).await else {
            return;
        };
        let report = compare_callstack(expected, &got);
        if !report.is_empty() {
            self.on_error(report);
        }
    }

    pub async fn expect_local_i64(&mut self, name: &str, expected: i64) {
        debug!(name, expected, "expect_local");
        self.expect_local(name, expected).await;
    }

    pub async fn expect_local_f64(&mut self, name: &str, expected: f64) {
        debug!(name, expected, "expect_local");
        self.expect_local(name, expected).await;
    }

    pub async fn expect_local_str(&mut self, name: &str, expected: &str) {
        debug!(name, expected, "expect_local");
        self.expect_local(name, expected.to_string()).await;
    }

    /// Resolves the bound lane's locals, walks the dotted path and compares
    /// the parsed leaf against the expected value. A type-parse failure and a
    /// value mismatch are reported distinctly.
    async fn expect_local<T: LocalValue>(&mut self, name: &str, expected: T) {
        let Some(frame) = self.client.top_stack_frame(self.thread_id).await else {
            return;
        };
        let Some(locals) = self.client.locals(&frame).await else {
            return;
        };
        let Some(lane) = self.client.lane(&locals, self.lane) else {
            self.on_error(format!(
                "Lane {} not found\nLanes: {}.",
                self.lane,
                variables::all_names(&locals)
            ));
            return;
        };

        let var = match variables::resolve_path(lane, name) {
            Ok(var) => var,
            Err(err) if err.resolved.is_empty() => {
                self.on_error(format!(
                    "Local '{}' not found\nAll Locals: {}.\nLanes: {}.",
                    name,
                    variables::all_names(lane),
                    variables::all_names(&locals)
                ));
                return;
            }
            Err(err) => {
                self.on_error(format!(
                    "Local '{}' does not contain '{}'\nChildren: {}",
                    err.resolved, err.segment, err.siblings
                ));
                return;
            }
        };

        match T::extract(var) {
            None => self.on_error(format!("Local '{name}' was not of expected type")),
            Some(got) if got != expected => self.on_error(format!(
                "Local '{name}' did not have expected value. Value is '{got}', expected '{expected}'"
            )),
            Some(_) => {}
        }
    }

    fn on_error(&self, message: String) {
        self.client.errors().error(message);
    }
}

fn frame_string(frame: &StackFrame) -> String {
    let mut out = frame.name.clone();
    if let Some(name) = frame.source.as_ref().and_then(|s| s.name.as_deref()) {
        out.push_str(&format!(" {}:{}", name, frame.line));
    }
    out
}

fn expected_frame_string(frame: &ExpectedFrame) -> String {
    let mut out = frame.name.clone();
    if let Some(file) = frame.file.as_deref().filter(|f| !f.is_empty()) {
        out.push(' ');
        out.push_str(file);
        if let Some(line) = frame.line.filter(|l| *l != 0) {
            out.push_str(&format!(":{line}"));
        }
    }
    out
}

/// Compares an observed callstack against the expectation. Returns the empty
/// string when they agree.
fn compare_callstack(expected: &[ExpectedFrame], got: &[StackFrame]) -> String {
    let mut out = String::new();

    let count = expected.len().min(got.len());
    for i in 0..count {
        let got_frame = &got[i];
        let want_frame = &expected[i];
        let mut ok = got_frame.name == want_frame.name;
        if ok {
            if let Some(file) = want_frame.file.as_deref().filter(|f| !f.is_empty()) {
                ok = got_frame
                    .source
                    .as_ref()
                    .and_then(|s| s.name.as_deref())
                    == Some(file);
            }
        }
        if ok {
            if let Some(line) = want_frame.line.filter(|l| *l != 0) {
                ok = got_frame.line == line;
            }
        }
        if !ok {
            out.push_str(&format!(
                "Unexpected stackframe at frame {}\nGot:      {}\nExpected: {}\n",
                i,
                frame_string(got_frame),
                expected_frame_string(want_frame)
            ));
        }
    }

    if got.len() > expected.len() {
        out.push_str(&format!(
            "Callstack has an additional {} unexpected frames\n",
            got.len() - expected.len()
        ));
    } else if expected.len() > got.len() {
        out.push_str(&format!(
            "Callstack is missing {} frames\n",
            expected.len() - got.len()
        ));
    }

    if !out.is_empty() {
        out.push_str("Full callstack:\n");
        for frame in got {
            out.push_str(&format!("  {}\n", frame_string(frame)));
        }
    }

    out
}

/// A script executing in the background against one resolved lane.
///
/// Construction starts execution immediately; `join` waits for completion
/// bounded by the flush ceiling. A timed-out task is reported but not
/// cancelled, so it may keep running after flush returns.
pub struct ThreadRunner {
    thread_id: i64,
    lane: usize,
    errors: ErrorSink,
    handle: JoinHandle<()>,
}

impl ThreadRunner {
    pub fn spawn(
        transport: Arc<dyn DapTransport>,
        source_cache: Arc<SourceCache>,
        thread_id: i64,
        lane: usize,
        script: Arc<dyn ThreadScript>,
    ) -> Self {
        let errors = ErrorSink::new(Component::Runner);
        let client = SessionClient::new(transport, source_cache, errors.clone());
        let mut controller = LaneController::new(thread_id, lane, client);
        let handle = tokio::spawn(async move {
            debug!(
                thread_id = controller.thread_id(),
                lane = controller.lane(),
                "thread script started"
            );
            script.run(&mut controller).await;
            debug!(thread_id = controller.thread_id(), "thread script finished");
        });
        Self {
            thread_id,
            lane,
            errors,
            handle,
        }
    }

    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Waits for the script to complete and drains its diagnostics. On
    /// timeout a diagnostic is recorded and the task is left running.
    pub async fn join(mut self, limit: Duration) -> Vec<Diagnostic> {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self
                .errors
                .error(format!("Thread script panicked: {err}")),
            Err(_) => self.errors.error("Timed out performing actions"),
        }
        self.errors.take()
    }
}
