//! Breakpoint dispatch and session lifecycle.
//!
//! The dispatcher arms function breakpoints on the three shader entry
//! points, listens for stopped events, matches halted threads against the
//! pending invocation registry and spawns a script runner per match. Threads
//! that match nothing are resumed immediately so the device keeps making
//! forward progress.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::SessionClient;
use crate::config::DebuggerConfig;
use crate::diagnostics::{Component, Diagnostic, ErrorSink, Severity};
use crate::error::Result;
use crate::invocation::{InvocationKey, Registry};
use crate::protocol::{
    Event, FunctionBreakpoint, InitializeRequestArguments, SetFunctionBreakpointsArguments,
    StoppedEventBody, STOP_REASON_FUNCTION_BREAKPOINT,
};
use crate::runner::{ThreadRunner, ThreadScript};
use crate::source::SourceCache;
use crate::transport::{DapTransport, TcpTransport};
use crate::variables::{self, GlobalInvocationId, VariableNode, WindowSpacePosition};

/// Shader entry point names the debugger sets function breakpoints on.
const COMPUTE_SHADER_ENTRY: &str = "ComputeShader";
const VERTEX_SHADER_ENTRY: &str = "VertexShader";
const FRAGMENT_SHADER_ENTRY: &str = "FragmentShader";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Initializing,
    Listening,
    Draining,
    Closed,
}

/// The invocation-level debugger bound to one debug session.
///
/// Invocation breakpoints can be registered before or during execution;
/// `flush` drains all work and returns the aggregated diagnostics. The
/// dispatcher does not support restart after closing.
pub struct Debugger {
    config: DebuggerConfig,
    transport: Arc<dyn DapTransport>,
    source_cache: Arc<SourceCache>,
    registry: Arc<Mutex<Registry>>,
    session_errors: ErrorSink,
    state: Mutex<DispatcherState>,
}

impl Debugger {
    /// Establishes the connection to the shader debugger and completes the
    /// initialize handshake. Must succeed before any breakpoint can fire.
    pub async fn connect(config: DebuggerConfig) -> Result<Self> {
        debug!(host = %config.host, port = config.port, "connecting to debug adapter");
        let (transport, events) = TcpTransport::connect(&config).await?;
        Self::attach(transport, events, config).await
    }

    /// Binds the dispatcher to an already-open session. Performs the
    /// initialize handshake, arms the shader entry breakpoints and starts
    /// listening for stop events.
    pub async fn attach(
        transport: Arc<dyn DapTransport>,
        events: mpsc::UnboundedReceiver<Event>,
        config: DebuggerConfig,
    ) -> Result<Self> {
        let debugger = Self {
            config,
            transport,
            source_cache: Arc::new(SourceCache::new()),
            registry: Arc::new(Mutex::new(Registry::new())),
            session_errors: ErrorSink::new(Component::Session),
            state: Mutex::new(DispatcherState::Initializing),
        };

        debugger.initialize().await?;
        *debugger.state.lock() = DispatcherState::Listening;

        tokio::spawn(event_loop(
            events,
            debugger.transport.clone(),
            debugger.source_cache.clone(),
            debugger.registry.clone(),
            debugger.session_errors.clone(),
        ));

        Ok(debugger)
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    /// Initialize handshake: initialize, arm the three shader entry
    /// breakpoints, configuration-done. Any protocol failure here is fatal;
    /// there is no retry past a successfully opened socket.
    ///
    /// Breakpoints are set on every shader stage even when no key targets
    /// it: each stop event probes the pending registry, and unmatched
    /// threads are resumed.
    async fn initialize(&self) -> Result<()> {
        self.transport
            .request(
                "initialize",
                Some(serde_json::to_value(InitializeRequestArguments {
                    adapter_id: "shaderdbg".to_string(),
                    client_name: None,
                    lines_start_at1: Some(true),
                    columns_start_at1: Some(true),
                })?),
            )
            .await?;

        let breakpoints = [
            COMPUTE_SHADER_ENTRY,
            VERTEX_SHADER_ENTRY,
            FRAGMENT_SHADER_ENTRY,
        ]
        .iter()
        .map(|name| FunctionBreakpoint {
            name: name.to_string(),
            condition: None,
        })
        .collect();
        self.transport
            .request(
                "setFunctionBreakpoints",
                Some(serde_json::to_value(SetFunctionBreakpointsArguments {
                    breakpoints,
                })?),
            )
            .await?;

        self.transport.request("configurationDone", None).await?;
        Ok(())
    }

    /// Runs a script when the compute invocation with the given global id
    /// reaches the compute shader entry point.
    pub fn break_on_compute_global_invocation(
        &self,
        x: u32,
        y: u32,
        z: u32,
        script: Arc<dyn ThreadScript>,
    ) -> Result<()> {
        self.register(
            InvocationKey::ComputeGlobalId(GlobalInvocationId { x, y, z }),
            script,
        )
    }

    /// Runs a script when the vertex invocation with the given index reaches
    /// the vertex shader entry point.
    pub fn break_on_vertex_index(&self, index: u32, script: Arc<dyn ThreadScript>) -> Result<()> {
        self.register(InvocationKey::VertexIndex(index), script)
    }

    /// Runs a script when the fragment invocation at the given window-space
    /// position reaches the fragment shader entry point.
    pub fn break_on_fragment_window_space_position(
        &self,
        x: u32,
        y: u32,
        script: Arc<dyn ThreadScript>,
    ) -> Result<()> {
        self.register(
            InvocationKey::FragmentWindowPos(WindowSpacePosition { x, y }),
            script,
        )
    }

    fn register(&self, key: InvocationKey, script: Arc<dyn ThreadScript>) -> Result<()> {
        debug!(%key, "registering invocation breakpoint");
        self.registry.lock().insert(key, script)
    }

    /// Drains all running scripts and returns the aggregated diagnostics:
    /// one line per never-matched key, then per-runner failures, then
    /// session-level errors. An empty string means success.
    pub async fn flush(&self) -> String {
        {
            let mut state = self.state.lock();
            if *state == DispatcherState::Closed {
                return String::new();
            }
            *state = DispatcherState::Draining;
        }

        let (pending, running) = {
            let mut registry = self.registry.lock();
            (registry.pending_keys(), registry.take_running())
        };

        let mut records: Vec<Diagnostic> = pending
            .iter()
            .map(|key| Diagnostic {
                severity: Severity::Warning,
                component: Component::Dispatcher,
                message: format!("Thread did not run: {key}"),
            })
            .collect();

        for runner in running {
            records.extend(runner.join(self.config.flush_timeout()).await);
        }

        records.extend(self.session_errors.take());

        *self.state.lock() = DispatcherState::Closed;

        records
            .iter()
            .map(|d| d.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Consumes session events sequentially. Only stopped events whose reason is
/// a function breakpoint belong to this engine; everything else is ignored.
async fn event_loop(
    mut events: mpsc::UnboundedReceiver<Event>,
    transport: Arc<dyn DapTransport>,
    source_cache: Arc<SourceCache>,
    registry: Arc<Mutex<Registry>>,
    session_errors: ErrorSink,
) {
    while let Some(event) = events.recv().await {
        if event.event != "stopped" {
            continue;
        }
        let body: StoppedEventBody = match event.body.map(serde_json::from_value).transpose() {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) => {
                warn!(%err, "malformed stopped event");
                continue;
            }
        };
        debug!(reason = %body.reason, "thread stopped");
        if body.reason != STOP_REASON_FUNCTION_BREAKPOINT {
            continue;
        }
        let thread_id = body.thread_id.unwrap_or(0);
        on_breakpoint_hit(
            thread_id,
            &transport,
            &source_cache,
            &registry,
            &session_errors,
        )
        .await;
    }
    debug!("event loop ended");
}

/// Reacts to one function-breakpoint stop. The pending registry is probed in
/// registration order; the first key that resolves to a lane of this thread
/// claims it and gets a runner. A thread that matches nothing is resumed so
/// the device is never left halted without action.
async fn on_breakpoint_hit(
    thread_id: i64,
    transport: &Arc<dyn DapTransport>,
    source_cache: &Arc<SourceCache>,
    registry: &Arc<Mutex<Registry>>,
    session_errors: &ErrorSink,
) {
    debug!(thread_id, "breakpoint hit");
    let client = SessionClient::new(
        transport.clone(),
        source_cache.clone(),
        session_errors.clone(),
    );

    let pending = registry.lock().pending_snapshot();
    if !pending.is_empty() {
        // Locals are fetched once per stop event and probed in-memory for
        // every key; debuggee state changes between stops, so nothing is
        // cached across events.
        if let Some(locals) = thread_locals(&client, thread_id).await {
            for (key, _) in &pending {
                let Some(lane) = find_lane(&locals, key) else {
                    continue;
                };
                debug!(thread_id, lane, %key, "invocation matched");
                let mut reg = registry.lock();
                let Some(script) = reg.remove(key) else {
                    continue;
                };
                let runner =
                    ThreadRunner::spawn(transport.clone(), source_cache.clone(), thread_id, lane, script);
                reg.push_running(runner);
                return;
            }
        }
    }

    // No pending tests for this thread. Let it carry on.
    debug!(thread_id, "no pending invocation matched, resuming");
    client.continue_thread(thread_id).await;
}

async fn thread_locals(client: &SessionClient, thread_id: i64) -> Option<Vec<VariableNode>> {
    let frame = client.top_stack_frame(thread_id).await?;
    client.locals(&frame).await
}

/// Probes SIMD lanes in order, stopping at the first absent `Lane {i}`
/// entry, and returns the first lane whose locals structurally match the key.
fn find_lane(locals: &[VariableNode], key: &InvocationKey) -> Option<usize> {
    let mut index = 0;
    while let Some(lane) = variables::lane(locals, index) {
        if key.matches(lane) {
            return Some(index);
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, value: &str) -> VariableNode {
        VariableNode {
            name: name.to_string(),
            value: value.to_string(),
            children: Vec::new(),
        }
    }

    fn lane_node(index: usize, children: Vec<VariableNode>) -> VariableNode {
        VariableNode {
            name: format!("Lane {index}"),
            value: String::new(),
            children,
        }
    }

    #[test]
    fn find_lane_returns_first_match() {
        let locals = vec![
            lane_node(0, vec![leaf("vertexIndex", "4")]),
            lane_node(1, vec![leaf("vertexIndex", "5")]),
            lane_node(2, vec![leaf("vertexIndex", "5")]),
        ];
        let key = InvocationKey::VertexIndex(5);
        assert_eq!(find_lane(&locals, &key), Some(1));
    }

    #[test]
    fn find_lane_stops_probing_at_first_gap() {
        // Lane 3 exists but lane 2 does not; probing must stop at the gap.
        let locals = vec![
            lane_node(0, vec![leaf("vertexIndex", "0")]),
            lane_node(1, vec![leaf("vertexIndex", "1")]),
            lane_node(3, vec![leaf("vertexIndex", "9")]),
        ];
        let key = InvocationKey::VertexIndex(9);
        assert_eq!(find_lane(&locals, &key), None);
    }
}
