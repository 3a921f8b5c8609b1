//! A convenience façade over the debug session.
//!
//! Every operation either returns a typed result or reports a descriptive
//! failure into the caller-supplied error sink and returns None; protocol
//! errors never abort the caller's control flow.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::diagnostics::ErrorSink;
use crate::protocol::{
    ContinueArguments, NextArguments, ScopesArguments, ScopesResponseBody, Source,
    SourceArguments, SourceResponseBody, StackFrame, StackTraceArguments, StackTraceResponseBody,
    StepInArguments, StepOutArguments, VariablesArguments, VariablesResponseBody,
};
use crate::source::{self, SourceCache, SourceLines};
use crate::transport::DapTransport;
use crate::variables::{self, VariableNode};

/// Presentation hint marking the scope that holds a frame's locals.
const LOCALS_HINT: &str = "locals";

/// A resolved source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: i64,
}

pub struct SessionClient {
    transport: Arc<dyn DapTransport>,
    source_cache: Arc<SourceCache>,
    errors: ErrorSink,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn DapTransport>,
        source_cache: Arc<SourceCache>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            transport,
            source_cache,
            errors,
        }
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    /// Generic round trip. A protocol-level error short-circuits to the sink.
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Option<Value> {
        match self.transport.request(command, arguments).await {
            Ok(body) => Some(body),
            Err(err) => {
                self.errors.error(err.to_string());
                None
            }
        }
    }

    async fn request<A: Serialize, T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: &A,
    ) -> Option<T> {
        let args = match serde_json::to_value(arguments) {
            Ok(value) => value,
            Err(err) => {
                self.errors
                    .error(format!("Failed to encode {command} arguments: {err}"));
                return None;
            }
        };
        let body = self.send(command, Some(args)).await?;
        match serde_json::from_value(body) {
            Ok(typed) => Some(typed),
            Err(err) => {
                self.errors
                    .error(format!("Malformed {command} response: {err}"));
                None
            }
        }
    }

    /// The frame at the top of the thread's call stack.
    pub async fn top_stack_frame(&self, thread_id: i64) -> Option<StackFrame> {
        self.callstack(thread_id)
            .await
            .map(|mut stack| stack.remove(0))
    }

    /// The thread's full call stack, top frame first.
    pub async fn callstack(&self, thread_id: i64) -> Option<Vec<StackFrame>> {
        let body: StackTraceResponseBody = self
            .request(
                "stackTrace",
                &StackTraceArguments {
                    thread_id,
                    start_frame: None,
                    levels: None,
                },
            )
            .await?;
        if body.stack_frames.is_empty() {
            self.errors.error("Stack frame is empty");
            return None;
        }
        Some(body.stack_frames)
    }

    /// Resolves a frame's source location, and optionally the literal text of
    /// that line via the source cache.
    pub async fn frame_location(
        &self,
        frame: &StackFrame,
        want_line: bool,
    ) -> Option<(SourceLocation, Option<String>)> {
        let Some(frame_source) = frame.source.as_ref() else {
            self.errors.error(format!(
                "Stack frame with name '{}' has no source",
                frame.name
            ));
            return None;
        };

        let file = match (&frame_source.path, &frame_source.name) {
            (Some(path), _) if !path.is_empty() => path.clone(),
            (_, Some(name)) if !name.is_empty() => name.clone(),
            _ => {
                self.errors.error("Frame source had no path or name");
                return None;
            }
        };

        if frame.line < 1 {
            self.errors
                .error(format!("Line location is {}", frame.line));
            return None;
        }

        let mut text = None;
        if want_line {
            let lines = self.source_content(frame_source).await?;
            if frame.line as usize > lines.len() {
                self.errors.error(format!(
                    "Line {} is greater than the number of lines in the source file ({})",
                    frame.line,
                    lines.len()
                ));
                return None;
            }
            text = Some(lines[frame.line as usize - 1].clone());
        }

        Some((
            SourceLocation {
                file,
                line: frame.line,
            },
            text,
        ))
    }

    /// Source lines for the given source descriptor. Path lookups consult the
    /// cache and fall back to a local file read; reference lookups consult
    /// the cache and fall back to a protocol request.
    pub async fn source_content(&self, descriptor: &Source) -> Option<SourceLines> {
        if let Some(path) = descriptor.path.as_deref().filter(|p| !p.is_empty()) {
            if let Some(lines) = self.source_cache.get_path(path) {
                return Some(lines);
            }
            return match tokio::fs::read_to_string(path).await {
                Ok(content) => Some(
                    self.source_cache
                        .insert_path(path, source::split_lines(&content)),
                ),
                Err(_) => {
                    self.errors
                        .error(format!("Could not open source file '{path}'"));
                    None
                }
            };
        }

        if let Some(reference) = descriptor.source_reference.filter(|r| *r > 0) {
            if let Some(lines) = self.source_cache.get_ref(reference) {
                return Some(lines);
            }
            let body: SourceResponseBody = self
                .request(
                    "source",
                    &SourceArguments {
                        source: Some(descriptor.clone()),
                        source_reference: reference,
                    },
                )
                .await?;
            return Some(
                self.source_cache
                    .insert_ref(reference, source::split_lines(&body.content)),
            );
        }

        self.errors.error("Could not get source content");
        None
    }

    /// Fetches the fully expanded variable tree for a reference. Children
    /// carrying a non-zero nested reference are expanded eagerly; cycle-free
    /// references are an invariant of the debuggee.
    pub async fn variables(&self, reference: i64) -> Option<Vec<VariableNode>> {
        self.variables_inner(reference).await
    }

    fn variables_inner(
        &self,
        reference: i64,
    ) -> Pin<Box<dyn Future<Output = Option<Vec<VariableNode>>> + Send + '_>> {
        Box::pin(async move {
            let body: VariablesResponseBody = self
                .request(
                    "variables",
                    &VariablesArguments {
                        variables_reference: reference,
                        start: None,
                        count: None,
                    },
                )
                .await?;
            let mut out = Vec::with_capacity(body.variables.len());
            for var in body.variables {
                let children = if var.variables_reference > 0 {
                    self.variables_inner(var.variables_reference).await?
                } else {
                    Vec::new()
                };
                out.push(VariableNode {
                    name: var.name,
                    value: var.value,
                    children,
                });
            }
            Some(out)
        })
    }

    /// The fully expanded locals for a stack frame, found via the scope
    /// flagged with the `locals` presentation hint.
    pub async fn locals(&self, frame: &StackFrame) -> Option<Vec<VariableNode>> {
        let body: ScopesResponseBody = self
            .request("scopes", &ScopesArguments { frame_id: frame.id })
            .await?;
        for scope in body.scopes {
            if scope.presentation_hint.as_deref() == Some(LOCALS_HINT) {
                return self.variables(scope.variables_reference).await;
            }
        }
        self.errors.error("Locals scope not found");
        None
    }

    /// The locals of the SIMD lane with the given index, or None when the
    /// thread has no such lane.
    pub fn lane<'a>(&self, locals: &'a [VariableNode], index: usize) -> Option<&'a [VariableNode]> {
        variables::lane(locals, index)
    }

    pub async fn continue_thread(&self, thread_id: i64) {
        debug!(thread_id, "continue");
        let _: Option<Value> = self
            .request(
                "continue",
                &ContinueArguments {
                    thread_id,
                    single_thread: None,
                },
            )
            .await;
    }

    pub async fn next(&self, thread_id: i64) {
        debug!(thread_id, "step over");
        let _: Option<Value> = self
            .request(
                "next",
                &NextArguments {
                    thread_id,
                    granularity: None,
                },
            )
            .await;
    }

    pub async fn step_in(&self, thread_id: i64) {
        debug!(thread_id, "step in");
        let _: Option<Value> = self
            .request(
                "stepIn",
                &StepInArguments {
                    thread_id,
                    target_id: None,
                    granularity: None,
                },
            )
            .await;
    }

    pub async fn step_out(&self, thread_id: i64) {
        debug!(thread_id, "step out");
        let _: Option<Value> = self
            .request(
                "stepOut",
                &StepOutArguments {
                    thread_id,
                    granularity: None,
                },
            )
            .await;
    }
}
