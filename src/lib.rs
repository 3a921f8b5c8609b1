//! Invocation-level debugging of GPU shaders over the Debug Adapter
//! Protocol.
//!
//! The engine connects to a shader debug adapter, arms function breakpoints
//! on the compute, vertex and fragment entry points, and routes each halted
//! thread to the caller-registered script for the shader invocation that
//! thread is executing. A thread runs many invocations in SIMD lockstep, so
//! matching resolves the specific lane before the script starts. Scripts
//! step the lane and assert on source locations, call stacks and local
//! variables; failures accumulate and are reported together by
//! [`Debugger::flush`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use shaderdbg::{Debugger, DebuggerConfig, LaneController, ThreadScript};
//!
//! struct CheckFirstVertex;
//!
//! #[async_trait]
//! impl ThreadScript for CheckFirstVertex {
//!     async fn run(&self, thread: &mut LaneController) {
//!         thread.expect_local_i64("vertexIndex", 0).await;
//!         thread.step_over().await;
//!         thread.continue_thread().await;
//!     }
//! }
//!
//! # async fn demo() -> shaderdbg::Result<()> {
//! let debugger = Debugger::connect(DebuggerConfig::default()).await?;
//! debugger.break_on_vertex_index(0, Arc::new(CheckFirstVertex))?;
//! // ... run the draw ...
//! let report = debugger.flush().await;
//! assert!(report.is_empty(), "{report}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod invocation;
pub mod protocol;
pub mod runner;
pub mod source;
pub mod transport;
pub mod variables;

pub use client::{SessionClient, SourceLocation};
pub use config::DebuggerConfig;
pub use diagnostics::{Component, Diagnostic, ErrorSink, Severity};
pub use dispatcher::{Debugger, DispatcherState};
pub use error::{DebuggerError, Result};
pub use invocation::InvocationKey;
pub use runner::{ExpectedFrame, LaneController, ThreadScript};
pub use transport::{DapTransport, TcpTransport};
pub use variables::{GlobalInvocationId, VariableNode, WindowSpacePosition};
