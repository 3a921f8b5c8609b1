//! Invocation identity and the pending/running registry.

use std::fmt;
use std::sync::Arc;

use crate::error::{DebuggerError, Result};
use crate::runner::{ThreadRunner, ThreadScript};
use crate::variables::{self, GlobalInvocationId, VariableNode, WindowSpacePosition};

/// Local variable the debugger exposes per lane for compute invocations.
pub const GLOBAL_INVOCATION_ID: &str = "globalInvocationId";
/// Local variable the debugger exposes per lane for vertex invocations.
pub const VERTEX_INDEX: &str = "vertexIndex";
/// Local variable the debugger exposes per lane for fragment invocations.
pub const WINDOW_SPACE_POSITION: &str = "windowSpacePosition";

/// Identifies a single shader invocation: one compute work-item, one vertex,
/// or one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationKey {
    ComputeGlobalId(GlobalInvocationId),
    VertexIndex(u32),
    FragmentWindowPos(WindowSpacePosition),
}

impl InvocationKey {
    /// Name of the per-lane local probed when matching this key.
    pub fn variable_name(&self) -> &'static str {
        match self {
            InvocationKey::ComputeGlobalId(_) => GLOBAL_INVOCATION_ID,
            InvocationKey::VertexIndex(_) => VERTEX_INDEX,
            InvocationKey::FragmentWindowPos(_) => WINDOW_SPACE_POSITION,
        }
    }

    /// Structural comparison of this key against one lane's locals. The lane
    /// matches only when the probe variable is present and its typed
    /// extraction equals the key exactly.
    pub fn matches(&self, lane: &[VariableNode]) -> bool {
        let Some(var) = variables::find(lane, self.variable_name()) else {
            return false;
        };
        match self {
            InvocationKey::ComputeGlobalId(id) => GlobalInvocationId::extract(var) == Some(*id),
            InvocationKey::VertexIndex(index) => var.parse::<u32>() == Some(*index),
            InvocationKey::FragmentWindowPos(pos) => WindowSpacePosition::extract(var) == Some(*pos),
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationKey::ComputeGlobalId(id) => {
                write!(f, "GlobalInvocation({}, {}, {})", id.x, id.y, id.z)
            }
            InvocationKey::VertexIndex(index) => write!(f, "VertexIndex({index})"),
            InvocationKey::FragmentWindowPos(pos) => {
                write!(f, "WindowSpacePosition({}, {})", pos.x, pos.y)
            }
        }
    }
}

/// Pending breakpoint requests and live runners, kept under one lock.
///
/// Pending entries preserve registration order; dispatch probes them in that
/// order and removes at most one per stop event. Runners leave the set only
/// at flush.
#[derive(Default)]
pub struct Registry {
    pending: Vec<(InvocationKey, Arc<dyn ThreadScript>)>,
    running: Vec<ThreadRunner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script for an invocation. A key may be registered at most
    /// once; a second registration with an equal key is rejected.
    pub fn insert(&mut self, key: InvocationKey, script: Arc<dyn ThreadScript>) -> Result<()> {
        if self.pending.iter().any(|(k, _)| *k == key) {
            return Err(DebuggerError::DuplicateKey(key.to_string()));
        }
        self.pending.push((key, script));
        Ok(())
    }

    /// Snapshot of pending entries in registration order.
    pub fn pending_snapshot(&self) -> Vec<(InvocationKey, Arc<dyn ThreadScript>)> {
        self.pending
            .iter()
            .map(|(k, s)| (*k, s.clone()))
            .collect()
    }

    /// Removes and returns the script for a key, if still pending.
    pub fn remove(&mut self, key: &InvocationKey) -> Option<Arc<dyn ThreadScript>> {
        let index = self.pending.iter().position(|(k, _)| k == key)?;
        Some(self.pending.remove(index).1)
    }

    pub fn push_running(&mut self, runner: ThreadRunner) {
        self.running.push(runner);
    }

    pub fn pending_keys(&self) -> Vec<InvocationKey> {
        self.pending.iter().map(|(k, _)| *k).collect()
    }

    pub fn take_running(&mut self) -> Vec<ThreadRunner> {
        std::mem::take(&mut self.running)
    }
}
