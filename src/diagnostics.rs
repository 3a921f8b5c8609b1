use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Which part of the engine produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Session-level protocol traffic owned by the dispatcher.
    Session,
    /// Flush-time bookkeeping (unhit breakpoints).
    Dispatcher,
    /// A per-invocation script runner.
    Runner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One accumulated failure record. Records are kept structured and only
/// joined into text at the flush boundary, preserving insertion order.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub component: Component,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Shared accumulator for failures that must not abort execution.
///
/// Cloning yields a handle onto the same underlying record list, so a
/// session client and the controller it serves report into one stream.
#[derive(Clone)]
pub struct ErrorSink {
    component: Component,
    records: Arc<Mutex<Vec<Diagnostic>>>,
}

impl ErrorSink {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into());
    }

    fn push(&self, severity: Severity, message: String) {
        tracing::debug!(component = ?self.component, %message, "diagnostic recorded");
        self.records.lock().push(Diagnostic {
            severity,
            component: self.component,
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drains all accumulated records in insertion order.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.records.lock())
    }
}
