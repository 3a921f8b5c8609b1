use std::time::Duration;

use serde::Deserialize;

/// Settings for a debugging run.
///
/// The defaults match the well-known shader debugger endpoint: the debuggee
/// opens a DAP socket on localhost:19020 shortly after launch, so connection
/// attempts are retried with a fixed delay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebuggerConfig {
    /// Host the debug adapter listens on.
    pub host: String,

    /// Port the debug adapter listens on.
    pub port: u16,

    /// Number of connection attempts before giving up.
    pub connect_attempts: u32,

    /// Delay between connection attempts, in milliseconds.
    pub connect_retry_delay_ms: u64,

    /// Per-runner join ceiling during flush, in seconds.
    pub flush_timeout_secs: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 19020,
            connect_attempts: 10,
            connect_retry_delay_ms: 1000,
            flush_timeout_secs: 60,
        }
    }
}

impl DebuggerConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}
