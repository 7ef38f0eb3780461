use std::time::Duration;

pub const DEFAULT_SHIM_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROCESS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLIENT_QUEUE_DEPTH: usize = 256;

/// Tunables shared by every VM created by one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a relocated command waits for its shim to connect.
    pub shim_wait_timeout: Duration,
    /// How long stdin forwarding and signals wait for the process to start.
    pub process_wait_timeout: Duration,
    /// Depth of each client's outbound frame queue.
    pub client_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shim_wait_timeout: DEFAULT_SHIM_WAIT_TIMEOUT,
            process_wait_timeout: DEFAULT_PROCESS_WAIT_TIMEOUT,
            client_queue_depth: DEFAULT_CLIENT_QUEUE_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn with_timeouts(shim: Duration, process: Duration) -> Self {
        Self {
            shim_wait_timeout: shim,
            process_wait_timeout: process,
            ..Self::default()
        }
    }
}
