use std::time::Duration;

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum outbound payload size per `MESSAGE` envelope. Streams
    /// that try to exceed it are aborted with `INTERNAL`.
    pub max_payload_size: u32,
    /// Per-stream inbound queue depth. The engine suspends routing into
    /// a full queue, so slow consumers backpressure the transport.
    pub stream_buffer: usize,
    /// Deadline applied to calls whose method declares no timeout.
    pub default_timeout: Option<Duration>,
    /// Endpoint name used in logs and diagnostics.
    pub name: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024, // 1 MiB
            stream_buffer: 64,
            default_timeout: None,
            name: None,
        }
    }
}
