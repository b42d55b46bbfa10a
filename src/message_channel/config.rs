use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageChannelConfig {
    /// 0 = bind a dynamic port.
    pub port: u16,
    pub max_queue_size: usize,
    pub message_timeout_ms: u64,
    pub enable_remote_fallback: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for MessageChannelConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_queue_size: 1000,
            message_timeout_ms: 5000,
            enable_remote_fallback: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}
