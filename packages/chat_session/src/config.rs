use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a typing indicator expires.
    #[serde(default = "default_typing_quiet_period_ms")]
    pub typing_quiet_period_ms: u64,
    /// Fixed delay before reconnecting after an unsolicited disconnect.
    /// Zero disables automatic reconnects.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Capacity of the `SessionUpdate` broadcast channel.
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_quiet_period_ms: default_typing_quiet_period_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            update_buffer: default_update_buffer(),
        }
    }
}

impl SessionConfig {
    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_period_ms)
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_delay_ms > 0).then(|| Duration::from_millis(self.reconnect_delay_ms))
    }
}

fn default_typing_quiet_period_ms() -> u64 {
    2000
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_update_buffer() -> usize {
    256
}
