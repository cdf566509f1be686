use std::time::Duration;

use anyhow::bail;


#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of ICE restarts without reaching 'connected' in between, after which the session
    ///  gives up and closes
    pub ice_restart_max_count: u32,
    /// Minimum time between two ICE restarts. Failures inside this window are coalesced into a
    ///  single restart at its end.
    pub ice_restart_debounce: Duration,
    /// Capacity of the broadcast channel for session events. Slow subscribers lose the oldest
    ///  events.
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            ice_restart_max_count: 2,
            ice_restart_debounce: Duration::from_secs(5),
            event_capacity: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new()
    }
}
