//! Configuration for the sync core.

use std::time::Duration;

/// Configuration for one synchronized resource.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Poll scheduler configuration.
    pub poll: PollConfig,
    /// Push channel configuration.
    pub channel: ChannelConfig,
    /// How long the channel stays open after the resource turns terminal,
    /// so an event already in flight is still delivered.
    pub terminal_drain: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            poll: PollConfig::default(),
            channel: ChannelConfig::default(),
            terminal_drain: Duration::from_secs(2),
        }
    }

    /// Sets the poll configuration.
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the channel configuration.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the terminal drain period.
    pub fn with_terminal_drain(mut self, drain: Duration) -> Self {
        self.terminal_drain = drain;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the poll scheduler.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Interval while the resource is active.
    pub active_interval: Duration,
    /// Interval once the resource is terminal.
    pub terminal_interval: Duration,
    /// Interval while the phase is unknown.
    pub unknown_interval: Duration,
    /// Hard ceiling on fetches per session. `None` means unbounded.
    pub max_attempts: Option<u64>,
    /// Attempt count after which a warning is logged once.
    pub warn_after_attempts: u64,
}

impl PollConfig {
    /// Creates a poll configuration with default settings.
    pub fn new() -> Self {
        Self {
            active_interval: Duration::from_millis(3_000),
            terminal_interval: Duration::from_millis(30_000),
            unknown_interval: Duration::from_millis(3_000),
            max_attempts: None,
            warn_after_attempts: 1_200,
        }
    }

    /// Sets the active interval.
    pub fn with_active_interval(mut self, interval: Duration) -> Self {
        self.active_interval = interval;
        self
    }

    /// Sets the terminal interval.
    pub fn with_terminal_interval(mut self, interval: Duration) -> Self {
        self.terminal_interval = interval;
        self
    }

    /// Sets the unknown-phase interval.
    pub fn with_unknown_interval(mut self, interval: Duration) -> Self {
        self.unknown_interval = interval;
        self
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, max: u64) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Sets the warning threshold.
    pub fn with_warn_after_attempts(mut self, attempts: u64) -> Self {
        self.warn_after_attempts = attempts;
        self
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Whether a push channel is opened at all.
    pub enabled: bool,
    /// Delay between a failure and the next subscribe attempt.
    pub reconnect_backoff: Duration,
}

impl ChannelConfig {
    /// Creates a channel configuration with default settings.
    pub fn new() -> Self {
        Self {
            enabled: true,
            reconnect_backoff: Duration::from_secs(2),
        }
    }

    /// Creates a configuration that never opens a channel.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// Every attempt after the first waits the same `reconnect_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.reconnect_backoff
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_run_tracking() {
        let config = SyncConfig::new();
        assert_eq!(config.poll.active_interval, Duration::from_secs(3));
        assert_eq!(config.poll.terminal_interval, Duration::from_secs(30));
        assert_eq!(config.poll.max_attempts, None);
        assert!(config.channel.enabled);
        assert_eq!(config.channel.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(config.terminal_drain, Duration::from_secs(2));
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_poll(
                PollConfig::new()
                    .with_active_interval(Duration::from_millis(500))
                    .with_max_attempts(10),
            )
            .with_channel(ChannelConfig::disabled())
            .with_terminal_drain(Duration::from_millis(250));

        assert_eq!(config.poll.active_interval, Duration::from_millis(500));
        assert_eq!(config.poll.max_attempts, Some(10));
        assert!(!config.channel.enabled);
        assert_eq!(config.terminal_drain, Duration::from_millis(250));
    }

    #[test]
    fn reconnect_delay_is_fixed() {
        let config = ChannelConfig::new().with_reconnect_backoff(Duration::from_millis(1500));

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(config.delay_for_attempt(50), Duration::from_millis(1500));
    }
}
