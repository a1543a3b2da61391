//! Lifecycle engine configuration

use crate::admission::{AdmissionMode, JoinFilter};
use crate::error::{CoplayError, Result};
use coplay_transport::PortRange;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Lowest forwarder tick rate accepted
pub const MIN_TICK_HZ: u32 = 10;

/// Highest forwarder tick rate accepted
pub const MAX_TICK_HZ: u32 = 1000;

/// Upper bound on messages drained per direction per tick
pub const MAX_PACKETS_PER_TICK: usize = 256;

/// Engine configuration
///
/// Durations are stored in milliseconds so the struct reads naturally in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoplayConfig {
    /// Local UDP ports available to tunnels (inclusive)
    pub port_range: PortRange,

    /// Interface tunnel sockets bind to
    pub bind_addr: IpAddr,

    /// Forwarder loop frequency, clamped to [`MIN_TICK_HZ`, `MAX_TICK_HZ`]
    pub tick_hz: u32,

    /// Messages drained per direction per forwarder tick
    pub max_packets_per_tick: usize,

    /// Forwarder inactivity timeout
    pub idle_timeout_ms: u64,

    /// Time a pending connection or an unconfirmed client has to finish the handshake
    pub handshake_timeout_ms: u64,

    /// Upper bound on waiting for forwarder threads during teardown
    pub join_timeout_ms: u64,

    /// Port the local game client listens on
    pub client_port: u16,

    /// Game server port used when the local session reports none
    pub default_server_port: u16,

    /// Initial join filter while hosting
    pub join_filter: JoinFilter,

    /// Passcode or lobby based admission
    pub admission: AdmissionMode,

    /// Start hosting when a loopback session starts
    pub auto_open: bool,

    /// Rich presence and lobby metadata refresh interval
    pub presence_interval_ms: u64,
}

impl Default for CoplayConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tick_hz: 300,
            max_packets_per_tick: 8,
            idle_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
            join_timeout_ms: 2_000,
            client_port: 27005,
            default_server_port: 27015,
            join_filter: JoinFilter::Off,
            admission: AdmissionMode::Passcode,
            auto_open: true,
            presence_interval_ms: 1_000,
        }
    }
}

impl CoplayConfig {
    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    /// Returns `CoplayError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.port_range
            .validate()
            .map_err(|e| CoplayError::InvalidConfig(e.to_string().into()))?;

        if self.max_packets_per_tick == 0 || self.max_packets_per_tick > MAX_PACKETS_PER_TICK {
            return Err(CoplayError::InvalidConfig(
                format!(
                    "max_packets_per_tick must be between 1 and {MAX_PACKETS_PER_TICK}, got {}",
                    self.max_packets_per_tick
                )
                .into(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(CoplayError::invalid_config("idle_timeout_ms must be positive"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(CoplayError::invalid_config(
                "handshake_timeout_ms must be positive",
            ));
        }
        if self.client_port == 0 {
            return Err(CoplayError::invalid_config("client_port must not be 0"));
        }
        if self.default_server_port == 0 {
            return Err(CoplayError::invalid_config(
                "default_server_port must not be 0",
            ));
        }
        Ok(())
    }

    /// Tick rate after clamping.
    #[must_use]
    pub fn effective_tick_hz(&self) -> u32 {
        self.tick_hz.clamp(MIN_TICK_HZ, MAX_TICK_HZ)
    }

    /// Sleep between forwarder ticks.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.effective_tick_hz()))
    }

    /// Forwarder inactivity timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Handshake timeout for pending connections and unconfirmed clients.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Bound on joining forwarder threads.
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Presence refresh interval.
    #[must_use]
    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoplayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port_range, PortRange { start: 3600, end: 3700 });
        assert_eq!(config.max_packets_per_tick, 8);
        assert_eq!(config.join_timeout(), Duration::from_secs(2));
        assert_eq!(config.default_server_port, 27015);
        assert_eq!(config.client_port, 27005);
        assert!(config.bind_addr.is_loopback());
    }

    #[test]
    fn test_tick_interval_clamped() {
        let mut config = CoplayConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_micros(3333));

        config.tick_hz = 5;
        assert_eq!(config.effective_tick_hz(), MIN_TICK_HZ);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));

        config.tick_hz = 50_000;
        assert_eq!(config.effective_tick_hz(), MAX_TICK_HZ);
        assert_eq!(config.tick_interval(), Duration::from_millis(1));

        config.tick_hz = 0;
        assert_eq!(config.effective_tick_hz(), MIN_TICK_HZ);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CoplayConfig::default();
        config.port_range = PortRange { start: 4000, end: 3999 };
        assert!(matches!(config.validate(), Err(CoplayError::InvalidConfig(_))));

        let mut config = CoplayConfig::default();
        config.max_packets_per_tick = 0;
        assert!(config.validate().is_err());
        config.max_packets_per_tick = MAX_PACKETS_PER_TICK + 1;
        assert!(config.validate().is_err());

        let mut config = CoplayConfig::default();
        config.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = CoplayConfig::default();
        config.client_port = 0;
        assert!(config.validate().is_err());
    }
}
