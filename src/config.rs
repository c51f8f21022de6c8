use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::ant;

/// Hardware channel total on common USB sticks; one is always reserved for
/// the wildcard scanner.
pub const DEFAULT_HARDWARE_CHANNELS: usize = 8;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub radio: RadioConfig,
    pub manager: ManagerConfig,
    pub sim: SimConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// RF frequency offset from 2400 MHz.
    pub rf_freq: u8,
    /// Channel period in 1/32768 s units.
    pub period: u16,
    /// ANT+ device type to search for.
    pub device_type: u8,
    pub network_number: u8,
    /// Network key as a hex string.
    pub network_key: String,
    /// Total hardware channels the radio offers.
    pub hardware_channels: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound on dedicated channels; clamped to one below the hardware
    /// total so the wildcard always has a slot.
    pub max_dedicated_channels: usize,
    /// Seconds of silence before a dedicated channel is released.
    pub inactivity_release_secs: f64,
    /// Minimum spacing between wildcard rearms.
    pub rearm_backoff_secs: f64,
    /// Window after a rearm during which already-dedicated devices heard on
    /// the wildcard are ignored.
    pub ignore_after_rearm_secs: f64,
    /// Consecutive same-set sightings before an idle latch is suspected.
    pub idle_latch_threshold: u32,
    /// No idle-latch rearm within this long of the last new-device sighting.
    pub idle_grace_secs: f64,
    /// Rolling cap on idle-latch rearms.
    pub max_idle_rearms_per_minute: usize,
    /// Per-device promotion debounce.
    pub promote_debounce_ms: u64,
    /// Reaper tick interval.
    pub reaper_interval_ms: u64,
    /// Depth of the observation event queue.
    pub event_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of virtual heart-rate monitors the simulated driver fabricates.
    pub devices: usize,
    pub update_hz: f64,
    pub base_hr: f64,
    pub amplitude: f64,
    pub noise: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Apply `ANT_HRM_*` environment overrides to every tuning knob.
    pub fn apply_env_overrides(&mut self) {
        env_override("ANT_HRM_RADIO_RF_FREQ", &mut self.radio.rf_freq);
        env_override("ANT_HRM_RADIO_PERIOD", &mut self.radio.period);
        env_override("ANT_HRM_RADIO_DEVICE_TYPE", &mut self.radio.device_type);
        env_override("ANT_HRM_RADIO_NETWORK_KEY", &mut self.radio.network_key);
        env_override(
            "ANT_HRM_RADIO_HARDWARE_CHANNELS",
            &mut self.radio.hardware_channels,
        );
        env_override(
            "ANT_HRM_MAX_DEDICATED_CHANNELS",
            &mut self.manager.max_dedicated_channels,
        );
        env_override(
            "ANT_HRM_INACTIVITY_RELEASE_SECS",
            &mut self.manager.inactivity_release_secs,
        );
        env_override(
            "ANT_HRM_REARM_BACKOFF_SECS",
            &mut self.manager.rearm_backoff_secs,
        );
        env_override(
            "ANT_HRM_IGNORE_AFTER_REARM_SECS",
            &mut self.manager.ignore_after_rearm_secs,
        );
        env_override(
            "ANT_HRM_IDLE_LATCH_THRESHOLD",
            &mut self.manager.idle_latch_threshold,
        );
        env_override("ANT_HRM_IDLE_GRACE_SECS", &mut self.manager.idle_grace_secs);
        env_override(
            "ANT_HRM_MAX_IDLE_REARMS_PER_MINUTE",
            &mut self.manager.max_idle_rearms_per_minute,
        );
        env_override(
            "ANT_HRM_PROMOTE_DEBOUNCE_MS",
            &mut self.manager.promote_debounce_ms,
        );
        env_override(
            "ANT_HRM_REAPER_INTERVAL_MS",
            &mut self.manager.reaper_interval_ms,
        );
        env_override("ANT_HRM_SIM_DEVICES", &mut self.sim.devices);
        env_override("ANT_HRM_LOG_LEVEL", &mut self.logging.level);
    }
}

impl RadioConfig {
    /// Decode the configured network key from hex.
    pub fn network_key_bytes(&self) -> anyhow::Result<[u8; 8]> {
        let bytes = hex::decode(&self.network_key)
            .map_err(|e| anyhow::anyhow!("Invalid network key hex: {}", e))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Network key must be 8 bytes, got {}", bytes.len()))
    }
}

impl ManagerConfig {
    /// Dedicated-channel cap after reserving one hardware slot for the
    /// wildcard scanner.
    pub fn effective_max_dedicated(&self, hardware_channels: usize) -> usize {
        self.max_dedicated_channels
            .min(hardware_channels.saturating_sub(1))
    }

    pub fn inactivity_release(&self) -> Duration {
        Duration::from_secs_f64(self.inactivity_release_secs)
    }

    pub fn rearm_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.rearm_backoff_secs)
    }

    pub fn ignore_after_rearm(&self) -> Duration {
        Duration::from_secs_f64(self.ignore_after_rearm_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs_f64(self.idle_grace_secs)
    }

    pub fn promote_debounce(&self) -> Duration {
        Duration::from_millis(self.promote_debounce_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T)
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(e) => eprintln!("Warning: ignoring {}={:?}: {}", key, raw, e),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            rf_freq: ant::RF_FREQ,
            period: ant::PERIOD,
            device_type: ant::DEVICE_TYPE_HRM,
            network_number: 0x00,
            network_key: hex::encode(ant::ANT_PLUS_NETWORK_KEY),
            hardware_channels: DEFAULT_HARDWARE_CHANNELS,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_dedicated_channels: 7,
            inactivity_release_secs: 20.0,
            rearm_backoff_secs: 1.2,
            ignore_after_rearm_secs: 0.9,
            idle_latch_threshold: 3,
            idle_grace_secs: 5.0,
            max_idle_rearms_per_minute: 6,
            promote_debounce_ms: 300,
            reaper_interval_ms: 500,
            event_queue_depth: 256,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: 4,
            update_hz: 4.0,
            base_hr: 118.0,
            amplitude: 22.0,
            noise: 3.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.radio.rf_freq, 57);
        assert_eq!(config.radio.period, 8070);
        assert_eq!(config.manager.max_dedicated_channels, 7);
        assert_eq!(config.manager.idle_latch_threshold, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            max_dedicated_channels = 3
            promote_debounce_ms = 150

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.max_dedicated_channels, 3);
        assert_eq!(config.manager.promote_debounce_ms, 150);
        // untouched keys keep their defaults
        assert_eq!(config.manager.inactivity_release_secs, 20.0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_network_key_decodes() {
        let config = RadioConfig::default();
        assert_eq!(
            config.network_key_bytes().unwrap(),
            ant::ANT_PLUS_NETWORK_KEY
        );

        let bad = RadioConfig {
            network_key: "abcd".to_string(),
            ..RadioConfig::default()
        };
        assert!(bad.network_key_bytes().is_err());
    }

    #[test]
    fn test_dedicated_cap_reserves_wildcard_slot() {
        let manager = ManagerConfig {
            max_dedicated_channels: 99,
            ..ManagerConfig::default()
        };
        assert_eq!(manager.effective_max_dedicated(8), 7);
        assert_eq!(manager.effective_max_dedicated(4), 3);

        let small = ManagerConfig {
            max_dedicated_channels: 2,
            ..ManagerConfig::default()
        };
        assert_eq!(small.effective_max_dedicated(8), 2);
    }

    #[test]
    fn test_env_override_parses_and_ignores_garbage() {
        let mut value = 7usize;
        std::env::set_var("ANT_HRM_TEST_OVERRIDE", "3");
        env_override("ANT_HRM_TEST_OVERRIDE", &mut value);
        assert_eq!(value, 3);

        std::env::set_var("ANT_HRM_TEST_OVERRIDE", "not-a-number");
        env_override("ANT_HRM_TEST_OVERRIDE", &mut value);
        assert_eq!(value, 3);
        std::env::remove_var("ANT_HRM_TEST_OVERRIDE");
    }
}
