//! skyconf - configuration for Skywatch daemons
//!
//! Layered TOML files (system, user, local, CLI override) with environment
//! variable overlay. The loaded `SkyConfig` is handed to the daemons as
//! plain values; nothing in the core reads config files itself.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod loader;

pub use loader::{apply_env_overrides, discover_config_files, load, load_from_file, ConfigSources};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Network binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// TCP port the arbiter listens on.
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self { port: 5557 }
    }
}

/// Peer liveness timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Idle timeout in seconds; probes go out at a quarter of this, a peer
    /// silent for twice this is dead.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { idle_secs: 60 }
    }
}

/// Observatory location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Degrees east of Greenwich.
    pub longitude: f64,
    /// Degrees north.
    pub latitude: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        // Greenwich, so a misconfigured site is obvious in the logs.
        Self { longitude: 0.0, latitude: 51.48 }
    }
}

/// Solar-altitude thresholds driving the day/night cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonConfig {
    /// Sun altitude (degrees) above which it is plain day.
    pub day_deg: f64,
    /// Sun altitude (degrees) below which it is astronomical night.
    pub night_deg: f64,
    /// Lead time (seconds) before dusk for camera cool-down.
    pub evening_secs: i64,
    /// Lead time (seconds) after dawn for camera warm-up.
    pub morning_secs: i64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self { day_deg: 0.0, night_deg: -10.0, evening_secs: 7200, morning_secs: 1800 }
    }
}

/// Arbiter behavior toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Force the system OFF at the Morning→Day edge.
    pub morning_off: bool,
    /// Otherwise force STANDBY at the Morning→Day edge.
    pub morning_standby: bool,
    /// Come up running instead of OFF after a daemon restart.
    pub reboot_on: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self { morning_off: true, morning_standby: true, reboot_on: false }
    }
}

/// Log filter directive for the tracing subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

/// Everything a Skywatch daemon needs at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkyConfig {
    pub bind: BindConfig,
    pub timeouts: TimeoutConfig,
    pub site: SiteConfig,
    pub horizons: HorizonConfig,
    pub arbiter: ArbiterConfig,
    pub telemetry: TelemetryConfig,
    /// Client credentials, login → password.
    pub users: HashMap<String, String>,
    /// Blocking relationships: requesting device → devices whose BOP bits
    /// gate it. A device absent from the table is gated by everyone.
    pub blocking: HashMap<String, Vec<String>>,
}

impl SkyConfig {
    /// Does `other`'s BOP state gate commands of `requester`?
    pub fn blocks(&self, requester: &str, other: &str) -> bool {
        match self.blocking.get(requester) {
            Some(blockers) => blockers.iter().any(|b| b == other),
            None => true,
        }
    }

    /// Verify client credentials. Logins absent from the users table fall
    /// back to the historical convention of password == login.
    pub fn check_password(&self, login: &str, password: &str) -> bool {
        match self.users.get(login) {
            Some(expected) => expected == password,
            None => login == password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_blocking_entry_means_blocked_by_all() {
        let config = SkyConfig::default();
        assert!(config.blocks("C0", "T0"));
        assert!(config.blocks("C0", "W0"));
    }

    #[test]
    fn blocking_table_filters() {
        let mut config = SkyConfig::default();
        config.blocking.insert("C0".to_string(), vec!["T0".to_string()]);
        assert!(config.blocks("C0", "T0"));
        assert!(!config.blocks("C0", "W0"));
    }

    #[test]
    fn password_table_with_fallback() {
        let mut config = SkyConfig::default();
        config.users.insert("petr".to_string(), "s3cret".to_string());
        assert!(config.check_password("petr", "s3cret"));
        assert!(!config.check_password("petr", "petr"));
        // Unknown login: historical password-equals-login convention.
        assert!(config.check_password("observer", "observer"));
        assert!(!config.check_password("observer", "wrong"));
    }
}
