//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, SkyConfig};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local/cli). Only returns files
/// that exist. A CLI override path replaces the local file.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/skywatch/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("skywatch/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("skywatch.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Discover, load, and overlay: the whole pipeline in one call.
pub fn load(cli_path: Option<&Path>) -> Result<(SkyConfig, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut config = SkyConfig::default();
    for path in discover_config_files(cli_path) {
        config = load_from_file(&path)?.overlaid_on(config);
        sources.files.push(path);
    }
    apply_env_overrides(&mut config, &mut sources);
    Ok((config, sources))
}

/// Load config from a single TOML file.
pub fn load_from_file(path: &Path) -> Result<SkyConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_toml(&contents, path)
}

/// Parse config from a TOML string; absent keys keep their defaults.
pub fn parse_toml(contents: &str, path: &Path) -> Result<SkyConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = SkyConfig::default();

    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("port").and_then(|v| v.as_integer()) {
            config.bind.port = v as u16;
        }
    }

    if let Some(timeouts) = table.get("timeouts").and_then(|v| v.as_table()) {
        if let Some(v) = timeouts.get("idle_secs").and_then(|v| v.as_integer()) {
            config.timeouts.idle_secs = v.max(1) as u64;
        }
    }

    if let Some(site) = table.get("site").and_then(|v| v.as_table()) {
        if let Some(v) = site.get("longitude").and_then(|v| v.as_float()) {
            config.site.longitude = v;
        }
        if let Some(v) = site.get("latitude").and_then(|v| v.as_float()) {
            config.site.latitude = v;
        }
    }

    if let Some(horizons) = table.get("horizons").and_then(|v| v.as_table()) {
        if let Some(v) = horizons.get("day_deg").and_then(|v| v.as_float()) {
            config.horizons.day_deg = v;
        }
        if let Some(v) = horizons.get("night_deg").and_then(|v| v.as_float()) {
            config.horizons.night_deg = v;
        }
        if let Some(v) = horizons.get("evening_secs").and_then(|v| v.as_integer()) {
            config.horizons.evening_secs = v;
        }
        if let Some(v) = horizons.get("morning_secs").and_then(|v| v.as_integer()) {
            config.horizons.morning_secs = v;
        }
    }

    if let Some(arbiter) = table.get("arbiter").and_then(|v| v.as_table()) {
        if let Some(v) = arbiter.get("morning_off").and_then(|v| v.as_bool()) {
            config.arbiter.morning_off = v;
        }
        if let Some(v) = arbiter.get("morning_standby").and_then(|v| v.as_bool()) {
            config.arbiter.morning_standby = v;
        }
        if let Some(v) = arbiter.get("reboot_on").and_then(|v| v.as_bool()) {
            config.arbiter.reboot_on = v;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    if let Some(users) = table.get("users").and_then(|v| v.as_table()) {
        for (login, password) in users {
            if let Some(pw) = password.as_str() {
                config.users.insert(login.clone(), pw.to_string());
            }
        }
    }

    if let Some(blocking) = table.get("blocking").and_then(|v| v.as_table()) {
        for (device, blockers) in blocking {
            if let Some(list) = blockers.as_array() {
                let names = list
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect();
                config.blocking.insert(device.clone(), names);
            }
        }
    }

    Ok(config)
}

impl SkyConfig {
    /// Merge: values in `self` that differ from the defaults win over `base`.
    pub fn overlaid_on(self, base: SkyConfig) -> SkyConfig {
        let defaults = SkyConfig::default();
        let mut merged = base;
        if self.bind != defaults.bind {
            merged.bind = self.bind;
        }
        if self.timeouts != defaults.timeouts {
            merged.timeouts = self.timeouts;
        }
        if self.site != defaults.site {
            merged.site = self.site;
        }
        if self.horizons != defaults.horizons {
            merged.horizons = self.horizons;
        }
        if self.arbiter != defaults.arbiter {
            merged.arbiter = self.arbiter;
        }
        if self.telemetry != defaults.telemetry {
            merged.telemetry = self.telemetry;
        }
        merged.users.extend(self.users);
        merged.blocking.extend(self.blocking);
        merged
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SkyConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SKYWATCH_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.port = port;
            sources.env_overrides.push("SKYWATCH_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("SKYWATCH_IDLE_SECS") {
        if let Ok(secs) = v.parse() {
            config.timeouts.idle_secs = secs;
            sources.env_overrides.push("SKYWATCH_IDLE_SECS".to_string());
        }
    }
    if let Ok(v) = env::var("SKYWATCH_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("SKYWATCH_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG directly.
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[bind]
port = 6000
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.bind.port, 6000);
        // Other values keep their defaults.
        assert_eq!(config.timeouts.idle_secs, 60);
        assert!(config.arbiter.morning_off);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[bind]
port = 5557

[timeouts]
idle_secs = 45

[site]
longitude = -16.51
latitude = 28.3

[horizons]
day_deg = 0.5
night_deg = -12.0
evening_secs = 5400
morning_secs = 1200

[arbiter]
morning_off = false
morning_standby = true
reboot_on = true

[telemetry]
log_level = "debug"

[users]
petr = "s3cret"

[blocking]
C0 = ["T0", "W0"]
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.bind.port, 5557);
        assert_eq!(config.timeouts.idle_secs, 45);
        assert_eq!(config.site.latitude, 28.3);
        assert_eq!(config.horizons.night_deg, -12.0);
        assert!(!config.arbiter.morning_off);
        assert!(config.arbiter.reboot_on);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.users.get("petr").unwrap(), "s3cret");
        assert!(config.blocks("C0", "T0"));
        assert!(!config.blocks("C0", "C1"));
    }

    #[test]
    fn overlay_prefers_changed_values() {
        let base = parse_toml("[bind]\nport = 6000", Path::new("base.toml")).unwrap();
        let local = parse_toml("[timeouts]\nidle_secs = 30", Path::new("local.toml")).unwrap();
        let merged = local.overlaid_on(base);
        assert_eq!(merged.bind.port, 6000);
        assert_eq!(merged.timeouts.idle_secs, 30);
    }

    #[test]
    fn load_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skywatch.toml");
        std::fs::write(&path, "[bind]\nport = 7001\n").unwrap();
        let config = load_from_file(&path).unwrap();
        assert_eq!(config.bind.port, 7001);
    }

    #[test]
    fn discover_does_not_panic() {
        let _files = discover_config_files(None);
    }
}
