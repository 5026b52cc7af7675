//! Configuration loading and validation.
//!
//! Settings come from a TOML file merged with `RUSTSCPI_`-prefixed
//! environment variables (double underscore separates nesting levels, e.g.
//! `RUSTSCPI_LOG_LEVEL=debug`). Validation runs after extraction so a bad
//! file fails before any transport is opened.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ScpiError, ScpiResult};
use crate::instruments::KNOWN_TYPES;

const ENV_PREFIX: &str = "RUSTSCPI_";

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application name used in logs.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Transport timeout applied when an instrument does not set its own.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Instruments to bring up.
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// One configured instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique identifier used in logs and the registry.
    pub id: String,

    /// Driver type name (see [`KNOWN_TYPES`]).
    #[serde(rename = "type")]
    pub instrument_type: String,

    /// VISA-style resource string.
    pub resource: String,

    /// Per-instrument transport timeout override.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,

    /// Disabled instruments are kept in the file but not opened.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Driver-specific extras (e.g. serial baud rate, channel count).
    #[serde(default, flatten)]
    pub extra: HashMap<String, toml::Value>,
}

fn default_app_name() -> String {
    "rust_scpi".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            log_level: default_log_level(),
            default_timeout: default_timeout(),
            instruments: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from a TOML file with environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> ScpiResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ScpiError::Config(e.to_string()))?;
        settings.validate()?;
        debug!(
            instruments = settings.instruments.len(),
            "configuration loaded"
        );
        Ok(settings)
    }

    /// Check cross-field constraints extraction cannot express.
    pub fn validate(&self) -> ScpiResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ScpiError::Config(format!(
                "invalid log level {:?}, expected one of {LEVELS:?}",
                self.log_level
            )));
        }

        let mut seen = HashSet::new();
        for instr in &self.instruments {
            if instr.id.is_empty() {
                return Err(ScpiError::Config("instrument with empty id".into()));
            }
            if !seen.insert(&instr.id) {
                return Err(ScpiError::Config(format!(
                    "duplicate instrument id {:?}",
                    instr.id
                )));
            }
            if instr.resource.is_empty() {
                return Err(ScpiError::Config(format!(
                    "instrument {:?} has an empty resource",
                    instr.id
                )));
            }
            if !KNOWN_TYPES.contains(&instr.instrument_type.as_str()) {
                return Err(ScpiError::Config(format!(
                    "instrument {:?} has unknown type {:?}, expected one of {KNOWN_TYPES:?}",
                    instr.id, instr.instrument_type
                )));
            }
        }
        Ok(())
    }

    /// Effective timeout for one instrument.
    pub fn timeout_for(&self, instr: &InstrumentDefinition) -> Duration {
        instr.timeout.unwrap_or(self.default_timeout)
    }

    /// Enabled instruments only.
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|i| i.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn full_file_round_trip() {
        let f = write_config(
            r#"
            app_name = "bench-42"
            log_level = "debug"
            default_timeout = "5s"

            [[instruments]]
            id = "gen1"
            type = "rf_generator"
            resource = "TCPIP0::192.168.1.20::5025::SOCKET"
            timeout = "10s"

            [[instruments]]
            id = "dmm"
            type = "multimeter"
            resource = "GPIB0::22::INSTR"
            enabled = false
            "#,
        );
        let s = Settings::load(f.path()).unwrap();
        assert_eq!(s.app_name, "bench-42");
        assert_eq!(s.default_timeout, Duration::from_secs(5));
        assert_eq!(s.instruments.len(), 2);
        assert_eq!(s.timeout_for(&s.instruments[0]), Duration::from_secs(10));
        assert_eq!(s.timeout_for(&s.instruments[1]), Duration::from_secs(5));
        assert_eq!(s.enabled_instruments().count(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let f = write_config(
            r#"
            [[instruments]]
            id = "a"
            type = "multimeter"
            resource = "GPIB0::22::INSTR"

            [[instruments]]
            id = "a"
            type = "power_meter"
            resource = "GPIB0::13::INSTR"
            "#,
        );
        let err = Settings::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let f = write_config(
            r#"
            [[instruments]]
            id = "x"
            type = "flux_capacitor"
            resource = "GPIB0::9::INSTR"
            "#,
        );
        let err = Settings::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("flux_capacitor"));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let f = write_config(r#"log_level = "loud""#);
        assert!(Settings::load(f.path()).is_err());
    }

    #[test]
    fn driver_extras_are_captured() {
        let f = write_config(
            r#"
            [[instruments]]
            id = "sm"
            type = "source_meter"
            resource = "ASRL/dev/ttyUSB0::INSTR"
            baud_rate = 19200
            "#,
        );
        let s = Settings::load(f.path()).unwrap();
        assert_eq!(
            s.instruments[0].extra.get("baud_rate").and_then(|v| v.as_integer()),
            Some(19200)
        );
    }
}
