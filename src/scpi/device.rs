//! Declarative mapping of one instrument property to SCPI commands.
//!
//! A driver is mostly a catalog of [`ScpiDevice`]s: each knows its set/get
//! command strings, how to validate a value before sending it, and how to
//! parse what comes back. The query command defaults to the set command
//! with `?` appended, which covers the vast majority of SCPI subsystems.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use strfmt::strfmt;
use tracing::debug;

use super::choices::ChoiceStrings;
use super::convert::ScpiType;
use super::ScpiSession;
use crate::error::{ScpiError, ScpiResult};

/// Snapshot of a device for configuration records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name within its driver.
    pub name: String,
    /// Last known value, SCPI-formatted; `None` if never read or set.
    pub value: Option<String>,
    /// Physical unit, when one applies.
    pub unit: Option<&'static str>,
}

/// One named instrument property.
pub struct ScpiDevice<T: ScpiType> {
    session: ScpiSession,
    name: String,
    set_cmd: Option<String>,
    get_cmd: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    choices: Option<ChoiceStrings>,
    setget: bool,
    quoted: bool,
    unit: Option<&'static str>,
    fmt_fn: Option<fn(&T) -> String>,
    options: HashMap<String, String>,
    option_limits: HashMap<String, (i64, i64)>,
    cache: StdMutex<Option<T>>,
}

impl<T: ScpiType> ScpiDevice<T> {
    /// Settable device; the get command is the set command plus `?`.
    ///
    /// A `{val}` placeholder in the command disables that automatic get,
    /// since the command is then not a plain `HEADer value` form.
    pub fn new(session: ScpiSession, name: &str, set_cmd: &str) -> Self {
        let get_cmd = if set_cmd.contains("{val}") {
            None
        } else {
            Some(format!("{set_cmd}?"))
        };
        Self::build(session, name, Some(set_cmd.to_string()), get_cmd)
    }

    /// Read-only device (measurement or status query).
    pub fn get_only(session: ScpiSession, name: &str, get_cmd: &str) -> Self {
        Self::build(session, name, None, Some(get_cmd.to_string()))
    }

    /// Write-only device (actions, commands with no query form).
    pub fn set_only(session: ScpiSession, name: &str, set_cmd: &str) -> Self {
        Self::build(session, name, Some(set_cmd.to_string()), None)
    }

    fn build(
        session: ScpiSession,
        name: &str,
        set_cmd: Option<String>,
        get_cmd: Option<String>,
    ) -> Self {
        Self {
            session,
            name: name.to_string(),
            set_cmd,
            get_cmd,
            min: None,
            max: None,
            choices: None,
            setget: false,
            quoted: false,
            unit: None,
            fmt_fn: None,
            options: HashMap::new(),
            option_limits: HashMap::new(),
            cache: StdMutex::new(None),
        }
    }

    /// Replace the automatic get command.
    pub fn with_get(mut self, get_cmd: &str) -> Self {
        self.get_cmd = Some(get_cmd.to_string());
        self
    }

    /// Inclusive lower limit.
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Inclusive upper limit.
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Restrict values to a mnemonic vocabulary; replies are normalized to
    /// the declared form.
    pub fn with_choices(mut self, choices: ChoiceStrings) -> Self {
        self.choices = Some(choices);
        self
    }

    /// Re-read after every set and cache what the instrument accepted.
    pub fn with_setget(mut self) -> Self {
        self.setget = true;
        self
    }

    /// Send values wrapped in double quotes and strip quotes from replies
    /// (string parameters like `FUNCtion "VOLT"`).
    pub fn with_quoted(mut self) -> Self {
        self.quoted = true;
        self
    }

    /// Attach a unit label for configuration snapshots.
    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Override the default value formatting (e.g. fixed-precision
    /// scientific notation for instruments that mis-round).
    pub fn with_fmt(mut self, fmt_fn: fn(&T) -> String) -> Self {
        self.fmt_fn = Some(fmt_fn);
        self
    }

    /// Declare a substitutable command option with its default value.
    pub fn with_option(mut self, key: &str, default: &str) -> Self {
        self.options.insert(key.to_string(), default.to_string());
        self
    }

    /// Restrict an integer option (e.g. channel number) to a range.
    pub fn with_option_limit(mut self, key: &str, min: i64, max: i64) -> Self {
        self.option_limits.insert(key.to_string(), (min, max));
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last known value without touching the instrument.
    pub fn cached(&self) -> Option<T> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Snapshot for configuration records.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            value: self.cached().map(|v| v.to_scpi()),
            unit: self.unit,
        }
    }

    /// Set with default options.
    pub async fn set(&self, value: T) -> ScpiResult<()> {
        self.set_with(value, &[]).await
    }

    /// Get with default options.
    pub async fn get(&self) -> ScpiResult<T> {
        self.get_with(&[]).await
    }

    /// Set with per-call option overrides (`[("ch", "2")]`).
    pub async fn set_with(&self, value: T, overrides: &[(&str, &str)]) -> ScpiResult<()> {
        self.validate(&value)?;
        let cmd = self.build_set(self.format_value(&value), overrides)?;
        self.session.write(&cmd).await?;
        debug!(device = %self.name, cmd, "set");
        if self.setget {
            // Cache what the instrument actually accepted, not what we sent.
            self.get_with(overrides).await?;
        } else {
            self.store(value);
        }
        Ok(())
    }

    /// Get with per-call option overrides.
    pub async fn get_with(&self, overrides: &[(&str, &str)]) -> ScpiResult<T> {
        let cmd = self.build_get(overrides)?;
        let mut text = self.session.ask(&cmd).await?;
        if self.quoted {
            text = super::convert::unquote(&text).to_string();
        }
        if let Some(choices) = &self.choices {
            text = choices
                .normalize(&text)
                .map_err(|e| self.name_choice_error(e))?;
        }
        let value = T::from_scpi(&text)?;
        self.store(value.clone());
        Ok(value)
    }

    fn store(&self, value: T) {
        *self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(value);
    }

    fn format_value(&self, value: &T) -> String {
        let s = match self.fmt_fn {
            Some(f) => f(value),
            None => value.to_scpi(),
        };
        if self.quoted {
            super::convert::quote(&s)
        } else {
            s
        }
    }

    fn validate(&self, value: &T) -> ScpiResult<()> {
        if let Some(v) = value.as_f64() {
            let min = self.min.unwrap_or(f64::NEG_INFINITY);
            let max = self.max.unwrap_or(f64::INFINITY);
            if v < min || v > max {
                return Err(ScpiError::OutOfLimits {
                    device: self.name.clone(),
                    value: value.to_scpi(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
            }
        }
        if let Some(choices) = &self.choices {
            let candidate = value.to_scpi();
            if !choices.contains(&candidate) {
                return Err(ScpiError::InvalidChoice {
                    device: self.name.clone(),
                    value: candidate,
                    allowed: choices.declared(),
                });
            }
        }
        Ok(())
    }

    fn name_choice_error(&self, e: ScpiError) -> ScpiError {
        match e {
            ScpiError::InvalidChoice { value, allowed, .. } => ScpiError::InvalidChoice {
                device: self.name.clone(),
                value,
                allowed,
            },
            other => other,
        }
    }

    fn resolve_options(&self, overrides: &[(&str, &str)]) -> ScpiResult<HashMap<String, String>> {
        let mut vars = self.options.clone();
        for (key, val) in overrides {
            if !vars.contains_key(*key) {
                return Err(ScpiError::CommandFormat {
                    device: self.name.clone(),
                    reason: format!("unknown option {key:?}"),
                });
            }
            if let Some((min, max)) = self.option_limits.get(*key) {
                let n: i64 = val.parse().map_err(|_| ScpiError::CommandFormat {
                    device: self.name.clone(),
                    reason: format!("option {key:?} must be an integer"),
                })?;
                if n < *min || n > *max {
                    return Err(ScpiError::CommandFormat {
                        device: self.name.clone(),
                        reason: format!("option {key:?}={n} outside [{min}, {max}]"),
                    });
                }
            }
            vars.insert((*key).to_string(), (*val).to_string());
        }
        Ok(vars)
    }

    fn build_set(&self, val_str: String, overrides: &[(&str, &str)]) -> ScpiResult<String> {
        let template = self
            .set_cmd
            .as_deref()
            .ok_or_else(|| ScpiError::NoSet(self.name.clone()))?;
        let mut vars = self.resolve_options(overrides)?;
        if template.contains("{val}") {
            vars.insert("val".to_string(), val_str);
            return self.substitute(template, &vars);
        }
        let head = if template.contains('{') {
            self.substitute(template, &vars)?
        } else {
            template.to_string()
        };
        Ok(format!("{head} {val_str}"))
    }

    fn build_get(&self, overrides: &[(&str, &str)]) -> ScpiResult<String> {
        let template = self
            .get_cmd
            .as_deref()
            .ok_or_else(|| ScpiError::NoGet(self.name.clone()))?;
        // Overrides are checked even when the command has nothing to
        // substitute, so a bad option fails the same way on get and set.
        let vars = self.resolve_options(overrides)?;
        if !template.contains('{') {
            return Ok(template.to_string());
        }
        self.substitute(template, &vars)
    }

    fn substitute(&self, template: &str, vars: &HashMap<String, String>) -> ScpiResult<String> {
        strfmt(template, vars).map_err(|e| ScpiError::CommandFormat {
            device: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    fn session() -> (ScpiSession, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        (ScpiSession::new(Box::new(t)), h)
    }

    #[tokio::test]
    async fn set_appends_value_and_autoget_appends_question_mark() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "freq_cw", ":FREQuency:CW");
        h.set_reply(":FREQuency:CW?", "2000000000");

        dev.set(1e9).await.unwrap();
        assert_eq!(dev.get().await.unwrap(), 2e9);
        assert_eq!(
            h.transcript(),
            vec![":FREQuency:CW 1000000000", ":FREQuency:CW?"]
        );
    }

    #[tokio::test]
    async fn val_placeholder_formats_inline_and_disables_autoget() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> =
            ScpiDevice::new(s, "level", ":SOURce:LEVel {val}V").with_get(":SOURce:LEVel?");
        dev.set(0.5).await.unwrap();
        assert_eq!(h.transcript(), vec![":SOURce:LEVel 0.5V"]);

        let (s2, _h2) = session();
        let bare: ScpiDevice<f64> = ScpiDevice::new(s2, "level", ":SOURce:LEVel {val}V");
        assert!(matches!(
            bare.get().await.unwrap_err(),
            ScpiError::NoGet(_)
        ));
    }

    #[tokio::test]
    async fn out_of_limits_set_performs_no_io() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "freq", ":FREQ")
            .with_min(100e3)
            .with_max(20e9);
        let err = dev.set(50e9).await.unwrap_err();
        assert!(matches!(err, ScpiError::OutOfLimits { .. }));
        assert!(h.transcript().is_empty());
        assert!(dev.cached().is_none());
    }

    #[tokio::test]
    async fn choices_validate_sets_and_normalize_gets() {
        let (s, h) = session();
        let dev: ScpiDevice<String> = ScpiDevice::new(s, "freq_mode", ":FREQuency:MODE")
            .with_choices(ChoiceStrings::new(["CW", "FIXed", "LIST"]));
        h.set_reply(":FREQuency:MODE?", "FIX");

        dev.set("list".to_string()).await.unwrap();
        assert_eq!(dev.get().await.unwrap(), "FIXed");

        let err = dev.set("sweep".to_string()).await.unwrap_err();
        assert!(matches!(err, ScpiError::InvalidChoice { .. }));
        // A truncation between short and long form never reaches the wire.
        let err = dev.set("FIXE".to_string()).await.unwrap_err();
        assert!(matches!(err, ScpiError::InvalidChoice { .. }));
        assert_eq!(h.transcript(), vec![":FREQuency:MODE list", ":FREQuency:MODE?"]);
    }

    #[tokio::test]
    async fn setget_caches_the_instrument_echo() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "range", ":SOURce:RANGe").with_setget();
        // The instrument rounds 0.9 up to its 1.0 range.
        h.set_reply(":SOURce:RANGe?", "1.0");
        dev.set(0.9).await.unwrap();
        assert_eq!(dev.cached(), Some(1.0));
    }

    #[tokio::test]
    async fn channel_options_substitute_and_check_limits() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "freq_start", "SENSe{ch}:FREQuency:STARt")
            .with_option("ch", "1")
            .with_option_limit("ch", 1, 4);
        h.set_reply("SENSe1:FREQuency:STARt?", "10000000");
        h.set_reply("SENSe3:FREQuency:STARt?", "20000000");

        assert_eq!(dev.get().await.unwrap(), 10e6);
        assert_eq!(dev.get_with(&[("ch", "3")]).await.unwrap(), 20e6);
        dev.set_with(1e9, &[("ch", "2")]).await.unwrap();
        assert!(h.saw("SENSe2:FREQuency:STARt 1000000000"));

        let err = dev.get_with(&[("ch", "9")]).await.unwrap_err();
        assert!(matches!(err, ScpiError::CommandFormat { .. }));
        let err = dev.get_with(&[("trace", "1")]).await.unwrap_err();
        assert!(matches!(err, ScpiError::CommandFormat { .. }));
    }

    #[tokio::test]
    async fn overrides_on_an_option_less_device_are_rejected() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "freq", ":FREQ");
        let err = dev.get_with(&[("ch", "2")]).await.unwrap_err();
        assert!(matches!(err, ScpiError::CommandFormat { .. }));
        assert!(h.transcript().is_empty());
    }

    #[tokio::test]
    async fn custom_formatting_applies_on_set() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::new(s, "level", ":SOURce:LEVel")
            .with_fmt(|v| format!("{v:.6E}"));
        dev.set(0.1).await.unwrap();
        assert_eq!(h.transcript(), vec![":SOURce:LEVel 1.000000E-1"]);
    }

    #[tokio::test]
    async fn quoted_device_wraps_sets_and_strips_gets() {
        let (s, h) = session();
        let dev: ScpiDevice<String> = ScpiDevice::new(s, "mode", "FUNCtion")
            .with_quoted()
            .with_choices(ChoiceStrings::new(["VOLTage", "CURRent", "RESistance"]));
        h.set_reply("FUNCtion?", "\"VOLT\"");

        dev.set("volt".to_string()).await.unwrap();
        assert_eq!(dev.get().await.unwrap(), "VOLTage");
        assert_eq!(h.transcript(), vec!["FUNCtion \"volt\"", "FUNCtion?"]);
    }

    #[tokio::test]
    async fn read_only_device_rejects_set() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> = ScpiDevice::get_only(s, "reading", "READ?");
        h.set_reply("READ?", "1.25e-3");
        assert_eq!(dev.get().await.unwrap(), 1.25e-3);
        assert!(matches!(
            dev.set(1.0).await.unwrap_err(),
            ScpiError::NoSet(_)
        ));
    }

    #[tokio::test]
    async fn info_reports_cached_value_and_unit() {
        let (s, h) = session();
        let dev: ScpiDevice<f64> =
            ScpiDevice::new(s, "freq", ":FREQ").with_unit("Hz");
        assert_eq!(dev.info().value, None);
        h.set_reply(":FREQ?", "5e6");
        dev.get().await.unwrap();
        let info = dev.info();
        assert_eq!(info.name, "freq");
        assert_eq!(info.value.as_deref(), Some("5000000"));
        assert_eq!(info.unit, Some("Hz"));
    }
}
