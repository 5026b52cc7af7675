//! Yokogawa GS200 DC source.
//!
//! The level limit depends on the selected range: the instrument accepts
//! 20% over-range, except in current mode where the top range cannot exceed
//! 200 mA. Levels are sent in fixed six-digit scientific notation because
//! the instrument mis-rounds shorter representations near range boundaries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::{ScpiError, ScpiResult};
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession};

const OVER_RANGE: f64 = 1.2;
const CURRENT_CLAMP_A: f64 = 0.2;

/// DC source driver.
pub struct SourceMeter {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    /// Source function (voltage or current).
    pub function: ScpiDevice<String>,
    /// Source range; the instrument rounds to the nearest decade.
    pub range: ScpiDevice<f64>,
    /// Output level; validated against the range by
    /// [`set_level`](Self::set_level).
    pub level: ScpiDevice<f64>,
    /// Compliance voltage limit (current mode), in V.
    pub protection_voltage: ScpiDevice<f64>,
    /// Compliance current limit (voltage mode), in A.
    pub protection_current: ScpiDevice<f64>,
    /// Output relay.
    pub output_en: ScpiDevice<bool>,
}

impl SourceMeter {
    /// Verify identity and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying source_meter {id:?}"))?;
        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            function: ScpiDevice::new(session.clone(), "function", ":SOURce:FUNCtion")
                .with_choices(ChoiceStrings::new(["VOLTage", "CURRent"])),
            range: ScpiDevice::new(session.clone(), "range", ":SOURce:RANGe").with_setget(),
            level: ScpiDevice::new(session.clone(), "level", ":SOURce:LEVel")
                .with_fmt(|v| format!("{v:.6E}")),
            protection_voltage: ScpiDevice::new(
                session.clone(),
                "protection_voltage",
                ":SOURce:PROTection:VOLTage",
            )
            .with_min(1.0)
            .with_max(30.0)
            .with_setget()
            .with_unit("V"),
            protection_current: ScpiDevice::new(
                session.clone(),
                "protection_current",
                ":SOURce:PROTection:CURRent",
            )
            .with_min(1e-3)
            .with_max(0.2)
            .with_setget()
            .with_unit("A"),
            output_en: ScpiDevice::new(session.clone(), "output_en", ":OUTPut"),
            session,
        })
    }

    /// Highest level the current range accepts.
    async fn level_limit(&self) -> ScpiResult<f64> {
        let range = match self.range.cached() {
            Some(v) => v,
            None => self.range.get().await?,
        };
        let function = match self.function.cached() {
            Some(v) => v,
            None => self.function.get().await?,
        };
        let mut limit = range * OVER_RANGE;
        if function == "CURRent" {
            limit = limit.min(CURRENT_CLAMP_A);
        }
        Ok(limit)
    }

    /// Set the output level after checking it against the active range.
    pub async fn set_level(&self, value: f64) -> ScpiResult<()> {
        let limit = self.level_limit().await?;
        if value.abs() > limit {
            return Err(ScpiError::OutOfLimits {
                device: "level".into(),
                value: value.to_string(),
                min: (-limit).to_string(),
                max: limit.to_string(),
            });
        }
        self.level.set(value).await
    }
}

#[async_trait]
impl Instrument for SourceMeter {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> InstrumentState {
        self.state.clone()
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn session(&self) -> &ScpiSession {
        &self.session
    }

    async fn initialize(&mut self) -> Result<()> {
        self.session.clear_status().await?;
        for (code, message) in self.session.drain_errors().await? {
            warn!(id = %self.id, code, message, "stale instrument error");
        }
        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        // A floating load is safer than a live one.
        if let Err(e) = self.output_en.set(false).await {
            warn!(id = %self.id, error = %e, "could not open the output relay");
        }
        self.session.close().await?;
        Ok(())
    }

    fn configuration(&self) -> Vec<DeviceInfo> {
        vec![
            self.function.info(),
            self.range.info(),
            self.level.info(),
            self.protection_voltage.info(),
            self.protection_current.info(),
            self.output_en.info(),
        ]
    }
}
