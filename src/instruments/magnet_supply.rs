//! American Magnetics Model 430 superconducting magnet power supply.
//!
//! Targets are written through `CONFigure:` commands but read back without
//! the prefix, so those devices carry explicit get commands. The ramp state
//! machine is surfaced as a typed enum decoded from the numeric `STATE?`
//! reply.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Instrument, InstrumentState};
use crate::error::{ScpiError, ScpiResult};
use crate::scpi::convert::split_csv;
use crate::scpi::device::DeviceInfo;
use crate::scpi::{Identity, ScpiDevice, ScpiSession, ScpiType};

const STATE_POLL: Duration = Duration::from_millis(500);

/// Field display/entry unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUnit {
    /// Kilogauss.
    Kilogauss,
    /// Tesla.
    Tesla,
}

impl ScpiType for FieldUnit {
    const NAME: &'static str = "field unit";

    fn to_scpi(&self) -> String {
        match self {
            Self::Kilogauss => "0",
            Self::Tesla => "1",
        }
        .to_string()
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        match s.trim() {
            "0" => Ok(Self::Kilogauss),
            "1" => Ok(Self::Tesla),
            _ => Err(ScpiError::ParseResponse {
                text: s.to_string(),
                wanted: Self::NAME,
            }),
        }
    }
}

/// Ramp-rate time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampRateUnit {
    /// Per second.
    PerSecond,
    /// Per minute.
    PerMinute,
}

impl ScpiType for RampRateUnit {
    const NAME: &'static str = "ramp rate unit";

    fn to_scpi(&self) -> String {
        match self {
            Self::PerSecond => "0",
            Self::PerMinute => "1",
        }
        .to_string()
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        match s.trim() {
            "0" => Ok(Self::PerSecond),
            "1" => Ok(Self::PerMinute),
            _ => Err(ScpiError::ParseResponse {
                text: s.to_string(),
                wanted: Self::NAME,
            }),
        }
    }
}

/// Supply ramp state machine, decoded from the numeric `STATE?` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagnetState {
    /// Ramping toward the target.
    Ramping,
    /// At target, holding.
    Holding,
    /// Ramp paused.
    Paused,
    /// Manual ramp up.
    ManualUp,
    /// Manual ramp down.
    ManualDown,
    /// Ramping the current to zero.
    ZeroingCurrent,
    /// Quench detected.
    QuenchDetected,
    /// At zero current.
    AtZero,
    /// Heating the persistent switch.
    HeatingSwitch,
    /// Cooling the persistent switch.
    CoolingSwitch,
}

impl ScpiType for MagnetState {
    const NAME: &'static str = "magnet state";

    fn to_scpi(&self) -> String {
        let index = match self {
            Self::Ramping => 1,
            Self::Holding => 2,
            Self::Paused => 3,
            Self::ManualUp => 4,
            Self::ManualDown => 5,
            Self::ZeroingCurrent => 6,
            Self::QuenchDetected => 7,
            Self::AtZero => 8,
            Self::HeatingSwitch => 9,
            Self::CoolingSwitch => 10,
        };
        index.to_string()
    }

    fn from_scpi(s: &str) -> ScpiResult<Self> {
        match i64::from_scpi(s)? {
            1 => Ok(Self::Ramping),
            2 => Ok(Self::Holding),
            3 => Ok(Self::Paused),
            4 => Ok(Self::ManualUp),
            5 => Ok(Self::ManualDown),
            6 => Ok(Self::ZeroingCurrent),
            7 => Ok(Self::QuenchDetected),
            8 => Ok(Self::AtZero),
            9 => Ok(Self::HeatingSwitch),
            10 => Ok(Self::CoolingSwitch),
            _ => Err(ScpiError::ParseResponse {
                text: s.to_string(),
                wanted: Self::NAME,
            }),
        }
    }
}

/// Ramp commands accepted by [`MagnetSupply::set_ramp_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampCommand {
    /// Ramp to the configured target.
    Ramp,
    /// Pause at the present current.
    Pause,
    /// Ramp to zero current.
    Zero,
}

impl RampCommand {
    fn command(self) -> &'static str {
        match self {
            Self::Ramp => "RAMP",
            Self::Pause => "PAUSE",
            Self::Zero => "ZERO",
        }
    }
}

/// Magnet supply driver.
pub struct MagnetSupply {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    /// Target current in A.
    pub current_target: ScpiDevice<f64>,
    /// Target field in the unit selected by `field_unit`.
    pub field_target: ScpiDevice<f64>,
    /// Current delivered by the supply, in A.
    pub current_supply: ScpiDevice<f64>,
    /// Current flowing in the magnet, in A (differs from the supply current
    /// when the switch is persistent).
    pub current_magnet: ScpiDevice<f64>,
    /// Field reported by the supply.
    pub field: ScpiDevice<f64>,
    /// Magnet coil constant.
    pub coil_constant: ScpiDevice<f64>,
    /// Field unit.
    pub field_unit: ScpiDevice<FieldUnit>,
    /// Ramp-rate time base.
    pub ramp_rate_unit: ScpiDevice<RampRateUnit>,
    /// Ramp state machine.
    pub ramp_state: ScpiDevice<MagnetState>,
    /// Persistent switch heater.
    pub pswitch_en: ScpiDevice<bool>,
    /// Whether a persistent switch is installed.
    pub pswitch_installed: ScpiDevice<bool>,
    /// Whether the magnet is in persistent mode.
    pub persistent: ScpiDevice<bool>,
    /// Quench flag.
    pub quench: ScpiDevice<bool>,
}

impl MagnetSupply {
    /// Verify identity and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying magnet_supply {id:?}"))?;
        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            current_target: ScpiDevice::new(
                session.clone(),
                "current_target",
                "CONFigure:CURRent:TARGet",
            )
            .with_get("CURRent:TARGet?")
            .with_unit("A"),
            field_target: ScpiDevice::new(
                session.clone(),
                "field_target",
                "CONFigure:FIELD:TARGet",
            )
            .with_get("FIELD:TARGet?"),
            current_supply: ScpiDevice::get_only(
                session.clone(),
                "current_supply",
                "CURRent:SUPPly?",
            )
            .with_unit("A"),
            current_magnet: ScpiDevice::get_only(
                session.clone(),
                "current_magnet",
                "CURRent:MAGnet?",
            )
            .with_unit("A"),
            field: ScpiDevice::get_only(session.clone(), "field", "FIELD:MAGnet?"),
            coil_constant: ScpiDevice::new(session.clone(), "coil_constant", "CONFigure:COILconst")
                .with_get("COILconst?"),
            field_unit: ScpiDevice::new(session.clone(), "field_unit", "CONFigure:FIELD:UNITS")
                .with_get("FIELD:UNITS?"),
            ramp_rate_unit: ScpiDevice::new(
                session.clone(),
                "ramp_rate_unit",
                "CONFigure:RAMP:RATE:UNITS",
            )
            .with_get("RAMP:RATE:UNITS?"),
            ramp_state: ScpiDevice::get_only(session.clone(), "ramp_state", "STATE?"),
            pswitch_en: ScpiDevice::new(session.clone(), "pswitch_en", "PSwitch"),
            pswitch_installed: ScpiDevice::get_only(
                session.clone(),
                "pswitch_installed",
                "PSwitch:INSTalled?",
            ),
            persistent: ScpiDevice::get_only(session.clone(), "persistent", "PERSistent?"),
            quench: ScpiDevice::get_only(session.clone(), "quench", "QUench?"),
            session,
        })
    }

    /// Issue a ramp state transition.
    pub async fn set_ramp_state(&self, command: RampCommand) -> ScpiResult<()> {
        self.session.write(command.command()).await
    }

    /// Configure ramp segment 1 (`rate` per the active time base, up to
    /// `upper_bound` amperes).
    pub async fn set_current_ramp_rate(&self, rate: f64, upper_bound: f64) -> ScpiResult<()> {
        self.session
            .write(&format!("CONFigure:RAMP:RATE:CURRent 1,{rate},{upper_bound}"))
            .await
    }

    /// Ramp segment 1 as (rate, upper bound).
    pub async fn current_ramp_rate(&self) -> ScpiResult<(f64, f64)> {
        let reply = self.session.ask("RAMP:RATE:CURRent:1?").await?;
        let fields = split_csv(&reply);
        match fields.as_slice() {
            [rate, upper] => Ok((f64::from_scpi(rate)?, f64::from_scpi(upper)?)),
            _ => Err(ScpiError::ParseResponse {
                text: reply,
                wanted: "rate,upper_bound pair",
            }),
        }
    }

    /// Set the field target and ramp until the supply holds there.
    ///
    /// A quench aborts the wait immediately.
    pub async fn ramp_to_field(&self, target: f64, timeout: Duration) -> ScpiResult<()> {
        self.field_target.set(target).await?;
        self.set_ramp_state(RampCommand::Ramp).await?;
        let start = Instant::now();
        loop {
            let state = self.ramp_state.get().await?;
            match state {
                MagnetState::Holding | MagnetState::AtZero => {
                    debug!(id = %self.id, target, "ramp complete");
                    return Ok(());
                }
                MagnetState::QuenchDetected => {
                    return Err(ScpiError::InstrumentError {
                        code: 0,
                        message: "quench detected during ramp".into(),
                    });
                }
                _ => {}
            }
            if start.elapsed() >= timeout {
                return Err(ScpiError::TriggerTimeout(timeout));
            }
            tokio::time::sleep(STATE_POLL).await;
        }
    }
}

#[async_trait]
impl Instrument for MagnetSupply {
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
        if self.quench.get().await? {
            let msg = "quench flag set at connect".to_string();
            self.state = InstrumentState::Error(msg.clone());
            anyhow::bail!(msg);
        }
        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        // Never leave the supply ramping unattended.
        if let Err(e) = self.set_ramp_state(RampCommand::Pause).await {
            warn!(id = %self.id, error = %e, "could not pause the ramp");
        }
        self.session.close().await?;
        Ok(())
    }

    fn configuration(&self) -> Vec<DeviceInfo> {
        vec![
            self.current_target.info(),
            self.field_target.info(),
            self.coil_constant.info(),
            self.field_unit.info(),
            self.ramp_rate_unit.info(),
            self.pswitch_en.info(),
        ]
    }
}
