//! Keysight PSG/MXG microwave signal generator.
//!
//! Frequency and power limits depend on the model and installed options, so
//! they are probed from the instrument at connect time rather than baked in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::ScpiResult;
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession, ScpiType};

/// RF generator driver.
pub struct RfGenerator {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    /// CW output frequency in Hz.
    pub freq_cw: ScpiDevice<f64>,
    /// Frequency mode (CW, list, sweep).
    pub freq_mode: ScpiDevice<String>,
    /// Output amplitude in the unit selected by `ampl_unit`.
    pub ampl: ScpiDevice<f64>,
    /// Amplitude unit.
    pub ampl_unit: ScpiDevice<String>,
    /// RF output enable.
    pub rf_en: ScpiDevice<bool>,
    /// Modulation enable.
    pub mod_en: ScpiDevice<bool>,
    /// Carrier phase adjustment in radians.
    pub phase: ScpiDevice<f64>,
}

impl RfGenerator {
    /// Verify identity, probe limits and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying rf_generator {id:?}"))?;

        let freq_min = probe_limit(&session, ":FREQuency:CW? MINimum").await?;
        let freq_max = probe_limit(&session, ":FREQuency:CW? MAXimum").await?;
        let pow_min = probe_limit(&session, ":POWer? MINimum").await?;
        let pow_max = probe_limit(&session, ":POWer? MAXimum").await?;

        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            freq_cw: ScpiDevice::new(session.clone(), "freq_cw", ":FREQuency:CW")
                .with_min(freq_min)
                .with_max(freq_max)
                .with_setget()
                .with_unit("Hz"),
            freq_mode: ScpiDevice::new(session.clone(), "freq_mode", ":FREQuency:MODE")
                .with_choices(ChoiceStrings::new(["CW", "FIXed", "LIST", "SWEep"])),
            ampl: ScpiDevice::new(session.clone(), "ampl", ":POWer")
                .with_min(pow_min)
                .with_max(pow_max)
                .with_setget()
                .with_unit("dBm"),
            ampl_unit: ScpiDevice::new(session.clone(), "ampl_unit", ":UNIT:POWer")
                .with_choices(ChoiceStrings::new(["DBM", "DBUV", "V", "VEMF", "W"])),
            rf_en: ScpiDevice::new(session.clone(), "rf_en", ":OUTPut"),
            mod_en: ScpiDevice::new(session.clone(), "mod_en", ":OUTPut:MODulation"),
            phase: ScpiDevice::new(session.clone(), "phase", ":PHASe")
                .with_min(-std::f64::consts::PI)
                .with_max(std::f64::consts::PI)
                .with_unit("rad"),
            session,
        })
    }

    /// Declare the current phase as the zero reference.
    pub async fn phase_reference(&self) -> ScpiResult<()> {
        self.session.write(":PHASe:REFerence").await
    }
}

async fn probe_limit(session: &ScpiSession, query: &str) -> Result<f64> {
    let text = session.ask(query).await?;
    f64::from_scpi(&text).with_context(|| format!("probing {query}"))
}

#[async_trait]
impl Instrument for RfGenerator {
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
        // Leave the bench safe even if the disable fails.
        if let Err(e) = self.rf_en.set(false).await {
            warn!(id = %self.id, error = %e, "could not disable RF output");
        }
        self.session.close().await?;
        Ok(())
    }

    fn configuration(&self) -> Vec<DeviceInfo> {
        vec![
            self.freq_cw.info(),
            self.freq_mode.info(),
            self.ampl.info(),
            self.ampl_unit.info(),
            self.rf_en.info(),
            self.mod_en.info(),
            self.phase.info(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScpiError;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    async fn generator() -> (RfGenerator, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        h.set_reply("*IDN?", "Agilent Technologies,N5183A,MY12345678,C.04.86");
        h.set_reply(":FREQuency:CW? MINimum", "100000");
        h.set_reply(":FREQuency:CW? MAXimum", "20000000000");
        h.set_reply(":POWer? MINimum", "-144");
        h.set_reply(":POWer? MAXimum", "19");
        let gen = RfGenerator::connect("gen1", ScpiSession::new(Box::new(t)))
            .await
            .unwrap();
        (gen, h)
    }

    #[tokio::test]
    async fn connect_probes_limits() {
        let (gen, _h) = generator().await;
        assert_eq!(gen.identity().model, "N5183A");
        let err = gen.freq_cw.set(50e9).await.unwrap_err();
        assert!(matches!(err, ScpiError::OutOfLimits { .. }));
        let err = gen.ampl.set(25.0).await.unwrap_err();
        assert!(matches!(err, ScpiError::OutOfLimits { .. }));
    }

    #[tokio::test]
    async fn frequency_set_is_read_back() {
        let (gen, h) = generator().await;
        h.set_reply(":FREQuency:CW?", "+5.000000000000E+09");
        gen.freq_cw.set(5e9).await.unwrap();
        assert!(h.saw(":FREQuency:CW 5000000000"));
        assert_eq!(gen.freq_cw.cached(), Some(5e9));
    }

    #[tokio::test]
    async fn output_enable_uses_numeric_bool() {
        let (gen, h) = generator().await;
        gen.rf_en.set(true).await.unwrap();
        gen.mod_en.set(false).await.unwrap();
        assert!(h.saw(":OUTPut 1"));
        assert!(h.saw(":OUTPut:MODulation 0"));
    }

    #[tokio::test]
    async fn shutdown_disables_rf() {
        let (mut gen, h) = generator().await;
        gen.shutdown().await.unwrap();
        assert!(h.saw(":OUTPut 0"));
        assert_eq!(gen.state(), InstrumentState::ShuttingDown);
    }

    #[tokio::test]
    async fn configuration_lists_every_device() {
        let (gen, _h) = generator().await;
        let names: Vec<String> = gen.configuration().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["freq_cw", "freq_mode", "ampl", "ampl_unit", "rf_en", "mod_en", "phase"]
        );
    }
}
