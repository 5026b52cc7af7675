//! Keysight/Agilent 34410A digital multimeter.
//!
//! Mode-dependent settings (range, NPLC, autozero) share one command
//! template with a `{func}` option, so switching the measurement function
//! re-targets the whole group without rebuilding the catalog.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::ScpiResult;
use crate::scpi::block::{self, ByteOrder};
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession, TriggerProtocol};

const MODES: [&str; 12] = [
    "VOLTage",
    "VOLTage:AC",
    "CURRent",
    "CURRent:AC",
    "RESistance",
    "FRESistance",
    "FREQuency",
    "PERiod",
    "CONTinuity",
    "DIODe",
    "CAPacitance",
    "TEMPerature",
];

/// Multimeter driver.
pub struct Multimeter {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    trigger: TriggerProtocol,
    /// Measurement function.
    pub mode: ScpiDevice<String>,
    /// Measurement range for the function in the `func` option.
    pub range: ScpiDevice<f64>,
    /// Automatic ranging.
    pub autorange_en: ScpiDevice<bool>,
    /// Integration time in power-line cycles.
    pub nplc: ScpiDevice<f64>,
    /// Automatic zero correction.
    pub autozero_en: ScpiDevice<bool>,
    /// Readings taken per trigger.
    pub sample_count: ScpiDevice<i64>,
    /// Trigger source.
    pub trig_src: ScpiDevice<String>,
}

impl Multimeter {
    /// Verify identity and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying multimeter {id:?}"))?;
        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            trigger: TriggerProtocol::new(session.clone()),
            mode: ScpiDevice::new(session.clone(), "mode", "FUNCtion")
                .with_quoted()
                .with_choices(ChoiceStrings::new(MODES)),
            range: ScpiDevice::new(session.clone(), "range", "{func}:RANGe")
                .with_option("func", "VOLTage")
                .with_setget(),
            autorange_en: ScpiDevice::new(session.clone(), "autorange_en", "{func}:RANGe:AUTO")
                .with_option("func", "VOLTage"),
            nplc: ScpiDevice::new(session.clone(), "nplc", "{func}:NPLCycles")
                .with_option("func", "VOLTage")
                .with_min(0.006)
                .with_max(100.0)
                .with_setget(),
            autozero_en: ScpiDevice::new(session.clone(), "autozero_en", "{func}:ZERO:AUTO")
                .with_option("func", "VOLTage"),
            sample_count: ScpiDevice::new(session.clone(), "sample_count", "SAMPle:COUNt")
                .with_min(1.0)
                .with_max(50_000.0),
            trig_src: ScpiDevice::new(session.clone(), "trig_src", "TRIGger:SOURce")
                .with_choices(ChoiceStrings::new(["IMMediate", "BUS", "EXTernal"])),
            session,
        })
    }

    /// All readings from the last completed trigger.
    pub async fn fetch_all(&self) -> ScpiResult<Vec<f64>> {
        let raw = self.session.ask_raw("FETCh?").await?;
        block::decode_block_auto_f64(&raw, ByteOrder::Little)
    }

    /// Trigger, wait for all samples and return them.
    pub async fn read(&self, timeout: Duration) -> ScpiResult<Vec<f64>> {
        self.trigger.run_and_wait(timeout).await?;
        self.fetch_all().await
    }

    /// Mean of the last completed trigger's samples.
    pub async fn fetch_mean(&self) -> ScpiResult<f64> {
        Ok(block::mean(&self.fetch_all().await?))
    }

    /// Sample standard deviation of the last completed trigger's samples.
    pub async fn fetch_std(&self) -> ScpiResult<f64> {
        Ok(block::sample_std(&self.fetch_all().await?))
    }
}

#[async_trait]
impl Instrument for Multimeter {
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
        self.trigger.init().await?;
        for (code, message) in self.session.drain_errors().await? {
            warn!(id = %self.id, code, message, "stale instrument error");
        }
        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        self.session.close().await?;
        Ok(())
    }

    fn configuration(&self) -> Vec<DeviceInfo> {
        vec![
            self.mode.info(),
            self.range.info(),
            self.autorange_en.info(),
            self.nplc.info(),
            self.autozero_en.info(),
            self.sample_count.info(),
            self.trig_src.info(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    async fn dmm() -> (Multimeter, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        h.set_reply("*IDN?", "Agilent Technologies,34410A,MY47001234,2.35");
        let m = Multimeter::connect("dmm1", ScpiSession::new(Box::new(t)))
            .await
            .unwrap();
        (m, h)
    }

    #[tokio::test]
    async fn mode_is_quoted_and_normalized() {
        let (m, h) = dmm().await;
        h.set_reply("FUNCtion?", "\"CURR:AC\"");
        m.mode.set("CURRent:AC".to_string()).await.unwrap();
        assert!(h.saw("FUNCtion \"CURRent:AC\""));
        assert_eq!(m.mode.get().await.unwrap(), "CURRent:AC");
    }

    #[tokio::test]
    async fn function_option_retargets_the_settings_group() {
        let (m, h) = dmm().await;
        h.set_reply("VOLTage:NPLCycles?", "10");
        h.set_reply("RESistance:NPLCycles?", "1");
        m.nplc.set(10.0).await.unwrap();
        assert!(h.saw("VOLTage:NPLCycles 10"));
        assert_eq!(
            m.nplc.get_with(&[("func", "RESistance")]).await.unwrap(),
            1.0
        );
    }

    #[tokio::test]
    async fn fetch_parses_ascii_sample_lists() {
        let (m, h) = dmm().await;
        h.set_reply("FETCh?", "+1.000E-3,+2.000E-3,+3.000E-3");
        assert_eq!(m.fetch_all().await.unwrap(), vec![1e-3, 2e-3, 3e-3]);
        assert!((m.fetch_mean().await.unwrap() - 2e-3).abs() < 1e-12);
        assert!((m.fetch_std().await.unwrap() - 1e-3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn triggered_read_returns_all_samples() {
        let (m, h) = dmm().await;
        h.set_reply("*ESR?", "1");
        h.queue_reply("*ESR?", "0");
        h.queue_reply("*STB?", "0");
        h.set_reply("*STB?", "64");
        h.set_reply("FETCh?", "4.2e0,4.3e0");
        let samples = m.read(Duration::from_secs(1)).await.unwrap();
        assert_eq!(samples, vec![4.2, 4.3]);
        assert!(h.saw("INITiate;*OPC"));
    }

    #[tokio::test]
    async fn sample_count_is_bounded() {
        let (m, _h) = dmm().await;
        assert!(m.sample_count.set(100_000).await.is_err());
    }
}
