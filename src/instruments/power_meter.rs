//! Keysight EPM series power meter (N1913A and friends).
//!
//! Readings go through the status-byte trigger protocol: `INITiate;*OPC`,
//! poll for completion, then `FETCh?`. A blocking `READ?` would tie up the
//! bus for the whole averaging window instead.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::ScpiResult;
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession, TriggerProtocol};

/// Power meter driver.
pub struct PowerMeter {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    trigger: TriggerProtocol,
    /// Reading unit.
    pub unit: ScpiDevice<String>,
    /// Manual range index (0 = lower, 1 = upper).
    pub range: ScpiDevice<i64>,
    /// Automatic range selection.
    pub range_auto_en: ScpiDevice<bool>,
    /// Frequency used for sensor calibration-factor correction, in Hz.
    pub freq: ScpiDevice<f64>,
    /// Averaging filter enable.
    pub avg_en: ScpiDevice<bool>,
    /// Averaging filter length.
    pub avg_count: ScpiDevice<i64>,
    /// Automatic filter-length selection.
    pub avg_count_auto: ScpiDevice<bool>,
    /// Trigger source.
    pub trig_src: ScpiDevice<String>,
    /// Last completed measurement (does not start a new one).
    pub fetch: ScpiDevice<f64>,
}

impl PowerMeter {
    /// Verify identity and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying power_meter {id:?}"))?;
        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            trigger: TriggerProtocol::new(session.clone()),
            unit: ScpiDevice::new(session.clone(), "unit", ":UNIT:POWer")
                .with_choices(ChoiceStrings::new(["DBM", "W"])),
            range: ScpiDevice::new(session.clone(), "range", ":SENSe:POWer:AC:RANGe")
                .with_min(0.0)
                .with_max(1.0),
            range_auto_en: ScpiDevice::new(
                session.clone(),
                "range_auto_en",
                ":SENSe:POWer:AC:RANGe:AUTO",
            ),
            freq: ScpiDevice::new(session.clone(), "freq", ":SENSe:FREQuency")
                .with_min(1e3)
                .with_max(110e9)
                .with_setget()
                .with_unit("Hz"),
            avg_en: ScpiDevice::new(session.clone(), "avg_en", ":SENSe:AVERage"),
            avg_count: ScpiDevice::new(session.clone(), "avg_count", ":SENSe:AVERage:COUNt")
                .with_min(1.0)
                .with_max(1024.0),
            avg_count_auto: ScpiDevice::new(
                session.clone(),
                "avg_count_auto",
                ":SENSe:AVERage:COUNt:AUTO",
            ),
            trig_src: ScpiDevice::new(session.clone(), "trig_src", ":TRIGger:SOURce")
                .with_choices(ChoiceStrings::new(["IMMediate", "BUS", "EXTernal"])),
            fetch: ScpiDevice::get_only(session.clone(), "fetch", "FETCh?"),
            session,
        })
    }

    /// Trigger a measurement, wait for the averaging filter to settle and
    /// fetch the result.
    pub async fn read(&self, timeout: Duration) -> ScpiResult<f64> {
        self.trigger.run_and_wait(timeout).await?;
        self.fetch.get().await
    }
}

#[async_trait]
impl Instrument for PowerMeter {
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
            self.unit.info(),
            self.range.info(),
            self.range_auto_en.info(),
            self.freq.info(),
            self.avg_en.info(),
            self.avg_count.info(),
            self.avg_count_auto.info(),
            self.trig_src.info(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    async fn meter() -> (PowerMeter, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        h.set_reply("*IDN?", "Agilent Technologies,N1913A,MY50000123,A1.01.05");
        let m = PowerMeter::connect("pm1", ScpiSession::new(Box::new(t)))
            .await
            .unwrap();
        (m, h)
    }

    #[tokio::test]
    async fn initialize_arms_the_trigger_protocol() {
        let (mut m, h) = meter().await;
        h.set_reply("SYSTem:ERRor?", "0,\"No error\"");
        m.initialize().await.unwrap();
        assert!(h.saw("*CLS"));
        assert!(h.saw("*ESE 1;*SRE 32"));
        assert_eq!(m.state(), InstrumentState::Idle);
    }

    #[tokio::test]
    async fn triggered_read_polls_then_fetches() {
        let (m, h) = meter().await;
        h.set_reply("*ESR?", "1");
        h.queue_reply("*ESR?", "0"); // trigger cleanup
        h.queue_reply("*STB?", "0"); // cleanup poll
        h.queue_reply("*STB?", "0"); // still measuring
        h.set_reply("*STB?", "64");
        h.set_reply("FETCh?", "-23.45");

        let value = m.read(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, -23.45);
        let transcript = h.transcript();
        let init_pos = transcript.iter().position(|c| c == "INITiate;*OPC").unwrap();
        let fetch_pos = transcript.iter().position(|c| c == "FETCh?").unwrap();
        assert!(init_pos < fetch_pos);
    }

    #[tokio::test]
    async fn unit_choices_are_enforced() {
        let (m, h) = meter().await;
        m.unit.set("dbm".to_string()).await.unwrap();
        assert!(h.saw(":UNIT:POWer dbm"));
        assert!(m.unit.set("VOLTS".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn averaging_count_is_bounded() {
        let (m, _h) = meter().await;
        assert!(m.avg_count.set(2048).await.is_err());
    }
}
