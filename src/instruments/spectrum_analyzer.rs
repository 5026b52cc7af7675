//! Keysight X-series (EXA/MXA) spectrum analyzer.
//!
//! Traces are fetched in 64-bit binary with swapped byte order; the
//! frequency axis is reconstructed from the configured start/stop span and
//! point count.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::{ScpiError, ScpiResult};
use crate::scpi::block::{self, ByteOrder};
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession, TriggerProtocol};

/// Spectrum analyzer driver.
pub struct SpectrumAnalyzer {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    trigger: TriggerProtocol,
    /// Sweep start frequency in Hz.
    pub freq_start: ScpiDevice<f64>,
    /// Sweep stop frequency in Hz.
    pub freq_stop: ScpiDevice<f64>,
    /// Center frequency in Hz.
    pub freq_center: ScpiDevice<f64>,
    /// Span in Hz.
    pub span: ScpiDevice<f64>,
    /// Resolution bandwidth in Hz.
    pub rbw: ScpiDevice<f64>,
    /// Video bandwidth in Hz.
    pub vbw: ScpiDevice<f64>,
    /// Sweep time in seconds.
    pub sweep_time: ScpiDevice<f64>,
    /// Trace averaging enable.
    pub avg_en: ScpiDevice<bool>,
    /// Trace averaging length.
    pub avg_count: ScpiDevice<i64>,
    /// Amplitude unit of trace data.
    pub y_unit: ScpiDevice<String>,
    /// Free-running versus triggered sweeps.
    pub cont_trigger: ScpiDevice<bool>,
    /// Sweep point count.
    pub npoints: ScpiDevice<usize>,
}

impl SpectrumAnalyzer {
    /// Verify identity, probe frequency limits and build the catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying spectrum_analyzer {id:?}"))?;
        let fmin: f64 = session
            .ask(":FREQuency:STARt? MINimum")
            .await?
            .parse()
            .context("probing minimum frequency")?;
        let fmax: f64 = session
            .ask(":FREQuency:STOP? MAXimum")
            .await?
            .parse()
            .context("probing maximum frequency")?;

        let freq_dev = |name: &str, cmd: &str| {
            ScpiDevice::new(session.clone(), name, cmd)
                .with_min(fmin)
                .with_max(fmax)
                .with_setget()
                .with_unit("Hz")
        };

        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            trigger: TriggerProtocol::new(session.clone()),
            freq_start: freq_dev("freq_start", ":FREQuency:STARt"),
            freq_stop: freq_dev("freq_stop", ":FREQuency:STOP"),
            freq_center: freq_dev("freq_center", ":FREQuency:CENTer"),
            span: ScpiDevice::new(session.clone(), "span", ":FREQuency:SPAN")
                .with_min(0.0)
                .with_max(fmax)
                .with_setget()
                .with_unit("Hz"),
            rbw: ScpiDevice::new(session.clone(), "rbw", ":BANDwidth")
                .with_setget()
                .with_unit("Hz"),
            vbw: ScpiDevice::new(session.clone(), "vbw", ":BANDwidth:VIDeo")
                .with_setget()
                .with_unit("Hz"),
            sweep_time: ScpiDevice::new(session.clone(), "sweep_time", ":SWEep:TIME")
                .with_setget()
                .with_unit("s"),
            avg_en: ScpiDevice::new(session.clone(), "avg_en", ":AVERage:STATe"),
            avg_count: ScpiDevice::new(session.clone(), "avg_count", ":AVERage:COUNt")
                .with_min(1.0)
                .with_max(10_000.0),
            y_unit: ScpiDevice::new(session.clone(), "y_unit", ":UNIT:POWer").with_choices(
                ChoiceStrings::new(["DBM", "DBMV", "DBUV", "DBUA", "V", "W", "A"]),
            ),
            cont_trigger: ScpiDevice::new(session.clone(), "cont_trigger", ":INITiate:CONTinuous"),
            npoints: ScpiDevice::new(session.clone(), "npoints", ":SWEep:POINts")
                .with_min(1.0)
                .with_max(40_001.0)
                .with_setget(),
            session,
        })
    }

    /// Run one sweep and fetch the trace, in the unit set by `y_unit`.
    pub async fn read_trace(&self, trace: u8, timeout: Duration) -> ScpiResult<Vec<f64>> {
        self.trigger.run_and_wait(timeout).await?;
        self.fetch_trace(trace).await
    }

    /// Fetch a trace without sweeping.
    pub async fn fetch_trace(&self, trace: u8) -> ScpiResult<Vec<f64>> {
        let raw = self.session.ask_raw(&format!("TRACe? TRACE{trace}")).await?;
        block::decode_block_auto_f64(&raw, ByteOrder::Little)
    }

    /// Frequency axis matching the current sweep settings.
    ///
    /// Uses cached values when available to avoid extra traffic mid-sweep.
    pub async fn freq_axis(&self) -> ScpiResult<Vec<f64>> {
        let start = match self.freq_start.cached() {
            Some(v) => v,
            None => self.freq_start.get().await?,
        };
        let stop = match self.freq_stop.cached() {
            Some(v) => v,
            None => self.freq_stop.get().await?,
        };
        let n = match self.npoints.cached() {
            Some(v) => v,
            None => self.npoints.get().await?,
        };
        if n < 2 {
            return Err(ScpiError::ParseResponse {
                text: n.to_string(),
                wanted: "at least two sweep points",
            });
        }
        let step = (stop - start) / (n - 1) as f64;
        Ok((0..n).map(|i| start + step * i as f64).collect())
    }
}

#[async_trait]
impl Instrument for SpectrumAnalyzer {
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
        // Binary trace transfers, host byte order.
        self.session.write(":FORMat REAL,64").await?;
        self.session.write(":FORMat:BORDer SWAPped").await?;
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
            self.freq_start.info(),
            self.freq_stop.info(),
            self.freq_center.info(),
            self.span.info(),
            self.rbw.info(),
            self.vbw.info(),
            self.sweep_time.info(),
            self.avg_en.info(),
            self.avg_count.info(),
            self.y_unit.info(),
            self.cont_trigger.info(),
            self.npoints.info(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    async fn analyzer() -> (SpectrumAnalyzer, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        h.set_reply("*IDN?", "Agilent Technologies,N9010A,MY51234567,A.14.06");
        h.set_reply(":FREQuency:STARt? MINimum", "9");
        h.set_reply(":FREQuency:STOP? MAXimum", "26500000000");
        let a = SpectrumAnalyzer::connect("exa1", ScpiSession::new(Box::new(t)))
            .await
            .unwrap();
        (a, h)
    }

    #[tokio::test]
    async fn initialize_selects_binary_format() {
        let (mut a, h) = analyzer().await;
        h.set_reply("SYSTem:ERRor?", "0,\"No error\"");
        a.initialize().await.unwrap();
        assert!(h.saw(":FORMat REAL,64"));
        assert!(h.saw(":FORMat:BORDer SWAPped"));
    }

    #[tokio::test]
    async fn trace_fetch_decodes_binary_blocks() {
        let (a, h) = analyzer().await;
        let mut payload = Vec::new();
        for v in [-10.0f64, -12.5, -90.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        h.set_reply_bytes("TRACe? TRACE1", block::encode_block(&payload));
        assert_eq!(a.fetch_trace(1).await.unwrap(), vec![-10.0, -12.5, -90.0]);
    }

    #[tokio::test]
    async fn freq_axis_spans_start_to_stop() {
        let (a, h) = analyzer().await;
        h.set_reply(":FREQuency:STARt?", "1000000000");
        h.set_reply(":FREQuency:STOP?", "2000000000");
        h.set_reply(":SWEep:POINts?", "5");
        a.freq_start.set(1e9).await.unwrap();
        a.freq_stop.set(2e9).await.unwrap();
        a.npoints.set(5).await.unwrap();

        let axis = a.freq_axis().await.unwrap();
        assert_eq!(axis, vec![1e9, 1.25e9, 1.5e9, 1.75e9, 2e9]);
        // Cached values mean no extra queries beyond the setget reads.
        let stb_count = h
            .transcript()
            .iter()
            .filter(|c| *c == ":SWEep:POINts?")
            .count();
        assert_eq!(stb_count, 1);
    }

    #[tokio::test]
    async fn frequency_limits_come_from_the_probe() {
        let (a, _h) = analyzer().await;
        assert!(a.freq_center.set(30e9).await.is_err());
    }
}
