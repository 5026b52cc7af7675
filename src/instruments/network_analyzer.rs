//! Keysight PNA-L vector network analyzer.
//!
//! All sweep settings are channel-scoped through a `{ch}` option.
//! S-parameter data comes back as interleaved real/imaginary 64-bit pairs
//! (`CALCulate{ch}:DATA? SDATA`); formatted data (`FDATA`) is one value per
//! point in the active trace format.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::{Instrument, InstrumentState};
use crate::error::ScpiResult;
use crate::scpi::block::{self, ByteOrder};
use crate::scpi::convert::quote;
use crate::scpi::device::DeviceInfo;
use crate::scpi::{Identity, ScpiDevice, ScpiSession, ScpiType, TriggerProtocol};

const MAX_CHANNEL: i64 = 32;

fn ch_dev<T: ScpiType>(session: &ScpiSession, name: &str, cmd: &str) -> ScpiDevice<T> {
    ScpiDevice::new(session.clone(), name, cmd)
        .with_option("ch", "1")
        .with_option_limit("ch", 1, MAX_CHANNEL)
}

/// Network analyzer driver.
pub struct NetworkAnalyzer {
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
    /// IF bandwidth in Hz.
    pub bandwidth: ScpiDevice<f64>,
    /// Sweep point count.
    pub npoints: ScpiDevice<usize>,
    /// Sweep time in seconds.
    pub sweep_time: ScpiDevice<f64>,
    /// Free-running versus triggered sweeps.
    pub cont_trigger: ScpiDevice<bool>,
}

impl NetworkAnalyzer {
    /// Verify identity and build the channel-scoped device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying network_analyzer {id:?}"))?;

        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            trigger: TriggerProtocol::new(session.clone()),
            freq_start: ch_dev(&session, "freq_start", "SENSe{ch}:FREQuency:STARt")
                .with_min(10e6)
                .with_max(40e9)
                .with_setget()
                .with_unit("Hz"),
            freq_stop: ch_dev(&session, "freq_stop", "SENSe{ch}:FREQuency:STOP")
                .with_min(10e6)
                .with_max(40e9)
                .with_setget()
                .with_unit("Hz"),
            freq_center: ch_dev(&session, "freq_center", "SENSe{ch}:FREQuency:CENTer")
                .with_min(10e6)
                .with_max(40e9)
                .with_setget()
                .with_unit("Hz"),
            span: ch_dev(&session, "span", "SENSe{ch}:FREQuency:SPAN")
                .with_min(0.0)
                .with_max(40e9)
                .with_setget()
                .with_unit("Hz"),
            bandwidth: ch_dev(&session, "bandwidth", "SENSe{ch}:BANDwidth")
                .with_setget()
                .with_unit("Hz"),
            npoints: ch_dev(&session, "npoints", "SENSe{ch}:SWEep:POINts")
                .with_min(1.0)
                .with_max(32_001.0)
                .with_setget(),
            sweep_time: ch_dev(&session, "sweep_time", "SENSe{ch}:SWEep:TIME")
                .with_setget()
                .with_unit("s"),
            cont_trigger: ScpiDevice::new(session.clone(), "cont_trigger", "INITiate:CONTinuous"),
            session,
        })
    }

    /// Make a named measurement the active trace on a channel.
    pub async fn select_trace(&self, ch: u8, name: &str) -> ScpiResult<()> {
        self.session
            .write(&format!("CALCulate{ch}:PARameter:SELect {}", quote(name)))
            .await
    }

    /// Formatted data of the active trace (one value per point).
    pub async fn fetch_fdata(&self, ch: u8) -> ScpiResult<Vec<f64>> {
        let raw = self
            .session
            .ask_raw(&format!("CALCulate{ch}:DATA? FDATA"))
            .await?;
        block::decode_block_auto_f64(&raw, ByteOrder::Little)
    }

    /// Complex data of the active trace as (re, im) pairs.
    pub async fn fetch_sdata(&self, ch: u8) -> ScpiResult<Vec<(f64, f64)>> {
        let raw = self
            .session
            .ask_raw(&format!("CALCulate{ch}:DATA? SDATA"))
            .await?;
        block::complex_pairs(&block::decode_block_auto_f64(&raw, ByteOrder::Little)?)
    }

    /// Stimulus axis of a channel in Hz.
    pub async fn fetch_x_axis(&self, ch: u8) -> ScpiResult<Vec<f64>> {
        let raw = self.session.ask_raw(&format!("SENSe{ch}:X?")).await?;
        block::decode_block_auto_f64(&raw, ByteOrder::Little)
    }

    /// Run one sweep and return the active trace's complex data.
    pub async fn read_sdata(&self, ch: u8, timeout: Duration) -> ScpiResult<Vec<(f64, f64)>> {
        self.trigger.run_and_wait(timeout).await?;
        self.fetch_sdata(ch).await
    }
}

#[async_trait]
impl Instrument for NetworkAnalyzer {
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
        self.session.write("FORMat REAL,64").await?;
        self.session.write("FORMat:BORDer SWAPped").await?;
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
            self.bandwidth.info(),
            self.npoints.info(),
            self.sweep_time.info(),
            self.cont_trigger.info(),
        ]
    }
}
