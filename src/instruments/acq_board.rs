//! FPGA spectrum/correlation capture board, controlled over a raw TCP
//! socket with a SCPI-like `CONFIG:`/`STATUS:`/`DATA:` vocabulary.
//!
//! The board family has two front ends with different sampling windows; the
//! board type is probed at connect and sets the sampling-rate limits. The
//! board has no IEEE-488.2 status model, so completion is detected by
//! polling `STATUS:RESULT_AVAILABLE?`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Instrument, InstrumentState};
use crate::error::{ScpiError, ScpiResult};
use crate::scpi::block::{self, ByteOrder};
use crate::scpi::device::DeviceInfo;
use crate::scpi::{ChoiceStrings, Identity, ScpiDevice, ScpiSession};

const RESULT_POLL: Duration = Duration::from_millis(50);

/// Front-end variant, probed from the board at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    /// 8-bit converter, 1000 to 3000 MS/s.
    Adc8,
    /// 14-bit converter, 20 to 400 MS/s.
    Adc14,
}

impl BoardType {
    fn parse(s: &str) -> ScpiResult<Self> {
        match s.trim() {
            "ADC8" => Ok(Self::Adc8),
            "ADC14" => Ok(Self::Adc14),
            other => Err(ScpiError::UnexpectedIdentity(format!(
                "unknown board type {other:?}"
            ))),
        }
    }

    /// Sampling-rate window in MS/s.
    fn sampling_limits(self) -> (f64, f64) {
        match self {
            Self::Adc8 => (1000.0, 3000.0),
            Self::Adc14 => (20.0, 400.0),
        }
    }
}

/// Capture board driver.
pub struct AcqBoard {
    id: String,
    state: InstrumentState,
    identity: Identity,
    session: ScpiSession,
    board_type: BoardType,
    /// Operating mode.
    pub op_mode: ScpiDevice<String>,
    /// Sampling rate in MS/s; limits depend on the board type.
    pub sampling_rate: ScpiDevice<f64>,
    /// Sample clock source.
    pub clock_source: ScpiDevice<String>,
    /// Megasamples per acquisition.
    pub nb_msample: ScpiDevice<i64>,
    /// Single or dual channel capture.
    pub chan_mode: ScpiDevice<String>,
    /// Active channel in single-channel mode.
    pub chan_nb: ScpiDevice<i64>,
    /// Test pattern generator.
    pub test_mode_en: ScpiDevice<bool>,
    /// Board state string (STATUS:STATE?).
    pub board_status: ScpiDevice<String>,
    /// Whether a completed result is waiting.
    pub result_available: ScpiDevice<bool>,
    /// First moment of the histogram result.
    pub hist_m1: ScpiDevice<f64>,
    /// Second moment of the histogram result.
    pub hist_m2: ScpiDevice<f64>,
    /// Third moment of the histogram result.
    pub hist_m3: ScpiDevice<f64>,
}

impl AcqBoard {
    /// Probe the board type and build the device catalog.
    pub async fn connect(id: &str, session: ScpiSession) -> Result<Self> {
        let identity = session
            .idn()
            .await
            .with_context(|| format!("identifying acq_board {id:?}"))?;
        let type_reply = session
            .ask("CONFIG:BOARD_TYPE?")
            .await
            .context("probing board type")?;
        let board_type = BoardType::parse(&type_reply)?;
        let (rate_min, rate_max) = board_type.sampling_limits();
        debug!(id, ?board_type, "board type probed");

        Ok(Self {
            id: id.to_string(),
            state: InstrumentState::Uninitialized,
            identity,
            board_type,
            op_mode: ScpiDevice::new(session.clone(), "op_mode", "CONFIG:OP_MODE").with_choices(
                ChoiceStrings::new(["Acq", "Corr", "Cust", "Hist", "Net", "Osc", "Spec"]),
            ),
            sampling_rate: ScpiDevice::new(session.clone(), "sampling_rate", "CONFIG:SAMPLING_RATE")
                .with_min(rate_min)
                .with_max(rate_max)
                .with_unit("MS/s"),
            clock_source: ScpiDevice::new(session.clone(), "clock_source", "CONFIG:CLOCK_SOURCE")
                .with_choices(ChoiceStrings::new(["Internal", "External", "USB"])),
            nb_msample: ScpiDevice::new(session.clone(), "nb_msample", "CONFIG:NB_MSAMPLE")
                .with_min(32.0)
                .with_max(65_535.0),
            chan_mode: ScpiDevice::new(session.clone(), "chan_mode", "CONFIG:CHAN_MODE")
                .with_choices(ChoiceStrings::new(["Single", "Dual"])),
            chan_nb: ScpiDevice::new(session.clone(), "chan_nb", "CONFIG:CHAN_NB")
                .with_min(1.0)
                .with_max(2.0),
            // The board's boolean dialect is "True"/"False", not 1/0.
            test_mode_en: ScpiDevice::new(session.clone(), "test_mode_en", "CONFIG:TEST_MODE")
                .with_fmt(|v| if *v { "True" } else { "False" }.to_string()),
            board_status: ScpiDevice::get_only(session.clone(), "board_status", "STATUS:STATE?"),
            result_available: ScpiDevice::get_only(
                session.clone(),
                "result_available",
                "STATUS:RESULT_AVAILABLE?",
            ),
            hist_m1: ScpiDevice::get_only(session.clone(), "hist_m1", "DATA:HIST:M1?"),
            hist_m2: ScpiDevice::get_only(session.clone(), "hist_m2", "DATA:HIST:M2?"),
            hist_m3: ScpiDevice::get_only(session.clone(), "hist_m3", "DATA:HIST:M3?"),
            session,
        })
    }

    /// Probed front-end variant.
    pub fn board_type(&self) -> BoardType {
        self.board_type
    }

    /// Confirm the configuration and start an acquisition.
    pub async fn run(&self) -> ScpiResult<()> {
        self.session.write("STATUS:CONFIG_OK True").await?;
        self.session.write("RUN").await
    }

    /// Poll until a result is available.
    pub async fn wait_result(&self, timeout: Duration) -> ScpiResult<()> {
        let start = Instant::now();
        loop {
            if self.result_available.get().await? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(ScpiError::TriggerTimeout(timeout));
            }
            tokio::time::sleep(RESULT_POLL).await;
        }
    }

    /// Start an acquisition and wait for the result.
    pub async fn run_and_wait(&self, timeout: Duration) -> ScpiResult<()> {
        self.run().await?;
        self.wait_result(timeout).await
    }

    /// The three histogram moments of the last result.
    pub async fn histogram_moments(&self) -> ScpiResult<(f64, f64, f64)> {
        Ok((
            self.hist_m1.get().await?,
            self.hist_m2.get().await?,
            self.hist_m3.get().await?,
        ))
    }

    /// Spectrum of the last result, binary block or ASCII depending on the
    /// board firmware.
    pub async fn fetch_spectrum(&self) -> ScpiResult<Vec<f64>> {
        let raw = self.session.ask_raw("DATA:SPECTRUM?").await?;
        block::decode_block_auto_f64(&raw, ByteOrder::Little)
    }
}

#[async_trait]
impl Instrument for AcqBoard {
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
        // The board has no *CLS; a status query confirms the link instead.
        let status = self.board_status.get().await?;
        debug!(id = %self.id, status, "board reachable");
        self.state = InstrumentState::Idle;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = InstrumentState::ShuttingDown;
        if let Err(e) = self.test_mode_en.set(false).await {
            warn!(id = %self.id, error = %e, "could not clear test mode");
        }
        self.session.close().await?;
        Ok(())
    }

    fn configuration(&self) -> Vec<DeviceInfo> {
        vec![
            self.op_mode.info(),
            self.sampling_rate.info(),
            self.clock_source.info(),
            self.nb_msample.info(),
            self.chan_mode.info(),
            self.chan_nb.info(),
            self.test_mode_en.info(),
        ]
    }
}
