//! VISA transport for GPIB, USB-TMC and VXI-11 instruments.
//!
//! Wraps the `visa-rs` crate; VISA calls are synchronous, so every operation
//! runs on Tokio's blocking executor. Bytes the library returns beyond what
//! the caller asked for are kept in a local buffer so mixed line/block reads
//! do not lose data.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::{DefaultRM, Instrument};

use super::Transport;
use crate::error::{ScpiError, ScpiResult};

const READ_CHUNK: usize = 4096;

/// VISA instrument transport.
pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    instrument: Option<Arc<Mutex<Box<dyn Instrument>>>>,
    /// Bytes received but not yet consumed by the caller.
    pending: Vec<u8>,
}

impl VisaTransport {
    /// Open a VISA resource (e.g. `GPIB0::11::INSTR`,
    /// `USB0::0x0957::0x1F01::MY12345678::INSTR`).
    pub async fn open(resource: &str, timeout: Duration) -> ScpiResult<Self> {
        let resource_str = resource.to_string();
        let timeout_ms = timeout.as_millis() as u32;
        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| {
                ScpiError::NotConnected(format!("cannot create VISA resource manager: {e}"))
            })?;
            rm.open(&resource_str, timeout_ms, 0).map_err(|e| {
                ScpiError::NotConnected(format!("cannot open VISA resource {resource_str}: {e}"))
            })
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("VISA open task failed: {e}")))??;
        debug!(resource, timeout_ms, "VISA resource opened");
        Ok(Self {
            resource: resource.to_string(),
            timeout,
            instrument: Some(Arc::new(Mutex::new(instrument))),
            pending: Vec::new(),
        })
    }

    fn instrument(&self) -> ScpiResult<Arc<Mutex<Box<dyn Instrument>>>> {
        self.instrument
            .as_ref()
            .cloned()
            .ok_or_else(|| ScpiError::NotConnected(self.resource.clone()))
    }

    /// Pull one chunk from the instrument into the pending buffer.
    async fn fill(&mut self) -> ScpiResult<()> {
        let instrument = self.instrument()?;
        let timeout_ms = self.timeout.as_millis() as u32;
        let chunk = tokio::task::spawn_blocking(move || -> ScpiResult<Vec<u8>> {
            let mut guard = instrument.blocking_lock();
            guard
                .set_timeout(timeout_ms)
                .map_err(|e| ScpiError::NotConnected(format!("cannot set VISA timeout: {e}")))?;
            let mut buf = vec![0u8; READ_CHUNK];
            let n = guard
                .read(&mut buf)
                .map_err(|e| ScpiError::NotConnected(format!("VISA read failed: {e}")))?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("VISA I/O task failed: {e}")))??;
        if chunk.is_empty() {
            return Err(ScpiError::ReadTimeout(self.timeout));
        }
        self.pending.extend_from_slice(&chunk);
        Ok(())
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn connected(&self) -> bool {
        self.instrument.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write_raw(&mut self, data: &[u8]) -> ScpiResult<()> {
        let instrument = self.instrument()?;
        let timeout_ms = self.timeout.as_millis() as u32;
        let payload = data.to_vec();
        tokio::task::spawn_blocking(move || -> ScpiResult<()> {
            let mut guard = instrument.blocking_lock();
            guard
                .set_timeout(timeout_ms)
                .map_err(|e| ScpiError::NotConnected(format!("cannot set VISA timeout: {e}")))?;
            guard
                .write_all(&payload)
                .map_err(|e| ScpiError::NotConnected(format!("VISA write failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("VISA I/O task failed: {e}")))?
    }

    async fn read_until(&mut self, delim: u8) -> ScpiResult<Vec<u8>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == delim) {
                let rest = self.pending.split_off(pos + 1);
                let out = std::mem::replace(&mut self.pending, rest);
                return Ok(out);
            }
            self.fill().await?;
        }
    }

    async fn read_exact(&mut self, n: usize) -> ScpiResult<Vec<u8>> {
        while self.pending.len() < n {
            self.fill().await?;
        }
        let rest = self.pending.split_off(n);
        Ok(std::mem::replace(&mut self.pending, rest))
    }

    async fn close(&mut self) -> ScpiResult<()> {
        if self.instrument.take().is_some() {
            debug!(resource = %self.resource, "VISA resource closed");
        }
        self.pending.clear();
        Ok(())
    }
}
