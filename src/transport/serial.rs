//! RS-232 transport using the `serialport` crate.
//!
//! The crate only offers blocking I/O, so every operation runs on Tokio's
//! blocking executor. The port uses a short internal read timeout and the
//! overall deadline is enforced in the read loop.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::debug;

use super::Transport;
use crate::error::{ScpiError, ScpiResult};

const DEFAULT_BAUD: u32 = 9600;

/// Serial port transport.
pub struct SerialTransport {
    resource: String,
    port_name: String,
    timeout: Duration,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open a serial resource at 9600 baud.
    ///
    /// Accepts `ASRL/dev/ttyUSB0::INSTR` style resources or a bare port
    /// path (`/dev/ttyUSB0`, `COM3`).
    pub async fn open(resource: &str, timeout: Duration) -> ScpiResult<Self> {
        Self::open_with_baud(resource, DEFAULT_BAUD, timeout).await
    }

    /// Open a serial resource at an explicit baud rate.
    pub async fn open_with_baud(
        resource: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> ScpiResult<Self> {
        let port_name = parse_serial_resource(resource)?;
        let name = port_name.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("serial open task failed: {e}")))?
        .map_err(|e| {
            ScpiError::NotConnected(format!("cannot open serial port {port_name}: {e}"))
        })?;
        debug!(port = %port_name, baud_rate, "serial port opened");
        Ok(Self {
            resource: resource.to_string(),
            port_name,
            timeout,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn port(&self) -> ScpiResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .cloned()
            .ok_or_else(|| ScpiError::NotConnected(self.resource.clone()))
    }

    /// Read bytes one at a time until `stop` says the message is complete.
    async fn read_with<F>(&mut self, capacity: usize, mut stop: F) -> ScpiResult<Vec<u8>>
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        let port = self.port()?;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || -> ScpiResult<Vec<u8>> {
            let mut guard = port.blocking_lock();
            let mut out = Vec::with_capacity(capacity);
            let mut byte = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(ScpiError::ReadTimeout(timeout));
                }
                match guard.read(&mut byte) {
                    Ok(1) => {
                        out.push(byte[0]);
                        if stop(&out) {
                            return Ok(out);
                        }
                    }
                    Ok(_) => {
                        return Err(ScpiError::NotConnected(
                            "unexpected EOF on serial port".into(),
                        ))
                    }
                    // Port timeout is shorter than the overall deadline
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(ScpiError::Io(e)),
                }
            }
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("serial I/O task failed: {e}")))?
    }
}

/// Extract the port path from `ASRL<path>::INSTR` or return the input as-is.
fn parse_serial_resource(resource: &str) -> ScpiResult<String> {
    if let Some(rest) = resource.strip_prefix("ASRL") {
        let path = rest.strip_suffix("::INSTR").unwrap_or(rest);
        if path.is_empty() {
            return Err(ScpiError::UnsupportedResource(resource.to_string()));
        }
        return Ok(path.to_string());
    }
    Ok(resource.to_string())
}

#[async_trait]
impl Transport for SerialTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn connected(&self) -> bool {
        self.port.is_some()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write_raw(&mut self, data: &[u8]) -> ScpiResult<()> {
        let port = self.port()?;
        let payload = data.to_vec();
        tokio::task::spawn_blocking(move || -> ScpiResult<()> {
            let mut guard = port.blocking_lock();
            guard.write_all(&payload)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ScpiError::NotConnected(format!("serial I/O task failed: {e}")))?
    }

    async fn read_until(&mut self, delim: u8) -> ScpiResult<Vec<u8>> {
        self.read_with(64, move |buf| buf.last() == Some(&delim))
            .await
    }

    async fn read_exact(&mut self, n: usize) -> ScpiResult<Vec<u8>> {
        self.read_with(n, move |buf| buf.len() >= n).await
    }

    async fn close(&mut self) -> ScpiResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_parsing() {
        assert_eq!(
            parse_serial_resource("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            "/dev/ttyUSB0"
        );
        assert_eq!(parse_serial_resource("COM3").unwrap(), "COM3");
        assert!(parse_serial_resource("ASRL").is_err());
    }

    #[test]
    fn default_baud_is_sane() {
        assert_eq!(DEFAULT_BAUD, 9600);
    }
}
