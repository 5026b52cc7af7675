//! SCPI message layer: session, value conversion, declarative devices,
//! block data and the asynchronous trigger protocol.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{ScpiError, ScpiResult};
use crate::transport::Transport;

pub mod block;
pub mod choices;
pub mod convert;
pub mod device;
pub mod trigger;

pub use choices::ChoiceStrings;
pub use convert::ScpiType;
pub use device::ScpiDevice;
pub use trigger::TriggerProtocol;

/// IEEE-488.2 status byte bits this crate cares about.
pub mod status {
    /// Message available in the output queue.
    pub const MAV: u8 = 0x10;
    /// Event status bit (summary of the event status register).
    pub const ESB: u8 = 0x20;
    /// Request-service / master summary bit.
    pub const RQS: u8 = 0x40;
}

/// Event status register bits (`*ESR?`).
pub mod esr {
    /// Operation complete.
    pub const OPC: u8 = 0x01;
}

static SYST_ERR_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(r#"^\s*([+-]?\d+)\s*,\s*"(.*)"\s*$"#).expect("static regex");
    re
});

/// Parsed `*IDN?` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer field.
    pub vendor: String,
    /// Model field.
    pub model: String,
    /// Serial number field.
    pub serial: String,
    /// Firmware revision field.
    pub firmware: String,
}

impl Identity {
    /// Parse the conventional four comma-separated `*IDN?` fields.
    pub fn parse(line: &str) -> ScpiResult<Self> {
        let (vendor, model, serial, firmware): (String, String, String, String) =
            prse::try_parse!(line, "{},{},{},{}").map_err(|_| ScpiError::ParseResponse {
                text: line.to_string(),
                wanted: "identity (vendor,model,serial,firmware)",
            })?;
        Ok(Self {
            vendor: vendor.trim().to_string(),
            model: model.trim().to_string(),
            serial: serial.trim().to_string(),
            firmware: firmware.trim().to_string(),
        })
    }
}

/// Shared handle to one instrument's message channel.
///
/// Clones share the same transport behind one async mutex; a query holds the
/// lock across its write and read so concurrent tasks cannot interleave.
#[derive(Clone)]
pub struct ScpiSession {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    resource: String,
}

impl ScpiSession {
    /// Wrap a transport into a session.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let resource = transport.resource().to_string();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            resource,
        }
    }

    /// Resource string of the underlying transport.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Change the transport's per-operation timeout.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.transport.lock().await.set_timeout(timeout);
    }

    /// Current transport timeout.
    pub async fn timeout(&self) -> Duration {
        self.transport.lock().await.timeout()
    }

    /// Send a command, no response expected.
    pub async fn write(&self, cmd: &str) -> ScpiResult<()> {
        trace!(resource = %self.resource, cmd, "write");
        let mut t = self.transport.lock().await;
        t.write_raw(format!("{cmd}\n").as_bytes()).await
    }

    /// Send a query and read one line back, trimmed.
    pub async fn ask(&self, cmd: &str) -> ScpiResult<String> {
        let mut t = self.transport.lock().await;
        t.write_raw(format!("{cmd}\n").as_bytes()).await?;
        let raw = t.read_until(b'\n').await?;
        drop(t);
        let text = String::from_utf8_lossy(&raw).trim().to_string();
        trace!(resource = %self.resource, cmd, reply = %text, "ask");
        Ok(text)
    }

    /// Send a query and read the raw response, block-aware.
    ///
    /// If the reply starts with `#` the definite-length header is parsed and
    /// exactly the advertised payload is read, so binary data containing
    /// newline bytes survives intact. The returned buffer includes the
    /// header; decode it with [`block::decode_block`]. Plain replies are
    /// returned up to the terminating newline, with the terminator trimmed.
    pub async fn ask_raw(&self, cmd: &str) -> ScpiResult<Vec<u8>> {
        let mut t = self.transport.lock().await;
        t.write_raw(format!("{cmd}\n").as_bytes()).await?;
        let first = t.read_exact(1).await?;
        if first != b"#" {
            let mut rest = t.read_until(b'\n').await?;
            drop(t);
            let mut out = first;
            out.append(&mut rest);
            while matches!(out.last(), Some(b'\n' | b'\r')) {
                out.pop();
            }
            return Ok(out);
        }
        let ndigits_raw = t.read_exact(1).await?;
        let ndigits = (ndigits_raw[0] as char)
            .to_digit(10)
            .ok_or_else(|| ScpiError::BadBlock("header digit count is not a digit".into()))?
            as usize;
        let mut out = Vec::new();
        out.push(b'#');
        out.push(ndigits_raw[0]);
        if ndigits == 0 {
            // Indefinite-length block: data runs to the message terminator.
            let mut rest = t.read_until(b'\n').await?;
            drop(t);
            out.append(&mut rest);
            return Ok(out);
        }
        let len_field = t.read_exact(ndigits).await?;
        let nbytes: usize = String::from_utf8_lossy(&len_field)
            .parse()
            .map_err(|_| ScpiError::BadBlock("header length field is not a number".into()))?;
        out.extend_from_slice(&len_field);
        let mut payload = t.read_exact(nbytes).await?;
        out.append(&mut payload);
        // Consume the trailing terminator; a silent instrument here is fine.
        match t.read_until(b'\n').await {
            Ok(_) | Err(ScpiError::ReadTimeout(_)) => {}
            Err(e) => return Err(e),
        }
        drop(t);
        debug!(resource = %self.resource, cmd, bytes = out.len(), "block read");
        Ok(out)
    }

    /// Query and parse the instrument identity (`*IDN?`).
    pub async fn idn(&self) -> ScpiResult<Identity> {
        let line = self.ask("*IDN?").await?;
        Identity::parse(&line)
    }

    /// Instrument reset (`*RST`).
    pub async fn reset(&self) -> ScpiResult<()> {
        self.write("*RST").await
    }

    /// Clear status and error queue (`*CLS`).
    pub async fn clear_status(&self) -> ScpiResult<()> {
        self.write("*CLS").await
    }

    /// Block until all pending operations complete (`*OPC?`).
    pub async fn opc(&self) -> ScpiResult<()> {
        let reply = self.ask("*OPC?").await?;
        if reply.trim() == "1" {
            Ok(())
        } else {
            Err(ScpiError::ParseResponse {
                text: reply,
                wanted: "operation-complete flag",
            })
        }
    }

    /// Read the status byte (`*STB?`).
    pub async fn read_status_byte(&self) -> ScpiResult<u8> {
        let reply = self.ask("*STB?").await?;
        parse_register(&reply, "status byte")
    }

    /// Read and clear the event status register (`*ESR?`).
    pub async fn event_status(&self) -> ScpiResult<u8> {
        let reply = self.ask("*ESR?").await?;
        parse_register(&reply, "event status register")
    }

    /// Pop one entry from the instrument error queue, `None` when empty.
    pub async fn next_error(&self) -> ScpiResult<Option<(i32, String)>> {
        let line = self.ask("SYSTem:ERRor?").await?;
        let caps = SYST_ERR_RE
            .captures(&line)
            .ok_or_else(|| ScpiError::ParseResponse {
                text: line.clone(),
                wanted: "error queue entry",
            })?;
        let code: i32 = caps[1].parse().map_err(|_| ScpiError::ParseResponse {
            text: line.clone(),
            wanted: "error code",
        })?;
        if code == 0 {
            return Ok(None);
        }
        Ok(Some((code, caps[2].to_string())))
    }

    /// Drain the whole error queue.
    pub async fn drain_errors(&self) -> ScpiResult<Vec<(i32, String)>> {
        let mut errors = Vec::new();
        // An instrument error queue is bounded; cap the loop anyway.
        for _ in 0..64 {
            match self.next_error().await? {
                Some(e) => errors.push(e),
                None => break,
            }
        }
        Ok(errors)
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> ScpiResult<()> {
        self.transport.lock().await.close().await
    }
}

fn parse_register(text: &str, wanted: &'static str) -> ScpiResult<u8> {
    // Some instruments answer with a float-formatted integer.
    let value: f64 = text.trim().parse().map_err(|_| ScpiError::ParseResponse {
        text: text.to_string(),
        wanted,
    })?;
    Ok((value as i64 & 0xFF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn session_with_mock() -> (ScpiSession, crate::transport::mock::MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        (ScpiSession::new(Box::new(t)), h)
    }

    #[test]
    fn identity_parsing() {
        let id = Identity::parse("Agilent Technologies, N5183A, MY12345678, C.04.86").unwrap();
        assert_eq!(id.vendor, "Agilent Technologies");
        assert_eq!(id.model, "N5183A");
        assert_eq!(id.serial, "MY12345678");
        assert_eq!(id.firmware, "C.04.86");
        assert!(Identity::parse("garbage").is_err());
    }

    #[tokio::test]
    async fn ask_trims_terminators() {
        let (s, h) = session_with_mock();
        h.set_reply(":FREQuency?", "1000000000\r");
        assert_eq!(s.ask(":FREQuency?").await.unwrap(), "1000000000");
    }

    #[tokio::test]
    async fn ask_raw_reads_definite_block_with_embedded_newlines() {
        let (s, h) = session_with_mock();
        let payload = vec![0x0A, 0x0D, 0x0A, 0xFF];
        let mut reply = b"#14".to_vec();
        reply.extend_from_slice(&payload);
        h.set_reply_bytes("TRACe?", reply.clone());
        let raw = s.ask_raw("TRACe?").await.unwrap();
        assert_eq!(raw, reply);
    }

    #[tokio::test]
    async fn ask_raw_falls_back_to_ascii() {
        let (s, h) = session_with_mock();
        h.set_reply("FETCh?", "1.5,2.5,3.5");
        let raw = s.ask_raw("FETCh?").await.unwrap();
        assert_eq!(raw, b"1.5,2.5,3.5");
    }

    #[tokio::test]
    async fn status_registers_parse_float_replies() {
        let (s, h) = session_with_mock();
        h.set_reply("*STB?", "+96.0");
        assert_eq!(s.read_status_byte().await.unwrap(), 96);
        h.set_reply("*ESR?", "1");
        assert_eq!(s.event_status().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn error_queue_drains_until_zero() {
        let (s, h) = session_with_mock();
        h.queue_reply("SYSTem:ERRor?", "-113,\"Undefined header\"");
        h.queue_reply("SYSTem:ERRor?", "-410,\"Query INTERRUPTED\"");
        h.set_reply("SYSTem:ERRor?", "0,\"No error\"");
        let errors = s.drain_errors().await.unwrap();
        assert_eq!(
            errors,
            vec![
                (-113, "Undefined header".to_string()),
                (-410, "Query INTERRUPTED".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn opc_accepts_only_one() {
        let (s, h) = session_with_mock();
        h.set_reply("*OPC?", "1");
        s.opc().await.unwrap();
        h.set_reply("*OPC?", "0");
        assert!(s.opc().await.is_err());
    }
}
