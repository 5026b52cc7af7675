//! Byte-level transports an instrument session runs over.
//!
//! A [`Transport`] moves raw bytes; it knows nothing about SCPI. Message
//! framing (line terminators, block headers) is handled one layer up by
//! [`crate::scpi::ScpiSession`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ScpiError, ScpiResult};

pub mod mock;
pub mod tcp;

#[cfg(feature = "instrument_serial")]
pub mod serial;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::MockTransport;
pub use tcp::TcpTransport;

#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

/// Default per-operation timeout when the caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Raw byte transport to one instrument.
///
/// Implementations are used behind a single `tokio::sync::Mutex`, so methods
/// take `&mut self` and need not be re-entrant.
#[async_trait]
pub trait Transport: Send {
    /// The resource string this transport was opened with.
    fn resource(&self) -> &str;

    /// Whether the transport is currently usable.
    fn connected(&self) -> bool;

    /// Per-operation timeout.
    fn timeout(&self) -> Duration;

    /// Change the per-operation timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Send bytes, including any terminator the caller framed in.
    async fn write_raw(&mut self, data: &[u8]) -> ScpiResult<()>;

    /// Read until (and including) `delim`, or error on timeout.
    async fn read_until(&mut self, delim: u8) -> ScpiResult<Vec<u8>>;

    /// Read exactly `n` bytes, or error on timeout.
    async fn read_exact(&mut self, n: usize) -> ScpiResult<Vec<u8>>;

    /// Close the connection. Further operations return `NotConnected`.
    async fn close(&mut self) -> ScpiResult<()>;
}

/// Open a transport from a VISA-style resource string.
///
/// `TCPIP...::SOCKET` resources use the native TCP transport, `ASRL`
/// resources the serial transport, and everything else (GPIB, USB, VXI-11
/// TCPIP instruments) goes through the VISA library when the
/// `instrument_visa` feature is enabled.
pub async fn open_resource(resource: &str, timeout: Duration) -> ScpiResult<Box<dyn Transport>> {
    let upper = resource.to_ascii_uppercase();
    if upper.starts_with("TCPIP") && upper.ends_with("::SOCKET") {
        let t = TcpTransport::connect(resource, timeout).await?;
        return Ok(Box::new(t));
    }
    if upper.starts_with("ASRL") || upper.starts_with("/DEV/") || upper.starts_with("COM") {
        #[cfg(feature = "instrument_serial")]
        {
            let t = serial::SerialTransport::open(resource, timeout).await?;
            return Ok(Box::new(t));
        }
        #[cfg(not(feature = "instrument_serial"))]
        return Err(ScpiError::FeatureNotEnabled(
            "serial transport requires --features instrument_serial".into(),
        ));
    }
    #[cfg(feature = "instrument_visa")]
    {
        let t = visa::VisaTransport::open(resource, timeout).await?;
        return Ok(Box::new(t));
    }
    #[cfg(not(feature = "instrument_visa"))]
    return Err(ScpiError::UnsupportedResource(format!(
        "{resource} (VISA support not enabled; rebuild with --features instrument_visa)"
    )));
}
