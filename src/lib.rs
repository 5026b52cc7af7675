//! SCPI instrument drivers with declarative device mappings.
//!
//! The crate is layered: a [`transport`] moves bytes, a
//! [`scpi::ScpiSession`] frames SCPI messages over it, and drivers in
//! [`instruments`] expose instrument properties as named
//! [`scpi::ScpiDevice`]s with validation, caching and typed conversion.
//! Triggered measurements use the status-byte polling protocol in
//! [`scpi::trigger`]; binary trace data goes through [`scpi::block`].
//!
//! ```no_run
//! use std::time::Duration;
//! use rust_scpi::instruments::RfGenerator;
//! use rust_scpi::scpi::ScpiSession;
//! use rust_scpi::transport::open_resource;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport =
//!     open_resource("TCPIP0::192.168.1.20::5025::SOCKET", Duration::from_secs(3)).await?;
//! let gen = RfGenerator::connect("gen1", ScpiSession::new(transport)).await?;
//! gen.freq_cw.set(5.0e9).await?;
//! gen.rf_en.set(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instruments;
pub mod scpi;
pub mod transport;

pub use config::Settings;
pub use error::{ScpiError, ScpiResult};
pub use instruments::{Instrument, InstrumentRegistry, InstrumentState};
pub use scpi::{Identity, ScpiDevice, ScpiSession, TriggerProtocol};
