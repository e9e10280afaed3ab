//! Host-side protocol engine for flashing Espressif ESP-family
//! microcontrollers (ESP8266, ESP32, and the S2/S3/C2/C3/C6/H2 variants)
//! over the Espressif serial bootloader protocol.
//!
//! This crate implements the wire protocol only: SLIP framing, the
//! command/response codec, the chip-identity registry, and the protocol
//! engine's lifecycle and flashing operations. It is deliberately silent
//! about *how* bytes reach the device ([`transport::Transport`] is a trait
//! the caller implements) and about where stub images or progress UI come
//! from.

pub mod checksum;
pub mod chip;
pub mod command;
pub mod engine;
pub mod error;
pub mod frame;
pub mod progress;
pub mod slip;
pub mod stub;
pub mod trace;
pub mod transport;

pub use chip::{Chip, ChipInfo, FlashRegion};
pub use engine::{EngineConfig, LifecycleState, ProtocolEngine, BAUD_115200, BAUD_460800, BAUD_921600};
pub use error::{ConnectionError, Error, RomError, RomErrorKind};
pub use progress::{NullProgress, ProgressSink};
pub use stub::StubBlob;
pub use transport::Transport;
