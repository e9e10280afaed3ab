//! Library errors.
//!
//! Mirrors the shape of a typical `espflash`-style error taxonomy: a
//! top-level [`Error`] wraps a [`ConnectionError`] for everything below the
//! wire (timeouts, sync failure, transport I/O, illegal state transitions)
//! or a [`RomError`] for failures the chip itself reported.

use std::io;

use thiserror::Error;

use crate::command::CommandType;

/// All errors this crate can return.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A connection-level failure: timeout, sync failure, transport I/O, or
    /// an operation attempted in the wrong lifecycle state.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The chip (ROM or stub) reported a non-zero status for a command.
    #[error(transparent)]
    Rom(#[from] RomError),

    /// `detect_chip` read a magic value with no matching entry in the chip
    /// registry.
    #[error("unrecognized chip magic value: {0:#010x}")]
    UnknownChip(u32),

    /// A digest computed locally does not match the one the device
    /// reported.
    #[error("MD5 mismatch: expected {expected}, computed {computed}")]
    Md5Mismatch {
        /// Digest reported by the device, as lowercase hex.
        expected: String,
        /// Digest computed from the bytes the host sent or received.
        computed: String,
    },

    /// A response frame could not be parsed into a
    /// [`CommandResponse`](crate::command::CommandResponse).
    #[error("malformed response to {0} command")]
    MalformedResponse(CommandType),

    /// The stub blob's structured document was invalid (bad base64,
    /// missing key, wrong length, ...).
    #[error("invalid stub blob: {0}")]
    InvalidStubBlob(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors: everything that isn't a chip-reported
/// failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// A command's response did not arrive before its deadline.
    #[error("timeout waiting for response to {0}")]
    Timeout(CommandType),

    /// `sync` exhausted all attempts without a successful reply.
    #[error("sync failed after {0} attempts")]
    SyncFailure(usize),

    /// A received frame had invalid SLIP framing or overflowed the read
    /// buffer.
    #[error("received packet has invalid framing")]
    FramingError,

    /// Transport `read`/`write`/`set_control_lines` failed.
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] io::Error),

    /// A stub-only command was issued before the stub was loaded, or a
    /// command requires a lifecycle state the engine has not reached.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Waiting for the stub's `OHAI` handshake timed out or saw the wrong
    /// bytes.
    #[error("stub did not signal readiness (OHAI handshake not observed)")]
    StubHandshakeFailed,
}

/// Errors originating from a device's ROM or stub functionality.
///
/// The ROM and stub loaders use disjoint error-code tables; which table an
/// error code is decoded against depends on which one produced the
/// response.
#[derive(Debug, Clone, Copy, Error)]
#[non_exhaustive]
pub enum RomErrorKind {
    /// Invalid message received (ROM code `0x05`).
    #[error("invalid message received")]
    InvalidMessage,
    /// Bootloader failed to execute command (ROM code `0x06`).
    #[error("bootloader failed to execute command")]
    FailedToAct,
    /// Received message has invalid CRC (ROM code `0x07`).
    #[error("received message has invalid CRC")]
    InvalidCrc,
    /// Bootloader failed to write to flash (ROM code `0x08`).
    #[error("bootloader failed to write to flash")]
    FlashWriteError,
    /// Bootloader failed to read from flash (ROM code `0x09`).
    #[error("bootloader failed to read from flash")]
    FlashReadError,
    /// Invalid length for flash read (ROM code `0x0a`).
    #[error("invalid length for flash read")]
    FlashReadLengthError,
    /// Malformed compressed data received (ROM code `0x0b`).
    #[error("malformed compressed data received")]
    DeflateError,
    /// Bad data length (stub code `0xc0`).
    #[error("bad data length")]
    BadDataLen,
    /// Bad data checksum (stub code `0xc1`).
    #[error("bad data checksum")]
    BadDataChecksum,
    /// Bad block size (stub code `0xc2`).
    #[error("bad block size")]
    BadBlockSize,
    /// Invalid command (stub code `0xc3`).
    #[error("invalid command")]
    InvalidCommand,
    /// SPI operation failed (stub code `0xc4`).
    #[error("SPI operation failed")]
    FailedSpiOp,
    /// Not in flash mode (stub code `0xc6`).
    #[error("not in flash mode")]
    NotInFlashMode,
    /// Any error code not present in the known table.
    #[error("unrecognized error code {0:#04x}")]
    Other(u8),
}

impl RomErrorKind {
    /// Decode against the ROM loader's error-code table.
    pub fn from_rom_code(code: u8) -> Self {
        match code {
            0x05 => Self::InvalidMessage,
            0x06 => Self::FailedToAct,
            0x07 => Self::InvalidCrc,
            0x08 => Self::FlashWriteError,
            0x09 => Self::FlashReadError,
            0x0a => Self::FlashReadLengthError,
            0x0b => Self::DeflateError,
            other => Self::Other(other),
        }
    }

    /// Decode against the stub loader's error-code table.
    pub fn from_stub_code(code: u8) -> Self {
        match code {
            0xc0 => Self::BadDataLen,
            0xc1 => Self::BadDataChecksum,
            0xc2 => Self::BadBlockSize,
            0xc3 => Self::InvalidCommand,
            0xc4 => Self::FailedSpiOp,
            0xc6 => Self::NotInFlashMode,
            other => Self::Other(other),
        }
    }
}

/// An error reported by the chip in response to a specific command.
#[derive(Debug, Clone, Copy, Error)]
#[error("{command} command failed: {kind}")]
pub struct RomError {
    command: CommandType,
    kind: RomErrorKind,
}

impl RomError {
    /// Build a [`RomError`] for the given command and decoded kind.
    pub fn new(command: CommandType, kind: RomErrorKind) -> Self {
        RomError { command, kind }
    }

    /// The command the error was reported against.
    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The decoded error kind.
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Tag a timeout with the command it occurred during, so the caller
    /// sees which opcode timed out rather than a placeholder.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command)))
            }
            res => res,
        }
    }
}
