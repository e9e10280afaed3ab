//! The byte-transport seam.
//!
//! The concrete serial port driver is explicitly out of scope for this
//! crate: callers bring their own `Transport` implementation (typically a
//! thin wrapper over a `serialport::SerialPort`, a USB CDC handle, or, in
//! tests, [`crate::trace::ReplayTransport`]).

use std::io;

/// A blocking, byte-oriented channel to the device, plus control-line
/// access for bootloader entry/reset sequencing.
///
/// All methods use `std::io::Result` as the uniform error channel; the
/// engine maps `io::Error` into [`crate::error::ConnectionError::TransportIo`].
pub trait Transport {
    /// Read at least one byte into `buf`, returning the number of bytes
    /// read. May return `0` only at end-of-stream; implementations backed
    /// by a live serial port should block until at least one byte is
    /// available or the OS-level read timeout elapses, in which case they
    /// return `io::ErrorKind::TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the entirety of `buf`.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Assert or deassert the DTR/RTS control lines used to sequence the
    /// device into the ROM bootloader or to reset it back to the user
    /// application.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// A hint for how many bytes a single `read` call can be expected to
    /// return without blocking further; used to size intermediate buffers.
    /// Transports that don't know better can rely on the default.
    fn read_buffer_hint(&self) -> usize {
        64
    }
}
