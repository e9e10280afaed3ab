//! Frame reassembly: turns a stream of raw transport bytes into SLIP frames
//! and waits for one that matches what the caller is expecting.

use std::time::{Duration, Instant};

use crate::command::{CommandResponse, CommandType};
use crate::error::{ConnectionError, Error};
use crate::slip;
use crate::transport::Transport;

#[derive(Debug, PartialEq, Eq)]
enum State {
    OutOfFrame,
    InFrame,
}

/// What a [`FrameReader::wait_for`] call is looking for in each
/// accumulated frame.
pub enum FrameFilter<'a> {
    /// Accept only a response whose opcode matches this command.
    Opcode(CommandType),
    /// Accept any frame without inspecting it as a command/response (the
    /// flash-read streaming path).
    Any,
    /// Accept a frame only if its decoded bytes equal this literal (the
    /// stub's `OHAI` handshake).
    Literal(&'a [u8]),
}

/// Reassembles SLIP frames out of a byte stream and applies a deadline to
/// the search for a frame that satisfies the caller's filter.
///
/// Internally buffers `transport.read_buffer_hint()` bytes at a time rather
/// than reading one byte per transport call.
pub struct FrameReader<'t, T: Transport> {
    transport: &'t mut T,
    state: State,
    current: Vec<u8>,
    scratch: Vec<u8>,
}

impl<'t, T: Transport> FrameReader<'t, T> {
    pub fn new(transport: &'t mut T) -> Self {
        let hint = transport.read_buffer_hint().max(1);
        FrameReader {
            transport,
            state: State::OutOfFrame,
            current: Vec::new(),
            scratch: vec![0u8; hint],
        }
    }

    /// Read frames until one matches `filter` or `deadline` elapses.
    ///
    /// Frames that don't match are silently discarded: this tolerates
    /// pipelined sync echoes and stale data left over from a previous
    /// operation, per the protocol's ordering guarantees.
    pub fn wait_for(
        &mut self,
        filter: FrameFilter<'_>,
        timeout: Duration,
    ) -> Result<RawFrame, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                let opcode = match filter {
                    FrameFilter::Opcode(ct) => ct,
                    _ => CommandType::Sync,
                };
                return Err(Error::Connection(ConnectionError::Timeout(opcode)));
            }
            if let Some(raw) = self.pump_one_frame()? {
                if frame_matches(&raw, &filter) {
                    return Ok(raw);
                }
            }
        }
    }

    /// Feed bytes into the SLIP state machine until exactly one complete
    /// frame has been decoded, or the underlying read times out with
    /// nothing accumulated (in which case `None` is returned so the caller
    /// re-checks its deadline).
    fn pump_one_frame(&mut self) -> Result<Option<RawFrame>, Error> {
        let n = match self.transport.read(&mut self.scratch) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(Error::from(e)),
        };
        for &byte in &self.scratch[..n] {
            match self.state {
                State::OutOfFrame => {
                    if byte == 0xC0 {
                        self.state = State::InFrame;
                        self.current.clear();
                    }
                }
                State::InFrame => {
                    if byte == 0xC0 {
                        if self.current.is_empty() {
                            // Leading delimiter of the frame we're already in; ignore.
                            continue;
                        }
                        let decoded = slip::decode(&self.current);
                        self.current.clear();
                        self.state = State::OutOfFrame;
                        return Ok(Some(RawFrame { bytes: decoded }));
                    }
                    self.current.push(byte);
                }
            }
        }
        Ok(None)
    }
}

/// A decoded SLIP frame's raw bytes, not yet interpreted as a response.
#[derive(Debug)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
}

impl RawFrame {
    pub fn as_response(&self) -> Option<CommandResponse> {
        CommandResponse::parse(&self.bytes)
    }
}

fn frame_matches(raw: &RawFrame, filter: &FrameFilter<'_>) -> bool {
    match filter {
        FrameFilter::Any => true,
        FrameFilter::Literal(pattern) => raw.bytes == *pattern,
        FrameFilter::Opcode(expected) => raw
            .as_response()
            .and_then(|resp| CommandType::from_opcode(resp.opcode))
            .map(|ct| ct == *expected)
            .unwrap_or(false),
    }
}
