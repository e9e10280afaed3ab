//! SLIP trace record/replay: the test harness for driving
//! [`crate::engine::ProtocolEngine`] against recorded device exchanges
//! instead of real hardware.
//!
//! Trace line formats:
//! ```text
//! [<seconds.fff>] >>>> (<len>): HH HH HH …
//! [<seconds.fff>] <<<< (<len>): HH HH HH …
//! [<seconds.fff>] SET_CONTROL_LINES DTR=<bool> RTS=<bool>
//! ```

use std::io;
use std::time::{Duration, Instant};

use crate::transport::Transport;

/// One event parsed out of a trace file.
#[derive(Debug, Clone, PartialEq)]
enum TraceEvent {
    Write { at: f64, bytes: Vec<u8> },
    Read { at: f64, bytes: Vec<u8> },
    SetControlLines { at: f64, dtr: bool, rts: bool },
}

fn parse_hex_bytes(s: &str) -> Vec<u8> {
    s.split_whitespace()
        .map(|tok| u8::from_str_radix(tok, 16).expect("trace contains valid hex bytes"))
        .collect()
}

fn parse_line(line: &str) -> Option<TraceEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let close = line.find(']')?;
    let at: f64 = line[1..close].trim().parse().ok()?;
    let rest = line[close + 1..].trim();

    if let Some(rest) = rest.strip_prefix(">>>> ") {
        let (_, hex) = rest.split_once(": ")?;
        Some(TraceEvent::Write { at, bytes: parse_hex_bytes(hex) })
    } else if let Some(rest) = rest.strip_prefix("<<<< ") {
        let (_, hex) = rest.split_once(": ")?;
        Some(TraceEvent::Read { at, bytes: parse_hex_bytes(hex) })
    } else if let Some(rest) = rest.strip_prefix("SET_CONTROL_LINES ") {
        let mut dtr = None;
        let mut rts = None;
        for field in rest.split_whitespace() {
            if let Some(v) = field.strip_prefix("DTR=") {
                dtr = Some(v == "true");
            } else if let Some(v) = field.strip_prefix("RTS=") {
                rts = Some(v == "true");
            }
        }
        Some(TraceEvent::SetControlLines { at, dtr: dtr?, rts: rts? })
    } else {
        None
    }
}

/// Render a frame (already SLIP-encoded) as a trace line.
fn format_frame_line(prefix: &str, at: f64, bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!("[{at:.3}] {prefix} ({}): {}", bytes.len(), hex.join(" "))
}

/// Wraps a real [`Transport`] and appends every write/read/control-line call
/// to a trace buffer, timestamped relative to when the recorder was
/// created.
pub struct RecordingTransport<T: Transport> {
    inner: T,
    start: Instant,
    lines: Vec<String>,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        RecordingTransport { inner, start: Instant::now(), lines: Vec::new() }
    }

    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Render the recorded trace as text, one record per line.
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

impl<T: Transport> Transport for RecordingTransport<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let at = self.elapsed();
            self.lines.push(format_frame_line("<<<<", at, &buf[..n]));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let at = self.elapsed();
        self.lines.push(format_frame_line(">>>>", at, buf));
        self.inner.write(buf)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        let at = self.elapsed();
        self.lines.push(format!("[{at:.3}] SET_CONTROL_LINES DTR={dtr} RTS={rts}"));
        self.inner.set_control_lines(dtr, rts)
    }

    fn read_buffer_hint(&self) -> usize {
        self.inner.read_buffer_hint()
    }
}

/// Replays a recorded trace against the engine: asserts every `write` call
/// matches the next recorded write byte-for-byte, supplies `read` calls
/// with the next recorded read (after a proportional delay), and asserts
/// every `set_control_lines` call matches the next recorded DTR/RTS pair.
pub struct ReplayTransport {
    events: std::collections::VecDeque<TraceEvent>,
    last_at: f64,
    pending_read: Vec<u8>,
}

/// Empirically chosen scale between a trace's recorded inter-frame gap and
/// the delay this replayer actually sleeps.
const REPLAY_DELAY_SCALE: f64 = 1.1;

impl ReplayTransport {
    /// Parse a trace produced by [`RecordingTransport::render`] (or hand-
    /// authored in the same format).
    pub fn from_trace(trace: &str) -> Self {
        let events = trace.lines().filter_map(parse_line).collect();
        ReplayTransport { events, last_at: 0.0, pending_read: Vec::new() }
    }

    fn pop_event(&mut self) -> Option<TraceEvent> {
        self.events.pop_front()
    }
}

impl Transport for ReplayTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_read.is_empty() {
            match self.pop_event() {
                Some(TraceEvent::Read { at, bytes }) => {
                    let gap_ms = ((at - self.last_at).max(0.0)) * 1000.0;
                    self.last_at = at;
                    let delay_ms = (gap_ms * REPLAY_DELAY_SCALE) as u64;
                    if delay_ms > 0 {
                        std::thread::sleep(Duration::from_millis(delay_ms));
                    }
                    self.pending_read = bytes;
                }
                Some(other) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("trace expected a read next, found {other:?}"),
                    ));
                }
                None => return Err(io::Error::new(io::ErrorKind::TimedOut, "trace exhausted")),
            }
        }
        let n = buf.len().min(self.pending_read.len());
        buf[..n].copy_from_slice(&self.pending_read[..n]);
        self.pending_read.drain(..n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.pop_event() {
            Some(TraceEvent::Write { at, bytes }) => {
                self.last_at = at;
                if bytes != buf {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "write mismatch: trace expected {} bytes, got {} bytes",
                            bytes.len(),
                            buf.len()
                        ),
                    ));
                }
                Ok(())
            }
            Some(other) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("trace expected a write next, found {other:?}"),
            )),
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "trace exhausted, unexpected write")),
        }
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        match self.pop_event() {
            Some(TraceEvent::SetControlLines { at, dtr: expected_dtr, rts: expected_rts }) => {
                self.last_at = at;
                if (dtr, rts) != (expected_dtr, expected_rts) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "control-line mismatch: trace expected DTR={expected_dtr} RTS={expected_rts}, got DTR={dtr} RTS={rts}"
                        ),
                    ));
                }
                Ok(())
            }
            Some(other) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("trace expected SET_CONTROL_LINES next, found {other:?}"),
            )),
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "trace exhausted, unexpected control-line set")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_and_read_lines() {
        let trace = "[0.000] >>>> (2): C0 C0\n[0.010] <<<< (1): FF\n";
        let replay = ReplayTransport::from_trace(trace);
        assert_eq!(replay.events.len(), 2);
    }

    #[test]
    fn parses_control_lines() {
        let trace = "[0.000] SET_CONTROL_LINES DTR=true RTS=false\n";
        let replay = ReplayTransport::from_trace(trace);
        assert_eq!(replay.events.len(), 1);
    }

    #[test]
    fn replay_asserts_byte_exact_writes() {
        let trace = "[0.000] >>>> (2): AA BB\n";
        let mut replay = ReplayTransport::from_trace(trace);
        assert!(replay.write(&[0xAA, 0xBB]).is_ok());
    }

    #[test]
    fn replay_rejects_mismatched_write() {
        let trace = "[0.000] >>>> (2): AA BB\n";
        let mut replay = ReplayTransport::from_trace(trace);
        assert!(replay.write(&[0xAA, 0xCC]).is_err());
    }

    #[test]
    fn replay_supplies_recorded_reads() {
        let trace = "[0.000] <<<< (2): 11 22\n";
        let mut replay = ReplayTransport::from_trace(trace);
        let mut buf = [0u8; 4];
        let n = replay.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x11, 0x22]);
    }

    #[test]
    fn replay_asserts_control_lines() {
        let trace = "[0.000] SET_CONTROL_LINES DTR=true RTS=false\n";
        let mut replay = ReplayTransport::from_trace(trace);
        assert!(replay.set_control_lines(true, false).is_ok());
    }

    #[test]
    fn replay_rejects_wrong_control_lines() {
        let trace = "[0.000] SET_CONTROL_LINES DTR=true RTS=false\n";
        let mut replay = ReplayTransport::from_trace(trace);
        assert!(replay.set_control_lines(false, false).is_err());
    }
}
