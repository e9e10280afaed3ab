//! SLIP (Serial Line IP) byte-stuffed framing.
//!
//! Every command and response frame on the wire is wrapped between `0xC0`
//! delimiters, with `0xC0` and `0xDB` bytes inside the payload escaped via
//! `0xDB`. See the Espressif serial protocol docs for the wire-level
//! rationale; this module only implements the byte-stuffing, not the
//! command/response layout on top of it (see [`crate::command`]).

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Wrap `payload` in `END` delimiters, escaping `END`/`ESC` bytes within it.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// Reverse [`encode`] on a single frame's payload bytes (delimiters already
/// stripped by the caller, typically [`crate::frame::FrameReader`]).
///
/// Tolerant: an escape byte followed by anything other than
/// `ESC_END`/`ESC_ESC` is emitted verbatim (escape byte, then the
/// unexpected byte) rather than treated as a framing error, since the ROM
/// bootloader itself does not always escape correctly.
pub fn decode(framed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(framed.len());
    let mut iter = framed.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == ESC {
            match iter.next() {
                Some(ESC_END) => out.push(END),
                Some(ESC_ESC) => out.push(ESC),
                Some(other) => {
                    out.push(ESC);
                    out.push(other);
                }
                None => out.push(ESC),
            }
        } else {
            out.push(byte);
        }
    }
    out
}
