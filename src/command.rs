//! Command/response wire codec.
//!
//! Builds the little-endian command packets described in the protocol's
//! opcode table and parses response packets back, accounting for the
//! ROM-vs-stub difference in where the success/error bytes live.
//!
//! Every multi-byte field is written with an explicit `to_le_bytes()` call.
//! Some implementations of this codec build the payload as a `#[repr(C)]`
//! struct and reinterpret its bytes directly; that is only sound on a
//! little-endian host, so this one never does it.

use std::io::{self, Write};

use strum::Display;

use crate::checksum::checksum;
use crate::error::{Error, RomError, RomErrorKind};

/// Wire opcode values, named per the Espressif serial bootloader protocol.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,
}

impl CommandType {
    /// Reverse-lookup used when parsing a response frame.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0x02 => Self::FlashBegin,
            0x03 => Self::FlashData,
            0x04 => Self::FlashEnd,
            0x05 => Self::MemBegin,
            0x06 => Self::MemEnd,
            0x07 => Self::MemData,
            0x08 => Self::Sync,
            0x09 => Self::WriteReg,
            0x0A => Self::ReadReg,
            0x0B => Self::SpiSetParams,
            0x0D => Self::SpiAttach,
            0x0F => Self::ChangeBaudrate,
            0x10 => Self::FlashDeflBegin,
            0x11 => Self::FlashDeflData,
            0x12 => Self::FlashDeflEnd,
            0x13 => Self::FlashMd5,
            0xD0 => Self::EraseFlash,
            0xD1 => Self::EraseRegion,
            0xD2 => Self::ReadFlash,
            0xD3 => Self::RunUserCode,
            _ => return None,
        })
    }
}

/// The fixed 36-byte SYNC payload: `07 07 12 20` followed by 32 bytes of
/// `0x55`.
const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55u8; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

/// A command ready to be encoded onto the wire.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        total_size: u32,
    },
    SpiAttach,
    ChangeBaudrate {
        new_baud: u32,
    },
    FlashDeflBegin {
        uncompressed_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        block_size: u32,
        max_in_flight: u32,
    },
    RunUserCode,
}

impl Command<'_> {
    /// The opcode this command encodes to.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::MemData { .. } => CommandType::MemData,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::RunUserCode => CommandType::RunUserCode,
        }
    }

    /// Encode this command's `[dir][opcode][len][checksum][payload]` frame,
    /// unwrapped (the caller SLIP-encodes the result).
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_all(&[0x00, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => write_begin(&mut out, size, blocks, block_size, offset, supports_encryption)?,
            Command::FlashData { data, sequence } => write_data(&mut out, data, sequence)?,
            Command::FlashEnd { reboot } => write_payload(&mut out, &[u8::from(!reboot)], 0)?,
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => write_begin(&mut out, size, blocks, block_size, offset, false)?,
            Command::MemEnd { entry } => {
                let mut payload = Vec::with_capacity(8);
                payload.write_all(&0u32.to_le_bytes())?;
                payload.write_all(&entry.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::MemData { data, sequence } => write_data(&mut out, data, sequence)?,
            Command::Sync => write_payload(&mut out, &SYNC_FRAME, 0)?,
            Command::ReadReg { address } => {
                write_payload(&mut out, &address.to_le_bytes(), 0)?
            }
            Command::SpiSetParams { total_size } => {
                let mut payload = Vec::with_capacity(24);
                payload.write_all(&0u32.to_le_bytes())?; // id
                payload.write_all(&total_size.to_le_bytes())?;
                payload.write_all(&(64 * 1024u32).to_le_bytes())?; // block_size
                payload.write_all(&(4 * 1024u32).to_le_bytes())?; // sector_size
                payload.write_all(&256u32.to_le_bytes())?; // page_size
                payload.write_all(&0xFFFFu32.to_le_bytes())?; // status_mask
                write_payload(&mut out, &payload, 0)?;
            }
            Command::SpiAttach => {
                let mut payload = Vec::with_capacity(8);
                payload.write_all(&0u32.to_le_bytes())?;
                payload.write_all(&0u32.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::ChangeBaudrate { new_baud } => {
                let mut payload = Vec::with_capacity(8);
                payload.write_all(&new_baud.to_le_bytes())?;
                payload.write_all(&0u32.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::FlashDeflBegin {
                uncompressed_size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => write_begin(
                &mut out,
                uncompressed_size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            )?,
            Command::FlashDeflData { data, sequence } => write_data(&mut out, data, sequence)?,
            Command::FlashDeflEnd { reboot } => write_payload(&mut out, &[u8::from(!reboot)], 0)?,
            Command::FlashMd5 { offset, size } => {
                let mut payload = Vec::with_capacity(16);
                payload.write_all(&offset.to_le_bytes())?;
                payload.write_all(&size.to_le_bytes())?;
                payload.write_all(&0u32.to_le_bytes())?;
                payload.write_all(&0u32.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::EraseFlash => write_payload(&mut out, &[], 0)?,
            Command::EraseRegion { offset, size } => {
                let mut payload = Vec::with_capacity(8);
                payload.write_all(&offset.to_le_bytes())?;
                payload.write_all(&size.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::ReadFlash {
                offset,
                size,
                block_size,
                max_in_flight,
            } => {
                let mut payload = Vec::with_capacity(16);
                payload.write_all(&offset.to_le_bytes())?;
                payload.write_all(&size.to_le_bytes())?;
                payload.write_all(&block_size.to_le_bytes())?;
                payload.write_all(&max_in_flight.to_le_bytes())?;
                write_payload(&mut out, &payload, 0)?;
            }
            Command::RunUserCode => write_payload(&mut out, &[], 0)?,
        }
        Ok(out)
    }
}

fn write_payload<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn write_begin<W: Write>(
    mut writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> io::Result<()> {
    let mut payload = Vec::with_capacity(20);
    payload.write_all(&size.to_le_bytes())?;
    payload.write_all(&blocks.to_le_bytes())?;
    payload.write_all(&block_size.to_le_bytes())?;
    payload.write_all(&offset.to_le_bytes())?;
    if supports_encryption {
        payload.write_all(&0u32.to_le_bytes())?;
    }
    write_payload(&mut writer, &payload, 0)
}

/// `FLASH_DATA`/`MEM_DATA`/`FLASH_DEFL_DATA` share this layout: a 4-byte
/// sequence number and two reserved zero words before the raw bytes, with
/// the checksum computed over the data alone.
fn write_data<W: Write>(mut writer: W, data: &[u8], sequence: u32) -> io::Result<()> {
    let mut payload = Vec::with_capacity(16 + data.len());
    payload.write_all(&sequence.to_le_bytes())?;
    payload.write_all(&0u32.to_le_bytes())?;
    payload.write_all(&0u32.to_le_bytes())?;
    payload.write_all(data)?;
    write_payload(&mut writer, &payload, checksum(data))
}

/// Which tail layout a response's success/error bytes follow. Selected once
/// at stub-load time and stored on the engine, never branched per call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseView {
    /// ROM bootloader: last 4 bytes are `[status][errorCode][0][0]`.
    Rom,
    /// Stub loader: last 2 bytes are `[status][errorCode]`, reversed sense.
    Stub,
}

/// A parsed response frame.
#[derive(Clone, Debug)]
pub struct CommandResponse {
    pub opcode: u8,
    pub value: u32,
    pub payload: Vec<u8>,
}

impl CommandResponse {
    /// Parse a decoded (SLIP-stripped) response frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 || frame[0] != 0x01 {
            return None;
        }
        let opcode = frame[1];
        let payload_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let payload = frame.get(8..8 + payload_len)?.to_vec();
        Some(CommandResponse {
            opcode,
            value,
            payload,
        })
    }

    /// The payload bytes that aren't the trailing success/error status —
    /// 4 bytes reserved under the ROM view, 2 under the stub view. Most
    /// commands carry no data beyond the tail; `FLASH_MD5`'s digest is the
    /// exception.
    pub fn data(&self, view: ResponseView) -> &[u8] {
        let tail_len = match view {
            ResponseView::Rom => 4,
            ResponseView::Stub => 2,
        };
        let end = self.payload.len().saturating_sub(tail_len);
        &self.payload[..end]
    }

    /// Whether the response's tail indicates success, under the given view.
    pub fn is_success(&self, view: ResponseView) -> bool {
        match view {
            ResponseView::Rom => self
                .payload
                .len()
                .checked_sub(4)
                .and_then(|start| self.payload.get(start))
                .map(|&status| status == 0)
                .unwrap_or(false),
            ResponseView::Stub => self
                .payload
                .len()
                .checked_sub(1)
                .and_then(|idx| self.payload.get(idx))
                .map(|&error_code| error_code == 0)
                .unwrap_or(false),
        }
    }

    /// Decode the tail into a [`RomError`] if the response indicates
    /// failure, using the error-code table matching `view`.
    pub fn error(&self, view: ResponseView) -> Option<RomError> {
        if self.is_success(view) {
            return None;
        }
        let command = CommandType::from_opcode(self.opcode)?;
        let kind = match view {
            ResponseView::Rom => {
                let start = self.payload.len().checked_sub(4)?;
                RomErrorKind::from_rom_code(*self.payload.get(start + 1)?)
            }
            ResponseView::Stub => {
                let idx = self.payload.len().checked_sub(1)?;
                RomErrorKind::from_stub_code(*self.payload.get(idx)?)
            }
        };
        Some(RomError::new(command, kind))
    }

    /// Convenience: turn `error(view)` into a [`Result`].
    pub fn into_result(self, view: ResponseView) -> Result<Self, Error> {
        match self.error(view) {
            Some(err) => Err(Error::Rom(err)),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sync_frame_matches_wire_layout() {
        let cmd = Command::Sync;
        let encoded = cmd.encode().unwrap();
        // dir, opcode, len_lo, len_hi, checksum(4), payload(36)
        assert_eq!(encoded[0], 0x00);
        assert_eq!(encoded[1], 0x08);
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 36);
        assert_eq!(&encoded[8..], &SYNC_FRAME);
    }

    #[test]
    fn flash_begin_without_encryption_is_16_bytes() {
        let cmd = Command::FlashBegin {
            size: 1024,
            blocks: 1,
            block_size: 1024,
            offset: 0,
            supports_encryption: false,
        };
        let encoded = cmd.encode().unwrap();
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 16);
        assert_eq!(&encoded[8..12], &1024u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &1u32.to_le_bytes());
    }

    #[test]
    fn flash_begin_with_encryption_appends_reserved_word() {
        let cmd = Command::FlashBegin {
            size: 1024,
            blocks: 1,
            block_size: 1024,
            offset: 0,
            supports_encryption: true,
        };
        let encoded = cmd.encode().unwrap();
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 20);
    }

    #[test]
    fn flash_data_checksum_covers_only_raw_bytes() {
        let data = [0xAA, 0xBB];
        let cmd = Command::FlashData { data: &data, sequence: 3 };
        let encoded = cmd.encode().unwrap();
        let expected_checksum = checksum(&data);
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]),
            expected_checksum
        );
    }

    #[test]
    fn response_parse_roundtrips_opcode_value_payload() {
        let mut frame = vec![0x01, 0x08, 0x02, 0x00];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&[0xAB, 0xCD]);
        let response = CommandResponse::parse(&frame).unwrap();
        assert_eq!(response.opcode, 0x08);
        assert_eq!(response.payload, vec![0xAB, 0xCD]);
    }

    #[test]
    fn rom_success_is_tail_first_byte_zero() {
        let mut frame = vec![0x01, 0x08, 0x04, 0x00];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let response = CommandResponse::parse(&frame).unwrap();
        assert!(response.is_success(ResponseView::Rom));
    }

    #[test]
    fn data_strips_rom_tail() {
        let mut frame = vec![0x01, 0x13, 20, 0];
        frame.extend_from_slice(&0u32.to_le_bytes());
        let digest_ascii = b"00000000000000000000000000000000";
        frame.extend_from_slice(&digest_ascii[..16]);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let response = CommandResponse::parse(&frame).unwrap();
        assert_eq!(response.data(ResponseView::Rom).len(), 16);
    }

    #[test]
    fn stub_success_is_tail_second_byte_zero() {
        let mut frame = vec![0x01, 0x08, 0x02, 0x00];
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&[0x01, 0x00]);
        let response = CommandResponse::parse(&frame).unwrap();
        assert!(response.is_success(ResponseView::Stub));
    }
}
