//! End-to-end scenarios driving [`ProtocolEngine`] against a scripted
//! [`Transport`], covering the engine's core lifecycle and flashing
//! operations without real hardware.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use pretty_assertions::assert_eq;

use espflash_proto::chip::Chip;
use espflash_proto::engine::{EngineConfig, ProtocolEngine};
use espflash_proto::slip;
use espflash_proto::stub::StubBlob;
use espflash_proto::transport::Transport;

/// A transport whose `read` plays back a queue of pre-framed device
/// replies and whose `write`/`set_control_lines` calls are simply
/// recorded for inspection.
struct MockTransport {
    reads: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    control_lines: Vec<(bool, bool)>,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport { reads: VecDeque::new(), writes: Vec::new(), control_lines: Vec::new() }
    }

    /// Queue a device response frame: decoded response bytes (including
    /// the `[dir][opcode][len][value]` header), SLIP-framed as they'd
    /// arrive on the wire.
    fn push_frame(&mut self, decoded: &[u8]) {
        self.reads.extend(slip::encode(decoded));
    }

    fn rom_response(opcode: u8, value: u32) -> Vec<u8> {
        let mut frame = vec![0x01, opcode, 4, 0];
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        frame
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reads.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no more scripted data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.reads.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writes.push(buf.to_vec());
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.control_lines.push((dtr, rts));
        Ok(())
    }
}

#[test]
fn sync_sends_one_frame_and_drains_until_timeout() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));

    let mut engine = ProtocolEngine::new(transport);
    engine.sync().expect("sync should succeed on the first reply");

    assert_eq!(engine.state(), espflash_proto::LifecycleState::Synced);
}

#[test]
fn detect_chip_resolves_esp32_from_magic() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));
    transport.push_frame(&MockTransport::rom_response(0x0A, 0x00f0_1d83));

    let mut engine = ProtocolEngine::new(transport);
    engine.sync().unwrap();
    let chip = engine.detect_chip().expect("magic 0x00f01d83 is ESP32");

    assert_eq!(chip, Chip::Esp32);
}

#[test]
fn detect_chip_rejects_unknown_magic() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));
    transport.push_frame(&MockTransport::rom_response(0x0A, 0xDEAD_BEEF));

    let mut engine = ProtocolEngine::new(transport);
    engine.sync().unwrap();
    let err = engine.detect_chip().unwrap_err();

    assert!(matches!(err, espflash_proto::Error::UnknownChip(0xDEAD_BEEF)));
}

#[test]
fn load_stub_sets_is_stub_once_ohai_observed() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));
    transport.push_frame(&MockTransport::rom_response(0x0A, 0x6921_506f)); // ESP32-C3

    // mem_write(text): one MEM_BEGIN + one MEM_DATA (text fits in one 0x1800 block)
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    // mem_write(data): same shape
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    // OHAI handshake: a literal frame, not a Response
    transport.push_frame(&[0x4F, 0x48, 0x41, 0x49]);

    let mut engine = ProtocolEngine::new(transport);
    engine.sync().unwrap();
    engine.detect_chip().unwrap();

    let blob_json = r#"{
        "entry": 1024,
        "text_start": 1073809408,
        "data_start": 2048,
        "text": "AQIDBA==",
        "data": "BQYHCA=="
    }"#;
    let blob = StubBlob::parse(blob_json).unwrap();

    engine.load_stub(&blob).expect("OHAI frame should complete the handshake");
    assert!(engine.is_stub());
}

#[test]
fn flash_write_sends_begin_then_one_data_block() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x02, 0)); // FLASH_BEGIN ack
    transport.push_frame(&MockTransport::rom_response(0x03, 0)); // FLASH_DATA ack

    let mut engine = ProtocolEngine::new(transport);
    let image = vec![0xAAu8; 1024];
    engine.flash_write(&image, 1024, 0).expect("single-block write should succeed");
}

#[test]
fn flash_defl_write_sends_begin_then_compressed_data_blocks() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x10, 0)); // FLASH_DEFL_BEGIN ack
    transport.push_frame(&MockTransport::rom_response(0x11, 0)); // FLASH_DEFL_DATA ack

    let mut engine = ProtocolEngine::new(transport);
    // Highly compressible input: at Compression::best() it fits in one
    // block_size=1024 chunk even though the uncompressed image is larger.
    let image = vec![0u8; 4096];
    engine
        .flash_defl_write(&image, 1024, 0)
        .expect("compressed image should fit in a single block and succeed");
}

#[test]
fn flash_md5_verify_detects_mismatch() {
    let mut transport = MockTransport::new();
    // A deliberately wrong digest (all zero bytes) under the ROM view.
    let mut frame = vec![0x01, 0x13];
    let payload_len = (32 + 4) as u16;
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(b"00000000000000000000000000000000".get(..32).unwrap());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    transport.push_frame(&frame);

    let mut engine = ProtocolEngine::new(transport);
    let image = vec![0u8; 1024];
    let err = engine.flash_md5_verify(&image, 0).unwrap_err();

    assert!(matches!(err, espflash_proto::Error::Md5Mismatch { .. }));
}

#[test]
fn read_flash_is_rejected_before_the_stub_is_loaded() {
    let transport = MockTransport::new();
    let mut engine = ProtocolEngine::new(transport);

    let err = engine.read_flash(0, 1024).unwrap_err();
    assert!(matches!(
        err,
        espflash_proto::Error::Connection(espflash_proto::ConnectionError::InvalidState(_))
    ));
}

#[test]
fn read_flash_assembles_data_and_verifies_md5() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));
    transport.push_frame(&MockTransport::rom_response(0x0A, 0x6921_506f)); // ESP32-C3
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    transport.push_frame(&[0x4F, 0x48, 0x41, 0x49]); // OHAI

    let data = vec![0u8; 1024];
    let digest = espflash_proto::checksum::md5_digest(&data);
    // READ_FLASH streams raw, un-opcoded chunks, followed by a raw 16-byte
    // MD5 frame; there is no FLASH_BEGIN-style ack for the command itself.
    transport.push_frame(&data);
    transport.push_frame(&digest);

    let mut engine = ProtocolEngine::new(transport);
    engine.sync().unwrap();
    engine.detect_chip().unwrap();
    let blob_json = r#"{
        "entry": 1024,
        "text_start": 1073809408,
        "data_start": 2048,
        "text": "AQIDBA==",
        "data": "BQYHCA=="
    }"#;
    engine.load_stub(&StubBlob::parse(blob_json).unwrap()).unwrap();

    let read = engine.read_flash(0, 1024).expect("digest matches, read should succeed");
    assert_eq!(read, data);
}

#[test]
fn read_flash_timeout_is_tagged_with_read_flash_not_sync() {
    let mut transport = MockTransport::new();
    transport.push_frame(&MockTransport::rom_response(0x08, 0));
    transport.push_frame(&MockTransport::rom_response(0x0A, 0x6921_506f)); // ESP32-C3
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    transport.push_frame(&MockTransport::rom_response(0x05, 0));
    transport.push_frame(&MockTransport::rom_response(0x07, 0));
    transport.push_frame(&[0x4F, 0x48, 0x41, 0x49]); // OHAI
    // No READ_FLASH data queued: the device never replies.

    let config = EngineConfig { default_timeout: Duration::from_millis(5), ..EngineConfig::default() };
    let mut engine =
        ProtocolEngine::with_config(transport, espflash_proto::NullProgress, config);
    engine.sync().unwrap();
    engine.detect_chip().unwrap();
    let blob_json = r#"{
        "entry": 1024,
        "text_start": 1073809408,
        "data_start": 2048,
        "text": "AQIDBA==",
        "data": "BQYHCA=="
    }"#;
    engine.load_stub(&StubBlob::parse(blob_json).unwrap()).unwrap();

    let err = engine.read_flash(0, 1024).unwrap_err();
    assert!(matches!(
        err,
        espflash_proto::Error::Connection(espflash_proto::ConnectionError::Timeout(
            espflash_proto::command::CommandType::ReadFlash
        ))
    ));
}

#[test]
fn with_config_lets_the_caller_shrink_sync_attempts() {
    let transport = MockTransport::new();
    let config = EngineConfig { sync_attempts: 1, sync_timeout: Duration::from_millis(1), ..EngineConfig::default() };
    let mut engine = ProtocolEngine::with_config(transport, espflash_proto::NullProgress, config);

    let err = engine.sync().unwrap_err();
    assert!(matches!(
        err,
        espflash_proto::Error::Connection(espflash_proto::ConnectionError::SyncFailure(1))
    ));
}
