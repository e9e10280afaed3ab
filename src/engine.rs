//! The protocol engine: owns the lifecycle, issues commands, and implements
//! every flashing operation on top of the codec, frame reader, and SLIP
//! framer.

use std::cmp::max;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};

use crate::checksum::{deflate, digest_to_hex, md5_digest};
use crate::chip::{Chip, ChipInfo, FlashRegion};
use crate::command::{Command, CommandType, ResponseView};
use crate::error::{ConnectionError, Error, ResultExt as _};
use crate::frame::{FrameFilter, FrameReader};
use crate::progress::{NullProgress, ProgressSink};
use crate::slip;
use crate::stub::StubBlob;
use crate::transport::Transport;

/// Default baud rate a fresh connection starts at.
pub const BAUD_115200: u32 = 115_200;
/// A common step-up baud rate once synced.
pub const BAUD_460800: u32 = 460_800;
/// The fastest commonly supported baud rate.
pub const BAUD_921600: u32 = 921_600;

/// The literal `OHAI` marker the stub loader sends once it's ready to
/// receive commands. A protocol constant, not a tunable.
const OHAI: [u8; 4] = [0x4F, 0x48, 0x41, 0x49];

/// Every timeout and block size the engine uses, supplied by the caller at
/// construction rather than hardcoded. [`Default`] reproduces the values
/// this protocol's reference tooling uses.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Timeout for commands with no size-dependent cost (register
    /// read/write, baud change, SPI attach, ...).
    pub default_timeout: Duration,
    /// Timeout for a single `SYNC` attempt.
    pub sync_timeout: Duration,
    /// How many `SYNC` attempts to make before giving up.
    pub sync_attempts: usize,
    /// Timeout for a single `MEM_DATA` chunk while loading the stub.
    pub mem_end_timeout: Duration,
    /// Timeout for `FLASH_MD5`, long enough to let the device hash a large
    /// flash region.
    pub flash_md5_timeout: Duration,
    /// How long to wait for the stub's `OHAI` readiness marker after
    /// `MEM_END`.
    pub stub_handshake_timeout: Duration,
    /// Per-megabyte timeout budget for size-dependent operations (flash
    /// write, erase).
    pub erase_timeout_per_mb: Duration,
    /// Fixed timeout for a full-chip erase, which has no size parameter to
    /// scale against.
    pub erase_chip_timeout: Duration,
    /// Chunk size used for `MEM_BEGIN`/`MEM_DATA` while loading the stub.
    pub mem_block_size: u32,
    /// Chunk size requested from the device in `READ_FLASH`.
    pub read_flash_block_size: u32,
    /// How many `READ_FLASH` chunks the device may have in flight
    /// (unacknowledged) at once.
    pub read_flash_in_flight: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_timeout: Duration::from_secs(3),
            sync_timeout: Duration::from_millis(100),
            sync_attempts: 20,
            mem_end_timeout: Duration::from_millis(50),
            flash_md5_timeout: Duration::from_secs(8),
            stub_handshake_timeout: Duration::from_millis(500),
            erase_timeout_per_mb: Duration::from_secs(30),
            erase_chip_timeout: Duration::from_secs(30 * 16),
            mem_block_size: 0x1800,
            read_flash_block_size: 0x400,
            read_flash_in_flight: 2,
        }
    }
}

impl EngineConfig {
    fn size_scaled_timeout(&self, size: u32) -> Duration {
        let mb = size as f64 / 1_000_000.0;
        max(
            self.default_timeout,
            Duration::from_millis((self.erase_timeout_per_mb.as_millis() as f64 * mb) as u64),
        )
    }
}

/// The engine's position in its lifecycle. Transitions are monotonic:
/// operations check `state >= required` rather than matching exact states,
/// since `FLASHING` and `RESET` are reachable from either stub path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Disconnected,
    Bootloader,
    Synced,
    ChipDetected,
    Ready,
    Flashing,
    Reset,
}

/// Drives the Espressif serial bootloader protocol over a caller-supplied
/// [`Transport`], reporting progress through a caller-supplied
/// [`ProgressSink`].
///
/// Single-threaded and synchronous by design: every command is
/// send-then-await-response, and the engine owns the transport exclusively
/// for the duration of an operation. There is no provision for driving two
/// chips from one instance.
pub struct ProtocolEngine<T: Transport, P: ProgressSink = NullProgress> {
    transport: T,
    progress: P,
    config: EngineConfig,
    state: LifecycleState,
    chip: Option<ChipInfo>,
    is_stub: bool,
    view: ResponseView,
}

impl<T: Transport> ProtocolEngine<T, NullProgress> {
    /// Build an engine with no progress reporting and default timeouts and
    /// block sizes.
    pub fn new(transport: T) -> Self {
        Self::with_progress(transport, NullProgress)
    }
}

impl<T: Transport, P: ProgressSink> ProtocolEngine<T, P> {
    /// Build an engine with default timeouts and block sizes. Use
    /// [`Self::with_config`] to override them.
    pub fn with_progress(transport: T, progress: P) -> Self {
        Self::with_config(transport, progress, EngineConfig::default())
    }

    /// Build an engine with caller-supplied timeouts and block sizes.
    pub fn with_config(transport: T, progress: P, config: EngineConfig) -> Self {
        ProtocolEngine {
            transport,
            progress,
            config,
            state: LifecycleState::Disconnected,
            chip: None,
            is_stub: false,
            view: ResponseView::Rom,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn chip(&self) -> Option<&ChipInfo> {
        self.chip.as_ref()
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    fn require(&self, minimum: LifecycleState, what: &'static str) -> Result<(), Error> {
        if self.state < minimum {
            return Err(Error::Connection(ConnectionError::InvalidState(what)));
        }
        Ok(())
    }

    fn require_stub(&self, what: &'static str) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::Connection(ConnectionError::InvalidState(what)));
        }
        Ok(())
    }

    /// Drive DTR/RTS to put the chip into the ROM bootloader. 100 ms sleeps
    /// are part of the protocol contract with the chip's reset circuitry,
    /// not a tunable.
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        debug!("Entering bootloader via DTR/RTS sequencing");
        self.transport.set_control_lines(true, false)?;
        sleep(Duration::from_millis(100));
        self.transport.set_control_lines(false, true)?;
        sleep(Duration::from_millis(100));
        self.transport.set_control_lines(true, false)?;
        self.state = LifecycleState::Bootloader;
        Ok(())
    }

    /// Reset the chip back into its user application. Mirrors
    /// `enter_bootloader`'s sequence but holds DTR false throughout and
    /// pulses RTS.
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("Resetting device to run user application");
        self.transport.set_control_lines(false, true)?;
        sleep(Duration::from_millis(100));
        self.transport.set_control_lines(false, false)?;
        sleep(Duration::from_millis(100));
        self.transport.set_control_lines(false, true)?;
        self.state = LifecycleState::Reset;
        Ok(())
    }

    fn send(&mut self, command: &Command<'_>) -> Result<(), Error> {
        let encoded = command.encode().map_err(Error::from)?;
        self.transport.write(&slip::encode(&encoded))?;
        Ok(())
    }

    fn send_and_await(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<crate::command::CommandResponse, Error> {
        let command_type = command.command_type();
        self.send(&command)?;
        let raw = FrameReader::new(&mut self.transport)
            .wait_for(FrameFilter::Opcode(command_type), timeout)
            .for_command(command_type)?;
        let response = raw
            .as_response()
            .ok_or(Error::MalformedResponse(command_type))?;
        response.into_result(self.view)
    }

    /// Send a `SYNC` up to 20 times, waiting up to 100 ms each time for a
    /// matching reply. Once one succeeds, drains further pipelined echoes
    /// until a read times out.
    pub fn sync(&mut self) -> Result<(), Error> {
        let sync_timeout = self.config.sync_timeout;
        for attempt in 1..=self.config.sync_attempts {
            self.send(&Command::Sync)?;
            match FrameReader::new(&mut self.transport).wait_for(FrameFilter::Opcode(CommandType::Sync), sync_timeout) {
                Ok(raw) => {
                    let response = match raw.as_response() {
                        Some(r) => r,
                        None => continue,
                    };
                    if response.is_success(ResponseView::Rom) {
                        debug!("Synced after {attempt} attempt(s); draining pipelined echoes");
                        self.drain_sync_echoes();
                        self.state = LifecycleState::Synced;
                        return Ok(());
                    }
                }
                Err(_) => continue,
            }
        }
        warn!("Sync failed after {} attempts", self.config.sync_attempts);
        Err(Error::Connection(ConnectionError::SyncFailure(self.config.sync_attempts)))
    }

    fn drain_sync_echoes(&mut self) {
        let sync_timeout = self.config.sync_timeout;
        loop {
            let result = FrameReader::new(&mut self.transport)
                .wait_for(FrameFilter::Opcode(CommandType::Sync), sync_timeout);
            if result.is_err() {
                return;
            }
        }
    }

    /// Read the chip-magic register and resolve it against the chip
    /// registry.
    pub fn detect_chip(&mut self) -> Result<Chip, Error> {
        self.require(LifecycleState::Synced, "detect_chip requires sync()")?;
        let response = self.send_and_await(
            Command::ReadReg { address: 0x4000_1000 },
            self.config.default_timeout,
        )?;
        let chip = Chip::from_magic(response.value).ok_or(Error::UnknownChip(response.value))?;
        info!("Detected chip: {}", chip.readable_name());
        self.chip = Some(ChipInfo::from(chip));
        self.state = LifecycleState::ChipDetected;
        Ok(chip)
    }

    /// Upload a stub image into RAM and wait for its `OHAI` readiness
    /// marker. After this returns, stub-only commands become legal.
    pub fn load_stub(&mut self, blob: &StubBlob) -> Result<(), Error> {
        self.require(LifecycleState::ChipDetected, "load_stub requires detect_chip()")?;
        debug!("Loading flash stub (text {}B, data {}B)", blob.text.len(), blob.data.len());

        self.mem_write(&blob.text, blob.text_addr)?;
        self.mem_write(&blob.data, blob.data_addr)?;

        self.send(&Command::MemEnd { entry: blob.entry })?;
        let raw = FrameReader::new(&mut self.transport)
            .wait_for(FrameFilter::Literal(&OHAI), self.config.stub_handshake_timeout)
            .map_err(|_| Error::Connection(ConnectionError::StubHandshakeFailed))?;
        if raw.bytes != OHAI {
            return Err(Error::Connection(ConnectionError::StubHandshakeFailed));
        }

        self.is_stub = true;
        self.view = ResponseView::Stub;
        self.state = LifecycleState::Ready;
        info!("Stub loaded, using flash stub for subsequent commands");
        Ok(())
    }

    /// `MEM_BEGIN` + `MEM_DATA` chunks of `MEM_BLOCK_SIZE`, not padded. The
    /// caller (`load_stub`) issues `MEM_END` separately.
    fn mem_write(&mut self, data: &[u8], addr: u32) -> Result<(), Error> {
        let mem_block_size = self.config.mem_block_size;
        let blocks = data.chunks(mem_block_size as usize).count().max(1) as u32;
        self.send_and_await(
            Command::MemBegin {
                size: data.len() as u32,
                blocks,
                block_size: mem_block_size,
                offset: addr,
            },
            self.config.default_timeout,
        )?;
        for (seq, chunk) in data.chunks(mem_block_size as usize).enumerate() {
            self.send_and_await(
                Command::MemData { data: chunk, sequence: seq as u32 },
                self.config.mem_end_timeout,
            )?;
        }
        Ok(())
    }

    /// Write `image` to flash at `offset` using raw (uncompressed) blocks
    /// of `block_size`, padded with zeros.
    pub fn flash_write(&mut self, image: &[u8], block_size: u32, offset: u32) -> Result<(), Error> {
        let blocks = image.len().div_ceil(block_size as usize).max(1) as u32;
        let supports_encryption = self.supports_encryption_extra_word();

        self.progress.on_start("flashWrite", image.len());
        self.send_and_await(
            Command::FlashBegin {
                size: image.len() as u32,
                blocks,
                block_size,
                offset,
                supports_encryption,
            },
            self.config.size_scaled_timeout(image.len() as u32),
        )?;

        for (seq, chunk) in image.chunks(block_size as usize).enumerate() {
            let mut padded = chunk.to_vec();
            padded.resize(block_size as usize, 0);
            self.send_and_await(
                Command::FlashData { data: &padded, sequence: seq as u32 },
                self.config.size_scaled_timeout(block_size),
            )?;
            let percent = 100.0 * (seq + 1) as f32 / blocks as f32;
            self.progress.on_progress(percent);
        }
        self.progress.on_end();
        self.state = LifecycleState::Flashing;
        Ok(())
    }

    /// Compress `image` and write it to flash at `offset`. Blocks are
    /// counted over the compressed byte length; the last chunk is short
    /// and not padded.
    pub fn flash_defl_write(&mut self, image: &[u8], block_size: u32, offset: u32) -> Result<(), Error> {
        let compressed = deflate(image).map_err(Error::from)?;
        let blocks = compressed.len().div_ceil(block_size as usize).max(1) as u32;
        let supports_encryption = self.supports_encryption_extra_word();

        // The ROM's FLASH_DEFL_BEGIN expects blockSize*blocks as the
        // "uncompressed size" field rather than the true size; the stub
        // expects the true size. Preserved verbatim per the upstream quirk,
        // not corrected.
        let uncompressed_size = if self.is_stub {
            image.len() as u32
        } else {
            block_size * blocks
        };

        self.progress.on_start("flashDeflWrite", image.len());
        self.send_and_await(
            Command::FlashDeflBegin {
                uncompressed_size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            },
            self.config.size_scaled_timeout(image.len() as u32),
        )?;

        for (seq, chunk) in compressed.chunks(block_size as usize).enumerate() {
            self.send_and_await(
                Command::FlashDeflData { data: chunk, sequence: seq as u32 },
                self.config.size_scaled_timeout(block_size),
            )?;
            let percent = 100.0 * (seq + 1) as f32 / blocks as f32;
            self.progress.on_progress(percent);
        }
        self.progress.on_end();
        self.state = LifecycleState::Flashing;
        Ok(())
    }

    fn supports_encryption_extra_word(&self) -> bool {
        self.chip
            .as_ref()
            .map(|c| c.kind.supports_encryption())
            .unwrap_or(false)
            && !self.is_stub
    }

    /// Read `length` bytes of flash starting at `offset`, stub-only.
    pub fn read_flash(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.require_stub("read_flash requires the stub loader")?;
        self.send(&Command::ReadFlash {
            offset,
            size: length,
            block_size: self.config.read_flash_block_size,
            max_in_flight: self.config.read_flash_in_flight,
        })?;

        let default_timeout = self.config.default_timeout;
        self.progress.on_start("readFlash", length as usize);
        let mut collected = Vec::with_capacity(length as usize);
        while (collected.len() as u32) < length {
            let raw = FrameReader::new(&mut self.transport)
                .wait_for(FrameFilter::Any, default_timeout)
                .for_command(CommandType::ReadFlash)?;
            collected.extend_from_slice(&raw.bytes);
            let ack = (collected.len() as u32).to_le_bytes();
            self.transport.write(&slip::encode(&ack))?;
            self.progress.on_progress(100.0 * collected.len() as f32 / length as f32);
        }
        self.progress.on_end();

        let final_frame = FrameReader::new(&mut self.transport)
            .wait_for(FrameFilter::Any, default_timeout)
            .for_command(CommandType::ReadFlash)?;
        let expected = md5_digest(&collected);
        if final_frame.bytes.as_slice() != expected {
            return Err(Error::Md5Mismatch {
                expected: digest_to_hex(&final_frame.bytes),
                computed: digest_to_hex(&expected),
            });
        }
        Ok(collected)
    }

    /// Ask the chip to MD5 a flash range and compare against `image`'s
    /// digest, normalizing the ROM's 32-hex-char form and the stub's
    /// 16-raw-byte form to the same hex representation.
    pub fn flash_md5_verify(&mut self, image: &[u8], offset: u32) -> Result<(), Error> {
        let response = self.send_and_await(
            Command::FlashMd5 { offset, size: image.len() as u32 },
            self.config.flash_md5_timeout,
        )?;
        let data = response.data(self.view);
        let device_hex = if self.is_stub {
            digest_to_hex(data)
        } else {
            String::from_utf8_lossy(data).to_string()
        };
        let computed_hex = digest_to_hex(&md5_digest(image));
        if device_hex != computed_hex {
            return Err(Error::Md5Mismatch {
                expected: device_hex,
                computed: computed_hex,
            });
        }
        Ok(())
    }

    /// Erase the whole flash chip. Stub-only.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.require_stub("erase_flash requires the stub loader")?;
        info!("Erasing the entire flash");
        self.send_and_await(Command::EraseFlash, self.config.erase_chip_timeout)?;
        Ok(())
    }

    /// Erase a flash range. Stub-only.
    pub fn erase_flash_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        self.require_stub("erase_flash_region requires the stub loader")?;
        debug!("Erasing region of 0x{size:x}B at 0x{offset:08x}");
        self.send_and_await(
            Command::EraseRegion { offset, size },
            self.config.size_scaled_timeout(size),
        )?;
        Ok(())
    }

    /// Erase the region backing `region` on the currently detected chip.
    pub fn erase_region(&mut self, region: FlashRegion) -> Result<(), Error> {
        let chip = self.chip.as_ref().ok_or(Error::Connection(ConnectionError::InvalidState(
            "erase_region requires detect_chip()",
        )))?;
        let offset = *chip.region_offsets.get(&region).unwrap_or(&region.default_offset());
        let size = region.default_size();
        self.erase_flash_region(offset, size)
    }

    /// Ask the device to switch baud rates. The caller must reconfigure its
    /// transport to `new_baud` immediately after this returns.
    pub fn change_baud_rate(&mut self, new_baud: u32) -> Result<(), Error> {
        self.require(LifecycleState::Synced, "change_baud_rate requires sync()")?;
        debug!("Changing baud to: {new_baud}");
        self.send_and_await(Command::ChangeBaudrate { new_baud }, self.config.default_timeout)?;
        Ok(())
    }

    /// Inform the device of the attached flash chip's total size, so its
    /// own erase/write bounds checking is accurate.
    pub fn set_flash_size(&mut self, total_size: u32) -> Result<(), Error> {
        self.send_and_await(Command::SpiSetParams { total_size }, self.config.default_timeout)?;
        Ok(())
    }

    /// Attach the SPI flash chip so ROM commands can address it.
    pub fn spi_attach(&mut self) -> Result<(), Error> {
        self.require(LifecycleState::ChipDetected, "spi_attach requires detect_chip()")?;
        self.send_and_await(Command::SpiAttach, self.config.default_timeout)?;
        Ok(())
    }

    /// Terminate a raw flash write and optionally reboot. Omits
    /// response-success verification since the chip may reset before
    /// replying.
    pub fn end_flash(&mut self, reboot: bool) -> Result<(), Error> {
        self.send(&Command::FlashEnd { reboot })?;
        Ok(())
    }

    /// Terminate a deflate flash write and optionally reboot. Same
    /// no-verify rationale as [`Self::end_flash`].
    pub fn end_defl_flash(&mut self, reboot: bool) -> Result<(), Error> {
        self.send(&Command::FlashDeflEnd { reboot })?;
        Ok(())
    }

    /// Jump to the previously loaded stub's entry point and hand control
    /// back to it. Stub-only.
    pub fn run_user_code(&mut self) -> Result<(), Error> {
        self.require_stub("run_user_code requires the stub loader")?;
        self.send(&Command::RunUserCode)?;
        Ok(())
    }
}
