//! Chip identity registry.
//!
//! Maps a chip-magic value (read from the device's `0x40001000` register)
//! to an immutable [`ChipInfo`] describing the chip's id, stub-blob
//! reference, and per-chip flash region offsets.

use std::collections::HashMap;

use strum::{Display, EnumIter};

/// A supported ESP-family chip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Chip {
    Esp8266,
    Esp32,
    Esp32s2,
    Esp32s3,
    Esp32c2,
    Esp32c3,
    Esp32c6,
    Esp32h2,
}

impl Chip {
    /// The 16-bit chip id carried by some commands and used to key into
    /// the stub-blob registry.
    pub fn id(self) -> u16 {
        match self {
            Chip::Esp8266 => 0xFFFF,
            Chip::Esp32 => 0,
            Chip::Esp32s2 => 2,
            Chip::Esp32c3 => 5,
            Chip::Esp32s3 => 9,
            Chip::Esp32c2 => 12,
            Chip::Esp32c6 => 13,
            Chip::Esp32h2 => 16,
        }
    }

    /// Magic values this chip's ROM reports at `0x40001000`. A chip may
    /// have more than one, either across revisions or, for the ESP32-C2,
    /// because of a discrepancy upstream preserves rather than resolves.
    pub fn magic_values(self) -> &'static [u32] {
        match self {
            Chip::Esp8266 => &[0xfff0_c101],
            Chip::Esp32 => &[0x00f0_1d83],
            Chip::Esp32s2 => &[0x0000_07c6],
            Chip::Esp32s3 => &[0x9],
            Chip::Esp32c2 => &[0x6f51_306f, 0x7C3062EF],
            Chip::Esp32c3 => &[0x6921_506f, 0x1b31_506f, 0x4881_606F, 0x4361_606f],
            Chip::Esp32c6 => &[0x2CE0_806F],
            Chip::Esp32h2 => &[0xD7B7_3E80],
        }
    }

    /// Look up a chip by a magic value read from the device. `None` means
    /// the value isn't in the registry.
    pub fn from_magic(value: u32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Chip::iter().find(|chip| chip.magic_values().contains(&value))
    }

    /// Whether this chip supports flash encryption, which adds a reserved
    /// `u32` to `FLASH_BEGIN`/`FLASH_DEFL_BEGIN` payloads when talking to
    /// the ROM (not the stub).
    pub fn supports_encryption(self) -> bool {
        matches!(
            self,
            Chip::Esp32s3 | Chip::Esp32s2 | Chip::Esp32c2 | Chip::Esp32c3 | Chip::Esp32c6 | Chip::Esp32h2
        )
    }

    /// Whether this chip has no stub loader at all (flashing always talks
    /// to the ROM).
    pub fn has_stub(self) -> bool {
        self.stub_blob_ref().is_some()
    }

    /// A lookup key the caller can use to fetch this chip's stub-loader
    /// JSON document from wherever it sources stub blobs (a bundled file,
    /// a build resource, a registry) — `None` for chips with no stub at
    /// all. Sourcing the document itself is out of scope for this crate.
    pub fn stub_blob_ref(self) -> Option<&'static str> {
        match self {
            Chip::Esp8266 => None,
            Chip::Esp32 => Some("esp32"),
            Chip::Esp32s2 => Some("esp32s2"),
            Chip::Esp32s3 => Some("esp32s3"),
            Chip::Esp32c2 => Some("esp32c2"),
            Chip::Esp32c3 => Some("esp32c3"),
            Chip::Esp32c6 => Some("esp32c6"),
            Chip::Esp32h2 => Some("esp32h2"),
        }
    }

    /// A human-readable name, distinct from the `Display` derive's
    /// identifier-cased form.
    pub fn readable_name(self) -> &'static str {
        match self {
            Chip::Esp8266 => "ESP8266",
            Chip::Esp32 => "ESP32",
            Chip::Esp32s2 => "ESP32-S2",
            Chip::Esp32s3 => "ESP32-S3",
            Chip::Esp32c2 => "ESP32-C2",
            Chip::Esp32c3 => "ESP32-C3",
            Chip::Esp32c6 => "ESP32-C6",
            Chip::Esp32h2 => "ESP32-H2",
        }
    }

    /// This chip's default flash region offsets, with family-specific
    /// overrides layered on top of [`FlashRegion::default_offset`].
    pub fn region_offsets(self) -> HashMap<FlashRegion, u32> {
        let mut offsets: HashMap<FlashRegion, u32> = FlashRegion::ALL
            .iter()
            .map(|&region| (region, region.default_offset()))
            .collect();
        // Chips with a zero-offset boot ROM vector place the bootloader image
        // itself at 0x0 rather than the usual 0x1000.
        if matches!(self, Chip::Esp32c2 | Chip::Esp32c3 | Chip::Esp32c6 | Chip::Esp32h2 | Chip::Esp32s3) {
            offsets.insert(FlashRegion::Bootloader, 0x0000);
        }
        offsets
    }
}

/// A logical area of on-chip flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlashRegion {
    /// The second-stage bootloader image.
    Bootloader,
    /// The bootloader's own descriptor/header region.
    AppBootloader,
    PartitionTable,
    App0,
    App1,
    Nvs,
}

impl FlashRegion {
    pub const ALL: [FlashRegion; 6] = [
        FlashRegion::Bootloader,
        FlashRegion::AppBootloader,
        FlashRegion::PartitionTable,
        FlashRegion::App0,
        FlashRegion::App1,
        FlashRegion::Nvs,
    ];

    /// Default offset, before any chip-specific override.
    pub fn default_offset(self) -> u32 {
        match self {
            FlashRegion::Bootloader => 0x1000,
            FlashRegion::AppBootloader => 0x0000,
            FlashRegion::PartitionTable => 0x8000,
            FlashRegion::App0 => 0x10000,
            FlashRegion::App1 => 0x110000,
            FlashRegion::Nvs => 0x9000,
        }
    }

    /// Default size; chips do not override region sizes, only offsets.
    pub fn default_size(self) -> u32 {
        match self {
            FlashRegion::Bootloader => 0x7000,
            FlashRegion::AppBootloader => 0x1000,
            FlashRegion::PartitionTable => 0x1000,
            FlashRegion::App0 => 0x100000,
            FlashRegion::App1 => 0x100000,
            FlashRegion::Nvs => 0x6000,
        }
    }
}

/// Immutable per-chip metadata; one instance per [`Chip`] variant, built on
/// demand rather than stored in a table (there's no mutable state to share).
#[derive(Clone, Debug)]
pub struct ChipInfo {
    pub kind: Chip,
    pub id: u16,
    pub readable_name: &'static str,
    pub magic_values: &'static [u32],
    pub region_offsets: HashMap<FlashRegion, u32>,
    pub stub_blob_ref: Option<&'static str>,
}

impl From<Chip> for ChipInfo {
    fn from(chip: Chip) -> Self {
        ChipInfo {
            kind: chip,
            id: chip.id(),
            readable_name: chip.readable_name(),
            magic_values: chip.magic_values(),
            region_offsets: chip.region_offsets(),
            stub_blob_ref: chip.stub_blob_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_magic_finds_esp32() {
        assert_eq!(Chip::from_magic(0x00f0_1d83), Some(Chip::Esp32));
    }

    #[test]
    fn from_magic_unknown_is_none() {
        assert_eq!(Chip::from_magic(0xDEAD_BEEF), None);
    }

    #[test]
    fn esp32c2_registers_both_open_question_magics() {
        let values = Chip::Esp32c2.magic_values();
        assert!(values.contains(&0x6f51_306f));
        assert!(values.contains(&0x7C3062EF));
    }

    #[test]
    fn encryption_capable_set_matches_glossary() {
        for chip in [
            Chip::Esp32s3,
            Chip::Esp32s2,
            Chip::Esp32c2,
            Chip::Esp32c3,
            Chip::Esp32c6,
            Chip::Esp32h2,
        ] {
            assert!(chip.supports_encryption());
        }
        assert!(!Chip::Esp32.supports_encryption());
        assert!(!Chip::Esp8266.supports_encryption());
    }

    #[test]
    fn esp8266_has_no_stub() {
        assert!(!Chip::Esp8266.has_stub());
        assert!(Chip::Esp32.has_stub());
    }

    #[test]
    fn stub_blob_ref_is_null_only_for_esp8266() {
        assert_eq!(Chip::Esp8266.stub_blob_ref(), None);
        assert_eq!(Chip::Esp32c3.stub_blob_ref(), Some("esp32c3"));
    }
}
