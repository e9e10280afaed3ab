//! Payload checksum, digest, and compression helpers used by the wire codec.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use std::io::Write;

const CHECKSUM_INIT: u8 = 0xEF;

/// XOR checksum seeded with `0xEF`, computed over the raw (unescaped,
/// uncompressed) chunk before it is SLIP-framed. Widened to `u32` for the
/// wire, which carries it in the command header's `checksum` field.
pub fn checksum(data: &[u8]) -> u32 {
    let mut check = CHECKSUM_INIT;
    for &byte in data {
        check ^= byte;
    }
    check as u32
}

/// MD5 digest of `data`, as used by `flash_md5_verify` to compare against
/// the device-reported digest.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render a digest as the lowercase hex string the device reports.
pub fn digest_to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Deflate-compress `data` for `flash_defl_write`. Espressif's bootloaders
/// accept raw zlib (RFC 1950) streams, not raw DEFLATE. Always compresses at
/// the maximum level: a slower host-side compress trades for fewer bytes
/// sent over what is usually the bottleneck link.
pub fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}
