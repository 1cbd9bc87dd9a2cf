//! Structural validation of cached tile files.
//!
//! A tile that is truncated, empty, or not a real PNG must never be served;
//! callers delete invalid files so the next request regenerates them.

use std::fs;
use std::path::Path;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const MAX_TILE_DIMENSION: u32 = 16384;

/// Result of inspecting a tile file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFileStatus {
    /// File does not exist.
    Missing,
    /// File exists but fails validation and should be deleted.
    Invalid,
    /// File is a structurally sound tile.
    Valid,
}

/// Inspect a tile file: present, non-empty, above the optional minimum
/// size, and structurally a PNG (signature + IHDR with sane dimensions).
pub fn tile_file_status(path: &Path, min_bytes: Option<u64>) -> TileFileStatus {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return TileFileStatus::Missing,
    };
    if !meta.is_file() {
        return TileFileStatus::Missing;
    }
    if meta.len() == 0 {
        return TileFileStatus::Invalid;
    }
    if let Some(min) = min_bytes {
        if meta.len() < min {
            return TileFileStatus::Invalid;
        }
    }

    match fs::read(path) {
        Ok(bytes) if png_header_ok(&bytes) => TileFileStatus::Valid,
        Ok(_) => TileFileStatus::Invalid,
        Err(_) => TileFileStatus::Invalid,
    }
}

/// Validate the PNG signature and IHDR chunk.
///
/// Layout: 8-byte signature, 4-byte chunk length (13 for IHDR), the ASCII
/// chunk type `IHDR`, then 4-byte big-endian width and height.
pub fn png_header_ok(bytes: &[u8]) -> bool {
    if bytes.len() < 33 {
        return false;
    }
    if bytes[0..8] != PNG_SIGNATURE {
        return false;
    }
    let ihdr_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if ihdr_len != 13 || &bytes[12..16] != b"IHDR" {
        return false;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    width >= 1 && width <= MAX_TILE_DIMENSION && height >= 1 && height <= MAX_TILE_DIMENSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Minimal structurally valid PNG prefix: signature + IHDR for a
    /// 256x256 image. Not a decodable image, but passes the header check.
    pub(crate) fn fake_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PNG_SIGNATURE);
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        // bit depth, color type, compression, filter, interlace
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        // CRC placeholder
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn test_valid_png_header() {
        assert!(png_header_ok(&fake_png(256, 256)));
        assert!(png_header_ok(&fake_png(1, 1)));
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(!png_header_ok(b""));
        assert!(!png_header_ok(b"GIF89a"));
        assert!(!png_header_ok(&fake_png(0, 256)));
        assert!(!png_header_ok(&fake_png(256, 20000)));

        let mut truncated = fake_png(256, 256);
        truncated.truncate(12);
        assert!(!png_header_ok(&truncated));
    }

    #[test]
    fn test_file_status() {
        let dir = tempdir().unwrap();

        let missing = dir.path().join("missing.png");
        assert_eq!(tile_file_status(&missing, None), TileFileStatus::Missing);

        let empty = dir.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(tile_file_status(&empty, None), TileFileStatus::Invalid);

        let good = dir.path().join("good.png");
        std::fs::write(&good, fake_png(256, 256)).unwrap();
        assert_eq!(tile_file_status(&good, None), TileFileStatus::Valid);

        // Below the configured minimum size.
        assert_eq!(tile_file_status(&good, Some(10_000)), TileFileStatus::Invalid);

        let junk = dir.path().join("junk.png");
        std::fs::write(&junk, b"<html>error page</html>").unwrap();
        assert_eq!(tile_file_status(&junk, None), TileFileStatus::Invalid);
    }
}
