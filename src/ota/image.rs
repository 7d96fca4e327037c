//! ESP application image format: header gate and structural verification.
//!
//! Layout of an image as produced by `esptool elf2image`:
//!
//! ```text
//! 0        24-byte image header (magic 0xE9, segment count, flash params, entry, chip id, hash flag)
//! 24       segment headers + data  (8-byte {load_addr, data_len} followed by data_len bytes)
//! ...      zero padding so that the checksum lands on offset % 16 == 15
//! n        1-byte XOR checksum over all segment data, seeded with 0xEF
//! n+1      optional 32-byte SHA-256 over bytes 0..=n (present when hash_appended != 0)
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ESP_IMAGE_MAGIC: u8 = 0xE9;
/// Image header plus the first segment header.
pub const MIN_HEADER_LEN: usize = 32;
pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const MAX_SEGMENTS: u8 = 16;
pub const CHECKSUM_SEED: u8 = 0xEF;
pub const DIGEST_LEN: usize = 32;

const CHIP_ID_ESP32S3: u16 = 0x0009;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("image header needs 32 bytes, got {len}")]
    TooShort { len: usize },
    #[error("invalid firmware magic byte 0x{found:02x} (expected 0xe9)")]
    BadMagic { found: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("image declares no segments")]
    NoSegments,
    #[error("image declares {count} segments (max 16)")]
    TooManySegments { count: u8 },
    #[error("image truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("checksum mismatch: stored 0x{stored:02x}, computed 0x{computed:02x}")]
    ChecksumMismatch { stored: u8, computed: u8 },
    #[error("appended SHA-256 digest does not match image contents")]
    DigestMismatch,
}

/// Fields of the leading image header that are useful for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub segment_count: u8,
    pub spi_mode: u8,
    pub flash_params: u8,
    pub entry_addr: u32,
    pub chip_id: u16,
    pub hash_appended: bool,
}

/// Result of a successful structural walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub header: ImageHeader,
    /// Bytes covered by header, segments, checksum and optional digest.
    pub image_len: usize,
    pub digest: Option<[u8; DIGEST_LEN]>,
}

/// Cheap check usable as soon as the first byte of an upload arrives.
pub fn magic_matches(first_byte: u8) -> bool {
    first_byte == ESP_IMAGE_MAGIC
}

/// Validates the leading bytes of an upload before anything is written to flash.
pub fn check_header(bytes: &[u8]) -> Result<ImageHeader, HeaderError> {
    if bytes.len() < MIN_HEADER_LEN {
        return Err(HeaderError::TooShort { len: bytes.len() });
    }
    if !magic_matches(bytes[0]) {
        return Err(HeaderError::BadMagic { found: bytes[0] });
    }

    Ok(ImageHeader {
        segment_count: bytes[1],
        spi_mode: bytes[2],
        flash_params: bytes[3],
        entry_addr: read_u32(bytes, 4),
        chip_id: u16::from_le_bytes([bytes[12], bytes[13]]),
        hash_appended: bytes[23] != 0,
    })
}

/// Walks the whole image: segments, checksum trailer and optional SHA-256 digest.
///
/// Bytes after the end of the image (erased flash padding) are ignored.
pub fn verify_image(bytes: &[u8]) -> Result<ImageSummary, ImageError> {
    let header = check_header(bytes)?;

    if header.segment_count == 0 {
        return Err(ImageError::NoSegments);
    }
    if header.segment_count > MAX_SEGMENTS {
        return Err(ImageError::TooManySegments {
            count: header.segment_count,
        });
    }

    let mut offset = IMAGE_HEADER_LEN;
    let mut checksum = CHECKSUM_SEED;

    for _ in 0..header.segment_count {
        require(bytes, offset + SEGMENT_HEADER_LEN)?;
        let data_len = read_u32(bytes, offset + 4) as usize;
        let data_start = offset + SEGMENT_HEADER_LEN;
        let data_end = data_start
            .checked_add(data_len)
            .ok_or(ImageError::Truncated {
                needed: usize::MAX,
                available: bytes.len(),
            })?;
        require(bytes, data_end)?;

        checksum = bytes[data_start..data_end]
            .iter()
            .fold(checksum, |acc, b| acc ^ b);
        offset = data_end;
    }

    let checksum_pos = checksum_offset(offset);
    require(bytes, checksum_pos + 1)?;
    let stored = bytes[checksum_pos];
    if stored != checksum {
        return Err(ImageError::ChecksumMismatch {
            stored,
            computed: checksum,
        });
    }

    let mut image_len = checksum_pos + 1;
    let mut digest = None;

    if header.hash_appended {
        require(bytes, image_len + DIGEST_LEN)?;
        let computed: [u8; DIGEST_LEN] = Sha256::digest(&bytes[..image_len]).into();
        if computed[..] != bytes[image_len..image_len + DIGEST_LEN] {
            return Err(ImageError::DigestMismatch);
        }
        digest = Some(computed);
        image_len += DIGEST_LEN;
    }

    Ok(ImageSummary {
        header,
        image_len,
        digest,
    })
}

/// Builds a structurally valid image from `(load_addr, data)` segments.
pub fn assemble_image(entry_addr: u32, segments: &[(u32, &[u8])], append_digest: bool) -> Vec<u8> {
    let mut image = Vec::new();

    image.push(ESP_IMAGE_MAGIC);
    image.push(segments.len() as u8);
    image.push(0x02); // DIO
    image.push(0x20); // 4MB, 40MHz
    image.extend_from_slice(&entry_addr.to_le_bytes());
    image.push(0xEE); // wp_pin disabled
    image.extend_from_slice(&[0, 0, 0]);
    image.extend_from_slice(&CHIP_ID_ESP32S3.to_le_bytes());
    image.push(0);
    image.extend_from_slice(&[0, 0, 0xFF, 0xFF]);
    image.extend_from_slice(&[0; 4]);
    image.push(append_digest as u8);

    let mut checksum = CHECKSUM_SEED;
    for (load_addr, data) in segments {
        image.extend_from_slice(&load_addr.to_le_bytes());
        image.extend_from_slice(&(data.len() as u32).to_le_bytes());
        image.extend_from_slice(data);
        checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
    }

    image.resize(checksum_offset(image.len()), 0);
    image.push(checksum);

    if append_digest {
        let digest = Sha256::digest(&image);
        image.extend_from_slice(&digest);
    }

    image
}

// The checksum byte sits at the last position of the current 16-byte block.
fn checksum_offset(end_of_segments: usize) -> usize {
    end_of_segments | 0x0F
}

fn require(bytes: &[u8], needed: usize) -> Result<(), ImageError> {
    if bytes.len() < needed {
        Err(ImageError::Truncated {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(append_digest: bool) -> Vec<u8> {
        assemble_image(
            0x4037_5000,
            &[
                (0x3FC8_8000, &[1u8, 2, 3, 4, 5, 6, 7, 8][..]),
                (0x4037_0000, &[0xAAu8; 20][..]),
            ],
            append_digest,
        )
    }

    #[test]
    fn header_gate_rejects_short_and_bad_magic() {
        assert_eq!(check_header(&[0xE9; 31]), Err(HeaderError::TooShort { len: 31 }));

        let mut bytes = [0u8; 40];
        assert_eq!(check_header(&bytes), Err(HeaderError::BadMagic { found: 0 }));

        bytes[0] = 0xE9;
        assert!(check_header(&bytes).is_ok());
    }

    #[test]
    fn header_fields_are_decoded() {
        let header = check_header(&sample(true)).unwrap();
        assert_eq!(header.segment_count, 2);
        assert_eq!(header.entry_addr, 0x4037_5000);
        assert_eq!(header.chip_id, CHIP_ID_ESP32S3);
        assert!(header.hash_appended);
    }

    #[test]
    fn assembled_images_verify() {
        for digest in [false, true] {
            let image = sample(digest);
            let summary = verify_image(&image).unwrap();
            assert_eq!(summary.image_len, image.len());
            assert_eq!(summary.digest.is_some(), digest);
            assert_eq!((summary.image_len - if digest { 32 } else { 0 }) % 16, 0);
        }
    }

    #[test]
    fn trailing_erased_flash_is_ignored() {
        let mut image = sample(true);
        let len = image.len();
        image.extend_from_slice(&[0xFF; 64]);
        assert_eq!(verify_image(&image).unwrap().image_len, len);
    }

    #[test]
    fn truncated_image_is_incomplete() {
        let image = sample(false);
        let cut = &image[..image.len() - 1];
        assert!(matches!(verify_image(cut), Err(ImageError::Truncated { .. })));

        let image = sample(true);
        let cut = &image[..image.len() - 10];
        assert!(matches!(verify_image(cut), Err(ImageError::Truncated { .. })));
    }

    #[test]
    fn corrupted_segment_fails_checksum() {
        let mut image = sample(false);
        image[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN] ^= 0x01;
        assert!(matches!(
            verify_image(&image),
            Err(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_digest_is_rejected() {
        let mut image = sample(true);
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert_eq!(verify_image(&image), Err(ImageError::DigestMismatch));
    }

    #[test]
    fn header_only_upload_is_not_an_image() {
        let mut bytes = vec![0u8; 40];
        bytes[0] = ESP_IMAGE_MAGIC;
        assert_eq!(verify_image(&bytes), Err(ImageError::NoSegments));
    }
}
