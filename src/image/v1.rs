//! Version 1 firmware image: the original header format, also used (with
//! an extended header) by every newer variant (§4.9).

use sha2::{Digest, Sha256};

use super::{checksum_padding, segment_checksum, Segment};
use crate::error::Error;

const MAGIC: u8 = 0xE9;
const SHA256_LEN: usize = 32;

/// The 16-byte block newer variants insert between the common header and
/// the first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub wp_pin: u8,
    pub clk_drv: u8,
    pub q_drv: u8,
    pub d_drv: u8,
    pub cs_drv: u8,
    pub hd_drv: u8,
    pub wp_drv: u8,
    pub chip_id: u16,
    pub min_rev: u8,
    pub append_digest: bool,
}

impl ExtendedHeader {
    fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0] = self.wp_pin;
        out[1] = (self.clk_drv << 4) | (self.q_drv & 0x0F);
        out[2] = (self.d_drv << 4) | (self.cs_drv & 0x0F);
        out[3] = (self.hd_drv << 4) | (self.wp_drv & 0x0F);
        out[4..6].copy_from_slice(&self.chip_id.to_le_bytes());
        out[6] = self.min_rev;
        // out[7..15] left zero.
        out[15] = u8::from(self.append_digest);
        out
    }

    fn from_bytes(b: &[u8; 16]) -> Self {
        ExtendedHeader {
            wp_pin: b[0],
            clk_drv: b[1] >> 4,
            q_drv: b[1] & 0x0F,
            d_drv: b[2] >> 4,
            cs_drv: b[2] & 0x0F,
            hd_drv: b[3] >> 4,
            wp_drv: b[3] & 0x0F,
            chip_id: u16::from_le_bytes([b[4], b[5]]),
            min_rev: b[6],
            append_digest: b[15] != 0,
        }
    }
}

/// A parsed or to-be-written V1 image.
#[derive(Debug, Clone)]
pub struct Image {
    pub entry: u32,
    pub flash_mode: u8,
    pub size_freq: u8,
    pub segments: Vec<Segment>,
    pub extended: Option<ExtendedHeader>,
}

impl Image {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.segments.len() > 16 {
            return Err(Error::TooManySegments(self.segments.len()));
        }

        let mut out = Vec::new();
        out.push(MAGIC);
        out.push(self.segments.len() as u8);
        out.push(self.flash_mode);
        out.push(self.size_freq);
        out.extend_from_slice(&self.entry.to_le_bytes());

        if let Some(ext) = self.extended {
            out.extend_from_slice(&ext.to_bytes());
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.load_address.to_le_bytes());
            out.extend_from_slice(&(seg.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&seg.bytes);
        }

        let checksum = segment_checksum(&self.segments);
        let pad = checksum_padding(out.len());
        out.resize(out.len() + pad, 0);
        out.push(checksum);

        if let Some(ext) = self.extended {
            if ext.append_digest {
                let digest = Sha256::digest(&out);
                out.extend_from_slice(&digest);
            }
        }

        Ok(out)
    }

    /// Parse a V1 image. `expect_extended_header` selects whether the
    /// 16-byte newer-variant block follows the common header.
    pub fn from_bytes(data: &[u8], expect_extended_header: bool) -> Result<Self, Error> {
        if data.len() < 8 || data[0] != MAGIC {
            return Err(Error::InvalidImage("bad V1 magic byte".into()));
        }
        let seg_count = data[1] as usize;
        if seg_count > 16 {
            return Err(Error::TooManySegments(seg_count));
        }
        let flash_mode = data[2];
        let size_freq = data[3];
        let entry = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let mut cursor = 8usize;
        let extended = if expect_extended_header {
            if data.len() < cursor + 16 {
                return Err(Error::InvalidImage("truncated extended header".into()));
            }
            let block: [u8; 16] = data[cursor..cursor + 16].try_into().unwrap();
            cursor += 16;
            Some(ExtendedHeader::from_bytes(&block))
        } else {
            None
        };

        let mut segments = Vec::with_capacity(seg_count);
        for _ in 0..seg_count {
            if data.len() < cursor + 8 {
                return Err(Error::InvalidImage("truncated segment header".into()));
            }
            let load_address = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap());
            let len = u32::from_le_bytes(data[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
            cursor += 8;
            if data.len() < cursor + len {
                return Err(Error::InvalidImage("truncated segment data".into()));
            }
            segments.push(Segment::new(load_address, data[cursor..cursor + len].to_vec()));
            cursor += len;
        }

        let pad = checksum_padding(cursor);
        let checksum_pos = cursor + pad;
        if data.len() <= checksum_pos {
            return Err(Error::InvalidImage("missing checksum byte".into()));
        }
        let stored_checksum = data[checksum_pos];
        let computed_checksum = segment_checksum(&segments);
        if stored_checksum != computed_checksum {
            return Err(Error::InvalidImage(format!(
                "checksum mismatch: stored 0x{stored_checksum:02x}, computed 0x{computed_checksum:02x}"
            )));
        }
        let mut after_checksum = checksum_pos + 1;

        if let Some(ext) = extended {
            if ext.append_digest {
                if data.len() < after_checksum + SHA256_LEN {
                    return Err(Error::InvalidImage("missing appended SHA-256 digest".into()));
                }
                let stored_digest = &data[after_checksum..after_checksum + SHA256_LEN];
                let computed_digest = Sha256::digest(&data[..after_checksum]);
                if stored_digest != computed_digest.as_slice() {
                    return Err(Error::InvalidImage("appended SHA-256 digest mismatch".into()));
                }
                after_checksum += SHA256_LEN;
            }
        }
        let _ = after_checksum;

        Ok(Image {
            entry,
            flash_mode,
            size_freq,
            segments,
            extended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_matches_documented_byte_layout() {
        let image = Image {
            entry: 0x4010_0000,
            flash_mode: 0x02,
            size_freq: 0x20,
            segments: vec![Segment::new(0x4010_0000, vec![0u8; 8])],
            extended: None,
        };
        let bytes = image.to_bytes().unwrap();

        let mut expected = vec![0xE9, 0x01, 0x02, 0x20];
        expected.extend_from_slice(&0x4010_0000u32.to_le_bytes());
        expected.extend_from_slice(&0x4010_0000u32.to_le_bytes());
        expected.extend_from_slice(&8u32.to_le_bytes());
        expected.extend_from_slice(&[0u8; 8]);
        expected.extend_from_slice(&[0u8; 7]);
        expected.push(0xEF);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn round_trip_preserves_segments_and_entry() {
        let image = Image {
            entry: 0x4010_0010,
            flash_mode: 0x00,
            size_freq: 0x00,
            segments: vec![
                Segment::new(0x4010_0000, vec![1, 2, 3, 4]),
                Segment::new(0x3FFE_8000, vec![9, 9, 9, 9, 9, 9, 9, 9]),
            ],
            extended: None,
        };
        let bytes = image.to_bytes().unwrap();
        let parsed = Image::from_bytes(&bytes, false).unwrap();
        assert_eq!(parsed.entry, image.entry);
        assert_eq!(parsed.segments, image.segments);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let image = Image {
            entry: 0,
            flash_mode: 0,
            size_freq: 0,
            segments: vec![Segment::new(0x4010_0000, vec![1, 2, 3, 4])],
            extended: None,
        };
        let mut bytes = image.to_bytes().unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        assert!(Image::from_bytes(&bytes, false).is_err());
    }
}
