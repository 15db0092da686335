//! Firmware image codecs (C9): segment packing, flash-mapping alignment,
//! and the two on-flash binary layouts.

pub mod v1;
pub mod v2;

use crate::command::{checksum, CHECKSUM_INIT};
use crate::error::Error;
use crate::targets::{MemTag, VariantDescriptor};

/// Alignment of the chip's execute-in-place flash mapping: flash segments
/// must land at a file offset congruent to their load address mod this.
pub const IROM_ALIGN: u32 = 0x1_0000;

/// Size of a segment's on-disk header (`load_addr:u32 || len:u32`).
pub const SEG_HEADER_LEN: u32 = 8;

/// One segment of a firmware image: a contiguous range of bytes destined
/// for `load_address`. Per the data model, a nonzero load address requires
/// `bytes.len()` to be a multiple of 4 (the caller is expected to have
/// zero-padded; [`Segment::new`] does this).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub load_address: u32,
    pub bytes: Vec<u8>,
    pub file_offset: Option<u32>,
    pub include_in_checksum: bool,
}

impl Segment {
    pub fn new(load_address: u32, mut bytes: Vec<u8>) -> Self {
        if load_address != 0 {
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
        }
        Segment {
            load_address,
            bytes,
            file_offset: None,
            include_in_checksum: true,
        }
    }

    fn mem_tag(&self, variant: &VariantDescriptor) -> MemTag {
        variant.addr_tag(self.load_address)
    }

    fn is_flash_mapped(&self, variant: &VariantDescriptor) -> bool {
        matches!(self.mem_tag(variant), MemTag::Irom | MemTag::Drom)
    }
}

/// XOR-fold every checksummed segment's bytes, seeded with
/// [`crate::command::CHECKSUM_INIT`].
pub fn segment_checksum(segments: &[Segment]) -> u8 {
    segments
        .iter()
        .filter(|s| s.include_in_checksum)
        .fold(CHECKSUM_INIT, |acc, s| checksum(&s.bytes, acc))
}

/// Zero bytes needed, written at absolute file offset `file_len_so_far`, so
/// that the checksum byte which follows them lands on the last byte of a
/// 16-byte aligned block (`align_file_position` in the reference tool).
pub fn checksum_padding(file_len_so_far: usize) -> usize {
    15 - (file_len_so_far % 16)
}

/// Merge adjacent segments that share memory classification and checksum
/// inclusion, preserving order (§4.9 "Merging"). Enforces the 16-segment
/// cap on the result.
pub fn merge_adjacent(segments: Vec<Segment>, variant: &VariantDescriptor) -> Result<Vec<Segment>, Error> {
    let mut merged: Vec<Segment> = Vec::new();
    for seg in segments {
        if let Some(last) = merged.last_mut() {
            let same_region = last.mem_tag(variant) == seg.mem_tag(variant);
            let same_checksum_class = last.include_in_checksum == seg.include_in_checksum;
            let adjacent = last.load_address + last.bytes.len() as u32 == seg.load_address;
            if same_region && same_checksum_class && adjacent {
                last.bytes.extend_from_slice(&seg.bytes);
                continue;
            }
        }
        merged.push(seg);
    }
    if merged.len() > 16 {
        return Err(Error::TooManySegments(merged.len()));
    }
    Ok(merged)
}

/// The padding, in bytes, a flash segment at `seg_addr` needs before it so
/// that its data starts `SEG_HEADER_LEN` bytes past a position congruent to
/// `seg_addr` mod [`IROM_ALIGN`], given `cursor` bytes already written.
/// Mirrors the reference tool's `get_alignment_data_needed`, which performs
/// two successive subtractions that can each go negative before wrapping
/// back into range; done here in `i64` to avoid spurious `u32` underflow.
fn alignment_data_needed(cursor: u32, seg_addr: u32) -> u32 {
    let align_past = (seg_addr as i64 % IROM_ALIGN as i64) - SEG_HEADER_LEN as i64;
    let mut pad_len = (IROM_ALIGN as i64 - (cursor as i64 % IROM_ALIGN as i64)) + align_past;
    if pad_len == 0 || pad_len == IROM_ALIGN as i64 {
        return 0;
    }
    pad_len -= SEG_HEADER_LEN as i64;
    if pad_len < 0 {
        pad_len += IROM_ALIGN as i64;
    }
    pad_len as u32
}

/// Flash-mapped segment packing (§4.9, newer variants only): split the
/// segments into flash- and RAM-mapped groups, each sorted by address. Walk
/// the flash segments in order; before each one, pad with bytes stolen from
/// the front of the remaining RAM segments (or synthesized zero data if none
/// is available) until that flash segment's file offset is congruent to its
/// load address mod [`IROM_ALIGN`]. Once every flash segment is placed,
/// append whatever RAM segments are left, in their original order.
///
/// Two flash segments mapping into the same 64 KiB page fail with
/// `DuplicateMapping`. For variants without the extended image header (the
/// older variant), this alignment pass does not apply: segments keep their
/// given order and simply receive sequential file offsets.
pub fn pack_flash_mapped(
    segments: Vec<Segment>,
    variant: &VariantDescriptor,
    header_len: u32,
) -> Result<Vec<Segment>, Error> {
    let mut cursor = header_len;

    if !variant.uses_extended_image_header {
        let mut out = Vec::with_capacity(segments.len());
        for mut seg in segments {
            seg.file_offset = Some(cursor);
            cursor += SEG_HEADER_LEN + seg.bytes.len() as u32;
            out.push(seg);
        }
        return Ok(out);
    }

    let mut flash_segments: Vec<Segment> = segments.iter().filter(|s| s.is_flash_mapped(variant)).cloned().collect();
    flash_segments.sort_by_key(|s| s.load_address);
    let mut ram_segments: Vec<Segment> = segments.into_iter().filter(|s| !s.is_flash_mapped(variant)).collect();
    ram_segments.sort_by_key(|s| s.load_address);
    let mut ram_segments: std::collections::VecDeque<Segment> = ram_segments.into();

    for pair in flash_segments.windows(2) {
        if pair[0].load_address / IROM_ALIGN == pair[1].load_address / IROM_ALIGN {
            return Err(Error::DuplicateMapping(pair[1].load_address, pair[0].load_address));
        }
    }

    let mut out = Vec::new();
    let mut flash_segments: std::collections::VecDeque<Segment> = flash_segments.into();

    while let Some(segment) = flash_segments.front() {
        let pad_len = alignment_data_needed(cursor, segment.load_address);
        if pad_len > 0 {
            let can_split_ram =
                matches!(ram_segments.front(), Some(ram) if pad_len > SEG_HEADER_LEN && (ram.bytes.len() as u32) >= pad_len);
            let mut pad_seg = if can_split_ram {
                let ram = ram_segments.front_mut().expect("checked by can_split_ram above");
                let split_at = pad_len as usize;
                let pad_bytes: Vec<u8> = ram.bytes.drain(..split_at).collect();
                let pad_addr = ram.load_address;
                ram.load_address += split_at as u32;
                let fully_consumed = ram.bytes.is_empty();
                if fully_consumed {
                    ram_segments.pop_front();
                }
                Segment { load_address: pad_addr, bytes: pad_bytes, file_offset: None, include_in_checksum: true }
            } else {
                Segment::new(0, vec![0u8; pad_len as usize])
            };
            pad_seg.file_offset = Some(cursor);
            cursor += SEG_HEADER_LEN + pad_seg.bytes.len() as u32;
            out.push(pad_seg);
        } else {
            let mut segment = flash_segments.pop_front().expect("front() just returned Some");
            segment.file_offset = Some(cursor);
            cursor += SEG_HEADER_LEN + segment.bytes.len() as u32;
            out.push(segment);
        }
    }

    for mut segment in ram_segments {
        segment.file_offset = Some(cursor);
        cursor += SEG_HEADER_LEN + segment.bytes.len() as u32;
        out.push(segment);
    }

    Ok(out)
}

/// Which secure-boot signing scheme a secure-pad tail reserves room for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurePadMode {
    /// Secure Boot V1: digest + version + signature + alignment trailer.
    V1,
    /// Secure Boot V2: digest only (the signature sector is appended after
    /// the 64 KiB boundary by the signing tool).
    V2,
}

impl SecurePadMode {
    fn space_after_checksum(self) -> u32 {
        match self {
            SecurePadMode::V1 => 32 + 4 + 64 + 12,
            SecurePadMode::V2 => 32,
        }
    }
}

/// Build the zero-filled padding segment that makes a signed image end on a
/// 64 KiB boundary (§4.9 "Secure-pad"), given the file length written so
/// far (before this segment's own header).
pub fn secure_pad_segment(file_len_so_far: u32, mode: SecurePadMode) -> Segment {
    const CHECKSUM_SPACE: u32 = 16;
    let align_past = (file_len_so_far + SEG_HEADER_LEN) % IROM_ALIGN;
    let reserved = CHECKSUM_SPACE + mode.space_after_checksum();
    let pad_len = (IROM_ALIGN + IROM_ALIGN - align_past - reserved) % IROM_ALIGN;
    Segment::new(0, vec![0u8; pad_len as usize])
}

/// Replace the bytes at absolute file offset `sha_offset` with `digest`,
/// the SHA-256 of the source ELF (§4.9 "SHA patching"). The window must
/// fall strictly inside one segment's data area, over existing zero bytes.
pub fn patch_sha256(segments: &mut [Segment], sha_offset: u32, digest: &[u8; 32]) -> Result<(), Error> {
    for seg in segments.iter_mut() {
        let header_pos = match seg.file_offset {
            Some(pos) => pos,
            None => continue,
        };
        let data_start = header_pos + SEG_HEADER_LEN;
        let data_end = data_start + seg.bytes.len() as u32;
        if sha_offset < data_start || sha_offset >= data_end {
            continue;
        }
        let patch_offset = (sha_offset - data_start) as usize;
        if patch_offset + digest.len() > seg.bytes.len() {
            return Err(Error::ShaPatch(format!(
                "digest at offset 0x{sha_offset:08x} would overrun its segment"
            )));
        }
        if seg.bytes[patch_offset..patch_offset + digest.len()] != [0u8; 32] {
            return Err(Error::ShaPatch(format!(
                "bytes at offset 0x{sha_offset:08x} are not all zero, refusing to overwrite"
            )));
        }
        seg.bytes[patch_offset..patch_offset + digest.len()].copy_from_slice(digest);
        return Ok(());
    }
    Err(Error::ShaPatch(format!(
        "offset 0x{sha_offset:08x} does not fall inside any segment's data area"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_pad_v1_reserves_128_bytes_after_checksum() {
        let pad = secure_pad_segment(0, SecurePadMode::V1);
        let total = pad.bytes.len() as u32 + SEG_HEADER_LEN + 16 + SecurePadMode::V1.space_after_checksum();
        assert_eq!(total % IROM_ALIGN, 0);
    }

    #[test]
    fn secure_pad_v2_reserves_32_bytes_after_checksum() {
        let pad = secure_pad_segment(0x5_000, SecurePadMode::V2);
        let total = 0x5_000 + pad.bytes.len() as u32 + SEG_HEADER_LEN + 16 + SecurePadMode::V2.space_after_checksum();
        assert_eq!(total % IROM_ALIGN, 0);
    }

    #[test]
    fn patch_sha256_overwrites_zeroed_window() {
        let mut segments = vec![Segment {
            load_address: 0x4010_0000,
            bytes: vec![0u8; 40],
            file_offset: Some(16),
            include_in_checksum: true,
        }];
        let digest = [0xAAu8; 32];
        patch_sha256(&mut segments, 24, &digest).unwrap();
        assert_eq!(&segments[0].bytes[0..32], &digest);
    }

    #[test]
    fn patch_sha256_rejects_nonzero_existing_bytes() {
        let mut segments = vec![Segment {
            load_address: 0,
            bytes: vec![1u8; 40],
            file_offset: Some(16),
            include_in_checksum: true,
        }];
        assert!(patch_sha256(&mut segments, 24, &[0xAAu8; 32]).is_err());
    }

    #[test]
    fn segment_new_pads_nonzero_address_to_word_multiple() {
        let seg = Segment::new(0x4010_0000, vec![1, 2, 3]);
        assert_eq!(seg.bytes.len(), 4);
    }

    #[test]
    fn segment_new_does_not_pad_zero_address() {
        let seg = Segment::new(0, vec![1, 2, 3]);
        assert_eq!(seg.bytes.len(), 3);
    }

    #[test]
    fn checksum_padding_completes_to_sixteen_byte_block() {
        assert_eq!(checksum_padding(0), 15);
        assert_eq!(checksum_padding(15), 0);
        // Matches the reference tool's align_file_position(f, 16): an
        // 8-byte common header plus an 8-byte segment header plus 8 bytes
        // of data leaves 7 bytes of padding before the checksum byte.
        assert_eq!(checksum_padding(24), 7);
    }

    #[test]
    fn pack_flash_mapped_defers_ram_segments_past_both_flash_regions() {
        use crate::targets::{self, VariantId};
        let variant = targets::by_id(VariantId::Esp32);

        // One RAM segment below the flash window, one flash segment, and
        // one RAM segment above it: the reference algorithm places every
        // flash segment first and only then emits the leftover RAM
        // segments, so the RAM segment above the flash region must not
        // end up sandwiched ahead of it in the packed order.
        let ram_low = Segment::new(0x4008_0000, vec![0xAA; 32]);
        let flash = Segment::new(0x400D_0000, vec![0xBB; 32]);
        let ram_high = Segment::new(0x400C_0000, vec![0xCC; 32]);

        let packed = pack_flash_mapped(vec![ram_low.clone(), flash.clone(), ram_high.clone()], variant, 8).unwrap();

        let flash_pos = packed.iter().position(|s| s.load_address == flash.load_address).unwrap();
        let ram_low_pos = packed.iter().position(|s| s.load_address == ram_low.load_address).unwrap();
        let ram_high_pos = packed.iter().position(|s| s.load_address == ram_high.load_address).unwrap();
        assert!(flash_pos < ram_high_pos, "flash segment must be emitted before the RAM segment above it");
        assert!(ram_low_pos < flash_pos, "RAM segments already ahead of the flash window keep their order");
    }

    #[test]
    fn pack_flash_mapped_aligns_flash_segment_to_irom_boundary() {
        use crate::targets::{self, VariantId};
        let variant = targets::by_id(VariantId::Esp32);
        let flash = Segment::new(0x400D_0000, vec![0xBB; 32]);

        let packed = pack_flash_mapped(vec![flash.clone()], variant, 8).unwrap();
        let flash_out = packed.iter().find(|s| s.load_address == flash.load_address).unwrap();
        let data_start = flash_out.file_offset.unwrap() + SEG_HEADER_LEN;
        assert_eq!(data_start % IROM_ALIGN, flash.load_address % IROM_ALIGN);
    }

    #[test]
    fn pack_flash_mapped_rejects_two_segments_in_the_same_page() {
        use crate::targets::{self, VariantId};
        let variant = targets::by_id(VariantId::Esp32);
        let a = Segment::new(0x400D_0000, vec![0xBB; 32]);
        let b = Segment::new(0x400D_4000, vec![0xCC; 32]);

        assert!(pack_flash_mapped(vec![a, b], variant, 8).is_err());
    }

    #[test]
    fn pack_flash_mapped_skips_alignment_on_variants_without_extended_header() {
        use crate::targets::{self, VariantId};
        let variant = targets::by_id(VariantId::Esp8266);
        let a = Segment::new(0x4010_0000, vec![0xBB; 32]);
        let b = Segment::new(0x0000_0000, vec![0xCC; 32]);

        let packed = pack_flash_mapped(vec![a.clone(), b.clone()], variant, 8).unwrap();
        assert_eq!(packed[0].load_address, a.load_address);
        assert_eq!(packed[0].file_offset, Some(8));
        assert_eq!(packed[1].load_address, b.load_address);
    }
}
