//! High-level operations (C11): `write_flash`, `verify_flash`, `elf2image`,
//! `hard_reset` composed from the connection and flasher primitives.

use md5::{Digest, Md5};

use crate::config::FlashSettings;
use crate::connection::reset;
use crate::error::Error;
use crate::flasher::{Flasher, Progress};
use crate::image::v1;
use crate::image::{merge_adjacent, pack_flash_mapped, Segment};
use crate::targets::VariantDescriptor;

/// One region to write: raw bytes destined for a flash offset.
pub struct FlashWrite<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

/// Write each region to flash, preferring deflate on ROMs/stubs that
/// support it, falling back to the raw path otherwise.
pub fn write_flash(
    flasher: &mut Flasher,
    writes: &[FlashWrite<'_>],
    mut progress: Option<&mut Progress<'_>>,
) -> Result<(), Error> {
    let use_deflate = flasher.connection().is_stub() || flasher.variant().rom_supports_deflate;

    for write in writes {
        if use_deflate {
            flasher.write_flash_deflated(write.data, write.offset, progress.as_deref_mut())?;
        } else {
            flasher.flash_begin(write.data.len() as u32, write.offset, false)?;
            let block_size = if flasher.connection().is_stub() { 0x4000 } else { 0x400 };
            let mut written = 0u32;
            for (seq, chunk) in write.data.chunks(block_size).enumerate() {
                flasher.flash_block(chunk, seq as u32)?;
                written += chunk.len() as u32;
                if let Some(cb) = progress.as_deref_mut() {
                    cb(written, write.data.len() as u32);
                }
            }
            flasher.flash_finish(false)?;
        }
    }
    Ok(())
}

/// Re-read each written region and compare its MD5 digest against the
/// bytes that were sent, failing with [`Error::Verify`] on mismatch.
pub fn verify_flash(flasher: &mut Flasher, writes: &[FlashWrite<'_>]) -> Result<(), Error> {
    for write in writes {
        let expected: [u8; 16] = Md5::digest(write.data).into();
        let actual = match flasher.checksum_md5(write.offset, write.data.len() as u32) {
            Ok(digest) => digest,
            Err(Error::UnsupportedCommand(_)) => {
                let data = flasher.read_flash(write.offset, write.data.len() as u32, None)?;
                Md5::digest(&data).into()
            }
            Err(e) => return Err(e),
        };
        if actual != expected {
            return Err(Error::Verify {
                expected: u128::from_be_bytes(expected),
                actual: u128::from_be_bytes(actual),
            });
        }
    }
    Ok(())
}

/// Pack a set of raw ELF-derived segments into flashable, flash-mapping
/// aligned, merged segments (§4.9), ready to serialize as an image.
pub fn elf2image(
    segments: Vec<Segment>,
    variant: &'static VariantDescriptor,
    header_len: u32,
) -> Result<Vec<Segment>, Error> {
    let merged = merge_adjacent(segments, variant)?;
    pack_flash_mapped(merged, variant, header_len)
}

/// Default extended-header drive strengths: every drive-strength field at 0
/// and the write-protect pin disabled, matching the reference tool's
/// defaults for boards that don't override them explicitly.
fn default_extended_header(variant: &VariantDescriptor) -> v1::ExtendedHeader {
    v1::ExtendedHeader {
        wp_pin: 0xEE,
        clk_drv: 0,
        q_drv: 0,
        d_drv: 0,
        cs_drv: 0,
        hd_drv: 0,
        wp_drv: 0,
        chip_id: variant.image_chip_id.unwrap_or(0),
        min_rev: 0,
        append_digest: false,
    }
}

/// Build a complete, serialized firmware image (§4.9/§4.11) from raw
/// ELF-derived segments: merge and flash-align them, resolve `settings`
/// into the image header's flash-mode/size/frequency byte pair, and encode
/// the result as a V1 image. Every supported variant -- including the
/// ESP8266, which uses the original header with no extended block -- is
/// written through this one path.
pub fn build_image(
    segments: Vec<Segment>,
    variant: &'static VariantDescriptor,
    entry: u32,
    settings: &FlashSettings,
    default_size_name: &str,
) -> Result<Vec<u8>, Error> {
    let encoded = settings.encode(variant, default_size_name)?;
    let extended = variant.uses_extended_image_header.then(|| default_extended_header(variant));
    let header_len = 8 + if extended.is_some() { 16 } else { 0 };

    let packed = elf2image(segments, variant, header_len)?;
    let image = v1::Image {
        entry,
        flash_mode: encoded.flash_mode,
        size_freq: encoded.size_freq,
        segments: packed,
        extended,
    };
    image.to_bytes()
}

/// Toggle RTS low for 100 ms to reboot the target out of the bootloader.
pub fn hard_reset(connection: &mut crate::connection::Connection) -> Result<(), Error> {
    let port = connection.port_mut();
    reset::hard_reset(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_write_regions_are_independent() {
        let a = FlashWrite { offset: 0x1000, data: &[1, 2, 3] };
        let b = FlashWrite { offset: 0x9000, data: &[4, 5, 6] };
        assert_ne!(a.offset, b.offset);
    }

    #[test]
    fn build_image_writes_extended_header_for_newer_variants() {
        let variant = crate::targets::by_id(crate::targets::VariantId::Esp32);
        let segments = vec![Segment::new(0x400D_0000, vec![0xAB; 16])];
        let settings = FlashSettings {
            mode: Some(crate::config::FlashMode::Dio),
            size_name: Some("4MB"),
            freq: Some(crate::config::FlashFrequency::_40Mhz),
        };

        let bytes = build_image(segments, variant, 0x400D_0000, &settings, "4MB").unwrap();

        assert_eq!(bytes[0], 0xE9);
        assert_eq!(bytes[2], 2); // DIO
        assert_eq!(bytes[3], 0x20); // 4MB size nibble | 40MHz freq nibble
        let parsed = v1::Image::from_bytes(&bytes, true).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.extended.unwrap().chip_id, variant.image_chip_id.unwrap());
    }

    #[test]
    fn build_image_omits_extended_header_for_esp8266() {
        let variant = crate::targets::by_id(crate::targets::VariantId::Esp8266);
        let segments = vec![Segment::new(0x4010_0000, vec![0xAB; 16])];
        let settings = FlashSettings::default();

        let bytes = build_image(segments, variant, 0x4010_0000, &settings, "1MB").unwrap();
        let parsed = v1::Image::from_bytes(&bytes, false).unwrap();
        assert!(parsed.extended.is_none());
    }
}
