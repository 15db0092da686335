//! Structured configuration values accepted at the crate boundary (§1: "the
//! core receives configuration as structured values"). These are plain
//! data, not parsed from any particular source.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::targets::VariantDescriptor;

/// SPI flash wiring mode, encoded into the low nibble of the image
/// header's `size_freq` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum FlashMode {
    Qio,
    Qout,
    #[default]
    Dio,
    Dout,
}

impl FlashMode {
    fn encoded(self) -> u8 {
        match self {
            FlashMode::Qio => 0,
            FlashMode::Qout => 1,
            FlashMode::Dio => 2,
            FlashMode::Dout => 3,
        }
    }
}

/// SPI flash clock frequency, encoded into the high nibble of the image
/// header's `size_freq` byte. The mapping is the same across every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum FlashFrequency {
    _20Mhz,
    _26Mhz,
    _40Mhz,
    _80Mhz,
}

impl FlashFrequency {
    fn encoded(self) -> u8 {
        match self {
            FlashFrequency::_40Mhz => 0,
            FlashFrequency::_26Mhz => 1,
            FlashFrequency::_20Mhz => 2,
            FlashFrequency::_80Mhz => 0xF,
        }
    }
}

/// User-selected flash parameters: any field left `None` falls back to
/// the value auto-detected from the chip or a variant-specific default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    pub size_name: Option<&'static str>,
    pub freq: Option<FlashFrequency>,
}

/// The three header fields a [`FlashSettings`] value resolves to.
pub struct EncodedFlashParams {
    /// The image header's separate `flash_mode` byte.
    pub flash_mode: u8,
    /// The image header's `size_freq` byte: the flash-size table's encoded
    /// nibble (already in the upper nibble) OR'd with the frequency nibble.
    pub size_freq: u8,
    /// The flash size in bytes, for callers that need it (e.g. to size a
    /// flash-mapped image).
    pub size_bytes: u32,
}

impl FlashSettings {
    /// Resolve `mode`/`freq`/`size_name` (or the variant's default size)
    /// into the three fields an image header packs them into (§4.9).
    pub fn encode(&self, variant: &VariantDescriptor, default_size_name: &str) -> Result<EncodedFlashParams, crate::Error> {
        let mode = self.mode.unwrap_or_default();
        let freq = self.freq.unwrap_or(FlashFrequency::_40Mhz);
        let size_name = self.size_name.unwrap_or(default_size_name);

        let size_nibble = variant
            .encode_flash_size(size_name)
            .ok_or_else(|| crate::Error::UnsupportedFlash(format!("unknown flash size \"{size_name}\"")))?;
        let size_bytes = variant
            .flash_size_for_detected_byte(size_nibble)
            .expect("encode_flash_size and flash_size_for_detected_byte agree on every table entry");

        Ok(EncodedFlashParams {
            flash_mode: mode.encoded(),
            size_freq: size_nibble | freq.encoded(),
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets;

    #[test]
    fn encode_packs_size_and_freq_into_size_freq_byte() {
        let variant = targets::by_id(targets::VariantId::Esp32);
        let settings = FlashSettings {
            mode: Some(FlashMode::Qio),
            size_name: Some("4MB"),
            freq: Some(FlashFrequency::_40Mhz),
        };
        let encoded = settings.encode(variant, "4MB").unwrap();
        assert_eq!(encoded.flash_mode, 0);
        assert_eq!(encoded.size_freq, 0x20);
        assert_eq!(encoded.size_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn encode_rejects_unknown_size_name() {
        let variant = targets::by_id(targets::VariantId::Esp32);
        let settings = FlashSettings {
            size_name: Some("12MB"),
            ..Default::default()
        };
        assert!(settings.encode(variant, "4MB").is_err());
    }
}
