//! The chip abstraction (C3): a static, data-driven table of per-variant
//! constants plus capability flags, in place of a per-chip class hierarchy.
//!
//! Every difference between chip variants -- register offsets, memory maps,
//! which opcodes a ROM understands, how many status bytes a reply carries --
//! is a field on [`VariantDescriptor`] or an entry in [`REGISTRY`]. Adding a
//! variant means adding a row, not a new trait impl.

use std::borrow::Cow;

/// Identifies one of the supported chip variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[non_exhaustive]
pub enum VariantId {
    Esp8266,
    Esp32,
    Esp32S2,
    Esp32S3,
    Esp32C3,
}

/// A memory region tag used when classifying segments for flash mapping and
/// for merge-adjacency decisions in the image codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemTag {
    Irom,
    Drom,
    Dram,
    Iram,
    RtcIram,
    RtcDram,
    Padding,
    Other,
}

/// One entry of a variant's memory map: `[start, end)` tagged with its kind.
#[derive(Debug, Clone, Copy)]
pub struct MemRange {
    pub start: u32,
    pub end: u32,
    pub tag: MemTag,
}

/// Offsets of the SPI controller's sub-registers, relative to `base`.
///
/// `mosi_length_offset`/`miso_length_offset` are `None` on variants (the
/// ESP8266) that pack both data lengths into `USR1` instead of having
/// dedicated registers.
#[derive(Debug, Clone, Copy)]
pub struct SpiRegisters {
    pub base: u32,
    /// `CMD` register: bit 18 (`SPI_USR`) starts a user command and clears
    /// when it completes. Distinct from `USR`, which configures what kind
    /// of transaction the command performs.
    pub cmd_offset: u32,
    pub usr_offset: u32,
    pub usr1_offset: u32,
    pub usr2_offset: u32,
    pub w0_offset: u32,
    pub mosi_length_offset: Option<u32>,
    pub miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base + self.cmd_offset
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|o| self.base + o)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|o| self.base + o)
    }
}

/// A location in the 32-bit efuse address space: a word offset, a bit
/// offset within that word, and a bit count.
#[derive(Debug, Clone, Copy)]
pub struct EfuseField {
    pub word_offset: u32,
    pub bit_offset: u32,
    pub bit_count: u32,
}

/// Maps a user-facing flash size name to the nibble encoded into image
/// headers for this variant.
#[derive(Debug, Clone, Copy)]
pub struct FlashSizeEntry {
    pub name: &'static str,
    pub bytes: u32,
    pub encoded: u8,
}

/// A small program uploaded to RAM that replaces the ROM command set with a
/// richer one (C6). Treated as an opaque precompiled payload: this crate
/// does not construct or validate the stub's contents, only uploads it.
#[derive(Debug, Clone)]
pub struct StubPayload<'a> {
    pub text_addr: u32,
    pub text: Cow<'a, [u8]>,
    pub data_addr: u32,
    pub data: Cow<'a, [u8]>,
    pub entry: u32,
}

impl StubPayload<'_> {
    /// `[start, end)` ranges the stub occupies in RAM, used to reject
    /// `mem_begin` calls that would overwrite a running stub.
    pub fn occupied_ranges(&self) -> [(u32, u32); 2] {
        [
            (self.text_addr, self.text_addr + self.text.len() as u32),
            (self.data_addr, self.data_addr + self.data.len() as u32),
        ]
    }
}

/// An immutable, per-variant descriptor: the entire "what makes this chip
/// different" table described in the data model.
#[derive(Debug, Clone, Copy)]
pub struct VariantDescriptor {
    pub id: VariantId,
    pub name: &'static str,
    /// Chip-id value embedded in the extended image header; `None` for
    /// variants that use the original (non-extended) V1 header.
    pub image_chip_id: Option<u16>,
    pub detect_magic: u32,

    pub uart_clkdiv_reg: u32,
    pub uart_date_reg: u32,
    pub efuse_base: u32,
    pub mac_efuse_reg: u32,
    pub spi_registers: SpiRegisters,
    pub memory_map: &'static [MemRange],
    pub flash_sizes: &'static [FlashSizeEntry],

    /// Length of a response's status trailer while talking to the ROM
    /// (before any stub is uploaded).
    pub rom_status_len: u8,
    pub bootloader_flash_offset: u32,
    /// Divisor used to turn the UART clock divider into an estimated
    /// crystal frequency; 1 for most parts, 2 for the ESP8266.
    pub xtal_clk_divider: u32,
    /// Byte alignment required for encrypted-flash writes on ROM.
    pub encrypted_write_align: u32,

    // Capabilities: whether the ROM (not a stub) understands each opcode.
    pub rom_supports_spi_attach: bool,
    pub rom_supports_change_baud: bool,
    pub rom_supports_deflate: bool,
    pub rom_supports_encrypted_write: bool,
    pub rom_supports_security_info: bool,
    pub rom_supports_read_flash_slow: bool,
    pub uses_extended_image_header: bool,
}

impl VariantDescriptor {
    pub fn addr_tag(&self, addr: u32) -> MemTag {
        self.memory_map
            .iter()
            .find(|range| addr >= range.start && addr < range.end)
            .map(|range| range.tag)
            .unwrap_or(MemTag::Other)
    }

    pub fn addr_is_flash(&self, addr: u32) -> bool {
        matches!(self.addr_tag(addr), MemTag::Irom | MemTag::Drom)
    }

    pub fn flash_size_for_detected_byte(&self, byte: u8) -> Option<u32> {
        self.flash_sizes
            .iter()
            .find(|entry| entry.encoded == byte)
            .map(|entry| entry.bytes)
    }

    pub fn encode_flash_size(&self, name: &str) -> Option<u8> {
        self.flash_sizes
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.encoded)
    }
}

const ESP8266_MEMORY_MAP: &[MemRange] = &[
    MemRange { start: 0x3FF0_0000, end: 0x3FF0_0010, tag: MemTag::Other },
    MemRange { start: 0x3FFE_8000, end: 0x4000_0000, tag: MemTag::Dram },
    MemRange { start: 0x4010_0000, end: 0x4010_8000, tag: MemTag::Iram },
    MemRange { start: 0x4020_1010, end: 0x402E_1010, tag: MemTag::Irom },
];

const ESP8266_FLASH_SIZES: &[FlashSizeEntry] = &[
    FlashSizeEntry { name: "256KB", bytes: 256 * 1024, encoded: 0x10 },
    FlashSizeEntry { name: "512KB", bytes: 512 * 1024, encoded: 0x00 },
    FlashSizeEntry { name: "1MB", bytes: 1024 * 1024, encoded: 0x20 },
    FlashSizeEntry { name: "2MB", bytes: 2 * 1024 * 1024, encoded: 0x30 },
    FlashSizeEntry { name: "4MB", bytes: 4 * 1024 * 1024, encoded: 0x40 },
    FlashSizeEntry { name: "8MB", bytes: 8 * 1024 * 1024, encoded: 0x80 },
    FlashSizeEntry { name: "16MB", bytes: 16 * 1024 * 1024, encoded: 0x90 },
];

const ESP32_MEMORY_MAP: &[MemRange] = &[
    MemRange { start: 0x0000_0000, end: 0x0001_0000, tag: MemTag::Padding },
    MemRange { start: 0x3F40_0000, end: 0x3F80_0000, tag: MemTag::Drom },
    MemRange { start: 0x3FFA_E000, end: 0x4000_0000, tag: MemTag::Dram },
    MemRange { start: 0x3FFE_0000, end: 0x3FFF_FFFC, tag: MemTag::Dram },
    MemRange { start: 0x4008_0000, end: 0x400A_0000, tag: MemTag::Iram },
    MemRange { start: 0x400C_0000, end: 0x400C_2000, tag: MemTag::RtcIram },
    MemRange { start: 0x400D_0000, end: 0x4040_0000, tag: MemTag::Irom },
    MemRange { start: 0x5000_0000, end: 0x5000_2000, tag: MemTag::RtcDram },
];

const ESP32_FLASH_SIZES: &[FlashSizeEntry] = &[
    FlashSizeEntry { name: "1MB", bytes: 1024 * 1024, encoded: 0x00 },
    FlashSizeEntry { name: "2MB", bytes: 2 * 1024 * 1024, encoded: 0x10 },
    FlashSizeEntry { name: "4MB", bytes: 4 * 1024 * 1024, encoded: 0x20 },
    FlashSizeEntry { name: "8MB", bytes: 8 * 1024 * 1024, encoded: 0x30 },
    FlashSizeEntry { name: "16MB", bytes: 16 * 1024 * 1024, encoded: 0x40 },
];

const ESP32S2_MEMORY_MAP: &[MemRange] = &[
    MemRange { start: 0x0000_0000, end: 0x0001_0000, tag: MemTag::Padding },
    MemRange { start: 0x3F00_0000, end: 0x3F3F_0000, tag: MemTag::Drom },
    MemRange { start: 0x3FFB_0000, end: 0x4000_0000, tag: MemTag::Dram },
    MemRange { start: 0x4002_0000, end: 0x4007_0000, tag: MemTag::Iram },
    MemRange { start: 0x4008_0000, end: 0x40B8_0000, tag: MemTag::Irom },
];

const ESP32S3_MEMORY_MAP: &[MemRange] = &[
    MemRange { start: 0x0000_0000, end: 0x0001_0000, tag: MemTag::Padding },
    MemRange { start: 0x3C00_0000, end: 0x3E00_0000, tag: MemTag::Drom },
    MemRange { start: 0x3FC8_8000, end: 0x3FD0_0000, tag: MemTag::Dram },
    MemRange { start: 0x4003_7000, end: 0x4008_0000, tag: MemTag::Iram },
    MemRange { start: 0x4200_0000, end: 0x4400_0000, tag: MemTag::Irom },
];

const ESP32C3_MEMORY_MAP: &[MemRange] = &[
    MemRange { start: 0x0000_0000, end: 0x0001_0000, tag: MemTag::Padding },
    MemRange { start: 0x3C00_0000, end: 0x3C80_0000, tag: MemTag::Drom },
    MemRange { start: 0x3FC8_0000, end: 0x3FCE_0000, tag: MemTag::Dram },
    MemRange { start: 0x4038_0000, end: 0x403E_0000, tag: MemTag::Iram },
    MemRange { start: 0x4200_0000, end: 0x4280_0000, tag: MemTag::Irom },
];

/// `FLASH_SIZES` is shared by every newer variant; they all encode the same
/// nibble regardless of SPI controller layout.
const NEWER_FLASH_SIZES: &[FlashSizeEntry] = ESP32_FLASH_SIZES;

const ESP8266: VariantDescriptor = VariantDescriptor {
    id: VariantId::Esp8266,
    name: "ESP8266",
    image_chip_id: None,
    detect_magic: 0xfff0_c101,
    uart_clkdiv_reg: 0x6000_0014,
    uart_date_reg: 0x6000_0078,
    efuse_base: 0x3ff0_0000,
    mac_efuse_reg: 0x3ff0_0050,
    spi_registers: SpiRegisters {
        cmd_offset: 0x00,
        base: 0x6000_0200,
        usr_offset: 0x1c,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x40,
        mosi_length_offset: None,
        miso_length_offset: None,
    },
    memory_map: ESP8266_MEMORY_MAP,
    flash_sizes: ESP8266_FLASH_SIZES,
    rom_status_len: 2,
    bootloader_flash_offset: 0,
    xtal_clk_divider: 2,
    encrypted_write_align: 32,
    rom_supports_spi_attach: false,
    rom_supports_change_baud: false,
    rom_supports_deflate: false,
    rom_supports_encrypted_write: false,
    rom_supports_security_info: false,
    rom_supports_read_flash_slow: true,
    uses_extended_image_header: false,
};

const ESP32: VariantDescriptor = VariantDescriptor {
    id: VariantId::Esp32,
    name: "ESP32",
    image_chip_id: Some(0),
    detect_magic: 0x00f0_1d83,
    uart_clkdiv_reg: 0x3ff4_0014,
    uart_date_reg: 0x6000_0078,
    efuse_base: 0x3ff5_a000,
    mac_efuse_reg: 0x3ff5_a004,
    spi_registers: SpiRegisters {
        cmd_offset: 0x00,
        base: 0x3ff4_2000,
        usr_offset: 0x1c,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x80,
        mosi_length_offset: Some(0x28),
        miso_length_offset: Some(0x2c),
    },
    memory_map: ESP32_MEMORY_MAP,
    flash_sizes: ESP32_FLASH_SIZES,
    rom_status_len: 4,
    bootloader_flash_offset: 0x1000,
    xtal_clk_divider: 1,
    encrypted_write_align: 32,
    rom_supports_spi_attach: true,
    rom_supports_change_baud: true,
    rom_supports_deflate: true,
    rom_supports_encrypted_write: true,
    rom_supports_security_info: false,
    rom_supports_read_flash_slow: true,
    uses_extended_image_header: true,
};

const ESP32S2: VariantDescriptor = VariantDescriptor {
    id: VariantId::Esp32S2,
    name: "ESP32-S2",
    image_chip_id: Some(2),
    detect_magic: 0x0000_07c6,
    uart_clkdiv_reg: 0x3f40_0014,
    uart_date_reg: 0x6000_0078,
    efuse_base: 0x3f41_a000,
    mac_efuse_reg: 0x3f41_a044,
    spi_registers: SpiRegisters {
        cmd_offset: 0x00,
        base: 0x3f40_2000,
        usr_offset: 0x18,
        usr1_offset: 0x1c,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    memory_map: ESP32S2_MEMORY_MAP,
    flash_sizes: NEWER_FLASH_SIZES,
    rom_status_len: 4,
    bootloader_flash_offset: 0x1000,
    xtal_clk_divider: 1,
    encrypted_write_align: 16,
    rom_supports_spi_attach: true,
    rom_supports_change_baud: true,
    rom_supports_deflate: true,
    rom_supports_encrypted_write: true,
    rom_supports_security_info: false,
    rom_supports_read_flash_slow: true,
    uses_extended_image_header: true,
};

const ESP32S3: VariantDescriptor = VariantDescriptor {
    id: VariantId::Esp32S3,
    name: "ESP32-S3",
    image_chip_id: Some(4),
    detect_magic: 0xeb00_4136,
    uart_clkdiv_reg: 0x6000_0014,
    uart_date_reg: 0x6000_0080,
    efuse_base: 0x6000_7000,
    mac_efuse_reg: 0x6001_a000,
    spi_registers: SpiRegisters {
        cmd_offset: 0x00,
        base: 0x6000_2000,
        usr_offset: 0x18,
        usr1_offset: 0x1c,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    memory_map: ESP32S3_MEMORY_MAP,
    flash_sizes: NEWER_FLASH_SIZES,
    rom_status_len: 4,
    bootloader_flash_offset: 0x0,
    xtal_clk_divider: 1,
    encrypted_write_align: 16,
    rom_supports_spi_attach: true,
    rom_supports_change_baud: true,
    rom_supports_deflate: true,
    rom_supports_encrypted_write: true,
    rom_supports_security_info: true,
    rom_supports_read_flash_slow: true,
    uses_extended_image_header: true,
};

const ESP32C3: VariantDescriptor = VariantDescriptor {
    id: VariantId::Esp32C3,
    name: "ESP32-C3",
    image_chip_id: Some(5),
    detect_magic: 0x6921_506f,
    uart_clkdiv_reg: 0x6000_0014,
    uart_date_reg: 0x6000_007c,
    efuse_base: 0x6000_8800,
    mac_efuse_reg: 0x6000_8844,
    spi_registers: SpiRegisters {
        cmd_offset: 0x00,
        base: 0x6000_2000,
        usr_offset: 0x18,
        usr1_offset: 0x1c,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    memory_map: ESP32C3_MEMORY_MAP,
    flash_sizes: NEWER_FLASH_SIZES,
    rom_status_len: 4,
    bootloader_flash_offset: 0x0,
    xtal_clk_divider: 1,
    encrypted_write_align: 16,
    rom_supports_spi_attach: true,
    rom_supports_change_baud: true,
    rom_supports_deflate: true,
    rom_supports_encrypted_write: true,
    rom_supports_security_info: true,
    rom_supports_read_flash_slow: true,
    uses_extended_image_header: true,
};

/// Every known variant, in detection priority order.
pub const REGISTRY: &[VariantDescriptor] = &[ESP8266, ESP32, ESP32S2, ESP32S3, ESP32C3];

/// Look up the variant whose detect magic matches `magic`. The first match
/// in [`REGISTRY`] order wins.
pub fn detect(magic: u32) -> Option<&'static VariantDescriptor> {
    REGISTRY.iter().find(|v| v.detect_magic == magic)
}

pub fn by_id(id: VariantId) -> &'static VariantDescriptor {
    REGISTRY
        .iter()
        .find(|v| v.id == id)
        .expect("every VariantId has a REGISTRY entry")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_magics_are_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.detect_magic, b.detect_magic, "{} vs {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn esp32_magic_selects_esp32() {
        let variant = detect(0x00f0_1d83).unwrap();
        assert_eq!(variant.id, VariantId::Esp32);
    }

    #[test]
    fn unknown_magic_is_none() {
        assert!(detect(0xdead_beef).is_none());
    }

    #[test]
    fn esp8266_addr_is_flash_matches_irom_range() {
        assert!(ESP8266.addr_is_flash(0x4020_2000));
        assert!(!ESP8266.addr_is_flash(0x4010_0000));
    }
}
