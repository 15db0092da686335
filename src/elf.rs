//! ELF reader (C10): extract loadable sections or segments from a linked
//! executable, enough to build a firmware image from it.

use object::elf::SHT_PROGBITS;
use object::read::elf::{ElfFile32 as ElfFile, SectionHeader};
use object::{Endianness, Object as _, ObjectSection as _, ObjectSegment as _};

use crate::error::Error;
use crate::image::Segment;

const EM_XTENSA: u16 = 0x5E;
const EM_RISCV: u16 = 0xF3;
const SECTION_HEADER_ENTRY_SIZE: u16 = 40;

/// A parsed view over a 32-bit little-endian ELF executable: enough to read
/// its entry point and either its `PROGBITS` sections or its `PT_LOAD`
/// program headers.
#[derive(Debug)]
pub struct ElfImage<'a> {
    elf: ElfFile<'a>,
}

impl<'a> ElfImage<'a> {
    /// Parse `data`, validating the magic, machine type, and header shape
    /// demanded of a flashable image (§4.10).
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < 4 || &data[0..4] != b"\x7FELF" {
            return Err(Error::InvalidImage("not an ELF file (bad magic)".into()));
        }

        let elf = ElfFile::parse(data)
            .map_err(|e| Error::InvalidImage(format!("malformed ELF file: {e}")))?;

        let header = elf.elf_header();
        let machine = header.e_machine.get(Endianness::Little);
        if machine != EM_XTENSA && machine != EM_RISCV {
            return Err(Error::InvalidImage(format!(
                "unsupported ELF machine type 0x{machine:02x}, expected Xtensa or RISC-V"
            )));
        }
        let shentsize = header.e_shentsize.get(Endianness::Little);
        if shentsize != 0 && shentsize != SECTION_HEADER_ENTRY_SIZE {
            return Err(Error::InvalidImage(format!(
                "unexpected section header entry size {shentsize}"
            )));
        }
        if header.e_shnum.get(Endianness::Little) == 0 {
            return Err(Error::InvalidImage("ELF file has no sections".into()));
        }

        Ok(ElfImage { elf })
    }

    pub fn entry(&self) -> u32 {
        self.elf.elf_header().e_entry.get(Endianness::Little)
    }

    /// `PROGBITS` sections with nonzero size and a nonzero load address.
    pub fn sections(&self) -> Vec<ElfSegment> {
        self.elf
            .sections()
            .filter(|section| {
                let header = section.elf_section_header();
                section.size() > 0
                    && header.sh_type(Endianness::Little) == SHT_PROGBITS
                    && header.sh_offset.get(Endianness::Little) > 0
                    && section.address() > 0
            })
            .filter_map(|section| {
                let data = section.data().ok()?;
                if data.is_empty() {
                    return None;
                }
                Some(ElfSegment {
                    name: section.name().unwrap_or("").to_string(),
                    load_address: section.address() as u32,
                    bytes: data.to_vec(),
                })
            })
            .collect()
    }

    /// `PT_LOAD` program headers with nonzero file size and a nonzero
    /// physical load address.
    pub fn load_segments(&self) -> Vec<ElfSegment> {
        self.elf
            .segments()
            .filter(|segment| segment.size() > 0 && segment.address() != 0)
            .filter_map(|segment| {
                let data = segment.data().ok()?;
                if data.is_empty() {
                    return None;
                }
                Some(ElfSegment {
                    name: String::new(),
                    load_address: segment.address() as u32,
                    bytes: data.to_vec(),
                })
            })
            .collect()
    }
}

/// One loadable chunk of an ELF file: either a `PROGBITS` section or a
/// `PT_LOAD` program header, depending on which view the caller asked for.
#[derive(Debug, Clone)]
pub struct ElfSegment {
    pub name: String,
    pub load_address: u32,
    pub bytes: Vec<u8>,
}

impl From<ElfSegment> for Segment {
    fn from(value: ElfSegment) -> Self {
        Segment::new(value.load_address, value.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_non_elf_input() {
        let err = ElfImage::parse(b"not an elf file at all").unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn parse_rejects_short_input() {
        let err = ElfImage::parse(&[0x7F, b'E']).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }
}
