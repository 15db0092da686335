//! Request/response command protocol (C2) built on top of the frame codec.
//!
//! Every request is `0x00 || op:u8 || body_len:u16_le || checksum:u32_le || body`.
//! Every response is `0x01 || op:u8 || body_len:u16_le || value:u32_le || body`,
//! the last `status_len` bytes of which are the status trailer.

use std::{io::Write, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::flasher::{SpiAttachParams, SpiSetParams};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound any single command timeout is clamped to (see §4.2).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(240);

/// Seed value for the rolling XOR checksum used by `FLASH_DATA`/`MEM_DATA`
/// bodies and by the V1 image checksum byte.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// XOR-fold `data` into `seed`, returning the updated checksum.
pub fn checksum(data: &[u8], seed: u8) -> u8 {
    data.iter().fold(seed, |acc, byte| acc ^ byte)
}

/// The 36-byte payload sent with the `SYNC` command: `07 07 12 20` then
/// thirty-two `0x55` bytes.
pub const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55u8; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

/// The second status byte a ROM returns to mean "I don't understand this
/// opcode", generally because secure download mode is active or the target
/// is a ROM that lacks the command.
pub const INVALID_MESSAGE_STATUS: u8 = 0x05;

/// Opcodes understood by one or more of ROM bootloader / flasher stub.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ReadFlashSlow = 0x0E,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    GetSecurityInfo = 0x14,
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,
    FlashEncryptData = 0xD4,
}

impl CommandType {
    /// Default timeout for this command, not accounting for payload size.
    pub fn timeout(self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Timeout scaled to the number of bytes being transferred, floored at
    /// the command's default timeout and clamped to [`MAX_TIMEOUT`].
    pub fn timeout_for_size(self, size: u32) -> Duration {
        let per_mb = match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                ERASE_REGION_TIMEOUT_PER_MB
            }
            CommandType::FlashData | CommandType::FlashDeflData => ERASE_WRITE_TIMEOUT_PER_MB,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT_PER_MB,
            _ => return self.timeout(),
        };
        let mb = size as f64 / 1_000_000.0;
        let scaled = Duration::from_millis((per_mb.as_millis() as f64 * mb) as u64);
        scaled.max(self.timeout()).min(MAX_TIMEOUT)
    }
}

/// A decoded command response, before status-trailer stripping.
#[derive(Debug, Clone)]
pub struct Response {
    pub op: u8,
    pub body_len: u16,
    pub value: u32,
    pub body: Vec<u8>,
}

/// A protocol command, ready to be framed and written to the wire.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        write_size: u32,
        offset: u32,
        encrypted: Option<bool>,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    Sync,
    WriteReg {
        addr: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    },
    ReadReg {
        addr: u32,
    },
    SpiSetParams {
        params: SpiSetParams,
    },
    SpiAttach {
        params: SpiAttachParams,
        stub: bool,
    },
    ChangeBaudrate {
        new_baud: u32,
        prior_baud: u32,
    },
    FlashDeflBegin {
        write_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: Option<bool>,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        block_size: u32,
        max_in_flight: u32,
    },
    ReadFlashSlow {
        offset: u32,
        size: u32,
        block_size: u32,
        max_in_flight: u32,
    },
    RunUserCode,
    FlashEncryptData {
        data: &'a [u8],
        sequence: u32,
    },
    GetSecurityInfo,
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        use Command::*;
        match self {
            FlashBegin { .. } => CommandType::FlashBegin,
            FlashData { .. } => CommandType::FlashData,
            FlashEnd { .. } => CommandType::FlashEnd,
            MemBegin { .. } => CommandType::MemBegin,
            MemData { .. } => CommandType::MemData,
            MemEnd { .. } => CommandType::MemEnd,
            Sync => CommandType::Sync,
            WriteReg { .. } => CommandType::WriteReg,
            ReadReg { .. } => CommandType::ReadReg,
            SpiSetParams { .. } => CommandType::SpiSetParams,
            SpiAttach { .. } => CommandType::SpiAttach,
            ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            FlashDeflData { .. } => CommandType::FlashDeflData,
            FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            FlashMd5 { .. } => CommandType::FlashMd5,
            EraseFlash => CommandType::EraseFlash,
            EraseRegion { .. } => CommandType::EraseRegion,
            ReadFlash { .. } => CommandType::ReadFlash,
            ReadFlashSlow { .. } => CommandType::ReadFlashSlow,
            RunUserCode => CommandType::RunUserCode,
            FlashEncryptData { .. } => CommandType::FlashEncryptData,
            GetSecurityInfo => CommandType::GetSecurityInfo,
        }
    }

    /// Whether the caller should wait for a reply at all (§5: only
    /// `MEM_END` in ROM mode and `RUN_USER_CODE` skip this).
    pub fn expects_reply(&self, is_stub: bool) -> bool {
        match self {
            Command::MemEnd { .. } => is_stub,
            Command::RunUserCode => false,
            _ => true,
        }
    }

    /// Serialize `op || body_len:u16_le || checksum:u32_le || body` for this
    /// command into `writer`. The caller is responsible for frame delimiters.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[self.command_type() as u8])?;

        match self {
            Command::FlashBegin {
                erase_size,
                blocks,
                write_size,
                offset,
                encrypted,
            } => begin_body(writer, *erase_size, *blocks, *write_size, *offset, *encrypted),
            Command::FlashData { data, sequence } => data_body(writer, data, *sequence),
            Command::FlashEnd { reboot } => basic_body(writer, &[u8::from(!reboot)]),
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => begin_body(writer, *size, *blocks, *block_size, *offset, None),
            Command::MemData { data, sequence } => data_body(writer, data, *sequence),
            Command::MemEnd { no_entry, entry } => {
                #[derive(Pod, Zeroable, Copy, Clone)]
                #[repr(C)]
                struct Params {
                    no_entry: u32,
                    entry: u32,
                }
                basic_body(
                    writer,
                    bytes_of(&Params {
                        no_entry: u32::from(*no_entry),
                        entry: *entry,
                    }),
                )
            }
            Command::Sync => basic_body(writer, &SYNC_FRAME),
            Command::WriteReg {
                addr,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Pod, Zeroable, Copy, Clone)]
                #[repr(C)]
                struct Params {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                basic_body(
                    writer,
                    bytes_of(&Params {
                        addr: *addr,
                        value: *value,
                        mask: mask.unwrap_or(0xFFFF_FFFF),
                        delay_us: *delay_us,
                    }),
                )
            }
            Command::ReadReg { addr } => basic_body(writer, &addr.to_le_bytes()),
            Command::SpiSetParams { params } => basic_body(writer, &params.encode()),
            Command::SpiAttach { params, stub } => basic_body(writer, &params.encode(*stub)),
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&new_baud.to_le_bytes());
                body.extend_from_slice(&prior_baud.to_le_bytes());
                basic_body(writer, &body)
            }
            Command::FlashDeflBegin {
                write_size,
                blocks,
                block_size,
                offset,
                encrypted,
            } => begin_body(writer, *write_size, *blocks, *block_size, *offset, *encrypted),
            Command::FlashDeflData { data, sequence } => data_body(writer, data, *sequence),
            Command::FlashDeflEnd { reboot } => basic_body(writer, &[u8::from(!reboot)]),
            Command::FlashMd5 { offset, size } => {
                let mut body = Vec::with_capacity(16);
                body.extend_from_slice(&offset.to_le_bytes());
                body.extend_from_slice(&size.to_le_bytes());
                body.extend_from_slice(&0u32.to_le_bytes());
                body.extend_from_slice(&0u32.to_le_bytes());
                basic_body(writer, &body)
            }
            Command::EraseFlash => basic_body(writer, &[]),
            Command::EraseRegion { offset, size } => {
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&offset.to_le_bytes());
                body.extend_from_slice(&size.to_le_bytes());
                basic_body(writer, &body)
            }
            Command::ReadFlash {
                offset,
                size,
                block_size,
                max_in_flight,
            }
            | Command::ReadFlashSlow {
                offset,
                size,
                block_size,
                max_in_flight,
            } => {
                let mut body = Vec::with_capacity(16);
                body.extend_from_slice(&offset.to_le_bytes());
                body.extend_from_slice(&size.to_le_bytes());
                body.extend_from_slice(&block_size.to_le_bytes());
                body.extend_from_slice(&max_in_flight.to_le_bytes());
                basic_body(writer, &body)
            }
            Command::RunUserCode => basic_body(writer, &[]),
            Command::FlashEncryptData { data, sequence } => data_body(writer, data, *sequence),
            Command::GetSecurityInfo => basic_body(writer, &[]),
        }
    }
}

fn basic_body<W: Write>(mut writer: W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(data)
}

fn begin_body<W: Write>(
    mut writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    encrypted: Option<bool>,
) -> std::io::Result<()> {
    #[derive(Pod, Zeroable, Copy, Clone)]
    #[repr(C)]
    struct Params {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = Params {
        size,
        blocks,
        block_size,
        offset,
        encrypted: encrypted.map(u32::from).unwrap_or(0),
    };
    let bytes = bytes_of(&params);
    // Older-variant ROM and stub loaders don't take the trailing `encrypted`
    // field at all.
    let body = match encrypted {
        Some(_) => bytes,
        None => &bytes[..bytes.len() - 4],
    };
    basic_body(writer, body)
}

fn data_body<W: Write>(mut writer: W, data: &[u8], sequence: u32) -> std::io::Result<()> {
    #[derive(Pod, Zeroable, Copy, Clone)]
    #[repr(C)]
    struct Params {
        size: u32,
        sequence: u32,
        _reserved: [u32; 2],
    }
    let params = Params {
        size: data.len() as u32,
        sequence,
        _reserved: [0; 2],
    };
    let header = bytes_of(&params);
    let total_len = (header.len() + data.len()) as u16;
    let check = checksum(data, CHECKSUM_INIT);
    writer.write_all(&total_len.to_le_bytes())?;
    writer.write_all(&(check as u32).to_le_bytes())?;
    writer.write_all(header)?;
    writer.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_frame_matches_spec() {
        assert_eq!(SYNC_FRAME[0..4], [0x07, 0x07, 0x12, 0x20]);
        assert!(SYNC_FRAME[4..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn checksum_is_xor_fold_from_seed() {
        assert_eq!(checksum(&[], 0xEF), 0xEF);
        assert_eq!(checksum(&[0x01, 0x02], 0xEF), 0xEF ^ 0x01 ^ 0x02);
    }

    #[test]
    fn flash_begin_drops_encrypted_field_on_rom_without_encryption_support() {
        let mut buf = Vec::new();
        Command::FlashBegin {
            erase_size: 0x1000,
            blocks: 1,
            write_size: 0x400,
            offset: 0,
            encrypted: None,
        }
        .write(&mut buf)
        .unwrap();
        // op(1) + len(2) + checksum(4) + 4 u32 fields (16) = 23
        assert_eq!(buf.len(), 1 + 2 + 4 + 16);
    }

    #[test]
    fn flash_begin_keeps_encrypted_field_when_supported() {
        let mut buf = Vec::new();
        Command::FlashBegin {
            erase_size: 0x1000,
            blocks: 1,
            write_size: 0x400,
            offset: 0,
            encrypted: Some(true),
        }
        .write(&mut buf)
        .unwrap();
        assert_eq!(buf.len(), 1 + 2 + 4 + 20);
    }
}
