//! The live link to a target: reset/sync handshake, request/response
//! exchange, and the register/RAM primitives built directly on it (C4, C5).

pub mod reset;

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;
use serialport::SerialPort;

use crate::command::{checksum, Command, CommandType, Response, CHECKSUM_INIT, INVALID_MESSAGE_STATUS, MAX_TIMEOUT};
use crate::error::{Error, FramingError};
use crate::frame::{self, FrameReader};
use crate::targets::{self, VariantDescriptor};

pub use reset::ResetStrategy;

const DETECT_MAGIC_REG: u32 = 0x4000_1000;
const SYNC_RETRIES: u32 = 5;
const REQUEST_DIRECTION: u8 = 0x00;
const RESPONSE_DIRECTION: u8 = 0x01;
const MAX_COMMAND_RETRIES: u32 = 100;

/// A live connection to a target: the serial port plus every piece of
/// protocol state that changes as the session progresses (baud, detected
/// variant, stub/secure-download status).
pub struct Connection {
    port: Box<dyn SerialPort>,
    baud: u32,
    variant: &'static VariantDescriptor,
    is_stub: bool,
    secure_download_mode: bool,
    sync_stub_detected: bool,
    status_len: u8,
    stub_ranges: Option<[(u32, u32); 2]>,
    trace: Option<Box<dyn Write + Send>>,
}

impl Connection {
    /// Open a connection: apply `reset`, then (unless `reset` is
    /// [`ResetStrategy::NoResetNoSync`]) run the sync handshake and detect
    /// the chip variant. `attempts` alternates the non-delayed and delayed
    /// reset strategies as described in §4.4.
    pub fn open(
        mut port: Box<dyn SerialPort>,
        baud: u32,
        reset: ResetStrategy,
        attempts: u32,
    ) -> Result<Connection, Error> {
        port.set_baud_rate(baud)?;

        let mut conn = Connection {
            port,
            baud,
            variant: targets::by_id(targets::VariantId::Esp8266),
            is_stub: false,
            secure_download_mode: false,
            sync_stub_detected: false,
            status_len: 2,
            stub_ranges: None,
            trace: None,
        };

        if !reset.syncs() {
            return Ok(conn);
        }

        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            let strategy = if attempt % 2 == 0 {
                reset
            } else {
                ResetStrategy::Esp32R0Delay
            };
            if let Err(e) = strategy.apply(conn.port.as_mut()) {
                last_err = Some(e);
                continue;
            }
            conn.scan_boot_log();
            match conn.sync() {
                Ok(()) => {
                    conn.detect_variant()?;
                    return Ok(conn);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::Timeout(CommandType::Sync)))
    }

    pub fn variant(&self) -> &'static VariantDescriptor {
        self.variant
    }

    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    pub fn secure_download_mode(&self) -> bool {
        self.secure_download_mode
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn status_len(&self) -> u8 {
        self.status_len
    }

    /// Mark the connection as now talking to the uploaded stub, updating
    /// the status-trailer length per §9 ("update it at every variant/stub
    /// transition").
    pub(crate) fn enter_stub_mode(&mut self, ranges: [(u32, u32); 2]) {
        self.is_stub = true;
        self.status_len = 2;
        self.stub_ranges = Some(ranges);
    }

    fn enter_rom_mode(&mut self, variant: &'static VariantDescriptor) {
        self.variant = variant;
        self.is_stub = false;
        self.status_len = variant.rom_status_len;
    }

    /// Send the `SYNC` opcode and drain replies, as described in §4.4.
    /// On success updates `sync_stub_detected`.
    pub fn sync(&mut self) -> Result<(), Error> {
        let mut stub_like = true;
        let mut last_err = None;
        for _ in 0..SYNC_RETRIES {
            self.flush_input();
            match self.command_raw(Some(Command::Sync), false, CommandType::Sync.timeout()) {
                Ok(first) => {
                    stub_like &= first.value == 0;
                    // Drain the 7 extra replies a ROM sends in response to
                    // the SYNC frame's 32 duplicate sub-commands.
                    for _ in 0..7 {
                        match self.read_response(CommandType::Sync.timeout()) {
                            Ok(resp) => stub_like &= resp.value == 0,
                            Err(_) => break,
                        }
                    }
                    self.sync_stub_detected = stub_like;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::Timeout(CommandType::Sync)))
    }

    /// Read the detect-magic register and select the matching variant. If
    /// the read itself comes back `UnsupportedCommand`, the target is in
    /// secure download mode and detection is skipped (§4.3).
    fn detect_variant(&mut self) -> Result<(), Error> {
        if self.sync_stub_detected {
            self.is_stub = true;
            self.status_len = 2;
            return Ok(());
        }

        let magic = match self.read_reg(DETECT_MAGIC_REG, CommandType::ReadReg.timeout()) {
            Ok(value) => value,
            Err(Error::UnsupportedCommand(_)) => {
                self.secure_download_mode = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let variant = targets::detect(magic).ok_or(Error::Unknown(magic))?;
        self.enter_rom_mode(variant);
        Ok(())
    }

    /// Re-read the detect magic and confirm it still matches the variant in
    /// effect, per §4.4's post-connect sanity check.
    pub fn reconfirm_variant(&mut self) -> Result<(), Error> {
        if self.is_stub || self.secure_download_mode {
            return Ok(());
        }
        let magic = self.read_reg(DETECT_MAGIC_REG, CommandType::ReadReg.timeout())?;
        if magic == self.variant.detect_magic {
            return Ok(());
        }
        match targets::detect(magic) {
            Some(other) => Err(Error::WrongChip {
                expected: self.variant.name,
                detected: other.name,
            }),
            None => {
                warn!(
                    "detect magic changed to unrecognized value 0x{magic:08x} after connect"
                );
                Ok(())
            }
        }
    }

    /// After a reset, the ROM may print a human-readable boot banner before
    /// it's ready to sync. Drain whatever arrived and log the boot mode and
    /// whether it already announces itself in download mode, purely for
    /// diagnostics; this never blocks waiting for more bytes.
    fn scan_boot_log(&mut self) {
        let available = match self.port.bytes_to_read() {
            Ok(n) if n > 0 => n as usize,
            _ => return,
        };
        let mut buf = vec![0u8; available];
        let read = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return,
        };
        let text = String::from_utf8_lossy(&buf[..read]);

        let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)([\s\S]*waiting for download)?")
            .expect("static pattern is valid");
        if let Some(captures) = pattern.captures(&text) {
            let boot_mode = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let download_mode = captures.get(2).is_some();
            debug!("boot log detected: mode {boot_mode}, download mode {download_mode}");
        }
    }

    fn flush_input(&mut self) {
        let _ = self.port.clear(serialport::ClearBuffer::Input);
    }

    /// Low-level request/response exchange (§4.2's `command` operation).
    pub fn command_raw(
        &mut self,
        cmd: Option<Command<'_>>,
        wait_response: bool,
        timeout: Duration,
    ) -> Result<Response, Error> {
        let timeout = timeout.min(MAX_TIMEOUT);

        if let Some(cmd) = &cmd {
            let mut payload = vec![REQUEST_DIRECTION];
            cmd.write(&mut payload)?;
            let framed = frame::encode(&payload);
            self.port.set_timeout(Duration::from_secs(10)).ok();
            self.port.write_all(&framed)?;
            if let Some(sink) = &mut self.trace {
                let _ = writeln!(sink, "-> {framed:02x?}");
            }
        }

        if !wait_response {
            return Ok(Response {
                op: 0,
                body_len: 0,
                value: 0,
                body: Vec::new(),
            });
        }

        let expected_op = cmd.as_ref().map(|c| c.command_type() as u8);
        for _ in 0..MAX_COMMAND_RETRIES {
            let resp = self.read_response(timeout)?;
            if let Some(op) = expected_op {
                if resp.op != op {
                    if resp.body.len() >= 2 && resp.body[0] != 0 && resp.body[1] == INVALID_MESSAGE_STATUS {
                        self.flush_input();
                        return Err(Error::UnsupportedCommand(
                            cmd.as_ref().unwrap().command_type(),
                        ));
                    }
                    continue;
                }
            }
            return Ok(resp);
        }
        Err(Error::Timeout(
            cmd.map(|c| c.command_type()).unwrap_or(CommandType::Sync),
        ))
    }

    fn read_response(&mut self, timeout: Duration) -> Result<Response, Error> {
        self.port.set_timeout(timeout).ok();
        let mut reader = FrameReader::new(&mut self.port);
        let body = match reader.read_packet() {
            Ok(body) => body,
            Err(FramingError::Timeout { .. }) => {
                return Err(Error::Timeout(CommandType::Sync))
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(sink) = &mut self.trace {
            let _ = writeln!(sink, "<- {body:02x?}");
        }
        parse_response(&body)
    }

    /// Run `cmd`, then validate and strip its status trailer per §4.2's
    /// `check_command` operation.
    pub fn check_command(&mut self, cmd: Command<'_>, timeout: Duration) -> Result<Vec<u8>, Error> {
        let wait = cmd.expects_reply(self.is_stub);
        let resp = self.command_raw(Some(cmd), wait, timeout)?;
        if !wait {
            return Ok(Vec::new());
        }
        self.strip_status(resp)
    }

    fn strip_status(&self, resp: Response) -> Result<Vec<u8>, Error> {
        let status_len = self.status_len as usize;
        if resp.body.len() < status_len {
            return Err(Error::Protocol(format!(
                "response body of {} bytes is shorter than the {status_len}-byte status trailer",
                resp.body.len()
            )));
        }
        let split = resp.body.len() - status_len;
        let (data, status) = resp.body.split_at(split);
        if status[0] != 0 {
            return Err(Error::remote(CommandType::Sync, status));
        }
        if !data.is_empty() {
            Ok(data.to_vec())
        } else {
            Ok(resp.value.to_le_bytes().to_vec())
        }
    }

    /// Read a 32-bit register (§4.5).
    pub fn read_reg(&mut self, addr: u32, timeout: Duration) -> Result<u32, Error> {
        let resp = self.command_raw(Some(Command::ReadReg { addr }), true, timeout)?;
        let status_len = self.status_len as usize;
        if resp.body.len() >= status_len && resp.body[resp.body.len() - status_len] != 0 {
            let status = &resp.body[resp.body.len() - status_len..];
            return Err(Error::remote(CommandType::ReadReg, status));
        }
        Ok(resp.value)
    }

    /// Write a 32-bit register, masked, with an optional settle delay
    /// (§4.5). `delay_after_us`, if nonzero, appends a dummy write to the
    /// variant's date-code register to absorb that delay.
    pub fn write_reg(
        &mut self,
        addr: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
        delay_after_us: u32,
    ) -> Result<(), Error> {
        self.check_command(
            Command::WriteReg {
                addr,
                value,
                mask,
                delay_us,
            },
            CommandType::WriteReg.timeout(),
        )?;
        if delay_after_us > 0 {
            self.check_command(
                Command::WriteReg {
                    addr: self.variant.uart_date_reg,
                    value: 0,
                    mask: Some(0),
                    delay_us: delay_after_us,
                },
                CommandType::WriteReg.timeout(),
            )?;
        }
        Ok(())
    }

    /// Read-modify-write a register: `new_val` is shifted to the LSB of
    /// `mask` and merged with the masked-out remainder of the current
    /// value.
    pub fn update_reg(&mut self, addr: u32, mask: u32, new_val: u32) -> Result<(), Error> {
        let current = self.read_reg(addr, CommandType::ReadReg.timeout())?;
        let shift = mask.trailing_zeros();
        let merged = (current & !mask) | ((new_val << shift) & mask);
        self.write_reg(addr, merged, None, 0, 0)
    }

    /// Begin a RAM download of `size` bytes in `blocks` chunks of
    /// `block_size`, to be loaded at `load_addr`. Refuses ranges
    /// overlapping a resident stub (`Overlap`).
    pub fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        load_addr: u32,
    ) -> Result<(), Error> {
        if let Some(ranges) = self.stub_ranges {
            let end = load_addr + size;
            for (start, stub_end) in ranges {
                if load_addr < stub_end && end > start {
                    return Err(Error::Overlap(load_addr, end));
                }
            }
        }
        self.check_command(
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset: load_addr,
            },
            CommandType::MemBegin.timeout(),
        )?;
        Ok(())
    }

    pub fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.check_command(
            Command::MemData { data, sequence },
            CommandType::MemData.timeout_for_size(data.len() as u32),
        )?;
        Ok(())
    }

    /// Finish a RAM download, optionally jumping to `entry`. In ROM mode
    /// this uses a short timeout and ignores errors, since the target may
    /// reset the UART before it can reply (§4.5, §9 policy flag).
    pub fn mem_finish(&mut self, entry: u32, no_entry: bool) -> Result<(), Error> {
        let cmd = Command::MemEnd { no_entry, entry };
        if self.is_stub {
            self.check_command(cmd, CommandType::MemEnd.timeout())?;
            Ok(())
        } else {
            let _ = self.command_raw(Some(cmd), false, CommandType::MemEnd.timeout());
            Ok(())
        }
    }

    /// Read `len` raw bytes directly from the port, with no frame decoding.
    /// Used for the stub's unframed `"OHAI"` handshake token.
    pub fn read_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.port.set_timeout(timeout).ok();
        let mut buf = vec![0u8; len];
        self.port.read_exact(&mut buf).map_err(Error::Io)?;
        Ok(buf)
    }

    /// Read one framed packet body without interpreting it as a standard
    /// command response. Used by the stub's flash-read streaming path,
    /// which frames raw data chunks and a trailing MD5 digest rather than
    /// `(op, value)`-headed replies.
    pub fn read_framed_raw(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.port.set_timeout(timeout).ok();
        let mut reader = FrameReader::new(&mut self.port);
        Ok(reader.read_packet()?)
    }

    /// Write bytes directly to the port with no framing, used for the
    /// stub's flow-control acknowledgements during flash reads.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.port.write_all(data)?;
        Ok(())
    }

    pub fn set_baud(&mut self, new_baud: u32) -> Result<(), Error> {
        self.port.set_baud_rate(new_baud)?;
        self.baud = new_baud;
        Ok(())
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.port
    }

    /// Direct access to the underlying port, for reset-line toggling that
    /// doesn't go through the command protocol.
    pub fn port_mut(&mut self) -> &mut dyn SerialPort {
        self.port.as_mut()
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.trace = Some(sink);
    }
}

fn parse_response(body: &[u8]) -> Result<Response, Error> {
    if body.len() < 8 || body[0] != RESPONSE_DIRECTION {
        return Err(Error::Protocol(format!(
            "malformed response header: {body:02x?}"
        )));
    }
    let op = body[1];
    let body_len = u16::from_le_bytes([body[2], body[3]]);
    let value = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let data = &body[8..];
    if data.len() != body_len as usize {
        debug!(
            "response declared body_len {body_len} but carried {} bytes",
            data.len()
        );
    }
    Ok(Response {
        op,
        body_len,
        value,
        body: data.to_vec(),
    })
}

/// XOR-fold a run of `MEM_DATA`/`FLASH_DATA` bytes, exposed here since the
/// stub upload path (C6) checksums each block before sending it.
pub fn data_checksum(data: &[u8]) -> u8 {
    checksum(data, CHECKSUM_INIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_rejects_short_body() {
        assert!(parse_response(&[1, 2, 3]).is_err());
    }

    #[test]
    fn parse_response_reads_header_fields() {
        let body = [0x01, 0x08, 0x02, 0x00, 0x07, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.op, 0x08);
        assert_eq!(resp.body_len, 2);
        assert_eq!(resp.value, 7);
        assert_eq!(resp.body, vec![0xAA, 0xBB]);
    }
}
