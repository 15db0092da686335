//! Byte-stuffed packet framing (C1).
//!
//! Each packet is delimited by `0xC0` at start and end. Inside the body,
//! `0xC0` is escaped as `0xDB 0xDC` and `0xDB` is escaped as `0xDB 0xDD`.

use std::io::Read;

use crate::error::FramingError;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Frame `body` as exactly one packet. Pure transformation; does not flush
/// or otherwise touch the destination beyond writing the framed bytes.
pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(END);
    for &byte in body {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// A pull-based reader over a byte stream that yields one decoded packet
/// body per [`FrameReader::read_packet`] call, buffering at most one
/// partial packet internally.
pub struct FrameReader<'a, R: Read> {
    port: &'a mut R,
}

impl<'a, R: Read> FrameReader<'a, R> {
    pub fn new(port: &'a mut R) -> Self {
        FrameReader { port }
    }

    /// Read and decode exactly one framed packet body.
    ///
    /// Leading `END` bytes (including a stray one terminating a previous
    /// packet) are skipped before the body starts.
    pub fn read_packet(&mut self) -> Result<Vec<u8>, FramingError> {
        let mut body = Vec::new();
        let mut started = false;
        let mut pending_escape = false;

        loop {
            let mut byte = [0u8];
            match self.port.read(&mut byte) {
                Ok(0) => return Err(FramingError::Timeout { partial: started }),
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(FramingError::Timeout { partial: started })
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return Err(FramingError::Timeout { partial: started }),
            }
            let byte = byte[0];

            if byte == END {
                if !started || body.is_empty() {
                    // Leading delimiter (or back-to-back delimiters): keep
                    // scanning for the real body.
                    started = true;
                    continue;
                }
                return Ok(body);
            }

            started = true;

            if pending_escape {
                pending_escape = false;
                match byte {
                    ESC_END => body.push(END),
                    ESC_ESC => body.push(ESC),
                    _ => return Err(FramingError::InvalidEscape),
                }
            } else if byte == ESC {
                pending_escape = true;
            } else {
                body.push(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn roundtrip_escapes_end_and_esc_bytes() {
        let body = [0xC0, 0xDB, 0x00];
        let framed = encode(&body);
        assert_eq!(
            framed,
            vec![0xC0, 0xDB, 0xDC, 0xDB, 0xDD, 0x00, 0xC0]
        );

        let mut cursor = Cursor::new(framed);
        let mut reader = FrameReader::new(&mut cursor);
        assert_eq!(reader.read_packet().unwrap(), body);
    }

    #[test]
    fn roundtrip_is_identity_for_arbitrary_bytes() {
        for seed in 0u8..=255 {
            let body: Vec<u8> = (0..32).map(|i| seed.wrapping_add(i)).collect();
            let framed = encode(&body);
            let mut cursor = Cursor::new(framed);
            let mut reader = FrameReader::new(&mut cursor);
            assert_eq!(reader.read_packet().unwrap(), body);
        }
    }

    #[test]
    fn invalid_escape_is_rejected() {
        let mut cursor = Cursor::new(vec![0xC0, 0xDB, 0x01, 0xC0]);
        let mut reader = FrameReader::new(&mut cursor);
        assert!(matches!(
            reader.read_packet(),
            Err(FramingError::InvalidEscape)
        ));
    }

    #[test]
    fn empty_stream_is_a_timeout_with_no_partial_packet() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new(&mut cursor);
        assert!(matches!(
            reader.read_packet(),
            Err(FramingError::Timeout { partial: false })
        ));
    }
}
