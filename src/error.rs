//! Error types returned by the connection, flasher, and image codecs.

use std::fmt;

use thiserror::Error;

use crate::command::CommandType;

/// Top-level error type for every fallible operation in this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The underlying serial port failed to read or write.
    #[error("I/O error communicating with the serial port")]
    Io(#[from] std::io::Error),

    /// The native serial port backend returned an error.
    #[error("serial port error")]
    Serial(#[from] serialport::Error),

    /// No response was received for a command within its deadline.
    #[error("timed out waiting for a response to {0}")]
    Timeout(CommandType),

    /// The byte-stuffed frame was malformed.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The response was well framed but did not parse as a valid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target received the command but replied with a nonzero status.
    #[error("command {command} failed on the target, status bytes {status_bytes:02x?}")]
    Remote {
        /// The command that was rejected.
        command: CommandType,
        /// The raw status trailer bytes returned by the target.
        status_bytes: Vec<u8>,
    },

    /// The target answered the invalid-message sentinel.
    #[error("command {0} is not supported by the target in its current mode")]
    UnsupportedCommand(CommandType),

    /// The detect-magic value read from the target did not match any known variant.
    #[error("unrecognized chip magic value 0x{0:08x}")]
    Unknown(u32),

    /// The caller asserted a chip variant that does not match the one detected.
    #[error("connected chip is {detected} but {expected} was specified")]
    WrongChip {
        /// The variant the caller specified.
        expected: &'static str,
        /// The variant actually detected.
        detected: &'static str,
    },

    /// The stub failed to announce itself after being uploaded.
    #[error("flasher stub did not respond with the expected handshake")]
    StubStart,

    /// An encrypted write was not aligned to the required boundary.
    #[error("address 0x{addr:08x} is not aligned to the required {align}-byte boundary")]
    Alignment {
        /// The offending address.
        addr: u32,
        /// The required alignment, in bytes.
        align: u32,
    },

    /// A RAM download would overlap the resident flasher stub.
    #[error("RAM region 0x{0:08x}..0x{1:08x} overlaps the resident stub")]
    Overlap(u32, u32),

    /// An SPI user command exceeded its MOSI/MISO size limits.
    #[error("SPI command exceeds the {0}-byte/bit limit")]
    Overflow(&'static str),

    /// Two flash-mapped segments claim the same 64 KiB flash page.
    #[error("segments at 0x{0:08x} and 0x{1:08x} both map to the same flash page")]
    DuplicateMapping(u32, u32),

    /// The SHA-256 patch window was invalid.
    #[error("SHA-256 patch error: {0}")]
    ShaPatch(String),

    /// The on-chip SPI controller did not complete a user command in time.
    #[error("on-chip SPI controller did not finish command 0x{0:02x}")]
    SpiTimeout(u8),

    /// A post-write MD5 readback did not match the data written.
    #[error("verification failed: expected digest {expected:032x}, got {actual:032x}")]
    Verify {
        /// The digest computed locally before the write.
        expected: u128,
        /// The digest returned by the target after the write.
        actual: u128,
    },

    /// An image or ELF file was structurally invalid.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A flash frequency or size is not supported by the requested chip.
    #[error("unsupported flash parameter: {0}")]
    UnsupportedFlash(String),

    /// More than 16 segments remained after merging.
    #[error("image has {0} segments after merging, the maximum is 16")]
    TooManySegments(usize),
}

impl Error {
    pub(crate) fn remote(command: CommandType, status_bytes: &[u8]) -> Self {
        Error::Remote {
            command,
            status_bytes: status_bytes.to_vec(),
        }
    }
}

/// Errors raised by the byte-stuffed frame codec (C1).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FramingError {
    /// An escape byte was followed by something other than `0xDC`/`0xDD`.
    #[error("invalid escape sequence in frame body")]
    InvalidEscape,

    /// The read timed out before a delimiter was seen.
    ///
    /// `partial` is `true` when at least one body byte of the frame had
    /// already been read, which distinguishes "nothing arrived" from
    /// "the target stopped talking mid-packet".
    #[error("timed out reading a frame (partial = {partial})")]
    Timeout {
        /// Whether a partial packet was already in progress.
        partial: bool,
    },
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
