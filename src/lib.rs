//! Host-side implementation of the Espressif boot ROM serial protocol:
//! packet framing, the request/response command layer, chip detection and
//! connection lifecycle, RAM stub upload, the SPI flash programming
//! engine, and the two on-flash firmware image formats.
//!
//! This crate does not bundle any flasher stub binaries or CLI; callers
//! supply a [`targets::StubPayload`] and drive [`flasher::Flasher`] or
//! [`connection::Connection`] directly.

pub mod command;
pub mod config;
pub mod connection;
pub mod elf;
pub mod error;
pub mod flasher;
pub mod frame;
pub mod image;
pub mod ops;
pub mod targets;

pub use error::Error;
