//! DTR/RTS reset sequences (part of C4).
//!
//! DTR is wired to the target's GPIO0 strap and RTS to its EN (reset) pin,
//! both active-low. Toggling them in the right order and timing either
//! drops the chip into the UART download bootloader or lets it boot
//! normally.

use std::thread::sleep;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::Error;

/// Strategy for driving the reset lines before a sync handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    /// RTS low 100 ms (reset, DTR high = boot-to-flash), then release RTS,
    /// then release DTR 50 ms later.
    Default,
    /// Like `Default` but with longer holds, to dodge a watchdog bug present
    /// on early silicon that resets again if reset is too short.
    Esp32R0Delay,
    /// Leave the lines alone entirely.
    NoReset,
    /// Leave the lines alone and skip the sync handshake too; the caller
    /// asserts the link is already live.
    NoResetNoSync,
}

impl ResetStrategy {
    /// Whether this strategy still expects a sync handshake afterwards.
    pub fn syncs(self) -> bool {
        !matches!(self, ResetStrategy::NoResetNoSync)
    }

    pub fn apply(self, port: &mut dyn SerialPort) -> Result<(), Error> {
        match self {
            ResetStrategy::Default => {
                port.write_data_terminal_ready(true)?;
                port.write_request_to_send(true)?;
                sleep(Duration::from_millis(100));
                port.write_request_to_send(false)?;
                sleep(Duration::from_millis(50));
                port.write_data_terminal_ready(false)?;
            }
            ResetStrategy::Esp32R0Delay => {
                port.write_data_terminal_ready(true)?;
                port.write_request_to_send(true)?;
                sleep(Duration::from_millis(1200));
                port.write_request_to_send(false)?;
                sleep(Duration::from_millis(400));
                port.write_data_terminal_ready(false)?;
            }
            ResetStrategy::NoReset | ResetStrategy::NoResetNoSync => {}
        }
        Ok(())
    }
}

/// Toggle RTS low for 100 ms; used for `hard_reset` after a flashing
/// session completes.
pub fn hard_reset(port: &mut dyn SerialPort) -> Result<(), Error> {
    port.write_request_to_send(true)?;
    sleep(Duration::from_millis(100));
    port.write_request_to_send(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reset_no_sync_does_not_sync() {
        assert!(!ResetStrategy::NoResetNoSync.syncs());
        assert!(ResetStrategy::Default.syncs());
        assert!(ResetStrategy::NoReset.syncs());
    }
}
