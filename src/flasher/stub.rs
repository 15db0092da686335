//! Stub upload and handshake (C6).

use crate::command::CommandType;
use crate::connection::Connection;
use crate::error::Error;
use crate::targets::StubPayload;

/// Fixed RAM-download block size used for stub upload, distinct from the
/// flash write sizes used once the stub is running.
const STUB_BLOCK_SIZE: u32 = 0x1800;

const HANDSHAKE_TOKEN: &[u8] = b"OHAI";

/// Upload `stub` to RAM and wait for its `"OHAI"` handshake.
///
/// If the connection already detected a resident stub at sync time
/// (`sync_stub_detected`), the caller should skip this entirely; see
/// [`Connection::is_stub`] combined with the sync outcome.
pub fn upload(conn: &mut Connection, stub: &StubPayload) -> Result<(), Error> {
    upload_segment(conn, stub.text_addr, &stub.text)?;
    upload_segment(conn, stub.data_addr, &stub.data)?;

    conn.mem_finish(stub.entry, false)?;

    let token = conn.read_raw(HANDSHAKE_TOKEN.len(), CommandType::MemEnd.timeout())?;
    if token != HANDSHAKE_TOKEN {
        return Err(Error::StubStart);
    }

    conn.enter_stub_mode(stub.occupied_ranges());
    Ok(())
}

fn upload_segment(conn: &mut Connection, addr: u32, data: &[u8]) -> Result<(), Error> {
    if data.is_empty() {
        return Ok(());
    }
    let blocks = data.len().div_ceil(STUB_BLOCK_SIZE as usize) as u32;
    conn.mem_begin(data.len() as u32, blocks, STUB_BLOCK_SIZE, addr)?;
    for (seq, chunk) in data.chunks(STUB_BLOCK_SIZE as usize).enumerate() {
        conn.mem_block(chunk, seq as u32)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_token_is_ohai() {
        assert_eq!(HANDSHAKE_TOKEN, b"OHAI");
    }
}
