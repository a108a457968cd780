//! Translating "N 16 KiB blocks at logical address A" into the control-
//! command pair that sets up a bulk transfer, plus the logical address
//! encoding the rest of the device protocol builds on.

use crate::command::{send_command, Command};
use crate::error::Error;
use crate::record::BLOCK_LEN;
use crate::transport::Transport;

/// Sentinel folder tag selecting a folder's SongList rather than a song.
pub const SONGLIST_TAG: u16 = 0xFF;
/// Sentinel logical address selecting the master FolderList.
pub const FOLDER_LIST_ADDRESS: u16 = 0xFF00;

/// `(folder_num << 8) | tag`. `tag = 0xFF` addresses a folder's SongList;
/// [`FOLDER_LIST_ADDRESS`] addresses the FolderList. Callers setting up a
/// SongList *read* must mask the result with `0x0FFF` first; the write path
/// takes it unmasked.
pub fn songlist_address(folder_num: u16) -> u16 {
    (folder_num << 8) | SONGLIST_TAG
}

/// Splits a byte length into the `(num_64KiB_chunks, remainder_bytes)` pair
/// `ReadFromUSB`/`WriteToUSB` expect.
fn split_length(length: usize) -> (u16, u16) {
    let num_big = (length / 0x1_0000) as u16;
    let small = (length % 0x1_0000) as u16;
    (num_big, small)
}

/// Sets up a read of `num_blocks` 16 KiB blocks starting at `addr`. The
/// caller drains `num_blocks * 0x4000` bytes via `bulk_read` afterward.
pub fn plan_read(
    transport: &mut impl Transport,
    addr: u16,
    card: u16,
    num_blocks: usize,
) -> Result<(), Error> {
    let length = num_blocks * BLOCK_LEN;
    let (num_big, small) = split_length(length);
    send_command(transport, Command::SetReadAddress, addr, card)?;
    send_command(transport, Command::ReadFromUsb, num_big, small)?;
    Ok(())
}

/// Sets up a write of `num_blocks` 16 KiB blocks starting at `addr`. The
/// caller sends `num_blocks * 0x4000` bytes via `bulk_write` afterward.
pub fn plan_write(
    transport: &mut impl Transport,
    addr: u16,
    card: u16,
    num_blocks: usize,
) -> Result<(), Error> {
    let length = num_blocks * BLOCK_LEN;
    let (num_big, small) = split_length(length);
    send_command(transport, Command::SetWriteAddress, addr, card)?;
    send_command(transport, Command::PreWriteFlag, 0xFFFF, card)?;
    send_command(transport, Command::WriteToUsb, num_big, small)?;
    Ok(())
}
