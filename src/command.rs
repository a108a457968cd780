//! Every vendor control-IN transfer returns a 4-byte little-endian status
//! word; this module carries that convention plus the full opcode table.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::Error;
use crate::transport::Transport;

/// The vendor command set recognized by the device. Values are the control
/// request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    FirmwareWrite = 0x3F,
    GetFirmwareVersion = 0x40,
    Wait = 0x42,
    QueryOffsetLastWrite = 0x43,
    ReadFromUsb = 0x45,
    WriteToUsb = 0x46,
    StartUsbComm = 0x47,
    EndUsbComm = 0x48,
    SetWriteAddress = 0x4C,
    FormatCommit = 0x4D,
    SetReadAddress = 0x4E,
    PreWriteFlag = 0x4F,
    QueryFreeMem = 0x50,
    SetCard = 0x51,
    SendFolderLocation = 0x56,
    GetMemStatus = 0x57,
    EndFolderTransfers = 0x58,
    GetNumFolderBlocks = 0x59,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Issues a control-IN transfer and decodes the 4-byte response as
/// little-endian `u32`, the device's universal status-word convention.
pub fn send_command(
    transport: &mut impl Transport,
    cmd: Command,
    val: u16,
    idx: u16,
) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    transport.control_in(cmd.code(), val, idx, &mut buf)?;
    let result = LittleEndian::read_u32(&buf);
    debug!("{cmd:?}(val=0x{val:04x}, idx=0x{idx:04x}) -> 0x{result:08x}");
    Ok(result)
}

/// Issues a control-OUT transfer, optionally carrying a payload.
pub fn send_command_out(
    transport: &mut impl Transport,
    cmd: Command,
    val: u16,
    idx: u16,
    data: Option<&[u8]>,
) -> Result<(), Error> {
    debug!("{cmd:?}(val=0x{val:04x}, idx=0x{idx:04x}) [out, {} bytes]", data.map_or(0, <[u8]>::len));
    transport.control_out(cmd.code(), val, idx, data.unwrap_or(&[]))
}

/// Two consecutive `Wait` polls, the bracket used throughout the directory
/// and firmware rituals. Doesn't inspect the readiness bit — callers that
/// need to block until ready use [`poll_until_ready`].
pub fn wait_twice(transport: &mut impl Transport) -> Result<(), Error> {
    send_command(transport, Command::Wait, 0, 0)?;
    send_command(transport, Command::Wait, 0, 0)?;
    Ok(())
}

/// Bit 31 of a `Wait` response signals the device is ready.
pub fn is_ready(status: u32) -> bool {
    status & 0x8000_0000 != 0
}
