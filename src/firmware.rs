//! Firmware replacement. Two identical passes are required for the image to
//! survive a power cycle — an empirically observed, not fully understood,
//! peripheral quirk.

use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::command::{is_ready, send_command, wait_twice, Command};
use crate::error::Error;
use crate::transport::Transport;

const READY_POLL_ATTEMPTS: u32 = 50;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FIRMWARE_CHUNK_LEN: usize = 0x1_0000;
const FORMAT_COMMIT_VAL: u16 = 0x2185;

/// Writes `data` to the device in two identical passes. `recovery` downgrades
/// initialization and acceptance failures to logged warnings so a
/// semi-bricked device still gets a chance to recover. Never affects
/// directory operations.
pub fn write_firmware<T: Transport>(
    transport: &mut T,
    card: u16,
    data: &[u8],
    recovery: bool,
    mut progress: impl FnMut(u8),
) -> Result<(), Error> {
    for pass in 1..=2 {
        info!("firmware write pass {pass}/2 ({} bytes)", data.len());
        write_firmware_pass(transport, card, data, recovery, &mut progress)?;
    }
    Ok(())
}

fn write_firmware_pass<T: Transport>(
    transport: &mut T,
    card: u16,
    data: &[u8],
    recovery: bool,
    progress: &mut impl FnMut(u8),
) -> Result<(), Error> {
    poll_until_ready(transport, recovery)?;

    let size = data.len() as u32;
    let size_high = (size >> 16) as u16;
    let size_low = (size & 0xFFFF) as u16;
    let accepted = send_command(transport, Command::FirmwareWrite, size_high, size_low)?;
    if accepted == 0 {
        if recovery {
            warn!("firmware write rejected (0x{size_high:04x}/0x{size_low:04x}), continuing in recovery mode");
        } else {
            return Err(Error::ProtocolRejected { command: Command::FirmwareWrite });
        }
    }

    let mut written = 0;
    while written < data.len() {
        let chunk_len = FIRMWARE_CHUNK_LEN.min(data.len() - written);
        transport.bulk_write(&data[written..written + chunk_len])?;
        written += chunk_len;
        progress((written * 100 / data.len()) as u8);
    }

    wait_twice(transport)?;
    let committed = send_command(transport, Command::FormatCommit, FORMAT_COMMIT_VAL, card)?;
    if committed == 0 && !recovery {
        return Err(Error::ProtocolRejected { command: Command::FormatCommit });
    }
    wait_twice(transport)?;

    Ok(())
}

fn poll_until_ready<T: Transport>(transport: &mut T, recovery: bool) -> Result<(), Error> {
    for _ in 0..READY_POLL_ATTEMPTS {
        match send_command(transport, Command::Wait, 0, 0) {
            Ok(status) if is_ready(status) => return Ok(()),
            Ok(_) => {}
            Err(err) if recovery => {
                warn!("wait-poll failed in recovery mode, continuing anyway: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        thread::sleep(READY_POLL_INTERVAL);
    }
    Ok(())
}
