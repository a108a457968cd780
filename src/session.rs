//! The Session controller. Owns the transport, the selected storage card,
//! and the `StartUSBComm`/`EndUSBComm` bracket every public operation runs
//! inside.
//!
//! No process-wide handle or global state: a `Session` is an explicit value
//! constructed on open and consumed on close.

use log::warn;

use crate::command::{send_command, Command};
use crate::directory::{self, FolderInfo, SongInfo};
use crate::error::Error;
use crate::firmware;
use crate::transport::{Transport, UsbTransport};

/// Which card a command's `idx` operand addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Internal,
    External,
}

impl From<Storage> for u16 {
    fn from(storage: Storage) -> u16 {
        match storage {
            Storage::Internal => 0,
            Storage::External => 1,
        }
    }
}

/// A live connection to one device. Generic over [`Transport`] so tests run
/// against [`crate::mock::MockTransport`] instead of real hardware.
pub struct Session<T: Transport> {
    transport: T,
    card: u16,
    initialized: bool,
}

impl Session<UsbTransport> {
    /// Opens the first Rio 500 found on the bus.
    pub fn open_usb() -> Result<Self, Error> {
        Ok(Self::new(UsbTransport::open()?))
    }
}

impl<T: Transport> Session<T> {
    /// Not `pub`: real callers go through [`Session::open_usb`]. `pub(crate)`
    /// so other in-crate test modules (the end-to-end scenarios driven
    /// against [`crate::mock::DeviceEmulator`]) can build a `Session` over a
    /// non-USB transport too.
    pub(crate) fn new(transport: T) -> Self {
        Self { transport, card: Storage::Internal.into(), initialized: false }
    }

    /// `set_storage`: pure bookkeeping, no device I/O, so it does not
    /// bracket with init/finalize.
    pub fn set_storage(&mut self, storage: Storage) {
        self.card = storage.into();
    }

    /// Mirrors the donor driver's `GetStorage()`: reads back the currently
    /// selected card without touching the device.
    pub fn get_storage(&self) -> Storage {
        match self.card {
            0 => Storage::Internal,
            _ => Storage::External,
        }
    }

    /// Idempotent; sends `StartUSBComm` only on the first call after
    /// construction or after the last `finalize()`.
    fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        send_command(&mut self.transport, Command::StartUsbComm, 0, 0)?;
        self.initialized = true;
        Ok(())
    }

    /// Errors here are logged, not propagated: the caller already has the
    /// result of the bracketed operation, and a failed teardown shouldn't
    /// mask it.
    fn finalize(&mut self) {
        if !self.initialized {
            return;
        }
        if let Err(err) = send_command(&mut self.transport, Command::EndUsbComm, 0, 0) {
            warn!("finalize: EndUSBComm failed: {err}");
        }
        if let Err(err) = send_command(&mut self.transport, Command::Wait, 0, 0) {
            warn!("finalize: trailing Wait failed: {err}");
        }
        self.initialized = false;
    }

    fn bracket<R>(&mut self, op: impl FnOnce(&mut T, u16) -> Result<R, Error>) -> Result<R, Error> {
        self.init()?;
        let result = op(&mut self.transport, self.card);
        self.finalize();
        result
    }

    /// Explicit teardown: finalize, then drop the transport.
    pub fn close(mut self) {
        self.finalize();
    }

    pub fn get_firmware_version(&mut self) -> Result<(u8, u8), Error> {
        self.bracket(|t, _card| directory::get_firmware_version(t))
    }

    pub fn get_total_memory(&mut self) -> Result<u32, Error> {
        self.bracket(directory::get_total_memory)
    }

    pub fn get_free_memory(&mut self) -> Result<u32, Error> {
        self.bracket(directory::get_free_memory)
    }

    pub fn list_folders(&mut self) -> Result<Vec<FolderInfo>, Error> {
        self.bracket(directory::list_folders)
    }

    pub fn list_songs(&mut self, folder_num: u16) -> Result<Vec<SongInfo>, Error> {
        self.bracket(|t, card| directory::list_songs(t, card, folder_num))
    }

    pub fn add_folder(&mut self, name: &str) -> Result<(), Error> {
        self.bracket(|t, card| directory::add_folder(t, card, name))
    }

    pub fn delete_folder(&mut self, folder_num: u16) -> Result<(), Error> {
        self.bracket(|t, card| directory::delete_folder(t, card, folder_num))
    }

    pub fn delete_song(&mut self, folder_num: u16, song_num: u16) -> Result<(), Error> {
        self.bracket(|t, card| directory::delete_song(t, card, folder_num, song_num))
    }

    pub fn upload_song(
        &mut self,
        folder_num: u16,
        name: &str,
        data: &[u8],
        mut progress: impl FnMut(u8),
    ) -> Result<(), Error> {
        self.bracket(|t, card| directory::upload_song(t, card, folder_num, name, data, &mut progress))
    }

    pub fn download_song(
        &mut self,
        folder_num: u16,
        song_num: u16,
        mut progress: impl FnMut(u8),
    ) -> Result<Vec<u8>, Error> {
        self.bracket(|t, card| directory::download_song(t, card, folder_num, song_num, &mut progress))
    }

    pub fn format(&mut self) -> Result<(), Error> {
        self.bracket(directory::format)
    }

    /// Two passes, to work around a peripheral quirk observed empirically.
    pub fn write_firmware(
        &mut self,
        data: &[u8],
        recovery: bool,
        mut progress: impl FnMut(u8),
    ) -> Result<(), Error> {
        self.bracket(|t, card| firmware::write_firmware(t, card, data, recovery, &mut progress))
    }
}

impl<T: Transport> Drop for Session<T> {
    /// Best-effort teardown for a `Session` dropped without an explicit
    /// `close()`.
    fn drop(&mut self) {
        self.finalize();
    }
}
