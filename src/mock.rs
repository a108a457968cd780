//! In-memory [`Transport`] emulator used by every other module's test suite.
//! Responses are queued by the test, not computed from protocol semantics:
//! this is a stand-in for the wire, not a device simulator.

use std::collections::VecDeque;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::Error;
use crate::transport::Transport;

/// One recorded `control_in`/`control_out` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCall {
    pub req: u8,
    pub val: u16,
    pub idx: u16,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MockTransport {
    control_in_responses: VecDeque<Vec<u8>>,
    control_in_log: Vec<ControlCall>,
    control_out_log: Vec<ControlCall>,
    bulk_read_responses: VecDeque<Vec<u8>>,
    bulk_written: Vec<u8>,
    fail_next_control_in: Option<Error>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the bytes the next `control_in` call will copy into its
    /// caller-supplied buffer. Must match that call's buffer length exactly.
    pub fn queue_control_in_response(&mut self, bytes: Vec<u8>) {
        self.control_in_responses.push_back(bytes);
    }

    /// Queues a 4-byte little-endian status word as a `control_in` response.
    pub fn queue_status(&mut self, status: u32) {
        self.queue_control_in_response(status.to_le_bytes().to_vec());
    }

    /// Queues a chunk of bytes the next `bulk_read` call(s) will drain from,
    /// in order, regardless of how the caller splits its reads.
    pub fn queue_bulk_read_data(&mut self, bytes: Vec<u8>) {
        self.bulk_read_responses.push_back(bytes);
    }

    /// Makes the next `control_in` call fail with the given error instead of
    /// popping a queued response.
    pub fn fail_next_control_in(&mut self, err: Error) {
        self.fail_next_control_in = Some(err);
    }

    pub fn control_in_calls(&self) -> &[ControlCall] {
        &self.control_in_log
    }

    pub fn control_out_calls(&self) -> &[ControlCall] {
        &self.control_out_log
    }

    /// Everything ever handed to `bulk_write`, concatenated in call order.
    pub fn bulk_written(&self) -> &[u8] {
        &self.bulk_written
    }
}

impl Transport for MockTransport {
    fn control_in(&mut self, req: u8, val: u16, idx: u16, buf: &mut [u8]) -> Result<(), Error> {
        if let Some(err) = self.fail_next_control_in.take() {
            return Err(err);
        }

        let response = self.control_in_responses.pop_front().unwrap_or_else(|| {
            panic!("control_in(req=0x{req:02x}) called with no response queued")
        });
        assert_eq!(
            response.len(),
            buf.len(),
            "queued control_in response length mismatch for req=0x{req:02x}"
        );
        buf.copy_from_slice(&response);

        self.control_in_log.push(ControlCall {
            req,
            val,
            idx,
            data: response,
        });
        Ok(())
    }

    fn control_out(&mut self, req: u8, val: u16, idx: u16, buf: &[u8]) -> Result<(), Error> {
        self.control_out_log.push(ControlCall {
            req,
            val,
            idx,
            data: buf.to_vec(),
        });
        Ok(())
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let chunk = self
                .bulk_read_responses
                .pop_front()
                .unwrap_or_else(|| panic!("bulk_read ran out of queued data"));
            let take = chunk.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;
            if take < chunk.len() {
                self.bulk_read_responses
                    .push_front(chunk[take..].to_vec());
            }
        }
        Ok(())
    }

    fn bulk_write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.bulk_written.extend_from_slice(buf);
        Ok(())
    }
}

/// A protocol-level device emulator, used by the end-to-end scenario tests
/// below rather than by individual unit tests (those use [`MockTransport`]'s
/// queue-and-log shape instead). Unlike `MockTransport`, this actually
/// interprets what it's sent: directory writes land in an append-only
/// flash image, the FolderList's own location is tracked across rewrites,
/// and a folder's SongList is resolved by reading back its `FolderEntry`
/// from flash — exactly the indirection [`crate::directory::download_song`]
/// exploits to stream song data through the SongList read path.
#[cfg(test)]
pub struct DeviceEmulator {
    flash: Vec<u8>,
    folder_list_offset: u16,
    folder_list_num_blocks: u16,
    last_write_start_block: u16,
    last_write_num_blocks: u16,
    read_cursor: usize,
}

#[cfg(test)]
impl DeviceEmulator {
    pub fn new() -> Self {
        Self {
            flash: Vec::new(),
            folder_list_offset: 0,
            folder_list_num_blocks: 0,
            last_write_start_block: 0,
            last_write_num_blocks: 0,
            read_cursor: 0,
        }
    }

    fn pad_to_block_boundary(&mut self) {
        let rem = self.flash.len() % crate::record::BLOCK_LEN;
        if rem != 0 {
            self.flash.resize(self.flash.len() + (crate::record::BLOCK_LEN - rem), 0);
        }
    }

    fn folder_entries(&self) -> Vec<crate::record::FolderEntry> {
        if self.folder_list_num_blocks == 0 {
            return Vec::new();
        }
        let start = self.folder_list_offset as usize * crate::record::BLOCK_LEN;
        let len = self.folder_list_num_blocks as usize * crate::record::BLOCK_LEN;
        let block = &self.flash[start..start + len];

        let max_entries = self.folder_list_num_blocks as usize * crate::record::RECORDS_PER_BLOCK;
        let mut entries = Vec::new();
        for i in 0..max_entries {
            let s = i * crate::record::RECORD_LEN;
            if crate::record::FolderEntry::is_empty_slot(&block[s..s + 2]) {
                break;
            }
            let record: [u8; crate::record::RECORD_LEN] =
                block[s..s + crate::record::RECORD_LEN].try_into().unwrap();
            entries.push(crate::record::parse_folder_entry(&record));
        }
        entries
    }

    fn resolve_read_start(&self, addr: u16) -> usize {
        if addr == crate::address::FOLDER_LIST_ADDRESS {
            self.folder_list_offset as usize * crate::record::BLOCK_LEN
        } else {
            let folder_num = (addr >> 8) as usize;
            let entries = self.folder_entries();
            entries[folder_num].offset as usize * crate::record::BLOCK_LEN
        }
    }
}

#[cfg(test)]
impl Transport for DeviceEmulator {
    fn control_in(&mut self, req: u8, val: u16, idx: u16, buf: &mut [u8]) -> Result<(), Error> {
        use crate::command::Command;

        if req == Command::GetMemStatus.code() {
            // Fixed synthetic geometry: 4096 16 KiB blocks (64 MiB card).
            let status = crate::record::MemStatus {
                _r1: 0,
                block_size: crate::record::BLOCK_LEN as u16,
                num_blocks: 4096,
                first_free_block: self.folder_list_offset + self.folder_list_num_blocks,
                num_unused_blocks: 4096 - (self.flash.len() / crate::record::BLOCK_LEN) as u16,
                _r2: 0,
                _r3: 0,
            };
            let mut cursor = std::io::Cursor::new(&mut buf[..]);
            cursor.write_u16::<LittleEndian>(status._r1).unwrap();
            cursor.write_u16::<LittleEndian>(status.block_size).unwrap();
            cursor.write_u16::<LittleEndian>(status.num_blocks).unwrap();
            cursor.write_u16::<LittleEndian>(status.first_free_block).unwrap();
            cursor.write_u16::<LittleEndian>(status.num_unused_blocks).unwrap();
            cursor.write_u32::<LittleEndian>(status._r2).unwrap();
            cursor.write_u32::<LittleEndian>(status._r3).unwrap();
            return Ok(());
        }

        let status: u32 = if req == Command::GetNumFolderBlocks.code() {
            self.folder_list_num_blocks as u32
        } else if req == Command::QueryOffsetLastWrite.code() {
            self.last_write_start_block as u32
        } else if req == Command::PreWriteFlag.code() {
            self.pad_to_block_boundary();
            self.last_write_start_block = (self.flash.len() / crate::record::BLOCK_LEN) as u16;
            0
        } else if req == Command::WriteToUsb.code() {
            let length = val as usize * 0x1_0000 + idx as usize;
            self.last_write_num_blocks =
                ((length + crate::record::BLOCK_LEN - 1) / crate::record::BLOCK_LEN) as u16;
            0
        } else if req == Command::SetReadAddress.code() {
            self.read_cursor = self.resolve_read_start(val);
            0
        } else if req == Command::ReadFromUsb.code() {
            0
        } else if req == Command::SetWriteAddress.code() || req == Command::SetCard.code() {
            0
        } else if req == Command::Wait.code() {
            0x8000_0000
        } else if req == Command::QueryFreeMem.code() {
            const TOTAL_BLOCKS: u32 = 4096;
            let used_blocks = (self.flash.len() / crate::record::BLOCK_LEN) as u32;
            (TOTAL_BLOCKS - used_blocks) * crate::record::BLOCK_LEN as u32
        } else if req == Command::EndFolderTransfers.code() {
            0
        } else if req == Command::GetFirmwareVersion.code() {
            0x0102
        } else if req == Command::StartUsbComm.code() || req == Command::EndUsbComm.code() {
            0
        } else {
            0
        };

        buf.copy_from_slice(&status.to_le_bytes()[..buf.len().min(4)]);
        Ok(())
    }

    fn control_out(&mut self, req: u8, _val: u16, _idx: u16, buf: &[u8]) -> Result<(), Error> {
        use crate::command::Command;

        if req == Command::SendFolderLocation.code() {
            let offset = u16::from_le_bytes([buf[0], buf[1]]);
            self.folder_list_offset = offset;
            self.folder_list_num_blocks = self.last_write_num_blocks;
        }
        Ok(())
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        buf.copy_from_slice(&self.flash[self.read_cursor..self.read_cursor + buf.len()]);
        self.read_cursor += buf.len();
        Ok(())
    }

    fn bulk_write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.flash.extend_from_slice(buf);
        Ok(())
    }
}

/// End-to-end scenarios against [`DeviceEmulator`], exercised through a full
/// [`crate::session::Session`] rather than bare directory calls, so the
/// init/finalize bracket runs too.
#[cfg(test)]
mod scenarios {
    use super::DeviceEmulator;
    use crate::session::Session;

    fn fresh_session() -> Session<DeviceEmulator> {
        Session::new(DeviceEmulator::new())
    }

    #[test]
    fn fresh_device_reports_empty_directory_and_full_capacity() {
        let mut session = fresh_session();
        assert!(session.list_folders().unwrap().is_empty());
        assert_eq!(session.get_free_memory().unwrap(), 4096 * 0x4000);
    }

    #[test]
    fn creating_two_folders_assigns_sequential_numbers() {
        let mut session = fresh_session();
        session.add_folder("Rock").unwrap();
        session.add_folder("Jazz").unwrap();

        let folders = session.list_folders().unwrap();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].name, "Rock");
        assert_eq!(folders[0].folder_num, 0);
        assert_eq!(folders[1].name, "Jazz");
        assert_eq!(folders[1].folder_num, 1);
    }

    fn seventeen_kib_song() -> Vec<u8> {
        let mut data = Vec::with_capacity(17_408);
        while data.len() < 17_408 {
            data.extend_from_slice(b"hello world");
        }
        data.truncate(17_408);
        data
    }

    #[test]
    fn uploaded_song_appears_in_its_folders_listing() {
        let mut session = fresh_session();
        session.add_folder("Rock").unwrap();

        let data = seventeen_kib_song();
        session.upload_song(0, "a.mp3", &data, |_| {}).unwrap();

        let songs = session.list_songs(0).unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].size, 17_408);
        assert_eq!(songs[0].name, "a.mp3");
    }

    #[test]
    fn downloaded_song_round_trips_byte_for_byte() {
        let mut session = fresh_session();
        session.add_folder("Rock").unwrap();
        let data = seventeen_kib_song();
        session.upload_song(0, "a.mp3", &data, |_| {}).unwrap();

        let downloaded = session.download_song(0, 0, |_| {}).unwrap();
        assert_eq!(downloaded, data);
    }

    #[test]
    fn deleting_a_song_then_its_folder_leaves_the_other_folder_intact() {
        let mut session = fresh_session();
        session.add_folder("Rock").unwrap();
        session.add_folder("Jazz").unwrap();
        let data = seventeen_kib_song();
        session.upload_song(0, "a.mp3", &data, |_| {}).unwrap();

        session.delete_song(0, 0).unwrap();
        session.delete_folder(1).unwrap();

        let folders = session.list_folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "Rock");
        assert!(session.list_songs(0).unwrap().is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_in_returns_queued_bytes_and_logs_call() {
        let mut transport = MockTransport::new();
        transport.queue_control_in_response(vec![0xAA, 0xBB]);
        let mut buf = [0u8; 2];
        transport.control_in(0x42, 1, 2, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(transport.control_in_calls()[0].req, 0x42);
    }

    #[test]
    fn bulk_read_drains_across_chunk_boundaries() {
        let mut transport = MockTransport::new();
        transport.queue_bulk_read_data(vec![1, 2, 3]);
        transport.queue_bulk_read_data(vec![4, 5]);
        let mut buf = [0u8; 4];
        transport.bulk_read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        let mut rest = [0u8; 1];
        transport.bulk_read(&mut rest).unwrap();
        assert_eq!(rest, [5]);
    }

    #[test]
    fn bulk_write_accumulates_across_calls() {
        let mut transport = MockTransport::new();
        transport.bulk_write(&[1, 2]).unwrap();
        transport.bulk_write(&[3]).unwrap();
        assert_eq!(transport.bulk_written(), &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "no response queued")]
    fn control_in_panics_when_nothing_queued() {
        let mut transport = MockTransport::new();
        let mut buf = [0u8; 1];
        let _ = transport.control_in(0, 0, 0, &mut buf);
    }
}
