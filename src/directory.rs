//! Folder and song operations, and the Post-Write Ritual every directory
//! mutation must end with.
//!
//! Every write here goes through [`write_records`], which packs entries
//! 8-to-a-block exactly like [`new_empty_block`] describes, then through one
//! of the two ritual variants: [`post_write_ritual`] when a parent record
//! needs its pointer updated afterward, [`close_after_write`] when the block
//! just written already *is* the parent.

use chrono::Utc;
use log::info;

use crate::address::{plan_read, plan_write, songlist_address, FOLDER_LIST_ADDRESS};
use crate::command::{send_command, send_command_out, wait_twice, Command};
use crate::error::Error;
use crate::record::{
    new_empty_block, parse_folder_entry, parse_mem_status, parse_song_entry,
    serialize_folder_entry, serialize_song_entry, FolderEntry, FolderLocation, MemStatus,
    SongEntry, BLOCK_LEN, MEM_STATUS_LEN, RECORD_LEN, RECORDS_PER_BLOCK,
};
use crate::transport::Transport;

/// A folder as reported to callers outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    pub folder_num: u16,
    /// `first_free_entry_off / 0x800`; the device's own bookkeeping for this
    /// is known to overcount, so treat it as an estimate, not a true count.
    pub song_count_estimate: u16,
}

/// A song as reported to callers outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongInfo {
    pub name: String,
    pub size: u32,
    pub song_num: u16,
    pub folder_num: u16,
    pub time: u32,
}

fn write_records<T: Transport>(
    transport: &mut T,
    card: u16,
    addr: u16,
    raw_records: &[[u8; RECORD_LEN]],
) -> Result<(), Error> {
    if raw_records.is_empty() {
        plan_write(transport, addr, card, 1)?;
        return transport.bulk_write(&new_empty_block());
    }

    let num_blocks = (raw_records.len() + RECORDS_PER_BLOCK - 1) / RECORDS_PER_BLOCK;
    plan_write(transport, addr, card, num_blocks)?;

    let mut block = new_empty_block();
    let mut count = 0;
    for record in raw_records {
        block[count * RECORD_LEN..(count + 1) * RECORD_LEN].copy_from_slice(record);
        count += 1;
        if count == RECORDS_PER_BLOCK {
            transport.bulk_write(&block)?;
            block = new_empty_block();
            count = 0;
        }
    }
    if count > 0 {
        transport.bulk_write(&block)?;
    }
    Ok(())
}

fn write_folder_list<T: Transport>(
    transport: &mut T,
    card: u16,
    folders: &[FolderEntry],
) -> Result<(), Error> {
    let raw: Vec<[u8; RECORD_LEN]> = folders.iter().map(serialize_folder_entry).collect();
    write_records(transport, card, FOLDER_LIST_ADDRESS, &raw)
}

fn write_song_list<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    songs: &[SongEntry],
) -> Result<(), Error> {
    let raw: Vec<[u8; RECORD_LEN]> = songs.iter().map(serialize_song_entry).collect();
    write_records(transport, card, songlist_address(folder_num), &raw)
}

fn wait_and_query_offset<T: Transport>(transport: &mut T) -> Result<u16, Error> {
    wait_twice(transport)?;
    let offset = send_command(transport, Command::QueryOffsetLastWrite, 0, 0)?;
    Ok(offset as u16)
}

fn close_transfer<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    offset: u16,
) -> Result<(), Error> {
    let location = FolderLocation::new(offset, folder_num);
    send_command_out(transport, Command::SendFolderLocation, 0, 0, Some(&location.to_bytes()))?;
    send_command(transport, Command::EndFolderTransfers, 0, card)?;
    Ok(())
}

/// The Post-Write Ritual: two `Wait`s, capture where the
/// write just landed, let the caller fold that into its parent record and
/// rewrite it, two more `Wait`s, capture where *that* rewrite landed, and
/// close the transaction against it.
fn post_write_ritual<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    mut rewrite_parent: impl FnMut(&mut T, u16) -> Result<(), Error>,
) -> Result<(), Error> {
    let write_offset = wait_and_query_offset(transport)?;
    rewrite_parent(transport, write_offset)?;
    let parent_offset = wait_and_query_offset(transport)?;
    close_transfer(transport, card, folder_num, parent_offset)
}

/// The ritual's short form, used when the block just written already is
/// the directory entity being announced (`download_song`'s case).
fn close_after_write<T: Transport>(transport: &mut T, card: u16, folder_num: u16) -> Result<(), Error> {
    let offset = wait_and_query_offset(transport)?;
    close_transfer(transport, card, folder_num, offset)
}

fn get_num_folder_blocks<T: Transport>(transport: &mut T, card: u16) -> Result<u16, Error> {
    let n = send_command(transport, Command::GetNumFolderBlocks, FOLDER_LIST_ADDRESS, card)?;
    Ok(n as u16)
}

fn read_folder_list<T: Transport>(transport: &mut T, card: u16) -> Result<Vec<FolderEntry>, Error> {
    let block_count = get_num_folder_blocks(transport, card)?;
    if block_count == 0 {
        return Ok(Vec::new());
    }
    let num_blocks = block_count as usize;
    plan_read(transport, FOLDER_LIST_ADDRESS, card, num_blocks)?;
    let mut buf = vec![0u8; num_blocks * BLOCK_LEN];
    transport.bulk_read(&mut buf)?;

    let max_entries = num_blocks * RECORDS_PER_BLOCK;
    let mut entries = Vec::new();
    for i in 0..max_entries {
        let start = i * RECORD_LEN;
        if FolderEntry::is_empty_slot(&buf[start..start + 2]) {
            break;
        }
        let record: [u8; RECORD_LEN] = buf[start..start + RECORD_LEN].try_into().unwrap();
        entries.push(parse_folder_entry(&record));
    }
    Ok(entries)
}

fn read_song_list<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    first_free_entry_off: u16,
) -> Result<Vec<SongEntry>, Error> {
    let num_blocks = (first_free_entry_off as usize + BLOCK_LEN - 1) / BLOCK_LEN;
    if num_blocks == 0 {
        return Ok(Vec::new());
    }

    plan_read(transport, songlist_address(folder_num) & 0x0FFF, card, num_blocks)?;
    let mut buf = vec![0u8; num_blocks * BLOCK_LEN];
    transport.bulk_read(&mut buf)?;

    let count = first_free_entry_off as usize / RECORD_LEN;
    let mut entries = Vec::new();
    for i in 0..count {
        let start = i * RECORD_LEN;
        if start + 2 > buf.len() || FolderEntry::is_empty_slot(&buf[start..start + 2]) {
            break;
        }
        let record: [u8; RECORD_LEN] = buf[start..start + RECORD_LEN].try_into().unwrap();
        entries.push(parse_song_entry(&record));
    }
    Ok(entries)
}

/// Host-assigned creation timestamp for new directory entries, matching the
/// donor protocol's `time.Now().Unix()`.
fn now_unix() -> u32 {
    Utc::now().timestamp() as u32
}

fn folder_by_num(folders: &[FolderEntry], folder_num: u16) -> Result<&FolderEntry, Error> {
    folders.get(folder_num as usize).ok_or(Error::OutOfRange {
        what: "folder_num",
        requested: folder_num as u32,
        bound: folders.len() as u32,
    })
}

pub fn list_folders<T: Transport>(transport: &mut T, card: u16) -> Result<Vec<FolderInfo>, Error> {
    let entries = read_folder_list(transport, card)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| FolderInfo {
            name: e.name(),
            folder_num: i as u16,
            song_count_estimate: e.first_free_entry_off / 0x800,
        })
        .collect())
}

pub fn list_songs<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
) -> Result<Vec<SongInfo>, Error> {
    let folders = read_folder_list(transport, card)?;
    let folder = folder_by_num(&folders, folder_num)?;
    let songs = read_song_list(transport, card, folder_num, folder.first_free_entry_off)?;
    Ok(songs
        .into_iter()
        .enumerate()
        .map(|(i, s)| SongInfo {
            name: s.name(),
            size: s.length,
            song_num: i as u16,
            folder_num,
            time: s.time,
        })
        .collect())
}

/// Creates a new folder. The creation timestamp is captured from the host
/// clock, not supplied by the caller.
pub fn add_folder<T: Transport>(transport: &mut T, card: u16, name: &str) -> Result<(), Error> {
    info!("add_folder({name:?})");
    let mut folders = read_folder_list(transport, card)?;
    if folders.len() >= 256 {
        return Err(Error::OutOfRange {
            what: "folder count",
            requested: folders.len() as u32 + 1,
            bound: 256,
        });
    }
    let new_folder_num = folders.len() as u16;

    write_song_list(transport, card, new_folder_num, &[])?;

    let mut new_entry = FolderEntry::new(name, now_unix());
    post_write_ritual(transport, card, 0, |t, offset| {
        new_entry.offset = offset;
        folders.push(new_entry);
        write_folder_list(t, card, &folders)
    })
}

fn delete_song_internal<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    song_num: u16,
    folders: &mut [FolderEntry],
) -> Result<(), Error> {
    let folder = folder_by_num(folders, folder_num)?;
    let mut songs = read_song_list(transport, card, folder_num, folder.first_free_entry_off)?;
    if song_num as usize >= songs.len() {
        return Err(Error::OutOfRange {
            what: "song_num",
            requested: song_num as u32,
            bound: songs.len() as u32,
        });
    }
    songs.remove(song_num as usize);

    send_command(transport, Command::SetWriteAddress, (folder_num << 8) | song_num, card)?;
    write_song_list(transport, card, folder_num, &songs)?;

    post_write_ritual(transport, card, folder_num, |t, offset| {
        folders[folder_num as usize].offset = offset;
        folders[folder_num as usize].first_free_entry_off -= 0x800;
        write_folder_list(t, card, folders)
    })
}

/// Deletes a folder: its songs, in reverse order, then the folder itself.
/// The folder list is re-read after each song deletion since every deletion
/// rewrites it.
pub fn delete_folder<T: Transport>(transport: &mut T, card: u16, folder_num: u16) -> Result<(), Error> {
    info!("delete_folder({folder_num})");
    let mut folders = read_folder_list(transport, card)?;
    let folder = folder_by_num(&folders, folder_num)?;
    let song_count = read_song_list(transport, card, folder_num, folder.first_free_entry_off)?.len();

    for song_num in (0..song_count).rev() {
        delete_song_internal(transport, card, folder_num, song_num as u16, &mut folders)?;
        folders = read_folder_list(transport, card)?;
    }

    folders.remove(folder_num as usize);
    send_command(transport, Command::SetWriteAddress, (folder_num << 8) | 0xFF, card)?;
    write_folder_list(transport, card, &folders)?;

    close_after_write(transport, card, 0)
}

pub fn delete_song<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    song_num: u16,
) -> Result<(), Error> {
    info!("delete_song(folder={folder_num}, song={song_num})");
    let mut folders = read_folder_list(transport, card)?;
    delete_song_internal(transport, card, folder_num, song_num, &mut folders)
}

/// Streams song data to the device in chunks. Returns the block offset the
/// payload landed at.
fn write_song_data<T: Transport>(
    transport: &mut T,
    card: u16,
    data: &[u8],
    mut progress: impl FnMut(u8),
) -> Result<u16, Error> {
    send_command(transport, Command::PreWriteFlag, 0xFFFF, card)?;

    let size = data.len();
    let mut written = 0;
    while written < size {
        let chunk_len = BLOCK_LEN.min(size - written);
        send_command(transport, Command::WriteToUsb, 0, chunk_len as u16)?;
        transport.bulk_write(&data[written..written + chunk_len])?;
        written += chunk_len;
        progress((written * 100 / size) as u8);
        wait_twice(transport)?;
    }

    wait_and_query_offset(transport)
}

/// Streams song data back from the device in chunks.
fn read_song_data<T: Transport>(
    transport: &mut T,
    card: u16,
    size: u32,
    mut progress: impl FnMut(u8),
) -> Result<Vec<u8>, Error> {
    let size = size as usize;
    let mut data = vec![0u8; size];
    let mut total = 0usize;

    let head_len = size.min(BLOCK_LEN);
    send_command(transport, Command::SetReadAddress, songlist_address(0), card)?;
    send_command(transport, Command::ReadFromUsb, 0, head_len as u16)?;
    transport.bulk_read(&mut data[..head_len])?;
    total += head_len;
    if size > 0 {
        progress((total * 100 / size) as u8);
    }

    let remaining = size - total;
    let mut big = remaining / 0x1_0000;
    let mut rem = remaining % 0x1_0000;

    const BATCH: usize = 16;
    while big > BATCH {
        send_command(transport, Command::ReadFromUsb, BATCH as u16, 0)?;
        for _ in 0..(BATCH / 2) {
            transport.bulk_read(&mut data[total..total + 0x2_0000])?;
            total += 0x2_0000;
            progress((total * 100 / size) as u8);
        }
        big -= BATCH;
        wait_twice(transport)?;
    }

    if big > 0 {
        send_command(transport, Command::ReadFromUsb, big as u16, 0)?;
        while big > 0 {
            let read_size = 0x1_0000.min(size - total);
            transport.bulk_read(&mut data[total..total + read_size])?;
            total += read_size;
            big -= 1;
            progress((total * 100 / size) as u8);
            wait_twice(transport)?;
        }
    }

    while rem > 0 {
        let this_read = rem.min(BLOCK_LEN);
        send_command(transport, Command::ReadFromUsb, 0, this_read as u16)?;
        transport.bulk_read(&mut data[total..total + this_read])?;
        total += this_read;
        rem -= this_read;
        progress((total * 100 / size) as u8);
    }

    Ok(data)
}

/// Uploads a song's data and directory entries into a folder.
pub fn upload_song<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    name: &str,
    data: &[u8],
    mut progress: impl FnMut(u8),
) -> Result<(), Error> {
    info!("upload_song(folder={folder_num}, name={name:?}, {} bytes)", data.len());

    let free = get_free_memory(transport, card)?;
    if data.len() as u32 > free {
        return Err(Error::OutOfMemory { need: data.len() as u32, have: free });
    }

    let mut folders = read_folder_list(transport, card)?;
    let folder = folder_by_num(&folders, folder_num)?;
    let mut songs = read_song_list(transport, card, folder_num, folder.first_free_entry_off)?;

    let song_location = write_song_data(transport, card, data, &mut progress)?;

    let new_song = SongEntry::new(name, song_location, data.len() as u32, now_unix());
    songs.push(new_song);
    write_song_list(transport, card, folder_num, &songs)?;

    post_write_ritual(transport, card, folder_num, |t, offset| {
        folders[folder_num as usize].offset = offset;
        folders[folder_num as usize].first_free_entry_off += 0x800;
        write_folder_list(t, card, &folders)
    })
}

/// Downloads a song's data: temporarily repoint folder 0's `offset` at the
/// song's own data block so the Read Choreography's hardcoded address
/// streams the payload instead of folder 0's actual song list, then
/// restore it.
pub fn download_song<T: Transport>(
    transport: &mut T,
    card: u16,
    folder_num: u16,
    song_num: u16,
    mut progress: impl FnMut(u8),
) -> Result<Vec<u8>, Error> {
    info!("download_song(folder={folder_num}, song={song_num})");
    let mut folders = read_folder_list(transport, card)?;
    let folder = folder_by_num(&folders, folder_num)?.clone();
    let songs = read_song_list(transport, card, folder_num, folder.first_free_entry_off)?;
    let song = *songs.get(song_num as usize).ok_or(Error::OutOfRange {
        what: "song_num",
        requested: song_num as u32,
        bound: songs.len() as u32,
    })?;

    let original_offset = folders[0].offset;
    folders[0].offset = song.offset;
    write_folder_list(transport, card, &folders)?;
    close_after_write(transport, card, folder_num)?;

    let data = read_song_data(transport, card, song.length, &mut progress)?;

    folders[0].offset = original_offset;
    write_folder_list(transport, card, &folders)?;
    close_after_write(transport, card, folder_num)?;

    Ok(data)
}

pub fn get_mem_status<T: Transport>(transport: &mut T, card: u16) -> Result<MemStatus, Error> {
    send_command(transport, Command::SetCard, 1, card)?;
    let mut buf = [0u8; MEM_STATUS_LEN];
    transport.control_in(Command::GetMemStatus.code(), 0, 0, &mut buf)?;
    Ok(parse_mem_status(&buf))
}

pub fn get_free_memory<T: Transport>(transport: &mut T, card: u16) -> Result<u32, Error> {
    send_command(transport, Command::Wait, 0, 0)?;
    let free = send_command(transport, Command::QueryFreeMem, 0, card)?;
    send_command(transport, Command::Wait, 0, 0)?;
    Ok(free)
}

pub fn get_total_memory<T: Transport>(transport: &mut T, card: u16) -> Result<u32, Error> {
    let status = get_mem_status(transport, card)?;
    Ok(status.num_blocks as u32 * status.block_size as u32)
}

pub fn get_firmware_version<T: Transport>(transport: &mut T) -> Result<(u8, u8), Error> {
    let result = send_command(transport, Command::GetFirmwareVersion, 0, 0)?;
    let packed = (result & 0xFFFF) as u16;
    Ok(((packed >> 8) as u8, (packed & 0xFF) as u8))
}

pub fn format<T: Transport>(transport: &mut T, card: u16) -> Result<(), Error> {
    let result = send_command(transport, Command::FormatCommit, 0x2185, card)?;
    if result == 0 {
        return Err(Error::ProtocolRejected { command: Command::FormatCommit });
    }
    std::thread::sleep(std::time::Duration::from_secs(1));
    Ok(())
}
