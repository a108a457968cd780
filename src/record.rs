//! The on-device directory record layout. Two 2048-byte record types, each
//! holding a 1536-byte embedded display bitmap plus two NUL-padded name
//! fields, packed eight-to-a-block.
//!
//! Byte-exact compatibility with the wire format is the entire point of
//! this module; fields are fixed-size arrays, never `Vec`/`String`, so a
//! round trip through `parse_*`/`serialize_*` can never change layout.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const RECORD_LEN: usize = 2048;
pub const BLOCK_LEN: usize = 0x4000;
pub const RECORDS_PER_BLOCK: usize = BLOCK_LEN / RECORD_LEN;

pub const BITMAP_LEN: usize = 1536;
pub const NAME_PRIMARY_LEN: usize = 362;
pub const NAME_SECONDARY_LEN: usize = 128;

/// First two bytes of an empty record slot.
const EMPTY_SENTINEL: [u8; 2] = [0xFF, 0xFF];

/// Conventional magic constant observed in every newly created
/// [`FolderEntry::_r3`]; semantics unverified, preserved as-is.
pub const FOLDER_R3_MAGIC: u32 = 0x0021_00FF;
/// Conventional magic in [`SongEntry::_r3`].
pub const SONG_R3_MAGIC: u16 = 0x0020;
/// MP3 signature conventionally stored in [`SongEntry::mp3_sig`].
pub const MP3_SIGNATURE: u32 = 0x0092_FBFF;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FolderEntry {
    pub offset: u16,
    pub _r1: u16,
    pub first_free_entry_off: u16,
    pub _r2: u16,
    pub _r3: u32,
    pub _r4: u32,
    pub time: u32,
    pub bitmap_num_blocks: u16,
    pub bitmap: [u8; BITMAP_LEN],
    pub name_primary: [u8; NAME_PRIMARY_LEN],
    pub name_secondary: [u8; NAME_SECONDARY_LEN],
}

impl std::fmt::Debug for FolderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderEntry")
            .field("offset", &self.offset)
            .field("first_free_entry_off", &self.first_free_entry_off)
            .field("time", &self.time)
            .field("name", &nulterm_string(&self.name_primary))
            .finish_non_exhaustive()
    }
}

impl FolderEntry {
    /// Builds a fresh entry with the documented magic constants, current
    /// host time, and the given name copied into both name fields. The
    /// bitmap is left zeroed: rendering it from the name is out of scope for
    /// this crate; callers who want a display bitmap fill it in before
    /// writing the entry.
    pub fn new(name: &str, created_at: u32) -> Self {
        let mut name_primary = [0u8; NAME_PRIMARY_LEN];
        let mut name_secondary = [0u8; NAME_SECONDARY_LEN];
        copy_name(&mut name_primary, name);
        copy_name(&mut name_secondary, name);

        Self {
            offset: 0,
            _r1: 0,
            first_free_entry_off: 0,
            _r2: 0,
            _r3: FOLDER_R3_MAGIC,
            _r4: 0,
            time: created_at,
            bitmap_num_blocks: 0,
            bitmap: [0u8; BITMAP_LEN],
            name_primary,
            name_secondary,
        }
    }

    pub fn name(&self) -> String {
        nulterm_string(&self.name_primary)
    }

    pub fn is_empty_slot(bytes: &[u8]) -> bool {
        bytes.len() >= 2 && bytes[0..2] == EMPTY_SENTINEL
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SongEntry {
    pub offset: u16,
    pub _r1: u16,
    pub length: u32,
    pub _r2: u16,
    pub _r3: u16,
    pub mp3_sig: u32,
    pub time: u32,
    pub bitmap_num_blocks: u16,
    pub bitmap: [u8; BITMAP_LEN],
    pub name_primary: [u8; NAME_PRIMARY_LEN],
    pub name_secondary: [u8; NAME_SECONDARY_LEN],
}

impl std::fmt::Debug for SongEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongEntry")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("time", &self.time)
            .field("name", &nulterm_string(&self.name_primary))
            .finish_non_exhaustive()
    }
}

impl SongEntry {
    pub fn new(name: &str, offset: u16, length: u32, created_at: u32) -> Self {
        let mut name_primary = [0u8; NAME_PRIMARY_LEN];
        let mut name_secondary = [0u8; NAME_SECONDARY_LEN];
        copy_name(&mut name_primary, name);
        copy_name(&mut name_secondary, name);

        Self {
            offset,
            _r1: 0,
            length,
            _r2: 0,
            _r3: SONG_R3_MAGIC,
            mp3_sig: MP3_SIGNATURE,
            time: created_at,
            bitmap_num_blocks: 0,
            bitmap: [0u8; BITMAP_LEN],
            name_primary,
            name_secondary,
        }
    }

    pub fn name(&self) -> String {
        nulterm_string(&self.name_primary)
    }
}

fn copy_name(dest: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(dest.len());
    dest[..n].copy_from_slice(&bytes[..n]);
}

/// Truncates a fixed-size NUL-padded byte field at the first NUL, the
/// convention both name fields use.
pub fn nulterm_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn parse_folder_entry(data: &[u8; RECORD_LEN]) -> FolderEntry {
    let mut cursor = Cursor::new(&data[..]);
    let offset = cursor.read_u16::<LittleEndian>().unwrap();
    let _r1 = cursor.read_u16::<LittleEndian>().unwrap();
    let first_free_entry_off = cursor.read_u16::<LittleEndian>().unwrap();
    let _r2 = cursor.read_u16::<LittleEndian>().unwrap();
    let _r3 = cursor.read_u32::<LittleEndian>().unwrap();
    let _r4 = cursor.read_u32::<LittleEndian>().unwrap();
    let time = cursor.read_u32::<LittleEndian>().unwrap();
    let bitmap_num_blocks = cursor.read_u16::<LittleEndian>().unwrap();

    let mut bitmap = [0u8; BITMAP_LEN];
    cursor.read_exact(&mut bitmap).unwrap();

    let mut name_primary = [0u8; NAME_PRIMARY_LEN];
    cursor.read_exact(&mut name_primary).unwrap();

    let mut name_secondary = [0u8; NAME_SECONDARY_LEN];
    cursor.read_exact(&mut name_secondary).unwrap();

    FolderEntry {
        offset,
        _r1,
        first_free_entry_off,
        _r2,
        _r3,
        _r4,
        time,
        bitmap_num_blocks,
        bitmap,
        name_primary,
        name_secondary,
    }
}

pub fn serialize_folder_entry(entry: &FolderEntry) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    {
        let mut cursor = Cursor::new(&mut out[..]);
        cursor.write_u16::<LittleEndian>(entry.offset).unwrap();
        cursor.write_u16::<LittleEndian>(entry._r1).unwrap();
        cursor.write_u16::<LittleEndian>(entry.first_free_entry_off).unwrap();
        cursor.write_u16::<LittleEndian>(entry._r2).unwrap();
        cursor.write_u32::<LittleEndian>(entry._r3).unwrap();
        cursor.write_u32::<LittleEndian>(entry._r4).unwrap();
        cursor.write_u32::<LittleEndian>(entry.time).unwrap();
        cursor.write_u16::<LittleEndian>(entry.bitmap_num_blocks).unwrap();
        cursor.write_all(&entry.bitmap).unwrap();
        cursor.write_all(&entry.name_primary).unwrap();
        cursor.write_all(&entry.name_secondary).unwrap();
    }
    out
}

pub fn parse_song_entry(data: &[u8; RECORD_LEN]) -> SongEntry {
    let mut cursor = Cursor::new(&data[..]);
    let offset = cursor.read_u16::<LittleEndian>().unwrap();
    let _r1 = cursor.read_u16::<LittleEndian>().unwrap();
    let length = cursor.read_u32::<LittleEndian>().unwrap();
    let _r2 = cursor.read_u16::<LittleEndian>().unwrap();
    let _r3 = cursor.read_u16::<LittleEndian>().unwrap();
    let mp3_sig = cursor.read_u32::<LittleEndian>().unwrap();
    let time = cursor.read_u32::<LittleEndian>().unwrap();
    let bitmap_num_blocks = cursor.read_u16::<LittleEndian>().unwrap();

    let mut bitmap = [0u8; BITMAP_LEN];
    cursor.read_exact(&mut bitmap).unwrap();

    let mut name_primary = [0u8; NAME_PRIMARY_LEN];
    cursor.read_exact(&mut name_primary).unwrap();

    let mut name_secondary = [0u8; NAME_SECONDARY_LEN];
    cursor.read_exact(&mut name_secondary).unwrap();

    SongEntry {
        offset,
        _r1,
        length,
        _r2,
        _r3,
        mp3_sig,
        time,
        bitmap_num_blocks,
        bitmap,
        name_primary,
        name_secondary,
    }
}

pub fn serialize_song_entry(entry: &SongEntry) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    {
        let mut cursor = Cursor::new(&mut out[..]);
        cursor.write_u16::<LittleEndian>(entry.offset).unwrap();
        cursor.write_u16::<LittleEndian>(entry._r1).unwrap();
        cursor.write_u32::<LittleEndian>(entry.length).unwrap();
        cursor.write_u16::<LittleEndian>(entry._r2).unwrap();
        cursor.write_u16::<LittleEndian>(entry._r3).unwrap();
        cursor.write_u32::<LittleEndian>(entry.mp3_sig).unwrap();
        cursor.write_u32::<LittleEndian>(entry.time).unwrap();
        cursor.write_u16::<LittleEndian>(entry.bitmap_num_blocks).unwrap();
        cursor.write_all(&entry.bitmap).unwrap();
        cursor.write_all(&entry.name_primary).unwrap();
        cursor.write_all(&entry.name_secondary).unwrap();
    }
    out
}

/// A freshly allocated 16 KiB block with every one of its 8 record slots
/// marked empty (`0xFFFF` as the first two bytes).
pub fn new_empty_block() -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_LEN];
    for i in 0..RECORDS_PER_BLOCK {
        let start = i * RECORD_LEN;
        block[start] = 0xFF;
        block[start + 1] = 0xFF;
    }
    block
}

/// Memory status, as returned by `GetMemStatus` (18 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStatus {
    pub _r1: u16,
    pub block_size: u16,
    pub num_blocks: u16,
    pub first_free_block: u16,
    pub num_unused_blocks: u16,
    pub _r2: u32,
    pub _r3: u32,
}

pub const MEM_STATUS_LEN: usize = 18;

pub fn parse_mem_status(data: &[u8; MEM_STATUS_LEN]) -> MemStatus {
    let mut cursor = Cursor::new(&data[..]);
    MemStatus {
        _r1: cursor.read_u16::<LittleEndian>().unwrap(),
        block_size: cursor.read_u16::<LittleEndian>().unwrap(),
        num_blocks: cursor.read_u16::<LittleEndian>().unwrap(),
        first_free_block: cursor.read_u16::<LittleEndian>().unwrap(),
        num_unused_blocks: cursor.read_u16::<LittleEndian>().unwrap(),
        _r2: cursor.read_u32::<LittleEndian>().unwrap(),
        _r3: cursor.read_u32::<LittleEndian>().unwrap(),
    }
}

/// Announces where an updated directory block lives (6 bytes, sent as the
/// payload of `SendFolderLocation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderLocation {
    pub offset: u16,
    pub bytes: u16,
    pub folder_num: u16,
}

pub const FOLDER_LOCATION_LEN: usize = 6;

impl FolderLocation {
    pub fn new(offset: u16, folder_num: u16) -> Self {
        Self {
            offset,
            bytes: BLOCK_LEN as u16,
            folder_num,
        }
    }

    pub fn to_bytes(self) -> [u8; FOLDER_LOCATION_LEN] {
        let mut out = [0u8; FOLDER_LOCATION_LEN];
        {
            let mut cursor = Cursor::new(&mut out[..]);
            cursor.write_u16::<LittleEndian>(self.offset).unwrap();
            cursor.write_u16::<LittleEndian>(self.bytes).unwrap();
            cursor.write_u16::<LittleEndian>(self.folder_num).unwrap();
        }
        out
    }
}
