//! Region state and on-device entry framing.
//!
//! A region cycles `Clean -> Open -> Sealed -> Reclaiming -> Clean`. While
//! open (and until its seal-time flush lands on the device) the region's
//! bytes live in an in-memory buffer that also serves reads.
//!
//! Entries pack into a region slot as `[value][key][padding][header]`,
//! with the fixed-size header at the slot's end. Reclaim walks a region
//! backward from its data end: each header names the slot size, which
//! yields the previous slot boundary.

use bytes::BytesMut;
use parking_lot::RwLock;
use xxhash_rust::xxh32::xxh32;

/// Slot sizes are rounded to this alignment in stack-allocated regions.
pub(crate) const ENTRY_ALIGN: usize = 8;

/// Serialized entry header size.
pub(crate) const ENTRY_HEADER_SIZE: usize = 12;

/// Seed for entry checksums.
const ENTRY_CHECKSUM_SEED: u32 = 0x1c3d_5e7f;

/// Fixed-size header stored at the end of each entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHeader {
    pub key_len: u16,
    pub value_len: u32,
    /// xxh32 over key then value; zero when checksumming is disabled.
    pub checksum: u32,
}

impl EntryHeader {
    pub(crate) fn new(key: &[u8], value: &[u8], with_checksum: bool) -> Self {
        Self {
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            checksum: if with_checksum {
                checksum_entry(key, value)
            } else {
                0
            },
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut bytes = [0u8; ENTRY_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.key_len.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.value_len.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        Some(Self {
            key_len: u16::from_le_bytes([bytes[0], bytes[1]]),
            value_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    /// Bytes of payload plus header, before slot alignment.
    pub(crate) fn raw_size(&self) -> usize {
        self.key_len as usize + self.value_len as usize + ENTRY_HEADER_SIZE
    }
}

/// Checksum of an entry's payload.
pub(crate) fn checksum_entry(key: &[u8], value: &[u8]) -> u32 {
    xxh32(value, xxh32(key, ENTRY_CHECKSUM_SEED))
}

/// Slot size for a stack-allocated entry.
pub(crate) fn stack_slot_size(key_len: usize, value_len: usize) -> usize {
    (key_len + value_len + ENTRY_HEADER_SIZE).div_ceil(ENTRY_ALIGN) * ENTRY_ALIGN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionState {
    Clean,
    Open,
    Sealed,
    Reclaiming,
}

pub(crate) struct RegionMeta {
    pub state: RegionState,
    /// Fixed slot size for size-class regions; zero for stack regions.
    pub slot_size: u32,
    /// Append cursor while open; data end once sealed.
    pub write_offset: u32,
    pub num_items: u32,
    /// In-memory image of the region, present from open until the
    /// seal-time flush completes.
    pub buffer: Option<BytesMut>,
}

pub(crate) struct Region {
    pub meta: RwLock<RegionMeta>,
}

impl Region {
    pub(crate) fn new() -> Self {
        Self {
            meta: RwLock::new(RegionMeta {
                state: RegionState::Clean,
                slot_size: 0,
                write_offset: 0,
                num_items: 0,
                buffer: None,
            }),
        }
    }
}
