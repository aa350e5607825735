//! Log entry codec.
//!
//! # Entry Format
//!
//! ```text
//! +----------+--------------------------------------------+
//! | 0-3      | entry_length (4 bytes, whole frame)        |
//! | 4        | entry_type (1 byte)                        |
//! | 5-N      | payload (variable, depends on type)        |
//! | N-N+3    | CRC32 checksum over all preceding bytes    |
//! +----------+--------------------------------------------+
//! ```

// frame lengths are bounded by u32
#![allow(clippy::cast_possible_truncation)]

use crate::kernel::StorageCommand;
use crate::txlog::LogError;

/// `entry_length` (4) + `entry_type` (1).
const ENTRY_HEADER_SIZE: usize = 5;

const CHECKSUM_SIZE: usize = 4;

/// Frames never legitimately exceed this; larger lengths are corruption.
const MAX_ENTRY_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Start = 0x01,
    Command = 0x02,
    Commit = 0x03,
    Rollback = 0x04,
    ChunkEnd = 0x05,
}

impl TryFrom<u8> for EntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Command),
            0x03 => Ok(Self::Commit),
            0x04 => Ok(Self::Rollback),
            0x05 => Ok(Self::ChunkEnd),
            _ => Err(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Opens a batch.
    Start {
        tx_id: u64,
        chunk_id: u32,
        time_millis: u64,
    },
    Command(StorageCommand),
    /// Closes the batch of a committed transaction.
    Commit { tx_id: u64, time_millis: u64 },
    /// Closes the batch of a rolled back transaction.
    Rollback { tx_id: u64, time_millis: u64 },
    /// Closes one chunk of a transaction written in several batches.
    ChunkEnd { tx_id: u64, chunk_id: u32 },
}

mod command_kind {
    pub const TOKEN_ADDED: u8 = 1;
    pub const TOKEN_REMOVED: u8 = 2;
    pub const VALUE_CHANGED: u8 = 3;
}

impl LogEntry {
    #[must_use]
    pub const fn entry_type(&self) -> EntryType {
        match self {
            Self::Start { .. } => EntryType::Start,
            Self::Command(_) => EntryType::Command,
            Self::Commit { .. } => EntryType::Commit,
            Self::Rollback { .. } => EntryType::Rollback,
            Self::ChunkEnd { .. } => EntryType::ChunkEnd,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        match *self {
            Self::Start {
                tx_id,
                chunk_id,
                time_millis,
            } => {
                bytes.extend_from_slice(&tx_id.to_le_bytes());
                bytes.extend_from_slice(&chunk_id.to_le_bytes());
                bytes.extend_from_slice(&time_millis.to_le_bytes());
            }
            Self::Command(command) => encode_command(&command, &mut bytes),
            Self::Commit { tx_id, time_millis } | Self::Rollback { tx_id, time_millis } => {
                bytes.extend_from_slice(&tx_id.to_le_bytes());
                bytes.extend_from_slice(&time_millis.to_le_bytes());
            }
            Self::ChunkEnd { tx_id, chunk_id } => {
                bytes.extend_from_slice(&tx_id.to_le_bytes());
                bytes.extend_from_slice(&chunk_id.to_le_bytes());
            }
        }
        bytes
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.payload();
        let total_len = ENTRY_HEADER_SIZE + payload.len() + CHECKSUM_SIZE;
        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
        bytes.push(self.entry_type() as u8);
        bytes.extend_from_slice(&payload);
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Length of the frame starting with `header`, validated against the
    /// bounds a frame can have.
    pub(crate) fn frame_len(header: [u8; 4]) -> Result<usize, LogError> {
        let len = u32::from_le_bytes(header) as usize;
        if !(ENTRY_HEADER_SIZE + CHECKSUM_SIZE..=MAX_ENTRY_SIZE).contains(&len) {
            return Err(LogError::CorruptEntry(format!("implausible entry length {len}")));
        }
        Ok(len)
    }

    /// Decode one entry. Returns the entry and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), LogError> {
        if bytes.len() < ENTRY_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(LogError::CorruptEntry("entry shorter than its header".to_string()));
        }
        let len = Self::frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
        if len > bytes.len() {
            return Err(LogError::CorruptEntry(format!(
                "entry length {len} exceeds {} available bytes",
                bytes.len()
            )));
        }

        let stored = u32::from_le_bytes([
            bytes[len - 4],
            bytes[len - 3],
            bytes[len - 2],
            bytes[len - 1],
        ]);
        let computed = crc32fast::hash(&bytes[..len - CHECKSUM_SIZE]);
        if stored != computed {
            return Err(LogError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let entry_type = EntryType::try_from(bytes[4]).map_err(LogError::InvalidEntryType)?;
        let mut payload = Payload::new(&bytes[ENTRY_HEADER_SIZE..len - CHECKSUM_SIZE]);
        let entry = match entry_type {
            EntryType::Start => Self::Start {
                tx_id: payload.u64()?,
                chunk_id: payload.u32()?,
                time_millis: payload.u64()?,
            },
            EntryType::Command => Self::Command(decode_command(&mut payload)?),
            EntryType::Commit => Self::Commit {
                tx_id: payload.u64()?,
                time_millis: payload.u64()?,
            },
            EntryType::Rollback => Self::Rollback {
                tx_id: payload.u64()?,
                time_millis: payload.u64()?,
            },
            EntryType::ChunkEnd => Self::ChunkEnd {
                tx_id: payload.u64()?,
                chunk_id: payload.u32()?,
            },
        };
        Ok((entry, len))
    }
}

fn encode_command(command: &StorageCommand, bytes: &mut Vec<u8>) {
    match *command {
        StorageCommand::TokenAdded { entity, token } => {
            bytes.push(command_kind::TOKEN_ADDED);
            bytes.extend_from_slice(&entity.to_le_bytes());
            bytes.extend_from_slice(&token.to_le_bytes());
        }
        StorageCommand::TokenRemoved { entity, token } => {
            bytes.push(command_kind::TOKEN_REMOVED);
            bytes.extend_from_slice(&entity.to_le_bytes());
            bytes.extend_from_slice(&token.to_le_bytes());
        }
        StorageCommand::ValueChanged {
            index,
            entity,
            before,
            after,
        } => {
            bytes.push(command_kind::VALUE_CHANGED);
            bytes.extend_from_slice(&index.to_le_bytes());
            bytes.extend_from_slice(&entity.to_le_bytes());
            let flags = u8::from(before.is_some()) | (u8::from(after.is_some()) << 1);
            bytes.push(flags);
            bytes.extend_from_slice(&before.unwrap_or_default().to_le_bytes());
            bytes.extend_from_slice(&after.unwrap_or_default().to_le_bytes());
        }
    }
}

fn decode_command(payload: &mut Payload<'_>) -> Result<StorageCommand, LogError> {
    match payload.u8()? {
        command_kind::TOKEN_ADDED => Ok(StorageCommand::TokenAdded {
            entity: payload.u64()?,
            token: payload.u32()?,
        }),
        command_kind::TOKEN_REMOVED => Ok(StorageCommand::TokenRemoved {
            entity: payload.u64()?,
            token: payload.u32()?,
        }),
        command_kind::VALUE_CHANGED => {
            let index = payload.u32()?;
            let entity = payload.u64()?;
            let flags = payload.u8()?;
            let before = payload.i64()?;
            let after = payload.i64()?;
            Ok(StorageCommand::ValueChanged {
                index,
                entity,
                before: (flags & 1 != 0).then_some(before),
                after: (flags & 2 != 0).then_some(after),
            })
        }
        kind => Err(LogError::CorruptEntry(format!("unknown command kind {kind}"))),
    }
}

/// Sequential little-endian reader over an entry payload.
struct Payload<'a> {
    bytes: &'a [u8],
}

impl<'a> Payload<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], LogError> {
        let Some((head, rest)) = self.bytes.split_first_chunk::<N>() else {
            return Err(LogError::CorruptEntry("payload too short".to_string()));
        };
        self.bytes = rest;
        Ok(*head)
    }

    fn u8(&mut self) -> Result<u8, LogError> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, LogError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, LogError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64, LogError> {
        Ok(i64::from_le_bytes(self.take()?))
    }
}
