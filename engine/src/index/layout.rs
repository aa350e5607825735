//! Key/value layouts: how a tree encodes and orders its entries.

use std::cmp::Ordering;

/// Fixed-size encoding and ordering of one tree's keys and values.
///
/// # Invariants
///
/// - `write_key` writes exactly `key_size()` bytes; `read_key` of those bytes
///   returns an equal key (same for values)
/// - `compare` is a total order
/// - `identifier` differs between layouts that are not byte-compatible; it is
///   stored in the tree's meta page and checked on open
pub trait Layout: Send + Sync {
    type Key: Clone + std::fmt::Debug + Send;
    type Value: Clone + std::fmt::Debug + Send;

    fn identifier(&self) -> u64;
    fn key_size(&self) -> usize;
    fn value_size(&self) -> usize;
    fn write_key(&self, key: &Self::Key, buf: &mut [u8]);
    fn read_key(&self, buf: &[u8]) -> Self::Key;
    fn write_value(&self, value: &Self::Value, buf: &mut [u8]);
    fn read_value(&self, buf: &[u8]) -> Self::Value;
    fn compare(&self, left: &Self::Key, right: &Self::Key) -> Ordering;
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// `u64 -> u64` layout used by tests of the tree machinery itself.
#[cfg(test)]
pub(crate) struct U64Layout;

#[cfg(test)]
impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        0x7536_345f_7536_3400
    }

    fn key_size(&self) -> usize {
        8
    }

    fn value_size(&self) -> usize {
        8
    }

    fn write_key(&self, key: &u64, buf: &mut [u8]) {
        write_u64(buf, 0, *key);
    }

    fn read_key(&self, buf: &[u8]) -> u64 {
        read_u64(buf, 0)
    }

    fn write_value(&self, value: &u64, buf: &mut [u8]) {
        write_u64(buf, 0, *value);
    }

    fn read_value(&self, buf: &[u8]) -> u64 {
        read_u64(buf, 0)
    }

    fn compare(&self, left: &u64, right: &u64) -> Ordering {
        left.cmp(right)
    }
}
