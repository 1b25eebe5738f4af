//! Value codec: composes raw bus words/bits into one `u64` and back.
//!
//! A logical value spans `count` consecutive addresses. With little-endian
//! ordering the lowest address holds the least significant word (or bit);
//! with big-endian ordering it holds the most significant one. Byte order
//! inside a 16-bit word is never touched.
//!
//! ```rust
//! use voltage_modbus_sync::codec;
//!
//! assert_eq!(codec::compose(&[0x0001, 0x0002], true), 0x0002_0001);
//! assert_eq!(codec::compose(&[0x0001, 0x0002], false), 0x0001_0002);
//! assert_eq!(codec::decompose(0x0002_0001, 2, true), vec![0x0001, 0x0002]);
//! ```

use std::collections::BTreeMap;

/// Most 16-bit words one value may span
pub const MAX_WORDS: u8 = 4;

/// Most bits one value may span
pub const MAX_BITS: u8 = 64;

/// Bit offset of element `index` out of `count`, each `width` bits wide
fn shift_for(index: u8, count: u8, width: u32, little_endian: bool) -> u32 {
    if little_endian {
        width * index as u32
    } else {
        width * (count - 1 - index) as u32
    }
}

fn accumulate<F>(count: u8, width: u32, little_endian: bool, mut element: F) -> u64
where
    F: FnMut(u8) -> u64,
{
    let mut value = 0u64;
    for index in 0..count {
        value |= element(index) << shift_for(index, count, width, little_endian);
    }
    value
}

/// Compose `count` holding/input registers starting at `address` from a raw cache
///
/// Addresses missing from the cache contribute zero. A `count` of zero or
/// above [`MAX_WORDS`] yields 0 without touching the cache.
pub fn compose_registers(
    cache: &BTreeMap<u16, u16>,
    address: u16,
    count: u8,
    little_endian: bool,
) -> u64 {
    if count == 0 || count > MAX_WORDS {
        return 0;
    }
    accumulate(count, 16, little_endian, |index| {
        address
            .checked_add(index as u16)
            .and_then(|addr| cache.get(&addr))
            .copied()
            .unwrap_or(0) as u64
    })
}

/// Compose `count` coils/discrete inputs starting at `address` from a raw cache
///
/// Same rules as [`compose_registers`] with one-bit elements; the limit is
/// [`MAX_BITS`].
pub fn compose_bits(
    cache: &BTreeMap<u16, bool>,
    address: u16,
    count: u8,
    little_endian: bool,
) -> u64 {
    if count == 0 || count > MAX_BITS {
        return 0;
    }
    accumulate(count, 1, little_endian, |index| {
        address
            .checked_add(index as u16)
            .and_then(|addr| cache.get(&addr))
            .map_or(0, |&bit| bit as u64)
    })
}

/// Compose a slice of words, `words.len()` being the count
pub fn compose(words: &[u16], little_endian: bool) -> u64 {
    if words.is_empty() || words.len() > MAX_WORDS as usize {
        return 0;
    }
    let count = words.len() as u8;
    accumulate(count, 16, little_endian, |index| words[index as usize] as u64)
}

/// Split a composed value back into `count` words
///
/// Returns an empty vector for an out-of-range `count`.
pub fn decompose(value: u64, count: u8, little_endian: bool) -> Vec<u16> {
    if count == 0 || count > MAX_WORDS {
        return Vec::new();
    }
    (0..count)
        .map(|index| (value >> shift_for(index, count, 16, little_endian)) as u16)
        .collect()
}

/// Compose a slice of bits, `bits.len()` being the count
pub fn compose_bit_slice(bits: &[bool], little_endian: bool) -> u64 {
    if bits.is_empty() || bits.len() > MAX_BITS as usize {
        return 0;
    }
    let count = bits.len() as u8;
    accumulate(count, 1, little_endian, |index| bits[index as usize] as u64)
}

/// Split a composed value back into `count` bits
pub fn decompose_bits(value: u64, count: u8, little_endian: bool) -> Vec<bool> {
    if count == 0 || count > MAX_BITS {
        return Vec::new();
    }
    (0..count)
        .map(|index| (value >> shift_for(index, count, 1, little_endian)) & 1 == 1)
        .collect()
}
