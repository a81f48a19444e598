//! Key and bit helpers shared by the trees and the proof engine
//!
//! Bits are numbered MSB-first: bit 0 is the top bit of the first byte and
//! selects the child taken at the root.

use crate::{Error, Result};

/// Whether bit `i` of `bits` is set. Bits past the end read as unset.
pub fn is_bit_set(bits: &[u8], i: usize) -> bool {
    bits.get(i / 8)
        .map_or(false, |byte| (byte << (i % 8)) & 0x80 == 0x80)
}

/// Expand `key` into exactly `8 * key_length` bits
pub fn binary_expansion(key: &[u8], key_length: usize) -> Vec<bool> {
    (0..key_length * 8).map(|i| is_bit_set(key, i)).collect()
}

/// Number of leading bits two keys share
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .enumerate()
        .find(|(_, (x, y))| x != y)
        .map_or(a.len().min(b.len()) * 8, |(i, (x, y))| {
            i * 8 + (x ^ y).leading_zeros() as usize
        })
}

/// Sort key/value pairs by key, ascending byte order
pub fn sort_keys(keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut pairs: Vec<_> = keys.into_iter().zip(values).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs.into_iter().unzip()
}

/// Split sorted keys sharing a prefix of `height` bits into the ones going
/// left and the ones going right at that level.
pub fn split_keys<K: AsRef<[u8]>>(sorted_keys: &[K], height: usize) -> (&[K], &[K]) {
    let index = sorted_keys.partition_point(|key| !is_bit_set(key.as_ref(), height));
    sorted_keys.split_at(index)
}

/// Check one key against the tree's key length
pub fn check_key(key: &[u8], key_length: usize) -> Result<()> {
    if key.len() != key_length {
        return Err(Error::InvalidKeyLength {
            expected: key_length,
            found: key.len(),
        });
    }
    Ok(())
}

/// Validate and sort a batch. Every key must have `key_length` bytes, every
/// value must be non-empty and keys must be unique.
pub fn prepare_batch(
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    key_length: usize,
) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    if keys.len() != values.len() {
        return Err(Error::InvalidInput(format!(
            "Keys and values must have the same length ({} keys, {} values)",
            keys.len(),
            values.len()
        )));
    }
    for key in &keys {
        check_key(key, key_length)?;
    }
    if values.iter().any(|v| v.is_empty()) {
        return Err(Error::InvalidValue);
    }

    let (keys, values) = sort_keys(keys, values);
    if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(Error::DuplicateKey(hex::encode(&pair[0])));
    }
    Ok((keys, values))
}

/// Pack a bit string into bytes, big-endian, padded with zero bits on the
/// left of the first byte.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    let pad = out.len() * 8 - bits.len();
    for (i, _) in bits.iter().enumerate().filter(|(_, bit)| **bit) {
        let pos = pad + i;
        out[pos / 8] |= 0x80 >> (pos % 8);
    }
    out
}

/// Unpack a bitmap produced by [`bits_to_bytes`]. The leading zero bits of
/// the first byte are padding and are dropped.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let Some(&first) = bytes.first() else {
        return Vec::new();
    };
    let skip = (first.leading_zeros() as usize).min(8);
    (skip..bytes.len() * 8)
        .map(|i| is_bit_set(bytes, i))
        .collect()
}
