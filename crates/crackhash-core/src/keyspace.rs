//! # Keyspace partitioning
//!
//! Every candidate of length `1..=max_length` over an alphabet of `n` symbols
//! is addressed by a global index in `[0, total)`, where
//! `total = n + n^2 + ... + n^max_length`.
//!
//! Candidates are laid out in ascending-length blocks. Inside a block of
//! length `l`, the rank of a candidate is its value as an `l`-digit base-`n`
//! number, most significant digit first, with `alphabet[d]` standing for
//! digit `d`. For the alphabet `abc`:
//!
//! ```text
//! index: 0  1  2  3   4   5   6   ...  11  12
//! word:  a  b  c  aa  ab  ac  ba  ...  cc  aaa
//! ```
//!
//! Partition `p` of `count` covers `[total * p / count, total * (p + 1) / count)`
//! with floor division, so laying the partitions end to end covers the whole
//! space with no gaps and no overlap. When `total < count`, some partitions
//! are empty.

use crate::{Error, Result, types::Alphabet};
use core::ops::Range;

/// Index arithmetic over all candidates up to a maximum length.
#[derive(Clone, Debug)]
pub struct Keyspace {
    symbols: Vec<Box<[u8]>>,
    max_length: u32,
    /// `powers[k] == n^k` for `k` in `0..=max_length`.
    powers: Vec<u128>,
    total: u128,
}

impl Keyspace {
    /// Builds the keyspace for `alphabet` and `max_length`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the alphabet is empty, the
    /// maximum length is zero, or the candidate count does not fit in 128
    /// bits.
    pub fn new(alphabet: &Alphabet, max_length: u32) -> Result<Self> {
        if alphabet.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "alphabet is empty".into(),
            });
        }
        if max_length == 0 {
            return Err(Error::InvalidRequest {
                reason: "max length must be positive".into(),
            });
        }

        let overflow = || Error::InvalidRequest {
            reason: format!(
                "keyspace of {} symbols up to length {max_length} is too large",
                alphabet.len()
            ),
        };

        let radix = alphabet.len() as u128;
        let mut powers = Vec::with_capacity(max_length as usize + 1);
        powers.push(1_u128);
        let mut total = 0_u128;
        for _ in 0..max_length {
            let next = powers
                .last()
                .copied()
                .unwrap_or(1)
                .checked_mul(radix)
                .ok_or_else(overflow)?;
            total = total.checked_add(next).ok_or_else(overflow)?;
            powers.push(next);
        }

        Ok(Self {
            symbols: alphabet
                .symbols
                .iter()
                .map(|s| s.as_bytes().into())
                .collect(),
            max_length,
            powers,
            total,
        })
    }

    /// Number of candidates of length `1..=max_length`.
    pub const fn total(&self) -> u128 {
        self.total
    }

    pub const fn max_length(&self) -> u32 {
        self.max_length
    }

    /// Index range assigned to partition `part_number` of `part_count`.
    ///
    /// Computes `total * p / count` without forming the full product, so any
    /// representable keyspace can be partitioned. A `part_count` of zero
    /// yields an empty range.
    pub fn partition(&self, part_number: u32, part_count: u32) -> Range<u128> {
        if part_count == 0 {
            return 0..0;
        }
        let part_number = part_number.min(part_count);
        let bound = |p: u32| {
            let count = u128::from(part_count);
            let p = u128::from(p);
            let (q, r) = (self.total / count, self.total % count);
            q * p + r * p / count
        };
        bound(part_number)..bound((part_number + 1).min(part_count))
    }

    /// Writes the candidate at `index` into `buf`, replacing its contents.
    ///
    /// Returns `false` (leaving `buf` empty) when `index` is outside of
    /// `[0, total)`.
    pub fn write_word(&self, index: u128, buf: &mut Vec<u8>) -> bool {
        buf.clear();
        let mut offset = 0_u128;
        for length in 1..=self.max_length as usize {
            let block = self.powers[length];
            if index < offset + block {
                let mut rank = index - offset;
                for position in 0..length {
                    let power = self.powers[length - 1 - position];
                    let digit = (rank / power) as usize;
                    rank %= power;
                    buf.extend_from_slice(&self.symbols[digit]);
                }
                return true;
            }
            offset += block;
        }
        false
    }

    /// Returns the candidate at `index`, or `None` past the end.
    pub fn word_at(&self, index: u128) -> Option<String> {
        let mut buf = Vec::with_capacity(self.max_length as usize);
        if !self.write_word(index, &mut buf) {
            return None;
        }
        // Symbols are whole `str`s, so any concatenation is valid UTF-8.
        String::from_utf8(buf).ok()
    }
}
