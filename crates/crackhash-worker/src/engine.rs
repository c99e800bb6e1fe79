//! Parallel brute-force scan of one keyspace partition.
//!
//! A partition is split into one contiguous sub-range per compute unit. Each
//! unit walks its sub-range on a dedicated rayon pool, hashing every
//! candidate, and the partition result is only returned once every unit has
//! finished.

use core::ops::Range;
use crackhash_core::{
    Error, Result,
    keyspace::Keyspace,
    types::{DIGEST_HEX_LEN, Task},
};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

type Digest = [u8; DIGEST_HEX_LEN / 2];

#[derive(Debug)]
pub struct ComputeEngine {
    pool: ThreadPool,
    units: usize,
}

impl ComputeEngine {
    /// Builds an engine with `num_workers` compute units, or one per CPU
    /// when `num_workers` is zero.
    pub fn new(num_workers: usize) -> anyhow::Result<Self> {
        let units = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(units)
            .thread_name(|i| format!("crackhash-compute-{i}"))
            .build()?;
        Ok(Self { pool, units })
    }

    pub const fn units(&self) -> usize {
        self.units
    }

    /// Returns every candidate in the task's partition whose MD5 digest
    /// equals the task's hash. An empty partition yields an empty result.
    ///
    /// Blocks until the whole partition has been scanned.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Malformed`] for a hash that is not an MD5 hex
    /// digest, and with [`Error::InvalidRequest`] for a keyspace that cannot
    /// be addressed.
    pub fn process(&self, task: &Task) -> Result<Vec<String>> {
        let target = parse_digest(&task.hash)?;
        let keyspace = Keyspace::new(&task.alphabet, task.max_length)?;
        let partition = keyspace.partition(task.part_number, task.part_count);

        let found = self.pool.install(|| {
            split(partition, self.units)
                .into_par_iter()
                .map(|range| scan(&keyspace, range, &target))
                .reduce(Vec::new, |mut all, part| {
                    all.extend(part);
                    all
                })
        });
        Ok(found)
    }
}

fn parse_digest(hash: &str) -> Result<Digest> {
    let mut digest = Digest::default();
    hex::decode_to_slice(hash.trim(), &mut digest).map_err(|e| Error::Malformed {
        reason: format!("hash `{hash}` is not an MD5 digest: {e}"),
    })?;
    Ok(digest)
}

/// Splits `range` into `units` contiguous sub-ranges; the last one absorbs
/// the remainder. Empty sub-ranges are dropped.
fn split(range: Range<u128>, units: usize) -> Vec<Range<u128>> {
    let units = (units as u128).max(1);
    let step = (range.end - range.start) / units;
    (0..units)
        .map(|i| {
            let start = range.start + step * i;
            let end = if i + 1 == units {
                range.end
            } else {
                start + step
            };
            start..end
        })
        .filter(|r| !r.is_empty())
        .collect()
}

fn scan(keyspace: &Keyspace, range: Range<u128>, target: &Digest) -> Vec<String> {
    let mut buf = Vec::with_capacity(keyspace.max_length() as usize);
    let mut found = Vec::new();
    for index in range {
        if !keyspace.write_word(index, &mut buf) {
            break;
        }
        if md5::compute(&buf).0 == *target {
            found.push(String::from_utf8_lossy(&buf).into_owned());
        }
    }
    found
}
