//! The address store: a read-only, memory-mapped ordered map from 20-byte
//! address hash to an 8-byte amount.
//!
//! On disk the store is a magic header followed by fixed-width records
//! sorted by unsigned lexicographic key order; point lookups are a binary
//! search over the mapping. Readers take no locks, so `contains` is safe
//! from any number of threads.
//!
//! Amounts carry a sentinel: a stored value of `1` stands for a logical
//! zero, because a record must keep a non-empty value to preserve its key.
//! The wrapper translates in both directions so callers only ever see
//! logical amounts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use rayon::slice::ParallelSliceMut;
use tracing::info;

use crate::error::{FinderError, Result};
use crate::pubkey::{Hash160, HASH160_BYTES};

const STORE_MAGIC: &[u8; 8] = b"KEYGRID1";
const HEADER_BYTES: usize = 16;
const AMOUNT_BYTES: usize = 8;
const RECORD_BYTES: usize = HASH160_BYTES + AMOUNT_BYTES;

/// Raw amount written for a logical zero.
const ZERO_SENTINEL: u64 = 1;

pub struct AddressStore {
    mmap: Mmap,
    count: usize,
    path: String,
}

impl AddressStore {
    /// Maps the store file and validates its header against the actual
    /// on-disk size. The mapping stays in place until `close` or drop.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let display = path.display().to_string();

        if mmap.len() < HEADER_BYTES || &mmap[0..8] != STORE_MAGIC {
            return Err(FinderError::StoreFormat {
                path: display,
                reason: "not an address store (bad magic)".into(),
            });
        }
        let count = u64::from_le_bytes(
            mmap[8..16].try_into().expect("header slice is 8 bytes"),
        ) as usize;
        if mmap.len() < HEADER_BYTES + count * RECORD_BYTES {
            return Err(FinderError::StoreFormat {
                path: display,
                reason: format!(
                    "truncated: header claims {count} records, file holds {} bytes",
                    mmap.len()
                ),
            });
        }

        info!(
            "address store '{}': {} entries, {} bytes mapped",
            display,
            count,
            mmap.len()
        );
        Ok(Self {
            mmap,
            count,
            path: display,
        })
    }

    /// Looks up a hash and returns its logical amount. Lock-free; callable
    /// from any number of reader threads concurrently.
    #[inline]
    pub fn contains(&self, hash: &Hash160) -> Option<u64> {
        let data = &self.mmap[HEADER_BYTES..];
        let target = hash.as_bytes();

        let mut left = 0usize;
        let mut right = self.count;
        while left < right {
            let mid = left + (right - left) / 2;
            let offset = mid * RECORD_BYTES;
            let entry = &data[offset..offset + HASH160_BYTES];
            match entry.cmp(target.as_slice()) {
                std::cmp::Ordering::Less => left = mid + 1,
                std::cmp::Ordering::Greater => right = mid,
                std::cmp::Ordering::Equal => {
                    let raw = u64::from_le_bytes(
                        data[offset + HASH160_BYTES..offset + RECORD_BYTES]
                            .try_into()
                            .expect("amount slice is 8 bytes"),
                    );
                    return Some(Self::from_raw_amount(raw));
                }
            }
        }
        None
    }

    pub fn size(&self) -> u64 {
        self.count as u64
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Unmaps the store. Dropping has the same effect; this exists so the
    /// coordinator can release the mapping at a defined point.
    pub fn close(self) {}

    /// Iterates entries in key order, with logical amounts.
    pub fn iter(&self) -> impl Iterator<Item = (Hash160, u64)> + '_ {
        let data = &self.mmap[HEADER_BYTES..];
        (0..self.count).map(move |i| {
            let offset = i * RECORD_BYTES;
            let hash = Hash160::from_slice(&data[offset..offset + HASH160_BYTES]);
            let raw = u64::from_le_bytes(
                data[offset + HASH160_BYTES..offset + RECORD_BYTES]
                    .try_into()
                    .expect("amount slice is 8 bytes"),
            );
            (hash, Self::from_raw_amount(raw))
        })
    }

    #[inline]
    fn from_raw_amount(raw: u64) -> u64 {
        if raw == ZERO_SENTINEL {
            0
        } else {
            raw
        }
    }
}

/// Collects entries in memory, then writes a sorted store file.
/// Later inserts of the same key win, matching overwrite semantics of the
/// engines these files are migrated from.
pub struct StoreBuilder {
    entries: Vec<([u8; HASH160_BYTES], u64)>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(minimum_size: u64) -> Self {
        let capacity = (minimum_size as usize).saturating_sub(HEADER_BYTES) / RECORD_BYTES;
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Queues an entry with its logical amount; zero becomes the sentinel.
    pub fn insert(&mut self, hash: Hash160, amount: u64) {
        let raw = if amount == 0 { ZERO_SENTINEL } else { amount };
        self.entries.push((*hash.as_bytes(), raw));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts, deduplicates (last insert wins) and writes the store file.
    pub fn write_to(mut self, path: &Path) -> Result<u64> {
        // stable sort keeps insertion order inside equal keys; walking
        // backwards then picks the latest insert for each key
        self.entries.par_sort_by(|a, b| a.0.cmp(&b.0));
        let mut deduped: Vec<([u8; HASH160_BYTES], u64)> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.into_iter().rev() {
            if deduped.last().map(|last| last.0) != Some(entry.0) {
                deduped.push(entry);
            }
        }
        deduped.reverse();

        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(1024 * 1024, file);
        writer.write_all(STORE_MAGIC)?;
        writer.write_all(&(deduped.len() as u64).to_le_bytes())?;
        for (hash, raw) in &deduped {
            writer.write_all(hash)?;
            writer.write_all(&raw.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(deduped.len() as u64)
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
