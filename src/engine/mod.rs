//! Derivation engines: turning a base scalar and a grid width into
//! public-key coordinates.
//!
//! A back-end must deliver either a complete batch or an error; partial
//! batches never surface. Back-ends are owned by exactly one producer, so
//! `derive_grid` takes `&mut self` and needs no internal locking.

mod cpu;
mod gpu;
mod selftest;

pub use cpu::CpuBackend;
pub use gpu::{list_devices, DeviceInfo, GpuBackend};
pub use selftest::run_self_test;

use crate::error::{FinderError, Result};
use crate::pubkey::PublicKeyBytes;
use crate::scalar::Scalar256;

/// Largest number of coordinate pairs addressable with 32-bit indexing,
/// each pair occupying 64 bytes.
pub const MAX_COORDINATE_PAIRS: u32 = i32::MAX as u32 / 64;

/// Largest grid width whose `2^g` pairs stay within [`MAX_COORDINATE_PAIRS`].
pub const MAX_GRID_BITS: u32 = 31 - MAX_COORDINATE_PAIRS.leading_zeros();

/// Rejects grid widths outside `0..=MAX_GRID_BITS` at configuration time.
pub fn check_grid_bits(bits: u32) -> Result<()> {
    if bits > MAX_GRID_BITS {
        return Err(FinderError::GridBitsOutOfRange {
            bits,
            max: MAX_GRID_BITS,
        });
    }
    Ok(())
}

pub trait DeriveBackend: Send {
    fn name(&self) -> &str;

    /// Derives the public keys of `base, base+1, .., base+2^bits-1`.
    fn derive_grid(&mut self, base: Scalar256, bits: u32) -> Result<Vec<PublicKeyBytes>>;
}

/// The scalars a batch covers: a dense grid from a base, or an explicit
/// list for replayed secrets.
pub enum BatchScalars {
    Grid { base: Scalar256, bits: u32 },
    List(Vec<Scalar256>),
}

/// One unit of work for the consumer: scalars and their derived keys,
/// produced atomically.
pub struct Batch {
    scalars: BatchScalars,
    keys: Vec<PublicKeyBytes>,
}

impl Batch {
    pub fn from_grid(base: Scalar256, bits: u32, keys: Vec<PublicKeyBytes>) -> Self {
        debug_assert_eq!(keys.len(), 1usize << bits);
        Self {
            scalars: BatchScalars::Grid { base, bits },
            keys,
        }
    }

    pub fn from_list(scalars: Vec<Scalar256>, keys: Vec<PublicKeyBytes>) -> Self {
        debug_assert_eq!(keys.len(), scalars.len());
        Self {
            scalars: BatchScalars::List(scalars),
            keys,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn keys(&self) -> &[PublicKeyBytes] {
        &self.keys
    }

    /// The scalar behind key index `i`. Grid offsets that leave `[1, n-1]`
    /// report the fixed substitute, matching what the back-ends derive for
    /// those slots.
    #[inline]
    pub fn scalar_at(&self, index: usize) -> Scalar256 {
        match &self.scalars {
            BatchScalars::Grid { base, .. } => base.add_offset(index as u64).normalized(),
            BatchScalars::List(scalars) => scalars[index],
        }
    }
}
