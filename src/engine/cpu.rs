//! CPU derivation back-end.
//!
//! The base point `s·G` is computed once per batch; every following key is
//! one point addition of the generator. The chain is bit-identical to
//! independent scalar multiplications, which the tests pin down.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{ProjectivePoint, Scalar};

use crate::error::{FinderError, Result};
use crate::pubkey::{PublicKeyBytes, UNCOMPRESSED_BYTES};
use crate::scalar::{Scalar256, INVALID_SCALAR_REPLACEMENT};

use super::DeriveBackend;

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }

    /// Single full scalar multiplication; the unit the grid chain must agree
    /// with byte for byte.
    pub fn derive_single(scalar: &Scalar256) -> Result<PublicKeyBytes> {
        PublicKeyBytes::from_scalar(scalar)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeriveBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn derive_grid(&mut self, base: Scalar256, bits: u32) -> Result<Vec<PublicKeyBytes>> {
        let count = 1usize << bits;
        let scalar = Scalar::from_repr_vartime((*base.as_bytes()).into())
            .filter(|s| !bool::from(s.is_zero()))
            .ok_or(FinderError::InvalidScalar)?;

        let valid = base.valid_span(count as u64) as usize;
        let mut keys = Vec::with_capacity(count);
        let mut point = ProjectivePoint::GENERATOR * scalar;
        for _ in 0..valid {
            keys.push(encode_point(&point));
            point += ProjectivePoint::GENERATOR;
        }
        if valid < count {
            // the grid crossed the group order; every implied scalar from
            // the crossing on is replaced by the fixed substitute
            let substitute =
                PublicKeyBytes::from_scalar(&Scalar256::from_u64(INVALID_SCALAR_REPLACEMENT))?;
            keys.resize(count, substitute);
        }
        Ok(keys)
    }
}

fn encode_point(point: &ProjectivePoint) -> PublicKeyBytes {
    // only points of valid scalars reach here, never the identity
    let encoded = point.to_affine().to_encoded_point(false);
    let mut bytes = [0u8; UNCOMPRESSED_BYTES];
    bytes.copy_from_slice(encoded.as_bytes());
    PublicKeyBytes::from_uncompressed(bytes)
}
