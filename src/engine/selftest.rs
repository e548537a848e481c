//! Built-in self-test for derivation back-ends.
//!
//! Before a device back-end is allowed to produce real batches it must
//! reproduce, byte for byte, what the CPU reference derives for a fixed
//! set of base scalars. A single differing byte disqualifies the back-end
//! for the process lifetime.

use tracing::{debug, info};

use crate::error::{FinderError, Result};
use crate::pubkey::PublicKeyBytes;
use crate::scalar::{Scalar256, CURVE_ORDER, INVALID_SCALAR_REPLACEMENT};

use super::DeriveBackend;

const SELF_TEST_GRID_BITS: u32 = 4;

/// Base scalars exercising the low end, a dense middle value and the top
/// of the valid range (where the grid wraps through the group order).
fn self_test_bases() -> Vec<Scalar256> {
    let mut near_order = CURVE_ORDER;
    near_order[31] -= 3;
    vec![
        Scalar256::from_u64(1),
        Scalar256::from_u64(2),
        Scalar256::from_u64(0xDEAD_BEEF),
        Scalar256::from_hex_str("483ada7726a3c4655da4fbfc0e1108a8fd17b448a6855419")
            .expect("static self-test scalar"),
        Scalar256::from_bytes(near_order),
    ]
}

/// Derives the self-test set on both back-ends and compares every byte of
/// every coordinate. The reference is expected to be the CPU back-end.
/// Offsets whose implied scalar leaves the valid range are additionally
/// checked against the substitute key itself, so two back-ends cannot
/// pass by agreeing on a wrong wrap result.
pub fn run_self_test(
    reference: &mut dyn DeriveBackend,
    candidate: &mut dyn DeriveBackend,
) -> Result<()> {
    let substitute =
        PublicKeyBytes::from_scalar(&Scalar256::from_u64(INVALID_SCALAR_REPLACEMENT))?;
    for base in self_test_bases() {
        let expected = reference.derive_grid(base, SELF_TEST_GRID_BITS)?;
        let actual = candidate.derive_grid(base, SELF_TEST_GRID_BITS)?;
        for (index, (want, got)) in expected.iter().zip(actual.iter()).enumerate() {
            if want != got {
                return Err(FinderError::SelfTestMismatch {
                    backend: candidate.name().to_string(),
                    base: base.to_hex(),
                    index,
                });
            }
            if !base.add_offset(index as u64).is_valid() && want != &substitute {
                return Err(FinderError::SelfTestMismatch {
                    backend: reference.name().to_string(),
                    base: base.to_hex(),
                    index,
                });
            }
        }
        debug!(
            "self-test base {} ok on '{}'",
            base.to_hex(),
            candidate.name()
        );
    }
    info!("self-test passed for backend '{}'", candidate.name());
    Ok(())
}
