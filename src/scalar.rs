//! 256-bit scalars for the secp256k1 group.
//!
//! Scalars are held as big-endian byte arrays. Any value outside
//! `[1, n-1]` is substituted by the fixed replacement `2` before it
//! reaches a derivation back-end; the substitution is observable in hit
//! records and keeps batches rectangular.

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{FinderError, Result};

pub const SCALAR_BYTES: usize = 32;

/// secp256k1 group order n, big-endian.
pub const CURVE_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFE, 0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36,
    0x41, 0x41,
];

/// Replacement for out-of-range scalars.
pub const INVALID_SCALAR_REPLACEMENT: u64 = 2;

/// A 256-bit scalar, big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scalar256([u8; 32]);

impl Scalar256 {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..32].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// A scalar is valid iff it is non-zero and below the group order.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        for i in 0..32 {
            if self.0[i] < CURVE_ORDER[i] {
                return true;
            }
            if self.0[i] > CURVE_ORDER[i] {
                return false;
            }
        }
        false
    }

    /// Returns the scalar itself, or the fixed replacement when out of range.
    pub fn normalized(&self) -> Self {
        if self.is_valid() {
            *self
        } else {
            Self::from_u64(INVALID_SCALAR_REPLACEMENT)
        }
    }

    /// 256-bit addition of a small offset, wrapping on overflow. The sum
    /// is not reduced modulo the group order; grid consumers pass it
    /// through [`Scalar256::normalized`].
    pub fn add_offset(&self, offset: u64) -> Self {
        let mut bytes = self.0;
        let mut carry = offset;
        for byte in bytes.iter_mut().rev() {
            let sum = *byte as u64 + (carry & 0xFF);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
        Self(bytes)
    }

    /// How many consecutive scalars starting at this one stay inside
    /// `[1, n-1]`, saturating at `limit`. A grid of that many offsets
    /// needs no substitution; everything beyond it does.
    pub fn valid_span(&self, limit: u64) -> u64 {
        if !self.is_valid() {
            return 0;
        }
        // n - self, big-endian byte subtraction
        let mut diff = [0u8; 32];
        let mut borrow = 0u16;
        for i in (0..32).rev() {
            let lhs = CURVE_ORDER[i] as u16;
            let rhs = self.0[i] as u16 + borrow;
            if lhs >= rhs {
                diff[i] = (lhs - rhs) as u8;
                borrow = 0;
            } else {
                diff[i] = (lhs + 256 - rhs) as u8;
                borrow = 1;
            }
        }
        if diff[..24].iter().any(|&b| b != 0) {
            return limit;
        }
        u64::from_be_bytes(diff[24..32].try_into().expect("slice is 8 bytes")).min(limit)
    }

    /// Zeroes the top `256 - bits` bits, shrinking the key space to `2^bits`.
    pub fn mask_to_bits(&self, bits: u32) -> Self {
        debug_assert!(bits <= 256);
        let mut bytes = self.0;
        let keep_bytes = (bits as usize + 7) / 8;
        for byte in bytes.iter_mut().take(32 - keep_bytes) {
            *byte = 0;
        }
        if bits % 8 != 0 && keep_bytes > 0 {
            bytes[32 - keep_bytes] &= (1u8 << (bits % 8)) - 1;
        }
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    // ------------------------------------------------------------------
    // Text formats accepted by file-replay sources
    // ------------------------------------------------------------------

    pub fn from_decimal_str(text: &str) -> Result<Self> {
        let value = BigUint::parse_bytes(text.as_bytes(), 10)
            .ok_or_else(|| FinderError::SecretParse(text.to_string()))?;
        Self::from_biguint(&value, text)
    }

    pub fn from_hex_str(text: &str) -> Result<Self> {
        let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
        let padded;
        let digits = if trimmed.len() % 2 == 1 {
            padded = format!("0{trimmed}");
            padded.as_str()
        } else {
            trimmed
        };
        let raw = hex::decode(digits).map_err(|_| FinderError::SecretParse(text.to_string()))?;
        if raw.len() > 32 {
            return Err(FinderError::SecretParse(text.to_string()));
        }
        let mut bytes = [0u8; 32];
        bytes[32 - raw.len()..].copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    /// Wallet import format: base58check with version byte `0x80`, with or
    /// without the trailing compression marker.
    pub fn from_wif(text: &str) -> Result<Self> {
        let decoded = bs58::decode(text)
            .into_vec()
            .map_err(|_| FinderError::SecretParse(text.to_string()))?;
        if decoded.len() != 37 && decoded.len() != 38 {
            return Err(FinderError::SecretParse(text.to_string()));
        }
        let (payload, checksum) = decoded.split_at(decoded.len() - 4);
        let digest = Sha256::digest(Sha256::digest(payload));
        if &digest[..4] != checksum || payload[0] != 0x80 {
            return Err(FinderError::SecretParse(text.to_string()));
        }
        if decoded.len() == 38 && payload[33] != 0x01 {
            return Err(FinderError::SecretParse(text.to_string()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&payload[1..33]);
        Ok(Self(bytes))
    }

    /// BIP-39 sentence with an empty passphrase; the scalar is the BIP-32
    /// master secret derived from the seed.
    pub fn from_mnemonic(text: &str) -> Result<Self> {
        let mnemonic = bip39::Mnemonic::parse_normalized(text)
            .map_err(|_| FinderError::SecretParse(text.to_string()))?;
        let seed = mnemonic.to_seed("");
        let mut mac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|_| FinderError::SecretParse(text.to_string()))?;
        mac.update(&seed);
        let master = mac.finalize().into_bytes();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&master[0..32]);
        Ok(Self(bytes))
    }

    fn from_biguint(value: &BigUint, original: &str) -> Result<Self> {
        let raw = value.to_bytes_be();
        if raw.len() > 32 {
            return Err(FinderError::SecretParse(original.to_string()));
        }
        let mut bytes = [0u8; 32];
        bytes[32 - raw.len()..].copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for Scalar256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Scalar256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scalar256({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_bounds() {
        assert!(!Scalar256::from_u64(0).is_valid());
        assert!(Scalar256::from_u64(1).is_valid());
        assert!(Scalar256::from_bytes([0x01; 32]).is_valid());
        assert!(!Scalar256::from_bytes(CURVE_ORDER).is_valid());
        assert!(!Scalar256::from_bytes([0xFF; 32]).is_valid());

        // n - 1 is the largest valid scalar
        let mut below = CURVE_ORDER;
        below[31] -= 1;
        assert!(Scalar256::from_bytes(below).is_valid());
    }

    #[test]
    fn test_normalized_substitutes_two() {
        let two = Scalar256::from_u64(2);
        assert_eq!(Scalar256::from_u64(0).normalized(), two);
        assert_eq!(Scalar256::from_bytes(CURVE_ORDER).normalized(), two);
        assert_eq!(Scalar256::from_u64(7).normalized(), Scalar256::from_u64(7));
    }

    #[test]
    fn test_add_offset_carries() {
        let one = Scalar256::from_u64(1);
        assert_eq!(one.add_offset(1), Scalar256::from_u64(2));

        let mut bytes = [0u8; 32];
        bytes[24..32].copy_from_slice(&u64::MAX.to_be_bytes());
        let max64 = Scalar256::from_bytes(bytes);
        let mut expected = [0u8; 32];
        expected[23] = 1;
        assert_eq!(max64.add_offset(1), Scalar256::from_bytes(expected));
    }

    #[test]
    fn test_valid_span() {
        assert_eq!(Scalar256::from_u64(1).valid_span(100), 100);
        assert_eq!(Scalar256::from_u64(1).valid_span(u64::MAX), u64::MAX);

        let mut near_order = CURVE_ORDER;
        near_order[31] -= 2;
        let base = Scalar256::from_bytes(near_order);
        assert_eq!(base.valid_span(8), 2);
        assert_eq!(base.valid_span(1), 1);

        near_order[31] += 1;
        assert_eq!(Scalar256::from_bytes(near_order).valid_span(8), 1);

        assert_eq!(Scalar256::from_u64(0).valid_span(8), 0);
        assert_eq!(Scalar256::from_bytes(CURVE_ORDER).valid_span(8), 0);
    }

    #[test]
    fn test_mask_to_bits() {
        let all = Scalar256::from_bytes([0xFF; 32]);
        let masked = all.mask_to_bits(8);
        assert_eq!(masked, Scalar256::from_u64(0xFF));

        let masked = all.mask_to_bits(12);
        assert_eq!(masked, Scalar256::from_u64(0x0FFF));

        let masked = all.mask_to_bits(256);
        assert_eq!(masked, all);
    }

    #[test]
    fn test_parse_decimal_and_hex() {
        assert_eq!(
            Scalar256::from_decimal_str("255").unwrap(),
            Scalar256::from_u64(255)
        );
        assert_eq!(
            Scalar256::from_hex_str("ff").unwrap(),
            Scalar256::from_u64(255)
        );
        assert_eq!(
            Scalar256::from_hex_str("0x1").unwrap(),
            Scalar256::from_u64(1)
        );
        assert!(Scalar256::from_decimal_str("not a number").is_err());
        assert!(Scalar256::from_hex_str(&"ff".repeat(33)).is_err());
    }

    #[test]
    fn test_parse_wif() {
        // private key 1, uncompressed and compressed forms
        let uncompressed = "5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDf";
        let compressed = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
        assert_eq!(
            Scalar256::from_wif(uncompressed).unwrap(),
            Scalar256::from_u64(1)
        );
        assert_eq!(
            Scalar256::from_wif(compressed).unwrap(),
            Scalar256::from_u64(1)
        );
        assert!(Scalar256::from_wif("5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDg").is_err());
    }

    #[test]
    fn test_parse_mnemonic() {
        // BIP-39 reference vector ("abandon ... about"), empty passphrase.
        let sentence = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        let scalar = Scalar256::from_mnemonic(sentence).unwrap();
        assert_eq!(
            scalar.to_hex(),
            "1837c1be8e2995ec11cda2b066151be2cfb48adf9e47b151d46adab3a21cdf67"
        );
        assert!(Scalar256::from_mnemonic("not a mnemonic").is_err());
    }

    #[test]
    fn test_hex_display_roundtrip() {
        let scalar = Scalar256::from_u64(0xDEADBEEF);
        assert_eq!(
            scalar.to_string(),
            "00000000000000000000000000000000000000000000000000000000deadbeef"
        );
        assert_eq!(Scalar256::from_hex_str(&scalar.to_hex()).unwrap(), scalar);
    }
}
