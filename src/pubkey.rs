//! Public-key serializations and address hashing.
//!
//! A derived key is carried through the pipeline as its uncompressed
//! 65-byte serialization; the compressed form is recovered on the host by
//! copying the x coordinate and picking the tag from the parity of the
//! last y byte, which is bit-identical to deriving it from the scalar.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{FinderError, Result};
use crate::scalar::Scalar256;

pub const TAG_UNCOMPRESSED: u8 = 0x04;
pub const TAG_COMPRESSED_EVEN: u8 = 0x02;
pub const TAG_COMPRESSED_ODD: u8 = 0x03;

pub const COORDINATE_BYTES: usize = 32;
pub const UNCOMPRESSED_BYTES: usize = 1 + 2 * COORDINATE_BYTES;
pub const COMPRESSED_BYTES: usize = 1 + COORDINATE_BYTES;

pub const HASH160_BYTES: usize = 20;

/// HASH160 = RIPEMD160(SHA256(input)).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash160([u8; HASH160_BYTES]);

impl Hash160 {
    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        debug_assert_eq!(slice.len(), HASH160_BYTES);
        let mut arr = [0u8; HASH160_BYTES];
        arr.copy_from_slice(slice);
        Self(arr)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH160_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Base58check rendering with the given version byte.
    pub fn to_base58check(&self, version: u8) -> String {
        let mut data = Vec::with_capacity(25);
        data.push(version);
        data.extend_from_slice(&self.0);
        let checksum = Sha256::digest(Sha256::digest(&data));
        data.extend_from_slice(&checksum[..4]);
        bs58::encode(data).into_string()
    }
}

impl std::fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash160({})", self.to_hex())
    }
}

#[inline]
pub fn hash160(data: &[u8]) -> Hash160 {
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    Hash160::from_slice(&ripemd)
}

/// A public key held in its uncompressed tagged serialization.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBytes {
    uncompressed: [u8; UNCOMPRESSED_BYTES],
}

impl PublicKeyBytes {
    pub fn from_uncompressed(bytes: [u8; UNCOMPRESSED_BYTES]) -> Self {
        debug_assert_eq!(bytes[0], TAG_UNCOMPRESSED);
        Self {
            uncompressed: bytes,
        }
    }

    /// Builds the tagged serialization from raw big-endian coordinates,
    /// the shape a GPU back-end reads back.
    pub fn from_coordinates(x: &[u8; COORDINATE_BYTES], y: &[u8; COORDINATE_BYTES]) -> Self {
        let mut uncompressed = [0u8; UNCOMPRESSED_BYTES];
        uncompressed[0] = TAG_UNCOMPRESSED;
        uncompressed[1..33].copy_from_slice(x);
        uncompressed[33..65].copy_from_slice(y);
        Self { uncompressed }
    }

    /// Full scalar multiplication on the host. Used by the CPU back-end
    /// and the self-test.
    pub fn from_scalar(scalar: &Scalar256) -> Result<Self> {
        let secret =
            k256::SecretKey::from_slice(scalar.as_bytes()).map_err(|_| FinderError::InvalidScalar)?;
        let point = secret.public_key().to_encoded_point(false);
        let mut uncompressed = [0u8; UNCOMPRESSED_BYTES];
        uncompressed.copy_from_slice(point.as_bytes());
        Ok(Self { uncompressed })
    }

    #[inline]
    pub fn uncompressed(&self) -> &[u8; UNCOMPRESSED_BYTES] {
        &self.uncompressed
    }

    #[inline]
    pub fn x(&self) -> &[u8] {
        &self.uncompressed[1..33]
    }

    #[inline]
    pub fn y(&self) -> &[u8] {
        &self.uncompressed[33..65]
    }

    /// The compressed serialization: x coordinate with a parity tag,
    /// `0x02` iff the last byte of y is even.
    pub fn compressed(&self) -> [u8; COMPRESSED_BYTES] {
        let mut compressed = [0u8; COMPRESSED_BYTES];
        compressed[1..].copy_from_slice(self.x());
        compressed[0] = if self.uncompressed[UNCOMPRESSED_BYTES - 1] % 2 == 0 {
            TAG_COMPRESSED_EVEN
        } else {
            TAG_COMPRESSED_ODD
        };
        compressed
    }

    #[inline]
    pub fn hash160_uncompressed(&self) -> Hash160 {
        hash160(&self.uncompressed)
    }

    #[inline]
    pub fn hash160_compressed(&self) -> Hash160 {
        hash160(&self.compressed())
    }
}

impl std::fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKeyBytes({})", hex::encode(self.uncompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE_UNCOMPRESSED: &str =
        "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
         483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";
    const KEY_ONE_COMPRESSED: &str =
        "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn key_one() -> PublicKeyBytes {
        PublicKeyBytes::from_scalar(&Scalar256::from_u64(1)).unwrap()
    }

    #[test]
    fn test_known_key_serializations() {
        let key = key_one();
        assert_eq!(hex::encode(key.uncompressed()), KEY_ONE_UNCOMPRESSED);
        assert_eq!(hex::encode(key.compressed()), KEY_ONE_COMPRESSED);
    }

    #[test]
    fn test_known_key_hashes() {
        let key = key_one();
        assert_eq!(
            key.hash160_uncompressed().to_hex(),
            "91b24bf9f5288532960ac687abb035127b1d28a5"
        );
        assert_eq!(
            key.hash160_compressed().to_hex(),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn test_compressed_matches_direct_derivation() {
        for value in [1u64, 2, 3, 0xCAFE, 0xDEAD_BEEF_0BAD_F00D] {
            let scalar = Scalar256::from_u64(value);
            let key = PublicKeyBytes::from_scalar(&scalar).unwrap();
            let secret = k256::SecretKey::from_slice(scalar.as_bytes()).unwrap();
            let direct = secret.public_key().to_encoded_point(true);
            assert_eq!(&key.compressed()[..], direct.as_bytes());
        }
    }

    #[test]
    fn test_hash160_definition() {
        // hash160 must equal RIPEMD160(SHA256(x)) computed step by step
        let data = b"keygrid";
        let sha = Sha256::digest(data);
        let ripemd = Ripemd160::digest(sha);
        assert_eq!(hash160(data).as_bytes(), &ripemd[..]);
    }

    #[test]
    fn test_base58check_rendering() {
        let key = key_one();
        assert_eq!(
            key.hash160_compressed().to_base58check(0x00),
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
    }

    #[test]
    fn test_coordinate_roundtrip() {
        let key = key_one();
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(key.x());
        y.copy_from_slice(key.y());
        assert_eq!(PublicKeyBytes::from_coordinates(&x, &y), key);
    }
}
