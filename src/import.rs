//! Plaintext address ingestion: parses heterogeneous address dumps and
//! populates the store.
//!
//! Most public dumps share a loose format: one address per line with an
//! optional tab- or comma-separated amount in the smallest unit. Lines
//! that fail the strict parsers are salvaged through an unchecked base58
//! path that ignores the checksum and takes the 20 hash bytes at a fixed
//! offset; corrupt lines in public dumps are best-effort recovered that
//! way. Per-line failures are recorded and skipped; store write failures
//! abort the import.

use std::fs::File;
use std::io::{BufRead, BufReader};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::ImportConfig;
use crate::error::Result;
use crate::pubkey::{Hash160, HASH160_BYTES};
use crate::store::StoreBuilder;

/// Amount recorded when a line carries none; one smallest unit stands for
/// a logical zero in the store.
const DEFAULT_AMOUNT: u64 = 0;

const IGNORE_LINE_PREFIX: char = '#';
const ADDRESS_HEADER: &str = "address";

const VERSION_BYTES_REGULAR: usize = 1;
const VERSION_BYTES_ZCASH: usize = 2;

/// Base58 P2SH and P2PKH version prefixes of chains whose addresses still
/// carry a plain hash160: dash, dogecoin, litecoin, bitcoin gold,
/// blackcoin, feathercoin, vertcoin, namecoin, novacoin, reddcoin, zcash.
const BASE58_ALTCHAIN_PREFIXES: &[char] = &[
    '7', 'A', '9', 'M', '3', 't', 'X', 'D', 'L', 'G', 'B', 'V', 'N', '4', 'R',
];

/// Bech32 prefixes of altcoins and multi-sig forms that never hold a
/// 20-byte hash160 we could match.
const SKIPPED_PREFIXES: &[&str] = &["d-", "m-", "s-", "fc1", "lcc1", "ltc1", "nc1", "vtc1", "dgb1"];

#[derive(Debug, Default)]
pub struct ReadStatistic {
    pub unsupported: u64,
    pub errors: Vec<String>,
    pub current_file_progress: f64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParsedLine {
    Entry { hash: Hash160, amount: u64 },
    Ignored,
    Unsupported,
}

/// Parses one dump line into a store entry. `Err` carries the offending
/// line for the running statistic.
pub fn parse_address_line(line: &str) -> std::result::Result<ParsedLine, String> {
    let mut fields = line.split(['\t', ',']);
    let address = fields.next().unwrap_or("").trim();
    let amount = fields
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_AMOUNT);

    if address.is_empty()
        || address.starts_with(IGNORE_LINE_PREFIX)
        || address.starts_with(ADDRESS_HEADER)
    {
        return Ok(ParsedLine::Ignored);
    }

    if SKIPPED_PREFIXES.iter().any(|p| address.starts_with(p)) {
        return Ok(ParsedLine::Unsupported);
    }

    if address.starts_with("bc1") {
        return parse_bech32(address, amount);
    }

    if address.starts_with('q') {
        // bitcoin cash cashaddr (P2PKH), decoded straight to its hash160
        let hash = cashaddr_hash160(address).ok_or_else(|| line.to_string())?;
        return Ok(ParsedLine::Entry { hash, amount });
    }
    if address.starts_with('p') {
        // bitcoin cash cashaddr P2SH, a script hash we cannot match
        return Ok(ParsedLine::Unsupported);
    }

    if address.starts_with('t') {
        // zcash carries two version bytes
        let hash =
            base58_hash160_unchecked(address, VERSION_BYTES_ZCASH).ok_or_else(|| line.to_string())?;
        return Ok(ParsedLine::Entry { hash, amount });
    }
    if BASE58_ALTCHAIN_PREFIXES.contains(&address.chars().next().unwrap_or('\0')) {
        let hash = base58_hash160_unchecked(address, VERSION_BYTES_REGULAR)
            .ok_or_else(|| line.to_string())?;
        return Ok(ParsedLine::Entry { hash, amount });
    }

    // bitcoin base58 P2PKH; checksum, network and length failures all fall
    // through to the unchecked path
    let hash = match base58_hash160_checked(address) {
        Some(hash) => hash,
        None => base58_hash160_unchecked(address, VERSION_BYTES_REGULAR)
            .ok_or_else(|| line.to_string())?,
    };
    Ok(ParsedLine::Entry { hash, amount })
}

fn parse_bech32(address: &str, amount: u64) -> std::result::Result<ParsedLine, String> {
    let (hrp, data, _variant) = bech32::decode(address).map_err(|_| address.to_string())?;
    if hrp != "bc" || data.is_empty() {
        return Err(address.to_string());
    }
    let program = bech32::convert_bits(&data[1..], 5, 8, false).map_err(|_| address.to_string())?;
    if program.len() != HASH160_BYTES {
        // 32-byte witness programs (P2WSH, P2TR) cannot be matched
        return Ok(ParsedLine::Unsupported);
    }
    Ok(ParsedLine::Entry {
        hash: Hash160::from_slice(&program),
        amount,
    })
}

fn base58_hash160_checked(address: &str) -> Option<Hash160> {
    let decoded = bs58::decode(address).into_vec().ok()?;
    if decoded.len() != 25 || decoded[0] != 0x00 {
        return None;
    }
    let checksum = Sha256::digest(Sha256::digest(&decoded[..21]));
    if checksum[..4] != decoded[21..] {
        return None;
    }
    Some(Hash160::from_slice(&decoded[1..21]))
}

/// The unchecked path: base58 decode ignoring the checksum, hash bytes
/// taken at the version-byte offset, zero-padded when the line is short.
fn base58_hash160_unchecked(address: &str, version_bytes: usize) -> Option<Hash160> {
    let decoded = bs58::decode(address).into_vec().ok()?;
    if decoded.len() < version_bytes {
        return None;
    }
    let mut hash = [0u8; HASH160_BYTES];
    let available = (decoded.len() - version_bytes).min(HASH160_BYTES);
    hash[..available].copy_from_slice(&decoded[version_bytes..version_bytes + available]);
    Some(Hash160::from_slice(&hash))
}

// ---------------------------------------------------------------------------
// cashaddr
// ---------------------------------------------------------------------------

const CASHADDR_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const CASHADDR_PREFIX: &str = "bitcoincash";

fn cashaddr_polymod(values: &[u8]) -> u64 {
    const GENERATORS: [u64; 5] = [
        0x98_F2BC_8E61,
        0x79_B76D_99E2,
        0xF3_3E5F_B3C4,
        0xAE_2EAB_E2A8,
        0x1E_4F43_E470,
    ];
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_FFFF_FFFF) << 5) ^ d as u64;
        for (i, generator) in GENERATORS.iter().enumerate() {
            if (c0 >> i) & 1 == 1 {
                c ^= generator;
            }
        }
    }
    c ^ 1
}

fn cashaddr_checksum_values(payload: &[u8]) -> Vec<u8> {
    let mut values: Vec<u8> = CASHADDR_PREFIX.bytes().map(|b| b & 0x1F).collect();
    values.push(0);
    values.extend_from_slice(payload);
    values
}

/// Decodes a prefixless cashaddr P2PKH into its hash160. The original
/// converted these to legacy base58 first; decoding the payload directly
/// yields the same 20 bytes.
fn cashaddr_hash160(address: &str) -> Option<Hash160> {
    let mut values = Vec::with_capacity(address.len());
    for c in address.bytes() {
        let value = CASHADDR_CHARSET
            .iter()
            .position(|&d| d == c.to_ascii_lowercase())?;
        values.push(value as u8);
    }
    if values.len() < 9 || cashaddr_polymod(&cashaddr_checksum_values(&values)) != 0 {
        return None;
    }
    let payload = bech32::convert_bits(&values[..values.len() - 8], 5, 8, false).ok()?;
    // version byte: type in bits 3..6, size in bits 0..2; P2PKH hash160 is
    // type 0, size 0 (20 bytes)
    if payload.len() != 1 + HASH160_BYTES || payload[0] != 0x00 {
        return None;
    }
    Some(Hash160::from_slice(&payload[1..]))
}

// ---------------------------------------------------------------------------
// importer
// ---------------------------------------------------------------------------

/// Reads every configured dump file into the store. Line failures are
/// collected; anything failing on the store side is fatal and propagates.
pub fn import_address_files(config: &ImportConfig) -> Result<ReadStatistic> {
    let mut builder = StoreBuilder::with_capacity(config.minimum_store_size);
    let mut statistic = ReadStatistic::default();

    for path in &config.address_files {
        let file = File::open(path)?;
        let total_bytes = file.metadata()?.len().max(1) as f64;
        let mut read_bytes = 0u64;

        info!("importing '{}'", path.display());
        for line in BufReader::new(file).lines() {
            let line = line?;
            read_bytes += line.len() as u64 + 1;
            statistic.current_file_progress = (read_bytes as f64 / total_bytes) * 100.0;

            match parse_address_line(&line) {
                Ok(ParsedLine::Entry { hash, amount }) => builder.insert(hash, amount),
                Ok(ParsedLine::Ignored) => {}
                Ok(ParsedLine::Unsupported) => statistic.unsupported += 1,
                Err(bad_line) => statistic.errors.push(bad_line),
            }
        }
        info!(
            "finished '{}': {} entries so far, {} unsupported, {} errors",
            path.display(),
            builder.len(),
            statistic.unsupported,
            statistic.errors.len()
        );
    }

    let written = builder.write_to(&config.store_path)?;
    info!(
        "store '{}' written with {} entries",
        config.store_path.display(),
        written
    );
    Ok(statistic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AddressStore;
    use std::io::Write;

    const KEY_ONE_COMPRESSED_HASH: &str = "751e76e8199196d454941c45d1b3a323f1433bd6";

    fn known_hash() -> Hash160 {
        Hash160::from_slice(&hex::decode(KEY_ONE_COMPRESSED_HASH).unwrap())
    }

    fn base58check(version: &[u8], hash: &[u8]) -> String {
        let mut data = version.to_vec();
        data.extend_from_slice(hash);
        let checksum = Sha256::digest(Sha256::digest(&data));
        data.extend_from_slice(&checksum[..4]);
        bs58::encode(data).into_string()
    }

    fn cashaddr_encode(hash: &[u8]) -> String {
        let mut payload = vec![0u8];
        payload.extend_from_slice(hash);
        let mut values = bech32::convert_bits(&payload, 8, 5, true).unwrap();
        let mut check_input = cashaddr_checksum_values(&values);
        check_input.extend_from_slice(&[0u8; 8]);
        let polymod = cashaddr_polymod(&check_input);
        for i in 0..8 {
            values.push(((polymod >> (5 * (7 - i))) & 0x1F) as u8);
        }
        values
            .into_iter()
            .map(|v| CASHADDR_CHARSET[v as usize] as char)
            .collect()
    }

    #[test]
    fn test_plain_base58_address() {
        let line = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";
        assert_eq!(
            parse_address_line(line).unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_amount_separators() {
        for line in [
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH\t5000",
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH,5000",
        ] {
            assert_eq!(
                parse_address_line(line).unwrap(),
                ParsedLine::Entry {
                    hash: known_hash(),
                    amount: 5000
                }
            );
        }
        // unparsable amounts fall back to the default
        assert_eq!(
            parse_address_line("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH\tlots").unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_ignored_lines() {
        for line in ["", "   ", "# comment", "address", "address\tbalance"] {
            assert_eq!(parse_address_line(line).unwrap(), ParsedLine::Ignored);
        }
    }

    #[test]
    fn test_bech32_p2wpkh() {
        // BIP-173 example address carrying the hash160 of pubkey(1)
        let line = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert_eq!(
            parse_address_line(line).unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_bech32_32_byte_witness_skipped() {
        // P2WSH programs are 32 bytes and cannot be matched
        let line = "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3";
        assert_eq!(parse_address_line(line).unwrap(), ParsedLine::Unsupported);
    }

    #[test]
    fn test_multisig_and_altcoin_bech32_skipped() {
        for line in [
            "d-3b2a9f5c8d",
            "m-something",
            "s-something",
            "p2sh-cashaddr-is-p-prefixed",
            "fc1qvr9zesajsdw8aydcndd70wxj2wdgzu6zzltsph",
            "ltc1qd5wm03t5kcdupjuyq5jffpuacnaqahvfsdu8smf",
            "lcc1qrzlsxpjl0tynu3t2fkrw2ff2dgm0pv53ern0s5",
            "nc1q2ml905jv7gx0d8z5f7kl23af0vtrjk4j0llmwr",
            "vtc1qa4wejdlw9lmc7ks7l8hplc9fm394u79qjj0792",
            "dgb1qabcdefabcdefabcdefabcdefabcdefabcdef",
        ] {
            assert_eq!(
                parse_address_line(line).unwrap(),
                ParsedLine::Unsupported,
                "line should be skipped: {line}"
            );
        }
    }

    #[test]
    fn test_zcash_two_version_bytes() {
        let address = base58check(&[0x1C, 0xB8], known_hash().as_bytes());
        assert!(address.starts_with('t'), "zcash address: {address}");
        assert_eq!(
            parse_address_line(&address).unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_altchain_single_version_byte() {
        // dash P2PKH, version 0x4C, leading 'X'
        let address = base58check(&[0x4C], known_hash().as_bytes());
        assert!(address.starts_with('X'), "dash address: {address}");
        assert_eq!(
            parse_address_line(&address).unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_cashaddr_p2pkh() {
        let address = cashaddr_encode(known_hash().as_bytes());
        assert!(address.starts_with('q'), "cashaddr: {address}");
        assert_eq!(
            parse_address_line(&address).unwrap(),
            ParsedLine::Entry {
                hash: known_hash(),
                amount: 0
            }
        );
    }

    #[test]
    fn test_corrupt_checksum_is_salvaged_unchecked() {
        // flip the final character; the strict parser rejects the checksum
        // and the unchecked path still extracts 20 deterministic bytes
        let line = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMJ";
        match parse_address_line(line).unwrap() {
            ParsedLine::Entry { amount: 0, .. } => {}
            other => panic!("expected salvaged entry, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_base58_is_an_error() {
        assert!(parse_address_line("!!!not-base58@@@").is_err());
    }

    #[test]
    fn test_import_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.txt");
        let store_path = dir.path().join("store.kgs");
        let mut file = File::create(&dump).unwrap();
        writeln!(file, "# daily balance snapshot").unwrap();
        writeln!(file, "address").unwrap();
        writeln!(file, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH\t1234").unwrap();
        writeln!(file, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4,77").unwrap();
        writeln!(file, "d-deadbeef").unwrap();
        writeln!(file, "!!!broken line").unwrap();
        drop(file);

        let config = ImportConfig {
            address_files: vec![dump],
            store_path: store_path.clone(),
            minimum_store_size: 0,
        };
        let statistic = import_address_files(&config).unwrap();
        assert_eq!(statistic.unsupported, 1);
        assert_eq!(statistic.errors, vec!["!!!broken line".to_string()]);

        let store = AddressStore::open(&store_path).unwrap();
        // the two valid lines carry the same hash; the later one wins
        assert_eq!(store.size(), 1);
        assert_eq!(store.contains(&known_hash()), Some(77));
    }

    #[test]
    fn test_zero_amount_roundtrips_through_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.txt");
        let store_path = dir.path().join("store.kgs");
        std::fs::write(&dump, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH\t0\n").unwrap();

        let config = ImportConfig {
            address_files: vec![dump],
            store_path: store_path.clone(),
            minimum_store_size: 0,
        };
        import_address_files(&config).unwrap();
        let store = AddressStore::open(&store_path).unwrap();
        assert_eq!(store.contains(&known_hash()), Some(0));
    }
}
