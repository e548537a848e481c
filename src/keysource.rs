//! Key sources: the configurable strategies that feed scalars to producers.
//!
//! A source is shared across producers behind an `Arc` and must be safe to
//! query from several threads. Every variant validates its output against
//! the group order and substitutes the fixed replacement on violation, so
//! downstream derivation always sees a usable scalar.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use tracing::warn;

use crate::config::{KeySourceConfig, SecretFormat};
use crate::error::{FinderError, Result};
use crate::scalar::Scalar256;

pub trait KeySource: Send + Sync {
    /// The next scalar, or `None` when the source is exhausted.
    /// Exhaustion is a clean termination, distinct from cancellation.
    fn next_base(&self) -> Result<Option<Scalar256>>;

    /// A block of scalars for producers that hash one key at a time.
    /// May return fewer than `n` when the source runs dry.
    fn next_batch(&self, n: usize) -> Result<Vec<Scalar256>> {
        let mut scalars = Vec::with_capacity(n);
        for _ in 0..n {
            match self.next_base()? {
                Some(scalar) => scalars.push(scalar),
                None => break,
            }
        }
        Ok(scalars)
    }

    /// Abort any in-flight read. Only meaningful for file-backed sources.
    fn interrupt(&self) {}

    /// Lines that failed to parse so far.
    fn read_errors(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// Random variants
// ---------------------------------------------------------------------------

/// Draws every scalar from the OS CSPRNG.
pub struct SecureRandomSource;

impl KeySource for SecureRandomSource {
    fn next_base(&self) -> Result<Option<Scalar256>> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Ok(Some(Scalar256::from_bytes(bytes).normalized()))
    }
}

/// Deterministic source for tests and reproducible sweeps.
pub struct SeededSource {
    rng: Mutex<StdRng>,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl KeySource for SeededSource {
    fn next_base(&self) -> Result<Option<Scalar256>> {
        let mut bytes = [0u8; 32];
        self.rng
            .lock()
            .expect("seeded rng lock poisoned")
            .fill_bytes(&mut bytes);
        Ok(Some(Scalar256::from_bytes(bytes).normalized()))
    }
}

/// Random scalars with the top `256 - bits` bits zeroed, shrinking the
/// effective key space to `2^bits`. Used for puzzle-range search.
pub struct BitMaskedSource {
    bits: u32,
    rng: Mutex<StdRng>,
}

impl BitMaskedSource {
    pub fn new(bits: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bits,
            rng: Mutex::new(rng),
        }
    }
}

impl KeySource for BitMaskedSource {
    fn next_base(&self) -> Result<Option<Scalar256>> {
        let mut bytes = [0u8; 32];
        self.rng
            .lock()
            .expect("masked rng lock poisoned")
            .fill_bytes(&mut bytes);
        let masked = Scalar256::from_bytes(bytes).mask_to_bits(self.bits);
        Ok(Some(masked.normalized()))
    }
}

// ---------------------------------------------------------------------------
// File replay
// ---------------------------------------------------------------------------

/// Replays scalars parsed from a text file, one per line. Blank lines and
/// `#` comments are skipped; lines that fail to parse are counted and
/// skipped. The source ends when the file ends.
pub struct FileReplaySource {
    reader: Mutex<BufReader<File>>,
    format: SecretFormat,
    interrupted: AtomicBool,
    errors: AtomicU64,
}

impl FileReplaySource {
    pub fn open(path: &Path, format: SecretFormat) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(file)),
            format,
            interrupted: AtomicBool::new(false),
            errors: AtomicU64::new(0),
        })
    }

    fn parse(&self, line: &str) -> Result<Scalar256> {
        match self.format {
            SecretFormat::Decimal => Scalar256::from_decimal_str(line),
            SecretFormat::Hex => Scalar256::from_hex_str(line),
            SecretFormat::Wif => Scalar256::from_wif(line),
            SecretFormat::Mnemonic => Scalar256::from_mnemonic(line),
        }
    }
}

impl KeySource for FileReplaySource {
    fn next_base(&self) -> Result<Option<Scalar256>> {
        let mut reader = self.reader.lock().expect("replay reader lock poisoned");
        let mut line = String::new();
        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                return Ok(None);
            }
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match self.parse(trimmed) {
                Ok(scalar) => return Ok(Some(scalar.normalized())),
                Err(_) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("skipping unparsable secret line: {trimmed}");
                }
            }
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn read_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds the id → source registry, rejecting empty and duplicate ids.
pub fn build_key_sources(
    configs: &[KeySourceConfig],
) -> Result<HashMap<String, Arc<dyn KeySource>>> {
    let mut sources: HashMap<String, Arc<dyn KeySource>> = HashMap::new();
    for config in configs {
        let id = config.id().trim();
        if id.is_empty() {
            return Err(FinderError::KeySourceIdMissing);
        }
        let source: Arc<dyn KeySource> = match config {
            KeySourceConfig::SecureRandom { .. } => Arc::new(SecureRandomSource),
            KeySourceConfig::SeededRandom { seed, .. } => Arc::new(SeededSource::new(*seed)),
            KeySourceConfig::BitMasked { bits, seed, .. } => {
                Arc::new(BitMaskedSource::new(*bits, *seed))
            }
            KeySourceConfig::FileReplay { path, format, .. } => {
                Arc::new(FileReplaySource::open(path, *format)?)
            }
        };
        if sources.insert(id.to_string(), source).is_some() {
            return Err(FinderError::KeySourceIdNotUnique(id.to_string()));
        }
    }
    Ok(sources)
}
