//! keygrid: secp256k1 key-space search against an on-disk address store.
//!
//! The pipeline has five parts, composed leaves-first:
//! - `store`: a read-only, memory-mapped ordered map of known address
//!   hashes and amounts
//! - `keysource`: named, configurable scalar producers (CSPRNG, seeded,
//!   bit-masked, file replay)
//! - `engine`: batch derivation of public keys from a base scalar and a
//!   dense integer grid, on the CPU or a GPU
//! - `consumer`: the hash & match stage probing both serializations of
//!   every key against the store
//! - `finder`: the coordinator wiring it all together
//!
//! Import (`import`) and export (`export`) move plaintext address dumps
//! in and out of the store format.

pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod export;
pub mod finder;
pub mod import;
pub mod keysource;
pub mod producer;
pub mod pubkey;
pub mod scalar;
pub mod store;

pub use config::{AppConfig, Command};
pub use error::{FinderError, Result};
pub use finder::Finder;
