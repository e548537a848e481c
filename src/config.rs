//! JSON configuration model.
//!
//! A run is described by a single JSON document with a top-level `command`.
//! Field names are camelCase. The legacy command spellings used by older
//! configuration files are accepted as aliases.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub command: Command,
    #[serde(default)]
    pub finder: Option<FindConfig>,
    #[serde(default)]
    pub address_files_to_store: Option<ImportConfig>,
    #[serde(default)]
    pub store_to_address_file: Option<ExportConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Command {
    Find,
    #[serde(alias = "AddressFilesToLMDB")]
    AddressFilesToStore,
    #[serde(alias = "LMDBToAddressFile")]
    StoreToAddressFile,
    #[serde(alias = "OpenCLInfo")]
    GpuInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindConfig {
    #[serde(default)]
    pub key_sources: Vec<KeySourceConfig>,
    #[serde(default)]
    pub cpu_producers: Vec<CpuProducerConfig>,
    #[serde(default)]
    pub gpu_producers: Vec<GpuProducerConfig>,
    #[serde(default)]
    pub replay_producers: Vec<ReplayProducerConfig>,
    pub consumer: ConsumerConfig,
    /// Deadline for producer threads to wind down after an interrupt.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Key source definitions, tagged by `kind`. Every source carries a unique
/// non-empty `id` that producers reference.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeySourceConfig {
    #[serde(rename_all = "camelCase")]
    SecureRandom { id: String },
    #[serde(rename_all = "camelCase")]
    SeededRandom { id: String, seed: u64 },
    #[serde(rename_all = "camelCase")]
    BitMasked {
        id: String,
        bits: u32,
        #[serde(default)]
        seed: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FileReplay {
        id: String,
        path: PathBuf,
        format: SecretFormat,
    },
}

impl KeySourceConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::SecureRandom { id }
            | Self::SeededRandom { id, .. }
            | Self::BitMasked { id, .. }
            | Self::FileReplay { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretFormat {
    Decimal,
    Hex,
    Wif,
    Mnemonic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProducerConfig {
    pub key_source_id: String,
    pub grid_bits: u32,
    #[serde(default)]
    pub run_once: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuProducerConfig {
    pub key_source_id: String,
    pub grid_bits: u32,
    #[serde(default)]
    pub device_index: u32,
    #[serde(default)]
    pub bist_policy: BistPolicy,
    #[serde(default)]
    pub run_once: bool,
}

/// What to do when a GPU back-end fails its built-in self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BistPolicy {
    /// Drop the producer, keep the rest of the pipeline running.
    #[default]
    DropProducer,
    /// Abort the whole process.
    FailProcess,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayProducerConfig {
    pub key_source_id: String,
    #[serde(default = "default_replay_batch_size")]
    pub batch_size: usize,
}

fn default_replay_batch_size() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub store_path: PathBuf,
    /// Advisory pre-allocation for the writer side; the reader derives the
    /// map length from the file itself.
    #[serde(default)]
    pub minimum_store_size: u64,
    #[serde(default)]
    pub vanity_pattern: Option<String>,
    pub hits_file: PathBuf,
    /// Queue capacity is worker count times this factor.
    #[serde(default = "default_queue_depth")]
    pub queue_depth_per_worker: usize,
}

fn default_queue_depth() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    pub address_files: Vec<PathBuf>,
    pub store_path: PathBuf,
    #[serde(default)]
    pub minimum_store_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub store_path: PathBuf,
    pub output_file: PathBuf,
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportFormat {
    /// One base58 address per line.
    #[default]
    FixedWidth,
    /// Address and amount, tab separated.
    DynamicWidthWithAmount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find_config() {
        let json = r#"{
            "command": "Find",
            "finder": {
                "keySources": [
                    {"kind": "seededRandom", "id": "seeded", "seed": 42},
                    {"kind": "bitMasked", "id": "puzzle66", "bits": 66},
                    {"kind": "fileReplay", "id": "leak", "path": "secrets.txt", "format": "hex"}
                ],
                "cpuProducers": [
                    {"keySourceId": "seeded", "gridBits": 12, "runOnce": true}
                ],
                "gpuProducers": [
                    {"keySourceId": "puzzle66", "gridBits": 18, "bistPolicy": "failProcess"}
                ],
                "replayProducers": [
                    {"keySourceId": "leak"}
                ],
                "consumer": {
                    "storePath": "addresses.kgs",
                    "vanityPattern": "^1BitcoinEater",
                    "hitsFile": "hits.txt"
                }
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.command, Command::Find);
        let finder = config.finder.unwrap();
        assert_eq!(finder.key_sources.len(), 3);
        assert_eq!(finder.key_sources[0].id(), "seeded");
        assert_eq!(finder.cpu_producers[0].grid_bits, 12);
        assert!(finder.cpu_producers[0].run_once);
        assert_eq!(finder.gpu_producers[0].bist_policy, BistPolicy::FailProcess);
        assert_eq!(finder.replay_producers[0].batch_size, 1024);
        assert_eq!(finder.shutdown_timeout_secs, 30);
        assert_eq!(
            finder.consumer.vanity_pattern.as_deref(),
            Some("^1BitcoinEater")
        );
    }

    #[test]
    fn test_legacy_command_aliases() {
        for (legacy, expected) in [
            ("AddressFilesToLMDB", Command::AddressFilesToStore),
            ("LMDBToAddressFile", Command::StoreToAddressFile),
            ("OpenCLInfo", Command::GpuInfo),
        ] {
            let json = format!(r#"{{"command": "{legacy}"}}"#);
            let config: AppConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(config.command, expected);
        }
    }

    #[test]
    fn test_bist_policy_default() {
        let json = r#"{"keySourceId": "a", "gridBits": 16}"#;
        let config: GpuProducerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bist_policy, BistPolicy::DropProducer);
        assert_eq!(config.device_index, 0);
    }
}
