//! Hash & match stage: turns coordinate batches into hits.
//!
//! The bounded batch queue is the only coordination primitive between
//! producers and the consumer. Producers block on `push` when it is full;
//! worker threads pull batches and never split one across threads. Each
//! key is hashed in both serializations and probed against the store; a
//! configured vanity pattern additionally matches the base58 rendering
//! even when the store misses.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use regex::Regex;
use tracing::{error, info};

use crate::engine::Batch;
use crate::error::Result;
use crate::pubkey::Hash160;
use crate::scalar::Scalar256;
use crate::store::AddressStore;

/// Version byte for the base58 rendering of candidate addresses.
const ADDRESS_VERSION: u8 = 0x00;

const RECV_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyForm {
    Uncompressed,
    Compressed,
}

impl KeyForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncompressed => "uncompressed",
            Self::Compressed => "compressed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hit {
    pub scalar: Scalar256,
    pub hash: Hash160,
    pub form: KeyForm,
    pub amount: u64,
    pub address: String,
}

impl Hit {
    /// `scalar_hex\tform\thash_hex\tamount\tbase58`
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.scalar.to_hex(),
            self.form.as_str(),
            self.hash.to_hex(),
            self.amount,
            self.address
        )
    }
}

pub trait HitSink: Send + Sync {
    fn record(&self, hit: &Hit) -> std::io::Result<()>;
}

/// Append-only text sink; a single mutex serializes writers, which is off
/// the hot path.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl HitSink for FileSink {
    fn record(&self, hit: &Hit) -> std::io::Result<()> {
        let mut file = self.file.lock().expect("hit sink lock poisoned");
        writeln!(file, "{}", hit.to_line())?;
        file.sync_data()
    }
}

/// The bounded producer/consumer queue. Capacity is the worker count times
/// a small depth factor: deep enough that hashers never starve, shallow
/// enough that a fast producer cannot run the host out of memory.
#[derive(Clone)]
pub struct BatchQueue {
    pub(crate) tx: Sender<Batch>,
    pub(crate) rx: Receiver<Batch>,
    capacity: usize,
}

impl BatchQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks while the queue is full. Returns `false` when the consumer
    /// side is gone and the producer should stop.
    pub fn push(&self, batch: Batch) -> bool {
        self.tx.send(batch).is_ok()
    }

    /// Removes one queued batch without blocking.
    pub fn try_pop(&self) -> Option<Batch> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct ConsumerStats {
    pub keys_checked: AtomicU64,
    pub hits_found: AtomicU64,
    pub batches_processed: AtomicU64,
}

/// The shared match context handed to every worker thread.
pub struct Consumer {
    store: Arc<AddressStore>,
    sink: Arc<dyn HitSink>,
    vanity: Option<Regex>,
    stop: Arc<AtomicBool>,
    pub stats: ConsumerStats,
}

impl Consumer {
    pub fn new(
        store: Arc<AddressStore>,
        sink: Arc<dyn HitSink>,
        vanity_pattern: Option<&str>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let vanity = vanity_pattern.map(Regex::new).transpose()?;
        Ok(Self {
            store,
            sink,
            vanity,
            stop,
            stats: ConsumerStats::default(),
        })
    }

    /// Spawns the worker pool. Workers drain in-flight batches after the
    /// stop flag is set, then exit once the queue stays empty or every
    /// producer handle is dropped.
    pub fn spawn_workers(
        consumer: &Arc<Self>,
        queue: &BatchQueue,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        info!("starting {} consumer workers", workers);
        (0..workers)
            .map(|worker| {
                let consumer = Arc::clone(consumer);
                let rx = queue.rx.clone();
                std::thread::Builder::new()
                    .name(format!("consumer-{worker}"))
                    .spawn(move || consumer.worker_loop(&rx))
                    .expect("spawning a consumer worker")
            })
            .collect()
    }

    fn worker_loop(&self, rx: &Receiver<Batch>) {
        loop {
            match rx.recv_timeout(RECV_TICK) {
                Ok(batch) => {
                    if let Err(e) = self.process_batch(&batch) {
                        // a failure here means a corrupt batch or a dead
                        // sink; both are fatal to the pipeline
                        error!("consumer failed, stopping pipeline: {e}");
                        self.stop.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Hashes every key of one batch in both forms and probes the store.
    /// A batch is one unit of work; it is never split across threads.
    pub fn process_batch(&self, batch: &Batch) -> Result<()> {
        for (index, key) in batch.keys().iter().enumerate() {
            let uncompressed = key.hash160_uncompressed();
            let compressed = key.hash160_compressed();

            self.probe(batch, index, uncompressed, KeyForm::Uncompressed)?;
            self.probe(batch, index, compressed, KeyForm::Compressed)?;
        }
        self.stats
            .keys_checked
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.batches_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn probe(&self, batch: &Batch, index: usize, hash: Hash160, form: KeyForm) -> Result<()> {
        let stored = self.store.contains(&hash);
        let vanity_match = match &self.vanity {
            Some(pattern) => pattern.is_match(&hash.to_base58check(ADDRESS_VERSION)),
            None => false,
        };
        if stored.is_none() && !vanity_match {
            return Ok(());
        }

        let hit = Hit {
            scalar: batch.scalar_at(index),
            hash,
            form,
            amount: stored.unwrap_or(0),
            address: hash.to_base58check(ADDRESS_VERSION),
        };
        info!("hit: {}", hit.to_line());
        self.sink.record(&hit)?;
        self.stats.hits_found.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
