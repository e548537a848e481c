//! Producers: the threads that pull scalars from a key source, derive
//! public keys and push batches into the consumer queue.
//!
//! A producer owns its derivation back-end exclusively and reads the
//! shared stop flag at every batch boundary. Batches that fail to derive
//! are dropped, never retried; device errors shut the affected producer
//! down while the rest of the pipeline keeps running.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::BistPolicy;
use crate::consumer::BatchQueue;
use crate::engine::{run_self_test, Batch, CpuBackend, DeriveBackend};
use crate::error::{FinderError, Result};
use crate::keysource::KeySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProducerState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    NotRunning = 3,
}

/// Lock-free state cell shared between a producer thread and the
/// coordinator.
pub struct ProducerStateCell(AtomicU8);

impl ProducerStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ProducerState::Uninitialized as u8))
    }

    pub fn set(&self, state: ProducerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> ProducerState {
        match self.0.load(Ordering::SeqCst) {
            0 => ProducerState::Uninitialized,
            1 => ProducerState::Initialized,
            2 => ProducerState::Running,
            _ => ProducerState::NotRunning,
        }
    }
}

impl Default for ProducerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Producer: Send {
    fn name(&self) -> &str;

    fn state_cell(&self) -> Arc<ProducerStateCell>;

    /// How a self-test failure during init is handled.
    fn bist_policy(&self) -> BistPolicy {
        BistPolicy::DropProducer
    }

    /// One-time setup; a device back-end runs its self-test here.
    fn init(&mut self) -> Result<()>;

    /// Produces batches until the stop flag is set, the source runs dry or
    /// the back-end fails terminally. Runs on the producer's own thread.
    fn produce(&mut self);
}

/// Derives dense grids `base .. base + 2^bits - 1` with a CPU or GPU
/// back-end.
pub struct GridProducer {
    name: String,
    source: Arc<dyn KeySource>,
    backend: Box<dyn DeriveBackend>,
    grid_bits: u32,
    run_once: bool,
    needs_self_test: bool,
    bist_policy: BistPolicy,
    queue: BatchQueue,
    stop: Arc<AtomicBool>,
    state: Arc<ProducerStateCell>,
    batches_produced: AtomicU64,
}

impl GridProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        source: Arc<dyn KeySource>,
        backend: Box<dyn DeriveBackend>,
        grid_bits: u32,
        run_once: bool,
        needs_self_test: bool,
        bist_policy: BistPolicy,
        queue: BatchQueue,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            source,
            backend,
            grid_bits,
            run_once,
            needs_self_test,
            bist_policy,
            queue,
            stop,
            state: Arc::new(ProducerStateCell::new()),
            batches_produced: AtomicU64::new(0),
        }
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let base = match self.source.next_base()? {
            Some(base) => base,
            None => return Ok(None),
        };
        let keys = self.backend.derive_grid(base, self.grid_bits)?;
        Ok(Some(Batch::from_grid(base, self.grid_bits, keys)))
    }
}

impl Producer for GridProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_cell(&self) -> Arc<ProducerStateCell> {
        Arc::clone(&self.state)
    }

    fn bist_policy(&self) -> BistPolicy {
        self.bist_policy
    }

    fn init(&mut self) -> Result<()> {
        if self.needs_self_test {
            let mut reference = CpuBackend::new();
            run_self_test(&mut reference, self.backend.as_mut())?;
        }
        self.state.set(ProducerState::Initialized);
        Ok(())
    }

    fn produce(&mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            match self.next_batch() {
                Ok(Some(batch)) => {
                    if !self.queue.push(batch) {
                        break;
                    }
                    self.batches_produced.fetch_add(1, Ordering::Relaxed);
                    if self.run_once {
                        info!("producer '{}' ran once, stopping", self.name);
                        break;
                    }
                }
                Ok(None) => {
                    info!("producer '{}': key source exhausted", self.name);
                    break;
                }
                Err(e @ FinderError::Gpu(_)) => {
                    error!("producer '{}' lost its device, shutting down: {e}", self.name);
                    break;
                }
                Err(e) => {
                    // the batch is dropped, never retried
                    warn!("producer '{}' dropped a batch: {e}", self.name);
                }
            }
        }
    }
}

/// Pulls blocks of replayed scalars and derives each key individually.
/// An exhausted source is a clean termination, distinct from cancellation.
pub struct ReplayProducer {
    name: String,
    source: Arc<dyn KeySource>,
    batch_size: usize,
    queue: BatchQueue,
    stop: Arc<AtomicBool>,
    state: Arc<ProducerStateCell>,
}

impl ReplayProducer {
    pub fn new(
        name: String,
        source: Arc<dyn KeySource>,
        batch_size: usize,
        queue: BatchQueue,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            source,
            batch_size,
            queue,
            stop,
            state: Arc::new(ProducerStateCell::new()),
        }
    }
}

impl Producer for ReplayProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_cell(&self) -> Arc<ProducerStateCell> {
        Arc::clone(&self.state)
    }

    fn init(&mut self) -> Result<()> {
        self.state.set(ProducerState::Initialized);
        Ok(())
    }

    fn produce(&mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            let scalars = match self.source.next_batch(self.batch_size) {
                Ok(scalars) => scalars,
                Err(e) => {
                    error!("producer '{}' failed to read secrets: {e}", self.name);
                    break;
                }
            };
            if scalars.is_empty() {
                let errors = self.source.read_errors();
                info!(
                    "producer '{}' finished replay ({} unparsable lines)",
                    self.name, errors
                );
                break;
            }

            let mut keys = Vec::with_capacity(scalars.len());
            let mut derived = Ok(());
            for scalar in &scalars {
                match CpuBackend::derive_single(scalar) {
                    Ok(key) => keys.push(key),
                    Err(e) => {
                        derived = Err(e);
                        break;
                    }
                }
            }
            match derived {
                Ok(()) => {
                    if !self.queue.push(Batch::from_list(scalars, keys)) {
                        break;
                    }
                }
                Err(e) => warn!("producer '{}' dropped a batch: {e}", self.name),
            }
        }
    }
}

/// Moves an initialized producer onto its own thread and tracks the
/// `Running -> NotRunning` transition.
pub struct ProducerHandle {
    pub name: String,
    pub state: Arc<ProducerStateCell>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ProducerHandle {
    pub fn spawn(mut producer: Box<dyn Producer>) -> Self {
        let name = producer.name().to_string();
        let state = producer.state_cell();
        let thread_state = producer.state_cell();
        let join = std::thread::Builder::new()
            .name(format!("producer-{name}"))
            .spawn(move || {
                thread_state.set(ProducerState::Running);
                producer.produce();
                thread_state.set(ProducerState::NotRunning);
            })
            .expect("spawning a producer thread");
        Self {
            name,
            state,
            join: Some(join),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.get() == ProducerState::NotRunning
    }

    /// Joins the thread if it already wound down; returns whether it did.
    pub fn try_join(&mut self) -> bool {
        if self.is_finished() {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
            true
        } else {
            false
        }
    }

    /// Detaches a producer that exceeded the shutdown deadline.
    pub fn detach(&mut self) {
        self.join.take();
    }
}
