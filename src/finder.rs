//! The coordinator: wires key sources, consumer and producers together,
//! enforces the startup order and supervises shutdown.
//!
//! Startup order is key sources, then the consumer, then producers
//! (configure, init, start). The coordinator owns every component;
//! producers and workers only hold handles to the shared queue, the stop
//! flag and the read-only store, keeping the ownership graph one-way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{BistPolicy, FindConfig};
use crate::consumer::{BatchQueue, Consumer, FileSink};
use crate::engine::{check_grid_bits, CpuBackend, GpuBackend};
use crate::error::{FinderError, Result};
use crate::keysource::{build_key_sources, KeySource};
use crate::producer::{GridProducer, Producer, ProducerHandle, ReplayProducer};
use crate::store::AddressStore;

const SUPERVISE_TICK: Duration = Duration::from_millis(100);

pub struct Finder {
    config: FindConfig,
    stop: Arc<AtomicBool>,
    workers: usize,
    queue: BatchQueue,
    key_sources: HashMap<String, Arc<dyn KeySource>>,
    store: Option<Arc<AddressStore>>,
    consumer: Option<Arc<Consumer>>,
    worker_handles: Vec<JoinHandle<()>>,
    producers: Vec<Box<dyn Producer>>,
    running: Vec<ProducerHandle>,
}

impl Finder {
    pub fn new(config: FindConfig, stop: Arc<AtomicBool>) -> Self {
        let workers = num_cpus::get_physical().max(1);
        let queue =
            BatchQueue::with_capacity(workers * config.consumer.queue_depth_per_worker.max(1));
        Self {
            config,
            stop,
            workers,
            queue,
            key_sources: HashMap::new(),
            store: None,
            consumer: None,
            worker_handles: Vec::new(),
            producers: Vec::new(),
            running: Vec::new(),
        }
    }

    /// First stage: the id registry. Empty and duplicate ids are distinct
    /// configuration errors; nothing else is brought up when they occur.
    pub fn start_key_sources(&mut self) -> Result<()> {
        self.key_sources = build_key_sources(&self.config.key_sources)?;
        info!("{} key sources registered", self.key_sources.len());
        Ok(())
    }

    /// Second stage: map the store and start the worker pool.
    pub fn start_consumer(&mut self) -> Result<()> {
        let store = Arc::new(AddressStore::open(&self.config.consumer.store_path)?);
        let sink = Arc::new(FileSink::open(&self.config.consumer.hits_file)?);
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&store),
            sink,
            self.config.consumer.vanity_pattern.as_deref(),
            Arc::clone(&self.stop),
        )?);
        self.worker_handles = Consumer::spawn_workers(&consumer, &self.queue, self.workers);
        self.store = Some(store);
        self.consumer = Some(consumer);
        Ok(())
    }

    /// Third stage, part one: validate and build every producer. No
    /// partial pipeline survives a configuration error.
    pub fn configure_producers(&mut self) -> Result<()> {
        let mut producers: Vec<Box<dyn Producer>> = Vec::new();

        for (index, cfg) in self.config.cpu_producers.iter().enumerate() {
            check_grid_bits(cfg.grid_bits)?;
            let source = self.lookup_source(&cfg.key_source_id)?;
            producers.push(Box::new(GridProducer::new(
                format!("cpu-{index}"),
                source,
                Box::new(CpuBackend::new()),
                cfg.grid_bits,
                cfg.run_once,
                false,
                BistPolicy::DropProducer,
                self.queue.clone(),
                Arc::clone(&self.stop),
            )));
        }

        for (index, cfg) in self.config.gpu_producers.iter().enumerate() {
            check_grid_bits(cfg.grid_bits)?;
            let source = self.lookup_source(&cfg.key_source_id)?;
            match GpuBackend::new(cfg.device_index, cfg.grid_bits) {
                Ok(backend) => {
                    producers.push(Box::new(GridProducer::new(
                        format!("gpu-{index}"),
                        source,
                        Box::new(backend),
                        cfg.grid_bits,
                        cfg.run_once,
                        true,
                        cfg.bist_policy,
                        self.queue.clone(),
                        Arc::clone(&self.stop),
                    )));
                }
                Err(e) => match cfg.bist_policy {
                    BistPolicy::DropProducer => {
                        warn!("dropping GPU producer {index}: {e}");
                    }
                    BistPolicy::FailProcess => return Err(e),
                },
            }
        }

        for (index, cfg) in self.config.replay_producers.iter().enumerate() {
            let source = self.lookup_source(&cfg.key_source_id)?;
            producers.push(Box::new(ReplayProducer::new(
                format!("replay-{index}"),
                source,
                cfg.batch_size.max(1),
                self.queue.clone(),
                Arc::clone(&self.stop),
            )));
        }

        self.producers = producers;
        info!("{} producers configured", self.producers.len());
        Ok(())
    }

    /// Third stage, part two: initialization, including the GPU self-test.
    /// A failed self-test removes the producer or aborts, per its policy.
    pub fn init_producers(&mut self) -> Result<()> {
        let mut initialized = Vec::new();
        for mut producer in self.producers.drain(..) {
            match producer.init() {
                Ok(()) => initialized.push(producer),
                Err(e) => match producer.bist_policy() {
                    BistPolicy::DropProducer => {
                        warn!("producer '{}' failed init, dropped: {e}", producer.name());
                    }
                    BistPolicy::FailProcess => return Err(e),
                },
            }
        }
        self.producers = initialized;
        Ok(())
    }

    /// Third stage, part three: move every producer onto its own thread.
    pub fn start_producers(&mut self) {
        for producer in self.producers.drain(..) {
            self.running.push(ProducerHandle::spawn(producer));
        }
        info!("{} producers running", self.running.len());
    }

    pub fn producer_states(&self) -> Vec<(String, crate::producer::ProducerState)> {
        self.running
            .iter()
            .map(|handle| (handle.name.clone(), handle.state.get()))
            .collect()
    }

    pub fn producers_running(&self) -> bool {
        self.running.iter().any(|handle| !handle.is_finished())
    }

    /// Sets the shared stop flag and interrupts file-backed sources.
    /// Idempotent; calling it again has no additional effect.
    pub fn interrupt(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for source in self.key_sources.values() {
            source.interrupt();
        }
    }

    /// Lets in-flight batches drain, waits up to the configured deadline
    /// for producer threads, then detaches the stragglers. Exceeding the
    /// deadline is logged but is not an error.
    pub fn shutdown_and_await_termination(&mut self) {
        self.interrupt();

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        loop {
            let mut pending = 0usize;
            for handle in self.running.iter_mut() {
                if !handle.try_join() {
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("{pending} producers exceeded the shutdown deadline, detaching");
                for handle in self.running.iter_mut() {
                    handle.detach();
                }
                break;
            }
            std::thread::sleep(SUPERVISE_TICK);
        }
        self.running.clear();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(consumer) = self.consumer.take() {
            let keys = consumer.stats.keys_checked.load(Ordering::Relaxed);
            let hits = consumer.stats.hits_found.load(Ordering::Relaxed);
            info!("consumer done: {keys} keys checked, {hits} hits");
        }
        if let Some(store) = self.store.take() {
            if let Ok(store) = Arc::try_unwrap(store) {
                store.close();
            }
        }
    }

    /// The full lifecycle: bring everything up in order, supervise until
    /// interrupted or all producers finish, then wind down.
    pub fn run(&mut self) -> Result<()> {
        self.start_key_sources()?;
        self.start_consumer()?;
        self.configure_producers()?;
        self.init_producers()?;
        self.start_producers();

        while !self.stop.load(Ordering::Relaxed) && self.producers_running() {
            std::thread::sleep(SUPERVISE_TICK);
        }
        self.shutdown_and_await_termination();
        Ok(())
    }

    fn lookup_source(&self, id: &str) -> Result<Arc<dyn KeySource>> {
        self.key_sources
            .get(id)
            .cloned()
            .ok_or_else(|| FinderError::KeySourceIdUnknown(id.to_string()))
    }
}
