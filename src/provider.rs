//! The orchestrator: owns configuration, wires the fabric, pool and
//! workers, and hands out generators.
//!
//! `start()` brings the pipeline up in dependency order: spawn the filler,
//! wait for its one-time allocation report, size the bucket pool from it
//! (plus derived-tensor shapes implied by the `make_*` flags), spawn the
//! readers, the watcher when more than one consumer shares buckets, build
//! the generators, and spawn writers over their dedicated generators.
//!
//! `hard_stop()` is the single recovery surface: broadcast the stop signal,
//! drain every channel so blocked producers observe it, join workers with a
//! timeout and tolerate (log) individual join failures so one stuck worker
//! cannot prevent overall shutdown.

use anyhow::{bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

use crate::comm::CommFabric;
use crate::config::ProviderConfig;
use crate::generator::Generator;
use crate::io::DriverRegistry;
use crate::pool::{BucketPool, MallocRequest};
use crate::spec::{ClassTable, SampleSpec};
use crate::worker::filler::Filler;
use crate::worker::reader::{AssembleContext, Reader};
use crate::worker::watcher::Watcher;
use crate::worker::writer::Writer;
use crate::worker::{join_with_timeout, spawn_worker, ErrorSlot, WorkerError};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BatchProvider {
    config: ProviderConfig,
    table: ClassTable,
    registry: Arc<DriverRegistry>,
    fabric: Option<CommFabric>,
    pool: Option<Arc<BucketPool>>,
    workers: Vec<(String, JoinHandle<()>)>,
    generators: Vec<Option<Generator>>,
    errors: ErrorSlot,
    unjoined: usize,
    started: bool,
}

impl BatchProvider {
    /// Validates the configuration and folds the sample specification.
    /// Both are fatal here, before any worker starts.
    pub fn new(spec: &SampleSpec, config: ProviderConfig) -> Result<Self> {
        let registry = DriverRegistry::with_defaults();
        Self::with_registry(spec, config, registry)
    }

    /// Like [`new`](Self::new) but with a caller-built driver registry
    /// (custom protocols, shared in-memory stores).
    pub fn with_registry(
        spec: &SampleSpec,
        config: ProviderConfig,
        registry: DriverRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let table = ClassTable::from_spec(spec, config.class_index_map.as_ref())
            .context("building class table from sample specification")?;
        let registry = registry.cache_handles(config.cache_handles);
        Ok(Self {
            config,
            table,
            registry: Arc::new(registry),
            fabric: None,
            pool: None,
            workers: Vec::new(),
            generators: Vec::new(),
            errors: ErrorSlot::new(),
            unjoined: 0,
            started: false,
        })
    }

    pub fn read_size(&self) -> usize {
        self.config.read_size()
    }

    /// Spawns every worker in dependency order.
    pub fn start(&mut self) -> Result<()> {
        ensure!(!self.started, "provider already started");
        self.errors = ErrorSlot::new();
        self.unjoined = 0;

        let config = self.config.clone();
        let n_consumers = config.n_consumers();
        let watched = n_consumers > 1;
        let depth = config.queue_multiplier * config.n_readers;
        let fabric = CommFabric::new(depth, if watched { n_consumers } else { 0 });
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let sleep = config.sleep_duration;

        // Filler first: its allocation report sizes everything else.
        let filler = Filler::new(&self.table, &config, self.registry.clone(), seed);
        let plans_tx = fabric.plans_tx();
        let malloc_tx = fabric.malloc_tx();
        let filler_stop = fabric.stop_token();
        self.workers.push((
            "filler".to_string(),
            spawn_worker("filler", self.errors.clone(), move || {
                filler.run(plans_tx, malloc_tx, filler_stop, sleep)
            })?,
        ));

        let malloc_rx = fabric.malloc_rx();
        self.fabric = Some(fabric);

        let mut requests = match malloc_rx.recv_timeout(config.malloc_timeout) {
            Ok(requests) => requests,
            Err(_) => {
                self.hard_stop();
                if let Some(error) = self.errors.take() {
                    bail!(error);
                }
                bail!(
                    "filler reported no allocation shapes within {:?}",
                    config.malloc_timeout
                );
            }
        };
        if config.make_class_index {
            requests.push(MallocRequest::new("class_index", Vec::new()));
        }
        if config.make_one_hot {
            let n_classes = self
                .table
                .class_index_map
                .values()
                .max()
                .map(|&max| max + 1)
                .unwrap_or(0);
            requests.push(MallocRequest::new("one_hot", vec![n_classes]));
        }
        if config.make_file_index {
            requests.push(MallocRequest::new("file_index", vec![2]));
        }
        debug!(?requests, "allocating bucket pool");

        let pool = Arc::new(BucketPool::new(
            &requests,
            config.n_buckets,
            config.read_size(),
            n_consumers,
        ));
        self.pool = Some(pool.clone());
        let fabric = self.fabric.as_ref().expect("fabric installed above");

        let dataset_names = Arc::new(self.table.dataset_names.clone());
        let file_index = Arc::new(self.table.file_index.clone());
        let class_index_map = Arc::new(self.table.class_index_map.clone());

        for reader_id in 0..config.n_readers {
            let reader = Reader {
                id: reader_id,
                context: AssembleContext {
                    read_size: config.read_size(),
                    dataset_names: dataset_names.clone(),
                    file_index: file_index.clone(),
                    class_index_map: class_index_map.clone(),
                    registry: self.registry.clone(),
                    make_class_index: config.make_class_index,
                    make_one_hot: config.make_one_hot,
                    make_file_index: config.make_file_index,
                    process: config.process_function.clone(),
                },
                pool: pool.clone(),
                plans_rx: fabric.plans_rx(),
                ready_tx: fabric.ready_tx(),
                shuffle: config.shuffle,
                rng: StdRng::seed_from_u64(seed.wrapping_add(1 + reader_id as u64)),
                poll: config.poll_interval,
                sleep,
            };
            let stop = fabric.reader_stop_token();
            let name = format!("reader-{}", reader_id);
            self.workers.push((
                name.clone(),
                spawn_worker(&name, self.errors.clone(), move || reader.run(stop))?,
            ));
        }

        if watched {
            let watcher = Watcher {
                pool: pool.clone(),
                ready_rx: fabric.ready_rx(),
                proxies: (0..n_consumers).map(|index| fabric.proxy_tx(index)).collect(),
                poll: config.poll_interval,
            };
            let stop = fabric.stop_token();
            self.workers.push((
                "watcher".to_string(),
                spawn_worker("watcher", self.errors.clone(), move || watcher.run(stop))?,
            ));
        }

        let exit = fabric.exit_flag();
        self.generators = (0..n_consumers)
            .map(|generator_id| {
                let ready_rx = if watched {
                    fabric.proxy_rx(generator_id)
                } else {
                    fabric.ready_rx()
                };
                Some(Generator::new(
                    generator_id,
                    ready_rx,
                    pool.clone(),
                    config.batch_size,
                    config.max_batches,
                    config.delivery_function.clone(),
                    config.translate_file_index,
                    file_index.clone(),
                    exit.clone(),
                    self.errors.clone(),
                    config.poll_interval,
                ))
            })
            .collect();

        for (writer_id, writer_config) in config.writer_config.iter().enumerate() {
            let generator = self.generators[config.n_generators + writer_id]
                .take()
                .expect("writer generator slot");
            let writer = Writer {
                id: writer_id,
                generator,
                destination: writer_config.destination.clone(),
                pre_write: writer_config.pre_write_function.clone(),
                registry: self.registry.clone(),
            };
            let stop = fabric.stop_token();
            let name = format!("writer-{}", writer_id);
            self.workers.push((
                name.clone(),
                spawn_worker(&name, self.errors.clone(), move || writer.run(stop))?,
            ));
        }

        self.started = true;
        debug!(
            n_readers = config.n_readers,
            n_consumers, watched, "pipeline started"
        );
        Ok(())
    }

    /// Takes ownership of the first consumer-facing generator.
    pub fn first(&mut self) -> Option<Generator> {
        self.generator(0)
    }

    /// Takes ownership of generator `index`. Writer-backing generators are
    /// not exposed.
    pub fn generator(&mut self, index: usize) -> Option<Generator> {
        if index >= self.config.n_generators {
            return None;
        }
        self.generators.get_mut(index)?.take()
    }

    /// Stops exactly one reader (`PRUNE` on the control channel).
    pub fn stop_reader(&self) {
        if let Some(fabric) = &self.fabric {
            fabric.prune_one();
        }
    }

    /// First error any worker recorded, if one failed.
    pub fn take_error(&self) -> Option<WorkerError> {
        self.errors.take()
    }

    /// Broadcast stop, drain, join with timeout. Safe to call repeatedly.
    pub fn hard_stop(&mut self) {
        let Some(fabric) = self.fabric.as_ref() else {
            return;
        };
        debug!("hard stop requested");
        fabric.broadcast_exit();
        fabric.drain_data();

        let workers = std::mem::take(&mut self.workers);
        for (name, handle) in workers {
            // Keep draining between joins: a worker mid-send frees itself
            // against an emptied channel.
            fabric.drain_data();
            if !join_with_timeout(handle, JOIN_TIMEOUT, &name) {
                self.unjoined += 1;
            }
        }
        fabric.drain_data();
        self.generators.clear();
        self.started = false;
    }

    /// Workers whose join timed out during the last `hard_stop()`.
    pub fn unjoined_workers(&self) -> usize {
        self.unjoined
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for BatchProvider {
    fn drop(&mut self) {
        self.hard_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SampleSpecEntry;

    fn tiny_spec() -> SampleSpec {
        SampleSpec::new(vec![SampleSpecEntry::new(
            "mem://missing",
            vec!["x".into()],
            "only",
            1.0,
        )])
        .unwrap()
    }

    #[test]
    fn bad_config_is_fatal_at_construction() {
        let config = ProviderConfig::builder().batch_size(0).build();
        assert!(BatchProvider::new(&tiny_spec(), config).is_err());
    }

    #[test]
    fn incompatible_class_index_map_is_fatal_at_construction() {
        let mut map = std::collections::HashMap::new();
        map.insert("someone_else".to_string(), 0);
        let config = ProviderConfig::builder().class_index_map(map).build();
        assert!(BatchProvider::new(&tiny_spec(), config).is_err());
    }

    #[test]
    fn unreachable_data_fails_start_not_construction() {
        let config = ProviderConfig::builder()
            .batch_size(2)
            .n_readers(1)
            .malloc_timeout(Duration::from_millis(500))
            .build();
        let mut provider = BatchProvider::new(&tiny_spec(), config).unwrap();
        assert!(provider.start().is_err());
        assert!(!provider.is_started());
    }
}
