//! Pipeline configuration.
//!
//! `ProviderConfig` carries every recognized option; construction goes
//! through the builder and validation happens once in
//! [`BatchProvider::new`](crate::provider::BatchProvider::new), before any
//! worker starts.
//!
//! ```ignore
//! let config = ProviderConfig::builder()
//!     .batch_size(32)
//!     .read_multiplier(4)
//!     .n_readers(4)
//!     .shuffle(true)
//!     .make_one_hot(true)
//!     .build();
//! ```

use anyhow::{ensure, Result};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::Batch;
use crate::io::DataHandle;

/// Produces the candidate row set of a file for one class.
pub type FilterFn = Arc<dyn Fn(&dyn DataHandle, &[String]) -> Result<Vec<usize>> + Send + Sync>;

/// Rewrites the assembled tensor set before it is stored in a bucket.
pub type ProcessFn =
    Arc<dyn Fn(Vec<(String, ArrayD<f32>)>) -> Result<Vec<(String, ArrayD<f32>)>> + Send + Sync>;

/// Last-minute transform applied to each delivered batch.
pub type DeliveryFn = Arc<dyn Fn(Batch) -> Batch + Send + Sync>;

/// Transform applied by a writer before appending a batch.
pub type PreWriteFn = Arc<dyn Fn(Batch) -> Batch + Send + Sync>;

/// A filter function, either shared by all classes or given per class.
#[derive(Clone)]
pub enum FilterSpec {
    Global(FilterFn),
    PerClass(HashMap<String, FilterFn>),
}

impl FilterSpec {
    pub fn for_class(&self, class_name: &str) -> Option<&FilterFn> {
        match self {
            FilterSpec::Global(function) => Some(function),
            FilterSpec::PerClass(map) => map.get(class_name),
        }
    }
}

/// One writer destination.
#[derive(Clone)]
pub struct WriterConfig {
    pub destination: String,
    pub pre_write_function: Option<PreWriteFn>,
}

#[derive(Clone)]
pub struct ProviderConfig {
    /// Rows per delivered batch.
    pub batch_size: usize,
    /// One reader assembles `batch_size * read_multiplier` rows per bucket.
    pub read_multiplier: usize,
    pub n_readers: usize,
    /// Independent consumers of the batch stream. More than one activates
    /// the watcher fan-out path.
    pub n_generators: usize,
    pub n_buckets: usize,
    /// Whether a class's file cursor restarts after exhausting its files
    /// (infinite epoch) or the plan stream ends (finite epoch).
    pub wrap_examples: bool,
    /// Per-read row shuffle under one shared permutation.
    pub shuffle: bool,
    pub make_class_index: bool,
    pub make_one_hot: bool,
    pub make_file_index: bool,
    /// Translate `(file_id, row)` pairs into file names on delivery.
    /// Requires `make_file_index`.
    pub translate_file_index: bool,
    pub filter_function: Option<FilterSpec>,
    pub process_function: Option<ProcessFn>,
    pub delivery_function: Option<DeliveryFn>,
    /// Explicit class -> index override; must cover every class.
    pub class_index_map: Option<HashMap<String, usize>>,
    /// Cap on backoff sleeps for workers blocked on a full channel or an
    /// exhausted bucket pool.
    pub sleep_duration: Duration,
    /// Polling interval for bounded blocking receives.
    pub poll_interval: Duration,
    /// Per-generator delivery cap; `None` streams forever.
    pub max_batches: Option<usize>,
    /// Plans per epoch before the filler resets class state to its
    /// snapshot; `None` disables epoch resets.
    pub read_batches_per_epoch: Option<usize>,
    /// Seed for the filler's draws and the readers' shuffles. `None` seeds
    /// from entropy.
    pub seed: Option<u64>,
    /// Data channel depth = `queue_multiplier * n_readers`.
    pub queue_multiplier: usize,
    /// Let the driver registry share handles across opens.
    pub cache_handles: bool,
    /// How long `start()` waits for the filler's allocation report.
    pub malloc_timeout: Duration,
    pub writer_config: Vec<WriterConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            read_multiplier: 1,
            n_readers: 4,
            n_generators: 1,
            n_buckets: 10,
            wrap_examples: true,
            shuffle: true,
            make_class_index: false,
            make_one_hot: false,
            make_file_index: false,
            translate_file_index: false,
            filter_function: None,
            process_function: None,
            delivery_function: None,
            class_index_map: None,
            sleep_duration: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            max_batches: None,
            read_batches_per_epoch: None,
            seed: None,
            queue_multiplier: 1,
            cache_handles: true,
            malloc_timeout: Duration::from_secs(30),
            writer_config: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }

    /// Rows a single reader assembles into one bucket.
    pub fn read_size(&self) -> usize {
        self.batch_size * self.read_multiplier
    }

    /// Generators plus writer-backing generators.
    pub fn n_consumers(&self) -> usize {
        self.n_generators + self.writer_config.len()
    }

    /// Configuration errors are fatal before any worker starts.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.read_multiplier > 0, "read_multiplier must be > 0");
        ensure!(self.n_readers > 0, "n_readers must be > 0");
        ensure!(self.n_generators > 0, "n_generators must be > 0");
        ensure!(self.n_buckets > 0, "n_buckets must be > 0");
        ensure!(self.queue_multiplier > 0, "queue_multiplier must be > 0");
        ensure!(
            !self.translate_file_index || self.make_file_index,
            "translate_file_index requires make_file_index"
        );
        if let Some(per_epoch) = self.read_batches_per_epoch {
            ensure!(per_epoch > 0, "read_batches_per_epoch must be > 0 when set");
        }
        Ok(())
    }
}

/// Builder with method chaining.
#[derive(Default)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl ProviderConfigBuilder {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn read_multiplier(mut self, read_multiplier: usize) -> Self {
        self.config.read_multiplier = read_multiplier;
        self
    }

    pub fn n_readers(mut self, n_readers: usize) -> Self {
        self.config.n_readers = n_readers;
        self
    }

    pub fn n_generators(mut self, n_generators: usize) -> Self {
        self.config.n_generators = n_generators;
        self
    }

    pub fn n_buckets(mut self, n_buckets: usize) -> Self {
        self.config.n_buckets = n_buckets;
        self
    }

    pub fn wrap_examples(mut self, wrap: bool) -> Self {
        self.config.wrap_examples = wrap;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    pub fn make_class_index(mut self, make: bool) -> Self {
        self.config.make_class_index = make;
        self
    }

    pub fn make_one_hot(mut self, make: bool) -> Self {
        self.config.make_one_hot = make;
        self
    }

    pub fn make_file_index(mut self, make: bool) -> Self {
        self.config.make_file_index = make;
        self
    }

    pub fn translate_file_index(mut self, translate: bool) -> Self {
        self.config.translate_file_index = translate;
        self
    }

    pub fn filter_function(mut self, filter: FilterSpec) -> Self {
        self.config.filter_function = Some(filter);
        self
    }

    pub fn process_function(mut self, process: ProcessFn) -> Self {
        self.config.process_function = Some(process);
        self
    }

    pub fn delivery_function(mut self, delivery: DeliveryFn) -> Self {
        self.config.delivery_function = Some(delivery);
        self
    }

    pub fn class_index_map(mut self, map: HashMap<String, usize>) -> Self {
        self.config.class_index_map = Some(map);
        self
    }

    pub fn sleep_duration(mut self, sleep: Duration) -> Self {
        self.config.sleep_duration = sleep;
        self
    }

    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.config.poll_interval = poll;
        self
    }

    pub fn max_batches(mut self, max_batches: usize) -> Self {
        self.config.max_batches = Some(max_batches);
        self
    }

    pub fn read_batches_per_epoch(mut self, per_epoch: usize) -> Self {
        self.config.read_batches_per_epoch = Some(per_epoch);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn queue_multiplier(mut self, multiplier: usize) -> Self {
        self.config.queue_multiplier = multiplier;
        self
    }

    pub fn cache_handles(mut self, cache: bool) -> Self {
        self.config.cache_handles = cache;
        self
    }

    pub fn malloc_timeout(mut self, timeout: Duration) -> Self {
        self.config.malloc_timeout = timeout;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.config.writer_config.push(writer);
        self
    }

    pub fn build(self) -> ProviderConfig {
        self.config
    }
}
