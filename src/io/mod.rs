//! Storage driver contract and protocol registry.
//!
//! Workers never touch a file format directly. Every access goes through an
//! [`IoDriver`] resolved from the [`DriverRegistry`] by the locator's
//! protocol string (`mem://...` style scheme, or the file extension when no
//! scheme is present). The registry is built once at startup; resolution is
//! a map lookup, never runtime type inspection.
//!
//! A [`DataHandle`] exposes the two row-access paths the pipeline needs:
//! `read_rows` for a contiguous range and `gather_rows` for an explicit
//! index list. They are separate methods on purpose: drivers can implement
//! a range as one sequential read while a gather may seek per row.

pub mod mem;
pub mod table;

pub use mem::MemDriver;
pub use table::TableDriver;

use anyhow::{anyhow, Result};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// Read access to one opened resource.
pub trait DataHandle: Send + Sync {
    /// Number of examples the dataset holds.
    fn dataset_len(&self, dataset: &str) -> Result<usize>;

    /// Shape of a single example (without the leading row axis).
    fn row_shape(&self, dataset: &str) -> Result<Vec<usize>>;

    /// Reads a contiguous row range. Result shape is `[rows.len(), ..row_shape]`.
    fn read_rows(&self, dataset: &str, rows: Range<usize>) -> Result<ArrayD<f32>>;

    /// Gathers explicit rows. Result shape is `[indices.len(), ..row_shape]`.
    fn gather_rows(&self, dataset: &str, indices: &[usize]) -> Result<ArrayD<f32>>;
}

/// Append access to one created resource.
pub trait WriteHandle: Send {
    /// Appends a block of rows to a (growable) dataset.
    fn append(&mut self, dataset: &str, rows: &ArrayD<f32>) -> Result<()>;

    /// Flushes everything written so far.
    fn finish(&mut self) -> Result<()>;
}

/// One storage protocol: get a readable handle, put a writable one.
pub trait IoDriver: Send + Sync {
    fn open(&self, locator: &str) -> Result<Arc<dyn DataHandle>>;
    fn create(&self, locator: &str) -> Result<Box<dyn WriteHandle>>;
}

/// Maps protocol strings to drivers, with optional handle caching.
///
/// The protocol of a locator is the part before `://` if present, otherwise
/// the file extension. With `cache_handles` enabled, repeated opens of the
/// same locator share one handle, useful when a worker revisits the same
/// files every plan.
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn IoDriver>>,
    cache_handles: bool,
    cache: Mutex<HashMap<String, Arc<dyn DataHandle>>>,
}

impl DriverRegistry {
    /// An empty registry. Most callers want [`DriverRegistry::with_defaults`].
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
            cache_handles: false,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the two shipped drivers: `mem` and `tbl`.
    pub fn with_defaults() -> Self {
        Self::new()
            .register("mem", Arc::new(MemDriver::new()))
            .register("tbl", Arc::new(TableDriver))
    }

    pub fn register(mut self, protocol: impl Into<String>, driver: Arc<dyn IoDriver>) -> Self {
        self.drivers.insert(protocol.into(), driver);
        self
    }

    pub fn cache_handles(mut self, cache: bool) -> Self {
        self.cache_handles = cache;
        self
    }

    /// Extracts the protocol of a locator: scheme before `://`, else the
    /// file extension.
    pub fn protocol_of(locator: &str) -> Result<&str> {
        if let Some(split) = locator.find("://") {
            return Ok(&locator[..split]);
        }
        locator
            .rsplit_once('.')
            .map(|(_, extension)| extension)
            .ok_or_else(|| anyhow!("locator '{}' has neither scheme nor extension", locator))
    }

    fn resolve(&self, locator: &str) -> Result<&Arc<dyn IoDriver>> {
        let protocol = Self::protocol_of(locator)?;
        self.drivers
            .get(protocol)
            .ok_or_else(|| anyhow!("no driver registered for protocol '{}'", protocol))
    }

    /// Opens a resource, consulting the handle cache when enabled.
    pub fn open(&self, locator: &str) -> Result<Arc<dyn DataHandle>> {
        if self.cache_handles {
            let mut cache = self.cache.lock().expect("handle cache poisoned");
            if let Some(handle) = cache.get(locator) {
                return Ok(handle.clone());
            }
            let handle = self.resolve(locator)?.open(locator)?;
            cache.insert(locator.to_string(), handle.clone());
            return Ok(handle);
        }
        self.resolve(locator)?.open(locator)
    }

    /// Creates a writable resource. Never cached.
    pub fn create(&self, locator: &str) -> Result<Box<dyn WriteHandle>> {
        self.resolve(locator)?.create(locator)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
