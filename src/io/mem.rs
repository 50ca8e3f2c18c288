//! In-memory table driver.
//!
//! Holds named tables (locator -> dataset -> tensor) behind a shared
//! `RwLock`. Used by the test-suite fixtures and for pipelines whose
//! working set fits in RAM; the write path makes it a valid writer
//! destination too. Clones share the same store, so a writer's output is
//! visible to later opens through any clone.

use anyhow::{anyhow, ensure, Context, Result};
use ndarray::{concatenate, ArrayD, Axis, Slice};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use super::{DataHandle, IoDriver, WriteHandle};

/// One immutable in-memory table: ordered datasets with a shared row count.
#[derive(Debug)]
pub struct MemTable {
    datasets: Vec<(String, ArrayD<f32>)>,
}

impl MemTable {
    fn dataset(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.datasets
            .iter()
            .find(|(dataset_name, _)| dataset_name == name)
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| anyhow!("dataset '{}' not found in table", name))
    }
}

impl DataHandle for MemTable {
    fn dataset_len(&self, dataset: &str) -> Result<usize> {
        Ok(self.dataset(dataset)?.shape()[0])
    }

    fn row_shape(&self, dataset: &str) -> Result<Vec<usize>> {
        Ok(self.dataset(dataset)?.shape()[1..].to_vec())
    }

    fn read_rows(&self, dataset: &str, rows: Range<usize>) -> Result<ArrayD<f32>> {
        let tensor = self.dataset(dataset)?;
        ensure!(
            rows.end <= tensor.shape()[0],
            "row range {}..{} out of bounds for dataset '{}' with {} rows",
            rows.start,
            rows.end,
            dataset,
            tensor.shape()[0]
        );
        Ok(tensor.slice_axis(Axis(0), Slice::from(rows)).to_owned())
    }

    fn gather_rows(&self, dataset: &str, indices: &[usize]) -> Result<ArrayD<f32>> {
        let tensor = self.dataset(dataset)?;
        let rows = tensor.shape()[0];
        if let Some(&bad) = indices.iter().find(|&&index| index >= rows) {
            return Err(anyhow!(
                "row index {} out of bounds for dataset '{}' with {} rows",
                bad,
                dataset,
                rows
            ));
        }
        Ok(tensor.select(Axis(0), indices))
    }
}

type TableStore = Arc<RwLock<HashMap<String, Arc<MemTable>>>>;

/// Process-local table store.
///
/// Construct once, insert fixture tables, register a clone under the `mem`
/// protocol.
#[derive(Clone)]
pub struct MemDriver {
    tables: TableStore,
}

impl MemDriver {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Inserts (or replaces) a table under a locator.
    pub fn insert_table(&self, locator: &str, datasets: Vec<(String, ArrayD<f32>)>) {
        self.tables
            .write()
            .expect("mem table store poisoned")
            .insert(locator.to_string(), Arc::new(MemTable { datasets }));
    }

    /// Looks up a stored table (primarily for asserting writer output).
    pub fn table(&self, locator: &str) -> Option<Arc<MemTable>> {
        self.tables
            .read()
            .expect("mem table store poisoned")
            .get(locator)
            .cloned()
    }

    /// Row count of a stored table's dataset.
    pub fn stored_rows(&self, locator: &str, dataset: &str) -> Result<usize> {
        let table = self
            .table(locator)
            .ok_or_else(|| anyhow!("no table stored under '{}'", locator))?;
        table.dataset_len(dataset)
    }
}

impl Default for MemDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDriver for MemDriver {
    fn open(&self, locator: &str) -> Result<Arc<dyn DataHandle>> {
        let table = self
            .table(locator)
            .ok_or_else(|| anyhow!("no table stored under '{}'", locator))?;
        Ok(table as Arc<dyn DataHandle>)
    }

    fn create(&self, locator: &str) -> Result<Box<dyn WriteHandle>> {
        Ok(Box::new(MemWriter {
            tables: self.tables.clone(),
            locator: locator.to_string(),
            pending: Vec::new(),
        }))
    }
}

/// Accumulates appended rows and publishes the table on `finish`.
struct MemWriter {
    tables: TableStore,
    locator: String,
    pending: Vec<(String, Vec<ArrayD<f32>>)>,
}

impl WriteHandle for MemWriter {
    fn append(&mut self, dataset: &str, rows: &ArrayD<f32>) -> Result<()> {
        match self.pending.iter_mut().find(|(name, _)| name == dataset) {
            Some((_, blocks)) => {
                ensure!(
                    blocks[0].shape()[1..] == rows.shape()[1..],
                    "appended rows for '{}' have shape {:?}, expected {:?}",
                    dataset,
                    &rows.shape()[1..],
                    &blocks[0].shape()[1..]
                );
                blocks.push(rows.clone());
            }
            None => self.pending.push((dataset.to_string(), vec![rows.clone()])),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut datasets = Vec::with_capacity(self.pending.len());
        for (name, blocks) in &self.pending {
            let views: Vec<_> = blocks.iter().map(|block| block.view()).collect();
            let stacked = concatenate(Axis(0), &views)
                .with_context(|| format!("concatenating appended blocks for '{}'", name))?;
            datasets.push((name.clone(), stacked));
        }
        self.tables
            .write()
            .expect("mem table store poisoned")
            .insert(self.locator.clone(), Arc::new(MemTable { datasets }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn fixture() -> MemDriver {
        let driver = MemDriver::new();
        let x = Array2::from_shape_fn((10, 3), |(row, col)| (row * 10 + col) as f32).into_dyn();
        let y = Array3::<f32>::zeros((10, 2, 2)).into_dyn();
        driver.insert_table("mem://t", vec![("x".to_string(), x), ("y".to_string(), y)]);
        driver
    }

    #[test]
    fn shapes_and_lengths() {
        let driver = fixture();
        let handle = driver.open("mem://t").unwrap();
        assert_eq!(handle.dataset_len("x").unwrap(), 10);
        assert_eq!(handle.row_shape("x").unwrap(), vec![3]);
        assert_eq!(handle.row_shape("y").unwrap(), vec![2, 2]);
        assert!(handle.dataset_len("missing").is_err());
    }

    #[test]
    fn range_read_is_a_slice() {
        let driver = fixture();
        let handle = driver.open("mem://t").unwrap();
        let block = handle.read_rows("x", 2..5).unwrap();
        assert_eq!(block.shape(), &[3, 3]);
        assert_eq!(block[[0, 0]], 20.0);
        assert!(handle.read_rows("x", 8..11).is_err());
    }

    #[test]
    fn gather_read_follows_indices() {
        let driver = fixture();
        let handle = driver.open("mem://t").unwrap();
        let block = handle.gather_rows("x", &[1, 4, 9]).unwrap();
        assert_eq!(block.shape(), &[3, 3]);
        assert_eq!(block[[2, 0]], 90.0);
        assert!(handle.gather_rows("x", &[10]).is_err());
    }

    #[test]
    fn writer_publishes_on_finish() {
        let driver = fixture();
        let mut writer = driver.create("mem://out").unwrap();
        let block = Array2::<f32>::ones((4, 3)).into_dyn();
        writer.append("x", &block).unwrap();
        writer.append("x", &block).unwrap();
        assert!(driver.table("mem://out").is_none());
        writer.finish().unwrap();
        assert_eq!(driver.stored_rows("mem://out", "x").unwrap(), 8);
    }

    #[test]
    fn clones_share_the_store() {
        let driver = fixture();
        let clone = driver.clone();
        assert!(clone.open("mem://t").is_ok());
    }
}
