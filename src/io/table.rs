//! Flat-file table driver (`.tbl`).
//!
//! Layout: an 8-byte little-endian header length, a JSON header describing
//! each dataset (name, per-row shape, row count, byte offset into the
//! payload), then the payload: each dataset's rows as contiguous
//! little-endian `f32`. Row-addressable without reading the whole file,
//! which is what the range and gather paths need.

use anyhow::{anyhow, bail, ensure, Context, Result};
use bytemuck::cast_slice;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{DataHandle, IoDriver, WriteHandle};

#[derive(Debug, Serialize, Deserialize)]
struct TableHeader {
    datasets: Vec<DatasetMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetMeta {
    name: String,
    shape: Vec<usize>,
    rows: usize,
    offset: u64,
}

impl DatasetMeta {
    fn row_bytes(&self) -> u64 {
        self.shape.iter().product::<usize>() as u64 * 4
    }
}

/// Read handle over one table file.
pub struct TableHandle {
    file: Mutex<File>,
    payload_start: u64,
    datasets: HashMap<String, DatasetMeta>,
}

impl TableHandle {
    fn open(path: &str) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("opening table file '{}'", path))?;

        let mut length_bytes = [0u8; 8];
        file.read_exact(&mut length_bytes)
            .with_context(|| format!("reading header length of '{}'", path))?;
        let header_length = u64::from_le_bytes(length_bytes);

        let mut header_bytes = vec![0u8; header_length as usize];
        file.read_exact(&mut header_bytes)
            .with_context(|| format!("reading header of '{}'", path))?;
        let header: TableHeader = serde_json::from_slice(&header_bytes)
            .with_context(|| format!("parsing header of '{}'", path))?;

        let datasets = header
            .datasets
            .into_iter()
            .map(|meta| (meta.name.clone(), meta))
            .collect();

        Ok(Self {
            file: Mutex::new(file),
            payload_start: 8 + header_length,
            datasets,
        })
    }

    fn meta(&self, dataset: &str) -> Result<&DatasetMeta> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| anyhow!("dataset '{}' not found in table file", dataset))
    }

    /// Reads `n_rows` starting at `start` into a flat f32 vector.
    fn read_span(&self, meta: &DatasetMeta, start: usize, n_rows: usize) -> Result<Vec<f32>> {
        let row_bytes = meta.row_bytes();
        let mut raw = vec![0u8; row_bytes as usize * n_rows];
        {
            let mut file = self.file.lock().expect("table file lock poisoned");
            file.seek(SeekFrom::Start(
                self.payload_start + meta.offset + start as u64 * row_bytes,
            ))?;
            file.read_exact(&mut raw)?;
        }
        Ok(raw
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn block_shape(&self, meta: &DatasetMeta, n_rows: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(meta.shape.len() + 1);
        shape.push(n_rows);
        shape.extend_from_slice(&meta.shape);
        shape
    }
}

impl DataHandle for TableHandle {
    fn dataset_len(&self, dataset: &str) -> Result<usize> {
        Ok(self.meta(dataset)?.rows)
    }

    fn row_shape(&self, dataset: &str) -> Result<Vec<usize>> {
        Ok(self.meta(dataset)?.shape.clone())
    }

    fn read_rows(&self, dataset: &str, rows: Range<usize>) -> Result<ArrayD<f32>> {
        let meta = self.meta(dataset)?;
        ensure!(
            rows.end <= meta.rows,
            "row range {}..{} out of bounds for dataset '{}' with {} rows",
            rows.start,
            rows.end,
            dataset,
            meta.rows
        );
        let n_rows = rows.end - rows.start;
        let values = self.read_span(meta, rows.start, n_rows)?;
        ArrayD::from_shape_vec(IxDyn(&self.block_shape(meta, n_rows)), values)
            .context("assembling range read")
    }

    fn gather_rows(&self, dataset: &str, indices: &[usize]) -> Result<ArrayD<f32>> {
        let meta = self.meta(dataset)?;
        let mut values = Vec::with_capacity(indices.len() * meta.shape.iter().product::<usize>());
        for &index in indices {
            ensure!(
                index < meta.rows,
                "row index {} out of bounds for dataset '{}' with {} rows",
                index,
                dataset,
                meta.rows
            );
            values.extend(self.read_span(meta, index, 1)?);
        }
        ArrayD::from_shape_vec(IxDyn(&self.block_shape(meta, indices.len())), values)
            .context("assembling gather read")
    }
}

/// Driver for `.tbl` files.
pub struct TableDriver;

impl IoDriver for TableDriver {
    fn open(&self, locator: &str) -> Result<Arc<dyn DataHandle>> {
        Ok(Arc::new(TableHandle::open(locator)?))
    }

    fn create(&self, locator: &str) -> Result<Box<dyn WriteHandle>> {
        Ok(Box::new(TableWriter {
            path: PathBuf::from(locator),
            pending: Vec::new(),
            finished: false,
        }))
    }
}

/// Buffers appended rows and writes header + payload on `finish`.
///
/// The header carries final row counts, so the file cannot be written
/// incrementally; append accumulates and `finish` flushes once.
pub struct TableWriter {
    path: PathBuf,
    pending: Vec<(String, Vec<usize>, Vec<f32>, usize)>,
    finished: bool,
}

impl WriteHandle for TableWriter {
    fn append(&mut self, dataset: &str, rows: &ArrayD<f32>) -> Result<()> {
        let row_shape = rows.shape()[1..].to_vec();
        let n_rows = rows.shape()[0];
        let flat = rows
            .as_standard_layout()
            .iter()
            .copied()
            .collect::<Vec<f32>>();

        match self.pending.iter_mut().find(|(name, ..)| name == dataset) {
            Some((_, shape, values, rows_so_far)) => {
                ensure!(
                    *shape == row_shape,
                    "appended rows for '{}' have row shape {:?}, expected {:?}",
                    dataset,
                    row_shape,
                    shape
                );
                values.extend(flat);
                *rows_so_far += n_rows;
            }
            None => self
                .pending
                .push((dataset.to_string(), row_shape, flat, n_rows)),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            bail!("table writer already finished");
        }

        let mut datasets = Vec::with_capacity(self.pending.len());
        let mut offset = 0u64;
        for (name, shape, values, rows) in &self.pending {
            datasets.push(DatasetMeta {
                name: name.clone(),
                shape: shape.clone(),
                rows: *rows,
                offset,
            });
            offset += values.len() as u64 * 4;
        }

        let header_bytes = serde_json::to_vec(&TableHeader { datasets })?;
        let mut file = File::create(&self.path)
            .with_context(|| format!("creating table file '{}'", self.path.display()))?;
        file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        for (_, _, values, _) in &self.pending {
            file.write_all(cast_slice(values))?;
        }
        file.flush()?;
        self.finished = true;
        Ok(())
    }
}

/// Convenience for fixtures: writes a complete table file in one call.
pub fn write_table(path: &str, datasets: &[(String, ArrayD<f32>)]) -> Result<()> {
    let mut writer = TableDriver.create(path)?;
    for (name, tensor) in datasets {
        writer.append(name, tensor)?;
    }
    writer.finish()
}
