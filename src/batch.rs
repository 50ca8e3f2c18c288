//! The `Batch` type delivered to consumers.
//!
//! A batch is an ordered tuple of named, fixed-shape tensors: one per
//! configured dataset, plus any derived tensors the pipeline was asked to
//! produce (`class_index`, `one_hot`, `file_index`). Every tensor has
//! `batch_size` rows and rows stay aligned across tensors: row `i` of
//! every tensor describes the same example.

use anyhow::{anyhow, Result};
use ndarray::ArrayD;

/// A consumer-sized batch of aligned tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    tensors: Vec<(String, ArrayD<f32>)>,
    /// `(file_id, row)` pairs translated to file names, present when the
    /// pipeline was configured with `make_file_index` + `translate_file_index`.
    provenance: Option<Vec<(String, usize)>>,
}

impl Batch {
    pub fn new(tensors: Vec<(String, ArrayD<f32>)>) -> Self {
        Self {
            tensors,
            provenance: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Vec<(String, usize)>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Number of rows in the batch.
    pub fn batch_size(&self) -> Result<usize> {
        self.tensors
            .first()
            .map(|(_, tensor)| tensor.shape()[0])
            .ok_or_else(|| anyhow!("empty batch"))
    }

    /// Returns the tensor for a dataset name.
    pub fn get(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.tensors
            .iter()
            .find(|(tensor_name, _)| tensor_name == name)
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| anyhow!("dataset '{}' not found in batch", name))
    }

    /// Iterates over tensor names in delivery order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|(name, _)| name.as_str())
    }

    pub fn tensors(&self) -> &[(String, ArrayD<f32>)] {
        &self.tensors
    }

    pub fn into_tensors(self) -> Vec<(String, ArrayD<f32>)> {
        self.tensors
    }

    pub fn provenance(&self) -> Option<&[(String, usize)]> {
        self.provenance.as_deref()
    }
}
