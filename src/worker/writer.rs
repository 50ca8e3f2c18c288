//! Writers: persist a generator's batch stream.
//!
//! Each configured writer owns a dedicated generator (allocated past the
//! consumer-facing ones), applies an optional pre-write transform, and
//! appends every tensor of every batch to growable storage through the
//! driver's put path. The stream ends at `max_batches`, data exhaustion or
//! shutdown, after which the handle is finalized.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use crate::config::PreWriteFn;
use crate::generator::Generator;
use crate::io::DriverRegistry;
use crate::worker::StopToken;

pub(crate) struct Writer {
    pub id: usize,
    pub generator: Generator,
    pub destination: String,
    pub pre_write: Option<PreWriteFn>,
    pub registry: Arc<DriverRegistry>,
}

impl Writer {
    pub(crate) fn run(mut self, mut stop: StopToken) -> Result<()> {
        let mut handle = self
            .registry
            .create(&self.destination)
            .with_context(|| format!("writer {} opening '{}'", self.id, self.destination))?;
        debug!(writer_id = self.id, destination = %self.destination, "writer starting");

        let mut written = 0usize;
        while !stop.should_stop() {
            match self.generator.next_batch() {
                Some(Ok(batch)) => {
                    let batch = match &self.pre_write {
                        Some(function) => function(batch),
                        None => batch,
                    };
                    for (name, tensor) in batch.tensors() {
                        handle.append(name, tensor).with_context(|| {
                            format!("writer {} appending to '{}'", self.id, self.destination)
                        })?;
                    }
                    written += 1;
                }
                Some(Err(error)) => return Err(error),
                None => break,
            }
        }

        handle
            .finish()
            .with_context(|| format!("writer {} finalizing '{}'", self.id, self.destination))?;
        debug!(writer_id = self.id, batches = written, "writer exiting");
        Ok(())
    }
}
