//! Generators: turn ready buckets into consumer-sized batches.
//!
//! A generator is a lazy iterator that runs on the consuming thread. On
//! each step it slices the next `batch_size` rows out of the bucket it is
//! currently draining; when the bucket is exhausted its release is left
//! pending and performed just before the next blocking pull, so a bucket is
//! only returned once it has been fully drained.
//!
//! The pull itself blocks with a bounded timeout and retries until the stop
//! flag trips; `max_batches` is checked both before and after the pull so a
//! shutdown can never deadlock a generator that is mid-wait.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::batch::Batch;
use crate::comm::ReadyNotice;
use crate::config::DeliveryFn;
use crate::pool::BucketPool;
use crate::worker::ErrorSlot;

pub struct Generator {
    id: usize,
    ready_rx: Receiver<ReadyNotice>,
    pool: Arc<BucketPool>,
    batch_size: usize,
    max_batches: Option<usize>,
    delivery: Option<DeliveryFn>,
    translate_file_index: bool,
    file_index: Arc<Vec<String>>,
    exit: Arc<AtomicBool>,
    errors: ErrorSlot,
    poll: Duration,
    batch_count: usize,
    /// Bucket currently being sliced, with the next row to deliver.
    current: Option<(usize, usize)>,
    /// Fully-drained bucket whose release happens before the next pull.
    pending_release: Option<usize>,
    finished: bool,
}

impl Generator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        ready_rx: Receiver<ReadyNotice>,
        pool: Arc<BucketPool>,
        batch_size: usize,
        max_batches: Option<usize>,
        delivery: Option<DeliveryFn>,
        translate_file_index: bool,
        file_index: Arc<Vec<String>>,
        exit: Arc<AtomicBool>,
        errors: ErrorSlot,
        poll: Duration,
    ) -> Self {
        Self {
            id,
            ready_rx,
            pool,
            batch_size,
            max_batches,
            delivery,
            translate_file_index,
            file_index,
            exit,
            errors,
            poll,
            batch_count: 0,
            current: None,
            pending_release: None,
            finished: false,
        }
    }

    pub fn batches_delivered(&self) -> usize {
        self.batch_count
    }

    fn reached_max(&self) -> bool {
        self.max_batches
            .map(|max| self.batch_count >= max)
            .unwrap_or(false)
    }

    /// Finishes the stream, releasing whatever bucket is still held so the
    /// pipeline is not starved by an abandoned generator.
    fn finish(&mut self) {
        if let Some((bucket, _)) = self.current.take() {
            self.pool.release(bucket);
        }
        if let Some(bucket) = self.pending_release.take() {
            self.pool.release(bucket);
        }
        self.finished = true;
    }

    fn slice_current(&mut self) -> Result<Batch> {
        let (bucket, cursor) = self.current.expect("slice_current requires a bucket");
        let end = (cursor + self.batch_size).min(self.pool.read_size());
        let tensors = self.pool.copy_rows(bucket, cursor..end)?;

        if end == self.pool.read_size() {
            self.pending_release = Some(bucket);
            self.current = None;
        } else {
            self.current = Some((bucket, end));
        }

        let mut batch = Batch::new(tensors);
        if self.translate_file_index {
            let pairs = batch.get("file_index")?;
            let provenance = (0..pairs.shape()[0])
                .map(|row| {
                    let file_id = pairs[[row, 0]] as usize;
                    let file_row = pairs[[row, 1]] as usize;
                    let name = self
                        .file_index
                        .get(file_id)
                        .ok_or_else(|| anyhow!("file id {} out of range", file_id))?
                        .clone();
                    Ok((name, file_row))
                })
                .collect::<Result<Vec<_>>>()?;
            batch = batch.with_provenance(provenance);
        }
        if let Some(delivery) = &self.delivery {
            batch = delivery(batch);
        }

        self.batch_count += 1;
        Ok(batch)
    }

    /// Delivers the next batch, or `None` when the stream has ended.
    pub fn next_batch(&mut self) -> Option<Result<Batch>> {
        loop {
            if self.finished {
                return None;
            }
            if self.reached_max() || self.exit.load(Ordering::Acquire) {
                self.finish();
                return None;
            }
            if self.errors.is_set() {
                self.finish();
                return self
                    .errors
                    .take()
                    .map(|error| Err(anyhow!(error)));
            }

            if self.current.is_some() {
                return Some(self.slice_current());
            }

            // Release the previous bucket before waiting for the next one.
            if let Some(bucket) = self.pending_release.take() {
                debug!(generator_id = self.id, bucket, "releasing drained bucket");
                self.pool.release(bucket);
            }

            match self.ready_rx.recv_timeout(self.poll) {
                Ok(notice) => {
                    debug!(
                        generator_id = self.id,
                        bucket = notice.bucket,
                        plan_id = notice.plan_id,
                        "consuming bucket"
                    );
                    self.current = Some((notice.bucket, 0));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish();
                    return None;
                }
            }
        }
    }
}

impl Iterator for Generator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
