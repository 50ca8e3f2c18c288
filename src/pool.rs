//! Preallocated bucket pool and its claim/release state machine.
//!
//! A bucket holds one full read's worth of tensors: one buffer per
//! allocation request, each shaped `[read_size, ..per_example_shape]`,
//! allocated once at startup and reused for every read after that.
//!
//! State machine per bucket:
//!
//! ```text
//! Free --[reader claims]--> Claimed --[reader writes + notifies]--> ready
//!      <--[all consumers release]--------------------------------/
//! ```
//!
//! The state flag is claimed with an atomic compare-and-swap; a reader that
//! finds no free bucket backs off with a bounded exponential sleep and
//! rescans. Release is unified behind one interface parameterized by
//! `n_consumers`: with a single consumer `release()` resets the flag
//! directly, with several the watcher's `try_reclaim()` sweep resets only
//! once `ready_count == release_count == n_consumers`. Buffers are written
//! by exactly one reader and read by one-or-many generators, never
//! concurrently with a write, enforced by this state machine rather than by
//! copying.

use anyhow::{ensure, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::worker::Backoff;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;

/// One `(dataset_name, per_example_shape)` allocation request, discovered
/// once by the filler's shape-inference pass and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MallocRequest {
    pub name: String,
    pub shape: Vec<usize>,
}

impl MallocRequest {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

struct Bucket {
    state: AtomicU8,
    ready_count: AtomicUsize,
    release_count: AtomicUsize,
    buffers: Mutex<Vec<ArrayD<f32>>>,
}

/// Fixed-size pool of preallocated buckets shared by readers and generators.
pub struct BucketPool {
    buckets: Vec<Bucket>,
    names: Vec<String>,
    read_size: usize,
    n_consumers: usize,
}

impl BucketPool {
    /// Allocates `n_buckets`, each with one zeroed buffer per request.
    pub fn new(
        requests: &[MallocRequest],
        n_buckets: usize,
        read_size: usize,
        n_consumers: usize,
    ) -> Self {
        let buckets = (0..n_buckets)
            .map(|_| {
                let buffers = requests
                    .iter()
                    .map(|request| {
                        let mut shape = Vec::with_capacity(request.shape.len() + 1);
                        shape.push(read_size);
                        shape.extend_from_slice(&request.shape);
                        ArrayD::<f32>::zeros(IxDyn(&shape))
                    })
                    .collect();
                Bucket {
                    state: AtomicU8::new(FREE),
                    ready_count: AtomicUsize::new(0),
                    release_count: AtomicUsize::new(0),
                    buffers: Mutex::new(buffers),
                }
            })
            .collect();

        Self {
            buckets,
            names: requests.iter().map(|request| request.name.clone()).collect(),
            read_size,
            n_consumers,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    pub fn n_consumers(&self) -> usize {
        self.n_consumers
    }

    /// Buffer names in layout order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Claims the first free bucket via compare-and-swap.
    ///
    /// When no bucket is free the caller backs off (bounded exponential
    /// sleep) and rescans; returns `None` once `should_stop` trips, which
    /// callers treat as a benign early exit.
    pub fn claim(
        &self,
        mut should_stop: impl FnMut() -> bool,
        backoff_max: Duration,
    ) -> Option<usize> {
        let mut backoff = Backoff::new(backoff_max);
        loop {
            for (bucket_id, bucket) in self.buckets.iter().enumerate() {
                if bucket
                    .state
                    .compare_exchange(FREE, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(bucket_id);
                }
            }
            if should_stop() {
                return None;
            }
            backoff.wait();
        }
    }

    /// Copies assembled tensors into a claimed bucket's buffers.
    ///
    /// The tensor count and every shape must match the layout established
    /// at allocation; a mismatch is a fatal, non-recoverable error for the
    /// calling reader.
    pub fn store(&self, bucket_id: usize, tensors: &[(String, ArrayD<f32>)]) -> Result<()> {
        let mut buffers = self.buckets[bucket_id]
            .buffers
            .lock()
            .expect("bucket buffers poisoned");
        ensure!(
            tensors.len() == buffers.len(),
            "assembled {} tensors but bucket holds {} buffers",
            tensors.len(),
            buffers.len()
        );
        // Validate every shape before touching any buffer, so a mismatch
        // never leaves a half-written bucket.
        for (index, (name, tensor)) in tensors.iter().enumerate() {
            ensure!(
                buffers[index].shape() == tensor.shape(),
                "tensor '{}' has shape {:?} but bucket buffer expects {:?}",
                name,
                tensor.shape(),
                buffers[index].shape()
            );
        }
        for (index, (_, tensor)) in tensors.iter().enumerate() {
            buffers[index].assign(tensor);
        }
        Ok(())
    }

    /// Returns a claimed bucket to free without publishing it, used by a
    /// reader that bailed between claim and notify.
    pub fn abort_claim(&self, bucket_id: usize) {
        self.reset(bucket_id);
    }

    /// Copies a row range out of a bucket, one owned tensor per buffer.
    pub fn copy_rows(
        &self,
        bucket_id: usize,
        rows: Range<usize>,
    ) -> Result<Vec<(String, ArrayD<f32>)>> {
        ensure!(
            rows.end <= self.read_size,
            "row range {}..{} out of bounds for read_size {}",
            rows.start,
            rows.end,
            self.read_size
        );
        let buffers = self.buckets[bucket_id]
            .buffers
            .lock()
            .expect("bucket buffers poisoned");
        Ok(self
            .names
            .iter()
            .zip(buffers.iter())
            .map(|(name, buffer)| {
                (
                    name.clone(),
                    buffer
                        .slice_axis(Axis(0), Slice::from(rows.clone()))
                        .to_owned(),
                )
            })
            .collect())
    }

    /// Records one forwarded ready notification (watcher, per proxy send).
    pub fn mark_ready(&self, bucket_id: usize) {
        self.buckets[bucket_id]
            .ready_count
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Records that one consumer has fully drained the bucket.
    ///
    /// With a single consumer this resets the bucket immediately; with
    /// several, the watcher's [`try_reclaim`](Self::try_reclaim) sweep
    /// performs the reset once every consumer has released.
    pub fn release(&self, bucket_id: usize) {
        if self.n_consumers == 1 {
            self.reset(bucket_id);
        } else {
            self.buckets[bucket_id]
                .release_count
                .fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Resets the bucket to free iff every consumer has both received and
    /// released it. Only the watcher calls this in watched mode.
    pub fn try_reclaim(&self, bucket_id: usize) -> bool {
        let bucket = &self.buckets[bucket_id];
        if bucket.state.load(Ordering::Acquire) != CLAIMED {
            return false;
        }
        if bucket.ready_count.load(Ordering::Acquire) == self.n_consumers
            && bucket.release_count.load(Ordering::Acquire) == self.n_consumers
        {
            self.reset(bucket_id);
            return true;
        }
        false
    }

    fn reset(&self, bucket_id: usize) {
        let bucket = &self.buckets[bucket_id];
        bucket.ready_count.store(0, Ordering::Release);
        bucket.release_count.store(0, Ordering::Release);
        bucket.state.store(FREE, Ordering::Release);
    }

    pub fn is_free(&self, bucket_id: usize) -> bool {
        self.buckets[bucket_id].state.load(Ordering::Acquire) == FREE
    }

    #[cfg(test)]
    pub(crate) fn counts(&self, bucket_id: usize) -> (usize, usize) {
        let bucket = &self.buckets[bucket_id];
        (
            bucket.ready_count.load(Ordering::Acquire),
            bucket.release_count.load(Ordering::Acquire),
        )
    }
}
