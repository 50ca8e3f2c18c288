//! The watcher: fan-out multicast and bucket reclamation.
//!
//! Present only when more than one consumer must see the same bucket. The
//! watcher pulls each ready notice exactly once from the reader-facing
//! channel and republishes it onto every consumer-facing proxy channel,
//! incrementing the bucket's `ready_count` per forward. Between
//! notifications it sweeps all buckets and resets any whose consumers have
//! all received and released it.
//!
//! The loop is a tight poll: drain one notice (non-blocking), sweep, then a
//! bounded sleep.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::comm::ReadyNotice;
use crate::pool::BucketPool;
use crate::worker::{send_with_retry, StopToken};

pub(crate) struct Watcher {
    pub pool: Arc<BucketPool>,
    pub ready_rx: Receiver<ReadyNotice>,
    pub proxies: Vec<Sender<ReadyNotice>>,
    pub poll: Duration,
}

impl Watcher {
    pub(crate) fn run(self, mut stop: StopToken) -> Result<()> {
        debug!(n_consumers = self.proxies.len(), "watcher starting");
        while !stop.should_stop() {
            if let Ok(notice) = self.ready_rx.try_recv() {
                debug!(
                    bucket = notice.bucket,
                    plan_id = notice.plan_id,
                    "multicasting ready notice"
                );
                for proxy in &self.proxies {
                    self.pool.mark_ready(notice.bucket);
                    if !send_with_retry(proxy, notice.clone(), &mut stop, self.poll) {
                        // Stop requested, or this consumer is gone; the
                        // remaining proxies still get the notice.
                        if stop.should_stop() {
                            break;
                        }
                    }
                }
            }

            for bucket_id in 0..self.pool.len() {
                if self.pool.try_reclaim(bucket_id) {
                    debug!(bucket = bucket_id, "bucket reclaimed");
                }
            }

            thread::sleep(self.poll);
        }
        debug!("watcher exiting");
        Ok(())
    }
}
