//! Communication fabric: the bounded channels wiring the pipeline together.
//!
//! Independently-addressable channels, all bounded so a saturated pipeline
//! exerts backpressure instead of growing queues:
//!
//! - `ctl`: control messages (`Exit`, `Prune`) consumed by readers
//! - `plans`: filler -> readers, one [`ReadPlan`] per message
//! - `ready`: readers -> generator (or watcher), bucket-ready notices
//! - `malloc`: filler -> orchestrator, the one-time allocation report
//! - one proxy `ready` channel per fan-out consumer, fed by the watcher
//!
//! The fabric also owns the shared exit flag that backs every
//! [`StopToken`](crate::worker::StopToken).

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pool::MallocRequest;
use crate::spec::ReadPlan;
use crate::worker::{ControlMsg, StopToken};

/// A reader's announcement that a bucket holds a fresh read.
#[derive(Debug, Clone)]
pub struct ReadyNotice {
    pub bucket: usize,
    pub dataset_names: Arc<Vec<String>>,
    /// Carried for diagnostics, not ordering: notices are FIFO per reader
    /// but unordered across readers.
    pub plan_id: u64,
}

pub(crate) struct CommFabric {
    exit: Arc<AtomicBool>,
    ctl: (Sender<ControlMsg>, Receiver<ControlMsg>),
    plans: (Sender<ReadPlan>, Receiver<ReadPlan>),
    ready: (Sender<ReadyNotice>, Receiver<ReadyNotice>),
    malloc: (Sender<Vec<MallocRequest>>, Receiver<Vec<MallocRequest>>),
    proxies: Vec<(Sender<ReadyNotice>, Receiver<ReadyNotice>)>,
}

impl CommFabric {
    /// `depth` bounds every data channel; one proxy channel is created per
    /// fan-out consumer (zero when unwatched).
    pub(crate) fn new(depth: usize, n_proxies: usize) -> Self {
        let depth = depth.max(1);
        Self {
            exit: Arc::new(AtomicBool::new(false)),
            ctl: bounded(depth),
            plans: bounded(depth),
            ready: bounded(depth),
            malloc: bounded(depth),
            proxies: (0..n_proxies).map(|_| bounded(depth)).collect(),
        }
    }

    pub(crate) fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit.clone()
    }

    pub(crate) fn plans_tx(&self) -> Sender<ReadPlan> {
        self.plans.0.clone()
    }

    pub(crate) fn plans_rx(&self) -> Receiver<ReadPlan> {
        self.plans.1.clone()
    }

    pub(crate) fn ready_tx(&self) -> Sender<ReadyNotice> {
        self.ready.0.clone()
    }

    pub(crate) fn ready_rx(&self) -> Receiver<ReadyNotice> {
        self.ready.1.clone()
    }

    pub(crate) fn malloc_tx(&self) -> Sender<Vec<MallocRequest>> {
        self.malloc.0.clone()
    }

    pub(crate) fn malloc_rx(&self) -> Receiver<Vec<MallocRequest>> {
        self.malloc.1.clone()
    }

    pub(crate) fn proxy_tx(&self, index: usize) -> Sender<ReadyNotice> {
        self.proxies[index].0.clone()
    }

    pub(crate) fn proxy_rx(&self, index: usize) -> Receiver<ReadyNotice> {
        self.proxies[index].1.clone()
    }

    /// Token for workers that only honor the broadcast stop.
    pub(crate) fn stop_token(&self) -> StopToken {
        StopToken::new(self.exit.clone())
    }

    /// Token for readers: broadcast stop plus the shared `ctl` channel, so
    /// a `Prune` stops exactly one of them.
    pub(crate) fn reader_stop_token(&self) -> StopToken {
        StopToken::with_ctl(self.exit.clone(), self.ctl.1.clone())
    }

    /// Broadcast hard stop: flips the exit flag and posts `Exit` on `ctl`
    /// for any reader mid-drain.
    pub(crate) fn broadcast_exit(&self) {
        self.exit.store(true, Ordering::Release);
        let _ = self.ctl.0.try_send(ControlMsg::Exit);
    }

    /// Single-worker stop: the first reader to drain `ctl` exits.
    pub(crate) fn prune_one(&self) {
        let _ = self.ctl.0.try_send(ControlMsg::Prune);
    }

    /// Empties every data channel so producers blocked on a full queue can
    /// observe the stop promptly.
    pub(crate) fn drain_data(&self) {
        while self.plans.1.try_recv().is_ok() {}
        while self.ready.1.try_recv().is_ok() {}
        while self.malloc.1.try_recv().is_ok() {}
        for (_, rx) in &self.proxies {
            while rx.try_recv().is_ok() {}
        }
    }
}
