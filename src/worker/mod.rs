//! Worker plumbing shared by every pipeline role.
//!
//! Cancellation is a token + message hybrid: a broadcast exit flag set once
//! at shutdown, plus a bounded control channel carrying `Prune` for
//! single-worker stops. Every worker loop calls `should_stop()` between
//! units of work; the call drains all pending control messages before the
//! worker resumes, so at most one in-flight unit of work survives a stop
//! request.
//!
//! Channel operations never block unboundedly: sends go through
//! [`send_with_retry`] (try, sleep with exponential backoff, re-check the
//! stop token), receives use `recv_timeout` at the call site.

pub mod filler;
pub mod reader;
pub mod watcher;
pub mod writer;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Messages on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// Broadcast hard stop.
    Exit,
    /// Stop exactly one consumer of the control channel.
    Prune,
}

/// Cooperative cancellation handle passed into every worker loop.
///
/// Workers holding a control receiver (readers) additionally honor `Prune`;
/// everyone honors the shared exit flag.
pub struct StopToken {
    exit: Arc<AtomicBool>,
    ctl: Option<Receiver<ControlMsg>>,
    stopped: bool,
}

impl StopToken {
    pub fn new(exit: Arc<AtomicBool>) -> Self {
        Self {
            exit,
            ctl: None,
            stopped: false,
        }
    }

    pub fn with_ctl(exit: Arc<AtomicBool>, ctl: Receiver<ControlMsg>) -> Self {
        Self {
            exit,
            ctl: Some(ctl),
            stopped: false,
        }
    }

    /// Drains pending control messages, then reports whether this worker
    /// should stop.
    pub fn should_stop(&mut self) -> bool {
        if self.stopped || self.exit.load(Ordering::Acquire) {
            return true;
        }
        if let Some(ctl) = &self.ctl {
            while let Ok(message) = ctl.try_recv() {
                match message {
                    ControlMsg::Exit => {
                        self.exit.store(true, Ordering::Release);
                        self.stopped = true;
                    }
                    ControlMsg::Prune => self.stopped = true,
                }
            }
        }
        self.stopped || self.exit.load(Ordering::Acquire)
    }
}

/// Bounded exponential backoff for sleep-and-retry loops.
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            current: Duration::from_millis(1).min(max),
            max,
        }
    }

    /// Sleeps for the current interval, then doubles it up to the cap.
    pub fn wait(&mut self) {
        thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = Duration::from_millis(1).min(self.max);
    }
}

/// Sends on a bounded channel without blocking the control path.
///
/// Retries with backoff while the channel is full; aborts (returning
/// `false`) when the stop token trips or the receiver is gone.
pub fn send_with_retry<T>(
    tx: &Sender<T>,
    mut payload: T,
    stop: &mut StopToken,
    backoff_max: Duration,
) -> bool {
    let mut backoff = Backoff::new(backoff_max);
    loop {
        match tx.try_send(payload) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                if stop.should_stop() {
                    return false;
                }
                payload = returned;
                backoff.wait();
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

/// First error recorded by any worker; later errors are dropped.
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub worker: String,
    pub message: String,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker '{}' failed: {}", self.worker, self.message)
    }
}

impl std::error::Error for WorkerError {}

/// Shared error slot: workers record fatal failures here at their run-loop
/// boundary, the orchestrator and generators observe them.
#[derive(Clone, Default)]
pub struct ErrorSlot {
    slot: Arc<Mutex<Option<WorkerError>>>,
    raised: Arc<AtomicBool>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, worker: &str, error: &anyhow::Error) {
        let mut slot = self.slot.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(WorkerError {
                worker: worker.to_string(),
                message: format!("{error:#}"),
            });
        }
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<WorkerError> {
        self.slot.lock().expect("error slot poisoned").take()
    }
}

/// Spawns a named worker thread whose run-loop errors land in the slot.
pub(crate) fn spawn_worker<F>(name: &str, errors: ErrorSlot, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let thread_name = name.to_string();
    let slot_name = name.to_string();
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            if let Err(err) = body() {
                error!(worker = %slot_name, error = %format!("{err:#}"), "worker exited with error");
                errors.record(&slot_name, &err);
            }
        })
        .with_context(|| format!("failed to spawn worker thread '{}'", name))
}

/// Joins a worker with a deadline, returning whether it actually joined. A
/// join that times out is logged and the thread detached; one stuck worker
/// must not prevent overall shutdown.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(worker = name, "join timed out, detaching thread");
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().is_ok()
}
