//! High-throughput batch assembly from file-backed numeric datasets.
//!
//! A pool of worker threads overlaps file I/O with batch assembly so a
//! downstream consumer never blocks on disk: a filler draws class-balanced
//! read plans, readers execute them into preallocated shared buckets, and
//! generators slice buckets into consumer-sized batches.
//!
//! # Architecture Overview
//!
//! ```text
//!             ┌────────────┐
//!             │ SampleSpec │ (files, datasets, classes, weights)
//!             └─────┬──────┘
//!                   │ folded into ClassTable
//!                   ↓
//!             ┌──────────┐   ReadPlan (`plans` channel)
//!             │  Filler  │ ──────────────┐
//!             └──────────┘               ↓
//!                                 ┌─────────────┐
//!                                 │ Reader pool │ ←── IoDriver registry
//!                                 └──────┬──────┘
//!               claim/store/notify      │ ReadyNotice (`ready` channel)
//!             ┌──────────────┐          ↓
//!             │  BucketPool  │   ┌─────────────┐   proxy channels
//!             │ (shared mem) │   │  [Watcher]  │ ───────────────┐
//!             └──────────────┘   └─────────────┘                ↓
//!                                (only when >1 consumer)  ┌────────────┐
//!                                                         │ Generators │
//!                                                         └─────┬──────┘
//!                                                               │ Batch
//!                                                               ↓
//!                                                     caller / [Writers]
//! ```
//!
//! # Module Structure
//!
//! ```text
//! src/
//! ├── spec.rs       # sample specification, class table, read plans
//! ├── config.rs     # ProviderConfig + builder
//! ├── batch.rs      # the Batch delivered to consumers
//! ├── io/           # driver contract, protocol registry, mem + tbl drivers
//! ├── comm.rs       # bounded channel fabric + exit flag
//! ├── pool.rs       # bucket pool and claim/release state machine
//! ├── worker/       # stop token, backoff, error slot + worker roles
//! │   ├── filler.rs
//! │   ├── reader.rs
//! │   ├── watcher.rs
//! │   └── writer.rs
//! ├── generator.rs  # lazy batch iterator
//! └── provider.rs   # BatchProvider orchestrator
//! ```
//!
//! # Example
//!
//! ```ignore
//! let spec = SampleSpec::new(vec![
//!     SampleSpecEntry::new("data/signal_0.tbl", vec!["features".into()], "signal", 0.5),
//!     SampleSpecEntry::new("data/noise_0.tbl", vec!["features".into()], "noise", 0.5),
//! ])?;
//! let config = ProviderConfig::builder()
//!     .batch_size(256)
//!     .read_multiplier(4)
//!     .n_readers(8)
//!     .make_one_hot(true)
//!     .build();
//!
//! let mut provider = BatchProvider::new(&spec, config)?;
//! provider.start()?;
//! let generator = provider.first().expect("one generator configured");
//! for batch in generator.take(1_000) {
//!     let batch = batch?;
//!     train_step(batch.get("features")?, batch.get("one_hot")?);
//! }
//! provider.hard_stop();
//! ```
//!
//! Batch order is class-balanced but unordered across readers; `plan_id` is
//! carried for diagnostics only. The crate emits `tracing` events and never
//! installs a subscriber.

pub mod batch;
pub mod comm;
pub mod config;
pub mod generator;
pub mod io;
pub mod pool;
pub mod provider;
pub mod spec;
pub mod worker;

pub use batch::Batch;
pub use comm::ReadyNotice;
pub use config::{
    DeliveryFn, FilterFn, FilterSpec, PreWriteFn, ProcessFn, ProviderConfig,
    ProviderConfigBuilder, WriterConfig,
};
pub use generator::Generator;
pub use io::{DataHandle, DriverRegistry, IoDriver, MemDriver, TableDriver, WriteHandle};
pub use pool::{BucketPool, MallocRequest};
pub use provider::BatchProvider;
pub use spec::{
    ClassState, ClassTable, ReadDescriptor, ReadPlan, ReadRequest, SampleSpec, SampleSpecEntry,
};
pub use worker::{ControlMsg, ErrorSlot, StopToken, WorkerError};
