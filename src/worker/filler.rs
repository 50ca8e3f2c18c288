//! The filler: turns the sample specification into a stream of read plans.
//!
//! One filler produces every plan in the pipeline. Each plan describes
//! exactly `read_size` examples drawn according to per-class probabilities:
//! `compute_draws` makes `read_size` independent uniform draws and scans
//! the cumulative class weights for each (stratified-by-probability
//! sampling, so class counts vary plan to plan), then `build_plan`
//! consumes contiguous spans of each class's candidate row sets until every
//! draw is covered.
//!
//! The filler also performs the one-time shape-inference pass: before the
//! first plan is reported it either probes a real file for each dataset's
//! per-example shape, or dry-runs the reader assembly when a
//! `process_function` changes tensor shapes, and reports the resulting
//! allocation requests exactly once on the `malloc` channel.

use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{FilterSpec, ProcessFn, ProviderConfig};
use crate::io::DriverRegistry;
use crate::pool::MallocRequest;
use crate::spec::{plan_len, ClassState, ClassTable, ReadDescriptor, ReadPlan, ReadRequest};
use crate::worker::reader::{assemble_plan, AssembleContext};
use crate::worker::{send_with_retry, StopToken};

pub(crate) struct Filler {
    classes: BTreeMap<String, ClassState>,
    /// Immutable deep copy taken at construction; epoch resets restore it.
    snapshot: BTreeMap<String, ClassState>,
    dataset_names: Arc<Vec<String>>,
    class_index_map: Arc<BTreeMap<String, usize>>,
    file_index: Arc<Vec<String>>,
    registry: Arc<DriverRegistry>,
    filter: Option<FilterSpec>,
    process: Option<ProcessFn>,
    read_size: usize,
    wrap_examples: bool,
    read_batches_per_epoch: Option<usize>,
    rng: StdRng,
    plan_count: u64,
    reported: bool,
    exhausted: bool,
}

impl Filler {
    pub(crate) fn new(
        table: &ClassTable,
        config: &ProviderConfig,
        registry: Arc<DriverRegistry>,
        seed: u64,
    ) -> Self {
        let classes = table.classes.clone();
        Self {
            snapshot: classes.clone(),
            classes,
            dataset_names: Arc::new(table.dataset_names.clone()),
            class_index_map: Arc::new(table.class_index_map.clone()),
            file_index: Arc::new(table.file_index.clone()),
            registry,
            filter: config.filter_function.clone(),
            process: config.process_function.clone(),
            read_size: config.read_size(),
            wrap_examples: config.wrap_examples,
            read_batches_per_epoch: config.read_batches_per_epoch,
            rng: StdRng::seed_from_u64(seed),
            plan_count: 0,
            reported: false,
            exhausted: false,
        }
    }

    /// Restores per-class state from the construction-time snapshot.
    pub(crate) fn reset(&mut self) {
        self.classes = self.snapshot.clone();
        self.exhausted = false;
    }

    /// Decides how many examples of each class this plan gets.
    fn compute_draws(&mut self) {
        for state in self.classes.values_mut() {
            state.n_examples_needed = 0;
        }
        for _ in 0..self.read_size {
            let draw = self.rng.random::<f64>();
            let mut running = 0.0;
            let mut chosen = None;
            for (name, state) in &self.classes {
                if draw < running + state.class_weight {
                    chosen = Some(name.clone());
                    break;
                }
                running += state.class_weight;
            }
            // Cumulative weights sum to 1; a draw at the float boundary
            // falls to the last class.
            let name = chosen.unwrap_or_else(|| {
                self.classes
                    .keys()
                    .next_back()
                    .expect("class table is non-empty")
                    .clone()
            });
            self.classes
                .get_mut(&name)
                .expect("drawn class exists")
                .n_examples_needed += 1;
        }
    }

    /// Builds the next plan, or `None` at end of stream.
    ///
    /// A plan is only ever `None` as a whole: if any class runs out of data
    /// mid-plan with `wrap_examples = false`, the partial plan is dropped
    /// and every later call returns `None` until `reset()`.
    pub(crate) fn build_plan(&mut self) -> Result<Option<ReadPlan>> {
        if self.exhausted {
            return Ok(None);
        }
        self.compute_draws();

        let plan_id = self.plan_count;
        let mut plan: ReadPlan = Vec::new();
        let class_names: Vec<String> = self.classes.keys().cloned().collect();

        for class_name in class_names {
            let mut needed = {
                let state = self
                    .classes
                    .get_mut(&class_name)
                    .expect("class table entry");
                std::mem::take(&mut state.n_examples_needed)
            };
            let mut empty_files = 0usize;

            while needed > 0 {
                let must_load = self
                    .classes
                    .get(&class_name)
                    .expect("class table entry")
                    .current_index_set
                    .is_empty();

                if must_load {
                    let (file_id, datasets) = {
                        let state = self.classes.get(&class_name).expect("class table entry");
                        (state.file_ids[state.file_cursor], state.dataset_names.clone())
                    };
                    let locator = self.file_index[file_id].clone();
                    let handle = self
                        .registry
                        .open(&locator)
                        .with_context(|| format!("filler opening '{}'", locator))?;

                    let filter = self
                        .filter
                        .as_ref()
                        .and_then(|spec| spec.for_class(&class_name))
                        .cloned();
                    let index_set = match filter {
                        Some(function) => {
                            let mut indices = function(handle.as_ref(), &datasets)
                                .with_context(|| {
                                    format!("filter function failed on '{}'", locator)
                                })?;
                            indices.sort_unstable();
                            indices.dedup();
                            indices
                        }
                        None => (0..handle.dataset_len(&datasets[0])?).collect(),
                    };

                    let wrap = self.wrap_examples;
                    let state = self
                        .classes
                        .get_mut(&class_name)
                        .expect("class table entry");
                    state.current_index_set = index_set;
                    state.example_cursor = 0;

                    if state.current_index_set.is_empty() {
                        // Filter selected nothing from this file.
                        state.file_cursor += 1;
                        empty_files += 1;
                        ensure!(
                            empty_files <= state.file_ids.len(),
                            "class '{}' has no selectable examples in any file",
                            class_name
                        );
                        if state.file_cursor == state.file_ids.len() {
                            if wrap {
                                state.file_cursor = 0;
                            } else {
                                self.exhausted = true;
                                return Ok(None);
                            }
                        }
                        continue;
                    }
                }

                let filtered = self
                    .filter
                    .as_ref()
                    .map(|spec| spec.for_class(&class_name).is_some())
                    .unwrap_or(false);
                let wrap = self.wrap_examples;
                let state = self
                    .classes
                    .get_mut(&class_name)
                    .expect("class table entry");

                let available = state.current_index_set.len() - state.example_cursor;
                let span = needed.min(available);
                let slice =
                    &state.current_index_set[state.example_cursor..state.example_cursor + span];
                let descriptor = if filtered {
                    ReadDescriptor::Indices(slice.to_vec())
                } else {
                    ReadDescriptor::Range(slice[0]..slice[span - 1] + 1)
                };
                plan.push(ReadRequest {
                    file_id: state.file_ids[state.file_cursor],
                    dataset_names: state.dataset_names.clone(),
                    class_name: class_name.clone(),
                    descriptor,
                    plan_id,
                });

                state.example_cursor += span;
                needed -= span;
                empty_files = 0;

                if state.example_cursor == state.current_index_set.len() {
                    state.example_cursor = 0;
                    state.current_index_set = Vec::new();
                    state.file_cursor += 1;
                    if state.file_cursor == state.file_ids.len() {
                        if wrap {
                            state.file_cursor = 0;
                        } else {
                            self.exhausted = true;
                            if needed > 0 {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        }

        debug_assert_eq!(plan_len(&plan), self.read_size);
        self.plan_count += 1;
        Ok(Some(plan))
    }

    /// One-time shape inference for the allocation report.
    fn infer_malloc(&self, plan: &ReadPlan) -> Result<Vec<MallocRequest>> {
        if self.process.is_some() {
            // A transform may change tensor shapes: dry-run the reader
            // assembly (derived tensors off, no shuffle) and take the
            // output shapes.
            let context = AssembleContext {
                read_size: self.read_size,
                dataset_names: self.dataset_names.clone(),
                file_index: self.file_index.clone(),
                class_index_map: self.class_index_map.clone(),
                registry: self.registry.clone(),
                make_class_index: false,
                make_one_hot: false,
                make_file_index: false,
                process: self.process.clone(),
            };
            let tensors = assemble_plan(plan, &context, None)
                .context("shape-inference assembly failed")?;
            return Ok(tensors
                .iter()
                .map(|(name, tensor)| MallocRequest::new(name.clone(), tensor.shape()[1..].to_vec()))
                .collect());
        }

        let first = plan
            .first()
            .ok_or_else(|| anyhow!("cannot infer shapes from an empty plan"))?;
        let locator = &self.file_index[first.file_id];
        let handle = self
            .registry
            .open(locator)
            .with_context(|| format!("shape probe opening '{}'", locator))?;
        self.dataset_names
            .iter()
            .map(|name| Ok(MallocRequest::new(name.clone(), handle.row_shape(name)?)))
            .collect()
    }

    pub(crate) fn run(
        mut self,
        plans_tx: Sender<ReadPlan>,
        malloc_tx: Sender<Vec<MallocRequest>>,
        mut stop: StopToken,
        sleep: Duration,
    ) -> Result<()> {
        debug!("filler starting");
        while !stop.should_stop() {
            if let Some(per_epoch) = self.read_batches_per_epoch {
                if self.plan_count % per_epoch as u64 == 0 {
                    self.reset();
                }
            }

            let plan = match self.build_plan()? {
                Some(plan) => plan,
                None => {
                    debug!(plans = self.plan_count, "data exhausted, ending plan stream");
                    break;
                }
            };

            if !self.reported {
                let requests = self.infer_malloc(&plan)?;
                debug!(?requests, "reporting allocation shapes");
                if !send_with_retry(&malloc_tx, requests, &mut stop, sleep) {
                    break;
                }
                self.reported = true;
            }

            if !send_with_retry(&plans_tx, plan, &mut stop, sleep) {
                break;
            }
        }
        debug!("filler exiting");
        Ok(())
    }
}
