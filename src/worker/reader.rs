//! Readers: turn read plans into populated buckets.
//!
//! A reader pulls a plan, fetches every requested slice through the driver
//! registry (range reads and index gathers use distinct driver paths),
//! concatenates per-dataset blocks into `read_size`-row tensors, appends
//! the requested derived tensors, optionally hands the whole set to a
//! `process_function`, optionally shuffles all tensors under one shared
//! permutation, then claims a free bucket, copies the tensors into its
//! preallocated buffers and emits a ready notice.
//!
//! Failing to claim a bucket because shutdown began is a clean exit, not an
//! error. A shape mismatch against the bucket layout is fatal for the
//! reader: it logs, records the error and exits rather than corrupting the
//! shared buffer.

use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ndarray::{concatenate, Array1, Array2, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::comm::ReadyNotice;
use crate::config::ProcessFn;
use crate::io::DriverRegistry;
use crate::pool::BucketPool;
use crate::spec::{ReadDescriptor, ReadPlan};
use crate::worker::{send_with_retry, StopToken};

/// Everything `assemble_plan` needs besides the plan itself. Shared between
/// the reader loop and the filler's shape-inference dry run.
pub(crate) struct AssembleContext {
    pub read_size: usize,
    pub dataset_names: Arc<Vec<String>>,
    pub file_index: Arc<Vec<String>>,
    pub class_index_map: Arc<BTreeMap<String, usize>>,
    pub registry: Arc<DriverRegistry>,
    pub make_class_index: bool,
    pub make_one_hot: bool,
    pub make_file_index: bool,
    pub process: Option<ProcessFn>,
}

/// Executes a plan: fetch, concatenate, derive, transform, shuffle.
///
/// Row `i` stays aligned across every returned tensor; the shared
/// permutation is the correctness requirement that makes the shuffle safe.
pub(crate) fn assemble_plan(
    plan: &ReadPlan,
    context: &AssembleContext,
    shuffle_rng: Option<&mut StdRng>,
) -> Result<Vec<(String, ArrayD<f32>)>> {
    ensure!(!plan.is_empty(), "cannot assemble an empty plan");

    let mut blocks: Vec<Vec<ArrayD<f32>>> = vec![Vec::new(); context.dataset_names.len()];
    let mut class_rows: Vec<f32> = Vec::with_capacity(context.read_size);
    let mut file_rows: Vec<(usize, usize)> = Vec::with_capacity(context.read_size);

    for request in plan {
        let locator = &context.file_index[request.file_id];
        let handle = context
            .registry
            .open(locator)
            .with_context(|| format!("reader opening '{}'", locator))?;

        for (slot, dataset) in context.dataset_names.iter().enumerate() {
            if !request.dataset_names.contains(dataset) {
                continue;
            }
            let block = match &request.descriptor {
                ReadDescriptor::Range(range) => handle
                    .read_rows(dataset, range.clone())
                    .with_context(|| format!("range read of '{}' from '{}'", dataset, locator))?,
                ReadDescriptor::Indices(indices) => handle
                    .gather_rows(dataset, indices)
                    .with_context(|| format!("gather read of '{}' from '{}'", dataset, locator))?,
            };
            blocks[slot].push(block);
        }

        let class_index = *context
            .class_index_map
            .get(&request.class_name)
            .ok_or_else(|| anyhow!("class '{}' missing from index map", request.class_name))?
            as f32;
        let n_examples = request.descriptor.len();
        class_rows.extend(std::iter::repeat(class_index).take(n_examples));
        match &request.descriptor {
            ReadDescriptor::Range(range) => {
                file_rows.extend(range.clone().map(|row| (request.file_id, row)));
            }
            ReadDescriptor::Indices(indices) => {
                file_rows.extend(indices.iter().map(|&row| (request.file_id, row)));
            }
        }
    }

    let mut tensors: Vec<(String, ArrayD<f32>)> =
        Vec::with_capacity(context.dataset_names.len() + 3);
    for (slot, dataset) in context.dataset_names.iter().enumerate() {
        ensure!(
            !blocks[slot].is_empty(),
            "plan produced no rows for dataset '{}'",
            dataset
        );
        let views: Vec<_> = blocks[slot].iter().map(|block| block.view()).collect();
        let merged = concatenate(Axis(0), &views)
            .with_context(|| format!("concatenating blocks of dataset '{}'", dataset))?;
        ensure!(
            merged.shape()[0] == context.read_size,
            "dataset '{}' assembled {} rows, expected {}",
            dataset,
            merged.shape()[0],
            context.read_size
        );
        tensors.push((dataset.clone(), merged));
    }

    // The transform runs over the dataset tensors, before the derived
    // tensors are appended: the bucket layout is the inferred transform
    // output plus the derived shapes, and the runtime tensor set must
    // match it exactly.
    if let Some(process) = &context.process {
        tensors = process(tensors).context("process function failed")?;
    }

    if context.make_class_index {
        tensors.push((
            "class_index".to_string(),
            Array1::from_vec(class_rows.clone()).into_dyn(),
        ));
    }
    if context.make_one_hot {
        let n_classes = context
            .class_index_map
            .values()
            .max()
            .map(|&max| max + 1)
            .unwrap_or(0);
        let mut one_hot = Array2::<f32>::zeros((context.read_size, n_classes));
        for (row, &class_index) in class_rows.iter().enumerate() {
            one_hot[[row, class_index as usize]] = 1.0;
        }
        tensors.push(("one_hot".to_string(), one_hot.into_dyn()));
    }
    if context.make_file_index {
        let mut pairs = Array2::<f32>::zeros((context.read_size, 2));
        for (row, &(file_id, file_row)) in file_rows.iter().enumerate() {
            pairs[[row, 0]] = file_id as f32;
            pairs[[row, 1]] = file_row as f32;
        }
        tensors.push(("file_index".to_string(), pairs.into_dyn()));
    }

    if let Some(rng) = shuffle_rng {
        let mut permutation: Vec<usize> = (0..context.read_size).collect();
        permutation.shuffle(rng);
        for (name, tensor) in &mut tensors {
            ensure!(
                tensor.shape()[0] == context.read_size,
                "cannot shuffle tensor '{}' with {} rows, expected {}",
                name,
                tensor.shape()[0],
                context.read_size
            );
            *tensor = tensor.select(Axis(0), &permutation);
        }
    }

    Ok(tensors)
}

pub(crate) struct Reader {
    pub id: usize,
    pub context: AssembleContext,
    pub pool: Arc<BucketPool>,
    pub plans_rx: Receiver<ReadPlan>,
    pub ready_tx: Sender<ReadyNotice>,
    pub shuffle: bool,
    pub rng: StdRng,
    pub poll: Duration,
    pub sleep: Duration,
}

impl Reader {
    pub(crate) fn run(mut self, mut stop: StopToken) -> Result<()> {
        debug!(reader_id = self.id, "reader starting");
        loop {
            if stop.should_stop() {
                break;
            }
            let plan = match self.plans_rx.recv_timeout(self.poll) {
                Ok(plan) => plan,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let plan_id = plan.first().map(|request| request.plan_id).unwrap_or(0);

            let shuffle_rng = if self.shuffle { Some(&mut self.rng) } else { None };
            let tensors = assemble_plan(&plan, &self.context, shuffle_rng)
                .with_context(|| format!("reader {} failed on plan {}", self.id, plan_id))?;

            let Some(bucket) = self.pool.claim(|| stop.should_stop(), self.sleep) else {
                // Shutdown began while waiting for a bucket.
                debug!(reader_id = self.id, "stop during bucket claim, exiting");
                break;
            };

            if let Err(error) = self.pool.store(bucket, &tensors) {
                self.pool.abort_claim(bucket);
                return Err(error)
                    .with_context(|| format!("reader {} storing plan {}", self.id, plan_id));
            }

            let notice = ReadyNotice {
                bucket,
                dataset_names: Arc::new(tensors.iter().map(|(name, _)| name.clone()).collect()),
                plan_id,
            };
            debug!(reader_id = self.id, bucket, plan_id, "bucket ready");
            if !send_with_retry(&self.ready_tx, notice, &mut stop, self.sleep) {
                self.pool.abort_claim(bucket);
                break;
            }
        }
        debug!(reader_id = self.id, "reader exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDriver;
    use crate::pool::MallocRequest;
    use crate::spec::ReadRequest;
    use ndarray::Array2;
    use rand::SeedableRng;

    const READ_SIZE: usize = 10;

    fn registry_with_two_files() -> Arc<DriverRegistry> {
        let driver = MemDriver::new();
        for (file, base) in [("mem://f0", 0.0f32), ("mem://f1", 1000.0f32)] {
            // x[row][col] = base + row*10 + col; y[row] = base + row
            let x = Array2::from_shape_fn((20, 5), |(row, col)| {
                base + (row * 10 + col) as f32
            })
            .into_dyn();
            let y = Array2::from_shape_fn((20, 1), |(row, _)| base + row as f32).into_dyn();
            driver.insert_table(file, vec![("x".to_string(), x), ("y".to_string(), y)]);
        }
        Arc::new(DriverRegistry::new().register("mem", Arc::new(driver)))
    }

    fn context(registry: Arc<DriverRegistry>) -> AssembleContext {
        let mut class_index_map = BTreeMap::new();
        class_index_map.insert("alpha".to_string(), 0);
        class_index_map.insert("beta".to_string(), 1);
        AssembleContext {
            read_size: READ_SIZE,
            dataset_names: Arc::new(vec!["x".to_string(), "y".to_string()]),
            file_index: Arc::new(vec!["mem://f0".to_string(), "mem://f1".to_string()]),
            class_index_map: Arc::new(class_index_map),
            registry,
            make_class_index: false,
            make_one_hot: false,
            make_file_index: false,
            process: None,
        }
    }

    fn two_request_plan() -> ReadPlan {
        vec![
            ReadRequest {
                file_id: 0,
                dataset_names: vec!["x".to_string(), "y".to_string()],
                class_name: "alpha".to_string(),
                descriptor: ReadDescriptor::Range(0..6),
                plan_id: 7,
            },
            ReadRequest {
                file_id: 1,
                dataset_names: vec!["x".to_string(), "y".to_string()],
                class_name: "beta".to_string(),
                descriptor: ReadDescriptor::Indices(vec![2, 5, 7, 11]),
                plan_id: 7,
            },
        ]
    }

    #[test]
    fn assembles_read_size_rows_across_requests() {
        let context = context(registry_with_two_files());
        let tensors = assemble_plan(&two_request_plan(), &context, None).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].1.shape(), &[READ_SIZE, 5]);
        assert_eq!(tensors[1].1.shape(), &[READ_SIZE, 1]);
        // Range rows come first, then gathered rows.
        assert_eq!(tensors[1].1[[0, 0]], 0.0);
        assert_eq!(tensors[1].1[[6, 0]], 1002.0);
        assert_eq!(tensors[1].1[[9, 0]], 1011.0);
    }

    #[test]
    fn derived_tensors_align_with_rows() {
        let mut context = context(registry_with_two_files());
        context.make_class_index = true;
        context.make_one_hot = true;
        context.make_file_index = true;
        let tensors = assemble_plan(&two_request_plan(), &context, None).unwrap();

        let names: Vec<_> = tensors.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "class_index", "one_hot", "file_index"]);

        let class_index = &tensors[2].1;
        assert_eq!(class_index.shape(), &[READ_SIZE]);
        assert_eq!(class_index[[0]], 0.0);
        assert_eq!(class_index[[6]], 1.0);

        let one_hot = &tensors[3].1;
        assert_eq!(one_hot.shape(), &[READ_SIZE, 2]);
        assert_eq!(one_hot[[0, 0]], 1.0);
        assert_eq!(one_hot[[6, 1]], 1.0);
        assert_eq!(one_hot[[6, 0]], 0.0);

        let file_index = &tensors[4].1;
        assert_eq!(file_index.shape(), &[READ_SIZE, 2]);
        assert_eq!(file_index[[6, 0]], 1.0); // file_id
        assert_eq!(file_index[[6, 1]], 2.0); // row within file
    }

    #[test]
    fn shuffle_is_a_shared_bijection() {
        let context = context(registry_with_two_files());
        let unshuffled = assemble_plan(&two_request_plan(), &context, None).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let shuffled = assemble_plan(&two_request_plan(), &context, Some(&mut rng)).unwrap();

        // Row alignment holds: x[row][0] == y[row] * 10 everywhere except
        // the column offset; verify via the invariant x[r][c] = y[r]*10 + c
        // for rows from file 0 and x[r][c] = (y[r]-1000)*10 + 1000 + c for
        // file 1. Simpler: x[r][0] derives from y[r] identically in both.
        for row in 0..READ_SIZE {
            let y = shuffled[1].1[[row, 0]];
            let expected_x0 = if y >= 1000.0 {
                1000.0 + (y - 1000.0) * 10.0
            } else {
                y * 10.0
            };
            assert_eq!(shuffled[0].1[[row, 0]], expected_x0);
        }

        // Bijection: resorting the shuffled y column reproduces the
        // unshuffled y column.
        let mut original: Vec<f32> = (0..READ_SIZE).map(|r| unshuffled[1].1[[r, 0]]).collect();
        let mut resorted: Vec<f32> = (0..READ_SIZE).map(|r| shuffled[1].1[[r, 0]]).collect();
        original.sort_by(|a, b| a.partial_cmp(b).unwrap());
        resorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(original, resorted);
    }

    #[test]
    fn process_function_replaces_the_tensor_set() {
        let mut context = context(registry_with_two_files());
        context.process = Some(Arc::new(|tensors| {
            let rows = tensors[0].1.shape()[0];
            Ok(vec![(
                "only".to_string(),
                Array2::<f32>::ones((rows, 2)).into_dyn(),
            )])
        }));
        let tensors = assemble_plan(&two_request_plan(), &context, None).unwrap();
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors[0].0, "only");
        assert_eq!(tensors[0].1.shape(), &[READ_SIZE, 2]);
    }

    #[test]
    fn short_plan_is_a_fatal_assembly_error() {
        let context = context(registry_with_two_files());
        let short: ReadPlan = vec![ReadRequest {
            file_id: 0,
            dataset_names: vec!["x".to_string(), "y".to_string()],
            class_name: "alpha".to_string(),
            descriptor: ReadDescriptor::Range(0..6),
            plan_id: 0,
        }];
        assert!(assemble_plan(&short, &context, None).is_err());
    }

    #[test]
    fn reader_loop_fills_a_bucket_and_notifies() {
        let registry = registry_with_two_files();
        let pool = Arc::new(BucketPool::new(
            &[
                MallocRequest::new("x", vec![5]),
                MallocRequest::new("y", vec![1]),
            ],
            2,
            READ_SIZE,
            1,
        ));
        let (plans_tx, plans_rx) = crossbeam_channel::bounded(2);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(2);
        let exit = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = Reader {
            id: 0,
            context: context(registry),
            pool: pool.clone(),
            plans_rx,
            ready_tx,
            shuffle: false,
            rng: StdRng::seed_from_u64(1),
            poll: Duration::from_millis(10),
            sleep: Duration::from_millis(10),
        };
        let stop = StopToken::new(exit.clone());
        let handle = std::thread::spawn(move || reader.run(stop));

        plans_tx.send(two_request_plan()).unwrap();
        let notice = ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.plan_id, 7);
        assert!(!pool.is_free(notice.bucket));

        let rows = pool.copy_rows(notice.bucket, 0..READ_SIZE).unwrap();
        assert_eq!(rows[1].1[[9, 0]], 1011.0);

        exit.store(true, std::sync::atomic::Ordering::Release);
        handle.join().unwrap().unwrap();
    }
}
