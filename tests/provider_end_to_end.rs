//! Full-pipeline tests: filler -> readers -> (watcher) -> generators ->
//! caller/writer, over in-memory tables.

mod common;
use common::class_fixture;

use data_pipeline::{BatchProvider, ProviderConfig, WriterConfig};
use std::thread;
use std::time::{Duration, Instant};

fn fast(builder: data_pipeline::ProviderConfigBuilder) -> data_pipeline::ProviderConfigBuilder {
    builder
        .sleep_duration(Duration::from_millis(10))
        .poll_interval(Duration::from_millis(10))
}

/// The reference scenario: 3 files x 1000 rows x 5 cols, 3 balanced
/// classes, batch_size 5, read_multiplier 2. 100 batches of shape (5, 5),
/// then a clean shutdown with every worker joined.
#[test]
fn end_to_end_hundred_batches_then_clean_stop() {
    let (_driver, spec, registry) = class_fixture(3, 1000, 5);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .read_multiplier(2)
        .n_readers(3)
        .n_buckets(10)
        .wrap_examples(true)
        .shuffle(true)
        .seed(7))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();
    assert_eq!(provider.read_size(), 10);

    let mut generator = provider.first().expect("one generator configured");
    let mut delivered = 0;
    for batch in generator.by_ref().take(100) {
        let batch = batch.unwrap();
        assert_eq!(batch.get("x").unwrap().shape(), &[5, 5]);
        delivered += 1;
    }
    assert_eq!(delivered, 100);

    drop(generator);
    provider.hard_stop();
    assert_eq!(provider.unjoined_workers(), 0, "a worker survived hard_stop");
    assert!(provider.take_error().is_none());
    assert!(!provider.is_started());
}

/// Derived tensors stay row-aligned through the shared shuffle, and the
/// file-index translation maps back to the originating file.
#[test]
fn derived_tensors_stay_aligned_under_shuffle() {
    let (_driver, spec, registry) = class_fixture(3, 200, 5);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .read_multiplier(2)
        .n_readers(2)
        .shuffle(true)
        .make_class_index(true)
        .make_one_hot(true)
        .make_file_index(true)
        .translate_file_index(true)
        .seed(11))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();
    let mut generator = provider.first().unwrap();

    for batch in generator.by_ref().take(40) {
        let batch = batch.unwrap();
        let x = batch.get("x").unwrap();
        let class_index = batch.get("class_index").unwrap();
        let one_hot = batch.get("one_hot").unwrap();
        let file_index = batch.get("file_index").unwrap();
        let provenance = batch.provenance().expect("translation enabled");

        assert_eq!(x.shape(), &[5, 5]);
        assert_eq!(class_index.shape(), &[5]);
        assert_eq!(one_hot.shape(), &[5, 3]);
        assert_eq!(file_index.shape(), &[5, 2]);
        assert_eq!(provenance.len(), 5);

        for row in 0..5 {
            // Cell values encode class * 100_000 + file_row * 10 + col.
            let value = x[[row, 0]] as usize;
            let class = value / 100_000;
            let file_row = (value % 100_000) / 10;

            assert_eq!(class_index[[row]] as usize, class, "class column misaligned");
            assert_eq!(one_hot[[row, class]], 1.0);
            assert_eq!(file_index[[row, 1]] as usize, file_row, "row column misaligned");
            assert_eq!(provenance[row].0, format!("mem://class_{}", class));
            assert_eq!(provenance[row].1, file_row);
        }
    }

    drop(generator);
    provider.hard_stop();
    assert!(provider.take_error().is_none());
}

/// With a watcher fanning out to two generators, both observe identical
/// per-bucket batch content.
#[test]
fn watched_generators_see_identical_batches() {
    let (_driver, spec, registry) = class_fixture(3, 500, 4);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .read_multiplier(2)
        .n_readers(2)
        .n_generators(2)
        .n_buckets(8)
        .seed(13))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();

    let mut first = provider.generator(0).unwrap();
    let mut second = provider.generator(1).unwrap();

    let consume = |generator: &mut data_pipeline::Generator| {
        generator
            .by_ref()
            .take(20)
            .map(|batch| batch.unwrap())
            .collect::<Vec<_>>()
    };
    let handle = thread::spawn(move || {
        let batches = consume(&mut second);
        (second, batches)
    });
    let from_first = consume(&mut first);
    let (second, from_second) = handle.join().unwrap();

    assert_eq!(from_first.len(), 20);
    assert_eq!(from_second.len(), 20);
    for (a, b) in from_first.iter().zip(&from_second) {
        assert_eq!(a.get("x").unwrap(), b.get("x").unwrap());
    }

    drop(first);
    drop(second);
    provider.hard_stop();
    assert_eq!(provider.unjoined_workers(), 0);
    assert!(provider.take_error().is_none());
}

/// With wrapping disabled the plan stream ends exactly at data exhaustion:
/// 20 rows at read_size 5 yield 4 batches, then nothing.
#[test]
fn unwrapped_data_exhaustion_stops_the_stream() {
    let (_driver, spec, registry) = class_fixture(1, 20, 3);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .read_multiplier(1)
        .n_readers(1)
        .wrap_examples(false)
        .shuffle(false)
        .seed(3))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();
    let mut generator = provider.first().unwrap();

    let consumer = thread::spawn(move || {
        let mut delivered = 0;
        while let Some(batch) = generator.next_batch() {
            batch.unwrap();
            delivered += 1;
        }
        delivered
    });

    // Let the finite stream drain, then release the blocked generator.
    thread::sleep(Duration::from_millis(1500));
    provider.hard_stop();
    let delivered = consumer.join().unwrap();
    assert_eq!(delivered, 4);
    assert!(provider.take_error().is_none());
}

/// A configured writer appends every delivered batch to its destination.
#[test]
fn writer_appends_every_batch() {
    let (driver, spec, registry) = class_fixture(2, 100, 3);
    let config = fast(ProviderConfig::builder()
        .batch_size(4)
        .read_multiplier(1)
        .n_readers(2)
        .max_batches(6)
        .seed(5)
        .writer(WriterConfig {
            destination: "mem://sink".to_string(),
            pre_write_function: None,
        }))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();

    // The consumer-facing generator must drain too: buckets are shared
    // with the writer's generator through the watcher.
    let mut generator = provider.first().unwrap();
    let mut delivered = 0;
    while let Some(batch) = generator.next_batch() {
        batch.unwrap();
        delivered += 1;
    }
    assert_eq!(delivered, 6);

    // The writer publishes its table on finish.
    let deadline = Instant::now() + Duration::from_secs(10);
    while driver.table("mem://sink").is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    drop(generator);
    provider.hard_stop();

    assert_eq!(driver.stored_rows("mem://sink", "x").unwrap(), 24);
    assert_eq!(provider.unjoined_workers(), 0);
    assert!(provider.take_error().is_none());
}

/// Pruning stops a single reader; the remaining reader keeps the stream
/// flowing.
#[test]
fn prune_leaves_the_pipeline_flowing() {
    let (_driver, spec, registry) = class_fixture(2, 500, 3);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .read_multiplier(1)
        .n_readers(2)
        .seed(17))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();
    provider.start().unwrap();
    let mut generator = provider.first().unwrap();

    for batch in generator.by_ref().take(5) {
        batch.unwrap();
    }
    provider.stop_reader();
    for batch in generator.by_ref().take(10) {
        batch.unwrap();
    }

    drop(generator);
    provider.hard_stop();
    assert_eq!(provider.unjoined_workers(), 0);
}

/// `hard_stop` is idempotent and the provider can be started again.
#[test]
fn restart_after_hard_stop() {
    let (_driver, spec, registry) = class_fixture(2, 200, 3);
    let config = fast(ProviderConfig::builder()
        .batch_size(5)
        .n_readers(1)
        .seed(23))
    .build();

    let mut provider = BatchProvider::with_registry(&spec, config, registry).unwrap();

    for _round in 0..2 {
        provider.start().unwrap();
        let mut generator = provider.first().unwrap();
        for batch in generator.by_ref().take(3) {
            batch.unwrap();
        }
        drop(generator);
        provider.hard_stop();
        provider.hard_stop(); // idempotent
        assert_eq!(provider.unjoined_workers(), 0);
        assert!(!provider.is_started());
    }
}
