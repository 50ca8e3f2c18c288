use data_pipeline::{DriverRegistry, MemDriver, SampleSpec, SampleSpecEntry};
use ndarray::Array2;
use std::sync::Arc;

/// Encodes provenance into cell values: `class * 100_000 + row * 10 + col`.
pub fn class_table_values(class: usize, rows: usize, cols: usize) -> ndarray::ArrayD<f32> {
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        (class * 100_000 + row * 10 + col) as f32
    })
    .into_dyn()
}

/// One file per class, all under the `mem` protocol.
pub fn class_fixture(
    n_classes: usize,
    rows: usize,
    cols: usize,
) -> (MemDriver, SampleSpec, DriverRegistry) {
    let driver = MemDriver::new();
    let mut entries = Vec::new();
    for class in 0..n_classes {
        let locator = format!("mem://class_{}", class);
        driver.insert_table(
            &locator,
            vec![("x".to_string(), class_table_values(class, rows, cols))],
        );
        entries.push(SampleSpecEntry::new(
            locator,
            vec!["x".into()],
            format!("class_{}", class),
            1.0,
        ));
    }
    let spec = SampleSpec::new(entries).unwrap();
    let registry = DriverRegistry::new().register("mem", Arc::new(driver.clone()));
    (driver, spec, registry)
}
