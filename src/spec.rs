//! Sample specification, class table, and read-plan data model.
//!
//! A sample specification is an ordered list of 4-field entries
//! `(file_id, dataset_names, class_name, class_weight)` describing which
//! files feed which class. At construction the specification is folded into
//! a [`ClassTable`]: per-class cursor state for the filler, a class → index
//! map, the global dataset-name order, and the file index (file id per
//! numeric position, so read requests can carry a small integer instead of
//! a path).
//!
//! Class weights are renormalized to sum to 1 across classes, not across
//! entries: the first entry of a class carries its weight, later entries
//! only contribute files.

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One row of a sample specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSpecEntry {
    pub file_id: String,
    pub dataset_names: Vec<String>,
    pub class_name: String,
    pub class_weight: f64,
}

impl SampleSpecEntry {
    pub fn new(
        file_id: impl Into<String>,
        dataset_names: Vec<String>,
        class_name: impl Into<String>,
        class_weight: f64,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            dataset_names,
            class_name: class_name.into(),
            class_weight,
        }
    }
}

/// An ordered, validated sample specification.
#[derive(Debug, Clone)]
pub struct SampleSpec {
    entries: Vec<SampleSpecEntry>,
}

impl SampleSpec {
    /// Validates and wraps a list of entries.
    ///
    /// Fatal at construction: empty specification, empty dataset list,
    /// non-positive or non-finite class weight.
    pub fn new(entries: Vec<SampleSpecEntry>) -> Result<Self> {
        ensure!(!entries.is_empty(), "sample specification is empty");
        for (row, entry) in entries.iter().enumerate() {
            ensure!(
                !entry.dataset_names.is_empty(),
                "sample specification row {}: dataset list is empty",
                row
            );
            ensure!(
                entry.class_weight.is_finite() && entry.class_weight > 0.0,
                "sample specification row {}: class_weight must be > 0, got {}",
                row,
                entry.class_weight
            );
        }
        Ok(Self { entries })
    }

    /// Parses a specification from loosely-typed JSON rows, e.g.
    /// `["train_0.tbl", ["features", "labels"], "signal", 0.5]`.
    ///
    /// A row with fewer or more than 4 fields is a construction-time fatal
    /// error.
    pub fn from_json_rows(rows: &[serde_json::Value]) -> Result<Self> {
        let mut entries = Vec::with_capacity(rows.len());
        for (row_index, row) in rows.iter().enumerate() {
            let fields = row
                .as_array()
                .ok_or_else(|| anyhow!("sample specification row {} is not an array", row_index))?;
            ensure!(
                fields.len() == 4,
                "sample specification row {} has {} fields, expected 4",
                row_index,
                fields.len()
            );

            let file_id = fields[0]
                .as_str()
                .ok_or_else(|| anyhow!("row {}: file_id must be a string", row_index))?
                .to_string();
            let dataset_names = fields[1]
                .as_array()
                .ok_or_else(|| anyhow!("row {}: dataset_names must be an array", row_index))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("row {}: dataset name must be a string", row_index))
                })
                .collect::<Result<Vec<_>>>()?;
            let class_name = fields[2]
                .as_str()
                .ok_or_else(|| anyhow!("row {}: class_name must be a string", row_index))?
                .to_string();
            let class_weight = fields[3]
                .as_f64()
                .ok_or_else(|| anyhow!("row {}: class_weight must be a number", row_index))?;

            entries.push(SampleSpecEntry {
                file_id,
                dataset_names,
                class_name,
                class_weight,
            });
        }
        Self::new(entries)
    }

    pub fn entries(&self) -> &[SampleSpecEntry] {
        &self.entries
    }
}

/// Per-class cursor state, owned and mutated only by the filler.
///
/// `current_index_set` is the candidate row set of the file under
/// `file_cursor`, populated when the file is opened (either the full index
/// range or a sorted filter result) and cleared when the file is exhausted.
#[derive(Debug, Clone)]
pub struct ClassState {
    pub file_ids: Vec<usize>,
    pub dataset_names: Vec<String>,
    pub class_index: usize,
    pub class_weight: f64,
    pub n_examples_needed: usize,
    pub file_cursor: usize,
    pub example_cursor: usize,
    pub current_index_set: Vec<usize>,
}

/// The folded form of a sample specification.
#[derive(Debug, Clone)]
pub struct ClassTable {
    /// Class name -> filler state. BTreeMap so plan construction visits
    /// classes in a stable order.
    pub classes: BTreeMap<String, ClassState>,
    /// Class name -> small integer used for class_index / one_hot tensors.
    pub class_index_map: BTreeMap<String, usize>,
    /// All dataset names across the specification, first-seen order.
    pub dataset_names: Vec<String>,
    /// File id per numeric file position.
    pub file_index: Vec<String>,
}

impl ClassTable {
    /// Folds a specification into per-class state.
    ///
    /// When `class_index_map` is given it must cover every class in the
    /// specification; an incomplete map is a construction-time fatal error.
    /// Otherwise indices are assigned in first-seen entry order.
    pub fn from_spec(
        spec: &SampleSpec,
        class_index_map: Option<&HashMap<String, usize>>,
    ) -> Result<Self> {
        let mut classes: BTreeMap<String, ClassState> = BTreeMap::new();
        let mut index_map: BTreeMap<String, usize> = BTreeMap::new();
        let mut dataset_names: Vec<String> = Vec::new();
        let mut file_index: Vec<String> = Vec::new();
        let mut next_index = 0usize;

        for entry in spec.entries() {
            for name in &entry.dataset_names {
                if !dataset_names.contains(name) {
                    dataset_names.push(name.clone());
                }
            }

            let class_index = match class_index_map {
                Some(map) => *map.get(&entry.class_name).ok_or_else(|| {
                    anyhow!(
                        "class_index_map does not cover class '{}'",
                        entry.class_name
                    )
                })?,
                None => *index_map.entry(entry.class_name.clone()).or_insert_with(|| {
                    let assigned = next_index;
                    next_index += 1;
                    assigned
                }),
            };

            file_index.push(entry.file_id.clone());
            let file_id = file_index.len() - 1;

            match classes.get_mut(&entry.class_name) {
                Some(state) => state.file_ids.push(file_id),
                None => {
                    classes.insert(
                        entry.class_name.clone(),
                        ClassState {
                            file_ids: vec![file_id],
                            dataset_names: entry.dataset_names.clone(),
                            class_index,
                            class_weight: entry.class_weight,
                            n_examples_needed: 0,
                            file_cursor: 0,
                            example_cursor: 0,
                            current_index_set: Vec::new(),
                        },
                    );
                }
            }
        }

        if let Some(map) = class_index_map {
            index_map = map
                .iter()
                .map(|(name, index)| (name.clone(), *index))
                .collect();
        } else {
            for (name, state) in &classes {
                index_map.insert(name.clone(), state.class_index);
            }
        }

        // Renormalize so weights sum to 1 across classes.
        let total: f64 = classes.values().map(|state| state.class_weight).sum();
        ensure!(total > 0.0, "class weights sum to zero");
        for state in classes.values_mut() {
            state.class_weight /= total;
        }

        Ok(Self {
            classes,
            class_index_map: index_map,
            dataset_names,
            file_index,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

/// How a read request addresses rows within a file.
///
/// The two forms have different read semantics and keep them all the way to
/// the driver: a `Range` is a contiguous slice, an `Indices` list is a
/// gather of explicit (sorted) row numbers produced by a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadDescriptor {
    Range(std::ops::Range<usize>),
    Indices(Vec<usize>),
}

impl ReadDescriptor {
    pub fn len(&self) -> usize {
        match self {
            ReadDescriptor::Range(range) => range.end - range.start,
            ReadDescriptor::Indices(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of file access inside a read plan. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub file_id: usize,
    pub dataset_names: Vec<String>,
    pub class_name: String,
    pub descriptor: ReadDescriptor,
    pub plan_id: u64,
}

/// The unit of work handed to one reader: requests whose descriptor lengths
/// sum to exactly `read_size`.
pub type ReadPlan = Vec<ReadRequest>;

/// Sums descriptor lengths over a plan.
pub fn plan_len(plan: &ReadPlan) -> usize {
    plan.iter().map(|request| request.descriptor.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_class_spec() -> SampleSpec {
        SampleSpec::new(vec![
            SampleSpecEntry::new("a.tbl", vec!["x".into()], "alpha", 1.0),
            SampleSpecEntry::new("b.tbl", vec!["x".into()], "beta", 2.0),
            SampleSpecEntry::new("c.tbl", vec!["x".into()], "gamma", 1.0),
        ])
        .unwrap()
    }

    mod spec_parsing {
        use super::*;

        #[test]
        fn rejects_wrong_arity() {
            let rows = vec![json!(["a.tbl", ["x"], "alpha"])];
            assert!(SampleSpec::from_json_rows(&rows).is_err());

            let rows = vec![json!(["a.tbl", ["x"], "alpha", 1.0, "extra"])];
            assert!(SampleSpec::from_json_rows(&rows).is_err());
        }

        #[test]
        fn parses_valid_rows() {
            let rows = vec![
                json!(["a.tbl", ["x", "y"], "alpha", 0.5]),
                json!(["b.tbl", ["x", "y"], "beta", 0.5]),
            ];
            let spec = SampleSpec::from_json_rows(&rows).unwrap();
            assert_eq!(spec.entries().len(), 2);
            assert_eq!(spec.entries()[0].dataset_names, vec!["x", "y"]);
        }

        #[test]
        fn rejects_bad_weights() {
            assert!(SampleSpec::new(vec![SampleSpecEntry::new(
                "a.tbl",
                vec!["x".into()],
                "alpha",
                0.0
            )])
            .is_err());
            assert!(SampleSpec::new(vec![SampleSpecEntry::new(
                "a.tbl",
                vec!["x".into()],
                "alpha",
                f64::NAN
            )])
            .is_err());
        }
    }

    mod class_table {
        use super::*;

        #[test]
        fn renormalizes_weights_across_classes() {
            let table = ClassTable::from_spec(&three_class_spec(), None).unwrap();
            let total: f64 = table.classes.values().map(|c| c.class_weight).sum();
            assert!((total - 1.0).abs() < 1e-12);
            assert!((table.classes["beta"].class_weight - 0.5).abs() < 1e-12);
        }

        #[test]
        fn weight_is_per_class_not_per_entry() {
            // Two entries share a class; only the first entry's weight counts.
            let spec = SampleSpec::new(vec![
                SampleSpecEntry::new("a.tbl", vec!["x".into()], "alpha", 1.0),
                SampleSpecEntry::new("a2.tbl", vec!["x".into()], "alpha", 9.0),
                SampleSpecEntry::new("b.tbl", vec!["x".into()], "beta", 1.0),
            ])
            .unwrap();
            let table = ClassTable::from_spec(&spec, None).unwrap();
            assert!((table.classes["alpha"].class_weight - 0.5).abs() < 1e-12);
            assert_eq!(table.classes["alpha"].file_ids, vec![0, 1]);
        }

        #[test]
        fn assigns_indices_in_entry_order() {
            let table = ClassTable::from_spec(&three_class_spec(), None).unwrap();
            assert_eq!(table.class_index_map["alpha"], 0);
            assert_eq!(table.class_index_map["beta"], 1);
            assert_eq!(table.class_index_map["gamma"], 2);
        }

        #[test]
        fn explicit_index_map_must_cover_all_classes() {
            let mut map = HashMap::new();
            map.insert("alpha".to_string(), 2);
            map.insert("beta".to_string(), 0);
            // "gamma" missing
            assert!(ClassTable::from_spec(&three_class_spec(), Some(&map)).is_err());

            map.insert("gamma".to_string(), 1);
            let table = ClassTable::from_spec(&three_class_spec(), Some(&map)).unwrap();
            assert_eq!(table.class_index_map["alpha"], 2);
            assert_eq!(table.classes["alpha"].class_index, 2);
        }

        #[test]
        fn collects_dataset_names_first_seen() {
            let spec = SampleSpec::new(vec![
                SampleSpecEntry::new("a.tbl", vec!["x".into(), "y".into()], "alpha", 1.0),
                SampleSpecEntry::new("b.tbl", vec!["y".into(), "z".into()], "beta", 1.0),
            ])
            .unwrap();
            let table = ClassTable::from_spec(&spec, None).unwrap();
            assert_eq!(table.dataset_names, vec!["x", "y", "z"]);
        }
    }

    mod descriptors {
        use super::*;

        #[test]
        fn descriptor_lengths() {
            assert_eq!(ReadDescriptor::Range(3..10).len(), 7);
            assert_eq!(ReadDescriptor::Indices(vec![1, 4, 9]).len(), 3);
            assert!(ReadDescriptor::Range(5..5).is_empty());
        }
    }
}
