#![allow(dead_code)] // not every test binary uses every helper

use std::path::Path;

use shardset::{
    ColType, Dataset, DatasetWriter, DatasetWriterOptions, DsIterator, JobId, Value, Workspace,
};

pub fn workspace(root: &Path, slices: usize) -> Workspace {
    Workspace::new(root, slices).unwrap()
}

pub fn job(id: &str) -> JobId {
    JobId::new(id).unwrap()
}

pub fn collect_rows(rows: DsIterator) -> Vec<Vec<Value>> {
    rows.collect::<shardset::Result<Vec<_>>>().unwrap()
}

pub fn int_values(values: impl Iterator<Item = shardset::Result<Value>>) -> Vec<i64> {
    values
        .map(|v| match v.unwrap() {
            Value::Int(v) => v,
            other => panic!("expected int, got {other:?}"),
        })
        .collect()
}

/// Builds a single-column `int64` dataset named `name` by split-writing
/// `values` round-robin (no hashlabel).
pub fn int_dataset(
    ws: &Workspace,
    job_id: &JobId,
    name: &str,
    previous: Option<&Dataset>,
    values: &[i64],
) -> Dataset {
    let mut opts = DatasetWriterOptions::new()
        .with_name(name)
        .with_column("x", ColType::plain(shardset::BaseType::Int64));
    if let Some(prev) = previous {
        opts = opts.with_previous(prev.id().clone());
    }
    let mut writer = DatasetWriter::create(ws, job_id, opts).unwrap();
    for &v in values {
        writer.split_write((v,)).unwrap();
    }
    writer.finish().unwrap()
}
