use std::collections::BTreeMap;
use std::ops::Deref;

use crate::dataset::Dataset;
use crate::value::Value;

/// An ordered list of datasets as returned by `Dataset::chain`.
///
/// Exists to provide convenience reductions over the chain; it derefs to
/// its dataset slice for everything else.
#[derive(Debug, Clone)]
pub struct DatasetChain(Vec<Dataset>);

impl DatasetChain {
    #[must_use]
    pub(crate) const fn new(datasets: Vec<Dataset>) -> Self {
        Self(datasets)
    }

    #[must_use]
    pub fn datasets(&self) -> &[Dataset] {
        &self.0
    }

    fn fold_extreme(
        &self,
        column: &str,
        pick: impl Fn(&crate::dataset::DsColumn) -> Option<&Value>,
        keep: impl Fn(Value, Value) -> Value,
    ) -> Option<Value> {
        let mut result: Option<Value> = None;
        for ds in &self.0 {
            let Some(v) = ds.columns().get(column).and_then(&pick) else {
                continue;
            };
            result = Some(match result {
                Some(cur) => keep(cur, v.clone()),
                None => v.clone(),
            });
        }
        result
    }

    /// Min value for `column` over the whole chain.
    ///
    /// `None` if no dataset in the chain contains the column, if all
    /// datasets are empty or if the column type has no min/max tracking.
    #[must_use]
    pub fn min(&self, column: &str) -> Option<Value> {
        self.fold_extreme(column, |dc| dc.min.as_ref(), Value::min_with)
    }

    /// Max value for `column` over the whole chain, with the same `None`
    /// conditions as [`DatasetChain::min`].
    #[must_use]
    pub fn max(&self, column: &str) -> Option<Value> {
        self.fold_extreme(column, |dc| dc.max.as_ref(), Value::max_with)
    }

    /// Number of rows in this chain, optionally for a single slice.
    #[must_use]
    pub fn lines(&self, sliceno: Option<usize>) -> u64 {
        self.0
            .iter()
            .map(|ds| match sliceno {
                Some(s) => ds.lines().get(s).copied().unwrap_or(0),
                None => ds.total_lines(),
            })
            .sum()
    }

    /// `{column name: number of datasets containing it}`.
    #[must_use]
    pub fn column_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for ds in &self.0 {
            for name in ds.columns().keys() {
                *counts.entry(name.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// How many datasets in this chain contain `column`.
    #[must_use]
    pub fn column_count(&self, column: &str) -> usize {
        self.0
            .iter()
            .filter(|ds| ds.columns().contains_key(column))
            .count()
    }

    /// Chain without any datasets that don't contain `column`.
    #[must_use]
    pub fn with_column(&self, column: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|ds| ds.columns().contains_key(column))
                .cloned()
                .collect(),
        )
    }
}

impl Deref for DatasetChain {
    type Target = [Dataset];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for DatasetChain {
    type Item = Dataset;
    type IntoIter = std::vec::IntoIter<Dataset>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DatasetChain {
    type Item = &'a Dataset;
    type IntoIter = std::slice::Iter<'a, Dataset>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
