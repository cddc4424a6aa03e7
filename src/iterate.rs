//! Iteration over one or many datasets.
//!
//! A plan of `(dataset, slice, rehash)` entries is built up front (so usage
//! errors surface before any column file is opened), then driven lazily:
//! per-column readers are opened when a plan entry is entered and rows are
//! pulled one at a time. Filters, translators, range checks and rehashing
//! compose in a fixed order: per-column translators, then rehash
//! filtering, then the row translator, then the range check, then filters.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use crate::codec::{HashFilterReader, TypedReader};
use crate::dataset::{ChainOptions, Dataset};
use crate::error::{Error, Result};
use crate::types::BaseType;
use crate::value::Value;

/// Which slice(s) to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicePick {
    /// All slices, concatenated in slice order. Rehashing is forced off
    /// (order is not guaranteed anyway).
    All,
    /// One slice.
    One(usize),
    /// All slices, one row at a time across slices: row `i` of slice 0,
    /// row `i` of slice 1, …, then row `i + 1` of slice 0. Approximates the
    /// original input order of round-robin imports; exhausted slices are
    /// skipped, so unequal slices only approximate it.
    RoundRobin,
}

/// Verdict returned by iteration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Continue,
    /// Skip the upcoming slice.
    SkipSlice,
    /// Skip the rest of this dataset.
    SkipJob,
    /// End the whole iteration.
    Stop,
}

/// Per-column filter: a predicate, or plain truthiness of the value.
pub enum ColumnFilter {
    Truthy,
    Func(Box<dyn FnMut(&Value) -> bool>),
}

impl ColumnFilter {
    pub fn func(f: impl FnMut(&Value) -> bool + 'static) -> Self {
        Self::Func(Box::new(f))
    }
}

/// Row filters: one predicate over the whole row, or per-column filters
/// that must all pass (evaluated in column order, short-circuiting).
pub enum Filters {
    Row(Box<dyn FnMut(&[Value]) -> bool>),
    PerColumn(HashMap<String, ColumnFilter>),
}

impl Filters {
    pub fn row(f: impl FnMut(&[Value]) -> bool + 'static) -> Self {
        Self::Row(Box::new(f))
    }

    #[must_use]
    pub fn column(name: impl Into<String>, filter: ColumnFilter) -> Self {
        let mut map = HashMap::new();
        map.insert(name.into(), filter);
        Self::PerColumn(map)
    }
}

/// Per-column translator: a function, or a mapping where missing keys
/// yield [`Value::None`].
pub enum ColumnTranslator {
    Func(Box<dyn FnMut(Value) -> Value>),
    Map(HashMap<Value, Value>),
}

impl ColumnTranslator {
    pub fn func(f: impl FnMut(Value) -> Value + 'static) -> Self {
        Self::Func(Box::new(f))
    }

    fn apply(&mut self, value: Value) -> Value {
        match self {
            Self::Func(f) => f(value),
            Self::Map(map) => map.get(&value).cloned().unwrap_or(Value::None),
        }
    }
}

/// Row translators, applied before filters.
pub enum Translators {
    Row(Box<dyn FnMut(Vec<Value>) -> Vec<Value>>),
    PerColumn(HashMap<String, ColumnTranslator>),
}

impl Translators {
    pub fn row(f: impl FnMut(Vec<Value>) -> Vec<Value> + 'static) -> Self {
        Self::Row(Box::new(f))
    }

    #[must_use]
    pub fn column(name: impl Into<String>, translator: ColumnTranslator) -> Self {
        let mut map = HashMap::new();
        map.insert(name.into(), translator);
        Self::PerColumn(map)
    }
}

type DatasetHook = Box<dyn FnMut(&Dataset) -> Verdict>;
type SliceHook = Box<dyn FnMut(&Dataset, usize) -> Verdict>;

/// Options for [`Dataset::iterate`] and friends.
///
/// `columns` defaults to all columns of the first dataset, in name order.
/// A requested `hashlabel` must match each dataset's unless `rehash` is
/// set, in which case mismatched datasets are re-filtered row by row.
/// `range` limits rows to `lo <= value < hi` on one column; with
/// `sloppy_range` only whole-dataset pruning happens and extra rows may
/// be returned. The four hooks replace callback signals: a [`Verdict`]
/// other than `Continue` skips the slice, skips the dataset, or stops the
/// iteration (post hooks only honor `Stop`).
#[derive(Default)]
pub struct IterateOptions {
    columns: Option<Vec<String>>,
    hashlabel: Option<String>,
    rehash: bool,
    range: Option<(String, Option<Value>, Option<Value>)>,
    sloppy_range: bool,
    filters: Option<Filters>,
    translators: Option<Translators>,
    pre_dataset: Option<DatasetHook>,
    post_dataset: Option<DatasetHook>,
    pre_slice: Option<SliceHook>,
    post_slice: Option<SliceHook>,
}

impl IterateOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut collected: Vec<String> = columns.into_iter().map(Into::into).collect();
        collected.sort();
        self.columns = Some(collected);
        self
    }

    #[must_use]
    pub fn with_hashlabel(mut self, hashlabel: impl Into<String>) -> Self {
        self.hashlabel = Some(hashlabel.into());
        self
    }

    #[must_use]
    pub const fn with_rehash(mut self, rehash: bool) -> Self {
        self.rehash = rehash;
        self
    }

    /// Half-open range `lo <= value < hi`; pass `None` to leave a bound
    /// open. With both bounds unset the range is disabled.
    #[must_use]
    pub fn with_range(
        mut self,
        column: impl Into<String>,
        lo: Option<Value>,
        hi: Option<Value>,
    ) -> Self {
        self.range = Some((column.into(), lo, hi));
        self
    }

    #[must_use]
    pub const fn with_sloppy_range(mut self, sloppy: bool) -> Self {
        self.sloppy_range = sloppy;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }

    #[must_use]
    pub fn with_translators(mut self, translators: Translators) -> Self {
        self.translators = Some(translators);
        self
    }

    #[must_use]
    pub fn on_pre_dataset(mut self, hook: impl FnMut(&Dataset) -> Verdict + 'static) -> Self {
        self.pre_dataset = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_post_dataset(mut self, hook: impl FnMut(&Dataset) -> Verdict + 'static) -> Self {
        self.post_dataset = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_pre_slice(mut self, hook: impl FnMut(&Dataset, usize) -> Verdict + 'static) -> Self {
        self.pre_slice = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_post_slice(mut self, hook: impl FnMut(&Dataset, usize) -> Verdict + 'static) -> Self {
        self.post_slice = Some(Box::new(hook));
        self
    }
}

impl Dataset {
    /// Iterates just this dataset. See [`iterate_list`] for details.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the options don't fit this dataset.
    pub fn iterate(&self, slice: SlicePick, opts: IterateOptions) -> Result<DsIterator> {
        iterate_list(vec![self.clone()], slice, opts)
    }

    /// Iterates this dataset's chain. See [`Dataset::chain`] and
    /// [`iterate_list`] for details.
    ///
    /// # Errors
    ///
    /// Returns an error when the chain cannot be walked or the options
    /// don't fit the datasets.
    pub fn iterate_chain(
        &self,
        slice: SlicePick,
        chain: &ChainOptions,
        opts: IterateOptions,
    ) -> Result<DsIterator> {
        let chain = self.chain(chain)?;
        iterate_list(chain.datasets().to_vec(), slice, opts)
    }

    /// Single-column iteration: yields the column's values instead of rows.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the options don't fit this dataset.
    pub fn iterate_values(
        &self,
        slice: SlicePick,
        column: impl Into<String>,
        opts: IterateOptions,
    ) -> Result<ValuesIter> {
        let opts = opts.with_columns([column.into()]);
        Ok(ValuesIter(self.iterate(slice, opts)?))
    }
}

/// Iterates the requested columns over `datasets` in order.
///
/// Datasets without rows are skipped; with a range, datasets whose stored
/// min/max cannot intersect the bounds are skipped outright.
///
/// # Errors
///
/// Usage errors for unknown columns, filters/translators/ranges over
/// columns that are not iterated, out-of-range slices and hashlabel
/// mismatches without `rehash`.
pub fn iterate_list(
    datasets: Vec<Dataset>,
    slice: SlicePick,
    opts: IterateOptions,
) -> Result<DsIterator> {
    build_iterator(datasets, slice, opts)
}

/// Wraps [`DsIterator`] to yield bare values for single-column iteration.
pub struct ValuesIter(DsIterator);

impl Iterator for ValuesIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.0.next()?;
        Some(row.map(|mut row| {
            debug_assert_eq!(row.len(), 1);
            row.pop().unwrap_or(Value::None)
        }))
    }
}

// ---------------------------------------------------------------------------
// Plan building

struct Entry {
    sliceno: usize,
    rehash: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RangeMode {
    Off,
    /// Check the emitted value at this column index.
    Emitted(usize),
    /// Check values from a parallel reader over the range column.
    Parallel,
}

struct Group {
    ds: Dataset,
    entries: Vec<Entry>,
    roundrobin: bool,
    range_mode: RangeMode,
}

struct RangeCheck {
    column: String,
    lo: Option<Value>,
    hi: Option<Value>,
}

impl RangeCheck {
    fn accepts(&self, value: &Value) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        if let Some(lo) = &self.lo
            && !matches!(value.partial_cmp(lo), Some(Equal | Greater))
        {
            return false;
        }
        if let Some(hi) = &self.hi
            && !matches!(value.partial_cmp(hi), Some(Less))
        {
            return false;
        }
        true
    }
}

enum ResolvedFilter {
    None,
    Row(Box<dyn FnMut(&[Value]) -> bool>),
    /// `(column index, predicate)` in column order; `None` = truthiness.
    Columns(Vec<(usize, Option<Box<dyn FnMut(&Value) -> bool>>)>),
}

struct RowOps {
    column_translators: Vec<(usize, ColumnTranslator)>,
    row_translator: Option<Box<dyn FnMut(Vec<Value>) -> Vec<Value>>>,
    filter: ResolvedFilter,
    range: Option<RangeCheck>,
}

struct Hooks {
    pre_dataset: Option<DatasetHook>,
    post_dataset: Option<DatasetHook>,
    pre_slice: Option<SliceHook>,
    post_slice: Option<SliceHook>,
}

fn column_index(columns: &[String], name: &str, what: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| {
            Error::usage(Cow::Owned(format!(
                "{what} over column {name:?} which is not iterated"
            )))
        })
}

#[allow(clippy::too_many_lines)]
fn build_iterator(
    datasets: Vec<Dataset>,
    slice: SlicePick,
    opts: IterateOptions,
) -> Result<DsIterator> {
    let IterateOptions {
        columns,
        hashlabel,
        rehash,
        range,
        sloppy_range,
        filters,
        translators,
        pre_dataset,
        post_dataset,
        pre_slice,
        post_slice,
    } = opts;

    let want: Vec<String> = match columns {
        Some(cols) => cols,
        None => datasets
            .first()
            .map(|ds| ds.columns().keys().cloned().collect())
            .unwrap_or_default(),
    };
    if !want.is_empty() {
        for ds in &datasets {
            let missing: Vec<&String> = want
                .iter()
                .filter(|c| !ds.columns().contains_key(*c))
                .collect();
            if !missing.is_empty() {
                return Err(Error::usage(Cow::Owned(format!(
                    "columns {missing:?} not found in {ds}"
                ))));
            }
        }
    }

    // A range with both bounds unset is no range at all.
    let check = range
        .filter(|(_, lo, hi)| lo.is_some() || hi.is_some())
        .map(|(column, lo, hi)| RangeCheck { column, lo, hi });

    let (row_translator, column_translators) = match translators {
        None => (None, Vec::new()),
        Some(Translators::Row(f)) => (Some(f), Vec::new()),
        Some(Translators::PerColumn(map)) => {
            let mut resolved = Vec::with_capacity(map.len());
            for (name, t) in map {
                resolved.push((column_index(&want, &name, "translator")?, t));
            }
            resolved.sort_by_key(|(ix, _)| *ix);
            (None, resolved)
        }
    };

    let filter = match filters {
        None => ResolvedFilter::None,
        Some(Filters::Row(f)) => ResolvedFilter::Row(f),
        Some(Filters::PerColumn(map)) => {
            let mut resolved = Vec::with_capacity(map.len());
            for (name, f) in map {
                let ix = column_index(&want, &name, "filter")?;
                resolved.push((
                    ix,
                    match f {
                        ColumnFilter::Truthy => None,
                        ColumnFilter::Func(f) => Some(f),
                    },
                ));
            }
            resolved.sort_by_key(|(ix, _)| *ix);
            ResolvedFilter::Columns(resolved)
        }
    };

    // The emitted value can stand in for the stored one only when nothing
    // rewrites it on the way out.
    let emitted_range_ix = check.as_ref().and_then(|rc| {
        if row_translator.is_some() {
            return None;
        }
        let ix = want.iter().position(|c| *c == rc.column)?;
        if column_translators.iter().any(|(tix, _)| *tix == ix) {
            return None;
        }
        Some(ix)
    });

    let mut groups = Vec::new();
    for ds in datasets {
        if ds.total_lines() == 0 {
            continue;
        }
        let mut range_mode = RangeMode::Off;
        if let Some(rc) = &check {
            let dc = ds.columns().get(&rc.column).ok_or_else(|| {
                Error::usage(Cow::Owned(format!(
                    "range over column {:?} missing from {ds}",
                    rc.column
                )))
            })?;
            if let (Some(min), Some(max)) = (&dc.min, &dc.max) {
                use std::cmp::Ordering::{Equal, Greater, Less};
                if let Some(hi) = &rc.hi
                    && matches!(min.partial_cmp(hi), Some(Equal | Greater))
                {
                    continue; // whole dataset at or above the range
                }
                if let Some(lo) = &rc.lo
                    && matches!(max.partial_cmp(lo), Some(Less))
                {
                    continue; // whole dataset below the range
                }
                if !sloppy_range && (!rc.accepts(min) || !rc.accepts(max)) {
                    range_mode = emitted_range_ix.map_or(RangeMode::Parallel, RangeMode::Emitted);
                }
            }
        }
        let ds_rehash = match &hashlabel {
            Some(hl) if ds.hashlabel() != Some(hl.as_str()) => {
                if !rehash {
                    return Err(Error::usage(Cow::Owned(format!(
                        "{ds} has hashlabel {:?}, not {hl:?}",
                        ds.hashlabel()
                    ))));
                }
                if !ds.columns().contains_key(hl) {
                    return Err(Error::usage(Cow::Owned(format!(
                        "can't rehash {ds} on non-existent column {hl:?}"
                    ))));
                }
                true
            }
            _ => false,
        };
        let slices = ds.workspace().slices();
        let (entries, roundrobin) = match slice {
            SlicePick::All => (
                // Slice order is not guaranteed here, so rehashing is off.
                (0..slices)
                    .map(|sliceno| Entry {
                        sliceno,
                        rehash: false,
                    })
                    .collect(),
                false,
            ),
            SlicePick::One(sliceno) => {
                if sliceno >= slices {
                    return Err(Error::usage(Cow::Owned(format!(
                        "slice {sliceno} out of range ({slices} slices)"
                    ))));
                }
                (
                    vec![Entry {
                        sliceno,
                        rehash: ds_rehash,
                    }],
                    false,
                )
            }
            SlicePick::RoundRobin => (
                (0..slices)
                    .map(|sliceno| Entry {
                        sliceno,
                        rehash: ds_rehash,
                    })
                    .collect(),
                true,
            ),
        };
        groups.push(Group {
            ds,
            entries,
            roundrobin,
            range_mode,
        });
    }

    Ok(DsIterator {
        groups: groups.into_iter(),
        state: None,
        want,
        hashlabel,
        ops: RowOps {
            column_translators,
            row_translator,
            filter,
            range: check,
        },
        hooks: Hooks {
            pre_dataset,
            post_dataset,
            pre_slice,
            post_slice,
        },
        finished: false,
    })
}

// ---------------------------------------------------------------------------
// Column streams

struct ReaderSpec {
    path: PathBuf,
    base: BaseType,
    seek: Option<u64>,
    max_count: Option<u64>,
}

fn column_specs(ds: &Dataset, column: &str, sliceno: Option<usize>) -> Result<Vec<ReaderSpec>> {
    let dc = ds
        .columns()
        .get(column)
        .ok_or_else(|| Error::usage(Cow::Owned(format!("no column {column:?} in {ds}"))))?;
    let mk = |s: usize| -> Result<ReaderSpec> {
        if let Some(offsets) = &dc.offsets {
            let seek = offsets.get(s).copied().ok_or_else(|| {
                Error::dataset(Cow::Owned(format!("{ds}: no offset for slice {s}")))
            })?;
            Ok(ReaderSpec {
                path: ds.workspace().resolve_location(&dc.location)?,
                base: dc.backing_type,
                seek: Some(seek),
                max_count: Some(ds.lines().get(s).copied().unwrap_or(0)),
            })
        } else {
            Ok(ReaderSpec {
                path: ds.column_filename(column, Some(s))?,
                base: dc.backing_type,
                seek: None,
                max_count: None,
            })
        }
    };
    match sliceno {
        Some(s) => Ok(vec![mk(s)?]),
        None => (0..ds.workspace().slices()).map(mk).collect(),
    }
}

/// Lazy values of one column over one slice or a whole dataset.
struct ColumnStream {
    specs: VecDeque<ReaderSpec>,
    current: Option<TypedReader>,
}

impl ColumnStream {
    const fn new(specs: VecDeque<ReaderSpec>) -> Self {
        Self {
            specs,
            current: None,
        }
    }

    fn next_value(&mut self) -> Option<Result<Value>> {
        loop {
            if self.current.is_none() {
                let spec = self.specs.pop_front()?;
                match TypedReader::open(&spec.path, spec.base, spec.seek, spec.max_count) {
                    Ok(reader) => self.current = Some(reader),
                    Err(err) => return Some(Err(err)),
                }
            }
            match self.current.as_mut().and_then(Iterator::next) {
                Some(item) => return Some(item),
                None => self.current = None,
            }
        }
    }
}

/// Hash predicate over one column, across a whole dataset.
struct HashStream {
    specs: VecDeque<ReaderSpec>,
    current: Option<HashFilterReader>,
    slice: usize,
    slices: usize,
}

impl HashStream {
    const fn new(specs: VecDeque<ReaderSpec>, slice: usize, slices: usize) -> Self {
        Self {
            specs,
            current: None,
            slice,
            slices,
        }
    }

    fn next_bool(&mut self) -> Option<Result<bool>> {
        loop {
            if self.current.is_none() {
                let spec = self.specs.pop_front()?;
                match HashFilterReader::open(
                    &spec.path,
                    spec.base,
                    spec.seek,
                    spec.max_count,
                    self.slice,
                    self.slices,
                ) {
                    Ok(reader) => self.current = Some(reader),
                    Err(err) => return Some(Err(err)),
                }
            }
            match self.current.as_mut().and_then(Iterator::next) {
                Some(item) => return Some(item),
                None => self.current = None,
            }
        }
    }
}

/// Parallel range-column values, rehash-filtered when the main stream is.
struct RangeStream {
    values: ColumnStream,
    hash: Option<HashStream>,
}

impl RangeStream {
    fn next_surviving(&mut self) -> Option<Result<Value>> {
        loop {
            let value = match self.values.next_value()? {
                Ok(v) => v,
                Err(err) => return Some(Err(err)),
            };
            match &mut self.hash {
                None => return Some(Ok(value)),
                Some(hash) => match hash.next_bool()? {
                    Ok(true) => return Some(Ok(value)),
                    Ok(false) => {}
                    Err(err) => return Some(Err(err)),
                },
            }
        }
    }
}

/// The per-(dataset, slice) row producer: zipped column readers plus the
/// optional rehash predicate and parallel range stream.
struct SliceRows {
    columns: Vec<ColumnStream>,
    rehash: Option<HashStream>,
    range: Option<RangeStream>,
}

impl SliceRows {
    fn open(
        ds: &Dataset,
        want: &[String],
        entry: &Entry,
        hashlabel: Option<&str>,
        range_mode: RangeMode,
        range_column: Option<&str>,
    ) -> Result<Self> {
        // Rehashing reads the whole dataset and keeps the rows that hash to
        // the target slice; otherwise only the entry's slice is read.
        let read_slice = if entry.rehash {
            None
        } else {
            Some(entry.sliceno)
        };
        let slices = ds.workspace().slices();
        let mut columns = Vec::with_capacity(want.len());
        for column in want {
            columns.push(ColumnStream::new(
                column_specs(ds, column, read_slice)?.into(),
            ));
        }
        let rehash = match (entry.rehash, hashlabel) {
            (true, Some(hl)) => Some(HashStream::new(
                column_specs(ds, hl, None)?.into(),
                entry.sliceno,
                slices,
            )),
            _ => None,
        };
        let range = match (range_mode, range_column) {
            (RangeMode::Parallel, Some(column)) => Some(RangeStream {
                values: ColumnStream::new(column_specs(ds, column, read_slice)?.into()),
                hash: match (entry.rehash, hashlabel) {
                    (true, Some(hl)) => Some(HashStream::new(
                        column_specs(ds, hl, None)?.into(),
                        entry.sliceno,
                        slices,
                    )),
                    _ => None,
                },
            }),
            _ => None,
        };
        Ok(Self {
            columns,
            rehash,
            range,
        })
    }

    /// The next row surviving the rehash filter, untranslated.
    fn next_row(&mut self) -> Option<Result<Vec<Value>>> {
        if self.columns.is_empty() {
            return None;
        }
        loop {
            let mut row = Vec::with_capacity(self.columns.len());
            for column in &mut self.columns {
                match column.next_value() {
                    None => return None,
                    Some(Ok(value)) => row.push(value),
                    Some(Err(err)) => return Some(Err(err)),
                }
            }
            match &mut self.rehash {
                None => return Some(Ok(row)),
                Some(hash) => match hash.next_bool() {
                    None => return None,
                    Some(Ok(true)) => return Some(Ok(row)),
                    Some(Ok(false)) => {}
                    Some(Err(err)) => return Some(Err(err)),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The driver

enum GroupMode {
    Seq {
        entries: VecDeque<Entry>,
        current: Option<(usize, SliceRows)>,
    },
    RoundRobin {
        streams: VecDeque<(usize, SliceRows)>,
    },
}

struct GroupState {
    ds: Dataset,
    mode: GroupMode,
    range_mode: RangeMode,
    skipped: bool,
}

/// Lazy row iterator over a plan of datasets and slices.
///
/// Yields `Err` once and stops if a column file fails mid-read.
pub struct DsIterator {
    groups: std::vec::IntoIter<Group>,
    state: Option<GroupState>,
    want: Vec<String>,
    hashlabel: Option<String>,
    ops: RowOps,
    hooks: Hooks,
    finished: bool,
}

/// Runs a row through translators, the range check and filters.
/// `Ok(None)` means the row was dropped.
fn process_row(
    mut row: Vec<Value>,
    range_mode: RangeMode,
    rows: &mut SliceRows,
    ops: &mut RowOps,
) -> Result<Option<Vec<Value>>> {
    for (ix, translator) in &mut ops.column_translators {
        let value = std::mem::replace(&mut row[*ix], Value::None);
        row[*ix] = translator.apply(value);
    }
    if let Some(translate) = &mut ops.row_translator {
        row = translate(row);
    }
    match range_mode {
        RangeMode::Off => {}
        RangeMode::Emitted(ix) => {
            let check = ops.range.as_ref().ok_or_else(|| {
                Error::usage("range check armed without a range")
            })?;
            if !row.get(ix).is_some_and(|v| check.accepts(v)) {
                return Ok(None);
            }
        }
        RangeMode::Parallel => {
            let check = ops.range.as_ref().ok_or_else(|| {
                Error::usage("range check armed without a range")
            })?;
            let value = match rows.range.as_mut().and_then(RangeStream::next_surviving) {
                Some(Ok(v)) => v,
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(Error::dataset(
                        "range column ended before the iterated columns",
                    ));
                }
            };
            if !check.accepts(&value) {
                return Ok(None);
            }
        }
    }
    let passes = match &mut ops.filter {
        ResolvedFilter::None => true,
        ResolvedFilter::Row(f) => f(&row),
        ResolvedFilter::Columns(list) => list.iter_mut().all(|(ix, f)| {
            row.get(*ix).is_some_and(|v| match f {
                Some(f) => f(v),
                None => v.is_truthy(),
            })
        }),
    };
    Ok(if passes { Some(row) } else { None })
}

impl DsIterator {
    fn fire_pre_dataset(hooks: &mut Hooks, ds: &Dataset) -> Verdict {
        hooks
            .pre_dataset
            .as_mut()
            .map_or(Verdict::Continue, |hook| hook(ds))
    }

    fn fire_post_dataset(hooks: &mut Hooks, ds: &Dataset) -> Verdict {
        hooks
            .post_dataset
            .as_mut()
            .map_or(Verdict::Continue, |hook| hook(ds))
    }

    fn fire_pre_slice(hooks: &mut Hooks, ds: &Dataset, sliceno: usize) -> Verdict {
        hooks
            .pre_slice
            .as_mut()
            .map_or(Verdict::Continue, |hook| hook(ds, sliceno))
    }

    fn fire_post_slice(hooks: &mut Hooks, ds: &Dataset, sliceno: usize) -> Verdict {
        hooks
            .post_slice
            .as_mut()
            .map_or(Verdict::Continue, |hook| hook(ds, sliceno))
    }

    /// Enters the next group, firing hooks and opening round-robin streams.
    fn enter_group(&mut self, group: Group) -> Result<Option<GroupState>> {
        match Self::fire_pre_dataset(&mut self.hooks, &group.ds) {
            Verdict::Continue => {}
            Verdict::SkipSlice | Verdict::SkipJob => return Ok(None),
            Verdict::Stop => {
                self.finished = true;
                return Ok(None);
            }
        }
        let mode = if group.roundrobin {
            let mut streams = VecDeque::with_capacity(group.entries.len());
            for entry in &group.entries {
                match Self::fire_pre_slice(&mut self.hooks, &group.ds, entry.sliceno) {
                    Verdict::Continue => {}
                    Verdict::SkipSlice => continue,
                    Verdict::SkipJob => {
                        streams.clear();
                        return Ok(Some(GroupState {
                            ds: group.ds,
                            mode: GroupMode::RoundRobin { streams },
                            range_mode: group.range_mode,
                            skipped: true,
                        }));
                    }
                    Verdict::Stop => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
                let rows = SliceRows::open(
                    &group.ds,
                    &self.want,
                    entry,
                    self.hashlabel.as_deref(),
                    group.range_mode,
                    self.ops.range.as_ref().map(|rc| rc.column.as_str()),
                )?;
                streams.push_back((entry.sliceno, rows));
            }
            GroupMode::RoundRobin { streams }
        } else {
            GroupMode::Seq {
                entries: group.entries.into(),
                current: None,
            }
        };
        Ok(Some(GroupState {
            ds: group.ds,
            mode,
            range_mode: group.range_mode,
            skipped: false,
        }))
    }

    fn next_inner(&mut self) -> Result<Option<Vec<Value>>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.state.is_none() {
                let Some(group) = self.groups.next() else {
                    self.finished = true;
                    return Ok(None);
                };
                self.state = self.enter_group(group)?;
                continue;
            }
            let state = self.state.as_mut().ok_or_else(|| {
                Error::usage("iterator state lost")
            })?;
            match &mut state.mode {
                GroupMode::Seq { entries, current } => {
                    if current.is_none() {
                        let Some(entry) = entries.pop_front() else {
                            // Dataset done; a SkipJob-skipped dataset gets
                            // no post hook.
                            let ds = state.ds.clone();
                            let skipped = state.skipped;
                            self.state = None;
                            if !skipped
                                && Self::fire_post_dataset(&mut self.hooks, &ds) == Verdict::Stop
                            {
                                self.finished = true;
                                return Ok(None);
                            }
                            continue;
                        };
                        match Self::fire_pre_slice(&mut self.hooks, &state.ds, entry.sliceno) {
                            Verdict::Continue => {}
                            Verdict::SkipSlice => continue,
                            Verdict::SkipJob => {
                                entries.clear();
                                state.skipped = true;
                                continue;
                            }
                            Verdict::Stop => {
                                self.finished = true;
                                return Ok(None);
                            }
                        }
                        let rows = SliceRows::open(
                            &state.ds,
                            &self.want,
                            &entry,
                            self.hashlabel.as_deref(),
                            state.range_mode,
                            self.ops.range.as_ref().map(|rc| rc.column.as_str()),
                        )?;
                        *current = Some((entry.sliceno, rows));
                    }
                    let (sliceno, rows) = current.as_mut().ok_or_else(|| {
                        Error::usage("iterator state lost")
                    })?;
                    match rows.next_row() {
                        Some(Ok(row)) => {
                            if let Some(row) =
                                process_row(row, state.range_mode, rows, &mut self.ops)?
                            {
                                return Ok(Some(row));
                            }
                        }
                        Some(Err(err)) => return Err(err),
                        None => {
                            let sliceno = *sliceno;
                            *current = None;
                            if Self::fire_post_slice(&mut self.hooks, &state.ds, sliceno)
                                == Verdict::Stop
                            {
                                self.finished = true;
                                return Ok(None);
                            }
                        }
                    }
                }
                GroupMode::RoundRobin { streams } => {
                    // One surviving row from the front stream, then rotate.
                    let Some((sliceno, mut rows)) = streams.pop_front() else {
                        let ds = state.ds.clone();
                        let skipped = state.skipped;
                        self.state = None;
                        if !skipped
                            && Self::fire_post_dataset(&mut self.hooks, &ds) == Verdict::Stop
                        {
                            self.finished = true;
                            return Ok(None);
                        }
                        continue;
                    };
                    loop {
                        match rows.next_row() {
                            Some(Ok(row)) => {
                                match process_row(row, state.range_mode, &mut rows, &mut self.ops)?
                                {
                                    Some(row) => {
                                        streams.push_back((sliceno, rows));
                                        return Ok(Some(row));
                                    }
                                    None => {}
                                }
                            }
                            Some(Err(err)) => return Err(err),
                            None => {
                                if Self::fire_post_slice(&mut self.hooks, &state.ds, sliceno)
                                    == Verdict::Stop
                                {
                                    self.finished = true;
                                    return Ok(None);
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Iterator for DsIterator {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_inner() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
