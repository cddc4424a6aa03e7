//! The dataset writer: declares columns, routes rows to slices, and turns
//! the result into an immutable dataset at `finish`.
//!
//! Two mutually exclusive modes exist. Per-slice mode (`set_slice`) writes
//! one slice at a time and verifies via the hashlabel's hashfilter that
//! every row belongs in that slice. Split mode (`split_write*`) writes on
//! behalf of all slices at once, routing each row by the hashlabel's hash,
//! or round-robin without one. Either way the same three write surfaces
//! exist: positional tuples, value slices, and name-keyed maps.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::codec::{ColumnStats, TypedWriter};
use crate::dataset::{
    Dataset, DsColumn, DsData, METADATA_VERSION, Parent, append_dataset_log, save,
    update_chain_cache,
};
use crate::error::{Error, Result};
use crate::id::{DsId, JobId};
use crate::types::ColType;
use crate::value::Value;
use crate::workspace::Workspace;

/// Columns whose mean per-slice file size is at or below this are merged
/// into one file with recorded offsets.
pub(crate) const MERGE_THRESHOLD: u64 = 524_288;

/// Names that cannot be used as column files on common filesystems.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Derives a filesystem-safe column file name, unique case-insensitively
/// within `seen`.
fn clean_name(name: &str, seen: &mut HashSet<String>) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    // Lowercased because filenames are based on these and the filesystem
    // might not be case sensitive.
    while seen.contains(&cleaned.to_lowercase())
        || RESERVED_NAMES.contains(&cleaned.to_lowercase().as_str())
    {
        cleaned.push('_');
    }
    seen.insert(cleaned.to_lowercase());
    cleaned
}

/// Positional write source; implemented for tuples of convertible values.
pub trait IntoRow {
    fn append_to(self, out: &mut Vec<Value>);
}

macro_rules! impl_into_row {
    ($($field:ident),+) => {
        impl<$($field: Into<Value>),+> IntoRow for ($($field,)+) {
            fn append_to(self, out: &mut Vec<Value>) {
                #[allow(non_snake_case)]
                let ($($field,)+) = self;
                $(out.push($field.into());)+
            }
        }
    };
}

impl_into_row!(A);
impl_into_row!(A, B);
impl_into_row!(A, B, C);
impl_into_row!(A, B, C, D);
impl_into_row!(A, B, C, D, E);
impl_into_row!(A, B, C, D, E, F);
impl_into_row!(A, B, C, D, E, F, G);
impl_into_row!(A, B, C, D, E, F, G, H);
impl_into_row!(A, B, C, D, E, F, G, H, I);
impl_into_row!(A, B, C, D, E, F, G, H, I, J);
impl_into_row!(A, B, C, D, E, F, G, H, I, J, K);
impl_into_row!(A, B, C, D, E, F, G, H, I, J, K, L);

impl IntoRow for Vec<Value> {
    fn append_to(self, out: &mut Vec<Value>) {
        out.extend(self);
    }
}

/// Construction options for [`DatasetWriter::create`].
#[derive(Default)]
pub struct DatasetWriterOptions {
    name: Option<String>,
    columns: BTreeMap<String, ColType>,
    filename: Option<String>,
    hashlabel: Option<String>,
    hashlabel_override: bool,
    caption: Option<String>,
    previous: Option<DsId>,
    parent: Option<DsId>,
    meta_only: bool,
}

impl DatasetWriterOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset name; defaults to `default`.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Seeds columns (without defaults); added in name order at creation.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, coltype: ColType) -> Self {
        self.columns.insert(name.into(), coltype);
        self
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_hashlabel(mut self, hashlabel: impl Into<String>) -> Self {
        self.hashlabel = Some(hashlabel.into());
        self
    }

    /// With a `parent`, replace its hashlabel instead of requiring a match.
    #[must_use]
    pub const fn with_hashlabel_override(mut self, hashlabel_override: bool) -> Self {
        self.hashlabel_override = hashlabel_override;
        self
    }

    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    #[must_use]
    pub fn with_previous(mut self, previous: DsId) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Extend `parent` with this writer's columns instead of building a
    /// free-standing dataset.
    #[must_use]
    pub fn with_parent(mut self, parent: DsId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// No row files are written; the caller places column files itself and
    /// reports counts via `set_lines` (and optionally `set_minmax`).
    #[must_use]
    pub const fn with_meta_only(mut self, meta_only: bool) -> Self {
        self.meta_only = meta_only;
        self
    }
}

struct ColumnSpec {
    name: String,
    coltype: ColType,
    default: Option<Value>,
    clean: String,
}

enum WriterState {
    /// Columns may still be added; no mode picked.
    Fresh,
    /// Per-slice mode; `writers` is empty for meta-only writers.
    Sliced {
        sliceno: usize,
        writers: Vec<TypedWriter>,
    },
    /// Split mode; one writer per (slice, column).
    Split { all: Vec<Vec<TypedWriter>> },
}

/// Builds one dataset. Consumed by [`DatasetWriter::finish`] or
/// [`DatasetWriter::discard`].
pub struct DatasetWriter {
    ws: Workspace,
    id: DsId,
    dir: PathBuf,
    filename: Option<String>,
    hashlabel: Option<String>,
    hashlabel_override: bool,
    caption: Option<String>,
    previous: Option<DsId>,
    parent: Option<DsId>,
    meta_only: bool,
    columns: Vec<ColumnSpec>,
    by_name: HashMap<String, usize>,
    seen_clean: HashSet<String>,
    parent_columns: BTreeMap<String, DsColumn>,
    state: WriterState,
    discard_wrong_slice: bool,
    lens: HashMap<usize, u64>,
    minmax: HashMap<usize, HashMap<String, (Option<Value>, Option<Value>)>>,
    robin: usize,
    scratch: Vec<Value>,
}

impl DatasetWriter {
    /// Creates the dataset directory and a fresh writer for it.
    ///
    /// # Errors
    ///
    /// Usage errors for bad or duplicate names and unresolvable parents.
    pub fn create(ws: &Workspace, job: &JobId, opts: DatasetWriterOptions) -> Result<Self> {
        let name = opts.name.unwrap_or_else(|| DsId::DEFAULT_NAME.to_owned());
        let id = DsId::new(job.clone(), name)?;
        let dir = ws.job_dir(job).join(id.name());
        if dir.exists() {
            return Err(Error::usage(Cow::Owned(format!(
                "duplicate dataset name {:?}",
                id.name()
            ))));
        }
        fs::create_dir_all(&dir)?;
        let (parent_columns, seen_clean) = match &opts.parent {
            Some(parent_id) => {
                let parent = Dataset::open(ws, parent_id)?;
                let seen = parent
                    .columns()
                    .values()
                    .map(|dc| dc.name.to_lowercase())
                    .collect();
                (parent.columns().clone(), seen)
            }
            None => (BTreeMap::new(), HashSet::new()),
        };
        let mut writer = Self {
            ws: ws.clone(),
            id,
            dir,
            filename: opts.filename,
            hashlabel: opts.hashlabel,
            hashlabel_override: opts.hashlabel_override,
            caption: opts.caption,
            previous: opts.previous,
            parent: opts.parent,
            meta_only: opts.meta_only,
            columns: Vec::new(),
            by_name: HashMap::new(),
            seen_clean,
            parent_columns,
            state: WriterState::Fresh,
            discard_wrong_slice: false,
            lens: HashMap::new(),
            minmax: HashMap::new(),
            robin: 0,
            scratch: Vec::new(),
        };
        for (colname, coltype) in opts.columns {
            writer.add(colname, coltype)?;
        }
        Ok(writer)
    }

    #[must_use]
    pub const fn id(&self) -> &DsId {
        &self.id
    }

    #[must_use]
    pub fn hashlabel(&self) -> Option<&str> {
        self.hashlabel.as_deref()
    }

    /// Declares a column. All columns must be added before the first write
    /// or slice choice.
    ///
    /// # Errors
    ///
    /// Usage errors for duplicate/empty names or after writing started.
    pub fn add(&mut self, colname: impl Into<String>, coltype: ColType) -> Result<()> {
        self.add_impl(colname.into(), coltype, None)
    }

    /// Declares a column with a default written in place of rejected values.
    ///
    /// # Errors
    ///
    /// Same as [`DatasetWriter::add`].
    pub fn add_default(
        &mut self,
        colname: impl Into<String>,
        coltype: ColType,
        default: Value,
    ) -> Result<()> {
        self.add_impl(colname.into(), coltype, Some(default))
    }

    fn add_impl(&mut self, colname: String, coltype: ColType, default: Option<Value>) -> Result<()> {
        if !matches!(self.state, WriterState::Fresh) {
            return Err(Error::usage("add all columns before writing or set_slice"));
        }
        if colname.is_empty() {
            return Err(Error::usage("empty column name"));
        }
        if self.by_name.contains_key(&colname) {
            return Err(Error::usage(Cow::Owned(format!(
                "duplicate column {colname:?}"
            ))));
        }
        let clean = match self.parent_columns.get(&colname) {
            Some(parent_col) => parent_col.name.clone(),
            None => clean_name(&colname, &mut self.seen_clean),
        };
        self.by_name.insert(colname.clone(), self.columns.len());
        self.columns.push(ColumnSpec {
            name: colname,
            coltype,
            default,
            clean,
        });
        Ok(())
    }

    /// The file this writer puts a column's data in, for `sliceno` or the
    /// currently set slice.
    ///
    /// # Errors
    ///
    /// Usage errors for unknown columns or when no slice is picked.
    pub fn column_filename(&self, colname: &str, sliceno: Option<usize>) -> Result<PathBuf> {
        let ix = *self.by_name.get(colname).ok_or_else(|| {
            Error::usage(Cow::Owned(format!("no column {colname:?} in writer")))
        })?;
        let sliceno = match (sliceno, &self.state) {
            (Some(s), _) => s,
            (None, WriterState::Sliced { sliceno, .. }) => *sliceno,
            (None, _) => {
                return Err(Error::usage("no slice picked; pass sliceno explicitly"));
            }
        };
        Ok(self.slice_file(sliceno, &self.columns[ix].clean))
    }

    fn slice_file(&self, sliceno: usize, clean: &str) -> PathBuf {
        self.dir.join(format!("{sliceno}.{clean}"))
    }

    fn open_writers(&self, sliceno: usize, filtered: bool) -> Result<Vec<TypedWriter>> {
        if self.columns.is_empty() {
            return Err(Error::usage("no columns in dataset"));
        }
        if let Some(hl) = &self.hashlabel
            && !self.by_name.contains_key(hl)
        {
            return Err(Error::usage(Cow::Owned(format!(
                "hashed column ({hl}) missing"
            ))));
        }
        let mut writers = Vec::with_capacity(self.columns.len());
        for spec in &self.columns {
            let hashfilter = if filtered && Some(spec.name.as_str()) == self.hashlabel.as_deref() {
                Some((sliceno, self.ws.slices()))
            } else {
                None
            };
            writers.push(TypedWriter::create(
                &self.slice_file(sliceno, &spec.clean),
                spec.coltype,
                spec.default.clone(),
                hashfilter,
            )?);
        }
        Ok(writers)
    }

    fn record_closed(&mut self, sliceno: usize, writers: Vec<TypedWriter>) -> Result<()> {
        let mut stats: Vec<(String, ColumnStats)> = Vec::with_capacity(writers.len());
        for (spec, writer) in self.columns.iter().zip(writers) {
            stats.push((spec.name.clone(), writer.close()?));
        }
        let counts: HashSet<u64> = stats.iter().map(|(_, st)| st.count).collect();
        if counts.len() > 1 {
            let by_column: Vec<(&str, u64)> = stats
                .iter()
                .map(|(name, st)| (name.as_str(), st.count))
                .collect();
            return Err(Error::usage(Cow::Owned(format!(
                "not all columns have the same linecount in slice {sliceno}: {by_column:?}"
            ))));
        }
        let minmax = stats
            .into_iter()
            .map(|(name, st)| (name, (st.min, st.max)))
            .collect();
        self.lens
            .insert(sliceno, counts.into_iter().next().unwrap_or(0));
        self.minmax.insert(sliceno, minmax);
        Ok(())
    }

    fn close_open_writers(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, WriterState::Fresh) {
            WriterState::Fresh => Ok(()),
            WriterState::Sliced { sliceno, writers } => {
                if !self.meta_only {
                    self.record_closed(sliceno, writers)?;
                }
                Ok(())
            }
            WriterState::Split { all } => {
                for (sliceno, writers) in all.into_iter().enumerate() {
                    self.record_closed(sliceno, writers)?;
                }
                Ok(())
            }
        }
    }

    /// Enters per-slice mode, closing any previously set slice. The
    /// hashlabel column's writer verifies that written rows belong here.
    ///
    /// # Errors
    ///
    /// Usage errors after a split writer was used or for a bad slice.
    pub fn set_slice(&mut self, sliceno: usize) -> Result<()> {
        if matches!(self.state, WriterState::Split { .. }) {
            return Err(Error::usage("don't use both set_slice and a split writer"));
        }
        if sliceno >= self.ws.slices() {
            return Err(Error::usage(Cow::Owned(format!(
                "slice {sliceno} out of range ({} slices)",
                self.ws.slices()
            ))));
        }
        self.close_open_writers()?;
        self.discard_wrong_slice = false;
        let writers = if self.meta_only {
            Vec::new()
        } else {
            self.open_writers(sliceno, true)?
        };
        self.state = WriterState::Sliced { sliceno, writers };
        Ok(())
    }

    /// Makes the per-slice write functions silently discard rows that do
    /// not hash to the current slice.
    ///
    /// # Errors
    ///
    /// Usage errors without a hashlabel or before `set_slice`.
    pub fn enable_hash_discard(&mut self) -> Result<()> {
        if self.hashlabel.is_none() {
            return Err(Error::usage("can't enable hash discard without hashlabel"));
        }
        if !matches!(self.state, WriterState::Sliced { .. }) {
            return Err(Error::usage("call enable_hash_discard after set_slice"));
        }
        self.discard_wrong_slice = true;
        Ok(())
    }

    /// Whether `value` belongs in the currently set slice.
    ///
    /// # Errors
    ///
    /// Usage errors outside per-slice mode or without a hashlabel.
    pub fn hashcheck(&self, value: &Value) -> Result<bool> {
        let WriterState::Sliced { writers, .. } = &self.state else {
            return Err(Error::usage("hashcheck needs set_slice first"));
        };
        let hl = self
            .hashlabel
            .as_deref()
            .ok_or_else(|| Error::usage("hashcheck without hashlabel"))?;
        let ix = self.by_name[hl];
        writers
            .get(ix)
            .ok_or_else(|| Error::usage("hashcheck on a meta-only writer"))?
            .hashcheck(value)
    }

    /// Positional write (per-slice mode): values in add order.
    ///
    /// # Errors
    ///
    /// See [`DatasetWriter::write_list`].
    pub fn write<R: IntoRow>(&mut self, row: R) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        row.append_to(&mut scratch);
        let result = self.write_values(&scratch);
        self.scratch = scratch;
        result
    }

    /// Sequence write (per-slice mode): values in add order.
    ///
    /// # Errors
    ///
    /// Usage errors before `set_slice`, on arity mismatch, on rejected
    /// values without a default, and on rows that hash to another slice
    /// (unless hash discard is enabled).
    pub fn write_list(&mut self, values: &[Value]) -> Result<()> {
        self.write_values(values)
    }

    /// Mapping write (per-slice mode): values keyed by column name.
    ///
    /// # Errors
    ///
    /// See [`DatasetWriter::write_list`]; also for missing keys.
    pub fn write_dict(&mut self, values: &HashMap<String, Value>) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let fill = Self::order_dict(&self.columns, values, &mut scratch);
        let result = fill.and_then(|()| self.write_values(&scratch));
        self.scratch = scratch;
        result
    }

    fn order_dict(
        columns: &[ColumnSpec],
        values: &HashMap<String, Value>,
        out: &mut Vec<Value>,
    ) -> Result<()> {
        for spec in columns {
            let value = values.get(&spec.name).ok_or_else(|| {
                Error::usage(Cow::Owned(format!("no value for column {:?}", spec.name)))
            })?;
            out.push(value.clone());
        }
        Ok(())
    }

    fn write_values(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::usage(Cow::Owned(format!(
                "row has {} values, dataset has {} columns",
                values.len(),
                self.columns.len()
            ))));
        }
        let hashlabel_ix = self
            .hashlabel
            .as_deref()
            .and_then(|hl| self.by_name.get(hl).copied());
        let WriterState::Sliced { writers, .. } = &mut self.state else {
            return Err(Error::usage(
                "write needs set_slice first (or use a split writer)",
            ));
        };
        if writers.is_empty() {
            return Err(Error::usage("meta-only writers don't write rows"));
        }
        if let Some(hix) = hashlabel_ix {
            if writers[hix].write(&values[hix])? {
                for (ix, writer) in writers.iter_mut().enumerate() {
                    if ix != hix {
                        writer.write(&values[ix])?;
                    }
                }
            } else if !self.discard_wrong_slice {
                return Err(Error::usage("attempted to write data for wrong slice"));
            }
        } else {
            for (writer, value) in writers.iter_mut().zip(values) {
                writer.write(value)?;
            }
        }
        Ok(())
    }

    fn ensure_split(&mut self) -> Result<()> {
        match self.state {
            WriterState::Split { .. } => Ok(()),
            WriterState::Sliced { .. } => {
                Err(Error::usage("don't use both a split writer and set_slice"))
            }
            WriterState::Fresh => {
                if self.meta_only {
                    return Err(Error::usage("meta-only writers don't write rows"));
                }
                let all = (0..self.ws.slices())
                    .map(|sliceno| self.open_writers(sliceno, false))
                    .collect::<Result<Vec<_>>>()?;
                self.state = WriterState::Split { all };
                Ok(())
            }
        }
    }

    /// Positional split write: routes the row to its slice by hashlabel
    /// hash, or round-robin without one.
    ///
    /// # Errors
    ///
    /// See [`DatasetWriter::split_write_list`].
    pub fn split_write<R: IntoRow>(&mut self, row: R) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        row.append_to(&mut scratch);
        let result = self.split_write_values(&scratch);
        self.scratch = scratch;
        result
    }

    /// Sequence split write.
    ///
    /// # Errors
    ///
    /// Usage errors after `set_slice`, on arity mismatch, and on rejected
    /// values without a default.
    pub fn split_write_list(&mut self, values: &[Value]) -> Result<()> {
        self.split_write_values(values)
    }

    /// Mapping split write.
    ///
    /// # Errors
    ///
    /// See [`DatasetWriter::split_write_list`]; also for missing keys.
    pub fn split_write_dict(&mut self, values: &HashMap<String, Value>) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let fill = Self::order_dict(&self.columns, values, &mut scratch);
        let result = fill.and_then(|()| self.split_write_values(&scratch));
        self.scratch = scratch;
        result
    }

    fn split_write_values(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(Error::usage(Cow::Owned(format!(
                "row has {} values, dataset has {} columns",
                values.len(),
                self.columns.len()
            ))));
        }
        self.ensure_split()?;
        let slices = self.ws.slices();
        let hashlabel_ix = self
            .hashlabel
            .as_deref()
            .and_then(|hl| self.by_name.get(hl).copied());
        let sliceno = match hashlabel_ix {
            Some(hix) => {
                let WriterState::Split { all } = &self.state else {
                    return Err(Error::usage("split writers not open"));
                };
                #[allow(clippy::cast_possible_truncation)]
                let routed = (all[0][hix].hash(&values[hix])? % slices as u64) as usize;
                routed
            }
            None => {
                let sliceno = self.robin;
                self.robin = (self.robin + 1) % slices;
                sliceno
            }
        };
        let WriterState::Split { all } = &mut self.state else {
            return Err(Error::usage("split writers not open"));
        };
        for (writer, value) in all[sliceno].iter_mut().zip(values) {
            writer.write(value)?;
        }
        Ok(())
    }

    /// Reports a slice's row count for a meta-only writer.
    ///
    /// # Errors
    ///
    /// Usage error for writers that actually write.
    pub fn set_lines(&mut self, sliceno: usize, count: u64) -> Result<()> {
        if !self.meta_only {
            return Err(Error::usage(
                "don't set lines for writers that actually write",
            ));
        }
        self.lens.insert(sliceno, count);
        Ok(())
    }

    /// Reports a slice's per-column extremes for a meta-only writer.
    ///
    /// # Errors
    ///
    /// Usage error for writers that actually write.
    pub fn set_minmax(
        &mut self,
        sliceno: usize,
        minmax: HashMap<String, (Option<Value>, Option<Value>)>,
    ) -> Result<()> {
        if !self.meta_only {
            return Err(Error::usage(
                "don't set minmax for writers that actually write",
            ));
        }
        self.minmax.insert(sliceno, minmax);
        Ok(())
    }

    /// Removes the partial dataset and aborts the build.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset directory cannot be removed.
    pub fn discard(mut self) -> Result<()> {
        self.close_open_writers()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    fn merged_minmax(&self) -> HashMap<String, (Value, Value)> {
        let mut merged: HashMap<String, (Value, Value)> = HashMap::new();
        for per_slice in self.minmax.values() {
            for (name, (min, max)) in per_slice {
                let (Some(min), Some(max)) = (min, max) else {
                    continue;
                };
                merged
                    .entry(name.clone())
                    .and_modify(|(cur_min, cur_max)| {
                        *cur_min = cur_min.clone().min_with(min.clone());
                        *cur_max = cur_max.clone().max_with(max.clone());
                    })
                    .or_insert_with(|| (min.clone(), max.clone()));
            }
        }
        merged
    }

    /// Closes all writers, verifies counts, merges small slices and writes
    /// the metadata record. Returns the finished dataset.
    ///
    /// # Errors
    ///
    /// Usage errors for missing slices, uneven column counts, and parent
    /// line-count/hashlabel mismatches.
    pub fn finish(mut self) -> Result<Dataset> {
        self.close_open_writers()?;
        let slices = self.ws.slices();
        let missing: Vec<usize> = (0..slices).filter(|s| !self.lens.contains_key(s)).collect();
        if !missing.is_empty() {
            return Err(Error::usage(Cow::Owned(format!(
                "not all slices written, missing {missing:?}"
            ))));
        }
        let lines: Vec<u64> = (0..slices).map(|s| self.lens[&s]).collect();
        let minmax = self.merged_minmax();
        let job = self.id.job().clone();

        let mut data = match &self.parent {
            Some(parent_id) => {
                let parent = Dataset::open(&self.ws, parent_id)?;
                if !self.hashlabel_override
                    && let Some(hl) = &self.hashlabel
                    && parent.hashlabel() != Some(hl.as_str())
                {
                    return Err(Error::usage(Cow::Owned(format!(
                        "hashlabel mismatch {:?} != {:?}",
                        parent.hashlabel(),
                        hl
                    ))));
                }
                if parent.lines() != lines.as_slice() {
                    return Err(Error::usage(
                        "new columns don't have the same number of lines as parent columns",
                    ));
                }
                let mut data = parent.data().clone();
                if self.hashlabel_override {
                    data.hashlabel = self.hashlabel.clone();
                }
                data.parent = Some(Parent::Single(parent_id.clone()));
                data.filename = self.filename.clone().or(data.filename);
                data.caption = self
                    .caption
                    .clone()
                    .or(data.caption)
                    .or_else(|| Some(job.as_str().to_owned()));
                data
            }
            None => DsData {
                version: METADATA_VERSION,
                filename: self.filename.clone(),
                hashlabel: self.hashlabel.clone(),
                caption: Some(
                    self.caption
                        .clone()
                        .unwrap_or_else(|| job.as_str().to_owned()),
                ),
                columns: BTreeMap::new(),
                previous: None,
                parent: None,
                lines: Vec::new(),
                cache: None,
                cache_distance: None,
            },
        };
        data.previous = self.previous.clone();
        data.lines = lines;

        for spec in &self.columns {
            let (min, max) = minmax
                .get(&spec.name)
                .map_or((None, None), |(min, max)| (Some(min.clone()), Some(max.clone())));
            data.columns.insert(
                spec.name.clone(),
                DsColumn {
                    ty: spec.coltype.base,
                    backing_type: spec.coltype.base,
                    name: spec.clean.clone(),
                    location: format!("{job}/{}/%s.{}", self.id.name(), spec.clean),
                    min,
                    max,
                    offsets: None,
                },
            );
        }

        // Small-slice merge, per new column; columns are independent.
        let merges: Vec<(String, Option<Vec<u64>>)> = self
            .columns
            .par_iter()
            .map(|spec| {
                let merged = maybe_merge(&self.dir, &spec.clean, slices)?;
                Ok((spec.name.clone(), merged))
            })
            .collect::<Result<Vec<_>>>()?;
        for (name, merged) in merges {
            if let Some(offsets) = merged
                && let Some(dc) = data.columns.get_mut(&name)
            {
                dc.location = dc.location.replacen("%s", "m", 1);
                dc.offsets = Some(offsets);
            }
        }

        update_chain_cache(&self.ws, &mut data)?;
        save(&self.ws, &self.id, &data)?;
        append_dataset_log(&self.ws, &self.id)?;
        Dataset::open(&self.ws, &self.id)
    }
}

/// Concatenates a column's slice files into one `m.`-file when the mean
/// slice size is at or below [`MERGE_THRESHOLD`]. Returns the recorded
/// offsets, or `None` when the column stays sliced.
fn maybe_merge(dir: &Path, clean: &str, slices: usize) -> Result<Option<Vec<u64>>> {
    if slices < 2 {
        return Ok(None);
    }
    let paths: Vec<PathBuf> = (0..slices)
        .map(|s| dir.join(format!("{s}.{clean}")))
        .collect();
    let mut sizes = Vec::with_capacity(slices);
    for path in &paths {
        sizes.push(fs::metadata(path)?.len());
    }
    #[allow(clippy::cast_precision_loss)]
    if sizes.iter().sum::<u64>() as f64 / slices as f64 > MERGE_THRESHOLD as f64 {
        return Ok(None);
    }
    let merged_path = dir.join(format!("m.{clean}"));
    let mut merged = fs::File::create(&merged_path)?;
    let mut offsets = Vec::with_capacity(slices);
    let mut pos = 0u64;
    for (path, size) in paths.iter().zip(&sizes) {
        let copied = io::copy(&mut fs::File::open(path)?, &mut merged)?;
        if copied != *size {
            return Err(Error::dataset(Cow::Owned(format!(
                "slice file {} is {copied} bytes, not {size}",
                path.display()
            ))));
        }
        offsets.push(pos);
        pos += size;
        fs::remove_file(path)?;
    }
    Ok(Some(offsets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_names_are_filesystem_safe_and_unique() {
        let mut seen = HashSet::new();
        assert_eq!(clean_name("plain", &mut seen), "plain");
        assert_eq!(clean_name("has space", &mut seen), "has_space");
        assert_eq!(clean_name("has_space", &mut seen), "has_space_");
        assert_eq!(clean_name("HAS SPACE", &mut seen), "HAS_SPACE__");
        assert_eq!(clean_name("7digits", &mut seen), "_7digits");
        assert_eq!(clean_name("nul", &mut seen), "nul_");
    }

    #[test]
    fn tuple_rows_convert_in_order() {
        let mut out = Vec::new();
        (1i64, "x", 2.5f64).append_to(&mut out);
        assert_eq!(
            out,
            vec![Value::Int(1), Value::Str("x".into()), Value::Float(2.5)]
        );
    }
}
