//! The dataset metadata record and the read-side handle.
//!
//! A dataset is identified by `(job, name)` and persisted as
//! `<job>/<name>/dataset.json` next to its column files, with a
//! human-readable `dataset.txt` beside it. Records are immutable once
//! written; a process-wide memoization keeps loaded records so chain walks
//! do not re-read the same files, and the embedded chain cache (one
//! snapshot every 64 links) primes that memoization for long chains.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::chain::DatasetChain;
use crate::error::{Error, Result};
use crate::id::{DsId, JobId};
use crate::types::BaseType;
use crate::value::Value;
use crate::workspace::Workspace;

/// Version of the persisted record; loading refuses other majors and older
/// minors.
pub const METADATA_VERSION: (u32, u32) = (3, 0);

/// Chain cache stride: every this-many links the record embeds snapshots of
/// all predecessors since the previous snapshot.
pub(crate) const CACHE_STRIDE: u32 = 64;

const PICKLE_NAME: &str = "dataset.json";
const TXT_NAME: &str = "dataset.txt";
const LOG_NAME: &str = "datasets.txt";

/// Non-chain link to the dataset(s) this one extends columns onto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parent {
    Single(DsId),
    /// Produced by `merge`; the right-hand columns won on name collisions.
    Pair(DsId, DsId),
}

/// Descriptor of one column within a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsColumn {
    #[serde(rename = "type")]
    pub ty: BaseType,
    /// Physical codec type; equal to `ty` in this metadata version.
    pub backing_type: BaseType,
    /// Filesystem-cleaned form of the column name.
    pub name: String,
    /// `job/path` for merged columns, `job/path/%s.file` with a slice
    /// placeholder otherwise.
    pub location: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Per-slice byte offsets into the merged file, or unset when the
    /// column is stored as one file per slice.
    pub offsets: Option<Vec<u64>>,
}

/// The persisted metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsData {
    pub version: (u32, u32),
    pub filename: Option<String>,
    pub hashlabel: Option<String>,
    pub caption: Option<String>,
    pub columns: BTreeMap<String, DsColumn>,
    pub previous: Option<DsId>,
    pub parent: Option<Parent>,
    pub lines: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Vec<(DsId, DsData)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_distance: Option<u32>,
}

type CacheKey = (PathBuf, String);

static METADATA_CACHE: OnceLock<Mutex<HashMap<CacheKey, Arc<DsData>>>> = OnceLock::new();

fn metadata_cache() -> &'static Mutex<HashMap<CacheKey, Arc<DsData>>> {
    METADATA_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Empties the process-wide metadata memoization.
pub fn clear_metadata_cache() {
    if let Ok(mut map) = metadata_cache().lock() {
        map.clear();
    }
}

fn check_version(id: &DsId, data: &DsData) -> Result<()> {
    if data.version.0 != METADATA_VERSION.0 || data.version.1 < METADATA_VERSION.1 {
        return Err(Error::dataset(Cow::Owned(format!(
            "{id}: unsupported metadata version {:?}",
            data.version
        ))));
    }
    Ok(())
}

/// Reads a metadata record straight from disk, bypassing the memoization.
pub(crate) fn read_raw(root: &Path, id: &DsId) -> Result<DsData> {
    let path = root
        .join(id.job().as_str())
        .join(id.name())
        .join(PICKLE_NAME);
    if !path.exists() {
        return Err(Error::NoSuchDataset {
            id: id.canonical(),
        });
    }
    let data: DsData = serde_json::from_reader(BufReader::new(fs::File::open(path)?))?;
    check_version(id, &data)?;
    Ok(data)
}

fn load_data(ws: &Workspace, id: &DsId) -> Result<Arc<DsData>> {
    let key = (ws.root().to_path_buf(), id.canonical());
    if let Ok(map) = metadata_cache().lock()
        && let Some(data) = map.get(&key)
    {
        return Ok(Arc::clone(data));
    }
    let data = Arc::new(read_raw(ws.root(), id)?);
    if let Ok(mut map) = metadata_cache().lock() {
        if let Some(entries) = &data.cache {
            for (cached_id, cached_data) in entries {
                map.entry((ws.root().to_path_buf(), cached_id.canonical()))
                    .or_insert_with(|| Arc::new(cached_data.clone()));
            }
        }
        map.insert(key, Arc::clone(&data));
    }
    Ok(data)
}

/// How `link_to_here` treats the source dataset's chain link.
#[derive(Debug, Clone, Default)]
pub enum Rechain {
    /// Keep the source's `previous` untouched.
    #[default]
    Keep,
    /// Replace `previous` (or unchain with `None`).
    To(Option<DsId>),
}

/// Read-side handle: identity plus loaded metadata.
///
/// Compares and displays as its canonical identity string.
#[derive(Clone)]
pub struct Dataset {
    ws: Workspace,
    id: DsId,
    data: Arc<DsData>,
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dataset({})", self.id)
    }
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dataset {}

impl Dataset {
    /// Opens a dataset by identity.
    ///
    /// # Errors
    ///
    /// [`Error::NoSuchDataset`] when the record is missing,
    /// [`Error::Dataset`] when it is corrupt, has an unsupported version or
    /// does not match the workspace slice count.
    pub fn open(ws: &Workspace, id: &DsId) -> Result<Self> {
        let data = load_data(ws, id)?;
        if data.lines.len() != ws.slices() {
            return Err(Error::dataset(Cow::Owned(format!(
                "{id}: dataset has {} slices, workspace has {}",
                data.lines.len(),
                ws.slices()
            ))));
        }
        Ok(Self {
            ws: ws.clone(),
            id: id.clone(),
            data,
        })
    }

    #[must_use]
    pub const fn id(&self) -> &DsId {
        &self.id
    }

    #[must_use]
    pub const fn job(&self) -> &JobId {
        self.id.job()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.id.name()
    }

    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.ws
    }

    #[must_use]
    pub fn data(&self) -> &DsData {
        &self.data
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, DsColumn> {
        &self.data.columns
    }

    #[must_use]
    pub fn hashlabel(&self) -> Option<&str> {
        self.data.hashlabel.as_deref()
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.data.filename.as_deref()
    }

    #[must_use]
    pub fn caption(&self) -> Option<&str> {
        self.data.caption.as_deref()
    }

    #[must_use]
    pub fn previous(&self) -> Option<&DsId> {
        self.data.previous.as_ref()
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Parent> {
        self.data.parent.as_ref()
    }

    #[must_use]
    pub fn lines(&self) -> &[u64] {
        &self.data.lines
    }

    #[must_use]
    pub fn total_lines(&self) -> u64 {
        self.data.lines.iter().sum()
    }

    /// `(column count, total row count)`.
    #[must_use]
    pub fn shape(&self) -> (usize, u64) {
        (self.data.columns.len(), self.total_lines())
    }

    /// Resolves the path of a column's storage.
    ///
    /// For merged columns the slice is irrelevant (the caller seeks using
    /// the recorded offsets). For sliced columns the index is substituted
    /// into the location; omitting it returns the path with the `%s`
    /// placeholder intact.
    ///
    /// # Errors
    ///
    /// Returns a usage error for unknown columns.
    pub fn column_filename(&self, column: &str, sliceno: Option<usize>) -> Result<PathBuf> {
        let dc = self.data.columns.get(column).ok_or_else(|| {
            Error::usage(Cow::Owned(format!("no column {column:?} in {self}")))
        })?;
        if dc.offsets.is_some() {
            self.ws.resolve_location(&dc.location)
        } else {
            let slice = sliceno.map_or_else(|| "%s".to_owned(), |s| s.to_string());
            self.ws
                .resolve_location(&dc.location.replacen("%s", &slice, 1))
        }
    }

    /// The chain ending at this dataset.
    ///
    /// Walks `previous` links until `length` datasets are collected, the
    /// link is unset, or the predecessor equals `stop_ds` (which is itself
    /// excluded). Default order is oldest→newest; `reverse` flips it.
    ///
    /// # Errors
    ///
    /// Returns an error when a predecessor fails to load.
    pub fn chain(&self, opts: &ChainOptions) -> Result<DatasetChain> {
        let mut chain = Vec::new();
        let mut current = self.clone();
        loop {
            if opts.length == Some(chain.len()) {
                break;
            }
            if opts.stop_ds.as_ref() == Some(&current.id) {
                break;
            }
            chain.push(current.clone());
            match current.data.previous.clone() {
                Some(prev) => current = Self::open(&self.ws, &prev)?,
                None => break,
            }
        }
        if !opts.reverse {
            chain.reverse();
        }
        Ok(DatasetChain::new(chain))
    }

    /// Exposes this dataset (typically built by another job) under `job`.
    ///
    /// `column_filter` limits the linked columns; `rechain` replaces the
    /// chain link. The new record points back here via `parent` and shares
    /// the original column files.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the filter names unknown columns or
    /// filters everything away, and load errors when a `rechain` target
    /// does not resolve.
    pub fn link_to_here(
        &self,
        job: &JobId,
        name: &str,
        column_filter: Option<&[&str]>,
        rechain: Rechain,
    ) -> Result<Self> {
        let mut data = (*self.data).clone();
        if let Some(filter) = column_filter {
            let want: HashSet<&str> = filter.iter().copied().collect();
            let missing: Vec<&&str> = filter
                .iter()
                .filter(|c| !data.columns.contains_key(**c))
                .collect();
            if !missing.is_empty() {
                return Err(Error::usage(Cow::Owned(format!(
                    "columns in filter not available in {self}: {missing:?}"
                ))));
            }
            data.columns.retain(|k, _| want.contains(k.as_str()));
            if data.columns.is_empty() {
                return Err(Error::usage("column filter produced no columns"));
            }
        }
        if let Rechain::To(previous) = rechain {
            if let Some(prev) = &previous {
                Self::open(&self.ws, prev)?;
            }
            data.previous = previous;
            update_chain_cache(&self.ws, &mut data)?;
        }
        data.parent = Some(Parent::Single(self.id.clone()));
        let new_id = DsId::new(job.clone(), name)?;
        save(&self.ws, &new_id, &data)?;
        append_dataset_log(&self.ws, &new_id)?;
        Self::open(&self.ws, &new_id)
    }

    /// Merges this and `other` into a new dataset under `job`; columns from
    /// `other` take priority on name collisions.
    ///
    /// The new dataset's `previous` is exactly the one passed here, even
    /// `None` (merging unchains unless told otherwise). Without
    /// `allow_unrelated` the two datasets must share an ancestry tip
    /// through their `parent` links.
    ///
    /// # Errors
    ///
    /// Usage errors on self-merge, differing line counts, conflicting
    /// hashlabels or unrelated inputs.
    pub fn merge(
        &self,
        other: &Self,
        job: &JobId,
        name: &str,
        previous: Option<DsId>,
        allow_unrelated: bool,
    ) -> Result<Self> {
        if self == other {
            return Err(Error::usage(Cow::Owned(format!(
                "can't merge with myself ({other})"
            ))));
        }
        if self.data.lines != other.data.lines {
            return Err(Error::usage(Cow::Owned(format!(
                "{self} and {other} don't have the same line counts"
            ))));
        }
        if let (Some(a), Some(b)) = (&self.data.hashlabel, &other.data.hashlabel)
            && a != b
        {
            return Err(Error::usage(Cow::Owned(format!(
                "hashlabel mismatch, {self} has {a}, {other} has {b}"
            ))));
        }
        if !allow_unrelated {
            let mut mine = HashSet::new();
            ancestry_tips(&self.ws, self, &mut mine)?;
            let mut theirs = HashSet::new();
            ancestry_tips(&self.ws, other, &mut theirs)?;
            if mine.is_disjoint(&theirs) {
                return Err(Error::usage(Cow::Owned(format!(
                    "{self} and {other} have no common ancestors, \
                     set allow_unrelated to allow this"
                ))));
            }
        }
        let mut data = (*self.data).clone();
        for (k, v) in &other.data.columns {
            data.columns.insert(k.clone(), v.clone());
        }
        data.previous = previous;
        data.parent = Some(Parent::Pair(self.id.clone(), other.id.clone()));
        data.filename = None;
        data.caption = None;
        update_chain_cache(&self.ws, &mut data)?;
        let new_id = DsId::new(job.clone(), name)?;
        save(&self.ws, &new_id, &data)?;
        Self::open(&self.ws, &new_id)
    }
}

fn ancestry_tips(ws: &Workspace, ds: &Dataset, tips: &mut HashSet<String>) -> Result<()> {
    match &ds.data.parent {
        None => {
            tips.insert(ds.id.canonical());
        }
        Some(Parent::Single(p)) => {
            let parent = Dataset::open(ws, p)?;
            ancestry_tips(ws, &parent, tips)?;
        }
        Some(Parent::Pair(a, b)) => {
            let left = Dataset::open(ws, a)?;
            ancestry_tips(ws, &left, tips)?;
            let right = Dataset::open(ws, b)?;
            ancestry_tips(ws, &right, tips)?;
        }
    }
    Ok(())
}

/// Chain walk bounds for [`Dataset::chain`].
#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    pub length: Option<usize>,
    pub reverse: bool,
    pub stop_ds: Option<DsId>,
}

impl ChainOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            length: None,
            reverse: false,
            stop_ds: None,
        }
    }

    #[must_use]
    pub const fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub const fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    #[must_use]
    pub fn with_stop_ds(mut self, stop_ds: DsId) -> Self {
        self.stop_ds = Some(stop_ds);
        self
    }
}

/// Recomputes `cache`/`cache_distance` for a record about to be saved.
pub(crate) fn update_chain_cache(ws: &Workspace, data: &mut DsData) -> Result<()> {
    data.cache = None;
    data.cache_distance = None;
    let Some(prev_id) = data.previous.clone() else {
        return Ok(());
    };
    let prev = Dataset::open(ws, &prev_id)?;
    let distance = prev.data.cache_distance.unwrap_or(1) + 1;
    if distance == CACHE_STRIDE {
        data.cache_distance = Some(0);
        let mut entries = Vec::with_capacity(CACHE_STRIDE as usize - 1);
        let mut current = prev;
        for _ in 1..CACHE_STRIDE {
            entries.push((current.id.clone(), (*current.data).clone()));
            match current.data.previous.clone() {
                Some(p) => current = Dataset::open(ws, &p)?,
                None => break,
            }
        }
        entries.reverse();
        data.cache = Some(entries);
    } else {
        data.cache_distance = Some(distance);
    }
    Ok(())
}

/// Writes `dataset.json` and `dataset.txt` under the dataset directory.
pub(crate) fn save(ws: &Workspace, id: &DsId, data: &DsData) -> Result<()> {
    let dir = ws.job_dir(id.job()).join(id.name());
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    let mut out = BufWriter::new(fs::File::create(dir.join(PICKLE_NAME))?);
    serde_json::to_writer(&mut out, data)?;
    out.flush()?;
    write_txt(&dir.join(TXT_NAME), data)?;
    Ok(())
}

/// Appends the dataset name to the owning job's finish-order log.
pub(crate) fn append_dataset_log(ws: &Workspace, id: &DsId) -> Result<()> {
    let path = ws.job_dir(id.job()).join(LOG_NAME);
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", id.name())?;
    Ok(())
}

fn write_txt(path: &Path, data: &DsData) -> Result<()> {
    let mut out = String::new();
    let mut blank = false;
    if let Some(hl) = &data.hashlabel {
        out.push_str(&format!("hashlabel {hl}\n"));
        blank = true;
    }
    if let Some(prev) = &data.previous {
        out.push_str(&format!("previous {prev}\n"));
        blank = true;
    }
    if blank {
        out.push('\n');
    }
    let rows: Vec<(&str, &str, &str)> = data
        .columns
        .iter()
        .map(|(name, dc)| (name.as_str(), dc.ty.as_str(), dc.location.as_str()))
        .collect();
    let width = |min: usize, pick: for<'a> fn(&'a (&str, &str, &str)) -> &'a str| {
        rows.iter()
            .map(|row| pick(row).chars().count())
            .max()
            .unwrap_or(0)
            .max(min)
    };
    let w_name = width(4, |row| row.0);
    let w_type = width(4, |row| row.1);
    let w_loc = width(8, |row| row.2);
    let mut push_row = |name: &str, ty: &str, loc: &str| {
        out.push_str(&format!(
            "{name:>w_name$}  {ty:>w_type$}  {loc:<w_loc$}\n"
        ));
    };
    push_row("name", "type", "location");
    push_row(
        &"=".repeat(w_name),
        &"=".repeat(w_type),
        &"=".repeat(w_loc),
    );
    for (name, ty, loc) in rows {
        push_row(name, ty, loc);
    }
    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_table_layout() {
        let mut columns = BTreeMap::new();
        columns.insert(
            "x".to_owned(),
            DsColumn {
                ty: BaseType::Int64,
                backing_type: BaseType::Int64,
                name: "x".to_owned(),
                location: "jid-0/default/%s.x".to_owned(),
                min: None,
                max: None,
                offsets: None,
            },
        );
        let data = DsData {
            version: METADATA_VERSION,
            filename: None,
            hashlabel: Some("x".to_owned()),
            caption: None,
            columns,
            previous: None,
            parent: None,
            lines: vec![0, 0],
            cache: None,
            cache_distance: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TXT_NAME);
        write_txt(&path, &data).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        // Widths: name 4, type 5 ("int64"), location 18.
        assert!(text.starts_with("hashlabel x\n\n"), "{text:?}");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[2], "name   type  location          ");
        assert_eq!(lines[3], "====  =====  ==================");
        assert_eq!(lines[4], "   x  int64  jid-0/default/%s.x");
    }
}
