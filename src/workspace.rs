use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::id::{DsId, JobId};
use crate::logger::log_warn;

/// Root directory of job directories plus the global slice count.
///
/// The job runtime that assigns job identities and launches workers is an
/// external collaborator; everything in this crate takes a `Workspace` and
/// explicit [`JobId`] values at its boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    slices: usize,
}

impl Workspace {
    /// # Errors
    ///
    /// Returns a usage error when `slices` is zero.
    pub fn new(root: impl Into<PathBuf>, slices: usize) -> Result<Self> {
        if slices == 0 {
            return Err(Error::usage("a workspace needs at least one slice"));
        }
        Ok(Self {
            root: root.into(),
            slices,
        })
    }

    /// Opens a workspace for an existing dataset, inferring the slice count
    /// from its per-slice line counts.
    ///
    /// # Errors
    ///
    /// Returns an error when the dataset does not exist or its metadata
    /// cannot be read.
    pub fn detect(root: impl Into<PathBuf>, id: &DsId) -> Result<Self> {
        let root = root.into();
        let data = crate::dataset::read_raw(&root, id)?;
        Self::new(root, data.lines.len())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn slices(&self) -> usize {
        self.slices
    }

    #[must_use]
    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.root.join(job.as_str())
    }

    /// Opens a dataset by identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchDataset`] when the metadata record is missing
    /// and [`Error::Dataset`] when it cannot be loaded.
    pub fn dataset(&self, id: &DsId) -> Result<Dataset> {
        Dataset::open(self, id)
    }

    /// All datasets of a job, in finish order.
    ///
    /// A job without a dataset log simply has no datasets. Entries that no
    /// longer load are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset log exists but cannot be read.
    pub fn job_datasets(&self, job: &JobId) -> Result<Vec<Dataset>> {
        let log = self.job_dir(job).join("datasets.txt");
        if !log.exists() {
            return Ok(Vec::new());
        }
        let mut datasets = Vec::new();
        for name in fs::read_to_string(log)?.lines() {
            let id = DsId::new(job.clone(), name)?;
            match self.dataset(&id) {
                Ok(ds) => datasets.push(ds),
                Err(err) => log_warn(&format!("skipping unloadable dataset {id}: {err}")),
            }
        }
        Ok(datasets)
    }

    /// Resolves a column location of the form `job/relative/path`.
    pub(crate) fn resolve_location(&self, location: &str) -> Result<PathBuf> {
        let (job, rel) = location.split_once('/').ok_or_else(|| {
            Error::dataset(Cow::Owned(format!("bad column location {location:?}")))
        })?;
        Ok(self.root.join(job).join(rel))
    }
}
