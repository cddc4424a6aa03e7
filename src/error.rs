use std::borrow::Cow;
use std::io;

/// Result type used across the dataset engine.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error type surfaced by the dataset engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure while reading or writing dataset files.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The metadata record for a dataset is missing.
    #[error("dataset {id} does not exist")]
    NoSuchDataset { id: String },

    /// The metadata record exists but is corrupt or has an unsupported version.
    #[error("bad dataset metadata: {details}")]
    Dataset { details: Cow<'static, str> },

    /// Caller misuse: undeclared columns, wrong-slice writes, hashlabel
    /// mismatches and similar contract violations.
    #[error("dataset usage error: {details}")]
    Usage { details: Cow<'static, str> },
}

impl Error {
    pub(crate) fn dataset(details: impl Into<Cow<'static, str>>) -> Self {
        Self::Dataset {
            details: details.into(),
        }
    }

    pub(crate) fn usage(details: impl Into<Cow<'static, str>>) -> Self {
        Self::Usage {
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Dataset {
            details: Cow::Owned(err.to_string()),
        }
    }
}
