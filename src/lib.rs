//! Columnar dataset engine: immutable, sliced, typed tables produced by
//! jobs and consumed by lazy iteration over single datasets or chains.

pub mod chain;
pub mod codec;
pub mod dataset;
pub mod error;
pub mod id;
pub mod iterate;
pub mod logger;
pub mod types;
pub mod value;
pub mod workspace;
pub mod writer;

pub use crate::chain::DatasetChain;
pub use crate::dataset::{
    ChainOptions, Dataset, DsColumn, DsData, Parent, Rechain, clear_metadata_cache,
};
pub use crate::error::{Error, Result};
pub use crate::id::{DsId, JobId};
pub use crate::iterate::{
    ColumnFilter, ColumnTranslator, DsIterator, Filters, IterateOptions, SlicePick, Translators,
    Verdict, iterate_list,
};
pub use crate::types::{BaseType, ColType};
pub use crate::value::Value;
pub use crate::workspace::Workspace;
pub use crate::writer::{DatasetWriter, DatasetWriterOptions, IntoRow};
