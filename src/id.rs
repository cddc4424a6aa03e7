use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Identifier of a job, the unit that owns a directory of datasets.
///
/// Job identities are assigned by the surrounding job runtime; this crate
/// only requires that they are non-empty and usable as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// # Errors
    ///
    /// Returns a usage error if the identifier is empty or contains `/` or a
    /// newline.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') || id.contains('\n') {
            return Err(Error::usage(Cow::Owned(format!("bad job id {id:?}"))));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Dataset identity: a `(job, name)` pair with a canonical string form.
///
/// The canonical form is just the job id when the name is `default`, and
/// `job/name` otherwise. The identity serializes as that string, so a
/// persisted identity is indistinguishable from its display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DsId {
    job: JobId,
    name: String,
}

impl DsId {
    pub const DEFAULT_NAME: &'static str = "default";

    /// # Errors
    ///
    /// Returns a usage error if the name is empty or contains `/` or a
    /// newline.
    pub fn new(job: JobId, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') || name.contains('\n') {
            return Err(Error::usage(Cow::Owned(format!(
                "bad dataset name {name:?}"
            ))));
        }
        Ok(Self { job, name })
    }

    /// Parses `job` or `job/name` into an identity.
    ///
    /// # Errors
    ///
    /// Returns a usage error if either part is malformed.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((job, name)) => Self::new(JobId::new(job)?, name),
            None => Self::new(JobId::new(s)?, Self::DEFAULT_NAME),
        }
    }

    #[must_use]
    pub const fn job(&self) -> &JobId {
        &self.job
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical string form: `job` for the default dataset, else
    /// `job/name`.
    #[must_use]
    pub fn canonical(&self) -> String {
        if self.name == Self::DEFAULT_NAME {
            self.job.0.clone()
        } else {
            format!("{}/{}", self.job, self.name)
        }
    }
}

impl fmt::Display for DsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == Self::DEFAULT_NAME {
            f.write_str(self.job.as_str())
        } else {
            write!(f, "{}/{}", self.job, self.name)
        }
    }
}

impl FromStr for DsId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for DsId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for DsId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(|err| D::Error::custom(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        let id = DsId::parse("jid-0").unwrap();
        assert_eq!(id.name(), "default");
        assert_eq!(id.to_string(), "jid-0");
        let id = DsId::parse("jid-0/extra").unwrap();
        assert_eq!(id.to_string(), "jid-0/extra");
        assert_eq!(id.job().as_str(), "jid-0");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = DsId::parse("jid-1/mine").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"jid-1/mine\"");
        let back: DsId = serde_json::from_str("\"jid-1\"").unwrap();
        assert_eq!(back.name(), "default");
    }

    #[test]
    fn rejects_malformed_parts() {
        assert!(DsId::parse("jid/a/b").is_err());
        assert!(DsId::parse("/name").is_err());
        assert!(JobId::new("a\nb").is_err());
    }
}
