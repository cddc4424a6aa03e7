use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Storage type of a persisted column.
///
/// This is the set of types a column file can hold; it is what ends up in
/// the metadata record. Writer-side `parsed:` conversions never reach disk
/// metadata, see [`ColType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// Int-or-float, stored with a per-record tag.
    Number,
    Float64,
    Float32,
    Int64,
    Int32,
    Bits64,
    Bits32,
    Bool,
    DateTime,
    Date,
    Time,
    Bytes,
    Ascii,
    Unicode,
    Json,
}

impl BaseType {
    pub const ALL: [Self; 15] = [
        Self::Number,
        Self::Float64,
        Self::Float32,
        Self::Int64,
        Self::Int32,
        Self::Bits64,
        Self::Bits32,
        Self::Bool,
        Self::DateTime,
        Self::Date,
        Self::Time,
        Self::Bytes,
        Self::Ascii,
        Self::Unicode,
        Self::Json,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Float64 => "float64",
            Self::Float32 => "float32",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::Bits64 => "bits64",
            Self::Bits32 => "bits32",
            Self::Bool => "bool",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
            Self::Bytes => "bytes",
            Self::Ascii => "ascii",
            Self::Unicode => "unicode",
            Self::Json => "json",
        }
    }

    /// Whether the codec tracks min/max for this type.
    #[must_use]
    pub const fn tracks_minmax(self) -> bool {
        !matches!(self, Self::Bytes | Self::Ascii | Self::Unicode | Self::Json)
    }

    /// Whether a `parsed:` writer variant exists for this type.
    #[must_use]
    pub const fn parseable(self) -> bool {
        matches!(
            self,
            Self::Number
                | Self::Float64
                | Self::Float32
                | Self::Int64
                | Self::Int32
                | Self::Bits64
                | Self::Bits32
                | Self::Json
        )
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::usage(format!("unknown column type {s:?}")))
    }
}

impl Serialize for BaseType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BaseType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|err: Error| D::Error::custom(err.to_string()))
    }
}

/// Column type as declared on a writer.
///
/// `parsed` variants accept string input and convert it to the base type
/// before writing; storage and metadata are identical to the plain type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColType {
    pub base: BaseType,
    pub parsed: bool,
}

impl ColType {
    #[must_use]
    pub const fn plain(base: BaseType) -> Self {
        Self {
            base,
            parsed: false,
        }
    }

    /// # Errors
    ///
    /// Returns a usage error if the base type has no `parsed:` variant.
    pub fn parsed(base: BaseType) -> Result<Self, Error> {
        if base.parseable() {
            Ok(Self { base, parsed: true })
        } else {
            Err(Error::usage(format!("no parsed variant of {base}")))
        }
    }
}

impl fmt::Display for ColType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parsed {
            write!(f, "parsed:{}", self.base)
        } else {
            self.base.fmt(f)
        }
    }
}

impl FromStr for ColType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.strip_prefix("parsed:") {
            Some(base) => Self::parsed(base.parse()?),
            None => Ok(Self::plain(s.parse()?)),
        }
    }
}

impl From<BaseType> for ColType {
    fn from(base: BaseType) -> Self {
        Self::plain(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        for base in BaseType::ALL {
            assert_eq!(base.as_str().parse::<BaseType>().unwrap(), base);
        }
        let t: ColType = "parsed:int64".parse().unwrap();
        assert_eq!(t.base, BaseType::Int64);
        assert!(t.parsed);
        assert_eq!(t.to_string(), "parsed:int64");
    }

    #[test]
    fn parsed_only_for_convertible_types() {
        assert!("parsed:number".parse::<ColType>().is_ok());
        assert!("parsed:json".parse::<ColType>().is_ok());
        assert!("parsed:date".parse::<ColType>().is_err());
        assert!("parsed:unicode".parse::<ColType>().is_err());
    }
}
