//! Typed column codec: one value per record, little-endian, length-prefixed
//! where variable width.
//!
//! Writers track per-column count and (for ordered types) min/max while
//! encoding. Readers are lazy, forward-only and single-pass; a `seek` plus
//! `max_count` reads one slice out of a merged column file. The value hash
//! used for slice partitioning is xxh3 over a canonical byte form and is
//! stable across processes and runs.

#[cfg(test)]
mod tests;

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use time::{Date, PrimitiveDateTime, Time};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::types::{BaseType, ColType};
use crate::value::Value;

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;

/// Closing summary of one column writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub count: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

/// Appends typed values to one column file.
pub struct TypedWriter {
    file: BufWriter<File>,
    coltype: ColType,
    default: Option<Value>,
    hashfilter: Option<(usize, usize)>,
    count: u64,
    min: Option<Value>,
    max: Option<Value>,
}

impl TypedWriter {
    /// Opens a fresh column file.
    ///
    /// A `default` is substituted for rejected values and is validated here,
    /// so a bad default fails early instead of on some later row. With a
    /// `hashfilter = (slice, slices)` only values hashing to `slice` are
    /// written; [`TypedWriter::write`] reports the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the default is not
    /// acceptable for the column type.
    pub fn create(
        path: &Path,
        coltype: ColType,
        default: Option<Value>,
        hashfilter: Option<(usize, usize)>,
    ) -> Result<Self> {
        let default = match default {
            Some(v) => Some(convert(coltype, &v).ok_or_else(|| {
                Error::usage(Cow::Owned(format!(
                    "default {v:?} is not a valid {coltype} value"
                )))
            })?),
            None => None,
        };
        if let Some((slice, slices)) = hashfilter
            && slice >= slices
        {
            return Err(Error::usage(Cow::Owned(format!(
                "hashfilter slice {slice} out of range for {slices} slices"
            ))));
        }
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            coltype,
            default,
            hashfilter,
            count: 0,
            min: None,
            max: None,
        })
    }

    /// Writes one value.
    ///
    /// Returns `Ok(false)` when a hashfilter dropped the value, `Ok(true)`
    /// when it was written.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the value is rejected by the column type
    /// and no default was configured.
    pub fn write(&mut self, value: &Value) -> Result<bool> {
        let converted = match convert(self.coltype, value) {
            Some(v) => v,
            None => match &self.default {
                Some(d) => d.clone(),
                None => {
                    return Err(Error::usage(Cow::Owned(format!(
                        "cannot write {} value to {} column",
                        value.kind(),
                        self.coltype
                    ))));
                }
            },
        };
        if let Some((slice, slices)) = self.hashfilter
            && value_hash(&converted) as usize % slices != slice
        {
            return Ok(false);
        }
        encode(&mut self.file, self.coltype.base, &converted)?;
        self.count += 1;
        if self.coltype.base.tracks_minmax() {
            self.min = Some(match self.min.take() {
                Some(cur) => cur.min_with(converted.clone()),
                None => converted.clone(),
            });
            self.max = Some(match self.max.take() {
                Some(cur) => cur.max_with(converted),
                None => converted,
            });
        }
        Ok(true)
    }

    /// The partition hash of `value` after conversion for this column.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the value is rejected and no default was
    /// configured.
    pub fn hash(&self, value: &Value) -> Result<u64> {
        match convert(self.coltype, value) {
            Some(v) => Ok(value_hash(&v)),
            None => match &self.default {
                Some(d) => Ok(value_hash(d)),
                None => Err(Error::usage(Cow::Owned(format!(
                    "cannot hash {} value as {}",
                    value.kind(),
                    self.coltype
                )))),
            },
        }
    }

    /// Whether `value` belongs in this writer's hashfilter slice.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no hashfilter is configured or the value
    /// cannot be hashed.
    pub fn hashcheck(&self, value: &Value) -> Result<bool> {
        let (slice, slices) = self
            .hashfilter
            .ok_or_else(|| Error::usage("hashcheck on a writer without hashfilter"))?;
        Ok(self.hash(value)? as usize % slices == slice)
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Flushes and returns the closing stats.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn close(mut self) -> Result<ColumnStats> {
        self.file.flush()?;
        Ok(ColumnStats {
            count: self.count,
            min: self.min,
            max: self.max,
        })
    }
}

/// Lazy reader over one column file (or one slice of a merged file).
pub struct TypedReader {
    file: BufReader<File>,
    base: BaseType,
    remaining: Option<u64>,
}

impl TypedReader {
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or positioned.
    pub fn open(
        path: &Path,
        base: BaseType,
        seek: Option<u64>,
        max_count: Option<u64>,
    ) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        if let Some(offset) = seek {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Self {
            file,
            base,
            remaining: max_count,
        })
    }

    fn decode_next(&mut self) -> Result<Option<Value>> {
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                return Ok(None);
            }
            self.remaining = Some(remaining - 1);
        }
        decode(&mut self.file, self.base)
    }
}

impl Iterator for TypedReader {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next().transpose()
    }
}

/// Predicate stream over a column: `true` where the value hashes to `slice`.
pub struct HashFilterReader {
    inner: TypedReader,
    slice: usize,
    slices: usize,
}

impl HashFilterReader {
    /// # Errors
    ///
    /// Returns an error if the underlying reader cannot be opened.
    pub fn open(
        path: &Path,
        base: BaseType,
        seek: Option<u64>,
        max_count: Option<u64>,
        slice: usize,
        slices: usize,
    ) -> Result<Self> {
        Ok(Self {
            inner: TypedReader::open(path, base, seek, max_count)?,
            slice,
            slices,
        })
    }
}

impl Iterator for HashFilterReader {
    type Item = Result<bool>;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.inner.next()?;
        Some(value.map(|v| value_hash(&v) as usize % self.slices == self.slice))
    }
}

/// The deterministic partition hash of an already-converted value.
///
/// Integral floats hash like the equal integer so `number` columns
/// partition consistently whichever representation a row arrived in.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn value_hash(value: &Value) -> u64 {
    let mut buf = [0u8; 16];
    let bytes: &[u8] = match value {
        Value::None => &[],
        Value::Int(v) => {
            buf.copy_from_slice(&i128::from(*v).to_le_bytes());
            &buf
        }
        Value::Uint(v) => {
            buf.copy_from_slice(&i128::from(*v).to_le_bytes());
            &buf
        }
        Value::Float(v) => {
            if v.is_finite() && v.fract() == 0.0 && *v >= i128::MIN as f64 && *v <= i128::MAX as f64
            {
                #[allow(clippy::cast_possible_truncation)]
                let as_int = *v as i128;
                buf.copy_from_slice(&as_int.to_le_bytes());
                &buf
            } else {
                buf[..8].copy_from_slice(&v.to_bits().to_le_bytes());
                &buf[..8]
            }
        }
        Value::Bool(v) => {
            buf[0] = u8::from(*v);
            &buf[..1]
        }
        Value::Date(v) => {
            buf[..4].copy_from_slice(&v.to_julian_day().to_le_bytes());
            &buf[..4]
        }
        Value::Time(v) => {
            buf[..8].copy_from_slice(&time_nanos(v).to_le_bytes());
            &buf[..8]
        }
        Value::DateTime(v) => {
            buf[..4].copy_from_slice(&v.date().to_julian_day().to_le_bytes());
            buf[4..12].copy_from_slice(&time_nanos(&v.time()).to_le_bytes());
            &buf[..12]
        }
        Value::Bytes(v) => v,
        Value::Str(v) => v.as_bytes(),
        Value::Json(v) => return xxh3_64(v.to_string().as_bytes()),
    };
    xxh3_64(bytes)
}

fn time_nanos(t: &Time) -> u64 {
    let secs = u64::from(t.hour()) * 3600 + u64::from(t.minute()) * 60 + u64::from(t.second());
    secs * 1_000_000_000 + u64::from(t.nanosecond())
}

#[allow(clippy::cast_possible_truncation)]
fn time_from_nanos(nanos: u64) -> Result<Time> {
    let secs = nanos / 1_000_000_000;
    let (hour, minute, second) = (secs / 3600, (secs / 60) % 60, secs % 60);
    Time::from_hms_nano(
        hour as u8,
        minute as u8,
        second as u8,
        (nanos % 1_000_000_000) as u32,
    )
    .map_err(|_| Error::dataset(Cow::Owned(format!("corrupt time record ({nanos} ns)"))))
}

/// Converts an incoming value to the normalized form stored for `coltype`,
/// or `None` when the column rejects it.
#[must_use]
pub fn convert(coltype: ColType, value: &Value) -> Option<Value> {
    if coltype.parsed
        && let Value::Str(s) = value
    {
        return parse_str(coltype.base, s);
    }
    convert_base(coltype.base, value)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn convert_base(base: BaseType, value: &Value) -> Option<Value> {
    match (base, value) {
        (BaseType::Number, Value::Int(v)) => Some(Value::Int(*v)),
        (BaseType::Number, Value::Uint(v)) => i64::try_from(*v).ok().map(Value::Int),
        (BaseType::Number, Value::Float(v)) => Some(Value::Float(*v)),
        (BaseType::Float64, Value::Float(v)) => Some(Value::Float(*v)),
        (BaseType::Float64, Value::Int(v)) => Some(Value::Float(*v as f64)),
        (BaseType::Float64, Value::Uint(v)) => Some(Value::Float(*v as f64)),
        (BaseType::Float32, Value::Float(v)) => Some(Value::Float(f64::from(*v as f32))),
        (BaseType::Float32, Value::Int(v)) => Some(Value::Float(f64::from(*v as f32))),
        (BaseType::Float32, Value::Uint(v)) => Some(Value::Float(f64::from(*v as f32))),
        (BaseType::Int64, Value::Int(v)) => Some(Value::Int(*v)),
        (BaseType::Int64, Value::Uint(v)) => i64::try_from(*v).ok().map(Value::Int),
        (BaseType::Int32, Value::Int(v)) => i32::try_from(*v).ok().map(|v| Value::Int(i64::from(v))),
        (BaseType::Int32, Value::Uint(v)) => i32::try_from(*v).ok().map(|v| Value::Int(i64::from(v))),
        (BaseType::Bits64, Value::Uint(v)) => Some(Value::Uint(*v)),
        (BaseType::Bits64, Value::Int(v)) => u64::try_from(*v).ok().map(Value::Uint),
        (BaseType::Bits32, Value::Uint(v)) => u32::try_from(*v).ok().map(|v| Value::Uint(u64::from(v))),
        (BaseType::Bits32, Value::Int(v)) => u32::try_from(*v).ok().map(|v| Value::Uint(u64::from(v))),
        (BaseType::Bool, Value::Bool(v)) => Some(Value::Bool(*v)),
        (BaseType::DateTime, Value::DateTime(v)) => Some(Value::DateTime(*v)),
        (BaseType::Date, Value::Date(v)) => Some(Value::Date(*v)),
        (BaseType::Time, Value::Time(v)) => Some(Value::Time(*v)),
        (BaseType::Bytes, Value::Bytes(v)) => Some(Value::Bytes(v.clone())),
        (BaseType::Ascii, Value::Str(v)) if v.is_ascii() => Some(Value::Str(v.clone())),
        (BaseType::Unicode, Value::Str(v)) => Some(Value::Str(v.clone())),
        (BaseType::Json, Value::Json(v)) => Some(Value::Json(v.clone())),
        (BaseType::Json, Value::None) => Some(Value::Json(serde_json::Value::Null)),
        (BaseType::Json, Value::Bool(v)) => Some(Value::Json(serde_json::Value::from(*v))),
        (BaseType::Json, Value::Int(v)) => Some(Value::Json(serde_json::Value::from(*v))),
        (BaseType::Json, Value::Uint(v)) => Some(Value::Json(serde_json::Value::from(*v))),
        (BaseType::Json, Value::Float(v)) => serde_json::Number::from_f64(*v)
            .map(|n| Value::Json(serde_json::Value::Number(n))),
        (BaseType::Json, Value::Str(v)) => Some(Value::Json(serde_json::Value::from(v.as_str()))),
        _ => None,
    }
}

fn parse_str(base: BaseType, s: &str) -> Option<Value> {
    let t = s.trim();
    match base {
        BaseType::Number => t
            .parse::<i64>()
            .ok()
            .map(Value::Int)
            .or_else(|| t.parse::<f64>().ok().map(Value::Float)),
        BaseType::Float64 => t.parse::<f64>().ok().map(Value::Float),
        BaseType::Float32 => t.parse::<f32>().ok().map(|v| Value::Float(f64::from(v))),
        BaseType::Int64 => t.parse::<i64>().ok().map(Value::Int),
        BaseType::Int32 => t.parse::<i32>().ok().map(|v| Value::Int(i64::from(v))),
        BaseType::Bits64 => t.parse::<u64>().ok().map(Value::Uint),
        BaseType::Bits32 => t.parse::<u32>().ok().map(|v| Value::Uint(u64::from(v))),
        BaseType::Json => serde_json::from_str(s).ok().map(Value::Json),
        _ => None,
    }
}

fn encode(w: &mut impl Write, base: BaseType, value: &Value) -> Result<()> {
    match (base, value) {
        (BaseType::Number, Value::Int(v)) => {
            w.write_u8(TAG_INT)?;
            w.write_i64::<LittleEndian>(*v)?;
        }
        (BaseType::Number, Value::Float(v)) => {
            w.write_u8(TAG_FLOAT)?;
            w.write_f64::<LittleEndian>(*v)?;
        }
        (BaseType::Float64, Value::Float(v)) => w.write_f64::<LittleEndian>(*v)?,
        (BaseType::Float32, Value::Float(v)) => {
            #[allow(clippy::cast_possible_truncation)]
            w.write_f32::<LittleEndian>(*v as f32)?;
        }
        (BaseType::Int64, Value::Int(v)) => w.write_i64::<LittleEndian>(*v)?,
        (BaseType::Int32, Value::Int(v)) => {
            #[allow(clippy::cast_possible_truncation)]
            w.write_i32::<LittleEndian>(*v as i32)?;
        }
        (BaseType::Bits64, Value::Uint(v)) => w.write_u64::<LittleEndian>(*v)?,
        (BaseType::Bits32, Value::Uint(v)) => {
            #[allow(clippy::cast_possible_truncation)]
            w.write_u32::<LittleEndian>(*v as u32)?;
        }
        (BaseType::Bool, Value::Bool(v)) => w.write_u8(u8::from(*v))?,
        (BaseType::DateTime, Value::DateTime(v)) => {
            w.write_i32::<LittleEndian>(v.date().to_julian_day())?;
            w.write_u64::<LittleEndian>(time_nanos(&v.time()))?;
        }
        (BaseType::Date, Value::Date(v)) => w.write_i32::<LittleEndian>(v.to_julian_day())?,
        (BaseType::Time, Value::Time(v)) => w.write_u64::<LittleEndian>(time_nanos(v))?,
        (BaseType::Bytes, Value::Bytes(v)) => write_blob(w, v)?,
        (BaseType::Ascii | BaseType::Unicode, Value::Str(v)) => write_blob(w, v.as_bytes())?,
        (BaseType::Json, Value::Json(v)) => write_blob(w, v.to_string().as_bytes())?,
        _ => {
            return Err(Error::usage(Cow::Owned(format!(
                "cannot encode {} value as {base}",
                value.kind()
            ))));
        }
    }
    Ok(())
}

fn write_blob(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record over 4 GiB"))?;
    w.write_u32::<LittleEndian>(len)?;
    w.write_all(data)
}

fn decode(r: &mut impl Read, base: BaseType) -> Result<Option<Value>> {
    let value = match base {
        BaseType::Number => {
            let mut tag = [0u8; 1];
            if !fill_or_eof(r, &mut tag)? {
                return Ok(None);
            }
            match tag[0] {
                TAG_INT => Value::Int(r.read_i64::<LittleEndian>()?),
                TAG_FLOAT => Value::Float(r.read_f64::<LittleEndian>()?),
                other => {
                    return Err(Error::dataset(Cow::Owned(format!(
                        "corrupt number record (tag {other})"
                    ))));
                }
            }
        }
        BaseType::Float64 => {
            let mut buf = [0u8; 8];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Float(f64::from_le_bytes(buf))
        }
        BaseType::Float32 => {
            let mut buf = [0u8; 4];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Float(f64::from(f32::from_le_bytes(buf)))
        }
        BaseType::Int64 => {
            let mut buf = [0u8; 8];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Int(i64::from_le_bytes(buf))
        }
        BaseType::Int32 => {
            let mut buf = [0u8; 4];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Int(i64::from(i32::from_le_bytes(buf)))
        }
        BaseType::Bits64 => {
            let mut buf = [0u8; 8];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Uint(u64::from_le_bytes(buf))
        }
        BaseType::Bits32 => {
            let mut buf = [0u8; 4];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Uint(u64::from(u32::from_le_bytes(buf)))
        }
        BaseType::Bool => {
            let mut buf = [0u8; 1];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            match buf[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(Error::dataset(Cow::Owned(format!(
                        "corrupt bool record ({other})"
                    ))));
                }
            }
        }
        BaseType::DateTime => {
            let mut buf = [0u8; 12];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            let day = i32::from_le_bytes(buf[..4].try_into().unwrap_or([0; 4]));
            let nanos = u64::from_le_bytes(buf[4..].try_into().unwrap_or([0; 8]));
            let date = Date::from_julian_day(day)
                .map_err(|_| Error::dataset(Cow::Owned(format!("corrupt date record ({day})"))))?;
            Value::DateTime(PrimitiveDateTime::new(date, time_from_nanos(nanos)?))
        }
        BaseType::Date => {
            let mut buf = [0u8; 4];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            let day = i32::from_le_bytes(buf);
            Value::Date(Date::from_julian_day(day).map_err(|_| {
                Error::dataset(Cow::Owned(format!("corrupt date record ({day})")))
            })?)
        }
        BaseType::Time => {
            let mut buf = [0u8; 8];
            if !fill_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            Value::Time(time_from_nanos(u64::from_le_bytes(buf))?)
        }
        BaseType::Bytes => match read_blob(r)? {
            Some(data) => Value::Bytes(data),
            None => return Ok(None),
        },
        BaseType::Ascii | BaseType::Unicode => match read_blob(r)? {
            Some(data) => {
                let text = simdutf8::basic::from_utf8(&data)
                    .map_err(|_| Error::dataset("corrupt string record (invalid UTF-8)"))?;
                Value::Str(text.to_owned())
            }
            None => return Ok(None),
        },
        BaseType::Json => match read_blob(r)? {
            Some(data) => Value::Json(
                serde_json::from_slice(&data)
                    .map_err(|err| Error::dataset(Cow::Owned(format!("corrupt json record: {err}"))))?,
            ),
            None => return Ok(None),
        },
    };
    Ok(Some(value))
}

fn read_blob(r: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !fill_or_eof(r, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Some(data))
}

/// Fills `buf` completely, or returns `Ok(false)` on a clean EOF at a
/// record boundary. EOF mid-record is an error.
fn fill_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated column record",
                ));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
