use std::fs;

use time::macros::{date, datetime, time};

use super::{HashFilterReader, TypedReader, TypedWriter, value_hash};
use crate::types::{BaseType, ColType};
use crate::value::Value;

fn roundtrip(coltype: ColType, values: &[Value]) -> Vec<Value> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, coltype, None, None).unwrap();
    for v in values {
        assert!(writer.write(v).unwrap());
    }
    let stats = writer.close().unwrap();
    assert_eq!(stats.count, values.len() as u64);
    TypedReader::open(&path, coltype.base, None, None)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn fixed_width_round_trips() {
    let values = vec![Value::Int(-3), Value::Int(0), Value::Int(i64::MAX)];
    assert_eq!(roundtrip(ColType::plain(BaseType::Int64), &values), values);

    let values = vec![Value::Uint(0), Value::Uint(u64::MAX)];
    assert_eq!(roundtrip(ColType::plain(BaseType::Bits64), &values), values);

    let values = vec![Value::Float(1.5), Value::Float(-0.25)];
    assert_eq!(roundtrip(ColType::plain(BaseType::Float64), &values), values);

    let values = vec![Value::Bool(true), Value::Bool(false)];
    assert_eq!(roundtrip(ColType::plain(BaseType::Bool), &values), values);
}

#[test]
fn number_mixes_ints_and_floats() {
    let values = vec![Value::Int(7), Value::Float(2.5), Value::Int(-1)];
    assert_eq!(roundtrip(ColType::plain(BaseType::Number), &values), values);
}

#[test]
fn temporal_round_trips() {
    let values = vec![Value::Date(date!(2019 - 12 - 31)), Value::Date(date!(1970 - 01 - 01))];
    assert_eq!(roundtrip(ColType::plain(BaseType::Date), &values), values);

    let values = vec![Value::Time(time!(23:59:59.999)), Value::Time(time!(0:00))];
    assert_eq!(roundtrip(ColType::plain(BaseType::Time), &values), values);

    let values = vec![Value::DateTime(datetime!(2020-02-29 12:34:56))];
    assert_eq!(roundtrip(ColType::plain(BaseType::DateTime), &values), values);
}

#[test]
fn variable_width_round_trips() {
    let values = vec![
        Value::Str("hello".into()),
        Value::Str(String::new()),
        Value::Str("åäö".into()),
    ];
    assert_eq!(roundtrip(ColType::plain(BaseType::Unicode), &values), values);

    let values = vec![Value::Bytes(vec![0, 255, 1]), Value::Bytes(Vec::new())];
    assert_eq!(roundtrip(ColType::plain(BaseType::Bytes), &values), values);

    let values = vec![Value::Json(serde_json::json!({"a": [1, 2, null]}))];
    assert_eq!(roundtrip(ColType::plain(BaseType::Json), &values), values);
}

#[test]
fn minmax_tracking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
    for v in [5, -2, 9, 0] {
        writer.write(&Value::Int(v)).unwrap();
    }
    let stats = writer.close().unwrap();
    assert_eq!(stats.min, Some(Value::Int(-2)));
    assert_eq!(stats.max, Some(Value::Int(9)));

    let path = dir.path().join("text");
    let mut writer =
        TypedWriter::create(&path, ColType::plain(BaseType::Unicode), None, None).unwrap();
    writer.write(&Value::Str("b".into())).unwrap();
    let stats = writer.close().unwrap();
    assert_eq!(stats.min, None);
    assert_eq!(stats.max, None);
}

#[test]
fn default_substitutes_rejected_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(
        &path,
        ColType::plain(BaseType::Int32),
        Some(Value::Int(-1)),
        None,
    )
    .unwrap();
    writer.write(&Value::Int(42)).unwrap();
    writer.write(&Value::Str("nope".into())).unwrap();
    writer.write(&Value::Int(i64::MAX)).unwrap(); // out of i32 range
    writer.close().unwrap();
    let values: Vec<_> = TypedReader::open(&path, BaseType::Int32, None, None)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(values, vec![Value::Int(42), Value::Int(-1), Value::Int(-1)]);
}

#[test]
fn rejection_without_default_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
    assert!(writer.write(&Value::Str("x".into())).is_err());
}

#[test]
fn parsed_variants_convert_strings() {
    let values = [
        Value::Str("12".into()),
        Value::Str(" -7 ".into()),
        Value::Int(3),
    ];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let coltype = ColType::parsed(BaseType::Int64).unwrap();
    let mut writer = TypedWriter::create(&path, coltype, None, None).unwrap();
    for v in &values {
        writer.write(v).unwrap();
    }
    writer.close().unwrap();
    let read: Vec<_> = TypedReader::open(&path, BaseType::Int64, None, None)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(read, vec![Value::Int(12), Value::Int(-7), Value::Int(3)]);
}

#[test]
fn hashfilter_writer_drops_other_slices() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(
        &path,
        ColType::plain(BaseType::Int64),
        None,
        Some((1, 4)),
    )
    .unwrap();
    let mut kept = Vec::new();
    for i in 0..64 {
        let v = Value::Int(i);
        if writer.write(&v).unwrap() {
            kept.push(v);
        }
    }
    assert!(!kept.is_empty());
    for v in &kept {
        assert_eq!(value_hash(v) % 4, 1);
    }
    writer.close().unwrap();
    let read: Vec<_> = TypedReader::open(&path, BaseType::Int64, None, None)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(read, kept);
}

#[test]
fn hashfilter_reader_is_a_predicate_stream() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
    let values: Vec<_> = (0..16).map(Value::Int).collect();
    for v in &values {
        writer.write(v).unwrap();
    }
    writer.close().unwrap();
    let picks: Vec<bool> = HashFilterReader::open(&path, BaseType::Int64, None, None, 2, 4)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    for (v, picked) in values.iter().zip(&picks) {
        assert_eq!(*picked, value_hash(v) % 4 == 2);
    }
}

#[test]
fn seek_and_max_count_read_one_slice() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
    for i in 0..10 {
        writer.write(&Value::Int(i)).unwrap();
    }
    writer.close().unwrap();
    // Records are 8 bytes; read the middle "slice" of 4.
    let read: Vec<_> = TypedReader::open(&path, BaseType::Int64, Some(8 * 3), Some(4))
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(
        read,
        vec![Value::Int(3), Value::Int(4), Value::Int(5), Value::Int(6)]
    );
}

#[test]
fn integral_floats_hash_like_ints() {
    assert_eq!(value_hash(&Value::Float(5.0)), value_hash(&Value::Int(5)));
    assert_eq!(value_hash(&Value::Uint(5)), value_hash(&Value::Int(5)));
    assert_ne!(value_hash(&Value::Float(5.5)), value_hash(&Value::Int(5)));
}

#[test]
fn truncated_file_reports_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("col");
    let mut writer = TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
    writer.write(&Value::Int(1)).unwrap();
    writer.close().unwrap();
    let data = fs::read(&path).unwrap();
    fs::write(&path, &data[..5]).unwrap();
    let mut reader = TypedReader::open(&path, BaseType::Int64, None, None).unwrap();
    assert!(reader.next().unwrap().is_err());
}
