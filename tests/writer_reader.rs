//! Writer/reader round trips: split and per-slice modes, hash
//! partitioning, the small-slice merge, parent extension and meta-only
//! writers.

mod common;

use std::collections::{HashMap, HashSet};

use common::{collect_rows, int_values, job, workspace};
use shardset::codec::{TypedWriter, value_hash};
use shardset::{
    BaseType, ColType, DatasetWriter, DatasetWriterOptions, DsId, Error, IterateOptions,
    SlicePick, Value,
};

#[test]
fn split_roundrobin_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    for v in 1..=5i64 {
        writer.split_write((v,)).unwrap();
    }
    let ds = writer.finish().unwrap();

    // Round-robin routing is positional, not content based.
    assert_eq!(ds.lines(), &[2, 1, 1, 1]);
    let all: HashSet<i64> = int_values(
        ds.iterate_values(SlicePick::All, "x", IterateOptions::new())
            .unwrap(),
    )
    .into_iter()
    .collect();
    assert_eq!(all, (1..=5).collect());
    for (sliceno, expect) in [(0, 2), (1, 1), (2, 1), (3, 1)] {
        let values = int_values(
            ds.iterate_values(SlicePick::One(sliceno), "x", IterateOptions::new())
                .unwrap(),
        );
        assert_eq!(values.len(), expect, "slice {sliceno}");
    }
    let col = &ds.columns()["x"];
    assert_eq!(col.min, Some(Value::Int(1)));
    assert_eq!(col.max, Some(Value::Int(5)));

    // Round-robin iteration restores the original write order.
    let rr = int_values(
        ds.iterate_values(SlicePick::RoundRobin, "x", IterateOptions::new())
            .unwrap(),
    );
    assert_eq!(rr, vec![1, 2, 3, 4, 5]);
}

#[test]
fn split_hashlabel_partitions_by_hash() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(
        &ws,
        &j,
        DatasetWriterOptions::new().with_hashlabel("k"),
    )
    .unwrap();
    writer.add("k", ColType::plain(BaseType::Int64)).unwrap();
    writer.add("v", ColType::plain(BaseType::Int64)).unwrap();
    for i in 0..10i64 {
        writer.split_write((i, i * 10)).unwrap();
    }
    let ds = writer.finish().unwrap();

    assert_eq!(ds.total_lines(), 10);
    assert_eq!(ds.hashlabel(), Some("k"));
    for sliceno in 0..4 {
        let rows = collect_rows(
            ds.iterate(SlicePick::One(sliceno), IterateOptions::new())
                .unwrap(),
        );
        for row in rows {
            // Columns iterate in name order: k, v.
            assert_eq!(value_hash(&row[0]) % 4, sliceno as u64);
            let (Value::Int(k), Value::Int(v)) = (&row[0], &row[1]) else {
                panic!("unexpected row {row:?}");
            };
            assert_eq!(*v, k * 10);
        }
    }
}

#[test]
fn all_write_surfaces_produce_identical_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let rows: Vec<(i64, &str)> = vec![(1, "a"), (2, "b"), (3, "c")];

    let mk = |name: &str| {
        let mut writer = DatasetWriter::create(
            &ws,
            &j,
            DatasetWriterOptions::new().with_name(name),
        )
        .unwrap();
        writer.add("num", ColType::plain(BaseType::Int64)).unwrap();
        writer.add("text", ColType::plain(BaseType::Unicode)).unwrap();
        writer
    };

    let mut w = mk("positional");
    for (num, text) in &rows {
        w.split_write((*num, *text)).unwrap();
    }
    let by_tuple = w.finish().unwrap();

    let mut w = mk("list");
    for (num, text) in &rows {
        w.split_write_list(&[Value::Int(*num), Value::Str((*text).to_owned())])
            .unwrap();
    }
    let by_list = w.finish().unwrap();

    let mut w = mk("dict");
    for (num, text) in &rows {
        let mut map = HashMap::new();
        map.insert("num".to_owned(), Value::Int(*num));
        map.insert("text".to_owned(), Value::Str((*text).to_owned()));
        w.split_write_dict(&map).unwrap();
    }
    let by_dict = w.finish().unwrap();

    let read = |ds: &shardset::Dataset| {
        collect_rows(ds.iterate(SlicePick::All, IterateOptions::new()).unwrap())
    };
    assert_eq!(read(&by_tuple), read(&by_list));
    assert_eq!(read(&by_tuple), read(&by_dict));
}

#[test]
fn per_slice_mode_verifies_the_hash_partition() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(
        &ws,
        &j,
        DatasetWriterOptions::new().with_hashlabel("k"),
    )
    .unwrap();
    writer.add("k", ColType::plain(BaseType::Int64)).unwrap();

    // Find values for slice 0 and some other slice.
    let of_slice = |s: u64| (0..100i64).find(|v| value_hash(&Value::Int(*v)) % 4 == s).unwrap();
    let mine = of_slice(0);
    let foreign = of_slice(1);

    writer.set_slice(0).unwrap();
    assert!(writer.hashcheck(&Value::Int(mine)).unwrap());
    assert!(!writer.hashcheck(&Value::Int(foreign)).unwrap());
    writer.write((mine,)).unwrap();
    let err = writer.write((foreign,)).unwrap_err();
    assert!(matches!(err, Error::Usage { .. }), "{err}");

    // With discard enabled the same write is silently dropped.
    writer.enable_hash_discard().unwrap();
    writer.write((foreign,)).unwrap();

    for sliceno in 1..4 {
        writer.set_slice(sliceno).unwrap();
        writer.enable_hash_discard().unwrap();
        for v in 0..100i64 {
            writer.write((v,)).unwrap();
        }
    }
    let ds = writer.finish().unwrap();
    assert_eq!(ds.lines()[0], 1);
    let per_slice: u64 = ds.lines()[1..].iter().sum();
    let expected: u64 = (0..100i64)
        .filter(|v| value_hash(&Value::Int(*v)) % 4 != 0)
        .count() as u64;
    assert_eq!(per_slice, expected);
}

#[test]
fn modes_cannot_be_mixed() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");

    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    writer.set_slice(0).unwrap();
    assert!(matches!(
        writer.split_write((1i64,)),
        Err(Error::Usage { .. })
    ));

    let mut writer = DatasetWriter::create(
        &ws,
        &j,
        DatasetWriterOptions::new().with_name("other"),
    )
    .unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    writer.split_write((1i64,)).unwrap();
    assert!(matches!(writer.set_slice(0), Err(Error::Usage { .. })));
}

#[test]
fn finish_requires_all_slices_and_consistent_columns() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    writer.set_slice(0).unwrap();
    writer.write((1i64,)).unwrap();
    // Slices 1..3 never written.
    assert!(matches!(writer.finish(), Err(Error::Usage { .. })));
}

#[test]
fn add_after_slice_choice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    writer.set_slice(0).unwrap();
    assert!(matches!(
        writer.add("y", ColType::plain(BaseType::Int64)),
        Err(Error::Usage { .. })
    ));
}

#[test]
fn duplicate_dataset_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let _first = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    assert!(matches!(
        DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()),
        Err(Error::Usage { .. })
    ));
}

#[test]
fn discard_removes_the_partial_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    writer.set_slice(0).unwrap();
    writer.write((1i64,)).unwrap();
    writer.discard().unwrap();
    assert!(!ws.job_dir(&j).join("default").exists());
    assert!(matches!(
        ws.dataset(&DsId::parse("jid-0").unwrap()),
        Err(Error::NoSuchDataset { .. })
    ));
}

#[test]
fn small_slices_merge_into_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("small", ColType::plain(BaseType::Bytes)).unwrap();
    writer.add("big", ColType::plain(BaseType::Bytes)).unwrap();
    // One record per slice; a bytes record is 4 length bytes + payload.
    let small_payload = vec![7u8; 102_396]; // 100 KiB per slice file
    let big_payload = vec![7u8; 1_048_572]; // 1 MiB per slice file
    for sliceno in 0..4 {
        writer.set_slice(sliceno).unwrap();
        writer
            .write_list(&[
                Value::Bytes(small_payload.clone()),
                Value::Bytes(big_payload.clone()),
            ])
            .unwrap();
    }
    let ds = writer.finish().unwrap();

    let small = &ds.columns()["small"];
    assert_eq!(
        small.offsets,
        Some(vec![0, 102_400, 204_800, 307_200]),
        "mean slice size 100 KiB is under the merge threshold"
    );
    let merged_path = ds.column_filename("small", None).unwrap();
    assert!(merged_path.ends_with("m.small"));
    assert_eq!(std::fs::metadata(&merged_path).unwrap().len(), 409_600);
    for sliceno in 0..4 {
        assert!(!ws.job_dir(&j).join(format!("default/{sliceno}.small")).exists());
    }

    let big = &ds.columns()["big"];
    assert_eq!(big.offsets, None);
    for sliceno in 0..4 {
        assert!(ws.job_dir(&j).join(format!("default/{sliceno}.big")).exists());
    }

    // Reading a merged column goes through the recorded offsets.
    for sliceno in 0..4 {
        let rows = collect_rows(
            ds.iterate(
                SlicePick::One(sliceno),
                IterateOptions::new().with_columns(["small"]),
            )
            .unwrap(),
        );
        assert_eq!(rows, vec![vec![Value::Bytes(small_payload.clone())]]);
    }
}

#[test]
fn parent_extension_carries_parent_columns() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(&ws, &j, DatasetWriterOptions::new()).unwrap();
    writer.add("a", ColType::plain(BaseType::Int64)).unwrap();
    for v in 0..8i64 {
        writer.split_write((v,)).unwrap();
    }
    let base = writer.finish().unwrap();

    let j2 = job("jid-1");
    let mut writer = DatasetWriter::create(
        &ws,
        &j2,
        DatasetWriterOptions::new()
            .with_name("extended")
            .with_parent(base.id().clone()),
    )
    .unwrap();
    writer.add("b", ColType::plain(BaseType::Unicode)).unwrap();
    // The parent wrote round-robin: 2 rows per slice.
    for sliceno in 0..4 {
        writer.set_slice(sliceno).unwrap();
        writer.write((format!("s{sliceno}r0"),)).unwrap();
        writer.write((format!("s{sliceno}r1"),)).unwrap();
    }
    let extended = writer.finish().unwrap();

    assert_eq!(
        extended.columns().keys().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(
        extended.parent(),
        Some(&shardset::Parent::Single(base.id().clone()))
    );
    assert_eq!(extended.lines(), base.lines());
    // Column a still resolves into the parent job's files.
    let a_path = extended.column_filename("a", Some(0)).unwrap();
    assert!(a_path.starts_with(ws.job_dir(&j)));
    let rows = collect_rows(
        extended
            .iterate(SlicePick::One(1), IterateOptions::new())
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], Value::Str("s1r0".into()));

    // Mismatched line counts are refused.
    let mut writer = DatasetWriter::create(
        &ws,
        &j2,
        DatasetWriterOptions::new()
            .with_name("wrong-lines")
            .with_parent(base.id().clone()),
    )
    .unwrap();
    writer.add("c", ColType::plain(BaseType::Int64)).unwrap();
    for sliceno in 0..4 {
        writer.set_slice(sliceno).unwrap();
        writer.write((1i64,)).unwrap(); // parent has 2 rows per slice
    }
    assert!(matches!(writer.finish(), Err(Error::Usage { .. })));
}

#[test]
fn meta_only_writers_take_externally_written_files() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    let mut writer = DatasetWriter::create(
        &ws,
        &j,
        DatasetWriterOptions::new().with_meta_only(true),
    )
    .unwrap();
    writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
    assert!(matches!(
        writer.write((1i64,)),
        Err(Error::Usage { .. })
    ));
    for sliceno in 0..4u64 {
        let path = writer.column_filename("x", Some(sliceno as usize)).unwrap();
        let mut col =
            TypedWriter::create(&path, ColType::plain(BaseType::Int64), None, None).unwrap();
        col.write(&Value::Int(sliceno as i64)).unwrap();
        col.close().unwrap();
        writer.set_lines(sliceno as usize, 1).unwrap();
        let mut minmax = HashMap::new();
        minmax.insert(
            "x".to_owned(),
            (
                Some(Value::Int(sliceno as i64)),
                Some(Value::Int(sliceno as i64)),
            ),
        );
        writer.set_minmax(sliceno as usize, minmax).unwrap();
    }
    let ds = writer.finish().unwrap();
    assert_eq!(ds.lines(), &[1, 1, 1, 1]);
    assert_eq!(ds.columns()["x"].min, Some(Value::Int(0)));
    assert_eq!(ds.columns()["x"].max, Some(Value::Int(3)));
    let values: HashSet<i64> = int_values(
        ds.iterate_values(SlicePick::All, "x", IterateOptions::new())
            .unwrap(),
    )
    .into_iter()
    .collect();
    assert_eq!(values, (0..4).collect());
}

#[test]
fn datasets_txt_records_finish_order() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(dir.path(), 4);
    let j = job("jid-0");
    for name in ["first", "second"] {
        let mut writer = DatasetWriter::create(
            &ws,
            &j,
            DatasetWriterOptions::new().with_name(name),
        )
        .unwrap();
        writer.add("x", ColType::plain(BaseType::Int64)).unwrap();
        writer.split_write((1i64,)).unwrap();
        writer.finish().unwrap();
    }
    let log = std::fs::read_to_string(ws.job_dir(&j).join("datasets.txt")).unwrap();
    assert_eq!(log, "first\nsecond\n");
    let names: Vec<String> = ws
        .job_datasets(&j)
        .unwrap()
        .iter()
        .map(|ds| ds.name().to_owned())
        .collect();
    assert_eq!(names, vec!["first", "second"]);
}
