//! General backend behaviour: round trips, in-place overwrites,
//! rotation, restart persistence and the directory guard lock.

mod common;

use anyhow::Result;

use blobstore::{Backend, BlobFlags, DcFlags, Error, IterateControl, Key, ReadMode, StatRegister};

use common::{test_config, TestDir, Wrapper};

#[test]
fn write_read_roundtrip() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let small = Key::hashed(b"small");
    backend.write(&small, b"payload", 0, DcFlags::empty())?;
    assert_eq!(backend.read(&small, ReadMode::Csum)?, b"payload".to_vec());

    // spans three checksum chunks
    let big = Key::hashed(b"big");
    let payload: Vec<u8> = (0..2_500_000u32).map(|i| (i % 251) as u8).collect();
    backend.write(&big, &payload, 0, DcFlags::empty())?;
    assert_eq!(backend.read(&big, ReadMode::Csum)?, payload);
    assert_eq!(backend.read(&big, ReadMode::Nocsum)?, payload);

    assert_eq!(backend.stat_get(StatRegister::RecordsTotal), 2);
    Ok(())
}

#[test]
fn overwrite_in_place_keeps_one_record() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let key = Key::hashed(b"mutable");
    let first = backend.write(&key, b"aaaaaaaa", 0, DcFlags::empty())?;
    let second = backend.write(&key, b"bbbbbbbb", 0, DcFlags::empty())?;

    // same payload footprint, same slot
    assert_eq!(first.ctl_data_offset, second.ctl_data_offset);
    assert_eq!(backend.read(&key, ReadMode::Csum)?, b"bbbbbbbb".to_vec());
    assert_eq!(backend.stat_get(StatRegister::RecordsTotal), 1);
    assert_eq!(backend.stat_get(StatRegister::RecordsRemoved), 0);

    // a partial in-place update re-checksums the touched range
    backend.write(&key, b"cc", 3, DcFlags::empty())?;
    assert_eq!(backend.read(&key, ReadMode::Csum)?, b"bbbccbbb".to_vec());
    Ok(())
}

#[test]
fn growing_a_record_appends_a_new_copy() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let key = Key::hashed(b"growing");
    backend.write(&key, b"0123456789", 0, DcFlags::empty())?;
    // outgrows the old copy: old payload is carried forward around
    // the new range
    let wc = backend.write(&key, b"XYZ", 10, DcFlags::empty())?;
    assert_eq!(wc.total_data_size, 13);

    assert_eq!(backend.read(&key, ReadMode::Csum)?, b"0123456789XYZ".to_vec());
    assert_eq!(backend.stat_get(StatRegister::RecordsTotal), 2);
    assert_eq!(backend.stat_get(StatRegister::RecordsRemoved), 1);
    Ok(())
}

#[test]
fn writes_at_an_offset_into_a_fresh_key_zero_fill() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let key = Key::hashed(b"sparse");
    let wc = backend.write(&key, b"tail", 100, DcFlags::empty())?;
    assert_eq!(wc.total_data_size, 104);

    let payload = backend.read(&key, ReadMode::Csum)?;
    assert_eq!(payload.len(), 104);
    assert!(payload[..100].iter().all(|&b| b == 0));
    assert_eq!(&payload[100..], b"tail");
    Ok(())
}

#[test]
fn missing_keys_and_double_removes() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let key = Key::hashed(b"nothing here");
    assert!(matches!(backend.read(&key, ReadMode::Csum), Err(Error::NotFound)));
    let err = backend.remove(&key).unwrap_err();
    assert_eq!(err.errno(), -libc::ENOENT);

    backend.write(&key, b"x", 0, DcFlags::empty())?;
    backend.remove(&key)?;
    // removing twice reports the same status again
    assert!(matches!(backend.remove(&key), Err(Error::NotFound)));
    assert!(matches!(backend.read(&key, ReadMode::Csum), Err(Error::NotFound)));
    Ok(())
}

#[test]
fn restart_preserves_records_and_counters() -> Result<()> {
    let dir = TestDir::new();
    let mut wrapper = Wrapper::new(test_config(&dir.path));

    let mut keys = Vec::new();
    for seq in 0..25u64 {
        let key = Key::hashed(&seq.to_le_bytes());
        let value = format!("value-{}", seq);
        wrapper.get().write(&key, value.as_bytes(), 0, DcFlags::empty())?;
        keys.push((key, value));
    }
    wrapper.get().remove(&keys[3].0)?;

    wrapper.restart();
    let backend = wrapper.get();

    assert_eq!(backend.stat_get(StatRegister::RecordsTotal), 25);
    assert_eq!(backend.stat_get(StatRegister::RecordsRemoved), 1);
    for (seq, (key, value)) in keys.iter().enumerate() {
        if seq == 3 {
            assert!(matches!(backend.read(key, ReadMode::Csum), Err(Error::NotFound)));
        } else {
            assert_eq!(backend.read(key, ReadMode::Csum)?, value.as_bytes().to_vec());
        }
    }
    Ok(())
}

#[test]
fn rotation_spreads_records_over_bases() -> Result<()> {
    let dir = TestDir::new();
    let mut cfg = test_config(&dir.path);
    cfg.blob_flags = BlobFlags::L2HASH | BlobFlags::DISABLE_THREADS;
    cfg.records_in_blob = 3;

    let wrapper = Wrapper::new(cfg);
    let backend = wrapper.get();

    for seq in 0..7u64 {
        backend.write_hashed(&seq.to_le_bytes(), &seq.to_le_bytes(), 0, DcFlags::empty())?;
    }
    assert_eq!(backend.base_count(), 3);
    let info = backend.base_info();
    assert_eq!(info[0].records, 3);
    assert_eq!(info[1].records, 3);
    assert_eq!(info[2].records, 1);

    let mut seen = 0;
    backend.iterate(IterateControl::default(), |_, _| {
        seen += 1;
        Ok(())
    })?;
    assert_eq!(seen, 7);
    Ok(())
}

#[test]
fn auto_indexsort_keeps_rotated_bases_searchable() -> Result<()> {
    let dir = TestDir::new();
    let mut cfg = test_config(&dir.path);
    cfg.records_in_blob = 3;

    let wrapper = Wrapper::new(cfg);
    let backend = wrapper.get();

    for seq in 0..4u64 {
        backend.write_hashed(&seq.to_le_bytes(), &seq.to_le_bytes(), 0, DcFlags::empty())?;
    }

    let info = backend.base_info();
    assert!(info[0].sorted);
    assert!(!info[1].sorted);

    // records in the sorted base resolve through its sidecar
    for seq in 0..4u64 {
        let key = Key::hashed(&seq.to_le_bytes());
        assert_eq!(backend.read(&key, ReadMode::Csum)?, seq.to_le_bytes().to_vec());
    }

    // removes write through to the sorted base too
    backend.remove_hashed(&0u64.to_le_bytes())?;
    assert!(matches!(
        backend.read(&Key::hashed(&0u64.to_le_bytes()), ReadMode::Csum),
        Err(Error::NotFound)
    ));
    Ok(())
}

#[test]
fn second_backend_on_the_same_dir_is_rejected() {
    let dir = TestDir::new();
    let cfg = test_config(&dir.path);
    let _first = Backend::init(cfg.clone()).expect("first backend");

    let err = match Backend::init(cfg) {
        Err(err) => err,
        Ok(_) => panic!("second backend must not start"),
    };
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn blob_size_limit_rejects_writes() -> Result<()> {
    let dir = TestDir::new();
    let mut cfg = test_config(&dir.path);
    cfg.blob_size_limit = 8192;

    let wrapper = Wrapper::new(cfg);
    let backend = wrapper.get();

    backend.write_hashed(b"one", b"fits", 0, DcFlags::empty())?;
    let err = backend
        .write_hashed(b"two", &vec![0u8; 16384], 0, DcFlags::empty())
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ENOSPC);
    Ok(())
}

#[test]
fn compaction_reclaims_space_without_sorting() -> Result<()> {
    let dir = TestDir::new();
    let mut cfg = test_config(&dir.path);
    cfg.blob_flags = BlobFlags::L2HASH | BlobFlags::DISABLE_THREADS;
    cfg.records_in_blob = 10;

    let wrapper = Wrapper::new(cfg);
    let backend = wrapper.get();

    let mut keys = Vec::new();
    for seq in 0..11u64 {
        let key = Key::hashed(&seq.to_le_bytes());
        backend.write(&key, format!("value-{}", seq).as_bytes(), 0, DcFlags::empty())?;
        keys.push(key);
    }
    for key in keys.iter().take(5) {
        backend.remove(key)?;
    }

    let before = backend.base_info()[0].data_size;
    backend.datacompact(&[0])?;

    let info = backend.base_info();
    assert!(!info[0].sorted);
    assert_eq!(info[0].records, 5);
    assert_eq!(info[0].removed, 0);
    assert!(info[0].data_size < before);

    // survivors stay readable, in arrival order
    let mut seen = Vec::new();
    backend.iterate(IterateControl::default(), |dc, _| {
        seen.push(dc.key);
        Ok(())
    })?;
    assert_eq!(&seen[..5], &keys[5..10]);
    for key in keys.iter().skip(5) {
        backend.read(key, ReadMode::Csum)?;
    }
    Ok(())
}

#[test]
fn stats_snapshot_serializes_to_json() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    wrapper
        .get()
        .write_hashed(b"k", b"v", 0, DcFlags::empty())?;

    let json = wrapper.get().stats().to_json();
    assert!(json.contains("\"records_total\": 1"));
    assert!(json.contains("\"datasort_completion_status\": 0"));
    Ok(())
}
