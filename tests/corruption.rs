//! Corruption handling: header, payload and footer damage, the
//! `CORRUPTED` accounting and its persistence across restarts.

mod common;

use anyhow::Result;

use blobstore::{DcFlags, Error, Key, ReadMode, StatRegister};

use common::{read_byte, test_config, write_byte, TestDir, Wrapper};

const USER_FLAG_BITS: u64 = 1 << 30;

fn user_flag() -> DcFlags {
    DcFlags::from_bits_truncate(USER_FLAG_BITS)
}

#[test]
fn header_corruption_is_not_counted() -> Result<()> {
    // a damaged header makes the record unreadable (-EINVAL), but it
    // is not data corruption: the payload itself still checks out
    let dir = TestDir::new();
    let mut wrapper = Wrapper::new(test_config(&dir.path));

    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);

    let key = Key::hashed(b"some key");
    let data = b"some data\0";

    let wc = wrapper.get().write(&key, data, 0, user_flag())?;
    assert_eq!(wc.flags, user_flag() | DcFlags::CHUNKED_CSUM);

    let data_path = wrapper.data_path(0);
    let original = read_byte(&data_path, 0);
    write_byte(&data_path, 0, b'a');

    // checksum verification does not look at the header
    wrapper.get().verify_checksum(&key)?;
    // both read modes compare the header copies
    assert!(matches!(
        wrapper.get().read(&key, ReadMode::Csum),
        Err(Error::HeaderInconsistent)
    ));
    let err = wrapper.get().read(&key, ReadMode::Nocsum).unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);

    let wc = wrapper.get().lookup(&key)?;
    assert_eq!(wc.flags, user_flag() | DcFlags::CHUNKED_CSUM);
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);

    write_byte(&data_path, 0, original);
    wrapper.get().verify_checksum(&key)?;
    assert_eq!(wrapper.get().read(&key, ReadMode::Csum)?, data.to_vec());
    let wc = wrapper.get().lookup(&key)?;
    assert_eq!(wc.flags, user_flag() | DcFlags::CHUNKED_CSUM);

    wrapper.restart();

    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);
    wrapper.get().remove(&key)?;
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);
    Ok(())
}

#[test]
fn data_corruption_marks_the_record() -> Result<()> {
    let dir = TestDir::new();
    let mut wrapper = Wrapper::new(test_config(&dir.path));

    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);

    let key = Key::hashed(b"some key");
    let data = b"some data\0";

    let wc = wrapper.get().write(&key, data, 0, user_flag())?;
    assert_eq!(wc.base_index, 0);
    assert_eq!(wc.ctl_index_offset, 0);
    assert_eq!(wc.ctl_data_offset, 0);
    assert_eq!(wc.flags, user_flag() | DcFlags::CHUNKED_CSUM);
    assert_eq!(wc.size, data.len() as u64);
    assert_eq!(wc.total_data_size, data.len() as u64);

    wrapper.get().verify_checksum(&key)?;

    let data_path = wrapper.data_path(0);
    let original = read_byte(&data_path, wc.data_offset);
    write_byte(&data_path, wc.data_offset, b'a');

    let err = wrapper.get().verify_checksum(&key).unwrap_err();
    assert_eq!(err.errno(), -libc::EILSEQ);
    assert!(matches!(
        wrapper.get().read(&key, ReadMode::Csum),
        Err(Error::ChecksumMismatch)
    ));
    // reading without verification still works
    let read_back = wrapper.get().read(&key, ReadMode::Nocsum)?;
    assert_eq!(read_back.len(), data.len());

    let wc = wrapper.get().lookup(&key)?;
    assert_eq!(
        wc.flags,
        user_flag() | DcFlags::CHUNKED_CSUM | DcFlags::CORRUPTED
    );
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);

    // restoring the byte heals verification, the mark stays
    write_byte(&data_path, wc.data_offset, original);
    wrapper.get().verify_checksum(&key)?;
    assert_eq!(wrapper.get().read(&key, ReadMode::Csum)?, data.to_vec());
    let wc = wrapper.get().lookup(&key)?;
    assert!(wc.flags.contains(DcFlags::CORRUPTED));
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);

    wrapper.restart();

    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);
    wrapper.get().remove(&key)?;
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);
    assert_eq!(wrapper.get().stat_get(StatRegister::CorruptedSize), 0);
    wrapper.stop();
    Ok(())
}

#[test]
fn footer_corruption_marks_the_record() -> Result<()> {
    let dir = TestDir::new();
    let mut wrapper = Wrapper::new(test_config(&dir.path));

    let key = Key::hashed(b"some key");
    let data = b"some data\0";

    let wc = wrapper.get().write(&key, data, 0, user_flag())?;
    assert_eq!(wc.flags, user_flag() | DcFlags::CHUNKED_CSUM);

    let footer_offset = wc.data_offset + wc.total_data_size;
    let data_path = wrapper.data_path(0);
    let original = read_byte(&data_path, footer_offset);
    write_byte(&data_path, footer_offset, b'a');

    let err = wrapper.get().verify_checksum(&key).unwrap_err();
    assert_eq!(err.errno(), -libc::EILSEQ);
    assert!(matches!(
        wrapper.get().read(&key, ReadMode::Csum),
        Err(Error::ChecksumMismatch)
    ));
    wrapper.get().read(&key, ReadMode::Nocsum)?;
    let wc = wrapper.get().lookup(&key)?;
    assert_eq!(
        wc.flags,
        user_flag() | DcFlags::CHUNKED_CSUM | DcFlags::CORRUPTED
    );
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);

    write_byte(&data_path, footer_offset, original);
    wrapper.get().verify_checksum(&key)?;
    wrapper.get().read(&key, ReadMode::Csum)?;
    let wc = wrapper.get().lookup(&key)?;
    assert!(wc.flags.contains(DcFlags::CORRUPTED));
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);

    wrapper.restart();

    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 1);
    wrapper.get().remove(&key)?;
    assert_eq!(wrapper.get().stat_get(StatRegister::RecordsCorrupted), 0);
    Ok(())
}

#[test]
fn inspection_sweep_counts_every_corrupted_record() -> Result<()> {
    const TOTAL: u64 = 100;

    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let mut keys = Vec::new();
    for seq in 0..TOTAL {
        let key = Key::hashed(&seq.to_le_bytes());
        let value = format!("value-{:04}", seq);
        backend.write(&key, value.as_bytes(), 0, DcFlags::empty())?;
        keys.push((key, value));
    }

    // corrupt every 10th record on disk
    let data_path = wrapper.data_path(0);
    let mut corrupted = Vec::new();
    for (seq, (key, _)) in keys.iter().enumerate() {
        if seq % 10 != 0 {
            continue;
        }
        let wc = backend.lookup(key)?;
        let byte = read_byte(&data_path, wc.data_offset);
        write_byte(&data_path, wc.data_offset, byte.wrapping_add(1));
        corrupted.push(*key);
    }

    backend.inspect()?;
    assert_eq!(
        backend.stat_get(StatRegister::RecordsCorrupted),
        corrupted.len() as i64
    );

    // reads on a corrupted key fail but do not bump the counter again
    assert!(matches!(
        backend.read(&corrupted[0], ReadMode::Csum),
        Err(Error::ChecksumMismatch)
    ));
    assert_eq!(
        backend.stat_get(StatRegister::RecordsCorrupted),
        corrupted.len() as i64
    );

    // removing one corrupted record decrements the counter
    backend.remove(&corrupted[0])?;
    assert_eq!(
        backend.stat_get(StatRegister::RecordsCorrupted),
        corrupted.len() as i64 - 1
    );

    // rewriting one corrupted record decrements it as well
    backend.write(&corrupted[1], b"value-fresh", 0, DcFlags::empty())?;
    assert_eq!(
        backend.stat_get(StatRegister::RecordsCorrupted),
        corrupted.len() as i64 - 2
    );
    backend.read(&corrupted[1], ReadMode::Csum)?;

    for key in &corrupted[2..] {
        backend.remove(key)?;
    }
    assert_eq!(backend.stat_get(StatRegister::RecordsCorrupted), 0);
    assert_eq!(backend.stat_get(StatRegister::CorruptedSize), 0);
    Ok(())
}

#[test]
fn nocsum_records_never_verify() -> Result<()> {
    let dir = TestDir::new();
    let wrapper = Wrapper::new(test_config(&dir.path));
    let backend = wrapper.get();

    let key = Key::hashed(b"unchecked");
    let wc = backend.write(&key, b"payload", 0, DcFlags::NOCSUM)?;
    assert!(wc.flags.contains(DcFlags::NOCSUM));
    assert!(!wc.flags.contains(DcFlags::CHUNKED_CSUM));

    // corrupt the payload; csum reads still succeed
    let data_path = wrapper.data_path(0);
    write_byte(&data_path, wc.data_offset, b'X');
    backend.verify_checksum(&key)?;
    let read_back = backend.read(&key, ReadMode::Csum)?;
    assert_eq!(read_back[0], b'X');
    assert_eq!(backend.stat_get(StatRegister::RecordsCorrupted), 0);
    Ok(())
}
