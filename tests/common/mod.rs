//! Shared fixtures for the integration suites: temp store
//! directories, a restartable backend wrapper, deterministic item
//! generation and byte-level file patching.

#![allow(dead_code)]

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use blobstore::{Backend, BlobConfig, BlobFlags, DcFlags, Key};

/// Temporary store directory, removed on drop.
pub struct TestDir {
    pub path: PathBuf,
}

impl TestDir {
    pub fn new() -> TestDir {
        let _ = env_logger::builder().is_test(true).try_init();
        let template = std::env::temp_dir().join("blobstore-test-XXXXXX");
        let mut buf = CString::new(template.into_os_string().into_vec()).expect("template").into_bytes_with_nul();
        let ptr = unsafe { libc::mkdtemp(buf.as_mut_ptr() as *mut libc::c_char) };
        assert!(!ptr.is_null(), "mkdtemp");
        buf.truncate(buf.len() - 1);
        let path = PathBuf::from(std::ffi::OsString::from_vec(buf));
        TestDir { path }
    }

    pub fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.path.join(name);
        std::fs::create_dir_all(&dir).expect("creating subdir");
        dir
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Test configuration mirroring the defaults the store is usually
/// embedded with: no background thread, no fsync, L2 hashed index.
pub fn test_config(dir: &Path) -> BlobConfig {
    let mut cfg = BlobConfig::default();
    cfg.file = dir.join("data");
    cfg.blob_flags = BlobFlags::L2HASH | BlobFlags::DISABLE_THREADS | BlobFlags::AUTO_INDEXSORT;
    cfg.sync = -2;
    cfg.chunks_dir = Some(dir.to_owned());
    cfg.stat_id = 12345;
    cfg
}

/// A backend plus everything needed to restart it in place.
pub struct Wrapper {
    pub cfg: BlobConfig,
    backend: Option<Backend>,
}

impl Wrapper {
    pub fn new(cfg: BlobConfig) -> Wrapper {
        let backend = Backend::init(cfg.clone()).expect("backend init");
        Wrapper {
            cfg,
            backend: Some(backend),
        }
    }

    pub fn get(&self) -> &Backend {
        self.backend.as_ref().expect("backend is running")
    }

    pub fn restart(&mut self) {
        self.backend = None;
        self.backend = Some(Backend::init(self.cfg.clone()).expect("backend restart"));
    }

    pub fn stop(&mut self) {
        self.backend = None;
    }

    /// Path of base `num`'s data file.
    pub fn data_path(&self, num: u64) -> PathBuf {
        let mut os = self.cfg.file.as_os_str().to_owned();
        os.push(format!(".{}", num));
        PathBuf::from(os)
    }
}

pub fn read_byte(path: &Path, offset: u64) -> u8 {
    let mut file = OpenOptions::new().read(true).open(path).expect("open");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    let mut buf = [0u8; 1];
    file.read_exact(&mut buf).expect("read byte");
    buf[0]
}

pub fn write_byte(path: &Path, offset: u64, value: u8) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&[value]).expect("write byte");
}

/// One generated record plus its shadow bookkeeping.
pub struct Item {
    pub seq: u64,
    pub key: Key,
    pub value: Vec<u8>,
    pub removed: bool,
    pub checked: bool,
}

impl Item {
    pub fn flags(&self) -> DcFlags {
        DcFlags::empty()
    }
}

/// Deterministic pseudo-random item source (xorshift64), roughly the
/// usual payload mix: mostly small values with the occasional
/// multi-megabyte record to cross a checksum chunk boundary.
pub struct ItemGenerator {
    state: u64,
}

impl ItemGenerator {
    pub fn new(seed: u64) -> ItemGenerator {
        ItemGenerator {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn generate(&mut self, seq: u64) -> Item {
        let size = if self.next_u64() % 10 == 0 {
            2 * 1024 * 1024
        } else {
            (self.next_u64() % 1024 + 1) as usize
        };
        let mut value = vec![0u8; size];
        for chunk in value.chunks_mut(8) {
            let word = self.next_u64().to_le_bytes();
            let len = chunk.len();
            chunk.copy_from_slice(&word[..len]);
        }
        Item {
            seq,
            key: Key::hashed(&seq.to_le_bytes()),
            value,
            removed: false,
            checked: false,
        }
    }
}

/// Insert `count` fresh items, extending the shadow list.
pub fn fill(wrapper: &Wrapper, items: &mut Vec<Item>, generator: &mut ItemGenerator, count: u64) {
    let start = items.len() as u64;
    for seq in start..start + count {
        let item = generator.generate(seq);
        wrapper
            .get()
            .write(&item.key, &item.value, 0, item.flags())
            .expect("insert item");
        items.push(item);
    }
}

pub fn remove_item(wrapper: &Wrapper, item: &mut Item) {
    wrapper.get().remove(&item.key).expect("remove item");
    item.removed = true;
}

pub fn filter_items(items: &mut Vec<Item>) {
    items.retain(|item| !item.removed);
}

pub fn sort_items(items: &mut Vec<Item>) {
    items.sort_by(|a, b| a.key.cmp(&b.key));
}
