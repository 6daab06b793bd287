// Store file creation/opening with header validation, append-only records,
// and file locking. One file per store; newest record per key wins.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{STORE_FORMAT_VERSION, store_version_error};
use crate::core::value::Value;

const MAGIC: [u8; 4] = *b"CNTM";
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 16;

const RECORD_HEADER_LEN: usize = 12;
const MAX_KEY_LEN: usize = 64 * 1024;
const MAX_VALUE_LEN: usize = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

/// Durable string-keyed store of [`Value`] records.
///
/// The on-disk layout is a fixed header followed by length-prefixed JSON
/// records. Writes append and sync before returning, so every `set` is
/// durable on its own. The full key index is held in memory; a later
/// record for a key supersedes earlier ones.
#[derive(Debug)]
pub struct CountStore {
    path: PathBuf,
    file: File,
    index: BTreeMap<String, Value>,
    mode: StoreMode,
}

impl CountStore {
    /// Create a fresh store file. Fails with `AlreadyExists` if the path
    /// is taken.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to create store")
                    .with_path(&path)
                    .with_source(err)
            })?;

        write_header(&mut file, &path)?;
        lock_store(&file, &path, StoreMode::ReadWrite)?;

        Ok(Self {
            path,
            file,
            index: BTreeMap::new(),
            mode: StoreMode::ReadWrite,
        })
    }

    /// Open an existing store read-only (shared lock).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_mode(path, StoreMode::ReadOnly)
    }

    /// Open an existing store for appending (exclusive lock).
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_mode(path, StoreMode::ReadWrite)
    }

    fn open_with_mode(path: impl AsRef<Path>, mode: StoreMode) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let writable = mode == StoreMode::ReadWrite;
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open store")
                    .with_path(&path)
                    .with_source(err)
            })?;

        lock_store(&file, &path, mode)?;
        read_header(&mut file, &path)?;
        let index = read_records(&mut file, &path)?;

        Ok(Self {
            path,
            file,
            index,
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<Value, Error> {
        self.index.get(key).cloned().ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("key not found")
                .with_path(&self.path)
                .with_key(key)
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Append one record and sync it to disk before returning.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), Error> {
        if self.mode == StoreMode::ReadOnly {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("store is opened read-only")
                .with_path(&self.path));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("key exceeds max length")
                .with_path(&self.path)
                .with_key(key.chars().take(64).collect::<String>()));
        }

        let payload = serde_json::to_vec(&value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to serialize value")
                .with_key(key)
                .with_source(err)
        })?;
        if payload.len() > MAX_VALUE_LEN {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("value exceeds max length")
                .with_path(&self.path)
                .with_key(key));
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + key.len() + payload.len());
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32 ^ 0xFFFF_FFFF).to_le_bytes());
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(&payload);

        self.file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.file.write_all(&record))
            .and_then(|_| self.file.sync_data())
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to append record")
                    .with_path(&self.path)
                    .with_key(key)
                    .with_source(err)
            })?;

        self.index.insert(key.to_string(), value);
        Ok(())
    }

    /// Final sync and unlock. Consumes the store; there is no reopen path
    /// on the same handle.
    pub fn close(self) -> Result<(), Error> {
        self.file.sync_all().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to sync store on close")
                .with_path(&self.path)
                .with_source(err)
        })?;
        let _ = fs2::FileExt::unlock(&self.file);
        Ok(())
    }
}

impl Drop for CountStore {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn lock_store(file: &File, path: &Path, mode: StoreMode) -> Result<(), Error> {
    // Fully qualified: std::fs::File grew inherent lock methods with the
    // same names but a different error type.
    let result = match mode {
        StoreMode::ReadWrite => fs2::FileExt::try_lock_exclusive(file),
        StoreMode::ReadOnly => fs2::FileExt::try_lock_shared(file),
    };
    result.map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("failed to lock store")
            .with_path(path)
            .with_source(err)
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn write_header(file: &mut File, path: &Path) -> Result<(), Error> {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4..8].copy_from_slice(&STORE_FORMAT_VERSION.to_le_bytes());
    buf[8] = ENDIANNESS_LE;

    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&buf))
        .and_then(|_| file.sync_data())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write store header")
                .with_path(path)
                .with_source(err)
        })
}

fn read_header(file: &mut File, path: &Path) -> Result<(), Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0)).map_err(|err| {
        Error::new(ErrorKind::Io).with_path(path).with_source(err)
    })?;
    file.read_exact(&mut buf).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("store header too small")
            .with_path(path)
            .with_source(err)
    })?;

    if buf[0..4] != MAGIC {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("bad magic")
            .with_path(path));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != STORE_FORMAT_VERSION {
        return Err(store_version_error(version).with_path(path));
    }
    if buf[8] != ENDIANNESS_LE {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("unsupported endianness")
            .with_path(path));
    }
    Ok(())
}

fn read_records(file: &mut File, path: &Path) -> Result<BTreeMap<String, Value>, Error> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))
        .and_then(|_| file.read_to_end(&mut bytes))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read store records")
                .with_path(path)
                .with_source(err)
        })?;

    let mut index = BTreeMap::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < RECORD_HEADER_LEN {
            return Err(truncated(path, offset));
        }
        let key_len = read_u32(&bytes, offset) as usize;
        let val_len = read_u32(&bytes, offset + 4) as usize;
        let val_len_xor = read_u32(&bytes, offset + 8);
        if val_len as u32 ^ 0xFFFF_FFFF != val_len_xor {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("torn record length")
                .with_path(path));
        }
        if key_len > MAX_KEY_LEN || val_len > MAX_VALUE_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record length out of bounds")
                .with_path(path));
        }
        let body_start = offset + RECORD_HEADER_LEN;
        let body_end = body_start + key_len + val_len;
        if body_end > bytes.len() {
            return Err(truncated(path, offset));
        }

        let key = std::str::from_utf8(&bytes[body_start..body_start + key_len])
            .map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("record key is not utf-8")
                    .with_path(path)
                    .with_source(err)
            })?
            .to_string();
        let value: Value = serde_json::from_slice(&bytes[body_start + key_len..body_end])
            .map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("record value is not valid json")
                    .with_path(path)
                    .with_key(&key)
                    .with_source(err)
            })?;

        index.insert(key, value);
        offset = body_end;
    }

    Ok(index)
}

fn truncated(path: &Path, offset: usize) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(format!("truncated record at offset {offset}"))
        .with_path(path)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::{CountStore, HEADER_SIZE};
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    fn scalar(count: i64) -> Value {
        Value::Scalar(count)
    }

    #[test]
    fn create_set_get_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");

        let mut store = CountStore::create(&path).expect("create");
        store.set("geneX", scalar(3)).expect("set");
        store.set("geneY", scalar(4)).expect("set");
        store.set("geneX", scalar(7)).expect("overwrite");
        assert_eq!(store.len(), 2);
        store.close().expect("close");

        let store = CountStore::open(&path).expect("reopen");
        assert_eq!(store.get("geneX").expect("get").as_scalar(), Some(7));
        assert_eq!(store.get("geneY").expect("get").as_scalar(), Some(4));
        assert!(store.contains("geneX"));
        assert!(!store.contains("geneZ"));
    }

    #[test]
    fn create_refuses_existing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        CountStore::create(&path).expect("create").close().expect("close");

        let err = CountStore::create(&path).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn open_missing_store_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = CountStore::open(dir.path().join("missing.store")).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .expect("create");
        file.write_all(b"NOPE000000000000").expect("write");
        file.flush().expect("flush");
        drop(file);

        let err = CountStore::open(&path).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn truncated_tail_record_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        let mut store = CountStore::create(&path).expect("create");
        store.set("geneX", scalar(3)).expect("set");
        store.close().expect("close");

        let len = std::fs::metadata(&path).expect("meta").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open");
        file.set_len(len - 2).expect("truncate");
        drop(file);

        let err = CountStore::open(&path).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn future_format_version_is_gated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        CountStore::create(&path).expect("create").close().expect("close");

        let mut file = OpenOptions::new().write(true).open(&path).expect("open");
        file.seek(SeekFrom::Start(4)).expect("seek");
        file.write_all(&99u32.to_le_bytes()).expect("write");
        drop(file);

        let err = CountStore::open(&path).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.to_string().contains("unsupported store format version"));
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        CountStore::create(&path).expect("create").close().expect("close");

        let mut store = CountStore::open(&path).expect("open");
        let err = store.set("geneX", scalar(1)).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn nested_values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counts.store");
        let value: Value =
            serde_json::from_str(r#"{"exon":{"5":10,"3":[1,2,3]}}"#).expect("decode");

        let mut store = CountStore::create(&path).expect("create");
        store.set("ENST0001", value.clone()).expect("set");
        store.close().expect("close");

        let store = CountStore::open(&path).expect("reopen");
        assert_eq!(store.get("ENST0001").expect("get"), value);
    }

    #[test]
    fn header_size_is_stable() {
        assert_eq!(HEADER_SIZE, 16);
    }
}
