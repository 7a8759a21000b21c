//! Durable backends behind the record store.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::records::ReconfigurationRecord;
use crate::utils::ReconError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Default number of appended entries below which the log is never
/// compacted.
const COMPACT_MIN_ENTRIES: usize = 4096;

/// The log is compacted once it holds this many entries per live record.
const COMPACT_RATIO: usize = 4;

/// Narrow key/value interface over durable storage of records, keyed by
/// service name.
pub trait RecordBackend: Send + Sync {
    /// Reads the record of `name`.
    fn get(&self, name: &str) -> Result<Option<ReconfigurationRecord>, ReconError>;

    /// Durably writes a record, replacing any previous version.
    fn put(&self, record: &ReconfigurationRecord) -> Result<(), ReconError>;

    /// Durably removes the record of `name`.
    fn delete(&self, name: &str) -> Result<(), ReconError>;

    /// Reads every stored record.
    fn scan(&self) -> Result<Vec<ReconfigurationRecord>, ReconError>;
}

/// Volatile backend with switchable write failures.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    table: Mutex<HashMap<String, ReconfigurationRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `put`s and `delete`s fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), ReconError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(ReconError::msg("injected backend write failure"))
        } else {
            Ok(())
        }
    }

    fn table(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, HashMap<String, ReconfigurationRecord>>,
        ReconError,
    > {
        self.table
            .lock()
            .map_err(|_| ReconError::msg("memory backend lock poisoned"))
    }
}

impl RecordBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<ReconfigurationRecord>, ReconError> {
        Ok(self.table()?.get(name).cloned())
    }

    fn put(&self, record: &ReconfigurationRecord) -> Result<(), ReconError> {
        self.check_writable()?;
        self.table()?.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), ReconError> {
        self.check_writable()?;
        self.table()?.remove(name);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ReconfigurationRecord>, ReconError> {
        Ok(self.table()?.values().cloned().collect())
    }
}

/// Entry of the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalEntry {
    Put(ReconfigurationRecord),
    Delete(String),
}

#[derive(Debug)]
struct WalInner {
    file: File,
    table: HashMap<String, ReconfigurationRecord>,

    /// Entries in the log file, live or superseded.
    num_entries: usize,
}

/// Append-only log of length-prefixed MessagePack entries, replayed on open.
/// Compacts itself once superseded entries dominate the file.
#[derive(Debug)]
pub struct WalBackend {
    path: PathBuf,
    sync: bool,
    compact_min_entries: usize,
    inner: Mutex<WalInner>,
}

impl WalBackend {
    /// Opens (creating if missing) the log at `path` and replays it. A torn
    /// entry at the tail, including one with a nonsensical length prefix,
    /// is cut off.
    pub fn open(path: &Path, sync: bool) -> Result<Self, ReconError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let mut table = HashMap::new();
        let mut offset = 0;
        let mut replayed = 0;
        while offset + 8 <= content.len() {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&content[offset..offset + 8]);
            let entry_end = usize::try_from(u64::from_be_bytes(len_bytes))
                .ok()
                .and_then(|len| (offset + 8).checked_add(len));
            let Some(entry_end) = entry_end.filter(|&end| end <= content.len())
            else {
                break;
            };
            match decode_from_slice::<WalEntry>(&content[offset + 8..entry_end])? {
                WalEntry::Put(record) => {
                    table.insert(record.name.clone(), record);
                }
                WalEntry::Delete(name) => {
                    table.remove(&name);
                }
            }
            replayed += 1;
            offset = entry_end;
        }
        if offset < content.len() {
            pf_warn!(
                "cutting torn tail of '{}' at offset {}",
                path.display(),
                offset
            );
            file.set_len(offset as u64)?;
        }
        pf_info!(
            "replayed {} entries ({} records) from '{}'",
            replayed,
            table.len(),
            path.display()
        );

        Ok(WalBackend {
            path: path.into(),
            sync,
            compact_min_entries: COMPACT_MIN_ENTRIES,
            inner: Mutex::new(WalInner {
                file,
                table,
                num_entries: replayed,
            }),
        })
    }

    /// Sets the entry count below which the log is never compacted.
    pub fn with_compact_min_entries(mut self, min_entries: usize) -> Self {
        self.compact_min_entries = min_entries.max(1);
        self
    }

    /// Number of entries currently in the log file.
    pub fn num_entries(&self) -> Result<usize, ReconError> {
        Ok(self.inner()?.num_entries)
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, WalInner>, ReconError> {
        self.inner
            .lock()
            .map_err(|_| ReconError::msg("wal backend lock poisoned"))
    }

    /// Appends one entry. A failed write is cut back off the file so the log
    /// never holds a torn entry in the middle.
    fn append(&self, file: &mut File, entry: &WalEntry) -> Result<(), ReconError> {
        let entry_bytes = encode_to_vec(entry)?;
        let mut buf = Vec::with_capacity(8 + entry_bytes.len());
        buf.extend_from_slice(&(entry_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&entry_bytes);
        let prev_len = file.metadata()?.len();
        if let Err(e) = file.write_all(&buf) {
            if let Err(te) = file.set_len(prev_len) {
                pf_error!("error truncating '{}': {}", self.path.display(), te);
            }
            return Err(e.into());
        }
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Counts an appended entry whose effect is already in the table, then
    /// compacts the log if it grew too far beyond the live records.
    fn count_and_maybe_compact(&self, inner: &mut WalInner) {
        inner.num_entries += 1;
        if inner.num_entries >= self.compact_min_entries
            && inner.num_entries > COMPACT_RATIO * inner.table.len().max(1)
        {
            // the entry is durable already; a failed compaction only keeps
            // the log long
            if let Err(e) = self.compact_locked(inner) {
                pf_error!("error compacting '{}': {}", self.path.display(), e);
            }
        }
    }

    /// Rewrites the log with one entry per live record.
    pub fn compact(&self) -> Result<(), ReconError> {
        let mut inner = self.inner()?;
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut WalInner) -> Result<(), ReconError> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in inner.table.values() {
                self.append(&mut tmp, &WalEntry::Put(record.clone()))?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        inner.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        inner.num_entries = inner.table.len();
        pf_info!("compacted '{}' to {} records", self.path.display(), inner.table.len());
        Ok(())
    }
}

impl RecordBackend for WalBackend {
    fn get(&self, name: &str) -> Result<Option<ReconfigurationRecord>, ReconError> {
        Ok(self.inner()?.table.get(name).cloned())
    }

    fn put(&self, record: &ReconfigurationRecord) -> Result<(), ReconError> {
        let mut inner = self.inner()?;
        self.append(&mut inner.file, &WalEntry::Put(record.clone()))?;
        inner.table.insert(record.name.clone(), record.clone());
        self.count_and_maybe_compact(&mut inner);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), ReconError> {
        let mut inner = self.inner()?;
        self.append(&mut inner.file, &WalEntry::Delete(name.into()))?;
        inner.table.remove(name);
        self.count_and_maybe_compact(&mut inner);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ReconfigurationRecord>, ReconError> {
        Ok(self.inner()?.table.values().cloned().collect())
    }
}

#[cfg(test)]
mod backend_tests {
    use super::*;
    use std::collections::BTreeSet;

    fn record(name: &str) -> ReconfigurationRecord {
        let actives: BTreeSet<_> = ["AR0", "AR1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ReconfigurationRecord::new_creation(name, actives, "k = 'v'")
    }

    /// Log path unique to this test process.
    fn wal_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("gigarecon_test_wal_{}_{}.wal", tag, std::process::id()))
    }

    #[test]
    fn memory_fail_injection() -> Result<(), ReconError> {
        let backend = MemoryBackend::new();
        backend.put(&record("alice"))?;
        backend.set_fail_writes(true);
        assert!(backend.put(&record("bob")).is_err());
        assert!(backend.delete("alice").is_err());
        backend.set_fail_writes(false);
        assert_eq!(backend.scan()?.len(), 1);
        assert!(backend.get("alice")?.is_some());
        Ok(())
    }

    #[test]
    fn wal_replay_and_compact() -> Result<(), ReconError> {
        let path = &wal_path("replay");
        let _ = fs::remove_file(path);
        {
            let wal = WalBackend::open(path, false)?;
            wal.put(&record("alice"))?;
            wal.put(&record("bob"))?;
            wal.delete("alice")?;
        }
        {
            let wal = WalBackend::open(path, true)?;
            assert!(wal.get("alice")?.is_none());
            assert_eq!(wal.get("bob")?, Some(record("bob")));
            wal.compact()?;
            wal.put(&record("carol"))?;
        }
        let wal = WalBackend::open(path, false)?;
        let mut names: Vec<String> =
            wal.scan()?.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["bob".to_string(), "carol".to_string()]);
        Ok(())
    }

    #[test]
    fn wal_torn_tail() -> Result<(), ReconError> {
        let path = &wal_path("torn");
        let _ = fs::remove_file(path);
        {
            let wal = WalBackend::open(path, false)?;
            wal.put(&record("alice"))?;
        }
        {
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(&[0, 0, 0, 0, 0, 0, 1, 0, 7])?;
        }
        let wal = WalBackend::open(path, false)?;
        assert_eq!(wal.scan()?.len(), 1);
        wal.put(&record("bob"))?;
        drop(wal);
        let wal = WalBackend::open(path, false)?;
        assert_eq!(wal.scan()?.len(), 2);
        Ok(())
    }

    #[test]
    fn wal_bounded_by_auto_compaction() -> Result<(), ReconError> {
        let path = &wal_path("bounded");
        let _ = fs::remove_file(path);
        let wal = WalBackend::open(path, false)?.with_compact_min_entries(16);
        wal.put(&record("alice"))?;
        let entry_size = fs::metadata(path)?.len();
        for _ in 0..500 {
            wal.put(&record("alice"))?;
            assert!(wal.num_entries()? < 16);
            assert!(fs::metadata(path)?.len() < 16 * entry_size);
        }
        drop(wal);
        let wal = WalBackend::open(path, false)?;
        assert_eq!(wal.scan()?, vec![record("alice")]);
        Ok(())
    }

    #[test]
    fn wal_oversized_length_prefix() -> Result<(), ReconError> {
        let path = &wal_path("oversized");
        let _ = fs::remove_file(path);
        {
            let wal = WalBackend::open(path, false)?;
            wal.put(&record("alice"))?;
        }
        let good_len = fs::metadata(path)?.len();
        {
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(&(u64::MAX - 3).to_be_bytes())?;
            file.write_all(&[1, 2, 3])?;
        }
        let wal = WalBackend::open(path, false)?;
        assert_eq!(wal.scan()?.len(), 1);
        assert_eq!(fs::metadata(path)?.len(), good_len);
        Ok(())
    }
}
