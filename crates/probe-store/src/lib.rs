//! File-backed record store.
//!
//! One subdirectory per record under the store root, named by the dashed
//! record id: `metadata.json` (schema-versioned JSON) plus `data.bin`
//! (concatenated 256-byte CRC-protected pages). A single internal lock
//! guards the handle table; per-file I/O serializes inside each handle.
//! One writer at a time store-wide; readers are shared and cached.

pub mod doctor;
mod error;
mod page;
mod reader;
mod record;
mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use probe_proto::{RecordEntry, RecordId, TagId, WorkMode, PAGE_SIZE};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::warn;

pub use error::{StoreError, StoreResult};
pub use page::{crc32q, decode_page, encode_page};
pub use reader::RecordReader;
pub use record::{derive_tag_id, RecordMeta, Tag, DATA_FILE, MAX_TAG_NAME, METADATA_FILE};
pub use writer::RecordWriter;

use record::{load_meta, record_dir, save_meta};

fn default_folder() -> String {
    "records".into()
}

fn default_cache_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory for record subdirectories.
    #[serde(default = "default_folder")]
    pub record_store_folder: String,
    /// Reader-handle cache lifetime in milliseconds.
    #[serde(default = "default_cache_ms")]
    pub file_cache_time_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            record_store_folder: default_folder(),
            file_cache_time_ms: default_cache_ms(),
        }
    }
}

struct CachedReader {
    reader: Arc<RecordReader>,
    last_used: Instant,
}

struct StoreState {
    /// Record ids in creation order.
    index: Vec<(RecordId, i64)>,
    /// The single open writer, if any.
    writer: Option<RecordId>,
    readers: HashMap<RecordId, CachedReader>,
}

pub(crate) struct StoreShared {
    root: PathBuf,
    cache_ttl: Duration,
    state: Mutex<StoreState>,
    count_tx: watch::Sender<u32>,
    size_tx: watch::Sender<u64>,
}

impl StoreShared {
    pub(crate) fn add_size(&self, delta: i64) {
        self.size_tx
            .send_modify(|s| *s = (*s as i64 + delta).max(0) as u64);
    }

    pub(crate) fn release_writer(&self, id: RecordId) {
        let mut st = self.state.lock();
        if st.writer == Some(id) {
            st.writer = None;
        }
    }
}

/// Handle to the store; cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct RecordStore {
    shared: Arc<StoreShared>,
}

impl RecordStore {
    /// Open (or create) the store root and build the in-memory index from
    /// the on-disk layout. Unparseable entries are skipped with a warning.
    pub fn open(cfg: &StoreConfig) -> StoreResult<Self> {
        let root = PathBuf::from(&cfg.record_store_folder);
        std::fs::create_dir_all(&root)?;

        let mut index = Vec::new();
        let mut size = 0u64;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Ok(id) = RecordId::parse(&name.to_string_lossy()) else {
                warn!("record store: skipping non-record directory {:?}", name);
                continue;
            };
            match load_meta(&entry.path()) {
                Ok(meta) => {
                    size += dir_size(&entry.path());
                    index.push((id, meta.created_unix_us));
                }
                Err(e) => warn!("record store: skipping {id}: {e}"),
            }
        }
        index.sort_by_key(|(_, created)| *created);

        let (count_tx, _) = watch::channel(index.len() as u32);
        let (size_tx, _) = watch::channel(size);
        Ok(Self {
            shared: Arc::new(StoreShared {
                root,
                cache_ttl: Duration::from_millis(cfg.file_cache_time_ms),
                state: Mutex::new(StoreState {
                    index,
                    writer: None,
                    readers: HashMap::new(),
                }),
                count_tx,
                size_tx,
            }),
        })
    }

    /// Reserve `id` and open its unique writer. Fails if the id exists or
    /// any writer is currently open.
    pub fn create(
        &self,
        id: RecordId,
        name: &str,
        mode: WorkMode,
        frequency_hz: u64,
        created_unix_us: i64,
    ) -> StoreResult<Arc<RecordWriter>> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if let Some(open) = st.writer {
            return Err(StoreError::RecordBusy(open));
        }
        if st.index.iter().any(|(i, _)| *i == id) {
            return Err(StoreError::RecordExists(id));
        }
        let dir = record_dir(&shared.root, id);
        if dir.exists() {
            return Err(StoreError::RecordExists(id));
        }
        std::fs::create_dir_all(&dir)?;
        let meta = RecordMeta::new(name, mode, frequency_hz, created_unix_us);
        let meta_len = save_meta(&dir, &meta)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(DATA_FILE))?;

        st.index.push((id, created_unix_us));
        st.writer = Some(id);
        shared.count_tx.send_replace(st.index.len() as u32);
        drop(st);
        shared.add_size(meta_len as i64);

        Ok(Arc::new(RecordWriter::new(
            shared.clone(),
            id,
            dir,
            file,
            meta,
            meta_len,
        )))
    }

    /// Open a shared reader. Readers opened within the cache window are
    /// reused; a record with an open writer cannot be read.
    pub fn open_reader(&self, id: RecordId) -> StoreResult<Arc<RecordReader>> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let ttl = shared.cache_ttl;
        st.readers.retain(|_, c| c.last_used.elapsed() <= ttl);

        if st.writer == Some(id) {
            return Err(StoreError::RecordBusy(id));
        }
        if let Some(cached) = st.readers.get_mut(&id) {
            cached.last_used = Instant::now();
            return Ok(cached.reader.clone());
        }
        if !st.index.iter().any(|(i, _)| *i == id) {
            return Err(StoreError::RecordNotFound(id));
        }
        let reader = Arc::new(RecordReader::open(&record_dir(&shared.root, id), id)?);
        st.readers.insert(
            id,
            CachedReader {
                reader: reader.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(reader)
    }

    /// Remove a record and its files. Fails while a writer is open for it.
    pub fn delete(&self, id: RecordId) -> StoreResult<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.writer == Some(id) {
            return Err(StoreError::RecordBusy(id));
        }
        let Some(pos) = st.index.iter().position(|(i, _)| *i == id) else {
            return Err(StoreError::RecordNotFound(id));
        };
        st.readers.remove(&id);
        let dir = record_dir(&shared.root, id);
        let freed = dir_size(&dir);
        std::fs::remove_dir_all(&dir)?;
        st.index.remove(pos);
        shared.count_tx.send_replace(st.index.len() as u32);
        drop(st);
        shared.add_size(-(freed as i64));
        Ok(())
    }

    /// Delete a tag from a closed record (metadata edit under the store
    /// lock, no writer involved). Fails while a writer is open for it.
    pub fn delete_tag(&self, id: RecordId, tag: TagId) -> StoreResult<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.writer == Some(id) {
            return Err(StoreError::RecordBusy(id));
        }
        if !st.index.iter().any(|(i, _)| *i == id) {
            return Err(StoreError::RecordNotFound(id));
        }
        let dir = record_dir(&shared.root, id);
        let mut meta = load_meta(&dir)?;
        let before = meta.tags.len();
        meta.tags.retain(|t| t.id != tag);
        if meta.tags.len() == before {
            return Err(StoreError::TagNotFound { record: id, id: tag });
        }
        let old_len = std::fs::metadata(dir.join(METADATA_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        let new_len = save_meta(&dir, &meta)?;
        // Drop the cached reader so the next open sees fresh tags.
        st.readers.remove(&id);
        drop(st);
        shared.add_size(new_len as i64 - old_len as i64);
        Ok(())
    }

    /// Record ids in creation order.
    pub fn records(&self) -> Vec<RecordId> {
        self.shared
            .state
            .lock()
            .index
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Inventory entry for one record. Page count comes from the data-file
    /// length (ground truth), the rest from metadata.
    pub fn entry(&self, id: RecordId) -> StoreResult<RecordEntry> {
        let shared = &self.shared;
        {
            let st = shared.state.lock();
            if !st.index.iter().any(|(i, _)| *i == id) {
                return Err(StoreError::RecordNotFound(id));
            }
        }
        let dir = record_dir(&shared.root, id);
        let meta = load_meta(&dir)?;
        let data_len = std::fs::metadata(dir.join(DATA_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(RecordEntry {
            id,
            name: meta.name.clone(),
            mode: meta.mode,
            frequency_hz: meta.frequency,
            created_unix_us: meta.created_unix_us,
            duration_sec: meta.duration_sec,
            data_count: (data_len / PAGE_SIZE as u64) as u32,
            size_bytes: data_len
                + std::fs::metadata(dir.join(METADATA_FILE))
                    .map(|m| m.len())
                    .unwrap_or(0),
            tag_count: meta.tags.len() as u16,
        })
    }

    pub fn count(&self) -> u32 {
        *self.shared.count_tx.borrow()
    }

    pub fn size_bytes(&self) -> u64 {
        *self.shared.size_tx.borrow()
    }

    pub fn count_rx(&self) -> watch::Receiver<u32> {
        self.shared.count_tx.subscribe()
    }

    pub fn size_rx(&self) -> watch::Receiver<u64> {
        self.shared.size_tx.subscribe()
    }

    /// True while a writer is open (for any record).
    pub fn writer_open(&self) -> bool {
        self.shared.state.lock().writer.is_some()
    }

    #[cfg(test)]
    fn root(&self) -> &std::path::Path {
        &self.shared.root
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_proto::{tag_value_from_str, TagKind, PAGE_DATA_SIZE};

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            record_store_folder: dir.path().join("records").to_string_lossy().into_owned(),
            file_cache_time_ms: 5000,
        };
        let store = RecordStore::open(&cfg).unwrap();
        (dir, store)
    }

    fn payload(fill: u8) -> [u8; PAGE_DATA_SIZE] {
        [fill; PAGE_DATA_SIZE]
    }

    #[test]
    fn create_write_finalize_read_back() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store
            .create(id, "flight-01", WorkMode::Llz, 109_500_000, 1_000_000)
            .unwrap();
        for i in 0..50 {
            w.write_page(i, &payload(i as u8)).unwrap();
        }
        w.finalize(6_000_000).unwrap();

        let entry = store.entry(id).unwrap();
        assert_eq!(entry.name, "flight-01");
        assert_eq!(entry.mode, WorkMode::Llz);
        assert_eq!(entry.data_count, 50);
        assert!((entry.duration_sec - 5.0).abs() < 1e-9);

        let r = store.open_reader(id).unwrap();
        assert_eq!(r.page_count(), 50);
        let mut out = [0u8; PAGE_DATA_SIZE];
        for i in 0..50 {
            r.read_page(i, &mut out).unwrap();
            assert_eq!(out, payload(i as u8));
        }
    }

    #[test]
    fn page_count_times_page_size_equals_file_length() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "r", WorkMode::Gp, 329_150_000, 0).unwrap();
        for i in 0..7 {
            w.write_page(i, &payload(1)).unwrap();
        }
        w.finalize(1).unwrap();
        let entry = store.entry(id).unwrap();
        let data_len = std::fs::metadata(store.root().join(id.to_string()).join(DATA_FILE))
            .unwrap()
            .len();
        assert_eq!(entry.data_count as u64 * PAGE_SIZE as u64, data_len);
    }

    #[test]
    fn single_writer_store_wide() {
        let (_tmp, store) = store();
        let a = RecordId::new();
        let w = store.create(a, "a", WorkMode::Llz, 0, 0).unwrap();
        // Second create (any id) is rejected while a writer is open.
        let err = store.create(RecordId::new(), "b", WorkMode::Llz, 0, 0);
        assert!(matches!(err, Err(StoreError::RecordBusy(_))));
        // Reading the record being written is rejected too.
        assert!(matches!(
            store.open_reader(a),
            Err(StoreError::RecordBusy(_))
        ));
        w.finalize(0).unwrap();
        // Writer released: both work now.
        store.open_reader(a).unwrap();
        store
            .create(RecordId::new(), "b", WorkMode::Llz, 0, 0)
            .unwrap();
    }

    #[test]
    fn create_existing_id_rejected() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        store
            .create(id, "a", WorkMode::Llz, 0, 0)
            .unwrap()
            .finalize(0)
            .unwrap();
        assert!(matches!(
            store.create(id, "again", WorkMode::Llz, 0, 0),
            Err(StoreError::RecordExists(_))
        ));
    }

    #[test]
    fn delete_fails_iff_writer_open() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "a", WorkMode::Vor, 0, 0).unwrap();
        assert!(matches!(store.delete(id), Err(StoreError::RecordBusy(_))));
        w.finalize(0).unwrap();
        store.delete(id).unwrap();
        assert!(matches!(
            store.open_reader(id),
            Err(StoreError::RecordNotFound(_))
        ));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn reader_for_missing_record_creates_nothing() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        assert!(matches!(
            store.open_reader(id),
            Err(StoreError::RecordNotFound(_))
        ));
        assert!(!store.root().join(id.to_string()).exists());
    }

    #[test]
    fn tags_collide_deterministically() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "a", WorkMode::Llz, 0, 0).unwrap();
        let t1 = w
            .write_tag(TagKind::String8, "note", tag_value_from_str("one"))
            .unwrap();
        let err = w.write_tag(TagKind::String8, "note", tag_value_from_str("two"));
        match err {
            Err(StoreError::TagExists { id: t2, .. }) => assert_eq!(t1, t2),
            other => panic!("expected TagExists, got {other:?}"),
        }
        w.delete_tag(t1).unwrap();
        w.write_tag(TagKind::String8, "note", tag_value_from_str("two"))
            .unwrap();
    }

    #[test]
    fn corrupt_page_reported_on_read() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "a", WorkMode::Llz, 0, 0).unwrap();
        for i in 0..3 {
            w.write_page(i, &payload(9)).unwrap();
        }
        w.finalize(0).unwrap();

        // Flip one byte of page 1 on disk.
        let data = store.root().join(id.to_string()).join(DATA_FILE);
        let mut raw = std::fs::read(&data).unwrap();
        raw[PAGE_SIZE + 40] ^= 0xff;
        std::fs::write(&data, &raw).unwrap();

        let r = store.open_reader(id).unwrap();
        let mut out = [0u8; PAGE_DATA_SIZE];
        r.read_page(0, &mut out).unwrap();
        assert!(matches!(
            r.read_page(1, &mut out),
            Err(StoreError::CorruptPage { index: 1, .. })
        ));
        r.read_page(2, &mut out).unwrap();
    }

    #[test]
    fn reader_cache_reuses_within_window() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        store
            .create(id, "a", WorkMode::Llz, 0, 0)
            .unwrap()
            .finalize(0)
            .unwrap();
        let r1 = store.open_reader(id).unwrap();
        let r2 = store.open_reader(id).unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn counters_track_mutations() {
        let (_tmp, store) = store();
        assert_eq!(store.count(), 0);
        let id = RecordId::new();
        let w = store.create(id, "a", WorkMode::Llz, 0, 0).unwrap();
        assert_eq!(store.count(), 1);
        let before = store.size_bytes();
        w.write_page(0, &payload(1)).unwrap();
        assert_eq!(store.size_bytes(), before + PAGE_SIZE as u64);
        w.finalize(0).unwrap();
        store.delete(id).unwrap();
        assert_eq!(store.count(), 0);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn edit_metadata_is_persisted() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "raw", WorkMode::Llz, 108_100_000, 0).unwrap();
        w.edit_metadata(|m| m.name = "renamed".into()).unwrap();
        w.finalize(0).unwrap();
        assert_eq!(store.entry(id).unwrap().name, "renamed");
    }

    #[test]
    fn delete_tag_without_writer() {
        let (_tmp, store) = store();
        let id = RecordId::new();
        let w = store.create(id, "a", WorkMode::Llz, 0, 0).unwrap();
        let tag = w
            .write_tag(TagKind::Int64, "count", 42i64.to_le_bytes())
            .unwrap();
        w.finalize(0).unwrap();

        store.delete_tag(id, tag).unwrap();
        let r = store.open_reader(id).unwrap();
        assert!(r.tag_ids(0, 10).is_empty());
        assert!(matches!(
            store.delete_tag(id, tag),
            Err(StoreError::TagNotFound { .. })
        ));
    }

    #[test]
    fn reload_from_disk_preserves_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            record_store_folder: dir.path().join("records").to_string_lossy().into_owned(),
            file_cache_time_ms: 5000,
        };
        let ids: Vec<RecordId> = (0..3).map(|_| RecordId::new()).collect();
        {
            let store = RecordStore::open(&cfg).unwrap();
            for (i, id) in ids.iter().enumerate() {
                let w = store
                    .create(*id, &format!("rec-{i}"), WorkMode::Vor, 113_000_000, i as i64)
                    .unwrap();
                w.write_page(0, &payload(i as u8)).unwrap();
                w.finalize(i as i64 + 1_000_000).unwrap();
            }
        }

        let store = RecordStore::open(&cfg).unwrap();
        assert_eq!(store.count(), 3);
        assert_eq!(store.records(), ids);
        for (i, id) in ids.iter().enumerate() {
            let e = store.entry(*id).unwrap();
            assert_eq!(e.name, format!("rec-{i}"));
            assert_eq!(e.data_count, 1);
        }
        assert!(store.size_bytes() > 0);
    }
}
