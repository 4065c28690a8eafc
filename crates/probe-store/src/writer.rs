//! The unique mutator of one record: random-access page writes, tag CRUD,
//! metadata edits. Exactly one writer exists per store at any time; dropping
//! (or finalizing) it releases the slot.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use probe_proto::{RecordId, TagId, TagKind, TagValue, PAGE_DATA_SIZE, PAGE_SIZE};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::page::encode_page;
use crate::record::{derive_tag_id, save_meta, validate_tag_name, RecordMeta, Tag};
use crate::StoreShared;

pub struct RecordWriter {
    shared: Arc<StoreShared>,
    id: RecordId,
    dir: PathBuf,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: File,
    meta: RecordMeta,
    meta_len: u64,
    data_len: u64,
    closed: bool,
}

impl RecordWriter {
    pub(crate) fn new(
        shared: Arc<StoreShared>,
        id: RecordId,
        dir: PathBuf,
        file: File,
        meta: RecordMeta,
        meta_len: u64,
    ) -> Self {
        Self {
            shared,
            id,
            dir,
            state: Mutex::new(WriterState {
                file,
                meta,
                meta_len,
                data_len: 0,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn data_count(&self) -> u32 {
        self.state.lock().meta.data_count
    }

    /// Frame `payload` into a page and write it at `index * 256`.
    ///
    /// A closed writer refuses the write, so a page racing a concurrent
    /// stop is either fully written before finalization or never.
    pub fn write_page(&self, index: u32, payload: &[u8; PAGE_DATA_SIZE]) -> StoreResult<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(StoreError::WriterClosed(self.id));
        }
        let page = encode_page(payload);
        let offset = index as u64 * PAGE_SIZE as u64;
        st.file.seek(SeekFrom::Start(offset))?;
        st.file.write_all(&page)?;

        let end = offset + PAGE_SIZE as u64;
        if end > st.data_len {
            let delta = end - st.data_len;
            st.data_len = end;
            self.shared.add_size(delta as i64);
        }
        if index + 1 > st.meta.data_count {
            st.meta.data_count = index + 1;
        }
        Ok(())
    }

    /// Attach a tag. The id is derived from `(name, record)`; setting the
    /// same name twice is a deterministic collision and is rejected.
    pub fn write_tag(&self, kind: TagKind, name: &str, value: TagValue) -> StoreResult<TagId> {
        validate_tag_name(name)?;
        let id = derive_tag_id(name, self.id);
        let mut st = self.state.lock();
        if st.closed {
            return Err(StoreError::WriterClosed(self.id));
        }
        if st.meta.tags.iter().any(|t| t.id == id) {
            return Err(StoreError::TagExists {
                record: self.id,
                id,
            });
        }
        st.meta.tags.push(Tag {
            id,
            kind,
            name: name.to_owned(),
            value,
        });
        self.persist_meta(&mut st)?;
        Ok(id)
    }

    pub fn delete_tag(&self, id: TagId) -> StoreResult<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(StoreError::WriterClosed(self.id));
        }
        let before = st.meta.tags.len();
        st.meta.tags.retain(|t| t.id != id);
        if st.meta.tags.len() == before {
            return Err(StoreError::TagNotFound {
                record: self.id,
                id,
            });
        }
        self.persist_meta(&mut st)
    }

    /// Apply an arbitrary metadata edit atomically under the writer lock.
    pub fn edit_metadata(&self, f: impl FnOnce(&mut RecordMeta)) -> StoreResult<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(StoreError::WriterClosed(self.id));
        }
        f(&mut st.meta);
        self.persist_meta(&mut st)
    }

    /// Close the record: stamp the duration, persist metadata, sync the data
    /// file and release the store's writer slot. Idempotent.
    pub fn finalize(&self, stopped_unix_us: i64) -> StoreResult<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(());
        }
        let span_us = stopped_unix_us.saturating_sub(st.meta.created_unix_us);
        st.meta.duration_sec = (span_us.max(0) as f64) / 1_000_000.0;
        self.persist_meta(&mut st)?;
        st.file.sync_all()?;
        st.closed = true;
        drop(st);
        self.shared.release_writer(self.id);
        Ok(())
    }

    fn persist_meta(&self, st: &mut WriterState) -> StoreResult<()> {
        let new_len = save_meta(&self.dir, &st.meta)?;
        self.shared.add_size(new_len as i64 - st.meta_len as i64);
        st.meta_len = new_len;
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if !st.closed {
            st.closed = true;
            if let Err(e) = save_meta(&self.dir, &st.meta) {
                warn!("record {}: metadata flush on drop failed: {e}", self.id);
            }
            drop(st);
            self.shared.release_writer(self.id);
        }
    }
}
