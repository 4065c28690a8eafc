//! Read-side handle: CRC-verified page reads, tag lookup, metadata snapshot.
//! Readers are shared (`Arc`) and cached by the store for burst reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use parking_lot::Mutex;
use probe_proto::{RecordId, TagId, PAGE_DATA_SIZE, PAGE_SIZE};

use crate::error::{StoreError, StoreResult};
use crate::page::decode_page;
use crate::record::{load_meta, RecordMeta, Tag, DATA_FILE};

pub struct RecordReader {
    id: RecordId,
    meta: RecordMeta,
    page_count: u32,
    file: Mutex<File>,
}

impl RecordReader {
    pub(crate) fn open(dir: &Path, id: RecordId) -> StoreResult<Self> {
        let meta = load_meta(dir)?;
        let file = File::open(dir.join(DATA_FILE))?;
        let len = file.metadata()?.len();
        Ok(Self {
            id,
            meta,
            page_count: (len / PAGE_SIZE as u64) as u32,
            file: Mutex::new(file),
        })
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn metadata(&self) -> &RecordMeta {
        &self.meta
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Number of pages a paginated request over `(skip, count)` will yield.
    pub fn item_count(&self, skip: u32, count: u32) -> u32 {
        count.min(self.page_count.saturating_sub(skip))
    }

    /// Read and CRC-verify one page into `out`.
    pub fn read_page(&self, index: u32, out: &mut [u8; PAGE_DATA_SIZE]) -> StoreResult<()> {
        if index >= self.page_count {
            return Err(StoreError::PageOutOfRange {
                index,
                count: self.page_count,
            });
        }
        let mut page = [0u8; PAGE_SIZE];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(index as u64 * PAGE_SIZE as u64))?;
            file.read_exact(&mut page)?;
        }
        match decode_page(&page) {
            Ok(payload) => {
                *out = payload;
                Ok(())
            }
            Err((expected, found)) => Err(StoreError::CorruptPage {
                index,
                expected,
                found,
            }),
        }
    }

    pub fn tag_ids(&self, skip: u16, count: u16) -> Vec<TagId> {
        self.meta
            .tags
            .iter()
            .skip(skip as usize)
            .take(count as usize)
            .map(|t| t.id)
            .collect()
    }

    pub fn read_tag(&self, id: TagId) -> StoreResult<&Tag> {
        self.meta
            .tags
            .iter()
            .find(|t| t.id == id)
            .ok_or(StoreError::TagNotFound {
                record: self.id,
                id,
            })
    }
}
