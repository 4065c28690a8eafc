use probe_proto::{RecordId, RequestError, TagId};
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Record store error kinds. Part of the public contract: request handlers
/// map these onto wire-level [`RequestError`]s.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    RecordExists(RecordId),

    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("record {0} is busy (writer open)")]
    RecordBusy(RecordId),

    #[error("writer for record {0} is closed")]
    WriterClosed(RecordId),

    #[error("tag {id} already set on record {record}")]
    TagExists { record: RecordId, id: TagId },

    #[error("tag {id} not found on record {record}")]
    TagNotFound { record: RecordId, id: TagId },

    #[error("page {index} out of range (record has {count} pages)")]
    PageOutOfRange { index: u32, count: u32 },

    #[error("page {index} CRC mismatch: expected {expected:08x}, found {found:08x}")]
    CorruptPage {
        index: u32,
        expected: u32,
        found: u32,
    },

    #[error("invalid tag name {0:?}: must be 1..=16 ASCII bytes")]
    InvalidTagName(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RecordNotFound(_) | StoreError::TagNotFound { .. } => {
                RequestError::NotFound(e.to_string())
            }
            StoreError::PageOutOfRange { .. } => RequestError::NotFound(e.to_string()),
            StoreError::RecordBusy(_) | StoreError::WriterClosed(_) => {
                RequestError::Busy(e.to_string())
            }
            StoreError::CorruptPage { .. } => RequestError::Corrupt(e.to_string()),
            StoreError::RecordExists(_) | StoreError::TagExists { .. } => {
                RequestError::Denied(e.to_string())
            }
            StoreError::InvalidTagName(_) => RequestError::Denied(e.to_string()),
            StoreError::Metadata(_) | StoreError::Io(_) => RequestError::Failed(e.to_string()),
        }
    }
}
