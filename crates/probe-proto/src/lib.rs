//! Shared protocol types for the sigprobe payload: work modes, record/tag
//! ids, the command surface the payload accepts, and the frames it emits
//! back over the gateway link.
//!
//! The wire codec that carries these frames over MAVLink lives in
//! [`wire`]; the in-process loopback used by tests and local tooling is
//! [`LoopbackLink`].

pub mod payload;
pub mod wire;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use payload::{PagePayload, PAGE_DATA_SIZE, PAGE_SIZE};

/// 128-bit opaque record identifier. Directory names on disk use the
/// dashed lowercase form; tag-id derivation uses the dashless uppercase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn from_bytes(b: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(b))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Uppercase hex without dashes, the form tag ids are derived from.
    pub fn simple_upper(&self) -> String {
        self.0.simple().to_string().to_uppercase()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// 128-bit tag identifier, derived deterministically from tag name and
/// owning record (see `probe-store`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(Uuid);

impl TagId {
    pub const fn from_bytes(b: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(b))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Payload work mode. At most one non-Idle mode is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkMode {
    Idle,
    Llz,
    Gp,
    Vor,
}

impl WorkMode {
    /// Bit flag used in the `supported_modes` heartbeat mask.
    pub fn flag(&self) -> u32 {
        match self {
            WorkMode::Idle => 0,
            WorkMode::Llz => 1,
            WorkMode::Gp => 2,
            WorkMode::Vor => 4,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WorkMode::Idle)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            WorkMode::Idle => 0,
            WorkMode::Llz => 1,
            WorkMode::Gp => 2,
            WorkMode::Vor => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(WorkMode::Idle),
            1 => Some(WorkMode::Llz),
            2 => Some(WorkMode::Gp),
            3 => Some(WorkMode::Vor),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkMode::Idle => "IDLE",
            WorkMode::Llz => "LLZ",
            WorkMode::Gp => "GP",
            WorkMode::Vor => "VOR",
        };
        f.write_str(s)
    }
}

/// Tag payload interpretation. Values are always an 8-byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagKind {
    Int64,
    Real64,
    Bytes8,
    String8,
}

impl TagKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            TagKind::Int64 => 0,
            TagKind::Real64 => 1,
            TagKind::Bytes8 => 2,
            TagKind::String8 => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TagKind::Int64),
            1 => Some(TagKind::Real64),
            2 => Some(TagKind::Bytes8),
            3 => Some(TagKind::String8),
            _ => None,
        }
    }
}

/// Fixed-width tag value buffer.
pub type TagValue = [u8; 8];

/// Pack a string into a tag value buffer (truncated/zero-padded to 8 bytes).
pub fn tag_value_from_str(s: &str) -> TagValue {
    let mut v = [0u8; 8];
    let bytes = s.as_bytes();
    let n = bytes.len().min(8);
    v[..n].copy_from_slice(&bytes[..n]);
    v
}

/// Calibration support state reported in the extended heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibState {
    NotSupported,
    Ok,
    Progress,
}

/// Mission executor state reported in the extended heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionState {
    Idle,
    InProgress,
    Error,
}

/// Result of a command-style request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Accepted,
    Denied,
    Unsupported,
    Failed,
}

/// Error kinds carried back to the client on failed requests.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("busy: {0}")]
    Busy(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("request already in progress")]
    InProgress,
    #[error("{0}")]
    Failed(String),
}

/// System-control actions the payload maps to host OS invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemControlAction {
    Reboot,
    Shutdown,
    Restart,
}

/// One calibration table row as carried over the link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRow {
    pub frequency_hz: u64,
    pub ref_power: f32,
    pub ref_value: f64,
    pub adjustment: f64,
}

/// Table-level calibration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationTableInfo {
    pub index: u16,
    pub name: String,
    pub row_count: u16,
    pub enabled: bool,
    pub updated_unix_us: i64,
}

/// Requests the payload accepts from a remote client (or the mission
/// executor, which calls the same operations in-process).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    SetMode {
        mode: WorkMode,
        frequency_hz: u64,
        record_rate_hz: f32,
        thinning_ratio: u32,
        ref_power: f32,
    },
    StartRecord {
        name: String,
    },
    StopRecord,
    SetRecordTag {
        kind: TagKind,
        name: String,
        value: TagValue,
    },
    StartMission {
        index: u16,
    },
    StopMission,
    StartCalibration,
    StopCalibration,
    ReadCalibrationTableInfo {
        index: u16,
    },
    ReadCalibrationTableRow {
        index: u16,
        row: u16,
    },
    WriteCalibrationTable {
        index: u16,
        rows: Vec<CalibrationRow>,
    },
    SystemControl {
        action: SystemControlAction,
    },
    ListRecords {
        skip: u16,
        count: u16,
    },
    ListTags {
        record: RecordId,
        skip: u16,
        count: u16,
    },
    ListData {
        record: RecordId,
        skip: u32,
        count: u32,
    },
    DeleteRecord {
        record: RecordId,
    },
    DeleteTag {
        record: RecordId,
        tag: TagId,
    },
}

/// Which paginated stream a [`ResponseResult`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Records,
    Tags,
    Data,
    DeleteRecord,
    DeleteTag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult {
    /// Number of items that will follow.
    Success { count: u32 },
    Fail { error: String },
}

/// Which command an [`LinkFrame::Ack`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOp {
    SetMode,
    StartRecord,
    StopRecord,
    SetRecordTag,
    StartMission,
    StopMission,
    StartCalibration,
    StopCalibration,
    WriteCalibrationTable,
    SystemControl,
}

/// Record inventory entry as streamed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub id: RecordId,
    pub name: String,
    pub mode: WorkMode,
    pub frequency_hz: u64,
    pub created_unix_us: i64,
    pub duration_sec: f64,
    pub data_count: u32,
    pub size_bytes: u64,
    pub tag_count: u16,
}

/// Tag entry as streamed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TagEntry {
    pub record: RecordId,
    pub id: TagId,
    pub kind: TagKind,
    pub name: String,
    pub value: TagValue,
}

/// One record data page as streamed to the client. The payload is the raw
/// 252-byte page body (CRC already verified by the store).
#[derive(Clone, PartialEq)]
pub struct DataPageFrame {
    pub record: RecordId,
    pub page_index: u32,
    pub payload: [u8; PAGE_DATA_SIZE],
}

impl std::fmt::Debug for DataPageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPageFrame")
            .field("record", &self.record)
            .field("page_index", &self.page_index)
            .finish_non_exhaustive()
    }
}

/// Extended heartbeat payload state.
#[derive(Debug, Clone, PartialEq)]
pub struct SdrStatus {
    pub supported_modes: u32,
    pub current_mode: WorkMode,
    pub record_count: u32,
    pub size_bytes: u64,
    pub current_record: Option<RecordId>,
    pub current_record_name: Option<String>,
    pub ref_power: f32,
    pub signal_overflow: f32,
    pub calib_state: CalibState,
    pub calib_table_count: u16,
    pub mission_state: MissionState,
}

impl Default for SdrStatus {
    fn default() -> Self {
        Self {
            supported_modes: 0,
            current_mode: WorkMode::Idle,
            record_count: 0,
            size_bytes: 0,
            current_record: None,
            current_record_name: None,
            ref_power: f32::NAN,
            signal_overflow: f32::NAN,
            calib_state: CalibState::NotSupported,
            calib_table_count: 0,
            mission_state: MissionState::Idle,
        }
    }
}

/// Everything the payload sends back over the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    Heartbeat(SdrStatus),
    Ack {
        op: AckOp,
        result: CommandResult,
        text: Option<String>,
    },
    Response {
        stream: StreamKind,
        result: ResponseResult,
    },
    RecordItem(RecordEntry),
    TagItem(TagEntry),
    DataItem(DataPageFrame),
    CalibrationTableItem(CalibrationTableInfo),
    CalibrationRowItem {
        table: u16,
        row: u16,
        value: CalibrationRow,
    },
    MissionCurrent {
        seq: u16,
    },
    MissionReached {
        seq: u16,
    },
    StatusText {
        text: String,
    },
}

/// Outbound half of the payload's client link. Implementations may drop
/// frames on a dead transport; callers treat send failures as transient.
#[async_trait]
pub trait GatewayLink: Send + Sync {
    async fn send(&self, frame: LinkFrame) -> Result<()>;
}

/// In-process link: frames land on an unbounded channel. Used by tests and
/// by local tooling that inspects payload output directly.
pub struct LoopbackLink {
    tx: mpsc::UnboundedSender<LinkFrame>,
}

impl LoopbackLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl GatewayLink for LoopbackLink {
    async fn send(&self, frame: LinkFrame) -> Result<()> {
        // Receiver dropped means the consumer is gone; nothing to do.
        let _ = self.tx.send(frame);
        Ok(())
    }
}
