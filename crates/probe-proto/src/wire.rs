//! Fixed little-endian binary codec for [`LinkFrame`] and [`ClientRequest`].
//!
//! The gateway carries these buffers inside MAVLink `V2_EXTENSION` messages;
//! the codec itself is transport-agnostic so tests exercise it directly.

use crate::payload::PAGE_DATA_SIZE;
use crate::{
    AckOp, CalibState, CalibrationRow, CalibrationTableInfo, ClientRequest, CommandResult,
    DataPageFrame, LinkFrame, MissionState, RecordEntry, RecordId, ResponseResult, SdrStatus,
    StreamKind, SystemControlAction, TagEntry, TagId, TagKind, WorkMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated buffer")]
    Truncated,
    #[error("invalid value: {0}")]
    BadValue(&'static str),
}

/// Growable little-endian writer.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed string, truncated to 255 bytes.
    pub fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(255);
        self.buf.push(n as u8);
        self.buf.extend_from_slice(&bytes[..n]);
    }
}

/// Bounds-checked little-endian reader.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16, WireError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn get_str(&mut self) -> Result<String, WireError> {
        let n = self.get_u8()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadValue("utf8 string"))
    }
}

// Frame tags.
const FRAME_HEARTBEAT: u8 = 1;
const FRAME_ACK: u8 = 2;
const FRAME_RESPONSE: u8 = 3;
const FRAME_RECORD_ITEM: u8 = 4;
const FRAME_TAG_ITEM: u8 = 5;
const FRAME_DATA_ITEM: u8 = 6;
const FRAME_CALIB_TABLE_ITEM: u8 = 7;
const FRAME_CALIB_ROW_ITEM: u8 = 8;
const FRAME_MISSION_CURRENT: u8 = 9;
const FRAME_MISSION_REACHED: u8 = 10;
const FRAME_STATUS_TEXT: u8 = 11;

// Request tags.
const REQ_SET_MODE: u8 = 1;
const REQ_START_RECORD: u8 = 2;
const REQ_STOP_RECORD: u8 = 3;
const REQ_SET_RECORD_TAG: u8 = 4;
const REQ_START_MISSION: u8 = 5;
const REQ_STOP_MISSION: u8 = 6;
const REQ_START_CALIBRATION: u8 = 7;
const REQ_STOP_CALIBRATION: u8 = 8;
const REQ_READ_CALIB_INFO: u8 = 9;
const REQ_READ_CALIB_ROW: u8 = 10;
const REQ_WRITE_CALIB_TABLE: u8 = 11;
const REQ_SYSTEM_CONTROL: u8 = 12;
const REQ_LIST_RECORDS: u8 = 13;
const REQ_LIST_TAGS: u8 = 14;
const REQ_LIST_DATA: u8 = 15;
const REQ_DELETE_RECORD: u8 = 16;
const REQ_DELETE_TAG: u8 = 17;

fn command_result_u8(r: CommandResult) -> u8 {
    match r {
        CommandResult::Accepted => 0,
        CommandResult::Denied => 1,
        CommandResult::Unsupported => 2,
        CommandResult::Failed => 3,
    }
}

fn command_result_from(v: u8) -> Result<CommandResult, WireError> {
    Ok(match v {
        0 => CommandResult::Accepted,
        1 => CommandResult::Denied,
        2 => CommandResult::Unsupported,
        3 => CommandResult::Failed,
        _ => return Err(WireError::BadValue("command result")),
    })
}

fn stream_kind_u8(s: StreamKind) -> u8 {
    match s {
        StreamKind::Records => 0,
        StreamKind::Tags => 1,
        StreamKind::Data => 2,
        StreamKind::DeleteRecord => 3,
        StreamKind::DeleteTag => 4,
    }
}

fn stream_kind_from(v: u8) -> Result<StreamKind, WireError> {
    Ok(match v {
        0 => StreamKind::Records,
        1 => StreamKind::Tags,
        2 => StreamKind::Data,
        3 => StreamKind::DeleteRecord,
        4 => StreamKind::DeleteTag,
        _ => return Err(WireError::BadValue("stream kind")),
    })
}

fn ack_op_u8(op: AckOp) -> u8 {
    match op {
        AckOp::SetMode => 0,
        AckOp::StartRecord => 1,
        AckOp::StopRecord => 2,
        AckOp::SetRecordTag => 3,
        AckOp::StartMission => 4,
        AckOp::StopMission => 5,
        AckOp::StartCalibration => 6,
        AckOp::StopCalibration => 7,
        AckOp::WriteCalibrationTable => 8,
        AckOp::SystemControl => 9,
    }
}

fn ack_op_from(v: u8) -> Result<AckOp, WireError> {
    Ok(match v {
        0 => AckOp::SetMode,
        1 => AckOp::StartRecord,
        2 => AckOp::StopRecord,
        3 => AckOp::SetRecordTag,
        4 => AckOp::StartMission,
        5 => AckOp::StopMission,
        6 => AckOp::StartCalibration,
        7 => AckOp::StopCalibration,
        8 => AckOp::WriteCalibrationTable,
        9 => AckOp::SystemControl,
        _ => return Err(WireError::BadValue("ack op")),
    })
}

fn calib_state_u8(s: CalibState) -> u8 {
    match s {
        CalibState::NotSupported => 0,
        CalibState::Ok => 1,
        CalibState::Progress => 2,
    }
}

fn calib_state_from(v: u8) -> Result<CalibState, WireError> {
    Ok(match v {
        0 => CalibState::NotSupported,
        1 => CalibState::Ok,
        2 => CalibState::Progress,
        _ => return Err(WireError::BadValue("calib state")),
    })
}

fn mission_state_u8(s: MissionState) -> u8 {
    match s {
        MissionState::Idle => 0,
        MissionState::InProgress => 1,
        MissionState::Error => 2,
    }
}

fn mission_state_from(v: u8) -> Result<MissionState, WireError> {
    Ok(match v {
        0 => MissionState::Idle,
        1 => MissionState::InProgress,
        2 => MissionState::Error,
        _ => return Err(WireError::BadValue("mission state")),
    })
}

fn put_record_entry(w: &mut ByteWriter, e: &RecordEntry) {
    w.put_bytes(e.id.as_bytes());
    w.put_str(&e.name);
    w.put_u8(e.mode.as_u8());
    w.put_u64(e.frequency_hz);
    w.put_i64(e.created_unix_us);
    w.put_f64(e.duration_sec);
    w.put_u32(e.data_count);
    w.put_u64(e.size_bytes);
    w.put_u16(e.tag_count);
}

fn get_record_entry(r: &mut ByteReader) -> Result<RecordEntry, WireError> {
    Ok(RecordEntry {
        id: RecordId::from_bytes(r.get_bytes::<16>()?),
        name: r.get_str()?,
        mode: WorkMode::from_u8(r.get_u8()?).ok_or(WireError::BadValue("work mode"))?,
        frequency_hz: r.get_u64()?,
        created_unix_us: r.get_i64()?,
        duration_sec: r.get_f64()?,
        data_count: r.get_u32()?,
        size_bytes: r.get_u64()?,
        tag_count: r.get_u16()?,
    })
}

fn put_calib_row(w: &mut ByteWriter, row: &CalibrationRow) {
    w.put_u64(row.frequency_hz);
    w.put_f32(row.ref_power);
    w.put_f64(row.ref_value);
    w.put_f64(row.adjustment);
}

fn get_calib_row(r: &mut ByteReader) -> Result<CalibrationRow, WireError> {
    Ok(CalibrationRow {
        frequency_hz: r.get_u64()?,
        ref_power: r.get_f32()?,
        ref_value: r.get_f64()?,
        adjustment: r.get_f64()?,
    })
}

pub fn encode_frame(frame: &LinkFrame) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(64);
    match frame {
        LinkFrame::Heartbeat(s) => {
            w.put_u8(FRAME_HEARTBEAT);
            w.put_u32(s.supported_modes);
            w.put_u8(s.current_mode.as_u8());
            w.put_u32(s.record_count);
            w.put_u64(s.size_bytes);
            match (&s.current_record, &s.current_record_name) {
                (Some(id), name) => {
                    w.put_u8(1);
                    w.put_bytes(id.as_bytes());
                    w.put_str(name.as_deref().unwrap_or(""));
                }
                (None, _) => w.put_u8(0),
            }
            w.put_f32(s.ref_power);
            w.put_f32(s.signal_overflow);
            w.put_u8(calib_state_u8(s.calib_state));
            w.put_u16(s.calib_table_count);
            w.put_u8(mission_state_u8(s.mission_state));
        }
        LinkFrame::Ack { op, result, text } => {
            w.put_u8(FRAME_ACK);
            w.put_u8(ack_op_u8(*op));
            w.put_u8(command_result_u8(*result));
            w.put_str(text.as_deref().unwrap_or(""));
        }
        LinkFrame::Response { stream, result } => {
            w.put_u8(FRAME_RESPONSE);
            w.put_u8(stream_kind_u8(*stream));
            match result {
                ResponseResult::Success { count } => {
                    w.put_u8(0);
                    w.put_u32(*count);
                }
                ResponseResult::Fail { error } => {
                    w.put_u8(1);
                    w.put_str(error);
                }
            }
        }
        LinkFrame::RecordItem(e) => {
            w.put_u8(FRAME_RECORD_ITEM);
            put_record_entry(&mut w, e);
        }
        LinkFrame::TagItem(t) => {
            w.put_u8(FRAME_TAG_ITEM);
            w.put_bytes(t.record.as_bytes());
            w.put_bytes(t.id.as_bytes());
            w.put_u8(t.kind.as_u8());
            w.put_str(&t.name);
            w.put_bytes(&t.value);
        }
        LinkFrame::DataItem(d) => {
            w.put_u8(FRAME_DATA_ITEM);
            w.put_bytes(d.record.as_bytes());
            w.put_u32(d.page_index);
            w.put_bytes(&d.payload);
        }
        LinkFrame::CalibrationTableItem(info) => {
            w.put_u8(FRAME_CALIB_TABLE_ITEM);
            w.put_u16(info.index);
            w.put_str(&info.name);
            w.put_u16(info.row_count);
            w.put_u8(info.enabled as u8);
            w.put_i64(info.updated_unix_us);
        }
        LinkFrame::CalibrationRowItem { table, row, value } => {
            w.put_u8(FRAME_CALIB_ROW_ITEM);
            w.put_u16(*table);
            w.put_u16(*row);
            put_calib_row(&mut w, value);
        }
        LinkFrame::MissionCurrent { seq } => {
            w.put_u8(FRAME_MISSION_CURRENT);
            w.put_u16(*seq);
        }
        LinkFrame::MissionReached { seq } => {
            w.put_u8(FRAME_MISSION_REACHED);
            w.put_u16(*seq);
        }
        LinkFrame::StatusText { text } => {
            w.put_u8(FRAME_STATUS_TEXT);
            w.put_str(text);
        }
    }
    w.into_inner()
}

pub fn decode_frame(data: &[u8]) -> Result<LinkFrame, WireError> {
    let mut r = ByteReader::new(data);
    let tag = r.get_u8()?;
    Ok(match tag {
        FRAME_HEARTBEAT => {
            let supported_modes = r.get_u32()?;
            let current_mode =
                WorkMode::from_u8(r.get_u8()?).ok_or(WireError::BadValue("work mode"))?;
            let record_count = r.get_u32()?;
            let size_bytes = r.get_u64()?;
            let (current_record, current_record_name) = if r.get_u8()? == 1 {
                let id = RecordId::from_bytes(r.get_bytes::<16>()?);
                let name = r.get_str()?;
                (Some(id), Some(name))
            } else {
                (None, None)
            };
            LinkFrame::Heartbeat(SdrStatus {
                supported_modes,
                current_mode,
                record_count,
                size_bytes,
                current_record,
                current_record_name,
                ref_power: r.get_f32()?,
                signal_overflow: r.get_f32()?,
                calib_state: calib_state_from(r.get_u8()?)?,
                calib_table_count: r.get_u16()?,
                mission_state: mission_state_from(r.get_u8()?)?,
            })
        }
        FRAME_ACK => {
            let op = ack_op_from(r.get_u8()?)?;
            let result = command_result_from(r.get_u8()?)?;
            let text = r.get_str()?;
            LinkFrame::Ack {
                op,
                result,
                text: if text.is_empty() { None } else { Some(text) },
            }
        }
        FRAME_RESPONSE => {
            let stream = stream_kind_from(r.get_u8()?)?;
            let result = match r.get_u8()? {
                0 => ResponseResult::Success {
                    count: r.get_u32()?,
                },
                1 => ResponseResult::Fail {
                    error: r.get_str()?,
                },
                _ => return Err(WireError::BadValue("response result")),
            };
            LinkFrame::Response { stream, result }
        }
        FRAME_RECORD_ITEM => LinkFrame::RecordItem(get_record_entry(&mut r)?),
        FRAME_TAG_ITEM => LinkFrame::TagItem(TagEntry {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
            id: TagId::from_bytes(r.get_bytes::<16>()?),
            kind: TagKind::from_u8(r.get_u8()?).ok_or(WireError::BadValue("tag kind"))?,
            name: r.get_str()?,
            value: r.get_bytes::<8>()?,
        }),
        FRAME_DATA_ITEM => LinkFrame::DataItem(DataPageFrame {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
            page_index: r.get_u32()?,
            payload: r.get_bytes::<PAGE_DATA_SIZE>()?,
        }),
        FRAME_CALIB_TABLE_ITEM => LinkFrame::CalibrationTableItem(CalibrationTableInfo {
            index: r.get_u16()?,
            name: r.get_str()?,
            row_count: r.get_u16()?,
            enabled: r.get_u8()? != 0,
            updated_unix_us: r.get_i64()?,
        }),
        FRAME_CALIB_ROW_ITEM => LinkFrame::CalibrationRowItem {
            table: r.get_u16()?,
            row: r.get_u16()?,
            value: get_calib_row(&mut r)?,
        },
        FRAME_MISSION_CURRENT => LinkFrame::MissionCurrent { seq: r.get_u16()? },
        FRAME_MISSION_REACHED => LinkFrame::MissionReached { seq: r.get_u16()? },
        FRAME_STATUS_TEXT => LinkFrame::StatusText { text: r.get_str()? },
        _ => return Err(WireError::BadValue("frame tag")),
    })
}

pub fn encode_request(req: &ClientRequest) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(32);
    match req {
        ClientRequest::SetMode {
            mode,
            frequency_hz,
            record_rate_hz,
            thinning_ratio,
            ref_power,
        } => {
            w.put_u8(REQ_SET_MODE);
            w.put_u8(mode.as_u8());
            w.put_u64(*frequency_hz);
            w.put_f32(*record_rate_hz);
            w.put_u32(*thinning_ratio);
            w.put_f32(*ref_power);
        }
        ClientRequest::StartRecord { name } => {
            w.put_u8(REQ_START_RECORD);
            w.put_str(name);
        }
        ClientRequest::StopRecord => w.put_u8(REQ_STOP_RECORD),
        ClientRequest::SetRecordTag { kind, name, value } => {
            w.put_u8(REQ_SET_RECORD_TAG);
            w.put_u8(kind.as_u8());
            w.put_str(name);
            w.put_bytes(value);
        }
        ClientRequest::StartMission { index } => {
            w.put_u8(REQ_START_MISSION);
            w.put_u16(*index);
        }
        ClientRequest::StopMission => w.put_u8(REQ_STOP_MISSION),
        ClientRequest::StartCalibration => w.put_u8(REQ_START_CALIBRATION),
        ClientRequest::StopCalibration => w.put_u8(REQ_STOP_CALIBRATION),
        ClientRequest::ReadCalibrationTableInfo { index } => {
            w.put_u8(REQ_READ_CALIB_INFO);
            w.put_u16(*index);
        }
        ClientRequest::ReadCalibrationTableRow { index, row } => {
            w.put_u8(REQ_READ_CALIB_ROW);
            w.put_u16(*index);
            w.put_u16(*row);
        }
        ClientRequest::WriteCalibrationTable { index, rows } => {
            w.put_u8(REQ_WRITE_CALIB_TABLE);
            w.put_u16(*index);
            w.put_u16(rows.len() as u16);
            for row in rows {
                put_calib_row(&mut w, row);
            }
        }
        ClientRequest::SystemControl { action } => {
            w.put_u8(REQ_SYSTEM_CONTROL);
            w.put_u8(match action {
                SystemControlAction::Reboot => 0,
                SystemControlAction::Shutdown => 1,
                SystemControlAction::Restart => 2,
            });
        }
        ClientRequest::ListRecords { skip, count } => {
            w.put_u8(REQ_LIST_RECORDS);
            w.put_u16(*skip);
            w.put_u16(*count);
        }
        ClientRequest::ListTags {
            record,
            skip,
            count,
        } => {
            w.put_u8(REQ_LIST_TAGS);
            w.put_bytes(record.as_bytes());
            w.put_u16(*skip);
            w.put_u16(*count);
        }
        ClientRequest::ListData {
            record,
            skip,
            count,
        } => {
            w.put_u8(REQ_LIST_DATA);
            w.put_bytes(record.as_bytes());
            w.put_u32(*skip);
            w.put_u32(*count);
        }
        ClientRequest::DeleteRecord { record } => {
            w.put_u8(REQ_DELETE_RECORD);
            w.put_bytes(record.as_bytes());
        }
        ClientRequest::DeleteTag { record, tag } => {
            w.put_u8(REQ_DELETE_TAG);
            w.put_bytes(record.as_bytes());
            w.put_bytes(tag.as_bytes());
        }
    }
    w.into_inner()
}

pub fn decode_request(data: &[u8]) -> Result<ClientRequest, WireError> {
    let mut r = ByteReader::new(data);
    let tag = r.get_u8()?;
    Ok(match tag {
        REQ_SET_MODE => ClientRequest::SetMode {
            mode: WorkMode::from_u8(r.get_u8()?).ok_or(WireError::BadValue("work mode"))?,
            frequency_hz: r.get_u64()?,
            record_rate_hz: r.get_f32()?,
            thinning_ratio: r.get_u32()?,
            ref_power: r.get_f32()?,
        },
        REQ_START_RECORD => ClientRequest::StartRecord { name: r.get_str()? },
        REQ_STOP_RECORD => ClientRequest::StopRecord,
        REQ_SET_RECORD_TAG => ClientRequest::SetRecordTag {
            kind: TagKind::from_u8(r.get_u8()?).ok_or(WireError::BadValue("tag kind"))?,
            name: r.get_str()?,
            value: r.get_bytes::<8>()?,
        },
        REQ_START_MISSION => ClientRequest::StartMission { index: r.get_u16()? },
        REQ_STOP_MISSION => ClientRequest::StopMission,
        REQ_START_CALIBRATION => ClientRequest::StartCalibration,
        REQ_STOP_CALIBRATION => ClientRequest::StopCalibration,
        REQ_READ_CALIB_INFO => ClientRequest::ReadCalibrationTableInfo { index: r.get_u16()? },
        REQ_READ_CALIB_ROW => ClientRequest::ReadCalibrationTableRow {
            index: r.get_u16()?,
            row: r.get_u16()?,
        },
        REQ_WRITE_CALIB_TABLE => {
            let index = r.get_u16()?;
            let n = r.get_u16()? as usize;
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(get_calib_row(&mut r)?);
            }
            ClientRequest::WriteCalibrationTable { index, rows }
        }
        REQ_SYSTEM_CONTROL => ClientRequest::SystemControl {
            action: match r.get_u8()? {
                0 => SystemControlAction::Reboot,
                1 => SystemControlAction::Shutdown,
                2 => SystemControlAction::Restart,
                _ => return Err(WireError::BadValue("system control action")),
            },
        },
        REQ_LIST_RECORDS => ClientRequest::ListRecords {
            skip: r.get_u16()?,
            count: r.get_u16()?,
        },
        REQ_LIST_TAGS => ClientRequest::ListTags {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
            skip: r.get_u16()?,
            count: r.get_u16()?,
        },
        REQ_LIST_DATA => ClientRequest::ListData {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
            skip: r.get_u32()?,
            count: r.get_u32()?,
        },
        REQ_DELETE_RECORD => ClientRequest::DeleteRecord {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
        },
        REQ_DELETE_TAG => ClientRequest::DeleteTag {
            record: RecordId::from_bytes(r.get_bytes::<16>()?),
            tag: TagId::from_bytes(r.get_bytes::<16>()?),
        },
        _ => return Err(WireError::BadValue("request tag")),
    })
}
