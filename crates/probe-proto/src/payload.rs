//! Record page payload: the fixed 252-byte body written to `data.bin` pages
//! and streamed to the client on every thinned sample.
//!
//! Layout (little-endian, fixed offsets, zero padding to 252 bytes):
//! mode tag, record id, page index, timestamp, GNSS block, global-position
//! block, attitude block, then mode-specific measurement fields.

use crate::wire::{ByteReader, ByteWriter, WireError};
use crate::{RecordId, WorkMode};

/// One on-disk page: 4-byte CRC + payload.
pub const PAGE_SIZE: usize = 256;
/// Payload body carried in each page.
pub const PAGE_DATA_SIZE: usize = 252;

/// GNSS raw fix fields, zero-filled with `fix_type = 0` (no GPS) when no
/// telemetry snapshot is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GnssFields {
    pub fix_type: u8,
    pub satellites: u8,
    pub lat_1e7: i32,
    pub lon_1e7: i32,
    pub alt_mm: i32,
    pub eph: u16,
    pub epv: u16,
    pub vel_cms: u16,
    pub cog_cdeg: u16,
}

/// Fused global position fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionFields {
    pub lat_1e7: i32,
    pub lon_1e7: i32,
    pub alt_mm: i32,
    pub relative_alt_mm: i32,
    pub vx_cms: i16,
    pub vy_cms: i16,
    pub vz_cms: i16,
    pub hdg_cdeg: u16,
}

/// Vehicle attitude in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttitudeFields {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// ILS measurement set shared by localizer and glide path.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IlsFields {
    pub frequency_hz: u64,
    pub power_dbm: f32,
    pub field_strength_uv_m: f32,
    pub am_90: f32,
    pub am_150: f32,
    pub ddm: f32,
    pub sdm: f32,
}

/// VOR measurement set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VorFields {
    pub frequency_hz: u64,
    pub power_dbm: f32,
    pub field_strength_uv_m: f32,
    pub bearing_deg: f32,
    pub deviation_deg: f32,
    pub am_30: f32,
    pub am_9960: f32,
}

/// Mode-specific tail of the page payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModeFields {
    Llz(IlsFields),
    Gp(IlsFields),
    Vor(VorFields),
}

impl ModeFields {
    pub fn mode(&self) -> WorkMode {
        match self {
            ModeFields::Llz(_) => WorkMode::Llz,
            ModeFields::Gp(_) => WorkMode::Gp,
            ModeFields::Vor(_) => WorkMode::Vor,
        }
    }

    /// Empty measurement set for a non-Idle mode.
    pub fn empty(mode: WorkMode) -> Option<Self> {
        match mode {
            WorkMode::Llz => Some(ModeFields::Llz(IlsFields::default())),
            WorkMode::Gp => Some(ModeFields::Gp(IlsFields::default())),
            WorkMode::Vor => Some(ModeFields::Vor(VorFields::default())),
            WorkMode::Idle => None,
        }
    }
}

/// Complete page payload composed on every sample tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePayload {
    pub record_id: RecordId,
    pub page_index: u32,
    pub time_unix_us: i64,
    pub gnss: GnssFields,
    pub position: PositionFields,
    pub attitude: AttitudeFields,
    pub mode: ModeFields,
}

impl PagePayload {
    pub fn encode(&self) -> [u8; PAGE_DATA_SIZE] {
        let mut w = ByteWriter::with_capacity(PAGE_DATA_SIZE);
        w.put_u8(self.mode.mode().as_u8());
        w.put_bytes(self.record_id.as_bytes());
        w.put_u32(self.page_index);
        w.put_i64(self.time_unix_us);

        let g = &self.gnss;
        w.put_u8(g.fix_type);
        w.put_u8(g.satellites);
        w.put_i32(g.lat_1e7);
        w.put_i32(g.lon_1e7);
        w.put_i32(g.alt_mm);
        w.put_u16(g.eph);
        w.put_u16(g.epv);
        w.put_u16(g.vel_cms);
        w.put_u16(g.cog_cdeg);

        let p = &self.position;
        w.put_i32(p.lat_1e7);
        w.put_i32(p.lon_1e7);
        w.put_i32(p.alt_mm);
        w.put_i32(p.relative_alt_mm);
        w.put_i16(p.vx_cms);
        w.put_i16(p.vy_cms);
        w.put_i16(p.vz_cms);
        w.put_u16(p.hdg_cdeg);

        let a = &self.attitude;
        w.put_f32(a.roll);
        w.put_f32(a.pitch);
        w.put_f32(a.yaw);

        match &self.mode {
            ModeFields::Llz(f) | ModeFields::Gp(f) => {
                w.put_u64(f.frequency_hz);
                w.put_f32(f.power_dbm);
                w.put_f32(f.field_strength_uv_m);
                w.put_f32(f.am_90);
                w.put_f32(f.am_150);
                w.put_f32(f.ddm);
                w.put_f32(f.sdm);
            }
            ModeFields::Vor(f) => {
                w.put_u64(f.frequency_hz);
                w.put_f32(f.power_dbm);
                w.put_f32(f.field_strength_uv_m);
                w.put_f32(f.bearing_deg);
                w.put_f32(f.deviation_deg);
                w.put_f32(f.am_30);
                w.put_f32(f.am_9960);
            }
        }
        let bytes = w.into_inner();
        let mut buf = [0u8; PAGE_DATA_SIZE];
        buf[..bytes.len()].copy_from_slice(&bytes);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < PAGE_DATA_SIZE {
            return Err(WireError::Truncated);
        }
        let mut r = ByteReader::new(data);
        let mode_tag = r.get_u8()?;
        let mode = WorkMode::from_u8(mode_tag)
            .filter(|m| !m.is_idle())
            .ok_or(WireError::BadValue("page mode tag"))?;
        let record_id = RecordId::from_bytes(r.get_bytes::<16>()?);
        let page_index = r.get_u32()?;
        let time_unix_us = r.get_i64()?;

        let gnss = GnssFields {
            fix_type: r.get_u8()?,
            satellites: r.get_u8()?,
            lat_1e7: r.get_i32()?,
            lon_1e7: r.get_i32()?,
            alt_mm: r.get_i32()?,
            eph: r.get_u16()?,
            epv: r.get_u16()?,
            vel_cms: r.get_u16()?,
            cog_cdeg: r.get_u16()?,
        };
        let position = PositionFields {
            lat_1e7: r.get_i32()?,
            lon_1e7: r.get_i32()?,
            alt_mm: r.get_i32()?,
            relative_alt_mm: r.get_i32()?,
            vx_cms: r.get_i16()?,
            vy_cms: r.get_i16()?,
            vz_cms: r.get_i16()?,
            hdg_cdeg: r.get_u16()?,
        };
        let attitude = AttitudeFields {
            roll: r.get_f32()?,
            pitch: r.get_f32()?,
            yaw: r.get_f32()?,
        };

        let mode = match mode {
            WorkMode::Llz | WorkMode::Gp => {
                let f = IlsFields {
                    frequency_hz: r.get_u64()?,
                    power_dbm: r.get_f32()?,
                    field_strength_uv_m: r.get_f32()?,
                    am_90: r.get_f32()?,
                    am_150: r.get_f32()?,
                    ddm: r.get_f32()?,
                    sdm: r.get_f32()?,
                };
                if mode == WorkMode::Llz {
                    ModeFields::Llz(f)
                } else {
                    ModeFields::Gp(f)
                }
            }
            WorkMode::Vor => ModeFields::Vor(VorFields {
                frequency_hz: r.get_u64()?,
                power_dbm: r.get_f32()?,
                field_strength_uv_m: r.get_f32()?,
                bearing_deg: r.get_f32()?,
                deviation_deg: r.get_f32()?,
                am_30: r.get_f32()?,
                am_9960: r.get_f32()?,
            }),
            WorkMode::Idle => unreachable!(),
        };

        Ok(Self {
            record_id,
            page_index,
            time_unix_us,
            gnss,
            position,
            attitude,
            mode,
        })
    }
}
