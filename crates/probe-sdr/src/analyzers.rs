//! In-tree simulated analyzers. They produce deterministic nav-aid nominal
//! values with a slow phase wobble, enough to exercise the full record and
//! streaming path without SDR hardware.

use anyhow::Result;
use async_trait::async_trait;
use probe_proto::payload::{IlsFields, ModeFields, VorFields};
use probe_proto::WorkMode;
use tokio_util::sync::CancellationToken;

use crate::SignalAnalyzer;

pub fn simulated_llz() -> Box<dyn SignalAnalyzer> {
    Box::new(SimulatedIls::new(WorkMode::Llz))
}

pub fn simulated_gp() -> Box<dyn SignalAnalyzer> {
    Box::new(SimulatedIls::new(WorkMode::Gp))
}

pub fn simulated_vor() -> Box<dyn SignalAnalyzer> {
    Box::new(SimulatedVor::default())
}

struct SimulatedIls {
    mode: WorkMode,
    frequency_hz: u64,
    ref_power: f32,
    phase: u64,
}

impl SimulatedIls {
    fn new(mode: WorkMode) -> Self {
        Self {
            mode,
            frequency_hz: 0,
            ref_power: f32::NAN,
            phase: 0,
        }
    }
}

#[async_trait]
impl SignalAnalyzer for SimulatedIls {
    fn mode(&self) -> WorkMode {
        self.mode
    }

    async fn init(
        &mut self,
        frequency_hz: u64,
        ref_power: f32,
        _cancel: CancellationToken,
    ) -> Result<()> {
        self.frequency_hz = frequency_hz;
        self.ref_power = ref_power;
        self.phase = 0;
        Ok(())
    }

    fn fill(&mut self, fields: &mut ModeFields) {
        self.phase += 1;
        let t = self.phase as f64 * 0.05;
        // On-course nominal: both tones at 20% modulation, DDM near zero.
        let wobble = 0.002 * t.sin();
        let am_90 = (0.20 + wobble) as f32;
        let am_150 = (0.20 - wobble) as f32;
        let ils = IlsFields {
            frequency_hz: self.frequency_hz,
            power_dbm: self.ref_power + (0.3 * (t * 0.7).cos()) as f32,
            field_strength_uv_m: 210.0,
            am_90,
            am_150,
            ddm: am_90 - am_150,
            sdm: am_90 + am_150,
        };
        match fields {
            ModeFields::Llz(f) | ModeFields::Gp(f) => *f = ils,
            ModeFields::Vor(_) => {}
        }
    }

    fn overflow(&self) -> f32 {
        0.0
    }
}

#[derive(Default)]
struct SimulatedVor {
    frequency_hz: u64,
    ref_power: f32,
    phase: u64,
}

#[async_trait]
impl SignalAnalyzer for SimulatedVor {
    fn mode(&self) -> WorkMode {
        WorkMode::Vor
    }

    async fn init(
        &mut self,
        frequency_hz: u64,
        ref_power: f32,
        _cancel: CancellationToken,
    ) -> Result<()> {
        self.frequency_hz = frequency_hz;
        self.ref_power = ref_power;
        self.phase = 0;
        Ok(())
    }

    fn fill(&mut self, fields: &mut ModeFields) {
        self.phase += 1;
        let t = self.phase as f64 * 0.05;
        if let ModeFields::Vor(f) = fields {
            *f = VorFields {
                frequency_hz: self.frequency_hz,
                power_dbm: self.ref_power + (0.3 * (t * 0.7).cos()) as f32,
                field_strength_uv_m: 95.0,
                bearing_deg: ((t * 2.0) % 360.0) as f32,
                deviation_deg: (0.5 * t.sin()) as f32,
                am_30: 0.30,
                am_9960: 0.30,
            };
        }
    }

    fn overflow(&self) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ils_fill_produces_consistent_tones() {
        let mut a = SimulatedIls::new(WorkMode::Llz);
        a.init(109_500_000, -40.0, CancellationToken::new())
            .await
            .unwrap();
        let mut fields = ModeFields::empty(WorkMode::Llz).unwrap();
        a.fill(&mut fields);
        let ModeFields::Llz(f) = fields else {
            panic!("wrong variant");
        };
        assert_eq!(f.frequency_hz, 109_500_000);
        assert!((f.sdm - (f.am_90 + f.am_150)).abs() < 1e-6);
        assert!((f.ddm - (f.am_90 - f.am_150)).abs() < 1e-6);
        assert!(f.ddm.abs() < 0.05, "near on-course");
    }

    #[tokio::test]
    async fn vor_bearing_stays_in_range() {
        let mut a = SimulatedVor::default();
        a.init(113_100_000, -50.0, CancellationToken::new())
            .await
            .unwrap();
        let mut fields = ModeFields::empty(WorkMode::Vor).unwrap();
        for _ in 0..1000 {
            a.fill(&mut fields);
            let ModeFields::Vor(f) = &fields else {
                panic!("wrong variant");
            };
            assert!((0.0..360.0).contains(&f.bearing_deg));
        }
    }
}
