use anyhow::Result;
use std::path::Path;

use crate::CalibConfig;

pub fn check_calibration(cfg: &CalibConfig) -> Result<()> {
    let p = Path::new(&cfg.calibration_folder);
    if p.exists() {
        anyhow::ensure!(
            p.is_dir(),
            "calibration.calibration_folder is not a dir: {}",
            cfg.calibration_folder
        );
    }
    Ok(())
}
