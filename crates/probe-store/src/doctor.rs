use anyhow::Result;
use std::path::Path;

use crate::StoreConfig;

pub fn check_store(cfg: &StoreConfig) -> Result<()> {
    let p = Path::new(&cfg.record_store_folder);
    if p.exists() {
        anyhow::ensure!(
            p.is_dir(),
            "store.record_store_folder is not a dir: {}",
            cfg.record_store_folder
        );
    }
    anyhow::ensure!(
        cfg.file_cache_time_ms >= 100,
        "store.file_cache_time_ms too small; set >= 100"
    );
    Ok(())
}
