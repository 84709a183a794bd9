use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TtParams {
    // Table size in MiB for callers that don't pass an explicit size
    pub hash_mb: usize,
    // Worker count used when zeroing the table
    pub clear_threads: usize,
    // Age window (in searches) counted by the hashfull report
    pub hashfull_max_age: u8,
}

impl Default for TtParams {
    fn default() -> Self {
        Self {
            hash_mb: 16,
            clear_threads: 1,
            hashfull_max_age: 0,
        }
    }
}

lazy_static::lazy_static! {
    pub static ref PARAMS: RwLock<TtParams> = RwLock::new(TtParams::default());
}

pub fn load_params_from(path: &str) -> anyhow::Result<()> {
    let data = fs::read_to_string(path)?;
    let p: TtParams = serde_json::from_str(&data)?;
    *PARAMS.write() = p;
    Ok(())
}

pub fn save_params_to(path: &str) -> anyhow::Result<()> {
    let p = PARAMS.read().clone();
    let s = serde_json::to_string_pretty(&p)?;
    fs::write(path, s)?;
    Ok(())
}
