//! Subcommands of the `health-insights` binary

pub mod aggregate;
pub mod insights;

use std::io::Read;
use std::sync::Arc;

use crate::config::{ensure_dir, Config};
use crate::error::Result;
use crate::store::SqliteStore;

pub use aggregate::aggregate;
pub use insights::{handle, insights, show};

/// Read a whole input file, or stdin for `-`
pub fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Open the configured aggregate database, creating its directory
pub fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let path = &config.storage.db_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    tracing::debug!(db = %path.display(), "opening aggregate database");
    Ok(Arc::new(SqliteStore::open(path)?))
}
