use std::path::PathBuf;
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

const SAVEDATA_DIR_NAME: &str = "savedata";
const DB_FILE_NAME: &str = "forkchat.db";

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Resolve and create the data directory.
///
/// `FORKCHAT_DATA_DIR` when set, else `./savedata`.
pub fn init_data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = DATA_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = env_path("FORKCHAT_DATA_DIR").unwrap_or_else(|| PathBuf::from(SAVEDATA_DIR_NAME));

    std::fs::create_dir_all(&dir).map_err(|e| format!("Failed to create data directory: {e}"))?;
    let _ = DATA_DIR.set(dir.clone());
    Ok(dir)
}

/// Local database file: `FORKCHAT_DB`, else `<data dir>/forkchat.db`.
pub fn local_db_path() -> Result<PathBuf, String> {
    if let Some(path) = env_path("FORKCHAT_DB") {
        return Ok(path);
    }
    Ok(init_data_dir()?.join(DB_FILE_NAME))
}
