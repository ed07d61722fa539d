use anyhow::Result;
use std::path::{Path, PathBuf};

/// Base directory for config and logs.
///
/// `~/.livedebug` by default, overridable with `$LIVEDEBUG_HOME`.
pub fn livedebug_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("LIVEDEBUG_HOME") {
        return Ok(PathBuf::from(path));
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("No home directory"))?;
    Ok(home.join(".livedebug"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(livedebug_dir()?.join("logs"))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
