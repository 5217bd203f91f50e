use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform-specific app data dir (`~/.local/share/fidelius/`, etc.), used
/// when no data directory is configured.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "fidelius")
        .context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}
