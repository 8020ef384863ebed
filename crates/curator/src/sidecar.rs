use std::ffi::OsString;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;
use crate::error::ItemError;

const WHY_SUFFIX: &str = ".why.txt";

/// Get the path to the why.txt file for a given media file
/// (`Movie.mkv` -> `Movie.mkv.why.txt`, so the original extension survives)
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut name: OsString = file_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(WHY_SUFFIX);
    file_path.with_file_name(name)
}

/// True for reason sidecars, which scans and cleanup never treat as media
pub fn is_why_txt(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(WHY_SUFFIX))
        .unwrap_or(false)
}

/// Write a why.txt file explaining why a file was quarantined
pub fn write_why_txt(file_path: &Path, source: &Path, error: &ItemError) -> Result<()> {
    let why_path = why_txt_path(file_path);
    let body = format!(
        "kind: {}\nreason: {}\nsource: {}\n",
        error.kind(),
        error,
        source.display()
    );
    fs::write(&why_path, body)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}
