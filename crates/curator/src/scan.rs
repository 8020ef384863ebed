use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use walkdir::WalkDir;
use crate::sidecar;
use crate::stager::is_partial;
use log::{debug, info, warn};

/// A regular file found under a phase folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size: u64,
}

/// What a scan should yield
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Media to process: reason sidecars and partial artefacts are left out
    Work,
    /// Every regular file, for cleanup
    All,
}

/// Recursively list files under `root` in a stable order (sorted by file name
/// at each level). A missing root yields an empty list.
pub fn scan_tree(root: &Path, filter: ScanFilter) -> Result<Vec<DiscoveredFile>> {
    let mut results = Vec::new();
    if !root.exists() {
        debug!("Scan root does not exist: {}", root.display());
        return Ok(results);
    }

    let mut entry_count = 0;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker.into_iter() {
        entry_count += 1;

        // Log progress every 1000 entries
        if entry_count % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", entry_count, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        if filter == ScanFilter::Work && (sidecar::is_why_txt(path) || is_partial(path)) {
            debug!("Ignoring non-media artefact: {}", path.display());
            continue;
        }

        let size = entry
            .metadata()
            .with_context(|| format!("Failed to stat file: {}", path.display()))?
            .len();
        results.push(DiscoveredFile { path: path.to_path_buf(), size });
    }

    debug!("Finished scanning {}: {} entries, {} files", root.display(), entry_count, results.len());
    Ok(results)
}

/// Leftover `*.partial` files from an interrupted run
pub fn find_partials(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for root in roots {
        for file in scan_tree(root, ScanFilter::All)? {
            if is_partial(&file.path) {
                found.push(file.path);
            }
        }
    }
    Ok(found)
}
