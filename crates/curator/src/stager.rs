use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use crate::error::ItemError;
use crate::sidecar;

const PARTIAL_EXT: &str = "partial";

/// True for in-progress copy or encode outputs
pub fn is_partial(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_EXT)
}

/// Hidden sibling of `dest` used while it is being written:
/// `dir/.name.<uuid>.partial`
pub fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.{}", name, uuid::Uuid::new_v4().simple(), PARTIAL_EXT))
}

/// Successful outcome of a stage call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Moved(PathBuf),
    /// Destination already held a same-size file; the source was dropped
    Redundant(PathBuf),
    /// Dry-run: nothing was touched
    Planned(PathBuf),
}

impl StageOutcome {
    pub fn path(&self) -> &Path {
        match self {
            StageOutcome::Moved(p) | StageOutcome::Redundant(p) | StageOutcome::Planned(p) => p,
        }
    }
}

/// The single move primitive every phase goes through. Safe to share between
/// workers: destinations are reserved for the whole run, so two sources that
/// map to one path never both land there.
#[derive(Debug, Default)]
pub struct FileStager {
    dry_run: bool,
    overwrite: bool,
    reserved: Mutex<HashSet<PathBuf>>,
}

fn fs_failure(what: &str, path: &Path, err: io::Error) -> ItemError {
    ItemError::FilesystemFailure(format!("{} {}: {}", what, path.display(), err))
}

impl FileStager {
    pub fn new(dry_run: bool, overwrite: bool) -> Self {
        Self {
            dry_run,
            overwrite,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Claim `dest` for this run. False if another source already claimed it.
    fn reserve(&self, dest: &Path) -> bool {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reserved.insert(dest.to_path_buf())
    }

    /// Move `source` to `dest`, creating parent folders as needed.
    pub fn stage(&self, source: &Path, dest: &Path) -> Result<StageOutcome, ItemError> {
        if source == dest {
            return Ok(StageOutcome::Redundant(dest.to_path_buf()));
        }
        if !self.reserve(dest) {
            return Err(ItemError::DestinationCollision(dest.to_path_buf()));
        }

        let source_len = fs::metadata(source)
            .map_err(|e| fs_failure("Failed to stat", source, e))?
            .len();

        if let Ok(existing) = fs::metadata(dest) {
            if existing.len() == source_len {
                info!("Destination already present ({}), dropping duplicate source: {}",
                      format_size(source_len, DECIMAL), source.display());
                if !self.dry_run {
                    fs::remove_file(source).map_err(|e| fs_failure("Failed to remove", source, e))?;
                }
                return Ok(StageOutcome::Redundant(dest.to_path_buf()));
            }
            if !self.overwrite {
                return Err(ItemError::DestinationCollision(dest.to_path_buf()));
            }
            warn!("Overwriting {} ({} -> {})", dest.display(),
                  format_size(existing.len(), DECIMAL), format_size(source_len, DECIMAL));
        }

        if self.dry_run {
            info!("[dry-run] Would move {} -> {}", source.display(), dest.display());
            return Ok(StageOutcome::Planned(dest.to_path_buf()));
        }

        move_file(source, dest)?;
        info!("Moved {} -> {}", source.display(), dest.display());
        Ok(StageOutcome::Moved(dest.to_path_buf()))
    }

    /// Move a failed item to `errors_root/rel` with a reason sidecar. An
    /// existing file there is never replaced; a ` (n)` suffix is added instead.
    pub fn quarantine(
        &self,
        source: &Path,
        errors_root: &Path,
        rel: &Path,
        error: &ItemError,
    ) -> Result<PathBuf, ItemError> {
        let dest = unique_path(&errors_root.join(rel));
        if self.dry_run {
            info!("[dry-run] Would quarantine {} -> {} ({})", source.display(), dest.display(), error);
            return Ok(dest);
        }

        move_file(source, &dest)?;
        if let Err(e) = sidecar::write_why_txt(&dest, source, error) {
            warn!("{:#}", e);
        }
        warn!("Quarantined {} -> {}: {}", source.display(), dest.display(), error);
        Ok(dest)
    }
}

/// First of `path`, `stem (1).ext`, `stem (2).ext`, ... that does not exist
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    (1u32..)
        .map(|n| path.with_file_name(format!("{} ({}){}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Rename, or copy through a partial file when rename is not possible (e.g.
/// across volumes). The source is only removed once the copy is complete.
pub fn move_file(source: &Path, dest: &Path) -> Result<(), ItemError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| fs_failure("Failed to create", parent, e))?;
    }

    match fs::rename(source, dest) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(fs_failure("Failed to move", source, e));
        }
        Err(e) => debug!("rename {} failed ({}), copying instead", source.display(), e),
    }
    copy_then_remove(source, dest)
}

/// Copy into a partial sibling of `dest`, rename it into place, then remove
/// the source. On failure the source is untouched and no partial remains.
pub fn copy_then_remove(source: &Path, dest: &Path) -> Result<(), ItemError> {
    let partial = partial_path(dest);
    let copied = fs::copy(source, &partial).and_then(|_| fs::rename(&partial, dest));
    if let Err(e) = copied {
        if let Err(cleanup) = fs::remove_file(&partial) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove partial copy {}: {}", partial.display(), cleanup);
            }
        }
        return Err(fs_failure("Failed to copy", source, e));
    }

    if let Err(e) = fs::remove_file(source) {
        warn!("Copied {} but could not remove the source: {}", source.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn write(path: &Path, body: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_stage_moves_and_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("Queue/Movies/a.mkv");
        let dest = tmp.path().join("Staged/Movies/A (2000) {p-1}/A (2000).mkv");
        write(&src, b"abc");

        let outcome = FileStager::new(false, false).stage(&src, &dest).unwrap();
        assert_eq!(outcome, StageOutcome::Moved(dest.clone()));
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }

    #[test]
    fn test_same_size_destination_is_redundant() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("q/a.mkv");
        let dest = tmp.path().join("s/a.mkv");
        write(&src, b"abc");
        write(&dest, b"xyz");

        let outcome = FileStager::new(false, false).stage(&src, &dest).unwrap();
        assert!(matches!(outcome, StageOutcome::Redundant(_)));
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"xyz");
    }

    #[test]
    fn test_differing_destination_collides_unless_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("q/a.mkv");
        let dest = tmp.path().join("s/a.mkv");
        write(&src, b"abcdef");
        write(&dest, b"xyz");

        let err = FileStager::new(false, false).stage(&src, &dest).unwrap_err();
        assert_eq!(err, ItemError::DestinationCollision(dest.clone()));
        assert!(src.exists());

        FileStager::new(false, true).stage(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abcdef");
    }

    #[test]
    fn test_second_source_to_reserved_destination_collides() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("q/a.mkv");
        let b = tmp.path().join("q/b.mkv");
        let dest = tmp.path().join("s/x.mkv");
        write(&a, b"same");
        write(&b, b"same");

        let stager = FileStager::new(false, false);
        stager.stage(&a, &dest).unwrap();
        let err = stager.stage(&b, &dest).unwrap_err();
        assert!(matches!(err, ItemError::DestinationCollision(_)));
        assert!(b.exists());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("q/a.mkv");
        let dest = tmp.path().join("s/deep/a.mkv");
        write(&src, b"abc");

        let stager = FileStager::new(true, false);
        let outcome = stager.stage(&src, &dest).unwrap();
        assert_eq!(outcome, StageOutcome::Planned(dest.clone()));
        let err = ItemError::ParseFailure("x".into());
        stager.quarantine(&src, &tmp.path().join("e"), Path::new("a.mkv"), &err).unwrap();

        assert!(src.exists());
        assert!(!tmp.path().join("s").exists());
        assert!(!tmp.path().join("e").exists());
    }

    #[test]
    fn test_quarantine_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let errors = tmp.path().join("Errors");
        let err = ItemError::ResolutionNotFound("nothing".into());
        let stager = FileStager::new(false, false);

        let first = tmp.path().join("q1/Movies/x.mkv");
        let second = tmp.path().join("q2/Movies/x.mkv");
        write(&first, b"1");
        write(&second, b"2");

        let a = stager.quarantine(&first, &errors, Path::new("Movies/x.mkv"), &err).unwrap();
        let b = stager.quarantine(&second, &errors, Path::new("Movies/x.mkv"), &err).unwrap();

        assert_eq!(a, errors.join("Movies/x.mkv"));
        assert_eq!(b, errors.join("Movies/x (1).mkv"));
        assert_eq!(fs::read(&a).unwrap(), b"1");
        assert_eq!(fs::read(&b).unwrap(), b"2");
        assert!(sidecar::why_txt_path(&b).exists());
    }

    #[test]
    fn test_concurrent_stage_of_disjoint_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let stager = Arc::new(FileStager::new(false, false));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let src = tmp.path().join(format!("q/{}.mkv", i));
                let dest = tmp.path().join(format!("s/{}/{}.mkv", i % 2, i));
                write(&src, b"data");
                let stager = Arc::clone(&stager);
                std::thread::spawn(move || stager.stage(&src, &dest))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(fs::read_dir(tmp.path().join("s/0")).unwrap().count(), 4);
    }

    fn partials_in(dir: &Path) -> usize {
        match fs::read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).filter(|e| is_partial(&e.path())).count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_copy_then_remove_replaces_source() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("q/a.mkv");
        let dest = tmp.path().join("s/a.mkv");
        write(&src, b"payload");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();

        copy_then_remove(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert_eq!(partials_in(&tmp.path().join("s")), 0);
    }

    #[test]
    fn test_failed_copy_keeps_source_and_leaves_no_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("q/a.mkv");
        write(&src, b"payload");
        // Destination parent is a plain file, so the partial cannot be created
        let blocker = tmp.path().join("s");
        fs::write(&blocker, b"").unwrap();

        let err = copy_then_remove(&src, &blocker.join("a.mkv")).unwrap_err();
        assert!(matches!(err, ItemError::FilesystemFailure(_)));
        assert_eq!(fs::read(&src).unwrap(), b"payload");
        assert_eq!(partials_in(tmp.path()), 0);

        // Rename onto an existing directory fails after the copy succeeded
        let dest_dir = tmp.path().join("d/a.mkv");
        fs::create_dir_all(dest_dir.join("inner")).unwrap();
        let err = copy_then_remove(&src, &dest_dir).unwrap_err();
        assert!(matches!(err, ItemError::FilesystemFailure(_)));
        assert_eq!(fs::read(&src).unwrap(), b"payload");
        assert_eq!(partials_in(&tmp.path().join("d")), 0);
    }

    #[test]
    fn test_partial_paths() {
        let p = partial_path(Path::new("/c/Movies/A.mp4"));
        assert!(is_partial(&p));
        assert!(p.file_name().unwrap().to_str().unwrap().starts_with(".A.mp4."));
        assert_ne!(p, partial_path(Path::new("/c/Movies/A.mp4")));
    }
}
