use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::FatalError;

pub const QUEUE_DIR: &str = "Queue";
pub const STAGED_DIR: &str = "Staged";
pub const COMPLETED_DIR: &str = "Completed";
pub const ERRORS_DIR: &str = "Errors";

/// Top-level library category, also the name of the Queue subfolders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Movies,
    TvShows,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Movies, Category::TvShows];

    pub fn folder_name(&self) -> &'static str {
        match self {
            Category::Movies => "Movies",
            Category::TvShows => "TV Shows",
        }
    }

    pub fn from_folder_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.folder_name() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name())
    }
}

/// Fixed folder layout under the media root. A file's processing state is
/// the top-level folder that currently contains it.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> PathBuf {
        self.root.join(QUEUE_DIR)
    }

    pub fn queue_category(&self, category: Category) -> PathBuf {
        self.queue().join(category.folder_name())
    }

    pub fn staged(&self) -> PathBuf {
        self.root.join(STAGED_DIR)
    }

    pub fn completed(&self) -> PathBuf {
        self.root.join(COMPLETED_DIR)
    }

    pub fn errors(&self) -> PathBuf {
        self.root.join(ERRORS_DIR)
    }

    /// The root must be an existing directory; nothing is created for it
    pub fn validate(&self) -> Result<(), FatalError> {
        let invalid = |reason: &str| FatalError::InvalidRoot {
            path: self.root.clone(),
            reason: reason.to_string(),
        };
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(invalid("not a directory")),
            Err(e) => Err(invalid(&e.to_string())),
        }
    }

    /// Create Staged, Completed and Errors. Queue and its category folders are
    /// operator-owned and only recreated by cleanup.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.staged(), self.completed(), self.errors()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Reset Queue to exactly its two category folders
    pub fn reset_queue(&self) -> Result<()> {
        let queue = self.queue();
        if queue.exists() {
            fs::remove_dir_all(&queue)
                .with_context(|| format!("Failed to remove queue folder: {}", queue.display()))?;
        }
        for category in Category::ALL {
            let dir = self.queue_category(category);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create queue folder: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Category of a path under Queue or Staged, taken from its first component
    pub fn category_of(&self, phase_root: &Path, path: &Path) -> Option<Category> {
        let rel = path.strip_prefix(phase_root).ok()?;
        let first = rel.components().next()?;
        // A file directly in the phase root has no category folder
        if rel.components().count() < 2 {
            return None;
        }
        Category::from_folder_name(first.as_os_str().to_str()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_of() {
        let layout = Layout::new("/media");
        let queue = layout.queue();

        assert_eq!(
            layout.category_of(&queue, Path::new("/media/Queue/TV Shows/Show/ep.mkv")),
            Some(Category::TvShows)
        );
        assert_eq!(
            layout.category_of(&queue, Path::new("/media/Queue/Movies/a.mkv")),
            Some(Category::Movies)
        );
        assert_eq!(layout.category_of(&queue, Path::new("/media/Queue/a.mkv")), None);
        assert_eq!(layout.category_of(&queue, Path::new("/media/Queue/Other/a.mkv")), None);
        assert_eq!(layout.category_of(&queue, Path::new("/elsewhere/a.mkv")), None);
    }

    #[test]
    fn test_validate_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Layout::new(tmp.path()).validate().is_ok());

        let file = tmp.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(Layout::new(&file).validate(), Err(FatalError::InvalidRoot { .. })));
        assert!(Layout::new(tmp.path().join("missing")).validate().is_err());
    }

    #[test]
    fn test_ensure_and_reset_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure().unwrap();
        assert!(layout.staged().is_dir());
        assert!(layout.completed().is_dir());
        assert!(layout.errors().is_dir());
        assert!(!layout.queue().exists());

        fs::create_dir_all(layout.queue().join("junk/deep")).unwrap();
        layout.reset_queue().unwrap();

        let mut names: Vec<_> = fs::read_dir(layout.queue())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Movies".to_string(), "TV Shows".to_string()]);
    }
}
