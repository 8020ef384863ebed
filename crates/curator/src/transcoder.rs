use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use crate::encoder::{EncodeOutcome, Encoder};
use crate::error::ItemError;
use crate::layout::Layout;
use crate::stager::{partial_path, FileStager};

/// Outcome of moving one staged file into Completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeResult {
    Completed(PathBuf),
    /// The staged source is left in place for quarantine
    Failed(ItemError),
    /// Interrupted mid-encode; partial output removed, source untouched
    Cancelled,
}

pub struct Transcoder {
    /// `None` moves every staged file as-is (skip-transcode)
    encoder: Option<Arc<dyn Encoder>>,
    stager: Arc<FileStager>,
    layout: Layout,
    container: String,
    keep_source: bool,
    min_output_ratio: f64,
}

/// `dir/name.ext` -> `dir/name.orig.ext`
fn orig_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{}.orig.{}", stem, ext.to_string_lossy())),
        None => path.with_file_name(format!("{}.orig", stem)),
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {}: {}", path.display(), e);
        }
    }
}

impl Transcoder {
    pub fn new(
        encoder: Option<Arc<dyn Encoder>>,
        stager: Arc<FileStager>,
        layout: Layout,
        container: impl Into<String>,
        keep_source: bool,
        min_output_ratio: f64,
    ) -> Self {
        Self {
            encoder,
            stager,
            layout,
            container: container.into(),
            keep_source,
            min_output_ratio,
        }
    }

    pub async fn transcode(&self, staged: &Path, cancel: &CancellationToken) -> TranscodeResult {
        let staged_root = self.layout.staged();
        let Ok(rel) = staged.strip_prefix(&staged_root) else {
            return TranscodeResult::Failed(ItemError::FilesystemFailure(format!(
                "{} is not under {}",
                staged.display(),
                staged_root.display()
            )));
        };
        let as_is = self.layout.completed().join(rel);

        let Some(encoder) = &self.encoder else {
            return self.move_as_is(staged, &as_is);
        };

        match encoder.is_compatible(staged).await {
            Ok(true) => {
                info!("Already compatible, no encode needed: {}", staged.display());
                return self.move_as_is(staged, &as_is);
            }
            Ok(false) => {}
            Err(e) => {
                return TranscodeResult::Failed(ItemError::EncodeFailure(format!("probe failed: {:#}", e)));
            }
        }

        let dest = as_is.with_extension(&self.container);
        if self.stager.is_dry_run() {
            info!("[dry-run] Would encode {} -> {} with {}", staged.display(), dest.display(), encoder.name());
            return TranscodeResult::Completed(dest);
        }

        if let Err(result) = self.encode_verified(encoder.as_ref(), staged, &dest, cancel).await {
            return result;
        }

        self.retire_source(staged, &dest);
        TranscodeResult::Completed(dest)
    }

    fn move_as_is(&self, staged: &Path, dest: &Path) -> TranscodeResult {
        match self.stager.stage(staged, dest) {
            Ok(outcome) => TranscodeResult::Completed(outcome.path().to_path_buf()),
            Err(e) => TranscodeResult::Failed(e),
        }
    }

    /// Encode into a partial file next to `dest`, check it, then move it into place
    async fn encode_verified(
        &self,
        encoder: &dyn Encoder,
        staged: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeResult> {
        let failed = |reason: String| Err(TranscodeResult::Failed(ItemError::EncodeFailure(reason)));

        let source_len = match fs::metadata(staged) {
            Ok(m) => m.len(),
            Err(e) => {
                return Err(TranscodeResult::Failed(ItemError::FilesystemFailure(format!(
                    "Failed to stat {}: {}",
                    staged.display(),
                    e
                ))))
            }
        };
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Err(TranscodeResult::Failed(ItemError::FilesystemFailure(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))));
            }
        }

        let partial = partial_path(dest);
        info!("Encoding {} ({}) with {}", staged.display(), format_size(source_len, DECIMAL), encoder.name());

        let outcome = match encoder.encode(staged, &partial, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                remove_partial(&partial);
                return failed(format!("{:#}", e));
            }
        };

        match outcome {
            EncodeOutcome::Finished => {}
            EncodeOutcome::Cancelled => {
                remove_partial(&partial);
                info!("Encode cancelled, partial output removed: {}", staged.display());
                return Err(TranscodeResult::Cancelled);
            }
            EncodeOutcome::Failed { exit_code, stderr_tail } => {
                remove_partial(&partial);
                let code = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
                return failed(format!("encoder exited with {}: {}", code, stderr_tail.trim()));
            }
        }

        let output_len = fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);
        let min_len = (source_len as f64 * self.min_output_ratio) as u64;
        if output_len == 0 || output_len < min_len {
            remove_partial(&partial);
            return failed(format!(
                "output looks truncated: {} from a {} source",
                format_size(output_len, DECIMAL),
                format_size(source_len, DECIMAL)
            ));
        }
        debug!("Encoded {} -> {}", format_size(source_len, DECIMAL), format_size(output_len, DECIMAL));

        if let Err(e) = encoder.verify_output(staged, &partial).await {
            remove_partial(&partial);
            return failed(format!("output failed verification: {:#}", e));
        }

        if let Err(e) = self.stager.stage(&partial, dest) {
            remove_partial(&partial);
            return Err(TranscodeResult::Failed(e));
        }
        Ok(())
    }

    /// Drop the staged original, or keep it next to the output
    fn retire_source(&self, staged: &Path, dest: &Path) {
        if self.keep_source {
            let orig = orig_path(&dest.with_extension(staged.extension().unwrap_or_default()));
            if let Err(e) = self.stager.stage(staged, &orig) {
                warn!("Failed to keep source {}: {}", staged.display(), e);
            }
        } else if let Err(e) = fs::remove_file(staged) {
            warn!("Encoded output is in place but the staged source could not be removed: {}: {}",
                  staged.display(), e);
        }
    }
}
