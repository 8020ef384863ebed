//! Run state machine: Stage, then Transcode, then Cleanup.
//!
//! Processing state is folder membership, so every phase starts from a fresh
//! scan of the folder it consumes. A run that crashed between phases resumes
//! by scanning again.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use crate::classifier::{Classification, FilenameClassifier};
use crate::config::CuratorConfig;
use crate::encoder::Encoder;
use crate::error::ItemError;
use crate::formatter::format_destination;
use crate::layout::{Category, Layout};
use crate::model::{PlanTarget, StagingPlan};
use crate::provider::MetadataProvider;
use crate::resolver::{MetadataResolver, RetryPolicy};
use crate::scan::{find_partials, scan_tree, ScanFilter};
use crate::sidecar;
use crate::stager::{is_partial, move_file, unique_path, FileStager};
use crate::transcoder::{TranscodeResult, Transcoder};

/// Two-stage interrupt. The first request stops dispatching new items and
/// lets in-flight work finish; the second also cancels running encodes.
#[derive(Debug, Clone)]
pub struct Shutdown {
    stop_dispatch: CancellationToken,
    abort: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        let abort = CancellationToken::new();
        // Aborting implies stopping dispatch
        let stop_dispatch = abort.child_token();
        Self { stop_dispatch, abort }
    }

    pub fn request_stop(&self) {
        self.stop_dispatch.cancel();
    }

    pub fn request_abort(&self) {
        self.abort.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_dispatch.is_cancelled()
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.is_cancelled()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub processed: usize,
    pub succeeded: usize,
    pub errored: usize,
}

impl PhaseCounts {
    fn record(&mut self, ok: bool) {
        self.processed += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.errored += 1;
        }
    }
}

impl fmt::Display for PhaseCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} processed, {} succeeded, {} errored", self.processed, self.succeeded, self.errored)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub stage: PhaseCounts,
    pub transcode: PhaseCounts,
    /// Files cleanup found left in Queue or Staged and moved to Errors
    pub strays_moved: usize,
    /// Strays that could not be moved; Queue and Staged were kept for them
    pub strays_kept: Vec<PathBuf>,
    /// The run stopped early on an interrupt; later phases did not run
    pub interrupted: bool,
}

impl RunSummary {
    pub fn log(&self) {
        info!("📊 Run summary");
        info!("   Stage:     {}", self.stage);
        info!("   Transcode: {}", self.transcode);
        info!("   Cleanup:   {} stray file(s) moved to Errors", self.strays_moved);
        if !self.strays_kept.is_empty() {
            warn!("   {} stray file(s) could not be moved and were left in place:", self.strays_kept.len());
            for path in &self.strays_kept {
                warn!("     {}", path.display());
            }
        }
        if self.interrupted {
            warn!("   Run was interrupted; remaining phases were skipped");
        }
    }
}

/// Result of the cleanup phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub moved: usize,
    /// Files whose move to Errors failed; they are still where they were
    pub kept: Vec<PathBuf>,
}

/// What happened to one file found during cleanup
#[derive(Debug, PartialEq, Eq)]
enum StrayOutcome {
    Moved,
    Removed,
    Kept,
}

/// What one transcode worker reports back on join
#[derive(Debug)]
enum WorkerOutcome {
    Completed,
    Errored,
    Cancelled,
}

pub struct Orchestrator {
    layout: Layout,
    classifier: FilenameClassifier,
    resolver: MetadataResolver,
    stager: Arc<FileStager>,
    transcoder: Arc<Transcoder>,
    workers: usize,
    dry_run: bool,
    shutdown: Shutdown,
}

impl Orchestrator {
    /// `encoder` is `None` when transcoding is skipped; staged files then move
    /// to Completed unchanged.
    pub fn new(
        cfg: &CuratorConfig,
        provider: Arc<dyn MetadataProvider>,
        encoder: Option<Arc<dyn Encoder>>,
        shutdown: Shutdown,
    ) -> Self {
        let layout = Layout::new(&cfg.media_root);
        let stager = Arc::new(FileStager::new(cfg.dry_run, cfg.overwrite));
        let transcoder = Transcoder::new(
            encoder,
            Arc::clone(&stager),
            layout.clone(),
            cfg.profile.container.clone(),
            cfg.keep_source,
            cfg.min_output_ratio,
        );
        Self {
            layout,
            classifier: FilenameClassifier::new(&cfg.extensions[..]),
            resolver: MetadataResolver::new(
                provider,
                cfg.resolver.clone(),
                RetryPolicy::from_config(&cfg.provider),
            ),
            stager,
            transcoder: Arc::new(transcoder),
            workers: cfg.workers.max(1),
            dry_run: cfg.dry_run,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if !self.dry_run {
            self.layout.ensure()?;
        }

        info!("🔄 Phase 1: staging files from {}", self.layout.queue().display());
        summary.stage = self.stage_phase().await?;
        info!("Stage phase done: {}", summary.stage);
        if self.shutdown.is_stopping() {
            summary.interrupted = true;
            return Ok(summary);
        }

        info!("🔄 Phase 2: transcoding files from {}", self.layout.staged().display());
        summary.transcode = self.transcode_phase().await?;
        info!("Transcode phase done: {}", summary.transcode);
        if self.shutdown.is_stopping() {
            summary.interrupted = true;
            return Ok(summary);
        }

        info!("🔄 Phase 3: cleanup");
        let cleanup = self.cleanup_phase()?;
        info!("Cleanup phase done: {} stray file(s) moved, {} kept", cleanup.moved, cleanup.kept.len());
        summary.strays_moved = cleanup.moved;
        summary.strays_kept = cleanup.kept;
        Ok(summary)
    }

    /// Queue -> Staged, one file at a time in discovery order
    pub async fn stage_phase(&self) -> Result<PhaseCounts> {
        let queue = self.layout.queue();
        let files = scan_tree(&queue, ScanFilter::Work)
            .with_context(|| format!("Failed to scan queue: {}", queue.display()))?;
        info!("Found {} file(s) in queue", files.len());

        let mut counts = PhaseCounts::default();
        for file in files {
            if self.shutdown.is_stopping() {
                warn!("Interrupt received, not staging remaining files");
                break;
            }

            let plan = self.plan(&file.path).await;
            let ok = match plan.target {
                PlanTarget::Stage(dest) => match self.stager.stage(&plan.source, &dest) {
                    Ok(outcome) => {
                        debug!("Staged {} -> {}", plan.source.display(), outcome.path().display());
                        true
                    }
                    Err(e) => {
                        self.quarantine(&plan.source, &queue, &e);
                        false
                    }
                },
                PlanTarget::Quarantine(e) => {
                    self.quarantine(&plan.source, &queue, &e);
                    false
                }
            };
            counts.record(ok);
        }
        Ok(counts)
    }

    /// Classify, resolve and format one queued file
    async fn plan(&self, source: &Path) -> StagingPlan {
        let candidate = match self.classifier.classify(source) {
            Classification::Candidate(c) => c,
            Classification::Unknown { reason, .. } => {
                return StagingPlan::failed(source.to_path_buf(), None, ItemError::ParseFailure(reason));
            }
        };

        let category = self.layout.category_of(&self.layout.queue(), source);
        if category == Some(Category::TvShows) && !candidate.is_episode() {
            return StagingPlan::failed(
                source.to_path_buf(),
                Some(candidate),
                ItemError::ParseFailure("no season/episode or air-date marker in a TV Shows file".into()),
            );
        }
        if category == Some(Category::Movies) && candidate.is_episode() {
            debug!("Episode marker found under Movies, treating as an episode: {}", source.display());
        }

        let identity = match self.resolver.resolve(&candidate).await.into_result() {
            Ok(identity) => identity,
            Err(e) => return StagingPlan::failed(source.to_path_buf(), Some(candidate), e),
        };

        let dest = self.layout.staged().join(format_destination(&candidate, &identity));
        StagingPlan {
            source: source.to_path_buf(),
            candidate: Some(candidate),
            identity: Some(identity),
            target: PlanTarget::Stage(dest),
        }
    }

    /// Route a failed item to Errors, keeping its path relative to `phase_root`
    fn quarantine(&self, source: &Path, phase_root: &Path, error: &ItemError) {
        error!("❌ {}: {}", source.display(), error);
        let rel = relative_to(source, phase_root);
        if let Err(e) = self.stager.quarantine(source, &self.layout.errors(), &rel, error) {
            error!("Failed to quarantine {}: {}", source.display(), e);
        }
    }

    /// Staged -> Completed on a bounded worker pool
    pub async fn transcode_phase(&self) -> Result<PhaseCounts> {
        self.sweep_partials()?;

        let staged = self.layout.staged();
        let files = scan_tree(&staged, ScanFilter::Work)
            .with_context(|| format!("Failed to scan staged folder: {}", staged.display()))?;
        info!("Found {} staged file(s), running {} worker(s)", files.len(), self.workers);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut workers = JoinSet::new();

        for file in files {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
                _ = self.shutdown.stop_dispatch.cancelled() => {
                    warn!("Interrupt received, waiting for {} running worker(s)", workers.len());
                    break;
                }
            };
            let Ok(permit) = permit else {
                break;
            };

            let transcoder = Arc::clone(&self.transcoder);
            let stager = Arc::clone(&self.stager);
            let errors_root = self.layout.errors();
            let staged_root = staged.clone();
            let abort = self.shutdown.abort.clone();
            workers.spawn(async move {
                let _permit = permit;
                match transcoder.transcode(&file.path, &abort).await {
                    TranscodeResult::Completed(dest) => {
                        info!("✅ {} -> {}", file.path.display(), dest.display());
                        WorkerOutcome::Completed
                    }
                    TranscodeResult::Cancelled => WorkerOutcome::Cancelled,
                    TranscodeResult::Failed(e) => {
                        error!("❌ {}: {}", file.path.display(), e);
                        let rel = relative_to(&file.path, &staged_root);
                        if let Err(qe) = stager.quarantine(&file.path, &errors_root, &rel, &e) {
                            error!("Failed to quarantine {}: {}", file.path.display(), qe);
                        }
                        WorkerOutcome::Errored
                    }
                }
            });
        }

        let mut counts = PhaseCounts::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(WorkerOutcome::Completed) => counts.record(true),
                Ok(WorkerOutcome::Errored) => counts.record(false),
                Ok(WorkerOutcome::Cancelled) => {}
                Err(e) => {
                    error!("Transcode worker panicked: {}", e);
                    counts.record(false);
                }
            }
        }
        Ok(counts)
    }

    /// Remove `*.partial` artefacts an interrupted run left behind
    fn sweep_partials(&self) -> Result<usize> {
        let partials = find_partials(&[self.layout.staged(), self.layout.completed()])?;
        if partials.is_empty() {
            return Ok(0);
        }

        info!("🔍 Found {} orphaned partial file(s)", partials.len());
        let mut removed = 0;
        for path in partials {
            if self.dry_run {
                info!("[dry-run] Would remove orphaned partial: {}", path.display());
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!("🧹 Removed orphaned partial: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphaned partial {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }

    /// Move what is left in Queue and Staged to Errors, drop Staged and reset
    /// Queue to its two category folders. Completed and existing Errors
    /// content are not touched. When a stray cannot be moved, both folders
    /// are kept and only emptied directories are pruned.
    pub fn cleanup_phase(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for phase_root in [self.layout.queue(), self.layout.staged()] {
            for file in scan_tree(&phase_root, ScanFilter::All)? {
                match self.move_stray(&file.path, &phase_root) {
                    StrayOutcome::Moved => report.moved += 1,
                    StrayOutcome::Removed => {}
                    StrayOutcome::Kept => report.kept.push(file.path),
                }
            }
        }

        if self.dry_run {
            info!("[dry-run] Would remove {} and reset {}",
                  self.layout.staged().display(), self.layout.queue().display());
            return Ok(report);
        }

        if !report.kept.is_empty() {
            error!("{} file(s) could not be moved to Errors; keeping {} and {}",
                   report.kept.len(), self.layout.queue().display(), self.layout.staged().display());
            prune_empty_dirs(&self.layout.staged());
            prune_empty_dirs(&self.layout.queue());
            for category in Category::ALL {
                let dir = self.layout.queue_category(category);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create queue folder: {}", dir.display()))?;
            }
            return Ok(report);
        }

        let staged = self.layout.staged();
        if staged.exists() {
            fs::remove_dir_all(&staged)
                .with_context(|| format!("Failed to remove staged folder: {}", staged.display()))?;
        }
        self.layout.reset_queue()?;
        Ok(report)
    }

    fn move_stray(&self, path: &Path, phase_root: &Path) -> StrayOutcome {
        if is_partial(path) {
            if self.dry_run {
                info!("[dry-run] Would remove partial file: {}", path.display());
            } else if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove partial file {}: {}", path.display(), e);
            }
            return StrayOutcome::Removed;
        }

        let rel = relative_to(path, phase_root);
        if sidecar::is_why_txt(path) {
            let dest = unique_path(&self.layout.errors().join(&rel));
            if self.dry_run {
                info!("[dry-run] Would move sidecar {} -> {}", path.display(), dest.display());
                return StrayOutcome::Moved;
            }
            return match move_file(path, &dest) {
                Ok(()) => StrayOutcome::Moved,
                Err(e) => {
                    error!("Failed to move sidecar {}: {}", path.display(), e);
                    StrayOutcome::Kept
                }
            };
        }

        warn!("Stray file left after processing: {}", path.display());
        let reason = ItemError::Leftover(format!("still in {} after all phases", folder_name(phase_root)));
        match self.stager.quarantine(path, &self.layout.errors(), &rel, &reason) {
            Ok(_) => StrayOutcome::Moved,
            Err(e) => {
                error!("Failed to move stray {}: {}", path.display(), e);
                StrayOutcome::Kept
            }
        }
    }
}

/// Remove directories under `root` that hold no files, deepest first. The
/// root itself stays.
fn prune_empty_dirs(root: &Path) {
    let dirs = walkdir::WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir());
    for dir in dirs {
        // Fails on non-empty directories, which is what keeps them
        let _ = fs::remove_dir(dir.path());
    }
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.file_name().map(PathBuf::from).unwrap_or_default(),
    }
}

fn folder_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
