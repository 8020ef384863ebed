pub mod classifier;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ffprobe;
pub mod formatter;
pub mod layout;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod scan;
pub mod sidecar;
pub mod stager;
pub mod transcoder;

#[cfg(test)]
mod testing;

pub use classifier::{Classification, FilenameClassifier};
pub use config::{CuratorConfig, TranscodeProfile, API_KEY_ENV};
pub use encoder::{Encoder, FfmpegEncoder};
pub use error::{FatalError, ItemError};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use layout::{Category, Layout};
pub use model::{MediaCandidate, ResolvedIdentity};
pub use orchestrator::{Orchestrator, RunSummary, Shutdown};
pub use provider::{MetadataProvider, TmdbProvider};
