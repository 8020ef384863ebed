//! Deterministic stand-ins for the provider and encoder capabilities.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use crate::encoder::{EncodeOutcome, Encoder};
use crate::model::YearSpan;
use crate::provider::{
    EpisodeListing, MetadataProvider, ProviderCandidate, ProviderEpisode, ProviderError, SearchQuery,
};

pub fn movie_hit(id: &str, title: &str, year: Option<i32>) -> ProviderCandidate {
    ProviderCandidate {
        id: id.to_string(),
        title: title.to_string(),
        original_title: None,
        year,
    }
}

pub fn series_hit(id: &str, title: &str, year: Option<i32>) -> ProviderCandidate {
    movie_hit(id, title, year)
}

/// Listing from `(season, episode, title, air date)` rows
pub fn listing(
    title: &str,
    years: YearSpan,
    rows: &[(u32, u32, &str, Option<(i32, u32, u32)>)],
) -> EpisodeListing {
    EpisodeListing {
        title: title.to_string(),
        years,
        episodes: rows
            .iter()
            .map(|(season, episode, name, date)| ProviderEpisode {
                season: *season,
                episode: *episode,
                title: name.to_string(),
                air_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            })
            .collect(),
    }
}

/// In-memory provider keyed by lowercase query title. Clones share counters.
#[derive(Clone, Default)]
pub struct StubProvider {
    searches: HashMap<String, Vec<ProviderCandidate>>,
    listings: HashMap<String, EpisodeListing>,
    transient_failures: Arc<AtomicUsize>,
    search_calls: Arc<AtomicUsize>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, title: &str, hits: Vec<ProviderCandidate>) -> Self {
        self.searches.insert(title.to_lowercase(), hits);
        self
    }

    pub fn with_listing(mut self, id: &str, listing: EpisodeListing) -> Self {
        self.listings.insert(id.to_string(), listing);
        self
    }

    /// The next `n` calls fail with a transient error
    pub fn failing_transiently(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), ProviderError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transient("simulated timeout".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataProvider for StubProvider {
    fn name(&self) -> &str {
        "provider"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProviderCandidate>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self.searches.get(&query.title.to_lowercase()).cloned().unwrap_or_default())
    }

    async fn fetch_episodes(&self, series_id: &str) -> Result<EpisodeListing, ProviderError> {
        self.take_failure()?;
        self.listings
            .get(series_id)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("tv/{} returned HTTP 404", series_id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    /// Output is a copy of the input
    Succeed,
    /// Exits non-zero without output
    Fail,
    /// Exits zero with a one-byte output
    Truncate,
    /// Probe reports the input as already compatible
    Compatible,
    /// Writes some output, then waits to be cancelled
    Hang,
    /// Full-size output that fails verification
    Corrupt,
}

#[derive(Clone)]
pub struct StubEncoder {
    behavior: StubBehavior,
    encode_calls: Arc<AtomicUsize>,
}

impl StubEncoder {
    pub fn new(behavior: StubBehavior) -> Self {
        Self { behavior, encode_calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for StubEncoder {
    fn name(&self) -> &str {
        "stub264"
    }

    async fn is_compatible(&self, _input: &Path) -> Result<bool> {
        Ok(self.behavior == StubBehavior::Compatible)
    }

    async fn encode(&self, input: &Path, output: &Path, cancel: &CancellationToken) -> Result<EncodeOutcome> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            StubBehavior::Succeed | StubBehavior::Compatible | StubBehavior::Corrupt => {
                fs::copy(input, output)?;
                Ok(EncodeOutcome::Finished)
            }
            StubBehavior::Fail => Ok(EncodeOutcome::Failed {
                exit_code: Some(1),
                stderr_tail: "Invalid data found when processing input".into(),
            }),
            StubBehavior::Truncate => {
                fs::write(output, b"x")?;
                Ok(EncodeOutcome::Finished)
            }
            StubBehavior::Hang => {
                fs::write(output, b"partial")?;
                cancel.cancelled().await;
                Ok(EncodeOutcome::Cancelled)
            }
        }
    }

    async fn verify_output(&self, _input: &Path, _output: &Path) -> Result<()> {
        match self.behavior {
            StubBehavior::Corrupt => Err(anyhow::anyhow!("encoded output has no video stream")),
            _ => Ok(()),
        }
    }
}
