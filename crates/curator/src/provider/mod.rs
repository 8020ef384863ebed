//! Metadata provider capability consumed by the resolver.
//!
//! The resolver only ever sees [`MetadataProvider`]; the TMDb client is one
//! implementation and tests substitute deterministic stubs.

pub mod tmdb;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::model::YearSpan;

pub use tmdb::TmdbProvider;

/// What kind of title a search is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKind {
    Movie,
    Series,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub kind: SearchKind,
    pub title: String,
    pub year: Option<i32>,
}

/// One search hit, unscored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub id: String,
    pub title: String,
    /// Title in the original language, when the provider reports a different one
    pub original_title: Option<String>,
    /// Release year (movies) or first-air year (series)
    pub year: Option<i32>,
}

/// Full episode listing of a series, indexed by both season/episode and air date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeListing {
    pub title: String,
    pub years: YearSpan,
    pub episodes: Vec<ProviderEpisode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEpisode {
    pub season: u32,
    pub episode: u32,
    pub title: String,
    pub air_date: Option<NaiveDate>,
}

impl EpisodeListing {
    pub fn find(&self, season: u32, episode: u32) -> Option<&ProviderEpisode> {
        self.episodes.iter().find(|e| e.season == season && e.episode == episode)
    }

    /// Episodes aired on `date`, regular seasons first, then by season and episode
    pub fn aired_on(&self, date: NaiveDate) -> Vec<&ProviderEpisode> {
        let mut hits: Vec<&ProviderEpisode> =
            self.episodes.iter().filter(|e| e.air_date == Some(date)).collect();
        hits.sort_by_key(|e| (e.season == 0, e.season, e.episode));
        hits
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network trouble, timeouts, rate limiting and server errors; worth retrying
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider request failed: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Short provider label used in library folder names, e.g. "tmdb"
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProviderCandidate>, ProviderError>;

    async fn fetch_episodes(&self, series_id: &str) -> Result<EpisodeListing, ProviderError>;
}
