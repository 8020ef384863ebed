use std::fmt;
use std::path::PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use crate::error::ItemError;

/// Immutable result of classifying one file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub source_path: PathBuf,
    pub kind: CandidateKind,
    /// Raw title words before the first recognised marker. A trailing year,
    /// when present, stays in the sequence as a disambiguation hint.
    pub title_tokens: Vec<String>,
    pub split_part: Option<SplitPart>,
    /// Free text after an episode marker, used when the provider has no title
    #[serde(default)]
    pub episode_title: Option<String>,
    /// Original extension without the dot, case preserved
    pub raw_extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateKind {
    Movie,
    Episode(EpisodeKey),
}

/// How an episode is addressed. Exactly one shape per candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeKey {
    Season {
        season: u32,
        episode_start: u32,
        /// Set only for multi-episode files, always greater than `episode_start`
        episode_end: Option<u32>,
    },
    AirDate(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitKind {
    Cd,
    Disc,
    Disk,
    Dvd,
    Part,
    Pt,
}

impl SplitKind {
    pub fn parse(marker: &str) -> Option<Self> {
        match marker.to_ascii_lowercase().as_str() {
            "cd" => Some(SplitKind::Cd),
            "disc" => Some(SplitKind::Disc),
            "disk" => Some(SplitKind::Disk),
            "dvd" => Some(SplitKind::Dvd),
            "part" => Some(SplitKind::Part),
            "pt" => Some(SplitKind::Pt),
            _ => None,
        }
    }
}

/// One segment of a logically single item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPart {
    pub kind: SplitKind,
    pub index: u32,
    /// Marker exactly as written in the source name, e.g. "CD1" or "pt2"
    pub label: String,
}

impl MediaCandidate {
    /// Trailing 4-digit year among the title tokens, never the only token
    pub fn year_hint(&self) -> Option<i32> {
        if self.title_tokens.len() < 2 {
            return None;
        }
        self.title_tokens.last().and_then(|t| parse_year(t))
    }

    /// Title text for provider searches, without the year hint
    pub fn query_title(&self) -> String {
        let end = if self.year_hint().is_some() {
            self.title_tokens.len() - 1
        } else {
            self.title_tokens.len()
        };
        self.title_tokens[..end].join(" ")
    }

    pub fn episode_key(&self) -> Option<&EpisodeKey> {
        match &self.kind {
            CandidateKind::Episode(key) => Some(key),
            CandidateKind::Movie => None,
        }
    }

    pub fn is_episode(&self) -> bool {
        matches!(self.kind, CandidateKind::Episode(_))
    }
}

impl EpisodeKey {
    /// Episode numbers covered by a season-based key, in order
    pub fn episode_numbers(&self) -> Vec<u32> {
        match *self {
            EpisodeKey::Season { episode_start, episode_end, .. } => {
                (episode_start..=episode_end.unwrap_or(episode_start)).collect()
            }
            EpisodeKey::AirDate(_) => Vec::new(),
        }
    }
}

/// Parse a plausible release year token
pub fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = token.parse().ok()?;
    (1900..=2099).contains(&year).then_some(year)
}

/// Release year of a movie or airing span of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum YearSpan {
    Unknown,
    Single(i32),
    /// `end` is `None` while a series is still running
    Range { start: i32, end: Option<i32> },
}

impl YearSpan {
    pub fn start(&self) -> Option<i32> {
        match *self {
            YearSpan::Unknown => None,
            YearSpan::Single(y) => Some(y),
            YearSpan::Range { start, .. } => Some(start),
        }
    }
}

impl fmt::Display for YearSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            YearSpan::Unknown => Ok(()),
            YearSpan::Single(y) => write!(f, "{}", y),
            YearSpan::Range { start, end: Some(end) } if end == start => write!(f, "{}", start),
            YearSpan::Range { start, end: Some(end) } => write!(f, "{}-{}", start, end),
            YearSpan::Range { start, end: None } => write!(f, "{}-", start),
        }
    }
}

/// Canonical external identity chosen for a candidate. Only ever built from
/// a successful provider lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub provider: String,
    pub external_id: String,
    pub canonical_title: String,
    pub years: YearSpan,
    /// Present for episodes only
    pub episode: Option<ResolvedEpisode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEpisode {
    /// Season the provider files the episode under, when known
    pub season: Option<u32>,
    /// Title for each episode in the candidate's range, in order
    pub titles: Vec<EpisodeTitle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeTitle {
    pub number: u32,
    pub title: String,
}

/// Computed transformation for one queued file, consumed immediately by the stager
#[derive(Debug, Clone)]
pub struct StagingPlan {
    pub source: PathBuf,
    pub candidate: Option<MediaCandidate>,
    pub identity: Option<ResolvedIdentity>,
    pub target: PlanTarget,
}

#[derive(Debug, Clone)]
pub enum PlanTarget {
    /// Absolute destination under Staged
    Stage(PathBuf),
    Quarantine(ItemError),
}

impl StagingPlan {
    pub fn failed(source: PathBuf, candidate: Option<MediaCandidate>, error: ItemError) -> Self {
        Self {
            source,
            candidate,
            identity: None,
            target: PlanTarget::Quarantine(error),
        }
    }
}
