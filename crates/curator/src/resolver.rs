use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use crate::config::{ProviderConfig, ResolverConfig};
use crate::error::ItemError;
use crate::model::{
    EpisodeKey, EpisodeTitle, MediaCandidate, ResolvedEpisode, ResolvedIdentity, YearSpan,
};
use crate::provider::{
    EpisodeListing, MetadataProvider, ProviderCandidate, ProviderError, SearchKind, SearchQuery,
};

/// Weight of title similarity when a year hint is available
const TITLE_WEIGHT: f64 = 0.75;
const YEAR_WEIGHT: f64 = 0.25;

/// Outcome of resolving one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedIdentity),
    NotFound(String),
    Ambiguous(String),
}

impl Resolution {
    pub fn into_result(self) -> Result<ResolvedIdentity, ItemError> {
        match self {
            Resolution::Resolved(identity) => Ok(identity),
            Resolution::NotFound(reason) => Err(ItemError::ResolutionNotFound(reason)),
            Resolution::Ambiguous(reason) => Err(ItemError::ResolutionAmbiguous(reason)),
        }
    }
}

/// Bounded exponential backoff for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!("{} failed (attempt {}/{}): {}; retrying in {:?}",
                          what, attempt, self.max_attempts, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Lowercase alphanumeric words, everything else a single space
fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .replace('&', " and ")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn title_similarity(query: &str, title: &str) -> f64 {
    let (q, t) = (normalize_title(query), normalize_title(title));
    if q.is_empty() || t.is_empty() {
        return 0.0;
    }
    if q == t {
        return 1.0;
    }
    strsim::normalized_levenshtein(&q, &t)
}

fn year_proximity(hint: i32, year: Option<i32>) -> f64 {
    match year.map(|y| (y - hint).abs()) {
        Some(0) => 1.0,
        Some(1) => 0.6,
        _ => 0.0,
    }
}

/// Score in 0.0..=1.0; the year only contributes when the filename carried one
pub fn score_candidate(query: &str, year_hint: Option<i32>, candidate: &ProviderCandidate) -> f64 {
    let title = candidate
        .original_title
        .iter()
        .map(|o| title_similarity(query, o))
        .fold(title_similarity(query, &candidate.title), f64::max);

    match year_hint {
        Some(hint) => TITLE_WEIGHT * title + YEAR_WEIGHT * year_proximity(hint, candidate.year),
        None => title,
    }
}

/// Maps classified candidates to one canonical identity through a provider
pub struct MetadataResolver {
    provider: Arc<dyn MetadataProvider>,
    thresholds: ResolverConfig,
    retry: RetryPolicy,
}

impl MetadataResolver {
    pub fn new(provider: Arc<dyn MetadataProvider>, thresholds: ResolverConfig, retry: RetryPolicy) -> Self {
        Self { provider, thresholds, retry }
    }

    pub async fn resolve(&self, candidate: &MediaCandidate) -> Resolution {
        let result = match candidate.episode_key() {
            None => self.resolve_movie(candidate).await,
            Some(key) => self.resolve_episode(candidate, *key).await,
        };
        match result {
            Ok(resolution) => resolution,
            Err(e) => Resolution::NotFound(format!("metadata provider unavailable: {}", e)),
        }
    }

    async fn resolve_movie(&self, candidate: &MediaCandidate) -> Result<Resolution, ProviderError> {
        let best = match self.search_best(candidate, SearchKind::Movie).await? {
            Ok(best) => best,
            Err(unresolved) => return Ok(unresolved),
        };

        info!("Resolved movie '{}' to {} ({})", candidate.query_title(), best.title, best.id);
        Ok(Resolution::Resolved(ResolvedIdentity {
            provider: self.provider.name().to_string(),
            external_id: best.id,
            canonical_title: best.title,
            years: best.year.map(YearSpan::Single).unwrap_or(YearSpan::Unknown),
            episode: None,
        }))
    }

    async fn resolve_episode(
        &self,
        candidate: &MediaCandidate,
        key: EpisodeKey,
    ) -> Result<Resolution, ProviderError> {
        let show = match self.search_best(candidate, SearchKind::Series).await? {
            Ok(show) => show,
            Err(unresolved) => return Ok(unresolved),
        };

        let provider = Arc::clone(&self.provider);
        let id = show.id.clone();
        let listing = self
            .retry
            .run(&format!("episode listing for {}", show.id), || {
                let provider = Arc::clone(&provider);
                let id = id.clone();
                async move { provider.fetch_episodes(&id).await }
            })
            .await?;

        let episode = match match_episodes(&listing, key) {
            Ok(episode) => episode,
            Err(reason) => {
                return Ok(Resolution::NotFound(format!("{} ({}): {}", listing.title, show.id, reason)));
            }
        };

        info!("Resolved episode of '{}' to {} ({})", candidate.query_title(), listing.title, show.id);
        Ok(Resolution::Resolved(ResolvedIdentity {
            provider: self.provider.name().to_string(),
            external_id: show.id,
            canonical_title: listing.title,
            years: listing.years,
            episode: Some(episode),
        }))
    }

    /// Search and pick one result. The inner `Err` carries a NotFound or
    /// Ambiguous outcome; the outer one is a provider failure.
    async fn search_best(
        &self,
        candidate: &MediaCandidate,
        kind: SearchKind,
    ) -> Result<Result<ProviderCandidate, Resolution>, ProviderError> {
        let query = SearchQuery {
            kind,
            title: candidate.query_title(),
            year: candidate.year_hint(),
        };
        let provider = Arc::clone(&self.provider);
        let results = self
            .retry
            .run(&format!("search for '{}'", query.title), || {
                let provider = Arc::clone(&provider);
                let query = query.clone();
                async move { provider.search(&query).await }
            })
            .await?;

        Ok(self.pick(&query, results))
    }

    fn pick(&self, query: &SearchQuery, results: Vec<ProviderCandidate>) -> Result<ProviderCandidate, Resolution> {
        let mut scored: Vec<(f64, ProviderCandidate)> = Vec::new();
        for result in results {
            if scored.iter().any(|(_, c)| c.id == result.id) {
                continue;
            }
            scored.push((score_candidate(&query.title, query.year, &result), result));
        }
        // Stable: equal scores keep provider order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        for (score, c) in scored.iter().take(3) {
            debug!("  {:.3} {} ({:?}) id={}", score, c.title, c.year, c.id);
        }

        let mut ranked = scored.into_iter();
        let Some((best_score, best)) = ranked.next() else {
            return Err(Resolution::NotFound(format!("no results for '{}'", query.title)));
        };
        if best_score < self.thresholds.min_confidence {
            return Err(Resolution::NotFound(format!(
                "best match for '{}' was '{}' with score {:.2}, below {:.2}",
                query.title, best.title, best_score, self.thresholds.min_confidence
            )));
        }
        if let Some((runner_score, runner)) = ranked.next() {
            if best_score - runner_score < self.thresholds.tie_margin {
                return Err(Resolution::Ambiguous(format!(
                    "'{}' matches '{}' ({}, {:.2}) and '{}' ({}, {:.2}) within {:.2}",
                    query.title,
                    best.title,
                    best.id,
                    best_score,
                    runner.title,
                    runner.id,
                    runner_score,
                    self.thresholds.tie_margin
                )));
            }
        }
        Ok(best)
    }
}

/// Validate a season/episode or air-date key against the listing
fn match_episodes(listing: &EpisodeListing, key: EpisodeKey) -> Result<ResolvedEpisode, String> {
    match key {
        EpisodeKey::Season { season, .. } => {
            let mut titles = Vec::new();
            for number in key.episode_numbers() {
                let ep = listing
                    .find(season, number)
                    .ok_or_else(|| format!("no episode s{:02}e{:02} in listing", season, number))?;
                titles.push(EpisodeTitle { number, title: ep.title.clone() });
            }
            Ok(ResolvedEpisode { season: Some(season), titles })
        }
        EpisodeKey::AirDate(date) => {
            let hits = listing.aired_on(date);
            let ep = hits
                .first()
                .ok_or_else(|| format!("no episode aired on {}", date))?;
            if hits.len() > 1 {
                debug!("{} episodes aired on {}, using s{:02}e{:02}", hits.len(), date, ep.season, ep.episode);
            }
            Ok(ResolvedEpisode {
                season: Some(ep.season),
                titles: vec![EpisodeTitle { number: ep.episode, title: ep.title.clone() }],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FilenameClassifier;
    use crate::testing::{listing, movie_hit, series_hit, StubProvider};
    use proptest::prelude::*;
    use std::path::Path;

    fn candidate(path: &str) -> MediaCandidate {
        FilenameClassifier::new(&["mkv"])
            .classify(Path::new(path))
            .candidate()
            .cloned()
            .unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn resolver(stub: StubProvider) -> MetadataResolver {
        MetadataResolver::new(Arc::new(stub), ResolverConfig::default(), fast_retry())
    }

    #[tokio::test]
    async fn test_movie_with_year_hint() {
        let stub = StubProvider::new()
            .with_search("Avatar", vec![movie_hit("19995", "Avatar", Some(2009)), movie_hit("76600", "Avatar: The Way of Water", Some(2022))]);
        let resolution = resolver(stub).resolve(&candidate("/q/Avatar.2009.mkv")).await;

        let Resolution::Resolved(identity) = resolution else {
            panic!("expected resolved, got {:?}", resolution);
        };
        assert_eq!(identity.external_id, "19995");
        assert_eq!(identity.years, YearSpan::Single(2009));
        assert_eq!(identity.provider, "provider");
    }

    #[tokio::test]
    async fn test_year_hint_breaks_title_tie() {
        let stub = StubProvider::new().with_search(
            "The Thing",
            vec![movie_hit("1091", "The Thing", Some(1982)), movie_hit("60935", "The Thing", Some(2011))],
        );
        let r = resolver(stub.clone());
        let resolution = r.resolve(&candidate("/q/The.Thing.1982.mkv")).await;
        assert!(matches!(resolution, Resolution::Resolved(ref i) if i.external_id == "1091"));

        let resolution = r.resolve(&candidate("/q/The.Thing.mkv")).await;
        assert!(matches!(resolution, Resolution::Ambiguous(_)), "{:?}", resolution);
    }

    #[tokio::test]
    async fn test_low_confidence_is_not_found() {
        let stub = StubProvider::new().with_search("Zzyzx", vec![movie_hit("1", "Completely Different", None)]);
        let resolution = resolver(stub).resolve(&candidate("/q/Zzyzx.mkv")).await;
        assert!(matches!(resolution, Resolution::NotFound(_)));

        let resolution = resolver(StubProvider::new()).resolve(&candidate("/q/Nothing.mkv")).await;
        assert!(matches!(resolution, Resolution::NotFound(_)));
    }

    #[tokio::test]
    async fn test_episode_resolution_and_validation() {
        let stub = StubProvider::new()
            .with_search("Doctor Who", vec![series_hit("123", "Doctor Who", Some(1963))])
            .with_listing("123", listing("Doctor Who", YearSpan::Range { start: 1963, end: Some(1989) }, &[
                (1, 1, "An Unearthly Child", None),
                (1, 2, "The Cave of Skulls", None),
            ]));
        let r = resolver(stub);

        let Resolution::Resolved(identity) = r.resolve(&candidate("/q/Doctor Who - s01e01e02.mkv")).await else {
            panic!("expected resolved");
        };
        let episode = identity.episode.unwrap();
        assert_eq!(episode.season, Some(1));
        let titles: Vec<_> = episode.titles.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["An Unearthly Child", "The Cave of Skulls"]);

        let resolution = r.resolve(&candidate("/q/Doctor Who - s01e09.mkv")).await;
        assert!(matches!(resolution, Resolution::NotFound(ref m) if m.contains("s01e09")));
    }

    #[tokio::test]
    async fn test_air_date_resolves_season() {
        let stub = StubProvider::new()
            .with_search("The Daily Show", vec![series_hit("2224", "The Daily Show", Some(1996))])
            .with_listing("2224", listing("The Daily Show", YearSpan::Range { start: 1996, end: None }, &[
                (29, 70, "Guest A", Some((2024, 3, 14))),
                (29, 71, "Guest B", Some((2024, 3, 15))),
            ]));
        let resolution = resolver(stub)
            .resolve(&candidate("/q/The Daily Show 15.03.2024.mkv"))
            .await;

        let Resolution::Resolved(identity) = resolution else {
            panic!("expected resolved, got {:?}", resolution);
        };
        let episode = identity.episode.unwrap();
        assert_eq!(episode.season, Some(29));
        assert_eq!(episode.titles, vec![EpisodeTitle { number: 71, title: "Guest B".into() }]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let stub = StubProvider::new()
            .with_search("Heat", vec![movie_hit("949", "Heat", Some(1995))])
            .failing_transiently(2);
        let resolution = resolver(stub.clone()).resolve(&candidate("/q/Heat.1995.mkv")).await;
        assert!(matches!(resolution, Resolution::Resolved(_)));
        assert_eq!(stub.search_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_not_found() {
        let stub = StubProvider::new()
            .with_search("Heat", vec![movie_hit("949", "Heat", Some(1995))])
            .failing_transiently(10);
        let resolution = resolver(stub.clone()).resolve(&candidate("/q/Heat.1995.mkv")).await;
        assert!(matches!(resolution, Resolution::NotFound(ref m) if m.contains("unavailable")));
        assert_eq!(stub.search_calls(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_title_similarity() {
        assert_eq!(title_similarity("Doctor Who", "Doctor Who"), 1.0);
        assert_eq!(title_similarity("doctor who", "Doctor Who!"), 1.0);
        assert_eq!(title_similarity("Law & Order", "Law and Order"), 1.0);
        assert!(title_similarity("Doctor Who", "Doctor Foster") < 0.8);
        assert_eq!(title_similarity("", "Anything"), 0.0);
    }

    proptest! {
        #[test]
        fn prop_score_is_bounded(
            query in "[a-zA-Z ]{0,20}",
            title in "[a-zA-Z ]{0,20}",
            hint in proptest::option::of(1900i32..2100),
            year in proptest::option::of(1900i32..2100),
        ) {
            let c = ProviderCandidate { id: "1".into(), title, original_title: None, year };
            let score = score_candidate(&query, hint, &c);
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
