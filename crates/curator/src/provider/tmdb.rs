use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use log::debug;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use crate::config::ProviderConfig;
use crate::model::YearSpan;
use super::{
    EpisodeListing, MetadataProvider, ProviderCandidate, ProviderEpisode, ProviderError,
    SearchKind, SearchQuery,
};

const USER_AGENT: &str = concat!("curator/", env!("CARGO_PKG_VERSION"));

/// The Movie Database (api.themoviedb.org/3) client
pub struct TmdbProvider {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    language: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: u64,
    /// Movies
    title: Option<String>,
    original_title: Option<String>,
    release_date: Option<String>,
    /// Series
    name: Option<String>,
    original_name: Option<String>,
    first_air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesDetails {
    name: String,
    first_air_date: Option<String>,
    last_air_date: Option<String>,
    status: Option<String>,
    #[serde(default)]
    seasons: Vec<SeasonSummary>,
}

#[derive(Debug, Deserialize)]
struct SeasonSummary {
    season_number: u32,
}

#[derive(Debug, Deserialize)]
struct SeasonDetails {
    #[serde(default)]
    episodes: Vec<EpisodeDetails>,
}

#[derive(Debug, Deserialize)]
struct EpisodeDetails {
    season_number: u32,
    episode_number: u32,
    #[serde(default)]
    name: String,
    air_date: Option<String>,
}

impl TmdbProvider {
    pub fn new(api_key: impl Into<String>, cfg: &ProviderConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(cfg.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            api_key: api_key.into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            language: cfg.language.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("TMDb request: {} {:?}", url, params);

        let response = self
            .http_client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str()), ("language", self.language.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{} returned HTTP {}", endpoint, status.as_u16());
            return Err(classify_status(status, message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid JSON from {}: {}", endpoint, e)))
    }
}

fn classify_status(status: StatusCode, message: String) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.filter(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn to_candidate(result: SearchResult, kind: SearchKind) -> Option<ProviderCandidate> {
    let (title, original, date) = match kind {
        SearchKind::Movie => (result.title, result.original_title, result.release_date),
        SearchKind::Series => (result.name, result.original_name, result.first_air_date),
    };
    let title = title?;
    let original_title = original.filter(|o| *o != title);
    Some(ProviderCandidate {
        id: result.id.to_string(),
        title,
        original_title,
        year: parse_date(date.as_deref()).map(|d| d.year()),
    })
}

/// Airing span: open-ended while the series is still running
fn series_years(details: &SeriesDetails) -> YearSpan {
    let Some(start) = parse_date(details.first_air_date.as_deref()).map(|d| d.year()) else {
        return YearSpan::Unknown;
    };
    let ended = matches!(details.status.as_deref(), Some("Ended") | Some("Canceled"));
    let end = if ended {
        parse_date(details.last_air_date.as_deref()).map(|d| d.year())
    } else {
        None
    };
    YearSpan::Range { start, end }
}

#[async_trait]
impl MetadataProvider for TmdbProvider {
    fn name(&self) -> &str {
        "tmdb"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ProviderCandidate>, ProviderError> {
        let endpoint = match query.kind {
            SearchKind::Movie => "search/movie",
            SearchKind::Series => "search/tv",
        };
        let page: SearchPage = self
            .get_json(endpoint, &[("query", query.title.clone())])
            .await?;

        let candidates: Vec<ProviderCandidate> = page
            .results
            .into_iter()
            .filter_map(|r| to_candidate(r, query.kind))
            .collect();
        debug!("TMDb search '{}' returned {} results", query.title, candidates.len());
        Ok(candidates)
    }

    async fn fetch_episodes(&self, series_id: &str) -> Result<EpisodeListing, ProviderError> {
        let details: SeriesDetails = self.get_json(&format!("tv/{}", series_id), &[]).await?;

        let mut episodes = Vec::new();
        for season in &details.seasons {
            let endpoint = format!("tv/{}/season/{}", series_id, season.season_number);
            let season_details: SeasonDetails = self.get_json(&endpoint, &[]).await?;
            episodes.extend(season_details.episodes.into_iter().map(|e| ProviderEpisode {
                season: e.season_number,
                episode: e.episode_number,
                air_date: parse_date(e.air_date.as_deref()),
                title: e.name,
            }));
        }

        debug!("TMDb series {} has {} episodes", series_id, episodes.len());
        Ok(EpisodeListing {
            years: series_years(&details),
            title: details.name,
            episodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_result_mapping() {
        let page: SearchPage = serde_json::from_str(
            r#"{"page":1,"results":[
                {"id":19995,"title":"Avatar","original_title":"Avatar","release_date":"2009-12-15"},
                {"id":1,"title":"Untitled","release_date":""},
                {"id":2,"name":"Only A Series"}
            ]}"#,
        )
        .unwrap();
        let movies: Vec<_> = page
            .results
            .into_iter()
            .filter_map(|r| to_candidate(r, SearchKind::Movie))
            .collect();

        assert_eq!(movies.len(), 2);
        assert_eq!(movies[0].id, "19995");
        assert_eq!(movies[0].year, Some(2009));
        assert_eq!(movies[0].original_title, None);
        assert_eq!(movies[1].year, None);
    }

    #[test]
    fn test_series_years() {
        let ended: SeriesDetails = serde_json::from_str(
            r#"{"name":"Doctor Who","first_air_date":"1963-11-23","last_air_date":"1989-12-06","status":"Ended","seasons":[]}"#,
        )
        .unwrap();
        assert_eq!(series_years(&ended).to_string(), "1963-1989");

        let running: SeriesDetails = serde_json::from_str(
            r#"{"name":"Sunny","first_air_date":"2005-08-04","last_air_date":"2024-07-01","status":"Returning Series"}"#,
        )
        .unwrap();
        assert_eq!(series_years(&running).to_string(), "2005-");

        let unknown: SeriesDetails = serde_json::from_str(r#"{"name":"X"}"#).unwrap();
        assert_eq!(series_years(&unknown), YearSpan::Unknown);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, String::new()).is_transient());
    }
}
