use std::path::PathBuf;
use crate::layout::Category;
use crate::model::{EpisodeKey, MediaCandidate, ResolvedIdentity, YearSpan};

/// Stand-in for a path component that sanitises down to nothing
const EMPTY_COMPONENT: &str = "Unknown";

/// Characters that are not allowed in a path component on common filesystems
fn is_illegal(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Replace illegal characters with a space, collapse runs of spaces, trim
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw.chars().map(|c| if is_illegal(c) { ' ' } else { c }).collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        EMPTY_COMPONENT.to_string()
    } else {
        collapsed
    }
}

/// "Title (Year)", or just "Title" when no year is known
fn title_with_years(title: &str, years: &YearSpan) -> String {
    match years {
        YearSpan::Unknown => title.to_string(),
        years => format!("{} ({})", title, years),
    }
}

fn identity_folder(identity: &ResolvedIdentity) -> String {
    sanitize_component(&format!(
        "{} {{{}-{}}}",
        title_with_years(&identity.canonical_title, &identity.years),
        identity.provider,
        identity.external_id
    ))
}

/// Base name plus split marker and the original extension
fn file_name(base: &str, candidate: &MediaCandidate) -> String {
    let mut name = base.to_string();
    if let Some(part) = &candidate.split_part {
        name.push_str(" - ");
        name.push_str(&part.label);
    }
    format!("{}.{}", sanitize_component(&name), candidate.raw_extension)
}

fn episode_titles(identity: &ResolvedIdentity) -> String {
    let mut titles: Vec<&str> = Vec::new();
    if let Some(episode) = &identity.episode {
        for t in &episode.titles {
            let title = t.title.trim();
            if !title.is_empty() && titles.last() != Some(&title) {
                titles.push(title);
            }
        }
    }
    titles.join(" & ")
}

/// Canonical library path for a resolved item, relative to the phase folder
/// (Staged or Completed). Pure and deterministic.
pub fn format_destination(candidate: &MediaCandidate, identity: &ResolvedIdentity) -> PathBuf {
    let Some(key) = candidate.episode_key() else {
        let base = title_with_years(&identity.canonical_title, &identity.years);
        return PathBuf::from(Category::Movies.folder_name())
            .join(identity_folder(identity))
            .join(file_name(&base, candidate));
    };

    let show = &identity.canonical_title;
    let mut path = PathBuf::from(Category::TvShows.folder_name()).join(identity_folder(identity));

    let (season, marker) = match *key {
        EpisodeKey::Season { season, episode_start, episode_end } => {
            let mut marker = format!("s{:02}e{:02}", season, episode_start);
            if let Some(end) = episode_end {
                marker.push_str(&format!("-e{:02}", end));
            }
            (Some(season), marker)
        }
        EpisodeKey::AirDate(date) => (
            identity.episode.as_ref().and_then(|e| e.season),
            date.format("%Y-%m-%d").to_string(),
        ),
    };
    if let Some(season) = season {
        path.push(format!("Season {:02}", season));
    }

    let mut titles = episode_titles(identity);
    if titles.is_empty() {
        titles = candidate.episode_title.clone().unwrap_or_default();
    }
    let base = if titles.is_empty() {
        format!("{} - {}", show, marker)
    } else {
        format!("{} - {} - {}", show, marker, titles)
    };
    path.join(file_name(&base, candidate))
}
