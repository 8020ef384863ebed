use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use chrono::NaiveDate;
use log::debug;
use regex::Regex;
use crate::layout::{Category, QUEUE_DIR, STAGED_DIR};
use crate::model::{parse_year, CandidateKind, EpisodeKey, MediaCandidate, SplitKind, SplitPart};

/// `YYYY-MM-DD`, `YYYY.MM.DD`, `YYYY MM DD`
static DATE_YMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])(?P<date>(?P<y>\d{4})(?P<s1>[-. ])(?P<m>\d{2})(?P<s2>[-. ])(?P<d>\d{2}))(?:[^0-9]|$)")
        .expect("valid regex")
});

/// `DD-MM-YYYY`, `DD.MM.YYYY`, `DD MM YYYY`
static DATE_DMY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])(?P<date>(?P<d>\d{2})(?P<s1>[-. ])(?P<m>\d{2})(?P<s2>[-. ])(?P<y>\d{4}))(?:[^0-9]|$)")
        .expect("valid regex")
});

static SEASON_EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])(?P<tok>s(?P<s>\d{1,3})[ ._]?e(?P<e>\d{1,3}))(?:[^0-9]|$)")
        .expect("valid regex")
});

/// Range continuation directly after a season/episode token: `-e19`, `e19`, `-19`
static EPISODE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:-?e|-)(?P<e>\d{1,3})(?:[^a-z0-9]|$)").expect("valid regex")
});

static SPLIT_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<kind>cd|disc|disk|dvd|part|pt)(?P<idx>\d{1,2})$").expect("valid regex")
});

static SEASON_FOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:season|series)[ ._-]*\d+|s\d{1,2}|specials?)$").expect("valid regex")
});

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\{[^}]*\}").expect("valid regex"));

/// Multi-part release tags folded into a single token before splitting
static FOLD_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(h)\.(26[45])\b|\b(web)[-. ]?(dl|rip)\b").expect("valid regex"));

/// Release/quality tags that end a movie title
const NOISE_TOKENS: &[&str] = &[
    "480p", "576p", "720p", "1080p", "1080i", "2160p", "4k", "uhd", "hdr", "hdr10", "10bit",
    "x264", "x265", "h264", "h265", "hevc", "avc", "xvid", "divx",
    "bluray", "bdrip", "brrip", "dvdrip", "hdtv", "webdl", "webrip", "remux",
    "aac", "ac3", "dts", "truehd", "atmos",
];

/// Outcome of classifying a path. Total: every path maps to one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Candidate(MediaCandidate),
    Unknown { path: PathBuf, reason: String },
}

impl Classification {
    pub fn candidate(&self) -> Option<&MediaCandidate> {
        match self {
            Classification::Candidate(c) => Some(c),
            Classification::Unknown { .. } => None,
        }
    }
}

/// Where a recognised episode marker sits inside a stem
struct Marker {
    key: EpisodeKey,
    start: usize,
    end: usize,
}

/// Filename classifier. Pure: the result depends only on the path string and
/// the extension allow-list.
#[derive(Debug, Clone)]
pub struct FilenameClassifier {
    extensions: Vec<String>,
}

impl FilenameClassifier {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.as_ref().to_ascii_lowercase()).collect(),
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|a| a.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Classify a path. Matchers run in fixed precedence: date, then
    /// season/episode, then split-part on the tail, then movie fallback.
    pub fn classify(&self, path: &Path) -> Classification {
        let unknown = |reason: &str| Classification::Unknown {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return unknown("file has no extension");
        };
        if !self.accepts(path) {
            return unknown(&format!("extension .{} is not an accepted video container", ext));
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return unknown("file name is not valid UTF-8");
        };

        let (kind, mut title_tokens, split_part, episode_title) = match find_marker(stem) {
            Some(marker) => {
                let head = &stem[..marker.start];
                let tail = tokenize(&stem[marker.end..]);
                let split_part = find_split_part(&tail);
                let episode_title = title_after_marker(&tail);
                (CandidateKind::Episode(marker.key), title_before_marker(head), split_part, episode_title)
            }
            None => {
                let tokens = tokenize(stem);
                let split_part = find_split_part(tokens.get(1..).unwrap_or(&[]));
                (CandidateKind::Movie, movie_title_tokens(&tokens), split_part, None)
            }
        };

        if title_tokens.is_empty() && matches!(kind, CandidateKind::Episode(_)) {
            title_tokens = title_from_folders(path);
        }
        if title_tokens.is_empty() {
            return unknown("no title could be extracted");
        }

        debug!("Classified {} as {:?} with title {:?}", path.display(), kind, title_tokens);

        Classification::Candidate(MediaCandidate {
            source_path: path.to_path_buf(),
            kind,
            title_tokens,
            split_part,
            episode_title,
            raw_extension: ext.to_string(),
        })
    }
}

/// Leftmost valid date across both date notations, else the first season/episode token
fn find_marker(stem: &str) -> Option<Marker> {
    find_date(stem).or_else(|| find_season_episode(stem))
}

fn find_date(stem: &str) -> Option<Marker> {
    let mut best: Option<Marker> = None;

    for pattern in [&*DATE_YMD, &*DATE_DMY] {
        // Boundary characters are consumed, so step one byte past each rejected match
        let mut from = 0;
        while let Some(caps) = pattern.captures_at(stem, from) {
            let Some(whole) = caps.name("date") else {
                break;
            };
            from = whole.start() + 1;

            if caps["s1"] != caps["s2"] {
                continue;
            }
            let (Ok(y), Ok(m), Ok(d)) = (
                caps["y"].parse::<i32>(),
                caps["m"].parse::<u32>(),
                caps["d"].parse::<u32>(),
            ) else {
                continue;
            };
            let Some(date) = NaiveDate::from_ymd_opt(y, m, d) else {
                continue;
            };

            if best.as_ref().map_or(true, |b| whole.start() < b.start) {
                best = Some(Marker {
                    key: EpisodeKey::AirDate(date),
                    start: whole.start(),
                    end: whole.end(),
                });
            }
            break;
        }
    }

    best
}

fn find_season_episode(stem: &str) -> Option<Marker> {
    let caps = SEASON_EPISODE.captures(stem)?;
    let tok = caps.name("tok")?;
    let season: u32 = caps["s"].parse().ok()?;
    let episode_start: u32 = caps["e"].parse().ok()?;

    let mut end = tok.end();
    let mut episode_end = None;
    if let Some(range) = EPISODE_RANGE.captures(&stem[end..]) {
        if let Ok(e) = range["e"].parse::<u32>() {
            if e > episode_start {
                episode_end = Some(e);
                end += range.name("e").map(|m| m.end()).unwrap_or(0);
            }
        }
    }

    Some(Marker {
        key: EpisodeKey::Season { season, episode_start, episode_end },
        start: tok.start(),
        end,
    })
}

/// Split a name into words, dropping bracketed tags and separators
fn tokenize(text: &str) -> Vec<String> {
    let text = BRACKETED.replace_all(text, " ");
    let text = FOLD_TAGS.replace_all(&text, "$1$2$3$4");
    text.split(|c: char| c.is_whitespace() || "._-()+,~_\u{2013}\u{2014}".contains(c))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn is_noise(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    NOISE_TOKENS.contains(&lower.as_str())
}

fn find_split_part(tokens: &[String]) -> Option<SplitPart> {
    tokens.iter().find_map(|t| {
        let caps = SPLIT_PART.captures(t)?;
        Some(SplitPart {
            kind: SplitKind::parse(&caps["kind"])?,
            index: caps["idx"].parse().ok()?,
            label: t.clone(),
        })
    })
}

fn title_before_marker(head: &str) -> Vec<String> {
    tokenize(head).into_iter().filter(|t| !is_noise(t)).collect()
}

/// Episode name written after the marker, up to the first release tag
fn title_after_marker(tail: &[String]) -> Option<String> {
    let words: Vec<&str> = tail
        .iter()
        .take_while(|t| !is_noise(t) && !SPLIT_PART.is_match(t))
        .map(|t| t.as_str())
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

/// Title ends at the first release tag or split marker; a year before that
/// point closes the title and is kept as its last token
fn movie_title_tokens(tokens: &[String]) -> Vec<String> {
    let cut = tokens
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, t)| is_noise(t) || SPLIT_PART.is_match(t))
        .map(|(i, _)| i)
        .unwrap_or(tokens.len());

    let head = &tokens[..cut];
    let year_idx = head
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .find(|(_, t)| parse_year(t).is_some())
        .map(|(i, _)| i);

    match year_idx {
        Some(i) => head[..=i].to_vec(),
        None => head.to_vec(),
    }
}

/// Show title from the nearest ancestor folder that is neither a season
/// folder nor part of the fixed layout
fn title_from_folders(path: &Path) -> Vec<String> {
    for dir in path.ancestors().skip(1) {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            break;
        };
        if name == QUEUE_DIR || name == STAGED_DIR || Category::from_folder_name(name).is_some() {
            break;
        }
        if SEASON_FOLDER.is_match(name.trim()) {
            continue;
        }
        let head = match find_marker(name) {
            Some(marker) => &name[..marker.start],
            None => name,
        };
        // Release folders like "Show.S02.1080p" carry a bare season token
        let tokens: Vec<String> = tokenize(head)
            .into_iter()
            .take_while(|t| !is_noise(t) && !SEASON_FOLDER.is_match(t))
            .collect();
        if !tokens.is_empty() {
            return tokens;
        }
    }
    Vec::new()
}
