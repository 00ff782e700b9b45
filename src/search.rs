//! Ranked fuzzy matching of credential titles and paths.
//!
//! Scoring degrades in tiers so the common cases stay predictable:
//!
//! | tier        | rule                                              | score                  |
//! |-------------|---------------------------------------------------|------------------------|
//! | exact       | case-insensitive equality                         | 100                    |
//! | contains    | substring, or abbreviation of one word segment    | 70                     |
//! | initialism  | query letters are initials of successive segments | 60 × matched/segments  |
//! | fuzzy       | Levenshtein distance `d`                          | 60 × (1 − d/len(query))|
//!
//! Word segments split on `_ - / .`, whitespace and lower→upper case changes.
//! Anything scoring under [`MIN_SCORE`] is dropped.

use std::cmp;

use serde::{Deserialize, Serialize};

pub const SCORE_EXACT: u32 = 100;
pub const SCORE_CONTAINS: u32 = 70;
pub const SCORE_STRUCTURAL: u32 = 60;
pub const MIN_SCORE: u32 = 30;

/// Shortest query treated as a segment abbreviation.
const MIN_ABBREVIATION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchKind {
    Exact,
    Contains,
    Initialism,
    Fuzzy,
}

/// Which part of the entry produced the best score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchField {
    Title,
    Path,
}

/// Score of one query against one string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub kind: MatchKind,
    pub score: u32,
    /// Edit distance for fuzzy matches, zero otherwise.
    pub distance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    pub title: String,
    /// Group part of the path (everything before the last `/`).
    pub context: String,
    pub field: MatchField,
    pub kind: MatchKind,
    pub score: u32,
    pub distance: usize,
}

/// Split into lowercase word segments.
pub fn segments(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in s.chars() {
        if matches!(ch, '_' | '-' | '/' | '.') || ch.is_whitespace() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    if a.is_empty() {
        return b.chars().count();
    }
    if b.is_empty() {
        return a.chars().count();
    }

    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0usize; b_chars.len() + 1];

    for (i, a_ch) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_ch) in b_chars.iter().enumerate() {
            let cost = if a_ch == b_ch { 0 } else { 1 };
            current[j + 1] = cmp::min(
                cmp::min(current[j] + 1, previous[j + 1] + 1),
                previous[j] + cost,
            );
        }
        previous.copy_from_slice(&current);
    }

    previous[b_chars.len()]
}

fn is_subsequence(needle: &[char], haystack: &str) -> bool {
    let mut wanted = needle.iter().peekable();
    for ch in haystack.chars() {
        if wanted.peek() == Some(&&ch) {
            wanted.next();
        }
    }
    wanted.peek().is_none()
}

/// `perplx` abbreviates `perplexity`: same first letter, letters in order,
/// covering at least half the segment.
fn abbreviates(query: &[char], segment: &str) -> bool {
    query.len() >= MIN_ABBREVIATION
        && segment.chars().next() == query.first().copied()
        && query.len() * 2 >= segment.chars().count()
        && is_subsequence(query, segment)
}

/// Matched initials as a share of all segments, or `None` unless every
/// query letter lines up with a distinct segment initial.
fn initialism_score(query: &[char], segments: &[String]) -> Option<u32> {
    if query.len() < 2 || segments.is_empty() {
        return None;
    }
    let mut next = 0;
    for segment in segments {
        if next < query.len() && segment.starts_with(query[next]) {
            next += 1;
        }
    }
    (next == query.len()).then(|| {
        let ratio = query.len() as f64 / segments.len() as f64;
        (f64::from(SCORE_STRUCTURAL) * ratio).round() as u32
    })
}

fn fuzzy_score(distance: usize, query_len: usize) -> u32 {
    let ratio = 1.0 - distance as f64 / query_len as f64;
    (f64::from(SCORE_STRUCTURAL) * ratio).max(0.0).round() as u32
}

/// Score `query` against `candidate`.
pub fn score(query: &str, candidate: &str) -> Match {
    let q = query.trim().to_lowercase();
    let c = candidate.to_lowercase();
    if q.is_empty() {
        return Match {
            kind: MatchKind::Fuzzy,
            score: 0,
            distance: c.chars().count(),
        };
    }
    if q == c {
        return Match {
            kind: MatchKind::Exact,
            score: SCORE_EXACT,
            distance: 0,
        };
    }

    let q_chars: Vec<char> = q.chars().collect();
    let parts = segments(candidate);
    if c.contains(&q) || parts.iter().any(|part| abbreviates(&q_chars, part)) {
        return Match {
            kind: MatchKind::Contains,
            score: SCORE_CONTAINS,
            distance: 0,
        };
    }

    let distance = parts
        .iter()
        .map(|part| levenshtein(&q, part))
        .fold(levenshtein(&q, &c), cmp::min);
    let fuzzy = Match {
        kind: MatchKind::Fuzzy,
        score: fuzzy_score(distance, q_chars.len()),
        distance,
    };
    match initialism_score(&q_chars, &parts) {
        Some(score) if score >= fuzzy.score => Match {
            kind: MatchKind::Initialism,
            score,
            distance: 0,
        },
        _ => fuzzy,
    }
}

fn better(a: &Match, b: &Match) -> bool {
    a.score > b.score || (a.score == b.score && a.distance < b.distance)
}

fn context_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(group, _)| group)
}

/// Score every `(path, title)` pair and return the hits, best first.
pub fn rank<'a, I>(query: &str, entries: I) -> Vec<SearchResult>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut results: Vec<SearchResult> = entries
        .into_iter()
        .filter_map(|(path, title)| {
            let by_title = score(query, title);
            let by_path = score(query, path);
            let (best, field) = if better(&by_path, &by_title) {
                (by_path, MatchField::Path)
            } else {
                (by_title, MatchField::Title)
            };
            (best.score >= MIN_SCORE).then(|| SearchResult {
                path: path.to_owned(),
                title: title.to_owned(),
                context: context_of(path).to_owned(),
                field,
                kind: best.kind,
                score: best.score,
                distance: best.distance,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.distance.cmp(&b.distance))
            .then_with(|| a.path.cmp(&b.path))
    });
    results
}
