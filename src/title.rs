//! Titles and their stable keys
//!
//! The key is what overrides and cached lookups are filed under, so it must
//! come out the same every time the same content plays:
//!
//! - `movie/tt0133093` when the host knows the IMDb id
//! - `tvshow/42` for an episode of a library TV show
//! - `title/the-matrix-1999` otherwise (slug of name and year)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a title
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TitleKey(String);

impl TitleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept a key typed by the user; bare IMDb ids become movie keys
    pub fn from_user(text: &str) -> Self {
        let text = text.trim();
        if let Some(id) = normalize_imdb_id(text) {
            return TitleKey(format!("movie/{}", id));
        }
        TitleKey(text.to_string())
    }
}

impl fmt::Display for TitleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleKind {
    Movie,
    TvShow,
}

/// The content currently playing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub key: TitleKey,
    pub name: String,
    pub year: Option<u16>,
    /// Normalized `tt` id
    pub imdb_id: Option<String>,
    pub tvshow_id: Option<u32>,
}

impl Title {
    pub fn new(
        name: &str,
        year: Option<u16>,
        imdb_id: Option<&str>,
        tvshow_id: Option<u32>,
    ) -> Self {
        let imdb_id = imdb_id.and_then(normalize_imdb_id);
        let tvshow_id = tvshow_id.filter(|id| *id > 0);

        let key = if let Some(ref id) = imdb_id {
            format!("movie/{}", id)
        } else if let Some(id) = tvshow_id {
            format!("tvshow/{}", id)
        } else {
            match year {
                Some(year) => format!("title/{}-{}", slug(name), year),
                None => format!("title/{}", slug(name)),
            }
        };

        Self {
            key: TitleKey(key),
            name: name.trim().to_string(),
            year,
            imdb_id,
            tvshow_id,
        }
    }

    /// Title known only by name
    pub fn named(name: &str) -> Self {
        Self::new(name, None, None, None)
    }

    pub fn kind(&self) -> TitleKind {
        if self.imdb_id.is_none() && self.tvshow_id.is_some() {
            TitleKind::TvShow
        } else {
            TitleKind::Movie
        }
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} ({})", self.name, year),
            None => write!(f, "{}", self.name),
        }
    }
}

/// `tt0133093`, `0133093` and `133093` all become `tt0133093`
pub fn normalize_imdb_id(text: &str) -> Option<String> {
    let digits = text.trim().trim_start_matches("tt");
    if digits.is_empty() || digits.len() > 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(format!("tt{:07}", n))
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
