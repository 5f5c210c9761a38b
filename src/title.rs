use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use anyhow::{anyhow, Result};

use crate::config::TitleSerieSeed;
use crate::constants::CHUNK_PATH_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    Sd,
    Hd,
    Fhd,
}

impl Quality {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "480" => Some(Quality::Sd),
            "720" => Some(Quality::Hd),
            "1080" => Some(Quality::Fhd),
            _ => None,
        }
    }

    pub fn from_lines(lines: u16) -> Option<Self> {
        match lines {
            480 => Some(Quality::Sd),
            720 => Some(Quality::Hd),
            1080 => Some(Quality::Fhd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Sd => "480",
            Quality::Hd => "720",
            Quality::Fhd => "1080",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Ts,
    M3u8,
}

impl Extension {
    pub fn as_str(self) -> &'static str {
        match self {
            Extension::Ts => "ts",
            Extension::M3u8 => "m3u8",
        }
    }
}

/// A parsed `/videos/media/ts/{title}/{episode}/{quality}/{file}` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRequest {
    pub title_id: u16,
    pub episode_id: u16,
    pub quality: Quality,
    /// Content hash, the file stem up to the first `_`.
    pub hash: String,
    /// Remainder of the stem after the hash, `_00028` or empty.
    pub suffix: String,
    pub extension: Extension,
}

impl TitleRequest {
    pub fn parse(uri: &str) -> Option<Self> {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let rest = path.strip_prefix(CHUNK_PATH_PREFIX)?;
        let mut parts = rest.split('/');
        let title_id = parts.next()?.parse::<u16>().ok()?;
        let episode_id = parts.next()?.parse::<u16>().ok()?;
        let quality = Quality::parse(parts.next()?)?;
        let filename = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let (stem, extension) = if let Some(stem) = filename.strip_suffix(".ts") {
            (stem, Extension::Ts)
        } else if let Some(stem) = filename.strip_suffix(".m3u8") {
            (stem, Extension::M3u8)
        } else {
            return None;
        };
        if stem.is_empty()
            || !stem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return None;
        }
        let (hash, suffix) = match stem.find('_') {
            Some(pos) => (&stem[..pos], &stem[pos..]),
            None => (stem, ""),
        };
        if hash.is_empty() {
            return None;
        }

        Some(Self {
            title_id,
            episode_id,
            quality,
            hash: hash.to_string(),
            suffix: suffix.to_string(),
            extension,
        })
    }

    pub fn filename(&self) -> String {
        format!("{}{}.{}", self.hash, self.suffix, self.extension.as_str())
    }

    pub fn path(&self) -> String {
        format!(
            "{}{}/{}/{}/{}",
            CHUNK_PATH_PREFIX,
            self.title_id,
            self.episode_id,
            self.quality,
            self.filename()
        )
    }

    /// Key prefix that keeps one rendition of one episode together.
    pub fn rendition_prefix(&self) -> String {
        format!("{}/{}/{}/", self.title_id, self.episode_id, self.quality)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleSerie {
    pub title_id: u16,
    pub episode_id: u16,
    pub quality_hashes: HashMap<Quality, String>,
}

/// `(title, episode) -> per-quality content hash`, consulted when a chunk
/// is downgraded to another rendition.
#[derive(Default)]
pub struct TitleSeries {
    series: RwLock<HashMap<(u16, u16), TitleSerie>>,
}

impl TitleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: &[TitleSerieSeed]) -> Result<Self> {
        let cache = Self::new();
        for seed in seeds {
            for (quality, hash) in &seed.hashes {
                let quality = Quality::parse(quality)
                    .ok_or_else(|| anyhow!("title {} serie {}: bad quality {quality}", seed.title, seed.serie))?;
                cache.insert_hash(seed.title, seed.serie, quality, hash);
            }
        }
        Ok(cache)
    }

    pub fn put(&self, serie: TitleSerie) {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        series.insert((serie.title_id, serie.episode_id), serie);
    }

    pub fn insert_hash(&self, title_id: u16, episode_id: u16, quality: Quality, hash: &str) {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        series
            .entry((title_id, episode_id))
            .or_insert_with(|| TitleSerie {
                title_id,
                episode_id,
                quality_hashes: HashMap::new(),
            })
            .quality_hashes
            .insert(quality, hash.to_string());
    }

    pub fn get(&self, title_id: u16, episode_id: u16) -> Option<TitleSerie> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series.get(&(title_id, episode_id)).cloned()
    }

    pub fn hash_for(&self, title_id: u16, episode_id: u16, quality: Quality) -> Option<String> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(&(title_id, episode_id))
            .and_then(|serie| serie.quality_hashes.get(&quality).cloned())
    }

    pub fn len(&self) -> usize {
        self.series.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
