//! Genre-keyed track recommendations.
//!
//! `RecommendationSource` is the seam the service calls with its own top-1
//! genre. `LastFmClient` implements it against the Last.fm REST API.

use crate::error::{GenreError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const LASTFM_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub artist: String,
    /// Genre the lookup was keyed by.
    pub genre: String,
    /// 1-based position in the source's ranking.
    pub rank: usize,
    pub image_url: Option<String>,
}

pub trait RecommendationSource: Send + Sync {
    fn top_tracks(&self, genre: &str, limit: usize) -> Result<Vec<Recommendation>>;
}

pub struct LastFmClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    fetch_images: bool,
}

impl LastFmClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
            api_key: api_key.into(),
            base_url: LASTFM_API_URL.into(),
            fetch_images: true,
        }
    }

    /// Reads the key from `LASTFM_API_KEY`.
    pub fn from_env() -> Result<Self> {
        std::env::var("LASTFM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
            .ok_or_else(|| GenreError::Recommendation("LASTFM_API_KEY is not set".into()))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Skip the per-track `track.getInfo` album art lookup.
    pub fn without_images(mut self) -> Self {
        self.fetch_images = false;
        self
    }

    fn call(&self, params: &[(&str, &str)]) -> Result<String> {
        let mut req = self
            .agent
            .get(&self.base_url)
            .query("api_key", &self.api_key)
            .query("format", "json");
        for (k, v) in params {
            req = req.query(k, v);
        }
        match req.call() {
            Ok(resp) => resp
                .into_string()
                .map_err(|e| GenreError::Recommendation(e.to_string())),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                let detail = api_error(&body).unwrap_or_else(|| format!("HTTP {}", code));
                Err(GenreError::Recommendation(detail))
            }
            Err(e) => Err(GenreError::Recommendation(e.to_string())),
        }
    }

    fn album_image(&self, artist: &str, title: &str) -> Result<Option<String>> {
        let body = self.call(&[
            ("method", "track.getInfo"),
            ("artist", artist),
            ("track", title),
        ])?;
        parse_album_image(&body)
    }
}

impl RecommendationSource for LastFmClient {
    fn top_tracks(&self, genre: &str, limit: usize) -> Result<Vec<Recommendation>> {
        let limit_s = limit.to_string();
        let body = self.call(&[
            ("method", "tag.gettoptracks"),
            ("tag", genre),
            ("limit", &limit_s),
        ])?;
        let mut recs = parse_top_tracks(&body, genre, limit)?;
        if self.fetch_images {
            for rec in recs.iter_mut() {
                match self.album_image(&rec.artist, &rec.title) {
                    Ok(Some(url)) => rec.image_url = Some(url),
                    Ok(None) => {}
                    Err(e) => log::warn!(
                        "album art lookup failed for {} - {}: {}",
                        rec.artist,
                        rec.title,
                        e
                    ),
                }
            }
        }
        Ok(recs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

#[derive(Deserialize)]
struct ApiError {
    error: u32,
    message: String,
}

#[derive(Deserialize)]
struct TopTracksResponse {
    tracks: TrackList,
}

#[derive(Deserialize)]
struct TrackList {
    #[serde(default)]
    track: OneOrMany<LfmTrack>,
}

#[derive(Deserialize)]
struct LfmTrack {
    name: String,
    artist: LfmArtist,
    #[serde(default)]
    image: Vec<LfmImage>,
}

#[derive(Deserialize)]
struct LfmArtist {
    name: String,
}

#[derive(Deserialize)]
struct LfmImage {
    #[serde(rename = "#text")]
    url: String,
}

#[derive(Deserialize)]
struct TrackInfoResponse {
    track: TrackInfo,
}

#[derive(Deserialize)]
struct TrackInfo {
    album: Option<LfmAlbum>,
}

#[derive(Deserialize)]
struct LfmAlbum {
    #[serde(default)]
    image: Vec<LfmImage>,
}

fn api_error(body: &str) -> Option<String> {
    serde_json::from_str::<ApiError>(body)
        .ok()
        .map(|e| format!("Last.fm error {}: {}", e.error, e.message))
}

/// Images are listed smallest first; take the largest non-empty one.
fn largest_image(images: &[LfmImage]) -> Option<String> {
    images
        .iter()
        .rev()
        .map(|i| i.url.trim())
        .find(|u| !u.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_top_tracks(body: &str, genre: &str, limit: usize) -> Result<Vec<Recommendation>> {
    if let Some(err) = api_error(body) {
        return Err(GenreError::Recommendation(err));
    }
    let parsed: TopTracksResponse = serde_json::from_str(body)
        .map_err(|e| GenreError::Recommendation(format!("unexpected tag.gettoptracks payload: {}", e)))?;
    Ok(parsed
        .tracks
        .track
        .into_vec()
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, t)| Recommendation {
            title: t.name,
            artist: t.artist.name,
            genre: genre.to_string(),
            rank: i + 1,
            image_url: largest_image(&t.image),
        })
        .collect())
}

pub(crate) fn parse_album_image(body: &str) -> Result<Option<String>> {
    if let Some(err) = api_error(body) {
        return Err(GenreError::Recommendation(err));
    }
    let parsed: TrackInfoResponse = serde_json::from_str(body)
        .map_err(|e| GenreError::Recommendation(format!("unexpected track.getInfo payload: {}", e)))?;
    Ok(parsed.track.album.and_then(|a| largest_image(&a.image)))
}
