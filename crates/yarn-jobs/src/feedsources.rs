//! External discovery lists: plain-text `nick URL` files published by
//! feed directories, merged and kept in `<data>/feedsources.json`.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use yarn_cache::read_limited;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
}

/// Feeds listed by each source, keyed by the source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSources {
    pub sources: BTreeMap<String, Vec<FeedSource>>,
}

impl FeedSources {
    pub fn len(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Parse a `nick URL` list. Blank lines, `#` comments and lines without a
/// valid http(s) URL are skipped.
pub fn parse_feed_sources(text: &str) -> Vec<FeedSource> {
    let mut feeds = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(url)) = (fields.next(), fields.next()) else {
            debug!("Skipping feed source line {:?}", line);
            continue;
        };
        match Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => feeds.push(FeedSource {
                name: name.to_owned(),
                url: url.to_owned(),
            }),
            _ => debug!("Skipping feed source with bad url {:?}", url),
        }
    }
    feeds.sort();
    feeds.dedup();
    feeds
}

/// Fetch every source. A source that fails keeps no entry; the rest still
/// count.
pub async fn fetch_feed_sources(client: &reqwest::Client, sources: &[String], limit: u64) -> FeedSources {
    let mut out = FeedSources::default();
    for source in sources {
        match fetch_one(client, source, limit).await {
            Ok(feeds) => {
                debug!("Feed source {} lists {} feeds", source, feeds.len());
                out.sources.insert(source.clone(), feeds);
            }
            Err(e) => warn!("error fetching feed source {}: {:#}", source, e),
        }
    }
    out
}

async fn fetch_one(client: &reqwest::Client, source: &str, limit: u64) -> Result<Vec<FeedSource>> {
    let res = client.get(source).send().await?.error_for_status()?;
    let (body, limited) = read_limited(res, limit).await?;
    if limited {
        warn!("feed source {} truncated at {} bytes", source, limit);
    }
    Ok(parse_feed_sources(&String::from_utf8_lossy(&body)))
}
