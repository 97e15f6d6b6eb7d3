//! Versioned MessagePack snapshot of the cache.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use yarn_types::{Config, Twt};

use crate::cache::{Cache, Cached, State};
use crate::followers::Follower;
use crate::peers::Peer;

pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Deserialize)]
struct Header {
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    feeds: HashMap<String, Cached>,
    peers: HashMap<String, Peer>,
    followers: HashMap<String, BTreeMap<String, Follower>>,
}

/// Layout before followers and fetch times were persisted.
#[derive(Deserialize)]
struct SnapshotV1 {
    feeds: HashMap<String, CachedV1>,
    #[serde(default)]
    peers: HashMap<String, Peer>,
}

#[derive(Deserialize)]
struct CachedV1 {
    twts: Vec<Twt>,
    #[serde(default)]
    last_modified: String,
}

impl From<SnapshotV1> for Snapshot {
    fn from(old: SnapshotV1) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            feeds: old
                .feeds
                .into_iter()
                .map(|(url, c)| {
                    let cached = Cached {
                        twts: c.twts,
                        last_modified: c.last_modified,
                        last_fetched: None,
                    };
                    (url, cached)
                })
                .collect(),
            peers: old.peers,
            followers: HashMap::new(),
        }
    }
}

enum Decoded {
    Current(Snapshot),
    Migrated(Snapshot),
}

fn decode(data: &[u8]) -> Result<Decoded> {
    let header: Header = rmp_serde::from_slice(data).context("reading snapshot version")?;
    match header.version {
        SNAPSHOT_VERSION => Ok(Decoded::Current(rmp_serde::from_slice(data)?)),
        1 => {
            let old: SnapshotV1 = rmp_serde::from_slice(data)?;
            Ok(Decoded::Migrated(old.into()))
        }
        v => anyhow::bail!("unsupported snapshot version {v}"),
    }
}

impl Cache {
    /// Write the feeds, peers and followers to `path` atomically.
    pub async fn store(&self, path: &Path) -> Result<()> {
        let data = {
            let st = self.read().await;
            let snapshot = SnapshotRef {
                version: SNAPSHOT_VERSION,
                feeds: &st.feeds,
                peers: &st.peers,
                followers: &st.followers,
            };
            rmp_serde::to_vec_named(&snapshot)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Restore a cache from `path`. A missing file yields an empty cache; a
    /// corrupt or unknown snapshot is removed and an empty cache is used.
    pub async fn load(conf: Arc<Config>, path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("error reading cache snapshot {:?}: {}", path, e);
                None
            }
        };

        let Some(data) = data else {
            return Self::new(conf);
        };

        let (snapshot, migrated) = match decode(&data) {
            Ok(Decoded::Current(s)) => (s, false),
            Ok(Decoded::Migrated(s)) => (s, true),
            Err(e) => {
                warn!("discarding unreadable cache snapshot {:?}: {:#}", path, e);
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("error removing cache snapshot {:?}: {}", path, e);
                }
                return Self::new(conf);
            }
        };

        let state = State {
            feeds: snapshot.feeds,
            peers: snapshot.peers,
            followers: snapshot.followers,
            ..State::default()
        };
        let cache = Self::with_state(conf, state)?;
        cache.refresh().await;
        info!("Loaded cache with {} feeds and {} twts", cache.feed_count().await, cache.twt_count().await);

        if migrated {
            info!("Migrated cache snapshot to version {}", SNAPSHOT_VERSION);
            cache.store(path).await?;
        }
        Ok(cache)
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    feeds: &'a HashMap<String, Cached>,
    peers: &'a HashMap<String, Peer>,
    followers: &'a HashMap<String, BTreeMap<String, Follower>>,
}
