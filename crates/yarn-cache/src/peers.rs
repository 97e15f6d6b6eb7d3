use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use yarn_types::{FmtOpts, SOFTWARE};
use yarn_types::urls::normalize_url;

use crate::cache::Cache;
use crate::error::FetchError;
use crate::fetch::expect_json;

/// How long peer metadata stays fresh.
pub const PEER_TTL: TimeDelta = TimeDelta::hours(24);

/// A remote pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub uri: String,
    pub name: String,
    pub description: String,
    pub software_version: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Peer {
    fn placeholder(uri: &str, now: DateTime<Utc>) -> Self {
        Self {
            uri: uri.to_owned(),
            last_seen: Some(now),
            ..Default::default()
        }
    }

    /// Installed while `/info` is fetched; never shown to users.
    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() && self.software_version.is_empty()
    }

    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.last_updated {
            Some(at) => now - at > PEER_TTL,
            None => true,
        }
    }
}

/// Body of `GET <pod>/info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub software_version: String,
}

/// Drop peers whose metadata is past its TTL. "Diverged" is read as: a
/// stale peer whose `last_seen` moved past `last_updated` was sighted after
/// its refresh, so it stays until the next sighting refreshes it. A stale
/// peer not seen since its refresh is dropped. Returns how many went.
pub(crate) fn evict_stale(peers: &mut HashMap<String, Peer>, now: DateTime<Utc>) -> usize {
    let before = peers.len();
    peers.retain(|_, p| match p.last_updated {
        Some(updated) => now - updated <= PEER_TTL || p.last_seen.is_some_and(|seen| seen > updated),
        None => true,
    });
    before - peers.len()
}

// ── User agents ─────────────────────────────────────────────────────────

static SINGLE_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?/\S+) \(\+(https?://\S+); @(\S+)\)$").expect("valid regex")
});

static MULTI_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?/\S+) \(~(https?://\S+); contact=(https?://\S+)\)$").expect("valid regex")
});

static POD_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?/\S+) \(Pod: (.+?) Support: (https?://\S+)\)$").expect("valid regex")
});

/// A parsed twtxt client user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgent {
    /// `<client>/<ver> (+<feed url>; @<nick>)`
    Single { client: String, uri: String, nick: String },
    /// `<client>/<ver> (~<whoFollows url>; contact=<support url>)`
    Multi { client: String, who_follows_url: String, support_url: String },
    /// `<client>/<ver> (Pod: <name> Support: <support url>)`
    Pod { client: String, name: String, support_url: String },
}

impl UserAgent {
    pub fn parse(ua: &str) -> Option<Self> {
        let ua = ua.trim();
        if let Some(c) = SINGLE_UA.captures(ua) {
            return Some(Self::Single {
                client: c[1].to_owned(),
                uri: c[2].to_owned(),
                nick: c[3].to_owned(),
            });
        }
        if let Some(c) = MULTI_UA.captures(ua) {
            return Some(Self::Multi {
                client: c[1].to_owned(),
                who_follows_url: c[2].to_owned(),
                support_url: c[3].to_owned(),
            });
        }
        POD_UA.captures(ua).map(|c| Self::Pod {
            client: c[1].to_owned(),
            name: c[2].to_owned(),
            support_url: c[3].to_owned(),
        })
    }

    pub fn client(&self) -> &str {
        match self {
            Self::Single { client, .. } | Self::Multi { client, .. } | Self::Pod { client, .. } => client,
        }
    }

    /// Whether the client is a pod running the same software as us.
    pub fn is_pod(&self) -> bool {
        self.client()
            .split_once('/')
            .is_some_and(|(name, _)| name == SOFTWARE)
    }

    /// URL the agent identifies itself by.
    pub fn url(&self) -> &str {
        match self {
            Self::Single { uri, .. } => uri,
            Self::Multi { who_follows_url, .. } => who_follows_url,
            Self::Pod { support_url, .. } => support_url,
        }
    }

    /// Base URL of the pod behind this agent.
    pub fn pod_base_url(&self) -> Option<String> {
        if !self.is_pod() {
            return None;
        }
        // `/user/<nick>/twtxt.txt`, `/whoFollows?...` or `/support`
        let rel = match self {
            Self::Single { .. } => "../..",
            Self::Multi { .. } | Self::Pod { .. } => "./",
        };
        let base = Url::parse(self.url()).ok()?.join(rel).ok()?;
        Some(normalize_url(base.as_str())).filter(|b| !b.is_empty())
    }
}

/// Whether `uri` resolves to a public address.
pub async fn is_public_url(uri: &str) -> bool {
    let Some(url) = Url::parse(uri).ok() else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr.ip(),
                None => return false,
            },
            Err(e) => {
                warn!("error looking up {}: {}", host, e);
                return false;
            }
        },
    };
    is_public_ip(ip)
}

fn is_public_ip(ip: IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_link_local() || v4.is_broadcast()),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (first & 0xfe00) != 0xfc00 && (first & 0xffc0) != 0xfe80
        }
    }
}

// ── Detector ────────────────────────────────────────────────────────────

impl Cache {
    /// Peers with metadata, sorted by URI. Placeholders are hidden.
    pub async fn get_peers(&self) -> Vec<Peer> {
        let st = self.read().await;
        let mut peers: Vec<Peer> = st.peers.values().filter(|p| !p.is_placeholder()).cloned().collect();
        peers.sort_by(|a, b| a.uri.cmp(&b.uri));
        peers
    }

    pub async fn get_peer(&self, uri: &str) -> Option<Peer> {
        self.read().await.peers.get(uri).cloned()
    }

    /// Note an inbound or outbound sighting of a pod. Fetches its `/info`
    /// at most once per TTL; concurrent sightings share one fetch.
    pub async fn add_peer(&self, base: &str) {
        let base = normalize_url(base);
        if base.is_empty() || self.conf().is_local_url(&base) {
            return;
        }
        let now = Utc::now();

        let prior = {
            let mut st = self.write().await;
            if let Some(peer) = st.peers.get_mut(&base) {
                peer.last_seen = Some(now);
            }
            if st.peers_inflight.contains(&base) {
                return;
            }
            let prior = st.peers.get(&base).cloned();
            if prior.as_ref().is_some_and(|p| !p.should_refresh(now)) {
                return;
            }
            st.peers_inflight.insert(base.clone());
            if prior.is_none() {
                st.peers.insert(base.clone(), Peer::placeholder(&base, now));
            }
            prior
        };

        let result = self.fetch_peer_info(&base).await;

        let mut st = self.write().await;
        st.peers_inflight.remove(&base);
        match result {
            Ok(info) => {
                info!("Discovered peer {} ({} {})", base, info.name, info.software_version);
                let peer = st.peers.entry(base.clone()).or_insert_with(|| Peer::placeholder(&base, now));
                peer.name = info.name;
                peer.description = info.description;
                peer.software_version = info.software_version;
                peer.last_updated = Some(Utc::now());
            }
            Err(e) => {
                warn!("error fetching peer info from {}: {}", base, e);
                match prior {
                    Some(mut prior) if !prior.is_placeholder() => {
                        prior.last_seen = Some(now);
                        st.peers.insert(base, prior);
                    }
                    _ => {
                        st.peers.remove(&base);
                    }
                }
            }
        }
    }

    async fn fetch_peer_info(&self, base: &str) -> Result<PeerInfo, FetchError> {
        let res = self
            .client()
            .get(format!("{base}/info"))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let res = expect_json(res)?;
        Ok(res.json::<PeerInfo>().await?)
    }

    /// Inspect an inbound user agent and register the pod behind it.
    pub async fn observe_peer(&self, ua: &UserAgent) {
        let Some(base) = ua.pod_base_url() else {
            return;
        };
        if !self.conf().debug && !is_public_url(ua.url()).await {
            debug!("Ignoring non-public pod {}", base);
            return;
        }
        self.add_peer(&base).await;
    }
}
