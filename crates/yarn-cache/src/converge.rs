//! Pull missing conversation roots from peers.
use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use reqwest::header::ACCEPT;
use tracing::{debug, info, warn};
use yarn_types::Twt;
use yarn_types::urls::normalize_url;

use crate::error::FetchError;
use crate::fetch::{Fetcher, expect_json, read_limited};
use crate::metrics::Metrics;
use crate::peers::Peer;

/// Share of known peers asked when no peer matches the thread's authors.
const RANDOM_PEER_RATIO: (usize, usize) = (6, 10);

/// Peers whose base URL prefixes one of `authors`, or else a random subset.
pub(crate) fn candidate_peers(peers: &[Peer], authors: &BTreeSet<String>) -> Vec<String> {
    let matching: Vec<String> = peers
        .iter()
        .filter(|p| authors.iter().any(|a| a.starts_with(&p.uri)))
        .map(|p| p.uri.clone())
        .collect();
    if !matching.is_empty() {
        return matching;
    }

    let mut all: Vec<String> = peers.iter().map(|p| p.uri.clone()).collect();
    all.shuffle(&mut rand::rng());
    let (num, den) = RANDOM_PEER_RATIO;
    all.truncate((all.len() * num).div_ceil(den));
    all
}

impl Fetcher {
    /// Subject hashes referenced by cached twts but known to neither the
    /// cache nor the archive, with the authors of the replies.
    async fn missing_roots(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut missing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        {
            let st = self.cache().read().await;
            for twt in &st.all {
                let Some(hash) = twt.subject().hash() else {
                    continue;
                };
                if hash == twt.hash() || st.twts_by_hash.contains_key(&hash) {
                    continue;
                }
                missing.entry(hash).or_default().insert(twt.twter().uri.clone());
            }
        }

        let mut out = BTreeMap::new();
        for (hash, authors) in missing {
            if !self.archive().has(&hash).await {
                out.insert(hash, authors);
            }
        }
        out
    }

    /// Ask peers for conversation roots we have never seen. Returns how many
    /// were found.
    pub async fn converge(&self) -> usize {
        let missing = self.missing_roots().await;
        if missing.is_empty() {
            return 0;
        }
        let peers = self.cache().get_peers().await;
        if peers.is_empty() {
            debug!("{} missing roots but no known peers", missing.len());
            return 0;
        }

        let metrics = self.cache().metrics();
        let mut budget = self.cache().conf().max_converge_requests;
        let mut found = 0;

        'roots: for (hash, authors) in &missing {
            for peer in candidate_peers(&peers, authors) {
                if budget == 0 {
                    debug!("convergence budget exhausted");
                    break 'roots;
                }
                budget -= 1;
                Metrics::inc(&metrics.converge_requests);

                match self.fetch_twt(&peer, hash).await {
                    Ok(twt) => {
                        debug!("Found root {} on {}", hash, peer);
                        let url = normalize_url(&twt.twter().uri);
                        self.archive_twt(&twt).await;
                        self.cache().inject_feed(&url, twt).await;
                        Metrics::inc(&metrics.converge_found);
                        found += 1;
                        break;
                    }
                    Err(e) => debug!("peer {} does not have {}: {}", peer, hash, e),
                }
            }
        }

        if found > 0 {
            info!("Converged {} of {} missing roots", found, missing.len());
            self.cache().refresh().await;
        }
        found
    }

    async fn fetch_twt(&self, peer: &str, hash: &str) -> Result<Twt, FetchError> {
        let res = self
            .cache()
            .client()
            .get(format!("{peer}/twt/{hash}"))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let res = expect_json(res)?;
        let (body, _) = read_limited(res, self.cache().conf().max_fetch_limit).await?;
        let twt: Twt = serde_json::from_slice(&body)?;
        if twt.hash() != hash {
            warn!("peer {} answered {} with twt {}", peer, hash, twt.hash());
            return Err(FetchError::Status(404));
        }
        Ok(twt)
    }
}
