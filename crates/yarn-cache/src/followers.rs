use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use yarn_types::urls::normalize_url;

use crate::cache::Cache;
use crate::error::FetchError;
use crate::fetch::expect_json;
use crate::peers::{UserAgent, is_public_url};

/// Who-follows lookups in flight at once; sightings beyond this are dropped.
pub const WHO_FOLLOWS_FETCHES: usize = 4;

/// Followers not seen for this long are pruned.
pub const FOLLOWER_MAX_AGE: TimeDelta = TimeDelta::days(90);

/// A remote feed seen fetching one of our users' feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follower {
    pub nick: String,
    pub uri: String,
    pub last_seen_at: DateTime<Utc>,
}

impl Cache {
    pub async fn add_follower(&self, username: &str, nick: &str, uri: &str) {
        let uri = normalize_url(uri);
        if uri.is_empty() {
            return;
        }
        let mut st = self.write().await;
        st.followers.entry(username.to_owned()).or_default().insert(
            uri.clone(),
            Follower {
                nick: nick.to_owned(),
                uri,
                last_seen_at: Utc::now(),
            },
        );
    }

    /// Followers of `username`, keyed by follower URI.
    pub async fn get_followers(&self, username: &str) -> BTreeMap<String, Follower> {
        self.read()
            .await
            .followers
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn follower_count(&self) -> usize {
        self.read().await.followers.values().map(BTreeMap::len).sum()
    }

    /// Drop followers not seen within `max_age`. Returns how many went.
    pub async fn prune_followers(&self, max_age: TimeDelta) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut pruned = 0;
        let mut st = self.write().await;
        for followers in st.followers.values_mut() {
            let before = followers.len();
            followers.retain(|_, f| f.last_seen_at >= cutoff);
            pruned += before - followers.len();
        }
        st.followers.retain(|_, f| !f.is_empty());
        pruned
    }

    /// Record whoever is behind `ua` as a follower of local `username`.
    /// Multi-user agents are resolved through their who-follows document.
    pub async fn observe_follower(&self, ua: &UserAgent, username: &str) {
        match ua {
            UserAgent::Single { nick, uri, .. } => self.add_follower(username, nick, uri).await,
            UserAgent::Multi { who_follows_url, .. } => self.observe_who_follows(who_follows_url, username).await,
            UserAgent::Pod { .. } => {}
        }
    }

    async fn observe_who_follows(&self, url: &str, username: &str) {
        if !self.conf().debug && !is_public_url(url).await {
            debug!("Ignoring non-public who follows url {}", url);
            return;
        }
        let Ok(_permit) = self.who_follows_permits().try_acquire() else {
            debug!("Too many who follows lookups in flight, skipping {}", url);
            return;
        };
        match self.fetch_who_follows(url).await {
            Ok(followers) => {
                debug!("{} reports {} followers of {}", url, followers.len(), username);
                for (nick, uri) in followers {
                    self.add_follower(username, &nick, &uri).await;
                }
            }
            Err(e) => warn!("error fetching who follows from {}: {}", url, e),
        }
    }

    async fn fetch_who_follows(&self, url: &str) -> Result<BTreeMap<String, String>, FetchError> {
        let res = self
            .client()
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let res = expect_json(res)?;
        let stream = res.bytes_stream().map_err(std::io::Error::other);
        let mut body = Vec::new();
        StreamReader::new(stream)
            .take(self.conf().max_fetch_limit)
            .read_to_end(&mut body)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::get;
    use axum::{Json, Router};
    use yarn_types::Config;

    use super::*;

    async fn who_follows_server(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/whoFollows",
            get(move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(BTreeMap::from([("bob", "https://b.example/twtxt.txt")]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/whoFollows")
    }

    fn multi(url: &str) -> UserAgent {
        UserAgent::Multi {
            client: "yarnd/0.9".into(),
            who_follows_url: url.into(),
            support_url: "https://b.example/support".into(),
        }
    }

    #[tokio::test]
    async fn private_who_follows_is_not_fetched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = who_follows_server(hits.clone()).await;
        let cache = Cache::new(Arc::new(Config::default())).unwrap();

        cache.observe_follower(&multi(&url), "alice").await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(cache.get_followers("alice").await.is_empty());
    }

    #[tokio::test]
    async fn who_follows_lookups_are_bounded() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = who_follows_server(hits.clone()).await;
        let conf = Config {
            debug: true,
            ..Config::default()
        };
        let cache = Cache::new(Arc::new(conf)).unwrap();

        let busy = cache
            .who_follows_permits()
            .try_acquire_many(WHO_FOLLOWS_FETCHES as u32)
            .unwrap();
        cache.observe_follower(&multi(&url), "alice").await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        drop(busy);
        cache.observe_follower(&multi(&url), "alice").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let followers = cache.get_followers("alice").await;
        assert_eq!(followers.get("https://b.example/twtxt.txt").map(|f| f.nick.as_str()), Some("bob"));
    }

    #[tokio::test]
    async fn followers_are_pruned_by_age() {
        let cache = Cache::new(Arc::new(Config::default())).unwrap();
        cache.add_follower("alice", "bob", "https://b.example/twtxt.txt/").await;
        cache.add_follower("alice", "carol", "https://c.example/twtxt.txt").await;
        {
            let mut st = cache.write().await;
            let f = st.followers.get_mut("alice").unwrap();
            f.get_mut("https://c.example/twtxt.txt").unwrap().last_seen_at = Utc::now() - TimeDelta::days(91);
        }

        assert_eq!(cache.prune_followers(FOLLOWER_MAX_AGE).await, 1);
        let left = cache.get_followers("alice").await;
        assert_eq!(left.keys().collect::<Vec<_>>(), vec!["https://b.example/twtxt.txt"]);
        assert_eq!(cache.follower_count().await, 1);
    }
}
