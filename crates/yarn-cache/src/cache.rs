use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore};
use tracing::debug;
use yarn_types::twt::uniq_twts;
use yarn_types::urls::normalize_url;
use yarn_types::{Config, Twt, sort_twts};

use crate::followers::{Follower, WHO_FOLLOWS_FETCHES};
use crate::metrics::Metrics;
use crate::peers::{self, Peer};
use crate::views::{self, DISCOVER_VIEW, LOCAL_VIEW, MENTIONS_VIEW, UserContext};

/// One feed's slice of the active cache window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cached {
    pub twts: Vec<Twt>,
    pub last_modified: String,
    pub last_fetched: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) feeds: HashMap<String, Cached>,
    pub(crate) all: Vec<Twt>,
    pub(crate) twts_by_hash: HashMap<String, Twt>,
    pub(crate) views: HashMap<String, Vec<Twt>>,
    pub(crate) peers: HashMap<String, Peer>,
    /// Peers whose `/info` fetch is in flight.
    pub(crate) peers_inflight: HashSet<String>,
    pub(crate) followers: HashMap<String, BTreeMap<String, Follower>>,
}

/// The federated feed cache. Cheap to clone; every clone shares one state
/// behind a single reader-writer lock that is never held across network I/O.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    conf: Arc<Config>,
    client: reqwest::Client,
    metrics: Metrics,
    /// Permits for who-follows lookups triggered by inbound requests.
    who_follows: Semaphore,
    state: RwLock<State>,
}

impl Cache {
    pub fn new(conf: Arc<Config>) -> Result<Self> {
        Self::with_state(conf, State::default())
    }

    pub(crate) fn with_state(conf: Arc<Config>, state: State) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(conf.request_timeout)
            .user_agent(conf.user_agent())
            .build()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                conf,
                client,
                metrics: Metrics::default(),
                who_follows: Semaphore::new(WHO_FOLLOWS_FETCHES),
                state: RwLock::new(state),
            }),
        })
    }

    pub fn conf(&self) -> &Config {
        &self.inner.conf
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Shared outbound HTTP client, carrying the pod user agent.
    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub(crate) fn who_follows_permits(&self) -> &Semaphore {
        &self.inner.who_follows
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.state.write().await
    }

    // -- Lookups --

    pub async fn lookup(&self, hash: &str) -> Option<Twt> {
        self.read().await.twts_by_hash.get(hash).cloned()
    }

    pub async fn is_cached(&self, url: &str) -> bool {
        self.read().await.feeds.contains_key(url)
    }

    pub async fn last_modified(&self, url: &str) -> Option<String> {
        let st = self.read().await;
        st.feeds
            .get(url)
            .map(|c| c.last_modified.clone())
            .filter(|lm| !lm.is_empty())
    }

    pub async fn get_by_url(&self, url: &str) -> Vec<Twt> {
        self.read()
            .await
            .feeds
            .get(url)
            .map(|c| c.twts.clone())
            .unwrap_or_default()
    }

    pub async fn get_by_view(&self, key: &str) -> Vec<Twt> {
        self.read().await.views.get(key).cloned().unwrap_or_default()
    }

    pub async fn get_all(&self, refresh: bool) -> Vec<Twt> {
        if refresh {
            self.refresh().await;
        }
        self.read().await.all.clone()
    }

    pub async fn feed_count(&self) -> usize {
        self.read().await.feeds.len()
    }

    pub async fn twt_count(&self) -> usize {
        self.read().await.all.len()
    }

    pub async fn feed_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.read().await.feeds.keys().cloned().collect();
        urls.sort();
        urls
    }

    // -- Mutations --

    /// Replace a feed's twts. An empty list never wipes existing twts.
    pub async fn update_feed(&self, url: &str, last_modified: &str, twts: Vec<Twt>) {
        let now = Utc::now();
        let mut st = self.write().await;
        match st.feeds.get_mut(url) {
            Some(cached) => {
                cached.last_fetched = Some(now);
                if twts.is_empty() {
                    return;
                }
                cached.twts = uniq_twts(twts);
                cached.last_modified = last_modified.to_owned();
            }
            None => {
                st.feeds.insert(
                    url.to_owned(),
                    Cached {
                        twts: uniq_twts(twts),
                        last_modified: last_modified.to_owned(),
                        last_fetched: Some(now),
                    },
                );
            }
        }
    }

    /// Add a single twt to a feed without fetching it.
    pub async fn inject_feed(&self, url: &str, twt: Twt) {
        let mut st = self.write().await;
        st.twts_by_hash.insert(twt.hash().to_owned(), twt.clone());
        let cached = st.feeds.entry(url.to_owned()).or_default();
        if cached.twts.iter().any(|t| t.hash() == twt.hash()) {
            return;
        }
        cached.twts.push(twt);
        sort_twts(&mut cached.twts);
    }

    /// Remove a twt from a feed, e.g. after the author deleted it.
    pub async fn remove_twt(&self, url: &str, hash: &str) {
        let mut st = self.write().await;
        if let Some(cached) = st.feeds.get_mut(url) {
            cached.twts.retain(|t| t.hash() != hash);
        }
        st.twts_by_hash.remove(hash);
    }

    /// Move a cached feed to the URL it redirected to.
    pub async fn rekey_feed(&self, from: &str, to: &str) {
        let mut st = self.write().await;
        if let Some(cached) = st.feeds.remove(from) {
            st.feeds.entry(to.to_owned()).or_insert(cached);
        }
    }

    pub async fn delete_feeds(&self, urls: &[String]) {
        {
            let mut st = self.write().await;
            for url in urls {
                st.feeds.remove(url);
            }
        }
        self.refresh().await;
    }

    /// Rebuild the global views from the union of cached feeds.
    pub async fn refresh(&self) {
        let all: Vec<Twt> = {
            let st = self.read().await;
            st.feeds.values().flat_map(|c| c.twts.iter().cloned()).collect()
        };
        let all = uniq_twts(all);
        let conf = self.conf();

        let mut by_hash = HashMap::with_capacity(all.len());
        let mut local = Vec::new();
        let mut discover = Vec::new();
        let mut tags: HashMap<String, Vec<Twt>> = HashMap::new();
        let mut subjects: HashMap<String, Vec<Twt>> = HashMap::new();

        for twt in &all {
            by_hash.insert(twt.hash().to_owned(), twt.clone());
            if views::is_local(conf, twt) {
                local.push(twt.clone());
            }
            if views::is_discoverable(conf, twt) {
                discover.push(twt.clone());
            }
            for tag in views::tag_keys(twt) {
                tags.entry(tag).or_default().push(twt.clone());
            }
            subjects.entry(twt.subject_key()).or_default().push(twt.clone());
        }

        // Forked conversations still show their root at the tail.
        for (key, twts) in subjects.iter_mut() {
            if let Some(root) = by_hash.get(key) {
                if !twts.iter().any(|t| t.hash() == root.hash()) {
                    twts.push(root.clone());
                }
            }
        }

        let mut views = HashMap::with_capacity(2 + tags.len() + subjects.len());
        views.insert(LOCAL_VIEW.to_owned(), local);
        views.insert(DISCOVER_VIEW.to_owned(), discover);
        for (tag, twts) in tags {
            views.insert(views::tag_view(&tag), twts);
        }
        for (key, twts) in subjects {
            views.insert(views::subject_view(&key), twts);
        }

        let mut st = self.write().await;
        let evicted = peers::evict_stale(&mut st.peers, Utc::now());
        if evicted > 0 {
            debug!("Evicted {} stale peers", evicted);
        }
        Metrics::set(&self.metrics().cache_feeds, st.feeds.len() as u64);
        Metrics::set(&self.metrics().cache_twts, all.len() as u64);
        st.all = all;
        st.twts_by_hash = by_hash;
        st.views = views;
    }

    // -- Per-user views --

    /// Timeline of everything the user follows plus their own feeds.
    pub async fn get_by_user(&self, user: &UserContext, refresh: bool) -> Vec<Twt> {
        let key = user.user_key();
        if !refresh {
            if let Some(twts) = self.read().await.views.get(&key) {
                return twts.clone();
            }
        }

        let mut st = self.write().await;
        let mut twts: Vec<Twt> = st
            .feeds
            .iter()
            .filter(|(url, _)| user.sources.contains(&normalize_url(url)))
            .flat_map(|(_, c)| c.twts.iter().filter(|t| !user.is_muted(t)).cloned())
            .collect();
        twts = uniq_twts(twts);
        st.views.insert(key, twts.clone());
        twts
    }

    pub async fn get_mentions(&self, user: &UserContext, refresh: bool) -> Vec<Twt> {
        let key = user.mentions_key();
        let mut st = self.write().await;
        if !refresh {
            if let Some(twts) = st.views.get(&key) {
                return twts.clone();
            }
        }
        let twts: Vec<Twt> = st
            .all
            .iter()
            .filter(|t| user.is_mentioned(t) && !user.is_muted(t))
            .cloned()
            .collect();
        st.views.insert(key, twts.clone());
        twts
    }

    /// A global view as seen by one user, minus their mutes.
    pub async fn get_by_user_view(&self, user: &UserContext, view: &str, refresh: bool) -> Vec<Twt> {
        if view == MENTIONS_VIEW {
            return self.get_mentions(user, refresh).await;
        }
        let key = user.view_key(view);
        let mut st = self.write().await;
        if !refresh {
            if let Some(twts) = st.views.get(&key) {
                return twts.clone();
            }
        }
        let mut twts: Vec<Twt> = st
            .views
            .get(view)
            .map(|v| v.iter().filter(|t| !user.is_muted(t)).cloned().collect())
            .unwrap_or_default();
        sort_twts(&mut twts);
        st.views.insert(key, twts.clone());
        twts
    }

    pub async fn delete_user_views(&self, username: &str) {
        let prefix = views::user_view_prefix(username);
        let user_key = format!("user:{username}");
        let mentions_key = format!("mentions:{username}");
        let mut st = self.write().await;
        st.views
            .retain(|k, _| k != &user_key && k != &mentions_key && !k.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use yarn_types::Twter;

    fn conf() -> Arc<Config> {
        let mut conf = Config {
            base_url: "https://pod.example".into(),
            ..Config::default()
        };
        conf.validate().unwrap();
        Arc::new(conf)
    }

    fn twt(uri: &str, at: &str, text: &str) -> Twt {
        Twt::make(Twter::new("x", uri), DateTime::parse_from_rfc3339(at).unwrap(), text)
    }

    const ALICE: &str = "https://pod.example/user/alice/twtxt.txt";
    const BOB: &str = "https://b.example/twtxt.txt";

    #[tokio::test]
    async fn empty_update_keeps_twts() {
        let cache = Cache::new(conf()).unwrap();
        let t1 = twt(BOB, "2021-01-02T00:00:00Z", "one");
        cache.update_feed(BOB, "lm1", vec![t1.clone()]).await;
        cache.update_feed(BOB, "lm2", vec![]).await;

        assert_eq!(cache.get_by_url(BOB).await, vec![t1]);
        assert_eq!(cache.last_modified(BOB).await.as_deref(), Some("lm1"));
    }

    #[tokio::test]
    async fn feeds_are_deduplicated() {
        let cache = Cache::new(conf()).unwrap();
        let t1 = twt(BOB, "2021-01-02T00:00:00Z", "one");
        let t2 = twt(BOB, "2021-01-03T00:00:00Z", "two");
        cache.update_feed(BOB, "", vec![t1.clone(), t2.clone(), t1.clone()]).await;
        cache.inject_feed(BOB, t2.clone()).await;
        cache.inject_feed(BOB, t1.clone()).await;

        assert_eq!(cache.get_by_url(BOB).await, vec![t2, t1]);
    }

    #[tokio::test]
    async fn refresh_builds_views() {
        let cache = Cache::new(conf()).unwrap();
        let root = twt(ALICE, "2021-01-01T00:00:00Z", "hello #Yarn");
        let reply = twt(BOB, "2021-01-02T00:00:00Z", &format!("(#{}) hi back #yarn", root.hash()));
        let bot = twt("https://feeds.twtxt.net/x/twtxt.txt", "2021-01-03T00:00:00Z", "news");
        cache.update_feed(ALICE, "", vec![root.clone()]).await;
        cache.update_feed(BOB, "", vec![reply.clone()]).await;
        cache.update_feed("https://feeds.twtxt.net/x/twtxt.txt", "", vec![bot.clone()]).await;
        cache.refresh().await;

        assert_eq!(cache.get_all(false).await, vec![bot.clone(), reply.clone(), root.clone()]);
        assert_eq!(cache.get_by_view(LOCAL_VIEW).await, vec![root.clone()]);
        assert_eq!(cache.get_by_view(DISCOVER_VIEW).await, vec![reply.clone(), root.clone()]);
        assert_eq!(cache.get_by_view("tag:yarn").await, vec![reply.clone(), root.clone()]);
        assert_eq!(
            cache.get_by_view(&views::subject_view(root.hash())).await,
            vec![reply.clone(), root.clone()]
        );
        assert_eq!(cache.lookup(root.hash()).await, Some(root));
    }

    #[tokio::test]
    async fn forked_root_is_appended() {
        let cache = Cache::new(conf()).unwrap();
        let root = twt(ALICE, "2021-01-01T00:00:00Z", "(#abcdefg) forked");
        let reply = twt(BOB, "2021-01-02T00:00:00Z", &format!("(#{}) reply", root.hash()));
        cache.update_feed(ALICE, "", vec![root.clone()]).await;
        cache.update_feed(BOB, "", vec![reply.clone()]).await;
        cache.refresh().await;

        assert_eq!(cache.get_by_view(&views::subject_view(root.hash())).await, vec![reply, root]);
    }

    #[tokio::test]
    async fn user_views_respect_mutes() {
        let cache = Cache::new(conf()).unwrap();
        let mine = twt(ALICE, "2021-01-01T00:00:00Z", "mine");
        let theirs = twt(BOB, "2021-01-02T00:00:00Z", "@<alice https://pod.example/user/alice/twtxt.txt> hi");
        let noise = twt(BOB, "2021-01-03T00:00:00Z", "noise");
        cache.update_feed(ALICE, "", vec![mine.clone()]).await;
        cache.update_feed(BOB, "", vec![theirs.clone(), noise.clone()]).await;
        cache.refresh().await;

        let alice = UserContext::new("alice", ALICE).follow(BOB).mute(noise.hash());
        assert_eq!(cache.get_by_user(&alice, false).await, vec![theirs.clone(), mine.clone()]);
        assert_eq!(cache.get_mentions(&alice, false).await, vec![theirs.clone()]);
        assert_eq!(
            cache.get_by_user_view(&alice, DISCOVER_VIEW, false).await,
            vec![theirs.clone(), mine.clone()]
        );

        // Cached until dropped.
        let alice = alice.mute(BOB);
        assert_eq!(cache.get_by_user(&alice, false).await.len(), 2);
        cache.delete_user_views("alice").await;
        assert_eq!(cache.get_by_user(&alice, false).await, vec![mine]);
    }

    #[tokio::test]
    async fn user_views_leave_global_views_alone() {
        let cache = Cache::new(conf()).unwrap();
        let tagged = twt(BOB, "2021-01-02T00:00:00Z", "hello #local");
        cache.update_feed(BOB, "", vec![tagged.clone()]).await;
        cache.refresh().await;
        assert_eq!(cache.get_by_view("tag:local").await, vec![tagged.clone()]);

        let tag = UserContext::new("tag", ALICE).mute(BOB);
        assert!(cache.get_by_user_view(&tag, LOCAL_VIEW, true).await.is_empty());
        assert_eq!(cache.get_by_view("tag:local").await, vec![tagged.clone()]);

        cache.delete_user_views("tag").await;
        assert_eq!(cache.get_by_view("tag:local").await, vec![tagged]);
    }

    #[tokio::test]
    async fn delete_feeds_refreshes() {
        let cache = Cache::new(conf()).unwrap();
        cache.update_feed(BOB, "", vec![twt(BOB, "2021-01-02T00:00:00Z", "one")]).await;
        cache.refresh().await;
        assert_eq!(cache.twt_count().await, 1);

        cache.delete_feeds(&[BOB.to_owned()]).await;
        assert_eq!(cache.twt_count().await, 0);
        assert!(!cache.is_cached(BOB).await);
    }
}
