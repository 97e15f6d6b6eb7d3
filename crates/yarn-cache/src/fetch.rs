use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeDelta, Utc};
use futures_util::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;
use yarn_storage::{DiskArchive, ExternalAvatars, FeedStore};
use yarn_types::urls::{self, normalize_url};
use yarn_types::{Config, FmtOpts, SOFTWARE, Twt, Twter, parse_file, split_twts};

use crate::cache::Cache;
use crate::error::FetchError;
use crate::gopher;
use crate::metrics::Metrics;

/// A feed to fetch: the nick it is known by and its URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Feed {
    pub nick: String,
    pub url: String,
}

impl Feed {
    pub fn new(nick: &str, url: &str) -> Self {
        Self {
            nick: nick.to_owned(),
            url: url.to_owned(),
        }
    }
}

/// Pass through a successful JSON response; anything else is an error.
pub(crate) fn expect_json(res: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    if !res.status().is_success() {
        return Err(FetchError::Status(res.status().as_u16()));
    }
    let ctype = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !ctype.contains("json") {
        return Err(FetchError::ContentType(ctype.to_owned()));
    }
    Ok(res)
}

/// Read at most `limit` bytes of a response body. Returns the body and
/// whether there was more.
pub async fn read_limited(res: reqwest::Response, limit: u64) -> Result<(Vec<u8>, bool), FetchError> {
    let stream = res.bytes_stream().map_err(std::io::Error::other);
    let mut body = Vec::new();
    StreamReader::new(stream).take(limit + 1).read_to_end(&mut body).await?;
    let limited = body.len() as u64 > limit;
    body.truncate(limit as usize);
    Ok((body, limited))
}

/// User agent announcing who on this pod follows `url`.
pub fn user_agent_for(conf: &Config, url: &str, followers: &[String]) -> String {
    match followers {
        [] => conf.user_agent(),
        [one] => urls::single_user_agent(&conf.url_for_user(one), one),
        many => urls::multi_user_agent(
            &urls::url_for_who_follows(&conf.base_url, url, many.len()),
            &conf.support_url(),
        ),
    }
}

/// Outcome of fetching one feed.
enum Fetched {
    NotModified,
    Body {
        url: String,
        body: Vec<u8>,
        last_modified: String,
        limited: bool,
    },
}

/// The fetch engine: pulls feeds into the cache and archive.
#[derive(Clone)]
pub struct Fetcher {
    cache: Cache,
    archive: Arc<DiskArchive>,
    feeds: Arc<FeedStore>,
    avatars: Arc<ExternalAvatars>,
}

impl Fetcher {
    pub fn new(cache: Cache, archive: Arc<DiskArchive>, feeds: Arc<FeedStore>, avatars: Arc<ExternalAvatars>) -> Self {
        Self {
            cache,
            archive,
            feeds,
            avatars,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn archive(&self) -> &DiskArchive {
        &self.archive
    }

    fn conf(&self) -> &Config {
        self.cache.conf()
    }

    /// Run one fetch cycle over `sources`. `hints` maps a feed URL to the
    /// local users following it and picks the outgoing user agent.
    pub async fn fetch_twts(&self, sources: Vec<Feed>, hints: &BTreeMap<String, Vec<String>>) {
        let started = Instant::now();
        let metrics = self.cache.metrics();

        let mut seen = HashSet::new();
        let mut feeds = Vec::with_capacity(sources.len());
        for feed in sources {
            let url = normalize_url(&feed.url);
            if url.is_empty() {
                debug!("Skipping unparseable feed url {:?}", feed.url);
                continue;
            }
            if self.conf().is_blacklisted(&url) {
                debug!("Skipping blacklisted feed {}", url);
                continue;
            }
            if seen.insert(url.clone()) {
                feeds.push(Feed { nick: feed.nick, url });
            }
        }
        Metrics::set(&metrics.cache_sources, feeds.len() as u64);
        info!("Fetching {} feeds", feeds.len());

        let hints: BTreeMap<String, Vec<String>> = hints.iter().map(|(k, v)| (normalize_url(k), v.clone())).collect();
        let semaphore = Arc::new(Semaphore::new(self.conf().max_cache_fetchers.max(1)));
        let mut workers = JoinSet::new();

        for feed in feeds {
            let followers = hints.get(&feed.url).map(Vec::as_slice).unwrap_or_default();
            let ua = user_agent_for(self.conf(), &feed.url, followers);
            let fetcher = self.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if let Err(e) = fetcher.fetch_feed(&feed, &ua).await {
                    warn!("error fetching feed {}: {}", feed.url, e);
                    Metrics::inc(&fetcher.cache.metrics().cache_fetch_errors);
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!("fetch worker failed: {}", e);
            }
        }

        self.cache.refresh().await;
        match self.archive.count().await {
            Ok(n) => Metrics::set(&metrics.archive_size, n as u64),
            Err(e) => warn!("error counting archive: {}", e),
        }
        Metrics::set(&metrics.cache_last_processed_seconds, started.elapsed().as_secs());
        info!(
            "Fetched feeds in {:?}: {} feeds, {} twts cached",
            started.elapsed(),
            self.cache.feed_count().await,
            self.cache.twt_count().await
        );
    }

    async fn fetch_feed(&self, feed: &Feed, ua: &str) -> Result<(), FetchError> {
        if let Some(nick) = self.conf().local_feed_name(&feed.url) {
            return self.load_local_feed(nick).await;
        }

        let (url, body, last_modified, limited) = match self.fetch_remote(feed, ua).await? {
            Fetched::NotModified => {
                debug!("Feed {} not modified", feed.url);
                self.cache.update_feed(&feed.url, "", Vec::new()).await;
                return Ok(());
            }
            Fetched::Body {
                url,
                body,
                last_modified,
                limited,
            } => (url, body, last_modified, limited),
        };

        if limited {
            warn!("feed {} exceeds the fetch limit of {} bytes", url, self.conf().max_fetch_limit);
            Metrics::inc(&self.cache.metrics().cache_limited);
        }

        let text = String::from_utf8_lossy(&body);
        let file = parse_file(&text, Twter::new(&feed.nick, &url))?;
        let twter = file.twter().clone();
        self.fetch_avatar(&url, &twter).await;
        self.ingest(&url, &last_modified, file.into_twts()).await;
        Ok(())
    }

    async fn fetch_remote(&self, feed: &Feed, ua: &str) -> Result<Fetched, FetchError> {
        if feed.url.starts_with("gopher://") {
            let (body, limited) =
                gopher::fetch(&feed.url, self.conf().max_fetch_limit, self.conf().request_timeout).await?;
            return Ok(Fetched::Body {
                url: feed.url.clone(),
                body,
                last_modified: String::new(),
                limited,
            });
        }

        let mut req = self.cache.client().get(&feed.url).header(USER_AGENT, ua);
        if let Some(lm) = self.cache.last_modified(&feed.url).await {
            req = req.header(IF_MODIFIED_SINCE, lm);
        }
        let res = req.send().await?;

        let mut url = feed.url.clone();
        let final_url = normalize_url(res.url().as_str());
        if !final_url.is_empty() && final_url != url {
            info!("Feed {} moved to {}", url, final_url);
            self.cache.rekey_feed(&url, &final_url).await;
            url = final_url;
        }

        if let Some(powered_by) = res.headers().get("Powered-By").and_then(|v| v.to_str().ok()) {
            if powered_by.starts_with(SOFTWARE) {
                if let Ok(origin) = Url::parse(&url).map(|u| u.origin().ascii_serialization()) {
                    let cache = self.cache.clone();
                    tokio::spawn(async move { cache.add_peer(&origin).await });
                }
            }
        }

        match res.status() {
            StatusCode::NOT_MODIFIED => return Ok(Fetched::NotModified),
            s if !s.is_success() => return Err(FetchError::Status(s.as_u16())),
            _ => {}
        }

        let last_modified = res
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let (body, limited) = read_limited(res, self.conf().max_fetch_limit).await?;
        Ok(Fetched::Body {
            url,
            body,
            last_modified,
            limited,
        })
    }

    /// Local feeds are read straight from disk.
    async fn load_local_feed(&self, nick: &str) -> Result<(), FetchError> {
        if !self.feeds.exists(nick).await {
            debug!("Local feed {} has no file yet", nick);
            return Ok(());
        }
        let text = self.feeds.read(nick).await.map_err(std::io::Error::other)?;
        let url = self.conf().url_for_user(nick);
        let twts = match parse_file(&text, self.conf().local_twter(nick)) {
            Ok(file) => file.into_twts(),
            Err(e) => {
                warn!("local feed {} is unreadable: {}", nick, e);
                return Ok(());
            }
        };
        self.ingest(&url, "", twts).await;
        Ok(())
    }

    /// Split, archive and cache freshly parsed twts.
    async fn ingest(&self, url: &str, last_modified: &str, twts: Vec<Twt>) {
        let conf = self.conf();
        let ttl = TimeDelta::from_std(conf.max_cache_ttl).unwrap_or(TimeDelta::days(10));
        let split = split_twts(twts, ttl, conf.max_cache_items, Utc::now());

        for twt in &split.future {
            warn!(
                "feed {} has a twt from the future ({}), possible misconfigured timezone",
                url,
                twt.created()
            );
        }
        for twt in split.old.iter().chain(&split.current) {
            self.archive_twt(twt).await;
        }
        self.cache.update_feed(url, last_modified, split.current).await;
    }

    pub(crate) async fn archive_twt(&self, twt: &Twt) {
        if self.archive.has(twt.hash()).await {
            return;
        }
        if let Err(e) = self.archive.archive(twt).await {
            warn!("error archiving twt {}: {}", twt.hash(), e);
            Metrics::inc(&self.cache.metrics().archive_errors);
        }
    }

    /// Fetch a remote feed's avatar into the external avatar store.
    async fn fetch_avatar(&self, url: &str, twter: &Twter) {
        if twter.avatar.is_empty() || self.conf().is_local_url(&twter.avatar) {
            return;
        }
        let slug = urls::slugify(url);
        if self.avatars.has(&slug).await {
            return;
        }
        let res = match self.cache.client().get(&twter.avatar).send().await {
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                debug!("avatar {} returned {}", twter.avatar, res.status());
                return;
            }
            Err(e) => {
                debug!("error fetching avatar {}: {}", twter.avatar, e);
                return;
            }
        };
        match read_limited(res, self.conf().max_fetch_limit).await {
            Ok((_, true)) => debug!("avatar {} is too large", twter.avatar),
            Ok((data, false)) => {
                if let Err(e) = self.avatars.store(&slug, &data).await {
                    warn!("error storing avatar for {}: {}", url, e);
                }
            }
            Err(e) => debug!("error reading avatar {}: {}", twter.avatar, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> Config {
        let mut conf = Config {
            base_url: "https://pod.example".into(),
            ..Config::default()
        };
        conf.validate().unwrap();
        conf
    }

    #[test]
    fn user_agent_depends_on_followers() {
        let conf = conf();
        let url = "https://b.example/twtxt.txt";

        let ua = user_agent_for(&conf, url, &[]);
        assert!(ua.contains("(Pod: "));

        let ua = user_agent_for(&conf, url, &["alice".into()]);
        assert!(ua.ends_with("(+https://pod.example/user/alice/twtxt.txt; @alice)"));

        let ua = user_agent_for(&conf, url, &["alice".into(), "bob".into()]);
        assert!(ua.contains("(~https://pod.example/whoFollows?followers=2&uri="));
        assert!(ua.ends_with("; contact=https://pod.example/support)"));
    }
}
