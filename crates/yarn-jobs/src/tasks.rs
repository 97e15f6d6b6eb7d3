use std::collections::BTreeMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use yarn_cache::{Feed, FetchError, Fetcher};
use yarn_types::urls::normalize_url;

use crate::dispatcher::{Task, TaskData};

/// On-demand fetch of one external feed, dispatched when a user opens a
/// feed the pod does not follow yet.
pub struct FetchFeedTask {
    fetcher: Fetcher,
    feed: Feed,
}

impl FetchFeedTask {
    pub fn new(fetcher: Fetcher, nick: &str, url: &str) -> Self {
        Self {
            fetcher,
            feed: Feed::new(nick, url),
        }
    }
}

#[async_trait]
impl Task for FetchFeedTask {
    fn name(&self) -> &str {
        "FetchFeed"
    }

    async fn run(self: Box<Self>) -> Result<TaskData> {
        let url = normalize_url(&self.feed.url);
        if url.is_empty() {
            bail!("invalid feed url {:?}", self.feed.url);
        }
        let cache = self.fetcher.cache();
        if cache.conf().is_blacklisted(&url) {
            return Err(FetchError::Blacklisted(url).into());
        }

        self.fetcher.fetch_twts(vec![self.feed.clone()], &BTreeMap::new()).await;
        if !cache.is_cached(&url).await {
            bail!("could not fetch feed {}", url);
        }
        let twts = cache.get_by_url(&url).await.len();
        Ok(TaskData::from([
            ("url".to_owned(), url),
            ("twts".to_owned(), twts.to_string()),
        ]))
    }
}
