use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use tracing::{info, warn};
use yarn_db::{Database, UserFeedLookup};
use yarn_storage::FeedStore;
use yarn_types::Twt;
use yarn_types::config::{ADMIN_FEEDS, AUTOMATED_FEEDS};
use yarn_types::urls::normalize_url;

use crate::cache::Cache;
use crate::error::PublishError;
use crate::views::UserContext;

/// The single post path shared by every front-end: append to disk, make the
/// twt visible in the cache at once, and drop the author's stale views.
#[derive(Clone)]
pub struct Publisher {
    cache: Cache,
    feeds: Arc<FeedStore>,
    db: Arc<Database>,
}

impl Publisher {
    pub fn new(cache: Cache, feeds: Arc<FeedStore>, db: Arc<Database>) -> Self {
        Self { cache, feeds, db }
    }

    /// Feed `username` posts to: their own, or `feed` if they may use it.
    fn target(&self, username: &str, feed: Option<&str>) -> Result<String, PublishError> {
        let Some(feed) = feed.filter(|f| *f != username) else {
            return Ok(username.to_owned());
        };
        let owned = self
            .db
            .get_feed(feed)?
            .is_some_and(|row| row.owner == username);
        let special = ADMIN_FEEDS.contains(&feed) || AUTOMATED_FEEDS.contains(&feed);
        let admin = username == self.cache.conf().admin_user
            || self.db.get_user(username)?.is_some_and(|u| u.is_admin);
        if owned || (special && admin) {
            Ok(feed.to_owned())
        } else {
            Err(PublishError::Unauthorized {
                user: username.to_owned(),
                feed: feed.to_owned(),
            })
        }
    }

    /// Post `text` as `username`, optionally to one of their other feeds.
    /// `at` keeps an existing timestamp when editing.
    pub async fn publish(
        &self,
        username: &str,
        feed: Option<&str>,
        text: &str,
        at: Option<DateTime<FixedOffset>>,
    ) -> Result<Twt, PublishError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PublishError::EmptyText);
        }
        let nick = self.target(username, feed)?;
        let conf = self.cache.conf();
        let at = at.unwrap_or_else(|| Utc::now().trunc_subsecs(0).fixed_offset());

        let twt = {
            let lookup = UserFeedLookup::new(&self.db, &conf.base_url, Some(username));
            Twt::make(conf.local_twter(&nick), at, text).expand_mentions(&lookup)
        };
        if twt.elems().is_empty() {
            return Err(PublishError::EmptyText);
        }

        self.feeds.append_twt(&nick, &twt).await?;
        info!("{} posted twt {} to {}", username, twt.hash(), nick);

        let url = normalize_url(&conf.url_for_user(&nick));
        self.cache.inject_feed(&url, twt.clone()).await;
        self.invalidate(username).await;
        Ok(twt)
    }

    /// Replace the last twt of a feed, keeping its timestamp.
    pub async fn edit_last(&self, username: &str, feed: Option<&str>, text: &str) -> Result<Twt, PublishError> {
        if text.trim().is_empty() {
            return Err(PublishError::EmptyText);
        }
        let nick = self.target(username, feed)?;
        let twter = self.cache.conf().local_twter(&nick);
        let Some((last, _)) = self.feeds.get_last_twt(&twter).await? else {
            return Err(PublishError::NothingToEdit(nick));
        };

        self.delete_last(username, Some(&nick)).await?;
        self.publish(username, Some(&nick), text, Some(last.created())).await
    }

    /// Remove the last twt of a feed, if it has one.
    pub async fn delete_last(&self, username: &str, feed: Option<&str>) -> Result<Option<Twt>, PublishError> {
        let nick = self.target(username, feed)?;
        let conf = self.cache.conf();
        let Some(twt) = self.feeds.delete_last_twt(&conf.local_twter(&nick)).await? else {
            return Ok(None);
        };

        let url = normalize_url(&conf.url_for_user(&nick));
        self.cache.remove_twt(&url, twt.hash()).await;
        self.invalidate(username).await;
        Ok(Some(twt))
    }

    /// Drop the author's views and rebuild their timeline straight away.
    async fn invalidate(&self, username: &str) {
        self.cache.delete_user_views(username).await;
        self.cache.refresh().await;
        match UserContext::load(&self.db, self.cache.conf(), username) {
            Ok(user) => {
                self.cache.get_by_user(&user, true).await;
            }
            Err(e) => warn!("error loading {} to rebuild their timeline: {:#}", username, e),
        }
    }
}
