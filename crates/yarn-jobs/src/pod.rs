use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use yarn_cache::{Cache, Fetcher, Publisher};
use yarn_db::Database;
use yarn_storage::{DiskArchive, ExternalAvatars, FeedStore};
use yarn_types::Config;

use crate::dispatcher::Dispatcher;

/// Delivers messages to the pod administrator. Mail delivery lives outside
/// the core; the default just logs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_admin(&self, subject: &str, body: &str) -> Result<()>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_admin(&self, subject: &str, body: &str) -> Result<()> {
        warn!("admin notice: {}\n{}", subject, body);
        Ok(())
    }
}

/// Everything a running pod shares between jobs, tasks and handlers.
#[derive(Clone)]
pub struct Pod {
    pub conf: Arc<Config>,
    pub db: Arc<Database>,
    pub feeds: Arc<FeedStore>,
    pub archive: Arc<DiskArchive>,
    pub cache: Cache,
    pub fetcher: Fetcher,
    pub publisher: Publisher,
    pub dispatcher: Dispatcher,
    pub notifier: Arc<dyn Notifier>,
}

impl Pod {
    /// Open the store, feed files, archive and cache snapshot under
    /// `conf.data`, creating directories as needed.
    pub async fn open(conf: Config) -> Result<Self> {
        let conf = Arc::new(conf);
        tokio::fs::create_dir_all(&conf.data).await?;

        let db = Arc::new(Database::open(&conf.db_path())?);
        let feeds = Arc::new(FeedStore::new(conf.feeds_dir()).await?);
        let archive = Arc::new(DiskArchive::new(conf.archive_dir()).await?);
        let avatars = Arc::new(ExternalAvatars::new(conf.external_dir()).await?);
        let cache = Cache::load(Arc::clone(&conf), &conf.cache_path()).await?;

        let fetcher = Fetcher::new(cache.clone(), Arc::clone(&archive), Arc::clone(&feeds), avatars);
        let publisher = Publisher::new(cache.clone(), Arc::clone(&feeds), Arc::clone(&db));

        info!(
            "Pod {} opened at {} ({} cached feeds)",
            conf.name,
            conf.data.display(),
            cache.feed_count().await
        );
        Ok(Self {
            conf,
            db,
            feeds,
            archive,
            cache,
            fetcher,
            publisher,
            dispatcher: Dispatcher::default(),
            notifier: Arc::new(LogNotifier),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Snapshot the cache and flush the store.
    pub async fn persist(&self) -> Result<()> {
        self.cache.store(&self.conf.cache_path()).await?;
        self.db.sync()?;
        Ok(())
    }
}
