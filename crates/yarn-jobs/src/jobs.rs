//! The pod's scheduled jobs.
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};
use yarn_cache::{FOLLOWER_MAX_AGE, Feed, Metrics};
use yarn_db::models::UserRow;
use yarn_types::config::{ADMIN_FEEDS, AUTOMATED_FEEDS};

use crate::feedsources::fetch_feed_sources;
use crate::pod::Pod;
use crate::schedule::{Schedule, ScheduleError};
use crate::scheduler::Scheduler;

const DAY: TimeDelta = TimeDelta::days(1);
const MONTH: TimeDelta = TimeDelta::days(28);

/// Users above this score are reported as prune candidates.
pub const PRUNE_THRESHOLD: i64 = 1200;
const PRUNE_REPORT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    SyncStore,
    UpdateFeeds,
    UpdateFeedSources,
    ActiveUsers,
    DeleteOldSessions,
    Stats,
    RotateFeeds,
    PruneFollowers,
    PruneUsers,
    CreateAdminFeeds,
    CreateAutomatedFeeds,
}

impl Job {
    pub const ALL: [Job; 11] = [
        Job::SyncStore,
        Job::UpdateFeeds,
        Job::UpdateFeedSources,
        Job::ActiveUsers,
        Job::DeleteOldSessions,
        Job::Stats,
        Job::RotateFeeds,
        Job::PruneFollowers,
        Job::PruneUsers,
        Job::CreateAdminFeeds,
        Job::CreateAutomatedFeeds,
    ];

    /// Run once, in this order, before the schedules take over. Special
    /// feeds come first so the first fetch cycle sees them.
    pub const STARTUP: [Job; 6] = [
        Job::CreateAdminFeeds,
        Job::CreateAutomatedFeeds,
        Job::RotateFeeds,
        Job::DeleteOldSessions,
        Job::UpdateFeedSources,
        Job::UpdateFeeds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::SyncStore => "SyncStore",
            Job::UpdateFeeds => "UpdateFeeds",
            Job::UpdateFeedSources => "UpdateFeedSources",
            Job::ActiveUsers => "ActiveUsers",
            Job::DeleteOldSessions => "DeleteOldSessions",
            Job::Stats => "Stats",
            Job::RotateFeeds => "RotateFeeds",
            Job::PruneFollowers => "PruneFollowers",
            Job::PruneUsers => "PruneUsers",
            Job::CreateAdminFeeds => "CreateAdminFeeds",
            Job::CreateAutomatedFeeds => "CreateAutomatedFeeds",
        }
    }

    /// Schedule expression, or `None` for startup-only jobs.
    pub fn spec(self, fetch_interval: &str) -> Option<&str> {
        match self {
            Job::SyncStore => Some("@every 1m"),
            Job::UpdateFeeds => Some(fetch_interval),
            Job::UpdateFeedSources => Some("@every 15m"),
            Job::ActiveUsers | Job::DeleteOldSessions => Some("@hourly"),
            Job::Stats => Some("@daily"),
            Job::RotateFeeds => Some("0 0 1 * * Sun"),
            Job::PruneFollowers => Some("0 0 2 * * Sun"),
            Job::PruneUsers => Some("0 0 3 * * Sun"),
            Job::CreateAdminFeeds | Job::CreateAutomatedFeeds => None,
        }
    }

    pub async fn run(self, pod: &Pod) -> Result<()> {
        match self {
            Job::SyncStore => pod.db.sync(),
            Job::UpdateFeeds => update_feeds(pod).await,
            Job::UpdateFeedSources => update_feed_sources(pod).await,
            Job::ActiveUsers => active_users(pod),
            Job::DeleteOldSessions => {
                let n = pod.db.delete_expired_sessions(Utc::now())?;
                if n > 0 {
                    info!("Deleted {} expired sessions", n);
                }
                Ok(())
            }
            Job::Stats => stats(pod).await,
            Job::RotateFeeds => rotate_feeds(pod).await,
            Job::PruneFollowers => {
                let n = pod.cache.prune_followers(FOLLOWER_MAX_AGE).await;
                info!("Pruned {} stale followers", n);
                Ok(())
            }
            Job::PruneUsers => prune_users(pod).await,
            Job::CreateAdminFeeds => ensure_feeds(pod, &ADMIN_FEEDS, "Pod announcements").await,
            Job::CreateAutomatedFeeds => ensure_feeds(pod, &AUTOMATED_FEEDS, "Automated pod feed").await,
        }
    }

    /// Run and log the outcome. Scheduled jobs never propagate errors.
    pub async fn run_logged(self, pod: &Pod) {
        let started = Instant::now();
        match self.run(pod).await {
            Ok(()) => info!("Job {} finished in {:?}", self.name(), started.elapsed()),
            Err(e) => warn!("job {} failed: {:#}", self.name(), e),
        }
    }
}

/// Run the startup subset in order.
pub async fn run_startup(pod: &Pod) {
    for job in Job::STARTUP {
        job.run_logged(pod).await;
    }
}

/// Register every scheduled job with `scheduler`.
pub fn register(pod: &Pod, scheduler: &mut Scheduler) -> Result<(), ScheduleError> {
    for job in Job::ALL {
        let Some(spec) = job.spec(&pod.conf.fetch_interval) else {
            continue;
        };
        let schedule = Schedule::parse(spec)?;
        let pod = pod.clone();
        scheduler.add(job.name(), schedule, move || {
            let pod = pod.clone();
            async move { job.run_logged(&pod).await }
        });
    }
    Ok(())
}

/// Everything a fetch cycle pulls: every local feed, special feeds
/// included, and every user's follows.
pub async fn feed_sources(pod: &Pod) -> Result<Vec<Feed>> {
    let conf = &pod.conf;
    let mut sources = Vec::new();
    for nick in pod.feeds.get_all_feeds().await? {
        sources.push(Feed::new(&nick, &conf.url_for_user(&nick)));
    }
    for user in pod.db.get_all_users()? {
        for follow in pod.db.get_following(&user.username)? {
            sources.push(Feed::new(&follow.alias, &follow.url));
        }
    }
    Ok(sources)
}

async fn update_feeds(pod: &Pod) -> Result<()> {
    let sources = feed_sources(pod).await?;
    let hints = pod.db.get_followed_feeds()?;
    pod.fetcher.fetch_twts(sources, &hints).await;

    let found = pod.fetcher.converge().await;
    if found > 0 {
        info!("Converged {} missing twts", found);
    }
    pod.cache.store(&pod.conf.cache_path()).await
}

async fn update_feed_sources(pod: &Pod) -> Result<()> {
    let conf = &pod.conf;
    info!("Updating {} feed sources", conf.feed_sources.len());
    let sources = fetch_feed_sources(pod.cache.client(), &conf.feed_sources, conf.max_fetch_limit).await;
    info!("Found {} feeds from feed sources", sources.len());
    sources.save(&conf.feed_sources_path()).await
}

fn active_users(pod: &Pod) -> Result<()> {
    let now = Utc::now();
    let dau = pod.db.count_active_users(now - DAY)?;
    let mau = pod.db.count_active_users(now - MONTH)?;
    let metrics = pod.cache.metrics();
    Metrics::set(&metrics.server_dau, dau as u64);
    Metrics::set(&metrics.server_mau, mau as u64);
    info!("Active users: {} daily, {} monthly", dau, mau);
    Ok(())
}

/// Figures posted by the `Stats` job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStats {
    pub users: usize,
    pub feeds: usize,
    pub twts: usize,
    pub archived: usize,
    pub cached: usize,
    pub followers: usize,
    pub following: usize,
}

impl PodStats {
    pub async fn collect(pod: &Pod) -> Result<Self> {
        let mut twts = 0;
        for nick in pod.feeds.get_all_feeds().await? {
            match pod.feeds.count_twts(&pod.conf.local_twter(&nick)).await {
                Ok(n) => twts += n,
                Err(e) => warn!("error counting twts of {}: {:#}", nick, e),
            }
        }
        Ok(Self {
            users: pod.db.count_users()?,
            feeds: pod.db.get_all_feeds()?.len(),
            twts,
            archived: pod.archive.count().await?,
            cached: pod.cache.twt_count().await,
            followers: pod.cache.follower_count().await,
            following: pod.db.get_followed_feeds()?.values().map(Vec::len).sum(),
        })
    }

    pub fn text(&self) -> String {
        format!(
            "🧮 USERS:{} FEEDS:{} TWTS:{} ARCHIVED:{} CACHE:{} FOLLOWERS:{} FOLLOWING:{}",
            self.users, self.feeds, self.twts, self.archived, self.cached, self.followers, self.following
        )
    }
}

async fn stats(pod: &Pod) -> Result<()> {
    let text = PodStats::collect(pod).await?.text();
    pod.publisher
        .publish(&pod.conf.admin_user, Some(AUTOMATED_FEEDS[0]), &text, None)
        .await?;
    info!("Posted stats: {}", text);
    Ok(())
}

async fn rotate_feeds(pod: &Pod) -> Result<()> {
    let mut rotated = 0;
    for nick in pod.feeds.get_all_feeds().await? {
        match pod.feeds.rotate(&nick, pod.conf.max_fetch_limit).await {
            Ok(true) => rotated += 1,
            Ok(false) => {}
            Err(e) => warn!("error rotating feed {}: {:#}", nick, e),
        }
    }
    info!("Rotated {} feeds", rotated);
    Ok(())
}

/// How prunable an account looks; higher is more dormant.
pub fn prune_score(
    twt_count: usize,
    last_twt: Option<DateTime<Utc>>,
    following: usize,
    tagline: &str,
    avatar_hash: &str,
    now: DateTime<Utc>,
) -> i64 {
    let mut score: i64 = 1000;
    if twt_count == 0 {
        score *= 2;
    }
    score += match last_twt {
        Some(at) => ((now - at).num_days().max(0) % 100) * 10,
        None => 990,
    };
    if following == 1 {
        score += 1;
    }
    if tagline.is_empty() {
        score += 1;
    }
    if avatar_hash.is_empty() {
        score += 1;
    }
    score
}

async fn score_user(pod: &Pod, user: &UserRow, now: DateTime<Utc>) -> Result<i64> {
    let twter = pod.conf.local_twter(&user.username);
    let twt_count = pod.feeds.count_twts(&twter).await?;
    let last_twt = pod
        .feeds
        .get_last_twt(&twter)
        .await?
        .map(|(twt, _)| twt.created().to_utc());
    let following = pod.db.get_following(&user.username)?.len();
    Ok(prune_score(twt_count, last_twt, following, &user.tagline, &user.avatar_hash, now))
}

async fn prune_users(pod: &Pod) -> Result<()> {
    let now = Utc::now();
    let mut candidates = Vec::new();
    for user in pod.db.get_all_users()? {
        match score_user(pod, &user, now).await {
            Ok(score) if score > PRUNE_THRESHOLD => candidates.push((score, user.username)),
            Ok(_) => {}
            Err(e) => warn!("error scoring user {}: {:#}", user.username, e),
        }
    }
    if candidates.is_empty() {
        info!("No users to prune");
        return Ok(());
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates.truncate(PRUNE_REPORT_LIMIT);
    let body = candidates
        .iter()
        .map(|(score, name)| format!("{name} ({score})"))
        .collect::<Vec<_>>()
        .join("\n");
    pod.notifier
        .notify_admin(&format!("{} users may be prunable", candidates.len()), &body)
        .await
}

/// Make sure each named feed has a file and, when the admin account exists,
/// a feed row owned by it.
async fn ensure_feeds(pod: &Pod, names: &[&str], description: &str) -> Result<()> {
    let admin = &pod.conf.admin_user;
    let has_admin = pod.db.has_user(admin)?;
    if !has_admin {
        warn!("admin user {} not found; special feeds get no owner", admin);
    }
    for name in names {
        if !pod.feeds.exists(name).await {
            pod.feeds.create(name).await?;
            info!("Created feed {}", name);
        }
        if has_admin {
            pod.db.create_feed(name, admin, description, Utc::now())?;
        }
    }
    Ok(())
}
