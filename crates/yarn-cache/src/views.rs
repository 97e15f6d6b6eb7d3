use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use yarn_db::Database;
use yarn_types::urls::normalize_url;
use yarn_types::{Config, FmtOpts, Twt};

pub const LOCAL_VIEW: &str = "local";
pub const DISCOVER_VIEW: &str = "discover";
pub const MENTIONS_VIEW: &str = "mentions";

pub fn tag_view(tag: &str) -> String {
    format!("tag:{}", tag.to_lowercase())
}

pub fn subject_view(key: &str) -> String {
    format!("subject:{}", key.to_lowercase())
}

/// Per-user copies of global views live apart from the global keys.
pub(crate) fn user_view_prefix(username: &str) -> String {
    format!("uview:{username}:")
}

/// Keys built by [`Cache::refresh`](crate::Cache::refresh); the only ones
/// safe to serve without knowing who is asking.
pub fn is_global_view(key: &str) -> bool {
    key == LOCAL_VIEW || key == DISCOVER_VIEW || key.starts_with("tag:") || key.starts_with("subject:")
}

/// Aggregators and the pod's own bots stay out of `discover`.
pub(crate) fn is_discoverable(conf: &Config, twt: &Twt) -> bool {
    let uri = &twt.twter().uri;
    !conf.is_aggregator(uri) && !conf.is_automated_feed(uri)
}

pub(crate) fn is_local(conf: &Config, twt: &Twt) -> bool {
    conf.is_local_url(&twt.twter().uri)
}

/// Lowercased, de-duplicated tag keys of a twt.
pub(crate) fn tag_keys(twt: &Twt) -> Vec<String> {
    let mut seen = HashSet::new();
    twt.tags()
        .iter()
        .map(|t| t.resolved().to_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// What a per-user view needs to know about its user.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub username: String,
    /// The user's own feed URI.
    pub uri: String,
    /// Followed feeds plus the user's own feeds, normalised.
    pub sources: BTreeSet<String>,
    /// Muted feed URIs and twt hashes.
    pub muted: HashSet<String>,
}

impl UserContext {
    pub fn new(username: &str, uri: &str) -> Self {
        let uri = normalize_url(uri);
        Self {
            username: username.to_owned(),
            sources: BTreeSet::from([uri.clone()]),
            uri,
            muted: HashSet::new(),
        }
    }

    pub fn load(db: &Database, conf: &Config, username: &str) -> Result<Self> {
        let mut ctx = Self::new(username, &conf.url_for_user(username));
        for feed in db.get_feeds_owned_by(username)? {
            ctx.sources.insert(normalize_url(&conf.url_for_user(&feed)));
        }
        for follow in db.get_following(username)? {
            ctx.sources.insert(normalize_url(&follow.url));
        }
        ctx.muted = db.get_muted(username)?.into_iter().collect();
        Ok(ctx)
    }

    pub fn follow(mut self, uri: &str) -> Self {
        self.sources.insert(normalize_url(uri));
        self
    }

    pub fn mute(mut self, key: &str) -> Self {
        self.muted.insert(key.to_owned());
        self
    }

    pub fn is_muted(&self, twt: &Twt) -> bool {
        self.muted.contains(&twt.twter().uri) || self.muted.contains(twt.hash())
    }

    pub fn is_mentioned(&self, twt: &Twt) -> bool {
        twt.mentions().iter().any(|m| normalize_url(m.target()) == self.uri)
    }

    pub(crate) fn user_key(&self) -> String {
        format!("user:{}", self.username)
    }

    pub(crate) fn mentions_key(&self) -> String {
        format!("mentions:{}", self.username)
    }

    pub(crate) fn view_key(&self, view: &str) -> String {
        format!("{}{}", user_view_prefix(&self.username), view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use yarn_types::Twter;

    fn twt(uri: &str, text: &str) -> Twt {
        Twt::make(
            Twter::new("x", uri),
            DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap(),
            text,
        )
    }

    #[test]
    fn discover_hides_bots_and_aggregators() {
        let mut conf = Config {
            base_url: "https://pod.example".into(),
            ..Config::default()
        };
        conf.validate().unwrap();
        assert!(!is_discoverable(&conf, &twt("https://feeds.twtxt.net/x/twtxt.txt", "hi")));
        assert!(!is_discoverable(&conf, &twt("https://pod.example/user/stats/twtxt.txt", "hi")));
        assert!(is_discoverable(&conf, &twt("https://pod.example/user/alice/twtxt.txt", "hi")));
    }

    #[test]
    fn tags_are_lowercased_once() {
        assert_eq!(tag_keys(&twt("https://a.example", "#Rust and #rust and #go")), vec!["rust", "go"]);
    }

    #[test]
    fn global_views_are_told_apart() {
        for key in ["local", "discover", "tag:yarn", "subject:(#abcdefg)"] {
            assert!(is_global_view(key), "{key}");
        }
        for key in ["user:alice", "mentions:alice", "uview:tag:local", "alice:discover"] {
            assert!(!is_global_view(key), "{key}");
        }
        assert_eq!(UserContext::new("tag", "https://a.example").view_key("local"), "uview:tag:local");
    }

    #[test]
    fn mentions_and_mutes() {
        let ctx = UserContext::new("alice", "https://pod.example/user/alice/twtxt.txt/").mute("https://spam.example");
        let hello = twt("https://b.example", "@<alice https://pod.example/user/alice/twtxt.txt> hello");
        assert!(ctx.is_mentioned(&hello));
        assert!(ctx.is_muted(&twt("https://spam.example", "buy")));
        assert!(!ctx.is_muted(&hello));
    }
}
