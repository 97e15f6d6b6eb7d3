use tracing::warn;
use url::Url;
use yarn_types::{FeedLookup, Twter, urls};

use crate::Database;

/// Resolves bare `@nick` mentions for a posting user: first against the
/// aliases they follow, then against local users and feeds.
pub struct UserFeedLookup<'a> {
    db: &'a Database,
    base_url: &'a str,
    username: Option<&'a str>,
}

impl<'a> UserFeedLookup<'a> {
    pub fn new(db: &'a Database, base_url: &'a str, username: Option<&'a str>) -> Self {
        Self { db, base_url, username }
    }

    fn followed(&self, alias: &str) -> Option<Twter> {
        let username = self.username?;
        let following = match self.db.get_following(username) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("error loading follows of {}: {}", username, e);
                return None;
            }
        };
        let row = following.into_iter().find(|f| f.alias.eq_ignore_ascii_case(alias))?;

        // `nick@domain` aliases resolve to `nick` when the domain matches.
        if let Some((nick, domain)) = row.alias.split_once('@') {
            let host = Url::parse(&row.url).ok().and_then(|u| u.host_str().map(str::to_owned));
            if host.as_deref() == Some(domain) {
                return Some(Twter::new(nick, &row.url));
            }
        }
        Some(Twter::new(&row.alias, &row.url))
    }

    fn local(&self, alias: &str) -> Option<Twter> {
        let name = alias.to_ascii_lowercase();
        let known = self.db.has_user(&name).unwrap_or(false) || self.db.has_feed(&name).unwrap_or(false);
        known.then(|| Twter::new(&name, &urls::url_for_user(self.base_url, &name)))
    }
}

impl FeedLookup for UserFeedLookup<'_> {
    fn feed_lookup(&self, nick: &str) -> Option<Twter> {
        self.followed(nick).or_else(|| self.local(nick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn resolves_follows_then_locals() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.create_user("alice", false, now).unwrap();
        db.create_user("admin", true, now).unwrap();
        db.create_feed("news", "admin", "", now).unwrap();
        db.follow("alice", "bob@b.example", "https://b.example/twtxt.txt").unwrap();
        db.follow("alice", "Carol", "https://c.example/twtxt.txt").unwrap();

        let lookup = UserFeedLookup::new(&db, "https://pod.example", Some("alice"));
        assert_eq!(
            lookup.feed_lookup("bob@b.example"),
            Some(Twter::new("bob", "https://b.example/twtxt.txt"))
        );
        assert_eq!(
            lookup.feed_lookup("carol"),
            Some(Twter::new("Carol", "https://c.example/twtxt.txt"))
        );
        assert_eq!(
            lookup.feed_lookup("News"),
            Some(Twter::new("news", "https://pod.example/user/news/twtxt.txt"))
        );
        assert_eq!(lookup.feed_lookup("nobody"), None);
    }
}
