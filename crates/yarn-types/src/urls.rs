//! URL helpers shared by the cache, the jobs and the server.

use url::Url;

use crate::{SOFTWARE, VERSION};

/// Canonical form of a feed URL: no credentials, fragment, default port or
/// trailing slash. Returns an empty string for unparseable input.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let Ok(mut url) = Url::parse(raw) else {
        return String::new();
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);

    let path = url.path().trim_end_matches('/').to_owned();
    if !path.is_empty() {
        url.set_path(&path);
    }

    let mut out: String = url.into();
    if !out.contains('?') && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Base URL with any trailing slash removed.
pub fn trim_base(base: &str) -> &str {
    base.trim_end_matches('/')
}

pub fn url_for_user(base: &str, nick: &str) -> String {
    format!("{}/user/{}/twtxt.txt", trim_base(base), nick)
}

pub fn url_for_twt(base: &str, hash: &str) -> String {
    format!("{}/twt/{}", trim_base(base), hash)
}

pub fn url_for_task(base: &str, id: &str) -> String {
    format!("{}/task/{}", trim_base(base), id)
}

pub fn url_for_tag(base: &str, tag: &str) -> String {
    format!("{}/search?tag={}", trim_base(base), tag)
}

pub fn url_for_avatar(base: &str, nick: &str) -> String {
    format!("{}/user/{}/avatar", trim_base(base), nick)
}

pub fn url_for_who_follows(base: &str, uri: &str, followers: usize) -> String {
    let mut url = format!("{}/whoFollows", trim_base(base));
    if let Ok(mut parsed) = Url::parse(&url) {
        parsed
            .query_pairs_mut()
            .append_pair("followers", &followers.to_string())
            .append_pair("uri", uri);
        url = parsed.into();
    }
    url
}

/// Pod origin of a feed served at `<base>/user/<nick>/twtxt.txt`.
pub fn pod_base_from_feed(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let base = url.join("../..").ok()?;
    Some(normalize_url(base.as_str()))
}

/// `host-path` style identifier safe for use as a file name.
pub fn slugify(uri: &str) -> String {
    let stripped = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(uri);
    let mut slug = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_owned()
}

// ── User agents ─────────────────────────────────────────────────────────

/// UA sent when exactly one local user follows the feed.
pub fn single_user_agent(profile_url: &str, nick: &str) -> String {
    format!("{SOFTWARE}/{VERSION} (+{profile_url}; @{nick})")
}

/// UA sent when several local users follow the feed.
pub fn multi_user_agent(who_follows_url: &str, support_url: &str) -> String {
    format!("{SOFTWARE}/{VERSION} (~{who_follows_url}; contact={support_url})")
}

/// UA sent when no local user follows the feed.
pub fn pod_user_agent(name: &str, support_url: &str) -> String {
    format!("{SOFTWARE}/{VERSION} (Pod: {name} Support: {support_url})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_urls() {
        assert_eq!(normalize_url("https://user:pw@Example.com:443/twtxt.txt#x"), "https://example.com/twtxt.txt");
        assert_eq!(normalize_url("http://example.com:80/"), "http://example.com");
        assert_eq!(normalize_url("https://example.com/feeds/"), "https://example.com/feeds");
        assert_eq!(normalize_url("https://example.com:8443/a?b=c"), "https://example.com:8443/a?b=c");
        assert_eq!(normalize_url("not a url"), "");
    }

    #[test]
    fn pod_base_from_user_feed() {
        assert_eq!(
            pod_base_from_feed("https://example.com/user/bar/twtxt.txt").as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify("https://example.com/~bob/twtxt.txt"), "example-com-bob-twtxt-txt");
    }

    #[test]
    fn who_follows_url_is_encoded() {
        assert_eq!(
            url_for_who_follows("https://pod.example/", "https://x.example/twtxt.txt", 2),
            "https://pod.example/whoFollows?followers=2&uri=https%3A%2F%2Fx.example%2Ftwtxt.txt"
        );
    }

    #[test]
    fn user_agents() {
        assert_eq!(
            single_user_agent("https://pod.example/user/bob", "bob"),
            format!("yarnd/{VERSION} (+https://pod.example/user/bob; @bob)")
        );
    }
}
