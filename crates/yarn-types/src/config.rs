//! Pod configuration.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::format::FmtOpts;
use crate::twt::Twter;
use crate::urls;

pub const DEFAULT_FEED_SOURCE: &str = "https://feeds.twtxt.net/we-are-feeds.txt";
pub const DEFAULT_FETCH_INTERVAL: &str = "@every 5m";

/// Feeds owned by the admin user and created on startup.
pub const ADMIN_FEEDS: [&str; 4] = ["news", "support", "help", "twtxt"];

/// Feeds written by the pod itself; hidden from the discover view.
pub const AUTOMATED_FEEDS: [&str; 1] = ["stats"];

/// Smallest `@every` fetch interval accepted outside debug mode.
pub const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(59);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid base url {0:?}")]
    InvalidBaseUrl(String),

    #[error("fetch interval {0:?} is below the 59s minimum")]
    FetchIntervalTooShort(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub data: PathBuf,
    pub name: String,
    pub description: String,
    pub debug: bool,
    pub bind: String,
    pub admin_user: String,

    pub max_fetch_limit: u64,
    pub max_cache_ttl: Duration,
    pub max_cache_items: usize,
    pub max_cache_fetchers: usize,
    pub max_converge_requests: usize,
    pub fetch_interval: String,
    pub request_timeout: Duration,
    pub session_expiry: Duration,

    pub whitelisted_images: Vec<Regex>,
    pub blacklisted_feeds: Vec<Regex>,
    pub feed_sources: Vec<String>,
    pub aggregator_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://0.0.0.0:8000".into(),
            data: PathBuf::from("./data"),
            name: "yarnd".into(),
            description: "A twtxt pod".into(),
            debug: false,
            bind: "0.0.0.0:8000".into(),
            admin_user: "admin".into(),
            max_fetch_limit: 1 << 20,
            max_cache_ttl: Duration::from_secs(10 * 86_400),
            max_cache_items: 150,
            max_cache_fetchers: num_cpus::get(),
            max_converge_requests: 32,
            fetch_interval: DEFAULT_FETCH_INTERVAL.into(),
            request_timeout: Duration::from_secs(30),
            session_expiry: Duration::from_secs(7 * 86_400),
            whitelisted_images: Vec::new(),
            blacklisted_feeds: Vec::new(),
            feed_sources: vec![DEFAULT_FEED_SOURCE.into()],
            aggregator_prefixes: vec![
                "https://feeds.twtxt.net".into(),
                "https://search.twtxt.net".into(),
            ],
        }
    }
}

impl Config {
    /// Build a config from `YARN_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = get("YARN_BASE_URL") {
            cfg.base_url = v;
        }
        if let Some(v) = get("YARN_DATA") {
            cfg.data = PathBuf::from(v);
        }
        if let Some(v) = get("YARN_NAME") {
            cfg.name = v;
        }
        if let Some(v) = get("YARN_DESCRIPTION") {
            cfg.description = v;
        }
        if let Some(v) = get("YARN_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = get("YARN_ADMIN_USER") {
            cfg.admin_user = v;
        }
        if let Some(v) = get("YARN_DEBUG") {
            cfg.debug = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("YARN_FETCH_INTERVAL") {
            cfg.fetch_interval = v;
        }
        if let Some(v) = get("YARN_MAX_FETCH_LIMIT") {
            cfg.max_fetch_limit = parse_number("YARN_MAX_FETCH_LIMIT", &v)?;
        }
        if let Some(v) = get("YARN_MAX_CACHE_ITEMS") {
            cfg.max_cache_items = parse_number("YARN_MAX_CACHE_ITEMS", &v)?;
        }
        if let Some(v) = get("YARN_MAX_CACHE_FETCHERS") {
            cfg.max_cache_fetchers = parse_number("YARN_MAX_CACHE_FETCHERS", &v)?;
        }
        if let Some(v) = get("YARN_MAX_CACHE_TTL") {
            cfg.max_cache_ttl = parse_duration(&v).ok_or(ConfigError::InvalidDuration(v))?;
        }
        if let Some(v) = get("YARN_WHITELISTED_IMAGES") {
            cfg.whitelisted_images = compile_patterns(&v)?;
        }
        if let Some(v) = get("YARN_BLACKLISTED_FEEDS") {
            cfg.blacklisted_feeds = compile_patterns(&v)?;
        }
        if let Some(v) = get("YARN_FEED_SOURCES") {
            cfg.feed_sources = split_list(&v).map(str::to_owned).collect();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let base = urls::normalize_url(&self.base_url);
        if base.is_empty() {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        self.base_url = base;

        if let Some(every) = self.fetch_interval.strip_prefix("@every ") {
            let interval = parse_duration(every)
                .ok_or_else(|| ConfigError::InvalidDuration(every.to_owned()))?;
            if interval < MIN_FETCH_INTERVAL && !self.debug {
                return Err(ConfigError::FetchIntervalTooShort(self.fetch_interval.clone()));
            }
        }
        if self.max_cache_fetchers == 0 {
            self.max_cache_fetchers = 1;
        }
        Ok(())
    }

    // -- Paths --

    pub fn feeds_dir(&self) -> PathBuf {
        self.data.join("feeds")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data.join("archive")
    }

    pub fn external_dir(&self) -> PathBuf {
        self.data.join("external")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data.join("cache")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data.join("yarn.db")
    }

    pub fn feed_sources_path(&self) -> PathBuf {
        self.data.join("feedsources.json")
    }

    // -- Identity --

    pub fn support_url(&self) -> String {
        format!("{}/support", self.base_url)
    }

    /// User agent for requests not made on behalf of a single user.
    pub fn user_agent(&self) -> String {
        urls::pod_user_agent(&self.name, &self.support_url())
    }

    pub fn url_for_user(&self, nick: &str) -> String {
        urls::url_for_user(&self.base_url, nick)
    }

    /// Author record of a feed hosted on this pod.
    pub fn local_twter(&self, nick: &str) -> Twter {
        Twter::new(nick, &self.url_for_user(nick))
    }

    /// Local feeds are never blacklisted.
    pub fn is_blacklisted(&self, uri: &str) -> bool {
        !self.is_local_url(uri) && self.blacklisted_feeds.iter().any(|re| re.is_match(uri))
    }

    pub fn is_aggregator(&self, uri: &str) -> bool {
        self.aggregator_prefixes.iter().any(|p| uri.starts_with(p.as_str()))
    }

    /// Local feed name of `uri`, if it is served by this pod.
    pub fn local_feed_name<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let rest = uri.strip_prefix(urls::trim_base(&self.base_url))?;
        let nick = rest.strip_prefix("/user/")?.strip_suffix("/twtxt.txt")?;
        (!nick.is_empty() && !nick.contains('/')).then_some(nick)
    }

    pub fn is_automated_feed(&self, uri: &str) -> bool {
        self.local_feed_name(uri).is_some_and(|n| AUTOMATED_FEEDS.contains(&n))
    }
}

impl FmtOpts for Config {
    fn local_url(&self) -> &str {
        urls::trim_base(&self.base_url)
    }

    fn is_allowed_image(&self, url: &str) -> bool {
        if self.is_local_url(url) {
            return true;
        }
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned)) else {
            return false;
        };
        self.whitelisted_images.iter().any(|re| re.is_match(&host))
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_owned(),
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn compile_patterns(value: &str) -> Result<Vec<Regex>, ConfigError> {
    split_list(value)
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                pattern: p.to_owned(),
                source,
            })
        })
        .collect()
}

/// Parse `30s`, `5m`, `2h`, `10d` or combinations like `1h30m`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return None,
        };
        total = total.checked_add(n.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}
