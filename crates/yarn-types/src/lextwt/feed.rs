use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use crate::error::ParseError;
use crate::twt::{Twt, Twter};

use super::parser::{Line, Parser};

/// A `#` line from a feed preamble, optionally carrying `key = value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    lit: String,
    key: Option<String>,
    value: String,
}

impl Comment {
    pub fn parse(lit: &str) -> Self {
        let content = lit.strip_prefix('#').unwrap_or(lit);
        let (key, value) = match content.split_once('=') {
            Some((key, value)) => {
                let (key, value) = (key.trim(), value.trim());
                if key.is_empty() || key.contains('#') || value.is_empty() {
                    (None, String::new())
                } else {
                    (Some(key.to_owned()), value.to_owned())
                }
            }
            None => (None, String::new()),
        };
        Self {
            lit: lit.to_owned(),
            key,
            value,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }

    pub fn is_metadata(&self) -> bool {
        self.key.is_some()
    }
}

/// Metadata view over a feed's comments.
#[derive(Debug, Clone, Copy)]
pub struct Info<'a> {
    comments: &'a [Comment],
}

impl<'a> Info<'a> {
    pub fn new(comments: &'a [Comment]) -> Self {
        Self { comments }
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.get_all(key).into_iter().next()
    }

    pub fn get_all(&self, key: &str) -> Vec<&'a str> {
        self.comments
            .iter()
            .filter(|c| c.key() == Some(key))
            .map(Comment::value)
            .collect()
    }

    pub fn values(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for c in self.comments {
            if let Some(key) = c.key() {
                out.entry(key.to_owned()).or_default().push(c.value().to_owned());
            }
        }
        out
    }

    /// `follow = nick URL` entries (also accepted as `follows`).
    pub fn following(&self) -> Vec<Twter> {
        self.get_all("follow")
            .into_iter()
            .chain(self.get_all("follows"))
            .filter_map(|value| {
                let mut parts = value.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(nick), Some(uri)) => Some(Twter::new(nick, uri)),
                    _ => None,
                }
            })
            .collect()
    }
}

/// A parsed feed file.
#[derive(Debug, Clone)]
pub struct FeedFile {
    twter: Arc<Twter>,
    authors: Vec<Twter>,
    comments: Vec<Comment>,
    twts: Vec<Twt>,
    errors: usize,
}

impl FeedFile {
    pub fn twter(&self) -> &Twter {
        &self.twter
    }

    /// Distinct authors seen through `@<nick url>\t` overrides.
    pub fn authors(&self) -> &[Twter] {
        &self.authors
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn info(&self) -> Info<'_> {
        Info::new(&self.comments)
    }

    pub fn twts(&self) -> &[Twt] {
        &self.twts
    }

    pub fn into_twts(self) -> Vec<Twt> {
        self.twts
    }

    /// Number of lines that failed to parse.
    pub fn errors(&self) -> usize {
        self.errors
    }
}

/// Parse a whole feed, attributing twts to `twter` unless overridden.
pub fn parse_file(src: &str, twter: Twter) -> Result<FeedFile, ParseError> {
    let default = Arc::new(twter);
    let mut parser = Parser::new(src);

    let mut comments = Vec::new();
    let mut twts = Vec::new();
    let mut authors: Vec<Twter> = Vec::new();
    let mut errors = 0;

    while let Some(line) = parser.parse_line(&default) {
        match line {
            Line::Comment(comment) => comments.push(comment),
            Line::Twt(twt) => {
                let author = twt.twter();
                if author.uri != default.uri && !authors.iter().any(|a| a.uri == author.uri) {
                    authors.push(author.clone());
                }
                twts.push(twt);
            }
            Line::Invalid => errors += 1,
            Line::Blank => {}
        }
    }

    if twts.is_empty() && errors > 0 {
        tracing::debug!("rejecting feed {}: {:?}", default.uri, parser.errors());
        return Err(ParseError::InvalidFeed { errors });
    }

    let mut owner = (*default).clone();
    apply_metadata(&mut owner, Info::new(&comments));
    let owner = Arc::new(owner);

    let twts = twts
        .into_iter()
        .map(|twt| {
            if Arc::ptr_eq(twt.shared_twter(), &default) {
                twt.with_twter(Arc::clone(&owner))
            } else {
                twt
            }
        })
        .collect();

    Ok(FeedFile {
        twter: owner,
        authors,
        comments,
        twts,
        errors,
    })
}

fn apply_metadata(twter: &mut Twter, info: Info<'_>) {
    if let Some(nick) = info.get("nick") {
        twter.nick = nick.to_owned();
    }
    if let Some(url) = info.get("url").or_else(|| info.get("twturl")) {
        if Url::parse(url).is_ok() {
            twter.hashing_uri = url.to_owned();
            if twter.uri.is_empty() {
                twter.uri = url.to_owned();
            }
        }
    }
    if let Some(avatar) = info.get("avatar") {
        twter.avatar = avatar.to_owned();
    }
    if let Some(description) = info.get("description") {
        twter.tagline = description.to_owned();
    }

    for follow in info.following() {
        twter.follow.insert(follow.nick.clone(), follow);
    }
    twter.following = info
        .get("following")
        .and_then(|v| v.parse().ok())
        .unwrap_or(twter.follow.len());
    if let Some(followers) = info.get("followers").and_then(|v| v.parse().ok()) {
        twter.followers = followers;
    }

    twter.metadata = info.values();
}
