use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{FixedOffset, SecondsFormat, TimeDelta, Utc};
use data_encoding::BASE32_NOPAD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::format::{FmtOpts, Format, render};
use crate::lextwt::{self, DateTime, Elem, Link, Mention, Subject, Tag, expand_mentions};

/// Length of the short twt hash.
pub const HASH_LENGTH: usize = 7;

// ── Twter ───────────────────────────────────────────────────────────────

/// A feed author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Twter {
    pub nick: String,
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hashing_uri: String,
    pub avatar: String,
    pub tagline: String,
    pub following: usize,
    pub followers: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub follow: BTreeMap<String, Twter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Vec<String>>,
}

impl Twter {
    pub fn new(nick: &str, uri: &str) -> Self {
        Self {
            nick: nick.to_owned(),
            uri: uri.to_owned(),
            ..Default::default()
        }
    }

    /// URI used for hashing; falls back to `uri`.
    pub fn hashing_uri(&self) -> &str {
        if self.hashing_uri.is_empty() {
            &self.uri
        } else {
            &self.hashing_uri
        }
    }

    pub fn is_zero(&self) -> bool {
        self.nick.is_empty() && self.uri.is_empty()
    }
}

impl fmt::Display for Twter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.nick, self.uri)
    }
}

/// Resolves a bare nick (or `nick@domain`) to a feed author.
pub trait FeedLookup {
    fn feed_lookup(&self, nick: &str) -> Option<Twter>;
}

impl<F> FeedLookup for F
where
    F: Fn(&str) -> Option<Twter>,
{
    fn feed_lookup(&self, nick: &str) -> Option<Twter> {
        self(nick)
    }
}

// ── Twt ─────────────────────────────────────────────────────────────────

/// A single post. Cheap to clone; never mutated once built.
#[derive(Clone)]
pub struct Twt {
    inner: Arc<TwtInner>,
}

#[derive(Clone)]
struct TwtInner {
    twter: Arc<Twter>,
    created: DateTime,
    elems: Vec<Elem>,
    hash: OnceLock<String>,
}

impl Twt {
    pub(crate) fn from_parts(twter: Arc<Twter>, created: DateTime, elems: Vec<Elem>) -> Self {
        let mut merged: Vec<Elem> = Vec::with_capacity(elems.len());
        for elem in elems {
            if let (Some(Elem::Text(prev)), Elem::Text(next)) = (merged.last_mut(), &elem) {
                prev.push_str(next);
                continue;
            }
            merged.push(elem);
        }
        Self {
            inner: Arc::new(TwtInner {
                twter,
                created,
                elems: merged,
                hash: OnceLock::new(),
            }),
        }
    }

    pub fn new(twter: Twter, created: DateTime, elems: Vec<Elem>) -> Self {
        Self::from_parts(Arc::new(twter), created, elems)
    }

    /// Build a twt from free text, converting line feeds to line separators.
    pub fn make(twter: Twter, at: chrono::DateTime<FixedOffset>, text: &str) -> Self {
        let text = lextwt::normalize_text(text);
        Self::new(twter, DateTime::new(at), lextwt::parse_text(&text))
    }

    pub fn twter(&self) -> &Twter {
        &self.inner.twter
    }

    pub(crate) fn shared_twter(&self) -> &Arc<Twter> {
        &self.inner.twter
    }

    pub(crate) fn with_twter(&self, twter: Arc<Twter>) -> Self {
        let mut inner = (*self.inner).clone();
        inner.twter = twter;
        inner.hash = OnceLock::new();
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn created(&self) -> chrono::DateTime<FixedOffset> {
        self.inner.created.at()
    }

    pub fn created_literal(&self) -> &str {
        self.inner.created.literal()
    }

    pub fn elems(&self) -> &[Elem] {
        &self.inner.elems
    }

    pub fn hash(&self) -> &str {
        self.inner
            .hash
            .get_or_init(|| twt_hash(self.twter().hashing_uri(), &self.created(), &self.literal_text()))
    }

    /// The leading subject, or `(#<own hash>)` when the twt starts a thread.
    pub fn subject(&self) -> Subject {
        self.elems()
            .iter()
            .find_map(|e| match e {
                Elem::Subject(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| Subject::from_hash(self.hash()))
    }

    /// Conversation key used for `subject:` views.
    pub fn subject_key(&self) -> String {
        let subject = self.subject();
        match subject.hash() {
            Some(hash) => hash.to_lowercase(),
            None => subject.to_string().to_lowercase(),
        }
    }

    pub fn mentions(&self) -> Vec<&Mention> {
        self.elems()
            .iter()
            .filter_map(|e| match e {
                Elem::Mention(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn tags(&self) -> Vec<&Tag> {
        self.elems()
            .iter()
            .filter_map(|e| match e {
                Elem::Tag(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn links(&self) -> Vec<&Link> {
        self.elems()
            .iter()
            .filter_map(|e| match e {
                Elem::Link(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    /// The text exactly as it appears after the tab.
    pub fn literal_text(&self) -> String {
        self.elems().iter().map(Elem::literal).collect()
    }

    /// The full feed line, without the trailing line feed.
    pub fn literal(&self) -> String {
        format!("{}\t{}", self.created_literal(), self.literal_text())
    }

    pub fn format(&self, mode: Format, opts: &dyn FmtOpts) -> String {
        match mode {
            Format::Literal => self.literal_text(),
            _ => self.elems().iter().map(|e| render(e, mode, opts)).collect(),
        }
    }

    /// Canonicalise bare mentions. The result has its own hash.
    pub fn expand_mentions(&self, lookup: &dyn FeedLookup) -> Self {
        let elems = expand_mentions(self.elems().to_vec(), lookup);
        Self::from_parts(Arc::clone(&self.inner.twter), self.inner.created.clone(), elems)
    }
}

impl PartialEq for Twt {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Twt {}

impl fmt::Debug for Twt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twt")
            .field("hash", &self.hash())
            .field("nick", &self.twter().nick)
            .field("line", &self.literal())
            .finish()
    }
}

impl fmt::Display for Twt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal())
    }
}

/// BLAKE2b-256 over `hashing_uri \n RFC3339(created) \n text`, base32
/// lowercased without padding, keeping the last seven characters.
pub fn twt_hash(hashing_uri: &str, created: &chrono::DateTime<FixedOffset>, text: &str) -> String {
    let payload = format!(
        "{}\n{}\n{}",
        hashing_uri,
        created.to_rfc3339_opts(SecondsFormat::Secs, true),
        text
    );
    let sum = blake2b_simd::Params::new().hash_length(32).hash(payload.as_bytes());
    let encoded = BASE32_NOPAD.encode(sum.as_bytes()).to_ascii_lowercase();
    encoded[encoded.len() - HASH_LENGTH..].to_owned()
}

// ── Ordering and windows ────────────────────────────────────────────────

/// Newest first; equal instants put the greater hash first.
pub fn cmp_newest_first(a: &Twt, b: &Twt) -> Ordering {
    b.created()
        .cmp(&a.created())
        .then_with(|| b.hash().cmp(a.hash()))
}

pub fn sort_twts(twts: &mut [Twt]) {
    twts.sort_by(cmp_newest_first);
}

/// Sort newest-first and drop repeated hashes, keeping the first seen.
pub fn uniq_twts(mut twts: Vec<Twt>) -> Vec<Twt> {
    let mut seen = std::collections::HashSet::new();
    twts.retain(|t| seen.insert(t.hash().to_owned()));
    sort_twts(&mut twts);
    twts
}

#[derive(Debug, Default)]
pub struct SplitTwts {
    pub future: Vec<Twt>,
    pub current: Vec<Twt>,
    pub old: Vec<Twt>,
}

/// Bucket twts into future, the active window (newest `n` within `ttl`),
/// and everything older.
pub fn split_twts(mut twts: Vec<Twt>, ttl: TimeDelta, n: usize, now: chrono::DateTime<Utc>) -> SplitTwts {
    sort_twts(&mut twts);
    let oldest = now.checked_sub_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let mut out = SplitTwts::default();
    for twt in twts {
        let created = twt.created().with_timezone(&Utc);
        if created > now {
            out.future.push(twt);
        } else if out.current.len() < n && created >= oldest {
            out.current.push(twt);
        } else {
            out.old.push(twt);
        }
    }
    out
}

// ── JSON ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TwtOut<'a> {
    twter: &'a Twter,
    text: String,
    created: String,
    hash: &'a str,
    subject: String,
    mentions: Vec<String>,
    tags: Vec<String>,
    links: Vec<String>,
}

#[derive(Deserialize)]
struct TwtIn {
    twter: Twter,
    text: String,
    created: String,
}

impl Serialize for Twt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TwtOut {
            twter: self.twter(),
            text: self.literal_text(),
            created: self.created().to_rfc3339_opts(SecondsFormat::AutoSi, true),
            hash: self.hash(),
            subject: self.subject().to_string(),
            mentions: self.mentions().iter().map(|m| m.twter().to_string()).collect(),
            tags: self.tags().iter().map(|t| t.resolved()).collect(),
            links: self.links().iter().map(|l| l.target().to_owned()).collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Twt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = TwtIn::deserialize(deserializer)?;
        if raw.text.contains('\n') {
            return Err(D::Error::custom("twt text contains a line feed"));
        }
        let created = lextwt::parse_datetime(&raw.created)
            .ok_or_else(|| D::Error::custom(format!("invalid created timestamp {:?}", raw.created)))?;
        let elems = lextwt::parse_text(&raw.text);
        if elems.is_empty() {
            return Err(D::Error::custom("twt text is empty"));
        }
        Ok(Twt::new(raw.twter, created, elems))
    }
}
