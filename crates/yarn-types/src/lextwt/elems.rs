use std::fmt;

use chrono::{FixedOffset, SecondsFormat};
use url::Url;

use crate::twt::{FeedLookup, Twter};

use super::lexer::LINE_SEPARATOR;

/// A twt timestamp: the instant plus the exact text it was written as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTime {
    at: chrono::DateTime<FixedOffset>,
    lit: String,
}

impl DateTime {
    pub fn new(at: chrono::DateTime<FixedOffset>) -> Self {
        let lit = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        Self { at, lit }
    }

    pub(crate) fn parsed(at: chrono::DateTime<FixedOffset>, lit: &str) -> Self {
        Self {
            at,
            lit: lit.to_owned(),
        }
    }

    pub fn at(&self) -> chrono::DateTime<FixedOffset> {
        self.at
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }
}

/// One inline element of a twt's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elem {
    Text(String),
    LineSeparator,
    Mention(Mention),
    Tag(Tag),
    Subject(Subject),
    Link(Link),
    Code(Code),
}

impl Elem {
    /// The exact source text of this element.
    pub fn literal(&self) -> &str {
        match self {
            Elem::Text(text) => text,
            Elem::LineSeparator => "\u{2028}",
            Elem::Mention(m) => &m.lit,
            Elem::Tag(t) => &t.lit,
            Elem::Subject(s) => &s.lit,
            Elem::Link(l) => &l.lit,
            Elem::Code(c) => &c.lit,
        }
    }

    pub(crate) fn is_blank(&self) -> bool {
        match self {
            Elem::Text(text) => text.chars().all(char::is_whitespace),
            Elem::LineSeparator => true,
            _ => false,
        }
    }
}

// ── Mention ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    name: String,
    domain: String,
    target: String,
    lit: String,
}

impl Mention {
    /// Build a mention in its canonical `@<name target>` form.
    pub fn new(name: &str, target: &str) -> Self {
        let name = name.trim_start_matches('@');
        let lit = match (name.is_empty(), target.is_empty()) {
            (_, true) => format!("@{name}"),
            (true, false) => format!("@<{target}>"),
            (false, false) => format!("@<{name} {target}>"),
        };
        Self {
            name: name.to_owned(),
            domain: String::new(),
            target: target.to_owned(),
            lit,
        }
    }

    pub(crate) fn parsed(name: &str, domain: &str, target: &str, lit: &str) -> Self {
        Self {
            name: name.to_owned(),
            domain: domain.to_owned(),
            target: target.to_owned(),
            lit: lit.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }

    /// Domain as shown to readers: the explicit `@domain` or the target host.
    pub fn display_domain(&self) -> String {
        if !self.domain.is_empty() {
            return self.domain.clone();
        }
        Url::parse(&self.target)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn twter(&self) -> Twter {
        let nick = if self.name.is_empty() {
            self.display_domain()
        } else {
            self.name.clone()
        };
        Twter::new(&nick, &self.target)
    }

    /// Key used to resolve a bare mention: `name` or `name@domain`.
    pub fn lookup_key(&self) -> String {
        if self.domain.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.domain)
        }
    }
}

// ── Tag ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    tag: String,
    target: String,
    lit: String,
}

impl Tag {
    pub fn new(tag: &str, target: &str) -> Self {
        let tag = tag.trim_start_matches('#');
        let lit = match (tag.is_empty(), target.is_empty()) {
            (_, true) => format!("#{tag}"),
            (true, false) => format!("#<{target}>"),
            (false, false) => format!("#<{tag} {target}>"),
        };
        Self {
            tag: tag.to_owned(),
            target: target.to_owned(),
            lit,
        }
    }

    pub(crate) fn parsed(tag: &str, target: &str, lit: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            target: target.to_owned(),
            lit: lit.to_owned(),
        }
    }

    pub fn text(&self) -> &str {
        &self.tag
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }

    /// The tag text, or the `tag=` query parameter of a target-only tag.
    pub fn resolved(&self) -> String {
        if !self.tag.is_empty() {
            return self.tag.clone();
        }
        Url::parse(&self.target)
            .ok()
            .and_then(|u| {
                u.query_pairs()
                    .find(|(k, _)| k == "tag")
                    .map(|(_, v)| v.into_owned())
            })
            .unwrap_or_default()
    }
}

// ── Subject ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectKind {
    Tag(Tag),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    kind: SubjectKind,
    lit: String,
}

impl Subject {
    /// A `(#hash)` subject pointing at a conversation root.
    pub fn from_hash(hash: &str) -> Self {
        let tag = Tag::new(hash, "");
        let lit = format!("({})", tag.literal());
        Self {
            kind: SubjectKind::Tag(tag),
            lit,
        }
    }

    pub(crate) fn parsed(kind: SubjectKind, lit: &str) -> Self {
        Self {
            kind,
            lit: lit.to_owned(),
        }
    }

    pub fn kind(&self) -> &SubjectKind {
        &self.kind
    }

    pub fn tag(&self) -> Option<&Tag> {
        match &self.kind {
            SubjectKind::Tag(tag) => Some(tag),
            SubjectKind::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            SubjectKind::Text(text) => Some(text),
            SubjectKind::Tag(_) => None,
        }
    }

    /// The conversation hash this subject refers to, if it is a tag subject.
    pub fn hash(&self) -> Option<String> {
        self.tag().map(Tag::resolved).filter(|h| !h.is_empty())
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SubjectKind::Tag(tag) => write!(f, "(#{})", tag.resolved()),
            SubjectKind::Text(text) => write!(f, "({text})"),
        }
    }
}

// ── Link ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// `[text](target "title")`
    Standard,
    /// `![alt](target "title")`
    Media,
    /// `<target>`
    Plain,
    /// `scheme://target`
    Naked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    kind: LinkKind,
    text: String,
    target: String,
    title: String,
    lit: String,
}

impl Link {
    pub fn new(kind: LinkKind, text: &str, target: &str, title: &str) -> Self {
        let title_part = if title.is_empty() {
            String::new()
        } else {
            format!(" {title}")
        };
        let lit = match kind {
            LinkKind::Standard => format!("[{text}]({target}{title_part})"),
            LinkKind::Media => format!("![{text}]({target}{title_part})"),
            LinkKind::Plain => format!("<{target}>"),
            LinkKind::Naked => target.to_owned(),
        };
        Self::parsed(kind, text, target, title, &lit)
    }

    pub(crate) fn parsed(kind: LinkKind, text: &str, target: &str, title: &str, lit: &str) -> Self {
        Self {
            kind,
            text: text.to_owned(),
            target: target.to_owned(),
            title: title.to_owned(),
            lit: lit.to_owned(),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Title with its surrounding quotes, as written.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Title without quotes and with backslash escapes resolved.
    pub fn title_text(&self) -> String {
        let inner = self
            .title
            .strip_prefix(['"', '\''])
            .and_then(|t| t.strip_suffix(['"', '\'']))
            .unwrap_or(&self.title);
        unescape(inner)
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

// ── Code ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Inline,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    kind: CodeKind,
    text: String,
    lit: String,
}

impl Code {
    pub(crate) fn parse(lit: &str) -> Self {
        let kind = if lit.starts_with("```") && lit.len() > 3 {
            CodeKind::Block
        } else {
            CodeKind::Inline
        };
        Self {
            kind,
            text: lit.trim_matches('`').to_owned(),
            lit: lit.to_owned(),
        }
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn literal(&self) -> &str {
        &self.lit
    }
}

/// Rewrite bare `@nick` mentions into `@<nick URL>` using `lookup`.
///
/// Mentions that already carry a target, or that the lookup cannot resolve,
/// pass through untouched.
pub fn expand_mentions(elems: Vec<Elem>, lookup: &dyn FeedLookup) -> Vec<Elem> {
    elems
        .into_iter()
        .map(|elem| match elem {
            Elem::Mention(m) if m.target.is_empty() => match lookup.feed_lookup(&m.lookup_key()) {
                Some(twter) if !twter.uri.is_empty() => Elem::Mention(Mention::new(&twter.nick, &twter.uri)),
                _ => Elem::Mention(m),
            },
            other => other,
        })
        .collect()
}

/// Convert literal line feeds into line separators and trim the ends.
pub fn normalize_text(text: &str) -> String {
    text.trim()
        .replace("\r\n", "\n")
        .replace('\n', &LINE_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_literals() {
        assert_eq!(Mention::new("@asdf", "").literal(), "@asdf");
        assert_eq!(
            Mention::new("xuu", "https://sour.is/twtxt.txt").literal(),
            "@<xuu https://sour.is/twtxt.txt>"
        );
        assert_eq!(Tag::new("#tag", "").literal(), "#tag");
        assert_eq!(Tag::new("", "https://x.org").literal(), "#<https://x.org>");
        assert_eq!(Subject::from_hash("abcdefg").literal(), "(#abcdefg)");
        assert_eq!(
            Link::new(LinkKind::Media, "alt", "https://x.org/a.png", "\"title\"").literal(),
            "![alt](https://x.org/a.png \"title\")"
        );
    }

    #[test]
    fn subject_hash_from_target() {
        let tag = Tag::parsed("", "https://twtxt.net/search?tag=hrqg53a", "#<https://twtxt.net/search?tag=hrqg53a>");
        let subject = Subject::parsed(SubjectKind::Tag(tag), "");
        assert_eq!(subject.hash().as_deref(), Some("hrqg53a"));
        assert_eq!(subject.to_string(), "(#hrqg53a)");
    }

    #[test]
    fn link_title_unescapes() {
        let link = Link::new(LinkKind::Standard, "a", "https://x.org", r#""say \"hi\"""#);
        assert_eq!(link.title_text(), r#"say "hi""#);
    }

    #[test]
    fn expand_resolves_bare_mentions_only() {
        let lookup = |nick: &str| (nick == "asdf").then(|| Twter::new("asdf", "https://pod.example/user/asdf/twtxt.txt"));
        let elems = vec![
            Elem::Mention(Mention::new("@asdf", "")),
            Elem::Text(" ".into()),
            Elem::Mention(Mention::new("nobody", "")),
        ];
        let expanded = expand_mentions(elems, &lookup);
        assert_eq!(expanded[0].literal(), "@<asdf https://pod.example/user/asdf/twtxt.txt>");
        assert_eq!(expanded[2].literal(), "@nobody");
    }

    #[test]
    fn normalize_text_uses_line_separators() {
        assert_eq!(normalize_text("  one\r\ntwo\nthree  "), "one\u{2028}two\u{2028}three");
    }
}
