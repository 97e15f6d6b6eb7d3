//! Rendering of twt elements as plain text, Markdown and HTML.

use url::Url;

use crate::lextwt::{CodeKind, Elem, Link, LinkKind, Mention, SubjectKind, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Exact feed text.
    Literal,
    /// Plain text with `@nick` mentions.
    Text,
    Markdown,
    Html,
}

/// Pod-specific URL knowledge needed to render links.
pub trait FmtOpts {
    /// Public base URL of this pod, without a trailing slash.
    fn local_url(&self) -> &str;

    fn is_local_url(&self, url: &str) -> bool {
        let base = self.local_url();
        !base.is_empty() && url.starts_with(base)
    }

    /// Profile page for a feed URI.
    fn user_url(&self, uri: &str) -> String {
        uri.strip_suffix("/twtxt.txt").unwrap_or(uri).to_owned()
    }

    /// Local page that renders an external feed.
    fn external_url(&self, nick: &str, uri: &str) -> String {
        let mut url = format!("{}/external", self.local_url());
        if let Ok(mut parsed) = Url::parse(&url) {
            parsed.query_pairs_mut().append_pair("uri", uri).append_pair("nick", nick);
            url = parsed.into();
        }
        url
    }

    fn url_for_tag(&self, tag: &str) -> String {
        format!("{}/search?tag={}", self.local_url(), tag)
    }

    fn url_for_user(&self, user: &str) -> String {
        format!("{}/user/{}/twtxt.txt", self.local_url(), user)
    }

    /// Whether media from `url` may be inlined as an image.
    fn is_allowed_image(&self, url: &str) -> bool {
        self.is_local_url(url)
    }
}

pub(crate) fn render(elem: &Elem, mode: Format, opts: &dyn FmtOpts) -> String {
    match mode {
        Format::Literal => elem.literal().to_owned(),
        Format::Text => render_text(elem),
        Format::Markdown => render_markdown(elem, opts),
        Format::Html => render_html(elem, opts),
    }
}

fn render_text(elem: &Elem) -> String {
    match elem {
        Elem::Text(text) => text.clone(),
        Elem::LineSeparator => "\n".into(),
        Elem::Mention(m) => format!("@{}", m.twter().nick),
        Elem::Tag(t) => tag_label(t),
        Elem::Subject(s) => s.to_string(),
        Elem::Link(l) => match l.kind() {
            LinkKind::Plain | LinkKind::Naked => l.target().to_owned(),
            _ => l.literal().to_owned(),
        },
        Elem::Code(c) => c.text().to_owned(),
    }
}

fn tag_label(tag: &Tag) -> String {
    let resolved = tag.resolved();
    if resolved.is_empty() {
        tag.target().to_owned()
    } else {
        format!("#{resolved}")
    }
}

fn tag_url(tag: &Tag, opts: &dyn FmtOpts) -> String {
    if tag.target().is_empty() {
        opts.url_for_tag(tag.text())
    } else {
        tag.target().to_owned()
    }
}

fn mention_url(m: &Mention, opts: &dyn FmtOpts) -> String {
    if opts.is_local_url(m.target()) {
        opts.user_url(m.target())
    } else {
        opts.external_url(&m.twter().nick, m.target())
    }
}

// ── Markdown ────────────────────────────────────────────────────────────

fn render_markdown(elem: &Elem, opts: &dyn FmtOpts) -> String {
    match elem {
        Elem::Text(text) => text.clone(),
        Elem::LineSeparator => "\n".into(),
        Elem::Mention(m) if m.target().is_empty() => m.literal().to_owned(),
        Elem::Mention(m) => {
            let nick = m.twter().nick;
            format!("[@{}]({}#{})", nick, opts.user_url(m.target()), nick)
        }
        Elem::Tag(t) => format!("[{}]({})", tag_label(t), tag_url(t, opts)),
        Elem::Subject(s) => match s.kind() {
            SubjectKind::Tag(t) => format!("({})", render_markdown(&Elem::Tag(t.clone()), opts)),
            SubjectKind::Text(text) => format!("({text})"),
        },
        Elem::Link(l) => match l.kind() {
            LinkKind::Media if !opts.is_allowed_image(l.target()) => {
                format!("[{}]({})", link_label(l), l.target())
            }
            LinkKind::Plain | LinkKind::Naked => format!("<{}>", l.target()),
            _ => l.literal().to_owned(),
        },
        Elem::Code(c) => c.literal().to_owned(),
    }
}

fn link_label(l: &Link) -> &str {
    if l.text().is_empty() { l.target() } else { l.text() }
}

// ── HTML ────────────────────────────────────────────────────────────────

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Only web, gopher, mail and relative targets are rendered as links.
fn safe_href(target: &str) -> Option<&str> {
    match Url::parse(target) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "gopher" | "mailto") => Some(target),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => Some(target),
        Err(_) => None,
    }
}

fn anchor(href: &str, label: &str) -> String {
    match safe_href(href) {
        Some(href) => format!(r#"<a href="{}">{}</a>"#, escape(href), label),
        None => label.to_owned(),
    }
}

fn render_html(elem: &Elem, opts: &dyn FmtOpts) -> String {
    match elem {
        Elem::Text(text) => escape(text),
        Elem::LineSeparator => "<br />".into(),
        Elem::Mention(m) if m.target().is_empty() => escape(m.literal()),
        Elem::Mention(m) => {
            let domain = m.display_domain();
            let mut label = format!("@{}", escape(&m.twter().nick));
            if !domain.is_empty() {
                label.push_str(&format!("<em>@{}</em>", escape(&domain)));
            }
            anchor(&mention_url(m, opts), &label)
        }
        Elem::Tag(t) => anchor(&tag_url(t, opts), &escape(&tag_label(t))),
        Elem::Subject(s) => match s.kind() {
            SubjectKind::Tag(t) => format!("({})", render_html(&Elem::Tag(t.clone()), opts)),
            SubjectKind::Text(text) => format!("({})", escape(text)),
        },
        Elem::Link(l) => render_html_link(l, opts),
        Elem::Code(c) => match c.kind() {
            CodeKind::Inline => format!("<code>{}</code>", escape(c.text())),
            CodeKind::Block => format!("<pre><code>{}</code></pre>", escape(c.text())),
        },
    }
}

fn render_html_link(l: &Link, opts: &dyn FmtOpts) -> String {
    let Some(href) = safe_href(l.target()) else {
        return escape(l.literal());
    };
    match l.kind() {
        LinkKind::Media if opts.is_allowed_image(href) => {
            let mut img = format!(r#"<img alt="{}" src="{}""#, escape(l.text()), escape(href));
            if !l.title().is_empty() {
                img.push_str(&format!(r#" title="{}""#, escape(&l.title_text())));
            }
            img.push_str(" />");
            img
        }
        LinkKind::Standard | LinkKind::Media => anchor(href, &escape(link_label(l))),
        LinkKind::Plain | LinkKind::Naked => anchor(href, &escape(href)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lextwt::parse_line;
    use crate::twt::Twter;

    struct Opts;

    impl FmtOpts for Opts {
        fn local_url(&self) -> &str {
            "http://example.org"
        }
    }

    fn twt(text: &str) -> crate::Twt {
        parse_line(
            &format!("2021-01-01T00:00:00Z\t{text}"),
            &Twter::new("example", "http://example.org/twtxt.txt"),
        )
        .unwrap()
    }

    #[test]
    fn text_mode() {
        let t = twt("@<example http://example.org/twtxt.txt>\u{2028}welcome to twtxt!");
        assert_eq!(t.format(Format::Text, &Opts), "@example\nwelcome to twtxt!");
    }

    #[test]
    fn markdown_mode() {
        let t = twt("@<example http://example.org/twtxt.txt> #9c913a");
        assert_eq!(
            t.format(Format::Markdown, &Opts),
            "[@example](http://example.org#example) [#9c913a](http://example.org/search?tag=9c913a)"
        );
    }

    #[test]
    fn html_mode() {
        let t = twt("@<example http://example.org/twtxt.txt> <b> `x<y`");
        assert_eq!(
            t.format(Format::Html, &Opts),
            r#"<a href="http://example.org">@example<em>@example.org</em></a> &lt;b&gt; <code>x&lt;y</code>"#
        );
    }

    #[test]
    fn html_media_allow_list() {
        let local = twt("![cat](http://example.org/media/cat.png)");
        assert_eq!(
            local.format(Format::Html, &Opts),
            r#"<img alt="cat" src="http://example.org/media/cat.png" />"#
        );
        let remote = twt("![cat](https://elsewhere.example/cat.png)");
        assert_eq!(
            remote.format(Format::Html, &Opts),
            r#"<a href="https://elsewhere.example/cat.png">cat</a>"#
        );
    }

    #[test]
    fn html_drops_unsafe_schemes() {
        let t = twt("[click](javascript:alert(1))");
        assert!(!t.format(Format::Html, &Opts).contains("<a"));
    }

    #[test]
    fn external_mentions_link_through_pod() {
        let t = twt("@<bob https://b.example/twtxt.txt>");
        assert_eq!(
            t.format(Format::Markdown, &Opts),
            "[@bob](https://b.example#bob)"
        );
        assert!(
            t.format(Format::Html, &Opts)
                .starts_with(r#"<a href="http://example.org/external?uri=https%3A%2F%2Fb.example%2Ftwtxt.txt&amp;nick=bob">"#)
        );
    }
}
