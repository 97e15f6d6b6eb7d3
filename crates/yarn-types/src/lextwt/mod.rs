//! Lexer and parser for the twtxt feed format.

pub mod elems;
pub mod feed;
pub mod lexer;
mod parser;

use std::sync::Arc;

pub use elems::{Code, CodeKind, DateTime, Elem, Link, LinkKind, Mention, Subject, SubjectKind, Tag};
pub use elems::{expand_mentions, normalize_text};
pub use feed::{Comment, FeedFile, Info, parse_file};

use crate::twt::{Twt, Twter};
use parser::{Line, Parser};

/// Parse a single `timestamp\ttext` line. Returns `None` for comments,
/// blank lines and lines that fail to parse.
pub fn parse_line(line: &str, twter: &Twter) -> Option<Twt> {
    let twter = Arc::new(twter.clone());
    let mut parser = Parser::new(line);
    match parser.parse_line(&twter)? {
        Line::Twt(twt) => Some(twt),
        _ => None,
    }
}

/// Parse free text (no timestamp) into inline elements.
pub fn parse_text(text: &str) -> Vec<Elem> {
    Parser::new(text).parse_elems()
}

/// Parse a bare RFC 3339 style timestamp as accepted in feeds.
pub fn parse_datetime(lit: &str) -> Option<DateTime> {
    let mut parser = Parser::new(lit);
    let dt = parser.parse_datetime()?;
    parser.is_eof().then_some(dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twter() -> Twter {
        Twter::new("example", "http://example.org/twtxt.txt")
    }

    fn lits(twt: &Twt) -> Vec<&str> {
        twt.elems().iter().map(Elem::literal).collect()
    }

    #[test]
    fn subject_and_mentions() {
        let line = "2020-12-25T16:57:57Z\t@<hirad https://twtxt.net/user/hirad/twtxt.txt> (#<hrqg53a https://twtxt.net/search?tag=hrqg53a>) @<prologic https://twtxt.net/user/prologic/twtxt.txt> thanks";
        let twt = parse_line(line, &twter()).unwrap();
        let subject = twt.subject();
        assert_eq!(subject.tag().map(Tag::text), Some("hrqg53a"));
        assert_eq!(subject.to_string(), "(#hrqg53a)");
        assert_eq!(twt.mentions().len(), 2);
        assert_eq!(twt.mentions()[0].name(), "hirad");
        assert_eq!(twt.literal(), line);
    }

    #[test]
    fn subject_only_at_start() {
        let twt = parse_line(
            "2020-12-25T16:57:57Z\t(#ezmdswq) Looks good (#ezmdswq) to me",
            &twter(),
        )
        .unwrap();
        assert_eq!(twt.subject().hash().as_deref(), Some("ezmdswq"));
        assert_eq!(twt.tags().len(), 1);
        assert_eq!(
            lits(&twt),
            vec!["(#ezmdswq)", " Looks good (", "#ezmdswq", ") to me"]
        );
    }

    #[test]
    fn free_text_subject() {
        let twt = parse_line("2020-12-25T16:57:57Z\t(_just kidding!_) haha", &twter()).unwrap();
        assert_eq!(twt.subject().text(), Some("_just kidding!_"));
    }

    #[test]
    fn missing_subject_defaults_to_own_hash() {
        let twt = parse_line("2020-12-25T16:57:57Z\ta twt witn (not a) subject", &twter()).unwrap();
        assert_eq!(twt.subject().hash().as_deref(), Some(twt.hash()));
        assert_eq!(lits(&twt), vec!["a twt witn (not a) subject"]);
    }

    #[test]
    fn mention_shapes() {
        let twt = parse_line(
            "2020-12-25T16:57:57Z\t@xuu @xuu@sour.is @<https://sour.is/twtxt.txt> @<xuu@sour.is https://sour.is/twtxt.txt> @stats.",
            &twter(),
        )
        .unwrap();
        let mentions = twt.mentions();
        assert_eq!(mentions.len(), 5);
        assert_eq!((mentions[0].name(), mentions[0].domain()), ("xuu", ""));
        assert_eq!((mentions[1].name(), mentions[1].domain()), ("xuu", "sour.is"));
        assert_eq!(mentions[2].target(), "https://sour.is/twtxt.txt");
        assert_eq!(
            (mentions[3].name(), mentions[3].domain(), mentions[3].target()),
            ("xuu", "sour.is", "https://sour.is/twtxt.txt")
        );
        assert_eq!(mentions[4].name(), "stats");
        assert_eq!(twt.elems().last(), Some(&Elem::Text(".".into())));
    }

    #[test]
    fn tag_shapes() {
        let twt = parse_line(
            "2020-12-25T16:57:57Z\tnew #tag and #<https://example.org/search?tag=x> and #<other https://example.org/search?tag=other>",
            &twter(),
        )
        .unwrap();
        let tags: Vec<(String, &str)> = twt.tags().iter().map(|t| (t.resolved(), t.target())).collect();
        assert_eq!(
            tags,
            vec![
                ("tag".to_owned(), ""),
                ("x".to_owned(), "https://example.org/search?tag=x"),
                ("other".to_owned(), "https://example.org/search?tag=other"),
            ]
        );
    }

    #[test]
    fn link_shapes() {
        let line = "2020-12-25T16:57:57Z\tsee [docs](https://example.org/docs \"the docs\") ![cat](https://i.imgur.com/cat.png) <https://example.org> https://example.org/a\\ b and [rel](/about)";
        let twt = parse_line(line, &twter()).unwrap();
        let links = twt.links();
        assert_eq!(links.len(), 5);
        assert_eq!((links[0].kind(), links[0].text(), links[0].target()), (LinkKind::Standard, "docs", "https://example.org/docs"));
        assert_eq!(links[0].title_text(), "the docs");
        assert_eq!(links[1].kind(), LinkKind::Media);
        assert_eq!(links[2].kind(), LinkKind::Plain);
        assert_eq!((links[3].kind(), links[3].target()), (LinkKind::Naked, "https://example.org/a\\ b"));
        assert_eq!(links[4].target(), "/about");
        assert_eq!(twt.literal(), line);
    }

    #[test]
    fn failed_elements_fall_back_to_text() {
        let twt = parse_line("2020-12-25T16:57:57Z\t@<broken and [x](  and <nope>", &twter()).unwrap();
        assert!(twt.mentions().is_empty());
        assert!(twt.links().is_empty());
        assert_eq!(lits(&twt).concat(), "@<broken and [x](  and <nope>");
    }

    #[test]
    fn code_and_line_separators() {
        let twt = parse_line("2020-12-25T16:57:57Z\t`a #b`\u{2028}```x @y```", &twter()).unwrap();
        assert!(matches!(&twt.elems()[0], Elem::Code(c) if c.kind() == CodeKind::Inline && c.text() == "a #b"));
        assert_eq!(twt.elems()[1], Elem::LineSeparator);
        assert!(matches!(&twt.elems()[2], Elem::Code(c) if c.kind() == CodeKind::Block));
        assert!(twt.mentions().is_empty());
    }

    #[test]
    fn email_like_text_is_not_a_mention() {
        let twt = parse_line("2020-12-25T16:57:57Z\tmail me at foo@bar.com", &twter()).unwrap();
        assert!(twt.mentions().is_empty());
    }

    #[test]
    fn author_override() {
        let twt = parse_line("2020-12-25T16:57:57Z\t@<other http://example.com/other.txt>\texample", &twter()).unwrap();
        assert_eq!(twt.twter().nick, "other");
        assert_eq!(twt.twter().uri, "http://example.com/other.txt");
        assert_eq!(lits(&twt), vec!["@<other http://example.com/other.txt>", "\texample"]);
    }

    #[test]
    fn datetime_forms() {
        for lit in [
            "2016-02-03T23:05",
            "2016-02-03T23:05:00Z",
            "2016-02-03T23:05:00.000001234Z",
            "2016-02-03T23:05:00+01:00",
            "2016-02-03T23:05:00-0700",
            "2016-02-03T3:05:00Z",
        ] {
            let dt = parse_datetime(lit).unwrap_or_else(|| panic!("{lit}"));
            assert_eq!(dt.literal(), lit);
        }
        let dt = parse_datetime("2016-02-03T23:05:00.5Z").unwrap();
        assert_eq!(dt.at().timestamp_subsec_nanos(), 500_000_000);
        let dt = parse_datetime("2016-02-03T23:05:00-0700").unwrap();
        assert_eq!(dt.at().offset().local_minus_utc(), -7 * 3600);
        assert!(parse_datetime("2016-13-03T23:05Z").is_none());
        assert!(parse_datetime("16-02-03T23:05Z").is_none());
    }

    #[test]
    fn compact_offsets_are_hours_and_minutes() {
        for (lit, secs) in [
            ("2021-01-01T00:00:00+0015", 15 * 60),
            ("2021-01-01T00:00:00-0030", -30 * 60),
            ("2021-01-01T00:00:00+0005", 5 * 60),
            ("2021-01-01T00:00:00+0530", 5 * 3600 + 30 * 60),
            ("2021-01-01T00:00:00+05", 5 * 3600),
            ("2021-01-01T00:00:00+05:45", 5 * 3600 + 45 * 60),
        ] {
            let dt = parse_datetime(lit).unwrap_or_else(|| panic!("{lit}"));
            assert_eq!(dt.at().offset().local_minus_utc(), secs, "{lit}");
        }
        assert!(parse_datetime("2021-01-01T00:00:00+005").is_none());
    }

    #[test]
    fn feed_round_trips() {
        let twts = "\
2016-02-03T23:05:00Z\twelcome to twtxt!
2020-12-25T16:57:57Z\t@<hirad https://twtxt.net/user/hirad/twtxt.txt> (#hrqg53a) hi #tag ![x](https://a.b/c.png \"t\")
2021-01-01T00:00:00.123+05:30\t`code` and https://example.org/a?b=c, done.\u{2028}second line
";
        let src = format!("# nick = example\n# a plain comment\n\n{twts}");
        let feed = parse_file(&src, twter()).unwrap();
        let out: String = feed.twts().iter().map(|t| format!("{}\n", t.literal())).collect();
        assert_eq!(out, twts);
        let preamble: Vec<&str> = feed.comments().iter().map(Comment::literal).collect();
        assert_eq!(preamble, vec!["# nick = example", "# a plain comment"]);
    }
}
