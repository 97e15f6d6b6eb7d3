//! Recursive-descent parser over the token stream with one token of lookahead.
//!
//! Every element records its literal as `&src[start..end]` so that the
//! elements of a twt line tile the line exactly.

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, TimeZone};

use crate::error::ParseError;
use crate::twt::{Twt, Twter};

use super::elems::{Code, DateTime, Elem, Link, LinkKind, Mention, Subject, SubjectKind, Tag};
use super::feed::Comment;
use super::lexer::{Lexer, Token, TokenKind};

use TokenKind as K;

pub(crate) enum Line {
    Comment(Comment),
    Twt(Twt),
    Blank,
    Invalid,
}

pub(crate) struct Parser<'a> {
    src: &'a str,
    lexer: Lexer<'a>,
    cur: Token<'a>,
    peek: Token<'a>,
    errs: Vec<ParseError>,
    skip_subject: bool,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        let mut lexer = Lexer::new(src);
        let cur = lexer.next_token();
        let peek = lexer.next_token();
        Self {
            src,
            lexer,
            cur,
            peek,
            errs: Vec::new(),
            skip_subject: false,
        }
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errs
    }

    pub fn is_eof(&self) -> bool {
        self.cur.kind == K::Eof
    }

    fn advance(&mut self) {
        self.cur = self.peek;
        self.peek = self.lexer.next_token();
    }

    fn cur_is(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.peek.kind == kind
    }

    fn cur_is_any(&self, kinds: &[TokenKind]) -> bool {
        kinds.contains(&self.cur.kind)
    }

    fn peek_is_any(&self, kinds: &[TokenKind]) -> bool {
        kinds.contains(&self.peek.kind)
    }

    /// Source text from `start` up to the current token.
    fn since(&self, start: usize) -> &'a str {
        &self.src[start..self.cur.pos]
    }

    fn prev_is_space(&self) -> bool {
        self.src[..self.cur.pos]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace)
    }

    fn unexpected(&mut self, expected: &'static str) {
        self.errs.push(ParseError::UnexpectedToken {
            expected,
            found: self.cur.lit.to_owned(),
            pos: self.cur.pos,
        });
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Option<()> {
        if self.cur_is(kind) {
            self.advance();
            Some(())
        } else {
            self.unexpected(expected);
            None
        }
    }

    fn skip_line(&mut self) {
        while !self.cur_is_any(&[K::Nl, K::Eof]) {
            self.advance();
        }
    }

    /// Advance through tokens until the current one is in `terms`.
    fn consume_until(&mut self, terms: &[TokenKind]) {
        loop {
            let stop = self.peek_is_any(terms);
            self.advance();
            if stop {
                break;
            }
        }
    }

    // ── Lines ───────────────────────────────────────────────────────────

    pub fn parse_line(&mut self, twter: &Arc<Twter>) -> Option<Line> {
        if self.is_eof() {
            return None;
        }

        let line = match self.cur.kind {
            K::Hash => {
                let start = self.cur.pos;
                self.skip_line();
                Line::Comment(Comment::parse(self.since(start)))
            }
            K::Number => match self.parse_twt(twter) {
                Some(twt) => Line::Twt(twt),
                None => {
                    self.skip_line();
                    Line::Invalid
                }
            },
            K::Nl => Line::Blank,
            _ => {
                self.unexpected("comment or timestamp");
                self.skip_line();
                Line::Invalid
            }
        };

        if self.cur_is(K::Nl) {
            self.advance();
        }
        Some(line)
    }

    pub fn parse_twt(&mut self, twter: &Arc<Twter>) -> Option<Twt> {
        self.skip_subject = false;

        let created = self.parse_datetime()?;
        self.expect(K::Tab, "tab")?;

        let mut author = Arc::clone(twter);
        let mut elems: Vec<Elem> = Vec::new();
        while let Some(elem) = self.parse_elem() {
            // `@<nick url>\t` as the first element re-attributes the twt
            if elems.is_empty() && self.cur_is(K::Tab) {
                if let Elem::Mention(m) = &elem {
                    if !m.target().is_empty() {
                        author = Arc::new(m.twter());
                    }
                }
            }
            elems.push(elem);
        }

        if elems.is_empty() {
            self.errs.push(ParseError::EmptyTwt);
            return None;
        }
        Some(Twt::from_parts(author, created, elems))
    }

    /// Parse a run of inline elements up to the end of the line.
    pub fn parse_elems(&mut self) -> Vec<Elem> {
        self.skip_subject = false;
        let mut elems = Vec::new();
        while let Some(elem) = self.parse_elem() {
            elems.push(elem);
        }
        elems
    }

    // ── Datetime ────────────────────────────────────────────────────────

    fn number(&mut self, min: usize, max: usize) -> Option<(u32, usize)> {
        if !self.cur_is(K::Number) || !(min..=max).contains(&self.cur.lit.len()) {
            self.unexpected("number");
            return None;
        }
        let len = self.cur.lit.len();
        let value = self.cur.lit.parse().ok()?;
        self.advance();
        Some((value, len))
    }

    pub fn parse_datetime(&mut self) -> Option<DateTime> {
        let start = self.cur.pos;

        let (year, _) = self.number(4, 4)?;
        self.expect(K::Hyphen, "-")?;
        let (month, _) = self.number(2, 2)?;
        self.expect(K::Hyphen, "-")?;
        let (day, _) = self.number(2, 2)?;
        self.expect(K::T, "T")?;
        let (hour, _) = self.number(1, 2)?;
        self.expect(K::Colon, ":")?;
        let (minute, _) = self.number(2, 2)?;

        let (mut second, mut nanos) = (0, 0);
        if self.cur_is(K::Colon) {
            self.advance();
            (second, _) = self.number(2, 2)?;
            if self.cur_is(K::Dot) {
                self.advance();
                let (frac, len) = self.number(1, 9)?;
                nanos = frac * 10u32.pow((9 - len) as u32);
            }
        }

        let offset = match self.cur.kind {
            K::Z => {
                self.advance();
                0
            }
            K::Plus | K::Hyphen => {
                let sign = if self.cur_is(K::Plus) { 1 } else { -1 };
                self.advance();
                // `HHMM`, or `HH` with an optional `:MM`.
                let (value, len) = self.number(2, 4)?;
                let (hours, minutes) = match len {
                    4 => (value / 100, value % 100),
                    2 if self.cur_is(K::Colon) => {
                        self.advance();
                        (value, self.number(2, 2)?.0)
                    }
                    2 => (value, 0),
                    _ => {
                        self.errs.push(ParseError::InvalidDateTime(self.since(start).to_owned()));
                        return None;
                    }
                };
                sign * (hours as i32 * 3600 + minutes as i32 * 60)
            }
            _ => 0,
        };

        let lit = self.since(start);
        let at = NaiveDate::from_ymd_opt(year as i32, month, day)
            .and_then(|d| d.and_hms_nano_opt(hour, minute, second, nanos))
            .zip(FixedOffset::east_opt(offset))
            .and_then(|(naive, tz)| tz.from_local_datetime(&naive).single());

        match at {
            Some(at) => Some(DateTime::parsed(at, lit)),
            None => {
                self.errs.push(ParseError::InvalidDateTime(lit.to_owned()));
                None
            }
        }
    }

    // ── Elements ────────────────────────────────────────────────────────

    fn parse_elem(&mut self) -> Option<Elem> {
        let start = self.cur.pos;

        let parsed = match self.cur.kind {
            K::Nl | K::Eof => return None,
            K::LBrack | K::Bang | K::Lt => self.parse_link().map(Elem::Link),
            K::Code => {
                let code = Code::parse(self.cur.lit);
                self.advance();
                Some(Elem::Code(code))
            }
            K::Ls => {
                self.advance();
                Some(Elem::LineSeparator)
            }
            K::LParen if !self.skip_subject => self.parse_subject().map(Elem::Subject),
            K::LParen => {
                self.advance();
                Some(Elem::Text(self.since(start).to_owned()))
            }
            K::Hash => self.parse_tag().map(Elem::Tag),
            K::At => self.parse_mention().map(Elem::Mention),
            K::String if self.peek_is(K::Scheme) => self.parse_naked_link().map(Elem::Link),
            _ => None,
        };

        // failed or plain runs re-emit everything consumed as text
        let elem = parsed.unwrap_or_else(|| self.parse_text(start));
        if !matches!(elem, Elem::Mention(_)) && !elem.is_blank() {
            self.skip_subject = true;
        }
        Some(elem)
    }

    fn parse_text(&mut self, start: usize) -> Elem {
        if !self.cur_is_any(&[K::Nl, K::Eof]) && self.cur.pos == start {
            self.advance();
        }
        loop {
            if self.cur_is(K::String) && self.peek_is(K::Scheme) {
                break;
            }
            let more = match self.cur.kind {
                K::String | K::Space => true,
                K::Hash | K::At | K::Lt | K::LParen => !self.prev_is_space(),
                _ => false,
            };
            if !more {
                break;
            }
            self.advance();
        }
        Elem::Text(self.since(start).to_owned())
    }

    fn parse_mention(&mut self) -> Option<Mention> {
        let start = self.cur.pos;

        if self.peek_is(K::String) {
            self.advance();
            let name = self.cur.lit;
            self.advance();

            let mut domain = "";
            if self.cur_is(K::At) && self.peek_is(K::String) {
                self.advance();
                let domain_start = self.cur.pos;
                self.consume_until(&[K::Gt, K::RParen, K::Space, K::Tab, K::Nl, K::Ls, K::Eof]);
                domain = &self.src[domain_start..self.cur.pos];
            }
            return Some(Mention::parsed(name, domain, "", self.since(start)));
        }

        if !self.peek_is(K::Lt) {
            return None;
        }
        self.advance();
        self.advance();

        let (mut name, mut domain) = ("", "");
        if self.cur_is(K::String) && self.peek_is(K::Space) {
            name = self.cur.lit;
            self.advance();
        } else if self.cur_is(K::String) && self.peek_is(K::At) {
            name = self.cur.lit;
            self.advance();
            self.advance();
            if !self.cur_is(K::String) {
                return None;
            }
            let domain_start = self.cur.pos;
            self.consume_until(&[K::Gt, K::RParen, K::Space, K::Nl, K::Eof]);
            domain = &self.src[domain_start..self.cur.pos];
        }
        if self.cur_is(K::Space) {
            self.advance();
        }

        let mut target = String::new();
        if self.cur_is(K::String) && self.peek_is(K::Scheme) {
            target = self.parse_naked_link()?.target().to_owned();
        }
        if !self.cur_is(K::Gt) {
            return None;
        }
        self.advance();

        if name.is_empty() && target.is_empty() {
            return None;
        }
        Some(Mention::parsed(name, domain, &target, self.since(start)))
    }

    fn parse_tag(&mut self) -> Option<Tag> {
        let start = self.cur.pos;

        if self.peek_is_any(&[K::String, K::Number]) {
            self.advance();
            let tag = self.cur.lit;
            self.advance();
            return Some(Tag::parsed(tag, "", self.since(start)));
        }

        if !self.peek_is(K::Lt) {
            return None;
        }
        self.advance();
        self.advance();

        let mut tag = "";
        if self.cur_is(K::String) && self.peek_is(K::Space) {
            tag = self.cur.lit;
            self.advance();
            self.advance();
        }

        let mut target = String::new();
        if self.cur_is(K::String) && self.peek_is(K::Scheme) {
            target = self.parse_naked_link()?.target().to_owned();
        }
        if !self.cur_is(K::Gt) {
            return None;
        }
        self.advance();

        if tag.is_empty() && target.is_empty() {
            return None;
        }
        Some(Tag::parsed(tag, &target, self.since(start)))
    }

    fn parse_subject(&mut self) -> Option<Subject> {
        let start = self.cur.pos;
        self.advance();

        if self.cur_is(K::Hash) {
            let tag = self.parse_tag()?;
            if !self.cur_is(K::RParen) {
                return None;
            }
            self.advance();
            return Some(Subject::parsed(SubjectKind::Tag(tag), self.since(start)));
        }

        let text_start = self.cur.pos;
        while !self.cur_is_any(&[K::RParen, K::Nl, K::Ls, K::Eof]) {
            self.advance();
        }
        if !self.cur_is(K::RParen) || self.cur.pos == text_start {
            return None;
        }
        let text = &self.src[text_start..self.cur.pos];
        self.advance();
        Some(Subject::parsed(SubjectKind::Text(text.to_owned()), self.since(start)))
    }

    // ── Links ───────────────────────────────────────────────────────────

    fn parse_link(&mut self) -> Option<Link> {
        let start = self.cur.pos;
        match self.cur.kind {
            K::Lt => {
                if !self.peek_is(K::String) {
                    return None;
                }
                self.advance();
                if !self.peek_is(K::Scheme) {
                    return None;
                }
                let inner = self.parse_naked_link()?;
                if !self.cur_is(K::Gt) {
                    return None;
                }
                self.advance();
                Some(Link::parsed(LinkKind::Plain, "", inner.target(), "", self.since(start)))
            }
            K::Bang => {
                if !self.peek_is(K::LBrack) {
                    return None;
                }
                self.advance();
                self.parse_bracketed(start, LinkKind::Media)
            }
            K::LBrack => self.parse_bracketed(start, LinkKind::Standard),
            _ => None,
        }
    }

    fn skip_escape(&mut self) {
        if self.cur_is(K::BSlash) && !self.peek_is_any(&[K::Nl, K::Eof]) {
            self.advance();
        }
    }

    fn parse_bracketed(&mut self, start: usize, kind: LinkKind) -> Option<Link> {
        self.advance();

        let text_start = self.cur.pos;
        while !self.cur_is_any(&[K::RBrack, K::LBrack, K::RParen, K::LParen, K::Nl, K::Eof]) {
            self.skip_escape();
            self.advance();
        }
        if !self.cur_is(K::RBrack) {
            return None;
        }
        let text = &self.src[text_start..self.cur.pos];
        self.advance();

        if !self.cur_is(K::LParen) || self.peek_is(K::RParen) {
            return None;
        }
        self.advance();

        let target = if self.cur_is(K::String) && self.peek_is(K::Scheme) {
            self.parse_naked_link()?.target().to_owned()
        } else {
            let target_start = self.cur.pos;
            while !self.cur_is_any(&[K::RParen, K::RBrack, K::LParen, K::LBrack, K::Space, K::Nl, K::Ls, K::Eof]) {
                self.advance();
            }
            self.src[target_start..self.cur.pos].to_owned()
        };
        if target.is_empty() {
            return None;
        }

        let mut title = "";
        if self.cur_is(K::Space) {
            self.advance();
            let quote = self.cur.kind;
            if !matches!(quote, K::DQuote | K::SQuote) {
                return None;
            }
            let title_start = self.cur.pos;
            self.advance();
            while !self.cur_is_any(&[quote, K::Nl, K::Ls, K::Eof]) {
                self.skip_escape();
                self.advance();
            }
            if !self.cur_is(quote) {
                return None;
            }
            self.advance();
            title = &self.src[title_start..self.cur.pos];
        }

        if !self.cur_is(K::RParen) {
            return None;
        }
        self.advance();
        Some(Link::parsed(kind, text, &target, title, self.since(start)))
    }

    /// `scheme://rest`, ending before `>`, `)`, whitespace or end of line.
    fn parse_naked_link(&mut self) -> Option<Link> {
        let start = self.cur.pos;
        if !(self.cur_is(K::String) && self.peek_is(K::Scheme)) {
            return None;
        }
        self.advance();

        loop {
            if self.peek_is_any(&[K::Gt, K::RParen, K::Space, K::Tab, K::Nl, K::Ls, K::Eof]) {
                self.advance();
                break;
            }
            self.advance();
            self.skip_escape();
        }

        let target = self.since(start);
        Some(Link::parsed(LinkKind::Naked, "", target, "", target))
    }
}
