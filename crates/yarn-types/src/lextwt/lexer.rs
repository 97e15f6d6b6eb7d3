//! Tokenizer for twtxt feed files.
//!
//! The lexer walks a `&str` by byte offset and hands out borrowed token
//! slices, so a token's literal is always `&src[pos..pos + lit.len()]`.
//! That property lets the parser recover any element's exact source text
//! from two offsets.

pub const LINE_SEPARATOR: char = '\u{2028}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    Hash,
    At,
    Lt,
    Gt,
    LBrack,
    RBrack,
    LParen,
    RParen,
    Colon,
    Hyphen,
    Plus,
    Dot,
    Equal,
    Bang,
    T,
    Z,
    Scheme,
    Code,
    Number,
    String,
    Space,
    Tab,
    Nl,
    Ls,
    BSlash,
    SQuote,
    DQuote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lit: &'a str,
    pub pos: usize,
}

impl Token<'_> {
    pub fn end(&self) -> usize {
        self.pos + self.lit.len()
    }
}

fn is_stop(c: char) -> bool {
    matches!(
        c,
        '#' | '@' | '<' | '>' | '(' | ')' | '[' | ']' | '!' | '\\' | '\'' | '"' | '`' | ':'
    )
}

fn continues_string(c: char) -> bool {
    !c.is_whitespace() && !is_stop(c)
}

// Sentence punctuation only sticks to a string when more string follows.
fn is_trailing(c: char) -> bool {
    matches!(c, '.' | ',' | ';' | '?')
}

fn is_space(c: char) -> bool {
    c.is_whitespace() && c != '\n' && c != '\t' && c != LINE_SEPARATOR
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self::at(src, 0)
    }

    /// Start lexing at a byte offset. `pos` must sit on a char boundary.
    pub fn at(src: &'a str, pos: usize) -> Self {
        Self { src, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn char_at(&self, offset: usize) -> Option<char> {
        self.src.get(offset..).and_then(|s| s.chars().next())
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
        }
    }

    fn bump_while(&mut self, f: impl Fn(char) -> bool) {
        while let Some(c) = self.peek_char() {
            if !f(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    pub fn next_token(&mut self) -> Token<'a> {
        let start = self.pos;
        let Some(c) = self.peek_char() else {
            return Token {
                kind: TokenKind::Eof,
                lit: "",
                pos: start,
            };
        };

        let kind = match c {
            '\n' => self.single(TokenKind::Nl),
            LINE_SEPARATOR => self.single(TokenKind::Ls),
            '\t' => self.single(TokenKind::Tab),
            c if is_space(c) => {
                self.bump_while(is_space);
                TokenKind::Space
            }
            '#' => self.single(TokenKind::Hash),
            '@' => self.single(TokenKind::At),
            '<' => self.single(TokenKind::Lt),
            '>' => self.single(TokenKind::Gt),
            '[' => self.single(TokenKind::LBrack),
            ']' => self.single(TokenKind::RBrack),
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '!' => self.single(TokenKind::Bang),
            '\\' => self.single(TokenKind::BSlash),
            '\'' => self.single(TokenKind::SQuote),
            '"' => self.single(TokenKind::DQuote),
            '-' => self.single(TokenKind::Hyphen),
            '+' => self.single(TokenKind::Plus),
            '.' => self.single(TokenKind::Dot),
            '=' => self.single(TokenKind::Equal),
            ':' => self.read_colon(),
            '`' => self.read_code(),
            c if c.is_ascii_digit() => self.read_number(),
            'T' | 'Z' if !self.char_at(start + 1).is_some_and(char::is_alphabetic) => {
                self.single(if c == 'T' { TokenKind::T } else { TokenKind::Z })
            }
            _ => {
                self.bump();
                self.read_string_tail();
                TokenKind::String
            }
        };

        Token {
            kind,
            lit: &self.src[start..self.pos],
            pos: start,
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn read_colon(&mut self) -> TokenKind {
        if self.rest().starts_with("://") {
            self.pos += 3;
            return TokenKind::Scheme;
        }
        self.bump();
        if self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            return TokenKind::Colon;
        }
        self.read_string_tail();
        TokenKind::String
    }

    fn read_number(&mut self) -> TokenKind {
        self.bump_while(|c| c.is_ascii_digit());
        match self.peek_char() {
            // `03T23`, `00Z` keep the digits numeric for the datetime parser
            Some(c @ ('T' | 'Z')) if !self.char_at(self.pos + c.len_utf8()).is_some_and(char::is_alphabetic) => {
                TokenKind::Number
            }
            Some(c) if c.is_alphabetic() => {
                self.read_string_tail();
                TokenKind::String
            }
            _ => TokenKind::Number,
        }
    }

    fn read_string_tail(&mut self) {
        while let Some(c) = self.peek_char() {
            if !continues_string(c) {
                break;
            }
            if is_trailing(c) {
                let next = self.char_at(self.pos + c.len_utf8());
                if !next.is_some_and(continues_string) {
                    break;
                }
            }
            self.pos += c.len_utf8();
        }
    }

    fn read_code(&mut self) -> TokenKind {
        let rest = self.rest();
        let ticks = rest.bytes().take_while(|&b| b == b'`').count();

        if ticks >= 3 {
            if let Some(end) = find_closing(&rest[3..], "```") {
                self.pos += 3 + end + 3;
                return TokenKind::Code;
            }
        }
        if let Some(end) = find_closing(&rest[1..], "`") {
            self.pos += 1 + end + 1;
            return TokenKind::Code;
        }

        // unterminated run of backticks
        self.pos += ticks;
        TokenKind::String
    }
}

/// Offset of `delim` in `body`, not crossing a line feed.
fn find_closing(body: &str, delim: &str) -> Option<usize> {
    let line = body.split('\n').next().unwrap_or_default();
    line.find(delim)
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let tok = self.next_token();
        (tok.kind != TokenKind::Eof).then_some(tok)
    }
}
