//! Scanner: source text to tokens.
//!
//! Tokens are produced on demand (pull model) and borrow their lexeme
//! straight out of the source buffer; nothing is copied. The scanner
//! never aborts: lexical problems surface as `TokenKind::Error` tokens
//! whose lexeme is the message, and the parser decides what to do.

/// Token kinds, including the sentinels `Error` and `Eof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    // One- or two-character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    Str,
    Number,
    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    // Sentinels.
    Error,
    Eof,
}

/// A token: kind, zero-copy lexeme slice, and 1-based source line.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            c if is_alpha(c) => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.current += 1; // closing quote
        self.make_token(TokenKind::Str)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        // A fractional part requires at least one digit after the dot.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.current += 1;
        }
        self.make_token(self.identifier_kind())
    }

    /// Keyword recognition: a hand-written trie branching on the first
    /// one or two bytes of the lexeme.
    fn identifier_kind(&self) -> TokenKind {
        let bytes = &self.source.as_bytes()[self.start..self.current];
        match bytes[0] {
            b'a' => keyword(bytes, "and", TokenKind::And),
            b'c' => keyword(bytes, "class", TokenKind::Class),
            b'e' => keyword(bytes, "else", TokenKind::Else),
            b'f' if bytes.len() > 1 => match bytes[1] {
                b'a' => keyword(bytes, "false", TokenKind::False),
                b'o' => keyword(bytes, "for", TokenKind::For),
                b'u' => keyword(bytes, "fun", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => keyword(bytes, "if", TokenKind::If),
            b'n' => keyword(bytes, "nil", TokenKind::Nil),
            b'o' => keyword(bytes, "or", TokenKind::Or),
            b'p' => keyword(bytes, "print", TokenKind::Print),
            b'r' => keyword(bytes, "return", TokenKind::Return),
            b's' => keyword(bytes, "super", TokenKind::Super),
            b't' if bytes.len() > 1 => match bytes[1] {
                b'h' => keyword(bytes, "this", TokenKind::This),
                b'r' => keyword(bytes, "true", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            b'v' => keyword(bytes, "var", TokenKind::Var),
            b'w' => keyword(bytes, "while", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn keyword(bytes: &[u8], word: &str, kind: TokenKind) -> TokenKind {
    if bytes == word.as_bytes() {
        kind
    } else {
        TokenKind::Identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scan_kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token();
            kinds.push(token.kind);
            if token.kind == TokenKind::Eof {
                return kinds;
            }
        }
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            scan_kinds("(){};,.-+/* ! != = == < <= > >="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_fully_match() {
        assert_eq!(
            scan_kinds("and class else false for fun if nil or print return super this true var while"),
            vec![
                TokenKind::And,
                TokenKind::Class,
                TokenKind::Else,
                TokenKind::False,
                TokenKind::For,
                TokenKind::Fun,
                TokenKind::If,
                TokenKind::Nil,
                TokenKind::Or,
                TokenKind::Print,
                TokenKind::Return,
                TokenKind::Super,
                TokenKind::This,
                TokenKind::True,
                TokenKind::Var,
                TokenKind::While,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keyword_prefixes_are_identifiers() {
        assert_eq!(
            scan_kinds("fort falsey classy supper thistle"),
            vec![
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let mut scanner = Scanner::new("123 45.67 8.");
        assert_eq!(scanner.scan_token().lexeme, "123");
        assert_eq!(scanner.scan_token().lexeme, "45.67");
        // No trailing dot: "8." scans as the number 8 then a dot.
        assert_eq!(scanner.scan_token().lexeme, "8");
        assert_eq!(scanner.scan_token().kind, TokenKind::Dot);
    }

    #[test]
    fn test_string_literal_spans_lines() {
        let mut scanner = Scanner::new("\"a\nb\" x");
        let s = scanner.scan_token();
        assert_eq!(s.kind, TokenKind::Str);
        assert_eq!(s.lexeme, "\"a\nb\"");
        let x = scanner.scan_token();
        assert_eq!(x.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn test_unexpected_character() {
        let mut scanner = Scanner::new("@");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unexpected character.");
    }

    #[test]
    fn test_comments_and_lines() {
        let mut scanner = Scanner::new("// nothing\nx");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Identifier);
        assert_eq!(token.line, 2);
    }

    proptest! {
        /// The scanner terminates and always ends with Eof, whatever
        /// the input.
        #[test]
        fn prop_scanner_total(source in "\\PC{0,120}") {
            let mut scanner = Scanner::new(&source);
            for _ in 0..source.len() + 1 {
                if scanner.scan_token().kind == TokenKind::Eof {
                    return Ok(());
                }
            }
            prop_assert!(false, "scanner did not reach Eof");
        }
    }
}
