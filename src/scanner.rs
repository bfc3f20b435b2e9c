// src/scanner.rs

use phf::phf_map;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen, RightParen, LeftBrace, RightBrace,
    Comma, Dot, Minus, Plus, Semicolon, Slash, Star, Colon,
    // One or two character tokens.
    Bang, BangEqual,
    Equal, EqualEqual,
    Greater, GreaterEqual,
    Less, LessEqual,
    PlusEqual, MinusEqual, StarEqual, SlashEqual,
    PlusPlus, MinusMinus,
    // Literals.
    Identifier, String, Number,
    // Keywords.
    And, Class, Else, False, For, Fun, If, Nil, Or,
    Print, Return, Super, This, True, Var, While,
    Switch, Case, Default, Break, Continue, Assert, Exit,

    Error, Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf_map! {
    "and" => TokenType::And,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
    "switch" => TokenType::Switch,
    "case" => TokenType::Case,
    "default" => TokenType::Default,
    "break" => TokenType::Break,
    "continue" => TokenType::Continue,
    "assert" => TokenType::Assert,
    "exit" => TokenType::Exit,
};

/// A token borrows its lexeme from the source. For `Error` tokens the lexeme
/// is the error message instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'src> {
    pub kind: TokenType,
    pub lexeme: &'src str,
    pub line: usize,
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: usize,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner { source, start: 0, current: 0, line: 1 }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return self.make_token(TokenType::Eof),
        };

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenType::LeftParen),
            b')' => self.make_token(TokenType::RightParen),
            b'{' => self.make_token(TokenType::LeftBrace),
            b'}' => self.make_token(TokenType::RightBrace),
            b';' => self.make_token(TokenType::Semicolon),
            b':' => self.make_token(TokenType::Colon),
            b',' => self.make_token(TokenType::Comma),
            b'.' => self.make_token(TokenType::Dot),
            b'-' => {
                let kind = if self.matches(b'-') {
                    TokenType::MinusMinus
                } else if self.matches(b'=') {
                    TokenType::MinusEqual
                } else {
                    TokenType::Minus
                };
                self.make_token(kind)
            }
            b'+' => {
                let kind = if self.matches(b'+') {
                    TokenType::PlusPlus
                } else if self.matches(b'=') {
                    TokenType::PlusEqual
                } else {
                    TokenType::Plus
                };
                self.make_token(kind)
            }
            b'/' => self.one_or_two(b'=', TokenType::SlashEqual, TokenType::Slash),
            b'*' => self.one_or_two(b'=', TokenType::StarEqual, TokenType::Star),
            b'!' => self.one_or_two(b'=', TokenType::BangEqual, TokenType::Bang),
            b'=' => self.one_or_two(b'=', TokenType::EqualEqual, TokenType::Equal),
            b'<' => self.one_or_two(b'=', TokenType::LessEqual, TokenType::Less),
            b'>' => self.one_or_two(b'=', TokenType::GreaterEqual, TokenType::Greater),
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn one_or_two(&mut self, second: u8, two: TokenType, one: TokenType) -> Token<'src> {
        let kind = if self.matches(second) { two } else { one };
        self.make_token(kind)
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.current += 1;
        Some(c)
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                // A comment goes until the end of the line.
                b'/' if self.peek_next() == Some(b'/') => {
                    while self.peek().is_some_and(|c| c != b'\n') {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| is_alpha(c) || c.is_ascii_digit()) {
            self.current += 1;
        }
        let text = &self.source[self.start..self.current];
        let kind = KEYWORDS.get(text).copied().unwrap_or(TokenType::Identifier);
        self.make_token(kind)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.current += 1;
        }
        // Look for a fractional part.
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.current += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.current += 1;
            }
        }
        self.make_token(TokenType::Number)
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == b'"' {
                break;
            }
            if c == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        if self.peek().is_none() {
            return self.error_token("Unterminated string.");
        }
        // The closing quote.
        self.current += 1;
        self.make_token(TokenType::String)
    }

    fn make_token(&self, kind: TokenType) -> Token<'src> {
        Token { kind, lexeme: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenType::Error, lexeme: message, line: self.line }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use TokenType::*;

    fn kinds(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            out.push(token.kind);
            if token.kind == Eof {
                return out;
            }
        }
    }

    #[test]
    fn test_declarations_and_blocks() {
        let source = "var foo = \"foo\"; { var bar = \"bar\"; var foobar = foo + bar; print foobar;}";
        assert_eq!(
            kinds(source),
            vec![
                Var, Identifier, Equal, String, Semicolon, LeftBrace, Var, Identifier, Equal, String,
                Semicolon, Var, Identifier, Equal, Identifier, Plus, Identifier, Semicolon, Print,
                Identifier, Semicolon, RightBrace, Eof,
            ]
        );
    }

    #[test]
    fn test_lexemes_and_lines() {
        let mut scanner = Scanner::new("fun f() {\n  f(\"too\", \"many\");\n}");
        let tokens: Vec<Token> = std::iter::from_fn(|| {
            let t = scanner.scan_token();
            (t.kind != Eof).then_some(t)
        })
        .collect();
        assert_eq!(tokens[0].lexeme, "fun");
        assert_eq!(tokens[1].lexeme, "f");
        assert_eq!(tokens[7].lexeme, "\"too\"");
        assert_eq!(tokens[7].line, 2);
        assert_eq!(tokens.last().map(|t| t.line), Some(3));
    }

    #[test]
    fn test_extended_operators_and_keywords() {
        assert_eq!(
            kinds("a += 1; b -= 2; c *= 3; d /= 4; i++; j--;"),
            vec![
                Identifier, PlusEqual, Number, Semicolon, Identifier, MinusEqual, Number, Semicolon,
                Identifier, StarEqual, Number, Semicolon, Identifier, SlashEqual, Number, Semicolon,
                Identifier, PlusPlus, Semicolon, Identifier, MinusMinus, Semicolon, Eof,
            ]
        );
        assert_eq!(
            kinds("switch case default break continue assert exit :"),
            vec![Switch, Case, Default, Break, Continue, Assert, Exit, Colon, Eof]
        );
    }

    #[test]
    fn test_numbers_and_comments() {
        assert_eq!(kinds("1.5 // trailing comment\n 2."), vec![Number, Number, Dot, Eof]);
    }

    #[test]
    fn test_invalid_input_produces_error_tokens() {
        assert!(kinds("~").contains(&Error));
        let mut scanner = Scanner::new("\"open");
        let token = scanner.scan_token();
        assert_eq!(token.kind, Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }
}
