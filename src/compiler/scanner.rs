use radix_trie::Trie;
use thiserror::Error;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

#[derive(Debug, Clone, Error)]
pub enum ScannerError {
    #[error("[line {line}] Unterminated string.")]
    UnterminatedString { line: u64 },

    #[error("[line {line}] Unexpected character '{ch}'.")]
    UnexpectedCharacter { ch: char, line: u64 },
}

/// Turns source text into a stream of tokens. The stream never ends: after
/// the source is exhausted every call yields another `EOF` token. Lexical
/// errors are reported as values so the caller can keep pulling tokens.
pub struct Scanner<'a> {
    source: &'a str,
    cursor: StrCursor<'a>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

const KEYWORDS: [(&str, TokenKind); 16] = [
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("super", TokenKind::Super),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut keywords = Trie::new();
        for (keyword, kind) in KEYWORDS {
            keywords.insert(keyword, kind);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Result<Token, ScannerError> {
        self.skip_whitespace();
        self.start = self.cursor.index;

        if let Some(ch) = self.cursor.advance() {
            let token = match ch {
                '(' => self.create_token(TokenKind::ParenLeft),
                ')' => self.create_token(TokenKind::ParenRight),
                '{' => self.create_token(TokenKind::BraceLeft),
                '}' => self.create_token(TokenKind::BraceRight),
                ';' => self.create_token(TokenKind::Semicolon),
                ',' => self.create_token(TokenKind::Comma),
                '.' => self.create_token(TokenKind::Dot),
                '-' => self.create_token(TokenKind::Minus),
                '+' => self.create_token(TokenKind::Plus),
                '/' => self.create_token(TokenKind::Slash),
                '*' => self.create_token(TokenKind::Star),
                '!' => self.create_token_match('=', TokenKind::BangEqual, TokenKind::Bang),
                '=' => self.create_token_match('=', TokenKind::EqualEqual, TokenKind::Equal),
                '<' => self.create_token_match('=', TokenKind::LessEqual, TokenKind::Less),
                '>' => self.create_token_match('=', TokenKind::GreaterEqual, TokenKind::Greater),
                '"' => self.create_string_token()?,
                ch if ch.is_ascii_digit() => self.create_digit_token(),
                ch if ch.is_ascii_alphabetic() || ch == '_' => self.create_identifier_token(),
                ch => {
                    return Err(ScannerError::UnexpectedCharacter {
                        ch,
                        line: self.line,
                    })
                }
            };
            Ok(token)
        } else {
            Ok(self.create_token(TokenKind::EOF))
        }
    }

    fn match_token(&mut self, expected: char) -> bool {
        if let Some(ch) = self.cursor.peek() {
            if ch == expected {
                self.cursor.advance();
                return true;
            }
        }
        false
    }

    fn create_token(&self, kind: TokenKind) -> Token {
        let data = self.source[self.start..self.cursor.index].to_owned();
        Token::new(kind, data, self.line)
    }

    fn create_token_match(
        &mut self,
        matches: char,
        if_matches: TokenKind,
        otherwise: TokenKind,
    ) -> Token {
        if self.match_token(matches) {
            self.create_token(if_matches)
        } else {
            self.create_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                '/' => {
                    if let Some('/') = self.cursor.peek_next() {
                        // A comment runs to the end of the line; the newline
                        // stays put so the line counter sees it.
                        self.cursor.advance_until(|ch| ch == '\n');
                    } else {
                        return;
                    }
                }
                val if val.is_whitespace() => {
                    self.cursor.advance();
                }
                _ => return,
            }
        }
    }

    fn create_identifier_token(&mut self) -> Token {
        self.cursor
            .advance_when(|ch| ch.is_ascii_alphanumeric() || ch == '_');

        let identifier = &self.source[self.start..self.cursor.index];
        if let Some(kind) = self.keywords.get(identifier) {
            self.create_token(*kind)
        } else {
            self.create_token(TokenKind::Identifier)
        }
    }

    fn create_digit_token(&mut self) -> Token {
        let check_digit = |ch: char| ch.is_ascii_digit();

        self.cursor.advance_when(check_digit);

        // A fractional part needs at least one digit after the dot,
        // otherwise the dot is left for property access.
        if let Some('.') = self.cursor.peek() {
            if let Some(ch) = self.cursor.peek_next() {
                if check_digit(ch) {
                    self.cursor.advance();
                    self.cursor.advance_when(check_digit);
                }
            }
        }

        self.create_token(TokenKind::Number)
    }

    fn create_string_token(&mut self) -> Result<Token, ScannerError> {
        loop {
            match self.cursor.peek() {
                // Strings cannot span lines.
                None | Some('\n') => {
                    return Err(ScannerError::UnterminatedString { line: self.line })
                }
                Some('"') => {
                    self.cursor.advance();
                    break;
                }
                Some(_) => {
                    self.cursor.advance();
                }
            }
        }

        Ok(self.create_token(TokenKind::String))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token().expect("scan failed");
            let done = token.kind == TokenKind::EOF;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn punctuation_and_operators() {
        assert_eq!(
            kinds("(){};,.-+/*"),
            vec![
                TokenKind::ParenLeft,
                TokenKind::ParenRight,
                TokenKind::BraceLeft,
                TokenKind::BraceRight,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn two_character_operators() {
        assert_eq!(
            kinds("! != = == < <= > >="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("class classy _private var x1"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn number_forms() {
        let mut scanner = Scanner::new("12 3.25 4.");
        assert_eq!(scanner.scan_token().unwrap().data, "12");
        assert_eq!(scanner.scan_token().unwrap().data, "3.25");
        // The trailing dot is not part of the number.
        assert_eq!(scanner.scan_token().unwrap().data, "4");
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::Dot);
    }

    #[test]
    fn comments_are_skipped_and_lines_counted() {
        let mut scanner = Scanner::new("// comment\nprint // more\nx");
        let print = scanner.scan_token().unwrap();
        assert_eq!(print.kind, TokenKind::Print);
        assert_eq!(print.line, 2);
        let x = scanner.scan_token().unwrap();
        assert_eq!(x.kind, TokenKind::Identifier);
        assert_eq!(x.line, 3);
    }

    #[test]
    fn string_token_keeps_quotes_in_lexeme() {
        let mut scanner = Scanner::new("\"hello\"");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.data, "\"hello\"");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"oops");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn newline_terminates_string_with_error() {
        let mut scanner = Scanner::new("\"two\nlines\"");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn unknown_character_is_an_error() {
        let mut scanner = Scanner::new("@");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnexpectedCharacter { ch: '@', .. })
        ));
    }

    #[test]
    fn eof_repeats() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::EOF);
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::EOF);
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::EOF);
    }
}
