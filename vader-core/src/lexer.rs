//! Lexer for Vader source text.
//!
//! The lexer is intentionally simple: it classifies characters, applies
//! greedy longest-match for two-character operators, and attaches no
//! semantic meaning beyond recognizing keywords and literal forms. Higher
//! layers interpret identifiers and decorators.
//!
//! There is no recovery: the first unrecognized character (or malformed
//! literal) records a diagnostic and aborts the unit.

use crate::diagnostic::{Diagnostic, Diagnostics};
use crate::error::CoreError;
use crate::span::{FileId, Pos, Span};

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Special
    Eof,

    // Identifiers and literals
    Identifier,
    Integer,
    Float,
    Str,
    /// `@name`; the token text is the name without the sigil.
    Decorator,

    // Keywords
    Struct,
    Fn,
    If,
    Elif,
    Else,
    For,
    Return,
    True,
    False,

    // Brackets and punctuation
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Comma,    // ,
    Semi,     // ;
    Colon,    // :
    ColonColon, // ::
    ColonEq,  // :=
    Dot,      // .
    DotDot,   // ..

    // Operators
    Plus,       // +
    PlusEq,     // +=
    PlusPlus,   // ++
    Minus,      // -
    MinusEq,    // -=
    MinusMinus, // --
    Arrow,      // ->
    Star,       // *
    Slash,      // /
    Percent,    // %
    Eq,         // =
    EqEq,       // ==
    Bang,       // !
    BangEq,     // !=
    Lt,         // <
    Le,         // <=
    Gt,         // >
    Ge,         // >=
    Amp,        // &
    AmpAmp,     // &&
    Pipe,       // |
    PipePipe,   // ||
}

/// A single token with its kind, semantic text and span.
///
/// `text` carries the interesting payload only: the identifier or decorator
/// name, the raw numeric literal, or the unescaped string content. It is
/// empty for punctuation and keywords; the span always covers the exact
/// source region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

/// Lex a source file into tokens, ending with a single [`TokenKind::Eof`].
///
/// Fatal lexing problems are recorded in `diagnostics` and returned as
/// [`CoreError::Lex`]; there is no partial token stream on failure.
pub fn lex(
    file: FileId,
    source: &str,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Token>, CoreError> {
    let mut lexer = Lexer {
        file,
        bytes: source.as_bytes(),
        source,
        index: 0,
        line: 1,
        column: 1,
    };
    lexer.run(diagnostics)
}

struct Lexer<'src> {
    file: FileId,
    bytes: &'src [u8],
    source: &'src str,
    index: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    fn run(&mut self, diagnostics: &mut Diagnostics) -> Result<Vec<Token>, CoreError> {
        let mut tokens = Vec::new();

        // A leading shebang line belongs to the shell, not the program.
        if self.source.starts_with("#!") {
            while let Some(ch) = self.peek() {
                self.bump();
                if ch == b'\n' {
                    break;
                }
            }
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_whitespace() {
                self.bump();
                continue;
            }
            if ch == b'/' && self.peek_next() == Some(b'/') {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }

            let start = self.pos();
            let token = match ch {
                b'(' => self.punct(TokenKind::LParen, start),
                b')' => self.punct(TokenKind::RParen, start),
                b'{' => self.punct(TokenKind::LBrace, start),
                b'}' => self.punct(TokenKind::RBrace, start),
                b'[' => self.punct(TokenKind::LBracket, start),
                b']' => self.punct(TokenKind::RBracket, start),
                b',' => self.punct(TokenKind::Comma, start),
                b';' => self.punct(TokenKind::Semi, start),
                b':' => self.two_char(start, TokenKind::Colon, &[(b':', TokenKind::ColonColon), (b'=', TokenKind::ColonEq)]),
                b'.' => self.two_char(start, TokenKind::Dot, &[(b'.', TokenKind::DotDot)]),
                b'+' => self.two_char(
                    start,
                    TokenKind::Plus,
                    &[(b'=', TokenKind::PlusEq), (b'+', TokenKind::PlusPlus)],
                ),
                b'-' => self.two_char(
                    start,
                    TokenKind::Minus,
                    &[
                        (b'>', TokenKind::Arrow),
                        (b'=', TokenKind::MinusEq),
                        (b'-', TokenKind::MinusMinus),
                    ],
                ),
                b'*' => self.punct(TokenKind::Star, start),
                b'/' => self.punct(TokenKind::Slash, start),
                b'%' => self.punct(TokenKind::Percent, start),
                b'=' => self.two_char(start, TokenKind::Eq, &[(b'=', TokenKind::EqEq)]),
                b'!' => self.two_char(start, TokenKind::Bang, &[(b'=', TokenKind::BangEq)]),
                b'<' => self.two_char(start, TokenKind::Lt, &[(b'=', TokenKind::Le)]),
                b'>' => self.two_char(start, TokenKind::Gt, &[(b'=', TokenKind::Ge)]),
                b'&' => self.two_char(start, TokenKind::Amp, &[(b'&', TokenKind::AmpAmp)]),
                b'|' => self.two_char(start, TokenKind::Pipe, &[(b'|', TokenKind::PipePipe)]),
                b'"' => self.lex_string(start, diagnostics)?,
                b'@' => self.lex_decorator(start, diagnostics)?,
                b'0'..=b'9' => self.lex_number(start, diagnostics)?,
                _ if is_ident_start(ch) => self.lex_ident_or_keyword(start),
                _ => {
                    self.bump();
                    let span = Span::new(self.file, start, self.pos());
                    diagnostics.report(
                        Diagnostic::error(
                            format!("unexpected character '{}'", ch as char),
                            span,
                        )
                        .with_code("E0001"),
                    );
                    return Err(self.fatal(start, "unexpected character"));
                }
            };
            tokens.push(token);
        }

        let end = self.pos();
        tokens.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            span: Span::new(self.file, end, end),
        });
        Ok(tokens)
    }

    fn punct(&mut self, kind: TokenKind, start: Pos) -> Token {
        self.bump();
        self.token(kind, start)
    }

    /// Greedy longest-match: consume the lead byte, then upgrade the token
    /// kind if the following byte completes a two-character operator.
    fn two_char(&mut self, start: Pos, single: TokenKind, pairs: &[(u8, TokenKind)]) -> Token {
        self.bump();
        if let Some(next) = self.peek() {
            for &(expect, kind) in pairs {
                if next == expect {
                    self.bump();
                    return self.token(kind, start);
                }
            }
        }
        self.token(single, start)
    }

    fn token(&self, kind: TokenKind, start: Pos) -> Token {
        Token {
            kind,
            text: String::new(),
            span: Span::new(self.file, start, self.pos()),
        }
    }

    fn lex_string(
        &mut self,
        start: Pos,
        diagnostics: &mut Diagnostics,
    ) -> Result<Token, CoreError> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.bump();
                    return Ok(Token {
                        kind: TokenKind::Str,
                        text,
                        span: Span::new(self.file, start, self.pos()),
                    });
                }
                Some(b'\\') => {
                    self.bump();
                    // `\n` is the only recognized escape; anything else
                    // stays literal, backslash included.
                    match self.peek() {
                        Some(b'n') => {
                            self.bump();
                            text.push('\n');
                        }
                        Some(other) => {
                            self.bump();
                            text.push('\\');
                            text.push(other as char);
                        }
                        None => break,
                    }
                }
                Some(other) => {
                    self.bump();
                    text.push(other as char);
                }
                None => break,
            }
        }
        let span = Span::new(self.file, start, self.pos());
        diagnostics.report(Diagnostic::error("unterminated string literal", span).with_code("E0002"));
        Err(self.fatal(start, "unterminated string literal"))
    }

    fn lex_decorator(
        &mut self,
        start: Pos,
        diagnostics: &mut Diagnostics,
    ) -> Result<Token, CoreError> {
        self.bump(); // '@'
        let name_start = self.index;
        while let Some(ch) = self.peek() {
            if is_ident_continue(ch) {
                self.bump();
            } else {
                break;
            }
        }
        if self.index == name_start {
            let span = Span::new(self.file, start, self.pos());
            diagnostics.report(Diagnostic::error("expected decorator name after '@'", span).with_code("E0003"));
            return Err(self.fatal(start, "expected decorator name after '@'"));
        }
        Ok(Token {
            kind: TokenKind::Decorator,
            text: self.source[name_start..self.index].to_string(),
            span: Span::new(self.file, start, self.pos()),
        })
    }

    fn lex_number(
        &mut self,
        start: Pos,
        diagnostics: &mut Diagnostics,
    ) -> Result<Token, CoreError> {
        let text_start = self.index;

        // `0b` / `0o` / `0x` select the base; the remainder is scanned as
        // digits of that base, with `_` group separators permitted.
        if self.peek() == Some(b'0') {
            if let Some(base_char) = self.peek_next() {
                let digit_ok: Option<fn(u8) -> bool> = match base_char {
                    b'b' => Some(|c| matches!(c, b'0' | b'1')),
                    b'o' => Some(|c| matches!(c, b'0'..=b'7')),
                    b'x' => Some(|c| c.is_ascii_hexdigit()),
                    _ => None,
                };
                if let Some(digit_ok) = digit_ok {
                    self.bump(); // '0'
                    self.bump(); // base marker
                    let digits_start = self.index;
                    while let Some(ch) = self.peek() {
                        if digit_ok(ch) || ch == b'_' {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    if self.index == digits_start {
                        let span = Span::new(self.file, start, self.pos());
                        diagnostics.report(
                            Diagnostic::error("numeric literal has no digits", span)
                                .with_code("E0004"),
                        );
                        return Err(self.fatal(start, "numeric literal has no digits"));
                    }
                    return Ok(Token {
                        kind: TokenKind::Integer,
                        text: self.source[text_start..self.index].to_string(),
                        span: Span::new(self.file, start, self.pos()),
                    });
                }
            }
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || ch == b'_' {
                self.bump();
            } else {
                break;
            }
        }

        // A single '.' followed by digits makes a float; `1..2` leaves the
        // range operator alone.
        let mut kind = TokenKind::Integer;
        if self.peek() == Some(b'.')
            && self.peek_next().is_some_and(|c| c.is_ascii_digit())
        {
            kind = TokenKind::Float;
            self.bump(); // '.'
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() || ch == b'_' {
                    self.bump();
                } else {
                    break;
                }
            }
        }

        Ok(Token {
            kind,
            text: self.source[text_start..self.index].to_string(),
            span: Span::new(self.file, start, self.pos()),
        })
    }

    fn lex_ident_or_keyword(&mut self, start: Pos) -> Token {
        let text_start = self.index;
        while let Some(ch) = self.peek() {
            if is_ident_continue(ch) {
                self.bump();
            } else {
                break;
            }
        }
        let text = &self.source[text_start..self.index];
        let kind = match text {
            "struct" => TokenKind::Struct,
            "fn" => TokenKind::Fn,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "return" => TokenKind::Return,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            _ => TokenKind::Identifier,
        };
        Token {
            kind,
            text: if kind == TokenKind::Identifier {
                text.to_string()
            } else {
                String::new()
            },
            span: Span::new(self.file, start, self.pos()),
        }
    }

    fn fatal(&self, at: Pos, message: &str) -> CoreError {
        CoreError::Lex {
            location: format!("{}:{}", at.line, at.column),
            message: message.to_string(),
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            offset: self.index as u32,
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }

    fn bump(&mut self) {
        if let Some(ch) = self.peek() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let mut diags = Diagnostics::new();
        lex(FileId(0), source, &mut diags).expect("lex should succeed")
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex_ok(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration_forms() {
        assert_eq!(
            kinds("x :: 1 y := 2 z : u8 = 3"),
            vec![
                TokenKind::Identifier,
                TokenKind::ColonColon,
                TokenKind::Integer,
                TokenKind::Identifier,
                TokenKind::ColonEq,
                TokenKind::Integer,
                TokenKind::Identifier,
                TokenKind::Colon,
                TokenKind::Identifier,
                TokenKind::Eq,
                TokenKind::Integer,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn greedy_operator_match() {
        assert_eq!(
            kinds("a += 1 a ++ a -> a -- a && b || c .. d"),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEq,
                TokenKind::Integer,
                TokenKind::Identifier,
                TokenKind::PlusPlus,
                TokenKind::Identifier,
                TokenKind::Arrow,
                TokenKind::Identifier,
                TokenKind::MinusMinus,
                TokenKind::Identifier,
                TokenKind::AmpAmp,
                TokenKind::Identifier,
                TokenKind::PipePipe,
                TokenKind::Identifier,
                TokenKind::DotDot,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn base_prefixed_integers() {
        let tokens = lex_ok("0b1010 0o17 0xFF_FF 1_000");
        let texts: Vec<_> = tokens[..4].iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["0b1010", "0o17", "0xFF_FF", "1_000"]);
        assert!(tokens[..4].iter().all(|t| t.kind == TokenKind::Integer));
    }

    #[test]
    fn float_inference_and_range_disambiguation() {
        let tokens = lex_ok("3.25 1..4");
        assert_eq!(tokens[0].kind, TokenKind::Float);
        assert_eq!(tokens[0].text, "3.25");
        assert_eq!(tokens[1].kind, TokenKind::Integer);
        assert_eq!(tokens[2].kind, TokenKind::DotDot);
        assert_eq!(tokens[3].kind, TokenKind::Integer);
    }

    #[test]
    fn string_escapes() {
        let tokens = lex_ok(r#""hello\nworld" "back\slash""#);
        assert_eq!(tokens[0].text, "hello\nworld");
        assert_eq!(tokens[1].text, "back\\slash");
    }

    #[test]
    fn decorators_and_keywords() {
        let tokens = lex_ok("@intrinsic print :: fn(s: string) -> void");
        assert_eq!(tokens[0].kind, TokenKind::Decorator);
        assert_eq!(tokens[0].text, "intrinsic");
        assert_eq!(tokens[3].kind, TokenKind::Fn);
    }

    #[test]
    fn skips_shebang_and_comments() {
        let tokens = lex_ok("#!/usr/bin/env vader\n// comment line\nx :: 1\n");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].span.start.line, 3);
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = lex_ok("a\n  bb\n");
        assert_eq!(tokens[0].span.start.line, 1);
        assert_eq!(tokens[0].span.start.column, 1);
        assert_eq!(tokens[1].span.start.line, 2);
        assert_eq!(tokens[1].span.start.column, 3);
        assert_eq!(tokens[1].span.end.column, 5);
    }

    #[test]
    fn unknown_character_is_fatal() {
        let mut diags = Diagnostics::new();
        let err = lex(FileId(0), "x :: 1 ?", &mut diags).unwrap_err();
        assert!(matches!(err, CoreError::Lex { .. }));
        assert!(diags.has_errors());
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let mut diags = Diagnostics::new();
        let err = lex(FileId(0), "s :: \"open", &mut diags).unwrap_err();
        assert!(matches!(err, CoreError::Lex { .. }));
        assert!(diags.has_errors());
    }

    #[test]
    fn token_spans_reconstruct_the_source() {
        // Concatenating the source slice of every token must recover the
        // character stream minus whitespace and comments.
        let source = "main := fn() -> u32 { // entry\n  return 42 }";
        let tokens = lex_ok(source);
        let mut rebuilt = String::new();
        for token in &tokens {
            rebuilt.push_str(&source[token.span.start.offset as usize..token.span.end.offset as usize]);
        }
        let expected: String = source
            .lines()
            .map(|line| line.split("//").next().unwrap_or(""))
            .collect::<String>()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let rebuilt_no_ws: String = rebuilt.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(rebuilt_no_ws, expected);
    }
}
