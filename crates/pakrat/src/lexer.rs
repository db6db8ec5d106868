//! The character-stream tokenizer.
//!
//! Tokens are lexed lazily: a [`Cursor`] materializes one token and knows how
//! to produce the next one from its end offset. A token is a pure function of
//! (source, lexer config, byte offset, newline flag), so cursors are freely
//! copyable and re-startable, and flipping newline significance mid-stream
//! never requires re-scanning or invalidating anything.

use crate::{LexerError, Span, TokenKind};

/// Tokenizer over a source string.
///
/// `skip_whitespace` suppresses whitespace tokens entirely, `skip_newlines`
/// additionally suppresses runs that contain a newline (it is the default for
/// new cursors; each cursor carries its own copy of the flag, see
/// [`Cursor::start_newline`]). With `return_unknown` set, unclassifiable
/// input becomes a single-character `Unknown` token instead of a
/// [`LexerError`].
#[derive(Debug)]
pub struct Lexer<'a> {
    src: &'a str,
    pub skip_whitespace: bool,
    pub skip_newlines: bool,
    pub return_unknown: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src,
            skip_whitespace: true,
            skip_newlines: true,
            return_unknown: false,
        }
    }

    pub fn src(&self) -> &'a str {
        self.src
    }

    /// Cursor at the first token. Fails if the very first token is already
    /// malformed.
    pub fn begin(&self) -> Result<Cursor<'_>, LexerError> {
        Cursor::lex(self, 0, !self.skip_newlines)
    }

    /// The end-of-stream sentinel cursor.
    pub fn eof(&self) -> Cursor<'_> {
        let end = self.src.len() as u32;
        Cursor {
            lexer: self,
            kind: TokenKind::Eof,
            span: Span::at(end),
            newline: !self.skip_newlines,
        }
    }

    /// Convenience iterator over all tokens, stopping after the first error.
    pub fn iter(&self) -> Tokens<'_> {
        Tokens {
            next: Some(self.begin()),
        }
    }
}

/// A position in the token stream.
///
/// Dereferencing (`text`) yields a slice of the source, no characters are
/// copied. The `newline` flag controls whether tokens lexed *after* the
/// current one surface whitespace runs containing a newline; the current
/// token is unaffected by toggling it.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    lexer: &'a Lexer<'a>,
    kind: TokenKind,
    span: Span,
    newline: bool,
}

impl<'a> Cursor<'a> {
    fn lex(lexer: &'a Lexer<'a>, start: u32, newline: bool) -> Result<Cursor<'a>, LexerError> {
        let src = lexer.src;
        let mut pos = start;
        loop {
            let rest = &src[pos as usize..];
            let first = match rest.chars().next() {
                Some(c) => c,
                None => return Ok(lexer.eof().with_newline(newline)),
            };

            let kind;
            let end;
            match first {
                '{' | '}' | '[' | ']' | '(' | ')' => {
                    kind = bracket_kind(first);
                    end = pos + 1;
                }
                c if c.is_ascii_whitespace() => {
                    let run_end = scan_while(src, pos, |c| c.is_ascii_whitespace());
                    let has_newline = src[pos as usize..run_end as usize].contains('\n');
                    if lexer.skip_whitespace && (!has_newline || !newline) {
                        pos = run_end;
                        continue;
                    }
                    kind = TokenKind::Whitespace;
                    end = run_end;
                }
                '/' if rest.as_bytes().get(1) == Some(&b'/') => {
                    kind = TokenKind::Comment;
                    end = scan_while(src, pos, |c| c != '\n');
                }
                '"' => {
                    kind = TokenKind::StringLiteral;
                    end = scan_string(src, pos)?;
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    kind = TokenKind::Identifier;
                    end = scan_while(src, pos + 1, |c| c.is_ascii_alphanumeric() || c == '_');
                }
                c if c.is_ascii_digit() => {
                    // over-accepts on purpose, numeric validation happens in
                    // value conversion
                    kind = TokenKind::NumberLiteral;
                    end = scan_while(src, pos + 1, |c| {
                        c.is_ascii_hexdigit() || c == 'x' || c == '.'
                    });
                }
                c if c.is_ascii_punctuation() => {
                    kind = TokenKind::Operator;
                    end = scan_while(src, pos, |c| c.is_ascii_punctuation() && !is_bracket(c));
                }
                c => {
                    let char_end = pos + c.len_utf8() as u32;
                    if !lexer.return_unknown {
                        return Err(LexerError {
                            message: "unknown input type".to_string(),
                            span: Span {
                                start: pos,
                                end: char_end,
                            },
                        });
                    }
                    kind = TokenKind::Unknown;
                    end = char_end;
                }
            }

            return Ok(Cursor {
                lexer,
                kind,
                span: Span { start: pos, end },
                newline,
            });
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// The raw text of the current token.
    ///
    /// Asking the end-of-stream cursor for text is a programming error.
    pub fn text(&self) -> &'a str {
        if self.is_eof() {
            panic!("text of the end-of-stream cursor");
        }
        self.span.as_str(self.lexer.src)
    }

    /// Cursor at the next token. Returns itself at end of stream.
    pub fn advance(self) -> Result<Cursor<'a>, LexerError> {
        if self.is_eof() {
            return Ok(self);
        }
        Cursor::lex(self.lexer, self.span.end, self.newline)
    }

    /// Surface whitespace runs containing a newline from the next token on.
    pub fn start_newline(self) -> Cursor<'a> {
        self.with_newline(true)
    }

    /// Go back to suppressing all whitespace runs from the next token on.
    pub fn stop_newline(self) -> Cursor<'a> {
        self.with_newline(false)
    }

    pub fn newlines_significant(&self) -> bool {
        self.newline
    }

    fn with_newline(mut self, newline: bool) -> Cursor<'a> {
        self.newline = newline;
        self
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.span.start == other.span.start && self.newline == other.newline
    }
}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.span.start.cmp(&other.span.start))
    }
}

/// Token-count distance between two positions into the same stream.
impl std::ops::Sub for Cursor<'_> {
    type Output = usize;

    fn sub(self, earlier: Self) -> usize {
        let mut cursor = earlier;
        let mut count = 0;
        while !cursor.is_eof() && cursor.span.start < self.span.start {
            match cursor.advance() {
                Ok(next) => cursor = next,
                Err(_) => break,
            }
            count += 1;
        }
        count
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cursor({:?} @ {}..{})",
            self.kind, self.span.start, self.span.end
        )
    }
}

fn bracket_kind(c: char) -> TokenKind {
    match c {
        '{' => TokenKind::OpenBrace,
        '}' => TokenKind::CloseBrace,
        '[' => TokenKind::OpenBracket,
        ']' => TokenKind::CloseBracket,
        '(' => TokenKind::OpenParen,
        ')' => TokenKind::CloseParen,
        _ => unreachable!(),
    }
}

fn is_bracket(c: char) -> bool {
    matches!(c, '{' | '}' | '[' | ']' | '(' | ')')
}

fn scan_while(src: &str, start: u32, pred: impl Fn(char) -> bool) -> u32 {
    let mut end = start as usize;
    for c in src[start as usize..].chars() {
        if !pred(c) {
            break;
        }
        end += c.len_utf8();
    }
    end as u32
}

/// Scans a quoted literal starting at `start`. A backslash toggles the
/// escaped flag, so `\"` does not close the literal but `\\"` does.
fn scan_string(src: &str, start: u32) -> Result<u32, LexerError> {
    let bytes = src.as_bytes();
    let mut i = start as usize + 1;
    let mut escaped = false;
    loop {
        match bytes.get(i) {
            None => {
                return Err(LexerError {
                    message: "string literal not closed".to_string(),
                    span: Span {
                        start,
                        end: src.len() as u32,
                    },
                })
            }
            Some(b'"') if !escaped => return Ok(i as u32 + 1),
            Some(b'\\') => escaped = !escaped,
            Some(_) => escaped = false,
        }
        i += 1;
    }
}

/// Iterator over the token stream, yielding cursors. Ends at the first
/// lexing error, after yielding it.
pub struct Tokens<'a> {
    next: Option<Result<Cursor<'a>, LexerError>>,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Cursor<'a>, LexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next.take()? {
            Ok(cursor) if cursor.is_eof() => None,
            Ok(cursor) => {
                self.next = Some(cursor.advance());
                Some(Ok(cursor))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenKind::*;

    fn kinds(lexer: &Lexer) -> Vec<(TokenKind, String)> {
        lexer
            .iter()
            .map(|t| {
                let t = t.unwrap();
                (t.kind(), t.text().to_string())
            })
            .collect()
    }

    #[test]
    fn single_identifier() {
        let lexer = Lexer::new("abc");
        assert_eq!(kinds(&lexer), vec![(Identifier, "abc".to_string())]);
    }

    #[test]
    fn identifiers_and_numbers() {
        let lexer = Lexer::new("foo_1 _bar 0xFF 10 3.14");
        #[rustfmt::skip]
        assert_eq!(kinds(&lexer), vec![
            (Identifier,    "foo_1".to_string()),
            (Identifier,    "_bar".to_string()),
            (NumberLiteral, "0xFF".to_string()),
            (NumberLiteral, "10".to_string()),
            (NumberLiteral, "3.14".to_string()),
        ]);
    }

    #[test]
    fn number_scan_over_accepts() {
        // placement of 'x' and '.' is not checked here, value conversion
        // rejects the garbage later
        let lexer = Lexer::new("0xff.x.x");
        assert_eq!(kinds(&lexer), vec![(NumberLiteral, "0xff.x.x".to_string())]);
    }

    #[test]
    fn brackets_are_single_tokens() {
        let lexer = Lexer::new("{}[]()");
        let got: Vec<_> = kinds(&lexer).into_iter().map(|(k, _)| k).collect();
        #[rustfmt::skip]
        assert_eq!(got, vec![
            OpenBrace, CloseBrace, OpenBracket, CloseBracket, OpenParen, CloseParen,
        ]);
    }

    #[test]
    fn operators_run_until_bracket() {
        let lexer = Lexer::new("a+=b;(c)");
        assert_eq!(
            kinds(&lexer),
            vec![
                (Identifier, "a".to_string()),
                (Operator, "+=".to_string()),
                (Identifier, "b".to_string()),
                (Operator, ";".to_string()),
                (OpenParen, "(".to_string()),
                (Identifier, "c".to_string()),
                (CloseParen, ")".to_string()),
            ]
        );
    }

    #[test]
    fn string_literal_with_escaped_quote() {
        let lexer = Lexer::new(r#""he said \"hi\"""#);
        assert_eq!(
            kinds(&lexer),
            vec![(StringLiteral, r#""he said \"hi\"""#.to_string())]
        );
    }

    #[test]
    fn string_literal_escaped_backslash_closes() {
        let lexer = Lexer::new(r#""a\\" b"#);
        assert_eq!(
            kinds(&lexer),
            vec![
                (StringLiteral, r#""a\\""#.to_string()),
                (Identifier, "b".to_string()),
            ]
        );
    }

    #[test]
    fn unterminated_string_fails() {
        let lexer = Lexer::new(r#""oops"#);
        let err = lexer.begin().unwrap_err();
        assert_eq!(err.message, "string literal not closed");
    }

    #[test]
    fn comment_runs_to_end_of_line() {
        let lexer = Lexer::new("a // rest of line\nb");
        assert_eq!(
            kinds(&lexer),
            vec![
                (Identifier, "a".to_string()),
                (Comment, "// rest of line".to_string()),
                (Identifier, "b".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_input_raises_or_tokenizes() {
        let lexer = Lexer::new("a\u{00e9}b");
        let cursor = lexer.begin().unwrap();
        assert_eq!(cursor.text(), "a");
        let err = cursor.advance().unwrap_err();
        assert_eq!(err.message, "unknown input type");

        let mut lexer = Lexer::new("a\u{00e9}b");
        lexer.return_unknown = true;
        assert_eq!(
            kinds(&lexer),
            vec![
                (Identifier, "a".to_string()),
                (Unknown, "\u{00e9}".to_string()),
                (Identifier, "b".to_string()),
            ]
        );
    }

    #[test]
    fn round_trip_with_whitespace_kept() {
        let src = "int x = 0xFF; // init\n  { y(\"s\\\"t\") }\n";
        let mut lexer = Lexer::new(src);
        lexer.skip_whitespace = false;
        let mut rebuilt = String::new();
        for token in lexer.iter() {
            rebuilt.push_str(token.unwrap().text());
        }
        assert_eq!(rebuilt, src);
    }

    #[test]
    fn newline_runs_surface_when_significant() {
        let mut lexer = Lexer::new("a b\nc");
        lexer.skip_newlines = false;
        let got = kinds(&lexer);
        // the run between `a` and `b` has no newline and stays suppressed
        assert_eq!(
            got,
            vec![
                (Identifier, "a".to_string()),
                (Identifier, "b".to_string()),
                (Whitespace, "\n".to_string()),
                (Identifier, "c".to_string()),
            ]
        );
    }

    #[test]
    fn newline_toggle_takes_effect_on_next_token() {
        let lexer = Lexer::new("a\nb\nc");
        let a = lexer.begin().unwrap();
        assert_eq!(a.text(), "a");

        // suppressed by default
        let b = a.advance().unwrap();
        assert_eq!(b.text(), "b");

        // the toggled cursor surfaces the following run
        let ws = b.start_newline().advance().unwrap();
        assert_eq!(ws.kind(), Whitespace);
        let c = ws.advance().unwrap();
        assert_eq!(c.text(), "c");

        // and toggling back suppresses again
        let b2 = a.start_newline().advance().unwrap();
        assert_eq!(b2.kind(), Whitespace);
        let b2 = b2.advance().unwrap();
        assert_eq!(b2.text(), "b");
        let c2 = b2.stop_newline().advance().unwrap();
        assert_eq!(c2.text(), "c");
    }

    #[test]
    fn cursor_distance_and_ordering() {
        let lexer = Lexer::new("a b c d");
        let begin = lexer.begin().unwrap();
        let mut third = begin;
        for _ in 0..2 {
            third = third.advance().unwrap();
        }
        assert!(begin < third);
        assert_eq!(third - begin, 2);
        assert_eq!(lexer.eof() - begin, 4);
        assert_eq!(begin - begin, 0);
    }

    #[test]
    fn eof_is_stable() {
        let lexer = Lexer::new("x");
        let end = lexer.begin().unwrap().advance().unwrap();
        assert!(end.is_eof());
        assert_eq!(end.advance().unwrap(), end);
        assert_eq!(end, lexer.eof());
    }

    #[test]
    #[should_panic(expected = "end-of-stream")]
    fn eof_text_panics() {
        let lexer = Lexer::new("");
        let _ = lexer.eof().text();
    }

    #[test]
    fn whitespace_only_input_is_empty_stream() {
        let lexer = Lexer::new("  \n\t ");
        assert!(lexer.begin().unwrap().is_eof());
    }
}
