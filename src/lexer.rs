//! Tokenizer for aggregate data expressions
//!
//! Compilation is two-phase:
//! 1. Lexer: expression text → token stream
//! 2. Parser: token stream → AST
//!
//! The split keeps keyword/function-name classification out of the grammar:
//! the pest rules only produce `word` tokens, and the parser decides what a
//! word means. Keywords are recognised case-insensitively.

use pest::Parser;
use pest_derive::Parser;

use crate::error::{ExpressionError, Result};

#[derive(Parser)]
#[grammar = "lexer.pest"]
struct LexerParser;

/// Position information for a token
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

/// A token with its kind and position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Span of source text
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: Position,
    pub end: Position,
    pub text: String,
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords (case-insensitive in source)
    And,
    Or,
    Not,
    True,
    False,

    // Literals
    Number(f64),
    Text(String),

    /// Bare word; function names are classified by the parser
    Word(String),

    /// Typed identifier reference such as `#{uid}` or `OUG{uid}`
    Reference { prefix: String, id: String },

    /// The `[days]` scalar
    Days,

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Caret,        // ^
    Equal,        // =
    NotEqual,     // <>
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=

    // Punctuation
    LeftParen,  // (
    RightParen, // )
    Comma,      // ,

    // Special
    Eof,
}

/// Lexer that converts expression text to tokens
pub struct Lexer<'a> {
    source: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the expression text
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let pairs = LexerParser::parse(Rule::tokens, self.source)?;

        for pair in pairs {
            if pair.as_rule() == Rule::tokens {
                for inner in pair.into_inner() {
                    if inner.as_rule() == Rule::token {
                        if let Some(token) = self.process_token(inner)? {
                            self.tokens.push(token);
                        }
                    }
                }
            }
        }

        let eof_pos = self.position_from_offset(self.source.len());
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span {
                start: eof_pos.clone(),
                end: eof_pos,
                text: String::new(),
            },
        });

        Ok(self.tokens.clone())
    }

    /// Process a single token pair
    fn process_token(&self, pair: pest::iterators::Pair<Rule>) -> Result<Option<Token>> {
        let span = self.span_from_pair(&pair);

        for inner in pair.into_inner() {
            let kind = match inner.as_rule() {
                Rule::reference_token => {
                    let mut prefix = String::new();
                    let mut id = String::new();
                    for part in inner.into_inner() {
                        match part.as_rule() {
                            Rule::reference_prefix => prefix = part.as_str().to_string(),
                            Rule::reference_id => id = part.as_str().to_string(),
                            _ => {}
                        }
                    }
                    TokenKind::Reference { prefix, id }
                }

                Rule::days_token => TokenKind::Days,

                Rule::number_token => {
                    let text = inner.as_str();
                    let n: f64 = text.parse().map_err(|_| {
                        ExpressionError::syntax(
                            span.start.line,
                            span.start.column,
                            format!("invalid number: {}", text),
                        )
                    })?;
                    TokenKind::Number(n)
                }

                Rule::string_token => {
                    let text = inner.as_str();
                    // Drop the surrounding quotes, then unescape
                    TokenKind::Text(self.unescape_string(&text[1..text.len() - 1]))
                }

                Rule::word_token => {
                    let text = inner.as_str();
                    match text.to_ascii_lowercase().as_str() {
                        "and" => TokenKind::And,
                        "or" => TokenKind::Or,
                        "not" => TokenKind::Not,
                        "true" => TokenKind::True,
                        "false" => TokenKind::False,
                        _ => TokenKind::Word(text.to_string()),
                    }
                }

                Rule::operator_token => match inner.as_str() {
                    "<=" => TokenKind::LessEqual,
                    ">=" => TokenKind::GreaterEqual,
                    "<>" => TokenKind::NotEqual,
                    "<" => TokenKind::Less,
                    ">" => TokenKind::Greater,
                    "=" => TokenKind::Equal,
                    "+" => TokenKind::Plus,
                    "-" => TokenKind::Minus,
                    "*" => TokenKind::Star,
                    "/" => TokenKind::Slash,
                    "%" => TokenKind::Percent,
                    "^" => TokenKind::Caret,
                    op => {
                        return Err(ExpressionError::Internal(format!(
                            "unhandled operator token: {}",
                            op
                        )))
                    }
                },

                Rule::punctuation_token => match inner.as_str() {
                    "(" => TokenKind::LeftParen,
                    ")" => TokenKind::RightParen,
                    "," => TokenKind::Comma,
                    p => {
                        return Err(ExpressionError::Internal(format!(
                            "unhandled punctuation token: {}",
                            p
                        )))
                    }
                },

                _ => continue,
            };

            return Ok(Some(Token { kind, span }));
        }

        Ok(None)
    }

    /// Unescape a string literal body (handle \n, \t, quotes, backslash)
    fn unescape_string(&self, s: &str) -> String {
        let mut result = String::new();
        let mut chars = s.chars();

        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some('"') => result.push('"'),
                    Some('\'') => result.push('\''),
                    Some('\\') => result.push('\\'),
                    Some(other) => {
                        result.push('\\');
                        result.push(other);
                    }
                    None => result.push('\\'),
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Create a Span from a pest Pair
    fn span_from_pair(&self, pair: &pest::iterators::Pair<Rule>) -> Span {
        let pest_span = pair.as_span();
        let (start_line, start_column) = pest_span.start_pos().line_col();
        let (end_line, end_column) = pest_span.end_pos().line_col();

        Span {
            start: Position {
                line: start_line,
                column: start_column,
                offset: pest_span.start(),
            },
            end: Position {
                line: end_line,
                column: end_column,
                offset: pest_span.end(),
            },
            text: pair.as_str().to_string(),
        }
    }

    /// Calculate line and column from byte offset
    fn position_from_offset(&self, offset: usize) -> Position {
        let mut line = 1;
        let mut column = 1;

        for (i, c) in self.source.char_indices() {
            if i >= offset {
                break;
            }
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }

        Position {
            line,
            column,
            offset,
        }
    }
}

/// Convenience function to tokenize a string
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keywords_case_insensitive() {
        let tokens = tokenize("AND or Not TRUE false").unwrap();
        assert_eq!(tokens.len(), 6); // 5 keywords + EOF
        assert!(matches!(tokens[0].kind, TokenKind::And));
        assert!(matches!(tokens[1].kind, TokenKind::Or));
        assert!(matches!(tokens[2].kind, TokenKind::Not));
        assert!(matches!(tokens[3].kind, TokenKind::True));
        assert!(matches!(tokens[4].kind, TokenKind::False));
    }

    #[test]
    fn test_keyword_vs_word() {
        // "android" starts with "and" but is a single word
        let tokens = tokenize("and android").unwrap();
        assert_eq!(tokens.len(), 3);
        assert!(matches!(tokens[0].kind, TokenKind::And));
        assert!(matches!(&tokens[1].kind, TokenKind::Word(s) if s == "android"));
    }

    #[test]
    fn test_tokenize_data_item_reference() {
        let tokens = tokenize("#{fbfJHSPpUQD}").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(matches!(
            &tokens[0].kind,
            TokenKind::Reference { prefix, id } if prefix == "#" && id == "fbfJHSPpUQD"
        ));
        assert_eq!(tokens[0].span.text, "#{fbfJHSPpUQD}");
    }

    #[test]
    fn test_tokenize_operand_reference_keeps_dot() {
        let tokens = tokenize("#{fbfJHSPpUQD.pq2XK5t3yvg}").unwrap();
        assert!(matches!(
            &tokens[0].kind,
            TokenKind::Reference { id, .. } if id == "fbfJHSPpUQD.pq2XK5t3yvg"
        ));
    }

    #[test]
    fn test_tokenize_group_count_reference() {
        let tokens = tokenize("OUG{CXw2yu5fodb}").unwrap();
        assert!(matches!(
            &tokens[0].kind,
            TokenKind::Reference { prefix, id } if prefix == "OUG" && id == "CXw2yu5fodb"
        ));
    }

    #[test]
    fn test_reference_prefix_vs_bare_word() {
        // A bare "A" not followed by a brace is a word, not a reference
        let tokens = tokenize("A A{uid1}").unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::Word(s) if s == "A"));
        assert!(matches!(
            &tokens[1].kind,
            TokenKind::Reference { prefix, .. } if prefix == "A"
        ));
    }

    #[test]
    fn test_tokenize_days() {
        let tokens = tokenize("[days] [DAYS]").unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Days));
        assert!(matches!(tokens[1].kind, TokenKind::Days));
    }

    #[test]
    fn test_tokenize_numbers() {
        let tokens = tokenize("1 2.5 3e2 1.5E-3").unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Number(n) if n == 1.0));
        assert!(matches!(tokens[1].kind, TokenKind::Number(n) if n == 2.5));
        assert!(matches!(tokens[2].kind, TokenKind::Number(n) if n == 300.0));
        assert!(matches!(tokens[3].kind, TokenKind::Number(n) if n == 0.0015));
    }

    #[test]
    fn test_tokenize_strings_both_quote_styles() {
        let tokens = tokenize(r#""double" 'single'"#).unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::Text(s) if s == "double"));
        assert!(matches!(&tokens[1].kind, TokenKind::Text(s) if s == "single"));
    }

    #[test]
    fn test_tokenize_string_escapes() {
        let tokens = tokenize(r#""a\"b\\c""#).unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::Text(s) if s == "a\"b\\c"));
    }

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("+ - * / % ^ = <> < <= > >=").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Caret,
                TokenKind::Equal,
                TokenKind::NotEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = tokenize("1 +\n2").unwrap();
        assert_eq!(tokens[0].span.start.line, 1);
        assert_eq!(tokens[0].span.start.column, 1);
        assert_eq!(tokens[2].span.start.line, 2);
        assert_eq!(tokens[2].span.start.column, 1);
    }

    #[test]
    fn test_tokenize_rejects_stray_character() {
        let err = tokenize("1 @ 2").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_eof_is_always_last() {
        let tokens = tokenize("").unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(matches!(tokens[0].kind, TokenKind::Eof));
    }
}
