//! Failure association rule language.
//!
//! A small boolean predicate language over the attributes of a failure:
//!
//! ```text
//! test = "ninja://chrome/test:foo/" AND reason LIKE "%timed out%"
//! NOT (test IN ("a", "b") OR REGEXP_CONTAINS(reason, "^panic: .*"))
//! ```
//!
//! Expressions are parsed and compiled once; evaluation never re-parses and
//! never fails. LIKE bodies and regular expressions must be literals so they
//! can be compiled up front.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};

// ============================================================================
// Fields and attribute access
// ============================================================================

/// An attribute of a failure a rule may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// The test identifier.
    Test,
    /// The primary error message of the failure.
    Reason,
}

impl Field {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Reason => "reason",
        }
    }

    fn parse(ident: &str) -> Option<Self> {
        match ident {
            "test" => Some(Self::Test),
            "reason" => Some(Self::Reason),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source of attribute values for rule evaluation.
///
/// An absent attribute evaluates as the empty string.
pub trait Attributes {
    fn attribute(&self, field: Field) -> Option<&str>;
}

impl Attributes for HashMap<String, String> {
    fn attribute(&self, field: Field) -> Option<&str> {
        self.get(field.name()).map(String::as_str)
    }
}

impl Attributes for BTreeMap<String, String> {
    fn attribute(&self, field: Field) -> Option<&str> {
        self.get(field.name()).map(String::as_str)
    }
}

// ============================================================================
// LIKE patterns
// ============================================================================

/// Escapes text so every character matches literally inside a LIKE pattern.
#[must_use]
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Checks `pattern` is a well formed LIKE body on its own.
///
/// The only valid escape sequences are `\\`, `\%` and `\_`; a trailing
/// unpaired backslash is rejected.
pub fn validate_like_pattern(pattern: &str) -> Result<()> {
    like_to_regex_body(pattern).map(|_| ())
}

fn like_to_regex_body(pattern: &str) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.char_indices();
    while let Some((pos, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, e @ ('\\' | '%' | '_'))) => {
                    out.push_str(&regex::escape(e.encode_utf8(&mut [0; 4])));
                }
                Some((_, other)) => {
                    return Err(Error::syntax_at(
                        format!("invalid escape sequence \"\\{other}\" in LIKE pattern"),
                        pos,
                    ));
                }
                None => {
                    return Err(Error::syntax_at(
                        "unfinished escape sequence \"\\\" at end of LIKE pattern",
                        pos,
                    ));
                }
            },
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    Ok(out)
}

/// A LIKE pattern compiled to an anchored regular expression.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let body = like_to_regex_body(pattern)?;
        let regex = Regex::new(&format!("(?s)^{body}$"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for LikePattern {}

/// A `REGEXP_CONTAINS` pattern (unanchored search).
#[derive(Debug, Clone)]
pub struct ContainsPattern {
    regex: Regex,
}

impl ContainsPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        self.regex.as_str()
    }
}

impl PartialEq for ContainsPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source()
    }
}

impl Eq for ContainsPattern {}

/// Renders `text` as a double quoted string literal of the rule language.
#[must_use]
pub fn quote_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if matches!(c, '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ============================================================================
// Expression tree
// ============================================================================

/// A compiled rule predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Bool(bool),
    Equal {
        field: Field,
        value: String,
        negated: bool,
    },
    Like {
        field: Field,
        pattern: LikePattern,
        negated: bool,
    },
    In {
        field: Field,
        values: Vec<String>,
        negated: bool,
    },
    RegexpContains {
        field: Field,
        pattern: ContainsPattern,
    },
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    /// Parses and compiles a rule definition.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: text.len(),
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(Error::syntax_at(
                format!("unexpected {} after end of expression", tok.kind),
                tok.pos,
            ));
        }
        Ok(expr)
    }

    /// Evaluates the predicate against the given attributes.
    #[must_use]
    pub fn evaluate<A: Attributes + ?Sized>(&self, values: &A) -> bool {
        let get = |field: Field| values.attribute(field).unwrap_or("");
        match self {
            Self::Bool(b) => *b,
            Self::Equal {
                field,
                value,
                negated,
            } => (get(*field) == value) != *negated,
            Self::Like {
                field,
                pattern,
                negated,
            } => pattern.matches(get(*field)) != *negated,
            Self::In {
                field,
                values: options,
                negated,
            } => {
                let v = get(*field);
                options.iter().any(|o| o == v) != *negated
            }
            Self::RegexpContains { field, pattern } => pattern.regex.is_match(get(*field)),
            Self::Not(inner) => !inner.evaluate(values),
            Self::And(items) => items.iter().all(|e| e.evaluate(values)),
            Self::Or(items) => items.iter().any(|e| e.evaluate(values)),
        }
    }

    const fn is_compound(&self) -> bool {
        matches!(self, Self::And(_) | Self::Or(_))
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    if expr.is_compound() {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("TRUE"),
            Self::Bool(false) => f.write_str("FALSE"),
            Self::Equal {
                field,
                value,
                negated,
            } => {
                let op = if *negated { "!=" } else { "=" };
                write!(f, "{field} {op} {}", quote_literal(value))
            }
            Self::Like {
                field,
                pattern,
                negated,
            } => {
                let op = if *negated { "NOT LIKE" } else { "LIKE" };
                write!(f, "{field} {op} {}", quote_literal(pattern.source()))
            }
            Self::In {
                field,
                values,
                negated,
            } => {
                let op = if *negated { "NOT IN" } else { "IN" };
                let list = values
                    .iter()
                    .map(|v| quote_literal(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{field} {op} ({list})")
            }
            Self::RegexpContains { field, pattern } => {
                write!(
                    f,
                    "REGEXP_CONTAINS({field}, {})",
                    quote_literal(pattern.source())
                )
            }
            Self::Not(inner) => {
                f.write_str("NOT ")?;
                write_operand(f, inner)
            }
            Self::And(items) | Self::Or(items) => {
                let sep = if matches!(self, Self::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write_operand(f, item)?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "identifier {s:?}"),
            Self::Str(s) => write!(f, "string {}", quote_literal(s)),
            Self::LParen => f.write_str("\"(\""),
            Self::RParen => f.write_str("\")\""),
            Self::Comma => f.write_str("\",\""),
            Self::Eq => f.write_str("\"=\""),
            Self::NotEq => f.write_str("\"!=\""),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '=' => {
                chars.next();
                TokenKind::Eq
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => TokenKind::NotEq,
                    _ => return Err(Error::syntax_at("expected \"!=\"", pos)),
                }
            }
            '<' => {
                chars.next();
                match chars.next() {
                    Some((_, '>')) => TokenKind::NotEq,
                    _ => return Err(Error::syntax_at("expected \"<>\"", pos)),
                }
            }
            '"' | '\'' => {
                chars.next();
                TokenKind::Str(lex_string(&mut chars, c, pos)?)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(ident)
            }
            other => {
                return Err(Error::syntax_at(
                    format!("unexpected character {other:?}"),
                    pos,
                ));
            }
        };
        tokens.push(Token { kind, pos });
    }
    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    start: usize,
) -> Result<String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            None => return Err(Error::syntax_at("unterminated string literal", start)),
            Some((_, c)) if c == quote => return Ok(value),
            Some((pos, '\\')) => match chars.next() {
                Some((_, c @ ('\\' | '"' | '\''))) => value.push(c),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => {
                    return Err(Error::syntax_at(
                        format!("invalid escape sequence \"\\{other}\" in string literal"),
                        pos,
                    ));
                }
                None => return Err(Error::syntax_at("unterminated string literal", start)),
            },
            Some((_, c)) => value.push(c),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Ident(s), .. }) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        match self.next() {
            Some(tok) if &tok.kind == kind => Ok(()),
            Some(tok) => Err(Error::syntax_at(
                format!("expected {kind}, got {}", tok.kind),
                tok.pos,
            )),
            None => Err(Error::syntax_at(
                format!("expected {kind}, got end of input"),
                self.end,
            )),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(s),
            Some(tok) => Err(Error::syntax_at(
                format!("expected string literal, got {}", tok.kind),
                tok.pos,
            )),
            None => Err(Error::syntax_at(
                "expected string literal, got end of input",
                self.end,
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let Some(tok) = self.next() else {
            return Err(Error::syntax_at(
                "expected expression, got end of input",
                self.end,
            ));
        };
        match tok.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(ident) => {
                if ident.eq_ignore_ascii_case("TRUE") {
                    return Ok(Expr::Bool(true));
                }
                if ident.eq_ignore_ascii_case("FALSE") {
                    return Ok(Expr::Bool(false));
                }
                if ident.eq_ignore_ascii_case("REGEXP_CONTAINS") {
                    return self.parse_regexp_contains();
                }
                let field = Field::parse(&ident).ok_or_else(|| {
                    Error::syntax_at(
                        format!("unknown identifier {ident:?}, expected \"test\" or \"reason\""),
                        tok.pos,
                    )
                })?;
                self.parse_predicate(field)
            }
            other => Err(Error::syntax_at(
                format!("expected expression, got {other}"),
                tok.pos,
            )),
        }
    }

    fn parse_regexp_contains(&mut self) -> Result<Expr> {
        self.expect(&TokenKind::LParen)?;
        let field = match self.next() {
            Some(Token {
                kind: TokenKind::Ident(ident),
                pos,
            }) => Field::parse(&ident).ok_or_else(|| {
                Error::syntax_at(format!("unknown identifier {ident:?}"), pos)
            })?,
            Some(tok) => {
                return Err(Error::syntax_at(
                    format!("expected identifier, got {}", tok.kind),
                    tok.pos,
                ));
            }
            None => {
                return Err(Error::syntax_at(
                    "expected identifier, got end of input",
                    self.end,
                ));
            }
        };
        self.expect(&TokenKind::Comma)?;
        let at = self.peek().map_or(self.end, |t| t.pos);
        let source = self.expect_string()?;
        let pattern = ContainsPattern::new(&source)
            .map_err(|err| Error::syntax_at(format!("invalid regular expression: {err}"), at))?;
        self.expect(&TokenKind::RParen)?;
        Ok(Expr::RegexpContains { field, pattern })
    }

    fn parse_predicate(&mut self, field: Field) -> Result<Expr> {
        let Some(tok) = self.next() else {
            return Err(Error::syntax_at(
                format!("expected operator after {field}, got end of input"),
                self.end,
            ));
        };
        match &tok.kind {
            TokenKind::Eq | TokenKind::NotEq => Ok(Expr::Equal {
                field,
                value: self.expect_string()?,
                negated: tok.kind == TokenKind::NotEq,
            }),
            TokenKind::Ident(op) if op.eq_ignore_ascii_case("NOT") => {
                if self.eat_keyword("LIKE") {
                    self.parse_like(field, true)
                } else if self.eat_keyword("IN") {
                    self.parse_in(field, true)
                } else {
                    Err(Error::syntax_at("expected LIKE or IN after NOT", tok.pos))
                }
            }
            TokenKind::Ident(op) if op.eq_ignore_ascii_case("LIKE") => self.parse_like(field, false),
            TokenKind::Ident(op) if op.eq_ignore_ascii_case("IN") => self.parse_in(field, false),
            other => Err(Error::syntax_at(
                format!("expected operator after {field}, got {other}"),
                tok.pos,
            )),
        }
    }

    fn parse_like(&mut self, field: Field, negated: bool) -> Result<Expr> {
        let at = self.peek().map_or(self.end, |t| t.pos);
        let source = self.expect_string()?;
        let pattern = LikePattern::new(&source).map_err(|err| match err {
            Error::Syntax { message, .. } => Error::syntax_at(message, at),
            other => other,
        })?;
        Ok(Expr::Like {
            field,
            pattern,
            negated,
        })
    }

    fn parse_in(&mut self, field: Field, negated: bool) -> Result<Expr> {
        self.expect(&TokenKind::LParen)?;
        let mut values = vec![self.expect_string()?];
        loop {
            match self.next() {
                Some(Token {
                    kind: TokenKind::Comma,
                    ..
                }) => values.push(self.expect_string()?),
                Some(Token {
                    kind: TokenKind::RParen,
                    ..
                }) => break,
                Some(tok) => {
                    return Err(Error::syntax_at(
                        format!("expected \",\" or \")\", got {}", tok.kind),
                        tok.pos,
                    ));
                }
                None => {
                    return Err(Error::syntax_at(
                        "unterminated IN list",
                        self.end,
                    ));
                }
            }
        }
        Ok(Expr::In {
            field,
            values,
            negated,
        })
    }
}
