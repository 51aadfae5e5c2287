//! Recursive-descent parser for WHERE conditions.
//!
//! Grammar (standard precedence, lowest first):
//! `expr := or`; `or := and ('OR' and)*`; `and := not ('AND' not)*`;
//! `not := 'NOT' not | cmp`; `cmp := '(' expr ')' | operand OP operand`.
//!
//! One side of a comparison must be a field reference (`$key`/`key`/
//! `key_name` or `$value`/`value`); a field on the right is swapped to the
//! left with the ordering operator inverted. Any other identifier used as
//! a field is an error.

use meteor_common::error::QueryError;
use meteor_common::types::Value;

use crate::lexer::{Lexer, Token, TokenKind};

/// Which record attribute a comparison reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRef {
    Key,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CmpOp {
    /// Mirror the operator for a swapped `value OP field` comparison.
    fn inverted(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }
}

#[derive(Debug)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        field: FieldRef,
        op: CmpOp,
        operand: String,
    },
}

impl Expr {
    fn eval(&self, key: &str, value: &Value) -> bool {
        match self {
            Expr::And(l, r) => l.eval(key, value) && r.eval(key, value),
            Expr::Or(l, r) => l.eval(key, value) || r.eval(key, value),
            Expr::Not(inner) => !inner.eval(key, value),
            Expr::Cmp { field, op, operand } => {
                let left = match field {
                    FieldRef::Key => key.to_string(),
                    FieldRef::Value => value.as_text(),
                };
                compare(&left, *op, operand)
            }
        }
    }
}

fn compare(left: &str, op: CmpOp, right: &str) -> bool {
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Lt => ordering(left, right, |a, b| a < b, |a, b| a < b),
        CmpOp::Le => ordering(left, right, |a, b| a <= b, |a, b| a <= b),
        CmpOp::Gt => ordering(left, right, |a, b| a > b, |a, b| a > b),
        CmpOp::Ge => ordering(left, right, |a, b| a >= b, |a, b| a >= b),
        CmpOp::Like => like(left, right),
    }
}

/// Ordering comparisons try numbers first and fall back to lexicographic.
fn ordering(
    left: &str,
    right: &str,
    num: impl Fn(f64, f64) -> bool,
    lex: impl Fn(&str, &str) -> bool,
) -> bool {
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        if l.is_finite() && r.is_finite() {
            return num(l, r);
        }
    }
    lex(left, right)
}

/// `%pat%` contains, `pat%` prefix, `%pat` suffix, no `%` exact match.
fn like(text: &str, pattern: &str) -> bool {
    if pattern.starts_with('%') && pattern.ends_with('%') && !pattern.is_empty() {
        text.contains(pattern.trim_matches('%'))
    } else if let Some(prefix) = pattern.strip_suffix('%') {
        text.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('%') {
        text.ends_with(suffix)
    } else {
        text == pattern
    }
}

/// A parsed condition, evaluated against `(key, value)` pairs.
/// Tombstones never match, whatever the expression says.
#[derive(Debug)]
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    /// Parse a condition, stripping a leading `WHERE ` (case-insensitive).
    pub fn parse(input: &str) -> Result<Self, QueryError> {
        let mut input = input.trim();
        if input.len() >= 6 && input.is_char_boundary(6) && input[..6].eq_ignore_ascii_case("WHERE ")
        {
            input = input[6..].trim();
        }

        let mut parser = Parser::new(input)?;
        let expr = parser.parse_or()?;
        if parser.current.kind != TokenKind::Eof {
            return Err(QueryError::UnexpectedToken {
                found: parser.current.kind.describe(),
                pos: parser.current.pos,
            });
        }
        Ok(Self { expr })
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        if value.is_tombstone() {
            return false;
        }
        self.expr.eval(key, value)
    }
}

struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    fn new(input: &str) -> Result<Self, QueryError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    fn bump(&mut self) -> Result<Token, QueryError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_and()?;
        while self.current.kind == TokenKind::Or {
            self.bump()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_not()?;
        while self.current.kind == TokenKind::And {
            self.bump()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, QueryError> {
        if self.current.kind == TokenKind::Not {
            self.bump()?;
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, QueryError> {
        if self.current.kind == TokenKind::LParen {
            self.bump()?;
            let expr = self.parse_or()?;
            if self.current.kind != TokenKind::RParen {
                return Err(QueryError::Expected {
                    what: "')'",
                    pos: self.current.pos,
                });
            }
            self.bump()?;
            return Ok(expr);
        }

        let left = self.expect_operand()?;
        let op = self.expect_operator()?;
        let right = self.expect_operand()?;

        // One side must resolve to a field reference; a field on the right
        // swaps sides and inverts ordering operators.
        let (field, operand, op) = match (resolve_field(&left), resolve_field(&right)) {
            (Some(field), _) => (field, operand_text(&right), op),
            (None, Some(field)) => (field, operand_text(&left), op.inverted()),
            (None, None) => {
                if let Some(name) = field_candidate(&left) {
                    return Err(QueryError::UnknownField(name));
                }
                return Err(QueryError::MissingField);
            }
        };

        Ok(Expr::Cmp { field, op, operand })
    }

    fn expect_operand(&mut self) -> Result<Token, QueryError> {
        match self.current.kind {
            TokenKind::Field(_) | TokenKind::Str(_) | TokenKind::Number(_) => self.bump(),
            _ => Err(QueryError::Expected {
                what: "field, string, or number",
                pos: self.current.pos,
            }),
        }
    }

    fn expect_operator(&mut self) -> Result<CmpOp, QueryError> {
        let op = match self.current.kind {
            TokenKind::Eq => CmpOp::Eq,
            TokenKind::Ne => CmpOp::Ne,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Ge => CmpOp::Ge,
            TokenKind::Like => CmpOp::Like,
            _ => {
                return Err(QueryError::Expected {
                    what: "comparison operator",
                    pos: self.current.pos,
                })
            }
        };
        self.bump()?;
        Ok(op)
    }
}

/// Resolve a token to a field reference, if it names one. Quoted strings
/// carrying the `$` sigil also count (`'$key' = 'a'`).
fn resolve_field(token: &Token) -> Option<FieldRef> {
    let name = field_candidate(token)?;
    match name.as_str() {
        "$key" | "key" | "key_name" => Some(FieldRef::Key),
        "$value" | "value" => Some(FieldRef::Value),
        _ => None,
    }
}

/// The token text when the token is positioned like a field name.
fn field_candidate(token: &Token) -> Option<String> {
    match &token.kind {
        TokenKind::Field(name) => Some(name.clone()),
        TokenKind::Str(s) if s.starts_with('$') => Some(s.clone()),
        _ => None,
    }
}

fn operand_text(token: &Token) -> String {
    match &token.kind {
        TokenKind::Field(s) | TokenKind::Str(s) | TokenKind::Number(s) => s.clone(),
        other => other.describe(),
    }
}
