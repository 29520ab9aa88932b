//! Trip condition expressions for the circuit breaker.
//!
//! # Grammar
//! ```text
//! expr    := and ( "||" and )*
//! and     := term ( "&&" term )*
//! term    := "(" expr ")" | metric op number
//! metric  := "NetworkErrorRatio()"
//!          | "ResponseCodeRatio(" int "," int "," int "," int ")"
//!          | "LatencyAtQuantileMS(" number ")"
//! op      := "<" | "<=" | ">" | ">=" | "==" | "!="
//! ```
//! Example: `NetworkErrorRatio() > 0.5 || LatencyAtQuantileMS(50.0) > 50`

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected token {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

/// Values a condition is evaluated against.
pub trait WindowMetrics {
    /// Share of requests that failed at the network level.
    fn network_error_ratio(&self) -> f64;

    /// Responses with codes in `[start, end)` divided by responses with
    /// codes in `[d_start, d_end)`.
    fn response_code_ratio(&self, start: u16, end: u16, d_start: u16, d_end: u16) -> f64;

    /// Response time at quantile `q` (0-100) in milliseconds.
    fn latency_at_quantile_ms(&self, q: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    NetworkErrorRatio,
    ResponseCodeRatio(u16, u16, u16, u16),
    LatencyAtQuantileMs(f64),
}

impl Metric {
    fn value(&self, m: &dyn WindowMetrics) -> f64 {
        match *self {
            Metric::NetworkErrorRatio => m.network_error_ratio(),
            Metric::ResponseCodeRatio(a, b, c, d) => m.response_code_ratio(a, b, c, d),
            Metric::LatencyAtQuantileMs(q) => m.latency_at_quantile_ms(q),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// Parsed trip condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { metric: Metric, op: CmpOp, value: f64 },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn evaluate(&self, metrics: &dyn WindowMetrics) -> bool {
        match self {
            Condition::Compare { metric, op, value } => op.apply(metric.value(metrics), *value),
            Condition::And(l, r) => l.evaluate(metrics) && r.evaluate(metrics),
            Condition::Or(l, r) => l.evaluate(metrics) || r.evaluate(metrics),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.expr()?;
        match parser.peek() {
            None => Ok(condition),
            Some((tok, offset)) => Err(ConditionError::UnexpectedToken {
                found: tok.to_string(),
                expected: "end of expression",
                offset,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    LParen,
    RParen,
    Comma,
    Op(CmpOp),
    And,
    Or,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) | Token::Number(s) => write!(f, "{:?}", s),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Op(op) => write!(f, "{:?}", op),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;

        let two = input.get(i..i + 2).unwrap_or("");
        let token = match (c, two) {
            (c, _) if c.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            (_, "&&") => {
                i += 2;
                Token::And
            }
            (_, "||") => {
                i += 2;
                Token::Or
            }
            (_, "<=") => {
                i += 2;
                Token::Op(CmpOp::Le)
            }
            (_, ">=") => {
                i += 2;
                Token::Op(CmpOp::Ge)
            }
            (_, "==") => {
                i += 2;
                Token::Op(CmpOp::Eq)
            }
            (_, "!=") => {
                i += 2;
                Token::Op(CmpOp::Ne)
            }
            ('<', _) => {
                i += 1;
                Token::Op(CmpOp::Lt)
            }
            ('>', _) => {
                i += 1;
                Token::Op(CmpOp::Gt)
            }
            ('(', _) => {
                i += 1;
                Token::LParen
            }
            (')', _) => {
                i += 1;
                Token::RParen
            }
            (',', _) => {
                i += 1;
                Token::Comma
            }
            (c, _) if c.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                    i += 1;
                }
                Token::Ident(input[start..i].to_string())
            }
            (c, _) if c.is_ascii_digit() || c == '.' || c == '-' => {
                i += 1;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                Token::Number(input[start..i].to_string())
            }
            (c, _) => return Err(ConditionError::UnexpectedChar(c, i)),
        };

        tokens.push((token, start));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(t, o)| (t, *o))
    }

    fn next(&mut self, expected: &'static str) -> Result<(Token, usize), ConditionError> {
        match self.tokens.get(self.pos) {
            Some((tok, offset)) => {
                self.pos += 1;
                Ok((tok.clone(), *offset))
            }
            None => Err(ConditionError::UnexpectedToken {
                found: "end of expression".into(),
                expected,
                offset: self.tokens.last().map_or(0, |(_, o)| *o),
            }),
        }
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), ConditionError> {
        let (tok, offset) = self.next(expected)?;
        if tok == want {
            Ok(())
        } else {
            Err(ConditionError::UnexpectedToken {
                found: tok.to_string(),
                expected,
                offset,
            })
        }
    }

    fn expr(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.and()?;
        while matches!(self.peek(), Some((Token::Or, _))) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.term()?;
        while matches!(self.peek(), Some((Token::And, _))) {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Condition, ConditionError> {
        if matches!(self.peek(), Some((Token::LParen, _))) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(inner);
        }

        let metric = self.metric()?;
        let op = match self.next("comparison operator")? {
            (Token::Op(op), _) => op,
            (tok, offset) => {
                return Err(ConditionError::UnexpectedToken {
                    found: tok.to_string(),
                    expected: "comparison operator",
                    offset,
                })
            }
        };
        let value = self.number()?;

        Ok(Condition::Compare { metric, op, value })
    }

    fn metric(&mut self) -> Result<Metric, ConditionError> {
        let name = match self.next("metric function")? {
            (Token::Ident(name), _) => name,
            (tok, offset) => {
                return Err(ConditionError::UnexpectedToken {
                    found: tok.to_string(),
                    expected: "metric function",
                    offset,
                })
            }
        };

        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Some((Token::RParen, _))) {
            args.push(self.number()?);
            while matches!(self.peek(), Some((Token::Comma, _))) {
                self.pos += 1;
                args.push(self.number()?);
            }
        }
        self.expect(Token::RParen, "')'")?;

        let arity = |name: &'static str, expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ConditionError::Arity {
                    name,
                    expected,
                    got: args.len(),
                })
            }
        };

        match name.as_str() {
            "NetworkErrorRatio" => {
                arity("NetworkErrorRatio", 0)?;
                Ok(Metric::NetworkErrorRatio)
            }
            "ResponseCodeRatio" => {
                arity("ResponseCodeRatio", 4)?;
                let code = |v: f64| v.clamp(0.0, f64::from(u16::MAX)) as u16;
                Ok(Metric::ResponseCodeRatio(
                    code(args[0]),
                    code(args[1]),
                    code(args[2]),
                    code(args[3]),
                ))
            }
            "LatencyAtQuantileMS" => {
                arity("LatencyAtQuantileMS", 1)?;
                Ok(Metric::LatencyAtQuantileMs(args[0]))
            }
            _ => Err(ConditionError::UnknownFunction(name)),
        }
    }

    fn number(&mut self) -> Result<f64, ConditionError> {
        match self.next("number")? {
            (Token::Number(raw), _) => raw.parse().map_err(|_| ConditionError::InvalidNumber(raw)),
            (tok, offset) => Err(ConditionError::UnexpectedToken {
                found: tok.to_string(),
                expected: "number",
                offset,
            }),
        }
    }
}
