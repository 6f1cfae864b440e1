//! Payload extraction from ASCII replies.
//!
//! Device replies carry their value after a known separator (`":A X=123"`,
//! `"STATS: 12 7 ..."`) or at a fixed column. These helpers pull the value out
//! and classify it as an integer, a float or plain text.

use crate::error::ParseError;
use std::fmt;

/// A value extracted from a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Interpret a word: whole-word integer, then finite float, else text.
    pub fn classify(word: &str) -> Value {
        if let Ok(i) = word.parse::<i64>() {
            Value::Int(i)
        } else if let Some(f) = word.parse::<f64>().ok().filter(|f| f.is_finite()) {
            Value::Float(f)
        } else {
            Value::Text(word.to_string())
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(_) => None,
        }
    }

    /// Numeric value or a `NotNumeric` error.
    pub fn to_f64(&self) -> Result<f64, ParseError> {
        self.as_f64().ok_or_else(|| ParseError::NotNumeric {
            text: self.to_string(),
        })
    }

    pub fn to_i64(&self) -> Result<i64, ParseError> {
        self.as_i64().ok_or_else(|| ParseError::NotNumeric {
            text: self.to_string(),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Trim line terminators and surrounding whitespace.
fn clean(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\0')
}

/// Classify a remainder: numeric if its first word is numeric, else the whole
/// remainder as text.
fn value_of(rest: &str) -> Value {
    let first = rest.split_whitespace().next().unwrap_or(rest);
    match Value::classify(first) {
        Value::Text(_) => Value::Text(rest.to_string()),
        numeric => numeric,
    }
}

/// Value following the first occurrence of `token`.
///
/// ```
/// use mm_core::parse::{parse_after, Value};
///
/// assert_eq!(parse_after(":A AX=123\r", "AX=").unwrap(), Value::Int(123));
/// assert_eq!(parse_after(":A X=1.5 Y=2", "X=").unwrap(), Value::Float(1.5));
/// assert!(parse_after(":A\r", "X=").is_err());
/// ```
pub fn parse_after(text: &str, token: &str) -> Result<Value, ParseError> {
    let pos = text
        .find(token)
        .ok_or_else(|| ParseError::TokenNotFound {
            token: token.to_string(),
            text: clean(text).to_string(),
        })?;
    let rest = clean(&text[pos + token.len()..]);
    if rest.is_empty() {
        return Err(ParseError::Empty {
            token: token.to_string(),
        });
    }
    Ok(value_of(rest))
}

/// Value starting at a fixed character offset.
pub fn parse_at(text: &str, offset: usize) -> Result<Value, ParseError> {
    let len = text.chars().count();
    let rest: String = text.chars().skip(offset).collect();
    if offset >= len {
        return Err(ParseError::OffsetOutOfRange { offset, len });
    }
    let rest = clean(&rest);
    if rest.is_empty() {
        return Err(ParseError::Empty {
            token: format!("@{}", offset),
        });
    }
    Ok(value_of(rest))
}

/// All whitespace-separated values following `token`.
///
/// An empty token starts at the beginning of the text.
pub fn fields_after(text: &str, token: &str) -> Result<Vec<Value>, ParseError> {
    let pos = text
        .find(token)
        .ok_or_else(|| ParseError::TokenNotFound {
            token: token.to_string(),
            text: clean(text).to_string(),
        })?;
    let fields: Vec<Value> = clean(&text[pos + token.len()..])
        .split_whitespace()
        .map(Value::classify)
        .collect();
    if fields.is_empty() {
        return Err(ParseError::Empty {
            token: token.to_string(),
        });
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_after_numeric_token() {
        assert_eq!(parse_after("...AX=123\r", "AX=").unwrap(), Value::Int(123));
        assert_eq!(
            parse_after(":A X=-10.5\r\n", "=").unwrap(),
            Value::Float(-10.5)
        );
    }

    #[test]
    fn parse_after_takes_first_word_of_numeric_remainder() {
        assert_eq!(
            parse_after(":A X=12 Y=-4", "X=").unwrap(),
            Value::Int(12)
        );
    }

    #[test]
    fn parse_after_text_keeps_whole_remainder() {
        assert_eq!(
            parse_after("VERSION: pgFocus 1.4 beta\r", "VERSION:").unwrap(),
            Value::Text("pgFocus 1.4 beta".into())
        );
    }

    #[test]
    fn non_finite_words_stay_text() {
        assert_eq!(Value::classify("NaN"), Value::Text("NaN".into()));
        assert_eq!(Value::classify("inf"), Value::Text("inf".into()));
        assert_eq!(Value::classify("-infinity"), Value::Text("-infinity".into()));
        assert_eq!(Value::classify("1e3"), Value::Float(1000.0));
    }

    #[test]
    fn parse_after_missing_token() {
        let err = parse_after(":A\r", "AX=").unwrap_err();
        assert_eq!(
            err,
            ParseError::TokenNotFound {
                token: "AX=".into(),
                text: ":A".into()
            }
        );
    }

    #[test]
    fn parse_after_nothing_follows() {
        assert_eq!(
            parse_after(":A X=\r", "X=").unwrap_err(),
            ParseError::Empty { token: "X=".into() }
        );
    }

    #[test]
    fn parse_at_offset() {
        assert_eq!(parse_at(":A 1500", 3).unwrap(), Value::Int(1500));
        assert!(matches!(
            parse_at(":A", 5),
            Err(ParseError::OffsetOutOfRange { offset: 5, len: 2 })
        ));
    }

    #[test]
    fn fields_after_multi_axis_reply() {
        let fields = fields_after(":A 1234 -56.5\r\n", ":A").unwrap();
        assert_eq!(fields, vec![Value::Int(1234), Value::Float(-56.5)]);
    }

    #[test]
    fn value_conversions() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(2.9).as_i64(), Some(2));
        assert!(Value::Text("N".into()).to_f64().is_err());
    }
}
