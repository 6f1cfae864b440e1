//! A completed device reply.

use crate::error::{ParseError, TransactError};
use crate::parse::{self, Value};
use crate::serial::printable;
use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Which accepted echo a reply matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    /// The primary expected echo.
    Expected,
    /// The alternate echo at this index.
    Alternate(usize),
}

/// Status conveyed by the `:A` / `:N` reply convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// `:A`: command accepted.
    Ack,
    /// `:N`: command refused, with the numeric code when one follows.
    Nak(Option<i32>),
    /// Neither prefix present.
    Unknown,
}

impl ResponseStatus {
    pub fn of(payload: &[u8]) -> ResponseStatus {
        if payload.starts_with(b":A") {
            return ResponseStatus::Ack;
        }
        if let Some(rest) = payload.strip_prefix(b":N") {
            let code: String = rest
                .iter()
                .skip_while(|b| **b == b' ' || **b == b'-')
                .take_while(|b| b.is_ascii_digit())
                .map(|b| char::from(*b))
                .collect();
            return ResponseStatus::Nak(code.parse().ok());
        }
        ResponseStatus::Unknown
    }
}

/// Bytes read back for one transaction.
///
/// Only constructed once a terminator or echo match has been observed.
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    raw: Bytes,
    payload: Bytes,
    echo: Option<(EchoKind, usize)>,
}

impl Response {
    pub(crate) fn new(raw: Bytes, payload: Bytes) -> Self {
        Self {
            raw,
            payload,
            echo: None,
        }
    }

    pub(crate) fn with_echo(raw: Bytes, payload: Bytes, kind: EchoKind, len: usize) -> Self {
        Self {
            raw,
            payload,
            echo: Some((kind, len)),
        }
    }

    /// Everything accepted from the wire, ending at the terminator or echo.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The reply without terminator and without a leading command echo.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn echo(&self) -> Option<EchoKind> {
        self.echo.map(|(kind, _)| kind)
    }

    /// True when an alternate echo, rather than the expected one, matched.
    pub fn matched_alternate(&self) -> bool {
        matches!(self.echo(), Some(EchoKind::Alternate(_)))
    }

    /// Payload bytes after the matched echo prefix.
    pub fn after_echo(&self) -> &[u8] {
        let len = self.echo.map_or(0, |(_, len)| len);
        self.payload.get(len..).unwrap_or_default()
    }

    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::of(&self.payload)
    }

    pub fn is_ack(&self) -> bool {
        self.status() == ResponseStatus::Ack
    }

    /// Require an `:A` acknowledgement.
    pub fn into_ack(self) -> Result<Response, TransactError> {
        match self.status() {
            ResponseStatus::Ack => Ok(self),
            ResponseStatus::Nak(code) => Err(TransactError::Rejected {
                code,
                reply: printable(&self.payload),
            }),
            ResponseStatus::Unknown => Err(TransactError::Protocol {
                expected: "\":A\"".into(),
                received: printable(&self.payload),
            }),
        }
    }

    pub fn parse_after(&self, token: &str) -> Result<Value, ParseError> {
        parse::parse_after(&self.text(), token)
    }

    pub fn parse_at(&self, offset: usize) -> Result<Value, ParseError> {
        parse::parse_at(&self.text(), offset)
    }

    pub fn fields_after(&self, token: &str) -> Result<Vec<Value>, ParseError> {
        parse::fields_after(&self.text(), token)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("raw", &printable(&self.raw))
            .field("payload", &printable(&self.payload))
            .field("echo", &self.echo())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_prefixes() {
        assert_eq!(ResponseStatus::of(b":A"), ResponseStatus::Ack);
        assert_eq!(ResponseStatus::of(b":A X=12"), ResponseStatus::Ack);
        assert_eq!(ResponseStatus::of(b":N-5"), ResponseStatus::Nak(Some(5)));
        assert_eq!(ResponseStatus::of(b":N -21"), ResponseStatus::Nak(Some(21)));
        assert_eq!(ResponseStatus::of(b":N"), ResponseStatus::Nak(None));
        assert_eq!(ResponseStatus::of(b"B"), ResponseStatus::Unknown);
    }

    #[test]
    fn into_ack_maps_nak_to_rejected() {
        let nak = Response::new(Bytes::from_static(b":N-3\r"), Bytes::from_static(b":N-3"));
        match nak.into_ack() {
            Err(TransactError::Rejected { code, reply }) => {
                assert_eq!(code, Some(3));
                assert_eq!(reply, ":N-3");
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let odd = Response::new(Bytes::from_static(b"?\r"), Bytes::from_static(b"?"));
        assert!(matches!(
            odd.into_ack(),
            Err(TransactError::Protocol { .. })
        ));
    }

    #[test]
    fn after_echo_skips_prefix() {
        let r = Response::with_echo(
            Bytes::from_static(&[253, b'S', b'C', b'\r']),
            Bytes::from_static(&[253, b'S', b'C']),
            EchoKind::Expected,
            1,
        );
        assert_eq!(r.after_echo(), b"SC");
        assert!(!r.matched_alternate());
    }

    #[test]
    fn parse_payload() {
        let r = Response::new(
            Bytes::from_static(b":A X=-10 Y=-5\r"),
            Bytes::from_static(b":A X=-10 Y=-5"),
        );
        assert_eq!(r.parse_after("X=").unwrap(), Value::Int(-10));
        assert_eq!(r.parse_after("Y=").unwrap(), Value::Int(-5));
        assert!(r.parse_after("Z=").is_err());
    }
}
