//! Byte-at-a-time request preamble parser.
//!
//! One byte goes in, one state comes out; each state either stores the byte
//! into the accumulator it is building or drops it. The parser is push-based
//! and owns no I/O, so any split of the input across reads yields the same
//! result, and the connection worker keeps full control over buffering.

use crate::{
    errors::HttpError,
    http::types::{
        self, is_class, ContentLength, HeaderMap, Version, CLASS_PROTOCOL, CLASS_TOKEN,
        CLASS_URI, CLASS_VALUE,
    },
};

/// Parser states. Lines end CR LF; the empty line ends the preamble.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    RequestMethod,
    RequestMethodSp,
    RequestPath,
    RequestPathSp,
    RequestProtocol,
    RequestCr,
    RequestLf,
    HeaderName,
    HeaderColon,
    HeaderValue,
    HeaderCr,
    HeaderLf,
    PreambleCr,
    Complete,
}

impl State {
    const fn name(&self) -> &'static str {
        match self {
            State::RequestMethod => "RequestMethod",
            State::RequestMethodSp => "RequestMethodSP",
            State::RequestPath => "RequestPath",
            State::RequestPathSp => "RequestPathSP",
            State::RequestProtocol => "RequestProtocol",
            State::RequestCr => "RequestCR",
            State::RequestLf => "RequestLF",
            State::HeaderName => "HeaderName",
            State::HeaderColon => "HeaderColon",
            State::HeaderValue => "HeaderValue",
            State::HeaderCr => "HeaderCR",
            State::HeaderLf => "HeaderLF",
            State::PreambleCr => "PreambleCR",
            State::Complete => "Complete",
        }
    }
}

/// The parsed request line and header block, before validation.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) protocol: String,
    pub(crate) headers: HeaderMap,
}

/// Facts derived from a validated head.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadInfo {
    pub(crate) version: Version,
    pub(crate) content_length: Option<i64>,
    pub(crate) chunked: bool,
}

pub(crate) struct PreambleParser {
    state: State,
    method: String,
    path: String,
    protocol: String,
    name: String,
    value: Vec<u8>,
    headers: HeaderMap,
    bytes_seen: usize,
    max_size: Option<usize>,
}

impl PreambleParser {
    pub(crate) fn new(max_size: Option<usize>) -> Self {
        Self {
            state: State::RequestMethod,
            method: String::new(),
            path: String::new(),
            protocol: String::new(),
            name: String::new(),
            value: Vec::new(),
            headers: HeaderMap::new(),
            bytes_seen: 0,
            max_size,
        }
    }

    /// Clears everything for the next request on the same connection. The
    /// accumulators keep their allocations.
    pub(crate) fn reset(&mut self) {
        self.state = State::RequestMethod;
        self.method.clear();
        self.path.clear();
        self.protocol.clear();
        self.name.clear();
        self.value.clear();
        self.headers.clear();
        self.bytes_seen = 0;
    }

    /// Feeds bytes into the machine. Returns `Ok(Some(n))` with the number
    /// of bytes consumed once the preamble is complete — the remainder of
    /// `data` belongs to the body. `Ok(None)` means more input is needed.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Option<usize>, HttpError> {
        for (i, &byte) in data.iter().enumerate() {
            self.bytes_seen += 1;
            if let Some(max) = self.max_size {
                if self.bytes_seen > max {
                    return Err(HttpError::Rejected { status: 431 });
                }
            }
            self.step(byte)?;
            if self.state == State::Complete {
                return Ok(Some(i + 1));
            }
        }
        Ok(None)
    }

    /// Takes the finished head out of the parser.
    pub(crate) fn take_head(&mut self) -> RequestHead {
        debug_assert_eq!(self.state, State::Complete);
        RequestHead {
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            protocol: std::mem::take(&mut self.protocol),
            headers: std::mem::take(&mut self.headers),
        }
    }

    #[inline]
    fn step(&mut self, byte: u8) -> Result<(), HttpError> {
        self.state = match self.state {
            State::RequestMethod => match byte {
                b' ' => State::RequestMethodSp,
                b if is_class(b, CLASS_TOKEN) => {
                    self.method.push(b as char);
                    State::RequestMethod
                }
                _ => return self.fail(byte),
            },
            State::RequestMethodSp => match byte {
                b' ' => State::RequestMethodSp,
                b if is_class(b, CLASS_URI) => {
                    self.path.clear();
                    self.path.push(b as char);
                    State::RequestPath
                }
                _ => return self.fail(byte),
            },
            State::RequestPath => match byte {
                b' ' => State::RequestPathSp,
                b if is_class(b, CLASS_URI) => {
                    self.path.push(b as char);
                    State::RequestPath
                }
                _ => return self.fail(byte),
            },
            State::RequestPathSp => match byte {
                b' ' => State::RequestPathSp,
                b if is_class(b, CLASS_PROTOCOL) => {
                    self.protocol.clear();
                    self.protocol.push(b as char);
                    State::RequestProtocol
                }
                _ => return self.fail(byte),
            },
            State::RequestProtocol => match byte {
                b'\r' => State::RequestCr,
                b if is_class(b, CLASS_PROTOCOL) => {
                    self.protocol.push(b as char);
                    State::RequestProtocol
                }
                _ => return self.fail(byte),
            },
            State::RequestCr => match byte {
                b'\n' => State::RequestLf,
                _ => return self.fail(byte),
            },
            State::RequestLf => match byte {
                b'\r' => State::PreambleCr,
                b if is_class(b, CLASS_TOKEN) => {
                    self.name.clear();
                    self.name.push(b as char);
                    State::HeaderName
                }
                _ => return self.fail(byte),
            },
            State::HeaderName => match byte {
                b':' => State::HeaderColon,
                b if is_class(b, CLASS_TOKEN) => {
                    self.name.push(b as char);
                    State::HeaderName
                }
                _ => return self.fail(byte),
            },
            State::HeaderColon => match byte {
                b' ' | b'\t' => State::HeaderColon,
                b'\r' => State::HeaderCr,
                b if is_class(b, CLASS_VALUE) => {
                    self.value.clear();
                    self.value.push(b);
                    State::HeaderValue
                }
                _ => return self.fail(byte),
            },
            State::HeaderValue => match byte {
                b'\r' => State::HeaderCr,
                b if is_class(b, CLASS_VALUE) => {
                    self.value.push(b);
                    State::HeaderValue
                }
                _ => return self.fail(byte),
            },
            State::HeaderCr => match byte {
                b'\n' => {
                    self.commit_header();
                    State::HeaderLf
                }
                _ => return self.fail(byte),
            },
            State::HeaderLf => match byte {
                b'\r' => State::PreambleCr,
                b if is_class(b, CLASS_TOKEN) => {
                    self.name.clear();
                    self.name.push(b as char);
                    State::HeaderName
                }
                _ => return self.fail(byte),
            },
            State::PreambleCr => match byte {
                b'\n' => State::Complete,
                _ => return self.fail(byte),
            },
            State::Complete => return self.fail(byte),
        };
        Ok(())
    }

    #[inline(never)]
    fn fail(&self, byte: u8) -> Result<(), HttpError> {
        Err(HttpError::Parse { state: self.state.name(), byte })
    }

    fn commit_header(&mut self) {
        // Trailing whitespace is not part of the value.
        while matches!(self.value.last(), Some(b' ' | b'\t')) {
            self.value.pop();
        }
        let value = types::bytes_to_string(&self.value);
        self.headers.add(std::mem::take(&mut self.name), value);
        self.value.clear();
    }
}

/// Semantic validation of a parsed head. Returns the derived facts or the
/// rejection status. `Transfer-Encoding` erases `Content-Length` from the
/// header map itself, so later readers of the map agree with the framing.
pub(crate) fn validate(head: &mut RequestHead) -> Result<HeadInfo, HttpError> {
    let version = Version::from_token(&head.protocol)?;

    if head.headers.count("host") != 1 {
        return Err(HttpError::Rejected { status: 400 });
    }

    if head.headers.contains("transfer-encoding") {
        let mut chunked = false;
        for value in head.headers.get_all("transfer-encoding") {
            for coding in value.split(',') {
                if coding.trim().eq_ignore_ascii_case("chunked") {
                    chunked = true;
                } else {
                    // An undecodable transfer coding would desynchronize
                    // connection framing.
                    return Err(HttpError::Rejected { status: 400 });
                }
            }
        }
        if !chunked {
            return Err(HttpError::Rejected { status: 400 });
        }
        head.headers.remove("content-length");
        return Ok(HeadInfo { version, content_length: None, chunked: true });
    }

    let content_length = match head.headers.count("content-length") {
        0 => None,
        1 => {
            let raw = head.headers.get("content-length").unwrap_or_default();
            match types::parse_content_length(raw) {
                ContentLength::Value(n) if n >= 0 => Some(n),
                ContentLength::Value(_) => {
                    return Err(HttpError::Rejected { status: 400 })
                }
                // Beyond i64: treated as if no length had been sent.
                ContentLength::Overflow => None,
                ContentLength::Invalid => {
                    return Err(HttpError::Rejected { status: 400 })
                }
            }
        }
        _ => return Err(HttpError::Rejected { status: 400 }),
    };

    Ok(HeadInfo { version, content_length, chunked: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<(RequestHead, usize), HttpError> {
        let mut parser = PreambleParser::new(None);
        match parser.push(input)? {
            Some(consumed) => Ok((parser.take_head(), consumed)),
            None => panic!("incomplete preamble"),
        }
    }

    const SIMPLE: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";

    #[test]
    fn parses_request_line_and_headers() {
        let (head, consumed) = parse(SIMPLE).unwrap();
        assert_eq!(consumed, SIMPLE.len());
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/index.html");
        assert_eq!(head.protocol, "HTTP/1.1");
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("ACCEPT"), Some("*/*"));
    }

    #[test]
    fn leftover_bytes_are_not_consumed() {
        let mut input = SIMPLE.to_vec();
        input.extend_from_slice(b"BODYBYTES");
        let (_, consumed) = parse(&input).unwrap();
        assert_eq!(consumed, SIMPLE.len());
    }

    #[test]
    fn identical_result_for_every_split() {
        let (whole, _) = parse(SIMPLE).unwrap();
        for split in 1..SIMPLE.len() {
            let mut parser = PreambleParser::new(None);
            assert_eq!(parser.push(&SIMPLE[..split]).unwrap(), None, "split {split}");
            let consumed = parser.push(&SIMPLE[split..]).unwrap().unwrap();
            assert_eq!(split + consumed, SIMPLE.len());
            let head = parser.take_head();
            assert_eq!(head.method, whole.method);
            assert_eq!(head.path, whole.path);
            assert_eq!(head.protocol, whole.protocol);
            assert_eq!(head.headers, whole.headers);
        }
    }

    #[test]
    fn byte_at_a_time_matches_single_push() {
        let mut parser = PreambleParser::new(None);
        let mut done = false;
        for &byte in SIMPLE {
            assert!(!done);
            done = parser.push(&[byte]).unwrap().is_some();
        }
        assert!(done);
        let head = parser.take_head();
        assert_eq!(head.method, "GET");
    }

    #[test]
    fn rejection_preserves_state_name_and_byte() {
        // A control byte inside the method token.
        let err = PreambleParser::new(None).push(b"GE\x01T").unwrap_err();
        match err {
            HttpError::Parse { state, byte } => {
                assert_eq!(state, "RequestMethod");
                assert_eq!(byte, 0x01);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // A bare LF where CR LF is required after the request line.
        let err = PreambleParser::new(None)
            .push(b"GET / HTTP/1.1\n")
            .unwrap_err();
        match err {
            HttpError::Parse { state, byte } => {
                assert_eq!(state, "RequestProtocol");
                assert_eq!(byte, b'\n');
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Space is not a token character in a header name.
        let err = PreambleParser::new(None)
            .push(b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n")
            .unwrap_err();
        match err {
            HttpError::Parse { state, .. } => assert_eq!(state, "HeaderName"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn every_state_rejects_out_of_class_bytes() {
        #[rustfmt::skip]
        let cases: &[(&[u8], u8, &str)] = &[
            (b"",                                  0x00, "RequestMethod"),
            (b"GET ",                              0x7F, "RequestMethodSP"),
            (b"GET /a",                            0x7F, "RequestPath"),
            (b"GET / ",                            0x1F, "RequestPathSP"),
            (b"GET / H",                           b'S', "RequestProtocol"),
            (b"GET / HTTP/1.1\r",                  b'x', "RequestCR"),
            (b"GET / HTTP/1.1\r\n",                b' ', "RequestLF"),
            (b"GET / HTTP/1.1\r\nHost",            b' ', "HeaderName"),
            (b"GET / HTTP/1.1\r\nHost:",           0x00, "HeaderColon"),
            (b"GET / HTTP/1.1\r\nHost: h",         0x00, "HeaderValue"),
            (b"GET / HTTP/1.1\r\nHost: h\r",       b'x', "HeaderCR"),
            (b"GET / HTTP/1.1\r\nHost: h\r\n",     b' ', "HeaderLF"),
            (b"GET / HTTP/1.1\r\nHost: h\r\n\r",   b'x', "PreambleCR"),
        ];

        for (prefix, bad, expected_state) in cases {
            let mut parser = PreambleParser::new(None);
            assert_eq!(parser.push(prefix).unwrap(), None);
            match parser.push(&[*bad]).unwrap_err() {
                HttpError::Parse { state, byte } => {
                    assert_eq!(state, *expected_state, "after {prefix:?}");
                    assert_eq!(byte, *bad);
                }
                other => panic!("unexpected error after {prefix:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn strict_crlf_framing() {
        // A bare LF does not terminate a value; it is a value byte, so the
        // line is still open and the preamble stays incomplete.
        let mut parser = PreambleParser::new(None);
        assert_eq!(parser.push(b"GET / HTTP/1.1\r\nHost: h\n\r\n").unwrap(), None);

        // CR must be followed by LF.
        let err = PreambleParser::new(None)
            .push(b"GET / HTTP/1.1\r\nHost: h\rX")
            .unwrap_err();
        match err {
            HttpError::Parse { state, byte } => {
                assert_eq!(state, "HeaderCR");
                assert_eq!(byte, b'X');
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_and_whitespace_padded_header_values() {
        let (head, _) = parse(b"GET / HTTP/1.1\r\nHost: h\r\nX-Empty:\r\nX-Pad:   v   \r\n\r\n")
            .unwrap();
        assert_eq!(head.headers.get("x-empty"), Some(""));
        assert_eq!(head.headers.get("x-pad"), Some("v"));
    }

    #[test]
    fn high_bytes_allowed_in_values() {
        let mut input = b"GET / HTTP/1.1\r\nHost: h\r\nX-Raw: a".to_vec();
        input.push(0xE9);
        input.extend_from_slice(b"b\r\n\r\n");
        let (head, _) = parse(&input).unwrap();
        let value = head.headers.get("x-raw").unwrap();
        assert!(value.starts_with('a') && value.ends_with('b'));
    }

    #[test]
    fn no_headers_at_all() {
        let (head, consumed) = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(consumed, 18);
        assert!(head.headers.is_empty());
    }

    #[test]
    fn header_size_cap() {
        let mut parser = PreambleParser::new(Some(16));
        let err = parser
            .push(b"GET /very-long-path HTTP/1.1\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 431 }));
    }

    #[test]
    fn reset_reuses_parser() {
        let mut parser = PreambleParser::new(None);
        parser.push(SIMPLE).unwrap().unwrap();
        let _ = parser.take_head();
        parser.reset();
        parser.push(b"POST /p HTTP/1.0\r\nHost: h\r\n\r\n").unwrap().unwrap();
        let head = parser.take_head();
        assert_eq!(head.method, "POST");
        assert_eq!(head.protocol, "HTTP/1.0");
        assert_eq!(head.headers.len(), 1);
    }

    // Validation

    fn parse_and_validate(input: &[u8]) -> Result<(RequestHead, HeadInfo), HttpError> {
        let (mut head, _) = parse(input)?;
        let info = validate(&mut head)?;
        Ok((head, info))
    }

    #[test]
    fn host_required_exactly_once() {
        assert!(parse_and_validate(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").is_ok());

        let err = parse_and_validate(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));

        let err = parse_and_validate(b"GET / HTTP/1.1\r\nHost: h\r\nHost: h\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));

        // A forwarded host does not satisfy the requirement.
        let err = parse_and_validate(b"GET / HTTP/1.1\r\nX-Forwarded-Host: h\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));
    }

    #[test]
    fn version_policy() {
        let (_, info) = parse_and_validate(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(info.version, Version::Http10);

        let err = parse_and_validate(b"GET / HTTP/1.2\r\nHost: h\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 505 }));

        let err = parse_and_validate(b"GET / HTTP/9.9\r\nHost: h\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 505 }));

        // Not an HTTP token at all: rejected outright. `HTP/1.1` stays
        // within the protocol byte class but is not HTTP.
        let err = parse_and_validate(b"GET / HTP/1.1\r\nHost: h\r\n\r\n").unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));
    }

    #[test]
    fn content_length_rules() {
        let (_, info) =
            parse_and_validate(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(info.content_length, Some(42));
        assert!(!info.chunked);

        let err = parse_and_validate(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: -1\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));

        let err = parse_and_validate(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));

        // Larger than i64: treated as absent.
        let (_, info) = parse_and_validate(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 9223372036854775808\r\n\r\n",
        )
        .unwrap();
        assert_eq!(info.content_length, None);
    }

    #[test]
    fn transfer_encoding_wins_over_content_length() {
        let (head, info) = parse_and_validate(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert!(info.chunked);
        assert_eq!(info.content_length, None);
        assert!(!head.headers.contains("content-length"));
    }

    #[test]
    fn unknown_transfer_encoding_rejected() {
        let err = parse_and_validate(
            b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: gzip\r\n\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::Rejected { status: 400 }));
    }
}
