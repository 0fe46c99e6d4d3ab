//! The request half of the handler API.

use crate::http::{
    body::Body,
    cookie::{self, Cookie},
    params::{self, AcceptedEncoding, ParsedValue},
    preamble::{HeadInfo, RequestHead},
    types::{HeaderMap, Version},
};
use std::net::{IpAddr, SocketAddr};

/// One parsed HTTP request, live for a single handler invocation.
///
/// The head (method, path, headers and their derived views) is fully parsed
/// before the handler runs; the body is a stream the handler may read fully,
/// partially, or not at all — whatever is left unread is drained by the
/// server before the connection hosts the next request.
pub struct Request<'a> {
    head: RequestHead,
    info: HeadInfo,
    body: Body<'a>,
    remote_addr: SocketAddr,
    scheme: &'static str,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        head: RequestHead,
        info: HeadInfo,
        body: Body<'a>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Self {
        Self { head, info, body, remote_addr, scheme }
    }

    /// The request method token, e.g. `GET`.
    #[inline]
    pub fn method(&self) -> &str {
        &self.head.method
    }

    /// The raw request target, query string included.
    #[inline]
    pub fn path(&self) -> &str {
        &self.head.path
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.info.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// First value of `name`, case-insensitive.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    /// The declared body length. `None` for chunked bodies and requests
    /// without one.
    #[inline]
    pub fn content_length(&self) -> Option<i64> {
        self.info.content_length
    }

    /// Whether the body arrives chunk-encoded.
    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.info.chunked
    }

    /// The `Host` header. Validation guarantees exactly one is present.
    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.head.headers.get("host")
    }

    /// `http` or `https`, from the listener that accepted the connection.
    #[inline]
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    #[inline]
    pub fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.head
            .headers
            .get("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// The client's acceptable content codings, quality-ordered.
    pub fn accept_encodings(&self) -> Vec<AcceptedEncoding> {
        self.head
            .headers
            .get("accept-encoding")
            .map(params::parse_accept_encoding)
            .unwrap_or_default()
    }

    /// The `Content-Type` header split into base value and parameters.
    pub fn content_type(&self) -> Option<ParsedValue> {
        self.head
            .headers
            .get("content-type")
            .map(params::parse_parameterized)
    }

    /// All cookies from every `Cookie` header on the request.
    pub fn cookies(&self) -> Vec<Cookie> {
        let mut cookies = Vec::new();
        for value in self.head.headers.get_all("cookie") {
            cookies.extend(cookie::parse_cookie_header(value));
        }
        cookies
    }

    /// The first cookie named `name`.
    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.cookies().into_iter().find(|c| c.name == name)
    }

    /// The request body stream.
    #[inline]
    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{
        body::{BodyKind, BodySource, ReadBuffer},
        preamble::{validate, PreambleParser},
    };
    use crate::server::monitor::Registry;
    use std::time::Instant;

    async fn request_from<'a>(
        wire: &'static [u8],
        reader: &'a mut &'static [u8],
        buf: &'a mut ReadBuffer,
        info_slot: &'a std::sync::Arc<crate::server::monitor::ConnectionInfo>,
    ) -> Request<'a> {
        let mut parser = PreambleParser::new(None);
        let consumed = parser.push(wire).unwrap().unwrap();
        let mut head = parser.take_head();
        let info = validate(&mut head).unwrap();

        *reader = &wire[consumed..];
        let kind = if info.chunked {
            BodyKind::Chunked
        } else {
            match info.content_length {
                Some(n) => BodyKind::Fixed(n as u64),
                None => BodyKind::None,
            }
        };
        let source = BodySource::new(reader, buf, info_slot);
        let body = Body::new(source, kind, None);
        Request::new(head, info, body, "127.0.0.1:40000".parse().unwrap(), "http")
    }

    #[tokio::test]
    async fn derived_views() {
        let wire: &'static [u8] =
            b"POST /submit?x=1 HTTP/1.1\r\nHost: api.example.com\r\n\
              Content-Length: 3\r\nContent-Type: text/plain; charset=utf-8\r\n\
              Accept-Encoding: gzip, deflate\r\nExpect: 100-continue\r\n\
              Cookie: a=1; b=2\r\nCookie: c=3\r\n\r\nabc";
        let registry = Registry::default();
        let info_slot = registry.register(Instant::now());
        let mut reader: &'static [u8] = b"";
        let mut buf = ReadBuffer::with_capacity(1024);
        let mut req = request_from(wire, &mut reader, &mut buf, &info_slot).await;

        assert_eq!(req.method(), "POST");
        assert_eq!(req.path(), "/submit?x=1");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.host(), Some("api.example.com"));
        assert_eq!(req.content_length(), Some(3));
        assert!(!req.is_chunked());
        assert!(req.expects_continue());
        assert_eq!(req.scheme(), "http");
        assert_eq!(req.remote_port(), 40000);

        let encodings = req.accept_encodings();
        assert_eq!(encodings[0].name, "gzip");
        assert_eq!(encodings[1].name, "deflate");

        let ct = req.content_type().unwrap();
        assert_eq!(ct.value, "text/plain");
        assert_eq!(ct.parameter("charset"), Some("utf-8"));

        let cookies = req.cookies();
        assert_eq!(cookies.len(), 3);
        assert_eq!(req.cookie("b").unwrap().value, "2");
        assert!(req.cookie("missing").is_none());

        let mut body = Vec::new();
        req.body().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn absent_views_default_sensibly() {
        let wire: &'static [u8] = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let registry = Registry::default();
        let info_slot = registry.register(Instant::now());
        let mut reader: &'static [u8] = b"";
        let mut buf = ReadBuffer::with_capacity(1024);
        let mut req = request_from(wire, &mut reader, &mut buf, &info_slot).await;

        assert_eq!(req.content_length(), None);
        assert!(!req.is_chunked());
        assert!(!req.expects_continue());
        assert!(req.accept_encodings().is_empty());
        assert!(req.content_type().is_none());
        assert!(req.cookies().is_empty());
        assert!(req.body().is_consumed());
    }
}
