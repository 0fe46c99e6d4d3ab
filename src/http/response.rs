//! The response half of the handler API.

use crate::{
    errors::HttpError,
    http::{cookie::SetCookie, types::HeaderMap, writer::ResponseWriter},
};

/// Compression preference for one response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressMode {
    /// Compress whenever the client offered a supported coding.
    Default,
    /// Same as `Default`; records that the handler asked explicitly.
    On,
    /// Never compress this response.
    Off,
}

/// Everything about a response except its body bytes. Mutable until the
/// status line hits the wire.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: Vec<SetCookie>,
    pub(crate) content_length: Option<u64>,
    pub(crate) compress: CompressMode,
}

impl ResponseHead {
    pub(crate) fn new() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            content_length: None,
            compress: CompressMode::Default,
        }
    }

    #[inline]
    pub(crate) fn wants_compression(&self) -> bool {
        !matches!(self.compress, CompressMode::Off)
    }
}

/// The response under construction, handed to the handler together with the
/// [`Request`](crate::Request).
///
/// The response is *committed* once its status line reaches the socket —
/// either because the handler flushed, wrote more than the server buffers,
/// or closed. Before commit everything is still mutable (and an error can
/// replace the response wholesale); after commit the head is final.
///
/// # Examples
///
/// ```no_run
/// use pier_http::{Request, Response, HttpError};
///
/// async fn handle(_req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), HttpError> {
///     resp.status(200)
///         .header("content-type", "text/plain")
///         .write(b"Hello world!")
///         .await
/// }
/// ```
pub struct Response<'a> {
    pub(crate) head: ResponseHead,
    pub(crate) writer: ResponseWriter<'a>,
}

impl<'a> Response<'a> {
    pub(crate) fn new(head: ResponseHead, writer: ResponseWriter<'a>) -> Self {
        Self { head, writer }
    }

    /// Sets the status code. Takes effect only before commit.
    pub fn status(&mut self, code: u16) -> &mut Self {
        self.head.status = code;
        self
    }

    /// Sets an explicit reason phrase. Without one the status line carries
    /// the code alone.
    pub fn reason(&mut self, reason: impl Into<String>) -> &mut Self {
        self.head.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.head.status
    }

    /// Appends a header value, keeping existing values for the same name.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.head.headers.add(name, value);
        self
    }

    /// Replaces all values for `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.head.headers.set(name, value);
        self
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        self.head.headers.remove(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Adds a `Set-Cookie` line to the response.
    pub fn cookie(&mut self, cookie: SetCookie) -> &mut Self {
        self.head.cookies.push(cookie);
        self
    }

    /// Declares the exact body length, forcing fixed framing. Must happen
    /// before the first body byte.
    pub fn content_length(&mut self, length: u64) -> Result<&mut Self, HttpError> {
        if self.writer.body_started() {
            return Err(HttpError::IllegalState(
                "content length set after body bytes were written",
            ));
        }
        self.head.content_length = Some(length);
        Ok(self)
    }

    /// Toggles compression for this response. `true` still requires the
    /// client to have offered a supported coding. Fails once the first body
    /// byte has been observed.
    pub fn set_compress(&mut self, on: bool) -> Result<&mut Self, HttpError> {
        if self.writer.body_started() {
            return Err(HttpError::IllegalState(
                "compression toggled after body bytes were written",
            ));
        }
        self.head.compress = if on { CompressMode::On } else { CompressMode::Off };
        Ok(self)
    }

    /// Clears status, reason, headers, cookies and the declared content
    /// length. The compression preference survives. Only possible before
    /// commit.
    pub fn reset(&mut self) -> Result<(), HttpError> {
        if self.writer.committed() {
            return Err(HttpError::IllegalState("reset after commit"));
        }
        self.head.status = 200;
        self.head.reason = None;
        self.head.headers.clear();
        self.head.cookies.clear();
        self.head.content_length = None;
        Ok(())
    }

    /// Whether the status line has been written to the socket.
    #[inline]
    pub fn committed(&self) -> bool {
        self.writer.committed()
    }

    /// Writes body bytes through the response's framing (and compression,
    /// when negotiated).
    pub async fn write(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.writer.write(&mut self.head, data).await
    }

    /// Forces everything buffered onto the wire, committing the head first
    /// if necessary.
    pub async fn flush(&mut self) -> Result<(), HttpError> {
        self.writer.flush(&mut self.head).await
    }

    /// Finishes the response: commits if needed, emits the remaining body
    /// and terminates the framing. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), HttpError> {
        self.writer.close(&mut self.head).await
    }

    /// The final `Connection` header value, read after the handler is done.
    pub(crate) fn connection_header(&self) -> Option<&str> {
        self.head.headers.get("connection")
    }

    pub(crate) async fn send_status_line(
        &mut self,
        status: u16,
        reason: Option<&str>,
    ) -> Result<(), HttpError> {
        let mut line = format!("HTTP/1.1 {status} ");
        if let Some(reason) = reason {
            line.push_str(reason);
        }
        line.push_str("\r\n\r\n");
        self.writer.write_raw(line.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::monitor::Registry;
    use std::time::Instant;

    fn with_response<T>(f: impl FnOnce(&mut Response<'_>) -> T) -> T {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = crate::http::writer::WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        let writer = ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
        let mut response = Response::new(ResponseHead::new(), writer);
        f(&mut response)
    }

    #[test]
    fn builder_style_mutators() {
        with_response(|resp| {
            resp.status(201)
                .reason("Created")
                .header("x-a", "1")
                .header("x-a", "2")
                .set_header("x-b", "only");
            assert_eq!(resp.status_code(), 201);
            assert_eq!(resp.headers().count("x-a"), 2);
            assert_eq!(resp.headers().get("x-b"), Some("only"));
            assert!(resp.remove_header("x-a"));
            assert_eq!(resp.headers().count("x-a"), 0);
        });
    }

    #[test]
    fn reset_clears_everything_but_compress() {
        with_response(|resp| {
            resp.status(500).header("connection", "close");
            resp.cookie(SetCookie::new("a", "b"));
            resp.content_length(10).unwrap();
            resp.set_compress(false).unwrap();
            resp.reset().unwrap();

            assert_eq!(resp.status_code(), 200);
            assert!(resp.headers().is_empty());
            assert!(resp.head.cookies.is_empty());
            assert_eq!(resp.head.content_length, None);
            // Compression intent is not part of reset.
            assert_eq!(resp.head.compress, CompressMode::Off);
        });
    }

    #[tokio::test]
    async fn reset_fails_after_commit() {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = crate::http::writer::WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        let writer = ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
        let mut resp = Response::new(ResponseHead::new(), writer);

        resp.write(b"data").await.unwrap();
        resp.flush().await.unwrap();
        assert!(resp.committed());
        assert!(matches!(resp.reset(), Err(HttpError::IllegalState(_))));
    }

    #[tokio::test]
    async fn compress_toggle_fails_after_first_body_byte() {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = crate::http::writer::WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        let writer = ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
        let mut resp = Response::new(ResponseHead::new(), writer);

        resp.set_compress(true).unwrap();
        resp.set_compress(false).unwrap();
        resp.write(b"x").await.unwrap();
        assert!(matches!(
            resp.set_compress(true),
            Err(HttpError::IllegalState(_))
        ));
        assert!(matches!(
            resp.content_length(1),
            Err(HttpError::IllegalState(_))
        ));
    }
}
