//! The response output stream: lazy commit, content-length vs. chunked
//! framing, and on-the-fly gzip/deflate compression.
//!
//! Nothing reaches the socket until a flush, a close, or enough buffered
//! bytes force the head out. Until that commit the whole response can still
//! be replaced — which is how a late failure turns into a clean error reply
//! instead of a half-framed body.

use crate::{
    errors::HttpError,
    http::{params::AcceptedEncoding, response::ResponseHead},
    server::monitor::{ConnectionInfo, WorkerState},
};
use flate2::{write::GzEncoder, write::ZlibEncoder, Compression};
use std::io::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A response content coding this server can produce.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    pub(crate) const fn token(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

/// Picks the first coding this server supports from the client's
/// quality-ordered `Accept-Encoding` list. Zero-quality entries are
/// explicit refusals.
pub(crate) fn negotiate_encoding(accept: &[AcceptedEncoding]) -> Option<ContentEncoding> {
    for entry in accept {
        if entry.q <= 0.0 {
            continue;
        }
        match entry.name.as_str() {
            "gzip" => return Some(ContentEncoding::Gzip),
            "deflate" => return Some(ContentEncoding::Deflate),
            _ => {}
        }
    }
    None
}

/// Worker-owned write scratch, reused across keep-alive iterations: the
/// pre-commit body buffer and the chunk frame assembly buffer.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffers {
    body: Vec<u8>,
    frame: Vec<u8>,
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Gzip => {
                Encoder::Gzip(GzEncoder::new(Vec::new(), Compression::default()))
            }
            ContentEncoding::Deflate => {
                Encoder::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.write_all(data),
            Encoder::Deflate(e) => e.write_all(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Deflate(e) => e.flush(),
        }
    }

    /// Takes whatever compressed output has accumulated so far.
    fn drain(&mut self) -> Vec<u8> {
        match self {
            Encoder::Gzip(e) => std::mem::take(e.get_mut()),
            Encoder::Deflate(e) => std::mem::take(e.get_mut()),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Deflate(e) => e.finish(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Framing {
    Unresolved,
    Fixed,
    Chunked,
}

/// The worker-owned write side of one response.
pub(crate) struct ResponseWriter<'a> {
    sink: &'a mut (dyn AsyncWrite + Unpin + Send),
    info: &'a ConnectionInfo,
    scratch: &'a mut WriteBuffers,
    max_chunk_size: usize,
    buffer_limit: usize,
    negotiated: Option<ContentEncoding>,
    is_head: bool,

    committed: bool,
    body_started: bool,
    closed: bool,
    write_phase: bool,
    framing: Framing,
    encoder: Option<Encoder>,
    compressed: bool,
    /// Raw bytes the handler has written, before compression.
    written: u64,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
        info: &'a ConnectionInfo,
        scratch: &'a mut WriteBuffers,
        max_chunk_size: usize,
        buffer_limit: usize,
        negotiated: Option<ContentEncoding>,
        is_head: bool,
    ) -> Self {
        scratch.body.clear();
        scratch.frame.clear();
        Self {
            sink,
            info,
            scratch,
            max_chunk_size,
            buffer_limit,
            negotiated,
            is_head,
            committed: false,
            body_started: false,
            closed: false,
            write_phase: false,
            framing: Framing::Unresolved,
            encoder: None,
            compressed: false,
            written: 0,
        }
    }

    #[inline]
    pub(crate) fn committed(&self) -> bool {
        self.committed
    }

    #[inline]
    pub(crate) fn body_started(&self) -> bool {
        self.body_started
    }

    pub(crate) async fn write(
        &mut self,
        head: &mut ResponseHead,
        data: &[u8],
    ) -> Result<(), HttpError> {
        if self.closed {
            return Err(HttpError::IllegalState("write after response close"));
        }
        if !self.body_started {
            self.body_started = true;
            // The compression decision locks in with the first body byte.
            // An explicit content length promises exact framing, which
            // compressed output cannot honor.
            if head.content_length.is_none() && head.wants_compression() {
                if let Some(encoding) = self.negotiated {
                    self.encoder = Some(Encoder::new(encoding));
                    self.compressed = true;
                }
            }
        }

        self.written += data.len() as u64;
        match &mut self.encoder {
            Some(encoder) => {
                encoder.write(data).map_err(HttpError::Io)?;
                let produced = encoder.drain();
                self.scratch.body.extend_from_slice(&produced);
            }
            None => self.scratch.body.extend_from_slice(data),
        }

        if !self.committed
            && (self.written > self.max_chunk_size as u64
                || self.scratch.body.len() > self.buffer_limit)
        {
            self.commit(head, false).await?;
        }
        if self.committed {
            self.emit_full_frames().await?;
        }
        Ok(())
    }

    /// Pushes everything buffered onto the wire, committing first if needed.
    pub(crate) async fn flush(&mut self, head: &mut ResponseHead) -> Result<(), HttpError> {
        if self.closed {
            return Ok(());
        }
        if let Some(encoder) = &mut self.encoder {
            encoder.flush().map_err(HttpError::Io)?;
            let produced = encoder.drain();
            self.scratch.body.extend_from_slice(&produced);
        }
        if !self.committed {
            self.commit(head, false).await?;
        }
        self.emit_all_buffered().await?;
        self.sink.flush().await.map_err(HttpError::from)?;
        Ok(())
    }

    /// Terminates the body framing. Idempotent; the first call wins.
    pub(crate) async fn close(&mut self, head: &mut ResponseHead) -> Result<(), HttpError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().map_err(HttpError::Io)?;
            self.scratch.body.extend_from_slice(&tail);
        }
        if !self.committed {
            self.commit(head, true).await?;
        }

        self.emit_all_buffered().await?;
        if self.framing == Framing::Chunked && !self.is_head {
            self.wire_write_slice(b"0\r\n\r\n").await?;
        }
        self.sink.flush().await.map_err(HttpError::from)?;
        Ok(())
    }

    /// Writes raw preamble bytes outside the normal commit flow; used for
    /// interim `100 Continue` status lines. The worker drives its own state
    /// around interim writes, so the Write transition re-arms for the real
    /// response.
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        self.wire_write_slice(bytes).await?;
        self.sink.flush().await.map_err(HttpError::from)?;
        self.write_phase = false;
        Ok(())
    }

    /// Resolves framing and emits the head exactly once.
    async fn commit(&mut self, head: &mut ResponseHead, closing: bool) -> Result<(), HttpError> {
        debug_assert!(!self.committed);

        self.framing = if let Some(length) = head.content_length {
            head.headers.set("content-length", length.to_string());
            Framing::Fixed
        } else if self.compressed {
            // Compressed output has no predictable length.
            Framing::Chunked
        } else if closing {
            // The whole body is buffered; its length is known after all.
            head.headers
                .set("content-length", self.scratch.body.len().to_string());
            Framing::Fixed
        } else {
            Framing::Chunked
        };
        if self.framing == Framing::Chunked {
            head.headers.set("transfer-encoding", "chunked");
        }
        if self.compressed {
            if let Some(encoding) = self.negotiated {
                head.headers.set("content-encoding", encoding.token());
            }
        }

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(head.status.to_string().as_bytes());
        out.push(b' ');
        if let Some(reason) = &head.reason {
            out.extend_from_slice(reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        for (name, value) in head.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for cookie in &head.cookies {
            out.extend_from_slice(b"set-cookie: ");
            out.extend_from_slice(cookie.to_header_value().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        self.committed = true;
        self.wire_write_slice(&out).await
    }

    /// Emits buffered bytes while full chunks are available; fixed framing
    /// streams everything.
    async fn emit_full_frames(&mut self) -> Result<(), HttpError> {
        match self.framing {
            Framing::Fixed => self.emit_all_buffered().await,
            Framing::Chunked => {
                while self.scratch.body.len() >= self.max_chunk_size {
                    self.emit_chunk(self.max_chunk_size).await?;
                }
                Ok(())
            }
            Framing::Unresolved => Ok(()),
        }
    }

    async fn emit_all_buffered(&mut self) -> Result<(), HttpError> {
        match self.framing {
            Framing::Fixed => {
                if self.scratch.body.is_empty() {
                    return Ok(());
                }
                let data = std::mem::take(&mut self.scratch.body);
                let result = if self.is_head {
                    Ok(())
                } else {
                    self.wire_write_slice(&data).await
                };
                // Hand the allocation back to the pool.
                self.scratch.body = data;
                self.scratch.body.clear();
                result
            }
            Framing::Chunked => {
                while !self.scratch.body.is_empty() {
                    let n = self.scratch.body.len().min(self.max_chunk_size);
                    self.emit_chunk(n).await?;
                }
                Ok(())
            }
            Framing::Unresolved => Ok(()),
        }
    }

    async fn emit_chunk(&mut self, n: usize) -> Result<(), HttpError> {
        let mut frame = std::mem::take(&mut self.scratch.frame);
        frame.clear();
        frame.extend_from_slice(format!("{n:X}\r\n").as_bytes());
        frame.extend_from_slice(&self.scratch.body[..n]);
        frame.extend_from_slice(b"\r\n");
        self.scratch.body.drain(..n);

        let result = if self.is_head {
            Ok(())
        } else {
            self.wire_write_slice(&frame).await
        };
        self.scratch.frame = frame;
        result
    }

    /// The single point where bytes reach the socket. The first wire byte
    /// moves the worker into its Write phase; every write races the
    /// interrupt signal.
    async fn wire_write_slice(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        if !self.write_phase {
            self.write_phase = true;
            self.info.set_state(WorkerState::Write);
            self.info.begin_write();
        }
        tokio::select! {
            biased;
            err = self.info.interrupted() => Err(err),
            result = self.sink.write_all(bytes) => result.map_err(HttpError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{
        cookie::SetCookie, params::parse_accept_encoding, response::CompressMode,
        types::HeaderMap,
    };
    use crate::server::monitor::Registry;
    use std::io::Read as _;
    use std::time::Instant;

    fn head() -> ResponseHead {
        ResponseHead {
            status: 200,
            reason: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            content_length: None,
            compress: CompressMode::Default,
        }
    }

    fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no head terminator");
        (
            String::from_utf8(raw[..pos + 4].to_vec()).unwrap(),
            raw[pos + 4..].to_vec(),
        )
    }

    fn dechunk(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(
                std::str::from_utf8(&body[..line_end]).unwrap().trim(),
                16,
            )
            .unwrap();
            body = &body[line_end + 2..];
            if size == 0 {
                assert_eq!(&body[..2], b"\r\n");
                return out;
            }
            out.extend_from_slice(&body[..size]);
            assert_eq!(&body[size..size + 2], b"\r\n");
            body = &body[size + 2..];
        }
    }

    /// Runs `parts` through a fresh writer and returns the raw output.
    async fn produce(
        negotiated: Option<ContentEncoding>,
        is_head: bool,
        mut h: ResponseHead,
        parts: &[&[u8]],
    ) -> (ResponseHead, Vec<u8>) {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        {
            let mut writer =
                ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, negotiated, is_head);
            for part in parts {
                writer.write(&mut h, part).await.unwrap();
            }
            writer.close(&mut h).await.unwrap();
        }
        (h, out)
    }

    #[tokio::test]
    async fn small_body_gets_computed_content_length() {
        let (_, out) = produce(None, false, head(), &[b"hello world"]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.starts_with("HTTP/1.1 200 \r\n"));
        assert!(head_text.contains("content-length: 11\r\n"));
        assert!(!head_text.contains("transfer-encoding"));
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn large_body_switches_to_chunked() {
        let payload = vec![b'a'; 5000];
        let (_, out) = produce(None, false, head(), &[&payload]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("transfer-encoding: chunked\r\n"));
        assert!(!head_text.contains("content-length"));
        assert_eq!(dechunk(&body), payload);
    }

    #[tokio::test]
    async fn explicit_content_length_forces_fixed_framing() {
        let mut h = head();
        h.content_length = Some(5000);
        let payload = vec![b'b'; 5000];
        let (_, out) = produce(None, false, h, &[&payload]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("content-length: 5000\r\n"));
        assert!(!head_text.contains("transfer-encoding"));
        assert_eq!(body.len(), 5000);
    }

    #[tokio::test]
    async fn empty_body_close_emits_zero_length() {
        let (_, out) = produce(None, false, head(), &[]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("content-length: 0\r\n"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn gzip_compression_rides_chunked_framing() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let (_, out) = produce(Some(ContentEncoding::Gzip), false, head(), &[&payload]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("content-encoding: gzip\r\n"));
        assert!(head_text.contains("transfer-encoding: chunked\r\n"));
        assert!(!head_text.contains("content-length"));

        let compressed = dechunk(&body);
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn deflate_decodes_as_zlib() {
        let payload = b"abcdefgh".repeat(100);
        let (_, out) = produce(Some(ContentEncoding::Deflate), false, head(), &[&payload]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("content-encoding: deflate\r\n"));

        let compressed = dechunk(&body);
        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn compress_off_disables_negotiated_encoding() {
        let mut h = head();
        h.compress = CompressMode::Off;
        let (_, out) = produce(Some(ContentEncoding::Gzip), false, h, &[b"plain text"]).await;
        let (head_text, body) = split_response(&out);
        assert!(!head_text.contains("content-encoding"));
        assert_eq!(body, b"plain text");
    }

    #[tokio::test]
    async fn explicit_content_length_skips_compression() {
        let mut h = head();
        h.content_length = Some(10);
        let (_, out) = produce(Some(ContentEncoding::Gzip), false, h, &[b"plain text"]).await;
        let (head_text, body) = split_response(&out);
        assert!(!head_text.contains("content-encoding"));
        assert_eq!(body, b"plain text");
    }

    #[tokio::test]
    async fn head_request_suppresses_body() {
        let mut h = head();
        h.content_length = Some(11);
        let (_, out) = produce(None, true, h, &[b"hello world"]).await;
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("content-length: 11\r\n"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        let mut h = head();
        let mut writer =
            ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
        writer.write(&mut h, b"once").await.unwrap();
        writer.close(&mut h).await.unwrap();
        writer.close(&mut h).await.unwrap();

        // Writing after close is refused.
        let err = writer.write(&mut h, b"more").await.unwrap_err();
        assert!(matches!(err, HttpError::IllegalState(_)));
        drop(writer);

        let (_, body) = split_response(&out);
        assert_eq!(body, b"once");
    }

    #[tokio::test]
    async fn flush_before_length_known_forces_chunked() {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        let mut h = head();
        {
            let mut writer =
                ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
            writer.write(&mut h, b"part one").await.unwrap();
            writer.flush(&mut h).await.unwrap();
            writer.write(&mut h, b" part two").await.unwrap();
            writer.close(&mut h).await.unwrap();
        }
        let (head_text, body) = split_response(&out);
        assert!(head_text.contains("transfer-encoding: chunked\r\n"));
        assert_eq!(dechunk(&body), b"part one part two");
    }

    #[tokio::test]
    async fn reason_phrase_only_when_set() {
        let mut h = head();
        h.status = 404;
        h.reason = Some("Not Found".to_string());
        let (_, out) = produce(None, false, h, &[]).await;
        let (head_text, _) = split_response(&out);
        assert!(head_text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn cookies_emitted_after_headers() {
        let mut h = head();
        h.headers.add("x-first", "1");
        h.cookies.push(SetCookie::new("sid", "abc").path("/"));
        let (_, out) = produce(None, false, h, &[]).await;
        let (head_text, _) = split_response(&out);
        let first = head_text.find("x-first: 1").unwrap();
        let cookie = head_text.find("set-cookie: sid=abc; Path=/").unwrap();
        assert!(cookie > first);
    }

    #[tokio::test]
    async fn scratch_survives_for_reuse() {
        let registry = Registry::default();
        let info = registry.register(Instant::now());
        let mut scratch = WriteBuffers::default();
        let mut out: Vec<u8> = Vec::new();
        {
            let mut h = head();
            let mut writer =
                ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
            writer.write(&mut h, &vec![b'x'; 3000]).await.unwrap();
            writer.close(&mut h).await.unwrap();
        }
        let frame_capacity = scratch.frame.capacity();
        assert!(frame_capacity > 0);

        // A second response reuses the same allocations.
        out.clear();
        {
            let mut h = head();
            let mut writer =
                ResponseWriter::new(&mut out, &info, &mut scratch, 1024, 4096, None, false);
            writer.write(&mut h, &vec![b'y'; 3000]).await.unwrap();
            writer.close(&mut h).await.unwrap();
        }
        assert_eq!(scratch.frame.capacity(), frame_capacity);
        let (_, body) = split_response(&out);
        assert_eq!(dechunk(&body), vec![b'y'; 3000]);
    }

    #[test]
    fn negotiation_prefers_client_order() {
        let accept = parse_accept_encoding("deflate, gzip;q=0.8");
        assert_eq!(negotiate_encoding(&accept), Some(ContentEncoding::Deflate));

        let accept = parse_accept_encoding("gzip, deflate");
        assert_eq!(negotiate_encoding(&accept), Some(ContentEncoding::Gzip));

        let accept = parse_accept_encoding("br");
        assert_eq!(negotiate_encoding(&accept), None);

        let accept = parse_accept_encoding("gzip;q=0, deflate");
        assert_eq!(negotiate_encoding(&accept), Some(ContentEncoding::Deflate));

        let accept = parse_accept_encoding("br;q=0.9, gzip;q=0.1");
        assert_eq!(negotiate_encoding(&accept), Some(ContentEncoding::Gzip));
    }
}
