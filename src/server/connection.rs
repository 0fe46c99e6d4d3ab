//! The per-connection worker: one request/response turn per iteration of an
//! outer loop, exiting only when the connection must be closed.
//!
//! Within one connection, request and response are strictly serialized — the
//! next preamble is not parsed until the previous response is closed and the
//! unread body remainder drained. Two close paths exist: a bare socket close
//! for expected endings, and an error reply (only possible while the
//! response is uncommitted) followed by the close for everything else.

use crate::{
    config::ServerConfig,
    errors::{canned_reply, HttpError},
    http::{
        body::{Body, BodyKind, BodySource, ReadBuffer},
        params,
        preamble::PreambleParser,
        request::Request,
        response::{Response, ResponseHead},
        types::Version,
        writer::{negotiate_encoding, ResponseWriter, WriteBuffers},
    },
    server::{
        monitor::{ConnectionInfo, CountingReader, CountingWriter, WorkerState},
        server_impl::{ExpectValidator, Handler, ServerShared},
    },
};
use std::{net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Scratch owned by one worker at a time, recycled through the server's
/// buffer pool between connections.
pub(crate) struct WorkerBuffers {
    read: ReadBuffer,
    write: WriteBuffers,
}

impl WorkerBuffers {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Self {
            read: ReadBuffer::with_capacity(config.request_buffer_size),
            write: WriteBuffers::default(),
        }
    }

    /// Clears per-connection state so the next connection starts clean.
    pub(crate) fn reset(&mut self) {
        self.read.reset();
    }
}

enum Turn {
    KeepAlive,
    Close,
}

/// Drives one connection to completion. The socket closes when the stream
/// drops on return.
pub(crate) async fn run_connection<S, H, X>(
    stream: S,
    remote_addr: SocketAddr,
    scheme: &'static str,
    shared: &ServerShared<H, X>,
    info: &Arc<ConnectionInfo>,
    buffers: &mut WorkerBuffers,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
    X: ExpectValidator,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = CountingReader::new(read_half, info.clone());
    let mut writer = CountingWriter::new(write_half, info.clone());
    let mut parser = PreambleParser::new(shared.config.max_request_header_size);

    let mut first = true;
    loop {
        let turn = serve_turn(
            &mut reader,
            &mut writer,
            &mut parser,
            buffers,
            shared,
            info,
            remote_addr,
            scheme,
            first,
        )
        .await;

        match turn {
            Ok(Turn::KeepAlive) => first = false,
            Ok(Turn::Close) => {
                tracing::debug!(connection = info.id, "closing connection");
                break;
            }
            Err((err, committed)) => {
                if err.is_expected() {
                    tracing::debug!(connection = info.id, error = %err, "connection ended");
                } else if let (Some(status), false) = (err.status(), committed) {
                    tracing::warn!(
                        connection = info.id,
                        error = %err,
                        status,
                        "request failed, replying with error status"
                    );
                    // Best effort: the peer may already be gone.
                    let _ = writer.write_all(canned_reply(status)).await;
                    let _ = writer.flush().await;
                } else {
                    tracing::warn!(connection = info.id, error = %err, "connection failed");
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn serve_turn<H, X>(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    parser: &mut PreambleParser,
    buffers: &mut WorkerBuffers,
    shared: &ServerShared<H, X>,
    info: &ConnectionInfo,
    remote_addr: SocketAddr,
    scheme: &'static str,
    first: bool,
) -> Result<Turn, (HttpError, bool)>
where
    H: Handler,
    X: ExpectValidator,
{
    let config = &*shared.config;
    let timeout = if first {
        info.set_state(WorkerState::Read);
        info.begin_read();
        config.initial_read_timeout
    } else {
        info.set_state(WorkerState::KeepAlive);
        config.keep_alive_timeout
    };

    // Preamble. Carryover bytes from the previous request are consumed
    // before the socket is touched.
    parser.reset();
    let mut seen_byte = !buffers.read.is_empty();
    loop {
        if buffers.read.is_empty() {
            let read = tokio::select! {
                biased;
                err = info.interrupted() => return Err((err, false)),
                result = buffers.read.fill(reader) => {
                    result.map_err(HttpError::from).map_err(|e| (e, false))?
                }
                _ = tokio::time::sleep(timeout) => {
                    let keep_alive = !first && !seen_byte;
                    return Err((HttpError::Timeout { keep_alive }, false));
                }
            };
            if read == 0 {
                return Err((HttpError::ClientClosed, false));
            }
        }
        if !seen_byte {
            seen_byte = true;
            if !first {
                info.set_state(WorkerState::Read);
                info.begin_read();
            }
        }

        let available = buffers.read.available().len();
        match parser.push(buffers.read.available()) {
            Ok(Some(consumed)) => {
                buffers.read.consume(consumed);
                break;
            }
            Ok(None) => buffers.read.consume(available),
            Err(err) => return Err((err, false)),
        }
    }

    let mut head = parser.take_head();
    let head_info =
        crate::http::preamble::validate(&mut head).map_err(|e| (e, false))?;

    // Facts needed after `head` moves into the Request.
    let version = head_info.version;
    let is_head_method = head.method == "HEAD";
    let request_wants_close = connection_token(head.headers.get("connection"));
    let content_type = head
        .headers
        .get("content-type")
        .map(params::content_type_base);
    let body_limit = config.body_limit_for(content_type.as_deref());
    let negotiated = head
        .headers
        .get("accept-encoding")
        .map(params::parse_accept_encoding)
        .and_then(|accept| negotiate_encoding(&accept));

    // A declared length over the cap fails before any body byte is read.
    if let (Some(declared), Some(limit)) = (head_info.content_length, body_limit) {
        if declared as u64 > limit {
            return Err((HttpError::Rejected { status: 413 }, false));
        }
    }

    let body_kind = if head_info.chunked {
        BodyKind::Chunked
    } else {
        match head_info.content_length {
            Some(n) => BodyKind::Fixed(n as u64),
            None => BodyKind::None,
        }
    };

    let WorkerBuffers { read: read_buf, write: write_buf } = buffers;
    let body = Body::new(BodySource::new(reader, read_buf, info), body_kind, body_limit);
    let mut request = Request::new(head, head_info, body, remote_addr, scheme);

    let mut response_head = ResponseHead::new();
    response_head.headers.set(
        "connection",
        match (version, request_wants_close) {
            (Version::Http11, ConnectionToken::Close) => "close",
            (Version::Http11, _) => "keep-alive",
            (Version::Http10, ConnectionToken::KeepAlive) => "keep-alive",
            (Version::Http10, _) => "close",
        },
    );
    let response_writer = ResponseWriter::new(
        writer,
        info,
        write_buf,
        config.max_chunk_size,
        config.response_buffer_size,
        negotiated,
        is_head_method,
    );
    let mut response = Response::new(response_head, response_writer);

    // Expect: 100-continue gets an interim answer before the handler sees
    // anything; a non-100 verdict is serialized as a bare status line and
    // ends the connection without invoking the handler.
    if request.expects_continue() {
        info.set_state(WorkerState::Write);
        let verdict = shared.expect.validate(&request);
        if verdict == 100 {
            response
                .send_status_line(100, Some("Continue"))
                .await
                .map_err(|e| (e, false))?;
            info.set_state(WorkerState::Read);
            info.begin_read();
        } else {
            let reason = crate::http::types::canonical_reason(verdict);
            response
                .send_status_line(verdict, reason)
                .await
                .map_err(|e| (e, false))?;
            return Ok(Turn::Close);
        }
    }

    info.set_state(WorkerState::Process);
    let handler_result = tokio::select! {
        biased;
        err = info.interrupted() => Err(err),
        result = shared.handler.handle(&mut request, &mut response) => {
            // A stream error the handler merely propagated keeps its own
            // status (a body over its cap stays a 413, not a 500).
            result.map_err(|err| match err.downcast::<HttpError>() {
                Ok(http) => *http,
                Err(other) => HttpError::Handler(other),
            })
        }
    };
    if let Err(err) = handler_result {
        return Err((err, response.committed()));
    }

    response
        .close()
        .await
        .map_err(|e| (e, response.committed()))?;

    // The handler may have rewritten the connection header; the final value
    // decides reuse.
    let keep_alive = match (version, connection_token(response.connection_header())) {
        (Version::Http11, ConnectionToken::Close) => false,
        (Version::Http11, _) => true,
        (Version::Http10, ConnectionToken::KeepAlive) => true,
        (Version::Http10, _) => false,
    };
    if !keep_alive {
        return Ok(Turn::Close);
    }

    info.set_state(WorkerState::KeepAlive);
    request
        .body()
        .drain(config.max_bytes_to_drain)
        .await
        .map_err(|e| (e, true))?;

    Ok(Turn::KeepAlive)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConnectionToken {
    Close,
    KeepAlive,
    Other,
}

fn connection_token(value: Option<&str>) -> ConnectionToken {
    match value {
        Some(v) if v.trim().eq_ignore_ascii_case("close") => ConnectionToken::Close,
        Some(v) if v.trim().eq_ignore_ascii_case("keep-alive") => ConnectionToken::KeepAlive,
        _ => ConnectionToken::Other,
    }
}
