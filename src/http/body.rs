//! Request body streams: fixed-length and chunked, over the worker's
//! carryover read buffer.
//!
//! Socket reads land in a per-worker [`ReadBuffer`]; consumers (the preamble
//! parser, then the body reader, then the next request's preamble) take
//! byte-exact slices out of it, so bytes read past one logical boundary are
//! simply still buffered when the next consumer starts. Only socket reads
//! can overshoot, and only into this buffer.

use crate::{errors::HttpError, server::monitor::ConnectionInfo};
use tokio::io::{AsyncRead, AsyncReadExt};

/// The per-worker staging buffer between the socket and the parsers.
pub(crate) struct ReadBuffer {
    data: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl ReadBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(64)].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn available(&self) -> &[u8] {
        &self.data[self.pos..self.len]
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.len
    }

    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        self.pos += n;
        debug_assert!(self.pos <= self.len);
    }

    /// Forgets everything, including carryover. Used between connections.
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    /// Refills from `reader`. Callers only refill an empty buffer; carryover
    /// bytes are never overwritten.
    pub(crate) async fn fill(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> std::io::Result<usize> {
        debug_assert!(self.is_empty());
        self.pos = 0;
        self.len = reader.read(&mut self.data).await?;
        Ok(self.len)
    }
}

/// The body's view of the connection: buffered bytes first, then the socket,
/// every socket read raced against the worker's interrupt signal.
pub(crate) struct BodySource<'a> {
    reader: &'a mut (dyn AsyncRead + Unpin + Send),
    buf: &'a mut ReadBuffer,
    info: &'a ConnectionInfo,
}

impl<'a> BodySource<'a> {
    pub(crate) fn new(
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        buf: &'a mut ReadBuffer,
        info: &'a ConnectionInfo,
    ) -> Self {
        Self { reader, buf, info }
    }

    /// Makes at least one byte available, or reports `Ok(0)` on a clean EOF.
    async fn fill(&mut self) -> Result<usize, HttpError> {
        if !self.buf.is_empty() {
            return Ok(self.buf.available().len());
        }
        tokio::select! {
            biased;
            err = self.info.interrupted() => Err(err),
            read = self.buf.fill(self.reader) => Ok(read?),
        }
    }
}

/// How the preamble declared the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    None,
    Fixed(u64),
    Chunked,
}

#[derive(Debug, Clone, Copy)]
enum BodyState {
    None,
    Fixed { remaining: u64 },
    Chunked(ChunkPhase),
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    /// Hex size digits. `seen_digit` distinguishes an empty size line.
    Size { value: u64, seen_digit: bool },
    /// Chunk extension after `;`, ignored until CR.
    Ext { value: u64 },
    /// CR of the size line seen, expecting LF.
    SizeLf { value: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    /// Start of a line in the trailer section.
    TrailerStart,
    /// Inside a trailer field line, discarded until CR.
    TrailerLine,
    /// CR of a trailer line seen, expecting LF.
    TrailerLf,
    /// CR of the empty line ending the trailer section, expecting LF.
    FinalLf,
}

/// The request body input stream handed to the handler through
/// [`Request`](crate::Request).
///
/// Reads deliver exactly the declared payload: the remaining
/// `Content-Length` bytes, or the de-chunked data with extensions and
/// trailers stripped. After the end, reads return `Ok(0)`.
pub struct Body<'a> {
    source: BodySource<'a>,
    state: BodyState,
    limit: Option<u64>,
    consumed: u64,
}

impl<'a> Body<'a> {
    pub(crate) fn new(source: BodySource<'a>, kind: BodyKind, limit: Option<u64>) -> Self {
        let state = match kind {
            BodyKind::None => BodyState::None,
            BodyKind::Fixed(0) => BodyState::Done,
            BodyKind::Fixed(n) => BodyState::Fixed { remaining: n },
            BodyKind::Chunked => {
                BodyState::Chunked(ChunkPhase::Size { value: 0, seen_digit: false })
            }
        };
        Self { source, state, limit, consumed: 0 }
    }

    /// Whether the body has been read to its end.
    pub fn is_consumed(&self) -> bool {
        matches!(self.state, BodyState::None | BodyState::Done)
    }

    /// Total payload bytes delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.consumed
    }

    /// Reads payload bytes into `buf`. `Ok(0)` means the body has ended.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                BodyState::None | BodyState::Done => return Ok(0),
                BodyState::Fixed { remaining } => {
                    let available = self.source.fill().await?;
                    if available == 0 {
                        return Err(HttpError::ClientClosed);
                    }
                    let n = (remaining.min(buf.len() as u64) as usize)
                        .min(self.source.buf.available().len());
                    buf[..n].copy_from_slice(&self.source.buf.available()[..n]);
                    self.source.buf.consume(n);
                    self.state = match remaining - n as u64 {
                        0 => BodyState::Done,
                        left => BodyState::Fixed { remaining: left },
                    };
                    self.account(n)?;
                    return Ok(n);
                }
                BodyState::Chunked(_) => {
                    if let Some(n) = self.step_chunked(buf).await? {
                        return Ok(n);
                    }
                }
            }
        }
    }

    /// Appends the whole remaining body to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, HttpError> {
        let mut scratch = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&scratch[..n]);
            total += n;
        }
    }

    /// Reads and discards whatever the handler left unread, so the
    /// connection can host the next request. A remainder past `max` makes
    /// the connection unreusable.
    pub(crate) async fn drain(&mut self, max: u64) -> Result<u64, HttpError> {
        if let BodyState::Fixed { remaining } = self.state {
            if remaining > max {
                return Err(HttpError::TooManyBytesToDrain);
            }
        }
        let mut scratch = [0u8; 4096];
        let mut total: u64 = 0;
        loop {
            let n = match self.read(&mut scratch).await {
                Ok(n) => n,
                // Blowing the body-size cap while draining is just another
                // way of having too much left over.
                Err(HttpError::Rejected { status: 413 }) => {
                    return Err(HttpError::TooManyBytesToDrain)
                }
                Err(err) => return Err(err),
            };
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
            if total > max {
                return Err(HttpError::TooManyBytesToDrain);
            }
        }
    }

    fn account(&mut self, n: usize) -> Result<(), HttpError> {
        self.consumed += n as u64;
        if let Some(limit) = self.limit {
            if self.consumed > limit {
                return Err(HttpError::Rejected { status: 413 });
            }
        }
        Ok(())
    }

    /// Advances the chunked machine. Returns `Some(n)` when payload bytes
    /// landed in `buf` or the body ended; `None` to keep stepping.
    async fn step_chunked(&mut self, buf: &mut [u8]) -> Result<Option<usize>, HttpError> {
        let BodyState::Chunked(phase) = self.state else {
            unreachable!("step_chunked outside chunked state");
        };

        // Chunk data is bulk-copied; every framing byte goes through the
        // one-byte path below.
        if let ChunkPhase::Data { remaining } = phase {
            let available = self.source.fill().await?;
            if available == 0 {
                return Err(HttpError::ClientClosed);
            }
            let n = (remaining.min(buf.len() as u64) as usize)
                .min(self.source.buf.available().len());
            buf[..n].copy_from_slice(&self.source.buf.available()[..n]);
            self.source.buf.consume(n);
            self.state = match remaining - n as u64 {
                0 => BodyState::Chunked(ChunkPhase::DataCr),
                left => BodyState::Chunked(ChunkPhase::Data { remaining: left }),
            };
            self.account(n)?;
            return Ok(Some(n));
        }

        let available = self.source.fill().await?;
        if available == 0 {
            return Err(HttpError::ClientClosed);
        }
        let byte = self.source.buf.available()[0];
        self.source.buf.consume(1);

        let next = match phase {
            ChunkPhase::Size { value, seen_digit } => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    let digit = hex_value(byte);
                    let value = value
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit as u64))
                        .ok_or(HttpError::Parse { state: "ChunkSize", byte })?;
                    ChunkPhase::Size { value, seen_digit: true }
                }
                b';' if seen_digit => ChunkPhase::Ext { value },
                b'\r' if seen_digit => ChunkPhase::SizeLf { value },
                _ => return Err(HttpError::Parse { state: "ChunkSize", byte }),
            },
            ChunkPhase::Ext { value } => match byte {
                b'\r' => ChunkPhase::SizeLf { value },
                _ => ChunkPhase::Ext { value },
            },
            ChunkPhase::SizeLf { value } => match byte {
                b'\n' if value == 0 => ChunkPhase::TrailerStart,
                b'\n' => ChunkPhase::Data { remaining: value },
                _ => return Err(HttpError::Parse { state: "ChunkSizeLF", byte }),
            },
            ChunkPhase::Data { .. } => unreachable!("handled above"),
            ChunkPhase::DataCr => match byte {
                b'\r' => ChunkPhase::DataLf,
                _ => return Err(HttpError::Parse { state: "ChunkDataCR", byte }),
            },
            ChunkPhase::DataLf => match byte {
                b'\n' => ChunkPhase::Size { value: 0, seen_digit: false },
                _ => return Err(HttpError::Parse { state: "ChunkDataLF", byte }),
            },
            ChunkPhase::TrailerStart => match byte {
                b'\r' => ChunkPhase::FinalLf,
                _ => ChunkPhase::TrailerLine,
            },
            ChunkPhase::TrailerLine => match byte {
                b'\r' => ChunkPhase::TrailerLf,
                _ => ChunkPhase::TrailerLine,
            },
            ChunkPhase::TrailerLf => match byte {
                b'\n' => ChunkPhase::TrailerStart,
                _ => return Err(HttpError::Parse { state: "TrailerLF", byte }),
            },
            ChunkPhase::FinalLf => match byte {
                b'\n' => {
                    self.state = BodyState::Done;
                    return Ok(Some(0));
                }
                _ => return Err(HttpError::Parse { state: "FinalLF", byte }),
            },
        };
        self.state = BodyState::Chunked(next);
        Ok(None)
    }
}

#[inline]
const fn hex_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        _ => byte - b'A' + 10,
    }
}
