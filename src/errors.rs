use std::io;

/// Error raised by connection processing and by the request/response streams.
///
/// Every failure the worker loop can observe is one of these kinds. Kinds
/// where [`is_expected`](HttpError::is_expected) returns `true` end the
/// connection silently; the rest produce an error reply when the response is
/// still uncommitted and a bare socket close otherwise.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The peer closed the TCP connection while a request was awaited or
    /// only partially read.
    #[error("client closed the connection")]
    ClientClosed,

    /// A byte violated the character class of the current parser state.
    #[error("invalid byte 0x{byte:02X} in state {state}")]
    Parse { state: &'static str, byte: u8 },

    /// Structurally valid input that is semantically unacceptable (bad
    /// protocol version, missing or duplicate Host, bad Content-Length,
    /// oversized preamble or body). Carries the reply status.
    #[error("request rejected with status {status}")]
    Rejected { status: u16 },

    /// A socket read or write outlived its deadline. Expected only while
    /// waiting between keep-alive requests.
    #[error("socket timeout (keep_alive: {keep_alive})")]
    Timeout { keep_alive: bool },

    /// The liveness monitor evicted this connection for falling below a
    /// throughput floor or exceeding the processing deadline.
    #[error("connection evicted by liveness monitor")]
    SlowPeer,

    /// More unread request-body bytes remained than the drain limit allows;
    /// the connection cannot be reused.
    #[error("too many unread body bytes to drain")]
    TooManyBytesToDrain,

    /// The application handler returned an error.
    #[error("handler failed")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Any other socket-level failure.
    #[error("i/o failure")]
    Io(#[source] io::Error),

    /// The server is shutting down and interrupted this worker.
    #[error("server shutting down")]
    Shutdown,

    /// A request/response object was used out of order, e.g. `set_compress`
    /// after the first body byte or `reset` after commit.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl HttpError {
    /// Whether this failure is part of normal connection churn. Expected
    /// failures are logged at debug level and never produce an error reply.
    #[inline]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            HttpError::ClientClosed
                | HttpError::Timeout { keep_alive: true }
                | HttpError::TooManyBytesToDrain
                | HttpError::SlowPeer
                | HttpError::Shutdown
        )
    }

    /// The reply status for this failure, if it gets one at all. Timeouts
    /// and expected failures close the socket without a reply.
    #[inline]
    pub(crate) fn status(&self) -> Option<u16> {
        match self {
            HttpError::Parse { .. } => Some(400),
            HttpError::Rejected { status } => Some(*status),
            HttpError::Handler(_) => Some(500),
            HttpError::Io(_) => Some(500),
            HttpError::IllegalState(_) => Some(500),
            _ => None,
        }
    }
}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => HttpError::ClientClosed,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                HttpError::Timeout { keep_alive: false }
            }
            _ => HttpError::Io(err),
        }
    }
}

macro_rules! canned_replies {
    ($( $status:literal; )*) => {
        /// The wire bytes for an error reply with the given status: bare
        /// status line, `connection: close`, empty body. Statuses without a
        /// canned form fall back to 500.
        pub(crate) const fn canned_reply(status: u16) -> &'static [u8] {
            match status { $(
                $status => concat!(
                    "HTTP/1.1 ", $status, " \r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n",
                    "\r\n",
                ).as_bytes(),
            )*
                _ => canned_reply_500(),
            }
        }
    };
}

const fn canned_reply_500() -> &'static [u8] {
    b"HTTP/1.1 500 \r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
}

canned_replies! {
    400;
    413;
    417;
    431;
    500;
    505;
}
