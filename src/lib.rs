//! pier_http - Standalone HTTP/1.1 server core
//!
//! A connection-lifecycle and wire-protocol engine: it accepts TCP
//! (optionally TLS) connections, parses requests byte-for-byte against the
//! RFC 7230/9110 format, hands a request/response pair to an
//! application-supplied [`Handler`], writes well-formed responses, and
//! multiplexes many concurrent connections on lightweight tasks.
//!
//! # Features
//!
//! ## Wire protocol
//! - **HTTP/1.1 and HTTP/1.0** with the correct keep-alive default for each.
//! - **Byte-level preamble parsing** - a strict finite-state machine that
//!   rejects malformed input with the offending state and byte.
//! - **Fixed-length and chunked request bodies**, chunk extensions ignored,
//!   trailers parsed and dropped.
//! - **Response framing chosen for you** - explicit `Content-Length`, a
//!   computed one for small buffered bodies, or chunked transfer encoding
//!   once output grows past the chunk size.
//! - **gzip / deflate response compression**, negotiated from the client's
//!   quality-ordered `Accept-Encoding`.
//! - **Expect: 100-continue** with a pluggable [`ExpectValidator`].
//!
//! ## Robustness
//! - **Error replies are never half-framed**: an uncommitted response is
//!   replaced by a clean status with `connection: close`; a committed one
//!   ends with a bare TCP close.
//! - **Throughput-based liveness monitoring** - peers reading or sending
//!   below configurable byte/second floors are evicted, which socket
//!   timeouts alone cannot do.
//! - **Keep-alive drain discipline** - unread request bodies are discarded
//!   up to a limit before a connection is reused.
//! - **Graceful shutdown** with a bounded drain period.
//!
//! # Quick Start
//!
//! ```no_run
//! use pier_http::{Server, ListenerConfig, Handler, HandlerError, Request, Response};
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(
//!         &self,
//!         _req: &mut Request<'_>,
//!         resp: &mut Response<'_>,
//!     ) -> Result<(), HandlerError> {
//!         resp.status(200)
//!             .header("content-type", "text/plain")
//!             .write(b"Hello world!")
//!             .await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! # What this crate is not
//!
//! No routing, no HTTP/2 or HTTP/3, no client side, no caching, no
//! multipart decoding (the request body stream and the stored `multipart.*`
//! options are the integration points for an external decoder).

pub(crate) mod http {
    pub(crate) mod body;
    pub mod cookie;
    pub mod params;
    pub(crate) mod preamble;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod writer;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod monitor;
    pub(crate) mod server_impl;
}
pub(crate) mod config;
pub(crate) mod errors;

pub use crate::{
    config::{ListenerConfig, ServerConfig, TlsConfig},
    errors::HttpError,
    http::{
        body::Body,
        cookie::{parse_cookie_header, Cookie, SameSite, SetCookie},
        params::{parse_accept_encoding, parse_parameterized, AcceptedEncoding, ParsedValue},
        request::Request,
        response::{CompressMode, Response},
        types::{canonical_reason, HeaderMap, Version},
        writer::ContentEncoding,
    },
    server::server_impl::{
        AlwaysContinue, BoundServer, ExpectValidator, Handler, HandlerError, LaunchError,
        Server, ServerBuilder, ServerHandle,
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! doc_handler {
    ($name:ident) => {
        use pier_http::{Handler, HandlerError, Request, Response};
        struct $name;

        impl Handler for $name {
            async fn handle(
                &self,
                _req: &mut Request<'_>,
                resp: &mut Response<'_>,
            ) -> Result<(), HandlerError> {
                resp.status(200).content_length(0)?;
                Ok(())
            }
        }
    };
}
