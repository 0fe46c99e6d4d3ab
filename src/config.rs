//! Server configuration: listener endpoints and process-wide limits.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Slowloris-style trickle attacks (throughput floors, §[`ServerConfig::min_read_throughput`])
//! - Header and body flooding (size caps)
//! - Connections parked forever in keep-alive (timeouts)
//!
//! All durations are [`Duration`]s; all sizes are in bytes. Options whose
//! reference semantics are "-1 disables" are modeled as `Option` — `None`
//! disables the check.
//!
//! # Examples
//!
//! ```no_run
//! use pier_http::{Server, ServerConfig, ListenerConfig};
//! use std::time::Duration;
//!
//! # pier_http::doc_handler! { MyHandler }
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
//!         .handler(MyHandler)
//!         .config(ServerConfig {
//!             keep_alive_timeout: Duration::from_secs(30),
//!             max_request_header_size: Some(64 * 1024),
//!             ..ServerConfig::default()
//!         })
//!         .build()
//!         .launch()
//!         .await
//!         .unwrap();
//! }
//! ```

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::{collections::HashMap, net::IpAddr, time::Duration};

/// One accept endpoint: bind address, port, and optional TLS key material.
///
/// A listener with key material accepts TLS connections and stamps the
/// `https` scheme onto every request it produces; a plaintext listener
/// stamps `http`. Immutable after [`Server::launch`](crate::Server::launch).
///
/// Certificate *loading* (PEM files, keystores) is the host program's
/// concern; this type carries already-parsed DER material.
#[derive(Debug)]
pub struct ListenerConfig {
    /// Address to bind.
    pub address: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// TLS key material. `None` means plaintext.
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    /// A plaintext listener on `address:port`.
    #[inline]
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port, tls: None }
    }

    /// A TLS listener on `address:port` with the given certificate chain and
    /// private key.
    #[inline]
    pub fn with_tls(
        address: IpAddr,
        port: u16,
        certificates: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            address,
            port,
            tls: Some(TlsConfig { certificates, private_key }),
        }
    }

    /// The URL scheme requests accepted by this listener carry.
    #[inline]
    pub fn scheme(&self) -> &'static str {
        match self.tls {
            Some(_) => "https",
            None => "http",
        }
    }
}

/// Certificate chain plus private key for one TLS listener.
#[derive(Debug)]
pub struct TlsConfig {
    /// Leaf certificate first, then intermediates.
    pub certificates: Vec<CertificateDer<'static>>,
    /// The leaf's private key.
    pub private_key: PrivateKeyDer<'static>,
}

/// Process-wide immutable server configuration.
///
/// Construct with struct-update syntax over [`ServerConfig::default`]; the
/// builder rejects nothing, so a nonsensical combination (for example a zero
/// `request_buffer_size`) shows up as runtime misbehavior, not a panic.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Size of the per-worker preamble read buffer (default: `8 KiB`).
    ///
    /// Bytes read past the end of one logical element (preamble, chunked
    /// body) stay in this buffer for the next reader, so it also bounds how
    /// much of a pipelined next request the server will hold.
    pub request_buffer_size: usize,

    /// Pre-commit response buffer size (default: `0`).
    ///
    /// If greater than zero, handler output accumulates off the wire until
    /// it outgrows this buffer — so a late failure can still replace the
    /// whole response with an error reply, and a small body that ends
    /// before the buffer fills goes out with a computed `Content-Length`
    /// instead of chunked framing. `0` commits on the first written byte.
    pub response_buffer_size: usize,

    /// Upper bound on total preamble bytes (default: `128 KiB`).
    ///
    /// Exceeding it rejects the request with `431`. `None` disables.
    pub max_request_header_size: Option<usize>,

    /// Per-content-type request body caps (default: `*` → 2 MiB).
    ///
    /// Keys are lowercase content types without parameters; the `*` entry is
    /// the wildcard default. A `None` value disables the cap for that type.
    /// Exceeding a cap rejects with `413`.
    pub max_request_body_size: HashMap<String, Option<u64>>,

    /// Chunk payload bound for chunked response framing (default: `16 KiB`).
    ///
    /// Also the threshold past which an unsized response switches from a
    /// buffered fixed-length reply to `Transfer-Encoding: chunked`.
    pub max_chunk_size: usize,

    /// Keep-alive drain limit (default: `128 KiB`).
    ///
    /// At most this many unread request-body bytes are read and discarded
    /// before reusing a connection; a larger remainder closes it instead.
    pub max_bytes_to_drain: u64,

    /// Deadline for the first preamble byte of a new connection
    /// (default: `2 s`).
    pub initial_read_timeout: Duration,

    /// Deadline for the next request on a kept-alive connection
    /// (default: `20 s`).
    pub keep_alive_timeout: Duration,

    /// Wall-clock cap on handler execution (default: `30 s`), enforced by
    /// the liveness monitor because no socket deadline runs while the
    /// handler does.
    pub processing_timeout: Duration,

    /// Read throughput floor in bytes/second (default: `512`). `None`
    /// disables. Checked only after
    /// [`read_throughput_calculation_delay`](Self::read_throughput_calculation_delay).
    pub min_read_throughput: Option<u64>,

    /// Write throughput floor in bytes/second (default: `512`). `None`
    /// disables. Checked only after
    /// [`write_throughput_calculation_delay`](Self::write_throughput_calculation_delay).
    pub min_write_throughput: Option<u64>,

    /// Warm-up window before read throughput is evaluated (default: `5 s`).
    pub read_throughput_calculation_delay: Duration,

    /// Warm-up window before write throughput is evaluated (default: `5 s`).
    pub write_throughput_calculation_delay: Duration,

    /// How long a graceful shutdown waits for live workers to finish
    /// (default: `10 s`).
    pub shutdown_timeout: Duration,

    /// Options forwarded verbatim to an external multipart decoder; the
    /// core stores them and nothing more.
    pub multipart: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut max_request_body_size = HashMap::new();
        max_request_body_size.insert("*".to_string(), Some(2 * 1024 * 1024));

        Self {
            request_buffer_size: 8 * 1024,
            response_buffer_size: 0,
            max_request_header_size: Some(128 * 1024),
            max_request_body_size,
            max_chunk_size: 16 * 1024,
            max_bytes_to_drain: 128 * 1024,
            initial_read_timeout: Duration::from_secs(2),
            keep_alive_timeout: Duration::from_secs(20),
            processing_timeout: Duration::from_secs(30),
            min_read_throughput: Some(512),
            min_write_throughput: Some(512),
            read_throughput_calculation_delay: Duration::from_secs(5),
            write_throughput_calculation_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            multipart: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// The body cap for a request with the given `Content-Type` base value
    /// (no parameters, any case). Falls back to the `*` wildcard entry;
    /// `None` means unlimited.
    pub(crate) fn body_limit_for(&self, content_type: Option<&str>) -> Option<u64> {
        if let Some(ct) = content_type {
            let ct = ct.to_ascii_lowercase();
            if let Some(limit) = self.max_request_body_size.get(ct.as_str()) {
                return *limit;
            }
        }
        self.max_request_body_size.get("*").copied().flatten()
    }
}
