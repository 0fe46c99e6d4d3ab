//! Server assembly: the builder, the accept loops, and graceful shutdown.

use crate::{
    config::{ListenerConfig, ServerConfig},
    http::{request::Request, response::Response},
    server::{
        connection::{run_connection, WorkerBuffers},
        monitor::{run_monitor, Registry, ShutdownSignal, REASON_SHUTDOWN},
    },
};
use crossbeam::queue::SegQueue;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// The error type handlers report failures with. Any error maps to a `500`
/// reply when the response is still uncommitted.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The application entry point: one call per request.
///
/// The handler may read the request body (fully, partially, or not at all),
/// set status, headers and cookies, and write body bytes. Whatever body
/// remains unread afterwards is drained by the server. An `Err` becomes a
/// `500` if nothing has hit the wire yet, otherwise the connection closes.
///
/// # Examples
///
/// ```
/// use pier_http::{Handler, HandlerError, Request, Response};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(
///         &self,
///         _req: &mut Request<'_>,
///         resp: &mut Response<'_>,
///     ) -> Result<(), HandlerError> {
///         resp.status(200).write(b"Hello world!").await?;
///         Ok(())
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Decides what requests carrying `Expect: 100-continue` hear back.
///
/// Returning `100` lets the request proceed to the handler; any other status
/// is written as a bare status line and the connection closes without the
/// handler running.
pub trait ExpectValidator: Send + Sync + 'static {
    fn validate(&self, request: &Request<'_>) -> u16;
}

/// The default validator: everyone may continue.
pub struct AlwaysContinue;

impl ExpectValidator for AlwaysContinue {
    fn validate(&self, _request: &Request<'_>) -> u16 {
        100
    }
}

/// Everything the accept loops, workers and monitor share.
pub(crate) struct ServerShared<H, X> {
    pub(crate) handler: H,
    pub(crate) expect: X,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) shutdown: Arc<ShutdownSignal>,
    pub(crate) epoch: Instant,
    pub(crate) buffer_pool: SegQueue<WorkerBuffers>,
}

impl<H: Handler, X: ExpectValidator> ServerShared<H, X> {
    fn new(handler: H, expect: X, config: ServerConfig) -> Self {
        Self {
            handler,
            expect,
            config: Arc::new(config),
            registry: Arc::new(Registry::default()),
            shutdown: Arc::new(ShutdownSignal::default()),
            epoch: Instant::now(),
            buffer_pool: SegQueue::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(handler: H, expect: X, config: ServerConfig) -> Self {
        Self::new(handler, expect, config)
    }
}

/// Failures that keep the server from starting at all.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no listener configured")]
    NoListener,
    #[error("failed to bind {address}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid TLS key material")]
    Tls(#[source] rustls::Error),
}

/// An HTTP/1.1 server: one accept task per listener, one lightweight task
/// per connection, one monitor task evicting unresponsive peers.
///
/// # Examples
///
/// ```no_run
/// use pier_http::{Server, ListenerConfig};
///
/// # pier_http::doc_handler! { MyHandler }
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(ListenerConfig::new("127.0.0.1".parse().unwrap(), 8080))
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
///         .unwrap();
/// }
/// ```
pub struct Server<H, X = AlwaysContinue> {
    listeners: Vec<ListenerConfig>,
    shared: Arc<ServerShared<H, X>>,
}

/// A cloneable handle for triggering graceful shutdown from outside the
/// server task.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<ShutdownSignal>,
    registry: Arc<Registry>,
}

impl ServerHandle {
    /// Begins graceful shutdown: accept loops stop, the monitor exits, and
    /// every live worker is interrupted. [`Server::launch`] returns once
    /// workers have drained or the configured shutdown deadline passes.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.registry.interrupt_all(REASON_SHUTDOWN);
    }
}

impl<H: Handler> Server<H> {
    /// Starts configuring a server.
    pub fn builder() -> ServerBuilder<H, AlwaysContinue> {
        ServerBuilder {
            listeners: Vec::new(),
            handler: None,
            expect: Some(AlwaysContinue),
            config: None,
        }
    }
}

impl<H: Handler, X: ExpectValidator> Server<H, X> {
    /// A handle for shutting this server down.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shared.shutdown.clone(),
            registry: self.shared.registry.clone(),
        }
    }

    /// Binds every listener without accepting yet. The returned
    /// [`BoundServer`] exposes the resolved local addresses — useful when
    /// listening on port 0.
    pub fn bind(self) -> Result<BoundServer<H, X>, LaunchError> {
        if self.listeners.is_empty() {
            return Err(LaunchError::NoListener);
        }

        let mut bound = Vec::with_capacity(self.listeners.len());
        for listener_config in &self.listeners {
            let address = SocketAddr::new(listener_config.address, listener_config.port);
            let listener = bind_listener(address)
                .map_err(|source| LaunchError::Bind { address, source })?;
            let tls = match &listener_config.tls {
                Some(tls) => {
                    let mut server_config = rustls::ServerConfig::builder()
                        .with_no_client_auth()
                        .with_single_cert(
                            tls.certificates.clone(),
                            tls.private_key.clone_key(),
                        )
                        .map_err(LaunchError::Tls)?;
                    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
                    Some(TlsAcceptor::from(Arc::new(server_config)))
                }
                None => None,
            };
            let scheme = listener_config.scheme();
            tracing::info!(%address, scheme, "listening");
            bound.push((listener, tls, scheme));
        }

        Ok(BoundServer { listeners: bound, shared: self.shared })
    }

    /// Binds every listener, starts accepting, and runs until
    /// [`ServerHandle::shutdown`] is called. On shutdown, waits up to
    /// `shutdown_timeout` for live connections to finish.
    pub async fn launch(self) -> Result<(), LaunchError> {
        self.bind()?.serve().await;
        Ok(())
    }
}

/// A server whose listeners are bound but not yet accepting.
pub struct BoundServer<H, X = AlwaysContinue> {
    listeners: Vec<(TcpListener, Option<TlsAcceptor>, &'static str)>,
    shared: Arc<ServerShared<H, X>>,
}

impl<H: Handler, X: ExpectValidator> BoundServer<H, X> {
    /// The resolved address of every bound listener, in configuration
    /// order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _, _)| listener.local_addr().ok())
            .collect()
    }

    /// A handle for shutting this server down.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shared.shutdown.clone(),
            registry: self.shared.registry.clone(),
        }
    }

    /// Accepts connections until [`ServerHandle::shutdown`], then waits up
    /// to `shutdown_timeout` for live connections to finish.
    pub async fn serve(self) {
        let mut accept_tasks = Vec::with_capacity(self.listeners.len());
        for (listener, tls, scheme) in self.listeners {
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                tls,
                scheme,
                self.shared.clone(),
            )));
        }

        let monitor = tokio::spawn(run_monitor(
            self.shared.registry.clone(),
            self.shared.config.clone(),
            self.shared.shutdown.clone(),
        ));

        self.shared.shutdown.wait().await;
        // Belt and braces: the handle interrupts workers too, but shutdown
        // may also race a registration that the handle's sweep missed.
        self.shared.registry.interrupt_all(REASON_SHUTDOWN);

        for task in accept_tasks {
            let _ = task.await;
        }
        let _ = monitor.await;

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        while self.shared.registry.len() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let remaining = self.shared.registry.len();
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown deadline passed with live connections");
        }
    }
}

/// Binds with address reuse and a deep backlog, then hands the socket to
/// tokio.
fn bind_listener(address: SocketAddr) -> io::Result<TcpListener> {
    let domain = socket2::Domain::for_address(address);
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop<H: Handler, X: ExpectValidator>(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    scheme: &'static str,
    shared: Arc<ServerShared<H, X>>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            result = listener.accept() => result,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                spawn_worker(stream, peer, tls.clone(), scheme, shared.clone());
            }
            Err(err) if shared.shutdown.is_triggered() => {
                tracing::debug!(error = %err, "accept ended by shutdown");
                break;
            }
            Err(err) => {
                // Transient accept failures (aborted handshakes, fd
                // pressure) must not kill the listener.
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

fn spawn_worker<H: Handler, X: ExpectValidator>(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    scheme: &'static str,
    shared: Arc<ServerShared<H, X>>,
) {
    tokio::spawn(async move {
        let info = shared.registry.register(shared.epoch);
        let mut buffers = shared
            .buffer_pool
            .pop()
            .unwrap_or_else(|| WorkerBuffers::new(&shared.config));

        match tls {
            Some(acceptor) => {
                let handshake = tokio::time::timeout(
                    shared.config.initial_read_timeout,
                    acceptor.accept(stream),
                )
                .await;
                match handshake {
                    Ok(Ok(tls_stream)) => {
                        run_connection(tls_stream, peer, scheme, &shared, &info, &mut buffers)
                            .await;
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(%peer, error = %err, "TLS handshake failed");
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "TLS handshake timed out");
                    }
                }
            }
            None => {
                run_connection(stream, peer, scheme, &shared, &info, &mut buffers).await;
            }
        }

        info.mark_done();
        shared.registry.remove(info.id);
        buffers.reset();
        shared.buffer_pool.push(buffers);
    });
}

/// Configures and creates a [`Server`].
pub struct ServerBuilder<H, X = AlwaysContinue> {
    listeners: Vec<ListenerConfig>,
    handler: Option<H>,
    expect: Option<X>,
    config: Option<ServerConfig>,
}

impl<H: Handler, X: ExpectValidator> ServerBuilder<H, X> {
    /// Adds an accept endpoint. At least one is required.
    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the request handler. **Required.**
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replaces the default always-100 Expect validator.
    pub fn expect_validator<NewX: ExpectValidator>(self, expect: NewX) -> ServerBuilder<H, NewX> {
        ServerBuilder {
            listeners: self.listeners,
            handler: self.handler,
            expect: Some(expect),
            config: self.config,
        }
    }

    /// Overrides the default [`ServerConfig`].
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    ///
    /// Panics when no handler was set. Listener problems surface from
    /// [`Server::launch`] instead, which can report what failed.
    #[track_caller]
    pub fn build(self) -> Server<H, X> {
        let handler = self
            .handler
            .expect("The `handler` method must be called to create");
        let expect = self.expect.expect("expect validator present by construction");
        let config = self.config.unwrap_or_default();
        Server {
            listeners: self.listeners,
            shared: Arc::new(ServerShared::new(handler, expect, config)),
        }
    }
}
