//! Connection liveness: per-worker counters, the shared registry, and the
//! monitor task that evicts slow or stalled peers.
//!
//! Socket deadlines alone cannot catch a peer that trickles one byte per
//! timeout interval. The monitor samples read/write throughput over a
//! warm-up window and evicts connections that stay below the configured
//! floors, plus handlers that outlive the processing deadline.

use crate::{config::ServerConfig, errors::HttpError};
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::Notify,
};

/// How often the monitor scans the registry.
pub(crate) const MONITOR_TICK: Duration = Duration::from_secs(2);

/// Throughput value meaning "window not elapsed yet, treat as passing".
const THROUGHPUT_UNDEFINED: i64 = -1;

pub(crate) const REASON_NONE: u8 = 0;
pub(crate) const REASON_SLOW_PEER: u8 = 1;
pub(crate) const REASON_SHUTDOWN: u8 = 2;

/// What a connection worker is doing right now, as seen by the monitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Read = 0,
    Process = 1,
    Write = 2,
    KeepAlive = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Read,
            1 => WorkerState::Process,
            2 => WorkerState::Write,
            _ => WorkerState::KeepAlive,
        }
    }
}

/// Shared view of one live connection.
///
/// The worker writes, the monitor reads; every field is an atomic, so values
/// may be slightly stale but never torn. The monitor influences the worker
/// only through [`interrupt`](ConnectionInfo::interrupt) — the worker's
/// blocked I/O observes the signal and unwinds with the carried reason.
pub(crate) struct ConnectionInfo {
    pub(crate) id: u64,
    epoch: Instant,
    state: AtomicU8,
    last_used: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_window_start: AtomicU64,
    write_window_start: AtomicU64,
    interrupt_reason: AtomicU8,
    interrupt: Notify,
    done: AtomicBool,
}

impl ConnectionInfo {
    fn new(id: u64, epoch: Instant) -> Self {
        let now = epoch.elapsed().as_millis() as u64;
        Self {
            id,
            epoch,
            state: AtomicU8::new(WorkerState::Read as u8),
            last_used: AtomicU64::new(now),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_window_start: AtomicU64::new(now),
            write_window_start: AtomicU64::new(now),
            interrupt_reason: AtomicU8::new(REASON_NONE),
            interrupt: Notify::new(),
            done: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
        self.touch();
    }

    #[inline]
    pub(crate) fn touch(&self) {
        self.last_used.store(self.now_ms(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn last_used_ms(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    /// Starts a fresh read measurement window.
    pub(crate) fn begin_read(&self) {
        self.bytes_read.store(0, Ordering::Release);
        self.read_window_start.store(self.now_ms(), Ordering::Release);
    }

    /// Starts a fresh write measurement window.
    pub(crate) fn begin_write(&self) {
        self.bytes_written.store(0, Ordering::Release);
        self.write_window_start.store(self.now_ms(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::AcqRel);
        self.touch();
    }

    #[inline]
    pub(crate) fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
        self.touch();
    }

    /// Read throughput in bytes/second, or `-1` while the warm-up window
    /// has not elapsed.
    pub(crate) fn read_throughput(&self, delay: Duration) -> i64 {
        throughput(
            self.bytes_read.load(Ordering::Acquire),
            self.read_window_start.load(Ordering::Acquire),
            self.now_ms(),
            delay,
        )
    }

    /// Write throughput in bytes/second, or `-1` while the warm-up window
    /// has not elapsed.
    pub(crate) fn write_throughput(&self, delay: Duration) -> i64 {
        throughput(
            self.bytes_written.load(Ordering::Acquire),
            self.write_window_start.load(Ordering::Acquire),
            self.now_ms(),
            delay,
        )
    }

    /// Flags this worker for termination. The first reason wins; the stored
    /// wake-up permit makes the signal stick even if the worker is between
    /// I/O calls.
    pub(crate) fn interrupt(&self, reason: u8) {
        let _ = self.interrupt_reason.compare_exchange(
            REASON_NONE,
            reason,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.interrupt.notify_one();
    }

    /// The pending interruption, if any, as the error the worker unwinds
    /// with.
    pub(crate) fn pending_interrupt(&self) -> Option<HttpError> {
        match self.interrupt_reason.load(Ordering::Acquire) {
            REASON_SLOW_PEER => Some(HttpError::SlowPeer),
            REASON_SHUTDOWN => Some(HttpError::Shutdown),
            _ => None,
        }
    }

    /// Resolves when this worker has been interrupted. Raced against every
    /// blocking I/O call in the worker.
    pub(crate) async fn interrupted(&self) -> HttpError {
        loop {
            if let Some(err) = self.pending_interrupt() {
                return err;
            }
            self.interrupt.notified().await;
        }
    }

    #[inline]
    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

fn throughput(bytes: u64, window_start: u64, now: u64, delay: Duration) -> i64 {
    let elapsed = now.saturating_sub(window_start);
    if elapsed < delay.as_millis() as u64 || elapsed == 0 {
        return THROUGHPUT_UNDEFINED;
    }
    (bytes.saturating_mul(1000) / elapsed) as i64
}

// REGISTRY

/// The live-workers registry: inserted into by the accept loop, iterated
/// and pruned by the monitor, and cleaned by each worker at its own exit.
#[derive(Default)]
pub(crate) struct Registry {
    map: Mutex<HashMap<u64, Arc<ConnectionInfo>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn register(&self, epoch: Instant) -> Arc<ConnectionInfo> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let info = Arc::new(ConnectionInfo::new(id, epoch));
        self.map
            .lock()
            .expect("registry lock poisoned")
            .insert(id, info.clone());
        info
    }

    pub(crate) fn remove(&self, id: u64) {
        self.map.lock().expect("registry lock poisoned").remove(&id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ConnectionInfo>> {
        self.map
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().expect("registry lock poisoned").len()
    }

    pub(crate) fn interrupt_all(&self, reason: u8) {
        for info in self.snapshot() {
            info.interrupt(reason);
        }
    }
}

// SHUTDOWN

/// One-way process-wide shutdown flag with wake-up.
#[derive(Default)]
pub(crate) struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[inline]
    pub(crate) fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

// COUNTING ADAPTERS

/// Read half wrapper feeding the connection's throughput counters.
pub(crate) struct CountingReader<R> {
    inner: R,
    info: Arc<ConnectionInfo>,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R, info: Arc<ConnectionInfo>) -> Self {
        Self { inner, info }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    me.info.add_read(n as u64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Write half wrapper feeding the connection's throughput counters.
pub(crate) struct CountingWriter<W> {
    inner: W,
    info: Arc<ConnectionInfo>,
}

impl<W> CountingWriter<W> {
    pub(crate) fn new(inner: W, info: Arc<ConnectionInfo>) -> Self {
        Self { inner, info }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    me.info.add_written(n as u64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// MONITOR TASK

/// Scans the registry every [`MONITOR_TICK`] until shutdown.
pub(crate) async fn run_monitor(
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    shutdown: Arc<ShutdownSignal>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(MONITOR_TICK) => {}
        }

        for info in registry.snapshot() {
            if info.is_done() {
                registry.remove(info.id);
                continue;
            }
            if check_worker(&info, &config) {
                tracing::info!(
                    connection = info.id,
                    state = ?info.state(),
                    "evicting unresponsive connection"
                );
                info.interrupt(REASON_SLOW_PEER);
                registry.remove(info.id);
            }
        }
    }
}

/// Whether this worker has fallen below its liveness requirements.
fn check_worker(info: &ConnectionInfo, config: &ServerConfig) -> bool {
    match info.state() {
        WorkerState::Read => match config.min_read_throughput {
            Some(min) => {
                let tp = info.read_throughput(config.read_throughput_calculation_delay);
                tp >= 0 && (tp as u64) < min
            }
            None => false,
        },
        WorkerState::Write => match config.min_write_throughput {
            Some(min) => {
                let tp = info.write_throughput(config.write_throughput_calculation_delay);
                tp >= 0 && (tp as u64) < min
            }
            None => false,
        },
        WorkerState::Process => {
            let idle = info.now_ms().saturating_sub(info.last_used_ms());
            idle > config.processing_timeout.as_millis() as u64
        }
        // The keep-alive socket deadline governs; nothing for the monitor.
        WorkerState::KeepAlive => false,
    }
}
