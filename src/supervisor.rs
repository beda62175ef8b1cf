//! TCP connection lifecycle for the SBS feed.
//!
//! The supervisor owns the socket: it connects, accumulates reads into
//! complete lines, detects idle or dropped connections and reconnects with
//! backoff until shutdown is signalled.

use crate::backoff::{Backoff, RetryPolicy};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reading,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reading => "reading",
        };
        f.write_str(s)
    }
}

/// Receives every complete line read from the feed.
#[async_trait]
pub trait LineHandler: Send {
    async fn handle_line(&mut self, line: String);
}

/// Longest partial line kept while waiting for its newline. SBS lines are
/// around 100 bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accumulates raw reads and yields only `\n`-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
    /// Dropping bytes until the next newline
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit: limit.max(1),
            discarding: false,
        }
    }

    /// Append `bytes` and drain every complete line. Partial tails stay
    /// buffered up to the limit; a longer fragment is dropped together with
    /// the rest of its line. Invalid UTF-8 is replaced.
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<String> {
        if self.discarding {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.discarding = false;
                    bytes = &bytes[end + 1..];
                }
                None => return Vec::new(),
            }
        }
        self.pending.extend_from_slice(bytes);

        let lines = match self.pending.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => {
                let rest = self.pending.split_off(last_newline + 1);
                let complete = std::mem::replace(&mut self.pending, rest);
                split_lines(&complete)
            }
            None => Vec::new(),
        };

        if self.pending.len() > self.limit {
            tracing::debug!(
                "Dropping {} bytes of feed data without a line break",
                self.pending.len()
            );
            self.pending.clear();
            self.discarding = true;
        }
        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}

fn split_lines(complete: &[u8]) -> Vec<String> {
    complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    /// Reconnect when nothing arrives for this long
    pub idle_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub read_buffer_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 30003,
            idle_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(300))
                .with_jitter(0.1),
            read_buffer_size: 4096,
        }
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Eof,
    Idle,
    Error(std::io::Error),
}

pub struct Supervisor {
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, shutdown: watch::Receiver<bool>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shutdown,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown, feeding every line to `handler`.
    pub async fn run<H: LineHandler>(&mut self, handler: &mut H) {
        let mut backoff = Backoff::new(self.config.reconnect);
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let mut first_attempt = true;

        while !self.shutdown_requested() {
            if !first_attempt {
                let delay = backoff.next_delay();
                tracing::info!("Reconnecting to {} in {:?}", addr, delay);
                if self.sleep_or_shutdown(delay).await {
                    break;
                }
            }
            first_attempt = false;

            self.set_state(ConnectionState::Connecting);
            let stream = match timeout(self.config.idle_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!("Connection to {} failed: {}", addr, e);
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("Connection to {} timed out", addr);
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
            };

            backoff.reset();
            self.set_state(ConnectionState::Connected);
            tracing::info!("Connected to {}", addr);

            let end = self.read_session(stream, handler).await;
            self.set_state(ConnectionState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Eof => tracing::warn!("Feed at {} closed the connection", addr),
                SessionEnd::Idle => tracing::warn!(
                    "No data from {} for {:?}, reconnecting",
                    addr,
                    self.config.idle_timeout
                ),
                SessionEnd::Error(e) => tracing::warn!("Read from {} failed: {}", addr, e),
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Supervisor stopped");
    }

    async fn read_session<H: LineHandler>(&self, mut stream: TcpStream, handler: &mut H) -> SessionEnd {
        let mut lines = LineBuffer::new();
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let idle = self.config.idle_timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return SessionEnd::Shutdown;
            }
            self.set_state(ConnectionState::Reading);

            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Shutdown;
                    }
                    continue;
                }
                r = timeout(idle, stream.read(&mut buf)) => r,
            };

            let n = match read {
                Err(_) => return SessionEnd::Idle,
                Ok(Err(e)) => return SessionEnd::Error(e),
                Ok(Ok(0)) => return SessionEnd::Eof,
                Ok(Ok(n)) => n,
            };

            for line in lines.push(&buf[..n]) {
                handler.handle_line(line).await;
            }
        }
    }

    /// Sleep for `delay`; true when shutdown arrived first.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = sleep(delay) => self.shutdown_requested(),
            _ = shutdown.wait_for(|stop| *stop) => true,
        }
    }
}
