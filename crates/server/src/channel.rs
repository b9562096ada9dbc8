//! Connection Channel - newline-framed duplex messaging over a transport
//!
//! Reads keep whatever partial frame they have buffered when they time
//! out, so a slow client never loses bytes. Writes go out whole or not at
//! all from the channel's point of view: one frame per lock, bounded by the
//! write timeout.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use browser::util::duration_ms;
use resilience::{CancellationToken, RetryPolicy};

use crate::protocol::{methods, Notification};
use crate::transport::{BoxedReader, BoxedWriter, Transport};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("read timeout after {0:?}")]
    ReadTimeout(Duration),

    #[error("write timeout after {0:?}")]
    WriteTimeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("frame too large: {size} bytes exceeds the {limit} byte buffer")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("frame contains a line break")]
    EmbeddedNewline,

    #[error("inbound frame of {size} bytes is not valid UTF-8")]
    InvalidUtf8 { size: usize },

    #[error("transport {0} cannot reconnect")]
    NotReconnectable(String),

    #[error("reconnect failed after {attempts} attempts: {last}")]
    ReconnectFailed { attempts: u32, last: String },

    #[error("reconnect cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChannelError {
    /// The connection is gone; reading or writing again won't help
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChannelError::Closed | ChannelError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Heartbeats are only sent after this long without traffic
    #[serde(with = "duration_ms")]
    pub idle_threshold: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            input_buffer_size: 1024 * 1024,
            output_buffer_size: 1024 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(300),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub transport: String,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reconnects: u64,
    pub timeouts: u64,
    pub oversized_frames: u64,
    pub invalid_frames: u64,
    pub idle_ms: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    reconnects: AtomicU64,
    timeouts: AtomicU64,
    oversized: AtomicU64,
    invalid: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

enum Rejected {
    TooLarge(usize),
    InvalidUtf8(usize),
}

/// Read side: the stream plus bytes not yet handed out as frames
struct FrameReader {
    stream: BoxedReader,
    pending: Vec<u8>,
    /// Dropping the rest of an oversized frame
    discarding: bool,
}

impl FrameReader {
    fn new(stream: BoxedReader) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Next complete line, or why it can't be handed out
    fn take_frame(&mut self, limit: usize) -> Option<std::result::Result<String, Rejected>> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        let body = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(&line[..]);
        if body.len() > limit {
            return Some(Err(Rejected::TooLarge(body.len())));
        }
        match std::str::from_utf8(body) {
            Ok(text) => Some(Ok(text.to_string())),
            Err(_) => Some(Err(Rejected::InvalidUtf8(body.len()))),
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.discarding {
            match self.pending.iter().position(|&b| b == b'\n') {
                Some(newline) => {
                    self.pending.drain(..=newline);
                    self.discarding = false;
                }
                None => self.pending.clear(),
            }
        }
    }
}

pub struct ConnectionChannel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    reader: Mutex<FrameReader>,
    writer: Mutex<BoxedWriter>,
    counters: Counters,
    last_activity: std::sync::Mutex<Instant>,
}

impl ConnectionChannel {
    pub async fn connect(transport: Arc<dyn Transport>, config: ChannelConfig) -> Result<Self> {
        let (reader, writer) = transport.connect().await?;
        info!(transport = transport.name(), "connection channel open");
        Ok(Self {
            transport,
            config,
            reader: Mutex::new(FrameReader::new(reader)),
            writer: Mutex::new(writer),
            counters: Counters::default(),
            last_activity: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn reconnectable(&self) -> bool {
        self.transport.reconnectable()
    }

    /// Wait up to the read timeout for one full frame, without its newline.
    /// Blank lines are skipped.
    pub async fn read_message(&self) -> Result<String> {
        let deadline = Instant::now() + self.config.read_timeout;
        let limit = self.config.input_buffer_size;
        let mut reader = self.reader.lock().await;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match reader.take_frame(limit) {
                Some(Ok(frame)) if frame.trim().is_empty() => continue,
                Some(Ok(frame)) => {
                    bump(&self.counters.frames_in, 1);
                    self.touch();
                    return Ok(frame);
                }
                Some(Err(Rejected::TooLarge(size))) => return Err(self.oversized_input(size)),
                Some(Err(Rejected::InvalidUtf8(size))) => {
                    bump(&self.counters.invalid, 1);
                    warn!(size, "dropping inbound frame that is not valid UTF-8");
                    return Err(ChannelError::InvalidUtf8 { size });
                }
                None => {}
            }

            if reader.pending.len() > limit {
                let size = reader.pending.len();
                reader.pending.clear();
                reader.discarding = true;
                return Err(self.oversized_input(size));
            }

            let read = match tokio::time::timeout_at(deadline, reader.stream.read(&mut chunk)).await {
                Err(_) => {
                    bump(&self.counters.timeouts, 1);
                    return Err(ChannelError::ReadTimeout(self.config.read_timeout));
                }
                Ok(result) => result?,
            };
            if read == 0 {
                return Err(ChannelError::Closed);
            }
            bump(&self.counters.bytes_in, read as u64);
            reader.append(&chunk[..read]);
        }
    }

    fn oversized_input(&self, size: usize) -> ChannelError {
        bump(&self.counters.oversized, 1);
        let limit = self.config.input_buffer_size;
        warn!(size, limit, "dropping oversized inbound frame");
        ChannelError::FrameTooLarge { size, limit }
    }

    /// Write one frame plus its newline. Nothing is written when the frame
    /// is over the output buffer size.
    pub async fn write_message(&self, frame: &str) -> Result<()> {
        if frame.contains('\n') {
            return Err(ChannelError::EmbeddedNewline);
        }
        let size = frame.len() + 1;
        let limit = self.config.output_buffer_size;
        if size > limit {
            bump(&self.counters.oversized, 1);
            warn!(size, limit, "refusing oversized outbound frame");
            return Err(ChannelError::FrameTooLarge { size, limit });
        }

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(frame.as_bytes());
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = tokio::time::timeout(self.config.write_timeout, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await;

        match written {
            Err(_) => {
                bump(&self.counters.timeouts, 1);
                Err(ChannelError::WriteTimeout(self.config.write_timeout))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => {
                bump(&self.counters.frames_out, 1);
                bump(&self.counters.bytes_out, size as u64);
                self.touch();
                Ok(())
            }
        }
    }

    /// Serialize `message` as one compact JSON frame
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        self.write_message(&frame).await
    }

    /// Dial the transport again with doubling delays. Transports that
    /// can't reconnect (stdio) fail straight away.
    pub async fn reconnect(&self, token: &CancellationToken) -> Result<()> {
        if !self.transport.reconnectable() {
            return Err(ChannelError::NotReconnectable(self.transport.name().to_string()));
        }

        let attempts = self.config.max_reconnect_attempts.max(1);
        let policy = RetryPolicy::new(
            "reconnect",
            attempts,
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
            2.0,
        )
        .without_jitter();

        let mut last = String::new();
        for attempt in 0..attempts {
            let delay = policy.backoff(attempt);
            info!(
                transport = self.transport.name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Err(ChannelError::Cancelled),
            }

            match self.transport.connect().await {
                Ok((reader, writer)) => {
                    *self.reader.lock().await = FrameReader::new(reader);
                    *self.writer.lock().await = writer;
                    bump(&self.counters.reconnects, 1);
                    self.touch();
                    info!(transport = self.transport.name(), "reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(transport = self.transport.name(), attempt = attempt + 1, error = %e, "reconnect attempt failed");
                    last = e.to_string();
                }
            }
        }
        Err(ChannelError::ReconnectFailed { attempts, last })
    }

    /// Send `notifications/ping` whenever the connection has been idle for
    /// the idle threshold, checking every heartbeat interval.
    pub fn spawn_heartbeat(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let period = channel.config.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if channel.idle() < channel.config.idle_threshold {
                    continue;
                }
                match channel.send(&Notification::new(methods::HEARTBEAT, None)).await {
                    Ok(()) => debug!("heartbeat sent"),
                    Err(e) => debug!(error = %e, "heartbeat failed"),
                }
            }
        })
    }

    /// Time since the last frame in either direction
    pub fn idle(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn stats(&self) -> ChannelStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ChannelStats {
            transport: self.transport.name().to_string(),
            frames_in: load(&self.counters.frames_in),
            frames_out: load(&self.counters.frames_out),
            bytes_in: load(&self.counters.bytes_in),
            bytes_out: load(&self.counters.bytes_out),
            reconnects: load(&self.counters.reconnects),
            timeouts: load(&self.counters.timeouts),
            oversized_frames: load(&self.counters.oversized),
            invalid_frames: load(&self.counters.invalid),
            idle_ms: self.idle().as_millis() as u64,
        }
    }
}
