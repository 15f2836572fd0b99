//! Queued front end: a producer thread enqueues commands, one consumer
//! thread owns the [`Encoder`] and executes them in FIFO order.
//!
//! ```text
//!  producer                         consumer thread
//!  ────────                         ───────────────
//!  init(cfg)      ──► Init ──┐
//!  put_frame(buf) ──► Frame ─┼──► bounded FIFO ──► Encoder::init / put_frame / close
//!  close()        ──► Close ─┘                          │
//!         ◄────────── reply (close, init_and_wait) ─────┤
//!  events()       ◄────────── QueueEvent ───────────────┘
//! ```
//!
//! Frames are copied into the command when enqueued, so the caller may
//! reuse its buffer immediately. The queue is bounded: a full queue either
//! blocks the producer for up to `push_timeout` or rejects the frame at
//! once, depending on [`FullPolicy`]. Dropping the front end stops the
//! consumer after its current command; still-queued commands are
//! abandoned and an open session is finalized by the encoder's own drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError, bounded,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::backend::Backend;
use crate::config::EncoderConfig;
use crate::encoder::{Encoder, SessionInfo, SessionStats};
use crate::error::{EncoderError, QueueError};

/// Commands held in the FIFO by default.
pub const DEFAULT_CAPACITY: usize = 64;

/// How long an idle consumer sleeps between checks of the running flag.
pub const IDLE_POLL: Duration = Duration::from_millis(1);

/// Events buffered for the producer before new ones are discarded.
const EVENT_CAPACITY: usize = 256;

/// What `put_frame` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullPolicy {
    /// Wait up to `push_timeout_ms` for space.
    #[default]
    Block,
    /// Fail immediately with [`QueueError::Full`].
    Reject,
}

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub full_policy: FullPolicy,
    pub push_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            full_policy: FullPolicy::Block,
            push_timeout_ms: 5_000,
            close_timeout_ms: 30_000,
            idle_poll_ms: IDLE_POLL.as_millis() as u64,
        }
    }
}

impl QueueConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

type Reply<T> = Sender<Result<T, EncoderError>>;

/// A unit of work for the consumer thread.
pub enum Command {
    Init {
        config: EncoderConfig,
        reply: Option<Reply<SessionInfo>>,
    },
    Frame {
        data: Bytes,
        duration: f64,
    },
    Close {
        reply: Option<Reply<SessionStats>>,
    },
    DebugLog,
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Frame { .. } => "frame",
            Command::Close { .. } => "close",
            Command::DebugLog => "debug-log",
        }
    }
}

/// Outcomes reported by the consumer thread.
#[derive(Debug)]
pub enum QueueEvent {
    Initialized(SessionInfo),
    InitFailed(EncoderError),
    FrameFailed(EncoderError),
    Closed(SessionStats),
    CloseFailed(EncoderError),
}

/// Producer-side handle to a consumer thread owning an [`Encoder`].
pub struct AsyncEncoder {
    tx: Option<Sender<Command>>,
    events: Receiver<QueueEvent>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    config: QueueConfig,
    frame_len: Option<usize>,
}

impl AsyncEncoder {
    /// Start the consumer thread.
    pub fn spawn<B>(encoder: Encoder<B>, config: QueueConfig) -> Result<Self, QueueError>
    where
        B: Backend + Send + 'static,
    {
        let (tx, rx) = bounded(config.capacity.max(1));
        let (event_tx, events) = bounded(EVENT_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = running.clone();
            let idle = config.idle_poll();
            thread::Builder::new()
                .name("framemux-consumer".into())
                .spawn(move || consume(encoder, rx, event_tx, running, idle))?
        };
        debug!(capacity = config.capacity, "command queue started");

        Ok(Self {
            tx: Some(tx),
            events,
            running,
            worker: Some(worker),
            config,
            frame_len: None,
        })
    }

    /// Returns a clone of the running flag (for external shutdown).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Commands waiting in the FIFO.
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    pub fn events(&self) -> &Receiver<QueueEvent> {
        &self.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue session setup; the outcome arrives as a [`QueueEvent`].
    pub fn init(&mut self, config: EncoderConfig) -> Result<(), QueueError> {
        self.frame_len = Some(config.frame_len());
        self.push(Command::Init {
            config,
            reply: None,
        })
    }

    /// Queue session setup and wait for its outcome.
    pub fn init_and_wait(
        &mut self,
        config: EncoderConfig,
        timeout: Duration,
    ) -> Result<SessionInfo, QueueError> {
        let (reply, outcome) = bounded(1);
        self.frame_len = Some(config.frame_len());
        self.push(Command::Init {
            config,
            reply: Some(reply),
        })?;
        wait(&outcome, timeout)
    }

    /// Copy a frame into the queue.
    pub fn put_frame(&mut self, frame: &[u8], duration: f64) -> Result<(), QueueError> {
        if let Some(expected) = self.frame_len {
            if frame.len() != expected {
                return Err(QueueError::FrameSize {
                    expected,
                    actual: frame.len(),
                });
            }
        }
        self.push(Command::Frame {
            data: Bytes::copy_from_slice(frame),
            duration,
        })
    }

    /// Queue a close behind all pending frames and wait for it to finish.
    pub fn close(&mut self) -> Result<(), QueueError> {
        self.close_with_stats().map(|_| ())
    }

    pub fn close_with_stats(&mut self) -> Result<SessionStats, QueueError> {
        let (reply, outcome) = bounded(1);
        self.push(Command::Close { reply: Some(reply) })?;
        self.frame_len = None;
        wait(&outcome, self.config.close_timeout())
    }

    pub fn enable_debug_log(&mut self) -> Result<(), QueueError> {
        self.push(Command::DebugLog)
    }

    /// Close the session, then stop and join the consumer.
    ///
    /// If the close does not complete within the close timeout the
    /// consumer is detached instead of joined.
    pub fn shutdown(mut self) -> Result<SessionStats, QueueError> {
        let result = self.close_with_stats();
        if let Err(QueueError::Timeout(t)) = &result {
            warn!("consumer did not finish within {t:?}, detaching");
            self.worker.take();
        }
        self.stop();
        result
    }

    fn push(&self, command: Command) -> Result<(), QueueError> {
        let tx = self.tx.as_ref().ok_or(QueueError::Disconnected)?;
        let kind = command.kind();
        let capacity = self.config.capacity;
        let result = match self.config.full_policy {
            FullPolicy::Block => tx.send_timeout(command, self.config.push_timeout()).map_err(
                |e| match e {
                    SendTimeoutError::Timeout(_) => QueueError::Full { capacity },
                    SendTimeoutError::Disconnected(_) => QueueError::Disconnected,
                },
            ),
            FullPolicy::Reject => tx.try_send(command).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full { capacity },
                TrySendError::Disconnected(_) => QueueError::Disconnected,
            }),
        };
        match &result {
            Ok(()) => trace!(kind, pending = tx.len(), "command queued"),
            Err(e) => warn!(kind, "command not queued: {e}"),
        }
        result
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("consumer thread panicked");
            }
        }
    }
}

impl Drop for AsyncEncoder {
    fn drop(&mut self) {
        let abandoned = self.pending();
        if abandoned > 0 {
            warn!(abandoned, "dropping queued commands");
        }
        self.stop();
    }
}

fn wait<T>(
    outcome: &Receiver<Result<T, EncoderError>>,
    timeout: Duration,
) -> Result<T, QueueError> {
    match outcome.recv_timeout(timeout) {
        Ok(result) => result.map_err(QueueError::Encoder),
        Err(RecvTimeoutError::Timeout) => Err(QueueError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
    }
}

// ── Consumer ─────────────────────────────────────────────────────

fn consume<B: Backend>(
    mut encoder: Encoder<B>,
    rx: Receiver<Command>,
    events: Sender<QueueEvent>,
    running: Arc<AtomicBool>,
    idle: Duration,
) {
    debug!("consumer started");
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(idle) {
            Ok(command) => execute(&mut encoder, command, &events),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(state = ?encoder.state(), "consumer stopped");
}

fn execute<B: Backend>(encoder: &mut Encoder<B>, command: Command, events: &Sender<QueueEvent>) {
    match command {
        Command::Init { config, reply } => {
            let outcome = encoder.init(config).and_then(|()| {
                encoder
                    .session_info()
                    .cloned()
                    .ok_or(EncoderError::SessionEnded)
            });
            let event = match &outcome {
                Ok(info) => QueueEvent::Initialized(info.clone()),
                Err(e) => QueueEvent::InitFailed(clone_error(e)),
            };
            notify(events, event);
            respond(reply, outcome);
        }
        Command::Frame { data, duration } => {
            if let Err(e) = encoder.put_frame(&data, duration) {
                notify(events, QueueEvent::FrameFailed(e));
            }
        }
        Command::Close { reply } => {
            let outcome = encoder.close().map(|()| encoder.stats());
            let event = match &outcome {
                Ok(stats) => QueueEvent::Closed(*stats),
                Err(e) => QueueEvent::CloseFailed(clone_error(e)),
            };
            notify(events, event);
            respond(reply, outcome);
        }
        Command::DebugLog => encoder.enable_debug_log(),
    }
}

fn notify(events: &Sender<QueueEvent>, event: QueueEvent) {
    if let Err(e) = events.try_send(event) {
        trace!("queue event discarded: {:?}", e.into_inner());
    }
}

fn respond<T>(reply: Option<Reply<T>>, outcome: Result<T, EncoderError>) {
    if let Some(reply) = reply {
        // the producer may have given up waiting
        let _ = reply.send(outcome);
    }
}

/// Errors are not `Clone`; events carry a copy with the same variant
/// where it has no payload, and the rendered message otherwise.
fn clone_error(e: &EncoderError) -> EncoderError {
    match e {
        EncoderError::AlreadyInitialized => EncoderError::AlreadyInitialized,
        EncoderError::SessionEnded => EncoderError::SessionEnded,
        EncoderError::CodecNotFound(name) => EncoderError::CodecNotFound(name.clone()),
        EncoderError::NotVideoCodec { name, kind } => EncoderError::NotVideoCodec {
            name: name.clone(),
            kind,
        },
        EncoderError::InvalidConfig(m) => EncoderError::InvalidConfig(m.clone()),
        EncoderError::FrameSize { expected, actual } => EncoderError::FrameSize {
            expected: *expected,
            actual: *actual,
        },
        EncoderError::InvalidDuration(d) => EncoderError::InvalidDuration(*d),
        EncoderError::PtsOverflow(last) => EncoderError::PtsOverflow(*last),
        EncoderError::Hardware(m) => EncoderError::Hardware(m.clone()),
        EncoderError::Header(m) => EncoderError::Header(m.clone()),
        other => EncoderError::Codec(other.to_string()),
    }
}
