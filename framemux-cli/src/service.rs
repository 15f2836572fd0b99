//! The frame loop behind the `framemux` binary.
//!
//! Pulls frames from the configured source, paces them, and feeds the
//! queued encoder until the source ends, the frame limit is reached, or
//! the stop handle is cleared. The loop is blocking; async callers run it
//! on a blocking thread.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use framemux_core::{
    AsyncEncoder, Backend, Encoder, FramePacer, PacingMode, QueueError, QueueEvent, SessionInfo,
    SessionStats,
};

use crate::config::AppConfig;
use crate::source;

/// How long to wait for the consumer to open the session.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("frame source: {0}")]
    Source(#[from] io::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What one run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session: SessionInfo,
    pub frames_read: u64,
    pub frames_queued: u64,
    pub frames_rejected: u64,
    pub stats: SessionStats,
    pub elapsed: Duration,
    /// The stop handle ended the run before the source did.
    pub interrupted: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        writeln!(
            f,
            "{} via {} ({})",
            self.session.codec, self.session.format, self.session.pixel_format.name()
        )?;
        writeln!(
            f,
            "frames: {} read, {} queued, {} rejected, {} encoded, {} dropped",
            self.frames_read,
            self.frames_queued,
            self.frames_rejected,
            self.stats.frames_submitted,
            self.stats.frames_dropped
        )?;
        writeln!(
            f,
            "packets: {} ({} bytes)",
            self.stats.packets_written, self.stats.bytes_written
        )?;
        write!(
            f,
            "elapsed: {secs:.2}s ({:.1} fps){}",
            if secs > 0.0 { self.frames_read as f64 / secs } else { 0.0 },
            if self.interrupted { ", interrupted" } else { "" }
        )
    }
}

// ── StreamService ────────────────────────────────────────────────

pub struct StreamService {
    config: AppConfig,
    running: Arc<AtomicBool>,
}

impl StreamService {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task or a signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Encode frames until the source or the frame limit runs out, or
    /// until stopped.
    pub fn run<B>(&self, backend: B) -> Result<RunSummary, ServiceError>
    where
        B: Backend + Send + 'static,
    {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_session(backend);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    // ── Internal ─────────────────────────────────────────────────

    fn run_session<B>(&self, backend: B) -> Result<RunSummary, ServiceError>
    where
        B: Backend + Send + 'static,
    {
        let encoder_config = self.config.encoder.clone();
        let mut source = source::open(
            &self.config.source,
            encoder_config.src_width,
            encoder_config.src_height,
        )?;

        let encoder = Encoder::new(backend);
        if self.config.logging.codec_debug {
            encoder.enable_debug_log();
        }
        let mut queue = AsyncEncoder::spawn(encoder, self.config.queue.clone())?;
        let session = queue.init_and_wait(encoder_config.clone(), INIT_TIMEOUT)?;
        info!(
            codec = %session.codec,
            format = %session.format,
            stream_time_base = %session.stream_time_base,
            "session open on {}",
            encoder_config.output
        );

        let mode = self.config.pacing.mode;
        let stream_tb = session.stream_time_base;
        let mut pacer = FramePacer::with_window(encoder_config.fps, mode, self.config.pacing.window);
        let limit = self.config.source.frames;

        let start = Instant::now();
        let mut prev = start;
        let (mut read, mut queued, mut rejected) = (0u64, 0u64, 0u64);

        while self.running.load(Ordering::SeqCst) {
            if limit > 0 && read >= limit {
                debug!(limit, "frame limit reached");
                break;
            }
            let Some(frame) = source.next_frame()? else {
                info!("source exhausted after {read} frames");
                break;
            };
            read += 1;

            // Live sources stamp each frame with the wall time since the previous one.
            let now = Instant::now();
            let duration = match mode {
                PacingMode::Live if read > 1 => {
                    stream_tb.ticks_from_secs((now - prev).as_secs_f64())
                }
                _ => 0.0,
            };
            prev = now;

            match queue.put_frame(frame, duration) {
                Ok(()) => queued += 1,
                Err(QueueError::Full { .. }) => rejected += 1,
                Err(e) => return Err(e.into()),
            }
            drain_events(&queue);
            pacer.frame_done();
        }

        let interrupted = !self.running.load(Ordering::SeqCst);
        if interrupted {
            info!("stop requested, closing session");
        }
        drain_events(&queue);
        let stats = queue.shutdown()?;

        Ok(RunSummary {
            session,
            frames_read: read,
            frames_queued: queued,
            frames_rejected: rejected,
            stats,
            elapsed: start.elapsed(),
            interrupted,
        })
    }
}

/// Log whatever the consumer reported since the last call.
fn drain_events(queue: &AsyncEncoder) {
    while let Ok(event) = queue.events().try_recv() {
        match event {
            QueueEvent::FrameFailed(e) => warn!("frame failed: {e}"),
            QueueEvent::InitFailed(e) | QueueEvent::CloseFailed(e) => error!("{e}"),
            QueueEvent::Initialized(_) | QueueEvent::Closed(_) => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use framemux_core::MemoryBackend;

    fn small_config(frames: u64) -> AppConfig {
        let mut config = AppConfig::default();
        config.encoder.src_width = 32;
        config.encoder.src_height = 16;
        config.encoder.dst_width = 16;
        config.encoder.dst_height = 8;
        config.encoder.output = "test.mkv".into();
        config.source.frames = frames;
        config.pacing.mode = PacingMode::Off;
        config
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = StreamService::new(AppConfig::default());
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = StreamService::new(AppConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn run_stops_at_frame_limit() {
        let backend = MemoryBackend::new();
        let sink = backend.sink();
        let svc = StreamService::new(small_config(12));
        let summary = svc.run(backend).unwrap();

        assert_eq!(summary.frames_read, 12);
        assert_eq!(summary.frames_queued, 12);
        assert_eq!(summary.stats.frames_submitted, 12);
        assert!(!summary.interrupted);
        assert!(!svc.is_running());

        let record = sink.last().unwrap();
        assert_eq!(record.format, "matroska");
        assert_eq!(record.packets.len(), 12);
        assert!(record.trailer_written);
        assert!(summary.to_string().contains("12 read"));
    }

    #[test]
    fn init_failure_is_reported() {
        let mut config = small_config(5);
        config.encoder.codec_name = "aac".into();
        let err = StreamService::new(config).run(MemoryBackend::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Queue(QueueError::Encoder(ref e)) if e.is_fatal()));
    }
}
