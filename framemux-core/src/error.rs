//! Error types for the encode/mux pipeline and its command queue.
//!
//! `EncoderError` covers everything the synchronous pipeline can report.
//! `QueueError` wraps it for the producer side of the async front end.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while opening, feeding or finalizing an encode session.
#[derive(Debug, Error)]
pub enum EncoderError {
    // ── Configuration ────────────────────────────────────────────
    /// The supplied configuration cannot describe a valid session.
    #[error("invalid encoder config: {0}")]
    InvalidConfig(String),

    /// Neither an encoder nor a codec descriptor matches the name.
    #[error("unknown encoder '{0}'")]
    CodecNotFound(String),

    /// The named codec exists but does not encode video.
    #[error("invalid encoder type '{name}': expected video, got {kind}")]
    NotVideoCodec { name: String, kind: &'static str },

    // ── Lifecycle ────────────────────────────────────────────────
    /// `init` was called on a session that is already open.
    #[error("encoder already initialized")]
    AlreadyInitialized,

    /// The session was closed or failed; a new encoder is required.
    #[error("encoder session has ended")]
    SessionEnded,

    // ── Session setup ────────────────────────────────────────────
    /// The output container or its I/O could not be opened.
    #[error("could not open output '{output}': {reason}")]
    SinkOpen { output: String, reason: String },

    /// The output path names no known container format.
    #[error("could not deduce output format for '{0}'")]
    UnsupportedContainer(String),

    /// The codec rejected its parameters or options.
    #[error("could not open codec '{codec}': {reason}")]
    CodecOpen { codec: String, reason: String },

    /// The container header could not be written.
    #[error("could not write container header: {0}")]
    Header(String),

    // ── Per-frame ────────────────────────────────────────────────
    /// A raw frame did not have `src_width * src_height * 3` bytes.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// A frame duration that cannot be expressed in stream ticks.
    #[error("invalid frame duration {0}")]
    InvalidDuration(f64),

    /// The next PTS would not fit in 64 bits.
    #[error("presentation timestamp overflow after {0}")]
    PtsOverflow(i64),

    /// Pixel conversion or scaling failed.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// A hardware device, surface pool or upload failed.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The codec refused a frame or failed to produce packets.
    #[error("codec error: {0}")]
    Codec(String),

    /// A packet or the trailer could not be written to the container.
    #[error("mux error: {0}")]
    Mux(String),
}

impl EncoderError {
    /// Whether the error means the configuration can never succeed.
    ///
    /// Fatal errors abort `init` the same way as any other setup failure,
    /// but callers should not retry them with the same config.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EncoderError::CodecNotFound(_)
                | EncoderError::NotVideoCodec { .. }
                | EncoderError::InvalidConfig(_)
        )
    }

    /// Whether the error was raised by the hardware upload path.
    pub fn is_hardware(&self) -> bool {
        matches!(self, EncoderError::Hardware(_))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for EncoderError {
    fn from(e: ffmpeg_next::Error) -> Self {
        EncoderError::Codec(e.to_string())
    }
}

// ── QueueError ────────────────────────────────────────────────────

/// Errors seen by the producer side of [`crate::AsyncEncoder`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The bounded command queue stayed full.
    #[error("command queue full (capacity {capacity})")]
    Full { capacity: usize },

    /// The consumer thread is gone.
    #[error("command queue consumer has stopped")]
    Disconnected,

    /// A reply from the consumer did not arrive in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A frame was rejected before it was queued.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// The consumer reported a pipeline failure.
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// The consumer thread could not be started.
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl<T> From<crossbeam_channel::SendError<T>> for QueueError {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        QueueError::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = EncoderError::FrameSize {
            expected: 6220800,
            actual: 100,
        };
        assert!(e.to_string().contains("6220800"));
        assert!(e.to_string().contains("100"));

        let e = EncoderError::NotVideoCodec {
            name: "aac".into(),
            kind: "audio",
        };
        assert!(e.to_string().contains("aac"));
        assert!(e.to_string().contains("audio"));
    }

    #[test]
    fn fatal_classification() {
        assert!(EncoderError::CodecNotFound("nope".into()).is_fatal());
        assert!(!EncoderError::Header("io".into()).is_fatal());
        assert!(EncoderError::Hardware("upload".into()).is_hardware());
        assert!(!EncoderError::Codec("eagain".into()).is_hardware());
    }

    #[test]
    fn queue_error_wraps_encoder_error() {
        let e: QueueError = EncoderError::AlreadyInitialized.into();
        assert!(matches!(
            e,
            QueueError::Encoder(EncoderError::AlreadyInitialized)
        ));
    }

    #[test]
    fn from_send_error() {
        let (tx, rx) = crossbeam_channel::bounded::<u8>(1);
        drop(rx);
        let e: QueueError = tx.send(1).unwrap_err().into();
        assert!(matches!(e, QueueError::Disconnected));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "no threads");
        let e: QueueError = io_err.into();
        assert!(matches!(e, QueueError::Spawn(_)));
    }
}
