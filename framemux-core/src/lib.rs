//! # framemux-core
//!
//! Encode raw BGR frames and mux them into a file or a network stream.
//!
//! This crate contains:
//! - **Encoder**: `Encoder`, the synchronous init → put_frame → close pipeline
//! - **Queue**: `AsyncEncoder`, a bounded command queue with one consumer thread
//! - **Timebase**: exact rational frame rates, best-fit rate selection, PTS policy
//! - **Pacer**: `FramePacer`, throttling faster-than-real-time sources
//! - **Backends**: an in-process `MemoryBackend` and, with the `ffmpeg`
//!   feature, `FfmpegBackend` over libavcodec/libavformat/libswscale
//! - **Hardware**: VAAPI detection, surface pools, a process-wide device
//! - **Error**: `EncoderError` and `QueueError`, `thiserror`-based

pub mod backend;
pub mod config;
pub mod convert;
pub mod encoder;
pub mod error;
pub mod hw;
pub mod lifecycle;
pub mod pacer;
pub mod queue;
pub mod timebase;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use backend::memory::{MemoryBackend, MemorySink};
pub use backend::{Backend, CodecDescriptor, ContainerFlags, MediaKind, Session};
pub use config::{CodecOptions, EncoderConfig, OutputMode};
pub use convert::{ConversionSpec, PixelFormat, SoftwareConverter};
pub use encoder::{Encoder, EncoderState, SessionInfo, SessionStats};
pub use error::{EncoderError, QueueError};
pub use hw::HwAccel;
pub use lifecycle::Lifecycle;
pub use pacer::{FramePacer, FrameTiming, MovingWindow, PacingMode};
pub use queue::{AsyncEncoder, FullPolicy, QueueConfig, QueueEvent};
pub use timebase::{PtsCounter, Rational};

#[cfg(feature = "ffmpeg")]
pub use backend::ffmpeg::FfmpegBackend;
