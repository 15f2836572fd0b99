//! The common init → put_frame → close contract.
//!
//! Implemented by the synchronous [`crate::Encoder`] and the queued
//! [`crate::AsyncEncoder`], so drivers can run either one.

use crate::backend::Backend;
use crate::config::EncoderConfig;
use crate::encoder::Encoder;
use crate::error::{EncoderError, QueueError};
use crate::queue::AsyncEncoder;

pub trait Lifecycle {
    type Error: std::error::Error + Send + Sync + 'static;

    fn init(&mut self, config: EncoderConfig) -> Result<(), Self::Error>;

    /// Submit one packed BGR frame; `duration` is in stream ticks, 0 for
    /// one codec tick.
    fn put_frame(&mut self, frame: &[u8], duration: f64) -> Result<(), Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error>;

    fn enable_debug_log(&mut self);
}

impl<B: Backend> Lifecycle for Encoder<B> {
    type Error = EncoderError;

    fn init(&mut self, config: EncoderConfig) -> Result<(), EncoderError> {
        Encoder::init(self, config)
    }

    fn put_frame(&mut self, frame: &[u8], duration: f64) -> Result<(), EncoderError> {
        Encoder::put_frame(self, frame, duration).map(|_| ())
    }

    fn close(&mut self) -> Result<(), EncoderError> {
        Encoder::close(self)
    }

    fn enable_debug_log(&mut self) {
        Encoder::enable_debug_log(self)
    }
}

impl Lifecycle for AsyncEncoder {
    type Error = QueueError;

    fn init(&mut self, config: EncoderConfig) -> Result<(), QueueError> {
        AsyncEncoder::init(self, config)
    }

    fn put_frame(&mut self, frame: &[u8], duration: f64) -> Result<(), QueueError> {
        AsyncEncoder::put_frame(self, frame, duration)
    }

    fn close(&mut self) -> Result<(), QueueError> {
        AsyncEncoder::close(self)
    }

    fn enable_debug_log(&mut self) {
        if let Err(e) = AsyncEncoder::enable_debug_log(self) {
            tracing::warn!("debug log toggle not queued: {e}");
        }
    }
}
