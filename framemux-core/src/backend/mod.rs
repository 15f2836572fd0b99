//! Codec/container backends.
//!
//! The [`crate::Encoder`] pipeline drives a backend through two traits:
//!
//! | Trait      | Scope             | Responsibilities                                  |
//! |------------|-------------------|---------------------------------------------------|
//! | `Backend`  | process           | codec lookup, debug logging, opening sessions     |
//! | `Session`  | one output        | conversion, upload, send/receive, mux, trailer    |
//!
//! Two backends ship with the crate:
//! - [`memory::MemoryBackend`]: deterministic in-process codec and muxer,
//!   used by tests and dry runs.
//! - `ffmpeg::FfmpegBackend` (feature `ffmpeg`): libavcodec, libavformat
//!   and libswscale through `ffmpeg-next`.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod memory;

use bitflags::bitflags;

use crate::config::EncoderConfig;
use crate::convert::{ConversionSpec, PixelFormat};
use crate::error::EncoderError;
use crate::hw::{HwAccel, SurfacePoolSpec};
use crate::timebase::Rational;

/// Media type of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Subtitle => "subtitle",
            MediaKind::Other => "other",
        }
    }
}

/// What a backend knows about a codec before opening it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecDescriptor {
    /// Encoder name as registered with the backend.
    pub name: String,
    pub media: MediaKind,
    /// Frame rates the codec accepts, `None` when any rate works.
    pub supported_rates: Option<Vec<Rational>>,
    pub hardware: Option<HwAccel>,
}

bitflags! {
    /// Container properties relevant to session setup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContainerFlags: u32 {
        /// The format does its own I/O; no file is opened.
        const NO_FILE       = 1 << 0;
        /// Codec extradata goes into the container header.
        const GLOBAL_HEADER = 1 << 1;
    }
}

/// Everything the pipeline resolved before asking a backend for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    pub config: &'a EncoderConfig,
    pub codec: &'a CodecDescriptor,
    /// Codec time base, already fitted to the codec's supported rates.
    pub time_base: Rational,
    /// Pixel format the codec is opened with.
    pub pixel_format: PixelFormat,
    /// Present for hardware sessions.
    pub surface_pool: Option<SurfacePoolSpec>,
}

impl SessionRequest<'_> {
    /// Software layout frames are converted into.
    pub fn frame_format(&self) -> PixelFormat {
        self.surface_pool
            .map(|pool| pool.sw_format)
            .unwrap_or(self.pixel_format)
    }
}

/// Result of asking the codec for output.
#[derive(Debug)]
pub enum Received<P> {
    Packet(P),
    /// The codec needs more input before it can emit a packet.
    Again,
    /// The codec is fully drained after end-of-stream.
    Finished,
}

/// A compressed packet on its way to the muxer.
pub trait EncodedPacket {
    fn pts(&self) -> Option<i64>;
    fn dts(&self) -> Option<i64>;
    fn size(&self) -> usize;
    fn is_key(&self) -> bool;
    fn rescale_ts(&mut self, from: Rational, to: Rational);
}

/// One open encode session: a codec bound to a container stream.
pub trait Session: Send {
    type Packet: EncodedPacket;

    /// Short container name, e.g. `flv` or `mp4`.
    fn format_name(&self) -> &str;
    fn container_flags(&self) -> ContainerFlags;
    fn codec_time_base(&self) -> Rational;
    /// Stream time base as settled by the container header.
    fn stream_time_base(&self) -> Rational;

    /// Build the scaling/conversion context for this session.
    fn build_converter(&mut self, spec: ConversionSpec) -> Result<(), EncoderError>;
    /// Convert a raw BGR frame into the session's working frame.
    fn convert(&mut self, raw: &[u8]) -> Result<(), EncoderError>;
    /// Copy the working frame into a device surface (hardware sessions).
    fn upload(&mut self) -> Result<(), EncoderError>;
    /// Submit the working frame, or the uploaded surface, with `pts`.
    fn send_frame(&mut self, pts: i64) -> Result<(), EncoderError>;
    fn send_eof(&mut self) -> Result<(), EncoderError>;
    fn receive_packet(&mut self) -> Result<Received<Self::Packet>, EncoderError>;
    fn write_packet(&mut self, packet: Self::Packet) -> Result<(), EncoderError>;
    fn write_trailer(&mut self) -> Result<(), EncoderError>;
}

/// A codec/container implementation.
pub trait Backend {
    type Session: Session;

    fn name(&self) -> &'static str;
    /// Raise or restore the backend's own log verbosity.
    fn set_debug_logging(&self, enabled: bool);
    /// Look up an encoder by name, falling back to codec descriptors.
    fn resolve_codec(&self, name: &str) -> Result<CodecDescriptor, EncoderError>;
    /// Open the sink, configure and open the codec, write the header.
    fn open(&mut self, request: SessionRequest<'_>) -> Result<Self::Session, EncoderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_flags_compose() {
        let flags = ContainerFlags::GLOBAL_HEADER | ContainerFlags::NO_FILE;
        assert!(flags.contains(ContainerFlags::GLOBAL_HEADER));
        assert!(!ContainerFlags::empty().contains(ContainerFlags::NO_FILE));
    }

    #[test]
    fn hardware_request_converts_to_upload_format() {
        let config = EncoderConfig::default();
        let codec = CodecDescriptor {
            name: "h264_vaapi".into(),
            media: MediaKind::Video,
            supported_rates: None,
            hardware: Some(HwAccel::Vaapi),
        };
        let request = SessionRequest {
            config: &config,
            codec: &codec,
            time_base: Rational::new(1, 30),
            pixel_format: PixelFormat::Vaapi,
            surface_pool: Some(SurfacePoolSpec::new(HwAccel::Vaapi, 1280, 720)),
        };
        assert_eq!(request.frame_format(), PixelFormat::Nv12);

        let software = SessionRequest {
            pixel_format: PixelFormat::Yuv420p,
            surface_pool: None,
            ..request
        };
        assert_eq!(software.frame_format(), PixelFormat::Yuv420p);
    }
}
