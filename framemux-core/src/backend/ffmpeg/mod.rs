//! libav backend: libavcodec encoders, libavformat muxers and libswscale
//! conversion through `ffmpeg-next`.

mod vaapi;

use std::ffi::CString;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame;
use tracing::{debug, info};

use super::{
    Backend, CodecDescriptor, ContainerFlags, EncodedPacket, MediaKind, Received, Session,
    SessionRequest,
};
use crate::convert::{ConversionSpec, PixelFormat};
use crate::error::EncoderError;
use crate::hw::HwAccel;
use crate::timebase::Rational;

pub use vaapi::release_shared_device;

impl From<ffmpeg::Rational> for Rational {
    fn from(r: ffmpeg::Rational) -> Self {
        Rational::new(r.numerator(), r.denominator())
    }
}

impl From<Rational> for ffmpeg::Rational {
    fn from(r: Rational) -> Self {
        ffmpeg::Rational::new(r.num, r.den)
    }
}

fn pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Vaapi => Pixel::VAAPI,
    }
}

/// Find an encoder by name, then through the codec descriptor table
/// (`h264` resolves to the default H.264 encoder).
fn find_encoder(name: &str) -> Result<ffmpeg::Codec, EncoderError> {
    if let Some(codec) = ffmpeg::encoder::find_by_name(name) {
        return Ok(codec);
    }
    let not_found = || EncoderError::CodecNotFound(name.to_string());
    let cname = CString::new(name).map_err(|_| not_found())?;
    // SAFETY: `cname` is a valid NUL-terminated string; the returned
    // descriptor is static and only read.
    let descriptor = unsafe { ffi::avcodec_descriptor_get_by_name(cname.as_ptr()) };
    if descriptor.is_null() {
        return Err(not_found());
    }
    // SAFETY: checked non-null above.
    let id = ffmpeg::codec::Id::from(unsafe { (*descriptor).id });
    let codec = ffmpeg::encoder::find(id).ok_or_else(not_found)?;
    debug!(
        requested = name,
        encoder = codec.name(),
        "matched encoder through codec descriptor"
    );
    Ok(codec)
}

fn container_flags(format: &ffmpeg::format::Output) -> ContainerFlags {
    let native = format.flags();
    let mut flags = ContainerFlags::empty();
    if native.contains(ffmpeg::format::Flags::NO_FILE) {
        flags |= ContainerFlags::NO_FILE;
    }
    if native.contains(ffmpeg::format::Flags::GLOBAL_HEADER) {
        flags |= ContainerFlags::GLOBAL_HEADER;
    }
    flags
}

/// Backend over the system FFmpeg libraries.
pub struct FfmpegBackend {
    _private: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self, EncoderError> {
        ffmpeg::init()?;
        Ok(Self { _private: () })
    }
}

impl Backend for FfmpegBackend {
    type Session = FfmpegSession;

    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn set_debug_logging(&self, enabled: bool) {
        let level = if enabled {
            ffmpeg::util::log::Level::Debug
        } else {
            ffmpeg::util::log::Level::Info
        };
        ffmpeg::util::log::set_level(level);
    }

    fn resolve_codec(&self, name: &str) -> Result<CodecDescriptor, EncoderError> {
        let codec = find_encoder(name)?;
        let media = match codec.medium() {
            ffmpeg::media::Type::Video => MediaKind::Video,
            ffmpeg::media::Type::Audio => MediaKind::Audio,
            ffmpeg::media::Type::Subtitle => MediaKind::Subtitle,
            _ => MediaKind::Other,
        };
        let encoder_name = codec.name().to_string();
        let supported_rates = match codec.video() {
            Ok(video) => video
                .rates()
                .map(|rates| rates.map(Rational::from).collect::<Vec<_>>()),
            Err(_) => None,
        };
        Ok(CodecDescriptor {
            hardware: HwAccel::from_codec_name(&encoder_name),
            name: encoder_name,
            media,
            supported_rates,
        })
    }

    fn open(&mut self, request: SessionRequest<'_>) -> Result<FfmpegSession, EncoderError> {
        let config = request.config;
        let sink_error = |e: ffmpeg::Error| EncoderError::SinkOpen {
            output: config.output.clone(),
            reason: e.to_string(),
        };
        let mut octx = match config.container_format() {
            Some(format) => {
                ffmpeg::format::network::init();
                ffmpeg::format::output_as(&config.output, format).map_err(sink_error)?
            }
            None => ffmpeg::format::output(&config.output).map_err(sink_error)?,
        };
        let flags = container_flags(&octx.format());
        let format_name = octx.format().name().to_string();

        let codec = find_encoder(&config.codec_name)?;
        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        ctx.set_width(config.dst_width);
        ctx.set_height(config.dst_height);
        ctx.set_format(pixel(request.pixel_format));
        ctx.set_time_base(request.time_base);
        ctx.set_frame_rate(Some(request.time_base.invert()));
        ctx.set_gop(config.gop_size);
        if config.bitrate > 0 {
            ctx.set_bit_rate(config.bitrate as usize);
        }
        if flags.contains(ContainerFlags::GLOBAL_HEADER) {
            ctx.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let (device, surfaces) = match request.surface_pool {
            Some(spec) => {
                let device = vaapi::shared_device(spec.accel)?;
                let surfaces = vaapi::FramesContext::new(&device, &spec)?;
                surfaces.attach(&mut ctx)?;
                (Some(device), Some(surfaces))
            }
            None => (None, None),
        };

        let mut options = ffmpeg::Dictionary::new();
        for (key, value) in config.codec_options.iter() {
            options.set(key, value);
        }
        let encoder = ctx.open_with(options).map_err(|e| EncoderError::CodecOpen {
            codec: codec.name().to_string(),
            reason: e.to_string(),
        })?;

        let stream_index = {
            let mut ost = octx.add_stream(codec)?;
            ost.set_parameters(&encoder);
            ost.set_time_base(encoder.time_base());
            ost.set_avg_frame_rate(request.time_base.invert());
            ost.index()
        };

        ffmpeg::format::context::output::dump(&octx, 0, Some(config.output.as_str()));
        octx.write_header()
            .map_err(|e| EncoderError::Header(e.to_string()))?;

        let stream_tb = octx
            .stream(stream_index)
            .map(|stream| Rational::from(stream.time_base()))
            .ok_or_else(|| EncoderError::Header("output stream missing after header".into()))?;
        let codec_tb = Rational::from(encoder.time_base());
        info!(
            output = %config.output,
            format = %format_name,
            %codec_tb,
            %stream_tb,
            "output opened"
        );

        let frame_format = pixel(request.frame_format());
        Ok(FfmpegSession {
            octx,
            encoder,
            stream_index,
            codec_tb,
            stream_tb,
            format_name,
            flags,
            frame: frame::Video::new(frame_format, config.dst_width, config.dst_height),
            source: None,
            scaler: None,
            uploaded: None,
            surfaces,
            _device: device,
        })
    }
}

// ── Session ──────────────────────────────────────────────────────

/// A libav packet.
pub struct FfmpegPacket(ffmpeg::Packet);

impl EncodedPacket for FfmpegPacket {
    fn pts(&self) -> Option<i64> {
        self.0.pts()
    }

    fn dts(&self) -> Option<i64> {
        self.0.dts()
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn is_key(&self) -> bool {
        self.0.is_key()
    }

    fn rescale_ts(&mut self, from: Rational, to: Rational) {
        self.0.rescale_ts(from, to);
    }
}

pub struct FfmpegSession {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    stream_index: usize,
    codec_tb: Rational,
    stream_tb: Rational,
    format_name: String,
    flags: ContainerFlags,
    /// Converted frame in the codec (or upload) format.
    frame: frame::Video,
    /// BGR staging frame, allocated with the converter.
    source: Option<frame::Video>,
    scaler: Option<scaling::Context>,
    uploaded: Option<frame::Video>,
    surfaces: Option<vaapi::FramesContext>,
    _device: Option<Arc<vaapi::Device>>,
}

// SAFETY: the session is owned and driven by one thread at a time; none
// of the wrapped libav contexts are shared with other owners.
unsafe impl Send for FfmpegSession {}

impl Session for FfmpegSession {
    type Packet = FfmpegPacket;

    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn container_flags(&self) -> ContainerFlags {
        self.flags
    }

    fn codec_time_base(&self) -> Rational {
        self.codec_tb
    }

    fn stream_time_base(&self) -> Rational {
        self.stream_tb
    }

    fn build_converter(&mut self, spec: ConversionSpec) -> Result<(), EncoderError> {
        let scaler = scaling::Context::get(
            Pixel::BGR24,
            spec.src_width,
            spec.src_height,
            pixel(spec.dst_format),
            spec.dst_width,
            spec.dst_height,
            scaling::Flags::FAST_BILINEAR,
        )
        .map_err(|e| EncoderError::Conversion(format!("cannot initialize the conversion context: {e}")))?;
        self.source = Some(frame::Video::new(Pixel::BGR24, spec.src_width, spec.src_height));
        self.scaler = Some(scaler);
        Ok(())
    }

    fn convert(&mut self, raw: &[u8]) -> Result<(), EncoderError> {
        let (Some(scaler), Some(source)) = (self.scaler.as_mut(), self.source.as_mut()) else {
            return Err(EncoderError::Conversion("converter not initialized".into()));
        };
        let row = source.width() as usize * 3;
        let stride = source.stride(0);
        let plane = source.data_mut(0);
        for (y, line) in raw.chunks_exact(row).enumerate() {
            let at = y * stride;
            plane[at..at + row].copy_from_slice(line);
        }
        scaler
            .run(source, &mut self.frame)
            .map_err(|e| EncoderError::Conversion(e.to_string()))
    }

    fn upload(&mut self) -> Result<(), EncoderError> {
        let surfaces = self
            .surfaces
            .as_ref()
            .ok_or_else(|| EncoderError::Hardware("session has no surface pool".into()))?;
        self.uploaded = Some(surfaces.upload(&self.frame)?);
        Ok(())
    }

    fn send_frame(&mut self, pts: i64) -> Result<(), EncoderError> {
        let result = match self.uploaded.take() {
            Some(mut surface) => {
                surface.set_pts(Some(pts));
                self.encoder.send_frame(&surface)
            }
            None => {
                self.frame.set_pts(Some(pts));
                self.encoder.send_frame(&self.frame)
            }
        };
        result.map_err(|e| EncoderError::Codec(format!("error sending frame: {e}")))
    }

    fn send_eof(&mut self) -> Result<(), EncoderError> {
        self.encoder
            .send_eof()
            .map_err(|e| EncoderError::Codec(format!("error flushing codec: {e}")))
    }

    fn receive_packet(&mut self) -> Result<Received<FfmpegPacket>, EncoderError> {
        let mut packet = ffmpeg::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => Ok(Received::Packet(FfmpegPacket(packet))),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                Ok(Received::Again)
            }
            Err(ffmpeg::Error::Eof) => Ok(Received::Finished),
            Err(e) => Err(EncoderError::Codec(format!("error receiving packet: {e}"))),
        }
    }

    fn write_packet(&mut self, mut packet: FfmpegPacket) -> Result<(), EncoderError> {
        packet.0.set_stream(self.stream_index);
        packet
            .0
            .write_interleaved(&mut self.octx)
            .map_err(|e| EncoderError::Mux(e.to_string()))
    }

    fn write_trailer(&mut self) -> Result<(), EncoderError> {
        self.octx
            .write_trailer()
            .map_err(|e| EncoderError::Mux(format!("error writing trailer: {e}")))
    }
}
