//! Synchronous encode/mux pipeline.
//!
//! ```text
//!              init ok                     close
//! Uninitialized ──────► Ready ───────────────────────► Closed
//!       │                 │  hardware upload failure
//!       │ init failed     └──────────────────────────► Failed
//!       └─────────────────────────────────────────────► Failed
//! ```
//!
//! Each `put_frame` converts one BGR frame, uploads it for hardware
//! sessions, stamps it with the next PTS, submits it and drains every
//! packet the codec has ready into the container. `close` flushes the
//! codec and writes the trailer; dropping a `Ready` encoder does the same.

use std::mem;

use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    Backend, ContainerFlags, EncodedPacket, MediaKind, Received, Session, SessionRequest,
};
use crate::config::EncoderConfig;
use crate::convert::{ConversionSpec, PixelFormat};
use crate::error::EncoderError;
use crate::hw::{HwAccel, SurfacePoolSpec};
use crate::timebase::{self, PtsCounter, Rational};

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Ready,
    Failed,
    Closed,
}

/// Converter construction is deferred to the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConverterState {
    Pending,
    Ready,
    /// Construction failed; frames are dropped for the rest of the session.
    Broken,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub last_pts: Option<i64>,
}

/// Facts about an open session, fixed once `init` succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub codec: String,
    pub format: String,
    pub codec_time_base: Rational,
    pub stream_time_base: Rational,
    pub pixel_format: PixelFormat,
    pub hardware: Option<HwAccel>,
    /// Flags the container settled on; `GLOBAL_HEADER` means codec
    /// headers go into the container header instead of every keyframe.
    pub container_flags: ContainerFlags,
}

struct ActiveSession<S: Session> {
    session: S,
    info: SessionInfo,
    spec: ConversionSpec,
    converter: ConverterState,
    pts: PtsCounter,
    rescale: bool,
    stats: SessionStats,
}

impl<S: Session> ActiveSession<S> {
    fn submit(&mut self, frame: &[u8], duration: f64) -> Result<usize, EncoderError> {
        if self.converter == ConverterState::Pending {
            self.converter = match self.session.build_converter(self.spec) {
                Ok(()) => {
                    debug!(
                        src_width = self.spec.src_width,
                        src_height = self.spec.src_height,
                        dst_width = self.spec.dst_width,
                        dst_height = self.spec.dst_height,
                        format = self.spec.dst_format.name(),
                        "converter ready"
                    );
                    ConverterState::Ready
                }
                Err(e) => {
                    error!("converter unavailable, dropping frames for this session: {e}");
                    ConverterState::Broken
                }
            };
        }
        if self.converter == ConverterState::Broken {
            self.stats.frames_dropped += 1;
            return Ok(0);
        }

        // stamp first so a bad duration is rejected before any upload
        let stamp = self.pts.peek(duration)?;
        self.session.convert(frame)?;
        if self.info.hardware.is_some() {
            self.session.upload()?;
        }

        self.rescale = stamp.policy.needs_rescale();
        self.session.send_frame(stamp.pts)?;
        self.pts.commit(stamp);
        self.stats.frames_submitted += 1;
        self.stats.last_pts = Some(stamp.pts);
        trace!(pts = stamp.pts, policy = ?stamp.policy, "frame submitted");

        self.drain(false)
    }

    /// Move every ready packet into the container.
    fn drain(&mut self, flushing: bool) -> Result<usize, EncoderError> {
        let codec_tb = self.session.codec_time_base();
        let stream_tb = self.session.stream_time_base();
        let mut written = 0;
        loop {
            match self.session.receive_packet()? {
                Received::Packet(mut packet) => {
                    if self.rescale {
                        packet.rescale_ts(codec_tb, stream_tb);
                    }
                    let size = packet.size();
                    self.session.write_packet(packet)?;
                    self.stats.packets_written += 1;
                    self.stats.bytes_written += size as u64;
                    written += 1;
                }
                Received::Again if flushing => {
                    warn!("codec asked for input after end of stream");
                    break;
                }
                Received::Again | Received::Finished => break,
            }
        }
        Ok(written)
    }

    /// Flush the codec, then write the trailer even if flushing failed.
    fn finish(&mut self) -> Result<usize, EncoderError> {
        let flushed = self
            .session
            .send_eof()
            .and_then(|()| self.drain(true));
        let trailer = self.session.write_trailer();
        let flushed = flushed?;
        trailer.map(|()| flushed)
    }
}

enum Slot<S: Session> {
    Uninitialized,
    Ready(Box<ActiveSession<S>>),
    Failed,
    Closed,
}

/// The encode/mux pipeline over a [`Backend`].
pub struct Encoder<B: Backend> {
    backend: B,
    slot: Slot<B::Session>,
    config: Option<EncoderConfig>,
    last_stats: SessionStats,
}

impl<B: Backend> Encoder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slot: Slot::Uninitialized,
            config: None,
            last_stats: SessionStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> EncoderState {
        match self.slot {
            Slot::Uninitialized => EncoderState::Uninitialized,
            Slot::Ready(_) => EncoderState::Ready,
            Slot::Failed => EncoderState::Failed,
            Slot::Closed => EncoderState::Closed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.slot, Slot::Ready(_))
    }

    pub fn config(&self) -> Option<&EncoderConfig> {
        self.config.as_ref()
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        match &self.slot {
            Slot::Ready(active) => Some(&active.info),
            _ => None,
        }
    }

    /// Stream time base of the open session.
    pub fn stream_time_base(&self) -> Option<Rational> {
        self.session_info().map(|info| info.stream_time_base)
    }

    /// Counters of the open session, or of the last one to end.
    pub fn stats(&self) -> SessionStats {
        match &self.slot {
            Slot::Ready(active) => active.stats,
            _ => self.last_stats,
        }
    }

    /// Turn on the backend's verbose logging. Safe in any state.
    pub fn enable_debug_log(&self) {
        self.backend.set_debug_logging(true);
    }

    /// Open the output, configure the codec and write the header.
    pub fn init(&mut self, config: EncoderConfig) -> Result<(), EncoderError> {
        match self.slot {
            Slot::Uninitialized => {}
            Slot::Ready(_) => return Err(EncoderError::AlreadyInitialized),
            Slot::Failed | Slot::Closed => return Err(EncoderError::SessionEnded),
        }

        let result = self.open_session(&config);
        self.config = Some(config);
        match result {
            Ok(active) => {
                let global_header = active
                    .info
                    .container_flags
                    .contains(ContainerFlags::GLOBAL_HEADER);
                info!(
                    backend = self.backend.name(),
                    codec = %active.info.codec,
                    format = %active.info.format,
                    codec_tb = %active.info.codec_time_base,
                    stream_tb = %active.info.stream_time_base,
                    global_header,
                    "encoder initialized"
                );
                self.slot = Slot::Ready(active);
                Ok(())
            }
            Err(e) => {
                error!("encoder init failed: {e}");
                self.slot = Slot::Failed;
                Err(e)
            }
        }
    }

    fn open_session(
        &mut self,
        config: &EncoderConfig,
    ) -> Result<Box<ActiveSession<B::Session>>, EncoderError> {
        config.validate()?;

        let codec = self.backend.resolve_codec(&config.codec_name)?;
        if codec.media != MediaKind::Video {
            return Err(EncoderError::NotVideoCodec {
                name: config.codec_name.clone(),
                kind: codec.media.as_str(),
            });
        }

        let hardware = codec.hardware.or_else(|| config.hardware());
        let time_base = timebase::derive_time_base(config.fps, codec.supported_rates.as_deref());
        let (pixel_format, surface_pool) = match hardware {
            Some(accel) => (
                accel.device_format(),
                Some(SurfacePoolSpec::new(accel, config.dst_width, config.dst_height)),
            ),
            None => (PixelFormat::Yuv420p, None),
        };
        let request = SessionRequest {
            config,
            codec: &codec,
            time_base,
            pixel_format,
            surface_pool,
        };
        let frame_format = request.frame_format();
        let session = self.backend.open(request)?;

        let info = SessionInfo {
            codec: codec.name.clone(),
            format: session.format_name().to_string(),
            codec_time_base: session.codec_time_base(),
            stream_time_base: session.stream_time_base(),
            pixel_format,
            hardware,
            container_flags: session.container_flags(),
        };
        let spec = ConversionSpec {
            src_width: config.src_width,
            src_height: config.src_height,
            dst_width: config.dst_width,
            dst_height: config.dst_height,
            dst_format: frame_format,
        };
        Ok(Box::new(ActiveSession {
            session,
            info,
            spec,
            converter: ConverterState::Pending,
            pts: PtsCounter::new(),
            rescale: true,
            stats: SessionStats::default(),
        }))
    }

    /// Encode one packed BGR frame.
    ///
    /// `duration` is in stream ticks; zero means "one codec tick". Returns
    /// the number of packets written. Outside the `Ready` state this is a
    /// silent no-op returning `Ok(0)`. A frame of the wrong size is
    /// rejected without touching the session. A hardware upload failure
    /// ends the session: the trailer is written best-effort and the
    /// encoder moves to `Failed`.
    pub fn put_frame(&mut self, frame: &[u8], duration: f64) -> Result<usize, EncoderError> {
        let state = self.state();
        let Slot::Ready(active) = &mut self.slot else {
            trace!(?state, "frame ignored");
            return Ok(0);
        };

        let expected = active.spec.src_len();
        if frame.len() != expected {
            return Err(EncoderError::FrameSize {
                expected,
                actual: frame.len(),
            });
        }

        let outcome = active.submit(frame, duration);
        if let Err(e) = &outcome {
            if e.is_hardware() {
                error!("hardware path failed, abandoning session: {e}");
                self.abandon();
            } else {
                warn!("frame not encoded: {e}");
            }
        }
        outcome
    }

    fn abandon(&mut self) {
        if let Slot::Ready(mut active) = mem::replace(&mut self.slot, Slot::Failed) {
            if let Err(e) = active.session.write_trailer() {
                warn!("trailer after failure not written: {e}");
            }
            self.last_stats = active.stats;
        }
    }

    /// Flush buffered packets, write the trailer and release the session.
    ///
    /// Idempotent; a never-opened or already-ended encoder is left as is.
    pub fn close(&mut self) -> Result<(), EncoderError> {
        let mut active = match mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Ready(active) => active,
            other => {
                self.slot = other;
                return Ok(());
            }
        };

        let result = active.finish();
        self.last_stats = active.stats;
        match &result {
            Ok(flushed) => info!(
                frames = active.stats.frames_submitted,
                packets = active.stats.packets_written,
                flushed,
                "encoder closed"
            ),
            Err(e) => error!("encoder close incomplete: {e}"),
        }
        result.map(|_| ())
    }
}

impl<B: Backend> Drop for Encoder<B> {
    fn drop(&mut self) {
        if self.is_ready() {
            if let Err(e) = self.close() {
                warn!("encoder dropped with errors: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn small_config(output: &str) -> EncoderConfig {
        EncoderConfig {
            src_width: 8,
            src_height: 4,
            dst_width: 4,
            dst_height: 2,
            fps: 30.0,
            output: output.into(),
            ..EncoderConfig::default()
        }
    }

    fn frame(config: &EncoderConfig, shade: u8) -> Vec<u8> {
        vec![shade; config.frame_len()]
    }

    #[test]
    fn init_then_close_writes_header_and_trailer() {
        let backend = MemoryBackend::new();
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        encoder.init(small_config("a.flv")).unwrap();
        assert_eq!(encoder.state(), EncoderState::Ready);
        assert_eq!(encoder.stream_time_base(), Some(Rational::new(1, 1000)));
        encoder.close().unwrap();
        assert_eq!(encoder.state(), EncoderState::Closed);

        let record = sink.last().unwrap();
        assert!(record.header_written);
        assert!(record.trailer_written);
        assert!(record.packets.is_empty());
    }

    #[test]
    fn session_info_reports_container_flags() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        encoder.init(small_config("a.mkv")).unwrap();
        let info = encoder.session_info().unwrap();
        assert!(info.container_flags.contains(ContainerFlags::GLOBAL_HEADER));
        encoder.close().unwrap();

        let mut encoder = Encoder::new(MemoryBackend::new());
        encoder.init(small_config("a.ts")).unwrap();
        assert!(encoder.session_info().unwrap().container_flags.is_empty());
    }

    #[test]
    fn second_init_rejected() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        encoder.init(small_config("a.flv")).unwrap();
        assert!(matches!(
            encoder.init(small_config("b.flv")),
            Err(EncoderError::AlreadyInitialized)
        ));
        assert_eq!(encoder.state(), EncoderState::Ready);
    }

    #[test]
    fn unknown_codec_fails_init() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        let config = EncoderConfig {
            codec_name: "nonexistent".into(),
            ..small_config("a.mp4")
        };
        let err = encoder.init(config).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(encoder.state(), EncoderState::Failed);
        // frames after a failed init are ignored
        assert_eq!(encoder.put_frame(&[0; 96], 0.0).unwrap(), 0);
        assert!(matches!(
            encoder.init(small_config("a.mp4")),
            Err(EncoderError::SessionEnded)
        ));
    }

    #[test]
    fn audio_codec_rejected() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        let config = EncoderConfig {
            codec_name: "aac".into(),
            ..small_config("a.mp4")
        };
        assert!(matches!(
            encoder.init(config),
            Err(EncoderError::NotVideoCodec { .. })
        ));
    }

    #[test]
    fn frames_before_init_are_noops() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        assert_eq!(encoder.put_frame(&[1, 2, 3], 0.0).unwrap(), 0);
        encoder.close().unwrap();
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
    }

    #[test]
    fn wrong_frame_size_leaves_session_intact() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        let config = small_config("a.flv");
        encoder.init(config.clone()).unwrap();
        assert!(matches!(
            encoder.put_frame(&[0; 10], 0.0),
            Err(EncoderError::FrameSize {
                expected: 96,
                actual: 10
            })
        ));
        assert_eq!(encoder.state(), EncoderState::Ready);
        encoder.put_frame(&frame(&config, 7), 0.0).unwrap();
        assert_eq!(encoder.stats().frames_submitted, 1);
    }

    #[test]
    fn fixed_increment_pts_is_rescaled() {
        let backend = MemoryBackend::new().with_codec_delay(0);
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        let config = small_config("a.flv");
        encoder.init(config.clone()).unwrap();
        for _ in 0..4 {
            assert_eq!(encoder.put_frame(&frame(&config, 0), 0.0).unwrap(), 1);
        }
        encoder.close().unwrap();
        assert_eq!(sink.last().unwrap().pts(), vec![0, 33, 67, 100]);
    }

    #[test]
    fn explicit_durations_are_not_rescaled() {
        let backend = MemoryBackend::new().with_codec_delay(0);
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        let config = small_config("a.flv");
        encoder.init(config.clone()).unwrap();
        for d in [40.0, 40.0, 33.4] {
            encoder.put_frame(&frame(&config, 0), d).unwrap();
        }
        encoder.close().unwrap();
        assert_eq!(sink.last().unwrap().pts(), vec![0, 40, 73]);
    }

    #[test]
    fn unrepresentable_duration_rejected_before_upload() {
        let backend = MemoryBackend::new().with_codec_delay(0);
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        let config = EncoderConfig {
            codec_name: "h264_vaapi".into(),
            ..small_config("a.flv")
        };
        encoder.init(config.clone()).unwrap();
        encoder.put_frame(&frame(&config, 0), 0.0).unwrap();
        for bad in [1e30, f64::INFINITY] {
            assert!(matches!(
                encoder.put_frame(&frame(&config, 0), bad),
                Err(EncoderError::InvalidDuration(_))
            ));
        }
        assert_eq!(encoder.state(), EncoderState::Ready);
        encoder.put_frame(&frame(&config, 0), 40.0).unwrap();
        encoder.close().unwrap();

        let record = sink.last().unwrap();
        assert_eq!(record.uploads, 2);
        assert_eq!(record.pts(), vec![0, 40]);
    }

    #[test]
    fn sub_millihertz_fps_fails_init() {
        let mut encoder = Encoder::new(MemoryBackend::new());
        let config = EncoderConfig {
            fps: 0.0004,
            ..small_config("a.mp4")
        };
        assert!(matches!(
            encoder.init(config),
            Err(EncoderError::InvalidConfig(_))
        ));
        assert_eq!(encoder.state(), EncoderState::Failed);
    }

    #[test]
    fn close_flushes_delayed_packets() {
        let backend = MemoryBackend::new().with_codec_delay(3);
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        let config = small_config("a.mkv");
        encoder.init(config.clone()).unwrap();
        let mut written = 0;
        for _ in 0..5 {
            written += encoder.put_frame(&frame(&config, 0), 0.0).unwrap();
        }
        assert_eq!(written, 2);
        encoder.close().unwrap();
        assert_eq!(encoder.stats().packets_written, 5);
        assert_eq!(sink.last().unwrap().packets.len(), 5);
    }

    #[test]
    fn close_is_idempotent() {
        let backend = MemoryBackend::new();
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        encoder.init(small_config("a.flv")).unwrap();
        encoder.close().unwrap();
        encoder.close().unwrap();
        assert_eq!(encoder.state(), EncoderState::Closed);
        assert!(sink.last().unwrap().trailer_written);
        assert_eq!(encoder.put_frame(&[0; 96], 0.0).unwrap(), 0);
    }

    #[test]
    fn drop_finalizes_open_session() {
        let backend = MemoryBackend::new();
        let sink = backend.sink();
        {
            let config = small_config("a.flv");
            let mut encoder = Encoder::new(backend);
            encoder.init(config.clone()).unwrap();
            encoder.put_frame(&frame(&config, 1), 0.0).unwrap();
        }
        let record = sink.last().unwrap();
        assert!(record.trailer_written);
        assert_eq!(record.packets.len(), 1);
    }

    #[test]
    fn broken_converter_drops_frames() {
        let backend = MemoryBackend::new().fail_converter();
        let sink = backend.sink();
        let mut encoder = Encoder::new(backend);
        let config = small_config("a.flv");
        encoder.init(config.clone()).unwrap();
        for _ in 0..3 {
            assert_eq!(encoder.put_frame(&frame(&config, 0), 0.0).unwrap(), 0);
        }
        assert_eq!(encoder.state(), EncoderState::Ready);
        assert_eq!(encoder.stats().frames_dropped, 3);
        encoder.close().unwrap();
        let record = sink.last().unwrap();
        assert!(record.packets.is_empty());
        assert!(record.trailer_written);
    }

    #[test]
    fn header_failure_fails_init() {
        let mut encoder = Encoder::new(MemoryBackend::new().fail_header());
        assert!(matches!(
            encoder.init(small_config("a.flv")),
            Err(EncoderError::Header(_))
        ));
        assert_eq!(encoder.state(), EncoderState::Failed);
        encoder.close().unwrap();
        assert_eq!(encoder.state(), EncoderState::Failed);
    }
}
