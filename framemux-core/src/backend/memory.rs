//! Deterministic in-process backend.
//!
//! Behaves like a small libav: a codec registry with descriptor fallback,
//! containers that settle their own stream time base when the header is
//! written, a codec with a configurable look-ahead delay, and a hardware
//! path with a process-wide device and a bounded surface pool. Everything
//! that would be written to the output is recorded in a [`MemorySink`]
//! instead, so tests can inspect headers, packets and trailers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Backend, CodecDescriptor, ContainerFlags, EncodedPacket, MediaKind, Received, Session,
    SessionRequest,
};
use crate::config::{CodecOptions, EncoderConfig};
use crate::convert::{ConversionSpec, PixelFormat, SoftwareConverter};
use crate::error::EncoderError;
use crate::hw::{HwAccel, SharedDevice, SurfacePoolSpec};
use crate::timebase::{self, Rational};

/// Frames the codec buffers before emitting its first packet.
pub const DEFAULT_CODEC_DELAY: usize = 2;

/// URL schemes a stream output may use.
const STREAM_PROTOCOLS: &[&str] = &["rtmp", "rtmps", "srt", "udp", "tcp", "file"];

// ── Hardware device ──────────────────────────────────────────────

/// Stand-in for a hardware device context.
#[derive(Debug)]
pub struct MemoryDevice {
    pub accel: HwAccel,
}

static DEVICE: SharedDevice<MemoryDevice> = SharedDevice::new();
static DEVICE_OPENS: AtomicUsize = AtomicUsize::new(0);

/// How many times the process-wide device has been created.
pub fn device_opens() -> usize {
    DEVICE_OPENS.load(Ordering::SeqCst)
}

fn shared_device(accel: HwAccel) -> Result<Arc<MemoryDevice>, EncoderError> {
    DEVICE.get_or_try_init(|| {
        DEVICE_OPENS.fetch_add(1, Ordering::SeqCst);
        debug!(accel = accel.name(), "created hardware device");
        Ok(MemoryDevice { accel })
    })
}

/// Bounded pool of device surfaces.
#[derive(Debug)]
struct SurfacePool {
    spec: SurfacePoolSpec,
    free: usize,
}

impl SurfacePool {
    fn new(spec: SurfacePoolSpec) -> Self {
        Self {
            free: spec.pool_size,
            spec,
        }
    }

    fn acquire(&mut self) -> Result<Vec<u8>, EncoderError> {
        if self.free == 0 {
            return Err(EncoderError::Hardware(format!(
                "{} surface pool exhausted",
                self.spec.accel.name()
            )));
        }
        self.free -= 1;
        Ok(Vec::new())
    }

    fn release(&mut self) {
        self.free = (self.free + 1).min(self.spec.pool_size);
    }
}

// ── Codec registry ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RegistryEntry {
    /// Codec id name, used for descriptor lookups (`h264` → `libx264`).
    id: &'static str,
    descriptor: CodecDescriptor,
}

fn entry(
    id: &'static str,
    name: &str,
    media: MediaKind,
    rates: Option<Vec<Rational>>,
) -> RegistryEntry {
    RegistryEntry {
        id,
        descriptor: CodecDescriptor {
            name: name.to_string(),
            media,
            supported_rates: rates,
            hardware: HwAccel::from_codec_name(name),
        },
    }
}

fn default_registry() -> Vec<RegistryEntry> {
    let mpeg12_rates = vec![
        Rational::new(24000, 1001),
        Rational::new(24, 1),
        Rational::new(25, 1),
        Rational::new(30000, 1001),
        Rational::new(30, 1),
        Rational::new(50, 1),
        Rational::new(60000, 1001),
        Rational::new(60, 1),
    ];
    vec![
        entry("h264", "libx264", MediaKind::Video, None),
        entry("h264", "h264_vaapi", MediaKind::Video, None),
        entry("hevc", "libx265", MediaKind::Video, None),
        entry("hevc", "hevc_vaapi", MediaKind::Video, None),
        entry("mpeg4", "mpeg4", MediaKind::Video, None),
        entry("mpeg1video", "mpeg1video", MediaKind::Video, Some(mpeg12_rates)),
        entry("aac", "aac", MediaKind::Audio, None),
    ]
}

// ── Recording ────────────────────────────────────────────────────

/// One packet as it reached the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub size: usize,
    pub key: bool,
}

/// Everything written to one output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub output: String,
    pub format: &'static str,
    pub codec: String,
    pub options: CodecOptions,
    pub pixel_format: PixelFormat,
    pub flags: ContainerFlags,
    pub codec_time_base: Rational,
    pub stream_time_base: Rational,
    pub header_written: bool,
    pub trailer_written: bool,
    pub uploads: u64,
    pub packets: Vec<PacketRecord>,
}

impl OutputRecord {
    pub fn pts(&self) -> Vec<i64> {
        self.packets.iter().filter_map(|p| p.pts).collect()
    }
}

/// Shared log of every output opened through a [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    outputs: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemorySink {
    pub fn outputs(&self) -> Vec<OutputRecord> {
        self.outputs.lock().clone()
    }

    pub fn last(&self) -> Option<OutputRecord> {
        self.outputs.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, record: OutputRecord) -> usize {
        let mut outputs = self.outputs.lock();
        outputs.push(record);
        outputs.len() - 1
    }

    fn update<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut OutputRecord) -> Result<R, EncoderError>,
    ) -> Result<R, EncoderError> {
        let mut outputs = self.outputs.lock();
        let record = outputs
            .get_mut(index)
            .ok_or_else(|| EncoderError::Mux("output record missing".into()))?;
        f(record)
    }
}

// ── Backend ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Faults {
    sink_open: bool,
    header: bool,
    converter: bool,
    upload_at: Option<u64>,
}

/// In-process backend; see the module docs.
#[derive(Debug)]
pub struct MemoryBackend {
    registry: Vec<RegistryEntry>,
    sink: MemorySink,
    faults: Faults,
    codec_delay: usize,
    debug: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            registry: default_registry(),
            sink: MemorySink::default(),
            faults: Faults::default(),
            codec_delay: DEFAULT_CODEC_DELAY,
            debug: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to the recorded outputs; stays valid after the backend moves.
    pub fn sink(&self) -> MemorySink {
        self.sink.clone()
    }

    pub fn with_codec_delay(mut self, frames: usize) -> Self {
        self.codec_delay = frames;
        self
    }

    /// Register an extra codec, looked up by `id` in descriptor fallback.
    pub fn with_codec(mut self, id: &'static str, descriptor: CodecDescriptor) -> Self {
        self.registry.push(RegistryEntry { id, descriptor });
        self
    }

    /// Make every `open` fail while opening the output.
    pub fn fail_sink_open(mut self) -> Self {
        self.faults.sink_open = true;
        self
    }

    /// Make every `open` fail while writing the header.
    pub fn fail_header(mut self) -> Self {
        self.faults.header = true;
        self
    }

    /// Make converter construction fail in every session.
    pub fn fail_converter(mut self) -> Self {
        self.faults.converter = true;
        self
    }

    /// Make the `n`-th surface upload (1-based) of each session fail.
    pub fn fail_upload_at(mut self, n: u64) -> Self {
        self.faults.upload_at = Some(n);
        self
    }

    pub fn debug_logging(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    fn lookup(&self, name: &str) -> Option<&RegistryEntry> {
        self.registry
            .iter()
            .find(|e| e.descriptor.name == name)
            .or_else(|| {
                let found = self
                    .registry
                    .iter()
                    .find(|e| e.id == name && e.descriptor.hardware.is_none());
                if let Some(e) = found {
                    debug!(
                        requested = name,
                        encoder = %e.descriptor.name,
                        "matched encoder through codec descriptor"
                    );
                }
                found
            })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Container name for an output, as libavformat would guess it.
fn guess_format(config: &EncoderConfig) -> Result<&'static str, EncoderError> {
    let output = config.output.as_str();
    if let Some(forced) = config.container_format() {
        if let Some((scheme, _)) = output.split_once("://") {
            if !STREAM_PROTOCOLS.contains(&scheme) {
                return Err(EncoderError::SinkOpen {
                    output: output.to_string(),
                    reason: format!("protocol '{scheme}' not found"),
                });
            }
        }
        return Ok(forced);
    }
    let ext = output
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => Ok("mp4"),
        "mov" => Ok("mov"),
        "mkv" => Ok("matroska"),
        "webm" => Ok("webm"),
        "flv" => Ok("flv"),
        "ts" => Ok("mpegts"),
        "avi" => Ok("avi"),
        _ => Err(EncoderError::UnsupportedContainer(output.to_string())),
    }
}

/// Flags and the stream time base the container settles on.
fn container_props(format: &str, codec_tb: Rational) -> (ContainerFlags, Rational) {
    match format {
        "mp4" | "mov" => {
            let mut timescale = codec_tb.den.max(1);
            while timescale < 10_000 {
                timescale *= 2;
            }
            (ContainerFlags::GLOBAL_HEADER, Rational::new(1, timescale))
        }
        "flv" | "matroska" | "webm" => (ContainerFlags::GLOBAL_HEADER, Rational::new(1, 1000)),
        "mpegts" => (ContainerFlags::empty(), Rational::new(1, 90_000)),
        _ => (ContainerFlags::empty(), codec_tb),
    }
}

impl Backend for MemoryBackend {
    type Session = MemorySession;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn set_debug_logging(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::SeqCst);
        debug!(enabled, "memory backend debug logging");
    }

    fn resolve_codec(&self, name: &str) -> Result<CodecDescriptor, EncoderError> {
        self.lookup(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| EncoderError::CodecNotFound(name.to_string()))
    }

    fn open(&mut self, request: SessionRequest<'_>) -> Result<MemorySession, EncoderError> {
        let config = request.config;
        let format = guess_format(config)?;
        if self.faults.sink_open {
            return Err(EncoderError::SinkOpen {
                output: config.output.clone(),
                reason: "permission denied".into(),
            });
        }

        let hardware = request.codec.hardware;
        if hardware.is_some() != request.pixel_format.is_hardware() {
            return Err(EncoderError::CodecOpen {
                codec: request.codec.name.clone(),
                reason: format!("pixel format {} not supported", request.pixel_format.name()),
            });
        }
        let (device, surfaces) = match (hardware, request.surface_pool) {
            (Some(accel), Some(spec)) => (Some(shared_device(accel)?), Some(SurfacePool::new(spec))),
            (Some(_), None) => {
                return Err(EncoderError::Hardware("missing surface pool".into()));
            }
            _ => (None, None),
        };

        let (flags, stream_tb) = container_props(format, request.time_base);
        if self.faults.header {
            return Err(EncoderError::Header("broken pipe".into()));
        }

        let index = self.sink.push(OutputRecord {
            output: config.output.clone(),
            format,
            codec: request.codec.name.clone(),
            options: config.codec_options.clone(),
            pixel_format: request.pixel_format,
            flags,
            codec_time_base: request.time_base,
            stream_time_base: stream_tb,
            header_written: true,
            trailer_written: false,
            uploads: 0,
            packets: Vec::new(),
        });

        Ok(MemorySession {
            sink: self.sink.clone(),
            index,
            format,
            flags,
            codec_tb: request.time_base,
            stream_tb,
            gop: u64::from(config.gop_size.max(1)),
            frame_format: request.frame_format(),
            fail_converter: self.faults.converter,
            converter: None,
            frame: Vec::new(),
            frame_ready: false,
            surfaces,
            surface: None,
            upload_fault_at: self.faults.upload_at,
            uploads: 0,
            _device: device,
            pending: VecDeque::new(),
            delay: self.codec_delay,
            frames_in: 0,
            last_dts: None,
            eof: false,
        })
    }
}

// ── Session ──────────────────────────────────────────────────────

/// A compressed packet from the in-process codec.
#[derive(Debug, Clone)]
pub struct MemoryPacket {
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    key: bool,
    data: Bytes,
}

impl MemoryPacket {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }
}

impl EncodedPacket for MemoryPacket {
    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn dts(&self) -> Option<i64> {
        self.dts
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn is_key(&self) -> bool {
        self.key
    }

    fn rescale_ts(&mut self, from: Rational, to: Rational) {
        self.pts = self.pts.map(|v| timebase::rescale(v, from, to));
        self.dts = self.dts.map(|v| timebase::rescale(v, from, to));
        self.duration = timebase::rescale(self.duration, from, to);
    }
}

/// Session opened by [`MemoryBackend`].
#[derive(Debug)]
pub struct MemorySession {
    sink: MemorySink,
    index: usize,
    format: &'static str,
    flags: ContainerFlags,
    codec_tb: Rational,
    stream_tb: Rational,
    gop: u64,
    frame_format: PixelFormat,
    fail_converter: bool,
    converter: Option<SoftwareConverter>,
    frame: Vec<u8>,
    frame_ready: bool,
    surfaces: Option<SurfacePool>,
    surface: Option<Vec<u8>>,
    upload_fault_at: Option<u64>,
    uploads: u64,
    _device: Option<Arc<MemoryDevice>>,
    pending: VecDeque<MemoryPacket>,
    delay: usize,
    frames_in: u64,
    last_dts: Option<i64>,
    eof: bool,
}

impl MemorySession {
    fn compress(&self, picture: &[u8], pts: i64) -> MemoryPacket {
        let key = self.frames_in % self.gop == 0;
        let checksum = picture
            .iter()
            .fold(0u32, |acc, &b| acc.rotate_left(5) ^ u32::from(b));
        let mut data = BytesMut::with_capacity(64);
        data.put_i64_le(pts);
        data.put_u32_le(checksum);
        if key {
            data.put_bytes(0, 52);
        }
        MemoryPacket {
            pts: Some(pts),
            dts: Some(pts),
            duration: 1,
            key,
            data: data.freeze(),
        }
    }
}

impl Session for MemorySession {
    type Packet = MemoryPacket;

    fn format_name(&self) -> &str {
        self.format
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
        if self.fail_converter {
            return Err(EncoderError::Conversion("cannot initialize the conversion context".into()));
        }
        if spec.dst_format != self.frame_format {
            return Err(EncoderError::Conversion(format!(
                "converter targets {} but frames are {}",
                spec.dst_format.name(),
                self.frame_format.name()
            )));
        }
        let converter = SoftwareConverter::new(spec)?;
        self.frame = vec![0; converter.dst_len()];
        self.converter = Some(converter);
        Ok(())
    }

    fn convert(&mut self, raw: &[u8]) -> Result<(), EncoderError> {
        let converter = self
            .converter
            .as_ref()
            .ok_or_else(|| EncoderError::Conversion("converter not initialized".into()))?;
        converter.convert(raw, &mut self.frame)?;
        self.frame_ready = true;
        Ok(())
    }

    fn upload(&mut self) -> Result<(), EncoderError> {
        let pool = self
            .surfaces
            .as_mut()
            .ok_or_else(|| EncoderError::Hardware("session has no surface pool".into()))?;
        self.uploads += 1;
        if self.upload_fault_at == Some(self.uploads) {
            return Err(EncoderError::Hardware("error transferring frame data to surface".into()));
        }
        let mut surface = pool.acquire()?;
        surface.extend_from_slice(&self.frame);
        self.surface = Some(surface);
        self.sink.update(self.index, |rec| {
            rec.uploads += 1;
            Ok(())
        })
    }

    fn send_frame(&mut self, pts: i64) -> Result<(), EncoderError> {
        if self.eof {
            return Err(EncoderError::Codec("frame submitted after end of stream".into()));
        }
        let packet = if self.surfaces.is_some() {
            let surface = self
                .surface
                .take()
                .ok_or_else(|| EncoderError::Hardware("no uploaded surface".into()))?;
            let packet = self.compress(&surface, pts);
            if let Some(pool) = self.surfaces.as_mut() {
                pool.release();
            }
            packet
        } else {
            if !self.frame_ready {
                return Err(EncoderError::Codec("no converted frame to submit".into()));
            }
            self.frame_ready = false;
            self.compress(&self.frame, pts)
        };
        self.pending.push_back(packet);
        self.frames_in += 1;
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), EncoderError> {
        self.eof = true;
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Received<MemoryPacket>, EncoderError> {
        if self.pending.len() > self.delay || (self.eof && !self.pending.is_empty()) {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Received::Packet(packet));
            }
        }
        if self.eof {
            Ok(Received::Finished)
        } else {
            Ok(Received::Again)
        }
    }

    fn write_packet(&mut self, packet: MemoryPacket) -> Result<(), EncoderError> {
        if let (Some(last), Some(dts)) = (self.last_dts, packet.dts) {
            if dts <= last {
                return Err(EncoderError::Mux(format!(
                    "non monotonically increasing dts: {last} >= {dts}"
                )));
            }
        }
        self.last_dts = packet.dts.or(self.last_dts);
        self.sink.update(self.index, |rec| {
            if rec.trailer_written {
                return Err(EncoderError::Mux("packet written after trailer".into()));
            }
            rec.packets.push(PacketRecord {
                pts: packet.pts,
                dts: packet.dts,
                size: packet.size(),
                key: packet.key,
            });
            Ok(())
        })
    }

    fn write_trailer(&mut self) -> Result<(), EncoderError> {
        self.sink.update(self.index, |rec| {
            if rec.trailer_written {
                return Err(EncoderError::Mux("trailer already written".into()));
            }
            rec.trailer_written = true;
            Ok(())
        })
    }
}
