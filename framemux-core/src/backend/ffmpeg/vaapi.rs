//! VAAPI device and surface pool handling.

use std::ptr;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::util::frame;
use tracing::{debug, info};

use crate::error::EncoderError;
use crate::hw::{HwAccel, SharedDevice, SurfacePoolSpec};

fn hw_error(what: &str, code: i32) -> EncoderError {
    EncoderError::Hardware(format!("{what}: {}", ffmpeg::Error::from(code)))
}

/// Reference to an `AVHWDeviceContext`.
pub struct Device {
    raw: *mut ffi::AVBufferRef,
}

// SAFETY: device contexts are reference counted by libav and safe to
// reference from any thread; this wrapper only hands out new references.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    fn create(accel: HwAccel) -> Result<Self, EncoderError> {
        let kind = match accel {
            HwAccel::Vaapi => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
        };
        let mut raw = ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer; a null device string picks
        // the default render node.
        let ret = unsafe { ffi::av_hwdevice_ctx_create(&mut raw, kind, ptr::null(), ptr::null_mut(), 0) };
        if ret < 0 {
            return Err(hw_error("failed to create a VAAPI device", ret));
        }
        info!(accel = accel.name(), "hardware device created");
        Ok(Self { raw })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // SAFETY: `raw` came from av_hwdevice_ctx_create and is released once.
        unsafe { ffi::av_buffer_unref(&mut self.raw) };
        debug!("hardware device released");
    }
}

static DEVICE: SharedDevice<Device> = SharedDevice::new();

pub(super) fn shared_device(accel: HwAccel) -> Result<Arc<Device>, EncoderError> {
    DEVICE.get_or_try_init(|| Device::create(accel))
}

/// Drop the process-wide device reference. Sessions still open keep the
/// device alive until they close.
pub fn release_shared_device() -> bool {
    DEVICE.teardown()
}

/// Reference to an initialized `AVHWFramesContext`.
pub(super) struct FramesContext {
    raw: *mut ffi::AVBufferRef,
}

impl FramesContext {
    pub(super) fn new(device: &Device, spec: &SurfacePoolSpec) -> Result<Self, EncoderError> {
        // SAFETY: `device.raw` is a live device reference.
        let raw = unsafe { ffi::av_hwframe_ctx_alloc(device.raw) };
        if raw.is_null() {
            return Err(EncoderError::Hardware("failed to create VAAPI frame context".into()));
        }
        let frames = Self { raw };
        // SAFETY: `raw` was just allocated; its data is an AVHWFramesContext
        // that may be configured until av_hwframe_ctx_init.
        let ret = unsafe {
            let ctx = (*raw).data as *mut ffi::AVHWFramesContext;
            (*ctx).format = ffi::AVPixelFormat::AV_PIX_FMT_VAAPI;
            (*ctx).sw_format = ffi::AVPixelFormat::AV_PIX_FMT_NV12;
            (*ctx).width = spec.width as i32;
            (*ctx).height = spec.height as i32;
            (*ctx).initial_pool_size = spec.pool_size as i32;
            ffi::av_hwframe_ctx_init(raw)
        };
        if ret < 0 {
            return Err(hw_error("failed to initialize VAAPI frame context", ret));
        }
        debug!(
            width = spec.width,
            height = spec.height,
            pool = spec.pool_size,
            "surface pool ready"
        );
        Ok(frames)
    }

    /// Bind the pool to a codec context before it is opened.
    pub(super) fn attach(
        &self,
        ctx: &mut ffmpeg::codec::encoder::video::Video,
    ) -> Result<(), EncoderError> {
        // SAFETY: takes a new reference owned by the codec context, which
        // releases it when freed.
        unsafe {
            let reference = ffi::av_buffer_ref(self.raw);
            if reference.is_null() {
                return Err(EncoderError::Hardware("failed to reference frame context".into()));
            }
            (*ctx.as_mut_ptr()).hw_frames_ctx = reference;
        }
        Ok(())
    }

    /// Copy a software NV12 frame into a fresh surface from the pool.
    pub(super) fn upload(&self, src: &frame::Video) -> Result<frame::Video, EncoderError> {
        let mut surface = frame::Video::empty();
        // SAFETY: `surface` is an empty frame owned here; `src` is a valid
        // software frame matching the pool's sw_format and size.
        unsafe {
            let ret = ffi::av_hwframe_get_buffer(self.raw, surface.as_mut_ptr(), 0);
            if ret < 0 {
                return Err(hw_error("failed to get a surface from the pool", ret));
            }
            if (*surface.as_ptr()).hw_frames_ctx.is_null() {
                return Err(EncoderError::Hardware("surface has no frame context".into()));
            }
            let ret = ffi::av_hwframe_transfer_data(surface.as_mut_ptr(), src.as_ptr(), 0);
            if ret < 0 {
                return Err(hw_error("error transferring frame data to surface", ret));
            }
        }
        Ok(surface)
    }
}

impl Drop for FramesContext {
    fn drop(&mut self) {
        // SAFETY: `raw` is owned by this wrapper and released once.
        unsafe { ffi::av_buffer_unref(&mut self.raw) };
    }
}
