//! Hardware acceleration support.
//!
//! A hardware session converts each frame into a software NV12 frame,
//! uploads it into a surface drawn from a pool bound to the codec, and
//! submits the surface. The device context behind the pool is created once
//! per process and shared by every session through [`SharedDevice`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::convert::PixelFormat;

/// Surfaces pre-allocated in each session's pool.
pub const SURFACE_POOL_SIZE: usize = 20;

/// Supported acceleration APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwAccel {
    Vaapi,
}

impl HwAccel {
    /// Detect acceleration from an encoder name such as `h264_vaapi`.
    pub fn from_codec_name(name: &str) -> Option<Self> {
        if name.contains("vaapi") {
            Some(HwAccel::Vaapi)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HwAccel::Vaapi => "vaapi",
        }
    }

    /// Format the codec is opened with.
    pub fn device_format(self) -> PixelFormat {
        match self {
            HwAccel::Vaapi => PixelFormat::Vaapi,
        }
    }

    /// Software layout frames are converted into before upload.
    pub fn upload_format(self) -> PixelFormat {
        match self {
            HwAccel::Vaapi => PixelFormat::Nv12,
        }
    }
}

/// Geometry and formats of a session's surface pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePoolSpec {
    pub accel: HwAccel,
    pub width: u32,
    pub height: u32,
    pub hw_format: PixelFormat,
    pub sw_format: PixelFormat,
    pub pool_size: usize,
}

impl SurfacePoolSpec {
    pub fn new(accel: HwAccel, width: u32, height: u32) -> Self {
        Self {
            accel,
            width,
            height,
            hw_format: accel.device_format(),
            sw_format: accel.upload_format(),
            pool_size: SURFACE_POOL_SIZE,
        }
    }
}

// ── SharedDevice ─────────────────────────────────────────────────

/// Lazily created, process-wide device handle.
///
/// Sessions hold an `Arc` to the device, so [`SharedDevice::teardown`]
/// only drops the process's own reference; the device is released when
/// the last session using it goes away.
pub struct SharedDevice<D> {
    slot: Mutex<Option<Arc<D>>>,
}

impl<D> SharedDevice<D> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
        }
    }

    /// Return the device, creating it on first use.
    ///
    /// A failed `init` leaves the slot empty so a later call can retry.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<D, E>) -> Result<Arc<D>, E> {
        let mut slot = self.slot.lock();
        if let Some(device) = slot.as_ref() {
            return Ok(Arc::clone(device));
        }
        let device = Arc::new(init()?);
        *slot = Some(Arc::clone(&device));
        Ok(device)
    }

    pub fn get(&self) -> Option<Arc<D>> {
        self.slot.lock().clone()
    }

    /// Drop the process-wide reference. Returns whether one was held.
    pub fn teardown(&self) -> bool {
        self.slot.lock().take().is_some()
    }
}

impl<D> Default for SharedDevice<D> {
    fn default() -> Self {
        Self::new()
    }
}
