//! Pixel formats and the software BGR → YUV converter.
//!
//! | Format    | Layout                                   | Bytes (w×h)          |
//! |-----------|------------------------------------------|----------------------|
//! | `Bgr24`   | packed B,G,R                             | 3·w·h                |
//! | `Yuv420p` | Y plane, U plane, V plane (2×2 chroma)   | w·h + 2·⌈w/2⌉·⌈h/2⌉  |
//! | `Nv12`    | Y plane, interleaved UV plane            | w·h + 2·⌈w/2⌉·⌈h/2⌉  |
//! | `Vaapi`   | opaque device surface                    | n/a                  |
//!
//! Colour math is BT.601 limited range, the default of most encoders.

use crate::error::EncoderError;

/// Pixel layouts the pipeline deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgr24,
    Yuv420p,
    Nv12,
    /// Device-resident VAAPI surface.
    Vaapi,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Vaapi => "vaapi",
        }
    }

    /// Whether frames of this format live on a hardware device.
    pub fn is_hardware(self) -> bool {
        matches!(self, PixelFormat::Vaapi)
    }

    /// Size of a tightly packed frame, `None` for device formats.
    pub fn buffer_size(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        match self {
            PixelFormat::Bgr24 => Some(w * h * 3),
            PixelFormat::Yuv420p | PixelFormat::Nv12 => Some(w * h + 2 * chroma),
            PixelFormat::Vaapi => None,
        }
    }
}

/// Source and destination geometry for one conversion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionSpec {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub dst_format: PixelFormat,
}

impl ConversionSpec {
    /// Input length; the source is always packed BGR.
    pub fn src_len(&self) -> usize {
        PixelFormat::Bgr24
            .buffer_size(self.src_width, self.src_height)
            .unwrap_or(0)
    }

    pub fn dst_len(&self) -> Option<usize> {
        self.dst_format.buffer_size(self.dst_width, self.dst_height)
    }
}

// ── SoftwareConverter ────────────────────────────────────────────

/// Nearest-neighbour scaler fused with BGR → YUV 4:2:0 conversion
/// (planar or NV12).
///
/// Sampling tables are computed once at construction; `convert` only
/// walks them.
#[derive(Debug, Clone)]
pub struct SoftwareConverter {
    spec: ConversionSpec,
    dst_len: usize,
    /// Source byte offset of each destination column.
    x_map: Vec<usize>,
    /// Source row index of each destination row.
    y_map: Vec<usize>,
}

impl SoftwareConverter {
    pub fn new(spec: ConversionSpec) -> Result<Self, EncoderError> {
        if spec.src_width == 0 || spec.src_height == 0 || spec.dst_width == 0 || spec.dst_height == 0
        {
            return Err(EncoderError::Conversion(format!(
                "degenerate geometry {}x{} -> {}x{}",
                spec.src_width, spec.src_height, spec.dst_width, spec.dst_height
            )));
        }
        let dst_len = match spec.dst_format {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => spec
                .dst_len()
                .ok_or_else(|| EncoderError::Conversion("unsized destination".into()))?,
            PixelFormat::Bgr24 | PixelFormat::Vaapi => {
                return Err(EncoderError::Conversion(format!(
                    "no software conversion into {}",
                    spec.dst_format.name()
                )));
            }
        };
        let x_map = sample_map(spec.src_width, spec.dst_width)
            .into_iter()
            .map(|x| x * 3)
            .collect();
        let y_map = sample_map(spec.src_height, spec.dst_height);
        Ok(Self {
            spec,
            dst_len,
            x_map,
            y_map,
        })
    }

    pub fn dst_len(&self) -> usize {
        self.dst_len
    }

    /// Convert one packed BGR frame into `dst`.
    pub fn convert(&self, src: &[u8], dst: &mut [u8]) -> Result<(), EncoderError> {
        let expected = self.spec.src_len();
        if src.len() != expected {
            return Err(EncoderError::FrameSize {
                expected,
                actual: src.len(),
            });
        }
        if dst.len() < self.dst_len {
            return Err(EncoderError::Conversion(format!(
                "destination buffer too small: {} < {}",
                dst.len(),
                self.dst_len
            )));
        }
        let interleaved = self.spec.dst_format == PixelFormat::Nv12;
        self.to_yuv(src, dst, interleaved);
        Ok(())
    }

    fn sample(&self, src: &[u8], dx: usize, dy: usize) -> (i32, i32, i32) {
        let row = self.y_map[dy] * self.spec.src_width as usize * 3;
        let at = row + self.x_map[dx];
        (src[at + 2] as i32, src[at + 1] as i32, src[at] as i32)
    }

    fn to_yuv(&self, src: &[u8], dst: &mut [u8], interleaved: bool) {
        let (w, h) = (self.x_map.len(), self.y_map.len());
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let (luma, chroma) = dst.split_at_mut(w * h);

        for dy in 0..h {
            for dx in 0..w {
                let (r, g, b) = self.sample(src, dx, dy);
                luma[dy * w + dx] = luma_of(r, g, b);
            }
        }

        for cy in 0..ch {
            for cx in 0..cw {
                let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                for dy in (cy * 2)..(cy * 2 + 2).min(h) {
                    for dx in (cx * 2)..(cx * 2 + 2).min(w) {
                        let px = self.sample(src, dx, dy);
                        r += px.0;
                        g += px.1;
                        b += px.2;
                        n += 1;
                    }
                }
                let (r, g, b) = ((r + n / 2) / n, (g + n / 2) / n, (b + n / 2) / n);
                let (u, v) = chroma_of(r, g, b);
                let i = cy * cw + cx;
                if interleaved {
                    chroma[i * 2] = u;
                    chroma[i * 2 + 1] = v;
                } else {
                    chroma[i] = u;
                    chroma[cw * ch + i] = v;
                }
            }
        }
    }
}

fn sample_map(src: u32, dst: u32) -> Vec<usize> {
    (0..dst as usize)
        .map(|d| d * src as usize / dst as usize)
        .collect()
}

fn luma_of(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn chroma_of(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, bgr: [u8; 3]) -> Vec<u8> {
        bgr.iter()
            .copied()
            .cycle()
            .take((w * h * 3) as usize)
            .collect()
    }

    fn spec(sw: u32, sh: u32, dw: u32, dh: u32, fmt: PixelFormat) -> ConversionSpec {
        ConversionSpec {
            src_width: sw,
            src_height: sh,
            dst_width: dw,
            dst_height: dh,
            dst_format: fmt,
        }
    }

    #[test]
    fn buffer_sizes() {
        assert_eq!(PixelFormat::Bgr24.buffer_size(4, 2), Some(24));
        assert_eq!(PixelFormat::Yuv420p.buffer_size(4, 4), Some(24));
        assert_eq!(PixelFormat::Nv12.buffer_size(3, 3), Some(9 + 8));
        assert_eq!(PixelFormat::Vaapi.buffer_size(4, 4), None);
    }

    #[test]
    fn white_and_black_hit_limited_range() {
        let conv = SoftwareConverter::new(spec(4, 4, 4, 4, PixelFormat::Yuv420p)).unwrap();
        let mut out = vec![0u8; conv.dst_len()];

        conv.convert(&solid(4, 4, [255, 255, 255]), &mut out).unwrap();
        assert!(out[..16].iter().all(|&y| y == 235));
        assert!(out[16..].iter().all(|&c| c == 128));

        conv.convert(&solid(4, 4, [0, 0, 0]), &mut out).unwrap();
        assert!(out[..16].iter().all(|&y| y == 16));
    }

    #[test]
    fn red_planar_and_interleaved() {
        let red = solid(2, 2, [0, 0, 255]);

        let planar = SoftwareConverter::new(spec(2, 2, 2, 2, PixelFormat::Yuv420p)).unwrap();
        let mut out = vec![0u8; planar.dst_len()];
        planar.convert(&red, &mut out).unwrap();
        assert_eq!(out, vec![82, 82, 82, 82, 90, 240]);

        let nv12 = SoftwareConverter::new(spec(2, 2, 2, 2, PixelFormat::Nv12)).unwrap();
        let mut out = vec![0u8; nv12.dst_len()];
        nv12.convert(&red, &mut out).unwrap();
        assert_eq!(out, vec![82, 82, 82, 82, 90, 240]);
    }

    #[test]
    fn downscale_samples_top_left() {
        // 4x2 source: left half black, right half white
        let mut src = Vec::new();
        for _row in 0..2 {
            src.extend_from_slice(&solid(2, 1, [0, 0, 0]));
            src.extend_from_slice(&solid(2, 1, [255, 255, 255]));
        }
        let conv = SoftwareConverter::new(spec(4, 2, 2, 2, PixelFormat::Yuv420p)).unwrap();
        let mut out = vec![0u8; conv.dst_len()];
        conv.convert(&src, &mut out).unwrap();
        assert_eq!(&out[..4], &[16, 235, 16, 235]);
    }

    #[test]
    fn wrong_input_size_rejected() {
        let conv = SoftwareConverter::new(spec(4, 4, 2, 2, PixelFormat::Yuv420p)).unwrap();
        let mut out = vec![0u8; conv.dst_len()];
        let err = conv.convert(&[0u8; 10], &mut out).unwrap_err();
        assert!(matches!(
            err,
            EncoderError::FrameSize {
                expected: 48,
                actual: 10
            }
        ));
    }

    #[test]
    fn non_yuv_targets_rejected() {
        assert!(SoftwareConverter::new(spec(4, 4, 4, 4, PixelFormat::Vaapi)).is_err());
        assert!(SoftwareConverter::new(spec(4, 4, 2, 2, PixelFormat::Bgr24)).is_err());
        assert!(SoftwareConverter::new(spec(0, 4, 4, 4, PixelFormat::Nv12)).is_err());
    }
}
