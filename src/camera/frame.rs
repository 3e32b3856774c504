use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every frame handed out by the camera is in this layout, whatever the backend produced.
pub const CANONICAL_LAYOUT: PixelLayout = PixelLayout::Rgb8;

#[derive(
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PixelLayout {
    /// Packed 8-bit red, green, blue
    Rgb8,
    /// Packed 8-bit blue, green, red
    Bgr8,
    /// Planar YUV 4:2:0, full Y plane followed by quarter size U and V planes
    I420,
}

impl PixelLayout {
    /// Byte length of a single frame in this layout
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelLayout::Rgb8 | PixelLayout::Bgr8 => w * h * 3,
            PixelLayout::I420 => {
                let chroma = ((w + 1) / 2) * ((h + 1) / 2);
                w * h + 2 * chroma
            }
        }
    }
}

/// A frame as delivered by a backend, in whatever layout the backend natively produces.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

/// A frame in the canonical layout.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Convert a backend frame into the canonical layout. Fails rather than guessing when the
/// buffer does not match its declared layout.
pub fn normalize(raw: RawFrame, captured_at: DateTime<Utc>) -> Result<Frame, LayoutError> {
    if raw.width == 0 || raw.height == 0 {
        return Err(LayoutError::EmptyFrame(raw.width, raw.height));
    }
    let expected = raw.layout.frame_len(raw.width, raw.height);
    if raw.data.len() != expected {
        return Err(LayoutError::LengthMismatch(
            raw.layout,
            expected,
            raw.data.len(),
        ));
    }

    let data = match raw.layout {
        PixelLayout::Rgb8 => raw.data,
        PixelLayout::Bgr8 => {
            let mut data = raw.data;
            data.chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
            data
        }
        PixelLayout::I420 => i420_to_rgb(&raw.data, raw.width as usize, raw.height as usize),
    };

    Ok(Frame {
        data,
        width: raw.width,
        height: raw.height,
        captured_at,
    })
}

/// BT.601 full range conversion
fn i420_to_rgb(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let chroma_w = (width + 1) / 2;
    let chroma_h = (height + 1) / 2;
    let (y_plane, rest) = data.split_at(width * height);
    let (u_plane, v_plane) = rest.split_at(chroma_w * chroma_h);

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as f32;
            let chroma_idx = (row / 2) * chroma_w + col / 2;
            let u = u_plane[chroma_idx] as f32 - 128.0;
            let v = v_plane[chroma_idx] as f32 - 128.0;

            let r = y + 1.402 * v;
            let g = y - 0.344_136 * u - 0.714_136 * v;
            let b = y + 1.772 * u;
            rgb.push(clamp_channel(r));
            rgb.push(clamp_channel(g));
            rgb.push(clamp_channel(b));
        }
    }
    rgb
}

fn clamp_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LayoutError {
        EmptyFrame(width: u32, height: u32) {
            display("Frame has no pixels: {}x{}", width, height)
        }
        LengthMismatch(layout: PixelLayout, expected: usize, found: usize) {
            display("{} frame should be {} bytes, got {}", layout, expected, found)
        }
    }
}
