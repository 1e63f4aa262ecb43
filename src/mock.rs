//! Synthetic frames for test mode
//!
//! Produces a hue-cycling background with a white disc orbiting the
//! centre, one frame every 100 ms. No network involved.

use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};

/// Default mock frame width
pub const MOCK_WIDTH: u32 = 640;

/// Default mock frame height
pub const MOCK_HEIGHT: u32 = 480;

/// Default delay between mock frames
pub const MOCK_FRAME_INTERVAL: Duration = Duration::from_millis(100);

const ORBIT_RADIUS: f32 = 100.0;
const DISC_RADIUS: f32 = 30.0;

/// Generator for mock video frames
#[derive(Debug, Clone)]
pub struct MockFrameGenerator {
    pub width: u32,
    pub height: u32,
    pub interval: Duration,
}

impl MockFrameGenerator {
    pub fn new() -> Self {
        Self {
            width: MOCK_WIDTH,
            height: MOCK_HEIGHT,
            interval: MOCK_FRAME_INTERVAL,
        }
    }

    /// Render frame number `index`
    pub fn render(&self, index: u64) -> DynamicImage {
        let hue = ((index + 1) * 2 % 360) as f32;
        let background = hsv_to_rgb(hue, 0.7, 0.5);

        let angle = ((index * 5) % 360) as f32;
        let cx = self.width as f32 / 2.0 + angle.to_radians().cos() * ORBIT_RADIUS;
        let cy = self.height as f32 / 2.0 + angle.to_radians().sin() * ORBIT_RADIUS;

        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy <= DISC_RADIUS * DISC_RADIUS {
                Rgb([255, 255, 255])
            } else {
                background
            }
        });
        DynamicImage::ImageRgb8(image)
    }
}

impl Default for MockFrameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// HSV (hue in degrees, saturation and value in 0..=1) to RGB
fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb<u8> {
    let c = value * saturation;
    let h = (hue % 360.0) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = value - c;
    let channel = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([channel(r), channel(g), channel(b)])
}
