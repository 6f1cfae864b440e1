//! Test pattern for simulated frames.
//!
//! A diagonal gradient with a bright spot that walks around the centre, one
//! step per frame, plus seeded noise. Pixel `(0, 0)` is always dark and the
//! spot makes consecutive frames differ even without noise.

use crate::rng::MockRng;

/// Peak noise added to every pixel.
pub const NOISE_AMPLITUDE: i32 = 256;

const SPOT_RADIUS: f64 = 3.0;
const SPOT_LEVEL: f64 = 32768.0;

/// Row-major `u16` pixels for frame `frame_number`.
pub fn generate_pattern(width: u32, height: u32, frame_number: u64, rng: &MockRng) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut noise = vec![0i32; w * h];
    rng.fill_noise(&mut noise, NOISE_AMPLITUDE);

    let (sx, sy) = spot_centre(width, height, frame_number);
    let span = (w + h).saturating_sub(2).max(1) as f64;

    let mut pixels = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let gradient = (x + y) as f64 / span * 49152.0;
            let d2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
            let spot = SPOT_LEVEL * (-d2 / (2.0 * SPOT_RADIUS * SPOT_RADIUS)).exp();
            let value = if x == 0 && y == 0 {
                0.0
            } else {
                gradient + spot + noise[y * w + x] as f64
            };
            pixels.push(value.clamp(0.0, 65535.0) as u16);
        }
    }
    pixels
}

/// Where the spot sits in frame `frame_number`: 32 steps per orbit.
fn spot_centre(width: u32, height: u32, frame_number: u64) -> (f64, f64) {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let radius = width.min(height) as f64 / 4.0;
    let angle = (frame_number % 32) as f64 * std::f64::consts::TAU / 32.0;
    (cx + radius * angle.cos(), cy + radius * angle.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_size_and_origin() {
        let pixels = generate_pattern(16, 8, 0, &MockRng::new(Some(1)));
        assert_eq!(pixels.len(), 16 * 8);
        assert_eq!(pixels[0], 0);
    }

    #[test]
    fn test_same_seed_same_frame() {
        let a = generate_pattern(32, 32, 5, &MockRng::new(Some(9)));
        let b = generate_pattern(32, 32, 5, &MockRng::new(Some(9)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_spot_moves_between_frames() {
        assert_ne!(spot_centre(64, 64, 0), spot_centre(64, 64, 1));
        assert_eq!(spot_centre(64, 64, 3), spot_centre(64, 64, 35));
    }
}
