//! Perceptual screenshot comparison.
//!
//! Both images are cropped to their common top-left region (never scaled) and
//! compared pixel by pixel in YIQ space. Pixels that only differ because of
//! anti-aliasing are tolerated and drawn yellow in the diff image; real
//! differences are drawn red on a faded copy of the first image.

use image::{imageops, Rgba, RgbaImage};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Largest possible YIQ delta between two colours.
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Result of comparing two screenshots
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    /// Number of differing pixels
    pub pixels: u64,

    /// Differing pixels as a percentage of the compared area
    pub percentage: f64,

    /// Width of the compared (cropped) region
    pub width: u32,

    /// Height of the compared (cropped) region
    pub height: u32,

    /// Where the diff image was written
    pub diff_path: PathBuf,
}

impl DiffOutcome {
    pub fn is_identical(&self) -> bool {
        self.pixels == 0
    }
}

/// Configuration for the diff engine
#[derive(Debug, Clone, Copy)]
pub struct DiffConfig {
    /// Per-pixel sensitivity on a 0-1 scale; smaller is stricter
    pub threshold: f64,

    /// Opacity of the unchanged background in the diff image
    pub alpha: f64,

    /// Count anti-aliased pixels as differences
    pub include_anti_aliased: bool,

    pub diff_color: [u8; 3],
    pub anti_aliased_color: [u8; 3],
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            alpha: 0.1,
            include_anti_aliased: false,
            diff_color: [255, 0, 0],
            anti_aliased_color: [255, 255, 0],
        }
    }
}

/// Screenshot diff engine
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDiffer {
    config: DiffConfig,
}

impl ImageDiffer {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        Self::new(DiffConfig {
            threshold,
            ..Default::default()
        })
    }

    /// Compare two PNG files and write the diff image to `out_path`.
    pub fn diff_files(&self, before: &Path, after: &Path, out_path: &Path) -> E2eResult<DiffOutcome> {
        let a = decode(before)?;
        let b = decode(after)?;
        let (diff, pixels) = self.compare(&a, &b);

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        diff.save(out_path)?;

        let (width, height) = diff.dimensions();
        let area = u64::from(width) * u64::from(height);
        let percentage = if area == 0 {
            0.0
        } else {
            pixels as f64 * 100.0 / area as f64
        };

        debug!(
            "Diff {} vs {}: {} pixel(s) ({:.4}%) over {}x{}",
            before.display(),
            after.display(),
            pixels,
            percentage,
            width,
            height
        );

        Ok(DiffOutcome {
            pixels,
            percentage,
            width,
            height,
            diff_path: out_path.to_path_buf(),
        })
    }

    /// Compare two decoded images over their common region.
    ///
    /// Returns the diff image and the number of differing pixels.
    pub fn compare(&self, a: &RgbaImage, b: &RgbaImage) -> (RgbaImage, u64) {
        let width = a.width().min(b.width());
        let height = a.height().min(b.height());
        let a = crop(a, width, height);
        let b = crop(b, width, height);

        let mut out = RgbaImage::new(width, height);

        if a.as_raw() == b.as_raw() {
            for (x, y, px) in a.enumerate_pixels() {
                out.put_pixel(x, y, gray_pixel(px, self.config.alpha));
            }
            return (out, 0);
        }

        let max_delta = MAX_YIQ_DELTA * self.config.threshold * self.config.threshold;
        let mut diff = 0u64;

        for y in 0..height {
            for x in 0..width {
                let pa = a.get_pixel(x, y);
                let pb = b.get_pixel(x, y);
                let delta = color_delta(pa, pb, false);

                if delta.abs() > max_delta {
                    let aa = !self.config.include_anti_aliased
                        && (anti_aliased(&a, x, y, &b) || anti_aliased(&b, x, y, &a));
                    if aa {
                        out.put_pixel(x, y, solid(self.config.anti_aliased_color));
                    } else {
                        out.put_pixel(x, y, solid(self.config.diff_color));
                        diff += 1;
                    }
                } else {
                    out.put_pixel(x, y, gray_pixel(pa, self.config.alpha));
                }
            }
        }

        (out, diff)
    }
}

fn decode(path: &Path) -> E2eResult<RgbaImage> {
    image::open(path)
        .map(|img| img.to_rgba8())
        .map_err(|source| E2eError::DecodeFailure {
            path: path.to_path_buf(),
            source,
        })
}

fn crop(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        img.clone()
    } else {
        imageops::crop_imm(img, 0, 0, width, height).to_image()
    }
}

fn solid([r, g, b]: [u8; 3]) -> Rgba<u8> {
    Rgba([r, g, b, 255])
}

fn gray_pixel(px: &Rgba<u8>, alpha: f64) -> Rgba<u8> {
    let [r, g, b, a] = px.0;
    let y = rgb2y(f64::from(r), f64::from(g), f64::from(b));
    let v = blend(y, alpha * f64::from(a) / 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba([v, v, v, 255])
}

fn blend(c: f64, a: f64) -> f64 {
    255.0 + (c - 255.0) * a
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

/// Alpha-blend against white, as the screenshots are opaque in practice.
fn opaque(px: &Rgba<u8>) -> (f64, f64, f64) {
    let [r, g, b, a] = px.0;
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    if a < 255 {
        let a = f64::from(a) / 255.0;
        (blend(r, a), blend(g, a), blend(b, a))
    } else {
        (r, g, b)
    }
}

/// Signed perceptual distance between two pixels.
///
/// Negative when the first pixel is brighter. With `y_only` only the
/// brightness difference is returned.
fn color_delta(pa: &Rgba<u8>, pb: &Rgba<u8>, y_only: bool) -> f64 {
    if pa == pb {
        return 0.0;
    }
    let (r1, g1, b1) = opaque(pa);
    let (r2, g2, b2) = opaque(pb);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;
    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

fn neighbourhood(x: u32, y: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    (
        x.saturating_sub(1),
        y.saturating_sub(1),
        (x + 1).min(width - 1),
        (y + 1).min(height - 1),
    )
}

/// Whether the pixel at (x, y) in `img` looks like an anti-aliased edge that
/// also exists in `other`.
fn anti_aliased(img: &RgbaImage, x1: u32, y1: u32, other: &RgbaImage) -> bool {
    let (width, height) = img.dimensions();
    let (x0, y0, x2, y2) = neighbourhood(x1, y1, width, height);
    let centre = img.get_pixel(x1, y1);

    let mut zeroes = u32::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let delta = color_delta(centre, img.get_pixel(x, y), true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (x, y);
            } else if delta > max {
                max = delta;
                max_at = (x, y);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_at.0, min_at.1) && has_many_siblings(other, min_at.0, min_at.1))
        || (has_many_siblings(img, max_at.0, max_at.1)
            && has_many_siblings(other, max_at.0, max_at.1))
}

/// Whether at least three neighbours share this pixel's exact colour.
fn has_many_siblings(img: &RgbaImage, x1: u32, y1: u32) -> bool {
    let (width, height) = img.dimensions();
    let (x0, y0, x2, y2) = neighbourhood(x1, y1, width, height);
    let centre = img.get_pixel(x1, y1);

    let mut zeroes = u32::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            if img.get_pixel(x, y) == centre {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}
