//! Quad-to-quad projective image transform: compute the matrix mapping a
//! source rectangle onto an arbitrary destination quadrilateral, rasterize
//! the quad's coverage with anti-aliasing, and bilinearly resample the
//! source image into each covered destination pixel.

use canvas_image::ImageBuffer;
use canvas_pixels::{composite_pixel, BlendMode, Pixel};

/// Scratch buffer reused across `draw_transformed` calls so the hot path
/// doesn't allocate. Owned by the caller (mirrors the engine's draw
/// context, which is exclusively owned by whichever thread is running a
/// single `handle()` call).
#[derive(Debug)]
pub struct TransformScratch {
    buffer: Vec<Pixel>,
}

pub const TRANSFORM_BUFFER_SIZE: usize = 2048;

/// Bounding-box area beyond which a transform is refused rather than
/// rasterized; stands in for the source engine's raster-memory-pool cap
/// now that rasterization no longer needs a growable external pool (see
/// `DESIGN.md`).
pub const TRANSFORM_MAX_AREA: u64 = (canvas_model::MAX_CANVAS_DIMENSION as u64).pow(2);

impl Default for TransformScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformScratch {
    pub fn new() -> Self {
        Self {
            buffer: vec![Pixel::TRANSPARENT; TRANSFORM_BUFFER_SIZE],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformError {
    DegenerateQuad,
    ResourceExhausted,
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::DegenerateQuad => write!(f, "degenerate destination quad"),
            TransformError::ResourceExhausted => {
                write!(f, "transform rasterization exceeded its area budget")
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// Row-major 3x3 projective matrix: `(X, Y) = ((a*x+b*y+c)/w, (d*x+e*y+f)/w)`
/// with `w = g*x+h*y+i`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix3 {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    g: f64,
    h: f64,
    i: f64,
}

impl Matrix3 {
    const IDENTITY: Matrix3 = Matrix3 {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        e: 1.0,
        f: 0.0,
        g: 0.0,
        h: 0.0,
        i: 1.0,
    };

    fn apply(&self, x: f64, y: f64) -> (f64, f64, f64) {
        let w = self.g * x + self.h * y + self.i;
        (self.a * x + self.b * y + self.c, self.d * x + self.e * y + self.f, w)
    }

    fn map_point(&self, x: f64, y: f64) -> (f64, f64) {
        let (px, py, w) = self.apply(x, y);
        if w == 0.0 {
            (px, py)
        } else {
            (px / w, py / w)
        }
    }

    fn determinant(&self) -> f64 {
        self.a * (self.e * self.i - self.f * self.h) - self.b * (self.d * self.i - self.f * self.g)
            + self.c * (self.d * self.h - self.e * self.g)
    }

    fn invert(&self) -> Option<Matrix3> {
        let det = self.determinant();
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        Some(Matrix3 {
            a: (self.e * self.i - self.f * self.h) * inv_det,
            b: (self.c * self.h - self.b * self.i) * inv_det,
            c: (self.b * self.f - self.c * self.e) * inv_det,
            d: (self.f * self.g - self.d * self.i) * inv_det,
            e: (self.a * self.i - self.c * self.g) * inv_det,
            f: (self.c * self.d - self.a * self.f) * inv_det,
            g: (self.d * self.h - self.e * self.g) * inv_det,
            h: (self.b * self.g - self.a * self.h) * inv_det,
            i: (self.a * self.e - self.b * self.d) * inv_det,
        })
    }
}

/// Builds the matrix mapping the unit square `(0,0)-(1,0)-(1,1)-(0,1)` onto
/// `quad`, using the standard (Heckbert) perspective-quad construction.
fn unit_square_to_quad(quad: [(f64, f64); 4]) -> Option<Matrix3> {
    let [(x0, y0), (x1, y1), (x2, y2), (x3, y3)] = quad;

    let dx1 = x1 - x2;
    let dx2 = x3 - x2;
    let dx3 = x0 - x1 + x2 - x3;
    let dy1 = y1 - y2;
    let dy2 = y3 - y2;
    let dy3 = y0 - y1 + y2 - y3;

    if dx3.abs() < 1e-12 && dy3.abs() < 1e-12 {
        // Pure affine case: no perspective term needed.
        Some(Matrix3 {
            a: x1 - x0,
            b: x2 - x1,
            c: x0,
            d: y1 - y0,
            e: y2 - y1,
            f: y0,
            g: 0.0,
            h: 0.0,
            i: 1.0,
        })
    } else {
        let denom = dx1 * dy2 - dy1 * dx2;
        if denom.abs() < 1e-12 {
            return None;
        }
        let g = (dx3 * dy2 - dx2 * dy3) / denom;
        let h = (dx1 * dy3 - dx3 * dy1) / denom;
        Some(Matrix3 {
            a: x1 - x0 + g * x1,
            b: x3 - x0 + h * x3,
            c: x0,
            d: y1 - y0 + g * y1,
            e: y3 - y0 + h * y3,
            f: y0,
            g,
            h,
            i: 1.0,
        })
    }
}

/// The forward (source-pixel to destination-pixel) and inverse
/// (destination-pixel to source-pixel) matrices for a quad-to-quad warp.
#[derive(Debug, Clone, Copy)]
pub struct ProjectiveTransform {
    forward: Matrix3,
    inverse: Matrix3,
}

impl ProjectiveTransform {
    /// `src_w`/`src_h` is the full source rectangle (always the whole
    /// source image per the engine's REGION_MOVE semantics); `dst_quad` is
    /// the destination quadrilateral in canvas pixel coordinates, corners
    /// given in the order top-left, top-right, bottom-right, bottom-left.
    pub fn quad_to_quad(src_w: f64, src_h: f64, dst_quad: [(f64, f64); 4]) -> Result<Self, TransformError> {
        let unit_to_dst = unit_square_to_quad(dst_quad).ok_or(TransformError::DegenerateQuad)?;
        if src_w <= 0.0 || src_h <= 0.0 {
            return Err(TransformError::DegenerateQuad);
        }
        // Source pixel -> unit square -> destination.
        let forward = Matrix3 {
            a: unit_to_dst.a / src_w,
            b: unit_to_dst.b / src_h,
            c: unit_to_dst.c,
            d: unit_to_dst.d / src_w,
            e: unit_to_dst.e / src_h,
            f: unit_to_dst.f,
            g: unit_to_dst.g / src_w,
            h: unit_to_dst.h / src_h,
            i: unit_to_dst.i,
        };

        // Nudge the perspective row by a tiny delta before inverting, the
        // way the reference engine avoids an exact singularity for affine
        // (g=h=0) transforms without perturbing the visible result.
        const DELTA: f64 = 1.0 / 65536.0;
        let perturbed = Matrix3 {
            g: forward.g + DELTA,
            h: forward.h + DELTA,
            ..forward
        };
        let inverse = perturbed.invert().ok_or(TransformError::DegenerateQuad)?;
        Ok(ProjectiveTransform { forward, inverse })
    }

    /// Identity transform over a `w x h` rectangle (source == destination).
    pub fn identity(_w: f64, _h: f64) -> Self {
        ProjectiveTransform {
            forward: Matrix3::IDENTITY,
            inverse: Matrix3::IDENTITY,
        }
    }

}

fn clamp_bounds(v1: i64, lo: i64, hi_inclusive: i64) -> (i64, i64) {
    if v1 < lo {
        (lo, lo)
    } else if v1 >= hi_inclusive {
        (hi_inclusive, hi_inclusive)
    } else {
        (v1, v1 + 1)
    }
}

fn interpolate_word(x: u32, a: u32, y: u32, b: u32) -> u32 {
    let mut t = (x & 0x00ff_00ff) * a + (y & 0x00ff_00ff) * b;
    t >>= 8;
    t &= 0x00ff_00ff;
    let mut top = ((x >> 8) & 0x00ff_00ff) * a + ((y >> 8) & 0x00ff_00ff) * b;
    top &= 0xff00_ff00;
    top |= t;
    top
}

fn interpolate_4(tl: u32, tr: u32, bl: u32, br: u32, distx: u32, disty: u32) -> u32 {
    let idistx = 256 - distx;
    let idisty = 256 - disty;
    let top = interpolate_word(tl, idistx, tr, distx);
    let bot = interpolate_word(bl, idistx, br, distx);
    interpolate_word(top, idisty, bot, disty)
}

/// Bilinearly samples `src` at floating-point source coordinates, clamping
/// to the source edges (no wraparound).
fn sample_bilinear(src: &ImageBuffer, px: f64, py: f64) -> Pixel {
    let width = src.width() as i64;
    let height = src.height() as i64;
    let x1f = (px - 0.5).floor();
    let y1f = (py - 0.5).floor();
    let distx = (((px - 0.5) - x1f) * 256.0) as u32;
    let disty = (((py - 0.5) - y1f) * 256.0) as u32;

    let (x1, x2) = clamp_bounds(x1f as i64, 0, width - 1);
    let (y1, y2) = clamp_bounds(y1f as i64, 0, height - 1);

    let tl = src.get(x1 as u32, y1 as u32).0;
    let tr = src.get(x2 as u32, y1 as u32).0;
    let bl = src.get(x1 as u32, y2 as u32).0;
    let br = src.get(x2 as u32, y2 as u32).0;
    Pixel(interpolate_4(tl, tr, bl, br, distx.min(256), disty.min(256)))
}

/// Signed area test: returns > 0 if `(px,py)` is on the quad's interior
/// side of every edge (works for either winding order as long as it is
/// consistent, since we compare against the sign of the first edge).
fn point_in_quad(quad: &[(f64, f64); 4], px: f64, py: f64) -> bool {
    let mut sign = 0.0;
    for idx in 0..4 {
        let (ax, ay) = quad[idx];
        let (bx, by) = quad[(idx + 1) % 4];
        let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
        if sign == 0.0 {
            sign = cross;
        } else if cross != 0.0 && cross.signum() != sign.signum() {
            return false;
        }
    }
    true
}

const SUPERSAMPLE: u32 = 4;

/// A run of destination pixels on one scanline sharing the same coverage.
struct Span {
    x: i64,
    y: i64,
    len: i64,
    coverage: u8,
}

fn rasterize_quad(quad: &[(f64, f64); 4], clip_w: i64, clip_h: i64) -> Vec<Span> {
    let xs: Vec<f64> = quad.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = quad.iter().map(|p| p.1).collect();
    let x0 = (xs.iter().cloned().fold(f64::INFINITY, f64::min)).floor().max(0.0) as i64;
    let x1 = (xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)).ceil().min(clip_w as f64) as i64;
    let y0 = (ys.iter().cloned().fold(f64::INFINITY, f64::min)).floor().max(0.0) as i64;
    let y1 = (ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max)).ceil().min(clip_h as f64) as i64;

    let mut spans = Vec::new();
    for y in y0..y1 {
        let mut run_start: Option<i64> = None;
        let mut run_coverage: u8 = 0;
        for x in x0..x1 {
            let mut hits = 0u32;
            for sy in 0..SUPERSAMPLE {
                let py = y as f64 + (sy as f64 + 0.5) / SUPERSAMPLE as f64;
                for sx in 0..SUPERSAMPLE {
                    let px = x as f64 + (sx as f64 + 0.5) / SUPERSAMPLE as f64;
                    if point_in_quad(quad, px, py) {
                        hits += 1;
                    }
                }
            }
            let coverage = ((hits * 255) / (SUPERSAMPLE * SUPERSAMPLE)) as u8;
            match (run_start, coverage) {
                (Some(_), c) if c == run_coverage => {}
                (Some(start), 0) => {
                    spans.push(Span {
                        x: start,
                        y,
                        len: x - start,
                        coverage: run_coverage,
                    });
                    run_start = None;
                }
                (Some(start), c) => {
                    spans.push(Span {
                        x: start,
                        y,
                        len: x - start,
                        coverage: run_coverage,
                    });
                    run_start = Some(x);
                    run_coverage = c;
                }
                (None, 0) => {}
                (None, c) => {
                    run_start = Some(x);
                    run_coverage = c;
                }
            }
        }
        if let Some(start) = run_start {
            spans.push(Span {
                x: start,
                y,
                len: x1 - start,
                coverage: run_coverage,
            });
        }
    }
    spans
}

/// Warps `src` (its full extent) into `dst_quad` within `dst`, alpha
/// compositing under NORMAL mode with each span's anti-aliased coverage as
/// opacity. `dst_quad` corners must be within `(dst.width()+1) *
/// (dst.height()+1)` of the destination per the engine's REGION_MOVE
/// bounds check (enforced by the caller).
pub fn draw_transformed(
    dst: &mut ImageBuffer,
    src: &ImageBuffer,
    dst_quad: [(f64, f64); 4],
    scratch: &mut TransformScratch,
) -> Result<(), TransformError> {
    let transform = ProjectiveTransform::quad_to_quad(src.width() as f64, src.height() as f64, dst_quad)?;

    let clip_w = dst.width() as i64;
    let clip_h = dst.height() as i64;
    let area = (clip_w as u64) * (clip_h as u64);
    if area > TRANSFORM_MAX_AREA {
        return Err(TransformError::ResourceExhausted);
    }

    let spans = rasterize_quad(&dst_quad, clip_w, clip_h);
    for span in spans {
        if span.coverage == 0 {
            continue;
        }
        let mut remaining = span.len;
        let mut x = span.x;
        while remaining > 0 {
            let chunk = remaining.min(scratch.buffer.len() as i64);
            for (offset, slot) in scratch.buffer[..chunk as usize].iter_mut().enumerate() {
                let dx = x + offset as i64;
                let (sx, sy) = transform.inverse.map_point(dx as f64 + 0.5, span.y as f64 + 0.5);
                *slot = sample_bilinear(src, sx, sy);
            }
            for offset in 0..chunk {
                let dx = (x + offset) as u32;
                let existing = dst.get(dx, span.y as u32);
                let blended = composite_pixel(existing, scratch.buffer[offset as usize], span.coverage, BlendMode::Normal);
                dst.set(dx, span.y as u32, blended);
            }
            x += chunk;
            remaining -= chunk;
        }
    }
    Ok(())
}
