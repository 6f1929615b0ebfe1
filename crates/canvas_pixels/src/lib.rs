//! BGRA8 premultiplied pixels, tile-sized pixel buffers, and the
//! compositing kernels used to blend one tile (or rectangle of pixels)
//! into another.

use canvas_model::TILE_SIZE;

pub const TILE_AREA: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// 32-bit BGRA, premultiplied alpha. The byte order is logical (B, G, R, A);
/// `channels()`/`from_channels()` are the only places that care about the
/// in-memory representation, so a big-endian host only needs to fix those up
/// after a compressed payload is inflated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Pixel(pub u32);

impl Pixel {
    pub const TRANSPARENT: Pixel = Pixel(0);

    #[inline]
    pub const fn from_channels(b: u8, g: u8, r: u8, a: u8) -> Self {
        Pixel(u32::from_le_bytes([b, g, r, a]))
    }

    #[inline]
    pub const fn channels(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub const fn b(self) -> u8 {
        self.channels()[0]
    }
    #[inline]
    pub const fn g(self) -> u8 {
        self.channels()[1]
    }
    #[inline]
    pub const fn r(self) -> u8 {
        self.channels()[2]
    }
    #[inline]
    pub const fn a(self) -> u8 {
        self.channels()[3]
    }

    /// Byte-swaps the 32-bit word read little-endian off the wire/disk into
    /// this host's native order for storage, then back if needed. On a
    /// little-endian host this is a no-op.
    #[inline]
    pub fn from_wire_le(word: u32) -> Self {
        Pixel(u32::from_le(word))
    }
}

fn lerp_channel(a: u8, b: u8, t: u8) -> u8 {
    let a = a as u32;
    let b = b as u32;
    let t = t as u32;
    (((a * (255 - t)) + (b * t)) / 255) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Normal,
    Behind,
    Erase,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Dodge,
    Burn,
    Add,
    Subtract,
    Replace,
}

impl BlendMode {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => BlendMode::Normal,
            1 => BlendMode::Behind,
            2 => BlendMode::Erase,
            3 => BlendMode::Multiply,
            4 => BlendMode::Screen,
            5 => BlendMode::Overlay,
            6 => BlendMode::Darken,
            7 => BlendMode::Lighten,
            8 => BlendMode::Dodge,
            9 => BlendMode::Burn,
            10 => BlendMode::Add,
            11 => BlendMode::Subtract,
            12 => BlendMode::Replace,
            _ => return None,
        })
    }

    /// Whether this mode is valid when drawing brush dabs (DRAW_DABS,
    /// FILL_RECT, PUT_IMAGE all validate against the same predicate).
    pub const fn valid_for_brush(self) -> bool {
        !matches!(self, BlendMode::Behind | BlendMode::Replace)
    }

    /// Whether a fully-transparent source tile can be skipped entirely
    /// under this mode without affecting the destination (used by
    /// `LayerContent::merge`).
    pub const fn source_over_like(self) -> bool {
        matches!(
            self,
            BlendMode::Normal
                | BlendMode::Multiply
                | BlendMode::Screen
                | BlendMode::Overlay
                | BlendMode::Darken
                | BlendMode::Lighten
                | BlendMode::Dodge
                | BlendMode::Burn
                | BlendMode::Add
                | BlendMode::Subtract
                | BlendMode::Erase
        )
    }
}

/// Per-channel blend function operating on premultiplied, opacity-scaled
/// source and destination colors. `sa` is the source alpha already scaled
/// by the span/tile opacity.
fn blend_channel(mode: BlendMode, sc: u32, sa: u32, dc: u32, da: u32) -> u32 {
    let _ = (sa, da);
    match mode {
        BlendMode::Normal | BlendMode::Replace => sc,
        BlendMode::Behind => dc,
        BlendMode::Erase => 0,
        BlendMode::Multiply => (sc * dc) / 255,
        BlendMode::Screen => 255 - (((255 - sc) * (255 - dc)) / 255),
        BlendMode::Darken => sc.min(dc),
        BlendMode::Lighten => sc.max(dc),
        BlendMode::Add => (sc + dc).min(255),
        BlendMode::Subtract => dc.saturating_sub(sc),
        BlendMode::Overlay => {
            if dc * 2 < 255 {
                (2 * sc * dc) / 255
            } else {
                255 - (2 * (255 - sc) * (255 - dc)) / 255
            }
        }
        BlendMode::Dodge => {
            if sc >= 255 {
                255
            } else {
                ((dc * 255) / (255 - sc)).min(255)
            }
        }
        BlendMode::Burn => {
            if sc == 0 {
                0
            } else {
                255 - (((255 - dc) * 255) / sc).min(255)
            }
        }
    }
}

/// Composites `src` over `dst`, scaling the source's contribution by
/// `opacity` (0..=255), under the given blend mode. Both pixels are
/// premultiplied; the result is premultiplied.
pub fn composite_pixel(dst: Pixel, src: Pixel, opacity: u8, mode: BlendMode) -> Pixel {
    let [sb, sg, sr, sa0] = src.channels();
    let [db, dg, dr, da] = dst.channels();

    let sa = (sa0 as u32 * opacity as u32) / 255;
    let scale = |c: u8| (c as u32 * opacity as u32) / 255;
    let (sb, sg, sr) = (scale(sb), scale(sg), scale(sr));

    if mode == BlendMode::Behind {
        // Only fills where the destination is transparent; dst wins where opaque.
        let inv_da = 255 - da as u32;
        let out_a = da as u32 + (sa * inv_da) / 255;
        let mix = |d: u8, s: u32| -> u8 {
            ((d as u32 * 255 + s * inv_da) / 255).min(255) as u8
        };
        return Pixel::from_channels(
            mix(db, sb),
            mix(dg, sg),
            mix(dr, sr),
            out_a.min(255) as u8,
        );
    }
    if mode == BlendMode::Erase {
        let out_a = (da as u32 * (255 - sa)) / 255;
        let fade = |d: u8| ((d as u32 * (255 - sa)) / 255) as u8;
        return Pixel::from_channels(fade(db), fade(dg), fade(dr), out_a as u8);
    }
    if mode == BlendMode::Replace {
        return Pixel::from_channels(sb as u8, sg as u8, sr as u8, sa as u8);
    }

    // `blend_channel` computes the blended premultiplied source contribution
    // at full `sa` coverage; composite it "over" the destination the usual
    // premultiplied-alpha way.
    let over = |dc: u8, sc: u32| -> u32 {
        let bc = blend_channel(mode, sc, sa, dc as u32, da as u32);
        bc + (dc as u32 * (255 - sa)) / 255
    };

    let out_a = (sa + (da as u32 * (255 - sa)) / 255).min(255);
    Pixel::from_channels(
        over(db, sb).min(255) as u8,
        over(dg, sg).min(255) as u8,
        over(dr, sr).min(255) as u8,
        out_a as u8,
    )
}

/// Fixed T×T grid of premultiplied pixels: the unit of storage backing a
/// single tile.
#[derive(Clone, PartialEq)]
pub struct TileBuf {
    pixels: Box<[Pixel]>,
}

impl std::fmt::Debug for TileBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileBuf").field("len", &self.pixels.len()).finish()
    }
}

impl TileBuf {
    pub fn filled(color: Pixel) -> Self {
        Self {
            pixels: vec![color; TILE_AREA].into_boxed_slice(),
        }
    }

    pub fn transparent() -> Self {
        Self::filled(Pixel::TRANSPARENT)
    }

    /// Builds a tile from a raw BGRA buffer already decompressed to exactly
    /// `4 * TILE_SIZE^2` bytes in little-endian wire order.
    pub fn from_bgra_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TILE_AREA * 4 {
            return None;
        }
        let mut pixels = Vec::with_capacity(TILE_AREA);
        for chunk in bytes.chunks_exact(4) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            pixels.push(Pixel::from_wire_le(word));
        }
        Some(Self {
            pixels: pixels.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Pixel {
        self.pixels[(y * TILE_SIZE + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, pixel: Pixel) {
        self.pixels[(y * TILE_SIZE + x) as usize] = pixel;
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Pixel] {
        &mut self.pixels
    }

    pub fn is_fully_transparent(&self) -> bool {
        self.pixels.iter().all(|p| p.a() == 0)
    }

    /// Composites `src` into `self` under `mode`, optionally masked by a
    /// per-pixel coverage buffer (same length as the tile, 0..=255); when
    /// no mask is given, `opacity` alone scales the whole tile.
    pub fn blend_into(&mut self, src: &TileBuf, opacity: u8, mode: BlendMode, mask: Option<&[u8]>) {
        for i in 0..TILE_AREA {
            let cov = match mask {
                Some(m) => ((m[i] as u32 * opacity as u32) / 255) as u8,
                None => opacity,
            };
            self.pixels[i] = composite_pixel(self.pixels[i], src.pixels[i], cov, mode);
        }
    }

    /// Fills the rectangle `[x0,y0)..[x1,y1)` (tile-local, clamped to tile
    /// bounds) with `color` under `mode`.
    pub fn fill_rect(&mut self, x0: u32, y0: u32, x1: u32, y1: u32, color: Pixel, mode: BlendMode) {
        let x1 = x1.min(TILE_SIZE);
        let y1 = y1.min(TILE_SIZE);
        for y in y0..y1 {
            for x in x0..x1 {
                let existing = self.get(x, y);
                self.set(x, y, composite_pixel(existing, color, 255, mode));
            }
        }
    }
}

/// A shared (immutable) or transient (owned) tile's pixel content plus the
/// id of the user context that most recently wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub context_id: u32,
    pub buf: TileBuf,
}

impl Tile {
    pub fn new_filled(context_id: u32, color: Pixel) -> Self {
        Self {
            context_id,
            buf: TileBuf::filled(color),
        }
    }

    pub fn from_compressed_bgra(context_id: u32, inflated: &[u8]) -> Option<Self> {
        TileBuf::from_bgra_bytes(inflated).map(|buf| Self { context_id, buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_channel_roundtrip() {
        let p = Pixel::from_channels(10, 20, 30, 255);
        assert_eq!(p.b(), 10);
        assert_eq!(p.g(), 20);
        assert_eq!(p.r(), 30);
        assert_eq!(p.a(), 255);
    }

    #[test]
    fn normal_blend_fully_opaque_source_replaces_destination() {
        let dst = Pixel::from_channels(0, 0, 255, 255); // opaque red
        let src = Pixel::from_channels(0, 255, 0, 255); // opaque green
        let out = composite_pixel(dst, src, 255, BlendMode::Normal);
        assert_eq!(out, src);
    }

    #[test]
    fn normal_blend_zero_opacity_keeps_destination() {
        let dst = Pixel::from_channels(0, 0, 255, 255);
        let src = Pixel::from_channels(0, 255, 0, 255);
        let out = composite_pixel(dst, src, 0, BlendMode::Normal);
        assert_eq!(out, dst);
    }

    #[test]
    fn erase_reduces_destination_alpha_by_source_coverage() {
        let dst = Pixel::from_channels(10, 20, 30, 200);
        let src = Pixel::from_channels(0, 0, 0, 255);
        let out = composite_pixel(dst, src, 128, BlendMode::Erase);
        assert!(out.a() < dst.a());
    }

    #[test]
    fn behind_mode_does_not_touch_opaque_destination() {
        let dst = Pixel::from_channels(10, 20, 30, 255);
        let src = Pixel::from_channels(200, 200, 200, 255);
        let out = composite_pixel(dst, src, 255, BlendMode::Behind);
        assert_eq!(out, dst);
    }

    #[test]
    fn behind_mode_fills_transparent_destination() {
        let dst = Pixel::TRANSPARENT;
        let src = Pixel::from_channels(10, 20, 30, 255);
        let out = composite_pixel(dst, src, 255, BlendMode::Behind);
        assert_eq!(out, src);
    }

    #[test]
    fn valid_for_brush_excludes_behind_and_replace() {
        assert!(BlendMode::Normal.valid_for_brush());
        assert!(BlendMode::Multiply.valid_for_brush());
        assert!(!BlendMode::Behind.valid_for_brush());
        assert!(!BlendMode::Replace.valid_for_brush());
    }

    #[test]
    fn from_code_rejects_unknown() {
        assert_eq!(BlendMode::from_code(0), Some(BlendMode::Normal));
        assert_eq!(BlendMode::from_code(999), None);
    }

    #[test]
    fn tile_from_bgra_bytes_requires_exact_length() {
        let bytes = vec![0u8; TILE_AREA * 4];
        assert!(TileBuf::from_bgra_bytes(&bytes).is_some());
        assert!(TileBuf::from_bgra_bytes(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn fill_rect_clamps_to_tile_bounds() {
        let mut tile = TileBuf::transparent();
        tile.fill_rect(0, 0, TILE_SIZE + 100, TILE_SIZE + 100, Pixel::from_channels(1, 2, 3, 255), BlendMode::Normal);
        assert_eq!(tile.get(TILE_SIZE - 1, TILE_SIZE - 1).a(), 255);
    }
}
