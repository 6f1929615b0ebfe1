//! Typed drawing commands the canvas engine accepts. Parsing these out of
//! the wire protocol is someone else's job; by the time a `Command` reaches
//! the engine it has already been validated for shape (field types,
//! presence), only its *content* (ids, blend modes, geometry) remains to be
//! checked by the handler.

use canvas_pixels::Pixel;
use serde::{Deserialize, Serialize};

/// Every drawing message carries the id of the user who sent it.
pub type ContextId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub p0: (f64, f64),
    pub p1: (f64, f64),
    pub p2: (f64, f64),
    pub p3: (f64, f64),
}

impl Quad {
    pub fn as_array(self) -> [(f64, f64); 4] {
        [self.p0, self.p1, self.p2, self.p3]
    }

    /// Axis-aligned bounding box area, used for the REGION_MOVE size check.
    pub fn bounds_area(self) -> f64 {
        let xs = [self.p0.0, self.p1.0, self.p2.0, self.p3.0];
        let ys = [self.p0.1, self.p1.1, self.p2.1, self.p3.1];
        let w = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - xs.iter().cloned().fold(f64::INFINITY, f64::min);
        let h = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - ys.iter().cloned().fold(f64::INFINITY, f64::min);
        w.max(0.0) * h.max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCreateFlags {
    pub insert: bool,
    pub copy: bool,
}

/// A single brush stamp, already positioned and sized by the (external)
/// brush engine; the canvas engine only knows how to rasterize it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dab {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    /// Per-dab opacity/coverage multiplier, 0..=255.
    pub opacity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DabShape {
    /// Soft, anti-aliased circular falloff.
    Classic,
    /// Hard-edged circle, no anti-aliasing.
    Pixel,
    /// Hard-edged square, side length `2 * radius`.
    PixelSquare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CanvasResize {
        context_id: ContextId,
        top: i32,
        right: i32,
        bottom: i32,
        left: i32,
    },
    LayerCreate {
        context_id: ContextId,
        layer_id: i32,
        source_id: i32,
        /// `None` means "fully transparent", matching a wire `fill == 0`.
        fill: Option<Pixel>,
        flags: LayerCreateFlags,
        title: String,
    },
    LayerAttr {
        layer_id: i32,
        sublayer_id: i32,
        opacity: u8,
        blend_mode_code: u32,
        censored: bool,
        fixed: bool,
    },
    LayerOrder {
        layer_ids: Vec<i32>,
    },
    LayerRetitle {
        layer_id: i32,
        title: String,
    },
    LayerDelete {
        context_id: ContextId,
        layer_id: i32,
        merge: bool,
    },
    LayerVisibility {
        layer_id: i32,
        visible: bool,
    },
    PutImage {
        context_id: ContextId,
        layer_id: i32,
        blend_mode_code: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        /// Already-decompressed BGRA bytes (`4 * width * height`).
        image: Vec<u8>,
    },
    FillRect {
        context_id: ContextId,
        layer_id: i32,
        blend_mode_code: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        color: Pixel,
    },
    RegionMove {
        context_id: ContextId,
        layer_id: i32,
        src_x: i32,
        src_y: i32,
        src_width: i32,
        src_height: i32,
        dst_quad: Quad,
        /// Raw (still compressed) 1-bpp monochrome mask payload, if any.
        mask: Option<Vec<u8>>,
    },
    PutTile {
        layer_id: i32,
        sublayer_id: i32,
        tile_x: u32,
        tile_y: u32,
        repeat: u32,
        context_id: ContextId,
        /// Solid color form; mutually exclusive with `compressed_image`.
        color: Option<Pixel>,
        compressed_image: Option<Vec<u8>>,
    },
    CanvasBackground {
        context_id: ContextId,
        color: Option<Pixel>,
        compressed_image: Option<Vec<u8>>,
    },
    PenUp {
        context_id: ContextId,
    },
    DrawDabs {
        context_id: ContextId,
        layer_id: i32,
        shape: DabShape,
        origin_x: f32,
        origin_y: f32,
        color: Pixel,
        blend_mode_code: u32,
        indirect: bool,
        dabs: Vec<Dab>,
    },
}

impl Command {
    /// A short, stable name for logging/metrics; not part of the wire
    /// format.
    pub const fn kind(&self) -> &'static str {
        match self {
            Command::CanvasResize { .. } => "canvas_resize",
            Command::LayerCreate { .. } => "layer_create",
            Command::LayerAttr { .. } => "layer_attr",
            Command::LayerOrder { .. } => "layer_order",
            Command::LayerRetitle { .. } => "layer_retitle",
            Command::LayerDelete { .. } => "layer_delete",
            Command::LayerVisibility { .. } => "layer_visibility",
            Command::PutImage { .. } => "put_image",
            Command::FillRect { .. } => "fill_rect",
            Command::RegionMove { .. } => "region_move",
            Command::PutTile { .. } => "put_tile",
            Command::CanvasBackground { .. } => "canvas_background",
            Command::PenUp { .. } => "pen_up",
            Command::DrawDabs { .. } => "draw_dabs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_bounds_area_of_axis_aligned_square() {
        let quad = Quad {
            p0: (0.0, 0.0),
            p1: (10.0, 0.0),
            p2: (10.0, 10.0),
            p3: (0.0, 10.0),
        };
        assert_eq!(quad.bounds_area(), 100.0);
    }
}
