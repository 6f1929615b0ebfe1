//! The persistent canvas tree: tile grids, layer content, layer props, the
//! layer list, and the top-level canvas state. Every level follows the
//! `Shared`/`Owned`/`ChildSlot` duality from `canvas_rc`: a handler promotes
//! only the path it needs to mutate and shares everything else with the
//! snapshot it started from.

use canvas_image::ImageBuffer;
use canvas_model::{ImageLayout, MAX_CANVAS_DIMENSION};
use canvas_pixels::{composite_pixel, BlendMode, Pixel, Tile, TileBuf};
use canvas_protocol::{Dab, DabShape};
use canvas_rc::{ChildSlot, Owned, Shared};
use canvas_transform::{draw_transformed, TransformError, TransformScratch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    NotFound,
    DimensionOutOfRange,
    EmptyRegion,
    RegionTooLarge,
    Transform(TransformErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorKind {
    Degenerate,
    ResourceExhausted,
}

impl From<TransformError> for TreeError {
    fn from(err: TransformError) -> Self {
        TreeError::Transform(match err {
            TransformError::DegenerateQuad => TransformErrorKind::Degenerate,
            TransformError::ResourceExhausted => TransformErrorKind::ResourceExhausted,
        })
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::NotFound => write!(f, "id not found"),
            TreeError::DimensionOutOfRange => write!(f, "dimension out of range"),
            TreeError::EmptyRegion => write!(f, "region is empty"),
            TreeError::RegionTooLarge => write!(f, "region exceeds canvas size"),
            TreeError::Transform(TransformErrorKind::Degenerate) => write!(f, "degenerate transform"),
            TreeError::Transform(TransformErrorKind::ResourceExhausted) => {
                write!(f, "transform exceeded its resource budget")
            }
        }
    }
}

impl std::error::Error for TreeError {}

type Result<T> = std::result::Result<T, TreeError>;

/// Axis-aligned bounding box area of a destination quad, used to reject
/// `REGION_MOVE` targets that would blow up past the canvas.
fn quad_bounds_area(quad: [(f64, f64); 4]) -> f64 {
    let xs = quad.map(|p| p.0);
    let ys = quad.map(|p| p.1);
    let w = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - xs.iter().cloned().fold(f64::INFINITY, f64::min);
    let h = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - ys.iter().cloned().fold(f64::INFINITY, f64::min);
    w.max(0.0) * h.max(0.0)
}

/// A 2-D grid of nullable tile references, the structure shared by both a
/// layer's own content and each of its sublayers.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    layout: ImageLayout,
    tiles: Vec<Option<Shared<Tile>>>,
}

impl TileGrid {
    pub fn new(width: u32, height: u32) -> Self {
        let layout = ImageLayout::new(width, height);
        Self {
            width,
            height,
            tiles: vec![None; layout.max_tiles() as usize],
            layout,
        }
    }

    pub fn filled(width: u32, height: u32, context_id: u32, color: Pixel) -> Self {
        let mut grid = Self::new(width, height);
        let tile = Shared::new(Tile::new_filled(context_id, color));
        for slot in grid.tiles.iter_mut() {
            *slot = Some(tile.clone());
        }
        grid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn tile_at(&self, tx: u32, ty: u32) -> Option<&Shared<Tile>> {
        let idx = self.layout.tile_index(tx, ty).ok()?;
        self.tiles[idx].as_ref()
    }

    pub fn tiles(&self) -> &[Option<Shared<Tile>>] {
        &self.tiles
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> Pixel {
        if x >= self.width || y >= self.height {
            return Pixel::TRANSPARENT;
        }
        let (tx, ty) = (x / canvas_model::TILE_SIZE, y / canvas_model::TILE_SIZE);
        match self.tile_at(tx, ty) {
            Some(tile) => tile.buf.get(x % canvas_model::TILE_SIZE, y % canvas_model::TILE_SIZE),
            None => Pixel::TRANSPARENT,
        }
    }

    fn ensure_tile_buf(&self, idx: usize) -> TileBuf {
        match &self.tiles[idx] {
            Some(tile) => tile.buf.clone(),
            None => TileBuf::transparent(),
        }
    }

    fn store_tile(&mut self, idx: usize, context_id: u32, buf: TileBuf) {
        self.tiles[idx] = if buf.is_fully_transparent() {
            None
        } else {
            Some(Shared::new(Tile { context_id, buf }))
        };
    }

    /// Resizes the grid by the given pixel insets (positive expands,
    /// negative crops). Tiles aligned to the new tile boundary are shared
    /// with the old grid without resampling; tiles straddling the boundary
    /// are rebuilt pixel by pixel.
    pub fn resize(&mut self, context_id: u32, top: i32, right: i32, bottom: i32, left: i32) -> Result<()> {
        let new_width = self.width as i64 + left as i64 + right as i64;
        let new_height = self.height as i64 + top as i64 + bottom as i64;
        if new_width < 1 || new_height < 1 || new_width > MAX_CANVAS_DIMENSION as i64 || new_height > MAX_CANVAS_DIMENSION as i64 {
            return Err(TreeError::DimensionOutOfRange);
        }

        let old = std::mem::replace(self, TileGrid::new(new_width as u32, new_height as u32));
        let aligned = left % canvas_model::TILE_SIZE as i32 == 0 && top % canvas_model::TILE_SIZE as i32 == 0;

        for ty in 0..self.layout.tiles_per_column() {
            for tx in 0..self.layout.tiles_per_row() {
                let idx = self.layout.tile_index(tx, ty).unwrap();
                if aligned {
                    let old_tx = tx as i64 - (left / canvas_model::TILE_SIZE as i32) as i64;
                    let old_ty = ty as i64 - (top / canvas_model::TILE_SIZE as i32) as i64;
                    if old_tx >= 0 && old_ty >= 0 {
                        if let Ok(old_idx) = old.layout.tile_index(old_tx as u32, old_ty as u32) {
                            self.tiles[idx] = old.tiles[old_idx].clone();
                            continue;
                        }
                    }
                    continue;
                }

                let mut buf = TileBuf::transparent();
                let mut any = false;
                for ly in 0..canvas_model::TILE_SIZE {
                    let ny = ty * canvas_model::TILE_SIZE + ly;
                    let oy = ny as i64 - top as i64;
                    if oy < 0 || oy >= old.height as i64 {
                        continue;
                    }
                    for lx in 0..canvas_model::TILE_SIZE {
                        let nx = tx * canvas_model::TILE_SIZE + lx;
                        let ox = nx as i64 - left as i64;
                        if ox < 0 || ox >= old.width as i64 {
                            continue;
                        }
                        let pixel = old.pixel_at(ox as u32, oy as u32);
                        if pixel.a() != 0 {
                            any = true;
                        }
                        buf.set(lx, ly, pixel);
                    }
                }
                if any {
                    self.tiles[idx] = Some(Shared::new(Tile { context_id, buf }));
                }
            }
        }
        Ok(())
    }

    /// Composites `src` onto `self`, tile by tile, under `opacity`/`mode`.
    /// A null source tile under a source-over-like mode is a no-op (the
    /// destination tile is left untouched, preserving its shared pointer).
    pub fn merge(&mut self, src: &TileGrid, opacity: u8, mode: BlendMode, context_id: u32) {
        for idx in 0..self.tiles.len() {
            let src_tile = src.tiles.get(idx).and_then(|t| t.as_ref());
            if src_tile.is_none() && mode.source_over_like() {
                continue;
            }
            let mut buf = self.ensure_tile_buf(idx);
            let src_buf = match src_tile {
                Some(tile) => tile.buf.clone(),
                None => TileBuf::transparent(),
            };
            buf.blend_into(&src_buf, opacity, mode, None);
            self.store_tile(idx, context_id, buf);
        }
    }

    fn tiles_overlapping(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> impl Iterator<Item = (u32, u32)> {
        let t = canvas_model::TILE_SIZE as i64;
        let tx0 = (x0.max(0) / t) as u32;
        let ty0 = (y0.max(0) / t) as u32;
        let tx1 = self.layout.tiles_per_row().min(((x1.max(0) + t - 1) / t) as u32);
        let ty1 = self.layout.tiles_per_column().min(((y1.max(0) + t - 1) / t) as u32);
        (ty0..ty1).flat_map(move |ty| (tx0..tx1).map(move |tx| (tx, ty)))
    }

    pub fn fill_rect(&mut self, context_id: u32, mode: BlendMode, x0: i64, y0: i64, x1: i64, y1: i64, color: Pixel) {
        let t = canvas_model::TILE_SIZE as i64;
        for (tx, ty) in self.tiles_overlapping(x0, y0, x1, y1).collect::<Vec<_>>() {
            let idx = self.layout.tile_index(tx, ty).unwrap();
            let tile_x0 = tx as i64 * t;
            let tile_y0 = ty as i64 * t;
            let lx0 = (x0 - tile_x0).clamp(0, t) as u32;
            let ly0 = (y0 - tile_y0).clamp(0, t) as u32;
            let lx1 = (x1 - tile_x0).clamp(0, t) as u32;
            let ly1 = (y1 - tile_y0).clamp(0, t) as u32;
            if lx0 >= lx1 || ly0 >= ly1 {
                continue;
            }
            let mut buf = self.ensure_tile_buf(idx);
            buf.fill_rect(lx0, ly0, lx1, ly1, color, mode);
            self.store_tile(idx, context_id, buf);
        }
    }

    pub fn put_image(&mut self, context_id: u32, mode: BlendMode, x: i32, y: i32, image: &ImageBuffer) {
        let x0 = x.max(0) as i64;
        let y0 = y.max(0) as i64;
        let x1 = ((x as i64) + image.width() as i64).min(self.width as i64);
        let y1 = ((y as i64) + image.height() as i64).min(self.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let t = canvas_model::TILE_SIZE as i64;
        for (tx, ty) in self.tiles_overlapping(x0, y0, x1, y1).collect::<Vec<_>>() {
            let idx = self.layout.tile_index(tx, ty).unwrap();
            let mut buf = self.ensure_tile_buf(idx);
            let tile_x0 = tx as i64 * t;
            let tile_y0 = ty as i64 * t;
            for ly in 0..canvas_model::TILE_SIZE as i64 {
                let gy = tile_y0 + ly;
                if gy < y0 || gy >= y1 {
                    continue;
                }
                for lx in 0..canvas_model::TILE_SIZE as i64 {
                    let gx = tile_x0 + lx;
                    if gx < x0 || gx >= x1 {
                        continue;
                    }
                    let src_pixel = image.get((gx - x as i64) as u32, (gy - y as i64) as u32);
                    let existing = buf.get(lx as u32, ly as u32);
                    buf.set(lx as u32, ly as u32, composite_pixel(existing, src_pixel, 255, mode));
                }
            }
            self.store_tile(idx, context_id, buf);
        }
    }

    pub fn put_tile(&mut self, tile: Shared<Tile>, tx: u32, ty: u32, repeat: u32) -> Result<()> {
        let base = self.layout.tile_index(tx, ty).map_err(|_| TreeError::NotFound)?;
        let max = self.tiles.len();
        for k in 0..=repeat as usize {
            let idx = base + k;
            if idx >= max {
                break;
            }
            self.tiles[idx] = Some(tile.clone());
        }
        Ok(())
    }

    pub fn apply_dab(&mut self, context_id: u32, color: Pixel, mode: BlendMode, shape: DabShape, dab: &Dab) {
        let r = dab.radius.max(0.0);
        let x0 = (dab.x - r).floor().max(0.0) as i64;
        let y0 = (dab.y - r).floor().max(0.0) as i64;
        let x1 = ((dab.x + r).ceil() as i64).min(self.width as i64);
        let y1 = ((dab.y + r).ceil() as i64).min(self.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let t = canvas_model::TILE_SIZE as i64;
        for (tx, ty) in self.tiles_overlapping(x0, y0, x1, y1).collect::<Vec<_>>() {
            let idx = self.layout.tile_index(tx, ty).unwrap();
            let mut buf = self.ensure_tile_buf(idx);
            let tile_x0 = tx as i64 * t;
            let tile_y0 = ty as i64 * t;
            for ly in 0..canvas_model::TILE_SIZE as i64 {
                let gy = tile_y0 + ly;
                if gy < y0 || gy >= y1 {
                    continue;
                }
                for lx in 0..canvas_model::TILE_SIZE as i64 {
                    let gx = tile_x0 + lx;
                    if gx < x0 || gx >= x1 {
                        continue;
                    }
                    let dx = gx as f32 + 0.5 - dab.x;
                    let dy = gy as f32 + 0.5 - dab.y;
                    let dist = (dx * dx + dy * dy).sqrt();
                    let coverage = dab_coverage(shape, dist, r, dx, dy);
                    if coverage == 0 {
                        continue;
                    }
                    let opacity = ((coverage as u32 * dab.opacity as u32) / 255) as u8;
                    let existing = buf.get(lx as u32, ly as u32);
                    buf.set(lx as u32, ly as u32, composite_pixel(existing, color, opacity, mode));
                }
            }
            self.store_tile(idx, context_id, buf);
        }
    }
}

fn dab_coverage(shape: DabShape, dist: f32, radius: f32, dx: f32, dy: f32) -> u8 {
    match shape {
        DabShape::Classic => {
            if radius <= 0.0 {
                return 0;
            }
            // One-pixel-wide anti-aliased edge around the radius.
            let t = (radius - dist + 0.5).clamp(0.0, 1.0);
            (t * 255.0).round() as u8
        }
        DabShape::Pixel => {
            if dist <= radius {
                255
            } else {
                0
            }
        }
        DabShape::PixelSquare => {
            if dx.abs() <= radius && dy.abs() <= radius {
                255
            } else {
                0
            }
        }
    }
}

/// A pending indirect-draw buffer: the dabs from one stroke, keyed by the
/// drawing user's context id, merged into the parent layer on pen-up.
#[derive(Debug, Clone, PartialEq)]
pub struct Sublayer {
    pub id: i32,
    pub opacity: u8,
    pub blend_mode: BlendMode,
    pub grid: TileGrid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerContent {
    grid: TileGrid,
    sublayers: Vec<Sublayer>,
}

impl LayerContent {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            grid: TileGrid::new(width, height),
            sublayers: Vec::new(),
        }
    }

    pub fn filled(width: u32, height: u32, context_id: u32, color: Pixel) -> Self {
        Self {
            grid: TileGrid::filled(width, height, context_id, color),
            sublayers: Vec::new(),
        }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn width(&self) -> u32 {
        self.grid.width()
    }

    pub fn height(&self) -> u32 {
        self.grid.height()
    }

    pub fn sublayers(&self) -> &[Sublayer] {
        &self.sublayers
    }

    pub fn pixel_at(&self, x: u32, y: u32) -> Pixel {
        self.grid.pixel_at(x, y)
    }

    pub fn resize(&mut self, context_id: u32, top: i32, right: i32, bottom: i32, left: i32) -> Result<()> {
        self.grid.resize(context_id, top, right, bottom, left)?;
        for sublayer in self.sublayers.iter_mut() {
            sublayer.grid.resize(context_id, top, right, bottom, left)?;
        }
        Ok(())
    }

    pub fn merge(&mut self, src: &LayerContent, opacity: u8, mode: BlendMode, context_id: u32) {
        self.grid.merge(&src.grid, opacity, mode, context_id);
    }

    pub fn fill_rect(&mut self, context_id: u32, mode: BlendMode, x0: i64, y0: i64, x1: i64, y1: i64, color: Pixel) {
        self.grid.fill_rect(context_id, mode, x0, y0, x1, y1, color);
    }

    pub fn put_image(&mut self, context_id: u32, mode: BlendMode, x: i32, y: i32, image: &ImageBuffer) {
        self.grid.put_image(context_id, mode, x, y, image);
    }

    pub fn put_tile(&mut self, tile: Shared<Tile>, tx: u32, ty: u32, repeat: u32) -> Result<()> {
        self.grid.put_tile(tile, tx, ty, repeat)
    }

    pub fn apply_dab(&mut self, context_id: u32, color: Pixel, mode: BlendMode, shape: DabShape, dab: &Dab) {
        self.grid.apply_dab(context_id, color, mode, shape, dab);
    }

    /// Warps `src_rect` of `self` into `dst_quad`, masked and composited
    /// with NORMAL blending, as a copy (the source pixels are left intact).
    pub fn region_move(
        &mut self,
        src_x: i32,
        src_y: i32,
        src_width: u32,
        src_height: u32,
        mask: Option<&[u8]>,
        dst_quad: [(f64, f64); 4],
        scratch: &mut TransformScratch,
    ) -> Result<()> {
        let max_area = (self.width() as f64 + 1.0) * (self.height() as f64 + 1.0);
        if quad_bounds_area(dst_quad) > max_area {
            return Err(TreeError::RegionTooLarge);
        }

        let mut source = ImageBuffer::new(src_width, src_height);
        for y in 0..src_height {
            for x in 0..src_width {
                let gx = src_x as i64 + x as i64;
                let gy = src_y as i64 + y as i64;
                let mut pixel = if gx >= 0 && gy >= 0 && (gx as u32) < self.width() && (gy as u32) < self.height() {
                    self.pixel_at(gx as u32, gy as u32)
                } else {
                    Pixel::TRANSPARENT
                };
                if let Some(mask) = mask {
                    let coverage = mask[(y * src_width + x) as usize];
                    if coverage != 255 {
                        let [b, g, r, a] = pixel.channels();
                        let scale = |c: u8| ((c as u32 * coverage as u32) / 255) as u8;
                        pixel = Pixel::from_channels(scale(b), scale(g), scale(r), scale(a));
                    }
                }
                source.set(x, y, pixel);
            }
        }

        let mut target = ImageBuffer::new(self.width(), self.height());
        for y in 0..self.height() {
            for x in 0..self.width() {
                target.set(x, y, self.pixel_at(x, y));
            }
        }
        draw_transformed(&mut target, &source, dst_quad, scratch)?;
        self.grid = TileGrid::new(self.width(), self.height());
        self.grid.put_image(0, BlendMode::Replace, 0, 0, &target);
        Ok(())
    }

    pub fn transient_sublayer(&mut self, id: i32, opacity: u8, blend_mode: BlendMode) -> usize {
        if let Some(idx) = self.sublayers.iter().position(|s| s.id == id) {
            return idx;
        }
        self.sublayers.push(Sublayer {
            id,
            opacity,
            blend_mode,
            grid: TileGrid::new(self.width(), self.height()),
        });
        self.sublayers.len() - 1
    }

    pub fn merge_sublayer_at(&mut self, index: usize, context_id: u32) {
        let sublayer = self.sublayers.remove(index);
        self.grid.merge(&sublayer.grid, sublayer.opacity, sublayer.blend_mode, context_id);
    }

    pub fn merge_all_sublayers(&mut self, context_id: u32) {
        while !self.sublayers.is_empty() {
            self.merge_sublayer_at(0, context_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerProps {
    pub id: i32,
    pub title: String,
    pub opacity: u8,
    pub blend_mode: BlendMode,
    pub visible: bool,
    pub censored: bool,
    pub fixed: bool,
    pub sublayer_of: Option<i32>,
}

impl LayerProps {
    pub fn new(id: i32, title: String) -> Self {
        Self {
            id,
            title,
            opacity: 255,
            blend_mode: BlendMode::Normal,
            visible: true,
            censored: false,
            fixed: false,
            sublayer_of: None,
        }
    }
}

struct LayerEntry {
    content: ChildSlot<LayerContent>,
    props: ChildSlot<LayerProps>,
}

impl Clone for LayerEntry {
    fn clone(&self) -> Self {
        Self {
            content: self.content.clone(),
            props: self.props.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct LayerList {
    entries: Vec<LayerEntry>,
}

impl LayerList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, layer_id: i32) -> Option<usize> {
        self.entries.iter().position(|e| e.props.get().id == layer_id)
    }

    pub fn content_at(&self, index: usize) -> &LayerContent {
        self.entries[index].content.get()
    }

    pub fn props_at(&self, index: usize) -> &LayerProps {
        self.entries[index].props.get()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LayerContent, &LayerProps)> {
        self.entries.iter().map(|e| (e.content.get(), e.props.get()))
    }

    pub fn resize(&mut self, context_id: u32, top: i32, right: i32, bottom: i32, left: i32) -> Result<()> {
        for entry in self.entries.iter_mut() {
            entry.content.promote().resize(context_id, top, right, bottom, left)?;
        }
        Ok(())
    }

    pub fn create(
        &mut self,
        layer_id: i32,
        source_id: i32,
        fill: Option<Pixel>,
        insert: bool,
        copy: bool,
        width: u32,
        height: u32,
        title: String,
        context_id: u32,
    ) -> Result<()> {
        let source_index = if insert || copy { Some(self.index_of(source_id).ok_or(TreeError::NotFound)?) } else { None };

        let content = if copy {
            self.content_at(source_index.unwrap()).clone()
        } else {
            match fill {
                Some(color) => LayerContent::filled(width, height, context_id, color),
                None => LayerContent::new(width, height),
            }
        };

        let entry = LayerEntry {
            content: ChildSlot::from_owned(Owned::new(content)),
            props: ChildSlot::from_owned(Owned::new(LayerProps::new(layer_id, title))),
        };

        match source_index {
            Some(idx) if insert => self.entries.insert(idx + 1, entry),
            _ => self.entries.push(entry),
        }
        Ok(())
    }

    pub fn attr(
        &mut self,
        layer_id: i32,
        sublayer_id: i32,
        opacity: u8,
        blend_mode: BlendMode,
        censored: bool,
        fixed: bool,
    ) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        if sublayer_id == 0 {
            let props = self.entries[idx].props.promote();
            props.opacity = opacity;
            props.blend_mode = blend_mode;
            props.censored = censored;
            props.fixed = fixed;
        } else {
            let content = self.entries[idx].content.promote();
            let sub_idx = content.transient_sublayer(sublayer_id, opacity, blend_mode);
            content.sublayers[sub_idx].opacity = opacity;
            content.sublayers[sub_idx].blend_mode = blend_mode;
        }
        Ok(())
    }

    pub fn reorder(&mut self, layer_ids: &[i32]) {
        let mut remaining: Vec<LayerEntry> = std::mem::take(&mut self.entries);
        let mut ordered = Vec::with_capacity(remaining.len());
        for &id in layer_ids {
            if let Some(pos) = remaining.iter().position(|e| e.props.get().id == id) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        self.entries = ordered;
    }

    pub fn retitle(&mut self, layer_id: i32, title: String) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        self.entries[idx].props.promote().title = title;
        Ok(())
    }

    pub fn delete(&mut self, context_id: u32, layer_id: i32, merge: bool) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        if merge {
            if idx == 0 {
                return Err(TreeError::NotFound);
            }
            let (opacity, mode) = {
                let props = self.entries[idx].props.get();
                (props.opacity, props.blend_mode)
            };
            let src = self.entries[idx].content.get().clone();
            self.entries[idx - 1].content.promote().merge(&src, opacity, mode, context_id);
        }
        self.entries.remove(idx);
        Ok(())
    }

    pub fn visibility(&mut self, layer_id: i32, visible: bool) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        self.entries[idx].props.promote().visible = visible;
        Ok(())
    }

    pub fn put_image(&mut self, context_id: u32, layer_id: i32, mode: BlendMode, x: i32, y: i32, image: &ImageBuffer) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        self.entries[idx].content.promote().put_image(context_id, mode, x, y, image);
        Ok(())
    }

    pub fn fill_rect(&mut self, context_id: u32, layer_id: i32, mode: BlendMode, x0: i64, y0: i64, x1: i64, y1: i64, color: Pixel) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        self.entries[idx].content.promote().fill_rect(context_id, mode, x0, y0, x1, y1, color);
        Ok(())
    }

    pub fn put_tile(&mut self, layer_id: i32, sublayer_id: i32, tile: Shared<Tile>, tx: u32, ty: u32, repeat: u32) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        let content = self.entries[idx].content.promote();
        if sublayer_id == 0 {
            content.put_tile(tile, tx, ty, repeat)
        } else {
            let sub_idx = content.transient_sublayer(sublayer_id, 255, BlendMode::Normal);
            content.sublayers[sub_idx].grid.put_tile(tile, tx, ty, repeat)
        }
    }

    pub fn region_move(
        &mut self,
        layer_id: i32,
        src_x: i32,
        src_y: i32,
        src_width: u32,
        src_height: u32,
        mask: Option<&[u8]>,
        dst_quad: [(f64, f64); 4],
        scratch: &mut TransformScratch,
    ) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        self.entries[idx]
            .content
            .promote()
            .region_move(src_x, src_y, src_width, src_height, mask, dst_quad, scratch)
    }

    pub fn draw_dabs(
        &mut self,
        layer_id: i32,
        sublayer_id: i32,
        sublayer_opacity: Option<u8>,
        sublayer_mode: Option<BlendMode>,
        color: Pixel,
        mode: BlendMode,
        shape: DabShape,
        context_id: u32,
        dabs: &[Dab],
    ) -> Result<()> {
        let idx = self.index_of(layer_id).ok_or(TreeError::NotFound)?;
        let content = self.entries[idx].content.promote();
        if sublayer_id != 0 {
            let sub_idx = content.transient_sublayer(sublayer_id, sublayer_opacity.unwrap_or(255), sublayer_mode.unwrap_or(BlendMode::Normal));
            for dab in dabs {
                content.sublayers[sub_idx].grid.apply_dab(context_id, color, BlendMode::Normal, shape, dab);
            }
        } else {
            for dab in dabs {
                content.apply_dab(context_id, color, mode, shape, dab);
            }
        }
        Ok(())
    }

    /// Merges every sublayer whose id equals `context_id`, across all
    /// layers. Returns `true` if anything changed.
    pub fn pen_up(&mut self, context_id: i32) -> bool {
        let mut changed = false;
        for entry in self.entries.iter_mut() {
            let has_match = entry
                .content
                .get()
                .sublayers()
                .iter()
                .any(|s| s.id == context_id);
            if !has_match {
                continue;
            }
            let content = entry.content.promote();
            loop {
                match content.sublayers.iter().position(|s| s.id == context_id) {
                    Some(sub_idx) => {
                        content.merge_sublayer_at(sub_idx, context_id as u32);
                        changed = true;
                    }
                    None => break,
                }
            }
        }
        changed
    }
}

/// The top-level, persistent canvas snapshot.
#[derive(Clone)]
pub struct CanvasState {
    width: u32,
    height: u32,
    background: Option<Shared<Tile>>,
    layers: ChildSlot<LayerList>,
}

impl CanvasState {
    pub fn empty() -> Shared<CanvasState> {
        Shared::new(CanvasState {
            width: 0,
            height: 0,
            background: None,
            layers: ChildSlot::from_owned(Owned::new(LayerList::new())),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn background(&self) -> Option<&Shared<Tile>> {
        self.background.as_ref()
    }

    pub fn layers(&self) -> &LayerList {
        self.layers.get()
    }

    /// Flattens every visible layer, bottom to top, into a single image the
    /// size of the canvas. Pending (unmerged) sublayers are not rendered.
    pub fn flatten(&self) -> ImageBuffer {
        let mut out = ImageBuffer::new(self.width, self.height);
        if let Some(background) = &self.background {
            for y in 0..self.height {
                for x in 0..self.width {
                    out.set(x, y, background.buf.get(x % canvas_model::TILE_SIZE, y % canvas_model::TILE_SIZE));
                }
            }
        }
        for (content, props) in self.layers().iter() {
            if !props.visible {
                continue;
            }
            for y in 0..self.height {
                for x in 0..self.width {
                    let existing = out.get(x, y);
                    let src = content.pixel_at(x, y);
                    out.set(x, y, composite_pixel(existing, src, props.opacity, props.blend_mode));
                }
            }
        }
        out
    }
}

pub struct TransientCanvasState(Owned<CanvasState>);

impl TransientCanvasState {
    pub fn new(from: &Shared<CanvasState>) -> Self {
        Self(Owned::from_shared(from))
    }

    pub fn persist(self) -> Shared<CanvasState> {
        self.0.persist()
    }

    pub fn width(&self) -> u32 {
        self.0.get().width
    }

    pub fn height(&self) -> u32 {
        self.0.get().height
    }

    pub fn resize(&mut self, context_id: u32, top: i32, right: i32, bottom: i32, left: i32) -> Result<()> {
        let state = self.0.get_mut();
        let new_width = state.width as i64 + left as i64 + right as i64;
        let new_height = state.height as i64 + top as i64 + bottom as i64;
        if new_width < 1 || new_height < 1 || new_width > MAX_CANVAS_DIMENSION as i64 || new_height > MAX_CANVAS_DIMENSION as i64 {
            return Err(TreeError::DimensionOutOfRange);
        }
        state.layers.promote().resize(context_id, top, right, bottom, left)?;
        state.width = new_width as u32;
        state.height = new_height as u32;
        Ok(())
    }

    pub fn layers_mut(&mut self) -> &mut LayerList {
        self.0.get_mut().layers.promote()
    }

    /// `None` clears the background back to fully transparent.
    pub fn set_background(&mut self, tile: Option<Shared<Tile>>) {
        self.0.get_mut().background = tile;
    }

    /// Applies `f` only if it finds a match via `LayerList::pen_up`;
    /// otherwise the canvas state is left untouched and the caller should
    /// discard this transient and reuse the original `Shared` handle.
    pub fn pen_up(&mut self, context_id: i32) -> bool {
        self.0.get_mut().layers.promote().pen_up(context_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_from_empty_creates_transparent_canvas() {
        let base = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&base);
        tcs.resize(1, 0, 100, 100, 0).unwrap();
        let state = tcs.persist();
        assert_eq!(state.width(), 100);
        assert_eq!(state.height(), 100);
        assert_eq!(state.layers().len(), 0);
    }

    #[test]
    fn resize_rejects_reversed_borders() {
        let base = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&base);
        tcs.resize(1, 0, 0, 0, 10).unwrap();
        let state = tcs.persist();
        let mut tcs2 = TransientCanvasState::new(&state);
        let err = tcs2.resize(1, 0, -10, 0, -10).unwrap_err();
        assert_eq!(err, TreeError::DimensionOutOfRange);
    }

    #[test]
    fn fill_rect_paints_only_targeted_tiles() {
        let base = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&base);
        tcs.resize(1, 0, 128, 128, 0).unwrap();
        tcs.layers_mut()
            .create(1, 0, Some(Pixel::from_channels(0, 0, 255, 255)), false, false, 128, 128, "L".into(), 1)
            .unwrap();
        tcs.layers_mut()
            .fill_rect(1, 1, BlendMode::Normal, 0, 0, 64, 64, Pixel::from_channels(0, 255, 0, 255))
            .unwrap();
        let state = tcs.persist();
        let image = state.flatten();
        assert_eq!(image.get(10, 10), Pixel::from_channels(0, 255, 0, 255));
        assert_eq!(image.get(100, 100), Pixel::from_channels(0, 0, 255, 255));
    }

    #[test]
    fn put_tile_repeat_writes_consecutive_tiles() {
        let mut content = LayerContent::new(256, 256);
        let tile = Shared::new(Tile::new_filled(1, Pixel::from_channels(0, 255, 0, 255)));
        content.put_tile(tile, 0, 0, 3).unwrap();
        assert!(content.grid().tile_at(0, 0).is_some());
        assert!(content.grid().tile_at(3, 0).is_some());
        assert!(content.grid().tile_at(0, 1).is_none());
    }

    #[test]
    fn region_move_rejects_dst_quad_larger_than_canvas() {
        let mut content = LayerContent::new(8, 8);
        let mut scratch = TransformScratch::new();
        let huge_quad = [(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)];
        let err = content
            .region_move(0, 0, 8, 8, None, huge_quad, &mut scratch)
            .unwrap_err();
        assert_eq!(err, TreeError::RegionTooLarge);
    }

    #[test]
    fn indirect_dab_then_pen_up_merges_sublayer() {
        let base = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&base);
        tcs.resize(1, 0, 32, 32, 0).unwrap();
        tcs.layers_mut().create(1, 0, None, false, false, 32, 32, "L".into(), 1).unwrap();
        tcs.layers_mut()
            .draw_dabs(
                1,
                7,
                Some(255),
                Some(BlendMode::Normal),
                Pixel::from_channels(0, 0, 0, 255),
                BlendMode::Normal,
                DabShape::Pixel,
                7,
                &[Dab { x: 10.0, y: 10.0, radius: 4.0, opacity: 255 }],
            )
            .unwrap();
        let before_pen_up = tcs.persist();
        let unchanged = before_pen_up.flatten();
        assert_eq!(unchanged.get(10, 10), Pixel::TRANSPARENT);

        let mut tcs2 = TransientCanvasState::new(&before_pen_up);
        let merged = tcs2.pen_up(7);
        assert!(merged);
        let after = tcs2.persist();
        let flattened = after.flatten();
        assert_eq!(flattened.get(10, 10), Pixel::from_channels(0, 0, 0, 255));
        assert!(after.layers().content_at(0).sublayers().is_empty());
    }

    #[test]
    fn merge_all_sublayers_drains_every_pending_stroke() {
        let mut content = LayerContent::new(16, 16);
        let a = content.transient_sublayer(1, 255, BlendMode::Normal);
        content.sublayers[a].grid.fill_rect(1, BlendMode::Normal, 0, 0, 4, 4, Pixel::from_channels(0, 0, 255, 255));
        let b = content.transient_sublayer(2, 255, BlendMode::Normal);
        content.sublayers[b].grid.fill_rect(2, BlendMode::Normal, 4, 4, 8, 8, Pixel::from_channels(0, 255, 0, 255));
        content.merge_all_sublayers(9);
        assert!(content.sublayers().is_empty());
        assert_eq!(content.pixel_at(1, 1), Pixel::from_channels(0, 0, 255, 255));
        assert_eq!(content.pixel_at(5, 5), Pixel::from_channels(0, 255, 0, 255));
    }

    #[test]
    fn reorder_appends_missing_ids_in_original_order() {
        let mut list = LayerList::new();
        list.create(1, 0, None, false, false, 8, 8, "a".into(), 1).unwrap();
        list.create(2, 0, None, false, false, 8, 8, "b".into(), 1).unwrap();
        list.create(3, 0, None, false, false, 8, 8, "c".into(), 1).unwrap();
        list.reorder(&[3]);
        let ids: Vec<i32> = (0..list.len()).map(|i| list.props_at(i).id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }
}
