use canvas_image::{DecodeError, ImageBuffer};
use canvas_model::TILE_SIZE;
use canvas_pixels::{BlendMode, Pixel, Tile, TileBuf};
use canvas_protocol::{Command, Dab};
use canvas_rc::Shared;
use canvas_tree::{CanvasState, TransientCanvasState};

use crate::context::DrawContext;
use crate::error::{layer_error, EngineError, InvalidCommandError};
use crate::limits::EngineLimits;

type Result<T> = std::result::Result<T, EngineError>;

fn resolve_blend_mode(code: u32) -> Result<BlendMode> {
    BlendMode::from_code(code).ok_or(EngineError::InvalidCommand(InvalidCommandError::UnknownBlendMode(code)))
}

fn resolve_brush_blend_mode(code: u32) -> Result<BlendMode> {
    let mode = resolve_blend_mode(code)?;
    if mode.valid_for_brush() {
        Ok(mode)
    } else {
        Err(EngineError::InvalidCommand(InvalidCommandError::BlendModeNotValidForBrush))
    }
}

fn decode_wire_bgra(width: u32, height: u32, bytes: &[u8]) -> Result<ImageBuffer> {
    let expected = 4 * width as usize * height as usize;
    if bytes.len() != expected {
        return Err(DecodeError::SizeMismatch { expected, actual: bytes.len() }.into());
    }
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for chunk in bytes.chunks_exact(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        pixels.push(Pixel::from_wire_le(word));
    }
    Ok(ImageBuffer::from_pixels(width, height, pixels))
}

fn build_tile(context_id: u32, color: Option<Pixel>, compressed_image: Option<&[u8]>) -> Result<Tile> {
    if let Some(color) = color {
        return Ok(Tile::new_filled(context_id, color));
    }
    if let Some(compressed) = compressed_image {
        let image = canvas_image::decode_compressed_bgra(TILE_SIZE, TILE_SIZE, compressed)?;
        let mut raw = Vec::with_capacity(image.pixels().len() * 4);
        for pixel in image.pixels() {
            raw.extend_from_slice(&pixel.0.to_le_bytes());
        }
        let buf = TileBuf::from_bgra_bytes(&raw).expect("decode_compressed_bgra already validated the tile's size");
        return Ok(Tile { context_id, buf });
    }
    Ok(Tile::new_filled(context_id, Pixel::TRANSPARENT))
}

pub(crate) fn dispatch(
    state: &Shared<CanvasState>,
    ctx: &mut DrawContext,
    limits: &EngineLimits,
    command: &Command,
) -> Result<Shared<CanvasState>> {
    match command {
        Command::CanvasResize { context_id, top, right, bottom, left } => {
            canvas_resize(state, limits, *context_id, *top, *right, *bottom, *left)
        }
        Command::LayerCreate { context_id, layer_id, source_id, fill, flags, title } => {
            layer_create(state, *context_id, *layer_id, *source_id, *fill, *flags, title)
        }
        Command::LayerAttr { layer_id, sublayer_id, opacity, blend_mode_code, censored, fixed } => {
            layer_attr(state, *layer_id, *sublayer_id, *opacity, *blend_mode_code, *censored, *fixed)
        }
        Command::LayerOrder { layer_ids } => Ok(layer_order(state, layer_ids)),
        Command::LayerRetitle { layer_id, title } => layer_retitle(state, *layer_id, title),
        Command::LayerDelete { context_id, layer_id, merge } => layer_delete(state, *context_id, *layer_id, *merge),
        Command::LayerVisibility { layer_id, visible } => layer_visibility(state, *layer_id, *visible),
        Command::PutImage { context_id, layer_id, blend_mode_code, x, y, width, height, image } => {
            put_image(state, *context_id, *layer_id, *blend_mode_code, *x, *y, *width, *height, image)
        }
        Command::FillRect { context_id, layer_id, blend_mode_code, x, y, width, height, color } => {
            fill_rect(state, *context_id, *layer_id, *blend_mode_code, *x, *y, *width, *height, *color)
        }
        Command::RegionMove { context_id, layer_id, src_x, src_y, src_width, src_height, dst_quad, mask } => {
            region_move(state, ctx, *context_id, *layer_id, *src_x, *src_y, *src_width, *src_height, *dst_quad, mask.as_deref())
        }
        Command::PutTile { layer_id, sublayer_id, tile_x, tile_y, repeat, context_id, color, compressed_image } => {
            put_tile(state, *layer_id, *sublayer_id, *tile_x, *tile_y, *repeat, *context_id, *color, compressed_image.as_deref())
        }
        Command::CanvasBackground { context_id, color, compressed_image } => {
            canvas_background(state, *context_id, *color, compressed_image.as_deref())
        }
        Command::PenUp { context_id } => Ok(pen_up(state, *context_id)),
        Command::DrawDabs { context_id, layer_id, shape, origin_x, origin_y, color, blend_mode_code, indirect, dabs } => {
            draw_dabs(state, *context_id, *layer_id, *shape, *origin_x, *origin_y, *color, *blend_mode_code, *indirect, dabs)
        }
    }
}

fn canvas_resize(
    state: &Shared<CanvasState>,
    limits: &EngineLimits,
    context_id: u32,
    top: i32,
    right: i32,
    bottom: i32,
    left: i32,
) -> Result<Shared<CanvasState>> {
    let mut tcs = TransientCanvasState::new(state);
    let new_width = tcs.width() as i64 + left as i64 + right as i64;
    let new_height = tcs.height() as i64 + top as i64 + bottom as i64;
    if new_width < 1 || new_height < 1 {
        return Err(InvalidCommandError::ReversedResizeBorders.into());
    }
    if new_width > limits.max_dimension as i64 || new_height > limits.max_dimension as i64 {
        return Err(InvalidCommandError::DimensionOutOfRange.into());
    }
    tcs.resize(context_id, top, right, bottom, left)?;
    Ok(tcs.persist())
}

fn layer_create(
    state: &Shared<CanvasState>,
    context_id: u32,
    layer_id: i32,
    source_id: i32,
    fill: Option<Pixel>,
    flags: canvas_protocol::LayerCreateFlags,
    title: &str,
) -> Result<Shared<CanvasState>> {
    let mut tcs = TransientCanvasState::new(state);
    let (width, height) = (tcs.width(), tcs.height());
    tcs.layers_mut()
        .create(layer_id, source_id, fill, flags.insert, flags.copy, width, height, title.to_owned(), context_id)
        .map_err(|e| layer_error(e, source_id))?;
    Ok(tcs.persist())
}

fn layer_attr(
    state: &Shared<CanvasState>,
    layer_id: i32,
    sublayer_id: i32,
    opacity: u8,
    blend_mode_code: u32,
    censored: bool,
    fixed: bool,
) -> Result<Shared<CanvasState>> {
    let mode = resolve_blend_mode(blend_mode_code)?;
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().attr(layer_id, sublayer_id, opacity, mode, censored, fixed).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

fn layer_order(state: &Shared<CanvasState>, layer_ids: &[i32]) -> Shared<CanvasState> {
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().reorder(layer_ids);
    tcs.persist()
}

fn layer_retitle(state: &Shared<CanvasState>, layer_id: i32, title: &str) -> Result<Shared<CanvasState>> {
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().retitle(layer_id, title.to_owned()).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

fn layer_delete(state: &Shared<CanvasState>, context_id: u32, layer_id: i32, merge: bool) -> Result<Shared<CanvasState>> {
    let mut tcs = TransientCanvasState::new(state);
    if merge && tcs.layers_mut().index_of(layer_id) == Some(0) {
        return Err(InvalidCommandError::MergeAtBaseLayer.into());
    }
    tcs.layers_mut().delete(context_id, layer_id, merge).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

fn layer_visibility(state: &Shared<CanvasState>, layer_id: i32, visible: bool) -> Result<Shared<CanvasState>> {
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().visibility(layer_id, visible).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

#[allow(clippy::too_many_arguments)]
fn put_image(
    state: &Shared<CanvasState>,
    context_id: u32,
    layer_id: i32,
    blend_mode_code: u32,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    image_bytes: &[u8],
) -> Result<Shared<CanvasState>> {
    let mode = resolve_brush_blend_mode(blend_mode_code)?;
    if width == 0 || height == 0 {
        return Err(InvalidCommandError::DegenerateRectangle.into());
    }
    let image = decode_wire_bgra(width, height, image_bytes)?;
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().put_image(context_id, layer_id, mode, x, y, &image).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

#[allow(clippy::too_many_arguments)]
fn fill_rect(
    state: &Shared<CanvasState>,
    context_id: u32,
    layer_id: i32,
    blend_mode_code: u32,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    color: Pixel,
) -> Result<Shared<CanvasState>> {
    let mode = resolve_brush_blend_mode(blend_mode_code)?;
    if width <= 0 || height <= 0 {
        return Err(InvalidCommandError::DegenerateRectangle.into());
    }
    let (x0, y0) = (x as i64, y as i64);
    let (x1, y1) = (x0 + width as i64, y0 + height as i64);
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut().fill_rect(context_id, layer_id, mode, x0, y0, x1, y1, color).map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

#[allow(clippy::too_many_arguments)]
fn region_move(
    state: &Shared<CanvasState>,
    ctx: &mut DrawContext,
    _context_id: u32,
    layer_id: i32,
    src_x: i32,
    src_y: i32,
    src_width: i32,
    src_height: i32,
    dst_quad: canvas_protocol::Quad,
    mask_bytes: Option<&[u8]>,
) -> Result<Shared<CanvasState>> {
    if src_width <= 0 || src_height <= 0 {
        return Err(InvalidCommandError::DegenerateRectangle.into());
    }
    if dst_quad.bounds_area() <= 0.0 {
        return Err(InvalidCommandError::DegenerateTransform.into());
    }
    let (src_width, src_height) = (src_width as u32, src_height as u32);
    let mask = match mask_bytes {
        Some(bytes) => Some(canvas_image::decode_compressed_monochrome_mask(src_width, src_height, bytes)?),
        None => None,
    };
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut()
        .region_move(layer_id, src_x, src_y, src_width, src_height, mask.as_deref(), dst_quad.as_array(), &mut ctx.scratch)
        .map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

#[allow(clippy::too_many_arguments)]
fn put_tile(
    state: &Shared<CanvasState>,
    layer_id: i32,
    sublayer_id: i32,
    tile_x: u32,
    tile_y: u32,
    repeat: u32,
    context_id: u32,
    color: Option<Pixel>,
    compressed_image: Option<&[u8]>,
) -> Result<Shared<CanvasState>> {
    let tile = Shared::new(build_tile(context_id, color, compressed_image)?);
    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut()
        .put_tile(layer_id, sublayer_id, tile, tile_x, tile_y, repeat)
        .map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}

fn canvas_background(
    state: &Shared<CanvasState>,
    context_id: u32,
    color: Option<Pixel>,
    compressed_image: Option<&[u8]>,
) -> Result<Shared<CanvasState>> {
    let tile = if color.is_some() || compressed_image.is_some() {
        Some(Shared::new(build_tile(context_id, color, compressed_image)?))
    } else {
        None
    };
    let mut tcs = TransientCanvasState::new(state);
    tcs.set_background(tile);
    Ok(tcs.persist())
}

fn pen_up(state: &Shared<CanvasState>, context_id: u32) -> Shared<CanvasState> {
    let mut tcs = TransientCanvasState::new(state);
    if tcs.pen_up(context_id as i32) {
        tcs.persist()
    } else {
        state.clone()
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_dabs(
    state: &Shared<CanvasState>,
    context_id: u32,
    layer_id: i32,
    shape: canvas_protocol::DabShape,
    origin_x: f32,
    origin_y: f32,
    color: Pixel,
    blend_mode_code: u32,
    indirect: bool,
    dabs: &[Dab],
) -> Result<Shared<CanvasState>> {
    let mode = resolve_brush_blend_mode(blend_mode_code)?;
    if dabs.is_empty() {
        return Ok(state.clone());
    }
    let absolute: Vec<Dab> = dabs
        .iter()
        .map(|d| Dab { x: origin_x + d.x, y: origin_y + d.y, radius: d.radius, opacity: d.opacity })
        .collect();

    let (sublayer_id, sublayer_opacity, sublayer_mode, dabs_mode) = if indirect {
        (context_id as i32, Some(color.a()), Some(mode), BlendMode::Normal)
    } else {
        (0, None, None, mode)
    };

    let mut tcs = TransientCanvasState::new(state);
    tcs.layers_mut()
        .draw_dabs(layer_id, sublayer_id, sublayer_opacity, sublayer_mode, color, dabs_mode, shape, context_id, &absolute)
        .map_err(|e| layer_error(e, layer_id))?;
    Ok(tcs.persist())
}
