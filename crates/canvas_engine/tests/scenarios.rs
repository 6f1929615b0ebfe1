//! End-to-end exercises of the six canvas scenarios, applying commands
//! through `canvas_engine::handle` and checking the flattened result the
//! way a host replaying a command log would.

use canvas_diff::diff_canvas_states;
use canvas_engine::{handle, DrawContext, EngineError, InvalidCommandError};
use canvas_pixels::{BlendMode, Pixel};
use canvas_protocol::{Command, Dab, DabShape, LayerCreateFlags, Quad};
use canvas_tree::CanvasState;

fn resize(state: &canvas_rc::Shared<CanvasState>, ctx: &mut DrawContext, top: i32, right: i32, bottom: i32, left: i32) -> canvas_rc::Shared<CanvasState> {
    handle(state, ctx, &Default::default(), &Command::CanvasResize { context_id: 1, top, right, bottom, left }).unwrap()
}

#[test]
fn scenario_1_empty_canvas_resize() {
    let mut ctx = DrawContext::new();
    let empty = CanvasState::empty();
    let resized = resize(&empty, &mut ctx, 0, 100, 100, 0);

    assert_eq!(resized.width(), 100);
    assert_eq!(resized.height(), 100);
    assert_eq!(resized.layers().len(), 0);

    let diff = diff_canvas_states(&empty, &resized);
    assert!(diff.tiles_changed());
    let mut count = 0;
    diff.each_index(|_| count += 1);
    assert_eq!(count, (diff.xtiles() * diff.ytiles()) as usize);
}

#[test]
fn scenario_2_single_solid_fill() {
    let mut ctx = DrawContext::new();
    let limits = Default::default();
    let state = CanvasState::empty();
    let state = resize(&state, &mut ctx, 0, 128, 128, 0);
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::LayerCreate {
            context_id: 1,
            layer_id: 1,
            source_id: 0,
            fill: Some(Pixel::from_channels(0, 0, 255, 255)),
            flags: LayerCreateFlags { insert: false, copy: false },
            title: "L".into(),
        },
    )
    .unwrap();
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::FillRect {
            context_id: 1,
            layer_id: 1,
            blend_mode_code: BlendMode::Normal as u32,
            x: 0,
            y: 0,
            width: 64,
            height: 64,
            color: Pixel::from_channels(0, 255, 0, 255),
        },
    )
    .unwrap();

    let flat = state.flatten();
    let green = Pixel::from_channels(0, 255, 0, 255);
    let red = Pixel::from_channels(0, 0, 255, 255);
    assert_eq!(flat.get(0, 0), green);
    assert_eq!(flat.get(63, 63), green);
    assert_eq!(flat.get(64, 0), red);
    assert_eq!(flat.get(0, 64), red);
    assert_eq!(flat.get(100, 100), red);
}

#[test]
fn scenario_3_indirect_draw_then_pen_up() {
    let mut ctx = DrawContext::new();
    let limits = Default::default();
    let state = CanvasState::empty();
    let state = resize(&state, &mut ctx, 0, 32, 32, 0);
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::LayerCreate {
            context_id: 1,
            layer_id: 1,
            source_id: 0,
            fill: None,
            flags: LayerCreateFlags { insert: false, copy: false },
            title: "L".into(),
        },
    )
    .unwrap();

    let black = Pixel::from_channels(0, 0, 0, 255);
    let drawn = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::DrawDabs {
            context_id: 7,
            layer_id: 1,
            shape: DabShape::Pixel,
            origin_x: 10.0,
            origin_y: 10.0,
            color: black,
            blend_mode_code: BlendMode::Normal as u32,
            indirect: true,
            dabs: vec![Dab { x: 0.0, y: 0.0, radius: 4.0, opacity: 255 }],
        },
    )
    .unwrap();

    assert_eq!(drawn.flatten().get(10, 10), Pixel::TRANSPARENT);
    assert_eq!(drawn.layers().content_at(0).sublayers().len(), 1);

    let merged = handle(&drawn, &mut ctx, &limits, &Command::PenUp { context_id: 7 }).unwrap();
    assert_eq!(merged.flatten().get(10, 10), black);
    assert!(merged.layers().content_at(0).sublayers().is_empty());
}

#[test]
fn scenario_4_put_tile_repeat() {
    let mut ctx = DrawContext::new();
    let limits = Default::default();
    let state = CanvasState::empty();
    let state = resize(&state, &mut ctx, 0, 256, 256, 0);
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::LayerCreate {
            context_id: 1,
            layer_id: 1,
            source_id: 0,
            fill: None,
            flags: LayerCreateFlags { insert: false, copy: false },
            title: "L".into(),
        },
    )
    .unwrap();

    let green = Pixel::from_channels(0, 255, 0, 255);
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::PutTile { layer_id: 1, sublayer_id: 0, tile_x: 0, tile_y: 0, repeat: 3, context_id: 1, color: Some(green), compressed_image: None },
    )
    .unwrap();

    let grid = state.layers().content_at(0).grid();
    for tx in 0..4 {
        let tile = grid.tile_at(tx, 0).expect("tile should be painted");
        assert!(tile.buf.pixels().iter().all(|p| *p == green));
    }
    assert!(grid.tile_at(0, 1).is_none());
}

#[test]
fn scenario_5_region_move_identity() {
    let mut ctx = DrawContext::new();
    let limits = Default::default();
    let state = CanvasState::empty();
    let state = resize(&state, &mut ctx, 0, 128, 128, 0);
    let state = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::LayerCreate {
            context_id: 1,
            layer_id: 1,
            source_id: 0,
            fill: None,
            flags: LayerCreateFlags { insert: false, copy: false },
            title: "L".into(),
        },
    )
    .unwrap();
    let content = handle(
        &state,
        &mut ctx,
        &limits,
        &Command::FillRect {
            context_id: 1,
            layer_id: 1,
            blend_mode_code: BlendMode::Normal as u32,
            x: 10,
            y: 20,
            width: 30,
            height: 40,
            color: Pixel::from_channels(10, 20, 30, 255),
        },
    )
    .unwrap();

    let moved = handle(
        &content,
        &mut ctx,
        &limits,
        &Command::RegionMove {
            context_id: 1,
            layer_id: 1,
            src_x: 0,
            src_y: 0,
            src_width: 128,
            src_height: 128,
            dst_quad: Quad { p0: (0.0, 0.0), p1: (128.0, 0.0), p2: (128.0, 128.0), p3: (0.0, 128.0) },
            mask: None,
        },
    )
    .unwrap();

    let before = content.flatten();
    let after = moved.flatten();
    for y in 0..128 {
        for x in 0..128 {
            assert_eq!(before.get(x, y), after.get(x, y), "mismatch at ({x},{y})");
        }
    }
}

#[test]
fn scenario_6_degenerate_resize_fails() {
    let mut ctx = DrawContext::new();
    let limits = Default::default();
    let state = CanvasState::empty();
    let state = resize(&state, &mut ctx, 0, 10, 0, 0);
    assert_eq!(state.width(), 10);

    let err = handle(&state, &mut ctx, &limits, &Command::CanvasResize { context_id: 1, top: 0, right: -10, bottom: 0, left: -10 }).unwrap_err();
    assert!(matches!(err, EngineError::InvalidCommand(InvalidCommandError::ReversedResizeBorders)));
    assert_eq!(state.width(), 10);
}
