//! The command dispatcher: `handle` maps an immutable canvas snapshot plus
//! one drawing message to a new immutable snapshot, or leaves the input
//! untouched and records why on the thread-local error channel.

mod context;
mod error;
mod handlers;
mod limits;

use canvas_protocol::Command;
use canvas_rc::Shared;
use canvas_tree::CanvasState;

pub use context::DrawContext;
pub use error::{last_error, EngineError, InvalidCommandError, NotFoundError};
pub use limits::EngineLimits;

/// Applies `command` to `state`, returning the resulting snapshot.
///
/// On failure the returned error is also recorded on this thread's
/// last-error channel (readable via [`last_error`]) and `state` is
/// untouched: the caller keeps using its existing handle.
#[tracing::instrument(level = "debug", skip(state, ctx, limits), fields(kind = command.kind()))]
pub fn handle(
    state: &Shared<CanvasState>,
    ctx: &mut DrawContext,
    limits: &EngineLimits,
    command: &Command,
) -> Result<Shared<CanvasState>, EngineError> {
    handlers::dispatch(state, ctx, limits, command).inspect_err(|e| error::record(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_pixels::{BlendMode, Pixel};
    use canvas_protocol::{Command, DabShape, LayerCreateFlags, Quad};

    fn fresh() -> Shared<CanvasState> {
        CanvasState::empty()
    }

    #[test]
    fn resize_on_empty_canvas_sets_dimensions() {
        let state = fresh();
        let mut ctx = DrawContext::new();
        let limits = EngineLimits::default();
        let resized = handle(
            &state,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: 100, bottom: 100, left: 0 },
        )
        .unwrap();
        assert_eq!(resized.width(), 100);
        assert_eq!(resized.height(), 100);
        assert_eq!(resized.layers().len(), 0);
    }

    #[test]
    fn degenerate_resize_fails_and_leaves_state_untouched() {
        let state = fresh();
        let mut ctx = DrawContext::new();
        let limits = EngineLimits::default();
        let resized = handle(
            &state,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: 100, bottom: 0, left: 0 },
        )
        .unwrap();

        let err = handle(
            &resized,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: -10, bottom: 0, left: -10 },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCommand(InvalidCommandError::ReversedResizeBorders)));
        assert!(last_error().unwrap().contains("reversed"));
        assert_eq!(resized.width(), 100);
    }

    #[test]
    fn unknown_blend_mode_is_rejected() {
        let state = fresh();
        let mut ctx = DrawContext::new();
        let limits = EngineLimits::default();
        let resized = handle(
            &state,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: 8, bottom: 8, left: 0 },
        )
        .unwrap();
        let with_layer = handle(
            &resized,
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

        let err = handle(
            &with_layer,
            &mut ctx,
            &limits,
            &Command::FillRect {
                context_id: 1,
                layer_id: 1,
                blend_mode_code: 255,
                x: 0,
                y: 0,
                width: 4,
                height: 4,
                color: Pixel::from_channels(0, 0, 255, 255),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCommand(InvalidCommandError::UnknownBlendMode(255))));
    }

    #[test]
    fn pixel_dab_with_no_dabs_is_a_no_op_returning_same_snapshot() {
        let state = fresh();
        let mut ctx = DrawContext::new();
        let limits = EngineLimits::default();
        let resized = handle(
            &state,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: 8, bottom: 8, left: 0 },
        )
        .unwrap();
        let with_layer = handle(
            &resized,
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

        let result = handle(
            &with_layer,
            &mut ctx,
            &limits,
            &Command::DrawDabs {
                context_id: 1,
                layer_id: 1,
                shape: DabShape::Pixel,
                origin_x: 0.0,
                origin_y: 0.0,
                color: Pixel::from_channels(0, 0, 0, 255),
                blend_mode_code: BlendMode::Normal as u32,
                indirect: false,
                dabs: Vec::new(),
            },
        )
        .unwrap();
        assert!(canvas_rc::Shared::ptr_eq(&result, &with_layer));
    }

    #[test]
    fn region_move_rejects_dst_quad_larger_than_canvas() {
        let state = fresh();
        let mut ctx = DrawContext::new();
        let limits = EngineLimits::default();
        let resized = handle(
            &state,
            &mut ctx,
            &limits,
            &Command::CanvasResize { context_id: 1, top: 0, right: 8, bottom: 8, left: 0 },
        )
        .unwrap();
        let with_layer = handle(
            &resized,
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

        let err = handle(
            &with_layer,
            &mut ctx,
            &limits,
            &Command::RegionMove {
                context_id: 1,
                layer_id: 1,
                src_x: 0,
                src_y: 0,
                src_width: 8,
                src_height: 8,
                dst_quad: Quad { p0: (0.0, 0.0), p1: (1000.0, 0.0), p2: (1000.0, 1000.0), p3: (0.0, 1000.0) },
                mask: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCommand(InvalidCommandError::RegionTooLarge)));
    }
}
