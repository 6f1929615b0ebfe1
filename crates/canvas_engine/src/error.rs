use std::cell::RefCell;

use canvas_image::DecodeError;
use canvas_tree::{TransformErrorKind, TreeError};
use canvas_transform::TransformError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidCommandError {
    UnknownBlendMode(u32),
    BlendModeNotValidForBrush,
    DegenerateRectangle,
    DegenerateTransform,
    DimensionOutOfRange,
    ReversedResizeBorders,
    MergeAtBaseLayer,
    RegionTooLarge,
}

impl std::fmt::Display for InvalidCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidCommandError::UnknownBlendMode(code) => write!(f, "unknown blend mode code {code}"),
            InvalidCommandError::BlendModeNotValidForBrush => write!(f, "blend mode is not valid for brush operations"),
            InvalidCommandError::DegenerateRectangle => write!(f, "rectangle is empty or degenerate"),
            InvalidCommandError::DegenerateTransform => write!(f, "destination quad is degenerate"),
            InvalidCommandError::DimensionOutOfRange => write!(f, "canvas dimension out of range"),
            InvalidCommandError::ReversedResizeBorders => write!(f, "resize borders are reversed"),
            InvalidCommandError::MergeAtBaseLayer => write!(f, "cannot merge the base layer downward"),
            InvalidCommandError::RegionTooLarge => write!(f, "destination quad bounds exceed the canvas"),
        }
    }
}

impl std::error::Error for InvalidCommandError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundError {
    Layer(i32),
}

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundError::Layer(id) => write!(f, "layer {id} not found"),
        }
    }
}

impl std::error::Error for NotFoundError {}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Decode(DecodeError),
    InvalidCommand(InvalidCommandError),
    NotFound(NotFoundError),
    ResourceExhausted,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Decode(e) => write!(f, "decode error: {e}"),
            EngineError::InvalidCommand(e) => write!(f, "invalid command: {e}"),
            EngineError::NotFound(e) => write!(f, "not found: {e}"),
            EngineError::ResourceExhausted => write!(f, "resource exhausted: transform raster budget exceeded"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Decode(e)
    }
}

impl From<InvalidCommandError> for EngineError {
    fn from(e: InvalidCommandError) -> Self {
        EngineError::InvalidCommand(e)
    }
}

impl From<TransformError> for EngineError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::DegenerateQuad => EngineError::InvalidCommand(InvalidCommandError::DegenerateTransform),
            TransformError::ResourceExhausted => EngineError::ResourceExhausted,
        }
    }
}

impl From<TreeError> for EngineError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound => EngineError::NotFound(NotFoundError::Layer(0)),
            TreeError::DimensionOutOfRange => EngineError::InvalidCommand(InvalidCommandError::DimensionOutOfRange),
            TreeError::EmptyRegion => EngineError::InvalidCommand(InvalidCommandError::DegenerateRectangle),
            TreeError::RegionTooLarge => EngineError::InvalidCommand(InvalidCommandError::RegionTooLarge),
            TreeError::Transform(TransformErrorKind::Degenerate) => {
                EngineError::InvalidCommand(InvalidCommandError::DegenerateTransform)
            }
            TreeError::Transform(TransformErrorKind::ResourceExhausted) => EngineError::ResourceExhausted,
        }
    }
}

/// Maps a `TreeError` into an `EngineError`, filling in the layer id the
/// failing call was operating on (the tree crate itself doesn't carry ids
/// in its errors, since a `LayerList` index lookup is all it has to go on).
pub(crate) fn layer_error(err: TreeError, layer_id: i32) -> EngineError {
    match err {
        TreeError::NotFound => EngineError::NotFound(NotFoundError::Layer(layer_id)),
        other => other.into(),
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn record(error: &EngineError) {
    let rendered = error.to_string();
    tracing::warn!(error = %rendered, "command handler failed");
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(rendered));
}

/// The rendered `Display` of the most recent handler failure on this
/// thread, if any. Callers that receive an `Err` from `handle` should read
/// this immediately; it is overwritten by the next failure.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}
