//! A tiny end-to-end harness: load a PNG as the canvas's base layer, replay a
//! JSON-encoded command log through the engine, and write the flattened
//! result back out as a PNG. Useful as a manual test bench and as a smoke
//! test that the whole stack (image I/O, protocol, tree, engine) actually
//! fits together.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use canvas_engine::{DrawContext, EngineLimits};
use canvas_image::ImageBuffer;
use canvas_pixels::BlendMode;
use canvas_protocol::Command;
use canvas_rc::Shared;
use canvas_tree::{CanvasState, TransientCanvasState};
use clap::Parser;

/// Replays a drawing command log against a base image and writes the result.
#[derive(Parser)]
#[command(author, version, about = "Replay a canvas command log against a base image")]
struct Arguments {
    /// Base image; its dimensions become the initial canvas size.
    #[arg(long, short = 'i')]
    input: PathBuf,
    /// JSON array of commands (see `canvas_protocol::Command`'s serde form).
    #[arg(long, short = 'c')]
    commands: Option<PathBuf>,
    /// Where to write the flattened result.
    #[arg(long, short = 'o')]
    output: PathBuf,
    /// Reject canvases wider or taller than this.
    #[arg(long, default_value_t = canvas_model::MAX_CANVAS_DIMENSION)]
    max_dimension: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let arguments = Arguments::parse();

    let input_file = File::open(&arguments.input)
        .with_context(|| format!("open input image {}", arguments.input.display()))?;
    let base_image = ImageBuffer::decode_png(BufReader::new(input_file))
        .with_context(|| format!("decode input image {}", arguments.input.display()))?;

    let state = build_initial_state(&base_image, arguments.max_dimension)
        .context("build initial canvas state")?;

    let commands = match &arguments.commands {
        Some(path) => load_commands(path)?,
        None => Vec::new(),
    };

    let limits = EngineLimits::new(arguments.max_dimension);
    let mut ctx = DrawContext::new();
    let mut state = state;
    for (index, command) in commands.iter().enumerate() {
        state = canvas_engine::handle(&state, &mut ctx, &limits, command)
            .with_context(|| format!("apply command #{index} ({})", command.kind()))?;
    }

    let flattened = state.flatten();
    let output_file = File::create(&arguments.output)
        .with_context(|| format!("create output image {}", arguments.output.display()))?;
    flattened
        .encode_png(output_file)
        .with_context(|| format!("write output image {}", arguments.output.display()))?;

    tracing::info!(
        commands = commands.len(),
        width = flattened.width(),
        height = flattened.height(),
        "replay complete"
    );
    Ok(())
}

/// Resizes an empty canvas to the base image's dimensions and paints it as
/// the sole layer's initial content, context id 0 ("the host").
fn build_initial_state(base_image: &ImageBuffer, max_dimension: u32) -> Result<Shared<CanvasState>> {
    if base_image.width() > max_dimension || base_image.height() > max_dimension {
        anyhow::bail!(
            "input image {}x{} exceeds max dimension {}",
            base_image.width(),
            base_image.height(),
            max_dimension
        );
    }

    let mut tcs = TransientCanvasState::new(&CanvasState::empty());
    tcs.resize(
        0,
        base_image.height() as i32,
        base_image.width() as i32,
        0,
        0,
    )
    .context("resize canvas to base image dimensions")?;
    tcs.layers_mut()
        .create(1, 0, None, false, false, base_image.width(), base_image.height(), "Background".to_string(), 0)
        .context("create background layer")?;
    tcs.layers_mut()
        .put_image(0, 1, BlendMode::Normal, 0, 0, base_image)
        .context("paint base image onto background layer")?;
    Ok(tcs.persist())
}

fn load_commands(path: &PathBuf) -> Result<Vec<Command>> {
    let file = File::open(path).with_context(|| format!("open command log {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse command log {}", path.display()))
}
