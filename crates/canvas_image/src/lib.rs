//! Rectangular BGRA8 image buffers, PNG I/O, and the DEFLATE-compressed
//! tile/mask payload formats the wire protocol uses.

use std::io::{Read, Write};

use canvas_pixels::Pixel;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

pub const MAX_DIMENSION: u32 = canvas_model::MAX_CANVAS_DIMENSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Png(String),
    Inflate(String),
    SizeMismatch { expected: usize, actual: usize },
    DimensionTooLarge,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Png(msg) => write!(f, "malformed PNG: {msg}"),
            DecodeError::Inflate(msg) => write!(f, "malformed DEFLATE stream: {msg}"),
            DecodeError::SizeMismatch { expected, actual } => write!(
                f,
                "decompressed size mismatch: expected {expected} bytes, got {actual}"
            ),
            DecodeError::DimensionTooLarge => {
                write!(f, "image dimension exceeds {MAX_DIMENSION}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    pixels: Vec<Pixel>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Pixel::TRANSPARENT; (width as usize) * (height as usize)],
        }
    }

    pub fn from_pixels(width: u32, height: u32, pixels: Vec<Pixel>) -> Self {
        assert_eq!(pixels.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Pixel {
        self.pixels[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, pixel: Pixel) {
        self.pixels[(y * self.width + x) as usize] = pixel;
    }

    /// Copies the sub-rectangle `[x,y)..[x+w,y+h)`, clamped to this image's
    /// bounds; pixels outside the source are transparent.
    pub fn subimage(&self, x: i64, y: i64, width: u32, height: u32) -> ImageBuffer {
        let mut out = ImageBuffer::new(width, height);
        for dy in 0..height {
            let sy = y + dy as i64;
            if sy < 0 || sy >= self.height as i64 {
                continue;
            }
            for dx in 0..width {
                let sx = x + dx as i64;
                if sx < 0 || sx >= self.width as i64 {
                    continue;
                }
                out.set(dx, dy, self.get(sx as u32, sy as u32));
            }
        }
        out
    }

    pub fn decode_png<R: Read>(reader: R) -> Result<ImageBuffer, DecodeError> {
        let decoder = png::Decoder::new(reader);
        let mut reader = decoder
            .read_info()
            .map_err(|e| DecodeError::Png(e.to_string()))?;
        let info = reader.info();
        let width = info.width;
        let height = info.height;
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(DecodeError::DimensionTooLarge);
        }
        let color_type = info.color_type;
        let bit_depth = info.bit_depth;

        let mut raw = vec![0u8; reader.output_buffer_size()];
        let frame_info = reader
            .next_frame(&mut raw)
            .map_err(|e| DecodeError::Png(e.to_string()))?;
        raw.truncate(frame_info.buffer_size());

        let pixels = decode_samples_to_premultiplied_bgra(&raw, color_type, bit_depth, width, height)?;
        Ok(ImageBuffer::from_pixels(width, height, pixels))
    }

    pub fn encode_png<W: Write>(&self, writer: W) -> Result<(), DecodeError> {
        let mut encoder = png::Encoder::new(writer, self.width, self.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Default);
        let mut writer = encoder
            .write_header()
            .map_err(|e| DecodeError::Png(e.to_string()))?;

        let mut straight = Vec::with_capacity(self.pixels.len() * 4);
        for pixel in &self.pixels {
            let [b, g, r, a] = pixel.channels();
            let (r, g, b) = unpremultiply(r, g, b, a);
            straight.extend_from_slice(&[r, g, b, a]);
        }
        writer
            .write_image_data(&straight)
            .map_err(|e| DecodeError::Png(e.to_string()))
    }
}

fn unpremultiply(r: u8, g: u8, b: u8, a: u8) -> (u8, u8, u8) {
    if a == 0 {
        return (0, 0, 0);
    }
    let unscale = |c: u8| ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8;
    (unscale(r), unscale(g), unscale(b))
}

fn decode_samples_to_premultiplied_bgra(
    raw: &[u8],
    color_type: png::ColorType,
    bit_depth: png::BitDepth,
    width: u32,
    height: u32,
) -> Result<Vec<Pixel>, DecodeError> {
    let channels = match color_type {
        png::ColorType::Grayscale => 1,
        png::ColorType::GrayscaleAlpha => 2,
        png::ColorType::Rgb => 3,
        png::ColorType::Rgba => 4,
        png::ColorType::Indexed => {
            return Err(DecodeError::Png("indexed PNGs are not supported".into()))
        }
    };
    let bytes_per_sample = match bit_depth {
        png::BitDepth::Eight => 1,
        png::BitDepth::Sixteen => 2,
        _ => return Err(DecodeError::Png("only 8/16-bit depths are supported".into())),
    };

    // For 16-bit samples we scale down to 8-bit by keeping only the high
    // (most-significant) byte of each big-endian sample.
    let sample_at = |row: &[u8], channel_index: usize| -> u8 { row[channel_index * bytes_per_sample] };

    let pixel_count = (width as usize) * (height as usize);
    let mut pixels = Vec::with_capacity(pixel_count);
    let row_bytes = width as usize * channels * bytes_per_sample;
    if raw.len() < row_bytes * height as usize {
        return Err(DecodeError::SizeMismatch {
            expected: row_bytes * height as usize,
            actual: raw.len(),
        });
    }

    for y in 0..height as usize {
        let row = &raw[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..width as usize {
            let base = x * channels;
            let (r, g, b, a) = match channels {
                1 => {
                    let v = sample_at(row, base);
                    (v, v, v, 255u8)
                }
                2 => {
                    let v = sample_at(row, base);
                    let a = sample_at(row, base + 1);
                    (v, v, v, a)
                }
                3 => (
                    sample_at(row, base),
                    sample_at(row, base + 1),
                    sample_at(row, base + 2),
                    255u8,
                ),
                4 => (
                    sample_at(row, base),
                    sample_at(row, base + 1),
                    sample_at(row, base + 2),
                    sample_at(row, base + 3),
                ),
                _ => unreachable!(),
            };
            let premultiply = |c: u8| ((c as u32 * a as u32) / 255) as u8;
            pixels.push(Pixel::from_channels(
                premultiply(b),
                premultiply(g),
                premultiply(r),
                a,
            ));
        }
    }
    Ok(pixels)
}

/// Inflates a zlib-wrapped BGRA payload that must decompress to exactly
/// `4 * width * height` bytes.
pub fn decode_compressed_bgra(width: u32, height: u32, compressed: &[u8]) -> Result<ImageBuffer, DecodeError> {
    let expected = 4 * width as usize * height as usize;
    let raw = inflate(compressed, expected)?;
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for chunk in raw.chunks_exact(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        pixels.push(Pixel::from_wire_le(word));
    }
    Ok(ImageBuffer::from_pixels(width, height, pixels))
}

/// Inflates a zlib-wrapped 1-bpp monochrome mask (MSB first, rows padded to
/// a 32-bit boundary) into a `width * height` coverage buffer (0 or 255).
pub fn decode_compressed_monochrome_mask(
    width: u32,
    height: u32,
    compressed: &[u8],
) -> Result<Vec<u8>, DecodeError> {
    let row_words = (width as usize).div_ceil(32);
    let row_bytes = row_words * 4;
    let expected = row_bytes * height as usize;
    let raw = inflate(compressed, expected)?;

    let mut mask = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height as usize {
        let row = &raw[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..width as usize {
            let byte = row[x / 8];
            let bit = 7 - (x % 8);
            let set = (byte >> bit) & 1 != 0;
            mask.push(if set { 255 } else { 0 });
        }
    }
    Ok(mask)
}

fn inflate(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| DecodeError::Inflate(e.to_string()))?;
    if raw.len() != expected_len {
        return Err(DecodeError::SizeMismatch {
            expected: expected_len,
            actual: raw.len(),
        });
    }
    Ok(raw)
}

/// Deflates a BGRA buffer the same way a peer producing compressed tile
/// payloads would; used by tests to build compressed fixtures and
/// available to hosts that need to re-compress a tile for the wire.
pub fn compress_bgra(image: &ImageBuffer) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    for pixel in image.pixels() {
        encoder.write_all(&pixel.0.to_le_bytes()).expect("write to memory buffer cannot fail");
    }
    encoder.finish().expect("zlib finish cannot fail for an in-memory buffer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_round_trip_reproduces_every_pixel() {
        let mut image = ImageBuffer::new(4, 3);
        for y in 0..3 {
            for x in 0..4 {
                image.set(x, y, Pixel::from_channels((x * 10) as u8, (y * 20) as u8, 200, 255));
            }
        }
        let mut buf = Vec::new();
        image.encode_png(&mut buf).unwrap();
        let decoded = ImageBuffer::decode_png(buf.as_slice()).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 3);
        for y in 0..3 {
            for x in 0..4 {
                assert_eq!(decoded.get(x, y), image.get(x, y));
            }
        }
    }

    #[test]
    fn compressed_tile_round_trip_reproduces_uniform_color() {
        let color = Pixel::from_channels(11, 22, 33, 255);
        let image = ImageBuffer::new(8, 8);
        let mut filled = image.clone();
        for y in 0..8 {
            for x in 0..8 {
                filled.set(x, y, color);
            }
        }
        let compressed = compress_bgra(&filled);
        let decoded = decode_compressed_bgra(8, 8, &compressed).unwrap();
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(decoded.get(x, y), color);
            }
        }
    }

    #[test]
    fn decode_compressed_bgra_rejects_size_mismatch() {
        let compressed = compress_bgra(&ImageBuffer::new(4, 4));
        let err = decode_compressed_bgra(5, 5, &compressed).unwrap_err();
        assert!(matches!(err, DecodeError::SizeMismatch { .. }));
    }

    #[test]
    fn subimage_clips_to_source_bounds() {
        let mut image = ImageBuffer::new(4, 4);
        image.set(0, 0, Pixel::from_channels(1, 2, 3, 255));
        let sub = image.subimage(-2, -2, 4, 4);
        assert_eq!(sub.get(0, 0), Pixel::TRANSPARENT);
        assert_eq!(sub.get(2, 2), image.get(0, 0));
    }

    #[test]
    fn monochrome_mask_round_trip() {
        let width = 33u32; // forces row padding beyond one 32-bit word
        let height = 2u32;
        let row_words = (width as usize).div_ceil(32);
        let row_bytes = row_words * 4;
        let mut raw = vec![0u8; row_bytes * height as usize];
        raw[0] = 0b1000_0000; // first pixel of row 0 set
        raw[row_bytes] = 0b0000_0001; // bit 7 of byte 0 -> pixel index 7 of row 1... adjust below

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let mask = decode_compressed_monochrome_mask(width, height, &compressed).unwrap();
        assert_eq!(mask.len(), (width * height) as usize);
        assert_eq!(mask[0], 255);
        assert_eq!(mask[1], 0);
    }
}
