//! Reusable test harness for the graphics engine integration tests.
//!
//! Provides a frame buffer implementing the blit primitive, a scripted
//! cell grid, and helpers for building commands with base64 payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use graphulator::{BlitTarget, CellGrid, CellImage, Graphics, GraphicsConfig, NoCells};
use image::RgbaImage;

/// One recorded blit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blit {
    pub width: u32,
    pub height: u32,
    pub dst_x: i32,
    pub dst_y: i32,
}

/// A back buffer that composes blits into an RGBA frame and records them.
pub struct Frame {
    pub buffer: RgbaImage,
    pub blits: Vec<Blit>,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buffer: RgbaImage::new(width, height),
            blits: Vec::new(),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.buffer.get_pixel(x, y).0
    }
}

impl BlitTarget for Frame {
    fn blit(
        &mut self,
        raster: &RgbaImage,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dst_x: i32,
        dst_y: i32,
    ) {
        self.blits.push(Blit { width, height, dst_x, dst_y });
        for dy in 0..height {
            for dx in 0..width {
                let tx = dst_x + dx as i32;
                let ty = dst_y + dy as i32;
                if tx < 0 || ty < 0 {
                    continue;
                }
                let (tx, ty) = (tx as u32, ty as u32);
                if tx >= self.buffer.width() || ty >= self.buffer.height() {
                    continue;
                }
                let pixel = *raster.get_pixel(src_x + dx, src_y + dy);
                self.buffer.put_pixel(tx, ty, pixel);
            }
        }
    }
}

/// A cell grid scripted with a fixed set of image cells.
pub struct ScriptedGrid {
    pub cells: Vec<CellImage>,
    pub cleared: Vec<(u32, u32)>,
}

impl ScriptedGrid {
    pub fn new(cells: Vec<CellImage>) -> Self {
        Self {
            cells,
            cleared: Vec::new(),
        }
    }
}

impl CellGrid for ScriptedGrid {
    fn for_each_image_cell(&mut self, callback: &mut dyn FnMut(CellImage) -> bool) {
        for cell in &self.cells {
            if callback(*cell) {
                self.cleared.push((cell.image_id, cell.placement_id));
            }
        }
    }
}

pub fn engine() -> Graphics {
    engine_with(GraphicsConfig::default())
}

pub fn engine_with(config: GraphicsConfig) -> Graphics {
    Graphics::new(GraphicsConfig {
        cache_dir_prefix: "graphulator-itest".to_string(),
        ..config
    })
    .expect("failed to create the graphics engine")
}

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Runs a command whose payload is raw bytes that get base64-encoded.
pub fn run(graphics: &mut Graphics, control: &str, payload: &[u8]) -> graphulator::CommandResult {
    let buf = if payload.is_empty() {
        format!("G{}", control)
    } else {
        format!("G{};{}", control, b64(payload))
    };
    graphics.process_command(buf.as_bytes(), &mut NoCells).clone()
}

/// A solid-color RGBA pixel buffer.
pub fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        data.extend_from_slice(&rgba);
    }
    data
}
