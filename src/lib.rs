//! Terminal-side implementation of the Kitty graphics protocol with the
//! Unicode-placeholder extension: the image store and graphics-command
//! engine a terminal emulator embeds.
//!
//! The emulator hands every `ESC _ G ... ESC \` payload to
//! [`Graphics::process_command`] and reads the structured
//! [`CommandResult`] back. During redraw it brackets per-cell
//! [`Graphics::append_image_rect`] calls with [`Graphics::start_drawing`]
//! and [`Graphics::finish_drawing`], providing a [`BlitTarget`] over its
//! back buffer. Uploaded images are cached in a private temp directory and
//! in RAM, within configurable budgets.

pub mod command;
pub mod config;
pub mod draw;
pub mod engine;
pub mod raster;
pub mod store;
pub mod utils;

pub use command::{Format, GraphicsCommand};
pub use config::{load_config, GraphicsConfig};
pub use draw::{BlitTarget, ImageRect, RectBank, MAX_IMAGE_RECTS};
pub use engine::{CellGrid, CellImage, CommandResult, Graphics, NoCells, Placeholder};
pub use store::{CacheDir, Image, ImageStatus, ImageStore, Placement, ScaleMode, UploadFailure};
pub use utils::{GraphicsError, Result};
