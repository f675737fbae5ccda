pub mod delete;
pub mod result;
pub mod upload;

pub use result::{CommandResult, Placeholder};

use crate::command::{self, GraphicsCommand, ParseError};
use crate::config::GraphicsConfig;
use crate::draw::{BlitTarget, ImageRect, RectBank};
use crate::raster;
use crate::store::{CacheDir, ImageStatus, ImageStore, ScaleMode};
use crate::utils::{sanitized_str, Result};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// One image-occupied cell, as reported by the emulator during cell
/// iteration.
#[derive(Debug, Clone, Copy)]
pub struct CellImage {
    pub image_id: u32,
    pub placement_id: u32,
    pub col: u32,
    pub row: u32,
    /// True for classic placements; virtual placeholder cells are never
    /// cleared by delete-by-cell.
    pub is_classic: bool,
}

/// The emulator-side view of the cell grid. Delete commands that imply cell
/// iteration call this to find and clear placeholder cells.
pub trait CellGrid {
    /// Calls `callback` for every image-occupied cell on the grid; the
    /// callback returns true if the cell should be (and was) cleared.
    fn for_each_image_cell(&mut self, callback: &mut dyn FnMut(CellImage) -> bool);
}

/// A `CellGrid` with no image cells, for hosts that don't track them.
pub struct NoCells;

impl CellGrid for NoCells {
    fn for_each_image_cell(&mut self, _callback: &mut dyn FnMut(CellImage) -> bool) {}
}

/// The graphics-command engine: parses escape payloads, maintains the
/// two-tier image cache, and draws placement fragments into the back buffer
/// at placeholder positions.
pub struct Graphics {
    config: GraphicsConfig,
    store: ImageStore,
    cache: CacheDir,
    bank: RectBank,
    /// Current cell dimensions in pixels, updated by the drawing entry
    /// points. Zero until the first frame.
    current_cw: u16,
    current_ch: u16,
    /// The image a direct upload without ids continues, or 0.
    current_upload_image_id: u32,
    /// Monotonic command counter, recorded on images at creation.
    command_index: u64,
    result: CommandResult,
}

impl Graphics {
    pub fn new(config: GraphicsConfig) -> Result<Self> {
        crate::config::validate(&config)?;
        let cache = CacheDir::new(&config.cache_dir_prefix)?;
        Ok(Self {
            config,
            store: ImageStore::new(),
            cache,
            bank: RectBank::new(),
            current_cw: 0,
            current_ch: 0,
            current_upload_image_id: 0,
            command_index: 0,
            result: CommandResult::default(),
        })
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// The result of the most recently processed command.
    pub fn last_result(&self) -> &CommandResult {
        &self.result
    }

    /// Parses and executes a graphics command. `buf` is the escape payload
    /// with the enclosing sequence stripped; its first byte must be 'G'.
    pub fn process_command(&mut self, buf: &[u8], cells: &mut dyn CellGrid) -> &CommandResult {
        self.result.clear();
        if buf.first() != Some(&b'G') {
            return &self.result;
        }
        self.command_index += 1;
        log::debug!(
            "### Command {}: {}",
            self.command_index,
            sanitized_str(&String::from_utf8_lossy(&buf[..buf.len().min(80)]))
        );

        let mut cmd = match command::parse(&buf[1..]) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.report_parse_error(&e);
                return &self.result;
            }
        };

        // Whether anyone can correlate a response to this command. A
        // continuation chunk learns its image id during dispatch, so this
        // is re-checked at the end.
        let no_ids_given = cmd.image_id == 0 && cmd.image_number == 0;

        match cmd.action {
            None => {
                // No action may still be a data transmission chunk.
                if cmd.is_data_transmission {
                    self.handle_transmit(&mut cmd);
                } else {
                    self.report_error_cmd(&cmd, "EINVAL: no action specified");
                }
            }
            Some('t') | Some('q') => {
                // 'q' is a query: same as transmit, but with a fake id and
                // the image is discarded after the response.
                self.handle_transmit(&mut cmd);
            }
            Some('p') => self.handle_put(&mut cmd),
            Some('T') => {
                let image_id = self.handle_transmit(&mut cmd);
                if let Some(image_id) = image_id {
                    if !cmd.is_direct_transmission_continuation {
                        cmd.image_id = image_id;
                        self.handle_put(&mut cmd);
                        if cmd.placement_id != 0 {
                            if let Some(img) = self.store.find_image_mut(image_id) {
                                img.initial_placement_id = cmd.placement_id;
                            }
                        }
                    }
                }
            }
            Some('d') => self.handle_delete(&cmd, cells),
            Some(other) => {
                self.report_error_cmd(&cmd, &format!("EINVAL: unsupported action: {}", other));
            }
        }

        // Enforce the quiet level after all writers have finished.
        if cmd.quiet > 0 && (!self.result.error || cmd.quiet >= 2) {
            self.result.response.clear();
        }
        // Commands that carried no id at all get no response either, unless
        // they turned out to continue an upload with a known image.
        if no_ids_given && !cmd.is_direct_transmission_continuation {
            self.result.response.clear();
        }
        &self.result
    }

    /// Handles the put command: creates (or replaces) a placement.
    fn handle_put(&mut self, cmd: &mut GraphicsCommand) {
        if cmd.image_id == 0 && cmd.image_number == 0 {
            self.report_error_cmd(
                cmd,
                "EINVAL: neither image id nor image number are specified or both are zero",
            );
            return;
        }

        let Some(image_id) = self.find_image_for_command(cmd) else {
            self.report_error_cmd(cmd, "ENOENT: image not found");
            return;
        };
        cmd.image_id = image_id;

        let Some(placement_id) = self.store.new_placement(image_id, cmd.placement_id) else {
            self.report_error_cmd(cmd, "ENOENT: image not found");
            return;
        };
        if let Some(placement) = self.store.find_placement_mut(image_id, placement_id) {
            placement.virtual_placement = cmd.virtual_placement;
            placement.cols = cmd.columns;
            placement.rows = cmd.rows;
            placement.src_pix_x = cmd.src_x;
            placement.src_pix_y = cmd.src_y;
            placement.src_pix_width = cmd.src_w;
            placement.src_pix_height = cmd.src_h;
            placement.do_not_move_cursor = cmd.do_not_move_cursor;
            placement.scale_mode = if cmd.virtual_placement {
                ScaleMode::Contain
            } else if cmd.columns != 0 || cmd.rows != 0 {
                ScaleMode::Fill
            } else {
                ScaleMode::None
            };
        }

        self.display_nonvirtual_placement(image_id, placement_id);
        self.report_success_cmd(cmd);
    }

    /// Records the placeholder-creation request for a non-virtual placement
    /// of a successfully loaded image. The placeholder glyphs themselves are
    /// created by the terminal after the command finishes.
    pub(crate) fn display_nonvirtual_placement(&mut self, image_id: u32, placement_id: u32) {
        {
            let Some(img) = self.store.find_image(image_id) else {
                return;
            };
            let Some(placement) = img.placements.get(&placement_id) else {
                return;
            };
            if placement.virtual_placement {
                return;
            }
            if img.status < ImageStatus::RamLoadOk {
                return;
            }
        }
        raster::infer_placement_size(
            &mut self.store,
            image_id,
            placement_id,
            self.current_cw,
            self.current_ch,
        );
        let Some(placement) = self.store.find_placement(image_id, placement_id) else {
            return;
        };
        log::debug!(
            "Creating a placeholder for {}/{}  {} x {}",
            image_id,
            placement_id,
            placement.cols,
            placement.rows
        );
        self.result.placeholder = Some(Placeholder {
            image_id,
            placement_id,
            columns: placement.cols as u32,
            rows: placement.rows as u32,
            do_not_move_cursor: placement.do_not_move_cursor,
        });
    }

    /// Finds the image by id, or by number when the id is absent. Returns
    /// the concrete image id.
    pub(crate) fn find_image_for_command(&self, cmd: &GraphicsCommand) -> Option<u32> {
        if cmd.image_id != 0 {
            return self.store.find_image(cmd.image_id).map(|img| img.image_id);
        }
        self.store
            .find_image_by_number(cmd.image_number)
            .map(|img| img.image_id)
    }

    // ---- responses ----

    pub(crate) fn report_success_cmd(&mut self, cmd: &GraphicsCommand) {
        if cmd.quiet < 1 && !cmd.more {
            self.result
                .set_response(cmd.image_id, cmd.image_number, cmd.placement_id, "OK");
        }
    }

    /// Creates the OK response addressed with the image's ids (the query id
    /// takes precedence for ephemeral query images).
    pub(crate) fn report_success_img(&mut self, image_id: u32) {
        let Some(img) = self.store.find_image(image_id) else {
            return;
        };
        let id = if img.query_id != 0 { img.query_id } else { img.image_id };
        if img.quiet < 1 {
            let (number, placement) = (img.image_number, img.initial_placement_id);
            self.result.set_response(id, number, placement, "OK");
        }
    }

    pub(crate) fn report_error_cmd(&mut self, cmd: &GraphicsCommand, message: &str) {
        self.result.error = true;
        log::error!("{}  in command: {}", message, sanitized_str(cmd.control));
        if cmd.quiet < 2 {
            self.result
                .set_response(cmd.image_id, cmd.image_number, cmd.placement_id, message);
        }
    }

    pub(crate) fn report_error_img(&mut self, image_id: u32, message: &str) {
        self.result.error = true;
        match self.store.find_image(image_id) {
            None => {
                log::error!("{}", message);
                self.result.set_response(0, 0, 0, message);
            }
            Some(img) => {
                let id = if img.query_id != 0 { img.query_id } else { img.image_id };
                log::error!("{}  id={}", message, id);
                if img.quiet < 2 {
                    let (number, placement) = (img.image_number, img.initial_placement_id);
                    self.result.set_response(id, number, placement, message);
                }
            }
        }
    }

    fn report_parse_error(&mut self, e: &ParseError) {
        self.result.error = true;
        log::error!("{}", e.message);
        if e.quiet < 2 {
            self.result
                .set_response(e.image_id, e.image_number, e.placement_id, &e.message);
        }
    }

    // ---- drawing ----

    /// Prepares for drawing a frame. `cw` and `ch` are the current cell
    /// dimensions in pixels.
    pub fn start_drawing(&mut self, cw: u16, ch: u16) {
        self.current_cw = cw;
        self.current_ch = ch;
    }

    /// Adds an image rectangle to the pending bank. Vertically contiguous
    /// stripes merge; under bank pressure one rectangle is drawn eagerly.
    /// Must be called between `start_drawing` and `finish_drawing`.
    #[allow(clippy::too_many_arguments)]
    pub fn append_image_rect(
        &mut self,
        target: &mut dyn BlitTarget,
        image_id: u32,
        placement_id: u32,
        start_col: i32,
        end_col: i32,
        start_row: i32,
        end_row: i32,
        x_pix: i32,
        y_pix: i32,
        cw: u16,
        ch: u16,
        reverse: bool,
    ) {
        self.current_cw = cw;
        self.current_ch = ch;
        let rect = ImageRect {
            image_id,
            placement_id,
            x_pix,
            y_pix,
            start_col,
            end_col,
            start_row,
            end_row,
            cw,
            ch,
            reverse,
        };
        if let Some(evicted) = self.bank.append(rect) {
            self.draw_rect(target, &evicted);
        }
    }

    /// Draws all rectangles left in the bank. Call at the end of the frame.
    pub fn finish_drawing(&mut self, target: &mut dyn BlitTarget) {
        let rects: Vec<ImageRect> = self.bank.drain().collect();
        for rect in rects {
            self.draw_rect(target, &rect);
        }
    }

    /// Draws one rectangle of a placement, composing the scaled raster on
    /// demand.
    fn draw_rect(&mut self, target: &mut dyn BlitTarget, rect: &ImageRect) {
        let resolved = self
            .store
            .find_image_mut(rect.image_id)
            .and_then(|img| img.resolve_placement(rect.placement_id));
        let Some(placement_id) = resolved else {
            log::debug!("no placement to draw for {}/{}", rect.image_id, rect.placement_id);
            return;
        };

        raster::load_placement(
            &mut self.store,
            rect.image_id,
            placement_id,
            rect.cw,
            rect.ch,
            &self.cache,
            &self.config,
        );

        {
            let Some(placement) = self.store.find_placement(rect.image_id, placement_id) else {
                return;
            };
            let Some(raster) = placement.scaled_raster.as_ref() else {
                return;
            };

            let src_x = (rect.start_col.max(0) as u32) * rect.cw as u32;
            let src_y = (rect.start_row.max(0) as u32) * rect.ch as u32;
            if src_x >= raster.width() || src_y >= raster.height() {
                return;
            }
            let width = ((rect.end_col - rect.start_col).max(0) as u32 * rect.cw as u32)
                .min(raster.width() - src_x);
            let height = ((rect.end_row - rect.start_row).max(0) as u32 * rect.ch as u32)
                .min(raster.height() - src_y);
            if width == 0 || height == 0 {
                return;
            }

            if rect.reverse {
                // Invert the colors of the fragment, keeping alpha.
                let mut fragment =
                    image::imageops::crop_imm(raster, src_x, src_y, width, height).to_image();
                for pixel in fragment.pixels_mut() {
                    pixel.0[0] = 255 - pixel.0[0];
                    pixel.0[1] = 255 - pixel.0[1];
                    pixel.0[2] = 255 - pixel.0[2];
                }
                target.blit(&fragment, 0, 0, width, height, rect.x_pix, rect.y_pix);
            } else {
                target.blit(raster, src_x, src_y, width, height, rect.x_pix, rect.y_pix);
            }
        }

        self.store.touch_placement(rect.image_id, placement_id);
    }

    // ---- diagnostics and bulk operations ----

    /// Unloads every raster from RAM, keeping disk files, so the emulator
    /// can shed memory (e.g. when losing focus).
    pub fn unload_all_rasters(&mut self) {
        self.store.unload_all_rasters();
    }

    /// A short human-readable description of one placement.
    pub fn describe_placement(&self, image_id: u32, placement_id: u32) -> String {
        let Some(img) = self.store.find_image(image_id) else {
            return format!("image {} does not exist", image_id);
        };
        let Some(placement) = img.placements.get(&placement_id) else {
            return format!("placement {}/{} does not exist", image_id, placement_id);
        };
        format!(
            "placement {}/{}: {} cols x {} rows, {:?}{}, {}",
            image_id,
            placement_id,
            placement.cols,
            placement.rows,
            placement.scale_mode,
            if placement.virtual_placement { ", virtual" } else { "" },
            match &placement.scaled_raster {
                Some(_) => format!("loaded into ram ({} KiB)", placement.ram_size() / 1024),
                None => "not loaded into ram".to_string(),
            }
        )
    }

    /// Dumps the internal state (images and placements) to stderr,
    /// recomputing the totals and warning when the tracked counters drifted.
    pub fn dump_state(&self) {
        let now = Instant::now();
        eprintln!("======== Graphics module state dump ========");
        eprintln!("Image count: {}", self.store.image_count());
        eprintln!("Estimated RAM usage: {} KiB", self.store.ram_bytes() / 1024);
        eprintln!("Estimated Disk usage: {} KiB", self.store.disk_bytes() / 1024);

        let mut ram_computed: u64 = 0;
        let mut disk_computed: u64 = 0;
        for img in self.store.images() {
            eprintln!("----------------");
            eprintln!("Image {}", img.image_id);
            eprintln!("    accessed {}", format_ago(now.duration_since(img.atime)));
            eprintln!("    status: {:?}", img.status);
            if let Some(failure) = img.uploading_failure {
                eprintln!("    uploading failure: {:?}", failure);
            }
            eprintln!("    pix size: {}x{}", img.pix_width, img.pix_height);
            if img.disk_size > 0 {
                eprintln!("    file: {}", self.cache.image_path(img.image_id).display());
            } else {
                eprintln!("    not on disk");
            }
            eprintln!("    disk size: {} KiB", img.disk_size / 1024);
            disk_computed += img.disk_size;
            if img.original_raster.is_some() {
                eprintln!("    loaded into ram, size: {} KiB", img.ram_size() / 1024);
                ram_computed += img.ram_size();
            } else {
                eprintln!("    not loaded into ram");
            }
            eprintln!("    default_placement = {}", img.default_placement);
            for placement in img.placements.values() {
                eprintln!("    Placement {}", placement.placement_id);
                if placement.image_id != img.image_id {
                    eprintln!("        ERROR: WRONG IMAGE ID");
                }
                eprintln!(
                    "        accessed {}",
                    format_ago(now.duration_since(placement.atime))
                );
                eprintln!("        scale_mode = {:?}", placement.scale_mode);
                eprintln!(
                    "        cell size: {} cols x {} rows",
                    placement.cols, placement.rows
                );
                if placement.scaled_raster.is_some() {
                    eprintln!(
                        "        loaded into ram, size: {} KiB",
                        placement.ram_size() / 1024
                    );
                    ram_computed += placement.ram_size();
                    eprintln!(
                        "        cell size: {}x{}",
                        placement.scaled_cw, placement.scaled_ch
                    );
                } else {
                    eprintln!("        not loaded into ram");
                }
            }
        }
        if self.store.ram_bytes() != ram_computed {
            eprintln!(
                "WARNING: tracked ram size is {}, but computed value is {}",
                self.store.ram_bytes(),
                ram_computed
            );
        }
        if self.store.disk_bytes() != disk_computed {
            eprintln!(
                "WARNING: tracked disk size is {}, but computed value is {}",
                self.store.disk_bytes(),
                disk_computed
            );
        }
        eprintln!("============================================");
    }
}

/// Formats a duration as "N sec ago" / "N min N sec ago" / "N hr ...".
fn format_ago(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    let mut out = String::new();
    if seconds < 1.0 {
        let _ = write!(out, "{:.2} sec ago", seconds);
    } else if seconds < 60.0 {
        let _ = write!(out, "{} sec ago", seconds as u64);
    } else if seconds < 3600.0 {
        let s = seconds as u64;
        let _ = write!(out, "{} min {} sec ago", s / 60, s % 60);
    } else {
        let s = seconds as u64;
        let _ = write!(out, "{} hr {} min {} sec ago", s / 3600, s % 3600 / 60, s % 60);
    }
    out
}
