use crate::command::Format;
use image::RgbaImage;
use std::collections::HashMap;
use std::fs::File;
use std::time::Instant;

/// The status of an image. Each uploaded image is cached on disk first, then
/// loaded into RAM when needed. The order matters: everything below
/// `UploadOk` means there is no usable file on disk yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageStatus {
    Uninit,
    Uploading,
    UploadErr,
    UploadOk,
    RamLoadErr,
    RamLoadOk,
}

/// Why an upload failed, kept on the image so the final chunk (and queries)
/// can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    OverSizeLimit,
    CannotOpenCachedFile,
    UnexpectedSize,
    CannotCopyFile,
}

/// How the source rectangle is fit into the placement's cell box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Copy 1:1 into the top-left corner, no scaling.
    #[default]
    None,
    /// Stretch to cover the whole box, ignoring aspect ratio.
    Fill,
    /// Preserve aspect ratio, fit inside the box, centered.
    Contain,
    /// `None` if the source fits in the box, `Contain` otherwise.
    NoneOrContain,
}

/// The original image as received from the client: cached on disk, loaded
/// into RAM on demand, never displayed directly (placements are).
pub struct Image {
    /// The client id (the `i=` key). Nonzero.
    pub image_id: u32,
    /// The id from a query command (`a=q`). Nonzero means the image is
    /// ephemeral and responses must be addressed with this id.
    pub query_id: u32,
    /// The number from the transmission command (`I=`), an optional
    /// secondary handle. Zero means none.
    pub image_number: u32,
    /// Global command counter at creation time, used to pick the newest
    /// image when several share a number.
    pub command_index: u64,
    /// The last time the image was displayed or otherwise touched.
    pub atime: Instant,
    /// Size of the cached file on disk, in bytes.
    pub disk_size: u64,
    /// The size promised by the transmission header (`S=`), checked against
    /// `disk_size` when the upload finishes.
    pub expected_size: u64,
    /// Format specification (the `f=` key).
    pub format: Format,
    /// Whether the raw pixel data is zlib-compressed (`o=z`).
    pub compression: bool,
    /// Decoded pixel dimensions.
    pub pix_width: u32,
    pub pix_height: u32,
    pub status: ImageStatus,
    pub uploading_failure: Option<UploadFailure>,
    /// Response suppression level of the command that created the image;
    /// continuation chunks don't carry `q=` so it is remembered here.
    pub quiet: u8,
    /// The on-disk cache file, open exactly while a chunked upload is in
    /// progress.
    pub open_file: Option<File>,
    /// The original raster loaded into RAM.
    pub original_raster: Option<RgbaImage>,
    /// Placements by placement id.
    pub placements: HashMap<u32, Placement>,
    /// The first placement created, used when a command omits `p=`.
    pub default_placement: u32,
    /// Placement id supplied with a transmit-and-put command, used for
    /// response addressing.
    pub initial_placement_id: u32,
}

impl Image {
    pub fn new(image_id: u32, command_index: u64) -> Self {
        Self {
            image_id,
            query_id: 0,
            image_number: 0,
            command_index,
            atime: Instant::now(),
            disk_size: 0,
            expected_size: 0,
            format: Format::Auto,
            compression: false,
            pix_width: 0,
            pix_height: 0,
            status: ImageStatus::Uninit,
            uploading_failure: None,
            quiet: 0,
            open_file: None,
            original_raster: None,
            placements: HashMap::new(),
            default_placement: 0,
            initial_placement_id: 0,
        }
    }

    /// Estimated RAM usage of the original raster when loaded.
    pub fn ram_size(&self) -> u64 {
        self.pix_width as u64 * self.pix_height as u64 * 4
    }

    pub fn touch(&mut self) {
        self.atime = Instant::now();
    }

    /// Resolves a placement id for lookup. Id 0 falls back to the default
    /// placement; if there is none yet, the first placement becomes the
    /// default. Returns the concrete id, or None if it doesn't exist.
    pub fn resolve_placement(&mut self, placement_id: u32) -> Option<u32> {
        if placement_id != 0 {
            return self.placements.contains_key(&placement_id).then_some(placement_id);
        }
        if self.default_placement != 0 && self.placements.contains_key(&self.default_placement) {
            return Some(self.default_placement);
        }
        let first = self.placements.keys().next().copied()?;
        self.default_placement = first;
        Some(first)
    }
}

/// A sized, cropped, scaled view of an image, owned by that image. The
/// owning image is referenced by id, not by pointer.
pub struct Placement {
    pub image_id: u32,
    /// Nonzero, 24-bit.
    pub placement_id: u32,
    /// The last time the placement was displayed or otherwise touched.
    pub atime: Instant,
    /// Transient hint that forbids unloading during the current operation.
    pub protected: bool,
    /// True if the placement only annotates Unicode placeholder cells.
    pub virtual_placement: bool,
    pub scale_mode: ScaleMode,
    /// Cell dimensions on the grid; 0 means infer from the source rect.
    pub cols: u16,
    pub rows: u16,
    /// Source rectangle in the image's pixel space. Zero or out-of-range
    /// extents mean "from the origin to the image edge"; clamping happens
    /// when the scaled raster is composed.
    pub src_pix_x: u32,
    pub src_pix_y: u32,
    pub src_pix_width: u32,
    pub src_pix_height: u32,
    /// The source raster scaled for display, and the cell size it was
    /// scaled for. A font change invalidates it.
    pub scaled_raster: Option<RgbaImage>,
    pub scaled_cw: u16,
    pub scaled_ch: u16,
    /// If true, the emulator should not move the cursor when creating the
    /// placeholder (non-virtual placements only).
    pub do_not_move_cursor: bool,
}

impl Placement {
    pub fn new(image_id: u32, placement_id: u32) -> Self {
        Self {
            image_id,
            placement_id,
            atime: Instant::now(),
            protected: false,
            virtual_placement: false,
            scale_mode: ScaleMode::None,
            cols: 0,
            rows: 0,
            src_pix_x: 0,
            src_pix_y: 0,
            src_pix_width: 0,
            src_pix_height: 0,
            scaled_raster: None,
            scaled_cw: 0,
            scaled_ch: 0,
            do_not_move_cursor: false,
        }
    }

    /// Estimated RAM usage of the scaled raster when loaded.
    pub fn ram_size(&self) -> u64 {
        match &self.scaled_raster {
            Some(raster) => raster.width() as u64 * raster.height() as u64 * 4,
            None => 0,
        }
    }

    pub fn touch(&mut self) {
        self.atime = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(ImageStatus::Uploading < ImageStatus::UploadOk);
        assert!(ImageStatus::UploadErr < ImageStatus::UploadOk);
        assert!(ImageStatus::UploadOk < ImageStatus::RamLoadOk);
        assert!(ImageStatus::RamLoadErr < ImageStatus::RamLoadOk);
    }

    #[test]
    fn test_resolve_placement_default_fallback() {
        let mut img = Image::new(1, 0);
        assert_eq!(img.resolve_placement(0), None);

        img.placements.insert(9, Placement::new(1, 9));
        // With no default set, the first placement becomes the default.
        assert_eq!(img.resolve_placement(0), Some(9));
        assert_eq!(img.default_placement, 9);

        // A concrete id is looked up directly.
        assert_eq!(img.resolve_placement(9), Some(9));
        assert_eq!(img.resolve_placement(4), None);
    }

    #[test]
    fn test_ram_size() {
        let mut img = Image::new(1, 0);
        img.pix_width = 10;
        img.pix_height = 20;
        assert_eq!(img.ram_size(), 10 * 20 * 4);

        let mut placement = Placement::new(1, 2);
        assert_eq!(placement.ram_size(), 0);
        placement.scaled_raster = Some(RgbaImage::new(8, 4));
        assert_eq!(placement.ram_size(), 8 * 4 * 4);
    }
}
