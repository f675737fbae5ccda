pub mod disk;
pub mod eviction;
pub mod image;

pub use disk::CacheDir;
pub use image::{Image, ImageStatus, Placement, ScaleMode, UploadFailure};

use rand::Rng;
use std::collections::HashMap;

/// The two-tier image cache: images by id, placements inside their images,
/// with running totals of disk and RAM usage.
pub struct ImageStore {
    images: HashMap<u32, Image>,
    disk_bytes: u64,
    ram_bytes: u64,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            disk_bytes: 0,
            ram_bytes: 0,
        }
    }

    /// Total bytes of all cached image files on disk.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    /// Total bytes of all rasters (original and scaled) loaded into RAM.
    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn placement_count(&self) -> usize {
        self.images.values().map(|img| img.placements.len()).sum()
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn find_image(&self, image_id: u32) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub fn find_image_mut(&mut self, image_id: u32) -> Option<&mut Image> {
        self.images.get_mut(&image_id)
    }

    /// Finds the image with the given number. When several images share the
    /// number, the one created last (highest command index) wins.
    pub fn find_image_by_number(&self, image_number: u32) -> Option<&Image> {
        if image_number == 0 {
            return None;
        }
        self.images
            .values()
            .filter(|img| img.image_number == image_number)
            .max_by_key(|img| img.command_index)
    }

    pub fn find_placement(&self, image_id: u32, placement_id: u32) -> Option<&Placement> {
        self.images.get(&image_id)?.placements.get(&placement_id)
    }

    pub fn find_placement_mut(
        &mut self,
        image_id: u32,
        placement_id: u32,
    ) -> Option<&mut Placement> {
        self.images.get_mut(&image_id)?.placements.get_mut(&placement_id)
    }

    /// Creates a new image with the given id, deleting any previous image
    /// with that id first. Id 0 generates a random id that needs a full
    /// 32-bit foreground color to encode (neither the top byte nor the
    /// middle two bytes are zero). Returns the actual id.
    pub fn new_image(&mut self, requested_id: u32, command_index: u64, cache: &CacheDir) -> u32 {
        let id = if requested_id == 0 {
            let id = self.generate_image_id();
            log::debug!("Generated random image id {}", id);
            id
        } else {
            requested_id
        };
        if self.images.contains_key(&id) {
            self.delete_image(id, cache);
        }
        log::debug!("Creating image {}", id);
        self.images.insert(id, Image::new(id, command_index));
        id
    }

    fn generate_image_id(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let id: u32 = rng.random();
            // Avoid ids that don't need full 32 bits.
            if id & 0xFF00_0000 == 0 || id & 0x00FF_FF00 == 0 {
                continue;
            }
            if self.images.contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    /// Creates a new placement on an image, deleting any previous placement
    /// with that id first. Id 0 generates a random 24-bit id whose middle
    /// two bytes are nonzero. Returns the actual id, or None if the image
    /// doesn't exist.
    pub fn new_placement(&mut self, image_id: u32, requested_id: u32) -> Option<u32> {
        let img = self.images.get_mut(&image_id)?;
        let id = if requested_id == 0 {
            Self::generate_placement_id(img)
        } else {
            requested_id
        };
        if let Some(old) = img.placements.remove(&id) {
            self.ram_bytes -= old.ram_size();
        }
        log::debug!("Creating placement {}/{}", image_id, id);
        let mut placement = Placement::new(image_id, id);
        placement.touch();
        img.placements.insert(id, placement);
        if img.default_placement == 0 {
            img.default_placement = id;
        }
        img.touch();
        Some(id)
    }

    fn generate_placement_id(img: &Image) -> u32 {
        let mut rng = rand::rng();
        loop {
            // Only 24-bit placement ids are supported.
            let id = rng.random::<u32>() & 0x00FF_FFFF;
            // Avoid ids that need only one byte.
            if id & 0x00FF_FF00 == 0 {
                continue;
            }
            if img.placements.contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    pub fn touch_image(&mut self, image_id: u32) {
        if let Some(img) = self.images.get_mut(&image_id) {
            img.touch();
        }
    }

    /// Touches the placement and its image.
    pub fn touch_placement(&mut self, image_id: u32, placement_id: u32) {
        if let Some(img) = self.images.get_mut(&image_id) {
            img.touch();
            if let Some(placement) = img.placements.get_mut(&placement_id) {
                placement.touch();
            }
        }
    }

    /// Records `bytes` appended to the image's cache file.
    pub fn add_disk_usage(&mut self, image_id: u32, bytes: u64) {
        if let Some(img) = self.images.get_mut(&image_id) {
            img.disk_size += bytes;
            self.disk_bytes += bytes;
        }
    }

    /// Installs the decoded original raster and updates the RAM total. The
    /// image's pixel dimensions are taken from the raster.
    pub fn install_original_raster(&mut self, image_id: u32, raster: ::image::RgbaImage) {
        if let Some(img) = self.images.get_mut(&image_id) {
            img.pix_width = raster.width();
            img.pix_height = raster.height();
            self.ram_bytes += raster.width() as u64 * raster.height() as u64 * 4;
            img.original_raster = Some(raster);
            img.status = ImageStatus::RamLoadOk;
        }
    }

    /// Installs a freshly composed scaled raster on a placement.
    pub fn install_scaled_raster(
        &mut self,
        image_id: u32,
        placement_id: u32,
        raster: ::image::RgbaImage,
        cw: u16,
        ch: u16,
    ) {
        let Some(img) = self.images.get_mut(&image_id) else {
            return;
        };
        if let Some(placement) = img.placements.get_mut(&placement_id) {
            self.ram_bytes += raster.width() as u64 * raster.height() as u64 * 4;
            placement.scaled_raster = Some(raster);
            placement.scaled_cw = cw;
            placement.scaled_ch = ch;
        }
    }

    /// Unloads the original raster from RAM. The on-disk file (if any) is
    /// kept, so the image can be reloaded later.
    pub fn unload_original_raster(&mut self, image_id: u32) {
        if let Some(img) = self.images.get_mut(&image_id) {
            if let Some(raster) = img.original_raster.take() {
                self.ram_bytes -= raster.width() as u64 * raster.height() as u64 * 4;
                log::debug!(
                    "After unloading image {} ram: {} KiB",
                    image_id,
                    self.ram_bytes / 1024
                );
            }
        }
    }

    /// Unloads the scaled raster of a placement from RAM.
    pub fn unload_scaled_raster(&mut self, image_id: u32, placement_id: u32) {
        if let Some(img) = self.images.get_mut(&image_id) {
            if let Some(placement) = img.placements.get_mut(&placement_id) {
                if let Some(raster) = placement.scaled_raster.take() {
                    self.ram_bytes -= raster.width() as u64 * raster.height() as u64 * 4;
                    placement.scaled_cw = 0;
                    placement.scaled_ch = 0;
                    log::debug!(
                        "After unloading placement {}/{} ram: {} KiB",
                        image_id,
                        placement_id,
                        self.ram_bytes / 1024
                    );
                }
            }
        }
    }

    /// Deletes the image's on-disk cache file, keeping the image object and
    /// any loaded rasters. Closes the upload file handle if one is open.
    pub fn delete_image_file(&mut self, image_id: u32, cache: &CacheDir) {
        let Some(img) = self.images.get_mut(&image_id) else {
            return;
        };
        // The image may still be uploading; drop the handle first.
        img.open_file = None;
        if img.disk_size == 0 {
            return;
        }
        let path = cache.image_path(image_id);
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("could not remove {}: {}", path.display(), e);
        }
        self.disk_bytes -= img.disk_size;
        img.disk_size = 0;
        log::debug!(
            "After deleting image file {} disk: {} KiB",
            image_id,
            self.disk_bytes / 1024
        );
    }

    /// Deletes a single placement, unloading its raster.
    pub fn delete_placement(&mut self, image_id: u32, placement_id: u32) {
        if let Some(img) = self.images.get_mut(&image_id) {
            if let Some(placement) = img.placements.remove(&placement_id) {
                log::debug!("Deleting placement {}/{}", image_id, placement_id);
                self.ram_bytes -= placement.ram_size();
                if img.default_placement == placement_id {
                    img.default_placement = 0;
                }
            }
        }
    }

    /// Deletes the image outright: raster, disk file, placements, object.
    pub fn delete_image(&mut self, image_id: u32, cache: &CacheDir) {
        self.unload_original_raster(image_id);
        self.delete_image_file(image_id, cache);
        if let Some(img) = self.images.remove(&image_id) {
            log::debug!("Deleting image {}", image_id);
            for placement in img.placements.values() {
                self.ram_bytes -= placement.ram_size();
            }
        }
    }

    pub fn delete_all_images(&mut self, cache: &CacheDir) {
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            self.delete_image(id, cache);
        }
    }

    /// Unloads every original and scaled raster, keeping disk files, so the
    /// emulator can shed RAM (e.g. when losing focus).
    pub fn unload_all_rasters(&mut self) {
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            self.unload_original_raster(id);
            let pids: Vec<u32> = self.images[&id].placements.keys().copied().collect();
            for pid in pids {
                self.unload_scaled_raster(id, pid);
            }
        }
    }
}
