pub mod decode;
pub mod scale;

pub use scale::{clamp_src_rect, compose_scaled, infer_geometry, SrcRect};

use crate::config::GraphicsConfig;
use crate::store::{CacheDir, ImageStatus, ImageStore};
use crate::utils::sanitized_filename;

/// Loads the original raster of an image from its cache file. Does nothing
/// if it is already loaded, the upload hasn't finished, or the file was
/// evicted from disk; a decode failure moves the image to `RamLoadErr`.
pub fn load_image(
    store: &mut ImageStore,
    image_id: u32,
    cache: &CacheDir,
    config: &GraphicsConfig,
) {
    let Some(img) = store.find_image(image_id) else {
        return;
    };
    if img.original_raster.is_some() {
        return;
    }
    // Uninitialized, still uploading, or failed: nothing to load from.
    if img.status < ImageStatus::UploadOk {
        return;
    }
    if img.disk_size == 0 {
        if img.status != ImageStatus::RamLoadErr {
            log::error!("cached image was deleted: {}", image_id);
        }
        if let Some(img) = store.find_image_mut(image_id) {
            img.status = ImageStatus::RamLoadErr;
        }
        return;
    }

    let path = cache.image_path(image_id);
    log::debug!("Loading image: {}", sanitized_filename(&path));
    let (format, compression, pix_width, pix_height) =
        (img.format, img.compression, img.pix_width, img.pix_height);
    match decode::decode_file(
        format,
        compression,
        pix_width,
        pix_height,
        &path,
        config.max_image_ram_size,
    ) {
        Ok(raster) => store.install_original_raster(image_id, raster),
        Err(e) => {
            let Some(img) = store.find_image_mut(image_id) else {
                return;
            };
            if img.status != ImageStatus::RamLoadErr {
                log::error!("could not load image {}: {}", image_id, e);
            }
            img.status = ImageStatus::RamLoadErr;
        }
    }
}

/// Fills in a placement's cell dimensions from its source rectangle and the
/// current cell size, when they were left to be inferred.
pub fn infer_placement_size(
    store: &mut ImageStore,
    image_id: u32,
    placement_id: u32,
    cw: u16,
    ch: u16,
) {
    let Some(img) = store.find_image_mut(image_id) else {
        return;
    };
    let (pix_width, pix_height) = (img.pix_width, img.pix_height);
    if pix_width == 0 || pix_height == 0 {
        return;
    }
    let Some(placement) = img.placements.get_mut(&placement_id) else {
        return;
    };
    let src = scale::clamp_src_rect(
        placement.src_pix_x,
        placement.src_pix_y,
        placement.src_pix_width,
        placement.src_pix_height,
        pix_width,
        pix_height,
    );
    let (cols, rows) =
        scale::infer_geometry(placement.cols, placement.rows, placement.scale_mode, src, cw, ch);
    placement.cols = cols;
    placement.rows = rows;
}

/// Composes the scaled raster of a placement for the given cell size,
/// loading the original image first if needed. A placement already scaled
/// for this cell size is left alone; a different cell size (font change)
/// rebuilds it.
pub fn load_placement(
    store: &mut ImageStore,
    image_id: u32,
    placement_id: u32,
    cw: u16,
    ch: u16,
    cache: &CacheDir,
    config: &GraphicsConfig,
) {
    if cw == 0 || ch == 0 {
        return;
    }
    {
        let Some(placement) = store.find_placement(image_id, placement_id) else {
            return;
        };
        if placement.scaled_raster.is_some()
            && placement.scaled_cw == cw
            && placement.scaled_ch == ch
        {
            return;
        }
    }
    store.unload_scaled_raster(image_id, placement_id);
    log::debug!("Loading placement: {}/{}", image_id, placement_id);

    load_image(store, image_id, cache, config);
    infer_placement_size(store, image_id, placement_id, cw, ch);

    let Some(img) = store.find_image(image_id) else {
        return;
    };
    let Some(original) = img.original_raster.as_ref() else {
        return;
    };
    if img.pix_width == 0 || img.pix_height == 0 {
        log::warn!("image {} has zero size", image_id);
        return;
    }
    let Some(placement) = img.placements.get(&placement_id) else {
        return;
    };
    if placement.cols == 0 || placement.rows == 0 {
        return;
    }

    let src = scale::clamp_src_rect(
        placement.src_pix_x,
        placement.src_pix_y,
        placement.src_pix_width,
        placement.src_pix_height,
        img.pix_width,
        img.pix_height,
    );
    let scaled_w = placement.cols as u32 * cw as u32;
    let scaled_h = placement.rows as u32 * ch as u32;
    if scaled_w as u64 * scaled_h as u64 * 4 > config.max_image_ram_size {
        log::error!(
            "placement {}/{} would be too big to load: {} x {} x 4 > {}",
            image_id,
            placement_id,
            scaled_w,
            scaled_h,
            config.max_image_ram_size
        );
        return;
    }

    let raster = scale::compose_scaled(original, src, scaled_w, scaled_h, placement.scale_mode);
    store.install_scaled_raster(image_id, placement_id, raster, cw, ch);

    // Free up RAM if needed, but keep the raster we just composed.
    if let Some(placement) = store.find_placement_mut(image_id, placement_id) {
        placement.protected = true;
    }
    store.check_limits(config, cache);
    if let Some(placement) = store.find_placement_mut(image_id, placement_id) {
        placement.protected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Format;
    use crate::store::ScaleMode;

    fn store_with_raw_image(cache: &CacheDir, pixels: &[u8], w: u32, h: u32) -> ImageStore {
        let mut store = ImageStore::new();
        store.new_image(1, 0, cache);
        std::fs::write(cache.image_path(1), pixels).unwrap();
        store.add_disk_usage(1, pixels.len() as u64);
        let img = store.find_image_mut(1).unwrap();
        img.format = Format::Rgba;
        img.pix_width = w;
        img.pix_height = h;
        img.status = ImageStatus::UploadOk;
        store
    }

    #[test]
    fn test_load_image_from_disk() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig::default();
        let pixels: Vec<u8> = vec![3; 2 * 2 * 4];
        let mut store = store_with_raw_image(&cache, &pixels, 2, 2);

        load_image(&mut store, 1, &cache, &config);
        let img = store.find_image(1).unwrap();
        assert_eq!(img.status, ImageStatus::RamLoadOk);
        assert_eq!(store.ram_bytes(), 16);

        // A second call is a no-op.
        load_image(&mut store, 1, &cache, &config);
        assert_eq!(store.ram_bytes(), 16);
    }

    #[test]
    fn test_load_image_missing_file_marks_error() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig::default();
        let mut store = ImageStore::new();
        store.new_image(1, 0, &cache);
        store.find_image_mut(1).unwrap().status = ImageStatus::UploadOk;

        load_image(&mut store, 1, &cache, &config);
        assert_eq!(store.find_image(1).unwrap().status, ImageStatus::RamLoadErr);
    }

    #[test]
    fn test_load_image_skips_uploading() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig::default();
        let mut store = ImageStore::new();
        store.new_image(1, 0, &cache);
        store.find_image_mut(1).unwrap().status = ImageStatus::Uploading;

        load_image(&mut store, 1, &cache, &config);
        let img = store.find_image(1).unwrap();
        assert_eq!(img.status, ImageStatus::Uploading);
        assert!(img.original_raster.is_none());
    }

    #[test]
    fn test_load_placement_composes_and_infers() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig::default();
        let pixels: Vec<u8> = vec![5; 20 * 40 * 4];
        let mut store = store_with_raw_image(&cache, &pixels, 20, 40);
        store.new_placement(1, 2).unwrap();

        load_placement(&mut store, 1, 2, 10, 20, &cache, &config);
        let placement = store.find_placement(1, 2).unwrap();
        // cols = ceil(20/10), rows = ceil(40/20)
        assert_eq!((placement.cols, placement.rows), (2, 2));
        assert_eq!((placement.scaled_cw, placement.scaled_ch), (10, 20));
        let raster = placement.scaled_raster.as_ref().unwrap();
        assert_eq!(raster.dimensions(), (20, 40));
        assert!(!placement.protected);
    }

    #[test]
    fn test_load_placement_rebuilds_on_cell_size_change() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig::default();
        let pixels: Vec<u8> = vec![5; 10 * 10 * 4];
        let mut store = store_with_raw_image(&cache, &pixels, 10, 10);
        store.new_placement(1, 2).unwrap();
        store.find_placement_mut(1, 2).unwrap().scale_mode = ScaleMode::Fill;
        store.find_placement_mut(1, 2).unwrap().cols = 1;
        store.find_placement_mut(1, 2).unwrap().rows = 1;

        load_placement(&mut store, 1, 2, 8, 16, &cache, &config);
        assert_eq!(
            store.find_placement(1, 2).unwrap().scaled_raster.as_ref().unwrap().dimensions(),
            (8, 16)
        );

        // Font change: the raster is rebuilt for the new cell size.
        load_placement(&mut store, 1, 2, 6, 12, &cache, &config);
        assert_eq!(
            store.find_placement(1, 2).unwrap().scaled_raster.as_ref().unwrap().dimensions(),
            (6, 12)
        );
    }

    #[test]
    fn test_load_placement_respects_ram_budget() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            // Big enough for the original (400 bytes), not for the scaled
            // raster (100 * 200 * 4).
            max_image_ram_size: 1024,
            ..Default::default()
        };
        let pixels: Vec<u8> = vec![5; 10 * 10 * 4];
        let mut store = store_with_raw_image(&cache, &pixels, 10, 10);
        store.new_placement(1, 2).unwrap();
        store.find_placement_mut(1, 2).unwrap().cols = 10;
        store.find_placement_mut(1, 2).unwrap().rows = 10;

        load_placement(&mut store, 1, 2, 10, 20, &cache, &config);
        assert!(store.find_placement(1, 2).unwrap().scaled_raster.is_none());
    }
}
