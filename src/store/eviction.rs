use crate::config::GraphicsConfig;
use crate::store::{CacheDir, ImageStore};
use std::time::Instant;

/// Multi-stage age-based cleanup. Each budget tolerates a small excess
/// (`excess_tolerance`); once a budget drifts past `limit * (1 + t)` the
/// corresponding stage reduces usage back to the plain limit, oldest atime
/// first.
impl ImageStore {
    pub fn check_limits(&mut self, config: &GraphicsConfig, cache: &CacheDir) {
        log::debug!(
            "Checking limits ram: {} KiB disk: {} KiB count: {}",
            self.ram_bytes() / 1024,
            self.disk_bytes() / 1024,
            self.image_count()
        );

        // 1. Too many images: delete whole images, oldest first.
        if self.image_count() > config.tolerated_count(config.max_images) {
            for id in self.images_by_atime() {
                if self.image_count() <= config.max_images {
                    break;
                }
                self.delete_image(id, cache);
            }
        }

        // 2. Too many placements: delete placements, oldest first, never
        // touching protected ones.
        if self.placement_count() > config.tolerated_count(config.max_placements) {
            for (image_id, placement_id) in self.placements_by_atime(false) {
                if self.placement_count() <= config.max_placements {
                    break;
                }
                self.delete_placement(image_id, placement_id);
            }
        }

        // 3. Disk cache too large: delete files only, keeping image objects
        // and any loaded rasters.
        if self.disk_bytes() > config.tolerated(config.max_total_file_size) {
            for id in self.images_with_files_by_atime() {
                if self.disk_bytes() <= config.max_total_file_size {
                    break;
                }
                self.delete_image_file(id, cache);
            }
        }

        // 4. Too much RAM: unload original rasters first, then scaled
        // placement rasters (both share the one RAM budget).
        if self.ram_bytes() > config.tolerated(config.max_total_ram_size) {
            for id in self.images_with_rasters_by_atime() {
                if self.ram_bytes() <= config.max_total_ram_size {
                    break;
                }
                self.unload_original_raster(id);
            }
            if self.ram_bytes() > config.max_total_ram_size {
                for (image_id, placement_id) in self.placements_by_atime(true) {
                    if self.ram_bytes() <= config.max_total_ram_size {
                        break;
                    }
                    self.unload_scaled_raster(image_id, placement_id);
                }
            }
        }
    }

    /// All image ids, oldest atime first.
    fn images_by_atime(&self) -> Vec<u32> {
        let mut snapshot: Vec<(Instant, u32)> = self
            .images()
            .map(|img| (img.atime, img.image_id))
            .collect();
        snapshot.sort_by_key(|&(atime, _)| atime);
        snapshot.into_iter().map(|(_, id)| id).collect()
    }

    /// Image ids with a cache file on disk, oldest atime first.
    fn images_with_files_by_atime(&self) -> Vec<u32> {
        let mut snapshot: Vec<(Instant, u32)> = self
            .images()
            .filter(|img| img.disk_size > 0)
            .map(|img| (img.atime, img.image_id))
            .collect();
        snapshot.sort_by_key(|&(atime, _)| atime);
        snapshot.into_iter().map(|(_, id)| id).collect()
    }

    /// Image ids with a loaded original raster, oldest atime first.
    fn images_with_rasters_by_atime(&self) -> Vec<u32> {
        let mut snapshot: Vec<(Instant, u32)> = self
            .images()
            .filter(|img| img.original_raster.is_some())
            .map(|img| (img.atime, img.image_id))
            .collect();
        snapshot.sort_by_key(|&(atime, _)| atime);
        snapshot.into_iter().map(|(_, id)| id).collect()
    }

    /// All non-protected placements, oldest atime first. With `loaded_only`
    /// set, placements without a scaled raster are skipped too.
    fn placements_by_atime(&self, loaded_only: bool) -> Vec<(u32, u32)> {
        let mut snapshot: Vec<(Instant, u32, u32)> = Vec::new();
        for img in self.images() {
            for placement in img.placements.values() {
                if placement.protected {
                    continue;
                }
                if loaded_only && placement.scaled_raster.is_none() {
                    continue;
                }
                snapshot.push((placement.atime, img.image_id, placement.placement_id));
            }
        }
        snapshot.sort_by_key(|&(atime, _, _)| atime);
        snapshot
            .into_iter()
            .map(|(_, image_id, placement_id)| (image_id, placement_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn strict_config() -> GraphicsConfig {
        GraphicsConfig {
            excess_tolerance: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_image_count_eviction_oldest_first() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            max_images: 2,
            ..strict_config()
        };
        let mut store = ImageStore::new();
        store.new_image(1, 1, &cache);
        store.new_image(2, 2, &cache);
        store.new_image(3, 3, &cache);
        // Touch 1 so 2 becomes the oldest.
        store.touch_image(1);

        store.check_limits(&config, &cache);
        assert_eq!(store.image_count(), 2);
        assert!(store.find_image(2).is_none());
        assert!(store.find_image(1).is_some());
        assert!(store.find_image(3).is_some());
    }

    #[test]
    fn test_placement_count_eviction_skips_protected() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            max_placements: 1,
            ..strict_config()
        };
        let mut store = ImageStore::new();
        store.new_image(1, 1, &cache);
        store.new_placement(1, 10).unwrap();
        store.new_placement(1, 11).unwrap();
        // The oldest placement is protected and must be scanned past.
        store.find_placement_mut(1, 10).unwrap().protected = true;

        store.check_limits(&config, &cache);
        assert_eq!(store.placement_count(), 1);
        assert!(store.find_placement(1, 10).is_some());
        assert!(store.find_placement(1, 11).is_none());
    }

    #[test]
    fn test_disk_eviction_keeps_objects_and_rasters() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            max_total_file_size: 8,
            ..strict_config()
        };
        let mut store = ImageStore::new();
        for (id, index) in [(1u32, 1u64), (2, 2)] {
            store.new_image(id, index, &cache);
            std::fs::write(cache.image_path(id), b"01234567").unwrap();
            store.add_disk_usage(id, 8);
            store.install_original_raster(id, RgbaImage::new(2, 2));
        }
        store.touch_image(2);

        store.check_limits(&config, &cache);
        // The older image's file is gone, but the object and raster stay.
        assert_eq!(store.disk_bytes(), 8);
        let img = store.find_image(1).unwrap();
        assert_eq!(img.disk_size, 0);
        assert!(img.original_raster.is_some());
        assert!(!cache.image_path(1).exists());
        assert!(cache.image_path(2).exists());
    }

    #[test]
    fn test_ram_eviction_tolerance_threshold() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            max_total_ram_size: 100,
            excess_tolerance: 0.5,
            ..Default::default()
        };
        let mut store = ImageStore::new();
        store.new_image(1, 1, &cache);
        // 5x5x4 = 100 bytes: within the tolerated budget of 150.
        store.install_original_raster(1, RgbaImage::new(5, 5));
        store.check_limits(&config, &cache);
        assert_eq!(store.ram_bytes(), 100);

        // 5x10x4 = 200 more pushes past the tolerated budget; cleanup
        // reduces back below the plain limit.
        store.new_image(2, 2, &cache);
        store.install_original_raster(2, RgbaImage::new(5, 10));
        store.check_limits(&config, &cache);
        assert!(store.ram_bytes() <= 100);
    }

    #[test]
    fn test_ram_eviction_unloads_placements_after_images() {
        let cache = CacheDir::new("graphulator-test").unwrap();
        let config = GraphicsConfig {
            max_total_ram_size: 64,
            ..strict_config()
        };
        let mut store = ImageStore::new();
        store.new_image(1, 1, &cache);
        store.install_original_raster(1, RgbaImage::new(4, 4));
        store.new_placement(1, 5).unwrap();
        store.install_scaled_raster(1, 5, RgbaImage::new(4, 4), 8, 16);
        assert_eq!(store.ram_bytes(), 128);

        store.check_limits(&config, &cache);
        assert!(store.ram_bytes() <= 64);
        // The original went first, the scaled raster only if still needed.
        let img = store.find_image(1).unwrap();
        assert!(img.original_raster.is_none());
        assert!(img.placements[&5].scaled_raster.is_some());
    }
}
