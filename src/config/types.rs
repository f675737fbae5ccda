use serde::{Deserialize, Serialize};

/// Process-wide limits of the graphics subsystem, read once at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// Max size of a single image file in the on-disk cache, in bytes
    #[serde(default = "default_max_image_file_size")]
    pub max_image_file_size: u64,

    /// Max total size of the on-disk cache, in bytes
    #[serde(default = "default_max_total_file_size")]
    pub max_total_file_size: u64,

    /// Max RAM size of a single image or placement raster, in bytes
    #[serde(default = "default_max_image_ram_size")]
    pub max_image_ram_size: u64,

    /// Max total RAM size of all loaded rasters, in bytes
    #[serde(default = "default_max_total_ram_size")]
    pub max_total_ram_size: u64,

    /// Max number of cached images
    #[serde(default = "default_max_images")]
    pub max_images: usize,

    /// Max number of placements across all images
    #[serde(default = "default_max_placements")]
    pub max_placements: usize,

    /// How far a budget may drift past its limit before cleanup runs
    /// (0.05 = cleanup starts at 105% and reduces back to 100%)
    #[serde(default = "default_excess_tolerance")]
    pub excess_tolerance: f64,

    /// Prefix for the cache directory created under the platform tempdir
    #[serde(default = "default_cache_dir_prefix")]
    pub cache_dir_prefix: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_image_file_size: default_max_image_file_size(),
            max_total_file_size: default_max_total_file_size(),
            max_image_ram_size: default_max_image_ram_size(),
            max_total_ram_size: default_max_total_ram_size(),
            max_images: default_max_images(),
            max_placements: default_max_placements(),
            excess_tolerance: default_excess_tolerance(),
            cache_dir_prefix: default_cache_dir_prefix(),
        }
    }
}

impl GraphicsConfig {
    /// A byte budget with the excess tolerance applied. Cleanup is triggered
    /// only past this value, then reduces usage back to the plain limit.
    pub fn tolerated(&self, limit: u64) -> u64 {
        limit + (limit as f64 * self.excess_tolerance) as u64
    }

    /// A count budget with the excess tolerance applied.
    pub fn tolerated_count(&self, limit: usize) -> usize {
        limit + (limit as f64 * self.excess_tolerance) as usize
    }
}

// Default functions
fn default_max_image_file_size() -> u64 {
    20 * 1024 * 1024
}

fn default_max_total_file_size() -> u64 {
    300 * 1024 * 1024
}

fn default_max_image_ram_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_total_ram_size() -> u64 {
    300 * 1024 * 1024
}

fn default_max_images() -> usize {
    4096
}

fn default_max_placements() -> usize {
    4096
}

fn default_excess_tolerance() -> f64 {
    0.05
}

fn default_cache_dir_prefix() -> String {
    "graphulator-images".to_string()
}
