use crate::config::GraphicsConfig;
use crate::utils::{GraphicsError, Result};
use std::fs;
use std::path::Path;

/// Loads the graphics limits from the emulator's config file, or returns
/// the defaults if the file doesn't exist. Loaded values go through
/// `validate` so a broken config can't disable the budgets.
pub fn load_config(path: &Path) -> Result<GraphicsConfig> {
    let config = if path.exists() {
        log::info!("Loading graphics limits from: {}", path.display());
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)?
    } else {
        log::info!(
            "Graphics config not found at {}, using defaults",
            path.display()
        );
        GraphicsConfig::default()
    };
    validate(&config)?;
    Ok(config)
}

/// Rejects limit combinations the engine cannot operate under: every size
/// and count budget must be nonzero, a single item must fit inside its
/// total budget (otherwise one upload or one load could never succeed, or
/// could blow past the cache ceiling), and the excess tolerance must be a
/// finite non-negative ratio.
pub fn validate(config: &GraphicsConfig) -> Result<()> {
    if config.max_image_file_size == 0
        || config.max_total_file_size == 0
        || config.max_image_ram_size == 0
        || config.max_total_ram_size == 0
    {
        return Err(GraphicsError::config("size limits must be nonzero"));
    }
    if config.max_image_file_size > config.max_total_file_size {
        return Err(GraphicsError::config(format!(
            "max image file size {} exceeds the total file cache size {}",
            config.max_image_file_size, config.max_total_file_size
        )));
    }
    if config.max_image_ram_size > config.max_total_ram_size {
        return Err(GraphicsError::config(format!(
            "max image ram size {} exceeds the total ram size {}",
            config.max_image_ram_size, config.max_total_ram_size
        )));
    }
    if config.max_images == 0 || config.max_placements == 0 {
        return Err(GraphicsError::config(
            "image and placement count limits must be nonzero",
        ));
    }
    if !config.excess_tolerance.is_finite() || config.excess_tolerance < 0.0 {
        return Err(GraphicsError::config(format!(
            "excess tolerance {} is not a finite non-negative ratio",
            config.excess_tolerance
        )));
    }
    if config.cache_dir_prefix.is_empty() {
        return Err(GraphicsError::config("cache dir prefix must not be empty"));
    }
    Ok(())
}
