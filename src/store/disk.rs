use crate::utils::{sanitized_filename, GraphicsError, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// The private directory holding one cache file per image. Created from a
/// unique template under the platform tempdir and removed on drop. If it
/// disappears while the terminal is running it is silently re-created.
pub struct CacheDir {
    prefix: String,
    dir: TempDir,
}

impl CacheDir {
    pub fn new(prefix: &str) -> Result<Self> {
        let dir = Self::create(prefix)?;
        log::info!("Graphics cache directory: {}", dir.path().display());
        Ok(Self {
            prefix: prefix.to_string(),
            dir,
        })
    }

    fn create(prefix: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("{}-", prefix))
            .tempdir()
            .map_err(|e| {
                GraphicsError::cache(format!("could not create cache directory: {}", e))
            })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The cache file of an image: `<cache>/img-<id>`, id zero-padded to at
    /// least 3 digits.
    pub fn image_path(&self, image_id: u32) -> PathBuf {
        self.dir.path().join(format!("img-{:03}", image_id))
    }

    /// Re-creates the directory if something removed it behind our back.
    pub fn ensure_exists(&mut self) -> Result<()> {
        if self.dir.path().is_dir() {
            return Ok(());
        }
        log::error!(
            "{} is not a directory, creating a new graphics cache directory",
            sanitized_filename(self.dir.path())
        );
        self.dir = Self::create(&self.prefix)?;
        log::info!("Graphics cache directory: {}", self.dir.path().display());
        Ok(())
    }
}
