use crate::command::{self, Format, GraphicsCommand};
use crate::engine::Graphics;
use crate::raster;
use crate::store::{ImageStatus, UploadFailure};
use crate::utils::sanitized_filename;
use std::io::Write;
use std::path::{Path, PathBuf};

impl Graphics {
    /// Handles a data transmission command (`a=t`, `a=q`, the transmit part
    /// of `a=T`, and bare `m=` continuation chunks). Returns the id of the
    /// image that was created or appended to, if it still exists.
    pub(crate) fn handle_transmit(&mut self, cmd: &mut GraphicsCommand) -> Option<u32> {
        // Direct transmission is the default.
        let medium = *cmd.medium.get_or_insert('d');

        // No id and no number while a direct upload is active: the command
        // is a continuation for that image.
        if self.current_upload_image_id != 0
            && cmd.image_id == 0
            && cmd.image_number == 0
            && medium == 'd'
        {
            cmd.image_id = self.current_upload_image_id;
            log::debug!("No image id specified, continuing upload of {}", cmd.image_id);
        }

        match medium {
            'f' | 't' => self.transmit_file(cmd),
            'd' => self.transmit_direct(cmd),
            other => {
                self.report_error_cmd(
                    cmd,
                    &format!("EINVAL: transmission medium '{}' is not supported", other),
                );
                None
            }
        }
    }

    fn transmit_direct(&mut self, cmd: &mut GraphicsCommand) -> Option<u32> {
        if let Some(image_id) = self.find_image_for_command(cmd) {
            let status = self.store.find_image(image_id).map(|img| img.status);
            if status == Some(ImageStatus::Uploading) {
                // A continuation of the previous transmission.
                cmd.image_id = image_id;
                cmd.is_direct_transmission_continuation = true;
                self.append_data(Some(image_id), cmd.payload, cmd.more);
                return Some(image_id);
            }
        }
        // Otherwise start a fresh upload.
        let image_id = self.new_image_from_command(cmd)?;
        if let Some(img) = self.store.find_image_mut(image_id) {
            img.status = ImageStatus::Uploading;
        }
        self.append_data(Some(image_id), cmd.payload, cmd.more);
        // The image may be gone already (an ephemeral query, or evicted).
        self.store.find_image(image_id).map(|img| img.image_id)
    }

    /// File (`t=f`) and temp-file (`t=t`) transmission: the payload is a
    /// base64-encoded absolute path that is copied into the cache dir.
    fn transmit_file(&mut self, cmd: &mut GraphicsCommand) -> Option<u32> {
        let image_id = self.new_image_from_command(cmd)?;

        let Some(path_bytes) = command::decode_base64(cmd.payload) else {
            self.report_error_cmd(cmd, "EBADF: could not decode the file name");
            self.mark_upload_failed(image_id, UploadFailure::CannotCopyFile);
            return Some(image_id);
        };
        let original_path = PathBuf::from(String::from_utf8_lossy(&path_bytes).into_owned());
        log::debug!("Copying image {}", sanitized_filename(&original_path));

        let stat_error = match std::fs::metadata(&original_path) {
            Err(e) => Some(e.to_string()),
            Ok(meta) if !meta.is_file() => Some("Not a regular file".to_string()),
            Ok(meta) if meta.len() == 0 => Some("The size of the file is zero".to_string()),
            Ok(meta) if meta.len() > self.config.max_image_file_size => {
                Some("The file is too large".to_string())
            }
            Ok(_) => None,
        };

        if let Some(message) = stat_error {
            self.report_error_cmd(cmd, &format!("EBADF: {}", message));
            log::error!("Could not load the file {}", sanitized_filename(&original_path));
            self.mark_upload_failed(image_id, UploadFailure::CannotCopyFile);
        } else {
            self.copy_file_into_cache(cmd, image_id, &original_path);
            // The original is deleted only when it is in a temp location
            // AND clearly belongs to the graphics protocol.
            if cmd.medium == Some('t') {
                maybe_delete_temp_file(&original_path);
            }
        }

        self.store.check_limits(&self.config, &self.cache);
        self.store.find_image(image_id).map(|img| img.image_id)
    }

    fn copy_file_into_cache(&mut self, cmd: &GraphicsCommand, image_id: u32, original_path: &Path) {
        if self.cache.ensure_exists().is_err() {
            self.report_error_cmd(cmd, "EIO: could not create a file for image");
            self.mark_upload_failed(image_id, UploadFailure::CannotOpenCachedFile);
            return;
        }
        let cache_path = self.cache.image_path(image_id);
        match std::fs::copy(original_path, &cache_path) {
            Err(e) => {
                self.report_error_cmd(cmd, "EBADF: could not copy the image to the cache dir");
                log::error!(
                    "Could not copy the image {} to {}: {}",
                    sanitized_filename(original_path),
                    cache_path.display(),
                    e
                );
                self.mark_upload_failed(image_id, UploadFailure::CannotCopyFile);
            }
            Ok(copied) => {
                self.store.add_disk_usage(image_id, copied);
                let expected = self
                    .store
                    .find_image(image_id)
                    .map(|img| img.expected_size)
                    .unwrap_or(0);
                if let Some(img) = self.store.find_image_mut(image_id) {
                    img.status = ImageStatus::UploadOk;
                }
                if expected != 0 && expected != copied {
                    self.mark_upload_failed(image_id, UploadFailure::UnexpectedSize);
                    self.report_upload_error(image_id);
                } else {
                    self.load_image_and_report(image_id);
                }
            }
        }
    }

    /// Appends one chunk of a direct transmission. Errors are reported only
    /// on the final chunk to avoid flooding the client.
    pub(crate) fn append_data(&mut self, image_id: Option<u32>, payload: &[u8], more: bool) {
        let image_id = image_id
            .or_else(|| (self.current_upload_image_id != 0).then_some(self.current_upload_image_id))
            .filter(|id| self.store.find_image(*id).is_some());
        if !more {
            self.current_upload_image_id = 0;
        }
        let Some(image_id) = image_id else {
            if !more {
                self.report_error_img(0, "ENOENT: could not find the image to append data to");
            }
            return;
        };

        let status = self.store.find_image(image_id).map(|img| img.status);
        if status != Some(ImageStatus::Uploading) {
            if !more {
                self.report_upload_error(image_id);
            }
            return;
        }

        let Some(data) = command::decode_base64(payload) else {
            if let Some(img) = self.store.find_image_mut(image_id) {
                img.open_file = None;
                img.status = ImageStatus::UploadErr;
            }
            if !more {
                self.report_error_img(image_id, "EINVAL: could not decode the data chunk");
            }
            return;
        };

        let Some(img) = self.store.find_image(image_id) else {
            return;
        };
        let (disk_size, expected_size) = (img.disk_size, img.expected_size);
        log::debug!(
            "appending {} + {} = {} bytes",
            disk_size,
            data.len(),
            disk_size + data.len() as u64
        );

        // Refuse data that would push the image past the file size limit.
        if disk_size + data.len() as u64 > self.config.max_image_file_size
            || expected_size > self.config.max_image_file_size
        {
            self.store.delete_image_file(image_id, &self.cache);
            self.mark_upload_failed(image_id, UploadFailure::OverSizeLimit);
            if !more {
                self.report_upload_error(image_id);
            }
            return;
        }

        // Open the cache file on the first chunk (or after it was dropped).
        let needs_open = self
            .store
            .find_image(image_id)
            .map(|img| img.open_file.is_none())
            .unwrap_or(true);
        if needs_open && !self.open_cache_file(image_id, more) {
            return;
        }

        let write_result = self
            .store
            .find_image_mut(image_id)
            .and_then(|img| img.open_file.as_mut())
            .map(|file| file.write_all(&data));
        match write_result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::error!("could not write to the cache file of image {}: {}", image_id, e);
                self.mark_upload_failed(image_id, UploadFailure::CannotOpenCachedFile);
                if !more {
                    self.report_upload_error(image_id);
                }
                return;
            }
            None => return,
        }
        self.store.add_disk_usage(image_id, data.len() as u64);
        self.store.touch_image(image_id);

        if more {
            self.current_upload_image_id = image_id;
        } else {
            // The final chunk: close the file and verify the promised size.
            let (disk_size, expected_size) = {
                let Some(img) = self.store.find_image_mut(image_id) else {
                    return;
                };
                img.open_file = None;
                img.status = ImageStatus::UploadOk;
                (img.disk_size, img.expected_size)
            };
            if expected_size != 0 && expected_size != disk_size {
                self.mark_upload_failed(image_id, UploadFailure::UnexpectedSize);
                self.report_upload_error(image_id);
            } else if let Some(image_id) = self.load_image_and_report(image_id) {
                // A transmit-and-put creates its placement on the first
                // chunk; it can be displayed now that the image is loaded.
                let placement_ids: Vec<u32> = self
                    .store
                    .find_image(image_id)
                    .map(|img| img.placements.keys().copied().collect())
                    .unwrap_or_default();
                for placement_id in placement_ids {
                    self.display_nonvirtual_placement(image_id, placement_id);
                }
            }
        }

        self.store.check_limits(&self.config, &self.cache);
    }

    fn open_cache_file(&mut self, image_id: u32, more: bool) -> bool {
        // Truncate on the first chunk, append on the rest.
        let disk_size = self
            .store
            .find_image(image_id)
            .map(|img| img.disk_size)
            .unwrap_or(0);
        let mut options = std::fs::OpenOptions::new();
        if disk_size == 0 {
            options.write(true).create(true).truncate(true);
        } else {
            options.append(true);
        }
        let opened = self.cache.ensure_exists().is_ok()
            && match options.open(self.cache.image_path(image_id)) {
                Ok(file) => {
                    if let Some(img) = self.store.find_image_mut(image_id) {
                        img.open_file = Some(file);
                    }
                    true
                }
                Err(e) => {
                    log::error!(
                        "could not open the cache file of image {}: {}",
                        image_id,
                        e
                    );
                    false
                }
            };
        if !opened {
            self.mark_upload_failed(image_id, UploadFailure::CannotOpenCachedFile);
            if !more {
                self.report_upload_error(image_id);
            }
        }
        opened
    }

    /// Creates a new image and initializes it from the command.
    pub(crate) fn new_image_from_command(&mut self, cmd: &mut GraphicsCommand) -> Option<u32> {
        if cmd.format == Format::File && cmd.compression {
            self.report_error_cmd(
                cmd,
                "EINVAL: compression is supported only for raw pixel data (f=32 or f=24)",
            );
            return None;
        }

        // A query gets a random id instead of the one in the command.
        let requested_id = if cmd.action == Some('q') { 0 } else { cmd.image_id };
        let image_id = self.store.new_image(requested_id, self.command_index, &self.cache);
        if cmd.action == Some('q') {
            if let Some(img) = self.store.find_image_mut(image_id) {
                img.query_id = cmd.image_id;
            }
        } else if cmd.image_id == 0 {
            cmd.image_id = image_id;
        }

        // The newest image owns the number; an older holder loses its claim.
        if cmd.image_number != 0 {
            let old_holder = self
                .store
                .find_image_by_number(cmd.image_number)
                .map(|img| img.image_id)
                .filter(|&old| old != image_id);
            if let Some(old) = old_holder {
                if let Some(img) = self.store.find_image_mut(old) {
                    img.image_number = 0;
                }
            }
        }

        if let Some(img) = self.store.find_image_mut(image_id) {
            img.image_number = cmd.image_number;
            img.expected_size = cmd.expected_size;
            img.format = cmd.format;
            img.compression = cmd.compression;
            img.pix_width = cmd.pix_width;
            img.pix_height = cmd.pix_height;
            // Continuation chunks don't repeat 'q=', so remember it.
            img.quiet = cmd.quiet;
        }
        Some(image_id)
    }

    /// Loads the image into RAM and reports success or failure. Returns the
    /// image id, or None for an ephemeral query image (deleted here).
    pub(crate) fn load_image_and_report(&mut self, image_id: u32) -> Option<u32> {
        raster::load_image(&mut self.store, image_id, &self.cache, &self.config);
        let loaded = self
            .store
            .find_image(image_id)
            .map(|img| img.original_raster.is_some())
            .unwrap_or(false);
        if loaded {
            self.report_success_img(image_id);
        } else {
            self.report_error_img(image_id, "EBADF: could not load image");
        }

        let ephemeral = self
            .store
            .find_image(image_id)
            .map(|img| img.query_id != 0)
            .unwrap_or(false);
        if ephemeral {
            self.store.delete_image(image_id, &self.cache);
            return None;
        }
        Some(image_id)
    }

    fn mark_upload_failed(&mut self, image_id: u32, failure: UploadFailure) {
        if let Some(img) = self.store.find_image_mut(image_id) {
            // A failed upload never keeps its file handle.
            img.open_file = None;
            img.status = ImageStatus::UploadErr;
            img.uploading_failure = Some(failure);
        }
    }

    /// Reports the remembered uploading failure of an image.
    pub(crate) fn report_upload_error(&mut self, image_id: u32) {
        let Some(img) = self.store.find_image(image_id) else {
            return;
        };
        let message = match img.uploading_failure {
            None => return,
            Some(UploadFailure::CannotOpenCachedFile) => {
                "EIO: could not create a file for image".to_string()
            }
            Some(UploadFailure::OverSizeLimit) => format!(
                "EFBIG: the size of the uploaded image exceeded the image size limit {}",
                self.config.max_image_file_size
            ),
            Some(UploadFailure::UnexpectedSize) => format!(
                "EINVAL: the size of the uploaded image {} doesn't match the expected size {}",
                img.disk_size, img.expected_size
            ),
            Some(UploadFailure::CannotCopyFile) => {
                "EBADF: could not copy the image to the cache dir".to_string()
            }
        };
        self.report_error_img(image_id, &message);
    }
}

/// Deletes a file the client marked as temporary, with a double check so an
/// arbitrary user file is never removed: the path must be under `/tmp/` or
/// `$TMPDIR`, and the name must contain `tty-graphics-protocol`.
fn maybe_delete_temp_file(path: &Path) {
    let name_matches = path
        .file_name()
        .map(|name| name.to_string_lossy().contains("tty-graphics-protocol"))
        .unwrap_or(false);
    if !name_matches {
        return;
    }
    let in_tmp = path.starts_with("/tmp/")
        || std::env::var_os("TMPDIR")
            .filter(|dir| !dir.is_empty())
            .map(|dir| path.starts_with(&dir))
            .unwrap_or(false);
    if !in_tmp {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("could not delete temporary file {}: {}", sanitized_filename(path), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphicsConfig;
    use crate::engine::NoCells;

    fn engine_with(config: GraphicsConfig) -> Graphics {
        Graphics::new(GraphicsConfig {
            cache_dir_prefix: "graphulator-test".to_string(),
            ..config
        })
        .unwrap()
    }

    fn engine() -> Graphics {
        engine_with(GraphicsConfig::default())
    }

    #[test]
    fn test_compression_rejected_for_file_format() {
        let mut graphics = engine();
        let result = graphics.process_command(b"Gi=1,a=t,f=100,o=z;YWJj", &mut NoCells);
        assert!(result.error);
        assert!(result.response.contains("compression is supported only"));
    }

    #[test]
    fn test_unsupported_medium() {
        let mut graphics = engine();
        let result = graphics.process_command(b"Gi=1,a=t,t=s;YWJj", &mut NoCells);
        assert!(result.error);
        assert!(result.response.contains("transmission medium 's'"));
    }

    #[test]
    fn test_single_chunk_upload_accounts_disk() {
        let mut graphics = engine();
        // "abcdefghi" uploaded as f=100: stored fine, fails to decode.
        let result = graphics.process_command(b"Gi=7,a=t,f=100;YWJjZGVmZ2hp", &mut NoCells);
        assert!(result.error);
        assert_eq!(result.response, "\x1b_Gi=7;EBADF: could not load image\x1b\\");
        let img = graphics.store().find_image(7).unwrap();
        assert_eq!(img.disk_size, 9);
        assert_eq!(graphics.store().disk_bytes(), 9);
        assert_eq!(img.status, ImageStatus::RamLoadErr);
    }

    #[test]
    fn test_chunked_upload_binds_continuations() {
        let mut graphics = engine();
        let result = graphics.process_command(b"Gi=7,a=t,f=100,t=d,m=1,S=9;YWJj", &mut NoCells);
        // Intermediate chunks produce no response.
        assert!(result.response.is_empty());
        assert!(!result.error);

        let result = graphics.process_command(b"Gm=1;ZGVm", &mut NoCells);
        assert!(result.response.is_empty());

        let result = graphics.process_command(b"Gm=0;Z2hp", &mut NoCells);
        // 9 bytes arrived as promised; the payload isn't a real image, so
        // the final response is the load failure.
        assert!(result.error);
        assert_eq!(result.response, "\x1b_Gi=7;EBADF: could not load image\x1b\\");
        let img = graphics.store().find_image(7).unwrap();
        assert_eq!(img.disk_size, 9);
        assert!(img.open_file.is_none());
    }

    #[test]
    fn test_chunked_upload_size_mismatch() {
        let mut graphics = engine();
        graphics.process_command(b"Gi=7,a=t,f=100,t=d,m=1,S=12;YWJj", &mut NoCells);
        graphics.process_command(b"Gm=1;ZGVm", &mut NoCells);
        let result = graphics.process_command(b"Gm=0;Z2hp", &mut NoCells);
        assert!(result.error);
        assert_eq!(
            result.response,
            "\x1b_Gi=7;EINVAL: the size of the uploaded image 9 doesn't match the expected size 12\x1b\\"
        );
        let img = graphics.store().find_image(7).unwrap();
        assert_eq!(img.status, ImageStatus::UploadErr);
        assert_eq!(img.uploading_failure, Some(UploadFailure::UnexpectedSize));
    }

    #[test]
    fn test_upload_over_size_limit() {
        let mut graphics = engine_with(GraphicsConfig {
            max_image_file_size: 8,
            ..Default::default()
        });
        // 9 bytes into an 8-byte budget.
        let result = graphics.process_command(b"Gi=7,a=t,f=100;YWJjZGVmZ2hp", &mut NoCells);
        assert!(result.error);
        assert!(result.response.contains("EFBIG"), "{}", result.response);
        let img = graphics.store().find_image(7).unwrap();
        assert_eq!(img.status, ImageStatus::UploadErr);
        assert_eq!(img.uploading_failure, Some(UploadFailure::OverSizeLimit));
        assert_eq!(img.disk_size, 0);
        assert_eq!(graphics.store().disk_bytes(), 0);
    }

    #[test]
    fn test_expected_size_alone_over_limit() {
        let mut graphics = engine_with(GraphicsConfig {
            max_image_file_size: 8,
            ..Default::default()
        });
        let result = graphics.process_command(b"Gi=7,a=t,f=100,S=100;YWJj", &mut NoCells);
        assert!(result.error);
        assert!(result.response.contains("EFBIG"), "{}", result.response);
    }

    #[test]
    fn test_stray_final_chunk_gets_no_response() {
        let mut graphics = engine();
        // No active upload and no ids: a fresh image is created under a
        // random id, the garbage fails to load, and the failure response
        // cannot be correlated, so it is dropped.
        let result = graphics.process_command(b"Gm=0;YWJj", &mut NoCells);
        assert!(result.response.is_empty());
        assert!(result.error);
        assert_eq!(graphics.store().image_count(), 1);
    }

    #[test]
    fn test_raw_rgba_upload_loads() {
        let mut graphics = engine();
        // 2x1 RGBA pixels.
        let pixels: [u8; 8] = [1, 2, 3, 255, 4, 5, 6, 255];
        let encoded = {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            STANDARD.encode(pixels)
        };
        let cmd = format!("Gi=3,a=t,f=32,s=2,v=1;{}", encoded);
        let result = graphics.process_command(cmd.as_bytes(), &mut NoCells);
        assert!(!result.error, "{}", result.response);
        assert_eq!(result.response, "\x1b_Gi=3;OK\x1b\\");
        let img = graphics.store().find_image(3).unwrap();
        assert_eq!(img.status, ImageStatus::RamLoadOk);
        assert_eq!((img.pix_width, img.pix_height), (2, 1));
        // The decoded RAM size is s * v * 4.
        assert_eq!(graphics.store().ram_bytes(), 2 * 1 * 4);
    }

    #[test]
    fn test_zero_dimension_raw_upload_is_ebadf() {
        let mut graphics = engine();
        let result = graphics.process_command(b"Gi=3,a=t,f=32,s=0,v=4;YWJj", &mut NoCells);
        assert!(result.error);
        assert_eq!(result.response, "\x1b_Gi=3;EBADF: could not load image\x1b\\");
        assert_eq!(
            graphics.store().find_image(3).unwrap().status,
            ImageStatus::RamLoadErr
        );
    }

    #[test]
    fn test_query_image_is_discarded() {
        let mut graphics = engine();
        let pixels: [u8; 4] = [9, 9, 9, 255];
        let encoded = {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            STANDARD.encode(pixels)
        };
        let cmd = format!("Gi=31,a=q,f=32,s=1,v=1;{}", encoded);
        let result = graphics.process_command(cmd.as_bytes(), &mut NoCells);
        // The response is addressed with the query id.
        assert_eq!(result.response, "\x1b_Gi=31;OK\x1b\\");
        // The ephemeral image is gone, and id 31 was never taken.
        assert_eq!(graphics.store().image_count(), 0);
        assert!(graphics.store().find_image(31).is_none());
    }

    #[test]
    fn test_quiet_suppresses_ok() {
        let mut graphics = engine();
        let pixels: [u8; 4] = [9, 9, 9, 255];
        let encoded = {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            STANDARD.encode(pixels)
        };
        let cmd = format!("Gi=4,a=t,f=32,s=1,v=1,q=1;{}", encoded);
        let result = graphics.process_command(cmd.as_bytes(), &mut NoCells);
        assert!(result.response.is_empty());
        assert!(!result.error);

        // q=2 also suppresses errors.
        let result = graphics.process_command(b"Gi=5,a=t,f=32,s=0,v=0,q=2;YQ==", &mut NoCells);
        assert!(result.error);
        assert!(result.response.is_empty());
    }

    #[test]
    fn test_maybe_delete_temp_file_requires_both_conditions() {
        let tmp = std::env::temp_dir();
        std::env::set_var("TMPDIR", &tmp);

        let guarded = tmp.join("some-user-file.png");
        std::fs::write(&guarded, b"data").unwrap();
        maybe_delete_temp_file(&guarded);
        assert!(guarded.exists(), "name check must protect the file");
        std::fs::remove_file(&guarded).unwrap();

        let matching = tmp.join("tty-graphics-protocol-test.png");
        std::fs::write(&matching, b"data").unwrap();
        maybe_delete_temp_file(&matching);
        assert!(!matching.exists(), "protocol temp file should be deleted");
    }
}
