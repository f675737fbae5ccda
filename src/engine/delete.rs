use crate::command::GraphicsCommand;
use crate::engine::{CellGrid, Graphics};

impl Graphics {
    /// Handles the delete command. A lowercase specifier unlinks placements
    /// only; an uppercase one additionally deletes an image whose placement
    /// count drops to zero.
    pub(crate) fn handle_delete(&mut self, cmd: &GraphicsCommand, cells: &mut dyn CellGrid) {
        match cmd.delete_specifier {
            None | Some('a') | Some('A') => {
                self.delete_all_visible(cmd, cells, cmd.delete_specifier == Some('A'));
            }
            Some('i') | Some('I') => {
                self.delete_by_id(cmd, false, cmd.delete_specifier == Some('I'));
            }
            Some('n') | Some('N') => {
                self.delete_by_id(cmd, true, cmd.delete_specifier == Some('N'));
            }
            Some(other) => {
                log::warn!(
                    "unsupported value of the d key: '{}', the command is ignored",
                    other
                );
            }
        }
    }

    /// Deletes every visible (classic, non-virtual) placement. The emulator
    /// iterates its grid and clears the cells we claim.
    fn delete_all_visible(
        &mut self,
        cmd: &GraphicsCommand,
        cells: &mut dyn CellGrid,
        delete_images: bool,
    ) {
        cells.for_each_image_cell(&mut |cell| cell.is_classic);

        let targets: Vec<(u32, u32)> = self
            .store
            .images()
            .flat_map(|img| {
                img.placements
                    .values()
                    .filter(|placement| !placement.virtual_placement)
                    .map(|placement| (img.image_id, placement.placement_id))
            })
            .collect();
        let mut touched_images: Vec<u32> = Vec::new();
        for (image_id, placement_id) in targets {
            self.store.delete_placement(image_id, placement_id);
            if !touched_images.contains(&image_id) {
                touched_images.push(image_id);
            }
        }
        if delete_images {
            for image_id in touched_images {
                let empty = self
                    .store
                    .find_image(image_id)
                    .map(|img| img.placements.is_empty())
                    .unwrap_or(false);
                if empty {
                    self.store.delete_image(image_id, &self.cache);
                }
            }
        }

        // Freed placements must not be drawn by a later flush.
        self.bank.clear();
        self.result.redraw = true;
        self.report_success_cmd(cmd);
    }

    /// Deletes placements (or the whole image) addressed by id or number,
    /// optionally narrowed to a single placement.
    fn delete_by_id(&mut self, cmd: &GraphicsCommand, by_number: bool, delete_image: bool) {
        if (by_number && cmd.image_number == 0) || (!by_number && cmd.image_id == 0) {
            self.report_error_cmd(
                cmd,
                if by_number {
                    "EINVAL: no image number to delete"
                } else {
                    "EINVAL: no image id to delete"
                },
            );
            return;
        }

        let found = if by_number {
            self.store
                .find_image_by_number(cmd.image_number)
                .map(|img| img.image_id)
        } else {
            self.store.find_image(cmd.image_id).map(|img| img.image_id)
        };
        let Some(image_id) = found else {
            // Deleting something that is already gone is not an error.
            self.report_success_cmd(cmd);
            return;
        };

        if cmd.placement_id != 0 {
            self.store.delete_placement(image_id, cmd.placement_id);
            let empty = self
                .store
                .find_image(image_id)
                .map(|img| img.placements.is_empty())
                .unwrap_or(false);
            if delete_image && empty {
                self.store.delete_image(image_id, &self.cache);
            }
        } else if delete_image {
            // The uppercase form without a placement deletes the image even
            // when only virtual placements still reference it.
            self.store.delete_image(image_id, &self.cache);
        } else {
            let placement_ids: Vec<u32> = self
                .store
                .find_image(image_id)
                .map(|img| img.placements.keys().copied().collect())
                .unwrap_or_default();
            for placement_id in placement_ids {
                self.store.delete_placement(image_id, placement_id);
            }
        }

        self.result.redraw = true;
        self.report_success_cmd(cmd);
    }
}
