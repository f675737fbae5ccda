use image::RgbaImage;

/// Max number of pending image rectangles per frame. Fixed so the per-cell
/// hot path never allocates.
pub const MAX_IMAGE_RECTS: usize = 20;

/// The surface the engine draws into. Implemented by the host emulator on
/// top of its back buffer.
pub trait BlitTarget {
    /// Draws a fragment of an RGBA raster at a pixel position. The source
    /// rectangle is guaranteed to lie within the raster.
    fn blit(
        &mut self,
        raster: &RgbaImage,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dst_x: i32,
        dst_y: i32,
    );
}

/// A rectangular piece of a placement waiting to be drawn. Columns and rows
/// are in cells: starts zero-based, ends exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRect {
    pub image_id: u32,
    pub placement_id: u32,
    /// Position of the rectangle on the buffer, in pixels.
    pub x_pix: i32,
    pub y_pix: i32,
    pub start_col: i32,
    pub end_col: i32,
    pub start_row: i32,
    pub end_row: i32,
    /// Cell dimensions the rect was appended with.
    pub cw: u16,
    pub ch: u16,
    /// Whether colors should be inverted.
    pub reverse: bool,
}

impl ImageRect {
    pub fn is_empty(&self) -> bool {
        self.image_id == 0
    }

    /// The pixel coordinate just below the rectangle.
    pub fn bottom_pix(&self) -> i32 {
        self.y_pix + (self.end_row - self.start_row) * self.ch as i32
    }
}

/// A fixed bank of pending rectangles. Vertically contiguous stripes of the
/// same placement are merged; under bank pressure the rect reaching lowest
/// on the screen is handed back for eager drawing.
pub struct RectBank {
    rects: [ImageRect; MAX_IMAGE_RECTS],
}

impl Default for RectBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RectBank {
    pub fn new() -> Self {
        Self {
            rects: [ImageRect::default(); MAX_IMAGE_RECTS],
        }
    }

    /// Appends a rectangle. Returns a rectangle that must be drawn
    /// immediately when the bank was full and a slot had to be reused.
    pub fn append(&mut self, new_rect: ImageRect) -> Option<ImageRect> {
        // The empty image or an empty rectangle: nothing to do.
        if new_rect.image_id == 0
            || new_rect.end_col <= new_rect.start_col
            || new_rect.end_row <= new_rect.start_row
        {
            return None;
        }

        // Try to merge: the new stripe must attach to the bottom of an
        // existing rectangle with identical horizontal extent.
        let mut free_slot = None;
        for (i, rect) in self.rects.iter_mut().enumerate() {
            if rect.is_empty() {
                if free_slot.is_none() {
                    free_slot = Some(i);
                }
                continue;
            }
            if rect.image_id != new_rect.image_id
                || rect.placement_id != new_rect.placement_id
                || rect.cw != new_rect.cw
                || rect.ch != new_rect.ch
                || rect.reverse != new_rect.reverse
            {
                continue;
            }
            if rect.end_row == new_rect.start_row
                && rect.bottom_pix() == new_rect.y_pix
                && rect.start_col == new_rect.start_col
                && rect.end_col == new_rect.end_col
                && rect.x_pix == new_rect.x_pix
            {
                rect.end_row = new_rect.end_row;
                return None;
            }
        }

        // No merge. Take a free slot, or flush the rect reaching lowest on
        // the screen and reuse its slot.
        let (slot, evicted) = match free_slot {
            Some(i) => (i, None),
            None => {
                let i = self
                    .rects
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, rect)| rect.bottom_pix())
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                (i, Some(self.rects[i]))
            }
        };
        self.rects[slot] = new_rect;
        evicted
    }

    /// Removes and returns every pending rectangle.
    pub fn drain(&mut self) -> impl Iterator<Item = ImageRect> + '_ {
        self.rects
            .iter_mut()
            .filter(|rect| !rect.is_empty())
            .map(std::mem::take)
    }

    pub fn clear(&mut self) {
        self.rects = [ImageRect::default(); MAX_IMAGE_RECTS];
    }

    #[cfg(test)]
    fn occupied(&self) -> usize {
        self.rects.iter().filter(|rect| !rect.is_empty()).count()
    }
}
