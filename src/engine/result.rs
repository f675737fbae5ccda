/// The record the emulator uses to synthesize placeholder glyphs in the
/// cell buffer after a successful non-virtual put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placeholder {
    pub image_id: u32,
    pub placement_id: u32,
    pub columns: u32,
    pub rows: u32,
    pub do_not_move_cursor: bool,
}

/// The structured result of one graphics command, populated along the
/// command's call chain.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Whether the terminal needs to be redrawn.
    pub redraw: bool,
    /// The response to send back to the client (empty when suppressed).
    pub response: String,
    /// Whether there was an error executing the command (the response must
    /// be sent back regardless).
    pub error: bool,
    /// The placeholder the terminal has to create, for non-virtual puts.
    pub placeholder: Option<Placeholder>,
}

impl CommandResult {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Formats the `ESC _ G <headers> ; <message> ESC \` response. Headers
    /// echo back whichever ids the client supplied so it can correlate.
    pub(crate) fn set_response(
        &mut self,
        image_id: u32,
        image_number: u32,
        placement_id: u32,
        message: &str,
    ) {
        if image_id == 0 && image_number == 0 && placement_id == 0 {
            // Nobody is waiting for this response.
            log::error!(
                "no image id, image number or placement id, dropping response: {}",
                message
            );
            return;
        }
        let mut headers = Vec::new();
        if image_id != 0 {
            headers.push(format!("i={}", image_id));
        }
        if image_number != 0 {
            headers.push(format!("I={}", image_number));
        }
        if placement_id != 0 {
            headers.push(format!("p={}", placement_id));
        }
        self.response = format!("\x1b_G{};{}\x1b\\", headers.join(","), message);
    }
}
