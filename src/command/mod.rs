pub mod parser;

pub use parser::{parse, ParseError};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

/// Image data format (the `f=` key). Anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// `f=0`: try the format-autodetecting decoder, fall back to raw RGBA.
    #[default]
    Auto,
    /// `f=24`: raw RGB pixel data.
    Rgb,
    /// `f=32`: raw RGBA pixel data.
    Rgba,
    /// `f=100`: an image-file format handled by the autodetecting decoder.
    File,
}

impl Format {
    pub fn from_key(num: i64) -> Option<Self> {
        match num {
            0 => Some(Self::Auto),
            24 => Some(Self::Rgb),
            32 => Some(Self::Rgba),
            100 => Some(Self::File),
            _ => None,
        }
    }

    /// Bytes per pixel of the raw representation (RGBA for `Auto` fallback).
    pub fn pixel_size(&self) -> usize {
        match self {
            Self::Rgb => 3,
            _ => 4,
        }
    }
}

/// A parsed graphics command. Borrows the payload from the input buffer.
#[derive(Debug, Clone)]
pub struct GraphicsCommand<'a> {
    /// The key-value section, without the leading 'G' (for error messages).
    pub control: &'a str,
    /// The base64 payload after ';' (may be empty).
    pub payload: &'a [u8],
    /// 'a=', may be 't', 'T', 'p', 'q' or 'd'.
    pub action: Option<char>,
    /// 'q=', 1 to suppress OK responses, 2 to suppress errors too.
    pub quiet: u8,
    /// 'f='.
    pub format: Format,
    /// 'o=', only 'z' (zlib) is accepted.
    pub compression: bool,
    /// 't=', may be 'd', 'f' or 't'.
    pub medium: Option<char>,
    /// 'd='.
    pub delete_specifier: Option<char>,
    /// 's=', 'v=', pixel dimensions for the raw formats.
    pub pix_width: u32,
    pub pix_height: u32,
    /// 'x=', 'y=', 'w=', 'h=', source rectangle in pixels (negatives clamped).
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    /// 'i='.
    pub image_id: u32,
    /// 'I='.
    pub image_number: u32,
    /// 'p='.
    pub placement_id: u32,
    /// 'c=', 'r='.
    pub columns: u16,
    pub rows: u16,
    /// 'm=': whether more chunks follow.
    pub more: bool,
    /// True if 'm=' was present at all.
    pub is_data_transmission: bool,
    /// Set by the transmit handler when this command turned out to be a
    /// continuation of an ongoing direct upload rather than the first chunk.
    pub is_direct_transmission_continuation: bool,
    /// 'S=', expected total size of the uploaded data.
    pub expected_size: u64,
    /// 'U=', placement only annotates Unicode placeholder cells.
    pub virtual_placement: bool,
    /// 'C=', do not move the cursor when displaying the placement.
    pub do_not_move_cursor: bool,
}

impl<'a> GraphicsCommand<'a> {
    pub fn new(control: &'a str, payload: &'a [u8]) -> Self {
        Self {
            control,
            payload,
            action: None,
            quiet: 0,
            format: Format::Auto,
            compression: false,
            medium: None,
            delete_specifier: None,
            pix_width: 0,
            pix_height: 0,
            src_x: 0,
            src_y: 0,
            src_w: 0,
            src_h: 0,
            image_id: 0,
            image_number: 0,
            placement_id: 0,
            columns: 0,
            rows: 0,
            more: false,
            is_data_transmission: false,
            is_direct_transmission_continuation: false,
            expected_size: 0,
            virtual_placement: false,
            do_not_move_cursor: false,
        }
    }
}

/// Decodes the base64 payload of a command. Whitespace is stripped first and
/// missing padding is tolerated, since clients chunk payloads arbitrarily.
pub fn decode_base64(payload: &[u8]) -> Option<Vec<u8>> {
    let trimmed: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    STANDARD
        .decode(&trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(&trimmed))
        .ok()
}
