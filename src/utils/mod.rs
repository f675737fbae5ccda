pub mod error;
pub mod sanitize;

pub use error::{GraphicsError, Result};
pub use sanitize::{sanitized_filename, sanitized_str};
