/// Maximum length of a sanitized string used in log messages.
const MAX_SANITIZED_LEN: usize = 256;

/// Replaces non-printable and non-ASCII characters with '?' and truncates
/// long strings, inserting an ellipsis at the end. Client-controlled strings
/// (file names, payload fragments) must go through this before being logged.
pub fn sanitized_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_SANITIZED_LEN));
    for ch in s.chars() {
        if out.len() >= MAX_SANITIZED_LEN - 3 {
            out.push_str("...");
            return out;
        }
        if ch.is_ascii() && !ch.is_ascii_control() {
            out.push(ch);
        } else {
            out.push('?');
        }
    }
    out
}

/// `sanitized_str` for anything path-like.
pub fn sanitized_filename(path: impl AsRef<std::path::Path>) -> String {
    sanitized_str(&path.as_ref().to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_passthrough() {
        assert_eq!(sanitized_str("/tmp/img-007"), "/tmp/img-007");
    }

    #[test]
    fn test_control_chars_replaced() {
        assert_eq!(sanitized_str("a\x1b[31mb\n"), "a?[31mb?");
    }

    #[test]
    fn test_long_string_truncated() {
        let long = "x".repeat(1000);
        let out = sanitized_str(&long);
        assert!(out.len() <= MAX_SANITIZED_LEN);
        assert!(out.ends_with("..."));
    }
}
