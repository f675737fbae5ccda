use crate::command::{Format, GraphicsCommand};

/// A parse failure, carrying whatever response-addressing ids were seen
/// before the offending pair so the error response can still be correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub image_id: u32,
    pub image_number: u32,
    pub placement_id: u32,
    pub quiet: u8,
}

impl ParseError {
    fn new(cmd: &GraphicsCommand, message: String) -> Self {
        Self {
            message,
            image_id: cmd.image_id,
            image_number: cmd.image_number,
            placement_id: cmd.placement_id,
            quiet: cmd.quiet,
        }
    }
}

/// Parses the body of a graphics command (everything after the leading 'G'):
/// `key=value` pairs separated by ',', then an optional ';' followed by the
/// base64 payload which extends to the end of the buffer.
pub fn parse(buf: &[u8]) -> Result<GraphicsCommand<'_>, ParseError> {
    let (control_bytes, payload) = match buf.iter().position(|&b| b == b';') {
        Some(pos) => (&buf[..pos], &buf[pos + 1..]),
        None => (buf, &buf[buf.len()..]),
    };

    let control = match std::str::from_utf8(control_bytes) {
        Ok(s) => s,
        Err(_) => {
            return Err(ParseError {
                message: "EINVAL: control data is not valid ASCII".to_string(),
                image_id: 0,
                image_number: 0,
                placement_id: 0,
                quiet: 0,
            })
        }
    };

    let mut cmd = GraphicsCommand::new(control, payload);
    if control.is_empty() {
        return Ok(cmd);
    }

    for pair in control.split(',') {
        set_key_value(&mut cmd, pair)?;
    }

    Ok(cmd)
}

/// Parses one `key=value` pair and assigns it to the corresponding field.
fn set_key_value<'a>(cmd: &mut GraphicsCommand<'a>, pair: &'a str) -> Result<(), ParseError> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| ParseError::new(cmd, format!("EINVAL: key without value: {}", pair)))?;

    if key.len() != 1 {
        return Err(ParseError::new(
            cmd,
            format!("EINVAL: unknown key of length {}: {}", key.len(), key),
        ));
    }
    let key = key.chars().next().unwrap();

    if value.is_empty() {
        return Err(ParseError::new(cmd, format!("EINVAL: empty value for key '{}'", key)));
    }

    // 'a', 't', 'd' and 'o' take single-character values, everything else is
    // a decimal integer.
    let mut ch = '\0';
    let mut num: i64 = 0;
    if matches!(key, 'a' | 't' | 'd' | 'o') {
        if value.len() != 1 {
            return Err(ParseError::new(
                cmd,
                format!("EINVAL: value of '{}' must be a single char: {}", key, value),
            ));
        }
        ch = value.chars().next().unwrap();
    } else {
        num = value.parse::<i64>().map_err(|_| {
            ParseError::new(
                cmd,
                format!("EINVAL: could not parse number value: {}={}", key, value),
            )
        })?;
    }

    match key {
        'a' => cmd.action = Some(ch),
        't' => cmd.medium = Some(ch),
        'd' => cmd.delete_specifier = Some(ch),
        'o' => {
            if ch != 'z' {
                return Err(ParseError::new(
                    cmd,
                    format!("EINVAL: unsupported compression specification: o={}", ch),
                ));
            }
            cmd.compression = true;
        }
        'q' => cmd.quiet = num.clamp(0, u8::MAX as i64) as u8,
        'f' => {
            cmd.format = Format::from_key(num).ok_or_else(|| {
                ParseError::new(
                    cmd,
                    format!("EINVAL: unsupported format specification: f={}", num),
                )
            })?;
        }
        's' => cmd.pix_width = clamp_u32(num),
        'v' => cmd.pix_height = clamp_u32(num),
        'x' => cmd.src_x = clamp_u32(num),
        'y' => cmd.src_y = clamp_u32(num),
        'w' => cmd.src_w = clamp_u32(num),
        'h' => cmd.src_h = clamp_u32(num),
        'i' => cmd.image_id = clamp_u32(num),
        'I' => cmd.image_number = clamp_u32(num),
        'p' => cmd.placement_id = clamp_u32(num),
        'c' => cmd.columns = clamp_u16(num),
        'r' => cmd.rows = clamp_u16(num),
        'm' => {
            cmd.is_data_transmission = true;
            cmd.more = num != 0;
        }
        'S' => cmd.expected_size = num.max(0) as u64,
        'U' => cmd.virtual_placement = num != 0,
        'C' => cmd.do_not_move_cursor = num != 0,
        'X' | 'Y' | 'z' => {
            log::warn!("the key '{}' is not supported and will be ignored", key);
        }
        _ => {
            return Err(ParseError::new(cmd, format!("EINVAL: unsupported key: {}", key)));
        }
    }

    Ok(())
}

fn clamp_u32(num: i64) -> u32 {
    num.clamp(0, u32::MAX as i64) as u32
}

fn clamp_u16(num: i64) -> u16 {
    num.clamp(0, u16::MAX as i64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transmit_command() {
        let cmd = parse(b"i=7,a=t,f=100,t=d,m=1,S=9;YWJj").unwrap();
        assert_eq!(cmd.image_id, 7);
        assert_eq!(cmd.action, Some('t'));
        assert_eq!(cmd.format, Format::File);
        assert_eq!(cmd.medium, Some('d'));
        assert!(cmd.is_data_transmission);
        assert!(cmd.more);
        assert_eq!(cmd.expected_size, 9);
        assert_eq!(cmd.payload, b"YWJj");
    }

    #[test]
    fn test_parse_put_command() {
        let cmd = parse(b"a=p,i=5,p=3,c=4,r=2,U=1,C=1,x=10,y=20,w=30,h=40").unwrap();
        assert_eq!(cmd.action, Some('p'));
        assert_eq!(cmd.image_id, 5);
        assert_eq!(cmd.placement_id, 3);
        assert_eq!(cmd.columns, 4);
        assert_eq!(cmd.rows, 2);
        assert!(cmd.virtual_placement);
        assert!(cmd.do_not_move_cursor);
        assert_eq!((cmd.src_x, cmd.src_y, cmd.src_w, cmd.src_h), (10, 20, 30, 40));
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_parse_no_payload_separator() {
        let cmd = parse(b"a=d,d=I,i=5").unwrap();
        assert_eq!(cmd.action, Some('d'));
        assert_eq!(cmd.delete_specifier, Some('I'));
        assert_eq!(cmd.image_id, 5);
    }

    #[test]
    fn test_parse_negative_values_clamped() {
        let cmd = parse(b"a=p,i=1,x=-5,y=-1,c=-3").unwrap();
        assert_eq!(cmd.src_x, 0);
        assert_eq!(cmd.src_y, 0);
        assert_eq!(cmd.columns, 0);
    }

    #[test]
    fn test_parse_bad_format() {
        let err = parse(b"i=9,a=t,f=33").unwrap_err();
        assert!(err.message.contains("EINVAL"), "{}", err.message);
        assert!(err.message.contains("format"), "{}", err.message);
        // Ids seen before the error are kept for the response.
        assert_eq!(err.image_id, 9);
    }

    #[test]
    fn test_parse_bad_compression() {
        let err = parse(b"a=t,o=x").unwrap_err();
        assert!(err.message.contains("compression"), "{}", err.message);
    }

    #[test]
    fn test_parse_key_without_value() {
        let err = parse(b"a=t,m").unwrap_err();
        assert!(err.message.contains("key without value"), "{}", err.message);
    }

    #[test]
    fn test_parse_empty_value() {
        let err = parse(b"i=,a=t").unwrap_err();
        assert!(err.message.contains("empty value"), "{}", err.message);
    }

    #[test]
    fn test_parse_char_value_too_long() {
        let err = parse(b"a=tt").unwrap_err();
        assert!(err.message.contains("single char"), "{}", err.message);
    }

    #[test]
    fn test_parse_unparsable_number() {
        let err = parse(b"i=abc").unwrap_err();
        assert!(err.message.contains("could not parse number"), "{}", err.message);
    }

    #[test]
    fn test_parse_unknown_key() {
        let err = parse(b"k=1").unwrap_err();
        assert!(err.message.contains("unsupported key"), "{}", err.message);
    }

    #[test]
    fn test_parse_ignored_keys() {
        // 'X', 'Y' and 'z' are accepted but ignored.
        let cmd = parse(b"a=p,i=1,X=4,Y=5,z=-1").unwrap();
        assert_eq!(cmd.action, Some('p'));
        assert_eq!(cmd.image_id, 1);
    }

    #[test]
    fn test_parse_multi_chunk_flag() {
        let cmd = parse(b"m=0;ZGVm").unwrap();
        assert!(cmd.is_data_transmission);
        assert!(!cmd.more);
        assert_eq!(cmd.payload, b"ZGVm");
        assert_eq!(cmd.action, None);
    }

    #[test]
    fn test_parse_quiet_levels() {
        assert_eq!(parse(b"a=t,q=1").unwrap().quiet, 1);
        assert_eq!(parse(b"a=t,q=2").unwrap().quiet, 2);
    }
}
