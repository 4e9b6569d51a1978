//! Shared winnow-based parsing utilities used by the archive directory parser.

use winnow::Parser;
use winnow::binary::{le_u16, le_u32};
use winnow::error::{ContextError, ErrMode};

/// Common result type for winnow parsers.
pub type WResult<T> = Result<T, ErrMode<ContextError>>;

pub fn u16_le(input: &mut &[u8]) -> WResult<u16> {
    le_u16.parse_next(input)
}

pub fn u32_le(input: &mut &[u8]) -> WResult<u32> {
    le_u32.parse_next(input)
}

/// Take exactly `count` bytes.
pub fn bytes<'a>(input: &mut &'a [u8], count: usize) -> WResult<&'a [u8]> {
    if input.len() < count {
        return Err(ErrMode::Cut(ContextError::new()));
    }
    let (head, tail) = input.split_at(count);
    *input = tail;
    Ok(head)
}

/// Read a null-terminated string, consuming the terminator.
///
/// Invalid UTF-8 is replaced rather than rejected; archive paths are ASCII in practice.
pub fn null_terminated_string(input: &mut &[u8]) -> WResult<String> {
    let Some(end) = input.iter().position(|&b| b == 0) else {
        return Err(ErrMode::Cut(ContextError::new()));
    };
    let text = String::from_utf8_lossy(&input[..end]).into_owned();
    *input = &input[end + 1..];
    Ok(text)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_strings_and_integers() {
        let data = b"mdl\0\x34\x12\x78\x56\x34\x12rest";
        let mut input = &data[..];
        assert_eq!(null_terminated_string(&mut input).unwrap(), "mdl");
        assert_eq!(u16_le(&mut input).unwrap(), 0x1234);
        assert_eq!(u32_le(&mut input).unwrap(), 0x12345678);
        assert_eq!(bytes(&mut input, 4).unwrap(), b"rest");
        assert!(input.is_empty());
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut input = &b"abc"[..];
        assert!(null_terminated_string(&mut input).is_err());
    }
}
