//! Little-endian read helpers shared by the stream and cache parsers.

use std::io::{self, Read};

pub(crate) fn read_u8(reader: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16(reader: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads a `u16`, returning `None` on a clean end-of-stream before the
/// first byte. End-of-stream in the middle of the value is an error.
pub(crate) fn read_u16_or_eof(reader: &mut impl Read) -> io::Result<Option<u16>> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside an entry header",
                ))
            };
        }
        filled += n;
    }
    Ok(Some(u16::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_before_value_is_clean() {
        let mut empty: &[u8] = &[];
        assert_eq!(read_u16_or_eof(&mut empty).unwrap(), None);
    }

    #[test]
    fn eof_inside_value_is_an_error() {
        let mut short: &[u8] = &[0x01];
        let err = read_u16_or_eof(&mut short).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn little_endian_decoding() {
        let mut data: &[u8] = &[0x34, 0x12, 0xff, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
        assert_eq!(read_u16(&mut data).unwrap(), 0x1234);
        assert_eq!(read_u8(&mut data).unwrap(), 0xff);
        assert_eq!(read_u64(&mut data).unwrap(), 0x1122334455667788);
    }
}
