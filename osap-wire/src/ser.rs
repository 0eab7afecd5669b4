//! Little-endian scalar and string serializers shared by handlers and adapters.
//!
//! Writers advance a caller-held write pointer; readers take a fixed offset.
//! Strings go on the wire as a `u16` byte length followed by UTF-8 bytes.

use crate::error::{WireError, WireResult};

/// Write a `u16` at `*wptr`, advancing it.
pub fn write_u16(buf: &mut [u8], wptr: &mut usize, val: u16) -> WireResult<()> {
    let Some(bytes) = buf.get_mut(*wptr..*wptr + 2) else {
        return Err(WireError::UnexpectedEnd);
    };
    bytes.copy_from_slice(&val.to_le_bytes());
    *wptr += 2;
    Ok(())
}

/// Read a `u16` at `at`.
pub fn read_u16(buf: &[u8], at: usize) -> WireResult<u16> {
    let Some(bytes) = buf.get(at..).and_then(|buf| buf.first_chunk::<2>()) else {
        return Err(WireError::UnexpectedEnd);
    };
    Ok(u16::from_le_bytes(*bytes))
}

/// Write a `u32` at `*wptr`, advancing it.
pub fn write_u32(buf: &mut [u8], wptr: &mut usize, val: u32) -> WireResult<()> {
    let Some(bytes) = buf.get_mut(*wptr..*wptr + 4) else {
        return Err(WireError::UnexpectedEnd);
    };
    bytes.copy_from_slice(&val.to_le_bytes());
    *wptr += 4;
    Ok(())
}

/// Read a `u32` at `at`.
pub fn read_u32(buf: &[u8], at: usize) -> WireResult<u32> {
    let Some(bytes) = buf.get(at..).and_then(|buf| buf.first_chunk::<4>()) else {
        return Err(WireError::UnexpectedEnd);
    };
    Ok(u32::from_le_bytes(*bytes))
}

/// Write a length-prefixed string at `*wptr`, advancing it.
pub fn write_str(buf: &mut [u8], wptr: &mut usize, val: &str) -> WireResult<()> {
    let len = val.len();
    if len > usize::from(u16::MAX) {
        return Err(WireError::Oversize);
    }
    write_u16(buf, wptr, len as u16)?;
    let Some(bytes) = buf.get_mut(*wptr..*wptr + len) else {
        return Err(WireError::UnexpectedEnd);
    };
    bytes.copy_from_slice(val.as_bytes());
    *wptr += len;
    Ok(())
}

/// Read a length-prefixed string starting at `at`, returning it and the
/// offset just past it.
pub fn read_str(buf: &[u8], at: usize) -> WireResult<(&str, usize)> {
    let len = usize::from(read_u16(buf, at)?);
    let start = at + 2;
    let Some(bytes) = buf.get(start..start + len) else {
        return Err(WireError::UnexpectedEnd);
    };
    let val = core::str::from_utf8(bytes).map_err(|_| WireError::BadString)?;
    Ok((val, start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut buf = [0u8; 8];
        let mut wptr = 0;
        write_u16(&mut buf, &mut wptr, 1000).unwrap();
        write_u32(&mut buf, &mut wptr, 0xDEAD_BEEF).unwrap();
        assert_eq!(wptr, 6);
        assert_eq!(buf[..2], [232, 3]);
        assert_eq!(read_u16(&buf, 0).unwrap(), 1000);
        assert_eq!(read_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_scalar_bounds() {
        let mut buf = [0u8; 3];
        let mut wptr = 2;
        assert_eq!(
            write_u16(&mut buf, &mut wptr, 7),
            Err(WireError::UnexpectedEnd)
        );
        assert_eq!(read_u32(&buf, 0), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn test_str_roundtrip() {
        let mut buf = [0u8; 16];
        let mut wptr = 0;
        write_str(&mut buf, &mut wptr, "rt_node").unwrap();
        assert_eq!(buf[..2], [7, 0]);
        let (val, end) = read_str(&buf, 0).unwrap();
        assert_eq!(val, "rt_node");
        assert_eq!(end, 9);
    }

    #[test]
    fn test_str_rejects_bad_utf8() {
        let buf = [2, 0, 0xFF, 0xFE];
        assert_eq!(read_str(&buf, 0), Err(WireError::BadString));
    }
}
