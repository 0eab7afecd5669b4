//! Datagram-level reads and writes: header fields, the bounded pointer scan,
//! and the two gram writers (fresh outbound, and in-place-style replies).

use crate::{
    INSTRUCTION_START, Key, MAX_PATH_STEPS, Route,
    error::{WireError, WireResult},
    ser,
};

/// Milliseconds this datagram may live on its current hop.
pub fn read_ttl(gram: &[u8]) -> WireResult<u16> {
    ser::read_u16(gram, 0)
}

/// Segment-size hint the datagram was built against.
pub fn read_seg_size(gram: &[u8]) -> WireResult<u16> {
    ser::read_u16(gram, 2)
}

/// Scan for the pointer marker.
///
/// Starts at the first instruction byte and steps over routing-hop pairs;
/// succeeds on the marker, fails on any other key or after
/// [`MAX_PATH_STEPS`] pairs. Purely a read; no bytes move.
pub fn find_ptr(gram: &[u8]) -> WireResult<usize> {
    let mut ptr = INSTRUCTION_START;
    for _ in 0..MAX_PATH_STEPS {
        let Some(byte) = gram.get(ptr) else {
            return Err(WireError::UnexpectedEnd);
        };
        match Key::from_byte(*byte) {
            Some(Key::Ptr) => return Ok(ptr),
            Some(key) if key.is_hop() => ptr += 2,
            _ => return Err(WireError::StrayKey),
        }
    }
    Err(WireError::MissingPtr)
}

/// Write a fresh outbound datagram: header from the route's defaults, the
/// route's path bytes, then the payload. Returns the written length.
pub fn write_datagram(out: &mut [u8], route: &Route, payload: &[u8]) -> WireResult<usize> {
    let mut wptr = 0;
    ser::write_u16(out, &mut wptr, route.ttl)?;
    ser::write_u16(out, &mut wptr, route.seg_size)?;
    let path = route.path();
    let end = wptr + path.len() + payload.len();
    if end > usize::from(route.seg_size) {
        return Err(WireError::Oversize);
    }
    let Some(bytes) = out.get_mut(wptr..end) else {
        return Err(WireError::UnexpectedEnd);
    };
    bytes[..path.len()].copy_from_slice(path);
    bytes[path.len()..].copy_from_slice(payload);
    Ok(end)
}

/// Write a reply to `request` into `out`.
///
/// Copies the header, places a fresh pointer marker at the instruction
/// start, then copies the request's return trail backwards pair by pair so
/// the reply's forward plan retraces the consumed path, and appends the
/// payload. Bounded by the smaller of `out` and the request's segment size.
pub fn write_reply(request: &[u8], out: &mut [u8], payload: &[u8]) -> WireResult<usize> {
    let Some(header) = request.get(..INSTRUCTION_START) else {
        return Err(WireError::UnexpectedEnd);
    };
    let ptr = find_ptr(request)?;
    let max_len = out.len().min(usize::from(read_seg_size(request)?));
    let len = ptr + 1 + payload.len();
    if len > max_len {
        return Err(WireError::Oversize);
    }
    out[..INSTRUCTION_START].copy_from_slice(header);
    let mut wptr = INSTRUCTION_START;
    out[wptr] = Key::Ptr.byte();
    wptr += 1;
    // trail pairs come out in reverse order, each pair's bytes verbatim
    let mut rptr = ptr;
    for _ in 0..MAX_PATH_STEPS {
        if wptr >= ptr {
            break;
        }
        rptr -= 2;
        match Key::from_byte(request[rptr]) {
            Some(key) if key.is_hop() => {
                out[wptr..wptr + 2].copy_from_slice(&request[rptr..rptr + 2]);
                wptr += 2;
            }
            _ => return Err(WireError::StrayKey),
        }
    }
    out[ptr + 1..len].copy_from_slice(payload);
    Ok(len)
}
