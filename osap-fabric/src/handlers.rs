//! Canned terminal handlers every vertex answers with: ping, graph scope,
//! and the root debug surface. All three are pure reply builders over the
//! request bytes, so they compose and test without a live pool.

use crate::{VERSION_NUM, keys, report::ReportSink};

use osap_wire::{Key, error::WireError, ser, write_reply};

type WireResult<T> = Result<T, WireError>;

/// Build the ping response over the request's reversed trail.
pub(crate) fn ping_reply(request: &[u8], id: u8, out: &mut [u8]) -> WireResult<usize> {
    write_reply(request, out, &[Key::Dest.byte(), Key::PingRes.byte(), id])
}

/// Link-state section of a scope reply.
pub(crate) enum ScopeLinkState {
    None,
    Port {
        open: bool,
    },
    Bus {
        addr_space: u16,
        own_rx_addr: u16,
        /// One bit per address, lsb-first within each byte.
        open_bits: Vec<u8>,
    },
}

/// Everything the graph-introspection response says about a vertex.
pub(crate) struct ScopeInfo<'a> {
    /// Time tag from the previous traversal, echoed back.
    pub old_time_tag: u32,
    pub type_key: u8,
    pub link: ScopeLinkState,
    pub indice: u16,
    pub siblings: u16,
    pub children: u16,
    pub name: &'a str,
}

/// Build the scope response: identity, link state, and tree position.
pub(crate) fn scope_reply(
    request: &[u8],
    id: u8,
    info: &ScopeInfo<'_>,
    out: &mut [u8],
) -> WireResult<usize> {
    let mut payload = [0u8; crate::MAX_PACKET_SIZE];
    payload[0] = Key::Dest.byte();
    payload[1] = Key::ScopeRes.byte();
    payload[2] = id;
    let mut wptr = 3;
    ser::write_u32(&mut payload, &mut wptr, info.old_time_tag)?;
    if wptr >= payload.len() {
        return Err(WireError::UnexpectedEnd);
    }
    payload[wptr] = info.type_key;
    wptr += 1;
    match &info.link {
        ScopeLinkState::None => {}
        ScopeLinkState::Port { open } => {
            payload[wptr] = u8::from(*open);
            wptr += 1;
        }
        ScopeLinkState::Bus {
            addr_space,
            own_rx_addr,
            open_bits,
        } => {
            ser::write_u16(&mut payload, &mut wptr, *addr_space)?;
            ser::write_u16(&mut payload, &mut wptr, *own_rx_addr)?;
            let Some(bytes) = payload.get_mut(wptr..wptr + open_bits.len()) else {
                return Err(WireError::UnexpectedEnd);
            };
            bytes.copy_from_slice(open_bits);
            wptr += open_bits.len();
        }
    }
    ser::write_u16(&mut payload, &mut wptr, info.indice)?;
    ser::write_u16(&mut payload, &mut wptr, info.siblings)?;
    ser::write_u16(&mut payload, &mut wptr, info.children)?;
    ser::write_str(&mut payload, &mut wptr, info.name)?;
    write_reply(request, out, &payload[..wptr])
}

/// Build the root debug response: counters, version, and optionally the
/// latest report string.
pub(crate) fn root_dbg_reply(
    request: &[u8],
    sub: u8,
    id: u8,
    high_water_mark: u32,
    report: &ReportSink,
    out: &mut [u8],
) -> WireResult<usize> {
    let mut payload = [0u8; crate::MAX_PACKET_SIZE];
    payload[0] = Key::Dest.byte();
    payload[1] = keys::RT_DBG_RES;
    payload[2] = id;
    let mut wptr = 3;
    ser::write_u32(&mut payload, &mut wptr, high_water_mark)?;
    ser::write_u32(&mut payload, &mut wptr, report.error_count())?;
    ser::write_u32(&mut payload, &mut wptr, report.debug_count())?;
    ser::write_u32(&mut payload, &mut wptr, VERSION_NUM)?;
    match sub {
        keys::RT_DBG_ERRMSG => ser::write_str(&mut payload, &mut wptr, report.latest_error())?,
        keys::RT_DBG_DBGMSG => ser::write_str(&mut payload, &mut wptr, report.latest_debug())?,
        _ => {}
    }
    write_reply(request, out, &payload[..wptr])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_reply_bytes() {
        let request = [232, 3, 128, 0, 0xF0, 0xE0, 0xC0, 77];
        let mut out = [0u8; 32];
        let len = ping_reply(&request, 77, &mut out).unwrap();
        assert_eq!(&out[..len], &[232, 3, 128, 0, 0xF0, 0xE0, 0xB0, 77]);
    }

    #[test]
    fn test_ping_reply_retraces_trail() {
        let request = [
            232, 3, 128, 0, 0x10, 0x00, 0xF0, 0xE0, 0xC0, 9,
        ];
        let mut out = [0u8; 32];
        let len = ping_reply(&request, 9, &mut out).unwrap();
        assert_eq!(
            &out[..len],
            &[232, 3, 128, 0, 0xF0, 0x10, 0x00, 0xE0, 0xB0, 9]
        );
    }

    #[test]
    fn test_scope_reply_for_a_leaf() {
        let request = [232, 3, 128, 0, 0xF0, 0xE0, 0xA0, 4, 9, 0, 0, 0];
        let info = ScopeInfo {
            old_time_tag: 7,
            type_key: keys::VT_TYPE_ENDPOINT,
            link: ScopeLinkState::None,
            indice: 1,
            siblings: 2,
            children: 0,
            name: "ep_t",
        };
        let mut out = [0u8; 64];
        let len = scope_reply(&request, 4, &info, &mut out).unwrap();
        assert_eq!(
            &out[..len],
            &[
                232, 3, 128, 0, 0xF0, 0xE0, 0x90, 4, // header, marker, dest, scoperes, id
                7, 0, 0, 0, // previous time tag
                keys::VT_TYPE_ENDPOINT,
                1, 0, 2, 0, 0, 0, // indice, siblings, children
                4, 0, b'e', b'p', b'_', b't',
            ]
        );
    }

    #[test]
    fn test_scope_reply_for_a_bus() {
        let request = [232, 3, 128, 0, 0xF0, 0xE0, 0xA0, 1, 0, 0, 0, 0];
        let info = ScopeInfo {
            old_time_tag: 0,
            type_key: keys::VT_TYPE_VBUS,
            link: ScopeLinkState::Bus {
                addr_space: 10,
                own_rx_addr: 3,
                open_bits: vec![0b0000_0011, 0b0000_0001],
            },
            indice: 0,
            siblings: 1,
            children: 0,
            name: "vb_t",
        };
        let mut out = [0u8; 64];
        let len = scope_reply(&request, 1, &info, &mut out).unwrap();
        assert_eq!(
            &out[..len],
            &[
                232, 3, 128, 0, 0xF0, 0xE0, 0x90, 1,
                0, 0, 0, 0,
                keys::VT_TYPE_VBUS,
                10, 0, 3, 0, 0b0000_0011, 0b0000_0001,
                0, 0, 1, 0, 0, 0,
                4, 0, b'v', b'b', b'_', b't',
            ]
        );
    }

    #[test]
    fn test_root_dbg_reply_with_error_string() {
        let mut report = ReportSink::default();
        report.error("boom");
        let request = [232, 3, 128, 0, 0xF0, 0xE0, keys::RT_DBG_ERRMSG, 2];
        let mut out = [0u8; 64];
        let len = root_dbg_reply(&request, keys::RT_DBG_ERRMSG, 2, 5, &report, &mut out).unwrap();
        assert_eq!(
            &out[..len],
            &[
                232, 3, 128, 0, 0xF0, 0xE0, keys::RT_DBG_RES, 2,
                5, 0, 0, 0, // high-water mark
                1, 0, 0, 0, // error count
                0, 0, 0, 0, // debug count
                VERSION_NUM as u8, 0, 0, 0,
                4, 0, b'b', b'o', b'o', b'm',
            ]
        );
    }
}
