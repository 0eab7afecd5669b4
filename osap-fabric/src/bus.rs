//! Bus vertex model/view/control: the broadcast-channel table CRUD.
//!
//! Channel subscriptions are route stubs indexed by channel number; they
//! get spliced into incoming broadcasts by the ingest path, and managed
//! remotely through the MAP/QUERY/SET/RM sub-keys here.

use crate::{MAX_BROADCAST_CHANNELS, keys, report::ReportSink, tick::Verdict, vertex::BusState};

use osap_wire::{Key, Route, ser, write_reply};

/// Handle a DEST-keyed datagram aimed at a bus vertex.
pub(crate) fn dest(
    state: &mut BusState,
    report: &mut ReportSink,
    name: &str,
    request: &[u8],
    ptr: usize,
    out: &mut [u8],
) -> Verdict {
    let mut payload = [0u8; crate::MAX_PACKET_SIZE];
    let (Some(&sub), Some(&id)) = (request.get(ptr + 2), request.get(ptr + 3)) else {
        report.error(format!("truncated bus datagram at {name}"));
        return Verdict::Release;
    };
    match sub {
        keys::VBUS_BROADCAST_MAP_REQ => {
            payload[0] = Key::Dest.byte();
            payload[1] = keys::VBUS_BROADCAST_MAP_RES;
            payload[2] = id;
            payload[3] = MAX_BROADCAST_CHANNELS as u8;
            let mut wptr = 4;
            // presence bitfield, lsb-first, one bit per channel
            for chunk in state.channels.chunks(8) {
                let mut bits = 0u8;
                for (b, channel) in chunk.iter().enumerate() {
                    bits |= u8::from(channel.is_some()) << b;
                }
                payload[wptr] = bits;
                wptr += 1;
            }
            reply(report, name, request, &payload[..wptr], out)
        }
        keys::VBUS_BROADCAST_QUERY_REQ => {
            let Some(&ch) = request.get(ptr + 4) else {
                report.error(format!("truncated broadcast query at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::VBUS_BROADCAST_QUERY_RES;
            payload[2] = id;
            let mut wptr = 3;
            match state.channels.get(usize::from(ch)).and_then(Option::as_ref) {
                Some(route) => {
                    payload[wptr] = 1;
                    wptr += 1;
                    let ok = ser::write_u16(&mut payload, &mut wptr, route.ttl)
                        .and_then(|()| ser::write_u16(&mut payload, &mut wptr, route.seg_size));
                    let path = route.path();
                    if ok.is_err() || wptr + path.len() > payload.len() {
                        report.error(format!("broadcast query reply overflow at {name}"));
                        return Verdict::Release;
                    }
                    payload[wptr..wptr + path.len()].copy_from_slice(path);
                    wptr += path.len();
                }
                None => {
                    payload[wptr] = 0;
                    wptr += 1;
                }
            }
            reply(report, name, request, &payload[..wptr], out)
        }
        keys::VBUS_BROADCAST_SET_REQ => {
            let Some(&ch) = request.get(ptr + 4) else {
                report.error(format!("truncated broadcast set at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::VBUS_BROADCAST_SET_RES;
            payload[2] = id;
            let parsed = ser::read_u16(request, ptr + 5).ok().and_then(|ttl| {
                let seg_size = ser::read_u16(request, ptr + 7).ok()?;
                let path = request.get(ptr + 9..)?;
                Route::from_parts(path, ttl, seg_size).ok()
            });
            match (parsed, usize::from(ch) < state.channels.len()) {
                (Some(route), true) => {
                    if state.channels[usize::from(ch)].is_some() {
                        report.debug(format!("overwriting broadcast channel {ch} at {name}"));
                    }
                    state.channels[usize::from(ch)] = Some(route);
                    payload[3] = 1;
                }
                _ => {
                    report.error(format!("broadcast set refused at {name}"));
                    payload[3] = 0;
                }
            }
            reply(report, name, request, &payload[..4], out)
        }
        keys::VBUS_BROADCAST_RM_REQ => {
            let Some(&ch) = request.get(ptr + 4) else {
                report.error(format!("truncated broadcast rm at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::VBUS_BROADCAST_RM_RES;
            payload[2] = id;
            let occupied = state
                .channels
                .get(usize::from(ch))
                .is_some_and(Option::is_some);
            if occupied {
                state.channels[usize::from(ch)] = None;
                payload[3] = 1;
            } else {
                payload[3] = 0;
            }
            reply(report, name, request, &payload[..4], out)
        }
        _ => {
            report.error(format!("unrecognized bus key {sub} at {name}"));
            Verdict::Release
        }
    }
}

fn reply(
    report: &mut ReportSink,
    name: &str,
    request: &[u8],
    payload: &[u8],
    out: &mut [u8],
) -> Verdict {
    match write_reply(request, out, payload) {
        Ok(len) => Verdict::Reload(len),
        Err(err) => {
            report.error(format!("reply write failed at {name}: {err}"));
            Verdict::Release
        }
    }
}
