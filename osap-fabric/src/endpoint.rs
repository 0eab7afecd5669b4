//! Endpoint vertices: the software leaves of the graph.
//!
//! An endpoint holds a small local datum, a table of outgoing routes with
//! an ack state machine per route, and user callbacks for inbound data and
//! pre-query refresh. Outbound servicing is round-robin so low route
//! indices don't quietly win priority every tick.

use crate::{
    ENDPOINT_MAX_DATA_SIZE, ENDPOINT_MAX_ROUTES, keys, report::ReportSink, tick::Verdict,
};

use osap_wire::{Key, Route, ser, write_reply};

/// What a user callback decided about inbound data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnData {
    /// Copy the payload into the endpoint's store and consume the packet.
    Accept,
    /// Consume the packet without copying.
    Reject,
    /// Not ready; the packet re-arrives next tick.
    Wait,
}

/// Delivery mode of an outgoing route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Fire and forget.
    Ackless,
    /// Await a matching ack, with one bounded resend.
    Acked,
}

impl AckMode {
    pub(crate) fn wire_byte(self) -> u8 {
        match self {
            Self::Acked => keys::EP_ROUTEMODE_ACKED,
            Self::Ackless => keys::EP_ROUTEMODE_ACKLESS,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Self {
        if byte == keys::EP_ROUTEMODE_ACKED {
            Self::Acked
        } else {
            Self::Ackless
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Idle,
    Fresh,
    AwaitingAck,
    /// New data was written while an ack was still outstanding; resend once
    /// the ack lands or its timeout lapses.
    AwaitingAndFresh,
}

pub(crate) struct EndpointRoute {
    pub(crate) route: Route,
    pub(crate) ack_mode: AckMode,
    pub(crate) state: TxState,
    pub(crate) last_tx_ms: u32,
    pub(crate) timeout_ms: u32,
    pub(crate) ack_id: u8,
    /// Transmissions of the current datum; bounds the resend.
    pub(crate) attempts: u8,
}

pub(crate) struct EndpointState {
    pub(crate) data: Vec<u8>,
    pub(crate) on_data: Box<dyn FnMut(&[u8]) -> OnData>,
    pub(crate) before_query: Box<dyn FnMut()>,
    pub(crate) routes: Vec<EndpointRoute>,
    pub(crate) last_route_serviced: usize,
    pub(crate) next_ack_id: u8,
}

impl EndpointState {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            on_data: Box::new(|_| OnData::Accept),
            before_query: Box::new(|| {}),
            routes: Vec::new(),
            last_route_serviced: 0,
            next_ack_id: 77,
        }
    }

    /// Store a new datum and freshen every route.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > ENDPOINT_MAX_DATA_SIZE {
            return false;
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        for route in &mut self.routes {
            route.state = match route.state {
                TxState::AwaitingAck | TxState::AwaitingAndFresh => TxState::AwaitingAndFresh,
                TxState::Idle | TxState::Fresh => TxState::Fresh,
            };
        }
        true
    }

    /// Every route idle; a write now would not clobber an in-flight send.
    pub(crate) fn clear_to_write(&self) -> bool {
        self.routes.iter().all(|r| r.state == TxState::Idle)
    }

    pub(crate) fn add_route(
        &mut self,
        route: Route,
        ack_mode: AckMode,
        timeout_ms: u32,
    ) -> Option<u8> {
        if self.routes.len() >= ENDPOINT_MAX_ROUTES {
            return None;
        }
        let indice = self.routes.len() as u8;
        self.routes.push(EndpointRoute {
            route,
            ack_mode,
            state: TxState::Idle,
            last_tx_ms: 0,
            timeout_ms,
            ack_id: 0,
            attempts: 0,
        });
        Some(indice)
    }

    /// Run ack-timeout transitions for this tick.
    pub(crate) fn step_timeouts(&mut self, now_ms: u32, report: &mut ReportSink, name: &str) {
        for route in &mut self.routes {
            let lapsed = now_ms.wrapping_sub(route.last_tx_ms) >= route.timeout_ms;
            match route.state {
                TxState::AwaitingAck if lapsed => {
                    if route.attempts >= 2 {
                        route.state = TxState::Idle;
                        route.attempts = 0;
                        report.error(format!("ack timed out twice at {name}, giving up"));
                    } else {
                        route.state = TxState::Fresh;
                    }
                }
                TxState::AwaitingAndFresh if lapsed => {
                    route.state = TxState::Fresh;
                }
                _ => {}
            }
        }
    }

    /// Fresh routes in round-robin order, starting past the last one served.
    pub(crate) fn fresh_routes(&self) -> Vec<usize> {
        let count = self.routes.len();
        let mut out = Vec::new();
        for i in 0..count {
            let r = (self.last_route_serviced + 1 + i) % count.max(1);
            if self.routes[r].state == TxState::Fresh {
                out.push(r);
            }
        }
        out
    }

    /// Stamp a route as transmitted; returns the ack id to carry, if any.
    pub(crate) fn mark_sent(&mut self, r: usize, now_ms: u32) -> Option<u8> {
        self.last_route_serviced = r;
        let next_id = self.next_ack_id;
        let route = &mut self.routes[r];
        route.last_tx_ms = now_ms;
        match route.ack_mode {
            AckMode::Ackless => {
                route.state = TxState::Idle;
                route.attempts = 0;
                None
            }
            AckMode::Acked => {
                route.state = TxState::AwaitingAck;
                route.attempts += 1;
                // a resend reuses the outstanding id so the late ack still matches
                if route.attempts == 1 {
                    route.ack_id = next_id;
                    self.next_ack_id = self.next_ack_id.wrapping_add(1);
                }
                Some(self.routes[r].ack_id)
            }
        }
    }

    /// Match an incoming ack to a route. Stale and duplicate acks are
    /// ignored silently.
    pub(crate) fn on_ack(&mut self, id: u8) {
        for route in &mut self.routes {
            if route.ack_id == id {
                match route.state {
                    TxState::AwaitingAck => {
                        route.state = TxState::Idle;
                        route.attempts = 0;
                    }
                    TxState::AwaitingAndFresh => {
                        route.state = TxState::Fresh;
                        route.attempts = 0;
                    }
                    TxState::Idle | TxState::Fresh => {}
                }
                return;
            }
        }
    }
}

/// Handle a DEST-keyed datagram aimed at an endpoint.
///
/// `ptr` is the marker offset; the endpoint sub-key sits two past it.
/// Replies are written into `out` and reloaded over the request's slot.
pub(crate) fn dest(
    state: &mut EndpointState,
    report: &mut ReportSink,
    name: &str,
    request: &[u8],
    ptr: usize,
    out: &mut [u8],
) -> Verdict {
    let mut payload = [0u8; crate::MAX_PACKET_SIZE];
    let Some(&sub) = request.get(ptr + 2) else {
        report.error(format!("truncated endpoint datagram at {name}"));
        return Verdict::Release;
    };
    match sub {
        keys::EP_SS_ACKLESS => {
            let Some(rx) = request.get(ptr + 3..) else {
                report.error(format!("truncated ackless write at {name}"));
                return Verdict::Release;
            };
            match (state.on_data)(rx) {
                OnData::Wait => Verdict::KeepRestamp,
                OnData::Accept => {
                    if rx.len() <= ENDPOINT_MAX_DATA_SIZE {
                        state.data.clear();
                        state.data.extend_from_slice(rx);
                    } else {
                        report.error(format!("oversized write to {name} dropped"));
                    }
                    Verdict::Release
                }
                OnData::Reject => Verdict::Release,
            }
        }
        keys::EP_SS_ACKED => {
            let (Some(&id), Some(rx)) = (request.get(ptr + 3), request.get(ptr + 4..)) else {
                report.error(format!("truncated acked write at {name}"));
                return Verdict::Release;
            };
            match (state.on_data)(rx) {
                OnData::Wait => Verdict::KeepRestamp,
                accept_or_reject => {
                    if accept_or_reject == OnData::Accept {
                        if rx.len() <= ENDPOINT_MAX_DATA_SIZE {
                            state.data.clear();
                            state.data.extend_from_slice(rx);
                        } else {
                            report.error(format!("oversized write to {name} dropped"));
                        }
                    }
                    let ack = [Key::Dest.byte(), keys::EP_SS_ACK, id];
                    reply(report, name, request, &ack, out)
                }
            }
        }
        keys::EP_SS_ACK => {
            if let Some(&id) = request.get(ptr + 3) {
                state.on_ack(id);
            }
            Verdict::Release
        }
        keys::EP_QUERY => {
            let Some(&id) = request.get(ptr + 3) else {
                report.error(format!("truncated query at {name}"));
                return Verdict::Release;
            };
            (state.before_query)();
            payload[0] = Key::Dest.byte();
            payload[1] = keys::EP_QUERY_RESP;
            payload[2] = id;
            let end = 3 + state.data.len();
            payload[3..end].copy_from_slice(&state.data);
            reply(report, name, request, &payload[..end], out)
        }
        keys::EP_ROUTE_QUERY_REQ => {
            let (Some(&id), Ok(r)) = (request.get(ptr + 3), ser::read_u16(request, ptr + 4))
            else {
                report.error(format!("truncated route query at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::EP_ROUTE_QUERY_RES;
            payload[2] = id;
            let mut wptr = 3;
            if let Some(route) = state.routes.get(usize::from(r)) {
                payload[wptr] = route.ack_mode.wire_byte();
                wptr += 1;
                let ok = ser::write_u16(&mut payload, &mut wptr, route.route.ttl)
                    .and_then(|()| ser::write_u16(&mut payload, &mut wptr, route.route.seg_size));
                let path = route.route.path();
                if ok.is_err() || wptr + path.len() > payload.len() {
                    report.error(format!("route query reply overflow at {name}"));
                    return Verdict::Release;
                }
                payload[wptr..wptr + path.len()].copy_from_slice(path);
                wptr += path.len();
            } else {
                payload[wptr] = 0;
                wptr += 1;
            }
            reply(report, name, request, &payload[..wptr], out)
        }
        keys::EP_ROUTE_SET_REQ => {
            let (Some(&id), Some(&mode)) = (request.get(ptr + 3), request.get(ptr + 4)) else {
                report.error(format!("truncated route set at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::EP_ROUTE_SET_RES;
            payload[2] = id;
            let parsed = ser::read_u16(request, ptr + 5).ok().and_then(|ttl| {
                let seg_size = ser::read_u16(request, ptr + 7).ok()?;
                let path = request.get(ptr + 9..)?;
                Route::from_parts(path, ttl, seg_size).ok()
            });
            let indice = parsed.and_then(|route| {
                state.add_route(route, AckMode::from_wire(mode), 1000)
            });
            match indice {
                Some(indice) => {
                    payload[3] = 1;
                    payload[4] = indice;
                }
                None => {
                    report.error(format!("route set refused at {name}"));
                    payload[3] = 0;
                    payload[4] = 0;
                }
            }
            reply(report, name, request, &payload[..5], out)
        }
        keys::EP_ROUTE_RM_REQ => {
            let (Some(&id), Some(&r)) = (request.get(ptr + 3), request.get(ptr + 4)) else {
                report.error(format!("truncated route rm at {name}"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::EP_ROUTE_RM_RES;
            payload[2] = id;
            if usize::from(r) < state.routes.len() {
                state.routes.remove(usize::from(r));
                payload[3] = 1;
            } else {
                payload[3] = 0;
            }
            reply(report, name, request, &payload[..4], out)
        }
        _ => {
            report.error(format!("unrecognized endpoint key {sub} at {name}"));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn gram(tail: &[u8]) -> Vec<u8> {
        let mut g = vec![232, 3, 128, 0, 0xF0];
        g.extend_from_slice(tail);
        g
    }

    #[test]
    fn test_write_freshens_routes() {
        let mut state = EndpointState::new();
        state
            .add_route(Route::new().sib(1), AckMode::Acked, 1000)
            .unwrap();
        assert!(state.clear_to_write());
        assert!(state.write(&[1, 2, 3]));
        assert_eq!(state.routes[0].state, TxState::Fresh);
        assert!(!state.clear_to_write());
    }

    #[test]
    fn test_write_while_awaiting_defers_freshness() {
        let mut state = EndpointState::new();
        state
            .add_route(Route::new().sib(1), AckMode::Acked, 1000)
            .unwrap();
        state.write(&[1]);
        let fresh = state.fresh_routes();
        let id = state.mark_sent(fresh[0], 10).unwrap();
        assert_eq!(state.routes[0].state, TxState::AwaitingAck);
        state.write(&[2]);
        assert_eq!(state.routes[0].state, TxState::AwaitingAndFresh);
        state.on_ack(id);
        assert_eq!(state.routes[0].state, TxState::Fresh);
    }

    #[test]
    fn test_ack_timeout_resends_once_then_idles() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        state
            .add_route(Route::new().sib(1), AckMode::Acked, 100)
            .unwrap();
        state.write(&[9]);
        let r = state.fresh_routes()[0];
        state.mark_sent(r, 0);
        state.step_timeouts(50, &mut report, "ep_t");
        assert_eq!(state.routes[0].state, TxState::AwaitingAck);
        state.step_timeouts(100, &mut report, "ep_t");
        assert_eq!(state.routes[0].state, TxState::Fresh);
        state.mark_sent(r, 100);
        state.step_timeouts(200, &mut report, "ep_t");
        assert_eq!(state.routes[0].state, TxState::Idle);
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn test_resend_reuses_ack_id() {
        let mut state = EndpointState::new();
        state
            .add_route(Route::new().sib(1), AckMode::Acked, 100)
            .unwrap();
        state.write(&[9]);
        let first = state.mark_sent(0, 0).unwrap();
        state.routes[0].state = TxState::Fresh;
        let second = state.mark_sent(0, 100).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut state = EndpointState::new();
        state
            .add_route(Route::new().sib(1), AckMode::Acked, 100)
            .unwrap();
        state.write(&[9]);
        state.mark_sent(0, 0);
        state.on_ack(250);
        assert_eq!(state.routes[0].state, TxState::AwaitingAck);
    }

    #[test]
    fn test_dest_ackless_accept_copies_payload() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        let request = gram(&[0xE0, keys::EP_SS_ACKLESS, 10, 20, 30]);
        let mut out = [0u8; 128];
        let verdict = dest(&mut state, &mut report, "ep_t", &request, 4, &mut out);
        assert_eq!(verdict, Verdict::Release);
        assert_eq!(state.data, vec![10, 20, 30]);
    }

    #[test]
    fn test_dest_ackless_wait_retries() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        state.on_data = Box::new(|_| OnData::Wait);
        let request = gram(&[0xE0, keys::EP_SS_ACKLESS, 10]);
        let mut out = [0u8; 128];
        let verdict = dest(&mut state, &mut report, "ep_t", &request, 4, &mut out);
        assert_eq!(verdict, Verdict::KeepRestamp);
        assert!(state.data.is_empty());
    }

    #[test]
    fn test_dest_acked_write_builds_ack_reply() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        let request = gram(&[0xE0, keys::EP_SS_ACKED, 42, 7, 8]);
        let mut out = [0u8; 128];
        let verdict = dest(&mut state, &mut report, "ep_t", &request, 4, &mut out);
        let Verdict::Reload(len) = verdict else {
            panic!("expected a reloaded ack");
        };
        assert_eq!(
            &out[..len],
            &[232, 3, 128, 0, 0xF0, 0xE0, keys::EP_SS_ACK, 42]
        );
        assert_eq!(state.data, vec![7, 8]);
    }

    #[test]
    fn test_dest_query_replies_with_datum() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        state.write(&[5, 6]);
        let request = gram(&[0xE0, keys::EP_QUERY, 3]);
        let mut out = [0u8; 128];
        let Verdict::Reload(len) = dest(&mut state, &mut report, "ep_t", &request, 4, &mut out)
        else {
            panic!("expected a query response");
        };
        assert_eq!(
            &out[..len],
            &[232, 3, 128, 0, 0xF0, 0xE0, keys::EP_QUERY_RESP, 3, 5, 6]
        );
    }

    #[test]
    fn test_dest_route_set_then_query_then_rm() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        let mut out = [0u8; 128];

        // set: mode, ttl=500, seg=128, path = marker + sib(1)
        let mut set = gram(&[0xE0, keys::EP_ROUTE_SET_REQ, 1, keys::EP_ROUTEMODE_ACKED]);
        set.extend_from_slice(&[244, 1, 128, 0, 0xF0, 0x10, 0x01]);
        let Verdict::Reload(len) = dest(&mut state, &mut report, "ep_t", &set, 4, &mut out)
        else {
            panic!("expected a set response");
        };
        assert_eq!(
            &out[..len],
            &[232, 3, 128, 0, 0xF0, 0xE0, keys::EP_ROUTE_SET_RES, 1, 1, 0]
        );
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.routes[0].route.ttl, 500);

        // query it back
        let query = gram(&[0xE0, keys::EP_ROUTE_QUERY_REQ, 2, 0, 0]);
        let Verdict::Reload(len) = dest(&mut state, &mut report, "ep_t", &query, 4, &mut out)
        else {
            panic!("expected a route query response");
        };
        assert_eq!(
            &out[..len],
            &[
                232, 3, 128, 0, 0xF0, 0xE0, keys::EP_ROUTE_QUERY_RES, 2,
                keys::EP_ROUTEMODE_ACKED, 244, 1, 128, 0, 0xF0, 0x10, 0x01
            ]
        );

        // remove it
        let rm = gram(&[0xE0, keys::EP_ROUTE_RM_REQ, 3, 0]);
        let Verdict::Reload(len) = dest(&mut state, &mut report, "ep_t", &rm, 4, &mut out)
        else {
            panic!("expected a route rm response");
        };
        assert_eq!(
            &out[..len],
            &[232, 3, 128, 0, 0xF0, 0xE0, keys::EP_ROUTE_RM_RES, 3, 1]
        );
        assert!(state.routes.is_empty());
    }

    #[test]
    fn test_dest_unknown_key_is_released() {
        let mut report = ReportSink::default();
        let mut state = EndpointState::new();
        let request = gram(&[0xE0, 250, 0]);
        let mut out = [0u8; 128];
        assert_eq!(
            dest(&mut state, &mut report, "ep_t", &request, 4, &mut out),
            Verdict::Release
        );
        assert_eq!(report.error_count(), 1);
    }
}
