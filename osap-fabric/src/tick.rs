//! The per-tick transport loop.
//!
//! One tick: run every vertex's loop depth-first (endpoints emit, adapters
//! pump their links and ingest), collect queued slots, expire deadlines,
//! sort the survivors by ascending deadline, then dispatch each on the key
//! sitting just past its pointer marker. Packets the tick cannot place,
//! because a link is not clear to send or a target vertex is at quota,
//! simply stay queued and come back around.

use crate::{
    Fabric, MAX_ITEMS_PER_LOOP, MAX_PACKET_SIZE, bus, endpoint,
    clock::Clock,
    endpoint::TxState,
    error::FabricError,
    handlers::{self, ScopeInfo, ScopeLinkState},
    keys,
    link::IngestOutcome,
    rpc,
    transport::ArenaWalk,
    vertex::{Vertex, VertexId, VertexKind},
};

use osap_wire::{Key, find_ptr, read_arg, ser, walk_ptr, write_datagram};

/// What a handler decided about the packet it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Leave it queued; retried next tick.
    Keep,
    /// Leave it queued with a fresh arrival stamp.
    KeepRestamp,
    /// Done with it; return the slot to the pool.
    Release,
    /// Replace the slot's bytes with this many from the scratch reply.
    Reload(usize),
}

impl<C: Clock> Fabric<C> {
    /// One pass of the cooperative scheduler.
    ///
    /// Fatal only when the loop property breaks: more than
    /// [`MAX_ITEMS_PER_LOOP`]` - 2` packets queued in a single tick.
    pub fn tick(&mut self) -> Result<(), FabricError> {
        let now = self.clock.now_ms();

        for vid in self.dfs_order() {
            self.vertex_loop(vid, now);
        }

        let handles = self.pool.collect(MAX_ITEMS_PER_LOOP);
        if handles.len() > MAX_ITEMS_PER_LOOP - 2 {
            return Err(FabricError::LoopOverrun {
                queued: handles.len(),
            });
        }
        self.high_water_mark = self.high_water_mark.max(handles.len() as u32);

        let mut live = Vec::with_capacity(handles.len());
        for slot in handles {
            let deadline = {
                let packet = self.pool.packet(slot);
                let gram = &packet.data[..usize::from(packet.len)];
                ser::read_u16(gram, 0).ok().map(|ttl| {
                    let age = i64::from(now.wrapping_sub(packet.arrival_ms));
                    (i64::from(ttl) - age).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
                })
            };
            let Some(deadline) = deadline else {
                let name = self.owner_name(slot);
                self.report.error(format!("headerless packet at {name}"));
                self.release_slot(slot);
                continue;
            };
            self.pool.packet_mut(slot).deadline = deadline;
            if deadline < 0 {
                let name = self.owner_name(slot);
                self.report
                    .error(format!("packet at {name} timed out, {deadline}ms past its ttl"));
                self.release_slot(slot);
                continue;
            }
            live.push(slot);
        }

        // earliest deadline first; the sort is stable so ties stay FIFO
        live.sort_by_key(|&slot| self.pool.packet(slot).deadline);

        for slot in live {
            self.dispatch(slot, now);
        }
        Ok(())
    }

    /// Offer a broadcast frame to a bus vertex.
    ///
    /// When the frame's channel is subscribed, the channel route's body is
    /// spliced in just past the marker and the result queued at the bus.
    pub fn ingest_broadcast(
        &mut self,
        bus: VertexId,
        gram: &[u8],
        channel: u16,
    ) -> IngestOutcome {
        let now = self.clock.now_ms();
        let Self {
            pool,
            vertices,
            report,
            ..
        } = self;
        let Some(vertex) = vertices.get_mut(bus.index()) else {
            return IngestOutcome::Empty;
        };
        let VertexKind::Bus(state) = &vertex.kind else {
            report.error("broadcast ingest at a non-bus vertex".to_string());
            return IngestOutcome::Empty;
        };
        let Some(route) = state
            .channels
            .get(usize::from(channel))
            .and_then(Option::as_ref)
        else {
            return IngestOutcome::Empty;
        };
        let Ok(ptr) = find_ptr(gram) else {
            report.error("no marker found during broadcast ingest".to_string());
            return IngestOutcome::Empty;
        };
        let path = route.path();
        let new_len = gram.len() + path.len() - 1;
        if new_len > MAX_PACKET_SIZE {
            report.error("datagram plus channel route exceeds the packet bound".to_string());
            return IngestOutcome::Empty;
        }
        // the channel path leads with its own marker byte; splice past it
        let mut spliced = [0u8; MAX_PACKET_SIZE];
        spliced[..=ptr].copy_from_slice(&gram[..=ptr]);
        spliced[ptr + 1..ptr + path.len()].copy_from_slice(&path[1..]);
        spliced[ptr + path.len()..new_len].copy_from_slice(&gram[ptr + 1..]);
        let Some(slot) = pool.request(vertex, bus) else {
            return IngestOutcome::Retry;
        };
        pool.load(slot, &spliced[..new_len], now);
        IngestOutcome::Accepted
    }

    pub(crate) fn release_slot(&mut self, slot: u16) {
        let Self {
            pool, vertices, ..
        } = self;
        pool.release(slot, vertices);
    }

    fn owner_name(&self, slot: u16) -> String {
        self.pool
            .packet(slot)
            .vertex
            .map_or_else(|| String::from("<free>"), |v| {
                self.vertices[v.index()].name.clone()
            })
    }

    fn dfs_order(&self) -> Vec<VertexId> {
        let mut order = Vec::with_capacity(self.vertices.len());
        let mut stack = vec![self.root()];
        while let Some(vid) = stack.pop() {
            order.push(vid);
            for &child in self.vertices[vid.index()].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    fn vertex_loop(&mut self, vid: VertexId, now: u32) {
        match self.vertices[vid.index()].type_key() {
            keys::VT_TYPE_ENDPOINT => self.endpoint_loop(vid, now),
            keys::VT_TYPE_VPORT => self.port_loop(vid, now),
            keys::VT_TYPE_VBUS => self.bus_loop(vid, now),
            keys::VT_TYPE_GENERIC => {
                let VertexKind::Generic { on_tick } = &mut self.vertices[vid.index()].kind
                else {
                    return;
                };
                if let Some(hook) = on_tick {
                    hook(now);
                }
            }
            _ => {}
        }
    }

    /// Service an endpoint's route table: timeouts, then one outgoing
    /// datagram per fresh route while the pool allows.
    fn endpoint_loop(&mut self, vid: VertexId, now: u32) {
        let fresh = {
            let Self {
                vertices, report, ..
            } = self;
            let vertex = &mut vertices[vid.index()];
            let Vertex { kind, name, .. } = vertex;
            let VertexKind::Endpoint(state) = kind else {
                return;
            };
            state.step_timeouts(now, report, name);
            state.fresh_routes()
        };
        for r in fresh {
            let can_request = {
                let Self { pool, vertices, .. } = self;
                pool.can_request(&vertices[vid.index()])
            };
            if !can_request {
                break;
            }
            let mut gram = [0u8; MAX_PACKET_SIZE];
            let built: Option<usize> = {
                let Self {
                    vertices, report, ..
                } = self;
                let vertex = &mut vertices[vid.index()];
                let Vertex { kind, name, .. } = vertex;
                let VertexKind::Endpoint(state) = kind else {
                    break;
                };
                let ack_id = state.mark_sent(r, now);
                let mut payload = [0u8; MAX_PACKET_SIZE];
                payload[0] = Key::Dest.byte();
                let mut wptr = 1;
                match ack_id {
                    None => {
                        payload[wptr] = keys::EP_SS_ACKLESS;
                        wptr += 1;
                    }
                    Some(id) => {
                        payload[wptr] = keys::EP_SS_ACKED;
                        payload[wptr + 1] = id;
                        wptr += 2;
                    }
                }
                let data_len = state.data.len();
                payload[wptr..wptr + data_len].copy_from_slice(&state.data);
                wptr += data_len;
                let route = state.routes[r].route.clone();
                match write_datagram(&mut gram, &route, &payload[..wptr]) {
                    Ok(len) => Some(len),
                    Err(err) => {
                        report.error(format!("outgoing datagram at {name} refused: {err}"));
                        state.routes[r].state = TxState::Idle;
                        None
                    }
                }
            };
            if let Some(len) = built {
                let Self { pool, vertices, .. } = self;
                if let Some(slot) = pool.request(&mut vertices[vid.index()], vid) {
                    pool.load(slot, &gram[..len], now);
                }
            }
        }
    }

    /// Pump a port's link and take its inbound datagrams into the pool.
    fn port_loop(&mut self, vid: VertexId, now: u32) {
        {
            let VertexKind::Port { link } = &mut self.vertices[vid.index()].kind else {
                return;
            };
            link.tick(now);
        }
        loop {
            let Self { pool, vertices, .. } = self;
            let vertex = &mut vertices[vid.index()];
            let hold_room = vertex.has_hold_room();
            let free_slot = pool.has_free_slot();
            let VertexKind::Port { link } = &mut vertex.kind else {
                return;
            };
            if !link.inbound_ready() {
                break;
            }
            if !(hold_room && free_slot) {
                // adapter keeps the frame (and withholds its ack) until we
                // have room
                break;
            }
            let mut scratch = [0u8; MAX_PACKET_SIZE];
            let Some(len) = link.take_inbound(&mut scratch) else {
                break;
            };
            let Some(slot) = pool.request(vertex, vid) else {
                break;
            };
            pool.load(slot, &scratch[..usize::from(len)], now);
        }
    }

    /// Pump a bus's link: addressed inbound, then broadcast ingest.
    fn bus_loop(&mut self, vid: VertexId, now: u32) {
        {
            let VertexKind::Bus(state) = &mut self.vertices[vid.index()].kind else {
                return;
            };
            state.link.tick(now);
        }
        loop {
            let Self { pool, vertices, .. } = self;
            let vertex = &mut vertices[vid.index()];
            let hold_room = vertex.has_hold_room();
            let free_slot = pool.has_free_slot();
            let VertexKind::Bus(state) = &mut vertex.kind else {
                return;
            };
            if !state.link.inbound_ready() {
                break;
            }
            if !(hold_room && free_slot) {
                break;
            }
            let mut scratch = [0u8; MAX_PACKET_SIZE];
            let Some(len) = state.link.take_inbound(&mut scratch) else {
                break;
            };
            let Some(slot) = pool.request(vertex, vid) else {
                break;
            };
            pool.load(slot, &scratch[..usize::from(len)], now);
        }
        loop {
            let (frame, len, channel) = {
                let Self { pool, vertices, .. } = self;
                let vertex = &mut vertices[vid.index()];
                let hold_room = vertex.has_hold_room();
                let free_slot = pool.has_free_slot();
                let VertexKind::Bus(state) = &mut vertex.kind else {
                    return;
                };
                let Some(channel) = state.link.broadcast_ready() else {
                    break;
                };
                let subscribed = state
                    .channels
                    .get(usize::from(channel))
                    .is_some_and(Option::is_some);
                if !subscribed {
                    state.link.drop_broadcast();
                    continue;
                }
                if !(hold_room && free_slot) {
                    // leave it with the adapter; retried next tick
                    break;
                }
                let mut scratch = [0u8; MAX_PACKET_SIZE];
                let Some(len) = state.link.take_broadcast(&mut scratch) else {
                    break;
                };
                (scratch, len, channel)
            };
            if self.ingest_broadcast(vid, &frame[..usize::from(len)], channel)
                == IngestOutcome::Retry
            {
                self.report
                    .error("broadcast ingest lost a frame to a full pool".to_string());
            }
        }
    }

    /// Serve one queued packet by the key just past its marker.
    fn dispatch(&mut self, slot: u16, now: u32) {
        let Some(owner) = self.pool.packet(slot).vertex else {
            return;
        };
        let ptr = match find_ptr(self.pool.gram(slot)) {
            Ok(ptr) => ptr,
            Err(err) => {
                let name = self.owner_name(slot);
                self.report
                    .error(format!("packet at {name} has a broken instruction region: {err}"));
                self.release_slot(slot);
                return;
            }
        };
        let Some(&key_byte) = self.pool.gram(slot).get(ptr + 1) else {
            let name = self.owner_name(slot);
            self.report.error(format!("packet at {name} ends at its marker"));
            self.release_slot(slot);
            return;
        };
        match Key::from_byte(key_byte) {
            Some(Key::Dest) => self.dispatch_dest(slot, ptr, owner, now),
            Some(Key::PingReq) => self.ping(slot, ptr + 2, now),
            Some(Key::ScopeReq) => self.scope(slot, ptr + 2, owner, now),
            Some(Key::Sib | Key::Parent | Key::Child) => {
                if self.internal_transport(slot, ptr, now) == Verdict::Release {
                    self.release_slot(slot);
                }
            }
            Some(Key::Pfwd) => self.port_forward(slot, ptr, owner),
            Some(Key::Bfwd) => self.bus_forward(slot, ptr, owner, false),
            Some(Key::Bbrd) => self.bus_forward(slot, ptr, owner, true),
            Some(Key::PingRes | Key::ScopeRes) => {
                let name = self.owner_name(slot);
                self.report
                    .error(format!("response issued to {name}, not handled in-device"));
                self.release_slot(slot);
            }
            Some(Key::LlEscape) => {
                self.report
                    .error("link escape aimed in-device, dumping".to_string());
                self.release_slot(slot);
            }
            Some(Key::Ptr) | None => {
                let name = self.owner_name(slot);
                self.report
                    .error(format!("unrecognized instruction {key_byte:#04x} at {name}"));
                self.release_slot(slot);
            }
        }
    }

    /// A DEST at this vertex: ping and scope are canned, everything else
    /// goes to the kind's handler.
    fn dispatch_dest(&mut self, slot: u16, ptr: usize, owner: VertexId, now: u32) {
        let Some(&sub) = self.pool.gram(slot).get(ptr + 2) else {
            let name = self.owner_name(slot);
            self.report.error(format!("packet at {name} ends at DEST"));
            self.release_slot(slot);
            return;
        };
        if sub == Key::PingReq.byte() {
            self.ping(slot, ptr + 3, now);
        } else if sub == Key::ScopeReq.byte() {
            self.scope(slot, ptr + 3, owner, now);
        } else if sub == Key::PingRes.byte() || sub == Key::ScopeRes.byte() {
            let name = self.owner_name(slot);
            self.report
                .error(format!("response issued to {name}, not handled in-device"));
            self.release_slot(slot);
        } else {
            self.dest_handler(slot, ptr, owner, now);
        }
    }

    /// Reply in place to a ping; `id_at` is the request id's offset.
    fn ping(&mut self, slot: u16, id_at: usize, now: u32) {
        let Self {
            pool,
            vertices,
            report,
            ..
        } = self;
        let gram = pool.gram(slot);
        let Some(&id) = gram.get(id_at) else {
            report.error("truncated ping request".to_string());
            pool.release(slot, vertices);
            return;
        };
        let mut out = [0u8; MAX_PACKET_SIZE];
        match handlers::ping_reply(gram, id, &mut out) {
            Ok(len) => {
                pool.load(slot, &out[..len], now);
            }
            Err(err) => {
                report.error(format!("ping reply failed: {err}"));
                pool.release(slot, vertices);
            }
        }
    }

    /// Reply in place to a scope request and take its new time tag.
    fn scope(&mut self, slot: u16, id_at: usize, owner: VertexId, now: u32) {
        let Self {
            pool,
            vertices,
            report,
            ..
        } = self;
        let gram = pool.gram(slot);
        let Some(&id) = gram.get(id_at) else {
            report.error("truncated scope request".to_string());
            pool.release(slot, vertices);
            return;
        };
        let new_tag = ser::read_u32(gram, id_at + 1).unwrap_or(0);
        let vertex = &vertices[owner.index()];
        let link = match &vertex.kind {
            VertexKind::Port { link } => ScopeLinkState::Port { open: link.is_open() },
            VertexKind::Bus(state) => {
                let addr_space = state.link.addr_space_size();
                let mut open_bits = Vec::new();
                let mut addr = 0u16;
                // bounded so the trailing name section always fits
                while addr < addr_space && open_bits.len() < 16 {
                    let mut bits = 0u8;
                    for b in 0..8 {
                        if addr >= addr_space {
                            break;
                        }
                        bits |= u8::from(state.link.is_open(addr)) << b;
                        addr += 1;
                    }
                    open_bits.push(bits);
                }
                ScopeLinkState::Bus {
                    addr_space,
                    own_rx_addr: state.link.own_rx_addr(),
                    open_bits,
                }
            }
            _ => ScopeLinkState::None,
        };
        let siblings = vertex
            .parent
            .map_or(0, |p| vertices[p.index()].children.len() as u16);
        let info = ScopeInfo {
            old_time_tag: vertex.scope_time_tag,
            type_key: vertex.type_key(),
            link,
            indice: vertex.indice,
            siblings,
            children: vertex.children.len() as u16,
            name: &vertex.name,
        };
        let mut out = [0u8; MAX_PACKET_SIZE];
        let result = handlers::scope_reply(gram, id, &info, &mut out);
        match result {
            Ok(len) => {
                vertices[owner.index()].scope_time_tag = new_tag;
                pool.load(slot, &out[..len], now);
            }
            Err(err) => {
                report.error(format!("scope reply failed: {err}"));
                pool.release(slot, vertices);
            }
        }
    }

    /// Route a DEST sub-key to the owning vertex's handler and apply its
    /// verdict.
    fn dest_handler(&mut self, slot: u16, ptr: usize, owner: VertexId, now: u32) {
        let Self {
            pool,
            vertices,
            report,
            high_water_mark,
            ..
        } = self;
        let request = pool.gram(slot);
        let mut out = [0u8; MAX_PACKET_SIZE];
        let vertex = &mut vertices[owner.index()];
        let Vertex { kind, name, .. } = vertex;
        let verdict = match kind {
            VertexKind::Endpoint(state) => {
                endpoint::dest(state, report, name, request, ptr, &mut out)
            }
            VertexKind::Rpc(state) => rpc::dest(state, report, name, request, ptr, &mut out),
            VertexKind::Bus(state) => bus::dest(state, report, name, request, ptr, &mut out),
            VertexKind::Root => {
                let sub = request[ptr + 2];
                match (sub, request.get(ptr + 3)) {
                    (
                        keys::RT_DBG_STAT | keys::RT_DBG_ERRMSG | keys::RT_DBG_DBGMSG,
                        Some(&id),
                    ) => match handlers::root_dbg_reply(
                        request,
                        sub,
                        id,
                        *high_water_mark,
                        report,
                        &mut out,
                    ) {
                        Ok(len) => Verdict::Reload(len),
                        Err(err) => {
                            report.error(format!("root debug reply failed: {err}"));
                            Verdict::Release
                        }
                    },
                    _ => {
                        report.error(format!("unrecognized key {sub} at the root"));
                        Verdict::Release
                    }
                }
            }
            VertexKind::Generic { .. } | VertexKind::Port { .. } => {
                report.debug(format!("generic dest handler at {name}"));
                Verdict::Release
            }
        };
        match verdict {
            Verdict::Keep => {}
            Verdict::KeepRestamp => pool.packet_mut(slot).arrival_ms = now,
            Verdict::Release => pool.release(slot, vertices),
            Verdict::Reload(len) => {
                pool.load(slot, &out[..len], now);
            }
        }
    }

    /// PFWD at a port: gated on clear-to-send, one reversing step, emit,
    /// release.
    fn port_forward(&mut self, slot: u16, ptr: usize, owner: VertexId) {
        if !matches!(
            self.vertices[owner.index()].kind,
            VertexKind::Port { .. }
        ) {
            let name = self.owner_name(slot);
            self.report.error(format!("pfwd to non-port {name}"));
            self.release_slot(slot);
            return;
        }
        let clear = {
            let VertexKind::Port { link } = &self.vertices[owner.index()].kind else {
                return;
            };
            link.cts()
        };
        if !clear {
            // flow controlled; returns here next tick
            return;
        }
        let Self {
            pool,
            vertices,
            report,
            ..
        } = self;
        let packet = pool.packet_mut(slot);
        let len = usize::from(packet.len);
        let mut ctx = ArenaWalk::new(vertices, owner.index());
        match walk_ptr(&mut packet.data[..len], &mut ctx, 1, ptr) {
            Ok(_) => {
                let VertexKind::Port { link } = &mut vertices[owner.index()].kind else {
                    return;
                };
                link.send(&packet.data[..len]);
            }
            Err(err) => report.error(format!("pfwd fails for a bad walk: {err}")),
        }
        pool.release(slot, vertices);
    }

    /// BFWD/BBRD at a bus: gated on `cts(addr)`/`ctb(channel)`, one
    /// reversing step, emit, release.
    fn bus_forward(&mut self, slot: u16, ptr: usize, owner: VertexId, broadcast: bool) {
        if !matches!(self.vertices[owner.index()].kind, VertexKind::Bus(_)) {
            let name = self.owner_name(slot);
            self.report.error(format!("bus forward to non-bus {name}"));
            self.release_slot(slot);
            return;
        }
        let Ok(arg) = read_arg(self.pool.gram(slot), ptr + 1) else {
            self.report.error("truncated bus forward".to_string());
            self.release_slot(slot);
            return;
        };
        let clear = {
            let VertexKind::Bus(state) = &self.vertices[owner.index()].kind else {
                return;
            };
            if broadcast {
                state.link.ctb(arg)
            } else {
                state.link.cts(arg)
            }
        };
        if !clear {
            return;
        }
        let Self {
            pool,
            vertices,
            report,
            ..
        } = self;
        let packet = pool.packet_mut(slot);
        let len = usize::from(packet.len);
        let mut ctx = ArenaWalk::new(vertices, owner.index());
        match walk_ptr(&mut packet.data[..len], &mut ctx, 1, ptr) {
            Ok(_) => {
                let VertexKind::Bus(state) = &mut vertices[owner.index()].kind else {
                    return;
                };
                if broadcast {
                    state.link.broadcast(&packet.data[..len], arg);
                } else {
                    state.link.send(&packet.data[..len], arg);
                }
            }
            Err(err) => report.error(format!("bus forward fails for a bad walk: {err}")),
        }
        pool.release(slot, vertices);
    }
}
