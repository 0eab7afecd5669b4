//! Internal transport: resolving tree-walk instructions against the vertex
//! arena and re-parenting packets without moving bytes.
//!
//! Resolution happens in a read-only pass; only when the walk lands on a
//! terminal key *and* the target has hold room do the consumed pairs get
//! reversed and ownership move. A target at quota leaves the packet exactly
//! as it was, to be retried next tick.

use crate::{
    Fabric,
    clock::Clock,
    tick::Verdict,
    vertex::{Vertex, VertexId, VertexKind},
};

use osap_wire::{Key, MAX_PATH_STEPS, WalkContext, read_arg, walk_ptr};

/// A pointer-walk context over the vertex arena.
pub(crate) struct ArenaWalk<'a> {
    vertices: &'a [Vertex],
    pub(crate) at: usize,
}

impl<'a> ArenaWalk<'a> {
    pub(crate) fn new(vertices: &'a [Vertex], at: usize) -> Self {
        Self { vertices, at }
    }
}

impl WalkContext for ArenaWalk<'_> {
    fn indice(&self) -> u16 {
        self.vertices[self.at].indice
    }

    fn bus_rx_addr(&self) -> Option<u16> {
        match &self.vertices[self.at].kind {
            VertexKind::Bus(bus) => Some(bus.link.own_rx_addr()),
            _ => None,
        }
    }

    fn to_sib(&mut self, indice: u16) -> bool {
        let Some(parent) = self.vertices[self.at].parent else {
            return false;
        };
        match self.vertices[parent.index()].children.get(usize::from(indice)) {
            Some(sib) => {
                self.at = sib.index();
                true
            }
            None => false,
        }
    }

    fn to_parent(&mut self) -> bool {
        match self.vertices[self.at].parent {
            Some(parent) => {
                self.at = parent.index();
                true
            }
            None => false,
        }
    }

    fn to_child(&mut self, indice: u16) -> bool {
        match self.vertices[self.at].children.get(usize::from(indice)) {
            Some(child) => {
                self.at = child.index();
                true
            }
            None => false,
        }
    }
}

enum Resolution {
    /// Walk lands on a terminal key at this vertex after `steps` tree hops.
    Terminal { target: usize, steps: usize },
    /// Broken path; packet should be dropped.
    Fault(String),
}

impl<C: Clock> Fabric<C> {
    /// Resolve and execute the tree-walk at the head of a packet's plan.
    ///
    /// Returns [`Verdict::Keep`] both when the packet moved and when the
    /// target is at quota (backpressure); [`Verdict::Release`] only on a
    /// broken path.
    pub(crate) fn internal_transport(&mut self, slot: u16, ptr: usize, now_ms: u32) -> Verdict {
        let Some(owner) = self.pool.packet(slot).vertex else {
            return Verdict::Release;
        };

        let resolution = self.resolve(slot, ptr, owner);
        let (target, steps) = match resolution {
            Resolution::Terminal { target, steps } => (target, steps),
            Resolution::Fault(msg) => {
                self.report.error(msg);
                return Verdict::Release;
            }
        };

        if !self.vertices[target].has_hold_room() {
            // flow controlled; comes back around next tick
            return Verdict::Keep;
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
        match walk_ptr(&mut packet.data[..len], &mut ctx, steps, ptr) {
            Ok(_) => {
                let from = &mut vertices[owner.index()].current_hold;
                *from = from.saturating_sub(1);
                vertices[target].current_hold += 1;
                packet.vertex = Some(VertexId(target as u16));
                packet.arrival_ms = now_ms;
                Verdict::Keep
            }
            Err(err) => {
                report.error(format!("transport walk failed: {err}"));
                Verdict::Release
            }
        }
    }

    fn resolve(&self, slot: u16, ptr: usize, owner: VertexId) -> Resolution {
        let gram = self.pool.gram(slot);
        let mut at = owner.index();
        let mut fwd = ptr + 1;
        let mut steps = 0usize;
        for _ in 0..MAX_PATH_STEPS {
            let Some(&key_byte) = gram.get(fwd) else {
                return Resolution::Fault(format!(
                    "truncated walk at {}",
                    self.vertices[at].name
                ));
            };
            let arg = match read_arg(gram, fwd) {
                Ok(arg) => arg,
                Err(_) => {
                    return Resolution::Fault(format!(
                        "truncated walk at {}",
                        self.vertices[at].name
                    ));
                }
            };
            match Key::from_byte(key_byte) {
                Some(Key::Sib) => {
                    let Some(parent) = self.vertices[at].parent else {
                        return Resolution::Fault(format!(
                            "no parent at {} during sib transport",
                            self.vertices[at].name
                        ));
                    };
                    match self.vertices[parent.index()].children.get(usize::from(arg)) {
                        Some(sib) => at = sib.index(),
                        None => {
                            return Resolution::Fault(format!(
                                "no sibling {arg} at {} during sib transport",
                                self.vertices[at].name
                            ));
                        }
                    }
                }
                Some(Key::Parent) => match self.vertices[at].parent {
                    Some(parent) => at = parent.index(),
                    None => {
                        return Resolution::Fault(format!(
                            "no parent at {} during parent transport",
                            self.vertices[at].name
                        ));
                    }
                },
                Some(Key::Child) => {
                    match self.vertices[at].children.get(usize::from(arg)) {
                        Some(child) => at = child.index(),
                        None => {
                            return Resolution::Fault(format!(
                                "no child {arg} at {} during child transport",
                                self.vertices[at].name
                            ));
                        }
                    }
                }
                Some(
                    Key::Pfwd
                    | Key::Bfwd
                    | Key::Bbrd
                    | Key::Dest
                    | Key::PingReq
                    | Key::ScopeReq
                    | Key::LlEscape,
                ) => {
                    return Resolution::Terminal { target: at, steps };
                }
                _ => {
                    return Resolution::Fault(String::from(
                        "internal transport walk ends at unknown key",
                    ));
                }
            }
            fwd += 2;
            steps += 1;
        }
        Resolution::Fault(String::from(
            "internal transport walk exceeds the step bound",
        ))
    }
}
