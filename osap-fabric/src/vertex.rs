//! The vertex arena: addressable nodes of the intra-device tree.
//!
//! Vertices live in a `Vec` keyed by [`VertexId`]; parent and child edges
//! are ids, never references, so packets and vertices alias freely without
//! ownership cycles. Capability is a tagged variant on the kind: ports and
//! buses carry their boxed link adapters, endpoints and RPC stubs their
//! software state.

use crate::{
    MAX_CHILDREN, NAME_MAX_LEN,
    endpoint::EndpointState,
    keys,
    link::{BusLink, PortLink},
    rpc::RpcState,
};

use osap_wire::Route;

/// Stable index of a vertex within its fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexId(pub(crate) u16);

impl VertexId {
    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Link-layer state a bus vertex carries beside its adapter.
pub(crate) struct BusState {
    pub(crate) link: Box<dyn BusLink>,
    /// Broadcast subscriptions, indexed by channel.
    pub(crate) channels: Vec<Option<Route>>,
}

/// Per-kind vertex state.
pub(crate) enum VertexKind {
    Root,
    Generic {
        /// User hook run each tick, handed the current time.
        on_tick: Option<Box<dyn FnMut(u32)>>,
    },
    Endpoint(EndpointState),
    Rpc(RpcState),
    Port {
        link: Box<dyn PortLink>,
    },
    Bus(BusState),
}

/// An addressable node in the graph.
pub(crate) struct Vertex {
    pub(crate) name: String,
    pub(crate) kind: VertexKind,
    /// Position within the parent's children.
    pub(crate) indice: u16,
    pub(crate) parent: Option<VertexId>,
    pub(crate) children: Vec<VertexId>,
    /// Pool slots this vertex owns right now.
    pub(crate) current_hold: u8,
    /// Pool slots this vertex may own at once.
    pub(crate) max_hold: u8,
    /// Tag stamped by graph-introspection traversals.
    pub(crate) scope_time_tag: u32,
}

impl Vertex {
    pub(crate) fn new(name: String, kind: VertexKind, max_hold: u8) -> Self {
        Self {
            name,
            kind,
            indice: 0,
            parent: None,
            children: Vec::new(),
            current_hold: 0,
            max_hold,
            scope_time_tag: 0,
        }
    }

    pub(crate) fn type_key(&self) -> u8 {
        match self.kind {
            VertexKind::Root => keys::VT_TYPE_ROOT,
            VertexKind::Generic { .. } => keys::VT_TYPE_GENERIC,
            VertexKind::Endpoint(_) => keys::VT_TYPE_ENDPOINT,
            VertexKind::Rpc(_) => keys::VT_TYPE_RPC,
            VertexKind::Port { .. } => keys::VT_TYPE_VPORT,
            VertexKind::Bus(_) => keys::VT_TYPE_VBUS,
        }
    }

    pub(crate) fn has_hold_room(&self) -> bool {
        self.current_hold < self.max_hold
    }

    pub(crate) fn can_attach(&self) -> bool {
        self.children.len() < MAX_CHILDREN
    }
}

/// Prefix a user name and clamp it to the wire bound, on a char boundary.
pub(crate) fn bounded_name(prefix: &str, name: &str) -> String {
    let mut full = String::with_capacity(NAME_MAX_LEN);
    full.push_str(prefix);
    for ch in name.chars() {
        if full.len() + ch.len_utf8() > NAME_MAX_LEN {
            break;
        }
        full.push(ch);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_name_prefixes() {
        assert_eq!(bounded_name("ep_", "sensor"), "ep_sensor");
        assert_eq!(bounded_name("rt_", ""), "rt_");
    }

    #[test]
    fn test_bounded_name_clamps_to_wire_limit() {
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let name = bounded_name("vp_", long);
        assert_eq!(name.len(), NAME_MAX_LEN);
        assert!(name.starts_with("vp_abc"));
    }
}
