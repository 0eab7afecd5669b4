//! The OSAP device fabric: a tree of vertices, a shared packet pool, and a
//! cooperative single-threaded tick that moves source-routed datagrams
//! between them and out through link adapters.
//!
//! A [`Fabric`] owns everything: the vertex arena, the pool, a monotonic
//! [`Clock`], and the fault [`ReportSink`]. Build the graph with the `add_*`
//! methods, hand ports and buses their link adapters, then call
//! [`Fabric::tick`] from the application loop. No other thread may touch
//! the fabric; backpressure, not blocking, is how every boundary behaves.

pub mod error;
pub mod keys;
pub mod persist;

mod bus;
mod clock;
mod endpoint;
mod handlers;
mod link;
mod pool;
mod report;
mod rpc;
mod tick;
mod transport;
mod vertex;

pub use clock::{Clock, ManualClock, SystemClock};
pub use endpoint::{AckMode, OnData};
pub use error::FabricError;
pub use link::{BusLink, IngestOutcome, PortLink};
pub use report::ReportSink;
pub use rpc::RpcValue;
pub use vertex::VertexId;

use crate::{
    endpoint::EndpointState,
    pool::PacketPool,
    rpc::RpcState,
    vertex::{BusState, Vertex, VertexKind, bounded_name},
};

use osap_wire::Route;

/// Largest datagram a pool slot can carry.
pub const MAX_PACKET_SIZE: usize = 128;
/// Longest vertex name on the wire.
pub const NAME_MAX_LEN: usize = 31;
/// Most children one vertex can carry.
pub const MAX_CHILDREN: usize = 16;
/// Most queued packets served in one tick.
pub const MAX_ITEMS_PER_LOOP: usize = 16;
/// Broadcast channels per bus.
pub const MAX_BROADCAST_CHANNELS: usize = 64;
/// Endpoint local data bound.
pub const ENDPOINT_MAX_DATA_SIZE: usize = 32;
/// Outgoing routes per endpoint.
pub const ENDPOINT_MAX_ROUTES: usize = 4;

/// Hold quota for leaves.
pub const DEFAULT_MAX_HOLD: u8 = 1;
/// Hold quota for ports, which stall on slow links.
pub const PORT_MAX_HOLD: u8 = 3;
/// Hold quota for buses.
pub const BUS_MAX_HOLD: u8 = 4;

/// Version number reported through the root debug surface.
pub const VERSION_NUM: u32 = 1;

/// Build-time options for a fabric.
#[derive(Clone, Copy)]
pub struct FabricConfig {
    pool_len: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self { pool_len: 12 }
    }
}

impl FabricConfig {
    /// Set how many packet slots the pool rings up.
    #[must_use]
    pub fn with_pool_len(mut self, pool_len: usize) -> Self {
        self.pool_len = pool_len;
        self
    }
}

/// One device's routing context.
pub struct Fabric<C: Clock> {
    pub(crate) vertices: Vec<Vertex>,
    pub(crate) pool: PacketPool,
    pub(crate) clock: C,
    pub(crate) report: ReportSink,
    pub(crate) high_water_mark: u32,
}

impl<C: Clock> Fabric<C> {
    /// A fabric with just its root vertex.
    pub fn new(name: &str, config: FabricConfig, clock: C) -> Self {
        let root = Vertex::new(
            bounded_name("rt_", name),
            VertexKind::Root,
            DEFAULT_MAX_HOLD,
        );
        Self {
            vertices: vec![root],
            pool: PacketPool::new(config.pool_len),
            clock,
            report: ReportSink::default(),
            high_water_mark: 0,
        }
    }

    /// The root vertex.
    #[must_use]
    pub fn root(&self) -> VertexId {
        VertexId(0)
    }

    fn attach(&mut self, parent: VertexId, mut vertex: Vertex) -> Result<VertexId, FabricError> {
        let Some(parent_vertex) = self.vertices.get(parent.index()) else {
            return Err(FabricError::UnknownVertex);
        };
        if !parent_vertex.can_attach() {
            return Err(FabricError::TooManyChildren);
        }
        let id = VertexId(self.vertices.len() as u16);
        vertex.indice = parent_vertex.children.len() as u16;
        vertex.parent = Some(parent);
        self.vertices[parent.index()].children.push(id);
        self.vertices.push(vertex);
        Ok(id)
    }

    /// Nest a generic code vertex under `parent`.
    pub fn add_vertex(&mut self, parent: VertexId, name: &str) -> Result<VertexId, FabricError> {
        self.attach(
            parent,
            Vertex::new(
                bounded_name("", name),
                VertexKind::Generic { on_tick: None },
                DEFAULT_MAX_HOLD,
            ),
        )
    }

    /// Nest an endpoint under `parent`.
    pub fn add_endpoint(&mut self, parent: VertexId, name: &str) -> Result<VertexId, FabricError> {
        self.attach(
            parent,
            Vertex::new(
                bounded_name("ep_", name),
                VertexKind::Endpoint(EndpointState::new()),
                DEFAULT_MAX_HOLD,
            ),
        )
    }

    /// Nest an RPC vertex under `parent`, wrapping a typed function.
    pub fn add_rpc<A, R, F>(
        &mut self,
        parent: VertexId,
        name: &str,
        func: F,
    ) -> Result<VertexId, FabricError>
    where
        A: RpcValue,
        R: RpcValue,
        F: FnMut(A) -> R + 'static,
    {
        self.attach(
            parent,
            Vertex::new(
                bounded_name("rpc_", name),
                VertexKind::Rpc(RpcState::wrap(func)),
                DEFAULT_MAX_HOLD,
            ),
        )
    }

    /// Nest a port under `parent`, bound to a point-to-point link adapter.
    pub fn add_port(
        &mut self,
        parent: VertexId,
        name: &str,
        link: Box<dyn PortLink>,
    ) -> Result<VertexId, FabricError> {
        self.attach(
            parent,
            Vertex::new(
                bounded_name("vp_", name),
                VertexKind::Port { link },
                PORT_MAX_HOLD,
            ),
        )
    }

    /// Nest a bus under `parent`, bound to a multi-drop link adapter.
    pub fn add_bus(
        &mut self,
        parent: VertexId,
        name: &str,
        link: Box<dyn BusLink>,
    ) -> Result<VertexId, FabricError> {
        self.attach(
            parent,
            Vertex::new(
                bounded_name("vb_", name),
                VertexKind::Bus(BusState {
                    link,
                    channels: (0..MAX_BROADCAST_CHANNELS).map(|_| None).collect(),
                }),
                BUS_MAX_HOLD,
            ),
        )
    }

    fn endpoint_state(&mut self, vid: VertexId) -> Result<&mut EndpointState, FabricError> {
        let vertex = self
            .vertices
            .get_mut(vid.index())
            .ok_or(FabricError::UnknownVertex)?;
        match &mut vertex.kind {
            VertexKind::Endpoint(state) => Ok(state),
            _ => Err(FabricError::WrongKind),
        }
    }

    /// Replace an endpoint's inbound-data callback.
    pub fn endpoint_on_data(
        &mut self,
        vid: VertexId,
        on_data: impl FnMut(&[u8]) -> OnData + 'static,
    ) -> Result<(), FabricError> {
        self.endpoint_state(vid)?.on_data = Box::new(on_data);
        Ok(())
    }

    /// Replace an endpoint's pre-query hook.
    pub fn endpoint_before_query(
        &mut self,
        vid: VertexId,
        before_query: impl FnMut() + 'static,
    ) -> Result<(), FabricError> {
        self.endpoint_state(vid)?.before_query = Box::new(before_query);
        Ok(())
    }

    /// Add an outgoing route to an endpoint, returning its indice.
    pub fn endpoint_add_route(
        &mut self,
        vid: VertexId,
        route: Route,
        ack_mode: AckMode,
        timeout_ms: u32,
    ) -> Result<u8, FabricError> {
        self.endpoint_state(vid)?
            .add_route(route, ack_mode, timeout_ms)
            .ok_or(FabricError::RouteTableFull)
    }

    /// Write a new datum to an endpoint, freshening its routes.
    pub fn endpoint_write(&mut self, vid: VertexId, data: &[u8]) -> Result<(), FabricError> {
        if self.endpoint_state(vid)?.write(data) {
            Ok(())
        } else {
            Err(FabricError::OversizeWrite)
        }
    }

    /// An endpoint's current datum.
    pub fn endpoint_data(&self, vid: VertexId) -> Result<&[u8], FabricError> {
        let vertex = self
            .vertices
            .get(vid.index())
            .ok_or(FabricError::UnknownVertex)?;
        match &vertex.kind {
            VertexKind::Endpoint(state) => Ok(&state.data),
            _ => Err(FabricError::WrongKind),
        }
    }

    /// Whether a write now would clobber an in-flight send.
    pub fn endpoint_clear_to_write(&self, vid: VertexId) -> Result<bool, FabricError> {
        let vertex = self
            .vertices
            .get(vid.index())
            .ok_or(FabricError::UnknownVertex)?;
        match &vertex.kind {
            VertexKind::Endpoint(state) => Ok(state.clear_to_write()),
            _ => Err(FabricError::WrongKind),
        }
    }

    /// Install a per-tick hook on a generic vertex.
    pub fn vertex_on_tick(
        &mut self,
        vid: VertexId,
        hook: impl FnMut(u32) + 'static,
    ) -> Result<(), FabricError> {
        let vertex = self
            .vertices
            .get_mut(vid.index())
            .ok_or(FabricError::UnknownVertex)?;
        match &mut vertex.kind {
            VertexKind::Generic { on_tick } => {
                *on_tick = Some(Box::new(hook));
                Ok(())
            }
            _ => Err(FabricError::WrongKind),
        }
    }

    /// Subscribe (or clear) a bus broadcast channel.
    pub fn set_broadcast_channel(
        &mut self,
        bus: VertexId,
        channel: u16,
        route: Option<Route>,
    ) -> Result<(), FabricError> {
        let vertex = self
            .vertices
            .get_mut(bus.index())
            .ok_or(FabricError::UnknownVertex)?;
        match &mut vertex.kind {
            VertexKind::Bus(state) => {
                let slot = state
                    .channels
                    .get_mut(usize::from(channel))
                    .ok_or(FabricError::UnknownVertex)?;
                *slot = route;
                Ok(())
            }
            _ => Err(FabricError::WrongKind),
        }
    }

    /// Deposit a datagram at a vertex, as a link adapter or local producer
    /// would. Refused (false) on pool exhaustion or hold quota.
    pub fn inject(&mut self, vid: VertexId, gram: &[u8]) -> bool {
        let now = self.clock.now_ms();
        let Self {
            pool, vertices, ..
        } = self;
        let Some(vertex) = vertices.get_mut(vid.index()) else {
            return false;
        };
        let Some(slot) = pool.request(vertex, vid) else {
            return false;
        };
        if pool.load(slot, gram, now) {
            true
        } else {
            pool.release(slot, vertices);
            false
        }
    }

    /// Datagrams currently queued at `vid`, oldest first.
    #[must_use]
    pub fn queued_grams(&self, vid: VertexId) -> Vec<Vec<u8>> {
        self.pool
            .collect(self.pool.len())
            .into_iter()
            .filter(|&slot| self.pool.packet(slot).vertex == Some(vid))
            .map(|slot| self.pool.gram(slot).to_vec())
            .collect()
    }

    /// A vertex's wire name.
    pub fn name(&self, vid: VertexId) -> Result<&str, FabricError> {
        self.vertices
            .get(vid.index())
            .map(|v| v.name.as_str())
            .ok_or(FabricError::UnknownVertex)
    }

    /// Children of a vertex, in indice order.
    pub fn children(&self, vid: VertexId) -> Result<&[VertexId], FabricError> {
        self.vertices
            .get(vid.index())
            .map(|v| v.children.as_slice())
            .ok_or(FabricError::UnknownVertex)
    }

    /// Pool slots this vertex owns right now.
    pub fn hold_count(&self, vid: VertexId) -> Result<u8, FabricError> {
        self.vertices
            .get(vid.index())
            .map(|v| v.current_hold)
            .ok_or(FabricError::UnknownVertex)
    }

    /// Override a vertex's hold quota.
    pub fn set_max_hold(&mut self, vid: VertexId, max_hold: u8) -> Result<(), FabricError> {
        self.vertices
            .get_mut(vid.index())
            .map(|v| v.max_hold = max_hold)
            .ok_or(FabricError::UnknownVertex)
    }

    /// Most packets ever collected in one tick.
    #[must_use]
    pub fn high_water_mark(&self) -> u32 {
        self.high_water_mark
    }

    /// The fault sink.
    #[must_use]
    pub fn report(&self) -> &ReportSink {
        &self.report
    }

    /// Current clock reading.
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Occupied pool slots.
    #[must_use]
    pub fn pool_occupied_count(&self) -> usize {
        self.pool.occupied_count()
    }

    /// Free pool slots.
    #[must_use]
    pub fn pool_free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Total pool slots.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Sum of all vertex hold counters; equals the occupied slot count
    /// whenever the fabric is consistent.
    #[must_use]
    pub fn hold_sum(&self) -> u32 {
        self.vertices.iter().map(|v| u32::from(v.current_hold)).sum()
    }

    /// Serialize the root's name for non-volatile stashing.
    pub fn persist_root_name(&self, out: &mut [u8]) -> Result<usize, FabricError> {
        persist::encode_name(&self.vertices[0].name, out)
    }

    /// Restore a persisted root name.
    pub fn restore_root_name(&mut self, blob: &[u8]) -> Result<(), FabricError> {
        let name = persist::decode_name(blob).ok_or(FabricError::BadPersistBlob)?;
        self.vertices[0].name = name.to_string();
        Ok(())
    }
}
