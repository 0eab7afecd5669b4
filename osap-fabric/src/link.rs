//! Link adapter contracts.
//!
//! The fabric never talks to hardware. Ports and buses hold a boxed adapter
//! behind these traits, the adapter owns its own rx/tx staging, and all the
//! fabric asks for is clear-to-send gating, egress, and a chance each tick
//! to take fully received datagrams into the packet pool. Backpressure runs
//! both ways: `cts`/`ctb` false leaves outbound packets queued, and an
//! inbound datagram the pool cannot take stays with the adapter.

/// A point-to-point link bound to a port vertex.
pub trait PortLink {
    /// Drive the adapter: pump receive bytes, retransmits, keepalives.
    /// Called once per fabric tick.
    fn tick(&mut self, now_ms: u32);

    /// Ship one datagram. Only called when [`cts`][Self::cts] is true.
    fn send(&mut self, gram: &[u8]);

    /// Clear to send: the outbound staging is free.
    fn cts(&self) -> bool;

    /// The link is live (a receive happened recently).
    fn is_open(&self) -> bool;

    /// A complete inbound datagram is waiting for the fabric.
    fn inbound_ready(&self) -> bool;

    /// Move the waiting datagram into `out`, returning its length. Taking
    /// it is the adapter's signal to acknowledge and free its rx staging.
    fn take_inbound(&mut self, out: &mut [u8]) -> Option<u16>;
}

/// A multi-drop link bound to a bus vertex.
pub trait BusLink {
    /// Drive the adapter. Called once per fabric tick.
    fn tick(&mut self, now_ms: u32);

    /// Ship one datagram to the drop at `rx_addr`. Only called when
    /// [`cts`][Self::cts] is true for that address.
    fn send(&mut self, gram: &[u8], rx_addr: u16);

    /// Broadcast one datagram on `channel`. Only called when
    /// [`ctb`][Self::ctb] is true for that channel.
    fn broadcast(&mut self, gram: &[u8], channel: u16);

    /// Clear to send to `rx_addr`.
    fn cts(&self, rx_addr: u16) -> bool;

    /// Clear to broadcast on `channel`.
    fn ctb(&self, channel: u16) -> bool;

    /// Link state for the drop at `rx_addr`.
    fn is_open(&self, rx_addr: u16) -> bool;

    /// The receive address this node owns on the bus.
    fn own_rx_addr(&self) -> u16;

    /// Width of the bus address space.
    fn addr_space_size(&self) -> u16;

    /// A complete addressed inbound datagram is waiting.
    fn inbound_ready(&self) -> bool;

    /// Move the waiting addressed datagram into `out`.
    fn take_inbound(&mut self, out: &mut [u8]) -> Option<u16>;

    /// A broadcast frame is waiting; returns its channel.
    fn broadcast_ready(&self) -> Option<u16>;

    /// Move the waiting broadcast frame into `out`.
    fn take_broadcast(&mut self, out: &mut [u8]) -> Option<u16>;

    /// Discard the waiting broadcast frame (nothing subscribed).
    fn drop_broadcast(&mut self);
}

/// What became of a broadcast frame offered to a bus vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Spliced onto the subscribed route and queued in the pool.
    Accepted,
    /// No pool slot free; offer it again next tick.
    Retry,
    /// No route subscribed on that channel; safe to discard.
    Empty,
}
