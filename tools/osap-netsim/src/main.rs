use anyhow::{Context, Result};
use clap::Parser;
use hashbrown::HashMap;
use serde::Serialize;

use osap_fabric::{
    AckMode, BusLink, Fabric, FabricConfig, ManualClock, VertexId, keys,
};
use osap_link_serial::{SerialIo, SerialLink};
use osap_wire::{Key, Route, find_ptr, write_datagram};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Simulate two OSAP nodes joined by a serial pair and a shared bus.
///
/// Node alpha writes an acked value to node beta over the serial link,
/// broadcasts the same value on a bus channel, and pings beta's root.
/// Set the environment variable `RUST_LOG=trace` for logging.
#[derive(Parser)]
struct Cmdline {
    /// Scheduler ticks to run
    #[arg(long, default_value_t = 64)]
    ticks: u32,
    /// Simulated milliseconds per tick
    #[arg(long, default_value_t = 10)]
    tick_ms: u32,
    /// Emit the final report as JSON
    #[arg(long)]
    json: bool,
}

// ---------------------------------------------------------------- serial sim

#[derive(Default)]
struct Wire {
    bytes: VecDeque<u8>,
}

struct MemSerial {
    rx: Rc<RefCell<Wire>>,
    tx: Rc<RefCell<Wire>>,
}

impl SerialIo for MemSerial {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut wire = self.rx.borrow_mut();
        let mut n = 0;
        while n < buf.len() {
            match wire.bytes.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
    fn writable(&self) -> bool {
        true
    }
    fn write(&mut self, byte: u8) {
        self.tx.borrow_mut().bytes.push_back(byte);
    }
}

fn serial_pair() -> (MemSerial, MemSerial) {
    let ab = Rc::new(RefCell::new(Wire::default()));
    let ba = Rc::new(RefCell::new(Wire::default()));
    (
        MemSerial {
            rx: ba.clone(),
            tx: ab.clone(),
        },
        MemSerial { rx: ab, tx: ba },
    )
}

// ---------------------------------------------------------------- bus sim

#[derive(Default)]
struct DropBox {
    unicast: VecDeque<Vec<u8>>,
    broadcast: VecDeque<(u16, Vec<u8>)>,
}

/// The shared medium: every registered drop gets a mailbox.
#[derive(Default)]
struct BusMedium {
    drops: HashMap<u16, DropBox>,
}

struct SimBusLink {
    medium: Rc<RefCell<BusMedium>>,
    own_addr: u16,
}

impl SimBusLink {
    fn new(medium: &Rc<RefCell<BusMedium>>, own_addr: u16) -> Self {
        medium.borrow_mut().drops.insert(own_addr, DropBox::default());
        Self {
            medium: medium.clone(),
            own_addr,
        }
    }
}

impl BusLink for SimBusLink {
    fn tick(&mut self, _now_ms: u32) {}
    fn send(&mut self, gram: &[u8], rx_addr: u16) {
        if let Some(mailbox) = self.medium.borrow_mut().drops.get_mut(&rx_addr) {
            mailbox.unicast.push_back(gram.to_vec());
        }
    }
    fn broadcast(&mut self, gram: &[u8], channel: u16) {
        for (&addr, mailbox) in &mut self.medium.borrow_mut().drops {
            if addr != self.own_addr {
                mailbox.broadcast.push_back((channel, gram.to_vec()));
            }
        }
    }
    fn cts(&self, rx_addr: u16) -> bool {
        self.medium.borrow().drops.contains_key(&rx_addr)
    }
    fn ctb(&self, _channel: u16) -> bool {
        true
    }
    fn is_open(&self, rx_addr: u16) -> bool {
        self.medium.borrow().drops.contains_key(&rx_addr)
    }
    fn own_rx_addr(&self) -> u16 {
        self.own_addr
    }
    fn addr_space_size(&self) -> u16 {
        8
    }
    fn inbound_ready(&self) -> bool {
        self.medium.borrow().drops[&self.own_addr]
            .unicast
            .front()
            .is_some()
    }
    fn take_inbound(&mut self, out: &mut [u8]) -> Option<u16> {
        let gram = self
            .medium
            .borrow_mut()
            .drops
            .get_mut(&self.own_addr)?
            .unicast
            .pop_front()?;
        out[..gram.len()].copy_from_slice(&gram);
        Some(gram.len() as u16)
    }
    fn broadcast_ready(&self) -> Option<u16> {
        self.medium.borrow().drops[&self.own_addr]
            .broadcast
            .front()
            .map(|(channel, _)| *channel)
    }
    fn take_broadcast(&mut self, out: &mut [u8]) -> Option<u16> {
        let (_, gram) = self
            .medium
            .borrow_mut()
            .drops
            .get_mut(&self.own_addr)?
            .broadcast
            .pop_front()?;
        out[..gram.len()].copy_from_slice(&gram);
        Some(gram.len() as u16)
    }
    fn drop_broadcast(&mut self) {
        if let Some(mailbox) = self.medium.borrow_mut().drops.get_mut(&self.own_addr) {
            mailbox.broadcast.pop_front();
        }
    }
}

// ---------------------------------------------------------------- report

#[derive(Serialize)]
struct VertexReport {
    name: String,
    children: Vec<VertexReport>,
}

#[derive(Serialize)]
struct NodeReport {
    tree: VertexReport,
    pool_len: usize,
    pool_free: usize,
    high_water_mark: u32,
    error_count: u32,
    latest_error: String,
}

#[derive(Serialize)]
struct Report {
    lamp_value: Vec<u8>,
    lamp_delivered_tick: Option<u32>,
    ping_reply_tick: Option<u32>,
    query_reply_tick: Option<u32>,
    query_value: Option<Vec<u8>>,
    serial_open: bool,
    nodes: Vec<NodeReport>,
}

fn tree_report(fab: &Fabric<Rc<ManualClock>>, vid: VertexId) -> Result<VertexReport> {
    let mut children = Vec::new();
    for &child in fab.children(vid)? {
        children.push(tree_report(fab, child)?);
    }
    Ok(VertexReport {
        name: fab.name(vid)?.to_string(),
        children,
    })
}

fn node_report(fab: &Fabric<Rc<ManualClock>>) -> Result<NodeReport> {
    Ok(NodeReport {
        tree: tree_report(fab, fab.root())?,
        pool_len: fab.pool_len(),
        pool_free: fab.pool_free_count(),
        high_water_mark: fab.high_water_mark(),
        error_count: fab.report().error_count(),
        latest_error: fab.report().latest_error().to_string(),
    })
}

fn is_ping_reply(gram: &[u8]) -> bool {
    find_ptr(gram).is_ok_and(|ptr| {
        gram.get(ptr + 1) == Some(&Key::Dest.byte())
            && gram.get(ptr + 2) == Some(&Key::PingRes.byte())
    })
}

/// The datum carried by a query response, when `gram` is one.
fn query_resp_value(gram: &[u8]) -> Option<Vec<u8>> {
    let ptr = find_ptr(gram).ok()?;
    if gram.get(ptr + 1) != Some(&Key::Dest.byte())
        || gram.get(ptr + 2) != Some(&keys::EP_QUERY_RESP)
    {
        return None;
    }
    Some(gram.get(ptr + 4..)?.to_vec())
}

// ---------------------------------------------------------------- main

fn main() -> Result<()> {
    env_logger::init();
    let Cmdline {
        ticks,
        tick_ms,
        json,
    } = Cmdline::parse();

    let clock = Rc::new(ManualClock::new());
    let (io_a, io_b) = serial_pair();
    let medium = Rc::new(RefCell::new(BusMedium::default()));

    // node alpha: a button endpoint, a serial uplink, a bus drop
    let mut alpha = Fabric::new("alpha", FabricConfig::default(), clock.clone());
    let button = alpha
        .add_endpoint(alpha.root(), "button")
        .context("building alpha")?;
    alpha.add_port(alpha.root(), "uplink", Box::new(SerialLink::new(io_a)))?;
    alpha.add_bus(
        alpha.root(),
        "party",
        Box::new(SimBusLink::new(&medium, 1)),
    )?;

    // node beta: a lamp endpoint, the matching serial end, a bus drop
    let mut beta = Fabric::new("beta", FabricConfig::default(), clock.clone());
    let lamp = beta
        .add_endpoint(beta.root(), "lamp")
        .context("building beta")?;
    beta.add_port(beta.root(), "uplink", Box::new(SerialLink::new(io_b)))?;
    let b_bus = beta.add_bus(
        beta.root(),
        "party",
        Box::new(SimBusLink::new(&medium, 2)),
    )?;

    // the button transmits down both paths: acked over serial, ackless
    // over the bus broadcast channel
    alpha.endpoint_add_route(
        button,
        Route::new().sib(1).pfwd().sib(0).with_ttl(500),
        AckMode::Acked,
        250,
    )?;
    alpha.endpoint_add_route(button, Route::new().sib(2).bbrd(3), AckMode::Ackless, 250)?;
    beta.set_broadcast_channel(b_bus, 3, Some(Route::new().sib(0)))?;

    alpha.endpoint_write(button, &[42])?;

    // and alpha pings beta's root through the serial link
    let mut ping = [0u8; 32];
    let ping_len = write_datagram(
        &mut ping,
        &Route::new().child(1).pfwd().parent(),
        &[Key::Dest.byte(), Key::PingReq.byte(), 9],
    )
    .context("building the ping datagram")?;
    anyhow::ensure!(
        alpha.inject(alpha.root(), &ping[..ping_len]),
        "no pool slot for the ping"
    );

    // a protocol query for the lamp's datum, sent once the write has landed
    // so the response demonstrably carries the delivered value
    let mut query = [0u8; 32];
    let query_len = write_datagram(
        &mut query,
        &Route::new().child(1).pfwd().sib(0),
        &[Key::Dest.byte(), keys::EP_QUERY, 11],
    )
    .context("building the query datagram")?;

    let mut lamp_delivered_tick = None;
    let mut ping_reply_tick = None;
    let mut query_sent = false;
    let mut query_reply_tick = None;
    let mut query_value = None;
    for t in 1..=ticks {
        clock.advance(tick_ms);
        alpha.tick().context("node alpha tick")?;
        beta.tick().context("node beta tick")?;
        if lamp_delivered_tick.is_none() && beta.endpoint_data(lamp)? == [42] {
            lamp_delivered_tick = Some(t);
        }
        if ping_reply_tick.is_none()
            && alpha
                .queued_grams(alpha.root())
                .iter()
                .any(|gram| is_ping_reply(gram))
        {
            ping_reply_tick = Some(t);
        }
        // the root's hold may be briefly taken by the ping reply; keep
        // offering the query until a slot opens
        if lamp_delivered_tick.is_some()
            && !query_sent
            && alpha.inject(alpha.root(), &query[..query_len])
        {
            query_sent = true;
        }
        if query_sent && query_reply_tick.is_none() {
            if let Some(value) = alpha
                .queued_grams(alpha.root())
                .iter()
                .find_map(|gram| query_resp_value(gram))
            {
                query_reply_tick = Some(t);
                query_value = Some(value);
            }
        }
    }

    // a reply crossing both ways is the strongest open signal the sim has
    let serial_open = ping_reply_tick.is_some();

    let report = Report {
        lamp_value: beta.endpoint_data(lamp)?.to_vec(),
        lamp_delivered_tick,
        ping_reply_tick,
        query_reply_tick,
        query_value,
        serial_open,
        nodes: vec![node_report(&alpha)?, node_report(&beta)?],
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("ran {ticks} ticks of {tick_ms}ms");
        match report.lamp_delivered_tick {
            Some(t) => println!("beta lamp = {:?}, first delivered on tick {t}", report.lamp_value),
            None => println!("beta lamp never updated"),
        }
        match report.ping_reply_tick {
            Some(t) => println!("ping reply reached alpha's root on tick {t}"),
            None => println!("no ping reply made it back"),
        }
        match (report.query_reply_tick, &report.query_value) {
            (Some(t), Some(value)) => {
                println!("query response carried {value:?}, back on tick {t}");
            }
            _ => println!("no query response made it back"),
        }
        for node in &report.nodes {
            println!(
                "{}: pool {}/{} free, high-water {}, {} errors{}",
                node.tree.name,
                node.pool_free,
                node.pool_len,
                node.high_water_mark,
                node.error_count,
                if node.latest_error.is_empty() {
                    String::new()
                } else {
                    format!(" (latest: {})", node.latest_error)
                }
            );
        }
    }
    Ok(())
}
