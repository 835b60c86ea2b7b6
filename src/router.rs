//! The dispatcher: routes frames between the bridge side and the backbone
//! side, owns the per-peer pre-BEX frame queues, and is the single owner of
//! the peer table, SADB, and state machine.

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::ah;
use crate::bex::{BexConfig, BexMachine, BexOutput};
use crate::config::Config;
use crate::dataplane;
use crate::error::PacketError;
use crate::hip::{self, ControlPacket};
use crate::identity::{Hit, Identity};
use crate::ipv4;
use crate::metrics::{Metrics, PeerCounters};
use crate::peers::PeerTable;
use crate::sadb::Sadb;

/// Messages the dispatcher emits toward the I/O layer.
#[derive(Debug)]
pub enum RouterOutput {
    /// Deliver an Ethernet frame to the local bridge.
    BridgeFrame(Vec<u8>),
    /// Transmit a complete IPv4 datagram on the backbone.
    Backbone { dst: Ipv4Addr, datagram: Vec<u8> },
}

pub struct Router {
    local_addr: Ipv4Addr,
    peers: PeerTable,
    sadb: Sadb,
    bex: BexMachine,
    queues: HashMap<Hit, VecDeque<Vec<u8>>>,
    queue_depth: usize,
    metrics: Arc<Metrics>,
    counters: HashMap<Hit, Arc<PeerCounters>>,
}

impl Router {
    pub fn new(
        identity: Identity,
        config: &Config,
        peers: PeerTable,
        metrics: Arc<Metrics>,
    ) -> Self {
        let local_addr = config
            .daemon
            .local_addr
            .expect("config validation requires local_addr");
        let bex = BexMachine::new(identity, local_addr, BexConfig::from_config(config));
        Self {
            local_addr,
            peers,
            sadb: Sadb::new(config.security.replay_window),
            bex,
            queues: HashMap::new(),
            queue_depth: config.limits.frame_queue_depth,
            metrics,
            counters: HashMap::new(),
        }
    }

    pub fn local_hit(&self) -> Hit {
        self.bex.local_hit()
    }

    pub fn sadb(&self) -> &Sadb {
        &self.sadb
    }

    pub fn sadb_mut(&mut self) -> &mut Sadb {
        &mut self.sadb
    }

    pub fn bex(&self) -> &BexMachine {
        &self.bex
    }

    fn counters(&mut self, hit: &Hit) -> Arc<PeerCounters> {
        let metrics = &self.metrics;
        self.counters
            .entry(*hit)
            .or_insert_with(|| metrics.peer(&hit.to_string()))
            .clone()
    }

    /// Bridge side: an Ethernet frame from the local segment.
    pub fn handle_bridge_frame(&mut self, frame: Vec<u8>, out: &mut Vec<RouterOutput>) {
        if frame.len() < 14 {
            debug!("runt frame from bridge ({} bytes), dropped", frame.len());
            return;
        }
        let dst_mac: [u8; 6] = frame[..6].try_into().unwrap();

        // Group bit set: flood to every peer, the VPLS way. ARP across
        // segments depends on this.
        if dst_mac[0] & 0x01 != 0 {
            let targets: Vec<(Hit, Ipv4Addr)> = self
                .peers
                .iter()
                .map(|record| (record.hit, record.locator))
                .collect();
            for (hit, locator) in targets {
                self.forward_to_peer(hit, locator, frame.clone(), out);
            }
            return;
        }

        match self.peers.resolve_by_mac(&dst_mac) {
            Some(hit) => {
                let locator = match self.peers.resolve_by_hit(&hit) {
                    Some(record) => record.locator,
                    None => return,
                };
                self.forward_to_peer(hit, locator, frame, out);
            }
            None => {
                debug!(
                    "no peer fronts mac {}, frame dropped",
                    hex::encode(dst_mac)
                );
            }
        }
    }

    fn forward_to_peer(
        &mut self,
        hit: Hit,
        locator: Ipv4Addr,
        frame: Vec<u8>,
        out: &mut Vec<RouterOutput>,
    ) {
        let counters = self.counters(&hit);
        if let Some(sa) = self.sadb.lookup_out_mut(&hit) {
            match dataplane::encapsulate(sa, &frame) {
                Ok(datagram) => {
                    counters.seq_out.store(sa.seq_out as u64, Ordering::Relaxed);
                    counters
                        .tx_bytes
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    self.metrics.inc_packets_tx();
                    out.push(RouterOutput::Backbone {
                        dst: locator,
                        datagram: ipv4::build(self.local_addr, locator, ah::AH_PROTOCOL, &datagram),
                    });
                }
                Err(PacketError::SaExhausted) => {
                    warn!("outbound sa to {} exhausted, re-keying", hit);
                    self.enqueue(hit, frame);
                    let mut events = Vec::new();
                    self.bex.restart(hit, locator, &mut self.sadb, &mut events);
                    self.note_bex_attempt(&hit);
                    self.metrics.set_sa_pairs(self.sadb.pair_count() as u64);
                    self.process_bex_outputs(events, out);
                }
                Err(err) => {
                    debug!("encapsulation toward {} failed: {}", hit, err);
                }
            }
        } else {
            self.enqueue(hit, frame);
            let mut events = Vec::new();
            if self.bex.trigger(hit, locator, &mut events) {
                self.note_bex_attempt(&hit);
            }
            self.process_bex_outputs(events, out);
        }
    }

    fn note_bex_attempt(&mut self, hit: &Hit) {
        self.metrics.inc_bex_attempts();
        self.counters(hit).bex_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn enqueue(&mut self, hit: Hit, frame: Vec<u8>) {
        let queue = self.queues.entry(hit).or_default();
        if queue.len() >= self.queue_depth {
            queue.pop_front();
            self.metrics.inc_queue_drops();
        }
        queue.push_back(frame);
    }

    /// Backbone side: a datagram already stripped of its IPv4 header.
    pub fn handle_backbone(
        &mut self,
        src: Ipv4Addr,
        protocol: u8,
        payload: &[u8],
        out: &mut Vec<RouterOutput>,
    ) {
        self.metrics.inc_packets_rx();
        match protocol {
            hip::HIP_PROTOCOL => self.handle_control(src, payload, out),
            ah::AH_PROTOCOL => self.handle_data(src, payload, out),
            other => {
                debug!("ignoring backbone protocol {} from {}", other, src);
            }
        }
    }

    fn handle_control(&mut self, src: Ipv4Addr, payload: &[u8], out: &mut Vec<RouterOutput>) {
        let pkt = match ControlPacket::parse(payload, src, self.local_addr) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!("malformed control packet from {}: {}", src, err);
                self.metrics.inc_malformed_drops();
                return;
            }
        };
        let peer = pkt.sender_hit;
        let mut events = Vec::new();
        let result = self
            .bex
            .handle_control(src, &pkt, &mut self.peers, &mut self.sadb, &mut events);
        if let Err(err) = result {
            self.count_error(Some(peer), err, src);
        }
        self.metrics.set_sa_pairs(self.sadb.pair_count() as u64);
        self.process_bex_outputs(events, out);
    }

    fn handle_data(&mut self, src: Ipv4Addr, payload: &[u8], out: &mut Vec<RouterOutput>) {
        match dataplane::decapsulate(&mut self.sadb, payload) {
            Ok((peer, frame)) => {
                self.counters(&peer)
                    .rx_bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                out.push(RouterOutput::BridgeFrame(frame));
            }
            Err(err) => {
                let peer = self.attribute_ah(payload);
                self.count_error(peer, err, src);
            }
        }
    }

    /// Best-effort peer attribution for drop counters on the AH path.
    fn attribute_ah(&self, payload: &[u8]) -> Option<Hit> {
        let pkt = ah::parse(payload).ok()?;
        Some(self.sadb.lookup_in(pkt.spi)?.peer_hit)
    }

    /// Drop accounting per the error taxonomy: parse errors and auth
    /// failures get a debug line, replay and unknown-SPI drops are
    /// counter-only, and nothing is ever reported back on-wire.
    fn count_error(&mut self, peer: Option<Hit>, err: PacketError, src: Ipv4Addr) {
        match err {
            PacketError::Malformed(reason) => {
                debug!("malformed packet from {}: {}", src, reason);
                self.metrics.inc_malformed_drops();
            }
            PacketError::AuthFailure => {
                debug!("authentication failure on packet from {}", src);
                self.metrics.inc_auth_failures();
                if let Some(hit) = peer {
                    self.counters(&hit).auth_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            PacketError::ReplayDetected => {
                self.metrics.inc_replay_drops();
                if let Some(hit) = peer {
                    self.counters(&hit).replay_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
            PacketError::UnknownSpi(_) => {
                self.metrics.inc_unknown_spi_drops();
                if let Some(hit) = peer {
                    self.counters(&hit)
                        .unknown_spi_drops
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            PacketError::PuzzleFailed => {
                self.metrics.inc_puzzle_failures();
            }
            PacketError::SaExhausted => {
                // Surfaced on the outbound path only; nothing to count here.
            }
        }
    }

    fn process_bex_outputs(&mut self, events: Vec<BexOutput>, out: &mut Vec<RouterOutput>) {
        for event in events {
            match event {
                BexOutput::Transmit { dst, packet } => {
                    self.metrics.inc_packets_tx();
                    out.push(RouterOutput::Backbone {
                        dst,
                        datagram: ipv4::build(self.local_addr, dst, hip::HIP_PROTOCOL, &packet),
                    });
                }
                BexOutput::Established { peer } => {
                    self.metrics.inc_bex_successes();
                    self.counters(&peer).bex_successes.fetch_add(1, Ordering::Relaxed);
                    self.metrics.set_sa_pairs(self.sadb.pair_count() as u64);
                    self.flush_queue(peer, out);
                }
                BexOutput::Failed { peer } => {
                    self.metrics.inc_bex_failures();
                    if let Some(queue) = self.queues.get_mut(&peer) {
                        for _ in 0..queue.len() {
                            self.metrics.inc_queue_drops();
                        }
                        queue.clear();
                    }
                }
                BexOutput::Closed { peer } => {
                    debug!("association with {} closed", peer);
                    self.metrics.set_sa_pairs(self.sadb.pair_count() as u64);
                }
            }
        }
    }

    /// Drain a peer's pending frames in FIFO order once its SA pair exists.
    fn flush_queue(&mut self, peer: Hit, out: &mut Vec<RouterOutput>) {
        let Some(mut queue) = self.queues.remove(&peer) else {
            return;
        };
        let Some(record) = self.peers.resolve_by_hit(&peer) else {
            return;
        };
        let locator = record.locator;
        while let Some(frame) = queue.pop_front() {
            if self.sadb.lookup_out(&peer).is_none() {
                // SA vanished mid-flush; park the rest again.
                self.enqueue(peer, frame);
                while let Some(remaining) = queue.pop_front() {
                    self.enqueue(peer, remaining);
                }
                return;
            }
            self.forward_to_peer(peer, locator, frame, out);
        }
    }

    /// Timer path: BEX retransmissions and epoch rotation.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<RouterOutput>) {
        let mut events = Vec::new();
        self.bex.tick(now, &mut events);
        self.process_bex_outputs(events, out);
    }

    /// Quiesce: close every association and drop all queued frames.
    pub fn shutdown(&mut self, out: &mut Vec<RouterOutput>) {
        let mut events = Vec::new();
        self.bex.shutdown(&self.peers, &mut self.sadb, &mut events);
        self.process_bex_outputs(events, out);
        self.queues.clear();
        self.metrics.set_sa_pairs(0);
    }
}
