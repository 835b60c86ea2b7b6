//! HIP Base Exchange state machine: one finite automaton per peer, a
//! stateless R1 responder, and the retransmission ledger.
//!
//! A peer absent from the state map is UNASSOCIATED. Entries are created
//! only by a local trigger (initiator) or a fully verified I2 (responder),
//! so an I1 flood allocates nothing.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::crypto::{self, DhKeyPair};
use crate::error::PacketError;
use crate::hip::{
    ControlPacket, PacketType, Parameter, DH_GROUP_X25519, ESP_TRANSFORM_COMPAT, HI_ALG_ED25519,
    TRANSFORM_HMAC_SHA256,
};
use crate::identity::{Hit, Identity};
use crate::peers::PeerTable;
use crate::sadb::{Sadb, SecurityAssociation};

/// Puzzle lifetime exponent advertised in R1.
const PUZZLE_LIFETIME: u8 = 4;

#[derive(Debug, Clone)]
pub struct BexConfig {
    pub retransmit: Duration,
    pub max_retries: u32,
    pub puzzle_difficulty: u8,
    pub max_puzzle_difficulty: u8,
    pub r1_epoch: Duration,
    pub replay_window: u32,
    pub allow_unknown_peers: bool,
}

impl BexConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retransmit: config.timing.retransmit(),
            max_retries: config.timing.max_retries,
            puzzle_difficulty: config.security.puzzle_difficulty,
            max_puzzle_difficulty: config.security.max_puzzle_difficulty,
            r1_epoch: config.timing.r1_epoch(),
            replay_window: config.security.replay_window,
            allow_unknown_peers: config.security.allow_unknown_peers,
        }
    }
}

/// Events the state machine hands back to the dispatcher.
#[derive(Debug)]
pub enum BexOutput {
    /// Serialized HIP control packet ready for the backbone.
    Transmit { dst: Ipv4Addr, packet: Vec<u8> },
    /// SA pair installed; pending frames can flush.
    Established { peer: Hit },
    /// Retransmissions exhausted; the peer is unreachable for now.
    Failed { peer: Hit },
    /// Association torn down (CLOSE in either direction).
    Closed { peer: Hit },
}

/// Directional session keys. `ours` authenticates what this router sends.
#[derive(Debug, Clone, Copy)]
struct SessionKeys {
    ours: [u8; 32],
    theirs: [u8; 32],
}

enum PeerState {
    I1Sent {
        wire: Vec<u8>,
        dst: Ipv4Addr,
        sent_at: Instant,
        tries: u32,
    },
    I2Sent {
        wire: Vec<u8>,
        dst: Ipv4Addr,
        sent_at: Instant,
        tries: u32,
        keys: SessionKeys,
        local_spi: u32,
    },
    /// SA pair already installed; the stored R2 answers retransmissions of
    /// the same I2 until the grace period settles the state. `solution`
    /// discriminates a retransmission from a fresh exchange.
    R2Sent {
        wire: Vec<u8>,
        dst: Ipv4Addr,
        sent_at: Instant,
        keys: SessionKeys,
        solution: [u8; 8],
    },
    Established {
        keys: SessionKeys,
    },
    Closing {
        sent_at: Instant,
        keys: SessionKeys,
    },
    Closed,
}

impl PeerState {
    fn name(&self) -> &'static str {
        match self {
            PeerState::I1Sent { .. } => "I1-SENT",
            PeerState::I2Sent { .. } => "I2-SENT",
            PeerState::R2Sent { .. } => "R2-SENT",
            PeerState::Established { .. } => "ESTABLISHED",
            PeerState::Closing { .. } => "CLOSING",
            PeerState::Closed => "CLOSED",
        }
    }
}

/// One rotation of the stateless-responder material: the secret seeding
/// puzzle values and the DH keypair offered in R1.
struct ResponderEpoch {
    counter: u64,
    secret: [u8; 32],
    dh: DhKeyPair,
}

impl ResponderEpoch {
    fn fresh(counter: u64) -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            counter,
            secret,
            dh: DhKeyPair::generate(),
        }
    }

    /// Puzzle value for a HIT pair: recomputable from the secret, so R1
    /// needs no per-peer memory.
    fn puzzle_seed(&self, hit_i: Hit, hit_r: Hit) -> [u8; 8] {
        let mut input = [0u8; 32];
        input[..16].copy_from_slice(&hit_i.0);
        input[16..].copy_from_slice(&hit_r.0);
        let digest = crypto::hmac_sha256(&self.secret, &input);
        digest[..8].try_into().unwrap()
    }
}

struct ResponderState {
    current: ResponderEpoch,
    previous: Option<ResponderEpoch>,
    rotated_at: Instant,
}

impl ResponderState {
    fn new() -> Self {
        Self {
            current: ResponderEpoch::fresh(1),
            previous: None,
            rotated_at: Instant::now(),
        }
    }

    fn rotate(&mut self, now: Instant) {
        let next = ResponderEpoch::fresh(self.current.counter + 1);
        self.previous = Some(std::mem::replace(&mut self.current, next));
        self.rotated_at = now;
        debug!("rotated responder epoch to {}", self.current.counter);
    }

    fn epoch(&self, counter: u64) -> Option<&ResponderEpoch> {
        if self.current.counter == counter {
            Some(&self.current)
        } else {
            self.previous.as_ref().filter(|e| e.counter == counter)
        }
    }
}

pub struct BexMachine {
    identity: Identity,
    local_addr: Ipv4Addr,
    config: BexConfig,
    states: HashMap<Hit, PeerState>,
    responder: ResponderState,
}

impl BexMachine {
    pub fn new(identity: Identity, local_addr: Ipv4Addr, config: BexConfig) -> Self {
        Self {
            identity,
            local_addr,
            config,
            states: HashMap::new(),
            responder: ResponderState::new(),
        }
    }

    pub fn local_hit(&self) -> Hit {
        self.identity.hit()
    }

    pub fn is_established(&self, peer: &Hit) -> bool {
        matches!(
            self.states.get(peer),
            Some(PeerState::Established { .. }) | Some(PeerState::R2Sent { .. })
        )
    }

    /// Number of peers holding any FSM state. Observable for the
    /// responder-statelessness property.
    pub fn tracked_peers(&self) -> usize {
        self.states.len()
    }

    pub fn state_name(&self, peer: &Hit) -> &'static str {
        self.states
            .get(peer)
            .map(|s| s.name())
            .unwrap_or("UNASSOCIATED")
    }

    /// Start BEX toward a peer. A no-op unless the peer is UNASSOCIATED
    /// (or CLOSED); returns whether an exchange was actually initiated.
    pub fn trigger(&mut self, peer_hit: Hit, dst: Ipv4Addr, out: &mut Vec<BexOutput>) -> bool {
        match self.states.get(&peer_hit) {
            None | Some(PeerState::Closed) => {}
            Some(state) => {
                debug!("bex with {} already {}", peer_hit, state.name());
                return false;
            }
        }

        let pkt = ControlPacket::new(PacketType::I1, self.local_hit(), peer_hit);
        let wire = pkt.serialize(self.local_addr, dst);
        info!("initiating base exchange with {}", peer_hit);
        self.states.insert(
            peer_hit,
            PeerState::I1Sent {
                wire: wire.clone(),
                dst,
                sent_at: Instant::now(),
                tries: 0,
            },
        );
        out.push(BexOutput::Transmit { dst, packet: wire });
        true
    }

    /// Tear down any existing association and start over (sequence-space
    /// exhaustion, operator request).
    pub fn restart(
        &mut self,
        peer_hit: Hit,
        dst: Ipv4Addr,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) {
        sadb.drop_pair(&peer_hit);
        self.states.remove(&peer_hit);
        self.trigger(peer_hit, dst, out);
    }

    pub fn handle_control(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        peers: &mut PeerTable,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        if pkt.receiver_hit != self.local_hit() {
            return Err(PacketError::Malformed("receiver hit is not ours"));
        }
        match pkt.packet_type {
            PacketType::I1 => self.handle_i1(src, pkt, peers, out),
            PacketType::R1 => self.handle_r1(src, pkt, peers, sadb, out),
            PacketType::I2 => self.handle_i2(src, pkt, peers, sadb, out),
            PacketType::R2 => self.handle_r2(src, pkt, peers, sadb, out),
            PacketType::Update => self.handle_update(pkt),
            PacketType::Close => self.handle_close(src, pkt, sadb, out),
            PacketType::CloseAck => self.handle_close_ack(pkt, out),
        }
    }

    /// R1 is derived entirely from the epoch material: receiving I1 never
    /// allocates per-peer state.
    fn handle_i1(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        peers: &mut PeerTable,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;

        if let Some(PeerState::I1Sent { .. }) = self.states.get(&peer_hit) {
            // Simultaneous initiation: the numerically larger HIT keeps the
            // initiator role.
            if self.local_hit() > peer_hit {
                debug!("simultaneous bex with {}: keeping initiator role", peer_hit);
                return Ok(());
            }
            debug!("simultaneous bex with {}: yielding initiator role", peer_hit);
            self.states.remove(&peer_hit);
        }

        if peers.resolve_by_hit(&peer_hit).is_none() && !self.config.allow_unknown_peers {
            debug!("i1 from unknown peer {} dropped", peer_hit);
            return Ok(());
        }

        let epoch = &self.responder.current;
        let random_i = epoch.puzzle_seed(peer_hit, self.local_hit());
        let mut r1 = ControlPacket::new(PacketType::R1, self.local_hit(), peer_hit);
        r1.push(Parameter::R1Counter(epoch.counter));
        r1.push(Parameter::Puzzle {
            difficulty: self.config.puzzle_difficulty,
            lifetime: PUZZLE_LIFETIME,
            opaque: 0,
            random_i,
        });
        r1.push(Parameter::DiffieHellman {
            group: DH_GROUP_X25519,
            public_value: epoch.dh.public,
        });
        r1.push(Parameter::HipTransform(vec![TRANSFORM_HMAC_SHA256]));
        r1.push(Parameter::HostId {
            algorithm: HI_ALG_ED25519,
            public_key: self.identity.public_key_bytes(),
        });
        r1.push(Parameter::EspTransform(vec![ESP_TRANSFORM_COMPAT]));
        r1.push_signature(&self.identity);

        debug!("answering i1 from {} with stateless r1", peer_hit);
        out.push(BexOutput::Transmit {
            dst: src,
            packet: r1.serialize(self.local_addr, src),
        });
        Ok(())
    }

    fn handle_r1(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        peers: &mut PeerTable,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;
        if !matches!(self.states.get(&peer_hit), Some(PeerState::I1Sent { .. })) {
            debug!("unexpected r1 from {}, dropped", peer_hit);
            return Ok(());
        }

        let record = match peers.resolve_by_hit(&peer_hit) {
            Some(record) => record,
            None => {
                debug!("r1 from unconfigured peer {}, dropped", peer_hit);
                return Ok(());
            }
        };

        let host_id = pkt
            .host_id()
            .ok_or(PacketError::Malformed("r1 missing host_id"))?;
        if host_id != record.public_key {
            return Err(PacketError::AuthFailure);
        }
        pkt.verify_packet_signature(&host_id)?;

        let (difficulty, random_i) = pkt
            .puzzle()
            .ok_or(PacketError::Malformed("r1 missing puzzle"))?;
        if difficulty > self.config.max_puzzle_difficulty {
            warn!(
                "r1 from {} demands puzzle difficulty {}, refusing",
                peer_hit, difficulty
            );
            return Ok(());
        }
        let peer_dh = pkt
            .diffie_hellman()
            .ok_or(PacketError::Malformed("r1 missing diffie_hellman"))?;
        if !pkt
            .hip_transform()
            .is_some_and(|suites| suites.contains(&TRANSFORM_HMAC_SHA256))
        {
            debug!("r1 from {} offers no common transform, dropped", peer_hit);
            return Ok(());
        }
        let r1_counter = pkt
            .r1_counter()
            .ok_or(PacketError::Malformed("r1 missing counter"))?;

        let solution_j = crypto::puzzle_solve(&random_i, difficulty, self.local_hit(), peer_hit);

        let dh = DhKeyPair::generate();
        let shared = dh.derive(&peer_dh);
        let sa_keys = crypto::derive_sa_keys(&shared, self.local_hit(), peer_hit);
        let keys = SessionKeys {
            ours: sa_keys.initiator,
            theirs: sa_keys.responder,
        };
        let local_spi = sadb.alloc_spi();

        let mut i2 = ControlPacket::new(PacketType::I2, self.local_hit(), peer_hit);
        i2.push(Parameter::EspInfo { new_spi: local_spi });
        i2.push(Parameter::R1Counter(r1_counter));
        i2.push(Parameter::Solution {
            difficulty,
            opaque: 0,
            random_i,
            solution_j,
        });
        i2.push(Parameter::DiffieHellman {
            group: DH_GROUP_X25519,
            public_value: dh.public,
        });
        i2.push(Parameter::HipTransform(vec![TRANSFORM_HMAC_SHA256]));
        i2.push(Parameter::HostId {
            algorithm: HI_ALG_ED25519,
            public_key: self.identity.public_key_bytes(),
        });
        i2.push(Parameter::EspTransform(vec![ESP_TRANSFORM_COMPAT]));
        i2.push_hmac(&keys.ours);
        i2.push_signature(&self.identity);

        let wire = i2.serialize(self.local_addr, src);
        debug!("solved puzzle for {}, sending i2", peer_hit);
        self.states.insert(
            peer_hit,
            PeerState::I2Sent {
                wire: wire.clone(),
                dst: src,
                sent_at: Instant::now(),
                tries: 0,
                keys,
                local_spi,
            },
        );
        peers.update_locator(&peer_hit, src);
        out.push(BexOutput::Transmit {
            dst: src,
            packet: wire,
        });
        Ok(())
    }

    fn handle_i2(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        peers: &mut PeerTable,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;

        // Nothing stateful happens before the puzzle verifies.
        let (difficulty, random_i, solution_j) = pkt
            .solution()
            .ok_or(PacketError::Malformed("i2 missing solution"))?;

        if let Some(PeerState::R2Sent { wire, dst, solution, .. }) = self.states.get(&peer_hit) {
            if *solution == solution_j {
                debug!("duplicate i2 from {}, retransmitting r2", peer_hit);
                out.push(BexOutput::Transmit {
                    dst: *dst,
                    packet: wire.clone(),
                });
                return Ok(());
            }
            // A different solution means the peer started over; process it
            // as a fresh exchange.
        }
        let counter = pkt
            .r1_counter()
            .ok_or(PacketError::Malformed("i2 missing r1_counter"))?;
        let epoch = match self.responder.epoch(counter) {
            Some(epoch) => epoch,
            None => {
                debug!("i2 from {} references stale epoch {}", peer_hit, counter);
                return Ok(());
            }
        };
        if difficulty != self.config.puzzle_difficulty
            || random_i != epoch.puzzle_seed(peer_hit, self.local_hit())
            || !crypto::puzzle_verify(&random_i, &solution_j, difficulty, peer_hit, self.local_hit())
        {
            return Err(PacketError::PuzzleFailed);
        }

        let peer_dh = pkt
            .diffie_hellman()
            .ok_or(PacketError::Malformed("i2 missing diffie_hellman"))?;
        let shared = epoch.dh.derive(&peer_dh);
        let sa_keys = crypto::derive_sa_keys(&shared, peer_hit, self.local_hit());
        let keys = SessionKeys {
            ours: sa_keys.responder,
            theirs: sa_keys.initiator,
        };
        pkt.verify_hmac(&keys.theirs)?;

        let host_id = pkt
            .host_id()
            .ok_or(PacketError::Malformed("i2 missing host_id"))?;
        match peers.resolve_by_hit(&peer_hit) {
            Some(record) => {
                if record.public_key != host_id {
                    return Err(PacketError::AuthFailure);
                }
            }
            None => {
                if !self.config.allow_unknown_peers {
                    debug!("i2 from unknown peer {} dropped", peer_hit);
                    return Ok(());
                }
                // Self-certifying check: the HIT must be derived from the
                // key the packet presents.
                if Hit::from_public_key(&host_id) != peer_hit {
                    return Err(PacketError::AuthFailure);
                }
                peers.learn(peer_hit, src, host_id);
            }
        }
        pkt.verify_packet_signature(&host_id)?;

        if !pkt
            .hip_transform()
            .is_some_and(|suites| suites.contains(&TRANSFORM_HMAC_SHA256))
        {
            return Err(PacketError::Malformed("i2 no common transform"));
        }
        let peer_spi = pkt
            .esp_info()
            .ok_or(PacketError::Malformed("i2 missing esp_info"))?;

        let local_spi = sadb.alloc_spi();
        let in_sa = SecurityAssociation::inbound(
            local_spi,
            peer_hit,
            self.local_hit(),
            keys.theirs,
            self.config.replay_window,
        );
        let out_sa = SecurityAssociation::outbound(peer_spi, peer_hit, self.local_hit(), keys.ours);
        sadb.insert_pair(in_sa, out_sa);

        let mut r2 = ControlPacket::new(PacketType::R2, self.local_hit(), peer_hit);
        r2.push(Parameter::EspInfo { new_spi: local_spi });
        r2.push_hmac(&keys.ours);
        r2.push_signature(&self.identity);
        let wire = r2.serialize(self.local_addr, src);

        info!("base exchange completed with {} (responder)", peer_hit);
        self.states.insert(
            peer_hit,
            PeerState::R2Sent {
                wire: wire.clone(),
                dst: src,
                sent_at: Instant::now(),
                keys,
                solution: solution_j,
            },
        );
        peers.update_locator(&peer_hit, src);
        out.push(BexOutput::Transmit {
            dst: src,
            packet: wire,
        });
        out.push(BexOutput::Established { peer: peer_hit });
        Ok(())
    }

    fn handle_r2(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        peers: &mut PeerTable,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;
        let (keys, local_spi) = match self.states.get(&peer_hit) {
            Some(PeerState::I2Sent {
                keys, local_spi, ..
            }) => (*keys, *local_spi),
            _ => {
                debug!("unexpected r2 from {}, dropped", peer_hit);
                return Ok(());
            }
        };

        pkt.verify_hmac(&keys.theirs)?;
        let record = match peers.resolve_by_hit(&peer_hit) {
            Some(record) => record,
            None => {
                debug!("r2 from unconfigured peer {}, dropped", peer_hit);
                return Ok(());
            }
        };
        pkt.verify_packet_signature(&record.public_key)?;
        let peer_spi = pkt
            .esp_info()
            .ok_or(PacketError::Malformed("r2 missing esp_info"))?;

        let in_sa = SecurityAssociation::inbound(
            local_spi,
            peer_hit,
            self.local_hit(),
            keys.theirs,
            self.config.replay_window,
        );
        let out_sa = SecurityAssociation::outbound(peer_spi, peer_hit, self.local_hit(), keys.ours);
        sadb.insert_pair(in_sa, out_sa);

        info!("base exchange completed with {} (initiator)", peer_hit);
        self.states.insert(peer_hit, PeerState::Established { keys });
        peers.update_locator(&peer_hit, src);
        out.push(BexOutput::Established { peer: peer_hit });
        Ok(())
    }

    /// UPDATE is verified and otherwise ignored; rekeying is not part of
    /// the base core.
    fn handle_update(&mut self, pkt: &ControlPacket) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;
        let keys = match self.states.get(&peer_hit) {
            Some(PeerState::Established { keys }) | Some(PeerState::R2Sent { keys, .. }) => *keys,
            _ => {
                debug!("update from {} without association, dropped", peer_hit);
                return Ok(());
            }
        };
        pkt.verify_hmac(&keys.theirs)?;
        debug!("update from {} verified, no action", peer_hit);
        Ok(())
    }

    fn handle_close(
        &mut self,
        src: Ipv4Addr,
        pkt: &ControlPacket,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;
        let keys = match self.states.get(&peer_hit) {
            Some(PeerState::Established { keys })
            | Some(PeerState::R2Sent { keys, .. })
            | Some(PeerState::Closing { keys, .. }) => *keys,
            _ => {
                debug!("close from {} without association, dropped", peer_hit);
                return Ok(());
            }
        };
        pkt.verify_hmac(&keys.theirs)?;

        sadb.drop_pair(&peer_hit);
        let mut ack = ControlPacket::new(PacketType::CloseAck, self.local_hit(), peer_hit);
        ack.push_hmac(&keys.ours);
        ack.push_signature(&self.identity);

        info!("association with {} closed by peer", peer_hit);
        self.states.insert(peer_hit, PeerState::Closed);
        out.push(BexOutput::Transmit {
            dst: src,
            packet: ack.serialize(self.local_addr, src),
        });
        out.push(BexOutput::Closed { peer: peer_hit });
        Ok(())
    }

    fn handle_close_ack(
        &mut self,
        pkt: &ControlPacket,
        out: &mut Vec<BexOutput>,
    ) -> Result<(), PacketError> {
        let peer_hit = pkt.sender_hit;
        let keys = match self.states.get(&peer_hit) {
            Some(PeerState::Closing { keys, .. }) => *keys,
            _ => {
                debug!("close_ack from {} out of state, dropped", peer_hit);
                return Ok(());
            }
        };
        pkt.verify_hmac(&keys.theirs)?;
        self.states.insert(peer_hit, PeerState::Closed);
        out.push(BexOutput::Closed { peer: peer_hit });
        Ok(())
    }

    /// Initiate teardown toward an established peer.
    pub fn close(
        &mut self,
        peer_hit: Hit,
        dst: Ipv4Addr,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) {
        let keys = match self.states.get(&peer_hit) {
            Some(PeerState::Established { keys }) | Some(PeerState::R2Sent { keys, .. }) => *keys,
            _ => return,
        };
        sadb.drop_pair(&peer_hit);
        let mut close = ControlPacket::new(PacketType::Close, self.local_hit(), peer_hit);
        close.push_hmac(&keys.ours);
        close.push_signature(&self.identity);
        self.states.insert(
            peer_hit,
            PeerState::Closing {
                sent_at: Instant::now(),
                keys,
            },
        );
        out.push(BexOutput::Transmit {
            dst,
            packet: close.serialize(self.local_addr, dst),
        });
    }

    /// Shutdown: CLOSE every association, tear down all state. Timers die
    /// with the state map; nothing waits for acks.
    pub fn shutdown(
        &mut self,
        peers: &PeerTable,
        sadb: &mut Sadb,
        out: &mut Vec<BexOutput>,
    ) {
        let established: Vec<Hit> = self
            .states
            .iter()
            .filter(|(_, s)| {
                matches!(
                    s,
                    PeerState::Established { .. } | PeerState::R2Sent { .. }
                )
            })
            .map(|(hit, _)| *hit)
            .collect();
        for hit in established {
            if let Some(record) = peers.resolve_by_hit(&hit) {
                let dst = record.locator;
                self.close(hit, dst, sadb, out);
            }
        }
        for (hit, _) in self.states.drain() {
            sadb.drop_pair(&hit);
        }
    }

    /// Drive retransmissions, the R2 grace period, and epoch rotation.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<BexOutput>) {
        if now.duration_since(self.responder.rotated_at) >= self.config.r1_epoch {
            self.responder.rotate(now);
        }

        let retransmit = self.config.retransmit;
        let max_retries = self.config.max_retries;
        let mut failed = Vec::new();

        for (hit, state) in self.states.iter_mut() {
            match state {
                PeerState::I1Sent {
                    wire,
                    dst,
                    sent_at,
                    tries,
                } => {
                    if now.duration_since(*sent_at) >= retransmit {
                        if *tries >= max_retries {
                            failed.push(*hit);
                        } else {
                            *tries += 1;
                            *sent_at = now;
                            debug!("retransmitting i1 to {} ({}/{})", hit, tries, max_retries);
                            out.push(BexOutput::Transmit {
                                dst: *dst,
                                packet: wire.clone(),
                            });
                        }
                    }
                }
                PeerState::I2Sent {
                    wire,
                    dst,
                    sent_at,
                    tries,
                    ..
                } => {
                    if now.duration_since(*sent_at) >= retransmit {
                        if *tries >= max_retries {
                            failed.push(*hit);
                        } else {
                            *tries += 1;
                            *sent_at = now;
                            debug!("retransmitting i2 to {} ({}/{})", hit, tries, max_retries);
                            out.push(BexOutput::Transmit {
                                dst: *dst,
                                packet: wire.clone(),
                            });
                        }
                    }
                }
                PeerState::R2Sent { sent_at, keys, .. } => {
                    if now.duration_since(*sent_at) >= retransmit {
                        let keys = *keys;
                        *state = PeerState::Established { keys };
                    }
                }
                PeerState::Closing { sent_at, .. } => {
                    if now.duration_since(*sent_at) >= retransmit {
                        *state = PeerState::Closed;
                    }
                }
                _ => {}
            }
        }

        for hit in failed {
            self.states.remove(&hit);
            warn!(
                "base exchange with {} failed after {} retransmissions",
                hit, max_retries
            );
            out.push(BexOutput::Failed { peer: hit });
        }
    }
}
