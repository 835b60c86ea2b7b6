//! Security Association Database: bidirectional SA pairs keyed by SPI
//! (inbound) and peer HIT (outbound), with the anti-replay window and the
//! outbound sequence counter.

use std::collections::HashMap;
use std::time::Instant;

use crate::crypto::HMAC_KEY_LEN;
use crate::error::PacketError;
use crate::identity::Hit;

pub const DEFAULT_REPLAY_WINDOW: u32 = 64;

/// Sliding anti-replay window over a 64-bit bitmap. `check` is a pure
/// pre-check so the data plane can defer the state change until the ICV
/// has verified; `commit` records an accepted sequence number.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: u32,
    bitmap: u64,
    width: u32,
}

impl ReplayWindow {
    pub fn new(width: u32) -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            width: width.clamp(1, 64),
        }
    }

    /// Would this sequence number be accepted?
    pub fn check(&self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }
        if seq > self.highest {
            return true;
        }
        let diff = self.highest - seq;
        if diff >= self.width {
            return false;
        }
        self.bitmap & (1u64 << diff) == 0
    }

    /// Record an accepted sequence number. Callers must have seen `check`
    /// succeed for the same value.
    pub fn commit(&mut self, seq: u32) {
        if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.highest = seq;
        } else {
            let diff = self.highest - seq;
            if diff < 64 {
                self.bitmap |= 1u64 << diff;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct SecurityAssociation {
    pub spi: u32,
    pub peer_hit: Hit,
    pub local_hit: Hit,
    pub direction: Direction,
    pub hmac_key: [u8; HMAC_KEY_LEN],
    pub seq_out: u32,
    pub replay: ReplayWindow,
    pub created_at: Instant,
    pub exhausted: bool,
}

impl SecurityAssociation {
    pub fn inbound(
        spi: u32,
        peer_hit: Hit,
        local_hit: Hit,
        hmac_key: [u8; HMAC_KEY_LEN],
        replay_width: u32,
    ) -> Self {
        Self {
            spi,
            peer_hit,
            local_hit,
            direction: Direction::Inbound,
            hmac_key,
            seq_out: 0,
            replay: ReplayWindow::new(replay_width),
            created_at: Instant::now(),
            exhausted: false,
        }
    }

    pub fn outbound(
        spi: u32,
        peer_hit: Hit,
        local_hit: Hit,
        hmac_key: [u8; HMAC_KEY_LEN],
    ) -> Self {
        Self {
            spi,
            peer_hit,
            local_hit,
            direction: Direction::Outbound,
            hmac_key,
            seq_out: 0,
            replay: ReplayWindow::new(1),
            created_at: Instant::now(),
            exhausted: false,
        }
    }

    /// Reserve the next outbound sequence number. The first reservation
    /// yields 1; the value 2^32 - 1 is the last usable, after which the SA
    /// refuses encapsulation and must be torn down.
    pub fn next_seq(&mut self) -> Result<u32, PacketError> {
        if self.exhausted {
            return Err(PacketError::SaExhausted);
        }
        let next = self.seq_out + 1;
        self.seq_out = next;
        if next == u32::MAX {
            self.exhausted = true;
        }
        Ok(next)
    }
}

pub struct Sadb {
    inbound: HashMap<u32, SecurityAssociation>,
    outbound: HashMap<Hit, SecurityAssociation>,
    replay_width: u32,
}

impl Sadb {
    pub fn new(replay_width: u32) -> Self {
        Self {
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            replay_width: replay_width.clamp(1, 64),
        }
    }

    pub fn replay_width(&self) -> u32 {
        self.replay_width
    }

    /// Pick an inbound SPI unique within this router.
    pub fn alloc_spi(&self) -> u32 {
        loop {
            let spi: u32 = rand::random();
            if spi != 0 && !self.inbound.contains_key(&spi) {
                return spi;
            }
        }
    }

    /// Install both directions atomically, replacing any previous pair for
    /// the peer (re-BEX after a crash or exhaustion).
    pub fn insert_pair(&mut self, in_sa: SecurityAssociation, out_sa: SecurityAssociation) {
        debug_assert_eq!(in_sa.direction, Direction::Inbound);
        debug_assert_eq!(out_sa.direction, Direction::Outbound);
        debug_assert_eq!(in_sa.peer_hit, out_sa.peer_hit);
        self.drop_pair(&in_sa.peer_hit);
        self.inbound.insert(in_sa.spi, in_sa);
        self.outbound.insert(out_sa.peer_hit, out_sa);
    }

    pub fn lookup_in(&self, spi: u32) -> Option<&SecurityAssociation> {
        self.inbound.get(&spi)
    }

    pub fn lookup_out(&self, peer_hit: &Hit) -> Option<&SecurityAssociation> {
        self.outbound.get(peer_hit)
    }

    pub fn lookup_out_mut(&mut self, peer_hit: &Hit) -> Option<&mut SecurityAssociation> {
        self.outbound.get_mut(peer_hit)
    }

    /// Remove both directions for a peer. Returns whether anything existed.
    pub fn drop_pair(&mut self, peer_hit: &Hit) -> bool {
        let had_out = self.outbound.remove(peer_hit).is_some();
        let spis: Vec<u32> = self
            .inbound
            .values()
            .filter(|sa| sa.peer_hit == *peer_hit)
            .map(|sa| sa.spi)
            .collect();
        let had_in = !spis.is_empty();
        for spi in spis {
            self.inbound.remove(&spi);
        }
        had_out || had_in
    }

    /// Tentative replay pre-check; commits nothing.
    pub fn replay_check(&self, spi: u32, seq: u32) -> Result<(), PacketError> {
        let sa = self
            .lookup_in(spi)
            .ok_or(PacketError::UnknownSpi(spi))?;
        if sa.replay.check(seq) {
            Ok(())
        } else {
            Err(PacketError::ReplayDetected)
        }
    }

    /// Commit an accepted sequence number after authentication succeeded.
    pub fn replay_commit(&mut self, spi: u32, seq: u32) {
        if let Some(sa) = self.inbound.get_mut(&spi) {
            sa.replay.commit(seq);
        }
    }

    pub fn pair_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(peer: u8, in_spi: u32) -> (SecurityAssociation, SecurityAssociation) {
        let peer_hit = Hit([peer; 16]);
        let local_hit = Hit([0xFE; 16]);
        (
            SecurityAssociation::inbound(in_spi, peer_hit, local_hit, [1; 32], 64),
            SecurityAssociation::outbound(in_spi + 1, peer_hit, local_hit, [2; 32]),
        )
    }

    #[test]
    fn test_next_seq_monotonic_from_one() {
        let (_, mut out) = pair(1, 100);
        let mut last = 0;
        for _ in 0..1000 {
            let seq = out.next_seq().unwrap();
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(last, 1000);
    }

    #[test]
    fn test_seq_exhaustion() {
        let (_, mut out) = pair(1, 100);
        out.seq_out = u32::MAX - 2;
        assert_eq!(out.next_seq().unwrap(), u32::MAX - 1);
        assert_eq!(out.next_seq().unwrap(), u32::MAX);
        assert_eq!(out.next_seq(), Err(PacketError::SaExhausted));
        assert_eq!(out.next_seq(), Err(PacketError::SaExhausted));
    }

    #[test]
    fn test_replay_window_rejects_seen() {
        let mut win = ReplayWindow::new(64);
        assert!(win.check(1));
        win.commit(1);
        assert!(!win.check(1));
        assert!(win.check(5));
        win.commit(5);
        assert!(!win.check(5));
        // Within window, unseen values are still fine.
        assert!(win.check(3));
        win.commit(3);
        assert!(!win.check(3));
    }

    #[test]
    fn test_replay_window_slides() {
        let mut win = ReplayWindow::new(64);
        win.commit(100);
        assert!(!win.check(36)); // 100 - 36 = 64, outside the window
        assert!(win.check(37));
        win.commit(200);
        assert!(!win.check(100)); // slid out
        assert!(win.check(150));
    }

    #[test]
    fn test_replay_window_zero_rejected() {
        let win = ReplayWindow::new(64);
        assert!(!win.check(0));
    }

    #[test]
    fn test_narrow_window() {
        let mut win = ReplayWindow::new(4);
        win.commit(10);
        assert!(!win.check(6)); // diff 4, outside width 4
        assert!(win.check(7));
    }

    #[test]
    fn test_insert_pair_replaces() {
        let mut sadb = Sadb::new(64);
        let (a_in, a_out) = pair(1, 100);
        sadb.insert_pair(a_in, a_out);
        assert_eq!(sadb.pair_count(), 1);
        assert!(sadb.lookup_in(100).is_some());

        let (b_in, b_out) = pair(1, 300);
        sadb.insert_pair(b_in, b_out);
        assert_eq!(sadb.pair_count(), 1);
        assert_eq!(sadb.inbound_count(), 1);
        assert!(sadb.lookup_in(100).is_none());
        assert!(sadb.lookup_in(300).is_some());
        assert_eq!(sadb.lookup_out(&Hit([1; 16])).unwrap().spi, 301);
    }

    #[test]
    fn test_drop_pair_removes_both_directions() {
        let mut sadb = Sadb::new(64);
        let (in_sa, out_sa) = pair(3, 500);
        sadb.insert_pair(in_sa, out_sa);
        assert!(sadb.drop_pair(&Hit([3; 16])));
        assert_eq!(sadb.pair_count(), 0);
        assert_eq!(sadb.inbound_count(), 0);
        assert!(!sadb.drop_pair(&Hit([3; 16])));
    }

    #[test]
    fn test_replay_check_unknown_spi() {
        let sadb = Sadb::new(64);
        assert_eq!(
            sadb.replay_check(42, 1),
            Err(PacketError::UnknownSpi(42))
        );
    }

    #[test]
    fn test_alloc_spi_unique() {
        let mut sadb = Sadb::new(64);
        let (in_sa, out_sa) = pair(1, 100);
        sadb.insert_pair(in_sa, out_sa);
        for _ in 0..64 {
            let spi = sadb.alloc_spi();
            assert_ne!(spi, 0);
            assert_ne!(spi, 100);
        }
    }
}
