//! Peer identity store: records keyed by HIT with a static MAC-to-HIT map
//! telling the dispatcher which peer router fronts which local MACs.

use log::info;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::identity::Hit;

/// How a peer entered the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// Pinned in the static peer table.
    Configured,
    /// Admitted from inbound BEX (self-certifying HIT check only).
    Learned,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub hit: Hit,
    /// Current backbone locator; seeded from configuration, refreshed from
    /// the source address of authenticated control traffic.
    pub locator: Ipv4Addr,
    /// Ed25519 host identity key.
    pub public_key: [u8; 32],
    pub trust: TrustState,
    /// Local MACs this peer router fronts.
    pub macs: Vec<[u8; 6]>,
}

pub struct PeerTable {
    by_hit: HashMap<Hit, PeerRecord>,
    by_mac: HashMap<[u8; 6], Hit>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            by_hit: HashMap::new(),
            by_mac: HashMap::new(),
        }
    }

    pub fn insert(&mut self, record: PeerRecord) {
        for mac in &record.macs {
            self.by_mac.insert(*mac, record.hit);
        }
        info!(
            "peer registered: hit {} at {} ({} macs, {:?})",
            record.hit,
            record.locator,
            record.macs.len(),
            record.trust
        );
        self.by_hit.insert(record.hit, record);
    }

    /// Admit a peer learned from inbound BEX. No MAC mapping: learned peers
    /// only terminate tunnels they initiated.
    pub fn learn(&mut self, hit: Hit, locator: Ipv4Addr, public_key: [u8; 32]) {
        self.insert(PeerRecord {
            hit,
            locator,
            public_key,
            trust: TrustState::Learned,
            macs: Vec::new(),
        });
    }

    pub fn resolve_by_hit(&self, hit: &Hit) -> Option<&PeerRecord> {
        self.by_hit.get(hit)
    }

    pub fn resolve_by_mac(&self, mac: &[u8; 6]) -> Option<Hit> {
        self.by_mac.get(mac).copied()
    }

    pub fn update_locator(&mut self, hit: &Hit, locator: Ipv4Addr) {
        if let Some(record) = self.by_hit.get_mut(hit) {
            if record.locator != locator {
                info!("peer {} locator changed: {} -> {}", hit, record.locator, locator);
                record.locator = locator;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.by_hit.values()
    }

    pub fn len(&self) -> usize {
        self.by_hit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hit.is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a colon-separated MAC address.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = 0;
    for (i, part) in s.split(':').enumerate() {
        if i >= 6 || part.len() != 2 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
        parts += 1;
    }
    (parts == 6).then_some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hit_fill: u8, macs: Vec<[u8; 6]>) -> PeerRecord {
        PeerRecord {
            hit: Hit([hit_fill; 16]),
            locator: Ipv4Addr::new(192, 0, 2, hit_fill),
            public_key: [hit_fill; 32],
            trust: TrustState::Configured,
            macs,
        }
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut table = PeerTable::new();
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        table.insert(record(1, vec![mac]));

        assert_eq!(table.resolve_by_mac(&mac), Some(Hit([1; 16])));
        let peer = table.resolve_by_hit(&Hit([1; 16])).unwrap();
        assert_eq!(peer.locator, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(table.resolve_by_mac(&[0; 6]), None);
    }

    #[test]
    fn test_update_locator() {
        let mut table = PeerTable::new();
        table.insert(record(2, vec![]));
        table.update_locator(&Hit([2; 16]), Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(
            table.resolve_by_hit(&Hit([2; 16])).unwrap().locator,
            Ipv4Addr::new(198, 51, 100, 7)
        );
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
