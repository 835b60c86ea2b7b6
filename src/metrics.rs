use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Per-peer counters published to the operator surface. Written by the
/// protocol worker through plain atomic stores; read lock-free by the
/// metrics endpoint.
#[derive(Default)]
pub struct PeerCounters {
    pub bex_attempts: AtomicU64,
    pub bex_successes: AtomicU64,
    pub auth_failures: AtomicU64,
    pub replay_drops: AtomicU64,
    pub unknown_spi_drops: AtomicU64,
    pub seq_out: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
}

/// Prometheus-compatible metrics for the router core.
pub struct Metrics {
    pub packets_rx_total: AtomicU64,
    pub packets_tx_total: AtomicU64,
    pub bex_attempts_total: AtomicU64,
    pub bex_successes_total: AtomicU64,
    pub bex_failures_total: AtomicU64,
    pub auth_failures_total: AtomicU64,
    pub replay_drops_total: AtomicU64,
    pub unknown_spi_drops_total: AtomicU64,
    pub malformed_drops_total: AtomicU64,
    pub puzzle_failures_total: AtomicU64,
    pub queue_drops_total: AtomicU64,
    pub sa_pairs_active: AtomicU64,
    peers: Mutex<HashMap<String, Arc<PeerCounters>>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets_rx_total: AtomicU64::new(0),
            packets_tx_total: AtomicU64::new(0),
            bex_attempts_total: AtomicU64::new(0),
            bex_successes_total: AtomicU64::new(0),
            bex_failures_total: AtomicU64::new(0),
            auth_failures_total: AtomicU64::new(0),
            replay_drops_total: AtomicU64::new(0),
            unknown_spi_drops_total: AtomicU64::new(0),
            malformed_drops_total: AtomicU64::new(0),
            puzzle_failures_total: AtomicU64::new(0),
            queue_drops_total: AtomicU64::new(0),
            sa_pairs_active: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch (or create) the counter block for a peer. The worker clones
    /// the Arc once per peer and updates through it without further
    /// locking.
    pub fn peer(&self, hit: &str) -> Arc<PeerCounters> {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(hit.to_string())
            .or_insert_with(|| Arc::new(PeerCounters::default()))
            .clone()
    }

    pub fn inc_packets_rx(&self) {
        self.packets_rx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_packets_tx(&self) {
        self.packets_tx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bex_attempts(&self) {
        self.bex_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bex_successes(&self) {
        self.bex_successes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bex_failures(&self) {
        self.bex_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replay_drops(&self) {
        self.replay_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_spi_drops(&self) {
        self.unknown_spi_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed_drops(&self) {
        self.malformed_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_puzzle_failures(&self) {
        self.puzzle_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_drops(&self) {
        self.queue_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_sa_pairs(&self, count: u64) {
        self.sa_pairs_active.store(count, Ordering::Relaxed);
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = format!(
            "# HELP hipvpls_packets_rx_total Backbone datagrams received\n\
             # TYPE hipvpls_packets_rx_total counter\n\
             hipvpls_packets_rx_total {}\n\
             # HELP hipvpls_packets_tx_total Backbone datagrams transmitted\n\
             # TYPE hipvpls_packets_tx_total counter\n\
             hipvpls_packets_tx_total {}\n\
             # HELP hipvpls_bex_attempts_total Base exchanges initiated\n\
             # TYPE hipvpls_bex_attempts_total counter\n\
             hipvpls_bex_attempts_total {}\n\
             # HELP hipvpls_bex_successes_total Base exchanges completed\n\
             # TYPE hipvpls_bex_successes_total counter\n\
             hipvpls_bex_successes_total {}\n\
             # HELP hipvpls_bex_failures_total Base exchanges abandoned after retransmission\n\
             # TYPE hipvpls_bex_failures_total counter\n\
             hipvpls_bex_failures_total {}\n\
             # HELP hipvpls_auth_failures_total ICV, HMAC, or signature mismatches\n\
             # TYPE hipvpls_auth_failures_total counter\n\
             hipvpls_auth_failures_total {}\n\
             # HELP hipvpls_replay_drops_total Datagrams rejected by the replay window\n\
             # TYPE hipvpls_replay_drops_total counter\n\
             hipvpls_replay_drops_total {}\n\
             # HELP hipvpls_unknown_spi_drops_total AH datagrams with no inbound SA\n\
             # TYPE hipvpls_unknown_spi_drops_total counter\n\
             hipvpls_unknown_spi_drops_total {}\n\
             # HELP hipvpls_malformed_drops_total Structurally invalid packets\n\
             # TYPE hipvpls_malformed_drops_total counter\n\
             hipvpls_malformed_drops_total {}\n\
             # HELP hipvpls_puzzle_failures_total I2 packets with a bad puzzle solution\n\
             # TYPE hipvpls_puzzle_failures_total counter\n\
             hipvpls_puzzle_failures_total {}\n\
             # HELP hipvpls_queue_drops_total Frames dropped from bounded pre-BEX queues\n\
             # TYPE hipvpls_queue_drops_total counter\n\
             hipvpls_queue_drops_total {}\n\
             # HELP hipvpls_sa_pairs_active Established SA pairs\n\
             # TYPE hipvpls_sa_pairs_active gauge\n\
             hipvpls_sa_pairs_active {}\n",
            self.packets_rx_total.load(Ordering::Relaxed),
            self.packets_tx_total.load(Ordering::Relaxed),
            self.bex_attempts_total.load(Ordering::Relaxed),
            self.bex_successes_total.load(Ordering::Relaxed),
            self.bex_failures_total.load(Ordering::Relaxed),
            self.auth_failures_total.load(Ordering::Relaxed),
            self.replay_drops_total.load(Ordering::Relaxed),
            self.unknown_spi_drops_total.load(Ordering::Relaxed),
            self.malformed_drops_total.load(Ordering::Relaxed),
            self.puzzle_failures_total.load(Ordering::Relaxed),
            self.queue_drops_total.load(Ordering::Relaxed),
            self.sa_pairs_active.load(Ordering::Relaxed),
        );

        let peers = self.peers.lock().unwrap();
        for (hit, c) in peers.iter() {
            for (name, value) in [
                ("bex_attempts", c.bex_attempts.load(Ordering::Relaxed)),
                ("bex_successes", c.bex_successes.load(Ordering::Relaxed)),
                ("auth_failures", c.auth_failures.load(Ordering::Relaxed)),
                ("replay_drops", c.replay_drops.load(Ordering::Relaxed)),
                (
                    "unknown_spi_drops",
                    c.unknown_spi_drops.load(Ordering::Relaxed),
                ),
                ("seq_out", c.seq_out.load(Ordering::Relaxed)),
                ("tx_bytes", c.tx_bytes.load(Ordering::Relaxed)),
                ("rx_bytes", c.rx_bytes.load(Ordering::Relaxed)),
            ] {
                out.push_str(&format!(
                    "hipvpls_peer_{}{{hit=\"{}\"}} {}\n",
                    name, hit, value
                ));
            }
        }
        out
    }
}
