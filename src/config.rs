use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::Hit;
use crate::peers::{self, PeerRecord, PeerTable, TrustState};

/// Top-level configuration for the router.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// TAP device bridged to the local segment.
    #[serde(default = "default_tap_name")]
    pub tap_name: String,
    #[serde(default = "default_tap_mtu")]
    pub tap_mtu: u16,
    /// Backbone locator of this router; source address of everything we
    /// send and part of the control-packet checksum.
    pub local_addr: Option<Ipv4Addr>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tap_name: default_tap_name(),
            tap_mtu: default_tap_mtu(),
            local_addr: None,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Security settings.
#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    pub identity_path: Option<String>,
    /// Puzzle difficulty K offered in R1.
    #[serde(default = "default_puzzle_difficulty")]
    pub puzzle_difficulty: u8,
    /// Upper bound on the difficulty this router will solve as initiator.
    #[serde(default = "default_max_puzzle_difficulty")]
    pub max_puzzle_difficulty: u8,
    /// Anti-replay window width, clamped to 1..=64.
    #[serde(default = "default_replay_window")]
    pub replay_window: u32,
    /// Admit peers not present in the static table from inbound BEX.
    #[serde(default)]
    pub allow_unknown_peers: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            identity_path: None,
            puzzle_difficulty: default_puzzle_difficulty(),
            max_puzzle_difficulty: default_max_puzzle_difficulty(),
            replay_window: default_replay_window(),
            allow_unknown_peers: false,
        }
    }
}

/// Retransmission and epoch timing.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// I1/I2 retransmission interval in seconds.
    #[serde(default = "default_retransmit_secs")]
    pub retransmit_secs: u64,
    /// Retransmissions before BEX is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Rotation interval of the stateless-R1 secret and DH epoch.
    #[serde(default = "default_r1_epoch_secs")]
    pub r1_epoch_secs: u64,
    /// Worker timer granularity.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retransmit_secs: default_retransmit_secs(),
            max_retries: default_max_retries(),
            r1_epoch_secs: default_r1_epoch_secs(),
            tick_millis: default_tick_millis(),
        }
    }
}

impl TimingConfig {
    pub fn retransmit(&self) -> Duration {
        Duration::from_secs(self.retransmit_secs)
    }

    pub fn r1_epoch(&self) -> Duration {
        Duration::from_secs(self.r1_epoch_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Bounds on in-memory buffering.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Per-peer cap on frames queued while BEX completes; overflow drops
    /// the oldest.
    #[serde(default = "default_frame_queue_depth")]
    pub frame_queue_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            frame_queue_depth: default_frame_queue_depth(),
        }
    }
}

/// Static peer table entry. The peer's HIT is derived from its public key.
#[derive(Debug, Deserialize)]
pub struct PeerConfig {
    /// Hex-encoded Ed25519 host identity key (64 hex chars).
    pub public_key: String,
    /// Backbone locator.
    pub locator: Ipv4Addr,
    /// Local MACs this peer router fronts.
    #[serde(default)]
    pub macs: Vec<String>,
}

fn default_tap_name() -> String {
    "hip0".to_string()
}
fn default_tap_mtu() -> u16 {
    1500
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_puzzle_difficulty() -> u8 {
    8
}
fn default_max_puzzle_difficulty() -> u8 {
    20
}
fn default_replay_window() -> u32 {
    crate::sadb::DEFAULT_REPLAY_WINDOW
}
fn default_retransmit_secs() -> u64 {
    2
}
fn default_max_retries() -> u32 {
    4
}
fn default_r1_epoch_secs() -> u64 {
    120
}
fn default_tick_millis() -> u64 {
    200
}
fn default_frame_queue_depth() -> usize {
    64
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.local_addr.is_none() {
            return Err(ConfigError::Invalid(
                "daemon.local_addr is required".to_string(),
            ));
        }
        if self.security.puzzle_difficulty > self.security.max_puzzle_difficulty {
            return Err(ConfigError::Invalid(format!(
                "security.puzzle_difficulty {} exceeds max_puzzle_difficulty {}",
                self.security.puzzle_difficulty, self.security.max_puzzle_difficulty
            )));
        }
        if self.limits.frame_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "limits.frame_queue_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the peer table from the `[[peers]]` section.
    pub fn build_peer_table(&self) -> Result<PeerTable, ConfigError> {
        let mut table = PeerTable::new();
        for (index, peer) in self.peers.iter().enumerate() {
            let key_bytes = hex::decode(&peer.public_key).map_err(|_| ConfigError::Peer {
                index,
                reason: "public_key is not valid hex".to_string(),
            })?;
            let public_key: [u8; 32] = key_bytes.try_into().map_err(|_| ConfigError::Peer {
                index,
                reason: "public_key must be 32 bytes".to_string(),
            })?;

            let mut macs = Vec::with_capacity(peer.macs.len());
            for mac in &peer.macs {
                macs.push(peers::parse_mac(mac).ok_or_else(|| ConfigError::Peer {
                    index,
                    reason: format!("bad mac address {:?}", mac),
                })?);
            }

            table.insert(PeerRecord {
                hit: Hit::from_public_key(&public_key),
                locator: peer.locator,
                public_key,
                trust: TrustState::Configured,
                macs,
            });
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [daemon]
        tap_name = "hip0"
        local_addr = "192.0.2.1"

        [security]
        puzzle_difficulty = 10

        [timing]
        retransmit_secs = 1

        [[peers]]
        public_key = "0101010101010101010101010101010101010101010101010101010101010101"
        locator = "192.0.2.2"
        macs = ["02:00:00:00:00:01"]
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon.tap_name, "hip0");
        assert_eq!(config.security.puzzle_difficulty, 10);
        assert_eq!(config.timing.retransmit_secs, 1);
        assert_eq!(config.timing.max_retries, default_max_retries());
        assert_eq!(config.peers.len(), 1);

        let table = config.build_peer_table().unwrap();
        assert_eq!(table.len(), 1);
        let hit = table
            .resolve_by_mac(&[0x02, 0, 0, 0, 0, 0x01])
            .expect("mac mapped");
        assert_eq!(hit, Hit::from_public_key(&[1u8; 32]));
    }

    #[test]
    fn test_missing_local_addr_rejected() {
        let config: Config = toml::from_str("[daemon]\ntap_name = \"hip0\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_peer_key_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.peers[0].public_key = "zz".to_string();
        assert!(matches!(
            config.build_peer_table(),
            Err(ConfigError::Peer { index: 0, .. })
        ));
    }
}
