pub mod ah;
pub mod backbone;
pub mod bex;
pub mod config;
pub mod crypto;
pub mod dataplane;
pub mod error;
pub mod hip;
pub mod http;
pub mod identity;
pub mod ipv4;
pub mod metrics;
pub mod peers;
pub mod router;
pub mod sadb;
pub mod tap;

// Re-export key types for easier access by consumers
pub use bex::{BexConfig, BexMachine, BexOutput};
pub use config::Config;
pub use error::{ConfigError, PacketError};
pub use identity::{Hit, Identity};
pub use metrics::Metrics;
pub use peers::{PeerRecord, PeerTable, TrustState};
pub use router::{Router, RouterOutput};
pub use sadb::{Sadb, SecurityAssociation};
