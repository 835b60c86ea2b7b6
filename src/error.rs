use thiserror::Error;

/// Per-packet error taxonomy. Recoverable errors are handled where they
/// originate (drop + counter); only `SaExhausted` crosses component
/// boundaries, via the dispatcher's teardown path.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Structural parse failure on control or AH input.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// ICV, HMAC, or signature mismatch. The stage that failed is never
    /// reported on-wire.
    #[error("integrity check failed")]
    AuthFailure,

    /// Sequence number outside the replay window or already accepted.
    #[error("replayed sequence number")]
    ReplayDetected,

    /// AH packet whose SPI has no inbound association.
    #[error("no inbound association for spi {0:#010x}")]
    UnknownSpi(u32),

    /// I2 solution does not satisfy the puzzle constraint.
    #[error("puzzle solution rejected")]
    PuzzleFailed,

    /// Outbound sequence space consumed; the SA pair must be torn down.
    #[error("outbound sequence space exhausted")]
    SaExhausted,
}

/// Startup-only configuration failures. Kept as a distinct type so `main`
/// can map it to its own exit code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("peer {index}: {reason}")]
    Peer { index: usize, reason: String },

    #[error("{0}")]
    Invalid(String),
}
