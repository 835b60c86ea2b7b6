//! TAP plumbing for the bridge side: a layer-2 device delivering raw
//! Ethernet frames to and from the local segment.

use anyhow::{Context, Result};
use log::info;
use tun::Layer;

const TAP_MAX_MTU: u16 = 2000;
const TAP_MIN_MTU: u16 = 576;

/// Buffer size for TAP reads; comfortably above any accepted MTU.
pub const TAP_READ_BUFFER: usize = 4096;

/// Create the async L2 TAP device bridged to the local segment.
pub fn create(name: &str, mtu: u16) -> Result<tun::AsyncDevice> {
    let mut config = tun::Configuration::default();
    config.layer(Layer::L2);
    let mtu = mtu.clamp(TAP_MIN_MTU, TAP_MAX_MTU);
    config.mtu(mtu as i32);
    if !name.is_empty() {
        config.name(name);
    }
    config.up();

    let device = tun::create_as_async(&config).context("failed to create TAP device")?;
    info!("tap device '{}' created (mtu={})", name, mtu);
    Ok(device)
}
