//! Device discovery over UDP multicast
//!
//! This module handles:
//! - Sending the `ID;` identification request to the device multicast group
//! - Collecting replies until the line goes quiet for `timeout`
//! - Turning each `ID;MODEL=..;SERIAL=..;` reply into a [`Device`]
//!
//! Replies are kept in arrival order and never deduplicated: a device that
//! answers twice shows up twice. Deduplication happens at promotion time in
//! the registry.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConf;
use crate::models::Device;
use crate::protocol::{decode_latin1, parse_identity, Command};

/// Discover devices with the configured target and timeout
pub async fn discover(conf: &DiscoveryConf) -> Result<Vec<Device>> {
    discover_with_timeout(conf, conf.timeout()).await
}

/// Discover devices, waiting at most `wait` for each successive reply
pub async fn discover_with_timeout(conf: &DiscoveryConf, wait: Duration) -> Result<Vec<Device>> {
    let socket = UdpSocket::bind(SocketAddr::new(conf.bind_addr, 0))
        .await
        .context("Failed to bind discovery socket")?;

    let target = conf.target();
    if target.ip().is_multicast() {
        socket
            .set_multicast_ttl_v4(conf.multicast_ttl)
            .context("Failed to set multicast TTL")?;
    }

    socket
        .send_to(&Command::Identify.encode(), target)
        .await
        .with_context(|| format!("Failed to send identification request to {target}"))?;

    debug!(%target, "identification request sent");

    collect_replies(&socket, wait, conf.buffer_size).await
}

/// Receive loop shared by discovery: stops on the first silent window
async fn collect_replies(socket: &UdpSocket, wait: Duration, buffer_size: usize) -> Result<Vec<Device>> {
    let mut devices = Vec::new();
    let mut buf = vec![0u8; buffer_size];

    loop {
        let (len, from) = match timeout(wait, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(received) => received.context("Failed to receive discovery reply")?,
        };

        let message = decode_latin1(&buf[..len]);
        match parse_identity(&message) {
            Ok(identity) => {
                let device = Device::new(from.ip(), from.port(), identity.model, identity.serial);
                debug!(device = %device, "device replied");
                devices.push(device);
            }
            Err(e) => {
                warn!(%from, reply = %message, error = %e, "skipping malformed identification reply");
            }
        }
    }

    info!("Discovery complete - {} device(s) found", devices.len());
    Ok(devices)
}
