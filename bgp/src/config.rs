// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::AddressFamily;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SpeakerConfig {
    /// Local autonomous system number.
    pub asn: u32,

    /// Local BGP identifier.
    pub id: u32,

    /// Address to accept connections on, e.g. `"0.0.0.0:179"`.
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ReconnectConfig {
    /// How often due reconnect schedules are checked.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long after falling to idle a peer is restarted.
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Timer values are in seconds unless noted otherwise.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct PeerConfig {
    pub name: String,
    pub host: SocketAddr,

    /// Source address for outbound connections.
    #[serde(default)]
    pub src_addr: Option<SocketAddr>,

    pub remote_asn: u32,

    /// When set the peer's OPEN must carry this identifier.
    #[serde(default)]
    pub remote_id: Option<u32>,

    /// Wait for the peer to connect instead of connecting out.
    #[serde(default)]
    pub passive: bool,

    #[serde(default = "default_hold_time")]
    pub hold_time: u64,

    #[serde(default = "default_connect_retry")]
    pub connect_retry: u64,

    #[serde(default)]
    pub delay_open: Option<u64>,

    #[serde(default = "default_idle_hold_time")]
    pub idle_hold_time: u64,

    #[serde(default)]
    pub damp_peer_oscillations: bool,

    #[serde(default)]
    pub collision_detect_established: bool,

    #[serde(default = "default_true")]
    pub four_octet_as: bool,

    /// Address families advertised with the multiprotocol capability.
    #[serde(default)]
    pub multiprotocol: Vec<AddressFamily>,

    #[serde(default)]
    pub route_refresh: bool,

    /// Clock resolution in milliseconds.
    #[serde(default = "default_resolution_ms")]
    pub resolution_ms: u64,
}

impl PeerConfig {
    /// A peer with default timers and capabilities.
    pub fn new(
        name: impl Into<String>,
        host: SocketAddr,
        remote_asn: u32,
    ) -> Self {
        Self {
            name: name.into(),
            host,
            src_addr: None,
            remote_asn,
            remote_id: None,
            passive: false,
            hold_time: default_hold_time(),
            connect_retry: default_connect_retry(),
            delay_open: None,
            idle_hold_time: default_idle_hold_time(),
            damp_peer_oscillations: false,
            collision_detect_established: false,
            four_octet_as: true,
            multiprotocol: Vec::new(),
            route_refresh: false,
            resolution_ms: default_resolution_ms(),
        }
    }

    pub fn hold_time(&self) -> Duration {
        Duration::from_secs(self.hold_time)
    }

    pub fn keepalive(&self) -> Duration {
        self.hold_time() / 3
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry)
    }

    pub fn delay_open(&self) -> Option<Duration> {
        self.delay_open.map(Duration::from_secs)
    }

    pub fn idle_hold_time(&self) -> Duration {
        Duration::from_secs(self.idle_hold_time)
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }
}

fn default_sweep_interval_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    30000
}

fn default_hold_time() -> u64 {
    90
}

fn default_connect_retry() -> u64 {
    120
}

fn default_idle_hold_time() -> u64 {
    5
}

fn default_resolution_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
