// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod clock;
pub mod config;
pub mod connection;
pub mod connection_tcp;
pub mod dispatcher;
pub mod error;
pub mod fsm;
pub mod log;
pub mod messages;
pub mod registry;
pub mod service;
pub mod session;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
mod test;

#[cfg(test)]
pub mod connection_channel;

pub const BGP_PORT: u16 = 179;
pub const COMPONENT_BGP: &str = "bgp";
pub const MOD_NEIGHBOR: &str = "neighbor";
pub const MOD_SERVICE: &str = "service";
pub const MOD_CLOCK: &str = "clock";

/// Poll interval for receive loops and the session event queue.
pub const IO_TIMEOUT: std::time::Duration =
    std::time::Duration::from_millis(100);

/// Map IPv4-mapped IPv6 addresses back to IPv4 so that dual stack listeners
/// find sessions configured with IPv4 peers.
pub fn to_canonical(addr: std::net::IpAddr) -> std::net::IpAddr {
    match addr {
        std::net::IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => std::net::IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}
