// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use speaker_common::lock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// The set of peers with an established session. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<Mutex<BTreeMap<IpAddr, bool>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: IpAddr) {
        lock!(self.peers).insert(peer, true);
    }

    pub fn unregister(&self, peer: IpAddr) {
        lock!(self.peers).insert(peer, false);
    }

    pub fn is_registered(&self, peer: IpAddr) -> bool {
        lock!(self.peers).get(&peer).copied().unwrap_or(false)
    }

    /// Registered peers in address order.
    pub fn registered(&self) -> Vec<IpAddr> {
        lock!(self.peers)
            .iter()
            .filter(|(_, up)| **up)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Forget a peer entirely.
    pub fn remove(&self, peer: IpAddr) {
        lock!(self.peers).remove(&peer);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use speaker_common::ip;
    use std::thread;

    #[test]
    fn register_unregister() {
        let r = ConnectionRegistry::new();
        let a = ip!("10.0.0.1");
        let b = ip!("10.0.0.2");
        assert!(!r.is_registered(a));

        r.register(a);
        r.register(b);
        assert!(r.is_registered(a));
        assert_eq!(r.registered(), vec![a, b]);

        r.unregister(a);
        assert!(!r.is_registered(a));
        assert_eq!(r.registered(), vec![b]);

        // last writer wins
        r.register(a);
        r.register(a);
        r.unregister(a);
        assert!(!r.is_registered(a));

        r.remove(b);
        assert!(r.registered().is_empty());
    }

    #[test]
    fn concurrent_use() {
        let r = ConnectionRegistry::new();
        let handles: Vec<_> = (1..=8u8)
            .map(|i| {
                let r = r.clone();
                thread::spawn(move || {
                    let peer = IpAddr::from([10, 0, 0, i]);
                    for _ in 0..100 {
                        r.register(peer);
                        r.unregister(peer);
                    }
                    if i % 2 == 0 {
                        r.register(peer);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(r.registered().len(), 4);
        assert!(r.is_registered(IpAddr::from([10, 0, 0, 2])));
        assert!(!r.is_registered(IpAddr::from([10, 0, 0, 1])));
    }
}
