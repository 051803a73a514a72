// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{PeerConfig, SpeakerConfig};
use crate::connection::{BgpConnection, BgpListener, SessionMap};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::fsm::FsmState;
use crate::log::service_log;
use crate::messages::UpdateMessage;
use crate::registry::ConnectionRegistry;
use crate::session::{AdminEvent, RouteEvent, SessionEvent, SessionRunner};
use crate::{BGP_PORT, IO_TIMEOUT};
use slog::Logger;
use speaker_common::lock;
use speaker_common::thread::ManagedThread;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{sleep, Builder, JoinHandle};
use std::time::{Duration, Instant};

const UNIT_SERVICE: &str = "service";

/// A pending restart of a peer that fell to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSchedule {
    pub peer: IpAddr,
    pub due: Instant,
}

/// Reconnect schedules shared by the session runners, the sweeper and peer
/// removal. A peer has at most one schedule; scheduling again moves it.
#[derive(Debug, Clone)]
pub struct Reconnects {
    schedules: Arc<Mutex<Vec<ReconnectSchedule>>>,
    delay: Duration,
}

impl Reconnects {
    pub fn new(delay: Duration) -> Self {
        Self {
            schedules: Arc::new(Mutex::new(Vec::new())),
            delay,
        }
    }

    /// Time between a peer falling to idle and its restart.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn schedule(&self, peer: IpAddr, due: Instant) {
        let mut schedules = lock!(self.schedules);
        schedules.retain(|s| s.peer != peer);
        schedules.push(ReconnectSchedule { peer, due });
    }

    pub fn purge(&self, peer: IpAddr) {
        lock!(self.schedules).retain(|s| s.peer != peer);
    }

    /// Remove and return every schedule due at `now`.
    pub fn take_due(&self, now: Instant) -> Vec<ReconnectSchedule> {
        let mut schedules = lock!(self.schedules);
        let (due, pending): (Vec<_>, Vec<_>) =
            schedules.drain(..).partition(|s| s.due <= now);
        *schedules = pending;
        due
    }

    pub fn pending(&self) -> Vec<ReconnectSchedule> {
        lock!(self.schedules).clone()
    }
}

struct PeerHandle<Cnx: BgpConnection> {
    runner: Arc<SessionRunner<Cnx>>,
    event_tx: Sender<SessionEvent<Cnx>>,
    thread: Option<JoinHandle<()>>,
}

impl<Cnx: BgpConnection> PeerHandle<Cnx> {
    /// Stop the peer and wait for its runner to finish tearing down.
    fn stop(&mut self) {
        if self
            .event_tx
            .send(SessionEvent::Admin(AdminEvent::ManualStop))
            .is_err()
            || self.event_tx.send(SessionEvent::Shutdown).is_err()
        {
            self.runner.shutdown();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// The speaker: one session runner per configured peer, the dispatcher for
/// inbound connections and the reconnect sweeper.
pub struct Service<Cnx: BgpConnection> {
    pub config: SpeakerConfig,
    sessions: Mutex<BTreeMap<IpAddr, PeerHandle<Cnx>>>,
    addr_to_session: SessionMap<Cnx>,
    registry: ConnectionRegistry,
    reconnects: Reconnects,
    routes: Option<Sender<RouteEvent>>,
    sweeper: Mutex<Option<ManagedThread>>,
    #[allow(clippy::type_complexity)]
    dispatcher: Mutex<Option<(Arc<Dispatcher<Cnx>>, JoinHandle<()>)>>,
    log: Logger,
}

impl<Cnx: BgpConnection> Service<Cnx> {
    pub fn new(config: SpeakerConfig, log: Logger) -> Self {
        let reconnects = Reconnects::new(config.reconnect.delay());
        Self {
            config,
            sessions: Mutex::new(BTreeMap::new()),
            addr_to_session: Arc::new(Mutex::new(BTreeMap::new())),
            registry: ConnectionRegistry::new(),
            reconnects,
            routes: None,
            sweeper: Mutex::new(None),
            dispatcher: Mutex::new(None),
            log,
        }
    }

    /// Send routing information from every peer added from now on to `tx`.
    pub fn with_route_events(mut self, tx: Sender<RouteEvent>) -> Self {
        self.routes = Some(tx);
        self
    }

    /// Add every peer in the configuration.
    pub fn start(&self) -> Result<(), Error> {
        for peer in self.config.peers.clone() {
            self.add_peer(peer)?;
        }
        Ok(())
    }

    pub fn add_peer(&self, peer: PeerConfig) -> Result<(), Error> {
        let addr = peer.host.ip();
        let mut sessions = lock!(self.sessions);
        if sessions.contains_key(&addr) {
            return Err(Error::PeerExists);
        }

        let (event_tx, event_rx) = channel();
        let name = peer.name.clone();
        let runner = Arc::new(SessionRunner::new(
            peer,
            self.config.asn,
            self.config.id,
            event_tx.clone(),
            event_rx,
            self.registry.clone(),
            self.reconnects.clone(),
            self.routes.clone(),
            self.log.clone(),
        )?);

        let r = runner.clone();
        let thread = Builder::new()
            .name(format!("bgp-session-{addr}"))
            .spawn(move || r.run())?;

        lock!(self.addr_to_session).insert(addr, event_tx.clone());
        event_tx
            .send(SessionEvent::Admin(AdminEvent::AutomaticStart))
            .map_err(|e| Error::ChannelSend(e.to_string()))?;
        sessions.insert(
            addr,
            PeerHandle {
                runner,
                event_tx,
                thread: Some(thread),
            },
        );
        service_log!(self, info, "added peer {} ({})", name, addr;
            "peer" => addr.to_string()
        );
        Ok(())
    }

    /// Stop a peer and forget it. Returns once the session's timers are
    /// stopped and its connections closed.
    pub fn remove_peer(&self, addr: IpAddr) -> Result<(), Error> {
        self.reconnects.purge(addr);
        let mut handle = lock!(self.sessions)
            .remove(&addr)
            .ok_or(Error::UnknownPeer(addr))?;
        lock!(self.addr_to_session).remove(&addr);
        handle.stop();
        self.reconnects.purge(addr);
        self.registry.remove(addr);
        service_log!(self, info, "removed peer {}", addr; "peer" => addr.to_string());
        Ok(())
    }

    pub fn schedule_reconnect(&self, addr: IpAddr, due: Instant) {
        self.reconnects.schedule(addr, due);
    }

    /// Restart peers whose reconnect is due. Established peers and peers
    /// that have since been removed are skipped. Returns the restarted peers.
    pub fn sweep(&self, now: Instant) -> Vec<IpAddr> {
        let due = self.reconnects.take_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        let sessions = lock!(self.sessions);
        let mut restarted = Vec::new();
        for s in due {
            if self.registry.is_registered(s.peer) {
                service_log!(self, debug,
                    "skipping reconnect of established peer {}", s.peer
                );
                continue;
            }
            let Some(handle) = sessions.get(&s.peer) else {
                continue;
            };
            match handle
                .event_tx
                .send(SessionEvent::Admin(AdminEvent::AutomaticStart))
            {
                Ok(()) => {
                    service_log!(self, info, "reconnecting peer {}", s.peer);
                    restarted.push(s.peer);
                }
                Err(e) => {
                    service_log!(self, error,
                        "reconnect peer {}: {e}", s.peer
                    );
                }
            }
        }
        restarted
    }

    /// Sweep reconnect schedules every `reconnect.sweep_interval` until the
    /// service shuts down.
    pub fn run_sweeper(self: &Arc<Self>) -> Result<(), Error> {
        let interval = self.config.reconnect.sweep_interval();
        let service: Weak<Self> = Arc::downgrade(self);
        let thread = ManagedThread::spawn("bgp-reconnect", move |stop| {
            let mut last = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                sleep(interval.min(IO_TIMEOUT));
                let now = Instant::now();
                if now.duration_since(last) < interval {
                    continue;
                }
                last = now;
                match service.upgrade() {
                    Some(s) => {
                        s.sweep(now);
                    }
                    None => break,
                }
            }
        })?;
        if let Some(previous) = lock!(self.sweeper).replace(thread) {
            previous.stop();
        }
        Ok(())
    }

    /// Accept inbound connections on the configured listen address.
    pub fn listen<Listener>(&self) -> Result<(), Error>
    where
        Listener: BgpListener<Cnx> + Send + 'static,
    {
        let listen = self
            .config
            .listen
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{BGP_PORT}"));
        let dispatcher = Arc::new(Dispatcher::new(
            self.addr_to_session.clone(),
            listen.clone(),
            self.log.clone(),
        ));
        let listener = dispatcher.bind::<Listener>()?;
        let d = dispatcher.clone();
        let thread = Builder::new()
            .name("bgp-dispatcher".into())
            .spawn(move || d.serve(listener))?;
        service_log!(self, info, "listening on {}", listen);

        if let Some((previous, t)) =
            lock!(self.dispatcher).replace((dispatcher, thread))
        {
            previous.shutdown();
            let _ = t.join();
        }
        Ok(())
    }

    /// Stop the sweeper, the dispatcher and every peer.
    pub fn shutdown(&self) {
        if let Some(sweeper) = lock!(self.sweeper).take() {
            sweeper.stop();
        }
        if let Some((dispatcher, t)) = lock!(self.dispatcher).take() {
            dispatcher.shutdown();
            let _ = t.join();
        }
        let sessions = std::mem::take(&mut *lock!(self.sessions));
        for (addr, mut handle) in sessions {
            lock!(self.addr_to_session).remove(&addr);
            self.reconnects.purge(addr);
            handle.stop();
        }
        service_log!(self, info, "service stopped");
    }

    pub fn peer_state(&self, addr: IpAddr) -> Option<FsmState> {
        lock!(self.sessions).get(&addr).map(|h| h.runner.state())
    }

    pub fn peers(&self) -> Vec<IpAddr> {
        lock!(self.sessions).keys().copied().collect()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn reconnects(&self) -> &Reconnects {
        &self.reconnects
    }

    /// Queue an UPDATE for an established peer.
    pub fn send_update(
        &self,
        addr: IpAddr,
        update: UpdateMessage,
    ) -> Result<(), Error> {
        let sessions = lock!(self.sessions);
        let handle = sessions.get(&addr).ok_or(Error::UnknownPeer(addr))?;
        handle
            .event_tx
            .send(SessionEvent::Announce(update))
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Operator start or stop of a peer.
    pub fn admin(&self, addr: IpAddr, event: AdminEvent) -> Result<(), Error> {
        let sessions = lock!(self.sessions);
        let handle = sessions.get(&addr).ok_or(Error::UnknownPeer(addr))?;
        handle
            .event_tx
            .send(SessionEvent::Admin(event))
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }
}
