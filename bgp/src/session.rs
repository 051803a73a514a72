// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::clock::{Clock, ClockTimers, TimerKind};
use crate::config::PeerConfig;
use crate::connection::{BgpConnection, BgpConnector, ConnectionId};
use crate::error::{Error, ExpectationMismatch};
use crate::fsm::{Fsm, FsmAction, FsmConfig, FsmEvent, FsmState, PeerOpen};
use crate::log::session_log;
use crate::messages::{
    Capability, ErrorCode, ErrorSubcode, HeaderErrorSubcode, Message,
    NotificationMessage, OpenErrorSubcode, OpenMessage,
    PathAttribute, PathAttributeTypeCode, PathAttributeValue, Prefix,
    UpdateErrorSubcode, UpdateMessage, AS_TRANS,
};
use crate::registry::ConnectionRegistry;
use crate::service::Reconnects;
use crate::IO_TIMEOUT;
use slog::Logger;
use speaker_common::lock;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const UNIT_SESSION_RUNNER: &str = "session_runner";

/// How long an outbound connection attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator and system requests to start or stop a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminEvent {
    ManualStart,
    ManualStop,
    AutomaticStart,
    AutomaticStop,
}

impl From<AdminEvent> for FsmEvent {
    fn from(e: AdminEvent) -> Self {
        match e {
            AdminEvent::ManualStart => FsmEvent::ManualStart,
            AdminEvent::ManualStop => FsmEvent::ManualStop,
            AdminEvent::AutomaticStart => FsmEvent::AutomaticStart,
            AdminEvent::AutomaticStop => FsmEvent::AutomaticStop,
        }
    }
}

/// Input to a session runner. Everything that can affect a session, from
/// transports, timers and the service, arrives through one queue of these.
pub enum SessionEvent<Cnx> {
    Admin(AdminEvent),

    /// The dispatcher accepted a connection from the peer.
    Connected(Cnx),

    /// An outbound connection attempt succeeded.
    ConnectionConfirmed(Cnx),

    /// An outbound connection attempt failed.
    ConnectFailed,

    Message {
        id: ConnectionId,
        msg: Message,
    },

    /// A received message could not be decoded. The connection's receive
    /// loop has exited.
    DecodeError {
        id: ConnectionId,
        error: Error,
    },

    /// The transport under a connection went away.
    Closed(ConnectionId),

    Timer(TimerKind),

    /// Send an UPDATE to the peer.
    Announce(UpdateMessage),

    /// Stop the runner.
    Shutdown,
}

impl<Cnx> SessionEvent<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Admin(AdminEvent::ManualStart) => "manual start",
            Self::Admin(AdminEvent::ManualStop) => "manual stop",
            Self::Admin(AdminEvent::AutomaticStart) => "automatic start",
            Self::Admin(AdminEvent::AutomaticStop) => "automatic stop",
            Self::Connected(_) => "connected",
            Self::ConnectionConfirmed(_) => "connection confirmed",
            Self::ConnectFailed => "connect failed",
            Self::Message { msg, .. } => msg.title(),
            Self::DecodeError { .. } => "decode error",
            Self::Closed(_) => "closed",
            Self::Timer(kind) => kind.as_str(),
            Self::Announce(_) => "announce",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Where a route came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSide {
    /// Received from the peer.
    Remote,

    /// Sent to the peer by this speaker.
    Local,
}

/// Routing information for an external RIB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    Added {
        peer: IpAddr,
        side: RouteSide,
        afi: u16,
        safi: u8,
        nlri: Prefix,
        attributes: Vec<PathAttribute>,
    },
    Withdrawn {
        peer: IpAddr,
        side: RouteSide,
        afi: u16,
        safi: u8,
        nlri: Prefix,
        attributes: Vec<PathAttribute>,
    },
}

impl RouteEvent {
    pub fn nlri(&self) -> &Prefix {
        match self {
            Self::Added { nlri, .. } | Self::Withdrawn { nlri, .. } => nlri,
        }
    }
}

/// Drives the state machine of one peer.
///
/// The runner is the only writer of its [`Fsm`]. It turns [`SessionEvent`]s
/// into [`FsmEvent`]s, hands them to the state machine and carries out the
/// returned [`FsmAction`]s. The state machine lock is never held while an
/// action runs.
pub struct SessionRunner<Cnx: BgpConnection> {
    pub config: PeerConfig,
    asn: u32,
    id: u32,
    fsm: Mutex<Fsm>,

    /// Copy of the state machine state, readable without the fsm lock.
    state: Mutex<FsmState>,

    clock: Clock,
    connections: Mutex<BTreeMap<ConnectionId, Cnx>>,
    event_tx: Sender<SessionEvent<Cnx>>,
    event_rx: Mutex<Receiver<SessionEvent<Cnx>>>,
    registry: ConnectionRegistry,
    reconnects: Reconnects,
    routes: Option<Sender<RouteEvent>>,
    shutdown: AtomicBool,
    log: Logger,
}

impl<Cnx: BgpConnection> SessionRunner<Cnx> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PeerConfig,
        asn: u32,
        id: u32,
        event_tx: Sender<SessionEvent<Cnx>>,
        event_rx: Receiver<SessionEvent<Cnx>>,
        registry: ConnectionRegistry,
        reconnects: Reconnects,
        routes: Option<Sender<RouteEvent>>,
        log: Logger,
    ) -> Result<SessionRunner<Cnx>, Error> {
        let delay_open = config.delay_open();
        let timers = ClockTimers::new(
            config.connect_retry(),
            config.hold_time(),
            config.keepalive(),
            delay_open.unwrap_or_default(),
            config.idle_hold_time(),
        );
        let clock = Clock::new(
            config.resolution(),
            timers.clone(),
            event_tx.clone(),
            SessionEvent::Timer,
            log.clone(),
        )?;
        let fsm = Fsm::new(
            FsmConfig {
                local_id: id,
                passive: config.passive,
                hold_time: config.hold_time(),
                idle_hold_time: config.idle_hold_time(),
                delay_open: delay_open.is_some(),
                damp_peer_oscillations: config.damp_peer_oscillations,
                collision_detect_established: config
                    .collision_detect_established,
            },
            timers,
        );
        Ok(SessionRunner {
            config,
            asn,
            id,
            fsm: Mutex::new(fsm),
            state: Mutex::new(FsmState::Idle),
            clock,
            connections: Mutex::new(BTreeMap::new()),
            event_tx,
            event_rx: Mutex::new(event_rx),
            registry,
            reconnects,
            routes,
            shutdown: AtomicBool::new(false),
            log,
        })
    }

    pub fn state(&self) -> FsmState {
        *lock!(self.state)
    }

    pub fn connect_retry_counter(&self) -> u32 {
        lock!(self.fsm).connect_retry_counter()
    }

    /// Hold time agreed with the peer in the current session.
    pub fn negotiated_hold(&self) -> Option<Duration> {
        lock!(self.fsm).negotiated_hold()
    }

    pub fn remote_id(&self) -> Option<u32> {
        lock!(self.fsm).remote_id()
    }

    pub fn event_sender(&self) -> Sender<SessionEvent<Cnx>> {
        self.event_tx.clone()
    }

    /// Ask the run loop to exit. The loop tears the session down on its way
    /// out.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Process events until shut down.
    pub fn run(&self) {
        session_log!(self, info, "session runner started");
        while !self.shutdown.load(Ordering::Acquire) {
            let next = lock!(self.event_rx).recv_timeout(IO_TIMEOUT);
            let event = match next {
                Ok(SessionEvent::Shutdown) => break,
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    session_log!(self, warn, "event queue disconnected");
                    break;
                }
            };
            self.handle(event);
        }
        self.teardown();
        session_log!(self, info, "session runner stopped");
    }

    fn teardown(&self) {
        if self.state() != FsmState::Idle {
            self.fsm_event(FsmEvent::ManualStop);
        }
        self.clock.stop();
        lock!(self.fsm).timers().stop_all();
        let connections = std::mem::take(&mut *lock!(self.connections));
        for conn in connections.values() {
            conn.close();
        }
        self.registry.unregister(self.config.host.ip());
    }

    fn handle(&self, event: SessionEvent<Cnx>) {
        session_log!(self, debug, "session event: {}", event.title();
            "event" => event.title()
        );
        match event {
            SessionEvent::Admin(e) => self.fsm_event(e.into()),
            SessionEvent::Connected(conn) => {
                self.on_connection(conn, FsmEvent::TcpConnectionRequestAcked)
            }
            SessionEvent::ConnectionConfirmed(conn) => {
                self.on_connection(conn, FsmEvent::TcpConnectionConfirmed)
            }
            SessionEvent::ConnectFailed => {
                self.fsm_event(FsmEvent::TcpConnectionFails(None))
            }
            SessionEvent::Message { id, msg } => self.on_message(id, msg),
            SessionEvent::DecodeError { id, error } => {
                self.on_decode_error(id, error)
            }
            SessionEvent::Closed(id) => self.on_closed(id),
            SessionEvent::Timer(kind) => self.on_timer(kind),
            SessionEvent::Announce(update) => self.announce(update),
            SessionEvent::Shutdown => {}
        }
    }

    /// Hand a new connection to the state machine. Connections it does not
    /// take on are closed.
    fn on_connection(&self, conn: Cnx, event: fn(ConnectionId) -> FsmEvent) {
        let id = conn.id();
        session_log!(self, info, "new {} connection {}", conn.direction(), id;
            "connection" => id.to_string(),
            "remote" => conn.peer(),
            "local" => conn.local()
        );
        lock!(self.connections).insert(id, conn);
        self.fsm_event(event(id));

        if lock!(self.fsm).is_tracked(id) {
            if let Some(conn) = lock!(self.connections).get(&id) {
                conn.start();
            }
        } else if let Some(conn) = lock!(self.connections).remove(&id) {
            session_log!(self, info, "closing untracked connection {}", id);
            conn.close();
        }
    }

    fn channels(&self) -> (Option<ConnectionId>, Option<ConnectionId>) {
        let fsm = lock!(self.fsm);
        (fsm.primary().map(|c| c.id), fsm.secondary().map(|c| c.id))
    }

    fn on_message(&self, id: ConnectionId, msg: Message) {
        let (primary, secondary) = self.channels();
        if secondary == Some(id) {
            self.on_secondary_message(id, msg);
            return;
        }
        if primary != Some(id) {
            session_log!(self, debug,
                "ignoring {} from untracked connection {}", msg.title(), id
            );
            return;
        }

        match msg {
            Message::Open(om) => match validate_open(&self.config, &om) {
                Ok(open) => {
                    self.negotiate_as(id, &om);
                    self.fsm_event(FsmEvent::BgpOpen(id, open));
                }
                Err(e) => {
                    session_log!(self, warn, "bad open from peer: {e}";
                        "message" => format!("{om:?}")
                    );
                    self.fsm_event(FsmEvent::BgpOpenMsgErr(
                        open_notification(&e),
                    ));
                }
            },
            Message::Update(update) => {
                if let Err(n) = check_update(&update) {
                    session_log!(self, warn, "bad update from peer";
                        "notification" => format!("{n:?}")
                    );
                    self.fsm_event(FsmEvent::UpdateMsgErr(n));
                    return;
                }
                let established = self.state() == FsmState::Established;
                self.fsm_event(FsmEvent::UpdateMsg);
                if established {
                    self.publish(&update, RouteSide::Remote);
                }
            }
            Message::Notification(n) => {
                session_log!(self, warn, "notification from peer: {:?} {:?}",
                    n.error_code, n.error_subcode
                );
                self.fsm_event(if n.is_version_error() {
                    FsmEvent::NotifyMsgVerErr
                } else {
                    FsmEvent::NotifyMsg
                });
            }
            Message::KeepAlive => self.fsm_event(FsmEvent::KeepAliveMsg),
            Message::RouteRefresh(rr) => {
                let state = self.state();
                if state != FsmState::Established {
                    session_log!(self, debug,
                        "dropped route refresh in {}", state
                    );
                    return;
                }
                session_log!(self, info,
                    "route refresh request for afi {} safi {}", rr.afi, rr.safi
                );
            }
        }
    }

    /// A collision candidate only ever gets as far as its OPEN. Anything
    /// that ends it is a connection failure.
    fn on_secondary_message(&self, id: ConnectionId, msg: Message) {
        match msg {
            Message::Open(om) => match validate_open(&self.config, &om) {
                Ok(open) => {
                    self.negotiate_as(id, &om);
                    self.fsm_event(FsmEvent::BgpOpen(id, open));
                }
                Err(e) => {
                    session_log!(self, warn,
                        "bad open on collision candidate {}: {e}", id
                    );
                    self.send(id, Message::Notification(open_notification(&e)));
                    self.drop_connection(id);
                    self.fsm_event(FsmEvent::TcpConnectionFails(Some(id)));
                }
            },
            Message::Notification(n) => {
                session_log!(self, info,
                    "notification on collision candidate {}: {:?}",
                    id, n.error_code
                );
                self.drop_connection(id);
                self.fsm_event(FsmEvent::TcpConnectionFails(Some(id)));
            }
            other => {
                session_log!(self, debug,
                    "ignoring {} on collision candidate {}", other.title(), id
                );
            }
        }
    }

    /// Switch decoding of the connection's AS numbers to four octets when
    /// both sides offered the capability.
    fn negotiate_as(&self, id: ConnectionId, om: &OpenMessage) {
        let four = self.config.four_octet_as && om.four_octet_asn().is_some();
        if let Some(conn) = lock!(self.connections).get(&id) {
            conn.set_four_octet_as(four);
        }
    }

    fn on_decode_error(&self, id: ConnectionId, error: Error) {
        let (primary, secondary) = self.channels();
        let notification = error.notification();

        if secondary == Some(id) {
            session_log!(self, warn,
                "decode error on collision candidate {}: {error}", id
            );
            if let Some(n) = notification {
                self.send(id, Message::Notification(n));
            }
            self.drop_connection(id);
            self.fsm_event(FsmEvent::TcpConnectionFails(Some(id)));
            return;
        }
        if primary != Some(id) {
            session_log!(self, debug,
                "ignoring decode error from untracked connection {}", id
            );
            return;
        }

        session_log!(self, warn, "decode error: {error}";
            "connection" => id.to_string()
        );
        let event = match notification {
            Some(n) => match n.error_code {
                ErrorCode::Open => FsmEvent::BgpOpenMsgErr(n),
                ErrorCode::Update => FsmEvent::UpdateMsgErr(n),
                _ => FsmEvent::BgpHeaderErr(n),
            },
            None => FsmEvent::BgpHeaderErr(NotificationMessage::new(
                ErrorCode::Header,
                HeaderErrorSubcode::Unspecific,
            )),
        };
        self.fsm_event(event);
    }

    fn on_closed(&self, id: ConnectionId) {
        lock!(self.connections).remove(&id);
        if lock!(self.fsm).is_tracked(id) {
            session_log!(self, info, "connection {} closed by peer", id);
            self.fsm_event(FsmEvent::TcpConnectionFails(Some(id)));
        }
    }

    fn on_timer(&self, kind: TimerKind) {
        if !lock!(self.fsm).timers().get(kind).take_expired() {
            session_log!(self, debug, "stale {} expiry", kind.as_str());
            return;
        }
        self.fsm_event(kind.into());
    }

    fn announce(&self, update: UpdateMessage) {
        if self.state() != FsmState::Established {
            session_log!(self, warn, "not established, dropping announcement");
            return;
        }
        let (primary, _) = self.channels();
        let Some(id) = primary else {
            return;
        };
        self.send(id, Message::Update(update.clone()));
        self.publish(&update, RouteSide::Local);
    }

    fn publish(&self, update: &UpdateMessage, side: RouteSide) {
        let Some(tx) = &self.routes else {
            return;
        };
        for event in route_events(self.config.host.ip(), side, update) {
            if tx.send(event).is_err() {
                session_log!(self, debug, "route event receiver gone");
                return;
            }
        }
    }

    /// Run one event through the state machine and carry out what it asks
    /// for.
    fn fsm_event(&self, event: FsmEvent) {
        let title = event.title();
        let (from, to, actions, restart) = {
            let mut fsm = lock!(self.fsm);
            let from = fsm.state();
            let actions = fsm.handle_event(event);
            let to = fsm.state();
            let restart = to == FsmState::Idle
                && from != FsmState::Idle
                && !fsm.timers().idle_hold.is_running()
                && !fsm.stopped_manually();
            (from, to, actions, restart)
        };
        *lock!(self.state) = to;

        if from != to {
            session_log!(self, info, "{} -> {}", from, to;
                "event" => title
            );
        } else if actions.is_empty() {
            session_log!(self, debug, "{} had no effect", title);
        }

        for action in actions {
            self.execute(action);
        }

        if restart {
            let peer = self.config.host.ip();
            let due = Instant::now() + self.reconnects.delay();
            session_log!(self, info, "scheduling reconnect";
                "delay_ms" => self.reconnects.delay().as_millis() as u64
            );
            self.reconnects.schedule(peer, due);
        }
    }

    fn execute(&self, action: FsmAction) {
        match action {
            FsmAction::ConnectRemotePeer => self.connect(),
            FsmAction::DisconnectRemotePeer(id) => self.drop_connection(id),
            FsmAction::SendOpen(id) => {
                self.send(id, Message::Open(self.open_message()))
            }
            FsmAction::SendKeepalive(id) => self.send(id, Message::KeepAlive),
            FsmAction::SendHoldTimerExpiredNotification(id) => self.send(
                id,
                Message::Notification(NotificationMessage::new(
                    ErrorCode::HoldTimerExpired,
                    ErrorSubcode::HoldTime(0),
                )),
            ),
            FsmAction::SendInternalErrorNotification(id) => self.send(
                id,
                Message::Notification(NotificationMessage::new(
                    ErrorCode::Fsm,
                    ErrorSubcode::Fsm(0),
                )),
            ),
            FsmAction::SendCeaseNotification(id, subcode) => self.send(
                id,
                Message::Notification(NotificationMessage::cease(subcode)),
            ),
            FsmAction::SendUpdateErrorNotification(id, n)
            | FsmAction::SendErrorNotification(id, n) => {
                self.send(id, Message::Notification(n))
            }
            FsmAction::CompleteLocalInitialization => {
                session_log!(self, debug, "local initialization complete");
            }
            FsmAction::CompletePeerInitialization => {
                session_log!(self, debug, "peer initialization complete");
            }
            FsmAction::Established => {
                session_log!(self, info, "session established";
                    "hold_time" => format!("{:?}", lock!(self.fsm).negotiated_hold())
                );
                self.registry.register(self.config.host.ip());
            }
            FsmAction::ReleaseResources => {
                self.registry.unregister(self.config.host.ip());
                let connections =
                    std::mem::take(&mut *lock!(self.connections));
                for conn in connections.values() {
                    conn.close();
                }
            }
        }
    }

    fn connect(&self) {
        session_log!(self, debug, "connecting to peer");
        if let Err(e) = Cnx::Connector::connect(
            self.config.src_addr,
            self.config.host,
            CONNECT_TIMEOUT,
            self.log.clone(),
            self.event_tx.clone(),
        ) {
            session_log!(self, warn, "connect: {e}");
            if let Err(e) = self.event_tx.send(SessionEvent::ConnectFailed) {
                session_log!(self, error, "queue connect failure: {e}");
            }
        }
    }

    fn drop_connection(&self, id: ConnectionId) {
        if let Some(conn) = lock!(self.connections).remove(&id) {
            session_log!(self, debug, "disconnecting {}", id);
            conn.close();
        }
    }

    fn send(&self, id: ConnectionId, msg: Message) {
        let connections = lock!(self.connections);
        let Some(conn) = connections.get(&id) else {
            session_log!(self, debug,
                "not sending {}, connection {} gone", msg.title(), id
            );
            return;
        };
        if let Err(e) = conn.send(&msg) {
            session_log!(self, warn, "send {} on {}: {e}", msg.title(), id);
        }
    }

    fn open_message(&self) -> OpenMessage {
        let hold = u16::try_from(self.config.hold_time).unwrap_or(u16::MAX);
        let mut om = if self.config.four_octet_as {
            OpenMessage::new4(self.asn, hold, self.id)
        } else {
            OpenMessage::new2(
                u16::try_from(self.asn).unwrap_or(AS_TRANS),
                hold,
                self.id,
            )
        };
        let mut capabilities: Vec<Capability> = self
            .config
            .multiprotocol
            .iter()
            .map(|af| Capability::MultiprotocolExtensions {
                afi: af.afi,
                safi: af.safi,
            })
            .collect();
        if self.config.route_refresh {
            capabilities.push(Capability::RouteRefresh);
        }
        om.add_capabilities(&capabilities);
        om
    }
}

/// Check a peer's OPEN against its configuration.
fn validate_open(
    config: &PeerConfig,
    om: &OpenMessage,
) -> Result<PeerOpen, Error> {
    let asn = om.effective_asn();
    if asn != config.remote_asn {
        return Err(Error::BadPeerAs(ExpectationMismatch {
            expected: config.remote_asn,
            got: asn,
        }));
    }
    if om.hold_time == 1 || om.hold_time == 2 {
        return Err(Error::UnacceptableHoldTime(om.hold_time));
    }
    if let Some(expected) = config.remote_id {
        if om.id != expected {
            return Err(Error::BadBgpIdentifier(Ipv4Addr::from(om.id)));
        }
    }
    Ok(PeerOpen {
        hold_time: om.hold_time,
        id: om.id,
    })
}

fn open_notification(e: &Error) -> NotificationMessage {
    e.notification().unwrap_or_else(|| {
        NotificationMessage::new(ErrorCode::Open, OpenErrorSubcode::Unspecific)
    })
}

/// An UPDATE that announces IPv4 NLRI must carry ORIGIN, AS_PATH and
/// NEXT_HOP. The notification data is the type code of the first missing
/// attribute.
fn check_update(update: &UpdateMessage) -> Result<(), NotificationMessage> {
    if update.nlri.is_empty() {
        return Ok(());
    }
    let has = |f: fn(&PathAttributeValue) -> bool| {
        update.path_attributes.iter().any(|a| f(&a.value))
    };
    let required: [(PathAttributeTypeCode, fn(&PathAttributeValue) -> bool);
        3] = [
        (PathAttributeTypeCode::Origin, |v| {
            matches!(v, PathAttributeValue::Origin(_))
        }),
        (PathAttributeTypeCode::AsPath, |v| {
            matches!(
                v,
                PathAttributeValue::AsPath(_) | PathAttributeValue::AsPath4(_)
            )
        }),
        (PathAttributeTypeCode::NextHop, |v| {
            matches!(v, PathAttributeValue::NextHop(_))
        }),
    ];
    for (code, present) in required {
        if !has(present) {
            let mut n = NotificationMessage::new(
                ErrorCode::Update,
                UpdateErrorSubcode::MissingWellKnownAttribute,
            );
            n.data = vec![code as u8];
            return Err(n);
        }
    }
    Ok(())
}

/// The RIB events an UPDATE produces, withdrawals first.
fn route_events(
    peer: IpAddr,
    side: RouteSide,
    update: &UpdateMessage,
) -> Vec<RouteEvent> {
    let withdrawn =
        update
            .withdrawn_routes()
            .into_iter()
            .map(|(af, nlri)| RouteEvent::Withdrawn {
                peer,
                side,
                afi: af.afi,
                safi: af.safi,
                nlri,
                attributes: Vec::new(),
            });
    let added =
        update
            .announced()
            .into_iter()
            .map(|(af, nlri)| RouteEvent::Added {
                peer,
                side,
                afi: af.afi,
                safi: af.safi,
                nlri,
                attributes: update.path_attributes.clone(),
            });
    withdrawn.chain(added).collect()
}
