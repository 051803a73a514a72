// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BGP finite state machine of RFC 4271 §8.
//!
//! [`Fsm::handle_event`] consumes one event and returns the actions the
//! caller must carry out. The machine itself performs no I/O. It starts and
//! stops the timers in its [`ClockTimers`], which a [`crate::clock::Clock`]
//! turns back into expiry events.

use crate::clock::{ClockTimers, TimerKind, TimerState};
use crate::connection::{ConnectionId, Direction};
use crate::messages::{CeaseErrorSubcode, NotificationMessage};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Hold time used while waiting for the peer's OPEN.
///
/// Ref: RFC 4271 §8.2.2
pub const LARGE_HOLD_TIME: Duration = Duration::from_secs(240);

/// Upper bound on the idle hold backoff, as a multiple of the configured
/// idle hold time.
pub const MAX_IDLE_HOLD_MULTIPLIER: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Refuse all incoming connections. No resources allocated to the peer.
    Idle,

    /// Waiting for an outbound connection to complete.
    Connect,

    /// Listening for an inbound connection.
    Active,

    /// OPEN sent, waiting for the peer's OPEN.
    OpenSent,

    /// OPENs exchanged, waiting for KEEPALIVE or NOTIFICATION.
    OpenConfirm,

    /// Able to exchange UPDATE, NOTIFICATION and KEEPALIVE messages.
    Established,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connect => "connect",
            Self::Active => "active",
            Self::OpenSent => "open sent",
            Self::OpenConfirm => "open confirm",
            Self::Established => "established",
        }
    }
}

impl Display for FsmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The parts of a received OPEN the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOpen {
    pub hold_time: u16,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    /// The administrator starts the peer.
    ManualStart,

    /// The local system starts the peer.
    AutomaticStart,

    /// The administrator stops the peer.
    ManualStop,

    /// The local system stops the peer.
    AutomaticStop,

    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    DelayOpenTimerExpires,
    IdleHoldTimerExpires,

    /// An outbound connection completed.
    TcpConnectionConfirmed(ConnectionId),

    /// An inbound connection was accepted.
    TcpConnectionRequestAcked(ConnectionId),

    /// A tracked connection failed, or with `None` an outbound attempt failed
    /// before a connection existed.
    TcpConnectionFails(Option<ConnectionId>),

    /// A valid OPEN arrived on a connection.
    BgpOpen(ConnectionId, PeerOpen),

    /// OPEN failed validation. Carries the NOTIFICATION to send.
    BgpOpenMsgErr(NotificationMessage),

    /// A message header failed validation. Carries the NOTIFICATION to send.
    BgpHeaderErr(NotificationMessage),

    NotifyMsg,

    /// A NOTIFICATION reporting an unsupported version number.
    NotifyMsgVerErr,

    KeepAliveMsg,
    UpdateMsg,

    /// An UPDATE failed validation. Carries the NOTIFICATION to send.
    UpdateMsgErr(NotificationMessage),
}

impl FsmEvent {
    pub fn title(&self) -> &'static str {
        match self {
            Self::ManualStart => "manual start",
            Self::AutomaticStart => "automatic start",
            Self::ManualStop => "manual stop",
            Self::AutomaticStop => "automatic stop",
            Self::ConnectRetryTimerExpires => "connect retry timer expires",
            Self::HoldTimerExpires => "hold timer expires",
            Self::KeepaliveTimerExpires => "keepalive timer expires",
            Self::DelayOpenTimerExpires => "delay open timer expires",
            Self::IdleHoldTimerExpires => "idle hold timer expires",
            Self::TcpConnectionConfirmed(_) => "tcp connection confirmed",
            Self::TcpConnectionRequestAcked(_) => "tcp connection acked",
            Self::TcpConnectionFails(_) => "tcp connection fails",
            Self::BgpOpen(..) => "bgp open",
            Self::BgpOpenMsgErr(_) => "open message error",
            Self::BgpHeaderErr(_) => "header error",
            Self::NotifyMsg => "notification",
            Self::NotifyMsgVerErr => "notification version error",
            Self::KeepAliveMsg => "keepalive",
            Self::UpdateMsg => "update",
            Self::UpdateMsgErr(_) => "update message error",
        }
    }
}

impl From<TimerKind> for FsmEvent {
    fn from(kind: TimerKind) -> Self {
        match kind {
            TimerKind::ConnectRetry => Self::ConnectRetryTimerExpires,
            TimerKind::Hold => Self::HoldTimerExpires,
            TimerKind::Keepalive => Self::KeepaliveTimerExpires,
            TimerKind::DelayOpen => Self::DelayOpenTimerExpires,
            TimerKind::IdleHold => Self::IdleHoldTimerExpires,
        }
    }
}

/// Work the state machine hands back to the session runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmAction {
    ConnectRemotePeer,
    DisconnectRemotePeer(ConnectionId),
    SendOpen(ConnectionId),
    SendKeepalive(ConnectionId),
    SendHoldTimerExpiredNotification(ConnectionId),
    SendInternalErrorNotification(ConnectionId),
    SendCeaseNotification(ConnectionId, CeaseErrorSubcode),
    SendUpdateErrorNotification(ConnectionId, NotificationMessage),
    SendErrorNotification(ConnectionId, NotificationMessage),
    CompleteLocalInitialization,
    CompletePeerInitialization,
    Established,
    ReleaseResources,
}

#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub local_id: u32,
    pub passive: bool,
    pub hold_time: Duration,
    pub idle_hold_time: Duration,
    pub delay_open: bool,
    pub damp_peer_oscillations: bool,
    pub collision_detect_established: bool,
}

/// A connection tracked by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub id: ConnectionId,
    pub direction: Direction,
    pub open_sent: bool,
}

impl Channel {
    fn new(id: ConnectionId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            open_sent: false,
        }
    }
}

enum Counter {
    Reset,
    Keep,
    Increment,
}

pub struct Fsm {
    config: FsmConfig,
    state: FsmState,
    connect_retry_counter: u32,
    timers: ClockTimers,
    primary: Option<Channel>,
    secondary: Option<Channel>,
    negotiated_hold: Option<Duration>,
    remote_id: Option<u32>,
    damped_failures: u32,
    last_stop_manual: bool,
}

impl Fsm {
    pub fn new(config: FsmConfig, timers: ClockTimers) -> Self {
        Self {
            config,
            state: FsmState::Idle,
            connect_retry_counter: 0,
            timers,
            primary: None,
            secondary: None,
            negotiated_hold: None,
            remote_id: None,
            damped_failures: 0,
            last_stop_manual: false,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn connect_retry_counter(&self) -> u32 {
        self.connect_retry_counter
    }

    pub fn timers(&self) -> &ClockTimers {
        &self.timers
    }

    pub fn primary(&self) -> Option<Channel> {
        self.primary
    }

    pub fn secondary(&self) -> Option<Channel> {
        self.secondary
    }

    pub fn is_tracked(&self, id: ConnectionId) -> bool {
        self.channel(id).is_some()
    }

    /// DelayOpen counts as pending until the session consumes its expiry.
    fn delay_open_pending(&self) -> bool {
        !matches!(self.timers.delay_open.state(), TimerState::Stopped)
    }

    /// The hold time agreed with the peer, once OPENs have been exchanged.
    pub fn negotiated_hold(&self) -> Option<Duration> {
        self.negotiated_hold
    }

    /// The BGP identifier from the peer's OPEN.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    /// True when the last transition to Idle came from a manual stop.
    pub fn stopped_manually(&self) -> bool {
        self.last_stop_manual
    }

    pub fn handle_event(&mut self, event: FsmEvent) -> Vec<FsmAction> {
        let mut actions = Vec::new();
        match self.state {
            FsmState::Idle => self.idle(event, &mut actions),
            FsmState::Connect | FsmState::Active => {
                self.connect_or_active(event, &mut actions)
            }
            FsmState::OpenSent => self.open_sent(event, &mut actions),
            FsmState::OpenConfirm => self.open_confirm(event, &mut actions),
            FsmState::Established => self.established(event, &mut actions),
        }
        actions
    }

    fn idle(&mut self, event: FsmEvent, actions: &mut Vec<FsmAction>) {
        match event {
            FsmEvent::ManualStart => {
                self.timers.idle_hold.stop();
                self.start(actions);
            }
            FsmEvent::AutomaticStart => {
                if !self.timers.idle_hold.is_running() {
                    self.start(actions);
                }
            }
            FsmEvent::IdleHoldTimerExpires => {
                self.timers.idle_hold.stop();
                self.start(actions);
            }
            FsmEvent::ManualStop => {
                self.timers.idle_hold.stop();
                self.connect_retry_counter = 0;
                self.damped_failures = 0;
                self.last_stop_manual = true;
            }
            _ => {}
        }
    }

    fn start(&mut self, actions: &mut Vec<FsmAction>) {
        self.connect_retry_counter = 0;
        self.last_stop_manual = false;
        actions.push(FsmAction::CompleteLocalInitialization);
        self.timers.connect_retry.start();
        if self.config.passive {
            self.state = FsmState::Active;
        } else {
            actions.push(FsmAction::ConnectRemotePeer);
            self.state = FsmState::Connect;
        }
    }

    fn connect_or_active(
        &mut self,
        event: FsmEvent,
        actions: &mut Vec<FsmAction>,
    ) {
        match event {
            FsmEvent::ManualStart | FsmEvent::AutomaticStart => {}
            FsmEvent::ManualStop => self.manual_stop(actions, false),
            FsmEvent::AutomaticStop => {
                self.to_idle(actions, Counter::Increment, None, true)
            }
            FsmEvent::ConnectRetryTimerExpires => {
                if self.state == FsmState::Connect {
                    self.connect_retry_counter += 1;
                }
                self.timers.connect_retry.start();
                actions.push(FsmAction::ConnectRemotePeer);
                self.state = FsmState::Connect;
            }
            FsmEvent::TcpConnectionConfirmed(id) => {
                self.connection_before_open(id, Direction::Active, actions)
            }
            FsmEvent::TcpConnectionRequestAcked(id) => {
                self.connection_before_open(id, Direction::Connected, actions)
            }
            FsmEvent::DelayOpenTimerExpires if self.primary.is_some() => {
                for c in [&mut self.primary, &mut self.secondary]
                    .into_iter()
                    .flatten()
                {
                    actions.push(FsmAction::SendOpen(c.id));
                    c.open_sent = true;
                }
                self.timers.hold.start_with(LARGE_HOLD_TIME);
                self.state = FsmState::OpenSent;
            }
            FsmEvent::BgpOpen(id, open)
                if self.delay_open_pending() && self.is_tracked(id) =>
            {
                if let Some(other) = self.other_channel(id) {
                    actions.push(FsmAction::DisconnectRemotePeer(other.id));
                }
                self.promote(id);
                self.timers.connect_retry.stop();
                self.timers.delay_open.stop();
                actions.push(FsmAction::SendOpen(id));
                if let Some(c) = self.primary.as_mut() {
                    c.open_sent = true;
                }
                actions.push(FsmAction::SendKeepalive(id));
                self.accept_open(open, actions);
                self.state = FsmState::OpenConfirm;
            }
            FsmEvent::TcpConnectionFails(failed) => {
                self.connection_fails_before_open(failed, actions)
            }
            FsmEvent::NotifyMsgVerErr => {
                self.to_idle(actions, Counter::Keep, None, true)
            }
            _ => self.to_idle(actions, Counter::Increment, None, true),
        }
    }

    fn connection_before_open(
        &mut self,
        id: ConnectionId,
        direction: Direction,
        actions: &mut Vec<FsmAction>,
    ) {
        let Some(held) = self.primary else {
            self.primary = Some(Channel::new(id, direction));
            self.timers.connect_retry.stop();
            if self.config.delay_open {
                self.timers.delay_open.start();
            } else {
                actions.push(FsmAction::SendOpen(id));
                if let Some(c) = self.primary.as_mut() {
                    c.open_sent = true;
                }
                self.timers.hold.start_with(LARGE_HOLD_TIME);
                self.state = FsmState::OpenSent;
            }
            return;
        };
        if held.direction == direction {
            actions.push(FsmAction::DisconnectRemotePeer(held.id));
            self.primary = Some(Channel::new(id, direction));
        } else if self.secondary.is_none() {
            self.secondary = Some(Channel::new(id, direction));
        } else {
            actions.push(FsmAction::DisconnectRemotePeer(id));
        }
    }

    fn connection_fails_before_open(
        &mut self,
        failed: Option<ConnectionId>,
        actions: &mut Vec<FsmAction>,
    ) {
        let Some(id) = failed else {
            // An outbound attempt failed while another connection is held.
            if self.primary.is_some() {
                return;
            }
            self.connection_failed(None, actions);
            return;
        };
        if self.secondary.map(|c| c.id) == Some(id) {
            self.secondary = None;
            return;
        }
        if self.primary.map(|c| c.id) != Some(id) {
            return;
        }
        if self.state == FsmState::Connect && self.delay_open_pending() {
            self.primary = self.secondary.take();
            self.timers.connect_retry.start();
            self.timers.delay_open.stop();
            self.state = FsmState::Active;
            return;
        }
        self.connection_failed(Some(id), actions);
    }

    /// A connection failure in Connect or Active. Damping peers wait out the
    /// idle hold timer instead of counting the failure.
    fn connection_failed(
        &mut self,
        failed: Option<ConnectionId>,
        actions: &mut Vec<FsmAction>,
    ) {
        let counter = if self.config.damp_peer_oscillations {
            Counter::Keep
        } else {
            Counter::Increment
        };
        self.to_idle(actions, counter, failed, true);
    }

    fn open_sent(&mut self, event: FsmEvent, actions: &mut Vec<FsmAction>) {
        match event {
            FsmEvent::TcpConnectionConfirmed(id) => {
                self.collision_candidate(id, Direction::Active, actions)
            }
            FsmEvent::TcpConnectionRequestAcked(id) => {
                self.collision_candidate(id, Direction::Connected, actions)
            }
            FsmEvent::TcpConnectionFails(Some(id)) => {
                if self.secondary.map(|c| c.id) == Some(id) {
                    self.secondary = None;
                } else if self.primary.map(|c| c.id) == Some(id) {
                    if self.secondary.is_some() {
                        self.primary = self.secondary.take();
                    } else {
                        self.primary = None;
                        self.timers.connect_retry.start();
                        self.timers.hold.stop();
                        self.state = FsmState::Active;
                    }
                }
            }
            FsmEvent::TcpConnectionFails(None) => {}
            FsmEvent::BgpOpen(id, open) => {
                if !self.is_tracked(id) {
                    return;
                }
                if self.secondary.is_some() {
                    let Some(survivor) = self.resolve_collision(open, actions)
                    else {
                        return;
                    };
                    if survivor != id {
                        return;
                    }
                }
                self.promote(id);
                actions.push(FsmAction::SendKeepalive(id));
                self.accept_open(open, actions);
                self.state = FsmState::OpenConfirm;
            }
            FsmEvent::ConnectRetryTimerExpires
            | FsmEvent::KeepaliveTimerExpires
            | FsmEvent::DelayOpenTimerExpires
            | FsmEvent::IdleHoldTimerExpires
            | FsmEvent::KeepAliveMsg
            | FsmEvent::UpdateMsg
            | FsmEvent::UpdateMsgErr(_) => self.internal_error(actions),
            other => self.after_open_common(other, actions),
        }
    }

    fn open_confirm(&mut self, event: FsmEvent, actions: &mut Vec<FsmAction>) {
        match event {
            FsmEvent::KeepaliveTimerExpires => {
                if let Some(p) = self.primary {
                    actions.push(FsmAction::SendKeepalive(p.id));
                }
                self.timers.keepalive.start();
            }
            FsmEvent::KeepAliveMsg => {
                self.restart_hold();
                if let Some(s) = self.secondary.take() {
                    actions.push(FsmAction::SendCeaseNotification(
                        s.id,
                        CeaseErrorSubcode::ConnectionCollisionResolution,
                    ));
                    actions.push(FsmAction::DisconnectRemotePeer(s.id));
                }
                self.damped_failures = 0;
                actions.push(FsmAction::Established);
                self.state = FsmState::Established;
            }
            FsmEvent::TcpConnectionConfirmed(id) => {
                self.collision_candidate(id, Direction::Active, actions)
            }
            FsmEvent::TcpConnectionRequestAcked(id) => {
                self.collision_candidate(id, Direction::Connected, actions)
            }
            FsmEvent::TcpConnectionFails(Some(id)) => {
                if self.secondary.map(|c| c.id) == Some(id) {
                    self.secondary = None;
                } else if self.primary.map(|c| c.id) == Some(id) {
                    self.to_idle(actions, Counter::Keep, Some(id), true);
                }
            }
            FsmEvent::TcpConnectionFails(None) => {}
            FsmEvent::BgpOpen(id, open) => {
                if self.secondary.map(|c| c.id) == Some(id) {
                    let Some(survivor) = self.resolve_collision(open, actions)
                    else {
                        return;
                    };
                    if survivor == id {
                        self.promote(id);
                        actions.push(FsmAction::SendKeepalive(id));
                        self.accept_open(open, actions);
                    }
                } else if self.primary.map(|c| c.id) == Some(id) {
                    self.internal_error(actions);
                }
            }
            FsmEvent::ConnectRetryTimerExpires
            | FsmEvent::DelayOpenTimerExpires
            | FsmEvent::IdleHoldTimerExpires
            | FsmEvent::UpdateMsg
            | FsmEvent::UpdateMsgErr(_) => self.internal_error(actions),
            other => self.after_open_common(other, actions),
        }
    }

    fn established(&mut self, event: FsmEvent, actions: &mut Vec<FsmAction>) {
        match event {
            FsmEvent::KeepaliveTimerExpires => {
                if let Some(p) = self.primary {
                    actions.push(FsmAction::SendKeepalive(p.id));
                }
                self.timers.keepalive.start();
            }
            FsmEvent::KeepAliveMsg | FsmEvent::UpdateMsg => {
                self.restart_hold()
            }
            FsmEvent::UpdateMsgErr(n) => {
                if let Some(p) = self.primary {
                    actions.push(FsmAction::SendUpdateErrorNotification(p.id, n));
                }
                self.to_idle(actions, Counter::Increment, None, true);
            }
            FsmEvent::TcpConnectionConfirmed(id)
            | FsmEvent::TcpConnectionRequestAcked(id)
                if !self.config.collision_detect_established =>
            {
                actions.push(FsmAction::SendCeaseNotification(
                    id,
                    CeaseErrorSubcode::ConnectionRejected,
                ));
                actions.push(FsmAction::DisconnectRemotePeer(id));
            }
            FsmEvent::TcpConnectionConfirmed(id) => {
                self.collision_candidate(id, Direction::Active, actions)
            }
            FsmEvent::TcpConnectionRequestAcked(id) => {
                self.collision_candidate(id, Direction::Connected, actions)
            }
            FsmEvent::TcpConnectionFails(Some(id)) => {
                if self.secondary.map(|c| c.id) == Some(id) {
                    self.secondary = None;
                } else if self.primary.map(|c| c.id) == Some(id) {
                    self.to_idle(actions, Counter::Keep, Some(id), true);
                }
            }
            FsmEvent::TcpConnectionFails(None) => {}
            FsmEvent::BgpOpen(id, open) => {
                if self.secondary.map(|c| c.id) == Some(id) {
                    let primary = self.primary.map(|c| c.id);
                    let Some(survivor) = self.resolve_collision(open, actions)
                    else {
                        return;
                    };
                    if Some(survivor) != primary {
                        // The established connection lost.
                        self.to_idle(actions, Counter::Increment, None, true);
                    }
                } else if self.primary.map(|c| c.id) == Some(id) {
                    self.internal_error(actions);
                }
            }
            FsmEvent::ConnectRetryTimerExpires
            | FsmEvent::DelayOpenTimerExpires
            | FsmEvent::IdleHoldTimerExpires => self.internal_error(actions),
            other => self.after_open_common(other, actions),
        }
    }

    /// Events handled the same way in OpenSent, OpenConfirm and Established.
    fn after_open_common(
        &mut self,
        event: FsmEvent,
        actions: &mut Vec<FsmAction>,
    ) {
        match event {
            FsmEvent::ManualStart | FsmEvent::AutomaticStart => {}
            FsmEvent::ManualStop => self.manual_stop(actions, true),
            FsmEvent::AutomaticStop => {
                self.cease_all(CeaseErrorSubcode::Unspecific, actions);
                self.to_idle(actions, Counter::Increment, None, true);
            }
            FsmEvent::HoldTimerExpires => {
                if let Some(p) = self.primary {
                    actions
                        .push(FsmAction::SendHoldTimerExpiredNotification(p.id));
                }
                self.to_idle(actions, Counter::Increment, None, true);
            }
            FsmEvent::BgpHeaderErr(n) | FsmEvent::BgpOpenMsgErr(n) => {
                if let Some(p) = self.primary {
                    actions.push(FsmAction::SendErrorNotification(p.id, n));
                }
                self.to_idle(actions, Counter::Increment, None, true);
            }
            FsmEvent::NotifyMsgVerErr => {
                self.to_idle(actions, Counter::Keep, None, true)
            }
            FsmEvent::NotifyMsg => {
                self.to_idle(actions, Counter::Increment, None, true)
            }
            _ => self.internal_error(actions),
        }
    }

    fn manual_stop(&mut self, actions: &mut Vec<FsmAction>, cease: bool) {
        if cease {
            self.cease_all(CeaseErrorSubcode::AdministrativeShutdown, actions);
        }
        self.damped_failures = 0;
        self.to_idle(actions, Counter::Reset, None, false);
        self.timers.idle_hold.stop();
        self.last_stop_manual = true;
    }

    fn cease_all(
        &self,
        subcode: CeaseErrorSubcode,
        actions: &mut Vec<FsmAction>,
    ) {
        for c in self.channels() {
            actions.push(FsmAction::SendCeaseNotification(c.id, subcode));
        }
    }

    fn internal_error(&mut self, actions: &mut Vec<FsmAction>) {
        for c in self.channels() {
            actions.push(FsmAction::SendInternalErrorNotification(c.id));
        }
        self.to_idle(actions, Counter::Increment, None, true);
    }

    /// Track a connection that arrived after our OPEN went out. It is sent
    /// an OPEN of its own and competes with the primary once the peer's
    /// OPEN arrives on it.
    fn collision_candidate(
        &mut self,
        id: ConnectionId,
        direction: Direction,
        actions: &mut Vec<FsmAction>,
    ) {
        if self.secondary.is_some() {
            actions.push(FsmAction::DisconnectRemotePeer(id));
            return;
        }
        let mut c = Channel::new(id, direction);
        actions.push(FsmAction::SendOpen(id));
        c.open_sent = true;
        self.secondary = Some(c);
    }

    /// Close one of the two tracked connections per RFC 4271 §6.8 using the
    /// identifier from the colliding OPEN. Returns the surviving connection,
    /// now the primary.
    fn resolve_collision(
        &mut self,
        open: PeerOpen,
        actions: &mut Vec<FsmAction>,
    ) -> Option<ConnectionId> {
        let (primary, secondary) = (self.primary?, self.secondary?);
        let doomed = if self.config.local_id < open.id {
            Direction::Active
        } else {
            Direction::Connected
        };
        let (loser, survivor) = if secondary.direction == doomed {
            (secondary, primary)
        } else if primary.direction == doomed {
            (primary, secondary)
        } else {
            (secondary, primary)
        };
        actions.push(FsmAction::SendCeaseNotification(
            loser.id,
            CeaseErrorSubcode::ConnectionCollisionResolution,
        ));
        actions.push(FsmAction::DisconnectRemotePeer(loser.id));
        self.primary = Some(survivor);
        self.secondary = None;
        Some(survivor.id)
    }

    /// Record the peer's OPEN and negotiate the hold and keepalive times.
    fn accept_open(&mut self, open: PeerOpen, actions: &mut Vec<FsmAction>) {
        actions.push(FsmAction::CompletePeerInitialization);
        self.remote_id = Some(open.id);
        let hold = self
            .config
            .hold_time
            .min(Duration::from_secs(u64::from(open.hold_time)));
        self.negotiated_hold = Some(hold);
        if hold.is_zero() {
            self.timers.hold.stop();
            self.timers.keepalive.stop();
        } else {
            self.timers.hold.start_with(hold);
            self.timers.keepalive.start_with(hold / 3);
        }
    }

    fn restart_hold(&self) {
        if self.negotiated_hold.is_some_and(|h| !h.is_zero()) {
            self.timers.hold.start();
        }
    }

    /// Make `id` the only tracked channel.
    fn promote(&mut self, id: ConnectionId) {
        if let Some(c) = self.channel(id) {
            self.primary = Some(c);
            self.secondary = None;
        }
    }

    fn channel(&self, id: ConnectionId) -> Option<Channel> {
        self.channels().find(|c| c.id == id)
    }

    fn other_channel(&self, id: ConnectionId) -> Option<Channel> {
        self.channels().find(|c| c.id != id)
    }

    fn channels(&self) -> impl Iterator<Item = Channel> {
        self.primary.into_iter().chain(self.secondary)
    }

    /// The idle hold interval after `n` consecutive damped failures.
    pub fn idle_hold_backoff(base: Duration, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(MAX_IDLE_HOLD_MULTIPLIER.ilog2());
        base.saturating_mul(1 << exp)
    }

    /// The uniform path back to Idle.
    fn to_idle(
        &mut self,
        actions: &mut Vec<FsmAction>,
        counter: Counter,
        failed: Option<ConnectionId>,
        failure: bool,
    ) {
        self.timers.connect_retry.stop();
        self.timers.hold.stop();
        self.timers.keepalive.stop();
        self.timers.delay_open.stop();
        if failure && self.config.damp_peer_oscillations {
            self.damped_failures = self.damped_failures.saturating_add(1);
            self.timers.idle_hold.start_with(Self::idle_hold_backoff(
                self.config.idle_hold_time,
                self.damped_failures,
            ));
        }
        for c in self.channels() {
            if Some(c.id) != failed {
                actions.push(FsmAction::DisconnectRemotePeer(c.id));
            }
        }
        actions.push(FsmAction::ReleaseResources);
        self.primary = None;
        self.secondary = None;
        self.negotiated_hold = None;
        self.remote_id = None;
        match counter {
            Counter::Reset => self.connect_retry_counter = 0,
            Counter::Keep => {}
            Counter::Increment => self.connect_retry_counter += 1,
        }
        self.last_stop_manual = false;
        self.state = FsmState::Idle;
    }
}
