// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::Message;
use crate::session::SessionEvent;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one transport connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "cnx-{}", self.0)
    }
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from the peer by the dispatcher.
    Connected,

    /// Initiated locally by a connector.
    Active,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Active => "active",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event queues of the running sessions, indexed by peer address.
pub type SessionMap<Cnx> =
    Arc<Mutex<BTreeMap<IpAddr, Sender<SessionEvent<Cnx>>>>>;

/// A framed BGP message stream to one peer.
///
/// A connection owns a receive thread that decodes messages and reports them
/// to its session as [`SessionEvent::Message`], [`SessionEvent::DecodeError`]
/// or [`SessionEvent::Closed`]. The thread does not run until
/// [`BgpConnection::start`] is called.
pub trait BgpConnection: Sized + Send + 'static {
    type Connector: BgpConnector<Self>;

    fn id(&self) -> ConnectionId;
    fn peer(&self) -> SocketAddr;
    fn local(&self) -> SocketAddr;
    fn direction(&self) -> Direction;

    /// Frame and write one message.
    fn send(&self, msg: &Message) -> Result<(), Error>;

    /// Start the receive thread. Starting twice is a no-op.
    fn start(&self);

    /// Tear down the stream. The receive thread exits without reporting a
    /// close.
    fn close(&self);

    /// Decode AS_PATH and AGGREGATOR with 4-octet AS numbers from now on.
    fn set_four_octet_as(&self, enabled: bool);
}

pub trait BgpListener<Cnx: BgpConnection> {
    fn bind<A: ToSocketAddrs>(addr: A, log: Logger) -> Result<Self, Error>
    where
        Self: Sized;

    /// Wait up to `timeout` for an inbound connection. Connections from
    /// addresses without a session are refused with [`Error::UnknownPeer`].
    fn accept(
        &self,
        sessions: SessionMap<Cnx>,
        timeout: Duration,
    ) -> Result<Cnx, Error>;
}

pub trait BgpConnector<Cnx: BgpConnection> {
    /// Begin a connection attempt in its own thread. The outcome arrives on
    /// `event_tx` as [`SessionEvent::ConnectionConfirmed`] or
    /// [`SessionEvent::ConnectFailed`].
    fn connect(
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
        log: Logger,
        event_tx: Sender<SessionEvent<Cnx>>,
    ) -> Result<JoinHandle<()>, Error>;
}
