// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// This file contains code for testing purposes only. Note that it's only
/// included in `lib.rs` with a `#[cfg(test)]` guard. It implements the
/// connection traits over a simulated network so sessions can be tested
/// without sockets. Messages travel as encoded frames, so the codec is
/// exercised the same way it is over TCP.
use crate::{
    connection::{
        BgpConnection, BgpConnector, BgpListener, ConnectionId, Direction,
        SessionMap,
    },
    error::Error,
    log::{connection_log, connection_log_lite},
    messages::{Header, Message},
    session::SessionEvent,
    IO_TIMEOUT,
};
use slog::Logger;
use speaker_common::lock;
use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel as mpsc_channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::Duration,
};

const UNIT_CONNECTION: &str = "connection_channel";

lazy_static! {
    static ref NET: Network = Network::new();
}

type Frame = Vec<u8>;

/// A simulated network that maps socket addresses to channels that can send
/// connection requests to listeners for those addresses.
pub struct Network {
    #[allow(clippy::type_complexity)]
    pub endpoints:
        Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint<Frame>)>>>,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for sockaddr in lock!(self.endpoints).keys() {
            write!(f, "{sockaddr:?}")?;
        }
        write!(f, "}}")?;
        Ok(())
    }
}

/// A listener that can listen for connections on our simulated network.
struct Listener {
    rx: Receiver<(SocketAddr, Endpoint<Frame>)>,
}

impl Listener {
    fn accept(
        &self,
        timeout: Duration,
    ) -> Result<(SocketAddr, Endpoint<Frame>), Error> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }
}

// NOTE: this is not designed to be a full fidelity TCP/IP drop in. It gives
// us enough functionality to pass messages between speakers to test
// session behavior above connection tracking.
impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn bind(&self, sa: SocketAddr) -> Listener {
        let (tx, rx) = mpsc_channel();
        lock!(self.endpoints).insert(sa, tx);
        Listener { rx }
    }

    /// Hand `ep` to the listener at `to` along with our `from` address.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        ep: Endpoint<Frame>,
    ) -> Result<(), Error> {
        match lock!(self.endpoints).get(&to) {
            None => return Err(Error::ChannelConnect),
            Some(sender) => {
                sender
                    .send((from, ep))
                    .map_err(|e| Error::ChannelSend(e.to_string()))?;
            }
        };
        Ok(())
    }
}

pub struct BgpListenerChannel {
    listener: Listener,
    bind_addr: SocketAddr,
    log: Logger,
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn bind<A: ToSocketAddrs>(addr: A, log: Logger) -> Result<Self, Error>
    where
        Self: Sized,
    {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = NET.bind(addr);
        Ok(Self {
            listener,
            bind_addr: addr,
            log,
        })
    }

    fn accept(
        &self,
        sessions: SessionMap<BgpConnectionChannel>,
        timeout: Duration,
    ) -> Result<BgpConnectionChannel, Error> {
        let (peer, endpoint) = self.listener.accept(timeout)?;
        let event_tx = match lock!(sessions).get(&peer.ip()) {
            Some(tx) => tx.clone(),
            None => return Err(Error::UnknownPeer(peer.ip())),
        };
        Ok(BgpConnectionChannel::with_conn(
            self.bind_addr,
            peer,
            endpoint,
            Direction::Connected,
            event_tx,
            self.log.clone(),
        ))
    }
}

/// Parameters for the receive loop, held until the connection is started.
struct RecvLoopParams {
    rx: Receiver<Frame>,
    event_tx: Sender<SessionEvent<BgpConnectionChannel>>,
}

pub struct BgpConnectionChannel {
    id: ConnectionId,
    addr: SocketAddr,
    peer: SocketAddr,
    direction: Direction,
    conn_tx: Mutex<Option<Sender<Frame>>>,
    recv_loop_params: Mutex<Option<RecvLoopParams>>,
    four_octet_as: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
    log: Logger,
    // Shared by both ends of the underlying channel pair
    channel_id: u64,
}

impl BgpConnection for BgpConnectionChannel {
    type Connector = BgpConnectorChannel;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn send(&self, msg: &Message) -> Result<(), Error> {
        let frame = msg.to_frame()?;
        connection_log!(self,
            trace,
            "send {} message via channel to {} (channel_id: {})",
            msg.title(), self.peer(), self.channel_id;
            "message" => msg.title(),
            "channel_id" => self.channel_id
        );
        let guard = lock!(self.conn_tx);
        let Some(tx) = guard.as_ref() else {
            return Err(Error::NotConnected);
        };
        if let Err(e) =
            tx.send(frame).map_err(|e| Error::ChannelSend(e.to_string()))
        {
            connection_log!(self,
                error,
                "error sending message via channel to {}: {e}",
                self.peer();
                "network_state" => format!("{}", *NET),
                "channel_id" => self.channel_id
            );
            return Err(e);
        }
        Ok(())
    }

    fn start(&self) {
        let Some(params) = lock!(self.recv_loop_params).take() else {
            return;
        };
        connection_log!(self, debug,
            "spawning recv loop for {} (channel_id: {})",
            self.peer(), self.channel_id;
            "channel_id" => self.channel_id
        );
        Self::spawn_recv_loop(
            self.id,
            self.peer,
            params,
            self.four_octet_as.clone(),
            self.dropped.clone(),
            self.log.clone(),
        );
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        // Dropping our sender disconnects the peer's receiver.
        lock!(self.conn_tx).take();
    }

    fn set_four_octet_as(&self, enabled: bool) {
        self.four_octet_as.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for BgpConnectionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl BgpConnectionChannel {
    fn with_conn(
        addr: SocketAddr,
        peer: SocketAddr,
        conn: Endpoint<Frame>,
        direction: Direction,
        event_tx: Sender<SessionEvent<Self>>,
        log: Logger,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            addr,
            peer,
            direction,
            conn_tx: Mutex::new(Some(conn.tx)),
            recv_loop_params: Mutex::new(Some(RecvLoopParams {
                rx: conn.rx,
                event_tx,
            })),
            four_octet_as: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
            channel_id: conn.channel_id,
        }
    }

    /// Decode one frame the way the TCP transport does.
    fn decode(frame: &[u8], four_octet_as: bool) -> Result<Message, Error> {
        if frame.len() < Header::WIRE_SIZE {
            return Err(Error::TooSmall("frame".into()));
        }
        let header = Header::from_wire(&frame[..Header::WIRE_SIZE])?;
        let body = &frame[Header::WIRE_SIZE..];
        if body.len() != header.body_len() {
            return Err(Error::BadMessageLength(header.length));
        }
        Message::from_frame(&header, body, four_octet_as)
    }

    fn spawn_recv_loop(
        id: ConnectionId,
        peer: SocketAddr,
        params: RecvLoopParams,
        four_octet_as: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
        log: Logger,
    ) {
        let RecvLoopParams { rx, event_tx } = params;
        spawn(move || loop {
            if dropped.load(Ordering::Relaxed) {
                break;
            }
            let event = match rx.recv_timeout(IO_TIMEOUT) {
                Ok(frame) => {
                    let four_octet_as = four_octet_as.load(Ordering::Relaxed);
                    match Self::decode(&frame, four_octet_as) {
                        Ok(msg) => {
                            connection_log_lite!(log,
                                debug,
                                "recv {} msg from {peer} ({id})",
                                msg.title();
                                "peer" => peer,
                                "message" => msg.title()
                            );
                            SessionEvent::Message { id, msg }
                        }
                        Err(error) => SessionEvent::DecodeError { id, error },
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    connection_log_lite!(log,
                        debug,
                        "peer {peer} disconnected ({id}), terminating recv loop";
                        "peer" => peer
                    );
                    if !dropped.load(Ordering::Relaxed) {
                        if let Err(e) = event_tx.send(SessionEvent::Closed(id))
                        {
                            connection_log_lite!(log,
                                error,
                                "error sending close to {peer}: {e}";
                                "peer" => peer
                            );
                        }
                    }
                    break;
                }
            };
            let decode_failed = matches!(event, SessionEvent::DecodeError { .. });
            if dropped.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = event_tx.send(event) {
                connection_log_lite!(log,
                    error,
                    "error sending event to {peer}: {e}";
                    "peer" => peer
                );
                break;
            }
            if decode_failed {
                break;
            }
        });
    }
}

pub struct BgpConnectorChannel;

impl BgpConnector<BgpConnectionChannel> for BgpConnectorChannel {
    fn connect(
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
        log: Logger,
        event_tx: Sender<SessionEvent<BgpConnectionChannel>>,
    ) -> Result<JoinHandle<()>, Error> {
        let addr = local.ok_or(Error::InvalidAddress(
            "source address required for channel-based connection".into(),
        ))?;

        connection_log_lite!(log,
            debug,
            "connecting to {peer}";
            "peer" => peer,
            "timeout" => timeout.as_millis()
        );

        // The connection is synchronous, but runs in a thread to match the
        // TCP connector.
        let handle = spawn(move || {
            let (local, remote) = channel();
            let event = match NET.connect(addr, peer, remote) {
                Ok(()) => {
                    let conn = BgpConnectionChannel::with_conn(
                        addr,
                        peer,
                        local,
                        Direction::Active,
                        event_tx.clone(),
                        log.clone(),
                    );
                    connection_log!(conn, info,
                        "channel connection to {peer} established (channel_id: {})",
                        conn.channel_id;
                        "channel_id" => conn.channel_id
                    );
                    SessionEvent::ConnectionConfirmed(conn)
                }
                Err(e) => {
                    connection_log_lite!(log,
                        debug,
                        "connect error: {e}";
                        "peer" => peer
                    );
                    SessionEvent::ConnectFailed
                }
            };
            if let Err(e) = event_tx.send(event) {
                connection_log_lite!(log,
                    error,
                    "failed to deliver connect outcome for {peer}: {e}";
                    "peer" => peer
                );
            }
        });

        Ok(handle)
    }
}

// BIDI

/// Global counter for assigning unique IDs to channel pairs
static CHANNEL_PAIR_ID: std::sync::atomic::AtomicU64 =
    std::sync::atomic::AtomicU64::new(0);

/// A combined (duplex) mpsc sender/receiver.
pub struct Endpoint<T> {
    pub rx: Receiver<T>,
    pub tx: Sender<T>,
    pub channel_id: u64,
}

impl<T> Endpoint<T> {
    fn new(rx: Receiver<T>, tx: Sender<T>, channel_id: u64) -> Self {
        Self { rx, tx, channel_id }
    }
}

/// Creates a bidirectional channel pair with both sender and receiver.
pub fn channel<T>() -> (Endpoint<T>, Endpoint<T>) {
    let (tx_a, rx_b) = mpsc_channel();
    let (tx_b, rx_a) = mpsc_channel();
    let channel_id = CHANNEL_PAIR_ID.fetch_add(1, Ordering::Relaxed);
    (
        Endpoint::new(rx_a, tx_a, channel_id),
        Endpoint::new(rx_b, tx_b, channel_id),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use speaker_common::sockaddr;
    use std::collections::BTreeMap;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn channel_round_trip() {
        let listen = sockaddr!("10.99.0.1:179");
        let client = sockaddr!("10.99.0.2:179");
        let l = BgpListenerChannel::bind(listen, log()).expect("bind");

        let (in_tx, in_rx) = mpsc_channel();
        let mut m = BTreeMap::new();
        m.insert(client.ip(), in_tx);
        let sessions = Arc::new(Mutex::new(m));

        let (out_tx, out_rx) = mpsc_channel();
        BgpConnectorChannel::connect(
            Some(client),
            listen,
            Duration::from_secs(1),
            log(),
            out_tx,
        )
        .expect("connect");
        let inbound =
            l.accept(sessions, Duration::from_secs(5)).expect("accept");
        assert_eq!(inbound.peer(), client);
        inbound.start();

        let outbound = match out_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(SessionEvent::ConnectionConfirmed(c)) => c,
            _ => panic!("expected connection confirmed"),
        };
        outbound.send(&Message::KeepAlive).expect("send");
        match in_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(SessionEvent::Message { msg, id }) => {
                assert_eq!(id, inbound.id());
                assert_eq!(msg, Message::KeepAlive);
            }
            _ => panic!("expected keepalive"),
        }

        outbound.close();
        match in_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(SessionEvent::Closed(id)) => assert_eq!(id, inbound.id()),
            _ => panic!("expected closed"),
        }
    }

    #[test]
    fn connect_without_listener_fails() {
        let (tx, rx) = mpsc_channel();
        BgpConnectorChannel::connect(
            Some(sockaddr!("10.99.1.2:179")),
            sockaddr!("10.99.1.1:179"),
            Duration::from_secs(1),
            log(),
            tx,
        )
        .expect("connect");
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(SessionEvent::ConnectFailed)
        ));
    }
}
