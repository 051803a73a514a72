// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{
    BgpConnection, BgpConnector, BgpListener, ConnectionId, Direction,
    SessionMap,
};
use crate::error::Error;
use crate::log::{connection_log, connection_log_lite};
use crate::messages::{Header, Message};
use crate::session::SessionEvent;
use crate::{to_canonical, IO_TIMEOUT};
use slog::Logger;
use socket2::{Domain, Protocol, Socket, Type};
use speaker_common::lock;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, Builder, JoinHandle};
use std::time::{Duration, Instant};

const UNIT_CONNECTION: &str = "connection_tcp";

/// How often a non-blocking accept is retried while waiting for a peer.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
    log: Logger,
}

impl BgpListenerTcp {
    /// The bound address, with the port resolved when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap_or(self.addr)
    }
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
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
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            addr,
            listener,
            log,
        })
    }

    fn accept(
        &self,
        sessions: SessionMap<BgpConnectionTcp>,
        timeout: Duration,
    ) -> Result<BgpConnectionTcp, Error> {
        let deadline = Instant::now() + timeout;
        let (stream, mut peer) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;

        let ip = to_canonical(peer.ip());
        peer.set_ip(ip);

        let event_tx = match lock!(sessions).get(&ip) {
            Some(tx) => tx.clone(),
            None => return Err(Error::UnknownPeer(ip)),
        };
        BgpConnectionTcp::with_stream(
            stream,
            peer,
            Direction::Connected,
            event_tx,
            self.log.clone(),
        )
    }
}

/// Parameters for the receive thread, held until the connection is started.
struct RecvParams {
    stream: TcpStream,
    event_tx: Sender<SessionEvent<BgpConnectionTcp>>,
}

pub struct BgpConnectionTcp {
    id: ConnectionId,
    peer: SocketAddr,
    local: SocketAddr,
    direction: Direction,
    stream: Mutex<TcpStream>,
    recv: Mutex<Option<RecvParams>>,
    four_octet_as: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionTcp {
    type Connector = BgpConnectorTcp;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> SocketAddr {
        self.local
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.dropped.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        let buf = msg.to_frame()?;
        connection_log!(self, trace, "send {}", msg.title();
            "message" => msg.title(),
            "octets" => buf.len()
        );
        lock!(self.stream).write_all(&buf)?;
        Ok(())
    }

    fn start(&self) {
        let Some(params) = lock!(self.recv).take() else {
            return;
        };
        connection_log!(self, debug, "spawning recv loop");
        let id = self.id;
        let peer = self.peer;
        let four_octet_as = self.four_octet_as.clone();
        let dropped = self.dropped.clone();
        let log = self.log.clone();
        let spawned = Builder::new().name(format!("bgp-recv-{id}")).spawn(
            move || {
                Self::recv_loop(
                    id,
                    peer,
                    params,
                    four_octet_as,
                    dropped,
                    log,
                )
            },
        );
        if let Err(e) = spawned {
            connection_log!(self, error, "spawn recv loop: {e}");
        }
    }

    fn close(&self) {
        if self.dropped.swap(true, Ordering::Relaxed) {
            return;
        }
        connection_log!(self, debug, "closing");
        if let Err(e) = lock!(self.stream).shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                connection_log!(self, debug, "shutdown: {e}");
            }
        }
    }

    fn set_four_octet_as(&self, enabled: bool) {
        self.four_octet_as.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for BgpConnectionTcp {
    fn drop(&mut self) {
        self.close();
    }
}

impl BgpConnectionTcp {
    fn with_stream(
        stream: TcpStream,
        peer: SocketAddr,
        direction: Direction,
        event_tx: Sender<SessionEvent<Self>>,
        log: Logger,
    ) -> Result<Self, Error> {
        let local = stream.local_addr()?;
        let rx = stream.try_clone()?;
        rx.set_read_timeout(Some(IO_TIMEOUT))?;
        Ok(Self {
            id: ConnectionId::next(),
            peer,
            local,
            direction,
            stream: Mutex::new(stream),
            recv: Mutex::new(Some(RecvParams {
                stream: rx,
                event_tx,
            })),
            four_octet_as: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        })
    }

    fn recv_loop(
        id: ConnectionId,
        peer: SocketAddr,
        params: RecvParams,
        four_octet_as: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
        log: Logger,
    ) {
        let RecvParams {
            mut stream,
            event_tx,
        } = params;
        loop {
            let event = match Self::recv_msg(&mut stream, &dropped, &four_octet_as)
            {
                Ok(Some(msg)) => SessionEvent::Message { id, msg },
                // Closed locally.
                Ok(None) => break,
                Err(Error::Io(e)) => {
                    connection_log_lite!(log, debug,
                        "[{peer}] connection {id} closed: {e}";
                        "peer" => peer,
                        "connection" => id.to_string()
                    );
                    if !dropped.load(Ordering::Relaxed) {
                        if let Err(e) = event_tx.send(SessionEvent::Closed(id))
                        {
                            connection_log_lite!(log, warn,
                                "[{peer}] connection {id}: error sending close {e}";
                                "peer" => peer,
                                "connection" => id.to_string()
                            );
                        }
                    }
                    break;
                }
                Err(error) => {
                    connection_log_lite!(log, warn,
                        "[{peer}] connection {id} decode: {error}";
                        "peer" => peer,
                        "connection" => id.to_string()
                    );
                    if let Err(e) =
                        event_tx.send(SessionEvent::DecodeError { id, error })
                    {
                        connection_log_lite!(log, warn,
                            "[{peer}] connection {id}: error sending decode error {e}";
                            "peer" => peer,
                            "connection" => id.to_string()
                        );
                    }
                    break;
                }
            };
            if let Err(e) = event_tx.send(event) {
                connection_log_lite!(log, warn,
                    "[{peer}] connection {id}: error sending event {e}";
                    "peer" => peer,
                    "connection" => id.to_string()
                );
                break;
            }
        }
    }

    /// Fill `buf` from the stream. Returns false if the connection was
    /// closed locally while waiting.
    fn read_full(
        stream: &mut TcpStream,
        buf: &mut [u8],
        dropped: &AtomicBool,
    ) -> std::io::Result<bool> {
        let mut i = 0;
        while i < buf.len() {
            if dropped.load(Ordering::Relaxed) {
                return Ok(false);
            }
            match stream.read(&mut buf[i..]) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => i += n,
                // The read timeout expired. Check the drop flag and carry on.
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn recv_msg(
        stream: &mut TcpStream,
        dropped: &AtomicBool,
        four_octet_as: &AtomicBool,
    ) -> Result<Option<Message>, Error> {
        let mut buf = [0u8; Header::WIRE_SIZE];
        if !Self::read_full(stream, &mut buf, dropped)? {
            return Ok(None);
        }
        let header = Header::from_wire(&buf)?;

        let mut body = vec![0u8; header.body_len()];
        if !Self::read_full(stream, &mut body, dropped)? {
            return Ok(None);
        }
        // The width is read only once the whole message is in, as the session
        // may have negotiated it while this read was pending.
        let four_octet_as = four_octet_as.load(Ordering::Relaxed);
        Message::from_frame(&header, &body, four_octet_as).map(Some)
    }
}

pub struct BgpConnectorTcp;

impl BgpConnectorTcp {
    fn dial(
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
    ) -> std::io::Result<TcpStream> {
        let Some(local) = local else {
            return TcpStream::connect_timeout(&peer, timeout);
        };
        let sk = Socket::new(
            Domain::for_address(peer),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        sk.bind(&local.into())?;
        sk.connect_timeout(&peer.into(), timeout)?;
        Ok(sk.into())
    }
}

impl BgpConnector<BgpConnectionTcp> for BgpConnectorTcp {
    fn connect(
        local: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
        log: Logger,
        event_tx: Sender<SessionEvent<BgpConnectionTcp>>,
    ) -> Result<JoinHandle<()>, Error> {
        connection_log_lite!(log, debug, "connecting to {peer}";
            "peer" => peer,
            "timeout" => timeout.as_millis()
        );
        let handle = Builder::new().name("bgp-connect".into()).spawn(
            move || {
                let event = match Self::dial(local, peer, timeout)
                    .map_err(Error::from)
                    .and_then(|stream| {
                        BgpConnectionTcp::with_stream(
                            stream,
                            peer,
                            Direction::Active,
                            event_tx.clone(),
                            log.clone(),
                        )
                    }) {
                    Ok(conn) => {
                        connection_log!(conn, info, "connected");
                        SessionEvent::ConnectionConfirmed(conn)
                    }
                    Err(e) => {
                        connection_log_lite!(log, debug,
                            "connect to {peer} failed: {e}";
                            "peer" => peer
                        );
                        SessionEvent::ConnectFailed
                    }
                };
                if let Err(e) = event_tx.send(event) {
                    connection_log_lite!(log, warn,
                        "connect to {peer} outcome not delivered: {e}";
                        "peer" => peer
                    );
                }
            },
        )?;
        Ok(handle)
    }
}
