// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    config::{PeerConfig, ReconnectConfig, SpeakerConfig},
    connection::{BgpConnection, BgpListener, SessionMap},
    connection_channel::{BgpConnectionChannel, BgpListenerChannel},
    connection_tcp::{BgpConnectionTcp, BgpListenerTcp},
    error::Error,
    fsm::FsmState,
    messages::{
        As4PathSegment, AsPathType, CeaseErrorSubcode, Message,
        NotificationMessage, PathAttributeValue, PathOrigin, Prefix,
        UpdateMessage,
    },
    service::Service,
    session::{AdminEvent, RouteEvent, RouteSide, SessionEvent},
};
use pretty_assertions::assert_eq;
use speaker_common::log::init_file_logger;
use speaker_common::*;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Use non-standard port outside the privileged range to avoid needing privs
const TEST_BGP_PORT: u16 = 10179;

const TEST_CONNECT_RETRY_SECS: u64 = 1;

struct TestSpeaker<Cnx: BgpConnection> {
    service: Arc<Service<Cnx>>,
    routes: Receiver<RouteEvent>,
}

impl<Cnx: BgpConnection> Drop for TestSpeaker<Cnx> {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}

/// A speaker listening on `listen` with a single peer at `peer`.
fn speaker<Cnx, Listener>(
    name: &str,
    test: &str,
    asn: u32,
    id: u32,
    listen: SocketAddr,
    peer: PeerConfig,
) -> TestSpeaker<Cnx>
where
    Cnx: BgpConnection,
    Listener: BgpListener<Cnx> + Send + 'static,
{
    let log = init_file_logger(&format!("{name}.{test}.log"))
        .expect("create log file");
    let (tx, routes) = channel();
    let service = Arc::new(
        Service::new(
            SpeakerConfig {
                asn,
                id,
                listen: Some(listen.to_string()),
                reconnect: ReconnectConfig {
                    sweep_interval_ms: 50,
                    delay_ms: 100,
                },
                peers: vec![peer],
            },
            log,
        )
        .with_route_events(tx),
    );
    service.listen::<Listener>().expect("listen");
    service.start().expect("start peers");
    service.run_sweeper().expect("run sweeper");
    TestSpeaker { service, routes }
}

fn peer_config(
    name: &str,
    host: SocketAddr,
    src: SocketAddr,
    remote_asn: u32,
    passive: bool,
) -> PeerConfig {
    let mut p = PeerConfig::new(name, host, remote_asn);
    p.src_addr = Some(SocketAddr::new(src.ip(), 0));
    p.passive = passive;
    p.connect_retry = TEST_CONNECT_RETRY_SECS;
    p.resolution_ms = 10;
    p
}

/// r1 connects out, r2 waits for it.
fn peering<Cnx, Listener>(
    test: &str,
    r1_addr: SocketAddr,
    r2_addr: SocketAddr,
) -> (TestSpeaker<Cnx>, TestSpeaker<Cnx>)
where
    Cnx: BgpConnection,
    Listener: BgpListener<Cnx> + Send + 'static,
{
    let r2 = speaker::<Cnx, Listener>(
        "r2",
        test,
        65002,
        2,
        r2_addr,
        peer_config("r1", r1_addr, r2_addr, 65001, true),
    );
    let r1 = speaker::<Cnx, Listener>(
        "r1",
        test,
        65001,
        1,
        r1_addr,
        peer_config("r2", r2_addr, r1_addr, 65002, false),
    );
    (r1, r2)
}

fn prefix(s: &str, len: u8) -> Prefix {
    Prefix::new(s.parse().expect("address"), len).expect("prefix")
}

fn update(nlri: Vec<Prefix>, nexthop: &str) -> UpdateMessage {
    UpdateMessage {
        withdrawn: Vec::new(),
        path_attributes: vec![
            PathAttributeValue::Origin(PathOrigin::Igp).into(),
            PathAttributeValue::AsPath4(vec![As4PathSegment {
                typ: AsPathType::AsSequence,
                value: vec![65001],
            }])
            .into(),
            PathAttributeValue::NextHop(nexthop.parse().expect("nexthop"))
                .into(),
        ],
        nlri,
    }
}

/// Wait for the next route event matching `side`.
fn next_route(
    routes: &Receiver<RouteEvent>,
    side: RouteSide,
) -> Option<RouteEvent> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match routes.recv_timeout(Duration::from_millis(100)) {
            Ok(e) => {
                let matches = match &e {
                    RouteEvent::Added { side: s, .. }
                    | RouteEvent::Withdrawn { side: s, .. } => *s == side,
                };
                if matches {
                    return Some(e);
                }
            }
            Err(_) => continue,
        }
    }
    None
}

fn basic_peering_helper<Cnx, Listener>(
    test: &str,
    r1_addr: SocketAddr,
    r2_addr: SocketAddr,
) where
    Cnx: BgpConnection,
    Listener: BgpListener<Cnx> + Send + 'static,
{
    let (r1, r2) = peering::<Cnx, Listener>(test, r1_addr, r2_addr);

    wait_for_eq!(
        r1.service.peer_state(r2_addr.ip()),
        Some(FsmState::Established)
    );
    wait_for_eq!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Established)
    );
    assert_eq!(r1.service.registry().registered(), vec![r2_addr.ip()]);
    assert_eq!(r2.service.registry().registered(), vec![r1_addr.ip()]);

    // Removing the peer on one side tears the session down on the other.
    r1.service.remove_peer(r2_addr.ip()).expect("remove peer");
    assert!(r1.service.registry().registered().is_empty());
    wait_for_neq!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Established)
    );
    wait_for!(r2.service.registry().is_registered(r1_addr.ip()), ==, false);
}

fn basic_update_helper<Cnx, Listener>(
    test: &str,
    r1_addr: SocketAddr,
    r2_addr: SocketAddr,
) where
    Cnx: BgpConnection,
    Listener: BgpListener<Cnx> + Send + 'static,
{
    let (r1, r2) = peering::<Cnx, Listener>(test, r1_addr, r2_addr);
    wait_for_eq!(
        r1.service.peer_state(r2_addr.ip()),
        Some(FsmState::Established)
    );
    wait_for_eq!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Established)
    );

    let nexthop = r1_addr.ip().to_string();
    let announced = update(vec![prefix("10.99.0.0", 24)], &nexthop);
    r1.service
        .send_update(r2_addr.ip(), announced.clone())
        .expect("send update");

    match next_route(&r2.routes, RouteSide::Remote) {
        Some(RouteEvent::Added {
            peer,
            afi,
            safi,
            nlri,
            attributes,
            ..
        }) => {
            assert_eq!(peer, r1_addr.ip());
            assert_eq!((afi, safi), (1, 1));
            assert_eq!(nlri, prefix("10.99.0.0", 24));
            assert_eq!(attributes, announced.path_attributes);
        }
        other => panic!("expected an added route, got {other:?}"),
    }

    // The sender reports its own announcement.
    match next_route(&r1.routes, RouteSide::Local) {
        Some(RouteEvent::Added { peer, nlri, .. }) => {
            assert_eq!(peer, r2_addr.ip());
            assert_eq!(nlri, prefix("10.99.0.0", 24));
        }
        other => panic!("expected a local route, got {other:?}"),
    }

    let withdraw = UpdateMessage {
        withdrawn: vec![prefix("10.99.0.0", 24)],
        ..Default::default()
    };
    r1.service
        .send_update(r2_addr.ip(), withdraw)
        .expect("send withdraw");
    match next_route(&r2.routes, RouteSide::Remote) {
        Some(RouteEvent::Withdrawn { peer, nlri, .. }) => {
            assert_eq!(peer, r1_addr.ip());
            assert_eq!(nlri, prefix("10.99.0.0", 24));
        }
        other => panic!("expected a withdrawn route, got {other:?}"),
    }
}

#[test]
fn test_basic_peering() {
    basic_peering_helper::<BgpConnectionChannel, BgpListenerChannel>(
        "basic_peering",
        sockaddr!(&format!("10.81.0.1:{TEST_BGP_PORT}")),
        sockaddr!(&format!("10.81.0.2:{TEST_BGP_PORT}")),
    )
}

#[test]
fn test_basic_update() {
    basic_update_helper::<BgpConnectionChannel, BgpListenerChannel>(
        "basic_update",
        sockaddr!(&format!("10.82.0.1:{TEST_BGP_PORT}")),
        sockaddr!(&format!("10.82.0.2:{TEST_BGP_PORT}")),
    )
}

#[test]
fn test_manual_stop_and_restart() {
    let r1_addr = sockaddr!(&format!("10.83.0.1:{TEST_BGP_PORT}"));
    let r2_addr = sockaddr!(&format!("10.83.0.2:{TEST_BGP_PORT}"));
    let (r1, r2) = peering::<BgpConnectionChannel, BgpListenerChannel>(
        "manual_stop_and_restart",
        r1_addr,
        r2_addr,
    );
    wait_for_eq!(
        r1.service.peer_state(r2_addr.ip()),
        Some(FsmState::Established)
    );

    r1.service
        .admin(r2_addr.ip(), AdminEvent::ManualStop)
        .expect("manual stop");
    wait_for_eq!(r1.service.peer_state(r2_addr.ip()), Some(FsmState::Idle));

    // r2 saw a cease, falls to idle and is restarted by its sweeper. r1 was
    // stopped by the operator and stays down.
    wait_for_eq!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Active)
    );
    assert_eq!(r1.service.peer_state(r2_addr.ip()), Some(FsmState::Idle));
    assert!(r1.service.reconnects().pending().is_empty());

    r1.service
        .admin(r2_addr.ip(), AdminEvent::ManualStart)
        .expect("manual start");
    wait_for_eq!(
        r1.service.peer_state(r2_addr.ip()),
        Some(FsmState::Established)
    );
    wait_for_eq!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Established)
    );
}

#[test]
fn test_wrong_remote_asn() {
    let r1_addr = sockaddr!(&format!("10.84.0.1:{TEST_BGP_PORT}"));
    let r2_addr = sockaddr!(&format!("10.84.0.2:{TEST_BGP_PORT}"));
    let r2 = speaker::<BgpConnectionChannel, BgpListenerChannel>(
        "r2",
        "wrong_remote_asn",
        65002,
        2,
        r2_addr,
        peer_config("r1", r1_addr, r2_addr, 65001, true),
    );
    // r1 expects AS 65009 behind r2
    let r1 = speaker::<BgpConnectionChannel, BgpListenerChannel>(
        "r1",
        "wrong_remote_asn",
        65001,
        1,
        r1_addr,
        peer_config("r2", r2_addr, r1_addr, 65009, false),
    );

    std::thread::sleep(Duration::from_secs(2));
    assert_ne!(
        r1.service.peer_state(r2_addr.ip()),
        Some(FsmState::Established)
    );
    assert_ne!(
        r2.service.peer_state(r1_addr.ip()),
        Some(FsmState::Established)
    );
    assert!(r1.service.registry().registered().is_empty());
    assert!(r2.service.registry().registered().is_empty());
}

#[test]
fn test_removed_peer_not_reconnected() {
    let r1_addr = sockaddr!(&format!("10.85.0.1:{TEST_BGP_PORT}"));
    let r2_addr = sockaddr!(&format!("10.85.0.2:{TEST_BGP_PORT}"));
    let log = init_file_logger("r1.removed_peer_not_reconnected.log")
        .expect("create log file");

    // r2 is a bare listener so every connection r1 makes is visible here
    let remote = BgpListenerChannel::bind(r2_addr, log.clone())
        .expect("bind remote listener");
    let (remote_tx, remote_rx) = channel();
    let remote_sessions: SessionMap<BgpConnectionChannel> = Arc::new(
        Mutex::new(BTreeMap::from([(r1_addr.ip(), remote_tx)])),
    );

    // No sweeper thread, sweeps are driven by hand below.
    let (tx, routes) = channel();
    let r1 = TestSpeaker {
        service: Arc::new(
            Service::<BgpConnectionChannel>::new(
                SpeakerConfig {
                    asn: 65001,
                    id: 1,
                    listen: None,
                    reconnect: ReconnectConfig {
                        sweep_interval_ms: 50,
                        delay_ms: 60_000,
                    },
                    peers: vec![peer_config(
                        "r2", r2_addr, r1_addr, 65002, false,
                    )],
                },
                log,
            )
            .with_route_events(tx),
        ),
        routes,
    };
    r1.service.start().expect("start peers");

    let conn = remote
        .accept(remote_sessions.clone(), Duration::from_secs(5))
        .expect("first connection");
    conn.start();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no open from r1");
        match remote_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(SessionEvent::Message {
                msg: Message::Open(_),
                ..
            }) => break,
            _ => continue,
        }
    }

    // A cease in OpenSent drops r1 to idle with a reconnect pending.
    conn.send(&Message::Notification(NotificationMessage::cease(
        CeaseErrorSubcode::AdministrativeReset,
    )))
    .expect("send cease");
    wait_for_eq!(r1.service.peer_state(r2_addr.ip()), Some(FsmState::Idle));
    wait_for_eq!(r1.service.reconnects().pending().len(), 1);
    assert_eq!(r1.service.reconnects().pending()[0].peer, r2_addr.ip());

    r1.service.remove_peer(r2_addr.ip()).expect("remove peer");
    assert_eq!(r1.service.peer_state(r2_addr.ip()), None);

    let restarted = r1.service.sweep(Instant::now() + Duration::from_secs(120));
    assert!(restarted.is_empty());
    assert!(r1.service.reconnects().pending().is_empty());
    assert!(matches!(
        remote.accept(remote_sessions, Duration::from_secs(2)),
        Err(Error::Timeout)
    ));
}

//
// TCP-based tests
//
#[test]
fn test_basic_peering_tcp() {
    basic_peering_helper::<BgpConnectionTcp, BgpListenerTcp>(
        "basic_peering_tcp",
        sockaddr!(&format!("127.0.0.1:{TEST_BGP_PORT}")),
        sockaddr!(&format!("127.0.0.2:{TEST_BGP_PORT}")),
    )
}

#[test]
fn test_basic_update_tcp() {
    basic_update_helper::<BgpConnectionTcp, BgpListenerTcp>(
        "basic_update_tcp",
        sockaddr!(&format!("127.0.0.3:{TEST_BGP_PORT}")),
        sockaddr!(&format!("127.0.0.4:{TEST_BGP_PORT}")),
    )
}
