// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{BgpConnection, BgpListener, SessionMap};
use crate::error::Error;
use crate::log::dispatcher_log;
use crate::session::SessionEvent;
use crate::IO_TIMEOUT;
use slog::Logger;
use speaker_common::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;

const UNIT_DISPATCHER: &str = "dispatcher";

/// Accepts inbound connections and hands each one to the session configured
/// for the remote address.
pub struct Dispatcher<Cnx: BgpConnection> {
    pub addr_to_session: SessionMap<Cnx>,
    shutdown: AtomicBool,
    listen: String,
    log: Logger,
}

impl<Cnx: BgpConnection> Dispatcher<Cnx> {
    pub fn new(
        addr_to_session: SessionMap<Cnx>,
        listen: String,
        log: Logger,
    ) -> Self {
        Self {
            addr_to_session,
            listen,
            log,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn bind<Listener: BgpListener<Cnx>>(&self) -> Result<Listener, Error> {
        Listener::bind(self.listen.as_str(), self.log.clone())
    }

    /// Bind and serve until shut down.
    pub fn run<Listener: BgpListener<Cnx>>(&self) {
        match self.bind::<Listener>() {
            Ok(listener) => self.serve(listener),
            Err(e) => {
                dispatcher_log!(self, error, "listen failed: {e}");
            }
        }
    }

    pub fn serve<Listener: BgpListener<Cnx>>(&self, listener: Listener) {
        dispatcher_log!(self, info, "accepting connections");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let conn = match listener
                .accept(self.addr_to_session.clone(), IO_TIMEOUT)
            {
                Ok(c) => c,
                Err(Error::Timeout) => continue,
                Err(Error::UnknownPeer(addr)) => {
                    dispatcher_log!(self, warn,
                        "dropped connection from unknown peer {}", addr;
                        "remote" => addr.to_string()
                    );
                    continue;
                }
                Err(e) => {
                    dispatcher_log!(self, error, "accept: {e}");
                    sleep(IO_TIMEOUT);
                    continue;
                }
            };

            let addr = crate::to_canonical(conn.peer().ip());
            let tx = lock!(self.addr_to_session).get(&addr).cloned();
            match tx {
                Some(tx) => {
                    dispatcher_log!(self, debug,
                        "accepted connection {} from {}", conn.id(), addr
                    );
                    if let Err(e) = tx.send(SessionEvent::Connected(conn)) {
                        dispatcher_log!(self, error,
                            "hand off connection from {}: {e}", addr
                        );
                    }
                }
                None => {
                    dispatcher_log!(self, warn,
                        "session for {} removed during accept", addr
                    );
                }
            }
        }
        dispatcher_log!(self, info, "dispatcher stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
