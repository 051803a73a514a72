// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background threads that are told to stop and joined when their owner
//! goes away.

use crate::lock;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{Builder, JoinHandle},
};

/// A named background thread paired with a stop flag.
///
/// The thread body receives the flag and is expected to poll it. Calling
/// [`ManagedThread::stop`] or dropping the value raises the flag and joins
/// the thread.
#[derive(Debug)]
pub struct ManagedThread {
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl ManagedThread {
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle =
            Builder::new().name(name.to_owned()).spawn(move || f(flag))?;
        Ok(Self {
            handle: Mutex::new(Some(handle)),
            stop,
        })
    }

    /// True until the thread has been asked to stop.
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed) && lock!(self.handle).is_some()
    }

    /// Raise the stop flag and wait for the thread to exit. Stopping twice
    /// is a no-op.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = lock!(self.handle).take();
        if let Some(handle) = handle {
            // A thread stopping itself must not join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        self.stop();
    }
}
