// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{error, Logger};
use speaker_common::lock;
use speaker_common::thread::ManagedThread;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// The five session timers of RFC 4271 §8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectRetry,
    Hold,
    Keepalive,
    DelayOpen,
    IdleHold,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::ConnectRetry,
        TimerKind::Hold,
        TimerKind::Keepalive,
        TimerKind::DelayOpen,
        TimerKind::IdleHold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRetry => "connect_retry",
            Self::Hold => "hold",
            Self::Keepalive => "keepalive",
            Self::DelayOpen => "delay_open",
            Self::IdleHold => "idle_hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running { due: Instant },

    /// The clock saw the deadline pass and has queued an expiry event that
    /// the session has not consumed yet.
    Expired,
}

#[derive(Debug)]
struct TimerInner {
    interval: Duration,
    state: TimerState,
}

/// A single shot deadline. Clones share state, so the session that starts
/// and stops a timer and the clock thread that expires it see the same
/// value.
#[derive(Debug, Clone)]
pub struct Timer {
    inner: Arc<Mutex<TimerInner>>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                interval,
                state: TimerState::Stopped,
            })),
        }
    }

    pub fn interval(&self) -> Duration {
        lock!(self.inner).interval
    }

    /// (Re)start the timer with its current interval.
    pub fn start(&self) {
        let mut inner = lock!(self.inner);
        inner.state = TimerState::Running {
            due: Instant::now() + inner.interval,
        };
    }

    /// (Re)start the timer with a new interval, which is kept for later
    /// restarts.
    pub fn start_with(&self, interval: Duration) {
        let mut inner = lock!(self.inner);
        inner.interval = interval;
        inner.state = TimerState::Running {
            due: Instant::now() + interval,
        };
    }

    pub fn stop(&self) {
        lock!(self.inner).state = TimerState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        matches!(lock!(self.inner).state, TimerState::Running { .. })
    }

    pub fn is_expired(&self) -> bool {
        lock!(self.inner).state == TimerState::Expired
    }

    pub fn due(&self) -> Option<Instant> {
        match lock!(self.inner).state {
            TimerState::Running { due } => Some(due),
            _ => None,
        }
    }

    pub fn state(&self) -> TimerState {
        lock!(self.inner).state
    }

    /// Mark the timer expired if its deadline is at or before `now`. Returns
    /// true exactly once per expiry.
    pub fn poll(&self, now: Instant) -> bool {
        let mut inner = lock!(self.inner);
        match inner.state {
            TimerState::Running { due } if due <= now => {
                inner.state = TimerState::Expired;
                true
            }
            _ => false,
        }
    }

    /// Consume a pending expiry. Returns false when the timer was stopped or
    /// restarted after the clock expired it, in which case the queued expiry
    /// event is stale.
    pub fn take_expired(&self) -> bool {
        let mut inner = lock!(self.inner);
        if inner.state == TimerState::Expired {
            inner.state = TimerState::Stopped;
            true
        } else {
            false
        }
    }
}

/// The timers of one session.
#[derive(Debug, Clone)]
pub struct ClockTimers {
    /// How long to wait between connection attempts.
    pub connect_retry: Timer,

    /// How long to keep a session alive between keepalive, update and/or
    /// notification messages.
    pub hold: Timer,

    /// Time between sending keepalive messages.
    pub keepalive: Timer,

    /// Interval to wait before sending out an open message.
    pub delay_open: Timer,

    /// Amount of time that a peer is held in the idle state.
    pub idle_hold: Timer,
}

impl ClockTimers {
    pub fn new(
        connect_retry: Duration,
        hold: Duration,
        keepalive: Duration,
        delay_open: Duration,
        idle_hold: Duration,
    ) -> Self {
        Self {
            connect_retry: Timer::new(connect_retry),
            hold: Timer::new(hold),
            keepalive: Timer::new(keepalive),
            delay_open: Timer::new(delay_open),
            idle_hold: Timer::new(idle_hold),
        }
    }

    pub fn get(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::ConnectRetry => &self.connect_retry,
            TimerKind::Hold => &self.hold,
            TimerKind::Keepalive => &self.keepalive,
            TimerKind::DelayOpen => &self.delay_open,
            TimerKind::IdleHold => &self.idle_hold,
        }
    }

    pub fn stop_all(&self) {
        for kind in TimerKind::ALL {
            self.get(kind).stop();
        }
    }
}

/// A thread that expires the timers of one session and queues an event for
/// each expiry.
pub struct Clock {
    pub resolution: Duration,
    pub timers: ClockTimers,
    thread: ManagedThread,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("resolution", &self.resolution)
            .field("timers", &self.timers)
            .finish()
    }
}

impl Clock {
    pub fn new<E, F>(
        resolution: Duration,
        timers: ClockTimers,
        s: Sender<E>,
        event: F,
        log: Logger,
    ) -> std::io::Result<Self>
    where
        E: Send + 'static,
        F: Fn(TimerKind) -> E + Send + 'static,
    {
        let t = timers.clone();
        let thread = ManagedThread::spawn("bgp-clock", move |stop| {
            while !stop.load(Ordering::Relaxed) {
                Self::step_all(&t, &s, &event, &log);
                sleep(resolution);
            }
        })?;
        Ok(Self {
            resolution,
            timers,
            thread,
        })
    }

    fn step_all<E, F>(
        timers: &ClockTimers,
        s: &Sender<E>,
        event: &F,
        log: &Logger,
    ) where
        F: Fn(TimerKind) -> E,
    {
        let now = Instant::now();
        for kind in TimerKind::ALL {
            if timers.get(kind).poll(now) {
                if let Err(e) = s.send(event(kind)) {
                    error!(log, "send timer event {}: {e}", kind.as_str();
                        "component" => crate::COMPONENT_BGP,
                        "module" => crate::MOD_CLOCK,
                        "timer" => kind.as_str()
                    );
                }
            }
        }
    }

    pub fn stop(&self) {
        self.thread.stop();
    }
}
