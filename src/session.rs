//! Transmission session tracking.
//!
//! A channel is "receiving" while datagrams keep arriving and goes idle once
//! none have arrived for the push-to-talk timeout. Each idle→receiving edge
//! opens a new [`Session`] with the next id.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};
use tracing::warn;

/// Abstraction over time source for testability.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One transmission on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: u64,
    pub started_at: DateTime<Local>,
    pub active: bool,
}

/// Opens and closes sessions from datagram arrival and inactivity.
///
/// Arrival and timer re-arm are a single call ([`on_datagram`]), so the
/// deadline can never be observed out of step with the last datagram.
///
/// [`on_datagram`]: SessionTracker::on_datagram
pub struct SessionTracker<C: Clock = SystemClock> {
    timeout: Duration,
    last_id: u64,
    current: Option<Session>,
    deadline: Option<Instant>,
    clock: C,
}

impl<C: Clock> SessionTracker<C> {
    pub fn with_clock(timeout: Duration, clock: C) -> Self {
        Self {
            timeout,
            last_id: 0,
            current: None,
            deadline: None,
            clock,
        }
    }

    /// Records a datagram arrival and re-arms the inactivity deadline.
    ///
    /// Returns the new session if this datagram opened one.
    pub fn on_datagram(&mut self) -> Option<Session> {
        self.deadline = Some(self.clock.now() + self.timeout);
        if self.current.is_some() {
            return None;
        }

        self.last_id += 1;
        let session = Session {
            id: self.last_id,
            started_at: Local::now(),
            active: true,
        };
        self.current = Some(session.clone());
        Some(session)
    }

    /// When the active session will time out, if one is active.
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().and(self.deadline)
    }

    /// Ends the active session if its deadline has passed.
    pub fn poll_timeout(&mut self) -> Option<Session> {
        match self.deadline() {
            Some(deadline) if self.clock.now() >= deadline => self.end_session(),
            _ => None,
        }
    }

    /// Ends the active session, returning it marked inactive.
    ///
    /// With no active session this only logs a warning.
    pub fn end_session(&mut self) -> Option<Session> {
        self.deadline = None;
        match self.current.take() {
            Some(mut session) => {
                session.active = false;
                Some(session)
            }
            None => {
                warn!("Session end requested with no active session");
                None
            }
        }
    }

    pub fn active(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Id of the active session, or of the last one if idle.
    pub fn current_id(&self) -> u64 {
        self.last_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl SessionTracker<SystemClock> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, SystemClock)
    }
}
