use std::time::{Duration, Instant};

/// Time budget within which a disconnected claim may still be recovered.
///
/// The lease is renewed (`touch`) on every successful contact with the
/// remote peer: a received status report or an accepted RPC. A claim with
/// no lease (`duration == None`) has nothing remaining and cannot survive
/// a disconnection.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    duration: Option<Duration>,
    last_renewal: Instant,
}

impl Lease {
    pub fn new(duration: Option<Duration>, now: Instant) -> Self {
        Self {
            duration,
            last_renewal: now,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn last_renewal(&self) -> Instant {
        self.last_renewal
    }

    /// Record a successful contact with the peer. Never moves the renewal
    /// point backwards, so `remaining` never decreases from a touch.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_renewal {
            self.last_renewal = now;
        }
    }

    /// How much disconnection budget is left at `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.duration {
            None => Duration::ZERO,
            Some(d) => d.saturating_sub(now.saturating_duration_since(self.last_renewal)),
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
}
