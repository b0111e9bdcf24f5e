// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Per-call tracing context (spec §9, "context propagation").
//!
//! A trace context is preserved as an opaque byte string travelling in request/cancellation
//! headers; its semantics (span export, sampling) are out of scope per spec §1. This mirrors
//! `tarpc`'s `context::Context`, which also carries a deadline and an opaque trace id/span id
//! pair through every request without interpreting them.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// An opaque, propagated trace context. `corerpc` never parses this; it only carries it from the
/// client's request header into the server's scoped installation and back out on any exit path
/// (reply, throw, cancel), per spec §9.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceContext(pub Bytes);

impl TraceContext {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        TraceContext(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Installs `context` for the duration of `f`, unwinding on every exit path (spec §9). In the
/// absence of a thread-local span stack (out of scope per §1) this is a deliberately thin no-op
/// hook: it exists so callers have one place to wire in a real tracing backend without touching
/// call sites throughout the service-dispatch path.
pub fn with_scoped_trace<R>(_context: &TraceContext, f: impl FnOnce() -> R) -> R {
    f()
}

/// Per-request deadline bookkeeping shared by client request control and service context.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    pub start: SystemTime,
    pub timeout: Option<Duration>,
}

impl Deadline {
    pub fn new(start: SystemTime, timeout: Option<Duration>) -> Self {
        Deadline { start, timeout }
    }

    pub fn deadline_instant(&self) -> Option<SystemTime> {
        self.timeout.map(|t| self.start + t)
    }

    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.deadline_instant()
            .map(|d| d.duration_since(now).unwrap_or(Duration::ZERO))
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.remaining(now), Some(d) if d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_expires_after_timeout_elapses() {
        let start = SystemTime::now() - Duration::from_secs(2);
        let deadline = Deadline::new(start, Some(Duration::from_secs(1)));
        assert!(deadline.is_expired(SystemTime::now()));
    }

    #[test]
    fn no_timeout_never_expires() {
        let deadline = Deadline::new(SystemTime::now(), None);
        assert!(!deadline.is_expired(SystemTime::now() + Duration::from_secs(1_000_000)));
    }
}
