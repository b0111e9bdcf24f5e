// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The RPC error taxonomy (spec §6/§7): a domain-tagged code, a message, and nested attributes.

use std::fmt;

use thiserror::Error;

/// The code space from spec.md §6, plus the host platform's Canceled/TimedOut.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ErrorCode {
    Transport,
    ProtocolError,
    NoSuchService,
    NoSuchMethod,
    Unavailable,
    PoisonPill,
    RequestQueueSizeLimitExceeded,
    AuthenticationError,
    InvalidCsrfToken,
    Canceled,
    TimedOut,
}

impl ErrorCode {
    /// Numeric code, matching the source's domain-qualified integer codes.
    pub fn numeric(&self) -> i32 {
        match self {
            ErrorCode::Transport => 1,
            ErrorCode::ProtocolError => 101,
            ErrorCode::NoSuchService => 102,
            ErrorCode::NoSuchMethod => 103,
            ErrorCode::Unavailable => 105,
            ErrorCode::PoisonPill => 106,
            ErrorCode::RequestQueueSizeLimitExceeded => 108,
            ErrorCode::AuthenticationError => 109,
            ErrorCode::InvalidCsrfToken => 110,
            // Host-platform codes; chosen out of the source's range to avoid collision.
            ErrorCode::Canceled => 200,
            ErrorCode::TimedOut => 201,
        }
    }

    /// Inverse of [`ErrorCode::numeric`]; unrecognized codes collapse to `Transport` since a
    /// response envelope decoded far enough to reach this point is otherwise a delivered reply.
    pub fn from_numeric(code: i32) -> ErrorCode {
        match code {
            1 => ErrorCode::Transport,
            101 => ErrorCode::ProtocolError,
            102 => ErrorCode::NoSuchService,
            103 => ErrorCode::NoSuchMethod,
            105 => ErrorCode::Unavailable,
            106 => ErrorCode::PoisonPill,
            108 => ErrorCode::RequestQueueSizeLimitExceeded,
            109 => ErrorCode::AuthenticationError,
            110 => ErrorCode::InvalidCsrfToken,
            200 => ErrorCode::Canceled,
            201 => ErrorCode::TimedOut,
            _ => ErrorCode::Transport,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.numeric())
    }
}

/// A tagged RPC error: domain code + message + nested attributes, matching the source's error
/// representation (spec §3 response header, §7 error handling table).
#[derive(Clone, Error, Debug)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    pub attributes: Vec<(String, String)>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The retriable set from spec.md §4.3: `TransportError`, `Unavailable`, `Abandoned`,
    /// `RequestQueueLimitExceeded`, `Timeout`. "Abandoned" has no dedicated code in §6's code
    /// space; it is represented here by `Canceled`, the closest analog (a request abandoned by a
    /// peer surfaces to this crate as a cancellation).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Transport
                | ErrorCode::Unavailable
                | ErrorCode::Canceled
                | ErrorCode::RequestQueueSizeLimitExceeded
                | ErrorCode::TimedOut
        )
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    pub fn no_such_service(name: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoSuchService, "no such service").with_attribute("service", name)
    }

    pub fn no_such_method(name: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoSuchMethod, "no such method").with_attribute("method", name)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn poison_pill() -> Self {
        Self::new(ErrorCode::PoisonPill, "poison pill received")
    }

    pub fn queue_size_limit_exceeded(method: impl Into<String>, limit: usize) -> Self {
        Self::new(ErrorCode::RequestQueueSizeLimitExceeded, "request queue size limit exceeded")
            .with_attribute("method", method)
            .with_attribute("limit", limit.to_string())
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TimedOut, message)
    }

    /// "Retry of unseen mutation during warm-up" (spec.md §4.4 / §7).
    pub fn warmup() -> Self {
        Self::new(
            ErrorCode::Unavailable,
            "cannot determine whether this mutation was seen before restart; retry later",
        )
        .with_attribute("reason", "warmup")
    }

    /// "Duplicate request not marked retry" (spec.md §4.4).
    pub fn duplicate_not_marked_retry(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ProtocolError, format!("duplicate mutation id {id} not marked retry"))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
