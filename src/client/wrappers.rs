// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Channel wrappers (spec §4.3): each holds an inner [`RpcChannel`] and adjusts one concern before
//! delegating, so they compose by nesting (e.g. retrying ∘ authenticated ∘ realm ∘ bus channel).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::sync::oneshot;

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::ids::{RealmId, RequestId};

use super::{ChannelOptions, OutgoingRequest, RequestControl, ResponseHandler, RpcChannel};

/// Stamps every outgoing request with a fixed user name (spec §4.3).
pub struct AuthenticatedChannel {
    inner: Arc<dyn RpcChannel>,
    user: String,
}

impl AuthenticatedChannel {
    pub fn new(inner: Arc<dyn RpcChannel>, user: impl Into<String>) -> Arc<Self> {
        Arc::new(AuthenticatedChannel { inner, user: user.into() })
    }
}

impl RpcChannel for AuthenticatedChannel {
    fn send(&self, mut request: OutgoingRequest, handler: Arc<dyn ResponseHandler>, options: ChannelOptions) -> RequestControl {
        request.user = Some(self.user.clone());
        self.inner.send(request, handler, options)
    }

    fn terminate(&self, error: RpcError) {
        self.inner.terminate(error);
    }
}

/// Stamps every outgoing request with a fixed realm (spec §4.3).
pub struct RealmChannel {
    inner: Arc<dyn RpcChannel>,
    realm_id: RealmId,
}

impl RealmChannel {
    pub fn new(inner: Arc<dyn RpcChannel>, realm_id: RealmId) -> Arc<Self> {
        Arc::new(RealmChannel { inner, realm_id })
    }
}

impl RpcChannel for RealmChannel {
    fn send(&self, mut request: OutgoingRequest, handler: Arc<dyn ResponseHandler>, options: ChannelOptions) -> RequestControl {
        request.realm_id = self.realm_id;
        self.inner.send(request, handler, options)
    }

    fn terminate(&self, error: RpcError) {
        self.inner.terminate(error);
    }
}

/// Retry behavior for [`RetryingChannel`] (spec §4.3).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first; `1` disables retrying.
    pub max_attempts: usize,
    pub backoff: Duration,
    /// Attempts stop once this much wall-clock time has elapsed since the first attempt, even if
    /// `max_attempts` hasn't been reached yet.
    pub retry_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            retry_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Shared state one logical call's retries coordinate through: which attempt is "current" (so
/// stale acknowledgements from superseded attempts are swallowed) and the control for whichever
/// attempt is in flight right now (so an external cancel reaches it).
struct RetryState {
    handler: Arc<dyn ResponseHandler>,
    current_attempt: AtomicUsize,
    current_control: Mutex<Option<RequestControl>>,
    canceled: AtomicBool,
}

struct AttemptHandler {
    state: Arc<RetryState>,
    attempt: usize,
    outcome: Mutex<Option<oneshot::Sender<Result<(Bytes, Vec<Bytes>), RpcError>>>>,
}

impl ResponseHandler for AttemptHandler {
    fn on_response(&self, result: Result<(Bytes, Vec<Bytes>), RpcError>) {
        if let Some(tx) = self.outcome.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    fn on_acknowledged(&self) {
        // Swallow acknowledgements from superseded attempts (spec §4.3).
        if self.state.current_attempt.load(Ordering::SeqCst) == self.attempt {
            self.state.handler.on_acknowledged();
        }
    }
}

/// Retries retriable failures up to `policy.max_attempts`, waiting `policy.backoff` between
/// tries, bounded overall by `policy.retry_timeout` (spec §4.3). The [`RequestControl`] returned
/// to the caller keeps the same request id across every attempt; canceling it cancels whichever
/// attempt is currently in flight.
pub struct RetryingChannel {
    inner: Arc<dyn RpcChannel>,
    policy: RetryPolicy,
}

impl RetryingChannel {
    pub fn new(inner: Arc<dyn RpcChannel>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(RetryingChannel { inner, policy })
    }
}

impl RpcChannel for RetryingChannel {
    fn send(&self, request: OutgoingRequest, handler: Arc<dyn ResponseHandler>, options: ChannelOptions) -> RequestControl {
        let public_id = RequestId::generate();

        let state = Arc::new(RetryState {
            handler,
            current_attempt: AtomicUsize::new(0),
            current_control: Mutex::new(None),
            canceled: AtomicBool::new(false),
        });

        let inner = self.inner.clone();
        let policy = self.policy;
        let state_for_task = state.clone();
        Dispatcher::spawn_light(async move {
            let deadline = policy.retry_timeout.map(|d| tokio::time::Instant::now() + d);
            let mut request = request;
            let mut attempt = 0usize;
            loop {
                if state_for_task.canceled.load(Ordering::SeqCst) {
                    return;
                }
                request.retry = attempt > 0;
                let (tx, rx) = oneshot::channel();
                state_for_task.current_attempt.store(attempt, Ordering::SeqCst);
                let attempt_handler = Arc::new(AttemptHandler {
                    state: state_for_task.clone(),
                    attempt,
                    outcome: Mutex::new(Some(tx)),
                });
                let control = inner.send(request.clone(), attempt_handler, options.clone());
                *state_for_task.current_control.lock().unwrap() = Some(control);

                let result = rx.await.unwrap_or_else(|_| Err(RpcError::canceled("attempt dropped")));
                let retry_left = attempt + 1 < policy.max_attempts;
                let within_deadline = deadline.map_or(true, |d| tokio::time::Instant::now() < d);
                match &result {
                    Err(error) if error.is_retriable() && retry_left && within_deadline => {
                        debug!("attempt {attempt} failed retriably: {error}; retrying");
                        attempt += 1;
                        tokio::time::sleep(policy.backoff).await;
                    }
                    _ => {
                        state_for_task.handler.on_response(result);
                        return;
                    }
                }
            }
        });

        let canceler = Arc::new(move || {
            state.canceled.store(true, Ordering::SeqCst);
            if let Some(control) = state.current_control.lock().unwrap().clone() {
                control.cancel();
            }
        });

        RequestControl::new(public_id, canceler)
    }

    fn terminate(&self, error: RpcError) {
        self.inner.terminate(error);
    }
}
