// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The response keeper (spec §4.4): at-most-once semantics for mutating RPC methods.
//!
//! Two maps keyed by mutation id — `pending` (a shared future of the eventual response) and
//! `finished` (the already-computed response) — plus a FIFO eviction queue enforce the invariants
//! in spec §3: a mutation id is in at most one map at a time, and every finished entry has exactly
//! one eviction-queue entry. All map mutations happen under one short lock; the pending promise is
//! always fulfilled *outside* the lock (spec §4.4 "Concurrency"), following the same
//! extract-then-call discipline the channel's active-requests map uses (spec §9).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::trace;
use tokio::sync::oneshot;

use crate::error::{ErrorCode, RpcError};
use crate::ids::MutationId;

/// `ExpirationTime`, `EnableWarmup`, `WarmupTime` (spec §6).
#[derive(Copy, Clone, Debug)]
pub struct ResponseKeeperConfig {
    pub expiration_time: Duration,
    pub enable_warmup: bool,
    pub warmup_time: Duration,
    /// How often the eviction task runs (spec §4.4: "period: 1 second").
    pub eviction_period: Duration,
}

impl Default for ResponseKeeperConfig {
    fn default() -> Self {
        ResponseKeeperConfig {
            expiration_time: Duration::from_secs(300),
            enable_warmup: true,
            warmup_time: Duration::from_secs(60),
            eviction_period: Duration::from_secs(1),
        }
    }
}

type ResponseResult = Result<Bytes, RpcError>;
type SharedResponse = Shared<BoxFuture<'static, ResponseResult>>;

struct PendingSlot {
    future: SharedResponse,
    sender: Mutex<Option<oneshot::Sender<ResponseResult>>>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<MutationId, Arc<PendingSlot>>,
    finished: HashMap<MutationId, Bytes>,
    eviction: VecDeque<(MutationId, Instant)>,
}

/// Accounting counters matching "Accounting counters are incremented" / the profiling task's
/// gauges (spec §4.4).
#[derive(Default)]
pub struct KeeperCounters {
    pub pending: AtomicUsize,
    pub finished: AtomicUsize,
    pub completed_total: AtomicUsize,
    pub canceled_total: AtomicUsize,
    pub evicted_total: AtomicUsize,
}

pub struct ResponseKeeper {
    inner: Mutex<Inner>,
    config: Mutex<ResponseKeeperConfig>,
    active: AtomicBool,
    warmup_deadline: Mutex<Option<Instant>>,
    pub counters: Arc<KeeperCounters>,
}

impl ResponseKeeper {
    pub fn new(config: ResponseKeeperConfig) -> Arc<Self> {
        Arc::new(ResponseKeeper {
            inner: Mutex::new(Inner::default()),
            config: Mutex::new(config),
            active: AtomicBool::new(false),
            warmup_deadline: Mutex::new(None),
            counters: Arc::new(KeeperCounters::default()),
        })
    }

    pub fn configure(&self, config: ResponseKeeperConfig) {
        *self.config.lock().unwrap() = config;
    }

    fn config(&self) -> ResponseKeeperConfig {
        *self.config.lock().unwrap()
    }

    /// `Start()` (spec §4.4). Idempotent while active.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = self.config();
        let deadline = config.enable_warmup.then(|| Instant::now() + config.warmup_time);
        *self.warmup_deadline.lock().unwrap() = deadline;
    }

    /// `Stop()` (spec §4.4): clears both maps and the eviction queue. Pending duplicate callers
    /// are resolved with `Unavailable` rather than left hanging, since the spec does not define a
    /// result for in-flight `TryBeginRequest` callers across a stop.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        *self.warmup_deadline.lock().unwrap() = None;
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.finished.clear();
            inner.eviction.clear();
            std::mem::take(&mut inner.pending)
        };
        self.counters.pending.store(0, Ordering::SeqCst);
        self.counters.finished.store(0, Ordering::SeqCst);
        for (_, slot) in pending {
            if let Some(sender) = slot.sender.lock().unwrap().take() {
                let _ = sender.send(Err(RpcError::unavailable("response keeper stopped")));
            }
        }
    }

    fn warmup_active(&self) -> bool {
        match *self.warmup_deadline.lock().unwrap() {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    /// `TryBeginRequest(id, isRetry) -> Future<Response> | null` (spec §4.4).
    pub fn try_begin_request(
        &self,
        id: MutationId,
        is_retry: bool,
    ) -> Result<Option<SharedResponse>, RpcError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.pending.get(&id) {
            if !is_retry {
                return Err(RpcError::duplicate_not_marked_retry(id));
            }
            return Ok(Some(slot.future.clone()));
        }

        if let Some(bytes) = inner.finished.get(&id) {
            if !is_retry {
                return Err(RpcError::duplicate_not_marked_retry(id));
            }
            let bytes = bytes.clone();
            let ready: BoxFuture<'static, ResponseResult> = Box::pin(async move { Ok(bytes) });
            return Ok(Some(ready.shared()));
        }

        drop(inner);
        if is_retry && self.warmup_active() {
            return Err(RpcError::warmup());
        }
        let mut inner = self.inner.lock().unwrap();
        // Re-check under lock: another thread may have raced us between the drop above and here.
        if let Some(slot) = inner.pending.get(&id) {
            if !is_retry {
                return Err(RpcError::duplicate_not_marked_retry(id));
            }
            return Ok(Some(slot.future.clone()));
        }

        let (tx, rx) = oneshot::channel::<ResponseResult>();
        let future: BoxFuture<'static, ResponseResult> = Box::pin(async move {
            rx.await.unwrap_or_else(|_| Err(RpcError::canceled("response keeper promise dropped")))
        });
        let slot = Arc::new(PendingSlot {
            future: future.shared(),
            sender: Mutex::new(Some(tx)),
        });
        inner.pending.insert(id, slot);
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    /// `EndRequest(id, response)` (spec §4.4). Duplicate calls for the same id are ignored.
    pub fn end_request(&self, id: MutationId, response: Bytes) {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = inner.pending.remove(&id) else {
                return;
            };
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            inner.finished.insert(id, response.clone());
            inner.eviction.push_back((id, Instant::now()));
            self.counters.finished.fetch_add(1, Ordering::SeqCst);
            self.counters.completed_total.fetch_add(1, Ordering::SeqCst);
            Arc::try_unwrap(slot).ok().and_then(|s| s.sender.into_inner().unwrap())
        };
        if let Some(sender) = sender {
            let _ = sender.send(Ok(response));
        }
    }

    /// `CancelRequest(id, error)` (spec §4.4). No entry enters the finished map.
    pub fn cancel_request(&self, id: MutationId, error: RpcError) {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = inner.pending.remove(&id) else {
                return;
            };
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.canceled_total.fetch_add(1, Ordering::SeqCst);
            Arc::try_unwrap(slot).ok().and_then(|s| s.sender.into_inner().unwrap())
        };
        if let Some(sender) = sender {
            let _ = sender.send(Err(error));
        }
    }

    /// Pops entries older than `ExpirationTime` (spec §4.4 "Eviction"). Returns the number
    /// evicted; called by the periodic eviction task, and directly by tests.
    pub fn evict_expired(&self) -> usize {
        let expiration = self.config().expiration_time;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = 0;
        while let Some((id, arrival)) = inner.eviction.front().copied() {
            if now.duration_since(arrival) <= expiration {
                break;
            }
            inner.eviction.pop_front();
            inner.finished.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            self.counters.finished.fetch_sub(evicted, Ordering::SeqCst);
            self.counters.evicted_total.fetch_add(evicted, Ordering::SeqCst);
            trace!("response keeper evicted {evicted} expired entries");
        }
        evicted
    }

    /// Spawns the periodic eviction task on the light invoker (spec §4.4). Returns a handle the
    /// caller can abort on shutdown.
    pub fn spawn_eviction_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let keeper = self.clone();
        crate::dispatcher::Dispatcher::spawn_light(async move {
            let period = keeper.config().eviction_period;
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                keeper.evict_expired();
            }
        })
    }
}

/// Outcome a [`crate::server::context::ServiceContext`] reports back through
/// [`ResponseKeeper::try_reply_from`]'s subscription, decoupling `keeper.rs` from the concrete
/// context type's full API.
pub enum RequestOutcome {
    Completed(Bytes),
    Failed(RpcError),
}

/// A future yielding the eventual outcome of a request, as seen by the integration helper.
pub type OutcomeFuture = Pin<Box<dyn Future<Output = RequestOutcome> + Send>>;

impl ResponseKeeper {
    /// `TryReplyFrom(context) -> bool` (spec §4.4), generalized: takes the mutation id (if any),
    /// the retry flag, a callback to serve the kept-or-fresh response, and a function producing
    /// the eventual outcome of executing the request fresh. Returns `true` if the reply was
    /// served from the keeper (a hit); on a miss, subscribes to `subscribe_outcome` and forwards
    /// its result through [`Self::end_request`]/[`Self::cancel_request`] once it resolves.
    pub async fn try_reply_from<F>(
        self: &Arc<Self>,
        mutation_id: Option<MutationId>,
        is_retry: bool,
        on_hit: impl FnOnce(ResponseResult),
        subscribe_outcome: impl FnOnce() -> F,
    ) -> Result<bool, RpcError>
    where
        F: Future<Output = RequestOutcome> + Send + 'static,
    {
        let Some(id) = mutation_id else {
            return Ok(false);
        };
        match self.try_begin_request(id, is_retry)? {
            Some(shared) => {
                let result = shared.await;
                on_hit(result);
                Ok(true)
            }
            None => {
                let outcome_future = subscribe_outcome();
                let keeper = Arc::downgrade(self);
                crate::dispatcher::Dispatcher::spawn_light(async move {
                    let outcome = outcome_future.await;
                    if let Some(keeper) = keeper.upgrade() {
                        match outcome {
                            RequestOutcome::Completed(bytes) => keeper.end_request(id, bytes),
                            RequestOutcome::Failed(error) if error.code() == ErrorCode::Unavailable => {
                                keeper.cancel_request(id, error);
                            }
                            RequestOutcome::Failed(error) => keeper.cancel_request(id, error),
                        }
                    }
                });
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_mutation_shares_single_execution() {
        let keeper = ResponseKeeper::new(ResponseKeeperConfig {
            enable_warmup: false,
            ..Default::default()
        });
        keeper.start();
        let id = MutationId::generate();

        let first = keeper.try_begin_request(id, false).unwrap();
        assert!(first.is_none());

        let second = keeper.try_begin_request(id, true).unwrap();
        assert!(second.is_some());

        keeper.end_request(id, Bytes::from_static(b"result"));

        let first_again = keeper.try_begin_request(id, true).unwrap().unwrap();
        assert_eq!(first_again.await.unwrap(), Bytes::from_static(b"result"));
        assert_eq!(second.unwrap().await.unwrap(), Bytes::from_static(b"result"));
    }

    #[tokio::test]
    async fn non_retry_duplicate_is_rejected() {
        let keeper = ResponseKeeper::new(ResponseKeeperConfig {
            enable_warmup: false,
            ..Default::default()
        });
        keeper.start();
        let id = MutationId::generate();
        assert!(keeper.try_begin_request(id, false).unwrap().is_none());
        let err = keeper.try_begin_request(id, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn retry_before_warmup_deadline_is_refused() {
        let keeper = ResponseKeeper::new(ResponseKeeperConfig {
            enable_warmup: true,
            warmup_time: Duration::from_secs(60),
            ..Default::default()
        });
        keeper.start();
        let id = MutationId::generate();
        let err = keeper.try_begin_request(id, true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn eviction_removes_entries_past_expiration() {
        let keeper = ResponseKeeper::new(ResponseKeeperConfig {
            expiration_time: Duration::from_millis(10),
            enable_warmup: false,
            ..Default::default()
        });
        keeper.start();
        let id = MutationId::generate();
        keeper.try_begin_request(id, false).unwrap();
        keeper.end_request(id, Bytes::from_static(b"x"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(keeper.evict_expired(), 1);
        // After eviction, the id is unseen again: no warmup engaged, so a fresh (non-retry) call
        // is accepted as a brand-new request.
        assert!(keeper.try_begin_request(id, false).unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_drops_without_entering_finished_map() {
        let keeper = ResponseKeeper::new(ResponseKeeperConfig {
            enable_warmup: false,
            ..Default::default()
        });
        keeper.start();
        let id = MutationId::generate();
        let pending = keeper.try_begin_request(id, false).unwrap();
        assert!(pending.is_none());
        keeper.cancel_request(id, RpcError::canceled("aborted"));
        assert!(keeper.try_begin_request(id, false).unwrap().is_none());
    }
}
