// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Service dispatch (spec §4.5): method registration, queueing, concurrency gating,
//! cancellation, and the reply path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, warn};
use tokio::sync::Semaphore;

use crate::bus::Bus;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::ids::{RealmId, RequestId};
use crate::keeper::{RequestOutcome, ResponseKeeper};
use crate::message::{self, Message, RequestHeader, ResponseHeader, WireError};

use super::context::{ContextState, ServiceContext};
use super::method::{EffectiveLimits, MethodConfig, MethodDescriptor};

/// A generic-enough protocol-version check (spec §4.5: "neither generic nor matching").
pub const GENERIC_PROTOCOL_VERSION: u32 = 0;

struct MethodState {
    descriptor: MethodDescriptor,
    queue: Mutex<VecDeque<ServiceContext>>,
    /// "queued + in-flight" admitted count (spec §8 property 5), decremented only when a context
    /// releases its resources.
    queue_size: AtomicUsize,
    semaphore: Arc<Semaphore>,
    /// Reentrant-guard for the schedule routine (spec §4.5 "reentrant-guarded per thread"):
    /// whichever caller wins the swap drives the drain loop; others' enqueues are picked up by
    /// the loop's re-check before it releases the guard.
    scheduling: AtomicBool,
}

impl MethodState {
    fn new(descriptor: MethodDescriptor, limits: EffectiveLimits) -> Self {
        let permits = limits.max_concurrency.unwrap_or(Semaphore::MAX_PERMITS);
        MethodState {
            descriptor,
            queue: Mutex::new(VecDeque::new()),
            queue_size: AtomicUsize::new(0),
            semaphore: Arc::new(Semaphore::new(permits)),
            scheduling: AtomicBool::new(false),
        }
    }
}

/// Registers methods, enforces queue/concurrency limits, runs handlers, and produces replies
/// (spec §4.5).
pub struct ServiceBase {
    pub name: String,
    protocol_version: u32,
    methods: RwLock<HashMap<String, Arc<MethodState>>>,
    overrides: RwLock<HashMap<String, MethodConfig>>,
    stopped: AtomicBool,
    response_keeper: Option<Arc<ResponseKeeper>>,
    cancelable_contexts: Mutex<HashMap<RequestId, ServiceContext>>,
    contexts_by_bus: Mutex<HashMap<usize, HashSet<RequestId>>>,
}

fn bus_key(bus: &Arc<dyn Bus>) -> usize {
    Arc::as_ptr(bus) as *const () as usize
}

impl ServiceBase {
    pub fn new(name: impl Into<String>, protocol_version: u32, response_keeper: Option<Arc<ResponseKeeper>>) -> Arc<Self> {
        Arc::new(ServiceBase {
            name: name.into(),
            protocol_version,
            methods: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            response_keeper,
            cancelable_contexts: Mutex::new(HashMap::new()),
            contexts_by_bus: Mutex::new(HashMap::new()),
        })
    }

    /// `RegisterMethod(descriptor)` (spec §4.5).
    pub fn register_method(&self, descriptor: MethodDescriptor) {
        let limits = descriptor.effective_limits(self.overrides.read().unwrap().get(&descriptor.name));
        let name = descriptor.name.clone();
        self.methods
            .write()
            .unwrap()
            .insert(name, Arc::new(MethodState::new(descriptor, limits)));
    }

    /// Applies live configuration for this service (spec §6: "All reconfiguration is live").
    /// Late method registrations pick up configuration by method name at registration time; a
    /// currently-registered method whose limits change here takes effect for requests admitted
    /// from this point on (the concurrency semaphore's *total* permit count is not retroactively
    /// resized for already-issued permits, matching typical semaphore semantics).
    pub fn configure(&self, overrides: HashMap<String, MethodConfig>) {
        *self.overrides.write().unwrap() = overrides;
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Awaits graceful drain: all currently admitted (queued + running) requests across every
    /// method finish. New requests are already rejected with `Unavailable` once `stop()` has run.
    pub async fn await_drain(&self) {
        loop {
            let total: usize = self
                .methods
                .read()
                .unwrap()
                .values()
                .map(|m| m.queue_size.load(Ordering::SeqCst))
                .sum();
            if total == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// `HandleRequest(header, message, replyBus)` (spec §4.5).
    pub fn handle_request(self: &Arc<Self>, header: RequestHeader, message: Message, reply_bus: Weak<dyn Bus>) {
        if self.stopped.load(Ordering::SeqCst) {
            self.reply_immediately(&header, reply_bus, RpcError::unavailable("service stopped"));
            return;
        }
        if header.protocol_version != GENERIC_PROTOCOL_VERSION && header.protocol_version != self.protocol_version {
            self.reply_immediately(
                &header,
                reply_bus,
                RpcError::protocol(format!(
                    "protocol version mismatch: service is {}, request is {}",
                    self.protocol_version, header.protocol_version
                )),
            );
            return;
        }
        let Some(method) = self.methods.read().unwrap().get(&header.method).cloned() else {
            self.reply_immediately(&header, reply_bus, RpcError::no_such_method(header.method.clone()));
            return;
        };

        // Recomputed on every request so a live `configure()` call takes effect immediately
        // (spec §6: "All reconfiguration is live"); only the concurrency semaphore's fixed
        // permit count, sized once at registration, can't be resized this way.
        let limits = method
            .descriptor
            .effective_limits(self.overrides.read().unwrap().get(&header.method));
        // Admission is bounded by `max_queue_size` alone, independent of the concurrency semaphore
        // (spec §4.5 step 4: "current queue size counter > MaxQueueSize" rejects; read-then-increment
        // against that counter admits up to `max_queue_size + 1` before the check catches up, which
        // is the same race the original accepts rather than something to close here).
        let admission_capacity = limits.max_queue_size.saturating_add(1);
        let admitted = method
            .queue_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < admission_capacity).then_some(n + 1));
        if admitted.is_err() {
            self.reply_immediately(
                &header,
                reply_bus,
                RpcError::queue_size_limit_exceeded(header.method.clone(), limits.max_queue_size),
            );
            return;
        }

        let realm_id = header.realm_id;
        let request_id = header.request_id;
        let cancelable = method.descriptor.cancelable;
        let context = ServiceContext::new(header, message, realm_id, reply_bus.clone(), cancelable);
        context.set_response_codec(method.descriptor.response_codec.clone());

        if cancelable {
            self.cancelable_contexts.lock().unwrap().insert(request_id, context.clone());
            if let Some(bus) = reply_bus.upgrade() {
                self.contexts_by_bus.lock().unwrap().entry(bus_key(&bus)).or_default().insert(request_id);
            }
        }

        method.queue.lock().unwrap().push_back(context);
        self.schedule(method);
    }

    /// `HandleRequestCancelation(id)` (spec §4.5).
    pub fn handle_request_cancelation(&self, id: RequestId) {
        if let Some(context) = self.cancelable_contexts.lock().unwrap().remove(&id) {
            context.cancel();
        }
    }

    /// Cancels every cancelable context registered against `bus` (spec §4.6: "cancel in-flight
    /// work on bus termination").
    pub fn cancel_contexts_for_bus(&self, bus: &Arc<dyn Bus>) {
        let ids = self.contexts_by_bus.lock().unwrap().remove(&bus_key(bus));
        let Some(ids) = ids else { return };
        let mut map = self.cancelable_contexts.lock().unwrap();
        for id in ids {
            if let Some(context) = map.remove(&id) {
                context.cancel();
            }
        }
    }

    fn reply_immediately(&self, header: &RequestHeader, reply_bus: Weak<dyn Bus>, error: RpcError) {
        let Some(bus) = reply_bus.upgrade() else { return };
        let response_header = ResponseHeader {
            request_id: header.request_id,
            error: Some(WireError::from(&error)),
            body_format: None,
            memory_zone: None,
            codec: None,
        };
        if let Ok(message) = message::build_error_response(&response_header) {
            tokio::spawn(async move {
                let _ = bus.send(message, false).await;
            });
        }
    }

    /// The schedule routine (spec §4.5 "Scheduling"): while the method's concurrency semaphore
    /// has room and the queue is non-empty, pop one context, acquire a slot, and run it.
    fn schedule(self: &Arc<Self>, method: Arc<MethodState>) {
        if method.scheduling.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let permit = match method.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let next = method.queue.lock().unwrap().pop_front();
            let Some(context) = next else {
                drop(permit);
                break;
            };
            let service = self.clone();
            let method = method.clone();
            tokio::spawn(async move {
                service.run_one(method, context, permit).await;
            });
        }
        method.scheduling.store(false, Ordering::SeqCst);
        // Re-check for a lost wakeup: something may have enqueued or a permit may have been
        // released between our last failed attempt and clearing the guard.
        let queue_nonempty = !method.queue.lock().unwrap().is_empty();
        let permit_available = method.semaphore.available_permits() > 0;
        if queue_nonempty && permit_available {
            self.schedule(method);
        }
    }

    async fn run_one(self: Arc<Self>, method: Arc<MethodState>, context: ServiceContext, permit: tokio::sync::OwnedSemaphorePermit) {
        let release_rx = context.take_resource_release_receiver();
        context.begin_running();

        let mutation_id = context.mutation_id();
        let is_retry = context.is_retry();

        if let (Some(keeper), Some(_)) = (&self.response_keeper, mutation_id) {
            let ctx_for_hit = context.clone();
            let ctx_for_miss = context.clone();
            let served = keeper
                .try_reply_from(
                    mutation_id,
                    is_retry,
                    move |result| ctx_for_hit.reply(result.map(|bytes| (bytes, Vec::new()))),
                    move || {
                        let rx = ctx_for_miss.subscribe_completion();
                        Box::pin(async move {
                            rx.await.unwrap_or_else(|_| RequestOutcome::Failed(RpcError::canceled("context dropped")))
                        }) as crate::keeper::OutcomeFuture
                    },
                )
                .await;
            match served {
                Ok(true) => {
                    self.finish_request(&method, &context, permit, release_rx).await;
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    context.reply(Err(error));
                    self.finish_request(&method, &context, permit, release_rx).await;
                    return;
                }
            }
        }

        self.dispatch_to_handler(&method, &context).await;
        self.finish_request(&method, &context, permit, release_rx).await;
    }

    async fn dispatch_to_handler(&self, method: &Arc<MethodState>, context: &ServiceContext) {
        let outcome: Result<(), String> = if let Some(heavy) = method.descriptor.heavy_handler.clone() {
            let heavy_context = context.clone();
            let join = Dispatcher::spawn_heavy(async move {
                AssertUnwindSafe(heavy(heavy_context)).catch_unwind().await
            });
            match join.await {
                Ok(inner) => inner.map_err(panic_message),
                Err(_join_error) => Err("heavy handler task panicked".to_string()),
            }
        } else {
            let handler = method.descriptor.handler.clone();
            AssertUnwindSafe(handler(context.clone())).catch_unwind().await.map_err(panic_message)
        };

        if let Err(panic_message) = outcome {
            warn!("[{}] handler panicked: {panic_message}", context.request_id());
            // "A raised exception is converted into an error reply" (spec §4.5). If the handler
            // already replied before panicking, `reply` below is a silent no-op (double-reply
            // guard).
            context.reply(Err(RpcError::new(crate::error::ErrorCode::Transport, panic_message)));
        }

        if matches!(context.state(), ContextState::Running) {
            // Handlers are expected to call `context.reply` themselves; this only covers the
            // (buggy, but not fatal) case of a handler returning without replying.
            warn!("[{}] handler returned without replying", context.request_id());
            context.reply(Err(RpcError::transport("handler completed without a reply")));
        }
    }

    async fn finish_request(
        &self,
        method: &Arc<MethodState>,
        context: &ServiceContext,
        permit: tokio::sync::OwnedSemaphorePermit,
        release_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        let _ = release_rx.await;
        drop(permit);
        method.queue_size.fetch_sub(1, Ordering::SeqCst);
        self.cancelable_contexts.lock().unwrap().remove(&context.request_id());
        debug!("[{}] request complete", context.request_id());
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
