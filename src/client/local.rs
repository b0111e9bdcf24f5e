// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The zero-copy local channel (spec §4.8): calls routed directly into a co-located [`Server`],
//! bypassing the bus entirely except for a synthetic one-shot reply sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::bus::{Bus, BusHandler};
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::ids::RequestId;
use crate::message::{self, RequestHeader};
use crate::server::Server;

use super::{ChannelOptions, OutgoingRequest, RequestControl, ResponseHandler, RpcChannel};

struct PendingEntry {
    handler: Arc<dyn ResponseHandler>,
    retired: AtomicBool,
}

impl PendingEntry {
    /// Mirrors [`super::channel::ActiveEntry::retire`]: first call wins, later ones are no-ops.
    fn retire(&self, result: Result<(Bytes, Vec<Bytes>), RpcError>) -> bool {
        if self.retired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.handler.on_response(result);
        true
    }
}

/// A one-shot [`Bus`] that hands a service's response straight to the caller's handler instead of
/// round-tripping through a real transport (spec §4.8).
struct LocalReplyBus {
    channel: Weak<LocalChannel>,
    request_id: RequestId,
    entry: Arc<PendingEntry>,
}

impl Bus for LocalReplyBus {
    fn send(&self, message: crate::message::Message, _request_ack: bool) -> BoxFuture<'static, Result<(), RpcError>> {
        let result = match message::parse_response_header(&message) {
            Ok(header) => match &header.error {
                Some(wire_error) => Err(RpcError::from(wire_error)),
                None => Ok((message.body().cloned().unwrap_or_default(), message.attachments().to_vec())),
            },
            Err(error) => Err(error),
        };
        self.entry.retire(result);
        if let Some(channel) = self.channel.upgrade() {
            channel.pending.lock().unwrap().remove(&self.request_id);
        }
        Box::pin(futures::future::ready(Ok(())))
    }

    fn set_handler(&self, _handler: Weak<dyn BusHandler>) {}
    fn terminate(&self, _error: RpcError) {}
    fn is_terminated(&self) -> bool {
        false
    }
}

/// Bypasses the bus for calls to a service registered on a co-located [`Server`] (spec §4.8):
/// request id, header fields, and attachments are preserved bit-identically, just never encoded
/// onto a transport.
pub struct LocalChannel {
    server: Arc<Server>,
    pending: Mutex<HashMap<RequestId, (Arc<dyn Bus>, Arc<PendingEntry>)>>,
    self_weak: Weak<LocalChannel>,
}

impl LocalChannel {
    pub fn new(server: Arc<Server>) -> Arc<Self> {
        Arc::new_cyclic(|weak| LocalChannel {
            server,
            pending: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        })
    }
}

impl RpcChannel for LocalChannel {
    fn send(&self, request: OutgoingRequest, handler: Arc<dyn ResponseHandler>, options: ChannelOptions) -> RequestControl {
        let request_id = RequestId::generate();
        let Some(service) = self.server.find_service(&request.service, request.realm_id) else {
            let error = RpcError::no_such_service(request.service.clone());
            Dispatcher::spawn_light(async move { handler.on_response(Err(error)) });
            return RequestControl::new(request_id, Arc::new(|| {}));
        };

        let start = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let header = RequestHeader {
            request_id,
            realm_id: request.realm_id,
            service: request.service.clone(),
            method: request.method.clone(),
            protocol_version: request.protocol_version,
            mutation_id: request.mutation_id,
            retry: request.retry,
            timeout_ms: options.timeout.map(|d| d.as_millis() as u64),
            start_time_unix_ms: Some(start.as_millis() as u64),
            user: request.user.clone(),
            trace_context: None,
            request_format: None,
            response_format: None,
            response_codec: None,
        };

        let entry = Arc::new(PendingEntry {
            handler,
            retired: AtomicBool::new(false),
        });

        let message = match message::build_request(&header, request.body, request.attachments) {
            Ok(message) => message,
            Err(error) => {
                entry.retire(Err(error));
                return RequestControl::new(request_id, Arc::new(|| {}));
            }
        };

        let reply_bus: Arc<dyn Bus> = Arc::new(LocalReplyBus {
            channel: self.self_weak.clone(),
            request_id,
            entry: entry.clone(),
        });
        // `ServiceContext` only keeps a weak reference to the reply bus (spec §9 "cyclic
        // references... broken with weak pointers"); a canceled or timed-out context never calls
        // back through it at all, so this entry is removed explicitly on both paths rather than
        // relying solely on `LocalReplyBus::send` running.
        self.pending.lock().unwrap().insert(request_id, (reply_bus.clone(), entry.clone()));

        service.handle_request(header, message, Arc::downgrade(&reply_bus));

        let channel_for_cancel = self.self_weak.clone();
        let canceler = Arc::new(move || {
            service.handle_request_cancelation(request_id);
            if entry.retire(Err(RpcError::canceled("request canceled by caller"))) {
                if let Some(channel) = channel_for_cancel.upgrade() {
                    channel.pending.lock().unwrap().remove(&request_id);
                }
            }
        });

        RequestControl::new(request_id, canceler)
    }

    /// There is no bus to terminate; this retires every pending local call with `error` instead
    /// (the closest analog available for a channel that never had a connection to begin with).
    fn terminate(&self, error: RpcError) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, (_, entry)) in pending {
            entry.retire(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{method::handler_fn, MethodDescriptor, ServiceBase};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Recorder {
        results: StdMutex<Vec<Result<(Bytes, Vec<Bytes>), RpcError>>>,
    }
    impl ResponseHandler for Recorder {
        fn on_response(&self, result: Result<(Bytes, Vec<Bytes>), RpcError>) {
            self.results.lock().unwrap().push(result);
        }
    }

    fn echo_server() -> Arc<Server> {
        let server = Server::new();
        let service = ServiceBase::new("Echo", 0, None);
        service.register_method(MethodDescriptor::new(
            "echo",
            handler_fn(|ctx| async move {
                let body = ctx.message().body().cloned().unwrap_or_default();
                ctx.reply(Ok((body, vec![])));
            }),
        ));
        server.register_service(service, [crate::ids::RealmId::NIL]);
        server
    }

    #[tokio::test]
    async fn routes_directly_to_service_without_a_bus() {
        let channel = LocalChannel::new(echo_server());
        let recorder = Arc::new(Recorder { results: StdMutex::new(Vec::new()) });
        channel.send(
            OutgoingRequest::new("Echo", "echo").with_body(Bytes::from_static(b"hi")),
            recorder.clone(),
            ChannelOptions::default(),
        );

        for _ in 0..50 {
            if !recorder.results.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let results = recorder.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        let (body, _) = results[0].as_ref().unwrap();
        assert_eq!(body, &Bytes::from_static(b"hi"));
        assert!(channel.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_service_replies_no_such_service() {
        let server = Server::new();
        let channel = LocalChannel::new(server);
        let recorder = Arc::new(Recorder { results: StdMutex::new(Vec::new()) });
        channel.send(OutgoingRequest::new("Missing", "noop"), recorder.clone(), ChannelOptions::default());

        for _ in 0..50 {
            if !recorder.results.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let results = recorder.results.lock().unwrap();
        assert_eq!(results[0].as_ref().unwrap_err().code(), crate::error::ErrorCode::NoSuchService);
    }

    #[tokio::test]
    async fn cancel_retires_handler_exactly_once() {
        let server = Server::new();
        let service = ServiceBase::new("Echo", 0, None);
        service.register_method(MethodDescriptor::new(
            "slow",
            handler_fn(|ctx| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                ctx.reply(Ok((Bytes::new(), vec![])));
            }),
        ));
        server.register_service(service, [crate::ids::RealmId::NIL]);
        let channel = LocalChannel::new(server);

        let recorder = Arc::new(Recorder { results: StdMutex::new(Vec::new()) });
        let control = channel.send(OutgoingRequest::new("Echo", "slow"), recorder.clone(), ChannelOptions::default());
        control.cancel();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let results = recorder.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().code(), crate::error::ErrorCode::Canceled);
    }
}
