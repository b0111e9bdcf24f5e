// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! End-to-end scenarios from spec.md §8, driven over an in-process [`LoopbackBus`] pair since real
//! bus/TLS/framing is an explicit non-goal (spec §1).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;

use corerpc::bus::{Bus, BusHandler, LoopbackBus};
use corerpc::client::channel::BusFactory;
use corerpc::client::{ChannelOptions, OutgoingRequest, ResponseHandler, RpcChannel};
use corerpc::error::ErrorCode;
use corerpc::keeper::{ResponseKeeper, ResponseKeeperConfig};
use corerpc::message;
use corerpc::server::method::handler_fn;
use corerpc::server::{MethodDescriptor, Server, ServiceBase};
use corerpc::stream::wrappers::{feedback_sink, ClientOutputStream};
use corerpc::stream::AttachmentsInputStream;
use corerpc::{Channel, RealmId};

struct Recorder {
    results: StdMutex<Vec<Result<(Bytes, Vec<Bytes>), corerpc::RpcError>>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder { results: StdMutex::new(Vec::new()) })
    }
}

impl ResponseHandler for Recorder {
    fn on_response(&self, result: Result<(Bytes, Vec<Bytes>), corerpc::RpcError>) {
        self.results.lock().unwrap().push(result);
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

fn channel_over(bus: Arc<dyn Bus>) -> Arc<Channel> {
    let factory: BusFactory = Arc::new(move |_band| bus.clone());
    Channel::new(factory)
}

/// S1: a single `echo` call over a fresh channel returns the body it was sent.
#[tokio::test]
async fn s1_happy_path_call() {
    let server = Server::new();
    let service = ServiceBase::new("Echo", 0, None);
    service.register_method(MethodDescriptor::new(
        "echo",
        handler_fn(|ctx| async move {
            let body = ctx.message().body().cloned().unwrap_or_default();
            ctx.reply(Ok((body, vec![])));
        }),
    ));
    server.register_service(service, [RealmId::NIL]);

    let (client_bus, server_bus) = LoopbackBus::pair();
    server.accept(server_bus as Arc<dyn Bus>);
    let channel = channel_over(client_bus as Arc<dyn Bus>);

    let recorder = Recorder::new();
    let request = OutgoingRequest::new("Echo", "echo").with_body(Bytes::from_static(b"hi"));
    channel.send(
        request,
        recorder.clone(),
        ChannelOptions { timeout: Some(Duration::from_millis(1000)), ..Default::default() },
    );

    wait_until(|| !recorder.results.lock().unwrap().is_empty()).await;
    let results = recorder.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let (body, attachments) = results[0].as_ref().unwrap();
    assert_eq!(body, &Bytes::from_static(b"hi"));
    assert!(attachments.is_empty());
}

/// S2: a mutation retried with the same mutation id is served from the response keeper, not
/// re-executed; both callers observe the same bytes, and the keeper ends up with exactly one
/// finished entry for that id.
#[tokio::test]
async fn s2_retried_mutation_runs_handler_once() {
    let keeper = ResponseKeeper::new(ResponseKeeperConfig { enable_warmup: false, ..Default::default() });
    keeper.start();

    let server = Server::new();
    let service = ServiceBase::new("Counter", 0, Some(keeper.clone()));
    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_for_handler = invocations.clone();
    service.register_method(MethodDescriptor::new(
        "increment",
        handler_fn(move |ctx| {
            let invocations = invocations_for_handler.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.reply(Ok((Bytes::from_static(b"1"), vec![])));
            }
        }),
    ));
    server.register_service(service, [RealmId::NIL]);

    let (client_bus, server_bus) = LoopbackBus::pair();
    server.accept(server_bus as Arc<dyn Bus>);
    let channel = channel_over(client_bus as Arc<dyn Bus>);

    let mutation_id = corerpc::ids::MutationId::generate();
    let first_recorder = Recorder::new();
    let first = OutgoingRequest::new("Counter", "increment").with_mutation_id(mutation_id);
    channel.send(first, first_recorder.clone(), ChannelOptions::default());

    // The retry races the first attempt's handler, matching the scenario's "second request,
    // marked retry, arrives while the first is still running".
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second_recorder = Recorder::new();
    let mut second = OutgoingRequest::new("Counter", "increment").with_mutation_id(mutation_id);
    second.retry = true;
    channel.send(second, second_recorder.clone(), ChannelOptions::default());

    wait_until(|| !first_recorder.results.lock().unwrap().is_empty() && !second_recorder.results.lock().unwrap().is_empty()).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let first_results = first_recorder.results.lock().unwrap();
    let second_results = second_recorder.results.lock().unwrap();
    let (first_body, _) = first_results[0].as_ref().unwrap();
    let (second_body, _) = second_results[0].as_ref().unwrap();
    assert_eq!(first_body, second_body);
    assert_eq!(keeper.counters.finished.load(Ordering::SeqCst), 1);
}

/// S3: with `MaxQueueSize=1, MaxConcurrency=1`, three concurrent requests leave one running, one
/// queued, and one rejected with `RequestQueueSizeLimitExceeded`; the admitted two eventually
/// complete successfully.
#[tokio::test]
async fn s3_queue_overflow_rejects_third_request() {
    let server = Server::new();
    let service = ServiceBase::new("Slow", 0, None);
    service.register_method(
        MethodDescriptor::new(
            "work",
            handler_fn(|ctx| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ctx.reply(Ok((Bytes::new(), vec![])));
            }),
        )
        .with_max_concurrency(1)
        .with_max_queue_size(1),
    );
    server.register_service(service, [RealmId::NIL]);

    let (client_bus, server_bus) = LoopbackBus::pair();
    server.accept(server_bus as Arc<dyn Bus>);
    let channel = channel_over(client_bus as Arc<dyn Bus>);

    let recorders: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
    for recorder in &recorders {
        channel.send(OutgoingRequest::new("Slow", "work"), recorder.clone(), ChannelOptions::default());
    }

    wait_until(|| recorders.iter().all(|r| !r.results.lock().unwrap().is_empty())).await;

    let mut overflow_count = 0;
    let mut ok_count = 0;
    for recorder in &recorders {
        let results = recorder.results.lock().unwrap();
        match &results[0] {
            Ok(_) => ok_count += 1,
            Err(error) if error.code() == ErrorCode::RequestQueueSizeLimitExceeded => overflow_count += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(overflow_count, 1);
    assert_eq!(ok_count, 2);
}

/// S4: a client-side cancel racing the server's in-flight reply delivers exactly one outcome to
/// the handler, never two.
#[tokio::test]
async fn s4_cancel_races_response_delivers_exactly_once() {
    let server = Server::new();
    let service = ServiceBase::new("Echo", 0, None);
    service.register_method(MethodDescriptor::new(
        "slow_echo",
        handler_fn(|ctx| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            ctx.reply(Ok((Bytes::from_static(b"done"), vec![])));
        }),
    ));
    server.register_service(service, [RealmId::NIL]);

    let (client_bus, server_bus) = LoopbackBus::pair();
    server.accept(server_bus as Arc<dyn Bus>);
    let channel = channel_over(client_bus as Arc<dyn Bus>);

    let recorder = Recorder::new();
    let control = channel.send(OutgoingRequest::new("Echo", "slow_echo"), recorder.clone(), ChannelOptions::default());
    control.cancel();

    // Give the server's handler time to finish and its (possibly futile) reply time to arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = recorder.results.lock().unwrap();
    assert_eq!(results.len(), 1, "exactly one outcome must be delivered, never a second");
}

/// S5: terminating the bus while requests are in flight resolves every one of them with the
/// termination error, and subsequent sends on the same channel fail the same way.
#[tokio::test]
async fn s5_bus_termination_retires_in_flight_requests() {
    // Nothing accepts `server_bus`, so these requests never get a real reply; termination is the
    // only way they resolve.
    let (client_bus, _server_bus) = LoopbackBus::pair();
    let client_bus: Arc<dyn Bus> = client_bus;
    let channel = channel_over(client_bus);

    let recorders: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
    for recorder in &recorders {
        channel.send(OutgoingRequest::new("Echo", "never_replies"), recorder.clone(), ChannelOptions::default());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.terminate(corerpc::RpcError::unavailable("bus terminated"));

    for recorder in &recorders {
        let results = recorder.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    let late_recorder = Recorder::new();
    channel.send(OutgoingRequest::new("Echo", "never_replies"), late_recorder.clone(), ChannelOptions::default());
    wait_until(|| !late_recorder.results.lock().unwrap().is_empty()).await;
    assert!(late_recorder.results.lock().unwrap()[0].is_err());
}

/// S6: with a window of 16384 bytes, a producer writing three 10000-byte attachments blocks its
/// second write until the consumer's feedback credits enough of the first back, and every byte
/// arrives in order.
#[tokio::test]
async fn s6_streaming_window_backpressure_end_to_end() {
    let (producer_bus, consumer_bus) = LoopbackBus::pair();
    let producer_bus: Arc<dyn Bus> = producer_bus;
    let consumer_bus: Arc<dyn Bus> = consumer_bus;
    let request_id = corerpc::ids::RequestId::generate();

    let input = AttachmentsInputStream::new(feedback_sink(consumer_bus.clone(), request_id));
    struct PayloadRouter {
        input: Arc<AttachmentsInputStream>,
    }
    impl BusHandler for PayloadRouter {
        fn on_message(&self, msg: corerpc::message::Message) {
            if let Ok(header) = message::parse_stream_payload_header(&msg) {
                self.input.on_payload(header, msg.parts()[1..].to_vec());
            }
        }
        fn on_acknowledged(&self, _m: &corerpc::message::Message) {}
        fn on_terminated(&self, error: corerpc::RpcError) {
            self.input.abort(error);
        }
    }
    let router = Arc::new(PayloadRouter { input: input.clone() });
    consumer_bus.set_handler(Arc::downgrade(&(router.clone() as Arc<dyn BusHandler>)));

    struct FeedbackRouter {
        output: Arc<ClientOutputStream>,
    }
    impl BusHandler for FeedbackRouter {
        fn on_message(&self, msg: corerpc::message::Message) {
            if let Ok(header) = message::parse_stream_feedback_header(&msg) {
                self.output.on_feedback(header.read_position);
            }
        }
        fn on_acknowledged(&self, _m: &corerpc::message::Message) {}
        fn on_terminated(&self, _error: corerpc::RpcError) {}
    }

    let output_for_second = Arc::new(ClientOutputStream::with_window(producer_bus.clone(), request_id, 16384));
    let feedback_router = Arc::new(FeedbackRouter { output: output_for_second.clone() });
    producer_bus.set_handler(Arc::downgrade(&(feedback_router.clone() as Arc<dyn BusHandler>)));

    let chunk = |n: usize| Bytes::from(vec![0xABu8; n]);

    output_for_second.write(chunk(10000)).await.unwrap();

    let second_output = output_for_second.clone();
    let second_write = tokio::spawn(async move { second_output.write(chunk(10000)).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!second_write.is_finished(), "second 10000-byte write must block: window is only 16384");

    let first = input.read(None).await.unwrap().unwrap();
    assert_eq!(first.len(), 10000);

    second_write.await.unwrap().unwrap();
    let second = input.read(None).await.unwrap().unwrap();
    assert_eq!(second.len(), 10000);

    output_for_second.write(chunk(10000)).await.unwrap();
    let third = input.read(None).await.unwrap().unwrap();
    assert_eq!(third.len(), 10000);

    // `Close()` only resolves once the peer's feedback acks it, regardless of window slack, so it
    // must run concurrently with the read that consumes the end-of-stream marker.
    let close_output = output_for_second.clone();
    let close_handle = tokio::spawn(async move { close_output.close().await });
    assert!(input.read(None).await.unwrap().is_none());
    close_handle.await.unwrap().unwrap();
}
