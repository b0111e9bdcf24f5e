// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Client/server streaming wrappers (spec §4.7): glue the generic [`super::input`]/[`super::output`]
//! primitives onto a live call's bus and give callers the two standard shapes server handlers use.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::bus::Bus;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::ids::RequestId;
use crate::message::{self, StreamFeedbackHeader, StreamPayloadHeader};

use super::input::AttachmentsInputStream;
use super::output::AttachmentsOutputStream;
use super::DEFAULT_WINDOW;

/// Builds the feedback closure an [`AttachmentsInputStream`] calls on every `Read`: sends a
/// `StreamFeedback` envelope back over `bus` reporting the new `ReadPosition` (spec §4.7).
pub fn feedback_sink(bus: Arc<dyn Bus>, request_id: RequestId) -> Arc<dyn Fn(u64) + Send + Sync> {
    Arc::new(move |read_position| {
        let bus = bus.clone();
        let header = StreamFeedbackHeader { request_id, read_position };
        if let Ok(message) = message::build_stream_feedback(&header) {
            Dispatcher::spawn_light(async move {
                let _ = bus.send(message, false).await;
            });
        }
    })
}

/// Pumps `output`'s payloads onto `bus` as they become ready, stamping each with `request_id`
/// (spec §4.7). Runs until the stream closes or errors; spawned on the light invoker since it only
/// waits on the stream's own readiness notification, never on a user callback.
fn spawn_pump(bus: Arc<dyn Bus>, request_id: RequestId, output: Arc<AttachmentsOutputStream>) {
    Dispatcher::spawn_light(async move {
        while let Some((mut header, attachments)) = output.next_payload().await {
            header.request_id = request_id;
            match message::build_stream_payload(&header, attachments) {
                Ok(message) => {
                    let _ = bus.send(message, false).await;
                }
                Err(error) => {
                    output.abort(error);
                    return;
                }
            }
        }
    });
}

/// `TRpcClientInputStream` (spec §4.7): the receiving half of a streaming direction, bound to one
/// live call's bus. Incoming payloads reach it via [`Self::on_payload`]; `Read` sends feedback back
/// over the same bus as data is consumed.
pub struct ClientInputStream {
    request_id: RequestId,
    inner: Arc<AttachmentsInputStream>,
}

impl ClientInputStream {
    pub fn new(bus: Arc<dyn Bus>, request_id: RequestId) -> Self {
        ClientInputStream {
            request_id,
            inner: AttachmentsInputStream::new(feedback_sink(bus, request_id)),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Feeds one incoming `StreamPayload` envelope; the caller (connection/channel dispatch) has
    /// already matched it to this stream by request id.
    pub fn on_payload(&self, header: StreamPayloadHeader, attachments: Vec<Bytes>) {
        self.inner.on_payload(header, attachments);
    }

    pub fn abort(&self, error: RpcError) {
        self.inner.abort(error);
    }

    pub async fn read(&self, timeout: Option<Duration>) -> Result<Option<Bytes>, RpcError> {
        self.inner.read(timeout).await
    }
}

/// `TRpcClientOutputStream` (spec §4.7): the sending half of a streaming direction, bound to one
/// live call's bus. `Write`/`Close` futures resolve per the byte-window rules; a background pump
/// (spawned at construction) carries ready payloads onto the bus.
pub struct ClientOutputStream {
    request_id: RequestId,
    inner: Arc<AttachmentsOutputStream>,
}

impl ClientOutputStream {
    pub fn new(bus: Arc<dyn Bus>, request_id: RequestId) -> Self {
        Self::with_window(bus, request_id, DEFAULT_WINDOW)
    }

    pub fn with_window(bus: Arc<dyn Bus>, request_id: RequestId, window: u64) -> Self {
        let inner = AttachmentsOutputStream::new(window);
        spawn_pump(bus, request_id, inner.clone());
        ClientOutputStream { request_id, inner }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn write(&self, buf: Bytes) -> Result<(), RpcError> {
        self.inner.write(buf).await
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.inner.close().await
    }

    /// Incoming `StreamFeedback` envelope for this request.
    pub fn on_feedback(&self, read_position: u64) {
        self.inner.on_feedback(read_position);
    }
}

/// `HandleOutputStreamingRequest` (spec §4.7): pulls from `generator` until it yields `None`,
/// writing each chunk to `output` and closing the stream once the generator is exhausted.
pub async fn pull_from_generator<F, Fut>(output: Arc<AttachmentsOutputStream>, mut generator: F) -> Result<(), RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<Bytes>>,
{
    loop {
        match generator().await {
            Some(chunk) => output.write(chunk).await?,
            None => return output.close().await,
        }
    }
}

/// `HandleInputStreamingRequest` (spec §4.7): drains `input` into `writer` until the peer signals
/// end-of-stream.
pub async fn drain_into_writer<F, Fut>(input: Arc<AttachmentsInputStream>, mut writer: F) -> Result<(), RpcError>
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = Result<(), RpcError>>,
{
    loop {
        match input.read(None).await? {
            Some(chunk) => writer(chunk).await?,
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusHandler, LoopbackBus};
    use std::sync::Mutex as StdMutex;

    struct Recorder(StdMutex<Vec<crate::message::Message>>);
    impl BusHandler for Recorder {
        fn on_message(&self, message: crate::message::Message) {
            self.0.lock().unwrap().push(message);
        }
        fn on_acknowledged(&self, _m: &crate::message::Message) {}
        fn on_terminated(&self, _e: RpcError) {}
    }

    #[tokio::test]
    async fn client_output_stream_pumps_writes_onto_the_bus() {
        let (a, b) = LoopbackBus::pair();
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        b.set_handler(Arc::downgrade(&(recorder.clone() as Arc<dyn BusHandler>)));
        let request_id = RequestId::generate();
        let output = ClientOutputStream::with_window(a as Arc<dyn Bus>, request_id, 16384);

        output.write(Bytes::from_static(b"chunk")).await.unwrap();

        for _ in 0..100 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let messages = recorder.0.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        let header = message::parse_stream_payload_header(&messages[0]).unwrap();
        assert_eq!(header.request_id, request_id);
        assert_eq!(&messages[0].parts()[1..], &[Bytes::from_static(b"chunk")]);
    }

    #[tokio::test]
    async fn client_input_stream_delivers_payloads_fed_in() {
        let (a, _b) = LoopbackBus::pair();
        let request_id = RequestId::generate();
        let input = Arc::new(ClientInputStream::new(a as Arc<dyn Bus>, request_id));
        input.on_payload(
            StreamPayloadHeader { sequence_number: 0, request_id, ..Default::default() },
            vec![Bytes::from_static(b"hello")],
        );
        assert_eq!(input.read(None).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn pull_from_generator_closes_stream_when_exhausted() {
        let output = AttachmentsOutputStream::new(16384);
        let mut chunks = vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")].into_iter();
        pull_from_generator(output.clone(), move || {
            let next = chunks.next();
            async move { next }
        })
        .await
        .unwrap();

        let mut seen = Vec::new();
        loop {
            match output.try_pull() {
                Some((header, attachments)) => {
                    seen.extend(attachments);
                    if header.end_of_stream {
                        break;
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
        assert_eq!(seen, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn drain_into_writer_stops_at_end_of_stream() {
        let no_feedback: Arc<dyn Fn(u64) + Send + Sync> = Arc::new(|_| {});
        let input = AttachmentsInputStream::new(no_feedback);
        input.on_payload(StreamPayloadHeader { sequence_number: 0, ..Default::default() }, vec![Bytes::from_static(b"a")]);
        input.on_payload(
            StreamPayloadHeader { sequence_number: 1, end_of_stream: true, ..Default::default() },
            vec![],
        );

        let collected = Arc::new(StdMutex::new(Vec::new()));
        let collected_for_writer = collected.clone();
        drain_into_writer(input, move |chunk| {
            let collected = collected_for_writer.clone();
            async move {
                collected.lock().unwrap().push(chunk);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(*collected.lock().unwrap(), vec![Bytes::from_static(b"a")]);
    }
}
