// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! `AttachmentsInputStream` (spec §4.7): the consumer side of a streaming attachment direction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::message::StreamPayloadHeader;

use super::window::ReorderWindow;

struct InputState {
    window: ReorderWindow<Option<(Bytes, u64)>>,
    ready: VecDeque<Option<(Bytes, u64)>>,
    read_position: u64,
    ended: bool,
    error: Option<RpcError>,
    read_in_flight: bool,
}

/// Consumer side of one streaming direction. Payloads arrive out of band via [`Self::on_payload`]
/// (wired to the bus/server by whatever owns the live call); [`Self::read`] drains them in order.
pub struct AttachmentsInputStream {
    state: Mutex<InputState>,
    notify: Notify,
    on_feedback: Arc<dyn Fn(u64) + Send + Sync>,
}

impl AttachmentsInputStream {
    pub fn new(on_feedback: Arc<dyn Fn(u64) + Send + Sync>) -> Arc<Self> {
        Arc::new(AttachmentsInputStream {
            state: Mutex::new(InputState {
                window: ReorderWindow::new(),
                ready: VecDeque::new(),
                read_position: 0,
                ended: false,
                error: None,
                read_in_flight: false,
            }),
            notify: Notify::new(),
            on_feedback,
        })
    }

    /// Delivers one wire payload. Decompression (a no-op in this crate: no compression codec is
    /// implemented, so "decompressed" buffers are whatever arrived) runs on the compression
    /// invoker, off whatever thread received the envelope, per spec §4.7/§9.
    pub fn on_payload(self: &Arc<Self>, header: StreamPayloadHeader, attachments: Vec<Bytes>) {
        let this = self.clone();
        Dispatcher::spawn_compression(async move {
            let items: Vec<Option<(Bytes, u64)>> = if header.end_of_stream {
                vec![None]
            } else {
                attachments.into_iter().map(|b| Some((b.clone(), b.len() as u64))).collect()
            };
            this.deliver(header.sequence_number, items);
        });
    }

    /// Fails the stream; every current and future read observes `error`.
    pub fn abort(&self, error: RpcError) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn deliver(&self, base_sequence: u64, items: Vec<Option<(Bytes, u64)>>) {
        let mut state = self.state.lock().unwrap();
        let ready = state.window.insert_batch(base_sequence, items);
        state.ready.extend(ready.into_iter().map(|(_, item)| item));
        drop(state);
        self.notify.notify_waiters();
    }

    /// `Read() -> Future<Bytes>` (spec §4.7). Returns `Ok(None)` once, for the null end-of-stream
    /// marker; every read after that fails. At most one read may be in flight at a time.
    pub async fn read(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Option<Bytes>, RpcError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.read_in_flight {
                return Err(RpcError::protocol("concurrent Read on one input stream"));
            }
            state.read_in_flight = true;
        }
        let result = self.read_inner(timeout).await;
        self.state.lock().unwrap().read_in_flight = false;
        result
    }

    async fn read_inner(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Option<Bytes>, RpcError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(error) = &state.error {
                    return Err(error.clone());
                }
                if state.ended {
                    return Err(RpcError::protocol("Read after end-of-stream"));
                }
                if let Some(item) = state.ready.pop_front() {
                    // The null end-of-stream marker counts as one byte for window accounting
                    // (spec §4.7), so it still advances `read_position` and is still acked via
                    // feedback: otherwise a peer's `Close()` (which always waits for an ack,
                    // regardless of window slack) would never resolve.
                    let (body, compressed_len) = match item {
                        Some((body, compressed_len)) => (Some(body), compressed_len),
                        None => (None, 1),
                    };
                    state.read_position += compressed_len;
                    let read_position = state.read_position;
                    let ended = body.is_none();
                    state.ended = ended;
                    drop(state);
                    (self.on_feedback)(read_position);
                    return Ok(body);
                }
            }
            let wait = self.notify.notified();
            match timeout {
                Some(duration) => tokio::time::timeout(duration, wait)
                    .await
                    .map_err(|_| RpcError::timed_out("input stream read timed out"))?,
                None => wait.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn no_feedback() -> Arc<dyn Fn(u64) + Send + Sync> {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn reassembles_out_of_order_payloads() {
        let stream = AttachmentsInputStream::new(no_feedback());
        stream.on_payload(
            StreamPayloadHeader { sequence_number: 1, ..Default::default() },
            vec![Bytes::from_static(b"b")],
        );
        stream.on_payload(
            StreamPayloadHeader { sequence_number: 0, ..Default::default() },
            vec![Bytes::from_static(b"a")],
        );
        assert_eq!(stream.read(None).await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(stream.read(None).await.unwrap().unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn null_attachment_ends_stream_and_further_reads_fail() {
        let stream = AttachmentsInputStream::new(no_feedback());
        stream.on_payload(
            StreamPayloadHeader { sequence_number: 0, end_of_stream: true, ..Default::default() },
            vec![],
        );
        assert!(stream.read(None).await.unwrap().is_none());
        assert!(stream.read(None).await.is_err());
    }

    #[tokio::test]
    async fn read_credits_feedback_by_compressed_size() {
        let credited = Arc::new(AtomicU64::new(0));
        let credited_for_cb = credited.clone();
        let stream = AttachmentsInputStream::new(Arc::new(move |pos| credited_for_cb.store(pos, Ordering::SeqCst)));
        stream.on_payload(
            StreamPayloadHeader { sequence_number: 0, ..Default::default() },
            vec![Bytes::from_static(b"0123456789")],
        );
        stream.read(None).await.unwrap();
        assert_eq!(credited.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn read_times_out_with_no_data_buffered() {
        let stream = AttachmentsInputStream::new(no_feedback());
        let err = stream.read(Some(Duration::from_millis(10))).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::TimedOut);
    }
}
