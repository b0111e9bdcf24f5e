// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! `AttachmentsOutputStream` (spec §4.7): the producer side of a streaming attachment direction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::message::StreamPayloadHeader;

use super::window::ReorderWindow;

/// An attachment (or the null end-of-stream marker) that has cleared compression and is ready to
/// be packed into an outgoing wire payload by [`AttachmentsOutputStream::try_pull`].
struct QueuedAttachment {
    body: Option<Bytes>,
    len: u64,
}

struct PendingWrite {
    /// `WritePosition` as of this write's enqueue; fulfilled once `ReadPosition` catches up to
    /// within `window` of it.
    committed_write_position: u64,
    waiter: oneshot::Sender<Result<(), RpcError>>,
}

struct OutputState {
    next_sequence: u64,
    write_position: u64,
    sent_position: u64,
    read_position: u64,
    window: u64,
    compression_window: ReorderWindow<QueuedAttachment>,
    unsent: VecDeque<(u64, QueuedAttachment)>,
    pending_writes: VecDeque<PendingWrite>,
    closed: bool,
    error: Option<RpcError>,
}

impl OutputState {
    /// Fulfills every pending write whose committed position is now within the window of
    /// `read_position`, in enqueue order.
    fn release_pending(&mut self) {
        while let Some(front) = self.pending_writes.front() {
            if front.committed_write_position.saturating_sub(self.read_position) > self.window {
                break;
            }
            let pending = self.pending_writes.pop_front().unwrap();
            let _ = pending.waiter.send(Ok(()));
        }
    }
}

/// Producer side of one streaming direction (spec §4.7). `Write`'s returned future resolves as
/// soon as the byte window allows, independent of when the write actually reaches the wire;
/// `try_pull` is polled by whatever owns the live call to obtain payloads to send.
pub struct AttachmentsOutputStream {
    state: Mutex<OutputState>,
    ready: Notify,
}

impl AttachmentsOutputStream {
    pub fn new(window: u64) -> Arc<Self> {
        Arc::new(AttachmentsOutputStream {
            state: Mutex::new(OutputState {
                next_sequence: 0,
                write_position: 0,
                sent_position: 0,
                read_position: 0,
                window,
                compression_window: ReorderWindow::new(),
                unsent: VecDeque::new(),
                pending_writes: VecDeque::new(),
                closed: false,
                error: None,
            }),
            ready: Notify::new(),
        })
    }

    /// Waits until at least one payload is available and returns it, for callers that want to
    /// pump payloads onto a transport as they become ready rather than poll [`Self::try_pull`].
    pub async fn next_payload(self: &Arc<Self>) -> Option<(StreamPayloadHeader, Vec<Bytes>)> {
        loop {
            if let Some(payload) = self.try_pull() {
                return Some(payload);
            }
            if self.is_done() {
                return None;
            }
            self.ready.notified().await;
        }
    }

    fn is_done(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.error.is_some() || (state.closed && state.unsent.is_empty() && state.pending_writes.is_empty())
    }

    /// `Write(buf) -> Future<void>` (spec §4.7).
    pub async fn write(self: &Arc<Self>, buf: Bytes) -> Result<(), RpcError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.closed {
                return Err(RpcError::protocol("Write after Close"));
            }
            let sequence_number = state.next_sequence;
            state.next_sequence += 1;
            let len = buf.len() as u64;
            state.write_position += len;
            let committed_write_position = state.write_position;

            let (tx, rx) = oneshot::channel();
            if committed_write_position.saturating_sub(state.read_position) <= state.window {
                let _ = tx.send(Ok(()));
            } else {
                state.pending_writes.push_back(PendingWrite { committed_write_position, waiter: tx });
            }
            drop(state);
            self.enqueue_compressed(sequence_number, Some(buf), len);
            rx
        };
        rx.await.unwrap_or_else(|_| Err(RpcError::transport("output stream dropped")))
    }

    /// `Close() -> Future<void>` (spec §4.7): enqueues the null attachment and resolves once the
    /// peer has acknowledged reading it.
    pub async fn close(self: &Arc<Self>) -> Result<(), RpcError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.closed {
                return Err(RpcError::protocol("Close called twice"));
            }
            state.closed = true;
            let sequence_number = state.next_sequence;
            state.next_sequence += 1;
            state.write_position += 1;
            let committed_write_position = state.write_position;

            let (tx, rx) = oneshot::channel();
            state.pending_writes.push_back(PendingWrite { committed_write_position, waiter: tx });
            drop(state);
            self.enqueue_compressed(sequence_number, None, 1);
            rx
        };
        rx.await.unwrap_or_else(|_| Err(RpcError::transport("output stream dropped")))
    }

    /// Compression runs on the compression invoker (spec §4.7/§9); completions may arrive out of
    /// submission order, so they pass back through the shared reorder window to preserve producer
    /// order before becoming eligible for `try_pull`.
    fn enqueue_compressed(self: &Arc<Self>, sequence_number: u64, body: Option<Bytes>, len: u64) {
        let this = self.clone();
        Dispatcher::spawn_compression(async move {
            let mut state = this.state.lock().unwrap();
            let newly_ready = state.compression_window.insert_batch(sequence_number, vec![QueuedAttachment { body, len }]);
            state.unsent.extend(newly_ready);
            drop(state);
            this.ready.notify_waiters();
        });
    }

    /// `Fails the stream: every write/close future still pending is rejected with `error`.
    pub fn abort(&self, error: RpcError) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error.clone());
        }
        let pending = std::mem::take(&mut state.pending_writes);
        drop(state);
        for pending in pending {
            let _ = pending.waiter.send(Err(error.clone()));
        }
        self.ready.notify_waiters();
    }

    /// Feedback envelope handler: advances `ReadPosition` and releases any writes it unblocks.
    /// Feedback behind the locally known position is ignored; feedback ahead of `WritePosition`
    /// fails the stream (spec §4.7).
    pub fn on_feedback(&self, read_position: u64) {
        let mut state = self.state.lock().unwrap();
        if read_position <= state.read_position {
            return;
        }
        if read_position > state.write_position {
            drop(state);
            self.abort(RpcError::protocol("feedback read position exceeds write position"));
            return;
        }
        state.read_position = read_position;
        state.release_pending();
        drop(state);
        self.ready.notify_waiters();
    }

    /// `TryPull() -> Option<payload>` (spec §4.7): greedily packs attachments while
    /// `SentPosition − ReadPosition ≤ W`, except the first packet in a batch is emitted even if it
    /// alone exceeds `W`.
    pub fn try_pull(&self) -> Option<(StreamPayloadHeader, Vec<Bytes>)> {
        let mut state = self.state.lock().unwrap();
        if state.unsent.is_empty() {
            return None;
        }
        let mut attachments = Vec::new();
        let mut base_sequence = None;
        let mut end_of_stream = false;
        while let Some((sequence_number, _)) = state.unsent.front() {
            let sequence_number = *sequence_number;
            let projected = state.sent_position + state.unsent.front().unwrap().1.len;
            let first_in_batch = attachments.is_empty();
            if !first_in_batch && projected.saturating_sub(state.read_position) > state.window {
                break;
            }
            let (_, item) = state.unsent.pop_front().unwrap();
            state.sent_position += item.len;
            base_sequence.get_or_insert(sequence_number);
            match item.body {
                Some(body) => attachments.push(body),
                None => {
                    end_of_stream = true;
                    break;
                }
            }
        }
        let base_sequence = base_sequence?;
        Some((
            StreamPayloadHeader {
                request_id: Default::default(),
                sequence_number: base_sequence,
                codec: None,
                memory_zone: None,
                end_of_stream,
            },
            attachments,
        ))
    }
}
