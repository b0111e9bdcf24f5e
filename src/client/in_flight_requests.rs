// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Per-request timeout tracking (spec §4.2 "Timeouts"): a request accepted with a deadline is
//! armed on a [`DelayQueue`] and retired with a timeout error if nothing retires it first.

use std::time::Duration;

use log::trace;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

use crate::ids::RequestId;

/// Drains a [`DelayQueue`] of request ids on the light invoker, handing each expiry to `on_fire`.
/// Runs for the lifetime of the owning session; stopped by dropping the returned handle.
pub struct InFlightRequests {
    queue_tx: tokio::sync::mpsc::UnboundedSender<QueueOp>,
    driver: tokio::task::JoinHandle<()>,
}

enum QueueOp {
    Arm(RequestId, Duration),
    Disarm(RequestId),
}

impl InFlightRequests {
    /// `on_fire` runs on the light invoker whenever a request's deadline elapses without having
    /// been disarmed first (spec §4.2 "A timer is armed when the request is accepted").
    pub fn new<F>(on_fire: F) -> Self
    where
        F: Fn(RequestId) + Send + Sync + 'static,
    {
        let (queue_tx, mut queue_rx) = tokio::sync::mpsc::unbounded_channel::<QueueOp>();
        let driver = crate::dispatcher::Dispatcher::spawn_light(async move {
            let mut queue: DelayQueue<RequestId> = DelayQueue::new();
            let mut keys: std::collections::HashMap<RequestId, Key> = std::collections::HashMap::new();
            loop {
                tokio::select! {
                    op = queue_rx.recv() => {
                        match op {
                            Some(QueueOp::Arm(id, timeout)) => {
                                if let Some(old_key) = keys.remove(&id) {
                                    queue.remove(&old_key);
                                }
                                keys.insert(id, queue.insert(id, timeout));
                            }
                            Some(QueueOp::Disarm(id)) => {
                                if let Some(key) = keys.remove(&id) {
                                    queue.remove(&key);
                                }
                            }
                            None => break,
                        }
                    }
                    Some(expired) = futures::future::poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                        let id = expired.into_inner();
                        keys.remove(&id);
                        trace!("request {id} timed out");
                        on_fire(id);
                    }
                }
            }
        });
        InFlightRequests { queue_tx, driver }
    }

    /// Arms (or re-arms) the timeout for `id`, `timeout` from now.
    pub fn arm(&self, id: RequestId, timeout: Duration) {
        let _ = self.queue_tx.send(QueueOp::Arm(id, timeout));
    }

    /// Disarms `id`'s timeout, if any (spec §4.2: firing after retirement is a no-op; disarming
    /// on retirement is how this crate avoids ever observing that race).
    pub fn disarm(&self, id: RequestId) {
        let _ = self.queue_tx.send(QueueOp::Disarm(id));
    }
}

impl Drop for InFlightRequests {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn unarmed_request_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let in_flight = InFlightRequests::new(move |_id| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(in_flight);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn armed_request_fires_after_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let in_flight = InFlightRequests::new(move |_id| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let id = RequestId::generate();
        in_flight.arm(id, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disarmed_request_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let in_flight = InFlightRequests::new(move |_id| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let id = RequestId::generate();
        in_flight.arm(id, Duration::from_millis(20));
        in_flight.disarm(id);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
