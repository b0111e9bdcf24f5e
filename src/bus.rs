// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The bus abstraction: a connection-oriented, length-framed message transport.
//!
//! Real framing, TLS, authentication, and address resolution are explicit non-goals (spec §1);
//! this module only defines the seam `corerpc` needs above that layer, plus an in-process
//! [`LoopbackBus`] pair used by the local channel (spec §4.8) and by this crate's own tests.

use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use log::{debug, trace};
use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::message::Message;

/// QoS class that gets its own bus connection per endpoint (spec §6).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum MultiplexingBand {
    Default = 0,
    Control = 1,
    Heavy = 2,
}

impl MultiplexingBand {
    pub const ALL: [MultiplexingBand; 3] = [
        MultiplexingBand::Default,
        MultiplexingBand::Control,
        MultiplexingBand::Heavy,
    ];

    /// The per-band TOS (type-of-service) value the dispatcher hands to new connections
    /// (spec §4.9). A real bus implementation would thread this into socket options; here it is
    /// exposed so callers can observe / override the mapping.
    pub fn default_tos(self) -> u8 {
        match self {
            MultiplexingBand::Default => 0,
            MultiplexingBand::Control => 0x10,
            MultiplexingBand::Heavy => 0x08,
        }
    }
}

/// Callbacks a [`Bus`] delivers to whoever installed itself as the handler.
///
/// A `Bus` only ever holds a [`Weak`] reference to its handler (see spec §9, "cyclic
/// references"): the channel owns the bus, and the bus must not keep the channel alive.
pub trait BusHandler: Send + Sync {
    fn on_message(&self, message: Message);
    fn on_acknowledged(&self, message: &Message);
    fn on_terminated(&self, error: RpcError);
}

/// One connection-oriented transport session. `corerpc` depends only on this trait; a concrete
/// implementation (TCP + TLS + framing) is out of scope per §1.
pub trait Bus: Send + Sync {
    /// Sends one envelope. Resolves once the bus has accepted it for delivery; an `ack` is a
    /// separate, optional confirmation of far-end delivery, reported via
    /// [`BusHandler::on_acknowledged`] when `request_ack` is requested.
    fn send(&self, message: Message, request_ack: bool) -> BoxFuture<'static, Result<(), RpcError>>;

    /// Installs the handler that receives inbound messages and the termination signal. Only a
    /// weak reference is retained.
    fn set_handler(&self, handler: Weak<dyn BusHandler>);

    /// Idempotently terminates the bus, delivering `error` to the handler if still installed.
    fn terminate(&self, error: RpcError);

    fn is_terminated(&self) -> bool;
}

type Parts = Arc<Mutex<Weak<dyn BusHandler>>>;

/// One end of an in-process, unbounded, FIFO-per-direction bus pair. Used by the local channel
/// (spec §4.8) and by integration tests in place of a real networked bus.
pub struct LoopbackBus {
    peer_outbox: mpsc::UnboundedSender<LoopbackEvent>,
    handler: Parts,
    terminated: Arc<std::sync::atomic::AtomicBool>,
}

enum LoopbackEvent {
    Message(Message, bool),
    Terminate(RpcError),
}

impl LoopbackBus {
    /// Creates a connected pair: messages sent on `a` are delivered to `b`'s handler and vice
    /// versa, on a background forwarding task per direction.
    pub fn pair() -> (Arc<LoopbackBus>, Arc<LoopbackBus>) {
        // a_rx carries events destined for `a` (sent by `b` via a_tx), and symmetrically for b_rx.
        let (a_tx, a_rx) = mpsc::unbounded_channel::<LoopbackEvent>();
        let (b_tx, b_rx) = mpsc::unbounded_channel::<LoopbackEvent>();

        let a = Arc::new(LoopbackBus {
            peer_outbox: b_tx,
            handler: Arc::new(Mutex::new(Weak::new())),
            terminated: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        let b = Arc::new(LoopbackBus {
            peer_outbox: a_tx,
            handler: Arc::new(Mutex::new(Weak::new())),
            terminated: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });

        spawn_forwarder(a.handler.clone(), a.terminated.clone(), a_rx);
        spawn_forwarder(b.handler.clone(), b.terminated.clone(), b_rx);

        (a, b)
    }
}

fn spawn_forwarder(
    handler: Parts,
    terminated: Arc<std::sync::atomic::AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<LoopbackEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let handler = handler.lock().unwrap().upgrade();
            match event {
                LoopbackEvent::Message(message, ack) => {
                    if let Some(handler) = handler {
                        if ack {
                            handler.on_acknowledged(&message);
                        }
                        handler.on_message(message);
                    } else {
                        trace!("loopback bus dropped a message: no handler installed");
                    }
                }
                LoopbackEvent::Terminate(error) => {
                    terminated.store(true, std::sync::atomic::Ordering::SeqCst);
                    if let Some(handler) = handler {
                        handler.on_terminated(error);
                    }
                    break;
                }
            }
        }
    });
}

impl Bus for LoopbackBus {
    fn send(&self, message: Message, request_ack: bool) -> BoxFuture<'static, Result<(), RpcError>> {
        if self.terminated.load(std::sync::atomic::Ordering::SeqCst) {
            return Box::pin(futures::future::ready(Err(RpcError::transport("bus terminated"))));
        }
        let sent = self.peer_outbox.send(LoopbackEvent::Message(message, request_ack));
        Box::pin(futures::future::ready(sent.map_err(|_| RpcError::transport("peer bus closed"))))
    }

    fn set_handler(&self, handler: Weak<dyn BusHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn terminate(&self, error: RpcError) {
        if self
            .terminated
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        debug!("terminating loopback bus: {error}");
        if let Some(handler) = self.handler.lock().unwrap().upgrade() {
            handler.on_terminated(error);
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(std::sync::atomic::Ordering::SeqCst)
    }
}
