// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The client side: the channel state machine (spec §4.2), its wrappers (spec §4.3), and the
//! zero-copy local channel (spec §4.8).

mod in_flight_requests;

pub mod channel;
pub mod local;
pub mod wrappers;

pub use channel::Channel;
pub use local::LocalChannel;
pub use wrappers::{AuthenticatedChannel, RealmChannel, RetryPolicy, RetryingChannel};

use std::sync::Arc;

use bytes::Bytes;

use crate::bus::MultiplexingBand;
use crate::error::RpcError;
use crate::ids::{MutationId, RealmId, RequestId};

/// What a caller hands to `Send` (spec §4.2): the addressed method plus body/attachments, before
/// the channel and its wrappers stamp routing and timing fields onto the wire header.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
    pub realm_id: RealmId,
    pub service: String,
    pub method: String,
    pub protocol_version: u32,
    pub mutation_id: Option<MutationId>,
    pub retry: bool,
    pub user: Option<String>,
    pub body: Option<Bytes>,
    pub attachments: Vec<Bytes>,
}

impl OutgoingRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        OutgoingRequest {
            realm_id: RealmId::NIL,
            service: service.into(),
            method: method.into(),
            protocol_version: 0,
            mutation_id: None,
            retry: false,
            user: None,
            body: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_mutation_id(mut self, id: MutationId) -> Self {
        self.mutation_id = Some(id);
        self
    }
}

/// Per-`Send` options (spec §4.2).
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub timeout: Option<std::time::Duration>,
    pub request_ack: bool,
    pub band: MultiplexingBand,
    pub generate_attachment_checksums: bool,
    pub memory_zone: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            timeout: None,
            request_ack: false,
            band: MultiplexingBand::Default,
            generate_attachment_checksums: false,
            memory_zone: None,
        }
    }
}

/// The callback a caller supplies to `Send` (spec §4.2: "responseHandler").
pub trait ResponseHandler: Send + Sync {
    /// Fired exactly once per accepted request (spec §8 property 2): a successful response body
    /// plus attachments, or the terminal error (cancellation, timeout, bus termination, or a
    /// server-reported failure).
    fn on_response(&self, result: Result<(Bytes, Vec<Bytes>), RpcError>);

    /// Fired when the bus confirms far-end delivery, if `ChannelOptions::request_ack` was set.
    fn on_acknowledged(&self) {}
}

/// A handle to one in-flight request (spec §4.2 "RequestControl").
#[derive(Clone)]
pub struct RequestControl {
    pub request_id: RequestId,
    canceler: Arc<dyn Fn() + Send + Sync>,
}

impl RequestControl {
    pub fn new(request_id: RequestId, canceler: Arc<dyn Fn() + Send + Sync>) -> Self {
        RequestControl { request_id, canceler }
    }

    /// Schedules the cancel on the light invoker (spec §4.2: "to avoid recursive unwinding
    /// through arbitrary user code").
    pub fn cancel(&self) {
        let canceler = self.canceler.clone();
        crate::dispatcher::Dispatcher::spawn_light(async move { canceler() });
    }
}

/// The common channel contract (spec §4.2/§4.3), implemented by the bus-backed [`Channel`], the
/// [`LocalChannel`], and every wrapper so they compose uniformly.
pub trait RpcChannel: Send + Sync {
    fn send(
        &self,
        request: OutgoingRequest,
        handler: Arc<dyn ResponseHandler>,
        options: ChannelOptions,
    ) -> RequestControl;

    /// Idempotent (spec §4.2): after it, every subsequent `send` fails with the stored error.
    fn terminate(&self, error: RpcError);
}
