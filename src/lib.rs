// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! `corerpc`: a multiplexed request/response RPC engine over a framed byte-bus transport.
//!
//! The core pieces — [`bus`] (transport seam), [`message`] (wire codec), [`client`] (channel
//! state machine, local channel, wrappers), [`server`] (service dispatch), [`keeper`] (at-most-once
//! mutation replies), and [`stream`] (windowed streaming attachments) — share one request-id
//! space, wire format, cancellation model, and error taxonomy. Real transport framing, TLS, and
//! address resolution are explicit non-goals; `bus::Bus` is the seam a concrete transport plugs
//! into.

pub mod bus;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod keeper;
pub mod message;
pub mod server;
pub mod stream;

pub use client::{AuthenticatedChannel, Channel, LocalChannel, RealmChannel, RetryingChannel};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{ErrorCode, RpcError};
pub use ids::{MutationId, RealmId, RequestId};
pub use server::{Server, ServiceBase, ServiceContext};
