// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The server: owns inbound bus connections and a service map, and dispatches envelopes by kind
//! (spec §4.5/§4.6).

pub mod context;
pub mod method;
pub mod service;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, info, warn};

use crate::bus::{Bus, BusHandler};
use crate::config::ServerConfig;
use crate::error::RpcError;
use crate::ids::RealmId;
use crate::message::{self, MessageKind};

pub use context::ServiceContext;
pub use method::{Handler, MethodConfig, MethodDescriptor, handler_fn};
pub use service::ServiceBase;

/// One accepted bus connection. Holds the bus strongly; the bus holds only a [`Weak`] reference
/// back to this as its handler, and this holds only a [`Weak`] reference to the owning [`Server`]
/// (spec §9: "cyclic references... broken with weak pointers").
struct Connection {
    bus: Arc<dyn Bus>,
    server: Weak<Server>,
}

impl BusHandler for Connection {
    fn on_message(&self, message: crate::message::Message) {
        let Some(server) = self.server.upgrade() else { return };
        server.dispatch(&self.bus, message);
    }

    fn on_acknowledged(&self, _message: &crate::message::Message) {}

    fn on_terminated(&self, error: RpcError) {
        debug!("connection terminated: {error}");
        if let Some(server) = self.server.upgrade() {
            server.forget_connection(&self.bus);
        }
    }
}

/// Owns a service map keyed by `(service name, realm id)` and the set of currently accepted
/// connections (spec §4.6 "Server").
pub struct Server {
    services: RwLock<HashMap<(String, RealmId), Arc<ServiceBase>>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    stopped: AtomicBool,
    config: Mutex<ServerConfig>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Server {
            services: RwLock::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            config: Mutex::new(ServerConfig::default()),
        })
    }

    /// Registers a service under every realm it should answer requests for. `NIL` is the
    /// catch-all realm (spec §3: "RealmId... NIL selects the default, unscoped routing"). Applies
    /// whatever config is already on file for this service name (spec §4.6: "late service
    /// registrations pick up configuration by service name").
    pub fn register_service(&self, service: Arc<ServiceBase>, realms: impl IntoIterator<Item = RealmId>) {
        if let Some(service_config) = self.config.lock().unwrap().services.get(&service.name) {
            service.configure(service_config.clone());
        }
        let mut services = self.services.write().unwrap();
        for realm in realms {
            services.insert((service.name.clone(), realm), service.clone());
        }
    }

    /// Replaces the server's configuration and immediately reconfigures every currently
    /// registered service it names (spec §6: "All reconfiguration is live").
    pub fn configure(&self, config: ServerConfig) {
        for service in self.services.read().unwrap().values() {
            if let Some(service_config) = config.services.get(&service.name) {
                service.configure(service_config.clone());
            }
        }
        *self.config.lock().unwrap() = config;
    }

    /// Accepts a new inbound connection, installing this server (weakly) as its message handler.
    pub fn accept(self: &Arc<Self>, bus: Arc<dyn Bus>) {
        if self.stopped.load(Ordering::SeqCst) {
            bus.terminate(RpcError::unavailable("server stopped"));
            return;
        }
        let connection = Arc::new(Connection {
            bus: bus.clone(),
            server: Arc::downgrade(self),
        });
        bus.set_handler(Arc::downgrade(&connection) as Weak<dyn BusHandler>);
        self.connections.lock().unwrap().push(connection);
    }

    /// Looks up a registered service by name and realm, for the local (bus-bypassing) channel
    /// (spec §4.8).
    pub fn find_service(&self, name: &str, realm: RealmId) -> Option<Arc<ServiceBase>> {
        self.services.read().unwrap().get(&(name.to_string(), realm)).cloned()
    }

    fn forget_connection(&self, bus: &Arc<dyn Bus>) {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| !Arc::ptr_eq(&c.bus, bus));
        drop(connections);
        for service in self.services.read().unwrap().values() {
            service.cancel_contexts_for_bus(bus);
        }
    }

    fn dispatch(&self, bus: &Arc<dyn Bus>, message: crate::message::Message) {
        let kind = match message::get_message_kind(&message) {
            Ok(kind) => kind,
            Err(error) => {
                warn!("dropping unrecognized envelope: {error}");
                return;
            }
        };
        match kind {
            MessageKind::Request => {
                let header = match message::parse_request_header(&message) {
                    Ok(header) => header,
                    Err(error) => {
                        warn!("dropping malformed request envelope: {error}");
                        return;
                    }
                };
                let key = (header.service.clone(), header.realm_id);
                let service = self.services.read().unwrap().get(&key).cloned();
                match service {
                    Some(service) => service.handle_request(header, message, Arc::downgrade(bus)),
                    None => self.reply_no_such_service(bus, &header),
                }
            }
            MessageKind::Cancellation => {
                let header = match message::parse_cancellation_header(&message) {
                    Ok(header) => header,
                    Err(error) => {
                        warn!("dropping malformed cancellation envelope: {error}");
                        return;
                    }
                };
                // The envelope carries no service identity (spec §4.1/§6), so every registered
                // service is asked; each one no-ops unless it actually holds that request id.
                for service in self.services.read().unwrap().values() {
                    service.handle_request_cancelation(header.request_id);
                }
            }
            MessageKind::Response | MessageKind::StreamPayload | MessageKind::StreamFeedback => {
                // These kinds are client-bound concerns (responses) or streaming attachments
                // layered above a live call; a bare `Server` has nothing registered to consume
                // them directly (routed instead through the client channel / stream wrappers).
                debug!("server dropping unexpected {kind:?} envelope");
            }
        }
    }

    fn reply_no_such_service(&self, bus: &Arc<dyn Bus>, header: &crate::message::RequestHeader) {
        let error = RpcError::no_such_service(header.service.clone());
        let response_header = crate::message::ResponseHeader {
            request_id: header.request_id,
            error: Some(crate::message::WireError::from(&error)),
            body_format: None,
            memory_zone: None,
            codec: None,
        };
        if let Ok(message) = message::build_error_response(&response_header) {
            let bus = bus.clone();
            tokio::spawn(async move {
                let _ = bus.send(message, false).await;
            });
        }
    }

    /// `Stop(graceful)` (spec §4.6): stops admitting requests into every registered service and,
    /// if `graceful`, awaits their drain before returning.
    pub async fn stop(&self, graceful: bool) {
        self.stopped.store(true, Ordering::SeqCst);
        let services: Vec<_> = self.services.read().unwrap().values().cloned().collect();
        for service in &services {
            service.stop();
        }
        if graceful {
            for service in &services {
                service.await_drain().await;
            }
        }
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        for connection in connections {
            connection.bus.terminate(RpcError::unavailable("server stopped"));
        }
        info!("server stopped (graceful={graceful})");
    }
}
