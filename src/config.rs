// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Top-level configuration (spec §6): "Server config is a map service-name → service config;
//! service config is a map method-name → method config... All reconfiguration is live."
//!
//! `DispatcherConfig` (pool sizes, [`crate::dispatcher::DispatcherConfig`]) and
//! `ResponseKeeperConfig` ([`crate::keeper::ResponseKeeperConfig`]) cover the other two
//! configuration surfaces named in §6; they live next to the subsystem they configure rather than
//! here, matching how the teacher keeps config types colocated with what they configure.

use std::collections::HashMap;

use crate::server::MethodConfig;

/// Method-name → method config for one service (spec §6).
pub type ServiceConfig = HashMap<String, MethodConfig>;

/// Service-name → service config for an entire [`crate::server::Server`] (spec §6).
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    pub services: HashMap<String, ServiceConfig>,
}

impl ServerConfig {
    pub fn with_service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }
}
