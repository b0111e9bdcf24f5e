// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Method registration (spec §4.5): descriptors and live-reloadable per-method configuration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::context::ServiceContext;

/// A boxed, cloneable async handler: `FnOnce(ServiceContext) -> impl Future<Output = ()>` erased
/// behind an `Arc<dyn Fn>` so one descriptor can be dispatched to repeatedly.
pub type Handler = Arc<dyn Fn(ServiceContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps a plain `async fn(ServiceContext)`-shaped closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as Pin<Box<dyn Future<Output = ()> + Send>>)
}

/// One method registration (spec §4.5 "Registration").
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    /// Runs inline, on whichever invoker the scheduler uses by default.
    pub handler: Handler,
    /// If set, runs on the heavy invoker before handing off to a lite continuation
    /// (spec §4.5 "Heavy handlers run on the heavy invoker and yield a lite continuation").
    pub heavy_handler: Option<Handler>,
    pub max_queue_size: usize,
    pub max_concurrency: Option<usize>,
    pub cancelable: bool,
    pub pooling: bool,
    pub response_codec: Option<String>,
    pub log_level: log::Level,
    pub generate_attachment_checksums: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        MethodDescriptor {
            name: name.into(),
            handler,
            heavy_handler: None,
            max_queue_size: 10_000,
            max_concurrency: None,
            cancelable: true,
            pooling: false,
            response_codec: None,
            log_level: log::Level::Debug,
            generate_attachment_checksums: false,
        }
    }

    pub fn with_heavy_handler(mut self, handler: Handler) -> Self {
        self.heavy_handler = Some(handler);
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn non_cancelable(mut self) -> Self {
        self.cancelable = false;
        self
    }
}

/// Live overrides for one method, applied on top of its [`MethodDescriptor`] (spec §6).
#[derive(Clone, Debug, Default)]
pub struct MethodConfig {
    pub heavy: Option<bool>,
    pub response_codec: Option<String>,
    pub max_queue_size: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub log_level: Option<log::Level>,
    pub logging_suppression_timeout: Option<Duration>,
}

/// Effective, config-overridden limits for one method, recomputed whenever `ServiceConfig` is
/// reloaded (spec §6: "All reconfiguration is live").
#[derive(Copy, Clone, Debug)]
pub struct EffectiveLimits {
    pub max_queue_size: usize,
    pub max_concurrency: Option<usize>,
}

impl MethodDescriptor {
    pub fn effective_limits(&self, overrides: Option<&MethodConfig>) -> EffectiveLimits {
        let overrides = overrides.cloned().unwrap_or_default();
        EffectiveLimits {
            max_queue_size: overrides.max_queue_size.unwrap_or(self.max_queue_size),
            max_concurrency: overrides.max_concurrency.or(self.max_concurrency),
        }
    }
}
