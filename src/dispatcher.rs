// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Process-wide pool of invokers (spec §4.9): light, heavy, and compression.
//!
//! "Thread-pool implementation... [is] assumed primitives" per spec §1; this crate's rendition of
//! that assumption is that `tokio`'s runtime *is* the primitive. The light invoker runs on the
//! caller's current runtime (so cancellation and bookkeeping never wait on pool scheduling); the
//! heavy and compression invokers are dedicated multi-thread runtimes sized by [`DispatcherConfig`].

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

/// Configuration for the process-wide dispatcher. Replaces pool sizes (spec §4.9).
#[derive(Copy, Clone, Debug)]
pub struct DispatcherConfig {
    pub heavy_threads: usize,
    pub compression_threads: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            heavy_threads: 4,
            compression_threads: 2,
        }
    }
}

/// The process-wide dispatcher singleton (spec §4.9: "process-wide, lazily initialized").
pub struct Dispatcher {
    heavy: Runtime,
    compression: Runtime,
}

static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();
static CONFIG: OnceLock<DispatcherConfig> = OnceLock::new();

impl Dispatcher {
    fn build(config: DispatcherConfig) -> Dispatcher {
        let heavy = Builder::new_multi_thread()
            .worker_threads(config.heavy_threads.max(1))
            .thread_name("corerpc-heavy")
            .enable_all()
            .build()
            .expect("failed to build heavy invoker runtime");
        let compression = Builder::new_multi_thread()
            .worker_threads(config.compression_threads.max(1))
            .thread_name("corerpc-compression")
            .enable_all()
            .build()
            .expect("failed to build compression invoker runtime");
        Dispatcher { heavy, compression }
    }

    /// Must be called, if at all, before the first access to [`instance`]; a config set after
    /// first use has no effect (the dispatcher is already built). Mirrors "Configuration replaces
    /// pool sizes" while keeping lazy-singleton semantics simple.
    pub fn configure(config: DispatcherConfig) {
        let _ = CONFIG.set(config);
    }

    fn instance() -> &'static Dispatcher {
        DISPATCHER.get_or_init(|| Dispatcher::build(CONFIG.get().copied().unwrap_or_default()))
    }

    /// Runs `f` on the light invoker: the caller's current `tokio` runtime. Used for
    /// cancellation, discovery, and bookkeeping callbacks that must never block behind pool
    /// scheduling (spec §4.9, §9 "avoiding stack blow-up on cancellation").
    pub fn spawn_light<F>(f: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(f)
    }

    /// Runs `f` on the heavy invoker: a dedicated thread pool for serialization/deserialization.
    pub fn spawn_heavy<F>(f: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::instance().heavy.spawn(f)
    }

    /// Runs `f` on the prioritized compression invoker.
    pub fn spawn_compression<F>(f: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::instance().compression.spawn(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heavy_invoker_runs_work() {
        let handle = Dispatcher::spawn_heavy(async { 1 + 1 });
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn compression_invoker_runs_work() {
        let handle = Dispatcher::spawn_compression(async { 40 + 2 });
        assert_eq!(handle.await.unwrap(), 42);
    }
}
