// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Streaming attachments (spec §4.7): ordered, windowed, optionally-compressed byte streams
//! layered on a live RPC call in either direction.

pub mod input;
pub mod output;
pub mod window;
pub mod wrappers;

pub use input::AttachmentsInputStream;
pub use output::AttachmentsOutputStream;
pub use wrappers::{ClientInputStream, ClientOutputStream, drain_into_writer, pull_from_generator};

/// Default per-direction byte window size (spec §3: "`W` (default 16384)").
pub const DEFAULT_WINDOW: u64 = 16384;
