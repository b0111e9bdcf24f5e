// Copyright 2024 corerpc contributors
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Opaque 128-bit identifiers shared by requests, realms, and mutations.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        pub struct $name(u128);

        impl $name {
            /// The reserved null sentinel. Never assigned to a real request, realm, or mutation.
            pub const NIL: Self = Self(0);

            /// Generates a fresh random id. Collisions are astronomically unlikely and are not
            /// guarded against; uniqueness is only required among concurrently tracked ids on a
            /// given channel (see the data model notes on request ids).
            pub fn generate() -> Self {
                let mut rng = rand::thread_rng();
                let mut buf = [0u8; 16];
                rng.fill_bytes(&mut buf);
                let v = u128::from_le_bytes(buf);
                // Never hand out the nil sentinel from `generate`.
                Self(if v == 0 { 1 } else { v })
            }

            /// Returns whether this is the reserved null sentinel.
            pub fn is_nil(&self) -> bool {
                self.0 == 0
            }

            /// Raw numeric value, for wire encoding.
            pub fn as_u128(&self) -> u128 {
                self.0
            }

            /// Builds an id from its raw wire value.
            pub fn from_u128(v: u128) -> Self {
                Self(v)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NIL
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:032x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_id!(RequestId, "Identifies one request, unique among a channel's concurrently tracked requests.");
opaque_id!(RealmId, "Identifies a per-service namespace; `(service name, realm id)` names a service instance.");
opaque_id!(MutationId, "Marks a request as idempotent and eligible for response-keeper deduplication.");
