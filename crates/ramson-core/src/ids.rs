// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Stable 32-byte identifier of a router: SHA-256 over its serialized
/// identity (encryption key, signing key, certificate).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterHash(pub [u8; 32]);

/// 32-byte key a router is located under in the Kademlia keyspace.
///
/// Keys rotate daily: `SHA-256(router_hash ‖ yyyymmdd)` with the date in
/// ASCII, UTC. [`crate::kademlia::Kademlia::rotate`] recomputes the whole
/// table at midnight.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KademliaKey(pub [u8; 32]);

impl RouterHash {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Placeholder hash used in failure signals when the remote identity
    /// was never learned.
    pub fn placeholder() -> Self {
        Self([0u8; 32])
    }

    pub fn is_placeholder(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl KademliaKey {
    /// Derive the key a router hash lives under on `date`.
    pub fn for_router(hash: &RouterHash, date: NaiveDate) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hash.0);
        hasher.update(date.format("%Y%m%d").to_string().as_bytes());
        let digest = hasher.finalize();

        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn xor_distance(&self, other: &Self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (idx, byte) in out.iter_mut().enumerate() {
            *byte = self.0[idx] ^ other.0[idx];
        }
        out
    }

    pub fn distance_cmp(&self, target: &Self, other: &Self) -> std::cmp::Ordering {
        let a = self.xor_distance(target);
        let b = other.xor_distance(target);
        a.cmp(&b)
    }
}

impl fmt::Debug for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for KademliaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KademliaKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for KademliaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}
