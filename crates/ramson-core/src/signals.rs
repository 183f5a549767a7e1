// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Cross-component notifications as one event enum fanned out over
//! bounded channels, one per subscriber. Emission never blocks and must
//! happen outside any lock on shared tables.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::i2np::BuildRecord;
use crate::ids::{KademliaKey, RouterHash};

const SUBSCRIBER_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub enum Event {
    /// A session finished establishing.
    Established { hash: RouterHash, inbound: bool },
    /// A handshake failed; the hash is the placeholder value when the
    /// remote identity was never learned.
    EstablishmentFailed { hash: RouterHash },
    /// An established session was torn down.
    PeerDisconnected { hash: RouterHash },
    /// A search located its value.
    SearchSucceeded { key: KademliaKey, value: Vec<u8> },
    SearchFailed { key: KademliaKey },
    /// Tunnel build records for the tunnel subsystem.
    BuildTunnelRequest { records: Vec<BuildRecord> },
    /// End-to-end delivery confirmation arrived.
    DeliveryStatus { msg_id: u32, timestamp_ms: u64 },
    /// A plain data message addressed to this router.
    LocalData { from: RouterHash, data: Vec<u8> },
}

#[derive(Default)]
pub struct Signals {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers.lock().expect("signals lock").push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber. A full channel drops
    /// the event for that subscriber; a closed one is pruned.
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("signals lock");
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("signal subscriber full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
