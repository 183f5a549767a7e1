// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
pub mod config;
pub mod context;
pub mod crypto;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod establishment;
pub mod i2np;
pub mod identity;
pub mod ids;
pub mod kademlia;
pub mod keys;
pub mod packet;
pub mod router_info;
pub mod search;
pub mod session;
pub mod signals;
pub mod transport;

pub use config::RouterConfig;
pub use context::{provision_keys, RouterContext, PEERS_DB_FILE, ROUTER_INFO_FILE};
pub use crypto::{DsaPrivateKey, ElGamalPrivateKey, MacKey, SessionKey};
pub use database::{Database, MemoryDatabase, PeerProfile, SqliteDatabase};
pub use error::{DatabaseError, PacketError, SessionError, WireError};
pub use i2np::{Message, MsgType, Payload};
pub use identity::{Certificate, RouterIdentity};
pub use ids::{KademliaKey, RouterHash};
pub use kademlia::{Kademlia, ALPHA, K};
pub use keys::PrivateKey;
pub use router_info::{Mapping, RouterAddress, RouterInfo};
pub use signals::{Event, Signals};
pub use transport::Endpoint;

#[cfg(test)]
mod conformance;
