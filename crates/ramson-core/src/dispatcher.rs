// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Routes parsed inter-router messages to registered handlers.
//!
//! The registry is populated once at wiring time. Unknown types and
//! handler errors are logged and the message dropped; nothing tears
//! down the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::crypto::ElGamalPrivateKey;
use crate::database::Database;
use crate::error::WireError;
use crate::i2np::{
    DatabaseSearchReply, DatabaseStore, DeliveryStatus, Message, MsgType, Payload, StoreKind,
};
use crate::ids::{KademliaKey, RouterHash};
use crate::kademlia::{Kademlia, ALPHA, K};
use crate::packet;
use crate::router_info::RouterInfo;
use crate::search::SearchManager;
use crate::signals::{Event, Signals};
use crate::transport::Command;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()>;
}

/// `type → handler` registry.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MsgType, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, msg_type: MsgType, handler: Arc<dyn Handler>) {
        self.handlers.insert(msg_type, handler);
    }

    /// Parse and dispatch one serialized message. All failure modes are
    /// local: log, drop, return.
    pub async fn dispatch(&self, from: RouterHash, bytes: &[u8], now_ms: u64) {
        let message = match Message::from_bytes(bytes, now_ms) {
            Ok(message) => message,
            Err(WireError::Expired) => {
                debug!(%from, "dropping expired message");
                return;
            }
            Err(WireError::UnknownType(t)) => {
                debug!(%from, msg_type = t, "dropping message of unknown type");
                return;
            }
            Err(err) => {
                debug!(%from, %err, "dropping unparseable message");
                return;
            }
        };

        let msg_type = message.msg_type();
        let Some(handler) = self.handlers.get(&msg_type) else {
            debug!(%from, ?msg_type, "no handler registered, dropping");
            return;
        };
        trace!(%from, ?msg_type, msg_id = message.msg_id, "dispatching");
        if let Err(err) = handler.handle(from, &message).await {
            error!(%from, ?msg_type, %err, "handler failed, message dropped");
        }
    }
}

/// Stores arriving router infos, feeds the DHT, answers reply tokens,
/// and lets the search manager observe stores.
pub struct DatabaseStoreHandler {
    pub db: Arc<dyn Database>,
    pub kademlia: Arc<Mutex<Kademlia>>,
    pub search: Arc<SearchManager>,
    pub cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl Handler for DatabaseStoreHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::DatabaseStore(store) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };

        match store.kind {
            StoreKind::RouterInfo => {
                let info = RouterInfo::from_bytes(&store.data)?;
                info.verify()?;
                let hash = info.identity.hash();
                self.db.set_router_info(&hash, &store.data).await?;
                self.kademlia.lock().expect("kademlia lock").insert(hash);
                debug!(%from, stored = %hash, "stored router info");
            }
            StoreKind::LeaseSet => {
                // Lease sets are tracked only for searches; the router
                // database holds router infos.
                debug!(%from, "received lease set store");
            }
        }

        if store.reply_token != 0 {
            let _ = self.cmd_tx.try_send(Command::SendMessage(
                from,
                Payload::DeliveryStatus(DeliveryStatus {
                    msg_id: store.reply_token,
                    timestamp_ms: msg.expiration_ms,
                }),
            ));
        }

        self.search
            .database_store(from, KademliaKey(store.key), &store.data)
            .await;
        Ok(())
    }
}

/// Answers lookups from the local database, falling back to the closest
/// known routers.
pub struct DatabaseLookupHandler {
    pub db: Arc<dyn Database>,
    pub kademlia: Arc<Mutex<Kademlia>>,
    pub local_hash: RouterHash,
    pub cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl Handler for DatabaseLookupHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::DatabaseLookup(lookup) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };
        let key = KademliaKey(lookup.key);

        let stored = {
            let kademlia = self.kademlia.lock().expect("kademlia lock");
            kademlia.get(&key)
        };
        if let Some(hash) = stored {
            if let Some(data) = self.db.get_router_info(&hash).await? {
                let _ = self.cmd_tx.try_send(Command::SendMessage(
                    from,
                    Payload::DatabaseStore(DatabaseStore {
                        key: lookup.key,
                        kind: StoreKind::RouterInfo,
                        reply_token: 0,
                        data,
                    }),
                ));
                return Ok(());
            }
        }

        // Filter before narrowing: the requester or an excluded hash
        // sitting in the top entries must not shrink the reply.
        let hashes = {
            let kademlia = self.kademlia.lock().expect("kademlia lock");
            kademlia
                .closest_n(&key, K)
                .into_iter()
                .filter(|hash| *hash != lookup.from && !lookup.excluded.contains(hash))
                .take(ALPHA)
                .collect::<Vec<_>>()
        };
        let _ = self.cmd_tx.try_send(Command::SendMessage(
            from,
            Payload::DatabaseSearchReply(DatabaseSearchReply {
                key: lookup.key,
                hashes,
                from: self.local_hash,
            }),
        ));
        Ok(())
    }
}

/// Feeds reply hashes into the search manager.
pub struct DatabaseSearchReplyHandler {
    pub search: Arc<SearchManager>,
}

#[async_trait]
impl Handler for DatabaseSearchReplyHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::DatabaseSearchReply(reply) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };
        self.search
            .search_reply(from, KademliaKey(reply.key), &reply.hashes)
            .await;
        Ok(())
    }
}

/// Routes delivery confirmations to the outbound tracker and the signal
/// graph.
pub struct DeliveryStatusHandler {
    pub signals: Arc<Signals>,
    pub cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl Handler for DeliveryStatusHandler {
    async fn handle(&self, _from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::DeliveryStatus(status) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };
        let _ = self
            .cmd_tx
            .try_send(Command::DeliveryConfirmed(status.msg_id));
        self.signals.emit(Event::DeliveryStatus {
            msg_id: status.msg_id,
            timestamp_ms: status.timestamp_ms,
        });
        Ok(())
    }
}

/// Opens the ElGamal outer layer of a garlic message and re-posts the
/// local cloves for dispatch.
pub struct GarlicHandler {
    pub encryption_key: ElGamalPrivateKey,
    pub cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl Handler for GarlicHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::Garlic(data) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };
        let cloves = open_garlic(&self.encryption_key, data)?;
        for clove in cloves {
            match clove.instruction {
                0 => {
                    let _ = self
                        .cmd_tx
                        .try_send(Command::DispatchLocal(from, clove.message));
                }
                other => {
                    debug!(%from, instruction = other, "dropping non-local clove");
                }
            }
        }
        Ok(())
    }
}

/// Forwards every tunnel-flavored message to the tunnel subsystem as a
/// signal; tunnel routing itself lives outside this core.
pub struct TunnelHandler {
    pub signals: Arc<Signals>,
}

#[async_trait]
impl Handler for TunnelHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        match &msg.payload {
            Payload::TunnelBuild(records)
            | Payload::TunnelBuildReply(records)
            | Payload::VariableTunnelBuild(records)
            | Payload::VariableTunnelBuildReply(records) => {
                self.signals.emit(Event::BuildTunnelRequest {
                    records: records.clone(),
                });
            }
            Payload::TunnelData { tunnel_id, .. } | Payload::TunnelGateway { tunnel_id, .. } => {
                trace!(%from, tunnel_id, "forwarding tunnel message");
            }
            _ => anyhow::bail!("payload does not match handler"),
        }
        Ok(())
    }
}

/// Delivers plain data messages to the local destination.
pub struct DataHandler {
    pub signals: Arc<Signals>,
}

#[async_trait]
impl Handler for DataHandler {
    async fn handle(&self, from: RouterHash, msg: &Message) -> anyhow::Result<()> {
        let Payload::Data(data) = &msg.payload else {
            anyhow::bail!("payload does not match handler");
        };
        self.signals.emit(Event::LocalData {
            from,
            data: data.clone(),
        });
        Ok(())
    }
}

pub struct Clove {
    pub instruction: u8,
    pub message: Vec<u8>,
    pub clove_id: u32,
    pub expiration_ms: u64,
}

/// Garlic layout: one ElGamal block holding an AES-256 key and IV,
/// then AES-CBC ciphertext of `count(1) ‖ cloves`. Each clove is
/// `instruction(1) ‖ len(2) ‖ message ‖ clove_id(4) ‖ expiration(8)`.
pub fn open_garlic(key: &ElGamalPrivateKey, data: &[u8]) -> anyhow::Result<Vec<Clove>> {
    use crate::crypto::{SessionKey, ELGAMAL_BLOCK_LEN};

    if data.len() < ELGAMAL_BLOCK_LEN + 16 {
        anyhow::bail!("garlic message too short");
    }
    let material = key
        .decrypt(&data[..ELGAMAL_BLOCK_LEN])
        .ok_or_else(|| anyhow::anyhow!("garlic outer layer does not decrypt"))?;
    let mut aes_key = [0u8; 32];
    aes_key.copy_from_slice(&material[..32]);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&material[32..48]);

    let plain = packet::cbc_decrypt_raw(&SessionKey(aes_key), &iv, &data[ELGAMAL_BLOCK_LEN..])
        .map_err(|_| anyhow::anyhow!("garlic body does not decrypt"))?;
    if plain.is_empty() {
        anyhow::bail!("garlic body empty");
    }

    let count = plain[0] as usize;
    let mut pos = 1usize;
    let mut cloves = Vec::with_capacity(count);
    for _ in 0..count {
        if plain.len() < pos + 3 {
            anyhow::bail!("garlic clove truncated");
        }
        let instruction = plain[pos];
        let len = u16::from_be_bytes([plain[pos + 1], plain[pos + 2]]) as usize;
        pos += 3;
        if plain.len() < pos + len + 12 {
            anyhow::bail!("garlic clove body truncated");
        }
        let message = plain[pos..pos + len].to_vec();
        pos += len;
        let clove_id = u32::from_be_bytes(plain[pos..pos + 4].try_into().expect("4 bytes"));
        pos += 4;
        let expiration_ms = u64::from_be_bytes(plain[pos..pos + 8].try_into().expect("8 bytes"));
        pos += 8;
        cloves.push(Clove {
            instruction,
            message,
            clove_id,
            expiration_ms,
        });
    }
    Ok(cloves)
}

/// Build a garlic payload for `recipient_pubkey`; the counterpart of
/// [`open_garlic`].
pub fn seal_garlic(recipient_pubkey: &[u8], cloves: &[Clove]) -> anyhow::Result<Vec<u8>> {
    use crate::crypto::{elgamal_encrypt, SessionKey, ELGAMAL_PLAINTEXT_LEN};

    let mut material = [0u8; ELGAMAL_PLAINTEXT_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut material);
    let mut aes_key = [0u8; 32];
    aes_key.copy_from_slice(&material[..32]);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&material[32..48]);

    let mut plain = vec![cloves.len() as u8];
    for clove in cloves {
        if clove.message.len() > u16::MAX as usize {
            anyhow::bail!("clove too large");
        }
        plain.push(clove.instruction);
        plain.extend_from_slice(&(clove.message.len() as u16).to_be_bytes());
        plain.extend_from_slice(&clove.message);
        plain.extend_from_slice(&clove.clove_id.to_be_bytes());
        plain.extend_from_slice(&clove.expiration_ms.to_be_bytes());
    }

    let mut out = elgamal_encrypt(recipient_pubkey, &material).to_vec();
    out.extend_from_slice(&packet::cbc_encrypt_raw(&SessionKey(aes_key), &iv, &plain));
    Ok(out)
}
