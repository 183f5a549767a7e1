// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Top-level wiring: one [`RouterContext`] owns the identity, the
//! private keys, the routing table and the managers for its whole
//! process lifetime, and assembles the signal graph between them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context as _};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::crypto::{DsaPrivateKey, ElGamalPrivateKey, SessionKey};
use crate::database::{
    Database, SqliteDatabase, CONFIG_PRIVATE_ENCRYPTION_KEY, CONFIG_PRIVATE_SIGNING_KEY,
};
use crate::dispatcher::{
    DataHandler, DatabaseLookupHandler, DatabaseSearchReplyHandler, DatabaseStoreHandler,
    DeliveryStatusHandler, Dispatcher, GarlicHandler, TunnelHandler,
};
use crate::i2np::{MsgType, Payload};
use crate::identity::{Certificate, RouterIdentity};
use crate::ids::{KademliaKey, RouterHash};
use crate::kademlia::Kademlia;
use crate::keys::{generate_keys, PrivateKey};
use crate::router_info::{Mapping, RouterAddress, RouterInfo};
use crate::search::SearchManager;
use crate::session::PeerTable;
use crate::signals::{Event, Signals};
use crate::transport::{self, Command, TransportDeps, TransportHandle, UdpTransport};

pub const ROUTER_INFO_FILE: &str = "router.info";
pub const PEERS_DB_FILE: &str = "peers.db";

pub struct RouterContext {
    config: RouterConfig,
    db: Arc<dyn Database>,
    encryption_key: ElGamalPrivateKey,
    signing_key: DsaPrivateKey,
    identity: RouterIdentity,
    kademlia: Arc<Mutex<Kademlia>>,
    signals: Arc<Signals>,
    transport: Option<UdpTransport>,
    search: Option<Arc<SearchManager>>,
    handle: Option<TransportHandle>,
    router_info: Option<RouterInfo>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterContext").finish_non_exhaustive()
    }
}

impl RouterContext {
    /// Open the router database under the configured data dir and load
    /// the identity.
    pub async fn open(config: RouterConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        let db = SqliteDatabase::open(config.data_dir.join(PEERS_DB_FILE))
            .context("opening peers.db")?;
        Self::with_database(config, Arc::new(db)).await
    }

    /// Build a context over an explicit database (tests use the memory
    /// store).
    pub async fn with_database(
        config: RouterConfig,
        db: Arc<dyn Database>,
    ) -> anyhow::Result<Self> {
        let (encryption_key, signing_key) = load_keys(&*db, config.generate_keys)
            .await
            .context("loading private keys")?;

        let identity = RouterIdentity::new(
            encryption_key.public_bytes(),
            signing_key.public_bytes(),
            Certificate::null(),
        )?;
        let hash = identity.hash();
        info!(%hash, "router identity loaded");

        // Seed the routing table with everything the database knows.
        let mut kademlia = Kademlia::new(hash, Utc::now().date_naive());
        for stored in db.get_all_hashes().await? {
            kademlia.insert(stored);
        }
        debug!(seeded = kademlia.len(), "routing table populated");

        Ok(Self {
            config,
            db,
            encryption_key,
            signing_key,
            identity,
            kademlia: Arc::new(Mutex::new(kademlia)),
            signals: Arc::new(Signals::new()),
            transport: None,
            search: None,
            handle: None,
            router_info: None,
            tasks: Vec::new(),
        })
    }

    /// Bind the transport, register the message handlers, publish
    /// `router.info` and start the background timers.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.transport.is_some() {
            bail!("router already started");
        }
        let local_hash = self.identity.hash();
        let intro_key = SessionKey(local_hash.0);
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
        let peers = Arc::new(PeerTable::new());

        let search = SearchManager::new(
            Arc::clone(&self.kademlia),
            Arc::clone(&self.signals),
            cmd_tx.clone(),
            local_hash,
        );

        let dispatcher = Arc::new(self.build_dispatcher(&search, &cmd_tx, local_hash));
        let transport = UdpTransport::start(
            self.config.bind,
            TransportDeps {
                identity: self.identity.clone(),
                signing_key: self.signing_key.clone(),
                intro_key,
                db: Arc::clone(&self.db),
                dispatcher,
                signals: Arc::clone(&self.signals),
                peers,
            },
            cmd_tx.clone(),
            cmd_rx,
        )
        .await?;

        // Connectivity events feed the search manager and the stored
        // peer profiles; the same signals go out to every subscriber.
        let mut events = self.signals.subscribe();
        let pump_search = Arc::clone(&search);
        let pump_db = Arc::clone(&self.db);
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Established { hash, .. } => {
                        pump_search.connected(hash).await;
                        let mut profile = pump_db
                            .get_profile(&hash)
                            .await
                            .ok()
                            .flatten()
                            .unwrap_or_default();
                        profile.last_seen_unix = transport::unix_ms() / 1000;
                        profile.sessions_established += 1;
                        let _ = pump_db.set_profile(&hash, &profile).await;
                    }
                    Event::EstablishmentFailed { hash } => {
                        if !hash.is_placeholder() {
                            pump_search.connection_failure(hash).await;
                            let mut profile = pump_db
                                .get_profile(&hash)
                                .await
                                .ok()
                                .flatten()
                                .unwrap_or_default();
                            profile.failed_attempts += 1;
                            let _ = pump_db.set_profile(&hash, &profile).await;
                        }
                    }
                    Event::PeerDisconnected { hash } => {
                        pump_search.connection_failure(hash).await;
                    }
                    _ => {}
                }
            }
        }));

        // Daily key rotation at UTC midnight.
        let kademlia = Arc::clone(&self.kademlia);
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(until_next_utc_midnight()).await;
                let today = Utc::now().date_naive();
                kademlia.lock().expect("kademlia lock").rotate(today);
                debug!(%today, "routing table rotated");
            }
        }));

        let info = self.build_router_info(&transport, intro_key)?;
        let path = self.config.data_dir.join(ROUTER_INFO_FILE);
        std::fs::write(&path, info.to_bytes()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "router info published");

        self.router_info = Some(info);
        self.handle = Some(transport.handle());
        self.transport = Some(transport);
        self.search = Some(search);
        Ok(())
    }

    fn build_dispatcher(
        &self,
        search: &Arc<SearchManager>,
        cmd_tx: &mpsc::Sender<Command>,
        local_hash: RouterHash,
    ) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MsgType::DatabaseStore,
            Arc::new(DatabaseStoreHandler {
                db: Arc::clone(&self.db),
                kademlia: Arc::clone(&self.kademlia),
                search: Arc::clone(search),
                cmd_tx: cmd_tx.clone(),
            }),
        );
        dispatcher.register(
            MsgType::DatabaseLookup,
            Arc::new(DatabaseLookupHandler {
                db: Arc::clone(&self.db),
                kademlia: Arc::clone(&self.kademlia),
                local_hash,
                cmd_tx: cmd_tx.clone(),
            }),
        );
        dispatcher.register(
            MsgType::DatabaseSearchReply,
            Arc::new(DatabaseSearchReplyHandler {
                search: Arc::clone(search),
            }),
        );
        dispatcher.register(
            MsgType::DeliveryStatus,
            Arc::new(DeliveryStatusHandler {
                signals: Arc::clone(&self.signals),
                cmd_tx: cmd_tx.clone(),
            }),
        );
        dispatcher.register(
            MsgType::Garlic,
            Arc::new(GarlicHandler {
                encryption_key: self.encryption_key.clone(),
                cmd_tx: cmd_tx.clone(),
            }),
        );
        let tunnels = Arc::new(TunnelHandler {
            signals: Arc::clone(&self.signals),
        });
        for msg_type in [
            MsgType::TunnelData,
            MsgType::TunnelGateway,
            MsgType::TunnelBuild,
            MsgType::TunnelBuildReply,
            MsgType::VariableTunnelBuild,
            MsgType::VariableTunnelBuildReply,
        ] {
            let handler: Arc<dyn crate::dispatcher::Handler> = tunnels.clone();
            dispatcher.register(msg_type, handler);
        }
        dispatcher.register(
            MsgType::Data,
            Arc::new(DataHandler {
                signals: Arc::clone(&self.signals),
            }),
        );
        dispatcher
    }

    fn build_router_info(
        &self,
        transport: &UdpTransport,
        intro_key: SessionKey,
    ) -> anyhow::Result<RouterInfo> {
        let mut options = Mapping::new();
        options.set("caps", "R");
        RouterInfo::new_signed(
            self.identity.clone(),
            transport::unix_ms(),
            vec![RouterAddress::ssu(&transport.local_endpoint(), &intro_key)],
            options,
            &self.signing_key,
        )
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn hash(&self) -> RouterHash {
        self.identity.hash()
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn kademlia(&self) -> &Arc<Mutex<Kademlia>> {
        &self.kademlia
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.signals.subscribe()
    }

    /// The signed self-description published at startup.
    pub fn router_info(&self) -> anyhow::Result<RouterInfo> {
        self.router_info
            .clone()
            .ok_or_else(|| anyhow::anyhow!("router not started"))
    }

    pub fn transport(&self) -> anyhow::Result<&UdpTransport> {
        self.transport
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("router not started"))
    }

    fn running_handle(&self) -> anyhow::Result<&TransportHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("router not started"))
    }

    /// Establish a session to another router.
    pub async fn connect(&self, info: RouterInfo) -> anyhow::Result<()> {
        self.running_handle()?
            .send(Command::Connect(Box::new(info)))
            .await
    }

    /// Queue a message to an established peer.
    pub async fn send_message(&self, to: RouterHash, payload: Payload) -> anyhow::Result<()> {
        self.running_handle()?
            .send(Command::SendMessage(to, payload))
            .await
    }

    /// Tear down the session to `hash`.
    pub async fn disconnect(&self, hash: RouterHash) -> anyhow::Result<()> {
        self.running_handle()?
            .send(Command::Disconnect(hash))
            .await
    }

    /// Begin an iterative lookup for `goal`, starting at `start`.
    pub async fn create_search(
        &self,
        goal: KademliaKey,
        start: RouterHash,
    ) -> anyhow::Result<()> {
        self.search
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("router not started"))?
            .create_search(goal, start)
            .await
    }

    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
        self.search = None;
        self.handle = None;
    }
}

/// Load (or, when allowed, provision) the two private keys.
async fn load_keys(
    db: &dyn Database,
    generate: bool,
) -> anyhow::Result<(ElGamalPrivateKey, DsaPrivateKey)> {
    let enc_pem = db.get_config_value(CONFIG_PRIVATE_ENCRYPTION_KEY).await?;
    let sig_pem = db.get_config_value(CONFIG_PRIVATE_SIGNING_KEY).await?;

    match (enc_pem, sig_pem) {
        (Some(enc), Some(sig)) => {
            let PrivateKey::ElGamal(encryption_key) =
                PrivateKey::from_pem(std::str::from_utf8(&enc)?)?
            else {
                bail!("{CONFIG_PRIVATE_ENCRYPTION_KEY} is not an elgamal key");
            };
            let PrivateKey::Dsa(signing_key) = PrivateKey::from_pem(std::str::from_utf8(&sig)?)?
            else {
                bail!("{CONFIG_PRIVATE_SIGNING_KEY} is not a dsa key");
            };
            Ok((encryption_key, signing_key))
        }
        (None, None) if generate => {
            warn!("no private keys in database, generating");
            Ok(provision_keys(db).await?)
        }
        _ => bail!("private keys missing from database"),
    }
}

/// Generate and persist a fresh identity keypair.
pub async fn provision_keys(db: &dyn Database) -> anyhow::Result<(ElGamalPrivateKey, DsaPrivateKey)> {
    let (encryption_key, signing_key) = generate_keys();
    db.set_config_value(
        CONFIG_PRIVATE_ENCRYPTION_KEY,
        PrivateKey::ElGamal(encryption_key.clone()).to_pem().as_bytes(),
    )
    .await?;
    db.set_config_value(
        CONFIG_PRIVATE_SIGNING_KEY,
        PrivateKey::Dsa(signing_key.clone()).to_pem().as_bytes(),
    )
    .await?;
    Ok((encryption_key, signing_key))
}

fn until_next_utc_midnight() -> Duration {
    let now = Utc::now();
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc();
    (midnight - now)
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}
