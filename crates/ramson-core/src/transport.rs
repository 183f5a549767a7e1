// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The UDP transport event loop.
//!
//! One task owns the socket and serializes all per-endpoint state
//! changes: datagrams are handled in arrival order, upward API calls
//! arrive as [`Command`]s over a channel, and a 250 ms housekeeping
//! tick drives retransmission, keepalive and reassembly expiry.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::crypto::DsaPrivateKey;
use crate::database::Database;
use crate::dispatcher::Dispatcher;
use crate::establishment::EstablishmentManager;
use crate::i2np::{DatabaseLookup, Message, Payload};
use crate::identity::RouterIdentity;
use crate::ids::{KademliaKey, RouterHash};
use crate::packet::PacketType;
use crate::router_info::RouterInfo;
use crate::session::{DataPayload, DecodeOutcome, PeerTable};
use crate::signals::{Event, Signals};

/// Default lifetime of an outbound inter-router message.
pub const MESSAGE_TTL_MS: u64 = 60_000;
const HOUSEKEEP_INTERVAL: Duration = Duration::from_millis(250);
const COMMAND_DEPTH: usize = 256;
const DELIVERY_TRACK_TTL: Duration = Duration::from_secs(120);

/// A remote UDP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Work posted onto the transport loop. Upward API calls never mutate
/// transport state directly; they send one of these.
#[derive(Debug)]
pub enum Command {
    /// Establish a session to a router's published SSU address.
    Connect(Box<RouterInfo>),
    /// Serialize and send a message to an established peer.
    SendMessage(RouterHash, Payload),
    /// Send a database lookup for `goal`, establishing first if needed.
    SendLookup(RouterHash, KademliaKey),
    /// Tear down a session, announcing it to the peer.
    Disconnect(RouterHash),
    /// Re-dispatch a locally produced message (garlic cloves).
    DispatchLocal(RouterHash, Vec<u8>),
    /// An end-to-end delivery confirmation for a tracked message.
    DeliveryConfirmed(u32),
    /// Establishment deadline fired (with the state epoch it was armed
    /// for).
    EstablishTimeout(Endpoint, u64),
    Shutdown,
}

/// Cloneable sender half used by every component that talks to the
/// transport.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl TransportHandle {
    pub async fn send(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("transport loop stopped"))
    }

    pub fn try_send(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .try_send(command)
            .map_err(|_| anyhow::anyhow!("transport queue full or stopped"))
    }
}

/// Everything the loop needs besides the socket.
pub struct TransportDeps {
    pub identity: RouterIdentity,
    pub signing_key: DsaPrivateKey,
    pub intro_key: crate::crypto::SessionKey,
    pub db: Arc<dyn Database>,
    pub dispatcher: Arc<Dispatcher>,
    pub signals: Arc<Signals>,
    pub peers: Arc<PeerTable>,
}

pub struct UdpTransport {
    handle: TransportHandle,
    peers: Arc<PeerTable>,
    establisher: Arc<EstablishmentManager>,
    local_ep: Endpoint,
    task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the socket and spawn the event loop. A bind failure is
    /// fatal to startup.
    pub async fn start(
        bind: SocketAddr,
        deps: TransportDeps,
        cmd_tx: mpsc::Sender<Command>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> anyhow::Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(bind)
                .await
                .map_err(|err| anyhow::anyhow!("udp bind {bind} failed: {err}"))?,
        );
        let local_ep = Endpoint::from(socket.local_addr()?);
        info!(%local_ep, "transport bound");

        let establisher = Arc::new(EstablishmentManager::new(
            deps.identity.clone(),
            deps.signing_key.clone(),
            deps.intro_key,
            local_ep,
            Arc::clone(&socket),
            Arc::clone(&deps.peers),
            Arc::clone(&deps.signals),
            cmd_tx.clone(),
        ));

        let loop_state = LoopState {
            socket,
            local_ep,
            local_hash: deps.identity.hash(),
            peers: Arc::clone(&deps.peers),
            establisher: Arc::clone(&establisher),
            dispatcher: deps.dispatcher,
            signals: deps.signals,
            db: deps.db,
            delivery_tracker: HashMap::new(),
        };
        let task = tokio::spawn(run_loop(loop_state, cmd_rx));

        Ok(Self {
            handle: TransportHandle { cmd_tx },
            peers: deps.peers,
            establisher,
            local_ep,
            task,
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_ep
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn establisher(&self) -> &Arc<EstablishmentManager> {
        &self.establisher
    }

    pub async fn shutdown(self) {
        let _ = self.handle.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

struct LoopState {
    socket: Arc<UdpSocket>,
    local_ep: Endpoint,
    local_hash: RouterHash,
    peers: Arc<PeerTable>,
    establisher: Arc<EstablishmentManager>,
    dispatcher: Arc<Dispatcher>,
    signals: Arc<Signals>,
    db: Arc<dyn Database>,
    delivery_tracker: HashMap<u32, Instant>,
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

pub(crate) fn unix_secs() -> u32 {
    (unix_ms() / 1000) as u32
}

async fn run_loop(mut state: LoopState, mut cmd_rx: mpsc::Receiver<Command>) {
    let socket = Arc::clone(&state.socket);
    let mut buf = vec![0u8; 65536];
    let mut housekeep = tokio::time::interval(HOUSEKEEP_INTERVAL);
    housekeep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) => {
                    let from = Endpoint::from(addr);
                    trace!(%from, len, "datagram received");
                    handle_datagram(&mut state, from, &buf[..len]).await;
                }
                Err(err) => debug!(%err, "udp receive error"),
            },
            command = cmd_rx.recv() => match command {
                None | Some(Command::Shutdown) => {
                    debug!("transport loop stopping");
                    break;
                }
                Some(command) => handle_command(&mut state, command).await,
            },
            _ = housekeep.tick() => housekeeping(&mut state).await,
        }
    }
}

async fn handle_datagram(state: &mut LoopState, from: Endpoint, datagram: &[u8]) {
    let now = Instant::now();
    let now_secs = unix_secs();

    let Some(hash) = state.peers.hash_for(&from) else {
        state
            .establisher
            .handle_packet(from, datagram, now_secs)
            .await;
        return;
    };

    match state
        .peers
        .decode_datagram(&hash, datagram, &state.local_ep, now_secs, now)
    {
        DecodeOutcome::Packet(packet) => match packet.kind {
            PacketType::Data => {
                let payload = match DataPayload::from_bytes(&packet.body) {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!(%from, %err, "undecodable data payload");
                        return;
                    }
                };
                let (completed, ack) = state.peers.handle_data(&hash, &payload, now_secs, now);
                if let Some((ep, datagram)) = ack {
                    let _ = state.socket.send_to(&datagram, ep.socket_addr()).await;
                }
                let now_ms = unix_ms();
                for message in completed {
                    state.dispatcher.dispatch(hash, &message, now_ms).await;
                }
            }
            PacketType::SessionDestroyed => {
                debug!(%from, %hash, "peer destroyed the session");
                state.peers.remove(&hash);
                state.signals.emit(Event::PeerDisconnected { hash });
            }
            kind => {
                debug!(%from, ?kind, "unhandled packet type on established session");
            }
        },
        DecodeOutcome::Drop(err) => {
            debug!(%from, %err, "dropping session datagram");
        }
        DecodeOutcome::Dead => {
            debug!(%from, %hash, "session exceeded mac failure budget");
            state.peers.remove(&hash);
            state.signals.emit(Event::PeerDisconnected { hash });
        }
    }
}

async fn handle_command(state: &mut LoopState, command: Command) {
    match command {
        Command::Connect(info) => {
            let hash = info.identity.hash();
            if let Err(err) = state.establisher.connect(&info, unix_secs()).await {
                debug!(%hash, %err, "connect failed");
                state.signals.emit(Event::EstablishmentFailed { hash });
            }
        }
        Command::SendMessage(to, payload) => {
            send_message(state, to, payload).await;
        }
        Command::SendLookup(to, goal) => {
            if state.peers.contains(&to) {
                let payload = Payload::DatabaseLookup(DatabaseLookup {
                    key: goal.0,
                    from: state.local_hash,
                    excluded: Vec::new(),
                });
                send_message(state, to, payload).await;
                return;
            }
            match state.db.get_router_info(&to).await {
                Ok(Some(bytes)) => match RouterInfo::from_bytes(&bytes) {
                    Ok(info) => {
                        if let Err(err) = state.establisher.connect(&info, unix_secs()).await {
                            debug!(%to, %err, "lookup connect failed");
                            state
                                .signals
                                .emit(Event::EstablishmentFailed { hash: to });
                        }
                    }
                    Err(err) => {
                        debug!(%to, %err, "stored router info unparseable");
                        state
                            .signals
                            .emit(Event::EstablishmentFailed { hash: to });
                    }
                },
                _ => {
                    debug!(%to, "no router info for lookup target");
                    state
                        .signals
                        .emit(Event::EstablishmentFailed { hash: to });
                }
            }
        }
        Command::Disconnect(hash) => {
            if let Some((ep, datagram)) = state.peers.build_destroy(&hash, unix_secs()) {
                let _ = state.socket.send_to(&datagram, ep.socket_addr()).await;
            }
            if state.peers.remove(&hash).is_some() {
                state.signals.emit(Event::PeerDisconnected { hash });
            }
        }
        Command::DispatchLocal(from, bytes) => {
            state.dispatcher.dispatch(from, &bytes, unix_ms()).await;
        }
        Command::DeliveryConfirmed(msg_id) => {
            if let Some(sent_at) = state.delivery_tracker.remove(&msg_id) {
                trace!(msg_id, elapsed_ms = sent_at.elapsed().as_millis() as u64, "delivery confirmed");
            }
        }
        Command::EstablishTimeout(ep, epoch) => {
            state.establisher.on_timeout(ep, epoch).await;
        }
        Command::Shutdown => unreachable!("handled by the loop"),
    }
}

async fn send_message(state: &mut LoopState, to: RouterHash, payload: Payload) {
    let message = Message::new(payload, unix_ms(), MESSAGE_TTL_MS);
    let bytes = match message.to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(%to, %err, "unencodable message");
            return;
        }
    };

    match state
        .peers
        .build_send(&to, message.msg_id, &bytes, unix_secs(), Instant::now())
    {
        Ok(datagrams) => {
            state.delivery_tracker.insert(message.msg_id, Instant::now());
            for (ep, datagram) in datagrams {
                let _ = state.socket.send_to(&datagram, ep.socket_addr()).await;
            }
        }
        Err(err) => {
            debug!(%to, %err, "cannot send to peer");
        }
    }
}

async fn housekeeping(state: &mut LoopState) {
    let now = Instant::now();
    let outcome = state.peers.housekeep(now, unix_secs());
    for (ep, datagram) in outcome.datagrams {
        let _ = state.socket.send_to(&datagram, ep.socket_addr()).await;
    }
    for hash in outcome.dead {
        debug!(%hash, "session died during housekeeping");
        state.signals.emit(Event::PeerDisconnected { hash });
    }
    state
        .delivery_tracker
        .retain(|_, sent_at| now.duration_since(*sent_at) < DELIVERY_TRACK_TTL);
}
