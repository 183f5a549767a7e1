// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The four-way session establishment state machine.
//!
//! An outbound handshake walks REQUEST_SENT → CREATED_RECEIVED →
//! CONFIRMED_SENT; an inbound one REQUEST_RECEIVED → CREATED_SENT →
//! CONFIRMED_RECEIVED. The request and created packets ride on the
//! responder's published introduction key; once the shared secret
//! exists both sides switch to the derived session keys. Any
//! verification failure, malformed packet, unexpected phase or the 10 s
//! deadline is terminal: the state is destroyed and the failure signal
//! fired. Retry policy belongs to the caller.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::crypto::{
    dsa_verify, split_session_keys, DhKeyPair, DsaPrivateKey, MacKey, SessionKey, DH_PUBLIC_LEN,
    DSA_SIGNATURE_LEN,
};
use crate::identity::RouterIdentity;
use crate::ids::RouterHash;
use crate::packet::{self, Packet, PacketType, IV_LEN};
use crate::router_info::RouterInfo;
use crate::session::{PeerState, PeerTable};
use crate::signals::{Event, Signals};
use crate::transport::{Command, Endpoint};

pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Padded size of the encrypted signature block in a created packet.
const ENC_SIGNATURE_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestSent,
    RequestReceived,
    CreatedSent,
    CreatedReceived,
    ConfirmedSent,
    ConfirmedReceived,
    Failure,
}

struct EstablishmentState {
    direction: Direction,
    phase: Phase,
    /// Known up front for outbound handshakes, learned from the
    /// confirmed packet for inbound ones.
    their_identity: Option<RouterIdentity>,
    dh: DhKeyPair,
    their_public: Option<Vec<u8>>,
    /// Keys the next packet of this handshake is encrypted under.
    session_key: SessionKey,
    mac_key: MacKey,
    /// Derived keys the established session will use.
    derived: Option<(SessionKey, MacKey)>,
    alice_ep: Option<Endpoint>,
    bob_ep: Option<Endpoint>,
    relay_tag: u32,
    epoch: u64,
}

static STATE_EPOCH: AtomicU64 = AtomicU64::new(1);

pub struct EstablishmentManager {
    identity: RouterIdentity,
    signing_key: DsaPrivateKey,
    /// Our published introduction key; inbound handshakes start on it.
    intro_key: SessionKey,
    local_ep: Endpoint,
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    signals: Arc<Signals>,
    cmd_tx: mpsc::Sender<Command>,
    states: Mutex<HashMap<Endpoint, EstablishmentState>>,
}

impl EstablishmentManager {
    pub fn new(
        identity: RouterIdentity,
        signing_key: DsaPrivateKey,
        intro_key: SessionKey,
        local_ep: Endpoint,
        socket: Arc<UdpSocket>,
        peers: Arc<PeerTable>,
        signals: Arc<Signals>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            identity,
            signing_key,
            intro_key,
            local_ep,
            socket,
            peers,
            signals,
            cmd_tx,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().expect("state table lock").len()
    }

    pub fn state_exists(&self, ep: &Endpoint) -> bool {
        self.states
            .lock()
            .expect("state table lock")
            .contains_key(ep)
    }

    fn ip_busy(states: &HashMap<Endpoint, EstablishmentState>, ip: &IpAddr) -> bool {
        states.keys().any(|ep| ep.ip == *ip)
    }

    fn arm_timer(&self, ep: Endpoint, epoch: u64) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ESTABLISH_TIMEOUT).await;
            let _ = cmd_tx.send(Command::EstablishTimeout(ep, epoch)).await;
        });
    }

    /// Start an outbound handshake against a router's published SSU
    /// address.
    pub async fn connect(&self, info: &RouterInfo, now_secs: u32) -> anyhow::Result<()> {
        let hash = info.identity.hash();
        if self.peers.contains(&hash) {
            // Already established; re-announce for the caller's benefit.
            self.signals.emit(Event::Established {
                hash,
                inbound: false,
            });
            return Ok(());
        }

        let address = info
            .ssu_address()
            .ok_or_else(|| anyhow::anyhow!("router publishes no SSU address"))?;
        let their_ep = address.endpoint()?;
        let intro_key = address.intro_key()?;

        let dh = DhKeyPair::generate();
        let epoch = STATE_EPOCH.fetch_add(1, Ordering::Relaxed);
        {
            let mut states = self.states.lock().expect("state table lock");
            if Self::ip_busy(&states, &their_ep.ip) {
                anyhow::bail!("establishment already in progress for {}", their_ep.ip);
            }

            let mut body = Vec::with_capacity(DH_PUBLIC_LEN + 20);
            body.extend_from_slice(dh.public_bytes());
            encode_endpoint(&mut body, &their_ep);

            let datagram = packet::encode(
                PacketType::SessionRequest,
                now_secs,
                &body,
                &intro_key,
                &MacKey(intro_key.0),
                &their_ep,
            );
            // Send is queued after the state exists so a fast responder
            // cannot race us.
            states.insert(
                their_ep,
                EstablishmentState {
                    direction: Direction::Outbound,
                    phase: Phase::RequestSent,
                    their_identity: Some(info.identity.clone()),
                    dh,
                    their_public: None,
                    session_key: intro_key,
                    mac_key: MacKey(intro_key.0),
                    derived: None,
                    alice_ep: None,
                    bob_ep: Some(their_ep),
                    relay_tag: 0,
                    epoch,
                },
            );
            let socket = Arc::clone(&self.socket);
            tokio::spawn(async move {
                if let Err(err) = socket.send_to(&datagram, their_ep.socket_addr()).await {
                    debug!(%their_ep, %err, "session request send failed");
                }
            });
        }
        debug!(%their_ep, "sent session request");
        self.arm_timer(their_ep, epoch);
        Ok(())
    }

    /// Entry point for datagrams from endpoints without an established
    /// session.
    pub async fn handle_packet(&self, from: Endpoint, datagram: &[u8], now_secs: u32) {
        let known = self.state_exists(&from);
        if known {
            self.handle_known(from, datagram, now_secs).await;
        } else {
            self.handle_unknown(from, datagram, now_secs).await;
        }
    }

    async fn handle_known(&self, from: Endpoint, datagram: &[u8], now_secs: u32) {
        let (session_key, mac_key, phase, direction) = {
            let states = self.states.lock().expect("state table lock");
            let state = match states.get(&from) {
                Some(state) => state,
                None => return,
            };
            (
                state.session_key,
                state.mac_key,
                state.phase,
                state.direction,
            )
        };

        let packet = match packet::decode(datagram, &session_key, &mac_key, &self.local_ep, now_secs)
        {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%from, %err, "dropping handshake datagram");
                return;
            }
        };

        match (direction, phase, packet.kind) {
            (Direction::Outbound, Phase::RequestSent, PacketType::SessionCreated) => {
                self.process_created(from, &packet, now_secs).await;
            }
            (Direction::Inbound, Phase::CreatedSent, PacketType::SessionConfirmed) => {
                self.process_confirmed(from, &packet).await;
            }
            (_, _, kind) => {
                error!(%from, ?kind, ?phase, "unexpected packet for handshake phase");
                self.fail(from).await;
            }
        }
    }

    async fn handle_unknown(&self, from: Endpoint, datagram: &[u8], now_secs: u32) {
        let packet = match packet::decode(
            datagram,
            &self.intro_key,
            &MacKey(self.intro_key.0),
            &self.local_ep,
            now_secs,
        ) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%from, %err, "dropping datagram from unknown endpoint");
                return;
            }
        };
        if packet.kind != PacketType::SessionRequest {
            debug!(%from, kind = ?packet.kind, "ignoring non-request from unknown endpoint");
            return;
        }
        self.process_request(from, &packet, now_secs).await;
    }

    /// Inbound side: request received, answer with created and switch to
    /// the derived keys.
    async fn process_request(&self, from: Endpoint, packet: &Packet, now_secs: u32) {
        debug!(%from, "received session request");
        let Some((their_public, bob_ep, _)) = parse_request(&packet.body) else {
            debug!(%from, "malformed session request");
            return;
        };

        let dh = DhKeyPair::generate();
        let shared = dh.agree(&their_public);
        let (derived_session, derived_mac) = split_session_keys(&shared);
        let relay_tag = rand::random::<u32>();
        let signed_on = now_secs;

        let material = signed_material(
            &their_public,
            dh.public_bytes(),
            &from,
            &bob_ep,
            relay_tag,
            signed_on,
        );
        let signature = self.signing_key.sign(&material);

        let mut sig_iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut sig_iv);
        let mut sig_block = signature.to_vec();
        sig_block.resize(ENC_SIGNATURE_LEN, 0);
        let enc_sig = packet::cbc_encrypt_raw(&derived_session, &sig_iv, &sig_block);

        let mut body = Vec::with_capacity(DH_PUBLIC_LEN + 90);
        body.extend_from_slice(dh.public_bytes());
        encode_endpoint(&mut body, &from);
        body.extend_from_slice(&relay_tag.to_be_bytes());
        body.extend_from_slice(&signed_on.to_be_bytes());
        body.extend_from_slice(&sig_iv);
        body.extend_from_slice(&enc_sig);

        let datagram = packet::encode(
            PacketType::SessionCreated,
            now_secs,
            &body,
            &self.intro_key,
            &MacKey(self.intro_key.0),
            &from,
        );

        let epoch = STATE_EPOCH.fetch_add(1, Ordering::Relaxed);
        {
            let mut states = self.states.lock().expect("state table lock");
            if Self::ip_busy(&states, &from.ip) {
                debug!(%from, "establishment already in progress for ip, dropping request");
                return;
            }
            states.insert(
                from,
                EstablishmentState {
                    direction: Direction::Inbound,
                    phase: Phase::RequestReceived,
                    their_identity: None,
                    dh,
                    their_public: Some(their_public),
                    // The confirmed packet arrives under the derived keys.
                    session_key: derived_session,
                    mac_key: derived_mac,
                    derived: Some((derived_session, derived_mac)),
                    alice_ep: Some(from),
                    bob_ep: Some(bob_ep),
                    relay_tag,
                    epoch,
                },
            );
        }

        if let Err(err) = self.socket.send_to(&datagram, from.socket_addr()).await {
            debug!(%from, %err, "session created send failed");
        }
        if let Some(state) = self
            .states
            .lock()
            .expect("state table lock")
            .get_mut(&from)
        {
            state.phase = Phase::CreatedSent;
        }
        debug!(%from, "sent session created");
        self.arm_timer(from, epoch);
    }

    /// Outbound side: created received, verify, promote keys, confirm.
    async fn process_created(&self, from: Endpoint, packet: &Packet, now_secs: u32) {
        debug!(%from, "received session created");
        let parsed = parse_created(&packet.body);
        let Some(created) = parsed else {
            debug!(%from, "malformed session created");
            self.fail(from).await;
            return;
        };

        let (identity, material_ok, derived) = {
            let states = self.states.lock().expect("state table lock");
            let Some(state) = states.get(&from) else {
                return;
            };
            let identity = state.their_identity.clone().expect("outbound knows identity");
            let shared = state.dh.agree(&created.their_public);
            let derived = split_session_keys(&shared);

            let sig_block =
                packet::cbc_decrypt_raw(&derived.0, &created.sig_iv, &created.enc_signature);
            let material_ok = match sig_block {
                Ok(block) if block.len() >= DSA_SIGNATURE_LEN => {
                    let material = signed_material(
                        state.dh.public_bytes(),
                        &created.their_public,
                        &created.alice_ep,
                        &state.bob_ep.expect("outbound knows bob"),
                        created.relay_tag,
                        created.signed_on,
                    );
                    dsa_verify(
                        identity.signing_key(),
                        &material,
                        &block[..DSA_SIGNATURE_LEN],
                    )
                }
                _ => false,
            };
            (identity, material_ok, derived)
        };

        if !material_ok {
            error!(%from, "session created signature verification failed");
            self.fail(from).await;
            return;
        }

        // Build the confirmed packet under the derived keys.
        let signed_on = now_secs;
        let confirm_body = {
            let mut states = self.states.lock().expect("state table lock");
            let Some(state) = states.get_mut(&from) else {
                return;
            };
            state.phase = Phase::CreatedReceived;
            state.their_public = Some(created.their_public.clone());
            state.alice_ep = Some(created.alice_ep);
            state.relay_tag = created.relay_tag;
            state.session_key = derived.0;
            state.mac_key = derived.1;
            state.derived = Some(derived);

            let bob_ep = state.bob_ep.expect("outbound knows bob");
            let material = signed_material(
                state.dh.public_bytes(),
                &created.their_public,
                &created.alice_ep,
                &bob_ep,
                created.relay_tag,
                signed_on,
            );
            let signature = self.signing_key.sign(&material);

            let identity_bytes = self.identity.to_bytes();
            let mut body = Vec::with_capacity(identity_bytes.len() + 46);
            body.extend_from_slice(&(identity_bytes.len() as u16).to_be_bytes());
            body.extend_from_slice(&identity_bytes);
            body.extend_from_slice(&signed_on.to_be_bytes());
            body.extend_from_slice(&signature);
            state.phase = Phase::ConfirmedSent;
            body
        };

        let datagram = packet::encode(
            PacketType::SessionConfirmed,
            now_secs,
            &confirm_body,
            &derived.0,
            &derived.1,
            &from,
        );
        if let Err(err) = self.socket.send_to(&datagram, from.socket_addr()).await {
            debug!(%from, %err, "session confirmed send failed");
        }
        debug!(%from, "sent session confirmed");

        // Transfer the state into an established peer before announcing.
        self.remove_state(&from);
        self.peers.insert(PeerState::new(
            from,
            identity.clone(),
            derived.0,
            derived.1,
            std::time::Instant::now(),
        ));
        self.signals.emit(Event::Established {
            hash: identity.hash(),
            inbound: false,
        });
    }

    /// Inbound side: confirmed received, verify the initiator's identity
    /// and signature, establish.
    async fn process_confirmed(&self, from: Endpoint, packet: &Packet) {
        debug!(%from, "received session confirmed");
        let Some((identity, signed_on, signature)) = parse_confirmed(&packet.body) else {
            debug!(%from, "malformed session confirmed");
            self.fail(from).await;
            return;
        };

        let (verified, derived) = {
            let mut states = self.states.lock().expect("state table lock");
            let Some(state) = states.get_mut(&from) else {
                return;
            };
            state.phase = Phase::ConfirmedReceived;
            let material = signed_material(
                state.their_public.as_deref().expect("inbound saw request"),
                state.dh.public_bytes(),
                &state.alice_ep.expect("inbound saw request"),
                &state.bob_ep.expect("inbound saw request"),
                state.relay_tag,
                signed_on,
            );
            (
                dsa_verify(identity.signing_key(), &material, &signature),
                state.derived.expect("created sent"),
            )
        };

        if !verified {
            error!(%from, "session confirmed signature verification failed");
            self.fail(from).await;
            return;
        }

        self.remove_state(&from);
        self.peers.insert(PeerState::new(
            from,
            identity.clone(),
            derived.0,
            derived.1,
            std::time::Instant::now(),
        ));
        self.signals.emit(Event::Established {
            hash: identity.hash(),
            inbound: true,
        });
    }

    /// Deadline expiry posted back through the event loop. A stale epoch
    /// means the state already completed or was replaced.
    pub async fn on_timeout(&self, ep: Endpoint, epoch: u64) {
        let live = {
            let states = self.states.lock().expect("state table lock");
            states.get(&ep).map(|state| state.epoch) == Some(epoch)
        };
        if live {
            debug!(%ep, "establishment timed out");
            self.fail(ep).await;
        }
    }

    async fn fail(&self, ep: Endpoint) {
        let hash = {
            let mut states = self.states.lock().expect("state table lock");
            states.remove(&ep).and_then(|mut state| {
                state.phase = Phase::Failure;
                state
                    .their_identity
                    .as_ref()
                    .map(RouterIdentity::hash)
            })
        };
        error!(%ep, "establishment failed");
        self.signals.emit(Event::EstablishmentFailed {
            hash: hash.unwrap_or_else(RouterHash::placeholder),
        });
    }

    fn remove_state(&self, ep: &Endpoint) {
        self.states.lock().expect("state table lock").remove(ep);
    }
}

struct CreatedFields {
    their_public: Vec<u8>,
    alice_ep: Endpoint,
    relay_tag: u32,
    signed_on: u32,
    sig_iv: [u8; IV_LEN],
    enc_signature: Vec<u8>,
}

/// Canonical byte string both signatures cover.
fn signed_material(
    x: &[u8],
    y: &[u8],
    alice: &Endpoint,
    bob: &Endpoint,
    relay_tag: u32,
    signed_on: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * DH_PUBLIC_LEN + 48);
    out.extend_from_slice(x);
    out.extend_from_slice(y);
    encode_endpoint(&mut out, alice);
    encode_endpoint(&mut out, bob);
    out.extend_from_slice(&relay_tag.to_be_bytes());
    out.extend_from_slice(&signed_on.to_be_bytes());
    out
}

fn encode_endpoint(out: &mut Vec<u8>, ep: &Endpoint) {
    match ep.ip {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&ep.port.to_be_bytes());
}

fn decode_endpoint(buf: &[u8]) -> Option<(Endpoint, usize)> {
    let len = *buf.first()? as usize;
    if len != 4 && len != 16 {
        return None;
    }
    if buf.len() < 1 + len + 2 {
        return None;
    }
    let ip: IpAddr = if len == 4 {
        let octets: [u8; 4] = buf[1..5].try_into().expect("4 bytes");
        IpAddr::from(octets)
    } else {
        let octets: [u8; 16] = buf[1..17].try_into().expect("16 bytes");
        IpAddr::from(octets)
    };
    let port = u16::from_be_bytes([buf[1 + len], buf[2 + len]]);
    Some((Endpoint { ip, port }, 1 + len + 2))
}

fn parse_request(body: &[u8]) -> Option<(Vec<u8>, Endpoint, usize)> {
    if body.len() < DH_PUBLIC_LEN + 7 {
        return None;
    }
    let their_public = body[..DH_PUBLIC_LEN].to_vec();
    let (bob_ep, consumed) = decode_endpoint(&body[DH_PUBLIC_LEN..])?;
    Some((their_public, bob_ep, DH_PUBLIC_LEN + consumed))
}

fn parse_created(body: &[u8]) -> Option<CreatedFields> {
    if body.len() < DH_PUBLIC_LEN + 7 {
        return None;
    }
    let their_public = body[..DH_PUBLIC_LEN].to_vec();
    let (alice_ep, consumed) = decode_endpoint(&body[DH_PUBLIC_LEN..])?;
    let mut pos = DH_PUBLIC_LEN + consumed;
    if body.len() < pos + 8 + IV_LEN + ENC_SIGNATURE_LEN {
        return None;
    }
    let relay_tag = u32::from_be_bytes(body[pos..pos + 4].try_into().expect("4 bytes"));
    pos += 4;
    let signed_on = u32::from_be_bytes(body[pos..pos + 4].try_into().expect("4 bytes"));
    pos += 4;
    let sig_iv: [u8; IV_LEN] = body[pos..pos + IV_LEN].try_into().expect("iv bytes");
    pos += IV_LEN;
    let enc_signature = body[pos..pos + ENC_SIGNATURE_LEN].to_vec();
    Some(CreatedFields {
        their_public,
        alice_ep,
        relay_tag,
        signed_on,
        sig_iv,
        enc_signature,
    })
}

fn parse_confirmed(body: &[u8]) -> Option<(RouterIdentity, u32, Vec<u8>)> {
    if body.len() < 2 {
        return None;
    }
    let id_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + id_len + 4 + DSA_SIGNATURE_LEN {
        return None;
    }
    let (identity, consumed) = RouterIdentity::from_bytes(&body[2..2 + id_len]).ok()?;
    if consumed != id_len {
        return None;
    }
    let mut pos = 2 + id_len;
    let signed_on = u32::from_be_bytes(body[pos..pos + 4].try_into().expect("4 bytes"));
    pos += 4;
    let signature = body[pos..pos + DSA_SIGNATURE_LEN].to_vec();
    Some((identity, signed_on, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ElGamalPrivateKey;
    use crate::identity::Certificate;
    use crate::router_info::{Mapping, RouterAddress};

    struct Harness {
        manager: Arc<EstablishmentManager>,
        socket: Arc<UdpSocket>,
        ep: Endpoint,
        info: RouterInfo,
        signals: Arc<Signals>,
        peers: Arc<PeerTable>,
        _cmd_rx: mpsc::Receiver<Command>,
    }

    async fn harness() -> Harness {
        let socket = Arc::new(
            UdpSocket::bind("127.0.0.1:0")
                .await
                .expect("bind test socket"),
        );
        let addr = socket.local_addr().expect("local addr");
        let ep = Endpoint {
            ip: addr.ip(),
            port: addr.port(),
        };

        let elgamal = ElGamalPrivateKey::generate();
        let dsa = DsaPrivateKey::generate();
        let identity = RouterIdentity::new(
            elgamal.public_bytes(),
            dsa.public_bytes(),
            Certificate::null(),
        )
        .expect("valid identity");
        let intro_key = SessionKey(identity.hash().0);
        let info = RouterInfo::new_signed(
            identity.clone(),
            1,
            vec![RouterAddress::ssu(&ep, &intro_key)],
            Mapping::new(),
            &dsa,
        )
        .expect("signed router info");

        let signals = Arc::new(Signals::new());
        let peers = Arc::new(PeerTable::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let manager = Arc::new(EstablishmentManager::new(
            identity,
            dsa,
            intro_key,
            ep,
            Arc::clone(&socket),
            Arc::clone(&peers),
            Arc::clone(&signals),
            cmd_tx,
        ));
        Harness {
            manager,
            socket,
            ep,
            info,
            signals,
            peers,
            _cmd_rx: cmd_rx,
        }
    }

    async fn recv(socket: &UdpSocket) -> (Endpoint, Vec<u8>) {
        let mut buf = vec![0u8; 4096];
        let (n, addr) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram within deadline")
            .expect("recv");
        buf.truncate(n);
        (
            Endpoint {
                ip: addr.ip(),
                port: addr.port(),
            },
            buf,
        )
    }

    fn now_secs() -> u32 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_secs() as u32
    }

    #[tokio::test]
    async fn full_handshake_establishes_both_sides() {
        let alice = harness().await;
        let bob = harness().await;
        let mut alice_events = alice.signals.subscribe();
        let mut bob_events = bob.signals.subscribe();

        alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect("connect");

        // Drive the datagrams by hand: request → created → confirmed.
        let (from_alice, request) = recv(&bob.socket).await;
        bob.manager
            .handle_packet(from_alice, &request, now_secs())
            .await;

        let (from_bob, created) = recv(&alice.socket).await;
        assert_eq!(from_bob, bob.ep);
        alice
            .manager
            .handle_packet(from_bob, &created, now_secs())
            .await;

        let (_, confirmed) = recv(&bob.socket).await;
        bob.manager
            .handle_packet(from_alice, &confirmed, now_secs())
            .await;

        let alice_event = alice_events.recv().await.expect("alice event");
        assert!(
            matches!(alice_event, Event::Established { inbound: false, hash } if hash == bob.info.identity.hash())
        );
        let bob_event = bob_events.recv().await.expect("bob event");
        assert!(matches!(bob_event, Event::Established { inbound: true, .. }));

        assert_eq!(alice.peers.len(), 1);
        assert_eq!(bob.peers.len(), 1);
        assert_eq!(alice.manager.state_count(), 0);
        assert_eq!(bob.manager.state_count(), 0);
    }

    #[tokio::test]
    async fn both_peers_derive_identical_session_keys() {
        let alice = harness().await;
        let bob = harness().await;

        alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect("connect");
        let (from_alice, request) = recv(&bob.socket).await;
        bob.manager
            .handle_packet(from_alice, &request, now_secs())
            .await;
        let (from_bob, created) = recv(&alice.socket).await;
        alice
            .manager
            .handle_packet(from_bob, &created, now_secs())
            .await;
        let (_, confirmed) = recv(&bob.socket).await;
        bob.manager
            .handle_packet(from_alice, &confirmed, now_secs())
            .await;

        // Keepalives round-trip both ways, proving the keys agree.
        let bob_hash = bob.info.identity.hash();
        let alice_hash = alice.info.identity.hash();
        let payload = crate::session::DataPayload::default().to_bytes();
        let now = std::time::Instant::now();

        let datagrams = alice
            .peers
            .build_send(&bob_hash, 1, &payload, now_secs(), now)
            .expect("alice can send");
        let outcome = bob.peers.decode_datagram(
            &alice_hash,
            &datagrams[0].1,
            &bob.ep,
            now_secs(),
            now,
        );
        assert!(matches!(outcome, crate::session::DecodeOutcome::Packet(_)));
    }

    #[tokio::test]
    async fn flipped_signature_bit_fails_the_handshake() {
        let alice = harness().await;
        let bob = harness().await;
        let mut alice_events = alice.signals.subscribe();

        alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect("connect");
        let (from_alice, request) = recv(&bob.socket).await;
        bob.manager
            .handle_packet(from_alice, &request, now_secs())
            .await;
        let (from_bob, created) = recv(&alice.socket).await;

        // Man in the middle: re-open the created packet with the intro
        // key, flip one signature bit, re-seal it.
        let intro = SessionKey(bob.info.identity.hash().0);
        let opened = packet::decode(
            &created,
            &intro,
            &MacKey(intro.0),
            &alice.ep,
            now_secs(),
        )
        .expect("created decodes under intro key");
        let mut body = opened.body.clone();
        // Offset of the encrypted signature block: Y, the IPv4 endpoint
        // (1 + 4 + 2), relay tag, signed-on time, then the IV.
        let flip_at = DH_PUBLIC_LEN + 7 + 8 + IV_LEN + 3;
        body[flip_at] ^= 0x01;
        let tampered = packet::encode(
            PacketType::SessionCreated,
            now_secs(),
            &body,
            &intro,
            &MacKey(intro.0),
            &alice.ep,
        );

        alice
            .manager
            .handle_packet(from_bob, &tampered, now_secs())
            .await;

        let event = alice_events.recv().await.expect("failure event");
        assert!(
            matches!(event, Event::EstablishmentFailed { hash } if hash == bob.info.identity.hash())
        );
        assert_eq!(alice.peers.len(), 0);
        assert_eq!(alice.manager.state_count(), 0);
    }

    #[tokio::test]
    async fn timeout_with_matching_epoch_fails_the_state() {
        let alice = harness().await;
        let bob = harness().await;
        let mut events = alice.signals.subscribe();

        alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect("connect");
        assert_eq!(alice.manager.state_count(), 1);

        let epoch = {
            let states = alice.manager.states.lock().expect("lock");
            states.get(&bob.ep).expect("state exists").epoch
        };

        // Stale epoch is a no-op.
        alice.manager.on_timeout(bob.ep, epoch + 1).await;
        assert_eq!(alice.manager.state_count(), 1);

        alice.manager.on_timeout(bob.ep, epoch).await;
        assert_eq!(alice.manager.state_count(), 0);
        let event = events.recv().await.expect("failure event");
        assert!(matches!(event, Event::EstablishmentFailed { .. }));
    }

    #[tokio::test]
    async fn second_establishment_to_same_ip_is_rejected() {
        let alice = harness().await;
        let bob = harness().await;

        alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect("first connect");
        let err = alice
            .manager
            .connect(&bob.info, now_secs())
            .await
            .expect_err("second connect must be rejected");
        assert!(err.to_string().contains("already in progress"));
    }
}
