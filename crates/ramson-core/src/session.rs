// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Established peer sessions: fragment buffers, ACK tracking, keepalive
//! and retransmission with exponential backoff.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::crypto::{MacKey, SessionKey};
use crate::error::{PacketError, SessionError, WireError};
use crate::identity::RouterIdentity;
use crate::ids::RouterHash;
use crate::packet::{self, Packet, PacketType};
use crate::transport::Endpoint;

pub const MAX_FRAGMENT_PAYLOAD: usize = 512;
pub const MAX_FRAGMENTS: usize = 16;
pub const INBOUND_TTL: Duration = Duration::from_secs(60);
pub const MAX_INBOUND_STATES: usize = 32;
pub const RETRANSMIT_INITIAL: Duration = Duration::from_millis(500);
pub const RETRANSMIT_CAP: Duration = Duration::from_secs(16);
pub const MAX_RETRANSMIT_ATTEMPTS: u32 = 8;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const MAC_FAILURE_LIMIT: usize = 3;
pub const MAC_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// One fragment of an inter-router message as carried in a data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub msg_id: u32,
    pub frag_num: u8,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Parsed body of a [`PacketType::Data`] packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataPayload {
    /// `(msg_id, fragment bitmap)` acknowledgements.
    pub acks: Vec<(u32, u16)>,
    pub fragments: Vec<Fragment>,
}

impl DataPayload {
    pub fn is_keepalive(&self) -> bool {
        self.acks.is_empty() && self.fragments.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.acks.len() as u8);
        for (msg_id, bitmap) in &self.acks {
            out.extend_from_slice(&msg_id.to_be_bytes());
            out.extend_from_slice(&bitmap.to_be_bytes());
        }
        out.push(self.fragments.len() as u8);
        for fragment in &self.fragments {
            out.extend_from_slice(&fragment.msg_id.to_be_bytes());
            out.push((fragment.frag_num << 1) | fragment.is_last as u8);
            out.extend_from_slice(&(fragment.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&fragment.data);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let mut pos = 0usize;

        let ack_count = take(buf, &mut pos, 1)?[0] as usize;
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            let msg_id = u32::from_be_bytes(take(buf, &mut pos, 4)?.try_into().expect("4 bytes"));
            let bitmap = u16::from_be_bytes(take(buf, &mut pos, 2)?.try_into().expect("2 bytes"));
            acks.push((msg_id, bitmap));
        }

        let frag_count = take(buf, &mut pos, 1)?[0] as usize;
        let mut fragments = Vec::with_capacity(frag_count);
        for _ in 0..frag_count {
            let msg_id = u32::from_be_bytes(take(buf, &mut pos, 4)?.try_into().expect("4 bytes"));
            let info = take(buf, &mut pos, 1)?[0];
            let frag_num = info >> 1;
            if frag_num as usize >= MAX_FRAGMENTS {
                return Err(WireError::InvalidField("fragment number"));
            }
            let len =
                u16::from_be_bytes(take(buf, &mut pos, 2)?.try_into().expect("2 bytes")) as usize;
            let data = take(buf, &mut pos, len)?.to_vec();
            fragments.push(Fragment {
                msg_id,
                frag_num,
                is_last: info & 1 == 1,
                data,
            });
        }

        Ok(Self { acks, fragments })
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    if *pos + n > buf.len() {
        return Err(WireError::Truncated(*pos));
    }
    let out = &buf[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

/// Split a serialized message into at most [`MAX_FRAGMENTS`] chunks of
/// [`MAX_FRAGMENT_PAYLOAD`] bytes.
pub fn fragment_message(bytes: &[u8]) -> Result<Vec<Vec<u8>>, SessionError> {
    if bytes.is_empty() {
        return Err(SessionError::ResourceExhausted("empty message"));
    }
    if bytes.len() > MAX_FRAGMENTS * MAX_FRAGMENT_PAYLOAD {
        return Err(SessionError::ResourceExhausted("message too large"));
    }
    Ok(bytes
        .chunks(MAX_FRAGMENT_PAYLOAD)
        .map(<[u8]>::to_vec)
        .collect())
}

/// Reassembly buffer for one inbound message.
#[derive(Debug)]
pub struct InboundMessageState {
    fragments: BTreeMap<u8, Vec<u8>>,
    got_last: bool,
    last_fragment: u8,
    ack_bitmap: u16,
    byte_total: usize,
    created: Instant,
}

impl InboundMessageState {
    pub fn new(now: Instant) -> Self {
        Self {
            fragments: BTreeMap::new(),
            got_last: false,
            last_fragment: 0,
            ack_bitmap: 0,
            byte_total: 0,
            created: now,
        }
    }

    /// Insert a fragment. Fragments past a seen last fragment are
    /// dropped; duplicates keep the first copy and only refresh the ACK
    /// bitmap. Fragment data is never mutated once inserted.
    pub fn add_fragment(&mut self, frag_num: u8, data: &[u8], is_last: bool) {
        if self.got_last && frag_num > self.last_fragment {
            return;
        }
        self.ack_bitmap |= 1 << frag_num;
        if self.fragments.contains_key(&frag_num) {
            return;
        }

        self.fragments.insert(frag_num, data.to_vec());
        self.byte_total += data.len();
        if is_last {
            self.got_last = true;
            self.last_fragment = frag_num;
        }
    }

    pub fn ack_bitmap(&self) -> u16 {
        self.ack_bitmap
    }

    pub fn byte_total(&self) -> usize {
        self.byte_total
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= INBOUND_TTL
    }

    pub fn all_fragments_received(&self) -> bool {
        if !self.got_last {
            return false;
        }
        (0..=self.last_fragment).all(|f| self.fragments.contains_key(&f))
    }

    /// Concatenate fragments in ascending order. Callable only once
    /// [`Self::all_fragments_received`] holds.
    pub fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.all_fragments_received());
        let mut out = Vec::with_capacity(self.byte_total);
        for data in self.fragments.values() {
            out.extend_from_slice(data);
        }
        out
    }
}

/// Retransmission state for one outbound message.
#[derive(Debug)]
pub struct OutboundMessageState {
    pub msg_id: u32,
    fragments: Vec<Vec<u8>>,
    acked: u16,
    attempts: u32,
    backoff: Duration,
    next_retransmit: Instant,
}

impl OutboundMessageState {
    fn new(msg_id: u32, fragments: Vec<Vec<u8>>, now: Instant) -> Self {
        Self {
            msg_id,
            fragments,
            acked: 0,
            attempts: 1,
            backoff: RETRANSMIT_INITIAL,
            next_retransmit: now + RETRANSMIT_INITIAL,
        }
    }

    fn full_mask(&self) -> u16 {
        if self.fragments.len() >= 16 {
            u16::MAX
        } else {
            (1u16 << self.fragments.len()) - 1
        }
    }

    /// Merge a received ACK bitmap; the set only grows.
    pub fn apply_ack(&mut self, bitmap: u16) {
        self.acked |= bitmap & self.full_mask();
    }

    pub fn fully_acked(&self) -> bool {
        self.acked == self.full_mask()
    }

    fn unacked_fragments(&self) -> impl Iterator<Item = (u8, &Vec<u8>)> {
        self.fragments
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.acked & (1 << idx) == 0)
            .map(|(idx, data)| (idx as u8, data))
    }

    /// Advance the backoff schedule; `false` once the attempt budget is
    /// spent.
    fn schedule_retransmit(&mut self, now: Instant) -> bool {
        if self.attempts >= MAX_RETRANSMIT_ATTEMPTS {
            return false;
        }
        self.attempts += 1;
        self.backoff = (self.backoff * 2).min(RETRANSMIT_CAP);
        self.next_retransmit = now + self.backoff;
        true
    }
}

/// Everything known about one established peer.
#[derive(Debug)]
pub struct PeerState {
    pub endpoint: Endpoint,
    pub identity: RouterIdentity,
    session_key: SessionKey,
    mac_key: MacKey,
    next_keys: Option<(SessionKey, MacKey)>,
    inbound: HashMap<u32, InboundMessageState>,
    outbound: HashMap<u32, OutboundMessageState>,
    pending_acks: Vec<(u32, u16)>,
    last_recv: Instant,
    last_send: Instant,
    mac_failures: VecDeque<Instant>,
}

impl PeerState {
    pub fn new(
        endpoint: Endpoint,
        identity: RouterIdentity,
        session_key: SessionKey,
        mac_key: MacKey,
        now: Instant,
    ) -> Self {
        Self {
            endpoint,
            identity,
            session_key,
            mac_key,
            next_keys: None,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            pending_acks: Vec::new(),
            last_recv: now,
            last_send: now,
            mac_failures: VecDeque::new(),
        }
    }

    pub fn hash(&self) -> RouterHash {
        self.identity.hash()
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn mac_key(&self) -> &MacKey {
        &self.mac_key
    }

    /// Stage replacement keys; they take over when the first packet
    /// authenticates under them.
    pub fn schedule_rekey(&mut self, session_key: SessionKey, mac_key: MacKey) {
        self.next_keys = Some((session_key, mac_key));
    }

    fn record_mac_failure(&mut self, now: Instant) -> bool {
        self.mac_failures.push_back(now);
        while let Some(front) = self.mac_failures.front() {
            if now.duration_since(*front) > MAC_FAILURE_WINDOW {
                self.mac_failures.pop_front();
            } else {
                break;
            }
        }
        self.mac_failures.len() > MAC_FAILURE_LIMIT
    }

    /// Handle the fragments and ACKs of one data payload. Returns the
    /// messages completed by it.
    fn handle_data(&mut self, payload: &DataPayload, now: Instant) -> Vec<Vec<u8>> {
        for (msg_id, bitmap) in &payload.acks {
            if let Some(outbound) = self.outbound.get_mut(msg_id) {
                outbound.apply_ack(*bitmap);
                if outbound.fully_acked() {
                    trace!(msg_id, "outbound message fully acked");
                    self.outbound.remove(msg_id);
                }
            }
        }

        let mut completed = Vec::new();
        for fragment in &payload.fragments {
            if !self.inbound.contains_key(&fragment.msg_id) {
                if self.inbound.len() >= MAX_INBOUND_STATES {
                    debug!(
                        msg_id = fragment.msg_id,
                        "inbound message table full, dropping fragment"
                    );
                    continue;
                }
                self.inbound
                    .insert(fragment.msg_id, InboundMessageState::new(now));
            }
            let state = self.inbound.get_mut(&fragment.msg_id).expect("just ensured");
            state.add_fragment(fragment.frag_num, &fragment.data, fragment.is_last);
            let bitmap = state.ack_bitmap();
            match self
                .pending_acks
                .iter_mut()
                .find(|(id, _)| *id == fragment.msg_id)
            {
                Some((_, existing)) => *existing |= bitmap,
                None => self.pending_acks.push((fragment.msg_id, bitmap)),
            }

            if state.all_fragments_received() {
                let state = self.inbound.remove(&fragment.msg_id).expect("just seen");
                completed.push(state.assemble());
            }
        }
        completed
    }

    fn take_pending_acks(&mut self) -> Vec<(u32, u16)> {
        std::mem::take(&mut self.pending_acks)
    }
}

/// Outcome of decrypting a datagram for an established peer.
#[derive(Debug)]
pub enum DecodeOutcome {
    Packet(Packet),
    /// Recoverable decode failure; datagram dropped.
    Drop(PacketError),
    /// Too many MAC failures; caller must tear the session down.
    Dead,
}

/// What housekeeping wants the transport to do.
#[derive(Debug, Default)]
pub struct Housekeeping {
    pub datagrams: Vec<(Endpoint, Vec<u8>)>,
    pub dead: Vec<RouterHash>,
}

/// Table of established peers, indexed by router hash and by endpoint.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<Peers>,
}

#[derive(Default)]
struct Peers {
    by_hash: HashMap<RouterHash, PeerState>,
    by_endpoint: HashMap<Endpoint, RouterHash>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: PeerState) {
        let mut inner = self.inner.lock().expect("peer table lock");
        inner.by_endpoint.insert(state.endpoint, state.hash());
        inner.by_hash.insert(state.hash(), state);
    }

    pub fn remove(&self, hash: &RouterHash) -> Option<Endpoint> {
        let mut inner = self.inner.lock().expect("peer table lock");
        let state = inner.by_hash.remove(hash)?;
        inner.by_endpoint.remove(&state.endpoint);
        Some(state.endpoint)
    }

    pub fn hash_for(&self, endpoint: &Endpoint) -> Option<RouterHash> {
        self.inner
            .lock()
            .expect("peer table lock")
            .by_endpoint
            .get(endpoint)
            .copied()
    }

    pub fn contains(&self, hash: &RouterHash) -> bool {
        self.inner
            .lock()
            .expect("peer table lock")
            .by_hash
            .contains_key(hash)
    }

    pub fn endpoint_of(&self, hash: &RouterHash) -> Option<Endpoint> {
        self.inner
            .lock()
            .expect("peer table lock")
            .by_hash
            .get(hash)
            .map(|peer| peer.endpoint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer table lock").by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule_rekey(&self, hash: &RouterHash, session_key: SessionKey, mac_key: MacKey) {
        if let Some(peer) = self
            .inner
            .lock()
            .expect("peer table lock")
            .by_hash
            .get_mut(hash)
        {
            peer.schedule_rekey(session_key, mac_key);
        }
    }

    /// Authenticate and decrypt a datagram from `hash`, trying the
    /// staged next keys when the current ones fail and promoting them on
    /// success.
    pub fn decode_datagram(
        &self,
        hash: &RouterHash,
        datagram: &[u8],
        local: &Endpoint,
        now_secs: u32,
        now: Instant,
    ) -> DecodeOutcome {
        let mut inner = self.inner.lock().expect("peer table lock");
        let Some(peer) = inner.by_hash.get_mut(hash) else {
            return DecodeOutcome::Drop(PacketError::BadMac);
        };

        match packet::decode(datagram, &peer.session_key, &peer.mac_key, local, now_secs) {
            Ok(packet) => {
                peer.last_recv = now;
                DecodeOutcome::Packet(packet)
            }
            Err(PacketError::BadMac) => {
                if let Some((session_key, mac_key)) = peer.next_keys {
                    if let Ok(packet) =
                        packet::decode(datagram, &session_key, &mac_key, local, now_secs)
                    {
                        peer.session_key = session_key;
                        peer.mac_key = mac_key;
                        peer.next_keys = None;
                        peer.last_recv = now;
                        return DecodeOutcome::Packet(packet);
                    }
                }
                if peer.record_mac_failure(now) {
                    DecodeOutcome::Dead
                } else {
                    DecodeOutcome::Drop(PacketError::BadMac)
                }
            }
            Err(err) => DecodeOutcome::Drop(err),
        }
    }

    /// Process a data payload from `hash`; returns completed messages
    /// and an optional ACK datagram to send back.
    pub fn handle_data(
        &self,
        hash: &RouterHash,
        payload: &DataPayload,
        local_now_secs: u32,
        now: Instant,
    ) -> (Vec<Vec<u8>>, Option<(Endpoint, Vec<u8>)>) {
        let mut inner = self.inner.lock().expect("peer table lock");
        let Some(peer) = inner.by_hash.get_mut(hash) else {
            return (Vec::new(), None);
        };

        let completed = peer.handle_data(payload, now);
        let ack = if payload.fragments.is_empty() {
            None
        } else {
            let acks = peer.take_pending_acks();
            if acks.is_empty() {
                None
            } else {
                let body = DataPayload {
                    acks,
                    fragments: Vec::new(),
                }
                .to_bytes();
                peer.last_send = now;
                Some((
                    peer.endpoint,
                    packet::encode(
                        PacketType::Data,
                        local_now_secs,
                        &body,
                        &peer.session_key,
                        &peer.mac_key,
                        &peer.endpoint,
                    ),
                ))
            }
        };
        (completed, ack)
    }

    /// Fragment and enqueue an outbound message, returning the datagrams
    /// to put on the wire. Pending ACKs piggyback on the first one.
    pub fn build_send(
        &self,
        hash: &RouterHash,
        msg_id: u32,
        message: &[u8],
        now_secs: u32,
        now: Instant,
    ) -> Result<Vec<(Endpoint, Vec<u8>)>, SessionError> {
        let fragments = fragment_message(message)?;
        let mut inner = self.inner.lock().expect("peer table lock");
        let Some(peer) = inner.by_hash.get_mut(hash) else {
            return Err(SessionError::EndpointUnreachable);
        };

        let mut datagrams = Vec::with_capacity(fragments.len());
        let last = fragments.len() - 1;
        let mut acks = peer.take_pending_acks();
        for (idx, data) in fragments.iter().enumerate() {
            let body = DataPayload {
                acks: std::mem::take(&mut acks),
                fragments: vec![Fragment {
                    msg_id,
                    frag_num: idx as u8,
                    is_last: idx == last,
                    data: data.clone(),
                }],
            }
            .to_bytes();
            datagrams.push((
                peer.endpoint,
                packet::encode(
                    PacketType::Data,
                    now_secs,
                    &body,
                    &peer.session_key,
                    &peer.mac_key,
                    &peer.endpoint,
                ),
            ));
        }

        peer.outbound
            .insert(msg_id, OutboundMessageState::new(msg_id, fragments, now));
        peer.last_send = now;
        Ok(datagrams)
    }

    /// Build the explicit teardown packet for `hash`.
    pub fn build_destroy(&self, hash: &RouterHash, now_secs: u32) -> Option<(Endpoint, Vec<u8>)> {
        let inner = self.inner.lock().expect("peer table lock");
        let peer = inner.by_hash.get(hash)?;
        Some((
            peer.endpoint,
            packet::encode(
                PacketType::SessionDestroyed,
                now_secs,
                &[],
                &peer.session_key,
                &peer.mac_key,
                &peer.endpoint,
            ),
        ))
    }

    /// Periodic pass: expire reassembly buffers, retransmit unacked
    /// fragments on their backoff schedule, keepalive idle sessions,
    /// and collect dead peers.
    pub fn housekeep(&self, now: Instant, now_secs: u32) -> Housekeeping {
        let mut outcome = Housekeeping::default();
        let mut inner = self.inner.lock().expect("peer table lock");
        let mut dead = Vec::new();

        for (hash, peer) in inner.by_hash.iter_mut() {
            peer.inbound.retain(|msg_id, state| {
                let keep = !state.expired(now);
                if !keep {
                    debug!(%hash, msg_id, "inbound message timed out before assembly");
                }
                keep
            });

            if now.duration_since(peer.last_recv) > SESSION_IDLE_TIMEOUT {
                dead.push(*hash);
                continue;
            }

            let mut exhausted = false;
            let mut resend: Vec<Vec<u8>> = Vec::new();
            for outbound in peer.outbound.values_mut() {
                if outbound.next_retransmit > now {
                    continue;
                }
                if !outbound.schedule_retransmit(now) {
                    exhausted = true;
                    break;
                }
                for (frag_num, data) in outbound.unacked_fragments() {
                    let last = outbound.fragments.len() as u8 - 1;
                    resend.push(
                        DataPayload {
                            acks: Vec::new(),
                            fragments: vec![Fragment {
                                msg_id: outbound.msg_id,
                                frag_num,
                                is_last: frag_num == last,
                                data: data.clone(),
                            }],
                        }
                        .to_bytes(),
                    );
                }
            }
            if exhausted {
                debug!(%hash, "retransmission budget exhausted");
                dead.push(*hash);
                continue;
            }

            for body in resend {
                peer.last_send = now;
                outcome.datagrams.push((
                    peer.endpoint,
                    packet::encode(
                        PacketType::Data,
                        now_secs,
                        &body,
                        &peer.session_key,
                        &peer.mac_key,
                        &peer.endpoint,
                    ),
                ));
            }

            if now.duration_since(peer.last_send) >= KEEPALIVE_INTERVAL {
                peer.last_send = now;
                outcome.datagrams.push((
                    peer.endpoint,
                    packet::encode(
                        PacketType::Data,
                        now_secs,
                        &DataPayload::default().to_bytes(),
                        &peer.session_key,
                        &peer.mac_key,
                        &peer.endpoint,
                    ),
                ));
            }
        }

        for hash in dead {
            if let Some(state) = inner.by_hash.remove(&hash) {
                inner.by_endpoint.remove(&state.endpoint);
            }
            outcome.dead.push(hash);
        }
        outcome
    }
}
