// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Cross-component scenarios exercising two in-process routers over
//! real UDP sockets, plus property tests for the pure codecs.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::RouterConfig;
use crate::context::RouterContext;
use crate::crypto::{DsaPrivateKey, ElGamalPrivateKey, MacKey, SessionKey};
use crate::database::{Database, MemoryDatabase};
use crate::i2np::{DatabaseStore, Message, Payload, StoreKind};
use crate::identity::{Certificate, RouterIdentity};
use crate::ids::RouterHash;
use crate::packet::{self, PacketType};
use crate::router_info::{Mapping, RouterAddress, RouterInfo};
use crate::session::{fragment_message, InboundMessageState};
use crate::signals::Event;
use crate::transport::Endpoint;

struct TestRouter {
    ctx: RouterContext,
    events: mpsc::Receiver<Event>,
    data_dir: std::path::PathBuf,
}

impl TestRouter {
    async fn spawn() -> TestRouter {
        let data_dir =
            std::env::temp_dir().join(format!("ramson-conformance-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&data_dir).expect("data dir");
        let config = RouterConfig {
            bind: "127.0.0.1:0".parse().expect("valid socket"),
            data_dir: data_dir.clone(),
            generate_keys: true,
        };
        let mut ctx = RouterContext::with_database(config, Arc::new(MemoryDatabase::new()))
            .await
            .expect("open router");
        ctx.start().await.expect("start router");
        let events = ctx.subscribe();
        TestRouter {
            ctx,
            events,
            data_dir,
        }
    }

    async fn expect_event<F: Fn(&Event) -> bool>(&mut self, deadline: Duration, want: F) -> Event {
        timeout(deadline, async {
            loop {
                let event = self.events.recv().await.expect("event stream open");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event before deadline")
    }

    async fn teardown(mut self) {
        self.ctx.shutdown().await;
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

/// A standalone signed identity for routers that only exist on paper.
fn synthetic_router(endpoint: Endpoint) -> (RouterInfo, Vec<u8>) {
    let dsa = DsaPrivateKey::generate();
    let identity = RouterIdentity::new(
        ElGamalPrivateKey::generate().public_bytes(),
        dsa.public_bytes(),
        Certificate::null(),
    )
    .expect("identity");
    let intro = SessionKey(identity.hash().0);
    let info = RouterInfo::new_signed(
        identity,
        1,
        vec![RouterAddress::ssu(&endpoint, &intro)],
        Mapping::new(),
        &dsa,
    )
    .expect("signed info");
    let bytes = info.to_bytes().expect("encode");
    (info, bytes)
}

#[tokio::test]
async fn two_routers_establish_within_deadline() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();
    let alice_hash = alice.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");

    let deadline = Duration::from_secs(2);
    let event = alice
        .expect_event(deadline, |e| matches!(e, Event::Established { .. }))
        .await;
    assert!(matches!(
        event,
        Event::Established { hash, inbound: false } if hash == bob_hash
    ));
    let event = bob
        .expect_event(deadline, |e| matches!(e, Event::Established { .. }))
        .await;
    assert!(matches!(
        event,
        Event::Established { hash, inbound: true } if hash == alice_hash
    ));

    // Exactly one peer on each side; handshake tables drained.
    let alice_transport = alice.ctx.transport().expect("transport");
    let bob_transport = bob.ctx.transport().expect("transport");
    assert_eq!(alice_transport.peers().len(), 1);
    assert_eq!(bob_transport.peers().len(), 1);
    assert_eq!(alice_transport.establisher().state_count(), 0);
    assert_eq!(bob_transport.establisher().state_count(), 0);

    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_endpoint_times_out_with_failure() {
    let mut alice = TestRouter::spawn().await;

    // A port that was just released: everything sent there is lost.
    let dead = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind probe");
    let dead_ep = Endpoint::from(dead.local_addr().expect("addr"));
    drop(dead);

    let (info, _) = synthetic_router(dead_ep);
    let ghost_hash = info.identity.hash();
    alice.ctx.connect(info).await.expect("connect");

    let event = alice
        .expect_event(Duration::from_secs(15), |e| {
            matches!(e, Event::EstablishmentFailed { .. })
        })
        .await;
    assert!(matches!(
        event,
        Event::EstablishmentFailed { hash } if hash == ghost_hash
    ));
    assert_eq!(
        alice
            .ctx
            .transport()
            .expect("transport")
            .establisher()
            .state_count(),
        0
    );
    assert_eq!(alice.ctx.transport().expect("transport").peers().len(), 0);

    alice.teardown().await;
}

#[tokio::test]
async fn fragmented_message_crosses_the_wire() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");
    alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::Established { .. })
        })
        .await;

    // Four fragments worth of payload.
    let body: Vec<u8> = (0..1800u32).map(|i| i as u8).collect();
    alice
        .ctx
        .send_message(bob_hash, Payload::Data(body.clone()))
        .await
        .expect("send");

    let event = bob
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::LocalData { .. })
        })
        .await;
    match event {
        Event::LocalData { from, data } => {
            assert_eq!(from, alice.ctx.hash());
            assert_eq!(data, body);
        }
        other => panic!("unexpected event {other:?}"),
    }

    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test]
async fn store_with_reply_token_is_acknowledged() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");
    alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::Established { .. })
        })
        .await;

    let (info, bytes) = synthetic_router(Endpoint {
        ip: "127.0.0.1".parse().expect("ip"),
        port: 1,
    });
    let key = {
        let kademlia = bob.ctx.kademlia().lock().expect("kademlia");
        kademlia.key_for(&info.identity.hash())
    };
    alice
        .ctx
        .send_message(
            bob_hash,
            Payload::DatabaseStore(DatabaseStore {
                key: key.0,
                kind: StoreKind::RouterInfo,
                reply_token: 77,
                data: bytes.clone(),
            }),
        )
        .await
        .expect("send store");

    // Bob acknowledges with a delivery status citing the token.
    let event = alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::DeliveryStatus { .. })
        })
        .await;
    assert!(matches!(event, Event::DeliveryStatus { msg_id: 77, .. }));

    // And the synthetic router is now in bob's database and table.
    let stored = bob
        .ctx
        .database()
        .get_router_info(&info.identity.hash())
        .await
        .expect("db read");
    assert_eq!(stored, Some(bytes));
    assert_eq!(
        bob.ctx
            .kademlia()
            .lock()
            .expect("kademlia")
            .get(&key),
        Some(info.identity.hash())
    );

    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test]
async fn search_succeeds_when_the_store_arrives() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");
    alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::Established { .. })
        })
        .await;

    // Bob knows a third router; alice searches for it.
    let (info, bytes) = synthetic_router(Endpoint {
        ip: "127.0.0.1".parse().expect("ip"),
        port: 1,
    });
    let target = info.identity.hash();
    bob.ctx
        .database()
        .set_router_info(&target, &bytes)
        .await
        .expect("seed db");
    let key = {
        let mut kademlia = bob.ctx.kademlia().lock().expect("kademlia");
        kademlia.insert(target);
        kademlia.key_for(&target)
    };

    alice
        .ctx
        .create_search(key, bob_hash)
        .await
        .expect("create search");

    let event = alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::SearchSucceeded { .. })
        })
        .await;
    match event {
        Event::SearchSucceeded { key: got, value } => {
            assert_eq!(got, key);
            assert_eq!(value, bytes);
        }
        other => panic!("unexpected event {other:?}"),
    }

    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test]
async fn search_for_unknown_key_fails_after_convergence() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");
    alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::Established { .. })
        })
        .await;

    let key = crate::ids::KademliaKey([0xA5u8; 32]);
    alice
        .ctx
        .create_search(key, bob_hash)
        .await
        .expect("create search");

    let event = alice
        .expect_event(Duration::from_secs(5), |e| {
            matches!(e, Event::SearchFailed { .. })
        })
        .await;
    assert!(matches!(event, Event::SearchFailed { key: k } if k == key));

    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test]
async fn disconnect_notifies_the_peer() {
    let mut alice = TestRouter::spawn().await;
    let mut bob = TestRouter::spawn().await;
    let bob_hash = bob.ctx.hash();
    let alice_hash = alice.ctx.hash();

    alice
        .ctx
        .connect(bob.ctx.router_info().expect("bob info"))
        .await
        .expect("connect");
    alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::Established { .. })
        })
        .await;
    bob.expect_event(Duration::from_secs(2), |e| {
        matches!(e, Event::Established { .. })
    })
    .await;

    alice.ctx.disconnect(bob_hash).await.expect("disconnect");

    let event = alice
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::PeerDisconnected { .. })
        })
        .await;
    assert!(matches!(event, Event::PeerDisconnected { hash } if hash == bob_hash));
    let event = bob
        .expect_event(Duration::from_secs(2), |e| {
            matches!(e, Event::PeerDisconnected { .. })
        })
        .await;
    assert!(matches!(event, Event::PeerDisconnected { hash } if hash == alice_hash));

    alice.teardown().await;
    bob.teardown().await;
}

proptest! {
    /// Encrypt-then-decrypt over matching keys returns the plaintext
    /// (modulo CBC zero padding, which parsers are length-aware about).
    #[test]
    fn packet_codec_roundtrip(body in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let session_key = SessionKey([0x42u8; 32]);
        let mac_key = MacKey([0x24u8; 32]);
        let endpoint = Endpoint {
            ip: "127.0.0.1".parse().expect("ip"),
            port: 9630,
        };
        let datagram = packet::encode(
            PacketType::Data,
            5000,
            &body,
            &session_key,
            &mac_key,
            &endpoint,
        );
        let decoded =
            packet::decode(&datagram, &session_key, &mac_key, &endpoint, 5000).expect("decode");
        prop_assert_eq!(decoded.kind, PacketType::Data);
        prop_assert_eq!(decoded.timestamp, 5000);
        prop_assert_eq!(&decoded.body[..body.len()], &body[..]);
        prop_assert!(decoded.body[body.len()..].iter().all(|b| *b == 0));
    }

    /// Fragment then reassemble in reverse arrival order equals the
    /// original bytes.
    #[test]
    fn fragmentation_roundtrip(message in proptest::collection::vec(any::<u8>(), 1..8192)) {
        let fragments = fragment_message(&message).expect("fragment");
        let mut state = InboundMessageState::new(std::time::Instant::now());
        let last = fragments.len() - 1;
        for (idx, data) in fragments.iter().enumerate().rev() {
            state.add_fragment(idx as u8, data, idx == last);
        }
        prop_assert!(state.all_fragments_received());
        prop_assert_eq!(state.assemble(), message);
    }

    /// Serialize-then-parse preserves message structure.
    #[test]
    fn i2np_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048), msg_id in any::<u32>()) {
        let msg = Message {
            msg_id,
            expiration_ms: 1_000_000,
            payload: Payload::Data(data),
        };
        let bytes = msg.to_bytes().expect("encode");
        let parsed = Message::from_bytes(&bytes, 0).expect("decode");
        prop_assert_eq!(parsed, msg);
    }
}

#[test]
fn synthetic_router_info_verifies() {
    let (info, bytes) = synthetic_router(Endpoint {
        ip: "10.0.0.1".parse().expect("ip"),
        port: 9630,
    });
    let parsed = RouterInfo::from_bytes(&bytes).expect("parse");
    assert_eq!(parsed.identity.hash(), info.identity.hash());
    parsed.verify().expect("verifies");
}

#[test]
fn placeholder_hash_is_reserved() {
    assert!(RouterHash::placeholder().is_placeholder());
    assert!(!RouterHash([1u8; 32]).is_placeholder());
}
