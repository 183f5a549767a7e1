// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Iterative Kademlia lookups over the peer mesh.
//!
//! One [`SearchState`] per goal key, looked up by goal and by the
//! `current`/`next` router hashes (the triple index of the state
//! container). At most [`ALPHA`] lookups are outstanding per search;
//! replies feed new candidates, connection events resume or advance
//! stalled searches, and a 10 s timer bounds each one. Exactly one of
//! the success or failure signals fires per search.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ids::{KademliaKey, RouterHash};
use crate::kademlia::{Kademlia, ALPHA, K};
use crate::signals::{Event, Signals};
use crate::transport::Command;

pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_SEARCHES: usize = 256;

#[derive(Debug)]
struct SearchState {
    goal: KademliaKey,
    current: RouterHash,
    next: RouterHash,
    tried: HashSet<RouterHash>,
    outstanding: HashSet<RouterHash>,
    /// Lookups that failed since the last reply made progress.
    failed_lookups: usize,
    epoch: u64,
    started: Instant,
}

/// Authoritative map by goal plus the two secondary hash indices.
#[derive(Default)]
struct SearchTable {
    by_goal: HashMap<KademliaKey, SearchState>,
    by_current: HashMap<RouterHash, Vec<KademliaKey>>,
    by_next: HashMap<RouterHash, Vec<KademliaKey>>,
}

impl SearchTable {
    fn index(map: &mut HashMap<RouterHash, Vec<KademliaKey>>, hash: RouterHash, goal: KademliaKey) {
        map.entry(hash).or_default().push(goal);
    }

    fn unindex(
        map: &mut HashMap<RouterHash, Vec<KademliaKey>>,
        hash: &RouterHash,
        goal: &KademliaKey,
    ) {
        if let Some(goals) = map.get_mut(hash) {
            goals.retain(|g| g != goal);
            if goals.is_empty() {
                map.remove(hash);
            }
        }
    }

    fn insert(&mut self, state: SearchState) {
        Self::index(&mut self.by_current, state.current, state.goal);
        Self::index(&mut self.by_next, state.next, state.goal);
        self.by_goal.insert(state.goal, state);
    }

    fn remove(&mut self, goal: &KademliaKey) -> Option<SearchState> {
        let state = self.by_goal.remove(goal)?;
        Self::unindex(&mut self.by_current, &state.current, goal);
        Self::unindex(&mut self.by_next, &state.next, goal);
        Some(state)
    }

    fn set_current(&mut self, goal: &KademliaKey, hash: RouterHash) {
        if let Some(state) = self.by_goal.get_mut(goal) {
            let old = state.current;
            if old == hash {
                return;
            }
            state.current = hash;
            Self::unindex(&mut self.by_current, &old, goal);
            Self::index(&mut self.by_current, hash, *goal);
        }
    }

    fn set_next(&mut self, goal: &KademliaKey, hash: RouterHash) {
        if let Some(state) = self.by_goal.get_mut(goal) {
            let old = state.next;
            if old == hash {
                return;
            }
            state.next = hash;
            Self::unindex(&mut self.by_next, &old, goal);
            Self::index(&mut self.by_next, hash, *goal);
        }
    }

    fn goals_for(&self, hash: &RouterHash) -> Vec<KademliaKey> {
        let mut goals: Vec<KademliaKey> = Vec::new();
        for map in [&self.by_current, &self.by_next] {
            if let Some(found) = map.get(hash) {
                for goal in found {
                    if !goals.contains(goal) {
                        goals.push(*goal);
                    }
                }
            }
        }
        // Lookups in flight beyond the two indexed hashes still count;
        // the live-search cap keeps this scan cheap.
        for (goal, state) in &self.by_goal {
            if state.outstanding.contains(hash) && !goals.contains(goal) {
                goals.push(*goal);
            }
        }
        goals
    }
}

enum Advance {
    /// Issue lookups to these routers.
    Query(Vec<RouterHash>),
    /// Search still has lookups in flight; nothing new to do.
    Wait,
    /// No candidates left: the search failed by convergence.
    Converged,
}

pub struct SearchManager {
    table: Mutex<SearchTable>,
    kademlia: Arc<Mutex<Kademlia>>,
    signals: Arc<Signals>,
    cmd_tx: mpsc::Sender<Command>,
    local_hash: RouterHash,
}

impl SearchManager {
    pub fn new(
        kademlia: Arc<Mutex<Kademlia>>,
        signals: Arc<Signals>,
        cmd_tx: mpsc::Sender<Command>,
        local_hash: RouterHash,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(SearchTable::default()),
            kademlia,
            signals,
            cmd_tx,
            local_hash,
        })
    }

    pub fn search_count(&self) -> usize {
        self.table.lock().expect("search table lock").by_goal.len()
    }

    /// Begin an iterative lookup for `goal` starting at `start`.
    pub async fn create_search(
        self: &Arc<Self>,
        goal: KademliaKey,
        start: RouterHash,
    ) -> anyhow::Result<()> {
        let epoch;
        {
            let mut table = self.table.lock().expect("search table lock");
            if table.by_goal.contains_key(&goal) {
                anyhow::bail!("search for {goal} already running");
            }
            if table.by_goal.len() >= MAX_SEARCHES {
                anyhow::bail!("search table full ({MAX_SEARCHES} live searches)");
            }

            let state = SearchState {
                goal,
                current: start,
                next: start,
                tried: HashSet::new(),
                outstanding: HashSet::from([start]),
                failed_lookups: 0,
                epoch: 1,
                started: Instant::now(),
            };
            epoch = state.epoch;
            table.insert(state);
        }
        debug!(%goal, %start, "search created");

        self.arm_timer(goal, epoch);
        let _ = self.cmd_tx.try_send(Command::SendLookup(start, goal));
        Ok(())
    }

    /// A search reply from `from` answering the lookup for `query`.
    pub async fn search_reply(self: &Arc<Self>, from: RouterHash, query: KademliaKey, hashes: &[RouterHash]) {
        // Learned hashes enrich the routing table regardless of the
        // search outcome.
        {
            let mut kademlia = self.kademlia.lock().expect("kademlia lock");
            for hash in hashes {
                if *hash != self.local_hash {
                    kademlia.insert(*hash);
                }
            }
        }

        let (candidates, date) = self.candidates_for(&query, hashes);
        let advance = {
            let mut table = self.table.lock().expect("search table lock");
            let Some(state) = table.by_goal.get_mut(&query) else {
                debug!(%from, %query, "reply for unknown search, dropping");
                return;
            };
            state.tried.insert(from);
            state.outstanding.remove(&from);
            state.failed_lookups = 0;
            Self::advance_locked(&mut table, &query, &candidates, date)
        };

        match advance {
            Advance::Query(targets) => {
                let epoch = self.bump_epoch(&query);
                if let Some(epoch) = epoch {
                    self.arm_timer(query, epoch);
                }
                for target in targets {
                    let _ = self.cmd_tx.try_send(Command::SendLookup(target, query));
                }
            }
            Advance::Wait => {}
            Advance::Converged => self.finish_failure(&query),
        }
    }

    /// A store for `key` arrived; if a search wants it, that search
    /// succeeded.
    pub async fn database_store(&self, from: RouterHash, key: KademliaKey, value: &[u8]) {
        let found = {
            let mut table = self.table.lock().expect("search table lock");
            table.remove(&key).is_some()
        };
        if found {
            debug!(%from, %key, "search satisfied by database store");
            self.signals.emit(Event::SearchSucceeded {
                key,
                value: value.to_vec(),
            });
        }
    }

    /// A session to `rh` came up: resume searches waiting on it.
    pub async fn connected(self: &Arc<Self>, rh: RouterHash) {
        let goals = {
            let table = self.table.lock().expect("search table lock");
            table.goals_for(&rh)
        };
        for goal in goals {
            let _ = self.cmd_tx.try_send(Command::SendLookup(rh, goal));
        }
    }

    /// A session to `rh` failed: count the failure and advance searches
    /// past it. A search whose last [`ALPHA`] lookups all failed without
    /// a reply in between is declared dead on the spot.
    pub async fn connection_failure(self: &Arc<Self>, rh: RouterHash) {
        let goals = {
            let table = self.table.lock().expect("search table lock");
            table.goals_for(&rh)
        };

        for goal in goals {
            let (candidates, date) = self.candidates_for(&goal, &[]);
            let advance = {
                let mut table = self.table.lock().expect("search table lock");
                let Some(state) = table.by_goal.get_mut(&goal) else {
                    continue;
                };
                state.tried.insert(rh);
                if state.outstanding.remove(&rh) {
                    state.failed_lookups += 1;
                }
                if state.failed_lookups >= ALPHA {
                    debug!(%goal, "every outstanding lookup failed");
                    drop(table);
                    self.finish_failure(&goal);
                    continue;
                }
                Self::advance_locked(&mut table, &goal, &candidates, date)
            };
            match advance {
                Advance::Query(targets) => {
                    for target in targets {
                        let _ = self.cmd_tx.try_send(Command::SendLookup(target, goal));
                    }
                }
                Advance::Wait => {}
                Advance::Converged => self.finish_failure(&goal),
            }
        }
    }

    /// Deadline expiry; stale epochs are no-ops (the timer raced a
    /// reset).
    pub async fn timeout(&self, goal: KademliaKey, epoch: u64) {
        let live = {
            let table = self.table.lock().expect("search table lock");
            table.by_goal.get(&goal).map(|state| state.epoch) == Some(epoch)
        };
        if live {
            debug!(%goal, "search timed out");
            self.finish_failure(&goal);
        }
    }

    /// Candidate routers for `goal`, closest first: the union of
    /// `extra` and the local buckets, keyed under today's date.
    fn candidates_for(
        &self,
        goal: &KademliaKey,
        extra: &[RouterHash],
    ) -> (Vec<RouterHash>, NaiveDate) {
        let (mut hashes, date) = {
            let kademlia = self.kademlia.lock().expect("kademlia lock");
            (kademlia.closest_n(goal, K), kademlia.date())
        };
        for hash in extra {
            if !hashes.contains(hash) {
                hashes.push(*hash);
            }
        }
        hashes.retain(|hash| *hash != self.local_hash);
        hashes.sort_by(|a, b| {
            KademliaKey::for_router(a, date).distance_cmp(goal, &KademliaKey::for_router(b, date))
        });
        (hashes, date)
    }

    /// Pick up to `ALPHA - outstanding` untried candidates and update
    /// the current/next indices.
    ///
    /// Besides running out of candidates entirely, a search has also
    /// converged when its closest unqueried candidate sits farther from
    /// the goal than every hash already tried; no remaining lookup can
    /// make progress then.
    fn advance_locked(
        table: &mut SearchTable,
        goal: &KademliaKey,
        candidates: &[RouterHash],
        date: NaiveDate,
    ) -> Advance {
        let selected: Vec<RouterHash> = {
            let state = table.by_goal.get_mut(goal).expect("caller checked");
            let untried: Vec<RouterHash> = candidates
                .iter()
                .filter(|hash| !state.tried.contains(hash) && !state.outstanding.contains(hash))
                .copied()
                .collect();

            // `candidates` is sorted closest-first, so the head is the
            // closest unqueried hash.
            let Some(closest) = untried.first() else {
                return if state.outstanding.is_empty() {
                    Advance::Converged
                } else {
                    Advance::Wait
                };
            };
            let farthest_tried = state
                .tried
                .iter()
                .map(|hash| distance(hash, goal, date))
                .max();
            if let Some(farthest_tried) = farthest_tried {
                if distance(closest, goal, date) > farthest_tried {
                    return if state.outstanding.is_empty() {
                        Advance::Converged
                    } else {
                        Advance::Wait
                    };
                }
            }

            let budget = ALPHA.saturating_sub(state.outstanding.len());
            let picks: Vec<RouterHash> = untried.into_iter().take(budget).collect();
            if picks.is_empty() {
                return Advance::Wait;
            }
            for pick in &picks {
                state.outstanding.insert(*pick);
            }
            picks
        };

        table.set_current(goal, selected[0]);
        // `next` tracks the closest hash still in flight.
        let closest_outstanding = {
            let state = table.by_goal.get(goal).expect("caller checked");
            candidates
                .iter()
                .find(|hash| state.outstanding.contains(hash))
                .copied()
        };
        if let Some(next) = closest_outstanding {
            table.set_next(goal, next);
        }
        Advance::Query(selected)
    }

    fn bump_epoch(&self, goal: &KademliaKey) -> Option<u64> {
        let mut table = self.table.lock().expect("search table lock");
        let state = table.by_goal.get_mut(goal)?;
        state.epoch += 1;
        state.started = Instant::now();
        Some(state.epoch)
    }

    fn finish_failure(&self, goal: &KademliaKey) {
        let removed = {
            let mut table = self.table.lock().expect("search table lock");
            table.remove(goal)
        };
        if let Some(state) = removed {
            warn!(
                goal = %state.goal,
                tried = state.tried.len(),
                elapsed_ms = state.started.elapsed().as_millis() as u64,
                "search failed"
            );
            self.signals.emit(Event::SearchFailed { key: state.goal });
        }
    }

    fn arm_timer(self: &Arc<Self>, goal: KademliaKey, epoch: u64) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(SEARCH_TIMEOUT).await;
            if let Some(manager) = manager.upgrade() {
                manager.timeout(goal, epoch).await;
            }
        });
    }
}

fn distance(hash: &RouterHash, goal: &KademliaKey, date: NaiveDate) -> [u8; 32] {
    KademliaKey::for_router(hash, date).xor_distance(goal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct Fixture {
        search: Arc<SearchManager>,
        kademlia: Arc<Mutex<Kademlia>>,
        signals: Arc<Signals>,
        cmd_rx: mpsc::Receiver<Command>,
    }

    fn hash(byte: u8) -> RouterHash {
        RouterHash([byte; 32])
    }

    fn fixture(seeded: u8) -> Fixture {
        let local = hash(0);
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).expect("valid date");
        let mut table = Kademlia::new(local, date);
        for byte in 1..=seeded {
            table.insert(hash(byte));
        }
        let kademlia = Arc::new(Mutex::new(table));
        let signals = Arc::new(Signals::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let search = SearchManager::new(
            Arc::clone(&kademlia),
            Arc::clone(&signals),
            cmd_tx,
            local,
        );
        Fixture {
            search,
            kademlia,
            signals,
            cmd_rx,
        }
    }

    fn drain_lookups(rx: &mut mpsc::Receiver<Command>) -> Vec<(RouterHash, KademliaKey)> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let Command::SendLookup(to, goal) = cmd {
                out.push((to, goal));
            }
        }
        out
    }

    /// Order `hashes` by key distance to `goal` under the fixture's
    /// table date, closest first.
    fn sorted_by_distance(
        fx: &Fixture,
        goal: &KademliaKey,
        hashes: &[RouterHash],
    ) -> Vec<RouterHash> {
        let date = fx.kademlia.lock().expect("kademlia lock").date();
        let mut out = hashes.to_vec();
        out.sort_by(|a, b| {
            KademliaKey::for_router(a, date).distance_cmp(goal, &KademliaKey::for_router(b, date))
        });
        out
    }

    #[tokio::test]
    async fn search_is_unique_per_goal() {
        let fx = fixture(10);
        let goal = KademliaKey([9u8; 32]);
        fx.search
            .create_search(goal, hash(1))
            .await
            .expect("first search");
        let err = fx
            .search
            .create_search(goal, hash(2))
            .await
            .expect_err("duplicate goal must be rejected");
        assert!(err.to_string().contains("already running"));
        assert_eq!(fx.search.search_count(), 1);
        drop(fx.cmd_rx);
    }

    #[tokio::test]
    async fn replies_fan_out_at_most_alpha_lookups() {
        let mut fx = fixture(50);
        let goal = KademliaKey([0xEEu8; 32]);
        // Start at the farthest seeded router so closer candidates
        // always remain and the search cannot converge on reply one.
        let seeded: Vec<RouterHash> = (1..=50u8).map(hash).collect();
        let start = *sorted_by_distance(&fx, &goal, &seeded)
            .last()
            .expect("seeded table");
        fx.search.create_search(goal, start).await.expect("search");

        let initial = drain_lookups(&mut fx.cmd_rx);
        assert_eq!(initial, vec![(start, goal)]);

        // First reply: start answered with three fresh hashes.
        fx.search
            .search_reply(start, goal, &[hash(60), hash(61), hash(62)])
            .await;
        let wave = drain_lookups(&mut fx.cmd_rx);
        assert!(!wave.is_empty());
        assert!(wave.len() <= ALPHA);

        // The state never tracks more than alpha outstanding lookups.
        {
            let table = fx.search.table.lock().expect("lock");
            let state = table.by_goal.get(&goal).expect("live search");
            assert!(state.outstanding.len() <= ALPHA);
            assert!(state.tried.contains(&start));
        }
    }

    #[tokio::test]
    async fn store_arrival_succeeds_and_cancels_the_search() {
        let fx = fixture(10);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([5u8; 32]);
        fx.search
            .create_search(goal, hash(1))
            .await
            .expect("search");

        fx.search
            .database_store(hash(1), goal, b"router info bytes")
            .await;
        assert_eq!(fx.search.search_count(), 0);

        let event = events.recv().await.expect("event");
        match event {
            Event::SearchSucceeded { key, value } => {
                assert_eq!(key, goal);
                assert_eq!(value, b"router info bytes");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // A second store for the same key is silent: one signal per search.
        fx.search
            .database_store(hash(1), goal, b"router info bytes")
            .await;
        assert!(events.try_recv().is_err());
        drop(fx.cmd_rx);
    }

    #[tokio::test]
    async fn exhausted_candidates_fail_by_convergence() {
        let fx = fixture(0);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([5u8; 32]);
        let start = hash(1);
        fx.search.create_search(goal, start).await.expect("search");

        // The only candidate replies with nothing and the table is empty.
        fx.search.search_reply(start, goal, &[]).await;

        let event = events.recv().await.expect("event");
        assert!(matches!(event, Event::SearchFailed { key } if key == goal));
        assert_eq!(fx.search.search_count(), 0);
        drop(fx.cmd_rx);
    }

    #[tokio::test]
    async fn connection_failure_advances_past_dead_routers() {
        let mut fx = fixture(0);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([5u8; 32]);
        let pair = sorted_by_distance(&fx, &goal, &[hash(1), hash(2)]);
        let (closer, farther) = (pair[0], pair[1]);
        fx.kademlia.lock().expect("kademlia lock").insert(closer);

        fx.search.create_search(goal, farther).await.expect("search");
        drain_lookups(&mut fx.cmd_rx);

        // The dead starting router is replaced by the closer candidate.
        fx.search.connection_failure(farther).await;
        let wave = drain_lookups(&mut fx.cmd_rx);
        assert_eq!(wave, vec![(closer, goal)]);

        // That one dies too; nothing is left, the search fails.
        fx.search.connection_failure(closer).await;
        let event = events.recv().await.expect("event");
        assert!(matches!(event, Event::SearchFailed { key } if key == goal));
    }

    #[tokio::test]
    async fn converges_when_best_candidate_is_farther_than_tried() {
        let fx = fixture(0);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([0x77u8; 32]);
        let pool: Vec<RouterHash> = (1..=6u8).map(hash).collect();
        let ordered = sorted_by_distance(&fx, &goal, &pool);
        let closest = ordered[0];

        fx.search.create_search(goal, closest).await.expect("search");
        // The only tried hash is the closest there is; every candidate
        // in the reply sits farther out, so no lookup can improve on it.
        fx.search.search_reply(closest, goal, &ordered[1..]).await;

        let event = events.recv().await.expect("event");
        assert!(matches!(event, Event::SearchFailed { key } if key == goal));
        assert_eq!(fx.search.search_count(), 0);
        drop(fx.cmd_rx);
    }

    #[tokio::test]
    async fn alpha_failed_lookups_kill_the_search() {
        let mut fx = fixture(0);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([0x55u8; 32]);
        let pool: Vec<RouterHash> = (1..=6u8).map(hash).collect();
        for entry in &pool {
            fx.kademlia.lock().expect("kademlia lock").insert(*entry);
        }
        let start = *sorted_by_distance(&fx, &goal, &pool)
            .last()
            .expect("pool");

        fx.search.create_search(goal, start).await.expect("search");
        drain_lookups(&mut fx.cmd_rx);
        fx.search.search_reply(start, goal, &[]).await;
        let wave = drain_lookups(&mut fx.cmd_rx);
        assert_eq!(wave.len(), ALPHA);

        // Unqueried candidates remain, but once every lookup of the
        // alpha wave has failed the search is dead.
        for (target, _) in &wave {
            fx.search.connection_failure(*target).await;
        }
        let event = events.recv().await.expect("event");
        assert!(matches!(event, Event::SearchFailed { key } if key == goal));
        assert_eq!(fx.search.search_count(), 0);
    }

    #[tokio::test]
    async fn connected_reissues_the_pending_lookup() {
        let mut fx = fixture(5);
        let goal = KademliaKey([7u8; 32]);
        let start = hash(1);
        fx.search.create_search(goal, start).await.expect("search");
        drain_lookups(&mut fx.cmd_rx);

        fx.search.connected(start).await;
        let wave = drain_lookups(&mut fx.cmd_rx);
        assert_eq!(wave, vec![(start, goal)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_with_stale_epoch_is_a_noop() {
        let mut fx = fixture(10);
        let mut events = fx.signals.subscribe();
        let goal = KademliaKey([7u8; 32]);
        let seeded: Vec<RouterHash> = (1..=10u8).map(hash).collect();
        let start = *sorted_by_distance(&fx, &goal, &seeded)
            .last()
            .expect("seeded table");
        fx.search.create_search(goal, start).await.expect("search");

        // Reply resets the timer; the original timer must not fire the
        // failure.
        fx.search.search_reply(start, goal, &[hash(42)]).await;
        drain_lookups(&mut fx.cmd_rx);

        tokio::time::advance(SEARCH_TIMEOUT + Duration::from_millis(100)).await;
        // Let the timer tasks run.
        tokio::task::yield_now().await;

        // Exactly one failure: from the reset timer, not two.
        let event = events.recv().await.expect("event");
        assert!(matches!(event, Event::SearchFailed { key } if key == goal));
        assert!(events.try_recv().is_err());
        assert_eq!(fx.search.search_count(), 0);
    }

    #[tokio::test]
    async fn search_cap_is_enforced() {
        let fx = fixture(1);
        for idx in 0..MAX_SEARCHES {
            let mut key = [0u8; 32];
            key[..8].copy_from_slice(&(idx as u64).to_be_bytes());
            fx.search
                .create_search(KademliaKey(key), hash(1))
                .await
                .expect("search under cap");
        }
        let err = fx
            .search
            .create_search(KademliaKey([0xFFu8; 32]), hash(1))
            .await
            .expect_err("cap exceeded");
        assert!(err.to_string().contains("full"));
        drop(fx.cmd_rx);
    }
}
