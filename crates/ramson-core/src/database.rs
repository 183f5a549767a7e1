// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The router's key-value store: configuration values (including the two
//! PEM private keys), serialized router infos, and per-peer profiles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::ids::RouterHash;

pub const CONFIG_PRIVATE_ENCRYPTION_KEY: &str = "private_encryption_key";
pub const CONFIG_PRIVATE_SIGNING_KEY: &str = "private_signing_key";

/// Long-lived reputation record for a remote router, stored as CBOR.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProfile {
    pub last_seen_unix: u64,
    pub sessions_established: u32,
    pub failed_attempts: u32,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn get_config_value(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set_config_value(&self, name: &str, value: &[u8]) -> anyhow::Result<()>;
    async fn get_router_info(&self, hash: &RouterHash) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set_router_info(&self, hash: &RouterHash, data: &[u8]) -> anyhow::Result<()>;
    async fn get_all_hashes(&self) -> anyhow::Result<Vec<RouterHash>>;
    async fn get_profile(&self, hash: &RouterHash) -> anyhow::Result<Option<PeerProfile>>;
    async fn set_profile(&self, hash: &RouterHash, profile: &PeerProfile) -> anyhow::Result<()>;
}

/// In-memory store for tests and throwaway routers.
#[derive(Default)]
pub struct MemoryDatabase {
    config: Mutex<HashMap<String, Vec<u8>>>,
    router_infos: Mutex<HashMap<RouterHash, Vec<u8>>>,
    profiles: Mutex<HashMap<RouterHash, PeerProfile>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_config_value(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.config.lock().expect("config lock").get(name).cloned())
    }

    async fn set_config_value(&self, name: &str, value: &[u8]) -> anyhow::Result<()> {
        self.config
            .lock()
            .expect("config lock")
            .insert(name.to_owned(), value.to_vec());
        Ok(())
    }

    async fn get_router_info(&self, hash: &RouterHash) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .router_infos
            .lock()
            .expect("router info lock")
            .get(hash)
            .cloned())
    }

    async fn set_router_info(&self, hash: &RouterHash, data: &[u8]) -> anyhow::Result<()> {
        self.router_infos
            .lock()
            .expect("router info lock")
            .insert(*hash, data.to_vec());
        Ok(())
    }

    async fn get_all_hashes(&self) -> anyhow::Result<Vec<RouterHash>> {
        Ok(self
            .router_infos
            .lock()
            .expect("router info lock")
            .keys()
            .copied()
            .collect())
    }

    async fn get_profile(&self, hash: &RouterHash) -> anyhow::Result<Option<PeerProfile>> {
        Ok(self
            .profiles
            .lock()
            .expect("profiles lock")
            .get(hash)
            .cloned())
    }

    async fn set_profile(&self, hash: &RouterHash, profile: &PeerProfile) -> anyhow::Result<()> {
        self.profiles
            .lock()
            .expect("profiles lock")
            .insert(*hash, profile.clone());
        Ok(())
    }
}

/// SQLite-backed store (`peers.db`).
pub struct SqliteDatabase {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                name TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS router_infos (
                hash BLOB PRIMARY KEY,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS profiles (
                hash BLOB PRIMARY KEY,
                payload BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn get_config_value(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("db lock");
        Ok(conn
            .query_row(
                "SELECT value FROM config WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn set_config_value(&self, name: &str, value: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db lock");
        conn.execute(
            "INSERT INTO config (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }

    async fn get_router_info(&self, hash: &RouterHash) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("db lock");
        Ok(conn
            .query_row(
                "SELECT data FROM router_infos WHERE hash = ?1",
                params![hash.0.as_slice()],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn set_router_info(&self, hash: &RouterHash, data: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db lock");
        conn.execute(
            "INSERT INTO router_infos (hash, data) VALUES (?1, ?2)
             ON CONFLICT(hash) DO UPDATE SET data = excluded.data",
            params![hash.0.as_slice(), data],
        )?;
        Ok(())
    }

    async fn get_all_hashes(&self) -> anyhow::Result<Vec<RouterHash>> {
        let conn = self.conn.lock().expect("db lock");
        let mut stmt = conn.prepare("SELECT hash FROM router_infos")?;
        let rows = stmt.query_map([], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(blob)
        })?;

        let mut hashes = Vec::new();
        for row in rows {
            if let Some(hash) = RouterHash::from_bytes(&row?) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    async fn get_profile(&self, hash: &RouterHash) -> anyhow::Result<Option<PeerProfile>> {
        let conn = self.conn.lock().expect("db lock");
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM profiles WHERE hash = ?1",
                params![hash.0.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_profile(&self, hash: &RouterHash, profile: &PeerProfile) -> anyhow::Result<()> {
        let payload = serde_cbor::to_vec(profile)?;
        let conn = self.conn.lock().expect("db lock");
        conn.execute(
            "INSERT INTO profiles (hash, payload) VALUES (?1, ?2)
             ON CONFLICT(hash) DO UPDATE SET payload = excluded.payload",
            params![hash.0.as_slice(), payload],
        )?;
        Ok(())
    }
}
