// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Inter-router message formats.
//!
//! Common header: `type(1) ‖ msg_id(4) ‖ expiration_ms(8) ‖ size(2) ‖
//! checksum(1)`, all big-endian, checksum = first byte of
//! SHA-256(payload).

use sha2::{Digest, Sha256};

use crate::error::WireError;
use crate::ids::RouterHash;

pub const HEADER_LEN: usize = 16;
/// Opaque encrypted tunnel build record.
pub const BUILD_RECORD_LEN: usize = 528;
/// Fixed payload of a tunnel data message.
pub const TUNNEL_DATA_LEN: usize = 1024;
/// Record count of the fixed-size build variants.
pub const FIXED_BUILD_RECORDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    DatabaseStore = 1,
    DatabaseLookup = 2,
    DatabaseSearchReply = 3,
    DeliveryStatus = 4,
    Garlic = 10,
    TunnelData = 18,
    TunnelGateway = 19,
    Data = 20,
    TunnelBuild = 21,
    TunnelBuildReply = 22,
    VariableTunnelBuild = 23,
    VariableTunnelBuildReply = 24,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::DatabaseStore),
            2 => Some(Self::DatabaseLookup),
            3 => Some(Self::DatabaseSearchReply),
            4 => Some(Self::DeliveryStatus),
            10 => Some(Self::Garlic),
            18 => Some(Self::TunnelData),
            19 => Some(Self::TunnelGateway),
            20 => Some(Self::Data),
            21 => Some(Self::TunnelBuild),
            22 => Some(Self::TunnelBuildReply),
            23 => Some(Self::VariableTunnelBuild),
            24 => Some(Self::VariableTunnelBuildReply),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BuildRecord(pub [u8; BUILD_RECORD_LEN]);

impl std::fmt::Debug for BuildRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuildRecord({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreKind {
    RouterInfo = 0,
    LeaseSet = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStore {
    pub key: [u8; 32],
    pub kind: StoreKind,
    /// Nonzero requests a `DeliveryStatus` acknowledgement citing it.
    pub reply_token: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLookup {
    pub key: [u8; 32],
    pub from: RouterHash,
    pub excluded: Vec<RouterHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSearchReply {
    pub key: [u8; 32],
    pub hashes: Vec<RouterHash>,
    pub from: RouterHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub msg_id: u32,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    DatabaseStore(DatabaseStore),
    DatabaseLookup(DatabaseLookup),
    DatabaseSearchReply(DatabaseSearchReply),
    DeliveryStatus(DeliveryStatus),
    /// ElGamal block plus AES ciphertext; opened by the garlic handler.
    Garlic(Vec<u8>),
    TunnelData {
        tunnel_id: u32,
        data: Vec<u8>,
    },
    TunnelGateway {
        tunnel_id: u32,
        data: Vec<u8>,
    },
    Data(Vec<u8>),
    TunnelBuild(Vec<BuildRecord>),
    TunnelBuildReply(Vec<BuildRecord>),
    VariableTunnelBuild(Vec<BuildRecord>),
    VariableTunnelBuildReply(Vec<BuildRecord>),
}

impl Payload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::DatabaseStore(_) => MsgType::DatabaseStore,
            Self::DatabaseLookup(_) => MsgType::DatabaseLookup,
            Self::DatabaseSearchReply(_) => MsgType::DatabaseSearchReply,
            Self::DeliveryStatus(_) => MsgType::DeliveryStatus,
            Self::Garlic(_) => MsgType::Garlic,
            Self::TunnelData { .. } => MsgType::TunnelData,
            Self::TunnelGateway { .. } => MsgType::TunnelGateway,
            Self::Data(_) => MsgType::Data,
            Self::TunnelBuild(_) => MsgType::TunnelBuild,
            Self::TunnelBuildReply(_) => MsgType::TunnelBuildReply,
            Self::VariableTunnelBuild(_) => MsgType::VariableTunnelBuild,
            Self::VariableTunnelBuildReply(_) => MsgType::VariableTunnelBuildReply,
        }
    }
}

/// A complete inter-router message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_id: u32,
    pub expiration_ms: u64,
    pub payload: Payload,
}

impl Message {
    /// Build a message expiring `ttl_ms` past `now_ms` with a random id.
    pub fn new(payload: Payload, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            msg_id: rand::random(),
            expiration_ms: now_ms + ttl_ms,
            payload,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.payload.msg_type()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let body = encode_payload(&self.payload)?;
        if body.len() > u16::MAX as usize {
            return Err(WireError::InvalidField("payload too large"));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(self.msg_type() as u8);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.expiration_ms.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.push(Sha256::digest(&body)[0]);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a serialized message, enforcing checksum and expiry against
    /// `now_ms`.
    pub fn from_bytes(buf: &[u8], now_ms: u64) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let msg_type = MsgType::from_u8(buf[0]).ok_or(WireError::UnknownType(buf[0]))?;
        let msg_id = u32::from_be_bytes(buf[1..5].try_into().expect("4 bytes"));
        let expiration_ms = u64::from_be_bytes(buf[5..13].try_into().expect("8 bytes"));
        let size = u16::from_be_bytes([buf[13], buf[14]]) as usize;
        let checksum = buf[15];

        if buf.len() < HEADER_LEN + size {
            return Err(WireError::Truncated(buf.len()));
        }
        let body = &buf[HEADER_LEN..HEADER_LEN + size];
        if Sha256::digest(body)[0] != checksum {
            return Err(WireError::ChecksumMismatch);
        }
        if expiration_ms < now_ms {
            return Err(WireError::Expired);
        }

        Ok(Self {
            msg_id,
            expiration_ms,
            payload: parse_payload(msg_type, body)?,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn hash(&mut self) -> Result<RouterHash, WireError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(RouterHash(out))
    }

    fn key(&mut self) -> Result<[u8; 32], WireError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn record(&mut self) -> Result<BuildRecord, WireError> {
        let mut out = [0u8; BUILD_RECORD_LEN];
        out.copy_from_slice(self.take(BUILD_RECORD_LEN)?);
        Ok(BuildRecord(out))
    }
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    match payload {
        Payload::DatabaseStore(store) => {
            out.extend_from_slice(&store.key);
            out.push(store.kind as u8);
            out.extend_from_slice(&store.reply_token.to_be_bytes());
            if store.data.len() > u16::MAX as usize {
                return Err(WireError::InvalidField("store data too large"));
            }
            out.extend_from_slice(&(store.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&store.data);
        }
        Payload::DatabaseLookup(lookup) => {
            out.extend_from_slice(&lookup.key);
            out.extend_from_slice(&lookup.from.0);
            if lookup.excluded.len() > u16::MAX as usize {
                return Err(WireError::InvalidField("too many exclusions"));
            }
            out.extend_from_slice(&(lookup.excluded.len() as u16).to_be_bytes());
            for hash in &lookup.excluded {
                out.extend_from_slice(&hash.0);
            }
        }
        Payload::DatabaseSearchReply(reply) => {
            out.extend_from_slice(&reply.key);
            if reply.hashes.len() > u8::MAX as usize {
                return Err(WireError::InvalidField("too many reply hashes"));
            }
            out.push(reply.hashes.len() as u8);
            for hash in &reply.hashes {
                out.extend_from_slice(&hash.0);
            }
            out.extend_from_slice(&reply.from.0);
        }
        Payload::DeliveryStatus(status) => {
            out.extend_from_slice(&status.msg_id.to_be_bytes());
            out.extend_from_slice(&status.timestamp_ms.to_be_bytes());
        }
        Payload::Garlic(data) => {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(data);
        }
        Payload::TunnelData { tunnel_id, data } => {
            if data.len() != TUNNEL_DATA_LEN {
                return Err(WireError::InvalidField("tunnel data must be 1024 bytes"));
            }
            out.extend_from_slice(&tunnel_id.to_be_bytes());
            out.extend_from_slice(data);
        }
        Payload::TunnelGateway { tunnel_id, data } => {
            if data.len() > u16::MAX as usize {
                return Err(WireError::InvalidField("gateway data too large"));
            }
            out.extend_from_slice(&tunnel_id.to_be_bytes());
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
            out.extend_from_slice(data);
        }
        Payload::Data(data) => {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(data);
        }
        Payload::TunnelBuild(records) | Payload::TunnelBuildReply(records) => {
            if records.len() != FIXED_BUILD_RECORDS {
                return Err(WireError::InvalidField("fixed build needs 8 records"));
            }
            for record in records {
                out.extend_from_slice(&record.0);
            }
        }
        Payload::VariableTunnelBuild(records) | Payload::VariableTunnelBuildReply(records) => {
            if records.len() > u8::MAX as usize {
                return Err(WireError::InvalidField("too many build records"));
            }
            out.push(records.len() as u8);
            for record in records {
                out.extend_from_slice(&record.0);
            }
        }
    }
    Ok(out)
}

fn parse_payload(msg_type: MsgType, body: &[u8]) -> Result<Payload, WireError> {
    let mut r = Reader::new(body);
    let payload = match msg_type {
        MsgType::DatabaseStore => {
            let key = r.key()?;
            let kind = match r.u8()? {
                0 => StoreKind::RouterInfo,
                1 => StoreKind::LeaseSet,
                _ => return Err(WireError::InvalidField("store kind")),
            };
            let reply_token = r.u32()?;
            let len = r.u16()? as usize;
            let data = r.take(len)?.to_vec();
            Payload::DatabaseStore(DatabaseStore {
                key,
                kind,
                reply_token,
                data,
            })
        }
        MsgType::DatabaseLookup => {
            let key = r.key()?;
            let from = r.hash()?;
            let count = r.u16()? as usize;
            let mut excluded = Vec::with_capacity(count);
            for _ in 0..count {
                excluded.push(r.hash()?);
            }
            Payload::DatabaseLookup(DatabaseLookup {
                key,
                from,
                excluded,
            })
        }
        MsgType::DatabaseSearchReply => {
            let key = r.key()?;
            let count = r.u8()? as usize;
            let mut hashes = Vec::with_capacity(count);
            for _ in 0..count {
                hashes.push(r.hash()?);
            }
            let from = r.hash()?;
            Payload::DatabaseSearchReply(DatabaseSearchReply { key, hashes, from })
        }
        MsgType::DeliveryStatus => Payload::DeliveryStatus(DeliveryStatus {
            msg_id: r.u32()?,
            timestamp_ms: r.u64()?,
        }),
        MsgType::Garlic => {
            let len = r.u32()? as usize;
            Payload::Garlic(r.take(len)?.to_vec())
        }
        MsgType::TunnelData => {
            let tunnel_id = r.u32()?;
            let data = r.take(TUNNEL_DATA_LEN)?.to_vec();
            Payload::TunnelData { tunnel_id, data }
        }
        MsgType::TunnelGateway => {
            let tunnel_id = r.u32()?;
            let len = r.u16()? as usize;
            let data = r.take(len)?.to_vec();
            Payload::TunnelGateway { tunnel_id, data }
        }
        MsgType::Data => {
            let len = r.u32()? as usize;
            Payload::Data(r.take(len)?.to_vec())
        }
        MsgType::TunnelBuild => Payload::TunnelBuild(parse_fixed_records(&mut r)?),
        MsgType::TunnelBuildReply => Payload::TunnelBuildReply(parse_fixed_records(&mut r)?),
        MsgType::VariableTunnelBuild => {
            Payload::VariableTunnelBuild(parse_variable_records(&mut r)?)
        }
        MsgType::VariableTunnelBuildReply => {
            Payload::VariableTunnelBuildReply(parse_variable_records(&mut r)?)
        }
    };
    Ok(payload)
}

fn parse_fixed_records(r: &mut Reader<'_>) -> Result<Vec<BuildRecord>, WireError> {
    let mut records = Vec::with_capacity(FIXED_BUILD_RECORDS);
    for _ in 0..FIXED_BUILD_RECORDS {
        records.push(r.record()?);
    }
    Ok(records)
}

// The record count comes from the message body itself; each record is a
// fixed-size opaque blob.
fn parse_variable_records(r: &mut Reader<'_>) -> Result<Vec<BuildRecord>, WireError> {
    let count = r.u8()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(r.record()?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Message {
        let msg = Message {
            msg_id: 0xDEAD_BEEF,
            expiration_ms: 2_000_000,
            payload,
        };
        let bytes = msg.to_bytes().expect("encode");
        let parsed = Message::from_bytes(&bytes, 1_000_000).expect("decode");
        assert_eq!(parsed, msg);
        parsed
    }

    #[test]
    fn database_store_roundtrip() {
        roundtrip(Payload::DatabaseStore(DatabaseStore {
            key: [7u8; 32],
            kind: StoreKind::RouterInfo,
            reply_token: 42,
            data: vec![1, 2, 3, 4, 5],
        }));
    }

    #[test]
    fn database_lookup_roundtrip() {
        roundtrip(Payload::DatabaseLookup(DatabaseLookup {
            key: [9u8; 32],
            from: RouterHash([1u8; 32]),
            excluded: vec![RouterHash([2u8; 32]), RouterHash([3u8; 32])],
        }));
    }

    #[test]
    fn search_reply_roundtrip() {
        roundtrip(Payload::DatabaseSearchReply(DatabaseSearchReply {
            key: [9u8; 32],
            hashes: vec![RouterHash([4u8; 32]); 3],
            from: RouterHash([1u8; 32]),
        }));
    }

    #[test]
    fn delivery_status_roundtrip() {
        roundtrip(Payload::DeliveryStatus(DeliveryStatus {
            msg_id: 77,
            timestamp_ms: 123_456_789,
        }));
    }

    #[test]
    fn tunnel_messages_roundtrip() {
        roundtrip(Payload::TunnelData {
            tunnel_id: 5,
            data: vec![0xAA; TUNNEL_DATA_LEN],
        });
        roundtrip(Payload::TunnelGateway {
            tunnel_id: 5,
            data: vec![1, 2, 3],
        });
        roundtrip(Payload::Data(vec![9; 100]));
    }

    #[test]
    fn build_messages_roundtrip() {
        let record = BuildRecord([0x5Au8; BUILD_RECORD_LEN]);
        roundtrip(Payload::TunnelBuild(vec![record; FIXED_BUILD_RECORDS]));
        roundtrip(Payload::VariableTunnelBuild(vec![record; 3]));
        roundtrip(Payload::VariableTunnelBuildReply(vec![record; 5]));
    }

    #[test]
    fn variable_build_record_count_comes_from_body() {
        let record = BuildRecord([0x11u8; BUILD_RECORD_LEN]);
        let msg = Message {
            msg_id: 1,
            expiration_ms: 10,
            payload: Payload::VariableTunnelBuild(vec![record; 2]),
        };
        let bytes = msg.to_bytes().expect("encode");
        // First payload byte is the record count.
        assert_eq!(bytes[HEADER_LEN], 2);
    }

    #[test]
    fn rejects_bad_checksum() {
        let msg = Message {
            msg_id: 1,
            expiration_ms: 10_000,
            payload: Payload::Data(vec![1, 2, 3]),
        };
        let mut bytes = msg.to_bytes().expect("encode");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Message::from_bytes(&bytes, 0).expect_err("tampered");
        assert_eq!(err, WireError::ChecksumMismatch);
    }

    #[test]
    fn rejects_expired_message() {
        let msg = Message {
            msg_id: 1,
            expiration_ms: 10_000,
            payload: Payload::Data(vec![1]),
        };
        let bytes = msg.to_bytes().expect("encode");
        let err = Message::from_bytes(&bytes, 10_001).expect_err("expired");
        assert_eq!(err, WireError::Expired);
    }

    #[test]
    fn rejects_unknown_type() {
        let msg = Message {
            msg_id: 1,
            expiration_ms: 10_000,
            payload: Payload::Data(vec![1]),
        };
        let mut bytes = msg.to_bytes().expect("encode");
        bytes[0] = 99;
        let err = Message::from_bytes(&bytes, 0).expect_err("unknown");
        assert_eq!(err, WireError::UnknownType(99));
    }
}
