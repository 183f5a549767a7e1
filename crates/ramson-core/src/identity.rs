// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use anyhow::bail;
use sha2::{Digest, Sha256};

use crate::crypto::{DH_PUBLIC_LEN, DSA_PUBLIC_LEN};
use crate::ids::RouterHash;

/// Typed certificate blob attached to a router identity. Almost always
/// the null type with an empty payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificate {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Certificate {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(self.kind);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A router's public identity: 256-byte ElGamal encryption key, 128-byte
/// DSA signing key, and a certificate. Hashes to the router's stable ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterIdentity {
    encryption_key: Vec<u8>,
    signing_key: Vec<u8>,
    certificate: Certificate,
}

impl RouterIdentity {
    pub fn new(
        encryption_key: Vec<u8>,
        signing_key: Vec<u8>,
        certificate: Certificate,
    ) -> anyhow::Result<Self> {
        if encryption_key.len() != DH_PUBLIC_LEN {
            bail!(
                "encryption key must be {} bytes, got {}",
                DH_PUBLIC_LEN,
                encryption_key.len()
            );
        }
        if signing_key.len() != DSA_PUBLIC_LEN {
            bail!(
                "signing key must be {} bytes, got {}",
                DSA_PUBLIC_LEN,
                signing_key.len()
            );
        }
        Ok(Self {
            encryption_key,
            signing_key,
            certificate,
        })
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.encryption_key
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.signing_key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// SHA-256 over the serialized identity.
    pub fn hash(&self) -> RouterHash {
        let mut hasher = Sha256::new();
        hasher.update(&self.encryption_key);
        hasher.update(&self.signing_key);
        hasher.update(self.certificate.to_bytes());
        let digest = hasher.finalize();

        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        RouterHash(out)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DH_PUBLIC_LEN + DSA_PUBLIC_LEN + 3);
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&self.certificate.to_bytes());
        out
    }

    /// Parse an identity from the head of `buf`, returning it together
    /// with the number of bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        let fixed = DH_PUBLIC_LEN + DSA_PUBLIC_LEN;
        if buf.len() < fixed + 3 {
            bail!("identity truncated: {} bytes", buf.len());
        }
        let encryption_key = buf[..DH_PUBLIC_LEN].to_vec();
        let signing_key = buf[DH_PUBLIC_LEN..fixed].to_vec();
        let kind = buf[fixed];
        let cert_len = u16::from_be_bytes([buf[fixed + 1], buf[fixed + 2]]) as usize;
        if buf.len() < fixed + 3 + cert_len {
            bail!("identity certificate truncated");
        }
        let payload = buf[fixed + 3..fixed + 3 + cert_len].to_vec();

        Ok((
            Self {
                encryption_key,
                signing_key,
                certificate: Certificate { kind, payload },
            },
            fixed + 3 + cert_len,
        ))
    }
}
