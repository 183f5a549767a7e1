// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Signed self-published router records: identity, reachable addresses,
//! and a free-form option mapping.

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{bail, Context};

use crate::crypto::{dsa_verify, DsaPrivateKey, SessionKey, DSA_SIGNATURE_LEN};
use crate::identity::RouterIdentity;
use crate::transport::Endpoint;

pub const TRANSPORT_SSU: &str = "SSU";

/// Sorted string-keyed option map with a length-prefixed wire form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mapping {
    entries: BTreeMap<String, String>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut body = Vec::new();
        for (key, value) in &self.entries {
            if key.len() > u8::MAX as usize || value.len() > u8::MAX as usize {
                bail!("mapping entry too long");
            }
            body.push(key.len() as u8);
            body.extend_from_slice(key.as_bytes());
            body.push(value.len() as u8);
            body.extend_from_slice(value.as_bytes());
        }
        if body.len() > u16::MAX as usize {
            bail!("mapping too large");
        }

        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        if buf.len() < 2 {
            bail!("mapping truncated");
        }
        let total = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + total {
            bail!("mapping body truncated");
        }

        let mut entries = BTreeMap::new();
        let body = &buf[2..2 + total];
        let mut pos = 0usize;
        while pos < body.len() {
            let klen = body[pos] as usize;
            pos += 1;
            if pos + klen + 1 > body.len() {
                bail!("mapping key truncated");
            }
            let key = std::str::from_utf8(&body[pos..pos + klen])
                .context("mapping key not utf-8")?
                .to_owned();
            pos += klen;

            let vlen = body[pos] as usize;
            pos += 1;
            if pos + vlen > body.len() {
                bail!("mapping value truncated");
            }
            let value = std::str::from_utf8(&body[pos..pos + vlen])
                .context("mapping value not utf-8")?
                .to_owned();
            pos += vlen;

            entries.insert(key, value);
        }
        Ok((Self { entries }, 2 + total))
    }
}

/// One reachable address of a router: transport tag, relative cost, and
/// the transport's option map (`host`, `port`, introduction key, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    pub cost: u8,
    pub transport: String,
    pub options: Mapping,
}

impl RouterAddress {
    /// Build an SSU address for `endpoint` with introduction key `ikey`.
    pub fn ssu(endpoint: &Endpoint, ikey: &SessionKey) -> Self {
        let mut options = Mapping::new();
        options.set("host", endpoint.ip.to_string());
        options.set("port", endpoint.port.to_string());
        options.set("ikey", hex::encode(ikey.0));
        Self {
            cost: 5,
            transport: TRANSPORT_SSU.to_owned(),
            options,
        }
    }

    /// Resolve the `host`/`port` options into an endpoint.
    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        let host: IpAddr = self
            .options
            .get("host")
            .context("address has no host option")?
            .parse()
            .context("bad host option")?;
        let port: u16 = self
            .options
            .get("port")
            .context("address has no port option")?
            .parse()
            .context("bad port option")?;
        Ok(Endpoint { ip: host, port })
    }

    /// The introduction key published with an SSU address.
    pub fn intro_key(&self) -> anyhow::Result<SessionKey> {
        let raw = hex::decode(self.options.get("ikey").context("address has no ikey")?)
            .context("bad ikey option")?;
        let arr: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("ikey must be 32 bytes"))?;
        Ok(SessionKey(arr))
    }

    fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        if self.transport.len() > u8::MAX as usize {
            bail!("transport tag too long");
        }
        let mut out = vec![self.cost, self.transport.len() as u8];
        out.extend_from_slice(self.transport.as_bytes());
        out.extend_from_slice(&self.options.to_bytes()?);
        Ok(out)
    }

    fn from_bytes(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        if buf.len() < 2 {
            bail!("address truncated");
        }
        let cost = buf[0];
        let tlen = buf[1] as usize;
        if buf.len() < 2 + tlen {
            bail!("address transport truncated");
        }
        let transport = std::str::from_utf8(&buf[2..2 + tlen])
            .context("transport tag not utf-8")?
            .to_owned();
        let (options, consumed) = Mapping::from_bytes(&buf[2 + tlen..])?;
        Ok((
            Self {
                cost,
                transport,
                options,
            },
            2 + tlen + consumed,
        ))
    }
}

/// A router's signed self-published record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterInfo {
    pub identity: RouterIdentity,
    pub published_ms: u64,
    pub addresses: Vec<RouterAddress>,
    pub options: Mapping,
    signature: Vec<u8>,
}

impl RouterInfo {
    /// Assemble and sign a record with `signing_key` (which must match
    /// the identity's public signing key for `verify` to succeed).
    pub fn new_signed(
        identity: RouterIdentity,
        published_ms: u64,
        addresses: Vec<RouterAddress>,
        options: Mapping,
        signing_key: &DsaPrivateKey,
    ) -> anyhow::Result<Self> {
        let mut info = Self {
            identity,
            published_ms,
            addresses,
            options,
            signature: Vec::new(),
        };
        let signable = info.signable_bytes()?;
        info.signature = signing_key.sign(&signable).to_vec();
        Ok(info)
    }

    pub fn verify(&self) -> anyhow::Result<()> {
        let signable = self.signable_bytes()?;
        if !dsa_verify(self.identity.signing_key(), &signable, &self.signature) {
            bail!("router info signature invalid");
        }
        Ok(())
    }

    /// The first SSU address, if the router publishes one.
    pub fn ssu_address(&self) -> Option<&RouterAddress> {
        self.addresses
            .iter()
            .find(|address| address.transport == TRANSPORT_SSU)
    }

    fn signable_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut out = self.identity.to_bytes();
        out.extend_from_slice(&self.published_ms.to_be_bytes());
        if self.addresses.len() > u8::MAX as usize {
            bail!("too many addresses");
        }
        out.push(self.addresses.len() as u8);
        for address in &self.addresses {
            out.extend_from_slice(&address.to_bytes()?);
        }
        out.extend_from_slice(&self.options.to_bytes()?);
        Ok(out)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut out = self.signable_bytes()?;
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let (identity, mut pos) = RouterIdentity::from_bytes(buf)?;
        if buf.len() < pos + 9 {
            bail!("router info truncated");
        }
        let published_ms = u64::from_be_bytes(buf[pos..pos + 8].try_into().expect("8 bytes"));
        pos += 8;
        let count = buf[pos] as usize;
        pos += 1;

        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let (address, consumed) = RouterAddress::from_bytes(&buf[pos..])?;
            addresses.push(address);
            pos += consumed;
        }
        let (options, consumed) = Mapping::from_bytes(&buf[pos..])?;
        pos += consumed;

        if buf.len() != pos + DSA_SIGNATURE_LEN {
            bail!(
                "router info signature length mismatch: {} trailing bytes",
                buf.len().saturating_sub(pos)
            );
        }
        let signature = buf[pos..].to_vec();

        Ok(Self {
            identity,
            published_ms,
            addresses,
            options,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ElGamalPrivateKey;
    use crate::identity::Certificate;

    fn keys_and_identity() -> (DsaPrivateKey, RouterIdentity) {
        let elgamal = ElGamalPrivateKey::generate();
        let dsa = DsaPrivateKey::generate();
        let identity = RouterIdentity::new(
            elgamal.public_bytes(),
            dsa.public_bytes(),
            Certificate::null(),
        )
        .expect("valid identity");
        (dsa, identity)
    }

    fn sample_endpoint() -> Endpoint {
        Endpoint {
            ip: "127.0.0.1".parse().expect("valid ip"),
            port: 9630,
        }
    }

    #[test]
    fn mapping_roundtrip_is_sorted() {
        let mut mapping = Mapping::new();
        mapping.set("port", "9630");
        mapping.set("host", "10.0.0.1");

        let bytes = mapping.to_bytes().expect("encode mapping");
        // "host" sorts before "port" regardless of insertion order.
        assert_eq!(&bytes[3..7], b"host");
        let (parsed, consumed) = Mapping::from_bytes(&bytes).expect("decode mapping");
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, mapping);
    }

    #[test]
    fn signed_router_info_roundtrip() {
        let (dsa, identity) = keys_and_identity();
        let address = RouterAddress::ssu(&sample_endpoint(), &SessionKey([9u8; 32]));
        let info = RouterInfo::new_signed(identity, 1_754_000_000_000, vec![address], {
            let mut options = Mapping::new();
            options.set("caps", "R");
            options
        }, &dsa)
        .expect("sign router info");

        info.verify().expect("fresh signature verifies");

        let bytes = info.to_bytes().expect("encode");
        let parsed = RouterInfo::from_bytes(&bytes).expect("decode");
        assert_eq!(parsed, info);
        parsed.verify().expect("parsed signature verifies");
    }

    #[test]
    fn tampered_record_fails_verification() {
        let (dsa, identity) = keys_and_identity();
        let address = RouterAddress::ssu(&sample_endpoint(), &SessionKey([9u8; 32]));
        let info = RouterInfo::new_signed(identity, 1, vec![address], Mapping::new(), &dsa)
            .expect("sign router info");

        let mut bytes = info.to_bytes().expect("encode");
        let flip = bytes.len() - DSA_SIGNATURE_LEN - 1;
        bytes[flip] ^= 0x40;
        let parsed = RouterInfo::from_bytes(&bytes).expect("decode still parses");
        assert!(parsed.verify().is_err());
    }

    #[test]
    fn ssu_address_resolves_endpoint_and_intro_key() {
        let (dsa, identity) = keys_and_identity();
        let endpoint = sample_endpoint();
        let ikey = SessionKey([3u8; 32]);
        let info = RouterInfo::new_signed(
            identity,
            1,
            vec![RouterAddress::ssu(&endpoint, &ikey)],
            Mapping::new(),
            &dsa,
        )
        .expect("sign router info");

        let address = info.ssu_address().expect("has ssu address");
        assert_eq!(address.endpoint().expect("endpoint"), endpoint);
        assert_eq!(address.intro_key().expect("ikey").0, ikey.0);
    }
}
