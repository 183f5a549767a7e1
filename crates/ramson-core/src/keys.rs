// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! PKCS#8 load/store for the router's two long-term private keys.
//!
//! The ElGamal and DSA algorithm identifiers are not covered by any
//! registry PKCS#8 implementation, so the inner DER (a version integer,
//! an algorithm identifier with domain parameters, and the private
//! exponent in an octet string) is read and written here directly. The
//! outer armor is ordinary PEM.

use anyhow::{bail, Context};
use num_bigint::BigUint;

use crate::crypto::{modp_generator, modp_prime, DsaPrivateKey, ElGamalPrivateKey};

/// OID 1.2.840.10040.4.1 (id-dsa).
const OID_DSA: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x38, 0x04, 0x01];
/// OID 1.3.14.7.2.1.1 (elGamal).
const OID_ELGAMAL: &[u8] = &[0x2B, 0x0E, 0x07, 0x02, 0x01, 0x01];

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

const PEM_TAG: &str = "PRIVATE KEY";

/// A loaded private key. Callers match on the variant they expect; a
/// mismatch at startup is fatal.
#[derive(Debug)]
pub enum PrivateKey {
    ElGamal(ElGamalPrivateKey),
    Dsa(DsaPrivateKey),
}

impl PrivateKey {
    /// Parse a PEM-armored PKCS#8 private key.
    pub fn from_pem(text: &str) -> anyhow::Result<Self> {
        let block = pem::parse(text).context("invalid PEM armor")?;
        if block.tag() != PEM_TAG {
            bail!("unexpected PEM tag {:?}", block.tag());
        }
        Self::from_der(block.contents())
    }

    /// Serialize to PEM-armored PKCS#8.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_TAG, self.to_der()))
    }

    fn from_der(der: &[u8]) -> anyhow::Result<Self> {
        let mut outer = Reader::new(der);
        let mut info = outer.sequence().context("private key info")?;
        let version = info.integer().context("version")?;
        if !version.is_empty() && version.iter().any(|b| *b != 0) {
            bail!("unsupported PKCS#8 version");
        }

        let mut alg = info.sequence().context("algorithm identifier")?;
        let oid = alg.tagged(TAG_OID).context("algorithm oid")?;
        let key_octets = info.tagged(TAG_OCTET_STRING).context("private key")?;
        let mut key_reader = Reader::new(key_octets);
        let x = BigUint::from_bytes_be(&key_reader.integer().context("private exponent")?);

        match oid {
            o if o == OID_DSA => {
                let mut params = alg.sequence().context("dsa parameters")?;
                let p = BigUint::from_bytes_be(&params.integer().context("p")?);
                let q = BigUint::from_bytes_be(&params.integer().context("q")?);
                let g = BigUint::from_bytes_be(&params.integer().context("g")?);
                Ok(Self::Dsa(DsaPrivateKey { p, q, g, x }))
            }
            o if o == OID_ELGAMAL => {
                let mut params = alg.sequence().context("elgamal parameters")?;
                let p = BigUint::from_bytes_be(&params.integer().context("p")?);
                let g = BigUint::from_bytes_be(&params.integer().context("g")?);
                Ok(Self::ElGamal(ElGamalPrivateKey { p, g, x }))
            }
            other => bail!("unsupported key algorithm oid {:02x?}", other),
        }
    }

    fn to_der(&self) -> Vec<u8> {
        let (oid, params, x) = match self {
            Self::Dsa(key) => (
                OID_DSA,
                der_sequence(&[
                    der_integer(&key.p),
                    der_integer(&key.q),
                    der_integer(&key.g),
                ]),
                &key.x,
            ),
            Self::ElGamal(key) => (
                OID_ELGAMAL,
                der_sequence(&[der_integer(&key.p), der_integer(&key.g)]),
                &key.x,
            ),
        };

        let alg = der_sequence(&[der_tlv(TAG_OID, oid), params]);
        let key_octets = der_tlv(TAG_OCTET_STRING, &der_integer(x));
        der_sequence(&[der_tlv(TAG_INTEGER, &[0]), alg, key_octets])
    }
}

/// Generate a fresh ElGamal/DSA keypair over the network parameters.
pub fn generate_keys() -> (ElGamalPrivateKey, DsaPrivateKey) {
    (ElGamalPrivateKey::generate(), DsaPrivateKey::generate())
}

fn der_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn der_tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    der_len(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

fn der_sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = parts.iter().flatten().copied().collect();
    der_tlv(TAG_SEQUENCE, &body)
}

fn der_integer(value: &BigUint) -> Vec<u8> {
    let mut body = value.to_bytes_be();
    if body[0] & 0x80 != 0 {
        body.insert(0, 0);
    }
    der_tlv(TAG_INTEGER, &body)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn tagged(&mut self, tag: u8) -> anyhow::Result<&'a [u8]> {
        if self.pos + 1 >= self.buf.len() {
            bail!("truncated DER");
        }
        if self.buf[self.pos] != tag {
            bail!(
                "expected DER tag {:#04x}, found {:#04x}",
                tag,
                self.buf[self.pos]
            );
        }
        self.pos += 1;

        let mut len = self.buf[self.pos] as usize;
        self.pos += 1;
        if len & 0x80 != 0 {
            let n = len & 0x7F;
            if n == 0 || n > 4 || self.pos + n > self.buf.len() {
                bail!("bad DER length");
            }
            len = 0;
            for _ in 0..n {
                len = (len << 8) | self.buf[self.pos] as usize;
                self.pos += 1;
            }
        }
        if self.pos + len > self.buf.len() {
            bail!("truncated DER body");
        }

        let body = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(body)
    }

    fn sequence(&mut self) -> anyhow::Result<Reader<'a>> {
        Ok(Reader::new(self.tagged(TAG_SEQUENCE)?))
    }

    fn integer(&mut self) -> anyhow::Result<Vec<u8>> {
        let body = self.tagged(TAG_INTEGER)?;
        // Strip the sign padding byte a positive DER integer may carry.
        let trimmed = if body.len() > 1 && body[0] == 0 {
            &body[1..]
        } else {
            body
        };
        Ok(trimmed.to_vec())
    }
}

/// Sanity-check that an ElGamal key uses the 2048-bit network group.
pub fn elgamal_uses_network_domain(key: &ElGamalPrivateKey) -> bool {
    key.p == modp_prime() && key.g == modp_generator()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsa_key_pem_roundtrip() {
        let key = DsaPrivateKey::generate();
        let pem = PrivateKey::Dsa(key.clone()).to_pem();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        match PrivateKey::from_pem(&pem).expect("parse pem") {
            PrivateKey::Dsa(loaded) => {
                assert_eq!(loaded.p, key.p);
                assert_eq!(loaded.q, key.q);
                assert_eq!(loaded.g, key.g);
                assert_eq!(loaded.x, key.x);
            }
            PrivateKey::ElGamal(_) => panic!("wrong variant"),
        }
    }

    #[test]
    fn elgamal_key_pem_roundtrip() {
        let key = ElGamalPrivateKey::generate();
        let pem = PrivateKey::ElGamal(key.clone()).to_pem();

        match PrivateKey::from_pem(&pem).expect("parse pem") {
            PrivateKey::ElGamal(loaded) => {
                assert_eq!(loaded.p, key.p);
                assert_eq!(loaded.g, key.g);
                assert_eq!(loaded.x, key.x);
            }
            PrivateKey::Dsa(_) => panic!("wrong variant"),
        }
    }

    #[test]
    fn loaded_keys_keep_signing() {
        let key = DsaPrivateKey::generate();
        let public = key.public_bytes();
        let pem = PrivateKey::Dsa(key).to_pem();

        let PrivateKey::Dsa(loaded) = PrivateKey::from_pem(&pem).expect("parse") else {
            panic!("wrong variant");
        };
        let sig = loaded.sign(b"reload check");
        assert!(crate::crypto::dsa_verify(&public, b"reload check", &sig));
    }

    #[test]
    fn rejects_foreign_pem_tag() {
        let block = pem::Pem::new("CERTIFICATE", vec![1, 2, 3]);
        let err = PrivateKey::from_pem(&pem::encode(&block)).expect_err("must reject");
        assert!(err.to_string().contains("unexpected PEM tag"));
    }

    #[test]
    fn generated_elgamal_key_uses_network_group() {
        let (elgamal, _) = generate_keys();
        assert!(elgamal_uses_network_domain(&elgamal));
    }
}
