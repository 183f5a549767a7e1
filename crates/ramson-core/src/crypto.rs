// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Modular-arithmetic primitives: 2048-bit Diffie-Hellman, DSA-SHA1
//! signatures and ElGamal decryption, all over the network's fixed
//! parameter sets.

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use sha1::{Digest as Sha1Digest, Sha1};

/// 2048-bit MODP prime (RFC 3526 group 14), shared by DH and ElGamal.
const MODP_2048_P: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

const MODP_2048_G: u32 = 2;

/// Network DSA domain (1024-bit p, 160-bit q, SHA-1 digests).
const DSA_P: &str = "\
9C05B2AA960D9B97B8931963C9CC9E8C3026E9B8ED92FAD0A69CC886D5BF8015\
FCADAE31A0AD18FAB3F01B00A358DE237655C4964AFAA2B337E96AD316B9FB1C\
C564B5AEC5B69A9FF6C3E4548707FEF8503D91DD8602E867E6D35D2235C1869C\
E2479C3B9D5401DE04E0727FB33D6511285D4CF29538D9E3B6051F5B22CC1C93";

const DSA_Q: &str = "A5DFC28FEF4CA1E286744CD8EED9D29D684046B7";

const DSA_G: &str = "\
0C1F4D27D40093B429E962D7223824E0BBC47E7C832A39236FC683AF84889581\
075FF9082ED32353D4374D7301CDA1D23C431F4698599DDA02451824FF369752\
593647CC3DDC197DE985E43D136CDCFC6BD5409CD2F450821142A5E6F8EB1C3A\
B5D0484B8129FCF17BCE4F7F33321C3CB3DBB14A905E7B2B3E93BE4708CBCC82";

/// Byte length of a serialized DH public value / ElGamal half-block.
pub const DH_PUBLIC_LEN: usize = 256;
/// Byte length of a serialized DSA public key.
pub const DSA_PUBLIC_LEN: usize = 128;
/// Byte length of a DSA signature (r ‖ s, 20 bytes each).
pub const DSA_SIGNATURE_LEN: usize = 40;
/// Byte length of an ElGamal ciphertext block (a ‖ b).
pub const ELGAMAL_BLOCK_LEN: usize = 512;
/// Plaintext capacity of one ElGamal block as used by garlic: an AES-256
/// key plus a CBC IV.
pub const ELGAMAL_PLAINTEXT_LEN: usize = 48;

/// Symmetric key of an SSU session (AES-256-CBC).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey(pub [u8; 32]);

/// MAC key of an SSU session (HMAC-MD5-128).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacKey(pub [u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MacKey(..)")
    }
}

pub fn modp_prime() -> BigUint {
    BigUint::parse_bytes(MODP_2048_P.as_bytes(), 16).expect("valid prime literal")
}

pub fn modp_generator() -> BigUint {
    BigUint::from(MODP_2048_G)
}

fn dsa_p() -> BigUint {
    BigUint::parse_bytes(DSA_P.as_bytes(), 16).expect("valid prime literal")
}

fn dsa_q() -> BigUint {
    BigUint::parse_bytes(DSA_Q.as_bytes(), 16).expect("valid prime literal")
}

fn dsa_g() -> BigUint {
    BigUint::parse_bytes(DSA_G.as_bytes(), 16).expect("valid generator literal")
}

/// Left-pad a big-endian integer encoding to exactly `len` bytes.
pub fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    assert!(raw.len() <= len, "integer wider than target encoding");
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

fn modinv(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(modulus.clone());
    let ext = a.extended_gcd(&m);
    if ext.gcd != BigInt::one() {
        return None;
    }
    let mut x = ext.x % &m;
    if x < BigInt::zero() {
        x += &m;
    }
    x.to_biguint()
}

/// Ephemeral Diffie-Hellman keypair over the 2048-bit MODP group.
pub struct DhKeyPair {
    x: BigUint,
    public: Vec<u8>,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let p = modp_prime();
        let mut rng = OsRng;
        let x = rng.gen_biguint_below(&p);
        let public = to_fixed_be(&modp_generator().modpow(&x, &p), DH_PUBLIC_LEN);
        Self { x, public }
    }

    /// Our public value, always [`DH_PUBLIC_LEN`] bytes.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Compute the 256-byte shared secret from the peer's public value.
    pub fn agree(&self, their_public: &[u8]) -> Vec<u8> {
        let p = modp_prime();
        let their = BigUint::from_bytes_be(their_public);
        to_fixed_be(&their.modpow(&self.x, &p), DH_PUBLIC_LEN)
    }
}

/// Split a DH shared secret into the session and MAC keys both peers use.
pub fn split_session_keys(secret: &[u8]) -> (SessionKey, MacKey) {
    assert!(secret.len() >= 64, "shared secret too short to split");
    let mut session = [0u8; 32];
    let mut mac = [0u8; 32];
    session.copy_from_slice(&secret[0..32]);
    mac.copy_from_slice(&secret[32..64]);
    (SessionKey(session), MacKey(mac))
}

/// DSA private key with its domain parameters.
#[derive(Clone, Debug)]
pub struct DsaPrivateKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub x: BigUint,
}

impl DsaPrivateKey {
    pub fn generate() -> Self {
        let (p, q, g) = (dsa_p(), dsa_q(), dsa_g());
        let mut rng = OsRng;
        let mut x = rng.gen_biguint_below(&q);
        while x.is_zero() {
            x = rng.gen_biguint_below(&q);
        }
        Self { p, q, g, x }
    }

    pub fn public(&self) -> BigUint {
        self.g.modpow(&self.x, &self.p)
    }

    /// Public key serialized to the fixed [`DSA_PUBLIC_LEN`] encoding.
    pub fn public_bytes(&self) -> Vec<u8> {
        to_fixed_be(&self.public(), DSA_PUBLIC_LEN)
    }

    /// Sign `message` with DSA-SHA1, returning the 40-byte `r ‖ s` form.
    pub fn sign(&self, message: &[u8]) -> [u8; 40] {
        let h = BigUint::from_bytes_be(&Sha1::digest(message)) % &self.q;
        let mut rng = OsRng;
        loop {
            let k = rng.gen_biguint_below(&self.q);
            if k.is_zero() {
                continue;
            }
            let r = self.g.modpow(&k, &self.p) % &self.q;
            if r.is_zero() {
                continue;
            }
            let Some(kinv) = modinv(&k, &self.q) else {
                continue;
            };
            let s = (kinv * (&h + &self.x * &r)) % &self.q;
            if s.is_zero() {
                continue;
            }

            let mut out = [0u8; 40];
            out[..20].copy_from_slice(&to_fixed_be(&r, 20));
            out[20..].copy_from_slice(&to_fixed_be(&s, 20));
            return out;
        }
    }
}

/// Verify a 40-byte DSA-SHA1 signature against a [`DSA_PUBLIC_LEN`]-byte
/// public key under the network domain parameters.
pub fn dsa_verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != DSA_SIGNATURE_LEN {
        return false;
    }
    let (p, q, g) = (dsa_p(), dsa_q(), dsa_g());
    let y = BigUint::from_bytes_be(public);
    let r = BigUint::from_bytes_be(&signature[..20]);
    let s = BigUint::from_bytes_be(&signature[20..]);
    if r.is_zero() || s.is_zero() || r >= q || s >= q {
        return false;
    }

    let Some(w) = modinv(&s, &q) else {
        return false;
    };
    let h = BigUint::from_bytes_be(&Sha1::digest(message)) % &q;
    let u1 = (&h * &w) % &q;
    let u2 = (&r * &w) % &q;
    let v = ((g.modpow(&u1, &p) * y.modpow(&u2, &p)) % &p) % &q;
    v == r
}

/// ElGamal private key over the 2048-bit group.
#[derive(Clone, Debug)]
pub struct ElGamalPrivateKey {
    pub p: BigUint,
    pub g: BigUint,
    pub x: BigUint,
}

impl ElGamalPrivateKey {
    pub fn generate() -> Self {
        let p = modp_prime();
        let mut rng = OsRng;
        let mut x = rng.gen_biguint_below(&p);
        while x.is_zero() {
            x = rng.gen_biguint_below(&p);
        }
        Self {
            p,
            g: modp_generator(),
            x,
        }
    }

    pub fn public(&self) -> BigUint {
        self.g.modpow(&self.x, &self.p)
    }

    /// Public key serialized to the fixed [`DH_PUBLIC_LEN`] encoding.
    pub fn public_bytes(&self) -> Vec<u8> {
        to_fixed_be(&self.public(), DH_PUBLIC_LEN)
    }

    /// Decrypt one [`ELGAMAL_BLOCK_LEN`]-byte block back into its
    /// [`ELGAMAL_PLAINTEXT_LEN`]-byte payload.
    pub fn decrypt(&self, block: &[u8]) -> Option<[u8; ELGAMAL_PLAINTEXT_LEN]> {
        if block.len() != ELGAMAL_BLOCK_LEN {
            return None;
        }
        let a = BigUint::from_bytes_be(&block[..DH_PUBLIC_LEN]);
        let b = BigUint::from_bytes_be(&block[DH_PUBLIC_LEN..]);
        let shared = a.modpow(&self.x, &self.p);
        let inv = modinv(&shared, &self.p)?;
        let m = (b * inv) % &self.p;

        let raw = m.to_bytes_be();
        if raw.len() > ELGAMAL_PLAINTEXT_LEN {
            return None;
        }
        let mut out = [0u8; ELGAMAL_PLAINTEXT_LEN];
        out[ELGAMAL_PLAINTEXT_LEN - raw.len()..].copy_from_slice(&raw);
        Some(out)
    }
}

/// Encrypt `plaintext` (at most [`ELGAMAL_PLAINTEXT_LEN`] bytes) to the
/// holder of `public`, producing one [`ELGAMAL_BLOCK_LEN`]-byte block.
pub fn elgamal_encrypt(public: &[u8], plaintext: &[u8]) -> [u8; ELGAMAL_BLOCK_LEN] {
    assert!(plaintext.len() <= ELGAMAL_PLAINTEXT_LEN);
    let p = modp_prime();
    let g = modp_generator();
    let y = BigUint::from_bytes_be(public);
    let m = BigUint::from_bytes_be(plaintext);

    let mut rng = OsRng;
    let mut k = rng.gen_biguint_below(&p);
    while k.is_zero() {
        k = rng.gen_biguint_below(&p);
    }
    let a = g.modpow(&k, &p);
    let b = (m * y.modpow(&k, &p)) % &p;

    let mut out = [0u8; ELGAMAL_BLOCK_LEN];
    out[..DH_PUBLIC_LEN].copy_from_slice(&to_fixed_be(&a, DH_PUBLIC_LEN));
    out[DH_PUBLIC_LEN..].copy_from_slice(&to_fixed_be(&b, DH_PUBLIC_LEN));
    out
}
