// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! SSU datagram codec.
//!
//! Every datagram is `IV(16) ‖ ciphertext ‖ MAC(16)`. The body is
//! AES-256-CBC under the session key; the MAC is HMAC-MD5-128 over
//! `ciphertext ‖ IV ‖ version(LE) ‖ ip ‖ port(LE)` under the MAC key.
//! The plaintext starts with a flag byte (payload type in the low
//! nibble) and a four-byte timestamp.
//!
//! The codec is pure: keys and the addressed endpoint are inputs on
//! every call, no state is held here.

use aes::cipher::block_padding::{NoPadding, ZeroPadding};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;

use crate::crypto::{MacKey, SessionKey};
use crate::error::PacketError;
use crate::transport::Endpoint;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacMd5 = Hmac<Md5>;

pub const PROTOCOL_VERSION: u16 = 1;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 16;
/// IV + MAC + at least the flag/timestamp header.
pub const MIN_PACKET_LEN: usize = 37;
/// Maximum accepted clock skew on the embedded timestamp.
pub const MAX_CLOCK_SKEW_SECS: u32 = 10 * 60;

/// Payload type carried in the low nibble of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    SessionRequest = 0,
    SessionCreated = 1,
    SessionConfirmed = 2,
    RelayRequest = 3,
    Data = 4,
    PeerTest = 5,
    SessionDestroyed = 8,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::SessionRequest),
            1 => Some(Self::SessionCreated),
            2 => Some(Self::SessionConfirmed),
            3 => Some(Self::RelayRequest),
            4 => Some(Self::Data),
            5 => Some(Self::PeerTest),
            8 => Some(Self::SessionDestroyed),
            _ => None,
        }
    }
}

/// A decrypted, authenticated packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub timestamp: u32,
    /// Typed payload bytes. May carry zero padding at the tail; all
    /// payload parsers are length-aware.
    pub body: Vec<u8>,
}

fn mac_input(ciphertext: &[u8], iv: &[u8], endpoint: &Endpoint) -> Vec<u8> {
    let mut input = Vec::with_capacity(ciphertext.len() + iv.len() + 20);
    input.extend_from_slice(ciphertext);
    input.extend_from_slice(iv);
    input.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    match endpoint.ip {
        std::net::IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
    }
    input.extend_from_slice(&endpoint.port.to_le_bytes());
    input
}

/// Raw AES-256-CBC encryption with zero padding, used for the encrypted
/// signature block inside handshake packets.
pub(crate) fn cbc_encrypt_raw(key: &SessionKey, iv: &[u8; IV_LEN], plain: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new((&key.0).into(), iv.into()).encrypt_padded_vec_mut::<ZeroPadding>(plain)
}

/// Raw AES-256-CBC decryption (no padding removal).
pub(crate) fn cbc_decrypt_raw(
    key: &SessionKey,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PacketError> {
    Aes256CbcDec::new((&key.0).into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| PacketError::DecryptFail)
}

/// Encrypt and authenticate a packet addressed to `endpoint`.
pub fn encode(
    kind: PacketType,
    timestamp: u32,
    body: &[u8],
    session_key: &SessionKey,
    mac_key: &MacKey,
    endpoint: &Endpoint,
) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    encode_with_iv(kind, timestamp, body, session_key, mac_key, endpoint, iv)
}

/// As [`encode`] but with a caller-supplied IV (deterministic tests).
pub fn encode_with_iv(
    kind: PacketType,
    timestamp: u32,
    body: &[u8],
    session_key: &SessionKey,
    mac_key: &MacKey,
    endpoint: &Endpoint,
    iv: [u8; IV_LEN],
) -> Vec<u8> {
    let mut plain = Vec::with_capacity(5 + body.len());
    plain.push(kind as u8);
    plain.extend_from_slice(&timestamp.to_be_bytes());
    plain.extend_from_slice(body);

    let ciphertext = Aes256CbcEnc::new((&session_key.0).into(), (&iv).into())
        .encrypt_padded_vec_mut::<ZeroPadding>(&plain);

    let mut mac = HmacMd5::new_from_slice(&mac_key.0).expect("hmac accepts any key length");
    mac.update(&mac_input(&ciphertext, &iv, endpoint));
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag[..MAC_LEN]);
    out
}

/// Authenticate and decrypt a datagram received on `endpoint`.
///
/// `now_secs` is the local clock used for the ±10 minute timestamp
/// window.
pub fn decode(
    datagram: &[u8],
    session_key: &SessionKey,
    mac_key: &MacKey,
    endpoint: &Endpoint,
    now_secs: u32,
) -> Result<Packet, PacketError> {
    if datagram.len() < MIN_PACKET_LEN {
        return Err(PacketError::ShortPacket);
    }
    let iv = &datagram[..IV_LEN];
    let ciphertext = &datagram[IV_LEN..datagram.len() - MAC_LEN];
    let tag = &datagram[datagram.len() - MAC_LEN..];
    if ciphertext.len() % 16 != 0 {
        return Err(PacketError::ShortPacket);
    }

    let mut mac = HmacMd5::new_from_slice(&mac_key.0).expect("hmac accepts any key length");
    mac.update(&mac_input(ciphertext, iv, endpoint));
    mac.verify_truncated_left(tag)
        .map_err(|_| PacketError::BadMac)?;

    let iv_arr: [u8; IV_LEN] = iv.try_into().expect("checked length");
    let plain = Aes256CbcDec::new((&session_key.0).into(), (&iv_arr).into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| PacketError::DecryptFail)?;
    if plain.len() < 5 {
        return Err(PacketError::ParseError);
    }

    let kind = PacketType::from_nibble(plain[0] & 0x0F).ok_or(PacketError::ParseError)?;
    let timestamp = u32::from_be_bytes(plain[1..5].try_into().expect("4 bytes"));
    if now_secs.abs_diff(timestamp) > MAX_CLOCK_SKEW_SECS {
        return Err(PacketError::BadTimestamp);
    }

    Ok(Packet {
        kind,
        timestamp,
        body: plain[5..].to_vec(),
    })
}
