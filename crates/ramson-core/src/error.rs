// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

/// Errors raised while decoding or authenticating a raw UDP datagram.
///
/// All of these are recoverable: the datagram is dropped and the session
/// (if any) stays up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// HMAC verification failed.
    #[error("bad mac")]
    BadMac,
    /// Datagram shorter than the minimum frame or not block-aligned.
    #[error("short packet")]
    ShortPacket,
    /// Embedded timestamp deviates more than the allowed skew.
    #[error("bad timestamp")]
    BadTimestamp,
    /// Ciphertext could not be decrypted.
    #[error("decrypt failure")]
    DecryptFail,
    /// Decrypted plaintext does not parse as any known payload.
    #[error("parse error")]
    ParseError,
}

/// Errors raised while parsing structured message bodies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input at offset {0}")]
    Truncated(usize),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("message expired")]
    Expired,
}

/// Handshake and session level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("signature verification failed")]
    SignatureFail,
    #[error("unexpected handshake phase")]
    UnexpectedPhase,
    #[error("timed out")]
    Timeout,
    #[error("resource limit reached: {0}")]
    ResourceExhausted(&'static str),
    #[error("endpoint unreachable")]
    EndpointUnreachable,
}

/// Database access failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("no value for key {0}")]
    Miss(String),
    #[error("storage error: {0}")]
    Storage(String),
}
