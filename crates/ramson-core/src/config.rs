// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;

/// Runtime configuration of a router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// UDP bind address. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Directory holding `router.info` and `peers.db`.
    pub data_dir: PathBuf,
    /// Generate and persist private keys when the database has none.
    /// Production routers provision keys explicitly and leave this off.
    pub generate_keys: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9630".parse().expect("valid socket"),
            data_dir: PathBuf::from("."),
            generate_keys: false,
        }
    }
}
