// Copyright (c) 2024-2026 The Ramson Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ramson_core::{
    provision_keys, Database, Event, RouterConfig, RouterContext, RouterInfo, SqliteDatabase,
    PEERS_DB_FILE,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ramson")]
#[command(about = "ramson overlay router daemon")]
#[command(version)]
struct Cli {
    /// Directory holding router.info and peers.db.
    #[arg(long, default_value = ".", env = "RAMSON_DATA_DIR")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate and store a fresh router identity.
    Init,
    /// Print the local router identity hash.
    PrintIdentity,
    /// Import another router's router.info file into the database.
    ImportInfo { path: PathBuf },
    /// Run the router until interrupted.
    Run {
        /// UDP bind address.
        #[arg(long, default_value = "0.0.0.0:9630", env = "RAMSON_BIND")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;
    let db = Arc::new(SqliteDatabase::open(cli.data_dir.join(PEERS_DB_FILE))?);

    match cli.command {
        Command::Init => {
            let existing = db
                .get_config_value(ramson_core::database::CONFIG_PRIVATE_SIGNING_KEY)
                .await?;
            if existing.is_some() {
                anyhow::bail!("router identity already provisioned in this data dir");
            }
            provision_keys(db.as_ref()).await?;
            let ctx = RouterContext::with_database(
                RouterConfig {
                    data_dir: cli.data_dir.clone(),
                    ..RouterConfig::default()
                },
                db,
            )
            .await?;
            println!("router hash: {}", hex::encode(ctx.hash().0));
        }
        Command::PrintIdentity => {
            let ctx = RouterContext::with_database(
                RouterConfig {
                    data_dir: cli.data_dir.clone(),
                    ..RouterConfig::default()
                },
                db,
            )
            .await?;
            println!("router hash: {}", hex::encode(ctx.hash().0));
        }
        Command::ImportInfo { path } => {
            let bytes = std::fs::read(&path)?;
            let info = RouterInfo::from_bytes(&bytes)?;
            info.verify()?;
            let hash = info.identity.hash();
            db.set_router_info(&hash, &bytes).await?;
            println!("imported {}", hex::encode(hash.0));
        }
        Command::Run { bind } => {
            let config = RouterConfig {
                bind,
                data_dir: cli.data_dir.clone(),
                generate_keys: false,
            };
            let mut ctx = RouterContext::with_database(config, db).await?;
            ctx.start().await?;
            info!(hash = %ctx.hash(), "router running");

            let mut events = ctx.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(Event::Established { hash, inbound }) => {
                            info!(%hash, inbound, "session established");
                        }
                        Some(Event::PeerDisconnected { hash }) => {
                            info!(%hash, "peer disconnected");
                        }
                        Some(Event::EstablishmentFailed { hash }) => {
                            warn!(%hash, "establishment failed");
                        }
                        Some(Event::SearchSucceeded { key, .. }) => {
                            info!(%key, "search succeeded");
                        }
                        Some(Event::SearchFailed { key }) => {
                            warn!(%key, "search failed");
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            ctx.shutdown().await;
        }
    }
    Ok(())
}
