// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use socks5_proxy_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    server::Server,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config_logger.yaml")?;

    // Load config
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".into());
    let cfg = resolve_config_path(&path)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;
    let shutdown_wait = cfg.runtime.shutdown_wait;

    let cancel = CancellationToken::new();
    let server = Server::new(cfg, cancel)?;
    server.attach_self();

    let run = tokio::spawn(Arc::clone(&server).run());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    if let Err(e) = server.shutdown(shutdown_wait).await {
        warn!("shutdown incomplete: {e}");
    }
    run.await??;

    Ok(())
}
