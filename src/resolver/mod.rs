// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::{buffer::BufferPool, proto::dns};

/// Asynchronous A-record resolver speaking UDP to a single upstream server.
///
/// One outstanding query at a time. A session builds a resolver only for
/// the time it takes to turn a domain destination into an address and drops
/// it before connecting; there is no per-query timeout, the whole-session
/// idle sweeper bounds a stuck lookup.
#[derive(Debug)]
pub struct Resolver {
    socket: UdpSocket,
    server: SocketAddr,
    pool: Arc<BufferPool>,
}

impl Resolver {
    pub async fn new(server: SocketAddr, pool: Arc<BufferPool>) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("bind resolver socket")?;
        socket
            .connect(server)
            .await
            .with_context(|| format!("connect resolver socket to {server}"))?;
        Ok(Self {
            socket,
            server,
            pool,
        })
    }

    /// Resolves `name` to the first A record the server returns.
    pub async fn query(&self, name: &str) -> Result<Ipv4Addr> {
        let mut buf = self.pool.alloc().context("buffer pool exhausted")?;

        let id = rand::random::<u16>();
        let len = dns::query_pack(buf.data_mut(), id, name)?;
        debug!(
            server = %self.server,
            name,
            "dns query {}",
            hex::encode(buf.filled(len))
        );
        self.socket
            .send(buf.filled(len))
            .await
            .context("send dns query")?;

        let size = self
            .socket
            .recv(buf.data_mut())
            .await
            .context("recv dns response")?;
        let ip = dns::response_unpack(buf.filled(size), id)?;
        debug!(name, %ip, "dns answer");

        Ok(ip)
    }
}
