// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use tokio::{io::AsyncReadExt, net::TcpStream};

use crate::integration_tests::common::{
    connect_ipv4, handshake_noauth, spawn_echo_upstream, start_proxy, test_config,
    wait_session_count,
};

/// With MaxSessions = 1, a second client is dropped at accept time and the
/// slot opens up again once the first session ends.
#[tokio::test]
async fn session_limit_is_enforced() -> Result<()> {
    let upstream = spawn_echo_upstream().await?;
    let proxy = start_proxy(test_config(Duration::from_secs(30), 1)).await?;

    let mut first = TcpStream::connect(proxy.addr).await?;
    handshake_noauth(&mut first).await?;
    connect_ipv4(&mut first, upstream).await?;
    assert_eq!(proxy.server.session_count(), 1);

    let mut second = TcpStream::connect(proxy.addr).await?;
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf)).await??;
    assert_eq!(n, 0, "second client should be dropped immediately");
    assert_eq!(proxy.server.session_count(), 1);

    drop(first);
    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;

    let mut third = TcpStream::connect(proxy.addr).await?;
    handshake_noauth(&mut third).await?;
    connect_ipv4(&mut third, upstream).await?;
    assert_eq!(proxy.server.session_count(), 1);
    Ok(())
}
