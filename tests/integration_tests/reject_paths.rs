// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::integration_tests::common::{
    expect_eof, handshake_noauth, read_reply, spawn_echo_upstream, start_proxy, test_config,
    wait_session_count,
};

#[tokio::test]
async fn ipv6_destination_is_rejected_with_echo() -> Result<()> {
    let proxy = start_proxy(test_config(Duration::from_secs(30), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;
    handshake_noauth(&mut client).await?;

    let octets: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
    let mut req = vec![0x05, 0x01, 0x00, 0x04];
    req.extend_from_slice(&octets);
    req.extend_from_slice(&8080u16.to_be_bytes());
    client.write_all(&req).await?;

    let reply = read_reply(&mut client).await?;
    assert_eq!(&reply[..4], &[0x05, 0x08, 0x00, 0x04]);
    assert_eq!(&reply[4..20], &octets);
    assert_eq!(&reply[20..22], &8080u16.to_be_bytes());

    expect_eof(&mut client, Duration::from_secs(2)).await?;
    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;
    Ok(())
}

#[tokio::test]
async fn no_acceptable_method_closes_without_reply() -> Result<()> {
    let proxy = start_proxy(test_config(Duration::from_secs(30), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;
    // GSSAPI only
    client.write_all(&[0x05, 0x01, 0x02]).await?;

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await?;
    assert_eq!(n, 0, "expected silent close, got {:02x?}", &buf[..n]);

    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;
    Ok(())
}

#[tokio::test]
async fn unsupported_command_is_reported() -> Result<()> {
    let upstream = spawn_echo_upstream().await?;
    let proxy = start_proxy(test_config(Duration::from_secs(30), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;
    handshake_noauth(&mut client).await?;

    // BIND to a perfectly reachable destination: still refused.
    let std::net::SocketAddr::V4(v4) = upstream else {
        unreachable!()
    };
    let mut req = vec![0x05, 0x02, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    client.write_all(&req).await?;

    let reply = read_reply(&mut client).await?;
    assert_eq!(&reply[..4], &[0x05, 0x07, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &v4.ip().octets());
    assert_eq!(&reply[8..10], &v4.port().to_be_bytes());

    expect_eof(&mut client, Duration::from_secs(2)).await?;
    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_atype_closes_silently() -> Result<()> {
    let proxy = start_proxy(test_config(Duration::from_secs(30), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;
    handshake_noauth(&mut client).await?;

    client
        .write_all(&[0x05, 0x01, 0x00, 0x02, 0x01, 0x02, 0x00, 0x50])
        .await?;

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await?;
    assert_eq!(n, 0, "expected silent close, got {:02x?}", &buf[..n]);

    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;
    Ok(())
}

#[tokio::test]
async fn wrong_version_closes_silently() -> Result<()> {
    let proxy = start_proxy(test_config(Duration::from_secs(30), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;
    client.write_all(&[0x04, 0x01, 0x00]).await?;

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await?;
    assert_eq!(n, 0, "expected silent close, got {:02x?}", &buf[..n]);
    Ok(())
}
