// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

use crate::integration_tests::common::{
    read_reply, spawn_echo_upstream, start_proxy, test_config, wait_session_count,
};

/// Dribbles the whole handshake one byte at a time across several sweeper
/// ticks. Every arriving byte clears the idle flag, so the session must
/// survive to completion.
#[tokio::test]
#[serial]
async fn byte_at_a_time_handshake_survives_the_sweeper() -> Result<()> {
    let upstream = spawn_echo_upstream().await?;
    let proxy = start_proxy(test_config(Duration::from_millis(150), 8)).await?;

    let mut client = TcpStream::connect(proxy.addr).await?;

    for byte in [0x05u8, 0x01, 0x00] {
        sleep(Duration::from_millis(60)).await;
        client.write_all(&[byte]).await?;
    }
    let mut res = [0u8; 2];
    client.read_exact(&mut res).await?;
    assert_eq!(res, [0x05, 0x00]);

    let std::net::SocketAddr::V4(v4) = upstream else {
        unreachable!()
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());

    for byte in req {
        sleep(Duration::from_millis(60)).await;
        client.write_all(&[byte]).await?;
    }
    let reply = read_reply(&mut client).await?;
    assert_eq!(reply[1], 0x00);

    // The relay still works after all that dawdling.
    client.write_all(b"still alive").await?;
    let mut echoed = [0u8; 11];
    client.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"still alive");

    drop(client);
    wait_session_count(&proxy, 0, Duration::from_secs(2)).await?;
    Ok(())
}
