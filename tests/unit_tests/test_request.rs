// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use anyhow::Result;
use hex_literal::hex;
use socks5_proxy_rs::proto::{
    Unpack,
    socks5::{self, Addr, CMD_CONNECT, FrameError},
};

fn unpack_done(bytes: &[u8]) -> Result<(socks5::Request, usize)> {
    match socks5::req_unpack(bytes)? {
        Unpack::Done { value, size } => Ok((value, size)),
        Unpack::Need(n) => anyhow::bail!("expected complete frame, still need {n}"),
    }
}

#[test]
fn req_ipv4_connect() -> Result<()> {
    let bytes = hex!("050100017f0000010050");
    let (req, size) = unpack_done(&bytes)?;
    assert_eq!(size, 10);
    assert_eq!(req.cmd, CMD_CONNECT);
    assert_eq!(req.addr, Addr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    assert_eq!(req.port, 80);
    Ok(())
}

#[test]
fn req_domain_connect() -> Result<()> {
    let mut bytes = hex!("050100030b").to_vec();
    bytes.extend_from_slice(b"example.com");
    bytes.extend_from_slice(&hex!("0050"));

    let (req, size) = unpack_done(&bytes)?;
    assert_eq!(size, 18);
    assert_eq!(req.addr, Addr::Domain("example.com".to_string()));
    assert_eq!(req.port, 80);
    Ok(())
}

#[test]
fn req_ipv6_parses_for_the_reject_path() -> Result<()> {
    let mut bytes = hex!("05010004").to_vec();
    let octets: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
    bytes.extend_from_slice(&octets);
    bytes.extend_from_slice(&hex!("1f90"));

    let (req, size) = unpack_done(&bytes)?;
    assert_eq!(size, 22);
    assert_eq!(req.addr, Addr::V6(octets));
    assert_eq!(req.addr.atype(), socks5::ATYPE_IPV6);
    assert_eq!(req.port, 8080);
    Ok(())
}

#[test]
fn req_unknown_atype_is_a_framing_error() {
    let bytes = hex!("0501000201020050");
    assert_eq!(
        socks5::req_unpack(&bytes),
        Err(FrameError::UnknownAddressType(0x02))
    );
}

#[test]
fn req_need_is_monotone_on_prefixes() -> Result<()> {
    let mut frame = hex!("050100030b").to_vec();
    frame.extend_from_slice(b"example.com");
    frame.extend_from_slice(&hex!("0050"));

    let mut known_end = 0;
    for cut in 0..frame.len() {
        match socks5::req_unpack(&frame[..cut])? {
            Unpack::Need(n) => {
                assert!(n > 0, "prefix of {cut} bytes reported need of zero");
                assert!(cut + n >= known_end);
                assert!(cut + n <= frame.len());
                known_end = cut + n;
            },
            Unpack::Done { .. } => panic!("prefix of {cut} bytes cannot be complete"),
        }
    }
    let (_, size) = unpack_done(&frame)?;
    assert_eq!(size, frame.len());
    Ok(())
}

#[test]
fn req_version_and_cmd_are_surfaced_not_checked() -> Result<()> {
    // BIND over version 4: the codec parses, the session refuses.
    let bytes = hex!("040200017f0000010050");
    let (req, _) = unpack_done(&bytes)?;
    assert_eq!(req.version, 0x04);
    assert_eq!(req.cmd, 0x02);
    Ok(())
}

#[test]
fn req_domain_must_be_utf8() {
    let bytes = hex!("0501000302fffe0050");
    assert_eq!(socks5::req_unpack(&bytes), Err(FrameError::BadDomainName));
}
