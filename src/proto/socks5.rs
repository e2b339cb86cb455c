// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::proto::Unpack;

pub const VERSION: u8 = 0x05;

pub const METHOD_NOAUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYPE_IPV4: u8 = 0x01;
pub const ATYPE_DOMAIN: u8 = 0x03;
pub const ATYPE_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYPE_NOT_SUPPORTED: u8 = 0x08;

/// Framing faults the request parser cannot recover from. An address type
/// outside the RFC 1928 set makes the frame length indeterminable, so the
/// caller can only drop the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown address type 0x{0:02x}")]
    UnknownAddressType(u8),
    #[error("domain name is not valid utf-8")]
    BadDomainName,
}

/// Method-negotiation request, `VER NMETHODS METHODS[NMETHODS]`.
///
/// The version byte is surfaced as-is; validating it is the session's job,
/// not the codec's.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

/// A destination address in its three wire shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4(Ipv4Addr),
    Domain(String),
    V6([u8; 16]),
}

impl Addr {
    pub fn atype(&self) -> u8 {
        match self {
            Addr::V4(_) => ATYPE_IPV4,
            Addr::Domain(_) => ATYPE_DOMAIN,
            Addr::V6(_) => ATYPE_IPV6,
        }
    }
}

/// CONNECT request, `VER CMD RSV ATYP DST.ADDR DST.PORT`.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub cmd: u8,
    pub addr: Addr,
    pub port: u16,
}

/// Parses a method-negotiation request from a (possibly short) prefix.
pub fn auth_req_unpack(buf: &[u8]) -> Unpack<AuthRequest> {
    if buf.len() < 2 {
        return Unpack::Need(2 - buf.len());
    }
    let total = 2 + buf[1] as usize;
    if buf.len() < total {
        return Unpack::Need(total - buf.len());
    }
    Unpack::Done {
        value: AuthRequest {
            version: buf[0],
            methods: buf[2..total].to_vec(),
        },
        size: total,
    }
}

/// Writes the 2-byte method-selection reply, returning its length.
pub fn auth_res_pack(buf: &mut [u8], method: u8) -> usize {
    buf[0] = VERSION;
    buf[1] = method;
    2
}

/// Parses a CONNECT request from a (possibly short) prefix.
pub fn req_unpack(buf: &[u8]) -> Result<Unpack<Request>, FrameError> {
    if buf.len() < 4 {
        return Ok(Unpack::Need(4 - buf.len()));
    }
    let atype = buf[3];
    let total = match atype {
        ATYPE_IPV4 => 4 + 4 + 2,
        ATYPE_DOMAIN => {
            if buf.len() < 5 {
                return Ok(Unpack::Need(5 - buf.len()));
            }
            5 + buf[4] as usize + 2
        },
        ATYPE_IPV6 => 4 + 16 + 2,
        other => return Err(FrameError::UnknownAddressType(other)),
    };
    if buf.len() < total {
        return Ok(Unpack::Need(total - buf.len()));
    }

    let addr = match atype {
        ATYPE_IPV4 => Addr::V4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])),
        ATYPE_DOMAIN => {
            let name = std::str::from_utf8(&buf[5..5 + buf[4] as usize])
                .map_err(|_| FrameError::BadDomainName)?;
            Addr::Domain(name.to_owned())
        },
        _ => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            Addr::V6(octets)
        },
    };
    let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);

    Ok(Unpack::Done {
        value: Request {
            version: buf[0],
            cmd: buf[1],
            addr,
            port,
        },
        size: total,
    })
}

/// Writes a reply frame with the same framing as the request, returning its
/// length. The address is echoed losslessly, which the unsupported-ATYP and
/// unsupported-CMD paths rely on.
pub fn res_pack(buf: &mut [u8], rep: u8, addr: &Addr, port: u16) -> usize {
    buf[0] = VERSION;
    buf[1] = rep;
    buf[2] = 0x00;
    buf[3] = addr.atype();

    let at = match addr {
        Addr::V4(ip) => {
            buf[4..8].copy_from_slice(&ip.octets());
            8
        },
        Addr::Domain(name) => {
            buf[4] = name.len() as u8;
            buf[5..5 + name.len()].copy_from_slice(name.as_bytes());
            5 + name.len()
        },
        Addr::V6(octets) => {
            buf[4..20].copy_from_slice(octets);
            20
        },
    };
    buf[at..at + 2].copy_from_slice(&port.to_be_bytes());

    at + 2
}
