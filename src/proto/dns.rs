// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use bitflags::bitflags;
use thiserror::Error;
use zerocopy::{BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16};

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

const RCODE_MASK: u16 = 0x000f;
const POINTER_MASK: u8 = 0xc0;

bitflags! {
    /// The 16-bit flag word of a DNS header. RCODE lives in the low nibble
    /// and is extracted separately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const RESPONSE = 0x8000;
        const AUTHORITATIVE = 0x0400;
        const TRUNCATED = 0x0200;
        const RECURSION_DESIRED = 0x0100;
        const RECURSION_AVAILABLE = 0x0080;
    }
}

/// Why a query could not be built or an answer could not be used. The
/// resolver treats every variant the same way: the lookup failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("invalid domain name")]
    BadName,
    #[error("query does not fit the buffer")]
    Overflow,
    #[error("packet truncated or malformed")]
    ShortPacket,
    #[error("response id mismatch")]
    IdMismatch,
    #[error("packet is not a response")]
    NotResponse,
    #[error("response truncated, retry over tcp is not supported")]
    Truncated,
    #[error("server returned rcode {0}")]
    Rcode(u8),
    #[error("no A records in answer")]
    NoAnswer,
}

/// Fixed 12-byte DNS header, all fields big-endian on the wire.
#[repr(C)]
#[derive(Debug, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    pub id: U16<BigEndian>,
    pub flags: U16<BigEndian>,
    pub qd_count: U16<BigEndian>,
    pub an_count: U16<BigEndian>,
    pub ns_count: U16<BigEndian>,
    pub ar_count: U16<BigEndian>,
}

/// Builds a single-question A/IN query for `name` into `buf`, returning the
/// packet length. A trailing root dot is accepted and stripped.
pub fn query_pack(buf: &mut [u8], id: u16, name: &str) -> Result<usize, DnsError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DnsError::BadName);
    }
    // encoded name = leading label length + labels + root zero
    let total = HEADER_LEN + name.len() + 2 + 4;
    if buf.len() < total {
        return Err(DnsError::Overflow);
    }

    let header = Header {
        id: U16::new(id),
        flags: U16::new(Flags::RECURSION_DESIRED.bits()),
        qd_count: U16::new(1),
        ..Default::default()
    };
    buf[..HEADER_LEN].copy_from_slice(header.as_bytes());

    let mut at = HEADER_LEN;
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::BadName);
        }
        buf[at] = label.len() as u8;
        buf[at + 1..at + 1 + label.len()].copy_from_slice(label.as_bytes());
        at += 1 + label.len();
    }
    buf[at] = 0;
    at += 1;
    buf[at..at + 2].copy_from_slice(&TYPE_A.to_be_bytes());
    at += 2;
    buf[at..at + 2].copy_from_slice(&CLASS_IN.to_be_bytes());
    at += 2;

    Ok(at)
}

/// Extracts the first A record from a response packet, checking that it
/// really answers the query with the given `id`.
pub fn response_unpack(packet: &[u8], id: u16) -> Result<Ipv4Addr, DnsError> {
    let (header, _) = Header::ref_from_prefix(packet).map_err(|_| DnsError::ShortPacket)?;
    if header.id.get() != id {
        return Err(DnsError::IdMismatch);
    }
    let flags = Flags::from_bits_retain(header.flags.get());
    if !flags.contains(Flags::RESPONSE) {
        return Err(DnsError::NotResponse);
    }
    if flags.contains(Flags::TRUNCATED) {
        return Err(DnsError::Truncated);
    }
    let rcode = (header.flags.get() & RCODE_MASK) as u8;
    if rcode != 0 {
        return Err(DnsError::Rcode(rcode));
    }

    let mut at = HEADER_LEN;
    for _ in 0..header.qd_count.get() {
        at = skip_name(packet, at)?;
        at += 4; // qtype + qclass
    }

    for _ in 0..header.an_count.get() {
        at = skip_name(packet, at)?;
        if packet.len() < at + 10 {
            return Err(DnsError::ShortPacket);
        }
        let rtype = u16::from_be_bytes([packet[at], packet[at + 1]]);
        let rclass = u16::from_be_bytes([packet[at + 2], packet[at + 3]]);
        let rd_len = u16::from_be_bytes([packet[at + 8], packet[at + 9]]) as usize;
        at += 10;
        if packet.len() < at + rd_len {
            return Err(DnsError::ShortPacket);
        }
        if rtype == TYPE_A && rclass == CLASS_IN && rd_len == 4 {
            return Ok(Ipv4Addr::new(
                packet[at],
                packet[at + 1],
                packet[at + 2],
                packet[at + 3],
            ));
        }
        at += rd_len;
    }

    Err(DnsError::NoAnswer)
}

/// Steps over an encoded name, following the two-byte compression pointer
/// form without chasing it.
fn skip_name(packet: &[u8], mut at: usize) -> Result<usize, DnsError> {
    loop {
        let len = *packet.get(at).ok_or(DnsError::ShortPacket)?;
        if len & POINTER_MASK == POINTER_MASK {
            if packet.len() < at + 2 {
                return Err(DnsError::ShortPacket);
            }
            return Ok(at + 2);
        }
        if len == 0 {
            return Ok(at + 1);
        }
        at += 1 + len as usize;
    }
}
