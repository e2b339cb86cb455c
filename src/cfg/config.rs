// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_SIZE;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Listener endpoint and admission limits.
    pub server: ServerConfig,
    /// Upstream DNS used for domain-typed destinations.
    #[serde(default)]
    pub dns: DnsConfig,
    /// Implementation/runtime parameters outside the SOCKS5 protocol.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Where to listen and how many clients to carry at once.
pub struct ServerConfig {
    #[serde(rename = "ListenAddress")]
    /// IPv4 address the listen socket binds to.
    pub listen_address: Ipv4Addr,

    #[serde(rename = "ListenPort")]
    /// TCP port to listen on. Port 0 asks the kernel for an ephemeral one.
    pub listen_port: u16,

    #[serde(default = "default_backlog", rename = "Backlog")]
    /// Listen backlog passed to the kernel.
    pub backlog: u32,

    #[serde(default = "default_max_sessions", rename = "MaxSessions")]
    /// Upper bound on concurrently live sessions; new clients beyond it are
    /// dropped at accept time.
    pub max_sessions: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Upstream resolver endpoint.
pub struct DnsConfig {
    #[serde(default = "default_dns_server", rename = "Server")]
    pub server: SocketAddr,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server: default_dns_server(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Runtime-only knobs that never reach the wire.
pub struct RuntimeConfig {
    #[serde(default = "default_idle_timeout", rename = "IdleTimeout", with = "serde_secs")]
    /// Sweeper tick period; a session with no I/O progress for one full
    /// tick is evicted on the next.
    pub idle_timeout: Duration,

    #[serde(default = "default_buffer_size", rename = "BufferSize")]
    /// Size of one relay buffer; the pool holds `2 * MaxSessions` of them.
    pub buffer_size: usize,

    #[serde(default = "default_shutdown_wait", rename = "ShutdownWait", with = "serde_secs")]
    /// How long shutdown waits for live sessions to drain.
    pub shutdown_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            buffer_size: default_buffer_size(),
            shutdown_wait: default_shutdown_wait(),
        }
    }
}

fn default_backlog() -> u32 {
    100
}

fn default_max_sessions() -> u32 {
    256
}

fn default_dns_server() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_shutdown_wait() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.server.backlog >= 1, "Backlog must be >= 1");
        ensure!(self.server.max_sessions >= 1, "MaxSessions must be >= 1");
        ensure!(
            !self.runtime.idle_timeout.is_zero(),
            "IdleTimeout must be > 0"
        );
        // A buffer must hold the largest handshake frame and a DNS response.
        ensure!(
            self.runtime.buffer_size >= 512,
            "BufferSize must be >= 512"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
