// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{SocketAddr, SocketAddrV4},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    buffer::{BufferPool, PooledBuffer},
    proto::{
        Unpack,
        socks5::{self, Addr, AuthRequest, FrameError, Request},
    },
    resolver::Resolver,
    session::common::{StateMachine, StateMachineCtx, Transition},
};

/// Context for one SOCKS5 conversation: the handshake, the destination
/// setup, and the relay that follows.
///
/// The context owns the client socket for its whole life, the upstream
/// socket from a successful connect onwards, and up to two pool buffers.
/// Dropping the context (on any path, including eviction) closes both
/// sockets and returns the buffers.
pub struct SessionCtx {
    id: u64,
    peer: SocketAddr,
    client: Option<TcpStream>,
    remote: Option<TcpStream>,
    pool: Arc<BufferPool>,
    dns_server: SocketAddr,

    /// Handshake scratch, then the client-to-remote relay buffer.
    buf0: Option<PooledBuffer>,
    /// Remote-to-client relay buffer, allocated only once relaying starts.
    buf1: Option<PooledBuffer>,

    request: Option<Request>,
    /// Reply code for the refusal paths; `None` means the request was
    /// accepted and the session will relay.
    reject: Option<u8>,
    dst_port: u16,
    dst: Option<SocketAddrV4>,

    /// Cleared by every completed read or write; the server's sweeper sets
    /// it and evicts sessions that kept it set for a whole tick.
    idle: Arc<AtomicBool>,
    state: Option<SessionStates>,
}

impl SessionCtx {
    pub fn new(
        id: u64,
        client: TcpStream,
        peer: SocketAddr,
        pool: Arc<BufferPool>,
        dns_server: SocketAddr,
        idle: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            peer,
            client: Some(client),
            remote: None,
            pool,
            dns_server,
            buf0: None,
            buf1: None,
            request: None,
            reject: None,
            dst_port: 0,
            dst: None,
            idle,
            state: Some(SessionStates::ReadAuthReq(ReadAuthReq)),
        }
    }

    /// Reads from the client until `unpack` reports a complete frame,
    /// growing the accumulation window by exactly what the codec still
    /// needs. The client closing mid-frame is an error.
    async fn read_frame<T>(
        &mut self,
        unpack: fn(&[u8]) -> Result<Unpack<T>, FrameError>,
    ) -> Result<T> {
        let mut buf = self.buf0.take().context("buffer not armed")?;
        let client = self.client.as_mut().context("client stream gone")?;

        let seed = match unpack(&[])? {
            Unpack::Need(n) => n,
            Unpack::Done { .. } => bail!("frame cannot be empty"),
        };
        buf.set_window(0, seed);

        loop {
            let size = client.read(buf.window_mut()).await?;
            if size == 0 {
                bail!("client closed during handshake");
            }
            self.idle.store(false, Ordering::Relaxed);

            let filled = buf.offset + size;
            match unpack(buf.filled(filled))? {
                Unpack::Need(more) => buf.set_window(filled, more),
                Unpack::Done { value, .. } => {
                    buf.set_window(0, 0);
                    self.buf0 = Some(buf);
                    return Ok(value);
                },
            }
        }
    }

    /// Drains the window of `buf0` into the client, re-issuing on short
    /// writes with an advanced offset.
    async fn write_client(&mut self) -> Result<()> {
        let mut buf = self.buf0.take().context("buffer not armed")?;
        let client = self.client.as_mut().context("client stream gone")?;

        while buf.length > 0 {
            let size = client.write(buf.window()).await?;
            ensure!(size > 0, "client stopped accepting bytes");
            buf.advance(size);
            self.idle.store(false, Ordering::Relaxed);
        }

        self.buf0 = Some(buf);
        Ok(())
    }

    async fn read_auth_req(&mut self) -> Result<()> {
        self.buf0 = Some(self.pool.alloc().context("buffer pool exhausted")?);

        let auth: AuthRequest = self.read_frame(|b| Ok(socks5::auth_req_unpack(b))).await?;
        ensure!(
            auth.version == socks5::VERSION,
            "unsupported socks version 0x{:02x}",
            auth.version
        );
        // No acceptable method: drop the connection without a reply.
        ensure!(
            auth.methods.contains(&socks5::METHOD_NOAUTH),
            "client offered no acceptable auth method"
        );
        Ok(())
    }

    async fn write_auth_res(&mut self) -> Result<()> {
        {
            let buf = self.buf0.as_mut().context("buffer not armed")?;
            let len = socks5::auth_res_pack(buf.data_mut(), socks5::METHOD_NOAUTH);
            buf.set_window(0, len);
        }
        self.write_client().await
    }

    async fn read_req(&mut self) -> Result<()> {
        let req = self.read_frame(socks5::req_unpack).await?;
        ensure!(
            req.version == socks5::VERSION,
            "unsupported socks version 0x{:02x}",
            req.version
        );
        self.dst_port = req.port;

        if req.cmd != socks5::CMD_CONNECT {
            debug!(id = self.id, cmd = req.cmd, "unsupported command");
            self.reject = Some(socks5::REP_CMD_NOT_SUPPORTED);
        } else {
            match &req.addr {
                Addr::V4(ip) => {
                    self.dst = Some(SocketAddrV4::new(*ip, req.port));
                    self.buf0 = None;
                },
                Addr::Domain(_) => {
                    self.buf0 = None;
                },
                Addr::V6(_) => {
                    debug!(id = self.id, "ipv6 destination not supported");
                    self.reject = Some(socks5::REP_ATYPE_NOT_SUPPORTED);
                },
            }
        }

        self.request = Some(req);
        Ok(())
    }

    /// Turns the domain destination into an address. The resolver exists
    /// only for the duration of this call.
    async fn resolve(&mut self) -> Result<()> {
        let resolver = Resolver::new(self.dns_server, Arc::clone(&self.pool)).await?;

        let name = match self.request.as_ref().map(|r| &r.addr) {
            Some(Addr::Domain(name)) => name.as_str(),
            _ => bail!("resolve state without a domain destination"),
        };
        let ip = resolver.query(name).await?;
        self.idle.store(false, Ordering::Relaxed);

        self.dst = Some(SocketAddrV4::new(ip, self.dst_port));
        Ok(())
    }

    /// Opens the upstream connection and packs the success reply, bound
    /// address echoing the chosen destination.
    async fn connect(&mut self) -> Result<()> {
        let dst = self.dst.context("connect state without a destination")?;

        let stream = TcpStream::connect(dst)
            .await
            .with_context(|| format!("connect to {dst}"))?;
        stream.set_nodelay(true)?;
        self.idle.store(false, Ordering::Relaxed);
        self.remote = Some(stream);

        let mut buf = self.pool.alloc().context("buffer pool exhausted")?;
        let len = socks5::res_pack(
            buf.data_mut(),
            socks5::REP_SUCCESS,
            &Addr::V4(*dst.ip()),
            dst.port(),
        );
        buf.set_window(0, len);
        self.buf0 = Some(buf);
        Ok(())
    }

    /// Packs a refusal reply, echoing the request's address and port.
    fn pack_reject(&mut self) -> Result<()> {
        let rep = self.reject.context("reject code missing")?;
        let req = self.request.as_ref().context("request missing")?;
        let buf = self.buf0.as_mut().context("buffer not armed")?;

        let len = socks5::res_pack(buf.data_mut(), rep, &req.addr, req.port);
        buf.set_window(0, len);
        Ok(())
    }

    /// Runs the two half-duplex pipelines until one of them ends; either
    /// peer's EOF or any error closes the whole session (half-close is not
    /// supported).
    async fn relay(&mut self) -> Result<()> {
        let client = self.client.take().context("client stream gone")?;
        let remote = self.remote.take().context("remote stream gone")?;
        let mut buf0 = self.buf0.take().context("buffer not armed")?;
        let mut buf1 = self.pool.alloc().context("buffer pool exhausted")?;
        let idle = Arc::clone(&self.idle);

        let (mut client_r, mut client_w) = client.into_split();
        let (mut remote_r, mut remote_w) = remote.into_split();

        select! {
            r = copy_half(&mut client_r, &mut remote_w, &mut buf0, &idle) => {
                r.context("client to remote")
            },
            r = copy_half(&mut remote_r, &mut client_w, &mut buf1, &idle) => {
                r.context("remote to client")
            },
        }
    }
}

/// One direction of the relay: fill the buffer with whatever the source
/// has, drain it into the sink re-issuing on short writes, re-arm. Returns
/// on the source's EOF.
async fn copy_half(
    src: &mut OwnedReadHalf,
    dst: &mut OwnedWriteHalf,
    buf: &mut PooledBuffer,
    idle: &AtomicBool,
) -> Result<()> {
    loop {
        buf.set_window(0, buf.capacity());
        let size = src.read(buf.window_mut()).await?;
        if size == 0 {
            return Ok(());
        }
        idle.store(false, Ordering::Relaxed);

        buf.set_window(0, size);
        while buf.length > 0 {
            let written = dst.write(buf.window()).await?;
            ensure!(written > 0, "peer stopped accepting bytes");
            buf.advance(written);
            idle.store(false, Ordering::Relaxed);
        }
    }
}

/// Reads and validates the client's method-negotiation frame.
#[derive(Debug)]
pub struct ReadAuthReq;

/// Writes the NOAUTH method selection back to the client.
#[derive(Debug)]
pub struct WriteAuthRes;

/// Reads the CONNECT request and dispatches on its address type.
#[derive(Debug)]
pub struct ReadReq;

/// Resolves a domain destination to an IPv4 address.
#[derive(Debug)]
pub struct Resolve;

/// Opens the upstream TCP connection.
#[derive(Debug)]
pub struct Connect;

/// Writes the reply frame; refusal replies end the session here.
#[derive(Debug)]
pub struct WriteRes;

/// Shuttles bytes between client and upstream until either side ends.
#[derive(Debug)]
pub struct Relay;

#[derive(Debug)]
pub enum SessionStates {
    ReadAuthReq(ReadAuthReq),
    WriteAuthRes(WriteAuthRes),
    ReadReq(ReadReq),
    Resolve(Resolve),
    Connect(Connect),
    WriteRes(WriteRes),
    Relay(Relay),
}

type SessionStepOut = Transition<SessionStates, Result<()>>;

impl StateMachine<SessionCtx, SessionStepOut> for ReadAuthReq {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.read_auth_req().await {
                Ok(()) => Transition::Next(SessionStates::WriteAuthRes(WriteAuthRes), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for WriteAuthRes {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.write_auth_res().await {
                Ok(()) => Transition::Next(SessionStates::ReadReq(ReadReq), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for ReadReq {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.read_req().await {
                Ok(()) => {
                    let next = if ctx.reject.is_some() {
                        SessionStates::WriteRes(WriteRes)
                    } else if ctx.dst.is_some() {
                        SessionStates::Connect(Connect)
                    } else {
                        SessionStates::Resolve(Resolve)
                    };
                    Transition::Next(next, Ok(()))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Resolve {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.resolve().await {
                Ok(()) => Transition::Next(SessionStates::Connect(Connect), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Connect {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.connect().await {
                Ok(()) => Transition::Next(SessionStates::WriteRes(WriteRes), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for WriteRes {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.reject.is_some() {
                if let Err(e) = ctx.pack_reject() {
                    return Transition::Done(Err(e));
                }
            }
            match ctx.write_client().await {
                Ok(()) if ctx.remote.is_some() => {
                    Transition::Next(SessionStates::Relay(Relay), Ok(()))
                },
                Ok(()) => Transition::Done(Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<SessionCtx, SessionStepOut> for Relay {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = SessionStepOut> + Send + 'a>>
    where
        Self: 'a,
        SessionCtx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut SessionCtx) -> Self::StepResult<'a> {
        Box::pin(async move { Transition::Done(ctx.relay().await) })
    }
}

impl StateMachineCtx<()> for SessionCtx {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        debug!(id = self.id, peer = %self.peer, "session enter");
        loop {
            let state = self.state.take().context("state must be set SessionCtx")?;
            let step = async {
                match state {
                    SessionStates::ReadAuthReq(mut s) => s.step(self).await,
                    SessionStates::WriteAuthRes(mut s) => s.step(self).await,
                    SessionStates::ReadReq(mut s) => s.step(self).await,
                    SessionStates::Resolve(mut s) => s.step(self).await,
                    SessionStates::Connect(mut s) => s.step(self).await,
                    SessionStates::WriteRes(mut s) => s.step(self).await,
                    SessionStates::Relay(mut s) => s.step(self).await,
                }
            };

            let trans = select! {
                _ = cancel.cancelled() => return Err(anyhow!("session cancelled")),
                t = step => t,
            };

            match trans {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(_)) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => return r,
            }
        }
    }
}
