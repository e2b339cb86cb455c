// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{self, Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::BufferPool,
    cfg::config::Config,
    session::{common::StateMachineCtx, socks5_states::SessionCtx},
};

/// Control handle the server keeps per live session: the shared idle flag
/// the sweeper drives and the token that evicts the session task.
#[derive(Debug)]
struct SessionHandle {
    idle: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// The listening endpoint plus everything it supervises: the session set,
/// the shared buffer pool, and the idle sweeper.
///
/// Sessions hold no reference to the server; they know their id and a weak
/// handle installed by `attach_self`, and deregister themselves through it
/// exactly once when their task finishes.
#[derive(Debug)]
pub struct Server {
    cfg: Config,
    listener: TcpListener,
    pool: Arc<BufferPool>,
    sessions: DashMap<u64, SessionHandle>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    self_weak: OnceCell<Weak<Server>>,
}

impl Server {
    /// Binds the listen socket and pre-allocates the relay buffer pool.
    /// Must be called from within the runtime.
    pub fn new(cfg: Config, cancel: CancellationToken) -> Result<Arc<Self>> {
        let addr = SocketAddr::new(
            IpAddr::V4(cfg.server.listen_address),
            cfg.server.listen_port,
        );

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .context("create listen socket")?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("bind {addr}"))?;
        socket
            .listen(cfg.server.backlog as i32)
            .context("listen")?;
        let listener = TcpListener::from_std(socket.into()).context("register listener")?;

        let pool = BufferPool::new(
            2 * cfg.server.max_sessions as usize,
            cfg.runtime.buffer_size,
        );

        Ok(Arc::new(Self {
            cfg,
            listener,
            pool,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel,
            self_weak: OnceCell::new(),
        }))
    }

    /// Must be called once after creating Arc<Server>.
    pub fn attach_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The reactor loop: accepts clients and runs the idle sweeper until
    /// the cancellation token fires. Accepting outranks sweeping.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(addr = %self.local_addr()?, "socks5 server listening");

        let period = self.cfg.runtime.idle_timeout;
        let mut sweep = time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = self.cancel.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    // One bad accept must not stop the server.
                    Err(e) => warn!("accept failed: {e}"),
                },
                _ = sweep.tick() => self.sweep_idle_sessions(),
            }
        }

        info!("socks5 server stopped");
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.sessions.len() >= self.cfg.server.max_sessions as usize {
            warn!(%peer, "session limit reached, dropping client");
            return;
        }
        let Some(weak) = self.self_weak.get().cloned() else {
            warn!(%peer, "server not attached, dropping client");
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {e}");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let idle = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.child_token();
        self.sessions.insert(id, SessionHandle {
            idle: Arc::clone(&idle),
            cancel: cancel.clone(),
        });

        let mut ctx = SessionCtx::new(
            id,
            stream,
            peer,
            Arc::clone(&self.pool),
            self.cfg.dns.server,
            idle,
        );
        tokio::spawn(async move {
            match ctx.execute(&cancel).await {
                Ok(()) => debug!(id, "session closed"),
                Err(e) => debug!(id, "session ended: {e:#}"),
            }
            if let Some(server) = weak.upgrade() {
                server.close_notify(id);
            }
        });
    }

    /// Removes a finished session from the live set. Reached exactly once
    /// per session, from its own task.
    fn close_notify(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// One sweeper tick: evict every session that made no I/O progress
    /// since the previous tick, mark the rest idle for the next one.
    fn sweep_idle_sessions(&self) {
        for entry in self.sessions.iter() {
            if entry.idle.load(Ordering::Relaxed) {
                debug!(id = entry.key(), "evicting idle session");
                entry.cancel.cancel();
            } else {
                entry.idle.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Cancels the reactor loop and every live session, then waits for the
    /// session set to drain.
    pub async fn shutdown(&self, max_wait: Duration) -> Result<()> {
        self.cancel.cancel();

        let deadline = Instant::now() + max_wait;
        loop {
            if self.sessions.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("drain timeout: still {} live sessions", self.sessions.len());
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}
