//! The connection multiplexer.
//!
//! Two listener sets (SMTP and POP3) feed accepted sockets into one
//! generic session driver.  Both engines present the same capability:
//! a one-shot greeting plus `process(chunk) -> (bytes out, close?)`, so
//! the driver neither knows nor cares which protocol it is moving.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::Config;
use crate::pop3::Pop3Engine;
use crate::registry::{Registry, SessionGuard, SessionKind};
use crate::smtp::SmtpEngine;
use crate::store::Store;

/// Read buffer per session, sized to a typical TCP payload.
const RECV_BUFFER: usize = 1460;

/// Listen backlog for both protocols.
const BACKLOG: u32 = 1024;

/// What an engine wants done after digesting one chunk.
pub struct Reaction {
    /// Bytes to put on the wire, possibly empty.
    pub output: Vec<u8>,
    /// True when the session is over and the socket should close.
    pub close: bool,
}

/// The capability both protocol engines expose to the multiplexer.
pub trait Engine: Send {
    /// The banner sent once, immediately after accept.
    fn greeting(&self) -> Vec<u8>;

    /// How long the session may sit idle before it is dropped.
    fn idle_timeout(&self) -> Duration;

    /// Digest one chunk of received bytes.
    ///
    /// Must not block on anything but the store; the driver owns all
    /// socket I/O.
    fn process(&mut self, chunk: &[u8]) -> Reaction;
}

pub struct Server {
    smtp: Vec<TcpListener>,
    pop3: Vec<TcpListener>,
    store: Arc<Store>,
    hostname: String,
    registry: Arc<Registry>,
}

impl Server {
    /// Bind both protocols on loopback.
    ///
    /// The service is local-only, so only 127.0.0.1 and ::1 are tried;
    /// a protocol that binds on neither is a startup failure.
    pub async fn bind(config: &Config, store: Arc<Store>) -> Result<Server> {
        let smtp = bind_loopback(config.smtp_port)
            .await
            .context("failed to open SMTP socket")?;
        let pop3 = bind_loopback(config.pop3_port)
            .await
            .context("failed to open POP3 socket")?;

        Ok(Server {
            smtp,
            pop3,
            store,
            hostname: config.hostname.clone(),
            registry: Registry::new(),
        })
    }

    /// The addresses the SMTP listeners actually bound, useful when the
    /// configured port was 0.
    pub fn smtp_addrs(&self) -> Vec<SocketAddr> {
        self.smtp.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    pub fn pop3_addrs(&self) -> Vec<SocketAddr> {
        self.pop3.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Shutdown is abrupt: accepting stops, the listeners close, and
    /// every live session is dropped without a parting reply.
    /// Uncommitted SMTP uploads and unQUIT POP3 deletes are discarded
    /// with them.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        // Sessions hold clones of this sender; when the last one drops,
        // the receiver unblocks and the drain below completes.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let mut acceptors = JoinSet::new();

        for listener in self.smtp {
            let store = self.store.clone();
            let hostname = self.hostname.clone();
            acceptors.spawn(accept_loop(
                listener,
                SessionKind::Smtp,
                move || SmtpEngine::new(store.clone(), hostname.clone()),
                self.registry.clone(),
                stop_rx.clone(),
                done_tx.clone(),
            ));
        }

        for listener in self.pop3 {
            let store = self.store.clone();
            let hostname = self.hostname.clone();
            acceptors.spawn(accept_loop(
                listener,
                SessionKind::Pop3,
                move || Pop3Engine::new(store.clone(), hostname.clone()),
                self.registry.clone(),
                stop_rx.clone(),
                done_tx.clone(),
            ));
        }

        drop(done_tx);

        shutdown.await;
        info!("shutting down");
        let _ = stop_tx.send(true);

        while acceptors.join_next().await.is_some() {}
        let _ = done_rx.recv().await;
        info!("all sessions closed");

        Ok(())
    }
}

/// Bind one port on the loopback addresses that are available.
async fn bind_loopback(port: u16) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::new();

    let addrs = [
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    ];

    for addr in addrs {
        match listen_on(addr) {
            Ok(listener) => {
                if let Ok(local) = listener.local_addr() {
                    info!("bound to {}", local);
                }
                listeners.push(listener);
            }
            Err(err) => warn!("failed to bind {}: {:#}", addr, err),
        }
    }

    if listeners.is_empty() {
        return Err(anyhow!("no loopback address accepted port {}", port));
    }

    Ok(listeners)
}

fn listen_on(addr: SocketAddr) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(BACKLOG)?)
}

/// Accept sessions of one kind until the stop signal flips.
async fn accept_loop<E, F>(
    listener: TcpListener,
    kind: SessionKind,
    make_engine: F,
    registry: Arc<Registry>,
    mut stop: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) where
    E: Engine + 'static,
    F: Fn() -> E + Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let guard = registry.register(kind);
                info!(
                    "received {} connection from {} as session {} ({} live)",
                    kind,
                    peer,
                    guard.id(),
                    registry.len()
                );

                let engine = make_engine();
                let stop = stop.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    // Holding the sender keeps the server's drain alive
                    // until this session is gone.
                    let _done = done;
                    drive(stream, engine, guard, stop).await;
                });
            }
            Err(err) => error!("{} accept failed: {}", kind, err),
        }
    }
}

/// Move one session to completion.
async fn drive<E: Engine>(
    mut stream: TcpStream,
    mut engine: E,
    guard: SessionGuard,
    mut stop: watch::Receiver<bool>,
) {
    let kind = guard.kind();
    let id = guard.id();

    if let Err(err) = stream.write_all(&engine.greeting()).await {
        warn!("{} session {}: failed to send greeting: {}", kind, id, err);
        return;
    }

    let mut buf = [0u8; RECV_BUFFER];

    loop {
        let read = tokio::select! {
            _ = stop.changed() => {
                debug!("{} session {} dropped on shutdown", kind, id);
                return;
            }
            read = timeout(engine.idle_timeout(), stream.read(&mut buf)) => read,
        };

        let n = match read {
            Err(_) => {
                info!("{} session {} timed out", kind, id);
                return;
            }
            Ok(Ok(0)) => {
                info!("{} session {} hung up", kind, id);
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!("{} session {} read failed: {}", kind, id, err);
                return;
            }
        };

        let reaction = engine.process(&buf[..n]);

        if !reaction.output.is_empty() {
            if let Err(err) = stream.write_all(&reaction.output).await {
                warn!("{} session {} write failed: {}", kind, id, err);
                return;
            }
        }

        if reaction.close {
            info!("{} session {} disconnected", kind, id);
            return;
        }
    }
}
