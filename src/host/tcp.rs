//! Command transport over tokio TCP sockets.
//!
//! Socket work runs on spawned tasks. Everything the provisioner has to see
//! comes back as [`TransportEvent`]s on a channel, so it is handled from the
//! run loop and never from inside a socket task.

use crate::services::command_server::{ConnectionHandle, Transport, TransportEvent};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, warn};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

const READ_BUFFER_LEN: usize = 1024;

enum Outgoing {
    Data(Vec<u8>),
    Close,
}

type Writers = Arc<Mutex<HashMap<ConnectionHandle, mpsc::UnboundedSender<Outgoing>>>>;

pub struct TcpTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    writers: Writers,
    max_connections: Arc<AtomicU8>,
    next_id: Arc<AtomicU64>,
    bind_ip: Ipv4Addr,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            writers: Arc::default(),
            max_connections: Arc::new(AtomicU8::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            acceptor: None,
            local_addr: None,
        }
    }

    pub fn with_bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Address of the listener while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn writer(&self, conn: ConnectionHandle) -> Result<mpsc::UnboundedSender<Outgoing>> {
        lock(&self.writers)
            .get(&conn)
            .cloned()
            .context(format!("unknown connection {conn}"))
    }
}

impl Transport for TcpTransport {
    fn listen(&mut self, port: u16) -> Result<()> {
        if self.acceptor.is_some() {
            bail!("already listening");
        }

        let listener = std::net::TcpListener::bind((self.bind_ip, port))
            .context(format!("failed to bind port {port}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to set listener non-blocking")?;
        let listener = TcpListener::from_std(listener).context("failed to register listener")?;

        self.local_addr = Some(listener.local_addr().context("failed to get local address")?);
        self.acceptor = Some(tokio::spawn(accept(
            listener,
            self.events.clone(),
            self.writers.clone(),
            self.max_connections.clone(),
            self.next_id.clone(),
        )));

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(acceptor) = self.acceptor.take() else {
            bail!("not listening");
        };
        acceptor.abort();
        self.local_addr = None;
        Ok(())
    }

    fn send(&mut self, conn: ConnectionHandle, data: &[u8]) -> Result<()> {
        self.writer(conn)?
            .send(Outgoing::Data(data.to_vec()))
            .map_err(|_| anyhow!("connection {conn} already closed"))
    }

    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()> {
        self.writer(conn)?
            .send(Outgoing::Close)
            .map_err(|_| anyhow!("connection {conn} already closed"))
    }

    fn set_max_connections(&mut self, max: u8) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    fn max_connections(&self) -> u8 {
        self.max_connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

fn lock(writers: &Writers) -> MutexGuard<'_, HashMap<ConnectionHandle, mpsc::UnboundedSender<Outgoing>>> {
    writers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent>,
    writers: Writers,
    max_connections: Arc<AtomicU8>,
    next_id: Arc<AtomicU64>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        let SocketAddr::V4(peer) = addr else {
            debug!("ignoring non ipv4 peer {addr}");
            continue;
        };

        let active = lock(&writers).len();
        if active >= usize::from(max_connections.load(Ordering::Relaxed)) {
            debug!("refusing {peer}: {active} connections active");
            continue;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set nodelay for {peer}: {e}");
        }

        let conn = ConnectionHandle(next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&writers).insert(conn, tx);

        if events.send(TransportEvent::Connected { conn, peer }).is_err() {
            break;
        }

        tokio::spawn(serve(stream, conn, peer, rx, events.clone(), writers.clone()));
    }
}

async fn serve(
    stream: TcpStream,
    conn: ConnectionHandle,
    peer: SocketAddrV4,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
    writers: Writers,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0; READ_BUFFER_LEN];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    if events.send(TransportEvent::Received { conn, peer, data }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("read from {peer} failed: {e}");
                    break;
                }
            },
            message = outgoing.recv() => match message {
                Some(Outgoing::Data(data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        warn!("write to {peer} failed: {e}");
                        let _ = events.send(TransportEvent::Reconnect { conn, peer, code: -1 });
                        break;
                    }
                    let _ = events.send(TransportEvent::Sent { conn, peer });
                }
                Some(Outgoing::Close) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    }

    lock(&writers).remove(&conn);
    let _ = events.send(TransportEvent::Disconnected { conn, peer });
}
