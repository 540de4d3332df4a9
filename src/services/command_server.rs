//! Command server glue over a connection-oriented transport.
//!
//! The server keeps a bounded pool of tracked connections. The transport may
//! report the same peer under a different handle from one callback to the
//! next, so connections are looked up by peer address and their handle is
//! re-bound on every callback. Disconnects and server shutdown are never done
//! from inside a transport callback; they are scheduled as [`ServerTask`]s
//! and run from the timer queue.

use crate::timer::{TimerHandle, TimerService};
use anyhow::Result;
use log::{debug, error, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{fmt, net::SocketAddrV4, time::Duration};
use thiserror::Error;

/// Number of connection slots.
pub const POOL_CAPACITY: usize = 3;
/// Upper bound for one response in bytes.
pub const MAX_RESPONSE_LEN: usize = 255;
/// Delay of deferred disconnects and deferred shutdown.
pub const DEFER_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callbacks of the transport, in the order it reports them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        conn: ConnectionHandle,
        peer: SocketAddrV4,
    },
    Received {
        conn: ConnectionHandle,
        peer: SocketAddrV4,
        data: Vec<u8>,
    },
    Sent {
        conn: ConnectionHandle,
        peer: SocketAddrV4,
    },
    Reconnect {
        conn: ConnectionHandle,
        peer: SocketAddrV4,
        code: i8,
    },
    Disconnected {
        conn: ConnectionHandle,
        peer: SocketAddrV4,
    },
}

/// Raw listener and connection operations.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait Transport {
    fn listen(&mut self, port: u16) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn send(&mut self, conn: ConnectionHandle, data: &[u8]) -> Result<()>;
    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()>;
    fn set_max_connections(&mut self, max: u8);
    fn max_connections(&self) -> u8;
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("command server already started")]
    AlreadyStarted,
    #[error("command server already stopped")]
    AlreadyStopped,
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),
}

/// Deferred server work, queued on the owner's timer service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerTask {
    Disconnect(ConnectionHandle),
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedConnection {
    pub slot: usize,
    pub handle: ConnectionHandle,
    pub peer: SocketAddrV4,
}

#[derive(Debug)]
pub struct CommandServer<T> {
    transport: T,
    pool: [Option<TrackedConnection>; POOL_CAPACITY],
    listening: bool,
    handling: bool,
}

impl<T: Transport> CommandServer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pool: [None; POOL_CAPACITY],
            listening: false,
            handling: false,
        }
    }

    pub fn start(&mut self, port: u16, max_connections: u8) -> Result<(), ServerError> {
        if self.listening {
            return Err(ServerError::AlreadyStarted);
        }

        self.transport.listen(port).map_err(ServerError::Transport)?;
        self.listening = true;
        self.handling = true;
        self.transport.set_max_connections(max_connections);

        info!("command server *:{port} started with max connections {max_connections}");
        Ok(())
    }

    /// Force close all tracked connections and the listener.
    ///
    /// If the listener cannot be closed, request handling and the connection
    /// limit are restored and the server keeps running.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if !self.listening {
            return Err(ServerError::AlreadyStopped);
        }

        let handling = self.handling;
        let max_connections = self.transport.max_connections();
        self.handling = false;
        self.transport.set_max_connections(0);

        for tracked in self.pool.iter_mut().filter_map(Option::take) {
            match self.transport.disconnect(tracked.handle) {
                Ok(()) => debug!("force close {} ok", tracked.peer),
                Err(e) => error!("failed to close {}: {e:#}", tracked.peer),
            }
        }

        match self.transport.close() {
            Ok(()) => {
                self.listening = false;
                info!("command server stopped");
                Ok(())
            }
            Err(e) => {
                error!("failed to stop command server: {e:#}");
                self.handling = handling;
                self.transport.set_max_connections(max_connections);
                Err(ServerError::Transport(e))
            }
        }
    }

    /// Stop the server from the timer queue instead of the current call.
    pub fn schedule_stop<Q: From<ServerTask>>(
        &self,
        timers: &mut TimerService<Q>,
    ) -> Result<TimerHandle, ServerError> {
        if !self.listening {
            return Err(ServerError::AlreadyStopped);
        }
        Ok(timers.schedule(DEFER_DELAY, ServerTask::Stop.into()))
    }

    pub fn on_connected<Q: From<ServerTask>>(
        &mut self,
        timers: &mut TimerService<Q>,
        conn: ConnectionHandle,
        peer: SocketAddrV4,
    ) {
        debug!("connected: {peer} {conn}");

        let Some(slot) = self.pool.iter().position(Option::is_none) else {
            error!("connection limit reached, dropping {peer}");
            Self::schedule_disconnect(timers, conn);
            return;
        };

        self.pool[slot] = Some(TrackedConnection {
            slot,
            handle: conn,
            peer,
        });
    }

    /// Look up a tracked connection by peer and re-bind its handle.
    pub fn resolve(&mut self, conn: ConnectionHandle, peer: SocketAddrV4) -> Option<TrackedConnection> {
        let found = self.pool.iter_mut().flatten().find(|t| t.peer == peer);

        match found {
            Some(tracked) => {
                tracked.handle = conn;
                Some(*tracked)
            }
            None => {
                error!("unknown connection: {peer}");
                None
            }
        }
    }

    /// Send `response` on `conn` if there is one, then schedule its disconnect.
    pub fn respond<Q: From<ServerTask>>(
        &mut self,
        timers: &mut TimerService<Q>,
        conn: ConnectionHandle,
        response: Option<&[u8]>,
    ) {
        match response {
            Some(bytes) if bytes.len() > MAX_RESPONSE_LEN => {
                error!("response of {} bytes exceeds {MAX_RESPONSE_LEN}", bytes.len())
            }
            Some(bytes) if !bytes.is_empty() => {
                if let Err(e) = self.transport.send(conn, bytes) {
                    error!("sending response failed: {e:#}");
                }
            }
            _ => {}
        }

        Self::schedule_disconnect(timers, conn);
    }

    pub fn on_sent(&mut self, conn: ConnectionHandle, peer: SocketAddrV4) {
        debug!("sent: {peer}");
        self.resolve(conn, peer);
    }

    pub fn on_reconnect(&mut self, conn: ConnectionHandle, peer: SocketAddrV4, code: i8) {
        warn!("connection {peer} broke ({code})");
        self.resolve(conn, peer);
    }

    pub fn on_disconnected(&mut self, conn: ConnectionHandle, peer: SocketAddrV4) {
        debug!("disconnected: {peer}");
        if let Some(tracked) = self.resolve(conn, peer) {
            self.pool[tracked.slot] = None;
        }
    }

    /// Run a task popped from the timer queue.
    pub fn run(&mut self, task: ServerTask) -> Result<(), ServerError> {
        match task {
            ServerTask::Disconnect(conn) => {
                if let Err(e) = self.transport.disconnect(conn) {
                    error!("disconnecting {conn} failed: {e:#}");
                }
                Ok(())
            }
            ServerTask::Stop => self.stop(),
        }
    }

    /// Whether received requests are passed on for handling.
    pub fn is_handling(&self) -> bool {
        self.handling
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn connections(&self) -> impl Iterator<Item = &TrackedConnection> {
        self.pool.iter().flatten()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn schedule_disconnect<Q: From<ServerTask>>(timers: &mut TimerService<Q>, conn: ConnectionHandle) {
        timers.schedule(DEFER_DELAY, ServerTask::Disconnect(conn).into());
    }
}
